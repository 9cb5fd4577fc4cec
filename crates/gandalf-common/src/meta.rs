use std::sync::OnceLock;

use uuid::Uuid;

use crate::identity::Identity;

const MAX_REQUEST_ID_LEN: usize = 128;

/// Per-request metadata, created by the request-id middleware and shared as
/// `Arc<RequestMeta>` through request extensions. Later layers mutate this
/// object in place instead of re-wrapping the request.
#[derive(Debug)]
pub struct RequestMeta {
    request_id: String,
    identity: OnceLock<Identity>,
}

impl RequestMeta {
    /// Accept a syntactically valid inbound id, otherwise mint a UUIDv7.
    pub fn new(inbound_id: Option<&str>) -> Self {
        let request_id = match inbound_id {
            Some(id) if acceptable_request_id(id) => id.to_string(),
            _ => Uuid::now_v7().to_string(),
        };
        Self {
            request_id,
            identity: OnceLock::new(),
        }
    }

    pub fn request_id(&self) -> &str {
        &self.request_id
    }

    /// Written exactly once, by the authenticate layer.
    pub fn set_identity(&self, identity: Identity) {
        let _ = self.identity.set(identity);
    }

    pub fn identity(&self) -> Option<&Identity> {
        self.identity.get()
    }
}

fn acceptable_request_id(id: &str) -> bool {
    !id.is_empty()
        && id.len() <= MAX_REQUEST_ID_LEN
        && id.bytes().all(|b| (0x21..=0x7e).contains(&b))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn inbound_id_kept_when_acceptable() {
        let meta = RequestMeta::new(Some("req-abc-123"));
        assert_eq!(meta.request_id(), "req-abc-123");
    }

    #[test]
    fn bad_inbound_id_replaced_with_uuid() {
        for bad in ["", "has space", "ctrl\x01char", &"x".repeat(129)] {
            let meta = RequestMeta::new(Some(bad));
            assert_ne!(meta.request_id(), bad);
            assert!(Uuid::parse_str(meta.request_id()).is_ok());
        }
    }

    #[test]
    fn identity_set_once() {
        let meta = RequestMeta::new(None);
        assert!(meta.identity().is_none());
        let id = Identity {
            subject: "key:1".to_string(),
            key_id: 1,
            org_id: None,
            team_id: None,
            user_id: None,
            role: crate::Role::Member,
            permissions: crate::Role::Member.permissions(),
            limits: crate::EffectiveLimits {
                rpm: 1,
                tpm: 1,
                max_budget: None,
            },
            allowed_models: None,
        };
        meta.set_identity(id.clone());
        let mut second = id;
        second.key_id = 2;
        meta.set_identity(second);
        assert_eq!(meta.identity().unwrap().key_id, 1);
    }
}
