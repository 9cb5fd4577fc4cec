use base64::Engine;
use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use rand::RngCore;
use sha2::{Digest, Sha256};

pub const KEY_PREFIX: &str = "gnd_";
const KEY_RANDOM_BYTES: usize = 32;
const DISPLAY_PREFIX_LEN: usize = 12;

/// A freshly minted API key. The plaintext leaves the process exactly once,
/// in the create-key response; only the hash is persisted.
#[derive(Debug, Clone)]
pub struct MintedKey {
    pub plaintext: String,
    pub hash: String,
    pub display_prefix: String,
}

pub fn mint_key() -> MintedKey {
    let mut raw = [0u8; KEY_RANDOM_BYTES];
    rand::rng().fill_bytes(&mut raw);
    let plaintext = format!("{KEY_PREFIX}{}", URL_SAFE_NO_PAD.encode(raw));
    let hash = hash_key(&plaintext);
    let display_prefix = plaintext[..DISPLAY_PREFIX_LEN].to_string();
    MintedKey {
        plaintext,
        hash,
        display_prefix,
    }
}

/// Lowercase SHA-256 hex of the raw token; the only persisted form.
pub fn hash_key(plaintext: &str) -> String {
    hex::encode(Sha256::digest(plaintext.as_bytes()))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn minted_key_shape() {
        let key = mint_key();
        assert!(key.plaintext.starts_with(KEY_PREFIX));
        assert_eq!(key.display_prefix.len(), DISPLAY_PREFIX_LEN);
        assert!(key.plaintext.starts_with(&key.display_prefix));
        assert_eq!(key.hash.len(), 64);
        assert_eq!(key.hash, hash_key(&key.plaintext));
    }

    #[test]
    fn distinct_keys_distinct_hashes() {
        assert_ne!(mint_key().hash, mint_key().hash);
    }

    #[test]
    fn hash_is_stable_hex() {
        let hash = hash_key("gnd_test");
        assert_eq!(hash, hash_key("gnd_test"));
        assert!(hash.bytes().all(|b| b.is_ascii_hexdigit()));
    }
}
