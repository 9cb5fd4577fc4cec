use serde::{Deserialize, Serialize};

/// Bitmask over the gateway permission set.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Permissions(pub u16);

impl Permissions {
    pub const USE_MODELS: Permissions = Permissions(1 << 0);
    pub const MANAGE_OWN_KEYS: Permissions = Permissions(1 << 1);
    pub const VIEW_OWN_USAGE: Permissions = Permissions(1 << 2);
    pub const VIEW_ALL_USAGE: Permissions = Permissions(1 << 3);
    pub const MANAGE_ALL_KEYS: Permissions = Permissions(1 << 4);
    pub const MANAGE_PROVIDERS: Permissions = Permissions(1 << 5);
    pub const MANAGE_ROUTES: Permissions = Permissions(1 << 6);
    pub const MANAGE_ORGS: Permissions = Permissions(1 << 7);

    pub const fn empty() -> Permissions {
        Permissions(0)
    }

    pub const fn union(self, other: Permissions) -> Permissions {
        Permissions(self.0 | other.0)
    }

    pub const fn contains(self, other: Permissions) -> bool {
        self.0 & other.0 == other.0
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    Admin,
    Member,
    Viewer,
}

impl Role {
    /// Static role → permission table.
    pub fn permissions(self) -> Permissions {
        match self {
            Role::Admin => Permissions::USE_MODELS
                .union(Permissions::MANAGE_OWN_KEYS)
                .union(Permissions::VIEW_OWN_USAGE)
                .union(Permissions::VIEW_ALL_USAGE)
                .union(Permissions::MANAGE_ALL_KEYS)
                .union(Permissions::MANAGE_PROVIDERS)
                .union(Permissions::MANAGE_ROUTES)
                .union(Permissions::MANAGE_ORGS),
            Role::Member => Permissions::USE_MODELS
                .union(Permissions::MANAGE_OWN_KEYS)
                .union(Permissions::VIEW_OWN_USAGE),
            Role::Viewer => Permissions::VIEW_OWN_USAGE,
        }
    }
}

impl Default for Role {
    fn default() -> Self {
        Role::Member
    }
}

/// Optional per-scope limit overrides (key, team, or org level).
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
pub struct LimitOverrides {
    pub rpm: Option<u32>,
    pub tpm: Option<u32>,
    pub max_budget: Option<f64>,
}

/// Fully resolved per-identity limits.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct EffectiveLimits {
    pub rpm: u32,
    pub tpm: u32,
    pub max_budget: Option<f64>,
}

impl EffectiveLimits {
    /// Bottom-up resolution: key → team → org → global default; the first
    /// non-null value wins per field.
    pub fn resolve(
        key: LimitOverrides,
        team: LimitOverrides,
        org: LimitOverrides,
        default_rpm: u32,
        default_tpm: u32,
    ) -> Self {
        Self {
            rpm: key.rpm.or(team.rpm).or(org.rpm).unwrap_or(default_rpm),
            tpm: key.tpm.or(team.tpm).or(org.tpm).unwrap_or(default_tpm),
            max_budget: key.max_budget.or(team.max_budget).or(org.max_budget),
        }
    }
}

/// Caller identity built by the authenticator, attached to request metadata
/// and read-only for the rest of the request.
#[derive(Debug, Clone)]
pub struct Identity {
    pub subject: String,
    pub key_id: i64,
    pub org_id: Option<i64>,
    pub team_id: Option<i64>,
    pub user_id: Option<i64>,
    pub role: Role,
    pub permissions: Permissions,
    pub limits: EffectiveLimits,
    /// `None` means all routed models are allowed.
    pub allowed_models: Option<Vec<String>>,
}

impl Identity {
    pub fn allows_model(&self, model: &str) -> bool {
        match &self.allowed_models {
            Some(models) => models.iter().any(|m| m == model),
            None => true,
        }
    }

    pub fn can(&self, permission: Permissions) -> bool {
        self.permissions.contains(permission)
    }
}
