pub mod apikey;
pub mod error;
pub mod identity;
pub mod meta;

pub use apikey::{MintedKey, hash_key, mint_key};
pub use error::{Error, ErrorKind, Result, TransportKind};
pub use identity::{EffectiveLimits, Identity, LimitOverrides, Permissions, Role};
pub use meta::RequestMeta;
