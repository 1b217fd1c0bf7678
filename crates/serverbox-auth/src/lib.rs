pub mod error;
pub mod normalizer;

pub use error::AuthError;
pub use normalizer::{build_auth_record, collect_provider_env, normalize_provider_auth};
