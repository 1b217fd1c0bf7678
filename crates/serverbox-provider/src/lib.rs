pub mod adapter;
pub mod bootstrap;
pub mod daytona;
pub mod error;
pub mod health;
pub mod local;

pub use adapter::{
    ExecOptions, ExecOutput, PreviewLink, ProviderAdapter, Sandbox, SandboxSpec, SandboxState,
};
pub use bootstrap::{BootstrapConfig, BootstrapDriver, DefaultBootstrapDriver};
pub use daytona::{DaytonaConfig, DaytonaProviderAdapter};
pub use error::ProviderError;
pub use health::{check_health_once, wait_for_health, HealthCreds};
pub use local::LocalProviderAdapter;
