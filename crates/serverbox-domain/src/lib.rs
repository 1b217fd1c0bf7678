pub mod types;

pub use types::{
    InstanceId, InstanceRecord, InstanceState, LifecycleIntervals, ProviderAuthEntry,
    ResourceSpec,
};
