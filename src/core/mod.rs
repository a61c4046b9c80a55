pub mod allocator;
pub mod catalog;
pub mod client;
pub mod lifecycle;
pub mod payload;
pub mod provision;
pub mod validator;
pub mod vm;

// exports for lazy devs like us
pub use allocator::{AllocationPolicy, IdAllocator};
pub use catalog::{CatalogFetcher, ResourceCatalog};
pub use client::{ClusterApi, ProxmoxClient};
pub use lifecycle::{InstanceKind, InstanceLifecycle};
pub use payload::{DiskDescriptor, PayloadEncoder};
pub use provision::Provisioner;
pub use validator::SpecValidator;
pub use vm::{ContainerSpec, ProvisionOutcome, ProvisioningResult, VmSpec};
