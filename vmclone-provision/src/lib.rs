//! # vmclone provision
//!
//! Clones a base disk image into a new, uniquely named virtual machine and
//! starts it through the hypervisor manager.
//!
//! ## Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────┐
//! │            ProvisioningWorkflow             │
//! │  (name, clone, mount, identity, descriptor, │
//! │   start; reverse-order rollback)            │
//! └──────┬──────────────┬───────────────┬───────┘
//!        ▼              ▼               ▼
//! ┌─────────────┐ ┌────────────┐ ┌──────────────────┐
//! │ Storage     │ │ Identity / │ │ HypervisorClient │
//! │ (kpartx,    │ │ Descriptor │ │ (virsh, libvirt, │
//! │  mount, cp) │ │ rewriting  │ │  mock)           │
//! └─────────────┘ └────────────┘ └──────────────────┘
//! ```
//!
//! ## Usage
//!
//! ```rust,ignore
//! use std::sync::Arc;
//! use vmclone_provision::{
//!     InstanceSpec, MockDeviceMapper, MockHypervisor, MockMounter, PrivilegedContext,
//!     ProvisioningWorkflow,
//! };
//!
//! #[tokio::main]
//! async fn main() {
//!     let workflow = ProvisioningWorkflow::new(
//!         Arc::new(MockHypervisor::with_instances(["web0", "web1"])),
//!         Arc::new(MockDeviceMapper::new()),
//!         Arc::new(MockMounter::new()),
//!     );
//!
//!     let spec = InstanceSpec::new("web", "/srv/base.xml", "/srv/base.img", "/mnt/vm");
//!     let ctx = PrivilegedContext::unprivileged();
//!     let outcome = workflow.run(&ctx, &spec).await.unwrap();
//!     assert_eq!(outcome.identity.name, "web2");
//! }
//! ```

pub mod descriptor;
pub mod error;
pub mod identity;
pub mod libvirt;
pub mod mock;
pub mod privilege;
pub mod storage;
pub mod traits;
pub mod types;
pub mod virsh;
pub mod workflow;

pub use descriptor::{DomainDescriptor, DomainDescriptorEditor};
pub use error::{ProvisionError, Result, WorkflowError};
pub use identity::IdentityRewriter;
pub use mock::{MockDeviceMapper, MockHypervisor, MockJournal, MockMounter};
pub use privilege::{Escalation, PrivilegedContext};
pub use storage::{
    remove_clone,
    ActiveMount,
    BlockDeviceMapper,
    CommandMounter,
    DiskCloner,
    FilesystemMounter,
    KpartxMapper,
    MappedDevice,
};
pub use traits::HypervisorClient;
pub use types::*;
pub use virsh::{VirshClient, DEFAULT_LIBVIRT_URI};
pub use workflow::{ProvisionOutcome, ProvisioningWorkflow};

// Re-export libvirt client when available
#[cfg(feature = "libvirt")]
pub use libvirt::LibvirtClient;
