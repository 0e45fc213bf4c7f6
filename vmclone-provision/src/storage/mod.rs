//! Storage side of provisioning: cloning images, mapping their partitions
//! and mounting the guest root filesystem.
//!
//! ## Resource ordering
//!
//! ```text
//! DiskCloner::clone ──► BlockDeviceMapper::map ──► FilesystemMounter::mount
//!                                                          │
//!        BlockDeviceMapper::unmap ◄── FilesystemMounter::unmount
//! ```
//!
//! A device must be unmounted before it is unmapped. The workflow owns that
//! ordering; the components only reject double acquisition and double
//! release.

mod clone;
mod kpartx;
mod mount;
pub mod parse;
mod traits;
mod types;

pub use clone::{remove_clone, DiskCloner};
pub use kpartx::KpartxMapper;
pub use mount::CommandMounter;
pub use traits::{BlockDeviceMapper, FilesystemMounter};
pub use types::{ActiveMount, MappedDevice};

pub(crate) use kpartx::require_regular_file;
pub(crate) use mount::require_directory;
