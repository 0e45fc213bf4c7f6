//! Libvirt hypervisor client.
//!
//! Talks to libvirtd through the C API instead of `virsh`. Requires the
//! `libvirt` feature to be enabled and the system to have libvirt installed.

#[cfg(feature = "libvirt")]
mod backend;

#[cfg(feature = "libvirt")]
pub use backend::LibvirtClient;

/// Check if libvirt backend is compiled in.
pub fn is_available() -> bool {
    cfg!(feature = "libvirt")
}
