//! Accelerator backend slot
//!
//! Holds the probe position ahead of the CPU backends. This build ships no
//! device kernels, so the probe always declines and the chain falls through
//! to the native CPU backend.

/// Accelerator backend, probed first when the `gpu` feature is enabled
#[derive(Debug, Clone, Copy)]
pub struct GpuTensorOperations;

impl GpuTensorOperations {
    /// Returns the backend when a usable device is present.
    ///
    /// No device enumeration exists in this build; the probe always
    /// declines.
    #[must_use]
    pub fn probe() -> Option<Self> {
        tracing::debug!("no accelerator kernels in this build");
        None
    }
}
