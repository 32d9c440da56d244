//! Scanout core for KMS display drivers
//!
//! Manages GEM buffer objects, per-CRTC scanout buffers and the switch
//! between shared-buffer (blit) and per-CRTC (flip) scanout, on top of any
//! [`DrmDevice`](drivers::drm::DrmDevice) implementation.

#![cfg_attr(not(test), no_std)]

extern crate alloc;

pub mod config;
pub mod drivers;
pub mod util;

#[cfg(test)]
mod tests;

pub use config::{ConfigError, KmsConfig};
pub use drivers::display_pipe::{Crtc, DisplayMode, Rect, Rotation};
pub use drivers::drm::DrmDevice;
pub use drivers::flip::{ModeSwitchEngine, Notification, ScanoutMode};
pub use drivers::gem::{Bo, BoBackendKind, BoDevice, BoRequest, CpuAccess, CpuFence};
pub use drivers::vkms::VirtualDrm;
pub use util::{DrmError, KResult, KmsError};
