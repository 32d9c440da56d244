//! Display drivers
//!
//! Buffer objects and the KMS pipeline built on top of them.

pub mod blit;
pub mod cursor;
pub mod display_pipe;
pub mod drm;
pub mod flip;
pub mod gem;
pub mod output;
pub mod scanout;
pub mod vkms;
