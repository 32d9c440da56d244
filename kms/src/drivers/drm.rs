//! Direct Rendering Manager (DRM) / Kernel Mode Setting (KMS) device contract
//!
//! The handful of device operations the scanout core depends on:
//! - Resource enumeration (CRTCs, connectors, encoders, planes, properties)
//! - Dumb buffer create/destroy/map and vendor CPU-access ioctls
//! - Framebuffer add/remove
//! - CRTC, plane and gamma programming
//! - Page flips and their completion events

use alloc::string::String;
use alloc::vec::Vec;
use core::ptr::NonNull;

use super::display_pipe::{DisplayMode, ModeFlags, ModeType};
use crate::util::DrmError;

/// GEM object handle
pub type GemHandle = u32;

/// Framebuffer object id
pub type FbId = u32;

/// Length of the mode name field in `drm_mode_modeinfo`.
pub const DRM_DISPLAY_MODE_LEN: usize = 32;

/// Result of a CREATE_DUMB call.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DumbBuffer {
    pub handle: GemHandle,
    pub width: u32,
    pub height: u32,
    pub bpp: u32,
    /// Bytes per scanline, may be larger than width * bpp / 8
    pub pitch: u32,
    /// Total buffer size in bytes
    pub size: u64,
}

/// A CPU mapping of device memory.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Mapping {
    pub ptr: NonNull<u8>,
    pub len: usize,
}

// The mapping is plain device memory; access is serialized by the owning
// buffer object's CPU fence.
unsafe impl Send for Mapping {}
unsafe impl Sync for Mapping {}

/// Arguments of ADDFB.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FbRequest {
    pub width: u32,
    pub height: u32,
    pub depth: u32,
    pub bpp: u32,
    pub pitch: u32,
    pub handle: GemHandle,
}

/// Kernel-ABI mode description (`struct drm_mode_modeinfo`).
#[repr(C)]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DrmModeInfo {
    pub clock: u32,
    pub hdisplay: u16,
    pub hsync_start: u16,
    pub hsync_end: u16,
    pub htotal: u16,
    pub hskew: u16,
    pub vdisplay: u16,
    pub vsync_start: u16,
    pub vsync_end: u16,
    pub vtotal: u16,
    pub vscan: u16,
    pub vrefresh: u32,
    pub flags: u32,
    pub type_: u32,
    pub name: [u8; DRM_DISPLAY_MODE_LEN],
}

impl DrmModeInfo {
    /// Mode name up to the first NUL.
    pub fn name(&self) -> &str {
        let len = self.name.iter().position(|&b| b == 0).unwrap_or(DRM_DISPLAY_MODE_LEN);
        core::str::from_utf8(&self.name[..len]).unwrap_or("")
    }

    pub fn to_display_mode(&self) -> DisplayMode {
        DisplayMode {
            name: String::from(self.name()),
            clock: self.clock,
            hdisplay: self.hdisplay,
            hsync_start: self.hsync_start,
            hsync_end: self.hsync_end,
            htotal: self.htotal,
            hskew: self.hskew,
            vdisplay: self.vdisplay,
            vsync_start: self.vsync_start,
            vsync_end: self.vsync_end,
            vtotal: self.vtotal,
            vscan: self.vscan,
            vrefresh: self.vrefresh,
            flags: ModeFlags::from_bits_retain(self.flags),
            mode_type: ModeType::from_bits_retain(self.type_),
        }
    }
}

impl From<&DisplayMode> for DrmModeInfo {
    fn from(mode: &DisplayMode) -> Self {
        // Always NUL terminated, long names are truncated.
        let mut name = [0u8; DRM_DISPLAY_MODE_LEN];
        let bytes = mode.name.as_bytes();
        let n = bytes.len().min(DRM_DISPLAY_MODE_LEN - 1);
        name[..n].copy_from_slice(&bytes[..n]);

        Self {
            clock: mode.clock,
            hdisplay: mode.hdisplay,
            hsync_start: mode.hsync_start,
            hsync_end: mode.hsync_end,
            htotal: mode.htotal,
            hskew: mode.hskew,
            vdisplay: mode.vdisplay,
            vsync_start: mode.vsync_start,
            vsync_end: mode.vsync_end,
            vtotal: mode.vtotal,
            vscan: mode.vscan,
            vrefresh: mode.vrefresh,
            flags: mode.flags.bits(),
            type_: mode.mode_type.bits(),
            name,
        }
    }
}

/// Mode resources
#[derive(Debug, Clone, Default)]
pub struct ModeResources {
    pub crtcs: Vec<u32>,
    pub connectors: Vec<u32>,
    pub encoders: Vec<u32>,
    pub min_width: u32,
    pub max_width: u32,
    pub min_height: u32,
    pub max_height: u32,
}

/// Connection status
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionStatus {
    Connected,
    Disconnected,
    Unknown,
}

#[derive(Debug, Clone)]
pub struct ConnectorInfo {
    pub id: u32,
    pub connector_type: u32,
    pub connector_type_id: u32,
    pub connection: ConnectionStatus,
    pub encoders: Vec<u32>,
    pub modes: Vec<DrmModeInfo>,
    pub mm_width: u32,
    pub mm_height: u32,
    /// (property id, current value)
    pub props: Vec<(u32, u64)>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct EncoderInfo {
    pub id: u32,
    pub crtc_id: Option<u32>,
    pub possible_crtcs: u32,
    pub possible_clones: u32,
}

#[derive(Debug, Clone)]
pub struct CrtcInfo {
    pub id: u32,
    pub fb_id: Option<FbId>,
    pub x: u32,
    pub y: u32,
    pub mode: Option<DrmModeInfo>,
    pub gamma_size: u32,
}

#[derive(Debug, Clone)]
pub struct PlaneInfo {
    pub id: u32,
    /// Bitmask over CRTC indices
    pub possible_crtcs: u32,
    pub formats: Vec<u32>,
}

bitflags::bitflags! {
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct PropertyFlags: u32 {
        const PENDING = 1 << 0;
        const RANGE = 1 << 1;
        const IMMUTABLE = 1 << 2;
        const ENUM = 1 << 3;
        const BLOB = 1 << 4;
        const BITMASK = 1 << 5;
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PropertyEnum {
    pub name: String,
    pub value: u64,
}

#[derive(Debug, Clone)]
pub struct PropertyInfo {
    pub id: u32,
    pub name: String,
    pub flags: PropertyFlags,
    /// Range properties: [min, max]
    pub values: Vec<u64>,
    pub enums: Vec<PropertyEnum>,
}

/// Source and destination of a plane update. Source is 16.16 fixed point.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct PlaneConfig {
    pub crtc_x: i32,
    pub crtc_y: i32,
    pub crtc_w: u32,
    pub crtc_h: u32,
    pub src_x: u32,
    pub src_y: u32,
    pub src_w: u32,
    pub src_h: u32,
}

/// Page flip completion event
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PageFlipEvent {
    pub crtc_id: u32,
    pub sequence: u64,
    pub user_data: u64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DrmEvent {
    PageFlip(PageFlipEvent),
    Vblank { crtc_id: u32, sequence: u64 },
}

/// Operations the scanout core needs from a KMS device.
///
/// Every call is synchronous. The exact ioctl encoding is the implementor's
/// concern; this trait only fixes the semantics.
pub trait DrmDevice: Send + Sync {
    /// Kernel driver name, used to pick a buffer backend.
    fn driver_name(&self) -> String;

    fn get_resources(&self) -> Result<ModeResources, DrmError>;
    fn get_connector(&self, connector_id: u32) -> Result<ConnectorInfo, DrmError>;
    fn get_encoder(&self, encoder_id: u32) -> Result<EncoderInfo, DrmError>;
    fn get_crtc(&self, crtc_id: u32) -> Result<CrtcInfo, DrmError>;
    fn get_plane_resources(&self) -> Result<Vec<PlaneInfo>, DrmError>;
    fn get_property(&self, prop_id: u32) -> Result<PropertyInfo, DrmError>;
    fn get_property_blob(&self, blob_id: u32) -> Result<Vec<u8>, DrmError>;
    fn set_connector_property(&self, connector_id: u32, prop_id: u32, value: u64) -> Result<(), DrmError>;

    fn create_dumb(&self, width: u32, height: u32, bpp: u32, flags: u32) -> Result<DumbBuffer, DrmError>;
    fn destroy_dumb(&self, handle: GemHandle) -> Result<(), DrmError>;
    fn map_dumb(&self, handle: GemHandle, size: usize) -> Result<Mapping, DrmError>;
    fn unmap(&self, mapping: Mapping);
    fn gem_flink(&self, handle: GemHandle) -> Result<u32, DrmError>;

    /// Driver-private command `nr` (offset from DRM_COMMAND_BASE) with
    /// a flat u32 argument block.
    fn driver_ioctl(&self, nr: u32, args: &mut [u32]) -> Result<(), DrmError>;

    fn add_fb(&self, fb: &FbRequest) -> Result<FbId, DrmError>;
    fn rm_fb(&self, fb_id: FbId) -> Result<(), DrmError>;

    /// `fb_id` None with no connectors and no mode turns the CRTC off.
    fn set_crtc(
        &self,
        crtc_id: u32,
        fb_id: Option<FbId>,
        x: u32,
        y: u32,
        connectors: &[u32],
        mode: Option<&DrmModeInfo>,
    ) -> Result<(), DrmError>;

    /// `fb_id` None disables the plane.
    fn set_plane(&self, plane_id: u32, crtc_id: u32, fb_id: Option<FbId>, config: &PlaneConfig) -> Result<(), DrmError>;

    fn set_gamma(&self, crtc_id: u32, red: &[u16], green: &[u16], blue: &[u16]) -> Result<(), DrmError>;

    /// Queues an asynchronous flip; completion arrives as a
    /// [`DrmEvent::PageFlip`] carrying `user_data`.
    fn page_flip(&self, crtc_id: u32, fb_id: FbId, user_data: u64) -> Result<(), DrmError>;

    /// Blocks until events are available and returns them. An empty vector
    /// means the wait ended without events.
    fn read_events(&self) -> Result<Vec<DrmEvent>, DrmError>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_modeinfo_round_trip() {
        let mode = DisplayMode::new(1920, 1080, 60);
        let kmode = DrmModeInfo::from(&mode);
        assert_eq!(kmode.name(), "1920x1080");
        assert_eq!(kmode.to_display_mode(), mode);
    }

    #[test]
    fn test_modeinfo_name_truncated() {
        let mut mode = DisplayMode::new(640, 480, 60);
        mode.name = String::from("a-very-long-mode-name-that-does-not-fit-in-32-bytes");
        let kmode = DrmModeInfo::from(&mode);
        assert_eq!(kmode.name().len(), DRM_DISPLAY_MODE_LEN - 1);
        assert_eq!(kmode.name[DRM_DISPLAY_MODE_LEN - 1], 0);
        assert!(mode.name.starts_with(kmode.name()));
    }
}
