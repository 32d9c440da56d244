//! Display Pipeline
//!
//! Per-CRTC state and the operations that program a CRTC:
//! - Geometry (position of the CRTC inside the virtual screen)
//! - Display modes and their timing flags
//! - Programming a CRTC to scan out a buffer at an offset
//! - Saving and restoring CRTC state around a failed mode set

use alloc::string::String;
use alloc::vec::Vec;

use tracing::{debug, error, warn};

use super::drm::{DrmDevice, DrmModeInfo};
use super::gem::Bo;
use crate::util::{KResult, KmsError, ProgramCause};

/// Rectangle in virtual-screen coordinates.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub struct Rect {
    pub x: i32,
    pub y: i32,
    pub width: u32,
    pub height: u32,
}

impl Rect {
    pub const fn new(x: i32, y: i32, width: u32, height: u32) -> Self {
        Self { x, y, width, height }
    }

    pub const fn is_empty(&self) -> bool {
        self.width == 0 || self.height == 0
    }

    pub const fn right(&self) -> i64 {
        self.x as i64 + self.width as i64
    }

    pub const fn bottom(&self) -> i64 {
        self.y as i64 + self.height as i64
    }

    /// Overlap of two rectangles, `None` when they do not intersect.
    pub fn intersect(&self, other: &Rect) -> Option<Rect> {
        let x0 = (self.x as i64).max(other.x as i64);
        let y0 = (self.y as i64).max(other.y as i64);
        let x1 = self.right().min(other.right());
        let y1 = self.bottom().min(other.bottom());
        if x1 <= x0 || y1 <= y0 {
            return None;
        }
        Some(Rect {
            x: x0 as i32,
            y: y0 as i32,
            width: (x1 - x0) as u32,
            height: (y1 - y0) as u32,
        })
    }
}

bitflags::bitflags! {
    /// CRTC rotation and reflection (DRM property bit layout).
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct Rotation: u32 {
        const ROTATE_0 = 1 << 0;
        const ROTATE_90 = 1 << 1;
        const ROTATE_180 = 1 << 2;
        const ROTATE_270 = 1 << 3;
        const REFLECT_X = 1 << 4;
        const REFLECT_Y = 1 << 5;
    }
}

impl Rotation {
    /// 90 and 270 degree rotations scan the buffer out transposed.
    pub fn swaps_axes(&self) -> bool {
        self.intersects(Rotation::ROTATE_90 | Rotation::ROTATE_270)
    }
}

impl Default for Rotation {
    fn default() -> Self {
        Rotation::ROTATE_0
    }
}

/// Display mode (resolution + timing)
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DisplayMode {
    pub name: String,
    pub clock: u32, // Pixel clock in kHz
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
    pub flags: ModeFlags,
    pub mode_type: ModeType,
}

impl DisplayMode {
    /// Builds a mode with generic blanking for `width`x`height`@`refresh`.
    pub fn new(width: u16, height: u16, refresh: u32) -> Self {
        let htotal = width + 160;
        let vtotal = height + 40;
        let clock = (htotal as u32) * (vtotal as u32) * refresh / 1000;

        Self {
            name: alloc::format!("{}x{}", width, height),
            clock,
            hdisplay: width,
            hsync_start: width + 48,
            hsync_end: width + 48 + 32,
            htotal,
            hskew: 0,
            vdisplay: height,
            vsync_start: height + 3,
            vsync_end: height + 3 + 6,
            vtotal,
            vscan: 0,
            vrefresh: refresh,
            flags: ModeFlags::PHSYNC | ModeFlags::PVSYNC,
            mode_type: ModeType::DRIVER | ModeType::PREFERRED,
        }
    }
}

bitflags::bitflags! {
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct ModeFlags: u32 {
        const PHSYNC = 1 << 0;
        const NHSYNC = 1 << 1;
        const PVSYNC = 1 << 2;
        const NVSYNC = 1 << 3;
        const INTERLACE = 1 << 4;
        const DBLSCAN = 1 << 5;
        const CSYNC = 1 << 6;
        const PCSYNC = 1 << 7;
        const NCSYNC = 1 << 8;
        const HSKEW = 1 << 9;
        const DBLCLK = 1 << 12;
        const CLKDIV2 = 1 << 13;
    }
}

bitflags::bitflags! {
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct ModeType: u32 {
        const BUILTIN = 1 << 0;
        const CLOCK_C = (1 << 1) | (1 << 0);
        const CRTC_C = (1 << 2) | (1 << 0);
        const PREFERRED = 1 << 3;
        const DEFAULT = 1 << 4;
        const USERDEF = 1 << 5;
        const DRIVER = 1 << 6;
    }
}

/// What a CRTC is currently scanning out.
#[derive(Debug, Clone)]
pub struct ScanoutSource {
    pub bo: Bo,
    pub x: u32,
    pub y: u32,
}

impl ScanoutSource {
    pub fn is(&self, bo: &Bo, x: u32, y: u32) -> bool {
        self.bo.ptr_eq(bo) && self.x == x && self.y == y
    }
}

/// The part of CRTC state a mode set may change.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SavedCrtcState {
    pub enabled: bool,
    pub mode: Option<DisplayMode>,
    pub x: i32,
    pub y: i32,
    pub rotation: Rotation,
}

/// One display pipeline (CRTC)
#[derive(Debug)]
pub struct Crtc {
    /// Device object id
    pub id: u32,
    /// Position in the device's CRTC list
    pub index: usize,
    pub enabled: bool,
    pub mode: Option<DisplayMode>,
    pub x: i32,
    pub y: i32,
    pub rotation: Rotation,
    pub gamma_size: u32,
    scanout: Option<ScanoutSource>,
}

impl Crtc {
    pub fn new(id: u32, index: usize, gamma_size: u32) -> Self {
        Self {
            id,
            index,
            enabled: false,
            mode: None,
            x: 0,
            y: 0,
            rotation: Rotation::ROTATE_0,
            gamma_size,
            scanout: None,
        }
    }

    /// Visible area in virtual-screen coordinates; empty when the CRTC is off.
    pub fn geometry(&self) -> Rect {
        match (&self.mode, self.enabled) {
            (Some(mode), true) => {
                let (w, h) = if self.rotation.swaps_axes() {
                    (mode.vdisplay, mode.hdisplay)
                } else {
                    (mode.hdisplay, mode.vdisplay)
                };
                Rect::new(self.x, self.y, w as u32, h as u32)
            }
            _ => Rect::default(),
        }
    }

    /// Visible size in CRTC coordinates (used for cursor clipping).
    pub fn visible_size(&self) -> (u32, u32) {
        let g = self.geometry();
        (g.width, g.height)
    }

    pub fn scanout(&self) -> Option<&ScanoutSource> {
        self.scanout.as_ref()
    }

    pub fn is_scanning_out(&self) -> bool {
        self.scanout.is_some()
    }

    /// Programs the CRTC to scan out `bo` at (`x`, `y`) through `outputs`.
    pub fn program(&mut self, dev: &dyn DrmDevice, bo: &Bo, x: u32, y: u32, outputs: &[u32]) -> KResult<()> {
        let fail = |cause| KmsError::Program { crtc: self.id, cause };

        if outputs.is_empty() {
            return Err(fail(ProgramCause::NoOutputs));
        }
        let mode = self.mode.as_ref().ok_or_else(|| fail(ProgramCause::NoMode))?;

        let fb_id = bo.bind_framebuffer().map_err(|e| match e {
            KmsError::Framebuffer { source, .. } => fail(ProgramCause::Framebuffer(source)),
            other => other,
        })?;

        let kmode = DrmModeInfo::from(mode);
        dev.set_crtc(self.id, Some(fb_id), x, y, outputs, Some(&kmode))
            .map_err(|e| fail(ProgramCause::Device(e)))?;

        debug!("display_pipe: CRTC {} -> fb {} (bo {}) at {},{} mode {}",
            self.id, fb_id, bo.handle(), x, y, mode.name);

        self.scanout = Some(ScanoutSource { bo: bo.clone(), x, y });
        Ok(())
    }

    /// Turns the CRTC off: no framebuffer, no outputs.
    pub fn disable(&mut self, dev: &dyn DrmDevice) -> KResult<()> {
        dev.set_crtc(self.id, None, 0, 0, &[], None)
            .map_err(|e| KmsError::Program { crtc: self.id, cause: ProgramCause::Device(e) })?;
        self.scanout = None;
        debug!("display_pipe: CRTC {} disabled", self.id);
        Ok(())
    }

    /// A completed page flip now shows `bo` at the origin.
    pub(crate) fn record_flip(&mut self, bo: Bo) {
        self.scanout = Some(ScanoutSource { bo, x: 0, y: 0 });
    }

    pub fn save(&self) -> SavedCrtcState {
        SavedCrtcState {
            enabled: self.enabled,
            mode: self.mode.clone(),
            x: self.x,
            y: self.y,
            rotation: self.rotation,
        }
    }

    pub fn restore(&mut self, saved: SavedCrtcState) {
        self.enabled = saved.enabled;
        self.mode = saved.mode;
        self.x = saved.x;
        self.y = saved.y;
        self.rotation = saved.rotation;
    }

    /// Loads a gamma ramp. Failure is reported but never fatal to a mode set.
    pub fn set_gamma(&self, dev: &dyn DrmDevice, red: &[u16], green: &[u16], blue: &[u16]) {
        if red.len() != green.len() || red.len() != blue.len() {
            warn!("display_pipe: CRTC {} gamma ramps have mismatched sizes", self.id);
            return;
        }
        if let Err(e) = dev.set_gamma(self.id, red, green, blue) {
            error!("display_pipe: failed to set gamma on CRTC {}: {}", self.id, e);
        }
    }

    /// Identity ramp sized for this CRTC.
    pub fn linear_gamma(&self) -> Vec<u16> {
        let size = self.gamma_size.max(1);
        (0..size)
            .map(|i| if size == 1 { 0xffff } else { ((i as u64 * 0xffff) / (size as u64 - 1)) as u16 })
            .collect()
    }
}
