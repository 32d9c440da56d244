//! Hardware cursor on an overlay plane
//!
//! One plane that every CRTC can use carries the cursor. The image buffer is
//! padded on both sides up to the minimum DMA burst width; the padding stays
//! zero so it is transparent.

use alloc::sync::Arc;
use alloc::vec;

use tracing::{debug, error, info};

use super::display_pipe::Crtc;
use super::drm::{PlaneConfig, PlaneInfo};
use super::gem::{Bo, BoDevice, BoRequest, CpuAccess};
use crate::util::{errno, DrmError, KResult, KmsError};

pub const DEFAULT_CURSOR_WIDTH: u32 = 64;
pub const DEFAULT_CURSOR_HEIGHT: u32 = 64;

const CURSOR_BPP: u32 = 32;
const CURSOR_CPP: usize = 4;

/// Margin on each side so the padded width reaches `min_burst`.
pub const fn cursor_padding(width: u32, min_burst: u32) -> u32 {
    if width < min_burst {
        (min_burst - width).div_ceil(2)
    } else {
        0
    }
}

/// First plane whose `possible_crtcs` covers all `crtc_count` CRTCs.
pub fn find_cursor_plane(planes: &[PlaneInfo], crtc_count: usize) -> Option<&PlaneInfo> {
    let all = if crtc_count >= 32 { u32::MAX } else { (1u32 << crtc_count) - 1 };
    planes.iter().find(|p| p.possible_crtcs & all == all)
}

#[derive(Debug)]
pub struct CursorPlane {
    dev: Arc<BoDevice>,
    plane_id: u32,
    bo: Bo,
    width: u32,
    height: u32,
    pad: u32,
    /// Host asked for the cursor to be shown
    visible: bool,
    crtc_id: Option<u32>,
    /// Clipped placement, `None` when fully off-screen
    placement: Option<PlaneConfig>,
}

impl CursorPlane {
    pub fn new(dev: &Arc<BoDevice>, crtc_count: usize, width: u32, height: u32, min_burst: u32) -> KResult<Self> {
        let planes = dev.drm().get_plane_resources()?;
        let plane_id = find_cursor_plane(&planes, crtc_count).ok_or(KmsError::CursorUnavailable)?.id;

        let pad = cursor_padding(width, min_burst);
        let padded = width + 2 * pad;
        let bo = Bo::create(dev, BoRequest::Dimensions { width: padded, height, depth: 32, bpp: CURSOR_BPP })?;
        bo.clear()?;
        bo.bind_framebuffer()?;

        info!("cursor: plane {} with {}x{} image (pad {})", plane_id, width, height, pad);

        Ok(Self {
            dev: dev.clone(),
            plane_id,
            bo,
            width,
            height,
            pad,
            visible: false,
            crtc_id: None,
            placement: Some(PlaneConfig {
                crtc_x: 0,
                crtc_y: 0,
                crtc_w: padded,
                crtc_h: height,
                src_x: 0,
                src_y: 0,
                src_w: padded << 16,
                src_h: height << 16,
            }),
        })
    }

    pub fn plane_id(&self) -> u32 {
        self.plane_id
    }

    pub fn bo(&self) -> &Bo {
        &self.bo
    }

    pub fn padding(&self) -> u32 {
        self.pad
    }

    pub fn is_visible(&self) -> bool {
        self.visible
    }

    pub fn placement(&self) -> Option<&PlaneConfig> {
        self.placement.as_ref()
    }

    fn padded_width(&self) -> u32 {
        self.width + 2 * self.pad
    }

    fn apply(&self, shown: bool) -> KResult<()> {
        let Some(crtc_id) = self.crtc_id else {
            return Ok(());
        };
        let drm = self.dev.drm();
        let program = |fb, config: &PlaneConfig| {
            drm.set_plane(self.plane_id, crtc_id, fb, config).map_err(|e| {
                error!("cursor: set_plane on CRTC {} failed: {}", crtc_id, e);
                KmsError::Program { crtc: crtc_id, cause: crate::util::ProgramCause::Device(e) }
            })
        };
        match (shown, self.placement.as_ref()) {
            (true, Some(config)) => program(self.bo.fb_id(), config),
            _ => program(None, &PlaneConfig::default()),
        }
    }

    pub fn show(&mut self, crtc: &Crtc) -> KResult<()> {
        self.crtc_id = Some(crtc.id);
        self.visible = true;
        self.apply(true)
    }

    pub fn hide(&mut self) -> KResult<()> {
        self.visible = false;
        self.apply(false)
    }

    /// Places the image hotspot-relative to (`x`, `y`) on `crtc`, clipping
    /// against its visible area.
    pub fn move_to(&mut self, crtc: &Crtc, x: i32, y: i32) -> KResult<()> {
        let (crtc_w, crtc_h) = crtc.visible_size();
        let (crtc_w, crtc_h) = (crtc_w as i64, crtc_h as i64);

        let mut dst_x = x as i64 - self.pad as i64;
        let mut dst_y = y as i64;
        let mut w = self.padded_width() as i64;
        let mut h = self.height as i64;
        let mut src_x = 0i64;
        let mut src_y = 0i64;

        if dst_x < 0 {
            src_x = -dst_x;
            w += dst_x;
            dst_x = 0;
        }
        if dst_y < 0 {
            src_y = -dst_y;
            h += dst_y;
            dst_y = 0;
        }
        if dst_x + w > crtc_w {
            w = crtc_w - dst_x;
        }
        if dst_y + h > crtc_h {
            h = crtc_h - dst_y;
        }

        self.crtc_id = Some(crtc.id);
        self.placement = if w <= 0 || h <= 0 {
            None
        } else {
            Some(PlaneConfig {
                crtc_x: dst_x as i32,
                crtc_y: dst_y as i32,
                crtc_w: w as u32,
                crtc_h: h as u32,
                src_x: (src_x as u32) << 16,
                src_y: (src_y as u32) << 16,
                src_w: (w as u32) << 16,
                src_h: (h as u32) << 16,
            })
        };

        if self.visible {
            self.apply(true)?;
        }
        Ok(())
    }

    /// Replaces the cursor image with `argb` (`width * height` pixels).
    pub fn load_image(&mut self, argb: &[u32]) -> KResult<()> {
        let (w, h) = (self.width as usize, self.height as usize);
        if argb.len() < w * h {
            error!("cursor: image has {} pixels, need {}", argb.len(), w * h);
            return Err(KmsError::Device(DrmError::new("cursor_load", errno::EINVAL)));
        }

        let was_visible = self.visible;
        if was_visible {
            self.apply(false)?;
        }

        {
            let _guard = self.bo.cpu_access(CpuAccess::Write)?;
            let pad = self.pad as usize * CURSOR_CPP;
            let pitch = self.bo.pitch() as usize;
            let mut row = vec![0u8; pad * 2 + w * CURSOR_CPP];
            for (y, line) in argb.chunks_exact(w).take(h).enumerate() {
                for (px, out) in line.iter().zip(row[pad..pad + w * CURSOR_CPP].chunks_exact_mut(CURSOR_CPP)) {
                    out.copy_from_slice(&px.to_ne_bytes());
                }
                self.bo.write_bytes(y * pitch, &row)?;
            }
        }
        debug!("cursor: loaded {}x{} image", w, h);

        if was_visible {
            self.apply(true)?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::drivers::display_pipe::DisplayMode;
    use crate::drivers::gem::{CpuFence, DEFAULT_PITCH_ALIGNMENT};
    use crate::drivers::vkms::VirtualDrm;
    use alloc::vec::Vec;

    fn setup(min_burst: u32) -> (Arc<VirtualDrm>, CursorPlane, Crtc) {
        let drm = Arc::new(VirtualDrm::builder().crtcs(2).connector(11, 1920, 1080).build());
        let dev = BoDevice::probe(drm.clone(), None, DEFAULT_PITCH_ALIGNMENT);
        let cursor = CursorPlane::new(&dev, 2, 64, 64, min_burst).unwrap();
        let mut crtc = Crtc::new(drm.crtc_ids()[0], 0, 256);
        crtc.enabled = true;
        crtc.mode = Some(DisplayMode::new(1920, 1080, 60));
        (drm, cursor, crtc)
    }

    #[test]
    fn test_padding() {
        assert_eq!(cursor_padding(64, 0), 0);
        assert_eq!(cursor_padding(64, 64), 0);
        assert_eq!(cursor_padding(64, 96), 16);
        assert_eq!(cursor_padding(64, 97), 17);
    }

    #[test]
    fn test_plane_selection() {
        let planes = [
            PlaneInfo { id: 1, possible_crtcs: 0b01, formats: Vec::new() },
            PlaneInfo { id: 2, possible_crtcs: 0b11, formats: Vec::new() },
        ];
        assert_eq!(find_cursor_plane(&planes, 2).map(|p| p.id), Some(2));
        assert_eq!(find_cursor_plane(&planes, 1).map(|p| p.id), Some(1));
        assert!(find_cursor_plane(&planes, 3).is_none());
    }

    #[test]
    fn test_unavailable_without_shared_plane() {
        let drm = Arc::new(VirtualDrm::builder().crtcs(2).without_overlay().build());
        let dev = BoDevice::probe(drm, None, DEFAULT_PITCH_ALIGNMENT);
        assert!(matches!(CursorPlane::new(&dev, 2, 64, 64, 0), Err(KmsError::CursorUnavailable)));
    }

    #[test]
    fn test_show_hide() {
        let (drm, mut cursor, crtc) = setup(0);
        cursor.show(&crtc).unwrap();
        let state = drm.plane_state(cursor.plane_id()).unwrap();
        assert_eq!(state.crtc_id, crtc.id);
        assert_eq!(state.fb_id, cursor.bo().fb_id());

        cursor.hide().unwrap();
        let state = drm.plane_state(cursor.plane_id()).unwrap();
        assert_eq!(state.fb_id, None);
        assert_eq!(state.config, PlaneConfig::default());
    }

    #[test]
    fn test_move_clips_at_edges() {
        let (drm, mut cursor, crtc) = setup(96);
        cursor.show(&crtc).unwrap();

        cursor.move_to(&crtc, 100, 100).unwrap();
        let c = *cursor.placement().unwrap();
        assert_eq!((c.crtc_x, c.crtc_y, c.crtc_w, c.crtc_h), (84, 100, 96, 64));

        cursor.move_to(&crtc, 0, -10).unwrap();
        let c = *cursor.placement().unwrap();
        assert_eq!((c.crtc_x, c.crtc_y), (0, 0));
        assert_eq!((c.src_x >> 16, c.src_y >> 16), (16, 10));
        assert_eq!((c.crtc_w, c.crtc_h), (80, 54));

        cursor.move_to(&crtc, 1900, 1050).unwrap();
        let c = *cursor.placement().unwrap();
        assert_eq!((c.crtc_w, c.crtc_h), (36, 30));
        assert_eq!(drm.plane_state(cursor.plane_id()).unwrap().config, c);

        cursor.move_to(&crtc, 5000, 5000).unwrap();
        assert!(cursor.placement().is_none());
        assert_eq!(drm.plane_state(cursor.plane_id()).unwrap().fb_id, None);
        assert!(cursor.is_visible());
    }

    #[test]
    fn test_load_image_pads_with_zero() {
        let (_drm, mut cursor, crtc) = setup(96);
        cursor.show(&crtc).unwrap();
        let image = vec![0xff00_ff00u32; 64 * 64];
        cursor.load_image(&image).unwrap();
        assert_eq!(cursor.bo().fence(), CpuFence::Idle);

        let bytes = cursor.bo().to_vec().unwrap();
        let pitch = cursor.bo().pitch() as usize;
        let row = &bytes[pitch * 3..pitch * 3 + 96 * 4];
        assert!(row[..16 * 4].iter().all(|&b| b == 0));
        assert_eq!(&row[16 * 4..16 * 4 + 4], &0xff00_ff00u32.to_ne_bytes());
        assert!(row[80 * 4..].iter().all(|&b| b == 0));
        assert!(cursor.is_visible());

        assert!(cursor.load_image(&image[..10]).is_err());
    }
}
