//! CPU pixel copy between placed buffers.
//!
//! Each buffer is placed at an origin in virtual-screen coordinates. Only the
//! overlap of the two placed windows is copied, row by row.

use core::ptr;

use tracing::{error, trace};

use super::display_pipe::Rect;
use super::gem::{Bo, CpuAccess};
use crate::util::KResult;

/// A buffer placed in virtual-screen coordinates.
#[derive(Debug, Clone, Copy)]
pub struct BlitWindow<'a> {
    pub bo: &'a Bo,
    pub x: i32,
    pub y: i32,
    pub width: u32,
    pub height: u32,
}

impl<'a> BlitWindow<'a> {
    /// The whole buffer with its top-left corner at (`x`, `y`).
    pub fn new(bo: &'a Bo, x: i32, y: i32) -> Self {
        Self { bo, x, y, width: bo.width(), height: bo.height() }
    }

    /// Limits the addressable area; never grows past the buffer.
    pub fn with_size(mut self, width: u32, height: u32) -> Self {
        self.width = width.min(self.bo.width());
        self.height = height.min(self.bo.height());
        self
    }

    pub fn rect(&self) -> Rect {
        Rect::new(self.x, self.y, self.width.min(self.bo.width()), self.height.min(self.bo.height()))
    }

    fn offset_of(&self, x: i32, y: i32) -> usize {
        let col = (x - self.x) as usize;
        let row = (y - self.y) as usize;
        row * self.bo.pitch() as usize + col * self.bo.bytes_per_pixel() as usize
    }
}

/// Copies the overlap of `src` into `dst` and returns the number of bytes
/// written. Non-overlapping windows copy nothing and take no fence.
///
/// Both buffers must use the same bytes per pixel.
pub fn copy_region(dst: &BlitWindow<'_>, src: &BlitWindow<'_>) -> KResult<usize> {
    let cpp = dst.bo.bytes_per_pixel();
    assert_eq!(cpp, src.bo.bytes_per_pixel(), "blit: bytes per pixel mismatch");

    let overlap = match dst.rect().intersect(&src.rect()) {
        Some(r) => r,
        None => return Ok(0),
    };

    // Destination first, so a copy within one buffer stacks on the
    // exclusive hold instead of conflicting with a shared one.
    dst.bo.acquire_for_cpu(CpuAccess::Write)?;
    let result = copy_fenced(dst, src, &overlap, cpp as usize);
    if let Err(e) = dst.bo.release_from_cpu() {
        error!("blit: releasing destination bo {} failed: {}", dst.bo.handle(), e);
    }
    result
}

fn copy_fenced(dst: &BlitWindow<'_>, src: &BlitWindow<'_>, overlap: &Rect, cpp: usize) -> KResult<usize> {
    src.bo.acquire_for_cpu(CpuAccess::Read)?;
    let result = copy_rows(dst, src, overlap, cpp);
    if let Err(e) = src.bo.release_from_cpu() {
        error!("blit: releasing source bo {} failed: {}", src.bo.handle(), e);
    }
    result
}

fn copy_rows(dst: &BlitWindow<'_>, src: &BlitWindow<'_>, overlap: &Rect, cpp: usize) -> KResult<usize> {
    let dst_base = dst.bo.map()?;
    let src_base = src.bo.map()?;
    let row_bytes = overlap.width as usize * cpp;

    for row in 0..overlap.height as i32 {
        let y = overlap.y + row;
        let d = dst.offset_of(overlap.x, y);
        let s = src.offset_of(overlap.x, y);
        debug_assert!(d + row_bytes <= dst.bo.size());
        debug_assert!(s + row_bytes <= src.bo.size());
        // SAFETY: both offsets lie inside their mappings because the
        // overlap is clipped to each buffer's dimensions. Rows may alias
        // when both windows share a buffer, hence `copy`.
        unsafe {
            ptr::copy(src_base.as_ptr().add(s), dst_base.as_ptr().add(d), row_bytes);
        }
    }

    let copied = row_bytes * overlap.height as usize;
    trace!("blit: {} bytes bo {} -> bo {} over {:?}", copied, src.bo.handle(), dst.bo.handle(), overlap);
    Ok(copied)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::drivers::gem::{BoDevice, BoRequest, CpuFence, DEFAULT_PITCH_ALIGNMENT};
    use crate::drivers::vkms::VirtualDrm;
    use alloc::sync::Arc;
    use alloc::vec::Vec;

    fn setup() -> (Arc<VirtualDrm>, Arc<BoDevice>) {
        let drm = Arc::new(VirtualDrm::builder().driver("exynos").build());
        let dev = BoDevice::probe(drm.clone(), None, DEFAULT_PITCH_ALIGNMENT);
        (drm, dev)
    }

    fn bo(dev: &Arc<BoDevice>, w: u32, h: u32, bpp: u32) -> Bo {
        Bo::create(dev, BoRequest::Dimensions { width: w, height: h, depth: 24, bpp }).unwrap()
    }

    fn fill_pattern(b: &Bo) {
        let data: Vec<u8> = (0..b.size()).map(|i| (i * 7 + 3) as u8).collect();
        let _g = b.cpu_access(CpuAccess::Write).unwrap();
        b.write_bytes(0, &data).unwrap();
    }

    #[test]
    fn test_disjoint_windows_copy_nothing() {
        let (drm, dev) = setup();
        let a = bo(&dev, 32, 32, 32);
        let b = bo(&dev, 32, 32, 32);
        let acquires = drm.ioctl_count(crate::drivers::gem::EXYNOS_GEM_CPU_ACQUIRE);
        let n = copy_region(&BlitWindow::new(&a, 0, 0), &BlitWindow::new(&b, 32, 0)).unwrap();
        assert_eq!(n, 0);
        assert_eq!(drm.ioctl_count(crate::drivers::gem::EXYNOS_GEM_CPU_ACQUIRE), acquires);
    }

    #[test]
    fn test_identity_copy() {
        let (_drm, dev) = setup();
        let src = bo(&dev, 40, 10, 32);
        let dst = bo(&dev, 40, 10, 32);
        fill_pattern(&src);
        let n = copy_region(&BlitWindow::new(&dst, 0, 0), &BlitWindow::new(&src, 0, 0)).unwrap();
        assert_eq!(n, 40 * 4 * 10);
        let (s, d) = (src.to_vec().unwrap(), dst.to_vec().unwrap());
        let pitch = src.pitch() as usize;
        for row in 0..10 {
            assert_eq!(&s[row * pitch..row * pitch + 160], &d[row * pitch..row * pitch + 160]);
        }
        assert_eq!(src.fence(), CpuFence::Idle);
        assert_eq!(dst.fence(), CpuFence::Idle);
    }

    #[test]
    fn test_offset_window_copies_overlap_only() {
        let (_drm, dev) = setup();
        let root = bo(&dev, 64, 16, 32);
        fill_pattern(&root);
        let tile = bo(&dev, 16, 16, 32);

        // tile placed at (48, 8): overlap with root is 16x8
        let n = copy_region(&BlitWindow::new(&tile, 48, 8), &BlitWindow::new(&root, 0, 0)).unwrap();
        assert_eq!(n, 16 * 4 * 8);

        let r = root.to_vec().unwrap();
        let t = tile.to_vec().unwrap();
        let rp = root.pitch() as usize;
        let tp = tile.pitch() as usize;
        assert_eq!(&t[0..64], &r[8 * rp + 48 * 4..8 * rp + 64 * 4]);
        assert_eq!(&t[7 * tp..7 * tp + 64], &r[15 * rp + 48 * 4..15 * rp + 64 * 4]);
        assert!(t[8 * tp..].iter().all(|&b| b == 0));
    }

    #[test]
    fn test_same_buffer_copy() {
        let (_drm, dev) = setup();
        let b = bo(&dev, 16, 4, 32);
        fill_pattern(&b);
        let n = copy_region(&BlitWindow::new(&b, 0, 0), &BlitWindow::new(&b, 0, 0)).unwrap();
        assert_eq!(n, 16 * 4 * 4);
        assert_eq!(b.fence(), CpuFence::Idle);
    }

    #[test]
    #[should_panic(expected = "bytes per pixel mismatch")]
    fn test_bpp_mismatch_panics() {
        let (_drm, dev) = setup();
        let a = bo(&dev, 16, 16, 32);
        let b = bo(&dev, 16, 16, 16);
        let _ = copy_region(&BlitWindow::new(&a, 0, 0), &BlitWindow::new(&b, 0, 0));
    }
}
