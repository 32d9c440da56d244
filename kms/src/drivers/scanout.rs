//! Per-CRTC scanout buffers
//!
//! A fixed-capacity table keyed by CRTC geometry. Each entry owns a buffer
//! sized to the geometry and remembers whether its pixels still match the
//! root buffer for that rectangle.

use alloc::boxed::Box;
use alloc::vec::Vec;
use core::mem;

use tracing::{debug, warn};

use super::display_pipe::{Crtc, Rect};
use super::gem::Bo;
use crate::util::{KResult, KmsError, ScanoutAllocCause};

/// Default number of simultaneous scanouts
pub const MAX_SCANOUTS: usize = 3;

/// Anything with a placement in the virtual screen.
pub trait Drawable {
    fn geometry(&self) -> Rect;
}

impl Drawable for Rect {
    fn geometry(&self) -> Rect {
        *self
    }
}

impl Drawable for Crtc {
    fn geometry(&self) -> Rect {
        Crtc::geometry(self)
    }
}

#[derive(Debug, Clone)]
pub struct ScanoutEntry {
    pub rect: Rect,
    pub bo: Option<Bo>,
    /// Pixels match the root buffer over `rect`
    pub valid: bool,
}

#[derive(Debug)]
pub struct ScanoutRegistry {
    entries: Vec<ScanoutEntry>,
    capacity: usize,
    resized: bool,
}

impl ScanoutRegistry {
    pub fn new(capacity: usize) -> Self {
        Self { entries: Vec::with_capacity(capacity), capacity, resized: false }
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    pub fn entries(&self) -> &[ScanoutEntry] {
        &self.entries
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn find_by_geometry(&self, rect: &Rect) -> Option<&ScanoutEntry> {
        self.entries.iter().find(|e| e.rect == *rect)
    }

    pub fn find_by_geometry_mut(&mut self, rect: &Rect) -> Option<&mut ScanoutEntry> {
        self.entries.iter_mut().find(|e| e.rect == *rect)
    }

    pub fn find_by_drawable<D: Drawable + ?Sized>(&self, drawable: &D) -> Option<&ScanoutEntry> {
        self.find_by_geometry(&drawable.geometry())
    }

    /// Rebuilds the table for the given CRTC geometries.
    ///
    /// Matching entries keep their buffer and validity, new geometries get
    /// a buffer from `alloc` and start invalid, everything else is released.
    /// Empty and repeated geometries are skipped. A failure leaves the
    /// entries reconciled so far in place.
    pub fn reconcile<F>(&mut self, geometries: &[Rect], mut alloc: F) -> KResult<()>
    where
        F: FnMut(&Rect) -> KResult<Bo>,
    {
        let mut old: Vec<Option<ScanoutEntry>> = mem::take(&mut self.entries).into_iter().map(Some).collect();
        let mut failure = None;

        for rect in geometries.iter().filter(|r| !r.is_empty()) {
            if self.entries.iter().any(|e| e.rect == *rect) {
                continue;
            }
            if self.entries.len() == self.capacity {
                warn!("scanout: no free entry for {:?} ({} in use)", rect, self.capacity);
                failure = Some(KmsError::ScanoutAllocation {
                    rect: *rect,
                    cause: ScanoutAllocCause::Capacity { capacity: self.capacity },
                });
                break;
            }

            let carried = old.iter_mut().find(|e| matches!(e, Some(e) if e.rect == *rect)).and_then(Option::take);
            if let Some(entry) = carried {
                self.entries.push(entry);
                continue;
            }

            match alloc(rect) {
                Ok(bo) => {
                    debug!("scanout: new entry {:?} -> bo {}", rect, bo.handle());
                    self.entries.push(ScanoutEntry { rect: *rect, bo: Some(bo), valid: false });
                    self.resized = true;
                }
                Err(e) => {
                    warn!("scanout: allocation for {:?} failed: {}", rect, e);
                    failure = Some(KmsError::ScanoutAllocation {
                        rect: *rect,
                        cause: ScanoutAllocCause::Buffer(Box::new(e)),
                    });
                    break;
                }
            }
        }

        for entry in old.into_iter().flatten() {
            debug!("scanout: dropping entry {:?}", entry.rect);
            self.resized = true;
        }

        match failure {
            Some(e) => Err(e),
            None => Ok(()),
        }
    }

    /// Records that `rect` now shows `bo`. Ignored when no entry matches.
    pub fn set_by_geometry(&mut self, rect: &Rect, bo: Bo) -> bool {
        match self.find_by_geometry_mut(rect) {
            Some(entry) => {
                entry.bo = Some(bo);
                true
            }
            None => {
                debug!("scanout: no entry for {:?}, update dropped", rect);
                false
            }
        }
    }

    /// Returns and clears the sticky "geometry changed" signal.
    pub fn take_resized(&mut self) -> bool {
        mem::take(&mut self.resized)
    }

    pub fn is_resized(&self) -> bool {
        self.resized
    }

    pub fn invalidate_all(&mut self) {
        for entry in &mut self.entries {
            entry.valid = false;
        }
    }

    pub(crate) fn entries_mut(&mut self) -> &mut [ScanoutEntry] {
        &mut self.entries
    }

    /// Releases every entry.
    pub fn clear(&mut self) {
        if !self.entries.is_empty() {
            self.resized = true;
        }
        self.entries.clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::drivers::gem::{BoDevice, BoRequest, DEFAULT_PITCH_ALIGNMENT};
    use crate::drivers::vkms::VirtualDrm;
    use crate::util::{errno, DrmError};
    use alloc::sync::Arc;
    use alloc::vec;

    fn setup() -> (Arc<VirtualDrm>, Arc<BoDevice>) {
        let drm = Arc::new(VirtualDrm::builder().build());
        let dev = BoDevice::probe(drm.clone(), None, DEFAULT_PITCH_ALIGNMENT);
        (drm, dev)
    }

    fn allocator(dev: &Arc<BoDevice>) -> impl FnMut(&Rect) -> KResult<Bo> + '_ {
        move |r: &Rect| Bo::create(dev, BoRequest::Dimensions { width: r.width, height: r.height, depth: 24, bpp: 32 })
    }

    #[test]
    fn test_reconcile_is_idempotent() {
        let (_drm, dev) = setup();
        let mut reg = ScanoutRegistry::new(MAX_SCANOUTS);
        let geoms = [Rect::new(0, 0, 64, 32), Rect::new(64, 0, 32, 32)];
        reg.reconcile(&geoms, allocator(&dev)).unwrap();
        assert!(reg.take_resized());
        reg.entries_mut()[0].valid = true;
        let before: Vec<_> = reg.entries().iter().map(|e| (e.rect, e.bo.clone().unwrap(), e.valid)).collect();

        reg.reconcile(&geoms, |_| panic!("no allocation expected")).unwrap();
        assert!(!reg.take_resized());
        for (entry, (rect, bo, valid)) in reg.entries().iter().zip(before.iter()) {
            assert_eq!(entry.rect, *rect);
            assert!(entry.bo.as_ref().unwrap().ptr_eq(bo));
            assert_eq!(entry.valid, *valid);
        }
    }

    #[test]
    fn test_reconcile_skips_empty_and_duplicate() {
        let (_drm, dev) = setup();
        let mut reg = ScanoutRegistry::new(MAX_SCANOUTS);
        let g = Rect::new(0, 0, 16, 16);
        reg.reconcile(&[g, Rect::new(5, 5, 0, 10), g], allocator(&dev)).unwrap();
        assert_eq!(reg.len(), 1);
        assert!(!reg.entries()[0].valid);
    }

    #[test]
    fn test_dropped_entry_releases_buffer_once() {
        let (drm, dev) = setup();
        let mut reg = ScanoutRegistry::new(MAX_SCANOUTS);
        let a = Rect::new(0, 0, 16, 16);
        let b = Rect::new(16, 0, 16, 16);
        reg.reconcile(&[a, b], allocator(&dev)).unwrap();
        reg.take_resized();
        let handle = reg.find_by_geometry(&b).unwrap().bo.as_ref().unwrap().handle();

        reg.reconcile(&[a], allocator(&dev)).unwrap();
        assert!(reg.take_resized());
        assert!(reg.find_by_geometry(&b).is_none());
        assert_eq!(drm.destroyed_handles(), vec![handle]);
    }

    #[test]
    fn test_capacity_exceeded() {
        let (_drm, dev) = setup();
        let mut reg = ScanoutRegistry::new(2);
        let geoms = [Rect::new(0, 0, 8, 8), Rect::new(8, 0, 8, 8), Rect::new(16, 0, 8, 8)];
        let err = reg.reconcile(&geoms, allocator(&dev)).unwrap_err();
        assert!(matches!(err, KmsError::ScanoutAllocation { cause: ScanoutAllocCause::Capacity { capacity: 2 }, .. }));
        assert_eq!(reg.len(), 2);
    }

    #[test]
    fn test_allocation_failure_keeps_reconciled_entries() {
        let (_drm, dev) = setup();
        let mut reg = ScanoutRegistry::new(MAX_SCANOUTS);
        let a = Rect::new(0, 0, 8, 8);
        let b = Rect::new(8, 0, 8, 8);
        let mut calls = 0;
        let err = reg
            .reconcile(&[a, b], |r| {
                calls += 1;
                if calls == 2 {
                    Err(KmsError::Device(DrmError::new("create_dumb", errno::ENOMEM)))
                } else {
                    Bo::create(&dev, BoRequest::Dimensions { width: r.width, height: r.height, depth: 24, bpp: 32 })
                }
            })
            .unwrap_err();
        assert!(matches!(err, KmsError::ScanoutAllocation { rect, .. } if rect == b));
        assert!(reg.find_by_geometry(&a).is_some());
        assert!(reg.find_by_geometry(&b).is_none());
    }

    #[test]
    fn test_set_by_geometry_without_match_is_dropped() {
        let (_drm, dev) = setup();
        let mut reg = ScanoutRegistry::new(MAX_SCANOUTS);
        let a = Rect::new(0, 0, 8, 8);
        reg.reconcile(&[a], allocator(&dev)).unwrap();
        let other = Bo::create(&dev, BoRequest::Size { size: 4096 }).unwrap();
        assert!(!reg.set_by_geometry(&Rect::new(1, 1, 8, 8), other.clone()));
        assert_eq!(other.ref_count(), 1);
        assert!(reg.set_by_geometry(&a, other.clone()));
        assert!(reg.find_by_drawable(&a).unwrap().bo.as_ref().unwrap().ptr_eq(&other));
    }
}
