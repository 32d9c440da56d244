//! Graphics Execution Manager (GEM) buffer objects
//!
//! Reference-counted handles to device memory used for scanout:
//! - Allocation by dimensions or by byte size through a per-driver backend
//! - A single lazily created CPU mapping
//! - A counting CPU-access fence (shared readers, exclusive writer)
//! - Framebuffer binding and flink export names
//!
//! A [`Bo`] is an `Arc` handle: cloning retains, dropping releases, and the
//! last release tears the object down (unmap, remove framebuffer, free).

use alloc::boxed::Box;
use alloc::string::String;
use alloc::sync::Arc;
use alloc::vec;
use core::fmt;
use core::ptr::{self, NonNull};

use spin::Mutex;
use tracing::{debug, error, warn};

use super::drm::{DrmDevice, DumbBuffer, FbId, FbRequest, GemHandle, Mapping};
use crate::util::{calculate_pitch, errno, DrmError, KResult, KmsError};

/// Width used when a buffer is requested by byte size.
const SIZE_REQUEST_WIDTH: u32 = 1024;
const SIZE_REQUEST_BPP: u32 = 32;

/// Default pitch alignment in bytes
pub const DEFAULT_PITCH_ALIGNMENT: u32 = 64;

/// What to allocate.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BoRequest {
    Dimensions { width: u32, height: u32, depth: u32, bpp: u32 },
    Size { size: usize },
}

/// Kind of CPU access requested on a buffer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CpuAccess {
    Read,
    Write,
}

/// CPU-access fence state. Counts are always >= 1 while held.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum CpuFence {
    #[default]
    Idle,
    Shared(u32),
    Exclusive(u32),
}

impl CpuFence {
    /// State after one more acquire, `None` when the access conflicts.
    pub fn acquire(self, access: CpuAccess) -> Option<CpuFence> {
        match (self, access) {
            (CpuFence::Idle, CpuAccess::Read) => Some(CpuFence::Shared(1)),
            (CpuFence::Idle, CpuAccess::Write) => Some(CpuFence::Exclusive(1)),
            (CpuFence::Shared(n), CpuAccess::Read) => Some(CpuFence::Shared(n + 1)),
            (CpuFence::Shared(_), CpuAccess::Write) => None,
            (CpuFence::Exclusive(n), _) => Some(CpuFence::Exclusive(n + 1)),
        }
    }

    /// State after one release, `None` when nothing is held.
    pub fn release(self) -> Option<CpuFence> {
        match self {
            CpuFence::Idle => None,
            CpuFence::Shared(1) | CpuFence::Exclusive(1) => Some(CpuFence::Idle),
            CpuFence::Shared(n) => Some(CpuFence::Shared(n - 1)),
            CpuFence::Exclusive(n) => Some(CpuFence::Exclusive(n - 1)),
        }
    }

    pub fn count(&self) -> u32 {
        match *self {
            CpuFence::Idle => 0,
            CpuFence::Shared(n) | CpuFence::Exclusive(n) => n,
        }
    }

    pub fn is_held(&self) -> bool {
        !matches!(self, CpuFence::Idle)
    }
}

/// Device-family specific allocation strategy.
///
/// The defaults cover generic dumb buffers; vendor backends override the
/// CPU fence hooks with their driver-private ioctls.
pub trait BoBackend: Send + Sync {
    fn name(&self) -> &'static str;

    fn create(&self, dev: &dyn DrmDevice, width: u32, height: u32, bpp: u32) -> Result<DumbBuffer, DrmError> {
        dev.create_dumb(width, height, bpp, 0)
    }

    fn destroy(&self, dev: &dyn DrmDevice, handle: GemHandle) -> Result<(), DrmError> {
        dev.destroy_dumb(handle)
    }

    fn map(&self, dev: &dyn DrmDevice, handle: GemHandle, size: usize) -> Result<Mapping, DrmError> {
        dev.map_dumb(handle, size)
    }

    fn flink(&self, dev: &dyn DrmDevice, handle: GemHandle) -> Result<u32, DrmError> {
        dev.gem_flink(handle)
    }

    /// Begin CPU access (outermost acquire only).
    fn cpu_prep(&self, _dev: &dyn DrmDevice, _handle: GemHandle, _access: CpuAccess) -> Result<(), DrmError> {
        Ok(())
    }

    /// End CPU access (last release only).
    fn cpu_fini(&self, _dev: &dyn DrmDevice, _handle: GemHandle) -> Result<(), DrmError> {
        Ok(())
    }
}

/// Vendor CPU-acquire flags
pub const GEM_CPU_ACQUIRE_SHARED: u32 = 0x0;
pub const GEM_CPU_ACQUIRE_EXCLUSIVE: u32 = 0x1;

/// Exynos driver-private ioctl numbers
pub const EXYNOS_GEM_CPU_ACQUIRE: u32 = 0x08;
pub const EXYNOS_GEM_CPU_RELEASE: u32 = 0x09;

/// Rockchip driver-private ioctl numbers
pub const ROCKCHIP_GEM_CPU_ACQUIRE: u32 = 0x02;
pub const ROCKCHIP_GEM_CPU_RELEASE: u32 = 0x03;

fn vendor_cpu_acquire(dev: &dyn DrmDevice, nr: u32, handle: GemHandle, access: CpuAccess) -> Result<(), DrmError> {
    let flags = match access {
        CpuAccess::Write => GEM_CPU_ACQUIRE_EXCLUSIVE,
        CpuAccess::Read => GEM_CPU_ACQUIRE_SHARED,
    };
    dev.driver_ioctl(nr, &mut [handle, flags])
}

fn vendor_cpu_release(dev: &dyn DrmDevice, nr: u32, handle: GemHandle) -> Result<(), DrmError> {
    dev.driver_ioctl(nr, &mut [handle])
}

/// Generic dumb buffers, no CPU fence ioctl.
#[derive(Debug, Default)]
pub struct DumbBackend;

impl BoBackend for DumbBackend {
    fn name(&self) -> &'static str {
        "dumb"
    }
}

#[derive(Debug, Default)]
pub struct ExynosBackend;

impl BoBackend for ExynosBackend {
    fn name(&self) -> &'static str {
        "exynos"
    }

    fn cpu_prep(&self, dev: &dyn DrmDevice, handle: GemHandle, access: CpuAccess) -> Result<(), DrmError> {
        vendor_cpu_acquire(dev, EXYNOS_GEM_CPU_ACQUIRE, handle, access)
    }

    fn cpu_fini(&self, dev: &dyn DrmDevice, handle: GemHandle) -> Result<(), DrmError> {
        vendor_cpu_release(dev, EXYNOS_GEM_CPU_RELEASE, handle)
    }
}

#[derive(Debug, Default)]
pub struct RockchipBackend;

impl BoBackend for RockchipBackend {
    fn name(&self) -> &'static str {
        "rockchip"
    }

    fn cpu_prep(&self, dev: &dyn DrmDevice, handle: GemHandle, access: CpuAccess) -> Result<(), DrmError> {
        vendor_cpu_acquire(dev, ROCKCHIP_GEM_CPU_ACQUIRE, handle, access)
    }

    fn cpu_fini(&self, dev: &dyn DrmDevice, handle: GemHandle) -> Result<(), DrmError> {
        vendor_cpu_release(dev, ROCKCHIP_GEM_CPU_RELEASE, handle)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BoBackendKind {
    Dumb,
    Exynos,
    Rockchip,
}

impl BoBackendKind {
    /// Picks a backend from the kernel driver name.
    pub fn probe(driver_name: &str) -> Self {
        match driver_name {
            "exynos" => BoBackendKind::Exynos,
            "rockchip" => BoBackendKind::Rockchip,
            _ => BoBackendKind::Dumb,
        }
    }

    pub fn from_name(name: &str) -> Option<Self> {
        match name {
            "dumb" => Some(BoBackendKind::Dumb),
            "exynos" => Some(BoBackendKind::Exynos),
            "rockchip" => Some(BoBackendKind::Rockchip),
            _ => None,
        }
    }

    pub fn backend(self) -> Box<dyn BoBackend> {
        match self {
            BoBackendKind::Dumb => Box::new(DumbBackend),
            BoBackendKind::Exynos => Box::new(ExynosBackend),
            BoBackendKind::Rockchip => Box::new(RockchipBackend),
        }
    }
}

/// A DRM device together with the buffer backend chosen for it.
pub struct BoDevice {
    drm: Arc<dyn DrmDevice>,
    backend: Box<dyn BoBackend>,
    pitch_alignment: u32,
}

impl BoDevice {
    pub fn new(drm: Arc<dyn DrmDevice>, kind: BoBackendKind, pitch_alignment: u32) -> Arc<Self> {
        debug!("gem: using {:?} buffer backend, pitch alignment {}", kind, pitch_alignment);
        Arc::new(Self { drm, backend: kind.backend(), pitch_alignment })
    }

    /// Probes the backend from the driver name unless `forced` is given.
    pub fn probe(drm: Arc<dyn DrmDevice>, forced: Option<BoBackendKind>, pitch_alignment: u32) -> Arc<Self> {
        let kind = match forced {
            Some(kind) => kind,
            None => BoBackendKind::probe(&drm.driver_name()),
        };
        Self::new(drm, kind, pitch_alignment)
    }

    pub fn drm(&self) -> &dyn DrmDevice {
        &*self.drm
    }

    pub fn backend_name(&self) -> &'static str {
        self.backend.name()
    }

    pub fn pitch_alignment(&self) -> u32 {
        self.pitch_alignment
    }
}

impl fmt::Debug for BoDevice {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("BoDevice")
            .field("backend", &self.backend.name())
            .field("pitch_alignment", &self.pitch_alignment)
            .finish()
    }
}

#[derive(Default)]
struct BoState {
    mapping: Option<Mapping>,
    fb_id: Option<FbId>,
    flink: Option<u32>,
    fence: CpuFence,
    /// Strong reference held while the CPU fence is taken
    pin: Option<Bo>,
}

struct BoInner {
    dev: Arc<BoDevice>,
    handle: GemHandle,
    width: u32,
    height: u32,
    depth: u32,
    bpp: u32,
    pitch: u32,
    size: usize,
    state: Mutex<BoState>,
}

impl Drop for BoInner {
    fn drop(&mut self) {
        let drm = self.dev.drm();
        let state = self.state.get_mut();
        debug_assert!(!state.fence.is_held());

        if let Some(mapping) = state.mapping.take() {
            drm.unmap(mapping);
        }
        if let Some(fb_id) = state.fb_id.take() {
            if let Err(e) = drm.rm_fb(fb_id) {
                error!("gem: failed to remove fb {} of bo {}: {}", fb_id, self.handle, e);
            }
        }
        if let Err(e) = self.dev.backend.destroy(drm, self.handle) {
            error!("gem: failed to destroy bo {}: {}", self.handle, e);
        }
        debug!("gem: bo {} destroyed", self.handle);
    }
}

/// Shared handle to a buffer object
#[derive(Clone)]
pub struct Bo(Arc<BoInner>);

impl Bo {
    /// Allocates a buffer. The returned handle is the only owner.
    pub fn create(dev: &Arc<BoDevice>, request: BoRequest) -> KResult<Bo> {
        let too_large = || {
            error!("gem: allocation {:?} does not fit", request);
            KmsError::Allocation { request, source: DrmError::new("bo_create", errno::EINVAL) }
        };
        let (width, height, depth, bpp, alloc_width) = match request {
            BoRequest::Dimensions { width, height, depth, bpp } => {
                let pitch = calculate_pitch(width, bpp, dev.pitch_alignment).ok_or_else(too_large)?;
                let cpp = crate::util::bytes_per_pixel(bpp).max(1);
                (width, height, depth, bpp, (pitch / cpp).max(width))
            }
            BoRequest::Size { size } => {
                let row = SIZE_REQUEST_WIDTH * crate::util::bytes_per_pixel(SIZE_REQUEST_BPP);
                let rows = (size as u64).div_ceil(row as u64).max(1);
                let height = u32::try_from(rows).map_err(|_| too_large())?;
                (SIZE_REQUEST_WIDTH, height, 24, SIZE_REQUEST_BPP, SIZE_REQUEST_WIDTH)
            }
        };

        let dumb = dev
            .backend
            .create(dev.drm(), alloc_width, height, bpp)
            .map_err(|source| {
                error!("gem: allocation {:?} failed: {}", request, source);
                KmsError::Allocation { request, source }
            })?;

        debug!("gem: created bo {} {}x{}@{} pitch {} size {}",
            dumb.handle, width, height, bpp, dumb.pitch, dumb.size);

        Ok(Bo(Arc::new(BoInner {
            dev: dev.clone(),
            handle: dumb.handle,
            width,
            height,
            depth,
            bpp,
            pitch: dumb.pitch,
            size: dumb.size as usize,
            state: Mutex::new(BoState::default()),
        })))
    }

    pub fn handle(&self) -> GemHandle {
        self.0.handle
    }

    pub fn width(&self) -> u32 {
        self.0.width
    }

    pub fn height(&self) -> u32 {
        self.0.height
    }

    pub fn depth(&self) -> u32 {
        self.0.depth
    }

    pub fn bpp(&self) -> u32 {
        self.0.bpp
    }

    pub fn bytes_per_pixel(&self) -> u32 {
        crate::util::bytes_per_pixel(self.0.bpp)
    }

    pub fn pitch(&self) -> u32 {
        self.0.pitch
    }

    pub fn size(&self) -> usize {
        self.0.size
    }

    pub fn device(&self) -> &Arc<BoDevice> {
        &self.0.dev
    }

    /// Number of owners, not counting the internal pin of a held fence.
    pub fn ref_count(&self) -> usize {
        let pinned = self.0.state.lock().pin.is_some() as usize;
        Arc::strong_count(&self.0) - pinned
    }

    /// True when both handles refer to the same buffer object.
    pub fn ptr_eq(&self, other: &Bo) -> bool {
        Arc::ptr_eq(&self.0, &other.0)
    }

    pub fn fence(&self) -> CpuFence {
        self.0.state.lock().fence
    }

    pub fn fb_id(&self) -> Option<FbId> {
        self.0.state.lock().fb_id
    }

    pub fn is_mapped(&self) -> bool {
        self.0.state.lock().mapping.is_some()
    }

    /// Maps the buffer into the CPU address space once and returns the base.
    pub fn map(&self) -> KResult<NonNull<u8>> {
        let mut state = self.0.state.lock();
        if let Some(mapping) = state.mapping {
            return Ok(mapping.ptr);
        }
        let mapping = self
            .0
            .dev
            .backend
            .map(self.0.dev.drm(), self.0.handle, self.0.size)
            .map_err(|source| {
                error!("gem: mapping bo {} failed: {}", self.0.handle, source);
                KmsError::Map { handle: self.0.handle, source }
            })?;
        state.mapping = Some(mapping);
        Ok(mapping.ptr)
    }

    /// Takes the CPU fence. Re-entrant; the device is told only on the
    /// outermost acquire.
    pub fn acquire_for_cpu(&self, access: CpuAccess) -> KResult<()> {
        let mut state = self.0.state.lock();
        let held = state.fence;
        let next = held.acquire(access).ok_or_else(|| {
            error!("gem: bo {}: {:?} access refused while {:?} is held", self.0.handle, access, held);
            KmsError::AccessConflict { handle: self.0.handle, held, requested: access }
        })?;

        if !held.is_held() {
            self.0.dev.backend.cpu_prep(self.0.dev.drm(), self.0.handle, access)?;
            state.pin = Some(self.clone());
        }
        state.fence = next;
        Ok(())
    }

    /// Drops one CPU fence reference; the last one ends device CPU access.
    pub fn release_from_cpu(&self) -> KResult<()> {
        let pin = {
            let mut state = self.0.state.lock();
            let next = state.fence.release().ok_or_else(|| {
                error!("gem: bo {}: CPU release without acquire", self.0.handle);
                KmsError::UnbalancedRelease { handle: self.0.handle }
            })?;
            state.fence = next;
            if next.is_held() {
                return Ok(());
            }
            if let Err(e) = self.0.dev.backend.cpu_fini(self.0.dev.drm(), self.0.handle) {
                error!("gem: ending CPU access on bo {} failed: {}", self.0.handle, e);
            }
            state.pin.take()
        };
        drop(pin);
        Ok(())
    }

    /// Scoped CPU access, released when the guard drops.
    pub fn cpu_access(&self, access: CpuAccess) -> KResult<CpuAccessGuard<'_>> {
        self.acquire_for_cpu(access)?;
        Ok(CpuAccessGuard { bo: self })
    }

    /// Wraps the buffer in a framebuffer once and returns its id.
    pub fn bind_framebuffer(&self) -> KResult<FbId> {
        let mut state = self.0.state.lock();
        if let Some(fb_id) = state.fb_id {
            return Ok(fb_id);
        }
        let request = FbRequest {
            width: self.0.width,
            height: self.0.height,
            depth: self.0.depth,
            bpp: self.0.bpp,
            pitch: self.0.pitch,
            handle: self.0.handle,
        };
        let fb_id = self.0.dev.drm().add_fb(&request).map_err(|source| {
            error!("gem: could not add fb to bo {}: {}", self.0.handle, source);
            KmsError::Framebuffer { handle: self.0.handle, source }
        })?;
        state.fb_id = Some(fb_id);
        Ok(fb_id)
    }

    /// Global export name, cached after the first call.
    pub fn flink_name(&self) -> KResult<u32> {
        let mut state = self.0.state.lock();
        if let Some(name) = state.flink {
            return Ok(name);
        }
        let name = self.0.dev.backend.flink(self.0.dev.drm(), self.0.handle)?;
        state.flink = Some(name);
        Ok(name)
    }

    /// Zero-fills the whole buffer under a write fence.
    pub fn clear(&self) -> KResult<()> {
        let _guard = self.cpu_access(CpuAccess::Write)?;
        let base = self.map()?;
        // SAFETY: the mapping covers `size` bytes and the write fence is held.
        unsafe { ptr::write_bytes(base.as_ptr(), 0, self.0.size) };
        Ok(())
    }

    fn check_range(&self, offset: usize, len: usize) -> KResult<()> {
        match offset.checked_add(len) {
            Some(end) if end <= self.0.size => Ok(()),
            _ => {
                warn!("gem: bo {}: access {}+{} outside {} bytes", self.0.handle, offset, len, self.0.size);
                Err(KmsError::Map { handle: self.0.handle, source: DrmError::new("bo_access", errno::EFAULT) })
            }
        }
    }

    /// Copies bytes out of the mapping. The caller holds the CPU fence.
    pub fn read_bytes(&self, offset: usize, out: &mut [u8]) -> KResult<()> {
        self.check_range(offset, out.len())?;
        let base = self.map()?;
        // SAFETY: range checked against the mapping size above.
        unsafe { ptr::copy_nonoverlapping(base.as_ptr().add(offset), out.as_mut_ptr(), out.len()) };
        Ok(())
    }

    /// Copies bytes into the mapping. The caller holds the CPU fence.
    pub fn write_bytes(&self, offset: usize, data: &[u8]) -> KResult<()> {
        self.check_range(offset, data.len())?;
        let base = self.map()?;
        // SAFETY: range checked against the mapping size above.
        unsafe { ptr::copy_nonoverlapping(data.as_ptr(), base.as_ptr().add(offset), data.len()) };
        Ok(())
    }

    /// Snapshot of the whole buffer contents.
    pub fn to_vec(&self) -> KResult<alloc::vec::Vec<u8>> {
        let _guard = self.cpu_access(CpuAccess::Read)?;
        let mut out = vec![0u8; self.0.size];
        self.read_bytes(0, &mut out)?;
        Ok(out)
    }

    pub fn describe(&self) -> String {
        alloc::format!("bo {} {}x{}@{} pitch {}", self.0.handle, self.0.width, self.0.height, self.0.bpp, self.0.pitch)
    }
}

impl fmt::Debug for Bo {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Bo")
            .field("handle", &self.0.handle)
            .field("width", &self.0.width)
            .field("height", &self.0.height)
            .field("bpp", &self.0.bpp)
            .field("pitch", &self.0.pitch)
            .finish()
    }
}

/// Releases one CPU fence reference on drop.
#[must_use]
pub struct CpuAccessGuard<'a> {
    bo: &'a Bo,
}

impl CpuAccessGuard<'_> {
    pub fn bo(&self) -> &Bo {
        self.bo
    }
}

impl Drop for CpuAccessGuard<'_> {
    fn drop(&mut self) {
        if let Err(e) = self.bo.release_from_cpu() {
            error!("gem: guard release failed: {}", e);
        }
    }
}
