//! Error taxonomy and small helpers shared by the scanout core.

use alloc::boxed::Box;
use alloc::string::String;
use alloc::vec::Vec;

use crate::drivers::display_pipe::Rect;
use crate::drivers::flip::ScanoutMode;
use crate::drivers::gem::{BoRequest, CpuAccess, CpuFence};

/// errno values reported by the device layer.
pub mod errno {
    pub const EPERM: i32 = 1;
    pub const ENOENT: i32 = 2;
    pub const EIO: i32 = 5;
    pub const EAGAIN: i32 = 11;
    pub const ENOMEM: i32 = 12;
    pub const EFAULT: i32 = 14;
    pub const EBUSY: i32 = 16;
    pub const EINVAL: i32 = 22;
    pub const ENOSPC: i32 = 28;
    pub const ENOSYS: i32 = 38;
}

/// A failed device call: the operation name and the errno it returned.
#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
#[error("{op} failed: errno {errno}")]
pub struct DrmError {
    pub op: &'static str,
    pub errno: i32,
}

impl DrmError {
    pub const fn new(op: &'static str, errno: i32) -> Self {
        Self { op, errno }
    }
}

/// Why a CRTC could not be programmed.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ProgramCause {
    #[error("no connected output is routed to the CRTC")]
    NoOutputs,
    #[error("no mode is set on the CRTC")]
    NoMode,
    #[error("could not bind a framebuffer: {0}")]
    Framebuffer(DrmError),
    #[error("{0}")]
    Device(DrmError),
    #[error("negative pan offset {x},{y}")]
    Offset { x: i32, y: i32 },
}

/// Why a scanout entry could not be populated during reconcile.
#[derive(Debug, thiserror::Error)]
pub enum ScanoutAllocCause {
    #[error("scanout table is full ({capacity} entries)")]
    Capacity { capacity: usize },
    #[error(transparent)]
    Buffer(Box<KmsError>),
}

#[derive(Debug, thiserror::Error)]
pub enum KmsError {
    #[error("buffer allocation {request:?} failed: {source}")]
    Allocation { request: BoRequest, source: DrmError },

    #[error("mapping bo {handle} failed: {source}")]
    Map { handle: u32, source: DrmError },

    #[error("bo {handle}: {requested:?} access requested while {held:?} is held")]
    AccessConflict { handle: u32, held: CpuFence, requested: CpuAccess },

    #[error("bo {handle}: CPU release without a matching acquire")]
    UnbalancedRelease { handle: u32 },

    #[error("adding framebuffer for bo {handle} failed: {source}")]
    Framebuffer { handle: u32, source: DrmError },

    #[error("programming CRTC {crtc} failed: {cause}")]
    Program { crtc: u32, cause: ProgramCause },

    #[error("scanout buffer for {rect:?} unavailable: {cause}")]
    ScanoutAllocation { rect: Rect, cause: ScanoutAllocCause },

    #[error("{cause}; rollback also failed on CRTCs {crtcs:?}")]
    RollbackFailed { cause: Box<KmsError>, crtcs: Vec<u32> },

    #[error("cannot switch scanout mode from {from:?} to {to:?}")]
    InvalidTransition { from: ScanoutMode, to: ScanoutMode },

    #[error("no CRTC at index {0}")]
    NoSuchCrtc(usize),

    #[error("no output at index {0}")]
    NoSuchOutput(usize),

    #[error("no overlay plane usable as a cursor on every CRTC")]
    CursorUnavailable,

    #[error("property {name}: {reason}")]
    Property { name: String, reason: &'static str },

    #[error("{pending} page flips still pending after draining the event queue")]
    FlipDrainStalled { pending: usize },

    #[error(transparent)]
    Device(#[from] DrmError),
}

impl KmsError {
    /// The device errno behind this error, when there is one.
    pub fn errno(&self) -> Option<i32> {
        match self {
            KmsError::Allocation { source, .. }
            | KmsError::Map { source, .. }
            | KmsError::Framebuffer { source, .. }
            | KmsError::Device(source) => Some(source.errno),
            KmsError::Program { cause: ProgramCause::Device(e), .. }
            | KmsError::Program { cause: ProgramCause::Framebuffer(e), .. } => Some(e.errno),
            KmsError::RollbackFailed { cause, .. } => cause.errno(),
            _ => None,
        }
    }
}

pub type KResult<T> = core::result::Result<T, KmsError>;

/// Rounds `value` up to a multiple of `align` (`align` == 0 leaves it as is).
/// `None` on overflow.
pub const fn align_up(value: u32, align: u32) -> Option<u32> {
    if align == 0 {
        Some(value)
    } else {
        value.div_ceil(align).checked_mul(align)
    }
}

/// Bytes needed for one pixel of `bpp` bits.
pub const fn bytes_per_pixel(bpp: u32) -> u32 {
    bpp.div_ceil(8)
}

/// Row pitch for `width` pixels of `bpp` bits, padded to `align` bytes.
/// `None` when the pitch does not fit in 32 bits.
pub const fn calculate_pitch(width: u32, bpp: u32, align: u32) -> Option<u32> {
    match width.checked_mul(bytes_per_pixel(bpp)) {
        Some(row) => align_up(row, align),
        None => None,
    }
}
