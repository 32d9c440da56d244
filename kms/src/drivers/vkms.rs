//! Virtual KMS device
//!
//! A host-memory implementation of [`DrmDevice`]. Dumb buffers are plain
//! heap allocations, framebuffers and CRTC/plane state are bookkeeping, and
//! page-flip completions are queued until read. Faults can be injected per
//! operation (one-shot) or per CRTC, and every call that matters for
//! resource accounting is counted.

use alloc::boxed::Box;
use alloc::collections::{BTreeMap, VecDeque};
use alloc::string::String;
use alloc::vec;
use alloc::vec::Vec;
use core::ptr::NonNull;

use spin::Mutex;
use tracing::trace;

use super::display_pipe::{DisplayMode, ModeType};
use super::drm::{
    ConnectionStatus, ConnectorInfo, CrtcInfo, DrmDevice, DrmEvent, DrmModeInfo, DumbBuffer, EncoderInfo, FbId,
    FbRequest, GemHandle, Mapping, ModeResources, PageFlipEvent, PlaneConfig, PlaneInfo, PropertyEnum,
    PropertyFlags, PropertyInfo,
};
use crate::util::{errno, DrmError};

pub const DPMS_PROP_ID: u32 = 100;
pub const EDID_PROP_ID: u32 = 101;
pub const SCALING_PROP_ID: u32 = 102;
pub const BRIGHTNESS_PROP_ID: u32 = 103;

const CRTC_ID_BASE: u32 = 30;
const CONNECTOR_ID_BASE: u32 = 50;
const ENCODER_ID_BASE: u32 = 70;
const PLANE_ID_BASE: u32 = 90;
const BLOB_ID_BASE: u32 = 500;
const GAMMA_SIZE: u32 = 256;
const MAX_DIMENSION: u32 = 8192;
const FORMAT_XRGB8888: u32 = 0x3432_5258;
const FORMAT_ARGB8888: u32 = 0x3432_5241;

/// Operations that can be made to fail once.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Fault {
    CreateDumb,
    DestroyDumb,
    MapDumb,
    GemFlink,
    DriverIoctl,
    AddFb,
    RmFb,
    SetCrtc,
    SetPlane,
    SetGamma,
    PageFlip,
    ReadEvents,
    GetConnector,
    SetProperty,
}

#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct CrtcState {
    pub fb_id: Option<FbId>,
    pub x: u32,
    pub y: u32,
    pub connectors: Vec<u32>,
    pub mode: Option<DrmModeInfo>,
    pub gamma: Option<Vec<u16>>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PlaneState {
    pub crtc_id: u32,
    pub fb_id: Option<FbId>,
    pub config: PlaneConfig,
}

struct DumbObject {
    memory: Box<[u8]>,
    info: DumbBuffer,
}

struct PendingEvent {
    event: DrmEvent,
    /// Reads to wait before delivery
    delay: usize,
}

#[derive(Clone, Copy)]
struct CrtcFault {
    /// Successful framebuffer programs left before failing
    ok_calls: usize,
    errno: i32,
}

#[derive(Default)]
struct State {
    next_handle: u32,
    next_fb: u32,
    next_flink: u32,
    flip_sequence: u64,
    buffers: BTreeMap<GemHandle, DumbObject>,
    framebuffers: BTreeMap<FbId, FbRequest>,
    crtcs: BTreeMap<u32, CrtcState>,
    connectors: BTreeMap<u32, ConnectorInfo>,
    encoders: BTreeMap<u32, EncoderInfo>,
    properties: BTreeMap<u32, PropertyInfo>,
    blobs: BTreeMap<u32, Vec<u8>>,
    planes: Vec<PlaneInfo>,
    plane_states: BTreeMap<u32, PlaneState>,
    events: VecDeque<PendingEvent>,
    flip_delay: usize,
    faults: Vec<(Fault, i32)>,
    crtc_faults: BTreeMap<u32, CrtcFault>,
    destroyed: Vec<GemHandle>,
    live_mappings: usize,
    ioctls: BTreeMap<u32, usize>,
    set_crtc_calls: usize,
}

impl State {
    fn check(&mut self, fault: Fault, op: &'static str) -> Result<(), DrmError> {
        match self.faults.iter().position(|&(f, _)| f == fault) {
            Some(i) => {
                let (_, errno) = self.faults.remove(i);
                trace!("vkms: injected failure of {} (errno {})", op, errno);
                Err(DrmError::new(op, errno))
            }
            None => Ok(()),
        }
    }

    fn check_crtc(&mut self, crtc_id: u32) -> Result<(), DrmError> {
        match self.crtc_faults.get_mut(&crtc_id) {
            Some(f) if f.ok_calls > 0 => {
                f.ok_calls -= 1;
                Ok(())
            }
            Some(f) => Err(DrmError::new("set_crtc", f.errno)),
            None => Ok(()),
        }
    }
}

fn enoent(op: &'static str) -> DrmError {
    DrmError::new(op, errno::ENOENT)
}

fn einval(op: &'static str) -> DrmError {
    DrmError::new(op, errno::EINVAL)
}

pub struct VirtualDrmBuilder {
    driver: String,
    crtcs: usize,
    connectors: Vec<(u32, u16, u16)>,
    overlay: bool,
}

impl VirtualDrmBuilder {
    pub fn driver(mut self, name: &str) -> Self {
        self.driver = String::from(name);
        self
    }

    pub fn crtcs(mut self, count: usize) -> Self {
        self.crtcs = count;
        self
    }

    /// Adds a connected connector of `connector_type` whose preferred mode
    /// is `width`x`height`.
    pub fn connector(mut self, connector_type: u32, width: u16, height: u16) -> Self {
        self.connectors.push((connector_type, width, height));
        self
    }

    pub fn without_overlay(mut self) -> Self {
        self.overlay = false;
        self
    }

    pub fn build(self) -> VirtualDrm {
        let mut state = State { next_handle: 1, next_fb: 1, next_flink: 1, ..State::default() };
        let crtc_mask = if self.crtcs >= 32 { u32::MAX } else { (1u32 << self.crtcs) - 1 };

        for i in 0..self.crtcs {
            state.crtcs.insert(CRTC_ID_BASE + i as u32, CrtcState::default());
            state.planes.push(PlaneInfo {
                id: PLANE_ID_BASE + i as u32,
                possible_crtcs: 1 << i,
                formats: vec![FORMAT_XRGB8888],
            });
        }
        if self.overlay {
            state.planes.push(PlaneInfo {
                id: PLANE_ID_BASE + self.crtcs as u32,
                possible_crtcs: crtc_mask,
                formats: vec![FORMAT_ARGB8888, FORMAT_XRGB8888],
            });
        }

        state.properties.insert(DPMS_PROP_ID, enum_property(DPMS_PROP_ID, "DPMS", &["On", "Standby", "Suspend", "Off"]));
        state.properties.insert(EDID_PROP_ID, PropertyInfo {
            id: EDID_PROP_ID,
            name: String::from("EDID"),
            flags: PropertyFlags::BLOB | PropertyFlags::IMMUTABLE,
            values: Vec::new(),
            enums: Vec::new(),
        });
        state.properties.insert(
            SCALING_PROP_ID,
            enum_property(SCALING_PROP_ID, "scaling mode", &["None", "Full", "Center", "Full aspect"]),
        );
        state.properties.insert(BRIGHTNESS_PROP_ID, PropertyInfo {
            id: BRIGHTNESS_PROP_ID,
            name: String::from("brightness"),
            flags: PropertyFlags::RANGE,
            values: vec![0, 100],
            enums: Vec::new(),
        });

        for (i, &(connector_type, width, height)) in self.connectors.iter().enumerate() {
            let id = CONNECTOR_ID_BASE + i as u32;
            let encoder_id = ENCODER_ID_BASE + i as u32;
            let blob_id = BLOB_ID_BASE + i as u32;
            let type_id = 1 + self.connectors[..i].iter().filter(|c| c.0 == connector_type).count() as u32;

            state.encoders.insert(encoder_id, EncoderInfo {
                id: encoder_id,
                crtc_id: None,
                possible_crtcs: crtc_mask,
                possible_clones: 0,
            });
            state.blobs.insert(blob_id, fake_edid(i as u8));

            let mut fallback = DisplayMode::new(1024, 768, 60);
            fallback.mode_type = ModeType::DRIVER;
            state.connectors.insert(id, ConnectorInfo {
                id,
                connector_type,
                connector_type_id: type_id,
                connection: ConnectionStatus::Connected,
                encoders: vec![encoder_id],
                modes: vec![DrmModeInfo::from(&DisplayMode::new(width, height, 60)), DrmModeInfo::from(&fallback)],
                mm_width: width as u32 / 4,
                mm_height: height as u32 / 4,
                props: vec![
                    (DPMS_PROP_ID, 0),
                    (EDID_PROP_ID, blob_id as u64),
                    (SCALING_PROP_ID, 0),
                    (BRIGHTNESS_PROP_ID, 50),
                ],
            });
        }

        VirtualDrm { driver: self.driver, state: Mutex::new(state) }
    }
}

fn enum_property(id: u32, name: &str, values: &[&str]) -> PropertyInfo {
    PropertyInfo {
        id,
        name: String::from(name),
        flags: PropertyFlags::ENUM,
        values: Vec::new(),
        enums: values
            .iter()
            .enumerate()
            .map(|(i, n)| PropertyEnum { name: String::from(*n), value: i as u64 })
            .collect(),
    }
}

fn fake_edid(serial: u8) -> Vec<u8> {
    let mut edid = vec![0u8; 128];
    edid[..8].copy_from_slice(&[0x00, 0xff, 0xff, 0xff, 0xff, 0xff, 0xff, 0x00]);
    edid[12] = serial;
    let sum = edid.iter().fold(0u8, |acc, b| acc.wrapping_add(*b));
    edid[127] = 0u8.wrapping_sub(sum);
    edid
}

pub struct VirtualDrm {
    driver: String,
    state: Mutex<State>,
}

impl VirtualDrm {
    pub fn builder() -> VirtualDrmBuilder {
        VirtualDrmBuilder { driver: String::from("vkms"), crtcs: 1, connectors: Vec::new(), overlay: true }
    }

    /// Fails the next call of `fault` with `errno`.
    pub fn inject(&self, fault: Fault, errno: i32) {
        self.state.lock().faults.push((fault, errno));
    }

    /// Fails every framebuffer program of `crtc_id`.
    pub fn fail_crtc(&self, crtc_id: u32, errno: i32) {
        self.fail_crtc_after(crtc_id, 0, errno);
    }

    /// Lets `ok_calls` framebuffer programs of `crtc_id` through, then fails.
    pub fn fail_crtc_after(&self, crtc_id: u32, ok_calls: usize, errno: i32) {
        self.state.lock().crtc_faults.insert(crtc_id, CrtcFault { ok_calls, errno });
    }

    pub fn clear_faults(&self) {
        let mut state = self.state.lock();
        state.faults.clear();
        state.crtc_faults.clear();
    }

    /// Holds back page-flip completions for `reads` event reads.
    pub fn delay_flip_events(&self, reads: usize) {
        self.state.lock().flip_delay = reads;
    }

    pub fn crtc_ids(&self) -> Vec<u32> {
        self.state.lock().crtcs.keys().copied().collect()
    }

    pub fn connector_ids(&self) -> Vec<u32> {
        self.state.lock().connectors.keys().copied().collect()
    }

    pub fn crtc_state(&self, crtc_id: u32) -> Option<CrtcState> {
        self.state.lock().crtcs.get(&crtc_id).cloned()
    }

    pub fn plane_state(&self, plane_id: u32) -> Option<PlaneState> {
        self.state.lock().plane_states.get(&plane_id).copied()
    }

    /// GEM handle behind a framebuffer.
    pub fn fb_handle(&self, fb_id: FbId) -> Option<GemHandle> {
        self.state.lock().framebuffers.get(&fb_id).map(|fb| fb.handle)
    }

    pub fn has_framebuffer(&self, fb_id: FbId) -> bool {
        self.state.lock().framebuffers.contains_key(&fb_id)
    }

    pub fn framebuffer_count(&self) -> usize {
        self.state.lock().framebuffers.len()
    }

    pub fn buffer_count(&self) -> usize {
        self.state.lock().buffers.len()
    }

    pub fn destroyed_handles(&self) -> Vec<GemHandle> {
        self.state.lock().destroyed.clone()
    }

    pub fn live_mappings(&self) -> usize {
        self.state.lock().live_mappings
    }

    pub fn ioctl_count(&self, nr: u32) -> usize {
        self.state.lock().ioctls.get(&nr).copied().unwrap_or(0)
    }

    pub fn set_crtc_calls(&self) -> usize {
        self.state.lock().set_crtc_calls
    }

    pub fn pending_events(&self) -> usize {
        self.state.lock().events.len()
    }

    pub fn connector_property(&self, connector_id: u32, prop_id: u32) -> Option<u64> {
        let state = self.state.lock();
        let conn = state.connectors.get(&connector_id)?;
        conn.props.iter().find(|&&(id, _)| id == prop_id).map(|&(_, v)| v)
    }

    /// Simulates a hot-plug change. Disconnected connectors report no modes.
    pub fn set_connection(&self, connector_id: u32, status: ConnectionStatus) {
        let mut state = self.state.lock();
        if let Some(conn) = state.connectors.get_mut(&connector_id) {
            conn.connection = status;
            if status != ConnectionStatus::Connected {
                conn.modes.clear();
            }
        }
    }

    /// Contents of a dumb buffer.
    pub fn buffer_bytes(&self, handle: GemHandle) -> Option<Vec<u8>> {
        self.state.lock().buffers.get(&handle).map(|b| b.memory.to_vec())
    }
}

impl DrmDevice for VirtualDrm {
    fn driver_name(&self) -> String {
        self.driver.clone()
    }

    fn get_resources(&self) -> Result<ModeResources, DrmError> {
        let state = self.state.lock();
        Ok(ModeResources {
            crtcs: state.crtcs.keys().copied().collect(),
            connectors: state.connectors.keys().copied().collect(),
            encoders: state.encoders.keys().copied().collect(),
            min_width: 320,
            max_width: MAX_DIMENSION,
            min_height: 200,
            max_height: MAX_DIMENSION,
        })
    }

    fn get_connector(&self, connector_id: u32) -> Result<ConnectorInfo, DrmError> {
        let mut state = self.state.lock();
        state.check(Fault::GetConnector, "get_connector")?;
        state.connectors.get(&connector_id).cloned().ok_or_else(|| enoent("get_connector"))
    }

    fn get_encoder(&self, encoder_id: u32) -> Result<EncoderInfo, DrmError> {
        self.state.lock().encoders.get(&encoder_id).copied().ok_or_else(|| enoent("get_encoder"))
    }

    fn get_crtc(&self, crtc_id: u32) -> Result<CrtcInfo, DrmError> {
        let state = self.state.lock();
        let crtc = state.crtcs.get(&crtc_id).ok_or_else(|| enoent("get_crtc"))?;
        Ok(CrtcInfo {
            id: crtc_id,
            fb_id: crtc.fb_id,
            x: crtc.x,
            y: crtc.y,
            mode: crtc.mode,
            gamma_size: GAMMA_SIZE,
        })
    }

    fn get_plane_resources(&self) -> Result<Vec<PlaneInfo>, DrmError> {
        Ok(self.state.lock().planes.clone())
    }

    fn get_property(&self, prop_id: u32) -> Result<PropertyInfo, DrmError> {
        self.state.lock().properties.get(&prop_id).cloned().ok_or_else(|| enoent("get_property"))
    }

    fn get_property_blob(&self, blob_id: u32) -> Result<Vec<u8>, DrmError> {
        self.state.lock().blobs.get(&blob_id).cloned().ok_or_else(|| enoent("get_property_blob"))
    }

    fn set_connector_property(&self, connector_id: u32, prop_id: u32, value: u64) -> Result<(), DrmError> {
        let mut state = self.state.lock();
        state.check(Fault::SetProperty, "set_connector_property")?;
        let immutable = state
            .properties
            .get(&prop_id)
            .map(|p| p.flags.contains(PropertyFlags::IMMUTABLE))
            .ok_or_else(|| enoent("set_connector_property"))?;
        if immutable {
            return Err(DrmError::new("set_connector_property", errno::EPERM));
        }
        let conn = state.connectors.get_mut(&connector_id).ok_or_else(|| enoent("set_connector_property"))?;
        let slot = conn
            .props
            .iter_mut()
            .find(|(id, _)| *id == prop_id)
            .ok_or_else(|| einval("set_connector_property"))?;
        slot.1 = value;
        Ok(())
    }

    fn create_dumb(&self, width: u32, height: u32, bpp: u32, _flags: u32) -> Result<DumbBuffer, DrmError> {
        let mut state = self.state.lock();
        state.check(Fault::CreateDumb, "create_dumb")?;
        if width == 0 || height == 0 || bpp == 0 || width > MAX_DIMENSION || height > MAX_DIMENSION {
            return Err(einval("create_dumb"));
        }
        let pitch = width.checked_mul(bpp.div_ceil(8)).ok_or_else(|| einval("create_dumb"))?;
        let size = pitch as u64 * height as u64;
        let handle = state.next_handle;
        state.next_handle += 1;
        let info = DumbBuffer { handle, width, height, bpp, pitch, size };
        state.buffers.insert(handle, DumbObject { memory: vec![0u8; size as usize].into_boxed_slice(), info });
        trace!("vkms: dumb {} {}x{}@{} pitch {}", handle, width, height, bpp, pitch);
        Ok(info)
    }

    fn destroy_dumb(&self, handle: GemHandle) -> Result<(), DrmError> {
        let mut state = self.state.lock();
        state.check(Fault::DestroyDumb, "destroy_dumb")?;
        state.buffers.remove(&handle).ok_or_else(|| enoent("destroy_dumb"))?;
        state.destroyed.push(handle);
        Ok(())
    }

    fn map_dumb(&self, handle: GemHandle, size: usize) -> Result<Mapping, DrmError> {
        let mut state = self.state.lock();
        state.check(Fault::MapDumb, "map_dumb")?;
        let buffer = state.buffers.get_mut(&handle).ok_or_else(|| enoent("map_dumb"))?;
        if size > buffer.memory.len() {
            return Err(einval("map_dumb"));
        }
        let ptr = NonNull::new(buffer.memory.as_mut_ptr()).ok_or_else(|| DrmError::new("map_dumb", errno::EFAULT))?;
        state.live_mappings += 1;
        Ok(Mapping { ptr, len: size })
    }

    fn unmap(&self, _mapping: Mapping) {
        let mut state = self.state.lock();
        state.live_mappings = state.live_mappings.saturating_sub(1);
    }

    fn gem_flink(&self, handle: GemHandle) -> Result<u32, DrmError> {
        let mut state = self.state.lock();
        state.check(Fault::GemFlink, "gem_flink")?;
        if !state.buffers.contains_key(&handle) {
            return Err(enoent("gem_flink"));
        }
        let name = state.next_flink;
        state.next_flink += 1;
        Ok(name)
    }

    fn driver_ioctl(&self, nr: u32, args: &mut [u32]) -> Result<(), DrmError> {
        let mut state = self.state.lock();
        *state.ioctls.entry(nr).or_insert(0) += 1;
        state.check(Fault::DriverIoctl, "driver_ioctl")?;
        match args.first() {
            Some(handle) if state.buffers.contains_key(handle) => Ok(()),
            _ => Err(enoent("driver_ioctl")),
        }
    }

    fn add_fb(&self, fb: &FbRequest) -> Result<FbId, DrmError> {
        let mut state = self.state.lock();
        state.check(Fault::AddFb, "add_fb")?;
        let buffer = state.buffers.get(&fb.handle).ok_or_else(|| enoent("add_fb"))?;
        if fb.pitch as u64 * fb.height as u64 > buffer.info.size || fb.pitch < fb.width * fb.bpp.div_ceil(8) {
            return Err(einval("add_fb"));
        }
        let id = state.next_fb;
        state.next_fb += 1;
        state.framebuffers.insert(id, *fb);
        Ok(id)
    }

    fn rm_fb(&self, fb_id: FbId) -> Result<(), DrmError> {
        let mut state = self.state.lock();
        state.check(Fault::RmFb, "rm_fb")?;
        state.framebuffers.remove(&fb_id).map(|_| ()).ok_or_else(|| enoent("rm_fb"))
    }

    fn set_crtc(
        &self,
        crtc_id: u32,
        fb_id: Option<FbId>,
        x: u32,
        y: u32,
        connectors: &[u32],
        mode: Option<&DrmModeInfo>,
    ) -> Result<(), DrmError> {
        let mut state = self.state.lock();
        state.set_crtc_calls += 1;
        state.check(Fault::SetCrtc, "set_crtc")?;
        if !state.crtcs.contains_key(&crtc_id) {
            return Err(enoent("set_crtc"));
        }

        if let Some(fb_id) = fb_id {
            state.check_crtc(crtc_id)?;
            let fb = *state.framebuffers.get(&fb_id).ok_or_else(|| enoent("set_crtc"))?;
            let mode = mode.ok_or_else(|| einval("set_crtc"))?;
            if connectors.is_empty() || connectors.iter().any(|c| !state.connectors.contains_key(c)) {
                return Err(einval("set_crtc"));
            }
            if x + mode.hdisplay as u32 > fb.width || y + mode.vdisplay as u32 > fb.height {
                return Err(DrmError::new("set_crtc", errno::ENOSPC));
            }
        }

        let crtc = state.crtcs.get_mut(&crtc_id).ok_or_else(|| enoent("set_crtc"))?;
        crtc.fb_id = fb_id;
        crtc.x = x;
        crtc.y = y;
        crtc.connectors = connectors.to_vec();
        crtc.mode = mode.copied();
        Ok(())
    }

    fn set_plane(&self, plane_id: u32, crtc_id: u32, fb_id: Option<FbId>, config: &PlaneConfig) -> Result<(), DrmError> {
        let mut state = self.state.lock();
        state.check(Fault::SetPlane, "set_plane")?;
        if !state.planes.iter().any(|p| p.id == plane_id) || !state.crtcs.contains_key(&crtc_id) {
            return Err(enoent("set_plane"));
        }
        if let Some(fb_id) = fb_id {
            if !state.framebuffers.contains_key(&fb_id) {
                return Err(enoent("set_plane"));
            }
        }
        state.plane_states.insert(plane_id, PlaneState { crtc_id, fb_id, config: *config });
        Ok(())
    }

    fn set_gamma(&self, crtc_id: u32, red: &[u16], green: &[u16], blue: &[u16]) -> Result<(), DrmError> {
        let mut state = self.state.lock();
        state.check(Fault::SetGamma, "set_gamma")?;
        if red.len() != GAMMA_SIZE as usize || green.len() != red.len() || blue.len() != red.len() {
            return Err(einval("set_gamma"));
        }
        let crtc = state.crtcs.get_mut(&crtc_id).ok_or_else(|| enoent("set_gamma"))?;
        crtc.gamma = Some(red.to_vec());
        Ok(())
    }

    fn page_flip(&self, crtc_id: u32, fb_id: FbId, user_data: u64) -> Result<(), DrmError> {
        let mut state = self.state.lock();
        state.check(Fault::PageFlip, "page_flip")?;
        if !state.framebuffers.contains_key(&fb_id) {
            return Err(enoent("page_flip"));
        }
        let crtc = state.crtcs.get_mut(&crtc_id).ok_or_else(|| enoent("page_flip"))?;
        if crtc.fb_id.is_none() {
            return Err(einval("page_flip"));
        }
        crtc.fb_id = Some(fb_id);
        state.flip_sequence += 1;
        let event = DrmEvent::PageFlip(PageFlipEvent { crtc_id, sequence: state.flip_sequence, user_data });
        let delay = state.flip_delay;
        state.events.push_back(PendingEvent { event, delay });
        Ok(())
    }

    fn read_events(&self) -> Result<Vec<DrmEvent>, DrmError> {
        let mut state = self.state.lock();
        state.check(Fault::ReadEvents, "read_events")?;
        let mut ready = Vec::new();
        let mut waiting = VecDeque::new();
        while let Some(mut pending) = state.events.pop_front() {
            if pending.delay == 0 {
                ready.push(pending.event);
            } else {
                pending.delay = pending.delay.saturating_sub(1);
                waiting.push_back(pending);
            }
        }
        state.events = waiting;
        Ok(ready)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_builder_layout() {
        let drm = VirtualDrm::builder().crtcs(3).connector(11, 1920, 1080).connector(11, 1280, 1024).build();
        assert_eq!(drm.crtc_ids().len(), 3);
        let res = drm.get_resources().unwrap();
        assert_eq!(res.connectors.len(), 2);
        let second = drm.get_connector(res.connectors[1]).unwrap();
        assert_eq!(second.connector_type_id, 2);
        let planes = drm.get_plane_resources().unwrap();
        assert_eq!(planes.last().unwrap().possible_crtcs, 0b111);
    }

    #[test]
    fn test_one_shot_fault() {
        let drm = VirtualDrm::builder().build();
        drm.inject(Fault::CreateDumb, errno::ENOMEM);
        assert_eq!(drm.create_dumb(8, 8, 32, 0).unwrap_err().errno, errno::ENOMEM);
        assert!(drm.create_dumb(8, 8, 32, 0).is_ok());
    }

    #[test]
    fn test_create_dumb_limits() {
        let drm = VirtualDrm::builder().build();
        assert_eq!(drm.create_dumb(8193, 8, 32, 0).unwrap_err().errno, errno::EINVAL);
        assert_eq!(drm.create_dumb(8, 8193, 32, 0).unwrap_err().errno, errno::EINVAL);
        assert_eq!(drm.create_dumb(8192, 1, u32::MAX, 0).unwrap_err().errno, errno::EINVAL);
        assert_eq!(drm.create_dumb(8192, 2, 32, 0).unwrap().pitch, 32768);
        assert_eq!(drm.buffer_count(), 1);
    }

    #[test]
    fn test_set_crtc_checks_fb_size() {
        let drm = VirtualDrm::builder().connector(11, 64, 64).build();
        let crtc = drm.crtc_ids()[0];
        let conn = drm.connector_ids()[0];
        let dumb = drm.create_dumb(64, 64, 32, 0).unwrap();
        let fb = drm
            .add_fb(&FbRequest { width: 64, height: 64, depth: 24, bpp: 32, pitch: dumb.pitch, handle: dumb.handle })
            .unwrap();
        let mode = DrmModeInfo::from(&DisplayMode::new(64, 64, 60));
        assert!(drm.set_crtc(crtc, Some(fb), 0, 0, &[conn], Some(&mode)).is_ok());
        assert_eq!(drm.set_crtc(crtc, Some(fb), 8, 0, &[conn], Some(&mode)).unwrap_err().errno, errno::ENOSPC);
        assert_eq!(drm.crtc_state(crtc).unwrap().x, 0);
    }

    #[test]
    fn test_delayed_flip_events() {
        let drm = VirtualDrm::builder().connector(11, 64, 64).build();
        let crtc = drm.crtc_ids()[0];
        let conn = drm.connector_ids()[0];
        let dumb = drm.create_dumb(64, 64, 32, 0).unwrap();
        let fb = drm
            .add_fb(&FbRequest { width: 64, height: 64, depth: 24, bpp: 32, pitch: dumb.pitch, handle: dumb.handle })
            .unwrap();
        let mode = DrmModeInfo::from(&DisplayMode::new(64, 64, 60));
        drm.set_crtc(crtc, Some(fb), 0, 0, &[conn], Some(&mode)).unwrap();

        drm.delay_flip_events(2);
        drm.page_flip(crtc, fb, 7).unwrap();
        assert!(drm.read_events().unwrap().is_empty());
        assert!(drm.read_events().unwrap().is_empty());
        let events = drm.read_events().unwrap();
        assert!(matches!(events.as_slice(), [DrmEvent::PageFlip(PageFlipEvent { user_data: 7, .. })]));
    }
}
