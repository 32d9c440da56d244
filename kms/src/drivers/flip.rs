//! Scanout mode switching
//!
//! Owns the CRTCs, outputs, root buffer and per-CRTC scanout buffers, and
//! moves the display between:
//! - Blit mode: every enabled CRTC scans out the shared root buffer at its
//!   offset
//! - Flip mode: every enabled CRTC scans out its own buffer at (0, 0)
//!
//! Multi-CRTC reprogramming is not atomic on the device, so each transition
//! records what every CRTC showed before it was touched and replays that log
//! in reverse when a later CRTC fails.

use alloc::boxed::Box;
use alloc::collections::BTreeMap;
use alloc::sync::Arc;
use alloc::vec::Vec;
use core::mem;

use tracing::{debug, error, info, warn};

use super::blit::{copy_region, BlitWindow};
use super::cursor::CursorPlane;
use super::display_pipe::{Crtc, DisplayMode, Rect, Rotation, ScanoutSource};
use super::drm::{DrmDevice, DrmEvent};
use super::gem::{Bo, BoDevice, BoRequest};
use super::output::{DpmsMode, Output};
use super::scanout::ScanoutRegistry;
use crate::config::KmsConfig;
use crate::util::{errno, DrmError, KResult, KmsError, ProgramCause, ScanoutAllocCause};

pub const SCREEN_DEPTH: u32 = 24;
pub const SCREEN_BPP: u32 = 32;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ScanoutMode {
    /// Bring-up, nothing programmed yet
    Disabled,
    Blit,
    Flip,
}

/// Events reported back to the host.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Notification {
    ModeSet { crtc: usize, success: bool },
    /// `pitch` is `None` when the resize failed
    Resize { width: u32, height: u32, pitch: Option<u32> },
    /// Scanout buffers changed; cursor images need reloading
    ScanoutChanged,
}

#[derive(Debug)]
struct PendingFlip {
    crtc: usize,
    bo: Bo,
}

/// One CRTC to program during a transition.
struct Target {
    crtc: usize,
    bo: Bo,
    x: u32,
    y: u32,
}

/// CRTC index and what it showed before the transition touched it.
type TransactionLog = Vec<(usize, Option<ScanoutSource>)>;

fn screen_request(width: u32, height: u32) -> BoRequest {
    BoRequest::Dimensions { width, height, depth: SCREEN_DEPTH, bpp: SCREEN_BPP }
}

/// Fails with `EINVAL` outside `min`..=`max`. A zero maximum is unbounded.
fn check_screen_size(width: u32, height: u32, min: (u32, u32), max: (u32, u32)) -> KResult<()> {
    let over = |value: u32, limit: u32| limit != 0 && value > limit;
    if width < min.0 || height < min.1 || over(width, max.0) || over(height, max.1) {
        return Err(KmsError::Allocation {
            request: screen_request(width, height),
            source: DrmError::new("resize", errno::EINVAL),
        });
    }
    Ok(())
}

/// Offset into the root buffer; negative pans are not representable.
fn pan_offset(x: i32, y: i32) -> Option<(u32, u32)> {
    Some((u32::try_from(x).ok()?, u32::try_from(y).ok()?))
}

pub struct ModeSwitchEngine {
    dev: Arc<BoDevice>,
    config: KmsConfig,
    mode: ScanoutMode,
    crtcs: Vec<Crtc>,
    outputs: Vec<Output>,
    root: Bo,
    width: u32,
    height: u32,
    min_size: (u32, u32),
    max_size: (u32, u32),
    registry: ScanoutRegistry,
    cursor: Option<CursorPlane>,
    pending_flips: BTreeMap<u64, PendingFlip>,
    next_flip_token: u64,
    notifications: Vec<Notification>,
}

impl ModeSwitchEngine {
    /// Brings up the display pipeline with a `width`x`height` root buffer.
    ///
    /// Connected outputs are routed to the CRTC with the same index when
    /// their encoder allows it.
    pub fn new(drm: Arc<dyn DrmDevice>, config: KmsConfig, width: u32, height: u32) -> KResult<Self> {
        let dev = BoDevice::probe(drm, config.backend, config.pitch_alignment);
        let res = dev.drm().get_resources()?;
        debug!("flip: {} crtcs, {} connectors, {} encoders, {}x{} to {}x{}",
            res.crtcs.len(), res.connectors.len(), res.encoders.len(),
            res.min_width, res.min_height, res.max_width, res.max_height);

        let mut crtcs = Vec::with_capacity(res.crtcs.len());
        for (index, &id) in res.crtcs.iter().enumerate() {
            let info = dev.drm().get_crtc(id)?;
            crtcs.push(Crtc::new(id, index, info.gamma_size));
        }

        let mut outputs = Vec::with_capacity(res.connectors.len());
        for &id in &res.connectors {
            match Output::probe(dev.drm(), id) {
                Ok(mut output) => {
                    let index = outputs.len();
                    if output.is_connected() && index < crtcs.len() && output.can_drive(index) {
                        output.crtc = Some(index);
                    }
                    outputs.push(output);
                }
                Err(e) => warn!("flip: skipping connector {}: {}", id, e),
            }
        }

        let width = width.max(config.min_width);
        let height = height.max(config.min_height);
        let min_size = (config.min_width, config.min_height);
        let max_size = (res.max_width, res.max_height);
        check_screen_size(width, height, min_size, max_size)?;
        let root = Bo::create(&dev, screen_request(width, height))?;
        root.clear()?;

        let cursor = if config.hw_cursor {
            match CursorPlane::new(&dev, crtcs.len(), config.cursor_width, config.cursor_height, config.cursor_min_burst_width) {
                Ok(cursor) => Some(cursor),
                Err(e) => {
                    warn!("flip: running without a hardware cursor: {}", e);
                    None
                }
            }
        } else {
            None
        };

        info!("flip: {}x{} screen, {} backend, {} crtcs", width, height, dev.backend_name(), crtcs.len());

        Ok(Self {
            registry: ScanoutRegistry::new(config.max_scanouts),
            dev,
            config,
            mode: ScanoutMode::Disabled,
            crtcs,
            outputs,
            root,
            width,
            height,
            min_size,
            max_size,
            cursor,
            pending_flips: BTreeMap::new(),
            next_flip_token: 1,
            notifications: Vec::new(),
        })
    }

    pub fn mode(&self) -> ScanoutMode {
        self.mode
    }

    pub fn config(&self) -> &KmsConfig {
        &self.config
    }

    pub fn device(&self) -> &Arc<BoDevice> {
        &self.dev
    }

    pub fn crtcs(&self) -> &[Crtc] {
        &self.crtcs
    }

    pub fn crtc(&self, index: usize) -> KResult<&Crtc> {
        self.crtcs.get(index).ok_or(KmsError::NoSuchCrtc(index))
    }

    pub fn outputs(&self) -> &[Output] {
        &self.outputs
    }

    pub fn output_mut(&mut self, index: usize) -> KResult<&mut Output> {
        self.outputs.get_mut(index).ok_or(KmsError::NoSuchOutput(index))
    }

    pub fn root(&self) -> &Bo {
        &self.root
    }

    pub fn screen_size(&self) -> (u32, u32) {
        (self.width, self.height)
    }

    pub fn registry(&self) -> &ScanoutRegistry {
        &self.registry
    }

    pub fn cursor(&self) -> Option<&CursorPlane> {
        self.cursor.as_ref()
    }

    pub fn pending_flips(&self) -> usize {
        self.pending_flips.len()
    }

    pub fn take_notifications(&mut self) -> Vec<Notification> {
        mem::take(&mut self.notifications)
    }

    fn notify(&mut self, notification: Notification) {
        debug!("flip: notify {:?}", notification);
        self.notifications.push(notification);
    }

    /// Routes an output to a CRTC, or unroutes it with `None`.
    pub fn route_output(&mut self, output: usize, crtc: Option<usize>) -> KResult<()> {
        if let Some(index) = crtc {
            self.crtc(index)?;
        }
        let out = self.outputs.get_mut(output).ok_or(KmsError::NoSuchOutput(output))?;
        if let Some(index) = crtc {
            if !out.can_drive(index) {
                return Err(KmsError::Property {
                    name: out.name.clone(),
                    reason: "encoder cannot drive the requested CRTC",
                });
            }
        }
        out.crtc = crtc;
        Ok(())
    }

    /// Connector ids of connected outputs routed to `crtc`.
    fn routed_connectors(&self, crtc: usize) -> Vec<u32> {
        self.outputs
            .iter()
            .filter(|o| o.crtc == Some(crtc) && o.is_connected())
            .map(|o| o.connector_id)
            .collect()
    }

    /// Brings the scanout table in line with the enabled CRTC geometries.
    pub fn reconcile(&mut self) -> KResult<()> {
        let geometries: Vec<Rect> = self.crtcs.iter().filter(|c| c.enabled).map(Crtc::geometry).collect();
        let dev = self.dev.clone();
        self.registry.reconcile(&geometries, |rect| Bo::create(&dev, screen_request(rect.width, rect.height)))?;
        if self.registry.take_resized() {
            self.notify(Notification::ScanoutChanged);
        }
        Ok(())
    }

    /// Copies the root buffer into every stale entry and marks it fresh.
    fn sync_entries(&mut self) -> KResult<()> {
        let root = BlitWindow::new(&self.root, 0, 0);
        for entry in self.registry.entries_mut().iter_mut().filter(|e| !e.valid) {
            let Some(bo) = entry.bo.as_ref() else { continue };
            let dst = BlitWindow::new(bo, entry.rect.x, entry.rect.y).with_size(entry.rect.width, entry.rect.height);
            let copied = copy_region(&dst, &root)?;
            debug!("flip: synced {:?} from root ({} bytes)", entry.rect, copied);
            entry.valid = true;
        }
        Ok(())
    }

    /// Copies every fresh entry back into the root buffer.
    fn copy_back(&self) -> KResult<()> {
        let root = BlitWindow::new(&self.root, 0, 0);
        for entry in self.registry.entries().iter().filter(|e| e.valid) {
            let Some(bo) = entry.bo.as_ref() else { continue };
            let src = BlitWindow::new(bo, entry.rect.x, entry.rect.y).with_size(entry.rect.width, entry.rect.height);
            let copied = copy_region(&root, &src)?;
            debug!("flip: copied {:?} back to root ({} bytes)", entry.rect, copied);
        }
        Ok(())
    }

    fn flip_target(&self, index: usize) -> KResult<Option<Target>> {
        let crtc = &self.crtcs[index];
        let rect = crtc.geometry();
        if !crtc.enabled || rect.is_empty() {
            return Ok(None);
        }
        match self.registry.find_by_geometry(&rect).and_then(|e| e.bo.clone()) {
            Some(bo) => Ok(Some(Target { crtc: index, bo, x: 0, y: 0 })),
            None => Err(KmsError::ScanoutAllocation {
                rect,
                cause: ScanoutAllocCause::Capacity { capacity: self.registry.capacity() },
            }),
        }
    }

    fn blit_target(&self, index: usize) -> Option<Target> {
        let crtc = &self.crtcs[index];
        if !crtc.enabled || crtc.mode.is_none() {
            return None;
        }
        let Some((x, y)) = pan_offset(crtc.x, crtc.y) else {
            warn!("flip: CRTC {} has a negative offset {},{}, skipped", crtc.id, crtc.x, crtc.y);
            return None;
        };
        Some(Target { crtc: index, bo: self.root.clone(), x, y })
    }

    fn flip_targets(&self) -> KResult<Vec<Target>> {
        let mut targets = Vec::new();
        for index in 0..self.crtcs.len() {
            if let Some(target) = self.flip_target(index)? {
                targets.push(target);
            }
        }
        Ok(targets)
    }

    fn blit_targets(&self) -> Vec<Target> {
        (0..self.crtcs.len()).filter_map(|i| self.blit_target(i)).collect()
    }

    /// Programs every target in order. On failure the failing CRTC is turned
    /// off and left disabled until its next mode set, and the
    /// already-programmed ones are put back as they were.
    fn program_all(&mut self, targets: Vec<Target>) -> KResult<()> {
        let dev = self.dev.clone();
        let mut log: TransactionLog = Vec::with_capacity(targets.len());

        for target in targets {
            let outputs = self.routed_connectors(target.crtc);
            let crtc = &mut self.crtcs[target.crtc];
            let prior = crtc.scanout().cloned();

            if let Err(err) = crtc.program(dev.drm(), &target.bo, target.x, target.y, &outputs) {
                error!("flip: {}", err);
                match crtc.disable(dev.drm()) {
                    Ok(()) => {
                        crtc.enabled = false;
                        warn!("flip: CRTC {} turned off, needs a mode set", crtc.id);
                    }
                    Err(e) => error!("flip: could not turn off CRTC {} after failure: {}", crtc.id, e),
                }
                let err = self.unwind(log, err);
                if let Err(e) = self.reconcile() {
                    warn!("flip: scanout table left incomplete: {}", e);
                }
                self.notify(Notification::ModeSet { crtc: target.crtc, success: false });
                return Err(err);
            }
            log.push((target.crtc, prior));
        }
        Ok(())
    }

    fn unwind(&mut self, log: TransactionLog, cause: KmsError) -> KmsError {
        let dev = self.dev.clone();
        let mut failed = Vec::new();

        for (index, prior) in log.into_iter().rev() {
            let outputs = self.routed_connectors(index);
            let crtc = &mut self.crtcs[index];
            let result = match &prior {
                Some(src) => crtc.program(dev.drm(), &src.bo, src.x, src.y, &outputs),
                None => crtc.disable(dev.drm()),
            };
            match result {
                Ok(()) => debug!("flip: rolled back CRTC {}", crtc.id),
                Err(e) => {
                    error!("flip: rollback of CRTC {} failed: {}", crtc.id, e);
                    failed.push(crtc.id);
                }
            }
        }

        if failed.is_empty() {
            cause
        } else {
            KmsError::RollbackFailed { cause: Box::new(cause), crtcs: failed }
        }
    }

    /// Blit -> Flip: give every enabled CRTC its own up-to-date buffer.
    pub fn enter_flip_mode(&mut self) -> KResult<()> {
        match self.mode {
            ScanoutMode::Flip => return Ok(()),
            ScanoutMode::Blit if self.config.flip => {}
            from => return Err(KmsError::InvalidTransition { from, to: ScanoutMode::Flip }),
        }

        self.reconcile()?;
        let result = self.sync_entries().and_then(|()| self.flip_targets()).and_then(|t| self.program_all(t));
        if let Err(e) = result {
            // Still blitting: the root buffer stays authoritative.
            self.registry.invalidate_all();
            return Err(e);
        }

        self.mode = ScanoutMode::Flip;
        info!("flip: entered flip mode ({} scanouts)", self.registry.len());
        self.notify(Notification::ScanoutChanged);
        Ok(())
    }

    /// Flip -> Blit: fold every per-CRTC buffer back into the root buffer.
    pub fn enter_blit_mode(&mut self) -> KResult<()> {
        match self.mode {
            ScanoutMode::Blit => return Ok(()),
            ScanoutMode::Flip => {}
            from => return Err(KmsError::InvalidTransition { from, to: ScanoutMode::Blit }),
        }

        self.drain_flips()?;
        self.copy_back()?;
        let targets = self.blit_targets();
        self.program_all(targets)?;

        self.registry.invalidate_all();
        self.mode = ScanoutMode::Blit;
        info!("flip: entered blit mode");
        self.notify(Notification::ScanoutChanged);
        Ok(())
    }

    /// Sets `mode` on a CRTC. On failure the CRTC keeps its previous mode,
    /// offset and rotation.
    pub fn set_mode(&mut self, crtc: usize, mode: DisplayMode, rotation: Rotation, x: i32, y: i32) -> KResult<()> {
        let saved = self.crtc(crtc)?.save();
        let mode_name = mode.name.clone();

        match self.try_set_mode(crtc, mode, rotation, x, y) {
            Ok(()) => {
                if self.mode == ScanoutMode::Disabled {
                    self.mode = ScanoutMode::Blit;
                }
                for output in self.outputs.iter().filter(|o| o.crtc == Some(crtc)) {
                    if let Err(e) = output.set_dpms(self.dev.drm(), DpmsMode::On) {
                        warn!("flip: {}: could not turn on: {}", output.name, e);
                    }
                }
                info!("flip: CRTC {} set to {} at {},{}", self.crtcs[crtc].id, mode_name, x, y);
                self.notify(Notification::ModeSet { crtc, success: true });
                self.notify(Notification::ScanoutChanged);
                Ok(())
            }
            Err(e) => {
                error!("flip: failed to set mode {} on CRTC {}: {}", mode_name, self.crtcs[crtc].id, e);
                self.crtcs[crtc].restore(saved);
                if let Err(e) = self.reconcile() {
                    warn!("flip: scanout table left incomplete: {}", e);
                }
                if self.mode == ScanoutMode::Flip {
                    self.adopt_scanout(crtc);
                }
                self.notify(Notification::ModeSet { crtc, success: false });
                Err(e)
            }
        }
    }

    fn try_set_mode(&mut self, index: usize, mode: DisplayMode, rotation: Rotation, x: i32, y: i32) -> KResult<()> {
        let dev = self.dev.clone();
        let Some((px, py)) = pan_offset(x, y) else {
            return Err(KmsError::Program { crtc: self.crtcs[index].id, cause: ProgramCause::Offset { x, y } });
        };
        {
            let crtc = &mut self.crtcs[index];
            crtc.mode = Some(mode);
            crtc.x = x;
            crtc.y = y;
            crtc.rotation = rotation;
            crtc.enabled = true;
        }

        let outputs = self.routed_connectors(index);
        if outputs.is_empty() {
            return Err(KmsError::Program { crtc: self.crtcs[index].id, cause: ProgramCause::NoOutputs });
        }

        let crtc = &self.crtcs[index];
        if crtc.gamma_size > 0 {
            let ramp = crtc.linear_gamma();
            crtc.set_gamma(dev.drm(), &ramp, &ramp, &ramp);
        }

        self.reconcile()?;

        let (bo, px, py) = if self.mode == ScanoutMode::Flip {
            self.sync_entries()?;
            match self.flip_target(index)? {
                Some(t) => (t.bo, t.x, t.y),
                None => return Err(KmsError::Program { crtc: self.crtcs[index].id, cause: ProgramCause::NoMode }),
            }
        } else {
            (self.root.clone(), px, py)
        };

        self.crtcs[index].program(dev.drm(), &bo, px, py, &outputs)
    }

    /// After a failed mode set in flip mode, the CRTC still shows its old
    /// buffer; make the table entry for its geometry point at it.
    fn adopt_scanout(&mut self, index: usize) {
        let crtc = &self.crtcs[index];
        let Some(src) = crtc.scanout() else { return };
        if let Some(entry) = self.registry.find_by_geometry_mut(&crtc.geometry()) {
            entry.bo = Some(src.bo.clone());
            entry.valid = true;
        }
    }

    /// Pans the primary output's CRTC to (`x`, `y`).
    pub fn adjust_frame(&mut self, x: i32, y: i32) -> KResult<()> {
        let Some(index) = self.outputs.iter().find_map(|o| o.crtc) else {
            return Ok(());
        };
        let crtc = &self.crtcs[index];
        let Some(mode) = crtc.mode.clone().filter(|_| crtc.enabled) else {
            return Ok(());
        };
        let rotation = crtc.rotation;
        self.set_mode(index, mode, rotation, x, y)
    }

    /// Turns a CRTC off and drops its scanout entry.
    pub fn disable_crtc(&mut self, index: usize) -> KResult<()> {
        let dev = self.dev.clone();
        let crtc = self.crtcs.get_mut(index).ok_or(KmsError::NoSuchCrtc(index))?;
        crtc.disable(dev.drm())?;
        crtc.enabled = false;
        info!("flip: CRTC {} turned off", crtc.id);
        self.reconcile()
    }

    /// Reallocates the root buffer for a new virtual screen size and returns
    /// its pitch. The old contents are kept where they fit.
    pub fn resize(&mut self, width: u32, height: u32) -> KResult<u32> {
        match self.try_resize(width, height) {
            Ok(pitch) => {
                self.notify(Notification::Resize { width, height, pitch: Some(pitch) });
                Ok(pitch)
            }
            Err(e) => {
                error!("flip: resize to {}x{} failed: {}", width, height, e);
                self.notify(Notification::Resize { width, height, pitch: None });
                Err(e)
            }
        }
    }

    fn try_resize(&mut self, width: u32, height: u32) -> KResult<u32> {
        check_screen_size(width, height, self.min_size, self.max_size)?;
        if (width, height) == (self.width, self.height) {
            return Ok(self.root.pitch());
        }

        debug!("flip: allocating new root buffer {}x{}", width, height);
        let new_root = Bo::create(&self.dev, screen_request(width, height))?;
        new_root.clear()?;
        copy_region(&BlitWindow::new(&new_root, 0, 0), &BlitWindow::new(&self.root, 0, 0))?;

        let old_root = mem::replace(&mut self.root, new_root);
        let old_size = (self.width, self.height);
        (self.width, self.height) = (width, height);

        let result = self.reconcile().and_then(|()| match self.mode {
            ScanoutMode::Flip => self.sync_entries(),
            _ => {
                let targets = self.blit_targets();
                self.program_all(targets)
            }
        });

        if let Err(e) = result {
            self.root = old_root;
            (self.width, self.height) = old_size;
            return Err(e);
        }
        Ok(self.root.pitch())
    }

    /// Queues a flip of `bo` onto a CRTC and returns the completion token.
    pub fn page_flip(&mut self, crtc: usize, bo: &Bo) -> KResult<u64> {
        if self.mode != ScanoutMode::Flip {
            return Err(KmsError::InvalidTransition { from: self.mode, to: ScanoutMode::Flip });
        }
        let target = self.crtc(crtc)?;
        let crtc_id = target.id;
        let rect = target.geometry();
        if bo.bytes_per_pixel() != self.root.bytes_per_pixel() || bo.width() < rect.width || bo.height() < rect.height {
            warn!("flip: bo {} ({}x{}@{}) cannot cover {:?} on CRTC {}",
                bo.handle(), bo.width(), bo.height(), bo.bpp(), rect, crtc_id);
            return Err(KmsError::Program {
                crtc: crtc_id,
                cause: ProgramCause::Device(DrmError::new("page_flip", errno::EINVAL)),
            });
        }
        let fb_id = bo.bind_framebuffer()?;
        let token = self.next_flip_token;
        self.dev
            .drm()
            .page_flip(crtc_id, fb_id, token)
            .map_err(|e| KmsError::Program { crtc: crtc_id, cause: ProgramCause::Device(e) })?;
        self.next_flip_token += 1;
        self.pending_flips.insert(token, PendingFlip { crtc, bo: bo.clone() });
        debug!("flip: queued flip {} of bo {} on CRTC {}", token, bo.handle(), crtc_id);
        Ok(token)
    }

    /// Reads one batch of device events and applies completed flips.
    pub fn handle_events(&mut self) -> KResult<usize> {
        let events = self.dev.drm().read_events()?;
        Ok(self.dispatch(events))
    }

    fn dispatch(&mut self, events: Vec<DrmEvent>) -> usize {
        let mut completed = 0;
        for event in events {
            let DrmEvent::PageFlip(flip) = event else { continue };
            let Some(pending) = self.pending_flips.remove(&flip.user_data) else {
                warn!("flip: completion for unknown token {}", flip.user_data);
                continue;
            };
            let rect = self.crtcs[pending.crtc].geometry();
            self.registry.set_by_geometry(&rect, pending.bo.clone());
            self.crtcs[pending.crtc].record_flip(pending.bo);
            completed += 1;
        }
        completed
    }

    /// Waits for every queued flip to complete.
    fn drain_flips(&mut self) -> KResult<()> {
        let mut empty_reads = 0;
        while !self.pending_flips.is_empty() {
            let events = self.dev.drm().read_events()?;
            if events.is_empty() {
                empty_reads += 1;
                if empty_reads >= self.config.flip_drain_max_polls {
                    warn!("flip: {} flips still pending after {} reads", self.pending_flips.len(), empty_reads);
                    return Err(KmsError::FlipDrainStalled { pending: self.pending_flips.len() });
                }
                continue;
            }
            empty_reads = 0;
            self.dispatch(events);
        }
        Ok(())
    }

    pub fn set_gamma(&self, crtc: usize, red: &[u16], green: &[u16], blue: &[u16]) -> KResult<()> {
        self.crtc(crtc)?.set_gamma(self.dev.drm(), red, green, blue);
        Ok(())
    }

    pub fn show_cursor(&mut self, crtc: usize) -> KResult<()> {
        let crtc = self.crtcs.get(crtc).ok_or(KmsError::NoSuchCrtc(crtc))?;
        self.cursor.as_mut().ok_or(KmsError::CursorUnavailable)?.show(crtc)
    }

    pub fn hide_cursor(&mut self) -> KResult<()> {
        self.cursor.as_mut().ok_or(KmsError::CursorUnavailable)?.hide()
    }

    pub fn move_cursor(&mut self, crtc: usize, x: i32, y: i32) -> KResult<()> {
        let crtc = self.crtcs.get(crtc).ok_or(KmsError::NoSuchCrtc(crtc))?;
        self.cursor.as_mut().ok_or(KmsError::CursorUnavailable)?.move_to(crtc, x, y)
    }

    pub fn load_cursor(&mut self, argb: &[u32]) -> KResult<()> {
        self.cursor.as_mut().ok_or(KmsError::CursorUnavailable)?.load_image(argb)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::drivers::vkms::VirtualDrm;

    fn setup(config: KmsConfig) -> (Arc<VirtualDrm>, ModeSwitchEngine) {
        let drm = Arc::new(VirtualDrm::builder().crtcs(2).connector(11, 640, 480).connector(10, 320, 240).build());
        let engine = ModeSwitchEngine::new(drm.clone(), config, 960, 480).unwrap();
        (drm, engine)
    }

    fn bring_up(engine: &mut ModeSwitchEngine) {
        engine.set_mode(0, DisplayMode::new(640, 480, 60), Rotation::ROTATE_0, 0, 0).unwrap();
        engine.set_mode(1, DisplayMode::new(320, 240, 60), Rotation::ROTATE_0, 640, 0).unwrap();
    }

    #[test]
    fn test_first_mode_set_enters_blit() {
        let (drm, mut engine) = setup(KmsConfig::default());
        assert_eq!(engine.mode(), ScanoutMode::Disabled);
        assert!(matches!(engine.enter_flip_mode(), Err(KmsError::InvalidTransition { .. })));

        bring_up(&mut engine);
        assert_eq!(engine.mode(), ScanoutMode::Blit);
        let state = drm.crtc_state(engine.crtcs()[1].id).unwrap();
        assert_eq!((state.x, state.y), (640, 0));
        assert_eq!(drm.fb_handle(state.fb_id.unwrap()), Some(engine.root().handle()));
        assert!(engine.take_notifications().contains(&Notification::ModeSet { crtc: 1, success: true }));
    }

    #[test]
    fn test_failed_mode_set_restores_crtc() {
        let (drm, mut engine) = setup(KmsConfig::default());
        bring_up(&mut engine);
        let before = engine.crtcs()[0].save();
        engine.take_notifications();

        drm.fail_crtc(engine.crtcs()[0].id, errno::EINVAL);
        let err = engine.set_mode(0, DisplayMode::new(800, 480, 60), Rotation::ROTATE_0, 10, 0).unwrap_err();
        assert_eq!(err.errno(), Some(errno::EINVAL));
        assert_eq!(engine.crtcs()[0].save(), before);
        assert!(engine.take_notifications().contains(&Notification::ModeSet { crtc: 0, success: false }));
    }

    #[test]
    fn test_mode_set_without_outputs() {
        let (_drm, mut engine) = setup(KmsConfig::default());
        engine.route_output(0, None).unwrap();
        let err = engine.set_mode(0, DisplayMode::new(640, 480, 60), Rotation::ROTATE_0, 0, 0).unwrap_err();
        assert!(matches!(err, KmsError::Program { cause: ProgramCause::NoOutputs, .. }));
        assert!(!engine.crtcs()[0].enabled);
        assert_eq!(engine.mode(), ScanoutMode::Disabled);
    }

    #[test]
    fn test_flip_disabled_by_config() {
        let config = KmsConfig { flip: false, ..KmsConfig::default() };
        let (_drm, mut engine) = setup(config);
        bring_up(&mut engine);
        assert!(matches!(
            engine.enter_flip_mode(),
            Err(KmsError::InvalidTransition { from: ScanoutMode::Blit, to: ScanoutMode::Flip })
        ));
    }

    #[test]
    fn test_mode_set_in_flip_mode_resyncs() {
        let (drm, mut engine) = setup(KmsConfig::default());
        bring_up(&mut engine);
        engine.enter_flip_mode().unwrap();

        engine.set_mode(1, DisplayMode::new(320, 200, 60), Rotation::ROTATE_0, 640, 0).unwrap();
        assert_eq!(engine.mode(), ScanoutMode::Flip);
        let rect = engine.crtcs()[1].geometry();
        let entry = engine.registry().find_by_geometry(&rect).unwrap();
        assert!(entry.valid);
        let state = drm.crtc_state(engine.crtcs()[1].id).unwrap();
        assert_eq!(drm.fb_handle(state.fb_id.unwrap()), Some(entry.bo.as_ref().unwrap().handle()));
        assert_eq!((state.x, state.y), (0, 0));
    }

    #[test]
    fn test_flip_drain_stalls() {
        let (drm, mut engine) = setup(KmsConfig::default());
        bring_up(&mut engine);
        engine.enter_flip_mode().unwrap();
        let rect = engine.crtcs()[0].geometry();
        let bo = engine.registry().find_by_geometry(&rect).unwrap().bo.clone().unwrap();

        drm.delay_flip_events(usize::MAX);
        engine.page_flip(0, &bo).unwrap();
        let err = engine.enter_blit_mode().unwrap_err();
        assert!(matches!(err, KmsError::FlipDrainStalled { pending: 1 }));
        assert_eq!(engine.mode(), ScanoutMode::Flip);
    }

    #[test]
    fn test_page_flip_requires_flip_mode() {
        let (_drm, mut engine) = setup(KmsConfig::default());
        bring_up(&mut engine);
        let root = engine.root().clone();
        assert!(matches!(engine.page_flip(0, &root), Err(KmsError::InvalidTransition { .. })));
    }

    #[test]
    fn test_resize_reports_pitch() {
        let (_drm, mut engine) = setup(KmsConfig::default());
        bring_up(&mut engine);
        engine.take_notifications();

        let pitch = engine.resize(1366, 768).unwrap();
        assert_eq!(pitch, 5504);
        assert_eq!(engine.screen_size(), (1366, 768));
        assert!(engine.take_notifications().contains(&Notification::Resize { width: 1366, height: 768, pitch: Some(5504) }));

        assert!(engine.resize(100, 100).is_err());
        assert_eq!(engine.screen_size(), (1366, 768));
        assert!(engine.take_notifications().contains(&Notification::Resize { width: 100, height: 100, pitch: None }));
    }

    #[test]
    fn test_resize_beyond_device_limit() {
        let (drm, mut engine) = setup(KmsConfig::default());
        bring_up(&mut engine);
        let root = engine.root().clone();
        let buffers = drm.buffer_count();

        let err = engine.resize(0x4000_0000, 200).unwrap_err();
        assert!(matches!(err, KmsError::Allocation { .. }));
        assert_eq!(err.errno(), Some(errno::EINVAL));
        assert!(matches!(engine.resize(960, 8193), Err(KmsError::Allocation { .. })));
        assert!(engine.root().ptr_eq(&root));
        assert_eq!(engine.screen_size(), (960, 480));
        assert_eq!(drm.buffer_count(), buffers);

        assert!(engine.resize(8192, 480).is_ok());
    }

    #[test]
    fn test_oversized_screen_rejected_at_bring_up() {
        let drm = Arc::new(VirtualDrm::builder().connector(11, 640, 480).build());
        let err = ModeSwitchEngine::new(drm, KmsConfig::default(), 9000, 480).err().unwrap();
        assert_eq!(err.errno(), Some(errno::EINVAL));
    }

    #[test]
    fn test_negative_offset_rejected() {
        let (drm, mut engine) = setup(KmsConfig::default());
        bring_up(&mut engine);
        let before = engine.crtcs()[1].save();
        let calls = drm.set_crtc_calls();

        let err = engine.set_mode(1, DisplayMode::new(320, 240, 60), Rotation::ROTATE_0, -10, 0).unwrap_err();
        assert!(matches!(err, KmsError::Program { cause: ProgramCause::Offset { x: -10, y: 0 }, .. }));
        assert_eq!(engine.crtcs()[1].save(), before);
        assert_eq!(drm.set_crtc_calls(), calls);
        assert!(matches!(engine.adjust_frame(0, -1), Err(KmsError::Program { cause: ProgramCause::Offset { .. }, .. })));
        assert_eq!((engine.crtcs()[0].x, engine.crtcs()[0].y), (0, 0));
    }

    #[test]
    fn test_page_flip_rejects_unfit_buffers() {
        let (drm, mut engine) = setup(KmsConfig::default());
        bring_up(&mut engine);
        engine.enter_flip_mode().unwrap();

        let shallow = Bo::create(engine.device(), BoRequest::Dimensions { width: 640, height: 480, depth: 16, bpp: 16 }).unwrap();
        let err = engine.page_flip(0, &shallow).unwrap_err();
        assert!(matches!(err, KmsError::Program { .. }));
        assert_eq!(err.errno(), Some(errno::EINVAL));

        let small = Bo::create(engine.device(), screen_request(320, 240)).unwrap();
        assert!(engine.page_flip(0, &small).is_err());
        assert!(engine.page_flip(1, &small).is_ok());

        assert_eq!(engine.handle_events().unwrap(), 1);
        assert_eq!(drm.pending_events(), 0);
        engine.enter_blit_mode().unwrap();
        assert_eq!(engine.mode(), ScanoutMode::Blit);
    }

    #[test]
    fn test_resize_allocation_failure_keeps_root() {
        let (drm, mut engine) = setup(KmsConfig::default());
        bring_up(&mut engine);
        let root = engine.root().clone();
        drm.inject(crate::drivers::vkms::Fault::CreateDumb, errno::ENOMEM);
        assert!(matches!(engine.resize(1920, 1080), Err(KmsError::Allocation { .. })));
        assert!(engine.root().ptr_eq(&root));
        assert_eq!(engine.screen_size(), (960, 480));
    }

    #[test]
    fn test_cursor_passthrough() {
        let (drm, mut engine) = setup(KmsConfig::default());
        bring_up(&mut engine);
        engine.show_cursor(1).unwrap();
        engine.move_cursor(1, 10, 20).unwrap();
        let plane = engine.cursor().unwrap().plane_id();
        let state = drm.plane_state(plane).unwrap();
        assert_eq!(state.crtc_id, engine.crtcs()[1].id);
        assert_eq!((state.config.crtc_x, state.config.crtc_y), (10, 20));
        assert!(matches!(engine.show_cursor(7), Err(KmsError::NoSuchCrtc(7))));

        let (_drm, mut bare) = setup(KmsConfig { hw_cursor: false, ..KmsConfig::default() });
        assert!(matches!(bare.hide_cursor(), Err(KmsError::CursorUnavailable)));
    }
}
