//! Detection engine
//!
//! One engine drives one physical detector instance on behalf of every
//! listener attached to it. Client operations run under the primary engine
//! lock; the capture thread and the session callback share the same state
//! through [`EngineInner`].

use crate::capture::MmapWindow;
use crate::config::{ConfigError, EngineSettings, ParamKind};
use crate::coordinator::Coordinator;
use crate::dispatcher::EndOfStreamSignal;
use crate::dump::DumpCounters;
use crate::echo_ref::EcRefTracker;
use crate::format::AudioFormat;
use crate::payload::{self, PayloadError, SessionPayloadBuilder};
use crate::registry::ModuleType;
use crate::ring_buffer::{RingBuffer, RingBufferError, RingBufferReader};
use crate::session::{
    CaptureSession, DeviceId, Listener, ListenerError, ListenerId, MergedModel, ResourceManager,
    SessionError, SessionEvent, SessionParam, VoiceUi,
};
use crate::state::{EngineState, StateCell};
use cache_padded::CachePadded;
use parking_lot::{Condvar, Mutex};
use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};
use thiserror::Error;
use tracing::{debug, error, info, warn};

/// Module tag of the echo-cancellation / noise-suppression module that
/// reports direction of arrival
pub const ECNS_TAG_ID: u32 = 0xC000_0018;

/// Response size of a module version query
const MODULE_VERSION_QUERY_SIZE: usize = 8;

#[derive(Error, Debug)]
pub enum EngineError {
    #[error("Invalid argument: {0}")]
    InvalidArgument(String),

    #[error("Resource exhausted: {0}")]
    ResourceExhausted(String),

    #[error("Protocol error: {0}")]
    Protocol(String),

    #[error("Capture device disconnected")]
    DeviceDisconnected,

    #[error("Session error: {0}")]
    Session(String),

    #[error("Listener error: {0}")]
    Listener(#[from] ListenerError),

    #[error("Ring buffer error: {0}")]
    RingBuffer(#[from] RingBufferError),

    #[error("Payload error: {0}")]
    Payload(#[from] PayloadError),

    #[error("Configuration error: {0}")]
    Config(#[from] ConfigError),
}

impl From<SessionError> for EngineError {
    fn from(e: SessionError) -> Self {
        match e {
            SessionError::DeviceDisconnected => EngineError::DeviceDisconnected,
            SessionError::InvalidArgument(msg) => EngineError::InvalidArgument(msg),
            other => EngineError::Session(other.to_string()),
        }
    }
}

/// Parameters readable through [`DetectionEngine::get_parameter`]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ParamId {
    KwTransferLatency,
    DirectionOfArrival,
    WakeupModuleVersion,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ParamValue {
    KwTransferLatencyMs(u64),
    Raw(Vec<u8>),
}

/// Collaborators an engine is built on
#[derive(Clone)]
pub struct EngineDeps {
    pub session: Arc<dyn CaptureSession>,
    pub resources: Arc<dyn ResourceManager>,
    pub voice_ui: Arc<dyn VoiceUi>,
}

/// State guarded by the primary engine lock
pub(crate) struct EngineCore {
    pub(crate) coordinator: Coordinator,
    pub(crate) builder: SessionPayloadBuilder,
    pub(crate) buffer: Option<Arc<RingBuffer>>,

    pub(crate) detection_queue: VecDeque<ListenerId>,
    pub(crate) first_detected: Option<ListenerId>,
    pub(crate) detection_pending: bool,
    pub(crate) detection_time: Option<Instant>,

    pub(crate) mmap: MmapWindow,
    pub(crate) custom_detection_event: Option<Vec<u8>>,
    pub(crate) merged_model: Vec<u8>,
    pub(crate) pdk_model: Option<Vec<u8>>,
    pub(crate) deregister_model_id: u32,
    pub(crate) use_lpi: bool,
    pub(crate) dev_disconnect_count: usize,
    pub(crate) dumps: DumpCounters,
}

/// State shared by the client API, the capture thread and the session
/// callback
pub(crate) struct EngineInner {
    pub(crate) module_type: ModuleType,
    pub(crate) owner: ListenerId,
    pub(crate) settings: EngineSettings,
    pub(crate) format: AudioFormat,

    pub(crate) session: Arc<dyn CaptureSession>,
    pub(crate) resources: Arc<dyn ResourceManager>,
    pub(crate) voice_ui: Arc<dyn VoiceUi>,

    pub(crate) core: Mutex<EngineCore>,
    pub(crate) state: StateCell,
    pub(crate) detection_cv: Condvar,
    pub(crate) eos: EndOfStreamSignal,

    pub(crate) exit_buffering: CachePadded<AtomicBool>,
    pub(crate) exit_thread: CachePadded<AtomicBool>,

    pub(crate) kw_transfer_latency_ms: AtomicU64,
    pub(crate) ec_ref: Mutex<EcRefTracker>,
}

/// Holds the platform wake lock for its lifetime
struct WakeLockGuard<'a> {
    resources: &'a dyn ResourceManager,
}

impl<'a> WakeLockGuard<'a> {
    fn acquire(resources: &'a dyn ResourceManager) -> Self {
        resources.acquire_wake_lock();
        Self { resources }
    }
}

impl Drop for WakeLockGuard<'_> {
    fn drop(&mut self) {
        self.resources.release_wake_lock();
    }
}

impl EngineInner {
    /// Map failures caused by a lost device or an offline sound card to
    /// success; the outer layer resynchronises after reconnect
    fn absorb(&self, result: Result<(), EngineError>) -> Result<(), EngineError> {
        match result {
            Err(EngineError::DeviceDisconnected) => {
                info!("Device disconnected, report success");
                Ok(())
            }
            Err(e) if !self.resources.card_online() => {
                info!("Sound card offline, ignore failure: {}", e);
                Ok(())
            }
            other => other,
        }
    }

    /// Build and send the session write for `kind`
    pub(crate) fn write_param(&self, core: &mut EngineCore, kind: ParamKind) -> Result<(), EngineError> {
        let per_model = self.module_type.is_per_model();
        let body = match kind {
            ParamKind::LoadSoundModel if per_model => core.pdk_model.clone().unwrap_or_default(),
            ParamKind::LoadSoundModel => core.merged_model.clone(),
            ParamKind::UnloadSoundModel if per_model => {
                payload::deregister_model(core.deregister_model_id)
            }
            ParamKind::UnloadSoundModel => Vec::new(),
            ParamKind::WakeupConfig if per_model => core.coordinator.pdk_wakeup_config().encode()?,
            ParamKind::WakeupConfig => core.coordinator.wakeup_config().encode()?,
            ParamKind::BufferingConfig => core.coordinator.buffering_config().encode(per_model),
            ParamKind::EngineReset | ParamKind::ModuleVersion => Vec::new(),
            ParamKind::CustomConfig => core.coordinator.take_custom_data(),
        };

        let write = core
            .builder
            .build(self.session.as_ref(), core.use_lpi, kind, &body)?;
        debug!(
            "Writing {:?} to tag {:#x}, {} bytes",
            kind,
            write.tag_id,
            write.payload.len()
        );
        self.session
            .set_parameters(write.tag_id, write.param, &write.payload)
            .map_err(|e| {
                error!("Failed to write {:?}: {}", kind, e);
                e.into()
            })
    }

    fn update_configs(&self, core: &mut EngineCore) -> Result<(), EngineError> {
        if self.settings.model.wakeup_config_supported {
            self.write_param(core, ParamKind::WakeupConfig)?;
        } else if core.coordinator.has_custom_data()
            && self.settings.model.module_param(ParamKind::CustomConfig).is_some()
        {
            self.write_param(core, ParamKind::CustomConfig)?;
        }
        self.write_param(core, ParamKind::BufferingConfig)
    }

    fn install_model(&self, core: &mut EngineCore, merged: MergedModel) {
        debug!(
            "Installing merged model: {} bytes, {} keyword slots",
            merged.data.len(),
            merged.layout.len()
        );
        core.merged_model = merged.data;
        core.coordinator.set_layout(merged.layout);
    }

    fn close_quietly(&self, listener: ListenerId) {
        if let Err(e) = self.session.close(listener) {
            error!("Failed to close session: {}", e);
        }
    }

    /// Push configuration, prepare and start the shared session
    fn process_start(&self, core: &mut EngineCore, listener: ListenerId) -> Result<(), EngineError> {
        let _wake_lock = WakeLockGuard::acquire(self.resources.as_ref());
        debug!("Start recognition for listener {}", listener);
        core.custom_detection_event = None;

        if self.module_type.is_per_model() {
            let own_model = core.coordinator.find(listener).map(|l| l.model_id());
            let mut models = core.coordinator.updated_models().to_vec();
            if let Some(model_id) = own_model {
                models.retain(|id| *id != model_id);
                // Selected last so it stays the current per-model config
                models.push(model_id);
            }
            for model_id in models {
                core.coordinator.select_model(model_id);
                self.update_configs(core)?;
            }
            core.coordinator.clear_updated_models();
        } else {
            self.update_configs(core)?;
        }

        self.session.prepare(listener)?;

        if core.mmap.enabled() && core.mmap.region.is_none() {
            let frames = self.format.bytes_to_frames(core.mmap.size_bytes);
            let region = self.session.create_mmap_buffer(listener, frames)?;
            core.mmap.size_bytes = self.format.frames_to_bytes(region.frames());
            info!(
                "Created mmap buffer: {} frames, {} bytes",
                region.frames(),
                core.mmap.size_bytes
            );
            core.mmap.region = Some(region);
        }

        self.session.start(listener)?;

        if core.mmap.region.is_some() {
            core.mmap.write_position = 0;
            if let Err(e) = self.session.reset_mmap_buffer(listener) {
                error!("Failed to reset mmap buffer: {}", e);
            }
        }

        self.exit_buffering.store(false, Ordering::Release);
        self.state.transition(EngineState::Active);
        Ok(())
    }

    /// Reset the detector and stop the shared session
    fn process_stop(&self, core: &mut EngineCore, listener: ListenerId) -> Result<(), EngineError> {
        let _wake_lock = WakeLockGuard::acquire(self.resources.as_ref());
        debug!("Stop recognition for listener {}", listener);

        if let Some(buffer) = &core.buffer {
            buffer.reset();
        }
        core.detection_queue.clear();

        if let Err(e) = self.write_param(core, ParamKind::EngineReset) {
            error!("Failed to reset engine: {}", e);
        }

        let result = self.session.stop(listener);
        if let Err(e) = &result {
            error!("Failed to stop session: {}", e);
        }
        self.state.transition(EngineState::Loaded);
        result.map_err(EngineError::from)
    }

    pub(crate) fn start_recognition(&self, listener: ListenerId) -> Result<(), EngineError> {
        self.exit_buffering.store(true, Ordering::Release);
        let mut core = self.core.lock();
        self.voice_ui.set_model_state(listener, true);

        let state = self.state.get();
        if state == EngineState::Idle {
            warn!("No sound model loaded, ignore start for listener {}", listener);
            return Ok(());
        }

        // Restart the shared session so it picks up the new configuration
        if state.is_active() {
            if let Some(first) = core.coordinator.first() {
                if let Err(e) = self.process_stop(&mut core, first.id()) {
                    error!("Failed to stop recognition: {}", e);
                }
            }
        }

        let result = self.process_start(&mut core, listener);
        self.absorb(result)
    }

    pub(crate) fn stop_recognition(&self, listener: ListenerId) -> Result<(), EngineError> {
        self.exit_buffering.store(true, Ordering::Release);
        let mut core = self.core.lock();
        self.voice_ui.set_model_state(listener, false);

        let state = self.state.get();
        if state == EngineState::Idle {
            debug!("Engine idle, nothing to stop");
            return Ok(());
        }

        let result = self.stop_locked(&mut core, listener, state.is_active());
        self.absorb(result)
    }

    fn stop_locked(
        &self,
        core: &mut EngineCore,
        listener: ListenerId,
        was_active: bool,
    ) -> Result<(), EngineError> {
        self.process_stop(core, listener)?;

        if !was_active || !core.coordinator.others_active(listener) {
            return Ok(());
        }

        core.coordinator.update_on_stop(listener);
        if self.module_type.is_per_model() {
            if let Some(stopped) = core.coordinator.find(listener) {
                core.coordinator.disable_model(stopped.model_id());
            }
        }

        match core.coordinator.first_other(listener) {
            Some(other) => {
                info!("Restart recognition for remaining listener {}", other.id());
                self.process_start(core, other.id())
            }
            None => Ok(()),
        }
    }

    pub(crate) fn restart_recognition(&self, listener: ListenerId) -> Result<(), EngineError> {
        let mut core = self.core.lock();

        if !self.state.is_active() {
            debug!("Engine not active, nothing to restart");
            return Ok(());
        }

        if self.settings.platform.concurrent_event_capture
            && (!core.detection_queue.is_empty() || core.coordinator.others_buffering(listener))
        {
            debug!(
                "Restart for listener {} deferred, detection still being buffered",
                listener
            );
            return Ok(());
        }

        let result = self.restart_locked(&mut core, listener);
        self.absorb(result)
    }

    fn restart_locked(&self, core: &mut EngineCore, listener: ListenerId) -> Result<(), EngineError> {
        debug!("Restart recognition for listener {}", listener);
        self.exit_buffering.store(true, Ordering::Release);

        if let Some(buffer) = &core.buffer {
            buffer.reset();
        }
        core.custom_detection_event = None;
        core.detection_queue.clear();

        self.eos.arm();
        let result = self.write_param(core, ParamKind::EngineReset);
        match &result {
            Ok(()) => {
                let timeout = Duration::from_millis(self.settings.platform.eos_timeout_ms);
                if !self.eos.wait(timeout) {
                    debug!("No end of stream within {}ms", timeout.as_millis());
                }
            }
            Err(e) => error!("Failed to reset engine: {}", e),
        }

        if core.mmap.region.is_some() {
            match self.session.mmap_position(listener) {
                Ok(position) => core.mmap.write_position = position,
                Err(e) => error!("Failed to read mmap position: {}", e),
            }
            if let Err(e) = self.session.reset_mmap_buffer(listener) {
                error!("Failed to reset mmap buffer: {}", e);
            }
            let frames = self.format.bytes_to_frames(core.mmap.size_bytes);
            if frames > 0 {
                core.mmap.write_position %= frames;
            }
            debug!("mmap write position resynced to {}", core.mmap.write_position);
        }

        self.exit_buffering.store(false, Ordering::Release);
        self.state.transition(EngineState::Active);
        result
    }

    pub(crate) fn load_model(&self, listener: &Arc<dyn Listener>, data: &[u8]) -> Result<(), EngineError> {
        if data.is_empty() {
            return Err(EngineError::InvalidArgument("empty sound model".to_string()));
        }

        let id = listener.id();
        let mut core = self.core.lock();
        info!("Load sound model for listener {}: {} bytes", id, data.len());

        if self.module_type.is_per_model() {
            let model_id = listener.model_id();
            core.coordinator.map_model(model_id, id);
            core.pdk_model = Some(payload::register_model(model_id, data));
        }

        let result = if core.coordinator.others_attached(id) {
            self.handle_multi_load(&mut core, id, data)
        } else {
            self.load_single(&mut core, id, data)
        };

        if result.is_ok() {
            core.coordinator.attach(Arc::clone(listener));
        }
        self.absorb(result)
    }

    fn load_single(&self, core: &mut EngineCore, listener: ListenerId, data: &[u8]) -> Result<(), EngineError> {
        self.session.open(listener)?;

        let merged = match self.voice_ui.update_engine_model(listener, Some(data)) {
            Ok(merged) => merged,
            Err(e) => {
                error!("Failed to merge sound model: {}", e);
                self.close_quietly(listener);
                return Err(e.into());
            }
        };
        self.install_model(core, merged);

        if let Err(e) = self.write_param(core, ParamKind::LoadSoundModel) {
            self.close_quietly(listener);
            return Err(e);
        }

        self.state.transition(EngineState::Loaded);
        Ok(())
    }

    /// Load an additional model into a session other listeners already use
    fn handle_multi_load(&self, core: &mut EngineCore, listener: ListenerId, data: &[u8]) -> Result<(), EngineError> {
        let first = core
            .coordinator
            .first()
            .map(|l| l.id())
            .ok_or_else(|| EngineError::InvalidArgument("no listener attached".to_string()))?;

        let was_active = self.state.is_active();
        if was_active {
            self.process_stop(core, first)?;
        }

        if self.module_type.is_per_model() {
            self.write_param(core, ParamKind::LoadSoundModel)?;
        } else {
            self.session.close(first)?;
            core.mmap.release();
            self.state.transition(EngineState::Idle);

            let merged = self.voice_ui.update_engine_model(listener, Some(data))?;
            self.install_model(core, merged);

            self.session.open(first)?;
            if let Err(e) = self.write_param(core, ParamKind::LoadSoundModel) {
                self.close_quietly(first);
                return Err(e);
            }
        }

        self.state.transition(EngineState::Loaded);

        if was_active {
            self.process_start(core, first)?;
        }
        Ok(())
    }

    pub(crate) fn unload_model(&self, listener: ListenerId) -> Result<(), EngineError> {
        let mut core = self.core.lock();
        let Some(attached) = core.coordinator.find(listener) else {
            warn!("Listener {} has no model loaded", listener);
            return Ok(());
        };
        info!("Unload sound model for listener {}", listener);

        let result = if core.coordinator.others_attached(listener) {
            self.handle_multi_unload(&mut core, listener)
        } else {
            self.unload_single(&mut core, listener)
        };

        core.coordinator.forget_updated(attached.model_id());
        core.coordinator.detach(listener);
        self.absorb(result)
    }

    fn unload_single(&self, core: &mut EngineCore, listener: ListenerId) -> Result<(), EngineError> {
        if self.state.is_active() {
            self.process_stop(core, listener)?;
        }

        self.session.close(listener)?;
        core.mmap.release();
        core.builder.clear_instance_ids();
        self.state.transition(EngineState::Idle);

        if self.module_type.is_per_model() {
            if let Some(attached) = core.coordinator.find(listener) {
                core.coordinator.erase_model(attached.model_id());
            }
            core.pdk_model = None;
        }

        let merged = self.voice_ui.update_engine_model(listener, None)?;
        self.install_model(core, merged);
        Ok(())
    }

    /// Remove one model while other listeners keep using the session
    fn handle_multi_unload(&self, core: &mut EngineCore, listener: ListenerId) -> Result<(), EngineError> {
        let other = core
            .coordinator
            .first_other(listener)
            .map(|l| l.id())
            .ok_or_else(|| EngineError::InvalidArgument("no other listener attached".to_string()))?;

        let was_active = self.state.is_active();
        if was_active {
            self.process_stop(core, listener)?;
        }

        if self.module_type.is_per_model() {
            let model_id = core.coordinator.find(listener).map_or(0, |l| l.model_id());
            if model_id == 0 {
                error!("Listener {} has no sound model id", listener);
                return Err(EngineError::InvalidArgument("invalid sound model id".to_string()));
            }
            core.deregister_model_id = model_id;
            self.write_param(core, ParamKind::UnloadSoundModel)?;
            core.coordinator.erase_model(model_id);
        } else {
            self.session.close(listener)?;
            core.mmap.release();
            self.state.transition(EngineState::Idle);

            core.coordinator.detach(listener);
            let merged = self.voice_ui.update_engine_model(listener, None)?;
            self.install_model(core, merged);

            self.session.open(other)?;
            if let Err(e) = self.write_param(core, ParamKind::LoadSoundModel) {
                self.close_quietly(other);
                return Err(e);
            }
            self.state.transition(EngineState::Loaded);
        }

        if was_active && core.coordinator.others_active(listener) {
            let target = if self.module_type.is_per_model() {
                core.coordinator.first_configured_listener().unwrap_or(other)
            } else {
                other
            };
            self.process_start(core, target)?;
        }
        Ok(())
    }

    pub(crate) fn update_conf_levels(&self, listener: ListenerId, levels: &[u8]) -> Result<(), EngineError> {
        let mut core = self.core.lock();
        let attached = core
            .coordinator
            .find(listener)
            .ok_or_else(|| EngineError::InvalidArgument(format!("listener {} not attached", listener)))?;

        if !self.module_type.is_per_model() {
            let expected = self.voice_ui.listener_conf_levels_size(listener);
            if expected != Some(levels.len()) {
                error!(
                    "Confidence level count {} does not match model keyword count {:?}",
                    levels.len(),
                    expected
                );
                return Err(EngineError::InvalidArgument(
                    "confidence level count mismatch".to_string(),
                ));
            }
        }

        core.coordinator.update_conf_levels(
            attached.as_ref(),
            levels,
            self.state.is_active(),
            self.settings.model.wakeup_config_supported,
        );
        Ok(())
    }

    pub(crate) fn update_buf_config(&self, listener: ListenerId, hist_ms: u32, pre_roll_ms: u32) -> Result<(), EngineError> {
        let mut core = self.core.lock();
        let attached = core
            .coordinator
            .find(listener)
            .ok_or_else(|| EngineError::InvalidArgument(format!("listener {} not attached", listener)))?;
        core.coordinator
            .update_buf_config(attached.as_ref(), hist_ms, pre_roll_ms);
        Ok(())
    }

    pub(crate) fn create_buffer(&self, size: usize, readers: usize) -> Result<Vec<RingBufferReader>, EngineError> {
        if size == 0 || readers == 0 {
            return Err(EngineError::InvalidArgument(format!(
                "invalid buffer size {} or reader count {}",
                size, readers
            )));
        }

        let mut core = self.core.lock();
        let buffer = if let Some(buffer) = core.buffer.clone() {
            buffer.reset();
            if buffer.capacity() != size {
                buffer.resize(size)?;
            }
            buffer
        } else {
            let buffer = Arc::new(RingBuffer::new(size)?);
            core.buffer = Some(Arc::clone(&buffer));
            buffer
        };

        Ok((0..readers).map(|_| buffer.new_reader()).collect())
    }

    pub(crate) fn get_parameter(&self, id: ParamId) -> Result<ParamValue, EngineError> {
        match id {
            ParamId::KwTransferLatency => Ok(ParamValue::KwTransferLatencyMs(
                self.kw_transfer_latency_ms.load(Ordering::Acquire),
            )),
            ParamId::DirectionOfArrival => {
                let value = self
                    .session
                    .get_parameters(ECNS_TAG_ID, SessionParam::DirectionOfArrival, &[])?;
                Ok(ParamValue::Raw(value))
            }
            ParamId::WakeupModuleVersion => {
                let core = self.core.lock();
                let (tag_id, param_id) = core.builder.module_ids(ParamKind::ModuleVersion)?;

                self.session.open_graph(self.owner)?;
                let queried = self.session.module_instance_id(tag_id).and_then(|miid| {
                    let query = payload::module_query(miid, param_id, MODULE_VERSION_QUERY_SIZE);
                    self.session
                        .get_parameters(tag_id, SessionParam::WakeupModuleVersion, &query)
                });
                self.session.close(self.owner)?;

                Ok(ParamValue::Raw(queried?))
            }
        }
    }

    pub(crate) fn connect_device(&self, listener: ListenerId, device: DeviceId) -> Result<(), EngineError> {
        let mut core = self.core.lock();
        let mut result = Ok(());
        if core.dev_disconnect_count == 0 {
            result = self.session.connect_device(listener, device);
        }
        if result.is_err() {
            core.dev_disconnect_count += 1;
        }
        debug!("Device disconnect count: {}", core.dev_disconnect_count);
        result.map_err(EngineError::from)
    }

    pub(crate) fn disconnect_device(&self, listener: ListenerId, device: DeviceId) -> Result<(), EngineError> {
        let mut core = self.core.lock();
        core.dev_disconnect_count += 1;
        let mut result = Ok(());
        if core.dev_disconnect_count == core.coordinator.len() {
            result = self.session.disconnect_device(listener, device);
        }
        if result.is_err() {
            core.dev_disconnect_count -= 1;
        }
        debug!("Device disconnect count: {}", core.dev_disconnect_count);
        result.map_err(EngineError::from)
    }

    pub(crate) fn setup_session_device(&self, listener: ListenerId, device: DeviceId) -> Result<(), EngineError> {
        let mut core = self.core.lock();
        core.dev_disconnect_count = core.dev_disconnect_count.saturating_sub(1);
        let mut result = Ok(());
        if core.dev_disconnect_count == 0 {
            result = self.session.setup_device(listener, device);
        }
        if result.is_err() {
            core.dev_disconnect_count += 1;
        }
        debug!("Device disconnect count: {}", core.dev_disconnect_count);
        result.map_err(EngineError::from)
    }

    pub(crate) fn set_ec_ref(
        &self,
        listener: ListenerId,
        device: Option<DeviceId>,
        enable: bool,
        first_time: bool,
    ) -> Result<(), EngineError> {
        let uses_external = device.is_some_and(|d| self.resources.is_external_ec_ref_enabled(d));
        self.ec_ref.lock().set(
            self.session.as_ref(),
            listener,
            device,
            uses_external,
            enable,
            first_time,
        )
    }

    pub(crate) fn reconfigure_detection_graph(&self, listener: ListenerId) -> Result<(), EngineError> {
        let mut core = self.core.lock();
        let result = self.reconfigure_locked(&mut core, listener);
        self.absorb(result)
    }

    fn reconfigure_locked(&self, core: &mut EngineCore, listener: ListenerId) -> Result<(), EngineError> {
        let Some(detached) = core.coordinator.detach(listener) else {
            warn!("Listener {} not attached, nothing to reconfigure", listener);
            return Ok(());
        };

        // Last listener gone: tear the graph down so it is rebuilt on reload
        if core.coordinator.is_empty() {
            if self.state.is_active() {
                self.process_stop(core, listener)?;
            }
            self.session.close(listener)?;
            self.state.transition(EngineState::Idle);
            core.mmap.release();
            core.use_lpi = detached.lpi_enabled();
            core.builder.clear_instance_ids();
        }

        let merged = self.voice_ui.update_engine_model(listener, None)?;
        self.install_model(core, merged);
        Ok(())
    }
}

/// A detection engine and its capture thread.
///
/// Dropping the engine stops the capture thread and joins it.
pub struct DetectionEngine {
    inner: Arc<EngineInner>,
    worker: Option<JoinHandle<()>>,
}

impl DetectionEngine {
    /// Create an engine for `module_type`, owned by the listener that
    /// requested it
    pub fn new(
        module_type: ModuleType,
        owner: ListenerId,
        settings: EngineSettings,
        deps: EngineDeps,
    ) -> Result<Self, EngineError> {
        settings.validate()?;

        let format = settings.model.format();
        let mmap_size = if settings.platform.mmap_enable {
            format.ms_to_bytes(u64::from(settings.platform.mmap_buffer_duration_ms))
        } else {
            0
        };

        info!(
            "Creating {:?} engine for listener {}: {} Hz, {} bit, {} ch",
            module_type, owner, format.sample_rate, format.bit_width, format.channels
        );

        let core = EngineCore {
            coordinator: Coordinator::new(module_type.is_per_model()),
            builder: SessionPayloadBuilder::new(settings.model.clone()),
            buffer: None,
            detection_queue: VecDeque::new(),
            first_detected: None,
            detection_pending: false,
            detection_time: None,
            mmap: MmapWindow::new(mmap_size),
            custom_detection_event: None,
            merged_model: Vec::new(),
            pdk_model: None,
            deregister_model_id: 0,
            use_lpi: false,
            dev_disconnect_count: 0,
            dumps: DumpCounters::default(),
        };

        let inner = Arc::new(EngineInner {
            module_type,
            owner,
            settings,
            format,
            session: deps.session,
            resources: deps.resources,
            voice_ui: deps.voice_ui,
            core: Mutex::new(core),
            state: StateCell::new(),
            detection_cv: Condvar::new(),
            eos: EndOfStreamSignal::new(),
            exit_buffering: CachePadded::new(AtomicBool::new(false)),
            exit_thread: CachePadded::new(AtomicBool::new(false)),
            kw_transfer_latency_ms: AtomicU64::new(0),
            ec_ref: Mutex::new(EcRefTracker::new()),
        });

        let weak = Arc::downgrade(&inner);
        inner.session.register_callback(Box::new(move |event| {
            if let Some(inner) = weak.upgrade() {
                inner.on_session_event(event);
            }
        }));

        let worker_inner = Arc::clone(&inner);
        let worker = thread::Builder::new()
            .name(format!("wakeword-capture-{}", owner))
            .spawn(move || worker_inner.run_capture_thread())
            .map_err(|e| {
                EngineError::ResourceExhausted(format!("failed to spawn capture thread: {}", e))
            })?;

        Ok(Self {
            inner,
            worker: Some(worker),
        })
    }

    pub fn module_type(&self) -> ModuleType {
        self.inner.module_type
    }

    pub fn state(&self) -> EngineState {
        self.inner.state.get()
    }

    pub fn is_empty(&self) -> bool {
        self.inner.core.lock().coordinator.is_empty()
    }

    pub fn attached_count(&self) -> usize {
        self.inner.core.lock().coordinator.len()
    }

    /// Latency of the last replay transfer in milliseconds
    pub fn kw_transfer_latency_ms(&self) -> u64 {
        self.inner.kw_transfer_latency_ms.load(Ordering::Acquire)
    }

    pub fn load_model(&self, listener: &Arc<dyn Listener>, data: &[u8]) -> Result<(), EngineError> {
        self.inner.load_model(listener, data)
    }

    pub fn unload_model(&self, listener: ListenerId) -> Result<(), EngineError> {
        self.inner.unload_model(listener)
    }

    pub fn start_recognition(&self, listener: ListenerId) -> Result<(), EngineError> {
        self.inner.start_recognition(listener)
    }

    pub fn stop_recognition(&self, listener: ListenerId) -> Result<(), EngineError> {
        self.inner.stop_recognition(listener)
    }

    pub fn restart_recognition(&self, listener: ListenerId) -> Result<(), EngineError> {
        self.inner.restart_recognition(listener)
    }

    /// Set the listener's confidence levels, one per keyword of its model
    pub fn update_conf_levels(&self, listener: ListenerId, levels: &[u8]) -> Result<(), EngineError> {
        self.inner.update_conf_levels(listener, levels)
    }

    pub fn update_buf_config(&self, listener: ListenerId, hist_ms: u32, pre_roll_ms: u32) -> Result<(), EngineError> {
        self.inner.update_buf_config(listener, hist_ms, pre_roll_ms)
    }

    pub fn set_capture_requested(&self, requested: bool) {
        self.inner
            .core
            .lock()
            .coordinator
            .set_capture_requested(requested);
    }

    /// Create (or reset and resize) the ring buffer and return `readers`
    /// new readers over it
    pub fn create_buffer(&self, size: usize, readers: usize) -> Result<Vec<RingBufferReader>, EngineError> {
        self.inner.create_buffer(size, readers)
    }

    pub fn get_parameter(&self, id: ParamId) -> Result<ParamValue, EngineError> {
        self.inner.get_parameter(id)
    }

    pub fn connect_device(&self, listener: ListenerId, device: DeviceId) -> Result<(), EngineError> {
        self.inner.connect_device(listener, device)
    }

    pub fn disconnect_device(&self, listener: ListenerId, device: DeviceId) -> Result<(), EngineError> {
        self.inner.disconnect_device(listener, device)
    }

    pub fn setup_session_device(&self, listener: ListenerId, device: DeviceId) -> Result<(), EngineError> {
        self.inner.setup_session_device(listener, device)
    }

    pub fn set_ec_ref(
        &self,
        listener: ListenerId,
        device: Option<DeviceId>,
        enable: bool,
        first_time: bool,
    ) -> Result<(), EngineError> {
        self.inner.set_ec_ref(listener, device, enable, first_time)
    }

    pub fn reconfigure_detection_graph(&self, listener: ListenerId) -> Result<(), EngineError> {
        self.inner.reconfigure_detection_graph(listener)
    }

    pub fn detach_listener(&self, listener: ListenerId) -> Option<Arc<dyn Listener>> {
        self.inner.core.lock().coordinator.detach(listener)
    }

    /// Raw payload of the last detection, handed out once
    pub fn take_detection_event(&self) -> Option<Vec<u8>> {
        self.inner.core.lock().custom_detection_event.take()
    }

    /// Feed a session event directly, bypassing the registered callback
    pub fn on_session_event(&self, event: SessionEvent) {
        self.inner.on_session_event(event);
    }
}

impl Drop for DetectionEngine {
    fn drop(&mut self) {
        debug!("Stopping capture thread");
        self.inner.exit_buffering.store(true, Ordering::Release);
        {
            let _core = self.inner.core.lock();
            self.inner.exit_thread.store(true, Ordering::Release);
            self.inner.detection_cv.notify_one();
        }

        if let Some(worker) = self.worker.take() {
            if worker.join().is_err() {
                error!("Capture thread panicked");
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::session::{MmapRegion, MockCaptureSession, MockListener, MockResourceManager};
    use crate::state::ListenerState;
    use crate::sim::{SimDetection, SimVoiceUi};
    use test_case::test_case;

    fn resources(online: bool) -> Arc<MockResourceManager> {
        let mut resources = MockResourceManager::new();
        resources.expect_acquire_wake_lock().return_const(());
        resources.expect_release_wake_lock().return_const(());
        resources.expect_card_online().return_const(online);
        resources
            .expect_is_external_ec_ref_enabled()
            .return_const(false);
        Arc::new(resources)
    }

    fn listener(id: ListenerId) -> Arc<dyn Listener> {
        let mut mock = MockListener::new();
        mock.expect_id().return_const(id);
        mock.expect_model_id().return_const(0x10u32 + id as u32);
        mock.expect_recognition_mode().return_const(1u32);
        mock.expect_lpi_enabled().return_const(false);
        mock.expect_current_state().return_const(ListenerState::Active);
        mock.expect_capture_requested().return_const(false);
        mock.expect_hist_buffer_duration_ms().return_const(0u32);
        mock.expect_pre_roll_duration_ms().return_const(0u32);
        mock.expect_input_buffer_size().return_const(640usize);
        mock.expect_input_buffer_count().return_const(1usize);
        mock.expect_notify_detected().returning(|| Ok(()));
        Arc::new(mock)
    }

    fn permissive_session() -> MockCaptureSession {
        let mut session = MockCaptureSession::new();
        session.expect_register_callback().return_const(());
        session.expect_open().returning(|_| Ok(()));
        session.expect_close().returning(|_| Ok(()));
        session.expect_prepare().returning(|_| Ok(()));
        session.expect_start().returning(|_| Ok(()));
        session.expect_stop().returning(|_| Ok(()));
        session.expect_module_instance_id().returning(|_| Ok(0x42));
        session.expect_set_parameters().returning(|_, _, _| Ok(()));
        session
    }

    fn engine_with(session: MockCaptureSession, online: bool) -> DetectionEngine {
        engine_configured(session, online, |_| {})
    }

    fn engine_configured(
        session: MockCaptureSession,
        online: bool,
        configure: impl FnOnce(&mut EngineSettings),
    ) -> DetectionEngine {
        let mut settings = EngineSettings::default();
        settings.platform.eos_timeout_ms = 1;
        configure(&mut settings);
        DetectionEngine::new(
            ModuleType::Gmm,
            1,
            settings,
            EngineDeps {
                session: Arc::new(session),
                resources: resources(online),
                voice_ui: Arc::new(SimVoiceUi::new()),
            },
        )
        .unwrap()
    }

    #[test]
    fn test_session_error_mapping() {
        assert!(matches!(
            EngineError::from(SessionError::DeviceDisconnected),
            EngineError::DeviceDisconnected
        ));
        assert!(matches!(
            EngineError::from(SessionError::InvalidArgument("x".to_string())),
            EngineError::InvalidArgument(_)
        ));
        assert!(matches!(
            EngineError::from(SessionError::Io("x".to_string())),
            EngineError::Session(_)
        ));
    }

    #[test]
    fn test_empty_model_rejected() {
        let engine = engine_with(permissive_session(), true);
        let result = engine.load_model(&listener(1), &[]);
        assert!(matches!(result, Err(EngineError::InvalidArgument(_))));
        assert_eq!(engine.state(), EngineState::Idle);
    }

    #[test]
    fn test_lifecycle_states() {
        let engine = engine_with(permissive_session(), true);
        let a = listener(1);

        // Start without a model is a no-op
        engine.start_recognition(1).unwrap();
        assert_eq!(engine.state(), EngineState::Idle);

        engine.load_model(&a, b"hey_aether").unwrap();
        assert_eq!(engine.state(), EngineState::Loaded);
        assert_eq!(engine.attached_count(), 1);

        engine.update_conf_levels(1, &[60]).unwrap();
        engine.start_recognition(1).unwrap();
        assert_eq!(engine.state(), EngineState::Active);

        engine.restart_recognition(1).unwrap();
        assert_eq!(engine.state(), EngineState::Active);

        engine.stop_recognition(1).unwrap();
        assert_eq!(engine.state(), EngineState::Loaded);
        engine.stop_recognition(1).unwrap();
        assert_eq!(engine.state(), EngineState::Loaded);

        engine.unload_model(1).unwrap();
        assert_eq!(engine.state(), EngineState::Idle);
        assert!(engine.is_empty());
    }

    #[test]
    fn test_conf_level_count_must_match_model() {
        let engine = engine_with(permissive_session(), true);
        engine.load_model(&listener(1), b"one,two").unwrap();

        let result = engine.update_conf_levels(1, &[60]);
        assert!(matches!(result, Err(EngineError::InvalidArgument(_))));
        assert!(engine.update_conf_levels(1, &[60, 70]).is_ok());
        assert!(matches!(
            engine.update_conf_levels(9, &[60]),
            Err(EngineError::InvalidArgument(_))
        ));
    }

    #[test_case(true ; "card online")]
    #[test_case(false ; "card offline")]
    fn test_disconnect_reported_as_success(online: bool) {
        let mut session = MockCaptureSession::new();
        session.expect_register_callback().return_const(());
        session
            .expect_open()
            .returning(|_| Err(SessionError::DeviceDisconnected));

        let engine = engine_with(session, online);
        assert!(engine.load_model(&listener(1), b"hey_aether").is_ok());
        assert_eq!(engine.state(), EngineState::Idle);
    }

    #[test]
    fn test_failure_swallowed_only_when_card_offline() {
        let make = || {
            let mut session = MockCaptureSession::new();
            session.expect_register_callback().return_const(());
            session
                .expect_open()
                .returning(|_| Err(SessionError::Io("open".to_string())));
            session
        };

        let online = engine_with(make(), true);
        assert!(matches!(
            online.load_model(&listener(1), b"hey_aether"),
            Err(EngineError::Session(_))
        ));

        let offline = engine_with(make(), false);
        assert!(offline.load_model(&listener(1), b"hey_aether").is_ok());
    }

    #[test]
    fn test_create_buffer_resets_and_resizes() {
        let engine = engine_with(permissive_session(), true);
        assert!(matches!(
            engine.create_buffer(0, 1),
            Err(EngineError::InvalidArgument(_))
        ));

        let readers = engine.create_buffer(1024, 2).unwrap();
        assert_eq!(readers.len(), 2);
        assert_eq!(readers[0].ring().capacity(), 1024);

        let more = engine.create_buffer(2048, 1).unwrap();
        assert_eq!(more[0].ring().capacity(), 2048);
        assert!(Arc::ptr_eq(readers[0].ring(), more[0].ring()));
        assert_eq!(more[0].ring().reader_count(), 3);
    }

    #[test]
    fn test_device_transitions_follow_disconnect_count() {
        let mut session = permissive_session();
        session
            .expect_disconnect_device()
            .times(1)
            .returning(|_, _| Ok(()));
        session
            .expect_setup_device()
            .times(1)
            .returning(|_, _| Ok(()));
        session
            .expect_connect_device()
            .times(1)
            .returning(|_, _| Ok(()));

        let engine = engine_with(session, true);
        engine.load_model(&listener(1), b"one").unwrap();
        engine.load_model(&listener(2), b"two").unwrap();

        let device = DeviceId(7);
        // Only the last of two disconnects reaches the session
        engine.disconnect_device(1, device).unwrap();
        engine.disconnect_device(2, device).unwrap();
        // Only the last setup reaches the session
        engine.setup_session_device(1, device).unwrap();
        engine.setup_session_device(2, device).unwrap();
        engine.connect_device(2, device).unwrap();
    }

    #[test]
    fn test_kw_transfer_latency_parameter() {
        let engine = engine_with(permissive_session(), true);
        assert_eq!(
            engine.get_parameter(ParamId::KwTransferLatency).unwrap(),
            ParamValue::KwTransferLatencyMs(0)
        );
    }

    #[test]
    fn test_module_version_query_opens_and_closes_graph() {
        let mut session = permissive_session();
        session.expect_open_graph().times(1).returning(|_| Ok(()));
        session
            .expect_get_parameters()
            .times(1)
            .returning(|_, param, query| {
                assert_eq!(param, SessionParam::WakeupModuleVersion);
                assert_eq!(query.len(), payload::MODULE_PARAM_HEADER_SIZE + MODULE_VERSION_QUERY_SIZE);
                Ok(vec![1, 0, 2, 0])
            });

        let engine = engine_with(session, true);
        assert_eq!(
            engine.get_parameter(ParamId::WakeupModuleVersion).unwrap(),
            ParamValue::Raw(vec![1, 0, 2, 0])
        );
    }

    #[test]
    fn test_failed_session_stop_still_leaves_engine_loaded() {
        let mut session = MockCaptureSession::new();
        session.expect_register_callback().return_const(());
        session.expect_open().returning(|_| Ok(()));
        session.expect_prepare().returning(|_| Ok(()));
        session.expect_start().times(2).returning(|_| Ok(()));
        session
            .expect_stop()
            .returning(|_| Err(SessionError::Io("stop".to_string())));
        session.expect_module_instance_id().returning(|_| Ok(0x42));
        session.expect_set_parameters().returning(|_, _, _| Ok(()));

        let engine = engine_with(session, true);
        engine.load_model(&listener(1), b"hey_aether").unwrap();
        engine.update_conf_levels(1, &[60]).unwrap();
        engine.start_recognition(1).unwrap();

        assert!(matches!(
            engine.stop_recognition(1),
            Err(EngineError::Session(_))
        ));
        assert_eq!(engine.state(), EngineState::Loaded);

        // Next start takes the fresh start path
        engine.start_recognition(1).unwrap();
        assert_eq!(engine.state(), EngineState::Active);
    }

    #[test]
    fn test_failed_reset_on_restart_rearms_detection() {
        let mut session = MockCaptureSession::new();
        session.expect_register_callback().return_const(());
        session.expect_open().returning(|_| Ok(()));
        session.expect_prepare().returning(|_| Ok(()));
        session.expect_start().returning(|_| Ok(()));
        session.expect_module_instance_id().returning(|_| Ok(0x42));
        session.expect_set_parameters().returning(|_, param, _| {
            if param == SessionParam::WakeupEngineReset {
                Err(SessionError::Io("reset".to_string()))
            } else {
                Ok(())
            }
        });

        let engine = engine_with(session, true);
        engine.load_model(&listener(1), b"hey_aether").unwrap();
        engine.update_conf_levels(1, &[60]).unwrap();
        engine.start_recognition(1).unwrap();
        assert!(engine.inner.state.transition(EngineState::Detected));

        assert!(matches!(
            engine.restart_recognition(1),
            Err(EngineError::Session(_))
        ));
        assert_eq!(engine.state(), EngineState::Active);
        assert!(!engine.inner.exit_buffering.load(Ordering::Acquire));
    }

    #[test]
    fn test_failed_mmap_position_on_restart_keeps_going() {
        let mut session = permissive_session();
        session
            .expect_create_mmap_buffer()
            .times(1)
            .returning(|_, frames| Ok(MmapRegion::new(frames as usize * 2, frames)));
        session.expect_reset_mmap_buffer().returning(|_| Ok(()));
        session
            .expect_mmap_position()
            .returning(|_| Err(SessionError::Io("position".to_string())));

        let engine = engine_configured(session, true, |settings| {
            settings.platform.mmap_enable = true;
            settings.platform.mmap_buffer_duration_ms = 100;
        });
        engine.load_model(&listener(1), b"hey_aether").unwrap();
        engine.update_conf_levels(1, &[60]).unwrap();
        engine.start_recognition(1).unwrap();
        assert!(engine.inner.state.transition(EngineState::Buffering));

        engine.restart_recognition(1).unwrap();
        assert_eq!(engine.state(), EngineState::Active);
        assert!(!engine.inner.exit_buffering.load(Ordering::Acquire));
    }

    #[test]
    fn test_concurrent_detection_without_primary_does_not_block_restart() {
        let engine = engine_configured(permissive_session(), true, |settings| {
            settings.platform.concurrent_event_capture = true;
        });
        engine.load_model(&listener(1), b"hey_aether").unwrap();
        engine.update_conf_levels(1, &[60]).unwrap();
        engine.start_recognition(1).unwrap();
        assert!(engine.inner.state.transition(EngineState::Buffering));

        let detection = SimDetection {
            listener: 1,
            kw_start: 0,
            kw_end: 0,
            start_us: 50_000,
            end_us: 100_000,
            ftrt_us: 0,
        };
        engine.on_session_event(SessionEvent::Detection(detection.encode()));
        assert!(engine.inner.core.lock().detection_queue.is_empty());

        engine.restart_recognition(1).unwrap();
        assert_eq!(engine.state(), EngineState::Active);
    }

    #[test]
    fn test_reconfigure_last_listener_closes_graph() {
        let engine = engine_with(permissive_session(), true);
        engine.load_model(&listener(1), b"hey_aether").unwrap();
        engine.update_conf_levels(1, &[60]).unwrap();
        engine.start_recognition(1).unwrap();

        engine.reconfigure_detection_graph(1).unwrap();
        assert_eq!(engine.state(), EngineState::Idle);
        assert!(engine.is_empty());
    }
}
