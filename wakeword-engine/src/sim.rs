//! In-process collaborators
//!
//! A deterministic capture session, resource manager, voice UI layer and
//! channel-backed listener. The simulation binary runs the engine against
//! them and the integration tests assert on what they record.

use crate::format::AudioFormat;
use crate::session::{
    CaptureSession, DeviceId, KeywordIndex, KeywordStats, Listener, ListenerError, ListenerId,
    MergedModel, MmapRegion, ResourceManager, SessionCallback, SessionError, SessionEvent,
    SessionParam, VoiceUi,
};
use crate::state::ListenerState;
use parking_lot::{Mutex, RwLock};
use std::collections::{BTreeMap, HashMap, HashSet};
use std::sync::atomic::{AtomicBool, AtomicU32, AtomicUsize, Ordering};
use std::sync::Arc;
use tokio::sync::mpsc;
use tracing::{debug, trace};

/// Instance id reported for every module tag
pub const SIM_MODULE_INSTANCE_ID: u32 = 0x4005;

/// Direction of arrival reported by the simulated ECNS module, in degrees
pub const SIM_DOA_DEGREES: u32 = 90;

/// One recorded `set_parameters` call
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ParamWrite {
    pub tag_id: u32,
    pub param: SessionParam,
    pub payload: Vec<u8>,
}

#[derive(Default)]
struct SimSessionState {
    /// Pull-mode bytes produced since the last start or reset
    read_position: u64,
    mmap: Option<MmapRegion>,
    mmap_position: u64,
    mmap_step_frames: u64,
    writes: Vec<ParamWrite>,
    disconnected: bool,
    open: bool,
    started: bool,
    start_count: usize,
    stop_count: usize,
    device_calls: Vec<(&'static str, DeviceId)>,
    ec_ref_calls: Vec<(Option<DeviceId>, bool)>,
}

/// Capture session producing a byte ramp (`byte = position as u8`)
pub struct SimSession {
    format: AudioFormat,
    state: Mutex<SimSessionState>,
    callback: RwLock<Option<Arc<SessionCallback>>>,
}

impl SimSession {
    pub fn new(format: AudioFormat) -> Self {
        Self {
            format,
            state: Mutex::new(SimSessionState {
                // 10ms of audio per position poll
                mmap_step_frames: u64::from(format.sample_rate / 100),
                ..Default::default()
            }),
            callback: RwLock::new(None),
        }
    }

    /// Deliver a detection payload the way the detector callback would.
    /// Must not be called from a thread holding the engine lock.
    pub fn trigger_detection(&self, payload: Vec<u8>) {
        self.emit(SessionEvent::Detection(payload));
    }

    pub fn emit(&self, event: SessionEvent) {
        let callback = self.callback.read().clone();
        match callback {
            Some(callback) => (**callback)(event),
            None => debug!("No session callback registered, drop {:?}", event),
        }
    }

    /// Make every subsequent call fail with `DeviceDisconnected`
    pub fn set_disconnected(&self, disconnected: bool) {
        self.state.lock().disconnected = disconnected;
    }

    pub fn set_mmap_step_frames(&self, frames: u64) {
        self.state.lock().mmap_step_frames = frames;
    }

    pub fn writes(&self) -> Vec<ParamWrite> {
        self.state.lock().writes.clone()
    }

    pub fn writes_of(&self, param: SessionParam) -> Vec<ParamWrite> {
        self.state
            .lock()
            .writes
            .iter()
            .filter(|w| w.param == param)
            .cloned()
            .collect()
    }

    pub fn clear_writes(&self) {
        self.state.lock().writes.clear();
    }

    pub fn is_started(&self) -> bool {
        self.state.lock().started
    }

    pub fn is_open(&self) -> bool {
        self.state.lock().open
    }

    pub fn start_count(&self) -> usize {
        self.state.lock().start_count
    }

    pub fn stop_count(&self) -> usize {
        self.state.lock().stop_count
    }

    pub fn device_calls(&self) -> Vec<(&'static str, DeviceId)> {
        self.state.lock().device_calls.clone()
    }

    pub fn ec_ref_calls(&self) -> Vec<(Option<DeviceId>, bool)> {
        self.state.lock().ec_ref_calls.clone()
    }

    fn check(&self) -> Result<parking_lot::MutexGuard<'_, SimSessionState>, SessionError> {
        let state = self.state.lock();
        if state.disconnected {
            return Err(SessionError::DeviceDisconnected);
        }
        Ok(state)
    }
}

impl CaptureSession for SimSession {
    fn open(&self, listener: ListenerId) -> Result<(), SessionError> {
        debug!("Sim session open for listener {}", listener);
        self.check()?.open = true;
        Ok(())
    }

    fn close(&self, listener: ListenerId) -> Result<(), SessionError> {
        debug!("Sim session close for listener {}", listener);
        let mut state = self.check()?;
        state.open = false;
        state.started = false;
        state.mmap = None;
        Ok(())
    }

    fn prepare(&self, _listener: ListenerId) -> Result<(), SessionError> {
        self.check().map(|_| ())
    }

    fn start(&self, _listener: ListenerId) -> Result<(), SessionError> {
        let mut state = self.check()?;
        state.started = true;
        state.start_count += 1;
        state.read_position = 0;
        state.mmap_position = 0;
        Ok(())
    }

    fn stop(&self, _listener: ListenerId) -> Result<(), SessionError> {
        let mut state = self.check()?;
        state.started = false;
        state.stop_count += 1;
        Ok(())
    }

    fn open_graph(&self, _listener: ListenerId) -> Result<(), SessionError> {
        self.check()?.open = true;
        Ok(())
    }

    fn read(&self, _listener: ListenerId, dest: &mut [u8]) -> Result<usize, SessionError> {
        let mut state = self.check()?;
        for byte in dest.iter_mut() {
            *byte = state.read_position as u8;
            state.read_position += 1;
        }
        trace!("Sim session read {} bytes", dest.len());
        Ok(dest.len())
    }

    fn create_mmap_buffer(
        &self,
        _listener: ListenerId,
        frames: u64,
    ) -> Result<MmapRegion, SessionError> {
        let mut state = self.check()?;
        if frames == 0 {
            return Err(SessionError::InvalidArgument("zero mmap frames".to_string()));
        }
        let region = MmapRegion::new(self.format.frames_to_bytes(frames), frames);
        state.mmap = Some(region.clone());
        Ok(region)
    }

    fn reset_mmap_buffer(&self, _listener: ListenerId) -> Result<(), SessionError> {
        let mut state = self.check()?;
        let frames = state.mmap.as_ref().map_or(0, |r| r.frames());
        if frames > 0 {
            state.mmap_position %= frames;
        }
        Ok(())
    }

    /// Each poll produces another step of ramp data into the region
    fn mmap_position(&self, _listener: ListenerId) -> Result<u64, SessionError> {
        let mut state = self.check()?;
        let Some(region) = state.mmap.clone() else {
            return Err(SessionError::NotSupported("no mmap buffer".to_string()));
        };

        let start = self.format.frames_to_bytes(state.mmap_position);
        let len = self.format.frames_to_bytes(state.mmap_step_frames);
        let ramp: Vec<u8> = (start..start + len).map(|i| i as u8).collect();
        if !region.is_empty() {
            region.write_wrapped(start % region.len(), &ramp);
        }

        state.mmap_position += state.mmap_step_frames;
        Ok(state.mmap_position)
    }

    fn set_parameters(
        &self,
        tag_id: u32,
        param: SessionParam,
        payload: &[u8],
    ) -> Result<(), SessionError> {
        {
            let mut state = self.check()?;
            state.writes.push(ParamWrite {
                tag_id,
                param,
                payload: payload.to_vec(),
            });
            if param == SessionParam::WakeupEngineReset {
                state.read_position = 0;
            }
        }

        // Detector drains and reports end of stream after a reset
        if param == SessionParam::WakeupEngineReset {
            self.emit(SessionEvent::EndOfStream);
        }
        Ok(())
    }

    fn get_parameters(
        &self,
        _tag_id: u32,
        param: SessionParam,
        query: &[u8],
    ) -> Result<Vec<u8>, SessionError> {
        self.check()?;
        match param {
            SessionParam::DirectionOfArrival => Ok(SIM_DOA_DEGREES.to_le_bytes().to_vec()),
            SessionParam::WakeupModuleVersion => {
                // Echo the query with the version filled into the response area
                let mut response = query.to_vec();
                let header = crate::payload::MODULE_PARAM_HEADER_SIZE;
                if response.len() >= header + 8 {
                    response[header..header + 4].copy_from_slice(&1u32.to_le_bytes());
                    response[header + 4..header + 8].copy_from_slice(&2u32.to_le_bytes());
                }
                Ok(response)
            }
            other => Err(SessionError::NotSupported(format!("{:?}", other))),
        }
    }

    fn module_instance_id(&self, _tag_id: u32) -> Result<u32, SessionError> {
        self.check()?;
        Ok(SIM_MODULE_INSTANCE_ID)
    }

    fn connect_device(&self, _listener: ListenerId, device: DeviceId) -> Result<(), SessionError> {
        self.check()?.device_calls.push(("connect", device));
        Ok(())
    }

    fn disconnect_device(
        &self,
        _listener: ListenerId,
        device: DeviceId,
    ) -> Result<(), SessionError> {
        self.check()?.device_calls.push(("disconnect", device));
        Ok(())
    }

    fn setup_device(&self, _listener: ListenerId, device: DeviceId) -> Result<(), SessionError> {
        self.check()?.device_calls.push(("setup", device));
        Ok(())
    }

    fn set_ec_ref(
        &self,
        _listener: ListenerId,
        device: Option<DeviceId>,
        enable: bool,
    ) -> Result<(), SessionError> {
        self.check()?.ec_ref_calls.push((device, enable));
        Ok(())
    }

    fn register_callback(&self, callback: SessionCallback) {
        *self.callback.write() = Some(Arc::new(callback));
    }
}

/// Resource manager counting wake-lock calls
pub struct SimResources {
    acquired: AtomicUsize,
    released: AtomicUsize,
    online: AtomicBool,
    external_ec: Mutex<HashSet<DeviceId>>,
}

impl SimResources {
    pub fn new() -> Self {
        Self {
            acquired: AtomicUsize::new(0),
            released: AtomicUsize::new(0),
            online: AtomicBool::new(true),
            external_ec: Mutex::new(HashSet::new()),
        }
    }

    pub fn acquired(&self) -> usize {
        self.acquired.load(Ordering::SeqCst)
    }

    pub fn released(&self) -> usize {
        self.released.load(Ordering::SeqCst)
    }

    pub fn set_online(&self, online: bool) {
        self.online.store(online, Ordering::SeqCst);
    }

    pub fn set_external_ec(&self, device: DeviceId) {
        self.external_ec.lock().insert(device);
    }
}

impl Default for SimResources {
    fn default() -> Self {
        Self::new()
    }
}

impl ResourceManager for SimResources {
    fn acquire_wake_lock(&self) {
        self.acquired.fetch_add(1, Ordering::SeqCst);
    }

    fn release_wake_lock(&self) {
        self.released.fetch_add(1, Ordering::SeqCst);
    }

    fn is_external_ec_ref_enabled(&self, device: DeviceId) -> bool {
        self.external_ec.lock().contains(&device)
    }

    fn card_online(&self) -> bool {
        self.online.load(Ordering::SeqCst)
    }
}

/// Detection payload understood by [`SimVoiceUi`]:
/// `listener u64 | kw_start u32 | kw_end u32 | start_us u64 | end_us u64 | ftrt_us u64`,
/// little endian
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SimDetection {
    pub listener: ListenerId,
    pub kw_start: u32,
    pub kw_end: u32,
    pub start_us: u64,
    pub end_us: u64,
    pub ftrt_us: u64,
}

impl SimDetection {
    pub const SIZE: usize = 40;

    pub fn encode(&self) -> Vec<u8> {
        let mut out = Vec::with_capacity(Self::SIZE);
        out.extend_from_slice(&self.listener.to_le_bytes());
        out.extend_from_slice(&self.kw_start.to_le_bytes());
        out.extend_from_slice(&self.kw_end.to_le_bytes());
        out.extend_from_slice(&self.start_us.to_le_bytes());
        out.extend_from_slice(&self.end_us.to_le_bytes());
        out.extend_from_slice(&self.ftrt_us.to_le_bytes());
        out
    }

    pub fn decode(bytes: &[u8]) -> Option<Self> {
        if bytes.len() < Self::SIZE {
            return None;
        }
        let u64_at = |at: usize| {
            let mut raw = [0u8; 8];
            raw.copy_from_slice(&bytes[at..at + 8]);
            u64::from_le_bytes(raw)
        };
        let u32_at = |at: usize| {
            let mut raw = [0u8; 4];
            raw.copy_from_slice(&bytes[at..at + 4]);
            u32::from_le_bytes(raw)
        };

        Some(Self {
            listener: u64_at(0),
            kw_start: u32_at(8),
            kw_end: u32_at(12),
            start_us: u64_at(16),
            end_us: u64_at(24),
            ftrt_us: u64_at(32),
        })
    }
}

#[derive(Default)]
struct VoiceUiState {
    /// Keyword names per listener model
    models: BTreeMap<ListenerId, Vec<String>>,
    detections: HashMap<ListenerId, SimDetection>,
    read_offsets: HashMap<ListenerId, usize>,
    client_indices: HashMap<ListenerId, (usize, usize)>,
    ftrt_bytes: usize,
    active: HashMap<ListenerId, bool>,
}

/// Voice UI layer whose sound models are comma separated keyword names.
/// Listeners sharing a keyword share its merged slot.
#[derive(Default)]
pub struct SimVoiceUi {
    state: Mutex<VoiceUiState>,
}

impl SimVoiceUi {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn ftrt_bytes(&self) -> usize {
        self.state.lock().ftrt_bytes
    }

    pub fn read_offset(&self, listener: ListenerId) -> Option<usize> {
        self.state.lock().read_offsets.get(&listener).copied()
    }

    pub fn client_indices(&self, listener: ListenerId) -> Option<(usize, usize)> {
        self.state.lock().client_indices.get(&listener).copied()
    }

    pub fn model_active(&self, listener: ListenerId) -> bool {
        self.state
            .lock()
            .active
            .get(&listener)
            .copied()
            .unwrap_or(false)
    }

    fn keywords(model: &[u8]) -> Vec<String> {
        String::from_utf8_lossy(model)
            .split(',')
            .map(|kw| kw.trim_matches(|c: char| c == '\0' || c.is_whitespace()))
            .filter(|kw| !kw.is_empty())
            .map(str::to_string)
            .collect()
    }

    fn merge(models: &BTreeMap<ListenerId, Vec<String>>) -> MergedModel {
        let mut names: Vec<&str> = Vec::new();
        let mut layout: Vec<Vec<(ListenerId, usize)>> = Vec::new();

        for (listener, keywords) in models {
            for (index, keyword) in keywords.iter().enumerate() {
                match names.iter().position(|name| *name == keyword.as_str()) {
                    Some(slot) => layout[slot].push((*listener, index)),
                    None => {
                        names.push(keyword);
                        layout.push(vec![(*listener, index)]);
                    }
                }
            }
        }

        MergedModel {
            data: names.join(",").into_bytes(),
            layout,
        }
    }
}

impl VoiceUi for SimVoiceUi {
    fn detected_listener(&self, payload: &[u8]) -> Option<ListenerId> {
        SimDetection::decode(payload).map(|d| d.listener)
    }

    fn parse_detection_payload(
        &self,
        listener: ListenerId,
        payload: &[u8],
    ) -> Result<(), SessionError> {
        let detection = SimDetection::decode(payload)
            .filter(|d| d.listener == listener)
            .ok_or_else(|| SessionError::InvalidArgument("malformed detection".to_string()))?;

        debug!("Parsed detection: {:?}", detection);
        self.state.lock().detections.insert(listener, detection);
        Ok(())
    }

    fn keyword_index(&self, listener: ListenerId) -> KeywordIndex {
        self.state
            .lock()
            .detections
            .get(&listener)
            .map(|d| KeywordIndex {
                start: d.kw_start as usize,
                end: d.kw_end as usize,
            })
            .unwrap_or_default()
    }

    fn keyword_stats(&self, listener: ListenerId) -> KeywordStats {
        self.state
            .lock()
            .detections
            .get(&listener)
            .map(|d| KeywordStats {
                start_us: d.start_us,
                end_us: d.end_us,
                ftrt_us: d.ftrt_us,
            })
            .unwrap_or_default()
    }

    fn set_read_offset(&self, listener: ListenerId, offset: usize) {
        self.state.lock().read_offsets.insert(listener, offset);
    }

    fn update_indices(&self, listener: ListenerId, start: usize, end: usize) {
        self.state
            .lock()
            .client_indices
            .insert(listener, (start, end));
    }

    fn update_ftrt_data(&self, data: &[u8]) {
        self.state.lock().ftrt_bytes += data.len();
    }

    fn update_engine_model(
        &self,
        listener: ListenerId,
        model: Option<&[u8]>,
    ) -> Result<MergedModel, SessionError> {
        let mut state = self.state.lock();
        match model {
            Some(model) => {
                let keywords = Self::keywords(model);
                if keywords.is_empty() {
                    return Err(SessionError::InvalidArgument(
                        "sound model has no keywords".to_string(),
                    ));
                }
                state.models.insert(listener, keywords);
            }
            None => {
                state.models.remove(&listener);
            }
        }

        Ok(Self::merge(&state.models))
    }

    fn listener_conf_levels_size(&self, listener: ListenerId) -> Option<usize> {
        self.state.lock().models.get(&listener).map(Vec::len)
    }

    fn set_model_state(&self, listener: ListenerId, active: bool) {
        self.state.lock().active.insert(listener, active);
    }
}

/// Listener that reports detections over a channel
pub struct SimListener {
    id: ListenerId,
    model_id: u32,
    state: Mutex<ListenerState>,
    capture_requested: AtomicBool,
    lpi: AtomicBool,
    hist_ms: AtomicU32,
    pre_roll_ms: AtomicU32,
    input_buffer_size: AtomicUsize,
    fail_notify: AtomicBool,
    tx: mpsc::UnboundedSender<ListenerId>,
}

impl SimListener {
    pub fn new(id: ListenerId, model_id: u32) -> (Arc<Self>, mpsc::UnboundedReceiver<ListenerId>) {
        let (tx, rx) = mpsc::unbounded_channel();
        let listener = Arc::new(Self {
            id,
            model_id,
            state: Mutex::new(ListenerState::Idle),
            capture_requested: AtomicBool::new(true),
            lpi: AtomicBool::new(false),
            hist_ms: AtomicU32::new(0),
            pre_roll_ms: AtomicU32::new(0),
            input_buffer_size: AtomicUsize::new(2048),
            fail_notify: AtomicBool::new(false),
            tx,
        });
        (listener, rx)
    }

    pub fn set_state(&self, state: ListenerState) {
        *self.state.lock() = state;
    }

    pub fn set_capture_requested(&self, requested: bool) {
        self.capture_requested.store(requested, Ordering::SeqCst);
    }

    pub fn set_lpi(&self, lpi: bool) {
        self.lpi.store(lpi, Ordering::SeqCst);
    }

    pub fn set_durations(&self, hist_ms: u32, pre_roll_ms: u32) {
        self.hist_ms.store(hist_ms, Ordering::SeqCst);
        self.pre_roll_ms.store(pre_roll_ms, Ordering::SeqCst);
    }

    pub fn set_input_buffer_size(&self, size: usize) {
        self.input_buffer_size.store(size, Ordering::SeqCst);
    }

    /// Reject the next notifications
    pub fn set_fail_notify(&self, fail: bool) {
        self.fail_notify.store(fail, Ordering::SeqCst);
    }
}

impl Listener for SimListener {
    fn id(&self) -> ListenerId {
        self.id
    }

    fn model_id(&self) -> u32 {
        self.model_id
    }

    fn recognition_mode(&self) -> u32 {
        1
    }

    fn lpi_enabled(&self) -> bool {
        self.lpi.load(Ordering::SeqCst)
    }

    fn current_state(&self) -> ListenerState {
        *self.state.lock()
    }

    fn capture_requested(&self) -> bool {
        self.capture_requested.load(Ordering::SeqCst)
    }

    fn hist_buffer_duration_ms(&self) -> u32 {
        self.hist_ms.load(Ordering::SeqCst)
    }

    fn pre_roll_duration_ms(&self) -> u32 {
        self.pre_roll_ms.load(Ordering::SeqCst)
    }

    fn input_buffer_size(&self) -> usize {
        self.input_buffer_size.load(Ordering::SeqCst)
    }

    fn input_buffer_count(&self) -> usize {
        1
    }

    fn notify_detected(&self) -> Result<(), ListenerError> {
        if self.fail_notify.load(Ordering::SeqCst) {
            return Err(ListenerError::Rejected("notification refused".to_string()));
        }

        let next = if self.capture_requested() {
            ListenerState::Buffering
        } else {
            ListenerState::Detected
        };
        self.set_state(next);
        self.tx.send(self.id).map_err(|_| ListenerError::Closed)
    }
}
