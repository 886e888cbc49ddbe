//! Collaborator interfaces consumed by the detection engine
//!
//! The engine never talks to capture hardware, the platform resource
//! manager, the voice UI model layer or the client listeners directly; it
//! only sees the traits in this module.

use crate::state::ListenerState;
use parking_lot::RwLock;
use std::sync::Arc;
use thiserror::Error;

/// Identity of one registered wake-word listener
pub type ListenerId = u64;

/// Callback registered with the capture session for asynchronous events
pub type SessionCallback = Box<dyn Fn(SessionEvent) + Send + Sync>;

/// Failures reported by the capture session and voice UI collaborators
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum SessionError {
    #[error("Capture device disconnected")]
    DeviceDisconnected,

    #[error("Invalid argument: {0}")]
    InvalidArgument(String),

    #[error("Session I/O failed: {0}")]
    Io(String),

    #[error("Not supported: {0}")]
    NotSupported(String),
}

/// Failures reported by a listener when handed a detection
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ListenerError {
    #[error("Listener rejected detection: {0}")]
    Rejected(String),

    #[error("Listener channel closed")]
    Closed,
}

/// Asynchronous event delivered by the capture session
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SessionEvent {
    /// Opaque detection payload from the first-stage detector
    Detection(Vec<u8>),

    /// Shared-memory push mode reached end of stream after a reset
    EndOfStream,
}

/// Parameter ids understood by the capture session
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum SessionParam {
    LoadSoundModel,
    UnloadSoundModel,
    WakeupEngineConfig,
    WakeupBufferingConfig,
    WakeupEngineReset,
    WakeupCustomConfig,
    WakeupModuleVersion,
    DirectionOfArrival,
}

/// Playback device identity used for device routing and echo reference
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct DeviceId(pub u32);

/// Memory-mapped capture region shared with the session.
///
/// The session produces into it; the engine copies out of it.
#[derive(Debug, Clone)]
pub struct MmapRegion {
    data: Arc<RwLock<Vec<u8>>>,
    frames: u64,
}

impl MmapRegion {
    pub fn new(size_bytes: usize, frames: u64) -> Self {
        Self {
            data: Arc::new(RwLock::new(vec![0; size_bytes])),
            frames,
        }
    }

    /// Region size in bytes
    pub fn len(&self) -> usize {
        self.data.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Region size in frames as reported by the session
    pub fn frames(&self) -> u64 {
        self.frames
    }

    /// Copy `dest.len()` bytes starting at `offset` (no wrap)
    pub fn copy_out(&self, offset: usize, dest: &mut [u8]) {
        let data = self.data.read();
        dest.copy_from_slice(&data[offset..offset + dest.len()]);
    }

    /// Producer side: write bytes at `offset`, wrapping at the region end
    pub fn write_wrapped(&self, offset: usize, src: &[u8]) {
        let mut data = self.data.write();
        let len = data.len();
        if len == 0 {
            return;
        }
        for (i, byte) in src.iter().enumerate() {
            data[(offset + i) % len] = *byte;
        }
    }
}

/// Byte indices of the detected keyword relative to the buffered stream
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct KeywordIndex {
    pub start: usize,
    pub end: usize,
}

/// Detector timestamps of a keyword, in microseconds
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct KeywordStats {
    pub start_us: u64,
    pub end_us: u64,
    /// Duration of replay data buffered ahead of real time
    pub ftrt_us: u64,
}

/// Slot layout of a merged model. Each slot lists every listener sharing
/// it, together with the keyword's index in that listener's own levels.
pub type MergedLayout = Vec<Vec<(ListenerId, usize)>>;

/// Compiled detector model covering every attached listener
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct MergedModel {
    pub data: Vec<u8>,
    pub layout: MergedLayout,
}

/// Capture session talking to the detector graph and the capture path
#[cfg_attr(test, mockall::automock)]
pub trait CaptureSession: Send + Sync {
    fn open(&self, listener: ListenerId) -> Result<(), SessionError>;
    fn close(&self, listener: ListenerId) -> Result<(), SessionError>;
    fn prepare(&self, listener: ListenerId) -> Result<(), SessionError>;
    fn start(&self, listener: ListenerId) -> Result<(), SessionError>;
    fn stop(&self, listener: ListenerId) -> Result<(), SessionError>;

    /// Open only the graph, for queries outside a recognition session
    fn open_graph(&self, listener: ListenerId) -> Result<(), SessionError>;

    /// Pull-mode read of keyword audio, returning bytes read
    fn read(&self, listener: ListenerId, dest: &mut [u8]) -> Result<usize, SessionError>;

    fn create_mmap_buffer(&self, listener: ListenerId, frames: u64)
        -> Result<MmapRegion, SessionError>;
    fn reset_mmap_buffer(&self, listener: ListenerId) -> Result<(), SessionError>;

    /// Total frames written into the mapped region since the last reset
    fn mmap_position(&self, listener: ListenerId) -> Result<u64, SessionError>;

    fn set_parameters(
        &self,
        tag_id: u32,
        param: SessionParam,
        payload: &[u8],
    ) -> Result<(), SessionError>;
    fn get_parameters(
        &self,
        tag_id: u32,
        param: SessionParam,
        query: &[u8],
    ) -> Result<Vec<u8>, SessionError>;

    /// Module instance id for a module tag in the loaded graph
    fn module_instance_id(&self, tag_id: u32) -> Result<u32, SessionError>;

    fn connect_device(&self, listener: ListenerId, device: DeviceId) -> Result<(), SessionError>;
    fn disconnect_device(&self, listener: ListenerId, device: DeviceId)
        -> Result<(), SessionError>;
    fn setup_device(&self, listener: ListenerId, device: DeviceId) -> Result<(), SessionError>;

    fn set_ec_ref(
        &self,
        listener: ListenerId,
        device: Option<DeviceId>,
        enable: bool,
    ) -> Result<(), SessionError>;

    fn register_callback(&self, callback: SessionCallback);
}

/// Platform resource manager
#[cfg_attr(test, mockall::automock)]
pub trait ResourceManager: Send + Sync {
    fn acquire_wake_lock(&self);
    fn release_wake_lock(&self);
    fn is_external_ec_ref_enabled(&self, device: DeviceId) -> bool;

    /// False while the sound card is offline (subsystem restart)
    fn card_online(&self) -> bool;
}

/// One registered wake-word request, owned by the outer layer
#[cfg_attr(test, mockall::automock)]
pub trait Listener: Send + Sync {
    fn id(&self) -> ListenerId;
    fn model_id(&self) -> u32;
    fn recognition_mode(&self) -> u32;
    fn lpi_enabled(&self) -> bool;
    fn current_state(&self) -> ListenerState;
    fn capture_requested(&self) -> bool;
    fn hist_buffer_duration_ms(&self) -> u32;
    fn pre_roll_duration_ms(&self) -> u32;

    /// Size of one capture read chunk in bytes
    fn input_buffer_size(&self) -> usize;
    fn input_buffer_count(&self) -> usize;

    /// Detection confirmed and keyword audio is ready in the ring buffer
    fn notify_detected(&self) -> Result<(), ListenerError>;
}

/// Voice UI model layer: payload parsing and model merging
pub trait VoiceUi: Send + Sync {
    /// Listener a raw detection payload belongs to
    fn detected_listener(&self, payload: &[u8]) -> Option<ListenerId>;

    fn parse_detection_payload(&self, listener: ListenerId, payload: &[u8])
        -> Result<(), SessionError>;

    fn keyword_index(&self, listener: ListenerId) -> KeywordIndex;
    fn keyword_stats(&self, listener: ListenerId) -> KeywordStats;

    /// Where the listener's client starts reading the ring buffer
    fn set_read_offset(&self, listener: ListenerId, offset: usize);

    /// Keyword indices relative to the start of the listener's pre-roll
    fn update_indices(&self, listener: ListenerId, start: usize, end: usize);

    /// Accumulate replay data ahead of real time
    fn update_ftrt_data(&self, data: &[u8]);

    /// Add (`Some`) or remove (`None`) a listener's model from the merged
    /// model and return the result
    fn update_engine_model(
        &self,
        listener: ListenerId,
        model: Option<&[u8]>,
    ) -> Result<MergedModel, SessionError>;

    /// Number of confidence levels in the listener's own model
    fn listener_conf_levels_size(&self, listener: ListenerId) -> Option<usize>;

    fn set_model_state(&self, listener: ListenerId, active: bool);
}
