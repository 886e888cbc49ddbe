//! Keyword-detection buffering engine
//!
//! Drives a first-stage keyword detector on behalf of one or more wake-word
//! listeners: loads and merges their sound models, keeps the detector's
//! configuration in sync with them, and once a keyword fires drains the
//! buffered audio into a multi-reader ring buffer for second-stage
//! consumers.

pub mod capture;
pub mod config;
pub mod coordinator;
pub mod dispatcher;
pub mod dump;
pub mod echo_ref;
pub mod engine;
pub mod format;
pub mod payload;
pub mod registry;
pub mod ring_buffer;
pub mod session;
pub mod sim;
pub mod state;

// Re-export main types
pub use config::{ConfigError, EngineSettings, ParamKind, PlatformConfig, SoundModelConfig};
pub use engine::{DetectionEngine, EngineDeps, EngineError, ParamId, ParamValue};
pub use format::AudioFormat;
pub use registry::{EngineRegistry, ModuleType};
pub use ring_buffer::{KeywordWindow, RingBuffer, RingBufferError, RingBufferReader};
pub use session::{
    CaptureSession, DeviceId, Listener, ListenerError, ListenerId, ResourceManager, SessionError,
    SessionEvent, SessionParam, VoiceUi,
};
pub use state::{EngineState, ListenerState};
