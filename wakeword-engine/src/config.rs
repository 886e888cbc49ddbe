//! Platform and sound-model configuration
//!
//! Mirrors the two configuration sources the engine consumes: platform-wide
//! voice UI options and the per-model stream configuration (format plus
//! the module tag / parameter ids used for every session write).

use crate::format::AudioFormat;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use thiserror::Error;
use tracing::{debug, info};

#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("Failed to read config file {0}: {1}")]
    Io(PathBuf, std::io::Error),

    #[error("Failed to parse config: {0}")]
    Parse(#[from] serde_json::Error),

    #[error("Invalid configuration: {0}")]
    Invalid(String),
}

/// Session parameters the engine knows how to build
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ParamKind {
    LoadSoundModel,
    UnloadSoundModel,
    WakeupConfig,
    BufferingConfig,
    EngineReset,
    CustomConfig,
    ModuleVersion,
}

/// Module tag and parameter id pair addressed by a session write
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ModuleParam {
    pub tag_id: u32,
    pub param_id: u32,
}

/// Platform-wide voice UI options
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct PlatformConfig {
    /// Queue detections of other listeners while one is buffering
    pub concurrent_event_capture: bool,

    /// Read keyword audio from a memory-mapped region instead of pull reads
    pub mmap_enable: bool,

    /// Size of the memory-mapped region in milliseconds of audio
    pub mmap_buffer_duration_ms: u32,

    /// Dump captured audio and raw detection events to `debug_dump_dir`
    pub enable_debug_dumps: bool,

    pub debug_dump_dir: PathBuf,

    /// Maximum number of engines created for non-GMM module types
    pub supported_engine_count: u32,

    /// Bounded wait for end-of-stream after an engine reset
    pub eos_timeout_ms: u64,
}

impl Default for PlatformConfig {
    fn default() -> Self {
        Self {
            concurrent_event_capture: false,
            mmap_enable: false,
            mmap_buffer_duration_ms: 0,
            enable_debug_dumps: false,
            debug_dump_dir: std::env::temp_dir(),
            supported_engine_count: 1,
            eos_timeout_ms: 100,
        }
    }
}

impl PlatformConfig {
    /// Validate configuration
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.mmap_enable && self.mmap_buffer_duration_ms == 0 {
            return Err(ConfigError::Invalid(
                "mmap_buffer_duration_ms must be set when mmap is enabled".to_string(),
            ));
        }

        if self.supported_engine_count == 0 {
            return Err(ConfigError::Invalid(
                "supported_engine_count must be greater than 0".to_string(),
            ));
        }

        Ok(())
    }
}

/// Per sound-model stream configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SoundModelConfig {
    pub sample_rate: u32,
    pub bit_width: u16,
    pub out_channels: u16,

    /// Confidence levels are pushed as a wakeup config; otherwise as an
    /// opaque custom config blob
    pub wakeup_config_supported: bool,

    pub module_params: BTreeMap<ParamKind, ModuleParam>,
}

impl Default for SoundModelConfig {
    fn default() -> Self {
        let module_params = [
            (ParamKind::LoadSoundModel, 0x0800_1001),
            (ParamKind::UnloadSoundModel, 0x0800_1002),
            (ParamKind::WakeupConfig, 0x0800_1049),
            (ParamKind::BufferingConfig, 0x0800_1044),
            (ParamKind::EngineReset, 0x0800_1051),
            (ParamKind::CustomConfig, 0x0800_1052),
            (ParamKind::ModuleVersion, 0x0800_1053),
        ]
        .into_iter()
        .map(|(kind, param_id)| {
            (
                kind,
                ModuleParam {
                    tag_id: 0xC000_0004,
                    param_id,
                },
            )
        })
        .collect();

        Self {
            sample_rate: 16000,
            bit_width: 16,
            out_channels: 1,
            wakeup_config_supported: true,
            module_params,
        }
    }
}

impl SoundModelConfig {
    pub fn format(&self) -> AudioFormat {
        AudioFormat::new(self.sample_rate, self.bit_width, self.out_channels)
    }

    /// Tag/param pair for `kind`, if configured with non-zero ids
    pub fn module_param(&self, kind: ParamKind) -> Option<ModuleParam> {
        self.module_params
            .get(&kind)
            .copied()
            .filter(|p| p.tag_id != 0 && p.param_id != 0)
    }

    /// Validate configuration
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.sample_rate == 0 {
            return Err(ConfigError::Invalid("sample_rate must be > 0".to_string()));
        }

        if !matches!(self.bit_width, 16 | 24 | 32) {
            return Err(ConfigError::Invalid(format!(
                "unsupported bit width {}",
                self.bit_width
            )));
        }

        if self.out_channels == 0 {
            return Err(ConfigError::Invalid("out_channels must be > 0".to_string()));
        }

        for kind in [ParamKind::LoadSoundModel, ParamKind::EngineReset] {
            if self.module_param(kind).is_none() {
                return Err(ConfigError::Invalid(format!(
                    "missing module param for {:?}",
                    kind
                )));
            }
        }

        Ok(())
    }
}

/// Full engine settings as loaded from disk
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct EngineSettings {
    pub platform: PlatformConfig,
    pub model: SoundModelConfig,
}

impl EngineSettings {
    pub fn from_json_str(json: &str) -> Result<Self, ConfigError> {
        let settings: EngineSettings = serde_json::from_str(json)?;
        settings.validate()?;
        Ok(settings)
    }

    /// Load settings from a JSON file
    pub fn from_json_file(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let path = path.as_ref();
        let json = std::fs::read_to_string(path)
            .map_err(|e| ConfigError::Io(path.to_path_buf(), e))?;
        let settings = Self::from_json_str(&json)?;

        info!("Loaded engine settings from {}", path.display());
        debug!("Settings: {:?}", settings);

        Ok(settings)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        self.platform.validate()?;
        self.model.validate()
    }
}
