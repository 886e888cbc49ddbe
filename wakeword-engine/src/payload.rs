//! Session payload construction
//!
//! Every configuration write to the detector module is a module-param
//! blob: a 16 byte header (instance id, param id, payload size, error code)
//! followed by the payload zero padded to an 8 byte boundary. All fields are
//! little endian.

use crate::config::{ParamKind, SoundModelConfig};
use crate::engine::EngineError;
use crate::session::{CaptureSession, SessionError, SessionParam};
use thiserror::Error;
use tracing::{debug, error};

pub const MODULE_PARAM_HEADER_SIZE: usize = 16;
const PAYLOAD_ALIGNMENT: usize = 8;

/// Confidence level that disables a keyword
pub const CONFIDENCE_DISABLED: u8 = 100;

#[derive(Error, Debug, PartialEq, Eq)]
pub enum PayloadError {
    #[error("No module tag/param id configured for {0:?}")]
    MissingModuleParam(ParamKind),

    #[error("No module instance id for tag {0:#x}")]
    MissingInstanceId(u32),

    #[error("Too many keywords: {0}")]
    TooManyKeywords(usize),
}

/// Merged-model wakeup configuration
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct WakeupConfig {
    pub mode: u16,
    pub custom_payload_size: u16,
    pub confidence_levels: Vec<u8>,
    pub user_enables: Vec<u8>,
}

impl WakeupConfig {
    pub fn new(mode: u16, levels: Vec<u8>) -> Self {
        let mut config = Self {
            mode,
            ..Default::default()
        };
        config.set_levels(levels);
        config
    }

    /// Replace the levels; a keyword is user enabled unless its level is 100
    pub fn set_levels(&mut self, levels: Vec<u8>) {
        self.user_enables = levels
            .iter()
            .map(|&level| u8::from(level != CONFIDENCE_DISABLED))
            .collect();
        self.confidence_levels = levels;
        self.custom_payload_size = 0;
    }

    pub fn encode(&self) -> Result<Vec<u8>, PayloadError> {
        let count = self.confidence_levels.len();
        let num_active = u8::try_from(count).map_err(|_| PayloadError::TooManyKeywords(count))?;

        let mut out = Vec::with_capacity(6 + 2 * count);
        out.extend_from_slice(&self.mode.to_le_bytes());
        out.extend_from_slice(&self.custom_payload_size.to_le_bytes());
        out.push(num_active);
        out.push(0);
        out.extend_from_slice(&self.confidence_levels);
        out.extend_from_slice(&self.user_enables);
        Ok(out)
    }
}

/// Per-model wakeup configuration for per-model-slot detectors
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PdkWakeupConfig {
    pub model_id: u32,
    pub mode: u32,
    pub custom_payload_size: u32,
    pub confidence_levels: Vec<u32>,
}

impl PdkWakeupConfig {
    pub fn encode(&self) -> Result<Vec<u8>, PayloadError> {
        let count = self.confidence_levels.len();
        let num_keywords = u32::try_from(count).map_err(|_| PayloadError::TooManyKeywords(count))?;

        let mut out = Vec::with_capacity(16 + 4 * count);
        for field in [self.model_id, self.mode, self.custom_payload_size, num_keywords] {
            out.extend_from_slice(&field.to_le_bytes());
        }
        for level in &self.confidence_levels {
            out.extend_from_slice(&level.to_le_bytes());
        }
        Ok(out)
    }
}

/// History and pre-roll durations pushed to the detector
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct BufferingConfig {
    pub model_id: u32,
    pub hist_ms: u32,
    pub pre_roll_ms: u32,
}

impl BufferingConfig {
    /// Per-model detectors take the model id as a leading field
    pub fn encode(&self, per_model: bool) -> Vec<u8> {
        let mut out = Vec::with_capacity(12);
        if per_model {
            out.extend_from_slice(&self.model_id.to_le_bytes());
        }
        out.extend_from_slice(&self.hist_ms.to_le_bytes());
        out.extend_from_slice(&self.pre_roll_ms.to_le_bytes());
        out
    }
}

/// Register payload for a per-model-slot detector
pub fn register_model(model_id: u32, model: &[u8]) -> Vec<u8> {
    let mut out = Vec::with_capacity(8 + model.len());
    out.extend_from_slice(&model_id.to_le_bytes());
    out.extend_from_slice(&(model.len() as u32).to_le_bytes());
    out.extend_from_slice(model);
    out
}

pub fn deregister_model(model_id: u32) -> Vec<u8> {
    model_id.to_le_bytes().to_vec()
}

/// Wrap `body` in a module-param header
pub fn module_param(miid: u32, param_id: u32, body: &[u8]) -> Vec<u8> {
    let padded = body.len().div_ceil(PAYLOAD_ALIGNMENT) * PAYLOAD_ALIGNMENT;
    let mut out = Vec::with_capacity(MODULE_PARAM_HEADER_SIZE + padded);
    out.extend_from_slice(&miid.to_le_bytes());
    out.extend_from_slice(&param_id.to_le_bytes());
    out.extend_from_slice(&(body.len() as u32).to_le_bytes());
    out.extend_from_slice(&0u32.to_le_bytes());
    out.extend_from_slice(body);
    out.resize(MODULE_PARAM_HEADER_SIZE + padded, 0);
    out
}

/// Module-param query with a zeroed response area of `size` bytes
pub fn module_query(miid: u32, param_id: u32, size: usize) -> Vec<u8> {
    module_param(miid, param_id, &vec![0; size])
}

/// Session parameter carried by a write of `kind`
pub fn session_param(kind: ParamKind) -> SessionParam {
    match kind {
        ParamKind::LoadSoundModel => SessionParam::LoadSoundModel,
        ParamKind::UnloadSoundModel => SessionParam::UnloadSoundModel,
        ParamKind::WakeupConfig => SessionParam::WakeupEngineConfig,
        ParamKind::BufferingConfig => SessionParam::WakeupBufferingConfig,
        ParamKind::EngineReset => SessionParam::WakeupEngineReset,
        ParamKind::CustomConfig => SessionParam::WakeupCustomConfig,
        ParamKind::ModuleVersion => SessionParam::WakeupModuleVersion,
    }
}

/// One ready-to-send session write
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ModuleWrite {
    pub tag_id: u32,
    pub param: SessionParam,
    pub payload: Vec<u8>,
}

/// Builds module-param writes, caching the detector's instance id once per
/// power mode
pub struct SessionPayloadBuilder {
    model: SoundModelConfig,
    lpi_miid: Option<u32>,
    nlpi_miid: Option<u32>,
}

impl SessionPayloadBuilder {
    pub fn new(model: SoundModelConfig) -> Self {
        Self {
            model,
            lpi_miid: None,
            nlpi_miid: None,
        }
    }

    /// Instance id of the detector module in the current power mode
    pub fn instance_id(
        &mut self,
        session: &dyn CaptureSession,
        tag_id: u32,
        use_lpi: bool,
    ) -> Result<u32, SessionError> {
        let cached = if use_lpi {
            &mut self.lpi_miid
        } else {
            &mut self.nlpi_miid
        };

        if let Some(miid) = *cached {
            return Ok(miid);
        }

        let miid = session.module_instance_id(tag_id)?;
        debug!("Module instance id for tag {:#x}: {:#x}", tag_id, miid);
        *cached = Some(miid);
        Ok(miid)
    }

    /// Forget cached instance ids (graph closed)
    pub fn clear_instance_ids(&mut self) {
        self.lpi_miid = None;
        self.nlpi_miid = None;
    }

    /// Build the write for `kind` with `body` as its payload
    pub fn build(
        &mut self,
        session: &dyn CaptureSession,
        use_lpi: bool,
        kind: ParamKind,
        body: &[u8],
    ) -> Result<ModuleWrite, EngineError> {
        let param = self
            .model
            .module_param(kind)
            .ok_or(PayloadError::MissingModuleParam(kind))?;

        let miid = self
            .instance_id(session, param.tag_id, use_lpi)
            .map_err(|e| {
                error!(
                    "Failed to get instance id for tag {:#x}: {}",
                    param.tag_id, e
                );
                e
            })?;
        if miid == 0 {
            return Err(PayloadError::MissingInstanceId(param.tag_id).into());
        }

        Ok(ModuleWrite {
            tag_id: param.tag_id,
            param: session_param(kind),
            payload: module_param(miid, param.param_id, body),
        })
    }

    /// Module tag and param id for `kind`
    pub fn module_ids(&self, kind: ParamKind) -> Result<(u32, u32), PayloadError> {
        self.model
            .module_param(kind)
            .map(|p| (p.tag_id, p.param_id))
            .ok_or(PayloadError::MissingModuleParam(kind))
    }
}
