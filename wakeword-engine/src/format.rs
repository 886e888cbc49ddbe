//! PCM stream format and time/byte conversions
//!
//! Every offset the engine exchanges with the capture session and the
//! listeners is a byte count into interleaved PCM, so all duration math
//! goes through [`AudioFormat`].

use serde::{Deserialize, Serialize};

pub const BITS_PER_BYTE: u64 = 8;
pub const MS_PER_SEC: u64 = 1_000;
pub const US_PER_SEC: u64 = 1_000_000;

/// Audio format of the capture stream
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct AudioFormat {
    pub sample_rate: u32,
    pub bit_width: u16,
    pub channels: u16,
}

impl Default for AudioFormat {
    fn default() -> Self {
        Self {
            sample_rate: 16000,
            bit_width: 16,
            channels: 1,
        }
    }
}

impl AudioFormat {
    /// Create a new audio format
    pub fn new(sample_rate: u32, bit_width: u16, channels: u16) -> Self {
        Self {
            sample_rate,
            bit_width,
            channels,
        }
    }

    /// Bytes per interleaved frame (one sample for every channel)
    pub fn frame_size(&self) -> usize {
        (self.channels as usize * self.bit_width as usize) / BITS_PER_BYTE as usize
    }

    /// Bytes per second of audio
    pub fn byte_rate(&self) -> u64 {
        self.sample_rate as u64 * self.bit_width as u64 * self.channels as u64 / BITS_PER_BYTE
    }

    pub fn bytes_per_ms(&self) -> u64 {
        self.byte_rate() / MS_PER_SEC
    }

    /// Convert a duration in microseconds to a frame-aligned byte count
    pub fn us_to_bytes(&self, us: u64) -> usize {
        let frame = self.frame_size().max(1) as u64;
        let bytes = us * self.byte_rate() / US_PER_SEC;
        (bytes - bytes % frame) as usize
    }

    pub fn ms_to_bytes(&self, ms: u64) -> usize {
        self.us_to_bytes(ms * 1_000)
    }

    pub fn frames_to_bytes(&self, frames: u64) -> usize {
        frames as usize * self.frame_size()
    }

    pub fn bytes_to_frames(&self, bytes: usize) -> u64 {
        match self.frame_size() {
            0 => 0,
            frame => (bytes / frame) as u64,
        }
    }

    /// Duration of `bytes` of audio in milliseconds
    pub fn duration_ms(&self, bytes: usize) -> f64 {
        match self.byte_rate() {
            0 => 0.0,
            rate => bytes as f64 * MS_PER_SEC as f64 / rate as f64,
        }
    }

    /// Interval the capture loop sleeps between real-time reads so that one
    /// read of `read_size` bytes is consumed per period of produced audio.
    pub fn read_interval_ms(&self, read_size: usize) -> u64 {
        match self.byte_rate() {
            0 => 0,
            rate => read_size as u64 * MS_PER_SEC / rate,
        }
    }
}
