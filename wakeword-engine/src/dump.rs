//! Debug dumps of captured keyword audio and raw detection events

use crate::format::AudioFormat;
use std::fs::{self, File};
use std::io::BufWriter;
use std::path::{Path, PathBuf};
use thiserror::Error;
use tracing::debug;

#[derive(Error, Debug)]
pub enum DumpError {
    #[error("Dump I/O failed: {0}")]
    Io(#[from] std::io::Error),

    #[error("WAV encoding failed: {0}")]
    Wav(#[from] hound::Error),
}

/// Per-engine file indices so successive dumps never overwrite each other
#[derive(Debug, Default)]
pub struct DumpCounters {
    dsp_output: u32,
    det_event: u32,
}

impl DumpCounters {
    pub fn next_output(&mut self) -> u32 {
        let index = self.dsp_output;
        self.dsp_output += 1;
        index
    }

    pub fn next_event(&mut self) -> u32 {
        let index = self.det_event;
        self.det_event += 1;
        index
    }
}

/// WAV file receiving everything the capture loop stores for one detection
pub struct DspOutputDump {
    writer: hound::WavWriter<BufWriter<File>>,
    path: PathBuf,
    bit_width: u16,
    // Trailing bytes of an incomplete sample
    pending: Vec<u8>,
}

impl DspOutputDump {
    pub fn create(dir: &Path, index: u32, format: AudioFormat) -> Result<Self, DumpError> {
        fs::create_dir_all(dir)?;
        let path = dir.join(format!("dsp_output_{}.wav", index));

        let spec = hound::WavSpec {
            channels: format.channels,
            sample_rate: format.sample_rate,
            bits_per_sample: format.bit_width,
            sample_format: hound::SampleFormat::Int,
        };
        let writer = hound::WavWriter::create(&path, spec)?;

        Ok(Self {
            writer,
            path,
            bit_width: format.bit_width,
            pending: Vec::new(),
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Append little-endian PCM bytes
    pub fn write(&mut self, bytes: &[u8]) -> Result<(), DumpError> {
        let sample_size = usize::from(self.bit_width / 8);
        self.pending.extend_from_slice(bytes);

        let whole = self.pending.len() - self.pending.len() % sample_size;
        for sample in self.pending[..whole].chunks_exact(sample_size) {
            match self.bit_width {
                16 => self
                    .writer
                    .write_sample(i16::from_le_bytes([sample[0], sample[1]]))?,
                24 => {
                    // Sign extend through the top byte
                    let value = i32::from_le_bytes([0, sample[0], sample[1], sample[2]]) >> 8;
                    self.writer.write_sample(value)?
                }
                _ => self.writer.write_sample(i32::from_le_bytes([
                    sample[0], sample[1], sample[2], sample[3],
                ]))?,
            }
        }
        self.pending.drain(..whole);
        Ok(())
    }

    /// Flush the header; incomplete trailing samples are dropped
    pub fn finalize(self) -> Result<(), DumpError> {
        debug!("Finalizing DSP output dump {}", self.path.display());
        self.writer.finalize()?;
        Ok(())
    }
}

/// Store a raw detection payload as `det_event_<index>.bin`
pub fn write_detection_event(dir: &Path, index: u32, payload: &[u8]) -> Result<PathBuf, DumpError> {
    fs::create_dir_all(dir)?;
    let path = dir.join(format!("det_event_{}.bin", index));
    fs::write(&path, payload)?;
    Ok(path)
}
