//! Capture loop
//!
//! One background thread per engine. It sleeps until the dispatcher queues
//! a detection, then drains replay ("faster than real time") audio and the
//! real-time audio that follows into the ring buffer, notifying each queued
//! listener once its replay window has been read.

use crate::config::ParamKind;
use crate::dump::DspOutputDump;
use crate::engine::{EngineCore, EngineError, EngineInner};
use crate::session::{ListenerId, MmapRegion};
use crate::state::EngineState;
use parking_lot::MutexGuard;
use std::sync::atomic::Ordering;
use std::thread;
use std::time::{Duration, Instant};
use tracing::{debug, error, info, trace, warn};

/// Poll interval while the mapped region has no new data
const MMAP_POLL_INTERVAL: Duration = Duration::from_millis(1);

/// Memory-mapped capture bookkeeping
#[derive(Debug, Default)]
pub struct MmapWindow {
    pub(crate) region: Option<MmapRegion>,

    /// Region size in bytes; zero when mmap capture is disabled
    pub(crate) size_bytes: usize,

    /// Frame position at the start of the current detection cycle
    pub(crate) write_position: u64,
}

impl MmapWindow {
    pub fn new(size_bytes: usize) -> Self {
        Self {
            region: None,
            size_bytes,
            write_position: 0,
        }
    }

    pub fn enabled(&self) -> bool {
        self.size_bytes != 0
    }

    /// Drop the mapped region; it is recreated on the next start
    pub fn release(&mut self) {
        if self.region.take().is_some() {
            debug!("Released mmap region");
        }
    }
}

/// Copy `dest.len()` bytes out of `region` starting at `read_offset`,
/// splitting the copy when it straddles the region end. Returns the next
/// read offset.
pub fn copy_wrapped(region: &MmapRegion, read_offset: usize, dest: &mut [u8]) -> usize {
    let size = region.len();
    if size == 0 {
        return 0;
    }

    let read_offset = read_offset % size;
    let len = dest.len();
    if read_offset + len <= size {
        region.copy_out(read_offset, dest);
        (read_offset + len) % size
    } else {
        let head = size - read_offset;
        region.copy_out(read_offset, &mut dest[..head]);
        region.copy_out(0, &mut dest[head..]);
        len - head
    }
}

impl EngineInner {
    /// Body of the capture thread
    pub(crate) fn run_capture_thread(&self) {
        info!("Capture thread started for {:?} engine", self.module_type);

        let mut core = self.core.lock();
        loop {
            while !core.detection_pending && !self.exit_thread.load(Ordering::Acquire) {
                trace!("Waiting for detection");
                self.detection_cv.wait(&mut core);
            }

            if self.exit_thread.load(Ordering::Acquire) {
                if core.detection_pending {
                    self.resources.release_wake_lock();
                }
                break;
            }
            core.detection_pending = false;

            // Skip detection handling if stopped/restarted meanwhile
            if self.state.get() != EngineState::Detected {
                debug!("Engine stopped/restarted after notification");
                self.resources.release_wake_lock();
                continue;
            }

            let Some(detected) = core.detection_queue.front().copied() else {
                self.resources.release_wake_lock();
                continue;
            };

            if core.coordinator.capture_requested() {
                if let Err(e) = self.start_buffering(&mut core, detected) {
                    warn!("Buffering for listener {} failed: {}", detected, e);
                    core.detection_queue.clear();
                    MutexGuard::unlocked(&mut core, || self.restart_after_failure(detected));
                }
            } else {
                if let Err(e) = self.write_param(&mut core, ParamKind::EngineReset) {
                    error!("Failed to reset engine: {}", e);
                }
                core.detection_queue.pop_front();
                if let Some(listener) = core.coordinator.find(detected) {
                    MutexGuard::unlocked(&mut core, || {
                        if let Err(e) = listener.notify_detected() {
                            error!("Failed to notify listener {}: {}", detected, e);
                            self.restart_after_failure(detected);
                        }
                    });
                }
            }

            // Other listeners still armed: keep detecting for them
            if core.coordinator.others_active(detected) {
                self.state.transition(EngineState::Active);
            }
            self.resources.release_wake_lock();
        }

        info!("Capture thread exiting");
    }

    fn restart_after_failure(&self, listener: ListenerId) {
        if let Err(e) = self.restart_recognition(listener) {
            error!("Failed to restart recognition for listener {}: {}", listener, e);
        }
    }

    /// Drain replay and real-time audio into the ring buffer for the
    /// detection at the front of the queue and any queued behind it
    pub(crate) fn start_buffering(
        &self,
        core: &mut MutexGuard<'_, EngineCore>,
        first: ListenerId,
    ) -> Result<(), EngineError> {
        if let Some(detected_at) = core.detection_time.take() {
            debug!(
                "Start buffering for listener {}, {}ms after detection",
                first,
                detected_at.elapsed().as_millis()
            );
        }
        self.state.transition(EngineState::Buffering);

        let result = self.buffering_loop(core, first);

        core.first_detected = None;
        debug!("Buffering finished: {:?}", result);
        result
    }

    fn buffering_loop(
        &self,
        core: &mut MutexGuard<'_, EngineCore>,
        first: ListenerId,
    ) -> Result<(), EngineError> {
        let listener = core
            .coordinator
            .find(first)
            .ok_or_else(|| EngineError::InvalidArgument(format!("listener {} not attached", first)))?;
        let buffer = core
            .buffer
            .clone()
            .ok_or_else(|| EngineError::InvalidArgument("ring buffer not created".to_string()))?;

        let read_size = listener.input_buffer_size() * listener.input_buffer_count();
        if read_size == 0 {
            return Err(EngineError::InvalidArgument(
                "listener input buffer size is zero".to_string(),
            ));
        }
        let sleep = Duration::from_millis(self.format.read_interval_ms(read_size).max(1));

        let mut bytes_to_drop = if self.module_type.is_per_model() {
            core.coordinator
                .pdk_drop_bytes(listener.model_id(), &self.format)
        } else {
            0
        };

        let mut dump = if self.settings.platform.enable_debug_dumps {
            let index = core.dumps.next_output();
            match DspOutputDump::create(&self.settings.platform.debug_dump_dir, index, self.format) {
                Ok(dump) => {
                    debug!("DSP output data stored in: {}", dump.path().display());
                    Some(dump)
                }
                Err(e) => {
                    warn!("Failed to open DSP output dump: {}", e);
                    None
                }
            }
        } else {
            None
        };

        let mmap = core.mmap.region.clone();
        let mmap_size = core.mmap.size_bytes;
        let mmap_start = core.mmap.write_position;
        let mut read_offset = match mmap_size {
            0 => 0,
            size => self.format.frames_to_bytes(mmap_start) % size,
        };
        if mmap.is_some() {
            debug!("Start reading mapped region from offset {}", read_offset);
        }

        // The first listener's end index is the real replay size; for later
        // listeners it only marks when their keyword has been pulled.
        let mut current = first;
        let mut ftrt_size = buffer.indices(current).map_or(0, |w| w.end_index);
        let mut total_read = 0usize;
        let mut event_notified = false;
        let mut transfer_begin = Instant::now();
        let mut chunk = vec![0u8; read_size];

        let result = loop {
            if self.exit_buffering.load(Ordering::Acquire) {
                break Ok(());
            }
            if self.state.get() != EngineState::Buffering {
                debug!("Engine is stopped/restarted, exit data reading");
                break Ok(());
            }

            if event_notified {
                if let Some(&next) = core.detection_queue.front() {
                    current = next;
                    ftrt_size = buffer.indices(current).map_or(0, |w| w.end_index);
                    event_notified = false;
                    transfer_begin = Instant::now();
                    debug!(
                        "New detected listener {} queued, {} pending",
                        current,
                        core.detection_queue.len()
                    );
                }
            }

            let size = if let Some(region) = &mmap {
                let position = match self.session.mmap_position(current) {
                    Ok(position) => position,
                    Err(e) => {
                        error!("Failed to get mmap position: {}", e);
                        break Err(e.into());
                    }
                };
                if position < mmap_start {
                    error!(
                        "Invalid mmap position: {} frames, start {} frames",
                        position, mmap_start
                    );
                    break Err(EngineError::Protocol("invalid mmap position".to_string()));
                }

                let written = self.format.frames_to_bytes(position - mmap_start);
                if written <= total_read {
                    MutexGuard::unlocked(core, || thread::sleep(MMAP_POLL_INTERVAL));
                    continue;
                }

                let to_read = written - total_read;
                if to_read > region.len() {
                    error!(
                        "Bytes written {} exceed mmap buffer size {}",
                        to_read,
                        region.len()
                    );
                    break Err(EngineError::Protocol(
                        "bytes written exceed mmap buffer size".to_string(),
                    ));
                }

                chunk.resize(to_read, 0);
                read_offset = copy_wrapped(region, read_offset, &mut chunk[..to_read]);
                trace!("Read {} bytes from mapped region", to_read);
                total_read += to_read;
                to_read
            } else if buffer.free_size() >= read_size {
                // Do not read past the replay window in one go
                let request = if total_read < ftrt_size && ftrt_size - total_read < read_size {
                    ftrt_size - total_read
                } else {
                    read_size
                };
                chunk.resize(read_size, 0);
                match self.session.read(current, &mut chunk[..request]) {
                    Ok(read) => {
                        trace!("Requested {}, read {}", request, read);
                        total_read += read;
                        read
                    }
                    Err(e) => {
                        error!("Failed to read from session: {}", e);
                        break Err(e.into());
                    }
                }
            } else {
                trace!("Ring buffer full, waiting for readers");
                0
            };

            if size > 0 {
                let data = &chunk[..size];
                if total_read < ftrt_size {
                    self.voice_ui.update_ftrt_data(data);
                }

                let stored = if bytes_to_drop >= size {
                    bytes_to_drop -= size;
                    &data[..0]
                } else {
                    let kept = &data[bytes_to_drop..];
                    bytes_to_drop = 0;
                    kept
                };

                if !stored.is_empty() {
                    let written = buffer.write(stored);
                    trace!("{} written to ring buffer", written);
                    if let Some(dump) = dump.as_mut() {
                        if let Err(e) = dump.write(stored) {
                            warn!("Failed to write DSP output dump: {}", e);
                        }
                    }
                }
            }

            if total_read >= ftrt_size {
                if !event_notified {
                    let latency = transfer_begin.elapsed().as_millis() as u64;
                    self.kw_transfer_latency_ms.store(latency, Ordering::Release);
                    info!(
                        "FTRT data read done! total_read_size {}, ftrt_size {}, read latency {}ms",
                        total_read, ftrt_size, latency
                    );

                    core.detection_queue.pop_front();
                    if let Some(detected) = core.coordinator.find(current) {
                        let notified = MutexGuard::unlocked(core, || detected.notify_detected());
                        if let Err(e) = notified {
                            error!("Failed to notify listener {}: {}", current, e);
                            break Err(e.into());
                        }
                    }
                    event_notified = true;
                }

                // Real-time data from here on
                MutexGuard::unlocked(core, || thread::sleep(sleep));
            } else if size == 0 {
                MutexGuard::unlocked(core, || thread::sleep(sleep));
            }
        };

        if let Some(dump) = dump {
            if let Err(e) = dump.finalize() {
                warn!("Failed to finalize DSP output dump: {}", e);
            }
        }

        result
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ramp_region(size: usize) -> MmapRegion {
        let region = MmapRegion::new(size, size as u64 / 2);
        let data: Vec<u8> = (0..size).map(|i| i as u8).collect();
        region.write_wrapped(0, &data);
        region
    }

    #[test]
    fn test_copy_without_wrap() {
        let region = ramp_region(16);
        let mut dest = [0u8; 4];

        let next = copy_wrapped(&region, 2, &mut dest);
        assert_eq!(dest, [2, 3, 4, 5]);
        assert_eq!(next, 6);
    }

    #[test]
    fn test_copy_straddling_end() {
        let region = ramp_region(16);
        let mut dest = [0u8; 6];

        let next = copy_wrapped(&region, 13, &mut dest);
        assert_eq!(dest, [13, 14, 15, 0, 1, 2]);
        assert_eq!(next, 3);
    }

    #[test]
    fn test_copy_to_exact_end_wraps_offset() {
        let region = ramp_region(8);
        let mut dest = [0u8; 4];

        assert_eq!(copy_wrapped(&region, 4, &mut dest), 0);
        assert_eq!(dest, [4, 5, 6, 7]);
    }

    #[test]
    fn test_mmap_window() {
        let mut window = MmapWindow::new(0);
        assert!(!window.enabled());

        window = MmapWindow::new(32_000);
        assert!(window.enabled());
        window.region = Some(MmapRegion::new(32_000, 16_000));
        window.release();
        assert!(window.region.is_none());
        assert_eq!(window.size_bytes, 32_000);
    }
}
