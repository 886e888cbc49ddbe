//! Session event dispatch
//!
//! Invoked from the capture session's callback thread. A detection either
//! arms the capture loop (first detection while active) or, in concurrent
//! capture mode, queues behind the detection already being buffered with
//! its keyword window expressed relative to the primary listener's buffer.

use crate::config::ParamKind;
use crate::dump;
use crate::engine::{EngineCore, EngineInner};
use crate::format::AudioFormat;
use crate::session::{KeywordStats, ListenerId, SessionEvent};
use crate::state::EngineState;
use parking_lot::{Condvar, Mutex};
use std::time::{Duration, Instant};
use tracing::{debug, error, info, warn};

/// End-of-stream signal raised by the session after an engine reset.
///
/// Kept apart from the detection signal so restart can wait on it with its
/// own timeout.
pub struct EndOfStreamSignal {
    reached: Mutex<bool>,
    cv: Condvar,
}

impl EndOfStreamSignal {
    pub fn new() -> Self {
        Self {
            reached: Mutex::new(false),
            cv: Condvar::new(),
        }
    }

    /// Clear the flag before issuing the request that produces the signal
    pub fn arm(&self) {
        *self.reached.lock() = false;
    }

    pub fn notify(&self) {
        *self.reached.lock() = true;
        self.cv.notify_all();
    }

    /// Wait up to `timeout` for the signal; returns whether it arrived
    pub fn wait(&self, timeout: Duration) -> bool {
        let deadline = Instant::now() + timeout;
        let mut reached = self.reached.lock();
        while !*reached {
            if self.cv.wait_until(&mut reached, deadline).timed_out() {
                break;
            }
        }
        *reached
    }
}

impl Default for EndOfStreamSignal {
    fn default() -> Self {
        Self::new()
    }
}

/// Keyword window of a detection that arrived while another listener was
/// already buffering
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ConcurrentWindow {
    /// Linear byte offsets from the ring buffer's logical start. May exceed
    /// the physical capacity.
    pub start_index: usize,
    pub end_index: usize,

    /// Pre-roll actually available ahead of the keyword
    pub pre_roll: usize,

    /// Physical offset the client starts reading from
    pub read_offset: usize,

    /// Keyword indices relative to the start of the client's data
    pub client_start: usize,
    pub client_end: usize,
}

/// Place a second keyword relative to the primary detection's buffer.
///
/// The buffer begins at `primary.end_us - primary.ftrt_us`; the second
/// keyword's offsets are measured from there and converted to bytes.
pub fn concurrent_window(
    format: &AudioFormat,
    primary: &KeywordStats,
    detected: &KeywordStats,
    pre_roll_bytes: usize,
    capacity: usize,
) -> ConcurrentWindow {
    let buf_begin_us = primary.end_us.saturating_sub(primary.ftrt_us);
    let start_us = detected.start_us.saturating_sub(buf_begin_us);
    let keyword_us = detected.end_us.saturating_sub(detected.start_us);

    let start_index = format.us_to_bytes(start_us);
    let end_index = format.us_to_bytes(start_us + keyword_us);

    let wrapped_start = match capacity {
        0 => start_index,
        capacity => start_index % capacity,
    };
    let read_offset = wrapped_start.saturating_sub(pre_roll_bytes);

    // Clamp before deriving the client indices
    let pre_roll = pre_roll_bytes.min(wrapped_start);
    let client_start = pre_roll;
    let client_end = client_start + format.us_to_bytes(keyword_us);

    ConcurrentWindow {
        start_index,
        end_index,
        pre_roll,
        read_offset,
        client_start,
        client_end,
    }
}

impl EngineInner {
    pub(crate) fn on_session_event(&self, event: SessionEvent) {
        match event {
            SessionEvent::EndOfStream => {
                debug!("Received end of stream marker");
                self.eos.notify();
            }
            SessionEvent::Detection(payload) => self.handle_detection(&payload),
        }
    }

    fn handle_detection(&self, payload: &[u8]) {
        if payload.is_empty() {
            error!("Invalid detection event: empty payload");
            return;
        }

        let mut core = self.core.lock();
        let state = self.state.get();

        if state == EngineState::Loaded {
            debug!("Detection arrived during engine stop, ignore and reset");
            if let Err(e) = self.write_param(&mut core, ParamKind::EngineReset) {
                error!("Failed to reset engine: {}", e);
            }
            return;
        }

        let concurrent = self.settings.platform.concurrent_event_capture;
        let first = state == EngineState::Active;
        if !first
            && !(concurrent
                && matches!(state, EngineState::Buffering | EngineState::Detected))
        {
            debug!("Unhandled state {}, ignore event", state);
            return;
        }

        if first {
            self.resources.acquire_wake_lock();
            core.detection_time = Some(Instant::now());
            if let Some(buffer) = &core.buffer {
                buffer.reset();
            }
        }

        let parsed = match self.voice_ui.detected_listener(payload) {
            Some(listener) => self
                .voice_ui
                .parse_detection_payload(listener, payload)
                .map(|_| listener)
                .map_err(|e| error!("Failed to parse detection payload: {}", e))
                .ok(),
            None => {
                error!("No detected listener found");
                None
            }
        };

        let Some(listener) = parsed else {
            if first {
                self.resources.release_wake_lock();
            }
            return;
        };

        if first {
            self.queue_first_detection(&mut core, listener, payload);
        } else {
            self.queue_concurrent_detection(&mut core, listener);
        }

        if self.settings.platform.enable_debug_dumps {
            let index = core.dumps.next_event();
            match dump::write_detection_event(&self.settings.platform.debug_dump_dir, index, payload)
            {
                Ok(path) => debug!("Detection event stored in: {}", path.display()),
                Err(e) => warn!("Failed to dump detection event: {}", e),
            }
        }
    }

    fn queue_first_detection(&self, core: &mut EngineCore, listener: ListenerId, payload: &[u8]) {
        core.detection_queue.clear();
        core.detection_queue.push_back(listener);
        core.first_detected = Some(listener);
        core.custom_detection_event = Some(payload.to_vec());

        let index = self.voice_ui.keyword_index(listener);
        let pre_roll_ms = core
            .coordinator
            .find(listener)
            .map_or(0, |l| l.pre_roll_duration_ms());
        let pre_roll = self.format.ms_to_bytes(u64::from(pre_roll_ms));

        if let Some(buffer) = &core.buffer {
            buffer.update_kwd_config(listener, index.start, index.end, pre_roll);
        }

        self.state.transition(EngineState::Detected);
        core.detection_pending = true;
        info!("Keyword detected for listener {}, signal capture thread", listener);
        self.detection_cv.notify_one();
    }

    fn queue_concurrent_detection(&self, core: &mut EngineCore, listener: ListenerId) {
        // Without a primary the buffering cycle is already over: nothing would
        // pop a queued entry, and a non-empty queue defers every restart.
        let Some(primary) = core.first_detected else {
            warn!("No primary detection in flight, drop event for listener {}", listener);
            return;
        };

        core.detection_queue.push_back(listener);

        let primary_stats = self.voice_ui.keyword_stats(primary);
        let stats = self.voice_ui.keyword_stats(listener);
        let pre_roll_ms = core
            .coordinator
            .find(listener)
            .map_or(0, |l| l.pre_roll_duration_ms());
        let pre_roll = self.format.ms_to_bytes(u64::from(pre_roll_ms));
        let capacity = core.buffer.as_ref().map_or(0, |b| b.capacity());

        let window = concurrent_window(&self.format, &primary_stats, &stats, pre_roll, capacity);
        debug!(
            "Concurrent detection: start index {}, end index {}",
            window.start_index, window.end_index
        );

        if let Some(buffer) = &core.buffer {
            buffer.update_kwd_config(listener, window.start_index, window.end_index, pre_roll);
        }

        debug!("Concurrent detection: client read offset {}", window.read_offset);
        self.voice_ui.set_read_offset(listener, window.read_offset);
        self.voice_ui
            .update_indices(listener, window.client_start, window.client_end);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::thread;

    fn stats(start_us: u64, end_us: u64, ftrt_us: u64) -> KeywordStats {
        KeywordStats {
            start_us,
            end_us,
            ftrt_us,
        }
    }

    #[test]
    fn test_window_relative_to_primary_buffer() {
        let format = AudioFormat::default();
        let primary = stats(1_000_000, 2_000_000, 1_500_000);
        let second = stats(800_000, 1_100_000, 0);

        let window = concurrent_window(&format, &primary, &second, 16_000, 64_000);

        // Buffer begins at 500ms: keyword at 300ms..600ms
        assert_eq!(window.start_index, format.us_to_bytes(300_000));
        assert_eq!(window.end_index, format.us_to_bytes(600_000));
        // Only 300ms of pre-roll is available
        assert_eq!(window.pre_roll, 9_600);
        assert_eq!(window.read_offset, 0);
        assert_eq!(window.client_start, 9_600);
        assert_eq!(window.client_end, 19_200);
    }

    #[test]
    fn test_window_with_full_pre_roll() {
        let format = AudioFormat::default();
        let primary = stats(1_000_000, 2_000_000, 1_500_000);
        let second = stats(1_200_000, 1_500_000, 0);

        let window = concurrent_window(&format, &primary, &second, 16_000, 64_000);

        assert_eq!(window.start_index, 22_400);
        assert_eq!(window.read_offset, 6_400);
        assert_eq!(window.client_start, 16_000);
        assert_eq!(window.client_end, 25_600);
    }

    #[test]
    fn test_window_indices_stay_linear_past_capacity() {
        let format = AudioFormat::default();
        let primary = stats(0, 1_000_000, 1_000_000);
        let second = stats(3_000_000, 3_500_000, 0);

        let window = concurrent_window(&format, &primary, &second, 3_200, 32_000);

        assert_eq!(window.start_index, 96_000);
        assert_eq!(window.end_index, 112_000);
        // 96000 wraps to the start of the physical buffer
        assert_eq!(window.read_offset, 0);
        assert_eq!(window.pre_roll, 0);
        assert_eq!(window.client_start, 0);
        assert_eq!(window.client_end, 16_000);
    }

    #[test]
    fn test_window_never_negative() {
        let format = AudioFormat::default();
        let primary = stats(0, 2_000_000, 500_000);
        let early = stats(1_000_000, 1_200_000, 0);

        let window = concurrent_window(&format, &primary, &early, 1_000, 64_000);
        assert_eq!(window.start_index, 0);
        assert_eq!(window.client_start, 0);
    }

    #[test]
    fn test_end_of_stream_signal() {
        let signal = Arc::new(EndOfStreamSignal::new());
        signal.arm();
        assert!(!signal.wait(Duration::from_millis(10)));

        let notifier = Arc::clone(&signal);
        let handle = thread::spawn(move || {
            thread::sleep(Duration::from_millis(20));
            notifier.notify();
        });

        assert!(signal.wait(Duration::from_secs(5)));
        handle.join().unwrap();

        // Stays raised until re-armed
        assert!(signal.wait(Duration::from_millis(1)));
        signal.arm();
        assert!(!signal.wait(Duration::from_millis(1)));
    }
}
