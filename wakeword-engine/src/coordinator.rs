//! Multi-listener coordination
//!
//! Tracks every listener attached to one engine and keeps the engine-wide
//! configuration in sync with them: merged confidence levels for detectors
//! running a single merged model, per-model wakeup and buffering entries
//! for per-model-slot detectors, and the shared history/pre-roll window.

use crate::format::AudioFormat;
use crate::payload::{BufferingConfig, PdkWakeupConfig, WakeupConfig, CONFIDENCE_DISABLED};
use crate::session::{Listener, ListenerId, MergedLayout};
use crate::state::ListenerState;
use std::collections::{BTreeMap, HashMap, HashSet};
use std::sync::Arc;
use tracing::{debug, warn};

/// Buffering durations requested for one model
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct ModelDurations {
    pub pre_roll_ms: u32,
    pub hist_ms: u32,
}

pub struct Coordinator {
    per_model: bool,
    listeners: Vec<Arc<dyn Listener>>,

    wakeup: WakeupConfig,
    buffering: BufferingConfig,
    capture_requested: bool,
    custom_data: Option<Vec<u8>>,

    // Merged model bookkeeping
    levels: HashMap<ListenerId, Vec<u8>>,
    merge_enabled: HashSet<ListenerId>,
    layout: MergedLayout,

    // Per-model-slot bookkeeping
    model_listeners: BTreeMap<u32, ListenerId>,
    model_buffering: BTreeMap<u32, ModelDurations>,
    model_wakeup: BTreeMap<u32, PdkWakeupConfig>,
    pdk_wakeup: PdkWakeupConfig,
    updated_models: Vec<u32>,
}

impl Coordinator {
    pub fn new(per_model: bool) -> Self {
        Self {
            per_model,
            listeners: Vec::new(),
            wakeup: WakeupConfig::default(),
            buffering: BufferingConfig::default(),
            capture_requested: false,
            custom_data: None,
            levels: HashMap::new(),
            merge_enabled: HashSet::new(),
            layout: Vec::new(),
            model_listeners: BTreeMap::new(),
            model_buffering: BTreeMap::new(),
            model_wakeup: BTreeMap::new(),
            pdk_wakeup: PdkWakeupConfig::default(),
            updated_models: Vec::new(),
        }
    }

    pub fn attach(&mut self, listener: Arc<dyn Listener>) {
        if self.find(listener.id()).is_none() {
            debug!("Attaching listener {}", listener.id());
            self.listeners.push(listener);
        }
    }

    /// Remove a listener and everything cached for it
    pub fn detach(&mut self, id: ListenerId) -> Option<Arc<dyn Listener>> {
        let position = self.listeners.iter().position(|l| l.id() == id)?;
        self.levels.remove(&id);
        self.merge_enabled.remove(&id);
        debug!("Detaching listener {}", id);
        Some(self.listeners.remove(position))
    }

    pub fn is_empty(&self) -> bool {
        self.listeners.is_empty()
    }

    pub fn len(&self) -> usize {
        self.listeners.len()
    }

    pub fn listeners(&self) -> &[Arc<dyn Listener>] {
        &self.listeners
    }

    pub fn find(&self, id: ListenerId) -> Option<Arc<dyn Listener>> {
        self.listeners.iter().find(|l| l.id() == id).cloned()
    }

    /// Listener whose identity drives the shared session
    pub fn first(&self) -> Option<Arc<dyn Listener>> {
        self.listeners.first().cloned()
    }

    pub fn first_other(&self, id: ListenerId) -> Option<Arc<dyn Listener>> {
        self.others(id).next().cloned()
    }

    fn others(&self, id: ListenerId) -> impl Iterator<Item = &Arc<dyn Listener>> {
        self.listeners.iter().filter(move |l| l.id() != id)
    }

    pub fn others_attached(&self, id: ListenerId) -> bool {
        self.others(id).next().is_some()
    }

    /// Another listener is armed or consuming a detection
    pub fn others_active(&self, id: ListenerId) -> bool {
        self.others(id).any(|l| l.current_state().is_running())
    }

    pub fn others_buffering(&self, id: ListenerId) -> bool {
        self.others(id)
            .any(|l| l.current_state() == ListenerState::Buffering)
    }

    /// Install the slot layout of a freshly merged model and re-derive the
    /// merged levels against it
    pub fn set_layout(&mut self, layout: MergedLayout) {
        self.layout = layout;
        if !self.per_model && !self.layout.is_empty() && !self.merge_enabled.is_empty() {
            let merged = self.merged_levels();
            self.wakeup.set_levels(merged);
            debug!(
                "Confidence levels for new layout: {:?}",
                self.wakeup.confidence_levels
            );
        }
    }

    /// Confidence per merged slot: the strictest level among merge-enabled
    /// listeners sharing the slot, or disabled when none is enabled
    pub fn merged_levels(&self) -> Vec<u8> {
        self.layout
            .iter()
            .map(|slot| {
                slot.iter()
                    .filter(|(id, _)| self.merge_enabled.contains(id))
                    .filter_map(|(id, index)| {
                        self.levels.get(id).and_then(|l| l.get(*index)).copied()
                    })
                    .min()
                    .unwrap_or(CONFIDENCE_DISABLED)
            })
            .collect()
    }

    /// Record a listener's confidence levels and rebuild the engine config.
    ///
    /// Detectors without wakeup config support receive the levels as an
    /// opaque custom config instead.
    pub fn update_conf_levels(
        &mut self,
        listener: &dyn Listener,
        levels: &[u8],
        engine_active: bool,
        wakeup_supported: bool,
    ) {
        if !wakeup_supported {
            self.custom_data = Some(levels.to_vec());
            return;
        }

        let id = listener.id();
        let mode = listener.recognition_mode();

        if self.per_model {
            let model_id = listener.model_id();
            let config = PdkWakeupConfig {
                model_id,
                mode,
                custom_payload_size: 0,
                confidence_levels: levels.iter().map(|&l| u32::from(l)).collect(),
            };

            if self.model_wakeup.contains_key(&model_id)
                && !self.updated_models.contains(&model_id)
                && engine_active
            {
                self.updated_models.push(model_id);
                debug!("Model id {:#x} added to updated config list", model_id);
            }

            debug!(
                "Wakeup config for model id {:#x}: mode {}, {} keywords",
                model_id,
                mode,
                levels.len()
            );
            self.model_wakeup.insert(model_id, config.clone());
            self.pdk_wakeup = config;
            return;
        }

        self.levels.insert(id, levels.to_vec());
        self.merge_enabled.insert(id);

        if !self.others_attached(id) {
            self.wakeup = WakeupConfig::new(mode as u16, levels.to_vec());
        } else {
            self.wakeup.mode |= mode as u16;
            let merged = self.merged_levels();
            self.wakeup.set_levels(merged);
        }

        debug!("Confidence levels: {:?}", self.wakeup.confidence_levels);
    }

    /// Record a listener's buffering request. With other listeners attached
    /// the shared window only ever grows.
    pub fn update_buf_config(&mut self, listener: &dyn Listener, hist_ms: u32, pre_roll_ms: u32) {
        let model_id = listener.model_id();
        self.buffering.model_id = model_id;

        if !self.others_attached(listener.id()) {
            self.buffering.hist_ms = hist_ms;
            self.buffering.pre_roll_ms = pre_roll_ms;
        } else {
            self.buffering.hist_ms = self.buffering.hist_ms.max(hist_ms);
            self.buffering.pre_roll_ms = self.buffering.pre_roll_ms.max(pre_roll_ms);
        }

        self.model_buffering.insert(
            model_id,
            ModelDurations {
                pre_roll_ms,
                hist_ms,
            },
        );
        debug!(
            "Updated hist buf: {}ms, pre roll: {}ms",
            self.buffering.hist_ms, self.buffering.pre_roll_ms
        );
    }

    /// Rebuild the engine config from the listeners left active after
    /// `stopped` stops
    pub fn update_on_stop(&mut self, stopped: ListenerId) {
        if !self.others_attached(stopped) {
            return;
        }

        let mut any_active = false;
        let mut hist_ms = 0;
        let mut pre_roll_ms = 0;
        let mut capture = false;
        for listener in self.others(stopped) {
            if listener.current_state() == ListenerState::Active {
                any_active = true;
                hist_ms = hist_ms.max(listener.hist_buffer_duration_ms());
                pre_roll_ms = pre_roll_ms.max(listener.pre_roll_duration_ms());
                capture |= listener.capture_requested();
            }
        }

        if !any_active {
            debug!("No listener is active, reset engine config");
            self.buffering.hist_ms = 0;
            self.buffering.pre_roll_ms = 0;
            self.capture_requested = false;
            return;
        }

        self.buffering.hist_ms = hist_ms;
        self.buffering.pre_roll_ms = pre_roll_ms;
        self.capture_requested = capture;

        if !self.per_model {
            self.merge_enabled.remove(&stopped);
            let merged = self.merged_levels();
            self.wakeup.set_levels(merged);
            debug!(
                "Merged confidence levels after stop: {:?}",
                self.wakeup.confidence_levels
            );
        }
    }

    /// Disable every keyword of `model_id` and queue it for re-push
    pub fn disable_model(&mut self, model_id: u32) {
        if let Some(config) = self.model_wakeup.get_mut(&model_id) {
            for level in config.confidence_levels.iter_mut() {
                debug!(
                    "Model id {:#x}: conf level {} -> {}",
                    model_id, level, CONFIDENCE_DISABLED
                );
                *level = u32::from(CONFIDENCE_DISABLED);
            }
        }
        if !self.updated_models.contains(&model_id) {
            self.updated_models.push(model_id);
        }
    }

    /// Make `model_id` the current per-model wakeup and buffering config
    pub fn select_model(&mut self, model_id: u32) {
        self.pdk_wakeup = self
            .model_wakeup
            .get(&model_id)
            .cloned()
            .unwrap_or_else(|| PdkWakeupConfig {
                model_id,
                ..Default::default()
            });
        self.pdk_wakeup.model_id = model_id;

        let durations = self
            .model_buffering
            .get(&model_id)
            .copied()
            .unwrap_or_default();
        self.buffering = BufferingConfig {
            model_id,
            hist_ms: durations.hist_ms,
            pre_roll_ms: durations.pre_roll_ms,
        };
    }

    /// Bytes of pre-roll captured on behalf of other models that must be
    /// dropped before the `model_id` listener's data
    pub fn pdk_drop_bytes(&self, model_id: u32, format: &AudioFormat) -> usize {
        let own = self
            .model_buffering
            .get(&model_id)
            .map_or(0, |d| d.pre_roll_ms);
        let drop_ms = self.buffering.pre_roll_ms.saturating_sub(own);
        format.ms_to_bytes(u64::from(drop_ms))
    }

    pub fn map_model(&mut self, model_id: u32, listener: ListenerId) {
        self.model_listeners.insert(model_id, listener);
    }

    pub fn listener_for_model(&self, model_id: u32) -> Option<ListenerId> {
        self.model_listeners.get(&model_id).copied()
    }

    /// Listener owning the first model with a wakeup config
    pub fn first_configured_listener(&self) -> Option<ListenerId> {
        self.model_wakeup
            .keys()
            .next()
            .and_then(|model_id| self.listener_for_model(*model_id))
    }

    /// Drop every per-model entry for `model_id`
    pub fn erase_model(&mut self, model_id: u32) {
        if self.model_listeners.remove(&model_id).is_none() {
            warn!("Sound model {:#x} not mapped to a listener", model_id);
        }
        if self.model_buffering.remove(&model_id).is_none() {
            warn!("No buffer config for model {:#x}", model_id);
        }
        if self.model_wakeup.remove(&model_id).is_none() {
            warn!("No wakeup config for model {:#x}", model_id);
        }
    }

    pub fn updated_models(&self) -> &[u32] {
        &self.updated_models
    }

    pub fn clear_updated_models(&mut self) {
        self.updated_models.clear();
    }

    pub fn forget_updated(&mut self, model_id: u32) {
        self.updated_models.retain(|id| *id != model_id);
    }

    /// Sticky until the next stop recomputes it
    pub fn set_capture_requested(&mut self, requested: bool) {
        self.capture_requested |= requested;
        debug!(
            "Capture requested {}, set to engine {}",
            requested, self.capture_requested
        );
    }

    pub fn capture_requested(&self) -> bool {
        self.capture_requested
    }

    pub fn has_custom_data(&self) -> bool {
        self.custom_data.is_some()
    }

    /// Custom config blob, consumed by the next write
    pub fn take_custom_data(&mut self) -> Vec<u8> {
        self.custom_data.take().unwrap_or_default()
    }

    pub fn wakeup_config(&self) -> &WakeupConfig {
        &self.wakeup
    }

    pub fn pdk_wakeup_config(&self) -> &PdkWakeupConfig {
        &self.pdk_wakeup
    }

    pub fn buffering_config(&self) -> BufferingConfig {
        self.buffering
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::session::MockListener;

    fn listener(
        id: ListenerId,
        state: ListenerState,
        hist_ms: u32,
        pre_roll_ms: u32,
    ) -> Arc<dyn Listener> {
        let mut mock = MockListener::new();
        mock.expect_id().return_const(id);
        mock.expect_model_id().return_const(id as u32 + 0x100);
        mock.expect_recognition_mode().return_const(1u32);
        mock.expect_current_state().return_const(state);
        mock.expect_hist_buffer_duration_ms().return_const(hist_ms);
        mock.expect_pre_roll_duration_ms().return_const(pre_roll_ms);
        mock.expect_capture_requested().return_const(true);
        Arc::new(mock)
    }

    fn shared_slot(a: ListenerId, b: ListenerId) -> MergedLayout {
        vec![vec![(a, 0), (b, 0)]]
    }

    #[test]
    fn test_attach_detach() {
        let mut coordinator = Coordinator::new(false);
        let a = listener(1, ListenerState::Active, 0, 0);
        let b = listener(2, ListenerState::Loaded, 0, 0);

        coordinator.attach(a.clone());
        coordinator.attach(a.clone());
        assert_eq!(coordinator.len(), 1);
        assert!(!coordinator.others_attached(1));

        coordinator.attach(b);
        assert!(coordinator.others_attached(1));
        assert!(coordinator.others_active(2));
        assert!(!coordinator.others_active(1));
        assert_eq!(coordinator.first_other(1).map(|l| l.id()), Some(2));

        assert!(coordinator.detach(1).is_some());
        assert!(coordinator.detach(1).is_none());
        assert_eq!(coordinator.first().map(|l| l.id()), Some(2));
    }

    #[test]
    fn test_single_listener_levels_used_directly() {
        let mut coordinator = Coordinator::new(false);
        let a = listener(1, ListenerState::Active, 0, 0);
        coordinator.attach(a.clone());

        coordinator.update_conf_levels(a.as_ref(), &[70, 100], false, true);

        let wakeup = coordinator.wakeup_config();
        assert_eq!(wakeup.confidence_levels, vec![70, 100]);
        assert_eq!(wakeup.user_enables, vec![1, 0]);
    }

    #[test]
    fn test_merged_levels_take_strictest_enabled() {
        let mut coordinator = Coordinator::new(false);
        let a = listener(1, ListenerState::Active, 0, 0);
        let b = listener(2, ListenerState::Active, 0, 0);
        coordinator.attach(a.clone());
        coordinator.attach(b.clone());
        coordinator.set_layout(vec![vec![(1, 0), (2, 0)], vec![(2, 1)], vec![(1, 1)]]);

        coordinator.update_conf_levels(a.as_ref(), &[60, 100], true, true);
        coordinator.update_conf_levels(b.as_ref(), &[80, 90], true, true);

        assert_eq!(coordinator.wakeup_config().confidence_levels, vec![60, 90, 100]);
        assert_eq!(coordinator.wakeup_config().user_enables, vec![1, 1, 0]);
    }

    #[test]
    fn test_stop_recomputes_levels_for_remaining() {
        let mut coordinator = Coordinator::new(false);
        let a = listener(1, ListenerState::Active, 0, 0);
        let b = listener(2, ListenerState::Active, 0, 0);
        coordinator.attach(a.clone());
        coordinator.attach(b.clone());
        coordinator.set_layout(shared_slot(1, 2));

        coordinator.update_conf_levels(a.as_ref(), &[60], true, true);
        coordinator.update_conf_levels(b.as_ref(), &[80], true, true);
        assert_eq!(coordinator.wakeup_config().confidence_levels, vec![60]);

        coordinator.update_on_stop(1);
        assert_eq!(coordinator.wakeup_config().confidence_levels, vec![80]);
    }

    #[test]
    fn test_new_layout_rederives_levels() {
        let mut coordinator = Coordinator::new(false);
        let a = listener(1, ListenerState::Active, 0, 0);
        let b = listener(2, ListenerState::Active, 0, 0);
        coordinator.attach(a.clone());
        coordinator.attach(b.clone());
        coordinator.set_layout(vec![vec![(1, 0)], vec![(2, 0)]]);
        coordinator.update_conf_levels(a.as_ref(), &[60], true, true);
        coordinator.update_conf_levels(b.as_ref(), &[80], true, true);
        assert_eq!(coordinator.wakeup_config().confidence_levels, vec![60, 80]);

        // Model of listener 1 removed from the merged model
        coordinator.detach(1);
        coordinator.set_layout(vec![vec![(2, 0)]]);
        assert_eq!(coordinator.wakeup_config().confidence_levels, vec![80]);
    }

    #[test]
    fn test_buffering_merge_monotonic() {
        let mut coordinator = Coordinator::new(false);
        let a = listener(1, ListenerState::Active, 1000, 250);
        let b = listener(2, ListenerState::Active, 2000, 500);

        coordinator.attach(a.clone());
        coordinator.update_buf_config(a.as_ref(), 1000, 250);
        coordinator.attach(b.clone());
        coordinator.update_buf_config(b.as_ref(), 2000, 500);

        assert_eq!(coordinator.buffering_config().hist_ms, 2000);
        assert_eq!(coordinator.buffering_config().pre_roll_ms, 500);

        // A smaller request never shrinks the shared window
        coordinator.update_buf_config(a.as_ref(), 1000, 250);
        assert_eq!(coordinator.buffering_config().hist_ms, 2000);

        coordinator.update_on_stop(2);
        assert_eq!(coordinator.buffering_config().hist_ms, 1000);
        assert_eq!(coordinator.buffering_config().pre_roll_ms, 250);
    }

    #[test]
    fn test_stop_with_no_active_listener_resets() {
        let mut coordinator = Coordinator::new(false);
        let a = listener(1, ListenerState::Loaded, 1000, 250);
        let b = listener(2, ListenerState::Active, 2000, 500);
        coordinator.attach(a.clone());
        coordinator.attach(b.clone());
        coordinator.update_buf_config(b.as_ref(), 2000, 500);
        coordinator.set_capture_requested(true);

        coordinator.update_on_stop(2);

        assert_eq!(coordinator.buffering_config().hist_ms, 0);
        assert_eq!(coordinator.buffering_config().pre_roll_ms, 0);
        assert!(!coordinator.capture_requested());
    }

    #[test]
    fn test_custom_config_when_wakeup_unsupported() {
        let mut coordinator = Coordinator::new(false);
        let a = listener(1, ListenerState::Active, 0, 0);

        coordinator.update_conf_levels(a.as_ref(), &[1, 2, 3], false, false);

        assert!(coordinator.wakeup_config().confidence_levels.is_empty());
        assert_eq!(coordinator.take_custom_data(), vec![1, 2, 3]);
        // Consumed once
        assert!(coordinator.take_custom_data().is_empty());
    }

    #[test]
    fn test_per_model_configs() {
        let mut coordinator = Coordinator::new(true);
        let a = listener(1, ListenerState::Active, 1000, 200);
        let b = listener(2, ListenerState::Active, 1000, 600);
        coordinator.attach(a.clone());
        coordinator.attach(b.clone());
        coordinator.map_model(0x101, 1);
        coordinator.map_model(0x102, 2);

        coordinator.update_conf_levels(a.as_ref(), &[70], false, true);
        coordinator.update_buf_config(a.as_ref(), 1000, 200);
        coordinator.update_buf_config(b.as_ref(), 1000, 600);

        // Re-configuring a known model while running queues a re-push
        coordinator.update_conf_levels(a.as_ref(), &[75], true, true);
        assert_eq!(coordinator.updated_models(), &[0x101]);

        coordinator.disable_model(0x101);
        assert_eq!(coordinator.updated_models(), &[0x101]);

        coordinator.select_model(0x101);
        assert_eq!(coordinator.pdk_wakeup_config().confidence_levels, vec![100]);
        assert_eq!(coordinator.buffering_config().pre_roll_ms, 200);

        coordinator.select_model(0x102);
        let format = AudioFormat::default();
        assert_eq!(coordinator.pdk_drop_bytes(0x101, &format), format.ms_to_bytes(400));
        assert_eq!(coordinator.pdk_drop_bytes(0x102, &format), 0);

        assert_eq!(coordinator.first_configured_listener(), Some(1));
        coordinator.erase_model(0x101);
        assert_eq!(coordinator.listener_for_model(0x101), None);
        assert_eq!(coordinator.first_configured_listener(), None);
    }
}
