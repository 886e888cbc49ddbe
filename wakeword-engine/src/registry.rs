//! Engine registry
//!
//! Maps module classifications to the engines serving them and listeners to
//! the engine they are attached to. The registry is an ordinary value owned
//! by whoever coordinates listeners, so independent registries can coexist.

use crate::config::EngineSettings;
use crate::engine::{DetectionEngine, EngineDeps, EngineError};
use crate::session::ListenerId;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::Arc;
use tracing::{debug, info};

/// Detector module classification
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ModuleType {
    Gmm,
    Pdk,
    Pdk5,
    Pdk6,
    Hotword,
    Custom,
}

impl ModuleType {
    /// Detector keeps one slot per model instead of a single merged model
    pub fn is_per_model(self) -> bool {
        matches!(self, ModuleType::Pdk | ModuleType::Pdk5 | ModuleType::Pdk6)
    }

    /// Key engines are registered under; every per-model variant shares one
    pub fn registry_key(self) -> ModuleType {
        if self.is_per_model() {
            ModuleType::Pdk
        } else {
            self
        }
    }
}

#[derive(Default)]
struct RegistryInner {
    engines: HashMap<ModuleType, Vec<Arc<DetectionEngine>>>,
    by_listener: HashMap<ListenerId, Arc<DetectionEngine>>,
    engine_count: u32,
}

#[derive(Default)]
pub struct EngineRegistry {
    inner: Mutex<RegistryInner>,
}

impl EngineRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Engine serving `listener`, creating one when the module type has
    /// none yet or (for non-GMM types) while below the supported count
    pub fn get_instance(
        &self,
        listener: ListenerId,
        module_type: ModuleType,
        settings: &EngineSettings,
        make_deps: impl FnOnce() -> EngineDeps,
    ) -> Result<Arc<DetectionEngine>, EngineError> {
        let key = module_type.registry_key();
        let mut inner = self.inner.lock();

        let existing = inner.engines.get(&key).and_then(|list| list.last().cloned());
        let create = match existing {
            None => true,
            Some(_) => {
                key != ModuleType::Gmm
                    && inner.engine_count < settings.platform.supported_engine_count
            }
        };

        let engine = match existing {
            Some(engine) if !create => {
                debug!("Reusing {:?} engine for listener {}", key, listener);
                engine
            }
            _ => {
                let engine = Arc::new(DetectionEngine::new(
                    module_type,
                    listener,
                    settings.clone(),
                    make_deps(),
                )?);
                inner
                    .engines
                    .entry(key)
                    .or_default()
                    .push(Arc::clone(&engine));
                inner.engine_count += 1;
                info!(
                    "Created {:?} engine for listener {}, engine count {}",
                    key, listener, inner.engine_count
                );
                engine
            }
        };

        inner.by_listener.insert(listener, Arc::clone(&engine));
        Ok(engine)
    }

    pub fn engine_for(&self, listener: ListenerId) -> Option<Arc<DetectionEngine>> {
        self.inner.lock().by_listener.get(&listener).cloned()
    }

    pub fn engine_count(&self) -> u32 {
        self.inner.lock().engine_count
    }

    /// Forget `listener`; with `erase_engine` set, an engine left without
    /// listeners is removed too
    pub fn detach(&self, listener: ListenerId, erase_engine: bool) {
        let mut inner = self.inner.lock();
        let Some(engine) = inner.by_listener.remove(&listener) else {
            return;
        };

        let still_used = inner
            .by_listener
            .values()
            .any(|other| Arc::ptr_eq(other, &engine));
        if !erase_engine || still_used || !engine.is_empty() {
            return;
        }

        let key = engine.module_type().registry_key();
        if let Some(list) = inner.engines.get_mut(&key) {
            list.retain(|e| !Arc::ptr_eq(e, &engine));
            if list.is_empty() {
                inner.engines.remove(&key);
            }
        }
        inner.engine_count = inner.engine_count.saturating_sub(1);
        debug!(
            "Erased {:?} engine, engine count {}",
            key, inner.engine_count
        );

        // The capture thread is joined when the last reference goes
        drop(inner);
        drop(engine);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sim::{SimResources, SimSession, SimVoiceUi};
    use crate::format::AudioFormat;
    use test_case::test_case;

    fn deps() -> EngineDeps {
        EngineDeps {
            session: Arc::new(SimSession::new(AudioFormat::default())),
            resources: Arc::new(SimResources::new()),
            voice_ui: Arc::new(SimVoiceUi::new()),
        }
    }

    fn settings(supported: u32) -> EngineSettings {
        let mut settings = EngineSettings::default();
        settings.platform.supported_engine_count = supported;
        settings
    }

    #[test_case(ModuleType::Gmm, false ; "gmm")]
    #[test_case(ModuleType::Pdk, true ; "pdk")]
    #[test_case(ModuleType::Pdk5, true ; "pdk5")]
    #[test_case(ModuleType::Pdk6, true ; "pdk6")]
    #[test_case(ModuleType::Hotword, false ; "hotword")]
    #[test_case(ModuleType::Custom, false ; "custom")]
    fn test_per_model_classification(module_type: ModuleType, per_model: bool) {
        assert_eq!(module_type.is_per_model(), per_model);
        assert_eq!(module_type.registry_key() == ModuleType::Pdk, per_model);
    }

    #[test]
    fn test_gmm_engine_shared() {
        let registry = EngineRegistry::new();
        let settings = settings(4);

        let a = registry.get_instance(1, ModuleType::Gmm, &settings, deps).unwrap();
        let b = registry.get_instance(2, ModuleType::Gmm, &settings, deps).unwrap();

        assert!(Arc::ptr_eq(&a, &b));
        assert_eq!(registry.engine_count(), 1);
        assert!(registry.engine_for(2).is_some());
    }

    #[test]
    fn test_per_model_engines_up_to_supported_count() {
        let registry = EngineRegistry::new();
        let settings = settings(2);

        let a = registry.get_instance(1, ModuleType::Pdk5, &settings, deps).unwrap();
        let b = registry.get_instance(2, ModuleType::Pdk, &settings, deps).unwrap();
        let c = registry.get_instance(3, ModuleType::Pdk6, &settings, deps).unwrap();

        assert!(!Arc::ptr_eq(&a, &b));
        // Limit reached: newest engine reused
        assert!(Arc::ptr_eq(&b, &c));
        assert_eq!(registry.engine_count(), 2);
    }

    #[test]
    fn test_detach_erases_unused_engine() {
        let registry = EngineRegistry::new();
        let settings = settings(1);

        registry.get_instance(1, ModuleType::Gmm, &settings, deps).unwrap();
        registry.get_instance(2, ModuleType::Gmm, &settings, deps).unwrap();

        registry.detach(1, true);
        assert_eq!(registry.engine_count(), 1);
        assert!(registry.engine_for(1).is_none());

        registry.detach(2, true);
        assert_eq!(registry.engine_count(), 0);

        // A fresh engine is created afterwards
        registry.get_instance(3, ModuleType::Gmm, &settings, deps).unwrap();
        assert_eq!(registry.engine_count(), 1);
    }
}
