/// Keyword-detection engine simulation binary
///
/// Runs one engine against the in-process capture session and fires a
/// simulated "hey_aether" detection at a fixed interval, consuming the
/// buffered keyword audio the way a second-stage detector would.

use anyhow::{Context, Result};
use std::sync::Arc;
use std::time::Duration;
use tracing::{error, info, warn};
use wakeword_engine::sim::{SimDetection, SimListener, SimResources, SimSession, SimVoiceUi};
use wakeword_engine::{
    EngineDeps, EngineRegistry, EngineSettings, Listener, ListenerState, ModuleType, ParamId,
    ParamValue,
};

const LISTENER_ID: u64 = 1;
const MODEL: &[u8] = b"hey_aether";

#[tokio::main]
async fn main() -> Result<()> {
    // Initialize tracing
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::from_default_env()
                .add_directive("wakeword_engine=debug".parse()?),
        )
        .init();

    info!("Starting AetherOS keyword-detection engine simulation");

    let settings = load_settings()?;
    let format = settings.model.format();
    let detections: u32 = env_or("WAKEWORD_SIM_DETECTIONS", 3)?;
    let interval_ms: u64 = env_or("WAKEWORD_SIM_INTERVAL_MS", 1000)?;

    let session = Arc::new(SimSession::new(format));
    let resources = Arc::new(SimResources::new());
    let voice_ui = Arc::new(SimVoiceUi::new());
    let deps = EngineDeps {
        session: session.clone(),
        resources: resources.clone(),
        voice_ui: voice_ui.clone(),
    };

    let registry = EngineRegistry::new();
    let engine = registry
        .get_instance(LISTENER_ID, ModuleType::Gmm, &settings, || deps)
        .context("Failed to create engine")?;

    let (listener, mut notifications) = SimListener::new(LISTENER_ID, 0x100);
    listener.set_durations(1500, 500);
    let handle: Arc<dyn Listener> = listener.clone();

    engine.load_model(&handle, MODEL)?;
    engine.update_conf_levels(LISTENER_ID, &[60])?;
    engine.update_buf_config(LISTENER_ID, 1500, 500)?;
    engine.set_capture_requested(true);

    // Two seconds of audio for the second stage
    let readers = engine.create_buffer(format.ms_to_bytes(2000), 1)?;
    let reader = readers
        .into_iter()
        .next()
        .context("No ring buffer reader created")?;

    engine.start_recognition(LISTENER_ID)?;
    listener.set_state(ListenerState::Active);
    info!("Engine running. Simulating {} detections", detections);

    // Keyword at 1.0s..1.5s of a 1.5s replay window
    let detection = SimDetection {
        listener: LISTENER_ID,
        kw_start: format.ms_to_bytes(1000) as u32,
        kw_end: format.ms_to_bytes(1500) as u32,
        start_us: 1_000_000,
        end_us: 1_500_000,
        ftrt_us: 1_500_000,
    };

    let mut ticker = tokio::time::interval(Duration::from_millis(interval_ms));
    let mut served = 0;
    while served < detections {
        tokio::select! {
            _ = ticker.tick() => {
                let session = session.clone();
                let payload = detection.encode();
                // The engine lock may be held for a while; keep it off the runtime
                tokio::task::spawn_blocking(move || session.trigger_detection(payload)).await?;
            }
            notified = notifications.recv() => {
                let Some(id) = notified else {
                    warn!("Notification channel closed");
                    break;
                };

                let ready = reader.unread_size();
                let mut keyword = vec![0u8; ready];
                let read = reader.read(&mut keyword);
                served += 1;
                info!(
                    "Listener {} notified: {} bytes buffered ({:.1} ms), FTRT bytes {}",
                    id,
                    read,
                    format.duration_ms(read),
                    voice_ui.ftrt_bytes()
                );

                match engine.get_parameter(ParamId::KwTransferLatency) {
                    Ok(ParamValue::KwTransferLatencyMs(ms)) => info!("Keyword transfer latency: {}ms", ms),
                    Ok(other) => warn!("Unexpected latency value: {:?}", other),
                    Err(e) => error!("Failed to read latency: {}", e),
                }

                listener.set_state(ListenerState::Active);
                engine.restart_recognition(LISTENER_ID)?;
            }
            _ = tokio::signal::ctrl_c() => {
                info!("Interrupted, shutting down");
                break;
            }
        }
    }

    // Cleanup
    engine.stop_recognition(LISTENER_ID)?;
    engine.unload_model(LISTENER_ID)?;
    registry.detach(LISTENER_ID, true);
    drop(reader);
    drop(engine);

    info!(
        "Simulation finished: {} detections, wake lock acquired {} / released {}",
        served,
        resources.acquired(),
        resources.released()
    );
    Ok(())
}

/// Load settings from `WAKEWORD_ENGINE_CONFIG` if set, then apply
/// environment overrides
fn load_settings() -> Result<EngineSettings> {
    let mut settings = match std::env::var("WAKEWORD_ENGINE_CONFIG") {
        Ok(path) => EngineSettings::from_json_file(&path)
            .with_context(|| format!("Failed to load {}", path))?,
        Err(_) => EngineSettings::default(),
    };

    settings.platform.concurrent_event_capture =
        env_or("WAKEWORD_CONCURRENT_CAPTURE", settings.platform.concurrent_event_capture)?;
    settings.validate()?;
    Ok(settings)
}

fn env_or<T>(name: &str, default: T) -> Result<T>
where
    T: std::str::FromStr,
    T::Err: std::error::Error + Send + Sync + 'static,
{
    match std::env::var(name) {
        Ok(value) => value
            .parse()
            .with_context(|| format!("Invalid value for {}: {}", name, value)),
        Err(_) => Ok(default),
    }
}
