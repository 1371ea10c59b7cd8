//! interpreterd - stream interpreter worker
//!
//! This daemon:
//! 1. Loads configuration and the model registry
//! 2. Preloads the default model
//! 3. Consumes jobs from the input queue, one at a time
//! 4. Runs one stream session per job and publishes its result
//! 5. Reconnects to the broker with backoff, keeping the loaded model

use anyhow::{anyhow, Context, Result};
use clap::Parser;
use rand::Rng;
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use hub_interpreter::detect::ModelLoader;
use hub_interpreter::ingest::{SocketIoConfig, SocketIoTransport};
use hub_interpreter::transport::{parse_mqtt_endpoint, TlsMaterials};
use hub_interpreter::{
    DiskArtifactStore, Dispatcher, InterpreterConfig, JobError, ModelCache, MqttJobQueue,
    MqttSettings,
};

const INITIAL_BACKOFF: Duration = Duration::from_secs(5);
const MAX_BACKOFF: Duration = Duration::from_secs(60);

#[derive(Parser, Debug)]
#[command(author, version, about = "Motion-triggered stream interpreter worker")]
struct Args {
    /// Configuration file (TOML, or JSON with a .json extension).
    #[arg(long, env = "INTERPRETER_CONFIG")]
    config: Option<PathBuf>,

    /// Enable TLS for the broker connection (implied by mqtts://).
    #[arg(long, env = "MQTT_USE_TLS")]
    mqtt_use_tls: bool,

    /// Path to a PEM-encoded CA certificate to trust for broker TLS.
    #[arg(long, env = "MQTT_TLS_CA_PATH")]
    mqtt_tls_ca_path: Option<PathBuf>,

    /// Path to a PEM-encoded client certificate for broker TLS.
    #[arg(long, env = "MQTT_TLS_CLIENT_CERT_PATH")]
    mqtt_tls_client_cert_path: Option<PathBuf>,

    /// Path to a PEM-encoded client private key for broker TLS.
    #[arg(long, env = "MQTT_TLS_CLIENT_KEY_PATH")]
    mqtt_tls_client_key_path: Option<PathBuf>,

    /// Broker client identifier. Overrides the config file.
    #[arg(long, env = "MQTT_CLIENT_ID")]
    mqtt_client_id: Option<String>,

    /// Shared subscription group, for running several workers on one queue.
    #[arg(long, env = "MQTT_SHARE_GROUP")]
    mqtt_share_group: Option<String>,
}

fn main() -> Result<()> {
    let args = Args::parse();
    let config = InterpreterConfig::load_from(args.config.as_deref())?;
    env_logger::Builder::from_env(
        env_logger::Env::default().default_filter_or(config.log_level.filter()),
    )
    .init();

    let endpoint = parse_mqtt_endpoint(&config.broker.addr, args.mqtt_use_tls)?;
    let tls = TlsMaterials::load(
        args.mqtt_tls_ca_path.as_deref(),
        args.mqtt_tls_client_cert_path.as_deref(),
        args.mqtt_tls_client_key_path.as_deref(),
    )?;
    let mqtt = MqttSettings {
        endpoint,
        tls,
        client_id: args
            .mqtt_client_id
            .unwrap_or_else(|| config.broker.client_id.clone()),
        username: config.broker.username.clone(),
        password: config.broker.password.clone(),
        input_queue: config.queues.input.clone(),
        share_group: args
            .mqtt_share_group
            .or_else(|| config.broker.share_group.clone()),
        keep_alive: config.broker.keep_alive,
        session_expiry: config.broker.session_expiry,
        publish_timeout: config.broker.publish_timeout,
    };
    mqtt.validate()?;

    log::info!("interpreterd starting");
    log::info!(
        "  broker: {}:{} (TLS: {})",
        mqtt.endpoint.host,
        mqtt.endpoint.port,
        mqtt.endpoint.use_tls
    );
    log::info!(
        "  queues: {} -> {} (dead letter: {})",
        config.queues.input,
        config.queues.output,
        config.queues.dead_letter.as_deref().unwrap_or("none")
    );
    log::info!(
        "  detection: top_k {}, threshold {}, timeout {}s",
        config.detection.top_k,
        config.detection.threshold,
        config.detection.job_timeout.as_secs()
    );
    let registry = config.registry();
    log::info!("  models: {}", registry.root().display());
    log::info!("  job types: {}", registry.job_types().join(", "));
    let cache = ModelCache::new(registry, model_loader());
    let transport = SocketIoTransport::new(SocketIoConfig {
        connect_timeout: config.stream_connect_timeout,
        ..SocketIoConfig::default()
    });
    let mut dispatcher = Dispatcher::new(cache, Box::new(transport), config.dispatcher_config());
    if config.save_frames {
        let store = DiskArtifactStore::new(config.images_dir.clone());
        std::fs::create_dir_all(store.dir())
            .with_context(|| format!("failed to create images dir {}", store.dir().display()))?;
        log::info!("  images: {}", store.dir().display());
        dispatcher = dispatcher.with_artifacts(Box::new(store));
    }
    dispatcher.preload();

    let shutdown = Arc::new(AtomicBool::new(false));
    {
        let shutdown = shutdown.clone();
        ctrlc::set_handler(move || {
            shutdown.store(true, Ordering::SeqCst);
        })
        .map_err(|e| anyhow!("error setting Ctrl-C handler: {}", e))?;
    }

    let mut backoff = INITIAL_BACKOFF;
    while !shutdown.load(Ordering::SeqCst) {
        let mut queue = MqttJobQueue::connect(&mqtt)?;
        let completed_before = dispatcher.stats().completed;
        match dispatcher.run(&mut queue, &shutdown) {
            Ok(()) => {
                queue.shutdown();
                break;
            }
            Err(e) => {
                match e.downcast_ref::<JobError>() {
                    Some(err) if err.is_fatal() => log::error!("{}", err),
                    _ => log::error!("consume loop failed: {:#}", e),
                }
                drop(queue);
                if dispatcher.stats().completed > completed_before {
                    backoff = INITIAL_BACKOFF;
                }
                let jitter = rand::thread_rng().gen_range(0..=backoff.as_millis() as u64 / 5);
                let wait = backoff + Duration::from_millis(jitter);
                log::warn!("reconnecting in {:.1}s", wait.as_secs_f32());
                sleep_unless_shutdown(wait, &shutdown);
                backoff = (backoff * 2).min(MAX_BACKOFF);
            }
        }
    }

    let stats = dispatcher.stats();
    log::info!(
        "interpreterd stopped ({} jobs completed, {} rejected)",
        stats.completed,
        stats.rejected
    );
    Ok(())
}

#[cfg(feature = "backend-tract")]
fn model_loader() -> Box<dyn ModelLoader> {
    Box::new(hub_interpreter::detect::TractLoader::new())
}

#[cfg(not(feature = "backend-tract"))]
fn model_loader() -> Box<dyn ModelLoader> {
    log::warn!("built without backend-tract; using the stub model, which never detects");
    Box::new(hub_interpreter::detect::StubLoader)
}

fn sleep_unless_shutdown(total: Duration, shutdown: &AtomicBool) {
    let step = Duration::from_millis(200);
    let mut slept = Duration::ZERO;
    while slept < total && !shutdown.load(Ordering::SeqCst) {
        std::thread::sleep(step);
        slept += step;
    }
}
