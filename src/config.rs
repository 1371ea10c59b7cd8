use anyhow::{anyhow, Context, Result};
use serde::Deserialize;
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::detect::{ModelEntry, ModelRegistry, DEFAULT_INPUT_HEIGHT, DEFAULT_INPUT_WIDTH};
use crate::dispatch::DispatcherConfig;
use crate::session::SessionSettings;

const DEFAULT_BROKER_ADDR: &str = "127.0.0.1:1883";
const DEFAULT_CLIENT_ID: &str = "interpreterd";
const DEFAULT_INPUT_QUEUE: &str = "interpreter";
const DEFAULT_OUTPUT_QUEUE: &str = "notifier";
const DEFAULT_MODELS_DIR: &str = "./models";
const DEFAULT_IMAGES_DIR: &str = "./images";
const DEFAULT_TOP_K: usize = 10;
const DEFAULT_THRESHOLD: f32 = 0.4;
const DEFAULT_JOB_TIMEOUT_SECS: u64 = 30;
const DEFAULT_KEEP_ALIVE_SECS: u64 = 60;
const DEFAULT_SESSION_EXPIRY_SECS: u64 = 60 * 60;
const DEFAULT_PUBLISH_TIMEOUT_SECS: u64 = 10;
const DEFAULT_CONNECT_TIMEOUT_SECS: u64 = 10;
const DEFAULT_JOB_TYPE: &str = "person_detection";
const DEFAULT_MODEL_FILE: &str = "mobilenet_ssd_v2_face_quant_postprocess.onnx";
const DEFAULT_LABEL_FILE: &str = "coco_labels.txt";

#[derive(Debug, Deserialize, Default)]
#[serde(deny_unknown_fields)]
struct InterpreterConfigFile {
    log_level: Option<String>,
    default_job_type: Option<String>,
    broker: Option<BrokerConfigFile>,
    queues: Option<QueueConfigFile>,
    detection: Option<DetectionConfigFile>,
    paths: Option<PathsConfigFile>,
    stream: Option<StreamConfigFile>,
    models: Option<BTreeMap<String, ModelEntry>>,
}

#[derive(Debug, Deserialize, Default)]
#[serde(deny_unknown_fields)]
struct BrokerConfigFile {
    addr: Option<String>,
    username: Option<String>,
    password: Option<String>,
    client_id: Option<String>,
    share_group: Option<String>,
    keep_alive_secs: Option<u64>,
    session_expiry_secs: Option<u64>,
    publish_timeout_secs: Option<u64>,
}

#[derive(Debug, Deserialize, Default)]
#[serde(deny_unknown_fields)]
struct QueueConfigFile {
    input: Option<String>,
    output: Option<String>,
    dead_letter: Option<String>,
}

#[derive(Debug, Deserialize, Default)]
#[serde(deny_unknown_fields)]
struct DetectionConfigFile {
    top_k: Option<usize>,
    threshold: Option<f32>,
    job_timeout_secs: Option<u64>,
}

#[derive(Debug, Deserialize, Default)]
#[serde(deny_unknown_fields)]
struct PathsConfigFile {
    models_dir: Option<PathBuf>,
    images_dir: Option<PathBuf>,
    save_frames: Option<bool>,
}

#[derive(Debug, Deserialize, Default)]
#[serde(deny_unknown_fields)]
struct StreamConfigFile {
    connect_timeout_secs: Option<u64>,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum LogLevel {
    Debug,
    Info,
    Warn,
    Error,
}

impl LogLevel {
    pub fn parse(raw: &str) -> Result<Self> {
        match raw.trim().to_ascii_uppercase().as_str() {
            "DEBUG" => Ok(Self::Debug),
            "INFO" => Ok(Self::Info),
            "WARN" | "WARNING" => Ok(Self::Warn),
            "ERROR" => Ok(Self::Error),
            other => Err(anyhow!(
                "unknown log level '{}': expected DEBUG, INFO, WARN or ERROR",
                other
            )),
        }
    }

    /// Default `env_logger` filter for this level.
    pub fn filter(&self) -> &'static str {
        match self {
            Self::Debug => "debug",
            Self::Info => "info",
            Self::Warn => "warn",
            Self::Error => "error",
        }
    }
}

#[derive(Debug, Clone)]
pub struct BrokerSettings {
    pub addr: String,
    pub username: Option<String>,
    pub password: Option<String>,
    pub client_id: String,
    pub share_group: Option<String>,
    pub keep_alive: Duration,
    pub session_expiry: Duration,
    pub publish_timeout: Duration,
}

#[derive(Debug, Clone)]
pub struct QueueSettings {
    pub input: String,
    pub output: String,
    pub dead_letter: Option<String>,
}

#[derive(Debug, Clone)]
pub struct DetectionSettings {
    pub top_k: usize,
    pub threshold: f32,
    pub job_timeout: Duration,
}

#[derive(Debug, Clone)]
pub struct InterpreterConfig {
    pub log_level: LogLevel,
    pub default_job_type: String,
    pub broker: BrokerSettings,
    pub queues: QueueSettings,
    pub detection: DetectionSettings,
    pub models_dir: PathBuf,
    pub images_dir: PathBuf,
    pub save_frames: bool,
    pub stream_connect_timeout: Duration,
    pub models: BTreeMap<String, ModelEntry>,
}

impl InterpreterConfig {
    /// Load from `INTERPRETER_CONFIG` (if set), then apply env overrides.
    pub fn load() -> Result<Self> {
        let path = std::env::var("INTERPRETER_CONFIG")
            .ok()
            .filter(|p| !p.trim().is_empty())
            .map(PathBuf::from);
        Self::load_from(path.as_deref())
    }

    /// Load from an explicit file (or defaults), then apply env overrides.
    pub fn load_from(path: Option<&Path>) -> Result<Self> {
        let file_cfg = match path {
            Some(path) => read_config_file(path)?,
            None => InterpreterConfigFile::default(),
        };
        let mut cfg = Self::from_file(file_cfg)?;
        cfg.apply_env()?;
        cfg.validate()?;
        Ok(cfg)
    }

    fn from_file(file: InterpreterConfigFile) -> Result<Self> {
        let log_level = match file.log_level.as_deref() {
            Some(raw) => LogLevel::parse(raw)?,
            None => LogLevel::Info,
        };
        let broker_file = file.broker.unwrap_or_default();
        let broker = BrokerSettings {
            addr: broker_file
                .addr
                .unwrap_or_else(|| DEFAULT_BROKER_ADDR.to_string()),
            username: broker_file.username,
            password: broker_file.password,
            client_id: broker_file
                .client_id
                .unwrap_or_else(|| DEFAULT_CLIENT_ID.to_string()),
            share_group: broker_file.share_group,
            keep_alive: Duration::from_secs(
                broker_file.keep_alive_secs.unwrap_or(DEFAULT_KEEP_ALIVE_SECS),
            ),
            session_expiry: Duration::from_secs(
                broker_file
                    .session_expiry_secs
                    .unwrap_or(DEFAULT_SESSION_EXPIRY_SECS),
            ),
            publish_timeout: Duration::from_secs(
                broker_file
                    .publish_timeout_secs
                    .unwrap_or(DEFAULT_PUBLISH_TIMEOUT_SECS),
            ),
        };
        let queues_file = file.queues.unwrap_or_default();
        let queues = QueueSettings {
            input: queues_file
                .input
                .unwrap_or_else(|| DEFAULT_INPUT_QUEUE.to_string()),
            output: queues_file
                .output
                .unwrap_or_else(|| DEFAULT_OUTPUT_QUEUE.to_string()),
            dead_letter: queues_file.dead_letter,
        };
        let detection_file = file.detection.unwrap_or_default();
        let detection = DetectionSettings {
            top_k: detection_file.top_k.unwrap_or(DEFAULT_TOP_K),
            threshold: detection_file.threshold.unwrap_or(DEFAULT_THRESHOLD),
            job_timeout: Duration::from_secs(
                detection_file
                    .job_timeout_secs
                    .unwrap_or(DEFAULT_JOB_TIMEOUT_SECS),
            ),
        };
        let paths = file.paths.unwrap_or_default();
        let stream = file.stream.unwrap_or_default();
        let models = file.models.unwrap_or_else(default_models);

        Ok(Self {
            log_level,
            default_job_type: file
                .default_job_type
                .unwrap_or_else(|| DEFAULT_JOB_TYPE.to_string()),
            broker,
            queues,
            detection,
            models_dir: paths
                .models_dir
                .unwrap_or_else(|| PathBuf::from(DEFAULT_MODELS_DIR)),
            images_dir: paths
                .images_dir
                .unwrap_or_else(|| PathBuf::from(DEFAULT_IMAGES_DIR)),
            save_frames: paths.save_frames.unwrap_or(true),
            stream_connect_timeout: Duration::from_secs(
                stream
                    .connect_timeout_secs
                    .unwrap_or(DEFAULT_CONNECT_TIMEOUT_SECS),
            ),
            models,
        })
    }

    fn apply_env(&mut self) -> Result<()> {
        if let Some(addr) = env_string("BROKER_ADDR") {
            self.broker.addr = addr;
        }
        if let Some(user) = env_string("BROKER_USERNAME") {
            self.broker.username = Some(user);
        }
        if let Some(password) = env_string("BROKER_PASSWORD") {
            self.broker.password = Some(password);
        }
        if let Some(queue) = env_string("INPUT_QUEUE") {
            self.queues.input = queue;
        }
        if let Some(queue) = env_string("OUTPUT_QUEUE") {
            self.queues.output = queue;
        }
        if let Some(queue) = env_string("DEAD_LETTER_QUEUE") {
            self.queues.dead_letter = Some(queue);
        }
        if let Some(dir) = env_string("MODELS_DIR") {
            self.models_dir = PathBuf::from(dir);
        }
        if let Some(dir) = env_string("IMAGES_DIR") {
            self.images_dir = PathBuf::from(dir);
        }
        if let Some(raw) = env_string("TOP_K_OBJECTS") {
            self.detection.top_k = raw
                .parse()
                .map_err(|_| anyhow!("TOP_K_OBJECTS must be a positive integer"))?;
        }
        if let Some(raw) = env_string("OBJECT_THRESHOLD") {
            self.detection.threshold = raw
                .parse()
                .map_err(|_| anyhow!("OBJECT_THRESHOLD must be a number between 0 and 1"))?;
        }
        if let Some(raw) = env_string("JOB_TIMEOUT_SEC") {
            let seconds: u64 = raw
                .parse()
                .map_err(|_| anyhow!("JOB_TIMEOUT_SEC must be an integer number of seconds"))?;
            self.detection.job_timeout = Duration::from_secs(seconds);
        }
        if let Some(job_type) = env_string("DEFAULT_JOB_TYPE") {
            self.default_job_type = job_type;
        }
        if let Some(level) = env_string("LOG_LEVEL") {
            self.log_level = LogLevel::parse(&level)?;
        }
        Ok(())
    }

    fn validate(&self) -> Result<()> {
        let threshold = self.detection.threshold;
        if !(0.0..=1.0).contains(&threshold) {
            return Err(anyhow!(
                "detection threshold must be within [0, 1], got {}",
                threshold
            ));
        }
        if self.detection.top_k == 0 {
            return Err(anyhow!("top_k must be at least 1"));
        }
        if self.detection.job_timeout.is_zero() {
            return Err(anyhow!("job timeout must be greater than zero"));
        }
        if self.broker.publish_timeout.is_zero() {
            return Err(anyhow!("publish timeout must be greater than zero"));
        }
        if self.models.is_empty() {
            return Err(anyhow!("model registry is empty"));
        }
        if !self.models.contains_key(&self.default_job_type) {
            return Err(anyhow!(
                "default job type '{}' is not in the model registry",
                self.default_job_type
            ));
        }
        for (job_type, entry) in &self.models {
            if entry.input_width == 0 || entry.input_height == 0 {
                return Err(anyhow!("model '{}' has a zero input size", job_type));
            }
        }
        for (name, queue) in [("input", &self.queues.input), ("output", &self.queues.output)] {
            if queue.trim().is_empty() {
                return Err(anyhow!("{} queue name must not be empty", name));
            }
        }
        if self.queues.input == self.queues.output {
            return Err(anyhow!(
                "input and output queues must differ (both '{}')",
                self.queues.input
            ));
        }
        Ok(())
    }

    pub fn registry(&self) -> ModelRegistry {
        ModelRegistry::new(self.models_dir.clone(), self.models.clone())
    }

    pub fn session_settings(&self) -> SessionSettings {
        SessionSettings {
            timeout: self.detection.job_timeout,
            score_threshold: self.detection.threshold,
            top_k: self.detection.top_k,
        }
    }

    pub fn dispatcher_config(&self) -> DispatcherConfig {
        DispatcherConfig {
            output_queue: self.queues.output.clone(),
            dead_letter_queue: self.queues.dead_letter.clone(),
            session: self.session_settings(),
            default_job_type: Some(self.default_job_type.clone()),
        }
    }
}

fn default_models() -> BTreeMap<String, ModelEntry> {
    let mut models = BTreeMap::new();
    models.insert(
        DEFAULT_JOB_TYPE.to_string(),
        ModelEntry {
            model: DEFAULT_MODEL_FILE.to_string(),
            labels: DEFAULT_LABEL_FILE.to_string(),
            input_width: DEFAULT_INPUT_WIDTH,
            input_height: DEFAULT_INPUT_HEIGHT,
        },
    );
    models
}

fn env_string(key: &str) -> Option<String> {
    std::env::var(key)
        .ok()
        .map(|v| v.trim().to_string())
        .filter(|v| !v.is_empty())
}

fn read_config_file(path: &Path) -> Result<InterpreterConfigFile> {
    let raw = std::fs::read_to_string(path)
        .with_context(|| format!("failed to read config file {}", path.display()))?;
    let is_json = path
        .extension()
        .map(|ext| ext.eq_ignore_ascii_case("json"))
        .unwrap_or(false);
    let cfg = if is_json {
        serde_json::from_str(&raw).map_err(|e| anyhow!("invalid config file {}: {}", path.display(), e))?
    } else {
        toml::from_str(&raw).map_err(|e| anyhow!("invalid config file {}: {}", path.display(), e))?
    };
    Ok(cfg)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_log_levels() {
        assert_eq!(LogLevel::parse("debug").unwrap(), LogLevel::Debug);
        assert_eq!(LogLevel::parse(" INFO ").unwrap(), LogLevel::Info);
        assert_eq!(LogLevel::parse("warning").unwrap().filter(), "warn");
        assert!(LogLevel::parse("verbose").is_err());
    }

    #[test]
    fn defaults_validate() {
        let cfg = InterpreterConfig::from_file(InterpreterConfigFile::default()).unwrap();
        cfg.validate().unwrap();
        assert_eq!(cfg.queues.input, "interpreter");
        assert_eq!(cfg.queues.output, "notifier");
        assert_eq!(cfg.detection.top_k, 10);
        assert_eq!(cfg.detection.job_timeout, Duration::from_secs(30));
        let spec = cfg.registry().spec("person_detection").unwrap();
        assert_eq!(
            spec.model_file,
            PathBuf::from("./models/mobilenet_ssd_v2_face_quant_postprocess.onnx")
        );
    }

    #[test]
    fn rejects_out_of_range_detection_settings() {
        let mut cfg = InterpreterConfig::from_file(InterpreterConfigFile::default()).unwrap();
        cfg.detection.threshold = 1.5;
        assert!(cfg.validate().is_err());
        cfg.detection.threshold = 0.5;
        cfg.detection.top_k = 0;
        assert!(cfg.validate().is_err());
        cfg.detection.top_k = 3;
        cfg.detection.job_timeout = Duration::ZERO;
        assert!(cfg.validate().is_err());
    }

    #[test]
    fn default_job_type_must_be_registered() {
        let mut cfg = InterpreterConfig::from_file(InterpreterConfigFile::default()).unwrap();
        cfg.default_job_type = "vehicle_detection".to_string();
        let err = cfg.validate().unwrap_err();
        assert!(err.to_string().contains("vehicle_detection"));
    }

    #[test]
    fn rejects_unknown_keys() {
        let err = toml::from_str::<InterpreterConfigFile>("brokers = 1\n").unwrap_err();
        assert!(err.to_string().contains("brokers"));
    }
}
