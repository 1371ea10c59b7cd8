//! Hub interpreter
//!
//! Worker core for motion-triggered stream inference. A camera that sees
//! motion gets a job queued; a worker takes the job, opens the camera's live
//! image stream, runs a detection model on each frame until something is
//! found or the job times out, and publishes exactly one result.
//!
//! # Guarantees
//!
//! 1. **One result per job**: every accepted job produces a single
//!    `FOUND` / `TIMEOUT` / `INTERPRETER_ERROR` / `EXCEPTION` / `NONE`.
//! 2. **Ack after publish**: the job message is acknowledged only once its
//!    result is on the output queue, so a crash leads to redelivery.
//! 3. **Bounded sessions**: the job deadline ends a session even when the
//!    source never sends a frame.
//! 4. **Single disconnect**: a session closes its stream exactly once.
//! 5. **No reload on repeat**: consecutive jobs of the same type share one
//!    loaded model.
//!
//! # Module Structure
//!
//! - `dispatch`: the consume loop
//! - `session`: per-job stream state machine
//! - `model_cache`: single-slot model cache
//! - `detect`: model backends, registry, detection extraction
//! - `ingest`: stream transports and frame decoding
//! - `transport`: broker queue binding
//! - `artifact`: storage for frames that triggered a detection
//! - `job`, `error`, `config`: messages, failure taxonomy, settings

pub mod artifact;
pub mod config;
pub mod detect;
pub mod dispatch;
pub mod error;
pub mod ingest;
pub mod job;
pub mod model_cache;
pub mod session;
pub mod transport;

pub use artifact::{ArtifactStore, DiskArtifactStore};
pub use config::InterpreterConfig;
pub use detect::{extract, Detection, InferenceModel, ModelLoader, ModelOutput, ModelRegistry};
pub use dispatch::{DispatchStats, Dispatcher, DispatcherConfig, Disposition};
pub use error::JobError;
pub use ingest::{SocketIoTransport, StreamConnection, StreamEvent, StreamTransport};
pub use job::{Job, ResultMessage, SessionResult};
pub use model_cache::{ModelCache, ModelHandle};
pub use session::{ConnectionState, SessionReport, SessionSettings, StreamSession};
pub use transport::{Delivery, JobQueue, MqttJobQueue, MqttSettings};
