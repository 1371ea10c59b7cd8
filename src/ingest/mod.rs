//! Live frame ingestion from camera stream sources.
//!
//! A `StreamTransport` dials a source and pushes `StreamEvent`s into a channel
//! owned by the session. Frame payloads are decoded with `decode_frame`.

pub mod frame;
pub mod socketio;
pub mod stream;

pub use frame::{decode_frame, DecodedFrame, MAX_JPEG_BYTES};
pub use socketio::{SocketIoConfig, SocketIoTransport};
pub use stream::{StreamConnection, StreamEvent, StreamTransport};
