use anyhow::Result;
use crossbeam_channel::Sender;

/// Everything a stream transport can report to a session.
///
/// Transports push these from their own thread; the session consumes them
/// in order from a single channel.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum StreamEvent {
    /// The source accepted the connection.
    Connected,
    /// The source could not be reached or refused the connection.
    ConnectError(String),
    /// One encoded frame: base64 text or raw JPEG bytes.
    Frame(Vec<u8>),
    /// The link failed after it was established.
    Error(String),
    /// The source ended the stream.
    Finished,
}

/// Dials a stream source.
pub trait StreamTransport: Send {
    /// Transport identifier.
    fn name(&self) -> &'static str;

    /// Start connecting to `source`. Must not block on the network: progress
    /// and frames are delivered through `events`.
    fn open(&mut self, source: &str, events: Sender<StreamEvent>)
        -> Result<Box<dyn StreamConnection>>;
}

/// Handle to one open (or opening) stream.
pub trait StreamConnection: Send {
    /// Ask the source to stop and close the link. Must not block on the
    /// network.
    fn disconnect(&mut self) -> Result<()>;
}
