//! One time-boxed stream session per job.
//!
//! ```text
//! Idle -> Connecting -> Streaming -> Closing -> Closed
//!            |              |           ^
//!            +--------------+-----------+  (connect error, frame error,
//!                                           detection, deadline, finish)
//! ```
//!
//! Transport events and the job deadline feed one `select!`, so a silent
//! source and an endless stream without detections both end at the deadline.
//! Whatever ends the session, the connection is asked to disconnect once.

use std::time::{Duration, Instant};

use crossbeam_channel::select;

use crate::artifact::ArtifactStore;
use crate::detect::extract;
use crate::error::JobError;
use crate::ingest::{decode_frame, StreamConnection, StreamEvent, StreamTransport};
use crate::job::{Job, SessionResult};
use crate::model_cache::ModelHandle;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ConnectionState {
    Idle,
    Connecting,
    Streaming,
    Closing,
    Closed,
}

/// Per-job knobs taken from configuration.
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct SessionSettings {
    pub timeout: Duration,
    pub score_threshold: f32,
    pub top_k: usize,
}

impl Default for SessionSettings {
    fn default() -> Self {
        Self {
            timeout: Duration::from_secs(30),
            score_threshold: 0.4,
            top_k: 10,
        }
    }
}

#[derive(Debug)]
pub struct SessionReport {
    pub result: SessionResult,
    /// Frames that reached decoding. Late frames are not counted.
    pub frames_processed: usize,
    pub final_state: ConnectionState,
    pub elapsed: Duration,
}

pub struct StreamSession<'a> {
    transport: &'a mut dyn StreamTransport,
    artifacts: Option<&'a dyn ArtifactStore>,
    settings: SessionSettings,
    state: ConnectionState,
    connection: Option<Box<dyn StreamConnection>>,
    disconnect_requested: bool,
    frames: usize,
}

impl<'a> StreamSession<'a> {
    pub fn new(transport: &'a mut dyn StreamTransport, settings: SessionSettings) -> Self {
        Self {
            transport,
            artifacts: None,
            settings,
            state: ConnectionState::Idle,
            connection: None,
            disconnect_requested: false,
            frames: 0,
        }
    }

    pub fn with_artifacts(mut self, artifacts: Option<&'a dyn ArtifactStore>) -> Self {
        self.artifacts = artifacts;
        self
    }

    /// Run the session to its terminal result.
    pub fn run(mut self, job: &Job, model: &mut ModelHandle) -> SessionReport {
        let started = Instant::now();
        let deadline = started + self.settings.timeout;
        let timer = crossbeam_channel::at(deadline);
        let (events_tx, events) = crossbeam_channel::unbounded();

        self.state = ConnectionState::Connecting;
        log::debug!("connecting to {} via {}", job.source, self.transport.name());
        match self.transport.open(&job.source, events_tx) {
            Ok(connection) => self.connection = Some(connection),
            Err(e) => {
                let err = JobError::StreamConnect(format!("{:#}", e));
                log::error!("{}: {}", job.source, err);
                return self.finish(SessionResult::Exception(err.to_string()), started);
            }
        }

        let result = loop {
            let next = select! {
                recv(events) -> event => Some(event.unwrap_or(StreamEvent::Finished)),
                recv(timer) -> _ => None,
            };
            let event = match next {
                Some(event) if Instant::now() < deadline => event,
                Some(_) => {
                    log::debug!("discarding event that arrived after the deadline");
                    break self.timeout_result();
                }
                None => break self.timeout_result(),
            };
            if let Some(result) = self.on_event(event, job, model) {
                break result;
            }
        };
        self.finish(result, started)
    }

    fn timeout_result(&self) -> SessionResult {
        SessionResult::Timeout(JobError::DeadlineExceeded(self.settings.timeout).to_string())
    }

    fn on_event(
        &mut self,
        event: StreamEvent,
        job: &Job,
        model: &mut ModelHandle,
    ) -> Option<SessionResult> {
        match event {
            StreamEvent::Connected => {
                if self.state == ConnectionState::Connecting {
                    log::debug!("connected to {}", job.source);
                    self.state = ConnectionState::Streaming;
                }
                None
            }
            StreamEvent::ConnectError(reason) => {
                let err = JobError::StreamConnect(reason);
                log::error!("{}: {}", job.source, err);
                Some(SessionResult::Exception(err.to_string()))
            }
            StreamEvent::Error(reason) => {
                log::error!("stream {} failed: {}", job.source, reason);
                Some(SessionResult::Exception(reason))
            }
            StreamEvent::Finished => {
                log::debug!("stream {} finished", job.source);
                Some(SessionResult::None)
            }
            StreamEvent::Frame(payload) => {
                self.state = ConnectionState::Streaming;
                self.on_frame(&payload, job, model)
            }
        }
    }

    fn on_frame(
        &mut self,
        payload: &[u8],
        job: &Job,
        model: &mut ModelHandle,
    ) -> Option<SessionResult> {
        self.frames += 1;
        let frame = match decode_frame(payload, model.input_size()) {
            Ok(frame) => frame,
            Err(e) => {
                let err = JobError::FrameDecode(format!("{:#}", e));
                log::warn!("{}", err);
                return Some(SessionResult::InterpreterError(err.to_string()));
            }
        };

        let started = Instant::now();
        let output = match model
            .model_mut()
            .invoke(&frame.rgb, frame.width, frame.height)
        {
            Ok(output) => output,
            Err(e) => {
                let err = JobError::Inference(format!("{:#}", e));
                log::warn!("{}", err);
                return Some(SessionResult::InterpreterError(err.to_string()));
            }
        };
        log::debug!(
            "inference on frame {} took {} ms",
            self.frames,
            started.elapsed().as_millis()
        );

        let detections = extract(&output, self.settings.score_threshold, self.settings.top_k);
        if detections.is_empty() {
            return None;
        }
        for d in &detections {
            log::info!(
                "{}: detected {} ({:.2}) at [{:.2}, {:.2}, {:.2}, {:.2}]",
                job.job_type,
                model.labels().display(d.class_id),
                d.score,
                d.bbox.xmin,
                d.bbox.ymin,
                d.bbox.xmax,
                d.bbox.ymax
            );
        }

        let file = self
            .artifacts
            .and_then(|store| match store.save(&job.job_type, &frame.encoded) {
                Ok(path) => {
                    log::info!("saved detection frame to {}", path.display());
                    Some(path)
                }
                Err(e) => {
                    log::warn!("failed to save detection frame: {:#}", e);
                    None
                }
            });
        Some(SessionResult::Found { file })
    }

    fn request_disconnect(&mut self) {
        if self.disconnect_requested {
            return;
        }
        self.disconnect_requested = true;
        if let Some(connection) = self.connection.as_mut() {
            match connection.disconnect() {
                Ok(()) => log::debug!("disconnect requested"),
                Err(e) => log::warn!("disconnect failed: {:#}", e),
            }
        }
    }

    fn finish(mut self, result: SessionResult, started: Instant) -> SessionReport {
        self.state = ConnectionState::Closing;
        self.request_disconnect();
        self.state = ConnectionState::Closed;
        SessionReport {
            result,
            frames_processed: self.frames,
            final_state: self.state,
            elapsed: started.elapsed(),
        }
    }
}

impl Drop for StreamSession<'_> {
    fn drop(&mut self) {
        self.request_disconnect();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::detect::{InferenceModel, Labels, ModelOutput};
    use anyhow::{anyhow, Result};
    use base64::engine::general_purpose::STANDARD;
    use base64::Engine as _;
    use crossbeam_channel::Sender;
    use std::collections::VecDeque;
    use std::path::PathBuf;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::{Arc, Mutex};

    struct ScriptedTransport {
        script: Vec<StreamEvent>,
        hold_open: bool,
        fail_open: bool,
        disconnects: Arc<AtomicUsize>,
    }

    impl ScriptedTransport {
        fn new(script: Vec<StreamEvent>) -> Self {
            Self {
                script,
                hold_open: false,
                fail_open: false,
                disconnects: Arc::new(AtomicUsize::new(0)),
            }
        }
    }

    struct ScriptedConnection {
        _events: Option<Sender<StreamEvent>>,
        disconnects: Arc<AtomicUsize>,
    }

    impl StreamConnection for ScriptedConnection {
        fn disconnect(&mut self) -> Result<()> {
            self.disconnects.fetch_add(1, Ordering::SeqCst);
            Ok(())
        }
    }

    impl StreamTransport for ScriptedTransport {
        fn name(&self) -> &'static str {
            "scripted"
        }

        fn open(
            &mut self,
            _source: &str,
            events: Sender<StreamEvent>,
        ) -> Result<Box<dyn StreamConnection>> {
            if self.fail_open {
                return Err(anyhow!("no route to host"));
            }
            for event in self.script.drain(..) {
                events.send(event)?;
            }
            Ok(Box::new(ScriptedConnection {
                _events: self.hold_open.then_some(events),
                disconnects: self.disconnects.clone(),
            }))
        }
    }

    struct ScriptedModel {
        outputs: VecDeque<Result<ModelOutput>>,
        calls: Arc<AtomicUsize>,
    }

    impl InferenceModel for ScriptedModel {
        fn name(&self) -> &'static str {
            "scripted"
        }
        fn input_size(&self) -> (u32, u32) {
            (8, 8)
        }
        fn invoke(&mut self, rgb: &[u8], w: u32, h: u32) -> Result<ModelOutput> {
            assert_eq!(rgb.len(), (w * h * 3) as usize);
            self.calls.fetch_add(1, Ordering::SeqCst);
            self.outputs
                .pop_front()
                .unwrap_or_else(|| Ok(ModelOutput::default()))
        }
    }

    fn handle(outputs: Vec<Result<ModelOutput>>) -> (ModelHandle, Arc<AtomicUsize>) {
        let calls = Arc::new(AtomicUsize::new(0));
        let model = ScriptedModel {
            outputs: outputs.into(),
            calls: calls.clone(),
        };
        let labels = Labels::parse("0 person\n").unwrap();
        (
            ModelHandle::new("person_detection", Box::new(model), labels),
            calls,
        )
    }

    fn person(score: f32) -> ModelOutput {
        ModelOutput {
            boxes: vec![[0.1, 0.2, 0.6, 0.7]],
            class_ids: vec![0.0],
            scores: vec![score],
            count: 1,
        }
    }

    fn frame() -> StreamEvent {
        let img = image::RgbImage::from_pixel(16, 16, image::Rgb([10, 120, 200]));
        let mut out = std::io::Cursor::new(Vec::new());
        img.write_to(&mut out, image::ImageFormat::Jpeg).unwrap();
        StreamEvent::Frame(STANDARD.encode(out.into_inner()).into_bytes())
    }

    fn job() -> Job {
        Job {
            job_type: "person_detection".to_string(),
            source: "ws://cam1/stream".to_string(),
        }
    }

    fn settings(timeout_ms: u64) -> SessionSettings {
        SessionSettings {
            timeout: Duration::from_millis(timeout_ms),
            score_threshold: 0.4,
            top_k: 10,
        }
    }

    #[test]
    fn silent_source_times_out_with_one_disconnect() {
        let mut transport = ScriptedTransport::new(vec![StreamEvent::Connected]);
        transport.hold_open = true;
        let disconnects = transport.disconnects.clone();
        let (mut model, calls) = handle(vec![]);

        let report = StreamSession::new(&mut transport, settings(150)).run(&job(), &mut model);

        assert!(matches!(report.result, SessionResult::Timeout(_)));
        assert!(report.elapsed >= Duration::from_millis(150));
        assert_eq!(report.frames_processed, 0);
        assert_eq!(report.final_state, ConnectionState::Closed);
        assert_eq!(calls.load(Ordering::SeqCst), 0);
        assert_eq!(disconnects.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn stream_without_detections_times_out() {
        let mut transport =
            ScriptedTransport::new(vec![StreamEvent::Connected, frame(), frame(), frame()]);
        transport.hold_open = true;
        let disconnects = transport.disconnects.clone();
        let (mut model, calls) = handle(vec![]);

        let report = StreamSession::new(&mut transport, settings(150)).run(&job(), &mut model);

        assert!(matches!(report.result, SessionResult::Timeout(_)));
        assert_eq!(calls.load(Ordering::SeqCst), 3);
        assert_eq!(disconnects.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn first_detection_wins() {
        let mut transport =
            ScriptedTransport::new(vec![StreamEvent::Connected, frame(), frame()]);
        transport.hold_open = true;
        let disconnects = transport.disconnects.clone();
        let (mut model, calls) = handle(vec![Ok(person(0.9)), Ok(person(0.9))]);

        let report = StreamSession::new(&mut transport, settings(5_000)).run(&job(), &mut model);

        assert_eq!(report.result, SessionResult::Found { file: None });
        assert!(report.elapsed < Duration::from_secs(5));
        assert_eq!(report.frames_processed, 1);
        assert_eq!(calls.load(Ordering::SeqCst), 1);
        assert_eq!(disconnects.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn score_below_threshold_is_not_a_detection() {
        let mut transport = ScriptedTransport::new(vec![
            StreamEvent::Connected,
            frame(),
            frame(),
            StreamEvent::Finished,
        ]);
        let (mut model, calls) = handle(vec![Ok(person(0.2)), Ok(person(0.39))]);

        let report = StreamSession::new(&mut transport, settings(5_000)).run(&job(), &mut model);

        assert_eq!(report.result, SessionResult::None);
        assert_eq!(calls.load(Ordering::SeqCst), 2);
    }

    #[test]
    fn connect_error_is_exception() {
        let mut transport =
            ScriptedTransport::new(vec![StreamEvent::ConnectError("refused".to_string())]);
        transport.hold_open = true;
        let disconnects = transport.disconnects.clone();
        let (mut model, _) = handle(vec![]);

        let report = StreamSession::new(&mut transport, settings(5_000)).run(&job(), &mut model);

        match report.result {
            SessionResult::Exception(reason) => assert!(reason.contains("refused")),
            other => panic!("unexpected result {:?}", other),
        }
        assert_eq!(disconnects.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn failed_open_is_exception_without_connection() {
        let mut transport = ScriptedTransport::new(vec![]);
        transport.fail_open = true;
        let disconnects = transport.disconnects.clone();
        let (mut model, _) = handle(vec![]);

        let report = StreamSession::new(&mut transport, settings(5_000)).run(&job(), &mut model);

        assert!(matches!(report.result, SessionResult::Exception(_)));
        assert_eq!(report.final_state, ConnectionState::Closed);
        assert_eq!(disconnects.load(Ordering::SeqCst), 0);
    }

    #[test]
    fn undecodable_frame_is_interpreter_error() {
        let mut transport = ScriptedTransport::new(vec![
            StreamEvent::Connected,
            StreamEvent::Frame(b"not base64 !!".to_vec()),
            frame(),
        ]);
        transport.hold_open = true;
        let disconnects = transport.disconnects.clone();
        let (mut model, calls) = handle(vec![Ok(person(0.9))]);

        let report = StreamSession::new(&mut transport, settings(5_000)).run(&job(), &mut model);

        assert!(matches!(report.result, SessionResult::InterpreterError(_)));
        assert_eq!(calls.load(Ordering::SeqCst), 0);
        assert_eq!(disconnects.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn inference_failure_is_interpreter_error() {
        let mut transport = ScriptedTransport::new(vec![StreamEvent::Connected, frame()]);
        let (mut model, _) = handle(vec![Err(anyhow!("tensor shape mismatch"))]);

        let report = StreamSession::new(&mut transport, settings(5_000)).run(&job(), &mut model);

        match report.result {
            SessionResult::InterpreterError(reason) => {
                assert!(reason.contains("tensor shape mismatch"))
            }
            other => panic!("unexpected result {:?}", other),
        }
    }

    #[test]
    fn closed_event_channel_is_none() {
        let mut transport = ScriptedTransport::new(vec![StreamEvent::Connected]);
        let disconnects = transport.disconnects.clone();
        let (mut model, _) = handle(vec![]);

        let report = StreamSession::new(&mut transport, settings(5_000)).run(&job(), &mut model);

        assert_eq!(report.result, SessionResult::None);
        assert_eq!(disconnects.load(Ordering::SeqCst), 1);
    }

    struct RecordingStore {
        saved: Mutex<Vec<(String, usize)>>,
        fail: bool,
    }

    impl ArtifactStore for RecordingStore {
        fn save(&self, job_type: &str, image: &[u8]) -> Result<PathBuf> {
            if self.fail {
                return Err(anyhow!("disk full"));
            }
            self.saved
                .lock()
                .unwrap()
                .push((job_type.to_string(), image.len()));
            Ok(PathBuf::from("/images/person_detection-1.jpg"))
        }
    }

    #[test]
    fn detection_frame_is_saved_as_artifact() {
        let store = RecordingStore {
            saved: Mutex::new(Vec::new()),
            fail: false,
        };
        let mut transport = ScriptedTransport::new(vec![StreamEvent::Connected, frame()]);
        let (mut model, _) = handle(vec![Ok(person(0.9))]);

        let report = StreamSession::new(&mut transport, settings(5_000))
            .with_artifacts(Some(&store))
            .run(&job(), &mut model);

        assert_eq!(
            report.result,
            SessionResult::Found {
                file: Some(PathBuf::from("/images/person_detection-1.jpg"))
            }
        );
        let saved = store.saved.lock().unwrap();
        assert_eq!(saved.len(), 1);
        assert_eq!(saved[0].0, "person_detection");
        assert!(saved[0].1 > 0);
    }

    #[test]
    fn artifact_failure_still_reports_found() {
        let store = RecordingStore {
            saved: Mutex::new(Vec::new()),
            fail: true,
        };
        let mut transport = ScriptedTransport::new(vec![StreamEvent::Connected, frame()]);
        let (mut model, _) = handle(vec![Ok(person(0.9))]);

        let report = StreamSession::new(&mut transport, settings(5_000))
            .with_artifacts(Some(&store))
            .run(&job(), &mut model);

        assert_eq!(report.result, SessionResult::Found { file: None });
    }

    #[test]
    fn dropped_session_disconnects_once() {
        let mut transport = ScriptedTransport::new(vec![]);
        let disconnects = transport.disconnects.clone();
        {
            let (tx, _rx) = crossbeam_channel::unbounded();
            let mut session = StreamSession::new(&mut transport, settings(5_000));
            session.connection = Some(session.transport.open("ws://cam1", tx).unwrap());
            session.request_disconnect();
            assert_eq!(session.state, ConnectionState::Idle);
        }
        assert_eq!(disconnects.load(Ordering::SeqCst), 1);
    }
}
