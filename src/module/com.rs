//! Communication Module
//!
//! Commands flow into the pipeline through an mpsc channel; snapshots and
//! events flow out through [`DetectionSink`]s.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::io::BufRead;
use std::sync::mpsc::{self, SendError, Sender, SyncSender, TrySendError};
use std::thread;
use std::thread::JoinHandle;
use std::time::Duration;
use uuid::Uuid;

use crate::module::pipeline::DetectionSnapshot;
use crate::module::util::conf::Notification;

/// Requests handled by the pipeline between two ticks.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PipelineCommand {
    /// Finish the current tick and end the run.
    Stop,
    /// Save the next frame into the image directory.
    SaveSnapshot,
    /// Enroll the largest face of the next frame under this name.
    Enroll(String),
}

impl PipelineCommand {
    /// Parse a console line.
    ///
    /// `q` stops, `s` saves a snapshot and `a NAME` enrolls.
    pub fn parse(line: &str) -> Option<Self> {
        let line = line.trim();
        let (head, rest) = match line.split_once(char::is_whitespace) {
            Some((head, rest)) => (head, rest.trim()),
            None => (line, ""),
        };
        match head {
            "q" | "quit" | "stop" if rest.is_empty() => Some(Self::Stop),
            "s" | "snapshot" if rest.is_empty() => Some(Self::SaveSnapshot),
            "a" | "add" | "enroll" if !rest.is_empty() => Some(Self::Enroll(rest.to_string())),
            _ => None,
        }
    }
}

/// Sending half of the command channel.
#[derive(Debug, Clone)]
pub struct Controller {
    tx: Sender<PipelineCommand>,
}

impl Controller {
    pub fn new(tx: Sender<PipelineCommand>) -> Self {
        Self { tx }
    }

    pub fn stop(&self) -> Result<(), SendError<PipelineCommand>> {
        self.tx.send(PipelineCommand::Stop)
    }

    pub fn request_snapshot_save(&self) -> Result<(), SendError<PipelineCommand>> {
        self.tx.send(PipelineCommand::SaveSnapshot)
    }

    pub fn enroll(&self, name: &str) -> Result<(), SendError<PipelineCommand>> {
        self.tx.send(PipelineCommand::Enroll(name.to_string()))
    }
}

pub mod console {
    //! Line based command input.

    use super::*;

    /// Read commands from `reader` on a new thread until it closes or the
    /// pipeline hangs up.
    pub fn listen<R>(reader: R, controller: Controller) -> JoinHandle<()>
    where
        R: BufRead + Send + 'static,
    {
        thread::spawn(move || {
            log::debug!("Console Thread Started");
            for line in reader.lines() {
                let line = match line {
                    Ok(line) => line,
                    Err(e) => {
                        log::warn!("Console read failed: {}", e);
                        break;
                    }
                };
                if line.trim().is_empty() {
                    continue;
                }
                match PipelineCommand::parse(&line) {
                    Some(command) => {
                        log::info!("Console command: {:?}", command);
                        let sent = match &command {
                            PipelineCommand::Stop => controller.stop(),
                            PipelineCommand::SaveSnapshot => controller.request_snapshot_save(),
                            PipelineCommand::Enroll(name) => controller.enroll(name),
                        };
                        if sent.is_err() || command == PipelineCommand::Stop {
                            break;
                        }
                    }
                    None => log::warn!("Unknown command '{}'. Use q, s or a NAME.", line.trim()),
                }
            }
            log::debug!("Console Thread Exit Loop");
        })
    }
}

/// Kind of a [`DetectionEvent`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EventType {
    MotionStarted,
    FallConfirmed,
    IdentityEnrolled,
}

/// Something worth telling the outside world about.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DetectionEvent {
    pub id: Uuid,
    pub event_type: EventType,
    pub timestamp: DateTime<Utc>,
    pub face_name: Option<String>,
    pub emotion: Option<String>,
    pub confidence: Option<f32>,
    pub frame_path: Option<String>,
}

impl DetectionEvent {
    pub fn new(event_type: EventType, timestamp: DateTime<Utc>) -> Self {
        Self {
            id: Uuid::new_v4(),
            event_type,
            timestamp,
            face_name: None,
            emotion: None,
            confidence: None,
            frame_path: None,
        }
    }

    pub fn with_face(mut self, name: &str, emotion: Option<(&str, f32)>) -> Self {
        self.face_name = Some(name.to_string());
        if let Some((label, confidence)) = emotion {
            self.emotion = Some(label.to_string());
            self.confidence = Some(confidence);
        }
        self
    }
}

/// Consumer of pipeline output. Sinks must not fail the tick.
pub trait DetectionSink: Send {
    fn on_snapshot(&mut self, snapshot: &DetectionSnapshot);
    fn on_event(&mut self, event: &DetectionEvent);
}

/// Forwards everything to each inner sink in order.
impl DetectionSink for Vec<Box<dyn DetectionSink>> {
    fn on_snapshot(&mut self, snapshot: &DetectionSnapshot) {
        for sink in self.iter_mut() {
            sink.on_snapshot(snapshot);
        }
    }

    fn on_event(&mut self, event: &DetectionEvent) {
        for sink in self.iter_mut() {
            sink.on_event(event);
        }
    }
}

/// Writes events at info and snapshots at debug level.
#[derive(Debug, Default)]
pub struct LogSink;

impl DetectionSink for LogSink {
    fn on_snapshot(&mut self, snapshot: &DetectionSnapshot) {
        log::debug!(
            "Tick {}: motion={} faces={} fall={:?}",
            snapshot.tick,
            snapshot.motion.detected,
            snapshot.faces.len(),
            snapshot.fall
        );
    }

    fn on_event(&mut self, event: &DetectionEvent) {
        log::info!(
            "Event {:?}: face={:?} emotion={:?}",
            event.event_type,
            event.face_name,
            event.emotion
        );
    }
}

/// Posts events to a monitoring backend.
///
/// Each event type is sent at most once per `interval_ms`; the rest are
/// dropped. Requests run on a worker thread so a slow endpoint never
/// delays a tick.
pub struct HttpSink {
    interval_ms: i64,
    last_sent: HashMap<EventType, i64>, // epoch millis
    tx: Option<SyncSender<DetectionEvent>>,
    worker: Option<JoinHandle<()>>,
}

impl HttpSink {
    /// Events waiting for the worker before new ones are dropped.
    const QUEUE: usize = 16;

    pub fn new(conf: &Notification) -> Result<Self, reqwest::Error> {
        let poster = Poster {
            endpoint: conf.endpoint.clone(),
            token: conf.token.clone(),
            client: reqwest::blocking::Client::builder()
                .timeout(Duration::from_millis(conf.timeout_ms.max(1)))
                .build()?,
        };
        let (tx, rx) = mpsc::sync_channel::<DetectionEvent>(Self::QUEUE);
        let worker = thread::spawn(move || {
            log::debug!("Notification Thread Started");
            for event in rx {
                match poster.post(&event) {
                    Ok(res) => log::info!("Event {:?} posted: {}", event.event_type, res.status()),
                    Err(e) => log::warn!("Failed to post event {:?}: {}", event.event_type, e),
                }
            }
            log::debug!("Notification Thread Exit Loop");
        });
        Ok(Self {
            interval_ms: conf.interval_ms as i64,
            last_sent: HashMap::new(),
            tx: Some(tx),
            worker: Some(worker),
        })
    }

    /// `None` when no endpoint is configured or the client cannot be built.
    pub fn from_conf(conf: &Notification) -> Option<Self> {
        if conf.endpoint.trim().is_empty() {
            return None;
        }
        match Self::new(conf) {
            Ok(sink) => Some(sink),
            Err(e) => {
                log::warn!("Notifications disabled: {}", e);
                None
            }
        }
    }

    /// Whether an event of `event_type` may be sent at `now_ms`. Records the
    /// send when it may.
    fn admit(&mut self, event_type: EventType, now_ms: i64) -> bool {
        match self.last_sent.get(&event_type) {
            Some(last) if *last + self.interval_ms > now_ms => false,
            _ => {
                self.last_sent.insert(event_type, now_ms);
                true
            }
        }
    }
}

impl DetectionSink for HttpSink {
    fn on_snapshot(&mut self, _snapshot: &DetectionSnapshot) {}

    fn on_event(&mut self, event: &DetectionEvent) {
        let now = Utc::now().timestamp_millis();
        if !self.admit(event.event_type, now) {
            log::debug!("Event {:?} throttled.", event.event_type);
            return;
        }
        let Some(tx) = self.tx.as_ref() else {
            return;
        };
        match tx.try_send(event.clone()) {
            Ok(()) => (),
            Err(TrySendError::Full(event)) => {
                log::warn!("Notification queue full, event {:?} dropped.", event.event_type)
            }
            Err(TrySendError::Disconnected(event)) => {
                log::warn!("Notification worker gone, event {:?} dropped.", event.event_type)
            }
        }
    }
}

/// Sends queued events until the sink hangs up.
impl Drop for HttpSink {
    fn drop(&mut self) {
        self.tx.take();
        if let Some(worker) = self.worker.take() {
            if worker.join().is_err() {
                log::error!("Notification thread panicked.");
            }
        }
    }
}

/// Request half of [`HttpSink`], owned by its worker thread.
struct Poster {
    endpoint: String,
    token: String,
    client: reqwest::blocking::Client,
}

impl Poster {
    fn post(&self, event: &DetectionEvent) -> Result<reqwest::blocking::Response, reqwest::Error> {
        let mut request = self.client.post(&self.endpoint).json(event);
        if !self.token.is_empty() {
            request = request.bearer_auth(&self.token);
        }
        request.send()?.error_for_status()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::{Cursor, Read, Write};
    use std::net::TcpListener;
    use std::time::Instant;

    fn notification(endpoint: &str, timeout_ms: u64) -> Notification {
        Notification {
            endpoint: endpoint.into(),
            token: "secret".into(),
            interval_ms: 60000,
            timeout_ms,
        }
    }

    #[test]
    fn parse_command_test() {
        assert_eq!(PipelineCommand::parse("q"), Some(PipelineCommand::Stop));
        assert_eq!(PipelineCommand::parse(" s \n"), Some(PipelineCommand::SaveSnapshot));
        assert_eq!(
            PipelineCommand::parse("a Grandma Rose"),
            Some(PipelineCommand::Enroll("Grandma Rose".into()))
        );
        assert_eq!(PipelineCommand::parse("a"), None);
        assert_eq!(PipelineCommand::parse("q now"), None);
        assert_eq!(PipelineCommand::parse("x"), None);
    }

    #[test]
    fn console_listen_test() {
        let (tx, rx) = mpsc::channel();
        let input = Cursor::new("s\nhello\n\na Bob\nq\ns\n");
        console::listen(input, Controller::new(tx)).join().unwrap();
        let commands: Vec<PipelineCommand> = rx.try_iter().collect();
        assert_eq!(
            commands,
            vec![
                PipelineCommand::SaveSnapshot,
                PipelineCommand::Enroll("Bob".into()),
                PipelineCommand::Stop,
            ]
        );
    }

    #[test]
    fn controller_test() {
        let (tx, rx) = mpsc::channel();
        let controller = Controller::new(tx);
        controller.request_snapshot_save().unwrap();
        controller.enroll("Ann").unwrap();
        controller.stop().unwrap();
        assert_eq!(rx.recv().unwrap(), PipelineCommand::SaveSnapshot);
        assert_eq!(rx.recv().unwrap(), PipelineCommand::Enroll("Ann".into()));
        assert_eq!(rx.recv().unwrap(), PipelineCommand::Stop);
    }

    #[test]
    fn event_payload_test() {
        let event = DetectionEvent::new(EventType::FallConfirmed, Utc::now())
            .with_face("Ann", Some(("sad", 71.5)));
        let json = serde_json::to_value(&event).unwrap();
        assert_eq!(json["event_type"], "fall_confirmed");
        assert_eq!(json["face_name"], "Ann");
        assert_eq!(json["emotion"], "sad");
        assert_eq!(json["confidence"], 71.5);
        assert!(json["frame_path"].is_null());
        assert_eq!(json["id"].as_str().unwrap().len(), 36);
    }

    #[test]
    fn http_throttle_per_event_type() {
        let conf = notification("http://127.0.0.1:9/events", 5000);
        let mut sink = HttpSink::from_conf(&conf).unwrap();
        assert!(sink.admit(EventType::MotionStarted, 1_000));
        assert!(!sink.admit(EventType::MotionStarted, 30_000));
        assert!(sink.admit(EventType::FallConfirmed, 30_000));
        assert!(sink.admit(EventType::MotionStarted, 61_000));

        let disabled = Notification {
            endpoint: " ".into(),
            ..conf
        };
        assert!(HttpSink::from_conf(&disabled).is_none());
    }

    #[test]
    fn http_post_event() {
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let endpoint = format!("http://{}/events", listener.local_addr().unwrap());
        let server = thread::spawn(move || {
            let (mut stream, _) = listener.accept().unwrap();
            stream.set_read_timeout(Some(Duration::from_secs(5))).unwrap();
            let mut request = Vec::new();
            let mut buf = [0u8; 1024];
            while !String::from_utf8_lossy(&request).contains("fall_confirmed") {
                let n = stream.read(&mut buf).unwrap();
                if n == 0 {
                    break;
                }
                request.extend_from_slice(&buf[..n]);
            }
            stream
                .write_all(b"HTTP/1.1 200 OK\r\nContent-Length: 0\r\n\r\n")
                .unwrap();
            String::from_utf8_lossy(&request).to_lowercase()
        });

        let mut sink = HttpSink::from_conf(&notification(&endpoint, 5000)).unwrap();
        sink.on_event(&DetectionEvent::new(EventType::FallConfirmed, Utc::now()).with_face("Ann", None));
        drop(sink);

        let request = server.join().unwrap();
        assert!(request.starts_with("post /events"));
        assert!(request.contains("authorization: bearer secret"));
        assert!(request.contains("\"face_name\":\"ann\""));
    }

    #[test]
    fn stalled_endpoint_does_not_block_events() {
        // Accepts connections but never answers.
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let endpoint = format!("http://{}/events", listener.local_addr().unwrap());
        let mut sink = HttpSink::from_conf(&notification(&endpoint, 300)).unwrap();

        let started = Instant::now();
        sink.on_event(&DetectionEvent::new(EventType::MotionStarted, Utc::now()));
        sink.on_event(&DetectionEvent::new(EventType::FallConfirmed, Utc::now()));
        assert!(started.elapsed() < Duration::from_millis(200));

        // Each pending request gives up after the timeout.
        drop(sink);
        assert!(started.elapsed() < Duration::from_secs(5));
        drop(listener);
    }
}
