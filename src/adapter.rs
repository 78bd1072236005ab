//! Streaming session adapter: one bidirectional inference stream per session.
//!
//! The adapter owns exactly one stream to the inference service. Sends go
//! through [`SessionAdapter::send_input`] / [`send_tool_result`]; the
//! service's output arrives as [`StreamEvent`]s on the receiver handed to
//! the execution core. `stop()` is idempotent: a closed flag guards against
//! double-closing a stream that is already going down.
//!
//! The service connection itself is abstracted behind [`InferenceConnector`]
//! so tests can inject a scripted stream (see [`scripted`]).

use async_trait::async_trait;
use tokio::sync::mpsc;
use tracing::debug;

use crate::error::{Result, SwitchboardError};
use crate::events::{StreamConfig, StreamEvent, StreamInput};

/// Send half of one open inference stream.
#[async_trait]
pub trait InferenceSink: Send {
    async fn send(&mut self, input: StreamInput) -> Result<()>;
    /// Closes the stream. Called at most once by the adapter.
    async fn close(&mut self);
}

/// An opened stream: the send half plus the service's event output.
pub struct InferenceSession {
    pub sink: Box<dyn InferenceSink>,
    pub events: mpsc::Receiver<StreamEvent>,
}

/// Opens inference streams. One implementation per service transport;
/// tests use [`scripted::ScriptedConnector`].
#[async_trait]
pub trait InferenceConnector: Send + Sync + std::fmt::Debug {
    async fn open(&self, endpoint: &str, config: StreamConfig) -> Result<InferenceSession>;
}

/// Per-session wrapper around one open inference stream.
pub struct SessionAdapter {
    sink: Box<dyn InferenceSink>,
    events: Option<mpsc::Receiver<StreamEvent>>,
    closed: bool,
}

impl SessionAdapter {
    /// Opens the stream and sends the initial configuration.
    pub async fn start(
        connector: &dyn InferenceConnector,
        endpoint: &str,
        config: StreamConfig,
    ) -> Result<Self> {
        let session = connector.open(endpoint, config).await?;
        Ok(Self {
            sink: session.sink,
            events: Some(session.events),
            closed: false,
        })
    }

    /// Takes the event receiver. The execution core calls this once and
    /// drives its loop off the returned channel.
    pub fn take_events(&mut self) -> Option<mpsc::Receiver<StreamEvent>> {
        self.events.take()
    }

    /// Forwards a user input chunk to the open stream.
    pub async fn send_input(&mut self, input: StreamInput) -> Result<()> {
        if self.closed {
            return Err(SwitchboardError::StreamClosed);
        }
        self.sink.send(input).await
    }

    /// Answers a `ToolUseRequested` event. Same closed-stream rule as
    /// `send_input`; callers that tolerate a closed stream check
    /// [`is_closed`](Self::is_closed) or discard the error.
    pub async fn send_tool_result(&mut self, id: &str, payload: serde_json::Value) -> Result<()> {
        if self.closed {
            return Err(SwitchboardError::StreamClosed);
        }
        self.sink
            .send(StreamInput::ToolResult {
                id: id.to_string(),
                payload,
            })
            .await
    }

    /// Closes the stream. Idempotent: repeated calls are no-ops.
    pub async fn stop(&mut self) {
        if self.closed {
            return;
        }
        self.closed = true;
        debug!("closing inference stream");
        self.sink.close().await;
    }

    pub fn is_closed(&self) -> bool {
        self.closed
    }
}

impl std::fmt::Debug for SessionAdapter {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SessionAdapter")
            .field("closed", &self.closed)
            .field("events_taken", &self.events.is_none())
            .finish()
    }
}

pub mod scripted {
    //! A scripted [`InferenceConnector`] for tests.
    //!
    //! Each opened stream plays the next script in the queue. A script is a
    //! sequence of steps: emit an event, or block until the core has sent a
    //! tool result (optionally echoing its payload back as a transcript,
    //! the way a model reads a tool result aloud). Every open, input frame,
    //! and close is appended to a shared log so tests can assert stream
    //! ownership ordering.

    use std::collections::VecDeque;
    use std::sync::{Arc, Mutex};

    use super::*;

    /// One step of a scripted stream.
    #[derive(Debug, Clone)]
    pub enum ScriptStep {
        /// Emit this event to the core.
        Emit(StreamEvent),
        /// Block until any input frame arrives.
        AwaitAnyInput,
        /// Block until a `ToolResult` frame arrives.
        AwaitToolResult,
        /// Block until a `ToolResult` frame arrives, then emit a final
        /// assistant transcript containing its payload.
        EchoToolResultAsFinal { prefix: String },
    }

    /// Observable connector activity, in order.
    #[derive(Debug, Clone, PartialEq)]
    pub enum ConnectorLog {
        Opened {
            stream_no: usize,
            system_instructions: String,
            voice_profile: String,
        },
        Input {
            stream_no: usize,
            frame: StreamInputKind,
        },
        Closed {
            stream_no: usize,
        },
    }

    /// Input frames reduced to a comparable shape for assertions.
    #[derive(Debug, Clone, PartialEq)]
    pub enum StreamInputKind {
        Audio,
        Text(String),
        ToolResult { id: String, payload: serde_json::Value },
    }

    impl From<&StreamInput> for StreamInputKind {
        fn from(input: &StreamInput) -> Self {
            match input {
                StreamInput::Audio { .. } => StreamInputKind::Audio,
                StreamInput::Text { text } => StreamInputKind::Text(text.clone()),
                StreamInput::ToolResult { id, payload } => StreamInputKind::ToolResult {
                    id: id.clone(),
                    payload: payload.clone(),
                },
            }
        }
    }

    #[derive(Debug, Default)]
    struct Shared {
        scripts: VecDeque<Vec<ScriptStep>>,
        log: Vec<ConnectorLog>,
        opened: usize,
        open_streams: usize,
        max_open_streams: usize,
    }

    /// Connector handing out scripted streams in order.
    #[derive(Debug, Clone, Default)]
    pub struct ScriptedConnector {
        shared: Arc<Mutex<Shared>>,
    }

    impl ScriptedConnector {
        pub fn new(scripts: Vec<Vec<ScriptStep>>) -> Self {
            Self {
                shared: Arc::new(Mutex::new(Shared {
                    scripts: scripts.into(),
                    ..Shared::default()
                })),
            }
        }

        pub fn log(&self) -> Vec<ConnectorLog> {
            self.shared.lock().unwrap().log.clone()
        }

        /// Greatest number of streams ever open at once. The single-owner
        /// invariant requires this to stay at 1 per session.
        pub fn max_open_streams(&self) -> usize {
            self.shared.lock().unwrap().max_open_streams
        }

        pub fn open_streams(&self) -> usize {
            self.shared.lock().unwrap().open_streams
        }
    }

    #[async_trait]
    impl InferenceConnector for ScriptedConnector {
        async fn open(&self, _endpoint: &str, config: StreamConfig) -> Result<InferenceSession> {
            let (script, stream_no) = {
                let mut shared = self.shared.lock().unwrap();
                let script = shared.scripts.pop_front().unwrap_or_default();
                shared.opened += 1;
                shared.open_streams += 1;
                shared.max_open_streams = shared.max_open_streams.max(shared.open_streams);
                let stream_no = shared.opened;
                shared.log.push(ConnectorLog::Opened {
                    stream_no,
                    system_instructions: config.system_instructions.clone(),
                    voice_profile: config.voice_profile.clone(),
                });
                (script, stream_no)
            };

            let (event_tx, event_rx) = mpsc::channel(32);
            let (input_tx, input_rx) = mpsc::channel::<StreamInput>(32);

            tokio::spawn(drive_script(script, event_tx, input_rx));

            Ok(InferenceSession {
                sink: Box::new(ScriptedSink {
                    shared: self.shared.clone(),
                    input_tx: Some(input_tx),
                    stream_no,
                }),
                events: event_rx,
            })
        }
    }

    async fn drive_script(
        script: Vec<ScriptStep>,
        event_tx: mpsc::Sender<StreamEvent>,
        mut input_rx: mpsc::Receiver<StreamInput>,
    ) {
        for step in script {
            match step {
                ScriptStep::Emit(event) => {
                    if event_tx.send(event).await.is_err() {
                        return;
                    }
                }
                ScriptStep::AwaitAnyInput => {
                    if input_rx.recv().await.is_none() {
                        return;
                    }
                }
                ScriptStep::AwaitToolResult => {
                    if await_tool_result(&mut input_rx).await.is_none() {
                        return;
                    }
                }
                ScriptStep::EchoToolResultAsFinal { prefix } => {
                    let Some(payload) = await_tool_result(&mut input_rx).await else {
                        return;
                    };
                    let event = StreamEvent::FinalTranscript {
                        text: format!("{}{}", prefix, payload),
                        role: crate::events::SpeakerRole::Assistant,
                    };
                    if event_tx.send(event).await.is_err() {
                        return;
                    }
                }
            }
        }
    }

    async fn await_tool_result(
        input_rx: &mut mpsc::Receiver<StreamInput>,
    ) -> Option<serde_json::Value> {
        loop {
            match input_rx.recv().await? {
                StreamInput::ToolResult { payload, .. } => return Some(payload),
                _ => continue,
            }
        }
    }

    struct ScriptedSink {
        shared: Arc<Mutex<Shared>>,
        input_tx: Option<mpsc::Sender<StreamInput>>,
        stream_no: usize,
    }

    #[async_trait]
    impl InferenceSink for ScriptedSink {
        async fn send(&mut self, input: StreamInput) -> Result<()> {
            self.shared.lock().unwrap().log.push(ConnectorLog::Input {
                stream_no: self.stream_no,
                frame: (&input).into(),
            });
            if let Some(tx) = &self.input_tx {
                // The driver may have finished its script; that is fine.
                let _ = tx.send(input).await;
            }
            Ok(())
        }

        async fn close(&mut self) {
            self.input_tx = None;
            let mut shared = self.shared.lock().unwrap();
            shared.open_streams = shared.open_streams.saturating_sub(1);
            shared.log.push(ConnectorLog::Closed {
                stream_no: self.stream_no,
            });
        }
    }
}

#[cfg(test)]
mod tests {
    use super::scripted::*;
    use super::*;
    use crate::events::SpeakerRole;
    use pretty_assertions::assert_eq;

    fn config() -> StreamConfig {
        StreamConfig {
            system_instructions: "be helpful".to_string(),
            voice_profile: "warm".to_string(),
        }
    }

    #[tokio::test]
    async fn test_start_sends_initial_configuration() {
        let connector = ScriptedConnector::new(vec![vec![]]);
        let _adapter = SessionAdapter::start(&connector, "inproc", config())
            .await
            .unwrap();

        match &connector.log()[0] {
            ConnectorLog::Opened {
                system_instructions,
                voice_profile,
                ..
            } => {
                assert_eq!(system_instructions, "be helpful");
                assert_eq!(voice_profile, "warm");
            }
            other => panic!("expected open record, got {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_events_flow_through() {
        let connector = ScriptedConnector::new(vec![vec![
            ScriptStep::Emit(StreamEvent::PartialTranscript {
                text: "hel".to_string(),
            }),
            ScriptStep::Emit(StreamEvent::FinalTranscript {
                text: "hello".to_string(),
                role: SpeakerRole::Assistant,
            }),
        ]]);

        let mut adapter = SessionAdapter::start(&connector, "inproc", config())
            .await
            .unwrap();
        let mut events = adapter.take_events().unwrap();

        assert!(matches!(
            events.recv().await.unwrap(),
            StreamEvent::PartialTranscript { .. }
        ));
        assert!(matches!(
            events.recv().await.unwrap(),
            StreamEvent::FinalTranscript { .. }
        ));
    }

    #[tokio::test]
    async fn test_send_after_stop_fails() {
        let connector = ScriptedConnector::new(vec![vec![]]);
        let mut adapter = SessionAdapter::start(&connector, "inproc", config())
            .await
            .unwrap();

        adapter.stop().await;
        let err = adapter
            .send_input(StreamInput::Text {
                text: "hi".to_string(),
            })
            .await
            .unwrap_err();
        assert!(matches!(err, SwitchboardError::StreamClosed));
    }

    #[tokio::test]
    async fn test_stop_is_idempotent() {
        let connector = ScriptedConnector::new(vec![vec![]]);
        let mut adapter = SessionAdapter::start(&connector, "inproc", config())
            .await
            .unwrap();

        adapter.stop().await;
        adapter.stop().await;
        adapter.stop().await;

        let closes = connector
            .log()
            .iter()
            .filter(|entry| matches!(entry, ConnectorLog::Closed { .. }))
            .count();
        assert_eq!(closes, 1);
        assert_eq!(connector.open_streams(), 0);
    }

    #[tokio::test]
    async fn test_tool_result_reaches_script() {
        let connector = ScriptedConnector::new(vec![vec![
            ScriptStep::EchoToolResultAsFinal {
                prefix: "result: ".to_string(),
            },
        ]]);

        let mut adapter = SessionAdapter::start(&connector, "inproc", config())
            .await
            .unwrap();
        let mut events = adapter.take_events().unwrap();

        adapter
            .send_tool_result("call_1", serde_json::json!({"balance": 42}))
            .await
            .unwrap();

        match events.recv().await.unwrap() {
            StreamEvent::FinalTranscript { text, .. } => {
                assert!(text.contains("result: "));
                assert!(text.contains("42"));
            }
            other => panic!("expected final transcript, got {:?}", other),
        }
    }
}
