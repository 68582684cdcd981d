//! The uniform backend surface the orchestrator binds sessions to.
//!
//! An [`AgentAdapter`] is a factory for per-conversation session handles. The
//! orchestrator never inspects backend detail: it calls `send` on the handle
//! and consumes a single tagged-union event channel wired exactly once at
//! session creation. Events for the sends of one session are emitted in send
//! order; a `Done`/`Error` always closes out the oldest unanswered send.

use std::{future::Future, process::Stdio};

use serde_json::{json, Value};
use thiserror::Error;
use tokio::{
    io::{AsyncBufReadExt, AsyncWriteExt, BufReader},
    process::Command,
    sync::mpsc,
};

use crate::protocol::Attachment;

#[derive(Debug, Error)]
pub enum AdapterError {
    #[error("failed to spawn backend process: {0}")]
    Spawn(#[source] std::io::Error),
    #[error("backend rejected input: {0}")]
    SendFailed(String),
}

/// Everything a completed turn hands back to the orchestrator.
#[derive(Debug, Clone, Default)]
pub struct DonePayload {
    pub attachments: Vec<Attachment>,
    /// In-memory bytes of a produced file payload, if any. These are offered
    /// to the caller out-of-band via the transfer cache, never over the relay.
    pub file_bytes: Option<Vec<u8>>,
    pub file_count: u32,
    pub result: Option<Value>,
}

#[derive(Debug)]
pub enum SessionEvent {
    Chunk {
        delta: String,
    },
    ToolEvent {
        tool_name: String,
        tool_call_id: String,
        delta: String,
    },
    Done {
        payload: Option<DonePayload>,
    },
    Error {
        message: String,
    },
}

#[derive(Debug)]
pub struct SessionEnvelope {
    pub session_id: String,
    pub event: SessionEvent,
}

/// The single outbound event channel for one session, pre-tagged with the
/// session id. Handed to the adapter once, at session creation.
#[derive(Debug, Clone)]
pub struct SessionEventSender {
    session_id: String,
    tx: mpsc::UnboundedSender<SessionEnvelope>,
}

impl SessionEventSender {
    pub fn new(session_id: impl Into<String>, tx: mpsc::UnboundedSender<SessionEnvelope>) -> Self {
        Self {
            session_id: session_id.into(),
            tx,
        }
    }

    pub fn session_id(&self) -> &str {
        &self.session_id
    }

    pub fn chunk(&self, delta: impl Into<String>) {
        self.emit(SessionEvent::Chunk {
            delta: delta.into(),
        });
    }

    pub fn tool_event(
        &self,
        tool_name: impl Into<String>,
        tool_call_id: impl Into<String>,
        delta: impl Into<String>,
    ) {
        self.emit(SessionEvent::ToolEvent {
            tool_name: tool_name.into(),
            tool_call_id: tool_call_id.into(),
            delta: delta.into(),
        });
    }

    pub fn done(&self, payload: Option<DonePayload>) {
        self.emit(SessionEvent::Done { payload });
    }

    pub fn error(&self, message: impl Into<String>) {
        self.emit(SessionEvent::Error {
            message: message.into(),
        });
    }

    fn emit(&self, event: SessionEvent) {
        let envelope = SessionEnvelope {
            session_id: self.session_id.clone(),
            event,
        };
        if self.tx.send(envelope).is_err() {
            tracing::debug!(
                target = "agent_bridge::adapter",
                session = %self.session_id,
                "orchestrator gone; dropping session event"
            );
        }
    }
}

/// One inbound turn forwarded to the backend.
#[derive(Debug, Clone, PartialEq)]
pub struct OutgoingTurn {
    pub content: String,
    pub attachments: Vec<Attachment>,
    pub client_id: Option<String>,
    pub with_files: bool,
}

pub trait SessionHandle: Send + 'static {
    fn send(&mut self, turn: OutgoingTurn) -> impl Future<Output = Result<(), AdapterError>> + Send;
    fn kill(&mut self) -> impl Future<Output = ()> + Send;
}

pub trait AgentAdapter: Send + Sync + 'static {
    type Handle: SessionHandle;

    fn create_session(
        &self,
        session_id: &str,
        events: SessionEventSender,
    ) -> impl Future<Output = Result<Self::Handle, AdapterError>> + Send;

    fn destroy_session(&self, session_id: &str) -> impl Future<Output = ()> + Send;
}

/// Adapter that runs a CLI process per turn: content goes to stdin, stdout
/// lines stream back as chunks, and process exit closes the turn.
#[derive(Debug, Clone)]
pub struct CommandAdapter {
    program: String,
    args: Vec<String>,
}

impl CommandAdapter {
    pub fn new(program: impl Into<String>, args: Vec<String>) -> Self {
        Self {
            program: program.into(),
            args,
        }
    }
}

impl AgentAdapter for CommandAdapter {
    type Handle = CommandSession;

    async fn create_session(
        &self,
        session_id: &str,
        events: SessionEventSender,
    ) -> Result<CommandSession, AdapterError> {
        let (turns_tx, mut turns_rx) = mpsc::unbounded_channel::<OutgoingTurn>();
        let program = self.program.clone();
        let args = self.args.clone();
        let worker = tokio::spawn(async move {
            while let Some(turn) = turns_rx.recv().await {
                if let Err(error) = run_turn(&program, &args, turn, &events).await {
                    events.error(error.to_string());
                }
            }
        });
        tracing::debug!(
            target = "agent_bridge::adapter",
            session = %session_id,
            program = %self.program,
            "command session created"
        );
        Ok(CommandSession { worker, turns_tx })
    }

    async fn destroy_session(&self, session_id: &str) {
        tracing::debug!(
            target = "agent_bridge::adapter",
            session = %session_id,
            "command session destroyed"
        );
    }
}

pub struct CommandSession {
    worker: tokio::task::JoinHandle<()>,
    turns_tx: mpsc::UnboundedSender<OutgoingTurn>,
}

impl SessionHandle for CommandSession {
    async fn send(&mut self, turn: OutgoingTurn) -> Result<(), AdapterError> {
        self.turns_tx
            .send(turn)
            .map_err(|_| AdapterError::SendFailed("session worker stopped".into()))
    }

    async fn kill(&mut self) {
        // Aborting the worker drops any in-flight child future; kill_on_drop
        // takes the process down with it.
        self.worker.abort();
    }
}

async fn run_turn(
    program: &str,
    args: &[String],
    turn: OutgoingTurn,
    events: &SessionEventSender,
) -> Result<(), AdapterError> {
    let mut child = Command::new(program)
        .args(args)
        .stdin(Stdio::piped())
        .stdout(Stdio::piped())
        .stderr(Stdio::null())
        .kill_on_drop(true)
        .spawn()
        .map_err(AdapterError::Spawn)?;

    if let Some(mut stdin) = child.stdin.take() {
        stdin
            .write_all(turn.content.as_bytes())
            .await
            .map_err(|e| AdapterError::SendFailed(e.to_string()))?;
        stdin
            .write_all(b"\n")
            .await
            .map_err(|e| AdapterError::SendFailed(e.to_string()))?;
        // Dropping stdin closes the pipe so line-oriented CLIs see EOF.
    }

    if let Some(stdout) = child.stdout.take() {
        let mut lines = BufReader::new(stdout).lines();
        while let Ok(Some(line)) = lines.next_line().await {
            events.chunk(line);
        }
    }

    let status = child
        .wait()
        .await
        .map_err(|e| AdapterError::SendFailed(e.to_string()))?;
    if status.success() {
        events.done(Some(DonePayload {
            result: Some(json!({ "exit_code": 0 })),
            ..DonePayload::default()
        }));
    } else {
        events.error(format!("backend exited with {status}"));
    }
    Ok(())
}
