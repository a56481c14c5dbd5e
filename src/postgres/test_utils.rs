use std::collections::{HashMap, VecDeque};
use std::io;
use std::pin::Pin;
use std::task::{Context, Poll};

use bytes::Bytes;
use tokio::io::AsyncWrite;

use super::connection::Connection;
use super::message::{
    BackendMessage, CommandTag, CopyFormat, CopyOutResponse, PgError, TransactionStatus,
    UnsolicitedMessage,
};
use crate::{Error, Result};

/// In-memory connection that replays a fixed list of receive results.
pub struct ScriptedConnection {
    script: VecDeque<Result<BackendMessage>>,
    pub sent: Vec<String>,
    pub applied: Vec<BackendMessage>,
    pub dead: Option<String>,
    pub tx_status: Option<TransactionStatus>,
    pub receives: usize,
    parameters: HashMap<String, String>,
    send_error: Option<io::Error>,
    reject_unsolicited: Option<fn(&BackendMessage) -> bool>,
}

impl ScriptedConnection {
    pub fn new(messages: Vec<BackendMessage>) -> Self {
        Self {
            script: messages.into_iter().map(Ok).collect(),
            sent: Vec::new(),
            applied: Vec::new(),
            dead: None,
            tx_status: None,
            receives: 0,
            // what a server reports at startup
            parameters: HashMap::from([(
                "standard_conforming_strings".to_string(),
                "on".to_string(),
            )]),
            send_error: None,
            reject_unsolicited: None,
        }
    }

    /// Appends a receive that fails with a transport error.
    pub fn then_transport_error(mut self, kind: io::ErrorKind) -> Self {
        self.script
            .push_back(Err(Error::Transport(io::Error::new(kind, "scripted failure"))));
        self
    }

    pub fn failing_send(mut self, kind: io::ErrorKind) -> Self {
        self.send_error = Some(io::Error::new(kind, "send failed"));
        self
    }

    pub fn with_parameter(mut self, name: &str, value: &str) -> Self {
        self.parameters.insert(name.to_string(), value.to_string());
        self
    }

    /// Makes `apply_unsolicited` fail for messages matching `predicate`.
    pub fn rejecting(mut self, predicate: fn(&BackendMessage) -> bool) -> Self {
        self.reject_unsolicited = Some(predicate);
        self
    }

    pub fn remaining(&self) -> usize {
        self.script.len()
    }
}

impl Connection for ScriptedConnection {
    async fn send_query(&mut self, sql: &str) -> Result<()> {
        if let Some(e) = self.send_error.take() {
            return Err(Error::Transport(e));
        }
        self.sent.push(sql.to_string());
        Ok(())
    }

    async fn receive_message(&mut self) -> Result<BackendMessage> {
        if let Some(cause) = &self.dead {
            return Err(Error::ConnectionDead {
                cause: cause.clone(),
            });
        }
        self.receives += 1;
        self.script.pop_front().unwrap_or_else(|| {
            Err(Error::Transport(io::Error::new(
                io::ErrorKind::UnexpectedEof,
                "script exhausted",
            )))
        })
    }

    fn mark_dead(&mut self, cause: String) {
        self.dead.get_or_insert(cause);
    }

    fn is_dead(&self) -> bool {
        self.dead.is_some()
    }

    fn parameter(&self, name: &str) -> Option<&str> {
        self.parameters.get(name).map(String::as_str)
    }

    fn apply_unsolicited(&mut self, message: BackendMessage) -> Result<()> {
        if let Some(reject) = self.reject_unsolicited {
            if reject(&message) {
                return Err(Error::Unsolicited {
                    message: format!("rejected {}", message.name()),
                });
            }
        }
        if let BackendMessage::ErrorResponse(err) = message {
            return Err(Error::Server(err));
        }
        if let BackendMessage::Unsolicited(UnsolicitedMessage::ParameterStatus { name, value }) =
            &message
        {
            self.parameters.insert(name.clone(), value.clone());
        }
        self.applied.push(message);
        Ok(())
    }

    fn set_transaction_status(&mut self, status: TransactionStatus) {
        self.tx_status = Some(status);
    }
}

/// Sink that records each write and can fail on the n-th one.
#[derive(Default)]
pub struct RecordingSink {
    pub writes: Vec<Vec<u8>>,
    fail_on: Option<usize>,
}

impl RecordingSink {
    pub fn new() -> Self {
        Self::default()
    }

    /// Fails the write with zero-based index `n`.
    pub fn failing_on(n: usize) -> Self {
        Self {
            writes: Vec::new(),
            fail_on: Some(n),
        }
    }

    pub fn contents(&self) -> Vec<u8> {
        self.writes.concat()
    }
}

impl AsyncWrite for RecordingSink {
    fn poll_write(
        self: Pin<&mut Self>,
        _cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<io::Result<usize>> {
        let this = self.get_mut();
        if this.fail_on == Some(this.writes.len()) {
            return Poll::Ready(Err(io::Error::new(io::ErrorKind::Other, "disk full")));
        }
        this.writes.push(buf.to_vec());
        Poll::Ready(Ok(buf.len()))
    }

    fn poll_flush(self: Pin<&mut Self>, _cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Poll::Ready(Ok(()))
    }

    fn poll_shutdown(self: Pin<&mut Self>, _cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Poll::Ready(Ok(()))
    }
}

pub fn copy_out_response() -> BackendMessage {
    BackendMessage::CopyOutResponse(CopyOutResponse {
        format: CopyFormat::Text,
        column_formats: vec![CopyFormat::Text, CopyFormat::Text],
    })
}

pub fn data(chunk: &'static str) -> BackendMessage {
    BackendMessage::CopyData(Bytes::from_static(chunk.as_bytes()))
}

pub fn complete(tag: &'static str) -> BackendMessage {
    BackendMessage::CommandComplete(CommandTag::from(tag))
}

pub fn ready(status: TransactionStatus) -> BackendMessage {
    BackendMessage::ReadyForQuery(status)
}

pub fn error_response(message: &str) -> BackendMessage {
    BackendMessage::ErrorResponse(PgError::from_fields([
        ("severity", "ERROR"),
        ("code", "53100"),
        ("message", message),
    ]))
}

pub fn parameter_status(name: &str, value: &str) -> BackendMessage {
    BackendMessage::Unsolicited(UnsolicitedMessage::ParameterStatus {
        name: name.to_string(),
        value: value.to_string(),
    })
}

pub fn notice(message: &str) -> BackendMessage {
    BackendMessage::Unsolicited(UnsolicitedMessage::Notice(PgError::from_fields([(
        "message", message,
    )])))
}
