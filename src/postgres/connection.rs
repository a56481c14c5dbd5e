use std::collections::HashMap;
use std::fmt;
use std::io;

use bytes::BytesMut;
use postgres_protocol::message::frontend;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tracing::{debug, info, warn};

use super::message::{BackendMessage, PgError, TransactionStatus, UnsolicitedMessage};
use crate::config::ConnectionConfig;
use crate::{Error, Result};

/// Exclusive-access transport used by the COPY OUT receiver.
///
/// Implementors are driven by a single task through `&mut self`; nothing
/// here is shared or locked.
#[allow(async_fn_in_trait)]
pub trait Connection {
    /// Sends a simple-protocol query.
    async fn send_query(&mut self, sql: &str) -> Result<()>;

    /// Waits for the next complete backend message.
    async fn receive_message(&mut self) -> Result<BackendMessage>;

    /// Permanently retires the connection. Later sends and receives fail
    /// with [`Error::ConnectionDead`].
    fn mark_dead(&mut self, cause: String);

    fn is_dead(&self) -> bool;

    /// Last value the server reported for a runtime parameter.
    fn parameter(&self, name: &str) -> Option<&str>;

    /// Applies a message that is not part of the in-flight command.
    fn apply_unsolicited(&mut self, message: BackendMessage) -> Result<()>;

    fn set_transaction_status(&mut self, status: TransactionStatus);
}

type NoticeHandler = Box<dyn FnMut(&PgError) + Send>;

/// A connection over an already established and authenticated stream.
///
/// The handshake is the caller's business; `PgConnection` starts reading
/// at the first message after it.
pub struct PgConnection<S> {
    stream: S,
    read_buf: BytesMut,
    write_buf: BytesMut,
    parameters: HashMap<String, String>,
    backend_key: Option<(i32, i32)>,
    tx_status: TransactionStatus,
    // ReadyForQuery messages owed for queries already sent
    pending_ready: usize,
    dead: Option<String>,
    on_notice: Option<NoticeHandler>,
}

impl<S> PgConnection<S>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    pub fn new(stream: S) -> Self {
        Self::with_config(stream, &ConnectionConfig::default())
    }

    pub fn with_config(stream: S, config: &ConnectionConfig) -> Self {
        Self {
            stream,
            read_buf: BytesMut::with_capacity(config.read_buffer_size),
            write_buf: BytesMut::new(),
            parameters: HashMap::new(),
            backend_key: None,
            tx_status: TransactionStatus::Idle,
            pending_ready: 0,
            dead: None,
            on_notice: None,
        }
    }

    /// Registers a callback invoked for every `NoticeResponse`.
    pub fn on_notice(&mut self, handler: impl FnMut(&PgError) + Send + 'static) {
        self.on_notice = Some(Box::new(handler));
    }

    /// Records a parameter the server reported during a startup handled
    /// outside this connection, e.g. `standard_conforming_strings`.
    pub fn set_parameter(
        &mut self,
        name: impl Into<String>,
        value: impl Into<String>,
    ) -> Result<()> {
        self.apply_parameter_status(name.into(), value.into())
    }

    /// Process id and secret key, once the server has sent them.
    pub fn backend_key(&self) -> Option<(i32, i32)> {
        self.backend_key
    }

    pub fn transaction_status(&self) -> TransactionStatus {
        self.tx_status
    }

    /// Why the connection was retired, if it was.
    pub fn dead_cause(&self) -> Option<&str> {
        self.dead.as_deref()
    }

    pub fn into_inner(self) -> S {
        self.stream
    }

    fn ensure_alive(&self) -> Result<()> {
        match &self.dead {
            Some(cause) => Err(Error::ConnectionDead {
                cause: cause.clone(),
            }),
            None => Ok(()),
        }
    }

    fn apply_parameter_status(&mut self, name: String, value: String) -> Result<()> {
        if name == "client_encoding" && !value.eq_ignore_ascii_case("UTF8") {
            return Err(Error::Unsolicited {
                message: format!("Unsupported client_encoding: {}", value),
            });
        }
        debug!("Parameter status: {}={}", name, value);
        self.parameters.insert(name, value);
        Ok(())
    }
}

impl<S> Connection for PgConnection<S>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    async fn send_query(&mut self, sql: &str) -> Result<()> {
        self.ensure_alive()?;

        self.write_buf.clear();
        frontend::query(sql, &mut self.write_buf).map_err(Error::Transport)?;
        self.stream
            .write_all(&self.write_buf)
            .await
            .map_err(Error::Transport)?;
        self.stream.flush().await.map_err(Error::Transport)?;
        self.pending_ready += 1;

        debug!("Sent query ({} bytes)", self.write_buf.len());
        Ok(())
    }

    async fn receive_message(&mut self) -> Result<BackendMessage> {
        self.ensure_alive()?;

        loop {
            if let Some(message) = BackendMessage::decode(&mut self.read_buf)? {
                if let BackendMessage::ReadyForQuery(_) = message {
                    self.pending_ready = self.pending_ready.saturating_sub(1);
                }
                return Ok(message);
            }

            let n = self
                .stream
                .read_buf(&mut self.read_buf)
                .await
                .map_err(Error::Transport)?;
            if n == 0 {
                return Err(Error::Transport(io::Error::new(
                    io::ErrorKind::UnexpectedEof,
                    "server closed the connection",
                )));
            }
        }
    }

    fn mark_dead(&mut self, cause: String) {
        if self.dead.is_none() {
            warn!("Marking connection dead: {}", cause);
            self.dead = Some(cause);
        }
    }

    fn is_dead(&self) -> bool {
        self.dead.is_some()
    }

    fn parameter(&self, name: &str) -> Option<&str> {
        self.parameters.get(name).map(String::as_str)
    }

    fn apply_unsolicited(&mut self, message: BackendMessage) -> Result<()> {
        match message {
            BackendMessage::Unsolicited(UnsolicitedMessage::ParameterStatus { name, value }) => {
                self.apply_parameter_status(name, value)
            }
            BackendMessage::Unsolicited(UnsolicitedMessage::Notice(notice)) => {
                warn!(
                    code = notice.code().unwrap_or_default(),
                    "Server notice: {}",
                    notice.message()
                );
                if let Some(handler) = self.on_notice.as_mut() {
                    handler(&notice);
                }
                Ok(())
            }
            BackendMessage::Unsolicited(UnsolicitedMessage::Notification {
                process_id,
                channel,
                ..
            }) => {
                debug!(
                    "Dropping notification on channel '{}' from pid {}",
                    channel, process_id
                );
                Ok(())
            }
            BackendMessage::Unsolicited(UnsolicitedMessage::BackendKeyData {
                process_id,
                secret_key,
            }) => {
                info!("Backend process id: {}", process_id);
                self.backend_key = Some((process_id, secret_key));
                Ok(())
            }
            BackendMessage::ErrorResponse(err) => Err(Error::Server(err)),
            BackendMessage::ReadyForQuery(status) => {
                self.tx_status = status;
                if self.pending_ready > 0 {
                    // left over from an earlier query that returned at CommandComplete
                    return Ok(());
                }
                Err(Error::Protocol(
                    "Query completed without starting COPY OUT".to_string(),
                ))
            }
            other => {
                debug!("Ignoring {} outside of its command", other.name());
                Ok(())
            }
        }
    }

    fn set_transaction_status(&mut self, status: TransactionStatus) {
        self.tx_status = status;
    }
}

impl<S> fmt::Debug for PgConnection<S> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PgConnection")
            .field("parameters", &self.parameters)
            .field("tx_status", &self.tx_status)
            .field("dead", &self.dead)
            .field("buffered", &self.read_buf.len())
            .finish()
    }
}
