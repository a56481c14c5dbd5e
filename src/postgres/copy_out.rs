//! Receiving `COPY ... TO STDOUT` into an async writer.
//!
//! # Example
//!
//! ```rust,no_run
//! use pg_copy_out::postgres::{CopyOutReceiver, PgConnection, QueryArg};
//! use tokio::net::TcpStream;
//!
//! # async fn example(stream: TcpStream) -> pg_copy_out::Result<()> {
//! // `stream` has already completed startup and authentication.
//! let mut conn = PgConnection::new(stream);
//! conn.set_parameter("standard_conforming_strings", "on")?;
//! let mut out = tokio::fs::File::create("users.csv").await.unwrap();
//!
//! let tag = CopyOutReceiver::new()
//!     .stream_to_sink(
//!         &mut conn,
//!         "COPY (SELECT * FROM users WHERE id > $1) TO STDOUT WITH (FORMAT csv)",
//!         &[QueryArg::Int(100)],
//!         &mut out,
//!     )
//!     .await?;
//! println!("Exported {} rows", tag.rows_affected());
//! # Ok(())
//! # }
//! ```

use std::sync::Arc;
use std::time::{Duration, Instant};

use serde_json::{json, Value};
use tokio::io::{AsyncWrite, AsyncWriteExt};
use tracing::{debug, trace};

use super::connection::Connection;
use super::dispatcher::{apply_unsolicited, classify, MessageCategory};
use super::message::CommandTag;
use super::sanitize::{interpolate, QueryArg};
use crate::config::LoggingConfig;
use crate::logging::{Fields, LogContext, LogLevel, QueryLogger, TracingLogger};
use crate::{Error, Result};

/// Where a COPY OUT call is in its lifecycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StreamState {
    AwaitingControlResponse,
    Streaming,
    Succeeded,
    Failed,
}

#[derive(Debug)]
struct Progress {
    state: StreamState,
    chunks: u64,
    bytes: u64,
}

impl Progress {
    fn new() -> Self {
        Self {
            state: StreamState::AwaitingControlResponse,
            chunks: 0,
            bytes: 0,
        }
    }

    fn advance(&mut self, next: StreamState) {
        trace!("COPY OUT state {:?} -> {:?}", self.state, next);
        self.state = next;
    }
}

/// Drives one COPY OUT exchange per call.
///
/// Holds no per-call state, so one receiver can serve any number of
/// connections one call at a time each.
#[derive(Clone, Default)]
pub struct CopyOutReceiver {
    logger: Option<Arc<dyn QueryLogger>>,
    log_level: LogLevel,
}

impl CopyOutReceiver {
    pub fn new() -> Self {
        Self::default()
    }

    /// Builds a receiver that logs through a [`TracingLogger`] configured
    /// by `config`, at `config.level`.
    pub fn from_config(config: &LoggingConfig) -> Self {
        Self::new().with_logger(Arc::new(TracingLogger::from_config(config)), config.level)
    }

    /// Reports each call to `logger` when its level is enabled by `level`.
    pub fn with_logger(mut self, logger: Arc<dyn QueryLogger>, level: LogLevel) -> Self {
        self.logger = Some(logger);
        self.log_level = level;
        self
    }

    /// Runs `query` and forwards every `CopyData` payload to `sink`.
    ///
    /// Returns the server's command tag, or an empty tag when the server
    /// went straight to `ReadyForQuery`. If writing to `sink` fails the
    /// connection is marked dead, since unread COPY data is still on the
    /// wire.
    pub async fn stream_to_sink<C, W>(
        &self,
        conn: &mut C,
        query: &str,
        args: &[QueryArg],
        sink: &mut W,
    ) -> Result<CommandTag>
    where
        C: Connection,
        W: AsyncWrite + Unpin + ?Sized,
    {
        self.stream_to_sink_with_context(&LogContext::default(), conn, query, args, sink)
            .await
    }

    /// Like [`stream_to_sink`](Self::stream_to_sink), with request-scoped
    /// values for the query logger.
    pub async fn stream_to_sink_with_context<C, W>(
        &self,
        ctx: &LogContext,
        conn: &mut C,
        query: &str,
        args: &[QueryArg],
        sink: &mut W,
    ) -> Result<CommandTag>
    where
        C: Connection,
        W: AsyncWrite + Unpin + ?Sized,
    {
        let started = Instant::now();
        let mut progress = Progress::new();

        let result = self.run(conn, query, args, sink, &mut progress).await;
        progress.advance(if result.is_ok() {
            StreamState::Succeeded
        } else {
            StreamState::Failed
        });

        self.report(ctx, query, args, started.elapsed(), &progress, &result);
        result
    }

    async fn run<C, W>(
        &self,
        conn: &mut C,
        query: &str,
        args: &[QueryArg],
        sink: &mut W,
        progress: &mut Progress,
    ) -> Result<CommandTag>
    where
        C: Connection,
        W: AsyncWrite + Unpin + ?Sized,
    {
        // With standard_conforming_strings off a backslash escapes the
        // closing quote of an interpolated literal.
        if !args.is_empty() && conn.parameter("standard_conforming_strings") != Some("on") {
            return Err(Error::Argument {
                message: "Query arguments require standard_conforming_strings=on".to_string(),
            });
        }
        let sql = interpolate(query, args)?;
        conn.send_query(&sql).await?;

        loop {
            match classify(conn.receive_message().await?) {
                MessageCategory::ControlResponse(resp) => {
                    debug!(
                        "COPY OUT started: format={:?}, columns={}",
                        resp.format,
                        resp.column_formats.len()
                    );
                    break;
                }
                other => apply_unsolicited(conn, other.into_message())?,
            }
        }
        progress.advance(StreamState::Streaming);

        loop {
            match classify(conn.receive_message().await?) {
                MessageCategory::DataChunk(data) => {
                    if let Err(e) = sink.write_all(&data).await {
                        conn.mark_dead(format!("COPY OUT sink write failed: {}", e));
                        return Err(Error::Sink(e));
                    }
                    progress.chunks += 1;
                    progress.bytes += data.len() as u64;
                }
                MessageCategory::StreamEnd => {
                    trace!("CopyDone after {} chunks", progress.chunks);
                }
                MessageCategory::Completed(tag) => return Ok(tag),
                MessageCategory::Ready(status) => {
                    conn.set_transaction_status(status);
                    return Ok(CommandTag::empty());
                }
                MessageCategory::Failed(err) => return Err(Error::Server(err)),
                MessageCategory::ControlResponse(_) => {
                    debug!("Ignoring repeated CopyOutResponse");
                }
                MessageCategory::Unsolicited(message) => apply_unsolicited(conn, message)?,
            }
        }
    }

    fn report(
        &self,
        ctx: &LogContext,
        query: &str,
        args: &[QueryArg],
        elapsed: Duration,
        progress: &Progress,
        result: &Result<CommandTag>,
    ) {
        let Some(logger) = &self.logger else {
            return;
        };

        let level = if result.is_ok() {
            LogLevel::Info
        } else {
            LogLevel::Error
        };
        if !self.log_level.enables(level) {
            return;
        }

        let mut fields = Fields::new();
        fields.insert("sql".to_string(), Value::from(query));
        fields.insert(
            "args".to_string(),
            Value::Array(args.iter().map(arg_value).collect()),
        );
        fields.insert("time".to_string(), Value::from(format!("{:?}", elapsed)));
        fields.insert("bytes".to_string(), Value::from(progress.bytes));
        fields.insert("chunks".to_string(), Value::from(progress.chunks));

        match result {
            Ok(tag) => fields.insert("commandTag".to_string(), Value::from(tag.to_string())),
            Err(e) => fields.insert("err".to_string(), Value::from(e.to_string())),
        };
        logger.log(ctx, level, "CopyTo", fields);
    }
}

impl std::fmt::Debug for CopyOutReceiver {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CopyOutReceiver")
            .field("logger", &self.logger.is_some())
            .field("log_level", &self.log_level)
            .finish()
    }
}

fn arg_value(arg: &QueryArg) -> Value {
    match arg {
        QueryArg::Null => Value::Null,
        QueryArg::Bool(b) => json!(b),
        QueryArg::Int(n) => json!(n),
        QueryArg::Float(f) => json!(f),
        QueryArg::Text(s) => json!(s),
        QueryArg::Bytes(b) => json!(format!("<{} bytes>", b.len())),
    }
}

/// Runs a COPY OUT on `conn` without query logging.
pub async fn copy_to_writer<C, W>(
    conn: &mut C,
    query: &str,
    args: &[QueryArg],
    sink: &mut W,
) -> Result<CommandTag>
where
    C: Connection,
    W: AsyncWrite + Unpin + ?Sized,
{
    CopyOutReceiver::new()
        .stream_to_sink(conn, query, args, sink)
        .await
}
