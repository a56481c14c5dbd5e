//! Query logging on top of `tracing`.
//!
//! [`QueryLogger`] is the narrow interface the COPY OUT receiver reports
//! through: a severity, a message and a bag of JSON fields. [`TracingLogger`]
//! forwards those events to a `tracing` dispatcher, either a fixed one or
//! the one carried by the call's [`LogContext`].
//!
//! # Example
//!
//! ```rust
//! use pg_copy_out::logging::{LogContext, LogLevel, QueryLogger, TracingLogger};
//! use serde_json::json;
//!
//! let logger = TracingLogger::from_context().with_fields_key("pg");
//! let mut fields = serde_json::Map::new();
//! fields.insert("sql".to_string(), json!("COPY t TO STDOUT"));
//! logger.log(&LogContext::new(), LogLevel::Info, "CopyTo", fields);
//! ```

use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use tracing::Dispatch;
use tracing_subscriber::util::TryInitError;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter, Layer};

use crate::config::LoggingConfig;

/// Value attached to every event unless [`TracingLogger::without_module`]
/// is set.
pub const MODULE_TAG: &str = "pg_copy_out";

pub type Fields = Map<String, Value>;

/// Severity scale of query log events, from quietest to noisiest.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default, Deserialize, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum LogLevel {
    None,
    Error,
    Warn,
    #[default]
    Info,
    Debug,
    Trace,
}

impl LogLevel {
    /// Whether a logger configured at `self` should emit an event at `level`.
    pub fn enables(self, level: LogLevel) -> bool {
        self != LogLevel::None && level <= self
    }
}

impl fmt::Display for LogLevel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            LogLevel::None => "none",
            LogLevel::Error => "error",
            LogLevel::Warn => "warn",
            LogLevel::Info => "info",
            LogLevel::Debug => "debug",
            LogLevel::Trace => "trace",
        };
        f.write_str(name)
    }
}

/// Request-scoped values available to a log call.
#[derive(Debug, Clone, Default)]
pub struct LogContext {
    dispatch: Option<Dispatch>,
    values: HashMap<String, Value>,
}

impl LogContext {
    pub fn new() -> Self {
        Self::default()
    }

    /// Carries a dispatcher for loggers built with
    /// [`TracingLogger::from_context`].
    pub fn with_dispatch(mut self, dispatch: Dispatch) -> Self {
        self.dispatch = Some(dispatch);
        self
    }

    pub fn with_value(mut self, key: impl Into<String>, value: impl Into<Value>) -> Self {
        self.values.insert(key.into(), value.into());
        self
    }

    pub fn value(&self, key: &str) -> Option<&Value> {
        self.values.get(key)
    }

    pub fn dispatch(&self) -> Option<&Dispatch> {
        self.dispatch.as_ref()
    }
}

/// Sink for query log events.
pub trait QueryLogger: Send + Sync {
    fn log(&self, ctx: &LogContext, level: LogLevel, msg: &str, fields: Fields);
}

/// Derives extra fields from the call's context, once per event.
pub type ContextFields = Arc<dyn Fn(&LogContext) -> Fields + Send + Sync>;

/// A fully assembled event, before it is handed to `tracing`.
#[derive(Debug, Clone, PartialEq)]
pub struct LogRecord {
    pub level: LogLevel,
    pub message: String,
    pub fields: Fields,
}

/// [`QueryLogger`] that emits `tracing` events.
///
/// `tracing` events carry a fixed set of field names known at compile
/// time, so the assembled fields (module tag, context fields, event fields)
/// are rendered as one JSON object in a single `data` field. A JSON
/// formatter prints `data` as a string; flat and nested layouts differ only
/// inside that string, and consumers must parse it to reach the keys:
///
/// ```text
/// {"level":"INFO","fields":{"message":"CopyTo","data":"{\"module\":\"pg_copy_out\",\"pg\":{...}}"}}
/// ```
///
/// # Levels
///
/// [`LogLevel::Error`] through [`LogLevel::Trace`] map onto the `tracing`
/// level of the same name. `tracing` has no level-less events, so an event
/// logged at [`LogLevel::None`] is emitted at `INFO`. Receivers never log at
/// `None`; it only appears as a threshold that disables logging.
#[derive(Clone)]
pub struct TracingLogger {
    dispatch: Option<Dispatch>,
    context_fields: Option<ContextFields>,
    skip_module: bool,
    fields_key: Option<String>,
}

impl TracingLogger {
    /// Logs every event to `dispatch`.
    pub fn new(dispatch: Dispatch) -> Self {
        Self {
            dispatch: Some(dispatch),
            context_fields: None,
            skip_module: false,
            fields_key: None,
        }
    }

    /// Logs to the dispatcher in the call's [`LogContext`], falling back to
    /// the thread's current default.
    pub fn from_context() -> Self {
        Self {
            dispatch: None,
            context_fields: None,
            skip_module: false,
            fields_key: None,
        }
    }

    /// Builds a logger from configuration. When `from_context` is off the
    /// current default dispatcher is captured.
    pub fn from_config(config: &LoggingConfig) -> Self {
        let logger = if config.from_context {
            Self::from_context()
        } else {
            Self::new(tracing::dispatcher::get_default(Dispatch::clone))
        };

        let logger = if config.module_tag {
            logger
        } else {
            logger.without_module()
        };

        match &config.fields_key {
            Some(key) => logger.with_fields_key(key.clone()),
            None => logger,
        }
    }

    pub fn with_context_fields(
        mut self,
        f: impl Fn(&LogContext) -> Fields + Send + Sync + 'static,
    ) -> Self {
        self.context_fields = Some(Arc::new(f));
        self
    }

    /// Stops adding `module = "pg_copy_out"` to events.
    pub fn without_module(mut self) -> Self {
        self.skip_module = true;
        self
    }

    /// Nests the event's own fields under `key` instead of flattening them.
    pub fn with_fields_key(mut self, key: impl Into<String>) -> Self {
        self.fields_key = Some(key.into());
        self
    }

    /// Assembles the event: module tag, then context fields, then the
    /// event's own fields (flat or nested).
    pub fn record(&self, ctx: &LogContext, level: LogLevel, msg: &str, fields: Fields) -> LogRecord {
        let mut out = Map::new();

        if !self.skip_module {
            out.insert("module".to_string(), Value::from(MODULE_TAG));
        }

        if let Some(f) = &self.context_fields {
            out.extend(f(ctx));
        }

        match &self.fields_key {
            Some(key) => {
                out.insert(key.clone(), Value::Object(fields));
            }
            None => out.extend(fields),
        }

        LogRecord {
            level,
            message: msg.to_string(),
            fields: out,
        }
    }

    fn dispatch_for(&self, ctx: &LogContext) -> Dispatch {
        match (&self.dispatch, ctx.dispatch()) {
            (Some(fixed), _) => fixed.clone(),
            (None, Some(ambient)) => ambient.clone(),
            (None, None) => tracing::dispatcher::get_default(Dispatch::clone),
        }
    }
}

impl fmt::Debug for TracingLogger {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TracingLogger")
            .field("from_context", &self.dispatch.is_none())
            .field("context_fields", &self.context_fields.is_some())
            .field("skip_module", &self.skip_module)
            .field("fields_key", &self.fields_key)
            .finish()
    }
}

impl QueryLogger for TracingLogger {
    fn log(&self, ctx: &LogContext, level: LogLevel, msg: &str, fields: Fields) {
        let record = self.record(ctx, level, msg, fields);
        let dispatch = self.dispatch_for(ctx);
        tracing::dispatcher::with_default(&dispatch, || emit(&record));
    }
}

fn emit(record: &LogRecord) {
    let data = Value::Object(record.fields.clone());
    let msg = record.message.as_str();

    match record.level {
        LogLevel::Error => tracing::error!(data = %data, "{}", msg),
        LogLevel::Warn => tracing::warn!(data = %data, "{}", msg),
        LogLevel::None | LogLevel::Info => tracing::info!(data = %data, "{}", msg),
        LogLevel::Debug => tracing::debug!(data = %data, "{}", msg),
        LogLevel::Trace => tracing::trace!(data = %data, "{}", msg),
    }
}

/// Installs the global `tracing` subscriber described by `config`.
///
/// `RUST_LOG` overrides `config.filter` when set.
pub fn init(config: &LoggingConfig) -> Result<(), TryInitError> {
    let env_filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&config.filter));

    let fmt_layer = if config.json {
        tracing_subscriber::fmt::layer()
            .json()
            .flatten_event(true)
            .with_current_span(false)
            .with_span_list(false)
            .boxed()
    } else {
        tracing_subscriber::fmt::layer()
            .with_target(false)
            .with_thread_ids(false)
            .with_thread_names(false)
            .boxed()
    };

    tracing_subscriber::registry()
        .with(env_filter)
        .with(fmt_layer)
        .try_init()
}
