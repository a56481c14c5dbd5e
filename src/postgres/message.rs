use std::collections::BTreeMap;
use std::fmt;
use std::io;

use bytes::{Buf, Bytes, BytesMut};
use fallible_iterator::FallibleIterator;
use postgres_protocol::message::backend;
use tracing::trace;

use crate::{Error, Result};

// Postgres never allocates more than 1GiB for a single value, so no
// well-behaved server sends a larger frame.
const MAX_FRAME_SIZE: usize = 1 << 30;

// 1 byte tag + 4 byte big-endian length (which counts itself)
const HEADER_LEN: usize = 5;

/// Backend message tags this crate inspects.
pub mod tag {
    pub const BACKEND_KEY_DATA: u8 = b'K';
    pub const COMMAND_COMPLETE: u8 = b'C';
    pub const COPY_DATA: u8 = b'd';
    pub const COPY_DONE: u8 = b'c';
    pub const COPY_OUT_RESPONSE: u8 = b'H';
    pub const ERROR_RESPONSE: u8 = b'E';
    pub const NOTICE_RESPONSE: u8 = b'N';
    pub const NOTIFICATION_RESPONSE: u8 = b'A';
    pub const PARAMETER_STATUS: u8 = b'S';
    pub const READY_FOR_QUERY: u8 = b'Z';
}

/// Text or binary encoding of COPY data.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CopyFormat {
    Text,
    Binary,
}

impl CopyFormat {
    fn from_code(code: u16) -> Result<Self> {
        match code {
            0 => Ok(CopyFormat::Text),
            1 => Ok(CopyFormat::Binary),
            other => Err(Error::InvalidMessage {
                message: format!("Unknown COPY format code: {}", other),
            }),
        }
    }
}

/// Body of the `CopyOutResponse` that opens the data phase.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CopyOutResponse {
    pub format: CopyFormat,
    pub column_formats: Vec<CopyFormat>,
}

/// Descriptor the server reports when a command completes, e.g. `COPY 2`.
///
/// Empty when the operation ended without a `CommandComplete`.
#[derive(Debug, Clone, Default, PartialEq, Eq, Hash)]
pub struct CommandTag(Bytes);

impl CommandTag {
    pub fn new(tag: impl Into<Bytes>) -> Self {
        Self(tag.into())
    }

    pub fn empty() -> Self {
        Self::default()
    }

    pub fn as_bytes(&self) -> &[u8] {
        &self.0
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    /// Number of rows reported by the trailing integer of the tag.
    ///
    /// Returns 0 for empty tags and tags without a count.
    pub fn rows_affected(&self) -> u64 {
        self.0
            .rsplit(|b| *b == b' ')
            .next()
            .and_then(|last| std::str::from_utf8(last).ok())
            .and_then(|n| n.parse().ok())
            .unwrap_or(0)
    }
}

impl fmt::Display for CommandTag {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&String::from_utf8_lossy(&self.0))
    }
}

impl From<&'static str> for CommandTag {
    fn from(tag: &'static str) -> Self {
        Self(Bytes::from_static(tag.as_bytes()))
    }
}

/// Transaction state reported by `ReadyForQuery`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum TransactionStatus {
    #[default]
    Idle,
    InTransaction,
    Failed,
}

impl TransactionStatus {
    pub fn from_byte(status: u8) -> Result<Self> {
        match status {
            b'I' => Ok(TransactionStatus::Idle),
            b'T' => Ok(TransactionStatus::InTransaction),
            b'E' => Ok(TransactionStatus::Failed),
            other => Err(Error::InvalidMessage {
                message: format!("Unknown transaction status: {}", other as char),
            }),
        }
    }

    pub fn as_byte(self) -> u8 {
        match self {
            TransactionStatus::Idle => b'I',
            TransactionStatus::InTransaction => b'T',
            TransactionStatus::Failed => b'E',
        }
    }
}

/// Field set of an `ErrorResponse` or `NoticeResponse`.
///
/// Single-byte wire codes are stored under their long names (`severity`,
/// `code`, `message`, ...). Codes this crate does not know are stored under
/// the code character itself.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PgError {
    fields: BTreeMap<String, String>,
}

impl PgError {
    pub fn from_fields<K, V>(fields: impl IntoIterator<Item = (K, V)>) -> Self
    where
        K: Into<String>,
        V: Into<String>,
    {
        Self {
            fields: fields
                .into_iter()
                .map(|(k, v)| (k.into(), v.into()))
                .collect(),
        }
    }

    fn from_wire(mut wire: backend::ErrorFields<'_>) -> io::Result<Self> {
        let mut fields = BTreeMap::new();
        while let Some(field) = wire.next()? {
            fields.insert(
                field_name(field.type_()),
                String::from_utf8_lossy(field.value_bytes()).into_owned(),
            );
        }
        Ok(Self { fields })
    }

    pub fn get(&self, name: &str) -> Option<&str> {
        self.fields.get(name).map(String::as_str)
    }

    pub fn severity(&self) -> Option<&str> {
        self.get("severity")
    }

    /// SQLSTATE code, e.g. `53100` for `disk_full`.
    pub fn code(&self) -> Option<&str> {
        self.get("code")
    }

    pub fn message(&self) -> &str {
        self.get("message").unwrap_or_default()
    }

    pub fn detail(&self) -> Option<&str> {
        self.get("detail")
    }

    pub fn hint(&self) -> Option<&str> {
        self.get("hint")
    }

    pub fn fields(&self) -> &BTreeMap<String, String> {
        &self.fields
    }
}

impl fmt::Display for PgError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if let Some(severity) = self.severity() {
            write!(f, "{}: ", severity)?;
        }
        f.write_str(self.message())?;
        if let Some(code) = self.code() {
            write!(f, " (SQLSTATE {})", code)?;
        }
        Ok(())
    }
}

impl std::error::Error for PgError {}

fn field_name(code: u8) -> String {
    let name = match code {
        b'S' => "severity",
        b'V' => "severity_nonlocalized",
        b'C' => "code",
        b'M' => "message",
        b'D' => "detail",
        b'H' => "hint",
        b'P' => "position",
        b'p' => "internal_position",
        b'q' => "internal_query",
        b'W' => "where",
        b's' => "schema",
        b't' => "table",
        b'c' => "column",
        b'd' => "data_type",
        b'n' => "constraint",
        b'F' => "file",
        b'L' => "line",
        b'R' => "routine",
        other => return (other as char).to_string(),
    };
    name.to_string()
}

/// Messages unrelated to the in-flight command.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum UnsolicitedMessage {
    ParameterStatus { name: String, value: String },
    Notice(PgError),
    Notification {
        process_id: i32,
        channel: String,
        payload: String,
    },
    BackendKeyData { process_id: i32, secret_key: i32 },
    /// Any other tag, including ones newer than this crate.
    Other { tag: u8, body: Bytes },
}

/// One decoded backend message.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BackendMessage {
    CopyOutResponse(CopyOutResponse),
    CopyData(Bytes),
    CopyDone,
    CommandComplete(CommandTag),
    ReadyForQuery(TransactionStatus),
    ErrorResponse(PgError),
    Unsolicited(UnsolicitedMessage),
}

impl BackendMessage {
    /// Protocol name of the message, for diagnostics.
    pub fn name(&self) -> &'static str {
        match self {
            BackendMessage::CopyOutResponse(_) => "CopyOutResponse",
            BackendMessage::CopyData(_) => "CopyData",
            BackendMessage::CopyDone => "CopyDone",
            BackendMessage::CommandComplete(_) => "CommandComplete",
            BackendMessage::ReadyForQuery(_) => "ReadyForQuery",
            BackendMessage::ErrorResponse(_) => "ErrorResponse",
            BackendMessage::Unsolicited(UnsolicitedMessage::ParameterStatus { .. }) => {
                "ParameterStatus"
            }
            BackendMessage::Unsolicited(UnsolicitedMessage::Notice(_)) => "NoticeResponse",
            BackendMessage::Unsolicited(UnsolicitedMessage::Notification { .. }) => {
                "NotificationResponse"
            }
            BackendMessage::Unsolicited(UnsolicitedMessage::BackendKeyData { .. }) => {
                "BackendKeyData"
            }
            BackendMessage::Unsolicited(UnsolicitedMessage::Other { .. }) => "Other",
        }
    }

    /// Decodes one message from the front of `buf`.
    ///
    /// Returns `Ok(None)` and leaves `buf` untouched until a whole frame is
    /// buffered.
    pub fn decode(buf: &mut BytesMut) -> Result<Option<BackendMessage>> {
        if buf.len() < HEADER_LEN {
            return Ok(None);
        }

        let tag = buf[0];
        let len = i32::from_be_bytes([buf[1], buf[2], buf[3], buf[4]]);
        if len < 4 || len as usize > MAX_FRAME_SIZE {
            return Err(Error::InvalidMessage {
                message: format!("Invalid length {} for message tag {}", len, tag as char),
            });
        }

        let total = len as usize + 1;
        if buf.len() < total {
            buf.reserve(total - buf.len());
            return Ok(None);
        }

        let mut frame = buf.split_to(total);
        trace!("Decoding frame: tag={}, len={}", tag as char, len);

        let message = match tag {
            tag::COPY_DATA => {
                frame.advance(HEADER_LEN);
                BackendMessage::CopyData(frame.freeze())
            }
            tag::COPY_DONE => BackendMessage::CopyDone,
            tag::COPY_OUT_RESPONSE
            | tag::COMMAND_COMPLETE
            | tag::READY_FOR_QUERY
            | tag::ERROR_RESPONSE
            | tag::NOTICE_RESPONSE
            | tag::PARAMETER_STATUS
            | tag::BACKEND_KEY_DATA
            | tag::NOTIFICATION_RESPONSE => decode_structured(tag, frame)?,
            _ => {
                frame.advance(HEADER_LEN);
                BackendMessage::Unsolicited(UnsolicitedMessage::Other {
                    tag,
                    body: frame.freeze(),
                })
            }
        };

        Ok(Some(message))
    }
}

fn invalid(tag: u8, e: impl fmt::Display) -> Error {
    Error::InvalidMessage {
        message: format!("Malformed message tag {}: {}", tag as char, e),
    }
}

fn decode_structured(tag: u8, mut frame: BytesMut) -> Result<BackendMessage> {
    let parsed = backend::Message::parse(&mut frame)
        .map_err(|e| invalid(tag, e))?
        .ok_or_else(|| invalid(tag, "truncated frame"))?;

    let message = match parsed {
        backend::Message::CopyOutResponse(body) => {
            let codes: Vec<u16> = body
                .column_formats()
                .collect()
                .map_err(|e| invalid(tag, e))?;
            let column_formats = codes
                .into_iter()
                .map(CopyFormat::from_code)
                .collect::<Result<Vec<_>>>()?;
            BackendMessage::CopyOutResponse(CopyOutResponse {
                format: CopyFormat::from_code(u16::from(body.format()))?,
                column_formats,
            })
        }
        backend::Message::CommandComplete(body) => {
            let command = body.tag().map_err(|e| invalid(tag, e))?;
            BackendMessage::CommandComplete(CommandTag::new(Bytes::copy_from_slice(
                command.as_bytes(),
            )))
        }
        backend::Message::ReadyForQuery(body) => {
            BackendMessage::ReadyForQuery(TransactionStatus::from_byte(body.status())?)
        }
        backend::Message::ErrorResponse(body) => BackendMessage::ErrorResponse(
            PgError::from_wire(body.fields()).map_err(|e| invalid(tag, e))?,
        ),
        backend::Message::NoticeResponse(body) => BackendMessage::Unsolicited(
            UnsolicitedMessage::Notice(
                PgError::from_wire(body.fields()).map_err(|e| invalid(tag, e))?,
            ),
        ),
        backend::Message::ParameterStatus(body) => {
            BackendMessage::Unsolicited(UnsolicitedMessage::ParameterStatus {
                name: body.name().map_err(|e| invalid(tag, e))?.to_string(),
                value: body.value().map_err(|e| invalid(tag, e))?.to_string(),
            })
        }
        backend::Message::BackendKeyData(body) => {
            BackendMessage::Unsolicited(UnsolicitedMessage::BackendKeyData {
                process_id: body.process_id(),
                secret_key: body.secret_key(),
            })
        }
        backend::Message::NotificationResponse(body) => {
            BackendMessage::Unsolicited(UnsolicitedMessage::Notification {
                process_id: body.process_id(),
                channel: body.channel().map_err(|e| invalid(tag, e))?.to_string(),
                payload: body.message().map_err(|e| invalid(tag, e))?.to_string(),
            })
        }
        _ => return Err(invalid(tag, "unexpected message body")),
    };

    Ok(message)
}
