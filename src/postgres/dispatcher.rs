use bytes::Bytes;

use super::connection::Connection;
use super::message::{BackendMessage, CommandTag, CopyOutResponse, PgError, TransactionStatus};
use crate::Result;

/// What a backend message means to the COPY OUT loop.
#[derive(Debug)]
pub enum MessageCategory {
    /// `CopyOutResponse`: the data phase begins.
    ControlResponse(CopyOutResponse),
    DataChunk(Bytes),
    /// `CopyDone`. A hint only; the command has not finished yet.
    StreamEnd,
    /// `CommandComplete` with the server's tag.
    Completed(CommandTag),
    /// `ReadyForQuery` without a preceding `CommandComplete`.
    Ready(TransactionStatus),
    Failed(PgError),
    /// Anything that belongs to the connection rather than the command.
    Unsolicited(BackendMessage),
}

/// Sorts a message into its category. Total over [`BackendMessage`].
pub fn classify(message: BackendMessage) -> MessageCategory {
    match message {
        BackendMessage::CopyOutResponse(resp) => MessageCategory::ControlResponse(resp),
        BackendMessage::CopyData(data) => MessageCategory::DataChunk(data),
        BackendMessage::CopyDone => MessageCategory::StreamEnd,
        BackendMessage::CommandComplete(tag) => MessageCategory::Completed(tag),
        BackendMessage::ReadyForQuery(status) => MessageCategory::Ready(status),
        BackendMessage::ErrorResponse(err) => MessageCategory::Failed(err),
        unsolicited @ BackendMessage::Unsolicited(_) => MessageCategory::Unsolicited(unsolicited),
    }
}

impl MessageCategory {
    /// Turns the category back into the message it was built from, for
    /// handing to [`apply_unsolicited`] outside the data phase.
    pub fn into_message(self) -> BackendMessage {
        match self {
            MessageCategory::ControlResponse(resp) => BackendMessage::CopyOutResponse(resp),
            MessageCategory::DataChunk(data) => BackendMessage::CopyData(data),
            MessageCategory::StreamEnd => BackendMessage::CopyDone,
            MessageCategory::Completed(tag) => BackendMessage::CommandComplete(tag),
            MessageCategory::Ready(status) => BackendMessage::ReadyForQuery(status),
            MessageCategory::Failed(err) => BackendMessage::ErrorResponse(err),
            MessageCategory::Unsolicited(message) => message,
        }
    }
}

/// Lets the connection do its bookkeeping for a message the current
/// command does not consume.
pub fn apply_unsolicited<C: Connection>(conn: &mut C, message: BackendMessage) -> Result<()> {
    conn.apply_unsolicited(message)
}
