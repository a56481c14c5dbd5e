pub mod connection;
pub mod copy_out;
pub mod dispatcher;
pub mod message;
pub mod sanitize;

#[cfg(test)]
pub(crate) mod test_utils;

pub use connection::{Connection, PgConnection};
pub use copy_out::{copy_to_writer, CopyOutReceiver, StreamState};
pub use dispatcher::{apply_unsolicited, classify, MessageCategory};
pub use message::{
    BackendMessage, CommandTag, CopyFormat, CopyOutResponse, PgError, TransactionStatus,
    UnsolicitedMessage,
};
pub use sanitize::{interpolate, QueryArg};
