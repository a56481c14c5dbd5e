pub mod config;
pub mod error;
pub mod logging;

pub mod postgres;

pub use config::Config;
pub use error::{Error, Result};
pub use postgres::{copy_to_writer, CommandTag, CopyOutReceiver, PgConnection, QueryArg};
