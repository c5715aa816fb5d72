//! Error taxonomy shared by client and daemon

use std::io;
use std::path::PathBuf;

use thiserror::Error;

use crate::command::CommandError;

pub type Result<T> = std::result::Result<T, Error>;

#[derive(Debug, Error)]
pub enum Error {
    /// Socket setup, accept or connect failure
    #[error("connection to {addr} failed: {source}")]
    Connection {
        addr: String,
        #[source]
        source: io::Error,
    },

    /// Short read on a fixed-width segment; fatal for the connection
    #[error("short read on {segment}: {source}")]
    ProtocolFraming {
        segment: &'static str,
        #[source]
        source: io::Error,
    },

    #[error("invalid command: {0}")]
    InvalidCommand(#[from] CommandError),

    /// The server rejected a command the client let through
    #[error("server rejected the command")]
    ServerValidation,

    #[error("cannot archive {}: {source}", path.display())]
    ArchiveCreation {
        path: PathBuf,
        #[source]
        source: io::Error,
    },

    /// A received archive could not be unpacked locally; the session is unaffected
    #[error("cannot extract {}: {source}", path.display())]
    Extraction {
        path: PathBuf,
        #[source]
        source: io::Error,
    },

    #[error("cannot read {}: {source}", path.display())]
    FilesystemAccess {
        path: PathBuf,
        #[source]
        source: io::Error,
    },

    #[error("malformed redirect: {0:?}")]
    Redirect(String),

    #[error("handshake failed: {0}")]
    Handshake(String),

    #[error(transparent)]
    Io(#[from] io::Error),
}

impl Error {
    pub(crate) fn framing(segment: &'static str, source: io::Error) -> Self {
        Error::ProtocolFraming { segment, source }
    }

    /// True when the error ends the connection rather than just one command
    pub fn is_fatal(&self) -> bool {
        matches!(
            self,
            Error::Connection { .. }
                | Error::ProtocolFraming { .. }
                | Error::Redirect(_)
                | Error::Handshake(_)
                | Error::Io(_)
        )
    }
}
