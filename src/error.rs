//! Error types shared across the filtering pipeline and its front-ends.
//!
//! A module's non-zero return is not represented here; it is handed to the
//! configured policy instead.

use std::{io, path::PathBuf};

use thiserror::Error;

use crate::status::Status;

/// The step of a spool file operation that failed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SpoolStep {
    Create,
    Read,
    Write,
    Remove,
    Rename,
}

impl core::fmt::Display for SpoolStep {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.write_str(match self {
            Self::Create => "create",
            Self::Read => "read",
            Self::Write => "write",
            Self::Remove => "remove",
            Self::Rename => "rename",
        })
    }
}

/// A failure touching the spool file of a session.
///
/// These are fatal to the session that hit them and are never retried.
#[derive(Debug, Error)]
#[error("Unable to {step} spool file {}: {source}", .path.display())]
pub struct SpoolError {
    pub step: SpoolStep,
    pub path: PathBuf,
    #[source]
    pub source: io::Error,
}

impl SpoolError {
    pub fn new(step: SpoolStep, path: impl Into<PathBuf>, source: io::Error) -> Self {
        Self {
            step,
            path: path.into(),
            source,
        }
    }

    /// Spool failures always surface as a temporary failure to SMTP clients.
    #[must_use]
    pub const fn status(&self) -> Status {
        Status::ActionUnavailable
    }
}

/// Errors raised while handing a message to the nexthop.
#[derive(Debug, Error)]
pub enum DeliveryError {
    /// Copying the spool file to the destination failed.
    #[error("Unable to copy message to {}: {source}", .path.display())]
    File {
        path: PathBuf,
        #[source]
        source: io::Error,
    },

    /// Network failure talking to the relay.
    #[error("Relay connection to {address} failed: {source}")]
    Connection {
        address: String,
        #[source]
        source: io::Error,
    },

    /// The relay sent something that is not an SMTP reply.
    #[error("Malformed reply from relay: {0}")]
    MalformedReply(String),

    /// The relay answered, but not with a 250.
    #[error("Relay rejected message: {code} {message}")]
    Rejected { code: u32, message: String },
}

impl DeliveryError {
    /// Returns `true` if the relay itself answered with a rejection.
    #[must_use]
    pub const fn is_rejection(&self) -> bool {
        matches!(self, Self::Rejected { .. })
    }
}

/// A malformed or out-of-sequence SMTP command.
///
/// Carries the exact reply the client is sent.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
#[error("{status} {message}")]
pub struct ProtocolError {
    pub status: Status,
    pub message: &'static str,
}

impl ProtocolError {
    pub const EMPTY_HELO: Self = Self::new(Status::SyntaxError, "Syntax: HELO hostname");
    pub const EMPTY_XFORWARD: Self =
        Self::new(Status::SyntaxError, "Syntax: XFORWARD attribute=value...");
    pub const EMPTY_MAIL_FROM: Self =
        Self::new(Status::SyntaxError, "Syntax: MAIL FROM:<address>");
    pub const EMPTY_RCPT_TO: Self = Self::new(Status::SyntaxError, "Syntax: RCPT TO:<address>");
    pub const NESTED_MAIL: Self =
        Self::new(Status::InvalidCommandSequence, "Error: nested MAIL command");
    pub const NEED_MAIL: Self =
        Self::new(Status::InvalidCommandSequence, "Error: need MAIL command");
    pub const NEED_RCPT: Self =
        Self::new(Status::InvalidCommandSequence, "Error: need RCPT command");
    pub const NO_RECIPIENTS: Self =
        Self::new(Status::TransactionFailed, "Error: no valid recipients");
    pub const UNRECOGNIZED: Self =
        Self::new(Status::CommandNotRecognized, "Error: command not recognized");
    pub const LINE_TOO_LONG: Self = Self::new(Status::CommandSyntax, "Line too long");

    pub const fn new(status: Status, message: &'static str) -> Self {
        Self { status, message }
    }
}

/// Errors that end a single client connection.
#[derive(Debug, Error)]
pub enum SessionError {
    /// Reading from or writing to the client failed.
    #[error("Connection error: {0}")]
    Connection(#[from] io::Error),

    /// The client stayed idle for too long.
    #[error("Session timed out after {0} seconds")]
    Timeout(u64),
}

impl SessionError {
    /// Returns `true` if the error was caused by the client going quiet.
    #[must_use]
    pub const fn is_timeout(&self) -> bool {
        matches!(self, Self::Timeout(_))
    }
}
