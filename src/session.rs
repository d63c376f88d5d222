use core::fmt::{self, Display, Formatter};
use std::path::PathBuf;

use ahash::AHashMap;

use crate::{config::Settings, lookup::UserRecord, message::Message, status::Status};

/// Who a message is from, who it is for, and where it lives on disk.
#[derive(Debug, Default)]
pub struct Envelope {
    /// `None` is the null sender (`<>`).
    pub sender: Option<String>,
    pub recipients: Vec<String>,
    pub message_file: PathBuf,
    pub message: Option<Message>,
}

/// A reply decided on by a policy, to be sent to an SMTP client.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Reply {
    pub status: Status,
    pub text: String,
}

impl Reply {
    pub fn new(status: Status, text: impl Into<String>) -> Self {
        Self {
            status,
            text: text.into(),
        }
    }

    /// `status` with the text configured for it, or its default text.
    pub fn configured(settings: &Settings, status: Status) -> Self {
        Self::new(
            status,
            settings.reply_text(status).unwrap_or(status.default_text()),
        )
    }

    /// The reply for a code picked by a module or the configuration.
    ///
    /// The text is `text`, else the one configured for the code, else the
    /// code's built-in text. Codes without any text, and numbers that are
    /// not reply codes at all, get the configured 451 reply instead.
    pub fn for_code(settings: &Settings, code: u32, text: Option<&str>) -> Self {
        let status = Status::from(code);
        if !status.is_reply_code() {
            return Self::configured(settings, Status::ActionUnavailable);
        }

        match text.or_else(|| settings.reply_text(status)) {
            Some(text) => Self::new(status, text),
            None if status.has_own_text() => Self::new(status, status.default_text()),
            None => Self::configured(settings, Status::ActionUnavailable),
        }
    }
}

impl Display for Reply {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        write!(f, "{} {}", self.status, self.text)
    }
}

/// Everything known about one message while it passes through the filter.
///
/// A session is owned by whoever is handling the connection or pipe
/// invocation and is never shared.
#[derive(Debug)]
pub struct Session {
    id: String,
    pub envelope: Envelope,
    /// Text a module wants used in the final reply instead of the default.
    pub response_msg: Option<String>,
    /// Users fetched from the lookup backend, keyed by address.
    pub users: AHashMap<String, Option<UserRecord>>,
    pub helo: Option<String>,
    pub xforward_addr: Option<String>,
    /// Set by policies that have decided what the client is told.
    pub reply: Option<Reply>,
}

impl Default for Session {
    fn default() -> Self {
        Self::new()
    }
}

impl Session {
    pub fn new() -> Self {
        Self {
            id: ulid::Ulid::new().to_string(),
            envelope: Envelope::default(),
            response_msg: None,
            users: AHashMap::default(),
            helo: None,
            xforward_addr: None,
            reply: None,
        }
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn message(&self) -> Option<&Message> {
        self.envelope.message.as_ref()
    }

    pub fn message_mut(&mut self) -> Option<&mut Message> {
        self.envelope.message.as_mut()
    }

    /// The user record cached for `address`, if a lookup found one.
    pub fn user(&self, address: &str) -> Option<&UserRecord> {
        self.users.get(address).and_then(Option::as_ref)
    }
}
