use core::fmt::{self, Display, Formatter};

#[repr(C, u32)]
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Debug)]
pub enum Status {
    ServiceReady = 220,
    GoodBye = 221,
    Ok = 250,
    StartMailInput = 354,
    Unavailable = 421,
    ActionUnavailable = 451,
    CommandSyntax = 500,
    SyntaxError = 501,
    CommandNotRecognized = 502,
    InvalidCommandSequence = 503,
    ExceededStorage = 552,
    TransactionFailed = 554,
    Unknown(u32),
}

impl Status {
    /// Returns `true` for codes an SMTP reply can carry.
    pub fn is_reply_code(self) -> bool {
        (200..=599).contains(&u32::from(self))
    }

    /// Returns `true` if [`Self::default_text`] was written for this code
    /// rather than borrowed from 451.
    pub const fn has_own_text(self) -> bool {
        matches!(
            self,
            Self::GoodBye
                | Self::Ok
                | Self::StartMailInput
                | Self::Unavailable
                | Self::ActionUnavailable
                | Self::CommandNotRecognized
                | Self::ExceededStorage
        )
    }

    /// The text sent with this status when nothing more specific is known.
    pub const fn default_text(self) -> &'static str {
        match self {
            Self::GoodBye => "Goodbye. Please recommend us to others!",
            Self::Ok => "OK",
            Self::StartMailInput => "End data with <CR><LF>.<CR><LF>",
            Self::Unavailable => "Error: timeout exceeded",
            Self::CommandNotRecognized => "Error: command not recognized",
            Self::ServiceReady
            | Self::ActionUnavailable
            | Self::CommandSyntax
            | Self::SyntaxError
            | Self::InvalidCommandSequence
            | Self::ExceededStorage
            | Self::TransactionFailed
            | Self::Unknown(_) => "Requested action aborted: local error in processing",
        }
    }
}

impl From<u32> for Status {
    fn from(value: u32) -> Self {
        match value {
            220 => Self::ServiceReady,
            221 => Self::GoodBye,
            250 => Self::Ok,
            354 => Self::StartMailInput,
            421 => Self::Unavailable,
            451 => Self::ActionUnavailable,
            500 => Self::CommandSyntax,
            501 => Self::SyntaxError,
            502 => Self::CommandNotRecognized,
            503 => Self::InvalidCommandSequence,
            552 => Self::ExceededStorage,
            554 => Self::TransactionFailed,
            _ => Self::Unknown(value),
        }
    }
}

impl From<Status> for u32 {
    fn from(value: Status) -> Self {
        match value {
            Status::ServiceReady => 220,
            Status::GoodBye => 221,
            Status::Ok => 250,
            Status::StartMailInput => 354,
            Status::Unavailable => 421,
            Status::ActionUnavailable => 451,
            Status::CommandSyntax => 500,
            Status::SyntaxError => 501,
            Status::CommandNotRecognized => 502,
            Status::InvalidCommandSequence => 503,
            Status::ExceededStorage => 552,
            Status::TransactionFailed => 554,
            Status::Unknown(v) => v,
        }
    }
}

impl Display for Status {
    fn fmt(&self, fmt: &mut Formatter<'_>) -> Result<(), fmt::Error> {
        write!(fmt, "{}", u32::from(*self))
    }
}
