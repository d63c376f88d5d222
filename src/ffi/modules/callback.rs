use core::fmt::{self, Display};

use crate::{config::Settings, session::Session};

use super::Callback;

/// A module compiled into the host program.
pub struct InProcess {
    name: String,
    callback: Callback,
}

impl Display for InProcess {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} (in-process)", self.name)
    }
}

impl InProcess {
    pub(super) fn new(name: &str, callback: Callback) -> Self {
        Self {
            name: name.to_string(),
            callback,
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub(super) fn invoke(&self, settings: &Settings, session: &mut Session) -> i32 {
        (self.callback)(settings, session)
    }
}
