use core::fmt::{self, Display};
use std::{path::Path, sync::Arc};

use thiserror::Error;

use crate::{config::Settings, internal, message::Message, session::Session, spool};

pub mod callback;
pub mod library;

/// An in-process filter: the same contract as a native module's entry point.
pub type Callback = Arc<dyn Fn(&Settings, &mut Session) -> i32 + Send + Sync>;

#[derive(Error, Debug)]
pub enum Error {
    /// The module's library could not be opened.
    #[error("Module {name} failed to load: {source}")]
    Load {
        name: String,
        #[source]
        source: libloading::Error,
    },

    /// The library does not export the entry point.
    #[error("Module {name} has no entry point: {source}")]
    MissingEntry {
        name: String,
        #[source]
        source: libloading::Error,
    },

    /// The library could not be released.
    #[error("Module {name} failed to unload: {source}")]
    Unload {
        name: String,
        #[source]
        source: libloading::Error,
    },
}

impl Error {
    pub fn module(&self) -> &str {
        match self {
            Self::Load { name, .. } | Self::MissingEntry { name, .. } | Self::Unload { name, .. } => {
                name
            }
        }
    }
}

/// A named filter, invoked once per message.
pub enum Module {
    Native(library::Native),
    InProcess(callback::InProcess),
}

impl Display for Module {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Native(lib) => write!(f, "{lib}"),
            Self::InProcess(cb) => write!(f, "{cb}"),
        }
    }
}

impl fmt::Debug for Module {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Module({self})")
    }
}

impl Module {
    /// Resolve `name` to something that can be invoked.
    ///
    /// With a `target` the module runs in-process; otherwise the library
    /// `lib<name>` (with the platform's extension) is opened from
    /// `module_dir`, or the loader's search path, and its `load` symbol
    /// resolved.
    ///
    /// # Errors
    ///
    /// Returns an error if the library or its entry point cannot be found.
    pub fn create(
        name: &str,
        target: Option<Callback>,
        module_dir: Option<&Path>,
    ) -> Result<Self, Error> {
        match target {
            Some(callback) => Ok(Self::InProcess(callback::InProcess::new(name, callback))),
            None => library::Native::open(name, module_dir).map(Self::Native),
        }
    }

    pub fn name(&self) -> &str {
        match self {
            Self::Native(lib) => lib.name(),
            Self::InProcess(cb) => cb.name(),
        }
    }

    /// Run the module against `session`.
    ///
    /// Modules may rewrite the spool file directly instead of going through
    /// the session's message. When the file's modification time changed and
    /// the module succeeded, the message is reloaded from disk.
    pub fn invoke(&self, settings: &Settings, session: &mut Session) -> i32 {
        let spool_file = session.envelope.message_file.clone();
        let before = spool::modified(&spool_file);

        let ret = match self {
            Self::Native(lib) => lib.invoke(settings, session),
            Self::InProcess(cb) => cb.invoke(settings, session),
        };

        if ret == 0 && spool::modified(&spool_file) != before {
            internal!(
                level = DEBUG,
                "Module {self} modified {}, reloading message",
                spool_file.display()
            );

            match Message::load(&spool_file) {
                Ok(message) => session.envelope.message = Some(message),
                Err(err) => internal!(
                    level = ERROR,
                    "Unable to reload message after module {self}: {err}"
                ),
            }
        }

        ret
    }

    /// Release the module, unloading its library if it has one.
    ///
    /// # Errors
    ///
    /// Returns an error if the library could not be unloaded.
    pub fn destroy(self) -> Result<(), Error> {
        internal!("Destroying module {self}");

        match self {
            Self::Native(lib) => lib.close(),
            Self::InProcess(_) => Ok(()),
        }
    }
}

#[cfg(test)]
mod test {
    use std::{
        fs::File,
        io::Write,
        sync::{
            Arc,
            atomic::{AtomicUsize, Ordering},
        },
        time::{Duration, SystemTime},
    };

    use crate::{config::Settings, message::Message, session::Session, spool};

    use super::{Error, Module};

    fn spooled_session(dir: &std::path::Path, raw: &[u8]) -> Session {
        let (mut file, path) = spool::create(dir).expect("spool file");
        file.write_all(raw).expect("write spool");

        let mut session = Session::new();
        session.envelope.message = Some(Message::parse(raw).expect("valid message"));
        session.envelope.message_file = path;
        session
    }

    fn rewrite(session: &Session, raw: &[u8]) {
        let path = &session.envelope.message_file;
        std::fs::write(path, raw).expect("rewrite spool");
        File::options()
            .write(true)
            .open(path)
            .and_then(|file| file.set_modified(SystemTime::now() + Duration::from_secs(60)))
            .expect("touch spool");
    }

    #[test]
    fn in_process() {
        let calls = Arc::new(AtomicUsize::default());
        let counter = Arc::clone(&calls);

        let module = Module::create(
            "counter",
            Some(Arc::new(move |_: &Settings, _: &mut Session| {
                counter.fetch_add(1, Ordering::SeqCst);
                7
            })),
            None,
        )
        .expect("in-process module");

        assert_eq!(module.name(), "counter");
        assert_eq!(module.invoke(&Settings::default(), &mut Session::new()), 7);
        assert_eq!(calls.load(Ordering::SeqCst), 1);
        assert!(module.destroy().is_ok());
    }

    #[test]
    fn missing_library() {
        let dir = tempfile::tempdir().expect("tempdir");
        let err = Module::create("does-not-exist", None, Some(dir.path())).expect_err("no library");

        assert!(matches!(err, Error::Load { .. }));
        assert_eq!(err.module(), "does-not-exist");
    }

    #[test]
    fn reloads_message_edited_on_disk() {
        let dir = tempfile::tempdir().expect("tempdir");
        let mut session = spooled_session(dir.path(), b"Subject: before\r\n\r\nbody\r\n");

        let module = Module::create(
            "editor",
            Some(Arc::new(|_: &Settings, session: &mut Session| {
                rewrite(session, b"Subject: after\r\n\r\nbody\r\n");
                0
            })),
            None,
        )
        .expect("in-process module");

        assert_eq!(module.invoke(&Settings::default(), &mut session), 0);
        assert_eq!(
            session.message().and_then(|m| m.header("Subject")),
            Some("after")
        );
    }

    #[test]
    fn failed_module_keeps_message() {
        let dir = tempfile::tempdir().expect("tempdir");
        let mut session = spooled_session(dir.path(), b"Subject: before\r\n\r\nbody\r\n");

        let module = Module::create(
            "editor",
            Some(Arc::new(|_: &Settings, session: &mut Session| {
                rewrite(session, b"Subject: after\r\n\r\nbody\r\n");
                -1
            })),
            None,
        )
        .expect("in-process module");

        assert_eq!(module.invoke(&Settings::default(), &mut session), -1);
        assert_eq!(
            session.message().and_then(|m| m.header("Subject")),
            Some("before")
        );
    }
}
