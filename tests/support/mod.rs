//! Shared fixtures for the integration tests: a queue directory, a file
//! nexthop, counting in-process modules and a policy with a fixed answer.
#![allow(dead_code)]

use std::{
    io::Write,
    path::{Path, PathBuf},
    sync::{
        Arc,
        atomic::{AtomicUsize, Ordering},
    },
};

use spmfilter::{
    config::Settings,
    error::DeliveryError,
    ffi::modules::{self, Module},
    message::Message,
    pipeline::{Outcome, Policy},
    session::Session,
    spool,
};
use tempfile::TempDir;

pub struct Fixture {
    pub dir: TempDir,
    pub settings: Settings,
}

impl Fixture {
    pub fn new() -> Self {
        let dir = tempfile::tempdir().expect("tempdir");
        let mut settings = Settings::default();
        settings.global.queue_dir = dir.path().join("queue");
        std::fs::create_dir(&settings.global.queue_dir).expect("queue dir");

        Self { dir, settings }
    }

    /// Deliver to a file in the fixture directory and return its path.
    pub fn file_nexthop(&mut self) -> PathBuf {
        let path = self.dir.path().join("delivered.eml");
        std::fs::File::create(&path).expect("nexthop file");
        self.settings.global.nexthop = Some(path.display().to_string());
        path
    }

    pub fn queue_dir(&self) -> &Path {
        &self.settings.global.queue_dir
    }

    /// Files left in the queue directory.
    pub fn spooled(&self) -> usize {
        std::fs::read_dir(self.queue_dir()).expect("queue dir").count()
    }

    /// A session whose spool file holds `raw`.
    pub fn session(&self, raw: &[u8]) -> Session {
        let (mut file, path) = spool::create(self.queue_dir()).expect("spool file");
        file.write_all(raw).expect("write spool");

        let mut session = Session::new();
        session.envelope.message_file = path;
        session.envelope.message = Some(Message::parse(raw).expect("valid message"));
        session
    }
}

/// The inode of `path`, which changes whenever the spool file is replaced.
pub fn inode(path: &Path) -> u64 {
    use std::os::unix::fs::MetadataExt;

    std::fs::metadata(path).expect("metadata").ino()
}

/// An in-process module returning `retval`, counting its invocations.
pub fn counting(name: &str, retval: i32, calls: &Arc<AtomicUsize>) -> Module {
    let calls = Arc::clone(calls);
    Module::create(
        name,
        Some(Arc::new(move |_: &Settings, _: &mut Session| {
            calls.fetch_add(1, Ordering::SeqCst);
            retval
        })),
        None,
    )
    .expect("in-process module")
}

/// An in-process module that edits headers and returns `retval`.
pub fn editing(
    name: &str,
    retval: i32,
    edit: impl Fn(&mut Message) + Send + Sync + 'static,
) -> Module {
    Module::create(
        name,
        Some(Arc::new(move |_: &Settings, session: &mut Session| {
            if let Some(message) = session.message_mut() {
                edit(message);
            }
            retval
        })),
        None,
    )
    .expect("in-process module")
}

/// Answers every failing module with the same outcome, counting the calls.
#[derive(Default)]
pub struct Fixed {
    pub outcome: Option<Outcome>,
    pub calls: Arc<AtomicUsize>,
    pub nexthop_failures: Arc<AtomicUsize>,
}

impl Fixed {
    pub fn new(outcome: Outcome) -> Self {
        Self {
            outcome: Some(outcome),
            ..Self::default()
        }
    }
}

impl Policy for Fixed {
    fn load_error(&self, _: &Settings, _: &modules::Error) -> bool {
        false
    }

    fn processing_error(&self, _: &Settings, _: &mut Session, _: i32) -> Outcome {
        self.calls.fetch_add(1, Ordering::SeqCst);
        self.outcome.unwrap_or(Outcome::Abort)
    }

    fn nexthop_error(&self, _: &Settings, _: &mut Session, _: &DeliveryError) {
        self.nexthop_failures.fetch_add(1, Ordering::SeqCst);
    }
}
