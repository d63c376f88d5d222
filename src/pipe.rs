//! The pipe front-end: one message on standard input, processed once, with
//! the result reported as the exit status.

use std::{
    fs::File,
    io::{self, BufWriter, Read, Write},
    path::Path,
};

use crate::{
    config::Settings,
    error::{DeliveryError, SpoolError, SpoolStep},
    ffi::modules,
    internal,
    message::{self, Message},
    pipeline::{Disposition, Outcome, Policy, ProcessQueue},
    session::Session,
    spool,
};

/// Failure handling for piped messages.
///
/// Nothing can be replied to, so failures only decide whether the rest of
/// the chain runs.
#[derive(Debug, Default, Clone, Copy)]
pub struct PipePolicy;

impl Policy for PipePolicy {
    fn load_error(&self, settings: &Settings, _error: &modules::Error) -> bool {
        settings.global.module_fail == 1
    }

    fn processing_error(&self, settings: &Settings, _session: &mut Session, retval: i32) -> Outcome {
        match retval {
            -1 if settings.global.module_fail == 1 => Outcome::StopAccept,
            1 => Outcome::Continue,
            _ => Outcome::Abort,
        }
    }

    fn nexthop_error(&self, _settings: &Settings, _session: &mut Session, _error: &DeliveryError) {}
}

/// The exit status for a finished run.
pub const fn exit_code(disposition: Disposition) -> i32 {
    if disposition.is_processed() { 0 } else { 1 }
}

fn spool_input(file: File, path: &Path, mut input: impl Read) -> Result<u64, SpoolError> {
    let mut writer = BufWriter::new(file);
    let size = io::copy(&mut input, &mut writer)
        .and_then(|size| writer.flush().map(|()| size))
        .map_err(|err| SpoolError::new(SpoolStep::Write, path, err))?;

    Ok(size)
}

/// Spool everything read from `input` and run it through `queue`.
///
/// The envelope is taken from the message itself: the sender from `From`,
/// the recipients from `To`, `Cc` and `Bcc`. The spool file is removed
/// afterwards whatever the outcome.
///
/// # Errors
///
/// Returns an error if the message could not be spooled or parsed, or the
/// spool file could not be rewritten.
pub async fn run(
    settings: &Settings,
    queue: &ProcessQueue,
    input: impl Read,
) -> Result<Disposition, message::Error> {
    let (file, path) = spool::create(&settings.global.queue_dir)?;
    let mut session = Session::new();
    session.envelope.message_file = path.clone();

    let result = process(settings, queue, &mut session, file, input).await;
    spool::remove(&path);

    match &result {
        Ok(disposition) => internal!(level = INFO, "[{}] Processing {disposition}", session.id()),
        Err(err) => internal!(level = ERROR, "[{}] {err}", session.id()),
    }

    result
}

async fn process(
    settings: &Settings,
    queue: &ProcessQueue,
    session: &mut Session,
    file: File,
    input: impl Read,
) -> Result<Disposition, message::Error> {
    let path = session.envelope.message_file.clone();
    let size = spool_input(file, &path, input)?;
    internal!(
        level = DEBUG,
        "[{}] Spooled {size} bytes to {}",
        session.id(),
        path.display()
    );

    let message = Message::load(&path)?;
    session.envelope.sender = message.sender();
    session.envelope.recipients = message.recipients();
    session.envelope.message = Some(message);

    Ok(queue.process(settings, session).await?)
}
