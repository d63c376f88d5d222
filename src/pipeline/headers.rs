//! Detecting header changes made by modules and writing them back to the
//! spool file.

use std::path::Path;

use crate::{
    config::Settings,
    error::{SpoolError, SpoolStep},
    internal,
    message::Message,
    session::Session,
    spool,
};

/// The headers of a message grouped by name, in first-seen order.
///
/// Names are compared case-insensitively and each group's values are kept
/// sorted, so reordering headers never makes two snapshots differ.
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct HeaderSnapshot {
    groups: Vec<(String, Vec<String>)>,
    count: usize,
}

impl HeaderSnapshot {
    pub fn take(message: Option<&Message>) -> Self {
        let Some(message) = message else {
            return Self::default();
        };

        let mut groups: Vec<(String, Vec<String>)> = Vec::new();
        for header in message.headers() {
            let name = header.name().to_ascii_lowercase();
            match groups.iter_mut().find(|(group, _)| *group == name) {
                Some((_, values)) => values.push(header.value().to_string()),
                None => groups.push((name, vec![header.value().to_string()])),
            }
        }

        for (_, values) in &mut groups {
            values.sort_unstable();
        }

        Self {
            groups,
            count: message.headers().len(),
        }
    }

    pub const fn len(&self) -> usize {
        self.count
    }

    pub const fn is_empty(&self) -> bool {
        self.count == 0
    }

    /// Returns `true` if `current` no longer matches this snapshot.
    pub fn is_dirty(&self, current: &Self) -> bool {
        self.count != current.count
            || self.groups.len() != current.groups.len()
            || current.groups.iter().any(|(name, values)| {
                self.groups
                    .iter()
                    .find(|(group, _)| group == name)
                    .is_none_or(|(_, before)| before != values)
            })
    }
}

/// Rewrite the spool file with the session's headers if they changed since
/// `snapshot` was taken.
///
/// The new header block goes to a temporary file in the queue directory,
/// followed by the body bytes of the current spool file, untouched. The
/// temporary file then replaces the spool file.
///
/// Returns whether the file was rewritten.
///
/// # Errors
///
/// Returns an error if any step of the rewrite fails. The spool file is not
/// usable afterwards.
pub fn flush_if_dirty(
    snapshot: &HeaderSnapshot,
    settings: &Settings,
    session: &mut Session,
) -> Result<bool, SpoolError> {
    let path = session.envelope.message_file.clone();
    let Some(message) = session.envelope.message.as_mut() else {
        return Ok(false);
    };

    if !snapshot.is_dirty(&HeaderSnapshot::take(Some(message))) {
        internal!("Headers unchanged, not rewriting {}", path.display());
        return Ok(false);
    }

    internal!(level = DEBUG, "Headers changed, rewriting {}", path.display());
    rewrite(&settings.global.queue_dir, &path, &message.header_block(), message.body_offset())?;
    message.rebase();

    Ok(true)
}

/// Replace the header block of the file at `path` with `headers`, keeping
/// everything from `body_offset` onwards.
fn rewrite(queue_dir: &Path, path: &Path, headers: &[u8], body_offset: usize) -> Result<(), SpoolError> {
    let original = std::fs::read(path).map_err(|err| SpoolError::new(SpoolStep::Read, path, err))?;
    let body = original.get(body_offset..).unwrap_or_default();

    spool::replace(queue_dir, path, &[headers, body])
}
