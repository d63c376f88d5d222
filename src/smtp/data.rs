//! Receiving the message after DATA.
//!
//! Lines are unstuffed and written to the spool file as they arrive. While
//! the header block is being read, the receiver notes which of the headers a
//! delivered message needs are present, so that the missing ones can be
//! added once the message is complete.

use std::{
    fs::File,
    io::{BufWriter, Write},
    path::{Path, PathBuf},
};

use crate::{
    error::{SpoolError, SpoolStep},
    internal, spool,
};

#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct SeenHeaders {
    pub message_id: bool,
    pub date: bool,
    pub to: bool,
    pub from: bool,
    /// Any well formed `name: value` line at all.
    pub any: bool,
    /// The blank line ending the header block.
    pub terminated: bool,
}

impl SeenHeaders {
    fn record(&mut self, name: &[u8]) {
        self.any = true;

        if name.eq_ignore_ascii_case(b"message-id") {
            self.message_id = true;
        } else if name.eq_ignore_ascii_case(b"date") {
            self.date = true;
        } else if name.eq_ignore_ascii_case(b"to") {
            self.to = true;
        } else if name.eq_ignore_ascii_case(b"from") {
            self.from = true;
        }
    }

    /// Returns `true` if headers have to be added to the message.
    pub const fn incomplete(&self) -> bool {
        !(self.message_id && self.date && self.to && self.from && self.any && self.terminated)
    }
}

/// The name of a `name: value` header line, if `line` is one.
fn header_name(line: &[u8]) -> Option<&[u8]> {
    let colon = line.iter().position(|&b| b == b':')?;
    let name = &line[..colon];

    (!name.is_empty() && name.iter().all(|&b| b.is_ascii_graphic())).then_some(name)
}

fn is_blank(line: &[u8]) -> bool {
    line == b"\r\n" || line == b"\n"
}

/// Returns `true` for the line ending the message.
pub fn is_terminator(line: &[u8]) -> bool {
    line == b".\r\n" || line == b".\n"
}

/// A message that has been completely received.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Received {
    pub path: PathBuf,
    /// Bytes written to the spool file.
    pub size: u64,
    pub headers: SeenHeaders,
    /// Where in the spool file the header block stopped.
    pub header_end: usize,
    pub crlf: bool,
}

impl Received {
    pub const fn line_ending(&self) -> &'static str {
        if self.crlf { "\r\n" } else { "\n" }
    }
}

#[derive(Debug)]
pub enum DataOutcome {
    Received(Received),
    /// The message was larger than allowed and has been discarded.
    TooLarge { size: u64 },
}

pub struct DataReceiver {
    writer: BufWriter<File>,
    path: PathBuf,
    size: u64,
    in_header: bool,
    headers: SeenHeaders,
    header_end: usize,
    crlf: Option<bool>,
    error: Option<SpoolError>,
}

impl DataReceiver {
    pub fn new(file: File, path: impl Into<PathBuf>) -> Self {
        Self {
            writer: BufWriter::new(file),
            path: path.into(),
            size: 0,
            in_header: true,
            headers: SeenHeaders::default(),
            header_end: 0,
            crlf: None,
            error: None,
        }
    }

    fn track(&mut self, line: &[u8]) {
        if self.crlf.is_none() {
            self.crlf = Some(line.ends_with(b"\r\n"));
        }

        if !self.in_header {
            return;
        }

        if is_blank(line) {
            self.in_header = false;
            self.headers.terminated = true;
        } else if line.first().is_some_and(|&b| b == b' ' || b == b'\t') && self.headers.any {
            // Folded continuation of the previous header.
        } else if let Some(name) = header_name(line) {
            self.headers.record(name);
        } else {
            self.in_header = false;
        }

        if self.in_header {
            self.header_end += line.len();
        }
    }

    /// Take one line, including its line ending, as received from the
    /// client.
    ///
    /// Returns `true` once the line ending the message has been seen. Write
    /// failures are remembered and reported by [`Self::finish`], so the rest
    /// of the message is still consumed.
    pub fn push(&mut self, line: &[u8]) -> bool {
        if is_terminator(line) {
            return true;
        }

        let line = line.strip_prefix(b".").unwrap_or(line);
        self.track(line);
        self.size += line.len() as u64;

        if self.error.is_none()
            && let Err(err) = self.writer.write_all(line)
        {
            self.error = Some(SpoolError::new(SpoolStep::Write, &self.path, err));
        }

        false
    }

    /// Close the spool file.
    ///
    /// A message larger than `max_size` (unless that is 0) is removed.
    ///
    /// # Errors
    ///
    /// Returns an error if writing the spool file failed at any point.
    pub fn finish(mut self, max_size: u64) -> Result<DataOutcome, SpoolError> {
        if let Some(err) = self.error.take() {
            return Err(err);
        }

        let file = self
            .writer
            .into_inner()
            .map_err(|err| SpoolError::new(SpoolStep::Write, &self.path, err.into_error()))?;
        file.sync_all()
            .map_err(|err| SpoolError::new(SpoolStep::Write, &self.path, err))?;
        drop(file);

        if max_size > 0 && self.size > max_size {
            internal!(
                level = INFO,
                "Message of {} bytes exceeds the limit of {max_size}",
                self.size
            );
            spool::remove(&self.path);
            return Ok(DataOutcome::TooLarge { size: self.size });
        }

        Ok(DataOutcome::Received(Received {
            path: self.path,
            size: self.size,
            headers: self.headers,
            header_end: self.header_end,
            crlf: self.crlf.unwrap_or(true),
        }))
    }
}

/// Values for the headers a received message lacks.
#[derive(Debug, Clone)]
pub struct Synthesis<'a> {
    pub hostname: &'a str,
    pub sender: Option<&'a str>,
}

impl Synthesis<'_> {
    fn headers(&self, seen: &SeenHeaders, eol: &str) -> String {
        let mut headers = String::new();

        if !seen.message_id {
            headers.push_str(&format!(
                "Message-Id: <{}@{}>{eol}",
                ulid::Ulid::new(),
                self.hostname
            ));
        }
        if !seen.date {
            headers.push_str(&format!("Date: {}{eol}", chrono::Local::now().to_rfc2822()));
        }
        if !seen.from {
            match self.sender {
                Some(sender) => headers.push_str(&format!("From: <{sender}>{eol}")),
                None => headers.push_str(&format!("From: MAILER-DAEMON@{}{eol}", self.hostname)),
            }
        }
        if !seen.to {
            headers.push_str(&format!("To: undisclosed-recipients:;{eol}"));
        }

        headers
    }

    /// Add the missing headers, and the blank line ending the header block if
    /// that is missing, to a received message.
    ///
    /// Returns whether the spool file was rewritten.
    ///
    /// # Errors
    ///
    /// Returns an error if the spool file could not be rewritten.
    pub fn apply(&self, queue_dir: &Path, received: &Received) -> Result<bool, SpoolError> {
        if !received.headers.incomplete() {
            return Ok(false);
        }

        let path = &received.path;
        let original =
            std::fs::read(path).map_err(|err| SpoolError::new(SpoolStep::Read, path, err))?;
        let split = received.header_end.min(original.len());
        let eol = received.line_ending();

        let headers = self.headers(&received.headers, eol);
        let terminator = if received.headers.terminated { "" } else { eol };
        internal!(
            level = DEBUG,
            "Adding missing headers to {}: {}",
            path.display(),
            headers.trim_end()
        );

        spool::replace(
            queue_dir,
            path,
            &[
                headers.as_bytes(),
                &original[..split],
                terminator.as_bytes(),
                &original[split..],
            ],
        )?;

        Ok(true)
    }
}

#[cfg(test)]
mod test {
    use pretty_assertions::assert_eq;

    use crate::{message::Message, spool};

    use super::{DataOutcome, DataReceiver, Received, Synthesis};

    fn receive(dir: &std::path::Path, lines: &[&[u8]], max_size: u64) -> DataOutcome {
        let (file, path) = spool::create(dir).expect("spool file");
        let mut receiver = DataReceiver::new(file, path);

        for line in lines {
            if receiver.push(line) {
                break;
            }
        }

        receiver.finish(max_size).expect("finished")
    }

    fn received(outcome: DataOutcome) -> Received {
        match outcome {
            DataOutcome::Received(received) => received,
            DataOutcome::TooLarge { size } => panic!("unexpectedly too large: {size}"),
        }
    }

    #[test]
    fn unstuffs_lines() {
        let dir = tempfile::tempdir().expect("tempdir");
        let received = received(receive(
            dir.path(),
            &[b"Subject: x\r\n", b"\r\n", b"..hello\r\n", b".\r\n", b"after\r\n"],
            0,
        ));

        assert_eq!(
            std::fs::read(&received.path).expect("spool file"),
            b"Subject: x\r\n\r\n.hello\r\n".to_vec()
        );
        assert_eq!(received.size, 22);
        assert!(received.headers.any);
        assert!(received.headers.terminated);
        assert!(!received.headers.from);
        assert_eq!(received.header_end, 12);
    }

    #[test]
    fn tracks_headers() {
        let dir = tempfile::tempdir().expect("tempdir");
        let received = received(receive(
            dir.path(),
            &[
                b"message-ID: <1@x>\r\n",
                b"Date: today\r\n",
                b"To: a@b,\r\n",
                b"\tc@d\r\n",
                b"FROM: e@f\r\n",
                b"\r\n",
                b"To: body@line\r\n",
                b".\r\n",
            ],
            0,
        ));

        assert!(!received.headers.incomplete());
        assert_eq!(received.header_end, 59);

        let synthesis = Synthesis {
            hostname: "filter",
            sender: None,
        };
        assert!(!synthesis.apply(dir.path(), &received).expect("nothing to add"));
    }

    #[test]
    fn too_large() {
        let dir = tempfile::tempdir().expect("tempdir");
        let outcome = receive(dir.path(), &[b"Subject: x\r\n", b"\r\n", b"body\r\n", b".\r\n"], 10);

        assert!(matches!(outcome, DataOutcome::TooLarge { size: 20 }));
        assert_eq!(std::fs::read_dir(dir.path()).expect("queue dir").count(), 0);
    }

    #[test]
    fn adds_missing_headers() {
        let dir = tempfile::tempdir().expect("tempdir");
        let received = received(receive(
            dir.path(),
            &[b"Subject: x\r\n", b"\r\n", b"body\r\n", b".\r\n"],
            0,
        ));

        let synthesis = Synthesis {
            hostname: "filter.example.com",
            sender: Some("a@b"),
        };
        assert!(synthesis.apply(dir.path(), &received).expect("headers added"));

        let raw = std::fs::read(&received.path).expect("spool file");
        let message = Message::parse(&raw).expect("valid message");

        let id = message.header("Message-Id").expect("message id");
        assert!(id.starts_with('<') && id.ends_with("@filter.example.com>"));
        assert!(message.header("Date").is_some());
        assert_eq!(message.header("From"), Some("<a@b>"));
        assert_eq!(message.header("To"), Some("undisclosed-recipients:;"));
        assert_eq!(message.header("Subject"), Some("x"));
        assert_eq!(&raw[message.body_offset()..], b"body\r\n");
    }

    #[test]
    fn adds_header_block() {
        let dir = tempfile::tempdir().expect("tempdir");
        let received = received(receive(dir.path(), &[b"just a body\n", b"second\n", b".\n"], 0));

        assert!(!received.headers.any);
        assert!(!received.crlf);

        Synthesis {
            hostname: "filter",
            sender: None,
        }
        .apply(dir.path(), &received)
        .expect("headers added");

        let raw = std::fs::read(&received.path).expect("spool file");
        let message = Message::parse(&raw).expect("valid message");

        assert_eq!(message.headers().len(), 4);
        assert_eq!(message.header("From"), Some("MAILER-DAEMON@filter"));
        assert_eq!(&raw[message.body_offset()..], b"just a body\nsecond\n");
    }
}
