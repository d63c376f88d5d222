//! The structured view of a spooled message that modules work with.
//!
//! Only the header block is modelled. The body stays on disk and is never
//! re-encoded, so `body_offset` records where it starts in the spool file.

use std::{ops::Range, path::Path};

use mailparse::{MailAddr, MailParseError};
use thiserror::Error;

use crate::error::{SpoolError, SpoolStep};

#[derive(Debug, Error)]
pub enum Error {
    #[error(transparent)]
    Spool(#[from] SpoolError),

    #[error("Unable to parse message: {0}")]
    Parse(#[from] MailParseError),
}

/// One header field.
///
/// A parsed header keeps the bytes it was read from, folding and 8-bit
/// text included, and is written back exactly as read until its value is
/// replaced. Equality only looks at the name and the decoded value.
#[derive(Debug, Clone)]
pub struct Header {
    name: String,
    value: String,
    raw: Option<Vec<u8>>,
}

impl PartialEq for Header {
    fn eq(&self, other: &Self) -> bool {
        self.name == other.name && self.value == other.value
    }
}

impl Eq for Header {}

impl Header {
    pub fn new(name: impl Into<String>, value: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            value: value.into(),
            raw: None,
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// The value, decoded lossily and trimmed.
    pub fn value(&self) -> &str {
        &self.value
    }

    /// The bytes this header was parsed from, without the line ending, if
    /// it is unchanged since.
    pub fn raw(&self) -> Option<&[u8]> {
        self.raw.as_deref()
    }

    fn set_value(&mut self, value: String) {
        self.value = value;
        self.raw = None;
    }

    fn is(&self, name: &str) -> bool {
        self.name.eq_ignore_ascii_case(name)
    }

    fn write(&self, block: &mut Vec<u8>, eol: &str) {
        match &self.raw {
            Some(raw) => block.extend_from_slice(raw),
            None => block.extend_from_slice(format!("{}: {}", self.name, self.value).as_bytes()),
        }
        block.extend_from_slice(eol.as_bytes());
    }
}

/// Where `part` lies within `whole`, if it is a subslice of it.
fn span(whole: &[u8], part: &[u8]) -> Option<Range<usize>> {
    let start = (part.as_ptr() as usize).checked_sub(whole.as_ptr() as usize)?;
    let end = start.checked_add(part.len())?;
    (end <= whole.len()).then_some(start..end)
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Message {
    headers: Vec<Header>,
    body_offset: usize,
    crlf: bool,
}

impl Message {
    /// Parse the header block of a raw RFC 822 message.
    ///
    /// # Errors
    ///
    /// Returns an error if the header block is malformed.
    pub fn parse(raw: &[u8]) -> Result<Self, MailParseError> {
        let (headers, body_offset) = mailparse::parse_headers(raw)?;

        let crlf = raw
            .iter()
            .position(|&b| b == b'\n')
            .is_some_and(|pos| pos > 0 && raw[pos - 1] == b'\r');

        Ok(Self {
            headers: headers
                .iter()
                .map(|header| {
                    let raw = span(raw, header.get_key_raw())
                        .zip(span(raw, header.get_value_raw()))
                        .filter(|(key, value)| key.start <= value.end)
                        .map(|(key, value)| {
                            let bytes = &raw[key.start..value.end];
                            bytes.strip_suffix(b"\r").unwrap_or(bytes).to_vec()
                        });

                    Header {
                        raw,
                        ..Header::new(
                            header.get_key(),
                            String::from_utf8_lossy(header.get_value_raw()).trim(),
                        )
                    }
                })
                .collect(),
            body_offset,
            crlf,
        })
    }

    /// Read and parse a spool file.
    ///
    /// # Errors
    ///
    /// Returns an error if the file cannot be read or its headers parsed.
    pub fn load(path: &Path) -> Result<Self, Error> {
        let raw = std::fs::read(path).map_err(|err| SpoolError::new(SpoolStep::Read, path, err))?;
        Ok(Self::parse(&raw)?)
    }

    pub fn headers(&self) -> &[Header] {
        &self.headers
    }

    /// Where the body starts in the raw message this was parsed from.
    pub const fn body_offset(&self) -> usize {
        self.body_offset
    }

    /// Record that the header block was rewritten as [`Self::header_block`].
    pub(crate) fn rebase(&mut self) {
        self.body_offset = self.header_block().len();
    }

    /// The line ending used by the raw message.
    pub const fn line_ending(&self) -> &'static str {
        if self.crlf { "\r\n" } else { "\n" }
    }

    /// The first value of the header `name`, matched case-insensitively.
    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers
            .iter()
            .find(|header| header.is(name))
            .map(Header::value)
    }

    /// Every value of the header `name`, in message order.
    pub fn header_values<'a>(&'a self, name: &'a str) -> impl Iterator<Item = &'a str> + 'a {
        self.headers
            .iter()
            .filter(move |header| header.is(name))
            .map(Header::value)
    }

    pub fn append_header(&mut self, name: impl Into<String>, value: impl Into<String>) {
        self.headers.push(Header::new(name, value));
    }

    pub fn prepend_header(&mut self, name: impl Into<String>, value: impl Into<String>) {
        self.headers.insert(0, Header::new(name, value));
    }

    /// Replace the first `name` header, dropping any others, or append it.
    pub fn set_header(&mut self, name: &str, value: impl Into<String>) {
        let value = value.into();

        match self.headers.iter().position(|header| header.is(name)) {
            Some(first) => {
                self.headers[first].set_value(value);
                let mut idx = 0;
                self.headers.retain(|header| {
                    let keep = idx <= first || !header.is(name);
                    idx += 1;
                    keep
                });
            }
            None => self.append_header(name, value),
        }
    }

    /// Remove every `name` header, returning how many were removed.
    pub fn remove_header(&mut self, name: &str) -> usize {
        let before = self.headers.len();
        self.headers.retain(|header| !header.is(name));
        before - self.headers.len()
    }

    /// The address in the `From` header.
    pub fn sender(&self) -> Option<String> {
        self.header_values("From")
            .flat_map(addresses)
            .next()
    }

    /// Every address in the `To`, `Cc` and `Bcc` headers.
    pub fn recipients(&self) -> Vec<String> {
        ["To", "Cc", "Bcc"]
            .into_iter()
            .flat_map(|name| self.header_values(name).flat_map(addresses).collect::<Vec<_>>())
            .collect()
    }

    /// The header block as it is written to a spool file, including the
    /// blank line that ends it. Headers nobody changed are copied as read.
    pub fn header_block(&self) -> Vec<u8> {
        let eol = self.line_ending();
        let mut block = Vec::new();
        for header in &self.headers {
            header.write(&mut block, eol);
        }
        block.extend_from_slice(eol.as_bytes());

        block
    }
}

fn addresses(value: &str) -> Vec<String> {
    mailparse::addrparse(value)
        .map(|list| {
            list.iter()
                .flat_map(|addr| match addr {
                    MailAddr::Single(info) => vec![info.addr.clone()],
                    MailAddr::Group(group) => {
                        group.addrs.iter().map(|info| info.addr.clone()).collect()
                    }
                })
                .collect()
        })
        .unwrap_or_default()
}
