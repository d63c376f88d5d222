use core::fmt::{self, Display, Formatter};

/// A command line received from a client.
///
/// Verbs are matched case-insensitively and must be followed by whitespace
/// or the end of the line, so `HELOfoo` and `DATAX` are not commands.
/// Arguments are kept as sent; checking them is left to the state machine,
/// which knows what to reply.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Command {
    Helo(String),
    Ehlo(String),
    /// The `ADDR` attribute, if one was given.
    Xforward(Option<String>),
    MailFrom(String),
    RcptTo(String),
    Data,
    Rset,
    Noop,
    Quit,
    Invalid(String),
}

impl Display for Command {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        match self {
            Self::Helo(host) => write!(f, "HELO {host}"),
            Self::Ehlo(host) => write!(f, "EHLO {host}"),
            Self::Xforward(addr) => write!(f, "XFORWARD ADDR={}", addr.as_deref().unwrap_or_default()),
            Self::MailFrom(from) => write!(f, "MAIL FROM:{from}"),
            Self::RcptTo(to) => write!(f, "RCPT TO:{to}"),
            Self::Data => f.write_str("DATA"),
            Self::Rset => f.write_str("RSET"),
            Self::Noop => f.write_str("NOOP"),
            Self::Quit => f.write_str("QUIT"),
            Self::Invalid(command) => f.write_str(command),
        }
    }
}

fn has_prefix(line: &str, prefix: &str) -> bool {
    line.get(..prefix.len())
        .is_some_and(|start| start.eq_ignore_ascii_case(prefix))
}

/// `line` starts with `verb`, and the verb is a whole word.
fn has_verb(line: &str, verb: &str) -> bool {
    has_prefix(line, verb)
        && line[verb.len()..]
            .chars()
            .next()
            .is_none_or(char::is_whitespace)
}

/// The argument following a command `prefix`, with at most one separating
/// space skipped and surrounding whitespace removed.
fn argument<'a>(line: &'a str, prefix: &str) -> &'a str {
    let rest = &line[prefix.len()..];
    rest.strip_prefix(' ').unwrap_or(rest).trim()
}

/// The `ADDR` attribute of an XFORWARD command.
fn forwarded_address(line: &str) -> Option<String> {
    let upper = line.to_ascii_uppercase();
    let start = upper.find("ADDR=")? + "ADDR=".len();

    line[start..]
        .split_whitespace()
        .next()
        .map(str::to_string)
        .filter(|addr| !addr.is_empty())
}

impl TryFrom<&str> for Command {
    type Error = Self;

    fn try_from(line: &str) -> Result<Self, Self::Error> {
        let line = line.trim_end_matches(['\r', '\n']);

        if has_verb(line, "QUIT") {
            Ok(Self::Quit)
        } else if has_verb(line, "HELO") {
            Ok(Self::Helo(argument(line, "HELO").to_string()))
        } else if has_verb(line, "EHLO") {
            Ok(Self::Ehlo(argument(line, "EHLO").to_string()))
        } else if has_verb(line, "XFORWARD") {
            Ok(Self::Xforward(forwarded_address(line)))
        } else if has_prefix(line, "MAIL FROM:") {
            Ok(Self::MailFrom(argument(line, "MAIL FROM:").to_string()))
        } else if has_prefix(line, "RCPT TO:") {
            Ok(Self::RcptTo(argument(line, "RCPT TO:").to_string()))
        } else if has_verb(line, "DATA") {
            Ok(Self::Data)
        } else if has_verb(line, "RSET") {
            Ok(Self::Rset)
        } else if has_verb(line, "NOOP") {
            Ok(Self::Noop)
        } else {
            Err(Self::Invalid(line.to_string()))
        }
    }
}

impl TryFrom<&[u8]> for Command {
    type Error = Self;

    fn try_from(line: &[u8]) -> Result<Self, Self::Error> {
        std::str::from_utf8(line).map_or_else(
            |_| Err(Self::Invalid(String::from_utf8_lossy(line).into_owned())),
            Self::try_from,
        )
    }
}

/// The mailbox in a MAIL or RCPT argument: what is between the angle
/// brackets if there are any, otherwise the first word. ESMTP parameters
/// after the address are dropped.
pub fn mailbox(argument: &str) -> &str {
    let argument = argument.trim();

    let mailbox = match argument.strip_prefix('<') {
        Some(rest) => rest.split_once('>').map_or(rest, |(mailbox, _)| mailbox),
        None => argument.split_whitespace().next().unwrap_or_default(),
    };

    mailbox.trim()
}

#[cfg(test)]
mod test {
    use pretty_assertions::assert_eq;

    use super::{Command, mailbox};

    #[test]
    fn parse() {
        assert_eq!(
            Command::try_from("HELO mail.example.com\r\n"),
            Ok(Command::Helo(String::from("mail.example.com")))
        );
        assert_eq!(
            Command::try_from("ehlo  client "),
            Ok(Command::Ehlo(String::from("client")))
        );
        assert_eq!(Command::try_from("HELO"), Ok(Command::Helo(String::new())));
        assert_eq!(
            Command::try_from("mail from:<a@b>"),
            Ok(Command::MailFrom(String::from("<a@b>")))
        );
        assert_eq!(
            Command::try_from("MAIL FROM: <a@b> SIZE=100"),
            Ok(Command::MailFrom(String::from("<a@b> SIZE=100")))
        );
        assert_eq!(
            Command::try_from("RCPT TO:<c@d>"),
            Ok(Command::RcptTo(String::from("<c@d>")))
        );
        assert_eq!(Command::try_from("data"), Ok(Command::Data));
        assert_eq!(Command::try_from("RSET"), Ok(Command::Rset));
        assert_eq!(Command::try_from("noop please"), Ok(Command::Noop));
        assert_eq!(Command::try_from("quit\r\n"), Ok(Command::Quit));
        assert_eq!(
            Command::try_from("QUITTING"),
            Err(Command::Invalid(String::from("QUITTING")))
        );
        assert_eq!(
            Command::try_from("HELOfoo"),
            Err(Command::Invalid(String::from("HELOfoo")))
        );
        assert_eq!(
            Command::try_from("DATAX"),
            Err(Command::Invalid(String::from("DATAX")))
        );
        assert_eq!(
            Command::try_from("VRFY root"),
            Err(Command::Invalid(String::from("VRFY root")))
        );
        assert_eq!(
            Command::try_from("MAIL <a@b>"),
            Err(Command::Invalid(String::from("MAIL <a@b>")))
        );
    }

    #[test]
    fn xforward() {
        assert_eq!(
            Command::try_from("XFORWARD NAME=spike ADDR=192.0.2.1 PROTO=ESMTP"),
            Ok(Command::Xforward(Some(String::from("192.0.2.1"))))
        );
        assert_eq!(
            Command::try_from("xforward addr=10.0.0.1"),
            Ok(Command::Xforward(Some(String::from("10.0.0.1"))))
        );
        assert_eq!(
            Command::try_from("XFORWARD NAME=spike"),
            Ok(Command::Xforward(None))
        );
    }

    #[test]
    fn bytes() {
        assert_eq!(Command::try_from(b"NOOP\r\n".as_slice()), Ok(Command::Noop));
        assert!(Command::try_from(b"\xff\xfe".as_slice()).is_err());
    }

    #[test]
    fn mailboxes() {
        assert_eq!(mailbox("<a@b>"), "a@b");
        assert_eq!(mailbox(" <a@b> SIZE=100"), "a@b");
        assert_eq!(mailbox("a@b SIZE=100"), "a@b");
        assert_eq!(mailbox("<>"), "");
        assert_eq!(mailbox(""), "");
    }
}
