//! Final delivery of a processed message.

use core::fmt::{self, Display};
use std::path::PathBuf;

use tokio::net::TcpStream;

use crate::{config::Settings, error::DeliveryError, internal, session::Session, smtp};

pub mod client;

pub use client::RelayClient;

/// Port used for relays configured without one.
pub const DEFAULT_PORT: u16 = 25;

/// Where processed messages go.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Nexthop {
    /// Copy the spool file to this path.
    File(PathBuf),
    /// Submit the message to an SMTP server.
    Relay { host: String, port: u16 },
}

impl Display for Nexthop {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::File(path) => write!(f, "{}", path.display()),
            Self::Relay { host, port } => write!(f, "{host}:{port}"),
        }
    }
}

impl Nexthop {
    /// The configured nexthop, if there is one.
    pub fn find(settings: &Settings) -> Option<Self> {
        settings
            .global
            .nexthop
            .as_deref()
            .map(str::trim)
            .filter(|nexthop| !nexthop.is_empty())
            .map(Self::parse)
    }

    /// An existing path that is not a directory is a file destination,
    /// anything else is `host` or `host:port` of a relay.
    pub fn parse(value: &str) -> Self {
        let path = PathBuf::from(value);
        if std::fs::symlink_metadata(&path).is_ok_and(|metadata| !metadata.is_dir()) {
            return Self::File(path);
        }

        let (host, port) = match value.rsplit_once(':') {
            Some((host, port)) if !host.contains(':') || host.ends_with(']') => {
                match port.parse::<u16>() {
                    Ok(port) => (host, port),
                    Err(_) => (value, DEFAULT_PORT),
                }
            }
            _ => (value, DEFAULT_PORT),
        };

        Self::Relay {
            host: host.trim_start_matches('[').trim_end_matches(']').to_string(),
            port,
        }
    }

    /// Hand the session's spool file to this nexthop.
    ///
    /// Relays get the envelope recipients, or those of the message when the
    /// envelope has none, and the null sender when none is set.
    ///
    /// # Errors
    ///
    /// Returns an error if the message could not be handed over.
    pub async fn deliver(&self, settings: &Settings, session: &mut Session) -> Result<(), DeliveryError> {
        let spool = &session.envelope.message_file;

        match self {
            Self::File(path) => {
                internal!("Copying {} to {}", spool.display(), path.display());
                std::fs::copy(spool, path)
                    .map(|_| ())
                    .map_err(|source| DeliveryError::File {
                        path: path.clone(),
                        source,
                    })
            }
            Self::Relay { host, port } => {
                if session.envelope.recipients.is_empty() {
                    session.envelope.recipients =
                        session.message().map(|message| message.recipients()).unwrap_or_default();
                }

                let address = self.to_string();
                let data = std::fs::read(&session.envelope.message_file).map_err(|source| {
                    DeliveryError::File {
                        path: session.envelope.message_file.clone(),
                        source,
                    }
                })?;

                let stream = tokio::time::timeout(
                    settings.global.nexthop_timeout(),
                    TcpStream::connect((host.as_str(), *port)),
                )
                .await
                .unwrap_or_else(|_| Err(std::io::ErrorKind::TimedOut.into()))
                .map_err(|source| DeliveryError::Connection {
                    address: address.clone(),
                    source,
                })?;

                internal!(level = DEBUG, "Connected to relay {address}");
                RelayClient::new(stream, address, settings.global.nexthop_timeout())
                    .deliver(
                        &smtp::hostname(),
                        session.envelope.sender.as_deref().unwrap_or_default(),
                        &session.envelope.recipients,
                        &data,
                    )
                    .await
            }
        }
    }
}

#[cfg(test)]
mod test {
    use std::io::Write;

    use pretty_assertions::assert_eq;

    use crate::{config::Settings, error::DeliveryError, session::Session};

    use super::Nexthop;

    #[test]
    fn find() {
        let mut settings = Settings::default();
        assert!(Nexthop::find(&settings).is_none());

        settings.global.nexthop = Some(String::from("  "));
        assert!(Nexthop::find(&settings).is_none());

        settings.global.nexthop = Some(String::from("relay.example.com"));
        assert_eq!(
            Nexthop::find(&settings),
            Some(Nexthop::Relay {
                host: String::from("relay.example.com"),
                port: 25
            })
        );
    }

    #[test]
    fn parse() {
        assert_eq!(
            Nexthop::parse("127.0.0.1:10026"),
            Nexthop::Relay {
                host: String::from("127.0.0.1"),
                port: 10026
            }
        );
        assert_eq!(
            Nexthop::parse("[::1]:2525"),
            Nexthop::Relay {
                host: String::from("::1"),
                port: 2525
            }
        );
        assert_eq!(
            Nexthop::parse("relay:smtp"),
            Nexthop::Relay {
                host: String::from("relay:smtp"),
                port: 25
            }
        );

        let dir = tempfile::tempdir().expect("tempdir");
        let directory = dir.path().to_string_lossy().into_owned();
        assert!(matches!(Nexthop::parse(&directory), Nexthop::Relay { .. }));

        let file = dir.path().join("mbox");
        std::fs::write(&file, b"").expect("create file");
        assert_eq!(
            Nexthop::parse(&file.to_string_lossy()),
            Nexthop::File(file.clone())
        );
        assert_eq!(Nexthop::File(file.clone()).to_string(), file.display().to_string());
    }

    #[tokio::test]
    async fn file_delivery() {
        let dir = tempfile::tempdir().expect("tempdir");
        let target = dir.path().join("delivered");
        std::fs::write(&target, b"").expect("create target");

        let (mut spool, path) = crate::spool::create(dir.path()).expect("spool file");
        spool.write_all(b"Subject: x\r\n\r\nbody\r\n").expect("write spool");

        let mut session = Session::new();
        session.envelope.message_file = path;

        Nexthop::File(target.clone())
            .deliver(&Settings::default(), &mut session)
            .await
            .expect("delivered");

        assert_eq!(
            std::fs::read(&target).expect("delivered file"),
            b"Subject: x\r\n\r\nbody\r\n".to_vec()
        );

        session.envelope.message_file = dir.path().join("gone");
        let err = Nexthop::File(target)
            .deliver(&Settings::default(), &mut session)
            .await
            .expect_err("no spool file");
        assert!(matches!(err, DeliveryError::File { .. }));
    }
}
