//! A minimal SMTP client for handing messages to a relay.

use std::time::Duration;

use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

use crate::{error::DeliveryError, incoming, internal, outgoing};

/// Initial size of the read buffer for replies.
const BUFFER_SIZE: usize = 4096;

/// Replies larger than this are treated as malformed.
const MAX_BUFFER_SIZE: usize = 64 * 1024;

/// A complete, possibly multi-line, reply from the relay.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Response {
    pub code: u32,
    pub lines: Vec<String>,
}

impl Response {
    pub fn message(&self) -> String {
        self.lines.join(" ")
    }

    /// Parses the first complete reply in `buffer`.
    ///
    /// Returns the reply and the number of bytes it took up, or `None` if
    /// more data is needed.
    ///
    /// # Errors
    ///
    /// Returns an error if the data is not an SMTP reply.
    pub fn parse(buffer: &[u8]) -> Result<Option<(Self, usize)>, DeliveryError> {
        let mut lines = Vec::new();
        let mut code = None;
        let mut consumed = 0;

        while let Some(end) = buffer[consumed..].iter().position(|&b| b == b'\n') {
            let raw = &buffer[consumed..consumed + end];
            consumed += end + 1;

            let line = String::from_utf8_lossy(raw.strip_suffix(b"\r").unwrap_or(raw));
            if line.len() < 3 || !line.is_char_boundary(3) {
                return Err(DeliveryError::MalformedReply(line.into_owned()));
            }

            let line_code = line[..3]
                .parse::<u32>()
                .map_err(|_| DeliveryError::MalformedReply(line.to_string()))?;
            if code.is_some_and(|code| code != line_code) {
                return Err(DeliveryError::MalformedReply(line.into_owned()));
            }
            code = Some(line_code);

            let last = match line.as_bytes().get(3) {
                None | Some(b' ') => true,
                Some(b'-') => false,
                Some(_) => return Err(DeliveryError::MalformedReply(line.into_owned())),
            };

            lines.push(line.get(4..).unwrap_or_default().to_string());

            if last {
                return Ok(Some((Self { code: line_code, lines }, consumed)));
            }
        }

        Ok(None)
    }

    const fn is_ok(&self) -> bool {
        self.code == 250
    }

    fn require(self, codes: &[u32]) -> Result<Self, DeliveryError> {
        if codes.contains(&self.code) {
            Ok(self)
        } else {
            Err(DeliveryError::Rejected {
                code: self.code,
                message: self.message(),
            })
        }
    }
}

/// Add a leading dot to every line starting with one, normalise line endings
/// to CRLF and make sure the data ends with a line ending.
pub fn dot_stuff(data: &[u8]) -> Vec<u8> {
    let mut stuffed = Vec::with_capacity(data.len() + data.len() / 64 + 2);

    for line in data.split_inclusive(|&b| b == b'\n') {
        let content = line
            .strip_suffix(b"\n")
            .map(|line| line.strip_suffix(b"\r").unwrap_or(line))
            .unwrap_or(line);

        if content.first() == Some(&b'.') {
            stuffed.push(b'.');
        }
        stuffed.extend_from_slice(content);
        stuffed.extend_from_slice(b"\r\n");
    }

    stuffed
}

pub struct RelayClient<Stream> {
    stream: Stream,
    address: String,
    timeout: Duration,
    buffer: Vec<u8>,
    buffer_pos: usize,
}

impl<Stream: AsyncRead + AsyncWrite + Unpin + Send> RelayClient<Stream> {
    pub fn new(stream: Stream, address: impl Into<String>, timeout: Duration) -> Self {
        Self {
            stream,
            address: address.into(),
            timeout,
            buffer: vec![0; BUFFER_SIZE],
            buffer_pos: 0,
        }
    }

    fn io_error(&self, source: std::io::Error) -> DeliveryError {
        DeliveryError::Connection {
            address: self.address.clone(),
            source,
        }
    }

    async fn send(&mut self, data: &[u8]) -> Result<(), DeliveryError> {
        match tokio::time::timeout(self.timeout, self.stream.write_all(data)).await {
            Ok(Ok(())) => Ok(()),
            Ok(Err(err)) => Err(self.io_error(err)),
            Err(_) => Err(self.io_error(std::io::ErrorKind::TimedOut.into())),
        }
    }

    async fn read_response(&mut self) -> Result<Response, DeliveryError> {
        loop {
            if let Some((response, consumed)) = Response::parse(&self.buffer[..self.buffer_pos])? {
                self.buffer.copy_within(consumed..self.buffer_pos, 0);
                self.buffer_pos -= consumed;

                incoming!("{} {}", response.code, response.message());
                return Ok(response);
            }

            if self.buffer_pos >= self.buffer.len() {
                let size = self.buffer.len() * 2;
                if size > MAX_BUFFER_SIZE {
                    return Err(DeliveryError::MalformedReply(format!(
                        "Reply exceeds {MAX_BUFFER_SIZE} bytes"
                    )));
                }
                self.buffer.resize(size, 0);
            }

            let read = tokio::time::timeout(
                self.timeout,
                self.stream.read(&mut self.buffer[self.buffer_pos..]),
            )
            .await;

            match read {
                Ok(Ok(0)) => return Err(self.io_error(std::io::ErrorKind::UnexpectedEof.into())),
                Ok(Ok(read)) => self.buffer_pos += read,
                Ok(Err(err)) => return Err(self.io_error(err)),
                Err(_) => return Err(self.io_error(std::io::ErrorKind::TimedOut.into())),
            }
        }
    }

    async fn command(&mut self, command: &str) -> Result<Response, DeliveryError> {
        outgoing!("{command}");
        self.send(format!("{command}\r\n").as_bytes()).await?;
        self.read_response().await
    }

    /// Run a whole transaction: greeting, EHLO (or HELO), MAIL, RCPT for each
    /// recipient, DATA and QUIT.
    ///
    /// # Errors
    ///
    /// Returns an error if the relay cannot be talked to, or answers any step
    /// with something other than what was expected. The message counts as
    /// delivered only when the relay answers the data with 250.
    pub async fn deliver(
        mut self,
        helo: &str,
        sender: &str,
        recipients: &[String],
        data: &[u8],
    ) -> Result<(), DeliveryError> {
        self.read_response().await?.require(&[220])?;

        if !self.command(&format!("EHLO {helo}")).await?.is_ok() {
            self.command(&format!("HELO {helo}")).await?.require(&[250])?;
        }

        self.command(&format!("MAIL FROM:<{sender}>")).await?.require(&[250])?;
        for recipient in recipients {
            self.command(&format!("RCPT TO:<{recipient}>"))
                .await?
                .require(&[250, 251])?;
        }

        self.command("DATA").await?.require(&[354])?;

        outgoing!("<{} bytes of message data>", data.len());
        self.send(&dot_stuff(data)).await?;
        self.send(b".\r\n").await?;
        self.read_response().await?.require(&[250])?;

        if let Err(err) = self.command("QUIT").await {
            internal!(level = DEBUG, "Relay {} did not answer QUIT: {err}", self.address);
        }

        Ok(())
    }
}

#[cfg(test)]
mod test {
    use std::time::Duration;

    use pretty_assertions::assert_eq;
    use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};

    use crate::error::DeliveryError;

    use super::{RelayClient, Response, dot_stuff};

    #[test]
    fn parse_responses() {
        let (response, consumed) = Response::parse(b"250 OK\r\n")
            .expect("valid")
            .expect("complete");
        assert_eq!(response.code, 250);
        assert_eq!(response.lines, vec!["OK"]);
        assert_eq!(consumed, 8);

        let data = b"250-relay.example.com\r\n250-SIZE 1000\r\n250 HELP\r\n";
        let (response, consumed) = Response::parse(data).expect("valid").expect("complete");
        assert_eq!(response.lines, vec!["relay.example.com", "SIZE 1000", "HELP"]);
        assert_eq!(consumed, data.len());

        assert!(Response::parse(b"250-relay\r\n250 HE").expect("valid").is_none());
        assert!(Response::parse(b"hello\r\n").is_err());
        assert!(Response::parse(b"250-one\r\n251 two\r\n").is_err());
    }

    #[test]
    fn stuffing() {
        assert_eq!(
            dot_stuff(b"line\n.hidden\r\n..two\nlast"),
            b"line\r\n..hidden\r\n...two\r\nlast\r\n".to_vec()
        );
    }

    /// Plays the relay side of a transaction, answering each command from
    /// `replies` and returning everything the client sent.
    async fn relay(stream: tokio::io::DuplexStream, replies: &[&str]) -> Vec<String> {
        let mut stream = BufReader::new(stream);
        let mut replies = replies.iter();
        let mut received = Vec::new();

        if let Some(greeting) = replies.next() {
            stream.write_all(greeting.as_bytes()).await.expect("write");
        }

        let mut in_data = false;
        loop {
            let mut line = String::new();
            if stream.read_line(&mut line).await.expect("read") == 0 {
                break;
            }
            received.push(line.clone());

            if in_data && line != ".\r\n" {
                continue;
            }
            in_data = line == "DATA\r\n";

            match replies.next() {
                Some(reply) => stream.write_all(reply.as_bytes()).await.expect("write"),
                None => break,
            }
        }

        received
    }

    #[tokio::test]
    async fn delivers() {
        let (client, server) = tokio::io::duplex(1024);
        let relay = tokio::spawn(async move {
            relay(
                server,
                &[
                    "220 relay ready\r\n",
                    "250-relay\r\n250 SIZE 0\r\n",
                    "250 OK\r\n",
                    "250 OK\r\n",
                    "251 forwarded\r\n",
                    "354 go ahead\r\n",
                    "250 queued\r\n",
                    "221 bye\r\n",
                ],
            )
            .await
        });

        RelayClient::new(client, "relay", Duration::from_secs(5))
            .deliver(
                "filter.example.com",
                "",
                &[String::from("a@example.com"), String::from("b@example.com")],
                b"Subject: hi\r\n\r\n.dot\r\n",
            )
            .await
            .expect("delivered");

        assert_eq!(
            relay.await.expect("relay"),
            vec![
                "EHLO filter.example.com\r\n",
                "MAIL FROM:<>\r\n",
                "RCPT TO:<a@example.com>\r\n",
                "RCPT TO:<b@example.com>\r\n",
                "DATA\r\n",
                "Subject: hi\r\n",
                "\r\n",
                "..dot\r\n",
                ".\r\n",
                "QUIT\r\n",
            ]
        );
    }

    #[tokio::test]
    async fn falls_back_to_helo() {
        let (client, server) = tokio::io::duplex(1024);
        let relay = tokio::spawn(async move {
            relay(
                server,
                &[
                    "220 relay ready\r\n",
                    "502 no\r\n",
                    "250 relay\r\n",
                    "250 OK\r\n",
                    "250 OK\r\n",
                    "354 go ahead\r\n",
                    "250 queued\r\n",
                    "221 bye\r\n",
                ],
            )
            .await
        });

        RelayClient::new(client, "relay", Duration::from_secs(5))
            .deliver("filter", "s@example.com", &[String::from("r@example.com")], b"body")
            .await
            .expect("delivered");

        let received = relay.await.expect("relay");
        assert_eq!(received[0], "EHLO filter\r\n");
        assert_eq!(received[1], "HELO filter\r\n");
        assert_eq!(received[2], "MAIL FROM:<s@example.com>\r\n");
    }

    #[tokio::test]
    async fn rejected_data() {
        let (client, server) = tokio::io::duplex(1024);
        tokio::spawn(async move {
            relay(
                server,
                &[
                    "220 relay ready\r\n",
                    "250 relay\r\n",
                    "250 OK\r\n",
                    "250 OK\r\n",
                    "354 go ahead\r\n",
                    "554 spam\r\n",
                ],
            )
            .await
        });

        let err = RelayClient::new(client, "relay", Duration::from_secs(5))
            .deliver("filter", "", &[String::from("r@example.com")], b"body\r\n")
            .await
            .expect_err("rejected");

        assert!(matches!(err, DeliveryError::Rejected { code: 554, .. }));
    }
}
