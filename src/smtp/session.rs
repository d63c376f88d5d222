use std::{sync::Arc, time::Duration};

use tokio::io::{AsyncBufReadExt, AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt, BufReader};

use crate::{
    config::Settings,
    error::{ProtocolError, SessionError},
    incoming, internal,
    message::Message,
    outgoing,
    pipeline::{Disposition, ProcessQueue},
    session::{self, Reply},
    spool,
    status::Status,
    traits::fsm::FiniteStateMachine,
};

use super::{
    ACCEPTED,
    command::Command,
    data::{DataOutcome, DataReceiver, Received, Synthesis, is_terminator},
    state::{Context, State},
};

/// Longest command line accepted, line ending included.
const MAX_COMMAND_LINE: usize = 512;

/// Longest line accepted between DATA and the end of the message.
const MAX_DATA_LINE: usize = 1024 * 1024;

enum Line {
    Complete(Vec<u8>),
    /// The line went on past the limit. What was read of it is dropped.
    TooLong,
    Closed,
}

/// One client connection, from greeting to QUIT.
pub struct Session<Reader, Writer> {
    reader: BufReader<Reader>,
    writer: Writer,
    state: State,
    context: Context,
    queue: Arc<ProcessQueue>,
    timeout: Duration,
}

impl<Reader, Writer> Session<Reader, Writer>
where
    Reader: AsyncRead + Unpin + Send,
    Writer: AsyncWrite + Unpin + Send,
{
    pub fn create(
        reader: Reader,
        writer: Writer,
        settings: Arc<Settings>,
        queue: Arc<ProcessQueue>,
        hostname: impl Into<String>,
    ) -> Self {
        Self {
            reader: BufReader::new(reader),
            writer,
            state: State::default(),
            timeout: settings.smtpd.timeout(),
            context: Context::new(settings, hostname),
            queue,
        }
    }

    /// Talk to the client until it quits or goes away.
    ///
    /// # Errors
    ///
    /// Returns an error if the connection fails or times out. The session is
    /// discarded without processing.
    pub async fn run(mut self) -> Result<(), SessionError> {
        let result = self.serve().await;

        if self.context.spool.take().is_some() {
            spool::remove(&self.context.session.envelope.message_file);
        }

        if let Err(ref err) = result {
            internal!(level = WARN, "[{}] {err}", self.context.session.id());
        }
        internal!("[{}] Connection closed", self.context.session.id());

        result
    }

    async fn serve(&mut self) -> Result<(), SessionError> {
        let greeting = format!(
            "{} {} spmfilter",
            Status::ServiceReady,
            self.context.hostname
        );
        self.send(&[greeting]).await?;

        loop {
            let line = match self.read_line(MAX_COMMAND_LINE).await? {
                Line::Complete(line) => line,
                Line::TooLong => {
                    internal!(
                        level = WARN,
                        "[{}] Command line longer than {MAX_COMMAND_LINE} bytes",
                        self.context.session.id()
                    );
                    if !self.skip_line(MAX_COMMAND_LINE).await? {
                        break;
                    }
                    self.send(&[ProtocolError::LINE_TOO_LONG.to_string()]).await?;
                    continue;
                }
                Line::Closed => break,
            };

            let command = Command::try_from(line.as_slice()).unwrap_or_else(|invalid| invalid);
            incoming!("[{}] {command}", self.context.session.id());

            self.state = self.state.transition(command, &mut self.context);
            let response = core::mem::take(&mut self.context.response);
            self.send(&response).await?;

            match self.state {
                State::Quit => break,
                State::Data => {
                    if !self.receive_data().await? {
                        break;
                    }
                }
                _ => {}
            }
        }

        Ok(())
    }

    async fn send(&mut self, lines: &[String]) -> Result<(), SessionError> {
        for line in lines {
            outgoing!("[{}] {line}", self.context.session.id());
            self.writer.write_all(format!("{line}\r\n").as_bytes()).await?;
        }
        self.writer.flush().await?;

        Ok(())
    }

    /// The next line from the client, including its line ending, if it fits
    /// in `limit` bytes.
    async fn read_line(&mut self, limit: usize) -> Result<Line, SessionError> {
        let mut line = Vec::new();
        let read = {
            let mut limited = (&mut self.reader).take(limit as u64);
            tokio::time::timeout(self.timeout, limited.read_until(b'\n', &mut line)).await
        };

        match read {
            Ok(Ok(0)) => Ok(Line::Closed),
            Ok(Ok(read)) if read >= limit && !line.ends_with(b"\n") => Ok(Line::TooLong),
            Ok(Ok(_)) => Ok(Line::Complete(line)),
            Ok(Err(err)) => Err(err.into()),
            Err(_) => {
                let reply = Reply::configured(&self.context.settings, Status::Unavailable);
                self.send(&[reply.to_string()]).await?;
                Err(SessionError::Timeout(self.timeout.as_secs()))
            }
        }
    }

    /// Drop the rest of an over-long line, `limit` bytes at a time.
    ///
    /// Returns `false` if the client closed the connection first.
    async fn skip_line(&mut self, limit: usize) -> Result<bool, SessionError> {
        loop {
            match self.read_line(limit).await? {
                Line::Complete(_) => return Ok(true),
                Line::TooLong => {}
                Line::Closed => return Ok(false),
            }
        }
    }

    /// Read the message following DATA and answer it.
    ///
    /// Returns `false` if the client went away before the message ended.
    async fn receive_data(&mut self) -> Result<bool, SessionError> {
        let Some(file) = self.context.spool.take() else {
            return Ok(true);
        };
        let path = self.context.session.envelope.message_file.clone();
        let mut receiver = DataReceiver::new(file, &path);
        let mut too_long = false;

        loop {
            let line = match self.read_line(MAX_DATA_LINE).await {
                Ok(Line::Complete(line)) => Some(line),
                Ok(Line::TooLong) => {
                    too_long = true;
                    match self.skip_line(MAX_DATA_LINE).await {
                        Ok(true) => continue,
                        Ok(false) => None,
                        Err(err) => {
                            spool::remove(&path);
                            return Err(err);
                        }
                    }
                }
                Ok(Line::Closed) => None,
                Err(err) => {
                    spool::remove(&path);
                    return Err(err);
                }
            };

            let Some(line) = line else {
                internal!(
                    level = WARN,
                    "[{}] Connection closed during DATA",
                    self.context.session.id()
                );
                spool::remove(&path);
                return Ok(false);
            };

            if too_long {
                if is_terminator(&line) {
                    break;
                }
            } else if receiver.push(&line) {
                break;
            }
        }

        if too_long {
            internal!(
                level = WARN,
                "[{}] Message has a line longer than {MAX_DATA_LINE} bytes",
                self.context.session.id()
            );
            drop(receiver);
            spool::remove(&path);
            self.send(&[ProtocolError::LINE_TOO_LONG.to_string()]).await?;
            self.finish_transaction();
            return Ok(true);
        }

        let settings = Arc::clone(&self.context.settings);
        let reply = match receiver.finish(settings.global.max_size) {
            Ok(DataOutcome::TooLarge { .. }) => Reply::configured(&settings, Status::ExceededStorage),
            Ok(DataOutcome::Received(received)) => {
                let reply = self.process(&settings, &received).await;
                spool::remove(&received.path);
                reply
            }
            Err(err) => {
                internal!(level = ERROR, "[{}] {err}", self.context.session.id());
                spool::remove(&path);
                Reply::configured(&settings, err.status())
            }
        };

        self.send(&[reply.to_string()]).await?;
        self.finish_transaction();

        Ok(true)
    }

    /// Complete a received message and run it through the pipeline.
    async fn process(&mut self, settings: &Settings, received: &Received) -> Reply {
        let session = &mut self.context.session;
        internal!(
            level = DEBUG,
            "[{}] Data complete, message size: {}",
            session.id(),
            received.size
        );

        let hostname = self.context.hostname.as_str();
        let synthesis = Synthesis {
            hostname,
            sender: session.envelope.sender.as_deref(),
        };

        let message = synthesis
            .apply(&settings.global.queue_dir, received)
            .map_err(|err| err.to_string())
            .and_then(|_| Message::load(&received.path).map_err(|err| err.to_string()));

        match message {
            Ok(message) => session.envelope.message = Some(message),
            Err(err) => {
                internal!(level = ERROR, "[{}] {err}", session.id());
                return Reply::configured(settings, Status::ActionUnavailable);
            }
        }

        let disposition = match self.queue.process(settings, session).await {
            Ok(disposition) => disposition,
            Err(err) => {
                internal!(level = ERROR, "[{}] {err}", session.id());
                return Reply::configured(settings, err.status());
            }
        };
        internal!(level = INFO, "[{}] Processing {disposition}", session.id());

        if let Some(reply) = session.reply.take() {
            return reply;
        }

        match disposition {
            Disposition::Aborted => Reply::configured(settings, Status::ActionUnavailable),
            Disposition::Completed | Disposition::Stopped | Disposition::Accepted => Reply::new(
                Status::Ok,
                session.response_msg.as_deref().unwrap_or(ACCEPTED),
            ),
        }
    }

    /// Start a new transaction, keeping what the client said about itself.
    fn finish_transaction(&mut self) {
        let previous = core::mem::replace(&mut self.context.session, session::Session::new());
        self.context.session.helo = previous.helo;
        self.context.session.xforward_addr = previous.xforward_addr;
        self.state = State::Helo;
    }
}
