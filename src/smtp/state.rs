use core::fmt::{self, Display, Formatter};
use std::{fs::File, sync::Arc};

use crate::{
    config::Settings,
    error::ProtocolError,
    internal,
    session::{Reply, Session},
    spool,
    status::Status,
    traits::fsm::FiniteStateMachine,
};

use super::command::{Command, mailbox};

#[derive(Debug, Default, Clone, Copy, PartialEq, Eq, Hash)]
pub enum State {
    #[default]
    Init,
    Helo,
    Xfwd,
    Mail,
    Rcpt,
    Data,
    Quit,
}

impl Display for State {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::Init => "INIT",
            Self::Helo => "HELO",
            Self::Xfwd => "XFWD",
            Self::Mail => "MAIL",
            Self::Rcpt => "RCPT",
            Self::Data => "DATA",
            Self::Quit => "QUIT",
        })
    }
}

/// Everything a transition reads or changes besides the state itself.
pub struct Context {
    pub settings: Arc<Settings>,
    pub hostname: String,
    pub session: Session,
    /// The spool file opened by DATA, waiting for the message.
    pub spool: Option<File>,
    /// Reply lines produced by the last transition, in order.
    pub response: Vec<String>,
}

impl Context {
    pub fn new(settings: Arc<Settings>, hostname: impl Into<String>) -> Self {
        Self {
            settings,
            hostname: hostname.into(),
            session: Session::new(),
            spool: None,
            response: Vec::default(),
        }
    }

    fn reply(&mut self, reply: impl ToString) {
        self.response.push(reply.to_string());
    }

    fn ok(&mut self) {
        self.reply(Reply::configured(&self.settings, Status::Ok));
    }

    /// Throw away the current session and start over.
    pub fn reset(&mut self) {
        if self.spool.take().is_some() {
            spool::remove(&self.session.envelope.message_file);
        }

        internal!("[{}] Session reset", self.session.id());
        self.session = Session::new();
    }

    fn greet(&mut self, host: String, extended: bool) {
        self.session.helo = Some(host);

        if extended {
            self.response.extend([
                format!("{}-{}", Status::Ok, self.hostname),
                format!("{}-XFORWARD ADDR", Status::Ok),
                format!("{} SIZE {}", Status::Ok, self.settings.global.max_size),
            ]);
        } else {
            let line = format!("{} {}", Status::Ok, self.hostname);
            self.reply(line);
        }
    }

    fn open_spool(&mut self) -> bool {
        match spool::create(&self.settings.global.queue_dir) {
            Ok((file, path)) => {
                internal!("[{}] Using spool file {}", self.session.id(), path.display());
                self.session.envelope.message_file = path;
                self.spool = Some(file);
                self.reply(Reply::configured(&self.settings, Status::StartMailInput));
                true
            }
            Err(err) => {
                internal!(level = ERROR, "[{}] {err}", self.session.id());
                self.reply(Reply::configured(&self.settings, err.status()));
                false
            }
        }
    }
}

impl FiniteStateMachine for State {
    type Input = Command;
    type Context = Context;

    fn transition(self, input: Self::Input, context: &mut Self::Context) -> Self {
        match (self, input) {
            (_, Command::Quit) => {
                context.reply(Reply::configured(&context.settings, Status::GoodBye));
                Self::Quit
            }
            (state, Command::Helo(host) | Command::Ehlo(host)) if host.is_empty() => {
                context.reply(ProtocolError::EMPTY_HELO);
                state
            }
            (state, Command::Helo(host)) => {
                if state != Self::Init {
                    context.reset();
                }
                context.greet(host, false);
                Self::Helo
            }
            (state, Command::Ehlo(host)) => {
                if state != Self::Init {
                    context.reset();
                }
                context.greet(host, true);
                Self::Helo
            }
            (state, Command::Xforward(None)) => {
                context.reply(ProtocolError::EMPTY_XFORWARD);
                state
            }
            (_, Command::Xforward(Some(addr))) => {
                context.session.xforward_addr = Some(addr);
                context.ok();
                Self::Xfwd
            }
            (Self::Mail, Command::MailFrom(_)) => {
                context.reply(ProtocolError::NESTED_MAIL);
                Self::Mail
            }
            (state, Command::MailFrom(from)) if from.is_empty() => {
                context.reply(ProtocolError::EMPTY_MAIL_FROM);
                state
            }
            (_, Command::MailFrom(from)) => {
                let sender = mailbox(&from);
                context.session.envelope.sender = (!sender.is_empty()).then(|| sender.to_string());
                context.ok();
                Self::Mail
            }
            (Self::Mail | Self::Rcpt, Command::RcptTo(to)) => {
                let recipient = mailbox(&to);
                if recipient.is_empty() {
                    context.reply(ProtocolError::EMPTY_RCPT_TO);
                    self
                } else {
                    context.session.envelope.recipients.push(recipient.to_string());
                    context.ok();
                    Self::Rcpt
                }
            }
            (state, Command::RcptTo(_)) => {
                context.reply(ProtocolError::NEED_MAIL);
                state
            }
            (Self::Mail, Command::Data) => {
                context.reply(ProtocolError::NO_RECIPIENTS);
                Self::Mail
            }
            (Self::Rcpt, Command::Data) => {
                if context.open_spool() {
                    Self::Data
                } else {
                    Self::Rcpt
                }
            }
            (state, Command::Data) => {
                context.reply(ProtocolError::NEED_RCPT);
                state
            }
            (_, Command::Rset) => {
                context.reset();
                context.ok();
                Self::Init
            }
            (state, Command::Noop) => {
                context.ok();
                state
            }
            (state, Command::Invalid(_)) => {
                context.reply(ProtocolError::UNRECOGNIZED);
                state
            }
        }
    }
}
