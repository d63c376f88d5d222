//! The SMTP front-end: a daemon speaking just enough SMTP to receive
//! messages from an MTA and feed them through the pipeline.

pub mod command;
pub mod data;
pub mod policy;
pub mod session;
pub mod state;

pub use self::{command::Command, policy::SmtpPolicy, session::Session, state::State};

/// Text of the reply to an accepted message.
pub const ACCEPTED: &str = "OK message accepted";

/// The name of this host, as used in greetings and generated headers.
pub fn hostname() -> String {
    let mut buffer = [0_u8; 256];

    // SAFETY: the length passed is the length of the buffer
    let ret = unsafe { libc::gethostname(buffer.as_mut_ptr().cast(), buffer.len()) };
    if ret != 0 {
        return String::from("localhost");
    }

    let end = buffer.iter().position(|&b| b == 0).unwrap_or(buffer.len());
    String::from_utf8_lossy(&buffer[..end]).into_owned()
}
