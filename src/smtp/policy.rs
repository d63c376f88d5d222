use crate::{
    config::Settings,
    error::DeliveryError,
    ffi::modules,
    pipeline::{Outcome, Policy},
    session::{Reply, Session},
    status::Status,
};

use super::ACCEPTED;

/// Turns module failures into replies for the SMTP client.
///
/// A reply decided on here is stored in the session and is the one the
/// client gets for the DATA transaction.
#[derive(Debug, Default, Clone, Copy)]
pub struct SmtpPolicy;

impl SmtpPolicy {
    /// The reply for a failed module, according to `module_fail`.
    fn module_failed(settings: &Settings, session: &mut Session) -> Outcome {
        match settings.global.module_fail {
            1 => Outcome::StopAccept,
            2 => {
                session.reply = Some(Reply::configured(settings, Status::ExceededStorage));
                Outcome::Abort
            }
            3 => {
                session.reply = Some(Reply::configured(settings, Status::ActionUnavailable));
                Outcome::Abort
            }
            _ => Outcome::Abort,
        }
    }
}

impl Policy for SmtpPolicy {
    fn load_error(&self, settings: &Settings, _error: &modules::Error) -> bool {
        settings.global.module_fail == 1
    }

    fn processing_error(&self, settings: &Settings, session: &mut Session, retval: i32) -> Outcome {
        match retval {
            -1 => Self::module_failed(settings, session),
            1 => {
                let text = session.response_msg.as_deref().unwrap_or(ACCEPTED);
                session.reply = Some(Reply::new(Status::Ok, text));
                Outcome::StopAccept
            }
            2 => Outcome::Continue,
            code => {
                session.reply = Some(Reply::for_code(
                    settings,
                    u32::try_from(code).unwrap_or_default(),
                    session.response_msg.as_deref(),
                ));
                Outcome::StopAccept
            }
        }
    }

    fn nexthop_error(&self, settings: &Settings, session: &mut Session, _error: &DeliveryError) {
        session.reply = Some(Reply::for_code(
            settings,
            settings.smtpd.nexthop_fail_code,
            Some(settings.smtpd.nexthop_fail_msg.as_str()),
        ));
    }
}

#[cfg(test)]
mod test {
    use pretty_assertions::assert_eq;

    use crate::{
        config::Settings,
        error::DeliveryError,
        pipeline::{Outcome, Policy},
        session::Session,
    };

    use super::SmtpPolicy;

    fn reply(session: &Session) -> Option<String> {
        session.reply.as_ref().map(ToString::to_string)
    }

    #[test]
    fn module_fail() {
        let mut settings = Settings::default();
        let mut session = Session::new();

        settings.global.module_fail = 1;
        assert_eq!(
            SmtpPolicy.processing_error(&settings, &mut session, -1),
            Outcome::StopAccept
        );
        assert_eq!(reply(&session), None);

        settings.global.module_fail = 2;
        assert_eq!(
            SmtpPolicy.processing_error(&settings, &mut session, -1),
            Outcome::Abort
        );
        assert_eq!(
            reply(&session).as_deref(),
            Some("552 Requested action aborted: local error in processing")
        );

        settings.global.module_fail = 3;
        settings.smtpd.codes.insert(String::from("451"), String::from("Later"));
        assert_eq!(
            SmtpPolicy.processing_error(&settings, &mut session, -1),
            Outcome::Abort
        );
        assert_eq!(reply(&session).as_deref(), Some("451 Later"));
    }

    #[test]
    fn return_values() {
        let settings = Settings::default();
        let mut session = Session::new();

        assert_eq!(
            SmtpPolicy.processing_error(&settings, &mut session, 2),
            Outcome::Continue
        );
        assert_eq!(reply(&session), None);

        assert_eq!(
            SmtpPolicy.processing_error(&settings, &mut session, 1),
            Outcome::StopAccept
        );
        assert_eq!(reply(&session).as_deref(), Some("250 OK message accepted"));

        session.response_msg = Some(String::from("Blocked by policy"));
        assert_eq!(
            SmtpPolicy.processing_error(&settings, &mut session, 554),
            Outcome::StopAccept
        );
        assert_eq!(reply(&session).as_deref(), Some("554 Blocked by policy"));

        session.response_msg = None;
        assert_eq!(
            SmtpPolicy.processing_error(&settings, &mut session, 552),
            Outcome::StopAccept
        );
        assert_eq!(
            reply(&session).as_deref(),
            Some("552 Requested action aborted: local error in processing")
        );
    }

    #[test]
    fn codes_without_text_get_451() {
        let mut settings = Settings::default();
        let mut session = Session::new();
        let fallback = "451 Requested action aborted: local error in processing";

        for code in [550, 42, 12345, -7] {
            assert_eq!(
                SmtpPolicy.processing_error(&settings, &mut session, code),
                Outcome::StopAccept
            );
            assert_eq!(reply(&session).as_deref(), Some(fallback));
        }

        session.response_msg = Some(String::from("Go away"));
        SmtpPolicy.processing_error(&settings, &mut session, 42);
        assert_eq!(reply(&session).as_deref(), Some(fallback));
        SmtpPolicy.processing_error(&settings, &mut session, 550);
        assert_eq!(reply(&session).as_deref(), Some("550 Go away"));

        session.response_msg = None;
        settings
            .smtpd
            .codes
            .insert(String::from("550"), String::from("Mailbox unavailable"));
        SmtpPolicy.processing_error(&settings, &mut session, 550);
        assert_eq!(reply(&session).as_deref(), Some("550 Mailbox unavailable"));
    }

    #[test]
    fn nexthop() {
        let mut settings = Settings::default();
        settings.smtpd.nexthop_fail_code = 421;
        settings.smtpd.nexthop_fail_msg = String::from("Relay down");

        let mut session = Session::new();
        SmtpPolicy.nexthop_error(
            &settings,
            &mut session,
            &DeliveryError::MalformedReply(String::from("?")),
        );

        assert_eq!(reply(&session).as_deref(), Some("421 Relay down"));
    }
}
