//! Runs the configured modules against one session and hands the result on.

use core::fmt::{self, Display};
use std::sync::Arc;

use crate::{
    config::Settings,
    error::{DeliveryError, SpoolError},
    ffi::modules::{self, Module},
    internal,
    lookup::{Lookup, NoLookup},
    nexthop::Nexthop,
    session::Session,
};

pub mod headers;

pub use headers::HeaderSnapshot;

/// Header listing the modules a message went through.
pub const TRACE_HEADER: &str = "X-Spmfilter";

/// What a policy decided after a module returned a non-zero value.
#[repr(u8)]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Outcome {
    /// Stop here; the message is neither flushed nor delivered.
    Abort = 0,
    /// Stop here; the message has been dealt with already.
    StopAccept = 1,
    /// Skip the remaining modules but flush and deliver as usual.
    Continue = 2,
}

/// How processing of a session ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Disposition {
    /// Every module ran.
    Completed,
    /// A module failed and the policy aborted.
    Aborted,
    /// A module failed and the policy accepted the message as it was.
    Accepted,
    /// A module failed and the policy skipped the rest of the chain.
    Stopped,
}

impl Disposition {
    pub const fn code(self) -> i32 {
        match self {
            Self::Completed => 0,
            Self::Aborted => -1,
            Self::Accepted => 1,
            Self::Stopped => 2,
        }
    }

    /// Returns `true` if the message went on to be flushed and delivered.
    pub const fn is_processed(self) -> bool {
        matches!(self, Self::Completed | Self::Stopped)
    }
}

impl Display for Disposition {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::Completed => "completed",
            Self::Aborted => "aborted",
            Self::Accepted => "accepted",
            Self::Stopped => "stopped",
        })
    }
}

/// Front-end specific handling of failures.
///
/// The pipeline itself only knows how to carry on or stop; what a failure
/// means to whoever fed the message in is decided here.
pub trait Policy: Send + Sync {
    /// A configured module could not be loaded. Returning `true` skips it.
    fn load_error(&self, settings: &Settings, error: &modules::Error) -> bool;

    /// A module returned `retval`, which is not `0`.
    fn processing_error(&self, settings: &Settings, session: &mut Session, retval: i32) -> Outcome;

    /// The message could not be handed to the nexthop.
    fn nexthop_error(&self, settings: &Settings, session: &mut Session, error: &DeliveryError);
}

pub struct ProcessQueue {
    modules: Vec<Module>,
    policy: Arc<dyn Policy>,
    lookup: Arc<dyn Lookup>,
}

impl fmt::Debug for ProcessQueue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ProcessQueue")
            .field("modules", &self.modules)
            .finish_non_exhaustive()
    }
}

impl ProcessQueue {
    pub fn new(policy: impl Policy + 'static) -> Self {
        Self {
            modules: Vec::default(),
            policy: Arc::new(policy),
            lookup: Arc::new(NoLookup),
        }
    }

    /// Add modules that have already been created, after any existing ones.
    #[must_use]
    pub fn with_modules(mut self, modules: impl IntoIterator<Item = Module>) -> Self {
        self.modules.extend(modules);
        self
    }

    #[must_use]
    pub fn with_lookup(mut self, lookup: impl Lookup + 'static) -> Self {
        self.lookup = Arc::new(lookup);
        self
    }

    /// Load every module named in the configuration, in order.
    ///
    /// # Errors
    ///
    /// Returns the first load error the policy does not let through.
    pub fn load(mut self, settings: &Settings) -> Result<Self, modules::Error> {
        let module_dir = settings.global.module_dir.as_deref();

        for name in &settings.global.modules {
            match Module::create(name, None, module_dir) {
                Ok(module) => {
                    internal!(level = INFO, "Loaded module {module}");
                    self.modules.push(module);
                }
                Err(err) if self.policy.load_error(settings, &err) => {
                    internal!(level = WARN, "{err}, skipping");
                }
                Err(err) => {
                    internal!(level = ERROR, "{err}");
                    return Err(err);
                }
            }
        }

        Ok(self)
    }

    pub fn modules(&self) -> &[Module] {
        &self.modules
    }

    /// Run the module chain against `session`, then flush header changes and
    /// deliver the message unless a policy stopped processing.
    ///
    /// # Errors
    ///
    /// Returns an error if the spool file could not be rewritten. The session
    /// cannot be processed further.
    pub async fn process(
        &self,
        settings: &Settings,
        session: &mut Session,
    ) -> Result<Disposition, SpoolError> {
        let snapshot = HeaderSnapshot::take(session.message());
        self.fetch_users(session);

        let mut invoked = Vec::with_capacity(self.modules.len());
        let mut disposition = Disposition::Completed;

        for module in &self.modules {
            internal!(level = DEBUG, "[{}] Invoking module {module}", session.id());
            let retval = module.invoke(settings, session);
            invoked.push(module.name());

            if retval == 0 {
                continue;
            }

            let outcome = self.policy.processing_error(settings, session, retval);
            internal!(
                level = INFO,
                "[{}] Module {module} returned {retval}: {outcome:?}",
                session.id()
            );

            match outcome {
                Outcome::Abort => return Ok(Disposition::Aborted),
                Outcome::StopAccept => return Ok(Disposition::Accepted),
                Outcome::Continue => {
                    disposition = Disposition::Stopped;
                    break;
                }
            }
        }

        if settings.global.add_header
            && let Some(message) = session.message_mut()
        {
            message.append_header(TRACE_HEADER, format!("processed {}", invoked.join(",")));
        }

        headers::flush_if_dirty(&snapshot, settings, session)?;

        if let Some(nexthop) = Nexthop::find(settings) {
            match nexthop.deliver(settings, session).await {
                Ok(()) => internal!(level = INFO, "[{}] Delivered to {nexthop}", session.id()),
                Err(err) => {
                    internal!(
                        level = ERROR,
                        "[{}] Delivery to {nexthop} failed: {err}",
                        session.id()
                    );
                    self.policy.nexthop_error(settings, session, &err);
                }
            }
        }

        Ok(disposition)
    }

    /// Ask the lookup backend about the sender and every recipient not
    /// already cached in the session.
    fn fetch_users(&self, session: &mut Session) {
        let addresses = session
            .envelope
            .sender
            .iter()
            .chain(&session.envelope.recipients)
            .filter(|address| !address.is_empty() && !session.users.contains_key(*address))
            .cloned()
            .collect::<Vec<_>>();

        for address in addresses {
            match self.lookup.fetch_user(&address) {
                Ok(record) => {
                    session.users.insert(address, record);
                }
                Err(err) => internal!(level = WARN, "{err}"),
            }
        }
    }

    /// Release every module.
    pub fn unload(self) {
        for module in self.modules {
            if let Err(err) = module.destroy() {
                internal!(level = WARN, "{err}");
            }
        }
    }
}
