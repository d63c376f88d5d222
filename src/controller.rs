use std::sync::{Arc, LazyLock};

use tokio::sync::broadcast;

use crate::{
    config::{Engine, Settings},
    ffi::modules::Module,
    internal,
    lookup::StaticLookup,
    pipe::{self, PipePolicy},
    pipeline::{Policy, ProcessQueue},
    server::Server,
    smtp::SmtpPolicy,
};

#[derive(Debug, Clone, Copy)]
pub enum Signal {
    Shutdown,
    Finalised,
}

pub static SHUTDOWN_BROADCAST: LazyLock<broadcast::Sender<Signal>> = LazyLock::new(|| {
    let (sender, _receiver) = broadcast::channel(64);
    sender
});

#[cfg(unix)]
async fn terminate() {
    use tokio::signal::unix::{SignalKind, signal};

    match signal(SignalKind::terminate()) {
        Ok(mut sigterm) => {
            sigterm.recv().await;
        }
        Err(err) => {
            internal!(level = WARN, "Unable to listen for SIGTERM: {err}");
            std::future::pending::<()>().await;
        }
    }
}

#[cfg(not(unix))]
async fn terminate() {
    std::future::pending::<()>().await;
}

/// Wait for CTRL+C or SIGTERM, then tell everything to stop and wait until
/// the listener reports that it has.
async fn shutdown() -> anyhow::Result<()> {
    tokio::select! {
        _ = tokio::signal::ctrl_c() => {
            internal!(level = INFO, "CTRL+C entered -- Enter it again to force shutdown");
        }
        () = terminate() => {
            internal!(level = INFO, "SIGTERM received, shutting down");
        }
    }

    let mut receiver = SHUTDOWN_BROADCAST.subscribe();
    SHUTDOWN_BROADCAST.send(Signal::Shutdown)?;

    loop {
        tokio::select! {
            sig = receiver.recv() => {
                match sig {
                    Ok(Signal::Finalised) | Err(broadcast::error::RecvError::Closed) => break,
                    Ok(s) => internal!(level = DEBUG, "Received {s:?}"),
                    Err(e) => internal!(level = DEBUG, "Received: {e:?}"),
                }
            }

            _ = tokio::signal::ctrl_c() => {
                break;
            }
        }
    }

    Ok(())
}

/// Owns the configuration and the module chain, and runs the configured
/// engine with them.
pub struct Controller {
    settings: Arc<Settings>,
    modules: Vec<Module>,
}

impl Controller {
    pub fn new(settings: Settings) -> Self {
        Self {
            settings: Arc::new(settings),
            modules: Vec::default(),
        }
    }

    /// Run in-process modules ahead of the configured native ones.
    #[must_use]
    pub fn with_modules(mut self, modules: impl IntoIterator<Item = Module>) -> Self {
        self.modules.extend(modules);
        self
    }

    fn queue(&mut self, policy: impl Policy + 'static) -> anyhow::Result<ProcessQueue> {
        let queue = ProcessQueue::new(policy)
            .with_lookup(StaticLookup::from(&self.settings.lookup))
            .with_modules(core::mem::take(&mut self.modules))
            .load(&self.settings)?;

        internal!(
            level = INFO,
            "Module chain: [{}]",
            queue
                .modules()
                .iter()
                .map(Module::name)
                .collect::<Vec<_>>()
                .join(", ")
        );

        Ok(queue)
    }

    /// Run the configured engine to completion and return the process exit
    /// status.
    ///
    /// # Errors
    ///
    /// Returns an error if a configured module fails to load and the failure
    /// policy does not allow skipping it, or the SMTP listener cannot be
    /// started.
    pub async fn run(mut self) -> anyhow::Result<i32> {
        internal!("Controller running");

        match self.settings.global.engine {
            Engine::Smtpd => {
                let queue = Arc::new(self.queue(SmtpPolicy)?);
                let server = Server::new(Arc::clone(&self.settings), Arc::clone(&queue));

                tokio::select! {
                    result = server.serve() => result?,
                    result = shutdown() => result?,
                };

                internal!(level = INFO, "Shutting down...");
                if let Ok(queue) = Arc::try_unwrap(queue) {
                    queue.unload();
                }

                Ok(0)
            }
            Engine::Pipe => {
                let queue = self.queue(PipePolicy)?;
                let result = pipe::run(&self.settings, &queue, std::io::stdin().lock()).await;
                queue.unload();

                Ok(result.map_or(1, pipe::exit_code))
            }
        }
    }
}
