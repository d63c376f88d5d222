//! The SMTP daemon: accepts connections and hands each one to the worker
//! pool, which runs its session to completion.

use std::{net::SocketAddr, sync::Arc};

use tokio::{net::TcpListener, runtime::Handle};

use crate::{
    config::Settings,
    controller::{SHUTDOWN_BROADCAST, Signal},
    incoming, internal,
    pipeline::ProcessQueue,
    smtp,
};

pub mod pool;

pub use pool::WorkerPool;

pub struct Server {
    settings: Arc<Settings>,
    queue: Arc<ProcessQueue>,
    hostname: String,
}

impl Server {
    pub fn new(settings: Arc<Settings>, queue: Arc<ProcessQueue>) -> Self {
        Self {
            settings,
            queue,
            hostname: smtp::hostname(),
        }
    }

    #[must_use]
    pub fn with_hostname(mut self, hostname: impl Into<String>) -> Self {
        self.hostname = hostname.into();
        self
    }

    /// Bind the configured address and serve connections until a shutdown
    /// is signalled.
    ///
    /// # Errors
    ///
    /// Returns an error if the address cannot be bound or the worker pool
    /// cannot be started.
    pub async fn serve(&self) -> anyhow::Result<()> {
        let listener = TcpListener::bind(self.settings.smtpd.socket()).await?;
        self.serve_on(listener).await
    }

    /// Serve connections arriving on `listener` until a shutdown is
    /// signalled.
    ///
    /// # Errors
    ///
    /// Returns an error if the worker pool cannot be started.
    pub async fn serve_on(&self, listener: TcpListener) -> anyhow::Result<()> {
        let address = listener.local_addr()?;
        let mut pool = WorkerPool::new(self.settings.smtpd.workers)?;
        let mut receiver = SHUTDOWN_BROADCAST.subscribe();

        internal!(
            level = INFO,
            "Listening on {address} with {} workers",
            pool.size()
        );

        loop {
            tokio::select! {
                sig = receiver.recv() => {
                    if matches!(sig, Ok(Signal::Shutdown)) {
                        internal!(level = INFO, "Listener {address} received shutdown signal, finishing sessions ...");
                        break;
                    }
                }

                connection = listener.accept() => {
                    match connection {
                        Ok((stream, peer)) => self.dispatch(&pool, stream, peer),
                        Err(err) => internal!(level = WARN, "Failed to accept connection: {err}"),
                    }
                }
            }
        }

        drop(listener);
        pool.close();
        tokio::task::spawn_blocking(move || pool.shutdown()).await?;

        let _ = SHUTDOWN_BROADCAST.send(Signal::Finalised);
        internal!(level = INFO, "Listener {address} stopped");

        Ok(())
    }

    fn dispatch(&self, pool: &WorkerPool, stream: tokio::net::TcpStream, peer: SocketAddr) {
        incoming!(level = DEBUG, "Connection from {peer}");

        let handle = Handle::current();
        let settings = Arc::clone(&self.settings);
        let queue = Arc::clone(&self.queue);
        let hostname = self.hostname.clone();

        let accepted = pool.submit(move || {
            let (reader, writer) = stream.into_split();
            let session = smtp::Session::create(reader, writer, settings, queue, hostname);

            // Errors are logged by the session itself.
            let _ = handle.block_on(session.run());
        });

        if !accepted {
            internal!(level = WARN, "Shutting down, dropped connection from {peer}");
        }
    }
}
