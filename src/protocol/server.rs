use std::{
    io,
    net::{SocketAddr, TcpListener},
    sync::{
        Arc,
        atomic::{AtomicBool, Ordering},
    },
    thread,
    time::Duration,
};

use log::{info, warn};

use crate::connection::{self, ServerContext};

use super::{ThreadPool, transport::TransportError};

/// How often the accept loop re-checks the shutdown flag.
const ACCEPT_POLL: Duration = Duration::from_millis(50);

pub struct Server {
    listener: TcpListener,
    context: Arc<ServerContext>,
    pool: ThreadPool,
}

impl Server {
    pub fn bind(address: SocketAddr, context: ServerContext) -> Result<Self, TransportError> {
        let listener = TcpListener::bind(address)?;
        listener.set_nonblocking(true)?;
        let pool = ThreadPool::new(context.settings.max_connections);

        Ok(Self {
            listener,
            context: Arc::new(context),
            pool,
        })
    }

    pub fn local_addr(&self) -> Result<SocketAddr, TransportError> {
        Ok(self.listener.local_addr()?)
    }

    /// Flag that stops the accept loop and makes idle connections close.
    pub fn shutdown_handle(&self) -> Arc<AtomicBool> {
        Arc::clone(&self.context.shutdown)
    }

    /// Accepts connections until shutdown is requested, then waits for the
    /// connections being served to finish.
    pub fn listen(self) -> Result<(), TransportError> {
        info!("listening at {}", self.listener.local_addr()?);

        while !self.context.shutdown.load(Ordering::Acquire) {
            match self.listener.accept() {
                Ok((stream, peer)) => {
                    if let Err(e) = stream.set_nonblocking(false) {
                        warn!("dropping connection from {peer}: {e}");
                        continue;
                    }
                    let context = Arc::clone(&self.context);
                    if !self.pool.execute(move || connection::serve(stream, peer, context)) {
                        warn!("connection pool is gone, dropping connection from {peer}");
                    }
                }
                Err(e) if e.kind() == io::ErrorKind::WouldBlock => thread::sleep(ACCEPT_POLL),
                Err(e) => warn!("broken connection: {e:?}"),
            }
        }

        info!("shutting down, waiting for open connections");
        Ok(())
    }
}

/// Raises the shutdown flag when the process receives Ctrl-C.
pub fn install_shutdown_handler(shutdown: Arc<AtomicBool>) -> Result<(), ctrlc::Error> {
    ctrlc::set_handler(move || {
        info!("received shutdown signal");
        shutdown.store(true, Ordering::Release);
    })
}
