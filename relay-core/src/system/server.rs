//! # TCP Server
//!
//! A thin accept loop: bind an address, hand every accepted connection to the
//! configured handler on its own task, and keep accepting until `close` is
//! called. Transient accept failures are logged and survived; a failure while
//! shutting down is the clean end of the loop.

use std::io;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::Notify;

/// Per-connection handler, invoked on a fresh task for every accepted socket.
#[async_trait]
pub trait ConnectionHandler: Send + Sync + 'static {
    async fn handle(&self, conn: TcpStream);
}

pub struct Server<H> {
    addr: String,
    handler: Arc<H>,
    listener: Mutex<Option<TcpListener>>,
    in_shutdown: AtomicBool,
    shutdown: Notify,
}

impl<H: ConnectionHandler> Server<H> {
    pub fn new(addr: impl Into<String>, handler: H) -> Self {
        Server {
            addr: addr.into(),
            handler: Arc::new(handler),
            listener: Mutex::new(None),
            in_shutdown: AtomicBool::new(false),
            shutdown: Notify::new(),
        }
    }

    /// Binds the configured address and reports the actual local address
    /// (useful when binding port 0).
    pub async fn listen(&self) -> io::Result<SocketAddr> {
        let listener = TcpListener::bind(&self.addr).await?;
        let local_addr = listener.local_addr()?;
        *self.listener.lock().unwrap() = Some(listener);
        Ok(local_addr)
    }

    pub async fn listen_and_serve(&self) -> io::Result<()> {
        self.listen().await?;
        self.serve().await
    }

    pub async fn serve(&self) -> io::Result<()> {
        let listener = self
            .listener
            .lock()
            .unwrap()
            .take()
            .ok_or_else(|| io::Error::new(io::ErrorKind::NotConnected, "server is not listening"))?;

        log::info!("listening on {}", self.addr);
        loop {
            if self.shutting_down() {
                log::info!("server for {} closed", self.addr);
                return Ok(());
            }
            tokio::select! {
                _ = self.shutdown.notified() => continue,
                accepted = listener.accept() => match accepted {
                    Ok((conn, _)) => {
                        let handler = self.handler.clone();
                        tokio::spawn(async move { handler.handle(conn).await });
                    }
                    Err(err) => {
                        if self.shutting_down() {
                            log::info!("server for {} closed", self.addr);
                            return Ok(());
                        }
                        log::error!("failed to accept new connection: {err}");
                    }
                },
            }
        }
    }

    /// Stops accepting; connections already handed off keep running.
    pub fn close(&self) {
        self.in_shutdown.store(true, Ordering::SeqCst);
        self.shutdown.notify_one();
    }

    fn shutting_down(&self) -> bool {
        self.in_shutdown.load(Ordering::SeqCst)
    }
}
