//! # Relay Core
//!
//! A transparent forwarding proxy for TCP connections carrying plaintext
//! HTTP or TLS. Each accepted connection is peeked (the `Host` header for
//! HTTP, the SNI extension for TLS) to learn the intended destination,
//! which is then dialed on the same port the client reached locally, and the
//! two sockets are spliced until either side closes.
//!
//! ## Architecture
//!
//! - **io**: the replicating reader that lets the sniffer consume a prefix
//!   of the inbound stream while the relay later replays it in full
//! - **app**: the protocol sniffers and the sniff-and-forward engine
//! - **system**: the accept-loop server
//! - **service**: the outbound dialer registry, including the upstream HTTP
//!   `CONNECT` path
//!
//! The process is stateless: two listeners (80 for HTTP, 443 for TLS) run
//! until SIGINT or SIGTERM.

use std::sync::Arc;

mod app;
mod config;
mod io;
mod service;
mod system;

use app::forward::{Forwarder, Protocol};
use system::server::Server;

#[tokio::main]
async fn main() {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();

    let settings = config::Settings::from_env();

    let http_server = Arc::new(Server::new(settings.http_listen, Forwarder::new(Protocol::Http)));
    let tls_server = Arc::new(Server::new(settings.tls_listen, Forwarder::new(Protocol::Tls)));

    let http_task = {
        let server = http_server.clone();
        tokio::spawn(async move {
            if let Err(err) = server.listen_and_serve().await {
                log::error!("http listener failed: {err}");
            }
        })
    };
    let tls_task = {
        let server = tls_server.clone();
        tokio::spawn(async move {
            if let Err(err) = server.listen_and_serve().await {
                log::error!("tls listener failed: {err}");
            }
        })
    };

    wait_for_teardown().await;

    log::info!("shutting down");
    http_server.close();
    tls_server.close();
    let _ = http_task.await;
    let _ = tls_task.await;
}

/// Resolves once the process receives SIGINT or SIGTERM.
async fn wait_for_teardown() {
    let (tx, mut rx) = tokio::sync::mpsc::unbounded_channel();
    ctrlc::set_handler(move || {
        let _ = tx.send(());
    })
    .expect("Error setting signal handler");
    let _ = rx.recv().await;
}
