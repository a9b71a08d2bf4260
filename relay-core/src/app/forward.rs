//! # Sniff-and-Forward Engine
//!
//! Owns a client connection for its whole life: replicate the inbound byte
//! stream, sniff the destination host from the first application bytes on
//! one cursor, dial that host on the locally reached port, then relay the
//! replayed stream and the response bytes until either side is done.

use std::io;

use async_trait::async_trait;
use tokio::net::TcpStream;
use tokio::sync::mpsc;

use crate::app::sniff_http::sniff_http_host;
use crate::app::sniff_tls::sniff_tls_server_name;
use crate::io::replicate::replicate;
use crate::service::dialer::DIALERS;
use crate::system::server::ConnectionHandler;

/// Which first-flight format a listener expects.
#[derive(Debug, Clone, Copy)]
pub enum Protocol {
    Http,
    Tls,
}

/// Server handler that sniffs the destination and relays the connection.
pub struct Forwarder {
    protocol: Protocol,
}

impl Forwarder {
    pub fn new(protocol: Protocol) -> Self {
        Forwarder { protocol }
    }
}

#[async_trait]
impl ConnectionHandler for Forwarder {
    async fn handle(&self, conn: TcpStream) {
        sniff_and_forward(self.protocol, conn).await;
    }
}

/// Relays `client` to the host sniffed from its own first bytes, dialed on
/// the same port the client reached locally. The connection is closed by the
/// time this returns.
pub async fn sniff_and_forward(protocol: Protocol, client: TcpStream) {
    let caddr = match client.peer_addr() {
        Ok(addr) => addr,
        Err(err) => {
            log::error!("failed to resolve client address: {err}");
            return;
        }
    };
    let lport = match client.local_addr() {
        Ok(addr) => addr.port(),
        Err(err) => {
            log::error!("failed to resolve local address: {err} caddr={caddr}");
            return;
        }
    };

    let (client_read, mut client_write) = client.into_split();
    let [mut sniff_cursor, mut relay_cursor] = replicate::<_, 2>(client_read);

    let sniffed = match protocol {
        Protocol::Http => sniff_http_host(&mut sniff_cursor).await,
        Protocol::Tls => sniff_tls_server_name(&mut sniff_cursor).await,
    };
    // the relay cursor replays the sniffed prefix, so the sniffing cursor
    // must release it here
    drop(sniff_cursor);

    let host = match sniffed {
        Ok(host) => host,
        Err(err) => {
            log::error!("failed to sniff target hostname: {err} caddr={caddr} lport={lport}");
            return;
        }
    };

    let saddr = format!("{host}:{lport}");
    log::info!("connecting caddr={caddr} lport={lport} saddr={saddr}");

    let target = match DIALERS.dial(&saddr).await {
        Ok(target) => target,
        Err(err) => {
            log::error!("failed to connect: {err} caddr={caddr} lport={lport} saddr={saddr}");
            return;
        }
    };
    log::info!("connected caddr={caddr} lport={lport} saddr={saddr}");

    let (mut target_read, mut target_write) = tokio::io::split(target);
    // sized for both pumps so neither send can be dropped
    let (done, mut first_done) = mpsc::channel::<io::Result<u64>>(2);

    let downstream = {
        let done = done.clone();
        tokio::spawn(async move {
            let result = tokio::io::copy(&mut target_read, &mut client_write).await;
            let _ = done.send(result).await;
        })
    };
    let upstream = tokio::spawn(async move {
        let result = tokio::io::copy(&mut relay_cursor, &mut target_write).await;
        let _ = done.send(result).await;
    });

    // The first pump to finish ends the session; aborting both drops every
    // socket half, which closes the two connections and stops the other pump.
    match first_done.recv().await {
        Some(Err(err)) => {
            log::error!("failed to transport: {err} caddr={caddr} lport={lport} saddr={saddr}")
        }
        _ => log::info!("finished transporting caddr={caddr} lport={lport} saddr={saddr}"),
    }
    downstream.abort();
    upstream.abort();
}
