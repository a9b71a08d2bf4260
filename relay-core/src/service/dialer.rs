//! # Outbound Dialer Registry
//!
//! Resolves how outbound connections are opened. The default path is a plain
//! TCP dial; when the environment names an upstream proxy (the classic
//! `ALL_PROXY` convention), the scheme of that URL selects the dialer that
//! tunnels through it.

use std::io;

use async_trait::async_trait;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::net::TcpStream;
use url::Url;

use super::httpproxy::HttpProxyDialer;

/// A duplex byte stream handed back by a dialer.
pub trait Stream: AsyncRead + AsyncWrite + Send + Unpin {}
impl<T: AsyncRead + AsyncWrite + Send + Unpin> Stream for T {}

pub type BoxedStream = Box<dyn Stream>;

#[async_trait]
pub trait Dialer: Send + Sync {
    async fn dial(&self, address: &str) -> io::Result<BoxedStream>;
}

/// Plain TCP, the out-of-the-box outbound path.
pub struct DirectDialer;

#[async_trait]
impl Dialer for DirectDialer {
    async fn dial(&self, address: &str) -> io::Result<BoxedStream> {
        Ok(Box::new(TcpStream::connect(address).await?))
    }
}

/// Maps a proxy URL scheme to the dialer that understands it.
fn dialer_for(proxy_url: Url) -> Option<Box<dyn Dialer>> {
    match proxy_url.scheme() {
        "http" | "https" => Some(Box::new(HttpProxyDialer::new(proxy_url))),
        other => {
            log::error!("unsupported proxy scheme {other:?}, using direct connections");
            None
        }
    }
}

pub struct DialerRegistry {
    upstream: Option<Box<dyn Dialer>>,
}

impl DialerRegistry {
    pub fn from_env() -> Self {
        let raw = std::env::var("ALL_PROXY")
            .or_else(|_| std::env::var("all_proxy"))
            .ok();
        Self::from_proxy_url(raw.as_deref())
    }

    fn from_proxy_url(raw: Option<&str>) -> Self {
        let upstream = raw.and_then(|raw| match Url::parse(raw) {
            Ok(proxy_url) => dialer_for(proxy_url),
            Err(err) => {
                log::error!("invalid proxy url in environment: {err}");
                None
            }
        });
        DialerRegistry { upstream }
    }

    pub async fn dial(&self, address: &str) -> io::Result<BoxedStream> {
        match &self.upstream {
            Some(dialer) => dialer.dial(address).await,
            None => DirectDialer.dial(address).await,
        }
    }
}

lazy_static::lazy_static! {
    /// Process-wide outbound dialer, resolved once from the environment.
    pub static ref DIALERS: DialerRegistry = DialerRegistry::from_env();
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn no_proxy_configured_means_direct_connections() {
        assert!(DialerRegistry::from_proxy_url(None).upstream.is_none());
    }

    #[test]
    fn an_http_proxy_url_selects_the_connect_dialer() {
        let registry = DialerRegistry::from_proxy_url(Some("http://proxy.example:3128"));
        assert!(registry.upstream.is_some());
    }

    #[test]
    fn unsupported_schemes_fall_back_to_direct() {
        let registry = DialerRegistry::from_proxy_url(Some("socks5://proxy.example:1080"));
        assert!(registry.upstream.is_none());
    }

    #[test]
    fn unparseable_proxy_urls_fall_back_to_direct() {
        let registry = DialerRegistry::from_proxy_url(Some("not a url"));
        assert!(registry.upstream.is_none());
    }
}
