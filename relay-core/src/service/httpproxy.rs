//! # HTTP `CONNECT` Dialer
//!
//! Opens outbound connections through an upstream HTTP proxy. The proxy is
//! reached over plain TCP or, for `https` proxy URLs, through a TLS client
//! handshake; the target is then requested with `CONNECT` and the raw socket
//! is handed back once the proxy answers 200.

use std::io;
use std::sync::Arc;

use async_trait::async_trait;
use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine as _;
use bytes::BytesMut;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio_rustls::rustls::pki_types::ServerName;
use tokio_rustls::rustls::{ClientConfig, RootCertStore};
use tokio_rustls::TlsConnector;
use url::Url;

use super::dialer::{BoxedStream, Dialer};

pub struct HttpProxyDialer {
    proxy_url: Url,

    // testing field
    tls_roots: Option<RootCertStore>,
}

impl HttpProxyDialer {
    pub fn new(proxy_url: Url) -> Self {
        HttpProxyDialer {
            proxy_url,
            tls_roots: None,
        }
    }

    #[cfg(test)]
    fn with_tls_roots(proxy_url: Url, tls_roots: RootCertStore) -> Self {
        HttpProxyDialer {
            proxy_url,
            tls_roots: Some(tls_roots),
        }
    }

    /// The proxy's host and port, the port defaulting from the scheme.
    fn proxy_addr(&self) -> io::Result<(String, u16)> {
        let host = self
            .proxy_url
            .host_str()
            .ok_or_else(|| io::Error::new(io::ErrorKind::InvalidInput, "proxy url has no host"))?;
        let port = self
            .proxy_url
            .port_or_known_default()
            .ok_or_else(|| io::Error::new(io::ErrorKind::InvalidInput, "proxy url has no port"))?;
        Ok((host.to_string(), port))
    }

    fn tls_config(&self) -> ClientConfig {
        let roots = match &self.tls_roots {
            Some(roots) => roots.clone(),
            None => {
                let mut roots = RootCertStore::empty();
                roots.extend(webpki_roots::TLS_SERVER_ROOTS.iter().cloned());
                roots
            }
        };
        ClientConfig::builder()
            .with_root_certificates(roots)
            .with_no_client_auth()
    }

    /// The proxy URL with userinfo removed, safe for diagnostics.
    fn scrubbed_url(&self) -> Url {
        let mut scrubbed = self.proxy_url.clone();
        let _ = scrubbed.set_username("");
        let _ = scrubbed.set_password(None);
        scrubbed
    }

    /// Issues the `CONNECT` and consumes the response head, leaving the
    /// connection positioned at the start of the tunnel.
    async fn setup_conn<S>(&self, conn: &mut S, address: &str) -> io::Result<()>
    where
        S: AsyncRead + AsyncWrite + Unpin,
    {
        let mut request = format!(
            "CONNECT //{address} HTTP/1.1\r\nHost: {address}\r\nProxy-Connection: Keep-Alive\r\n"
        );
        if !self.proxy_url.username().is_empty() || self.proxy_url.password().is_some() {
            let auth = format!(
                "{}:{}",
                self.proxy_url.username(),
                self.proxy_url.password().unwrap_or("")
            );
            request.push_str(&format!(
                "Proxy-Authorization: Basic {}\r\n",
                BASE64.encode(auth)
            ));
        }
        request.push_str("\r\n");
        conn.write_all(request.as_bytes()).await?;

        let mut buf = BytesMut::with_capacity(1024);
        loop {
            if conn.read_buf(&mut buf).await? == 0 {
                return Err(io::Error::new(
                    io::ErrorKind::UnexpectedEof,
                    "proxy closed the connection before responding",
                ));
            }

            let mut headers = [httparse::EMPTY_HEADER; 32];
            let mut response = httparse::Response::new(&mut headers);
            let status = response
                .parse(&buf[..])
                .map_err(|err| io::Error::new(io::ErrorKind::InvalidData, err))?;
            let consumed = match status {
                httparse::Status::Partial => continue,
                httparse::Status::Complete(consumed) => consumed,
            };

            let code = response.code.unwrap_or(0);
            if code != 200 {
                let body = String::from_utf8_lossy(&buf[consumed..]).into_owned();
                return Err(io::Error::other(format!(
                    "failed to connect to {} with status code {}: {}",
                    self.scrubbed_url(),
                    code,
                    body
                )));
            }
            return Ok(());
        }
    }
}

#[async_trait]
impl Dialer for HttpProxyDialer {
    async fn dial(&self, address: &str) -> io::Result<BoxedStream> {
        let (host, port) = self.proxy_addr()?;
        let stream = TcpStream::connect((host.as_str(), port)).await?;

        if self.proxy_url.scheme() == "https" {
            let connector = TlsConnector::from(Arc::new(self.tls_config()));
            let server_name = ServerName::try_from(host).map_err(|_| {
                io::Error::new(io::ErrorKind::InvalidInput, "proxy host is not a valid server name")
            })?;
            let mut stream = connector.connect(server_name, stream).await?;
            self.setup_conn(&mut stream, address).await?;
            Ok(Box::new(stream))
        } else {
            let mut stream = stream;
            self.setup_conn(&mut stream, address).await?;
            Ok(Box::new(stream))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::net::TcpListener;
    use tokio_rustls::rustls::pki_types::{PrivateKeyDer, PrivatePkcs8KeyDer};
    use tokio_rustls::rustls::ServerConfig;
    use tokio_rustls::TlsAcceptor;

    const TARGET: &str = "target.addr:1234";

    async fn read_head<S: AsyncRead + Unpin>(conn: &mut S) -> String {
        let mut head = Vec::new();
        let mut byte = [0u8; 1];
        while !head.ends_with(b"\r\n\r\n") {
            conn.read_exact(&mut byte).await.unwrap();
            head.push(byte[0]);
        }
        String::from_utf8(head).unwrap()
    }

    /// Mock proxy side of a successful tunnel: assert the request, answer
    /// 200, then serve one ping/pong through the tunnel.
    async fn serve_connect<S>(mut conn: S, expect_auth: Option<&str>)
    where
        S: AsyncRead + AsyncWrite + Unpin,
    {
        let head = read_head(&mut conn).await;
        assert!(
            head.starts_with("CONNECT //target.addr:1234 HTTP/1.1\r\n"),
            "unexpected request head: {head}"
        );
        assert!(head.contains("Proxy-Connection: Keep-Alive\r\n"));
        match expect_auth {
            Some(token) => {
                assert!(head.contains(&format!("Proxy-Authorization: Basic {token}\r\n")))
            }
            None => assert!(!head.contains("Proxy-Authorization")),
        }

        conn.write_all(b"HTTP/1.1 200 OK\r\n\r\n").await.unwrap();

        let mut ping = [0u8; 4];
        conn.read_exact(&mut ping).await.unwrap();
        assert_eq!(&ping, b"ping");
        conn.write_all(b"pong").await.unwrap();
    }

    async fn assert_tunnel_usable(mut tunnel: BoxedStream) {
        tunnel.write_all(b"ping").await.unwrap();
        let mut pong = [0u8; 4];
        tunnel.read_exact(&mut pong).await.unwrap();
        assert_eq!(&pong, b"pong");
    }

    #[tokio::test]
    async fn connects_through_a_plain_proxy_without_auth() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let proxy = tokio::spawn(async move {
            let (conn, _) = listener.accept().await.unwrap();
            serve_connect(conn, None).await;
        });

        let url = Url::parse(&format!("http://{addr}")).unwrap();
        let tunnel = HttpProxyDialer::new(url).dial(TARGET).await.unwrap();
        assert_tunnel_usable(tunnel).await;
        proxy.await.unwrap();
    }

    #[tokio::test]
    async fn connects_through_a_tls_proxy_with_basic_auth() {
        let issued = rcgen::generate_simple_self_signed(vec!["127.0.0.1".to_string()]).unwrap();
        let cert_der = issued.cert.der().clone();
        let key_der = PrivateKeyDer::Pkcs8(PrivatePkcs8KeyDer::from(issued.key_pair.serialize_der()));
        let server_config = ServerConfig::builder()
            .with_no_client_auth()
            .with_single_cert(vec![cert_der.clone()], key_der)
            .unwrap();
        let acceptor = TlsAcceptor::from(Arc::new(server_config));

        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let proxy = tokio::spawn(async move {
            let (conn, _) = listener.accept().await.unwrap();
            let conn = acceptor.accept(conn).await.unwrap();
            // base64("user:pw")
            serve_connect(conn, Some("dXNlcjpwdw==")).await;
        });

        let mut roots = RootCertStore::empty();
        roots.add(cert_der).unwrap();
        let url = Url::parse(&format!("https://user:pw@{addr}")).unwrap();
        let tunnel = HttpProxyDialer::with_tls_roots(url, roots)
            .dial(TARGET)
            .await
            .unwrap();
        assert_tunnel_usable(tunnel).await;
        proxy.await.unwrap();
    }

    #[tokio::test]
    async fn a_rejected_connect_reports_the_status_without_credentials() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let proxy = tokio::spawn(async move {
            let (mut conn, _) = listener.accept().await.unwrap();
            read_head(&mut conn).await;
            conn.write_all(b"HTTP/1.1 407 Proxy Authentication Required\r\n\r\n")
                .await
                .unwrap();
        });

        let url = Url::parse(&format!("http://user:pw@{addr}")).unwrap();
        let err = HttpProxyDialer::new(url).dial(TARGET).await.err().unwrap();
        let message = err.to_string();
        assert!(message.contains("407"), "missing status: {message}");
        assert!(!message.contains("user"), "credentials leaked: {message}");
        assert!(!message.contains("pw@"), "credentials leaked: {message}");
        proxy.await.unwrap();
    }
}
