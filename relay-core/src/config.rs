//! Environment-driven configuration. The relay has no config file and no
//! command-line flags; everything is read from the environment once at
//! startup. The upstream proxy (`ALL_PROXY`) is resolved separately by the
//! dialer registry.

use std::env;

const DEFAULT_HTTP_LISTEN: &str = "0.0.0.0:80";
const DEFAULT_TLS_LISTEN: &str = "0.0.0.0:443";

#[derive(Debug, Clone)]
pub struct Settings {
    /// Listen address for the HTTP Host sniffing listener.
    pub http_listen: String,
    /// Listen address for the TLS SNI sniffing listener.
    pub tls_listen: String,
}

impl Settings {
    pub fn from_env() -> Self {
        Self::from_vars(
            env::var("RELAY_HTTP_LISTEN").ok(),
            env::var("RELAY_TLS_LISTEN").ok(),
        )
    }

    fn from_vars(http_listen: Option<String>, tls_listen: Option<String>) -> Self {
        Settings {
            http_listen: http_listen.unwrap_or_else(|| DEFAULT_HTTP_LISTEN.to_string()),
            tls_listen: tls_listen.unwrap_or_else(|| DEFAULT_TLS_LISTEN.to_string()),
        }
    }
}
