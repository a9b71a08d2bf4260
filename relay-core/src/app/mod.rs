pub mod forward;
pub mod sniff_http;
pub mod sniff_tls;
