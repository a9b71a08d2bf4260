//! HTTP request-head sniffer: reads an HTTP/1.x head and returns the target
//! host so the connection can be forwarded there.

use std::io;

use bytes::BytesMut;
use tokio::io::{AsyncRead, AsyncReadExt};

/// Heads larger than this are rejected rather than buffered indefinitely.
const MAX_HEAD_LEN: usize = 8 * 1024;

enum Head {
    Complete(Option<String>),
    Partial,
}

/// Parses an HTTP/1.x request head from `src` and returns the `Host` header
/// value, without any explicit port: forwarding always targets the locally
/// reached port. Falls back to the authority of an absolute-form request
/// target; an empty string means the head named no host at all.
pub async fn sniff_http_host<R>(src: &mut R) -> io::Result<String>
where
    R: AsyncRead + Unpin,
{
    let mut buf = BytesMut::with_capacity(1024);
    loop {
        match parse_head(&buf[..])? {
            Head::Complete(host) => return Ok(host.unwrap_or_default()),
            Head::Partial => {
                if buf.len() >= MAX_HEAD_LEN {
                    return Err(io::Error::new(
                        io::ErrorKind::InvalidData,
                        "http request head too large",
                    ));
                }
                if src.read_buf(&mut buf).await? == 0 {
                    return Err(io::ErrorKind::UnexpectedEof.into());
                }
            }
        }
    }
}

fn parse_head(buf: &[u8]) -> io::Result<Head> {
    let mut headers = [httparse::EMPTY_HEADER; 64];
    let mut request = httparse::Request::new(&mut headers);
    let status = request
        .parse(buf)
        .map_err(|err| io::Error::new(io::ErrorKind::InvalidData, err))?;

    if status.is_partial() {
        return Ok(Head::Partial);
    }

    for header in request.headers.iter() {
        if header.name.eq_ignore_ascii_case("host") {
            let value = std::str::from_utf8(header.value)
                .map_err(|_| io::Error::new(io::ErrorKind::InvalidData, "host header is not valid utf-8"))?;
            return Ok(Head::Complete(Some(strip_port(value.trim()).to_string())));
        }
    }

    let authority = request
        .path
        .and_then(authority_from_target)
        .map(str::to_string);
    Ok(Head::Complete(authority))
}

fn strip_port(host: &str) -> &str {
    match host.rfind(':') {
        Some(idx) if host[idx + 1..].parse::<u16>().is_ok() => &host[..idx],
        _ => host,
    }
}

fn authority_from_target(target: &str) -> Option<&str> {
    let rest = target
        .strip_prefix("http://")
        .or_else(|| target.strip_prefix("https://"))?;
    let end = rest.find('/').unwrap_or(rest.len());
    let authority = &rest[..end];
    if authority.is_empty() {
        None
    } else {
        Some(strip_port(authority))
    }
}
