//! # TLS SNI Sniffer
//!
//! Streams through the TLS record layer to the first ClientHello and pulls
//! the server name out of the SNI extension, reading as little as necessary.
//! Non-handshake records ahead of the hello are skipped; a ClientHello
//! fragmented across several handshake records is reassembled.

use std::io;

use bytes::{Buf, BytesMut};
use tokio::io::{AsyncRead, AsyncReadExt};

const CONTENT_TYPE_HANDSHAKE: u8 = 0x16;
const MSG_TYPE_CLIENT_HELLO: u8 = 1;
const EXT_SERVER_NAME: u16 = 0;
const NAME_TYPE_HOST: u8 = 0;

/// RFC 5246: record payloads may not exceed 2^14 plus 2048 bytes of expansion.
const MAX_RECORD_LEN: usize = (1 << 14) + 2048;

/// Returns the host name announced in the first ClientHello's SNI extension,
/// or an empty string when the hello carries no SNI.
pub async fn sniff_tls_server_name<R>(src: &mut R) -> io::Result<String>
where
    R: AsyncRead + Unpin,
{
    let hello = read_client_hello(src).await?;
    server_name_from_client_hello(&hello)
}

/// Reads records until a complete ClientHello handshake message is available
/// and returns its body.
async fn read_client_hello<R>(src: &mut R) -> io::Result<Vec<u8>>
where
    R: AsyncRead + Unpin,
{
    // Handshake-layer bytes, concatenated across records: a single message
    // may span several records and a single record may hold several messages.
    let mut handshake = BytesMut::new();
    loop {
        while handshake.len() >= 4 {
            let msg_len = ((handshake[1] as usize) << 16)
                | ((handshake[2] as usize) << 8)
                | handshake[3] as usize;
            if handshake.len() < 4 + msg_len {
                break; // the message continues in the next record
            }
            if handshake[0] == MSG_TYPE_CLIENT_HELLO {
                return Ok(handshake[4..4 + msg_len].to_vec());
            }
            handshake.advance(4 + msg_len);
        }
        let record = next_handshake_record(src).await?;
        handshake.extend_from_slice(&record);
    }
}

/// Yields the payload of the next handshake record, skipping records of any
/// other content type (e.g. a stray ChangeCipherSpec).
async fn next_handshake_record<R>(src: &mut R) -> io::Result<Vec<u8>>
where
    R: AsyncRead + Unpin,
{
    loop {
        let mut header = [0u8; 5];
        src.read_exact(&mut header).await?;

        let len = u16::from_be_bytes([header[3], header[4]]) as usize;
        if len > MAX_RECORD_LEN {
            return Err(malformed("record length exceeds the protocol maximum"));
        }

        if header[0] != CONTENT_TYPE_HANDSHAKE {
            let mut limited = (&mut *src).take(len as u64);
            let skipped = tokio::io::copy(&mut limited, &mut tokio::io::sink()).await?;
            if skipped < len as u64 {
                return Err(io::Error::new(
                    io::ErrorKind::UnexpectedEof,
                    "record truncated",
                ));
            }
            continue;
        }

        let mut payload = vec![0u8; len];
        src.read_exact(&mut payload).await?;
        return Ok(payload);
    }
}

fn malformed(what: &str) -> io::Error {
    io::Error::new(io::ErrorKind::InvalidData, format!("malformed client hello: {what}"))
}

/// Bounds-checked positional view over a length-framed byte slice.
struct View<'a> {
    rest: &'a [u8],
}

impl<'a> View<'a> {
    fn new(rest: &'a [u8]) -> Self {
        View { rest }
    }

    fn is_empty(&self) -> bool {
        self.rest.is_empty()
    }

    fn read_u8(&mut self) -> io::Result<u8> {
        Ok(self.read_bytes(1)?[0])
    }

    fn read_u16(&mut self) -> io::Result<u16> {
        let b = self.read_bytes(2)?;
        Ok(u16::from_be_bytes([b[0], b[1]]))
    }

    fn read_bytes(&mut self, n: usize) -> io::Result<&'a [u8]> {
        if self.rest.len() < n {
            return Err(malformed("length overruns its container"));
        }
        let (head, tail) = self.rest.split_at(n);
        self.rest = tail;
        Ok(head)
    }

    fn read_u8_framed(&mut self) -> io::Result<&'a [u8]> {
        let n = self.read_u8()? as usize;
        self.read_bytes(n)
    }

    fn read_u16_framed(&mut self) -> io::Result<&'a [u8]> {
        let n = self.read_u16()? as usize;
        self.read_bytes(n)
    }
}

fn server_name_from_client_hello(hello: &[u8]) -> io::Result<String> {
    let mut body = View::new(hello);
    body.read_u16()?; // legacy version
    body.read_bytes(32)?; // client random
    body.read_u8_framed()?; // session id
    body.read_u16_framed()?; // cipher suites
    body.read_u8_framed()?; // compression methods

    if body.is_empty() {
        // pre-extensions hello
        return Ok(String::new());
    }

    let mut extensions = View::new(body.read_u16_framed()?);
    while !extensions.is_empty() {
        let ext_type = extensions.read_u16()?;
        let ext_data = extensions.read_u16_framed()?;
        if ext_type != EXT_SERVER_NAME {
            continue;
        }

        // RFC 6066, section 3
        let mut ext = View::new(ext_data);
        let mut names = View::new(ext.read_u16_framed()?);
        while !names.is_empty() {
            let name_type = names.read_u8()?;
            let name = names.read_u16_framed()?;
            if name_type != NAME_TYPE_HOST {
                continue;
            }
            return String::from_utf8(name.to_vec())
                .map_err(|_| malformed("server name is not valid utf-8"));
        }
    }

    Ok(String::new())
}
