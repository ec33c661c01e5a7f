// Copyright 2025 Lablup Inc. and Jeongkyu Shin
//
// Licensed under the Apache License, Version 2.0 (the "License");
// you may not use this file except in compliance with the License.
// You may obtain a copy of the License at
//
//     http://www.apache.org/licenses/LICENSE-2.0
//
// Unless required by applicable law or agreed to in writing, software
// distributed under the License is distributed on an "AS IS" BASIS,
// WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
// See the License for the specific language governing permissions and
// limitations under the License.

//! SOCKS5 handshake (RFC 1928), "no authentication" method and the CONNECT
//! command only.
//!
//! The parsers work on a growing byte buffer and report
//! [`Parsed::Incomplete`] until a whole message is present, so a message
//! split across TCP segments and a client that pipelines the greeting with
//! its request are both handled.

use std::fmt;
use std::io;
use std::net::Ipv4Addr;
use thiserror::Error;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

pub const SOCKS_VERSION: u8 = 0x05;
const METHOD_NO_AUTH: u8 = 0x00;
const CMD_CONNECT: u8 = 0x01;
const ATYP_IPV4: u8 = 0x01;
const ATYP_DOMAIN: u8 = 0x03;

/// `05 00 00 01` + zeroed BND.ADDR / BND.PORT.
pub const REPLY_SUCCEEDED: [u8; 10] = [0x05, 0x00, 0x00, 0x01, 0, 0, 0, 0, 0, 0];
/// General SOCKS server failure.
pub const REPLY_GENERAL_FAILURE: [u8; 10] = [0x05, 0x01, 0x00, 0x01, 0, 0, 0, 0, 0, 0];
/// Address type not supported.
pub const REPLY_ADDRESS_NOT_SUPPORTED: [u8; 10] = [0x05, 0x08, 0x00, 0x01, 0, 0, 0, 0, 0, 0];

/// Largest message either parser can need: a request with a 255-byte name.
const MAX_MESSAGE: usize = 4 + 1 + 255 + 2;

/// Destination requested by the client.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TargetAddr {
    Ipv4(Ipv4Addr, u16),
    Domain(String, u16),
}

impl TargetAddr {
    pub fn host(&self) -> String {
        match self {
            TargetAddr::Ipv4(ip, _) => ip.to_string(),
            TargetAddr::Domain(name, _) => name.clone(),
        }
    }

    pub fn port(&self) -> u16 {
        match self {
            TargetAddr::Ipv4(_, port) | TargetAddr::Domain(_, port) => *port,
        }
    }
}

impl fmt::Display for TargetAddr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TargetAddr::Ipv4(ip, port) => write!(f, "{ip}:{port}"),
            TargetAddr::Domain(name, port) => write!(f, "{name}:{port}"),
        }
    }
}

/// Result of feeding a buffer to a parser.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Parsed<T> {
    /// A whole message was decoded from the first `consumed` bytes.
    Complete { value: T, consumed: usize },
    /// More bytes are needed.
    Incomplete,
}

/// Handshake failures. All of them end the connection; only
/// [`SocksError::AddressType`] is answered with a reply.
#[derive(Debug, Error)]
pub enum SocksError {
    #[error("unsupported SOCKS version {0:#04x}")]
    Version(u8),

    #[error("unsupported command {0:#04x}")]
    Command(u8),

    #[error("unsupported address type {0:#04x}")]
    AddressType(u8),

    #[error("empty domain name")]
    EmptyDomain,

    #[error("domain name is not valid UTF-8")]
    InvalidDomain,

    #[error("client closed the connection mid-handshake")]
    Truncated,

    #[error(transparent)]
    Io(#[from] io::Error),
}

/// Parse the method-selection greeting: VER, NMETHODS, METHODS.
///
/// The offered methods are not inspected. A greeting is at least three
/// bytes long, so one announcing zero methods still carries a padding byte.
pub fn parse_greeting(buf: &[u8]) -> Result<Parsed<()>, SocksError> {
    let Some(&version) = buf.first() else {
        return Ok(Parsed::Incomplete);
    };
    if version != SOCKS_VERSION {
        return Err(SocksError::Version(version));
    }
    let Some(&nmethods) = buf.get(1) else {
        return Ok(Parsed::Incomplete);
    };
    let total = (2 + nmethods as usize).max(3);
    if buf.len() < total {
        return Ok(Parsed::Incomplete);
    }
    Ok(Parsed::Complete {
        value: (),
        consumed: total,
    })
}

/// Parse a request: VER, CMD, RSV, ATYP, DST.ADDR, DST.PORT.
///
/// Errors are reported as soon as the offending byte is available.
pub fn parse_request(buf: &[u8]) -> Result<Parsed<TargetAddr>, SocksError> {
    if let Some(&version) = buf.first() {
        if version != SOCKS_VERSION {
            return Err(SocksError::Version(version));
        }
    }
    if let Some(&command) = buf.get(1) {
        if command != CMD_CONNECT {
            return Err(SocksError::Command(command));
        }
    }
    let Some(&atyp) = buf.get(3) else {
        return Ok(Parsed::Incomplete);
    };

    match atyp {
        ATYP_IPV4 => {
            let Some(body) = buf.get(4..10) else {
                return Ok(Parsed::Incomplete);
            };
            let ip = Ipv4Addr::new(body[0], body[1], body[2], body[3]);
            let port = u16::from_be_bytes([body[4], body[5]]);
            Ok(Parsed::Complete {
                value: TargetAddr::Ipv4(ip, port),
                consumed: 10,
            })
        }
        ATYP_DOMAIN => {
            let Some(&len) = buf.get(4) else {
                return Ok(Parsed::Incomplete);
            };
            if len == 0 {
                return Err(SocksError::EmptyDomain);
            }
            let end = 5 + len as usize;
            let Some(name) = buf.get(5..end) else {
                return Ok(Parsed::Incomplete);
            };
            let Some(port) = buf.get(end..end + 2) else {
                return Ok(Parsed::Incomplete);
            };
            let name = std::str::from_utf8(name).map_err(|_| SocksError::InvalidDomain)?;
            Ok(Parsed::Complete {
                value: TargetAddr::Domain(name.to_string(), u16::from_be_bytes([port[0], port[1]])),
                consumed: end + 2,
            })
        }
        other => Err(SocksError::AddressType(other)),
    }
}

/// Read from `stream` until `parse` completes, consuming the parsed bytes
/// from `buf`.
async fn read_message<S, T>(
    stream: &mut S,
    buf: &mut Vec<u8>,
    parse: fn(&[u8]) -> Result<Parsed<T>, SocksError>,
) -> Result<T, SocksError>
where
    S: AsyncRead + Unpin,
{
    loop {
        if let Parsed::Complete { value, consumed } = parse(buf)? {
            buf.drain(..consumed);
            return Ok(value);
        }
        if buf.len() >= MAX_MESSAGE {
            return Err(SocksError::Truncated);
        }
        let mut chunk = [0u8; 512];
        let n = stream.read(&mut chunk).await?;
        if n == 0 {
            return Err(SocksError::Truncated);
        }
        buf.extend_from_slice(&chunk[..n]);
    }
}

/// Run the client side of the negotiation up to (not including) the reply
/// to the request.
///
/// Returns the requested target and any bytes the client already sent past
/// the request, which belong to the relayed stream. An unsupported address
/// type is answered with `05 08` before the error is returned; every other
/// failure is silent.
pub async fn negotiate<S>(stream: &mut S) -> Result<(TargetAddr, Vec<u8>), SocksError>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    let mut buf = Vec::with_capacity(64);

    read_message(stream, &mut buf, parse_greeting).await?;
    // Whatever the client offered, we pick "no authentication".
    stream.write_all(&[SOCKS_VERSION, METHOD_NO_AUTH]).await?;
    stream.flush().await?;

    match read_message(stream, &mut buf, parse_request).await {
        Ok(target) => Ok((target, buf)),
        Err(SocksError::AddressType(atyp)) => {
            stream.write_all(&REPLY_ADDRESS_NOT_SUPPORTED).await?;
            stream.flush().await?;
            Err(SocksError::AddressType(atyp))
        }
        Err(e) => Err(e),
    }
}
