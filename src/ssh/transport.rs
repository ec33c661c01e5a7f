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

//! The session interface the forwarding engine is written against.
//!
//! A [`Transport`] is one authenticated, multiplexed connection to an SSH
//! server. It can open outbound data channels (`direct-tcpip`), ask the
//! server to listen on its side (`tcpip-forward`), and answer liveness
//! probes. The production implementation lives in
//! [`tokio_client`](super::tokio_client); tests substitute an in-memory one.

use async_trait::async_trait;
use std::io;
use std::sync::Arc;
use tokio::io::{AsyncRead, AsyncWrite};

/// Any bidirectional byte stream: TCP sockets, SSH channels, TLS streams.
pub trait ByteStream: AsyncRead + AsyncWrite + Unpin + Send {}

impl<T> ByteStream for T where T: AsyncRead + AsyncWrite + Unpin + Send {}

/// Owned, type-erased byte stream.
pub type BoxedStream = Box<dyn ByteStream>;

/// A transport shared between tunnels through the connection pool.
pub type SharedTransport = Arc<dyn Transport>;

/// An authenticated SSH session.
#[async_trait]
pub trait Transport: Send + Sync {
    /// Open an outbound channel to `host:port`, dialed by the server.
    async fn open_direct(&self, host: &str, port: u16) -> io::Result<BoxedStream>;

    /// Ask the server to listen on `host:port` and hand over the
    /// connections it accepts.
    async fn listen_remote(&self, host: &str, port: u16) -> io::Result<Box<dyn ForwardListener>>;

    /// Cheap round trip proving the session is still alive.
    async fn probe(&self) -> io::Result<()>;

    /// Tear the session down. Calling it more than once is harmless.
    async fn close(&self);

    fn is_closed(&self) -> bool;
}

/// Source of inbound connections for one forward, local or server-side.
#[async_trait]
pub trait ForwardListener: Send + Sync {
    /// Wait for the next connection. Returns the stream and a printable
    /// description of the peer. After [`close`](Self::close) every call
    /// fails with [`io::ErrorKind::NotConnected`].
    async fn accept(&self) -> io::Result<(BoxedStream, String)>;

    /// Stop accepting and release the bound address.
    async fn close(&self);

    fn is_closed(&self) -> bool;

    /// The address actually bound, for logs and for port-0 binds.
    fn local_addr(&self) -> String;
}

/// Error returned by listeners that have been closed.
pub fn listener_closed() -> io::Error {
    io::Error::new(io::ErrorKind::NotConnected, "listener closed")
}
