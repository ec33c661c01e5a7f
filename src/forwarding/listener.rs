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

//! Local TCP listener for local and dynamic forwards.

use async_trait::async_trait;
use std::future::poll_fn;
use std::io;
use std::net::SocketAddr;
use std::sync::Mutex;
use std::task::Poll;
use tokio::net::TcpListener;
use tokio_util::sync::CancellationToken;
use tracing::debug;

use super::split_host_port;
use crate::ssh::transport::{listener_closed, BoxedStream, ForwardListener};

/// A bound local socket. [`close`](ForwardListener::close) drops the socket
/// right away, so the port can be rebound as soon as it returns.
pub struct TcpForwardListener {
    socket: Mutex<Option<TcpListener>>,
    local_addr: SocketAddr,
    closed: CancellationToken,
}

impl TcpForwardListener {
    /// Bind `addr` (`host:port`; an empty host means all interfaces).
    pub async fn bind(addr: &str) -> io::Result<Self> {
        let (host, port) =
            split_host_port(addr).map_err(|e| io::Error::new(io::ErrorKind::InvalidInput, e))?;
        let host = if host.is_empty() { "0.0.0.0" } else { host.as_str() };

        let listener = TcpListener::bind((host, port)).await.map_err(|e| {
            io::Error::new(e.kind(), format!("failed to bind {addr}: {e}"))
        })?;
        let local_addr = listener.local_addr()?;
        debug!("Listening on {}", local_addr);

        Ok(Self {
            socket: Mutex::new(Some(listener)),
            local_addr,
            closed: CancellationToken::new(),
        })
    }

    pub fn socket_addr(&self) -> SocketAddr {
        self.local_addr
    }

    async fn accept_socket(&self) -> io::Result<(tokio::net::TcpStream, SocketAddr)> {
        poll_fn(|cx| match self.socket.lock() {
            Ok(guard) => match guard.as_ref() {
                Some(listener) => listener.poll_accept(cx),
                None => Poll::Ready(Err(listener_closed())),
            },
            Err(_) => Poll::Ready(Err(listener_closed())),
        })
        .await
    }
}

#[async_trait]
impl ForwardListener for TcpForwardListener {
    async fn accept(&self) -> io::Result<(BoxedStream, String)> {
        tokio::select! {
            result = self.accept_socket() => {
                let (stream, peer) = result?;
                let _ = stream.set_nodelay(true);
                Ok((Box::new(stream) as BoxedStream, peer.to_string()))
            }
            _ = self.closed.cancelled() => Err(listener_closed()),
        }
    }

    async fn close(&self) {
        self.closed.cancel();
        let socket = match self.socket.lock() {
            Ok(mut guard) => guard.take(),
            Err(poisoned) => poisoned.into_inner().take(),
        };
        if socket.is_some() {
            debug!("Closed listener on {}", self.local_addr);
        }
    }

    fn is_closed(&self) -> bool {
        self.closed.is_cancelled()
    }

    fn local_addr(&self) -> String {
        self.local_addr.to_string()
    }
}
