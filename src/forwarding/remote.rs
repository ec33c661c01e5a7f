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

//! Remote port forwarding (-R).
//!
//! The SSH server listens on our behalf (`tcpip-forward`) and hands each
//! accepted connection back as a `forwarded-tcpip` channel. We dial the
//! configured local target over plain TCP, not through the session.

use tokio::net::TcpStream;
use tokio::time::timeout;
use tracing::{debug, warn};

use super::relay::relay;
use super::ForwardContext;
use crate::ssh::BoxedStream;

/// Relay one server-forwarded connection to the local `host:port`.
pub async fn handle_connection(
    channel: BoxedStream,
    peer: String,
    host: String,
    port: u16,
    ctx: ForwardContext,
) {
    let target = match timeout(ctx.dial_timeout, TcpStream::connect((host.as_str(), port))).await
    {
        Ok(Ok(target)) => target,
        Ok(Err(e)) => {
            warn!(
                "[{}] Failed to connect to {}:{} for forwarded connection from {}: {}",
                ctx.tunnel, host, port, peer, e
            );
            return;
        }
        Err(_) => {
            warn!(
                "[{}] Timed out connecting to {}:{} for forwarded connection from {}",
                ctx.tunnel, host, port, peer
            );
            return;
        }
    };
    let _ = target.set_nodelay(true);

    debug!("[{}] Forwarding remote {} -> {}:{}", ctx.tunnel, peer, host, port);
    match relay(channel, target, &ctx.cancel).await {
        Ok(stats) => debug!(
            "[{}] Remote connection {} -> {}:{} closed ({} bytes to {}:{}, {} bytes back, {:?})",
            ctx.tunnel,
            peer,
            host,
            port,
            stats.bytes_outbound,
            host,
            port,
            stats.bytes_inbound,
            stats.duration
        ),
        Err(e) => debug!(
            "[{}] Remote relay {} -> {}:{} failed: {}",
            ctx.tunnel, peer, host, port, e
        ),
    }
}
