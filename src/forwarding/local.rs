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

//! Local port forwarding (-L).
//!
//! Each connection accepted on the local listener gets its own
//! `direct-tcpip` channel to the configured target; the server does the
//! actual dialing.

use tracing::{debug, warn};

use super::relay::relay;
use super::ForwardContext;
use crate::ssh::BoxedStream;

/// Relay one accepted connection to `host:port` through the SSH session.
///
/// A failed channel open only abandons this connection.
pub async fn handle_connection(
    stream: BoxedStream,
    peer: String,
    host: String,
    port: u16,
    ctx: ForwardContext,
) {
    let channel = match ctx.transport.open_direct(&host, port).await {
        Ok(channel) => channel,
        Err(e) => {
            warn!(
                "[{}] Failed to open channel to {}:{} for {}: {}",
                ctx.tunnel, host, port, peer, e
            );
            return;
        }
    };

    debug!("[{}] Forwarding {} -> {}:{}", ctx.tunnel, peer, host, port);
    match relay(stream, channel, &ctx.cancel).await {
        Ok(stats) => debug!(
            "[{}] Connection {} -> {}:{} closed ({} bytes out, {} bytes in, {:?})",
            ctx.tunnel,
            peer,
            host,
            port,
            stats.bytes_outbound,
            stats.bytes_inbound,
            stats.duration
        ),
        Err(e) => debug!(
            "[{}] Relay {} -> {}:{} failed: {}",
            ctx.tunnel, peer, host, port, e
        ),
    }
}
