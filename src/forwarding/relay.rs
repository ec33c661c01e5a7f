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

//! Bidirectional relay between an accepted connection and its counterpart.
//!
//! Bytes are copied both ways until both directions reach EOF. An EOF on
//! one side is propagated as a write shutdown to the other, so half-closed
//! exchanges complete. Cancellation of the owning tunnel ends the relay
//! immediately; both ends are shut down and dropped either way.

use std::io;
use std::time::{Duration, Instant};
use tokio::io::{copy_bidirectional, AsyncRead, AsyncWrite, AsyncWriteExt};
use tokio_util::sync::CancellationToken;
use tracing::trace;

/// Transfer statistics for one relayed connection.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct RelayStats {
    /// Bytes copied from the accepted connection to the dialed one.
    pub bytes_outbound: u64,
    /// Bytes copied from the dialed connection back to the client.
    pub bytes_inbound: u64,
    pub duration: Duration,
    /// The relay was interrupted by tunnel shutdown.
    pub cancelled: bool,
}

impl RelayStats {
    pub fn total_bytes(&self) -> u64 {
        self.bytes_outbound + self.bytes_inbound
    }
}

/// Copy between `client` and `target` until both sides are done.
pub async fn relay<A, B>(
    mut client: A,
    mut target: B,
    cancel: &CancellationToken,
) -> io::Result<RelayStats>
where
    A: AsyncRead + AsyncWrite + Unpin,
    B: AsyncRead + AsyncWrite + Unpin,
{
    let started = Instant::now();

    let result = tokio::select! {
        result = copy_bidirectional(&mut client, &mut target) => Some(result),
        _ = cancel.cancelled() => None,
    };

    let _ = client.shutdown().await;
    let _ = target.shutdown().await;

    match result {
        Some(Ok((bytes_outbound, bytes_inbound))) => Ok(RelayStats {
            bytes_outbound,
            bytes_inbound,
            duration: started.elapsed(),
            cancelled: false,
        }),
        Some(Err(e)) => match e.kind() {
            // Peers resetting the connection is how many of them say goodbye.
            io::ErrorKind::ConnectionReset
            | io::ErrorKind::ConnectionAborted
            | io::ErrorKind::BrokenPipe => {
                trace!("Relay ended by peer: {}", e);
                Ok(RelayStats {
                    duration: started.elapsed(),
                    ..Default::default()
                })
            }
            _ => Err(e),
        },
        None => {
            trace!("Relay cancelled");
            Ok(RelayStats {
                duration: started.elapsed(),
                cancelled: true,
                ..Default::default()
            })
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::{duplex, AsyncReadExt};

    #[tokio::test]
    async fn test_relay_copies_both_ways() {
        let (client, mut client_peer) = duplex(1024);
        let (target, mut target_peer) = duplex(1024);
        let cancel = CancellationToken::new();

        let relay_task = tokio::spawn(async move { relay(client, target, &cancel).await });

        client_peer.write_all(b"ping").await.unwrap();
        let mut buf = [0u8; 4];
        target_peer.read_exact(&mut buf).await.unwrap();
        assert_eq!(&buf, b"ping");

        target_peer.write_all(b"pong!").await.unwrap();
        let mut buf = [0u8; 5];
        client_peer.read_exact(&mut buf).await.unwrap();
        assert_eq!(&buf, b"pong!");

        // Client EOF reaches the target, which then closes its side.
        client_peer.shutdown().await.unwrap();
        let mut rest = Vec::new();
        target_peer.read_to_end(&mut rest).await.unwrap();
        assert!(rest.is_empty());
        drop(target_peer);

        let stats = relay_task.await.unwrap().unwrap();
        assert_eq!(stats.bytes_outbound, 4);
        assert_eq!(stats.bytes_inbound, 5);
        assert_eq!(stats.total_bytes(), 9);
        assert!(!stats.cancelled);
    }

    #[tokio::test]
    async fn test_relay_cancel() {
        let (client, _client_peer) = duplex(64);
        let (target, _target_peer) = duplex(64);
        let cancel = CancellationToken::new();

        let task = {
            let cancel = cancel.clone();
            tokio::spawn(async move { relay(client, target, &cancel).await })
        };
        cancel.cancel();

        let stats = task.await.unwrap().unwrap();
        assert!(stats.cancelled);
    }
}
