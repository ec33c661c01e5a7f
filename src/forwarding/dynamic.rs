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

//! Dynamic port forwarding (-D): a local SOCKS5 proxy whose connections
//! are dialed through the SSH session.

pub mod socks;

use tokio::io::AsyncWriteExt;
use tokio::time::timeout;
use tracing::{debug, warn};

use self::socks::{negotiate, SocksError, TargetAddr, REPLY_GENERAL_FAILURE, REPLY_SUCCEEDED};
use super::relay::relay;
use super::ForwardContext;
use crate::ssh::{BoxedStream, Transport};

/// Serve one SOCKS5 client: handshake, dial, reply, relay.
pub async fn handle_connection(mut client: BoxedStream, peer: String, ctx: ForwardContext) {
    let negotiated = match timeout(ctx.socks_handshake_timeout, negotiate(&mut client)).await {
        Ok(result) => result,
        Err(_) => {
            debug!("[{}] SOCKS5 handshake from {} timed out", ctx.tunnel, peer);
            return;
        }
    };
    let (target, pending) = match negotiated {
        Ok(negotiated) => negotiated,
        Err(e) => {
            // Client-side protocol errors are not tunnel faults.
            debug!("[{}] SOCKS5 handshake from {} failed: {}", ctx.tunnel, peer, e);
            return;
        }
    };

    let upstream = match connect_target(&mut client, ctx.transport.as_ref(), &target, &pending).await
    {
        Ok(upstream) => upstream,
        Err(e) => {
            warn!(
                "[{}] SOCKS5 CONNECT {} for {} failed: {}",
                ctx.tunnel, target, peer, e
            );
            return;
        }
    };

    debug!("[{}] SOCKS5 {} -> {} established", ctx.tunnel, peer, target);
    match relay(client, upstream, &ctx.cancel).await {
        Ok(stats) => debug!(
            "[{}] SOCKS5 {} -> {} closed ({} bytes out, {} bytes in, {:?})",
            ctx.tunnel, peer, target, stats.bytes_outbound, stats.bytes_inbound, stats.duration
        ),
        Err(e) => debug!("[{}] SOCKS5 relay {} -> {} failed: {}", ctx.tunnel, peer, target, e),
    }
}

/// Dial `target` through the transport and send the matching reply.
/// Bytes the client pipelined after its request are forwarded first.
async fn connect_target(
    client: &mut BoxedStream,
    transport: &dyn Transport,
    target: &TargetAddr,
    pending: &[u8],
) -> Result<BoxedStream, SocksError> {
    let mut upstream = match transport.open_direct(&target.host(), target.port()).await {
        Ok(upstream) => upstream,
        Err(e) => {
            let _ = client.write_all(&REPLY_GENERAL_FAILURE).await;
            let _ = client.shutdown().await;
            return Err(e.into());
        }
    };

    client.write_all(&REPLY_SUCCEEDED).await?;
    client.flush().await?;
    if !pending.is_empty() {
        upstream.write_all(pending).await?;
    }
    Ok(upstream)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::forwarding::StopFlag;
    use crate::ssh::{ForwardListener, SharedTransport};
    use async_trait::async_trait;
    use std::io;
    use std::sync::{Arc, Mutex};
    use std::time::Duration;
    use tokio::io::{duplex, AsyncReadExt, DuplexStream};
    use tokio_util::sync::CancellationToken;
    use tokio_util::task::TaskTracker;

    /// Records dial targets; refuses port 1, otherwise echoes.
    #[derive(Default)]
    struct RecordingTransport {
        dials: Mutex<Vec<String>>,
    }

    #[async_trait]
    impl Transport for RecordingTransport {
        async fn open_direct(&self, host: &str, port: u16) -> io::Result<BoxedStream> {
            self.dials.lock().unwrap().push(format!("{host}:{port}"));
            if port == 1 {
                return Err(io::Error::new(io::ErrorKind::ConnectionRefused, "refused"));
            }
            let (ours, mut theirs) = duplex(1024);
            tokio::spawn(async move {
                let mut buf = [0u8; 1024];
                while let Ok(n) = theirs.read(&mut buf).await {
                    if n == 0 || theirs.write_all(&buf[..n]).await.is_err() {
                        break;
                    }
                }
            });
            Ok(Box::new(ours))
        }

        async fn listen_remote(
            &self,
            _host: &str,
            _port: u16,
        ) -> io::Result<Box<dyn ForwardListener>> {
            Err(io::Error::other("unsupported"))
        }

        async fn probe(&self) -> io::Result<()> {
            Ok(())
        }

        async fn close(&self) {}

        fn is_closed(&self) -> bool {
            false
        }
    }

    struct NeverStopping;

    impl StopFlag for NeverStopping {
        fn is_stopping(&self) -> bool {
            false
        }
    }

    fn context(transport: Arc<RecordingTransport>) -> ForwardContext {
        ForwardContext {
            tunnel: Arc::from("socks-test"),
            transport: transport as SharedTransport,
            cancel: CancellationToken::new(),
            connections: TaskTracker::new(),
            stop: Arc::new(NeverStopping),
            socks_handshake_timeout: Duration::from_secs(10),
            dial_timeout: Duration::from_secs(5),
        }
    }

    fn serve(transport: &Arc<RecordingTransport>) -> DuplexStream {
        let (client, server) = duplex(1024);
        let ctx = context(transport.clone());
        tokio::spawn(handle_connection(Box::new(server), "test-peer".to_string(), ctx));
        client
    }

    #[tokio::test]
    async fn test_ipv4_connect_dials_target() {
        let transport = Arc::new(RecordingTransport::default());
        let mut client = serve(&transport);

        client.write_all(&[5, 1, 0]).await.unwrap();
        let mut reply = [0u8; 2];
        client.read_exact(&mut reply).await.unwrap();
        assert_eq!(reply, [5, 0]);

        client
            .write_all(&[5, 1, 0, 1, 0x7f, 0, 0, 1, 0, 0x50])
            .await
            .unwrap();
        let mut reply = [0u8; 10];
        client.read_exact(&mut reply).await.unwrap();
        assert_eq!(reply, REPLY_SUCCEEDED);
        assert_eq!(*transport.dials.lock().unwrap(), vec!["127.0.0.1:80"]);

        // Relay mode: the echo target answers.
        client.write_all(b"hello").await.unwrap();
        let mut echoed = [0u8; 5];
        client.read_exact(&mut echoed).await.unwrap();
        assert_eq!(&echoed, b"hello");
    }

    #[tokio::test]
    async fn test_ipv6_rejected_without_dial() {
        let transport = Arc::new(RecordingTransport::default());
        let mut client = serve(&transport);

        client.write_all(&[5, 1, 0]).await.unwrap();
        let mut request = vec![5, 1, 0, 4];
        request.extend_from_slice(&[0u8; 18]);
        client.write_all(&request).await.unwrap();

        let mut replies = Vec::new();
        client.read_to_end(&mut replies).await.unwrap();
        assert_eq!(replies, [5, 0, 5, 8, 0, 1, 0, 0, 0, 0, 0, 0]);
        assert!(transport.dials.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_dial_failure_replies_general_failure() {
        let transport = Arc::new(RecordingTransport::default());
        let mut client = serve(&transport);

        client.write_all(&[5, 1, 0]).await.unwrap();
        let mut request = vec![5, 1, 0, 3, 9];
        request.extend_from_slice(b"localhost");
        request.extend_from_slice(&1u16.to_be_bytes());
        client.write_all(&request).await.unwrap();

        let mut replies = Vec::new();
        client.read_to_end(&mut replies).await.unwrap();
        assert_eq!(replies[..2], [5, 0]);
        assert_eq!(replies[2..], REPLY_GENERAL_FAILURE);
        assert_eq!(*transport.dials.lock().unwrap(), vec!["localhost:1"]);
    }

    #[tokio::test]
    async fn test_truncated_domain_never_dials() {
        let transport = Arc::new(RecordingTransport::default());
        let mut client = serve(&transport);

        client.write_all(&[5, 1, 0]).await.unwrap();
        client
            .write_all(&[5, 1, 0, 3, 64, b'e', b'x'])
            .await
            .unwrap();
        client.shutdown().await.unwrap();

        let mut replies = Vec::new();
        client.read_to_end(&mut replies).await.unwrap();
        assert_eq!(replies, [5, 0]);
        assert!(transport.dials.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_pipelined_bytes_reach_target() {
        let transport = Arc::new(RecordingTransport::default());
        let mut client = serve(&transport);

        let mut bytes = vec![5, 1, 0, 5, 1, 0, 1, 10, 1, 2, 3, 0, 22];
        bytes.extend_from_slice(b"SSH-2.0");
        client.write_all(&bytes).await.unwrap();

        let mut reply = [0u8; 12];
        client.read_exact(&mut reply).await.unwrap();
        assert_eq!(reply[2..], REPLY_SUCCEEDED);

        let mut echoed = [0u8; 7];
        client.read_exact(&mut echoed).await.unwrap();
        assert_eq!(&echoed, b"SSH-2.0");
        assert_eq!(*transport.dials.lock().unwrap(), vec!["10.1.2.3:22"]);
    }
}
