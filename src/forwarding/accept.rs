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

//! Accept loop shared by all forward kinds.

use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, trace, warn};

use super::{dynamic, local, remote, ForwardContext, Route};
use crate::ssh::ForwardListener;
use crate::utils::spawn_tracked;

/// Pause after a transient accept error before trying again.
const ACCEPT_RETRY_DELAY: Duration = Duration::from_millis(100);

/// Accept connections until the tunnel is cancelled or the listener is
/// closed, handing each one to its own task on `ctx.connections`.
///
/// Accept errors while the tunnel is stopping end the loop quietly; any
/// other error is logged and the loop keeps going.
pub async fn run_accept_loop(
    listener: Arc<dyn ForwardListener>,
    route: Route,
    ctx: ForwardContext,
) {
    let bound = listener.local_addr();
    debug!("[{}] Accepting on {} ({:?})", ctx.tunnel, bound, route);

    loop {
        let accepted = tokio::select! {
            biased;
            _ = ctx.cancel.cancelled() => break,
            accepted = listener.accept() => accepted,
        };

        match accepted {
            Ok((stream, peer)) => {
                trace!("[{}] Accepted {} on {}", ctx.tunnel, peer, bound);
                dispatch(stream, peer, &route, &ctx);
            }
            Err(e) => {
                if ctx.stop.is_stopping() || listener.is_closed() {
                    debug!("[{}] Listener {} closed: {}", ctx.tunnel, bound, e);
                    break;
                }
                warn!("[{}] Accept on {} failed: {}", ctx.tunnel, bound, e);
                tokio::select! {
                    _ = ctx.cancel.cancelled() => break,
                    _ = tokio::time::sleep(ACCEPT_RETRY_DELAY) => {}
                }
            }
        }
    }

    debug!("[{}] Accept loop for {} finished", ctx.tunnel, bound);
}

fn dispatch(stream: crate::ssh::BoxedStream, peer: String, route: &Route, ctx: &ForwardContext) {
    let name = format!("{}:{}", ctx.tunnel, peer);
    let task_ctx = ctx.clone();
    match route {
        Route::Local { host, port } => {
            let (host, port) = (host.clone(), *port);
            spawn_tracked(
                &ctx.connections,
                name,
                local::handle_connection(stream, peer, host, port, task_ctx),
            );
        }
        Route::Remote { host, port } => {
            let (host, port) = (host.clone(), *port);
            spawn_tracked(
                &ctx.connections,
                name,
                remote::handle_connection(stream, peer, host, port, task_ctx),
            );
        }
        Route::Dynamic => {
            spawn_tracked(
                &ctx.connections,
                name,
                dynamic::handle_connection(stream, peer, task_ctx),
            );
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::forwarding::{StopFlag, TcpForwardListener};
    use crate::ssh::{BoxedStream, SharedTransport, Transport};
    use async_trait::async_trait;
    use std::io;
    use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
    use tokio::io::{duplex, AsyncReadExt, AsyncWriteExt};
    use tokio::net::TcpStream;
    use tokio_util::sync::CancellationToken;
    use tokio_util::task::TaskTracker;

    struct EchoTransport;

    #[async_trait]
    impl Transport for EchoTransport {
        async fn open_direct(&self, _host: &str, _port: u16) -> io::Result<BoxedStream> {
            let (ours, mut theirs) = duplex(1024);
            tokio::spawn(async move {
                let (mut reader, mut writer) = tokio::io::split(&mut theirs);
                let _ = tokio::io::copy(&mut reader, &mut writer).await;
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

    #[derive(Default)]
    struct Flag(AtomicBool);

    impl StopFlag for Flag {
        fn is_stopping(&self) -> bool {
            self.0.load(Ordering::SeqCst)
        }
    }

    /// Fails every accept with a transient error.
    #[derive(Default)]
    struct FlakyListener {
        attempts: AtomicUsize,
    }

    #[async_trait]
    impl ForwardListener for FlakyListener {
        async fn accept(&self) -> io::Result<(BoxedStream, String)> {
            self.attempts.fetch_add(1, Ordering::SeqCst);
            Err(io::Error::other("too many open files"))
        }

        async fn close(&self) {}

        fn is_closed(&self) -> bool {
            false
        }

        fn local_addr(&self) -> String {
            "flaky".to_string()
        }
    }

    fn context(stop: Arc<Flag>) -> ForwardContext {
        ForwardContext {
            tunnel: Arc::from("accept-test"),
            transport: Arc::new(EchoTransport) as SharedTransport,
            cancel: CancellationToken::new(),
            connections: TaskTracker::new(),
            stop,
            socks_handshake_timeout: Duration::from_secs(10),
            dial_timeout: Duration::from_secs(5),
        }
    }

    #[tokio::test]
    async fn test_local_route_relays_through_transport() {
        let listener = Arc::new(TcpForwardListener::bind("127.0.0.1:0").await.unwrap());
        let addr = listener.socket_addr();
        let ctx = context(Arc::new(Flag::default()));
        let route = Route::Local {
            host: "example.org".to_string(),
            port: 80,
        };
        let task = tokio::spawn(run_accept_loop(listener.clone(), route, ctx.clone()));

        let mut client = TcpStream::connect(addr).await.unwrap();
        client.write_all(b"GET /").await.unwrap();
        let mut buf = [0u8; 5];
        client.read_exact(&mut buf).await.unwrap();
        assert_eq!(&buf, b"GET /");

        ctx.cancel.cancel();
        task.await.unwrap();
    }

    #[tokio::test]
    async fn test_closed_listener_while_stopping_exits() {
        let listener = Arc::new(TcpForwardListener::bind("127.0.0.1:0").await.unwrap());
        let stop = Arc::new(Flag::default());
        let ctx = context(stop.clone());
        let task = tokio::spawn(run_accept_loop(listener.clone(), Route::Dynamic, ctx));

        stop.0.store(true, Ordering::SeqCst);
        listener.close().await;
        tokio::time::timeout(Duration::from_secs(5), task)
            .await
            .expect("accept loop should exit")
            .unwrap();
    }

    #[tokio::test]
    async fn test_transient_errors_are_retried() {
        let listener = Arc::new(FlakyListener::default());
        let ctx = context(Arc::new(Flag::default()));
        let task = tokio::spawn(run_accept_loop(
            listener.clone() as Arc<dyn ForwardListener>,
            Route::Dynamic,
            ctx.clone(),
        ));

        tokio::time::sleep(Duration::from_millis(350)).await;
        assert!(listener.attempts.load(Ordering::SeqCst) >= 2);
        assert!(!task.is_finished());

        ctx.cancel.cancel();
        task.await.unwrap();
    }
}
