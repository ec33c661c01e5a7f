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

//! SSH connection establishment and the russh-backed [`Transport`].
//!
//! Dialing goes direct or through an HTTP CONNECT proxy, then performs the
//! SSH handshake and authentication over the resulting stream with
//! [`russh::client::connect_stream`].

use async_trait::async_trait;
use russh::client::{Config, Handle, Handler, Msg, Session};
use russh::Channel;
use std::collections::HashMap;
use std::fmt::Debug;
use std::io;
use std::sync::{Arc, Mutex};
use tokio::net::TcpStream;
use tokio::sync::{mpsc, Mutex as AsyncMutex, RwLock};
use tokio::time::timeout;
use tokio_util::sync::CancellationToken;
use tracing::{debug, trace, warn};

use super::authentication::{authenticate, resolve_methods};
use super::proxy::connect_via_proxy;
use super::Error;
use crate::config::{EngineSettings, TunnelConfig};
use crate::forwarding::join_host_port;
use crate::ssh::transport::{listener_closed, BoxedStream, ForwardListener, Transport};

/// Pending server-side connections buffered per remote listener.
const FORWARDED_BACKLOG: usize = 64;

/// Establish an authenticated session for `config`.
///
/// Credentials are resolved first so configuration problems surface before
/// any network activity. TCP connect and handshake are each bounded by
/// `settings.connect_timeout()`.
pub async fn connect(
    config: &TunnelConfig,
    two_factor_code: Option<&str>,
    settings: &EngineSettings,
) -> Result<SshTransport, Error> {
    let methods = resolve_methods(&config.auth, two_factor_code)?;
    let endpoint = join_host_port(&config.ssh_host, config.ssh_port);
    let connect_timeout = settings.connect_timeout();

    let stream: BoxedStream = match config.active_proxy() {
        Some(proxy) => {
            connect_via_proxy(
                proxy,
                &config.ssh_host,
                config.ssh_port,
                settings.proxy_connect_timeout(),
            )
            .await?
        }
        None => {
            let tcp = timeout(
                connect_timeout,
                TcpStream::connect((config.ssh_host.as_str(), config.ssh_port)),
            )
            .await
            .map_err(|_| Error::Timeout {
                stage: "connecting to",
                addr: endpoint.clone(),
                timeout: connect_timeout,
            })?
            .map_err(|source| Error::Connect {
                addr: endpoint.clone(),
                source,
            })?;
            let _ = tcp.set_nodelay(true);
            Box::new(tcp)
        }
    };

    let ssh_config = Arc::new(Config {
        keepalive_interval: settings.keepalive_interval(),
        ..Default::default()
    });
    let forwards = Arc::new(RemoteForwards::default());
    let handler = ClientHandler::new(endpoint.clone(), forwards.clone());

    let handshake = async {
        let mut handle = russh::client::connect_stream(ssh_config, stream, handler).await?;
        authenticate(&mut handle, &config.auth.user, methods).await?;
        Ok::<_, Error>(handle)
    };
    let handle = timeout(connect_timeout, handshake)
        .await
        .map_err(|_| Error::Timeout {
            stage: "authenticating with",
            addr: endpoint.clone(),
            timeout: connect_timeout,
        })??;

    debug!("SSH session to {} established", endpoint);
    Ok(SshTransport {
        inner: Arc::new(SessionInner {
            handle: RwLock::new(handle),
            forwards,
        }),
        endpoint,
    })
}

struct SessionInner {
    /// Write access is only needed for global requests (`tcpip-forward`).
    handle: RwLock<Handle<ClientHandler>>,
    forwards: Arc<RemoteForwards>,
}

/// An authenticated SSH session.
pub struct SshTransport {
    inner: Arc<SessionInner>,
    endpoint: String,
}

impl Debug for SshTransport {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SshTransport")
            .field("endpoint", &self.endpoint)
            .field("handle", &"Handle<ClientHandler>")
            .finish()
    }
}

fn ssh_to_io(e: russh::Error) -> io::Error {
    io::Error::other(e)
}

#[async_trait]
impl Transport for SshTransport {
    async fn open_direct(&self, host: &str, port: u16) -> io::Result<BoxedStream> {
        let channel = self
            .inner
            .handle
            .read()
            .await
            .channel_open_direct_tcpip(host, u32::from(port), "127.0.0.1", 0)
            .await
            .map_err(ssh_to_io)?;
        trace!("Opened direct-tcpip channel to {}:{}", host, port);
        Ok(Box::new(channel.into_stream()))
    }

    async fn listen_remote(&self, host: &str, port: u16) -> io::Result<Box<dyn ForwardListener>> {
        let (tx, rx) = mpsc::channel(FORWARDED_BACKLOG);

        // Register before asking for a fixed port so an early connection is
        // not dropped; port 0 is only known after the reply.
        if port != 0 {
            self.inner.forwards.register(host, u32::from(port), tx.clone());
        }
        let result = self
            .inner
            .handle
            .write()
            .await
            .tcpip_forward(host, u32::from(port))
            .await;
        let bound = match result {
            Ok(bound) if port == 0 => bound,
            Ok(_) => u32::from(port),
            Err(e) => {
                self.inner.forwards.unregister(host, u32::from(port));
                return Err(match e {
                    russh::Error::RequestDenied => io::Error::new(
                        io::ErrorKind::AddrInUse,
                        format!(
                            "server refused to listen on {} (port in use or forwarding disabled)",
                            join_host_port(host, port)
                        ),
                    ),
                    other => ssh_to_io(other),
                });
            }
        };
        if port == 0 {
            self.inner.forwards.register(host, bound, tx);
        }

        debug!("Server listening on {}:{} for {}", host, bound, self.endpoint);
        Ok(Box::new(SshRemoteListener {
            session: self.inner.clone(),
            host: host.to_string(),
            port: bound,
            incoming: AsyncMutex::new(rx),
            closed: CancellationToken::new(),
        }))
    }

    async fn probe(&self) -> io::Result<()> {
        let channel = self
            .inner
            .handle
            .read()
            .await
            .channel_open_session()
            .await
            .map_err(ssh_to_io)?;
        channel.close().await.map_err(ssh_to_io)
    }

    async fn close(&self) {
        let handle = self.inner.handle.read().await;
        if handle.is_closed() {
            return;
        }
        if let Err(e) = handle
            .disconnect(russh::Disconnect::ByApplication, "", "English")
            .await
        {
            debug!("Disconnect from {} failed: {}", self.endpoint, e);
        }
    }

    fn is_closed(&self) -> bool {
        // A held write lock means a global request is in flight, so the
        // session was alive a moment ago.
        self.inner
            .handle
            .try_read()
            .map(|handle| handle.is_closed())
            .unwrap_or(false)
    }
}

/// A connection the server accepted on one of our remote listeners.
struct ForwardedConnection {
    channel: Channel<Msg>,
    originator: String,
}

/// Routes `forwarded-tcpip` channels to the listener that asked for them.
struct RemoteForwards<T = ForwardedConnection> {
    routes: Mutex<HashMap<(String, u32), mpsc::Sender<T>>>,
}

impl<T> Default for RemoteForwards<T> {
    fn default() -> Self {
        Self {
            routes: Mutex::new(HashMap::new()),
        }
    }
}

impl<T> RemoteForwards<T> {
    fn register(&self, host: &str, port: u32, tx: mpsc::Sender<T>) {
        if let Ok(mut routes) = self.routes.lock() {
            routes.insert((host.to_string(), port), tx);
        }
    }

    fn unregister(&self, host: &str, port: u32) {
        if let Ok(mut routes) = self.routes.lock() {
            routes.remove(&(host.to_string(), port));
        }
    }

    fn dispatch(&self, connection: T, address: &str, port: u32) {
        let sender = match self.routes.lock() {
            // Servers normally echo the requested bind address; fall back to
            // the port alone for ones that report the resolved address.
            Ok(routes) => routes
                .get(&(address.to_string(), port))
                .or_else(|| {
                    routes
                        .iter()
                        .find(|((_, bound), _)| *bound == port)
                        .map(|(_, tx)| tx)
                })
                .cloned(),
            Err(_) => None,
        };

        match sender {
            Some(tx) => {
                if let Err(e) = tx.try_send(connection) {
                    warn!(
                        "Dropping forwarded connection for {}:{}: listener busy or closed ({})",
                        address, port, e
                    );
                }
            }
            None => debug!(
                "No listener registered for forwarded connection to {}:{}",
                address, port
            ),
        }
    }
}

/// Server-side listener created with `tcpip-forward`.
struct SshRemoteListener {
    session: Arc<SessionInner>,
    host: String,
    port: u32,
    incoming: AsyncMutex<mpsc::Receiver<ForwardedConnection>>,
    closed: CancellationToken,
}

#[async_trait]
impl ForwardListener for SshRemoteListener {
    async fn accept(&self) -> io::Result<(BoxedStream, String)> {
        let mut incoming = tokio::select! {
            guard = self.incoming.lock() => guard,
            _ = self.closed.cancelled() => return Err(listener_closed()),
        };
        tokio::select! {
            connection = incoming.recv() => match connection {
                Some(connection) => Ok((
                    Box::new(connection.channel.into_stream()) as BoxedStream,
                    connection.originator,
                )),
                None => Err(listener_closed()),
            },
            _ = self.closed.cancelled() => Err(listener_closed()),
        }
    }

    async fn close(&self) {
        if self.closed.is_cancelled() {
            return;
        }
        self.closed.cancel();
        self.session.forwards.unregister(&self.host, self.port);

        if self.session.handle.read().await.is_closed() {
            return;
        }
        let result = self
            .session
            .handle
            .write()
            .await
            .cancel_tcpip_forward(&self.host, self.port)
            .await;
        if let Err(e) = result {
            debug!(
                "cancel-tcpip-forward for {}:{} failed: {}",
                self.host, self.port, e
            );
        }
    }

    fn is_closed(&self) -> bool {
        self.closed.is_cancelled()
    }

    fn local_addr(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }
}

/// SSH client handler.
///
/// Host keys are accepted without verification; the fingerprint is logged.
/// Server-opened `forwarded-tcpip` channels are routed to remote listeners.
pub struct ClientHandler {
    endpoint: String,
    forwards: Arc<RemoteForwards>,
}

impl ClientHandler {
    fn new(endpoint: String, forwards: Arc<RemoteForwards>) -> Self {
        Self { endpoint, forwards }
    }
}

impl Handler for ClientHandler {
    type Error = super::Error;

    async fn check_server_key(
        &mut self,
        server_public_key: &russh::keys::PublicKey,
    ) -> Result<bool, Self::Error> {
        debug!(
            "Accepting host key {} for {} without verification",
            server_public_key.fingerprint(russh::keys::HashAlg::Sha256),
            self.endpoint
        );
        Ok(true)
    }

    async fn server_channel_open_forwarded_tcpip(
        &mut self,
        channel: Channel<Msg>,
        connected_address: &str,
        connected_port: u32,
        originator_address: &str,
        originator_port: u32,
        _session: &mut Session,
    ) -> Result<(), Self::Error> {
        trace!(
            "Server forwarded connection from {}:{} to {}:{}",
            originator_address,
            originator_port,
            connected_address,
            connected_port
        );
        self.forwards.dispatch(
            ForwardedConnection {
                channel,
                originator: format!("{originator_address}:{originator_port}"),
            },
            connected_address,
            connected_port,
        );
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn route(forwards: &RemoteForwards<u8>, host: &str, port: u32) -> mpsc::Receiver<u8> {
        let (tx, rx) = mpsc::channel(1);
        forwards.register(host, port, tx);
        rx
    }

    #[test]
    fn test_forwarded_connections_follow_bind_address() {
        let forwards = RemoteForwards::<u8>::default();
        let mut any = route(&forwards, "0.0.0.0", 9000);
        let mut loopback = route(&forwards, "127.0.0.1", 9001);

        forwards.dispatch(1, "0.0.0.0", 9000);
        forwards.dispatch(2, "127.0.0.1", 9001);
        assert_eq!(any.try_recv().unwrap(), 1);
        assert_eq!(loopback.try_recv().unwrap(), 2);

        // A server reporting the resolved address still reaches the port's
        // listener.
        forwards.dispatch(3, "203.0.113.5", 9000);
        assert_eq!(any.try_recv().unwrap(), 3);
        assert!(loopback.try_recv().is_err());
    }

    #[test]
    fn test_exact_address_wins_over_port_match() {
        let forwards = RemoteForwards::<u8>::default();
        let mut first = route(&forwards, "10.0.0.1", 8080);
        let mut second = route(&forwards, "10.0.0.2", 8080);

        forwards.dispatch(7, "10.0.0.2", 8080);
        assert_eq!(second.try_recv().unwrap(), 7);
        assert!(first.try_recv().is_err());
    }

    #[test]
    fn test_unregistered_and_busy_routes_drop_connections() {
        let forwards = RemoteForwards::<u8>::default();
        let mut rx = route(&forwards, "localhost", 2222);

        // Capacity is one; the second connection is dropped, not queued.
        forwards.dispatch(1, "localhost", 2222);
        forwards.dispatch(2, "localhost", 2222);
        assert_eq!(rx.try_recv().unwrap(), 1);
        assert!(rx.try_recv().is_err());

        forwards.unregister("localhost", 2222);
        forwards.dispatch(3, "localhost", 2222);
        assert!(rx.try_recv().is_err());
    }
}
