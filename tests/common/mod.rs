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

//! In-memory SSH transport for engine tests.

#![allow(dead_code)]

use async_trait::async_trait;
use std::io;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use tokio::io::{duplex, AsyncReadExt, AsyncWriteExt, DuplexStream};
use tokio::sync::{mpsc, Mutex as AsyncMutex};
use tokio_util::sync::CancellationToken;

use sshtm::config::{EngineSettings, ForwardConfig, SshAuthConfig, TunnelConfig};
use sshtm::ssh::tokio_client::Error;
use sshtm::ssh::transport::listener_closed;
use sshtm::ssh::{BoxedStream, Connector, ForwardListener, SharedTransport, Transport};

/// Transport whose outbound channels echo everything back.
#[derive(Default)]
pub struct MockTransport {
    dials: Mutex<Vec<String>>,
    pub closes: AtomicUsize,
    pub probes: AtomicUsize,
    pub remote_listener_closes: Arc<AtomicUsize>,
    pub reject_remote: AtomicBool,
    dead: AtomicBool,
    remote_listeners: Mutex<HashMap<String, mpsc::Sender<(BoxedStream, String)>>>,
}

impl MockTransport {
    pub fn dials(&self) -> Vec<String> {
        self.dials.lock().unwrap().clone()
    }

    pub fn set_dead(&self) {
        self.dead.store(true, Ordering::SeqCst);
    }

    pub fn close_count(&self) -> usize {
        self.closes.load(Ordering::SeqCst)
    }

    /// Play the server accepting a connection on the remote listener bound
    /// to `addr`. Returns the originating client's end of the channel.
    pub async fn accept_remote(&self, addr: &str, originator: &str) -> DuplexStream {
        let tx = self
            .remote_listeners
            .lock()
            .unwrap()
            .get(addr)
            .cloned()
            .unwrap_or_else(|| panic!("no remote listener on {addr}"));
        let (client, channel) = duplex(4096);
        tx.send((Box::new(channel), originator.to_string()))
            .await
            .unwrap();
        client
    }
}

#[async_trait]
impl Transport for MockTransport {
    async fn open_direct(&self, host: &str, port: u16) -> io::Result<BoxedStream> {
        self.dials.lock().unwrap().push(format!("{host}:{port}"));
        if self.dead.load(Ordering::SeqCst) {
            return Err(io::Error::new(io::ErrorKind::BrokenPipe, "session closed"));
        }
        let (ours, mut theirs) = duplex(4096);
        tokio::spawn(async move {
            let mut buf = [0u8; 1024];
            loop {
                match theirs.read(&mut buf).await {
                    Ok(0) | Err(_) => break,
                    Ok(n) => {
                        if theirs.write_all(&buf[..n]).await.is_err() {
                            break;
                        }
                    }
                }
            }
            let _ = theirs.shutdown().await;
        });
        Ok(Box::new(ours))
    }

    async fn listen_remote(&self, host: &str, port: u16) -> io::Result<Box<dyn ForwardListener>> {
        if self.reject_remote.load(Ordering::SeqCst) {
            return Err(io::Error::other("tcpip-forward request rejected"));
        }
        let addr = format!("{host}:{port}");
        let (tx, rx) = mpsc::channel(8);
        self.remote_listeners.lock().unwrap().insert(addr.clone(), tx);
        Ok(Box::new(MockRemoteListener {
            addr,
            incoming: AsyncMutex::new(rx),
            closed: CancellationToken::new(),
            closes: self.remote_listener_closes.clone(),
        }))
    }

    async fn probe(&self) -> io::Result<()> {
        self.probes.fetch_add(1, Ordering::SeqCst);
        if self.dead.load(Ordering::SeqCst) {
            Err(io::Error::new(io::ErrorKind::BrokenPipe, "session closed"))
        } else {
            Ok(())
        }
    }

    async fn close(&self) {
        self.closes.fetch_add(1, Ordering::SeqCst);
        self.dead.store(true, Ordering::SeqCst);
    }

    fn is_closed(&self) -> bool {
        self.dead.load(Ordering::SeqCst)
    }
}

/// Server-side listener fed by [`MockTransport::accept_remote`].
pub struct MockRemoteListener {
    addr: String,
    incoming: AsyncMutex<mpsc::Receiver<(BoxedStream, String)>>,
    closed: CancellationToken,
    closes: Arc<AtomicUsize>,
}

#[async_trait]
impl ForwardListener for MockRemoteListener {
    async fn accept(&self) -> io::Result<(BoxedStream, String)> {
        let mut incoming = self.incoming.lock().await;
        tokio::select! {
            connection = incoming.recv() => connection.ok_or_else(listener_closed),
            _ = self.closed.cancelled() => Err(listener_closed()),
        }
    }

    async fn close(&self) {
        self.closes.fetch_add(1, Ordering::SeqCst);
        self.closed.cancel();
    }

    fn is_closed(&self) -> bool {
        self.closed.is_cancelled()
    }

    fn local_addr(&self) -> String {
        self.addr.clone()
    }
}

/// Hands out a fresh [`MockTransport`] per dial and keeps them for
/// inspection.
#[derive(Default)]
pub struct MockConnector {
    transports: Mutex<Vec<Arc<MockTransport>>>,
    pub fail: AtomicBool,
    pub reject_remote: AtomicBool,
}

impl MockConnector {
    pub fn connects(&self) -> usize {
        self.transports.lock().unwrap().len()
    }

    pub fn transport(&self, index: usize) -> Arc<MockTransport> {
        self.transports.lock().unwrap()[index].clone()
    }
}

#[async_trait]
impl Connector for MockConnector {
    async fn connect(
        &self,
        config: &TunnelConfig,
        _two_factor_code: Option<&str>,
        _settings: &EngineSettings,
    ) -> Result<SharedTransport, Error> {
        if self.fail.load(Ordering::SeqCst) {
            return Err(Error::AuthFailed {
                user: config.auth.user.clone(),
                tried: "password".to_string(),
            });
        }
        let transport = Arc::new(MockTransport::default());
        transport
            .reject_remote
            .store(self.reject_remote.load(Ordering::SeqCst), Ordering::SeqCst);
        self.transports.lock().unwrap().push(transport.clone());
        Ok(transport)
    }
}

pub fn tunnel(name: &str, forwards: Vec<ForwardConfig>) -> TunnelConfig {
    TunnelConfig {
        name: name.to_string(),
        ssh_host: "bastion.example.com".to_string(),
        ssh_port: 22,
        auth: SshAuthConfig {
            user: "alice".to_string(),
            password: Some("hunter2".to_string()),
            ..Default::default()
        },
        proxy: None,
        forwards,
    }
}

/// A loopback port that was free a moment ago.
pub fn free_port() -> u16 {
    std::net::TcpListener::bind("127.0.0.1:0")
        .unwrap()
        .local_addr()
        .unwrap()
        .port()
}
