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

//! HTTP CONNECT proxy dialing.
//!
//! Opens a byte stream to the SSH endpoint through an HTTP or HTTPS forward
//! proxy. The request is `CONNECT host:port HTTP/1.1` with an optional
//! `Proxy-Authorization: Basic ...` header; a status line containing
//! `" 200 "` means the tunnel is open.

use base64::prelude::{Engine as _, BASE64_STANDARD};
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncBufReadExt, AsyncRead, AsyncWrite, AsyncWriteExt, BufReader};
use tokio::net::TcpStream;
use tokio::time::timeout;
use tokio_rustls::rustls::pki_types::ServerName;
use tokio_rustls::rustls::{ClientConfig, RootCertStore};
use tokio_rustls::TlsConnector;
use tracing::{debug, warn};

use super::Error;
use crate::config::ProxyConfig;
use crate::forwarding::join_host_port;
use crate::ssh::transport::BoxedStream;

/// Proxies answering with more header lines than this are rejected.
const MAX_HEADER_LINES: usize = 100;

/// Dial `target_host:target_port` through `proxy`.
pub async fn connect_via_proxy(
    proxy: &ProxyConfig,
    target_host: &str,
    target_port: u16,
    connect_timeout: Duration,
) -> Result<BoxedStream, Error> {
    let proxy_addr = join_host_port(&proxy.host, proxy.port);
    debug!(
        "Connecting to {}proxy {}",
        if proxy.tls { "TLS " } else { "" },
        proxy_addr
    );

    let tcp = timeout(
        connect_timeout,
        TcpStream::connect((proxy.host.as_str(), proxy.port)),
    )
    .await
    .map_err(|_| Error::Timeout {
        stage: "connecting to proxy",
        addr: proxy_addr.clone(),
        timeout: connect_timeout,
    })?
    .map_err(|source| Error::Connect {
        addr: proxy_addr.clone(),
        source,
    })?;
    let _ = tcp.set_nodelay(true);

    let target = join_host_port(target_host, target_port);
    let credentials = proxy.credentials();
    let negotiation = async {
        if proxy.tls {
            let tls = tls_connect(&proxy.host, tcp).await?;
            http_connect(tls, &target, credentials).await
        } else {
            http_connect(tcp, &target, credentials).await
        }
    };
    // TLS and the CONNECT exchange share one budget, separate from the dial.
    timeout(connect_timeout, negotiation)
        .await
        .map_err(|_| Error::Timeout {
            stage: "negotiating with proxy",
            addr: proxy_addr,
            timeout: connect_timeout,
        })?
}

/// Run the CONNECT exchange over an already open stream.
///
/// The stream is returned wrapped in its read buffer so bytes the proxy
/// sent right after the headers are not lost.
pub async fn http_connect<S>(
    stream: S,
    target: &str,
    credentials: Option<(&str, &str)>,
) -> Result<BoxedStream, Error>
where
    S: AsyncRead + AsyncWrite + Unpin + Send + 'static,
{
    let mut request = format!("CONNECT {target} HTTP/1.1\r\nHost: {target}\r\n");
    if let Some((user, password)) = credentials {
        let token = BASE64_STANDARD.encode(format!("{user}:{password}"));
        request.push_str(&format!("Proxy-Authorization: Basic {token}\r\n"));
    }
    request.push_str("\r\n");

    let mut reader = BufReader::new(stream);
    reader
        .get_mut()
        .write_all(request.as_bytes())
        .await
        .map_err(Error::ProxyIo)?;
    reader.get_mut().flush().await.map_err(Error::ProxyIo)?;

    let mut status = String::new();
    if reader
        .read_line(&mut status)
        .await
        .map_err(Error::ProxyIo)?
        == 0
    {
        return Err(Error::Proxy(
            "proxy closed the connection without a response".to_string(),
        ));
    }
    if !status.contains(" 200 ") {
        return Err(Error::Proxy(format!(
            "CONNECT {target} refused: {}",
            status.trim()
        )));
    }

    let mut lines = 0;
    loop {
        let mut line = String::new();
        if reader.read_line(&mut line).await.map_err(Error::ProxyIo)? == 0 {
            return Err(Error::Proxy(
                "proxy closed the connection while sending headers".to_string(),
            ));
        }
        if line == "\r\n" || line == "\n" {
            break;
        }
        lines += 1;
        if lines > MAX_HEADER_LINES {
            return Err(Error::Proxy("proxy response headers too long".to_string()));
        }
    }

    debug!("Proxy tunnel to {} established", target);
    Ok(Box::new(reader))
}

async fn tls_connect(
    host: &str,
    tcp: TcpStream,
) -> Result<tokio_rustls::client::TlsStream<TcpStream>, Error> {
    let mut root_store = RootCertStore::empty();
    let cert_result = rustls_native_certs::load_native_certs();
    for cert in cert_result.certs {
        root_store.add(cert).ok();
    }
    if !cert_result.errors.is_empty() {
        warn!(
            "Some errors occurred while loading native certificates: {:?}",
            cert_result.errors
        );
    }

    let config = ClientConfig::builder()
        .with_root_certificates(root_store)
        .with_no_client_auth();
    let connector = TlsConnector::from(Arc::new(config));

    let server_name = ServerName::try_from(host.to_string()).map_err(|e| Error::Tls {
        host: host.to_string(),
        reason: e.to_string(),
    })?;

    connector
        .connect(server_name, tcp)
        .await
        .map_err(|e| Error::Tls {
            host: host.to_string(),
            reason: e.to_string(),
        })
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::AsyncReadExt;
    use tokio::net::TcpListener;

    /// Minimal proxy: records the request head, answers with `response`,
    /// then echoes whatever follows.
    async fn fake_proxy(response: &'static str) -> (u16, tokio::task::JoinHandle<String>) {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        let handle = tokio::spawn(async move {
            let (socket, _) = listener.accept().await.unwrap();
            let mut reader = BufReader::new(socket);
            let mut head = String::new();
            loop {
                let mut line = String::new();
                reader.read_line(&mut line).await.unwrap();
                head.push_str(&line);
                if line == "\r\n" {
                    break;
                }
            }
            let mut socket = reader.into_inner();
            socket.write_all(response.as_bytes()).await.unwrap();
            let mut buf = [0u8; 64];
            if let Ok(n) = socket.read(&mut buf).await {
                let _ = socket.write_all(&buf[..n]).await;
            }
            head
        });
        (port, handle)
    }

    fn proxy(port: u16, username: Option<&str>) -> ProxyConfig {
        ProxyConfig {
            host: "127.0.0.1".to_string(),
            port,
            username: username.map(str::to_string),
            password: Some("s3cret".to_string()),
            tls: false,
        }
    }

    #[tokio::test]
    async fn test_connect_success_sends_request() {
        let (port, server) =
            fake_proxy("HTTP/1.1 200 Connection established\r\nVia: test\r\n\r\n").await;

        let mut stream = connect_via_proxy(
            &proxy(port, Some("bob")),
            "ssh.example.com",
            22,
            Duration::from_secs(5),
        )
        .await
        .unwrap();

        stream.write_all(b"SSH-2.0-test\r\n").await.unwrap();
        let mut echoed = [0u8; 14];
        stream.read_exact(&mut echoed).await.unwrap();
        assert_eq!(&echoed, b"SSH-2.0-test\r\n");

        let head = server.await.unwrap();
        assert!(head.starts_with("CONNECT ssh.example.com:22 HTTP/1.1\r\n"));
        assert!(head.contains("Host: ssh.example.com:22\r\n"));
        let token = BASE64_STANDARD.encode("bob:s3cret");
        assert!(head.contains(&format!("Proxy-Authorization: Basic {token}\r\n")));
    }

    #[tokio::test]
    async fn test_no_credentials_no_header() {
        let (port, server) = fake_proxy("HTTP/1.0 200 OK\r\n\r\n").await;
        let stream = connect_via_proxy(&proxy(port, None), "10.0.0.1", 2222, Duration::from_secs(5))
            .await
            .unwrap();
        drop(stream);

        let head = server.await.unwrap();
        assert!(head.starts_with("CONNECT 10.0.0.1:2222 HTTP/1.1\r\n"));
        assert!(!head.contains("Proxy-Authorization"));
    }

    #[tokio::test]
    async fn test_non_200_is_rejected() {
        let (port, _server) =
            fake_proxy("HTTP/1.1 407 Proxy Authentication Required\r\n\r\n").await;
        let err = connect_via_proxy(&proxy(port, None), "host", 22, Duration::from_secs(5))
            .await
            .err()
            .unwrap();
        match err {
            Error::Proxy(message) => assert!(message.contains("407"), "{message}"),
            other => panic!("unexpected error: {other}"),
        }
    }

    #[tokio::test]
    async fn test_bytes_after_headers_are_kept() {
        // The proxy pushes the server banner in the same segment as the
        // headers; it must still be readable afterwards.
        let (port, _server) =
            fake_proxy("HTTP/1.1 200 OK\r\n\r\nSSH-2.0-OpenSSH_9.6\r\n").await;
        let mut stream =
            connect_via_proxy(&proxy(port, None), "host", 22, Duration::from_secs(5))
                .await
                .unwrap();

        let mut banner = [0u8; 21];
        stream.read_exact(&mut banner).await.unwrap();
        assert_eq!(&banner, b"SSH-2.0-OpenSSH_9.6\r\n");
    }

    #[tokio::test]
    async fn test_proxy_unreachable() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        drop(listener);

        let err = connect_via_proxy(&proxy(port, None), "host", 22, Duration::from_secs(5))
            .await
            .err()
            .unwrap();
        assert!(matches!(err, Error::Connect { .. }));
    }

    #[tokio::test]
    async fn test_silent_proxy_times_out() {
        for tls in [false, true] {
            let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
            let port = listener.local_addr().unwrap().port();
            // Accept and then say nothing.
            let server = tokio::spawn(async move {
                let (socket, _) = listener.accept().await.unwrap();
                tokio::time::sleep(Duration::from_secs(30)).await;
                drop(socket);
            });

            let mut config = proxy(port, None);
            config.tls = tls;
            let err = tokio::time::timeout(
                Duration::from_secs(5),
                connect_via_proxy(&config, "host", 22, Duration::from_millis(200)),
            )
            .await
            .expect("proxy negotiation was not bounded")
            .err()
            .unwrap();
            match err {
                Error::Timeout { stage, .. } => assert_eq!(stage, "negotiating with proxy"),
                other => panic!("unexpected error with tls={tls}: {other}"),
            }
            server.abort();
        }
    }
}
