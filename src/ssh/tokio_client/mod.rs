//! russh-backed SSH sessions for the tunnel engine.
//!
//! The heart of this module is [`connect`], which dials an endpoint
//! (directly or through an HTTP CONNECT proxy), authenticates, and returns
//! an [`SshTransport`] implementing the engine's
//! [`Transport`](crate::ssh::Transport) interface.
//!
//! # Features
//! * Direct TCP or HTTP/HTTPS CONNECT proxy dialing
//! * Password, private key and keyboard-interactive (2FA) authentication
//! * Outbound `direct-tcpip` channels
//! * Server-side listeners via `tcpip-forward`
//! * Liveness probes over auxiliary session channels

// Module declarations
pub mod authentication;
pub mod connection;
pub mod error;
pub mod proxy;

pub use authentication::{AuthMethod, PromptKind, TwoFactorResponder};
pub use connection::{connect, ClientHandler, SshTransport};
pub use error::Error;

// Re-export russh types commonly used with this module
pub use russh::client::Config;
