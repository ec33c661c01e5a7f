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

//! Errors produced while dialing and authenticating an SSH session.

use std::io;
use std::path::PathBuf;
use std::time::Duration;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum Error {
    #[error("No authentication method configured: set a password or key_path, or enable 2FA")]
    NoAuthMethod,

    #[error("Two-factor authentication is enabled but no verification code was supplied")]
    MissingTwoFactorCode,

    #[error("Unable to load private key {path}: {source}")]
    KeyInvalid {
        path: PathBuf,
        #[source]
        source: russh::keys::Error,
    },

    #[error("Failed to connect to {addr}: {source}")]
    Connect {
        addr: String,
        #[source]
        source: io::Error,
    },

    #[error("Timed out after {timeout:?} while {stage} {addr}")]
    Timeout {
        stage: &'static str,
        addr: String,
        timeout: Duration,
    },

    #[error("Proxy error: {0}")]
    Proxy(String),

    #[error("Proxy I/O error: {0}")]
    ProxyIo(#[source] io::Error),

    #[error("TLS handshake with proxy {host} failed: {reason}")]
    Tls { host: String, reason: String },

    #[error("Unexpected keyboard-interactive prompt: {0:?}")]
    UnexpectedPrompt(String),

    #[error("Authentication failed for user {user}: tried {tried}")]
    AuthFailed { user: String, tried: String },

    #[error("SSH error: {0}")]
    SshError(#[from] russh::Error),
}

impl Error {
    /// True for problems in the tunnel definition itself, as opposed to
    /// network or server failures.
    pub fn is_configuration(&self) -> bool {
        matches!(
            self,
            Error::NoAuthMethod | Error::MissingTwoFactorCode | Error::KeyInvalid { .. }
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_configuration_errors() {
        assert!(Error::NoAuthMethod.is_configuration());
        assert!(Error::MissingTwoFactorCode.is_configuration());
        assert!(!Error::Proxy("HTTP/1.1 403 Forbidden".to_string()).is_configuration());

        let rejected = Error::AuthFailed {
            user: "alice".to_string(),
            tried: "password, keyboard-interactive".to_string(),
        };
        assert!(!rejected.is_configuration());
        assert_eq!(
            rejected.to_string(),
            "Authentication failed for user alice: tried password, keyboard-interactive"
        );
    }
}
