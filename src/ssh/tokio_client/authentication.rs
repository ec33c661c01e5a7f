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

//! SSH authentication methods.
//!
//! Methods are resolved from the tunnel's [`SshAuthConfig`] before any
//! network activity, so a missing credential or an unreadable key fails
//! fast. Supported methods:
//! - Password authentication
//! - Private key file authentication (optionally passphrase protected)
//! - Keyboard-interactive authentication for two-factor logins

use russh::client::{Handle, Handler, KeyboardInteractiveAuthResponse};
use std::fmt;
use std::sync::Arc;
use tracing::debug;
use zeroize::Zeroizing;

use crate::config::SshAuthConfig;

/// An authentication method ready to be offered to the server.
#[derive(Clone)]
pub enum AuthMethod {
    Password(Zeroizing<String>),
    PrivateKey(Arc<russh::keys::PrivateKey>),
    KeyboardInteractive(TwoFactorResponder),
}

impl AuthMethod {
    fn name(&self) -> &'static str {
        match self {
            AuthMethod::Password(_) => "password",
            AuthMethod::PrivateKey(_) => "publickey",
            AuthMethod::KeyboardInteractive(_) => "keyboard-interactive",
        }
    }
}

impl fmt::Debug for AuthMethod {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// What a keyboard-interactive prompt is asking for.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PromptKind {
    Password,
    Code,
}

impl PromptKind {
    /// Classify a prompt by keyword, case-insensitively.
    pub fn classify(prompt: &str) -> Option<Self> {
        let prompt = prompt.trim().to_lowercase();
        if prompt.contains("password") {
            Some(PromptKind::Password)
        } else if ["verification", "code", "token", "authenticator"]
            .iter()
            .any(|keyword| prompt.contains(keyword))
        {
            Some(PromptKind::Code)
        } else {
            None
        }
    }
}

/// Answers keyboard-interactive prompts with the password or the one-time
/// code. Any prompt it cannot classify aborts authentication.
#[derive(Clone)]
pub struct TwoFactorResponder {
    password: Zeroizing<String>,
    code: Zeroizing<String>,
}

impl TwoFactorResponder {
    pub fn new(password: &str, code: &str) -> Self {
        Self {
            password: Zeroizing::new(password.to_string()),
            code: Zeroizing::new(code.to_string()),
        }
    }

    pub fn respond(&self, prompt: &str) -> Result<String, super::Error> {
        match PromptKind::classify(prompt) {
            Some(PromptKind::Password) => Ok(self.password.to_string()),
            Some(PromptKind::Code) => Ok(self.code.to_string()),
            None => Err(super::Error::UnexpectedPrompt(prompt.trim().to_string())),
        }
    }
}

/// Build the ordered list of methods for `auth`.
///
/// With 2FA enabled only keyboard-interactive is used. Otherwise the
/// password and the private key are offered in that order, whichever are
/// configured. The key file is read and decrypted here.
pub fn resolve_methods(
    auth: &SshAuthConfig,
    two_factor_code: Option<&str>,
) -> Result<Vec<AuthMethod>, super::Error> {
    if auth.use_2fa {
        let code = two_factor_code
            .map(str::trim)
            .filter(|code| !code.is_empty())
            .ok_or(super::Error::MissingTwoFactorCode)?;
        let password = auth.password().unwrap_or("");
        return Ok(vec![AuthMethod::KeyboardInteractive(
            TwoFactorResponder::new(password, code),
        )]);
    }

    let mut methods = Vec::new();
    if let Some(password) = auth.password() {
        methods.push(AuthMethod::Password(Zeroizing::new(password.to_string())));
    }
    if let Some(key_path) = auth.key_path() {
        let key = russh::keys::load_secret_key(key_path, auth.key_passphrase()).map_err(
            |source| super::Error::KeyInvalid {
                path: key_path.clone(),
                source,
            },
        )?;
        methods.push(AuthMethod::PrivateKey(Arc::new(key)));
    }

    if methods.is_empty() {
        return Err(super::Error::NoAuthMethod);
    }
    Ok(methods)
}

/// Try each method in order until the server accepts one.
pub(super) async fn authenticate<H: Handler>(
    handle: &mut Handle<H>,
    username: &str,
    methods: Vec<AuthMethod>,
) -> Result<(), super::Error> {
    let tried = methods
        .iter()
        .map(AuthMethod::name)
        .collect::<Vec<_>>()
        .join(", ");

    for method in methods {
        let name = method.name();
        let accepted = match method {
            AuthMethod::Password(password) => handle
                .authenticate_password(username, password.as_str())
                .await?
                .success(),
            AuthMethod::PrivateKey(key) => {
                let hash_alg = handle.best_supported_rsa_hash().await?.flatten();
                handle
                    .authenticate_publickey(
                        username,
                        russh::keys::PrivateKeyWithHashAlg::new(key, hash_alg),
                    )
                    .await?
                    .success()
            }
            AuthMethod::KeyboardInteractive(responder) => {
                keyboard_interactive(handle, username, &responder).await?
            }
        };

        if accepted {
            debug!("Authenticated as {} with {}", username, name);
            return Ok(());
        }
        debug!("Server rejected {} authentication for {}", name, username);
    }

    Err(super::Error::AuthFailed {
        user: username.to_string(),
        tried,
    })
}

async fn keyboard_interactive<H: Handler>(
    handle: &mut Handle<H>,
    username: &str,
    responder: &TwoFactorResponder,
) -> Result<bool, super::Error> {
    let mut res = handle
        .authenticate_keyboard_interactive_start(username, None::<String>)
        .await?;
    loop {
        let prompts = match res {
            KeyboardInteractiveAuthResponse::Success => return Ok(true),
            KeyboardInteractiveAuthResponse::Failure { .. } => return Ok(false),
            KeyboardInteractiveAuthResponse::InfoRequest { prompts, .. } => prompts,
        };

        let responses = prompts
            .iter()
            .map(|prompt| responder.respond(&prompt.prompt))
            .collect::<Result<Vec<_>, _>>()?;

        res = handle
            .authenticate_keyboard_interactive_respond(responses)
            .await?;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ssh::tokio_client::Error;

    fn auth() -> SshAuthConfig {
        SshAuthConfig {
            user: "alice".to_string(),
            ..Default::default()
        }
    }

    #[test]
    fn test_classify_prompts() {
        assert_eq!(PromptKind::classify("Password: "), Some(PromptKind::Password));
        assert_eq!(
            PromptKind::classify("  (alice@host) PASSWORD:"),
            Some(PromptKind::Password)
        );
        assert_eq!(
            PromptKind::classify("Verification code: "),
            Some(PromptKind::Code)
        );
        assert_eq!(PromptKind::classify("OTP Token:"), Some(PromptKind::Code));
        assert_eq!(
            PromptKind::classify("Enter Authenticator value"),
            Some(PromptKind::Code)
        );
        assert_eq!(PromptKind::classify("Favourite colour?"), None);
    }

    #[test]
    fn test_responder_answers_by_kind() {
        let responder = TwoFactorResponder::new("hunter2", "123456");
        assert_eq!(responder.respond("Password:").unwrap(), "hunter2");
        assert_eq!(responder.respond("Verification code:").unwrap(), "123456");
        assert!(matches!(
            responder.respond("Mother's maiden name:"),
            Err(Error::UnexpectedPrompt(prompt)) if prompt == "Mother's maiden name:"
        ));
    }

    #[test]
    fn test_no_method_fails_fast() {
        assert!(matches!(
            resolve_methods(&auth(), None),
            Err(Error::NoAuthMethod)
        ));

        let mut empty_strings = auth();
        empty_strings.password = Some(String::new());
        empty_strings.key_path = Some(Default::default());
        assert!(matches!(
            resolve_methods(&empty_strings, None),
            Err(Error::NoAuthMethod)
        ));
    }

    #[test]
    fn test_two_factor_requires_code() {
        let mut config = auth();
        config.use_2fa = true;
        config.password = Some("pw".to_string());

        assert!(matches!(
            resolve_methods(&config, None),
            Err(Error::MissingTwoFactorCode)
        ));
        assert!(matches!(
            resolve_methods(&config, Some("   ")),
            Err(Error::MissingTwoFactorCode)
        ));

        let methods = resolve_methods(&config, Some("424242")).unwrap();
        assert_eq!(methods.len(), 1);
        assert!(matches!(methods[0], AuthMethod::KeyboardInteractive(_)));
    }

    #[test]
    fn test_password_only() {
        let mut config = auth();
        config.password = Some("pw".to_string());
        let methods = resolve_methods(&config, None).unwrap();
        assert_eq!(format!("{methods:?}"), "[password]");
    }

    #[test]
    fn test_unreadable_key_is_configuration_error() {
        let dir = tempfile::tempdir().unwrap();
        let mut config = auth();
        config.password = Some("pw".to_string());
        config.key_path = Some(dir.path().join("missing_key"));

        let err = resolve_methods(&config, None).unwrap_err();
        assert!(matches!(err, Error::KeyInvalid { .. }));
        assert!(err.is_configuration());
    }

    #[test]
    fn test_garbage_key_is_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let key_path = dir.path().join("id_garbage");
        std::fs::write(&key_path, "not a private key").unwrap();

        let mut config = auth();
        config.key_path = Some(key_path);
        assert!(matches!(
            resolve_methods(&config, None),
            Err(Error::KeyInvalid { .. })
        ));
    }
}
