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

//! Session factory used by the pool when no shared session exists yet.

use async_trait::async_trait;
use std::sync::Arc;

use super::tokio_client::{self, Error};
use super::transport::SharedTransport;
use crate::config::{EngineSettings, TunnelConfig};

/// Dials new transports.
#[async_trait]
pub trait Connector: Send + Sync {
    async fn connect(
        &self,
        config: &TunnelConfig,
        two_factor_code: Option<&str>,
        settings: &EngineSettings,
    ) -> Result<SharedTransport, Error>;
}

/// Dials real SSH servers with russh.
#[derive(Debug, Default, Clone, Copy)]
pub struct SshConnector;

#[async_trait]
impl Connector for SshConnector {
    async fn connect(
        &self,
        config: &TunnelConfig,
        two_factor_code: Option<&str>,
        settings: &EngineSettings,
    ) -> Result<SharedTransport, Error> {
        let transport = tokio_client::connect(config, two_factor_code, settings).await?;
        Ok(Arc::new(transport))
    }
}
