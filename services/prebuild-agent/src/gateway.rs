//! SSH gateway collaborator.
//!
//! The gateway publishes running workspaces to the outside world; the core
//! only ever hands it public keys to authorize.

use anyhow::{Context, Result};
use async_trait::async_trait;
use serde::Serialize;
use tracing::debug;

/// The narrow interface the agent needs from the SSH gateway.
#[async_trait]
pub trait SshGateway: Send + Sync {
    /// Register public keys so their owners can reach workspaces through
    /// the gateway.
    async fn add_public_keys_to_authorized_keys(&self, keys: &[String]) -> Result<()>;
}

/// HTTP client for the real gateway.
pub struct HttpSshGateway {
    base_url: String,
    client: reqwest::Client,
}

impl HttpSshGateway {
    pub fn new(base_url: String) -> Self {
        Self {
            base_url,
            client: reqwest::Client::new(),
        }
    }
}

#[derive(Serialize)]
struct AddKeysRequest<'a> {
    #[serde(rename = "publicKeys")]
    public_keys: &'a [String],
}

#[async_trait]
impl SshGateway for HttpSshGateway {
    async fn add_public_keys_to_authorized_keys(&self, keys: &[String]) -> Result<()> {
        let url = format!("{}/authorized-keys", self.base_url);
        debug!(url = %url, count = keys.len(), "Registering keys with SSH gateway");

        let response = self
            .client
            .post(&url)
            .json(&AddKeysRequest { public_keys: keys })
            .send()
            .await
            .context("reaching SSH gateway")?;

        if !response.status().is_success() {
            anyhow::bail!(
                "SSH gateway rejected keys with status {}",
                response.status()
            );
        }
        Ok(())
    }
}
