use std::time::Duration;

use halogen_protocol::{Chain, Event};

use crate::client::HalogenClient;
use crate::config::ClientConfig;
use crate::error::{ClientError, Result};

/// Connection manager for front ends.
///
/// Owns at most one live `HalogenClient` and can tear it down and reconnect
/// to the same gateway.
pub struct HalogenInterface {
    config: ClientConfig,
    client: Option<HalogenClient>,
}

impl HalogenInterface {
    /// Connect using the configured address and sender name.
    pub async fn start() -> anyhow::Result<Self> {
        let config = ClientConfig::load()?;
        Ok(Self::from_config(config).await?)
    }

    pub async fn from_config(config: ClientConfig) -> Result<Self> {
        let client = HalogenClient::connect(&config.address(), config.client_name()).await?;
        Ok(Self {
            config,
            client: Some(client),
        })
    }

    pub fn config(&self) -> &ClientConfig {
        &self.config
    }

    pub fn is_connected(&self) -> bool {
        self.client.as_ref().is_some_and(HalogenClient::is_activated)
    }

    pub fn chain(&self) -> Option<Chain> {
        self.client.as_ref().and_then(HalogenClient::chain)
    }

    fn client(&self) -> Result<&HalogenClient> {
        self.client.as_ref().ok_or(ClientError::NotConnected)
    }

    fn client_mut(&mut self) -> Result<&mut HalogenClient> {
        self.client.as_mut().ok_or(ClientError::NotConnected)
    }

    pub fn send_message(&self, message: impl Into<String>) -> Result<Chain> {
        self.client()?.send_message(message)
    }

    pub fn send_command(&self, module: &str, command: &str, args: Vec<String>) -> Result<Chain> {
        self.client()?.send_command(module, command, args)
    }

    pub fn send_event(&self, event: Event) -> Result<()> {
        self.client()?.send_event(event)
    }

    pub async fn receive_event(&mut self) -> Result<Option<Event>> {
        Ok(self.client_mut()?.receive_event().await)
    }

    pub async fn check_event(&mut self, wait: Option<Duration>) -> Result<Option<Event>> {
        Ok(self.client_mut()?.check_event(wait).await)
    }

    /// Ask the core to shut down.
    pub fn shutdown_halogen(&self) -> Result<Chain> {
        self.send_command("core", "shutdown", Vec::new())
    }

    /// Ask the core to restart.
    pub fn restart_halogen(&self) -> Result<Chain> {
        self.send_command("core", "restart", Vec::new())
    }

    /// Close the connection. Reports success and a human readable message.
    pub async fn end(&mut self) -> (bool, String) {
        match self.client.take() {
            Some(mut client) => client.end().await,
            None => (false, "Not connected to a halogen server.".to_string()),
        }
    }

    /// Drop the current connection and connect again to the same address.
    pub async fn restart(&mut self) -> Result<()> {
        let addr = match &self.client {
            Some(client) => client.addr().to_string(),
            None => self.config.address(),
        };
        let (ok, message) = self.end().await;
        if !ok {
            tracing::debug!(%message, "previous connection did not close cleanly");
        }
        self.client = Some(HalogenClient::connect(&addr, self.config.client_name()).await?);
        Ok(())
    }
}
