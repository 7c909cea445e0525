use serde::Serialize;

use crate::error::{FleetError, Result};
use crate::instance::orchestrator::Orchestrator;
use crate::instance::{filesystem, gateway_config, InstanceStatus};

#[derive(Debug, Clone, Serialize)]
pub struct TokenRotation {
    pub token: String,
    /// The gateway only reads its token at startup.
    pub restart_required: bool,
}

impl Orchestrator {
    /// Current gateway token, `None` when the config has none.
    pub async fn get_token(&self, id: &str) -> Result<Option<String>> {
        let _fleet = self.state.fleet_lock.read().await;
        self.token_locked(id)
    }

    /// Caller holds the fleet lock.
    fn token_locked(&self, id: &str) -> Result<Option<String>> {
        self.require(id)?;
        match self.load_config(id)? {
            Some(text) => gateway_config::read_token(&text)
                .map_err(|e| FleetError::InvalidInput(format!("config for '{}': {}", id, e))),
            None => Ok(None),
        }
    }

    /// Write a fresh token into `gateway.auth.token`, leaving every other byte
    /// of the config as it was. Does not restart the instance.
    pub async fn regenerate_token(&self, id: &str) -> Result<TokenRotation> {
        let _fleet = self.state.fleet_lock.read().await;
        self.require(id)?;
        let text = self.load_config(id)?.ok_or_else(|| {
            FleetError::PreconditionFailed(format!("instance '{}' has no config file", id))
        })?;

        let token = gateway_config::generate_token();
        let edited = gateway_config::replace_token(&text, &token)
            .map_err(|e| FleetError::InvalidInput(format!("config for '{}': {}", id, e)))?;
        filesystem::write_config(&self.state.config.instances_dir(), id, &edited)?;
        tracing::info!("rotated gateway token for instance {}", id);

        Ok(TokenRotation {
            token,
            restart_required: true,
        })
    }

    /// Devices known to the instance's gateway, pending and paired.
    pub async fn list_devices(&self, id: &str) -> Result<serde_json::Value> {
        let _fleet = self.state.fleet_lock.read().await;
        let token = self.pairing_token(id)?;
        self.exec_gateway_json(id, &["devices", "list", "--json"], &token)
            .await
    }

    /// Approve a pending pairing request.
    pub async fn approve_device(&self, id: &str, request_id: &str) -> Result<serde_json::Value> {
        let request_id = request_id.trim();
        if request_id.is_empty() {
            return Err(FleetError::InvalidInput("request id must not be empty".into()));
        }
        let _fleet = self.state.fleet_lock.read().await;
        let token = self.pairing_token(id)?;
        let result = self
            .exec_gateway_json(id, &["devices", "approve", request_id, "--json"], &token)
            .await?;
        tracing::info!("approved device request {} on instance {}", request_id, id);
        Ok(result)
    }

    /// Pairing commands talk to the live gateway, so the instance must be
    /// running and must have a token configured.
    fn pairing_token(&self, id: &str) -> Result<String> {
        let instance = self.require(id)?;
        if instance.status != InstanceStatus::Running {
            return Err(FleetError::PreconditionFailed(format!(
                "instance '{}' is {}, device pairing needs it running",
                id, instance.status
            )));
        }
        self.token_locked(id)?.ok_or_else(|| {
            FleetError::PreconditionFailed(format!(
                "instance '{}' has no gateway token configured",
                id
            ))
        })
    }

    async fn exec_gateway_json(
        &self,
        id: &str,
        args: &[&str],
        token: &str,
    ) -> Result<serde_json::Value> {
        let raw = self.state.runtime.exec_json(id, args, token).await?;
        serde_json::from_str(raw.trim()).map_err(|e| {
            FleetError::external(
                format!("{} {}", self.state.config.instance_cli, args.join(" ")),
                format!("output is not JSON ({}): {}", e, truncate(raw.trim(), 200)),
            )
        })
    }

    fn load_config(&self, id: &str) -> Result<Option<String>> {
        Ok(filesystem::read_config(&self.state.config.instances_dir(), id)?)
    }
}

fn truncate(s: &str, max_chars: usize) -> String {
    match s.char_indices().nth(max_chars) {
        Some((idx, _)) => format!("{}...", &s[..idx]),
        None => s.to_string(),
    }
}
