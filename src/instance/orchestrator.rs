use serde::Serialize;

use crate::db::registry::InsertOutcome;
use crate::docker::LogStream;
use crate::error::{FleetError, Result};
use crate::instance::{
    allocator, filesystem, gateway_config, jsonc, manifest, validate_id, validate_name,
    validate_password, Instance, InstanceStatus,
};
use crate::state::SharedState;

/// Allocation attempts before a port race is reported as `Conflict`.
const CREATE_ATTEMPTS: usize = 3;

pub struct CreateInstance {
    pub id: String,
    pub name: String,
    pub password: String,
}

#[derive(Debug, Clone, Serialize)]
pub struct FleetStatus {
    pub runtime_healthy: bool,
    pub base_port: u16,
    pub instances: usize,
    pub running: usize,
}

/// A registry row plus what the runtime reports for its container right now.
#[derive(Debug, Clone, Serialize)]
pub struct InstanceDetail {
    #[serde(flatten)]
    pub instance: Instance,
    /// `running`, `exited`, `not_created`, ...; `unknown` when the runtime
    /// could not be asked.
    pub container_state: String,
}

/// Owns the instance state machine. Every public operation holds the fleet
/// lock shared, so none of them overlap a snapshot or restore.
#[derive(Clone)]
pub struct Orchestrator {
    pub(crate) state: SharedState,
}

impl Orchestrator {
    pub fn new(state: SharedState) -> Self {
        Self { state }
    }

    pub fn list(&self) -> Result<Vec<Instance>> {
        self.state.registry.list_instances()
    }

    pub fn get(&self, id: &str) -> Result<Instance> {
        self.require(id)
    }

    /// `get` plus the live container state. A runtime failure degrades to
    /// `unknown` rather than failing the lookup.
    pub async fn describe(&self, id: &str) -> Result<InstanceDetail> {
        let instance = {
            let _fleet = self.state.fleet_lock.read().await;
            self.require(id)?
        };
        let container_state = match self.state.runtime.container_state(id).await {
            Ok(state) => state,
            Err(e) => {
                tracing::warn!("container state for {} unavailable: {}", id, e);
                "unknown".to_string()
            }
        };
        Ok(InstanceDetail {
            instance,
            container_state,
        })
    }

    /// Provision a new instance.
    ///
    /// Steps:
    /// 1. Validate input and reject a duplicate id
    /// 2. Create `data/` and `data/workspace/`
    /// 3. Write the default config with a fresh token and the password
    /// 4. Allocate a port pair and regenerate the manifest with the pending instance
    /// 5. Insert the row; a port race re-allocates, up to 3 attempts
    ///
    /// Any failure after step 2 removes the instance tree and re-syncs the
    /// manifest, so a row never exists without its config.
    pub async fn create(&self, input: CreateInstance) -> Result<Instance> {
        validate_id(&input.id)?;
        validate_name(&input.name)?;
        validate_password(&input.password)?;

        let _fleet = self.state.fleet_lock.read().await;
        let _manifest = self.state.manifest_lock.lock().await;

        let id = input.id.as_str();
        if self.state.registry.get_instance(id)?.is_some() {
            return Err(FleetError::Conflict(format!("instance '{}' already exists", id)));
        }
        let instances_dir = self.state.config.instances_dir();
        let dir = filesystem::instance_dir(&instances_dir, id);
        if dir.exists() {
            return Err(FleetError::Conflict(format!(
                "directory {} already exists; remove it or choose another id",
                dir.display()
            )));
        }

        match self.provision(&input).await {
            Ok(instance) => {
                tracing::info!(
                    "created instance {} on ports {}/{}",
                    instance.id,
                    instance.port,
                    instance.bridge_port()
                );
                Ok(instance)
            }
            Err(e) => {
                tracing::error!("create {} failed, rolling back: {}", id, e);
                self.rollback_filesystem(id);
                if let Err(sync_err) = self.sync_manifest_locked(None) {
                    tracing::error!("manifest re-sync after failed create: {}", sync_err);
                }
                Err(e)
            }
        }
    }

    /// Caller holds the manifest lock.
    async fn provision(&self, input: &CreateInstance) -> Result<Instance> {
        let instances_dir = self.state.config.instances_dir();
        filesystem::create_instance_dirs(&instances_dir, &input.id)?;
        let config_text =
            gateway_config::render_default_config(&gateway_config::generate_token(), &input.password);
        filesystem::write_config(&instances_dir, &input.id, &config_text)?;

        for attempt in 1..=CREATE_ATTEMPTS {
            let used = self.state.registry.instance_ports()?;
            let port = allocator::next_port_pair(&used, self.state.config.port_range)?;
            let instance = Instance::new(&input.id, &input.name, port);
            self.sync_manifest_locked(Some(&instance))?;

            match self.state.registry.insert_instance(&instance)? {
                InsertOutcome::Inserted => return Ok(instance),
                InsertOutcome::IdTaken => {
                    return Err(FleetError::Conflict(format!(
                        "instance '{}' already exists",
                        input.id
                    )))
                }
                InsertOutcome::PortTaken => {
                    tracing::warn!(
                        "port {} taken concurrently for {} (attempt {}/{}), reallocating",
                        port,
                        input.id,
                        attempt,
                        CREATE_ATTEMPTS
                    );
                }
            }
        }
        Err(FleetError::Conflict(format!(
            "could not reserve a port pair for '{}' after {} attempts",
            input.id, CREATE_ATTEMPTS
        )))
    }

    fn rollback_filesystem(&self, id: &str) {
        if let Err(e) = filesystem::remove_instance_dirs(&self.state.config.instances_dir(), id) {
            tracing::error!("rollback: failed to remove dirs for {}: {}", id, e);
        }
    }

    pub async fn start(&self, id: &str) -> Result<Instance> {
        let _fleet = self.state.fleet_lock.read().await;
        self.start_unguarded(id).await
    }

    pub async fn stop(&self, id: &str) -> Result<Instance> {
        let _fleet = self.state.fleet_lock.read().await;
        self.stop_unguarded(id).await
    }

    /// `start` for callers that already hold the fleet lock.
    pub(crate) async fn start_unguarded(&self, id: &str) -> Result<Instance> {
        self.require(id)?;
        self.sync_manifest().await?;
        let outcome = self.state.runtime.start(id).await;
        self.record_outcome(id, outcome, InstanceStatus::Running)
    }

    /// `stop` for callers that already hold the fleet lock.
    pub(crate) async fn stop_unguarded(&self, id: &str) -> Result<Instance> {
        self.require(id)?;
        self.sync_manifest().await?;
        let outcome = self.state.runtime.stop(id).await;
        self.record_outcome(id, outcome, InstanceStatus::Stopped)
    }

    /// Persist the result of a runtime call: `success` on Ok, `error` on Err.
    /// The runtime error is returned even when the status write succeeds.
    fn record_outcome(
        &self,
        id: &str,
        outcome: Result<()>,
        success: InstanceStatus,
    ) -> Result<Instance> {
        match outcome {
            Ok(()) => {
                self.set_status(id, success)?;
                tracing::info!("instance {} is now {}", id, success);
                self.require(id)
            }
            Err(e) => {
                tracing::error!("runtime call for {} failed: {}", id, e);
                if let Err(status_err) = self.set_status(id, InstanceStatus::Error) {
                    tracing::error!("failed to mark {} as error: {}", id, status_err);
                }
                Err(e)
            }
        }
    }

    pub(crate) fn set_status(&self, id: &str, status: InstanceStatus) -> Result<()> {
        if !self.state.registry.update_status(id, status)? {
            return Err(FleetError::NotFound(format!("instance '{}'", id)));
        }
        Ok(())
    }

    /// Run the one-shot provisioning command. Needs the data directory but
    /// not a running container.
    pub async fn init(&self, id: &str) -> Result<String> {
        let _fleet = self.state.fleet_lock.read().await;
        self.require(id)?;
        let data_dir = filesystem::data_dir(&self.state.config.instances_dir(), id);
        if !data_dir.is_dir() {
            return Err(FleetError::PreconditionFailed(format!(
                "data directory {} does not exist",
                data_dir.display()
            )));
        }
        self.sync_manifest().await?;
        match self.state.runtime.init(id).await {
            Ok(output) => {
                tracing::info!("initialized instance {}", id);
                Ok(output)
            }
            Err(e) => {
                tracing::error!("init {} failed: {}", id, e);
                if let Err(status_err) = self.set_status(id, InstanceStatus::Error) {
                    tracing::error!("failed to mark {} as error: {}", id, status_err);
                }
                Err(e)
            }
        }
    }

    /// Remove the container, optionally the on-disk tree, then the row. The
    /// manifest is regenerated after the row is gone.
    pub async fn delete(&self, id: &str, keep_data: bool) -> Result<()> {
        let _fleet = self.state.fleet_lock.read().await;
        self.require(id)?;

        if let Err(e) = self.state.runtime.remove(id).await {
            tracing::error!("container removal for {} failed: {}", id, e);
            if let Err(status_err) = self.set_status(id, InstanceStatus::Error) {
                tracing::error!("failed to mark {} as error: {}", id, status_err);
            }
            return Err(e);
        }

        if !keep_data {
            filesystem::remove_instance_dirs(&self.state.config.instances_dir(), id)?;
        }

        let _manifest = self.state.manifest_lock.lock().await;
        self.state.registry.delete_instance(id)?;
        self.sync_manifest_locked(None)?;
        tracing::info!("deleted instance {} (keep_data={})", id, keep_data);
        Ok(())
    }

    pub async fn logs(&self, id: &str) -> Result<LogStream> {
        {
            let _fleet = self.state.fleet_lock.read().await;
            self.require(id)?;
        }
        self.state.runtime.stream_logs(id).await
    }

    /// Raw config text. A commented template stands in for a missing file.
    pub async fn read_config(&self, id: &str) -> Result<String> {
        let _fleet = self.state.fleet_lock.read().await;
        self.require(id)?;
        let text = filesystem::read_config(&self.state.config.instances_dir(), id)?;
        Ok(text.unwrap_or_else(|| gateway_config::render_placeholder_config(id)))
    }

    /// Replace the config after checking it parses with the relaxed syntax.
    pub async fn write_config(&self, id: &str, text: &str) -> Result<()> {
        let _fleet = self.state.fleet_lock.read().await;
        self.require(id)?;
        jsonc::parse(text)
            .map_err(|e| FleetError::InvalidInput(format!("config for '{}': {}", id, e)))?;
        filesystem::write_config(&self.state.config.instances_dir(), id, text)?;
        tracing::info!("updated config for instance {}", id);
        Ok(())
    }

    pub async fn fleet_status(&self) -> Result<FleetStatus> {
        let instances = self.list()?;
        let running = instances
            .iter()
            .filter(|i| i.status == InstanceStatus::Running)
            .count();
        Ok(FleetStatus {
            runtime_healthy: self.state.runtime.health_check().await,
            base_port: self.state.config.base_port(),
            instances: instances.len(),
            running,
        })
    }

    pub fn port_overview(&self, count: usize) -> Result<allocator::PortOverview> {
        let used = self.state.registry.instance_ports()?;
        Ok(allocator::port_overview(
            &used,
            self.state.config.port_range,
            count,
        ))
    }

    pub(crate) fn require(&self, id: &str) -> Result<Instance> {
        self.state
            .registry
            .get_instance(id)?
            .ok_or_else(|| FleetError::NotFound(format!("instance '{}'", id)))
    }

    /// Regenerate the manifest from the registry.
    pub(crate) async fn sync_manifest(&self) -> Result<()> {
        let _manifest = self.state.manifest_lock.lock().await;
        self.sync_manifest_locked(None)
    }

    /// Caller holds the manifest lock. `pending` is rendered alongside the
    /// registered instances.
    fn sync_manifest_locked(&self, pending: Option<&Instance>) -> Result<()> {
        let mut instances = self.state.registry.list_instances()?;
        if let Some(p) = pending {
            instances.retain(|i| i.id != p.id);
            instances.push(p.clone());
        }
        let text = manifest::render_manifest(&instances, &self.state.config)?;
        manifest::write_manifest(&self.state.config.manifest_path(), &text)?;
        tracing::debug!("manifest regenerated with {} services", instances.len());
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::ErrorKind;
    use crate::state::test_support::TestFleet;
    use futures_util::StreamExt;
    use std::collections::HashSet;

    fn input(id: &str, name: &str) -> CreateInstance {
        CreateInstance {
            id: id.to_string(),
            name: name.to_string(),
            password: "s3cret".to_string(),
        }
    }

    fn manifest_ids(fleet: &TestFleet) -> Vec<String> {
        let text = std::fs::read_to_string(fleet.state.config.manifest_path()).unwrap();
        manifest::service_ids(&text)
    }

    #[tokio::test]
    async fn scenario_create_start_stop_delete() {
        let fleet = TestFleet::new();
        let orch = Orchestrator::new(fleet.state.clone());

        let a1 = orch.create(input("a1", "Agent One")).await.unwrap();
        assert_eq!(a1.port, 18789);
        assert_eq!(a1.status, InstanceStatus::Created);

        let b2 = orch.create(input("b2", "Agent Two")).await.unwrap();
        assert_eq!(b2.port, 18791);
        assert_eq!(b2.status, InstanceStatus::Created);

        assert_eq!(orch.start("a1").await.unwrap().status, InstanceStatus::Running);
        assert_eq!(orch.stop("a1").await.unwrap().status, InstanceStatus::Stopped);

        let b2_dir = fleet.state.config.instances_dir().join("b2");
        assert!(b2_dir.exists());
        orch.delete("b2", false).await.unwrap();
        let ids: Vec<String> = orch.list().unwrap().into_iter().map(|i| i.id).collect();
        assert_eq!(ids, vec!["a1".to_string()]);
        assert!(!b2_dir.exists());
        assert_eq!(manifest_ids(&fleet), vec!["a1".to_string()]);

        let err = orch.list_devices("a1").await.unwrap_err();
        assert_eq!(err.kind(), ErrorKind::PreconditionFailed);
    }

    #[tokio::test]
    async fn create_writes_config_and_manifest() {
        let fleet = TestFleet::new();
        let orch = Orchestrator::new(fleet.state.clone());
        orch.create(input("a1", "Agent One")).await.unwrap();

        let text = orch.read_config("a1").await.unwrap();
        let value: serde_json::Value = serde_json::from_str(&text).unwrap();
        assert_eq!(value["gateway"]["auth"]["password"], "s3cret");
        assert_eq!(value["gateway"]["auth"]["token"].as_str().unwrap().len(), 64);
        assert!(fleet
            .state
            .config
            .instances_dir()
            .join("a1/data/workspace")
            .is_dir());
        assert!(manifest_ids(&fleet).contains(&"a1".to_string()));
    }

    #[tokio::test]
    async fn create_rejects_duplicates_and_bad_input() {
        let fleet = TestFleet::new();
        let orch = Orchestrator::new(fleet.state.clone());
        orch.create(input("a1", "Agent One")).await.unwrap();

        let err = orch.create(input("a1", "Again")).await.unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Conflict);
        let err = orch.create(input("bad id", "x")).await.unwrap_err();
        assert_eq!(err.kind(), ErrorKind::InvalidInput);

        let mut no_password = input("c3", "C");
        no_password.password.clear();
        assert_eq!(
            orch.create(no_password).await.unwrap_err().kind(),
            ErrorKind::InvalidInput
        );
        assert!(!fleet.state.config.instances_dir().join("c3").exists());
        assert_eq!(orch.list().unwrap().len(), 1);
    }

    #[tokio::test]
    async fn failed_create_leaves_no_row_or_dirs() {
        let fleet = TestFleet::with_config(|c| c.port_range = [18789, 18790]);
        let orch = Orchestrator::new(fleet.state.clone());
        orch.create(input("a1", "A")).await.unwrap();

        let err = orch.create(input("b2", "B")).await.unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Conflict);
        assert!(orch.get("b2").is_err());
        assert!(!fleet.state.config.instances_dir().join("b2").exists());
        assert_eq!(manifest_ids(&fleet), vec!["a1".to_string()]);
    }

    #[tokio::test]
    async fn concurrent_creates_get_disjoint_pairs() {
        let fleet = TestFleet::new();
        let orch = Orchestrator::new(fleet.state.clone());

        let mut handles = Vec::new();
        for i in 0..8 {
            let orch = orch.clone();
            handles.push(tokio::spawn(async move {
                orch.create(input(&format!("i{i}"), "Parallel")).await
            }));
        }
        let mut ports = HashSet::new();
        for h in handles {
            let inst = h.await.unwrap().unwrap();
            assert!(ports.insert(inst.port));
            assert!(!ports.contains(&(inst.port + 1)));
        }
        let mut sorted: Vec<u16> = ports.into_iter().collect();
        sorted.sort_unstable();
        for pair in sorted.windows(2) {
            assert!(pair[1] - pair[0] >= 2);
        }
    }

    #[tokio::test]
    async fn start_failure_marks_error_and_returns_it() {
        let fleet = TestFleet::new();
        let orch = Orchestrator::new(fleet.state.clone());
        orch.create(input("a1", "A")).await.unwrap();
        fleet.runtime.fail("start", "a1");

        let err = orch.start("a1").await.unwrap_err();
        assert_eq!(err.kind(), ErrorKind::ExternalToolFailure);
        assert_eq!(orch.get("a1").unwrap().status, InstanceStatus::Error);

        fleet.runtime.clear_failures();
        assert_eq!(orch.start("a1").await.unwrap().status, InstanceStatus::Running);
    }

    #[tokio::test]
    async fn describe_reports_live_container_state() {
        let fleet = TestFleet::new();
        let orch = Orchestrator::new(fleet.state.clone());
        orch.create(input("a1", "A")).await.unwrap();

        assert_eq!(orch.describe("a1").await.unwrap().container_state, "not_created");
        orch.start("a1").await.unwrap();
        let detail = orch.describe("a1").await.unwrap();
        assert_eq!(detail.container_state, "running");
        assert_eq!(detail.instance.status, InstanceStatus::Running);

        fleet.runtime.fail("state", "a1");
        assert_eq!(orch.describe("a1").await.unwrap().container_state, "unknown");
        assert_eq!(orch.describe("ghost").await.unwrap_err().kind(), ErrorKind::NotFound);

        let json = serde_json::to_value(&detail).unwrap();
        assert_eq!(json["id"], "a1");
        assert_eq!(json["container_state"], "running");
    }

    #[tokio::test]
    async fn unknown_instance_is_not_found() {
        let fleet = TestFleet::new();
        let orch = Orchestrator::new(fleet.state.clone());
        assert_eq!(orch.start("ghost").await.unwrap_err().kind(), ErrorKind::NotFound);
        assert_eq!(orch.stop("ghost").await.unwrap_err().kind(), ErrorKind::NotFound);
        assert_eq!(
            orch.delete("ghost", false).await.unwrap_err().kind(),
            ErrorKind::NotFound
        );
        assert!(fleet.runtime.calls().is_empty());
    }

    #[tokio::test]
    async fn start_regenerates_missing_manifest() {
        let fleet = TestFleet::new();
        let orch = Orchestrator::new(fleet.state.clone());
        orch.create(input("a1", "A")).await.unwrap();
        std::fs::remove_file(fleet.state.config.manifest_path()).unwrap();

        orch.start("a1").await.unwrap();
        assert!(manifest_ids(&fleet).contains(&"a1".to_string()));
    }

    #[tokio::test]
    async fn delete_keep_data_preserves_directory() {
        let fleet = TestFleet::new();
        let orch = Orchestrator::new(fleet.state.clone());
        orch.create(input("a1", "A")).await.unwrap();

        orch.delete("a1", true).await.unwrap();
        assert!(orch.list().unwrap().is_empty());
        assert!(fleet.state.config.instances_dir().join("a1/data").is_dir());
        assert_eq!(fleet.runtime.calls_for("remove"), vec!["a1".to_string()]);
        assert!(manifest_ids(&fleet).is_empty());
    }

    #[tokio::test]
    async fn init_requires_data_dir_and_marks_error_on_failure() {
        let fleet = TestFleet::new();
        let orch = Orchestrator::new(fleet.state.clone());
        orch.create(input("a1", "A")).await.unwrap();

        let output = orch.init("a1").await.unwrap();
        assert!(output.contains("a1"));

        fleet.runtime.fail("init", "a1");
        assert!(orch.init("a1").await.is_err());
        assert_eq!(orch.get("a1").unwrap().status, InstanceStatus::Error);

        std::fs::remove_dir_all(fleet.state.config.instances_dir().join("a1")).unwrap();
        assert_eq!(
            orch.init("a1").await.unwrap_err().kind(),
            ErrorKind::PreconditionFailed
        );
    }

    #[tokio::test]
    async fn write_config_validates_relaxed_syntax() {
        let fleet = TestFleet::new();
        let orch = Orchestrator::new(fleet.state.clone());
        orch.create(input("a1", "A")).await.unwrap();

        let relaxed = "// edited\n{ gateway: { port: 18789, }, }\n";
        orch.write_config("a1", relaxed).await.unwrap();
        assert_eq!(orch.read_config("a1").await.unwrap(), relaxed);

        let err = orch.write_config("a1", "{ broken").await.unwrap_err();
        assert_eq!(err.kind(), ErrorKind::InvalidInput);
        assert_eq!(orch.read_config("a1").await.unwrap(), relaxed);
    }

    #[tokio::test]
    async fn config_reads_wait_for_the_exclusive_fleet_lock() {
        let fleet = TestFleet::new();
        let orch = Orchestrator::new(fleet.state.clone());
        orch.create(input("a1", "A")).await.unwrap();

        let guard = fleet.state.fleet_lock.write().await;
        let reading = tokio::spawn({
            let orch = orch.clone();
            async move { orch.read_config("a1").await }
        });
        let token = tokio::spawn({
            let orch = orch.clone();
            async move { orch.get_token("a1").await }
        });
        tokio::time::sleep(std::time::Duration::from_millis(100)).await;
        assert!(!reading.is_finished());
        assert!(!token.is_finished());

        drop(guard);
        assert!(reading.await.unwrap().unwrap().contains("gateway"));
        assert!(token.await.unwrap().unwrap().is_some());
    }

    #[tokio::test]
    async fn read_config_falls_back_to_template() {
        let fleet = TestFleet::new();
        let orch = Orchestrator::new(fleet.state.clone());
        orch.create(input("a1", "A")).await.unwrap();
        std::fs::remove_file(fleet.state.config.instances_dir().join("a1/data/openclaw.json"))
            .unwrap();
        assert!(orch.read_config("a1").await.unwrap().starts_with("//"));
    }

    #[tokio::test]
    async fn logs_stream_lines() {
        let fleet = TestFleet::new();
        let orch = Orchestrator::new(fleet.state.clone());
        orch.create(input("a1", "A")).await.unwrap();
        fleet.runtime.set_log_lines(&["booting", "listening on 18789"]);

        let lines: Vec<String> = orch.logs("a1").await.unwrap().collect().await;
        assert_eq!(lines, vec!["booting".to_string(), "listening on 18789".to_string()]);
        assert!(orch.logs("ghost").await.is_err());
    }

    #[tokio::test]
    async fn fleet_status_counts_running() {
        let fleet = TestFleet::new();
        let orch = Orchestrator::new(fleet.state.clone());
        orch.create(input("a1", "A")).await.unwrap();
        orch.create(input("b2", "B")).await.unwrap();
        orch.start("b2").await.unwrap();

        let status = orch.fleet_status().await.unwrap();
        assert!(status.runtime_healthy);
        assert_eq!(status.base_port, 18789);
        assert_eq!(status.instances, 2);
        assert_eq!(status.running, 1);

        let ports = orch.port_overview(2).unwrap();
        assert_eq!(ports.used, vec![18789, 18791]);
        assert_eq!(ports.next_available, vec![18793, 18795]);
    }
}
