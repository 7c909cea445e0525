pub mod archive;

use anyhow::Context;
use chrono::{DateTime, Utc};
use serde::Serialize;
use std::path::{Path, PathBuf};

use crate::error::{FleetError, Result};
use crate::instance::orchestrator::Orchestrator;
use crate::instance::{Instance, InstanceStatus};
use crate::state::SharedState;

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Backup {
    pub id: i64,
    pub filename: String,
    /// Bytes archived, before compression.
    pub size: u64,
    pub instance_count: u32,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize)]
pub struct RestoreReport {
    pub backup_id: i64,
    pub instances: usize,
    pub restarted: Vec<String>,
    pub failed: Vec<String>,
}

/// Fleet-wide snapshot and restore. Both hold the fleet lock exclusively for
/// their whole run, so no instance operation interleaves with them.
pub struct BackupCoordinator {
    state: SharedState,
    orchestrator: Orchestrator,
}

impl BackupCoordinator {
    pub fn new(state: SharedState) -> Self {
        let orchestrator = Orchestrator::new(state.clone());
        Self {
            state,
            orchestrator,
        }
    }

    pub fn list_backups(&self) -> Result<Vec<Backup>> {
        self.state.registry.list_backups()
    }

    /// Stop running instances, archive the instance tree and the registry,
    /// then bring the same instances back up.
    ///
    /// The registry keeps `running` for the stopped instances, so the archive
    /// records what was running. Restart happens even when archiving fails;
    /// the archive error is returned afterwards.
    pub async fn snapshot(&self) -> Result<Backup> {
        let _fleet = self.state.fleet_lock.write().await;
        let instances = self.state.registry.list_instances()?;
        let running: Vec<&str> = instances
            .iter()
            .filter(|i| i.status == InstanceStatus::Running)
            .map(|i| i.id.as_str())
            .collect();
        tracing::info!(
            "snapshot: {} instances, stopping {} running",
            instances.len(),
            running.len()
        );

        let mut stopped = Vec::with_capacity(running.len());
        for id in &running {
            if let Err(e) = self.state.runtime.stop(id).await {
                tracing::error!("snapshot: stop {} failed, aborting: {}", id, e);
                self.restart(&stopped).await;
                return Err(e);
            }
            stopped.push(id.to_string());
        }

        let archived = self.write_archive().await;
        self.restart(&stopped).await;
        let (filename, summary, created_at) = archived?;

        let backup = self.state.registry.insert_backup(
            &filename,
            summary.size,
            instances.len() as u32,
            created_at,
        )?;
        tracing::info!(
            "snapshot {} written: {} files, {} bytes",
            backup.filename,
            summary.files,
            backup.size
        );
        Ok(backup)
    }

    async fn write_archive(&self) -> Result<(String, archive::ArchiveSummary, DateTime<Utc>)> {
        let backup_dir = self.state.config.backup_dir();
        std::fs::create_dir_all(&backup_dir)
            .with_context(|| format!("failed to create backup dir: {}", backup_dir.display()))?;

        let created_at = Utc::now();
        let filename = unique_filename(&backup_dir, &created_at);
        let dest = backup_dir.join(&filename);
        let db_copy = backup_dir.join(format!(".registry-{}.db", uuid::Uuid::new_v4()));

        let result = async {
            self.state.registry.snapshot_to(&db_copy)?;
            let instances_dir = self.state.config.instances_dir();
            let dest = dest.clone();
            let db = db_copy.clone();
            let summary = tokio::task::spawn_blocking(move || archive::pack(&dest, &instances_dir, &db))
                .await
                .context("archive task panicked")??;
            Ok::<_, anyhow::Error>(summary)
        }
        .await;

        for suffix in ["", "-wal", "-shm"] {
            let mut path = db_copy.clone().into_os_string();
            path.push(suffix);
            let _ = std::fs::remove_file(PathBuf::from(path));
        }
        let summary = result?;
        Ok((filename, summary, created_at))
    }

    /// Start each instance, recording `running` or `error`. Failures are
    /// logged and returned.
    async fn restart(&self, ids: &[String]) -> Vec<String> {
        let mut failed = Vec::new();
        for id in ids {
            if let Err(e) = self.orchestrator.start_unguarded(id).await {
                tracing::error!("restart {} failed: {}", id, e);
                failed.push(id.clone());
            }
        }
        failed
    }

    /// Replace the live fleet with the contents of a backup.
    ///
    /// Steps:
    /// 1. Check the row and its archive exist
    /// 2. Stop every running instance; a failed stop restarts the ones
    ///    already stopped and aborts before anything is overwritten
    /// 3. Unpack into a staging dir and copy `instances/` over the live tree
    /// 4. Restore the registry, keeping the current backup catalog
    /// 5. Remove containers of instances absent from the archive
    /// 6. Regenerate the manifest and restart
    ///
    /// With `restart_all_on_restore` every restored instance is started;
    /// otherwise only those the archive recorded as running.
    pub async fn restore(&self, backup_id: i64) -> Result<RestoreReport> {
        let _fleet = self.state.fleet_lock.write().await;
        let backup = self
            .state
            .registry
            .get_backup(backup_id)?
            .ok_or_else(|| FleetError::NotFound(format!("backup {}", backup_id)))?;
        let archive_path = self.state.config.backup_dir().join(&backup.filename);
        if !archive_path.is_file() {
            return Err(FleetError::InvariantViolation(format!(
                "backup {} references missing archive {}",
                backup_id,
                archive_path.display()
            )));
        }

        let before = self.state.registry.list_instances()?;
        let mut stopped = Vec::new();
        for inst in before.iter().filter(|i| i.status == InstanceStatus::Running) {
            if let Err(e) = self.state.runtime.stop(&inst.id).await {
                tracing::error!("restore: stop {} failed, aborting: {}", inst.id, e);
                self.restart(&stopped).await;
                return Err(e);
            }
            stopped.push(inst.id.clone());
        }

        let staging = self
            .state
            .config
            .backup_dir()
            .join(format!(".restore-{}", uuid::Uuid::new_v4()));
        let applied = self.apply_archive(&archive_path, &staging).await;
        if let Err(e) = std::fs::remove_dir_all(&staging) {
            tracing::debug!("staging cleanup {}: {}", staging.display(), e);
        }
        if let Err(e) = applied {
            tracing::error!("restore of backup {} failed: {}", backup_id, e);
            self.restart(&stopped).await;
            return Err(e);
        }

        let restored = self.state.registry.list_instances()?;
        self.remove_vanished(&before, &restored).await;
        self.orchestrator.sync_manifest().await?;

        let targets: Vec<String> = restored
            .iter()
            .filter(|i| self.state.config.restart_all_on_restore || i.status == InstanceStatus::Running)
            .map(|i| i.id.clone())
            .collect();
        let failed = self.restart(&targets).await;
        let restarted = targets
            .into_iter()
            .filter(|id| !failed.contains(id))
            .collect();

        tracing::info!(
            "restored backup {} ({} instances, {} failed to start)",
            backup.filename,
            restored.len(),
            failed.len()
        );
        Ok(RestoreReport {
            backup_id,
            instances: restored.len(),
            restarted,
            failed,
        })
    }

    /// Unpack and overwrite. Nothing live is touched until the archive has
    /// been fully unpacked and checked.
    async fn apply_archive(&self, archive_path: &Path, staging: &Path) -> Result<()> {
        let src = archive_path.to_path_buf();
        let dst = staging.to_path_buf();
        tokio::task::spawn_blocking(move || archive::unpack(&src, &dst))
            .await
            .context("unpack task panicked")??;

        let staged_db = staging.join(archive::DATABASE_ENTRY);
        if !staged_db.is_file() {
            return Err(FleetError::InvariantViolation(format!(
                "archive {} has no registry snapshot",
                archive_path.display()
            )));
        }

        let staged_instances: PathBuf = staging.join(archive::INSTANCES_ENTRY);
        if staged_instances.is_dir() {
            let live = self.state.config.instances_dir();
            let copied = tokio::task::spawn_blocking(move || archive::copy_tree(&staged_instances, &live))
                .await
                .context("copy task panicked")??;
            tracing::debug!("restore: copied {} files into instances/", copied);
        }

        let catalog = self.state.registry.list_backups()?;
        self.state.registry.restore_from(&staged_db)?;
        self.state.registry.replace_backups(&catalog)?;
        Ok(())
    }

    /// Containers of instances that exist now but not in the archive would
    /// otherwise linger outside the manifest. Their directories stay on disk.
    async fn remove_vanished(&self, before: &[Instance], restored: &[Instance]) {
        for inst in before {
            if restored.iter().any(|r| r.id == inst.id) {
                continue;
            }
            match self.state.runtime.remove(&inst.id).await {
                Ok(()) => tracing::info!(
                    "restore: removed container of {} (not in backup, data kept)",
                    inst.id
                ),
                Err(e) => tracing::warn!("restore: failed to remove {}: {}", inst.id, e),
            }
        }
    }

    /// Delete the archive and its row. A missing archive is logged and the
    /// row is removed anyway.
    pub async fn delete_backup(&self, backup_id: i64) -> Result<()> {
        let _fleet = self.state.fleet_lock.read().await;
        let backup = self
            .state
            .registry
            .get_backup(backup_id)?
            .ok_or_else(|| FleetError::NotFound(format!("backup {}", backup_id)))?;
        let path = self.state.config.backup_dir().join(&backup.filename);
        match std::fs::remove_file(&path) {
            Ok(()) => {}
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                tracing::warn!(
                    "backup {} archive {} was already missing; removing record only",
                    backup_id,
                    path.display()
                );
            }
            Err(e) => return Err(e.into()),
        }
        self.state.registry.delete_backup(backup_id)?;
        tracing::info!("deleted backup {} ({})", backup_id, backup.filename);
        Ok(())
    }
}

/// `fleet-backup-<UTC timestamp>.tar.gz`, suffixed `-N` if a snapshot in the
/// same second already claimed the name.
fn unique_filename(backup_dir: &Path, created_at: &DateTime<Utc>) -> String {
    let stem = format!("fleet-backup-{}", created_at.format("%Y%m%dT%H%M%SZ"));
    let mut name = format!("{}.tar.gz", stem);
    let mut n = 1;
    while backup_dir.join(&name).exists() {
        name = format!("{}-{}.tar.gz", stem, n);
        n += 1;
    }
    name
}
