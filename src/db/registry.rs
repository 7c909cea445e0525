use anyhow::Context;
use chrono::{DateTime, SecondsFormat, Utc};
use rusqlite::types::Type;
use rusqlite::{params, ErrorCode, OptionalExtension, Row};
use std::path::Path;

use crate::backup::Backup;
use crate::db::{self, pool::DbPool};
use crate::error::Result;
use crate::instance::{Instance, InstanceStatus};

const INSTANCE_COLUMNS: &str = "id, name, port, status, created_at, updated_at";
const BACKUP_COLUMNS: &str = "id, filename, size, instance_count, created_at";

/// Result of inserting an instance row.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InsertOutcome {
    Inserted,
    IdTaken,
    PortTaken,
}

/// System of record for instances and backups.
pub struct Registry {
    db: DbPool,
}

impl Registry {
    /// Open (creating if needed) the registry database and apply migrations.
    pub fn open(path: &Path) -> anyhow::Result<Self> {
        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent)
                    .with_context(|| format!("failed to create db dir: {}", parent.display()))?;
            }
        }
        let path_str = path.to_str().context("database_path is not valid UTF-8")?;
        let db = DbPool::open(path_str, 4).context("failed to open database")?;
        db::run_migrations(&db).context("failed to run database migrations")?;
        Ok(Self { db })
    }

    // ── Instances ──────────────────────────────────────────────────────────

    pub fn list_instances(&self) -> Result<Vec<Instance>> {
        let rows = self.db.read(|conn| {
            let mut stmt = conn.prepare(&format!(
                "SELECT {INSTANCE_COLUMNS} FROM instances ORDER BY created_at, id"
            ))?;
            let rows = stmt
                .query_map([], instance_from_row)?
                .collect::<Result<Vec<_>, _>>()?;
            Ok(rows)
        })?;
        Ok(rows)
    }

    pub fn get_instance(&self, id: &str) -> Result<Option<Instance>> {
        let row = self.db.read(|conn| {
            Ok(conn
                .query_row(
                    &format!("SELECT {INSTANCE_COLUMNS} FROM instances WHERE id = ?1"),
                    [id],
                    instance_from_row,
                )
                .optional()?)
        })?;
        Ok(row)
    }

    pub fn instance_ports(&self) -> Result<Vec<u16>> {
        let ports = self.db.read(|conn| {
            let mut stmt = conn.prepare("SELECT port FROM instances")?;
            let ports = stmt
                .query_map([], |row| row.get::<_, u16>(0))?
                .collect::<Result<Vec<_>, _>>()
                .context("failed to decode instance port")?;
            Ok(ports)
        })?;
        Ok(ports)
    }

    /// Insert a new instance row. Unique-constraint violations are reported as
    /// an outcome rather than an error so the caller can re-allocate.
    pub fn insert_instance(&self, instance: &Instance) -> Result<InsertOutcome> {
        let outcome = self.db.write(|conn| {
            let res = conn.execute(
                &format!(
                    "INSERT INTO instances ({INSTANCE_COLUMNS}) VALUES (?1, ?2, ?3, ?4, ?5, ?6)"
                ),
                params![
                    instance.id,
                    instance.name,
                    instance.port as i64,
                    instance.status.as_str(),
                    format_ts(&instance.created_at),
                    format_ts(&instance.updated_at),
                ],
            );
            match res {
                Ok(_) => Ok(InsertOutcome::Inserted),
                Err(rusqlite::Error::SqliteFailure(err, msg))
                    if err.code == ErrorCode::ConstraintViolation =>
                {
                    let msg = msg.unwrap_or_default();
                    if msg.contains("instances.port") {
                        Ok(InsertOutcome::PortTaken)
                    } else if msg.contains("instances.id") {
                        Ok(InsertOutcome::IdTaken)
                    } else {
                        Err(anyhow::anyhow!("constraint violation: {}", msg))
                    }
                }
                Err(e) => Err(e.into()),
            }
        })?;
        Ok(outcome)
    }

    /// Set the status of an instance and bump `updated_at`.
    /// Returns `false` when no such instance exists.
    pub fn update_status(&self, id: &str, status: InstanceStatus) -> Result<bool> {
        let now = format_ts(&Utc::now());
        let changed = self.db.write(|conn| {
            Ok(conn.execute(
                "UPDATE instances SET status = ?1, updated_at = ?2 WHERE id = ?3",
                params![status.as_str(), now, id],
            )?)
        })?;
        Ok(changed > 0)
    }

    pub fn delete_instance(&self, id: &str) -> Result<bool> {
        let deleted = self
            .db
            .write(|conn| Ok(conn.execute("DELETE FROM instances WHERE id = ?1", [id])?))?;
        Ok(deleted > 0)
    }

    // ── Backups ────────────────────────────────────────────────────────────

    /// All backups, newest first.
    pub fn list_backups(&self) -> Result<Vec<Backup>> {
        let rows = self.db.read(|conn| {
            let mut stmt = conn.prepare(&format!(
                "SELECT {BACKUP_COLUMNS} FROM backups ORDER BY created_at DESC, id DESC"
            ))?;
            let rows = stmt
                .query_map([], backup_from_row)?
                .collect::<Result<Vec<_>, _>>()?;
            Ok(rows)
        })?;
        Ok(rows)
    }

    pub fn get_backup(&self, id: i64) -> Result<Option<Backup>> {
        let row = self.db.read(|conn| {
            Ok(conn
                .query_row(
                    &format!("SELECT {BACKUP_COLUMNS} FROM backups WHERE id = ?1"),
                    [id],
                    backup_from_row,
                )
                .optional()?)
        })?;
        Ok(row)
    }

    pub fn insert_backup(
        &self,
        filename: &str,
        size: u64,
        instance_count: u32,
        created_at: DateTime<Utc>,
    ) -> Result<Backup> {
        let id = self.db.write(|conn| {
            conn.execute(
                "INSERT INTO backups (filename, size, instance_count, created_at)
                 VALUES (?1, ?2, ?3, ?4)",
                params![
                    filename,
                    size as i64,
                    instance_count as i64,
                    format_ts(&created_at)
                ],
            )?;
            Ok(conn.last_insert_rowid())
        })?;
        Ok(Backup {
            id,
            filename: filename.to_string(),
            size,
            instance_count,
            created_at,
        })
    }

    pub fn delete_backup(&self, id: i64) -> Result<bool> {
        let deleted = self
            .db
            .write(|conn| Ok(conn.execute("DELETE FROM backups WHERE id = ?1", [id])?))?;
        Ok(deleted > 0)
    }

    /// Replace the whole backup catalog in one transaction, keeping ids.
    pub fn replace_backups(&self, backups: &[Backup]) -> Result<()> {
        self.db.write(|conn| {
            let tx = conn.unchecked_transaction()?;
            tx.execute("DELETE FROM backups", [])?;
            for b in backups {
                tx.execute(
                    &format!("INSERT INTO backups ({BACKUP_COLUMNS}) VALUES (?1, ?2, ?3, ?4, ?5)"),
                    params![
                        b.id,
                        b.filename,
                        b.size as i64,
                        b.instance_count as i64,
                        format_ts(&b.created_at)
                    ],
                )?;
            }
            tx.commit()?;
            Ok(())
        })?;
        Ok(())
    }

    // ── Whole-store snapshot ───────────────────────────────────────────────

    pub fn snapshot_to(&self, dest: &Path) -> anyhow::Result<()> {
        self.db.backup_to(dest)
    }

    pub fn restore_from(&self, source: &Path) -> anyhow::Result<()> {
        self.db.restore_from(source)?;
        // Archives taken before a schema change still need the latest tables.
        db::run_migrations(&self.db)?;
        Ok(())
    }
}

fn format_ts(ts: &DateTime<Utc>) -> String {
    ts.to_rfc3339_opts(SecondsFormat::Micros, true)
}

fn parse_ts(idx: usize, raw: String) -> rusqlite::Result<DateTime<Utc>> {
    DateTime::parse_from_rfc3339(&raw)
        .map(|ts| ts.with_timezone(&Utc))
        .map_err(|e| rusqlite::Error::FromSqlConversionFailure(idx, Type::Text, Box::new(e)))
}

fn instance_from_row(row: &Row<'_>) -> rusqlite::Result<Instance> {
    let port = row.get::<_, i64>(2)?;
    let status: String = row.get(3)?;
    Ok(Instance {
        id: row.get(0)?,
        name: row.get(1)?,
        port: u16::try_from(port)
            .map_err(|e| rusqlite::Error::FromSqlConversionFailure(2, Type::Integer, Box::new(e)))?,
        status: status
            .parse()
            .map_err(|e| rusqlite::Error::FromSqlConversionFailure(3, Type::Text, Box::new(e)))?,
        created_at: parse_ts(4, row.get(4)?)?,
        updated_at: parse_ts(5, row.get(5)?)?,
    })
}

fn backup_from_row(row: &Row<'_>) -> rusqlite::Result<Backup> {
    Ok(Backup {
        id: row.get(0)?,
        filename: row.get(1)?,
        size: row.get::<_, i64>(2)?.max(0) as u64,
        instance_count: row.get::<_, i64>(3)?.max(0) as u32,
        created_at: parse_ts(4, row.get(4)?)?,
    })
}
