use anyhow::Context;
use rusqlite::backup::Backup;
use rusqlite::Connection;
use std::path::Path;
use std::sync::Mutex;
use std::time::Duration;

pub struct DbPool {
    writer: Mutex<Connection>,
    readers: Vec<Mutex<Connection>>,
}

impl DbPool {
    pub fn open(path: &str, reader_count: usize) -> anyhow::Result<Self> {
        let writer = Connection::open(path)?;
        writer.execute_batch(
            "PRAGMA journal_mode = WAL;
             PRAGMA synchronous = NORMAL;
             PRAGMA foreign_keys = ON;
             PRAGMA busy_timeout = 5000;",
        )?;

        let mut readers = Vec::with_capacity(reader_count.max(1));
        for _ in 0..reader_count.max(1) {
            let r = Connection::open(path)?;
            r.execute_batch(
                "PRAGMA journal_mode = WAL;
                 PRAGMA foreign_keys = ON;
                 PRAGMA busy_timeout = 5000;",
            )?;
            readers.push(Mutex::new(r));
        }

        Ok(Self {
            writer: Mutex::new(writer),
            readers,
        })
    }

    pub fn write<F, T>(&self, f: F) -> anyhow::Result<T>
    where
        F: FnOnce(&Connection) -> anyhow::Result<T>,
    {
        let conn = self
            .writer
            .lock()
            .map_err(|_| anyhow::anyhow!("writer lock poisoned"))?;
        f(&conn)
    }

    pub fn read<F, T>(&self, f: F) -> anyhow::Result<T>
    where
        F: FnOnce(&Connection) -> anyhow::Result<T>,
    {
        for reader in &self.readers {
            if let Ok(conn) = reader.try_lock() {
                return f(&conn);
            }
        }
        let conn = self.readers[0]
            .lock()
            .map_err(|_| anyhow::anyhow!("reader lock poisoned"))?;
        f(&conn)
    }

    /// Online copy of the whole database into `dest` (safe with WAL, no downtime).
    pub fn backup_to(&self, dest: &Path) -> anyhow::Result<()> {
        let conn = self
            .writer
            .lock()
            .map_err(|_| anyhow::anyhow!("writer lock poisoned"))?;
        let mut target = Connection::open(dest)
            .with_context(|| format!("failed to open backup target {}", dest.display()))?;
        let backup = Backup::new(&conn, &mut target)?;
        backup.run_to_completion(100, Duration::from_millis(50), None)?;
        Ok(())
    }

    /// Replace the live database contents with the database file at `source`.
    pub fn restore_from(&self, source: &Path) -> anyhow::Result<()> {
        let src = Connection::open(source)
            .with_context(|| format!("failed to open restore source {}", source.display()))?;
        let mut conn = self
            .writer
            .lock()
            .map_err(|_| anyhow::anyhow!("writer lock poisoned"))?;
        let backup = Backup::new(&src, &mut conn)?;
        backup.run_to_completion(100, Duration::from_millis(50), None)?;
        Ok(())
    }
}
