pub mod pool;
pub mod registry;

use anyhow::Context;
use pool::DbPool;

/// Schema steps in order. Step `n` (1-based) brings `user_version` to `n`.
const MIGRATIONS: &[&str] = &[include_str!("migrations/001_initial.sql")];

/// Schema version stored in the database header.
pub fn schema_version(pool: &DbPool) -> anyhow::Result<u32> {
    pool.read(|conn| Ok(conn.query_row("PRAGMA user_version", [], |row| row.get(0))?))
}

/// Bring the registry schema up to date. The version lives in the SQLite
/// header, so a restored snapshot carries its own version and is upgraded in
/// place. Returns how many steps ran.
pub fn run_migrations(pool: &DbPool) -> anyhow::Result<usize> {
    pool.write(|conn| {
        let current: u32 = conn.query_row("PRAGMA user_version", [], |row| row.get(0))?;
        let current = current as usize;
        if current > MIGRATIONS.len() {
            anyhow::bail!(
                "registry schema version {} is newer than this build ({})",
                current,
                MIGRATIONS.len()
            );
        }

        for (idx, sql) in MIGRATIONS.iter().enumerate().skip(current) {
            let version = idx + 1;
            let tx = conn.unchecked_transaction()?;
            tx.execute_batch(sql)
                .with_context(|| format!("registry migration {} failed", version))?;
            tx.pragma_update(None, "user_version", version as i64)?;
            tx.commit()?;
            tracing::info!("registry schema migrated to version {}", version);
        }
        Ok(MIGRATIONS.len() - current)
    })
}
