use anyhow::{Context, Result};
use flate2::read::GzDecoder;
use flate2::write::GzEncoder;
use flate2::Compression;
use std::fs::{self, File};
use std::io::Write;
use std::path::{Path, PathBuf};

/// Archive member holding the instance tree.
pub const INSTANCES_ENTRY: &str = "instances";
/// Archive member holding the registry snapshot.
pub const DATABASE_ENTRY: &str = "database/registry.db";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ArchiveSummary {
    /// Sum of the sizes of every archived file, before compression.
    pub size: u64,
    pub files: u64,
}

/// Write `dest` as a gzip'd tar of `instances_dir` (under `instances/`) plus the
/// registry snapshot (as `database/registry.db`).
///
/// The archive is assembled next to `dest` and renamed into place, so a
/// failed pack never leaves a truncated file under the final name.
pub fn pack(dest: &Path, instances_dir: &Path, registry_snapshot: &Path) -> Result<ArchiveSummary> {
    let partial = dest.with_extension("partial");
    match write_archive(&partial, instances_dir, registry_snapshot) {
        Ok(summary) => {
            fs::rename(&partial, dest)
                .with_context(|| format!("failed to move archive into place: {}", dest.display()))?;
            Ok(summary)
        }
        Err(e) => {
            let _ = fs::remove_file(&partial);
            Err(e)
        }
    }
}

fn write_archive(path: &Path, instances_dir: &Path, registry_snapshot: &Path) -> Result<ArchiveSummary> {
    let file = File::create(path)
        .with_context(|| format!("failed to create archive: {}", path.display()))?;
    let encoder = GzEncoder::new(file, Compression::default());
    let mut builder = tar::Builder::new(encoder);
    builder.follow_symlinks(false);

    let mut summary = ArchiveSummary { size: 0, files: 0 };

    fs::create_dir_all(instances_dir)
        .with_context(|| format!("failed to create dir: {}", instances_dir.display()))?;
    builder
        .append_dir(INSTANCES_ENTRY, instances_dir)
        .context("failed to archive instances root")?;
    for (abs, rel) in walk(instances_dir)? {
        let name = Path::new(INSTANCES_ENTRY).join(&rel);
        let meta = fs::symlink_metadata(&abs)
            .with_context(|| format!("failed to stat {}", abs.display()))?;
        if meta.is_dir() {
            builder
                .append_dir(&name, &abs)
                .with_context(|| format!("failed to archive dir {}", abs.display()))?;
        } else {
            builder
                .append_path_with_name(&abs, &name)
                .with_context(|| format!("failed to archive {}", abs.display()))?;
            if meta.is_file() {
                summary.size += meta.len();
                summary.files += 1;
            }
        }
    }

    let db_len = fs::metadata(registry_snapshot)
        .with_context(|| format!("registry snapshot missing: {}", registry_snapshot.display()))?
        .len();
    builder
        .append_path_with_name(registry_snapshot, DATABASE_ENTRY)
        .context("failed to archive registry snapshot")?;
    summary.size += db_len;
    summary.files += 1;

    let encoder = builder.into_inner().context("failed to finish tar stream")?;
    let mut file = encoder.finish().context("failed to finish gzip stream")?;
    file.flush()?;
    file.sync_all()
        .with_context(|| format!("failed to sync archive: {}", path.display()))?;
    Ok(summary)
}

/// Every entry below `root` as `(absolute, relative)`, parents before children,
/// siblings in name order.
fn walk(root: &Path) -> Result<Vec<(PathBuf, PathBuf)>> {
    let mut out = Vec::new();
    let mut stack = vec![PathBuf::new()];
    while let Some(rel_dir) = stack.pop() {
        let dir = root.join(&rel_dir);
        let mut entries: Vec<_> = fs::read_dir(&dir)
            .with_context(|| format!("failed to read dir: {}", dir.display()))?
            .collect::<std::io::Result<Vec<_>>>()?;
        entries.sort_by_key(|e| e.file_name());
        let mut subdirs = Vec::new();
        for entry in entries {
            let rel = rel_dir.join(entry.file_name());
            if entry.file_type()?.is_dir() {
                subdirs.push(rel.clone());
            }
            out.push((entry.path(), rel));
        }
        stack.extend(subdirs.into_iter().rev());
    }
    Ok(out)
}

/// Extract `archive` into `staging`. Entries that would escape `staging` are
/// refused by `tar` itself.
pub fn unpack(archive: &Path, staging: &Path) -> Result<()> {
    fs::create_dir_all(staging)
        .with_context(|| format!("failed to create staging dir: {}", staging.display()))?;
    let file = File::open(archive)
        .with_context(|| format!("failed to open archive: {}", archive.display()))?;
    let mut archive_reader = tar::Archive::new(GzDecoder::new(file));
    archive_reader.set_preserve_permissions(true);
    archive_reader
        .unpack(staging)
        .with_context(|| format!("failed to unpack archive: {}", archive.display()))?;
    Ok(())
}

/// Copy `src` over `dst`, creating directories and overwriting files that
/// already exist. Files present only in `dst` are left alone. Returns the
/// number of files copied.
pub fn copy_tree(src: &Path, dst: &Path) -> Result<u64> {
    fs::create_dir_all(dst).with_context(|| format!("failed to create dir: {}", dst.display()))?;
    let mut copied = 0;
    for (abs, rel) in walk(src)? {
        let target = dst.join(&rel);
        let meta = fs::symlink_metadata(&abs)?;
        if meta.is_dir() {
            fs::create_dir_all(&target)
                .with_context(|| format!("failed to create dir: {}", target.display()))?;
        } else if meta.is_file() {
            fs::copy(&abs, &target).with_context(|| {
                format!("failed to copy {} to {}", abs.display(), target.display())
            })?;
            copied += 1;
        } else {
            tracing::debug!("skipping non-regular entry {}", abs.display());
        }
    }
    Ok(copied)
}
