use anyhow::{Context, Result};
use std::fs;
use std::path::{Path, PathBuf};

pub const CONFIG_FILE: &str = "openclaw.json";

/// `{instances_dir}/{id}`
pub fn instance_dir(instances_dir: &Path, id: &str) -> PathBuf {
    instances_dir.join(id)
}

/// `{instances_dir}/{id}/data`, mounted as the gateway's config directory.
pub fn data_dir(instances_dir: &Path, id: &str) -> PathBuf {
    instance_dir(instances_dir, id).join("data")
}

pub fn config_path(instances_dir: &Path, id: &str) -> PathBuf {
    data_dir(instances_dir, id).join(CONFIG_FILE)
}

/// Create `data/` and `data/workspace/` for an instance.
pub fn create_instance_dirs(instances_dir: &Path, id: &str) -> Result<()> {
    let workspace = data_dir(instances_dir, id).join("workspace");
    fs::create_dir_all(&workspace)
        .with_context(|| format!("failed to create dir: {}", workspace.display()))?;
    Ok(())
}

/// Remove the whole instance tree. A missing tree is not an error.
pub fn remove_instance_dirs(instances_dir: &Path, id: &str) -> Result<()> {
    let base = instance_dir(instances_dir, id);
    if base.exists() {
        fs::remove_dir_all(&base)
            .with_context(|| format!("failed to remove instance dirs: {}", base.display()))?;
    }
    Ok(())
}

pub fn write_config(instances_dir: &Path, id: &str, content: &str) -> Result<()> {
    let path = config_path(instances_dir, id);
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent)
            .with_context(|| format!("failed to create config dir: {}", parent.display()))?;
    }
    fs::write(&path, content)
        .with_context(|| format!("failed to write config: {}", path.display()))?;
    Ok(())
}

/// Raw config text, or `None` if the instance has no config file yet.
pub fn read_config(instances_dir: &Path, id: &str) -> Result<Option<String>> {
    let path = config_path(instances_dir, id);
    match fs::read_to_string(&path) {
        Ok(text) => Ok(Some(text)),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
        Err(e) => Err(e).with_context(|| format!("failed to read config: {}", path.display())),
    }
}
