use serde::Deserialize;
use std::path::PathBuf;

#[derive(Debug, Deserialize, Clone)]
pub struct FleetConfig {
    /// Directory holding the manifest, instance tree, registry and backups.
    #[serde(default = "default_root_dir")]
    pub root_dir: PathBuf,
    #[serde(default = "default_port_range")]
    pub port_range: [u16; 2],
    #[serde(default = "default_docker_binary")]
    pub docker_binary: String,
    #[serde(default = "default_image")]
    pub image: String,
    #[serde(default = "default_container_prefix")]
    pub container_prefix: String,
    #[serde(default = "default_timezone")]
    pub timezone: String,
    /// CLI invoked inside the container for `init` and credential commands.
    #[serde(default = "default_instance_cli")]
    pub instance_cli: String,
    #[serde(default = "default_init_args")]
    pub init_args: Vec<String>,
    #[serde(default = "default_runtime_timeout")]
    pub runtime_timeout_secs: u64,
    #[serde(default = "default_log_tail")]
    pub log_tail: u32,
    #[serde(default = "default_restart_all")]
    pub restart_all_on_restore: bool,
}

impl Default for FleetConfig {
    fn default() -> Self {
        Self {
            root_dir: default_root_dir(),
            port_range: default_port_range(),
            docker_binary: default_docker_binary(),
            image: default_image(),
            container_prefix: default_container_prefix(),
            timezone: default_timezone(),
            instance_cli: default_instance_cli(),
            init_args: default_init_args(),
            runtime_timeout_secs: default_runtime_timeout(),
            log_tail: default_log_tail(),
            restart_all_on_restore: default_restart_all(),
        }
    }
}

impl FleetConfig {
    pub fn instances_dir(&self) -> PathBuf {
        self.root_dir.join("instances")
    }

    pub fn manifest_path(&self) -> PathBuf {
        self.root_dir.join("docker-compose.yml")
    }

    pub fn database_path(&self) -> PathBuf {
        self.root_dir.join("data").join("registry.db")
    }

    pub fn backup_dir(&self) -> PathBuf {
        self.root_dir.join("backups")
    }

    pub fn base_port(&self) -> u16 {
        self.port_range[0]
    }

    pub fn container_name(&self, instance_id: &str) -> String {
        format!("{}{}", self.container_prefix, instance_id)
    }
}

// Default functions
fn default_root_dir() -> PathBuf {
    PathBuf::from(".")
}
fn default_port_range() -> [u16; 2] {
    [18789, 19789]
}
fn default_docker_binary() -> String {
    "docker".into()
}
fn default_image() -> String {
    "openclaw:local".into()
}
fn default_container_prefix() -> String {
    "openclaw-".into()
}
fn default_timezone() -> String {
    "Asia/Shanghai".into()
}
fn default_instance_cli() -> String {
    "openclaw".into()
}
fn default_init_args() -> Vec<String> {
    vec!["onboard".into()]
}
fn default_runtime_timeout() -> u64 {
    120
}
fn default_log_tail() -> u32 {
    200
}
fn default_restart_all() -> bool {
    true
}

/// Load config from TOML file with env var overrides.
pub fn load(path: &str) -> anyhow::Result<FleetConfig> {
    let content = if std::path::Path::new(path).exists() {
        std::fs::read_to_string(path)?
    } else {
        tracing::warn!("Config file not found at {}, using defaults", path);
        String::new()
    };

    let mut config: FleetConfig = toml::from_str(&content)?;

    // Env var overrides
    if let Ok(v) = std::env::var("CLAWFLEET_ROOT_DIR") {
        config.root_dir = PathBuf::from(v);
    }
    if let Ok(v) = std::env::var("CLAWFLEET_IMAGE") {
        config.image = v;
    }
    if let Ok(v) = std::env::var("CLAWFLEET_DOCKER") {
        config.docker_binary = v;
    }
    if let Ok(v) = std::env::var("CLAWFLEET_RUNTIME_TIMEOUT_SECS") {
        config.runtime_timeout_secs = v.parse()?;
    }

    if config.port_range[0] > config.port_range[1] {
        anyhow::bail!(
            "invalid port_range: {} > {}",
            config.port_range[0],
            config.port_range[1]
        );
    }

    Ok(config)
}
