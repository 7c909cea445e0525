use anyhow::Context;
use serde::Serialize;
use std::collections::BTreeMap;
use std::path::Path;

use crate::config::FleetConfig;
use crate::instance::Instance;

/// Fixed ports the gateway image listens on inside every container.
pub const CONTAINER_GATEWAY_PORT: u16 = 18789;
pub const CONTAINER_BRIDGE_PORT: u16 = 18790;

const CONTAINER_HOME: &str = "/home/node";
const CONTAINER_CONFIG_DIR: &str = "/home/node/.openclaw";
const CONTAINER_WORKSPACE_DIR: &str = "/home/node/.openclaw/workspace";

const HEADER: &str = "# Generated by clawfleet from the instance registry. Manual edits are overwritten.\n";

// Docker Compose YAML types

#[derive(Debug, Default, Serialize)]
struct ComposeFile {
    services: BTreeMap<String, ComposeService>,
}

#[derive(Debug, Serialize)]
struct ComposeService {
    image: String,
    container_name: String,
    ports: Vec<String>,
    volumes: Vec<String>,
    environment: BTreeMap<String, String>,
    command: Vec<String>,
    restart: String,
}

/// Render the compose manifest for the whole fleet.
///
/// The output is a pure function of the instance set: services are keyed by
/// id in sorted order. Keys are always strings, so an all-digit id is emitted
/// quoted.
pub fn render_manifest(instances: &[Instance], config: &FleetConfig) -> anyhow::Result<String> {
    let mut compose = ComposeFile::default();
    for inst in instances {
        compose
            .services
            .insert(inst.id.clone(), instance_to_service(inst, config));
    }
    let body = serde_yaml::to_string(&compose).context("failed to serialize compose manifest")?;
    Ok(format!("{}{}", HEADER, body))
}

fn instance_to_service(inst: &Instance, config: &FleetConfig) -> ComposeService {
    let id = &inst.id;
    let data_dir = format!("./instances/{}/data", id);
    let workspace_dir = format!("./instances/{}/data/workspace", id);

    let environment = [
        ("HOME", CONTAINER_HOME),
        ("TERM", "xterm-256color"),
        ("TZ", config.timezone.as_str()),
        ("LANG", "C.UTF-8"),
    ]
    .into_iter()
    .map(|(k, v)| (k.to_string(), v.to_string()))
    .collect();

    ComposeService {
        image: config.image.clone(),
        container_name: config.container_name(id),
        ports: vec![
            format!("{}:{}", inst.port, CONTAINER_GATEWAY_PORT),
            format!("{}:{}", inst.bridge_port(), CONTAINER_BRIDGE_PORT),
        ],
        volumes: vec![
            format!("{}:{}", data_dir, CONTAINER_CONFIG_DIR),
            format!("{}:{}", workspace_dir, CONTAINER_WORKSPACE_DIR),
        ],
        environment,
        command: [
            "node",
            "dist/index.js",
            "gateway",
            "--bind",
            "lan",
            "--port",
        ]
        .iter()
        .map(|s| s.to_string())
        .chain(std::iter::once(CONTAINER_GATEWAY_PORT.to_string()))
        .collect(),
        restart: "unless-stopped".to_string(),
    }
}

/// Replace the manifest at `path` in one step (temp file + rename) so the
/// runtime never reads a half-written document.
pub fn write_manifest(path: &Path, content: &str) -> anyhow::Result<()> {
    if let Some(parent) = path.parent() {
        if !parent.as_os_str().is_empty() {
            std::fs::create_dir_all(parent)
                .with_context(|| format!("failed to create manifest dir: {}", parent.display()))?;
        }
    }
    let tmp = path.with_extension(format!("yml.tmp-{}", uuid::Uuid::new_v4()));
    std::fs::write(&tmp, content)
        .with_context(|| format!("failed to write manifest: {}", tmp.display()))?;
    if let Err(e) = std::fs::rename(&tmp, path) {
        let _ = std::fs::remove_file(&tmp);
        return Err(e).with_context(|| format!("failed to replace manifest: {}", path.display()));
    }
    Ok(())
}

/// Service keys of a rendered manifest, in document order.
#[cfg(test)]
pub(crate) fn service_ids(manifest: &str) -> Vec<String> {
    let doc: serde_yaml::Value = serde_yaml::from_str(manifest).expect("manifest is valid YAML");
    doc.get("services")
        .and_then(|s| s.as_mapping())
        .map(|m| {
            m.keys()
                .filter_map(|k| k.as_str().map(str::to_string))
                .collect()
        })
        .unwrap_or_default()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn config() -> FleetConfig {
        FleetConfig::default()
    }

    fn services(manifest: &str) -> serde_yaml::Mapping {
        let doc: serde_yaml::Value = serde_yaml::from_str(manifest).expect("manifest is valid YAML");
        doc.get("services")
            .and_then(|s| s.as_mapping())
            .cloned()
            .expect("services mapping")
    }

    #[test]
    fn empty_fleet_is_valid_and_explicit() {
        let manifest = render_manifest(&[], &config()).unwrap();
        assert!(manifest.starts_with("# Generated by clawfleet"));
        assert!(services(&manifest).is_empty());
    }

    #[test]
    fn service_block_binds_pair_and_volumes() {
        let manifest =
            render_manifest(&[Instance::new("a1", "Agent One", 18789)], &config()).unwrap();
        let svcs = services(&manifest);
        let svc = svcs
            .get(serde_yaml::Value::String("a1".into()))
            .expect("a1 service");

        assert_eq!(svc["image"].as_str(), Some("openclaw:local"));
        assert_eq!(svc["container_name"].as_str(), Some("openclaw-a1"));
        let ports: Vec<&str> = svc["ports"]
            .as_sequence()
            .unwrap()
            .iter()
            .filter_map(|p| p.as_str())
            .collect();
        assert_eq!(ports, vec!["18789:18789", "18790:18790"]);
        let volumes: Vec<&str> = svc["volumes"]
            .as_sequence()
            .unwrap()
            .iter()
            .filter_map(|v| v.as_str())
            .collect();
        assert_eq!(
            volumes,
            vec![
                "./instances/a1/data:/home/node/.openclaw",
                "./instances/a1/data/workspace:/home/node/.openclaw/workspace",
            ]
        );
        let command: Vec<&str> = svc["command"]
            .as_sequence()
            .unwrap()
            .iter()
            .filter_map(|c| c.as_str())
            .collect();
        assert_eq!(command.last(), Some(&"18789"));
        assert_eq!(svc["environment"]["TZ"].as_str(), Some("Asia/Shanghai"));
        assert_eq!(svc["restart"].as_str(), Some("unless-stopped"));
    }

    #[test]
    fn numeric_id_stays_a_string_key() {
        let manifest =
            render_manifest(&[Instance::new("12345", "Numeric", 18789)], &config()).unwrap();
        let svcs = services(&manifest);
        assert!(svcs.contains_key(serde_yaml::Value::String("12345".into())));
        assert!(!svcs.contains_key(serde_yaml::Value::Number(12345.into())));
    }

    #[test]
    fn output_depends_only_on_the_set() {
        let a = Instance::new("a1", "A", 18789);
        let b = Instance::new("b2", "B", 18791);
        let first = render_manifest(&[a.clone(), b.clone()], &config()).unwrap();
        let second = render_manifest(&[b, a], &config()).unwrap();
        assert_eq!(first, second);
        assert_eq!(service_ids(&first), vec!["a1".to_string(), "b2".to_string()]);
    }

    #[test]
    fn write_manifest_replaces_file() {
        let dir = std::env::temp_dir().join(format!("clawfleet-manifest-{}", uuid::Uuid::new_v4()));
        let path = dir.join("docker-compose.yml");

        write_manifest(&path, "services: {}\n").unwrap();
        write_manifest(&path, "services:\n  a1: {}\n").unwrap();
        assert_eq!(
            std::fs::read_to_string(&path).unwrap(),
            "services:\n  a1: {}\n"
        );
        let leftovers = std::fs::read_dir(&dir).unwrap().count();
        assert_eq!(leftovers, 1, "temp files must not linger");

        std::fs::remove_dir_all(&dir).unwrap();
    }
}
