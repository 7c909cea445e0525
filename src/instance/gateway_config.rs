use rand::RngExt;

use crate::instance::jsonc::{self, ParseError};
use crate::instance::manifest::CONTAINER_GATEWAY_PORT;

pub const TOKEN_PATH: &[&str] = &["gateway", "auth", "token"];

/// 32 random bytes, hex encoded.
pub fn generate_token() -> String {
    let mut bytes = [0u8; 32];
    rand::rng().fill(&mut bytes);
    hex::encode(bytes)
}

/// Render a complete `openclaw.json` for a freshly created instance.
///
/// The gateway binds on the LAN interface inside the container and requires
/// the generated token; the password is kept alongside it for the control UI.
pub fn render_default_config(token: &str, password: &str) -> String {
    format!(
        r#"{{
  "gateway": {{
    "mode": "local",
    "port": {port},
    "bind": "lan",
    "auth": {{
      "mode": "token",
      "token": {token},
      "password": {password}
    }}
  }},
  "agents": {{
    "defaults": {{
      "sandbox": {{
        "mode": "non-main",
        "scope": "agent"
      }}
    }}
  }},
  "channels": {{}},
  "tools": {{}}
}}
"#,
        port = CONTAINER_GATEWAY_PORT,
        token = json_string(token),
        password = json_string(password),
    )
}

/// Shown by `read_config` when an instance has no config file on disk.
pub fn render_placeholder_config(instance_id: &str) -> String {
    format!(
        r#"// No openclaw.json exists yet for instance "{id}".
// Saving this document creates it. Comments and trailing commas are allowed.
{{
  "gateway": {{
    "mode": "local",
    "port": {port},
    "bind": "lan",
    "auth": {{
      "mode": "token",
      "token": "",
    }},
  }},
}}
"#,
        id = instance_id.replace('\n', " "),
        port = CONTAINER_GATEWAY_PORT,
    )
}

/// The configured gateway token, `None` when absent or empty.
pub fn read_token(text: &str) -> Result<Option<String>, ParseError> {
    let root = jsonc::parse(text)?;
    Ok(root
        .get_path(TOKEN_PATH)
        .and_then(jsonc::Node::as_str)
        .filter(|t| !t.is_empty())
        .map(str::to_string))
}

/// Swap the gateway token, preserving every other byte of `text`.
pub fn replace_token(text: &str, token: &str) -> Result<String, ParseError> {
    jsonc::set_string(text, TOKEN_PATH, token)
}

fn json_string(s: &str) -> String {
    serde_json::Value::String(s.to_string()).to_string()
}
