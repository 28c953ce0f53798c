use crate::config::{ConfigError, ConfigurationRecord};
use log::{debug, info};
use std::collections::BTreeMap;
use std::path::Path;

/// Load a configuration record from a YAML or dotenv-style file
///
/// Files ending in `.yaml`/`.yml` are read as a flat YAML mapping; anything
/// else is read as `KEY=VALUE` lines.
pub fn load_record(path: &Path) -> Result<ConfigurationRecord, ConfigError> {
    info!("Loading configuration from: {:?}", path);

    let content = std::fs::read_to_string(path)
        .map_err(|source| ConfigError::Io { path: path.to_path_buf(), source })?;

    let values = match path.extension().and_then(|e| e.to_str()) {
        Some("yaml") | Some("yml") => parse_yaml(&content)
            .map_err(|message| ConfigError::Parse { path: path.to_path_buf(), message })?,
        _ => parse_env(&content)
            .map_err(|message| ConfigError::Parse { path: path.to_path_buf(), message })?,
    };
    debug!("Read {} configuration keys", values.len());

    ConfigurationRecord::from_map(values)
}

/// Parse a flat YAML mapping of scalars into strings
pub fn parse_yaml(content: &str) -> Result<BTreeMap<String, String>, String> {
    let mapping: BTreeMap<String, serde_yaml::Value> =
        serde_yaml::from_str(content).map_err(|e| e.to_string())?;

    let mut values = BTreeMap::new();
    for (key, value) in mapping {
        let text = match value {
            serde_yaml::Value::String(s) => s,
            serde_yaml::Value::Number(n) => n.to_string(),
            serde_yaml::Value::Bool(b) => b.to_string(),
            serde_yaml::Value::Null => String::new(),
            _ => return Err(format!("value of {} must be a scalar", key)),
        };
        values.insert(key, text);
    }
    Ok(values)
}

/// Parse `KEY=VALUE` lines. Blank lines and `#` comments are skipped, an
/// `export ` prefix is accepted and one layer of matching quotes is removed.
pub fn parse_env(content: &str) -> Result<BTreeMap<String, String>, String> {
    let mut values = BTreeMap::new();

    for (number, raw) in content.lines().enumerate() {
        let line = raw.trim();
        if line.is_empty() || line.starts_with('#') {
            continue;
        }
        let line = line.strip_prefix("export ").map(str::trim_start).unwrap_or(line);

        let (key, value) = line
            .split_once('=')
            .ok_or_else(|| format!("line {}: expected KEY=VALUE", number + 1))?;
        let key = key.trim();
        if key.is_empty() || !key.chars().all(|c| c.is_ascii_alphanumeric() || c == '_') {
            return Err(format!("line {}: invalid key '{}'", number + 1, key));
        }

        values.insert(key.to_string(), unquote(value.trim()).to_string());
    }

    Ok(values)
}

fn unquote(value: &str) -> &str {
    for quote in ['"', '\''] {
        if value.len() >= 2 && value.starts_with(quote) && value.ends_with(quote) {
            return &value[1..value.len() - 1];
        }
    }
    // Unquoted values may carry a trailing comment.
    match value.find(" #") {
        Some(index) => value[..index].trim_end(),
        None => value,
    }
}
