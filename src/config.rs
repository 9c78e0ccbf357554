use chrono::Utc;
use serde::Deserialize;
use serde_yaml::{Mapping, Value};
use std::fs;
use std::path::{Path, PathBuf};

use crate::template;

pub(crate) const DEFAULT_CONFIG_FILE: &str = "tatsu.yaml";
const CONFIG_TEMPLATE: &str = include_str!("../config_templates/tatsu.yaml");
const VALIDATE_PLACEHOLDER: &str =
    "echo \"set validate.command in tatsu.yaml\" >&2; exit 1";

/// Marker files checked in order; the first one present picks the command.
const PROJECT_MARKERS: [(&str, &str); 6] = [
    ("Cargo.toml", "cargo test"),
    ("go.mod", "go test ./..."),
    ("package.json", "npm test"),
    ("pyproject.toml", "pytest"),
    ("setup.py", "pytest"),
    ("Makefile", "make test"),
];

#[derive(Debug, Deserialize)]
pub(crate) struct Config {
    #[serde(default)]
    pub(crate) agent: CommandSection,
    #[serde(default)]
    pub(crate) validate: CommandSection,
    #[serde(default)]
    pub(crate) log_path: Option<PathBuf>,
}

#[derive(Debug, Default, Deserialize)]
pub(crate) struct CommandSection {
    #[serde(default)]
    pub(crate) command: String,
}

#[derive(Debug)]
pub(crate) struct LoadedConfig {
    pub(crate) config: Config,
    pub(crate) warnings: Vec<String>,
}

pub(crate) fn load_config(path: &Path) -> Result<LoadedConfig, String> {
    let content = fs::read_to_string(path)
        .map_err(|err| format!("Failed to read config {}: {}", path.display(), err))?;
    parse_config(&content, path)
}

fn parse_config(content: &str, path: &Path) -> Result<LoadedConfig, String> {
    let value: Value = serde_yaml::from_str(content)
        .map_err(|err| format!("Failed to parse config {}: {}", path.display(), err))?;
    let mapping = match value {
        Value::Mapping(mapping) => mapping,
        Value::Null => Mapping::new(),
        _ => {
            return Err(format!(
                "Config {} must be a YAML mapping",
                path.display()
            ))
        }
    };

    let mut warnings: Vec<String> = unknown_top_level_keys(&mapping)
        .into_iter()
        .map(|key| format!("unknown config key: {}", key))
        .collect();

    let config: Config = serde_path_to_error::deserialize(Value::Mapping(mapping)).map_err(
        |err| {
            format!(
                "Invalid config {} at {}: {}",
                path.display(),
                err.path(),
                err.inner()
            )
        },
    )?;

    if config.agent.command.trim().is_empty() {
        return Err("agent.command is required in tatsu.yaml".to_string());
    }
    if config.validate.command.trim().is_empty() {
        return Err("validate.command is required in tatsu.yaml".to_string());
    }

    match template::marker_count(&config.agent.command) {
        1 => {}
        0 => warnings.push(format!(
            "agent.command has no {} marker; the task text will not reach the agent",
            template::TASK_MARKER
        )),
        count => warnings.push(format!(
            "agent.command has {} {} markers; each one receives the task text",
            count,
            template::TASK_MARKER
        )),
    }

    Ok(LoadedConfig { config, warnings })
}

fn unknown_top_level_keys(mapping: &Mapping) -> Vec<String> {
    let allowed = ["agent", "validate", "log_path"];

    mapping
        .keys()
        .filter_map(|key| key.as_str().map(|value| value.to_string()))
        .filter(|key| !allowed.contains(&key.as_str()))
        .collect()
}

/// Validation command for the project rooted at `dir`.
pub(crate) fn detect_validate_command(dir: &Path) -> &'static str {
    PROJECT_MARKERS
        .iter()
        .find(|(marker, _)| dir.join(marker).is_file())
        .map(|(_, command)| *command)
        .unwrap_or(VALIDATE_PLACEHOLDER)
}

pub(crate) fn render_default_config(validate_command: &str) -> String {
    CONFIG_TEMPLATE.replace("{{validate_command}}", &yaml_single_quoted(validate_command))
}

fn yaml_single_quoted(value: &str) -> String {
    format!("'{}'", value.replace('\'', "''"))
}

#[derive(Debug, PartialEq, Eq)]
pub(crate) struct GeneratedConfig {
    pub(crate) validate_command: String,
    pub(crate) backup: Option<PathBuf>,
}

/// Writes a default config to `path`, picking the validation command from the
/// project in `project_dir`.
///
/// An existing file is only replaced with `force`, after it has been copied
/// to a timestamped backup next to it.
pub(crate) fn generate_config(
    path: &Path,
    project_dir: &Path,
    force: bool,
) -> Result<GeneratedConfig, String> {
    let exists = path.exists();
    if exists && !force {
        return Err(format!(
            "{} already exists (use --force to overwrite)",
            path.display()
        ));
    }

    let validate_command = detect_validate_command(project_dir);
    let content = render_default_config(validate_command);
    parse_config(&content, path)
        .map_err(|err| format!("Generated config is invalid: {}", err))?;

    let backup = if exists {
        let backup = next_backup_path(path);
        fs::copy(path, &backup).map_err(|err| {
            format!(
                "Failed to back up {} to {}: {}",
                path.display(),
                backup.display(),
                err
            )
        })?;
        Some(backup)
    } else {
        None
    };

    if let Some(parent) = path.parent().filter(|parent| !parent.as_os_str().is_empty()) {
        fs::create_dir_all(parent)
            .map_err(|err| format!("Failed to create {}: {}", parent.display(), err))?;
    }
    fs::write(path, content)
        .map_err(|err| format!("Failed to write config {}: {}", path.display(), err))?;

    Ok(GeneratedConfig {
        validate_command: validate_command.to_string(),
        backup,
    })
}

fn next_backup_path(config_path: &Path) -> PathBuf {
    let file_name = config_path
        .file_name()
        .and_then(|value| value.to_str())
        .unwrap_or(DEFAULT_CONFIG_FILE);
    let timestamp = Utc::now().format("%Y%m%dT%H%M%SZ").to_string();
    let mut backup = config_path.with_file_name(format!("{}.bak-{}", file_name, timestamp));

    if !backup.exists() {
        return backup;
    }

    for index in 2..=1000 {
        backup = config_path.with_file_name(format!("{}.bak-{}-{}", file_name, timestamp, index));
        if !backup.exists() {
            return backup;
        }
    }

    backup
}
