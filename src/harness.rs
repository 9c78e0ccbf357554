use serde_json::json;
use std::process::{Command, Stdio};

/// Capability check for the external agent backend.
pub(crate) trait Harness {
    fn name(&self) -> &str;
    fn is_available(&self) -> bool;
}

#[derive(Debug, Clone)]
pub(crate) struct OpenCodeHarness {
    command: String,
}

impl OpenCodeHarness {
    pub(crate) const INSTALL_HINT: &'static str = "https://github.com/EmbeddedLLM/opencode";

    pub(crate) fn new() -> Self {
        Self {
            command: "opencode".to_string(),
        }
    }
}

impl Harness for OpenCodeHarness {
    fn name(&self) -> &str {
        "OpenCode"
    }

    fn is_available(&self) -> bool {
        Command::new(&self.command)
            .arg("--version")
            .stdin(Stdio::null())
            .stdout(Stdio::null())
            .stderr(Stdio::null())
            .status()
            .map(|status| status.success())
            .unwrap_or(false)
    }
}

/// Environment overrides that keep the agent from stopping on prompts.
pub(crate) fn agent_env() -> Vec<(String, String)> {
    let permissions = json!({
        "permission": {
            "edit": "allow",
            "bash": "allow",
            "webfetch": "allow",
        }
    });
    vec![
        ("OPENCODE_CONFIG_CONTENT".to_string(), permissions.to_string()),
        ("CI".to_string(), "true".to_string()),
    ]
}

#[cfg(test)]
mod tests {
    use super::*;

    struct MissingHarness;

    impl Harness for MissingHarness {
        fn name(&self) -> &str {
            "Missing"
        }

        fn is_available(&self) -> bool {
            false
        }
    }

    #[test]
    fn opencode_harness_reports_name_and_binary() {
        let harness = OpenCodeHarness::new();
        assert_eq!(harness.name(), "OpenCode");
        assert_eq!(harness.command, "opencode");
    }

    #[test]
    fn harness_is_usable_as_trait_object() {
        let harnesses: Vec<Box<dyn Harness>> =
            vec![Box::new(OpenCodeHarness::new()), Box::new(MissingHarness)];
        assert_eq!(harnesses[1].name(), "Missing");
        assert!(!harnesses[1].is_available());
    }

    #[test]
    fn agent_env_sets_permission_and_ci() {
        let env = agent_env();
        let config = env
            .iter()
            .find(|(key, _)| key == "OPENCODE_CONFIG_CONTENT")
            .map(|(_, value)| value.clone())
            .expect("OPENCODE_CONFIG_CONTENT");
        let parsed: serde_json::Value = serde_json::from_str(&config).expect("json");
        assert_eq!(parsed["permission"]["bash"], "allow");
        assert!(env.contains(&("CI".to_string(), "true".to_string())));
    }
}
