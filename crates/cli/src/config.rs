use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use tracing::debug;

use relay_tool_runtime::{PermissionConfig, PermissionTier, RolePermissions, SafetyPolicy};

/// CLI configuration loaded from TOML file.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct CliConfig {
    /// Role profiles keyed by role name; these replace built-in roles of the same name.
    #[serde(default)]
    pub roles: HashMap<String, RoleProfile>,

    /// Safety policy table; the built-in policy applies when absent.
    #[serde(default)]
    pub safety: Option<SafetyPolicy>,
}

/// One `[roles.<name>]` table.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RoleProfile {
    pub tier: PermissionTier,
    #[serde(default)]
    pub allow: Option<Vec<String>>,
    #[serde(default)]
    pub block: Vec<String>,
    #[serde(default)]
    pub max_steps: Option<usize>,
    #[serde(default)]
    pub timeout_ms: Option<u64>,
}

impl RoleProfile {
    fn to_permission_config(&self) -> PermissionConfig {
        let mut config = PermissionConfig::new(self.tier).with_block_list(self.block.clone());
        if let Some(allow) = &self.allow {
            config = config.with_allow_list(allow.clone());
        }
        config.max_steps = self.max_steps;
        config.timeout_ms = self.timeout_ms;
        config
    }
}

impl CliConfig {
    /// Return the default config file path: ~/.config/relay/config.toml
    pub fn default_config_path() -> Result<PathBuf> {
        let config_dir = dirs::config_dir()
            .context("could not determine user config directory")?
            .join("relay");
        Ok(config_dir.join("config.toml"))
    }

    /// Load config from the given path, or the default path.
    /// Returns default config if the file does not exist.
    pub fn load(path: Option<&Path>) -> Result<Self> {
        let config_path = match path {
            Some(p) => p.to_path_buf(),
            None => Self::default_config_path()?,
        };

        if config_path.exists() {
            debug!(?config_path, "Loading config");
            let content = std::fs::read_to_string(&config_path)
                .with_context(|| format!("failed to read config: {}", config_path.display()))?;
            let config: Self = toml::from_str(&content)
                .with_context(|| format!("failed to parse config: {}", config_path.display()))?;
            Ok(config)
        } else {
            debug!(?config_path, "Config file not found, using defaults");
            Ok(Self::default())
        }
    }

    pub fn safety_policy(&self) -> SafetyPolicy {
        self.safety.clone().unwrap_or_default()
    }

    /// Built-in roles overlaid with the configured ones.
    ///
    /// Auto-approved external tool keys are appended to the allow list of
    /// read-tier roles that already have one.
    pub fn role_permissions(&self, auto_approved: &[String]) -> RolePermissions {
        let mut roles = RolePermissions::builtin();
        for (name, profile) in &self.roles {
            roles.insert(name.clone(), profile.to_permission_config());
        }

        if auto_approved.is_empty() {
            return roles;
        }
        let mut extended = RolePermissions::new();
        for (name, config) in roles.roles() {
            let mut config = config.clone();
            if config.tier == PermissionTier::Read {
                if let Some(allow) = config.allow_list.as_mut() {
                    for key in auto_approved {
                        if !allow.contains(key) {
                            allow.push(key.clone());
                        }
                    }
                }
            }
            extended.insert(name.clone(), config);
        }
        extended
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use relay_tool_runtime::PermissionDecision;

    const SAMPLE: &str = r#"
[roles.reviewer]
tier = "read"
allow = ["file_read", "list_directory"]
max_steps = 8

[roles.executor]
tier = "readWrite"
block = ["file_delete"]

[safety]
blocked_commands = ["rm"]
allow_private_network = true
"#;

    #[test]
    fn test_missing_file_gives_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let config = CliConfig::load(Some(&dir.path().join("absent.toml"))).unwrap();
        assert!(config.roles.is_empty());
        assert_eq!(config.safety_policy(), SafetyPolicy::default());
    }

    #[test]
    fn test_load_roles_and_safety() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("config.toml");
        std::fs::write(&path, SAMPLE).unwrap();

        let config = CliConfig::load(Some(&path)).unwrap();
        let reviewer = &config.roles["reviewer"];
        assert_eq!(reviewer.tier, PermissionTier::Read);
        assert_eq!(reviewer.max_steps, Some(8));

        let policy = config.safety_policy();
        assert_eq!(policy.blocked_commands, vec!["rm".to_string()]);
        assert!(policy.allow_private_network);
        // Unset fields keep their defaults.
        assert!(!policy.blocked_paths.is_empty());
    }

    #[test]
    fn test_invalid_toml_is_an_error() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("config.toml");
        std::fs::write(&path, "[roles.x]\ntier = \"superuser\"\n").unwrap();
        let err = CliConfig::load(Some(&path)).unwrap_err();
        assert!(format!("{err:#}").contains("failed to parse config"));
    }

    #[test]
    fn test_configured_roles_override_builtins() {
        let config: CliConfig = toml::from_str(SAMPLE).unwrap();
        let roles = config.role_permissions(&[]);

        assert!(roles.authorize("executor", "file_write").is_allowed());
        assert!(!roles.authorize("executor", "file_delete").is_allowed());
        assert!(roles.authorize("admin", "shell_execute").is_allowed());
        assert!(!roles.authorize("reviewer", "http_fetch").is_allowed());
        assert_eq!(roles.get("reviewer").and_then(|r| r.max_steps), Some(8));
    }

    #[test]
    fn test_auto_approved_keys_extend_read_allow_lists() {
        let config: CliConfig = toml::from_str(SAMPLE).unwrap();
        let roles = config.role_permissions(&["docs::search".to_string()]);

        assert_eq!(roles.authorize("reviewer", "docs::search"), PermissionDecision::Allowed);
        assert!(!roles.authorize("reviewer", "docs::delete_page").is_allowed());
        // No allow list to extend: the researcher keeps its unrestricted read tier.
        assert!(roles.get("researcher").and_then(|r| r.allow_list.as_ref()).is_none());
    }
}
