//! Vendor device profiles.
//!
//! A [`DeviceProfile`] carries the per-vendor defaults the collector overlays
//! onto caller commands: connection timing, generic command parameters,
//! per-command overrides, prompt/error/paging patterns and paging toggles.
//! Profiles are plain data. They come from the compiled-in table in
//! [`builtin`] or from JSON files through a [`ProfileSource`].

use std::collections::BTreeMap;

use regex::RegexSet;
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

use crate::error::CollectorError;
use crate::resolver::{MAX_DELAY_FACTOR, MAX_LOOPS_LIMIT};

pub mod builtin;
mod registry;

pub use registry::{
    JsonDirSource, LayeredSource, ProfileEntry, ProfileLookup, ProfileRegistry, ProfileSource,
    ProfileSummary, StaticSource,
};

/// Connection-level timing for a vendor.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize, JsonSchema)]
#[serde(default)]
pub struct ConnectionParams {
    pub global_delay_factor: Option<f64>,
    pub read_timeout_secs: Option<u64>,
    pub session_timeout_secs: Option<u64>,
    pub auth_timeout_secs: Option<u64>,
    pub banner_timeout_secs: Option<u64>,
}

/// Command parameters a profile may supply. Unset fields supply nothing.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize, JsonSchema)]
#[serde(default)]
pub struct CommandParams {
    pub expect_string: Option<String>,
    pub delay_factor: Option<f64>,
    pub max_loops: Option<u32>,
    pub timeout_secs: Option<u64>,
}

impl CommandParams {
    fn check(&self) -> Result<(), String> {
        if let Some(delay) = self.delay_factor
            && !(delay > 0.0 && delay <= MAX_DELAY_FACTOR)
        {
            return Err(format!("delay_factor {delay} outside (0, {MAX_DELAY_FACTOR}]"));
        }
        if let Some(loops) = self.max_loops
            && !(1..=MAX_LOOPS_LIMIT).contains(&loops)
        {
            return Err(format!("max_loops {loops} outside 1..={MAX_LOOPS_LIMIT}"));
        }
        if self.timeout_secs == Some(0) {
            return Err("timeout_secs must be positive".to_string());
        }
        Ok(())
    }
}

impl ConnectionParams {
    fn check(&self) -> Result<(), String> {
        if let Some(delay) = self.global_delay_factor
            && !(delay > 0.0 && delay <= MAX_DELAY_FACTOR)
        {
            return Err(format!("global_delay_factor {delay} outside (0, {MAX_DELAY_FACTOR}]"));
        }
        for (label, secs) in [
            ("read_timeout_secs", self.read_timeout_secs),
            ("session_timeout_secs", self.session_timeout_secs),
            ("auth_timeout_secs", self.auth_timeout_secs),
            ("banner_timeout_secs", self.banner_timeout_secs),
        ] {
            if secs == Some(0) {
                return Err(format!("{label} must be positive"));
            }
        }
        Ok(())
    }
}

/// Parameters bound to one specific command text.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize, JsonSchema)]
pub struct CommandOverride {
    pub command: String,
    #[serde(flatten)]
    pub params: CommandParams,
}

#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize, JsonSchema)]
#[serde(default)]
pub struct PagingCommands {
    pub disable_paging: Option<String>,
    pub enable_paging: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize, JsonSchema)]
#[serde(default)]
pub struct DeviceInfo {
    pub vendor: String,
    pub os_type: String,
    pub supported_versions: Vec<String>,
}

/// Vendor defaults keyed by device type tag.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize, JsonSchema)]
#[serde(default)]
pub struct DeviceProfile {
    /// Primary device type tag (registry key).
    pub device_type: String,
    pub name: String,
    pub description: String,
    /// Additional tags resolving to this profile.
    pub supported_types: Vec<String>,
    pub connection_params: ConnectionParams,
    pub command_params: CommandParams,
    /// Per-command overrides, keyed by a descriptive name.
    pub commands: BTreeMap<String, CommandOverride>,
    pub prompt_patterns: Vec<String>,
    pub error_patterns: Vec<String>,
    /// Pager prompts answered automatically (e.g. `---- More ----`).
    pub more_patterns: Vec<String>,
    pub paging_commands: PagingCommands,
    pub device_info: DeviceInfo,
}

/// Lower-cased, trimmed form used for command and type lookups.
pub fn normalize(text: &str) -> String {
    text.trim().to_ascii_lowercase()
}

impl DeviceProfile {
    /// Finds the override whose command text matches, ignoring case and surrounding space.
    pub fn command_override(&self, command: &str) -> Option<(&str, &CommandOverride)> {
        let wanted = normalize(command);
        self.commands
            .iter()
            .find(|(_, o)| normalize(&o.command) == wanted)
            .map(|(key, o)| (key.as_str(), o))
    }

    /// All tags this profile answers to, primary first, normalized.
    pub fn all_types(&self) -> Vec<String> {
        let mut types = vec![normalize(&self.device_type)];
        for alias in &self.supported_types {
            let alias = normalize(alias);
            if !alias.is_empty() && !types.contains(&alias) {
                types.push(alias);
            }
        }
        types
    }

    /// Checks that the profile is usable: a type tag and compilable patterns.
    pub fn validate(&self) -> Result<(), CollectorError> {
        if self.device_type.trim().is_empty() {
            return Err(CollectorError::ProfileSource(format!(
                "profile '{}' has no device_type",
                self.name
            )));
        }
        for (label, patterns) in [
            ("prompt_patterns", &self.prompt_patterns),
            ("error_patterns", &self.error_patterns),
            ("more_patterns", &self.more_patterns),
        ] {
            RegexSet::new(patterns).map_err(|e| {
                CollectorError::ProfileSource(format!(
                    "profile '{}' has invalid {label}: {e}",
                    self.device_type
                ))
            })?;
        }
        let invalid = |what: &str, reason: String| {
            CollectorError::ProfileSource(format!(
                "profile '{}' has invalid {what}: {reason}",
                self.device_type
            ))
        };
        self.connection_params
            .check()
            .map_err(|r| invalid("connection_params", r))?;
        self.command_params
            .check()
            .map_err(|r| invalid("command_params", r))?;
        for (key, o) in &self.commands {
            if o.command.trim().is_empty() {
                return Err(CollectorError::ProfileSource(format!(
                    "profile '{}' command override '{key}' has no command text",
                    self.device_type
                )));
            }
            o.params
                .check()
                .map_err(|r| invalid(&format!("command override '{key}'"), r))?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn command_override_lookup_ignores_case_and_whitespace() {
        let profile = builtin::huawei();
        let (key, o) = profile
            .command_override("  DISPLAY Current-Configuration ")
            .expect("override present");
        assert_eq!(key, "display_current_configuration");
        assert_eq!(o.params.max_loops, Some(2000));
    }

    #[test]
    fn prefix_does_not_match_longer_command() {
        let profile = builtin::huawei();
        let (key, _) = profile.command_override("display current").unwrap();
        assert_eq!(key, "display_current");
        assert!(profile.command_override("display cur").is_none());
    }

    #[test]
    fn invalid_pattern_fails_validation() {
        let profile = DeviceProfile {
            device_type: "broken".to_string(),
            prompt_patterns: vec!["([".to_string()],
            ..Default::default()
        };
        assert!(matches!(
            profile.validate(),
            Err(CollectorError::ProfileSource(_))
        ));
    }

    #[test]
    fn out_of_range_timing_fails_validation() {
        let mut runaway = builtin::huawei();
        runaway
            .commands
            .get_mut("display_current_configuration")
            .unwrap()
            .params
            .delay_factor = Some(1e20);
        let err = runaway.validate().unwrap_err().to_string();
        assert!(err.contains("display_current_configuration"), "{err}");

        let mut loops = builtin::cisco_ios();
        loops.command_params.max_loops = Some(u32::MAX);
        assert!(loops.validate().is_err());

        let mut global = builtin::linux();
        global.connection_params.global_delay_factor = Some(f64::INFINITY);
        assert!(global.validate().is_err());

        let mut banner = builtin::hp_comware();
        banner.connection_params.banner_timeout_secs = Some(0);
        assert!(banner.validate().is_err());
    }

    #[test]
    fn profile_json_parses_with_flattened_override_params() {
        let json = r#"{
            "device_type": "ruijie",
            "supported_types": ["Ruijie_OS"],
            "command_params": {"delay_factor": 2.0},
            "commands": {
                "show_run": {"command": "show running-config", "max_loops": 900}
            },
            "prompt_patterns": [".*#"]
        }"#;
        let profile: DeviceProfile = serde_json::from_str(json).unwrap();
        profile.validate().unwrap();
        assert_eq!(profile.all_types(), vec!["ruijie", "ruijie_os"]);
        assert_eq!(profile.commands["show_run"].params.max_loops, Some(900));
        assert_eq!(profile.command_params.expect_string, None);
    }
}
