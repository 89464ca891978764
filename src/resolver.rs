//! Command parameter resolution.
//!
//! Merges a caller [`CommandSpec`] with the matching [`DeviceProfile`]:
//! generic defaults first, then the per-command override, never touching a
//! field the caller set. Pure; no I/O.

use std::time::Duration;

use log::debug;
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

use crate::profile::{CommandParams, DeviceProfile, ProfileLookup};
use crate::task::CommandSpec;

pub const DEFAULT_DELAY_FACTOR: f64 = 1.0;
pub const DEFAULT_MAX_LOOPS: u32 = 500;
/// Poll interval behind `max_loops`.
pub const LOOP_INTERVAL: Duration = Duration::from_millis(200);
/// Largest accepted `delay_factor`, for callers and profiles alike.
pub const MAX_DELAY_FACTOR: f64 = 100.0;
/// Largest accepted `max_loops`.
pub const MAX_LOOPS_LIMIT: u32 = 100_000;
/// Ceiling for any computed read budget.
pub const MAX_READ_TIMEOUT: Duration = Duration::from_secs(24 * 60 * 60);

fn unit_factor() -> f64 {
    DEFAULT_DELAY_FACTOR
}

/// A command with every parameter materialized.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, JsonSchema)]
pub struct EffectiveCommand {
    pub command: String,
    /// `None` means the prompt is auto-detected from the profile patterns.
    pub expect_string: Option<String>,
    pub delay_factor: f64,
    pub max_loops: u32,
    /// Profile-wide multiplier on top of `delay_factor`.
    #[serde(default = "unit_factor")]
    pub global_delay_factor: f64,
    /// Hard ceiling on the read, from the profile's command or connection timeouts.
    #[serde(default)]
    pub read_cap_secs: Option<u64>,
}

impl EffectiveCommand {
    /// Read budget for one command:
    /// `max_loops * 200ms * delay_factor * global_delay_factor`, bounded by
    /// `read_cap_secs` and saturating at [`MAX_READ_TIMEOUT`].
    pub fn read_timeout(&self) -> Duration {
        let factor = (self.delay_factor * self.global_delay_factor).max(0.0);
        let budget = LOOP_INTERVAL
            .checked_mul(self.max_loops)
            .and_then(|base| Duration::try_from_secs_f64(base.as_secs_f64() * factor).ok())
            .map_or(MAX_READ_TIMEOUT, |d| d.min(MAX_READ_TIMEOUT));
        match self.read_cap_secs {
            Some(cap) => budget.min(Duration::from_secs(cap)),
            None => budget,
        }
    }
}

/// Overlays `params` onto fields still unset in `spec`.
fn fill_unset(spec: &mut CommandSpec, params: &CommandParams) {
    if spec.expect_string.is_none() {
        spec.expect_string = params.expect_string.clone();
    }
    if spec.delay_factor.is_none() {
        spec.delay_factor = params.delay_factor;
    }
    if spec.max_loops.is_none() {
        spec.max_loops = params.max_loops;
    }
}

/// Resolves a caller spec against a profile, leaving built-in defaults unapplied.
///
/// Command-specific overrides beat generic profile defaults; caller values beat both.
pub fn overlay(spec: &CommandSpec, profile: Option<&DeviceProfile>) -> CommandSpec {
    let Some(profile) = profile else {
        return spec.clone();
    };

    let mut specific = spec.clone();
    if let Some((key, o)) = profile.command_override(&spec.command) {
        debug!(
            "Applying {} command override '{}' to '{}'",
            profile.device_type, key, spec.command
        );
        fill_unset(&mut specific, &o.params);
    }
    fill_unset(&mut specific, &profile.command_params);
    specific
}

/// Materializes built-in defaults for anything the caller and profile left unset.
pub fn materialize(spec: CommandSpec) -> EffectiveCommand {
    EffectiveCommand {
        command: spec.command,
        expect_string: spec.expect_string,
        delay_factor: spec.delay_factor.unwrap_or(DEFAULT_DELAY_FACTOR),
        max_loops: spec.max_loops.unwrap_or(DEFAULT_MAX_LOOPS),
        global_delay_factor: DEFAULT_DELAY_FACTOR,
        read_cap_secs: None,
    }
}

/// Read ceiling for `command`: its override's `timeout_secs`, then the generic
/// one, then the connection-level `read_timeout_secs`.
fn read_cap(command: &str, profile: &DeviceProfile) -> Option<u64> {
    profile
        .command_override(command)
        .and_then(|(_, o)| o.params.timeout_secs)
        .or(profile.command_params.timeout_secs)
        .or(profile.connection_params.read_timeout_secs)
}

/// Resolves one command against an optional profile.
pub fn resolve(spec: &CommandSpec, profile: Option<&DeviceProfile>) -> EffectiveCommand {
    let mut effective = materialize(overlay(spec, profile));
    if let Some(profile) = profile {
        effective.global_delay_factor = profile
            .connection_params
            .global_delay_factor
            .unwrap_or(DEFAULT_DELAY_FACTOR);
        effective.read_cap_secs = read_cap(&spec.command, profile);
    }
    effective
}

/// Resolves commands by device type through a profile lookup.
pub struct CommandResolver<'a> {
    profiles: &'a dyn ProfileLookup,
}

impl<'a> CommandResolver<'a> {
    pub fn new(profiles: &'a dyn ProfileLookup) -> Self {
        Self { profiles }
    }

    pub fn resolve(&self, spec: &CommandSpec, device_type: &str) -> EffectiveCommand {
        let profile = self.profiles.get_profile(device_type);
        resolve(spec, profile.as_deref())
    }

    /// Resolves a command list, preserving order.
    pub fn resolve_all(&self, specs: &[CommandSpec], device_type: &str) -> Vec<EffectiveCommand> {
        let profile = self.profiles.get_profile(device_type);
        specs
            .iter()
            .map(|spec| resolve(spec, profile.as_deref()))
            .collect()
    }
}
