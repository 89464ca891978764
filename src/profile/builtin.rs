//! Compiled-in device profiles.
//!
//! Factory functions for common network device families, pre-configured with
//! their timing defaults, prompts, error messages and paging commands.

use std::collections::BTreeMap;

use super::{
    CommandOverride, CommandParams, ConnectionParams, DeviceInfo, DeviceProfile, PagingCommands,
};

/// Returns every built-in profile.
pub fn all() -> Vec<DeviceProfile> {
    vec![cisco_ios(), huawei(), hp_comware(), linux()]
}

/// Creates a built-in profile by key or alias (case-insensitive).
pub fn by_name(name: &str) -> Option<DeviceProfile> {
    let key = super::normalize(name);
    all().into_iter().find(|p| p.all_types().contains(&key))
}

fn cmd(command: &str, expect: &str, delay_factor: f64, max_loops: u32) -> CommandOverride {
    CommandOverride {
        command: command.to_string(),
        params: CommandParams {
            expect_string: Some(expect.to_string()),
            delay_factor: Some(delay_factor),
            max_loops: Some(max_loops),
            timeout_secs: None,
        },
    }
}

fn commands(entries: Vec<(&str, CommandOverride)>) -> BTreeMap<String, CommandOverride> {
    entries
        .into_iter()
        .map(|(k, v)| (k.to_string(), v))
        .collect()
}

fn strings(items: &[&str]) -> Vec<String> {
    items.iter().map(|s| s.to_string()).collect()
}

/// Cisco IOS / IOS-XE.
pub fn cisco_ios() -> DeviceProfile {
    DeviceProfile {
        device_type: "cisco_ios".to_string(),
        name: "Cisco IOS".to_string(),
        description: "Cisco IOS network devices".to_string(),
        supported_types: strings(&["cisco_xe", "cisco"]),
        connection_params: ConnectionParams {
            global_delay_factor: Some(1.5),
            read_timeout_secs: Some(45),
            session_timeout_secs: Some(60),
            auth_timeout_secs: Some(30),
            banner_timeout_secs: Some(15),
        },
        command_params: CommandParams {
            expect_string: Some("#".to_string()),
            delay_factor: Some(1.5),
            max_loops: Some(500),
            timeout_secs: Some(120),
        },
        commands: commands(vec![
            ("show_version", cmd("show version", "#", 1.0, 200)),
            ("show_running_config", cmd("show running-config", "#", 2.0, 800)),
            ("show_interface", cmd("show interface", "#", 1.5, 400)),
            ("show_ip_route", cmd("show ip route", "#", 1.0, 300)),
        ]),
        prompt_patterns: strings(&[r"^\S+\(\S+\)#\s*$", r"^[^\s#]+#\s*$", r"^[^\s<]+>\s*$"]),
        error_patterns: strings(&[
            r"% Invalid input detected",
            r"% Incomplete command",
            r"% Unrecognized command",
            r"% Ambiguous command",
        ]),
        more_patterns: strings(&[r"\s*--More--\s*$", r"\s*<--- More --->\s*$"]),
        paging_commands: PagingCommands {
            disable_paging: Some("terminal length 0".to_string()),
            enable_paging: Some("terminal length 24".to_string()),
        },
        device_info: DeviceInfo {
            vendor: "Cisco Systems".to_string(),
            os_type: "IOS".to_string(),
            supported_versions: strings(&["12.x", "15.x", "16.x", "17.x"]),
        },
    }
}

/// Huawei VRP.
pub fn huawei() -> DeviceProfile {
    DeviceProfile {
        device_type: "huawei".to_string(),
        name: "Huawei VRP".to_string(),
        description: "Huawei network devices running VRP".to_string(),
        supported_types: strings(&["huawei_vrp", "huawei_vrpv8"]),
        connection_params: ConnectionParams {
            global_delay_factor: Some(3.0),
            read_timeout_secs: Some(90),
            session_timeout_secs: Some(120),
            auth_timeout_secs: Some(60),
            banner_timeout_secs: Some(30),
        },
        command_params: CommandParams {
            expect_string: Some("]".to_string()),
            delay_factor: Some(3.0),
            max_loops: Some(1000),
            timeout_secs: Some(300),
        },
        commands: commands(vec![
            ("display_version", cmd("display version", "]", 2.0, 500)),
            ("display_current", cmd("display current", "]", 3.0, 1000)),
            (
                "display_current_configuration",
                cmd("display current-configuration", "]", 3.0, 2000),
            ),
            ("display_interface", cmd("display interface", "]", 2.0, 800)),
            ("display_ip_routing", cmd("display ip routing-table", "]", 2.0, 500)),
        ]),
        prompt_patterns: strings(&[
            r"^(HRP_M|HRP_S)?\[.+\]\s*$",
            r"^(RBM_P|RBM_S)?<.+>\s*$",
        ]),
        error_patterns: strings(&[
            r"Error: .+$",
            r"Invalid command",
            r"Unrecognized command",
            r"Incomplete command",
        ]),
        more_patterns: strings(&[r"\s*---- More ----\s*$"]),
        paging_commands: PagingCommands {
            disable_paging: Some("screen-length 0 temporary".to_string()),
            enable_paging: Some("undo screen-length".to_string()),
        },
        device_info: DeviceInfo {
            vendor: "Huawei Technologies".to_string(),
            os_type: "VRP".to_string(),
            supported_versions: strings(&["V200R003", "V200R005", "V200R010", "V200R019"]),
        },
    }
}

/// H3C / HP Comware.
pub fn hp_comware() -> DeviceProfile {
    DeviceProfile {
        device_type: "hp_comware".to_string(),
        name: "H3C Comware".to_string(),
        description: "H3C / HP Comware network devices".to_string(),
        supported_types: strings(&["h3c", "h3c_comware"]),
        connection_params: ConnectionParams {
            global_delay_factor: Some(2.0),
            read_timeout_secs: Some(60),
            session_timeout_secs: Some(90),
            auth_timeout_secs: Some(30),
            banner_timeout_secs: Some(20),
        },
        command_params: CommandParams {
            expect_string: Some(">".to_string()),
            delay_factor: Some(2.0),
            max_loops: Some(500),
            timeout_secs: Some(180),
        },
        commands: commands(vec![
            ("display_version", cmd("display version", ">", 1.5, 300)),
            (
                "display_current_configuration",
                cmd("display current-configuration", ">", 2.0, 1000),
            ),
            ("display_interface", cmd("display interface", ">", 2.0, 600)),
            ("display_ip_routing", cmd("display ip routing-table", ">", 1.5, 400)),
        ]),
        prompt_patterns: strings(&[r"^(RBM_P|RBM_S)?\[.+\]\s*$", r"^(RBM_P|RBM_S)?<.+>\s*$"]),
        error_patterns: strings(&[
            r"% Unrecognized command",
            r"% Incomplete command",
            r"% Invalid input",
            r"Error:",
        ]),
        more_patterns: strings(&[r"\s*---- More ----\s*$"]),
        paging_commands: PagingCommands {
            disable_paging: Some("screen-length disable".to_string()),
            enable_paging: Some("undo screen-length disable".to_string()),
        },
        device_info: DeviceInfo {
            vendor: "New H3C Technologies".to_string(),
            os_type: "Comware".to_string(),
            supported_versions: strings(&["V5", "V7"]),
        },
    }
}

/// Generic Linux shell. No command overrides; bash-style prompts.
pub fn linux() -> DeviceProfile {
    DeviceProfile {
        device_type: "linux".to_string(),
        name: "Linux".to_string(),
        description: "Generic Linux/Unix hosts".to_string(),
        supported_types: strings(&["linux_ssh", "generic"]),
        connection_params: ConnectionParams {
            global_delay_factor: Some(1.0),
            read_timeout_secs: Some(60),
            ..Default::default()
        },
        command_params: CommandParams::default(),
        commands: BTreeMap::new(),
        prompt_patterns: strings(&[r"[\$#]\s*$"]),
        error_patterns: strings(&[r"command not found$", r"No such file or directory$"]),
        more_patterns: strings(&[r"--More--\s*$"]),
        paging_commands: PagingCommands::default(),
        device_info: DeviceInfo {
            vendor: "Linux".to_string(),
            os_type: "Linux".to_string(),
            supported_versions: Vec::new(),
        },
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn builtin_profiles_validate() {
        for profile in all() {
            profile
                .validate()
                .unwrap_or_else(|e| panic!("{} invalid: {e}", profile.device_type));
        }
    }

    #[test]
    fn by_name_resolves_aliases() {
        assert_eq!(by_name("H3C").unwrap().device_type, "hp_comware");
        assert_eq!(by_name("huawei_vrpv8").unwrap().device_type, "huawei");
        assert!(by_name("juniper").is_none());
    }

    #[test]
    fn catalog_has_one_profile_per_family() {
        let keys: Vec<String> = all().into_iter().map(|p| p.device_type).collect();
        assert_eq!(keys, ["cisco_ios", "huawei", "hp_comware", "linux"]);
    }
}
