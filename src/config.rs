//! # Gateway Configuration
//!
//! Loads the JSON configuration files and resolves them into an immutable
//! [`GatewayConfig`]. `debug_conf.json`, when present and readable, is used
//! alone; otherwise `global_conf.json` is loaded and `local_conf.json`
//! overlays it key by key. The files may carry `//` and `/* */` comments.
//!
//! Only the `gateway_conf` object is interpreted here; radio tuning sections
//! (`SX1301_conf` and friends) belong to the concentrator HAL and are
//! tolerated but not parsed.

use std::fmt::Write as _;
use std::fs;
use std::path::Path;

use log::{info, warn};
use serde::Deserialize;

use crate::constants::{DEFAULT_KEEPALIVE_S, DEFAULT_STAT_INTERVAL_S, MAX_SERVERS, PUSH_TIMEOUT_MS};
use crate::error::FwdError;
use crate::hal::gps::Coord;
use crate::util::strip_json_comments;

const GLOBAL_CONF: &str = "global_conf.json";
const LOCAL_CONF: &str = "local_conf.json";
const DEBUG_CONF: &str = "debug_conf.json";

// Status-report identity fields are length-bounded so the rendered fragment
// always fits its buffer.
const PLATFORM_MAX: usize = 24;
const EMAIL_MAX: usize = 40;
const DESCRIPTION_MAX: usize = 64;

/// One server entry of the `servers` array.
#[derive(Debug, Clone, Deserialize)]
pub struct ServerEntry {
    pub server_address: Option<String>,
    pub serv_port_up: Option<u16>,
    pub serv_port_down: Option<u16>,
    pub serv_enabled: Option<bool>,
}

/// The `gateway_conf` object of one configuration file; every key optional so
/// files can be overlaid.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct PartialGatewayConf {
    #[serde(rename = "gateway_ID")]
    pub gateway_id: Option<String>,
    pub servers: Option<Vec<ServerEntry>>,
    // Legacy single-server definition, used only when `servers` is absent.
    pub server_address: Option<String>,
    pub serv_port_up: Option<u16>,
    pub serv_port_down: Option<u16>,
    pub keepalive_interval: Option<u64>,
    pub stat_interval: Option<u64>,
    pub push_timeout_ms: Option<u64>,
    pub autoquit_threshold: Option<u32>,
    pub forward_crc_valid: Option<bool>,
    pub forward_crc_error: Option<bool>,
    pub forward_crc_disabled: Option<bool>,
    pub upstream: Option<bool>,
    pub downstream: Option<bool>,
    pub ghoststream: Option<bool>,
    pub radiostream: Option<bool>,
    pub statusstream: Option<bool>,
    pub gps: Option<bool>,
    pub beacon: Option<bool>,
    pub monitor: Option<bool>,
    pub beacon_period: Option<u32>,
    pub beacon_offset: Option<u32>,
    pub beacon_freq_hz: Option<u32>,
    pub gps_tty_path: Option<String>,
    pub fake_gps: Option<bool>,
    pub ref_latitude: Option<f64>,
    pub ref_longitude: Option<f64>,
    pub ref_altitude: Option<i32>,
    pub ghost_address: Option<String>,
    pub ghost_port: Option<u16>,
    pub monitor_address: Option<String>,
    pub monitor_port: Option<u16>,
    pub platform: Option<String>,
    pub contact_email: Option<String>,
    pub description: Option<String>,
}

#[derive(Debug, Deserialize)]
struct ConfigFile {
    gateway_conf: Option<PartialGatewayConf>,
}

/// A fully configured server target.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ServerConf {
    pub address: String,
    pub port_up: u16,
    pub port_down: u16,
}

/// Resolved, immutable-after-startup gateway configuration.
#[derive(Debug, Clone)]
pub struct GatewayConfig {
    /// 64-bit gateway MAC.
    pub gateway_id: u64,
    /// Enabled, fully specified servers; at most [`MAX_SERVERS`].
    pub servers: Vec<ServerConf>,
    pub keepalive_s: u64,
    pub stat_interval_s: u64,
    pub push_timeout_ms: u64,
    /// Non-acknowledged PULL_DATA count triggering shutdown; 0 disables.
    pub autoquit_threshold: u32,
    pub forward_crc_valid: bool,
    pub forward_crc_error: bool,
    pub forward_crc_disabled: bool,
    pub upstream_enabled: bool,
    pub downstream_enabled: bool,
    pub ghoststream_enabled: bool,
    pub radiostream_enabled: bool,
    pub statusstream_enabled: bool,
    pub gps_enabled: bool,
    pub beacon_enabled: bool,
    pub monitor_enabled: bool,
    /// Beaconing period in seconds; must divide 86400. 0 disables.
    pub beacon_period: u32,
    pub beacon_offset: u32,
    pub beacon_freq_hz: u32,
    pub gps_tty_path: String,
    pub fake_gps: bool,
    pub reference_coord: Coord,
    pub ghost_address: String,
    pub ghost_port: u16,
    pub monitor_address: String,
    pub monitor_port: u16,
    pub platform: String,
    pub contact_email: String,
    pub description: String,
}

impl Default for GatewayConfig {
    fn default() -> Self {
        GatewayConfig {
            gateway_id: 0,
            servers: Vec::new(),
            keepalive_s: DEFAULT_KEEPALIVE_S,
            stat_interval_s: DEFAULT_STAT_INTERVAL_S,
            push_timeout_ms: PUSH_TIMEOUT_MS,
            autoquit_threshold: 0,
            forward_crc_valid: true,
            forward_crc_error: false,
            forward_crc_disabled: false,
            upstream_enabled: true,
            downstream_enabled: true,
            ghoststream_enabled: false,
            radiostream_enabled: true,
            statusstream_enabled: true,
            gps_enabled: false,
            beacon_enabled: false,
            monitor_enabled: false,
            beacon_period: 128,
            beacon_offset: 0,
            beacon_freq_hz: 0,
            gps_tty_path: String::new(),
            fake_gps: false,
            reference_coord: Coord::default(),
            ghost_address: "127.0.0.1".into(),
            ghost_port: 1914,
            monitor_address: "127.0.0.1".into(),
            monitor_port: 2008,
            platform: "unknown".into(),
            contact_email: String::new(),
            description: String::new(),
        }
    }
}

fn parse_file(path: &Path) -> Result<PartialGatewayConf, FwdError> {
    let raw = fs::read_to_string(path)
        .map_err(|e| FwdError::ConfigError(format!("cannot read {}: {e}", path.display())))?;
    let file: ConfigFile = serde_json::from_str(&strip_json_comments(&raw))
        .map_err(|e| FwdError::ConfigError(format!("{} is not valid JSON: {e}", path.display())))?;
    match file.gateway_conf {
        Some(conf) => Ok(conf),
        None => {
            info!(
                "{} does not contain a gateway_conf object, using defaults",
                path.display()
            );
            Ok(PartialGatewayConf::default())
        }
    }
}

impl PartialGatewayConf {
    /// Overlays `other` on `self`: keys present in `other` win.
    fn merge(&mut self, other: PartialGatewayConf) {
        macro_rules! take {
            ($($field:ident),+ $(,)?) => {
                $(if other.$field.is_some() { self.$field = other.$field; })+
            };
        }
        take!(
            gateway_id,
            servers,
            server_address,
            serv_port_up,
            serv_port_down,
            keepalive_interval,
            stat_interval,
            push_timeout_ms,
            autoquit_threshold,
            forward_crc_valid,
            forward_crc_error,
            forward_crc_disabled,
            upstream,
            downstream,
            ghoststream,
            radiostream,
            statusstream,
            gps,
            beacon,
            monitor,
            beacon_period,
            beacon_offset,
            beacon_freq_hz,
            gps_tty_path,
            fake_gps,
            ref_latitude,
            ref_longitude,
            ref_altitude,
            ghost_address,
            ghost_port,
            monitor_address,
            monitor_port,
            platform,
            contact_email,
            description,
        );
    }

    fn resolve_servers(&self) -> Vec<ServerConf> {
        let mut out = Vec::new();
        if let Some(entries) = &self.servers {
            info!("Found {} servers in array", entries.len());
            for entry in entries {
                if out.len() >= MAX_SERVERS {
                    warn!("More than {MAX_SERVERS} servers configured, ignoring the rest");
                    break;
                }
                let Some(address) = entry.server_address.clone() else {
                    continue;
                };
                let (Some(port_up), Some(port_down)) = (entry.serv_port_up, entry.serv_port_down)
                else {
                    info!("Skipping server \"{address}\" with missing port number");
                    continue;
                };
                if entry.serv_enabled == Some(false) {
                    info!("Skipping disabled server \"{address}\"");
                    continue;
                }
                info!(
                    "Server {} configured to \"{address}\", port up {port_up}, port down {port_down}",
                    out.len()
                );
                out.push(ServerConf {
                    address,
                    port_up,
                    port_down,
                });
            }
        } else if let (Some(address), Some(port_up), Some(port_down)) = (
            self.server_address.clone(),
            self.serv_port_up,
            self.serv_port_down,
        ) {
            info!("Server configured to \"{address}\", port up {port_up}, port down {port_down}");
            out.push(ServerConf {
                address,
                port_up,
                port_down,
            });
        }
        if out.is_empty() {
            info!("No server configured, using defaults");
            out.push(ServerConf {
                address: "127.0.0.1".into(),
                port_up: 1780,
                port_down: 1782,
            });
        }
        out
    }

    /// Applies the partial configuration over the documented defaults.
    fn resolve(self) -> GatewayConfig {
        let mut cfg = GatewayConfig {
            servers: self.resolve_servers(),
            ..GatewayConfig::default()
        };

        if let Some(id) = &self.gateway_id {
            match u64::from_str_radix(id.trim_start_matches("0x"), 16) {
                Ok(mac) => {
                    cfg.gateway_id = mac;
                    info!("Gateway MAC address is configured to {mac:016X}");
                }
                Err(_) => warn!("gateway_ID \"{id}\" is not a hexadecimal MAC, keeping 0"),
            }
        }
        if let Some(v) = self.keepalive_interval {
            cfg.keepalive_s = v;
        }
        if let Some(v) = self.stat_interval {
            if v == 0 {
                warn!("stat_interval of 0 is not usable, keeping {} s", cfg.stat_interval_s);
            } else {
                cfg.stat_interval_s = v;
            }
        }
        if let Some(v) = self.push_timeout_ms {
            cfg.push_timeout_ms = v;
        }
        if let Some(v) = self.autoquit_threshold {
            cfg.autoquit_threshold = v;
        }
        if let Some(v) = self.forward_crc_valid {
            cfg.forward_crc_valid = v;
        }
        if let Some(v) = self.forward_crc_error {
            cfg.forward_crc_error = v;
        }
        if let Some(v) = self.forward_crc_disabled {
            cfg.forward_crc_disabled = v;
        }
        if let Some(v) = self.upstream {
            cfg.upstream_enabled = v;
        }
        if let Some(v) = self.downstream {
            cfg.downstream_enabled = v;
        }
        if let Some(v) = self.ghoststream {
            cfg.ghoststream_enabled = v;
        }
        if let Some(v) = self.radiostream {
            cfg.radiostream_enabled = v;
        }
        if let Some(v) = self.statusstream {
            cfg.statusstream_enabled = v;
        }
        if let Some(v) = self.gps {
            cfg.gps_enabled = v;
        }
        if let Some(v) = self.beacon {
            cfg.beacon_enabled = v;
        }
        if let Some(v) = self.monitor {
            cfg.monitor_enabled = v;
        }
        if let Some(v) = self.beacon_period {
            cfg.beacon_period = v;
        }
        if let Some(v) = self.beacon_offset {
            cfg.beacon_offset = v;
        }
        if let Some(v) = self.beacon_freq_hz {
            cfg.beacon_freq_hz = v;
        }
        if let Some(v) = self.gps_tty_path {
            cfg.gps_tty_path = v;
        }
        if let Some(v) = self.fake_gps {
            cfg.fake_gps = v;
        }
        if let Some(v) = self.ref_latitude {
            cfg.reference_coord.lat = v;
        }
        if let Some(v) = self.ref_longitude {
            cfg.reference_coord.lon = v;
        }
        if let Some(v) = self.ref_altitude {
            cfg.reference_coord.alt = v;
        }
        if let Some(v) = self.ghost_address {
            cfg.ghost_address = v;
        }
        if let Some(v) = self.ghost_port {
            cfg.ghost_port = v;
        }
        if let Some(v) = self.monitor_address {
            cfg.monitor_address = v;
        }
        if let Some(v) = self.monitor_port {
            cfg.monitor_port = v;
        }
        // "*" keeps the built-in platform name.
        if let Some(v) = self.platform {
            if v != "*" {
                cfg.platform = clip(v, PLATFORM_MAX);
            }
        }
        if let Some(v) = self.contact_email {
            cfg.contact_email = clip(v, EMAIL_MAX);
        }
        if let Some(v) = self.description {
            cfg.description = clip(v, DESCRIPTION_MAX);
        }
        cfg
    }
}

/// Truncates a string to at most `max` bytes on a character boundary.
fn clip(mut s: String, max: usize) -> String {
    if s.len() > max {
        warn!("Configuration string \"{s}\" exceeds {max} bytes, truncating");
        let mut end = max;
        while !s.is_char_boundary(end) {
            end -= 1;
        }
        s.truncate(end);
    }
    s
}

/// Loads and resolves the gateway configuration from `dir`, honouring the
/// file precedence rules.
pub fn load(dir: &Path) -> Result<GatewayConfig, FwdError> {
    let debug_path = dir.join(DEBUG_CONF);
    let global_path = dir.join(GLOBAL_CONF);
    let local_path = dir.join(LOCAL_CONF);

    let partial = if debug_path.is_file() {
        info!(
            "Found debug configuration file {}, other files will be ignored",
            debug_path.display()
        );
        parse_file(&debug_path)?
    } else if global_path.is_file() {
        info!("Found global configuration file {}", global_path.display());
        let mut conf = parse_file(&global_path)?;
        if local_path.is_file() {
            info!(
                "Found local configuration file {}, redefined parameters overwrite global ones",
                local_path.display()
            );
            conf.merge(parse_file(&local_path)?);
        }
        conf
    } else if local_path.is_file() {
        info!("Found local configuration file {}", local_path.display());
        parse_file(&local_path)?
    } else {
        let mut msg = String::new();
        let _ = write!(
            msg,
            "no configuration file found ({GLOBAL_CONF}, {LOCAL_CONF} or {DEBUG_CONF} in {})",
            dir.display()
        );
        return Err(FwdError::ConfigError(msg));
    };

    Ok(partial.resolve())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;

    fn write_conf(dir: &Path, name: &str, body: &str) {
        fs::write(dir.join(name), body).unwrap();
    }

    #[test]
    fn test_commented_configuration_parses() {
        let dir = tempfile::tempdir().unwrap();
        write_conf(
            dir.path(),
            GLOBAL_CONF,
            "{\n  /* gateway section */\n  \"gateway_conf\": {\n    \"stat_interval\": 12 // seconds\n  }\n}",
        );
        let cfg = load(dir.path()).unwrap();
        assert_eq!(cfg.stat_interval_s, 12);
    }

    #[test]
    fn test_defaults_without_gateway_conf() {
        let dir = tempfile::tempdir().unwrap();
        write_conf(dir.path(), GLOBAL_CONF, r#"{"SX1301_conf": {}}"#);
        let cfg = load(dir.path()).unwrap();
        assert!(cfg.forward_crc_valid);
        assert!(!cfg.forward_crc_error);
        assert_eq!(cfg.keepalive_s, 5);
        assert_eq!(cfg.stat_interval_s, 30);
        assert_eq!(cfg.push_timeout_ms, 100);
        // Fallback server definition.
        assert_eq!(cfg.servers.len(), 1);
        assert_eq!(cfg.servers[0].port_up, 1780);
    }

    #[test]
    fn test_local_overrides_global() {
        let dir = tempfile::tempdir().unwrap();
        write_conf(
            dir.path(),
            GLOBAL_CONF,
            r#"{"gateway_conf": {"stat_interval": 10, "keepalive_interval": 7}}"#,
        );
        write_conf(
            dir.path(),
            LOCAL_CONF,
            r#"{"gateway_conf": {"stat_interval": 20, "gateway_ID": "AA555A0000000101"}}"#,
        );
        let cfg = load(dir.path()).unwrap();
        assert_eq!(cfg.stat_interval_s, 20);
        assert_eq!(cfg.keepalive_s, 7);
        assert_eq!(cfg.gateway_id, 0xAA55_5A00_0000_0101);
    }

    #[test]
    fn test_debug_conf_wins_alone() {
        let dir = tempfile::tempdir().unwrap();
        write_conf(
            dir.path(),
            GLOBAL_CONF,
            r#"{"gateway_conf": {"stat_interval": 10}}"#,
        );
        write_conf(
            dir.path(),
            DEBUG_CONF,
            r#"{"gateway_conf": {"stat_interval": 12}}"#,
        );
        let cfg = load(dir.path()).unwrap();
        assert_eq!(cfg.stat_interval_s, 12);
    }

    #[test]
    fn test_missing_configuration_is_fatal() {
        let dir = tempfile::tempdir().unwrap();
        assert!(load(dir.path()).is_err());
    }

    #[test]
    fn test_server_array_filtering() {
        let dir = tempfile::tempdir().unwrap();
        write_conf(
            dir.path(),
            GLOBAL_CONF,
            r#"{"gateway_conf": {"servers": [
                {"server_address": "a.example", "serv_port_up": 1700, "serv_port_down": 1701},
                {"server_address": "b.example", "serv_port_up": 1700},
                {"server_address": "c.example", "serv_port_up": 1700, "serv_port_down": 1701,
                 "serv_enabled": false},
                {"serv_port_up": 1700, "serv_port_down": 1701},
                {"server_address": "d.example", "serv_port_up": 1702, "serv_port_down": 1703}
            ]}}"#,
        );
        let cfg = load(dir.path()).unwrap();
        let addrs: Vec<&str> = cfg.servers.iter().map(|s| s.address.as_str()).collect();
        assert_eq!(addrs, vec!["a.example", "d.example"]);
    }

    #[test]
    fn test_server_array_caps_at_four() {
        let dir = tempfile::tempdir().unwrap();
        let entries: Vec<String> = (0..6)
            .map(|i| {
                format!(
                    r#"{{"server_address": "s{i}.example", "serv_port_up": 1700, "serv_port_down": 1701}}"#
                )
            })
            .collect();
        write_conf(
            dir.path(),
            GLOBAL_CONF,
            &format!(r#"{{"gateway_conf": {{"servers": [{}]}}}}"#, entries.join(",")),
        );
        let cfg = load(dir.path()).unwrap();
        assert_eq!(cfg.servers.len(), MAX_SERVERS);
    }

    #[test]
    fn test_legacy_server_definition() {
        let dir = tempfile::tempdir().unwrap();
        write_conf(
            dir.path(),
            GLOBAL_CONF,
            r#"{"gateway_conf": {"server_address": "legacy.example",
                "serv_port_up": 1680, "serv_port_down": 1681}}"#,
        );
        let cfg = load(dir.path()).unwrap();
        assert_eq!(
            cfg.servers,
            vec![ServerConf {
                address: "legacy.example".into(),
                port_up: 1680,
                port_down: 1681
            }]
        );
    }

    #[test]
    fn test_identity_strings_are_bounded() {
        let dir = tempfile::tempdir().unwrap();
        let long = "x".repeat(100);
        write_conf(
            dir.path(),
            GLOBAL_CONF,
            &format!(
                r#"{{"gateway_conf": {{"platform": "{long}", "contact_email": "{long}",
                    "description": "{long}"}}}}"#
            ),
        );
        let cfg = load(dir.path()).unwrap();
        assert_eq!(cfg.platform.len(), PLATFORM_MAX);
        assert_eq!(cfg.contact_email.len(), EMAIL_MAX);
        assert_eq!(cfg.description.len(), DESCRIPTION_MAX);
    }

    #[test]
    fn test_platform_star_keeps_default() {
        let dir = tempfile::tempdir().unwrap();
        write_conf(
            dir.path(),
            GLOBAL_CONF,
            r#"{"gateway_conf": {"platform": "*"}}"#,
        );
        let cfg = load(dir.path()).unwrap();
        assert_eq!(cfg.platform, GatewayConfig::default().platform);
    }
}
