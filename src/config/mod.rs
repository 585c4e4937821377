use anyhow::Context;
use ipnetwork::{IpNetwork, Ipv4Network};
use serde::{Deserialize, Serialize};
use std::env;
use std::fs;
use std::path::{Path, PathBuf};

use crate::error::{CniError, Result};
use crate::types::SUPPORTED_VERSIONS;

/// Prefix of the transient veth names created by this plugin
pub const VETH_PREFIX: &str = "pisp";

/// Longest interface name the kernel accepts (IFNAMSIZ minus the NUL)
pub const MAX_IFNAME_LEN: usize = 15;

pub const DEFAULT_REGISTRY_DIR: &str = "/var/run/netns";
pub const DEFAULT_LOG_FILE: &str = "/var/log/pigeon-cni-plugin.log";

/// Process-level settings taken from the environment
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Settings {
    /// Directory holding the namespace registry symlinks
    pub registry_dir: PathBuf,
    /// Debug log destination, only used when debugging is on
    pub log_file: PathBuf,
    /// `DEBUG` was set to a non-empty value
    pub debug: bool,
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            registry_dir: PathBuf::from(DEFAULT_REGISTRY_DIR),
            log_file: PathBuf::from(DEFAULT_LOG_FILE),
            debug: false,
        }
    }
}

impl Settings {
    /// Read `PISP_NETNS_DIR`, `PISP_LOG_FILE` and `DEBUG`
    pub fn from_env() -> Self {
        Self::from_lookup(|key| env::var(key).ok())
    }

    pub fn from_lookup<F>(lookup: F) -> Self
    where
        F: Fn(&str) -> Option<String>,
    {
        let defaults = Self::default();
        let non_empty = |key: &str| lookup(key).filter(|v| !v.is_empty());

        Self {
            registry_dir: non_empty("PISP_NETNS_DIR")
                .map(PathBuf::from)
                .unwrap_or(defaults.registry_dir),
            log_file: non_empty("PISP_LOG_FILE")
                .map(PathBuf::from)
                .unwrap_or(defaults.log_file),
            debug: non_empty("DEBUG").is_some(),
        }
    }
}

/// Network configuration for a point-to-point attachment
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NetConf {
    /// CNI specification version
    #[serde(rename = "cniVersion")]
    pub cni_version: String,
    /// Name of the attachment, part of the session key
    pub name: String,
    /// Type of CNI plugin
    #[serde(rename = "type", default, skip_serializing_if = "Option::is_none")]
    pub plugin_type: Option<String>,
    /// Address of the client end, in CIDR form
    pub client_address: String,
    /// Address of the gateway end, in CIDR form
    pub gw_address: String,
    /// Subnet of the attachment
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub subnet: Option<String>,
    /// Interface name used by the client role
    pub client_interface: String,
    /// Interface name used by the gateway role
    pub gateway_interface: String,
    /// Turn transmit checksum offload off on configured interfaces
    #[serde(default, skip_serializing_if = "std::ops::Not::not")]
    pub disable_tx_offload: bool,
}

impl NetConf {
    /// Parse NetConf from bytes
    pub fn parse(bytes: &[u8]) -> Result<Self> {
        let conf: NetConf = serde_json::from_slice(bytes).map_err(|e| {
            CniError::Config(format!("failed to parse network configuration: {}", e))
        })?;

        if !SUPPORTED_VERSIONS.contains(&conf.cni_version.as_str()) {
            return Err(CniError::IncompatibleVersion(conf.cni_version));
        }

        if conf.name.is_empty() {
            return Err(CniError::Config("name is required".to_string()));
        }

        validate_key_part("name", &conf.name)?;
        validate_role_interface("client_interface", &conf.client_interface)?;
        validate_role_interface("gateway_interface", &conf.gateway_interface)?;

        if let Some(subnet) = &conf.subnet {
            subnet.parse::<IpNetwork>().map_err(|e| {
                CniError::Config(format!("invalid subnet {}: {}", subnet, e))
            })?;
        }

        Ok(conf)
    }

    /// Key of the peer session namespace entry in the registry
    pub fn session_key(&self) -> String {
        format!(
            "{}-{}-{}",
            self.client_interface, self.name, self.gateway_interface
        )
    }
}

/// Transient name a role interface carries before it is moved and renamed
pub fn transient_name(role_interface: &str) -> String {
    format!("{}{}", VETH_PREFIX, role_interface)
}

/// Parse an IPv4 address that must be written in CIDR form
pub fn parse_cidr(field: &str, value: &str) -> Result<Ipv4Network> {
    if !value.contains('/') {
        return Err(CniError::Address(format!(
            "{} {:?} is not in CIDR notation",
            field, value
        )));
    }

    value
        .parse::<Ipv4Network>()
        .map_err(|e| CniError::Address(format!("failed to parse {} {:?}: {}", field, value, e)))
}

fn validate_key_part(field: &str, value: &str) -> Result<()> {
    if value.contains('/') || value == "." || value == ".." || value.contains('\0') {
        return Err(CniError::Config(format!(
            "{} {:?} cannot be used in a registry key",
            field, value
        )));
    }
    Ok(())
}

fn validate_role_interface(field: &str, value: &str) -> Result<()> {
    if value.is_empty() {
        return Err(CniError::Config(format!("{} is required", field)));
    }

    validate_key_part(field, value)?;

    if value.contains(char::is_whitespace) || value.contains(':') {
        return Err(CniError::Config(format!(
            "{} {:?} is not a valid interface name",
            field, value
        )));
    }

    let transient = transient_name(value);
    if transient.len() > MAX_IFNAME_LEN {
        return Err(CniError::Config(format!(
            "{} {:?} is too long: {:?} exceeds {} bytes",
            field, value, transient, MAX_IFNAME_LEN
        )));
    }

    Ok(())
}

/// Conflist written for one role of an attachment
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NetConfList {
    #[serde(rename = "cniVersion")]
    pub cni_version: String,
    pub name: String,
    pub plugins: Vec<NetConf>,
}

impl NetConfList {
    pub fn single(conf: NetConf) -> Self {
        Self {
            cni_version: conf.cni_version.clone(),
            name: conf.name.clone(),
            plugins: vec![conf],
        }
    }
}

/// Installer layout for the plugin binary and its network configs
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct InstallConfig {
    /// Path to the CNI bin directory
    pub cni_bin_dir: PathBuf,
    /// Path to the CNI config directory
    pub cni_conf_dir: PathBuf,
    /// Namespace registry directory
    pub registry_dir: PathBuf,
}

impl Default for InstallConfig {
    fn default() -> Self {
        Self {
            cni_bin_dir: PathBuf::from("/opt/cni/bin"),
            cni_conf_dir: PathBuf::from("/etc/cni/net.d"),
            registry_dir: PathBuf::from(DEFAULT_REGISTRY_DIR),
        }
    }
}

/// Installer for the plugin
pub struct Installer {
    config: InstallConfig,
}

impl Installer {
    /// Create a new installer
    pub fn new(config: InstallConfig) -> Self {
        Self { config }
    }

    /// Copy the plugin binary into the CNI bin directory and write `conf`
    /// as a conflist. Returns the path of the written conflist.
    pub fn install(&self, plugin_binary: &Path, conf: &NetConf) -> anyhow::Result<PathBuf> {
        for dir in [
            &self.config.cni_bin_dir,
            &self.config.cni_conf_dir,
            &self.config.registry_dir,
        ] {
            fs::create_dir_all(dir)
                .with_context(|| format!("Failed to create directory: {}", dir.display()))?;
        }

        let target = self.config.cni_bin_dir.join("pisp-cni");
        fs::copy(plugin_binary, &target).with_context(|| {
            format!(
                "Failed to copy {} to {}",
                plugin_binary.display(),
                target.display()
            )
        })?;

        let config_path = self
            .config
            .cni_conf_dir
            .join(format!("10-pisp-{}.conflist", conf.session_key()));
        let json = serde_json::to_string_pretty(&NetConfList::single(conf.clone()))?;
        fs::write(&config_path, json)
            .with_context(|| format!("Failed to write CNI config to {}", config_path.display()))?;

        Ok(config_path)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn sample() -> serde_json::Value {
        serde_json::json!({
            "cniVersion": "1.0.0",
            "name": "mesh",
            "type": "pisp-cni",
            "client_address": "10.12.0.3/32",
            "gw_address": "10.12.0.2/32",
            "subnet": "10.12.0.0/24",
            "client_interface": "wg0",
            "gateway_interface": "gw0"
        })
    }

    #[test]
    fn parses_valid_config() {
        let conf = NetConf::parse(sample().to_string().as_bytes()).unwrap();
        assert_eq!(conf.session_key(), "wg0-mesh-gw0");
        assert!(!conf.disable_tx_offload);
    }

    #[test]
    fn rejects_unknown_version() {
        let mut value = sample();
        value["cniVersion"] = "9.9.9".into();
        let err = NetConf::parse(value.to_string().as_bytes()).unwrap_err();
        assert!(matches!(err, CniError::IncompatibleVersion(_)));
    }

    #[test]
    fn rejects_missing_field() {
        let mut value = sample();
        value.as_object_mut().unwrap().remove("gw_address");
        let err = NetConf::parse(value.to_string().as_bytes()).unwrap_err();
        assert!(matches!(err, CniError::Config(_)));
    }

    #[test]
    fn rejects_interface_too_long_for_transient_name() {
        let mut value = sample();
        value["gateway_interface"] = "averylongname".into();
        let err = NetConf::parse(value.to_string().as_bytes()).unwrap_err();
        assert!(matches!(err, CniError::Config(_)));
    }

    #[test]
    fn rejects_path_separator_in_name() {
        let mut value = sample();
        value["name"] = "../etc".into();
        let err = NetConf::parse(value.to_string().as_bytes()).unwrap_err();
        assert!(matches!(err, CniError::Config(_)));
    }

    #[test]
    fn cidr_requires_prefix() {
        assert!(matches!(
            parse_cidr("gw_address", "10.12.0.2"),
            Err(CniError::Address(_))
        ));
        assert!(matches!(
            parse_cidr("gw_address", "not-an-ip"),
            Err(CniError::Address(_))
        ));
        let net = parse_cidr("gw_address", "10.12.0.2/32").unwrap();
        assert_eq!(net.ip().to_string(), "10.12.0.2");
        assert_eq!(net.prefix(), 32);
    }

    #[test]
    fn settings_fall_back_to_defaults() {
        let vars: HashMap<&str, &str> = [("DEBUG", ""), ("PISP_NETNS_DIR", "/tmp/reg")].into();
        let settings = Settings::from_lookup(|k| vars.get(k).map(|v| v.to_string()));

        assert_eq!(settings.registry_dir, PathBuf::from("/tmp/reg"));
        assert_eq!(settings.log_file, PathBuf::from(DEFAULT_LOG_FILE));
        assert!(!settings.debug);
    }

    #[test]
    fn installer_writes_conflist() {
        let dir = tempfile::tempdir().unwrap();
        let binary = dir.path().join("built-plugin");
        fs::write(&binary, b"\x7fELF").unwrap();

        let installer = Installer::new(InstallConfig {
            cni_bin_dir: dir.path().join("bin"),
            cni_conf_dir: dir.path().join("net.d"),
            registry_dir: dir.path().join("netns"),
        });
        let conf = NetConf::parse(sample().to_string().as_bytes()).unwrap();
        let written = installer.install(&binary, &conf).unwrap();

        assert!(dir.path().join("bin/pisp-cni").exists());
        let list: NetConfList = serde_json::from_slice(&fs::read(written).unwrap()).unwrap();
        assert_eq!(list.plugins, vec![conf]);
    }
}
