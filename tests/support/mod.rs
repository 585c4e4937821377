// File: tests/support/mod.rs
#![allow(dead_code)]

pub mod fake_kernel;

use std::collections::HashMap;
use std::fs;
use std::path::{Path, PathBuf};
use tempfile::TempDir;

use pisp_cni::config::Settings;
use pisp_cni::registry::NamespaceRegistry;
use pisp_cni::types::CmdArgs;

/// Temporary registry plus regular files standing in for namespaces
pub struct Fixture {
    pub dir: TempDir,
    pub settings: Settings,
}

impl Fixture {
    pub fn new() -> Self {
        let dir = tempfile::tempdir().expect("tempdir");
        let settings = Settings {
            registry_dir: dir.path().join("netns"),
            log_file: dir.path().join("plugin.log"),
            debug: false,
        };
        fs::create_dir_all(dir.path().join("proc")).expect("proc dir");
        Self { dir, settings }
    }

    /// A file that plays the role of `/proc/<pid>/ns/net`
    pub fn namespace(&self, name: &str) -> PathBuf {
        let path = self.dir.path().join("proc").join(name);
        if !path.exists() {
            fs::write(&path, b"").expect("namespace file");
        }
        path
    }

    pub fn registry(&self) -> NamespaceRegistry {
        NamespaceRegistry::new(&self.settings.registry_dir)
    }
}

/// Network configuration with the given fields replaced
pub fn conf(overrides: serde_json::Value) -> serde_json::Value {
    let mut base = serde_json::json!({
        "cniVersion": "1.0.0",
        "name": "mesh",
        "type": "pisp-cni",
        "client_address": "10.12.0.3/32",
        "gw_address": "10.12.0.2/32",
        "subnet": "10.12.0.0/24",
        "client_interface": "wg0",
        "gateway_interface": "gw0"
    });

    if let (Some(base), Some(overrides)) = (base.as_object_mut(), overrides.as_object()) {
        for (key, value) in overrides {
            base.insert(key.clone(), value.clone());
        }
    }
    base
}

pub fn args(container_id: &str, netns: &Path, ifname: &str, conf: &serde_json::Value) -> CmdArgs {
    CmdArgs {
        container_id: container_id.to_string(),
        netns: netns.display().to_string(),
        ifname: ifname.to_string(),
        args: HashMap::new(),
        path: "/opt/cni/bin".to_string(),
        stdin_data: serde_json::to_vec(conf).expect("encode conf"),
    }
}
