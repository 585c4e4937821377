// File: tests/support/fake_kernel.rs

use ipnetwork::Ipv4Network;
use std::collections::{BTreeMap, HashMap};
use std::fs;
use std::net::Ipv4Addr;
use std::path::PathBuf;
use std::sync::Mutex;

use pisp_cni::error::{CniError, Result};
use pisp_cni::link::{InterfaceRequest, NetworkBackend};
use pisp_cni::netns::NetNs;
use pisp_cni::types::MacAddr;

/// Key of the namespace the plugin process runs in
pub const HOST: &str = "<host>";

#[derive(Debug, Clone, PartialEq)]
pub struct FakeLink {
    pub peer: String,
    pub up: bool,
    pub addresses: Vec<Ipv4Network>,
    pub mac: MacAddr,
    /// Last `disable_tx_offload` value the configurator was asked for
    pub tx_offload_disabled: bool,
}

#[derive(Debug, Default)]
struct State {
    /// namespace key -> links by name
    namespaces: HashMap<String, BTreeMap<String, FakeLink>>,
    /// namespace key -> (ifname, gateway)
    routes: HashMap<String, Vec<(String, Ipv4Addr)>>,
    veth_created: usize,
    next_mac: u8,
    calls: Vec<String>,
}

/// In-memory stand-in for the kernel's link, address and route tables.
///
/// Namespaces are identified by the canonical path of their handle, so a
/// registry symlink and the path it points at are the same namespace.
#[derive(Debug, Default)]
pub struct FakeKernel {
    state: Mutex<State>,
    fail_routes: bool,
}

fn ns_key(ns: Option<&NetNs>) -> String {
    match ns {
        None => HOST.to_string(),
        Some(ns) => fs::canonicalize(ns.path())
            .unwrap_or_else(|_| ns.path().to_path_buf())
            .display()
            .to_string(),
    }
}

impl FakeKernel {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn failing_routes() -> Self {
        Self {
            fail_routes: true,
            ..Self::default()
        }
    }

    /// Put a link straight into the host namespace
    pub fn seed_host_link(&self, name: &str) {
        let mut state = self.state.lock().unwrap();
        state.next_mac += 1;
        let mac = MacAddr([0x02, 0, 0, 0, 0, state.next_mac]);
        state.namespaces.entry(HOST.to_string()).or_default().insert(
            name.to_string(),
            FakeLink {
                peer: String::new(),
                up: false,
                addresses: Vec::new(),
                mac,
                tx_offload_disabled: false,
            },
        );
    }

    pub fn link(&self, ns: &PathBuf, name: &str) -> Option<FakeLink> {
        let key = fs::canonicalize(ns).unwrap().display().to_string();
        let state = self.state.lock().unwrap();
        state.namespaces.get(&key)?.get(name).cloned()
    }

    pub fn host_link(&self, name: &str) -> Option<FakeLink> {
        let state = self.state.lock().unwrap();
        state.namespaces.get(HOST)?.get(name).cloned()
    }

    pub fn routes(&self, ns: &PathBuf) -> Vec<(String, Ipv4Addr)> {
        let key = fs::canonicalize(ns).unwrap().display().to_string();
        let state = self.state.lock().unwrap();
        state.routes.get(&key).cloned().unwrap_or_default()
    }

    pub fn veth_created(&self) -> usize {
        self.state.lock().unwrap().veth_created
    }

    /// Every backend call made so far, in order
    pub fn calls(&self) -> Vec<String> {
        self.state.lock().unwrap().calls.clone()
    }
}

impl NetworkBackend for FakeKernel {
    fn link_exists(&self, ns: Option<&NetNs>, name: &str) -> Result<bool> {
        let key = ns_key(ns);
        let mut state = self.state.lock().unwrap();
        state.calls.push(format!("exists {} {}", key, name));
        Ok(state
            .namespaces
            .get(&key)
            .map_or(false, |links| links.contains_key(name)))
    }

    fn create_veth_pair(&self, name: &str, peer: &str) -> Result<()> {
        let mut state = self.state.lock().unwrap();
        state.calls.push(format!("veth {} {}", name, peer));

        let host = state.namespaces.entry(HOST.to_string()).or_default();
        if host.contains_key(name) || host.contains_key(peer) {
            return Ok(());
        }

        state.veth_created += 1;
        for (this, other) in [(name, peer), (peer, name)] {
            state.next_mac += 1;
            let mac = MacAddr([0x02, 0, 0, 0, 0, state.next_mac]);
            state.namespaces.entry(HOST.to_string()).or_default().insert(
                this.to_string(),
                FakeLink {
                    peer: other.to_string(),
                    up: false,
                    addresses: Vec::new(),
                    mac,
                    tx_offload_disabled: false,
                },
            );
        }
        Ok(())
    }

    fn move_link(&self, name: &str, target: &NetNs) -> Result<()> {
        let key = ns_key(Some(target));
        let mut state = self.state.lock().unwrap();
        state.calls.push(format!("move {} {}", name, key));

        let link = state
            .namespaces
            .get_mut(HOST)
            .and_then(|links| links.remove(name))
            .ok_or_else(|| CniError::Link(format!("link {} not found", name)))?;

        let links = state.namespaces.entry(key).or_default();
        if links.contains_key(name) {
            return Err(CniError::Link(format!("{} already exists in target", name)));
        }
        links.insert(name.to_string(), link);
        Ok(())
    }

    fn configure_interface(
        &self,
        target: &NetNs,
        request: &InterfaceRequest<'_>,
    ) -> Result<MacAddr> {
        let key = ns_key(Some(target));
        let mut state = self.state.lock().unwrap();
        state.calls.push(format!("configure {} {}", request.current_name, key));

        let links = state.namespaces.entry(key).or_default();
        let mut link = match links.remove(request.current_name) {
            Some(link) => {
                if links.contains_key(request.final_name) {
                    return Err(CniError::Link(format!(
                        "{} already exists",
                        request.final_name
                    )));
                }
                link
            }
            None => links.remove(request.final_name).ok_or_else(|| {
                CniError::Link(format!("link {} not found", request.current_name))
            })?,
        };

        link.up = true;
        link.tx_offload_disabled = request.disable_tx_offload;
        if !link.addresses.contains(&request.address) {
            link.addresses.push(request.address);
        }
        let mac = link.mac;
        links.insert(request.final_name.to_string(), link);
        Ok(mac)
    }

    fn add_default_route(&self, target: &NetNs, ifname: &str, gateway: Ipv4Addr) -> Result<()> {
        let key = ns_key(Some(target));
        let mut state = self.state.lock().unwrap();
        state.calls.push(format!("route {} {} {}", ifname, gateway, key));

        if self.fail_routes {
            return Err(CniError::Route("network unreachable".to_string()));
        }

        let present = state
            .namespaces
            .get(&key)
            .map_or(false, |links| links.contains_key(ifname));
        if !present {
            return Err(CniError::Link(format!("link {} not found", ifname)));
        }

        let routes = state.routes.entry(key).or_default();
        let route = (ifname.to_string(), gateway);
        if !routes.contains(&route) {
            routes.push(route);
        }
        Ok(())
    }
}
