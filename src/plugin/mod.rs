use ipnetwork::Ipv4Network;
use std::fmt;
use std::net::Ipv4Addr;
use std::path::Path;
use tracing::{debug, info, warn};

use crate::config::{parse_cidr, transient_name, NetConf, MAX_IFNAME_LEN};
use crate::error::{CniError, Result};
use crate::link::{InterfaceRequest, NetworkBackend};
use crate::netns::NetNs;
use crate::registry::NamespaceRegistry;
use crate::types::{
    uses_legacy_ip_version, CmdArgs, IPConfig, Interface, MacAddr, Result as CniResult,
};

/// Which end of the point-to-point link an invocation configures
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Role {
    Gateway {
        ifname: String,
        gw_address: Ipv4Network,
    },
    Client {
        ifname: String,
        client_address: Ipv4Network,
        gw_address: Ipv4Network,
    },
}

impl Role {
    /// Gateway when `ifname` equals the configured gateway interface,
    /// client otherwise. Both addresses are validated either way.
    pub fn determine(conf: &NetConf, ifname: &str) -> Result<Self> {
        let gw_address = parse_cidr("gw_address", &conf.gw_address)?;
        let client_address = parse_cidr("client_address", &conf.client_address)?;

        if ifname == conf.gateway_interface {
            Ok(Role::Gateway {
                ifname: ifname.to_string(),
                gw_address,
            })
        } else {
            // the client end is created as pisp<ifname> before it is renamed
            let veth = transient_name(ifname);
            if veth.len() > MAX_IFNAME_LEN {
                return Err(CniError::Config(format!(
                    "interface name {:?} is too long: {:?} exceeds {} bytes",
                    ifname, veth, MAX_IFNAME_LEN
                )));
            }

            Ok(Role::Client {
                ifname: ifname.to_string(),
                client_address,
                gw_address,
            })
        }
    }

    pub fn ifname(&self) -> &str {
        match self {
            Role::Gateway { ifname, .. } | Role::Client { ifname, .. } => ifname,
        }
    }

    /// Address assigned to this role's interface
    pub fn address(&self) -> Ipv4Network {
        match self {
            Role::Gateway { gw_address, .. } => *gw_address,
            Role::Client { client_address, .. } => *client_address,
        }
    }

    /// Next hop of the client's default route
    pub fn route_gateway(&self) -> Option<Ipv4Addr> {
        match self {
            Role::Gateway { .. } => None,
            Role::Client { gw_address, .. } => Some(gw_address.ip()),
        }
    }

    pub fn is_gateway(&self) -> bool {
        matches!(self, Role::Gateway { .. })
    }
}

/// Progress of one ADD invocation
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Stage {
    ConfigParsed,
    RoleDetermined,
    GatewayConfigured,
    ClientConfigured,
    ResultEmitted,
    Failed,
}

impl fmt::Display for Stage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Debug::fmt(self, f)
    }
}

/// Point-to-point veth plugin
pub struct PispPlugin<B> {
    /// Network configuration
    config: NetConf,
    /// Command arguments
    args: CmdArgs,
    registry: NamespaceRegistry,
    backend: B,
}

impl<B: NetworkBackend> PispPlugin<B> {
    pub fn new(config: NetConf, args: CmdArgs, registry: NamespaceRegistry, backend: B) -> Self {
        Self {
            config,
            args,
            registry,
            backend,
        }
    }

    /// Wire up this invocation's end of the link
    pub fn add_network(&self) -> Result<CniResult> {
        self.run_add().map_err(|e| {
            debug!(stage = %Stage::Failed, error = %e);
            e
        })
    }

    fn run_add(&self) -> Result<CniResult> {
        debug!(stage = %Stage::ConfigParsed, container = %self.args.container_id);

        let role = Role::determine(&self.config, &self.args.ifname)?;
        debug!(stage = %Stage::RoleDetermined, gateway = role.is_gateway());

        if self.args.netns.is_empty() {
            return Err(CniError::InvalidEnvironment(
                "CNI_NETNS is required for ADD".to_string(),
            ));
        }

        self.register()?;

        let mac = self.configure(&role)?;
        let stage = if role.is_gateway() {
            Stage::GatewayConfigured
        } else {
            Stage::ClientConfigured
        };
        debug!(stage = %stage, %mac);

        let result = self.build_result(&role, mac);
        debug!(stage = %Stage::ResultEmitted);
        Ok(result)
    }

    /// Drop the session entry; anything already gone is fine
    pub fn del_network(&self) -> Result<()> {
        let key = self.config.session_key();
        match self.registry.remove(&key) {
            Ok(true) => info!(key, "removed session namespace entry"),
            Ok(false) => debug!(key, "session namespace entry already gone"),
            // DEL must not fail on a registry it cannot clean
            Err(e) => warn!(key, error = %e, "failed to remove session namespace entry"),
        }
        Ok(())
    }

    /// CHECK is not implemented by this plugin
    pub fn check_network(&self) -> Result<()> {
        Err(CniError::Unsupported("CHECK".to_string()))
    }

    /// Configure the link for `role`, returning the MAC of the final interface
    pub fn configure(&self, role: &Role) -> Result<MacAddr> {
        match role {
            Role::Gateway { ifname, gw_address } => self.configure_gateway(ifname, *gw_address),
            Role::Client {
                ifname,
                client_address,
                ..
            } => {
                let gateway = role.route_gateway().ok_or_else(|| {
                    CniError::Route(format!("no gateway for client interface {}", ifname))
                })?;
                self.configure_client(ifname, *client_address, gateway)
            }
        }
    }

    fn register(&self) -> Result<()> {
        let netns = Path::new(&self.args.netns);
        self.registry.ensure_dir()?;
        self.registry.put(&self.args.container_id, netns)?;
        self.registry.put(&self.config.session_key(), netns)?;
        Ok(())
    }

    fn configure_gateway(&self, ifname: &str, address: Ipv4Network) -> Result<MacAddr> {
        info!(ifname, netns = %self.args.netns, "configuring gateway end");

        let target = NetNs::open(Path::new(&self.args.netns))?;
        let veth = transient_name(&self.config.gateway_interface);

        self.relocate(&veth, ifname, &target)?;
        self.backend
            .configure_interface(&target, &self.interface_request(&veth, ifname, address))
    }

    fn configure_client(
        &self,
        ifname: &str,
        address: Ipv4Network,
        gateway: Ipv4Addr,
    ) -> Result<MacAddr> {
        let client_veth = transient_name(ifname);
        let gateway_veth = transient_name(&self.config.gateway_interface);
        let target = self.registry.open(&self.config.session_key())?;

        info!(ifname, netns = %target.path().display(), "configuring client end");

        if self.present_in(&target, &client_veth, ifname)? {
            debug!(ifname, "client end already in session namespace");
        } else {
            self.backend.create_veth_pair(&client_veth, &gateway_veth)?;
        }

        self.relocate(&client_veth, ifname, &target)?;

        let mac = self.backend.configure_interface(
            &target,
            &self.interface_request(&client_veth, ifname, address),
        )?;
        self.backend.add_default_route(&target, ifname, gateway)?;

        Ok(mac)
    }

    /// Move `veth` into `target` unless an earlier invocation already did
    fn relocate(&self, veth: &str, final_name: &str, target: &NetNs) -> Result<()> {
        if self.backend.link_exists(None, veth)? {
            return self.backend.move_link(veth, target);
        }

        if self.present_in(target, veth, final_name)? {
            debug!(veth, "link already moved");
            return Ok(());
        }

        Err(CniError::Link(format!(
            "link {} not found in host namespace or {}",
            veth,
            target.path().display()
        )))
    }

    fn present_in(&self, target: &NetNs, veth: &str, final_name: &str) -> Result<bool> {
        Ok(self.backend.link_exists(Some(target), veth)?
            || self.backend.link_exists(Some(target), final_name)?)
    }

    fn interface_request<'a>(
        &self,
        current_name: &'a str,
        final_name: &'a str,
        address: Ipv4Network,
    ) -> InterfaceRequest<'a> {
        InterfaceRequest {
            current_name,
            final_name,
            address,
            disable_tx_offload: self.config.disable_tx_offload,
        }
    }

    /// CNI result describing the configured interface
    pub fn build_result(&self, role: &Role, mac: MacAddr) -> CniResult {
        let mut result = CniResult::new(&self.config.cni_version);
        let index = result.add_interface(Interface {
            name: self.args.ifname.clone(),
            mac: Some(mac.to_string()),
            sandbox: Some(self.args.netns.clone()),
        });

        let address = role.address();
        result.add_ip(IPConfig {
            version: uses_legacy_ip_version(&self.config.cni_version).then(|| "4".to_string()),
            interface: Some(index),
            address: format!("{}/{}", address.ip(), address.prefix()),
            gateway: Some(Ipv4Addr::UNSPECIFIED.to_string()),
        });

        result
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn conf() -> NetConf {
        NetConf {
            cni_version: "1.0.0".to_string(),
            name: "mesh".to_string(),
            plugin_type: Some("pisp-cni".to_string()),
            client_address: "10.12.0.3/24".to_string(),
            gw_address: "10.12.0.2/32".to_string(),
            subnet: Some("10.12.0.0/24".to_string()),
            client_interface: "wg0".to_string(),
            gateway_interface: "gw0".to_string(),
            disable_tx_offload: false,
        }
    }

    #[test]
    fn role_follows_interface_name() {
        let cases = [
            ("gw0", true),
            ("wg0", false),
            ("eth0", false),
            ("GW0", false),
            ("", false),
        ];

        for (ifname, gateway) in cases {
            let role = Role::determine(&conf(), ifname).unwrap();
            assert_eq!(role.is_gateway(), gateway, "ifname {:?}", ifname);
            assert_eq!(role.ifname(), ifname);
        }
    }

    #[test]
    fn gateway_host_drops_prefix() {
        let role = Role::determine(&conf(), "wg0").unwrap();
        assert_eq!(role.route_gateway(), Some(Ipv4Addr::new(10, 12, 0, 2)));
        assert_eq!(role.address().to_string(), "10.12.0.3/24");

        let gateway = Role::determine(&conf(), "gw0").unwrap();
        assert_eq!(gateway.route_gateway(), None);
        assert_eq!(gateway.address().prefix(), 32);
    }

    #[test]
    fn client_ifname_must_fit_transient_name() {
        // pisp + 11 bytes is the longest name the kernel accepts
        assert!(Role::determine(&conf(), "eth12345678").is_ok());

        let err = Role::determine(&conf(), "net1234567890").unwrap_err();
        assert!(matches!(err, CniError::Config(_)));
    }

    #[test]
    fn malformed_address_fails_role_determination() {
        let mut bad = conf();
        bad.client_address = "not-an-ip".to_string();

        for ifname in ["gw0", "wg0"] {
            let err = Role::determine(&bad, ifname).unwrap_err();
            assert!(matches!(err, CniError::Address(_)));
        }
    }
}
