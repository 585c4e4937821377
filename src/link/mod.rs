//! Kernel link operations: veth creation, namespace moves, interface
//! configuration and routes.
//!
//! The plugin talks to the kernel only through [`NetworkBackend`]; the
//! production implementation speaks rtnetlink from a single-threaded tokio
//! runtime that lives on the thread doing the work, so the netlink socket is
//! opened inside whichever namespace that thread has entered.

use futures::TryStreamExt;
use ipnetwork::Ipv4Network;
use netlink_packet_route::link::{LinkAttribute, LinkMessage};
use netlink_packet_route::route::{RouteFlag, RouteMessage};
use rtnetlink::{new_connection, Handle};
use std::future::Future;
use std::net::{IpAddr, Ipv4Addr};
use std::os::unix::io::AsRawFd;
use std::process::Command;
use tracing::{debug, info, warn};

use crate::error::{CniError, Result};
use crate::netns::{on_dedicated_thread, with_namespace, NetNs};
use crate::types::MacAddr;

/// What the configurator should do to one interface inside a namespace
#[derive(Debug, Clone)]
pub struct InterfaceRequest<'a> {
    /// Name the link carries right after it was moved
    pub current_name: &'a str,
    /// Name the runtime expects
    pub final_name: &'a str,
    /// Address to assign
    pub address: Ipv4Network,
    /// Turn transmit checksum offload off, best effort
    pub disable_tx_offload: bool,
}

/// A link as reported by the kernel
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LinkInfo {
    pub name: String,
    pub index: u32,
    pub mac: Option<MacAddr>,
}

/// Kernel operations the plugin needs.
///
/// A `None` namespace means the namespace the plugin process runs in.
pub trait NetworkBackend {
    /// Whether a link called `name` exists in `ns`
    fn link_exists(&self, ns: Option<&NetNs>, name: &str) -> Result<bool>;

    /// Create a veth pair in the plugin's namespace. An existing link with
    /// either name is not an error.
    fn create_veth_pair(&self, name: &str, peer: &str) -> Result<()>;

    /// Move `name` from the plugin's namespace into `target`
    fn move_link(&self, name: &str, target: &NetNs) -> Result<()>;

    /// Rename, bring up and address a link inside `target`, returning its MAC
    fn configure_interface(&self, target: &NetNs, request: &InterfaceRequest<'_>)
        -> Result<MacAddr>;

    /// Install a default route via `gateway` on `ifname` inside `target`
    fn add_default_route(&self, target: &NetNs, ifname: &str, gateway: Ipv4Addr) -> Result<()>;
}

impl<T: NetworkBackend + ?Sized> NetworkBackend for &T {
    fn link_exists(&self, ns: Option<&NetNs>, name: &str) -> Result<bool> {
        (**self).link_exists(ns, name)
    }

    fn create_veth_pair(&self, name: &str, peer: &str) -> Result<()> {
        (**self).create_veth_pair(name, peer)
    }

    fn move_link(&self, name: &str, target: &NetNs) -> Result<()> {
        (**self).move_link(name, target)
    }

    fn configure_interface(
        &self,
        target: &NetNs,
        request: &InterfaceRequest<'_>,
    ) -> Result<MacAddr> {
        (**self).configure_interface(target, request)
    }

    fn add_default_route(
        &self,
        target: &NetNs,
        ifname: &str,
        gateway: Ipv4Addr,
    ) -> Result<()> {
        (**self).add_default_route(target, ifname, gateway)
    }
}

/// rtnetlink-backed implementation
#[derive(Debug, Default, Clone, Copy)]
pub struct RtnetlinkBackend;

impl RtnetlinkBackend {
    pub fn new() -> Self {
        Self
    }

    /// Links whose name starts with `prefix`
    pub fn links_with_prefix(&self, ns: Option<&NetNs>, prefix: &str) -> Result<Vec<LinkInfo>> {
        let prefix = prefix.to_string();
        run_netlink(ns, move |handle| async move {
            let mut stream = handle.link().get().execute();
            let mut found = Vec::new();
            while let Some(msg) = stream
                .try_next()
                .await
                .map_err(|e| CniError::Link(format!("failed to dump links: {}", e)))?
            {
                let info = link_info(&msg);
                if info.name.starts_with(&prefix) {
                    found.push(info);
                }
            }
            Ok(found)
        })
    }
}

impl NetworkBackend for RtnetlinkBackend {
    fn link_exists(&self, ns: Option<&NetNs>, name: &str) -> Result<bool> {
        let name = name.to_string();
        run_netlink(ns, move |handle| async move {
            Ok(find_link(&handle, &name).await?.is_some())
        })
    }

    fn create_veth_pair(&self, name: &str, peer: &str) -> Result<()> {
        let (name, peer) = (name.to_string(), peer.to_string());
        run_netlink(None, move |handle| async move {
            match handle
                .link()
                .add()
                .veth(name.clone(), peer.clone())
                .execute()
                .await
            {
                Ok(()) => {
                    info!(name, peer, "created veth pair");
                    Ok(())
                }
                Err(e) if is_errno(&e, libc::EEXIST) => {
                    debug!(name, peer, "veth pair already exists");
                    Ok(())
                }
                Err(e) => Err(CniError::Link(format!(
                    "failed to create veth pair {} <-> {}: {}",
                    name, peer, e
                ))),
            }
        })
    }

    fn move_link(&self, name: &str, target: &NetNs) -> Result<()> {
        let name = name.to_string();
        let fd = target.as_raw_fd();
        let target_path = target.path().display().to_string();

        run_netlink(None, move |handle| async move {
            let index = require_link(&handle, &name).await?.header.index;
            handle
                .link()
                .set(index)
                .setns_by_fd(fd)
                .execute()
                .await
                .map_err(|e| {
                    CniError::Link(format!(
                        "failed to move {} into {}: {}",
                        name, target_path, e
                    ))
                })?;

            info!(name, netns = %target_path, "moved link");
            Ok(())
        })
    }

    fn configure_interface(
        &self,
        target: &NetNs,
        request: &InterfaceRequest<'_>,
    ) -> Result<MacAddr> {
        let current = request.current_name.to_string();
        let final_name = request.final_name.to_string();
        let address = request.address;
        let disable_tx_offload = request.disable_tx_offload;
        let target_path = target.path().display().to_string();

        run_netlink(Some(target), move |handle| async move {
            let index = match find_link(&handle, &current).await? {
                Some(msg) => {
                    let index = msg.header.index;
                    if current != final_name {
                        handle
                            .link()
                            .set(index)
                            .name(final_name.clone())
                            .execute()
                            .await
                            .map_err(|e| {
                                CniError::Link(format!(
                                    "failed to rename {} to {} in {}: {}",
                                    current, final_name, target_path, e
                                ))
                            })?;
                        debug!(from = %current, to = %final_name, "renamed link");
                    }
                    index
                }
                None => {
                    // renamed by an earlier, partially completed invocation
                    require_link(&handle, &final_name).await.map_err(|_| {
                        CniError::Link(format!(
                            "link {} (or {}) not found in {}",
                            current, final_name, target_path
                        ))
                    })?
                    .header
                    .index
                }
            };

            handle.link().set(index).up().execute().await.map_err(|e| {
                CniError::Link(format!(
                    "failed to bring {} up in {}: {}",
                    final_name, target_path, e
                ))
            })?;

            match handle
                .address()
                .add(index, IpAddr::V4(address.ip()), address.prefix())
                .execute()
                .await
            {
                Ok(()) => info!(ifname = %final_name, %address, "assigned address"),
                Err(e) if is_errno(&e, libc::EEXIST) => {
                    debug!(ifname = %final_name, %address, "address already assigned")
                }
                Err(e) => {
                    return Err(CniError::Address(format!(
                        "failed to add {} to {} in {}: {}",
                        address, final_name, target_path, e
                    )))
                }
            }

            if disable_tx_offload {
                disable_tx_checksum(&final_name);
            }

            let msg = require_link(&handle, &final_name).await?;
            link_info(&msg).mac.ok_or_else(|| {
                CniError::Link(format!("{} has no hardware address", final_name))
            })
        })
    }

    fn add_default_route(
        &self,
        target: &NetNs,
        ifname: &str,
        gateway: Ipv4Addr,
    ) -> Result<()> {
        let ifname = ifname.to_string();
        let target_path = target.path().display().to_string();

        run_netlink(Some(target), move |handle| async move {
            let index = require_link(&handle, &ifname).await?.header.index;
            let gw = gateway;

            let mut request = handle.route().add().v4().gateway(gw).output_interface(index);
            if needs_onlink(&handle, index, gw).await? {
                set_onlink(request.message_mut());
            }

            match request.execute().await {
                Ok(()) => {
                    info!(%ifname, gateway = %gw, "installed default route");
                    Ok(())
                }
                Err(e) if is_errno(&e, libc::EEXIST) => {
                    debug!(%ifname, gateway = %gw, "default route already present");
                    Ok(())
                }
                Err(e) => Err(CniError::Route(format!(
                    "failed to add default route via {} on {} in {}: {}",
                    gw, ifname, target_path, e
                ))),
            }
        })
    }
}

/// Run a netlink conversation on a fresh connection, inside `ns` if given.
fn run_netlink<T, F, Fut>(ns: Option<&NetNs>, op: F) -> Result<T>
where
    F: FnOnce(Handle) -> Fut + Send,
    Fut: Future<Output = Result<T>>,
    T: Send,
{
    let conversation = move || -> Result<T> {
        let runtime = tokio::runtime::Builder::new_current_thread()
            .enable_all()
            .build()
            .map_err(|e| CniError::io("failed to create tokio runtime", e))?;

        runtime.block_on(async move {
            let (connection, handle, _) = new_connection()
                .map_err(|e| CniError::io("failed to open netlink socket", e))?;
            tokio::spawn(connection);
            op(handle).await
        })
    };

    match ns {
        Some(ns) => with_namespace(ns, conversation),
        None => on_dedicated_thread("host namespace", conversation),
    }
}

fn is_errno(err: &rtnetlink::Error, errno: i32) -> bool {
    matches!(err, rtnetlink::Error::NetlinkError(msg) if msg.raw_code() == -errno)
}

async fn find_link(handle: &Handle, name: &str) -> Result<Option<LinkMessage>> {
    let mut links = handle.link().get().match_name(name.to_string()).execute();
    match links.try_next().await {
        Ok(msg) => Ok(msg),
        Err(e) if is_errno(&e, libc::ENODEV) => Ok(None),
        Err(e) => Err(CniError::Link(format!("failed to look up {}: {}", name, e))),
    }
}

async fn require_link(handle: &Handle, name: &str) -> Result<LinkMessage> {
    find_link(handle, name)
        .await?
        .ok_or_else(|| CniError::Link(format!("link {} not found", name)))
}

/// The gateway is outside every IPv4 network assigned to the link, as with
/// point-to-point /32 addressing.
async fn needs_onlink(handle: &Handle, index: u32, gateway: Ipv4Addr) -> Result<bool> {
    use netlink_packet_route::address::AddressAttribute;

    let mut addresses = handle
        .address()
        .get()
        .set_link_index_filter(index)
        .execute();

    while let Some(msg) = addresses
        .try_next()
        .await
        .map_err(|e| CniError::Route(format!("failed to list addresses: {}", e)))?
    {
        let prefix = msg.header.prefix_len;
        for attr in msg.attributes {
            if let AddressAttribute::Address(IpAddr::V4(ip)) = attr {
                if let Ok(net) = Ipv4Network::new(ip, prefix) {
                    if net.prefix() < 32 && net.contains(gateway) {
                        return Ok(false);
                    }
                }
            }
        }
    }

    Ok(true)
}

fn set_onlink(message: &mut RouteMessage) {
    if !message.header.flags.contains(&RouteFlag::Onlink) {
        message.header.flags.push(RouteFlag::Onlink);
    }
}

fn link_info(msg: &LinkMessage) -> LinkInfo {
    let mut info = LinkInfo {
        name: String::new(),
        index: msg.header.index,
        mac: None,
    };

    for attr in &msg.attributes {
        match attr {
            LinkAttribute::IfName(name) => info.name = name.clone(),
            LinkAttribute::Address(bytes) => info.mac = MacAddr::from_bytes(bytes),
            _ => {}
        }
    }

    info
}

/// Equivalent of `ethtool -K <ifname> tx off`; failures are only logged.
fn disable_tx_checksum(ifname: &str) {
    match Command::new("ethtool").args(["-K", ifname, "tx", "off"]).output() {
        Ok(output) if output.status.success() => {
            debug!(ifname, "disabled tx checksum offload")
        }
        Ok(output) => warn!(
            ifname,
            stderr = %String::from_utf8_lossy(&output.stderr).trim(),
            "failed to disable tx checksum offload"
        ),
        Err(e) => warn!(ifname, error = %e, "failed to run ethtool"),
    }
}
