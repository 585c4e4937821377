use std::collections::HashMap;
use std::env;
use std::io::{self, Read};
use tracing::{debug, error};

use crate::config::{NetConf, Settings};
use crate::error::{CniError, Result};
use crate::link::{NetworkBackend, RtnetlinkBackend};
use crate::plugin::PispPlugin;
use crate::registry::NamespaceRegistry;
use crate::types::{CmdArgs, CniCommand, Result as CniResult, VersionResult, SUPPORTED_VERSIONS};

/// Version reported when the request does not name one
pub const DEFAULT_CNI_VERSION: &str = "1.0.0";

/// Parse command arguments from a variable lookup and the stdin payload
pub fn parse_args_from<F>(command: CniCommand, lookup: F, stdin_data: Vec<u8>) -> Result<CmdArgs>
where
    F: Fn(&str) -> Option<String>,
{
    let required = |key: &str| {
        lookup(key)
            .filter(|v| !v.is_empty())
            .ok_or_else(|| CniError::InvalidEnvironment(format!("{} not found in environment", key)))
    };
    let optional = |key: &str| lookup(key).unwrap_or_default();

    let (container_id, ifname) = match command {
        CniCommand::Version => (optional("CNI_CONTAINERID"), optional("CNI_IFNAME")),
        _ => (required("CNI_CONTAINERID")?, required("CNI_IFNAME")?),
    };

    let netns = match command {
        CniCommand::Add | CniCommand::Check => required("CNI_NETNS")?,
        _ => optional("CNI_NETNS"),
    };

    Ok(CmdArgs {
        container_id,
        netns,
        ifname,
        args: parse_cni_args(&optional("CNI_ARGS")),
        path: optional("CNI_PATH"),
        stdin_data,
    })
}

/// Parse command arguments from the process environment and stdin
pub fn parse_args(command: CniCommand) -> Result<CmdArgs> {
    let mut stdin_data = Vec::new();
    io::stdin()
        .read_to_end(&mut stdin_data)
        .map_err(|e| CniError::io("failed to read from stdin", e))?;

    parse_args_from(command, |key| env::var(key).ok(), stdin_data)
}

/// Parse CNI_ARGS string into key-value pairs
fn parse_cni_args(args_str: &str) -> HashMap<String, String> {
    args_str
        .split(';')
        .filter_map(|pair| pair.split_once('='))
        .map(|(key, value)| (key.to_string(), value.to_string()))
        .collect()
}

/// `cniVersion` of the request, if the payload carries one
pub fn requested_version(stdin_data: &[u8]) -> Option<String> {
    serde_json::from_slice::<serde_json::Value>(stdin_data)
        .ok()?
        .get("cniVersion")?
        .as_str()
        .map(str::to_string)
}

/// Execute the add command
pub fn cmd_add<B: NetworkBackend>(args: CmdArgs, settings: &Settings, backend: B) -> Result<CniResult> {
    let conf = NetConf::parse(&args.stdin_data)?;
    let plugin = PispPlugin::new(conf, args, NamespaceRegistry::new(&settings.registry_dir), backend);
    plugin.add_network()
}

/// Execute the delete command
pub fn cmd_del<B: NetworkBackend>(args: CmdArgs, settings: &Settings, backend: B) -> Result<()> {
    let conf = NetConf::parse(&args.stdin_data)?;
    let plugin = PispPlugin::new(conf, args, NamespaceRegistry::new(&settings.registry_dir), backend);
    plugin.del_network()
}

/// Execute the check command
pub fn cmd_check<B: NetworkBackend>(args: CmdArgs, settings: &Settings, backend: B) -> Result<()> {
    let conf = NetConf::parse(&args.stdin_data)?;
    let plugin = PispPlugin::new(conf, args, NamespaceRegistry::new(&settings.registry_dir), backend);
    plugin.check_network()
}

/// Answer the version query without touching the network stack
pub fn cmd_version(stdin_data: &[u8]) -> VersionResult {
    let version = requested_version(stdin_data)
        .filter(|v| SUPPORTED_VERSIONS.contains(&v.as_str()))
        .unwrap_or_else(|| DEFAULT_CNI_VERSION.to_string());
    VersionResult::new(&version)
}

fn execute(command: CniCommand, args: CmdArgs, settings: &Settings) -> Result<()> {
    debug!(%command, container = %args.container_id, ifname = %args.ifname, "CNI command");

    let backend = RtnetlinkBackend::new();
    match command {
        CniCommand::Add => print_json(&cmd_add(args, settings, backend)?),
        CniCommand::Del => cmd_del(args, settings, backend),
        CniCommand::Check => cmd_check(args, settings, backend),
        CniCommand::Version => print_json(&cmd_version(&args.stdin_data)),
    }
}

fn print_json<T: serde::Serialize>(value: &T) -> Result<()> {
    let json = serde_json::to_string_pretty(value)
        .map_err(|e| CniError::io("failed to encode result", io::Error::other(e)))?;
    println!("{}", json);
    Ok(())
}

/// Main entry point for the CNI plugin.
///
/// Results and CNI error objects are printed on stdout; the returned error
/// only tells the caller to exit non-zero.
pub fn run_cni(settings: &Settings) -> Result<()> {
    let outcome = env::var("CNI_COMMAND")
        .map_err(|_| CniError::InvalidEnvironment("CNI_COMMAND not found in environment".into()))
        .and_then(|cmd| cmd.parse::<CniCommand>())
        .and_then(|command| Ok((command, parse_args(command)?)));

    let (command, args) = match outcome {
        Ok(parsed) => parsed,
        Err(err) => return Err(report(err, None)),
    };

    let version = requested_version(&args.stdin_data);
    execute(command, args, settings).map_err(|err| report(err, version))
}

fn report(err: CniError, version: Option<String>) -> CniError {
    error!("CNI plugin error: {}", err);

    let version = version.unwrap_or_else(|| DEFAULT_CNI_VERSION.to_string());
    match serde_json::to_string(&err.to_result(&version)) {
        Ok(json) => println!("{}", json),
        Err(e) => error!("failed to encode error result: {}", e),
    }
    err
}
