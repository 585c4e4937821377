use anyhow::{Context, Result};
use clap::{Args, Parser, Subcommand};
use std::fs;
use std::path::{Path, PathBuf};
use tracing::info;
use tracing_subscriber::{EnvFilter, FmtSubscriber};

use pisp_cni::config::{
    InstallConfig, Installer, NetConf, NetConfList, DEFAULT_REGISTRY_DIR, VETH_PREFIX,
};
use pisp_cni::netns::NetNs;
use pisp_cni::registry::NamespaceRegistry;
use pisp_cni::RtnetlinkBackend;

/// A command line tool to manage point-to-point veth attachments
#[derive(Parser)]
#[clap(name = "pisp-ctl", author, version, about)]
struct Cli {
    /// Namespace registry directory
    #[clap(long, default_value = DEFAULT_REGISTRY_DIR)]
    registry_dir: PathBuf,

    /// Enable verbose output
    #[clap(short, long)]
    verbose: bool,

    /// Subcommand to execute
    #[clap(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Generate a network configuration for one attachment
    Generate {
        #[clap(flatten)]
        session: SessionArgs,

        /// Output file path
        #[clap(long)]
        output: Option<PathBuf>,
    },

    /// Install the plugin binary and a network configuration
    Install {
        #[clap(flatten)]
        session: SessionArgs,

        /// Plugin binary to install, defaults to pisp-cni next to this tool
        #[clap(long)]
        binary: Option<PathBuf>,

        /// CNI bin directory
        #[clap(long, default_value = "/opt/cni/bin")]
        bin_dir: PathBuf,

        /// CNI config directory
        #[clap(long, default_value = "/etc/cni/net.d")]
        conf_dir: PathBuf,

        /// Skip confirmation
        #[clap(long)]
        yes: bool,
    },

    /// Inspect or clean the namespace registry
    Sessions {
        #[clap(subcommand)]
        action: SessionAction,
    },

    /// Show the plugin's veth links that are still in a namespace
    Status {
        /// Namespace to inspect instead of the current one
        #[clap(long)]
        netns: Option<PathBuf>,
    },
}

#[derive(Subcommand)]
enum SessionAction {
    /// List registry entries
    List,
    /// Remove entries whose namespace no longer exists
    Prune,
    /// Remove one entry
    Remove {
        /// Registry key, e.g. <client_interface>-<name>-<gateway_interface>
        key: String,
    },
}

#[derive(Args)]
struct SessionArgs {
    /// Attachment name
    #[clap(long, default_value = "pisp")]
    name: String,

    /// Client interface name
    #[clap(long)]
    client_interface: String,

    /// Gateway interface name
    #[clap(long)]
    gateway_interface: String,

    /// Client address (CIDR)
    #[clap(long)]
    client_address: String,

    /// Gateway address (CIDR)
    #[clap(long)]
    gw_address: String,

    /// Attachment subnet (CIDR)
    #[clap(long)]
    subnet: Option<String>,

    /// CNI specification version
    #[clap(long, default_value = "1.0.0")]
    cni_version: String,

    /// Disable transmit checksum offload on configured interfaces
    #[clap(long)]
    disable_tx_offload: bool,
}

impl SessionArgs {
    /// Build and validate the plugin configuration
    fn to_conf(&self) -> Result<NetConf> {
        let conf = NetConf {
            cni_version: self.cni_version.clone(),
            name: self.name.clone(),
            plugin_type: Some("pisp-cni".to_string()),
            client_address: self.client_address.clone(),
            gw_address: self.gw_address.clone(),
            subnet: self.subnet.clone(),
            client_interface: self.client_interface.clone(),
            gateway_interface: self.gateway_interface.clone(),
            disable_tx_offload: self.disable_tx_offload,
        };

        let conf = NetConf::parse(&serde_json::to_vec(&conf)?)?;
        pisp_cni::Role::determine(&conf, &conf.gateway_interface)?;
        Ok(conf)
    }
}

fn confirm(prompt: &str) -> Result<bool> {
    println!("{}", prompt);
    println!("Continue? [y/N]");

    let mut input = String::new();
    std::io::stdin().read_line(&mut input)?;
    Ok(input.trim().eq_ignore_ascii_case("y"))
}

fn default_plugin_binary() -> Result<PathBuf> {
    let exe = std::env::current_exe().context("Failed to locate pisp-ctl")?;
    let dir = exe.parent().unwrap_or_else(|| Path::new("."));
    Ok(dir.join("pisp-cni"))
}

fn run_install(
    session: &SessionArgs,
    binary: Option<PathBuf>,
    bin_dir: PathBuf,
    conf_dir: PathBuf,
    registry_dir: PathBuf,
    yes: bool,
) -> Result<()> {
    let conf = session.to_conf()?;
    let binary = match binary {
        Some(path) => path,
        None => default_plugin_binary()?,
    };

    if !yes
        && !confirm(&format!(
            "This will install {} to {} and write a config to {}.",
            binary.display(),
            bin_dir.display(),
            conf_dir.display()
        ))?
    {
        println!("Installation aborted.");
        return Ok(());
    }

    let installer = Installer::new(InstallConfig {
        cni_bin_dir: bin_dir,
        cni_conf_dir: conf_dir,
        registry_dir,
    });
    let written = installer.install(&binary, &conf)?;

    println!("Plugin installed, network configuration written to {}", written.display());
    Ok(())
}

fn run_sessions(registry: &NamespaceRegistry, action: SessionAction) -> Result<()> {
    match action {
        SessionAction::List => {
            let entries = registry.list()?;
            if entries.is_empty() {
                println!("No registry entries in {}", registry.dir().display());
            }
            for entry in entries {
                let marker = if entry.is_dangling() { " (dangling)" } else { "" };
                println!("  {} -> {}{}", entry.key, entry.target.display(), marker);
            }
        }
        SessionAction::Prune => {
            let removed = registry.prune()?;
            for key in &removed {
                info!(key, "pruned dangling entry");
            }
            println!("Removed {} dangling entries", removed.len());
        }
        SessionAction::Remove { key } => {
            if registry.remove(&key)? {
                println!("Removed {}", key);
            } else {
                println!("No entry named {}", key);
            }
        }
    }
    Ok(())
}

fn run_status(netns: Option<PathBuf>) -> Result<()> {
    let ns = netns.as_deref().map(NetNs::open).transpose()?;
    let links = RtnetlinkBackend::new().links_with_prefix(ns.as_ref(), VETH_PREFIX)?;

    if links.is_empty() {
        println!("No {}* links found", VETH_PREFIX);
        return Ok(());
    }

    println!("Plugin links:");
    for link in links {
        let mac = link.mac.map(|m| m.to_string()).unwrap_or_else(|| "-".to_string());
        println!("  {} (index {}, mac {})", link.name, link.index, mac);
    }
    Ok(())
}

fn main() -> Result<()> {
    let cli = Cli::parse();

    // Configure logging based on verbosity
    let log_level = if cli.verbose { "debug" } else { "info" };
    let subscriber = FmtSubscriber::builder()
        .with_env_filter(EnvFilter::new(log_level))
        .with_writer(std::io::stderr)
        .finish();

    tracing::subscriber::set_global_default(subscriber)
        .context("Failed to set default subscriber")?;

    let registry = NamespaceRegistry::new(&cli.registry_dir);

    match cli.command {
        Commands::Generate { session, output } => {
            let list = NetConfList::single(session.to_conf()?);
            let config_json = serde_json::to_string_pretty(&list)?;

            if let Some(path) = output {
                fs::write(&path, config_json)
                    .with_context(|| format!("Failed to write {}", path.display()))?;
                println!("Network configuration written to {}", path.display());
            } else {
                println!("{}", config_json);
            }
        }

        Commands::Install {
            session,
            binary,
            bin_dir,
            conf_dir,
            yes,
        } => {
            run_install(&session, binary, bin_dir, conf_dir, cli.registry_dir, yes)?;
        }

        Commands::Sessions { action } => run_sessions(&registry, action)?,

        Commands::Status { netns } => run_status(netns)?,
    }

    Ok(())
}
