/*
* Proxmox Provisioner Command Line Interface
* ------------------------------------------
* @project: proxmox-provisioner
*
* Same engine as the HTTP surface, driven from a terminal. Handy for
* scripting and for finding out why the cluster hates your spec before you
* wire it into anything.
*
* Command Structure:
* ---------------
* proxmox-provisioner
* ├── serve [--port]             // run the HTTP API
* ├── vm
* │   ├── create --file spec.json  // direct or template provisioning
* │   ├── list
* │   ├── start  --vmid N
* │   ├── stop   --vmid N
* │   └── delete --vmid N
* ├── ct
* │   ├── create --file spec.json
* │   ├── list
* │   ├── start  --ctid N
* │   ├── stop   --ctid N
* │   └── delete --ctid N
* ├── resources [--node]         // storage, bridges, media, templates
* └── init [--force]             // writes config/default.toml
*
* Every command except init takes --node (default: proxmox.node) and the
* global --config <dir>.
*
* Errors print in red with the engine's message, which already lists the
* alternatives you could have used. Partial provisioning also prints the
* node and id so you know what to clean up.
*/

use anyhow::Context;
use clap::{Args, Parser, Subcommand};
use colored::Colorize;
use serde_json::Value;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::{error, info};

use crate::config::{generate_default_config, Settings};
use crate::core::catalog::ResourceCatalog;
use crate::core::client::ProxmoxClient;
use crate::core::lifecycle::{InstanceKind, InstanceLifecycle};
use crate::core::provision::Provisioner;
use crate::core::vm::{ContainerSpec, ProvisionOutcome, ProvisioningResult, VmSpec};
use crate::errors::ProvisionError;

#[derive(Parser)]
#[command(name = "proxmox-provisioner")]
#[command(about = "Validate and provision VMs and containers on a Proxmox cluster", long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Commands,

    #[arg(short, long, value_name = "CONFIG")]
    config: Option<PathBuf>,
}

#[derive(Subcommand)]
enum Commands {
    /// Start the API server
    Serve {
        #[arg(short, long)]
        port: Option<u16>,
    },
    /// Manage virtual machines
    Vm {
        #[command(subcommand)]
        command: InstanceCommands,
    },
    /// Manage containers
    Ct {
        #[command(subcommand)]
        command: InstanceCommands,
    },
    /// Show what the node offers: storage, bridges, media, templates
    Resources {
        #[arg(short, long)]
        node: Option<String>,
    },
    /// Generate default configuration
    Init {
        #[arg(short, long)]
        force: bool,
    },
}

#[derive(Subcommand)]
enum InstanceCommands {
    /// Provision from a JSON spec file
    Create {
        #[arg(short, long)]
        file: PathBuf,
        #[arg(short, long)]
        node: Option<String>,
    },
    /// List instances on the node
    List {
        #[arg(short, long)]
        node: Option<String>,
    },
    /// Power on
    Start(Target),
    /// Power off
    Stop(Target),
    /// Delete
    Delete(Target),
}

#[derive(Args)]
struct Target {
    #[arg(long, visible_alias = "ctid")]
    vmid: u32,
    #[arg(short, long)]
    node: Option<String>,
}

pub async fn run() -> anyhow::Result<()> {
    let cli = Cli::parse();

    let settings = match &cli.config {
        Some(path) => Settings::new_from_file(path)?,
        None => Settings::new()?,
    };

    let outcome = match cli.command {
        Commands::Serve { port } => {
            let server_port = port.unwrap_or(settings.server.port);
            info!("Starting server on port {}", server_port);
            return crate::run_server(settings, server_port).await;
        }
        Commands::Init { force } => {
            let dir = cli.config.unwrap_or_else(|| PathBuf::from("config"));
            return handle_init_command(&dir, force);
        }
        Commands::Vm { command } => handle_instance_command(command, InstanceKind::Vm, &settings).await,
        Commands::Ct { command } => {
            handle_instance_command(command, InstanceKind::Container, &settings).await
        }
        Commands::Resources { node } => handle_resources_command(node, &settings).await,
    };

    if let Err(e) = &outcome {
        report_error(e);
    }
    outcome.map_err(anyhow::Error::from)
}

fn provisioner(settings: &Settings) -> Result<Provisioner, ProvisionError> {
    let client = ProxmoxClient::new(&settings.proxmox)?;
    Ok(Provisioner::new(Arc::new(client), settings))
}

async fn handle_instance_command(
    command: InstanceCommands,
    kind: InstanceKind,
    settings: &Settings,
) -> Result<(), ProvisionError> {
    let provisioner = provisioner(settings)?;
    let lifecycle = InstanceLifecycle::new(provisioner.api());

    match command {
        InstanceCommands::Create { file, node } => {
            let raw = std::fs::read_to_string(&file).map_err(|e| ProvisionError::InvalidField {
                field: "file",
                reason: format!("{}: {}", file.display(), e),
            })?;
            let outcome = match kind {
                InstanceKind::Vm => {
                    let mut spec: VmSpec = parse_spec(&raw)?;
                    if node.is_some() {
                        spec.node = node;
                    }
                    provisioner.provision_vm(spec).await?
                }
                InstanceKind::Container => {
                    let mut spec: ContainerSpec = parse_spec(&raw)?;
                    if node.is_some() {
                        spec.node = node;
                    }
                    provisioner.provision_container(spec).await?
                }
            };
            print_outcome(kind, &outcome);
        }
        InstanceCommands::List { node } => {
            let node = provisioner.resolve_node(node.as_deref());
            let listing = lifecycle.list(&node, kind).await?;
            print_listing(kind, &node, &listing);
        }
        InstanceCommands::Start(target) => {
            let node = provisioner.resolve_node(target.node.as_deref());
            let result = lifecycle.start(&node, kind, target.vmid).await?;
            print_action("started", kind, target.vmid, &result);
        }
        InstanceCommands::Stop(target) => {
            let node = provisioner.resolve_node(target.node.as_deref());
            let result = lifecycle.stop(&node, kind, target.vmid).await?;
            print_action("stopped", kind, target.vmid, &result);
        }
        InstanceCommands::Delete(target) => {
            let node = provisioner.resolve_node(target.node.as_deref());
            let result = lifecycle.delete(&node, kind, target.vmid).await?;
            print_action("deleted", kind, target.vmid, &result);
        }
    }

    Ok(())
}

fn parse_spec<T: serde::de::DeserializeOwned>(raw: &str) -> Result<T, ProvisionError> {
    serde_json::from_str(raw).map_err(|e| ProvisionError::InvalidField {
        field: "file",
        reason: e.to_string(),
    })
}

async fn handle_resources_command(node: Option<String>, settings: &Settings) -> Result<(), ProvisionError> {
    let provisioner = provisioner(settings)?;
    let node = provisioner.resolve_node(node.as_deref());
    let catalog = provisioner.fetch_catalog(&node).await?;
    print_catalog(&catalog);
    Ok(())
}

fn handle_init_command(config_dir: &Path, force: bool) -> anyhow::Result<()> {
    let target = config_dir.join("default.toml");
    if target.exists() && !force {
        error!("Configuration already exists at {}. Use --force to overwrite.", target.display());
        return Ok(());
    }

    std::fs::create_dir_all(config_dir)
        .with_context(|| format!("creating {}", config_dir.display()))?;
    let config_str = toml::to_string_pretty(&generate_default_config())?;
    std::fs::write(&target, config_str).with_context(|| format!("writing {}", target.display()))?;

    println!("{} Default configuration generated at {}", "✓".green(), target.display());
    Ok(())
}

fn print_outcome(kind: InstanceKind, outcome: &ProvisionOutcome) {
    println!(
        "{} {} {} provisioned on {}",
        "✓".green(),
        kind.label(),
        outcome.vmid.to_string().bold(),
        outcome.node
    );
    if let Some(name) = &outcome.name {
        println!("  name:     {}", name);
    }
    if let Some(source) = outcome.source_template {
        println!("  cloned:   from {}", source);
    }
    if let Some(upid) = outcome.result.upid() {
        println!("  task:     {}", upid.dimmed());
    }
    if outcome.started {
        println!("  power:    {}", "started".green());
    }
    for note in &outcome.skipped {
        println!("  {} {}", "skipped:".yellow(), note);
    }
}

fn print_action(verb: &str, kind: InstanceKind, id: u32, result: &ProvisioningResult) {
    println!("{} {} {} {}", "✓".green(), kind.label(), id, verb);
    if let Some(upid) = result.upid() {
        println!("  task: {}", upid.dimmed());
    }
}

fn print_listing(kind: InstanceKind, node: &str, listing: &Value) {
    println!("{}", format!("{}s on {}:", kind.label(), node).bold());
    let rows = listing.as_array().map(Vec::as_slice).unwrap_or_default();
    if rows.is_empty() {
        println!("  (none)");
    }
    for row in rows {
        let id = row.get("vmid").map(Value::to_string).unwrap_or_default();
        let name = row.get("name").and_then(Value::as_str).unwrap_or("-");
        let status = match row.get("status").and_then(Value::as_str) {
            Some("running") => "running".green(),
            Some("stopped") => "stopped".red(),
            Some(other) => other.yellow(),
            None => "unknown".yellow(),
        };
        println!("- {} {} ({})", id.trim_matches('"'), name, status);
    }
}

fn print_catalog(catalog: &ResourceCatalog) {
    println!("{}", format!("Resources on {}:", catalog.node).bold());
    println!("{}", "Storage:".bold());
    for pool in &catalog.storage {
        println!("- {} [{}]", pool.name, pool.content.join(","));
    }
    println!("{}", "Bridges:".bold());
    for bridge in &catalog.bridges {
        let state = if bridge.active { "active".green() } else { "inactive".red() };
        println!("- {} ({})", bridge.name, state);
    }
    println!("{}", "Media:".bold());
    for media in &catalog.media {
        println!("- {}", media.volid);
    }
    println!("{}", "Templates:".bold());
    for (name, vmid) in &catalog.templates {
        println!("- {} -> {}", name, vmid);
    }
}

fn report_error(err: &ProvisionError) {
    eprintln!("{} {}", "✗".red(), err.to_string().red());
    if let ProvisionError::PartialProvisioning { node, vmid, stage, .. } = err {
        eprintln!(
            "  instance {} exists on {} but stopped at {}; clean it up or fix it by hand",
            vmid.to_string().bold(),
            node,
            stage
        );
    }
    if err.is_retryable() {
        eprintln!("  {}", "the cluster looks unreachable, retrying later may help".yellow());
    }
}
