use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::time::Duration;

use anyhow::{Context, Result};
use clap::{ArgAction, Parser, Subcommand, ValueEnum};
use serde::Deserialize;
use tracing::{error, info};

use cueflow_apply::kube_cluster::KubeCluster;
use cueflow_apply::{apply_set, prune_set, ReadyVerdict};
use cueflow_core::{Resource, ResourceInventory};

#[derive(Parser, Debug)]
#[command(name = "cueflowctl", version, about = "cueflow CLI: plan and apply manifest sets")]
struct Cli {
    /// Output format
    #[arg(short = 'o', long = "output", value_enum, global = true, default_value_t = Output::Human)]
    output: Output,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Copy, Clone, Debug, Eq, PartialEq, ValueEnum)]
enum Output {
    Human,
    Json,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Compute apply/prune sets against a recorded inventory, no cluster needed
    Plan {
        /// Manifest stream (YAML, multi-document); "-" reads stdin
        file: String,
        /// Inventory file from the previous apply (JSON)
        #[arg(long = "inventory")]
        inventory: Option<PathBuf>,
        /// Skip prune planning
        #[arg(long = "no-prune", action = ArgAction::SetTrue)]
        no_prune: bool,
    },
    /// Server-side apply a manifest stream and update the inventory file
    Apply {
        /// Manifest stream (YAML, multi-document); "-" reads stdin
        file: String,
        /// Inventory file to read and rewrite (JSON)
        #[arg(long = "inventory")]
        inventory: Option<PathBuf>,
        /// Field manager identity for server-side apply
        #[arg(long = "manager", default_value = "cueflowctl")]
        manager: String,
        #[arg(long = "no-prune", action = ArgAction::SetTrue)]
        no_prune: bool,
        /// Poll applied resources for readiness before exiting
        #[arg(long = "wait", action = ArgAction::SetTrue)]
        wait: bool,
        /// Readiness timeout in seconds (with --wait)
        #[arg(long = "timeout", default_value_t = 300)]
        timeout: u64,
    },
}

fn init_tracing() {
    let env = std::env::var("CUEFLOW_LOG").unwrap_or_else(|_| "info".to_string());
    let filter = tracing_subscriber::EnvFilter::from_str(&env)
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info"));
    tracing_subscriber::fmt().with_env_filter(filter).with_target(true).init();
}

fn init_metrics() {
    if let Ok(addr) = std::env::var("CUEFLOW_METRICS_ADDR") {
        if let Ok(sock) = addr.parse::<std::net::SocketAddr>() {
            let builder = metrics_exporter_prometheus::PrometheusBuilder::new();
            match builder.with_http_listener(sock).install() {
                Ok(_) => tracing::info!(addr = %addr, "Prometheus metrics exporter listening"),
                Err(e) => tracing::warn!(error = %e, "failed to install metrics exporter"),
            }
        } else {
            tracing::warn!(addr = %addr, "invalid CUEFLOW_METRICS_ADDR; expected host:port");
        }
    }
}

fn read_manifests(file: &str) -> Result<Vec<Resource>> {
    let text = if file == "-" {
        std::io::read_to_string(std::io::stdin()).context("reading stdin")?
    } else {
        std::fs::read_to_string(file).with_context(|| format!("reading {file}"))?
    };
    let mut out = Vec::new();
    for doc in serde_yaml::Deserializer::from_str(&text) {
        let value = serde_json::Value::deserialize(doc).context("parsing YAML document")?;
        if value.is_null() {
            continue;
        }
        let r = Resource::from_manifest(value).context("keying manifest")?;
        out.push(r);
    }
    Ok(out)
}

fn read_inventory(path: Option<&Path>) -> Result<Option<ResourceInventory>> {
    let Some(path) = path else { return Ok(None) };
    if !path.exists() {
        return Ok(None);
    }
    let text = std::fs::read_to_string(path)
        .with_context(|| format!("reading inventory {}", path.display()))?;
    Ok(Some(serde_json::from_str(&text).context("parsing inventory")?))
}

fn write_inventory(path: &Path, inventory: &ResourceInventory) -> Result<()> {
    let text = serde_json::to_string_pretty(inventory)?;
    std::fs::write(path, text)
        .with_context(|| format!("writing inventory {}", path.display()))
}

#[tokio::main]
async fn main() -> Result<()> {
    init_tracing();
    init_metrics();
    let cli = Cli::parse();

    match cli.command {
        Commands::Plan { file, inventory, no_prune } => {
            let manifests = read_manifests(&file)?;
            let prev = read_inventory(inventory.as_deref())?;
            let plan = cueflow_plan::plan(prev.as_ref(), manifests, !no_prune);
            match cli.output {
                Output::Human => {
                    for m in &plan.to_apply {
                        println!("apply  {}", m.to_ref().id);
                    }
                    for r in &plan.to_prune {
                        println!("prune  {}", r.id);
                    }
                    let s = plan.summary();
                    println!("{} to apply, {} to prune", s.apply, s.prune);
                }
                Output::Json => {
                    let apply: Vec<_> = plan.to_apply.iter().map(|m| m.to_ref()).collect();
                    println!(
                        "{}",
                        serde_json::to_string_pretty(&serde_json::json!({
                            "toApply": apply,
                            "toPrune": plan.to_prune,
                        }))?
                    );
                }
            }
        }
        Commands::Apply { file, inventory, manager, no_prune, wait, timeout } => {
            let manifests = read_manifests(&file)?;
            let prev = read_inventory(inventory.as_deref())?;
            let plan = cueflow_plan::plan(prev.as_ref(), manifests, !no_prune);
            let summary = plan.summary();
            info!(apply = summary.apply, prune = summary.prune, "applying plan");

            let cluster = KubeCluster::connect().await?;
            if let Err(e) = apply_set(&cluster, &plan.to_apply, &manager).await {
                error!(error = %e, "apply aborted; inventory left unchanged");
                anyhow::bail!("{e}");
            }
            let prune = prune_set(&cluster, &plan.to_prune).await;

            let mut recorded = plan.new_inventory;
            for (r, _) in &prune.failed {
                if !recorded.contains_id(&r.id) {
                    recorded.entries.push(r.clone());
                }
            }
            if let Some(path) = inventory.as_deref() {
                write_inventory(path, &recorded)?;
            }
            println!("applied {} resources, pruned {}", summary.apply, prune.pruned);
            if let Some(e) = prune.error() {
                eprintln!("prune incomplete: {e}");
            }

            if wait {
                let verdict = cueflow_apply::health::wait_ready(
                    &cluster,
                    &recorded.entries,
                    Duration::from_secs(timeout),
                )
                .await;
                match verdict {
                    ReadyVerdict::Ready => println!("all resources ready"),
                    ReadyVerdict::Failed { id, message } => {
                        anyhow::bail!("resource {id} failed: {message}")
                    }
                    ReadyVerdict::TimedOut { pending } => {
                        anyhow::bail!("timed out waiting for: {}", pending.join(", "))
                    }
                }
            }
        }
    }

    Ok(())
}
