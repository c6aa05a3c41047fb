use std::str::FromStr;
use std::sync::Arc;
use std::time::Instant;

use anyhow::{bail, Context, Result};
use clap::{Parser, Subcommand, ValueEnum};
use kide_api::{ClusterContext, LoadError, StoreChange, SubscribeOptions, SyncConfig};
use kide_core::{format_age, KubeObject, ObjectOrder};
use tokio::signal;
use tokio::sync::broadcast::error::RecvError;
use tracing::{info, warn};

#[derive(Parser, Debug)]
#[command(name = "kidectl", version, about = "kide CLI")]
struct Cli {
    /// Output format
    #[arg(short = 'o', long = "output", value_enum, global = true, default_value_t = Output::Human)]
    output: Output,

    /// Namespaces to look at, comma separated (default: all)
    #[arg(long = "ns", global = true, value_delimiter = ',', env = "KIDE_NAMESPACES")]
    namespaces: Vec<String>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Copy, Clone, Debug, Eq, PartialEq, ValueEnum)]
enum Output {
    Human,
    Json,
    Yaml,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Discover served resources (incl. CRDs)
    Discover,
    /// List objects of a kind, e.g. "Pod", "apps/v1/Deployment" or "/api/v1/pods"
    Ls {
        kind: String,
        /// Sort order
        #[arg(long = "sort", value_enum, default_value_t = Sort::Name)]
        sort: Sort,
    },
    /// Fetch one object
    Get { kind: String, name: String },
    /// Watch a kind and print +/- events
    Watch { kind: String },
    /// Delete one object
    Delete { kind: String, name: String },
}

#[derive(Copy, Clone, Debug, Eq, PartialEq, ValueEnum)]
enum Sort {
    Name,
    Age,
}

fn init_tracing() {
    let env = std::env::var("KIDE_LOG").unwrap_or_else(|_| "info".to_string());
    let filter = tracing_subscriber::EnvFilter::from_str(&env).unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info"));
    tracing_subscriber::fmt().with_env_filter(filter).with_target(true).with_writer(std::io::stderr).init();
}

fn init_metrics() {
    if let Ok(addr) = std::env::var("KIDE_METRICS_ADDR") {
        if let Ok(sock) = addr.parse::<std::net::SocketAddr>() {
            let builder = metrics_exporter_prometheus::PrometheusBuilder::new();
            match builder.with_http_listener(sock).install() {
                Ok(_) => tracing::info!(addr = %addr, "Prometheus metrics exporter listening"),
                Err(e) => tracing::warn!(error = %e, "failed to install metrics exporter"),
            }
        } else {
            tracing::warn!(addr = %addr, "invalid KIDE_METRICS_ADDR; expected host:port");
        }
    }
}

fn print_objects(output: Output, ctx: &ClusterContext, objs: &[Arc<KubeObject>]) -> Result<()> {
    match output {
        Output::Human => {
            let now = chrono::Utc::now();
            println!("{:<20} {:<40} {:<6} STATUS", "NAMESPACE", "NAME", "AGE");
            for o in objs {
                let age = o.age(now).map(format_age).unwrap_or_else(|| "-".into());
                let status = ctx.decode(o).map(|t| t.summary()).unwrap_or_default();
                println!("{:<20} {:<40} {:<6} {}", o.namespace().unwrap_or("-"), o.name(), age, status);
            }
        }
        Output::Json => {
            let raw: Vec<&serde_json::Value> = objs.iter().map(|o| o.raw()).collect();
            println!("{}", serde_json::to_string_pretty(&raw)?);
        }
        Output::Yaml => {
            let raw: Vec<&serde_json::Value> = objs.iter().map(|o| o.raw()).collect();
            print!("{}", serde_yaml::to_string(&raw)?);
        }
    }
    Ok(())
}

fn report_load_errors(errors: &[LoadError]) {
    for e in errors {
        eprintln!("warning: {}: {}", e.namespace.as_deref().unwrap_or("(all namespaces)"), e.error);
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    init_tracing();
    init_metrics();
    let cli = Cli::parse();

    let mut config = SyncConfig::from_env();
    if !cli.namespaces.is_empty() {
        config.namespaces = cli.namespaces.clone();
    }
    let ctx = ClusterContext::connect(config).await.context("connecting to cluster")?;
    let first_ns = cli.namespaces.first().map(String::as_str);

    match cli.command {
        Commands::Discover => {
            let apis = ctx.manager().apis();
            match cli.output {
                Output::Human => {
                    for api in &apis {
                        let r = api.resource();
                        let scope = if r.namespaced { "namespaced" } else { "cluster" };
                        println!("{} • {} • {}", r.api_version(), r.kind, scope);
                    }
                }
                Output::Json => {
                    let defs: Vec<_> = apis.iter().map(|a| a.resource()).collect();
                    println!("{}", serde_json::to_string_pretty(&defs)?);
                }
                Output::Yaml => {
                    let defs: Vec<_> = apis.iter().map(|a| a.resource()).collect();
                    print!("{}", serde_yaml::to_string(&defs)?);
                }
            }
        }
        Commands::Ls { kind, sort } => {
            let store = ctx.store(&kind)?;
            info!(kind = %store.kind(), namespaces = ?cli.namespaces, "ls invoked");
            let t0 = Instant::now();
            let summary = store.load_all(&cli.namespaces).await?;
            report_load_errors(&summary.errors);
            let order = match sort {
                Sort::Name => ObjectOrder::Name,
                Sort::Age => ObjectOrder::CreationDesc,
            };
            let mut items: Vec<_> = store.context_items().iter().cloned().collect();
            items.sort_by(|a, b| order.compare(a, b));
            print_objects(cli.output, &ctx, &items)?;
            info!(items = items.len(), took_ms = %t0.elapsed().as_millis(), "ls done");
        }
        Commands::Get { kind, name } => {
            let api = ctx.api(&kind)?;
            if api.resource().namespaced && first_ns.is_none() {
                bail!("{} is namespaced; pass --ns", api.resource().kind);
            }
            let obj = api.get(&name, first_ns).await?;
            match cli.output {
                Output::Human => print_objects(cli.output, &ctx, &[Arc::new(obj)])?,
                Output::Json => println!("{}", serde_json::to_string_pretty(obj.raw())?),
                Output::Yaml => print!("{}", serde_yaml::to_string(obj.raw())?),
            }
        }
        Commands::Delete { kind, name } => {
            let api = ctx.api(&kind)?;
            if api.resource().namespaced && first_ns.is_none() {
                bail!("{} is namespaced; pass --ns", api.resource().kind);
            }
            api.delete(&name, first_ns).await?;
            println!("deleted {} {}", api.resource().kind, name);
        }
        Commands::Watch { kind } => {
            let store = ctx.store(&kind)?;
            let mut changes = store.changes();
            let opts = SubscribeOptions {
                namespaces: None,
                on_load_failure: Some(Arc::new(|e: &LoadError| report_load_errors(std::slice::from_ref(e)))),
            };
            let sub = ctx.subscribe(&kind, opts)?;
            info!(kind = %store.kind(), "watch invoked");
            loop {
                tokio::select! {
                    _ = signal::ctrl_c() => {
                        info!("interrupted");
                        break;
                    }
                    change = changes.recv() => match change {
                        Ok(StoreChange::Upserted(o)) => println!("+ {}", o.key()),
                        Ok(StoreChange::Removed(o)) => println!("- {}", o.key()),
                        Ok(StoreChange::Reloaded(_)) => {
                            for o in store.context_items().iter() {
                                println!("= {}", o.key());
                            }
                        }
                        Ok(StoreChange::Evicted(ns)) => println!("- {}/*", ns),
                        Err(RecvError::Lagged(n)) => warn!(skipped = n, "watch output fell behind"),
                        Err(RecvError::Closed) => break,
                    }
                }
            }
            ctx.shutdown().await;
            info!(status = ?sub.status(), "watch stopped");
        }
    }
    Ok(())
}
