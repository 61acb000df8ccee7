//! rucio-attach CLI entry point.
//!
//! Inspects notebook attachments, resolves them against a Rucio instance,
//! and keeps a running kernel supplied with its attached variables.

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use clap::{Parser, Subcommand};
use log::{debug, info, warn};
use rucio_attach::config::{default_config_path, watch_config_file};
use rucio_attach::jupyter::JupyterKernelConnection;
use rucio_attach::kernels::KernelTable;
use rucio_attach::resolver::AttachmentResolver;
use rucio_attach::status::StatusEvent;
use rucio_attach::{
    ActiveInstance, AttachConfig, HttpDidLookup, Instance, IpynbNotebook,
    KernelLifecycleCoordinator, KernelConnection, NotebookDocument, SessionEvent, StatusRegistry,
};
use tokio::sync::{broadcast, mpsc};

#[derive(Parser, Debug)]
#[command(name = "rucio-attach")]
#[command(about = "Inject Rucio DID attachments into Jupyter kernels")]
struct Cli {
    #[command(subcommand)]
    command: Commands,

    /// Config file (default: ~/.config/rucio-attach/config.json)
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    /// Log level
    #[arg(long, global = true, default_value = "info")]
    log_level: String,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Print a notebook's attachments as JSON
    Attachments {
        /// Path to the .ipynb file
        notebook: PathBuf,
    },

    /// Resolve a notebook's attachments and print the injections
    Resolve {
        /// Path to the .ipynb file
        notebook: PathBuf,

        /// Instance to resolve against (default: active_instance)
        #[arg(long)]
        instance: Option<String>,
    },

    /// Attach to a running kernel and keep its variables injected
    Inject {
        /// Path to the .ipynb file
        notebook: PathBuf,

        /// Kernel connection file
        #[arg(long)]
        connection_file: PathBuf,

        /// Instance to resolve against (default: active_instance)
        #[arg(long)]
        instance: Option<String>,

        /// Seconds between re-reading the notebook for new attachments
        #[arg(long, default_value = "30")]
        recheck_secs: u64,
    },

    /// Print the config file JSON Schema
    Schema,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    // Initialize logging
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or(&cli.log_level))
        .init();

    let config_path = cli.config.unwrap_or_else(default_config_path);

    match cli.command {
        Commands::Attachments { notebook } => {
            let notebook = IpynbNotebook::load(&notebook)?;
            let attachments = notebook.attachments()?;
            println!("{}", serde_json::to_string_pretty(&attachments)?);
        }
        Commands::Resolve { notebook, instance } => {
            resolve(&config_path, &notebook, instance.as_deref()).await?;
        }
        Commands::Inject {
            notebook,
            connection_file,
            instance,
            recheck_secs,
        } => {
            inject(
                &config_path,
                &notebook,
                &connection_file,
                instance.as_deref(),
                Duration::from_secs(recheck_secs.max(1)),
            )
            .await?;
        }
        Commands::Schema => {
            println!("{}", serde_json::to_string_pretty(&AttachConfig::schema())?);
        }
    }

    Ok(())
}

fn select_instance(config: &AttachConfig, name: Option<&str>) -> anyhow::Result<Option<Instance>> {
    match name {
        Some(name) => config
            .instance(name)
            .map(Some)
            .with_context(|| format!("Instance '{}' is not configured", name)),
        None => Ok(config.active()),
    }
}

async fn resolve(config_path: &Path, notebook: &Path, instance: Option<&str>) -> anyhow::Result<()> {
    let config = AttachConfig::load(config_path)?;
    let instance = select_instance(&config, instance)?
        .context("No instance selected; set active_instance or pass --instance")?;

    let notebook = IpynbNotebook::load(notebook)?;
    let attachments = notebook.attachments()?;

    let status = Arc::new(StatusRegistry::new());
    let resolver = AttachmentResolver::new(
        Arc::new(HttpDidLookup::new(&config.server_url, config.token.clone())),
        status.clone(),
        Arc::new(KernelTable::new()),
    );
    let injections: Vec<_> = resolver
        .resolve_for_notebook(&instance.name, &attachments, notebook.id())
        .await
        .into_iter()
        .flatten()
        .collect();

    let output = serde_json::json!({
        "instance": instance.name,
        "injections": injections,
        "statuses": status.notebook_statuses(notebook.id()),
    });
    println!("{}", serde_json::to_string_pretty(&output)?);
    Ok(())
}

async fn inject(
    config_path: &Path,
    notebook_path: &Path,
    connection_file: &Path,
    instance: Option<&str>,
    recheck: Duration,
) -> anyhow::Result<()> {
    let config = AttachConfig::load(config_path)?;
    let active = ActiveInstance::new(select_instance(&config, instance)?);
    if active.get().is_none() {
        warn!("No active instance; waiting for config.json to select one");
    }

    let lookup = Arc::new(HttpDidLookup::new(&config.server_url, config.token.clone()));
    let coordinator = KernelLifecycleCoordinator::new(lookup, active.clone());
    let instance_watcher = coordinator.spawn_instance_watcher();

    // An explicit --instance pins the selection
    let config_watcher = match instance {
        Some(_) => None,
        None => Some(tokio::spawn(watch_config_file(
            config_path.to_path_buf(),
            active.clone(),
        ))),
    };

    let status_logger = tokio::spawn(log_status_events(coordinator.status_registry().subscribe()));

    let notebook = Arc::new(IpynbNotebook::load(notebook_path)?);
    let notebook_id = notebook.id().to_string();

    let kernel = Arc::new(
        JupyterKernelConnection::connect(connection_file)
            .await
            .with_context(|| format!("Failed to connect to kernel via {:?}", connection_file))?,
    );
    info!("Connected to kernel {}", kernel.id());

    let (events_tx, events_rx) = mpsc::unbounded_channel();
    let session = coordinator.on_notebook_opened(notebook.clone(), events_rx);

    let mut kernel_status = kernel.subscribe_status();
    let status_tx = events_tx.clone();
    let status_forwarder = tokio::spawn(async move {
        loop {
            match kernel_status.recv().await {
                Ok(status) => {
                    if status_tx.send(SessionEvent::StatusChanged(status)).is_err() {
                        break;
                    }
                }
                Err(broadcast::error::RecvError::Lagged(n)) => {
                    debug!("Kernel status lagged by {}", n);
                }
                Err(broadcast::error::RecvError::Closed) => break,
            }
        }
    });

    let new: Arc<dyn KernelConnection> = kernel.clone();
    events_tx.send(SessionEvent::KernelChanged {
        old: None,
        new: Some(new),
    })?;
    events_tx.send(SessionEvent::Ready)?;

    let mut ticker = tokio::time::interval(recheck);
    ticker.tick().await;
    loop {
        tokio::select! {
            _ = ticker.tick() => {
                if let Err(e) = notebook.reload() {
                    warn!("Failed to re-read {:?}: {}", notebook_path, e);
                    continue;
                }
                coordinator.inject_uninjected(&notebook_id).await;
            }
            _ = tokio::signal::ctrl_c() => {
                info!("Shutting down");
                break;
            }
        }
    }

    let old: Arc<dyn KernelConnection> = kernel.clone();
    events_tx.send(SessionEvent::KernelChanged {
        old: Some(old),
        new: None,
    })?;
    drop(events_tx);
    status_forwarder.abort();
    session.await?;

    instance_watcher.abort();
    if let Some(watcher) = config_watcher {
        watcher.abort();
    }
    status_logger.abort();
    Ok(())
}

async fn log_status_events(mut events: broadcast::Receiver<StatusEvent>) {
    loop {
        match events.recv().await {
            Ok(StatusEvent::Set {
                notebook_id,
                did,
                status,
            }) => info!("{} {}: {}", notebook_id, did, status),
            Ok(StatusEvent::Cleared { notebook_id }) => {
                debug!("{}: statuses cleared", notebook_id)
            }
            Err(broadcast::error::RecvError::Lagged(n)) => debug!("Missed {} status events", n),
            Err(broadcast::error::RecvError::Closed) => break,
        }
    }
}
