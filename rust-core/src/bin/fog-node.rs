// Standalone fog node over an in-process broker and ledger.
// Runs until stdin closes or a `quit` line is read.

use anyhow::Context;
use clap::Parser;
use fog_reputation::device::{DeviceRegistry, FileDeviceRegistry, StaticDeviceRegistry};
use fog_reputation::ledger::{LedgerGateway, LocalLedger};
use fog_reputation::node::{Collaborators, Node, NodeConfig};
use fog_reputation::transport::{
    device_reply_topic, device_topic, LocalBroker, LocalClient, MessageListener, PubSub, QOS,
};
use rand::Rng;
use serde_json::json;
use std::io::BufRead;
use std::path::PathBuf;
use std::sync::Arc;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

#[derive(Parser, Debug)]
#[command(name = "fog-node", about = "Reputation-driven fog node")]
struct Args {
    #[arg(long, default_value = "node_config.json")]
    config: PathBuf,
    /// JSON list of attached devices; re-read on every refresh.
    #[arg(long)]
    devices: Option<PathBuf>,
    /// Persist the ledger here instead of keeping it in memory.
    #[arg(long)]
    ledger_dir: Option<PathBuf>,
    /// Serve this node's readings on this address (overrides `http.listen_addr`).
    #[arg(long)]
    listen: Option<String>,
    /// Answer device read commands with synthetic readings.
    #[arg(long)]
    simulate_devices: bool,
}

fn main() -> anyhow::Result<()> {
    let args = Args::parse();
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .with_target(true)
        .with_level(true)
        .init();

    let mut config = NodeConfig::from_json_file(&args.config)
        .with_context(|| format!("failed to load config {}", args.config.display()))?;
    if let Some(listen) = args.listen {
        config.http.listen_addr = Some(listen);
    }
    info!(node_id = %config.node_id, node_ip = %config.node_ip, "loaded node config");

    let ledger: Arc<dyn LedgerGateway> = match &args.ledger_dir {
        Some(dir) => Arc::new(
            LocalLedger::open(dir)
                .with_context(|| format!("failed to open ledger in {}", dir.display()))?,
        ),
        None => Arc::new(LocalLedger::new()),
    };
    let registry: Arc<dyn DeviceRegistry> = match &args.devices {
        Some(path) => Arc::new(FileDeviceRegistry::new(path)),
        None => Arc::new(StaticDeviceRegistry::default()),
    };

    let broker = LocalBroker::new();
    let node = Node::new(
        config,
        Collaborators {
            transport: Arc::new(broker.client()),
            ledger,
            registry: Arc::clone(&registry),
            fetcher: None,
        },
    )
    .context("failed to build node")?;

    let simulator = if args.simulate_devices {
        let client = Arc::new(broker.client());
        client.connect().context("simulator transport")?;
        let devices = registry.all_devices().context("simulator device list")?;
        let sim = Arc::new(DeviceSimulator {
            client: Arc::clone(&client),
        });
        for d in &devices {
            client
                .subscribe(QOS, sim.clone(), &device_topic(&d.id))
                .context("simulator subscribe")?;
        }
        info!(devices = devices.len(), "device simulator running");
        Some(client)
    } else {
        None
    };

    node.start().context("failed to start node")?;

    for line in std::io::stdin().lock().lines() {
        match line {
            Ok(l) if l.trim() == "quit" => break,
            Ok(_) => {}
            Err(e) => {
                warn!(error = %e, "stdin closed");
                break;
            }
        }
    }

    node.stop();
    if let Some(client) = simulator {
        client.disconnect();
    }
    Ok(())
}

/// Plays the part of attached devices: answers `GET VALUE {sensor}` on `dev/{id}`.
struct DeviceSimulator {
    client: Arc<LocalClient>,
}

impl MessageListener for DeviceSimulator {
    fn message_arrived(&self, topic: &str, payload: &[u8]) {
        let Some(device_id) = topic.strip_prefix("dev/") else {
            return;
        };
        let command = String::from_utf8_lossy(payload);
        let Some(sensor_id) = command.trim().strip_prefix("GET VALUE ") else {
            return;
        };
        let reading = rand::thread_rng().gen_range(10.0..40.0_f64);
        let reply = json!({
            "METHOD": "GET",
            "HEADER": { "NAME": device_id },
            "BODY": { sensor_id: format!("{:.1}", reading) },
        });
        if let Err(e) = self
            .client
            .publish(&device_reply_topic(device_id), reply.to_string().as_bytes(), QOS)
        {
            warn!(device = device_id, error = %e, "simulated reply not sent");
        }
    }
}
