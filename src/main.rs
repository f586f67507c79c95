use std::collections::BTreeMap;
use std::str::FromStr;

use gossip_cluster::config::GossipSettings;
use gossip_cluster::gossip::engine::GossipEngine;
use gossip_cluster::membership::types::{Endpoint, Member, NodeId, DATACENTER, RACK};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_max_level(tracing::Level::INFO)
        .init();

    let args: Vec<String> = std::env::args().collect();

    if args.len() < 3 {
        eprintln!("Usage: {} --bind udp://<addr>:<port> [options]", args[0]);
        eprintln!("Options:");
        eprintln!("  --seed udp://<addr>:<port>   seed peer (repeatable)");
        eprintln!("  --cluster <name>             cluster name (default: cluster)");
        eprintln!("  --id <node-id>               node id (default: random UUID)");
        eprintln!("  --dc <name>                  datacenter tag");
        eprintln!("  --rack <name>                rack tag");
        eprintln!("Example: {} --bind udp://127.0.0.1:5000", args[0]);
        eprintln!(
            "Example: {} --bind udp://127.0.0.1:5001 --seed udp://127.0.0.1:5000 --dc dc1 --rack r1",
            args[0]
        );
        std::process::exit(1);
    }

    let mut bind: Option<Endpoint> = None;
    let mut seed_endpoints: Vec<Endpoint> = vec![];
    let mut cluster = "cluster".to_string();
    let mut id: Option<String> = None;
    let mut properties: BTreeMap<String, String> = BTreeMap::new();

    let mut i = 1;
    while i < args.len() {
        match args[i].as_str() {
            "--bind" => {
                bind = Some(Endpoint::from_str(&args[i + 1])?);
                i += 2;
            }
            "--seed" => {
                seed_endpoints.push(Endpoint::from_str(&args[i + 1])?);
                i += 2;
            }
            "--cluster" => {
                cluster = args[i + 1].clone();
                i += 2;
            }
            "--id" => {
                id = Some(args[i + 1].clone());
                i += 2;
            }
            "--dc" => {
                properties.insert(DATACENTER.to_string(), args[i + 1].clone());
                i += 2;
            }
            "--rack" => {
                properties.insert(RACK.to_string(), args[i + 1].clone());
                i += 2;
            }
            _ => {
                i += 1;
            }
        }
    }

    let bind = bind.expect("--bind is required");
    let id = NodeId(id.unwrap_or_else(|| uuid::Uuid::new_v4().to_string()));

    // Seed identities are unknown until first contact; address-derived ids
    // are placeholders that real heartbeats replace.
    let seeds: Vec<Member> = seed_endpoints
        .into_iter()
        .map(|endpoint| {
            Member::new(
                cluster.clone(),
                NodeId(format!("seed@{}", endpoint.socket_addr())),
                endpoint,
                BTreeMap::new(),
            )
        })
        .collect();

    tracing::info!("Starting node {} on {}", id, bind);
    if seeds.is_empty() {
        tracing::info!("Starting as founding node (no seeds)");
    } else {
        tracing::info!("Bootstrapping from {} seed(s)", seeds.len());
    }

    let engine = GossipEngine::new(
        cluster,
        id,
        bind,
        properties,
        seeds,
        GossipSettings::default(),
    );
    engine.start().await?;

    let stats_engine = engine.clone();
    tokio::spawn(async move {
        let mut interval = tokio::time::interval(std::time::Duration::from_secs(5));
        loop {
            interval.tick().await;
            let live = stats_engine.live_members();
            let dead = stats_engine.dead_members();
            tracing::info!("Cluster view: {} live, {} dead", live.len(), dead.len());
            for m in live {
                tracing::info!("  UP   {} at {}", m.id, m.endpoint);
            }
            for m in dead {
                tracing::info!("  DOWN {} at {}", m.id, m.endpoint);
            }
        }
    });

    tracing::info!("Press Ctrl+C to shut down");
    tokio::signal::ctrl_c().await?;

    tracing::info!("Shutting down");
    engine.stop().await;
    Ok(())
}
