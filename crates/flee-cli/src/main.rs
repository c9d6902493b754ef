//! FLEE Mesh Command-Line Interface
//!
//! This CLI provides tools for:
//! - Simulating hop-count route construction on a line of nodes
//! - Sending data packets towards the sink and tracing their path
//! - Printing the default protocol configuration

use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use flee_core::observer::Counters;
use flee_core::routing::INFINITE_DISTANCE;
use flee_core::sim::{MeshSimulator, NodePosition, SimConfig, SimEvent};
use flee_core::{HelloConfig, MacConfig};
use tracing::info;

#[derive(Parser)]
#[command(name = "flee")]
#[command(author, version, about = "FLEE mesh routing simulator", long_about = None)]
struct Cli {
    /// Enable verbose output
    #[arg(short, long, action = clap::ArgAction::Count)]
    verbose: u8,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Simulate a line of nodes with the sink at one end
    Simulate {
        /// Number of nodes, including the sink
        #[arg(short, long, default_value = "5")]
        nodes: usize,

        /// Distance between neighboring nodes in meters
        #[arg(long, default_value = "100.0")]
        spacing: f64,

        /// Radio range in meters
        #[arg(long, default_value = "150.0")]
        range: f64,

        /// Simulated time in seconds
        #[arg(long, default_value = "10")]
        stop_secs: u64,

        /// Data packets each non-sink node sends to the sink after convergence
        #[arg(short, long, default_value = "1")]
        messages: usize,

        /// Interval between Hellos from the sink, in milliseconds
        #[arg(long, default_value = "5000")]
        hello_interval_ms: u64,

        /// Print every node's routing table
        #[arg(long)]
        routes: bool,

        /// Print statistics as JSON
        #[arg(long)]
        json: bool,
    },

    /// Show the default MAC and routing configuration
    Info,
}

fn cmd_simulate(
    nodes: usize,
    spacing: f64,
    range: f64,
    stop_secs: u64,
    messages: usize,
    hello_interval_ms: u64,
    routes: bool,
    json: bool,
) -> Result<()> {
    if nodes == 0 {
        anyhow::bail!("at least one node is required");
    }

    let hello = HelloConfig::default().with_hello_interval(Duration::from_millis(hello_interval_ms));
    let config = SimConfig::default()
        .with_radio_range(range)
        .with_stop_time(Duration::from_secs(stop_secs))
        .with_hello(hello);

    let counters = Arc::new(Counters::new());
    let mut sim = MeshSimulator::new(config)
        .context("Invalid simulation configuration")?
        .with_observer(counters.clone());
    for i in 0..nodes {
        let name = if i == 0 {
            "sink".to_string()
        } else {
            format!("n{}", i)
        };
        sim.add_node(name, NodePosition::new(i as f64 * spacing, 0.0), i == 0)
            .context("Failed to add node")?;
    }

    if !json {
        println!("=== FLEE Mesh Simulation ===");
        println!();
        println!("Nodes:    {}", nodes);
        println!("Spacing:  {:.1} m", spacing);
        println!("Range:    {:.1} m", range);
        println!("Duration: {} s", stop_secs);
        println!();
    }

    // Let the Hello flood settle for half the run, then send data
    let settle = Duration::from_secs(stop_secs) / 2;
    sim.run_until(settle);
    info!(at = ?settle, "routes settled, sending data");

    let sink = sim.node(0)?.address();
    let mut sent = Vec::new();
    for _ in 0..messages {
        for from in 1..nodes {
            let payload = format!("reading from n{}", from).into_bytes();
            sent.push(sim.send(from, sink, payload)?);
        }
    }
    sim.run();

    if json {
        let report = serde_json::json!({
            "stats": sim.stats(),
            "observer": counters.snapshot(),
            "distances": sim.nodes().iter().map(|n| n.distance_to_sink()).collect::<Vec<_>>(),
        });
        println!("{}", serde_json::to_string_pretty(&report)?);
        return Ok(());
    }

    println!("=== Distances to Sink ===");
    println!();
    for node in sim.nodes() {
        let distance = node.distance_to_sink();
        let uplink = node
            .protocol()
            .uplink()
            .map(|u| u.to_string())
            .unwrap_or_else(|| "-".to_string());
        if distance == INFINITE_DISTANCE {
            println!("  {:<6} {:<14} unreachable", node.name(), node.address());
        } else {
            println!(
                "  {:<6} {:<14} distance {:>2}  uplink {}",
                node.name(),
                node.address(),
                distance,
                uplink
            );
        }
    }
    println!();

    if routes {
        println!("=== Routing Tables ===");
        for node in sim.nodes() {
            println!();
            println!("{} ({}):", node.name(), node.address());
            print!("{}", node.protocol().table());
        }
        println!();
    }

    println!("=== Data Packets ===");
    println!();
    for id in &sent {
        match sim.delivered(*id) {
            Some(packet) => {
                let path: Vec<&str> = packet
                    .path
                    .iter()
                    .filter_map(|i| sim.nodes().get(*i).map(|n| n.name()))
                    .collect();
                println!("  #{:<3} delivered  {}", id, path.join(" -> "));
            }
            None => {
                let reason = sim.event_log().iter().find_map(|e| match e {
                    SimEvent::DataDropped { id: d, reason, .. } if d == id => Some(reason.as_str()),
                    _ => None,
                });
                println!("  #{:<3} dropped    {}", id, reason.unwrap_or("still in flight"));
            }
        }
    }
    println!();

    let stats = sim.stats();
    println!("=== Simulation Results ===");
    println!();
    println!("Hellos sent:        {}", stats.hellos_sent);
    println!("Acks sent:          {}", stats.acks_sent);
    println!("Datagrams delivered: {}", stats.datagrams_delivered);
    println!("Data sent:          {}", stats.data_sent);
    println!("Data delivered:     {}", stats.data_delivered);
    println!("Delivery rate:      {:.1}%", stats.delivery_rate() * 100.0);
    println!("Average hops:       {:.2}", stats.avg_hops());
    println!("Routes installed:   {}", counters.snapshot().routes_installed);

    Ok(())
}

fn cmd_info() -> Result<()> {
    let mac = MacConfig::default();
    let hello = HelloConfig::default();

    println!("=== MAC ===");
    println!("{}", serde_json::to_string_pretty(&mac)?);
    println!("Short expiry: {:?}", mac.short_expiry());
    println!("Long expiry:  {:?}", mac.long_expiry());
    println!();
    println!("=== Routing ===");
    println!("{}", serde_json::to_string_pretty(&hello)?);
    Ok(())
}

fn main() -> Result<()> {
    let cli = Cli::parse();

    // Setup logging
    let log_level = match cli.verbose {
        0 => tracing::Level::WARN,
        1 => tracing::Level::INFO,
        2 => tracing::Level::DEBUG,
        _ => tracing::Level::TRACE,
    };

    tracing_subscriber::fmt()
        .with_max_level(log_level)
        .with_target(false)
        .init();

    match cli.command {
        Commands::Simulate {
            nodes,
            spacing,
            range,
            stop_secs,
            messages,
            hello_interval_ms,
            routes,
            json,
        } => cmd_simulate(
            nodes,
            spacing,
            range,
            stop_secs,
            messages,
            hello_interval_ms,
            routes,
            json,
        ),
        Commands::Info => cmd_info(),
    }
}
