//! busnet demonstration CLI
//!
//! Runs the full stack over an in-memory shared bus:
//! - `discover`: several nodes finding each other through heartbeats
//! - `transfer`: a segmented payload between two nodes
//!
//! Both commands drive the scheduler with a stepped virtual clock, so a
//! multi-second simulation finishes instantly.

use std::cell::RefCell;
use std::rc::Rc;
use std::time::{Duration, Instant};

use anyhow::{bail, Result};
use busnet_core::datalink::Datalink;
use busnet_core::node::{NetworkNode, NodeConfig};
use busnet_core::phy::{BusPort, SharedBus};
use busnet_core::scheduler::Scheduler;
use busnet_core::transport::{Transport, TransportData};
use clap::{Parser, Subcommand};
use tracing::{info, warn};

#[derive(Parser)]
#[command(name = "busnet")]
#[command(author, version, about = "Shared-medium stack demos", long_about = None)]
struct Cli {
    /// Enable verbose output
    #[arg(short, long, action = clap::ArgAction::Count)]
    verbose: u8,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Let simulated nodes discover each other via heartbeats
    Discover {
        /// Number of nodes on the bus
        #[arg(short, long, default_value = "3")]
        nodes: u16,

        /// Simulated run time in milliseconds
        #[arg(long, default_value = "2000")]
        duration_ms: u64,

        /// Virtual clock step in milliseconds
        #[arg(long, default_value = "10")]
        step_ms: u64,
    },

    /// Send a segmented payload from node 1 to node 2
    Transfer {
        /// Payload size in bytes
        #[arg(short, long, default_value = "300")]
        bytes: usize,

        /// Writable window the ports advertise (-1 = unbounded)
        #[arg(long, default_value = "-1", allow_hyphen_values = true)]
        window: isize,

        /// Virtual clock step in milliseconds
        #[arg(long, default_value = "10")]
        step_ms: u64,
    },
}

struct SimNode {
    address: u16,
    node: Rc<NetworkNode>,
    link: Rc<Datalink<BusPort>>,
    transport: Rc<Transport>,
}

fn attach_node(bus: &SharedBus, scheduler: &mut Scheduler, address: u16, port: u16) -> SimNode {
    let link = Rc::new(Datalink::new(bus.port()));
    let node = NetworkNode::new(NodeConfig::new(address));
    node.add_datalink(link.clone());
    let transport = Transport::attached(port, node.clone());
    scheduler.add_task(link.clone(), Duration::from_secs(1));
    scheduler.add_task(node.clone(), Duration::from_millis(100));
    SimNode {
        address,
        node,
        link,
        transport,
    }
}

fn run(scheduler: &mut Scheduler, start: Instant, duration: Duration, step: Duration) {
    let mut elapsed = Duration::ZERO;
    while elapsed <= duration {
        scheduler.poll(start + elapsed);
        elapsed += step;
    }
}

fn cmd_discover(count: u16, duration_ms: u64, step_ms: u64) -> Result<()> {
    if count < 2 {
        bail!("need at least 2 nodes, got {count}");
    }

    let bus = SharedBus::new();
    let mut scheduler = Scheduler::new();
    let nodes: Vec<SimNode> = (1..=count)
        .map(|address| attach_node(&bus, &mut scheduler, address, 0))
        .collect();

    info!(count, duration_ms, "running discovery");
    run(
        &mut scheduler,
        Instant::now(),
        Duration::from_millis(duration_ms),
        Duration::from_millis(step_ms.max(1)),
    );

    println!("reachability after {duration_ms} ms:");
    for node in &nodes {
        let mut reachable = node.node.reachable_nodes();
        reachable.sort_unstable();
        println!(
            "  node {:>3}: sees {:?} ({} heartbeats sent)",
            node.address,
            reachable,
            node.node.stats().heartbeats_tx
        );
    }

    let expected = count as usize - 1;
    if nodes
        .iter()
        .any(|n| n.node.reachable_nodes().len() != expected)
    {
        bail!("not every node discovered all {expected} peers");
    }
    println!("all {count} nodes see each other");
    Ok(())
}

fn cmd_transfer(bytes: usize, window: isize, step_ms: u64) -> Result<()> {
    if bytes == 0 {
        bail!("payload must not be empty");
    }

    let bus = SharedBus::with_write_window(window);
    let mut scheduler = Scheduler::new();
    let sender = attach_node(&bus, &mut scheduler, 1, 9);
    let receiver = attach_node(&bus, &mut scheduler, 2, 9);

    let delivered: Rc<RefCell<Option<TransportData>>> = Rc::new(RefCell::new(None));
    let sink = delivered.clone();
    receiver
        .transport
        .add_receive_handler(Box::new(move |message: &TransportData| {
            *sink.borrow_mut() = Some(message.clone());
        }));

    let frames_needed = bytes.div_ceil(busnet_core::SEGMENT_LEN) + 1;
    if frames_needed > busnet_core::FRAME_QUEUE_LEN {
        warn!(
            frames_needed,
            queue = busnet_core::FRAME_QUEUE_LEN,
            "payload needs more frames than the transmit queue holds; expect loss"
        );
    }

    let payload: Vec<u8> = (0..bytes).map(|i| (i % 251) as u8).collect();
    info!(bytes, window, "sending payload");
    sender.transport.send(&payload, 2, 9);

    // Pump in slices until delivery, bounded by a generous budget.
    let start = Instant::now();
    let step = Duration::from_millis(step_ms.max(1));
    let mut elapsed = Duration::ZERO;
    let budget = Duration::from_secs(60);
    while delivered.borrow().is_none() && elapsed <= budget {
        scheduler.poll(start + elapsed);
        elapsed += step;
    }

    let Some(message) = delivered.borrow_mut().take() else {
        bail!("payload was not delivered within {budget:?} of simulated time");
    };
    if message.data != payload {
        bail!("delivered payload differs from the original");
    }

    println!(
        "delivered {} bytes from node {} port {} in {} ms of simulated time",
        message.data.len(),
        message.src_address,
        message.src_port,
        elapsed.as_millis()
    );
    let tx = sender.transport.stats();
    let link = sender.link.stats();
    let rx = receiver.transport.stats();
    println!("  sender:   {} segments in {} frames, {} payload bytes on the wire",
        tx.segments_tx, link.frames_tx, link.bytes_tx);
    println!("  receiver: {} segments, {} messages, {} crc failures",
        rx.segments_rx, rx.messages_rx, rx.crc_failures);
    Ok(())
}

fn main() -> Result<()> {
    let cli = Cli::parse();

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
        Commands::Discover {
            nodes,
            duration_ms,
            step_ms,
        } => cmd_discover(nodes, duration_ms, step_ms),
        Commands::Transfer {
            bytes,
            window,
            step_ms,
        } => cmd_transfer(bytes, window, step_ms),
    }
}
