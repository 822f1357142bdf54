//! The `node` binary: one simulator node per process.
//!
//! `node <port> (<neighbor-port> <loss-rate>)+ [last]` brings the node up on
//! loopback; `change` and `send` commands are read from stdin one line at a
//! time. Transport tunables come from the `LOSSIM_CONFIG` environment
//! variable, log filtering from `RUST_LOG`.

use std::process::exit;
use std::sync::Arc;
use std::time::{SystemTime, UNIX_EPOCH};

use tokio::io::{AsyncBufReadExt, BufReader};
use tracing_subscriber::EnvFilter;

use lossim::{
    Command, CommandError, Node, NodeConfig, Reporter, Route, SendKey, TransportConfig,
};

const USAGE: &str = "usage: node <port> (<neighbor-port> <loss-rate>)+ [last]";

#[tokio::main]
async fn main() {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .init();

    let config = match NodeConfig::parse(std::env::args().skip(1)) {
        Ok(config) => config,
        Err(e) => {
            eprintln!("{e}");
            eprintln!("{USAGE}");
            exit(2);
        }
    };
    let transport = match TransportConfig::from_env() {
        Ok(transport) => transport,
        Err(e) => {
            eprintln!("{e}");
            exit(2);
        }
    };

    let port = config.port;
    let reporter = Arc::new(Console { port });
    let node = match Node::start(config, transport, reporter.clone()).await {
        Ok(node) => node,
        Err(e) => {
            eprintln!("failed to bind 127.0.0.1:{port}: {e}");
            exit(1);
        }
    };

    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    while let Ok(Some(line)) = lines.next_line().await {
        let line = line.trim();
        if line.is_empty() {
            continue;
        }
        match line.parse::<Command>() {
            Ok(Command::Change(updates)) => node.change(&updates).await,
            Ok(Command::Send { dest, count }) => {
                if let Err(reason) = node.send(dest, count).await {
                    reporter.send_rejected(&reason);
                }
            }
            Err(reason) => reporter.command_error(line, &reason),
        }
    }
    // stdin is gone; keep routing and forwarding until killed.
    std::future::pending::<()>().await;
}

/// Prints every operator-visible event to stdout.
struct Console {
    port: u16,
}

fn timestamp() -> u128 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_millis()
}

impl Reporter for Console {
    fn routing_table(&self, node: u16, routes: &[Route]) {
        println!("[{}] Node {node} - Routing Table", timestamp());
        for route in routes {
            if route.is_direct() {
                println!("Node {} -> ({:?})", route.dest, route.weight);
            } else {
                println!(
                    "Node {} [next {}] -> ({:?})",
                    route.dest, route.next_hop, route.weight
                );
            }
        }
    }

    fn dv_sent(&self, to: u16) {
        println!(
            "[{}] Message sent from Node {} to Node {to}",
            timestamp(),
            self.port
        );
    }

    fn dv_received(&self, from: u16) {
        println!(
            "[{}] Message received at Node {} from Node {from}",
            timestamp(),
            self.port
        );
    }

    fn link_cost_changed(&self, neighbor: u16, rate: f64, weight: f64) {
        println!(
            "[{}] Link to Node {neighbor} now drops {rate:?} of datagrams (weight {weight:?})",
            timestamp()
        );
    }

    fn transfer_started(&self, node: u16) {
        println!("[{}] start {node}", timestamp());
    }

    fn transfer_finished(&self, node: u16) {
        println!("[{}] finish {node}", timestamp());
    }

    fn burst_received(&self, from: u16, key: SendKey, total: u32, loss_rate: f64) {
        println!(
            "[{}] collected {} packets from Node {from} out of {total} datagrams, loss rate {loss_rate:?}",
            timestamp(),
            key.count,
        );
    }

    fn leg_finished(&self, neighbor: u16, dest: u16, elapsed_millis: u64) {
        println!("{} - {neighbor} -> {dest}: {elapsed_millis} ms", self.port);
    }

    fn send_finished(&self, dest: u16) {
        println!("[{}] send to {dest} done, every link measured", timestamp());
    }

    fn send_rejected(&self, reason: &CommandError) {
        println!("Oops, {reason}.");
    }

    fn command_error(&self, line: &str, _reason: &CommandError) {
        eprintln!("Oops, I don't recognize {line:?}, try again.");
    }
}
