use anyhow::{Context, Result};
use clap::Parser;
use tokio::io::{AsyncBufReadExt, BufReader};
use tracing::warn;
use tracing_subscriber::{fmt, EnvFilter};

use burrow::{DhtKey, Node, NodeId};

#[derive(Parser, Debug)]
#[command(name = "burrow")]
#[command(author, version, about, long_about = None)]
struct Args {
    /// UDP port to listen on.
    #[arg(long, default_value_t = 4000)]
    port: u16,

    /// Bootstrap peer as IP:PORT.
    #[arg(long, value_name = "IP:PORT")]
    bootstrap: Option<String>,
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    fmt()
        .with_env_filter(filter)
        .with_target(true)
        .with_writer(std::io::stderr)
        .init();

    let node = Node::bind(args.port)
        .await
        .with_context(|| format!("could not start node on port {}", args.port))?;

    println!("Node ID: {}", node.id());
    println!("Listening on {}", node.local_peer().addr());

    match node.public_endpoint().await {
        Ok(endpoint) => println!("Public endpoint: {endpoint}"),
        Err(_) => println!("Public endpoint: unknown"),
    }
    println!("NAT type: {}", node.detect_nat_type().await);

    if let Some(bootstrap) = &args.bootstrap {
        println!("Bootstrapping from {bootstrap}");
        match node.bootstrap(bootstrap).await {
            Ok(()) => println!("Bootstrap complete, {} peers known", node.table_len()),
            Err(e) => warn!(error = %e, "bootstrap failed"),
        }
    } else {
        println!("Running as a bootstrap node");
    }

    print_help();

    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    loop {
        tokio::select! {
            _ = tokio::signal::ctrl_c() => {
                println!("\nShutting down");
                break;
            }
            line = lines.next_line() => {
                match line {
                    Ok(Some(line)) => {
                        if !run_command(&node, line.trim()).await {
                            break;
                        }
                    }
                    // stdin closed
                    Ok(None) => break,
                    Err(e) => {
                        warn!(error = %e, "stdin read failed");
                        break;
                    }
                }
            }
        }
    }

    node.shutdown().await;
    println!("Node stopped");
    Ok(())
}

fn print_help() {
    println!();
    println!("Commands:");
    println!("  store <key> <value>  - Store a key-value pair");
    println!("  get <key>            - Get a value by key");
    println!("  find <id-hex>        - Find the closest peers to an ID");
    println!("  ping <id-hex>        - Ping a known peer");
    println!("  connect <id-hex>     - Hole-punch a direct session to a known peer");
    println!("  info                 - Show node information");
    println!("  quit                 - Quit");
}

/// Run one interactive command. Returns `false` when the loop should exit.
async fn run_command(node: &Node, line: &str) -> bool {
    let mut parts = line.split_whitespace();
    let Some(command) = parts.next() else {
        return true;
    };

    match command {
        "store" => {
            let (Some(key), Some(value)) = (parts.next(), parts.next()) else {
                println!("Usage: store <key> <value>");
                return true;
            };
            match node
                .store(DhtKey::from_str_bytes(key), value.as_bytes().to_vec())
                .await
            {
                Ok(true) => println!("Stored {key:?} on all replicas"),
                Ok(false) => println!("Stored {key:?} locally; some replicas unreachable"),
                Err(e) => println!("Store failed: {e}"),
            }
        }
        "get" => {
            let Some(key) = parts.next() else {
                println!("Usage: get <key>");
                return true;
            };
            match node.get(&DhtKey::from_str_bytes(key)).await {
                Ok(value) => match String::from_utf8(value.clone()) {
                    Ok(text) => println!("Found value: {text}"),
                    Err(_) => println!("Found value: 0x{}", hex::encode(value)),
                },
                Err(e) => println!("Get failed: {e}"),
            }
        }
        "find" => {
            let Some(id) = parse_id_arg(parts.next(), "find") else {
                return true;
            };
            match node.find_node(id).await {
                Ok(peers) => {
                    println!("Found {} peers:", peers.len());
                    for peer in peers {
                        println!("  {peer}");
                    }
                }
                Err(e) => println!("Find failed: {e}"),
            }
        }
        "ping" => {
            let Some(id) = parse_id_arg(parts.next(), "ping") else {
                return true;
            };
            match node.ping(&id).await {
                Ok(true) => println!("Ping reply received"),
                Ok(false) => println!("Ping timed out"),
                Err(_) => println!("Peer not found in routing table"),
            }
        }
        "connect" => {
            let Some(id) = parse_id_arg(parts.next(), "connect") else {
                return true;
            };
            match node.connect(&id).await {
                Ok((ip, port)) => println!("Connection established with {ip}:{port}"),
                Err(e) => println!("Connect failed: {e}"),
            }
        }
        "info" => {
            println!("Node ID: {}", node.id());
            println!("Local endpoint: {}", node.local_peer().addr());
            let info = node.connection_info();
            match info.public {
                Some(endpoint) => println!("Public endpoint: {endpoint}"),
                None => println!("Public endpoint: unknown"),
            }
            println!("NAT type: {}", info.nat_type);
            println!("Stored records: {}", node.stored_records());
            let peers = node.table_snapshot();
            println!("Routing table: {} peers", peers.len());
            for peer in peers {
                println!("  {peer}");
            }
        }
        "quit" => return false,
        other => println!("Unknown command: {other}"),
    }
    true
}

fn parse_id_arg(arg: Option<&str>, command: &str) -> Option<NodeId> {
    let Some(arg) = arg else {
        println!("Usage: {command} <id-hex>");
        return None;
    };
    match NodeId::from_hex(arg) {
        Ok(id) => Some(id),
        Err(e) => {
            println!("{e}");
            None
        }
    }
}
