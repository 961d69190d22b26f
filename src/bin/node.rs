//! Node entry point.
//!
//! Expects an onion daemon already running with its control and SOCKS ports
//! reachable at the given addresses.

use std::path::PathBuf;

use anyhow::Result;
use clap::Parser;

use kothawoc::{Node, NodeConfig};

#[derive(Parser)]
#[command(name = "node", about = "Run a kothawoc news node")]
struct Args {
    /// Data directory for databases, article blobs and daemon state.
    #[arg(long, default_value = "./data")]
    data: PathBuf,

    /// Loopback TCP port for local newsreaders.
    #[arg(long, default_value_t = 1119)]
    port: u16,

    /// Onion daemon control port.
    #[arg(long, default_value = "127.0.0.1:9051")]
    control_addr: String,

    /// Onion daemon SOCKS5 port.
    #[arg(long, default_value = "127.0.0.1:9050")]
    socks_addr: String,
}

#[tokio::main]
async fn main() -> Result<()> {
    env_logger::init();
    let args = Args::parse();

    let mut config = NodeConfig::new(args.data, args.port);
    config.control_addr = args.control_addr;
    config.socks_addr = args.socks_addr;

    let node = Node::start(config).await?;
    println!("node running as {}", node.id());

    tokio::signal::ctrl_c().await?;
    node.peers().shutdown().await;
    Ok(())
}
