//! Transport self-test on a single box.
//!
//! Publishes an onion service for a throwaway key, dials it back through the
//! daemon's SOCKS port, runs the mutual handshake in both directions and
//! exchanges a ping.

use std::time::Duration;

use anyhow::{Context, Result};
use clap::Parser;
use tokio::io::{AsyncReadExt, AsyncWriteExt};

use kothawoc::keys::{onion_from_pubkey, NodeKey};
use kothawoc::transport::{client_handshake, server_handshake, TorCon};

#[derive(Parser)]
#[command(name = "torutils", about = "Overlay transport self-test")]
struct Args {
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

    let server_key = NodeKey::generate();
    let tc = TorCon::connect(&args.control_addr, &args.socks_addr, None)
        .await
        .context("onion daemon not reachable")?;

    let service = tc.listen(80, &server_key).await?;
    let address = service.id.clone();
    println!("onion service published: {address}");

    let accept_key = server_key.clone();
    let server = tokio::spawn(async move {
        loop {
            let mut conn = match service.accept().await {
                Ok(conn) => conn,
                Err(_) => continue,
            };
            match server_handshake(&mut conn, &accept_key, |_| async { true }).await {
                Ok(peer) => {
                    println!("server authenticated client {}", onion_from_pubkey(&peer));
                    let mut buf = [0u8; 1024];
                    if let Ok(n) = conn.read(&mut buf).await {
                        let mut reply = b"Ponged: ".to_vec();
                        reply.extend_from_slice(&buf[..n]);
                        let _ = conn.write_all(&reply).await;
                    }
                }
                Err(err) => eprintln!("server handshake failed: {err}"),
            }
        }
    });

    // Freshly published descriptors take a while to become reachable.
    let client_key = NodeKey::generate();
    let mut conn = loop {
        println!("dialing {address}.onion:80 ...");
        match tc.dial(&format!("{address}.onion:80")).await {
            Ok(conn) => break conn,
            Err(err) => {
                eprintln!("dial failed ({err}), retrying");
                tokio::time::sleep(Duration::from_secs(5)).await;
            }
        }
    };

    client_handshake(&mut conn, &client_key, &address)
        .await
        .context("client handshake failed")?;
    println!("client authenticated server {address}");

    conn.write_all(b"ping").await?;
    let mut buf = [0u8; 1024];
    let n = conn.read(&mut buf).await?;
    println!("reply from server: {}", String::from_utf8_lossy(&buf[..n]));

    server.abort();
    Ok(())
}
