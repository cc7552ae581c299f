//! Send one message to a Diameter node and report what it did with the connection.
//!
//! # Usage
//! ```text
//! diameter-probe --addr 127.0.0.1:3868 --kind cer
//! diameter-probe --addr 127.0.0.1:3868 --kind garbage --wait-ms 2000
//! ```

use std::time::{Duration, Instant};

use clap::{Parser, ValueEnum};
use serde::Serialize;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;

use diameter_acceptor::codec::MessageBuilder;

#[derive(Debug, Clone, Copy, ValueEnum, Serialize)]
#[serde(rename_all = "lowercase")]
enum Kind {
    /// A complete Capabilities-Exchange-Request.
    Cer,
    /// A Device-Watchdog-Request (valid message, wrong opener).
    Dwr,
    /// Bytes that are not a Diameter message.
    Garbage,
}

#[derive(Debug, Parser)]
#[command(name = "diameter-probe", about = "Probe a Diameter listener")]
struct Args {
    /// Node address, e.g. 127.0.0.1:3868.
    #[arg(long)]
    addr: String,

    #[arg(long, value_enum, default_value_t = Kind::Cer)]
    kind: Kind,

    #[arg(long, default_value = "probe.localdomain")]
    origin_host: String,

    #[arg(long, default_value = "localdomain")]
    origin_realm: String,

    /// How long to watch the connection after sending.
    #[arg(long, default_value_t = 500)]
    wait_ms: u64,
}

#[derive(Debug, Serialize)]
struct Report {
    addr: String,
    kind: Kind,
    sent_bytes: usize,
    received_bytes: usize,
    connection_open: bool,
    closed_after_ms: Option<u64>,
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let args = Args::parse();

    let mut stream = TcpStream::connect(&args.addr).await?;
    let local_ip = stream.local_addr()?.ip();

    let message = match args.kind {
        Kind::Cer => {
            MessageBuilder::capabilities_exchange_request(&args.origin_host, &args.origin_realm, local_ip).build()
        }
        Kind::Dwr => MessageBuilder::device_watchdog_request(&args.origin_host, &args.origin_realm).build(),
        Kind::Garbage => bytes::Bytes::from_static(b"GET / HTTP/1.1\r\n\r\n\0\0"),
    };

    let sent = Instant::now();
    stream.write_all(&message).await?;

    let deadline = tokio::time::Instant::now() + Duration::from_millis(args.wait_ms);
    let mut received_bytes = 0;
    let mut closed_after_ms = None;
    let mut buf = [0u8; 4096];
    loop {
        match tokio::time::timeout_at(deadline, stream.read(&mut buf)).await {
            Ok(Ok(0)) | Ok(Err(_)) => {
                closed_after_ms = Some(sent.elapsed().as_millis() as u64);
                break;
            }
            Ok(Ok(n)) => received_bytes += n,
            Err(_) => break,
        }
    }

    let report = Report {
        addr: args.addr,
        kind: args.kind,
        sent_bytes: message.len(),
        received_bytes,
        connection_open: closed_after_ms.is_none(),
        closed_after_ms,
    };
    println!("{}", serde_json::to_string_pretty(&report)?);
    Ok(())
}
