//! HopperKV server binary
//!
//! Serves the HOPPER command surface over TCP using the Redis wire encoding
//! (inline and array commands both accepted). Each tenant gets its own
//! cache instance on its own port; commands block the serving connection
//! thread, matching the blocked-client model of the engine. With more than
//! one tenant, the allocation controller runs on a timer.

use std::io::{BufReader, Read, Write};
use std::net::{SocketAddr, TcpListener, TcpStream};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use clap::Parser;
use tracing::{error, info};

use hopperkv::commands::{dispatch, Reply};
use hopperkv::config::InstanceConfig;
use hopperkv::instance::CacheInstance;
use hopperkv::services::{AllocationController, ControllerConfig, ServiceManager};

#[derive(Parser, Debug)]
#[command(name = "hopperkv-server", about = "Look-aside KV cache server")]
struct Args {
    /// Listen address of the first tenant; tenant i listens on port + i
    #[arg(long, default_value = "127.0.0.1:7700")]
    listen: SocketAddr,

    /// Number of tenants (one cache instance and port each)
    #[arg(long, default_value_t = 1)]
    tenants: u16,

    /// Start in mock-store mode (no real backend)
    #[arg(long)]
    mock: bool,

    /// Backing-store table name
    #[arg(long)]
    table: Option<String>,

    /// Run the allocation controller at this interval (seconds); only
    /// meaningful with more than one tenant
    #[arg(long)]
    alloc_interval_secs: Option<u64>,

    /// Directory for ghost checkpoints
    #[arg(long, default_value = ".")]
    dump_dir: PathBuf,
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "info".into()),
        )
        .init();

    let args = Args::parse();
    info!(version = env!("CARGO_PKG_VERSION"), "hopperkv server starting");

    let mut instances = Vec::new();
    for i in 0..args.tenants {
        let mut config = InstanceConfig::new();
        config.dynamo.mock = args.mock;
        if let Some(table) = &args.table {
            config.dynamo.table = table.clone();
        }
        config.dump_path = if args.tenants == 1 {
            args.dump_dir.join("dump.ghc")
        } else {
            args.dump_dir.join(format!("dump-{i}.ghc"))
        };
        // real backends plug in through CacheInstance::new's backend slot
        let instance = Arc::new(CacheInstance::new(config, None)?);

        let addr = SocketAddr::new(args.listen.ip(), args.listen.port() + i);
        let listener = TcpListener::bind(addr)?;
        info!(tenant = i, %addr, "tenant listening");

        let inst = instance.clone();
        std::thread::Builder::new()
            .name(format!("hopper-accept-{i}"))
            .spawn(move || accept_loop(listener, inst))?;

        instances.push(instance);
    }

    let mut manager = ServiceManager::new();
    if let Some(secs) = args.alloc_interval_secs {
        if instances.len() > 1 {
            let controller = Arc::new(AllocationController::new(ControllerConfig {
                alloc_interval: Duration::from_secs(secs),
                ..Default::default()
            }));
            for inst in &instances {
                controller.add_instance(inst.clone());
            }
            manager.spawn(controller);
        } else {
            info!("allocation controller disabled: single tenant");
        }
    }

    tokio::signal::ctrl_c().await?;
    info!("shutting down");
    manager.shutdown().await;
    Ok(())
}

fn accept_loop(listener: TcpListener, instance: Arc<CacheInstance>) {
    for stream in listener.incoming() {
        match stream {
            Ok(stream) => {
                let inst = instance.clone();
                if let Err(e) = std::thread::Builder::new()
                    .name("hopper-client".into())
                    .spawn(move || {
                        if let Err(e) = serve_client(stream, inst) {
                            // disconnects are routine; log at debug level
                            tracing::debug!(error = %e, "client connection closed");
                        }
                    })
                {
                    error!(error = %e, "failed to spawn client thread");
                }
            }
            Err(e) => error!(error = %e, "accept failed"),
        }
    }
}

fn serve_client(stream: TcpStream, instance: Arc<CacheInstance>) -> std::io::Result<()> {
    let mut reader = BufReader::new(stream.try_clone()?);
    let mut writer = stream;

    while let Some(argv) = read_command(&mut reader)? {
        if argv.is_empty() {
            continue;
        }
        let reply = dispatch(&instance, &argv);
        let mut buf = Vec::new();
        encode_reply(&reply, &mut buf);
        writer.write_all(&buf)?;
    }
    Ok(())
}

/// Read one command: a RESP array (`*N` + bulk strings) or an inline
/// whitespace-separated line. Returns `None` on a clean EOF.
fn read_command(reader: &mut BufReader<TcpStream>) -> std::io::Result<Option<Vec<Bytes>>> {
    let Some(line) = read_line(reader)? else {
        return Ok(None);
    };
    if line.first() == Some(&b'*') {
        let count: usize = parse_int(&line[1..])?;
        let mut argv = Vec::with_capacity(count);
        for _ in 0..count {
            let Some(len_line) = read_line(reader)? else {
                return Err(protocol_err("unexpected EOF in bulk array"));
            };
            if len_line.first() != Some(&b'$') {
                return Err(protocol_err("expected bulk string"));
            }
            let len: usize = parse_int(&len_line[1..])?;
            let mut data = vec![0u8; len + 2];
            reader.read_exact(&mut data)?;
            data.truncate(len); // drop CRLF
            argv.push(Bytes::from(data));
        }
        Ok(Some(argv))
    } else {
        Ok(Some(
            line.split(|&b| b == b' ' || b == b'\t')
                .filter(|part| !part.is_empty())
                .map(Bytes::copy_from_slice)
                .collect(),
        ))
    }
}

/// Read a CRLF- (or LF-) terminated line, without the terminator
fn read_line(reader: &mut BufReader<TcpStream>) -> std::io::Result<Option<Vec<u8>>> {
    let mut line = Vec::new();
    let mut byte = [0u8; 1];
    loop {
        match reader.read(&mut byte)? {
            0 => {
                if line.is_empty() {
                    return Ok(None);
                }
                return Ok(Some(line));
            }
            _ => {
                if byte[0] == b'\n' {
                    if line.last() == Some(&b'\r') {
                        line.pop();
                    }
                    return Ok(Some(line));
                }
                line.push(byte[0]);
            }
        }
    }
}

fn parse_int(bytes: &[u8]) -> std::io::Result<usize> {
    std::str::from_utf8(bytes)
        .ok()
        .and_then(|s| s.trim().parse().ok())
        .ok_or_else(|| protocol_err("invalid length"))
}

fn protocol_err(msg: &str) -> std::io::Error {
    std::io::Error::new(std::io::ErrorKind::InvalidData, msg)
}

fn encode_reply(reply: &Reply, out: &mut Vec<u8>) {
    match reply {
        Reply::Simple(s) => {
            out.push(b'+');
            out.extend_from_slice(s.as_bytes());
            out.extend_from_slice(b"\r\n");
        }
        Reply::Error(msg) => {
            out.push(b'-');
            out.extend_from_slice(msg.as_bytes());
            out.extend_from_slice(b"\r\n");
        }
        Reply::Int(n) => {
            out.extend_from_slice(format!(":{n}\r\n").as_bytes());
        }
        Reply::Double(d) => {
            let s = format!("{d}");
            out.extend_from_slice(format!("${}\r\n{s}\r\n", s.len()).as_bytes());
        }
        Reply::Bulk(data) => {
            out.extend_from_slice(format!("${}\r\n", data.len()).as_bytes());
            out.extend_from_slice(data);
            out.extend_from_slice(b"\r\n");
        }
        Reply::Null => {
            out.extend_from_slice(b"$-1\r\n");
        }
        Reply::Array(elems) => {
            out.extend_from_slice(format!("*{}\r\n", elems.len()).as_bytes());
            for e in elems {
                encode_reply(e, out);
            }
        }
    }
}
