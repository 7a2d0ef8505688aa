mod client;
mod config;
mod message;
mod packet;
mod server;
mod session;
mod storage;

use anyhow::{Context, Result};
use clap::Parser;
use client::{ClientEngine, TransferError};
use config::Config;
use server::ServerEngine;
use std::net::{SocketAddr, ToSocketAddrs};
use std::path::PathBuf;
use std::process::ExitCode;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use storage::StorageRoot;
use tracing::{error, info, warn};
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

// Codes de sortie du processus
const EXIT_OK: u8 = 0;
const EXIT_USAGE: u8 = 1;
const EXIT_NETWORK: u8 = 2;
const EXIT_CHECKSUM: u8 = 3;
const EXIT_IO: u8 = 4;

/// Transfert de fichiers furtif dans des datagrammes à façade NTP v4.
/// Le client et le serveur doivent partager le même magic, échangé
/// hors-bande.
#[derive(Parser, Debug)]
#[command(name = "ntpspy", version, about = "Covert file transfer over NTP-shaped datagrams")]
struct Cli {
    /// Mode serveur : racine de stockage des fichiers reçus
    #[arg(short = 's', long = "storage", value_name = "PATH")]
    storage: Option<PathBuf>,

    /// Écrase les fichiers homonymes au lieu de suffixer -1, -2, ...
    #[arg(short = 'o', long = "overwrite")]
    overwrite: bool,

    /// Port UDP (défaut : 123)
    #[arg(short = 'p', long = "port")]
    port: Option<u16>,

    /// Magic 32 bits en hexadécimal, non nul, identique des deux côtés
    #[arg(short = 'm', long = "magic", value_parser = parse_magic)]
    magic: Option<u32>,

    /// Intervalle minimal entre deux datagrammes sortants, en secondes
    #[arg(short = 't', long = "interval", value_name = "SECONDS")]
    interval: Option<f64>,

    /// Interroge le serveur sans rien transférer
    #[arg(short = 'q', long = "query")]
    query: bool,

    /// Fichier de configuration TOML optionnel
    #[arg(short = 'c', long = "config", value_name = "FILE")]
    config: Option<PathBuf>,

    /// Verbosité (-v info, -vv debug, -vvv trace)
    #[arg(short = 'v', action = clap::ArgAction::Count)]
    verbose: u8,

    /// Cible client : host[:port], puis zéro ou plusieurs fichiers
    /// (aucun fichier = lecture de stdin)
    #[arg(value_name = "ARGS")]
    args: Vec<String>,
}

fn main() -> ExitCode {
    let cli = Cli::parse();
    init_logging(cli.verbose);

    match run(cli) {
        Ok(code) => ExitCode::from(code),
        Err(e) => {
            error!("{:#}", e);
            ExitCode::from(EXIT_USAGE)
        }
    }
}

fn run(cli: Cli) -> Result<u8> {
    let mut config = match &cli.config {
        Some(path) => Config::from_file(path)?,
        None => Config::default(),
    };

    // Les options de la ligne de commande priment sur le fichier
    if let Some(port) = cli.port {
        config.net.port = port;
    }
    if let Some(magic) = cli.magic {
        config.net.magic = magic;
    }
    if let Some(interval) = cli.interval {
        config.timing.min_interval_secs = interval;
    }
    if cli.storage.is_some() {
        config.server.storage_root = cli.storage.clone();
    }
    if cli.overwrite {
        config.server.overwrite = true;
    }
    config.validate()?;

    // Premier Ctrl+C : arrêt propre. Deuxième : sortie immédiate.
    let shutdown = Arc::new(AtomicBool::new(false));
    let shutdown_handler = Arc::clone(&shutdown);
    ctrlc::set_handler(move || {
        if shutdown_handler.swap(true, Ordering::SeqCst) {
            std::process::exit(EXIT_NETWORK as i32);
        }
        eprintln!("interrupt received, shutting down (press again to force)");
    })
    .context("Failed to set Ctrl+C handler")?;

    match config.server.storage_root.clone() {
        Some(root) => run_server(&config, &root, shutdown),
        None => run_client(&cli, &config, shutdown),
    }
}

fn run_server(config: &Config, root: &std::path::Path, shutdown: Arc<AtomicBool>) -> Result<u8> {
    info!("ntpspy v{} (server mode)", env!("CARGO_PKG_VERSION"));

    let storage = match StorageRoot::open(root, config.server.overwrite) {
        Ok(storage) => storage,
        Err(e) => {
            error!("cannot open storage root {}: {}", root.display(), e);
            return Ok(EXIT_IO);
        }
    };

    let mut engine = ServerEngine::new(config, storage);
    match engine.run(shutdown) {
        Ok(()) => Ok(EXIT_OK),
        Err(e) => {
            error!("server error: {:#}", e);
            Ok(EXIT_NETWORK)
        }
    }
}

fn run_client(cli: &Cli, config: &Config, shutdown: Arc<AtomicBool>) -> Result<u8> {
    let Some(peer_spec) = cli.args.first() else {
        anyhow::bail!("missing peer host[:port] (or -s <path> for server mode)");
    };
    let peer = resolve_peer(peer_spec, config.net.port)?;

    let mut engine = match ClientEngine::new(peer, config.net.magic, config.tuning(), shutdown) {
        Ok(engine) => engine,
        Err(e) => {
            error!("cannot create client socket: {}", e);
            return Ok(EXIT_NETWORK);
        }
    };

    if cli.query {
        return match engine.query() {
            Ok((version, caps)) => {
                println!("server at {} answered: protocol version {}, caps {:#010x}", peer, version, caps);
                Ok(EXIT_OK)
            }
            Err(e) => {
                error!("query failed: {}", e);
                Ok(EXIT_NETWORK)
            }
        };
    }

    let files = &cli.args[1..];
    let mut network_failed = false;
    let mut checksum_failed = false;
    let mut io_failed = false;

    if files.is_empty() {
        match engine.send_stdin() {
            Ok(()) => {}
            Err(e) => {
                error!("stdin transfer failed: {}", e);
                classify_failure(&e, &mut network_failed, &mut checksum_failed, &mut io_failed);
            }
        }
    } else {
        for file in files {
            let path = PathBuf::from(file);
            match engine.send_file(&path) {
                Ok(()) => {}
                Err(e) => {
                    error!("transfer of \"{}\" failed: {}", file, e);
                    classify_failure(&e, &mut network_failed, &mut checksum_failed, &mut io_failed);
                    // Une panne de connectivité condamne tout le lot ;
                    // les autres échecs passent au fichier suivant
                    if matches!(e, TransferError::Unreachable(_) | TransferError::Interrupted) {
                        warn!("aborting remaining transfers");
                        break;
                    }
                }
            }
        }
    }

    Ok(if network_failed {
        EXIT_NETWORK
    } else if checksum_failed {
        EXIT_CHECKSUM
    } else if io_failed {
        EXIT_IO
    } else {
        EXIT_OK
    })
}

fn classify_failure(
    error: &TransferError,
    network_failed: &mut bool,
    checksum_failed: &mut bool,
    io_failed: &mut bool,
) {
    match error {
        TransferError::ChecksumFailed => *checksum_failed = true,
        TransferError::Io(_) => *io_failed = true,
        _ => *network_failed = true,
    }
}

/// Résout `host[:port]` ; le port configuré sert de défaut
fn resolve_peer(spec: &str, default_port: u16) -> Result<SocketAddr> {
    let resolved = (spec, default_port)
        .to_socket_addrs()
        .or_else(|_| spec.to_socket_addrs())
        .with_context(|| format!("cannot resolve peer address \"{}\"", spec))?
        .next();
    resolved.with_context(|| format!("no usable address for \"{}\"", spec))
}

/// Magic en hexadécimal, avec ou sans préfixe 0x, strictement non nul
fn parse_magic(s: &str) -> Result<u32, String> {
    let digits = s
        .trim_start_matches("0x")
        .trim_start_matches("0X");
    match u32::from_str_radix(digits, 16) {
        Ok(0) => Err("magic must be non-zero".to_string()),
        Ok(magic) => Ok(magic),
        Err(e) => Err(format!("invalid magic \"{}\": {}", s, e)),
    }
}

/// Initialise le système de logging. RUST_LOG prime sur les -v.
fn init_logging(verbose: u8) {
    let level = match verbose {
        0 => "warn",
        1 => "info",
        2 => "debug",
        _ => "trace",
    };
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(level));

    tracing_subscriber::registry()
        .with(fmt::layer().with_target(false).with_writer(std::io::stderr))
        .with(filter)
        .init();
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_magic() {
        assert_eq!(parse_magic("deadbeef"), Ok(0xDEAD_BEEF));
        assert_eq!(parse_magic("0xDEADBEEF"), Ok(0xDEAD_BEEF));
        assert_eq!(parse_magic("1"), Ok(1));
        assert!(parse_magic("0").is_err());
        assert!(parse_magic("0x0").is_err());
        assert!(parse_magic("not-hex").is_err());
        assert!(parse_magic("112233445566").is_err());
    }

    #[test]
    fn test_resolve_peer() {
        assert_eq!(
            resolve_peer("127.0.0.1", 1230).unwrap(),
            "127.0.0.1:1230".parse::<SocketAddr>().unwrap()
        );
        assert_eq!(
            resolve_peer("127.0.0.1:9999", 1230).unwrap(),
            "127.0.0.1:9999".parse::<SocketAddr>().unwrap()
        );
        assert!(resolve_peer("", 1230).is_err());
    }
}
