//! lockstep - Main executable
//!
//! A TFTP server and client. The server hands out the files found in its
//! root directory, one transfer per file at a time; the client fetches or
//! stores a single file.

use std::net::{IpAddr, SocketAddr};
use std::path::PathBuf;
use std::time::Duration;

use anyhow::{Context, Result};
use argh::FromArgs;
use tftp::{
    DEFAULT_MAX_RESOURCES, TftpClient, TftpServer, TftpServerConfig, TransferConfig, TransferStats,
    reliable::{DEFAULT_MAX_ATTEMPTS, DEFAULT_TIMEOUT_SECS},
};
use tracing_subscriber::EnvFilter;

const DEFAULT_BIND: &str = "0.0.0.0:6969"; // use 6969 for non-root testing; run as root for :69
const DEFAULT_ROOT: &str = "./tftp_root";

#[derive(FromArgs, Debug)]
#[argh(
    description = "lockstep - TFTP server and client with the bigfile extension",
    example = "Serve ./tftp_root on the unprivileged default port:\n  {command_name} serve",
    example = "Serve /srv/tftp on the standard port:\n  {command_name} serve --bind 0.0.0.0:69 --root /srv/tftp",
    example = "Fetch a large image:\n  {command_name} get 10.0.1.50:6969 disk.img --bigfile",
    example = "Store a file:\n  {command_name} put 10.0.1.50:6969 ./notes.txt"
)]
struct Cli {
    #[argh(switch, short = 'v', description = "log at debug level")]
    verbose: bool,

    #[argh(
        option,
        short = 't',
        description = "seconds to wait for each reply",
        default = "DEFAULT_TIMEOUT_SECS"
    )]
    timeout: u64,

    #[argh(
        option,
        short = 'a',
        description = "transmissions of a packet before giving up",
        default = "DEFAULT_MAX_ATTEMPTS"
    )]
    attempts: usize,

    #[argh(subcommand)]
    command: Command,
}

#[derive(FromArgs, Debug)]
#[argh(subcommand)]
enum Command {
    Serve(ServeArgs),
    Get(GetArgs),
    Put(PutArgs),
}

#[derive(FromArgs, Debug)]
#[argh(subcommand, name = "serve", description = "serve the files of a directory")]
struct ServeArgs {
    #[argh(
        option,
        short = 'b',
        description = "control endpoint bind address",
        default = "DEFAULT_BIND.to_string()"
    )]
    bind: String,

    #[argh(
        option,
        short = 'r',
        description = "directory whose files are served",
        default = "PathBuf::from(DEFAULT_ROOT)"
    )]
    root: PathBuf,

    #[argh(option, short = 'i', description = "local IP for data endpoints")]
    ip: Option<IpAddr>,

    #[argh(
        option,
        short = 'm',
        description = "most files to register",
        default = "DEFAULT_MAX_RESOURCES"
    )]
    max_files: usize,
}

#[derive(FromArgs, Debug)]
#[argh(subcommand, name = "get", description = "download a file from a server")]
struct GetArgs {
    #[argh(positional, description = "server address (host:port)")]
    server: String,

    #[argh(positional, description = "remote file name")]
    remote: String,

    #[argh(positional, description = "local destination (defaults to the remote name)")]
    local: Option<PathBuf>,

    #[argh(switch, description = "request block number wraparound for files over 32 MiB")]
    bigfile: bool,
}

#[derive(FromArgs, Debug)]
#[argh(subcommand, name = "put", description = "upload a file to a server")]
struct PutArgs {
    #[argh(positional, description = "server address (host:port)")]
    server: String,

    #[argh(positional, description = "local file to send")]
    local: PathBuf,

    #[argh(positional, description = "remote file name (defaults to the local file name)")]
    remote: Option<String>,

    #[argh(switch, description = "request block number wraparound for files over 32 MiB")]
    bigfile: bool,
}

impl Cli {
    fn transfer_config(&self) -> TransferConfig {
        TransferConfig {
            timeout: Duration::from_secs(self.timeout),
            max_attempts: self.attempts,
            ..Default::default()
        }
    }
}

async fn resolve_server(server: &str) -> Result<SocketAddr> {
    tokio::net::lookup_host(server)
        .await
        .with_context(|| format!("Invalid server address: {}", server))?
        .next()
        .with_context(|| format!("Server address {} resolved to nothing", server))
}

async fn serve(args: ServeArgs, mut transfer_config: TransferConfig) -> Result<()> {
    transfer_config.local_bind = args.ip;
    let config = TftpServerConfig {
        bind_address: args.bind,
        root_directory: args.root,
        max_resources: args.max_files,
        transfer_config,
    };

    TftpServer::new(config).run().await
}

async fn get(args: GetArgs, transfer_config: TransferConfig) -> Result<TransferStats> {
    let server = resolve_server(&args.server).await?;
    let local = args.local.unwrap_or_else(|| PathBuf::from(&args.remote));

    TftpClient::with_config(server, transfer_config)
        .bigfile(args.bigfile)
        .get(&args.remote, &local)
        .await
}

async fn put(args: PutArgs, transfer_config: TransferConfig) -> Result<TransferStats> {
    let server = resolve_server(&args.server).await?;
    let remote = match args.remote {
        Some(remote) => remote,
        None => args
            .local
            .file_name()
            .and_then(|name| name.to_str())
            .map(str::to_string)
            .with_context(|| format!("Cannot derive a remote name from {}", args.local.display()))?,
    };

    TftpClient::with_config(server, transfer_config)
        .bigfile(args.bigfile)
        .put(&args.local, &remote)
        .await
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli: Cli = argh::from_env();

    let default_level = if cli.verbose { "debug" } else { "info" };
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_level));
    tracing_subscriber::fmt().with_env_filter(filter).init();

    let transfer_config = cli.transfer_config();

    match cli.command {
        Command::Serve(args) => serve(args, transfer_config).await,
        Command::Get(args) => {
            let stats = get(args, transfer_config).await?;
            tracing::info!("Received {} bytes in {} blocks", stats.bytes, stats.blocks);
            Ok(())
        }
        Command::Put(args) => {
            let stats = put(args, transfer_config).await?;
            tracing::info!("Sent {} bytes in {} blocks", stats.bytes, stats.blocks);
            Ok(())
        }
    }
}
