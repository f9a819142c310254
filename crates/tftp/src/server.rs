//! TFTP Server Implementation
//!
//! The server listens on one well-known control endpoint. Each read or
//! write request for a registered file is handed to its own task, which
//! takes the file's lock, opens a fresh data endpoint and runs the transfer
//! there. The accept loop itself never waits on a transfer.

use std::collections::HashSet;
use std::net::{IpAddr, SocketAddr};
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, PoisonError};

use anyhow::{Context, Result, bail};
use tokio::fs::{File, OpenOptions};

use crate::endpoint::Endpoint;
use crate::error::TransferError;
use crate::locks::ResourceLocks;
use crate::negotiation::{self, TransferOptions};
use crate::protocol::{Packet, Request, TftpErrorCode};
use crate::registry::{DEFAULT_MAX_RESOURCES, FileRegistry};
use crate::transfer::{Role, TransferConfig, TransferSession, TransferStats};

/// TFTP Server configuration
#[derive(Debug, Clone)]
pub struct TftpServerConfig {
    pub bind_address: String,
    pub root_directory: PathBuf,
    /// Most files registered from the root directory
    pub max_resources: usize,
    pub transfer_config: TransferConfig,
}

impl Default for TftpServerConfig {
    fn default() -> Self {
        Self {
            bind_address: "0.0.0.0:6969".to_string(),
            root_directory: PathBuf::from("./tftp_root"),
            max_resources: DEFAULT_MAX_RESOURCES,
            transfer_config: TransferConfig::default(),
        }
    }
}

/// State shared by every transfer task
#[derive(Debug)]
struct ServerContext {
    registry: FileRegistry,
    locks: ResourceLocks,
    in_flight: Arc<InFlight>,
    transfer_config: TransferConfig,
    /// Address data endpoints bind to
    data_ip: Option<IpAddr>,
}

/// Client, file and direction of one request
type RequestKey = (SocketAddr, String, Role);

/// Requests that are queued for a lock or running
///
/// A client waiting for a busy file hears nothing and retransmits its
/// request; those copies must not become transfers of their own.
#[derive(Debug, Default)]
struct InFlight {
    keys: Mutex<HashSet<RequestKey>>,
}

impl InFlight {
    /// Register a request, or `None` if the same one is already in flight
    fn admit(self: &Arc<Self>, key: RequestKey) -> Option<InFlightGuard> {
        let mut keys = self.keys.lock().unwrap_or_else(PoisonError::into_inner);
        if !keys.insert(key.clone()) {
            return None;
        }
        Some(InFlightGuard {
            in_flight: Arc::clone(self),
            key,
        })
    }

    fn len(&self) -> usize {
        self.keys.lock().unwrap_or_else(PoisonError::into_inner).len()
    }
}

/// Keeps a request registered until its task ends
#[derive(Debug)]
struct InFlightGuard {
    in_flight: Arc<InFlight>,
    key: RequestKey,
}

impl Drop for InFlightGuard {
    fn drop(&mut self) {
        self.in_flight
            .keys
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(&self.key);
    }
}

/// Main TFTP server
pub struct TftpServer {
    config: TftpServerConfig,
    control: Option<Endpoint>,
    context: Option<Arc<ServerContext>>,
}

impl TftpServer {
    /// Create a new TFTP server with the given configuration
    pub fn new(config: TftpServerConfig) -> Self {
        Self {
            config,
            control: None,
            context: None,
        }
    }

    /// Create a new TFTP server with default configuration
    pub fn with_defaults() -> Self {
        Self::new(TftpServerConfig::default())
    }

    /// Create a new TFTP server with custom bind address and root directory
    pub fn with_config(bind_address: String, root_directory: PathBuf) -> Self {
        Self::new(TftpServerConfig {
            bind_address,
            root_directory,
            ..Default::default()
        })
    }

    /// Get the server's configuration
    pub fn config(&self) -> &TftpServerConfig {
        &self.config
    }

    /// Get a mutable reference to the server's configuration
    pub fn config_mut(&mut self) -> &mut TftpServerConfig {
        &mut self.config
    }

    /// The files this server answers for (once bound)
    pub fn registry(&self) -> Option<&FileRegistry> {
        self.context.as_ref().map(|c| &c.registry)
    }

    /// Scan the root directory and bind the control endpoint
    ///
    /// Returns the bound address, which differs from the configured one
    /// when port 0 was requested.
    pub async fn bind(&mut self) -> Result<SocketAddr> {
        let addr = tokio::net::lookup_host(self.config.bind_address.as_str())
            .await
            .with_context(|| format!("Invalid bind address {}", self.config.bind_address))?
            .next()
            .with_context(|| format!("Bind address {} resolved to nothing", self.config.bind_address))?;

        let registry = FileRegistry::scan(&self.config.root_directory, self.config.max_resources).await?;
        let locks = ResourceLocks::from_registry(&registry);

        let control = Endpoint::bind_control(addr)?;
        let local_addr = control.local_addr().context("Failed to get local address")?;

        let data_ip = self
            .config
            .transfer_config
            .local_bind
            .or_else(|| (!local_addr.ip().is_unspecified()).then(|| local_addr.ip()));

        tracing::info!(
            "TFTP server listening on {}, serving {} files from {}",
            local_addr,
            registry.len(),
            self.config.root_directory.display()
        );

        self.context = Some(Arc::new(ServerContext {
            registry,
            locks,
            in_flight: Arc::default(),
            transfer_config: self.config.transfer_config.clone(),
            data_ip,
        }));
        self.control = Some(control);
        Ok(local_addr)
    }

    /// Start the TFTP server and run the main loop
    pub async fn run(&mut self) -> Result<()> {
        self.bind().await?;
        self.serve().await
    }

    /// Get the local address the server is bound to (if running)
    pub fn local_addr(&self) -> Option<SocketAddr> {
        self.control.as_ref().and_then(|c| c.local_addr().ok())
    }

    /// Main server loop
    ///
    /// Runs until the task is dropped. Receive errors and undecodable
    /// datagrams are logged and skipped.
    pub async fn serve(&self) -> Result<()> {
        let (Some(control), Some(context)) = (self.control.as_ref(), self.context.as_ref()) else {
            bail!("Server must be bound before serving");
        };

        loop {
            let (bytes, client) = match control.recv_from().await {
                Ok(received) => received,
                Err(e) => {
                    tracing::warn!("Failed to receive on control endpoint: {}", e);
                    continue;
                }
            };

            let packet = match Packet::decode(&bytes) {
                Ok(packet) => packet,
                Err(e) => {
                    tracing::debug!("Dropping malformed packet from {}: {}", client, e);
                    continue;
                }
            };

            let (role, request) = match packet {
                Packet::ReadRequest(request) => (Role::Sender, request),
                Packet::WriteRequest(request) => (Role::Receiver, request),
                Packet::Error { code, message } => {
                    tracing::debug!("Ignoring error {} ({}) from {} on control endpoint", code, message, client);
                    continue;
                }
                other => {
                    tracing::debug!("Unexpected {} from {} on control endpoint", other, client);
                    control
                        .send_error(
                            TftpErrorCode::IllegalOperation,
                            "Expected a read or write request",
                            client,
                        )
                        .await;
                    continue;
                }
            };

            tracing::info!(
                "{} for '{}' in {} mode from {} (options: {:?})",
                if role == Role::Sender { "RRQ" } else { "WRQ" },
                request.filename,
                request.mode,
                client,
                request.options
            );

            if !context.registry.contains(&request.filename) {
                tracing::info!("'{}' is not a registered file, refusing {}", request.filename, client);
                control
                    .send_error(TftpErrorCode::FileNotFound, "resource not found", client)
                    .await;
                continue;
            }

            let Some(admitted) = context.in_flight.admit((client, request.filename.clone(), role)) else {
                tracing::debug!(
                    "Request for '{}' from {} is already in progress, dropping the retransmission",
                    request.filename,
                    client
                );
                continue;
            };

            let context = Arc::clone(context);
            tokio::spawn(async move {
                handle_transfer(context, role, request, client).await;
                drop(admitted);
            });
        }
    }
}

/// Run one accepted request to completion
async fn handle_transfer(context: Arc<ServerContext>, role: Role, request: Request, client: SocketAddr) {
    let Some(path) = context.registry.resolve(&request.filename) else {
        tracing::warn!("'{}' vanished from the registry before serving {}", request.filename, client);
        refuse(&context, client).await;
        return;
    };
    let Some(_guard) = context.locks.acquire(&request.filename).await else {
        tracing::warn!("No lock entry for '{}', refusing {}", request.filename, client);
        refuse(&context, client).await;
        return;
    };

    let mut endpoint = match Endpoint::ephemeral(context.data_ip, client).await {
        Ok(endpoint) => endpoint,
        Err(e) => {
            tracing::warn!("Failed to open data endpoint for {}: {}", client, e);
            return;
        }
    };
    endpoint.set_peer(client);

    let mut session = TransferSession::new(
        role,
        request.filename.clone(),
        endpoint,
        client,
        context.transfer_config.retry_policy(),
    );
    let options = TransferOptions::from_request(&request);

    let result = match role {
        Role::Sender => send_file(&mut session, &request, &path, options).await,
        Role::Receiver => receive_file(&mut session, &request, &path, options).await,
    };

    match session.conclude(result).await {
        Ok(stats) => tracing::info!(
            "Transfer of '{}' with {} complete: {} blocks, {} bytes",
            request.filename,
            client,
            stats.blocks,
            stats.bytes
        ),
        Err(e) => tracing::warn!("Transfer of '{}' with {} failed: {}", request.filename, client, e),
    }
}

/// Tell a client its request cannot be served, from a one-off endpoint
async fn refuse(context: &ServerContext, client: SocketAddr) {
    match Endpoint::ephemeral(context.data_ip, client).await {
        Ok(endpoint) => {
            endpoint
                .send_error(TftpErrorCode::FileNotFound, "resource not found", client)
                .await
        }
        Err(e) => tracing::warn!("Failed to open endpoint to refuse {}: {}", client, e),
    }
}

/// Serve a read request: the client receives `path`
async fn send_file(
    session: &mut TransferSession,
    request: &Request,
    path: &Path,
    options: TransferOptions,
) -> Result<TransferStats, TransferError> {
    check_mode(request)?;

    let file = File::open(path).await.map_err(|e| match e.kind() {
        std::io::ErrorKind::NotFound => TransferError::ResourceNotFound(request.filename.clone()),
        _ => TransferError::Io(e),
    })?;

    negotiation::accept_read(session, options).await?;
    session.run_sender(file).await
}

/// Serve a write request: the client's data replaces `path`
///
/// The file is truncated only once DATA #1 has arrived; a session that
/// never receives data leaves it untouched.
async fn receive_file(
    session: &mut TransferSession,
    request: &Request,
    path: &Path,
    options: TransferOptions,
) -> Result<TransferStats, TransferError> {
    check_mode(request)?;

    let mut file = OpenOptions::new().write(true).create(true).truncate(false).open(path).await?;

    let first = negotiation::accept_write(session, options).await?;
    file.set_len(0).await?;
    session.run_receiver(&mut file, first).await
}

fn check_mode(request: &Request) -> Result<(), TransferError> {
    match request.transfer_mode() {
        Some(mode) if mode.is_supported() => Ok(()),
        _ => Err(TransferError::UnsupportedMode(request.mode.clone())),
    }
}

/// Run a TFTP server with the given bind address and root directory
///
/// This is a convenience function that creates and runs a TFTP server.
pub async fn run_tftp_server(bind_address: String, root_directory: PathBuf, local_bind: Option<IpAddr>) -> Result<()> {
    let mut server = TftpServer::with_config(bind_address, root_directory);
    server.config.transfer_config.local_bind = local_bind;
    server.run().await
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use tempfile::{TempDir, tempdir};
    use tokio::net::UdpSocket;
    use tokio::time::timeout;

    use super::*;
    use crate::protocol::BLOCK_SIZE;

    async fn start_server(files: &[(&str, &[u8])]) -> (SocketAddr, TempDir) {
        let temp_dir = tempdir().unwrap();
        for (name, content) in files {
            std::fs::write(temp_dir.path().join(name), content).unwrap();
        }

        let mut config = TftpServerConfig {
            bind_address: "127.0.0.1:0".to_string(),
            root_directory: temp_dir.path().to_path_buf(),
            ..Default::default()
        };
        config.transfer_config.timeout = Duration::from_millis(300);

        let mut server = TftpServer::new(config);
        let addr = server.bind().await.unwrap();
        tokio::spawn(async move { server.serve().await });
        (addr, temp_dir)
    }

    async fn recv_packet(socket: &UdpSocket) -> (Packet, SocketAddr) {
        let mut buf = [0u8; 1024];
        let (n, src) = timeout(Duration::from_secs(2), socket.recv_from(&mut buf))
            .await
            .unwrap()
            .unwrap();
        (Packet::decode(&buf[..n]).unwrap(), src)
    }

    #[test]
    fn test_tftp_server_config_default() {
        let config = TftpServerConfig::default();
        assert_eq!(config.bind_address, "0.0.0.0:6969");
        assert_eq!(config.root_directory, PathBuf::from("./tftp_root"));
        assert_eq!(config.max_resources, DEFAULT_MAX_RESOURCES);
    }

    #[test]
    fn test_tftp_server_creation() {
        let server = TftpServer::with_defaults();
        assert_eq!(server.config().bind_address, "0.0.0.0:6969");
        assert!(server.local_addr().is_none()); // Not bound yet
        assert!(server.registry().is_none());

        let mut custom_server = TftpServer::with_config("127.0.0.1:9999".to_string(), PathBuf::from("/tmp/tftp"));
        assert_eq!(custom_server.config().bind_address, "127.0.0.1:9999");
        assert_eq!(custom_server.config().root_directory, PathBuf::from("/tmp/tftp"));

        custom_server.config_mut().max_resources = 4;
        assert_eq!(custom_server.config().max_resources, 4);
    }

    #[tokio::test]
    async fn test_serve_before_bind_fails() {
        let server = TftpServer::with_defaults();
        assert!(server.serve().await.is_err());
    }

    #[tokio::test]
    async fn test_bind_scans_registry() {
        let temp_dir = tempdir().unwrap();
        std::fs::write(temp_dir.path().join("boot.img"), b"boot").unwrap();

        let mut server = TftpServer::with_config("127.0.0.1:0".to_string(), temp_dir.path().to_path_buf());
        let addr = server.bind().await.unwrap();

        assert_ne!(addr.port(), 0);
        assert_eq!(server.local_addr(), Some(addr));
        assert!(server.registry().unwrap().contains("boot.img"));
    }

    #[tokio::test]
    async fn test_bind_missing_root_fails() {
        let temp_dir = tempdir().unwrap();
        let mut server = TftpServer::with_config("127.0.0.1:0".to_string(), temp_dir.path().join("nope"));
        assert!(server.bind().await.is_err());
    }

    #[tokio::test]
    async fn test_unknown_file_refused_on_control() {
        let (addr, _dir) = start_server(&[]).await;
        let client = UdpSocket::bind("127.0.0.1:0").await.unwrap();

        let request = Packet::ReadRequest(Request::new("missing.bin")).encode().unwrap();
        client.send_to(&request, addr).await.unwrap();

        let (reply, src) = recv_packet(&client).await;
        assert_eq!(src, addr);
        assert_eq!(reply, Packet::error(TftpErrorCode::FileNotFound, "resource not found"));
    }

    #[tokio::test]
    async fn test_non_request_on_control_is_illegal() {
        let (addr, _dir) = start_server(&[]).await;
        let client = UdpSocket::bind("127.0.0.1:0").await.unwrap();

        client
            .send_to(&Packet::Acknowledge { block: 1 }.encode().unwrap(), addr)
            .await
            .unwrap();

        let (reply, _) = recv_packet(&client).await;
        assert!(matches!(reply, Packet::Error { code: 4, .. }));
    }

    #[tokio::test]
    async fn test_malformed_packet_does_not_stop_server() {
        let (addr, _dir) = start_server(&[("hello.txt", &b"hello"[..])]).await;
        let client = UdpSocket::bind("127.0.0.1:0").await.unwrap();

        client.send_to(&[0xff], addr).await.unwrap();
        client.send_to(&[0, 1, b'x'], addr).await.unwrap();

        let request = Packet::ReadRequest(Request::new("hello.txt")).encode().unwrap();
        client.send_to(&request, addr).await.unwrap();

        let (reply, src) = recv_packet(&client).await;
        assert_ne!(src, addr, "data must come from a fresh endpoint");
        assert_eq!(
            reply,
            Packet::Data {
                block: 1,
                payload: b"hello".to_vec()
            }
        );
        client
            .send_to(&Packet::Acknowledge { block: 1 }.encode().unwrap(), src)
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn test_netascii_rejected_from_data_endpoint() {
        let (addr, _dir) = start_server(&[("hello.txt", &b"hello"[..])]).await;
        let client = UdpSocket::bind("127.0.0.1:0").await.unwrap();

        let mut request = Request::new("hello.txt");
        request.mode = "netascii".to_string();
        client
            .send_to(&Packet::ReadRequest(request).encode().unwrap(), addr)
            .await
            .unwrap();

        let (reply, src) = recv_packet(&client).await;
        assert_ne!(src, addr);
        assert_eq!(
            reply,
            Packet::error(TftpErrorCode::IllegalOperation, "Transfer mode 'netascii' not supported")
        );
    }

    #[tokio::test]
    async fn test_write_replaces_file() {
        let (addr, dir) = start_server(&[("upload.bin", &b"old contents that are longer"[..])]).await;
        let client = UdpSocket::bind("127.0.0.1:0").await.unwrap();

        client
            .send_to(&Packet::WriteRequest(Request::new("upload.bin")).encode().unwrap(), addr)
            .await
            .unwrap();
        let (ack, src) = recv_packet(&client).await;
        assert_eq!(ack, Packet::Acknowledge { block: 0 });

        let data = Packet::Data {
            block: 1,
            payload: b"new".to_vec(),
        };
        client.send_to(&data.encode().unwrap(), src).await.unwrap();
        let (ack, _) = recv_packet(&client).await;
        assert_eq!(ack, Packet::Acknowledge { block: 1 });

        // The final ACK is sent after the file is flushed
        assert_eq!(std::fs::read(dir.path().join("upload.bin")).unwrap(), b"new");
    }

    #[tokio::test]
    async fn test_write_refused_before_data_leaves_file_intact() {
        let (addr, dir) = start_server(&[("upload.bin", &b"keep me"[..])]).await;
        let client = UdpSocket::bind("127.0.0.1:0").await.unwrap();

        client
            .send_to(&Packet::WriteRequest(Request::new("upload.bin")).encode().unwrap(), addr)
            .await
            .unwrap();
        let (ack, src) = recv_packet(&client).await;
        assert_eq!(ack, Packet::Acknowledge { block: 0 });

        client
            .send_to(&Packet::error(TftpErrorCode::NotDefined, "changed my mind").encode().unwrap(), src)
            .await
            .unwrap();
        tokio::time::sleep(Duration::from_millis(100)).await;

        assert_eq!(std::fs::read(dir.path().join("upload.bin")).unwrap(), b"keep me");
    }

    #[tokio::test]
    async fn test_deleted_source_reported_to_client() {
        let (addr, dir) = start_server(&[("gone.bin", &b"soon gone"[..])]).await;
        std::fs::remove_file(dir.path().join("gone.bin")).unwrap();
        let client = UdpSocket::bind("127.0.0.1:0").await.unwrap();

        client
            .send_to(&Packet::ReadRequest(Request::new("gone.bin")).encode().unwrap(), addr)
            .await
            .unwrap();

        let (reply, src) = recv_packet(&client).await;
        assert_ne!(src, addr);
        assert!(matches!(reply, Packet::Error { code: 1, .. }));
    }

    #[tokio::test]
    async fn test_unwritable_destination_reported_to_client() {
        let (addr, dir) = start_server(&[("target.bin", &b"x"[..])]).await;
        let target = dir.path().join("target.bin");
        std::fs::remove_file(&target).unwrap();
        std::fs::create_dir(&target).unwrap();
        let client = UdpSocket::bind("127.0.0.1:0").await.unwrap();

        client
            .send_to(&Packet::WriteRequest(Request::new("target.bin")).encode().unwrap(), addr)
            .await
            .unwrap();

        let (reply, src) = recv_packet(&client).await;
        assert_ne!(src, addr);
        assert!(matches!(reply, Packet::Error { code: 0, .. }));
    }

    #[test]
    fn test_in_flight_admits_each_request_once() {
        let in_flight = Arc::new(InFlight::default());
        let client: SocketAddr = "127.0.0.1:4000".parse().unwrap();

        let first = in_flight.admit((client, "a.bin".to_string(), Role::Receiver));
        assert!(first.is_some());
        assert!(in_flight.admit((client, "a.bin".to_string(), Role::Receiver)).is_none());

        // A different direction or client is a different request
        let read = in_flight.admit((client, "a.bin".to_string(), Role::Sender));
        let other = in_flight.admit(("127.0.0.1:4001".parse().unwrap(), "a.bin".to_string(), Role::Receiver));
        assert!(read.is_some() && other.is_some());
        assert_eq!(in_flight.len(), 3);

        drop(first);
        assert_eq!(in_flight.len(), 2);
        assert!(in_flight.admit((client, "a.bin".to_string(), Role::Receiver)).is_some());
    }

    fn bare_context(dir: &Path, locked: &[&str]) -> Arc<ServerContext> {
        let registry = FileRegistry::from_names(dir, ["a.bin"]).unwrap();
        Arc::new(ServerContext {
            registry,
            locks: ResourceLocks::new(locked.iter().copied()),
            in_flight: Arc::default(),
            transfer_config: TransferConfig {
                timeout: Duration::from_millis(200),
                ..Default::default()
            },
            data_ip: Some(IpAddr::from([127, 0, 0, 1])),
        })
    }

    #[tokio::test]
    async fn test_transfer_without_lock_entry_is_refused() {
        let dir = tempdir().unwrap();
        let context = bare_context(dir.path(), &[]);
        let client = UdpSocket::bind("127.0.0.1:0").await.unwrap();
        let client_addr = client.local_addr().unwrap();

        handle_transfer(context, Role::Sender, Request::new("a.bin"), client_addr).await;

        let (reply, _) = recv_packet(&client).await;
        assert_eq!(reply, Packet::error(TftpErrorCode::FileNotFound, "resource not found"));
    }

    #[tokio::test]
    async fn test_transfer_for_unregistered_name_is_refused() {
        let dir = tempdir().unwrap();
        let context = bare_context(dir.path(), &["b.bin"]);
        let client = UdpSocket::bind("127.0.0.1:0").await.unwrap();
        let client_addr = client.local_addr().unwrap();

        handle_transfer(context, Role::Receiver, Request::new("b.bin"), client_addr).await;

        let (reply, _) = recv_packet(&client).await;
        assert_eq!(reply, Packet::error(TftpErrorCode::FileNotFound, "resource not found"));
        assert!(!dir.path().join("b.bin").exists());
    }

    #[tokio::test]
    async fn test_full_block_file_ends_with_empty_data() {
        let content = vec![9u8; BLOCK_SIZE];
        let (addr, _dir) = start_server(&[("block.bin", content.as_slice())]).await;
        let client = UdpSocket::bind("127.0.0.1:0").await.unwrap();

        client
            .send_to(&Packet::ReadRequest(Request::new("block.bin")).encode().unwrap(), addr)
            .await
            .unwrap();

        let mut sizes = Vec::new();
        loop {
            let (packet, src) = recv_packet(&client).await;
            let Packet::Data { block, payload } = packet else {
                panic!("expected DATA, got {packet}");
            };
            sizes.push(payload.len());
            client
                .send_to(&Packet::Acknowledge { block }.encode().unwrap(), src)
                .await
                .unwrap();
            if payload.len() < BLOCK_SIZE {
                break;
            }
        }
        assert_eq!(sizes, [BLOCK_SIZE, 0]);
    }
}
