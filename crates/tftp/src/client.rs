//! TFTP client
//!
//! Each operation sends its request from a fresh ephemeral endpoint to the
//! server's control address. The first reply comes from the server's data
//! endpoint, and the session talks only to that address from then on.

use std::net::SocketAddr;
use std::path::Path;

use anyhow::{Context, Result};
use tokio::fs::File;
use tokio::io::{AsyncRead, AsyncWrite};

use crate::endpoint::Endpoint;
use crate::error::TransferError;
use crate::negotiation::{self, TransferOptions};
use crate::protocol::Request;
use crate::transfer::{Role, TransferConfig, TransferSession, TransferStats};

#[derive(Debug, Clone)]
pub struct TftpClient {
    server: SocketAddr,
    config: TransferConfig,
    bigfile: bool,
}

impl TftpClient {
    pub fn new(server: SocketAddr) -> Self {
        Self::with_config(server, TransferConfig::default())
    }

    pub fn with_config(server: SocketAddr, config: TransferConfig) -> Self {
        Self {
            server,
            config,
            bigfile: false,
        }
    }

    /// Ask the server for block-number wraparound on every transfer
    pub fn bigfile(mut self, enabled: bool) -> Self {
        self.bigfile = enabled;
        self
    }

    pub fn server(&self) -> SocketAddr {
        self.server
    }

    /// Download `remote` into a local file, leaving it untouched if the transfer fails
    pub async fn get(&self, remote: &str, local_path: impl AsRef<Path>) -> Result<TransferStats> {
        let local_path = local_path.as_ref();
        let parent = local_path
            .parent()
            .filter(|p| !p.as_os_str().is_empty())
            .unwrap_or_else(|| Path::new("."));

        // Download next to the destination; it is replaced only on success
        let partial = tempfile::Builder::new()
            .prefix(".lockstep-")
            .suffix(".part")
            .tempfile_in(parent)
            .with_context(|| format!("Failed to create a temporary file in {}", parent.display()))?;
        let file = File::from_std(partial.reopen()?);

        let stats = self
            .get_to(remote, file)
            .await
            .with_context(|| format!("Failed to download '{}' from {}", remote, self.server))?;

        partial
            .persist(local_path)
            .with_context(|| format!("Failed to move download into {}", local_path.display()))?;
        Ok(stats)
    }

    /// Upload a local file as `remote`
    pub async fn put(&self, local_path: impl AsRef<Path>, remote: &str) -> Result<TransferStats> {
        let local_path = local_path.as_ref();
        let file = File::open(local_path)
            .await
            .with_context(|| format!("Failed to open {}", local_path.display()))?;

        self.put_from(remote, file)
            .await
            .with_context(|| format!("Failed to upload '{}' to {}", remote, self.server))
    }

    /// Download `remote` into any writer
    pub async fn get_to<W>(&self, remote: &str, writer: W) -> Result<TransferStats, TransferError>
    where
        W: AsyncWrite + Unpin,
    {
        let mut session = self.session(Role::Receiver, remote).await?;
        let request = self.request(remote);

        let result = async {
            let first = negotiation::request_read(&mut session, request).await?;
            session.run_receiver(writer, first).await
        }
        .await;

        let stats = session.conclude(result).await?;
        tracing::info!(
            "Received '{}' from {}: {} bytes in {} blocks",
            remote,
            self.server,
            stats.bytes,
            stats.blocks
        );
        Ok(stats)
    }

    /// Upload everything `reader` yields as `remote`
    pub async fn put_from<R>(&self, remote: &str, reader: R) -> Result<TransferStats, TransferError>
    where
        R: AsyncRead + Unpin,
    {
        let mut session = self.session(Role::Sender, remote).await?;
        let request = self.request(remote);

        let result = async {
            negotiation::request_write(&mut session, request).await?;
            session.run_sender(reader).await
        }
        .await;

        let stats = session.conclude(result).await?;
        tracing::info!(
            "Sent '{}' to {}: {} bytes in {} blocks",
            remote,
            self.server,
            stats.bytes,
            stats.blocks
        );
        Ok(stats)
    }

    async fn session(&self, role: Role, remote: &str) -> Result<TransferSession, TransferError> {
        let endpoint = Endpoint::ephemeral(self.config.local_bind, self.server).await?;
        Ok(TransferSession::new(
            role,
            remote,
            endpoint,
            self.server,
            self.config.retry_policy(),
        ))
    }

    fn request(&self, remote: &str) -> Request {
        let mut request = Request::new(remote);
        TransferOptions { bigfile: self.bigfile }.apply(&mut request);
        request
    }
}

#[cfg(test)]
mod tests {
    use std::net::{IpAddr, Ipv4Addr};
    use std::time::Duration;

    use tempfile::tempdir;
    use tokio::net::UdpSocket;
    use tokio::time::timeout;

    use super::*;
    use crate::protocol::{Packet, TftpErrorCode};

    fn quick_config() -> TransferConfig {
        TransferConfig {
            timeout: Duration::from_millis(200),
            max_attempts: 2,
            local_bind: Some(IpAddr::V4(Ipv4Addr::LOCALHOST)),
        }
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
    fn test_request_carries_bigfile_only_when_enabled() {
        let client = TftpClient::new("127.0.0.1:69".parse().unwrap());
        assert!(client.request("a").options.is_empty());

        let client = client.bigfile(true);
        assert_eq!(client.request("a").option("bigfile"), Some("1"));
        assert_eq!(client.server(), "127.0.0.1:69".parse().unwrap());
    }

    #[tokio::test]
    async fn test_get_to_follows_data_endpoint() {
        let control = UdpSocket::bind("127.0.0.1:0").await.unwrap();
        let client = TftpClient::with_config(control.local_addr().unwrap(), quick_config());

        let server = tokio::spawn(async move {
            let (request, peer) = recv_packet(&control).await;
            assert_eq!(request, Packet::ReadRequest(Request::new("motd")));

            let data = UdpSocket::bind("127.0.0.1:0").await.unwrap();
            let block = Packet::Data {
                block: 1,
                payload: b"welcome".to_vec(),
            };
            data.send_to(&block.encode().unwrap(), peer).await.unwrap();
            let (ack, _) = recv_packet(&data).await;
            assert_eq!(ack, Packet::Acknowledge { block: 1 });
        });

        let mut out = Vec::new();
        let stats = client.get_to("motd", &mut out).await.unwrap();
        server.await.unwrap();

        assert_eq!(out, b"welcome");
        assert_eq!(stats.bytes, 7);
    }

    #[tokio::test]
    async fn test_failed_get_keeps_existing_file() {
        let control = UdpSocket::bind("127.0.0.1:0").await.unwrap();
        let client = TftpClient::with_config(control.local_addr().unwrap(), quick_config());

        let server = tokio::spawn(async move {
            let (_, peer) = recv_packet(&control).await;
            let refusal = Packet::error(TftpErrorCode::FileNotFound, "resource not found");
            control.send_to(&refusal.encode().unwrap(), peer).await.unwrap();
        });

        let dir = tempdir().unwrap();
        let local = dir.path().join("kernel");
        std::fs::write(&local, b"previous build").unwrap();

        let err = client.get("kernel", &local).await.unwrap_err();
        server.await.unwrap();

        assert!(matches!(
            err.downcast_ref::<TransferError>(),
            Some(TransferError::PeerError { code: 1, .. })
        ));
        assert_eq!(std::fs::read(&local).unwrap(), b"previous build");
        // Only the untouched destination remains
        assert_eq!(std::fs::read_dir(dir.path()).unwrap().count(), 1);
    }

    #[tokio::test]
    async fn test_get_replaces_file_on_success() {
        let control = UdpSocket::bind("127.0.0.1:0").await.unwrap();
        let client = TftpClient::with_config(control.local_addr().unwrap(), quick_config());

        let server = tokio::spawn(async move {
            let (_, peer) = recv_packet(&control).await;
            let data = Packet::Data {
                block: 1,
                payload: b"fresh".to_vec(),
            };
            control.send_to(&data.encode().unwrap(), peer).await.unwrap();
            recv_packet(&control).await.0
        });

        let dir = tempdir().unwrap();
        let local = dir.path().join("kernel");
        std::fs::write(&local, b"previous build").unwrap();

        let stats = client.get("kernel", &local).await.unwrap();
        assert_eq!(server.await.unwrap(), Packet::Acknowledge { block: 1 });

        assert_eq!(stats.bytes, 5);
        assert_eq!(std::fs::read(&local).unwrap(), b"fresh");
        assert_eq!(std::fs::read_dir(dir.path()).unwrap().count(), 1);
    }

    #[tokio::test]
    async fn test_put_from_times_out_without_server() {
        let silent = UdpSocket::bind("127.0.0.1:0").await.unwrap();
        let client = TftpClient::with_config(silent.local_addr().unwrap(), quick_config());

        let err = client.put_from("file", &b"data"[..]).await.unwrap_err();
        assert!(matches!(err, TransferError::TimeoutExceeded { attempts: 2, .. }));
    }
}
