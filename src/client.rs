// The sending side of a transfer.
//
// A transfer goes through two phases:
//
// 1. Negotiation. The client sends a WRQ carrying its options to the server's well-known port and
//    waits for a single reply. The reply comes from a fresh port on the server, and that address
//    becomes the peer for the rest of the transfer. An ACK for block 0 accepts the request
//    without options, an OACK accepts it and echoes the options the server agreed to. Anything
//    else ends the transfer.
// 2. Transfer. The blocks of the file go out one DATA packet at a time, each waiting for its ACK.
//    When the server ignored the options, the file is split again at the default block size the
//    server is now expecting.

use crate::blocks::{BlockError, FileInfo};
use crate::config::ClientConfig;
use crate::options::{OptionCode, DEFAULT_BLOCK_SIZE};
use crate::processor::{PacketProcessor, SendProcessor, TransferError, TransferReport};
use crate::tftp::{FileMessage, OpCode, Packet, PacketError, SocketError, TftpOption, TftpSocket, TransferMode};
use std::io;
use std::net::{Ipv4Addr, Ipv6Addr, SocketAddr};
use std::path::{Path, PathBuf};
use std::time::Duration;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum NegotiationError {
    #[error("server rejected the request with error {code}: '{message}'")]
    Rejected { code: u16, message: String },

    #[error("protocol violation: {0}")]
    ProtocolViolation(String),

    #[error("timed out waiting for the server to answer the request")]
    TimedOut,

    #[error("cannot build request: {0}")]
    Packet(#[from] PacketError),

    #[error(transparent)]
    Socket(SocketError),
}

#[derive(Debug, Error)]
pub enum ClientError {
    #[error("cannot resolve host '{0}'")]
    Resolve(String),

    #[error("'{0}' does not name a file")]
    NoFileName(PathBuf),

    #[error("the request has not been accepted by a server")]
    NotConnected,

    #[error("I/O error: {0}")]
    IO(#[from] io::Error),

    #[error(transparent)]
    Block(#[from] BlockError),

    #[error(transparent)]
    Socket(#[from] SocketError),

    #[error(transparent)]
    Negotiation(#[from] NegotiationError),

    #[error(transparent)]
    Transfer(#[from] TransferError),
}

/// Where a request stands in the negotiation with the server.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NegotiationState {
    Idle,
    RequestSent,
    /// The server accepted the request, with or without options.
    Negotiated { with_options: bool },
    Rejected,
    TimedOut,
}

/// A write request for a single file.
pub struct SendRequest {
    sock: TftpSocket,

    /// Where the request goes.
    address: SocketAddr,

    /// Where the transfer goes, once a server accepted the request.
    outgoing: Option<SocketAddr>,

    filename: String,
    file_info: FileInfo,
    mode: TransferMode,
    options: Vec<TftpOption>,
    timeout: Duration,
    retry_count: u32,
    state: NegotiationState,
}

impl SendRequest {
    pub fn new(sock: TftpSocket, address: SocketAddr, file_info: FileInfo, config: &ClientConfig) -> Result<SendRequest, ClientError> {
        let filename = file_info
            .path()
            .file_name()
            .and_then(|name| name.to_str())
            .ok_or_else(|| ClientError::NoFileName(file_info.path().to_path_buf()))?
            .to_string();

        Ok(SendRequest {
            sock,
            address,
            outgoing: None,
            filename,
            file_info,
            mode: config.mode,
            options: Vec::new(),
            timeout: config.timeout,
            retry_count: config.retry_count,
            state: NegotiationState::Idle,
        })
    }

    pub fn add_option(&mut self, option: TftpOption) {
        self.options.push(option);
    }

    /// Adds the options describing the file and the transfer settings.
    pub fn add_default_options(&mut self) {
        let info = &self.file_info;
        let defaults = [
            (OptionCode::BlockCount, info.block_count().to_string()),
            (OptionCode::BlockSize, info.block_size().to_string()),
            (OptionCode::FileSize, info.size().to_string()),
            (OptionCode::FileMd5, info.md5().to_string()),
            (OptionCode::Retry, self.retry_count.to_string()),
            (OptionCode::Timeout, self.timeout.as_secs().max(1).to_string()),
        ];
        self.options
            .extend(defaults.iter().map(|(code, value)| TftpOption::from_code(*code, value)));
    }

    /// The options of the request, or after negotiation the ones the server agreed to.
    pub fn options(&self) -> &[TftpOption] {
        &self.options
    }

    pub fn state(&self) -> NegotiationState {
        self.state
    }

    /// The server's transfer address, known once the request was accepted.
    pub fn peer(&self) -> Option<SocketAddr> {
        self.outgoing
    }

    pub fn file_info(&self) -> &FileInfo {
        &self.file_info
    }

    /// Sends the request and waits for the server's single reply.
    pub async fn connect(&mut self) -> Result<(), NegotiationError> {
        let mut request = FileMessage::new(OpCode::Wrq, &self.filename, self.mode)?;
        request.add_options(self.options.iter().cloned());

        log::info!("Sending {} to {}", Packet::from(request.clone()), self.address);
        self.sock
            .send(&request.into(), self.address)
            .await
            .map_err(NegotiationError::Socket)?;
        self.state = NegotiationState::RequestSent;
        self.outgoing = None;

        let (packet, src) = match self.sock.recv_with_timeout(self.timeout).await {
            Ok(received) => received,
            Err(SocketError::Timeout(_)) => {
                log::warn!("No answer from {} within {:?}", self.address, self.timeout);
                self.state = NegotiationState::TimedOut;
                return Err(NegotiationError::TimedOut);
            }
            Err(e) => {
                self.state = NegotiationState::Rejected;
                return Err(NegotiationError::Socket(e));
            }
        };

        match packet {
            Some(Packet::Ack(m)) if m.id() == 0 => {
                if m.opcode() == OpCode::Oack {
                    self.options = m.options()?.to_vec();
                    self.state = NegotiationState::Negotiated { with_options: true };
                } else {
                    self.options.clear();
                    self.state = NegotiationState::Negotiated { with_options: false };
                }
                self.outgoing = Some(src);
                log::info!("Request accepted by {} with {} option(s)", src, self.options.len());
                Ok(())
            }
            Some(Packet::Error(m)) => {
                log::warn!("Request rejected by {}: {}", src, m.message());
                self.state = NegotiationState::Rejected;
                Err(NegotiationError::Rejected {
                    code: m.code(),
                    message: m.message().original().to_string(),
                })
            }
            other => {
                self.state = NegotiationState::Rejected;
                let description = match other {
                    Some(p) => format!("unexpected answer to the request: {p}"),
                    None => "unrecognized answer to the request".to_string(),
                };
                Err(NegotiationError::ProtocolViolation(description))
            }
        }
    }

    /// Sends the file to the server that accepted the request.
    pub async fn send_file(&mut self) -> Result<TransferReport, ClientError> {
        let (NegotiationState::Negotiated { with_options }, Some(peer)) = (self.state, self.outgoing) else {
            return Err(ClientError::NotConnected);
        };

        if !with_options && self.file_info.block_size() != DEFAULT_BLOCK_SIZE {
            log::info!("Server ignored the options, splitting the file into {} byte blocks", DEFAULT_BLOCK_SIZE);
            let path = self.file_info.path().to_path_buf();
            self.file_info = FileInfo::compute_with_block_size(&path, DEFAULT_BLOCK_SIZE).await?;
        }

        let mut processor = PacketProcessor::Send(SendProcessor::new(self.file_info.blocks().to_vec()));
        if let Err(e) = processor.run(&self.sock, peer, self.timeout).await {
            self.outgoing = None;
            return Err(e.into());
        }

        let report = processor.finish().await?;
        log::info!("Sent {} block(s), {} bytes of {:?} to {}", report.blocks, report.bytes, self.file_info.path(), peer);
        Ok(report)
    }
}

/// Reads every block back and checks it against its digest.
pub async fn validate_blocks(file_info: &FileInfo) -> Result<(), BlockError> {
    for block in file_info.blocks() {
        block.read().await?;
    }
    Ok(())
}

/// Resolves `host`, preferring an IPv4 address.
async fn resolve(host: &str, port: u16) -> Result<SocketAddr, ClientError> {
    let addrs: Vec<SocketAddr> = tokio::net::lookup_host((host, port)).await?.collect();
    addrs
        .iter()
        .find(|addr| addr.is_ipv4())
        .or_else(|| addrs.first())
        .copied()
        .ok_or_else(|| ClientError::Resolve(host.to_string()))
}

/// Sends the file at `path` to the server named by `config`.
pub async fn send_file(config: &ClientConfig, path: &Path) -> Result<TransferReport, ClientError> {
    let file_info = FileInfo::compute(path).await?;
    log::info!(
        "{:?}: {} bytes in {} block(s) of {} bytes, MD5 {}",
        path,
        file_info.size(),
        file_info.block_count(),
        file_info.block_size(),
        file_info.md5()
    );
    validate_blocks(&file_info).await?;

    let address = resolve(&config.host, config.port).await?;
    let local: SocketAddr = if address.is_ipv4() {
        (Ipv4Addr::UNSPECIFIED, 0).into()
    } else {
        (Ipv6Addr::UNSPECIFIED, 0).into()
    };
    let sock = TftpSocket::bind(local)?;

    let mut request = SendRequest::new(sock, address, file_info, config)?;
    request.add_default_options();
    request.connect().await?;
    request.send_file().await
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::tftp::{AckMessage, DataMessage, ErrorCode, ErrorMessage};
    use tempdir::TempDir;
    use tokio::task::JoinHandle;
    use tokio_test::assert_err;

    async fn request_for(dir: &TempDir, contents: &[u8], timeout: Duration) -> (SendRequest, TftpSocket) {
        let path = dir.path().join("upload.bin");
        tokio::fs::write(&path, contents).await.unwrap();
        let info = FileInfo::compute(&path).await.unwrap();

        let server = TftpSocket::bind("127.0.0.1:0".parse().unwrap()).unwrap();
        let sock = TftpSocket::bind("127.0.0.1:0".parse().unwrap()).unwrap();
        let config = ClientConfig::new().with_timeout(timeout);
        let request = SendRequest::new(sock, server.local_addr().unwrap(), info, &config).unwrap();
        (request, server)
    }

    /// Receives the request and answers it from a different port, the way a server does.
    fn answer(server: TftpSocket, reply: Option<Packet>) -> JoinHandle<(FileMessage, SocketAddr)> {
        tokio::spawn(async move {
            let (packet, src) = server.recv_with_timeout(Duration::from_secs(5)).await.unwrap();
            let Some(Packet::File(request)) = packet else {
                panic!("expected a request, got {:?}", packet);
            };

            let responder = TftpSocket::bind("127.0.0.1:0".parse().unwrap()).unwrap();
            if let Some(reply) = reply {
                responder.send(&reply, src).await.unwrap();
            }
            (request, responder.local_addr().unwrap())
        })
    }

    #[tokio::test]
    async fn test_default_options_order() {
        let dir = TempDir::new("client").unwrap();
        let (mut request, _server) = request_for(&dir, b"abcdefghijklmnopqrstuvwxyz", Duration::from_secs(10)).await;
        request.add_default_options();

        let names: Vec<&str> = request.options().iter().map(|o| o.name().value()).collect();
        assert_eq!(names, vec!["blkcnt", "blksize", "tsize", "tmd5", "retry", "timeout"]);

        let values: Vec<&str> = request.options().iter().map(|o| o.value().value()).collect();
        assert_eq!(values[0], "14");
        assert_eq!(values[1], "2");
        assert_eq!(values[2], "26");
        assert_eq!(values[3], request.file_info().md5());
        assert_eq!(values[4], "6");
        assert_eq!(values[5], "10");
    }

    #[tokio::test]
    async fn test_connect_with_oack() {
        let dir = TempDir::new("client").unwrap();
        let (mut request, server) = request_for(&dir, b"hello", Duration::from_secs(5)).await;
        request.add_default_options();

        let mut oack = AckMessage::oack();
        oack.add_option(TftpOption::new("blksize", "1")).unwrap();
        oack.add_option(TftpOption::new("tsize", "5")).unwrap();
        let server = answer(server, Some(oack.into()));

        request.connect().await.unwrap();
        let (sent, responder) = server.await.unwrap();

        assert_eq!(sent.opcode(), OpCode::Wrq);
        assert_eq!(sent.filename().original(), "upload.bin");
        assert_eq!(sent.transfer_mode(), Ok(TransferMode::Octet));
        assert_eq!(sent.options().len(), 6);

        assert_eq!(request.state(), NegotiationState::Negotiated { with_options: true });
        assert_eq!(request.options().len(), 2);
        assert_eq!(request.peer(), Some(responder));
    }

    #[tokio::test]
    async fn test_connect_with_plain_ack() {
        let dir = TempDir::new("client").unwrap();
        let (mut request, server) = request_for(&dir, b"hello", Duration::from_secs(5)).await;
        request.add_default_options();
        let server = answer(server, Some(AckMessage::ack(0).into()));

        request.connect().await.unwrap();
        let (_, responder) = server.await.unwrap();

        assert_eq!(request.state(), NegotiationState::Negotiated { with_options: false });
        assert!(request.options().is_empty());
        assert_eq!(request.peer(), Some(responder));
    }

    #[tokio::test]
    async fn test_connect_rejected() {
        let dir = TempDir::new("client").unwrap();
        let (mut request, server) = request_for(&dir, b"hello", Duration::from_secs(5)).await;
        let reply = ErrorMessage::new(ErrorCode::FileAlreadyExists, "The file already exists on this server.");
        let server = answer(server, Some(reply.into()));

        let result = request.connect().await;
        server.await.unwrap();

        match result {
            Err(NegotiationError::Rejected { code, message }) => {
                assert_eq!(code, 6);
                assert_eq!(message, "The file already exists on this server.");
            }
            other => panic!("unexpected result {:?}", other),
        }
        assert_eq!(request.state(), NegotiationState::Rejected);
        assert_eq!(request.peer(), None);
    }

    #[tokio::test]
    async fn test_connect_protocol_violations() {
        let dir = TempDir::new("client").unwrap();

        let replies: [Packet; 2] = [AckMessage::ack(5).into(), DataMessage::new(1, b"x".to_vec()).into()];
        for reply in replies {
            let (mut request, server) = request_for(&dir, b"hello", Duration::from_secs(5)).await;
            let server = answer(server, Some(reply));

            let result = request.connect().await;
            server.await.unwrap();
            assert!(matches!(result, Err(NegotiationError::ProtocolViolation(_))));
            assert_eq!(request.state(), NegotiationState::Rejected);
            assert_eq!(request.peer(), None);
        }
    }

    #[tokio::test]
    async fn test_connect_times_out() {
        let dir = TempDir::new("client").unwrap();
        let (mut request, server) = request_for(&dir, b"hello", Duration::from_millis(200)).await;
        let server = answer(server, None);

        let result = request.connect().await;
        server.await.unwrap();
        assert!(matches!(result, Err(NegotiationError::TimedOut)));
        assert_eq!(request.state(), NegotiationState::TimedOut);
        assert_eq!(request.peer(), None);
    }

    #[tokio::test]
    async fn test_send_file_requires_connection() {
        let dir = TempDir::new("client").unwrap();
        let (mut request, _server) = request_for(&dir, b"hello", Duration::from_secs(1)).await;
        assert!(matches!(assert_err!(request.send_file().await), ClientError::NotConnected));
    }

    #[tokio::test]
    async fn test_validate_blocks_detects_changed_file() {
        let dir = TempDir::new("client").unwrap();
        let path = dir.path().join("data.bin");
        tokio::fs::write(&path, vec![1_u8; 100]).await.unwrap();
        let info = FileInfo::compute(&path).await.unwrap();
        validate_blocks(&info).await.unwrap();

        tokio::fs::write(&path, vec![2_u8; 100]).await.unwrap();
        assert!(matches!(validate_blocks(&info).await, Err(BlockError::DigestMismatch { id: 1, .. })));
    }
}
