// This module contains the server side: the request loop and the per-request connection handler.
//
// The server waits on its well-known port for a write request. A request is served in roughly the
// following stages:
//
// 1. A socket is bound on a random port. Every packet of the transfer, error packets included,
//    goes out from that port, so the client learns the transfer address from the first answer.
// 2. The output file is created next to the other received files. A file that already exists is
//    never overwritten; the request is refused instead.
// 3. The request's options are interpreted and echoed back in an OACK (or a plain ACK when the
//    request carried none), and the handler enters the receive loop of the packet processor.
// 4. Once the last block is acknowledged, the received file is checked against the MD5 the
//    client announced, if any.
//
// One server run serves one request. Read requests are refused and the server keeps waiting;
// any other packet on the request port shuts the server down.

use crate::config::{ServerConfig, RECEIVED_SUFFIX};
use crate::options::TransferOptions;
use crate::processor::{send_error_packet, PacketProcessor, ReceiveProcessor, TransferError, TransferReport};
use crate::tftp::{self, AckMessage, ErrorCode, FileMessage, OpCode, Packet, SocketError, TftpSocket, TransferMode};
use rand::Rng;
use std::net::{IpAddr, SocketAddr};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::fs::OpenOptions;
use tokio::io;

/// How often the request loop looks at the shutdown flag.
const POLL_INTERVAL: Duration = Duration::from_millis(500);

const BIND_ATTEMPTS: usize = 64;

/// DATA header plus some slack.
const DATA_OVERHEAD: usize = 8;

#[derive(Debug, Error)]
pub enum ServerConnectionError {
    #[error("Invalid request: {0}")]
    BadRequest(String),

    #[error("The file already exists: {0:?}")]
    FileExists(PathBuf),

    #[error("File IO error: {0}")]
    File(#[from] io::Error),

    #[error("Socket error: {0}")]
    Socket(#[from] SocketError),

    #[error("Transfer failed: {0}")]
    Transfer(#[from] TransferError),
}

/// Attempts to bind to a random UDP port until one succeeds or the attempts run out.
fn bind_random_socket(ip: IpAddr) -> Result<TftpSocket, SocketError> {
    let mut rng = rand::thread_rng();
    let mut last_error = None;
    for _ in 0..BIND_ATTEMPTS {
        match TftpSocket::bind((ip, rng.gen_range(1024..65535)).into()) {
            Ok(sock) => return Ok(sock),
            Err(e) => {
                log::warn!("Couldn't bind socket: {e}");
                last_error = Some(e);
            }
        }
    }
    Err(last_error.unwrap_or_else(|| io::Error::new(io::ErrorKind::AddrInUse, "no free port found").into()))
}

/// The path a received file is written to: `<stem>_received<ext>` inside `dir`.
///
/// Only the last component of the requested name is used.
pub fn output_path(dir: &Path, requested: &str) -> Option<PathBuf> {
    let name = Path::new(requested);
    let stem = name.file_stem()?.to_string_lossy();
    let file_name = match name.extension() {
        Some(ext) => format!("{}{}.{}", stem, RECEIVED_SUFFIX, ext.to_string_lossy()),
        None => format!("{}{}", stem, RECEIVED_SUFFIX),
    };
    Some(dir.join(file_name))
}

/// Creates the empty output file. An existing file is left alone.
async fn prepare_file(path: &Path) -> Result<(), io::Error> {
    OpenOptions::new().write(true).create_new(true).open(path).await?;
    Ok(())
}

/// An object responsible for handling a request.
pub struct ServerRequestHandler {
    /// The TFTP socket used to send and receive packets of this transfer.
    sock: tftp::TftpSocket,

    /// The address to send packets to.
    dst: SocketAddr,

    /// The packet processor.
    processor: PacketProcessor,

    path: PathBuf,
    timeout: Duration,
}

impl ServerRequestHandler {
    pub async fn new(
        config: &ServerConfig,
        request: &FileMessage,
        src: SocketAddr,
    ) -> Result<ServerRequestHandler, ServerConnectionError> {
        let mut sock = bind_random_socket(config.bind)?;
        log::info!("Serving {} from {}", src, sock.local_addr()?);

        if request.opcode() != OpCode::Wrq {
            send_error_packet(&sock, src, ErrorCode::IllegalOperation, "Only write requests are served").await;
            return Err(ServerConnectionError::BadRequest(format!("{} is not a write request", request.opcode())));
        }

        match request.transfer_mode() {
            Ok(TransferMode::Mail) => {
                send_error_packet(&sock, src, ErrorCode::NotDefined, "Support for mail mode is unimplemented").await;
                return Err(ServerConnectionError::BadRequest(
                    "Peer requested mail mode, which is unsupported".to_string(),
                ));
            }
            Ok(_) => {}
            Err(e) => {
                send_error_packet(&sock, src, ErrorCode::IllegalOperation, &e.to_string()).await;
                return Err(ServerConnectionError::BadRequest(e.to_string()));
            }
        }

        let Some(path) = output_path(&config.output_dir, request.filename().original()) else {
            send_error_packet(&sock, src, ErrorCode::IllegalOperation, "Invalid file name").await;
            return Err(ServerConnectionError::BadRequest(format!(
                "cannot write a file named '{}'",
                request.filename()
            )));
        };

        if let Err(e) = prepare_file(&path).await {
            if e.kind() == io::ErrorKind::AlreadyExists {
                send_error_packet(&sock, src, ErrorCode::FileAlreadyExists, "The file already exists on this server.")
                    .await;
                return Err(ServerConnectionError::FileExists(path));
            }
            send_error_packet(&sock, src, ErrorCode::AccessViolation, &format!("Cannot create file: {e}")).await;
            return Err(e.into());
        }
        log::info!("Writing to {:?}", path);

        let options = TransferOptions::from_options(request.options(), config.timeout);
        log::info!(
            "Transfer options: block size {}, block count {:?}, size {:?}, MD5 {:?}, timeout {:?}",
            options.block_size,
            options.block_count,
            options.file_size,
            options.md5,
            options.timeout
        );
        sock.set_buffer_size(config.buffer_size.max(options.block_size + DATA_OVERHEAD));

        // Requests without options get a plain ACK, everything else has its options echoed.
        let reply = if request.options().is_empty() {
            AckMessage::ack(0)
        } else {
            let mut oack = AckMessage::oack();
            oack.add_options(request.options().iter().cloned())
                .map_err(|e| ServerConnectionError::BadRequest(e.to_string()))?;
            oack
        };

        let timeout = options.timeout;
        let processor = PacketProcessor::Receive(ReceiveProcessor::new(&path, options, reply));
        Ok(ServerRequestHandler { sock, dst: src, processor, path, timeout })
    }

    /// Does the work of sending and receiving data over the connection until the connection closes
    pub async fn handle(&mut self) -> Result<TransferReport, ServerConnectionError> {
        self.processor.run(&self.sock, self.dst, self.timeout).await?;

        let report = self.processor.finish().await?;
        log::info!(
            "Received {} block(s), {} bytes from {} into {:?}",
            report.blocks,
            report.bytes,
            self.dst,
            self.path
        );
        Ok(report)
    }
}

/// Listens for requests on the configured port and serves one transfer.
pub struct TftpServer {
    sock: TftpSocket,
    config: ServerConfig,
    shutdown: Arc<AtomicBool>,
}

impl TftpServer {
    pub fn bind(config: ServerConfig) -> Result<TftpServer, ServerConnectionError> {
        let mut sock = TftpSocket::bind(config.socket_addr())?;
        sock.set_buffer_size(config.buffer_size);
        log::info!("Listening on {}", sock.local_addr()?);

        Ok(TftpServer {
            sock,
            config,
            shutdown: Arc::new(AtomicBool::new(false)),
        })
    }

    pub fn local_addr(&self) -> Result<SocketAddr, SocketError> {
        self.sock.local_addr()
    }

    /// A flag that stops the request loop once set.
    pub fn shutdown_handle(&self) -> Arc<AtomicBool> {
        self.shutdown.clone()
    }

    /// Serves requests until one transfer ran or the server was shut down.
    ///
    /// Returns the report of the transfer, or `None` when the server stopped without one.
    pub async fn run(&self) -> Result<Option<TransferReport>, ServerConnectionError> {
        while !self.shutdown.load(Ordering::SeqCst) {
            let (packet, src) = match self.sock.recv_with_timeout(POLL_INTERVAL).await {
                Ok(received) => received,
                Err(SocketError::Timeout(_)) => continue,
                Err(SocketError::PacketParse(e)) => {
                    log::warn!("Ignoring malformed packet: {e}");
                    continue;
                }
                Err(e) => return Err(e.into()),
            };

            match packet {
                Some(Packet::File(request)) if request.opcode() == OpCode::Rrq => {
                    log::warn!("Refusing read request for '{}' from {}", request.filename(), src);
                    send_error_packet(&self.sock, src, ErrorCode::IllegalOperation, "Read requests are not supported")
                        .await;
                }
                Some(Packet::File(request)) => {
                    log::info!("Got {} from {}", Packet::File(request.clone()), src);
                    self.shutdown.store(true, Ordering::SeqCst);
                    let mut handler = ServerRequestHandler::new(&self.config, &request, src).await?;
                    return handler.handle().await.map(Some);
                }
                other => {
                    log::warn!("Unknown packet from {}: {:?}", src, other);
                    send_error_packet(&self.sock, src, ErrorCode::IllegalOperation, "Unknown packet").await;
                    self.shutdown.store(true, Ordering::SeqCst);
                }
            }
        }

        log::info!("Server shut down");
        Ok(None)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::blocks::{self, FileInfo};
    use crate::client::{NegotiationError, SendRequest};
    use crate::config::ClientConfig;
    use crate::options::OptionCode;
    use crate::processor::Md5Check;
    use crate::tftp::{DataMessage, ErrorMessage, TftpOption};
    use std::net::Ipv4Addr;
    use tempdir::TempDir;
    use tokio_test::{assert_err, assert_ok};

    const WAIT: Duration = Duration::from_secs(5);

    fn server_in(dir: &TempDir) -> TftpServer {
        let config = ServerConfig::new()
            .with_bind(IpAddr::V4(Ipv4Addr::LOCALHOST))
            .with_port(0)
            .with_timeout(WAIT)
            .with_output_dir(dir.path());
        TftpServer::bind(config).unwrap()
    }

    fn client_sock() -> TftpSocket {
        TftpSocket::bind("127.0.0.1:0".parse().unwrap()).unwrap()
    }

    fn write_request(name: &str, options: &[(&str, &str)]) -> Packet {
        let mut request = FileMessage::new(OpCode::Wrq, name, TransferMode::Octet).unwrap();
        request.add_options(options.iter().map(|(n, v)| TftpOption::new(n, v)));
        request.into()
    }

    fn pattern(len: usize) -> Vec<u8> {
        (0..len).map(|i| (i * 7 % 256) as u8).collect()
    }

    #[test]
    fn test_output_path() {
        let dir = Path::new("/srv/in");
        assert_eq!(output_path(dir, "report.txt"), Some(PathBuf::from("/srv/in/report_received.txt")));
        assert_eq!(output_path(dir, "archive.tar.gz"), Some(PathBuf::from("/srv/in/archive.tar_received.gz")));
        assert_eq!(output_path(dir, "noext"), Some(PathBuf::from("/srv/in/noext_received")));
        assert_eq!(output_path(dir, "../../etc/passwd"), Some(PathBuf::from("/srv/in/passwd_received")));
        assert_eq!(output_path(dir, ""), None);
    }

    #[test]
    fn test_bind_random_socket() {
        let sock = assert_ok!(bind_random_socket(IpAddr::V4(Ipv4Addr::LOCALHOST)));
        assert!(sock.local_addr().unwrap().port() >= 1024);
    }

    #[tokio::test]
    async fn test_upload_with_options() {
        let dir = TempDir::new("srv_conn").unwrap();
        let contents = pattern(10_000);
        let source = dir.path().join("upload.bin");
        tokio::fs::write(&source, &contents).await.unwrap();
        let info = FileInfo::compute_with_block_size(&source, 8192).await.unwrap();
        let md5 = info.md5().to_string();

        let server = server_in(&dir);
        let address = server.local_addr().unwrap();
        let serving = tokio::spawn(async move { server.run().await });

        let config = ClientConfig::new().with_timeout(WAIT);
        let mut request = SendRequest::new(client_sock(), address, info, &config).unwrap();
        request.add_option(TftpOption::from_code(OptionCode::BlockSize, "8192"));
        request.add_option(TftpOption::from_code(OptionCode::FileSize, "10000"));
        request.add_option(TftpOption::from_code(OptionCode::FileMd5, &md5));
        request.add_option(TftpOption::from_code(OptionCode::BlockCount, "2"));

        request.connect().await.unwrap();
        assert_eq!(request.options().len(), 4);
        assert_ne!(request.peer(), Some(address));

        let sent = request.send_file().await.unwrap();
        assert_eq!((sent.blocks, sent.bytes), (2, 10_000));

        let received = serving.await.unwrap().unwrap().unwrap();
        assert_eq!(received.blocks, 2);
        assert_eq!(received.bytes, 10_000);
        assert_eq!(received.md5_check, Md5Check::Matched);

        let written = dir.path().join("upload_received.bin");
        assert_eq!(tokio::fs::read(&written).await.unwrap(), contents);
        assert_eq!(blocks::hash_file(&written).await.unwrap(), md5);
    }

    #[tokio::test]
    async fn test_upload_with_default_options() {
        let dir = TempDir::new("srv_conn").unwrap();
        let contents = pattern(6144);
        let source = dir.path().join("notes.txt");
        tokio::fs::write(&source, &contents).await.unwrap();

        let server = server_in(&dir);
        let port = server.local_addr().unwrap().port();
        let serving = tokio::spawn(async move { server.run().await });

        let config = ClientConfig::new().with_host("127.0.0.1").with_port(port).with_timeout(WAIT);
        let sent = crate::client::send_file(&config, &source).await.unwrap();
        // 12 full blocks and the empty trailing one
        assert_eq!((sent.blocks, sent.bytes), (13, 6144));

        let received = serving.await.unwrap().unwrap().unwrap();
        assert_eq!(received.blocks, 13);
        assert_eq!(received.md5_check, Md5Check::Matched);
        assert_eq!(tokio::fs::read(dir.path().join("notes_received.txt")).await.unwrap(), contents);
    }

    #[tokio::test]
    async fn test_upload_without_options() {
        let dir = TempDir::new("srv_conn").unwrap();
        let contents = pattern(1300);
        let source = dir.path().join("plain.bin");
        tokio::fs::write(&source, &contents).await.unwrap();
        let info = FileInfo::compute(&source).await.unwrap();
        assert_ne!(info.block_size(), 512);

        let server = server_in(&dir);
        let address = server.local_addr().unwrap();
        let serving = tokio::spawn(async move { server.run().await });

        let config = ClientConfig::new().with_timeout(WAIT);
        let mut request = SendRequest::new(client_sock(), address, info, &config).unwrap();
        request.connect().await.unwrap();
        assert!(request.options().is_empty());

        let sent = request.send_file().await.unwrap();
        assert_eq!(request.file_info().block_size(), 512);
        assert_eq!((sent.blocks, sent.bytes), (3, 1300));

        let received = serving.await.unwrap().unwrap().unwrap();
        assert_eq!(received.md5_check, Md5Check::Skipped);
        assert_eq!(tokio::fs::read(dir.path().join("plain_received.bin")).await.unwrap(), contents);
    }

    #[tokio::test]
    async fn test_existing_file_is_refused() {
        let dir = TempDir::new("srv_conn").unwrap();
        let source = dir.path().join("upload.bin");
        tokio::fs::write(&source, b"new contents").await.unwrap();
        let existing = dir.path().join("upload_received.bin");
        tokio::fs::write(&existing, b"old contents").await.unwrap();

        let server = server_in(&dir);
        let address = server.local_addr().unwrap();
        let shutdown = server.shutdown_handle();
        let serving = tokio::spawn(async move { server.run().await });

        let info = FileInfo::compute(&source).await.unwrap();
        let config = ClientConfig::new().with_timeout(WAIT);
        let mut request = SendRequest::new(client_sock(), address, info, &config).unwrap();
        request.add_default_options();

        match request.connect().await {
            Err(NegotiationError::Rejected { code, .. }) => assert_eq!(code, ErrorCode::FileAlreadyExists.value()),
            other => panic!("unexpected result {:?}", other),
        }
        assert_eq!(request.peer(), None);

        let result = serving.await.unwrap();
        assert!(matches!(assert_err!(result), ServerConnectionError::FileExists(_)));
        assert!(shutdown.load(Ordering::SeqCst));
        assert_eq!(tokio::fs::read(&existing).await.unwrap(), b"old contents");
    }

    #[tokio::test]
    async fn test_out_of_order_block_aborts() {
        let dir = TempDir::new("srv_conn").unwrap();
        let server = server_in(&dir);
        let address = server.local_addr().unwrap();
        let serving = tokio::spawn(async move { server.run().await });

        let sock = client_sock();
        sock.send(&write_request("raw.bin", &[("blksize", "4"), ("blkcnt", "3")]), address)
            .await
            .unwrap();

        let (oack, peer) = sock.recv_with_timeout(WAIT).await.unwrap();
        match oack {
            Some(Packet::Ack(m)) => {
                assert_eq!(m.opcode(), OpCode::Oack);
                assert_eq!(m.options().unwrap().len(), 2);
            }
            other => panic!("expected OACK, got {:?}", other),
        }
        assert_ne!(peer, address);

        // Packets from a stranger are turned away without disturbing the transfer.
        let stranger = client_sock();
        stranger.send(&DataMessage::new(1, b"zzzz".to_vec()).into(), peer).await.unwrap();
        let (refusal, _) = stranger.recv_with_timeout(WAIT).await.unwrap();
        assert!(matches!(refusal, Some(Packet::Error(ref m)) if m.error_code() == Some(ErrorCode::UnknownTransferId)));

        sock.send(&DataMessage::new(1, b"abcd".to_vec()).into(), peer).await.unwrap();
        let (ack, _) = sock.recv_with_timeout(WAIT).await.unwrap();
        assert!(matches!(ack, Some(Packet::Ack(ref m)) if m.opcode() == OpCode::Ack && m.id() == 1));

        sock.send(&DataMessage::new(3, b"ij".to_vec()).into(), peer).await.unwrap();
        let (error, _) = sock.recv_with_timeout(WAIT).await.unwrap();
        match error {
            Some(Packet::Error(m)) => {
                assert_eq!(m.error_code(), Some(ErrorCode::IllegalOperation));
                assert_eq!(m.message().original(), "Unexpected block number received");
            }
            other => panic!("expected ERROR, got {:?}", other),
        }

        let result = serving.await.unwrap();
        assert!(matches!(
            result,
            Err(ServerConnectionError::Transfer(TransferError::BlockIdMismatch { expected: 2, received: 3 }))
        ));
        assert_eq!(tokio::fs::read(dir.path().join("raw_received.bin")).await.unwrap(), b"abcd");
    }

    #[tokio::test]
    async fn test_malformed_packet_from_stranger_is_ignored() {
        let dir = TempDir::new("srv_conn").unwrap();
        let server = server_in(&dir);
        let address = server.local_addr().unwrap();
        let serving = tokio::spawn(async move { server.run().await });

        let sock = client_sock();
        sock.send(&write_request("stray.bin", &[("blksize", "4"), ("blkcnt", "1")]), address)
            .await
            .unwrap();
        let (_, peer) = sock.recv_with_timeout(WAIT).await.unwrap();

        // A truncated DATA header from another port.
        let stranger = tokio::net::UdpSocket::bind("127.0.0.1:0").await.unwrap();
        stranger.send_to(&[0x00, 0x03, 0x00], peer).await.unwrap();
        let mut buf = [0u8; 128];
        let (len, _) = tokio::time::timeout(WAIT, stranger.recv_from(&mut buf)).await.unwrap().unwrap();
        let refusal = Packet::parse_from_buf(&buf[..len]).unwrap();
        assert!(matches!(refusal, Some(Packet::Error(ref m)) if m.error_code() == Some(ErrorCode::UnknownTransferId)));

        sock.send(&DataMessage::new(1, b"ab".to_vec()).into(), peer).await.unwrap();
        let (ack, _) = sock.recv_with_timeout(WAIT).await.unwrap();
        assert!(matches!(ack, Some(Packet::Ack(ref m)) if m.opcode() == OpCode::Ack && m.id() == 1));

        let report = serving.await.unwrap().unwrap().unwrap();
        assert_eq!((report.blocks, report.bytes), (1, 2));
        assert_eq!(tokio::fs::read(dir.path().join("stray_received.bin")).await.unwrap(), b"ab");
    }

    #[tokio::test]
    async fn test_read_request_is_refused() {
        let dir = TempDir::new("srv_conn").unwrap();
        let server = server_in(&dir);
        let address = server.local_addr().unwrap();
        let shutdown = server.shutdown_handle();
        let serving = tokio::spawn(async move { server.run().await });

        let sock = client_sock();
        let request = FileMessage::new(OpCode::Rrq, "wanted.bin", TransferMode::Octet).unwrap();
        sock.send(&request.into(), address).await.unwrap();

        let (reply, _) = sock.recv_with_timeout(WAIT).await.unwrap();
        assert_eq!(
            reply,
            Some(ErrorMessage::new(ErrorCode::IllegalOperation, "Read requests are not supported").into())
        );
        assert!(!shutdown.load(Ordering::SeqCst));

        shutdown.store(true, Ordering::SeqCst);
        assert_eq!(serving.await.unwrap().unwrap(), None);
    }

    #[tokio::test]
    async fn test_unknown_packet_shuts_down() {
        let dir = TempDir::new("srv_conn").unwrap();
        let server = server_in(&dir);
        let address = server.local_addr().unwrap();
        let serving = tokio::spawn(async move { server.run().await });

        let sock = client_sock();
        sock.send(&AckMessage::ack(1).into(), address).await.unwrap();

        let (reply, _) = sock.recv_with_timeout(WAIT).await.unwrap();
        assert_eq!(reply, Some(ErrorMessage::new(ErrorCode::IllegalOperation, "Unknown packet").into()));
        assert_eq!(serving.await.unwrap().unwrap(), None);
    }
}
