use crate::blocks::{self, BlockError, BlockInfo};
use crate::options::TransferOptions;
use crate::tftp::{AckMessage, DataMessage, ErrorCode, ErrorMessage, OpCode, Packet, SocketError, TftpSocket};
use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::time::Duration;
use thiserror::Error;
use tokio::time::Instant;

#[derive(Debug, Error)]
pub enum TransferError {
    #[error("expected block {expected}, received block {received}")]
    BlockIdMismatch { expected: u32, received: u32 },

    #[error("offset of block {id} does not fit in a file")]
    OffsetOverflow { id: u32 },

    #[error("block error: {0}")]
    Block(#[from] BlockError),

    #[error("peer sent error {code}: '{message}'")]
    PeerError { code: u16, message: String },

    #[error("expected a {expected} packet, got {found}")]
    UnexpectedPacket { expected: OpCode, found: OpCode },

    #[error(transparent)]
    Socket(#[from] SocketError),
}

impl TransferError {
    fn from_error_packet(m: &ErrorMessage) -> TransferError {
        TransferError::PeerError {
            code: m.code(),
            message: m.message().original().to_string(),
        }
    }
}

/// Outcome of comparing a received file with the digest the sender announced.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Md5Check {
    Matched,
    Mismatched { expected: String, actual: String },
    /// No digest was negotiated.
    Skipped,
}

/// What a finished transfer moved.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TransferReport {
    pub blocks: u32,
    pub bytes: u64,
    pub md5_check: Md5Check,
}

/// Sends an error packet as a courtesy. Whether it arrives does not matter.
pub async fn send_error_packet(sock: &TftpSocket, dst: SocketAddr, code: ErrorCode, message: &str) {
    let _ = sock.send(&ErrorMessage::new(code, message).into(), dst).await;
}

/// Represents an action that the caller of PacketProcessor should take in
/// response to processing a packet.
#[derive(Debug)]
pub enum ResultAction {
    /// Caller should send the packet and await a response.
    SendPacketAndAwait(Packet),

    /// Caller should send the packet. The transfer is complete afterwards.
    TerminateWithPacket(Packet),

    /// The transfer is complete and there is nothing left to send.
    CloseConnection,

    /// Caller should send the packet to the peer and fail the transfer.
    AbortWithPacket(Packet, TransferError),

    /// Caller should fail the transfer without telling the peer.
    Abort(TransferError),
}

/// An entity that can process packets and produce a response.
#[derive(Debug)]
pub enum PacketProcessor {
    Send(SendProcessor),
    Receive(ReceiveProcessor),
}

impl PacketProcessor {
    pub async fn first_packet(&mut self) -> ResultAction {
        match self {
            PacketProcessor::Send(p) => p.next_block().await,
            PacketProcessor::Receive(p) => p.first_packet(),
        }
    }

    /// Given an incoming packet, processes it and describes the action the caller should take.
    ///
    /// `None` stands for a datagram that did not carry a known opcode.
    pub async fn process_packet(&mut self, packet: Option<&Packet>) -> ResultAction {
        match self {
            PacketProcessor::Send(p) => p.process_reply(packet).await,
            PacketProcessor::Receive(p) => p.process_data(packet).await,
        }
    }

    /// Runs the stop-and-wait exchange with `peer` until the transfer completes or fails.
    ///
    /// Every wait for the peer is bounded by `ttl`. Nothing is retransmitted.
    pub async fn run(&mut self, sock: &TftpSocket, peer: SocketAddr, ttl: Duration) -> Result<(), TransferError> {
        let mut action = self.first_packet().await;
        loop {
            match action {
                ResultAction::SendPacketAndAwait(p) => {
                    sock.send(&p, peer).await?;
                }
                ResultAction::TerminateWithPacket(p) => {
                    sock.send(&p, peer).await?;
                    return Ok(());
                }
                ResultAction::CloseConnection => return Ok(()),
                ResultAction::AbortWithPacket(p, e) => {
                    log::warn!("Aborting transfer with {}: {}", peer, e);
                    let _ = sock.send(&p, peer).await;
                    return Err(e);
                }
                ResultAction::Abort(e) => {
                    log::warn!("Aborting transfer with {}: {}", peer, e);
                    return Err(e);
                }
            }

            let packet = recv_from_peer(sock, peer, ttl).await?;
            action = self.process_packet(packet.as_ref()).await;
        }
    }

    /// Builds the report of a completed transfer, checking the received file's digest on the
    /// receiving side.
    pub async fn finish(&self) -> Result<TransferReport, TransferError> {
        let mut report = self.report();
        if let PacketProcessor::Receive(p) = self {
            report.md5_check = p.verify_file().await?;
        }
        Ok(report)
    }

    pub fn report(&self) -> TransferReport {
        match self {
            PacketProcessor::Send(p) => TransferReport {
                blocks: p.blocks_sent,
                bytes: p.bytes_sent,
                md5_check: Md5Check::Skipped,
            },
            PacketProcessor::Receive(p) => TransferReport {
                blocks: p.blocks_written,
                bytes: p.bytes_written,
                md5_check: Md5Check::Skipped,
            },
        }
    }
}

/// Waits for the next packet from `peer`.
///
/// Datagrams from any other address are answered with an UNKNOWN_TRANSFER_ID error and do not
/// count as a reply, whether or not they decode. A packet from `peer` that cannot be decoded
/// fails the transfer.
async fn recv_from_peer(sock: &TftpSocket, peer: SocketAddr, ttl: Duration) -> Result<Option<Packet>, TransferError> {
    let deadline = Instant::now() + ttl;
    loop {
        let remaining = deadline.saturating_duration_since(Instant::now());
        let (packet, src) = sock.recv_from_with_timeout(remaining).await?;
        if src != peer {
            log::warn!("Got packet from unknown source {}: {:?}", src, packet);
            send_error_packet(
                sock,
                src,
                ErrorCode::UnknownTransferId,
                "This port is in use by another transfer.",
            )
            .await;
            continue;
        }

        match packet {
            Ok(packet) => return Ok(packet),
            Err(e) => {
                send_error_packet(
                    sock,
                    peer,
                    ErrorCode::IllegalOperation,
                    &format!("Error parsing incoming packet: {e}"),
                )
                .await;
                return Err(SocketError::PacketParse(e).into());
            }
        }
    }
}

/// Sends the blocks of a file one DATA packet at a time, each answered by an ACK.
#[derive(Debug)]
pub struct SendProcessor {
    blocks: Vec<BlockInfo>,
    next: usize,
    awaiting: Option<u32>,
    blocks_sent: u32,
    bytes_sent: u64,
}

impl SendProcessor {
    pub fn new(blocks: Vec<BlockInfo>) -> SendProcessor {
        SendProcessor {
            blocks,
            next: 0,
            awaiting: None,
            blocks_sent: 0,
            bytes_sent: 0,
        }
    }

    async fn next_block(&mut self) -> ResultAction {
        let Some(block) = self.blocks.get(self.next) else {
            self.awaiting = None;
            return ResultAction::CloseConnection;
        };
        self.next += 1;

        match block.read().await {
            Ok(data) => {
                log::debug!("Sending block {} ({} bytes)", block.id(), data.len());
                self.awaiting = Some(block.id());
                ResultAction::SendPacketAndAwait(DataMessage::new(block.id(), data).into())
            }
            Err(e) => ResultAction::Abort(e.into()),
        }
    }

    async fn process_reply(&mut self, packet: Option<&Packet>) -> ResultAction {
        match packet {
            Some(Packet::Ack(m)) if m.opcode() == OpCode::Ack && Some(m.id()) == self.awaiting => {
                if let Some(block) = self.blocks.get(self.next - 1) {
                    self.blocks_sent += 1;
                    self.bytes_sent += block.size() as u64;
                }
                self.next_block().await
            }
            Some(Packet::Error(m)) => ResultAction::Abort(TransferError::from_error_packet(m)),
            other => {
                log::warn!(
                    "Unexpected reply while waiting for ACK {:?}: {:?}",
                    self.awaiting,
                    other
                );
                self.next_block().await
            }
        }
    }
}

/// Writes incoming DATA packets to the output file and acknowledges each one.
#[derive(Debug)]
pub struct ReceiveProcessor {
    path: PathBuf,
    options: TransferOptions,
    reply: Option<AckMessage>,
    next_id: u32,
    blocks_written: u32,
    bytes_written: u64,
}

impl ReceiveProcessor {
    /// `reply` is the packet that accepts the request and opens the transfer.
    pub fn new(path: &Path, options: TransferOptions, reply: AckMessage) -> ReceiveProcessor {
        ReceiveProcessor {
            path: path.to_path_buf(),
            options,
            reply: Some(reply),
            next_id: 1,
            blocks_written: 0,
            bytes_written: 0,
        }
    }

    fn first_packet(&mut self) -> ResultAction {
        let reply = self.reply.take().unwrap_or_else(|| AckMessage::ack(0));
        if self.options.block_count == Some(0) {
            return ResultAction::TerminateWithPacket(reply.into());
        }
        ResultAction::SendPacketAndAwait(reply.into())
    }

    async fn process_data(&mut self, packet: Option<&Packet>) -> ResultAction {
        let m = match packet {
            Some(Packet::Data(m)) => m,
            Some(Packet::Error(m)) => return ResultAction::Abort(TransferError::from_error_packet(m)),
            Some(p) => {
                return ResultAction::AbortWithPacket(
                    ErrorMessage::new(ErrorCode::IllegalOperation, "Expected a DATA packet").into(),
                    TransferError::UnexpectedPacket { expected: OpCode::Data, found: p.opcode() },
                )
            }
            None => {
                return ResultAction::AbortWithPacket(
                    ErrorMessage::new(ErrorCode::IllegalOperation, "Unknown packet").into(),
                    TransferError::UnexpectedPacket { expected: OpCode::Data, found: OpCode::Unknown },
                )
            }
        };

        if m.id() != self.next_id {
            return ResultAction::AbortWithPacket(
                ErrorMessage::new(ErrorCode::IllegalOperation, "Unexpected block number received").into(),
                TransferError::BlockIdMismatch { expected: self.next_id, received: m.id() },
            );
        }

        let block_size = self.options.block_size;
        // Only block 0 can fail here: a u32 id times a block size stays far below i64::MAX.
        let offset = u64::from(m.id())
            .checked_sub(1)
            .and_then(|n| n.checked_mul(block_size as u64))
            .filter(|&offset| offset <= i64::MAX as u64);
        let Some(offset) = offset else {
            return ResultAction::AbortWithPacket(
                ErrorMessage::new(ErrorCode::NotDefined, "Overflow error.").into(),
                TransferError::OffsetOverflow { id: m.id() },
            );
        };

        let size = m.block().len().min(block_size);
        let block = BlockInfo::new(&self.path, m.id(), offset, size, None);
        if let Err(e) = block.write(m.block()).await {
            log::error!("Failed to write block {} to {:?}: {}", m.id(), self.path, e);
            return ResultAction::AbortWithPacket(
                ErrorMessage::new(ErrorCode::AccessViolation, &e.to_string()).into(),
                e.into(),
            );
        }
        log::debug!("Wrote block {} ({} bytes)", m.id(), size);

        self.next_id += 1;
        self.blocks_written += 1;
        self.bytes_written += size as u64;

        let finished = match self.options.block_count {
            Some(count) => m.id() >= count,
            None => size < block_size,
        };
        let ack = AckMessage::ack(m.id()).into();
        if finished {
            ResultAction::TerminateWithPacket(ack)
        } else {
            ResultAction::SendPacketAndAwait(ack)
        }
    }

    /// Compares the written file with the negotiated digest, if there was one.
    pub async fn verify_file(&self) -> Result<Md5Check, TransferError> {
        let Some(expected) = &self.options.md5 else {
            return Ok(Md5Check::Skipped);
        };

        let actual = blocks::hash_file(&self.path).await?;
        if actual == *expected {
            log::info!("MD5 of {:?} matches: {}", self.path, actual);
            Ok(Md5Check::Matched)
        } else {
            log::warn!("MD5 of {:?} is {}, expected {}", self.path, actual, expected);
            Ok(Md5Check::Mismatched { expected: expected.clone(), actual })
        }
    }
}
