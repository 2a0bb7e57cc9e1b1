// Wire format of the TFTP messages, all integers big-endian:
//
// RRQ/WRQ: 0x01/0x02 | Filename | 0x00 | Mode | 0x00 | [ Name | 0x00 | Value | 0x00 ]*
// DATA:    0x03 | Block # (4 bytes) | Data (0..N bytes)
// ACK:     0x04 | Block # (4 bytes)
// ERROR:   0x05 | ErrorCode (2 bytes) | ErrMsg | 0x00
// OACK:    0x06 | 0 (4 bytes) | [ Name | 0x00 | Value | 0x00 ]*
//
// Every text field is NetAscii. Block numbers are 4 bytes wide instead of the 2 bytes of
// RFC 1350 so a single transfer is not limited to 65535 blocks.

use async_io::Async;
use std::fmt;
use std::io;
use std::net::{SocketAddr, UdpSocket};
use std::str::FromStr;
use std::time::Duration;
use thiserror::Error;
use tokio::time::error::Elapsed;
use tokio::time::timeout;

use crate::netascii::{NetAscii, NetAsciiError, CHAR_NULL};
use crate::options::OptionCode;

///////////////////////////////////////////////////////////////
// Error-handling objects

/// Represents an error raised while building or parsing a TFTP message.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum PacketError {
    #[error("the specified buffer is not for {expected} message (opcode {found})")]
    WrongOpCode { expected: &'static str, found: u16 },

    #[error("{kind} message needs at least {needed} bytes, got {len}")]
    Truncated { kind: &'static str, needed: usize, len: usize },

    #[error("malformed {kind} message: {source}")]
    Field {
        kind: &'static str,
        #[source]
        source: NetAsciiError,
    },

    #[error("opcode {opcode} is not valid for {kind} message")]
    InvalidOpCode { opcode: OpCode, kind: &'static str },

    #[error("cannot use options with {0} message, use OACK")]
    OptionsNotSupported(OpCode),

    #[error("unknown transfer mode '{0}'")]
    UnknownMode(String),
}

/// Represents an error returned from the TFTP Socket handler
#[derive(Debug, Error)]
pub enum SocketError {
    #[error("socket I/O error: {0}")]
    IO(#[from] io::Error),

    #[error("packet parsing error: {0}")]
    PacketParse(#[from] PacketError),

    #[error("socket I/O timeout")]
    Timeout(#[from] Elapsed),
}

pub type TftpResult<T> = Result<T, SocketError>;

const FILE_KIND: &str = "an RRQ or WRQ";
const DATA_KIND: &str = "a DATA";
const ACK_KIND: &str = "an ACK or OACK";
const ERROR_KIND: &str = "an ERROR";

///////////////////////////////////////////////////////////////
// Protocol constants

/// The operation carried by a TFTP packet.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u16)]
pub enum OpCode {
    /// A request whose direction has not been chosen yet. Never valid on the wire.
    None = 0,
    Rrq = 1,
    Wrq = 2,
    Data = 3,
    Ack = 4,
    Error = 5,
    Oack = 6,
    /// Anything else found in an opcode field.
    Unknown = 99,
}

impl OpCode {
    pub fn from_u16(value: u16) -> OpCode {
        match value {
            0 => OpCode::None,
            1 => OpCode::Rrq,
            2 => OpCode::Wrq,
            3 => OpCode::Data,
            4 => OpCode::Ack,
            5 => OpCode::Error,
            6 => OpCode::Oack,
            _ => OpCode::Unknown,
        }
    }

    pub fn value(self) -> u16 {
        self as u16
    }
}

impl fmt::Display for OpCode {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        let name = match self {
            OpCode::None => "NONE",
            OpCode::Rrq => "RRQ",
            OpCode::Wrq => "WRQ",
            OpCode::Data => "DATA",
            OpCode::Ack => "ACK",
            OpCode::Error => "ERROR",
            OpCode::Oack => "OACK",
            OpCode::Unknown => "UNKNOWN",
        };
        write!(f, "{name}")
    }
}

/// Represents a TFTP Error code surfaced by a TFTP Error packet
///
/// `FileNotFound` and `AccessViolation` go out with the same wire value, so a decoded 1 always
/// reads back as `FileNotFound`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ErrorCode {
    NotDefined,
    FileNotFound,
    AccessViolation,
    DiskFull,
    IllegalOperation,
    UnknownTransferId,
    FileAlreadyExists,
    NoSuchUser,
}

impl ErrorCode {
    pub fn value(self) -> u16 {
        match self {
            ErrorCode::NotDefined => 0,
            ErrorCode::FileNotFound => 1,
            ErrorCode::AccessViolation => 1,
            ErrorCode::DiskFull => 3,
            ErrorCode::IllegalOperation => 4,
            ErrorCode::UnknownTransferId => 5,
            ErrorCode::FileAlreadyExists => 6,
            ErrorCode::NoSuchUser => 7,
        }
    }

    pub fn from_value(value: u16) -> Option<ErrorCode> {
        match value {
            0 => Some(ErrorCode::NotDefined),
            1 => Some(ErrorCode::FileNotFound),
            3 => Some(ErrorCode::DiskFull),
            4 => Some(ErrorCode::IllegalOperation),
            5 => Some(ErrorCode::UnknownTransferId),
            6 => Some(ErrorCode::FileAlreadyExists),
            7 => Some(ErrorCode::NoSuchUser),
            _ => None,
        }
    }
}

/// Represents the mode for a file the client wishes to read or write.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransferMode {
    NetAscii,
    Octet,
    Mail,
    Unicode,
    Bin64,
}

impl TransferMode {
    pub fn as_str(self) -> &'static str {
        match self {
            TransferMode::NetAscii => "netascii",
            TransferMode::Octet => "octet",
            TransferMode::Mail => "mail",
            TransferMode::Unicode => "unicode",
            TransferMode::Bin64 => "bin64",
        }
    }
}

impl FromStr for TransferMode {
    type Err = PacketError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "netascii" => Ok(TransferMode::NetAscii),
            "octet" => Ok(TransferMode::Octet),
            "mail" => Ok(TransferMode::Mail),
            "unicode" => Ok(TransferMode::Unicode),
            "bin64" => Ok(TransferMode::Bin64),
            _ => Err(PacketError::UnknownMode(s.to_string())),
        }
    }
}

impl fmt::Display for TransferMode {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

///////////////////////////////////////////////////////////////
// Options

/// A `name\0value\0` pair carried by request and OACK messages.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct TftpOption {
    name: NetAscii,
    value: NetAscii,
}

impl TftpOption {
    pub fn new(name: &str, value: &str) -> TftpOption {
        TftpOption {
            name: NetAscii::new(name),
            value: NetAscii::new(value),
        }
    }

    pub fn from_code(code: OptionCode, value: &str) -> TftpOption {
        TftpOption::new(code.as_str(), value)
    }

    /// Reads one option starting at `offset`.
    pub fn from_bytes(buf: &[u8], offset: usize) -> Result<TftpOption, NetAsciiError> {
        Ok(TftpOption {
            name: NetAscii::from_bytes(buf, offset, 0)?,
            value: NetAscii::from_bytes(buf, offset, 1)?,
        })
    }

    pub fn name(&self) -> &NetAscii {
        &self.name
    }

    pub fn value(&self) -> &NetAscii {
        &self.value
    }

    /// Number of bytes the option takes on the wire, terminators included.
    pub fn byte_size(&self) -> usize {
        self.name.len() + self.value.len() + 2
    }

    fn write_to(&self, buf: &mut Vec<u8>) {
        buf.extend_from_slice(self.name.as_bytes());
        buf.push(CHAR_NULL);
        buf.extend_from_slice(self.value.as_bytes());
        buf.push(CHAR_NULL);
    }
}

impl fmt::Display for TftpOption {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "{}={}", self.name, self.value)
    }
}

fn parse_options(buf: &[u8], mut offset: usize, kind: &'static str) -> Result<Vec<TftpOption>, PacketError> {
    let mut options = Vec::new();
    while offset < buf.len() {
        let option = TftpOption::from_bytes(buf, offset).map_err(|source| PacketError::Field { kind, source })?;
        offset += option.byte_size();
        options.push(option);
    }
    Ok(options)
}

///////////////////////////////////////////////////////////////
// Buffer helpers

fn u16_from_buffer(buf: &[u8]) -> u16 {
    (u16::from(buf[0]) << 8) + u16::from(buf[1])
}

fn write_u16(buf: &mut Vec<u8>, value: u16) {
    buf.push(((value & 0xFF00) >> 8) as u8);
    buf.push((value & 0x00FF) as u8);
}

/// Writes a block id as four separate bytes, high byte first.
fn write_id(buf: &mut Vec<u8>, id: u32) {
    buf.push(((id & 0xFF00_0000) >> 24) as u8);
    buf.push(((id & 0x00FF_0000) >> 16) as u8);
    buf.push(((id & 0x0000_FF00) >> 8) as u8);
    buf.push((id & 0x0000_00FF) as u8);
}

/// Composes a block id from four bytes. Ids with the top bit set only keep their low 16 bits.
fn id_from_buffer(buf: &[u8]) -> u32 {
    let id = (u32::from(buf[0]) << 24) | (u32::from(buf[1]) << 16) | (u32::from(buf[2]) << 8) | u32::from(buf[3]);
    if id & 0x8000_0000 != 0 {
        id & 0x0000_FFFF
    } else {
        id
    }
}

/// Checks the opcode at the front of `buf` before any other field is looked at.
fn check_opcode(buf: &[u8], accepted: &[OpCode], kind: &'static str) -> Result<OpCode, PacketError> {
    if buf.len() < 2 {
        return Err(PacketError::Truncated { kind, needed: 2, len: buf.len() });
    }

    let raw = u16_from_buffer(&buf[..2]);
    let opcode = OpCode::from_u16(raw);
    if !accepted.contains(&opcode) {
        return Err(PacketError::WrongOpCode { expected: kind, found: raw });
    }
    Ok(opcode)
}

///////////////////////////////////////////////////////////////
// Messages

/// A read or write request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FileMessage {
    opcode: OpCode,
    filename: NetAscii,
    mode: NetAscii,
    options: Vec<TftpOption>,
}

impl FileMessage {
    pub const HEADER_SIZE: usize = 2;

    pub fn new(opcode: OpCode, filename: &str, mode: TransferMode) -> Result<FileMessage, PacketError> {
        if !matches!(opcode, OpCode::None | OpCode::Rrq | OpCode::Wrq) {
            return Err(PacketError::InvalidOpCode { opcode, kind: FILE_KIND });
        }

        Ok(FileMessage {
            opcode,
            filename: NetAscii::new(filename),
            mode: NetAscii::new(mode.as_str()),
            options: Vec::new(),
        })
    }

    pub fn opcode(&self) -> OpCode {
        self.opcode
    }

    pub fn filename(&self) -> &NetAscii {
        &self.filename
    }

    pub fn mode(&self) -> &NetAscii {
        &self.mode
    }

    pub fn transfer_mode(&self) -> Result<TransferMode, PacketError> {
        self.mode.original().parse()
    }

    pub fn options(&self) -> &[TftpOption] {
        &self.options
    }

    pub fn add_option(&mut self, option: TftpOption) {
        self.options.push(option);
    }

    pub fn add_options<I: IntoIterator<Item = TftpOption>>(&mut self, options: I) {
        self.options.extend(options);
    }

    pub fn payload_size(&self) -> usize {
        Self::HEADER_SIZE
            + self.filename.len()
            + 1
            + self.mode.len()
            + 1
            + self.options.iter().map(TftpOption::byte_size).sum::<usize>()
    }

    pub fn encode(&self) -> Vec<u8> {
        let mut buf = Vec::with_capacity(self.payload_size());
        write_u16(&mut buf, self.opcode.value());
        buf.extend_from_slice(self.filename.as_bytes());
        buf.push(CHAR_NULL);
        buf.extend_from_slice(self.mode.as_bytes());
        buf.push(CHAR_NULL);
        for option in &self.options {
            option.write_to(&mut buf);
        }
        buf
    }

    pub fn decode(buf: &[u8]) -> Result<FileMessage, PacketError> {
        let opcode = check_opcode(buf, &[OpCode::Rrq, OpCode::Wrq], FILE_KIND)?;
        let field = |source| PacketError::Field { kind: FILE_KIND, source };

        let mut offset = Self::HEADER_SIZE;
        let filename = NetAscii::from_bytes(buf, offset, 0).map_err(field)?;
        offset += filename.len() + 1;
        let mode = NetAscii::from_bytes(buf, offset, 0).map_err(field)?;
        offset += mode.len() + 1;
        let options = parse_options(buf, offset, FILE_KIND)?;

        Ok(FileMessage { opcode, filename, mode, options })
    }
}

/// A block of file content.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DataMessage {
    id: u32,
    block: Vec<u8>,
}

impl DataMessage {
    pub const HEADER_SIZE: usize = 6;

    pub fn new(id: u32, block: impl Into<Vec<u8>>) -> DataMessage {
        DataMessage { id, block: block.into() }
    }

    pub fn opcode(&self) -> OpCode {
        OpCode::Data
    }

    pub fn id(&self) -> u32 {
        self.id
    }

    pub fn block(&self) -> &[u8] {
        &self.block
    }

    pub fn payload_size(&self) -> usize {
        Self::HEADER_SIZE + self.block.len()
    }

    pub fn encode(&self) -> Vec<u8> {
        let mut buf = Vec::with_capacity(self.payload_size());
        write_u16(&mut buf, OpCode::Data.value());
        write_id(&mut buf, self.id);
        buf.extend_from_slice(&self.block);
        buf
    }

    pub fn decode(buf: &[u8]) -> Result<DataMessage, PacketError> {
        check_opcode(buf, &[OpCode::Data], DATA_KIND)?;
        if buf.len() < Self::HEADER_SIZE {
            return Err(PacketError::Truncated { kind: DATA_KIND, needed: Self::HEADER_SIZE, len: buf.len() });
        }

        Ok(DataMessage {
            id: id_from_buffer(&buf[2..6]),
            block: buf[Self::HEADER_SIZE..].to_vec(),
        })
    }
}

/// An acknowledgment. ACK and OACK share a layout, but only an OACK may carry options.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AckMessage {
    opcode: OpCode,
    id: u32,
    options: Vec<TftpOption>,
}

impl AckMessage {
    pub const HEADER_SIZE: usize = 6;

    pub fn new(opcode: OpCode, id: u32) -> Result<AckMessage, PacketError> {
        if !matches!(opcode, OpCode::Ack | OpCode::Oack) {
            return Err(PacketError::InvalidOpCode { opcode, kind: ACK_KIND });
        }
        Ok(AckMessage { opcode, id, options: Vec::new() })
    }

    /// A plain ACK for block `id`.
    pub fn ack(id: u32) -> AckMessage {
        AckMessage { opcode: OpCode::Ack, id, options: Vec::new() }
    }

    /// An OACK with no options yet.
    pub fn oack() -> AckMessage {
        AckMessage { opcode: OpCode::Oack, id: 0, options: Vec::new() }
    }

    pub fn opcode(&self) -> OpCode {
        self.opcode
    }

    pub fn id(&self) -> u32 {
        self.id
    }

    pub fn options(&self) -> Result<&[TftpOption], PacketError> {
        if self.opcode != OpCode::Oack {
            return Err(PacketError::OptionsNotSupported(self.opcode));
        }
        Ok(&self.options)
    }

    pub fn add_option(&mut self, option: TftpOption) -> Result<(), PacketError> {
        if self.opcode != OpCode::Oack {
            return Err(PacketError::OptionsNotSupported(self.opcode));
        }
        self.options.push(option);
        Ok(())
    }

    pub fn add_options<I: IntoIterator<Item = TftpOption>>(&mut self, options: I) -> Result<(), PacketError> {
        if self.opcode != OpCode::Oack {
            return Err(PacketError::OptionsNotSupported(self.opcode));
        }
        self.options.extend(options);
        Ok(())
    }

    pub fn payload_size(&self) -> usize {
        Self::HEADER_SIZE + self.options.iter().map(TftpOption::byte_size).sum::<usize>()
    }

    pub fn encode(&self) -> Vec<u8> {
        let mut buf = Vec::with_capacity(self.payload_size());
        write_u16(&mut buf, self.opcode.value());
        write_id(&mut buf, self.id);
        for option in &self.options {
            option.write_to(&mut buf);
        }
        buf
    }

    pub fn decode(buf: &[u8]) -> Result<AckMessage, PacketError> {
        let opcode = check_opcode(buf, &[OpCode::Ack, OpCode::Oack], ACK_KIND)?;
        if buf.len() < Self::HEADER_SIZE {
            return Err(PacketError::Truncated { kind: ACK_KIND, needed: Self::HEADER_SIZE, len: buf.len() });
        }

        let id = id_from_buffer(&buf[2..6]);
        let options = match opcode {
            OpCode::Oack => parse_options(buf, Self::HEADER_SIZE, ACK_KIND)?,
            _ => Vec::new(),
        };

        Ok(AckMessage { opcode, id, options })
    }
}

/// An error report. The code is kept as its raw wire value.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ErrorMessage {
    code: u16,
    message: NetAscii,
}

impl ErrorMessage {
    pub const HEADER_SIZE: usize = 4;
    pub const DEFAULT_MESSAGE: &'static str = "An unknown error has occurred.";

    pub fn new(code: ErrorCode, message: &str) -> ErrorMessage {
        ErrorMessage {
            code: code.value(),
            message: NetAscii::new(message),
        }
    }

    pub fn opcode(&self) -> OpCode {
        OpCode::Error
    }

    pub fn code(&self) -> u16 {
        self.code
    }

    pub fn error_code(&self) -> Option<ErrorCode> {
        ErrorCode::from_value(self.code)
    }

    pub fn message(&self) -> &NetAscii {
        &self.message
    }

    pub fn payload_size(&self) -> usize {
        Self::HEADER_SIZE + self.message.len() + 1
    }

    pub fn encode(&self) -> Vec<u8> {
        let mut buf = Vec::with_capacity(self.payload_size());
        write_u16(&mut buf, OpCode::Error.value());
        write_u16(&mut buf, self.code);
        buf.extend_from_slice(self.message.as_bytes());
        buf.push(CHAR_NULL);
        buf
    }

    pub fn decode(buf: &[u8]) -> Result<ErrorMessage, PacketError> {
        check_opcode(buf, &[OpCode::Error], ERROR_KIND)?;
        if buf.len() < Self::HEADER_SIZE {
            return Err(PacketError::Truncated { kind: ERROR_KIND, needed: Self::HEADER_SIZE, len: buf.len() });
        }

        let code = u16_from_buffer(&buf[2..4]);
        // Tolerate peers that leave the message out entirely.
        let message = if buf.len() == Self::HEADER_SIZE {
            NetAscii::default()
        } else {
            NetAscii::from_bytes(buf, Self::HEADER_SIZE, 0)
                .map_err(|source| PacketError::Field { kind: ERROR_KIND, source })?
        };

        Ok(ErrorMessage { code, message })
    }
}

impl Default for ErrorMessage {
    fn default() -> Self {
        ErrorMessage::new(ErrorCode::NotDefined, Self::DEFAULT_MESSAGE)
    }
}

/// An enum representing a TFTP packet and its associated data.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Packet {
    /// RRQ or WRQ
    File(FileMessage),

    /// ACK or OACK
    Ack(AckMessage),

    Data(DataMessage),

    Error(ErrorMessage),
}

impl Packet {
    pub fn opcode(&self) -> OpCode {
        match self {
            Packet::File(m) => m.opcode(),
            Packet::Ack(m) => m.opcode(),
            Packet::Data(m) => m.opcode(),
            Packet::Error(m) => m.opcode(),
        }
    }

    pub fn payload_size(&self) -> usize {
        match self {
            Packet::File(m) => m.payload_size(),
            Packet::Ack(m) => m.payload_size(),
            Packet::Data(m) => m.payload_size(),
            Packet::Error(m) => m.payload_size(),
        }
    }

    pub fn encode(&self) -> Vec<u8> {
        match self {
            Packet::File(m) => m.encode(),
            Packet::Ack(m) => m.encode(),
            Packet::Data(m) => m.encode(),
            Packet::Error(m) => m.encode(),
        }
    }

    /// Picks the message type from the opcode and decodes the buffer as that type.
    ///
    /// Returns `Ok(None)` for buffers shorter than an opcode or carrying an opcode that is not a
    /// known message. Errors are only returned for packets that claim a known type but are
    /// malformed.
    pub fn parse_from_buf(buf: &[u8]) -> Result<Option<Packet>, PacketError> {
        if buf.len() < 2 {
            return Ok(None);
        }

        let packet = match OpCode::from_u16(u16_from_buffer(&buf[..2])) {
            OpCode::Ack | OpCode::Oack => Packet::Ack(AckMessage::decode(buf)?),
            OpCode::Rrq | OpCode::Wrq => Packet::File(FileMessage::decode(buf)?),
            OpCode::Data => Packet::Data(DataMessage::decode(buf)?),
            OpCode::Error => Packet::Error(ErrorMessage::decode(buf)?),
            OpCode::None | OpCode::Unknown => return Ok(None),
        };
        Ok(Some(packet))
    }
}

impl From<FileMessage> for Packet {
    fn from(m: FileMessage) -> Self {
        Packet::File(m)
    }
}

impl From<AckMessage> for Packet {
    fn from(m: AckMessage) -> Self {
        Packet::Ack(m)
    }
}

impl From<DataMessage> for Packet {
    fn from(m: DataMessage) -> Self {
        Packet::Data(m)
    }
}

impl From<ErrorMessage> for Packet {
    fn from(m: ErrorMessage) -> Self {
        Packet::Error(m)
    }
}

impl fmt::Display for Packet {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            Packet::File(m) => write!(f, "{} '{}' ({}) with {} option(s)", m.opcode, m.filename, m.mode, m.options.len()),
            Packet::Ack(m) => write!(f, "{} {} with {} option(s)", m.opcode, m.id, m.options.len()),
            Packet::Data(m) => write!(f, "DATA {} ({} bytes)", m.id, m.block.len()),
            Packet::Error(m) => write!(f, "ERROR {}: '{}'", m.code, m.message),
        }
    }
}

///////////////////////////////////////////////////////////////
/// Wrapper around a UDP socket that parses TFTP headers and
/// returns the packets in a more structured format.
pub struct TftpSocket {
    sock: Async<UdpSocket>,
    buffer_size: usize,
}

impl TftpSocket {
    /// Largest datagram a socket accepts unless told otherwise.
    pub const DEFAULT_BUFFER_SIZE: usize = 65535;

    pub fn bind(addr: SocketAddr) -> TftpResult<TftpSocket> {
        Ok(TftpSocket {
            sock: Async::<UdpSocket>::bind(addr)?,
            buffer_size: Self::DEFAULT_BUFFER_SIZE,
        })
    }

    pub fn local_addr(&self) -> TftpResult<SocketAddr> {
        Ok(self.sock.get_ref().local_addr()?)
    }

    /// Sets the size of the buffer datagrams are received into. Longer datagrams are truncated.
    pub fn set_buffer_size(&mut self, size: usize) {
        self.buffer_size = size;
    }

    pub async fn send(&self, packet: &Packet, dst: SocketAddr) -> TftpResult<usize> {
        let buf = packet.encode();
        Ok(self.sock.send_to(&buf, dst).await?)
    }

    /// Waits up to `ttl` for the next datagram and parses it.
    ///
    /// The packet is `None` when the datagram does not carry a known opcode.
    pub async fn recv_with_timeout(&self, ttl: Duration) -> TftpResult<(Option<Packet>, SocketAddr)> {
        let (packet, src) = self.recv_from_with_timeout(ttl).await?;
        Ok((packet?, src))
    }

    /// Like `recv_with_timeout`, but a datagram that fails to parse still reports its source.
    pub async fn recv_from_with_timeout(
        &self,
        ttl: Duration,
    ) -> TftpResult<(Result<Option<Packet>, PacketError>, SocketAddr)> {
        let mut buf = vec![0; self.buffer_size];
        let (total_written, src) = timeout(ttl, self.sock.recv_from(&mut buf)).await??;

        Ok((Packet::parse_from_buf(&buf[..total_written]), src))
    }
}
