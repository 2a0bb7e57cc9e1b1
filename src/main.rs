// A TFTP client and server for uploads, with option negotiation and MD5-checked blocks.
//
// The protocol is RFC 1350 with a few changes:
//
// - Block numbers are 4 bytes wide, so the number of blocks in a transfer is not limited to 65535.
// - Requests carry options (RFC 2347 style): blksize, tsize, timeout, blkcnt, tmd5 and retry. The
//   server answers with an OACK echoing the options, or a plain ACK 0 when there were none.
// - tmd5 carries the MD5 of the whole file. The receiver checks the written file against it.
//
// Only uploads are served. The client splits the file so it spans at least 12 blocks, checks
// every block against its own MD5 before sending anything, then sends the blocks one at a time,
// each waiting for its ACK.
//
// Packet:
//  - IP Header
//      - UDP Header
//          - TFTP header (2-byte opcode)
//              - remainder of packet (contents depend on packet type)
//
// opcode   operation
// 1        Read req (RRQ)
// 2        Write req (WRQ)
// 3        Data (DATA)
// 4        ACK
// 5        ERROR
// 6        Option ACK (OACK)
//
// Errors end a transfer and are sent as a courtesy: they are never acknowledged or
// retransmitted. Nothing else is retransmitted either; every wait for the peer is bounded by
// the negotiated timeout and a timeout ends the transfer.

use std::net::IpAddr;
use std::path::PathBuf;
use std::sync::atomic::Ordering;
use std::time::Duration;

pub mod blocks;
pub mod client;
pub mod config;
pub mod netascii;
pub mod options;
pub mod processor;
pub mod srv_conn;
pub mod tftp;

use config::{ClientConfig, ServerConfig, DEFAULT_PORT, DEFAULT_SERVER_BUFFER_SIZE};
use processor::{Md5Check, TransferReport};
use srv_conn::TftpServer;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};

#[derive(Parser, Debug)]
#[command(name = "tftp-md5", about = "TFTP uploads with option negotiation and MD5-checked blocks")]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Send a file to a server
    Send {
        /// File to send
        file: PathBuf,

        /// Server to send the file to
        #[arg(default_value = "localhost")]
        host: String,

        /// Server port
        #[arg(long, default_value_t = DEFAULT_PORT)]
        port: u16,

        /// Seconds to wait for each reply
        #[arg(long, default_value_t = 10)]
        timeout: u64,
    },

    /// Wait for one upload and write it to the output directory
    Serve {
        /// Port to listen on
        #[arg(default_value_t = DEFAULT_PORT)]
        port: u16,

        /// Receive buffer size in bytes
        #[arg(default_value_t = DEFAULT_SERVER_BUFFER_SIZE)]
        buffer_size: usize,

        /// Address to listen on
        #[arg(long, default_value = "0.0.0.0")]
        bind: IpAddr,

        /// Directory received files are written to
        #[arg(long, default_value = ".")]
        output_dir: PathBuf,

        /// Seconds to wait for each packet unless the client asks otherwise
        #[arg(long, default_value_t = 10)]
        timeout: u64,
    },
}

fn log_report(report: &TransferReport) {
    log::info!("Transfer complete: {} block(s), {} bytes", report.blocks, report.bytes);
    match &report.md5_check {
        Md5Check::Matched => log::info!("MD5 check passed"),
        Md5Check::Mismatched { expected, actual } => {
            log::warn!("MD5 check failed: expected {}, got {}", expected, actual)
        }
        Md5Check::Skipped => {}
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();

    let cli = Cli::parse();
    match cli.command {
        Command::Send { file, host, port, timeout } => {
            let config = ClientConfig::new()
                .with_host(&host)
                .with_port(port)
                .with_timeout(Duration::from_secs(timeout));

            let report = client::send_file(&config, &file)
                .await
                .with_context(|| format!("Failed to send {:?} to {}:{}", file, host, port))?;
            log_report(&report);
        }
        Command::Serve { port, buffer_size, bind, output_dir, timeout } => {
            let config = ServerConfig::new()
                .with_bind(bind)
                .with_port(port)
                .with_buffer_size(buffer_size)
                .with_timeout(Duration::from_secs(timeout))
                .with_output_dir(&output_dir);

            let server = TftpServer::bind(config).with_context(|| format!("Failed to listen on {}:{}", bind, port))?;

            let shutdown = server.shutdown_handle();
            tokio::spawn(async move {
                if tokio::signal::ctrl_c().await.is_ok() {
                    log::info!("Interrupted, shutting down");
                    shutdown.store(true, Ordering::SeqCst);
                }
            });

            match server.run().await.context("Failed to receive a file")? {
                Some(report) => log_report(&report),
                None => log::info!("No file received"),
            }
        }
    }

    Ok(())
}
