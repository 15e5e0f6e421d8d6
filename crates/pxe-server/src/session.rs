//! One TFTP read transfer
//!
//! Runs on its own socket connected to the client, so the socket's port is the transfer ID.
//! Lock-step: each block is resent until acknowledged or the retries run out.

use crate::error::{PxeError, Result};
use crate::packet::{self, MAX_RETRIES, Reply, TransferOptions};
use crate::reader::BootReader;
use bytes::Bytes;
use tokio::net::UdpSocket;
use tokio::time::{Instant, timeout_at};
use tracing::debug;

/// One read transfer on its own socket.
#[derive(Debug)]
pub struct TransferSession {
    socket: UdpSocket,
    options: TransferOptions,
    reader: BootReader,
}

impl TransferSession {
    /// `socket` must already be connected to the client.
    pub fn new(socket: UdpSocket, mut options: TransferOptions, reader: BootReader) -> Self {
        options.set_transfer_size(reader.size());
        Self {
            socket,
            options,
            reader,
        }
    }

    /// Sends the whole file. Returns the number of bytes delivered.
    pub async fn run(mut self) -> Result<u64> {
        if !self.options.acknowledged.is_empty() {
            let oack = packet::oack_packet(&self.options.acknowledged);
            self.send_until_acked(&oack, 0).await?;
        }

        let block_size = self.options.block_size;
        let mut buf = vec![0u8; block_size];
        let mut block: u16 = 1;
        let mut sent: u64 = 0;
        loop {
            let n = self.reader.read_block(&mut buf).await?;
            let data = packet::data_packet(block, &buf[..n]);
            self.send_until_acked(&data, block).await?;
            sent += n as u64;
            if n < block_size {
                break;
            }
            block = block.wrapping_add(1);
        }
        debug!("Transfer complete: {} bytes in {} blocks", sent, block);
        Ok(sent)
    }

    async fn send_until_acked(&self, packet: &Bytes, block: u16) -> Result<()> {
        for attempt in 0..=MAX_RETRIES {
            if attempt > 0 {
                debug!("Retransmitting block {} (attempt {})", block, attempt);
            }
            self.socket.send(packet).await?;
            if self.wait_for_ack(block).await? {
                return Ok(());
            }
        }
        Err(PxeError::Tftp(format!("Timeout waiting for ACK of block {block}")))
    }

    /// Waits one timeout period for `block` to be acknowledged. Duplicate ACKs for earlier
    /// blocks are ignored rather than triggering a resend.
    async fn wait_for_ack(&self, block: u16) -> Result<bool> {
        let deadline = Instant::now() + self.options.timeout;
        let mut buf = [0u8; 516];
        loop {
            let n = match timeout_at(deadline, self.socket.recv(&mut buf)).await {
                Ok(received) => received?,
                Err(_) => return Ok(false),
            };
            match packet::parse_reply(&buf[..n]) {
                Ok(Reply::Ack(acked)) if acked == block => return Ok(true),
                Ok(Reply::Ack(acked)) => debug!("Ignoring ACK for block {} (expected {})", acked, block),
                Ok(Reply::Error { code, message }) => {
                    return Err(PxeError::Tftp(format!("Client sent error {code}: {message}")));
                }
                Ok(Reply::Other(opcode)) => debug!("Ignoring opcode {} during transfer", opcode),
                Err(e) => debug!("Ignoring malformed packet: {}", e),
            }
        }
    }
}
