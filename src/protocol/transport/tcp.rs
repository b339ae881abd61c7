use anyhow::{anyhow, Result};
use bytes::Bytes;
use std::time::Duration;
use tokio::{
    io::{AsyncReadExt, AsyncWriteExt},
    net::TcpStream,
};

use super::{
    drain_inbound, enqueue_write, Transport, TransportCommand, TransportError, INBOUND_CAPACITY,
    OUTBOUND_CAPACITY,
};
use crate::utils::hex_dump;

/// Stream medium over a single TCP connection.
///
/// One writer task drains the command queue, one reader task forwards every
/// read as a chunk. The connection is not re-established once it drops; sends
/// after that fail with `TransportError::Closed`.
pub struct TcpTransport {
    name: String,
    commands: flume::Sender<TransportCommand>,
    inbound: flume::Receiver<Bytes>,
}

impl TcpTransport {
    pub async fn connect(name: impl Into<String>, address: &str, timeout: Duration) -> Result<Self> {
        let name = name.into();
        let stream = tokio::time::timeout(timeout, TcpStream::connect(address))
            .await
            .map_err(|_| anyhow!("Timed out connecting to {address}"))?
            .map_err(|err| anyhow!("Failed to connect to {address}: {err}"))?;
        stream.set_nodelay(true)?;
        let (mut reader, mut writer) = stream.into_split();

        let (commands, command_rx) = flume::bounded::<TransportCommand>(OUTBOUND_CAPACITY);
        let (inbound_tx, inbound) = flume::bounded::<Bytes>(INBOUND_CAPACITY);

        let writer_name = name.clone();
        tokio::spawn(async move {
            while let Ok(command) = command_rx.recv_async().await {
                match command {
                    TransportCommand::Write(bytes) => {
                        log::debug!("{writer_name} >> {}", hex_dump(&bytes));
                        if let Err(err) = writer.write_all(&bytes).await {
                            log::warn!("{writer_name}: write failed: {err}");
                            break;
                        }
                    }
                    // queued chunks are drained by the caller
                    TransportCommand::FlushInput => {}
                    TransportCommand::Shutdown => break,
                }
            }
            let _ = writer.shutdown().await;
            log::info!("{writer_name}: tcp writer exiting");
        });

        let reader_name = name.clone();
        tokio::spawn(async move {
            let mut buf = vec![0u8; 512];
            loop {
                match reader.read(&mut buf).await {
                    Ok(0) => {
                        log::warn!("{reader_name}: connection closed by peer");
                        break;
                    }
                    Ok(n) => {
                        log::debug!("{reader_name} << {}", hex_dump(&buf[..n]));
                        if inbound_tx
                            .send_async(Bytes::copy_from_slice(&buf[..n]))
                            .await
                            .is_err()
                        {
                            break;
                        }
                    }
                    Err(err) => {
                        log::warn!("{reader_name}: read failed: {err}");
                        break;
                    }
                }
            }
        });

        log::info!("Connected tcp transport {name} to {address}");
        Ok(Self {
            name,
            commands,
            inbound,
        })
    }
}

impl Transport for TcpTransport {
    fn name(&self) -> &str {
        &self.name
    }

    fn send(&self, frame: &[u8]) -> Result<usize, TransportError> {
        enqueue_write(&self.commands, frame)
    }

    fn flush_inbound(&self) {
        let dropped = drain_inbound(&self.inbound);
        if dropped > 0 {
            log::debug!("{}: flushed {} queued inbound bytes", self.name, dropped);
        }
    }

    fn inbound(&self) -> flume::Receiver<Bytes> {
        self.inbound.clone()
    }
}

impl Drop for TcpTransport {
    fn drop(&mut self) {
        let _ = self.commands.try_send(TransportCommand::Shutdown);
    }
}
