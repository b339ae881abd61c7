use anyhow::{anyhow, Result};
use bytes::Bytes;
use serde::{Deserialize, Serialize};
use std::{
    io::{Read, Write},
    time::{Duration, Instant},
};

use serialport::{ClearBuffer, SerialPort};

use super::{
    drain_inbound, enqueue_write, Transport, TransportCommand, TransportError, INBOUND_CAPACITY,
    OUTBOUND_CAPACITY,
};
use crate::utils::hex_dump;

/// Line settings of a serial medium.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SerialSettings {
    pub port: String,
    #[serde(default = "default_baud")]
    pub baud: u32,
    #[serde(default = "default_data_bits")]
    pub data_bits: u8,
    #[serde(default = "default_stop_bits")]
    pub stop_bits: u8,
}

fn default_baud() -> u32 {
    9600
}

fn default_data_bits() -> u8 {
    8
}

fn default_stop_bits() -> u8 {
    1
}

impl SerialSettings {
    pub fn new(port: impl Into<String>, baud: u32) -> Self {
        Self {
            port: port.into(),
            baud,
            data_bits: default_data_bits(),
            stop_bits: default_stop_bits(),
        }
    }

    /// Modbus RTU inter-frame silence: 3.5 character times.
    pub fn frame_gap(&self) -> Duration {
        let bit_time_us = 1_000_000u64 / self.baud.max(1) as u64;
        let bits_per_byte = self.data_bits as u64 + self.stop_bits as u64 + 1;
        let byte_time_us = bit_time_us * bits_per_byte;
        Duration::from_micros(byte_time_us.saturating_mul(35).saturating_div(10))
    }
}

/// Open a serial port with the requested read timeout, enabling exclusive access on Unix.
pub fn open_serial_port(settings: &SerialSettings, timeout: Duration) -> Result<Box<dyn SerialPort>> {
    let data_bits = match settings.data_bits {
        5 => serialport::DataBits::Five,
        6 => serialport::DataBits::Six,
        7 => serialport::DataBits::Seven,
        _ => serialport::DataBits::Eight,
    };
    let stop_bits = match settings.stop_bits {
        2 => serialport::StopBits::Two,
        _ => serialport::StopBits::One,
    };
    let port = &settings.port;
    let builder = serialport::new(port, settings.baud)
        .data_bits(data_bits)
        .stop_bits(stop_bits)
        .timeout(timeout);

    #[cfg(unix)]
    {
        let mut handle = builder
            .open_native()
            .map_err(|err| anyhow!("Failed to open port {port}: {err}"))?;
        handle
            .set_exclusive(true)
            .map_err(|err| anyhow!("Failed to acquire exclusive access to {port}: {err}"))?;
        Ok(Box::new(handle))
    }

    #[cfg(not(unix))]
    {
        builder
            .open()
            .map_err(|err| anyhow!("Failed to open port {port}: {err}"))
    }
}

/// Serial medium driven by a dedicated I/O thread.
///
/// The thread owns the port: it applies queued writes and input flushes, and
/// forwards received bytes once the line has been silent for one RTU frame gap.
pub struct SerialTransport {
    name: String,
    commands: flume::Sender<TransportCommand>,
    inbound: flume::Receiver<Bytes>,
}

impl SerialTransport {
    pub fn open(name: impl Into<String>, settings: &SerialSettings) -> Result<Self> {
        let name = name.into();
        let port = open_serial_port(settings, Duration::from_millis(10))?;
        let (commands, command_rx) = flume::bounded(OUTBOUND_CAPACITY);
        let (inbound_tx, inbound) = flume::bounded(INBOUND_CAPACITY);
        let gap = settings.frame_gap();

        let worker_name = name.clone();
        std::thread::Builder::new()
            .name(format!("serial-{name}"))
            .spawn(move || {
                if let Err(err) = serial_io_loop(port, &worker_name, gap, command_rx, inbound_tx) {
                    log::warn!("Serial worker for {worker_name} stopped: {err}");
                }
            })?;

        log::info!(
            "Opened serial transport {} on {} @ {} baud",
            name,
            settings.port,
            settings.baud
        );
        Ok(Self {
            name,
            commands,
            inbound,
        })
    }
}

impl Transport for SerialTransport {
    fn name(&self) -> &str {
        &self.name
    }

    fn send(&self, frame: &[u8]) -> Result<usize, TransportError> {
        enqueue_write(&self.commands, frame)
    }

    fn flush_inbound(&self) {
        if let Err(err) = self.commands.try_send(TransportCommand::FlushInput) {
            log::warn!("{}: could not queue input flush: {err}", self.name);
        }
        let dropped = drain_inbound(&self.inbound);
        if dropped > 0 {
            log::debug!("{}: flushed {} queued inbound bytes", self.name, dropped);
        }
    }

    fn inbound(&self) -> flume::Receiver<Bytes> {
        self.inbound.clone()
    }
}

impl Drop for SerialTransport {
    fn drop(&mut self) {
        let _ = self.commands.try_send(TransportCommand::Shutdown);
    }
}

/// I/O loop; must run on its own thread since serial reads block.
fn serial_io_loop(
    mut port: Box<dyn SerialPort>,
    name: &str,
    gap: Duration,
    commands: flume::Receiver<TransportCommand>,
    inbound: flume::Sender<Bytes>,
) -> Result<()> {
    let mut assembling: Vec<u8> = Vec::with_capacity(256);
    let mut last_byte: Option<Instant> = None;

    loop {
        loop {
            match commands.try_recv() {
                Ok(TransportCommand::Write(bytes)) => {
                    log::debug!("{name} >> {}", hex_dump(&bytes));
                    if let Err(err) = port.write_all(&bytes).and_then(|_| port.flush()) {
                        log::warn!("{name}: write failed: {err}");
                    }
                }
                Ok(TransportCommand::FlushInput) => {
                    assembling.clear();
                    last_byte = None;
                    if let Err(err) = port.clear(ClearBuffer::Input) {
                        log::warn!("{name}: failed to clear input buffer: {err}");
                    }
                }
                Ok(TransportCommand::Shutdown) | Err(flume::TryRecvError::Disconnected) => {
                    log::info!("{name}: serial worker exiting");
                    return Ok(());
                }
                Err(flume::TryRecvError::Empty) => break,
            }
        }

        if let Some(t) = last_byte {
            if !assembling.is_empty() && t.elapsed() >= gap {
                forward(name, &mut assembling, &inbound)?;
                last_byte = None;
            }
        }

        let mut buf = [0u8; 256];
        match port.read(&mut buf) {
            Ok(n) if n > 0 => {
                assembling.extend_from_slice(&buf[..n]);
                last_byte = Some(Instant::now());
                if assembling.len() > 768 {
                    forward(name, &mut assembling, &inbound)?;
                    last_byte = None;
                }
            }
            Ok(_) => {}
            Err(e) if e.kind() == std::io::ErrorKind::TimedOut => {}
            Err(e) => {
                log::warn!("{name}: read error: {e}");
                std::thread::sleep(Duration::from_millis(50));
            }
        }
    }
}

fn forward(name: &str, assembling: &mut Vec<u8>, inbound: &flume::Sender<Bytes>) -> Result<()> {
    log::debug!("{name} << {}", hex_dump(assembling));
    inbound
        .send(Bytes::from(std::mem::take(assembling)))
        .map_err(|_| anyhow!("inbound channel closed"))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_frame_gap_at_9600() {
        let settings = SerialSettings::new("/dev/null", 9600);
        // 104us per bit * 10 bits * 3.5
        assert_eq!(settings.frame_gap(), Duration::from_micros(3640));
    }

    #[test]
    fn test_settings_defaults_from_json() {
        let settings: SerialSettings = serde_json::from_str(r#"{"port":"COM3"}"#).unwrap();
        assert_eq!(settings.baud, 9600);
        assert_eq!(settings.data_bits, 8);
        assert_eq!(settings.stop_bits, 1);
    }

    #[test]
    fn test_flush_with_full_command_queue() {
        let (commands, command_rx) = flume::bounded(1);
        let (inbound_tx, inbound) = flume::bounded(4);
        let transport = SerialTransport {
            name: "ttyTEST".to_string(),
            commands,
            inbound,
        };
        transport.send(&[0x01, 0x03]).unwrap();
        inbound_tx.send(Bytes::from_static(&[0xAA, 0xBB])).unwrap();

        transport.flush_inbound();
        assert!(transport.inbound().is_empty());
        // the pending write is kept, the flush command was not queued
        assert_eq!(command_rx.len(), 1);
        assert!(matches!(command_rx.try_recv(), Ok(TransportCommand::Write(_))));
        assert_eq!(transport.send(&[0x02]), Ok(1));
    }
}
