//! Multi-zone amp volume adapter: UDP datagrams with counter-tagged
//! command strings, grounded on a Control4-style amplifier protocol.
//!
//! Frame shape: `0s2a{nn} {command}\r\n` where `nn` is a random counter
//! in `[10, 99]`. Volume: `amp.chvol {zone} {level}`. Power/source:
//! `amp.out {zone} {input}` (`00` selects no input, i.e. off).

use super::Device;
use async_trait::async_trait;
use rand::Rng;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;
use tokio::net::UdpSocket;

const AMP_PORT: u16 = 8750;
const SEND_TIMEOUT: Duration = Duration::from_secs(2);

pub struct MultiZoneAmp {
    host: String,
    zone: String,
    input_id: String,
    last_volume: std::sync::atomic::AtomicU8,
    powered: AtomicBool,
}

impl MultiZoneAmp {
    pub fn new(host: &str, zone: &str, input_id: &str) -> Self {
        MultiZoneAmp {
            host: host.to_string(),
            zone: zone.to_string(),
            input_id: input_id.to_string(),
            last_volume: std::sync::atomic::AtomicU8::new(0),
            powered: AtomicBool::new(false),
        }
    }

    async fn send(&self, command: &str) {
        let counter: u32 = rand::thread_rng().gen_range(10..=99);
        let message = format!("0s2a{counter} {command}\r\n");
        let result = send_udp(&self.host, AMP_PORT, message.as_bytes()).await;
        if let Err(e) = result {
            tracing::warn!("multi-zone amp at {} unreachable: {}", self.host, e);
        }
    }
}

async fn send_udp(host: &str, port: u16, payload: &[u8]) -> std::io::Result<()> {
    let socket = UdpSocket::bind("0.0.0.0:0").await?;
    socket.connect((host, port)).await?;
    tokio::time::timeout(SEND_TIMEOUT, socket.send(payload)).await??;
    Ok(())
}

#[async_trait]
impl Device for MultiZoneAmp {
    async fn write_volume(&self, value: u8) {
        self.send(&format!("amp.chvol {} {}", self.zone, value)).await;
        self.last_volume.store(value, Ordering::SeqCst);
    }

    async fn read_volume(&self) -> u8 {
        // The UDP protocol has no query command; report the last value
        // this adapter itself sent.
        self.last_volume.load(Ordering::SeqCst)
    }

    async fn read_power(&self) -> bool {
        self.powered.load(Ordering::SeqCst)
    }

    async fn write_power(&self, on: bool) {
        let input = if on { self.input_id.as_str() } else { "00" };
        self.send(&format!("amp.out {} {}", self.zone, input)).await;
        self.powered.store(on, Ordering::SeqCst);
    }
}
