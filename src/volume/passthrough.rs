//! Passthrough volume adapter: a no-op volume surface for analog
//! outputs with no software-controllable level (e.g. a fixed-line-out
//! amp). `power_on`/`power_off` still model mute/unmute so the router's
//! `off` button and power cache behave consistently.

use super::Device;
use async_trait::async_trait;
use std::sync::atomic::{AtomicBool, Ordering};

pub struct Passthrough {
    powered: AtomicBool,
}

impl Passthrough {
    pub fn new() -> Self {
        Passthrough {
            powered: AtomicBool::new(true),
        }
    }
}

impl Default for Passthrough {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl Device for Passthrough {
    async fn write_volume(&self, _value: u8) {}

    async fn read_volume(&self) -> u8 {
        100
    }

    async fn read_power(&self) -> bool {
        self.powered.load(Ordering::SeqCst)
    }

    async fn write_power(&self, on: bool) {
        self.powered.store(on, Ordering::SeqCst);
    }
}
