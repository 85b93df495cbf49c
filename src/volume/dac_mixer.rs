//! DAC-mixer volume adapter: HTTP to a local mixer daemon exposing
//! `power`, `mute`, and `volume` entities (e.g. an ESPHome-style REST
//! API on a directly-driven DAC controller).

use super::Device;
use async_trait::async_trait;
use std::time::Duration;

const REQUEST_TIMEOUT: Duration = Duration::from_secs(2);

pub struct DacMixer {
    base_url: String,
    client: reqwest::Client,
}

impl DacMixer {
    pub fn new(host: &str) -> Self {
        DacMixer {
            base_url: format!("http://{host}"),
            client: reqwest::Client::new(),
        }
    }
}

#[async_trait]
impl Device for DacMixer {
    async fn write_volume(&self, value: u8) {
        let url = format!("{}/number/volume/set", self.base_url);
        let result = self
            .client
            .post(&url)
            .query(&[("value", value.to_string())])
            .timeout(REQUEST_TIMEOUT)
            .send()
            .await;
        if let Err(e) = result {
            tracing::warn!("DAC mixer at {} unreachable: {}", self.base_url, e);
        }
    }

    async fn read_volume(&self) -> u8 {
        let url = format!("{}/number/volume", self.base_url);
        match self.client.get(&url).timeout(REQUEST_TIMEOUT).send().await {
            Ok(resp) => match resp.json::<serde_json::Value>().await {
                Ok(body) => body
                    .get("value")
                    .and_then(|v| v.as_f64())
                    .map(|v| v.round() as u8)
                    .unwrap_or(0),
                Err(_) => 0,
            },
            Err(e) => {
                tracing::warn!("could not read DAC mixer volume: {}", e);
                0
            }
        }
    }

    async fn read_power(&self) -> bool {
        let url = format!("{}/switch/power", self.base_url);
        match self.client.get(&url).timeout(REQUEST_TIMEOUT).send().await {
            Ok(resp) => match resp.json::<serde_json::Value>().await {
                Ok(body) => body.get("value").and_then(|v| v.as_bool()).unwrap_or(false),
                Err(_) => false,
            },
            Err(e) => {
                tracing::warn!("could not read DAC mixer power state: {}", e);
                false
            }
        }
    }

    async fn write_power(&self, on: bool) {
        let path = if on {
            "switch/power/turn_on"
        } else {
            "switch/power/turn_off"
        };
        let url = format!("{}/{}", self.base_url, path);
        if let Err(e) = self.client.post(&url).timeout(REQUEST_TIMEOUT).send().await {
            tracing::warn!("could not set DAC mixer power: {}", e);
        }
    }

    async fn write_balance(&self, balance: i8) {
        let url = format!("{}/number/balance/set", self.base_url);
        let result = self
            .client
            .post(&url)
            .query(&[("value", balance.to_string())])
            .timeout(REQUEST_TIMEOUT)
            .send()
            .await;
        if let Err(e) = result {
            tracing::warn!("could not set DAC mixer balance: {}", e);
        }
    }

    async fn read_balance(&self) -> i8 {
        let url = format!("{}/number/balance", self.base_url);
        match self.client.get(&url).timeout(REQUEST_TIMEOUT).send().await {
            Ok(resp) => match resp.json::<serde_json::Value>().await {
                Ok(body) => body
                    .get("value")
                    .and_then(|v| v.as_i64())
                    .map(|v| v as i8)
                    .unwrap_or(0),
                Err(_) => 0,
            },
            Err(_) => 0,
        }
    }
}
