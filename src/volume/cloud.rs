//! Cloud-speaker volume adapter: HTTP/XML to the device's own local
//! control API (as opposed to the generic UPnP `RenderingControl`
//! service a third-party UPnP renderer exposes). Grounded on the same
//! shape a cloud-speaker *player* defaults to: its own local HTTP
//! endpoint, not a shared UPnP profile.

use super::Device;
use async_trait::async_trait;
use std::time::Duration;

const REQUEST_TIMEOUT: Duration = Duration::from_secs(2);

pub struct CloudSpeaker {
    base_url: String,
    client: reqwest::Client,
}

impl CloudSpeaker {
    pub fn new(base_url: impl Into<String>) -> Self {
        CloudSpeaker {
            base_url: base_url.into(),
            client: reqwest::Client::new(),
        }
    }
}

#[async_trait]
impl Device for CloudSpeaker {
    async fn write_volume(&self, value: u8) {
        let url = format!("{}/MediaRenderer/RenderingControl/Control", self.base_url);
        let body = format!(
            "<u:SetVolume><InstanceID>0</InstanceID><Channel>Master</Channel>\
<DesiredVolume>{value}</DesiredVolume></u:SetVolume>"
        );
        let result = self
            .client
            .post(&url)
            .header("Content-Type", "text/xml")
            .timeout(REQUEST_TIMEOUT)
            .body(body)
            .send()
            .await;
        if let Err(e) = result {
            tracing::warn!("cloud speaker at {} unreachable: {}", self.base_url, e);
        }
    }

    async fn read_volume(&self) -> u8 {
        let url = format!("{}/status/volume", self.base_url);
        match self.client.get(&url).timeout(REQUEST_TIMEOUT).send().await {
            Ok(resp) => match resp.text().await {
                Ok(body) => body
                    .find("<Volume>")
                    .and_then(|start| {
                        let rest = &body[start + 8..];
                        rest.find("</Volume>")
                            .and_then(|end| rest[..end].parse::<u8>().ok())
                    })
                    .unwrap_or(0),
                Err(_) => 0,
            },
            Err(e) => {
                tracing::warn!("could not read cloud speaker volume: {}", e);
                0
            }
        }
    }

    async fn read_power(&self) -> bool {
        let url = format!("{}/status/transportState", self.base_url);
        self.client
            .get(&url)
            .timeout(REQUEST_TIMEOUT)
            .send()
            .await
            .is_ok()
    }

    async fn write_power(&self, on: bool) {
        // Cloud speakers in this taxonomy row have no discrete power
        // rail; "power" is modeled as play/pause of the shared group.
        let path = if on { "play" } else { "pause" };
        let url = format!("{}/{}", self.base_url, path);
        if let Err(e) = self.client.post(&url).timeout(REQUEST_TIMEOUT).send().await {
            tracing::warn!("could not toggle cloud speaker transport: {}", e);
        }
    }
}
