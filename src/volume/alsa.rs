//! ALSA software volume adapter: `amixer` subprocess on a named
//! card/control, for DAC HATs with analog or S/PDIF output and no
//! hardware volume control of their own.

use super::Device;
use async_trait::async_trait;
use std::sync::atomic::{AtomicBool, Ordering};
use tokio::process::Command;

pub struct AlsaMixer {
    card: String,
    control: String,
    powered: AtomicBool,
}

impl AlsaMixer {
    pub fn new(card: impl Into<String>, control: impl Into<String>) -> Self {
        AlsaMixer {
            card: card.into(),
            control: control.into(),
            powered: AtomicBool::new(false),
        }
    }

    async fn amixer(&self, args: &[&str]) -> String {
        let mut cmd = Command::new("amixer");
        cmd.arg("-c").arg(&self.card).args(args);
        match cmd.output().await {
            Ok(output) => {
                if !output.status.success() {
                    tracing::warn!(
                        "amixer failed (rc={:?}): {}",
                        output.status.code(),
                        String::from_utf8_lossy(&output.stderr).trim()
                    );
                }
                String::from_utf8_lossy(&output.stdout).into_owned()
            }
            Err(e) => {
                tracing::error!("amixer not found: {}", e);
                String::new()
            }
        }
    }
}

/// Parses the first `[NN%]` style percentage out of `amixer sget` output.
fn parse_percent(output: &str) -> Option<u8> {
    for line in output.lines() {
        if let Some(bracket_start) = line.find('[') {
            if let Some(percent_pos) = line[bracket_start..].find('%') {
                let digits = &line[bracket_start + 1..bracket_start + percent_pos];
                if let Ok(value) = digits.parse::<u8>() {
                    return Some(value);
                }
            }
        }
    }
    None
}

#[async_trait]
impl Device for AlsaMixer {
    async fn write_volume(&self, value: u8) {
        let percent = format!("{value}%");
        self.amixer(&["sset", &self.control, &percent]).await;
    }

    async fn read_volume(&self) -> u8 {
        let output = self.amixer(&["sget", &self.control]).await;
        parse_percent(&output).unwrap_or(0)
    }

    async fn read_power(&self) -> bool {
        self.powered.load(Ordering::SeqCst)
    }

    async fn write_power(&self, on: bool) {
        let arg = if on { "unmute" } else { "mute" };
        self.amixer(&["sset", &self.control, arg]).await;
        self.powered.store(on, Ordering::SeqCst);
    }
}

#[cfg(test)]
mod tests {
    use super::parse_percent;

    #[test]
    fn parses_percent_from_amixer_sget_output() {
        let sample = "Simple mixer control 'Digital',0\n  \
            Playback channels: Front Left - Front Right\n  \
            Limits: Playback 0 - 255\n  \
            Mono:\n  \
            Front Left: Playback 200 [78%] [-4.50dB] [on]\n";
        assert_eq!(parse_percent(sample), Some(78));
    }

    #[test]
    fn missing_percent_yields_none() {
        assert_eq!(parse_percent("no useful output here"), None);
    }
}
