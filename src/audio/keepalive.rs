//! Keep-alive streaming to stop speakers from auto-suspending.
//!
//! Many Bluetooth speakers enter standby after 30-120 seconds without
//! audio. A short inaudible burst every few seconds keeps them awake.
//! `silence` is pure zero PCM; some firmware detects digital silence
//! and suspends anyway, so `infrasound` plays a 2 Hz sine far below
//! both the hearing threshold (~20 Hz) and audibility (-50 dB).

use crate::store::KeepAliveMethod;
use log::{debug, info};
use std::f64::consts::PI;
use std::process::Stdio;
use std::time::Duration;
use tokio::io::AsyncWriteExt;
use tokio::process::Command;

pub const SAMPLE_RATE: u32 = 44_100;
pub const CHANNELS: u32 = 1;
const BURST_SECONDS: f64 = 1.0;
const INTERVAL: Duration = Duration::from_secs(5);

const INFRASOUND_FREQ: f64 = 2.0;
const INFRASOUND_AMPLITUDE: i16 = 100; // of 32767 → about -50 dB

pub fn generate_burst(method: KeepAliveMethod) -> Vec<u8> {
    match method {
        KeepAliveMethod::Silence => generate_silence(),
        KeepAliveMethod::Infrasound => generate_infrasound(),
    }
}

fn generate_silence() -> Vec<u8> {
    let samples = (SAMPLE_RATE as f64 * BURST_SECONDS) as usize;
    vec![0u8; samples * 2]
}

fn generate_infrasound() -> Vec<u8> {
    let samples = (SAMPLE_RATE as f64 * BURST_SECONDS) as usize;
    let mut data = Vec::with_capacity(samples * 2);
    for i in 0..samples {
        let value = (INFRASOUND_AMPLITUDE as f64
            * (2.0 * PI * INFRASOUND_FREQ * i as f64 / SAMPLE_RATE as f64).sin())
            as i16;
        data.extend_from_slice(&value.to_le_bytes());
    }
    data
}

/// Handle for one device's keep-alive loop. Dropping it does not stop
/// the stream; call [`KeepAlive::stop`].
pub struct KeepAlive {
    task: tokio::task::JoinHandle<()>,
    pub method: KeepAliveMethod,
}

impl KeepAlive {
    /// Start streaming bursts to `sink_name` until stopped.
    pub fn start(sink_name: String, method: KeepAliveMethod) -> Self {
        let pcm = generate_burst(method);
        let task = tokio::spawn(async move {
            loop {
                if let Err(e) = stream_burst(&sink_name, &pcm).await {
                    // Stream failures never affect device state.
                    debug!("Keep-alive stream error for {sink_name}: {e}");
                }
                tokio::time::sleep(INTERVAL).await;
            }
        });
        info!("Keep-alive started (method={method:?})");
        Self { task, method }
    }

    pub async fn stop(self) {
        self.task.abort();
        let _ = self.task.await;
        info!("Keep-alive stopped");
    }
}

async fn stream_burst(sink_name: &str, pcm: &[u8]) -> std::io::Result<()> {
    let mut child = Command::new("pacat")
        .arg("--device")
        .arg(sink_name)
        .arg("--format=s16le")
        .arg(format!("--rate={SAMPLE_RATE}"))
        .arg(format!("--channels={CHANNELS}"))
        .stdin(Stdio::piped())
        .stdout(Stdio::null())
        .stderr(Stdio::null())
        .spawn()?;
    if let Some(mut stdin) = child.stdin.take() {
        stdin.write_all(pcm).await?;
        stdin.shutdown().await?;
    }
    child.wait().await?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn silence_is_all_zero_pcm() {
        let pcm = generate_burst(KeepAliveMethod::Silence);
        assert_eq!(pcm.len(), SAMPLE_RATE as usize * 2);
        assert!(pcm.iter().all(|b| *b == 0));
    }

    #[test]
    fn infrasound_is_bounded_and_nonsilent() {
        let pcm = generate_burst(KeepAliveMethod::Infrasound);
        assert_eq!(pcm.len(), SAMPLE_RATE as usize * 2);
        let samples: Vec<i16> = pcm
            .chunks_exact(2)
            .map(|c| i16::from_le_bytes([c[0], c[1]]))
            .collect();
        assert!(samples.iter().any(|s| *s != 0));
        assert!(samples.iter().all(|s| s.abs() <= INFRASOUND_AMPLITUDE));
        // One full 2 Hz period in a 1 s burst crosses zero twice.
        let crossings = samples
            .windows(2)
            .filter(|w| (w[0] >= 0) != (w[1] >= 0))
            .count();
        assert!(crossings >= 2);
    }
}
