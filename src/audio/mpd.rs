//! Embedded MPD instances, one per Bluetooth speaker.
//!
//! Each enabled device gets its own `mpd` subprocess on a unique port
//! (6600..6609) targeting that device's PulseAudio sink, so external
//! integrations get one media player per speaker. Speaker button
//! presses arriving over AVRCP/MPRIS are bridged to the instance over
//! MPD's line protocol.

use log::{debug, info, warn};
use std::collections::HashMap;
use std::path::PathBuf;
use std::process::Stdio;
use std::time::Duration;
use tokio::io::{AsyncBufReadExt, AsyncReadExt, AsyncWriteExt, BufReader};
use tokio::net::TcpStream;
use tokio::process::{Child, Command};

const MPD_HOST: &str = "127.0.0.1";
const CLIENT_CONNECT_RETRIES: u32 = 5;
const STOP_GRACE: Duration = Duration::from_secs(5);

/// Minimal MPD line-protocol client, enough for the AVRCP bridge.
struct MpdClient {
    reader: BufReader<tokio::net::tcp::OwnedReadHalf>,
    writer: tokio::net::tcp::OwnedWriteHalf,
}

impl MpdClient {
    async fn connect(port: u16) -> std::io::Result<Self> {
        let stream = TcpStream::connect((MPD_HOST, port)).await?;
        let (read, writer) = stream.into_split();
        let mut reader = BufReader::new(read);
        let mut greeting = String::new();
        reader.read_line(&mut greeting).await?;
        if !greeting.starts_with("OK MPD") {
            return Err(std::io::Error::other(format!("unexpected MPD greeting: {greeting:?}")));
        }
        debug!("MPD client connected (port {port}): {}", greeting.trim());
        Ok(Self { reader, writer })
    }

    /// Send one command and collect the response lines up to OK/ACK.
    async fn command(&mut self, cmd: &str) -> std::io::Result<Vec<String>> {
        self.writer.write_all(format!("{cmd}\n").as_bytes()).await?;
        let mut lines = Vec::new();
        loop {
            let mut line = String::new();
            if self.reader.read_line(&mut line).await? == 0 {
                return Err(std::io::Error::other("MPD connection closed"));
            }
            let line = line.trim_end().to_string();
            if line == "OK" {
                return Ok(lines);
            }
            if line.starts_with("ACK") {
                return Err(std::io::Error::other(line));
            }
            lines.push(line);
        }
    }

    async fn status(&mut self) -> std::io::Result<HashMap<String, String>> {
        let lines = self.command("status").await?;
        Ok(parse_key_values(&lines))
    }
}

fn parse_key_values(lines: &[String]) -> HashMap<String, String> {
    lines
        .iter()
        .filter_map(|line| {
            line.split_once(':').map(|(k, v)| (k.trim().to_string(), v.trim().to_string()))
        })
        .collect()
}

/// One embedded MPD daemon plus its control connection.
pub struct MpdBridge {
    address: String,
    port: u16,
    speaker_name: String,
    hw_volume: u32,
    verbose: bool,
    tmp_dir: PathBuf,
    process: Option<Child>,
    client: Option<MpdClient>,
    stderr_task: Option<tokio::task::JoinHandle<()>>,
}

impl MpdBridge {
    pub fn new(address: &str, port: u16, speaker_name: &str, hw_volume: u32, verbose: bool) -> Self {
        Self {
            address: address.to_string(),
            port,
            speaker_name: speaker_name.to_string(),
            hw_volume,
            verbose,
            tmp_dir: std::env::temp_dir().join(format!("mpd_{port}")),
            process: None,
            client: None,
            stderr_task: None,
        }
    }

    pub fn port(&self) -> u16 {
        self.port
    }

    pub fn is_running(&self) -> bool {
        self.process.is_some()
    }

    /// Generate config, start the daemon, connect the client, and apply
    /// the configured hardware volume.
    pub async fn start(&mut self, sink_name: &str) -> crate::errors::Result<()> {
        if self.process.is_some() {
            return Ok(());
        }
        std::fs::create_dir_all(self.tmp_dir.join("playlists"))?;
        let conf_path = self.tmp_dir.join("mpd.conf");
        std::fs::write(&conf_path, self.render_config(sink_name))?;
        debug!("MPD config written to {}", conf_path.display());

        let mut child = Command::new("mpd")
            .arg("--no-daemon")
            .arg("--stderr")
            .arg(&conf_path)
            .stdout(Stdio::null())
            .stderr(Stdio::piped())
            .spawn()
            .map_err(|e| crate::errors::Error::Subprocess(format!("mpd spawn failed: {e}")))?;

        // Give it a moment; an immediate exit means a config/port problem.
        tokio::time::sleep(Duration::from_millis(500)).await;
        if let Ok(Some(status)) = child.try_wait() {
            let mut stderr_text = String::new();
            if let Some(mut stderr) = child.stderr.take() {
                let _ = stderr.read_to_string(&mut stderr_text).await;
            }
            return Err(crate::errors::Error::Subprocess(format!(
                "mpd exited at startup ({status}): {}",
                stderr_text.trim()
            )));
        }

        if let Some(stderr) = child.stderr.take() {
            let port = self.port;
            self.stderr_task = Some(tokio::spawn(async move {
                let mut lines = BufReader::new(stderr).lines();
                while let Ok(Some(line)) = lines.next_line().await {
                    if !line.is_empty() {
                        info!("[mpd:{port}] {line}");
                    }
                }
            }));
        }
        info!("MPD daemon started (port {})", self.port);
        self.process = Some(child);

        self.connect_client().await;
        let hw_volume = self.hw_volume;
        self.set_volume(hw_volume).await;
        info!("MPD started for {} on port {}", self.address, self.port);
        Ok(())
    }

    /// Ask MPD to exit, escalate to SIGKILL after the grace period, and
    /// cancel the stderr reader.
    pub async fn stop(&mut self) {
        if let Some(mut client) = self.client.take() {
            // MPD's own shutdown command; the socket drops without an OK.
            let _ = client.writer.write_all(b"kill\n").await;
        }
        if let Some(mut child) = self.process.take() {
            match tokio::time::timeout(STOP_GRACE, child.wait()).await {
                Ok(_) => {}
                Err(_) => {
                    warn!("MPD (port {}) ignored shutdown, killing", self.port);
                    let _ = child.kill().await;
                }
            }
            info!("MPD daemon stopped (port {})", self.port);
        }
        if let Some(task) = self.stderr_task.take() {
            task.abort();
            let _ = task.await;
        }
    }

    fn render_config(&self, sink_name: &str) -> String {
        let tmp = self.tmp_dir.display();
        let log_level = if self.verbose { "verbose" } else { "default" };
        format!(
            "playlist_directory  \"{tmp}/playlists\"\n\
             state_file          \"{tmp}/state\"\n\
             pid_file            \"{tmp}/pid\"\n\
             bind_to_address     \"0.0.0.0\"\n\
             port                \"{port}\"\n\
             log_level           \"{log_level}\"\n\
             \n\
             audio_output {{\n\
             \x20   type    \"pulse\"\n\
             \x20   name    \"{name}\"\n\
             \x20   sink    \"{sink}\"\n\
             }}\n\
             \n\
             input {{\n\
             \x20   plugin  \"curl\"\n\
             }}\n",
            port = self.port,
            name = escape_conf(&self.speaker_name),
            sink = escape_conf(sink_name),
        )
    }

    async fn connect_client(&mut self) {
        for attempt in 0..CLIENT_CONNECT_RETRIES {
            match MpdClient::connect(self.port).await {
                Ok(client) => {
                    self.client = Some(client);
                    return;
                }
                Err(_) if attempt + 1 < CLIENT_CONNECT_RETRIES => {
                    tokio::time::sleep(Duration::from_millis(500)).await;
                }
                Err(e) => {
                    warn!("Could not connect MPD client after retries (port {}): {e}", self.port)
                }
            }
        }
    }

    async fn ensure_client(&mut self) {
        if let Some(client) = self.client.as_mut() {
            if client.command("ping").await.is_ok() {
                return;
            }
            self.client = None;
        }
        self.connect_client().await;
    }

    /// Forward an AVRCP/MPRIS command to this instance.
    pub async fn handle_command(&mut self, command: &str, detail: &str) {
        self.ensure_client().await;
        let Some(client) = self.client.as_mut() else { return };

        let result = match command {
            "Play" => client.command("play").await.map(|_| ()),
            "Pause" => client.command("pause 1").await.map(|_| ()),
            "PlayPause" => match client.status().await {
                Ok(status) if status.get("state").map(String::as_str) == Some("play") => {
                    client.command("pause 1").await.map(|_| ())
                }
                Ok(_) => client.command("play").await.map(|_| ()),
                Err(e) => Err(e),
            },
            "Stop" => client.command("stop").await.map(|_| ()),
            "Next" => client.command("next").await.map(|_| ()),
            "Previous" => client.command("previous").await.map(|_| ()),
            "Volume" => {
                let vol = detail.trim_end_matches('%').split('.').next().unwrap_or("");
                match vol.parse::<u32>() {
                    Ok(v) => client.command(&format!("setvol {}", v.min(100))).await.map(|_| ()),
                    Err(_) => Ok(()),
                }
            }
            _ => Ok(()),
        };
        if let Err(e) = result {
            warn!("MPD command {command} failed (port {}): {e}", self.port);
            self.client = None;
        }
    }

    pub async fn set_volume(&mut self, volume_pct: u32) {
        self.ensure_client().await;
        let Some(client) = self.client.as_mut() else { return };
        let vol = volume_pct.clamp(1, 100);
        if let Err(e) = client.command(&format!("setvol {vol}")).await {
            debug!("MPD set_volume failed (port {}): {e}", self.port);
            self.client = None;
        }
    }
}

fn escape_conf(value: &str) -> String {
    value.replace('\\', "\\\\").replace('"', "\\\"")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn config_targets_the_sink_and_port() {
        let bridge =
            MpdBridge::new("AA:BB:CC:DD:EE:01", 6603, "Living \"Room\"", 50, false);
        let conf = bridge.render_config("bluez_sink.AA_BB_CC_DD_EE_01.a2dp_sink");
        assert!(conf.contains("port                \"6603\""));
        assert!(conf.contains("sink    \"bluez_sink.AA_BB_CC_DD_EE_01.a2dp_sink\""));
        assert!(conf.contains("name    \"Living \\\"Room\\\"\""));
        assert!(conf.contains("type    \"pulse\""));
        assert!(conf.contains("log_level           \"default\""));
    }

    #[test]
    fn parses_status_lines() {
        let lines = vec![
            "volume: 50".to_string(),
            "state: play".to_string(),
            "song: 3".to_string(),
        ];
        let map = parse_key_values(&lines);
        assert_eq!(map.get("state").map(String::as_str), Some("play"));
        assert_eq!(map.get("volume").map(String::as_str), Some("50"));
    }
}
