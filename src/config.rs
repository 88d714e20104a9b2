use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use serde::Deserialize;

/// Top-level coordinator configuration, loaded from a YAML file.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct CoordinatorConfig {
    /// Address the HTTP/WebSocket server listens on.
    pub listen_addr: String,
    /// Path to the YAML application catalog.
    pub catalog_path: PathBuf,
    /// Script spawned as `startVM <id> <videoPort> <audioPort> <inputPort>`.
    pub start_script: PathBuf,
    /// Script spawned as `stopVM <id>`.
    pub stop_script: PathBuf,
    /// Verbal video codec name handed to the codec registry.
    pub video_codec: String,
    pub screen: ScreenConfig,
    pub webrtc: WebRtcConfig,
}

/// Sandbox screen dimensions, carried through the relayer for letterboxing.
#[derive(Debug, Clone, Copy, Deserialize)]
pub struct ScreenConfig {
    pub width: u16,
    pub height: u16,
}

/// Process-wide WebRTC settings, applied once at startup and shared by every
/// session for its whole lifetime.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct WebRtcConfig {
    /// Multiplex all ICE traffic on this one UDP port.
    pub single_udp_port: Option<u16>,
    /// Restrict ICE to this ephemeral port range.
    pub udp_port_range: Option<PortRange>,
    /// Advertise this address as the host ICE candidate (1:1 NAT).
    pub nat_1to1_ip: Option<String>,
    /// Skip the library's built-in RTCP/NACK/TWCC interceptors.
    pub disable_default_interceptors: bool,
    pub ice_servers: Vec<String>,
}

#[derive(Debug, Clone, Copy, Deserialize)]
pub struct PortRange {
    pub min: u16,
    pub max: u16,
}

impl Default for CoordinatorConfig {
    fn default() -> Self {
        Self {
            listen_addr: "0.0.0.0:8080".to_string(),
            catalog_path: PathBuf::from("appconf/apps.yml"),
            start_script: PathBuf::from("./startVM.sh"),
            stop_script: PathBuf::from("./stopVM.sh"),
            video_codec: "vpx".to_string(),
            screen: ScreenConfig::default(),
            webrtc: WebRtcConfig::default(),
        }
    }
}

impl Default for ScreenConfig {
    fn default() -> Self {
        Self { width: 1280, height: 720 }
    }
}

impl Default for WebRtcConfig {
    fn default() -> Self {
        Self {
            single_udp_port: None,
            udp_port_range: None,
            nat_1to1_ip: None,
            disable_default_interceptors: false,
            ice_servers: vec!["stun:stun.l.google.com:19302".to_string()],
        }
    }
}

impl CoordinatorConfig {
    pub fn load(path: &Path) -> Result<Self> {
        let raw = std::fs::read_to_string(path)
            .with_context(|| format!("read config {}", path.display()))?;
        let cfg: CoordinatorConfig = serde_yaml::from_str(&raw).context("parse config yaml")?;
        cfg.validate()?;
        Ok(cfg)
    }

    pub fn validate(&self) -> Result<()> {
        if self.webrtc.single_udp_port.is_some() && self.webrtc.udp_port_range.is_some() {
            anyhow::bail!("webrtc.single_udp_port and webrtc.udp_port_range are mutually exclusive");
        }
        if let Some(range) = &self.webrtc.udp_port_range {
            if range.min == 0 || range.min > range.max {
                anyhow::bail!("invalid webrtc.udp_port_range {}-{}", range.min, range.max);
            }
        }
        if self.screen.width == 0 || self.screen.height == 0 {
            anyhow::bail!("screen dimensions must be non-zero");
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults_are_valid() {
        let cfg = CoordinatorConfig::default();
        assert!(cfg.validate().is_ok());
        assert_eq!(cfg.video_codec, "vpx");
        assert_eq!(cfg.webrtc.ice_servers.len(), 1);
    }

    #[test]
    fn test_parse_partial_yaml() {
        let cfg: CoordinatorConfig = serde_yaml::from_str(
            "listen_addr: 127.0.0.1:9000\nscreen:\n  width: 800\n  height: 600\n",
        )
        .unwrap();
        assert_eq!(cfg.listen_addr, "127.0.0.1:9000");
        assert_eq!(cfg.screen.width, 800);
        assert_eq!(cfg.start_script, PathBuf::from("./startVM.sh"));
    }

    #[test]
    fn test_single_port_and_range_are_exclusive() {
        let cfg: CoordinatorConfig = serde_yaml::from_str(
            "webrtc:\n  single_udp_port: 8443\n  udp_port_range:\n    min: 20000\n    max: 20100\n",
        )
        .unwrap();
        assert!(cfg.validate().is_err());
    }

    #[test]
    fn test_inverted_port_range_is_rejected() {
        let cfg: CoordinatorConfig =
            serde_yaml::from_str("webrtc:\n  udp_port_range:\n    min: 30000\n    max: 20000\n")
                .unwrap();
        assert!(cfg.validate().is_err());
    }
}
