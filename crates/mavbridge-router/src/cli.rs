//! Command line host for the router.

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use clap::Parser;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use crate::config::RouterConfig;
use crate::router::Router;
use crate::serial::{DevicePathHost, SerialHost};

/// MAVLink bridge between a serial vehicle link and a cloud relay.
#[derive(Debug, Parser)]
#[command(name = "mavbridge")]
#[command(about = "MAVLink bridge: serial vehicle link to cloud relay", long_about = None)]
pub struct Cli {
    /// Router configuration (TOML or JSON).
    #[arg(short, long, default_value = "/etc/mavbridge/mavbridge.toml")]
    pub config: PathBuf,

    /// Serial character device of the vehicle controller.
    #[arg(short, long, env = "MAVBRIDGE_DEVICE")]
    pub device: Option<PathBuf>,

    /// How often the device path is checked for presence, in milliseconds.
    #[arg(long, default_value = "500")]
    pub device_poll_ms: u64,

    /// Emit logs as JSON lines.
    #[arg(long)]
    pub json_logs: bool,
}

impl Cli {
    /// Runs the router until Ctrl-C.
    pub async fn run(self) -> Result<()> {
        let config = RouterConfig::from_file(&self.config)
            .with_context(|| format!("loading {}", self.config.display()))?;

        let cancel = CancellationToken::new();
        let host: Option<Arc<dyn SerialHost>> = match &self.device {
            Some(path) => Some(DevicePathHost::spawn(
                path,
                Duration::from_millis(self.device_poll_ms),
                cancel.clone(),
            )),
            None => None,
        };

        let router = Router::new(host);
        let mut state = router.subscribe_state();
        router.start(config)?;

        let mut stats = router.subscribe_stats();
        let mut last_logged = tokio::time::Instant::now();
        loop {
            tokio::select! {
                _ = tokio::signal::ctrl_c() => {
                    info!("interrupt received, stopping");
                    break;
                }
                res = state.changed() => {
                    if res.is_err() {
                        break;
                    }
                    let current = state.borrow_and_update().clone();
                    info!(state = %current, "router");
                }
                res = stats.changed() => {
                    if res.is_err() {
                        break;
                    }
                    if last_logged.elapsed() >= Duration::from_secs(60) {
                        last_logged = tokio::time::Instant::now();
                        let snapshot = *stats.borrow_and_update();
                        info!(
                            uplink_frames = snapshot.uplink_frames,
                            downlink_frames = snapshot.downlink_frames,
                            injected_frames = snapshot.injected_frames,
                            dropped_frames = snapshot.dropped_frames,
                            "link stats"
                        );
                    }
                }
            }
        }

        router.stop().await;
        cancel.cancel();
        let totals = router.stats();
        match serde_json::to_string(&totals) {
            Ok(json) => info!(stats = %json, "final stats"),
            Err(e) => warn!(error = %e, "failed to encode final stats"),
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_args() {
        let cli = Cli::parse_from([
            "mavbridge",
            "--config",
            "/tmp/bridge.toml",
            "--device",
            "/dev/ttyACM0",
            "--json-logs",
        ]);
        assert_eq!(cli.config, PathBuf::from("/tmp/bridge.toml"));
        assert_eq!(cli.device, Some(PathBuf::from("/dev/ttyACM0")));
        assert_eq!(cli.device_poll_ms, 500);
        assert!(cli.json_logs);
    }

    #[test]
    fn test_defaults() {
        let cli = Cli::parse_from(["mavbridge"]);
        assert_eq!(cli.config, PathBuf::from("/etc/mavbridge/mavbridge.toml"));
        assert!(!cli.json_logs);
    }
}
