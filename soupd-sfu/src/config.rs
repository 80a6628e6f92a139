//! SFU Configuration

use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::time::Duration;

/// Engine request timeout used when none is configured
pub const DEFAULT_REQUEST_TIMEOUT_MS: u64 = 5000;

/// Transport max bitrate (bits/s) used when neither an admin cap nor an offer
/// bandwidth applies
pub const DEFAULT_MAX_BITRATE: u64 = 1_000_000;

/// SFU configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SfuConfig {
    /// Path to the media-engine executable
    pub worker_bin: PathBuf,
    /// Number of engine shards (0 = one per host CPU)
    pub num_workers: usize,
    /// Lowest RTC UDP port handed to the engines
    pub rtc_min_port: u16,
    /// Highest RTC UDP port handed to the engines
    pub rtc_max_port: u16,
    /// Let the engine bind IPv4
    pub rtc_ipv4: bool,
    /// Let the engine bind IPv6
    pub rtc_ipv6: bool,
    /// Engine log level (`debug`, `warn`, `error`)
    pub log_level: String,
    /// Engine log tags
    pub log_tags: Vec<String>,
    /// Admin cap on transport bitrate in bits/s (0 = no cap)
    pub max_bitrate: u64,
    /// Optional incoming bitrate limit for publish transports in bits/s
    pub max_incoming_bitrate: Option<u64>,
    /// Statistics poll interval in milliseconds
    pub stat_interval_ms: u64,
    /// Sessions whose last STUN and RTCP are older than this are evicted
    pub liveness_timeout_secs: u64,
    /// Engine request timeout in milliseconds
    pub request_timeout_ms: u64,
    /// Delay before retrying a failed shard relaunch
    pub restart_backoff_ms: u64,
}

impl Default for SfuConfig {
    fn default() -> Self {
        Self {
            worker_bin: PathBuf::from("./worker/out/Release/mediasoup-worker"),
            num_workers: 0,
            rtc_min_port: 10000,
            rtc_max_port: 20000,
            rtc_ipv4: true,
            rtc_ipv6: true,
            log_level: "debug".to_string(),
            log_tags: ["info", "ice", "dtls", "rtp", "srtp", "rtcp", "rbe", "rtx"]
                .iter()
                .map(ToString::to_string)
                .collect(),
            max_bitrate: 0,
            max_incoming_bitrate: None,
            stat_interval_ms: 5000,
            liveness_timeout_secs: 30,
            request_timeout_ms: DEFAULT_REQUEST_TIMEOUT_MS,
            restart_backoff_ms: 1000,
        }
    }
}

impl SfuConfig {
    /// Number of shards to run, resolving 0 to the host CPU count
    #[must_use]
    pub fn shard_count(&self) -> usize {
        if self.num_workers > 0 {
            return self.num_workers;
        }
        std::thread::available_parallelism().map_or(1, std::num::NonZeroUsize::get)
    }

    /// UDP port range assigned to `shard` out of `shards`.
    ///
    /// The configured span is split evenly; the last shard absorbs the
    /// remainder.
    #[must_use]
    pub fn port_range(&self, shard: usize, shards: usize) -> (u16, u16) {
        let shards = shards.max(1) as u32;
        let shard = shard as u32;
        let min = u32::from(self.rtc_min_port);
        let span = u32::from(self.rtc_max_port).saturating_sub(min) + 1;
        let width = span / shards;
        let lo = min + shard * width;
        let hi = if shard + 1 == shards {
            u32::from(self.rtc_max_port)
        } else {
            lo + width - 1
        };
        (lo as u16, hi as u16)
    }

    #[must_use]
    pub fn stat_interval(&self) -> Duration {
        Duration::from_millis(self.stat_interval_ms)
    }

    #[must_use]
    pub fn request_timeout(&self) -> Duration {
        Duration::from_millis(self.request_timeout_ms)
    }

    #[must_use]
    pub fn restart_backoff(&self) -> Duration {
        Duration::from_millis(self.restart_backoff_ms)
    }

    /// Transport bitrate for a session: the smaller of the admin cap and the
    /// offer's declared bandwidth, or [`DEFAULT_MAX_BITRATE`] when neither is
    /// set.
    #[must_use]
    pub fn effective_bitrate(&self, offered: Option<u64>) -> u64 {
        let cap = (self.max_bitrate > 0).then_some(self.max_bitrate);
        match (cap, offered.filter(|b| *b > 0)) {
            (Some(cap), Some(offered)) => cap.min(offered),
            (Some(cap), None) => cap,
            (None, Some(offered)) => offered,
            (None, None) => DEFAULT_MAX_BITRATE,
        }
    }

    /// Check the configuration, returning every problem found
    pub fn validate(&self) -> Result<(), Vec<String>> {
        let mut errors = Vec::new();

        if self.rtc_min_port > self.rtc_max_port {
            errors.push(format!(
                "rtc_min_port ({}) is greater than rtc_max_port ({})",
                self.rtc_min_port, self.rtc_max_port
            ));
        } else {
            let span = usize::from(self.rtc_max_port - self.rtc_min_port) + 1;
            if span < self.shard_count() {
                errors.push(format!(
                    "RTC port range of {span} ports cannot be split across {} shards",
                    self.shard_count()
                ));
            }
        }
        if self.stat_interval_ms == 0 {
            errors.push("stat_interval_ms must be greater than 0".to_string());
        }
        if self.liveness_timeout_secs == 0 {
            errors.push("liveness_timeout_secs must be greater than 0".to_string());
        }
        if self.request_timeout_ms == 0 {
            errors.push("request_timeout_ms must be greater than 0".to_string());
        }
        if !self.rtc_ipv4 && !self.rtc_ipv6 {
            errors.push("at least one of rtc_ipv4/rtc_ipv6 must be enabled".to_string());
        }

        if errors.is_empty() {
            Ok(())
        } else {
            Err(errors)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_port_ranges_are_disjoint_and_cover_span() {
        let config = SfuConfig {
            rtc_min_port: 10000,
            rtc_max_port: 20000,
            ..Default::default()
        };
        let ranges: Vec<_> = (0..3).map(|i| config.port_range(i, 3)).collect();
        assert_eq!(ranges[0], (10000, 13332));
        assert_eq!(ranges[1], (13333, 16665));
        assert_eq!(ranges[2], (16666, 20000));
    }

    #[test]
    fn test_single_shard_gets_everything() {
        let config = SfuConfig::default();
        assert_eq!(config.port_range(0, 1), (10000, 20000));
    }

    #[test]
    fn test_effective_bitrate() {
        let mut config = SfuConfig::default();
        assert_eq!(config.effective_bitrate(None), DEFAULT_MAX_BITRATE);
        assert_eq!(config.effective_bitrate(Some(500_000)), 500_000);

        config.max_bitrate = 800_000;
        assert_eq!(config.effective_bitrate(None), 800_000);
        assert_eq!(config.effective_bitrate(Some(500_000)), 500_000);
        assert_eq!(config.effective_bitrate(Some(2_000_000)), 800_000);
    }

    #[test]
    fn test_validate() {
        assert!(SfuConfig::default().validate().is_ok());

        let config = SfuConfig {
            rtc_min_port: 30000,
            rtc_max_port: 20000,
            stat_interval_ms: 0,
            ..Default::default()
        };
        let errors = config.validate().unwrap_err();
        assert_eq!(errors.len(), 2);

        let config = SfuConfig {
            num_workers: 4,
            rtc_min_port: 10000,
            rtc_max_port: 10001,
            ..Default::default()
        };
        assert!(config.validate().is_err());
    }
}
