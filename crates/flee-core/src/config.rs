//! Protocol configuration
//!
//! Defaults reproduce the reference deployment: a 100 ms frame split into
//! 10 ms broadcast opportunities, 16 channels starting at 11, and a sink that
//! floods a Hello every 5 s.

use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::ConfigError;
use crate::mesh::channel;

/// Duty-cycled MAC configuration
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct MacConfig {
    /// Length of one scheduling frame
    pub frame_length: Duration,
    /// Spacing between broadcast opportunities
    pub broadcast_interval: Duration,
    /// How long the receiver stays on when a slot turns out to be idle
    pub rx_timeout: Duration,
    /// Frames a link observed only in passing survives without traffic
    pub short_expiry_frames: u32,
    /// Frames a confirmed link survives without traffic
    pub long_expiry_frames: u32,
    /// First broadcast channel
    pub initial_channel: u8,
    /// Seed for the random frame phase chosen at start
    pub seed: u64,
}

impl Default for MacConfig {
    fn default() -> Self {
        Self {
            frame_length: Duration::from_millis(100),
            broadcast_interval: Duration::from_millis(10),
            rx_timeout: Duration::from_millis(5),
            short_expiry_frames: 2,
            long_expiry_frames: 10,
            initial_channel: channel::FIRST,
            seed: 42,
        }
    }
}

impl MacConfig {
    pub fn with_frame_length(mut self, frame_length: Duration) -> Self {
        self.frame_length = frame_length;
        self
    }

    pub fn with_broadcast_interval(mut self, interval: Duration) -> Self {
        self.broadcast_interval = interval;
        self
    }

    pub fn with_rx_timeout(mut self, timeout: Duration) -> Self {
        self.rx_timeout = timeout;
        self
    }

    pub fn with_initial_channel(mut self, channel: u8) -> Self {
        self.initial_channel = channel;
        self
    }

    pub fn with_seed(mut self, seed: u64) -> Self {
        self.seed = seed;
        self
    }

    /// Expiry armed for links seen but not yet confirmed
    pub fn short_expiry(&self) -> Duration {
        self.frame_length * self.short_expiry_frames
    }

    /// Expiry armed for confirmed links
    pub fn long_expiry(&self) -> Duration {
        self.frame_length * self.long_expiry_frames
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.frame_length.is_zero() {
            return Err(ConfigError::ZeroValue("frame_length"));
        }
        if self.broadcast_interval.is_zero() {
            return Err(ConfigError::ZeroValue("broadcast_interval"));
        }
        if self.broadcast_interval >= self.frame_length {
            return Err(ConfigError::BroadcastIntervalTooLong {
                interval: self.broadcast_interval,
                frame: self.frame_length,
            });
        }
        if self.short_expiry_frames == 0 {
            return Err(ConfigError::ZeroValue("short_expiry_frames"));
        }
        if self.long_expiry_frames == 0 {
            return Err(ConfigError::ZeroValue("long_expiry_frames"));
        }
        if !channel::is_valid(self.initial_channel) {
            return Err(ConfigError::InvalidChannel(self.initial_channel));
        }
        Ok(())
    }
}

/// Hello/flood routing configuration
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct HelloConfig {
    /// UDP port for Hello and acknowledgment datagrams
    pub port: u16,
    /// Period of the sink's Hello flood
    pub hello_interval: Duration,
    /// Delay before a node re-floods after learning a new neighbor
    pub rebroadcast_delay: Duration,
    /// Starting hop distance; 0 makes the node a sink
    pub initial_distance: u8,
    /// Size of the zero-filled acknowledgment payload
    pub ack_len: usize,
}

impl Default for HelloConfig {
    fn default() -> Self {
        Self {
            port: crate::routing::FLEE_PORT,
            hello_interval: Duration::from_secs(5),
            rebroadcast_delay: Duration::from_millis(100),
            initial_distance: crate::routing::INFINITE_DISTANCE,
            ack_len: 9,
        }
    }
}

impl HelloConfig {
    /// Configuration for the sink node
    pub fn sink() -> Self {
        Self {
            initial_distance: 0,
            ..Self::default()
        }
    }

    pub fn with_port(mut self, port: u16) -> Self {
        self.port = port;
        self
    }

    pub fn with_hello_interval(mut self, interval: Duration) -> Self {
        self.hello_interval = interval;
        self
    }

    pub fn with_rebroadcast_delay(mut self, delay: Duration) -> Self {
        self.rebroadcast_delay = delay;
        self
    }

    pub fn with_initial_distance(mut self, distance: u8) -> Self {
        self.initial_distance = distance;
        self
    }

    pub fn is_sink(&self) -> bool {
        self.initial_distance == 0
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.port == 0 {
            return Err(ConfigError::ZeroValue("port"));
        }
        if self.hello_interval.is_zero() {
            return Err(ConfigError::ZeroValue("hello_interval"));
        }
        // An ack must never be mistaken for a one-byte Hello
        if self.ack_len < 2 {
            return Err(ConfigError::AckTooShort(self.ack_len));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_mac_defaults() {
        let config = MacConfig::default();
        assert_eq!(config.frame_length, Duration::from_millis(100));
        assert_eq!(config.short_expiry(), Duration::from_millis(200));
        assert_eq!(config.long_expiry(), Duration::from_secs(1));
        assert_eq!(config.initial_channel, 11);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_mac_validate() {
        let config = MacConfig::default().with_frame_length(Duration::ZERO);
        assert_eq!(
            config.validate(),
            Err(ConfigError::ZeroValue("frame_length"))
        );

        let config = MacConfig::default().with_broadcast_interval(Duration::from_millis(100));
        assert!(matches!(
            config.validate(),
            Err(ConfigError::BroadcastIntervalTooLong { .. })
        ));

        let config = MacConfig::default().with_initial_channel(27);
        assert_eq!(config.validate(), Err(ConfigError::InvalidChannel(27)));
    }

    #[test]
    fn test_hello_defaults() {
        let config = HelloConfig::default();
        assert!(!config.is_sink());
        assert_eq!(config.hello_interval, Duration::from_secs(5));
        assert!(config.validate().is_ok());

        let sink = HelloConfig::sink();
        assert!(sink.is_sink());
        assert_eq!(sink.port, config.port);
    }

    #[test]
    fn test_hello_validate() {
        assert_eq!(
            HelloConfig::default().with_port(0).validate(),
            Err(ConfigError::ZeroValue("port"))
        );
        let mut short_ack = HelloConfig::default();
        short_ack.ack_len = 1;
        assert_eq!(short_ack.validate(), Err(ConfigError::AckTooShort(1)));
    }

    #[test]
    fn test_config_serde_roundtrip() {
        let config = MacConfig::default().with_seed(7);
        let json = serde_json::to_string(&config).unwrap();
        let back: MacConfig = serde_json::from_str(&json).unwrap();
        assert_eq!(back, config);

        // Missing fields fall back to defaults
        let partial: HelloConfig = serde_json::from_str(r#"{"initial_distance":0}"#).unwrap();
        assert!(partial.is_sink());
        assert_eq!(partial.rebroadcast_delay, Duration::from_millis(100));
    }
}
