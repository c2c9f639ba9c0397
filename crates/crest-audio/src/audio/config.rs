//! Playback device configuration
//!
//! Settings for the output stream that drives the play source. These are
//! what a frontend persists in its settings file, hence the serde derives.

use serde::{Deserialize, Serialize};

/// Default buffer size when no preference is specified (frames)
/// 1024 frames is a safe default for a viewer application, where a few
/// milliseconds of latency are irrelevant.
pub const DEFAULT_BUFFER_SIZE: u32 = 1024;

/// Preferred buffer size for the output stream
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum BufferSize {
    /// Let the system choose the default buffer size
    #[default]
    Default,
    /// Request a specific buffer size in frames (may be adjusted by the
    /// system)
    Fixed(u32),
}

impl BufferSize {
    /// The requested size in frames, or None for system default
    pub fn as_frames(&self) -> Option<u32> {
        match self {
            BufferSize::Default => None,
            BufferSize::Fixed(frames) => Some(*frames),
        }
    }

    /// Latency in milliseconds for a given sample rate
    pub fn latency_ms(&self, sample_rate: u32) -> Option<f32> {
        self.as_frames()
            .map(|frames| (frames as f32 / sample_rate as f32) * 1000.0)
    }
}

/// Configuration for the playback device
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct PlaybackConfig {
    /// Output device name as reported by the system; None for the default
    /// device
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub device: Option<String>,

    /// Preferred buffer size
    #[serde(default)]
    pub buffer_size: BufferSize,

    /// Requested sample rate; None accepts the device's default rate (the
    /// play source resamples when it differs from the source material)
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub sample_rate: Option<u32>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_buffer_size_frames() {
        assert_eq!(BufferSize::Default.as_frames(), None);
        assert_eq!(BufferSize::Fixed(256).as_frames(), Some(256));
    }

    #[test]
    fn test_latency_calculation() {
        let latency = BufferSize::Fixed(441).latency_ms(44100).unwrap();
        assert!((latency - 10.0).abs() < 0.01);
    }

    #[test]
    fn test_config_roundtrips_through_json() {
        let config = PlaybackConfig {
            device: Some("Scope HD".to_string()),
            buffer_size: BufferSize::Fixed(512),
            sample_rate: Some(48000),
        };
        let text = serde_json::to_string(&config).unwrap();
        let back: PlaybackConfig = serde_json::from_str(&text).unwrap();
        assert_eq!(back.device.as_deref(), Some("Scope HD"));
        assert_eq!(back.buffer_size, BufferSize::Fixed(512));
        assert_eq!(back.sample_rate, Some(48000));
    }

    #[test]
    fn test_empty_config_uses_defaults() {
        let back: PlaybackConfig = serde_json::from_str("{}").unwrap();
        assert_eq!(back.device, None);
        assert_eq!(back.buffer_size, BufferSize::Default);
        assert_eq!(back.sample_rate, None);
    }
}
