//! CPAL output target for the play source
//!
//! Opens a stereo output stream and wires its data callback to
//! `AudioCallbackPlaySource::get_source_samples`. The callback owns two
//! preallocated channel buffers and interleaves into the device buffer;
//! it performs no allocation and takes no locks, keeping the play
//! source's realtime contract intact end to end.

use std::sync::Arc;

use cpal::traits::{DeviceTrait, HostTrait, StreamTrait};
use cpal::{BufferSize as CpalBufferSize, SampleFormat, Stream, StreamConfig};

use crate::engine::AudioCallbackPlaySource;

use super::config::{PlaybackConfig, DEFAULT_BUFFER_SIZE};
use super::error::{AudioError, AudioResult};

/// Handle to the running output stream
///
/// Keeps the stream alive; drop it to stop audio.
pub struct PlaybackHandle {
    _stream: Stream,
    sample_rate: u32,
    buffer_size: u32,
}

impl PlaybackHandle {
    /// Sample rate of the output stream
    pub fn sample_rate(&self) -> u32 {
        self.sample_rate
    }

    /// Buffer size in frames as requested from the device
    pub fn buffer_size(&self) -> u32 {
        self.buffer_size
    }

    /// One-way output latency in milliseconds
    pub fn latency_ms(&self) -> f32 {
        (self.buffer_size as f32 / self.sample_rate as f32) * 1000.0
    }
}

/// Names of the available output devices
pub fn output_devices() -> AudioResult<Vec<String>> {
    let host = cpal::default_host();
    let devices = host
        .output_devices()
        .map_err(|e| AudioError::ConfigError(e.to_string()))?;
    Ok(devices.filter_map(|d| d.name().ok()).collect())
}

/// Open the configured output device and start pulling from the source
///
/// The device's block size, sample rate and latency are pushed into the
/// play source before the stream starts, so position reporting is
/// consistent from the first pull.
pub fn start_playback(
    config: &PlaybackConfig,
    source: Arc<AudioCallbackPlaySource>,
) -> AudioResult<PlaybackHandle> {
    let host = cpal::default_host();

    let device = match &config.device {
        Some(name) => host
            .output_devices()
            .map_err(|e| AudioError::ConfigError(e.to_string()))?
            .find(|d| d.name().map(|n| &n == name).unwrap_or(false))
            .ok_or_else(|| AudioError::DeviceNotFound(name.clone()))?,
        None => host.default_output_device().ok_or(AudioError::NoDevices)?,
    };

    let default_config = device
        .default_output_config()
        .map_err(|e| AudioError::ConfigError(e.to_string()))?;
    if default_config.sample_format() != SampleFormat::F32 {
        return Err(AudioError::UnsupportedFormat(format!(
            "{:?}",
            default_config.sample_format()
        )));
    }

    let sample_rate = config.sample_rate.unwrap_or(default_config.sample_rate().0);
    let frames = config.buffer_size.as_frames().unwrap_or(DEFAULT_BUFFER_SIZE);

    let stream_config = StreamConfig {
        channels: 2,
        sample_rate: cpal::SampleRate(sample_rate),
        buffer_size: CpalBufferSize::Fixed(frames),
    };

    source.set_target_sample_rate(sample_rate);
    source.set_target_block_size(frames as usize);
    source.set_target_play_latency(frames as usize);

    // Headroom in case the device delivers larger buffers than requested
    let capacity = frames as usize * 4;
    let mut left = vec![0.0f32; capacity];
    let mut right = vec![0.0f32; capacity];

    let callback_source = source.clone();
    let stream = device
        .build_output_stream(
            &stream_config,
            move |data: &mut [f32], _: &cpal::OutputCallbackInfo| {
                let want = (data.len() / 2).min(left.len());
                {
                    let mut outs = [&mut left[..want], &mut right[..want]];
                    // Underruns come back zero-filled, so the interleave
                    // below is correct regardless of how much was ready
                    callback_source.get_source_samples(want, &mut outs);
                }
                for (i, frame) in data.chunks_mut(2).take(want).enumerate() {
                    frame[0] = left[i];
                    if let Some(r) = frame.get_mut(1) {
                        *r = right[i];
                    }
                }
                for sample in &mut data[want * 2..] {
                    *sample = 0.0;
                }
            },
            |err| {
                log::error!("audio stream error: {}", err);
            },
            None,
        )
        .map_err(|e| AudioError::StreamBuildError(e.to_string()))?;

    stream
        .play()
        .map_err(|e| AudioError::StreamPlayError(e.to_string()))?;

    log::info!(
        "playback stream started: {}Hz, {} frames per block",
        sample_rate,
        frames
    );

    Ok(PlaybackHandle {
        _stream: stream,
        sample_rate,
        buffer_size: frames,
    })
}
