//! Clip mixer - a polyphonic sampler over one preloaded clip
//!
//! Sounds sparse instants and note events by resampling a single short
//! PCM clip to the requested pitch. Any number of notes can sound at once
//! as long as they all come from the same clip; each sounding note is a
//! *voice* with its own read position and envelope.
//!
//! Resampling is linear interpolation: a voice at frequency `f` reads the
//! clip at ratio `f / f0 * clip_rate / output_rate`, so its audible length
//! is `clip_len / ratio` output frames. Voices get a short raised-cosine
//! fade-in, and fade out over the remainder of the block when their note
//! ends.

use std::path::Path;
use std::sync::Arc;

use thiserror::Error;

use crate::types::{pan_gain, Sample};

/// Soft polyphony limit; the oldest voice is discarded beyond this
pub const MAX_VOICES: usize = 128;

/// Fade-in length, and the shortest fade-out a scheduled end receives
const FADE_MS: f32 = 5.0;

/// Errors loading a sample clip
#[derive(Debug, Error)]
pub enum ClipLoadError {
    #[error("failed to read clip: {0}")]
    Read(#[from] hound::Error),

    #[error("clip file contains no samples")]
    Empty,
}

/// An in-memory sample clip with its native rate and reference pitch
#[derive(Clone)]
pub struct ClipData {
    data: Arc<[Sample]>,
    rate: f32,
    f0: f32,
}

impl ClipData {
    /// Wrap raw mono samples as a clip
    pub fn from_samples(data: Vec<Sample>, rate: u32, f0: f32) -> Self {
        Self {
            data: data.into(),
            rate: rate as f32,
            f0,
        }
    }

    /// Load a clip from a WAV file, folding channels to mono
    ///
    /// `f0` is the pitch the recording represents; notes are resampled
    /// relative to it.
    pub fn from_wav_file(path: impl AsRef<Path>, f0: f32) -> Result<Self, ClipLoadError> {
        let mut reader = hound::WavReader::open(path)?;
        let spec = reader.spec();
        let channels = spec.channels.max(1) as usize;

        let interleaved: Vec<Sample> = match spec.sample_format {
            hound::SampleFormat::Float => {
                reader.samples::<f32>().collect::<Result<_, _>>()?
            }
            hound::SampleFormat::Int => {
                let full_scale = (1i64 << (spec.bits_per_sample - 1)) as f32;
                reader
                    .samples::<i32>()
                    .map(|s| s.map(|v| v as f32 / full_scale))
                    .collect::<Result<_, _>>()?
            }
        };
        if interleaved.is_empty() {
            return Err(ClipLoadError::Empty);
        }

        let mono: Vec<Sample> = interleaved
            .chunks(channels)
            .map(|frame| frame.iter().sum::<Sample>() / frame.len() as Sample)
            .collect();

        log::info!(
            "loaded clip: {} frames at {}Hz, f0 {}Hz",
            mono.len(),
            spec.sample_rate,
            f0
        );
        Ok(Self::from_samples(mono, spec.sample_rate, f0))
    }

    /// Clip length in frames at its native rate
    pub fn len(&self) -> usize {
        self.data.len()
    }

    /// Whether the clip holds no samples
    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }

    /// Native sample rate
    pub fn rate(&self) -> f32 {
        self.rate
    }

    /// Reference pitch in Hz
    pub fn f0(&self) -> f32 {
        self.f0
    }
}

/// The start of a note within a processing block
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct NoteStart {
    /// Offset within the current block, in frames
    pub frame_offset: usize,
    /// Pitch in Hz
    pub frequency: f32,
    /// Volume in (0, 1]
    pub level: f32,
    /// Pan position in [-1, 1]
    pub pan: f32,
}

/// The end of a note within a processing block
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct NoteEnd {
    /// Offset within the current block, in frames
    pub frame_offset: usize,
    /// Frequency matching the note's start
    pub frequency: f32,
}

/// One currently-sounding note
struct Voice {
    start: NoteStart,
    /// Read position within the clip, in clip samples
    position: f64,
    /// Output frames rendered so far
    frames_done: usize,
    /// Fade-out start offset within the current block, once the end is known
    ending: Option<usize>,
}

/// Polyphonic sampler mixing notes from one clip
pub struct ClipMixer {
    channels: usize,
    sample_rate: u32,
    clip: Option<ClipData>,
    playing: Vec<Voice>,
}

impl ClipMixer {
    pub fn new(channels: usize, sample_rate: u32) -> Self {
        Self {
            channels,
            sample_rate,
            clip: None,
            playing: Vec::with_capacity(MAX_VOICES),
        }
    }

    /// Change the number of output channels the mixer writes
    pub fn set_channel_count(&mut self, channels: usize) {
        self.channels = channels;
    }

    /// Install the clip all voices read from
    pub fn set_clip(&mut self, clip: ClipData) {
        self.clip = Some(clip);
    }

    pub fn has_clip(&self) -> bool {
        self.clip.is_some()
    }

    /// Reference pitch of the installed clip, if any
    pub fn clip_f0(&self) -> Option<f32> {
        self.clip.as_ref().map(|c| c.f0())
    }

    /// Number of currently-sounding voices
    pub fn voice_count(&self) -> usize {
        self.playing.len()
    }

    /// Discard all sounding voices
    pub fn reset(&mut self) {
        self.playing.clear();
    }

    fn resample_ratio(&self, clip: &ClipData, frequency: f32) -> f64 {
        (frequency as f64 / clip.f0() as f64) * (clip.rate() as f64 / self.sample_rate as f64)
    }

    /// Length of a note at `frequency` in output frames
    pub fn resampled_duration(&self, frequency: f32) -> usize {
        match &self.clip {
            Some(clip) => {
                let ratio = self.resample_ratio(clip, frequency);
                if ratio > 0.0 {
                    (clip.len() as f64 / ratio) as usize
                } else {
                    0
                }
            }
            None => 0,
        }
    }

    /// Render one block of up to `frames` samples, adding into
    /// `outputs[c][offset..offset + frames]`
    ///
    /// Ends are matched to sounding voices by frequency and fade out over
    /// the remainder of the block; new notes begin at their offsets.
    pub fn mix(
        &mut self,
        outputs: &mut [Vec<Sample>],
        offset: usize,
        frames: usize,
        gain: f32,
        new_notes: &[NoteStart],
        ending_notes: &[NoteEnd],
    ) {
        for end in ending_notes {
            if let Some(voice) = self.playing.iter_mut().find(|v| {
                v.ending.is_none() && (v.start.frequency - end.frequency).abs() < 1e-3
            }) {
                voice.ending = Some(end.frame_offset.min(frames));
            }
        }

        for note in new_notes {
            if self.playing.len() >= MAX_VOICES {
                log::debug!("clip mixer polyphony limit hit; dropping oldest voice");
                self.playing.remove(0);
            }
            self.playing.push(Voice {
                start: *note,
                position: 0.0,
                frames_done: 0,
                ending: None,
            });
        }

        let Some(clip) = self.clip.clone() else {
            // No clip loaded: notes are tracked but silent
            return;
        };
        let data = &clip.data;
        let channels = self.channels.min(outputs.len());
        let fade_len = ((FADE_MS / 1000.0) * self.sample_rate as f32) as usize;

        for voice in &mut self.playing {
            let ratio = (voice.start.frequency as f64 / clip.f0() as f64)
                * (clip.rate() as f64 / self.sample_rate as f64);
            if ratio <= 0.0 {
                voice.position = data.len() as f64;
                continue;
            }

            let begin = if voice.frames_done == 0 {
                voice.start.frame_offset.min(frames)
            } else {
                0
            };

            for i in begin..frames {
                let index = voice.position as usize;
                if index + 1 >= data.len() {
                    break;
                }
                let frac = (voice.position - index as f64) as f32;
                let sample = data[index] + frac * (data[index + 1] - data[index]);

                let mut env = 1.0f32;
                if fade_len > 0 && voice.frames_done < fade_len {
                    let t = voice.frames_done as f32 / fade_len as f32;
                    env *= 0.5 - 0.5 * (std::f32::consts::PI * t).cos();
                }
                if let Some(end_at) = voice.ending {
                    if i >= end_at {
                        let span = (frames - end_at).max(1);
                        let t = (i - end_at) as f32 / span as f32;
                        env *= 0.5 + 0.5 * (std::f32::consts::PI * t).cos();
                    }
                }

                let value = sample * gain * voice.start.level * env;
                for (c, out) in outputs[..channels].iter_mut().enumerate() {
                    out[offset + i] += value * pan_gain(voice.start.pan, c, channels);
                }

                voice.position += ratio;
                voice.frames_done += 1;
            }
        }

        // A voice whose end fell in this block has faded to silence by the
        // block boundary; one that ran off the clip is simply finished.
        self.playing
            .retain(|v| v.ending.is_none() && (v.position as usize + 1) < data.len());
    }
}
