//! Crest Audio - real-time playback core for the Crest waveform viewer
//! and annotation editor
//!
//! Synthesises a mixed audio stream on demand from a set of data models
//! (dense PCM, sparse instants, pitched notes), with optional slow-motion
//! playback, sample-rate adaptation and output metering. The heart of the
//! crate is [`engine::AudioCallbackPlaySource`], which bridges a
//! non-realtime fill thread and a realtime device callback through
//! lock-free per-channel ring buffers.

pub mod audio;
pub mod engine;
pub mod model;
pub mod ring_buffer;
pub mod scavenger;
pub mod timestretch;
pub mod types;

pub use types::*;
