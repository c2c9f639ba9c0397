//! Playback engine - generator, clip mixer, callback play source
//!
//! This module contains the core playback components:
//! - AudioGenerator: renders each model variant into the mix
//! - ClipMixer: polyphonic sampler for sparse and note models
//! - AudioCallbackPlaySource: fill thread and realtime callback bridge
//! - Plugin traits and playback event dispatch

mod clip_mixer;
mod events;
mod generator;
mod play_source;
mod plugin;

pub use clip_mixer::*;
pub use events::*;
pub use generator::*;
pub use play_source::*;
pub use plugin::*;
