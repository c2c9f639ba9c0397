//! Synth plugin boundary
//!
//! Note models can be voiced by a real-time synth plugin instead of the
//! clip mixer. Plugin discovery and instantiation belong to the host
//! application; the generator only needs a `run` primitive that renders a
//! block from note events. A missing host (or a failed load) is not an
//! error: note playback falls back to the clip mixer.

use crate::types::Sample;

/// One note event within a processing block
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct NoteEvent {
    /// Offset of the event within the block, in frames
    pub frame_offset: usize,
    pub kind: NoteEventKind,
}

/// What the event does
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum NoteEventKind {
    /// Start a note
    On { frequency: f32, velocity: f32 },
    /// End the note matching the given frequency
    Off { frequency: f32 },
}

/// A loaded real-time synth instance
pub trait SynthPlugin: Send {
    /// Render `frames` samples, adding into `outputs` (one buffer per
    /// channel), applying the block's note events at their offsets
    fn run(&mut self, frames: usize, events: &[NoteEvent], outputs: &mut [Vec<Sample>]);

    /// Discard all sounding voices and internal state
    fn reset(&mut self) {}
}

/// Loader for synth plugins, implemented by the host application
pub trait PluginHost: Send + Sync {
    /// Instantiate the plugin with the given id and optional program
    ///
    /// Returns `None` if the plugin is unknown or fails to load.
    fn load(&self, id: &str, program: Option<&str>) -> Option<Box<dyn SynthPlugin>>;
}
