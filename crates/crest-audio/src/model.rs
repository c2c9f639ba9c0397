//! Playable data model interfaces
//!
//! The playback core owns no audio data. It renders from *models* supplied
//! by the application: dense PCM data, sparse time instants, or pitched
//! notes. Each variant exposes the minimal range-read primitive the
//! generator needs; everything else about a model (storage, editing,
//! persistence) stays on the application side.
//!
//! Models are handed over as `Arc<dyn Model>`. The core keeps its own
//! references only between `add_model` and `remove_model`; identity is the
//! Arc's pointer, which makes add/remove idempotent.

use std::sync::Arc;

use crate::types::Sample;

/// A time-indexed data source that the play source can render from
///
/// Frame positions are in samples at the model's own rate. `end_frame` is
/// exclusive: the model has data in `[start_frame, end_frame)`.
pub trait Model: Send + Sync {
    /// Sample rate of the model's timeline
    fn sample_rate(&self) -> u32;

    /// First frame with data
    fn start_frame(&self) -> usize;

    /// One past the last frame with data
    fn end_frame(&self) -> usize;

    /// Variant dispatch for the renderer
    fn kind(&self) -> ModelKind<'_>;
}

/// The renderer-facing variant of a model
pub enum ModelKind<'a> {
    /// Multi-channel PCM, read directly
    Dense(&'a dyn DenseModel),
    /// Time instants, sounded through the clip mixer
    Sparse(&'a dyn SparseModel),
    /// Pitched notes with duration and velocity
    Note(&'a dyn NoteModel),
}

/// Dense time-value data: addressable PCM
pub trait DenseModel: Model {
    /// Number of channels of PCM data
    fn channel_count(&self) -> usize;

    /// Copy up to `out.len()` samples of one channel starting at `start`
    ///
    /// Returns the number of samples written; fewer than requested at the
    /// end of the model. The remainder of `out` is left untouched.
    fn read(&self, channel: usize, start: usize, out: &mut [Sample]) -> usize;
}

/// Sparse one-dimensional data: zero-duration time instants
pub trait SparseModel: Model {
    /// Frames of all instants in `[start, end)`, in ascending order
    fn instants_in(&self, start: usize, end: usize) -> Vec<usize>;
}

/// Note data: time-stamped pitched notes
pub trait NoteModel: Model {
    /// All notes whose onset falls in `[start, end)`, in ascending order
    fn notes_in(&self, start: usize, end: usize) -> Vec<Note>;
}

/// One note in a note model
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Note {
    /// Onset frame
    pub frame: usize,
    /// Duration in frames
    pub duration: usize,
    /// MIDI pitch; fractional values are valid (cent offsets)
    pub pitch: f32,
    /// Velocity in (0, 1]
    pub velocity: f32,
}

impl Note {
    /// Frequency in Hz for this note's pitch (A4 = 69 = 440Hz)
    pub fn frequency(&self) -> f32 {
        440.0 * ((self.pitch - 69.0) / 12.0).exp2()
    }
}

/// Identity of a model within the play source
///
/// Derived from the `Arc` pointer, so the same model added twice maps to
/// the same id.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ModelId(usize);

impl ModelId {
    /// Identity of the given model reference
    pub fn of(model: &Arc<dyn Model>) -> Self {
        ModelId(Arc::as_ptr(model) as *const () as usize)
    }
}

/// Reference to a synth plugin and program for a note model
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PluginSpec {
    /// Plugin identifier understood by the host
    pub id: String,
    /// Optional program/preset name
    pub program: Option<String>,
}

/// Per-model playback parameters
///
/// Set from control threads via the play source and read by the generator
/// while mixing. The default is unity gain, centre pan, audible, no plugin.
#[derive(Debug, Clone, PartialEq)]
pub struct PlayParameters {
    /// Linear gain, >= 0
    pub gain: f32,
    /// Pan position in [-1, 1]
    pub pan: f32,
    /// Whether the model is muted
    pub muted: bool,
    /// Synth plugin to use for note playback, if any
    pub plugin: Option<PluginSpec>,
}

impl Default for PlayParameters {
    fn default() -> Self {
        Self {
            gain: 1.0,
            pan: 0.0,
            muted: false,
            plugin: None,
        }
    }
}

#[cfg(test)]
pub(crate) mod test_support {
    //! Model fixtures shared by the engine tests

    use super::*;

    /// Dense model producing a constant value on every channel
    pub struct ConstantModel {
        pub value: Sample,
        pub channels: usize,
        pub rate: u32,
        pub frames: usize,
    }

    impl Model for ConstantModel {
        fn sample_rate(&self) -> u32 {
            self.rate
        }
        fn start_frame(&self) -> usize {
            0
        }
        fn end_frame(&self) -> usize {
            self.frames
        }
        fn kind(&self) -> ModelKind<'_> {
            ModelKind::Dense(self)
        }
    }

    impl DenseModel for ConstantModel {
        fn channel_count(&self) -> usize {
            self.channels
        }
        fn read(&self, _channel: usize, start: usize, out: &mut [Sample]) -> usize {
            if start >= self.frames {
                return 0;
            }
            let n = out.len().min(self.frames - start);
            out[..n].fill(self.value);
            n
        }
    }

    /// Dense mono model producing a sinusoid
    pub struct SineModel {
        pub frequency: f32,
        pub amplitude: Sample,
        pub rate: u32,
        pub frames: usize,
    }

    impl Model for SineModel {
        fn sample_rate(&self) -> u32 {
            self.rate
        }
        fn start_frame(&self) -> usize {
            0
        }
        fn end_frame(&self) -> usize {
            self.frames
        }
        fn kind(&self) -> ModelKind<'_> {
            ModelKind::Dense(self)
        }
    }

    impl DenseModel for SineModel {
        fn channel_count(&self) -> usize {
            1
        }
        fn read(&self, _channel: usize, start: usize, out: &mut [Sample]) -> usize {
            if start >= self.frames {
                return 0;
            }
            let n = out.len().min(self.frames - start);
            let w = 2.0 * std::f32::consts::PI * self.frequency / self.rate as f32;
            for (i, s) in out[..n].iter_mut().enumerate() {
                *s = self.amplitude * (w * (start + i) as f32).sin();
            }
            n
        }
    }

    /// Sparse model with a fixed list of instants
    pub struct InstantsModel {
        pub frames: Vec<usize>,
        pub rate: u32,
        pub end: usize,
    }

    impl Model for InstantsModel {
        fn sample_rate(&self) -> u32 {
            self.rate
        }
        fn start_frame(&self) -> usize {
            self.frames.first().copied().unwrap_or(0)
        }
        fn end_frame(&self) -> usize {
            self.end
        }
        fn kind(&self) -> ModelKind<'_> {
            ModelKind::Sparse(self)
        }
    }

    impl SparseModel for InstantsModel {
        fn instants_in(&self, start: usize, end: usize) -> Vec<usize> {
            self.frames
                .iter()
                .copied()
                .filter(|&f| f >= start && f < end)
                .collect()
        }
    }

    /// Note model with a fixed list of notes
    pub struct NotesModel {
        pub notes: Vec<Note>,
        pub rate: u32,
        pub end: usize,
    }

    impl Model for NotesModel {
        fn sample_rate(&self) -> u32 {
            self.rate
        }
        fn start_frame(&self) -> usize {
            self.notes.first().map(|n| n.frame).unwrap_or(0)
        }
        fn end_frame(&self) -> usize {
            self.end
        }
        fn kind(&self) -> ModelKind<'_> {
            ModelKind::Note(self)
        }
    }

    impl NoteModel for NotesModel {
        fn notes_in(&self, start: usize, end: usize) -> Vec<Note> {
            self.notes
                .iter()
                .copied()
                .filter(|n| n.frame >= start && n.frame < end)
                .collect()
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_note_frequency() {
        let a4 = Note { frame: 0, duration: 100, pitch: 69.0, velocity: 1.0 };
        assert!((a4.frequency() - 440.0).abs() < 1e-3);

        let a5 = Note { frame: 0, duration: 100, pitch: 81.0, velocity: 1.0 };
        assert!((a5.frequency() - 880.0).abs() < 1e-3);
    }

    #[test]
    fn test_model_id_is_pointer_identity() {
        use super::test_support::ConstantModel;

        let m: Arc<dyn Model> = Arc::new(ConstantModel {
            value: 0.5,
            channels: 1,
            rate: 44100,
            frames: 1000,
        });
        let m2 = m.clone();
        assert_eq!(ModelId::of(&m), ModelId::of(&m2));

        let other: Arc<dyn Model> = Arc::new(ConstantModel {
            value: 0.5,
            channels: 1,
            rate: 44100,
            frames: 1000,
        });
        assert_ne!(ModelId::of(&m), ModelId::of(&other));
    }
}
