//! Audio generator - renders each model variant into the mix
//!
//! One generator serves all models added to the play source. Dense models
//! are read straight from their PCM; sparse and note models are voiced
//! through a per-model `ClipMixer`, or through a synth plugin when the
//! model's play parameters name one and a host is installed.
//!
//! All mixing *adds* into the caller's buffers, so models stack by simple
//! accumulation. The fill thread is the only caller of `mix_model`; the
//! internal mutex exists because play parameters arrive from control
//! threads while mixing is in progress.

use std::collections::{BTreeSet, HashMap};
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Instant;

use crate::model::{
    DenseModel, Model, ModelId, ModelKind, NoteModel, PlayParameters, SparseModel,
};
use crate::types::{pan_gain, Sample, DEFAULT_SAMPLE_RATE};

use super::clip_mixer::{ClipData, ClipMixer, NoteEnd, NoteStart};
use super::events::{EventDispatcher, PlaySourceEvent};
use super::plugin::{NoteEvent, NoteEventKind, PluginHost, SynthPlugin};

/// Internal processing block size; `mix_model` frame counts must be a
/// multiple of this
pub const PLUGIN_BLOCK_SIZE: usize = 1024;

/// Consecutive over-budget blocks before a synth plugin is disabled
const OVERLOAD_LIMIT: u32 = 3;

/// A pending note-off, ordered by frame
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
struct NoteOff {
    frame: usize,
    frequency_bits: u32,
}

impl NoteOff {
    fn new(frame: usize, frequency: f32) -> Self {
        Self {
            frame,
            frequency_bits: frequency.to_bits(),
        }
    }

    fn frequency(&self) -> f32 {
        f32::from_bits(self.frequency_bits)
    }
}

struct SynthState {
    plugin: Box<dyn SynthPlugin>,
    overloads: u32,
}

struct GeneratorState {
    target_channels: usize,
    clip: Option<ClipData>,
    params: HashMap<ModelId, PlayParameters>,
    clip_mixers: HashMap<ModelId, ClipMixer>,
    synths: HashMap<ModelId, SynthState>,
    note_offs: HashMap<ModelId, BTreeSet<NoteOff>>,
}

/// Per-model renderer behind the play source
pub struct AudioGenerator {
    source_sample_rate: AtomicU32,
    host: Option<Arc<dyn PluginHost>>,
    events: Arc<EventDispatcher>,
    state: Mutex<GeneratorState>,
}

impl AudioGenerator {
    pub fn new(events: Arc<EventDispatcher>, host: Option<Arc<dyn PluginHost>>) -> Self {
        Self {
            source_sample_rate: AtomicU32::new(DEFAULT_SAMPLE_RATE),
            host,
            events,
            state: Mutex::new(GeneratorState {
                target_channels: 2,
                clip: None,
                params: HashMap::new(),
                clip_mixers: HashMap::new(),
                synths: HashMap::new(),
                note_offs: HashMap::new(),
            }),
        }
    }

    /// Internal processing block size
    pub fn block_size(&self) -> usize {
        PLUGIN_BLOCK_SIZE
    }

    pub fn set_source_sample_rate(&self, rate: u32) {
        self.source_sample_rate.store(rate, Ordering::Release);
        let mut state = self.state.lock().unwrap();
        let channels = state.target_channels;
        let clip = state.clip.clone();
        for mixer in state.clip_mixers.values_mut() {
            *mixer = Self::make_mixer(channels, rate, clip.as_ref());
        }
    }

    pub fn source_sample_rate(&self) -> u32 {
        self.source_sample_rate.load(Ordering::Acquire)
    }

    /// Install the clip used to voice sparse and note models
    pub fn set_clip(&self, clip: ClipData) {
        let mut state = self.state.lock().unwrap();
        for mixer in state.clip_mixers.values_mut() {
            mixer.set_clip(clip.clone());
        }
        state.clip = Some(clip);
    }

    /// Set the number of output channels `mix_model` writes
    ///
    /// The buffer argument to `mix_model` must always hold at least this
    /// many arrays. A mono source is panned into a stereo pair with the
    /// equal-power law; matching counts pass straight through.
    pub fn set_target_channel_count(&self, channels: usize) {
        let channels = channels.max(1);
        let mut state = self.state.lock().unwrap();
        state.target_channels = channels;
        for mixer in state.clip_mixers.values_mut() {
            mixer.set_channel_count(channels);
        }
    }

    pub fn target_channel_count(&self) -> usize {
        self.state.lock().unwrap().target_channels
    }

    fn make_mixer(channels: usize, rate: u32, clip: Option<&ClipData>) -> ClipMixer {
        let mut mixer = ClipMixer::new(channels, rate);
        if let Some(clip) = clip {
            mixer.set_clip(clip.clone());
        }
        mixer
    }

    /// Prepare generation state for a model
    ///
    /// Returns true if the model is of a type we know how to play.
    pub fn add_model(&self, model: &Arc<dyn Model>) -> bool {
        let id = ModelId::of(model);
        let rate = self.source_sample_rate();
        let mut state = self.state.lock().unwrap();
        let channels = state.target_channels;
        match model.kind() {
            ModelKind::Dense(_) => true,
            ModelKind::Sparse(_) => {
                let mixer = Self::make_mixer(channels, rate, state.clip.as_ref());
                state.clip_mixers.insert(id, mixer);
                true
            }
            ModelKind::Note(_) => {
                let mixer = Self::make_mixer(channels, rate, state.clip.as_ref());
                state.clip_mixers.insert(id, mixer);
                state.note_offs.insert(id, BTreeSet::new());
                self.load_synth(&mut state, id);
                true
            }
        }
    }

    /// Drop all generation state for a model
    pub fn remove_model(&self, id: ModelId) {
        let mut state = self.state.lock().unwrap();
        state.clip_mixers.remove(&id);
        state.synths.remove(&id);
        state.note_offs.remove(&id);
        state.params.remove(&id);
    }

    pub fn clear_models(&self) {
        let mut state = self.state.lock().unwrap();
        state.clip_mixers.clear();
        state.synths.clear();
        state.note_offs.clear();
        state.params.clear();
    }

    /// Reset playback state: pending note-offs, voices, synth state
    pub fn reset(&self) {
        let mut state = self.state.lock().unwrap();
        for offs in state.note_offs.values_mut() {
            offs.clear();
        }
        for mixer in state.clip_mixers.values_mut() {
            mixer.reset();
        }
        for synth in state.synths.values_mut() {
            synth.plugin.reset();
            synth.overloads = 0;
        }
    }

    /// Update a model's play parameters
    ///
    /// Takes effect from the next processing block. Changing the plugin
    /// reference reloads (or drops) the synth instance.
    pub fn set_play_parameters(&self, id: ModelId, params: PlayParameters) {
        let mut state = self.state.lock().unwrap();
        let plugin_changed = state
            .params
            .get(&id)
            .map(|old| old.plugin != params.plugin)
            .unwrap_or(params.plugin.is_some());
        state.params.insert(id, params);
        if plugin_changed {
            state.synths.remove(&id);
            self.load_synth(&mut state, id);
        }
    }

    pub fn play_parameters(&self, id: ModelId) -> PlayParameters {
        self.state
            .lock()
            .unwrap()
            .params
            .get(&id)
            .cloned()
            .unwrap_or_default()
    }

    fn load_synth(&self, state: &mut GeneratorState, id: ModelId) {
        let Some(host) = &self.host else { return };
        let Some(spec) = state.params.get(&id).and_then(|p| p.plugin.clone()) else {
            return;
        };
        match host.load(&spec.id, spec.program.as_deref()) {
            Some(plugin) => {
                state.synths.insert(id, SynthState { plugin, overloads: 0 });
            }
            None => {
                log::warn!("synth plugin '{}' failed to load; using clip", spec.id);
            }
        }
    }

    /// Mix one model into the output buffers
    ///
    /// Adds `frames` samples starting at model frame `start_frame` into
    /// `buffers[0..target_channels]`. `frames` must be a multiple of
    /// `block_size()`. `fade_in`/`fade_out` are envelope lengths applied at
    /// the leading/trailing edge of this call, used to stitch loop
    /// boundaries. Returns the number of frames for which the model still
    /// had data (`frames` or fewer at the end of the model).
    pub fn mix_model(
        &self,
        model: &Arc<dyn Model>,
        start_frame: usize,
        frames: usize,
        buffers: &mut [Vec<Sample>],
        fade_in: usize,
        fade_out: usize,
    ) -> usize {
        debug_assert_eq!(frames % PLUGIN_BLOCK_SIZE, 0);

        let id = ModelId::of(model);
        let mut state = self.state.lock().unwrap();
        let params = state.params.get(&id).cloned().unwrap_or_default();
        let available = model.end_frame().saturating_sub(start_frame).min(frames);
        if params.muted || params.gain <= 0.0 {
            return available;
        }

        match model.kind() {
            ModelKind::Dense(dense) => Self::mix_dense(
                &state, dense, start_frame, frames, buffers, &params, fade_in, fade_out,
            ),
            ModelKind::Sparse(sparse) => {
                Self::mix_sparse(&mut state, id, sparse, start_frame, frames, buffers, &params);
                available
            }
            ModelKind::Note(notes) => {
                self.mix_note(&mut state, id, notes, start_frame, frames, buffers, &params);
                available
            }
        }
    }

    /// Loop-stitch envelope: linear ramps at the edges of a mix call
    #[inline]
    fn envelope(i: usize, frames: usize, fade_in: usize, fade_out: usize) -> Sample {
        let mut g = 1.0;
        if fade_in > 0 && i < fade_in {
            g *= (i + 1) as Sample / fade_in as Sample;
        }
        if fade_out > 0 && i + fade_out >= frames {
            g *= (frames - i) as Sample / fade_out as Sample;
        }
        g
    }

    #[allow(clippy::too_many_arguments)]
    fn mix_dense(
        state: &GeneratorState,
        dense: &dyn DenseModel,
        start_frame: usize,
        frames: usize,
        buffers: &mut [Vec<Sample>],
        params: &PlayParameters,
        fade_in: usize,
        fade_out: usize,
    ) -> usize {
        let end = dense.end_frame();
        if start_frame >= end {
            return 0;
        }
        let renderable = frames.min(end - start_frame);
        let targets = state.target_channels.min(buffers.len());
        let src_channels = dense.channel_count().max(1);
        let mut scratch = vec![0.0; renderable];

        if src_channels == 1 {
            let got = dense.read(0, start_frame, &mut scratch);
            for (t, out) in buffers[..targets].iter_mut().enumerate() {
                let g = params.gain * pan_gain(params.pan, t, targets);
                if g == 0.0 {
                    continue;
                }
                for (i, &s) in scratch[..got].iter().enumerate() {
                    out[i] += s * g * Self::envelope(i, frames, fade_in, fade_out);
                }
            }
        } else {
            for c in 0..src_channels {
                let got = dense.read(c, start_frame, &mut scratch);
                let t = c % targets;
                let mut g = params.gain;
                // Pan acts as a balance control on multi-channel sources
                if targets >= 2 {
                    if t == 0 && params.pan > 0.0 {
                        g *= 1.0 - params.pan;
                    } else if t == 1 && params.pan < 0.0 {
                        g *= 1.0 + params.pan;
                    }
                }
                if g == 0.0 {
                    continue;
                }
                let out = &mut buffers[t];
                for (i, &s) in scratch[..got].iter().enumerate() {
                    out[i] += s * g * Self::envelope(i, frames, fade_in, fade_out);
                }
            }
        }
        renderable
    }

    #[allow(clippy::too_many_arguments)]
    fn mix_sparse(
        state: &mut GeneratorState,
        id: ModelId,
        sparse: &dyn SparseModel,
        start_frame: usize,
        frames: usize,
        buffers: &mut [Vec<Sample>],
        params: &PlayParameters,
    ) {
        let Some(mixer) = state.clip_mixers.get_mut(&id) else {
            return;
        };
        // Instants sound the clip at its own pitch
        let f0 = mixer.clip_f0().unwrap_or(440.0);

        let mut offset = 0;
        while offset < frames {
            let chunk = PLUGIN_BLOCK_SIZE.min(frames - offset);
            let lo = start_frame + offset;
            let starts: Vec<NoteStart> = sparse
                .instants_in(lo, lo + chunk)
                .into_iter()
                .map(|f| NoteStart {
                    frame_offset: f - lo,
                    frequency: f0,
                    level: 1.0,
                    pan: params.pan,
                })
                .collect();
            mixer.mix(buffers, offset, chunk, params.gain, &starts, &[]);
            offset += chunk;
        }
    }

    #[allow(clippy::too_many_arguments)]
    fn mix_note(
        &self,
        state: &mut GeneratorState,
        id: ModelId,
        notes: &dyn NoteModel,
        start_frame: usize,
        frames: usize,
        buffers: &mut [Vec<Sample>],
        params: &PlayParameters,
    ) {
        let targets = state.target_channels.min(buffers.len());
        let rate = self.source_sample_rate().max(1);

        let mut offset = 0;
        while offset < frames {
            let chunk = PLUGIN_BLOCK_SIZE.min(frames - offset);
            let lo = start_frame + offset;
            let hi = lo + chunk;

            let mut starts = Vec::new();
            let mut ends = Vec::new();
            {
                let offs = state.note_offs.entry(id).or_default();
                for note in notes.notes_in(lo, hi) {
                    starts.push(NoteStart {
                        frame_offset: note.frame - lo,
                        frequency: note.frequency(),
                        level: note.velocity.clamp(0.01, 1.0),
                        pan: params.pan,
                    });
                    offs.insert(NoteOff::new(note.frame + note.duration.max(1), note.frequency()));
                }
                while let Some(first) = offs.first().copied() {
                    if first.frame >= hi {
                        break;
                    }
                    offs.remove(&first);
                    ends.push(NoteEnd {
                        frame_offset: first.frame.saturating_sub(lo).min(chunk.saturating_sub(1)),
                        frequency: first.frequency(),
                    });
                }
            }

            let mut synth_disabled = false;
            if let Some(synth) = state.synths.get_mut(&id) {
                let events: Vec<NoteEvent> = starts
                    .iter()
                    .map(|s| NoteEvent {
                        frame_offset: s.frame_offset,
                        kind: NoteEventKind::On {
                            frequency: s.frequency,
                            velocity: s.level,
                        },
                    })
                    .chain(ends.iter().map(|e| NoteEvent {
                        frame_offset: e.frame_offset,
                        kind: NoteEventKind::Off { frequency: e.frequency },
                    }))
                    .collect();

                let mut scratch = vec![vec![0.0; chunk]; targets];
                let begun = Instant::now();
                synth.plugin.run(chunk, &events, &mut scratch);
                let budget = chunk as f64 / rate as f64;

                if begun.elapsed().as_secs_f64() > budget {
                    synth.overloads += 1;
                    if synth.overloads >= OVERLOAD_LIMIT {
                        synth_disabled = true;
                    }
                } else {
                    synth.overloads = 0;
                }

                for (t, channel) in scratch.iter().enumerate() {
                    let g = params.gain * pan_gain(params.pan, t, targets);
                    let out = &mut buffers[t];
                    for (i, &s) in channel.iter().enumerate() {
                        out[offset + i] += s * g;
                    }
                }
            } else if let Some(mixer) = state.clip_mixers.get_mut(&id) {
                mixer.mix(buffers, offset, chunk, params.gain, &starts, &ends);
            }

            if synth_disabled {
                log::warn!("synth plugin for model overloaded; falling back to clip");
                state.synths.remove(&id);
                self.events.emit(PlaySourceEvent::PluginOverloaded { model: id });
            }

            offset += chunk;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::test_support::{ConstantModel, InstantsModel, NotesModel};
    use crate::model::{Note, PluginSpec};
    use std::sync::atomic::AtomicUsize;

    fn generator() -> AudioGenerator {
        AudioGenerator::new(Arc::new(EventDispatcher::new()), None)
    }

    fn buffers(channels: usize, frames: usize) -> Vec<Vec<Sample>> {
        vec![vec![0.0; frames]; channels]
    }

    fn rms(samples: &[Sample]) -> f32 {
        (samples.iter().map(|x| x * x).sum::<f32>() / samples.len() as f32).sqrt()
    }

    fn constant(value: Sample, channels: usize, frames: usize) -> Arc<dyn Model> {
        Arc::new(ConstantModel {
            value,
            channels,
            rate: 44100,
            frames,
        })
    }

    #[test]
    fn test_mono_model_pans_centre_into_stereo() {
        let gen = generator();
        let model = constant(0.5, 1, 4096);
        assert!(gen.add_model(&model));

        let mut out = buffers(2, 1024);
        let got = gen.mix_model(&model, 0, 1024, &mut out, 0, 0);
        assert_eq!(got, 1024);

        let expected = 0.5 / 2f32.sqrt();
        assert!((out[0][100] - expected).abs() < 1e-5);
        assert!((out[1][100] - expected).abs() < 1e-5);
        // Equal energy left and right
        assert!((rms(&out[0]) - rms(&out[1])).abs() < 1e-5);
    }

    #[test]
    fn test_stereo_model_passes_through() {
        let gen = generator();
        let model = constant(0.25, 2, 4096);
        gen.add_model(&model);

        let mut out = buffers(2, 1024);
        gen.mix_model(&model, 0, 1024, &mut out, 0, 0);
        assert!((out[0][0] - 0.25).abs() < 1e-6);
        assert!((out[1][0] - 0.25).abs() < 1e-6);
    }

    #[test]
    fn test_mixing_is_additive_and_linear() {
        let gen = generator();
        let a = constant(0.3, 1, 4096);
        let b = constant(0.2, 1, 4096);
        let sum = constant(0.5, 1, 4096);
        gen.add_model(&a);
        gen.add_model(&b);
        gen.add_model(&sum);

        let mut separate = buffers(2, 1024);
        gen.mix_model(&a, 0, 1024, &mut separate, 0, 0);
        gen.mix_model(&b, 0, 1024, &mut separate, 0, 0);

        let mut combined = buffers(2, 1024);
        gen.mix_model(&sum, 0, 1024, &mut combined, 0, 0);

        for i in 0..1024 {
            assert!((separate[0][i] - combined[0][i]).abs() < 1e-6);
        }
    }

    #[test]
    fn test_gain_and_mute_parameters() {
        let gen = generator();
        let model = constant(0.5, 2, 4096);
        gen.add_model(&model);
        let id = ModelId::of(&model);

        gen.set_play_parameters(
            id,
            PlayParameters { gain: 0.5, ..Default::default() },
        );
        let mut out = buffers(2, 1024);
        gen.mix_model(&model, 0, 1024, &mut out, 0, 0);
        assert!((out[0][0] - 0.25).abs() < 1e-6);

        gen.set_play_parameters(
            id,
            PlayParameters { muted: true, ..Default::default() },
        );
        let mut silent = buffers(2, 1024);
        let got = gen.mix_model(&model, 0, 1024, &mut silent, 0, 0);
        assert_eq!(got, 1024);
        assert!(silent[0].iter().all(|&x| x == 0.0));
    }

    #[test]
    fn test_model_end_truncates_render() {
        let gen = generator();
        let model = constant(0.5, 1, 1500);
        gen.add_model(&model);

        let mut out = buffers(2, 2048);
        let got = gen.mix_model(&model, 1024, 2048, &mut out, 0, 0);
        assert_eq!(got, 476);
        assert!(out[0][475].abs() > 0.0);
        assert!(out[0][476] == 0.0);

        let past = gen.mix_model(&model, 4096, 1024, &mut out, 0, 0);
        assert_eq!(past, 0);
    }

    #[test]
    fn test_fade_envelopes_ramp_edges() {
        let gen = generator();
        let model = constant(1.0, 2, 8192);
        gen.add_model(&model);

        let mut out = buffers(2, 1024);
        gen.mix_model(&model, 0, 1024, &mut out, 100, 100);
        // Leading edge ramps up from near zero
        assert!(out[0][0] < 0.05);
        assert!(out[0][99] > 0.9);
        // Trailing edge ramps back down
        assert!(out[0][1023] < 0.05);
        assert!(out[0][900] > 0.9);
    }

    #[test]
    fn test_sparse_instants_sound_in_their_windows() {
        let gen = generator();
        gen.set_clip(ClipData::from_samples(vec![1.0; 11025], 44100, 440.0));

        let model: Arc<dyn Model> = Arc::new(InstantsModel {
            frames: vec![0, 22050, 44100],
            rate: 44100,
            end: 44101,
        });
        gen.add_model(&model);

        let total = 57344;
        let mut out = buffers(2, total);
        let mut frame = 0;
        while frame < total {
            let mut block = buffers(2, PLUGIN_BLOCK_SIZE);
            gen.mix_model(&model, frame, PLUGIN_BLOCK_SIZE, &mut block, 0, 0);
            for c in 0..2 {
                for i in 0..PLUGIN_BLOCK_SIZE {
                    out[c][frame + i] += block[c][i];
                }
            }
            frame += PLUGIN_BLOCK_SIZE;
        }

        // Loud while each clip instance sounds, silent (-60 dBFS) between
        assert!(rms(&out[0][1000..10000]) > 0.3);
        assert!(rms(&out[0][12000..21000]) < 1e-3);
        assert!(rms(&out[0][23000..32000]) > 0.3);
        assert!(rms(&out[0][34000..43000]) < 1e-3);
        assert!(rms(&out[0][45000..54000]) > 0.3);
    }

    #[test]
    fn test_note_offs_close_voices() {
        let gen = generator();
        gen.set_clip(ClipData::from_samples(vec![1.0; 441000], 44100, 440.0));

        let model: Arc<dyn Model> = Arc::new(NotesModel {
            notes: vec![Note { frame: 0, duration: 2048, pitch: 69.0, velocity: 1.0 }],
            rate: 44100,
            end: 2048,
        });
        gen.add_model(&model);

        let mut sounding = buffers(2, 2048);
        gen.mix_model(&model, 0, 2048, &mut sounding, 0, 0);
        assert!(rms(&sounding[0][500..2048]) > 0.3);

        // The pending note-off falls in this block and fades the voice out
        let mut closing = buffers(2, 1024);
        gen.mix_model(&model, 2048, 1024, &mut closing, 0, 0);

        // By the next block the voice is gone
        let mut after = buffers(2, 1024);
        gen.mix_model(&model, 3072, 1024, &mut after, 0, 0);
        assert!(rms(&after[0]) < 1e-4);
    }

    struct CountingSynth {
        runs: Arc<AtomicUsize>,
        value: Sample,
    }

    impl SynthPlugin for CountingSynth {
        fn run(&mut self, frames: usize, _events: &[NoteEvent], outputs: &mut [Vec<Sample>]) {
            self.runs.fetch_add(1, Ordering::SeqCst);
            for out in outputs.iter_mut() {
                out[..frames].fill(self.value);
            }
        }
    }

    struct TestHost {
        runs: Arc<AtomicUsize>,
    }

    impl PluginHost for TestHost {
        fn load(&self, id: &str, _program: Option<&str>) -> Option<Box<dyn SynthPlugin>> {
            if id == "test-synth" {
                Some(Box::new(CountingSynth { runs: self.runs.clone(), value: 0.25 }))
            } else {
                None
            }
        }
    }

    #[test]
    fn test_note_model_uses_plugin_when_configured() {
        let runs = Arc::new(AtomicUsize::new(0));
        let host = Arc::new(TestHost { runs: runs.clone() });
        let gen = AudioGenerator::new(Arc::new(EventDispatcher::new()), Some(host));

        let model: Arc<dyn Model> = Arc::new(NotesModel {
            notes: vec![Note { frame: 0, duration: 512, pitch: 69.0, velocity: 1.0 }],
            rate: 44100,
            end: 1024,
        });
        let id = ModelId::of(&model);
        gen.set_play_parameters(
            id,
            PlayParameters {
                plugin: Some(PluginSpec { id: "test-synth".into(), program: None }),
                ..Default::default()
            },
        );
        gen.add_model(&model);

        let mut out = buffers(2, 1024);
        gen.mix_model(&model, 0, 1024, &mut out, 0, 0);
        assert_eq!(runs.load(Ordering::SeqCst), 1);
        // Plugin output is panned centre into both channels
        let expected = 0.25 / 2f32.sqrt();
        assert!((out[0][10] - expected).abs() < 1e-5);
    }

    struct SlowSynth;

    impl SynthPlugin for SlowSynth {
        fn run(&mut self, _frames: usize, _events: &[NoteEvent], _outputs: &mut [Vec<Sample>]) {
            std::thread::sleep(std::time::Duration::from_millis(60));
        }
    }

    struct SlowHost;

    impl PluginHost for SlowHost {
        fn load(&self, _id: &str, _program: Option<&str>) -> Option<Box<dyn SynthPlugin>> {
            Some(Box::new(SlowSynth))
        }
    }

    #[test]
    fn test_overloading_plugin_is_disabled() {
        let events = Arc::new(EventDispatcher::new());
        let overloads = Arc::new(AtomicUsize::new(0));
        let seen = overloads.clone();
        events.subscribe(move |ev| {
            if matches!(ev, PlaySourceEvent::PluginOverloaded { .. }) {
                seen.fetch_add(1, Ordering::SeqCst);
            }
        });
        let gen = AudioGenerator::new(events, Some(Arc::new(SlowHost)));

        let model: Arc<dyn Model> = Arc::new(NotesModel {
            notes: vec![],
            rate: 44100,
            end: 441000,
        });
        let id = ModelId::of(&model);
        gen.set_play_parameters(
            id,
            PlayParameters {
                plugin: Some(PluginSpec { id: "slow".into(), program: None }),
                ..Default::default()
            },
        );
        gen.add_model(&model);

        // A 1024-frame block at 44.1kHz gives the plugin ~23ms; 60ms runs
        // blow the budget every time, so the third strike disables it
        let mut out = buffers(2, PLUGIN_BLOCK_SIZE);
        for block in 0..4 {
            gen.mix_model(&model, block * PLUGIN_BLOCK_SIZE, PLUGIN_BLOCK_SIZE, &mut out, 0, 0);
        }
        assert_eq!(overloads.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_remove_model_leaves_no_trace() {
        let gen = generator();
        let model: Arc<dyn Model> = Arc::new(InstantsModel {
            frames: vec![0],
            rate: 44100,
            end: 1,
        });
        gen.add_model(&model);
        let id = ModelId::of(&model);
        gen.set_play_parameters(id, PlayParameters { gain: 0.5, ..Default::default() });

        gen.remove_model(id);
        gen.remove_model(id);
        assert_eq!(gen.play_parameters(id), PlayParameters::default());
    }
}
