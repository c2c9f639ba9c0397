//! Callback play source - supplies mixed audio to a pull-based device
//!
//! `AudioCallbackPlaySource` manages audio data supply to callback-based
//! audio APIs. It keeps one ring buffer per playback channel, filled ahead
//! of time by a non-realtime fill thread, and lets the device's realtime
//! thread pick up the latest available samples with `get_source_samples`.
//!
//! # Threads
//!
//! - **Callback thread** (external, realtime): only touches the read side
//!   of the ring buffers, the resampler state, the scavengers and a set of
//!   atomics. It never locks, allocates, or calls into a model.
//! - **Fill thread** (owned): holds the state mutex while it mixes models
//!   into the write side, and parks on a condition variable when the
//!   buffers are full.
//! - **Control threads**: model management and transport calls, all
//!   serialised by the state mutex.
//!
//! Replaced ring-buffer sets and stretcher states are handed to
//! scavengers rather than freed, so an in-flight callback can finish with
//! the instance it loaded.

use std::cell::UnsafeCell;
use std::ops::Range;
use std::sync::atomic::{AtomicBool, AtomicPtr, AtomicU32, AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Condvar, Mutex};
use std::thread::JoinHandle;
use std::time::Duration;

use rubato::{FastFixedOut, PolynomialDegree, Resampler};

use crate::model::{Model, ModelId, ModelKind, PlayParameters};
use crate::ring_buffer::RingBuffer;
use crate::scavenger::Scavenger;
use crate::timestretch::{IntegerTimeStretcher, TimeStretchError, WindowType};
use crate::types::{block_peak, smooth_level, Sample};

use super::clip_mixer::{ClipData, ClipLoadError};
use super::events::{EventDispatcher, PlaySourceEvent};
use super::generator::AudioGenerator;
use super::plugin::PluginHost;

/// Per-channel ring buffer length in frames
///
/// Must cover at least two device blocks at the largest supported
/// slowdown factor; this matches roughly three seconds at 44.1kHz.
pub const RING_BUFFER_SIZE: usize = 131071;

/// Crossfade applied when stitching a loop boundary
const CROSSFADE_MS: usize = 15;

/// Fill thread wait timeout, so scavenging keeps moving even when the
/// callback has stopped signalling
const FILL_WAIT_MS: u64 = 100;

/// Analysis hop used by the slowdown stretchers
const STRETCH_INPUT_INCREMENT: usize = 128;

/// Smallest stretch analysis window; widened to keep 75% overlap at
/// higher factors
const STRETCH_MIN_WINDOW: usize = 2048;

// ---------------------------------------------------------------------------
// RingBufferVector
// ---------------------------------------------------------------------------

/// The swap unit between the fill thread and the callback
///
/// Owns one ring buffer per playback channel, all of equal capacity, plus
/// the sample-rate converter state the callback uses when the device rate
/// differs from the source rate. The whole object is replaced (and the old
/// one scavenged) on any channel-count, buffer-size or sample-rate change,
/// which is why the converter lives here: its lifetime rides the same
/// swaps.
pub struct RingBufferVector {
    buffers: Vec<RingBuffer<Sample>>,
    converter: Option<UnsafeCell<SampleRateConverter>>,
}

// SAFETY: the ring buffers are SPSC-safe by themselves; the converter
// cell is only ever accessed by the single callback thread.
unsafe impl Sync for RingBufferVector {}

impl RingBufferVector {
    fn new(channels: usize, size: usize, converter: Option<SampleRateConverter>) -> Self {
        Self {
            buffers: (0..channels).map(|_| RingBuffer::new(size)).collect(),
            converter: converter.map(UnsafeCell::new),
        }
    }

    /// Number of playback channels
    pub fn channels(&self) -> usize {
        self.buffers.len()
    }

    /// One channel's ring buffer
    pub fn buffer(&self, channel: usize) -> &RingBuffer<Sample> {
        &self.buffers[channel]
    }

    fn buffers(&self) -> &[RingBuffer<Sample>] {
        &self.buffers
    }

    fn read_space(&self) -> usize {
        self.buffers
            .iter()
            .map(|b| b.read_space())
            .min()
            .unwrap_or(0)
    }

    fn write_space(&self) -> usize {
        self.buffers
            .iter()
            .map(|b| b.write_space())
            .min()
            .unwrap_or(0)
    }
}

// ---------------------------------------------------------------------------
// SampleRateConverter
// ---------------------------------------------------------------------------

/// Streaming source-to-device rate conversion for the callback
///
/// Wraps a polynomial resampler with fixed output chunks. All staging is
/// allocated at construction; `process` is allocation-free and so safe on
/// the callback thread.
struct SampleRateConverter {
    inner: FastFixedOut<Sample>,
    channels: usize,
    chunk: usize,
    input: Vec<Vec<Sample>>,
    output: Vec<Vec<Sample>>,
    stash: Vec<Vec<Sample>>,
    stash_len: usize,
    delay: usize,
}

impl SampleRateConverter {
    fn new(
        source_rate: u32,
        target_rate: u32,
        channels: usize,
        chunk: usize,
    ) -> Result<Self, rubato::ResamplerConstructionError> {
        let ratio = target_rate as f64 / source_rate as f64;
        let inner =
            FastFixedOut::<Sample>::new(ratio, 1.1, PolynomialDegree::Cubic, chunk, channels)?;
        let max_input = inner.input_frames_max();
        let delay = inner.output_delay();
        Ok(Self {
            inner,
            channels,
            chunk,
            input: vec![vec![0.0; max_input]; channels],
            output: vec![vec![0.0; chunk]; channels],
            stash: vec![vec![0.0; chunk * 2]; channels],
            stash_len: 0,
            delay,
        })
    }

    /// Latency introduced by the converter, in device frames
    fn delay(&self) -> usize {
        self.delay
    }

    /// Emit up to `want` device-rate frames into `outputs`
    ///
    /// Reads whatever source frames the conversion needs from `rings`,
    /// zero-padding if the fill thread is behind. Returns
    /// `(frames written, source frames consumed, starved)`.
    fn process(
        &mut self,
        rings: &[RingBuffer<Sample>],
        want: usize,
        outputs: &mut [&mut [Sample]],
    ) -> (usize, usize, bool) {
        let want = want.min(self.chunk);
        let mut consumed = 0;
        let mut starved = false;

        while self.stash_len < want {
            let need = self.inner.input_frames_next();
            let avail = rings.iter().map(|r| r.read_space()).min().unwrap_or(0);
            let got = need.min(avail);
            for (c, ring) in rings.iter().enumerate() {
                let read = ring.read(&mut self.input[c][..got]);
                debug_assert_eq!(read, got);
                self.input[c][got..need].fill(0.0);
            }
            if got < need {
                starved = true;
            }
            consumed += got;

            match self
                .inner
                .process_into_buffer(&self.input, &mut self.output, None)
            {
                Ok((_, written)) => {
                    for c in 0..self.channels {
                        self.stash[c][self.stash_len..self.stash_len + written]
                            .copy_from_slice(&self.output[c][..written]);
                    }
                    self.stash_len += written;
                }
                Err(_) => break,
            }
        }

        let n = want.min(self.stash_len);
        for (o, out) in outputs.iter_mut().enumerate() {
            let c = o % self.channels;
            out[..n].copy_from_slice(&self.stash[c][..n]);
        }
        for c in 0..self.channels {
            self.stash[c].copy_within(n..self.stash_len, 0);
        }
        self.stash_len -= n;

        (n, consumed, starved)
    }
}

// ---------------------------------------------------------------------------
// TimeStretcherData
// ---------------------------------------------------------------------------

/// Slowdown state: one stretcher per playback channel
///
/// A shared input staging buffer (the generator's output is copied in one
/// channel at a time) and per-channel output buffers sized for one block
/// at the stretch factor.
pub struct TimeStretcherData {
    stretchers: Vec<IntegerTimeStretcher>,
    input: Vec<f64>,
    outputs: Vec<Vec<f64>>,
    factor: usize,
}

impl TimeStretcherData {
    fn new(channels: usize, factor: usize, block_size: usize) -> Result<Self, TimeStretchError> {
        let n2 = STRETCH_INPUT_INCREMENT * factor;
        let window = STRETCH_MIN_WINDOW.max(4 * n2);
        let stretchers = (0..channels)
            .map(|_| {
                IntegerTimeStretcher::new(
                    factor,
                    block_size,
                    STRETCH_INPUT_INCREMENT,
                    window,
                    WindowType::Hann,
                )
            })
            .collect::<Result<Vec<_>, _>>()?;
        Ok(Self {
            stretchers,
            input: vec![0.0; block_size],
            outputs: vec![vec![0.0; block_size * factor]; channels],
            factor,
        })
    }

    /// The integer slowdown factor
    pub fn factor(&self) -> usize {
        self.factor
    }

    /// Processing latency in source frames
    pub fn latency(&self) -> usize {
        self.stretchers.first().map(|s| s.latency()).unwrap_or(0)
    }

    fn load_input(&mut self, samples: &[Sample]) {
        for (d, &s) in self.input.iter_mut().zip(samples.iter()) {
            *d = s as f64;
        }
    }

    fn run(&mut self, channel: usize, frames: usize) {
        let stretcher = &mut self.stretchers[channel];
        stretcher.process(
            &self.input[..frames],
            &mut self.outputs[channel][..frames * self.factor],
        );
    }

    fn output(&self, channel: usize) -> &[f64] {
        &self.outputs[channel]
    }
}

// ---------------------------------------------------------------------------
// AudioCallbackPlaySource
// ---------------------------------------------------------------------------

/// Raw pointer wrappers so the state can cross the fill-thread boundary;
/// ownership is managed explicitly through the scavengers.
struct BufPtr(*mut RingBufferVector);
unsafe impl Send for BufPtr {}

struct StretchPtr(*mut TimeStretcherData);
unsafe impl Send for StretchPtr {}

struct State {
    models: Vec<Arc<dyn Model>>,
    write_buffers: BufPtr,
    stretcher: StretchPtr,
    /// Next source frame the fill thread will produce
    write_buffer_fill: usize,
    loop_range: Option<Range<usize>>,
    /// Fade-in owed to the next fill after a loop wrap
    pending_fade_in: usize,
    /// Maximum channel count over the dense models
    source_channels: usize,
}

struct Inner {
    state: Mutex<State>,
    condition: Condvar,
    generator: AudioGenerator,
    events: Arc<EventDispatcher>,

    /// Read-side buffer pointer, acquire-loaded by the callback
    read_buffers: AtomicPtr<RingBufferVector>,

    playing: AtomicBool,
    exiting: AtomicBool,
    source_sample_rate: AtomicU32,
    target_sample_rate: AtomicU32,
    target_block_size: AtomicUsize,
    play_latency: AtomicUsize,
    playback_channels: AtomicUsize,
    slowdown: AtomicUsize,
    stretch_latency: AtomicUsize,
    resampler_delay: AtomicUsize,
    play_start_frame: AtomicUsize,
    /// Ring frames consumed by the callback since `play`
    ring_frames_read: AtomicU64,
    last_model_end: AtomicUsize,
    ended: AtomicBool,
    underruns: AtomicUsize,
    output_left: AtomicU32,
    output_right: AtomicU32,

    buffer_scavenger: Scavenger<RingBufferVector>,
    stretcher_scavenger: Scavenger<TimeStretcherData>,
}

/// Double-buffered bridge between model mixing and a realtime callback
pub struct AudioCallbackPlaySource {
    inner: Arc<Inner>,
    fill_thread: Option<JoinHandle<()>>,
}

impl AudioCallbackPlaySource {
    /// Create a play source with no plugin host
    pub fn new() -> Self {
        Self::with_plugin_host(None)
    }

    /// Create a play source, optionally with a synth plugin host for note
    /// models
    pub fn with_plugin_host(host: Option<Arc<dyn PluginHost>>) -> Self {
        let events = Arc::new(EventDispatcher::new());
        let inner = Arc::new(Inner {
            state: Mutex::new(State {
                models: Vec::new(),
                write_buffers: BufPtr(std::ptr::null_mut()),
                stretcher: StretchPtr(std::ptr::null_mut()),
                write_buffer_fill: 0,
                loop_range: None,
                pending_fade_in: 0,
                source_channels: 0,
            }),
            condition: Condvar::new(),
            generator: AudioGenerator::new(events.clone(), host),
            events,
            read_buffers: AtomicPtr::new(std::ptr::null_mut()),
            playing: AtomicBool::new(false),
            exiting: AtomicBool::new(false),
            source_sample_rate: AtomicU32::new(0),
            target_sample_rate: AtomicU32::new(0),
            target_block_size: AtomicUsize::new(1024),
            play_latency: AtomicUsize::new(0),
            playback_channels: AtomicUsize::new(0),
            slowdown: AtomicUsize::new(1),
            stretch_latency: AtomicUsize::new(0),
            resampler_delay: AtomicUsize::new(0),
            play_start_frame: AtomicUsize::new(0),
            ring_frames_read: AtomicU64::new(0),
            last_model_end: AtomicUsize::new(0),
            ended: AtomicBool::new(false),
            underruns: AtomicUsize::new(0),
            output_left: AtomicU32::new(0f32.to_bits()),
            output_right: AtomicU32::new(0f32.to_bits()),
            buffer_scavenger: Scavenger::with_defaults(),
            stretcher_scavenger: Scavenger::with_defaults(),
        });

        let fill_inner = inner.clone();
        let fill_thread = std::thread::Builder::new()
            .name("playback-fill".to_string())
            .spawn(move || fill_loop(fill_inner))
            .expect("failed to spawn playback fill thread");

        Self {
            inner,
            fill_thread: Some(fill_thread),
        }
    }

    // --- Model management ---

    /// Add a data model to be played from
    ///
    /// The source mixes playback from any number of dense, sparse and note
    /// models. The first model's sample rate is adopted; a later model
    /// with a different rate is rejected with a `SampleRateMismatch`
    /// event. Returns whether the model was accepted.
    pub fn add_model(&self, model: Arc<dyn Model>) -> bool {
        let inner = &self.inner;
        let mut state = inner.state.lock().unwrap();

        let rate = model.sample_rate();
        let current = inner.source_sample_rate.load(Ordering::Acquire);
        if !state.models.is_empty() && rate != current {
            drop(state);
            log::warn!("model rejected: {}Hz against adopted {}Hz", rate, current);
            inner.events.emit(PlaySourceEvent::SampleRateMismatch {
                requested: rate,
                available: current,
            });
            return false;
        }
        if state.models.is_empty() {
            inner.source_sample_rate.store(rate, Ordering::Release);
            inner.generator.set_source_sample_rate(rate);
        }

        let id = ModelId::of(&model);
        if state.models.iter().any(|m| ModelId::of(m) == id) {
            return true;
        }

        inner.generator.add_model(&model);
        let model_channels = match model.kind() {
            ModelKind::Dense(d) => d.channel_count(),
            _ => 1,
        };
        inner
            .last_model_end
            .fetch_max(model.end_frame(), Ordering::AcqRel);
        inner.ended.store(false, Ordering::Release);
        state.models.push(model);

        let channels = state.source_channels.max(model_channels);
        if channels != state.source_channels || state.write_buffers.0.is_null() {
            state.source_channels = channels;
            inner.reconfigure_buffers(&mut state);
        }
        drop(state);

        inner.events.emit(PlaySourceEvent::ModelReplaced);
        inner.condition.notify_all();
        true
    }

    /// Remove a model
    ///
    /// After this returns, no subsequent callback output contains samples
    /// rendered from the model: buffered audio is re-rendered from the
    /// current playing position without it. Removing a model that was
    /// never added (or already removed) is a no-op.
    pub fn remove_model(&self, model: &Arc<dyn Model>) {
        let inner = &self.inner;
        let mut state = inner.state.lock().unwrap();
        let id = ModelId::of(model);
        let Some(position) = state.models.iter().position(|m| ModelId::of(m) == id) else {
            return;
        };
        state.models.remove(position);
        inner.generator.remove_model(id);
        inner.rebuild_model_summary(&mut state);
        drop(state);

        inner.events.emit(PlaySourceEvent::ModelReplaced);
        inner.condition.notify_all();
    }

    /// Remove all models; silence will ensue
    pub fn clear_models(&self) {
        let inner = &self.inner;
        let mut state = inner.state.lock().unwrap();
        for model in state.models.drain(..).collect::<Vec<_>>() {
            inner.generator.remove_model(ModelId::of(&model));
        }
        inner.rebuild_model_summary(&mut state);
        drop(state);
        inner.events.emit(PlaySourceEvent::ModelReplaced);
    }

    /// Update a model's play parameters (gain, pan, mute, plugin)
    pub fn set_play_parameters(&self, model: &Arc<dyn Model>, params: PlayParameters) {
        self.inner
            .generator
            .set_play_parameters(ModelId::of(model), params);
    }

    /// Current play parameters for a model
    pub fn play_parameters(&self, model: &Arc<dyn Model>) -> PlayParameters {
        self.inner.generator.play_parameters(ModelId::of(model))
    }

    /// Install the clip used to sound sparse and note models
    pub fn set_clip(&self, clip: ClipData) {
        self.inner.generator.set_clip(clip);
    }

    /// Load the sparse/note clip from a WAV file
    ///
    /// Failure is non-fatal: sparse and note playback stays silent.
    pub fn load_clip(&self, path: impl AsRef<std::path::Path>, f0: f32) -> Result<(), ClipLoadError> {
        let clip = ClipData::from_wav_file(path, f0)?;
        self.set_clip(clip);
        Ok(())
    }

    // --- Transport ---

    /// Start making data available from the given frame
    ///
    /// If playback is already under way, reseeks and continues.
    pub fn play(&self, start_frame: usize) {
        let inner = &self.inner;
        let mut state = inner.state.lock().unwrap();

        inner.generator.reset();
        state.write_buffer_fill = start_frame;
        state.pending_fade_in = 0;
        inner.play_start_frame.store(start_frame, Ordering::Release);
        inner.ring_frames_read.store(0, Ordering::Release);
        inner.ended.store(false, Ordering::Release);
        inner.reconfigure_buffers(&mut state);

        let was_playing = inner.playing.swap(true, Ordering::AcqRel);
        drop(state);

        if !was_playing {
            inner.events.emit(PlaySourceEvent::PlayStatusChanged(true));
        }
        inner.condition.notify_all();
    }

    /// Stop playback; the callback returns silence until the next `play`
    pub fn stop(&self) {
        let was_playing = self.inner.playing.swap(false, Ordering::AcqRel);
        if was_playing {
            self.inner
                .events
                .emit(PlaySourceEvent::PlayStatusChanged(false));
        }
        self.inner.condition.notify_all();
    }

    /// Whether playback is currently supposed to be happening
    pub fn is_playing(&self) -> bool {
        self.inner.playing.load(Ordering::Acquire)
    }

    /// Constrain playback to a loop over `[start, end)` source frames
    ///
    /// The boundary is stitched with a short crossfade. `None` clears the
    /// loop.
    pub fn set_loop(&self, range: Option<Range<usize>>) {
        let mut state = self.inner.state.lock().unwrap();
        state.loop_range = range.filter(|r| r.end > r.start);
        self.inner.condition.notify_all();
    }

    /// The frame currently expected to be coming out of the speakers
    ///
    /// Compensates for device latency, resampler delay and the stretcher's
    /// processing latency; clamped to the end of the last model.
    pub fn get_current_playing_frame(&self) -> usize {
        let inner = &self.inner;
        let source_rate = inner.source_sample_rate.load(Ordering::Acquire).max(1);
        let target_raw = inner.target_sample_rate.load(Ordering::Acquire);
        let target_rate = if target_raw == 0 { source_rate } else { target_raw };
        let factor = inner.slowdown.load(Ordering::Acquire).max(1);

        let ring_read = inner.ring_frames_read.load(Ordering::Acquire) as usize;
        let latency_target =
            inner.play_latency.load(Ordering::Acquire) + inner.resampler_delay.load(Ordering::Acquire);
        let latency_ring =
            (latency_target as u64 * source_rate as u64 / target_rate as u64) as usize;

        let progressed = ring_read.saturating_sub(latency_ring) / factor;
        let frame = (inner.play_start_frame.load(Ordering::Acquire) + progressed)
            .saturating_sub(inner.stretch_latency.load(Ordering::Acquire));

        let last = inner.last_model_end.load(Ordering::Acquire);
        if last > 0 {
            frame.min(last)
        } else {
            frame
        }
    }

    // --- Device configuration ---

    /// Set the block size of the target audio device
    pub fn set_target_block_size(&self, frames: usize) {
        self.inner.target_block_size.store(frames, Ordering::Release);
        let mut state = self.inner.state.lock().unwrap();
        if !state.write_buffers.0.is_null() {
            self.inner.reconfigure_buffers(&mut state);
        }
    }

    pub fn target_block_size(&self) -> usize {
        self.inner.target_block_size.load(Ordering::Acquire)
    }

    /// Set the playback latency of the target device, in frames at the
    /// target rate
    pub fn set_target_play_latency(&self, frames: usize) {
        self.inner.play_latency.store(frames, Ordering::Release);
    }

    pub fn target_play_latency(&self) -> usize {
        self.inner.play_latency.load(Ordering::Acquire)
    }

    /// Declare the device's fixed sample rate; the source resamples when
    /// it differs from the source rate
    pub fn set_target_sample_rate(&self, rate: u32) {
        self.inner.target_sample_rate.store(rate, Ordering::Release);
        let mut state = self.inner.state.lock().unwrap();
        if !state.write_buffers.0.is_null() {
            self.inner.reconfigure_buffers(&mut state);
        }
    }

    /// The device sample rate, or the source rate if none was set
    pub fn target_sample_rate(&self) -> u32 {
        let target = self.inner.target_sample_rate.load(Ordering::Acquire);
        if target == 0 {
            self.source_sample_rate()
        } else {
            target
        }
    }

    /// Sample rate of the source material; 0 until a model is added
    pub fn source_sample_rate(&self) -> u32 {
        self.inner.source_sample_rate.load(Ordering::Acquire)
    }

    /// Channel count of the source models (0 with no models)
    pub fn source_channel_count(&self) -> usize {
        self.inner.state.lock().unwrap().source_channels
    }

    /// Channels provided to the play target; a mono source provides two
    /// after panning
    pub fn target_channel_count(&self) -> usize {
        self.inner.playback_channels.load(Ordering::Acquire)
    }

    /// Engage (factor > 1) or disengage (factor = 1) slow-motion playback
    pub fn set_slowdown_factor(&self, factor: usize) {
        let factor = factor.max(1);
        let inner = &self.inner;
        let mut state = inner.state.lock().unwrap();
        if inner.slowdown.swap(factor, Ordering::AcqRel) == factor {
            return;
        }
        let channels = inner.playback_channels.load(Ordering::Acquire);
        inner.install_stretcher(&mut state, factor, channels);
        drop(state);
        inner.condition.notify_all();
    }

    pub fn slowdown_factor(&self) -> usize {
        self.inner.slowdown.load(Ordering::Acquire)
    }

    /// Number of callback pulls that found less data than requested
    pub fn underrun_count(&self) -> usize {
        self.inner.underruns.load(Ordering::Relaxed)
    }

    // --- Metering ---

    /// Push measured output levels (for call from the target)
    pub fn set_output_levels(&self, left: f32, right: f32) {
        self.inner.output_left.store(left.to_bits(), Ordering::Relaxed);
        self.inner.output_right.store(right.to_bits(), Ordering::Relaxed);
    }

    /// Current output levels in 0.0..=1.0 for metering
    pub fn get_output_levels(&self) -> (f32, f32) {
        (
            f32::from_bits(self.inner.output_left.load(Ordering::Relaxed)),
            f32::from_bits(self.inner.output_right.load(Ordering::Relaxed)),
        )
    }

    // --- Events ---

    /// Subscribe to play source events
    pub fn subscribe<F>(&self, callback: F)
    where
        F: Fn(&PlaySourceEvent) + Send + 'static,
    {
        self.inner.events.subscribe(callback);
    }

    // --- Realtime pull ---

    /// Get up to `count` frames of mixed audio, one slice per target
    /// channel
    ///
    /// Safe to call from a realtime thread: never blocks, locks or
    /// allocates. Returns the number of frames of real data written; on
    /// underrun the remainder of each slice is zero-filled and the
    /// underrun counter is incremented.
    pub fn get_source_samples(&self, count: usize, outputs: &mut [&mut [Sample]]) -> usize {
        let inner = &self.inner;
        if count == 0 || outputs.is_empty() || !inner.playing.load(Ordering::Acquire) {
            return 0;
        }
        let ptr = inner.read_buffers.load(Ordering::Acquire);
        if ptr.is_null() {
            return 0;
        }
        // SAFETY: the pointer was published with release ordering and any
        // replaced instance outlives this call via the scavenger's grace
        // interval.
        let buffers = unsafe { &*ptr };
        let channels = buffers.channels();
        if channels == 0 {
            return 0;
        }

        let (produced, consumed) = match &buffers.converter {
            None => {
                let avail = buffers.read_space();
                let n = count.min(avail);
                if n < count {
                    inner.underruns.fetch_add(1, Ordering::Relaxed);
                }
                let direct = outputs.len().min(channels);
                for (c, out) in outputs.iter_mut().take(direct).enumerate() {
                    let read = buffers.buffer(c).read(&mut out[..n]);
                    debug_assert_eq!(read, n);
                }
                for c in direct..channels {
                    buffers.buffer(c).skip(n);
                }
                if outputs.len() > channels {
                    let (head, tail) = outputs.split_at_mut(channels);
                    for (i, out) in tail.iter_mut().enumerate() {
                        let (src, dst) = (&head[i % channels], out);
                        dst[..n].copy_from_slice(&src[..n]);
                    }
                }
                (n, n)
            }
            Some(cell) => {
                // SAFETY: the converter is only ever touched here, on the
                // single callback thread.
                let converter = unsafe { &mut *cell.get() };
                let (n, used, starved) = converter.process(buffers.buffers(), count, outputs);
                if starved {
                    inner.underruns.fetch_add(1, Ordering::Relaxed);
                }
                (n, used)
            }
        };

        for out in outputs.iter_mut() {
            out[produced..count].fill(0.0);
        }

        inner
            .ring_frames_read
            .fetch_add(consumed as u64, Ordering::AcqRel);

        let left_peak = block_peak(&outputs[0][..produced]);
        let right_peak = if outputs.len() > 1 {
            block_peak(&outputs[1][..produced])
        } else {
            left_peak
        };
        let left = smooth_level(
            f32::from_bits(inner.output_left.load(Ordering::Relaxed)),
            left_peak,
        );
        let right = smooth_level(
            f32::from_bits(inner.output_right.load(Ordering::Relaxed)),
            right_peak,
        );
        inner.output_left.store(left.to_bits(), Ordering::Relaxed);
        inner.output_right.store(right.to_bits(), Ordering::Relaxed);

        inner.buffer_scavenger.scavenge();
        inner.stretcher_scavenger.scavenge();
        inner.condition.notify_one();

        produced
    }
}

impl Default for AudioCallbackPlaySource {
    fn default() -> Self {
        Self::new()
    }
}

impl Drop for AudioCallbackPlaySource {
    fn drop(&mut self) {
        {
            let _guard = self.inner.state.lock().unwrap();
            self.inner.exiting.store(true, Ordering::Release);
        }
        self.inner.condition.notify_all();
        if let Some(thread) = self.fill_thread.take() {
            let _ = thread.join();
        }

        let mut state = self.inner.state.lock().unwrap();
        let read = self
            .inner
            .read_buffers
            .swap(std::ptr::null_mut(), Ordering::AcqRel);
        let write = std::mem::replace(&mut state.write_buffers.0, std::ptr::null_mut());
        // SAFETY: the fill thread has exited and the callback contract
        // requires the device to be stopped before the source is dropped.
        unsafe {
            if !write.is_null() {
                drop(Box::from_raw(write));
            }
            if !read.is_null() && read != write {
                drop(Box::from_raw(read));
            }
            let stretcher = std::mem::replace(&mut state.stretcher.0, std::ptr::null_mut());
            if !stretcher.is_null() {
                drop(Box::from_raw(stretcher));
            }
        }
    }
}

impl Inner {
    /// Recompute channel count and model-end bookkeeping after removal,
    /// then swap in fresh buffers so no stale samples remain
    fn rebuild_model_summary(&self, state: &mut State) {
        let mut channels = 0;
        let mut last_end = 0;
        for model in &state.models {
            let c = match model.kind() {
                ModelKind::Dense(d) => d.channel_count(),
                _ => 1,
            };
            channels = channels.max(c);
            last_end = last_end.max(model.end_frame());
        }
        state.source_channels = channels;
        self.last_model_end.store(last_end, Ordering::Release);
        if state.models.is_empty() {
            self.source_sample_rate.store(0, Ordering::Release);
        }

        // Rewind production to what the listener has actually heard, so
        // the re-rendered buffers omit removed models seamlessly
        let factor = self.slowdown.load(Ordering::Acquire).max(1);
        let heard = self.play_start_frame.load(Ordering::Acquire)
            + (self.ring_frames_read.load(Ordering::Acquire) / factor as u64) as usize;
        state.write_buffer_fill = heard;
        self.reconfigure_buffers(state);
    }

    /// Swap in a freshly-allocated ring buffer set (and matching resampler
    /// state), scavenging the replaced instances
    fn reconfigure_buffers(&self, state: &mut State) {
        let channels = if state.source_channels == 0 {
            0
        } else {
            state.source_channels.max(2)
        };
        self.playback_channels.store(channels, Ordering::Release);
        if channels > 0 {
            self.generator.set_target_channel_count(channels);
        }

        let new_ptr = if channels > 0 {
            let source_rate = self.source_sample_rate.load(Ordering::Acquire);
            let target_rate = self.target_sample_rate.load(Ordering::Acquire);
            let converter = if source_rate != 0 && target_rate != 0 && source_rate != target_rate
            {
                let chunk = self.target_block_size.load(Ordering::Acquire).max(64);
                match SampleRateConverter::new(source_rate, target_rate, channels, chunk) {
                    Ok(converter) => {
                        self.resampler_delay.store(converter.delay(), Ordering::Release);
                        Some(converter)
                    }
                    Err(e) => {
                        log::warn!("resampler unavailable ({}); playing at source rate", e);
                        self.resampler_delay.store(0, Ordering::Release);
                        None
                    }
                }
            } else {
                self.resampler_delay.store(0, Ordering::Release);
                None
            };
            Box::into_raw(Box::new(RingBufferVector::new(
                channels,
                RING_BUFFER_SIZE,
                converter,
            )))
        } else {
            std::ptr::null_mut()
        };

        let old_read = self.read_buffers.swap(new_ptr, Ordering::AcqRel);
        let old_write = std::mem::replace(&mut state.write_buffers.0, new_ptr);
        // SAFETY: both pointers were created by Box::into_raw here; the
        // scavenger delays the free past any in-flight callback. They
        // normally alias, in which case a single claim is taken.
        unsafe {
            if !old_write.is_null() {
                self.buffer_scavenger.claim(Box::from_raw(old_write));
            }
            if !old_read.is_null() && old_read != old_write {
                self.buffer_scavenger.claim(Box::from_raw(old_read));
            }
        }

        let factor = self.slowdown.load(Ordering::Acquire).max(1);
        self.install_stretcher(state, factor, channels);
    }

    /// Install (or remove, for factor 1) the slowdown stretcher state
    fn install_stretcher(&self, state: &mut State, factor: usize, channels: usize) {
        let new_ptr = if factor > 1 && channels > 0 {
            match TimeStretcherData::new(channels, factor, self.generator.block_size()) {
                Ok(data) => {
                    self.stretch_latency.store(data.latency(), Ordering::Release);
                    Box::into_raw(Box::new(data))
                }
                Err(e) => {
                    log::warn!("time stretcher unavailable: {}", e);
                    self.stretch_latency.store(0, Ordering::Release);
                    std::ptr::null_mut()
                }
            }
        } else {
            self.stretch_latency.store(0, Ordering::Release);
            std::ptr::null_mut()
        };

        let old = std::mem::replace(&mut state.stretcher.0, new_ptr);
        if !old.is_null() {
            // SAFETY: created by Box::into_raw in this function.
            unsafe {
                self.stretcher_scavenger.claim(Box::from_raw(old));
            }
        }
    }

    /// Produce as much buffered audio as the write space allows
    ///
    /// Called from the fill thread with the state mutex held. Returns
    /// true if any work was done.
    fn fill_buffers(&self, state: &mut State) -> bool {
        let write_ptr = state.write_buffers.0;
        if write_ptr.is_null() {
            return false;
        }
        // SAFETY: the write pointer is owned by the state we hold the
        // mutex for; the callback never frees it.
        let buffers = unsafe { &*write_ptr };
        let channels = buffers.channels();
        if channels == 0 {
            return false;
        }

        let factor = self.slowdown.load(Ordering::Acquire).max(1);
        let block = self.generator.block_size();
        let unit = block * factor;
        let space = buffers.write_space();
        if space < unit {
            return false;
        }

        let mixable = (space / unit) * block;
        let mut frame = state.write_buffer_fill;
        let mut mix: Vec<Vec<Sample>> = vec![vec![0.0; mixable]; channels];
        let got = self.mix_models(state, &mut frame, mixable, &mut mix);
        if got == 0 {
            return false;
        }

        if factor > 1 && !state.stretcher.0.is_null() {
            // SAFETY: stretcher state is owned by the mutex-guarded state.
            let stretcher = unsafe { &mut *state.stretcher.0 };
            let mut staged = vec![0.0f32; block * factor];
            let mut offset = 0;
            while offset < got {
                let n = block.min(got - offset);
                for (c, channel_mix) in mix.iter().enumerate() {
                    stretcher.load_input(&channel_mix[offset..offset + n]);
                    stretcher.run(c, n);
                    for (s, &x) in staged[..n * factor]
                        .iter_mut()
                        .zip(stretcher.output(c).iter())
                    {
                        *s = x as f32;
                    }
                    buffers.buffer(c).write(&staged[..n * factor]);
                }
                offset += n;
            }
        } else {
            for (c, channel_mix) in mix.iter().enumerate() {
                buffers.buffer(c).write(&channel_mix[..got]);
            }
        }

        state.write_buffer_fill = frame;
        true
    }

    /// Mix all models into `buffers`, handling the loop boundary
    ///
    /// Returns the number of frames written, which is `count` or fewer
    /// when the loop end interrupts the fill; in that case `frame` comes
    /// back wrapped to the loop start.
    fn mix_models(
        &self,
        state: &mut State,
        frame: &mut usize,
        count: usize,
        buffers: &mut [Vec<Sample>],
    ) -> usize {
        let fade_in = std::mem::take(&mut state.pending_fade_in);
        if state.models.is_empty() {
            *frame += count;
            return count;
        }

        let rate = self.source_sample_rate.load(Ordering::Acquire).max(1) as usize;
        let crossfade = CROSSFADE_MS * rate / 1000;
        let block = self.generator.block_size();

        if let Some(range) = state.loop_range.clone() {
            if *frame >= range.start && *frame < range.end {
                let remaining = range.end - *frame;
                if remaining <= count {
                    // Shorter fill: render up to the loop end, fade the
                    // tail, and wrap for the next fill
                    let mix_count = (remaining + block - 1) / block * block;
                    let mut scratch: Vec<Vec<Sample>> =
                        vec![vec![0.0; mix_count]; buffers.len()];
                    for model in &state.models {
                        self.generator.mix_model(
                            model,
                            *frame,
                            mix_count,
                            &mut scratch,
                            fade_in.min(mix_count),
                            0,
                        );
                    }
                    let fade = crossfade.min(remaining);
                    for (channel, out) in buffers.iter_mut().enumerate() {
                        out[..remaining].copy_from_slice(&scratch[channel][..remaining]);
                        for i in 0..fade {
                            let at = remaining - fade + i;
                            out[at] *= (fade - i) as Sample / fade as Sample;
                        }
                    }
                    *frame = range.start;
                    state.pending_fade_in = crossfade;
                    return remaining;
                }
            }
        }

        for model in &state.models {
            self.generator
                .mix_model(model, *frame, count, buffers, fade_in.min(count), 0);
        }
        *frame += count;
        count
    }

    /// Emit `PlaybackEnded` once the listener has heard past the last
    /// model frame
    fn check_ended(&self, state: &State) {
        if self.ended.load(Ordering::Acquire) || state.loop_range.is_some() {
            return;
        }
        let last = self.last_model_end.load(Ordering::Acquire);
        if last == 0 || state.models.is_empty() {
            return;
        }
        let factor = self.slowdown.load(Ordering::Acquire).max(1);
        let heard = self.play_start_frame.load(Ordering::Acquire)
            + (self.ring_frames_read.load(Ordering::Acquire) / factor as u64) as usize;
        if heard >= last {
            self.ended.store(true, Ordering::Release);
            self.events.emit(PlaySourceEvent::PlaybackEnded);
        }
    }
}

/// Fill thread body: produce while playing, park while idle
fn fill_loop(inner: Arc<Inner>) {
    let mut guard = inner.state.lock().unwrap();
    while !inner.exiting.load(Ordering::Acquire) {
        if !inner.playing.load(Ordering::Acquire) {
            let (g, _) = inner
                .condition
                .wait_timeout(guard, Duration::from_millis(FILL_WAIT_MS))
                .unwrap();
            guard = g;
            continue;
        }

        let worked = inner.fill_buffers(&mut guard);
        inner.check_ended(&guard);
        if !worked {
            let (g, _) = inner
                .condition
                .wait_timeout(guard, Duration::from_millis(FILL_WAIT_MS))
                .unwrap();
            guard = g;
        }
    }
}
