//! Windowing functions for block-based spectral processing

/// Available window shapes
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum WindowType {
    Rectangular,
    Bartlett,
    Hamming,
    #[default]
    Hann,
    Blackman,
}

/// A precomputed window of a fixed length
///
/// Periodic forms are used throughout so that overlap-add identities hold
/// when the hop divides the window length.
pub struct Window {
    kind: WindowType,
    data: Vec<f64>,
}

impl Window {
    /// Precompute a window of the given type and length
    pub fn new(kind: WindowType, size: usize) -> Self {
        let n = size as f64;
        let data = (0..size)
            .map(|i| {
                let x = i as f64;
                let phase = 2.0 * std::f64::consts::PI * x / n;
                match kind {
                    WindowType::Rectangular => 1.0,
                    WindowType::Bartlett => 1.0 - ((2.0 * x - n) / n).abs(),
                    WindowType::Hamming => 0.54 - 0.46 * phase.cos(),
                    WindowType::Hann => 0.5 - 0.5 * phase.cos(),
                    WindowType::Blackman => {
                        0.42 - 0.5 * phase.cos() + 0.08 * (2.0 * phase).cos()
                    }
                }
            })
            .collect();
        Self { kind, data }
    }

    /// Window length
    pub fn len(&self) -> usize {
        self.data.len()
    }

    /// Whether the window has zero length
    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }

    /// The window's shape
    pub fn kind(&self) -> WindowType {
        self.kind
    }

    /// The precomputed coefficients
    pub fn values(&self) -> &[f64] {
        &self.data
    }

    /// Multiply a block by the window in place
    ///
    /// The block must be exactly the window length.
    pub fn cut(&self, block: &mut [f64]) {
        debug_assert_eq!(block.len(), self.data.len());
        for (x, w) in block.iter_mut().zip(self.data.iter()) {
            *x *= w;
        }
    }
}
