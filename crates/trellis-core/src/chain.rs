//! Signal chains - ordered processor pipelines
//!
//! A chain binds one input endpoint to one output endpoint (both by index
//! into the chainsetup's arrays) and runs its processors in insertion
//! order over the working buffer the engine hands it each block.

use crate::types::SampleBuffer;

/// The shape a processor was initialized for
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BufferShape {
    pub channels: usize,
    pub frames: usize,
    pub sample_rate: u32,
}

impl BufferShape {
    pub fn of(buf: &SampleBuffer) -> Self {
        Self {
            channels: buf.channels(),
            frames: buf.frames(),
            sample_rate: buf.sample_rate(),
        }
    }
}

/// A DSP element in a chain
///
/// Parameters are indexed and `f64`-valued so the command queue can
/// address them without knowing the concrete processor. The engine never
/// downcasts; everything it needs is on this trait.
pub trait Processor: Send {
    /// Display name
    fn name(&self) -> &str;

    /// Bind to the working-buffer shape. Called once when the engine
    /// connects and again if the block size changes while stopped.
    fn init(&mut self, shape: &BufferShape) {
        let _ = shape;
    }

    /// Process one block in place
    fn process(&mut self, buf: &mut SampleBuffer);

    /// Number of parameters
    fn parameter_count(&self) -> usize {
        0
    }

    /// Set parameter `index` (0-based). Out-of-range indices are ignored.
    fn set_parameter(&mut self, index: usize, value: f64) {
        let _ = (index, value);
    }

    /// Read parameter `index`; out-of-range yields 0.0
    fn get_parameter(&self, index: usize) -> f64 {
        let _ = index;
        0.0
    }
}

/// A fixed gain stage, the simplest useful processor
pub struct GainProcessor {
    gain: f64,
}

impl GainProcessor {
    pub fn new(gain: f64) -> Self {
        Self { gain }
    }
}

impl Processor for GainProcessor {
    fn name(&self) -> &str {
        "gain"
    }

    fn process(&mut self, buf: &mut SampleBuffer) {
        let g = self.gain as f32;
        for ch in 0..buf.channels() {
            for s in buf.channel_mut(ch) {
                *s *= g;
            }
        }
    }

    fn parameter_count(&self) -> usize {
        1
    }

    fn set_parameter(&mut self, index: usize, value: f64) {
        if index == 0 {
            self.gain = value;
        }
    }

    fn get_parameter(&self, index: usize) -> f64 {
        if index == 0 {
            self.gain
        } else {
            0.0
        }
    }
}

/// An ordered pipeline of processors between one input and one output
pub struct Chain {
    name: String,
    /// Index into the chainsetup's inputs
    pub input_id: usize,
    /// Index into the chainsetup's outputs
    pub output_id: usize,
    processors: Vec<Box<dyn Processor>>,
    muted: bool,
    bypass: bool,
    shape: Option<BufferShape>,
}

impl Chain {
    pub fn new(name: impl Into<String>, input_id: usize, output_id: usize) -> Self {
        Self {
            name: name.into(),
            input_id,
            output_id,
            processors: Vec::new(),
            muted: false,
            bypass: false,
            shape: None,
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Append a processor. Only valid while the engine is stopped.
    pub fn push_processor(&mut self, mut processor: Box<dyn Processor>) {
        if let Some(shape) = &self.shape {
            processor.init(shape);
        }
        self.processors.push(processor);
    }

    /// Remove the processor at `index`. Only valid while stopped.
    pub fn remove_processor(&mut self, index: usize) -> Option<Box<dyn Processor>> {
        if index < self.processors.len() {
            Some(self.processors.remove(index))
        } else {
            None
        }
    }

    pub fn processor_count(&self) -> usize {
        self.processors.len()
    }

    pub fn is_muted(&self) -> bool {
        self.muted
    }

    pub fn set_muted(&mut self, muted: bool) {
        self.muted = muted;
    }

    pub fn toggle_muted(&mut self) {
        self.muted = !self.muted;
    }

    pub fn is_bypassed(&self) -> bool {
        self.bypass
    }

    pub fn set_bypassed(&mut self, bypass: bool) {
        self.bypass = bypass;
    }

    pub fn toggle_bypassed(&mut self) {
        self.bypass = !self.bypass;
    }

    /// Bind every processor to the working-buffer shape the engine will
    /// hand this chain each iteration
    pub fn init(&mut self, shape: BufferShape) {
        for p in &mut self.processors {
            p.init(&shape);
        }
        self.shape = Some(shape);
    }

    /// Drop the buffer binding at disconnect time
    pub fn release(&mut self) {
        self.shape = None;
    }

    /// Run one block: mute zeroes the buffer, bypass skips processing,
    /// otherwise processors run in insertion order
    pub fn process(&mut self, buf: &mut SampleBuffer) {
        if self.muted {
            buf.make_silent();
            return;
        }
        if self.bypass {
            return;
        }
        debug_assert!(
            self.shape.map(|s| s.channels >= buf.channels()).unwrap_or(true),
            "chain '{}' handed a buffer it was not initialized for",
            self.name
        );
        for p in &mut self.processors {
            p.process(buf);
        }
    }

    /// Set a parameter on the processor at `op_index`; ignored when out
    /// of range (command-queue writes race ahead of topology edits)
    pub fn set_parameter(&mut self, op_index: usize, param_index: usize, value: f64) {
        match self.processors.get_mut(op_index) {
            Some(p) => p.set_parameter(param_index, value),
            None => log::warn!(
                "chain '{}': parameter write to missing processor {}",
                self.name,
                op_index
            ),
        }
    }

    pub fn get_parameter(&self, op_index: usize, param_index: usize) -> f64 {
        self.processors
            .get(op_index)
            .map(|p| p.get_parameter(param_index))
            .unwrap_or(0.0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::SAMPLE_RATE;

    fn dc_buffer(value: f32) -> SampleBuffer {
        let mut buf = SampleBuffer::silence(1, 64, SAMPLE_RATE);
        buf.channel_mut(0).fill(value);
        buf
    }

    #[test]
    fn test_processors_run_in_insertion_order() {
        // (x * 2) then (x * 0.25): order matters only through the product,
        // so add an offset stage to make ordering observable
        struct Offset(f32);
        impl Processor for Offset {
            fn name(&self) -> &str {
                "offset"
            }
            fn process(&mut self, buf: &mut SampleBuffer) {
                for s in buf.channel_mut(0) {
                    *s += self.0;
                }
            }
        }

        let mut chain = Chain::new("c1", 0, 0);
        chain.push_processor(Box::new(GainProcessor::new(2.0)));
        chain.push_processor(Box::new(Offset(0.1)));

        let mut buf = dc_buffer(0.2);
        chain.init(BufferShape::of(&buf));
        chain.process(&mut buf);
        // (0.2 * 2) + 0.1, not (0.2 + 0.1) * 2
        for &s in buf.channel(0) {
            assert!((s - 0.5).abs() < 1e-6);
        }
    }

    #[test]
    fn test_mute_zeroes_bypass_skips() {
        let mut chain = Chain::new("c1", 0, 0);
        chain.push_processor(Box::new(GainProcessor::new(2.0)));
        let mut buf = dc_buffer(0.3);
        chain.init(BufferShape::of(&buf));

        chain.set_bypassed(true);
        chain.process(&mut buf);
        assert!((buf.channel(0)[0] - 0.3).abs() < 1e-6);

        chain.set_bypassed(false);
        chain.set_muted(true);
        chain.process(&mut buf);
        assert_eq!(buf.channel(0)[0], 0.0);
    }

    #[test]
    fn test_parameter_addressing() {
        let mut chain = Chain::new("c1", 0, 0);
        chain.push_processor(Box::new(GainProcessor::new(1.0)));
        chain.set_parameter(0, 0, 0.5);
        assert_eq!(chain.get_parameter(0, 0), 0.5);
        // out-of-range writes are ignored, not panics
        chain.set_parameter(3, 0, 0.9);
        assert_eq!(chain.get_parameter(3, 0), 0.0);
    }
}
