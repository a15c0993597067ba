//! Chainsetup - the declarative graph the engine runs
//!
//! Endpoints, chains, block size, rate and transport options. The setup is
//! mutable while building; once the engine connects it, topology is frozen
//! and only the command queue touches it (at block boundaries).

use crate::chain::Chain;
use crate::endpoint::{AudioEndpoint, IoMode};
use crate::error::{EngineError, EngineResult};
use crate::types::{BUFFER_SIZE, SAMPLE_RATE};

/// Topology class for the mix stage
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MixMode {
    /// Pick Simple for 1-in/1-out/1-chain, Normal otherwise
    Auto,
    /// Single chain straight through, no mixslot math
    Simple,
    /// General fan-in/fan-out with weighted mixing
    Normal,
}

/// Default double-buffer depth in frames (per wrapped endpoint ring)
pub const DEFAULT_DOUBLE_BUFFER_FRAMES: usize = 100_000;

/// Default SCHED_FIFO priority when raised priority is requested
pub const DEFAULT_SCHED_PRIORITY: i32 = 50;

/// The graph plus its run options
pub struct ChainSetup {
    name: String,
    pub inputs: Vec<Box<dyn AudioEndpoint>>,
    pub outputs: Vec<Box<dyn AudioEndpoint>>,
    pub chains: Vec<Chain>,
    buffersize: usize,
    sample_rate: u32,
    mixmode: MixMode,
    looping: bool,
    /// Explicit processing length; `None` until set (the engine derives
    /// one from the longest input at connect time)
    length: Option<u64>,
    length_set_explicitly: bool,
    double_buffering: bool,
    double_buffer_frames: usize,
    raised_priority: bool,
    sched_priority: i32,
    /// Global transport position in samples
    position: u64,
}

impl ChainSetup {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            inputs: Vec::new(),
            outputs: Vec::new(),
            chains: Vec::new(),
            buffersize: BUFFER_SIZE,
            sample_rate: SAMPLE_RATE,
            mixmode: MixMode::Auto,
            looping: false,
            length: None,
            length_set_explicitly: false,
            double_buffering: false,
            double_buffer_frames: DEFAULT_DOUBLE_BUFFER_FRAMES,
            raised_priority: false,
            sched_priority: DEFAULT_SCHED_PRIORITY,
            position: 0,
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Add an input endpoint, returning its index
    pub fn add_input(&mut self, endpoint: Box<dyn AudioEndpoint>) -> usize {
        self.inputs.push(endpoint);
        self.inputs.len() - 1
    }

    /// Add an output endpoint, returning its index
    pub fn add_output(&mut self, endpoint: Box<dyn AudioEndpoint>) -> usize {
        self.outputs.push(endpoint);
        self.outputs.len() - 1
    }

    pub fn add_chain(&mut self, chain: Chain) -> usize {
        self.chains.push(chain);
        self.chains.len() - 1
    }

    pub fn buffersize(&self) -> usize {
        self.buffersize
    }

    pub fn set_buffersize(&mut self, frames: usize) {
        self.buffersize = frames.max(1);
    }

    pub fn sample_rate(&self) -> u32 {
        self.sample_rate
    }

    pub fn set_sample_rate(&mut self, rate: u32) {
        self.sample_rate = rate;
    }

    pub fn mixmode(&self) -> MixMode {
        self.mixmode
    }

    pub fn set_mixmode(&mut self, mode: MixMode) {
        self.mixmode = mode;
    }

    pub fn looping(&self) -> bool {
        self.looping
    }

    pub fn set_looping(&mut self, looping: bool) {
        self.looping = looping;
    }

    pub fn length_in_samples(&self) -> Option<u64> {
        self.length
    }

    pub fn length_set_explicitly(&self) -> bool {
        self.length_set_explicitly
    }

    /// Set the processing length explicitly (in samples)
    pub fn set_length_in_samples(&mut self, samples: u64) {
        self.length = Some(samples);
        self.length_set_explicitly = true;
    }

    /// Set the processing length in seconds at the setup rate
    pub fn set_length_in_seconds(&mut self, seconds: f64) {
        self.set_length_in_samples((seconds * f64::from(self.sample_rate)) as u64);
    }

    /// Derived length (engine-internal, does not mark it explicit)
    pub(crate) fn derive_length(&mut self, samples: u64) {
        self.length = Some(samples);
    }

    pub fn double_buffering(&self) -> bool {
        self.double_buffering
    }

    pub fn set_double_buffering(&mut self, enabled: bool) {
        self.double_buffering = enabled;
    }

    pub fn double_buffer_frames(&self) -> usize {
        self.double_buffer_frames
    }

    pub fn set_double_buffer_frames(&mut self, frames: usize) {
        self.double_buffer_frames = frames;
    }

    pub fn raised_priority(&self) -> bool {
        self.raised_priority
    }

    pub fn set_raised_priority(&mut self, raised: bool) {
        self.raised_priority = raised;
    }

    pub fn sched_priority(&self) -> i32 {
        self.sched_priority
    }

    pub fn set_sched_priority(&mut self, priority: i32) {
        self.sched_priority = priority;
    }

    // --- transport position -------------------------------------------

    pub fn position_in_samples(&self) -> u64 {
        self.position
    }

    pub fn position_in_seconds(&self) -> f64 {
        self.position as f64 / f64::from(self.sample_rate)
    }

    pub fn set_position(&mut self, samples: u64) {
        self.position = samples;
    }

    pub fn advance_position(&mut self, frames: usize) {
        self.position += frames as u64;
    }

    /// True once the position has passed the processing length
    pub fn is_over(&self) -> bool {
        match self.length {
            Some(len) => self.position >= len,
            None => false,
        }
    }

    // --- graph queries ------------------------------------------------

    pub fn chains_connected_to_input(&self, input_id: usize) -> usize {
        self.chains.iter().filter(|c| c.input_id == input_id).count()
    }

    pub fn chains_connected_to_output(&self, output_id: usize) -> usize {
        self.chains.iter().filter(|c| c.output_id == output_id).count()
    }

    /// Validate the graph before the engine touches any device
    pub fn validate(&self) -> EngineResult<()> {
        if self.inputs.is_empty() {
            return Err(EngineError::Setup(format!("chainsetup '{}' has no inputs", self.name)));
        }
        if self.outputs.is_empty() {
            return Err(EngineError::Setup(format!("chainsetup '{}' has no outputs", self.name)));
        }
        if self.chains.is_empty() {
            return Err(EngineError::Setup(format!("chainsetup '{}' has no chains", self.name)));
        }
        for chain in &self.chains {
            if chain.input_id >= self.inputs.len() {
                return Err(EngineError::Setup(format!(
                    "chain '{}' references missing input {}",
                    chain.name(),
                    chain.input_id
                )));
            }
            if chain.output_id >= self.outputs.len() {
                return Err(EngineError::Setup(format!(
                    "chain '{}' references missing output {}",
                    chain.name(),
                    chain.output_id
                )));
            }
        }
        for input in &self.inputs {
            if input.io_mode() == IoMode::Write {
                return Err(EngineError::Setup(format!(
                    "endpoint '{}' cannot be used as an input",
                    input.label()
                )));
            }
        }
        for output in &self.outputs {
            if output.io_mode() == IoMode::Read {
                return Err(EngineError::Setup(format!(
                    "endpoint '{}' cannot be used as an output",
                    output.label()
                )));
            }
        }
        Ok(())
    }

    /// Rate agreement check, run after endpoints are open (file formats
    /// are unknown before that). The engine never resamples.
    pub(crate) fn check_sample_rates(&self) -> EngineResult<()> {
        for ep in self.inputs.iter().chain(self.outputs.iter()) {
            let rate = ep.sample_rate();
            if rate != 0 && rate != self.sample_rate {
                return Err(EngineError::Setup(format!(
                    "endpoint '{}' runs at {} Hz but the chainsetup is {} Hz",
                    ep.label(),
                    rate,
                    self.sample_rate
                )));
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::chain::Chain;
    use crate::endpoint::null::{NullSink, NullSource};

    fn minimal_setup() -> ChainSetup {
        let mut cs = ChainSetup::new("test");
        let input = cs.add_input(Box::new(NullSource::new(2, SAMPLE_RATE)));
        let output = cs.add_output(Box::new(NullSink::new(2, SAMPLE_RATE)));
        cs.add_chain(Chain::new("c1", input, output));
        cs
    }

    #[test]
    fn test_validate_accepts_minimal_graph() {
        assert!(minimal_setup().validate().is_ok());
    }

    #[test]
    fn test_validate_rejects_empty_and_dangling() {
        let cs = ChainSetup::new("empty");
        assert!(matches!(cs.validate(), Err(EngineError::Setup(_))));

        let mut cs = minimal_setup();
        cs.add_chain(Chain::new("dangling", 7, 0));
        assert!(matches!(cs.validate(), Err(EngineError::Setup(_))));
    }

    #[test]
    fn test_validate_rejects_misdirected_endpoints() {
        let mut cs = ChainSetup::new("backwards");
        let i = cs.add_input(Box::new(NullSink::new(2, SAMPLE_RATE)));
        let o = cs.add_output(Box::new(NullSource::new(2, SAMPLE_RATE)));
        cs.add_chain(Chain::new("c1", i, o));
        assert!(matches!(cs.validate(), Err(EngineError::Setup(_))));
    }

    #[test]
    fn test_position_and_over() {
        let mut cs = minimal_setup();
        assert!(!cs.is_over());
        cs.set_length_in_samples(1000);
        cs.advance_position(512);
        assert!(!cs.is_over());
        cs.advance_position(512);
        assert!(cs.is_over());
        cs.set_position(0);
        assert!(!cs.is_over());
    }

    #[test]
    fn test_chain_counts() {
        let mut cs = minimal_setup();
        cs.add_chain(Chain::new("c2", 0, 0));
        assert_eq!(cs.chains_connected_to_input(0), 2);
        assert_eq!(cs.chains_connected_to_output(0), 2);
        assert_eq!(cs.chains_connected_to_input(1), 0);
    }
}
