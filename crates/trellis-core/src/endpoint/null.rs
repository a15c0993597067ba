//! Null endpoints - infinite silence in, bit bucket out
//!
//! Useful as graph stubs and in tests: a chainsetup needs at least one
//! input and one output, but not every run cares about both sides.

use crate::endpoint::{AudioEndpoint, IoMode};
use crate::error::EngineResult;
use crate::types::SampleBuffer;

/// An infinite source of silence
pub struct NullSource {
    label: String,
    channels: usize,
    sample_rate: u32,
    position: u64,
}

impl NullSource {
    pub fn new(channels: usize, sample_rate: u32) -> Self {
        Self {
            label: "null".to_string(),
            channels,
            sample_rate,
            position: 0,
        }
    }
}

impl AudioEndpoint for NullSource {
    fn label(&self) -> &str {
        &self.label
    }

    fn io_mode(&self) -> IoMode {
        IoMode::Read
    }

    fn channels(&self) -> usize {
        self.channels
    }

    fn sample_rate(&self) -> u32 {
        self.sample_rate
    }

    fn length_in_samples(&self) -> Option<u64> {
        None
    }

    fn position_in_samples(&self) -> u64 {
        self.position
    }

    fn open(&mut self) -> EngineResult<()> {
        Ok(())
    }

    fn close(&mut self) -> EngineResult<()> {
        Ok(())
    }

    fn read(&mut self, buf: &mut SampleBuffer) -> EngineResult<()> {
        buf.set_channels(self.channels);
        buf.make_silent();
        self.position += buf.frames() as u64;
        Ok(())
    }

    fn write(&mut self, _buf: &SampleBuffer) -> EngineResult<()> {
        Err(crate::error::EngineError::device(&self.label, "write on read-only endpoint"))
    }

    fn seek(&mut self, frame: u64) -> EngineResult<()> {
        self.position = frame;
        Ok(())
    }

    fn set_buffersize(&mut self, _frames: usize, _rate: u32) {}

    fn finished(&self) -> bool {
        false
    }
}

/// A sink that discards everything written to it
pub struct NullSink {
    label: String,
    channels: usize,
    sample_rate: u32,
    position: u64,
}

impl NullSink {
    pub fn new(channels: usize, sample_rate: u32) -> Self {
        Self {
            label: "null".to_string(),
            channels,
            sample_rate,
            position: 0,
        }
    }
}

impl AudioEndpoint for NullSink {
    fn label(&self) -> &str {
        &self.label
    }

    fn io_mode(&self) -> IoMode {
        IoMode::Write
    }

    fn channels(&self) -> usize {
        self.channels
    }

    fn sample_rate(&self) -> u32 {
        self.sample_rate
    }

    fn length_in_samples(&self) -> Option<u64> {
        None
    }

    fn position_in_samples(&self) -> u64 {
        self.position
    }

    fn open(&mut self) -> EngineResult<()> {
        Ok(())
    }

    fn close(&mut self) -> EngineResult<()> {
        Ok(())
    }

    fn read(&mut self, _buf: &mut SampleBuffer) -> EngineResult<()> {
        Err(crate::error::EngineError::device(&self.label, "read on write-only endpoint"))
    }

    fn write(&mut self, buf: &SampleBuffer) -> EngineResult<()> {
        self.position += buf.frames() as u64;
        Ok(())
    }

    fn seek(&mut self, frame: u64) -> EngineResult<()> {
        self.position = frame;
        Ok(())
    }

    fn set_buffersize(&mut self, _frames: usize, _rate: u32) {}

    fn finished(&self) -> bool {
        false
    }
}
