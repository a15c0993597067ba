//! Common types for trellis
//!
//! This module contains the fundamental audio types used throughout the
//! engine, most importantly the planar [`SampleBuffer`] that every chain,
//! endpoint and mix stage exchanges.

/// Default sample rate (48kHz - standard professional audio rate)
/// This is the default; the actual rate comes from the chainsetup.
pub const SAMPLE_RATE: u32 = 48_000;

/// Default processing block size in frames
pub const BUFFER_SIZE: usize = 1024;

/// Audio sample type (32-bit float in the range [-1.0, +1.0])
pub type Sample = f32;

/// A planar block of audio samples
///
/// One `Vec<Sample>` per channel, all the same length. Channel count and
/// frame count can shrink and grow inside the allocated capacity without
/// touching the allocator, which is what the engine's mix loop relies on:
/// buffers are sized once at connect time and only re-shaped per block.
///
/// Sample rate and channel count are metadata only; nothing here resamples
/// or remixes implicitly.
#[derive(Debug, Clone)]
pub struct SampleBuffer {
    /// Allocated channel lanes; each holds `capacity_frames` samples
    lanes: Vec<Vec<Sample>>,
    /// Active channel count (<= lanes.len() unless grown explicitly)
    channels: usize,
    /// Active frame count (<= capacity_frames)
    frames: usize,
    /// Allocated frames per lane
    capacity_frames: usize,
    /// Metadata only
    sample_rate: u32,
}

impl SampleBuffer {
    /// Create a buffer of silence with the given shape
    ///
    /// Capacity equals the initial shape; use [`SampleBuffer::with_capacity`]
    /// when the buffer will later be re-shaped up to a known maximum.
    pub fn silence(channels: usize, frames: usize, sample_rate: u32) -> Self {
        Self::with_capacity(channels, frames, channels, frames, sample_rate)
    }

    /// Create a silent buffer with explicit allocated capacity
    ///
    /// The active shape is `(channels, frames)`; up to
    /// `(max_channels, max_frames)` is pre-allocated so later re-shapes
    /// within that envelope never allocate.
    pub fn with_capacity(
        channels: usize,
        frames: usize,
        max_channels: usize,
        max_frames: usize,
        sample_rate: u32,
    ) -> Self {
        let max_channels = max_channels.max(channels);
        let max_frames = max_frames.max(frames);
        Self {
            lanes: (0..max_channels).map(|_| vec![0.0; max_frames]).collect(),
            channels,
            frames,
            capacity_frames: max_frames,
            sample_rate,
        }
    }

    /// Active channel count
    #[inline]
    pub fn channels(&self) -> usize {
        self.channels
    }

    /// Active frame count
    #[inline]
    pub fn frames(&self) -> usize {
        self.frames
    }

    /// Sample rate metadata
    #[inline]
    pub fn sample_rate(&self) -> u32 {
        self.sample_rate
    }

    pub fn set_sample_rate(&mut self, rate: u32) {
        self.sample_rate = rate;
    }

    /// One channel's samples, `frames` long
    #[inline]
    pub fn channel(&self, ch: usize) -> &[Sample] {
        &self.lanes[ch][..self.frames]
    }

    /// Mutable view of one channel's samples
    #[inline]
    pub fn channel_mut(&mut self, ch: usize) -> &mut [Sample] {
        &mut self.lanes[ch][..self.frames]
    }

    /// Set the active channel count (real-time safe within capacity)
    ///
    /// Lanes exposed by growing are silenced, never stale. Growing past
    /// the allocated lane count allocates; that only happens at setup
    /// time, never inside an iteration.
    pub fn set_channels(&mut self, channels: usize) {
        for lane in self
            .lanes
            .iter_mut()
            .take(channels)
            .skip(self.channels)
        {
            lane.fill(0.0);
        }
        while self.lanes.len() < channels {
            self.lanes.push(vec![0.0; self.capacity_frames]);
        }
        self.channels = channels;
    }

    /// Set the active frame count (real-time safe within capacity)
    ///
    /// Growing within capacity exposes stale samples, so the newly exposed
    /// tail is zeroed. Growing past capacity allocates; setup time only.
    pub fn set_frames(&mut self, frames: usize) {
        if frames > self.capacity_frames {
            for lane in &mut self.lanes {
                lane.resize(frames, 0.0);
            }
            self.capacity_frames = frames;
        } else if frames > self.frames {
            for lane in &mut self.lanes {
                lane[self.frames..frames].fill(0.0);
            }
        }
        self.frames = frames;
    }

    /// Fill every active channel with silence
    pub fn make_silent(&mut self) {
        for lane in self.lanes.iter_mut().take(self.channels) {
            lane[..self.frames].fill(0.0);
        }
    }

    /// Copy another buffer's samples into this one
    ///
    /// Copies `min(src.channels, self.channels)` lanes and adopts the
    /// source's active frame count; the channel count is left alone, so a
    /// mix slot pre-shaped to an output's channels keeps that shape.
    pub fn copy_from(&mut self, src: &SampleBuffer) {
        debug_assert!(src.frames <= self.capacity_frames);
        self.set_frames(src.frames);
        for ch in 0..src.channels.min(self.channels) {
            self.lanes[ch][..self.frames].copy_from_slice(&src.lanes[ch][..self.frames]);
        }
    }

    /// Divide every active sample by `n`
    pub fn divide_by(&mut self, n: usize) {
        debug_assert!(n > 0);
        let k = 1.0 / n as Sample;
        for lane in self.lanes.iter_mut().take(self.channels) {
            for s in &mut lane[..self.frames] {
                *s *= k;
            }
        }
    }

    /// Add `src` scaled by `1/weight` elementwise
    ///
    /// Only `src.channels()` channels are touched; the frame counts must
    /// already agree (both equal the engine's block size).
    pub fn add_with_weight(&mut self, src: &SampleBuffer, weight: usize) {
        debug_assert!(weight > 0);
        debug_assert_eq!(self.frames, src.frames);
        let k = 1.0 / weight as Sample;
        for ch in 0..src.channels.min(self.channels) {
            let (dst, s) = (&mut self.lanes[ch][..self.frames], &src.lanes[ch][..src.frames]);
            for (d, v) in dst.iter_mut().zip(s) {
                *d += *v * k;
            }
        }
    }

    /// Import interleaved samples `[ch0, ch1, ..., ch0, ch1, ...]`
    ///
    /// Adopts shape `(channels, data.len() / channels)`.
    pub fn read_interleaved(&mut self, data: &[Sample], channels: usize) {
        debug_assert!(channels > 0);
        let frames = data.len() / channels;
        self.set_channels(channels);
        self.set_frames(frames);
        for ch in 0..channels {
            let lane = &mut self.lanes[ch];
            for (i, frame) in data.chunks_exact(channels).enumerate() {
                lane[i] = frame[ch];
            }
        }
    }

    /// Export the active samples as interleaved frames
    ///
    /// `out` must hold at least `frames * channels` samples.
    pub fn write_interleaved(&self, out: &mut [Sample]) {
        debug_assert!(out.len() >= self.frames * self.channels);
        for ch in 0..self.channels {
            let lane = &self.lanes[ch];
            for i in 0..self.frames {
                out[i * self.channels + ch] = lane[i];
            }
        }
    }

    /// Peak amplitude over all active samples
    pub fn peak(&self) -> Sample {
        let mut peak: Sample = 0.0;
        for lane in self.lanes.iter().take(self.channels) {
            for s in &lane[..self.frames] {
                peak = peak.max(s.abs());
            }
        }
        peak
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_silence_shape() {
        let buf = SampleBuffer::silence(2, 256, SAMPLE_RATE);
        assert_eq!(buf.channels(), 2);
        assert_eq!(buf.frames(), 256);
        assert!(buf.channel(0).iter().all(|&s| s == 0.0));
        assert!(buf.channel(1).iter().all(|&s| s == 0.0));
    }

    #[test]
    fn test_reshape_within_capacity_keeps_silence() {
        let mut buf = SampleBuffer::with_capacity(1, 64, 4, 1024, SAMPLE_RATE);
        buf.channel_mut(0).fill(0.5);
        buf.set_frames(32);
        buf.set_frames(128);
        // the exposed tail must not contain the stale 0.5 samples
        assert!(buf.channel(0)[32..].iter().all(|&s| s == 0.0));
        buf.set_channels(3);
        assert_eq!(buf.channels(), 3);
    }

    #[test]
    fn test_copy_leaves_extra_channels_untouched() {
        let mut dst = SampleBuffer::silence(3, 16, SAMPLE_RATE);
        dst.channel_mut(2).fill(0.25);
        let mut src = SampleBuffer::silence(2, 16, SAMPLE_RATE);
        src.channel_mut(0).fill(1.0);

        // copy only writes src's channels; dst keeps channel 2 as-is
        let saved: Vec<Sample> = dst.channel(2).to_vec();
        dst.copy_from(&src);
        assert_eq!(dst.channel(0), src.channel(0));
        assert_eq!(dst.channel(2), &saved[..]);
    }

    #[test]
    fn test_weighted_mix_sums_to_unity() {
        // two contributors at weight 2 must average, not sum
        let mut a = SampleBuffer::silence(1, 8, SAMPLE_RATE);
        a.channel_mut(0).fill(0.8);
        let mut b = SampleBuffer::silence(1, 8, SAMPLE_RATE);
        b.channel_mut(0).fill(0.4);

        let mut mix = SampleBuffer::silence(1, 8, SAMPLE_RATE);
        mix.copy_from(&a);
        mix.divide_by(2);
        mix.add_with_weight(&b, 2);
        for &s in mix.channel(0) {
            assert!((s - 0.6).abs() < 1e-6);
        }
    }

    #[test]
    fn test_interleaved_round_trip() {
        let data = [0.1, -0.1, 0.2, -0.2, 0.3, -0.3];
        let mut buf = SampleBuffer::silence(2, 3, SAMPLE_RATE);
        buf.read_interleaved(&data, 2);
        assert_eq!(buf.channel(0), &[0.1, 0.2, 0.3]);
        assert_eq!(buf.channel(1), &[-0.1, -0.2, -0.3]);

        let mut out = [0.0; 6];
        buf.write_interleaved(&mut out);
        assert_eq!(out, data);
    }
}
