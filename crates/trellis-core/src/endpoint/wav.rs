//! WAV/RIFF file endpoints
//!
//! Hand-rolled chunk handling: the engine only needs fmt + data, and
//! keeping the parser local avoids dragging a decoding framework into the
//! realtime build. Sources accept PCM 16/24/32 and IEEE float 32; sinks
//! always write IEEE float 32, which round-trips the engine's native
//! sample format bit-for-bit.

use std::fs::File;
use std::io::{BufReader, BufWriter, Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};

use crate::endpoint::{AudioEndpoint, IoMode};
use crate::error::{EngineError, EngineResult};
use crate::types::{Sample, SampleBuffer};

/// Audio format information from the fmt chunk
#[derive(Debug, Clone, Copy)]
struct WavFormat {
    /// 1 = PCM, 3 = IEEE float
    format_tag: u16,
    channels: u16,
    sample_rate: u32,
    bits_per_sample: u16,
    /// Bytes per frame (channels * bits / 8)
    block_align: u16,
}

impl WavFormat {
    fn check_supported(&self, label: &str) -> EngineResult<()> {
        let ok = match (self.format_tag, self.bits_per_sample) {
            (1, 16) | (1, 24) | (1, 32) => true,
            (3, 32) => true,
            _ => false,
        };
        if !ok {
            return Err(EngineError::device(
                label,
                format!(
                    "unsupported sample format: tag {} at {} bits",
                    self.format_tag, self.bits_per_sample
                ),
            ));
        }
        if self.channels == 0 || self.block_align == 0 {
            return Err(EngineError::device(label, "corrupt fmt chunk"));
        }
        Ok(())
    }
}

fn read_u32(r: &mut impl Read) -> std::io::Result<u32> {
    let mut b = [0u8; 4];
    r.read_exact(&mut b)?;
    Ok(u32::from_le_bytes(b))
}

fn read_u16(r: &mut impl Read) -> std::io::Result<u16> {
    let mut b = [0u8; 2];
    r.read_exact(&mut b)?;
    Ok(u16::from_le_bytes(b))
}

/// A WAV file input endpoint
pub struct WavSource {
    path: PathBuf,
    label: String,
    reader: Option<BufReader<File>>,
    format: Option<WavFormat>,
    /// Byte offset of the data chunk payload
    data_offset: u64,
    /// Total frames in the data chunk
    total_frames: u64,
    position: u64,
    finished: bool,
    /// Reused decode scratch
    bytes: Vec<u8>,
    samples: Vec<Sample>,
}

impl WavSource {
    pub fn new(path: impl AsRef<Path>) -> Self {
        let path = path.as_ref().to_path_buf();
        let label = path.display().to_string();
        Self {
            path,
            label,
            reader: None,
            format: None,
            data_offset: 0,
            total_frames: 0,
            position: 0,
            finished: false,
            bytes: Vec::new(),
            samples: Vec::new(),
        }
    }

    /// Walk the RIFF chunk list, locating fmt and data
    fn parse_header(&mut self) -> EngineResult<()> {
        let file = File::open(&self.path).map_err(|e| EngineError::device(&self.label, e))?;
        let mut r = BufReader::new(file);

        let mut magic = [0u8; 4];
        r.read_exact(&mut magic)
            .map_err(|e| EngineError::device(&self.label, e))?;
        if &magic != b"RIFF" {
            return Err(EngineError::device(&self.label, "not a RIFF file"));
        }
        let _riff_size = read_u32(&mut r).map_err(|e| EngineError::device(&self.label, e))?;
        r.read_exact(&mut magic)
            .map_err(|e| EngineError::device(&self.label, e))?;
        if &magic != b"WAVE" {
            return Err(EngineError::device(&self.label, "not a WAVE file"));
        }

        let mut format: Option<WavFormat> = None;
        loop {
            let mut id = [0u8; 4];
            if r.read_exact(&mut id).is_err() {
                break;
            }
            let size = read_u32(&mut r).map_err(|e| EngineError::device(&self.label, e))?;
            match &id {
                b"fmt " => {
                    let format_tag = read_u16(&mut r).map_err(|e| EngineError::device(&self.label, e))?;
                    let channels = read_u16(&mut r).map_err(|e| EngineError::device(&self.label, e))?;
                    let sample_rate = read_u32(&mut r).map_err(|e| EngineError::device(&self.label, e))?;
                    let _byte_rate = read_u32(&mut r).map_err(|e| EngineError::device(&self.label, e))?;
                    let block_align = read_u16(&mut r).map_err(|e| EngineError::device(&self.label, e))?;
                    let bits_per_sample = read_u16(&mut r).map_err(|e| EngineError::device(&self.label, e))?;
                    // skip any fmt extension
                    if size > 16 {
                        r.seek(SeekFrom::Current(i64::from(size) - 16))
                            .map_err(|e| EngineError::device(&self.label, e))?;
                    }
                    format = Some(WavFormat {
                        format_tag,
                        channels,
                        sample_rate,
                        bits_per_sample,
                        block_align,
                    });
                }
                b"data" => {
                    let fmt = format
                        .ok_or_else(|| EngineError::device(&self.label, "data chunk before fmt"))?;
                    fmt.check_supported(&self.label)?;
                    self.data_offset = r
                        .stream_position()
                        .map_err(|e| EngineError::device(&self.label, e))?;
                    self.total_frames = u64::from(size) / u64::from(fmt.block_align);
                    self.format = Some(fmt);
                    self.reader = Some(r);
                    return Ok(());
                }
                _ => {
                    // unknown chunk; chunks are word-aligned
                    let skip = u64::from(size) + u64::from(size & 1);
                    r.seek(SeekFrom::Current(skip as i64))
                        .map_err(|e| EngineError::device(&self.label, e))?;
                }
            }
        }
        Err(EngineError::device(&self.label, "no data chunk found"))
    }

    /// Decode the raw byte scratch into interleaved f32 samples
    fn decode(&mut self, fmt: WavFormat) {
        self.samples.clear();
        self.samples
            .reserve(self.bytes.len() / usize::from(fmt.block_align) * usize::from(fmt.channels));
        match (fmt.format_tag, fmt.bits_per_sample) {
            (1, 16) => {
                for b in self.bytes.chunks_exact(2) {
                    let v = i16::from_le_bytes([b[0], b[1]]);
                    self.samples.push(Sample::from(v) / 32768.0);
                }
            }
            (1, 24) => {
                for b in self.bytes.chunks_exact(3) {
                    let v = i32::from_le_bytes([0, b[0], b[1], b[2]]) >> 8;
                    self.samples.push(v as Sample / 8_388_608.0);
                }
            }
            (1, 32) => {
                for b in self.bytes.chunks_exact(4) {
                    let v = i32::from_le_bytes([b[0], b[1], b[2], b[3]]);
                    self.samples.push(v as Sample / 2_147_483_648.0);
                }
            }
            (3, 32) => {
                for b in self.bytes.chunks_exact(4) {
                    self.samples
                        .push(Sample::from_le_bytes([b[0], b[1], b[2], b[3]]));
                }
            }
            _ => unreachable!("rejected in check_supported"),
        }
    }
}

impl AudioEndpoint for WavSource {
    fn label(&self) -> &str {
        &self.label
    }

    fn io_mode(&self) -> IoMode {
        IoMode::Read
    }

    fn channels(&self) -> usize {
        self.format.map(|f| f.channels as usize).unwrap_or(0)
    }

    fn sample_rate(&self) -> u32 {
        self.format.map(|f| f.sample_rate).unwrap_or(0)
    }

    fn length_in_samples(&self) -> Option<u64> {
        Some(self.total_frames)
    }

    fn position_in_samples(&self) -> u64 {
        self.position
    }

    fn open(&mut self) -> EngineResult<()> {
        if self.reader.is_none() {
            self.parse_header()?;
            log::debug!(
                "opened wav source '{}': {} ch, {} Hz, {} frames",
                self.label,
                self.channels(),
                self.sample_rate(),
                self.total_frames
            );
        }
        Ok(())
    }

    fn close(&mut self) -> EngineResult<()> {
        self.reader = None;
        Ok(())
    }

    fn read(&mut self, buf: &mut SampleBuffer) -> EngineResult<()> {
        let fmt = match self.format {
            Some(f) => f,
            None => return Err(EngineError::device(&self.label, "read before open")),
        };
        let wanted = buf.frames();
        let remaining = self.total_frames.saturating_sub(self.position) as usize;
        let take = wanted.min(remaining);

        self.bytes.resize(take * fmt.block_align as usize, 0);
        if take > 0 {
            let reader = match self.reader.as_mut() {
                Some(r) => r,
                None => return Err(EngineError::device(&self.label, "read before open")),
            };
            if let Err(e) = reader.read_exact(&mut self.bytes) {
                // truncated file: treat as end of stream
                log::warn!("wav source '{}': short read ({}); treating as EOF", self.label, e);
                self.position = self.total_frames;
                self.finished = true;
                buf.set_frames(0);
                return Ok(());
            }
        }

        self.decode(fmt);
        let channels = fmt.channels as usize;
        buf.read_interleaved(&self.samples, channels);
        self.position += take as u64;
        if take < wanted {
            self.finished = true;
        }
        Ok(())
    }

    fn write(&mut self, _buf: &SampleBuffer) -> EngineResult<()> {
        Err(EngineError::device(&self.label, "write on read-only endpoint"))
    }

    fn seek(&mut self, frame: u64) -> EngineResult<()> {
        let fmt = match self.format {
            Some(f) => f,
            None => {
                // position before open is honored when the file opens
                self.position = frame;
                return Ok(());
            }
        };
        let frame = frame.min(self.total_frames);
        let reader = match self.reader.as_mut() {
            Some(r) => r,
            None => return Err(EngineError::device(&self.label, "seek before open")),
        };
        reader
            .seek(SeekFrom::Start(self.data_offset + frame * u64::from(fmt.block_align)))
            .map_err(|e| EngineError::device(&self.label, e))?;
        self.position = frame;
        self.finished = frame >= self.total_frames;
        Ok(())
    }

    fn set_buffersize(&mut self, _frames: usize, _rate: u32) {}

    fn finished(&self) -> bool {
        self.finished
    }
}

/// A WAV file output endpoint (IEEE float 32)
pub struct WavSink {
    path: PathBuf,
    label: String,
    writer: Option<BufWriter<File>>,
    channels: usize,
    sample_rate: u32,
    /// Byte offset of the data chunk payload (fixed 44-byte header)
    data_offset: u64,
    position: u64,
    /// High-water mark of frames written (position may rewind via seek)
    frames_written: u64,
    /// Reused encode scratch
    samples: Vec<Sample>,
}

impl WavSink {
    pub fn new(path: impl AsRef<Path>, channels: usize, sample_rate: u32) -> Self {
        let path = path.as_ref().to_path_buf();
        let label = path.display().to_string();
        Self {
            path,
            label,
            writer: None,
            channels,
            sample_rate,
            data_offset: 44,
            position: 0,
            frames_written: 0,
            samples: Vec::new(),
        }
    }

    fn block_align(&self) -> u64 {
        self.channels as u64 * 4
    }

    fn write_header(&self, w: &mut impl Write, data_bytes: u32) -> std::io::Result<()> {
        w.write_all(b"RIFF")?;
        w.write_all(&(36 + data_bytes).to_le_bytes())?;
        w.write_all(b"WAVE")?;
        w.write_all(b"fmt ")?;
        w.write_all(&16u32.to_le_bytes())?;
        w.write_all(&3u16.to_le_bytes())?; // IEEE float
        w.write_all(&(self.channels as u16).to_le_bytes())?;
        w.write_all(&self.sample_rate.to_le_bytes())?;
        w.write_all(&(self.sample_rate * self.block_align() as u32).to_le_bytes())?;
        w.write_all(&(self.block_align() as u16).to_le_bytes())?;
        w.write_all(&32u16.to_le_bytes())?;
        w.write_all(b"data")?;
        w.write_all(&data_bytes.to_le_bytes())?;
        Ok(())
    }

    /// Patch the RIFF/data sizes once the final length is known
    fn finalize(&mut self) -> EngineResult<()> {
        if let Some(mut writer) = self.writer.take() {
            writer.flush().map_err(|e| EngineError::device(&self.label, e))?;
            let mut file = writer
                .into_inner()
                .map_err(|e| EngineError::device(&self.label, e.to_string()))?;
            let data_bytes = (self.frames_written * self.block_align()) as u32;
            file.seek(SeekFrom::Start(0))
                .map_err(|e| EngineError::device(&self.label, e))?;
            self.write_header(&mut file, data_bytes)
                .map_err(|e| EngineError::device(&self.label, e))?;
            file.flush().map_err(|e| EngineError::device(&self.label, e))?;
            log::debug!(
                "closed wav sink '{}': {} frames written",
                self.label,
                self.frames_written
            );
        }
        Ok(())
    }
}

impl AudioEndpoint for WavSink {
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
        Some(self.frames_written)
    }

    fn position_in_samples(&self) -> u64 {
        self.position
    }

    fn open(&mut self) -> EngineResult<()> {
        if self.writer.is_none() {
            let file = File::create(&self.path).map_err(|e| EngineError::device(&self.label, e))?;
            let mut writer = BufWriter::new(file);
            // placeholder sizes; patched in finalize()
            self.write_header(&mut writer, 0)
                .map_err(|e| EngineError::device(&self.label, e))?;
            self.writer = Some(writer);
            if self.position > 0 {
                let start = self.position;
                self.position = 0;
                self.seek(start)?;
            }
        }
        Ok(())
    }

    fn close(&mut self) -> EngineResult<()> {
        self.finalize()
    }

    fn read(&mut self, _buf: &mut SampleBuffer) -> EngineResult<()> {
        Err(EngineError::device(&self.label, "read on write-only endpoint"))
    }

    fn write(&mut self, buf: &SampleBuffer) -> EngineResult<()> {
        let writer = match self.writer.as_mut() {
            Some(w) => w,
            None => return Err(EngineError::device(&self.label, "write before open")),
        };
        let frames = buf.frames();
        self.samples.clear();
        self.samples.resize(frames * self.channels, 0.0);
        // interleave to our own channel count; a narrower buffer leaves
        // the remaining file channels silent
        for ch in 0..self.channels.min(buf.channels()) {
            let lane = buf.channel(ch);
            for i in 0..frames {
                self.samples[i * self.channels + ch] = lane[i];
            }
        }
        writer
            .write_all(bytemuck::cast_slice(&self.samples))
            .map_err(|e| EngineError::device(&self.label, e))?;
        self.position += frames as u64;
        self.frames_written = self.frames_written.max(self.position);
        Ok(())
    }

    fn seek(&mut self, frame: u64) -> EngineResult<()> {
        let target = self.data_offset + frame * self.block_align();
        match self.writer.as_mut() {
            Some(writer) => {
                writer.flush().map_err(|e| EngineError::device(&self.label, e))?;
                writer
                    .get_mut()
                    .seek(SeekFrom::Start(target))
                    .map_err(|e| EngineError::device(&self.label, e))?;
                self.position = frame;
            }
            None => self.position = frame,
        }
        Ok(())
    }

    fn set_buffersize(&mut self, _frames: usize, _rate: u32) {}

    fn finished(&self) -> bool {
        false
    }
}

impl Drop for WavSink {
    fn drop(&mut self) {
        if let Err(e) = self.finalize() {
            log::error!("wav sink '{}' close failed: {}", self.label, e);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::SAMPLE_RATE;

    fn ramp_buffer(channels: usize, frames: usize) -> SampleBuffer {
        let mut buf = SampleBuffer::silence(channels, frames, SAMPLE_RATE);
        for ch in 0..channels {
            for (i, s) in buf.channel_mut(ch).iter_mut().enumerate() {
                *s = (i as Sample / frames as Sample) - 0.5 + ch as Sample * 0.01;
            }
        }
        buf
    }

    #[test]
    fn test_sink_source_round_trip() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("rt.wav");

        let written = ramp_buffer(2, 512);
        let mut sink = WavSink::new(&path, 2, SAMPLE_RATE);
        sink.open().unwrap();
        sink.write(&written).unwrap();
        sink.close().unwrap();

        let mut source = WavSource::new(&path);
        source.open().unwrap();
        assert_eq!(source.channels(), 2);
        assert_eq!(source.sample_rate(), SAMPLE_RATE);
        assert_eq!(source.length_in_samples(), Some(512));

        let mut read = SampleBuffer::silence(2, 512, SAMPLE_RATE);
        source.read(&mut read).unwrap();
        assert_eq!(read.channel(0), written.channel(0));
        assert_eq!(read.channel(1), written.channel(1));
    }

    #[test]
    fn test_source_short_final_read_sets_finished() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("short.wav");

        let mut sink = WavSink::new(&path, 1, SAMPLE_RATE);
        sink.open().unwrap();
        sink.write(&ramp_buffer(1, 300)).unwrap();
        sink.close().unwrap();

        let mut source = WavSource::new(&path);
        source.open().unwrap();

        let mut buf = SampleBuffer::silence(1, 256, SAMPLE_RATE);
        source.read(&mut buf).unwrap();
        assert_eq!(buf.frames(), 256);
        assert!(!source.finished());

        buf.set_frames(256);
        source.read(&mut buf).unwrap();
        assert_eq!(buf.frames(), 44);
        assert!(source.finished());
    }

    #[test]
    fn test_source_seek_is_absolute() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("seek.wav");

        let written = ramp_buffer(1, 400);
        let mut sink = WavSink::new(&path, 1, SAMPLE_RATE);
        sink.open().unwrap();
        sink.write(&written).unwrap();
        sink.close().unwrap();

        let mut source = WavSource::new(&path);
        source.open().unwrap();
        source.seek(100).unwrap();
        assert_eq!(source.position_in_samples(), 100);

        let mut buf = SampleBuffer::silence(1, 50, SAMPLE_RATE);
        source.read(&mut buf).unwrap();
        assert_eq!(buf.channel(0), &written.channel(0)[100..150]);
    }

    #[test]
    fn test_sink_seek_advances_write_position() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("adv.wav");

        let mut sink = WavSink::new(&path, 1, SAMPLE_RATE);
        sink.open().unwrap();
        sink.seek(64).unwrap();
        sink.write(&ramp_buffer(1, 32)).unwrap();
        sink.close().unwrap();

        let mut source = WavSource::new(&path);
        source.open().unwrap();
        // the skipped region counts toward the stream length
        assert_eq!(source.length_in_samples(), Some(96));
    }
}
