//! Raw MIDI input for controller evaluation
//!
//! A midir callback thread pushes raw bytes into a lock-free SPSC ring;
//! the engine side drains the ring at block boundaries and keeps the
//! most recent control-change value per (channel, controller) pair.
//! Uses midir for cross-platform MIDI I/O (ALSA on Linux, CoreMIDI on
//! macOS, WinMM on Windows).

use midir::{MidiInput, MidiInputConnection};

use crate::error::{EngineError, EngineResult};

/// Ring capacity in bytes; far more than a controller produces between
/// two block boundaries
const MIDI_RING_CAPACITY: usize = 4096;

/// Engine-side view of a raw MIDI stream
///
/// Owns the midir connection (dropping this closes it) and the consumer
/// half of the byte ring. `poll` is only called from the engine at block
/// boundaries, keeping the ring strictly single-consumer.
pub struct RawMidiInput {
    _connection: MidiInputConnection<()>,
    consumer: rtrb::Consumer<u8>,
    /// Latest CC value per (channel, controller); 255 = never seen
    cc_values: [[u8; 128]; 16],
    /// Running status for the stream parser
    status: Option<u8>,
    /// Data bytes collected for the current message
    pending: [u8; 2],
    pending_len: usize,
}

impl RawMidiInput {
    /// Connect to the first MIDI input port whose name contains
    /// `port_match` (case-insensitive); empty string takes the first
    /// port.
    pub fn open(port_match: &str) -> EngineResult<Self> {
        let midi_in = MidiInput::new("trellis-midi-in")
            .map_err(|e| EngineError::device("midi", e.to_string()))?;

        let ports = midi_in.ports();
        if ports.is_empty() {
            return Err(EngineError::device("midi", "no MIDI input ports available"));
        }
        let pattern = port_match.to_lowercase();
        let port = ports
            .iter()
            .find(|p| {
                midi_in
                    .port_name(p)
                    .map(|n| n.to_lowercase().contains(&pattern))
                    .unwrap_or(false)
            })
            .ok_or_else(|| {
                EngineError::device("midi", format!("no MIDI port matching '{}'", port_match))
            })?;

        let port_name = midi_in
            .port_name(port)
            .map_err(|e| EngineError::device("midi", e.to_string()))?;
        log::info!("MIDI input connected to '{}'", port_name);

        let (mut producer, consumer) = rtrb::RingBuffer::new(MIDI_RING_CAPACITY);
        let connection = midi_in
            .connect(
                port,
                "trellis-midi-in",
                move |_stamp, message, _| {
                    for &byte in message {
                        // a full ring drops bytes; controller data is
                        // latest-value-wins anyway
                        let _ = producer.push(byte);
                    }
                },
                (),
            )
            .map_err(|e| EngineError::device("midi", e.to_string()))?;

        Ok(Self {
            _connection: connection,
            consumer,
            cc_values: [[255u8; 128]; 16],
            status: None,
            pending: [0; 2],
            pending_len: 0,
        })
    }

    /// Drain the byte ring and update controller state; call at block
    /// boundaries only
    pub fn poll(&mut self) {
        while let Ok(byte) = self.consumer.pop() {
            self.feed(byte);
        }
    }

    fn feed(&mut self, byte: u8) {
        if byte & 0x80 != 0 {
            // realtime messages (0xF8..) do not disturb running status
            if byte < 0xF8 {
                self.status = Some(byte);
                self.pending_len = 0;
            }
            return;
        }
        let Some(status) = self.status else {
            return;
        };
        if status & 0xF0 != 0xB0 {
            return;
        }
        self.pending[self.pending_len] = byte;
        self.pending_len += 1;
        if self.pending_len == 2 {
            let channel = (status & 0x0F) as usize;
            let controller = (self.pending[0] & 0x7F) as usize;
            self.cc_values[channel][controller] = self.pending[1] & 0x7F;
            // running status: the next data pair reuses this status byte
            self.pending_len = 0;
        }
    }

    /// Latest value of a controller, normalized to 0.0..=1.0; `None`
    /// until the controller has been seen
    pub fn controller_value(&self, channel: u8, controller: u8) -> Option<f64> {
        let v = self.cc_values[usize::from(channel & 0x0F)][usize::from(controller & 0x7F)];
        if v == 255 {
            None
        } else {
            Some(f64::from(v) / 127.0)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    /// Parser-only twin of RawMidiInput for byte-stream tests
    struct Parser {
        cc_values: [[u8; 128]; 16],
        status: Option<u8>,
        pending: [u8; 2],
        pending_len: usize,
    }

    impl Parser {
        fn new() -> Self {
            Self {
                cc_values: [[255; 128]; 16],
                status: None,
                pending: [0; 2],
                pending_len: 0,
            }
        }

        fn feed_all(&mut self, bytes: &[u8]) {
            for &b in bytes {
                // mirror RawMidiInput::feed
                if b & 0x80 != 0 {
                    if b < 0xF8 {
                        self.status = Some(b);
                        self.pending_len = 0;
                    }
                    continue;
                }
                let Some(status) = self.status else { continue };
                if status & 0xF0 != 0xB0 {
                    continue;
                }
                self.pending[self.pending_len] = b;
                self.pending_len += 1;
                if self.pending_len == 2 {
                    let ch = (status & 0x0F) as usize;
                    self.cc_values[ch][(self.pending[0] & 0x7F) as usize] = self.pending[1] & 0x7F;
                    self.pending_len = 0;
                }
            }
        }
    }

    #[test]
    fn test_control_change_latest_value_wins() {
        let mut p = Parser::new();
        p.feed_all(&[0xB0, 7, 100, 0xB0, 7, 64]);
        assert_eq!(p.cc_values[0][7], 64);
    }

    #[test]
    fn test_running_status() {
        let mut p = Parser::new();
        // one status byte, two data pairs
        p.feed_all(&[0xB2, 10, 1, 10, 99]);
        assert_eq!(p.cc_values[2][10], 99);
    }

    #[test]
    fn test_non_cc_messages_ignored() {
        let mut p = Parser::new();
        // note on, then CC on another channel
        p.feed_all(&[0x90, 60, 127, 0xB1, 5, 42]);
        assert_eq!(p.cc_values[0][60], 255);
        assert_eq!(p.cc_values[1][5], 42);
    }

    #[test]
    fn test_realtime_bytes_do_not_break_running_status() {
        let mut p = Parser::new();
        // clock byte (0xF8) interleaved mid-message
        p.feed_all(&[0xB0, 0xF8, 20, 30]);
        assert_eq!(p.cc_values[0][20], 30);
    }
}
