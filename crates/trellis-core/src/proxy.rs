//! Disk-I/O proxy server
//!
//! Decouples file endpoints from the realtime block cadence: one dedicated
//! I/O thread services a slot ring per wrapped endpoint, prefilling read
//! rings and draining write rings, while the engine talks to lightweight
//! [`ProxyEndpoint`] clients that never block on disk.
//!
//! Each ring is strict SPSC. For a read endpoint the server thread is the
//! producer and the engine the consumer; for a write endpoint the roles
//! flip. Only the owning side ever touches a slot, gated by the acquire/
//! release ordering on the indices, so slot access needs no lock.

use std::cell::UnsafeCell;
use std::sync::atomic::{AtomicBool, AtomicI64, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::thread::JoinHandle;
use std::time::{Duration, Instant};

use crate::endpoint::{AudioEndpoint, IoMode};
use crate::error::{EngineError, EngineResult};
use crate::types::SampleBuffer;

/// How long the service thread naps when every ring is in steady state
const SERVICE_IDLE: Duration = Duration::from_millis(1);

/// Poll interval for client-side waits (prefill, seek acknowledge)
const CLIENT_POLL: Duration = Duration::from_millis(1);

/// Sentinel for "no seek requested"
const NO_SEEK: i64 = -1;

/// A single-producer/single-consumer ring of sample-buffer slots
///
/// `(write_idx - read_idx) mod slots` is the fill level; "full" is
/// `slots - 1` so an empty ring and a full ring stay distinguishable.
pub struct ProxyBuffer {
    slots: Vec<UnsafeCell<SampleBuffer>>,
    read_idx: AtomicUsize,
    write_idx: AtomicUsize,
    finished: AtomicBool,
    io_mode: IoMode,
    /// Client-to-server seek request in frames; NO_SEEK when idle
    seek_request: AtomicI64,
}

// SAFETY: slot access follows the SPSC index protocol - the producer only
// writes the slot at write_idx before publishing it with a release store,
// the consumer only reads the slot at read_idx after an acquire load.
unsafe impl Sync for ProxyBuffer {}
unsafe impl Send for ProxyBuffer {}

impl ProxyBuffer {
    pub fn new(slot_count: usize, channels: usize, frames: usize, sample_rate: u32, io_mode: IoMode) -> Self {
        debug_assert!(slot_count >= 2);
        Self {
            slots: (0..slot_count)
                .map(|_| UnsafeCell::new(SampleBuffer::silence(channels, frames, sample_rate)))
                .collect(),
            read_idx: AtomicUsize::new(0),
            write_idx: AtomicUsize::new(0),
            finished: AtomicBool::new(false),
            io_mode,
            seek_request: AtomicI64::new(NO_SEEK),
        }
    }

    pub fn io_mode(&self) -> IoMode {
        self.io_mode
    }

    /// Number of filled slots available to the consumer
    #[inline]
    pub fn read_space(&self) -> usize {
        let w = self.write_idx.load(Ordering::Acquire);
        let r = self.read_idx.load(Ordering::Acquire);
        (w + self.slots.len() - r) % self.slots.len()
    }

    /// Number of empty slots available to the producer
    #[inline]
    pub fn write_space(&self) -> usize {
        self.slots.len() - 1 - self.read_space()
    }

    /// The slot the producer may fill next
    ///
    /// SAFETY contract: caller must be the single producer and must not
    /// hold the reference across `advance_write`.
    #[inline]
    #[allow(clippy::mut_from_ref)]
    fn produce_slot(&self) -> &mut SampleBuffer {
        let w = self.write_idx.load(Ordering::Relaxed);
        unsafe { &mut *self.slots[w].get() }
    }

    /// The slot the consumer may read next
    #[inline]
    fn consume_slot(&self) -> &SampleBuffer {
        let r = self.read_idx.load(Ordering::Relaxed);
        unsafe { &*self.slots[r].get() }
    }

    #[inline]
    fn advance_write(&self) {
        let w = self.write_idx.load(Ordering::Relaxed);
        self.write_idx.store((w + 1) % self.slots.len(), Ordering::Release);
    }

    #[inline]
    fn advance_read(&self) {
        let r = self.read_idx.load(Ordering::Relaxed);
        self.read_idx.store((r + 1) % self.slots.len(), Ordering::Release);
    }

    fn set_finished(&self, v: bool) {
        self.finished.store(v, Ordering::Release);
    }

    pub fn finished(&self) -> bool {
        self.finished.load(Ordering::Acquire)
    }

    /// Empty the ring. Only valid while the opposite side is quiescent
    /// (the server resets rings while servicing a seek, with the engine
    /// stopped).
    fn reset(&self) {
        self.read_idx.store(0, Ordering::Release);
        self.write_idx.store(0, Ordering::Release);
        self.finished.store(false, Ordering::Release);
    }
}

/// One wrapped endpoint plus its ring, owned by the service thread
struct ProxyWorker {
    endpoint: Box<dyn AudioEndpoint>,
    ring: Arc<ProxyBuffer>,
    buffersize: usize,
}

impl ProxyWorker {
    /// One service pass; returns true if any slot moved
    fn service(&mut self) -> bool {
        // seeks first: the ring contents predate the new position
        let seek = self.ring.seek_request.load(Ordering::Acquire);
        if seek != NO_SEEK {
            // audio recorded before the seek point still belongs on disk
            self.drain();
            self.ring.reset();
            if let Err(e) = self.endpoint.seek(seek as u64) {
                log::warn!("proxy seek on '{}' failed: {}", self.endpoint.label(), e);
            }
            self.ring.seek_request.store(NO_SEEK, Ordering::Release);
            return true;
        }

        match self.ring.io_mode() {
            IoMode::Read | IoMode::ReadWrite => {
                let mut moved = false;
                while self.ring.write_space() > 0 && !self.ring.finished() {
                    let slot = self.ring.produce_slot();
                    slot.set_channels(self.endpoint.channels());
                    slot.set_frames(self.buffersize);
                    match self.endpoint.read(slot) {
                        Ok(()) => {}
                        Err(e) => {
                            // device failure degrades to end-of-stream
                            log::error!("proxy read on '{}' failed: {}", self.endpoint.label(), e);
                            slot.set_frames(0);
                            self.ring.set_finished(true);
                        }
                    }
                    if self.endpoint.finished() {
                        self.ring.set_finished(true);
                    }
                    self.ring.advance_write();
                    moved = true;
                }
                moved
            }
            IoMode::Write => self.drain(),
        }
    }

    /// Drain pending output slots to disk; returns true if any moved
    fn drain(&mut self) -> bool {
        if self.ring.io_mode() != IoMode::Write {
            return false;
        }
        let mut moved = false;
        while self.ring.read_space() > 0 {
            let slot = self.ring.consume_slot();
            if slot.frames() > 0 {
                if let Err(e) = self.endpoint.write(slot) {
                    log::error!("proxy write on '{}' failed: {}", self.endpoint.label(), e);
                    self.ring.set_finished(true);
                }
            }
            self.ring.advance_read();
            moved = true;
        }
        moved
    }
}

/// Configuration for the proxy server
#[derive(Debug, Clone, Copy)]
pub struct ProxyConfig {
    /// Total double-buffer depth in frames; slot count per ring is
    /// `max(2, depth / buffersize)`
    pub buffer_frames: usize,
    pub buffersize: usize,
    pub sample_rate: u32,
    /// SCHED_FIFO priority for the service thread, if raised priority is
    /// in effect (one below the engine's)
    pub sched_priority: Option<i32>,
}

impl ProxyConfig {
    pub fn slot_count(&self) -> usize {
        (self.buffer_frames / self.buffersize.max(1)).max(2)
    }
}

/// The disk-I/O thread and its registered rings
pub struct ProxyServer {
    config: ProxyConfig,
    workers: Arc<Mutex<Vec<ProxyWorker>>>,
    running: Arc<AtomicBool>,
    handle: Option<JoinHandle<()>>,
}

impl ProxyServer {
    pub fn new(config: ProxyConfig) -> Self {
        Self {
            config,
            workers: Arc::new(Mutex::new(Vec::new())),
            running: Arc::new(AtomicBool::new(false)),
            handle: None,
        }
    }

    /// Wrap a file endpoint; the engine keeps the returned client, the
    /// server takes the endpoint itself. Must be called before `start`.
    pub fn wrap(&mut self, mut endpoint: Box<dyn AudioEndpoint>) -> EngineResult<ProxyEndpoint> {
        endpoint.open()?;
        let mode = endpoint.io_mode();
        let ring = Arc::new(ProxyBuffer::new(
            self.config.slot_count(),
            endpoint.channels().max(1),
            self.config.buffersize,
            self.config.sample_rate,
            mode,
        ));
        let client = ProxyEndpoint {
            label: format!("proxy:{}", endpoint.label()),
            io_mode: mode,
            channels: endpoint.channels(),
            sample_rate: endpoint.sample_rate(),
            length: endpoint.length_in_samples(),
            position: endpoint.position_in_samples(),
            finished: false,
            ring: Arc::clone(&ring),
            server_running: Arc::clone(&self.running),
            last_underrun_log: None,
        };
        self.workers.lock().expect("proxy worker lock").push(ProxyWorker {
            endpoint,
            ring,
            buffersize: self.config.buffersize,
        });
        Ok(client)
    }

    /// Spawn the service thread. Idempotent while running.
    pub fn start(&mut self) {
        if self.running.load(Ordering::Acquire) {
            return;
        }
        self.running.store(true, Ordering::Release);
        let workers = Arc::clone(&self.workers);
        let running = Arc::clone(&self.running);
        let priority = self.config.sched_priority;
        self.handle = Some(
            std::thread::Builder::new()
                .name("trellis-proxy".to_string())
                .spawn(move || {
                    if let Some(p) = priority {
                        crate::rt::acquire_realtime(p);
                    }
                    log::debug!("proxy server thread running");
                    while running.load(Ordering::Acquire) {
                        let mut moved = false;
                        {
                            let mut guard = workers.lock().expect("proxy worker lock");
                            for worker in guard.iter_mut() {
                                moved |= worker.service();
                            }
                        }
                        if !moved {
                            std::thread::sleep(SERVICE_IDLE);
                        }
                    }
                    // leave no recorded audio stranded in the write rings
                    let mut guard = workers.lock().expect("proxy worker lock");
                    for worker in guard.iter_mut() {
                        worker.drain();
                    }
                    log::debug!("proxy server thread exiting");
                })
                .expect("spawn proxy server thread"),
        );
    }

    /// Ask the thread to leave the service loop and wait for it. Idempotent.
    pub fn stop(&mut self) {
        self.running.store(false, Ordering::Release);
        if let Some(handle) = self.handle.take() {
            let _ = handle.join();
        }
    }

    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::Acquire)
    }

    /// True once every read ring is prefilled (or its source has ended)
    pub fn is_full(&self) -> bool {
        let guard = self.workers.lock().expect("proxy worker lock");
        guard.iter().all(|w| match w.ring.io_mode() {
            IoMode::Read | IoMode::ReadWrite => w.ring.write_space() == 0 || w.ring.finished(),
            IoMode::Write => true,
        })
    }

    /// Block until `is_full()`
    pub fn wait_for_full(&self) {
        while self.is_running() && !self.is_full() {
            std::thread::sleep(CLIENT_POLL);
        }
    }

    /// Stop the thread and close every wrapped endpoint
    pub fn shutdown(&mut self) -> EngineResult<()> {
        self.stop();
        let mut guard = self.workers.lock().expect("proxy worker lock");
        for worker in guard.iter_mut() {
            worker.endpoint.close()?;
        }
        guard.clear();
        Ok(())
    }
}

impl Drop for ProxyServer {
    fn drop(&mut self) {
        self.stop();
    }
}

/// Client side of a wrapped endpoint
///
/// Presents the plain [`AudioEndpoint`] contract to the engine; reads copy
/// out of the current slot, writes copy into the next free slot, seeks are
/// forwarded to the service thread which flushes the ring first.
pub struct ProxyEndpoint {
    label: String,
    io_mode: IoMode,
    channels: usize,
    sample_rate: u32,
    length: Option<u64>,
    position: u64,
    finished: bool,
    ring: Arc<ProxyBuffer>,
    server_running: Arc<AtomicBool>,
    last_underrun_log: Option<Instant>,
}

impl ProxyEndpoint {
    fn log_underrun(&mut self) {
        let now = Instant::now();
        let due = match self.last_underrun_log {
            Some(t) => now.duration_since(t) >= Duration::from_secs(1),
            None => true,
        };
        if due {
            log::warn!("disk stream underrun on '{}'; emitting silence", self.label);
            self.last_underrun_log = Some(now);
        }
    }
}

impl AudioEndpoint for ProxyEndpoint {
    fn label(&self) -> &str {
        &self.label
    }

    fn io_mode(&self) -> IoMode {
        self.io_mode
    }

    fn channels(&self) -> usize {
        self.channels
    }

    fn sample_rate(&self) -> u32 {
        self.sample_rate
    }

    fn length_in_samples(&self) -> Option<u64> {
        self.length
    }

    fn position_in_samples(&self) -> u64 {
        self.position
    }

    fn open(&mut self) -> EngineResult<()> {
        // the server opened the underlying endpoint at wrap time
        Ok(())
    }

    fn close(&mut self) -> EngineResult<()> {
        // underlying endpoint is closed by ProxyServer::shutdown
        Ok(())
    }

    fn read(&mut self, buf: &mut SampleBuffer) -> EngineResult<()> {
        let wanted = buf.frames();
        if self.ring.read_space() == 0 {
            if self.ring.finished() {
                self.finished = true;
                buf.set_frames(0);
            } else {
                // mid-stream underrun: silence, keep going
                self.log_underrun();
                buf.make_silent();
                self.position += wanted as u64;
            }
            return Ok(());
        }

        let slot = self.ring.consume_slot();
        let take = wanted.min(slot.frames());
        buf.set_channels(slot.channels());
        buf.set_frames(take);
        for ch in 0..slot.channels().min(buf.channels()) {
            let src = &slot.channel(ch)[..take];
            buf.channel_mut(ch).copy_from_slice(src);
        }
        self.ring.advance_read();
        self.position += take as u64;
        if take < wanted && self.ring.finished() && self.ring.read_space() == 0 {
            self.finished = true;
        }
        Ok(())
    }

    fn write(&mut self, buf: &SampleBuffer) -> EngineResult<()> {
        // backpressure: wait for a free slot; bounded by disk throughput,
        // only ever taken on the engine thread
        while self.ring.write_space() == 0 {
            if self.ring.finished() {
                return Err(EngineError::device(&self.label, "proxy ring closed"));
            }
            std::thread::sleep(CLIENT_POLL);
        }
        let slot = self.ring.produce_slot();
        slot.copy_from(buf);
        self.ring.advance_write();
        self.position += buf.frames() as u64;
        Ok(())
    }

    fn seek(&mut self, frame: u64) -> EngineResult<()> {
        self.ring.seek_request.store(frame as i64, Ordering::Release);
        // wait for the service thread to flush the ring and reposition;
        // with the server not yet started the request stays pending and
        // is honored before the first prefill pass
        while self.server_running.load(Ordering::Acquire)
            && self.ring.seek_request.load(Ordering::Acquire) != NO_SEEK
        {
            std::thread::sleep(CLIENT_POLL);
        }
        self.position = frame;
        self.finished = false;
        Ok(())
    }

    fn set_buffersize(&mut self, _frames: usize, _rate: u32) {}

    fn finished(&self) -> bool {
        self.finished
    }
}
