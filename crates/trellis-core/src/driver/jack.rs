//! JACK callback driver
//!
//! Integrates the engine with a JACK server that owns the realtime
//! thread. The process callback try-locks the engine-modification mutex
//! and runs one engine iteration per callback, copying port buffers in
//! and out around it; if the lock is contended or the engine is not
//! running, the outputs are muted instead. The callback never allocates
//! and never blocks.
//!
//! Three transport modes:
//!
//! - **Streaming**: ignore the JACK transport, run whenever the engine
//!   is running.
//! - **Master**: the engine drives the JACK transport (start/stop/
//!   locate follow engine state).
//! - **Slave**: follow the JACK transport, seeking ahead of the
//!   transport frame so disk I/O can catch up before the audio is due.
//!
//! While the callback runs the blocks, the engine thread parks on the
//! command channel and only dispatches commands under the same mutex.

use std::cell::UnsafeCell;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use jack::{AudioIn, AudioOut, Client, ClientOptions, Control, Port, ProcessScope};

use crate::endpoint::{AudioEndpoint, IoMode, RealtimeDevice};
use crate::engine::{CommandSender, Engine, EngineCommand, EngineStatus};
use crate::error::{EngineError, EngineResult};
use crate::types::SampleBuffer;

/// How the engine relates to the server's transport
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransportMode {
    Streaming,
    Master,
    Slave,
}

/// Upper bound for the slave-mode seek-ahead window, in frames
const SEEKAHEAD_CAP_FRAMES: u64 = 65_536;

/// Staging buffer shared between a jack endpoint and the process
/// callback
///
/// SAFETY protocol: the staging buffer is only touched while the
/// engine-modification mutex is held - the callback copies port data
/// around `engine_iteration`, and the endpoint's read/write run inside
/// that same iteration. No other access exists.
struct PortShared {
    staging: UnsafeCell<SampleBuffer>,
    running: AtomicBool,
}

unsafe impl Send for PortShared {}
unsafe impl Sync for PortShared {}

impl PortShared {
    fn new(channels: usize, frames: usize, sample_rate: u32) -> Self {
        Self {
            staging: UnsafeCell::new(SampleBuffer::silence(channels, frames, sample_rate)),
            running: AtomicBool::new(false),
        }
    }
}

/// A chainsetup endpoint backed by JACK ports
///
/// Register these through [`JackDriver::register_input`] /
/// [`JackDriver::register_output`], wire them into a chainsetup, then
/// run the engine with [`JackDriver::exec`].
pub struct JackEndpoint {
    label: String,
    io_mode: IoMode,
    channels: usize,
    sample_rate: u32,
    position: u64,
    shared: Arc<PortShared>,
}

impl AudioEndpoint for JackEndpoint {
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
        // SAFETY: see PortShared - serialized by the engine mutex
        let staging = unsafe { &*self.shared.staging.get() };
        buf.set_channels(staging.channels());
        buf.copy_from(staging);
        self.position += buf.frames() as u64;
        Ok(())
    }

    fn write(&mut self, buf: &SampleBuffer) -> EngineResult<()> {
        // SAFETY: see PortShared - serialized by the engine mutex
        let staging = unsafe { &mut *self.shared.staging.get() };
        staging.copy_from(buf);
        self.position += buf.frames() as u64;
        Ok(())
    }

    fn seek(&mut self, frame: u64) -> EngineResult<()> {
        if frame != self.position {
            return Err(EngineError::device(
                &self.label,
                "realtime endpoints only accept a seek to the current position",
            ));
        }
        Ok(())
    }

    fn set_buffersize(&mut self, _frames: usize, _rate: u32) {
        // block size is dictated by the JACK server
    }

    fn finished(&self) -> bool {
        false
    }

    fn as_device(&mut self) -> Option<&mut dyn RealtimeDevice> {
        Some(self)
    }

    fn is_realtime(&self) -> bool {
        true
    }
}

impl RealtimeDevice for JackEndpoint {
    fn prepare(&mut self) -> EngineResult<()> {
        Ok(())
    }

    fn start(&mut self) -> EngineResult<()> {
        self.shared.running.store(true, Ordering::Release);
        Ok(())
    }

    fn stop(&mut self) -> EngineResult<()> {
        self.shared.running.store(false, Ordering::Release);
        Ok(())
    }

    fn is_running(&self) -> bool {
        self.shared.running.load(Ordering::Acquire)
    }
}

struct InputGroup {
    ports: Vec<Port<AudioIn>>,
    shared: Arc<PortShared>,
}

struct OutputGroup {
    ports: Vec<Port<AudioOut>>,
    shared: Arc<PortShared>,
}

/// A pending auto-connection, applied after activation
struct PendingConnect {
    /// source port (ours for outputs, external for inputs)
    from: String,
    to: String,
}

/// Driver owning the JACK client until `exec` hands it to the server
pub struct JackDriver {
    client: Option<Client>,
    client_name: String,
    mode: TransportMode,
    sample_rate: u32,
    buffersize: usize,
    inputs: Vec<InputGroup>,
    outputs: Vec<OutputGroup>,
    connects: Vec<PendingConnect>,
}

impl JackDriver {
    /// Connect to the JACK server
    pub fn open(name: &str, mode: TransportMode) -> EngineResult<Self> {
        let (client, _status) = Client::new(name, ClientOptions::NO_START_SERVER)
            .map_err(|e| EngineError::device(name, format!("cannot connect to JACK: {}", e)))?;
        let client_name = client.name().to_string();
        let sample_rate = client.sample_rate() as u32;
        let buffersize = client.buffer_size() as usize;
        log::info!(
            "JACK client '{}' connected ({} Hz, {} frames, {:?} transport)",
            client_name,
            sample_rate,
            buffersize,
            mode
        );
        Ok(Self {
            client: Some(client),
            client_name,
            mode,
            sample_rate,
            buffersize,
            inputs: Vec::new(),
            outputs: Vec::new(),
            connects: Vec::new(),
        })
    }

    pub fn sample_rate(&self) -> u32 {
        self.sample_rate
    }

    /// Server-dictated block size; the chainsetup must use it
    pub fn buffersize(&self) -> usize {
        self.buffersize
    }

    /// Register a capture endpoint with `channels` ports. `connect_to`
    /// lists external source ports to wire up at activation (may be
    /// shorter than the channel count).
    pub fn register_input(
        &mut self,
        name: &str,
        channels: usize,
        connect_to: &[String],
    ) -> EngineResult<JackEndpoint> {
        let client = self
            .client
            .as_ref()
            .ok_or_else(|| EngineError::device(&self.client_name, "driver already running"))?;
        let shared = Arc::new(PortShared::new(channels, self.buffersize, self.sample_rate));
        let mut ports = Vec::with_capacity(channels);
        for ch in 0..channels {
            let port = client
                .register_port(&format!("{}_{}", name, ch + 1), AudioIn::default())
                .map_err(|e| EngineError::device(name, format!("port registration: {}", e)))?;
            if let Some(src) = connect_to.get(ch) {
                self.connects.push(PendingConnect {
                    from: src.clone(),
                    to: port.name().map_err(|e| EngineError::device(name, e))?,
                });
            }
            ports.push(port);
        }
        let endpoint = JackEndpoint {
            label: format!("jack:{}", name),
            io_mode: IoMode::Read,
            channels,
            sample_rate: self.sample_rate,
            position: 0,
            shared: Arc::clone(&shared),
        };
        self.inputs.push(InputGroup { ports, shared });
        Ok(endpoint)
    }

    /// Register a playback endpoint with `channels` ports
    pub fn register_output(
        &mut self,
        name: &str,
        channels: usize,
        connect_to: &[String],
    ) -> EngineResult<JackEndpoint> {
        let client = self
            .client
            .as_ref()
            .ok_or_else(|| EngineError::device(&self.client_name, "driver already running"))?;
        let shared = Arc::new(PortShared::new(channels, self.buffersize, self.sample_rate));
        let mut ports = Vec::with_capacity(channels);
        for ch in 0..channels {
            let port = client
                .register_port(&format!("{}_{}", name, ch + 1), AudioOut::default())
                .map_err(|e| EngineError::device(name, format!("port registration: {}", e)))?;
            if let Some(dst) = connect_to.get(ch) {
                self.connects.push(PendingConnect {
                    from: port.name().map_err(|e| EngineError::device(name, e))?,
                    to: dst.clone(),
                });
            }
            ports.push(port);
        }
        let endpoint = JackEndpoint {
            label: format!("jack:{}", name),
            io_mode: IoMode::Write,
            channels,
            sample_rate: self.sample_rate,
            position: 0,
            shared: Arc::clone(&shared),
        };
        self.outputs.push(OutputGroup { ports, shared });
        Ok(endpoint)
    }

    /// Activate the client and drive the engine until it exits
    ///
    /// The process callback runs the blocks; the calling thread becomes
    /// the engine thread, parked on the command channel and dispatching
    /// under the engine-modification mutex.
    pub fn exec(mut self, mut engine: Engine, batch_mode: bool) -> EngineResult<()> {
        let client = self
            .client
            .take()
            .ok_or_else(|| EngineError::device(&self.client_name, "driver already running"))?;

        engine.prefill();
        engine.prepare_operation()?;

        let commands = engine
            .take_command_receiver()
            .ok_or_else(|| EngineError::Runtime("engine command receiver already taken".into()))?;
        let command_tx = engine.command_sender();
        let exit_flag = engine.exit_flag();
        let shutdown_request = Arc::new(AtomicBool::new(false));

        let seekahead = (4096 / self.buffersize + 1).max(1);
        let engine = Arc::new(Mutex::new(engine));

        let processor = JackProcessor {
            engine: Arc::clone(&engine),
            mode: self.mode,
            inputs: std::mem::take(&mut self.inputs),
            outputs: std::mem::take(&mut self.outputs),
            buffersize: self.buffersize,
            seekahead,
            seekahead_initial: seekahead,
            seek_target: None,
            tx: command_tx,
        };
        let notifications = JackNotifications {
            expected_rate: self.sample_rate,
            shutdown: Arc::clone(&shutdown_request),
        };

        let async_client = client
            .activate_async(notifications, processor)
            .map_err(|e| EngineError::device(&self.client_name, format!("activation: {}", e)))?;

        for c in &self.connects {
            if let Err(e) = async_client.as_client().connect_ports_by_name(&c.from, &c.to) {
                log::warn!("cannot connect {} -> {}: {}", c.from, c.to, e);
            }
        }

        // engine thread: sleep on the command channel, dispatch under
        // the modification mutex, watch the exit conditions
        let mut result = Ok(());
        loop {
            if let Some(cmd) = commands.recv_timeout(Duration::from_millis(100)) {
                let mut guard = engine.lock().expect("engine mutex");
                guard.handle_command(cmd);
                while let Some(more) = commands.try_recv() {
                    guard.handle_command(more);
                }
            }

            if exit_flag.load(Ordering::Acquire) {
                log::info!("exit requested; leaving callback driver");
                break;
            }
            if shutdown_request.load(Ordering::Acquire) {
                result = Err(EngineError::ServerShutdown(self.client_name.clone()));
                break;
            }
            let guard = engine.lock().expect("engine mutex");
            if guard.end_requested() {
                break;
            }
            if batch_mode && guard.status() == EngineStatus::Finished {
                break;
            }
        }

        // callbacks stop with the async client; afterwards the engine
        // is exclusively ours again
        drop(async_client);
        let engine = Arc::try_unwrap(engine)
            .map_err(|_| EngineError::Runtime("callback still holds the engine".into()))?;
        let mut engine = engine.into_inner().expect("engine mutex");
        engine.stop_operation();
        engine.disconnect();
        result
    }
}

struct JackNotifications {
    expected_rate: u32,
    shutdown: Arc<AtomicBool>,
}

impl jack::NotificationHandler for JackNotifications {
    fn sample_rate(&mut self, _client: &Client, srate: jack::Frames) -> Control {
        if srate as u32 != self.expected_rate {
            log::error!(
                "JACK sample rate changed to {} (engine runs at {}); shutting down",
                srate,
                self.expected_rate
            );
            self.shutdown.store(true, Ordering::Release);
        }
        Control::Continue
    }

    fn xrun(&mut self, _client: &Client) -> Control {
        log::warn!("JACK xrun detected");
        Control::Continue
    }

    fn shutdown(&mut self, _status: jack::ClientStatus, reason: &str) {
        log::error!("JACK server shut down: {}", reason);
        self.shutdown.store(true, Ordering::Release);
    }
}

struct JackProcessor {
    engine: Arc<Mutex<Engine>>,
    mode: TransportMode,
    inputs: Vec<InputGroup>,
    outputs: Vec<OutputGroup>,
    buffersize: usize,
    /// Blocks of lead given to disk seeks in slave mode; doubles after
    /// a missed target, capped at 65536/buffersize
    seekahead: usize,
    seekahead_initial: usize,
    seek_target: Option<u64>,
    tx: CommandSender,
}

impl jack::ProcessHandler for JackProcessor {
    fn process(&mut self, client: &Client, ps: &ProcessScope) -> Control {
        let nframes = ps.n_frames() as usize;

        // never block inside the callback: contended lock means silence
        let Ok(mut engine) = self.engine.try_lock() else {
            self.mute(ps, nframes);
            return Control::Continue;
        };

        match self.mode {
            TransportMode::Streaming => {
                if engine.is_running() {
                    self.run_iteration(&mut engine, ps, nframes);
                } else {
                    self.mute(ps, nframes);
                }
            }
            TransportMode::Master => self.process_master(&mut engine, client, ps, nframes),
            TransportMode::Slave => self.process_slave(&mut engine, client, ps, nframes),
        }
        Control::Continue
    }
}

impl JackProcessor {
    /// Port inputs -> staging, one engine iteration, staging -> port
    /// outputs
    fn run_iteration(&mut self, engine: &mut Engine, ps: &ProcessScope, nframes: usize) {
        if engine.status() == EngineStatus::Finished {
            self.mute(ps, nframes);
            return;
        }
        debug_assert_eq!(nframes, self.buffersize);

        for group in &self.inputs {
            // SAFETY: see PortShared - we hold the engine mutex
            let staging = unsafe { &mut *group.shared.staging.get() };
            staging.set_frames(nframes);
            for (ch, port) in group.ports.iter().enumerate() {
                staging.channel_mut(ch).copy_from_slice(port.as_slice(ps));
            }
        }

        if let Err(e) = engine.engine_iteration() {
            log::error!("engine iteration failed: {}", e);
            engine.stop_operation();
            self.mute(ps, nframes);
            return;
        }

        for group in &mut self.outputs {
            // SAFETY: see PortShared - we hold the engine mutex
            let staging = unsafe { &*group.shared.staging.get() };
            let written = staging.frames().min(nframes);
            for (ch, port) in group.ports.iter_mut().enumerate() {
                let out = port.as_mut_slice(ps);
                if ch < staging.channels() {
                    out[..written].copy_from_slice(&staging.channel(ch)[..written]);
                    out[written..].fill(0.0);
                } else {
                    out.fill(0.0);
                }
            }
        }
    }

    fn mute(&mut self, ps: &ProcessScope, _nframes: usize) {
        for group in &mut self.outputs {
            for port in group.ports.iter_mut() {
                port.as_mut_slice(ps).fill(0.0);
            }
        }
    }

    /// Engine controls the transport: follow engine state with
    /// start/stop and republish the engine position
    fn process_master(
        &mut self,
        engine: &mut Engine,
        client: &Client,
        ps: &ProcessScope,
        nframes: usize,
    ) {
        let transport = client.transport();
        let rolling = transport
            .query_state()
            .map(|s| s == jack::TransportState::Rolling)
            .unwrap_or(false);

        if engine.is_running() {
            self.run_iteration(engine, ps, nframes);
            if !rolling {
                if let Err(e) = transport.start() {
                    log::warn!("cannot start JACK transport: {}", e);
                }
            }
        } else {
            if rolling {
                if let Err(e) = transport.stop() {
                    log::warn!("cannot stop JACK transport: {}", e);
                }
            }
            let frame = engine.current_position_in_samples() as jack::Frames;
            if let Err(e) = transport.locate(frame) {
                log::warn!("cannot locate JACK transport: {}", e);
            }
            self.mute(ps, nframes);
        }
    }

    /// Follow the server's transport, seeking ahead of it so the disk
    /// subsystem has time to catch up before audio is due
    fn process_slave(
        &mut self,
        engine: &mut Engine,
        client: &Client,
        ps: &ProcessScope,
        nframes: usize,
    ) {
        let transport = client.transport();
        let Ok(state) = transport.query() else {
            self.mute(ps, nframes);
            return;
        };
        let transport_frame = u64::from(state.pos.frame());
        let engine_pos = engine.current_position_in_samples();
        let block = self.buffersize as u64;

        match state.state {
            jack::TransportState::Stopped => {
                if engine.is_running() {
                    engine.stop_operation();
                    if let Err(e) = engine.prepare_operation() {
                        log::error!("prepare after transport stop failed: {}", e);
                    }
                }
                // prepare the next start by seeking to where the
                // transport will resume; within one block is close
                // enough to start cleanly
                if engine_pos.abs_diff(transport_frame) > block {
                    let offset = if engine.is_prepared() { 1 } else { self.seekahead as u64 };
                    let target = transport_frame + offset * block;
                    if self.seek_target != Some(target) {
                        self.seek_target = Some(target);
                        self.tx.send(EngineCommand::SetPosLiveSamples(target));
                    }
                }
                self.mute(ps, nframes);
            }
            _ => {
                // rolling (or starting; both mean audio is due)
                let aligned = engine_pos.abs_diff(transport_frame) <= block;
                if !engine.is_running() && engine.status() != EngineStatus::Finished {
                    let past_end = match engine.length_in_samples() {
                        Some(len) => transport_frame > len,
                        None => false,
                    };
                    if !past_end {
                        if engine.is_prepared() && aligned {
                            if let Err(e) = engine.start_operation() {
                                log::error!("slave start failed: {}", e);
                            }
                        } else {
                            self.tx.send(EngineCommand::Start);
                        }
                    }
                }

                if engine.is_running() && aligned {
                    self.run_iteration(engine, ps, nframes);
                    self.seek_target = None;
                    self.seekahead = self.seekahead_initial;
                    return;
                }

                // positions diverge: silence, and (re)arm a seek-ahead
                let missed = match self.seek_target {
                    None => true,
                    // target already behind the transport
                    Some(t) => t < transport_frame + block
                        // or rewound far ahead of where we aimed
                        || t > transport_frame + block + self.seekahead as u64 * block,
                };
                if missed {
                    if self.seek_target.is_some() {
                        let cap = (SEEKAHEAD_CAP_FRAMES / block).max(1) as usize;
                        self.seekahead = (self.seekahead * 2).min(cap);
                        log::debug!("seek-ahead missed; widening to {} blocks", self.seekahead);
                    }
                    let target = transport_frame + self.seekahead as u64 * block;
                    self.seek_target = Some(target);
                    self.tx.send(EngineCommand::SetPosLiveSamples(target));
                }
                self.mute(ps, nframes);
            }
        }
    }
}
