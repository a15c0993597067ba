//! The block-processing engine
//!
//! Owns a connected chainsetup and drives it one block at a time: read
//! every input into its chains' working slots, run the chains, mix the
//! slots into the outputs with equal weights, then handle transport
//! bookkeeping. All engine state is mutated either on the thread running
//! the loop or, in callback mode, by the callback thread while it holds
//! the engine-modification mutex.
//!
//! ## State machine
//!
//! NotReady -> Stopped -> (Running <-> Stopped) -> Finished
//!
//! `Finished` is terminal for a batch run; the command queue can still
//! reposition and restart a finished engine in keep-running mode.

pub mod command;

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Condvar, Mutex};
use std::time::{Duration, Instant};

pub use command::{command_channel, CommandReceiver, CommandSender, EngineCommand};

use crate::chain::{BufferShape, Chain};
use crate::chainsetup::{ChainSetup, MixMode};
use crate::endpoint::AudioEndpoint;
use crate::error::{EngineError, EngineResult};
use crate::proxy::{ProxyConfig, ProxyServer};
use crate::types::SampleBuffer;

/// Engine status
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EngineStatus {
    NotReady,
    Stopped,
    Running,
    Finished,
}

/// Sleep between polls while the engine is stopped in blocking mode
const CONTROL_SLEEP: Duration = Duration::from_millis(1);

/// Iterations to run before starting realtime outputs in a
/// non-multitrack start, so the device's first buffer is full when its
/// clock begins
const OUTPUT_TRIGGER_ITERATIONS: u8 = 2;

/// The processing engine
pub struct Engine {
    csetup: ChainSetup,
    chains: Vec<Chain>,
    inputs: Vec<Box<dyn AudioEndpoint>>,
    outputs: Vec<Box<dyn AudioEndpoint>>,

    /// Indices (into inputs/outputs) of realtime endpoints
    realtime_inputs: Vec<usize>,
    realtime_outputs: Vec<usize>,
    non_realtime_inputs: Vec<usize>,
    non_realtime_outputs: Vec<usize>,
    /// Outputs that receive audio during multitrack warm-up: non-realtime
    /// sinks whose chain is fed by a realtime input
    slave_outputs: Vec<bool>,

    input_chain_count: Vec<usize>,
    output_chain_count: Vec<usize>,
    input_start_pos: Vec<u64>,
    /// Endpoints whose device errors were downgraded to end-of-stream
    input_failed: Vec<bool>,
    output_failed: Vec<bool>,

    buffersize: usize,
    mixmode: MixMode,
    mixslot: SampleBuffer,
    work_slots: Vec<SampleBuffer>,

    status: EngineStatus,
    prepared: bool,
    rt_running: bool,
    end_request: bool,
    was_running: bool,
    input_not_finished: bool,
    processing_range_set: bool,

    multitrack_mode: bool,
    multitrack_input_stamp: Option<Instant>,
    trigger_outputs_request: bool,
    trigger_counter: u8,

    active_chain: usize,
    active_op: usize,
    active_param: usize,

    pserver: Option<ProxyServer>,
    /// Raw MIDI stream polled at block boundaries for controller values
    #[cfg(feature = "midi")]
    midi: Option<crate::midi::RawMidiInput>,

    /// `None` once a callback driver has taken the receiver and drives
    /// command dispatch itself
    commands: Option<CommandReceiver>,
    command_tx: CommandSender,
    exit_request: Arc<AtomicBool>,
    /// Broadcast on every transition out of Running
    stop_notify: Arc<(Mutex<bool>, Condvar)>,

    disconnected: bool,
}

impl Engine {
    /// Connect a chainsetup: open and partition endpoints, size buffers,
    /// resolve the mix method. Fails without touching realtime clocks.
    pub fn connect(mut csetup: ChainSetup) -> EngineResult<Engine> {
        csetup.validate()?;

        let mut inputs = std::mem::take(&mut csetup.inputs);
        let mut outputs = std::mem::take(&mut csetup.outputs);
        let chains = std::mem::take(&mut csetup.chains);
        let buffersize = csetup.buffersize();
        let sample_rate = csetup.sample_rate();

        // open everything up front; roll back in reverse on failure
        let mut opened: Vec<(bool, usize)> = Vec::new();
        let open_all = |eps: &mut Vec<Box<dyn AudioEndpoint>>,
                        is_input: bool,
                        opened: &mut Vec<(bool, usize)>|
         -> EngineResult<()> {
            for (i, ep) in eps.iter_mut().enumerate() {
                ep.open()?;
                opened.push((is_input, i));
            }
            Ok(())
        };
        if let Err(e) = open_all(&mut inputs, true, &mut opened)
            .and_then(|_| open_all(&mut outputs, false, &mut opened))
        {
            for (is_input, i) in opened.into_iter().rev() {
                let ep = if is_input { &mut inputs[i] } else { &mut outputs[i] };
                let _ = ep.close();
            }
            return Err(e);
        }

        // rate agreement check needs open endpoints (file headers)
        csetup.inputs = inputs;
        csetup.outputs = outputs;
        csetup.check_sample_rates()?;
        let mut inputs = std::mem::take(&mut csetup.inputs);
        let mut outputs = std::mem::take(&mut csetup.outputs);

        // double-buffering: wrap every file endpoint behind the proxy
        // server before anything records start positions
        let mut pserver = None;
        if csetup.double_buffering() {
            let mut server = ProxyServer::new(ProxyConfig {
                buffer_frames: csetup.double_buffer_frames(),
                buffersize,
                sample_rate,
                sched_priority: if csetup.raised_priority() {
                    Some(csetup.sched_priority() - 1)
                } else {
                    None
                },
            });
            for ep in inputs.iter_mut().chain(outputs.iter_mut()) {
                if !ep.is_realtime() {
                    let raw = std::mem::replace(
                        ep,
                        Box::new(crate::endpoint::null::NullSource::new(0, sample_rate)),
                    );
                    *ep = Box::new(server.wrap(raw)?);
                }
            }
            pserver = Some(server);
        }

        let realtime_inputs: Vec<usize> =
            (0..inputs.len()).filter(|&i| inputs[i].is_realtime()).collect();
        let non_realtime_inputs: Vec<usize> =
            (0..inputs.len()).filter(|&i| !inputs[i].is_realtime()).collect();
        let realtime_outputs: Vec<usize> =
            (0..outputs.len()).filter(|&o| outputs[o].is_realtime()).collect();
        let non_realtime_outputs: Vec<usize> =
            (0..outputs.len()).filter(|&o| !outputs[o].is_realtime()).collect();

        let max_channels = inputs
            .iter()
            .chain(outputs.iter())
            .map(|e| e.channels())
            .max()
            .unwrap_or(1)
            .max(1);

        for ep in inputs.iter_mut().chain(outputs.iter_mut()) {
            ep.set_buffersize(buffersize, sample_rate);
        }

        let input_chain_count: Vec<usize> = (0..inputs.len())
            .map(|i| chains.iter().filter(|c| c.input_id == i).count())
            .collect();
        let output_chain_count: Vec<usize> = (0..outputs.len())
            .map(|o| chains.iter().filter(|c| c.output_id == o).count())
            .collect();

        // seek to configured start positions and remember them for loops
        let mut input_start_pos = Vec::with_capacity(inputs.len());
        for ep in inputs.iter_mut() {
            let pos = ep.position_in_samples();
            ep.seek(pos)?;
            input_start_pos.push(pos);
        }
        for ep in outputs.iter_mut() {
            let pos = ep.position_in_samples();
            ep.seek(pos)?;
        }

        // derive the processing length from the longest input when it was
        // not set explicitly; infinite inputs leave it unset
        let processing_range_set = csetup.length_set_explicitly();
        if !processing_range_set {
            if let Some(max_len) = inputs.iter().filter_map(|e| e.length_in_samples()).max() {
                csetup.derive_length(max_len);
            }
        }

        let multitrack_mode = !realtime_inputs.is_empty()
            && !realtime_outputs.is_empty()
            && !non_realtime_inputs.is_empty()
            && !non_realtime_outputs.is_empty()
            && chains.len() > 1;

        let slave_outputs: Vec<bool> = (0..outputs.len())
            .map(|o| {
                !outputs[o].is_realtime()
                    && chains
                        .iter()
                        .any(|c| c.output_id == o && inputs[c.input_id].is_realtime())
            })
            .collect();

        let mixmode = Self::resolve_mixmode(
            csetup.mixmode(),
            multitrack_mode,
            chains.len(),
            inputs.len(),
            outputs.len(),
        );
        if multitrack_mode {
            log::info!("multitrack mode enabled; mix method forced to normal");
        }

        let mixslot = SampleBuffer::with_capacity(
            max_channels,
            buffersize,
            max_channels,
            buffersize,
            sample_rate,
        );
        let mut work_slots: Vec<SampleBuffer> = (0..chains.len())
            .map(|_| {
                SampleBuffer::with_capacity(max_channels, buffersize, max_channels, buffersize, sample_rate)
            })
            .collect();

        let mut chains = chains;
        let shape = BufferShape {
            channels: max_channels,
            frames: buffersize,
            sample_rate,
        };
        for (chain, slot) in chains.iter_mut().zip(work_slots.iter_mut()) {
            slot.set_frames(buffersize);
            chain.init(shape);
        }

        let (command_tx, commands) = command_channel();
        let input_failed = vec![false; inputs.len()];
        let output_failed = vec![false; outputs.len()];

        log::info!(
            "connected chainsetup '{}': {} inputs, {} outputs, {} chains, buffersize {}, {:?} mix",
            csetup.name(),
            inputs.len(),
            outputs.len(),
            chains.len(),
            buffersize,
            mixmode
        );

        Ok(Engine {
            csetup,
            chains,
            inputs,
            outputs,
            realtime_inputs,
            realtime_outputs,
            non_realtime_inputs,
            non_realtime_outputs,
            slave_outputs,
            input_chain_count,
            output_chain_count,
            input_start_pos,
            input_failed,
            output_failed,
            buffersize,
            mixmode,
            mixslot,
            work_slots,
            status: EngineStatus::Stopped,
            prepared: false,
            rt_running: false,
            end_request: false,
            was_running: false,
            input_not_finished: true,
            processing_range_set,
            multitrack_mode,
            multitrack_input_stamp: None,
            trigger_outputs_request: false,
            trigger_counter: 0,
            active_chain: 0,
            active_op: 0,
            active_param: 0,
            pserver,
            #[cfg(feature = "midi")]
            midi: None,
            commands: Some(commands),
            command_tx,
            exit_request: Arc::new(AtomicBool::new(false)),
            stop_notify: Arc::new((Mutex::new(false), Condvar::new())),
            disconnected: false,
        })
    }

    fn resolve_mixmode(
        configured: MixMode,
        multitrack: bool,
        chains: usize,
        inputs: usize,
        outputs: usize,
    ) -> MixMode {
        let trivial = chains == 1 && inputs == 1 && outputs == 1;
        if multitrack {
            return MixMode::Normal;
        }
        match configured {
            MixMode::Auto => {
                if trivial {
                    MixMode::Simple
                } else {
                    MixMode::Normal
                }
            }
            MixMode::Simple if !trivial => {
                log::warn!("setup too complex for simple mix method; using normal");
                MixMode::Normal
            }
            other => other,
        }
    }

    // --- observers -----------------------------------------------------

    pub fn status(&self) -> EngineStatus {
        self.status
    }

    pub fn is_running(&self) -> bool {
        self.status == EngineStatus::Running
    }

    pub fn is_prepared(&self) -> bool {
        self.prepared
    }

    pub fn is_finite_length(&self) -> bool {
        self.csetup.length_in_samples().is_some()
    }

    pub fn buffersize(&self) -> usize {
        self.buffersize
    }

    pub fn sample_rate(&self) -> u32 {
        self.csetup.sample_rate()
    }

    pub fn current_position_in_samples(&self) -> u64 {
        self.csetup.position_in_samples()
    }

    pub fn length_in_samples(&self) -> Option<u64> {
        self.csetup.length_in_samples()
    }

    /// Handle for submitting commands from other threads
    pub fn command_sender(&self) -> CommandSender {
        self.command_tx.clone()
    }

    /// Cancellation flag; setting it makes the processing loop exit
    /// cleanly at the next block boundary
    pub fn exit_flag(&self) -> Arc<AtomicBool> {
        Arc::clone(&self.exit_request)
    }

    /// Attach a raw MIDI stream; the engine polls it once per block
    #[cfg(feature = "midi")]
    pub fn attach_midi_input(&mut self, midi: crate::midi::RawMidiInput) {
        self.midi = Some(midi);
    }

    /// Latest value of a MIDI controller (normalized), if one is seen
    #[cfg(feature = "midi")]
    pub fn midi_controller_value(&self, channel: u8, controller: u8) -> Option<f64> {
        self.midi.as_ref().and_then(|m| m.controller_value(channel, controller))
    }

    /// Block until the engine leaves the Running state
    pub fn wait_for_stop(&self, timeout: Duration) {
        let (lock, cvar) = &*self.stop_notify;
        let guard = lock.lock().expect("stop notify lock");
        let _ = cvar.wait_timeout(guard, timeout);
    }

    // --- transport -----------------------------------------------------

    /// Arm realtime devices without starting their clocks
    pub fn prepare_operation(&mut self) -> EngineResult<()> {
        if self.prepared {
            return Ok(());
        }
        if self.csetup.raised_priority() {
            crate::rt::acquire_realtime(self.csetup.sched_priority());
        }
        let to_arm: Vec<(bool, usize)> = self
            .realtime_inputs
            .iter()
            .map(|&i| (true, i))
            .chain(self.realtime_outputs.iter().map(|&o| (false, o)))
            .collect();
        let mut armed: Vec<(bool, usize)> = Vec::new();
        for (is_input, idx) in to_arm {
            let ep = if is_input { &mut self.inputs[idx] } else { &mut self.outputs[idx] };
            if let Some(dev) = ep.as_device() {
                if let Err(e) = dev.prepare() {
                    self.rollback_devices(&armed);
                    return Err(e);
                }
            }
            armed.push((is_input, idx));
        }
        self.prepared = true;
        Ok(())
    }

    /// Stop already-armed devices in reverse order after a start failure
    fn rollback_devices(&mut self, armed: &[(bool, usize)]) {
        for &(is_input, idx) in armed.iter().rev() {
            let ep = if is_input { &mut self.inputs[idx] } else { &mut self.outputs[idx] };
            if let Some(dev) = ep.as_device() {
                let _ = dev.stop();
            }
        }
        if self.csetup.raised_priority() {
            crate::rt::release_realtime();
        }
        self.prepared = false;
        self.status = EngineStatus::Stopped;
    }

    /// Start processing. Performs multitrack sync or schedules the
    /// output trigger, then marks the engine Running.
    pub fn start(&mut self) -> EngineResult<()> {
        if self.status == EngineStatus::Running {
            return Ok(());
        }
        log::debug!("engine start");
        self.prepare_operation()?;
        self.start_operation()
    }

    /// Second phase of starting; requires `prepare_operation`
    pub fn start_operation(&mut self) -> EngineResult<()> {
        if self.status == EngineStatus::Running {
            return Ok(());
        }
        debug_assert!(self.prepared);

        if self.multitrack_mode {
            self.multitrack_input_stamp = None;
            self.start_devices(true)?;
            log::debug!("multitrack sync");
            self.multitrack_sync()?;
            self.multitrack_sync()?;
            self.start_devices(false)?;

            // elapsed time since the first warm-up block's input read,
            // in samples; monotonic clock so NTP can never produce a
            // negative fix
            let stamp = self
                .multitrack_input_stamp
                .ok_or_else(|| EngineError::Runtime("multitrack sync ran no iterations".into()))?;
            let sync_fix =
                (stamp.elapsed().as_secs_f64() * f64::from(self.csetup.sample_rate())) as u64;
            log::debug!("multitrack sync fix: {} samples", sync_fix);
            for idx in 0..self.non_realtime_outputs.len() {
                let o = self.non_realtime_outputs[idx];
                let pos = self.outputs[o].position_in_samples();
                self.outputs[o].seek(pos + sync_fix)?;
            }
        } else {
            self.start_devices(true)?;
            self.trigger_outputs_request = true;
            self.trigger_counter = 0;
        }

        self.rt_running = true;
        self.status = EngineStatus::Running;
        Ok(())
    }

    /// Start realtime inputs (`true`) or outputs (`false`), rolling back
    /// on failure
    fn start_devices(&mut self, inputs: bool) -> EngineResult<()> {
        let ids: Vec<usize> = if inputs {
            self.realtime_inputs.clone()
        } else {
            self.realtime_outputs.clone()
        };
        let mut started: Vec<(bool, usize)> = Vec::new();
        for idx in ids {
            let ep = if inputs { &mut self.inputs[idx] } else { &mut self.outputs[idx] };
            if let Some(dev) = ep.as_device() {
                if let Err(e) = dev.start() {
                    self.rollback_devices(&started);
                    return Err(e);
                }
            }
            started.push((inputs, idx));
        }
        Ok(())
    }

    /// Stop processing: halt realtime clocks, drop realtime scheduling,
    /// broadcast the stop condition
    pub fn stop_operation(&mut self) {
        if self.status != EngineStatus::Running && !self.rt_running {
            return;
        }
        log::debug!("engine stop");
        if self.rt_running {
            for idx in 0..self.inputs.len() {
                if let Some(dev) = self.inputs[idx].as_device() {
                    let _ = dev.stop();
                }
            }
            for idx in 0..self.outputs.len() {
                if let Some(dev) = self.outputs[idx].as_device() {
                    let _ = dev.stop();
                }
            }
        }
        self.rt_running = false;
        self.prepared = false;
        self.trigger_outputs_request = false;
        self.trigger_counter = 0;
        if self.csetup.raised_priority() {
            crate::rt::release_realtime();
        }
        if self.status == EngineStatus::Running {
            self.status = EngineStatus::Stopped;
        }
        let (lock, cvar) = &*self.stop_notify;
        *lock.lock().expect("stop notify lock") = true;
        cvar.notify_all();
    }

    // --- blocking run --------------------------------------------------

    /// Drive the engine on the calling thread
    ///
    /// In batch mode the engine starts immediately and the call returns
    /// once processing finishes; otherwise it runs until an `Exit`
    /// command or the exit flag. Cancellation is a clean, successful
    /// exit; device and runtime failures are errors.
    pub fn exec(&mut self, batch_mode: bool) -> EngineResult<()> {
        self.prefill();

        if batch_mode {
            self.start()?;
        }

        let result = loop {
            self.check_command_queue();
            if self.end_request {
                break Ok(());
            }
            if self.exit_request.load(Ordering::Acquire) {
                log::info!("exit requested; stopping engine");
                break Ok(());
            }
            if self.status != EngineStatus::Running {
                if batch_mode && self.status == EngineStatus::Finished {
                    break Ok(());
                }
                std::thread::sleep(CONTROL_SLEEP);
                continue;
            }
            if let Err(e) = self.engine_iteration() {
                break Err(e);
            }
            if batch_mode && self.status == EngineStatus::Finished {
                break Ok(());
            }
        };

        self.stop_operation();
        result
    }

    /// Drain the command queue; called between iterations and, in
    /// callback mode, by the engine thread under the modification mutex
    pub fn check_command_queue(&mut self) {
        while let Some(cmd) = self.commands.as_ref().and_then(|rx| rx.try_recv()) {
            self.dispatch_command(cmd);
            if self.end_request {
                // flush the remainder; exit supersedes everything
                while self.commands.as_ref().and_then(|rx| rx.try_recv()).is_some() {}
                return;
            }
        }
    }

    /// Apply one command; used by callback drivers that hold the
    /// receiver themselves and dispatch under the modification mutex
    pub fn handle_command(&mut self, cmd: EngineCommand) {
        self.dispatch_command(cmd);
    }

    /// Detach the command receiver so a driver's engine thread can park
    /// on it directly
    pub fn take_command_receiver(&mut self) -> Option<CommandReceiver> {
        self.commands.take()
    }

    /// True after an `Exit` command
    pub fn end_requested(&self) -> bool {
        self.end_request
    }

    /// Start the proxy server (if any) and block until its read rings
    /// are prefilled; callback drivers call this before activation
    pub fn prefill(&mut self) {
        if let Some(server) = self.pserver.as_mut() {
            server.start();
            log::info!("prefilling i/o buffers");
            server.wait_for_full();
        }
    }

    fn dispatch_command(&mut self, cmd: EngineCommand) {
        match cmd {
            EngineCommand::Start => {
                if let Err(e) = self.start() {
                    log::error!("start failed: {}", e);
                    self.stop_operation();
                }
            }
            EngineCommand::Stop => self.stop_operation(),
            EngineCommand::Prepare => {
                if let Err(e) = self.prepare_operation() {
                    log::error!("prepare failed: {}", e);
                }
            }
            EngineCommand::Exit => {
                log::debug!("exit command received");
                self.stop_operation();
                self.end_request = true;
            }
            EngineCommand::ChainSelect(i) => {
                if i < self.chains.len() {
                    self.active_chain = i;
                }
            }
            EngineCommand::ChainMute => self.chains[self.active_chain].toggle_muted(),
            EngineCommand::ChainBypass => self.chains[self.active_chain].toggle_bypassed(),
            EngineCommand::ChainRewind(secs) => self.change_position_chain(-secs),
            EngineCommand::ChainForward(secs) => self.change_position_chain(secs),
            EngineCommand::ChainSetPos(secs) => self.set_position_chain(secs),
            EngineCommand::OpSelect(i) => self.active_op = i,
            EngineCommand::ParamSelect(i) => self.active_param = i,
            EngineCommand::ParamSet(v) => {
                self.chains[self.active_chain].set_parameter(self.active_op, self.active_param, v)
            }
            EngineCommand::Rewind(secs) => self.change_position(-secs),
            EngineCommand::Forward(secs) => self.change_position(secs),
            EngineCommand::SetPos(secs) => self.set_position(secs),
            EngineCommand::SetPosLiveSamples(samples) => self.set_position_live(samples),
        }
    }

    // --- repositioning -------------------------------------------------

    fn conditional_stop(&mut self) {
        if self.status == EngineStatus::Running {
            self.was_running = true;
            self.stop_operation();
        } else {
            self.was_running = false;
        }
    }

    fn conditional_start(&mut self) {
        if self.was_running {
            if let Some(server) = self.pserver.as_ref() {
                server.wait_for_full();
            }
            if let Err(e) = self.start() {
                log::error!("restart after reposition failed: {}", e);
            }
        }
    }

    /// Absolute global seek, in seconds
    pub fn set_position(&mut self, seconds: f64) {
        let samples = (seconds.max(0.0) * f64::from(self.csetup.sample_rate())) as u64;
        self.conditional_stop();
        self.seek_non_realtime(samples);
        self.conditional_start();
    }

    /// Relative global seek, in seconds
    pub fn change_position(&mut self, seconds: f64) {
        let rate = f64::from(self.csetup.sample_rate());
        let current = self.csetup.position_in_samples() as f64 / rate;
        self.set_position(current + seconds);
    }

    /// Absolute seek in samples without a stop/start cycle; used by the
    /// timebase-slave driver, which owns transport state itself
    pub fn set_position_live(&mut self, samples: u64) {
        self.seek_non_realtime(samples);
    }

    fn seek_non_realtime(&mut self, samples: u64) {
        self.csetup.set_position(samples);
        for idx in 0..self.non_realtime_inputs.len() {
            let i = self.non_realtime_inputs[idx];
            if let Err(e) = self.inputs[i].seek(samples) {
                log::warn!("seek on '{}' failed: {}", self.inputs[i].label(), e);
            }
            self.input_failed[i] = false;
        }
        for idx in 0..self.non_realtime_outputs.len() {
            let o = self.non_realtime_outputs[idx];
            if let Err(e) = self.outputs[o].seek(samples) {
                log::warn!("seek on '{}' failed: {}", self.outputs[o].label(), e);
            }
        }
        if self.status == EngineStatus::Finished {
            self.status = EngineStatus::Stopped;
        }
        self.input_not_finished = true;
    }

    /// Seek only the selected chain's endpoints, in seconds. Proxied
    /// endpoints forward the seek to the server thread, so this works
    /// under double-buffering.
    pub fn set_position_chain(&mut self, seconds: f64) {
        let samples = (seconds.max(0.0) * f64::from(self.csetup.sample_rate())) as u64;
        self.conditional_stop();
        let chain = &self.chains[self.active_chain];
        let (i, o) = (chain.input_id, chain.output_id);
        if !self.inputs[i].is_realtime() {
            if let Err(e) = self.inputs[i].seek(samples) {
                log::warn!("chain seek on '{}' failed: {}", self.inputs[i].label(), e);
            }
            self.input_failed[i] = false;
        }
        if !self.outputs[o].is_realtime() {
            if let Err(e) = self.outputs[o].seek(samples) {
                log::warn!("chain seek on '{}' failed: {}", self.outputs[o].label(), e);
            }
        }
        self.conditional_start();
    }

    /// Move the selected chain's endpoints by `seconds`
    pub fn change_position_chain(&mut self, seconds: f64) {
        let rate = f64::from(self.csetup.sample_rate());
        let chain = &self.chains[self.active_chain];
        let current = self.inputs[chain.input_id].position_in_samples() as f64 / rate;
        self.set_position_chain(current + seconds);
    }

    /// Rewind every input to the position recorded at connect time.
    /// Outputs keep their positions: a looped run appends lap after lap
    /// to its sinks instead of overwriting the first one.
    fn rewind_to_start_position(&mut self) {
        for i in 0..self.inputs.len() {
            let start = self.input_start_pos[i];
            if self.inputs[i].is_realtime() {
                continue;
            }
            if let Err(e) = self.inputs[i].seek(start) {
                log::warn!("rewind on '{}' failed: {}", self.inputs[i].label(), e);
            }
            self.input_failed[i] = false;
        }
    }

    // --- the block loop ------------------------------------------------

    /// Run exactly one block through the graph
    ///
    /// Callable from the blocking loop or from a callback driver; the
    /// caller guarantees exclusive access to the engine.
    pub fn engine_iteration(&mut self) -> EngineResult<()> {
        #[cfg(feature = "midi")]
        if let Some(midi) = self.midi.as_mut() {
            midi.poll();
        }
        let block = self.prehandle_control_position();

        self.input_not_finished = false;
        self.inputs_to_chains(block);

        match self.mixmode {
            MixMode::Simple => {
                self.chains[0].process(&mut self.work_slots[0]);
                self.write_output(0, 0)?;
            }
            _ => {
                for (chain, slot) in self.chains.iter_mut().zip(self.work_slots.iter_mut()) {
                    chain.process(slot);
                }
                self.mix_to_outputs(false)?;
            }
        }

        self.trigger_outputs()?;
        self.posthandle_control_position();
        self.update_finished_state();
        Ok(())
    }

    /// Advance the transport and clamp the final block to the processing
    /// range; returns the frame count for this iteration's reads
    fn prehandle_control_position(&mut self) -> usize {
        self.csetup.advance_position(self.buffersize);
        if self.processing_range_set && self.csetup.is_over() {
            let length = self.csetup.length_in_samples().unwrap_or(0);
            let excess = (self.csetup.position_in_samples() - length) as usize;
            self.buffersize.saturating_sub(excess).min(self.buffersize)
        } else {
            self.buffersize
        }
    }

    /// Loop or finish once the position passes an explicit length
    fn posthandle_control_position(&mut self) {
        if !(self.processing_range_set && self.csetup.is_over()) {
            return;
        }
        if self.csetup.looping() {
            log::debug!("processing range over; looping back to start");
            self.rewind_to_start_position();
            self.csetup.set_position(0);
        } else {
            log::debug!("processing range over; finishing");
            self.stop_operation();
            self.csetup.set_position(0);
            self.status = EngineStatus::Finished;
        }
    }

    fn update_finished_state(&mut self) {
        if !self.input_not_finished && self.status == EngineStatus::Running {
            log::info!("all inputs finished");
            self.stop_operation();
            self.status = EngineStatus::Finished;
        }
    }

    /// Read every input into the work slots of its chains
    fn inputs_to_chains(&mut self, block: usize) {
        for i in 0..self.inputs.len() {
            if self.input_failed[i] {
                for c in 0..self.chains.len() {
                    if self.chains[c].input_id == i {
                        self.work_slots[c].set_frames(block);
                        self.work_slots[c].make_silent();
                    }
                }
                continue;
            }

            if self.input_chain_count[i] > 1 {
                // shared input: read once into the mix slot, fan out
                self.mixslot.set_channels(self.inputs[i].channels());
                self.mixslot.set_frames(block);
                if let Err(e) = self.inputs[i].read(&mut self.mixslot) {
                    self.downgrade_input_error(i, &e);
                    self.mixslot.set_frames(block);
                    self.mixslot.make_silent();
                }
                if !self.inputs[i].finished() {
                    self.input_not_finished = true;
                }
                for c in 0..self.chains.len() {
                    if self.chains[c].input_id == i {
                        self.work_slots[c].set_channels(self.mixslot.channels());
                        self.work_slots[c].copy_from(&self.mixslot);
                    }
                }
                self.mixslot.set_frames(self.buffersize);
            } else {
                for c in 0..self.chains.len() {
                    if self.chains[c].input_id == i {
                        self.work_slots[c].set_frames(block);
                        if let Err(e) = self.inputs[i].read(&mut self.work_slots[c]) {
                            self.downgrade_input_error(i, &e);
                            self.work_slots[c].set_frames(block);
                            self.work_slots[c].make_silent();
                        }
                        if !self.inputs[i].finished() {
                            self.input_not_finished = true;
                        }
                        break;
                    }
                }
            }
        }
    }

    /// A device error on read becomes end-of-stream for that endpoint
    fn downgrade_input_error(&mut self, i: usize, e: &EngineError) {
        log::error!(
            "read error on '{}' (treating as end of stream): {}",
            self.inputs[i].label(),
            e
        );
        self.input_failed[i] = true;
    }

    /// Mix the work slots into every output with equal `1/k` weights
    ///
    /// With `warmup` set, only slave outputs are written (multitrack
    /// warm-up iterations).
    fn mix_to_outputs(&mut self, warmup: bool) -> EngineResult<()> {
        for o in 0..self.outputs.len() {
            if warmup && !self.slave_outputs[o] {
                continue;
            }
            if self.output_failed[o] {
                continue;
            }
            let k = self.output_chain_count[o];
            if k == 0 {
                continue;
            }
            self.mixslot.set_channels(self.outputs[o].channels());
            let mut count = 0;
            for c in 0..self.chains.len() {
                if self.chains[c].output_id != o {
                    continue;
                }
                if k == 1 {
                    self.write_output(o, c)?;
                    break;
                }
                count += 1;
                if count == 1 {
                    self.mixslot.copy_from(&self.work_slots[c]);
                    self.mixslot.divide_by(k);
                } else {
                    self.mixslot.add_with_weight(&self.work_slots[c], k);
                }
                if count == k {
                    if let Err(e) = self.outputs[o].write(&self.mixslot) {
                        self.downgrade_output_error(o, &e);
                    }
                    self.mixslot.set_frames(self.buffersize);
                }
            }
        }
        Ok(())
    }

    /// Write one chain's slot straight to its output and restore the
    /// slot's block length
    fn write_output(&mut self, o: usize, c: usize) -> EngineResult<()> {
        if !self.output_failed[o] {
            if let Err(e) = self.outputs[o].write(&self.work_slots[c]) {
                self.downgrade_output_error(o, &e);
            }
        }
        self.work_slots[c].set_frames(self.buffersize);
        Ok(())
    }

    fn downgrade_output_error(&mut self, o: usize, e: &EngineError) {
        log::error!(
            "write error on '{}' (output disabled): {}",
            self.outputs[o].label(),
            e
        );
        self.output_failed[o] = true;
    }

    /// Deferred realtime-output start: two completed iterations fill the
    /// device's first buffer before its clock begins
    fn trigger_outputs(&mut self) -> EngineResult<()> {
        if !self.trigger_outputs_request {
            return Ok(());
        }
        self.trigger_counter += 1;
        if self.trigger_counter == OUTPUT_TRIGGER_ITERATIONS {
            self.trigger_outputs_request = false;
            self.trigger_counter = 0;
            self.start_devices(false)?;
            self.rt_running = true;
        }
        Ok(())
    }

    /// One multitrack warm-up iteration: read and process a block, but
    /// write only to slave outputs so live input and monitored playback
    /// can be aligned before realtime outputs start
    fn multitrack_sync(&mut self) -> EngineResult<()> {
        self.input_not_finished = false;
        self.inputs_to_chains(self.buffersize);
        if self.multitrack_input_stamp.is_none() {
            self.multitrack_input_stamp = Some(Instant::now());
        }
        for (chain, slot) in self.chains.iter_mut().zip(self.work_slots.iter_mut()) {
            chain.process(slot);
        }
        self.mix_to_outputs(true)
    }

    // --- teardown ------------------------------------------------------

    /// Orderly shutdown: stop the transport, release chain bindings,
    /// stop the proxy server, close endpoints in reverse creation order
    pub fn disconnect(&mut self) {
        if self.disconnected {
            return;
        }
        self.disconnected = true;
        self.stop_operation();
        for chain in &mut self.chains {
            chain.release();
        }
        for o in (0..self.outputs.len()).rev() {
            if let Err(e) = self.outputs[o].close() {
                log::error!("close of '{}' failed: {}", self.outputs[o].label(), e);
            }
        }
        for i in (0..self.inputs.len()).rev() {
            if let Err(e) = self.inputs[i].close() {
                log::error!("close of '{}' failed: {}", self.inputs[i].label(), e);
            }
        }
        if let Some(server) = self.pserver.as_mut() {
            if let Err(e) = server.shutdown() {
                log::error!("proxy server shutdown failed: {}", e);
            }
        }
        self.status = EngineStatus::NotReady;
        log::debug!("engine disconnected");
    }
}

impl Drop for Engine {
    fn drop(&mut self) {
        self.disconnect();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::chain::{Chain, GainProcessor};
    use crate::chainsetup::ChainSetup;
    use crate::endpoint::null::{NullSink, NullSource};
    use crate::endpoint::{IoMode, RealtimeDevice};
    use crate::types::{Sample, SAMPLE_RATE};
    use std::sync::atomic::AtomicUsize;

    /// A realtime device stub: reads a constant, counts clock edges
    struct FakeDevice {
        label: String,
        io_mode: IoMode,
        channels: usize,
        value: Sample,
        running: Arc<AtomicBool>,
        starts: Arc<AtomicUsize>,
        frames_written: Arc<AtomicUsize>,
        position: u64,
    }

    impl FakeDevice {
        fn source(value: Sample) -> Self {
            Self::new(IoMode::Read, value)
        }

        fn sink() -> Self {
            Self::new(IoMode::Write, 0.0)
        }

        fn new(io_mode: IoMode, value: Sample) -> Self {
            Self {
                label: "fake-device".to_string(),
                io_mode,
                channels: 1,
                value,
                running: Arc::new(AtomicBool::new(false)),
                starts: Arc::new(AtomicUsize::new(0)),
                frames_written: Arc::new(AtomicUsize::new(0)),
                position: 0,
            }
        }

        fn running_handle(&self) -> Arc<AtomicBool> {
            Arc::clone(&self.running)
        }

        fn starts_handle(&self) -> Arc<AtomicUsize> {
            Arc::clone(&self.starts)
        }
    }

    impl AudioEndpoint for FakeDevice {
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
            SAMPLE_RATE
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
            for ch in 0..self.channels {
                buf.channel_mut(ch).fill(self.value);
            }
            self.position += buf.frames() as u64;
            Ok(())
        }
        fn write(&mut self, buf: &SampleBuffer) -> EngineResult<()> {
            self.frames_written
                .fetch_add(buf.frames(), Ordering::Relaxed);
            self.position += buf.frames() as u64;
            Ok(())
        }
        fn seek(&mut self, frame: u64) -> EngineResult<()> {
            if frame != self.position {
                return Err(EngineError::device(&self.label, "device seek"));
            }
            Ok(())
        }
        fn set_buffersize(&mut self, _frames: usize, _rate: u32) {}
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

    impl RealtimeDevice for FakeDevice {
        fn prepare(&mut self) -> EngineResult<()> {
            Ok(())
        }
        fn start(&mut self) -> EngineResult<()> {
            self.running.store(true, Ordering::SeqCst);
            self.starts.fetch_add(1, Ordering::SeqCst);
            Ok(())
        }
        fn stop(&mut self) -> EngineResult<()> {
            self.running.store(false, Ordering::SeqCst);
            Ok(())
        }
        fn is_running(&self) -> bool {
            self.running.load(Ordering::SeqCst)
        }
    }

    /// A file-like sink that records every sample it receives
    struct CaptureSink {
        label: String,
        samples: Arc<Mutex<Vec<Sample>>>,
        position: u64,
    }

    impl CaptureSink {
        fn new() -> (Self, Arc<Mutex<Vec<Sample>>>) {
            let samples = Arc::new(Mutex::new(Vec::new()));
            (
                Self {
                    label: "capture".to_string(),
                    samples: Arc::clone(&samples),
                    position: 0,
                },
                samples,
            )
        }
    }

    impl AudioEndpoint for CaptureSink {
        fn label(&self) -> &str {
            &self.label
        }
        fn io_mode(&self) -> IoMode {
            IoMode::Write
        }
        fn channels(&self) -> usize {
            1
        }
        fn sample_rate(&self) -> u32 {
            SAMPLE_RATE
        }
        fn length_in_samples(&self) -> Option<u64> {
            Some(self.position)
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
            Err(EngineError::device(&self.label, "read on sink"))
        }
        fn write(&mut self, buf: &SampleBuffer) -> EngineResult<()> {
            self.samples
                .lock()
                .unwrap()
                .extend_from_slice(buf.channel(0));
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

    /// A finite source producing a known ramp
    struct RampSource {
        label: String,
        total: u64,
        position: u64,
        finished: bool,
    }

    impl RampSource {
        fn new(total: u64) -> Self {
            Self {
                label: "ramp".to_string(),
                total,
                position: 0,
                finished: false,
            }
        }
    }

    impl AudioEndpoint for RampSource {
        fn label(&self) -> &str {
            &self.label
        }
        fn io_mode(&self) -> IoMode {
            IoMode::Read
        }
        fn channels(&self) -> usize {
            1
        }
        fn sample_rate(&self) -> u32 {
            SAMPLE_RATE
        }
        fn length_in_samples(&self) -> Option<u64> {
            Some(self.total)
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
            let wanted = buf.frames();
            let take = wanted.min(self.total.saturating_sub(self.position) as usize);
            buf.set_channels(1);
            buf.set_frames(take);
            for (i, s) in buf.channel_mut(0).iter_mut().enumerate() {
                *s = (self.position as usize + i) as Sample;
            }
            self.position += take as u64;
            if take < wanted {
                self.finished = true;
            }
            Ok(())
        }
        fn write(&mut self, _buf: &SampleBuffer) -> EngineResult<()> {
            Err(EngineError::device(&self.label, "write on source"))
        }
        fn seek(&mut self, frame: u64) -> EngineResult<()> {
            self.position = frame.min(self.total);
            self.finished = false;
            Ok(())
        }
        fn set_buffersize(&mut self, _frames: usize, _rate: u32) {}
        fn finished(&self) -> bool {
            self.finished
        }
    }

    #[test]
    fn test_connect_rejects_invalid_setup() {
        let cs = ChainSetup::new("empty");
        assert!(matches!(Engine::connect(cs), Err(EngineError::Setup(_))));
    }

    #[test]
    fn test_simple_passthrough_finishes_with_identical_samples() {
        let mut cs = ChainSetup::new("passthrough");
        cs.set_buffersize(64);
        let i = cs.add_input(Box::new(RampSource::new(300)));
        let (sink, captured) = CaptureSink::new();
        let o = cs.add_output(Box::new(sink));
        cs.add_chain(Chain::new("c1", i, o));

        let mut engine = Engine::connect(cs).unwrap();
        assert_eq!(engine.status(), EngineStatus::Stopped);
        engine.exec(true).unwrap();
        assert_eq!(engine.status(), EngineStatus::Finished);

        let captured = captured.lock().unwrap();
        assert_eq!(captured.len(), 300);
        for (i, &s) in captured.iter().enumerate() {
            assert_eq!(s, i as Sample);
        }
    }

    #[test]
    fn test_two_chain_mix_halves_each_contribution() {
        // input A silent, input B at 0.8; both chains feed one sink:
        // every output sample must be B/2
        let mut cs = ChainSetup::new("mix");
        cs.set_buffersize(32);
        cs.set_length_in_samples(128);
        let a = cs.add_input(Box::new(NullSource::new(1, SAMPLE_RATE)));
        let b = cs.add_input(Box::new(FakeDeviceless::new(0.8)));
        let (sink, captured) = CaptureSink::new();
        let o = cs.add_output(Box::new(sink));
        cs.add_chain(Chain::new("ca", a, o));
        cs.add_chain(Chain::new("cb", b, o));

        let mut engine = Engine::connect(cs).unwrap();
        engine.exec(true).unwrap();

        let captured = captured.lock().unwrap();
        assert_eq!(captured.len(), 128);
        for &s in captured.iter() {
            assert!((s - 0.4).abs() < 1e-6);
        }
    }

    /// Infinite non-realtime source of a constant value
    struct FakeDeviceless {
        value: Sample,
        position: u64,
    }

    impl FakeDeviceless {
        fn new(value: Sample) -> Self {
            Self { value, position: 0 }
        }
    }

    impl AudioEndpoint for FakeDeviceless {
        fn label(&self) -> &str {
            "constant"
        }
        fn io_mode(&self) -> IoMode {
            IoMode::Read
        }
        fn channels(&self) -> usize {
            1
        }
        fn sample_rate(&self) -> u32 {
            SAMPLE_RATE
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
            buf.set_channels(1);
            buf.channel_mut(0).fill(self.value);
            self.position += buf.frames() as u64;
            Ok(())
        }
        fn write(&mut self, _buf: &SampleBuffer) -> EngineResult<()> {
            Err(EngineError::device("constant", "write on source"))
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

    #[test]
    fn test_explicit_length_without_looping_finishes() {
        let mut cs = ChainSetup::new("finite");
        cs.set_buffersize(50);
        cs.set_length_in_samples(120);
        let i = cs.add_input(Box::new(NullSource::new(1, SAMPLE_RATE)));
        let (sink, captured) = CaptureSink::new();
        let o = cs.add_output(Box::new(sink));
        cs.add_chain(Chain::new("c1", i, o));

        let mut engine = Engine::connect(cs).unwrap();
        engine.exec(true).unwrap();
        assert_eq!(engine.status(), EngineStatus::Finished);

        // 50 + 50 + 20: the final block shrinks to the remaining range
        assert_eq!(captured.lock().unwrap().len(), 120);
    }

    #[test]
    fn test_looping_rewinds_and_never_finishes() {
        let mut cs = ChainSetup::new("looped");
        cs.set_buffersize(32);
        cs.set_length_in_samples(64);
        cs.set_looping(true);
        let i = cs.add_input(Box::new(RampSource::new(256)));
        let (sink, captured) = CaptureSink::new();
        let o = cs.add_output(Box::new(sink));
        cs.add_chain(Chain::new("c1", i, o));

        let mut engine = Engine::connect(cs).unwrap();
        engine.start().unwrap();
        for _ in 0..8 {
            engine.engine_iteration().unwrap();
        }
        assert_eq!(engine.status(), EngineStatus::Running);

        let captured = captured.lock().unwrap();
        assert_eq!(captured.len(), 8 * 32);
        // four laps over the first 64 samples of the ramp
        for lap in 0..4 {
            let lap_data = &captured[lap * 64..(lap + 1) * 64];
            assert_eq!(lap_data, &captured[..64]);
        }
    }

    #[test]
    fn test_parameter_command_applies_at_block_boundary() {
        let mut cs = ChainSetup::new("params");
        cs.set_buffersize(16);
        let i = cs.add_input(Box::new(FakeDeviceless::new(0.5)));
        let (sink, captured) = CaptureSink::new();
        let o = cs.add_output(Box::new(sink));
        let mut chain = Chain::new("c1", i, o);
        chain.push_processor(Box::new(GainProcessor::new(1.0)));
        cs.add_chain(chain);

        let mut engine = Engine::connect(cs).unwrap();
        let tx = engine.command_sender();
        engine.start().unwrap();
        engine.engine_iteration().unwrap();

        tx.send(EngineCommand::ChainSelect(0));
        tx.send(EngineCommand::OpSelect(0));
        tx.send(EngineCommand::ParamSelect(0));
        tx.send(EngineCommand::ParamSet(2.0));
        engine.check_command_queue();
        engine.engine_iteration().unwrap();

        let captured = captured.lock().unwrap();
        assert!((captured[0] - 0.5).abs() < 1e-6);
        assert!((captured[16] - 1.0).abs() < 1e-6);
    }

    #[test]
    fn test_trigger_outputs_start_after_two_iterations() {
        let mut cs = ChainSetup::new("trigger");
        cs.set_buffersize(16);
        let i = cs.add_input(Box::new(FakeDeviceless::new(0.1)));
        let dev = FakeDevice::sink();
        let running = dev.running_handle();
        let o = cs.add_output(Box::new(dev));
        cs.add_chain(Chain::new("c1", i, o));

        let mut engine = Engine::connect(cs).unwrap();
        engine.start().unwrap();
        assert!(!running.load(Ordering::SeqCst));
        engine.engine_iteration().unwrap();
        assert!(!running.load(Ordering::SeqCst));
        engine.engine_iteration().unwrap();
        assert!(running.load(Ordering::SeqCst));

        engine.stop_operation();
        assert!(!running.load(Ordering::SeqCst));
    }

    #[test]
    fn test_multitrack_sync_writes_only_slave_outputs() {
        // live input -> file sink (slave), file input -> live output
        let mut cs = ChainSetup::new("multitrack");
        cs.set_buffersize(16);
        let live_in = FakeDevice::source(0.5);
        let live_in_starts = live_in.starts_handle();
        let i_live = cs.add_input(Box::new(live_in));
        let i_file = cs.add_input(Box::new(FakeDeviceless::new(0.2)));
        let (file_sink, recorded) = CaptureSink::new();
        let o_file = cs.add_output(Box::new(file_sink));
        let live_out = FakeDevice::sink();
        let live_out_starts = live_out.starts_handle();
        let o_live = cs.add_output(Box::new(live_out));
        cs.add_chain(Chain::new("record", i_live, o_file));
        cs.add_chain(Chain::new("monitor", i_file, o_live));

        let mut engine = Engine::connect(cs).unwrap();
        assert!(engine.multitrack_mode);
        engine.start().unwrap();

        // warm-up ran two blocks into the slave output only
        assert_eq!(recorded.lock().unwrap().len(), 32);
        assert_eq!(live_in_starts.load(Ordering::SeqCst), 1);
        assert_eq!(live_out_starts.load(Ordering::SeqCst), 1);
        engine.stop_operation();
    }

    #[test]
    fn test_exit_flag_interrupts_run() {
        let mut cs = ChainSetup::new("interrupt");
        cs.set_buffersize(256);
        let i = cs.add_input(Box::new(NullSource::new(1, SAMPLE_RATE)));
        let o = cs.add_output(Box::new(NullSink::new(1, SAMPLE_RATE)));
        cs.add_chain(Chain::new("c1", i, o));

        let mut engine = Engine::connect(cs).unwrap();
        let exit = engine.exit_flag();
        let handle = std::thread::spawn(move || {
            std::thread::sleep(Duration::from_millis(20));
            exit.store(true, Ordering::Release);
        });
        // infinite inputs: only the exit flag can end this run
        engine.exec(true).unwrap();
        handle.join().unwrap();
        engine.disconnect();
        assert_eq!(engine.status(), EngineStatus::NotReady);
    }
}
