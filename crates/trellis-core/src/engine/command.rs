//! Transport and parameter commands for the running engine
//!
//! Control threads (interactive front end, callback driver, watchdog)
//! send commands through an MPSC channel; the engine drains it at block
//! boundaries only. A command submitted before iteration N's boundary
//! takes effect at or before iteration N+1 begins. Parameter changes are
//! not sample-accurate within a block - they apply to the next full
//! block.
//!
//! The channel is lock-tolerant by design: senders may be momentarily
//! contended, which is acceptable everywhere commands originate (the
//! callback driver submits from its process callback, but `send` on an
//! unbounded channel never blocks on the consumer).

use std::sync::mpsc;

/// One engine command
///
/// Each variant carries at most one numeric argument. Positions are in
/// seconds except [`EngineCommand::SetPosLiveSamples`], which is in
/// samples and repositions without a stop/start cycle (used by the
/// timebase-slave driver).
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum EngineCommand {
    // transport
    Start,
    Stop,
    /// Arm realtime devices without starting their clocks
    Prepare,
    /// Stop and leave the processing loop
    Exit,

    // chain addressing and toggles
    /// Select the chain subsequent chain commands address
    ChainSelect(usize),
    /// Toggle mute on the selected chain
    ChainMute,
    /// Toggle processor bypass on the selected chain
    ChainBypass,
    /// Move the selected chain's endpoints back by seconds
    ChainRewind(f64),
    /// Move the selected chain's endpoints forward by seconds
    ChainForward(f64),
    /// Position the selected chain's endpoints absolutely, in seconds
    ChainSetPos(f64),

    // processor parameters
    /// Select a processor on the selected chain
    OpSelect(usize),
    /// Select a parameter on the selected processor
    ParamSelect(usize),
    /// Write the selected parameter
    ParamSet(f64),

    // global position
    Rewind(f64),
    Forward(f64),
    SetPos(f64),
    /// Absolute seek in samples, without stopping the transport
    SetPosLiveSamples(u64),
}

/// Send side of the command channel; clone freely across threads
#[derive(Clone)]
pub struct CommandSender {
    tx: mpsc::Sender<EngineCommand>,
}

impl CommandSender {
    /// Queue a command; a dead engine just drops it
    pub fn send(&self, cmd: EngineCommand) {
        if self.tx.send(cmd).is_err() {
            log::debug!("command {:?} dropped: engine gone", cmd);
        }
    }
}

/// Receive side, owned by the engine
pub struct CommandReceiver {
    rx: mpsc::Receiver<EngineCommand>,
}

impl CommandReceiver {
    /// Non-blocking drain step
    pub fn try_recv(&self) -> Option<EngineCommand> {
        self.rx.try_recv().ok()
    }

    /// Park until a command arrives (callback-mode engine thread);
    /// `None` when every sender is gone
    pub fn recv(&self) -> Option<EngineCommand> {
        self.rx.recv().ok()
    }

    /// Park with a deadline so the waiting thread can also poll exit
    /// and shutdown flags
    pub fn recv_timeout(&self, timeout: std::time::Duration) -> Option<EngineCommand> {
        self.rx.recv_timeout(timeout).ok()
    }
}

/// Create the command channel (many senders, one engine)
pub fn command_channel() -> (CommandSender, CommandReceiver) {
    let (tx, rx) = mpsc::channel();
    (CommandSender { tx }, CommandReceiver { rx })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_commands_arrive_in_order() {
        let (tx, rx) = command_channel();
        tx.send(EngineCommand::ChainSelect(1));
        tx.send(EngineCommand::ChainMute);
        tx.send(EngineCommand::Start);
        assert_eq!(rx.try_recv(), Some(EngineCommand::ChainSelect(1)));
        assert_eq!(rx.try_recv(), Some(EngineCommand::ChainMute));
        assert_eq!(rx.try_recv(), Some(EngineCommand::Start));
        assert_eq!(rx.try_recv(), None);
    }

    #[test]
    fn test_multiple_producers() {
        let (tx, rx) = command_channel();
        let tx2 = tx.clone();
        let t = std::thread::spawn(move || tx2.send(EngineCommand::Stop));
        t.join().unwrap();
        tx.send(EngineCommand::Exit);
        let mut got = Vec::new();
        while let Some(cmd) = rx.try_recv() {
            got.push(cmd);
        }
        assert_eq!(got.len(), 2);
    }
}
