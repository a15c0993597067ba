//! trellis-core - multitrack audio processing engine
//!
//! A chainsetup describes a graph of inputs, processing chains and
//! outputs; the [`engine::Engine`] drives it in fixed-size blocks, either
//! from a blocking loop or one block at a time from a JACK process
//! callback. File endpoints can run behind the [`proxy::ProxyServer`]'s
//! dedicated disk thread so the block cadence never waits on disk.

pub mod chain;
pub mod chainsetup;
pub mod driver;
pub mod endpoint;
pub mod engine;
pub mod error;
#[cfg(feature = "midi")]
pub mod midi;
pub mod proxy;
pub mod rt;
pub mod types;

pub use chainsetup::{ChainSetup, MixMode};
pub use engine::{Engine, EngineCommand, EngineStatus};
pub use error::{EngineError, EngineResult};
pub use types::{Sample, SampleBuffer};
