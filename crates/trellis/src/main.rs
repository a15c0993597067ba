//! trellis - batch front end for the processing engine
//!
//! Runs a file-to-file chainsetup to completion:
//!
//! ```text
//! trellis [options] INPUT.wav OUTPUT.wav
//! ```
//!
//! All termination signals are blocked in every thread and received by a
//! single watchdog thread via sigwait; the watchdog sets the engine's
//! exit flag and nudges it with an Exit command, so a Ctrl-C mid-run is
//! an orderly stop-and-teardown, not an abort.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};

use trellis_core::chain::{Chain, GainProcessor};
use trellis_core::endpoint::wav::{WavSink, WavSource};
use trellis_core::endpoint::AudioEndpoint;
use trellis_core::engine::CommandSender;
use trellis_core::{ChainSetup, Engine, EngineCommand, EngineError};

/// Process exit codes
const RETVAL_SUCCESS: i32 = 0;
const RETVAL_INIT_FAILURE: i32 = 1;
const RETVAL_START_ERROR: i32 = 2;
const RETVAL_RUNTIME_ERROR: i32 = 3;

/// Parsed command line
struct Options {
    input: String,
    output: String,
    buffersize: Option<usize>,
    length_seconds: Option<f64>,
    gain: Option<f64>,
    looping: bool,
    double_buffering: bool,
    raised_priority: bool,
    keep_running: bool,
}

fn print_usage() {
    eprintln!("usage: trellis [options] INPUT.wav OUTPUT.wav");
    eprintln!();
    eprintln!("  -b FRAMES        processing block size (default 1024)");
    eprintln!("  -t SECONDS       explicit processing length");
    eprintln!("  -g GAIN          apply a gain stage (linear)");
    eprintln!("  --loop           loop over the processing range (needs -t)");
    eprintln!("  --double-buffer  run file i/o behind the disk proxy thread");
    eprintln!("  --raise-priority request realtime scheduling while running");
    eprintln!("  -K, --keep-running  do not exit when processing finishes");
}

fn parse_args(args: &[String]) -> Option<Options> {
    let mut opts = Options {
        input: String::new(),
        output: String::new(),
        buffersize: None,
        length_seconds: None,
        gain: None,
        looping: false,
        double_buffering: false,
        raised_priority: false,
        keep_running: false,
    };
    let mut positional: Vec<&String> = Vec::new();
    let mut iter = args.iter();
    while let Some(arg) = iter.next() {
        match arg.as_str() {
            "-b" => opts.buffersize = Some(iter.next()?.parse().ok()?),
            "-t" => opts.length_seconds = Some(iter.next()?.parse().ok()?),
            "-g" => opts.gain = Some(iter.next()?.parse().ok()?),
            "--loop" => opts.looping = true,
            "--double-buffer" => opts.double_buffering = true,
            "--raise-priority" => opts.raised_priority = true,
            "-K" | "--keep-running" => opts.keep_running = true,
            "-h" | "--help" => return None,
            _ => positional.push(arg),
        }
    }
    if positional.len() != 2 {
        return None;
    }
    opts.input = positional[0].clone();
    opts.output = positional[1].clone();
    Some(opts)
}

/// Engine handles the watchdog needs once the engine exists
type WatchdogTarget = Arc<Mutex<Option<(Arc<AtomicBool>, CommandSender)>>>;

/// Block termination signals everywhere and route them through one
/// watchdog thread waiting in sigwait
fn setup_signal_watchdog() -> WatchdogTarget {
    let target: WatchdogTarget = Arc::new(Mutex::new(None));
    let thread_target = Arc::clone(&target);

    let mut set: libc::sigset_t = unsafe { std::mem::zeroed() };
    unsafe {
        libc::sigemptyset(&mut set);
        libc::sigaddset(&mut set, libc::SIGTERM);
        libc::sigaddset(&mut set, libc::SIGINT);
        libc::sigaddset(&mut set, libc::SIGHUP);
        libc::sigaddset(&mut set, libc::SIGQUIT);
        // threads spawned later inherit the mask
        libc::pthread_sigmask(libc::SIG_BLOCK, &set, std::ptr::null_mut());
    }

    let spawned = std::thread::Builder::new()
        .name("trellis-watchdog".to_string())
        .spawn(move || {
            let mut cleanup_started = false;
            loop {
                let mut signo: libc::c_int = 0;
                let rc = unsafe { libc::sigwait(&set, &mut signo) };
                if rc != 0 {
                    log::error!("watchdog: sigwait failed ({})", rc);
                    return;
                }
                if cleanup_started {
                    eprintln!("trellis: signal {} during cleanup, exiting immediately", signo);
                    std::process::exit(RETVAL_RUNTIME_ERROR);
                }
                log::info!("received signal {}, cleaning up", signo);
                cleanup_started = true;
                match thread_target.lock().expect("watchdog target").as_ref() {
                    Some((exit_flag, tx)) => {
                        exit_flag.store(true, Ordering::Release);
                        tx.send(EngineCommand::Exit);
                    }
                    None => std::process::exit(RETVAL_INIT_FAILURE),
                }
            }
        });
    if spawned.is_err() {
        eprintln!("trellis: warning: unable to create watchdog thread");
    }
    target
}

fn build_chainsetup(opts: &Options) -> Result<ChainSetup, EngineError> {
    // peek at the input format so the sink and setup can match it
    let mut probe = WavSource::new(&opts.input);
    probe.open()?;
    let channels = probe.channels();
    let sample_rate = probe.sample_rate();
    probe.close()?;

    let mut cs = ChainSetup::new("trellis-batch");
    cs.set_sample_rate(sample_rate);
    if let Some(b) = opts.buffersize {
        cs.set_buffersize(b);
    }
    if let Some(t) = opts.length_seconds {
        cs.set_length_in_seconds(t);
    }
    cs.set_looping(opts.looping);
    cs.set_double_buffering(opts.double_buffering);
    cs.set_raised_priority(opts.raised_priority);

    let input = cs.add_input(Box::new(WavSource::new(&opts.input)));
    let output = cs.add_output(Box::new(WavSink::new(&opts.output, channels, sample_rate)));
    let mut chain = Chain::new("main", input, output);
    if let Some(g) = opts.gain {
        chain.push_processor(Box::new(GainProcessor::new(g)));
    }
    cs.add_chain(chain);
    Ok(cs)
}

fn run() -> i32 {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info"))
        .format_timestamp_millis()
        .init();

    let args: Vec<String> = std::env::args().skip(1).collect();
    let Some(opts) = parse_args(&args) else {
        print_usage();
        return RETVAL_INIT_FAILURE;
    };
    if opts.looping && opts.length_seconds.is_none() {
        eprintln!("trellis: --loop requires an explicit length (-t)");
        return RETVAL_INIT_FAILURE;
    }

    let watchdog = setup_signal_watchdog();

    let csetup = match build_chainsetup(&opts) {
        Ok(cs) => cs,
        Err(e) => {
            log::error!("{}", e);
            return RETVAL_INIT_FAILURE;
        }
    };

    let mut engine = match Engine::connect(csetup) {
        Ok(e) => e,
        Err(e) => {
            log::error!("{}", e);
            return RETVAL_INIT_FAILURE;
        }
    };
    *watchdog.lock().expect("watchdog target") =
        Some((engine.exit_flag(), engine.command_sender()));

    log::info!("processing '{}' -> '{}'", opts.input, opts.output);
    let result = engine.exec(!opts.keep_running);
    engine.disconnect();

    match result {
        Ok(()) => {
            log::info!("done");
            RETVAL_SUCCESS
        }
        Err(EngineError::Setup(e)) => {
            log::error!("setup error: {}", e);
            RETVAL_INIT_FAILURE
        }
        Err(e @ EngineError::Device { .. }) => {
            log::error!("start error: {}", e);
            RETVAL_START_ERROR
        }
        Err(e) => {
            log::error!("runtime error: {}", e);
            RETVAL_RUNTIME_ERROR
        }
    }
}

fn main() {
    std::process::exit(run());
}
