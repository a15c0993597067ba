//! End-to-end engine runs over real files

use trellis_core::chain::Chain;
use trellis_core::chainsetup::ChainSetup;
use trellis_core::endpoint::wav::{WavSink, WavSource};
use trellis_core::endpoint::AudioEndpoint;
use trellis_core::engine::{Engine, EngineCommand, EngineStatus};
use trellis_core::types::{Sample, SampleBuffer};

const RATE: u32 = 48_000;

fn write_sine_wav(path: &std::path::Path, frames: usize, freq: f64, amplitude: f64) {
    let mut buf = SampleBuffer::silence(1, frames, RATE);
    for (i, s) in buf.channel_mut(0).iter_mut().enumerate() {
        *s = (amplitude * (2.0 * std::f64::consts::PI * freq * i as f64 / f64::from(RATE)).sin())
            as Sample;
    }
    let mut sink = WavSink::new(path, 1, RATE);
    sink.open().unwrap();
    sink.write(&buf).unwrap();
    sink.close().unwrap();
}

fn read_wav_samples(path: &std::path::Path) -> Vec<Sample> {
    let mut source = WavSource::new(path);
    source.open().unwrap();
    let total = source.length_in_samples().unwrap() as usize;
    let mut buf = SampleBuffer::silence(1, total.max(1), RATE);
    let mut out = Vec::with_capacity(total);
    while !source.finished() && out.len() < total {
        buf.set_frames((total - out.len()).min(4096));
        source.read(&mut buf).unwrap();
        if buf.frames() == 0 {
            break;
        }
        out.extend_from_slice(buf.channel(0));
    }
    out
}

fn passthrough_setup(
    input: &std::path::Path,
    output: &std::path::Path,
    buffersize: usize,
) -> ChainSetup {
    let mut cs = ChainSetup::new("passthrough");
    cs.set_sample_rate(RATE);
    cs.set_buffersize(buffersize);
    let i = cs.add_input(Box::new(WavSource::new(input)));
    let o = cs.add_output(Box::new(WavSink::new(output, 1, RATE)));
    cs.add_chain(Chain::new("main", i, o));
    cs
}

#[test]
fn file_passthrough_is_lossless() {
    let dir = tempfile::tempdir().unwrap();
    let input = dir.path().join("in.wav");
    let output = dir.path().join("out.wav");
    // 10000 frames is not a multiple of 1024: exercises the short final
    // block as well
    write_sine_wav(&input, 10_000, 440.0, 0.9);

    let mut engine = Engine::connect(passthrough_setup(&input, &output, 1024)).unwrap();
    engine.exec(true).unwrap();
    assert_eq!(engine.status(), EngineStatus::Finished);
    engine.disconnect();

    assert_eq!(read_wav_samples(&output), read_wav_samples(&input));
}

#[test]
fn doubling_buffersize_does_not_change_output() {
    let dir = tempfile::tempdir().unwrap();
    let input = dir.path().join("in.wav");
    write_sine_wav(&input, 20_000, 330.0, 0.5);

    let out_a = dir.path().join("a.wav");
    let out_b = dir.path().join("b.wav");
    Engine::connect(passthrough_setup(&input, &out_a, 512))
        .unwrap()
        .exec(true)
        .unwrap();
    Engine::connect(passthrough_setup(&input, &out_b, 1024))
        .unwrap()
        .exec(true)
        .unwrap();

    assert_eq!(read_wav_samples(&out_a), read_wav_samples(&out_b));
}

#[test]
fn double_buffered_run_matches_direct_run() {
    let dir = tempfile::tempdir().unwrap();
    let input = dir.path().join("in.wav");
    write_sine_wav(&input, 30_000, 220.0, 0.7);

    let direct = dir.path().join("direct.wav");
    Engine::connect(passthrough_setup(&input, &direct, 1024))
        .unwrap()
        .exec(true)
        .unwrap();

    let proxied = dir.path().join("proxied.wav");
    let mut cs = passthrough_setup(&input, &proxied, 1024);
    cs.set_double_buffering(true);
    // ring deep enough to hold the whole file: the run is then
    // deterministic, with no mid-stream underruns to paper over
    cs.set_double_buffer_frames(65_536);
    let mut engine = Engine::connect(cs).unwrap();
    engine.exec(true).unwrap();
    engine.disconnect();

    assert_eq!(read_wav_samples(&proxied), read_wav_samples(&direct));
}

#[test]
fn two_chains_into_one_sink_mix_at_half_weight() {
    let dir = tempfile::tempdir().unwrap();
    let silence = dir.path().join("silence.wav");
    let sine = dir.path().join("sine.wav");
    let output = dir.path().join("mix.wav");
    write_sine_wav(&silence, 8192, 440.0, 0.0);
    write_sine_wav(&sine, 8192, 440.0, 1.0);

    let mut cs = ChainSetup::new("mix");
    cs.set_sample_rate(RATE);
    cs.set_buffersize(512);
    let a = cs.add_input(Box::new(WavSource::new(&silence)));
    let b = cs.add_input(Box::new(WavSource::new(&sine)));
    let o = cs.add_output(Box::new(WavSink::new(&output, 1, RATE)));
    cs.add_chain(Chain::new("ca", a, o));
    cs.add_chain(Chain::new("cb", b, o));

    let mut engine = Engine::connect(cs).unwrap();
    engine.exec(true).unwrap();
    engine.disconnect();

    let mixed = read_wav_samples(&output);
    let reference = read_wav_samples(&sine);
    assert_eq!(mixed.len(), reference.len());
    for (m, r) in mixed.iter().zip(reference.iter()) {
        assert!((m - r / 2.0).abs() < 1e-6);
    }
}

#[test]
fn looped_range_repeats_bitwise() {
    let dir = tempfile::tempdir().unwrap();
    let input = dir.path().join("in.wav");
    let output = dir.path().join("out.wav");
    write_sine_wav(&input, 48_000, 440.0, 0.8);

    // half-second range, looping; drive iterations by hand so the test
    // controls how long the "endless" run lasts
    let mut cs = passthrough_setup(&input, &output, 1000);
    cs.set_length_in_samples(24_000);
    cs.set_looping(true);
    let mut engine = Engine::connect(cs).unwrap();
    engine.start().unwrap();
    for _ in 0..72 {
        engine.engine_iteration().unwrap();
    }
    assert_eq!(engine.status(), EngineStatus::Running);
    engine.stop_operation();
    engine.disconnect();

    let written = read_wav_samples(&output);
    assert_eq!(written.len(), 72_000);
    // three laps, each bitwise identical to the first
    assert_eq!(&written[24_000..48_000], &written[..24_000]);
    assert_eq!(&written[48_000..72_000], &written[..24_000]);
}

#[test]
fn exit_command_ends_keep_running_session() {
    let dir = tempfile::tempdir().unwrap();
    let input = dir.path().join("in.wav");
    let output = dir.path().join("out.wav");
    write_sine_wav(&input, 4096, 440.0, 0.6);

    let mut engine = Engine::connect(passthrough_setup(&input, &output, 512)).unwrap();
    let tx = engine.command_sender();
    let nudge = std::thread::spawn(move || {
        std::thread::sleep(std::time::Duration::from_millis(80));
        tx.send(EngineCommand::Exit);
    });

    // keep-running: start comes from the queue, the run outlives Finished
    let tx2 = engine.command_sender();
    tx2.send(EngineCommand::Start);
    engine.exec(false).unwrap();
    nudge.join().unwrap();
    assert_eq!(engine.status(), EngineStatus::Finished);
    engine.disconnect();

    assert_eq!(read_wav_samples(&output), read_wav_samples(&input));
}
