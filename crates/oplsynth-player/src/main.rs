//! Command-line renderer: plays a demo sequence (or a simple event
//! script) through an oplsynth instance and writes the result to WAV.
//!
//! The library does not bundle an OPL core; out of the box the built-in
//! diagnostic chip renders silence while still exercising the full MIDI
//! translation path. Link a real emulator by registering a factory with
//! [`oplsynth::Synth::register_emulator`] where marked below.

use anyhow::{Context, Result, bail};
use clap::Parser;
use log::info;
use oplsynth::seq::{MidiEvent, Sequencer, TimedEvent};
use oplsynth::{ChanAlloc, Synth, VolumeModelId};
use std::path::PathBuf;

#[derive(Parser, Debug)]
#[command(name = "oplsynth-player", about = "Render MIDI event scripts through oplsynth to WAV")]
struct Args {
    /// Output WAV path.
    #[arg(short, long, default_value = "out.wav")]
    output: PathBuf,

    /// Sample rate in Hz.
    #[arg(short = 'r', long, default_value_t = 44100)]
    sample_rate: u32,

    /// Number of emulated chips.
    #[arg(short = 'n', long, default_value_t = 1)]
    chips: usize,

    /// Number of 4-op channel pairs.
    #[arg(long, default_value_t = 0)]
    four_ops: u32,

    /// WOPL bank file (defaults to the embedded GM bank).
    #[arg(short, long)]
    bank: Option<PathBuf>,

    /// Volume model id (0 = follow the bank).
    #[arg(long, default_value_t = 0)]
    volume_model: u8,

    /// Voice allocation policy: auto, off-delay, same-instrument,
    /// any-released.
    #[arg(long, default_value = "auto")]
    chan_alloc: String,

    /// Enable emulator soft panning.
    #[arg(long)]
    soft_pan: bool,

    /// Enable the auto-arpeggio overflow layer.
    #[arg(long)]
    auto_arpeggio: bool,

    /// Output gain.
    #[arg(long, default_value_t = 2.0)]
    gain: f64,

    /// Event script file; each line is `time command args` (see
    /// `parse_script`). Omit to render the built-in demo.
    #[arg(short, long)]
    script: Option<PathBuf>,

    /// Extra seconds rendered after the last event.
    #[arg(long, default_value_t = 1.0)]
    tail: f64,
}

fn parse_chan_alloc(name: &str) -> Result<ChanAlloc> {
    Ok(match name {
        "auto" => ChanAlloc::Auto,
        "off-delay" => ChanAlloc::OffDelay,
        "same-instrument" => ChanAlloc::SameInstrument,
        "any-released" => ChanAlloc::AnyReleased,
        other => bail!("unknown allocation policy: {other}"),
    })
}

/// Parse a plain-text event script.
///
/// Format, one event per line (blank lines and `#` comments skipped):
///
/// ```text
/// 0.0   on      0 60 100
/// 0.5   off     0 60
/// 0.25  cc      0 7 90
/// 0.3   program 1 24
/// 0.4   bend    0 10000
/// ```
fn parse_script(text: &str) -> Result<Vec<TimedEvent>> {
    let mut events = Vec::new();
    for (lineno, line) in text.lines().enumerate() {
        let line = line.trim();
        if line.is_empty() || line.starts_with('#') {
            continue;
        }
        let fields: Vec<&str> = line.split_whitespace().collect();
        let err = || format!("script line {}: {line}", lineno + 1);

        let time: f64 = fields[0].parse().with_context(err)?;
        let arg = |i: usize| -> Result<u8> {
            fields
                .get(i)
                .with_context(err)?
                .parse::<u8>()
                .with_context(err)
        };

        let event = match *fields.get(1).with_context(err)? {
            "on" => MidiEvent::NoteOn { channel: arg(2)?, key: arg(3)?, velocity: arg(4)? },
            "off" => MidiEvent::NoteOff { channel: arg(2)?, key: arg(3)? },
            "cc" => MidiEvent::Controller {
                channel: arg(2)?,
                controller: arg(3)?,
                value: arg(4)?,
            },
            "program" => MidiEvent::ProgramChange { channel: arg(2)?, program: arg(3)? },
            "bend" => MidiEvent::PitchBend {
                channel: arg(2)?,
                value: fields.get(3).with_context(err)?.parse().with_context(err)?,
            },
            other => bail!("script line {}: unknown command {other}", lineno + 1),
        };
        events.push(TimedEvent { time, event });
    }
    Ok(events)
}

/// A short built-in chord progression over three channels plus drums.
fn demo_events() -> Vec<TimedEvent> {
    let mut events = vec![
        TimedEvent {
            time: 0.0,
            event: MidiEvent::ProgramChange { channel: 0, program: 0 },
        },
        TimedEvent {
            time: 0.0,
            event: MidiEvent::ProgramChange { channel: 1, program: 32 },
        },
        TimedEvent {
            time: 0.0,
            event: MidiEvent::ProgramChange { channel: 2, program: 48 },
        },
    ];

    let chords: [&[u8]; 4] = [&[60, 64, 67], &[57, 60, 64], &[53, 57, 60], &[55, 59, 62]];
    for (bar, chord) in chords.iter().enumerate() {
        let t = bar as f64;
        for &key in *chord {
            events.push(TimedEvent {
                time: t,
                event: MidiEvent::NoteOn { channel: 0, key, velocity: 90 },
            });
            events.push(TimedEvent {
                time: t + 0.9,
                event: MidiEvent::NoteOff { channel: 0, key },
            });
        }
        // Bass root an octave down.
        events.push(TimedEvent {
            time: t,
            event: MidiEvent::NoteOn { channel: 1, key: chord[0] - 24, velocity: 110 },
        });
        events.push(TimedEvent {
            time: t + 0.45,
            event: MidiEvent::NoteOff { channel: 1, key: chord[0] - 24 },
        });
        // Kick and hat.
        for beat in 0..4 {
            let bt = t + f64::from(beat) * 0.25;
            let drum = if beat % 2 == 0 { 36 } else { 42 };
            events.push(TimedEvent {
                time: bt,
                event: MidiEvent::NoteOn { channel: 9, key: drum, velocity: 100 },
            });
            events.push(TimedEvent {
                time: bt + 0.1,
                event: MidiEvent::NoteOff { channel: 9, key: drum },
            });
        }
    }
    events
}

fn main() -> Result<()> {
    env_logger::init();
    let args = Args::parse();

    let mut synth = Synth::new(args.sample_rate).context("synth init")?;
    // Register a real OPL core here, e.g.:
    //   synth.register_emulator(EmulatorId::Custom(1), Box::new(|rate| ...));
    //   synth.switch_emulator(EmulatorId::Custom(1))?;
    synth.set_num_chips(args.chips)?;
    synth.set_num_four_ops(args.four_ops)?;
    synth.set_channel_alloc(parse_chan_alloc(&args.chan_alloc)?);
    synth.set_soft_pan_enabled(args.soft_pan);
    synth.set_auto_arpeggio(args.auto_arpeggio);
    synth.set_volume_model(VolumeModelId::from_raw(args.volume_model));
    synth.set_gain(args.gain);

    if let Some(bank) = &args.bank {
        synth
            .open_bank_file(bank)
            .with_context(|| format!("loading bank {}", bank.display()))?;
        info!("loaded bank {}", bank.display());
    }

    let events = match &args.script {
        Some(path) => {
            let text = std::fs::read_to_string(path)
                .with_context(|| format!("reading {}", path.display()))?;
            parse_script(&text)?
        }
        None => demo_events(),
    };
    if events.is_empty() {
        bail!("no events to render");
    }

    let mut seq = Sequencer::new(synth);
    seq.open_events(events);
    let total = seq.total_time_length() + args.tail;
    info!("rendering {total:.2}s at {} Hz", args.sample_rate);

    let spec = hound::WavSpec {
        channels: 2,
        sample_rate: args.sample_rate,
        bits_per_sample: 16,
        sample_format: hound::SampleFormat::Int,
    };
    let mut writer =
        hound::WavWriter::create(&args.output, spec).context("creating WAV file")?;

    let total_frames = (total * f64::from(args.sample_rate)) as usize;
    let mut buf = vec![0i16; 4096 * 2];
    let mut written = 0usize;
    while written < total_frames {
        let frames = (total_frames - written).min(4096);
        seq.generate(&mut buf[..frames * 2]);
        for &sample in &buf[..frames * 2] {
            writer.write_sample(sample)?;
        }
        written += frames;
    }
    writer.finalize()?;

    info!("wrote {} frames to {}", written, args.output.display());
    Ok(())
}
