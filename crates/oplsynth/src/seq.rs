//! Timestamped event delivery and the render interleave.
//!
//! The MIDI file parser lives outside this crate; what it produces is a
//! flat, time-sorted list of [`TimedEvent`]s. The [`Sequencer`] owns a
//! [`Synth`] and interleaves event delivery with sample generation so that
//! every event timestamped at or before the start of a frame is audible no
//! later than that frame. Rendering is chunked at the synth's chunk bound,
//! and a chunk is additionally split at the next event time, so per-event
//! latency never exceeds the chunk size.

use crate::render::{SampleFormat, convert_frames};
use crate::synth::{MAX_CHUNK_FRAMES, Synth};

/// A runtime MIDI event, the contract between the sequencer layer and the
/// synthesizer.
#[derive(Debug, Clone, PartialEq)]
pub enum MidiEvent {
    NoteOn { channel: u8, key: u8, velocity: u8 },
    NoteOff { channel: u8, key: u8 },
    NoteAftertouch { channel: u8, key: u8, pressure: u8 },
    ChannelAftertouch { channel: u8, pressure: u8 },
    Controller { channel: u8, controller: u8, value: u8 },
    ProgramChange { channel: u8, program: u8 },
    PitchBend { channel: u8, value: u16 },
    SysEx(Vec<u8>),
}

/// An event scheduled at an absolute time in seconds.
#[derive(Debug, Clone, PartialEq)]
pub struct TimedEvent {
    pub time: f64,
    pub event: MidiEvent,
}

/// Sequencer-driven renderer.
pub struct Sequencer {
    synth: Synth,
    events: Vec<TimedEvent>,
    cursor: usize,
    position: f64,
    total: f64,
}

impl Sequencer {
    pub fn new(synth: Synth) -> Self {
        Sequencer {
            synth,
            events: Vec::new(),
            cursor: 0,
            position: 0.0,
            total: 0.0,
        }
    }

    /// Access the underlying synth (for configuration and `rt_*` calls).
    pub fn synth(&mut self) -> &mut Synth {
        &mut self.synth
    }

    /// Install an event list. Events are sorted by time (stable, so
    /// same-timestamp events keep their relative order) and playback
    /// rewinds to the start.
    pub fn open_events(&mut self, mut events: Vec<TimedEvent>) {
        events.sort_by(|a, b| a.time.partial_cmp(&b.time).unwrap_or(std::cmp::Ordering::Equal));
        self.total = events.last().map(|e| e.time).unwrap_or(0.0);
        self.events = events;
        self.cursor = 0;
        self.position = 0.0;
        self.synth.panic();
    }

    /// Total length of the installed song in seconds.
    pub fn total_time_length(&self) -> f64 {
        self.total
    }

    pub fn position_tell(&self) -> f64 {
        self.position
    }

    /// Whether every event has been delivered and the position passed the
    /// last of them.
    pub fn at_end(&self) -> bool {
        self.cursor >= self.events.len() && self.position >= self.total
    }

    /// Seek to an absolute time.
    ///
    /// Sounding notes are silenced; non-note events (controllers, program
    /// changes, pitch bend, SysEx) before the target are replayed so the
    /// channel state matches a contiguous playback.
    pub fn position_seek(&mut self, seconds: f64) {
        let target = seconds.max(0.0);
        self.synth.panic();
        self.cursor = 0;
        self.position = target;

        while self.cursor < self.events.len() && self.events[self.cursor].time < target {
            let event = self.events[self.cursor].event.clone();
            match &event {
                MidiEvent::NoteOn { .. }
                | MidiEvent::NoteOff { .. }
                | MidiEvent::NoteAftertouch { .. } => {}
                _ => self.deliver(&event),
            }
            self.cursor += 1;
        }
    }

    fn deliver(&mut self, event: &MidiEvent) {
        match event {
            MidiEvent::NoteOn { channel, key, velocity } => {
                self.synth.rt_note_on(*channel, *key, *velocity)
            }
            MidiEvent::NoteOff { channel, key } => self.synth.rt_note_off(*channel, *key),
            MidiEvent::NoteAftertouch { channel, key, pressure } => {
                self.synth.rt_note_after_touch(*channel, *key, *pressure)
            }
            MidiEvent::ChannelAftertouch { channel, pressure } => {
                self.synth.rt_channel_after_touch(*channel, *pressure)
            }
            MidiEvent::Controller { channel, controller, value } => {
                self.synth.rt_controller_change(*channel, *controller, *value)
            }
            MidiEvent::ProgramChange { channel, program } => {
                self.synth.rt_patch_change(*channel, *program)
            }
            MidiEvent::PitchBend { channel, value } => {
                self.synth.rt_pitch_bend(*channel, *value)
            }
            MidiEvent::SysEx(data) => self.synth.rt_system_exclusive(data),
        }
    }

    /// Deliver the events due at the current position.
    fn deliver_due(&mut self) {
        while self.cursor < self.events.len()
            && self.events[self.cursor].time <= self.position + 1e-9
        {
            let event = self.events[self.cursor].event.clone();
            self.deliver(&event);
            self.cursor += 1;
        }
    }

    /// Event-tick mode: process queued events up to `dt` seconds ahead and
    /// return the time until the next pending event (at least `min_dt`, or
    /// 0.0 when the song ended).
    pub fn tick_events(&mut self, dt: f64, min_dt: f64) -> f64 {
        self.position += dt.max(0.0);
        self.deliver_due();
        self.synth.tick_housekeeping(dt.max(0.0));

        match self.events.get(self.cursor) {
            Some(next) => (next.time - self.position).max(min_dt),
            None => 0.0,
        }
    }

    /// Sample-pull mode: render `out.len() / 2` frames, delivering due
    /// events at chunk boundaries and splitting chunks at event times.
    pub fn generate(&mut self, out: &mut [i16]) {
        let rate = f64::from(self.synth.sample_rate());
        let frames = out.len() / 2;
        let mut done = 0usize;

        while done < frames {
            self.deliver_due();

            let mut n = (frames - done).min(MAX_CHUNK_FRAMES);
            if let Some(next) = self.events.get(self.cursor) {
                let until = ((next.time - self.position) * rate).ceil();
                if until >= 1.0 {
                    n = n.min(until as usize);
                }
            }

            self.synth.generate(&mut out[done * 2..(done + n) * 2]);
            self.position += n as f64 / rate;
            done += n;
        }
        self.deliver_due();
    }

    /// Like [`Sequencer::generate`], converted to a host sample format
    /// with the synth's gain applied.
    pub fn generate_format(&mut self, frames: usize, format: SampleFormat) -> Vec<u8> {
        let mut native = vec![0i16; frames * 2];
        self.generate(&mut native);
        convert_frames(&native, self.synth.gain(), format)
    }
}

impl std::fmt::Debug for Sequencer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Sequencer")
            .field("events", &self.events.len())
            .field("cursor", &self.cursor)
            .field("position", &self.position)
            .finish()
    }
}
