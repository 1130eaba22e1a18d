#![doc = include_str!("../README.md")]
//! oplsynth — a General MIDI synthesizer for emulated OPL2/OPL3 FM chips
//!
//! The crate is organized along its data flow:
//!
//! - [`bank`] — immutable instrument data: operators, timbres, the bank
//!   database and WOPL file I/O.
//! - [`model`] — selectable frequency and volume models translating MIDI
//!   pitch and dynamics into F-number/Block words and operator TL bytes.
//! - [`chip`] — the emulator contract ([`chip::ChipEmulator`]) and the
//!   multi-chip register frontend with its per-voice caches.
//! - [`midi`] — per-channel controller and note state.
//! - [`synth`] — the [`Synth`]: realtime event surface, voice allocation
//!   and the render loop.
//! - [`seq`] — timestamped event delivery on top of a synth.
//! - [`render`] — output sample format conversion.
//!
//! A [`Synth`] instance is single-threaded; drive it from one thread and
//! feed it events between `generate` calls (or let a [`seq::Sequencer`]
//! do that for you).

pub mod bank;
pub mod chip;
pub mod error;
pub mod midi;
pub mod model;
pub mod render;
pub mod seq;
pub mod synth;

pub use bank::{Bank, BankDb, BankKey, BankSetup, Instrument, RhythmSlot, Timbre};
pub use chip::{ChipEmulator, ChipType, EmulatorId, MusicMode};
pub use error::{BankError, SynthError};
pub use model::{FreqModel, VolumeModel, VolumeModelId};
pub use render::{SampleFormat, SampleType};
pub use synth::voice::ChanAlloc;
pub use synth::Synth;
