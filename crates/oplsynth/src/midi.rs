//! MIDI-side state model.
pub mod channel;

pub use channel::{MidiChannel, NoteState, ParamSelect, VibratoLfo};
