//! Chip-facing layers: the emulator contract and the register frontend.
pub mod emulator;
pub mod frontend;

pub use emulator::{ChipEmulator, ChipType, EmulatorId, EmulatorRegistry, RegisterLogChip};
pub use frontend::{ChipFrontend, MusicMode, VoiceCategory};
