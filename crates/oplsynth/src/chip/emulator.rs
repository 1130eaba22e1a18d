//! Chip emulator contract and registry.
//!
//! The synthesizer drives chips through the narrow [`ChipEmulator`] trait;
//! the actual OPL cores (Nuked, DOSBox, Opal, ...) live outside this crate
//! and are registered by the host as factories. The only guarantee the core
//! relies on is write-before-generate visibility: a `write_reg` issued
//! before a `generate` call is observable in the samples that call
//! produces.
//!
//! The crate ships one built-in implementation, [`RegisterLogChip`]: a
//! diagnostic chip that records every register write and renders silence.
//! It backs the test suite and lets hosts inspect the exact register
//! traffic a MIDI stream produces.

use std::cell::RefCell;
use std::collections::BTreeMap;
use std::rc::Rc;

/// Chip family detected from the active emulator.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChipType {
    /// 9-channel OPL2 (YM3812): single register bank, no stereo.
    Opl2,
    /// 18-channel OPL3 (YMF262): two register banks, stereo, 4-op pairs.
    Opl3,
}

/// Contract between the synthesizer core and a chip emulator.
///
/// Register addresses use the flat OPL3 space: 0x000-0x0FF selects the
/// first bank, 0x100-0x1FF the second. Sample buffers are interleaved
/// stereo `i16` (`out.len() / 2` frames).
pub trait ChipEmulator {
    /// Reconfigure the output sample rate. May discard internal state.
    fn set_rate(&mut self, rate: u32);

    /// Full chip reset.
    fn reset(&mut self);

    /// Write an OPL register.
    fn write_reg(&mut self, address: u16, value: u8);

    /// Soft-panning level write for emulators that support it. The default
    /// implementation ignores the write.
    fn write_pan(&mut self, _address: u16, _value: u8) {}

    /// Produce interleaved stereo samples, replacing the buffer contents.
    fn generate(&mut self, out: &mut [i16]);

    /// Produce samples and mix them additively into the buffer. Used for
    /// the second and later chips of a multi-chip setup.
    fn generate_and_mix(&mut self, out: &mut [i16]) {
        let mut tmp = vec![0i16; out.len()];
        self.generate(&mut tmp);
        for (dst, src) in out.iter_mut().zip(tmp.iter()) {
            *dst = dst.saturating_add(*src);
        }
    }

    fn chip_type(&self) -> ChipType {
        ChipType::Opl3
    }

    /// Whether `write_pan` performs full soft panning.
    fn has_full_panning(&self) -> bool {
        false
    }
}

/// Identifier for a chip emulator implementation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum EmulatorId {
    /// Built-in diagnostic chip; always available.
    RegisterLog,
    /// Host-registered emulator slot.
    Custom(u32),
}

/// Factory building one chip instance at a given sample rate.
pub type ChipFactory = Box<dyn Fn(u32) -> Box<dyn ChipEmulator>>;

/// Registry of available emulators.
///
/// The built-in [`EmulatorId::RegisterLog`] entry is always present; hosts
/// add their OPL cores under [`EmulatorId::Custom`] slots.
pub struct EmulatorRegistry {
    factories: BTreeMap<EmulatorId, ChipFactory>,
}

impl std::fmt::Debug for EmulatorRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EmulatorRegistry")
            .field("ids", &self.factories.keys().collect::<Vec<_>>())
            .finish()
    }
}

impl EmulatorRegistry {
    pub fn new() -> Self {
        let mut reg = EmulatorRegistry {
            factories: BTreeMap::new(),
        };
        reg.register(EmulatorId::RegisterLog, Box::new(|rate| {
            Box::new(RegisterLogChip::new(rate))
        }));
        reg
    }

    /// Register or replace a factory for an emulator id.
    pub fn register(&mut self, id: EmulatorId, factory: ChipFactory) {
        self.factories.insert(id, factory);
    }

    pub fn contains(&self, id: EmulatorId) -> bool {
        self.factories.contains_key(&id)
    }

    /// Instantiate a chip, or `None` for an unknown id.
    pub fn build(&self, id: EmulatorId, rate: u32) -> Option<Box<dyn ChipEmulator>> {
        self.factories.get(&id).map(|f| f(rate))
    }
}

impl Default for EmulatorRegistry {
    fn default() -> Self {
        Self::new()
    }
}

/// One recorded register write.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RegWrite {
    pub address: u16,
    pub value: u8,
}

/// Shared journal of register writes, cloneable into test code while the
/// chip itself is owned by the synth.
pub type RegJournal = Rc<RefCell<Vec<RegWrite>>>;

/// Diagnostic emulator: tracks register state, journals writes, renders
/// silence.
#[derive(Debug, Default)]
pub struct RegisterLogChip {
    rate: u32,
    registers: BTreeMap<u16, u8>,
    pan_levels: BTreeMap<u16, u8>,
    journal: Option<RegJournal>,
}

impl RegisterLogChip {
    pub fn new(rate: u32) -> Self {
        RegisterLogChip {
            rate,
            registers: BTreeMap::new(),
            pan_levels: BTreeMap::new(),
            journal: None,
        }
    }

    /// Attach a shared journal that receives every subsequent write.
    pub fn with_journal(rate: u32, journal: RegJournal) -> Self {
        RegisterLogChip {
            rate,
            registers: BTreeMap::new(),
            pan_levels: BTreeMap::new(),
            journal: Some(journal),
        }
    }

    /// Last value written to a register, if any.
    pub fn register(&self, address: u16) -> Option<u8> {
        self.registers.get(&address).copied()
    }

    /// Last soft-pan level written for a channel offset, if any.
    pub fn pan_level(&self, address: u16) -> Option<u8> {
        self.pan_levels.get(&address).copied()
    }

    pub fn rate(&self) -> u32 {
        self.rate
    }
}

impl ChipEmulator for RegisterLogChip {
    fn set_rate(&mut self, rate: u32) {
        self.rate = rate;
        self.registers.clear();
        self.pan_levels.clear();
    }

    fn reset(&mut self) {
        self.registers.clear();
        self.pan_levels.clear();
    }

    fn write_reg(&mut self, address: u16, value: u8) {
        self.registers.insert(address & 0x1FF, value);
        if let Some(journal) = &self.journal {
            journal.borrow_mut().push(RegWrite {
                address: address & 0x1FF,
                value,
            });
        }
    }

    fn write_pan(&mut self, address: u16, value: u8) {
        self.pan_levels.insert(address & 0x1FF, value);
    }

    fn generate(&mut self, out: &mut [i16]) {
        out.fill(0);
    }

    fn generate_and_mix(&mut self, _out: &mut [i16]) {
        // Mixing silence leaves the buffer untouched.
    }

    fn has_full_panning(&self) -> bool {
        true
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_registry_has_builtin() {
        let reg = EmulatorRegistry::new();
        assert!(reg.contains(EmulatorId::RegisterLog));
        assert!(!reg.contains(EmulatorId::Custom(3)));
        assert!(reg.build(EmulatorId::RegisterLog, 44100).is_some());
        assert!(reg.build(EmulatorId::Custom(3), 44100).is_none());
    }

    #[test]
    fn test_log_chip_tracks_registers() {
        let mut chip = RegisterLogChip::new(44100);
        chip.write_reg(0x1A0, 0x57);
        chip.write_reg(0x0BD, 0x20);
        assert_eq!(chip.register(0x1A0), Some(0x57));
        assert_eq!(chip.register(0x0BD), Some(0x20));
        assert_eq!(chip.register(0x0A0), None);

        chip.reset();
        assert_eq!(chip.register(0x1A0), None);
    }

    #[test]
    fn test_journal_receives_writes() {
        let journal: RegJournal = Rc::new(RefCell::new(Vec::new()));
        let mut chip = RegisterLogChip::with_journal(44100, Rc::clone(&journal));
        chip.write_reg(0xB0, 0x2E);
        assert_eq!(
            journal.borrow().as_slice(),
            &[RegWrite { address: 0xB0, value: 0x2E }]
        );
    }

    #[test]
    fn test_generate_renders_silence() {
        let mut chip = RegisterLogChip::new(44100);
        let mut buf = vec![77i16; 64];
        chip.generate(&mut buf);
        assert!(buf.iter().all(|&s| s == 0));
    }
}
