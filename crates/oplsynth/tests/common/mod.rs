//! Shared helpers for the integration tests: a synth wired to a journaled
//! register-log chip so tests can assert on the exact register traffic.
#![allow(dead_code)]

use oplsynth::chip::emulator::{RegJournal, RegWrite, RegisterLogChip};
use oplsynth::{EmulatorId, Synth};
use std::cell::RefCell;
use std::rc::Rc;

/// Emulator slot the journaled chip is registered under.
pub const JOURNALED: EmulatorId = EmulatorId::Custom(100);

/// Build a synth whose chips journal every register write.
pub fn journaled_synth(sample_rate: u32) -> (Synth, RegJournal) {
    let journal: RegJournal = Rc::new(RefCell::new(Vec::new()));
    let mut synth = Synth::new(sample_rate).expect("synth init");
    let j = Rc::clone(&journal);
    synth.register_emulator(
        JOURNALED,
        Box::new(move |rate| Box::new(RegisterLogChip::with_journal(rate, Rc::clone(&j)))),
    );
    synth.switch_emulator(JOURNALED).expect("switch emulator");
    journal.borrow_mut().clear();
    (synth, journal)
}

/// Last write to `address`, if any.
pub fn last_write(journal: &RegJournal, address: u16) -> Option<RegWrite> {
    journal.borrow().iter().rev().find(|w| w.address == address).copied()
}

/// Reconstruct the current F-number/Block of a channel offset from the
/// journal (reads the last 0xA0+off and 0xB0+off writes).
pub fn current_fnum_block(journal: &RegJournal, offset: u16) -> Option<(u16, u8, bool)> {
    let low = last_write(journal, 0xA0 + offset)?.value;
    let high = last_write(journal, 0xB0 + offset)?.value;
    let fnum = u16::from(low) | (u16::from(high & 0x03) << 8);
    let block = (high >> 2) & 0x07;
    let key_on = (high & 0x20) != 0;
    Some((fnum, block, key_on))
}

/// Produced frequency in Hz for an OPL3 fnum/block at the standard master
/// clock.
pub fn fnum_block_to_hz(fnum: u16, block: u8) -> f64 {
    f64::from(fnum) * 14_318_180.0 / (288.0 * 2f64.powi(20 - i32::from(block)))
}
