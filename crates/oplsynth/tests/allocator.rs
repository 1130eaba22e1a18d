// Voice allocation: 4-op pairing, pseudo-4-op spreading, rhythm-mode
// slots, stealing and exhaustion behaviour.

mod common;

use common::{journaled_synth, last_write};
use oplsynth::bank::wopl::{self, WoplFile};
use oplsynth::chip::VoiceCategory;
use oplsynth::synth::voice::VoiceState;
use oplsynth::{ChanAlloc, Instrument, RhythmSlot, Timbre};

/// A WOPL image whose melodic program 88 is a natural 4-op instrument and
/// whose program 89 is a pseudo-4-op double voice.
fn four_op_bank() -> Vec<u8> {
    let mut file = WoplFile::empty();
    let bank = &mut file.melodic[0];

    for program in 0..128 {
        bank.instruments[program] = Instrument::two_op(Timbre::DEFAULT);
    }

    let mut four_op = Instrument::two_op(Timbre::DEFAULT);
    four_op.flags |= Instrument::FLAG_REAL_4OP;
    bank.instruments[88] = four_op;

    let mut pseudo = Instrument::two_op(Timbre::DEFAULT);
    pseudo.flags |= Instrument::FLAG_PSEUDO_4OP;
    pseudo.second_voice_detune = 0.125;
    bank.instruments[89] = pseudo;

    // Percussion bank: a bass drum bound to the rhythm-mode slot.
    let drums = &mut file.percussive[0];
    for key in [35u8, 38, 42] {
        let mut ins = Instrument::two_op(Timbre::DEFAULT);
        ins.percussion_key = key;
        ins.set_rhythm_slot(Some(match key {
            35 => RhythmSlot::BassDrum,
            38 => RhythmSlot::Snare,
            _ => RhythmSlot::HiHat,
        }));
        drums.instruments[key as usize] = ins;
    }

    wopl::serialize(&file)
}

#[test]
fn test_four_op_allocation_with_degrade() {
    // One 4-op pair configured: the first note takes the pair (voices 0
    // and 3), the next two are served as 2-op, nothing is dropped.
    let (mut synth, _journal) = journaled_synth(44100);
    synth.open_bank_data(&four_op_bank()).unwrap();
    synth.set_num_four_ops(1).unwrap();

    for ch_program in [(0u8, 88u8), (1, 88), (2, 88)] {
        synth.rt_patch_change(ch_program.0, ch_program.1);
    }
    synth.rt_note_on(0, 60, 100);
    synth.rt_note_on(1, 64, 100);
    synth.rt_note_on(2, 67, 100);

    let voices = synth.describe_voices();
    let owned: Vec<_> = voices.iter().filter(|v| v.owner.is_some()).collect();
    assert_eq!(owned.len(), 4, "pair + two degraded singles");

    let first_note: Vec<_> = owned
        .iter()
        .filter(|v| v.owner.unwrap().channel == 0)
        .collect();
    assert_eq!(first_note.len(), 2);
    let mut idx: Vec<usize> = first_note.iter().map(|v| v.index).collect();
    idx.sort_unstable();
    assert_eq!(idx[1], idx[0] + 3, "4-op halves must be a hardware pair");
    assert_eq!(voices[idx[0]].category, VoiceCategory::FourOpFirst);
    assert_eq!(voices[idx[1]].category, VoiceCategory::FourOpSecond);

    // Channels 1 and 2 each got a single regular voice.
    for ch in [1u8, 2] {
        let served = owned.iter().filter(|v| v.owner.unwrap().channel == ch).count();
        assert_eq!(served, 1, "channel {ch} degraded to one 2-op voice");
    }
}

#[test]
fn test_pseudo_four_op_hard_pans() {
    let (mut synth, journal) = journaled_synth(44100);
    synth.open_bank_data(&four_op_bank()).unwrap();
    synth.rt_patch_change(0, 89);
    synth.rt_note_on(0, 60, 100);

    let owned: Vec<_> = synth
        .describe_voices()
        .into_iter()
        .filter(|v| v.owner.is_some())
        .collect();
    assert_eq!(owned.len(), 2, "double voice takes two slots");

    // The two voices got opposite hard pans.
    let pans: Vec<u8> = journal
        .borrow()
        .iter()
        .filter(|w| (w.address & 0xFF0) == 0x0C0)
        .map(|w| w.value & 0x30)
        .collect();
    assert!(pans.contains(&0x10), "no hard-left voice: {pans:?}");
    assert!(pans.contains(&0x20), "no hard-right voice: {pans:?}");
}

#[test]
fn test_rhythm_mode_fixed_slots() {
    // Bass + snare + hi-hat together: the rhythm voices own the notes and
    // the 0xBD bits 0x10/0x08/0x01 are set side by side.
    let (mut synth, journal) = journaled_synth(44100);
    synth.open_bank_data(&four_op_bank()).unwrap();
    synth.set_rhythm_mode(true);

    synth.rt_note_on(9, 35, 100);
    synth.rt_note_on(9, 38, 100);
    synth.rt_note_on(9, 42, 100);

    let bd = last_write(&journal, 0x0BD).expect("no 0xBD write").value;
    assert_eq!(bd & 0x1F, 0x10 | 0x08 | 0x01);
    assert_eq!(bd & 0x20, 0x20, "rhythm enable flag dropped");

    let owned: Vec<_> = synth
        .describe_voices()
        .into_iter()
        .filter(|v| v.owner.is_some())
        .collect();
    let cats: Vec<_> = owned.iter().map(|v| v.category).collect();
    assert!(cats.contains(&VoiceCategory::RhythmBass));
    assert!(cats.contains(&VoiceCategory::RhythmSnare));
    assert!(cats.contains(&VoiceCategory::RhythmHiHat));
}

#[test]
fn test_at_most_one_owner_per_note() {
    let (mut synth, _journal) = journaled_synth(44100);

    // Retrigger the same key repeatedly; the (channel, key, voice_index)
    // triple must never be owned twice.
    for _ in 0..5 {
        synth.rt_note_on(0, 60, 100);
    }
    let owners: Vec<_> = synth
        .describe_voices()
        .into_iter()
        .filter_map(|v| v.owner)
        .collect();
    let mut unique = owners.clone();
    unique.sort_by_key(|o| (o.channel, o.key, o.voice_index));
    unique.dedup_by_key(|o| (o.channel, o.key, o.voice_index));
    assert_eq!(owners.len(), unique.len(), "duplicate owner triple");
    assert_eq!(owners.len(), 1);
}

#[test]
fn test_pool_exhaustion_steals_quietest() {
    let (mut synth, _journal) = journaled_synth(44100);
    synth.set_channel_alloc(ChanAlloc::OffDelay);

    // Fill all 18 tone channels, one loud note each, then one more.
    synth.rt_controller_change(1, 7, 30); // channel 1 is the quietest
    for key in 0..18u8 {
        let ch = if key == 5 { 1 } else { 0 };
        synth.rt_note_on(ch, 40 + key, 100);
    }
    let on_before = synth
        .describe_voices()
        .iter()
        .filter(|v| v.state == VoiceState::On)
        .count();
    assert_eq!(on_before, 18);

    synth.rt_note_on(2, 100, 100);
    let voices = synth.describe_voices();
    let on_after = voices.iter().filter(|v| v.state == VoiceState::On).count();
    assert_eq!(on_after, 18, "steal, not grow");

    // The evicted note was the quiet channel-1 note.
    assert!(
        !voices
            .iter()
            .any(|v| v.owner.is_some_and(|o| o.channel == 1)),
        "quietest note should have been stolen"
    );
    assert!(voices.iter().any(|v| v.owner.is_some_and(|o| o.channel == 2)));
}

#[test]
fn test_exhaustion_never_exceeds_pool() {
    let (mut synth, _journal) = journaled_synth(44100);
    synth.set_auto_arpeggio(false);

    for key in 0..30u8 {
        synth.rt_note_on(0, 40 + key, 100);
    }
    // Never more sounding voices than tone channels.
    let on = synth
        .describe_voices()
        .iter()
        .filter(|v| v.state == VoiceState::On)
        .count();
    assert!(on <= 18);
}

#[test]
fn test_auto_arpeggio_cycles_overflow() {
    let (mut synth, _journal) = journaled_synth(44100);
    synth.set_auto_arpeggio(true);

    for key in 0..24u8 {
        synth.rt_note_on(0, 40 + key, 100);
    }

    let owned_keys = |synth: &oplsynth::Synth| -> Vec<u8> {
        synth
            .describe_voices()
            .iter()
            .filter_map(|v| v.owner.map(|o| o.key))
            .collect()
    };
    let before = owned_keys(&synth);

    // Run housekeeping well past several arpeggio periods.
    let mut buf = vec![0i16; 44100 / 5 * 2];
    synth.generate(&mut buf);

    let after = owned_keys(&synth);
    assert!(
        before != after,
        "arpeggiator never rotated the sounding set"
    );
}

#[test]
fn test_same_instrument_policy_reuses_voice() {
    let (mut synth, journal) = journaled_synth(44100);
    synth.set_channel_alloc(ChanAlloc::SameInstrument);

    synth.rt_note_on(0, 60, 100);
    synth.rt_note_off(0, 60);
    let voice_before = synth.describe_voices();
    let released: Vec<_> = voice_before
        .iter()
        .filter(|v| v.state == VoiceState::Releasing)
        .collect();
    assert_eq!(released.len(), 1);
    let idx = released[0].index;

    journal.borrow_mut().clear();
    synth.rt_note_on(0, 62, 100);

    // Same timbre, same voice: no operator patch bytes rewritten.
    let patch_writes = journal
        .borrow()
        .iter()
        .filter(|w| (0x20..0x40).contains(&w.address) || (0x60..0xA0).contains(&w.address))
        .count();
    assert_eq!(patch_writes, 0, "patch was rewritten needlessly");

    let owner_voice = synth
        .describe_voices()
        .into_iter()
        .find(|v| v.owner.is_some())
        .unwrap();
    assert_eq!(owner_voice.index, idx, "cached voice not reused");
}
