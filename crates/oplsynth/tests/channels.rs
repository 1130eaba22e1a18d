// MIDI channel semantics: pedals, controllers, resets and SysEx, observed
// through the register traffic of a journaled diagnostic chip.

mod common;

use common::{current_fnum_block, fnum_block_to_hz, journaled_synth};
use oplsynth::synth::voice::VoiceState;

#[test]
fn test_note_on_off_cycle() {
    let (mut synth, journal) = journaled_synth(44100);

    synth.rt_note_on(0, 60, 100);
    let (_, _, key_on) = current_fnum_block(&journal, 0).expect("no frequency writes");
    assert!(key_on, "key-on bit missing after note-on");

    synth.rt_note_off(0, 60);
    let (_, _, key_on) = current_fnum_block(&journal, 0).unwrap();
    assert!(!key_on, "key-on bit still set after note-off");
}

#[test]
fn test_sustain_pedal_roundtrip() {
    // Note-on, pedal down, note-off, pedal up: the voice must survive the
    // note-off and fall silent exactly at pedal release.
    let (mut synth, journal) = journaled_synth(44100);

    synth.rt_note_on(0, 60, 100);
    synth.rt_controller_change(0, 64, 127);
    synth.rt_note_off(0, 60);

    let (_, _, key_on) = current_fnum_block(&journal, 0).unwrap();
    assert!(key_on, "sustained voice was keyed off");
    let sustained = synth
        .describe_voices()
        .iter()
        .filter(|v| v.state == VoiceState::Sustained)
        .count();
    assert_eq!(sustained, 1);

    synth.rt_controller_change(0, 64, 0);
    let (_, _, key_on) = current_fnum_block(&journal, 0).unwrap();
    assert!(!key_on, "pedal lift must release the note");
    assert!(synth.describe_voices().iter().all(|v| v.owner.is_none()));
}

#[test]
fn test_sustain_releases_only_deferred_notes() {
    let (mut synth, journal) = journaled_synth(44100);

    // First note held by hand, second deferred by the pedal.
    synth.rt_note_on(0, 60, 100);
    synth.rt_controller_change(0, 64, 127);
    synth.rt_note_on(0, 64, 100);
    synth.rt_note_off(0, 64);

    synth.rt_controller_change(0, 64, 0);

    // Key 60 must still sound; exactly one voice remains keyed on.
    let on: Vec<_> = synth
        .describe_voices()
        .into_iter()
        .filter(|v| v.state == VoiceState::On)
        .collect();
    assert_eq!(on.len(), 1);
    assert_eq!(on[0].owner.unwrap().key, 60);
    let _ = journal;
}

#[test]
fn test_sostenuto_captures_only_held_keys() {
    let (mut synth, _journal) = journaled_synth(44100);

    synth.rt_note_on(0, 60, 100);
    synth.rt_controller_change(0, 66, 127); // sostenuto down: captures 60
    synth.rt_note_on(0, 64, 100); // struck after the pedal press

    synth.rt_note_off(0, 60);
    synth.rt_note_off(0, 64);

    // 60 is held by sostenuto, 64 released normally.
    let states: Vec<_> = synth
        .describe_voices()
        .into_iter()
        .filter(|v| v.owner.is_some())
        .collect();
    assert_eq!(states.len(), 1);
    assert_eq!(states[0].owner.unwrap().key, 60);
    assert_eq!(states[0].state, VoiceState::Sustained);

    synth.rt_controller_change(0, 66, 0);
    assert!(synth.describe_voices().iter().all(|v| v.owner.is_none()));
}

#[test]
fn test_pitch_bend_retunes_sounding_note() {
    // Full positive bend with the default 2-semitone range lands on
    // note 62 within the model's quantization.
    let (mut synth, journal) = journaled_synth(44100);

    synth.rt_note_on(0, 60, 100);
    let (fnum, block, _) = current_fnum_block(&journal, 0).unwrap();
    let base_hz = fnum_block_to_hz(fnum, block);

    synth.rt_pitch_bend(0, 16383);
    let (fnum, block, key_on) = current_fnum_block(&journal, 0).unwrap();
    assert!(key_on, "retune must not key off");
    let bent_hz = fnum_block_to_hz(fnum, block);

    let ratio = bent_hz / base_hz;
    let expected = 2f64.powf(2.0 / 12.0);
    assert!(
        (ratio - expected).abs() < 0.02,
        "bend ratio {ratio}, expected {expected}"
    );
}

#[test]
fn test_bend_range_rpn_widens_bend() {
    let (mut synth, journal) = journaled_synth(44100);

    // RPN 0 -> 12 semitones.
    synth.rt_controller_change(0, 101, 0);
    synth.rt_controller_change(0, 100, 0);
    synth.rt_controller_change(0, 6, 12);

    synth.rt_note_on(0, 48, 100);
    let (fnum, block, _) = current_fnum_block(&journal, 0).unwrap();
    let base_hz = fnum_block_to_hz(fnum, block);

    synth.rt_pitch_bend(0, 16383);
    let (fnum, block, _) = current_fnum_block(&journal, 0).unwrap();
    let ratio = fnum_block_to_hz(fnum, block) / base_hz;
    assert!(
        (ratio - 2.0).abs() < 0.05,
        "12-semitone bend should double the pitch, got {ratio}"
    );
}

#[test]
fn test_gm_reset_restores_defaults() {
    let (mut synth, _journal) = journaled_synth(44100);

    for ch in 0..16u8 {
        synth.rt_controller_change(ch, 7, 20);
        synth.rt_controller_change(ch, 10, 0);
        synth.rt_controller_change(ch, 11, 5);
        synth.rt_controller_change(ch, 0, 8);
        synth.rt_patch_change(ch, 70);
        synth.rt_pitch_bend(ch, 0);
        synth.rt_controller_change(ch, 64, 127);
        synth.rt_note_on(ch, 60, 90);
    }

    synth.rt_system_exclusive(&[0xF0, 0x7E, 0x7F, 0x09, 0x01, 0xF7]);

    for ch in 0..16usize {
        let c = synth.channel(ch);
        assert_eq!(c.panning, 64);
        assert_eq!(c.volume, 100);
        assert_eq!(c.expression, 127);
        assert_eq!(c.bank_msb, 0);
        assert_eq!(c.bank_lsb, 0);
        assert_eq!(c.patch, 0);
        assert_eq!(c.is_drum(), ch == 9);
        assert_eq!(c.pitch_bend, 0);
        assert!(!c.sustain);
        assert!(c.notes.is_empty());
    }
    assert!(synth.describe_voices().iter().all(|v| v.owner.is_none()));
}

#[test]
fn test_gs_drum_part_sysex() {
    let (mut synth, _journal) = journaled_synth(44100);

    // Part 2 (channel 1) becomes a drum part.
    synth.rt_system_exclusive(&[
        0xF0, 0x41, 0x10, 0x42, 0x12, 0x40, 0x12, 0x15, 0x01, 0x00, 0xF7,
    ]);
    assert!(synth.channel(1).is_drum());

    // And back to melodic.
    synth.rt_system_exclusive(&[
        0xF0, 0x41, 0x10, 0x42, 0x12, 0x40, 0x12, 0x15, 0x00, 0x00, 0xF7,
    ]);
    assert!(!synth.channel(1).is_drum());
}

#[test]
fn test_master_volume_sysex_attenuates() {
    let (mut synth, journal) = journaled_synth(44100);

    synth.rt_note_on(0, 60, 100);
    let loud = common::last_write(&journal, 0x43).expect("carrier TL write").value & 0x3F;

    synth.rt_system_exclusive(&[0xF0, 0x7F, 0x7F, 0x04, 0x01, 0x00, 0x20, 0xF7]);
    let quiet = common::last_write(&journal, 0x43).unwrap().value & 0x3F;
    assert!(
        quiet > loud,
        "master volume drop must raise carrier attenuation ({loud} -> {quiet})"
    );
}

#[test]
fn test_unknown_sysex_preserves_rpn_state() {
    let (mut synth, _journal) = journaled_synth(44100);

    synth.rt_controller_change(0, 101, 0);
    synth.rt_controller_change(0, 100, 0);
    synth.rt_system_exclusive(&[0xF0, 0x7D, 0x01, 0x02, 0x03, 0xF7]);
    synth.rt_controller_change(0, 6, 7);
    assert_eq!(synth.channel(0).bend_semitones, 7);
}

#[test]
fn test_all_notes_off_honors_sustain() {
    let (mut synth, journal) = journaled_synth(44100);

    synth.rt_note_on(0, 60, 100);
    synth.rt_controller_change(0, 64, 127);
    synth.rt_controller_change(0, 123, 0);

    let (_, _, key_on) = current_fnum_block(&journal, 0).unwrap();
    assert!(key_on, "CC123 must defer to the sustain pedal");

    synth.rt_controller_change(0, 120, 0);
    let (_, _, key_on) = current_fnum_block(&journal, 0).unwrap();
    assert!(!key_on, "CC120 is a hard stop");
}

#[test]
fn test_velocity_zero_is_note_off() {
    let (mut synth, journal) = journaled_synth(44100);
    synth.rt_note_on(0, 60, 100);
    synth.rt_note_on(0, 60, 0);
    let (_, _, key_on) = current_fnum_block(&journal, 0).unwrap();
    assert!(!key_on);
}

#[test]
fn test_xg_reset_enables_drum_bank_msb() {
    let (mut synth, _journal) = journaled_synth(44100);
    synth.rt_system_exclusive(&[0xF0, 0x43, 0x10, 0x4C, 0x00, 0x00, 0x7E, 0x00, 0xF7]);

    // Bank MSB 127 on a melodic channel now selects percussion: key 40
    // resolves against the drum bank and plays its fixed key.
    synth.rt_controller_change(3, 0, 0x7F);
    synth.rt_note_on(3, 40, 100);
    let voices: Vec<_> = synth
        .describe_voices()
        .into_iter()
        .filter(|v| v.owner.is_some())
        .collect();
    assert_eq!(voices.len(), 1);
    assert_eq!(voices[0].owner.unwrap().channel, 3);
}
