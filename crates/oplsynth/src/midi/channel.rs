//! Per-channel MIDI state.
//!
//! One [`MidiChannel`] tracks everything a MIDI channel carries between
//! events: program and bank selection, the continuous controllers the
//! synthesizer reacts to, the RPN/NRPN data-entry machine, the pedal
//! flags, and the map of currently sounding notes. Event interpretation
//! (which controller does what) lives in the synth; this module only holds
//! state and the controller-reset rules.

use crate::bank::Instrument;
use std::collections::BTreeMap;

/// Default channel volume after a reset (GM level 100).
pub const DEFAULT_VOLUME: u8 = 100;

/// Per-channel mod-wheel vibrato LFO, independent of the chip's own
/// hardware vibrato bit.
#[derive(Debug, Clone, Copy)]
pub struct VibratoLfo {
    /// Peak deviation in semitones at full mod wheel.
    pub max_depth: f64,
    /// Oscillation rate in Hz.
    pub rate_hz: f64,
    /// Current phase in radians.
    pub phase: f64,
    /// Seconds the wheel has been nonzero; depth ramps in over the delay.
    pub active_time: f64,
    /// Onset delay in seconds.
    pub delay: f64,
    /// Mod wheel value (CC1).
    pub wheel: u8,
}

impl VibratoLfo {
    pub fn new() -> Self {
        VibratoLfo {
            max_depth: 0.5,
            rate_hz: 5.0,
            phase: 0.0,
            active_time: 0.0,
            delay: 0.0,
            wheel: 0,
        }
    }

    /// Advance the LFO by `dt` seconds.
    pub fn tick(&mut self, dt: f64) {
        if self.wheel == 0 {
            self.phase = 0.0;
            self.active_time = 0.0;
            return;
        }
        self.active_time += dt;
        self.phase = (self.phase + dt * self.rate_hz * std::f64::consts::TAU)
            % std::f64::consts::TAU;
    }

    /// Current pitch offset in semitones.
    pub fn offset(&self) -> f64 {
        if self.wheel == 0 || self.active_time < self.delay {
            return 0.0;
        }
        let depth = self.max_depth * f64::from(self.wheel) / 127.0;
        depth * self.phase.sin()
    }
}

impl Default for VibratoLfo {
    fn default() -> Self {
        Self::new()
    }
}

/// One sounding note on a channel.
#[derive(Debug, Clone)]
pub struct NoteState {
    /// Velocity after the instrument's velocity offset.
    pub velocity: u8,
    /// Polyphonic aftertouch for this key.
    pub aftertouch: u8,
    /// Base tone in semitones (key plus instrument note offset), before
    /// bend and vibrato.
    pub tone: f64,
    /// Note-off arrived while the sustain pedal was down.
    pub sustained: bool,
    /// Key was down when the sostenuto pedal was pressed.
    pub sostenuto_held: bool,
    /// Resolved instrument for this note.
    pub instrument: Instrument,
    /// Chip voice indices serving this note (second entry for 4-op or
    /// pseudo-4-op instruments).
    pub voices: [Option<usize>; 2],
}

/// State of the registered/non-registered parameter machine.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ParamSelect {
    pub msb: u8,
    pub lsb: u8,
    /// The last CC98/99 vs CC100/101 decides which namespace data entry
    /// writes into.
    pub is_nrpn: bool,
}

impl ParamSelect {
    /// Combined 14-bit parameter number.
    pub fn number(&self) -> u16 {
        (u16::from(self.msb) << 7) | u16::from(self.lsb)
    }
}

/// Full state of one MIDI channel.
#[derive(Debug, Clone)]
pub struct MidiChannel {
    pub patch: u8,
    pub bank_msb: u8,
    pub bank_lsb: u8,
    /// Percussion channel by the GM convention (channel 10).
    pub is_drum_default: bool,
    /// GS SysEx drum-part override, when present.
    pub gs_drum_override: Option<bool>,

    pub volume: u8,
    pub expression: u8,
    pub panning: u8,
    pub brightness: u8,
    pub aftertouch: u8,

    /// 14-bit pitch bend centered on zero (-8192..=8191).
    pub pitch_bend: i32,
    /// RPN 0: bend range, semitone part.
    pub bend_semitones: u8,
    /// RPN 0: bend range, cents part.
    pub bend_cents: u8,
    /// RPN 1 fine tuning, centered on zero (-8192..=8191 = -100..+100 cents).
    pub fine_tune: i32,
    /// RPN 2 coarse tuning in semitones.
    pub coarse_tune: i8,

    pub sustain: bool,
    pub sostenuto: bool,
    pub soft_pedal: bool,

    pub portamento_enable: bool,
    pub portamento_time: u8,
    /// Last released key, the glide source for the next portamento note.
    pub portamento_source: Option<u8>,

    /// Mono/poly mode switch (CC126/127). Tracked only; OPL allocation
    /// stays polyphonic.
    pub mono_mode: bool,

    pub vibrato: VibratoLfo,
    pub param: ParamSelect,

    /// Sounding notes by key number.
    pub notes: BTreeMap<u8, NoteState>,
}

impl MidiChannel {
    pub fn new(is_drum_default: bool) -> Self {
        MidiChannel {
            patch: 0,
            bank_msb: 0,
            bank_lsb: 0,
            is_drum_default,
            gs_drum_override: None,
            volume: DEFAULT_VOLUME,
            expression: 127,
            panning: 64,
            brightness: 127,
            aftertouch: 0,
            pitch_bend: 0,
            bend_semitones: 2,
            bend_cents: 0,
            fine_tune: 0,
            coarse_tune: 0,
            sustain: false,
            sostenuto: false,
            soft_pedal: false,
            portamento_enable: false,
            portamento_time: 0,
            portamento_source: None,
            mono_mode: false,
            vibrato: VibratoLfo::new(),
            param: ParamSelect::default(),
            notes: BTreeMap::new(),
        }
    }

    /// Whether the channel plays percussion right now.
    pub fn is_drum(&self) -> bool {
        self.gs_drum_override.unwrap_or(self.is_drum_default)
    }

    /// Pitch bend in semitones, folding in the RPN 0 sensitivity and the
    /// RPN 1/2 tuning.
    pub fn bend_semitones_now(&self) -> f64 {
        let range = f64::from(self.bend_semitones) + f64::from(self.bend_cents) / 100.0;
        let bend = f64::from(self.pitch_bend) / 8192.0 * range;
        bend + f64::from(self.coarse_tune) + f64::from(self.fine_tune) / 8192.0
    }

    /// Full reset to GM power-on defaults, dropping all notes.
    ///
    /// The caller is responsible for silencing the voices the dropped
    /// notes held.
    pub fn reset_full(&mut self) {
        let is_drum_default = self.is_drum_default;
        *self = MidiChannel::new(is_drum_default);
    }

    /// CC121 "reset all controllers".
    ///
    /// Per the MIDI recommendation this resets the performance controllers
    /// but leaves volume, pan, program and bank selection alone.
    pub fn reset_controllers(&mut self) {
        self.expression = 127;
        self.pitch_bend = 0;
        self.aftertouch = 0;
        self.sustain = false;
        self.sostenuto = false;
        self.soft_pedal = false;
        self.vibrato.wheel = 0;
        self.vibrato.phase = 0.0;
        self.param = ParamSelect::default();
        for note in self.notes.values_mut() {
            note.sustained = false;
            note.sostenuto_held = false;
            note.aftertouch = 0;
        }
    }

    /// Data entry MSB (CC6): write the currently selected RPN.
    ///
    /// NRPNs and unknown RPNs are accepted without effect. Returns `true`
    /// when the write changed something audible (so the caller can retune
    /// sounding notes).
    pub fn data_entry_msb(&mut self, value: u8) -> bool {
        if self.param.is_nrpn {
            return false;
        }
        match self.param.number() {
            0x0000 => {
                self.bend_semitones = value & 0x7F;
                true
            }
            0x0001 => {
                // Fine tune MSB: bits 7..13 of the centered value.
                self.fine_tune = (i32::from(value & 0x7F) << 7 | (self.fine_tune + 8192) & 0x7F)
                    - 8192;
                true
            }
            0x0002 => {
                self.coarse_tune = (i32::from(value & 0x7F) - 64) as i8;
                true
            }
            0x3FFF => {
                // RPN null: deselect.
                self.param = ParamSelect::default();
                false
            }
            _ => false,
        }
    }

    /// Data entry LSB (CC38).
    pub fn data_entry_lsb(&mut self, value: u8) -> bool {
        if self.param.is_nrpn {
            return false;
        }
        match self.param.number() {
            0x0000 => {
                self.bend_cents = value & 0x7F;
                true
            }
            0x0001 => {
                let msb_part = (self.fine_tune + 8192) & !0x7F;
                self.fine_tune = (msb_part | i32::from(value & 0x7F)) - 8192;
                true
            }
            _ => false,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let ch = MidiChannel::new(false);
        assert_eq!(ch.volume, 100);
        assert_eq!(ch.expression, 127);
        assert_eq!(ch.panning, 64);
        assert_eq!(ch.bend_semitones, 2);
        assert!(!ch.is_drum());

        let drum = MidiChannel::new(true);
        assert!(drum.is_drum());
    }

    #[test]
    fn test_gs_drum_override() {
        let mut ch = MidiChannel::new(false);
        ch.gs_drum_override = Some(true);
        assert!(ch.is_drum());
        ch.gs_drum_override = Some(false);
        assert!(!ch.is_drum());
    }

    #[test]
    fn test_bend_range_rpn() {
        let mut ch = MidiChannel::new(false);
        ch.param = ParamSelect { msb: 0, lsb: 0, is_nrpn: false };
        assert!(ch.data_entry_msb(12));
        assert_eq!(ch.bend_semitones, 12);
        assert!(ch.data_entry_lsb(50));
        assert_eq!(ch.bend_cents, 50);

        ch.pitch_bend = 8191;
        let semis = ch.bend_semitones_now();
        assert!((semis - 12.5).abs() < 0.01, "got {semis}");
    }

    #[test]
    fn test_nrpn_does_not_touch_rpn_state() {
        let mut ch = MidiChannel::new(false);
        ch.param = ParamSelect { msb: 1, lsb: 8, is_nrpn: true };
        assert!(!ch.data_entry_msb(99));
        assert_eq!(ch.bend_semitones, 2);
    }

    #[test]
    fn test_rpn_null_deselects() {
        let mut ch = MidiChannel::new(false);
        ch.param = ParamSelect { msb: 0x7F, lsb: 0x7F, is_nrpn: false };
        ch.data_entry_msb(5);
        assert_eq!(ch.param, ParamSelect::default());
        assert_eq!(ch.bend_semitones, 2);
    }

    #[test]
    fn test_coarse_tune_centering() {
        let mut ch = MidiChannel::new(false);
        ch.param = ParamSelect { msb: 0, lsb: 2, is_nrpn: false };
        ch.data_entry_msb(66);
        assert_eq!(ch.coarse_tune, 2);
        ch.data_entry_msb(60);
        assert_eq!(ch.coarse_tune, -4);
        assert!((ch.bend_semitones_now() - (-4.0)).abs() < 1e-9);
    }

    #[test]
    fn test_reset_controllers_keeps_mix() {
        let mut ch = MidiChannel::new(false);
        ch.volume = 42;
        ch.panning = 10;
        ch.patch = 30;
        ch.expression = 50;
        ch.sustain = true;
        ch.pitch_bend = 1000;

        ch.reset_controllers();
        assert_eq!(ch.volume, 42);
        assert_eq!(ch.panning, 10);
        assert_eq!(ch.patch, 30);
        assert_eq!(ch.expression, 127);
        assert!(!ch.sustain);
        assert_eq!(ch.pitch_bend, 0);
    }

    #[test]
    fn test_full_reset() {
        let mut ch = MidiChannel::new(true);
        ch.volume = 1;
        ch.gs_drum_override = Some(false);
        ch.reset_full();
        assert_eq!(ch.volume, 100);
        assert!(ch.is_drum(), "drum default must survive a full reset");
        assert_eq!(ch.gs_drum_override, None);
    }

    #[test]
    fn test_vibrato_lfo_delay_and_depth() {
        let mut lfo = VibratoLfo::new();
        lfo.wheel = 127;
        lfo.delay = 0.1;
        lfo.tick(0.05);
        assert_eq!(lfo.offset(), 0.0, "within onset delay");
        lfo.tick(0.1);
        // Phase advanced past the delay; offset now swings.
        let mut saw_nonzero = false;
        for _ in 0..50 {
            lfo.tick(0.005);
            if lfo.offset().abs() > 0.01 {
                saw_nonzero = true;
            }
        }
        assert!(saw_nonzero);
    }
}
