//! Multi-chip register frontend.
//!
//! Owns the chip array and every per-voice register cache, enforces the
//! OPL3 channel layout (regular, 4-op pairs, rhythm slots) and translates
//! voice indices into concrete register addresses. All MIDI semantics stay
//! above this layer; everything below `note_on`/`touch_note`/`set_patch`
//! speaks raw chip registers.
//!
//! # Voice layout
//!
//! Each chip contributes 23 voice slots: 18 tone channels (9 on OPL2) plus
//! 5 virtual rhythm-mode voices. The rhythm voices borrow the operators of
//! tone channels 6..8:
//!
//! - bass drum: 0xBD bit 0x10, operators 12+15, pitch from channel 6
//! - snare:     0xBD bit 0x08, operator 16, pitch from channel 7
//! - tom-tom:   0xBD bit 0x04, operator 14, pitch from channel 8
//! - cymbal:    0xBD bit 0x02, operator 17
//! - hi-hat:    0xBD bit 0x01, operator 13
//!
//! In CMF music mode the snare and cymbal operator assignments are swapped
//! (an alternate map is selected per write).

use crate::bank::Timbre;
use crate::chip::emulator::{ChipEmulator, ChipType, EmulatorId, EmulatorRegistry};
use crate::error::SynthError;
use crate::model::{
    FreqModel, VoiceMode, VolumeContext, VolumeModel, VolumeModelId, xg_brightness_to_opl,
};

/// Voice slots per chip: 18 tone channels plus 5 rhythm voices.
pub const CHANNELS_PER_CHIP: usize = 23;
/// First rhythm voice index within a chip.
pub const RHYTHM_BASE: usize = 18;
/// Tone channels available on an OPL2 chip.
pub const OPL2_CHANNELS: usize = 9;
/// Number of rhythm-mode voices.
pub const RHYTHM_CHANNELS: usize = 5;

/// Marker for "no operator at this slot" in the register maps.
const NO_OPERATOR: u16 = 0xFFF;

/// Per-voice operator register offsets (two per voice). The trailing ten
/// entries are the CMF alternate rhythm map with snare/cymbal operators
/// swapped.
const OPERATORS_MAP: [u16; (CHANNELS_PER_CHIP + RHYTHM_CHANNELS) * 2] = [
    // Channels 0-2
    0x000, 0x003, 0x001, 0x004, 0x002, 0x005,
    // Channels 3-5
    0x008, 0x00B, 0x009, 0x00C, 0x00A, 0x00D,
    // Channels 6-8
    0x010, 0x013, 0x011, 0x014, 0x012, 0x015,
    // Channels 9-17 (second register bank)
    0x100, 0x103, 0x101, 0x104, 0x102, 0x105,
    0x108, 0x10B, 0x109, 0x10C, 0x10A, 0x10D,
    0x110, 0x113, 0x111, 0x114, 0x112, 0x115,
    // Rhythm voices 18-22: bass, snare, tom, cymbal, hi-hat
    0x010, 0x013,
    NO_OPERATOR, 0x014,
    0x012, NO_OPERATOR,
    NO_OPERATOR, 0x015,
    0x011, NO_OPERATOR,
    // Same five in CMF mode: snare and cymbal operators swapped
    0x010, 0x013,
    0x014, NO_OPERATOR,
    0x012, NO_OPERATOR,
    0x015, NO_OPERATOR,
    0x011, NO_OPERATOR,
];

/// Per-voice channel register offsets (for 0xA0/0xB0). The hi-hat and
/// cymbal use the tom-tom's channel as their pitch source.
const CHANNELS_MAP: [u16; CHANNELS_PER_CHIP] = [
    0x000, 0x001, 0x002, 0x003, 0x004, 0x005, 0x006, 0x007, 0x008,
    0x100, 0x101, 0x102, 0x103, 0x104, 0x105, 0x106, 0x107, 0x108,
    0x006, 0x007, 0x008, 0x008, 0x008,
];

/// Channel offsets for panning writes; the cymbal and hi-hat voices have
/// no pan support.
const CHANNELS_MAP_PAN: [u16; CHANNELS_PER_CHIP] = [
    0x000, 0x001, 0x002, 0x003, 0x004, 0x005, 0x006, 0x007, 0x008,
    0x100, 0x101, 0x102, 0x103, 0x104, 0x105, 0x106, 0x107, 0x108,
    0x006, 0x007, 0x008, NO_OPERATOR, NO_OPERATOR,
];

/// Channel offsets for feedback/connection writes; only the bass drum
/// among the rhythm voices owns a connection byte.
const CHANNELS_MAP_FBCONN: [u16; CHANNELS_PER_CHIP] = [
    0x000, 0x001, 0x002, 0x003, 0x004, 0x005, 0x006, 0x007, 0x008,
    0x100, 0x101, 0x102, 0x103, 0x104, 0x105, 0x106, 0x107, 0x108,
    0x006, NO_OPERATOR, NO_OPERATOR, NO_OPERATOR, NO_OPERATOR,
];

const PANNING_LEFT: u8 = 0x10;
const PANNING_RIGHT: u8 = 0x20;
const PANNING_BOTH: u8 = 0x30;

/// Role a voice slot plays under the current layout.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum VoiceCategory {
    /// Freely allocatable 2-op tone channel.
    Regular,
    /// First half of a 4-op pair.
    FourOpFirst,
    /// Second half of a 4-op pair; moves with its first half.
    FourOpSecond,
    /// Tone channel whose operators are loaned to the rhythm section.
    RhythmShadow,
    RhythmBass,
    RhythmSnare,
    RhythmTom,
    RhythmCymbal,
    RhythmHiHat,
    /// Not usable under the current chip type or layout.
    Disabled,
}

impl VoiceCategory {
    pub fn is_rhythm(self) -> bool {
        matches!(
            self,
            VoiceCategory::RhythmBass
                | VoiceCategory::RhythmSnare
                | VoiceCategory::RhythmTom
                | VoiceCategory::RhythmCymbal
                | VoiceCategory::RhythmHiHat
        )
    }
}

/// Source dialect driving the synthesizer.
///
/// CMF selects the alternate rhythm operator map; CMF, IMF and RSXX also
/// lock the bank-level setup against runtime changes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum MusicMode {
    #[default]
    Midi,
    Cmf,
    Imf,
    Rsxx,
}

/// The multi-chip register frontend.
pub struct ChipFrontend {
    chips: Vec<Box<dyn ChipEmulator>>,
    chip_type: ChipType,
    num_chips: usize,
    num_four_ops: u32,
    rhythm_mode: bool,
    deep_tremolo: bool,
    deep_vibrato: bool,
    soft_pan_sup: bool,
    soft_pan: bool,
    scale_modulators: bool,
    full_range_brightness: bool,
    music_mode: MusicMode,
    master_volume: u8,
    volume_model_id: VolumeModelId,
    freq_model: FreqModel,
    volume_model: VolumeModel,
    per_chip_channels: usize,
    num_voices: usize,

    categories: Vec<VoiceCategory>,
    /// Last patch written to each voice.
    ins_cache: Vec<Timbre>,
    /// Voice had its operator 0x20 bytes overridden by a MULT bump.
    ins_cache_dirty: Vec<bool>,
    /// High byte of the last 0xB0 write per voice (key bit included).
    key_block_cache: Vec<u8>,
    /// Last TL pair written per voice, for redundant-write suppression.
    tl_cache: Vec<Option<(u8, u8)>>,
    /// Voice already slammed silent by `silence_all`.
    silenced: Vec<bool>,
    /// Cached 0xBD value per chip.
    reg_bd: Vec<u8>,
    /// Cached pan bits per voice.
    reg_c0: Vec<u8>,

    cur_emulator: Option<EmulatorId>,
    cur_rate: u32,
}

impl std::fmt::Debug for ChipFrontend {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ChipFrontend")
            .field("num_chips", &self.num_chips)
            .field("chip_type", &self.chip_type)
            .field("num_four_ops", &self.num_four_ops)
            .field("rhythm_mode", &self.rhythm_mode)
            .field("num_voices", &self.num_voices)
            .finish()
    }
}

impl ChipFrontend {
    pub fn new() -> Self {
        ChipFrontend {
            chips: Vec::new(),
            chip_type: ChipType::Opl3,
            num_chips: 1,
            num_four_ops: 0,
            rhythm_mode: false,
            deep_tremolo: false,
            deep_vibrato: false,
            soft_pan_sup: false,
            soft_pan: false,
            scale_modulators: false,
            full_range_brightness: false,
            music_mode: MusicMode::Midi,
            master_volume: 127,
            volume_model_id: VolumeModelId::Generic,
            freq_model: FreqModel::Generic,
            volume_model: VolumeModel::Generic,
            per_chip_channels: RHYTHM_BASE,
            num_voices: 0,
            categories: Vec::new(),
            ins_cache: Vec::new(),
            ins_cache_dirty: Vec::new(),
            key_block_cache: Vec::new(),
            tl_cache: Vec::new(),
            silenced: Vec::new(),
            reg_bd: Vec::new(),
            reg_c0: Vec::new(),
            cur_emulator: None,
            cur_rate: 0,
        }
    }

    // -- accessors ---------------------------------------------------------

    pub fn num_voices(&self) -> usize {
        self.num_voices
    }

    pub fn num_chips(&self) -> usize {
        self.num_chips
    }

    pub fn chip_type(&self) -> ChipType {
        self.chip_type
    }

    pub fn category(&self, voice: usize) -> VoiceCategory {
        self.categories[voice]
    }

    pub fn rhythm_mode(&self) -> bool {
        self.rhythm_mode
    }

    pub fn music_mode(&self) -> MusicMode {
        self.music_mode
    }

    pub fn set_music_mode(&mut self, mode: MusicMode) {
        self.music_mode = mode;
    }

    pub fn master_volume(&self) -> u8 {
        self.master_volume
    }

    pub fn set_master_volume(&mut self, volume: u8) {
        self.master_volume = volume & 0x7F;
    }

    pub fn set_scale_modulators(&mut self, on: bool) {
        self.scale_modulators = on;
    }

    /// Linear 0..=127 brightness instead of the nonlinear XG curve.
    pub fn set_full_range_brightness(&mut self, on: bool) {
        self.full_range_brightness = on;
    }

    pub fn soft_pan_enabled(&self) -> bool {
        self.soft_pan && self.soft_pan_sup
    }

    pub fn set_soft_pan(&mut self, on: bool) {
        self.soft_pan = on;
    }

    pub fn set_deep_tremolo(&mut self, on: bool) {
        self.deep_tremolo = on;
    }

    pub fn set_deep_vibrato(&mut self, on: bool) {
        self.deep_vibrato = on;
    }

    pub fn deep_tremolo(&self) -> bool {
        self.deep_tremolo
    }

    pub fn deep_vibrato(&self) -> bool {
        self.deep_vibrato
    }

    pub fn set_rhythm_mode(&mut self, on: bool) {
        self.rhythm_mode = on;
    }

    pub fn num_four_ops(&self) -> u32 {
        self.num_four_ops
    }

    pub fn set_num_four_ops(&mut self, n: u32) {
        self.num_four_ops = n;
    }

    pub fn volume_model_id(&self) -> VolumeModelId {
        self.volume_model_id
    }

    /// Select the volume model; the paired frequency model follows.
    pub fn set_volume_model(&mut self, id: VolumeModelId) {
        self.volume_model_id = id;
        let (freq, volume) = id.resolve();
        self.freq_model = freq;
        self.volume_model = volume;
    }

    pub fn freq_model(&self) -> FreqModel {
        self.freq_model
    }

    /// Cached 0xBD register value for a chip.
    pub fn reg_bd(&self, chip: usize) -> u8 {
        self.reg_bd[chip]
    }

    /// Whether the cached key-block byte of a voice has the key-on bit set.
    pub fn key_on_bit(&self, voice: usize) -> bool {
        (self.key_block_cache[voice] & 0x20) != 0
    }

    // -- chip management ---------------------------------------------------

    fn write_reg(&mut self, chip: usize, address: u16, value: u8) {
        self.chips[chip].write_reg(address, value);
    }

    fn write_pan_reg(&mut self, chip: usize, address: u16, value: u8) {
        self.chips[chip].write_pan(address, value);
    }

    /// Rebuild or reuse the chip array and re-apply the whole layout.
    ///
    /// Chips are rebuilt only when the emulator id or chip count changed;
    /// a bare sample-rate change re-rates the existing chips. Either way
    /// every voice ends silent and every cache reset.
    pub fn reset(
        &mut self,
        registry: &EmulatorRegistry,
        emulator: EmulatorId,
        num_chips: usize,
        sample_rate: u32,
    ) -> Result<(), SynthError> {
        if num_chips == 0 {
            return Err(SynthError::BadConfiguration("chip count is zero".into()));
        }
        if sample_rate == 0 {
            return Err(SynthError::BadConfiguration("sample rate is zero".into()));
        }
        if !registry.contains(emulator) {
            return Err(SynthError::OutOfResources(format!("{emulator:?}")));
        }

        let rebuild_needed =
            self.cur_emulator != Some(emulator) || self.num_chips != num_chips
                || self.chips.is_empty();

        if rebuild_needed {
            self.chips.clear();
            for _ in 0..num_chips {
                let chip = registry
                    .build(emulator, sample_rate)
                    .ok_or_else(|| SynthError::OutOfResources(format!("{emulator:?}")))?;
                self.chips.push(chip);
            }
        } else {
            // Keep the chips, but never smear sustaining notes across a
            // rate change.
            self.silence_all();
            let new_rate = self.cur_rate != sample_rate;
            for chip in &mut self.chips {
                if new_rate {
                    chip.set_rate(sample_rate);
                }
            }
        }

        self.num_chips = num_chips;
        self.cur_emulator = Some(emulator);
        self.cur_rate = sample_rate;
        self.num_voices = num_chips * CHANNELS_PER_CHIP;

        self.categories = vec![VoiceCategory::Regular; self.num_voices];
        self.ins_cache = vec![Timbre::DEFAULT; self.num_voices];
        self.ins_cache_dirty = vec![false; self.num_voices];
        self.key_block_cache = vec![0; self.num_voices];
        self.tl_cache = vec![None; self.num_voices];
        self.silenced = vec![false; self.num_voices];
        self.reg_bd = vec![0; num_chips];
        self.reg_c0 = vec![PANNING_BOTH; self.num_voices];

        for chip in 0..num_chips {
            self.init_chip(chip);
        }

        self.update_channel_categories();
        self.silence_all();
        Ok(())
    }

    /// Write the chip bring-up sequence and probe capabilities.
    fn init_chip(&mut self, chip: usize) {
        const DATA_OPL3: [(u16, u8); 8] = [
            (0x004, 96),
            (0x004, 128), // pulse timer
            (0x105, 0),
            (0x105, 1),
            (0x105, 0), // pulse OPL3 enable
            (0x001, 32),
            (0x105, 1), // enable waveforms, OPL3 extensions
            (0x008, 0), // CSW / note select
        ];
        const DATA_OPL2: [(u16, u8); 4] = [
            (0x004, 96),
            (0x004, 128),
            (0x001, 32),
            (0x008, 0),
        ];

        if chip == 0 {
            self.soft_pan_sup = self.chips[0].has_full_panning();
            self.chip_type = self.chips[0].chip_type();
            self.per_chip_channels = RHYTHM_BASE;

            if self.chip_type == ChipType::Opl2 {
                self.per_chip_channels = OPL2_CHANNELS;
                self.num_four_ops = 0; // no 4-op pairs on OPL2
            }
        }

        // Flush any junk the emulator may hold in the tone channels.
        for a in 0..self.per_chip_channels {
            self.write_reg(chip, 0x20 + OPERATORS_MAP[a * 2], 0x00);
            self.write_reg(chip, 0x20 + OPERATORS_MAP[a * 2 + 1], 0x00);
            self.write_reg(chip, 0xA0 + CHANNELS_MAP[a], 0x00);
            self.write_reg(chip, 0xB0 + CHANNELS_MAP[a], 0x00);
        }

        let sequence: &[(u16, u8)] = if self.chip_type == ChipType::Opl2 {
            &DATA_OPL2
        } else {
            &DATA_OPL3
        };
        for &(addr, value) in sequence {
            self.write_reg(chip, addr, value);
        }
    }

    /// Recompute every voice's category and commit the global layout
    /// registers (0xBD deep/rhythm flags, 0x104 4-op enable mask).
    pub fn update_channel_categories(&mut self) {
        let max_fours = self.num_chips as u32 * 6;
        if self.num_four_ops > max_fours {
            self.num_four_ops = max_fours;
        }

        let fours = if self.chip_type != ChipType::Opl2 {
            self.num_four_ops
        } else {
            0
        };

        let mut fours_left = fours;
        for chip in 0..self.num_chips {
            self.reg_bd[chip] = (self.deep_tremolo as u8) * 0x80
                + (self.deep_vibrato as u8) * 0x40
                + (self.rhythm_mode as u8) * 0x20;
            let bd = self.reg_bd[chip];
            self.write_reg(chip, 0x0BD, bd);

            let fours_this_chip = fours_left.min(6);
            if self.chip_type != ChipType::Opl2 {
                self.write_reg(chip, 0x104, ((1u16 << fours_this_chip) - 1) as u8);
            }
            fours_left -= fours_this_chip;
        }

        let mut p = 0;
        for _chip in 0..self.num_chips {
            for b in 0..RHYTHM_BASE {
                self.categories[p] = if self.chip_type == ChipType::Opl2 && b >= OPL2_CHANNELS {
                    VoiceCategory::Disabled
                } else {
                    VoiceCategory::Regular
                };
                if self.rhythm_mode && (6..9).contains(&b) {
                    self.categories[p] = VoiceCategory::RhythmShadow;
                }
                p += 1;
            }

            if self.rhythm_mode {
                for cat in [
                    VoiceCategory::RhythmBass,
                    VoiceCategory::RhythmSnare,
                    VoiceCategory::RhythmTom,
                    VoiceCategory::RhythmCymbal,
                    VoiceCategory::RhythmHiHat,
                ] {
                    self.categories[p] = cat;
                    p += 1;
                }
            } else {
                for _ in 0..RHYTHM_CHANNELS {
                    self.categories[p] = VoiceCategory::Disabled;
                    p += 1;
                }
            }
        }

        // Walk the fixed interleave: pairs 0-2/3-5 then 9-11/12-14, per
        // chip, up to six pairs each.
        let mut nextfour = 0usize;
        for a in 0..fours {
            self.categories[nextfour] = VoiceCategory::FourOpFirst;
            self.categories[nextfour + 3] = VoiceCategory::FourOpSecond;
            nextfour += match a % 6 {
                0 | 1 => 1,
                2 => 9 - 2,
                3 | 4 => 1,
                5 => CHANNELS_PER_CHIP - 9 - 2,
                _ => unreachable!(),
            };
        }
    }

    /// Re-commit the 0xBD deep tremolo/vibrato/rhythm flags on every chip.
    pub fn commit_deep_flags(&mut self) {
        for chip in 0..self.num_chips {
            self.reg_bd[chip] = (self.deep_tremolo as u8) * 0x80
                + (self.deep_vibrato as u8) * 0x40
                + (self.rhythm_mode as u8) * 0x20;
            let bd = self.reg_bd[chip];
            self.write_reg(chip, 0x0BD, bd);
        }
    }

    // -- per-voice operations ---------------------------------------------

    /// Operator register offsets for a voice, honoring the CMF alternate
    /// rhythm map.
    fn operator_addrs(&self, cc: usize) -> (u16, u16) {
        let cmf_offset = if self.music_mode == MusicMode::Cmf && cc >= RHYTHM_BASE {
            RHYTHM_CHANNELS * 2
        } else {
            0
        };
        (
            OPERATORS_MAP[cc * 2 + cmf_offset],
            OPERATORS_MAP[cc * 2 + 1 + cmf_offset],
        )
    }

    /// Release the key of a voice.
    ///
    /// For rhythm voices this clears the slot's bit in the chip's 0xBD;
    /// for tone voices it rewrites the cached key-block byte with the
    /// key-on bit cleared. Skips the write when the key is already up.
    pub fn note_off(&mut self, voice: usize) {
        let chip = voice / CHANNELS_PER_CHIP;
        let cc = voice % CHANNELS_PER_CHIP;

        if cc >= RHYTHM_BASE {
            if self.rhythm_mode {
                let mask = 0x10 >> (cc - RHYTHM_BASE);
                if (self.reg_bd[chip] & mask) != 0 {
                    self.reg_bd[chip] &= !mask;
                    let bd = self.reg_bd[chip];
                    self.write_reg(chip, 0xBD, bd);
                }
            }
            return;
        }

        if self.chip_type == ChipType::Opl2 && cc >= OPL2_CHANNELS {
            return;
        }

        if (self.key_block_cache[voice] & 0x20) == 0 {
            return; // already keyed off
        }
        self.key_block_cache[voice] &= 0xDF;
        let value = self.key_block_cache[voice];
        self.write_reg(chip, 0xB0 + CHANNELS_MAP[cc], value);
    }

    /// Key a voice on at the given effective tone.
    ///
    /// `voice2` names the paired/second voice whose patch supplies the
    /// third and fourth operators of a natural 4-op note; pass the voice
    /// itself for plain 2-op notes. The active frequency model translates
    /// the tone; a `MULT` bump is applied to the operator 0x20 bytes when
    /// the pitch exceeds Block 7.
    pub fn note_on(&mut self, voice: usize, voice2: usize, tone: f64) {
        let chip = voice / CHANNELS_PER_CHIP;
        let cc1 = voice % CHANNELS_PER_CHIP;
        let cc2 = voice2 % CHANNELS_PER_CHIP;
        let chan2 = if voice2 < self.num_voices { voice2 } else { 0 };

        let tone = if tone < 0.0 { 0.0 } else { tone };
        let kb = self.freq_model.key_block(tone);
        let mut mul_offset = kb.mul_offset;
        let mut ftone = kb.fnum_block;

        let chn = if self.music_mode == MusicMode::Cmf {
            CHANNELS_MAP_PAN[cc1]
        } else {
            CHANNELS_MAP[cc1]
        };

        if cc1 < RHYTHM_BASE {
            ftone |= 0x2000; // key-on

            let natural_4op = self.categories[voice] == VoiceCategory::FourOpFirst;
            let ops_count = if natural_4op { 4 } else { 2 };
            let (o1a, o1b) = self.operator_addrs(cc1);
            let (o2a, o2b) = self.operator_addrs(cc2);
            let op_addr = [o1a, o1b, o2a, o2b];
            let patch1 = self.ins_cache[voice];
            let patch2 = self.ins_cache[chan2];
            let ops = [
                patch1.modulator_e862 & 0xFF,
                patch1.carrier_e862 & 0xFF,
                patch2.modulator_e862 & 0xFF,
                patch2.carrier_e862 & 0xFF,
            ];

            for op in 0..ops_count {
                if op_addr[op] == NO_OPERATOR {
                    continue;
                }
                let mod_idx = if op > 1 { chan2 } else { voice };

                if mul_offset > 0 {
                    let dt = ops[op] & 0xF0;
                    let mut mul = ops[op] & 0x0F;
                    if mul + mul_offset > 0x0F {
                        mul_offset = 0;
                        mul = 0x0F;
                    }
                    self.write_reg(chip, 0x20 + op_addr[op], (dt | (mul + mul_offset)) as u8);
                    self.ins_cache_dirty[mod_idx] = true;
                } else if self.ins_cache_dirty[mod_idx] {
                    self.write_reg(chip, 0x20 + op_addr[op], ops[op] as u8);
                    self.ins_cache_dirty[mod_idx] = false;
                }
            }
        }

        if chn != NO_OPERATOR {
            self.write_reg(chip, 0xA0 + chn, (ftone & 0xFF) as u8);
            self.write_reg(chip, 0xB0 + chn, ((ftone >> 8) & 0xFF) as u8);
            self.key_block_cache[voice] = (ftone >> 8) as u8;
        }

        if self.rhythm_mode && cc1 >= RHYTHM_BASE {
            self.reg_bd[chip] |= 0x10 >> (cc1 - RHYTHM_BASE);
            let bd = self.reg_bd[chip];
            self.write_reg(chip, 0x0BD, bd);
        }

        self.silenced[voice] = false;
    }

    /// Retune a sounding voice without touching the key state.
    pub fn retune_note(&mut self, voice: usize, voice2: usize, tone: f64) {
        // The key-on bit is part of the cached high byte, so a plain
        // note_on rewrite keeps the envelope running.
        self.note_on(voice, voice2, tone);
    }

    /// Recompute and write the operator TL bytes for a voice.
    pub fn touch_note(
        &mut self,
        voice: usize,
        velocity: u8,
        channel_volume: u8,
        expression: u8,
        brightness: u8,
        is_drum: bool,
    ) {
        let chip = voice / CHANNELS_PER_CHIP;
        let cc = voice % CHANNELS_PER_CHIP;
        let patch = self.ins_cache[voice];
        let (o1, o2) = self.operator_addrs(cc);

        if self.chip_type == ChipType::Opl2 && self.categories[voice] == VoiceCategory::Disabled {
            return;
        }

        let ksl_mod = patch.modulator_40 & 0xC0;
        let ksl_car = patch.carrier_40 & 0xC0;

        let mut voice_mode = VoiceMode::TwoOpAm;
        match self.categories[voice] {
            VoiceCategory::Regular | VoiceCategory::RhythmBass => {
                voice_mode = VoiceMode::from_raw(patch.feedconn & 1);
            }
            VoiceCategory::FourOpFirst => {
                let i1 = self.ins_cache[voice + 3];
                let raw = 2 + (patch.feedconn & 1) + (i1.feedconn & 1) * 2;
                voice_mode = VoiceMode::from_raw(raw);
            }
            VoiceCategory::FourOpSecond => {
                let i0 = self.ins_cache[voice - 3];
                let raw = 6 + (i0.feedconn & 1) + (patch.feedconn & 1) * 2;
                voice_mode = VoiceMode::from_raw(raw);
            }
            _ => {}
        }

        let (do_mod, do_car) = voice_mode.do_ops();
        let mut ctx = VolumeContext {
            velocity: velocity & 0x7F,
            channel_volume: channel_volume & 0x7F,
            expression: expression & 0x7F,
            master_volume: self.master_volume & 0x7F,
            voice_mode,
            feedconn: patch.feedconn,
            tl_mod: patch.modulator_40 & 0x3F,
            tl_car: patch.carrier_40 & 0x3F,
            do_modulator: do_mod || self.scale_modulators,
            do_carrier: do_car || self.scale_modulators,
            is_drum,
        };

        self.volume_model.apply(&mut ctx);

        let mut brightness = u32::from(brightness);
        if brightness != 127 && !is_drum {
            brightness = if self.full_range_brightness {
                brightness / 2
            } else {
                xg_brightness_to_opl(brightness)
            };

            if !ctx.do_modulator {
                ctx.tl_mod =
                    (63 - brightness + (brightness * u32::from(ctx.tl_mod)) / 63) as u8;
            }
            if !ctx.do_carrier {
                ctx.tl_car =
                    (63 - brightness + (brightness * u32::from(ctx.tl_car)) / 63) as u8;
            }
        }

        let modulator = ksl_mod | (ctx.tl_mod & 63);
        let carrier = ksl_car | (ctx.tl_car & 63);

        if self.tl_cache[voice] == Some((modulator, carrier)) {
            return;
        }
        self.tl_cache[voice] = Some((modulator, carrier));

        if o1 != NO_OPERATOR {
            self.write_reg(chip, 0x40 + o1, modulator);
        }
        if o2 != NO_OPERATOR {
            self.write_reg(chip, 0x40 + o2, carrier);
        }
        self.silenced[voice] = false;
    }

    /// Write a timbre's operator and connection registers to a voice.
    ///
    /// Idempotent: a voice already carrying the same timbre is skipped.
    pub fn set_patch(&mut self, voice: usize, timbre: &Timbre) {
        if self.ins_cache[voice] == *timbre && !self.ins_cache_dirty[voice] {
            return; // already up to date
        }

        self.ins_cache[voice] = *timbre;
        self.ins_cache_dirty[voice] = false;
        self.tl_cache[voice] = None;
        self.silenced[voice] = false;

        let chip = voice / CHANNELS_PER_CHIP;
        let cc = voice % CHANNELS_PER_CHIP;
        let (o1, o2) = self.operator_addrs(cc);

        let dmx_model = matches!(
            self.volume_model,
            VolumeModel::DmxOrig | VolumeModel::DmxFixed
        );
        if self.categories[voice] == VoiceCategory::Regular && dmx_model {
            // Seed the level registers with the bank TL; the DMX volume
            // model overwrites them at key-on.
            if o1 != NO_OPERATOR {
                self.write_reg(chip, 0x40 + o1, timbre.modulator_40);
            }
            if o2 != NO_OPERATOR {
                self.write_reg(chip, 0x40 + o2, timbre.carrier_40);
            }
        }

        let mut x = timbre.modulator_e862;
        let mut y = timbre.carrier_e862;
        for base in [0x20u16, 0x60, 0x80, 0xE0] {
            if o1 != NO_OPERATOR {
                self.write_reg(chip, base + o1, (x & 0xFF) as u8);
            }
            if o2 != NO_OPERATOR {
                self.write_reg(chip, base + o2, (y & 0xFF) as u8);
            }
            x >>= 8;
            y >>= 8;
        }

        let mut fbconn = 0u8;
        let mut fbconn_reg = 0u16;
        if CHANNELS_MAP_FBCONN[cc] != NO_OPERATOR {
            fbconn |= timbre.feedconn;
            fbconn_reg = 0xC0 + CHANNELS_MAP_FBCONN[cc];
        }
        if self.chip_type != ChipType::Opl2 && CHANNELS_MAP_PAN[cc] != NO_OPERATOR {
            fbconn |= self.reg_c0[voice] & PANNING_BOTH;
            if fbconn_reg == 0 {
                fbconn_reg = 0xC0 + CHANNELS_MAP_PAN[cc];
            }
        }
        if fbconn_reg != 0 {
            self.write_reg(chip, fbconn_reg, fbconn);
        }
    }

    /// Position a voice in the stereo field.
    ///
    /// With soft panning enabled and supported, the pan level register gets
    /// the full 0..=127 value and the hardware bits stay at BOTH. Otherwise
    /// the value is quantized three ways: left-only below 48, right-only
    /// above 80, both in between; the soft-pan register is recentered so a
    /// capable emulator does not double-pan.
    pub fn set_pan(&mut self, voice: usize, value: u8) {
        let chip = voice / CHANNELS_PER_CHIP;
        let cc = voice % CHANNELS_PER_CHIP;

        if self.chip_type == ChipType::Opl2 {
            self.reg_c0[voice] = PANNING_BOTH;
            return; // OPL2 has no stereo
        }

        if CHANNELS_MAP_PAN[cc] == NO_OPERATOR {
            return;
        }

        let feedconn = self.ins_cache[voice].feedconn;
        if self.soft_pan_sup && self.soft_pan {
            self.write_pan_reg(chip, CHANNELS_MAP_PAN[cc], value);
            self.reg_c0[voice] = PANNING_BOTH;
            self.write_reg(chip, 0xC0 + CHANNELS_MAP_PAN[cc], feedconn | PANNING_BOTH);
        } else {
            let mut panning = 0u8;
            if value < 64 + 16 {
                panning |= PANNING_LEFT;
            }
            if value >= 64 - 16 {
                panning |= PANNING_RIGHT;
            }
            self.reg_c0[voice] = panning;
            self.write_pan_reg(chip, CHANNELS_MAP_PAN[cc], 64);
            self.write_reg(chip, 0xC0 + CHANNELS_MAP_PAN[cc], feedconn | panning);
        }
    }

    /// Silence every voice: key-off, TL to maximum attenuation, release
    /// rate to fastest. Voices already silenced produce no traffic.
    pub fn silence_all(&mut self) {
        if self.chips.is_empty() {
            return;
        }

        self.commit_deep_flags(); // drops all rhythm keys when active

        for voice in 0..self.num_voices {
            let chip = voice / CHANNELS_PER_CHIP;
            let cc = voice % CHANNELS_PER_CHIP;

            self.note_off(voice);

            if self.silenced[voice] {
                continue;
            }
            self.silenced[voice] = true;
            self.ins_cache_dirty[voice] = true;
            self.tl_cache[voice] = Some((0x3F, 0x3F));

            let (o1, o2) = self.operator_addrs(cc);
            if o1 != NO_OPERATOR {
                self.write_reg(chip, 0x40 + o1, 0x3F);
                self.write_reg(chip, 0x80 + o1, 0xFF);
            }
            if o2 != NO_OPERATOR {
                self.write_reg(chip, 0x40 + o2, 0x3F);
                self.write_reg(chip, 0x80 + o2, 0xFF);
            }
        }
    }

    // -- audio -------------------------------------------------------------

    /// Render one chunk of interleaved stereo samples, mixing all chips.
    pub fn render(&mut self, out: &mut [i16]) {
        if self.chips.is_empty() {
            out.fill(0);
            return;
        }
        self.chips[0].generate(out);
        for chip in self.chips.iter_mut().skip(1) {
            chip.generate_and_mix(out);
        }
    }
}

impl Default for ChipFrontend {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::chip::emulator::{RegJournal, RegWrite, RegisterLogChip};
    use std::cell::RefCell;
    use std::rc::Rc;

    fn journaled_frontend(num_chips: usize) -> (ChipFrontend, RegJournal) {
        let journal: RegJournal = Rc::new(RefCell::new(Vec::new()));
        let mut registry = EmulatorRegistry::new();
        let j = Rc::clone(&journal);
        registry.register(
            EmulatorId::Custom(0),
            Box::new(move |rate| Box::new(RegisterLogChip::with_journal(rate, Rc::clone(&j)))),
        );

        let mut frontend = ChipFrontend::new();
        frontend
            .reset(&registry, EmulatorId::Custom(0), num_chips, 44100)
            .expect("reset failed");
        (frontend, journal)
    }

    #[test]
    fn test_reset_writes_opl3_enable_sequence() {
        let (_frontend, journal) = journaled_frontend(1);
        let writes = journal.borrow();
        // The OPL3 enable pulse must appear: 0x105 = 0, 1, 0, ... 1.
        let seq: Vec<u8> = writes
            .iter()
            .filter(|w| w.address == 0x105)
            .map(|w| w.value)
            .collect();
        assert_eq!(seq, vec![0, 1, 0, 1]);
        // Waveform select enable.
        assert!(writes.contains(&RegWrite { address: 0x001, value: 32 }));
    }

    #[test]
    fn test_voice_budget_invariant() {
        let mut registry = EmulatorRegistry::new();
        registry.register(
            EmulatorId::Custom(1),
            Box::new(|rate| Box::new(RegisterLogChip::new(rate))),
        );
        let mut frontend = ChipFrontend::new();
        frontend
            .reset(&registry, EmulatorId::Custom(1), 2, 44100)
            .unwrap();

        for (fours, rhythm) in [(0u32, false), (2, false), (6, true), (12, true)] {
            frontend.set_num_four_ops(fours);
            frontend.set_rhythm_mode(rhythm);
            frontend.update_channel_categories();

            for chip in 0..2 {
                let base = chip * CHANNELS_PER_CHIP;
                let cats = (0..CHANNELS_PER_CHIP)
                    .map(|i| frontend.category(base + i))
                    .collect::<Vec<_>>();
                let regular = cats.iter().filter(|&&c| c == VoiceCategory::Regular).count();
                let firsts = cats
                    .iter()
                    .filter(|&&c| c == VoiceCategory::FourOpFirst)
                    .count();
                let seconds = cats
                    .iter()
                    .filter(|&&c| c == VoiceCategory::FourOpSecond)
                    .count();
                let shadow = cats
                    .iter()
                    .filter(|&&c| c == VoiceCategory::RhythmShadow)
                    .count();

                assert_eq!(firsts, seconds, "pair halves must match");
                // All 18 tone channels are accounted for.
                let disabled_tone = cats[..RHYTHM_BASE]
                    .iter()
                    .filter(|&&c| c == VoiceCategory::Disabled)
                    .count();
                assert_eq!(
                    regular + 2 * firsts + shadow + disabled_tone,
                    RHYTHM_BASE,
                    "fours={fours} rhythm={rhythm}"
                );
                if rhythm {
                    assert_eq!(shadow, 3);
                    assert!(cats[RHYTHM_BASE..].iter().all(|c| c.is_rhythm()));
                }
            }
        }
    }

    #[test]
    fn test_four_op_pair_layout() {
        let mut registry = EmulatorRegistry::new();
        registry.register(
            EmulatorId::Custom(1),
            Box::new(|rate| Box::new(RegisterLogChip::new(rate))),
        );
        let mut frontend = ChipFrontend::new();
        frontend
            .reset(&registry, EmulatorId::Custom(1), 1, 44100)
            .unwrap();
        frontend.set_num_four_ops(6);
        frontend.update_channel_categories();

        for first in [0usize, 1, 2, 9, 10, 11] {
            assert_eq!(frontend.category(first), VoiceCategory::FourOpFirst);
            assert_eq!(frontend.category(first + 3), VoiceCategory::FourOpSecond);
        }
        assert_eq!(frontend.category(6), VoiceCategory::Regular);
    }

    #[test]
    fn test_note_on_sets_key_bit_and_note_off_clears() {
        let (mut frontend, journal) = journaled_frontend(1);
        frontend.set_patch(0, &Timbre::DEFAULT);
        frontend.note_on(0, 0, 60.0);
        assert!(frontend.key_on_bit(0));

        let b0 = journal
            .borrow()
            .iter()
            .rev()
            .find(|w| w.address == 0xB0)
            .copied()
            .unwrap();
        assert_ne!(b0.value & 0x20, 0, "key-on bit missing");

        frontend.note_off(0);
        assert!(!frontend.key_on_bit(0));
        let b0 = journal
            .borrow()
            .iter()
            .rev()
            .find(|w| w.address == 0xB0)
            .copied()
            .unwrap();
        assert_eq!(b0.value & 0x20, 0, "key-on bit still set");
    }

    #[test]
    fn test_rhythm_bd_bits() {
        let (mut frontend, _journal) = journaled_frontend(1);
        frontend.set_rhythm_mode(true);
        frontend.update_channel_categories();

        // Key on bass (18), snare (19), hi-hat (22).
        frontend.note_on(18, 18, 36.0);
        frontend.note_on(19, 19, 38.0);
        frontend.note_on(22, 22, 42.0);
        assert_eq!(frontend.reg_bd(0) & 0x1F, 0x10 | 0x08 | 0x01);

        frontend.note_off(19);
        assert_eq!(frontend.reg_bd(0) & 0x1F, 0x10 | 0x01);
        // Deep/rhythm flags stay untouched.
        assert_eq!(frontend.reg_bd(0) & 0x20, 0x20);
    }

    #[test]
    fn test_set_patch_is_idempotent() {
        let (mut frontend, journal) = journaled_frontend(1);
        let timbre = Timbre {
            modulator_e862: 0x0153_F102,
            carrier_e862: 0x0064_F201,
            modulator_40: 0x23,
            carrier_40: 0x00,
            feedconn: 0x06,
            note_offset: 0,
        };
        frontend.set_patch(3, &timbre);
        let count_after_first = journal.borrow().len();
        frontend.set_patch(3, &timbre);
        assert_eq!(journal.borrow().len(), count_after_first);
    }

    #[test]
    fn test_silence_all_idempotent() {
        let (mut frontend, journal) = journaled_frontend(2);
        frontend.set_patch(0, &Timbre::DEFAULT);
        frontend.note_on(0, 0, 60.0);

        frontend.silence_all();
        let count_after_first = journal.borrow().len();
        frontend.silence_all();
        let extra: Vec<RegWrite> = journal.borrow()[count_after_first..].to_vec();
        // Only the unconditional 0xBD deep-flag commit may repeat.
        assert!(
            extra.iter().all(|w| w.address == 0x0BD),
            "unexpected traffic: {extra:?}"
        );
    }

    #[test]
    fn test_hard_pan_quantization() {
        let (mut frontend, journal) = journaled_frontend(1);
        frontend.set_patch(0, &Timbre::DEFAULT);

        // RegisterLogChip reports full panning support, but soft pan is off
        // by default, so the 3-way quantizer applies.
        for (value, expected) in [
            (0u8, PANNING_LEFT),
            (47, PANNING_LEFT),
            (64, PANNING_BOTH),
            (80, PANNING_RIGHT),
            (127, PANNING_RIGHT),
        ] {
            frontend.set_pan(0, value);
            let c0 = journal
                .borrow()
                .iter()
                .rev()
                .find(|w| w.address == 0xC0)
                .copied()
                .unwrap();
            assert_eq!(c0.value & PANNING_BOTH, expected, "pan value {value}");
        }
    }

    #[test]
    fn test_soft_pan_keeps_both_bits() {
        let (mut frontend, journal) = journaled_frontend(1);
        frontend.set_soft_pan(true);
        frontend.set_patch(0, &Timbre::DEFAULT);
        frontend.set_pan(0, 20);

        let c0 = journal
            .borrow()
            .iter()
            .rev()
            .find(|w| w.address == 0xC0)
            .copied()
            .unwrap();
        assert_eq!(c0.value & PANNING_BOTH, PANNING_BOTH);
    }

    #[test]
    fn test_mul_offset_marks_cache_dirty() {
        let (mut frontend, journal) = journaled_frontend(1);
        frontend.set_patch(0, &Timbre::DEFAULT);

        // An extreme tone forces a MULT bump on the 0x20 registers.
        frontend.note_on(0, 0, 125.0);
        let writes_20: Vec<RegWrite> = journal
            .borrow()
            .iter()
            .filter(|w| w.address == 0x20 || w.address == 0x23)
            .copied()
            .collect();
        assert!(!writes_20.is_empty(), "expected MULT rewrites");

        // The next normal note restores the patch bytes.
        journal.borrow_mut().clear();
        frontend.note_on(0, 0, 60.0);
        let restored = journal
            .borrow()
            .iter()
            .any(|w| w.address == 0x20 && w.value == (Timbre::DEFAULT.modulator_e862 & 0xFF) as u8);
        assert!(restored, "patch 0x20 byte not restored");
    }

    #[test]
    fn test_reject_bad_configuration() {
        let registry = EmulatorRegistry::new();
        let mut frontend = ChipFrontend::new();
        assert!(matches!(
            frontend.reset(&registry, EmulatorId::RegisterLog, 0, 44100),
            Err(SynthError::BadConfiguration(_))
        ));
        assert!(matches!(
            frontend.reset(&registry, EmulatorId::RegisterLog, 1, 0),
            Err(SynthError::BadConfiguration(_))
        ));
        assert!(matches!(
            frontend.reset(&registry, EmulatorId::Custom(9), 1, 44100),
            Err(SynthError::OutOfResources(_))
        ));
    }
}
