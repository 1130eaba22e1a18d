//! The synthesizer core: MIDI events in, register writes and samples out.
//!
//! [`Synth`] ties the pieces together: sixteen [`MidiChannel`]s interpret
//! incoming events, the voice allocator maps notes onto the chip voice
//! pool, and the [`ChipFrontend`] turns the result into register writes.
//! `generate` interleaves housekeeping (vibrato, deferred key-offs, the
//! arpeggiator) with chip sample generation in bounded chunks.
//!
//! A `Synth` is single-threaded by design: one instance must only ever be
//! driven from one thread at a time. Hosts typically call `generate` from
//! the audio thread and funnel `rt_*` events to it through a queue drained
//! at chunk boundaries (the [`crate::seq::Sequencer`] does exactly that).

pub mod arpeggio;
pub mod voice;

use crate::bank::{BankDb, RhythmSlot, Timbre};
use crate::chip::emulator::{ChipFactory, EmulatorId, EmulatorRegistry};
use crate::chip::frontend::{ChipFrontend, MusicMode, VoiceCategory};
use crate::error::SynthError;
use crate::midi::channel::MidiChannel;
use crate::model::VolumeModelId;
use arpeggio::Arpeggio;
use log::debug;
use voice::{ChanAlloc, OplVoice, VoiceOwner, VoiceState, allocation_score, RELEASE_TAIL_MS};

/// Upper bound on one render chunk, in frames. Events delivered between
/// chunks are audible within this bound (~11.6 ms at 44100 Hz).
pub const MAX_CHUNK_FRAMES: usize = 512;

const NUM_MIDI_CHANNELS: usize = 16;

/// What the allocator is being asked for.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum AllocKind {
    TwoOp,
    FourOpPair,
    Rhythm(RhythmSlot),
}

/// Snapshot of one chip voice, for diagnostics and tests.
#[derive(Debug, Clone)]
pub struct VoiceInfo {
    pub index: usize,
    pub state: VoiceState,
    pub category: VoiceCategory,
    pub owner: Option<VoiceOwner>,
}

/// The software synthesizer.
pub struct Synth {
    registry: EmulatorRegistry,
    frontend: ChipFrontend,
    channels: Vec<MidiChannel>,
    voices: Vec<OplVoice>,
    arps: Vec<Arpeggio>,
    bank: BankDb,

    sample_rate: u32,
    emulator: EmulatorId,
    num_chips: usize,
    alloc_policy: ChanAlloc,
    auto_arpeggio: bool,
    xg_mode: bool,
    gain: f64,
    /// Forced deep tremolo/vibrato; `None` follows the bank.
    tremolo_force: Option<bool>,
    vibrato_force: Option<bool>,
    volume_model_force: Option<VolumeModelId>,

    /// Monotonic housekeeping tick, the age base for voice stealing.
    tick: u64,
}

impl std::fmt::Debug for Synth {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Synth")
            .field("sample_rate", &self.sample_rate)
            .field("num_chips", &self.num_chips)
            .field("emulator", &self.emulator)
            .field("voices", &self.voices.len())
            .finish()
    }
}

impl Synth {
    /// Create a synthesizer with the default bank, one OPL3 chip and the
    /// built-in diagnostic emulator.
    pub fn new(sample_rate: u32) -> Result<Self, SynthError> {
        let mut synth = Synth {
            registry: EmulatorRegistry::new(),
            frontend: ChipFrontend::new(),
            channels: (0..NUM_MIDI_CHANNELS)
                .map(|ch| MidiChannel::new(ch == 9))
                .collect(),
            voices: Vec::new(),
            arps: vec![Arpeggio::new(); NUM_MIDI_CHANNELS],
            bank: BankDb::embedded(0).expect("embedded default bank"),
            sample_rate,
            emulator: EmulatorId::RegisterLog,
            num_chips: 1,
            alloc_policy: ChanAlloc::Auto,
            auto_arpeggio: false,
            xg_mode: false,
            gain: 2.0,
            tremolo_force: None,
            vibrato_force: None,
            volume_model_force: None,
            tick: 0,
        };
        synth.reconfigure()?;
        Ok(synth)
    }

    // -- configuration -----------------------------------------------------

    /// Rebuild chips and re-apply bank setup and layout. Expensive; drops
    /// all sounding notes.
    fn reconfigure(&mut self) -> Result<(), SynthError> {
        self.frontend
            .reset(&self.registry, self.emulator, self.num_chips, self.sample_rate)?;
        self.apply_bank_setup();
        self.frontend.update_channel_categories();
        self.voices = (0..self.frontend.num_voices())
            .map(|_| OplVoice::new())
            .collect();
        for ch in &mut self.channels {
            ch.notes.clear();
        }
        for arp in &mut self.arps {
            arp.clear();
        }
        Ok(())
    }

    fn apply_bank_setup(&mut self) {
        let setup = self.bank.setup;
        self.frontend
            .set_deep_tremolo(self.tremolo_force.unwrap_or(setup.deep_tremolo));
        self.frontend
            .set_deep_vibrato(self.vibrato_force.unwrap_or(setup.deep_vibrato));
        self.frontend.set_scale_modulators(setup.scale_modulators);
        let model = self.volume_model_force.unwrap_or(setup.volume_model);
        self.frontend.set_volume_model(model);
        self.frontend.commit_deep_flags();
    }

    pub fn sample_rate(&self) -> u32 {
        self.sample_rate
    }

    /// Change the output sample rate. Full chip reinit; sounding notes are
    /// silenced deterministically rather than smeared across the boundary.
    pub fn set_sample_rate(&mut self, rate: u32) -> Result<(), SynthError> {
        if rate == 0 {
            return Err(SynthError::BadConfiguration("sample rate is zero".into()));
        }
        self.sample_rate = rate;
        self.reconfigure()
    }

    pub fn num_chips(&self) -> usize {
        self.num_chips
    }

    pub fn set_num_chips(&mut self, n: usize) -> Result<(), SynthError> {
        if n == 0 || n > 100 {
            return Err(SynthError::BadConfiguration(format!(
                "chip count {n} out of range"
            )));
        }
        self.num_chips = n;
        self.reconfigure()
    }

    pub fn set_num_four_ops(&mut self, n: u32) -> Result<(), SynthError> {
        if n > self.num_chips as u32 * 6 {
            return Err(SynthError::BadConfiguration(format!(
                "{n} four-op channels exceed capacity of {} chips",
                self.num_chips
            )));
        }
        self.panic();
        self.frontend.set_num_four_ops(n);
        self.frontend.update_channel_categories();
        Ok(())
    }

    /// Make an emulator available under an id.
    pub fn register_emulator(&mut self, id: EmulatorId, factory: ChipFactory) {
        self.registry.register(id, factory);
    }

    /// Switch the chip emulator. On failure the previous emulator stays
    /// active.
    pub fn switch_emulator(&mut self, id: EmulatorId) -> Result<(), SynthError> {
        if !self.registry.contains(id) {
            return Err(SynthError::OutOfResources(format!("{id:?}")));
        }
        self.panic();
        let previous = self.emulator;
        self.emulator = id;
        if let Err(e) = self.reconfigure() {
            self.emulator = previous;
            let _ = self.reconfigure();
            return Err(e);
        }
        Ok(())
    }

    /// Load an embedded bank.
    pub fn set_bank(&mut self, embedded_id: u32) -> Result<(), SynthError> {
        let bank = BankDb::embedded(embedded_id).ok_or_else(|| {
            SynthError::BadConfiguration(format!("unknown embedded bank {embedded_id}"))
        })?;
        self.install_bank(bank);
        Ok(())
    }

    /// Load a WOPL bank image from memory. The previous bank stays active
    /// when parsing fails.
    pub fn open_bank_data(&mut self, bytes: &[u8]) -> Result<(), SynthError> {
        let file = crate::bank::wopl::parse(bytes)?;
        self.install_bank(BankDb::from_wopl(&file));
        Ok(())
    }

    /// Load a WOPL bank file from disk.
    pub fn open_bank_file(&mut self, path: &std::path::Path) -> Result<(), SynthError> {
        let bytes = std::fs::read(path)
            .map_err(|e| SynthError::BadConfiguration(format!("{}: {e}", path.display())))?;
        self.open_bank_data(&bytes)
    }

    fn install_bank(&mut self, bank: BankDb) {
        self.panic();
        self.bank = bank;
        self.apply_bank_setup();
    }

    pub fn bank(&self) -> &BankDb {
        &self.bank
    }

    /// Force a volume model, overriding the bank's selection. `Auto`
    /// returns control to the bank.
    pub fn set_volume_model(&mut self, id: VolumeModelId) {
        self.volume_model_force = match id {
            VolumeModelId::Auto => None,
            other => Some(other),
        };
        let model = self.volume_model_force.unwrap_or(self.bank.setup.volume_model);
        self.frontend.set_volume_model(model);
    }

    pub fn set_channel_alloc(&mut self, policy: ChanAlloc) {
        self.alloc_policy = policy;
    }

    pub fn set_soft_pan_enabled(&mut self, on: bool) {
        self.frontend.set_soft_pan(on);
    }

    pub fn set_scale_modulators(&mut self, on: bool) {
        self.frontend.set_scale_modulators(on);
    }

    pub fn set_full_range_brightness(&mut self, on: bool) {
        self.frontend.set_full_range_brightness(on);
    }

    pub fn set_auto_arpeggio(&mut self, on: bool) {
        self.auto_arpeggio = on;
        if !on {
            for arp in &mut self.arps {
                arp.clear();
            }
        }
    }

    /// Force deep tremolo: -1 follows the bank, 0 off, anything else on.
    pub fn set_htremolo(&mut self, force: i8) {
        self.tremolo_force = match force {
            f if f < 0 => None,
            0 => Some(false),
            _ => Some(true),
        };
        self.apply_bank_setup();
    }

    /// Force deep vibrato: -1 follows the bank, 0 off, anything else on.
    pub fn set_hvibrato(&mut self, force: i8) {
        self.vibrato_force = match force {
            f if f < 0 => None,
            0 => Some(false),
            _ => Some(true),
        };
        self.apply_bank_setup();
    }

    /// Enable rhythm mode (five fixed percussion voices on channels 6-8).
    pub fn set_rhythm_mode(&mut self, on: bool) {
        self.panic();
        self.frontend.set_rhythm_mode(on);
        self.frontend.update_channel_categories();
    }

    pub fn set_music_mode(&mut self, mode: MusicMode) {
        self.frontend.set_music_mode(mode);
    }

    /// Output gain applied by the format-conversion wrapper.
    pub fn set_gain(&mut self, gain: f64) {
        self.gain = gain.max(0.0);
    }

    pub fn gain(&self) -> f64 {
        self.gain
    }

    pub fn frontend(&self) -> &ChipFrontend {
        &self.frontend
    }

    /// Read-only view of one MIDI channel's state.
    pub fn channel(&self, index: usize) -> &MidiChannel {
        &self.channels[index % NUM_MIDI_CHANNELS]
    }

    /// Diagnostic voice table.
    pub fn describe_voices(&self) -> Vec<VoiceInfo> {
        self.voices
            .iter()
            .enumerate()
            .map(|(index, v)| VoiceInfo {
                index,
                state: v.state,
                category: self.frontend.category(index),
                owner: v.owner,
            })
            .collect()
    }

    // -- realtime events ---------------------------------------------------

    pub fn rt_note_on(&mut self, channel: u8, key: u8, velocity: u8) {
        if velocity == 0 {
            self.rt_note_off(channel, key);
            return;
        }
        let ch = (channel as usize) % NUM_MIDI_CHANNELS;
        let key = key & 0x7F;

        let percussive = self.channels[ch].is_drum()
            || (self.xg_mode
                && (self.channels[ch].bank_msb == 0x7E || self.channels[ch].bank_msb == 0x7F));

        let (msb, lsb, program) = {
            let c = &self.channels[ch];
            if percussive {
                // Percussion: the program selects the kit (bank LSB), the
                // key picks the instrument.
                (c.bank_msb, c.patch, key)
            } else {
                (c.bank_msb, c.bank_lsb, c.patch)
            }
        };

        let Some(ins) = self.bank.lookup(msb, lsb, program, percussive).copied() else {
            debug!("no instrument for ch={ch} bank={msb}:{lsb} program={program}");
            return;
        };

        // Retrigger: a key already sounding is released first.
        if self.channels[ch].notes.contains_key(&key) {
            self.release_note(ch, key, true);
        }

        let mut vel = i16::from(velocity & 0x7F) + i16::from(ins.velocity_offset);
        if self.channels[ch].soft_pedal {
            vel = vel * 2 / 3;
        }
        let vel = vel.clamp(1, 127) as u8;

        let base_tone = if percussive && ins.percussion_key > 0 {
            f64::from(ins.percussion_key)
        } else {
            f64::from(key)
        };

        let note = crate::midi::channel::NoteState {
            velocity: vel,
            aftertouch: 0,
            tone: base_tone,
            sustained: false,
            sostenuto_held: false,
            instrument: ins,
            voices: [None, None],
        };
        self.channels[ch].notes.insert(key, note);

        if !self.start_note_voices(ch, key) {
            self.channels[ch].notes.remove(&key);
            if self.auto_arpeggio {
                self.arps[ch].push(key, vel);
            } else {
                debug!("voice pool exhausted, dropping ch={ch} key={key}");
            }
        }
    }

    /// Allocate and key the chip voices for an already-registered note.
    /// Returns false when no voice could be found.
    fn start_note_voices(&mut self, ch: usize, key: u8) -> bool {
        let note = self.channels[ch].notes.get(&key).cloned();
        let Some(note) = note else { return false };
        let ins = note.instrument;
        let policy = self.alloc_policy.resolve(ins.is_double_voice());

        let rhythm_slot = if self.frontend.rhythm_mode() && self.channels[ch].is_drum() {
            ins.rhythm_slot()
        } else {
            None
        };

        let mut handles: [Option<usize>; 2] = [None, None];

        if let Some(slot) = rhythm_slot {
            handles[0] = self
                .pick_voice(AllocKind::Rhythm(slot), policy, &ins.timbres[0], None)
                .map(|(_, v)| v);
        } else if ins.is_4op() {
            let pair = self.pick_voice(AllocKind::FourOpPair, policy, &ins.timbres[0], None);
            // Two halves both takeable without cutting live notes.
            let pair_free = pair.is_some_and(|(_, first)| {
                self.voices[first].is_released() && self.voices[first + 3].is_released()
            });
            if pair_free {
                let (_, first) = pair.unwrap();
                handles[0] = Some(first);
                handles[1] = Some(first + 3);
            } else {
                // The pair is busy (or absent): degrade to a free 2-op
                // voice before stealing a sounding pair.
                let single = self.pick_voice(AllocKind::TwoOp, policy, &ins.timbres[0], None);
                match (single, pair) {
                    (Some((score, v)), _) if score < 2 * voice::SCORE_TIER => {
                        handles[0] = Some(v);
                    }
                    (_, Some((_, first))) => {
                        handles[0] = Some(first);
                        handles[1] = Some(first + 3);
                    }
                    (Some((_, v)), None) => handles[0] = Some(v),
                    (None, None) => {}
                }
            }
        } else {
            // With the arpeggiator active, a note that would have to cut a
            // live voice short is parked in the queue instead of stealing.
            let cuts_live = |score: i64| score >= 2 * voice::SCORE_TIER;
            handles[0] = self
                .pick_voice(AllocKind::TwoOp, policy, &ins.timbres[0], None)
                .filter(|&(score, _)| !(self.auto_arpeggio && cuts_live(score)))
                .map(|(_, v)| v);
            if handles[0].is_some() && ins.is_pseudo_4op() {
                handles[1] = self
                    .pick_voice(AllocKind::TwoOp, policy, &ins.timbres[1], handles[0])
                    .filter(|&(score, _)| !(self.auto_arpeggio && cuts_live(score)))
                    .map(|(_, v)| v);
            }
        }

        let Some(first) = handles[0] else {
            return false;
        };

        let natural_pair = ins.is_4op() && handles[1] == Some(first + 3);
        let voices_used: Vec<(usize, u8)> = match (handles[0], handles[1]) {
            (Some(a), Some(b)) => vec![(a, 0), (b, 1)],
            (Some(a), None) => vec![(a, 0)],
            _ => vec![],
        };

        for &(v, _) in &voices_used {
            self.steal_voice(v);
        }

        let effective_volume = u32::from(note.velocity)
            * u32::from(self.channels[ch].volume)
            * u32::from(self.channels[ch].expression);

        for &(v, voice_index) in &voices_used {
            let timbre = ins.timbres[voice_index as usize];
            self.voices[v] = OplVoice {
                state: VoiceState::On,
                owner: Some(VoiceOwner {
                    channel: ch as u8,
                    key,
                    voice_index,
                }),
                kon_tick: self.tick,
                koff_tick: 0,
                off_delay_ms: 0.0,
                cfg_off_delay_ms: f64::from(ins.delay_off_ms),
                min_on_ms: f64::from(ins.delay_on_ms),
                pending_off: false,
                release_ms: 0.0,
                effective_volume,
                timbre,
            };

            self.frontend.set_patch(v, &timbre);

            let pan = if ins.is_pseudo_4op() && voices_used.len() == 2 {
                // Stereo-detuned double voice: hard left / hard right.
                if voice_index == 0 { 0 } else { 127 }
            } else {
                self.channels[ch].panning
            };
            self.frontend.set_pan(v, pan);

            self.touch_voice(v);
        }

        // Key on after patches and levels are in place.
        if natural_pair {
            let tone = self.voice_tone(ch, &note, 0);
            self.frontend.note_on(first, first + 3, tone);
        } else {
            for &(v, voice_index) in &voices_used {
                let tone = self.voice_tone(ch, &note, voice_index);
                self.frontend.note_on(v, v, tone);
            }
        }

        let stored = self.channels[ch].notes.get_mut(&key).expect("note vanished");
        for &(v, voice_index) in &voices_used {
            stored.voices[voice_index as usize] = Some(v);
        }

        true
    }

    /// Effective tone of a note's voice: base tone, per-voice note offset,
    /// bend, tuning, channel vibrato, pseudo-4-op detune.
    fn voice_tone(&self, ch: usize, note: &crate::midi::channel::NoteState, voice_index: u8) -> f64 {
        let c = &self.channels[ch];
        let timbre = note.instrument.timbres[voice_index as usize];
        let mut tone = note.tone + f64::from(timbre.note_offset);
        tone += c.bend_semitones_now();
        tone += c.vibrato.offset();
        if voice_index == 1 && note.instrument.is_pseudo_4op() {
            tone += note.instrument.second_voice_detune;
        }
        tone
    }

    /// Find the best-scored voice for an allocation request, or `None`
    /// when no category-compatible voice exists. `exclude` keeps a voice
    /// already reserved for the same note out of the running.
    fn pick_voice(
        &self,
        kind: AllocKind,
        policy: ChanAlloc,
        timbre: &Timbre,
        exclude: Option<usize>,
    ) -> Option<(i64, usize)> {
        let mut best: Option<(i64, usize)> = None;
        let mut consider = |score: i64, index: usize, best: &mut Option<(i64, usize)>| {
            if exclude == Some(index) {
                return;
            }
            if best.is_none() || score < best.unwrap().0 {
                *best = Some((score, index));
            }
        };

        match kind {
            AllocKind::TwoOp => {
                let mut any_regular = false;
                for (i, v) in self.voices.iter().enumerate() {
                    if self.frontend.category(i) == VoiceCategory::Regular {
                        any_regular = true;
                        consider(allocation_score(v, policy, self.tick, timbre), i, &mut best);
                    }
                }
                if !any_regular {
                    // Every tone channel is paired; borrow pair halves as
                    // plain 2-op voices.
                    for (i, v) in self.voices.iter().enumerate() {
                        if matches!(
                            self.frontend.category(i),
                            VoiceCategory::FourOpFirst | VoiceCategory::FourOpSecond
                        ) {
                            consider(
                                allocation_score(v, policy, self.tick, timbre),
                                i,
                                &mut best,
                            );
                        }
                    }
                }
            }
            AllocKind::FourOpPair => {
                for (i, v) in self.voices.iter().enumerate() {
                    if self.frontend.category(i) != VoiceCategory::FourOpFirst {
                        continue;
                    }
                    let second = &self.voices[i + 3];
                    let score = allocation_score(v, policy, self.tick, timbre)
                        + allocation_score(second, policy, self.tick, timbre);
                    consider(score, i, &mut best);
                }
            }
            AllocKind::Rhythm(slot) => {
                let wanted = match slot {
                    RhythmSlot::BassDrum => VoiceCategory::RhythmBass,
                    RhythmSlot::Snare => VoiceCategory::RhythmSnare,
                    RhythmSlot::TomTom => VoiceCategory::RhythmTom,
                    RhythmSlot::Cymbal => VoiceCategory::RhythmCymbal,
                    RhythmSlot::HiHat => VoiceCategory::RhythmHiHat,
                };
                for (i, v) in self.voices.iter().enumerate() {
                    if self.frontend.category(i) == wanted {
                        consider(allocation_score(v, policy, self.tick, timbre), i, &mut best);
                    }
                }
            }
        }

        best
    }

    /// Evict whatever currently occupies a voice slot.
    fn steal_voice(&mut self, v: usize) {
        if let Some(owner) = self.voices[v].owner {
            let ch = owner.channel as usize;
            if let Some(note) = self.channels[ch].notes.get_mut(&owner.key) {
                note.voices[owner.voice_index as usize] = None;
                if note.voices.iter().all(Option::is_none) {
                    self.channels[ch].notes.remove(&owner.key);
                }
            }
        }
        if !matches!(self.voices[v].state, VoiceState::Off) {
            self.frontend.note_off(v);
        }
        let timbre = self.voices[v].timbre;
        self.voices[v] = OplVoice {
            timbre,
            ..OplVoice::new()
        };
    }

    /// Re-apply the volume of a sounding voice.
    fn touch_voice(&mut self, v: usize) {
        let Some(owner) = self.voices[v].owner else { return };
        let ch = owner.channel as usize;
        let Some(note) = self.channels[ch].notes.get(&owner.key) else { return };

        let pressure = note.aftertouch.max(self.channels[ch].aftertouch);
        let velocity = note.velocity.max(pressure);
        let brightness = self.channels[ch].brightness;
        let is_drum = self.channels[ch].is_drum();
        let (volume, expression) = {
            let c = &self.channels[ch];
            (c.volume, c.expression)
        };
        self.frontend
            .touch_note(v, velocity, volume, expression, brightness, is_drum);
    }

    pub fn rt_note_off(&mut self, channel: u8, key: u8) {
        let ch = (channel as usize) % NUM_MIDI_CHANNELS;
        let key = key & 0x7F;
        if self.arps[ch].remove(key) {
            return; // never sounded
        }
        self.release_note(ch, key, false);
    }

    /// Release a note. `force` bypasses the pedals (used for retrigger,
    /// all-sound-off and stealing).
    fn release_note(&mut self, ch: usize, key: u8, force: bool) {
        let sustain = self.channels[ch].sustain;
        let sostenuto_pedal = self.channels[ch].sostenuto;

        let Some(note) = self.channels[ch].notes.get_mut(&key) else {
            return;
        };

        if !force {
            let sostenuto = sostenuto_pedal && note.sostenuto_held;
            if sustain || sostenuto {
                note.sustained = true;
                let voices = note.voices;
                for v in voices.into_iter().flatten() {
                    self.voices[v].state = VoiceState::Sustained;
                }
                return;
            }
        }

        let note = self.channels[ch].notes.remove(&key).expect("checked above");
        for v in note.voices.into_iter().flatten() {
            self.release_voice(v);
        }
        self.channels[ch].portamento_source = Some(key);
    }

    fn release_voice(&mut self, v: usize) {
        let voice = &mut self.voices[v];
        voice.owner = None;
        voice.koff_tick = self.tick;

        if voice.min_on_ms > 0.0 {
            // Honour the minimum key-on duration; the real key-off happens
            // in housekeeping.
            voice.pending_off = true;
            return;
        }

        if voice.cfg_off_delay_ms > 0.0 {
            voice.off_delay_ms = voice.cfg_off_delay_ms;
            voice.state = VoiceState::Releasing;
        } else {
            voice.state = VoiceState::Releasing;
            voice.release_ms = RELEASE_TAIL_MS;
            self.frontend.note_off(v);
        }
    }

    /// Release every sustained note whose pedal deferral no longer holds.
    fn release_sustained(&mut self, ch: usize) {
        let sustain = self.channels[ch].sustain;
        let sostenuto = self.channels[ch].sostenuto;
        let keys: Vec<u8> = self.channels[ch]
            .notes
            .iter()
            .filter(|(_, n)| {
                n.sustained && !sustain && !(sostenuto && n.sostenuto_held)
            })
            .map(|(&k, _)| k)
            .collect();
        for key in keys {
            self.release_note(ch, key, true);
        }
    }

    pub fn rt_note_after_touch(&mut self, channel: u8, key: u8, pressure: u8) {
        let ch = (channel as usize) % NUM_MIDI_CHANNELS;
        let Some(note) = self.channels[ch].notes.get_mut(&(key & 0x7F)) else {
            return;
        };
        note.aftertouch = pressure & 0x7F;
        let voices = note.voices;
        for v in voices.into_iter().flatten() {
            self.touch_voice(v);
        }
    }

    pub fn rt_channel_after_touch(&mut self, channel: u8, pressure: u8) {
        let ch = (channel as usize) % NUM_MIDI_CHANNELS;
        self.channels[ch].aftertouch = pressure & 0x7F;
        self.retouch_channel(ch);
    }

    pub fn rt_controller_change(&mut self, channel: u8, controller: u8, value: u8) {
        let ch = (channel as usize) % NUM_MIDI_CHANNELS;
        let value = value & 0x7F;
        match controller {
            0 => self.channels[ch].bank_msb = value,
            32 => self.channels[ch].bank_lsb = value,
            1 => self.channels[ch].vibrato.wheel = value,
            5 => self.channels[ch].portamento_time = value,
            6 => {
                if self.channels[ch].data_entry_msb(value) {
                    self.retune_channel(ch);
                }
            }
            38 => {
                if self.channels[ch].data_entry_lsb(value) {
                    self.retune_channel(ch);
                }
            }
            7 => {
                self.channels[ch].volume = value;
                self.retouch_channel(ch);
            }
            10 => {
                self.channels[ch].panning = value;
                self.repan_channel(ch);
            }
            11 => {
                self.channels[ch].expression = value;
                self.retouch_channel(ch);
            }
            64 => {
                self.channels[ch].sustain = value >= 64;
                if value < 64 {
                    self.release_sustained(ch);
                }
            }
            65 => self.channels[ch].portamento_enable = value >= 64,
            66 => {
                let down = value >= 64;
                if down && !self.channels[ch].sostenuto {
                    // Capture only keys held at the moment of the press.
                    for note in self.channels[ch].notes.values_mut() {
                        if !note.sustained {
                            note.sostenuto_held = true;
                        }
                    }
                }
                self.channels[ch].sostenuto = down;
                if !down {
                    self.release_sustained(ch);
                    for note in self.channels[ch].notes.values_mut() {
                        note.sostenuto_held = false;
                    }
                }
            }
            67 => self.channels[ch].soft_pedal = value >= 64,
            74 => {
                self.channels[ch].brightness = value;
                self.retouch_channel(ch);
            }
            71 | 72 | 73 | 75 | 91 | 93 => {
                // Accepted; no OPL counterpart at this layer.
            }
            98 => {
                self.channels[ch].param.lsb = value;
                self.channels[ch].param.is_nrpn = true;
            }
            99 => {
                self.channels[ch].param.msb = value;
                self.channels[ch].param.is_nrpn = true;
            }
            100 => {
                self.channels[ch].param.lsb = value;
                self.channels[ch].param.is_nrpn = false;
            }
            101 => {
                self.channels[ch].param.msb = value;
                self.channels[ch].param.is_nrpn = false;
            }
            120 => self.all_sound_off(ch),
            121 => {
                self.channels[ch].reset_controllers();
                self.retouch_channel(ch);
                self.retune_channel(ch);
            }
            123 => self.all_notes_off(ch),
            126 => self.channels[ch].mono_mode = true,
            127 => self.channels[ch].mono_mode = false,
            _ => {
                debug!("ignored controller {controller}={value} on ch={ch}");
            }
        }
    }

    pub fn rt_patch_change(&mut self, channel: u8, program: u8) {
        let ch = (channel as usize) % NUM_MIDI_CHANNELS;
        self.channels[ch].patch = program & 0x7F;
    }

    pub fn rt_pitch_bend(&mut self, channel: u8, value_14bit: u16) {
        let ch = (channel as usize) % NUM_MIDI_CHANNELS;
        self.channels[ch].pitch_bend = i32::from(value_14bit.min(0x3FFF)) - 8192;
        self.retune_channel(ch);
    }

    pub fn rt_pitch_bend_ml(&mut self, channel: u8, msb: u8, lsb: u8) {
        self.rt_pitch_bend(
            channel,
            (u16::from(msb & 0x7F) << 7) | u16::from(lsb & 0x7F),
        );
    }

    /// Hard-silence a channel (CC120): immediate key-off, no release tail
    /// bookkeeping.
    fn all_sound_off(&mut self, ch: usize) {
        let keys: Vec<u8> = self.channels[ch].notes.keys().copied().collect();
        for key in keys {
            if let Some(note) = self.channels[ch].notes.remove(&key) {
                for v in note.voices.into_iter().flatten() {
                    self.frontend.note_off(v);
                    let timbre = self.voices[v].timbre;
                    self.voices[v] = OplVoice {
                        timbre,
                        ..OplVoice::new()
                    };
                }
            }
        }
        self.arps[ch].clear();
    }

    /// CC123: release all notes, honoring the pedals.
    fn all_notes_off(&mut self, ch: usize) {
        let keys: Vec<u8> = self.channels[ch].notes.keys().copied().collect();
        for key in keys {
            self.release_note(ch, key, false);
        }
        self.arps[ch].clear();
    }

    /// Silence everything on every channel and reset the chip-side caches.
    pub fn panic(&mut self) {
        for ch in 0..NUM_MIDI_CHANNELS {
            self.channels[ch].notes.clear();
            self.arps[ch].clear();
        }
        for v in &mut self.voices {
            let timbre = v.timbre;
            *v = OplVoice {
                timbre,
                ..OplVoice::new()
            };
        }
        self.frontend.silence_all();
    }

    /// Reset all MIDI state to GM defaults, keeping the configuration.
    pub fn rt_reset_state(&mut self) {
        self.panic();
        for (i, ch) in self.channels.iter_mut().enumerate() {
            ch.is_drum_default = i == 9;
            ch.reset_full();
        }
        self.xg_mode = false;
        self.frontend.set_master_volume(127);
    }

    pub fn rt_system_exclusive(&mut self, data: &[u8]) {
        if data.len() < 4 || data[0] != 0xF0 {
            return;
        }

        // Universal non-realtime: GM level 1/2 reset.
        if data.len() >= 6
            && data[1] == 0x7E
            && data[3] == 0x09
            && (data[4] == 0x01 || data[4] == 0x03)
            && data[5] == 0xF7
        {
            debug!("SysEx: GM{} reset", if data[4] == 0x01 { 1 } else { 2 });
            self.rt_reset_state();
            return;
        }

        // Universal realtime: master volume F0 7F xx 04 01 ll mm F7.
        if data.len() >= 8
            && data[1] == 0x7F
            && data[3] == 0x04
            && data[4] == 0x01
            && data[7] == 0xF7
        {
            self.frontend.set_master_volume(data[6] & 0x7F);
            self.retouch_all();
            return;
        }

        // Roland GS reset: F0 41 xx 42 12 40 00 7F 00 41 F7.
        if data.len() >= 11
            && data[1] == 0x41
            && data[3] == 0x42
            && data[4] == 0x12
            && data[5] == 0x40
            && data[6] == 0x00
            && data[7] == 0x7F
        {
            debug!("SysEx: GS reset");
            self.rt_reset_state();
            return;
        }

        // Roland GS drum part: F0 41 xx 42 12 40 1p 15 vv sum F7.
        if data.len() >= 10
            && data[1] == 0x41
            && data[3] == 0x42
            && data[4] == 0x12
            && data[5] == 0x40
            && (data[6] & 0xF0) == 0x10
            && data[7] == 0x15
        {
            let part = data[6] & 0x0F;
            // GS part numbering: part 0 is channel 10, parts 1-9 are
            // channels 1-9, parts 10-15 are channels 11-16.
            let ch = match part {
                0 => 9,
                1..=9 => (part - 1) as usize,
                _ => part as usize,
            };
            let is_drum = data[8] != 0;
            debug!("SysEx: GS drum part ch={ch} drum={is_drum}");
            self.channels[ch].gs_drum_override = Some(is_drum);
            return;
        }

        // Yamaha XG reset: F0 43 xx 4C 00 00 7E 00 F7.
        if data.len() >= 9
            && data[1] == 0x43
            && data[3] == 0x4C
            && data[4] == 0x00
            && data[5] == 0x00
            && data[6] == 0x7E
            && data[7] == 0x00
        {
            debug!("SysEx: XG reset");
            self.rt_reset_state();
            self.xg_mode = true;
            return;
        }

        debug!("ignored SysEx ({} bytes)", data.len());
    }

    // -- channel-wide refreshers -------------------------------------------

    fn retune_channel(&mut self, ch: usize) {
        let entries: Vec<(u8, crate::midi::channel::NoteState)> = self.channels[ch]
            .notes
            .iter()
            .map(|(&k, n)| (k, n.clone()))
            .collect();
        for (_key, note) in entries {
            let natural_pair = note.instrument.is_4op()
                && note.voices[0].is_some()
                && note.voices[1] == note.voices[0].map(|v| v + 3);
            if natural_pair {
                let v = note.voices[0].unwrap();
                let tone = self.voice_tone(ch, &note, 0);
                self.frontend.retune_note(v, v + 3, tone);
            } else {
                for (idx, v) in note.voices.iter().enumerate() {
                    if let Some(v) = *v {
                        let tone = self.voice_tone(ch, &note, idx as u8);
                        self.frontend.retune_note(v, v, tone);
                    }
                }
            }
        }
    }

    fn retouch_channel(&mut self, ch: usize) {
        let voices: Vec<usize> = self.channels[ch]
            .notes
            .values()
            .flat_map(|n| n.voices.into_iter().flatten())
            .collect();
        for v in voices {
            self.touch_voice(v);
        }
    }

    fn repan_channel(&mut self, ch: usize) {
        let pan = self.channels[ch].panning;
        let entries: Vec<(usize, bool)> = self.channels[ch]
            .notes
            .values()
            .flat_map(|n| {
                let pseudo = n.instrument.is_pseudo_4op() && n.voices[1].is_some();
                n.voices
                    .into_iter()
                    .flatten()
                    .map(move |v| (v, pseudo))
                    .collect::<Vec<_>>()
            })
            .collect();
        for (v, pseudo) in entries {
            if !pseudo {
                self.frontend.set_pan(v, pan);
            }
        }
    }

    fn retouch_all(&mut self) {
        for ch in 0..NUM_MIDI_CHANNELS {
            self.retouch_channel(ch);
        }
    }

    // -- housekeeping and rendering ----------------------------------------

    /// Advance the time-driven internals by `dt` seconds: per-channel
    /// vibrato, deferred key-offs, release tails and the arpeggiator.
    pub fn tick_housekeeping(&mut self, dt: f64) {
        self.tick += 1;
        let dt_ms = dt * 1000.0;

        // Voice countdowns.
        for v in 0..self.voices.len() {
            let voice = &mut self.voices[v];

            if voice.min_on_ms > 0.0 {
                voice.min_on_ms -= dt_ms;
                if voice.min_on_ms <= 0.0 && voice.pending_off {
                    voice.pending_off = false;
                    if voice.cfg_off_delay_ms > 0.0 {
                        voice.off_delay_ms = voice.cfg_off_delay_ms;
                        voice.state = VoiceState::Releasing;
                    } else {
                        voice.state = VoiceState::Releasing;
                        voice.release_ms = RELEASE_TAIL_MS;
                        self.frontend.note_off(v);
                    }
                    continue;
                }
            }

            let voice = &mut self.voices[v];
            if voice.state == VoiceState::Releasing {
                if voice.off_delay_ms > 0.0 {
                    voice.off_delay_ms -= dt_ms;
                    if voice.off_delay_ms <= 0.0 {
                        voice.off_delay_ms = 0.0;
                        voice.release_ms = RELEASE_TAIL_MS;
                        self.frontend.note_off(v);
                    }
                } else if voice.release_ms > 0.0 {
                    voice.release_ms -= dt_ms;
                    if voice.release_ms <= 0.0 {
                        voice.release_ms = 0.0;
                        voice.state = VoiceState::Off;
                    }
                }
            }
        }

        // Channel vibrato.
        for ch in 0..NUM_MIDI_CHANNELS {
            self.channels[ch].vibrato.tick(dt);
            if self.channels[ch].vibrato.wheel > 0 && !self.channels[ch].notes.is_empty() {
                self.retune_channel(ch);
            }
        }

        // Arpeggiator slices.
        if self.auto_arpeggio {
            self.run_arpeggio_step(dt);
        }
    }

    fn run_arpeggio_step(&mut self, dt: f64) {
        for ch in 0..NUM_MIDI_CHANNELS {
            let Some(next) = self.arps[ch].tick(dt) else { continue };

            // Rotate: the channel's oldest sounding note yields its voice
            // and goes back into the queue.
            let oldest = self.channels[ch]
                .notes
                .iter()
                .filter(|(_, n)| !n.sustained)
                .min_by_key(|(_, n)| {
                    n.voices
                        .iter()
                        .flatten()
                        .map(|&v| self.voices[v].kon_tick)
                        .min()
                        .unwrap_or(u64::MAX)
                })
                .map(|(&k, n)| (k, n.velocity));

            if let Some((old_key, old_vel)) = oldest {
                self.release_note(ch, old_key, true);
                self.arps[ch].requeue(arpeggio::PendingNote {
                    key: old_key,
                    velocity: old_vel,
                });
            }

            self.rt_note_on(ch as u8, next.key, next.velocity);
        }
    }

    /// Render interleaved stereo S16 into `out` (`out.len() / 2` frames).
    ///
    /// The work is chunked at [`MAX_CHUNK_FRAMES`]; housekeeping runs once
    /// per chunk so vibrato and deferred key-offs stay time-accurate.
    pub fn generate(&mut self, out: &mut [i16]) {
        let frames = out.len() / 2;
        let mut done = 0usize;
        while done < frames {
            let n = (frames - done).min(MAX_CHUNK_FRAMES);
            self.tick_housekeeping(n as f64 / f64::from(self.sample_rate));
            self.frontend.render(&mut out[done * 2..(done + n) * 2]);
            done += n;
        }
    }
}
