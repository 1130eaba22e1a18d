//! Chip voice slots and allocation scoring.
//!
//! Every chip voice the frontend exposes has a matching [`OplVoice`] record
//! here tracking who owns it and where it is in its life cycle. The
//! allocator ranks candidate voices with [`allocation_score`]; a lower
//! score is a better candidate.

use crate::bank::Timbre;

/// Estimated release-tail length after a key-off, in milliseconds. A voice
/// is only considered fully free once its tail has faded.
pub const RELEASE_TAIL_MS: f64 = 300.0;

/// Life cycle of one chip voice.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum VoiceState {
    /// Free; any release tail has faded.
    #[default]
    Off,
    /// Keyed on.
    On,
    /// Note-off arrived while a pedal was held; key still down.
    Sustained,
    /// Released: key-off sent (or scheduled behind an off-delay), tail
    /// still audible.
    Releasing,
}

/// MIDI-side identity of the note a voice serves.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct VoiceOwner {
    pub channel: u8,
    pub key: u8,
    /// 0 for the first voice of a note, 1 for the second half of a
    /// pseudo-4-op or the paired half of a 4-op note.
    pub voice_index: u8,
}

/// Book-keeping for one chip voice slot.
#[derive(Debug, Clone)]
pub struct OplVoice {
    pub state: VoiceState,
    pub owner: Option<VoiceOwner>,
    /// Monotonic tick at key-on.
    pub kon_tick: u64,
    /// Monotonic tick at release.
    pub koff_tick: u64,
    /// Deferred key-off countdown (auto-released percussion).
    pub off_delay_ms: f64,
    /// Configured key-off delay from the instrument, armed at release.
    pub cfg_off_delay_ms: f64,
    /// Remaining minimum key-on duration.
    pub min_on_ms: f64,
    /// A note-off arrived during the minimum key-on window.
    pub pending_off: bool,
    /// Remaining audible release tail once keyed off.
    pub release_ms: f64,
    /// velocity x channel volume x expression at key-on, for eviction.
    pub effective_volume: u32,
    /// Timbre currently written to the chip voice.
    pub timbre: Timbre,
}

impl OplVoice {
    pub fn new() -> Self {
        OplVoice {
            state: VoiceState::Off,
            owner: None,
            kon_tick: 0,
            koff_tick: 0,
            off_delay_ms: 0.0,
            cfg_off_delay_ms: 0.0,
            min_on_ms: 0.0,
            pending_off: false,
            release_ms: 0.0,
            effective_volume: 0,
            timbre: Timbre::DEFAULT,
        }
    }

    /// Whether the voice has already issued (or scheduled) its key-off.
    pub fn is_released(&self) -> bool {
        matches!(self.state, VoiceState::Off | VoiceState::Releasing)
    }
}

impl Default for OplVoice {
    fn default() -> Self {
        Self::new()
    }
}

/// Voice-stealing policy.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ChanAlloc {
    /// Pick by instrument cost: `SameInstrument` for double-voice
    /// instruments, `OffDelay` otherwise.
    #[default]
    Auto,
    /// Prefer the most-faded free voice.
    OffDelay,
    /// Prefer free voices that already carry the wanted timbre, saving the
    /// patch rewrite.
    SameInstrument,
    /// Any voice that has issued its key-off qualifies equally.
    AnyReleased,
}

impl ChanAlloc {
    /// Resolve `Auto` against the incoming instrument's cost.
    pub fn resolve(self, double_voice: bool) -> ChanAlloc {
        match self {
            ChanAlloc::Auto => {
                if double_voice {
                    ChanAlloc::SameInstrument
                } else {
                    ChanAlloc::OffDelay
                }
            }
            other => other,
        }
    }
}

/// Tier width of the allocation score. A score below `SCORE_TIER` means
/// the voice can be taken without cutting a live note short.
pub const SCORE_TIER: i64 = 1 << 40;

/// Score a candidate voice; lower is a better steal.
///
/// The tiers follow the eviction order: free voices first (most-faded
/// first), then releasing ones (oldest release first), then sustained,
/// then sounding notes by ascending effective volume.
pub fn allocation_score(
    voice: &OplVoice,
    policy: ChanAlloc,
    now_tick: u64,
    wanted_timbre: &Timbre,
) -> i64 {
    let score = match voice.state {
        VoiceState::Off => {
            // Tie-break by the remaining release tail: the most faded
            // voice wins.
            voice.release_ms as i64
        }
        VoiceState::Releasing => {
            let age = now_tick.saturating_sub(voice.koff_tick) as i64;
            if policy == ChanAlloc::AnyReleased {
                // Released voices rank with the free ones.
                (voice.release_ms + voice.off_delay_ms) as i64
            } else {
                SCORE_TIER + (1 << 20) - age.min(1 << 20)
            }
        }
        VoiceState::Sustained => {
            2 * SCORE_TIER + now_tick.saturating_sub(voice.kon_tick) as i64
        }
        VoiceState::On => 3 * SCORE_TIER + i64::from(voice.effective_volume),
    };

    // A released voice already carrying the wanted timbre needs no patch
    // rewrite; rank it ahead of every clean candidate.
    if policy == ChanAlloc::SameInstrument
        && voice.is_released()
        && voice.timbre == *wanted_timbre
    {
        return voice.release_ms as i64 - SCORE_TIER;
    }

    score
}

#[cfg(test)]
mod tests {
    use super::*;

    fn voice(state: VoiceState) -> OplVoice {
        let mut v = OplVoice::new();
        v.state = state;
        v
    }

    #[test]
    fn test_off_beats_everything() {
        let off = voice(VoiceState::Off);
        let wanted = Timbre::DEFAULT;
        for other in [VoiceState::Releasing, VoiceState::Sustained, VoiceState::On] {
            let v = voice(other);
            assert!(
                allocation_score(&off, ChanAlloc::OffDelay, 100, &wanted)
                    < allocation_score(&v, ChanAlloc::OffDelay, 100, &wanted),
                "Off must beat {other:?}"
            );
        }
    }

    #[test]
    fn test_on_ranked_by_effective_volume() {
        let wanted = Timbre::DEFAULT;
        let mut quiet = voice(VoiceState::On);
        quiet.effective_volume = 100;
        let mut loud = voice(VoiceState::On);
        loud.effective_volume = 100_000;
        assert!(
            allocation_score(&quiet, ChanAlloc::OffDelay, 10, &wanted)
                < allocation_score(&loud, ChanAlloc::OffDelay, 10, &wanted)
        );
    }

    #[test]
    fn test_releasing_older_preferred() {
        let wanted = Timbre::DEFAULT;
        let mut old = voice(VoiceState::Releasing);
        old.koff_tick = 10;
        let mut fresh = voice(VoiceState::Releasing);
        fresh.koff_tick = 990;
        assert!(
            allocation_score(&old, ChanAlloc::OffDelay, 1000, &wanted)
                < allocation_score(&fresh, ChanAlloc::OffDelay, 1000, &wanted)
        );
    }

    #[test]
    fn test_same_instrument_bonus() {
        let wanted = Timbre {
            modulator_e862: 0x1234_5678,
            ..Timbre::DEFAULT
        };
        let mut matching = voice(VoiceState::Off);
        matching.timbre = wanted;
        matching.release_ms = 200.0;
        let clean = voice(VoiceState::Off);

        // Under SameInstrument the cached voice wins despite its tail.
        assert!(
            allocation_score(&matching, ChanAlloc::SameInstrument, 0, &wanted)
                < allocation_score(&clean, ChanAlloc::SameInstrument, 0, &wanted)
        );
        // Under OffDelay the cleaner voice wins.
        assert!(
            allocation_score(&clean, ChanAlloc::OffDelay, 0, &wanted)
                < allocation_score(&matching, ChanAlloc::OffDelay, 0, &wanted)
        );
    }

    #[test]
    fn test_any_released_merges_tiers() {
        let wanted = Timbre::DEFAULT;
        let mut releasing = voice(VoiceState::Releasing);
        releasing.koff_tick = 0;
        releasing.release_ms = 10.0;
        let mut off = voice(VoiceState::Off);
        off.release_ms = 250.0;

        // AnyReleased ranks a nearly-faded releasing voice above a free
        // voice with a longer tail.
        assert!(
            allocation_score(&releasing, ChanAlloc::AnyReleased, 100, &wanted)
                < allocation_score(&off, ChanAlloc::AnyReleased, 100, &wanted)
        );
    }

    #[test]
    fn test_auto_resolution() {
        assert_eq!(ChanAlloc::Auto.resolve(true), ChanAlloc::SameInstrument);
        assert_eq!(ChanAlloc::Auto.resolve(false), ChanAlloc::OffDelay);
        assert_eq!(ChanAlloc::OffDelay.resolve(true), ChanAlloc::OffDelay);
    }
}
