//! Auto-arpeggio: time-slicing notes over exhausted voice pools.
//!
//! When a channel requests more simultaneous notes than voices are
//! available, the allocator can park the overflow here instead of dropping
//! it. The arpeggiator then cycles the parked notes against the channel's
//! sounding ones at a fixed rate, so every requested note gets audible
//! time slices. Off by default; one switch on the synth enables it.

use std::collections::VecDeque;

/// Cycling rate of the arpeggiator.
pub const ARPEGGIO_RATE_HZ: f64 = 25.0;

/// Parked note waiting for a time slice.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PendingNote {
    pub key: u8,
    pub velocity: u8,
}

/// Per-channel arpeggio queue.
#[derive(Debug, Clone, Default)]
pub struct Arpeggio {
    pending: VecDeque<PendingNote>,
    timer_s: f64,
}

impl Arpeggio {
    pub fn new() -> Self {
        Arpeggio::default()
    }

    /// Park a note that found no voice.
    pub fn push(&mut self, key: u8, velocity: u8) {
        // A re-struck parked key replaces its old entry.
        self.pending.retain(|n| n.key != key);
        self.pending.push_back(PendingNote { key, velocity });
    }

    /// Drop a parked note (its note-off arrived before it ever sounded).
    pub fn remove(&mut self, key: u8) -> bool {
        let before = self.pending.len();
        self.pending.retain(|n| n.key != key);
        before != self.pending.len()
    }

    pub fn clear(&mut self) {
        self.pending.clear();
        self.timer_s = 0.0;
    }

    pub fn is_empty(&self) -> bool {
        self.pending.is_empty()
    }

    /// Advance the clock; returns the note due for its slice, if the
    /// period elapsed and something is parked.
    pub fn tick(&mut self, dt: f64) -> Option<PendingNote> {
        if self.pending.is_empty() {
            self.timer_s = 0.0;
            return None;
        }
        self.timer_s += dt;
        let period = 1.0 / ARPEGGIO_RATE_HZ;
        if self.timer_s < period {
            return None;
        }
        self.timer_s -= period;
        self.pending.pop_front()
    }

    /// Re-park a note whose slice ended.
    pub fn requeue(&mut self, note: PendingNote) {
        self.pending.push_back(note);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_fifo_cycling() {
        let mut arp = Arpeggio::new();
        arp.push(60, 100);
        arp.push(64, 100);

        assert_eq!(arp.tick(0.01), None);
        let first = arp.tick(0.04).expect("period elapsed");
        assert_eq!(first.key, 60);
        arp.requeue(first);

        let second = arp.tick(0.05).expect("next slice");
        assert_eq!(second.key, 64);
    }

    #[test]
    fn test_remove_parked_note() {
        let mut arp = Arpeggio::new();
        arp.push(60, 100);
        assert!(arp.remove(60));
        assert!(!arp.remove(60));
        assert!(arp.is_empty());
    }

    #[test]
    fn test_restrike_replaces() {
        let mut arp = Arpeggio::new();
        arp.push(60, 50);
        arp.push(60, 120);
        let note = arp.tick(1.0).unwrap();
        assert_eq!(note.velocity, 120);
        assert!(arp.is_empty());
    }
}
