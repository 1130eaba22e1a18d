//! Instrument banks: lookup, GM/XG bank selection, WOPL I/O.
//!
//! A [`Bank`] is 128 program slots. The [`BankDb`] maps a MIDI bank
//! identity (MSB, LSB, melodic-or-percussive) to a bank and resolves
//! program lookups with the customary fallback chain (exact bank, then
//! LSB 0, then bank 0). Banks are immutable once loaded; the database can
//! be shared by reference between synth instances.

pub mod instrument;
pub mod wopl;

use std::collections::BTreeMap;

pub use instrument::{Instrument, RhythmSlot, Timbre};

use crate::model::VolumeModelId;
use wopl::{WoplBank, WoplFile};

/// Identity of one bank inside the database.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub struct BankKey {
    pub msb: u8,
    pub lsb: u8,
    /// Percussion banks live in a separate namespace from melodic ones.
    pub percussive: bool,
}

impl BankKey {
    pub fn melodic(msb: u8, lsb: u8) -> Self {
        BankKey { msb, lsb, percussive: false }
    }

    pub fn percussion(msb: u8, lsb: u8) -> Self {
        BankKey { msb, lsb, percussive: true }
    }
}

/// 128 program slots.
#[derive(Debug, Clone)]
pub struct Bank {
    pub name: String,
    pub instruments: Vec<Instrument>,
}

impl Bank {
    pub fn empty(name: &str) -> Self {
        Bank {
            name: name.to_string(),
            instruments: vec![Instrument::BLANK; 128],
        }
    }
}

/// Global bank-level flags consumed at load time.
#[derive(Debug, Clone, Copy, Default)]
pub struct BankSetup {
    pub deep_tremolo: bool,
    pub deep_vibrato: bool,
    pub scale_modulators: bool,
    pub mt32_defaults: bool,
    pub volume_model: VolumeModelId,
}

/// The set of banks active on a synth instance.
#[derive(Debug, Clone)]
pub struct BankDb {
    banks: BTreeMap<BankKey, Bank>,
    pub setup: BankSetup,
}

impl BankDb {
    pub fn new(setup: BankSetup) -> Self {
        BankDb {
            banks: BTreeMap::new(),
            setup,
        }
    }

    /// Number of embedded banks available to [`BankDb::embedded`].
    pub const EMBEDDED_COUNT: u32 = 1;

    /// Load an embedded bank by id. Id 0 is the default General MIDI set.
    pub fn embedded(id: u32) -> Option<Self> {
        match id {
            0 => Some(default_gm_bank()),
            _ => None,
        }
    }

    pub fn insert(&mut self, key: BankKey, bank: Bank) {
        self.banks.insert(key, bank);
    }

    pub fn get(&self, key: BankKey) -> Option<&Bank> {
        self.banks.get(&key)
    }

    pub fn bank_count(&self) -> usize {
        self.banks.len()
    }

    /// Resolve a program to an instrument.
    ///
    /// Tries the exact (MSB, LSB) bank first, then (MSB, 0), then (0, LSB),
    /// then bank (0, 0). Blank entries do not satisfy a lookup and fall
    /// through to the next candidate. Returns `None` when every candidate
    /// is missing or blank.
    pub fn lookup(&self, msb: u8, lsb: u8, program: u8, percussive: bool) -> Option<&Instrument> {
        let program = (program & 0x7F) as usize;
        let candidates = [(msb, lsb), (msb, 0), (0, lsb), (0, 0)];

        for (i, &(m, l)) in candidates.iter().enumerate() {
            if candidates[..i].contains(&(m, l)) {
                continue;
            }
            let key = BankKey { msb: m, lsb: l, percussive };
            if let Some(bank) = self.banks.get(&key) {
                let ins = &bank.instruments[program];
                if !ins.is_blank() {
                    return Some(ins);
                }
            }
        }

        None
    }

    /// Build a database from a parsed WOPL file.
    pub fn from_wopl(file: &WoplFile) -> Self {
        let mut db = BankDb::new(BankSetup {
            deep_tremolo: file.deep_tremolo,
            deep_vibrato: file.deep_vibrato,
            scale_modulators: false,
            mt32_defaults: false,
            volume_model: VolumeModelId::from_raw(file.volume_model),
        });

        for (src, percussive) in [(&file.melodic, false), (&file.percussive, true)] {
            for wb in src {
                let key = BankKey { msb: wb.msb, lsb: wb.lsb, percussive };
                let bank = Bank {
                    name: wb.name.clone(),
                    instruments: wb.instruments.clone(),
                };
                db.banks.insert(key, bank);
            }
        }

        db
    }

    /// Export the database as a WOPL file image.
    pub fn to_wopl(&self) -> WoplFile {
        let mut file = WoplFile {
            version: wopl::WOPL_VERSION,
            deep_tremolo: self.setup.deep_tremolo,
            deep_vibrato: self.setup.deep_vibrato,
            volume_model: self.setup.volume_model as u8,
            melodic: Vec::new(),
            percussive: Vec::new(),
        };

        for (key, bank) in &self.banks {
            let wb = WoplBank {
                name: bank.name.clone(),
                lsb: key.lsb,
                msb: key.msb,
                instruments: bank.instruments.clone(),
                names: vec![String::new(); 128],
            };
            if key.percussive {
                file.percussive.push(wb);
            } else {
                file.melodic.push(wb);
            }
        }

        // A WOPL file must declare at least one bank on each side.
        if file.melodic.is_empty() {
            file.melodic.push(WoplBank::empty(0, 0));
        }
        if file.percussive.is_empty() {
            file.percussive.push(WoplBank::empty(0, 0));
        }

        file
    }
}

const fn timbre(
    mod_e862: u32,
    car_e862: u32,
    mod_40: u8,
    car_40: u8,
    feedconn: u8,
) -> Timbre {
    Timbre {
        modulator_e862: mod_e862,
        carrier_e862: car_e862,
        modulator_40: mod_40,
        carrier_40: car_40,
        feedconn,
        note_offset: 0,
    }
}

/// One melodic timbre template per GM instrument family (programs are
/// grouped in eights). Operator words are (0x20, 0x60, 0x80, 0xE0) bytes
/// LSB first.
const GM_FAMILY_TIMBRES: [Timbre; 16] = [
    // Pianos: fast strike, medium decay
    timbre(0x0054_F201, 0x0074_F201, 0x1B, 0x00, 0x06),
    // Chromatic percussion: bell partials
    timbre(0x0135_F507, 0x0145_F502, 0x19, 0x00, 0x0A),
    // Organs: sustained, no decay
    timbre(0x0007_F021, 0x0007_F021, 0x23, 0x00, 0x01),
    // Guitars: plucked, bright attack
    timbre(0x0045_F311, 0x0076_F211, 0x28, 0x00, 0x08),
    // Basses: heavy fundamental
    timbre(0x0035_F321, 0x0056_F221, 0x16, 0x00, 0x0A),
    // Strings: slow attack, full sustain
    timbre(0x0016_8261, 0x0026_7261, 0x1D, 0x05, 0x07),
    // Ensemble: detuned string mass
    timbre(0x0016_7361, 0x0026_7263, 0x21, 0x05, 0x07),
    // Brass: ramped attack, buzzy
    timbre(0x0017_9221, 0x0037_8221, 0x19, 0x00, 0x0C),
    // Reeds: hollow, sustained
    timbre(0x0018_7231, 0x0028_7231, 0x1E, 0x00, 0x06),
    // Pipes: pure flute tone
    timbre(0x0027_64A1, 0x0037_8021, 0x2B, 0x00, 0x02),
    // Synth leads: saw-ish, loud
    timbre(0x0016_F121, 0x0026_F121, 0x11, 0x00, 0x0E),
    // Synth pads: slow swell
    timbre(0x0015_3261, 0x0025_3261, 0x1F, 0x03, 0x05),
    // Synth effects
    timbre(0x0234_5362, 0x0134_6162, 0x24, 0x00, 0x09),
    // Ethnic: plucked folk instruments
    timbre(0x0046_F315, 0x0066_F211, 0x22, 0x00, 0x08),
    // Percussive: struck, quick release
    timbre(0x0076_F401, 0x0076_F501, 0x18, 0x00, 0x0C),
    // Sound effects: noise-leaning
    timbre(0x02F5_31F0, 0x01F6_3170, 0x30, 0x00, 0x0E),
];

/// Percussion timbre groups for the default drum bank.
const GM_DRUM_TIMBRES: [Timbre; 5] = [
    // Kicks
    timbre(0x0018_F401, 0x0018_F801, 0x0A, 0x00, 0x08),
    // Snares and claps
    timbre(0x0327_F800, 0x02F8_F4F0, 0x1C, 0x00, 0x0E),
    // Toms
    timbre(0x0028_F501, 0x0038_F601, 0x12, 0x00, 0x08),
    // Cymbals
    timbre(0x03F7_31F2, 0x02F9_52F4, 0x20, 0x00, 0x0E),
    // Hi-hats
    timbre(0x03F8_62F1, 0x02F9_72F3, 0x26, 0x00, 0x0E),
];

/// Drum-timbre group for a GM percussion key.
fn drum_group(key: u8) -> usize {
    match key {
        35 | 36 => 0,                         // bass drums
        38 | 40 | 39 => 1,                    // snares, clap
        41 | 43 | 45 | 47 | 48 | 50 => 2,     // toms
        49 | 51 | 52 | 53 | 55 | 57 | 59 => 3, // cymbals
        42 | 44 | 46 => 4,                    // hi-hats
        _ => 2,
    }
}

/// Build the embedded default General MIDI bank.
fn default_gm_bank() -> BankDb {
    let mut db = BankDb::new(BankSetup {
        deep_tremolo: false,
        deep_vibrato: false,
        scale_modulators: false,
        mt32_defaults: false,
        volume_model: VolumeModelId::Generic,
    });

    let mut melodic = Bank::empty("Default (GM)");
    for program in 0..128usize {
        let timbre = GM_FAMILY_TIMBRES[program / 8];
        melodic.instruments[program] = Instrument::two_op(timbre);
    }
    db.insert(BankKey::melodic(0, 0), melodic);

    let mut percussion = Bank::empty("Default (GM drums)");
    for key in 27..=87u8 {
        let mut ins = Instrument::two_op(GM_DRUM_TIMBRES[drum_group(key)]);
        ins.percussion_key = key;
        percussion.instruments[key as usize] = ins;
    }
    db.insert(BankKey::percussion(0, 0), percussion);

    db
}
