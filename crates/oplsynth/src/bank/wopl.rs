//! WOPL bank file reader and writer.
//!
//! WOPL is the canonical bank container for OPL instrument sets: operator
//! data plus the MIDI mapping metadata (bank MSB/LSB, note offsets, rhythm
//! flags, key-on/off delays). The layout is fixed and big-endian where
//! multi-byte:
//!
//! - Magic `"WOPL3-BANK\0"` (11 bytes), then a `u16` version (1..=3).
//! - `u16` melodic-bank count, `u16` percussion-bank count, one byte of
//!   global flags (bit 0 deep tremolo, bit 1 deep vibrato), one byte
//!   volume-model id.
//! - Version >= 2 adds per-bank meta blocks (32-byte name, LSB, MSB),
//!   melodic banks first.
//! - Then `128` instrument records per bank, melodic banks first. A record
//!   is 62 bytes (66 from version 3, which appends the two delay fields).
//!
//! The reader accepts any supported version; the writer always emits
//! version 3.

use super::instrument::{Instrument, Timbre};
use crate::error::BankError;

/// File magic, including the terminating NUL.
pub const WOPL_MAGIC: &[u8; 11] = b"WOPL3-BANK\0";

/// Latest supported (and emitted) format version.
pub const WOPL_VERSION: u16 = 3;

const INST_SIZE_V1: usize = 62;
const INST_SIZE_V3: usize = 66;

/// One bank worth of instruments plus its MIDI identity.
#[derive(Debug, Clone)]
pub struct WoplBank {
    /// UTF-8 bank name (may be empty; at most 31 bytes are stored).
    pub name: String,
    pub lsb: u8,
    pub msb: u8,
    /// 128 program entries. Blank programs carry [`Instrument::BLANK`].
    pub instruments: Vec<Instrument>,
    /// Instrument names, parallel to `instruments`.
    pub names: Vec<String>,
}

impl WoplBank {
    /// An empty bank with the given identity, all programs blank.
    pub fn empty(msb: u8, lsb: u8) -> Self {
        WoplBank {
            name: String::new(),
            lsb,
            msb,
            instruments: vec![Instrument::BLANK; 128],
            names: vec![String::new(); 128],
        }
    }
}

/// Parsed WOPL file contents.
#[derive(Debug, Clone)]
pub struct WoplFile {
    pub version: u16,
    pub deep_tremolo: bool,
    pub deep_vibrato: bool,
    /// Raw volume-model selector byte as stored in the file.
    pub volume_model: u8,
    pub melodic: Vec<WoplBank>,
    pub percussive: Vec<WoplBank>,
}

impl WoplFile {
    /// A minimal file with one empty melodic and one empty percussion bank.
    pub fn empty() -> Self {
        WoplFile {
            version: WOPL_VERSION,
            deep_tremolo: false,
            deep_vibrato: false,
            volume_model: 0,
            melodic: vec![WoplBank::empty(0, 0)],
            percussive: vec![WoplBank::empty(0, 0)],
        }
    }
}

fn read_u8(bytes: &[u8], off: usize) -> Result<u8, BankError> {
    bytes
        .get(off)
        .copied()
        .ok_or(BankError::UnexpectedEof { offset: off, needed: 1 })
}

fn read_u16_be(bytes: &[u8], off: usize) -> Result<u16, BankError> {
    if bytes.len() < off + 2 {
        return Err(BankError::UnexpectedEof { offset: off, needed: 2 });
    }
    Ok(u16::from_be_bytes([bytes[off], bytes[off + 1]]))
}

fn read_i16_be(bytes: &[u8], off: usize) -> Result<i16, BankError> {
    Ok(read_u16_be(bytes, off)? as i16)
}

fn read_slice<'a>(bytes: &'a [u8], off: usize, len: usize) -> Result<&'a [u8], BankError> {
    if bytes.len() < off + len {
        return Err(BankError::UnexpectedEof { offset: off, needed: len });
    }
    Ok(&bytes[off..off + len])
}

fn name_from_bytes(raw: &[u8]) -> String {
    let end = raw.iter().position(|&b| b == 0).unwrap_or(raw.len());
    String::from_utf8_lossy(&raw[..end]).into_owned()
}

fn name_to_bytes(name: &str) -> [u8; 32] {
    let mut out = [0u8; 32];
    let src = name.as_bytes();
    let n = src.len().min(31);
    out[..n].copy_from_slice(&src[..n]);
    out
}

/// WOPL flag byte -> internal [`Instrument`] flags. The rhythm bits share
/// the same encoding in both representations.
fn flags_from_wopl(raw: u8) -> u8 {
    let mut flags = raw & Instrument::MASK_RHYTHM;
    if (raw & 0x04) != 0 {
        flags |= Instrument::FLAG_NO_SOUND;
    }
    if (raw & 0x02) != 0 {
        flags |= Instrument::FLAG_PSEUDO_4OP;
    } else if (raw & 0x01) != 0 {
        flags |= Instrument::FLAG_REAL_4OP;
    }
    flags
}

fn flags_to_wopl(flags: u8) -> u8 {
    let mut raw = flags & Instrument::MASK_RHYTHM;
    if (flags & Instrument::FLAG_NO_SOUND) != 0 {
        raw |= 0x04;
    }
    if (flags & Instrument::FLAG_PSEUDO_4OP) != 0 {
        raw |= 0x03; // double voice implies the 4-op bit in the file
    } else if (flags & Instrument::FLAG_REAL_4OP) != 0 {
        raw |= 0x01;
    }
    raw
}

/// Detune byte stored in the file -> fractional semitones.
fn detune_from_byte(raw: i8) -> f64 {
    f64::from(raw) / 64.0
}

fn detune_to_byte(detune: f64) -> i8 {
    (detune * 64.0).round().clamp(-128.0, 127.0) as i8
}

/// Read one 5-byte operator record into the (e862, ksl/tl) pair.
fn read_operator(bytes: &[u8], off: usize) -> Result<(u32, u8), BankError> {
    let raw = read_slice(bytes, off, 5)?;
    let e862 = (raw[0] as u32)
        | ((raw[2] as u32) << 8)
        | ((raw[3] as u32) << 16)
        | ((raw[4] as u32) << 24);
    Ok((e862, raw[1]))
}

fn write_operator(out: &mut Vec<u8>, e862: u32, ksltl: u8) {
    out.push((e862 & 0xFF) as u8);
    out.push(ksltl);
    out.push(((e862 >> 8) & 0xFF) as u8);
    out.push(((e862 >> 16) & 0xFF) as u8);
    out.push(((e862 >> 24) & 0xFF) as u8);
}

fn read_instrument(
    bytes: &[u8],
    off: usize,
    version: u16,
) -> Result<(Instrument, String), BankError> {
    let name = name_from_bytes(read_slice(bytes, off, 32)?);
    let note_offset1 = read_i16_be(bytes, off + 32)?;
    let note_offset2 = read_i16_be(bytes, off + 34)?;
    let velocity_offset = read_u8(bytes, off + 36)? as i8;
    let percussion_key = read_u8(bytes, off + 37)?;
    let flags = flags_from_wopl(read_u8(bytes, off + 38)?);
    let detune = detune_from_byte(read_u8(bytes, off + 39)? as i8);

    let (mod1_e862, mod1_40) = read_operator(bytes, off + 40)?;
    let (car1_e862, car1_40) = read_operator(bytes, off + 45)?;
    let (mod2_e862, mod2_40) = read_operator(bytes, off + 50)?;
    let (car2_e862, car2_40) = read_operator(bytes, off + 55)?;
    let feedconn1 = read_u8(bytes, off + 60)?;
    let feedconn2 = read_u8(bytes, off + 61)?;

    let (delay_on_ms, delay_off_ms) = if version >= 3 {
        (read_u16_be(bytes, off + 62)?, read_u16_be(bytes, off + 64)?)
    } else {
        (0, 0)
    };

    let ins = Instrument {
        timbres: [
            Timbre {
                modulator_e862: mod1_e862,
                carrier_e862: car1_e862,
                modulator_40: mod1_40,
                carrier_40: car1_40,
                feedconn: feedconn1,
                note_offset: note_offset1,
            },
            Timbre {
                modulator_e862: mod2_e862,
                carrier_e862: car2_e862,
                modulator_40: mod2_40,
                carrier_40: car2_40,
                feedconn: feedconn2,
                note_offset: note_offset2,
            },
        ],
        velocity_offset,
        percussion_key,
        second_voice_detune: detune,
        flags,
        delay_on_ms,
        delay_off_ms,
    };

    Ok((ins, name))
}

fn write_instrument(out: &mut Vec<u8>, ins: &Instrument, name: &str) {
    out.extend_from_slice(&name_to_bytes(name));
    out.extend_from_slice(&ins.timbres[0].note_offset.to_be_bytes());
    out.extend_from_slice(&ins.timbres[1].note_offset.to_be_bytes());
    out.push(ins.velocity_offset as u8);
    out.push(ins.percussion_key);
    out.push(flags_to_wopl(ins.flags));
    out.push(detune_to_byte(ins.second_voice_detune) as u8);
    for t in &ins.timbres {
        write_operator(out, t.modulator_e862, t.modulator_40);
        write_operator(out, t.carrier_e862, t.carrier_40);
    }
    out.push(ins.timbres[0].feedconn);
    out.push(ins.timbres[1].feedconn);
    out.extend_from_slice(&ins.delay_on_ms.to_be_bytes());
    out.extend_from_slice(&ins.delay_off_ms.to_be_bytes());
}

/// Parse a WOPL bank image from memory.
pub fn parse(bytes: &[u8]) -> Result<WoplFile, BankError> {
    let magic = read_slice(bytes, 0, 11)?;
    if magic != WOPL_MAGIC {
        let mut got = [0u8; 11];
        got.copy_from_slice(magic);
        return Err(BankError::InvalidMagic(got));
    }

    let version = read_u16_be(bytes, 11)?;
    if version == 0 || version > WOPL_VERSION {
        return Err(BankError::UnsupportedVersion(version));
    }

    let melodic_count = read_u16_be(bytes, 13)? as usize;
    let percussion_count = read_u16_be(bytes, 15)? as usize;
    let global_flags = read_u8(bytes, 17)?;
    let volume_model = read_u8(bytes, 18)?;

    if melodic_count == 0 && percussion_count == 0 {
        return Err(BankError::InconsistentCounts(
            "file declares zero banks".into(),
        ));
    }

    let mut off = 19;
    let read_bank_meta = |off: &mut usize| -> Result<WoplBank, BankError> {
        let mut bank = WoplBank::empty(0, 0);
        if version >= 2 {
            bank.name = name_from_bytes(read_slice(bytes, *off, 32)?);
            bank.lsb = read_u8(bytes, *off + 32)?;
            bank.msb = read_u8(bytes, *off + 33)?;
            *off += 34;
        }
        Ok(bank)
    };

    let mut melodic = Vec::with_capacity(melodic_count);
    for _ in 0..melodic_count {
        melodic.push(read_bank_meta(&mut off)?);
    }
    let mut percussive = Vec::with_capacity(percussion_count);
    for _ in 0..percussion_count {
        percussive.push(read_bank_meta(&mut off)?);
    }

    let inst_size = if version >= 3 { INST_SIZE_V3 } else { INST_SIZE_V1 };
    let needed = (melodic_count + percussion_count) * 128 * inst_size;
    if bytes.len() < off + needed {
        return Err(BankError::InconsistentCounts(format!(
            "need {} instrument bytes, file has {}",
            needed,
            bytes.len().saturating_sub(off)
        )));
    }

    for bank in melodic.iter_mut().chain(percussive.iter_mut()) {
        for i in 0..128 {
            let (ins, name) = read_instrument(bytes, off, version)?;
            bank.instruments[i] = ins;
            bank.names[i] = name;
            off += inst_size;
        }
    }

    Ok(WoplFile {
        version,
        deep_tremolo: (global_flags & 0x01) != 0,
        deep_vibrato: (global_flags & 0x02) != 0,
        volume_model,
        melodic,
        percussive,
    })
}

/// Serialize a bank set as a version-3 WOPL image.
pub fn serialize(file: &WoplFile) -> Vec<u8> {
    let mut out = Vec::new();
    out.extend_from_slice(WOPL_MAGIC);
    out.extend_from_slice(&WOPL_VERSION.to_be_bytes());
    out.extend_from_slice(&(file.melodic.len() as u16).to_be_bytes());
    out.extend_from_slice(&(file.percussive.len() as u16).to_be_bytes());
    let mut global_flags = 0u8;
    if file.deep_tremolo {
        global_flags |= 0x01;
    }
    if file.deep_vibrato {
        global_flags |= 0x02;
    }
    out.push(global_flags);
    out.push(file.volume_model);

    for bank in file.melodic.iter().chain(file.percussive.iter()) {
        out.extend_from_slice(&name_to_bytes(&bank.name));
        out.push(bank.lsb);
        out.push(bank.msb);
    }

    for bank in file.melodic.iter().chain(file.percussive.iter()) {
        for (ins, name) in bank.instruments.iter().zip(bank.names.iter()) {
            write_instrument(&mut out, ins, name);
        }
    }

    out
}
