//! Volume models: MIDI dynamics -> operator Total Level values.
//!
//! A volume model folds velocity, channel volume (CC7), expression (CC11)
//! and the master volume into the final TL bytes for the modulator and
//! carrier operators of a voice. Which of the two operators receives the
//! attenuation depends on the voice mode (whether the modulator is audible
//! in the current FM/AM routing); the caller resolves that into the
//! `do_modulator`/`do_carrier` flags before applying the model.
//!
//! The Win9x, HMI and MS-AdLib table models and the O'Connell velocity
//! curve replicate the original drivers byte for byte. The DMX curve uses
//! the engine's 128-entry mapping table. The remaining models reproduce
//! their engines' arithmetic shapes.

/// OPL voice operator-pair routing, as seen by the volume models.
///
/// For 4-op voices the mode also encodes which half of the pair is being
/// leveled, since the audibility of each operator differs between the two
/// channel halves.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum VoiceMode {
    TwoOpFm = 0,
    TwoOpAm = 1,
    FourOp12FmFm = 2,
    FourOp12AmFm = 3,
    FourOp12FmAm = 4,
    FourOp12AmAm = 5,
    FourOp34FmFm = 6,
    FourOp34AmFm = 7,
    FourOp34FmAm = 8,
    FourOp34AmAm = 9,
}

impl VoiceMode {
    /// Reconstruct a mode from its raw discriminant, clamping unknown
    /// values to plain 2-op FM.
    pub fn from_raw(raw: u8) -> Self {
        match raw {
            0 => VoiceMode::TwoOpFm,
            1 => VoiceMode::TwoOpAm,
            2 => VoiceMode::FourOp12FmFm,
            3 => VoiceMode::FourOp12AmFm,
            4 => VoiceMode::FourOp12FmAm,
            5 => VoiceMode::FourOp12AmAm,
            6 => VoiceMode::FourOp34FmFm,
            7 => VoiceMode::FourOp34AmFm,
            8 => VoiceMode::FourOp34FmAm,
            9 => VoiceMode::FourOp34AmAm,
            _ => VoiceMode::TwoOpFm,
        }
    }

    /// Whether the (modulator, carrier) operators are audible outputs in
    /// this mode and therefore take the volume attenuation.
    pub fn do_ops(self) -> (bool, bool) {
        match self {
            VoiceMode::TwoOpFm => (false, true),
            VoiceMode::TwoOpAm => (true, true),
            VoiceMode::FourOp12FmFm => (false, false),
            VoiceMode::FourOp12AmFm => (true, false),
            VoiceMode::FourOp12FmAm => (false, true),
            VoiceMode::FourOp12AmAm => (true, false),
            VoiceMode::FourOp34FmFm => (false, true),
            VoiceMode::FourOp34AmFm => (false, true),
            VoiceMode::FourOp34FmAm => (false, true),
            VoiceMode::FourOp34AmAm => (true, true),
        }
    }
}

/// Volume computation context, filled in by the chip frontend and mutated
/// in place by the selected model.
#[derive(Debug, Clone, Copy)]
pub struct VolumeContext {
    /// MIDI key velocity (0..=127, already offset by the instrument).
    pub velocity: u8,
    /// Channel volume, CC7.
    pub channel_volume: u8,
    /// Channel expression, CC11.
    pub expression: u8,
    /// Master volume (0..=127).
    pub master_volume: u8,
    /// Operator-pair routing of the voice being leveled.
    pub voice_mode: VoiceMode,
    /// Feedback/connection byte. Consumed by the old HMI model only.
    pub feedconn: u8,
    /// Modulator TL (KSL bits stripped); input is the bank value, output
    /// the value to write.
    pub tl_mod: u8,
    /// Carrier TL (KSL bits stripped).
    pub tl_car: u8,
    /// Apply attenuation to the modulator.
    pub do_modulator: bool,
    /// Apply attenuation to the carrier.
    pub do_carrier: bool,
    /// A percussion instrument is being played.
    pub is_drum: bool,
}

/// Selectable volume model.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum VolumeModel {
    /// Logarithmic curve over the product of all volume sources.
    #[default]
    Generic,
    /// Attenuation-domain addition close to raw OPL behaviour.
    Native,
    /// DMX as shipped: the computed level replaces the instrument TL.
    DmxOrig,
    /// DMX with the instrument TL respected.
    DmxFixed,
    /// Apogee Sound System as shipped, including the AM-modulator bug.
    ApogeeOrig,
    /// Apogee with the modulator scaled from its own TL.
    ApogeeFixed,
    /// Windows 9x SB16 driver table.
    W9xSb16,
    /// Windows 9x generic FM driver table.
    W9xGeneric,
    /// Audio Interface Library (Miles Sound System).
    Ail,
    /// HMI Sound Operating System, later revision.
    HmiNew,
    /// HMI Sound Operating System, early revision.
    HmiOld,
    /// AdLib / Sound Blaster driver for Windows 3.x.
    MsAdLib,
    /// Jamie O'Connell's FM driver.
    OConnell,
    /// RSXX engine: carrier-only soft scaling.
    Rsxx,
}

impl VolumeModel {
    /// Apply this model to the context, rewriting `tl_mod`/`tl_car`.
    pub fn apply(self, v: &mut VolumeContext) {
        match self {
            VolumeModel::Generic => generic_volume(v),
            VolumeModel::Native => native_volume(v),
            VolumeModel::DmxOrig => dmx_volume(v, false),
            VolumeModel::DmxFixed => dmx_volume(v, true),
            VolumeModel::ApogeeOrig => apogee_volume(v, false),
            VolumeModel::ApogeeFixed => apogee_volume(v, true),
            VolumeModel::W9xSb16 => w9x_volume(v, &W9X_SB16_VOLUME_MODEL),
            VolumeModel::W9xGeneric => w9x_volume(v, &W9X_GENERIC_FM_VOLUME_MODEL),
            VolumeModel::Ail => ail_volume(v),
            VolumeModel::HmiNew => hmi_new_volume(v),
            VolumeModel::HmiOld => hmi_old_volume(v),
            VolumeModel::MsAdLib => ms_adlib_volume(v),
            VolumeModel::OConnell => oconnell_volume(v),
            VolumeModel::Rsxx => rsxx_volume(v),
        }
    }
}

/// Product of channel volume, expression and master volume scaled back to
/// the 0..=127 range. 16129 = 127 * 127.
fn channel_product(v: &VolumeContext) -> u32 {
    u32::from(v.channel_volume) * u32::from(v.expression) * u32::from(v.master_volume) / 16129
}

// ---------------------------------------------------------------------------
// Generic
// ---------------------------------------------------------------------------

fn generic_volume(v: &mut VolumeContext) {
    let product = u64::from(v.velocity)
        * u64::from(v.channel_volume)
        * u64::from(v.expression)
        * u64::from(v.master_volume);

    // Logarithmic mapping of the 4-way product onto 0..=63; the threshold
    // keeps very quiet notes fully silent instead of denormal-quiet.
    let volume = if product > 8725 * 127 {
        ((product as f64).ln() * 11.541560327111707 - 1.601379199767093e2)
            .clamp(0.0, 63.0) as u32
    } else {
        0
    };

    if v.do_modulator {
        v.tl_mod = (63 - volume + (volume * u32::from(v.tl_mod)) / 63) as u8;
    }
    if v.do_carrier {
        v.tl_car = (63 - volume + (volume * u32::from(v.tl_car)) / 63) as u8;
    }
}

// ---------------------------------------------------------------------------
// Native
// ---------------------------------------------------------------------------

fn native_volume(v: &mut VolumeContext) {
    let product = u32::from(v.velocity)
        * u32::from(v.channel_volume)
        * u32::from(v.expression)
        * u32::from(v.master_volume);
    let attenuation = 63 - (product >> 21).min(63);

    if v.do_modulator {
        v.tl_mod = (u32::from(v.tl_mod) + attenuation).min(63) as u8;
    }
    if v.do_carrier {
        v.tl_car = (u32::from(v.tl_car) + attenuation).min(63) as u8;
    }
}

// ---------------------------------------------------------------------------
// DMX
// ---------------------------------------------------------------------------

const DMX_VOLUME_MODEL: [u8; 128] = [
    0, 1, 3, 5, 6, 8, 10, 11, 13, 14, 16, 17, 19, 20, 22, 23, 25, 26, 27, 29, 30, 32, 33, 34,
    36, 37, 39, 41, 43, 45, 47, 49, 50, 52, 54, 55, 57, 59, 60, 61, 63, 64, 66, 67, 68, 69, 71,
    72, 73, 74, 75, 76, 77, 79, 80, 81, 82, 83, 84, 84, 85, 86, 87, 88, 89, 90, 91, 92, 92, 93,
    94, 95, 96, 96, 97, 98, 99, 99, 100, 101, 101, 102, 103, 103, 104, 105, 105, 106, 107, 107,
    108, 109, 109, 110, 110, 111, 112, 112, 113, 113, 114, 114, 115, 115, 116, 117, 117, 118,
    118, 119, 119, 120, 120, 121, 121, 122, 122, 123, 123, 123, 124, 124, 125, 125, 126, 126,
    127, 127,
];

fn dmx_volume(v: &mut VolumeContext, fixed: bool) {
    let scale = 2 * channel_product(v) + 1;
    let vel = DMX_VOLUME_MODEL[v.velocity.min(127) as usize];
    let volume = (u32::from(vel) * scale) >> 9; // 0..=63

    if v.do_carrier {
        v.tl_car = if fixed {
            (63 - (volume * (63 - u32::from(v.tl_car & 0x3F))) / 63) as u8
        } else {
            // The engine overwrites the carrier level outright; the patch
            // writer pre-seeds the register with the bank TL.
            (63 - volume) as u8
        };
    }
    if v.do_modulator {
        v.tl_mod = if fixed {
            (63 - (volume * (63 - u32::from(v.tl_mod & 0x3F))) / 63) as u8
        } else {
            (63 - volume) as u8
        };
    }
}

// ---------------------------------------------------------------------------
// Apogee
// ---------------------------------------------------------------------------

fn apogee_volume(v: &mut VolumeContext, fixed: bool) {
    let volume = channel_product(v);
    let volume = ((64 * (u32::from(v.velocity) + 0x80)) * volume) >> 15; // 0..=63

    if v.do_carrier {
        v.tl_car = (63 - (((63 - u32::from(v.tl_car & 0x3F)) * volume) >> 6)) as u8;
    }
    if v.do_modulator {
        // The original driver scales the modulator from the carrier's TL;
        // the fixed variant uses the modulator's own.
        let base = (if fixed { v.tl_mod } else { v.tl_car }) & 0x3F;
        v.tl_mod = (63 - (((63 - u32::from(base)) * volume) >> 6)) as u8;
    }
}

// ---------------------------------------------------------------------------
// Windows 9x
// ---------------------------------------------------------------------------

const W9X_GENERIC_FM_VOLUME_MODEL: [u32; 32] = [
    40, 36, 32, 28, 23, 21, 19, 17, 15, 14, 13, 12, 11, 10, 9, 8, 7, 6, 5, 5, 4, 4, 3, 3, 2, 2,
    1, 1, 1, 0, 0, 0,
];

const W9X_SB16_VOLUME_MODEL: [u32; 32] = [
    80, 63, 40, 36, 32, 28, 23, 21, 19, 17, 15, 14, 13, 12, 11, 10, 9, 8, 7, 6, 5, 5, 4, 4, 3,
    3, 2, 2, 1, 1, 0, 0,
];

fn w9x_volume(v: &mut VolumeContext, table: &[u32; 32]) {
    let volume = table[(channel_product(v) >> 2) as usize];
    let vel_att = table[(v.velocity >> 2) as usize];

    if v.do_carrier {
        v.tl_car = (u32::from(v.tl_car) + volume + vel_att).min(0x3F) as u8;
    }
    if v.do_modulator {
        v.tl_mod = (u32::from(v.tl_mod) + volume + vel_att).min(0x3F) as u8;
    }
}

// ---------------------------------------------------------------------------
// AIL
// ---------------------------------------------------------------------------

fn ail_volume(v: &mut VolumeContext) {
    let volume = (u32::from(v.velocity) * channel_product(v)) >> 7; // 0..=127

    if v.do_carrier {
        v.tl_car = (63 - (((63 - u32::from(v.tl_car & 0x3F)) * (volume + 1)) >> 7)) as u8;
    }
    if v.do_modulator {
        v.tl_mod = (63 - (((63 - u32::from(v.tl_mod & 0x3F)) * (volume + 1)) >> 7)) as u8;
    }
}

// ---------------------------------------------------------------------------
// HMI Sound Operating System
// ---------------------------------------------------------------------------

const HMI_VOLUME_TABLE: [u32; 64] = [
    0x3F, 0x3A, 0x35, 0x30, 0x2C, 0x29, 0x25, 0x24, 0x23, 0x22, 0x21, 0x20, 0x1F, 0x1E, 0x1D,
    0x1C, 0x1B, 0x1A, 0x19, 0x18, 0x17, 0x16, 0x15, 0x14, 0x13, 0x12, 0x11, 0x10, 0x0F, 0x0E,
    0x0E, 0x0D, 0x0D, 0x0C, 0x0C, 0x0B, 0x0B, 0x0A, 0x0A, 0x09, 0x09, 0x08, 0x08, 0x07, 0x07,
    0x06, 0x06, 0x06, 0x05, 0x05, 0x05, 0x04, 0x04, 0x04, 0x04, 0x03, 0x03, 0x03, 0x02, 0x02,
    0x02, 0x01, 0x01, 0x00,
];

fn hmi_scaled_volume(v: &VolumeContext) -> u32 {
    let volume = channel_product(v);
    let volume = (((volume * 128) / 127) * u32::from(v.velocity)) >> 7;
    HMI_VOLUME_TABLE[(volume.min(127) >> 1) as usize]
}

fn hmi_old_volume(v: &mut VolumeContext) {
    let volume = hmi_scaled_volume(v);

    if v.feedconn == 0 && !v.is_drum {
        let out = u32::from(v.channel_volume) * u32::from(v.expression) * 64 / 16129;
        let out = ((out * 128) / 127) * u32::from(v.velocity) >> 7;
        let out = HMI_VOLUME_TABLE[(out.min(127) >> 1) as usize];

        let out = (64 - out) << 1;
        let out = out * (64 - u32::from(v.tl_car & 0x3F));
        v.tl_mod = ((8192 - out) >> 7) as u8;
    }

    let out = if v.is_drum {
        (64 - HMI_VOLUME_TABLE[(v.velocity >> 1) as usize]) << 1
    } else {
        (64 - volume) << 1
    };

    let out = out * (64 - u32::from(v.tl_car & 0x3F));
    v.tl_car = ((8192 - out) >> 7) as u8;
}

fn hmi_new_volume(v: &mut VolumeContext) {
    let volume = hmi_scaled_volume(v);

    if v.do_modulator {
        let out = (64 - volume) << 1;
        let out = out * (64 - u32::from(v.tl_mod & 0x3F));
        v.tl_mod = ((8192 - out) >> 7) as u8;
    }
    if v.do_carrier {
        let out = (64 - volume) << 1;
        let out = out * (64 - u32::from(v.tl_car & 0x3F));
        v.tl_car = ((8192 - out) >> 7) as u8;
    }
}

// ---------------------------------------------------------------------------
// MS AdLib (Windows 3.x)
// ---------------------------------------------------------------------------

const MSADLIB_VOLUME_TABLE: [u8; 128] = [
    0, 0, 65, 65, 66, 66, 67, 67, 68, 68, 69, 69, 70, 70, 71, 71, 72, 72, 73, 73, 74, 74, 75,
    75, 76, 76, 77, 77, 78, 78, 79, 79, 80, 80, 81, 81, 82, 82, 83, 83, 84, 84, 85, 85, 86, 86,
    87, 87, 88, 88, 89, 89, 90, 90, 91, 91, 92, 92, 93, 93, 94, 94, 95, 95, 96, 96, 97, 97, 98,
    98, 99, 99, 100, 100, 101, 101, 102, 102, 103, 103, 104, 104, 105, 105, 106, 106, 107, 107,
    108, 108, 109, 109, 110, 110, 111, 111, 112, 112, 113, 113, 114, 114, 115, 115, 116, 116,
    117, 117, 118, 118, 119, 119, 120, 120, 121, 121, 122, 122, 123, 123, 124, 124, 125, 125,
    126, 126, 127, 127,
];

fn ms_adlib_volume(v: &mut VolumeContext) {
    let volume = channel_product(v);
    let volume = (u32::from(v.velocity) * volume) / 127;
    let volume = u32::from(MSADLIB_VOLUME_TABLE[volume.min(127) as usize]);

    if v.do_modulator {
        let out = 63 - u32::from(v.tl_mod & 0x3F);
        let out = out * volume;
        let out = out + (out + 0x7F);
        v.tl_mod = (63 - out / (2 * 0x7F)) as u8;
    }
    if v.do_carrier {
        let out = 63 - u32::from(v.tl_car & 0x3F);
        let out = out * volume;
        let out = out + (out + 0x7F);
        v.tl_car = (63 - out / (2 * 0x7F)) as u8;
    }
}

// ---------------------------------------------------------------------------
// O'Connell
// ---------------------------------------------------------------------------

/// Constant drum boost added by the driver.
const OCONNELL_DRUM_BOOST: u32 = 32;

const OCONNELL_VELOC_TABLE: [u8; 128] = [
    0x00, 0x08, 0x0A, 0x0F, 0x13, 0x16, 0x18, 0x1A, 0x1C, 0x1D, 0x1E, 0x20, 0x21, 0x22, 0x23,
    0x24, 0x24, 0x25, 0x26, 0x27, 0x27, 0x28, 0x28, 0x29, 0x2A, 0x2A, 0x2B, 0x2B, 0x2C, 0x2C,
    0x2C, 0x2D, 0x2D, 0x2E, 0x2E, 0x2E, 0x2F, 0x2F, 0x2F, 0x30, 0x30, 0x30, 0x31, 0x31, 0x31,
    0x32, 0x32, 0x32, 0x32, 0x33, 0x33, 0x33, 0x33, 0x34, 0x34, 0x34, 0x34, 0x35, 0x35, 0x35,
    0x35, 0x36, 0x36, 0x36, 0x36, 0x36, 0x37, 0x37, 0x37, 0x37, 0x37, 0x37, 0x38, 0x38, 0x38,
    0x38, 0x38, 0x39, 0x39, 0x39, 0x39, 0x39, 0x39, 0x39, 0x3A, 0x3A, 0x3A, 0x3A, 0x3A, 0x3A,
    0x3A, 0x3B, 0x3B, 0x3B, 0x3B, 0x3B, 0x3B, 0x3B, 0x3C, 0x3C, 0x3C, 0x3C, 0x3C, 0x3C, 0x3C,
    0x3C, 0x3D, 0x3D, 0x3D, 0x3D, 0x3D, 0x3D, 0x3D, 0x3D, 0x3E, 0x3E, 0x3E, 0x3E, 0x3E, 0x3E,
    0x3E, 0x3E, 0x3E, 0x3E, 0x3F, 0x3F, 0x3F, 0x3F,
];

fn oconnell_volume(v: &mut VolumeContext) {
    let tbl = |x: u8| u32::from(OCONNELL_VELOC_TABLE[x.min(127) as usize]);
    let mut volume = tbl(v.velocity) * tbl(v.channel_volume) * tbl(v.expression)
        * tbl(v.master_volume);

    if v.is_drum {
        volume >>= 19;
        volume += 2;
    } else {
        volume >>= 18;
        volume += 3; // compensate: the raw maximum lands on 60
    }

    if v.do_carrier {
        let mut work = volume * (63 - u32::from(v.tl_car & 0x3F));
        work >>= 6;
        if v.is_drum {
            work += OCONNELL_DRUM_BOOST;
        }
        v.tl_car = (63 - work.min(63)) as u8;
    }
    if v.do_modulator {
        let mut work = volume * (63 - u32::from(v.tl_mod & 0x3F));
        work >>= 6;
        if v.is_drum {
            work += OCONNELL_DRUM_BOOST;
        }
        v.tl_mod = (63 - work.min(63)) as u8;
    }
}

// ---------------------------------------------------------------------------
// RSXX
// ---------------------------------------------------------------------------

fn rsxx_volume(v: &mut VolumeContext) {
    // Carrier-only soft scaling; the engine never leveled modulators.
    let volume = (u32::from(v.velocity) * channel_product(v)) >> 7;
    let volume = volume >> 1; // 0..=63
    v.tl_car = (63 - (volume * (63 - u32::from(v.tl_car & 0x3F))) / 63) as u8;
}

// ---------------------------------------------------------------------------
// XG brightness
// ---------------------------------------------------------------------------

/// Convert an XG brightness controller value (CC74, 0..=127) into the OPL
/// modulator scale (0..=63) using the driver's square-root curve.
pub fn xg_brightness_to_opl(brightness: u32) -> u32 {
    let b = brightness as f64;
    ((127.0 * (b * (1.0 / 127.0)).sqrt()).round() / 2.0) as u32
}

#[cfg(test)]
mod tests {
    use super::*;

    const ALL_MODELS: [VolumeModel; 14] = [
        VolumeModel::Generic,
        VolumeModel::Native,
        VolumeModel::DmxOrig,
        VolumeModel::DmxFixed,
        VolumeModel::ApogeeOrig,
        VolumeModel::ApogeeFixed,
        VolumeModel::W9xSb16,
        VolumeModel::W9xGeneric,
        VolumeModel::Ail,
        VolumeModel::HmiNew,
        VolumeModel::HmiOld,
        VolumeModel::MsAdLib,
        VolumeModel::OConnell,
        VolumeModel::Rsxx,
    ];

    fn context(velocity: u8, channel_volume: u8, expression: u8) -> VolumeContext {
        VolumeContext {
            velocity,
            channel_volume,
            expression,
            master_volume: 127,
            voice_mode: VoiceMode::TwoOpFm,
            feedconn: 0x04,
            tl_mod: 0x10,
            tl_car: 0x00,
            do_modulator: false,
            do_carrier: true,
            is_drum: false,
        }
    }

    #[test]
    fn test_silence_attenuates_fully_or_nearly() {
        for model in ALL_MODELS {
            let mut v = context(0, 0, 0);
            model.apply(&mut v);
            assert!(v.tl_car >= 0x38, "{model:?}: tl_car {} for silence", v.tl_car);
        }
    }

    #[test]
    fn test_full_volume_keeps_carrier_loud() {
        for model in ALL_MODELS {
            let mut v = context(127, 127, 127);
            model.apply(&mut v);
            assert!(v.tl_car <= 0x08, "{model:?}: tl_car {} at maximum", v.tl_car);
        }
    }

    #[test]
    fn test_velocity_monotonic() {
        // Lower velocity must never yield a lower TL (louder output).
        for model in ALL_MODELS {
            let mut quiet = context(30, 100, 127);
            let mut loud = context(110, 100, 127);
            model.apply(&mut quiet);
            model.apply(&mut loud);
            assert!(
                quiet.tl_car >= loud.tl_car,
                "{model:?}: quiet {} < loud {}",
                quiet.tl_car,
                loud.tl_car
            );
        }
    }

    #[test]
    fn test_untouched_modulator_when_fm() {
        // 2-op FM with scale-modulators off: the modulator TL must stay at
        // the bank value for models that honor do_modulator.
        for model in [VolumeModel::Generic, VolumeModel::W9xSb16, VolumeModel::HmiNew] {
            let mut v = context(100, 100, 127);
            model.apply(&mut v);
            assert_eq!(v.tl_mod, 0x10, "{model:?} touched the modulator");
        }
    }

    #[test]
    fn test_voice_mode_do_ops_matrix() {
        assert_eq!(VoiceMode::TwoOpFm.do_ops(), (false, true));
        assert_eq!(VoiceMode::TwoOpAm.do_ops(), (true, true));
        assert_eq!(VoiceMode::FourOp12FmFm.do_ops(), (false, false));
        assert_eq!(VoiceMode::FourOp34AmAm.do_ops(), (true, true));
    }

    #[test]
    fn test_xg_brightness_curve() {
        assert_eq!(xg_brightness_to_opl(127), 63);
        assert_eq!(xg_brightness_to_opl(0), 0);
        // The curve is concave: halfway brightness keeps most of the range.
        let mid = xg_brightness_to_opl(64);
        assert!(mid > 32 && mid < 63, "midpoint {mid}");
    }

    #[test]
    fn test_dmx_orig_replaces_carrier_level() {
        // At full volume the original DMX model drives the carrier TL to 0
        // regardless of the bank TL.
        let mut v = context(127, 127, 127);
        v.tl_car = 0x20;
        VolumeModel::DmxOrig.apply(&mut v);
        assert_eq!(v.tl_car, 0);

        let mut v = context(127, 127, 127);
        v.tl_car = 0x20;
        VolumeModel::DmxFixed.apply(&mut v);
        assert!(v.tl_car >= 0x1F, "fixed model must respect the bank TL");
    }

    #[test]
    fn test_apogee_orig_modulator_bug() {
        // AM voice with differing TLs: the original scales the modulator
        // from the carrier TL, the fixed variant from its own.
        let mut orig = context(100, 100, 127);
        orig.voice_mode = VoiceMode::TwoOpAm;
        orig.do_modulator = true;
        orig.tl_mod = 0x30;
        orig.tl_car = 0x00;
        let mut fixed = orig;

        VolumeModel::ApogeeOrig.apply(&mut orig);
        VolumeModel::ApogeeFixed.apply(&mut fixed);
        assert!(orig.tl_mod < fixed.tl_mod);
    }
}
