//! Pluggable frequency and volume models.
//!
//! The original FM drivers this synthesizer can mimic each shipped with
//! their own pitch tables and loudness curves. Both are modeled as pure
//! functions selected once at configure time through [`VolumeModelId`]; the
//! per-note hot path only ever sees the two resolved function enums.

pub mod freq;
pub mod volume;

pub use freq::{FreqModel, KeyBlock};
pub use volume::{VoiceMode, VolumeContext, VolumeModel, xg_brightness_to_opl};

/// Bank-level volume model selector, as stored in WOPL files and accepted
/// by the public API.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
#[repr(u8)]
pub enum VolumeModelId {
    /// Keep whatever the loaded bank requests.
    #[default]
    Auto = 0,
    Generic = 1,
    Native = 2,
    Dmx = 3,
    Apogee = 4,
    W9xSb16 = 5,
    DmxFixed = 6,
    ApogeeFixed = 7,
    Ail = 8,
    W9xGeneric = 9,
    Hmi = 10,
    HmiOld = 11,
    MsAdLib = 12,
    ImfCreator = 13,
    OConnell = 14,
    Rsxx = 15,
}

impl VolumeModelId {
    /// Decode the raw selector byte from a bank file. Unknown values fall
    /// back to `Auto`.
    pub fn from_raw(raw: u8) -> Self {
        match raw {
            1 => VolumeModelId::Generic,
            2 => VolumeModelId::Native,
            3 => VolumeModelId::Dmx,
            4 => VolumeModelId::Apogee,
            5 => VolumeModelId::W9xSb16,
            6 => VolumeModelId::DmxFixed,
            7 => VolumeModelId::ApogeeFixed,
            8 => VolumeModelId::Ail,
            9 => VolumeModelId::W9xGeneric,
            10 => VolumeModelId::Hmi,
            11 => VolumeModelId::HmiOld,
            12 => VolumeModelId::MsAdLib,
            13 => VolumeModelId::ImfCreator,
            14 => VolumeModelId::OConnell,
            15 => VolumeModelId::Rsxx,
            _ => VolumeModelId::Auto,
        }
    }

    /// Resolve the selector into the frequency/volume function pair.
    ///
    /// Some selectors pair a foreign frequency curve with another engine's
    /// loudness curve (IMF Creator runs HMI pitch math with the fixed DMX
    /// levels); `Auto` resolves to the generic pair.
    pub fn resolve(self) -> (FreqModel, VolumeModel) {
        match self {
            VolumeModelId::Auto | VolumeModelId::Generic => {
                (FreqModel::Generic, VolumeModel::Generic)
            }
            VolumeModelId::Native => (FreqModel::Generic, VolumeModel::Native),
            VolumeModelId::Dmx => (FreqModel::Dmx, VolumeModel::DmxOrig),
            VolumeModelId::DmxFixed => (FreqModel::Dmx, VolumeModel::DmxFixed),
            VolumeModelId::Apogee => (FreqModel::Apogee, VolumeModel::ApogeeOrig),
            VolumeModelId::ApogeeFixed => (FreqModel::Apogee, VolumeModel::ApogeeFixed),
            VolumeModelId::W9xSb16 => (FreqModel::Win9x, VolumeModel::W9xSb16),
            VolumeModelId::W9xGeneric => (FreqModel::Win9x, VolumeModel::W9xGeneric),
            VolumeModelId::Hmi => (FreqModel::Hmi, VolumeModel::HmiNew),
            VolumeModelId::HmiOld => (FreqModel::Hmi, VolumeModel::HmiOld),
            VolumeModelId::Ail => (FreqModel::Ail, VolumeModel::Ail),
            VolumeModelId::MsAdLib => (FreqModel::MsAdLib, VolumeModel::MsAdLib),
            VolumeModelId::ImfCreator => (FreqModel::Hmi, VolumeModel::DmxFixed),
            VolumeModelId::OConnell => (FreqModel::OConnell, VolumeModel::OConnell),
            VolumeModelId::Rsxx => (FreqModel::Generic, VolumeModel::Rsxx),
        }
    }
}
