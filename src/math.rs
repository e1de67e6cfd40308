//! Volume, pan and voice positioning

pub use glam::Vec3;

pub const MIN_VOLUME: i32 = -10000;
pub const MAX_VOLUME: i32 = 0;
pub const MAX_PAN: i32 = 10000;

/// Horizontal distance a fully panned voice is placed from the listener
pub const PAN_SPAN: f32 = 20.0;
/// Constant depth of every voice in front of the listener
pub const PAN_DEPTH: f32 = -1.0;

/// A volume/pan pair in DirectSound-style units.
///
/// `volume` is an attenuation in `[-10000, 0]` (0 = full gain) and `pan` a
/// balance in `[-10000, 10000]` (negative = left). Out-of-range values are
/// clamped whenever the pair is applied, never rejected.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct VolumePan {
    pub volume: i32,
    pub pan: i32,
}

impl VolumePan {
    pub fn new(volume: i32, pan: i32) -> Self {
        Self { volume, pan }
    }

    pub fn centered(volume: i32) -> Self {
        Self { volume, pan: 0 }
    }

    pub fn clamped(&self) -> Self {
        Self {
            volume: self.volume.clamp(MIN_VOLUME, MAX_VOLUME),
            pan: self.pan.clamp(-MAX_PAN, MAX_PAN),
        }
    }

    /// Linear backend gain in `[0.0, 1.0]`
    pub fn gain(&self) -> f32 {
        let volume = self.clamped().volume as f32;
        (volume - MIN_VOLUME as f32) / -(MIN_VOLUME as f32)
    }

    /// Voice position derived from pan
    pub fn position(&self) -> Vec3 {
        let pan = self.clamped().pan as f32;
        Vec3::new(PAN_SPAN * pan / MAX_PAN as f32, 0.0, PAN_DEPTH)
    }
}

/// Clamp a 0-100 master volume and map it to listener gain.
pub fn master_volume_to_gain(volume: i32) -> f32 {
    volume.clamp(0, 100) as f32 / 100.0
}

pub fn gain_to_master_volume(gain: f32) -> u32 {
    (gain * 100.0 + 0.5).max(0.0) as u32
}
