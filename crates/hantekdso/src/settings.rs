//! Current desired state of the device.
//!
//! Mutated by the public setters and read by the acquisition thread.
//! The samplerate limits in use are stored as a selector rather than a
//! reference; [`DeviceSettings::limits`] resolves it against the
//! specification.

use crate::specification::{
    CHANNEL_COUNT, DeviceSpecification, ROLL_RECORD_LENGTH, SamplerateLimits,
};

/// Which samplerate limit table is active. `Multi` is the fast-rate mode
/// where both ADCs interleave on a single channel.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LimitsSelection {
    Single,
    Multi,
}

/// What the user asked for last, so it can be re-resolved after a
/// record-length or channel change.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum SamplerateTarget {
    /// A samplerate in S/s.
    Rate(f64),
    /// A record duration in seconds.
    Duration(f64),
}

#[derive(Debug, Clone)]
pub struct SamplerateSettings {
    pub target: SamplerateTarget,
    pub limits: LimitsSelection,
    /// The variable downsampling factor; 0 selects the maximum rate.
    pub downsampler: u32,
    /// The resulting samplerate in S/s.
    pub current: f64,
}

#[derive(Debug, Clone, Copy)]
pub struct VoltageSettings {
    /// Index into the gain ladder.
    pub gain_id: usize,
    /// The requested offset, 0.0 (bottom) to 1.0 (top).
    pub offset: f64,
    /// The offset actually set after DAC quantization.
    pub offset_real: f64,
    pub used: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TriggerMode {
    /// Capture even without a trigger event.
    Auto,
    Normal,
    /// Stop after the first trigger event.
    Single,
}

/// Input coupling of a channel.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Coupling {
    /// DC component filtered out.
    Ac,
    Dc,
    /// Input grounded.
    Gnd,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Slope {
    /// From lower to higher voltage.
    Positive = 0,
    /// From higher to lower voltage.
    Negative = 1,
}

#[derive(Debug, Clone)]
pub struct TriggerSettings {
    /// Trigger level per channel, in Volts.
    pub level: [f64; CHANNEL_COUNT],
    /// Pretrigger position in seconds.
    pub position: f64,
    /// Trigger point inside the capture buffer, decoded from the last
    /// capture-state response.
    pub point: u32,
    pub mode: TriggerMode,
    pub slope: Slope,
    /// True when a special source (EXT, EXT/10) is selected.
    pub special: bool,
    pub source: usize,
}

#[derive(Debug, Clone)]
pub struct DeviceSettings {
    pub samplerate: SamplerateSettings,
    pub voltage: [VoltageSettings; CHANNEL_COUNT],
    pub trigger: TriggerSettings,
    /// Index into the record-length tier list.
    pub record_length_id: usize,
    /// Number of enabled channels.
    pub used_channels: usize,
}

impl Default for DeviceSettings {
    fn default() -> Self {
        DeviceSettings {
            samplerate: SamplerateSettings {
                target: SamplerateTarget::Rate(0.0),
                limits: LimitsSelection::Single,
                downsampler: 1,
                current: 0.0,
            },
            voltage: [VoltageSettings {
                gain_id: 0,
                offset: 0.0,
                offset_real: 0.0,
                used: false,
            }; CHANNEL_COUNT],
            trigger: TriggerSettings {
                level: [0.0; CHANNEL_COUNT],
                position: 0.0,
                point: 0,
                mode: TriggerMode::Normal,
                slope: Slope::Positive,
                special: false,
                source: 0,
            },
            record_length_id: 1,
            used_channels: 0,
        }
    }
}

impl DeviceSettings {
    /// The samplerate limits currently in effect.
    pub fn limits<'a>(&self, spec: &'a DeviceSpecification) -> &'a SamplerateLimits {
        match self.samplerate.limits {
            LimitsSelection::Single => &spec.samplerate.single,
            LimitsSelection::Multi => &spec.samplerate.multi,
        }
    }

    /// The selected record length, [`ROLL_RECORD_LENGTH`] for rolling.
    pub fn record_length(&self, spec: &DeviceSpecification) -> u32 {
        self.limits(spec).record_lengths[self.record_length_id]
    }

    /// Whether the engine runs the continuous roll cycle.
    pub fn is_roll_mode(&self, spec: &DeviceSpecification) -> bool {
        self.record_length(spec) == ROLL_RECORD_LENGTH
    }

    /// Whether fast-rate mode is active.
    pub fn is_fast_rate(&self) -> bool {
        self.samplerate.limits == LimitsSelection::Multi
    }

    /// The samplerate divider of the selected record-length tier.
    pub fn buffer_divider(&self, spec: &DeviceSpecification) -> u32 {
        spec.buffer_dividers[self.record_length_id]
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults() {
        let settings = DeviceSettings::default();
        assert_eq!(settings.record_length_id, 1);
        assert_eq!(settings.samplerate.limits, LimitsSelection::Single);
        assert_eq!(settings.used_channels, 0);
        assert_eq!(settings.trigger.mode, TriggerMode::Normal);
        assert!(!settings.is_fast_rate());
    }

    #[test]
    fn roll_mode_follows_record_length_sentinel() {
        let spec = DeviceSpecification::for_product(0x2090);
        let mut settings = DeviceSettings::default();
        assert!(!settings.is_roll_mode(&spec));
        settings.record_length_id = 0;
        assert!(settings.is_roll_mode(&spec));
        assert_eq!(settings.record_length(&spec), ROLL_RECORD_LENGTH);
        assert_eq!(settings.buffer_divider(&spec), 1000);
    }

    #[test]
    fn limits_selection_resolves() {
        let spec = DeviceSpecification::for_product(0x2090);
        let mut settings = DeviceSettings::default();
        assert_eq!(settings.limits(&spec).base, 50e6);
        settings.samplerate.limits = LimitsSelection::Multi;
        assert_eq!(settings.limits(&spec).base, 100e6);
        assert!(settings.is_fast_rate());
        assert_eq!(settings.record_length(&spec), 20480);
    }
}
