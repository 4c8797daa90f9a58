//! Parameter resolution.
//!
//! Pure math mapping user requests (samplerate, trigger position and
//! level, offset, gain) onto the device's non-uniform encoding spaces.
//! Everything here is side-effect free; the device layer applies the
//! results to the command queues.

use crate::catalog::ProtocolCatalog;
use crate::protocol::BulkCode;
use crate::specification::{DeviceSpecification, OffsetRange};

/// Nearest samplerate the hardware can provide.
///
/// `maximum` selects the rounding direction: true caps the result at the
/// requested rate (record-time resolution), false keeps it at least as
/// high (samplerate resolution). Returns the downsampling factor (0 for
/// the undivided maximum rate) and the achievable samplerate, or `None`
/// for an invalid request.
pub fn compute_best_samplerate(
    spec: &DeviceSpecification,
    catalog: &ProtocolCatalog,
    record_length_id: usize,
    samplerate: f64,
    fast_rate: bool,
    maximum: bool,
) -> Option<(u32, f64)> {
    if samplerate <= 0.0 {
        return None;
    }

    let limits = if fast_rate {
        &spec.samplerate.multi
    } else {
        &spec.samplerate.single
    };
    let divider = spec.buffer_dividers[record_length_id] as f64;

    // Downsampling factor that would provide the requested rate.
    let mut best_downsampler = limits.base / divider / samplerate;

    // Is the undivided rate good enough, or the maximum even better?
    let use_max = if maximum {
        best_downsampler < 1.0 && samplerate <= limits.max / divider
    } else {
        best_downsampler <= 1.0
    };
    if use_max {
        return Some((0, limits.max / divider));
    }

    match catalog.set_samplerate {
        Some(BulkCode::SetTriggerAndSamplerate) => {
            // Factors 1, 2 and 5 use the fast samplerate ids; 3 and 4 do
            // not exist on this hardware. Higher factors must be even.
            if (maximum && best_downsampler <= 5.0) || (!maximum && best_downsampler < 6.0) {
                if maximum {
                    best_downsampler = best_downsampler.ceil();
                    if best_downsampler > 2.0 {
                        best_downsampler = 5.0;
                    }
                } else {
                    best_downsampler = best_downsampler.floor();
                    if best_downsampler > 2.0 && best_downsampler < 5.0 {
                        best_downsampler = 2.0;
                    }
                }
            } else if maximum {
                best_downsampler = (best_downsampler / 2.0).ceil() * 2.0;
            } else {
                best_downsampler = (best_downsampler / 2.0).floor() * 2.0;
            }
        }
        Some(BulkCode::CSetTriggerOrSamplerate) | Some(BulkCode::ESetTriggerOrSamplerate) => {
            best_downsampler = if maximum {
                best_downsampler.ceil()
            } else {
                best_downsampler.floor()
            };
        }
        _ => return None,
    }

    if best_downsampler > limits.max_downsampler as f64 {
        best_downsampler = limits.max_downsampler as f64;
    }

    let downsampler = best_downsampler as u32;
    Some((downsampler, limits.base / best_downsampler / divider))
}

/// Field encoding of a DSO-2090/2150 downsampler value.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Downsampler2090 {
    /// 2-bit samplerate id for factors up to 5.
    pub samplerate_id: u8,
    /// 16-bit downsampler field.
    pub downsampler_value: u16,
    /// Whether the downsampler field is in use.
    pub downsampling: bool,
    /// The factor actually programmed after hardware rounding.
    pub effective: u32,
}

/// Encode a downsampling factor for the DSO-2090/2150.
///
/// Factors up to 5 map onto the samplerate ids (3 and 4 snap to 5);
/// higher factors are forced even and stored as `0x10001 - ds/2` with
/// the downsampling-mode flag set.
pub fn encode_downsampler_2090(downsampler: u32, base_reaches_max: bool) -> Downsampler2090 {
    let mut effective = downsampler;
    let mut samplerate_id = 0u8;
    let mut downsampler_value = 0u16;
    let mut downsampling = false;

    if effective <= 5 {
        if effective == 0 && base_reaches_max {
            samplerate_id = 1;
        } else if effective <= 2 {
            samplerate_id = effective as u8;
        } else {
            samplerate_id = 3;
            effective = 5;
            downsampler_value = 0xFFFF;
        }
    } else {
        effective &= !1;
        downsampler_value = (0x10001u32 - (effective >> 1)) as u16;
        downsampling = true;
    }

    Downsampler2090 {
        samplerate_id,
        downsampler_value,
        downsampling,
        effective,
    }
}

/// Encode a downsampling factor for the DSO-5200: the divider splits
/// into a slow part (ones'-complemented) and a fast part stored as
/// `4 - fast`.
pub fn encode_samplerate_5200(downsampler: u32) -> (u16, u8) {
    let value_slow = ((downsampler as i64 - 3) / 2).max(0);
    let value_fast = (downsampler as i64 - value_slow * 2) as u8;
    let slow_field = if value_slow == 0 {
        0
    } else {
        0xFFFF - value_slow as u16
    };
    (slow_field, 4 - value_fast)
}

/// Encode a downsampling factor for the DSO-2250: any factor above 1 is
/// stored as `0x10001 - ds` with the downsampling flag set.
pub fn encode_samplerate_2250(downsampler: u32) -> (bool, u16) {
    let downsampling = downsampler >= 1;
    let value = if downsampler > 1 {
        (0x10001u32 - downsampler) as u16
    } else {
        0
    };
    (downsampling, value)
}

/// Encoded pretrigger position, in the coordinate system of the message
/// that carries it.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TriggerPositionWords {
    /// One 19-bit value (DSO-2090/2150).
    Single19(u32),
    /// Inverse pre/post pair in 19 bits (DSO-2250).
    PrePost19 { pre: u32, post: u32 },
    /// Inverse pre/post pair in 16 bits (DSO-5200).
    PrePost16 { pre: u16, post: u16 },
}

/// Encode the pretrigger position for the message selected by the
/// catalog. Roll mode has no trigger position; the device expects the
/// constant 1 there.
pub fn encode_trigger_position(
    pretrigger: BulkCode,
    roll_mode: bool,
    record_length: u32,
    position_samples: u32,
) -> Option<TriggerPositionWords> {
    match pretrigger {
        BulkCode::SetTriggerAndSamplerate => Some(TriggerPositionWords::Single19(if roll_mode {
            0x1
        } else {
            0x7FFFF - record_length + position_samples
        })),
        BulkCode::FSetBuffer => Some(if roll_mode {
            TriggerPositionWords::PrePost19 { pre: 0x1, post: 0x1 }
        } else {
            TriggerPositionWords::PrePost19 {
                pre: 0x7FFFF - record_length + position_samples,
                post: 0x7FFFF - position_samples,
            }
        }),
        BulkCode::DSetBuffer => Some(if roll_mode {
            TriggerPositionWords::PrePost16 { pre: 0x1, post: 0x1 }
        } else {
            TriggerPositionWords::PrePost16 {
                pre: (0xFFFF - record_length + position_samples) as u16,
                post: (0xFFFF - position_samples) as u16,
            }
        }),
        _ => None,
    }
}

/// DAC range for the trigger level: the full 8-bit span on 8-bit models,
/// the calibration range of the active gain step on 10-bit models.
pub fn trigger_level_range(sample_size: u8, calibration: OffsetRange) -> (u16, u16) {
    if sample_size > 8 {
        (calibration.start, calibration.end)
    } else {
        (0x00, 0xFD)
    }
}

/// Map a trigger level in Volts onto the DAC range, clamped to
/// `[min, max]`. Returns the DAC code and the level actually applied
/// after quantization.
pub fn trigger_level_dac(
    level: f64,
    gain_step: f64,
    offset_real: f64,
    min: u16,
    max: u16,
) -> (u16, f64) {
    let span = max as f64 - min as f64;
    let raw = ((offset_real + level / gain_step) * span + 0.5) as i64 + min as i64;
    let dac = raw.clamp(min as i64, max as i64) as u16;
    let applied = ((dac as f64 - min as f64) / span - offset_real) * gain_step;
    (dac, applied)
}

/// Map an offset fraction in [0, 1] onto the calibration range. Returns
/// the DAC code and the fraction actually applied after quantization;
/// re-applying that fraction is a fixpoint.
pub fn offset_dac(offset: f64, range: OffsetRange) -> (u16, f64) {
    let span = range.end as f64 - range.start as f64;
    let dac = (offset * span + range.start as f64 + 0.5) as u16;
    let real = (dac as f64 - range.start as f64) / span;
    (dac, real)
}

/// Smallest gain step at least as high as the requested V/screenheight;
/// the top step when nothing qualifies.
pub fn gain_id_for(gain_steps: &[f64], gain: f64) -> usize {
    let mut id = 0;
    while id < gain_steps.len() - 1 && gain_steps[id] < gain {
        id += 1;
    }
    id
}
