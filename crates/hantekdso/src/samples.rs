//! Raw-buffer decoding into calibrated voltages.
//!
//! The device buffer layout depends on the channel-enable mask, fast-rate
//! mode, trigger point and ADC width. Two-channel data is interleaved
//! with channel 2 first in each pair; 10-bit models append a second block
//! holding the two extra bits of every sample. Decoding starts at twice
//! the trigger point and wraps around the capture buffer.

use crate::settings::VoltageSettings;
use crate::specification::{CHANNEL_COUNT, DeviceSpecification, ROLL_RECORD_LENGTH};

/// The total number of samples the device will return for the current
/// configuration. In roll mode the device streams one communication
/// packet at a time.
pub fn expected_sample_count(
    record_length: u32,
    fast_rate: bool,
    channels: usize,
    packet_size: usize,
) -> u32 {
    if record_length == ROLL_RECORD_LENGTH {
        packet_size as u32
    } else if fast_rate {
        record_length
    } else {
        record_length * channels as u32
    }
}

/// Decode a raw capture buffer into per-channel voltage vectors.
///
/// `samples` is reused between captures; enabled channels are resized to
/// the per-channel sample count and overwritten in place, disabled
/// channels are cleared. No per-sample allocation happens.
pub fn decode(
    data: &[u8],
    spec: &DeviceSpecification,
    voltage: &[VoltageSettings; CHANNEL_COUNT],
    trigger_point: u32,
    fast_rate: bool,
    samples: &mut Vec<Vec<f64>>,
) {
    samples.resize_with(spec.channels, Vec::new);

    // The device may return less than requested; trust the transfer.
    let total_sample_count = if spec.sample_size > 8 {
        data.len() / 2
    } else {
        data.len()
    };

    if total_sample_count == 0 {
        for vec in samples.iter_mut() {
            vec.clear();
        }
        return;
    }

    if fast_rate {
        // One channel uses all buffers.
        let sample_count = total_sample_count;
        let channel = voltage.iter().position(|v| v.used);
        for (index, vec) in samples.iter_mut().enumerate() {
            if Some(index) != channel {
                vec.clear();
            }
        }
        let Some(channel) = channel else { return };

        let gain_id = voltage[channel].gain_id;
        let offset_real = voltage[channel].offset_real;
        let scale = spec.limits[channel].voltage_scale[gain_id] as f64;
        let gain_step = spec.gain_steps[gain_id];
        let out = &mut samples[channel];
        out.resize(sample_count, 0.0);

        let mut buffer_position = trigger_point as usize * 2;
        if spec.sample_size > 8 {
            let extra_bits = (spec.sample_size - 8) as usize;
            let extra_mask = ((0x00FFu16) << extra_bits) & 0xFF00;
            for real_position in 0..sample_count {
                if buffer_position >= sample_count {
                    buffer_position %= sample_count;
                }
                // The extra-bits bytes pack one pair per buffer pair.
                let extra_position = buffer_position % spec.channels;
                let shift = 8 - (spec.channels - 1 - extra_position) * extra_bits;
                let low = data[buffer_position] as u16;
                let high =
                    ((data[sample_count + buffer_position - extra_position] as u16) << shift)
                        & extra_mask;
                out[real_position] = ((low + high) as f64 / scale - offset_real) * gain_step;
                buffer_position += 1;
            }
        } else {
            for real_position in 0..sample_count {
                if buffer_position >= sample_count {
                    buffer_position %= sample_count;
                }
                out[real_position] = (data[buffer_position] as f64 / scale - offset_real) * gain_step;
                buffer_position += 1;
            }
        }
    } else {
        // Interleaved mode, the pair order is [ch2 ch1].
        let sample_count = total_sample_count / spec.channels;
        for channel in 0..spec.channels {
            if !voltage[channel].used {
                samples[channel].clear();
                continue;
            }

            let gain_id = voltage[channel].gain_id;
            let offset_real = voltage[channel].offset_real;
            let scale = spec.limits[channel].voltage_scale[gain_id] as f64;
            let gain_step = spec.gain_steps[gain_id];
            let out = &mut samples[channel];
            out.resize(sample_count, 0.0);

            let mut buffer_position = trigger_point as usize * 2;
            if spec.sample_size > 8 {
                let extra_bits = (spec.sample_size - 8) as usize;
                let extra_mask = ((0x00FFu16) << extra_bits) & 0xFF00;
                let shift = 8 - channel * 2;
                for real_position in 0..sample_count {
                    if buffer_position >= total_sample_count {
                        buffer_position %= total_sample_count;
                    }
                    let low = data[buffer_position + spec.channels - 1 - channel] as u16;
                    let high = ((data[total_sample_count + buffer_position] as u16) << shift)
                        & extra_mask;
                    out[real_position] = ((low + high) as f64 / scale - offset_real) * gain_step;
                    buffer_position += spec.channels;
                }
            } else {
                buffer_position += spec.channels - 1 - channel;
                for real_position in 0..sample_count {
                    if buffer_position >= total_sample_count {
                        buffer_position %= total_sample_count;
                    }
                    out[real_position] =
                        (data[buffer_position] as f64 / scale - offset_real) * gain_step;
                    buffer_position += spec.channels;
                }
            }
        }
    }
}
