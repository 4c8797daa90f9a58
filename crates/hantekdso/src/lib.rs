//! Acquisition and post-processing core for Hantek DSO-2xxx/5xxx USB
//! oscilloscopes.
//!
//! Four device generations share one command/response protocol with
//! per-model opcode assignments, record-length tiers, ADC widths and
//! samplerate ladders. This crate drives continuous capture over USB,
//! resolves user parameters against the per-model constraint tables,
//! decodes raw capture buffers into calibrated voltages, and feeds a
//! post-processing stage computing spectra, amplitudes and fundamental
//! frequencies.
//!
//! The entry points are [`usb::enumerate_devices`]/[`usb::open_first`]
//! to find hardware, [`Device`] for control and acquisition, and
//! [`analyzer::DataAnalyzer`] as a ready-made consumer for the sample
//! stream.

pub mod analyzer;
pub mod catalog;
pub mod device;
pub mod error;
pub mod events;
pub mod firmware;
pub mod messages;
pub mod models;
pub mod params;
pub mod protocol;
pub mod queues;
pub mod samples;
pub mod settings;
pub mod specification;
pub mod transport;
pub mod usb;
pub mod window;

mod acquisition;

pub use device::Device;
pub use error::{ErrorCode, Result};
