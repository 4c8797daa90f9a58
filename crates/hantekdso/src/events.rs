//! Typed callback registry.
//!
//! Callers register closures for the device's notifications; unset
//! callbacks are ignored. Registration and emission may happen from
//! different threads, each slot is guarded independently.

use std::sync::Mutex;

/// The callbacks a device can fire.
///
/// `samples_available` hands over a reference to the producer-held
/// sample mutex together with the samplerate and the append flag (roll
/// mode); consumers copy the data out under that mutex and return
/// quickly.
///
/// Handlers run on the device's threads, possibly with internal locks
/// held. They must not call back into the device's setters; hand the
/// notification off to another thread instead.
#[derive(Default)]
pub struct EventHandlers {
    connected: Mutex<Option<Box<dyn Fn() + Send + Sync>>>,
    disconnected: Mutex<Option<Box<dyn Fn() + Send + Sync>>>,
    status_message: Mutex<Option<Box<dyn Fn(i32, u32) + Send + Sync>>>,
    sampling_started: Mutex<Option<Box<dyn Fn() + Send + Sync>>>,
    sampling_stopped: Mutex<Option<Box<dyn Fn() + Send + Sync>>>,
    samples_available: Mutex<Option<Box<dyn Fn(&Mutex<Vec<Vec<f64>>>, f64, bool) + Send + Sync>>>,
    samplerate_changed: Mutex<Option<Box<dyn Fn(f64) + Send + Sync>>>,
    samplerate_limits_changed: Mutex<Option<Box<dyn Fn(f64, f64) + Send + Sync>>>,
    record_length_changed: Mutex<Option<Box<dyn Fn(&[u32], usize) + Send + Sync>>>,
    record_time_changed: Mutex<Option<Box<dyn Fn(f64) + Send + Sync>>>,
}

macro_rules! event {
    ($set:ident, $emit:ident, $slot:ident, Fn($($arg:ident: $ty:ty),*)) => {
        pub fn $set(&self, callback: impl Fn($($ty),*) + Send + Sync + 'static) {
            *self.$slot.lock().unwrap() = Some(Box::new(callback));
        }

        pub(crate) fn $emit(&self, $($arg: $ty),*) {
            if let Some(callback) = self.$slot.lock().unwrap().as_ref() {
                callback($($arg),*);
            }
        }
    };
}

impl EventHandlers {
    event!(on_connected, emit_connected, connected, Fn());
    event!(on_disconnected, emit_disconnected, disconnected, Fn());
    event!(on_status_message, emit_status_message, status_message, Fn(code: i32, timeout_ms: u32));
    event!(on_sampling_started, emit_sampling_started, sampling_started, Fn());
    event!(on_sampling_stopped, emit_sampling_stopped, sampling_stopped, Fn());
    event!(
        on_samples_available,
        emit_samples_available,
        samples_available,
        Fn(samples: &Mutex<Vec<Vec<f64>>>, samplerate: f64, append: bool)
    );
    event!(on_samplerate_changed, emit_samplerate_changed, samplerate_changed, Fn(samplerate: f64));
    event!(
        on_samplerate_limits_changed,
        emit_samplerate_limits_changed,
        samplerate_limits_changed,
        Fn(minimum: f64, maximum: f64)
    );
    event!(
        on_record_length_changed,
        emit_record_length_changed,
        record_length_changed,
        Fn(lengths: &[u32], id: usize)
    );
    event!(on_record_time_changed, emit_record_time_changed, record_time_changed, Fn(duration: f64));
}
