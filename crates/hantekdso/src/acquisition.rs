//! The capture control loop.
//!
//! One dedicated thread per device. Each pass flushes the pending
//! command queues, runs one step of the active state machine and sleeps
//! for a quarter of the expected buffer-fill time.
//!
//! Roll mode cycles through a fixed command sequence since the device
//! reports no capture state while streaming. Standard mode polls
//! GetCaptureState and reacts to the device's WAITING/SAMPLING/READY
//! transitions, re-arming the trigger and forcing it in Auto mode when
//! the device sits waiting for too long.

use std::sync::Arc;
use std::sync::atomic::Ordering;
use std::thread::{self, JoinHandle};
use std::time::Duration;

use crate::device::DeviceShared;
use crate::messages::{
    BeginCommand, CAPTURE_STATE_RESPONSE_LEN, CaptureStateResponse, CaptureStart, ForceTrigger,
    Frame, GetCaptureState, GetData, TriggerEnabled,
};
use crate::protocol::{self, CONTROL_BEGINCOMMAND, CaptureState};
use crate::samples;
use crate::settings::TriggerMode;
use crate::transport::{DsoTransport, TransportError};

/// The states of the roll cycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum RollState {
    Start,
    EnableTrigger,
    ForceTrigger,
    Read,
}

impl RollState {
    pub(crate) fn next(self) -> RollState {
        match self {
            RollState::Start => RollState::EnableTrigger,
            RollState::EnableTrigger => RollState::ForceTrigger,
            RollState::ForceTrigger => RollState::Read,
            RollState::Read => RollState::Start,
        }
    }
}

/// Spawn the acquisition thread for a connected device.
pub(crate) fn spawn<T: DsoTransport + 'static>(shared: Arc<DeviceShared<T>>) -> JoinHandle<()> {
    thread::Builder::new()
        .name("dso-acquisition".into())
        .spawn(move || Engine::new(shared).run())
        .expect("spawning the acquisition thread")
}

struct Engine<T: DsoTransport + 'static> {
    shared: Arc<DeviceShared<T>>,
    begin: BeginCommand,
    /// Expected total sample count before the last capture started, so
    /// a late buffer with the previous configuration drains completely.
    previous_sample_count: u32,
    raw: Vec<u8>,
}

impl<T: DsoTransport + 'static> Engine<T> {
    fn new(shared: Arc<DeviceShared<T>>) -> Engine<T> {
        Engine {
            shared,
            begin: BeginCommand::new(),
            previous_sample_count: 0,
            raw: Vec::new(),
        }
    }

    fn run(mut self) {
        let mut capture_state = CaptureState::Waiting;
        let mut roll_state = RollState::Start;
        let mut sampling_started = false;
        let mut last_trigger_mode: Option<TriggerMode> = None;
        let mut cycle_counter: u64 = 0;
        let mut start_cycle: u64 = 0;
        let mut fatal = false;

        while self.shared.running.load(Ordering::SeqCst) {
            {
                let mut state = self.shared.state.lock().unwrap();
                if state.queues.flush(&self.shared.transport).is_err() {
                    fatal = true;
                    break;
                }
            }

            let (cycle_time, roll_mode) = self.cycle_time_ms();

            let step = if roll_mode {
                capture_state = CaptureState::Waiting;
                self.roll_step(&mut roll_state, &mut sampling_started)
            } else {
                roll_state = RollState::Start;
                self.standard_step(
                    &mut capture_state,
                    &mut cycle_counter,
                    &mut start_cycle,
                    cycle_time,
                    &mut sampling_started,
                    &mut last_trigger_mode,
                )
            };
            if step.is_err() {
                fatal = true;
                break;
            }

            thread::sleep(Duration::from_millis(cycle_time));
        }

        if fatal {
            self.shared
                .events
                .emit_status_message(TransportError::NoDevice.code(), 0);
            self.shared.transport.shutdown();
            self.shared.finalize_disconnect();
        }
    }

    /// Poll interval: a quarter of the time the buffer takes to refill,
    /// clamped between 10 ms and one second.
    fn cycle_time_ms(&self) -> (u64, bool) {
        let state = self.shared.state.lock().unwrap();
        let spec = &state.spec;
        let settings = &state.settings;
        let roll = settings.is_roll_mode(spec);
        let channels = if settings.is_fast_rate() {
            1.0
        } else {
            spec.channels as f64
        };
        let time = if roll {
            self.shared.transport.packet_size() as f64 / channels / settings.samplerate.current
                * 250.0
        } else {
            settings.record_length(spec) as f64 / settings.samplerate.current * 250.0
        };
        ((time as i64).clamp(10, 1000) as u64, roll)
    }

    /// Send one bulk command, preceded by its BeginCommand control
    /// prefix.
    fn bulk_command(&self, frame: &[u8]) -> Result<(), TransportError> {
        self.shared
            .transport
            .control_write(CONTROL_BEGINCOMMAND, self.begin.bytes(), 0, 0)?;
        self.shared.transport.bulk_write(frame)?;
        Ok(())
    }

    /// Issue a bulk command from a state-machine step. Recoverable
    /// errors are logged and reported as `Ok(false)`.
    fn try_bulk(&self, frame: &[u8], what: &str) -> Result<bool, TransportError> {
        match self.bulk_command(frame) {
            Ok(()) => Ok(true),
            Err(err) if err.is_fatal() => Err(err),
            Err(err) => {
                log::warn!("{what} failed: {}", err.name());
                Ok(false)
            }
        }
    }

    fn expected_count(&self) -> u32 {
        let state = self.shared.state.lock().unwrap();
        samples::expected_sample_count(
            state.settings.record_length(&state.spec),
            state.settings.is_fast_rate(),
            state.spec.channels,
            self.shared.transport.packet_size(),
        )
    }

    /// One step of the roll cycle.
    fn roll_step(
        &mut self,
        roll_state: &mut RollState,
        sampling_started: &mut bool,
    ) -> Result<(), TransportError> {
        let mut to_next_state = true;

        match *roll_state {
            RollState::Start => {
                if !self.shared.sampling.load(Ordering::SeqCst) {
                    // Stay here while stopped.
                    to_next_state = false;
                } else {
                    self.previous_sample_count = self.expected_count();
                    if self.try_bulk(CaptureStart::new().bytes(), "starting capture")? {
                        log::debug!("starting to capture");
                        *sampling_started = true;
                    }
                }
            }
            RollState::EnableTrigger => {
                if self.try_bulk(TriggerEnabled::new().bytes(), "enabling trigger")? {
                    log::debug!("enabling trigger");
                }
            }
            RollState::ForceTrigger => {
                if self.try_bulk(ForceTrigger::new().bytes(), "forcing trigger")? {
                    log::debug!("forcing trigger");
                }
            }
            RollState::Read => {
                match self.read_samples(*sampling_started) {
                    Ok(read) => log::debug!("received {read} B of sampling data"),
                    Err(err) if err.is_fatal() => return Err(err),
                    Err(err) => log::warn!("getting sample data failed: {}", err.name()),
                }

                let single = {
                    let state = self.shared.state.lock().unwrap();
                    state.settings.trigger.mode == TriggerMode::Single
                };
                if single && *sampling_started {
                    self.stop_sampling();
                }
                *sampling_started = false;
            }
        }

        if to_next_state {
            *roll_state = roll_state.next();
        }
        Ok(())
    }

    /// One step of the triggered acquisition, driven by the device's
    /// capture state.
    #[allow(clippy::too_many_arguments)]
    fn standard_step(
        &mut self,
        capture_state: &mut CaptureState,
        cycle_counter: &mut u64,
        start_cycle: &mut u64,
        interval_ms: u64,
        sampling_started: &mut bool,
        last_trigger_mode: &mut Option<TriggerMode>,
    ) -> Result<(), TransportError> {
        let state = match self.read_capture_state() {
            Ok(Some(state)) => state,
            Ok(None) => return Ok(()),
            Err(err) if err.is_fatal() => return Err(err),
            Err(err) => {
                log::warn!("getting capture state failed: {}", err.name());
                return Ok(());
            }
        };

        if state != *capture_state {
            log::debug!("capture state changed to {state:?}");
        }
        *capture_state = state;

        if state.is_ready() {
            match self.read_samples(*sampling_started) {
                Ok(read) => log::debug!("received {read} B of sampling data"),
                Err(err) if err.is_fatal() => return Err(err),
                Err(err) => log::warn!("getting sample data failed: {}", err.name()),
            }

            let single = {
                let locked = self.shared.state.lock().unwrap();
                locked.settings.trigger.mode == TriggerMode::Single
            };
            if single && *sampling_started {
                self.stop_sampling();
            }
            *sampling_started = false;

            // Immediately re-arm unless sampling was stopped.
            if self.shared.sampling.load(Ordering::SeqCst) {
                self.waiting_step(
                    cycle_counter,
                    start_cycle,
                    interval_ms,
                    sampling_started,
                    last_trigger_mode,
                )?;
            }
        } else if state == CaptureState::Waiting {
            if self.shared.sampling.load(Ordering::SeqCst) {
                self.waiting_step(
                    cycle_counter,
                    start_cycle,
                    interval_ms,
                    sampling_started,
                    last_trigger_mode,
                )?;
            }
        }
        // Sampling in progress: nothing to do.
        Ok(())
    }

    /// The WAITING branch: count cycles since the capture started, arm
    /// the trigger once the buffer refilled, force it in Auto mode, and
    /// eventually restart the capture.
    fn waiting_step(
        &mut self,
        cycle_counter: &mut u64,
        start_cycle: &mut u64,
        interval_ms: u64,
        sampling_started: &mut bool,
        last_trigger_mode: &mut Option<TriggerMode>,
    ) -> Result<(), TransportError> {
        self.previous_sample_count = self.expected_count();

        let (mode, position) = {
            let state = self.shared.state.lock().unwrap();
            (state.settings.trigger.mode, state.settings.trigger.position)
        };

        if *sampling_started && *last_trigger_mode == Some(mode) {
            *cycle_counter += 1;

            if *cycle_counter == *start_cycle {
                // Buffer refilled since the capture started, arm now.
                if !self.try_bulk(TriggerEnabled::new().bytes(), "enabling trigger")? {
                    return Ok(());
                }
                log::debug!("enabling trigger");
            } else if mode == TriggerMode::Auto && *cycle_counter >= 8 + *start_cycle {
                if !self.try_bulk(ForceTrigger::new().bytes(), "forcing trigger")? {
                    return Ok(());
                }
                log::debug!("forcing trigger");
            }

            if *cycle_counter < 20 || *cycle_counter < 4000 / interval_ms {
                return Ok(());
            }
        }

        if !self.try_bulk(CaptureStart::new().bytes(), "starting capture")? {
            return Ok(());
        }
        log::debug!("starting to capture");

        *sampling_started = true;
        *cycle_counter = 0;
        *start_cycle = (position * 1000.0 / interval_ms as f64) as u64 + 1;
        *last_trigger_mode = Some(mode);
        Ok(())
    }

    /// Poll the capture state and decode the trigger point. Unknown
    /// state codes are logged and skipped.
    fn read_capture_state(&mut self) -> Result<Option<CaptureState>, TransportError> {
        self.bulk_command(GetCaptureState::new().bytes())?;

        let mut response = [0u8; CAPTURE_STATE_RESPONSE_LEN];
        self.shared.transport.bulk_read(&mut response)?;

        let Some(parsed) = CaptureStateResponse::parse(&response) else {
            return Ok(None);
        };
        let trigger_point = protocol::decode_trigger_point(parsed.raw_trigger_point as u32);
        self.shared.state.lock().unwrap().settings.trigger.point = trigger_point;

        match CaptureState::from_code(parsed.state_code) {
            Some(state) => Ok(Some(state)),
            None => {
                log::debug!("unknown capture state {:#04x}", parsed.state_code);
                Ok(None)
            }
        }
    }

    /// Request and read the sample buffer; decode and publish it when
    /// `process` is set.
    fn read_samples(&mut self, process: bool) -> Result<usize, TransportError> {
        self.bulk_command(GetData::new().bytes())?;

        // Drain a late buffer of the previous configuration completely.
        let mut total_sample_count = self.expected_count();
        if total_sample_count < self.previous_sample_count {
            std::mem::swap(&mut total_sample_count, &mut self.previous_sample_count);
        } else {
            self.previous_sample_count = total_sample_count;
        }

        let sample_size = {
            let state = self.shared.state.lock().unwrap();
            state.spec.sample_size
        };
        let mut data_length = total_sample_count as usize;
        if sample_size > 8 {
            data_length *= 2;
        }

        self.raw.resize(data_length, 0);
        let read = self.shared.transport.bulk_read_multi(&mut self.raw)?;

        if process {
            let (samplerate, roll_mode) = {
                let state = self.shared.state.lock().unwrap();
                let samplerate = state.settings.samplerate.current;
                let roll_mode = state.settings.is_roll_mode(&state.spec);
                let mut samples = self.shared.samples.lock().unwrap();
                samples::decode(
                    &self.raw[..read],
                    &state.spec,
                    &state.settings.voltage,
                    state.settings.trigger.point,
                    state.settings.is_fast_rate(),
                    &mut samples,
                );
                (samplerate, roll_mode)
            };
            self.shared
                .events
                .emit_samples_available(&self.shared.samples, samplerate, roll_mode);
        }

        Ok(read)
    }

    fn stop_sampling(&self) {
        self.shared.sampling.store(false, Ordering::SeqCst);
        self.shared.events.emit_sampling_stopped();
    }
}
