//! Device lifecycle and the public setter surface.
//!
//! A [`Device`] binds an opened transport to a model record. `connect`
//! populates the capability tables, installs the per-model command set,
//! reads the offset calibration and spawns the acquisition thread;
//! `disconnect` winds all of that down and is idempotent. Setters only
//! mutate settings and mark queue entries pending under a short-held
//! mutex; the acquisition thread performs all transport I/O.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::thread::JoinHandle;

use crate::acquisition;
use crate::catalog::{ProtocolCatalog, catalog_for};
use crate::error::{ErrorCode, Result};
use crate::events::EventHandlers;
use crate::firmware::{self, FirmwareBlob};
use crate::messages::{
    BulkCommand, CaptureStart, ControlCommand, DTRIGGERPOSITION_ON, ForceTrigger, GetCaptureState,
    GetData, SetBuffer2250, SetBuffer5200, SetChannels2250, SetFilter, SetGain, SetOffset,
    SetRecordLength2250, SetRelays, SetSamplerate2250, SetSamplerate5200, SetTrigger2250,
    SetTrigger5200, SetTriggerAndSamplerate, TriggerEnabled,
};
use crate::models::DeviceModel;
use crate::params;
use crate::protocol::{
    BUSED_CH2, BulkCode, CONTROL_SETOFFSET, CONTROL_SETRELAYS, CONTROL_VALUE,
    STATUS_UNKNOWN_MODEL, USED_CH1, USED_CH1CH2, USED_CH2, VALUE_OFFSETLIMITS,
};
use crate::queues::CommandQueues;
use crate::settings::{
    Coupling, DeviceSettings, LimitsSelection, SamplerateTarget, Slope, TriggerMode,
};
use crate::specification::{
    CHANNEL_COUNT, DeviceSpecification, GAIN_STEP_COUNT, OffsetRange,
};
use crate::transport::DsoTransport;

/// Mutable device state guarded by one mutex: the capability tables
/// (calibration is device-read), the desired settings and the pending
/// command queues.
pub(crate) struct State {
    pub spec: DeviceSpecification,
    pub settings: DeviceSettings,
    pub queues: CommandQueues,
}

/// State shared between the public handle and the acquisition thread.
pub(crate) struct DeviceShared<T: DsoTransport> {
    pub transport: T,
    pub model: &'static DeviceModel,
    pub catalog: Option<&'static ProtocolCatalog>,
    pub state: Mutex<State>,
    /// Decoded voltage vectors handed to the samples-available callback.
    pub samples: Mutex<Vec<Vec<f64>>>,
    pub events: EventHandlers,
    pub sampling: AtomicBool,
    pub running: AtomicBool,
    pub connected: AtomicBool,
}

impl<T: DsoTransport> DeviceShared<T> {
    /// Transition to disconnected exactly once, from whichever side gets
    /// there first (user call or acquisition loop failure).
    pub(crate) fn finalize_disconnect(&self) {
        if self.connected.swap(false, Ordering::SeqCst) {
            self.state.lock().unwrap().queues.clear();
            self.events.emit_disconnected();
        }
    }
}

/// A USB oscilloscope bound to an opened transport.
pub struct Device<T: DsoTransport + 'static> {
    shared: Arc<DeviceShared<T>>,
    thread: Mutex<Option<JoinHandle<()>>>,
}

impl<T: DsoTransport + 'static> Device<T> {
    /// Bind a model record to an opened transport. No I/O happens until
    /// [`connect`](Device::connect).
    pub fn new(transport: T, model: &'static DeviceModel) -> Device<T> {
        Device {
            shared: Arc::new(DeviceShared {
                transport,
                model,
                catalog: catalog_for(model.product_id),
                state: Mutex::new(State {
                    spec: DeviceSpecification::for_product(model.product_id),
                    settings: DeviceSettings::default(),
                    queues: CommandQueues::new(),
                }),
                samples: Mutex::new(Vec::new()),
                events: EventHandlers::default(),
                sampling: AtomicBool::new(false),
                running: AtomicBool::new(false),
                connected: AtomicBool::new(false),
            }),
            thread: Mutex::new(None),
        }
    }

    /// The model this device was bound to.
    pub fn model(&self) -> &'static DeviceModel {
        self.shared.model
    }

    /// Callback registry. Register handlers before `connect` to observe
    /// the initial settings notifications.
    pub fn events(&self) -> &EventHandlers {
        &self.shared.events
    }

    pub fn is_connected(&self) -> bool {
        self.shared.connected.load(Ordering::SeqCst)
    }

    /// Initialize the device and start the acquisition thread.
    ///
    /// Settings survive a disconnect/reconnect cycle; only the command
    /// buffers and calibration are rebuilt.
    pub fn connect(&self) -> Result<()> {
        if self.is_connected() {
            return Ok(());
        }
        if self.shared.model.needs_firmware {
            log::info!(
                "{} needs a firmware upload before it can be used",
                self.shared.model.name
            );
            return Err(ErrorCode::Unsupported);
        }
        let Some(catalog) = self.shared.catalog else {
            self.shared.events.emit_status_message(STATUS_UNKNOWN_MODEL, 0);
            self.shared.transport.shutdown();
            return Err(ErrorCode::Unsupported);
        };
        if !self.shared.transport.is_connected() {
            return Err(ErrorCode::Connection);
        }
        if self.shared.model.unofficial {
            log::warn!(
                "the {} is not officially supported and may not work as expected",
                self.shared.model.name
            );
        }

        {
            let mut state = self.shared.state.lock().unwrap();
            state.spec = DeviceSpecification::for_product(self.shared.model.product_id);
            install_commands(&mut state.queues, catalog);

            // Channel offset calibration, big-endian (start, end) pairs
            // per channel and gain step.
            let mut calibration = [0u8; CHANNEL_COUNT * GAIN_STEP_COUNT * 4];
            if let Err(err) = self.shared.transport.control_read(
                CONTROL_VALUE,
                &mut calibration,
                VALUE_OFFSETLIMITS as u16,
                0,
            ) {
                self.shared.events.emit_status_message(err.code(), 0);
                self.shared.transport.shutdown();
                return Err(ErrorCode::Connection);
            }
            for channel in 0..CHANNEL_COUNT {
                for gain in 0..GAIN_STEP_COUNT {
                    let at = (channel * GAIN_STEP_COUNT + gain) * 4;
                    state.spec.limits[channel].offset_calibration[gain] =
                        OffsetRange::from_be_bytes([
                            calibration[at],
                            calibration[at + 1],
                            calibration[at + 2],
                            calibration[at + 3],
                        ]);
                }
            }

            // First connect: derive the initial samplerate from the
            // default downsampler and make it the resolution target, so
            // record-length changes can re-resolve it.
            if state.settings.samplerate.current <= 0.0 {
                let divider = state.settings.buffer_divider(&state.spec) as f64;
                let downsampler = state.settings.samplerate.downsampler.max(1);
                state.settings.samplerate.current =
                    state.settings.limits(&state.spec).base / divider / downsampler as f64;
            }
            if let SamplerateTarget::Rate(rate) = state.settings.samplerate.target
                && rate <= 0.0
            {
                state.settings.samplerate.target =
                    SamplerateTarget::Rate(state.settings.samplerate.current);
            }

            // Initial settings notifications.
            let lengths = state.settings.limits(&state.spec).record_lengths;
            self.shared
                .events
                .emit_record_length_changed(lengths, state.settings.record_length_id);
            update_samplerate_limits(&state, &self.shared.events);
            if !state.settings.is_roll_mode(&state.spec) {
                self.shared.events.emit_record_time_changed(
                    state.settings.record_length(&state.spec) as f64
                        / state.settings.samplerate.current,
                );
            }
            self.shared
                .events
                .emit_samplerate_changed(state.settings.samplerate.current);
        }

        self.shared.sampling.store(false, Ordering::SeqCst);
        self.shared.running.store(true, Ordering::SeqCst);
        self.shared.connected.store(true, Ordering::SeqCst);
        *self.thread.lock().unwrap() = Some(acquisition::spawn(Arc::clone(&self.shared)));
        self.shared.events.emit_connected();
        Ok(())
    }

    /// Stop the acquisition thread and release the transport. Safe to
    /// call repeatedly and concurrently with an engine-side failure.
    pub fn disconnect(&self) {
        self.shared.running.store(false, Ordering::SeqCst);
        self.shared.transport.shutdown();
        if let Some(thread) = self.thread.lock().unwrap().take() {
            let _ = thread.join();
        }
        self.shared.finalize_disconnect();
    }

    /// Upload a firmware blob to a model that requires one. The device
    /// renumerates afterwards and must be re-enumerated and re-opened.
    pub fn upload_firmware(&self, blob: &FirmwareBlob<'_>) -> Result<()> {
        if !self.shared.model.needs_firmware {
            return Err(ErrorCode::Unsupported);
        }
        firmware::upload(&self.shared.transport, blob).map_err(|err| {
            log::error!("firmware upload failed: {err}");
            ErrorCode::Connection
        })
    }

    // ── Sampling control ──

    pub fn start_sampling(&self) {
        self.shared.sampling.store(true, Ordering::SeqCst);
        self.shared.events.emit_sampling_started();
    }

    pub fn stop_sampling(&self) {
        self.shared.sampling.store(false, Ordering::SeqCst);
        self.shared.events.emit_sampling_stopped();
    }

    /// Toggle sampling; returns the new state.
    pub fn toggle_sampling(&self) -> bool {
        if self.shared.sampling.load(Ordering::SeqCst) {
            self.stop_sampling();
            false
        } else {
            self.start_sampling();
            true
        }
    }

    pub fn is_sampling(&self) -> bool {
        self.shared.sampling.load(Ordering::SeqCst)
    }

    /// Mark a forced trigger for the next flush pass.
    pub fn force_trigger(&self) -> Result<()> {
        let mut state = self.checked_state()?;
        state.queues.mark_bulk(BulkCode::ForceTrigger);
        Ok(())
    }

    // ── Introspection ──

    /// The record lengths of the active limit table.
    pub fn available_record_lengths(&self) -> Vec<u32> {
        let state = self.shared.state.lock().unwrap();
        state.settings.limits(&state.spec).record_lengths.to_vec()
    }

    /// The lowest samplerate any configuration can reach.
    pub fn min_samplerate(&self) -> f64 {
        let state = self.shared.state.lock().unwrap();
        state.spec.samplerate.single.base / state.spec.samplerate.single.max_downsampler as f64
    }

    /// The highest samplerate of the current channel configuration.
    pub fn max_samplerate(&self) -> f64 {
        let state = self.shared.state.lock().unwrap();
        if state.settings.used_channels <= 1 {
            state.spec.samplerate.multi.max
        } else {
            state.spec.samplerate.single.max
        }
    }

    /// Names of the special trigger sources (EXT, EXT/10).
    pub fn special_trigger_sources(&self) -> &'static [&'static str] {
        self.shared.state.lock().unwrap().spec.special_trigger_sources
    }

    /// The samplerate currently in effect.
    pub fn current_samplerate(&self) -> f64 {
        self.shared.state.lock().unwrap().settings.samplerate.current
    }

    // ── Parameter setters ──

    /// Set the samplerate; the device gets the nearest rate at least as
    /// high. Returns the rate actually configured.
    pub fn set_samplerate(&self, samplerate: f64) -> Result<f64> {
        let catalog = self.catalog()?;
        let mut state = self.checked_state()?;
        set_samplerate_inner(&mut state, catalog, &self.shared.events, samplerate)
            .ok_or(ErrorCode::Parameter)
    }

    /// Set the record duration by adapting the samplerate. Returns the
    /// duration actually configured.
    pub fn set_record_time(&self, duration: f64) -> Result<f64> {
        let catalog = self.catalog()?;
        let mut state = self.checked_state()?;
        set_record_time_inner(&mut state, catalog, &self.shared.events, duration)
            .ok_or(ErrorCode::Parameter)
    }

    /// Select a record-length tier by index. Returns the record length
    /// that has been set.
    pub fn set_record_length(&self, index: usize) -> Result<u32> {
        let catalog = self.catalog()?;
        let mut state = self.checked_state()?;
        let length = update_record_length(&mut state, catalog, &self.shared.events, index)
            .ok_or(ErrorCode::Parameter)?;
        restore_targets(&mut state, catalog, &self.shared.events);
        let position = state.settings.trigger.position;
        update_pretrigger_position(&mut state, catalog, position);
        let lengths = state.settings.limits(&state.spec).record_lengths;
        self.shared
            .events
            .emit_record_length_changed(lengths, state.settings.record_length_id);
        Ok(length)
    }

    /// Enable or disable the sampling of a channel.
    pub fn set_channel_used(&self, channel: usize, used: bool) -> Result<()> {
        let catalog = self.catalog()?;
        let mut state = self.checked_state()?;
        if channel >= state.spec.channels {
            return Err(ErrorCode::Parameter);
        }

        state.settings.voltage[channel].used = used;
        let channel_count = state.settings.voltage.iter().filter(|v| v.used).count();

        let mut used_channels = USED_CH1;
        if state.settings.voltage[1].used {
            if state.settings.voltage[0].used {
                used_channels = USED_CH1CH2;
            } else if catalog.set_channels == Some(BulkCode::BSetChannels) {
                // The DSO-2250 uses a different value for channel 2.
                used_channels = BUSED_CH2;
            } else {
                used_channels = USED_CH2;
            }
        }

        match catalog.set_channels {
            Some(BulkCode::SetTriggerAndSamplerate) => {
                state.queues.set_bulk(BulkCode::SetTriggerAndSamplerate, |cmd| {
                    if let Some(c) = cmd.as_set_trigger_and_samplerate() {
                        c.set_used_channels(used_channels);
                    }
                });
            }
            Some(BulkCode::BSetChannels) => {
                state.queues.set_bulk(BulkCode::BSetChannels, |cmd| {
                    if let Some(c) = cmd.as_set_channels_2250() {
                        c.set_used_channels(used_channels);
                    }
                });
            }
            Some(BulkCode::ESetTriggerOrSamplerate) => {
                state.queues.set_bulk(BulkCode::ESetTriggerOrSamplerate, |cmd| {
                    if let Some(c) = cmd.as_set_trigger_5200() {
                        c.set_used_channels(used_channels);
                    }
                });
            }
            _ => {}
        }

        // Unused channels get their noise filter engaged on the models
        // that carry the filter message.
        if catalog.set_filter.is_some() {
            state.queues.set_bulk(BulkCode::SetFilter, |cmd| {
                if let Some(c) = cmd.as_set_filter() {
                    c.set_channel(channel, !used);
                }
            });
        }

        let fast_rate_changed = (state.settings.used_channels <= 1) != (channel_count <= 1);
        state.settings.used_channels = channel_count;
        if fast_rate_changed {
            update_samplerate_limits(&state, &self.shared.events);
            // Re-resolve the target: fast-rate mode just became
            // available or must be left again.
            restore_targets(&mut state, catalog, &self.shared.events);
        }
        Ok(())
    }

    /// Set the coupling relay of a channel.
    pub fn set_coupling(&self, channel: usize, coupling: Coupling) -> Result<()> {
        let mut state = self.checked_state()?;
        if channel >= state.spec.channels {
            return Err(ErrorCode::Parameter);
        }
        state.queues.set_control(CONTROL_SETRELAYS, |cmd| {
            if let Some(c) = cmd.as_set_relays() {
                c.set_coupling(channel, coupling != Coupling::Ac);
            }
        });
        Ok(())
    }

    /// Set the gain of a channel to the smallest step covering the
    /// requested V/screenheight. Returns the step configured.
    pub fn set_gain(&self, channel: usize, gain: f64) -> Result<f64> {
        let catalog = self.catalog()?;
        let mut state = self.checked_state()?;
        if channel >= state.spec.channels || gain <= 0.0 {
            return Err(ErrorCode::Parameter);
        }

        let gain_id = params::gain_id_for(state.spec.gain_steps, gain);
        let hardware_code = state.spec.gain_hw_index[gain_id];
        state.queues.set_bulk(catalog.set_gain, |cmd| {
            if let Some(c) = cmd.as_set_gain() {
                c.set_gain(channel, hardware_code);
            }
        });
        state.queues.set_control(CONTROL_SETRELAYS, |cmd| {
            if let Some(c) = cmd.as_set_relays() {
                c.set_below_1v(channel, gain_id < 3);
                c.set_below_100mv(channel, gain_id < 6);
            }
        });
        state.settings.voltage[channel].gain_id = gain_id;

        // The offset DAC range depends on the gain step.
        let offset = state.settings.voltage[channel].offset;
        apply_offset(&mut state, channel, offset);

        Ok(state.spec.gain_steps[gain_id])
    }

    /// Set the screen offset of a channel, 0.0 (bottom) to 1.0 (top).
    /// Returns the offset actually applied after DAC quantization.
    pub fn set_offset(&self, channel: usize, offset: f64) -> Result<f64> {
        let mut state = self.checked_state()?;
        if channel >= state.spec.channels || !(0.0..=1.0).contains(&offset) {
            return Err(ErrorCode::Parameter);
        }
        Ok(apply_offset(&mut state, channel, offset))
    }

    /// Select the trigger source: a channel, or one of the special
    /// sources when `special` is set.
    pub fn set_trigger_source(&self, special: bool, id: usize) -> Result<()> {
        let catalog = self.catalog()?;
        let mut state = self.checked_state()?;
        if (!special && id >= state.spec.channels) || (special && id >= state.spec.special_channels)
        {
            return Err(ErrorCode::Parameter);
        }

        match catalog.set_trigger {
            Some(BulkCode::SetTriggerAndSamplerate) => {
                let value = (if special { 3 + id } else { 1 - id }) as u8;
                state.queues.set_bulk(BulkCode::SetTriggerAndSamplerate, |cmd| {
                    if let Some(c) = cmd.as_set_trigger_and_samplerate() {
                        c.set_trigger_source(value);
                    }
                });
            }
            Some(BulkCode::CSetTriggerOrSamplerate) => {
                let value = (if special { 0 } else { 2 + id }) as u8;
                state.queues.set_bulk(BulkCode::CSetTriggerOrSamplerate, |cmd| {
                    if let Some(c) = cmd.as_set_trigger_2250() {
                        c.set_trigger_source(value);
                    }
                });
            }
            Some(BulkCode::ESetTriggerOrSamplerate) => {
                let value = (if special { 3 + id } else { 1 - id }) as u8;
                state.queues.set_bulk(BulkCode::ESetTriggerOrSamplerate, |cmd| {
                    if let Some(c) = cmd.as_set_trigger_5200() {
                        c.set_trigger_source(value);
                    }
                });
            }
            _ => return Err(ErrorCode::Unsupported),
        }

        state.queues.set_control(CONTROL_SETRELAYS, |cmd| {
            if let Some(c) = cmd.as_set_relays() {
                c.set_trigger(special);
            }
        });

        state.settings.trigger.special = special;
        state.settings.trigger.source = id;

        if special {
            // Special sources have a fixed mid-scale trigger level.
            state.queues.set_control(CONTROL_SETOFFSET, |cmd| {
                if let Some(c) = cmd.as_set_offset() {
                    c.set_trigger(0x7F);
                }
            });
        } else {
            let level = state.settings.trigger.level[id];
            apply_trigger_level(&mut state, id, level);
        }
        Ok(())
    }

    /// Set the trigger level of a channel in Volts. Returns the level
    /// actually applied after DAC quantization.
    pub fn set_trigger_level(&self, channel: usize, level: f64) -> Result<f64> {
        let mut state = self.checked_state()?;
        if channel >= state.spec.channels {
            return Err(ErrorCode::Parameter);
        }
        Ok(apply_trigger_level(&mut state, channel, level))
    }

    /// Set the slope that causes a trigger.
    pub fn set_trigger_slope(&self, slope: Slope) -> Result<()> {
        let catalog = self.catalog()?;
        let mut state = self.checked_state()?;

        match catalog.set_trigger {
            Some(BulkCode::SetTriggerAndSamplerate) => {
                state.queues.set_bulk(BulkCode::SetTriggerAndSamplerate, |cmd| {
                    if let Some(c) = cmd.as_set_trigger_and_samplerate() {
                        c.set_trigger_slope(slope as u8);
                    }
                });
            }
            Some(BulkCode::CSetTriggerOrSamplerate) => {
                state.queues.set_bulk(BulkCode::CSetTriggerOrSamplerate, |cmd| {
                    if let Some(c) = cmd.as_set_trigger_2250() {
                        c.set_trigger_slope(slope as u8);
                    }
                });
            }
            Some(BulkCode::ESetTriggerOrSamplerate) => {
                state.queues.set_bulk(BulkCode::ESetTriggerOrSamplerate, |cmd| {
                    if let Some(c) = cmd.as_set_trigger_5200() {
                        c.set_trigger_slope(slope as u8);
                    }
                });
            }
            _ => return Err(ErrorCode::Unsupported),
        }

        state.settings.trigger.slope = slope;
        Ok(())
    }

    /// Set the trigger mode. Single mode stops sampling after the first
    /// completed capture.
    pub fn set_trigger_mode(&self, mode: TriggerMode) -> Result<()> {
        let mut state = self.checked_state()?;
        state.settings.trigger.mode = mode;
        Ok(())
    }

    /// Set the pretrigger position in seconds from the record start.
    /// Returns the position actually applied after sample quantization.
    pub fn set_pretrigger_position(&self, position: f64) -> Result<f64> {
        let catalog = self.catalog()?;
        let mut state = self.checked_state()?;
        if position < 0.0 {
            return Err(ErrorCode::Parameter);
        }
        update_pretrigger_position(&mut state, catalog, position).ok_or(ErrorCode::Parameter)
    }

    // ── Internals ──

    fn catalog(&self) -> Result<&'static ProtocolCatalog> {
        self.shared.catalog.ok_or(ErrorCode::Unsupported)
    }

    fn checked_state(&self) -> Result<std::sync::MutexGuard<'_, State>> {
        if !self.is_connected() {
            return Err(ErrorCode::Connection);
        }
        Ok(self.shared.state.lock().unwrap())
    }
}

impl<T: DsoTransport + 'static> Drop for Device<T> {
    fn drop(&mut self) {
        self.disconnect();
    }
}

/// Install the command set of the connected model, per-model messages
/// marked pending so the initial flush pushes a complete configuration.
fn install_commands(queues: &mut CommandQueues, catalog: &ProtocolCatalog) {
    queues.clear();

    queues.install_bulk(
        BulkCode::ForceTrigger,
        BulkCommand::ForceTrigger(ForceTrigger::new()),
        false,
    );
    queues.install_bulk(
        BulkCode::CaptureStart,
        BulkCommand::CaptureStart(CaptureStart::new()),
        false,
    );
    queues.install_bulk(
        BulkCode::TriggerEnabled,
        BulkCommand::TriggerEnabled(TriggerEnabled::new()),
        false,
    );
    queues.install_bulk(BulkCode::GetData, BulkCommand::GetData(GetData::new()), false);
    queues.install_bulk(
        BulkCode::GetCaptureState,
        BulkCommand::GetCaptureState(GetCaptureState::new()),
        false,
    );
    queues.install_bulk(BulkCode::SetGain, BulkCommand::SetGain(SetGain::new()), false);

    if catalog.set_filter == Some(BulkCode::SetFilter) {
        queues.install_bulk(BulkCode::SetFilter, BulkCommand::SetFilter(SetFilter::new()), false);
    }

    match catalog.set_samplerate {
        Some(BulkCode::SetTriggerAndSamplerate) => {
            queues.install_bulk(
                BulkCode::SetTriggerAndSamplerate,
                BulkCommand::SetTriggerAndSamplerate(SetTriggerAndSamplerate::new()),
                true,
            );
        }
        Some(BulkCode::ESetTriggerOrSamplerate) => {
            queues.install_bulk(
                BulkCode::BSetChannels,
                BulkCommand::SetChannels2250(SetChannels2250::new()),
                true,
            );
            queues.install_bulk(
                BulkCode::CSetTriggerOrSamplerate,
                BulkCommand::SetTrigger2250(SetTrigger2250::new()),
                true,
            );
            queues.install_bulk(
                BulkCode::DSetBuffer,
                BulkCommand::SetRecordLength2250(SetRecordLength2250::new()),
                true,
            );
            queues.install_bulk(
                BulkCode::ESetTriggerOrSamplerate,
                BulkCommand::SetSamplerate2250(SetSamplerate2250::new()),
                true,
            );
            queues.install_bulk(
                BulkCode::FSetBuffer,
                BulkCommand::SetBuffer2250(SetBuffer2250::new()),
                true,
            );
        }
        Some(BulkCode::CSetTriggerOrSamplerate) => {
            queues.install_bulk(
                BulkCode::CSetTriggerOrSamplerate,
                BulkCommand::SetSamplerate5200(SetSamplerate5200::new()),
                true,
            );
            queues.install_bulk(
                BulkCode::DSetBuffer,
                BulkCommand::SetBuffer5200(SetBuffer5200::new()),
                true,
            );
            queues.install_bulk(
                BulkCode::ESetTriggerOrSamplerate,
                BulkCommand::SetTrigger5200(SetTrigger5200::new()),
                true,
            );
        }
        _ => {}
    }

    queues.install_control(
        CONTROL_SETOFFSET,
        ControlCommand::SetOffset(SetOffset::new()),
        true,
    );
    queues.install_control(
        CONTROL_SETRELAYS,
        ControlCommand::SetRelays(SetRelays::new()),
        true,
    );
}

/// Emit the reachable samplerate range for the current record length and
/// channel configuration.
fn update_samplerate_limits(state: &State, events: &EventHandlers) {
    let divider = state.settings.buffer_divider(&state.spec) as f64;
    let single = &state.spec.samplerate.single;
    let limits = if state.settings.used_channels <= 1 {
        &state.spec.samplerate.multi
    } else {
        &state.spec.samplerate.single
    };
    events.emit_samplerate_limits_changed(
        single.base / single.max_downsampler as f64 / divider,
        limits.max / divider,
    );
}

/// Program a resolved (downsampler, fast-rate) pair into the messages of
/// the connected model and update the dependent settings and events.
fn update_samplerate(
    state: &mut State,
    catalog: &ProtocolCatalog,
    events: &EventHandlers,
    downsampler: u32,
    fast_rate: bool,
) -> Option<u32> {
    let effective = match catalog.set_samplerate {
        Some(BulkCode::SetTriggerAndSamplerate) => {
            let limits = if fast_rate {
                &state.spec.samplerate.multi
            } else {
                &state.spec.samplerate.single
            };
            let encoded = params::encode_downsampler_2090(downsampler, limits.base >= limits.max);
            state.queues.set_bulk(BulkCode::SetTriggerAndSamplerate, |cmd| {
                if let Some(c) = cmd.as_set_trigger_and_samplerate() {
                    c.set_downsampling_mode(encoded.downsampling);
                    c.set_samplerate_id(encoded.samplerate_id);
                    c.set_downsampler(encoded.downsampler_value);
                    // The hardware misbehaves with the fast-rate flag in
                    // this message, both ADCs stay interleaved anyway.
                    c.set_fast_rate(false);
                }
            });
            encoded.effective
        }
        Some(BulkCode::CSetTriggerOrSamplerate) => {
            let (slow, fast) = params::encode_samplerate_5200(downsampler);
            state.queues.set_bulk(BulkCode::CSetTriggerOrSamplerate, |cmd| {
                if let Some(c) = cmd.as_set_samplerate_5200() {
                    c.set_samplerate_slow(slow);
                    c.set_samplerate_fast(fast);
                }
            });
            state.queues.set_bulk(BulkCode::ESetTriggerOrSamplerate, |cmd| {
                if let Some(c) = cmd.as_set_trigger_5200() {
                    c.set_fast_rate(fast_rate);
                }
            });
            downsampler
        }
        Some(BulkCode::ESetTriggerOrSamplerate) => {
            let (downsampling, value) = params::encode_samplerate_2250(downsampler);
            state.queues.set_bulk(BulkCode::ESetTriggerOrSamplerate, |cmd| {
                if let Some(c) = cmd.as_set_samplerate_2250() {
                    c.set_downsampling(downsampling);
                    c.set_samplerate(value);
                    c.set_fast_rate(fast_rate);
                }
            });
            downsampler
        }
        _ => return None,
    };

    let fast_rate_changed = fast_rate != state.settings.is_fast_rate();
    state.settings.samplerate.limits = if fast_rate {
        LimitsSelection::Multi
    } else {
        LimitsSelection::Single
    };
    state.settings.samplerate.downsampler = effective;

    let divider = state.settings.buffer_divider(&state.spec) as f64;
    let limits = state.settings.limits(&state.spec);
    state.settings.samplerate.current = if effective > 0 {
        limits.base / divider / effective as f64
    } else {
        limits.max / divider
    };

    let position = state.settings.trigger.position;
    update_pretrigger_position(state, catalog, position);

    if fast_rate_changed {
        let lengths = state.settings.limits(&state.spec).record_lengths;
        events.emit_record_length_changed(lengths, state.settings.record_length_id);
    }
    if !state.settings.is_roll_mode(&state.spec) {
        events.emit_record_time_changed(
            state.settings.record_length(&state.spec) as f64 / state.settings.samplerate.current,
        );
    }
    events.emit_samplerate_changed(state.settings.samplerate.current);

    Some(effective)
}

/// Resolve and apply a samplerate request. Returns the rate configured.
fn set_samplerate_inner(
    state: &mut State,
    catalog: &ProtocolCatalog,
    events: &EventHandlers,
    samplerate: f64,
) -> Option<f64> {
    if samplerate <= 0.0 {
        return None;
    }
    state.settings.samplerate.target = SamplerateTarget::Rate(samplerate);

    // Fast rate when a single channel needs more than the normal mode
    // can deliver.
    let divider = state.settings.buffer_divider(&state.spec) as f64;
    let fast_rate = state.settings.used_channels <= 1
        && samplerate > state.spec.samplerate.single.max / divider;

    let (downsampler, best) = params::compute_best_samplerate(
        &state.spec,
        catalog,
        state.settings.record_length_id,
        samplerate,
        fast_rate,
        false,
    )?;
    update_samplerate(state, catalog, events, downsampler, fast_rate)?;
    Some(best)
}

/// Resolve and apply a record-time request. Returns the duration
/// configured.
fn set_record_time_inner(
    state: &mut State,
    catalog: &ProtocolCatalog,
    events: &EventHandlers,
    duration: f64,
) -> Option<f64> {
    if duration <= 0.0 {
        return None;
    }
    state.settings.samplerate.target = SamplerateTarget::Duration(duration);

    // The highest samplerate still filling the record in `duration`.
    let record_length =
        state.spec.samplerate.single.record_lengths[state.settings.record_length_id];
    let max_samplerate = record_length as f64 / duration;

    // Use fast rate when it improves resolution at this duration.
    let divider = state.settings.buffer_divider(&state.spec) as f64;
    let fast_rate = state.settings.used_channels <= 1
        && max_samplerate >= state.spec.samplerate.multi.base / divider;

    let (downsampler, best) = params::compute_best_samplerate(
        &state.spec,
        catalog,
        state.settings.record_length_id,
        max_samplerate,
        fast_rate,
        true,
    )?;
    update_samplerate(state, catalog, events, downsampler, fast_rate)?;
    Some(state.settings.record_length(&state.spec) as f64 / best)
}

/// Re-resolve the last samplerate or record-time target, after divider
/// or record-length changes.
fn restore_targets(state: &mut State, catalog: &ProtocolCatalog, events: &EventHandlers) {
    match state.settings.samplerate.target {
        SamplerateTarget::Rate(rate) => {
            if rate > 0.0 {
                set_samplerate_inner(state, catalog, events, rate);
            }
        }
        SamplerateTarget::Duration(duration) => {
            if duration > 0.0 {
                set_record_time_inner(state, catalog, events, duration);
            }
        }
    }
}

/// Program a record-length tier. Returns the record length set.
fn update_record_length(
    state: &mut State,
    catalog: &ProtocolCatalog,
    events: &EventHandlers,
    index: usize,
) -> Option<u32> {
    if index >= state.settings.limits(&state.spec).record_lengths.len() {
        return None;
    }

    match catalog.set_record_length {
        Some(BulkCode::SetTriggerAndSamplerate) => {
            state.queues.set_bulk(BulkCode::SetTriggerAndSamplerate, |cmd| {
                if let Some(c) = cmd.as_set_trigger_and_samplerate() {
                    c.set_record_length(index as u8);
                }
            });
        }
        Some(BulkCode::DSetBuffer) => {
            if catalog.set_pretrigger == Some(BulkCode::FSetBuffer) {
                state.queues.set_bulk(BulkCode::DSetBuffer, |cmd| {
                    if let Some(c) = cmd.as_set_record_length_2250() {
                        c.set_record_length(index as u8);
                    }
                });
            } else {
                state.queues.set_bulk(BulkCode::DSetBuffer, |cmd| {
                    if let Some(c) = cmd.as_set_buffer_5200() {
                        c.set_used_pre(DTRIGGERPOSITION_ON);
                        c.set_used_post(DTRIGGERPOSITION_ON);
                        c.set_record_length(index as u8);
                    }
                });
            }
        }
        _ => return None,
    }

    let divider_changed =
        state.spec.buffer_dividers[index] != state.settings.buffer_divider(&state.spec);
    state.settings.record_length_id = index;

    if divider_changed {
        update_samplerate_limits(state, events);
        restore_targets(state, catalog, events);
    }

    Some(state.settings.record_length(&state.spec))
}

/// Encode and program the pretrigger position. Returns the position
/// actually applied.
fn update_pretrigger_position(
    state: &mut State,
    catalog: &ProtocolCatalog,
    position: f64,
) -> Option<f64> {
    let current = state.settings.samplerate.current;
    if current <= 0.0 {
        return None;
    }

    let mut position_samples = position * current;
    // Fast rate splits the position over both ADCs.
    if state.settings.is_fast_rate() {
        position_samples /= state.spec.channels as f64;
    }

    let record_length = state.settings.record_length(&state.spec);
    let roll_mode = state.settings.is_roll_mode(&state.spec);
    let words = params::encode_trigger_position(
        catalog.set_pretrigger?,
        roll_mode,
        record_length,
        position_samples as u32,
    )?;

    match words {
        params::TriggerPositionWords::Single19(value) => {
            state.queues.set_bulk(BulkCode::SetTriggerAndSamplerate, |cmd| {
                if let Some(c) = cmd.as_set_trigger_and_samplerate() {
                    c.set_trigger_position(value);
                }
            });
        }
        params::TriggerPositionWords::PrePost19 { pre, post } => {
            state.queues.set_bulk(BulkCode::FSetBuffer, |cmd| {
                if let Some(c) = cmd.as_set_buffer_2250() {
                    c.set_trigger_position_pre(pre);
                    c.set_trigger_position_post(post);
                }
            });
        }
        params::TriggerPositionWords::PrePost16 { pre, post } => {
            state.queues.set_bulk(BulkCode::DSetBuffer, |cmd| {
                if let Some(c) = cmd.as_set_buffer_5200() {
                    c.set_trigger_position_pre(pre);
                    c.set_trigger_position_post(post);
                }
            });
        }
    }

    state.settings.trigger.position = position;
    Some((position_samples as u32) as f64 / current)
}

/// Map an offset fraction through the calibration range, program the
/// DAC and re-apply the trigger level against the new offset. Returns
/// the quantized offset.
fn apply_offset(state: &mut State, channel: usize, offset: f64) -> f64 {
    let gain_id = state.settings.voltage[channel].gain_id;
    let range = state.spec.limits[channel].offset_calibration[gain_id];
    let (dac, real) = params::offset_dac(offset, range);

    state.queues.set_control(CONTROL_SETOFFSET, |cmd| {
        if let Some(c) = cmd.as_set_offset() {
            c.set_channel(channel, dac);
        }
    });
    state.settings.voltage[channel].offset = offset;
    state.settings.voltage[channel].offset_real = real;

    let level = state.settings.trigger.level[channel];
    apply_trigger_level(state, channel, level);
    real
}

/// Map a trigger level in Volts onto the DAC range of the channel. The
/// DAC is only written when the channel is the active non-special
/// trigger source. Returns the quantized level.
fn apply_trigger_level(state: &mut State, channel: usize, level: f64) -> f64 {
    let gain_id = state.settings.voltage[channel].gain_id;
    let (min, max) = params::trigger_level_range(
        state.spec.sample_size,
        state.spec.limits[channel].offset_calibration[gain_id],
    );
    let (dac, applied) = params::trigger_level_dac(
        level,
        state.spec.gain_steps[gain_id],
        state.settings.voltage[channel].offset_real,
        min,
        max,
    );

    if !state.settings.trigger.special && channel == state.settings.trigger.source {
        state.queues.set_control(CONTROL_SETOFFSET, |cmd| {
            if let Some(c) = cmd.as_set_offset() {
                c.set_trigger(dac);
            }
        });
    }

    state.settings.trigger.level[channel] = level;
    applied
}
