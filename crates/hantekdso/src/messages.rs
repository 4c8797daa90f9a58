//! Fixed-size command frames with typed field accessors.
//!
//! Every message owns a byte array of the exact size the device expects
//! and packs its fields at fixed offsets. Multi-byte payload fields are
//! little-endian; the offset/trigger DAC words in [`SetOffset`] are
//! big-endian, matching the calibration block read from the device.
//!
//! Byte layouts per message (first byte is always the opcode):
//!
//! - `SetFilter` (8): `00 00 FilterBits 00 00 00 00 00`
//! - `SetTriggerAndSamplerate` (12): `01 00 Tsr1 Tsr2 Downsampler[0..2]
//!   TriggerPosition[0] TriggerPosition[1] 00 00 TriggerPosition[2] 00`
//! - `ForceTrigger`/`CaptureStart`/`TriggerEnabled`/`GetData`/
//!   `GetCaptureState` (2): opcode `00`
//! - `SetGain` (8): `07 00 GainBits 00 00 00 00 00`
//! - `SetChannels2250` (4): `0B 00 UsedChannels 00`
//! - `SetTrigger2250` (8): `0C 00 CTriggerBits 00 00 00 00 00`
//! - `SetSamplerate5200` (6): `0C 00 Slow[0] Slow[1] Fast 00`
//! - `SetRecordLength2250` (4): `0D 00 RecordLengthId 00`
//! - `SetBuffer5200` (10): `0D 00 Pre[0] Pre[1] UsedPre FF Post[0] Post[1]
//!   DBufferBits FF`
//! - `SetSamplerate2250` (8): `0E 00 ESamplerateBits 00 Rate[0] Rate[1] 00 00`
//! - `SetTrigger5200` (8): `0E 00 ETsrBits 00 00 00 00 00`
//! - `SetBuffer2250` (12): `0F 00 Post[0..3] 00 Pre[0..3] 00 00 00`

use crate::protocol::BulkCode;

/// A fixed-size protocol frame.
pub trait Frame {
    /// The raw bytes written to the device.
    fn bytes(&self) -> &[u8];
}

macro_rules! frame_impl {
    ($ty:ident, $len:expr) => {
        impl Frame for $ty {
            fn bytes(&self) -> &[u8] {
                &self.raw
            }
        }

        impl Default for $ty {
            fn default() -> Self {
                Self::new()
            }
        }
    };
}

fn set_bits(byte: &mut u8, shift: u8, width: u8, value: u8) {
    let mask = ((1u16 << width) - 1) as u8;
    *byte = (*byte & !(mask << shift)) | ((value & mask) << shift);
}

fn get_bits(byte: u8, shift: u8, width: u8) -> u8 {
    let mask = ((1u16 << width) - 1) as u8;
    (byte >> shift) & mask
}

// ── Bulk frames ──

/// Channel and trigger noise filter (DSO-2090/2150/5200). The official
/// software sends it although the hardware does not appear to react.
#[derive(Debug, Clone)]
pub struct SetFilter {
    raw: [u8; 8],
}

impl SetFilter {
    pub fn new() -> Self {
        let mut raw = [0; 8];
        raw[0] = BulkCode::SetFilter as u8;
        SetFilter { raw }
    }

    pub fn set_channel(&mut self, channel: usize, filtered: bool) {
        set_bits(&mut self.raw[2], channel as u8, 1, filtered as u8);
    }

    pub fn channel(&self, channel: usize) -> bool {
        get_bits(self.raw[2], channel as u8, 1) != 0
    }

    pub fn set_trigger(&mut self, filtered: bool) {
        set_bits(&mut self.raw[2], 2, 1, filtered as u8);
    }

    pub fn trigger(&self) -> bool {
        get_bits(self.raw[2], 2, 1) != 0
    }
}
frame_impl!(SetFilter, 8);

/// Combined trigger and timebase message of the DSO-2090/2150.
///
/// `Tsr1` packs trigger source (2 bits), record length id (3 bits),
/// samplerate id (2 bits) and the downsampling-mode flag; `Tsr2` packs
/// the used-channels field (2 bits), fast-rate flag and trigger slope.
/// The trigger position is a 19-bit value split over payload bytes 6, 7
/// and 10.
#[derive(Debug, Clone)]
pub struct SetTriggerAndSamplerate {
    raw: [u8; 12],
}

impl SetTriggerAndSamplerate {
    pub fn new() -> Self {
        let mut raw = [0; 12];
        raw[0] = BulkCode::SetTriggerAndSamplerate as u8;
        SetTriggerAndSamplerate { raw }
    }

    pub fn set_trigger_source(&mut self, value: u8) {
        set_bits(&mut self.raw[2], 0, 2, value);
    }

    pub fn trigger_source(&self) -> u8 {
        get_bits(self.raw[2], 0, 2)
    }

    pub fn set_record_length(&mut self, value: u8) {
        set_bits(&mut self.raw[2], 2, 3, value);
    }

    pub fn record_length(&self) -> u8 {
        get_bits(self.raw[2], 2, 3)
    }

    pub fn set_samplerate_id(&mut self, value: u8) {
        set_bits(&mut self.raw[2], 5, 2, value);
    }

    pub fn samplerate_id(&self) -> u8 {
        get_bits(self.raw[2], 5, 2)
    }

    pub fn set_downsampling_mode(&mut self, downsampling: bool) {
        set_bits(&mut self.raw[2], 7, 1, downsampling as u8);
    }

    pub fn downsampling_mode(&self) -> bool {
        get_bits(self.raw[2], 7, 1) != 0
    }

    pub fn set_used_channels(&mut self, value: u8) {
        set_bits(&mut self.raw[3], 0, 2, value);
    }

    pub fn used_channels(&self) -> u8 {
        get_bits(self.raw[3], 0, 2)
    }

    pub fn set_fast_rate(&mut self, fast_rate: bool) {
        set_bits(&mut self.raw[3], 2, 1, fast_rate as u8);
    }

    pub fn fast_rate(&self) -> bool {
        get_bits(self.raw[3], 2, 1) != 0
    }

    pub fn set_trigger_slope(&mut self, slope: u8) {
        set_bits(&mut self.raw[3], 3, 1, slope);
    }

    pub fn trigger_slope(&self) -> u8 {
        get_bits(self.raw[3], 3, 1)
    }

    pub fn set_downsampler(&mut self, downsampler: u16) {
        self.raw[4..6].copy_from_slice(&downsampler.to_le_bytes());
    }

    pub fn downsampler(&self) -> u16 {
        u16::from_le_bytes([self.raw[4], self.raw[5]])
    }

    pub fn set_trigger_position(&mut self, position: u32) {
        self.raw[6] = position as u8;
        self.raw[7] = (position >> 8) as u8;
        self.raw[10] = ((position >> 16) & 0x07) as u8;
    }

    pub fn trigger_position(&self) -> u32 {
        self.raw[6] as u32 | (self.raw[7] as u32) << 8 | ((self.raw[10] & 0x07) as u32) << 16
    }
}
frame_impl!(SetTriggerAndSamplerate, 12);

macro_rules! simple_frame {
    ($(#[$doc:meta])* $ty:ident, $code:expr) => {
        $(#[$doc])*
        #[derive(Debug, Clone)]
        pub struct $ty {
            raw: [u8; 2],
        }

        impl $ty {
            pub fn new() -> Self {
                $ty { raw: [$code as u8, 0] }
            }
        }
        frame_impl!($ty, 2);
    };
}

simple_frame!(
    /// Force a trigger event.
    ForceTrigger,
    BulkCode::ForceTrigger
);
simple_frame!(
    /// Start capturing.
    CaptureStart,
    BulkCode::CaptureStart
);
simple_frame!(
    /// Arm the trigger.
    TriggerEnabled,
    BulkCode::TriggerEnabled
);
simple_frame!(
    /// Request the sample buffer.
    GetData,
    BulkCode::GetData
);
simple_frame!(
    /// Request the capture state.
    GetCaptureState,
    BulkCode::GetCaptureState
);

/// Size of the GetCaptureState response read from the IN endpoint.
pub const CAPTURE_STATE_RESPONSE_LEN: usize = 512;

/// Parsed view of the GetCaptureState response: the state code in byte 0
/// and the (still encoded) trigger point in bytes 2..4.
#[derive(Debug, Clone, Copy)]
pub struct CaptureStateResponse {
    pub state_code: u8,
    pub raw_trigger_point: u16,
}

impl CaptureStateResponse {
    pub fn parse(data: &[u8]) -> Option<CaptureStateResponse> {
        if data.len() < 4 {
            return None;
        }
        Some(CaptureStateResponse {
            state_code: data[0],
            raw_trigger_point: u16::from_le_bytes([data[2], data[3]]),
        })
    }
}

/// Per-channel hardware gain codes, 2 bits each.
#[derive(Debug, Clone)]
pub struct SetGain {
    raw: [u8; 8],
}

impl SetGain {
    pub fn new() -> Self {
        let mut raw = [0; 8];
        raw[0] = BulkCode::SetGain as u8;
        SetGain { raw }
    }

    pub fn set_gain(&mut self, channel: usize, value: u8) {
        set_bits(&mut self.raw[2], channel as u8 * 2, 2, value);
    }

    pub fn gain(&self, channel: usize) -> u8 {
        get_bits(self.raw[2], channel as u8 * 2, 2)
    }
}
frame_impl!(SetGain, 8);

/// Active channel selection of the DSO-2250.
#[derive(Debug, Clone)]
pub struct SetChannels2250 {
    raw: [u8; 4],
}

impl SetChannels2250 {
    pub fn new() -> Self {
        let mut raw = [0; 4];
        raw[0] = BulkCode::BSetChannels as u8;
        SetChannels2250 { raw }
    }

    pub fn set_used_channels(&mut self, value: u8) {
        self.raw[2] = value;
    }

    pub fn used_channels(&self) -> u8 {
        self.raw[2]
    }
}
frame_impl!(SetChannels2250, 4);

/// Trigger source and slope of the DSO-2250.
#[derive(Debug, Clone)]
pub struct SetTrigger2250 {
    raw: [u8; 8],
}

impl SetTrigger2250 {
    pub fn new() -> Self {
        let mut raw = [0; 8];
        raw[0] = BulkCode::CSetTriggerOrSamplerate as u8;
        SetTrigger2250 { raw }
    }

    pub fn set_trigger_source(&mut self, value: u8) {
        set_bits(&mut self.raw[2], 0, 3, value);
    }

    pub fn trigger_source(&self) -> u8 {
        get_bits(self.raw[2], 0, 3)
    }

    pub fn set_trigger_slope(&mut self, slope: u8) {
        set_bits(&mut self.raw[2], 3, 1, slope);
    }

    pub fn trigger_slope(&self) -> u8 {
        get_bits(self.raw[2], 3, 1)
    }
}
frame_impl!(SetTrigger2250, 8);

/// Samplerate divider of the DSO-5200, split into a slow 16-bit and a
/// fast 8-bit part.
#[derive(Debug, Clone)]
pub struct SetSamplerate5200 {
    raw: [u8; 6],
}

impl SetSamplerate5200 {
    pub fn new() -> Self {
        let mut raw = [0; 6];
        raw[0] = BulkCode::CSetTriggerOrSamplerate as u8;
        SetSamplerate5200 { raw }
    }

    pub fn set_samplerate_slow(&mut self, value: u16) {
        self.raw[2..4].copy_from_slice(&value.to_le_bytes());
    }

    pub fn samplerate_slow(&self) -> u16 {
        u16::from_le_bytes([self.raw[2], self.raw[3]])
    }

    pub fn set_samplerate_fast(&mut self, value: u8) {
        self.raw[4] = value;
    }

    pub fn samplerate_fast(&self) -> u8 {
        self.raw[4]
    }
}
frame_impl!(SetSamplerate5200, 6);

/// Record length tier of the DSO-2250.
#[derive(Debug, Clone)]
pub struct SetRecordLength2250 {
    raw: [u8; 4],
}

impl SetRecordLength2250 {
    pub fn new() -> Self {
        let mut raw = [0; 4];
        raw[0] = BulkCode::DSetBuffer as u8;
        SetRecordLength2250 { raw }
    }

    pub fn set_record_length(&mut self, value: u8) {
        self.raw[2] = value;
    }

    pub fn record_length(&self) -> u8 {
        self.raw[2]
    }
}
frame_impl!(SetRecordLength2250, 4);

/// Value of the UsedPre/UsedPost fields when the pretrigger position is
/// in use on the DSO-5200.
pub const DTRIGGERPOSITION_ON: u8 = 0x07;

/// Trigger position and record length of the DSO-5200. The pre/post
/// positions are 16-bit inverse coordinates.
#[derive(Debug, Clone)]
pub struct SetBuffer5200 {
    raw: [u8; 10],
}

impl SetBuffer5200 {
    pub fn new() -> Self {
        let mut raw = [0; 10];
        raw[0] = BulkCode::DSetBuffer as u8;
        raw[5] = 0xFF;
        raw[9] = 0xFF;
        SetBuffer5200 { raw }
    }

    pub fn set_trigger_position_pre(&mut self, value: u16) {
        self.raw[2..4].copy_from_slice(&value.to_le_bytes());
    }

    pub fn trigger_position_pre(&self) -> u16 {
        u16::from_le_bytes([self.raw[2], self.raw[3]])
    }

    pub fn set_used_pre(&mut self, value: u8) {
        self.raw[4] = value;
    }

    pub fn used_pre(&self) -> u8 {
        self.raw[4]
    }

    pub fn set_trigger_position_post(&mut self, value: u16) {
        self.raw[6..8].copy_from_slice(&value.to_le_bytes());
    }

    pub fn trigger_position_post(&self) -> u16 {
        u16::from_le_bytes([self.raw[6], self.raw[7]])
    }

    pub fn set_record_length(&mut self, value: u8) {
        set_bits(&mut self.raw[8], 0, 3, value);
    }

    pub fn record_length(&self) -> u8 {
        get_bits(self.raw[8], 0, 3)
    }

    pub fn set_used_post(&mut self, value: u8) {
        set_bits(&mut self.raw[8], 3, 3, value);
    }

    pub fn used_post(&self) -> u8 {
        get_bits(self.raw[8], 3, 3)
    }
}
frame_impl!(SetBuffer5200, 10);

/// Samplerate divider of the DSO-2250.
#[derive(Debug, Clone)]
pub struct SetSamplerate2250 {
    raw: [u8; 8],
}

impl SetSamplerate2250 {
    pub fn new() -> Self {
        let mut raw = [0; 8];
        raw[0] = BulkCode::ESetTriggerOrSamplerate as u8;
        SetSamplerate2250 { raw }
    }

    pub fn set_fast_rate(&mut self, fast_rate: bool) {
        set_bits(&mut self.raw[2], 0, 1, fast_rate as u8);
    }

    pub fn fast_rate(&self) -> bool {
        get_bits(self.raw[2], 0, 1) != 0
    }

    pub fn set_downsampling(&mut self, downsampling: bool) {
        set_bits(&mut self.raw[2], 1, 1, downsampling as u8);
    }

    pub fn downsampling(&self) -> bool {
        get_bits(self.raw[2], 1, 1) != 0
    }

    pub fn set_samplerate(&mut self, value: u16) {
        self.raw[4..6].copy_from_slice(&value.to_le_bytes());
    }

    pub fn samplerate(&self) -> u16 {
        u16::from_le_bytes([self.raw[4], self.raw[5]])
    }
}
frame_impl!(SetSamplerate2250, 8);

/// Channel and trigger settings of the DSO-5200.
#[derive(Debug, Clone)]
pub struct SetTrigger5200 {
    raw: [u8; 8],
}

impl SetTrigger5200 {
    pub fn new() -> Self {
        let mut raw = [0; 8];
        raw[0] = BulkCode::ESetTriggerOrSamplerate as u8;
        SetTrigger5200 { raw }
    }

    pub fn set_fast_rate(&mut self, fast_rate: bool) {
        set_bits(&mut self.raw[2], 0, 1, fast_rate as u8);
    }

    pub fn fast_rate(&self) -> bool {
        get_bits(self.raw[2], 0, 1) != 0
    }

    pub fn set_used_channels(&mut self, value: u8) {
        set_bits(&mut self.raw[2], 1, 2, value);
    }

    pub fn used_channels(&self) -> u8 {
        get_bits(self.raw[2], 1, 2)
    }

    pub fn set_trigger_source(&mut self, value: u8) {
        set_bits(&mut self.raw[2], 3, 3, value);
    }

    pub fn trigger_source(&self) -> u8 {
        get_bits(self.raw[2], 3, 3)
    }

    pub fn set_trigger_slope(&mut self, slope: u8) {
        set_bits(&mut self.raw[2], 6, 1, slope);
    }

    pub fn trigger_slope(&self) -> u8 {
        get_bits(self.raw[2], 6, 1)
    }

    pub fn set_trigger_pulse(&mut self, pulse: bool) {
        set_bits(&mut self.raw[2], 7, 1, pulse as u8);
    }

    pub fn trigger_pulse(&self) -> bool {
        get_bits(self.raw[2], 7, 1) != 0
    }
}
frame_impl!(SetTrigger5200, 8);

/// Trigger position of the DSO-2250, 19-bit inverse pre/post pair.
#[derive(Debug, Clone)]
pub struct SetBuffer2250 {
    raw: [u8; 12],
}

impl SetBuffer2250 {
    pub fn new() -> Self {
        let mut raw = [0; 12];
        raw[0] = BulkCode::FSetBuffer as u8;
        SetBuffer2250 { raw }
    }

    pub fn set_trigger_position_post(&mut self, value: u32) {
        self.raw[2] = value as u8;
        self.raw[3] = (value >> 8) as u8;
        self.raw[4] = ((value >> 16) & 0x07) as u8;
    }

    pub fn trigger_position_post(&self) -> u32 {
        self.raw[2] as u32 | (self.raw[3] as u32) << 8 | ((self.raw[4] & 0x07) as u32) << 16
    }

    pub fn set_trigger_position_pre(&mut self, value: u32) {
        self.raw[6] = value as u8;
        self.raw[7] = (value >> 8) as u8;
        self.raw[8] = ((value >> 16) & 0x07) as u8;
    }

    pub fn trigger_position_pre(&self) -> u32 {
        self.raw[6] as u32 | (self.raw[7] as u32) << 8 | ((self.raw[8] & 0x07) as u32) << 16
    }
}
frame_impl!(SetBuffer2250, 12);

// ── Control frames ──

/// Transaction prefix written as a control request before every bulk
/// command. The payload never changes but the write itself marks the
/// transaction boundary for the device.
#[derive(Debug, Clone)]
pub struct BeginCommand {
    raw: [u8; 10],
}

impl BeginCommand {
    pub fn new() -> Self {
        let mut raw = [0; 10];
        raw[0] = 0x0F;
        raw[1] = 0x03;
        BeginCommand { raw }
    }
}
frame_impl!(BeginCommand, 10);

/// Channel offset and trigger level DAC codes, written big-endian.
#[derive(Debug, Clone)]
pub struct SetOffset {
    raw: [u8; 17],
}

impl SetOffset {
    pub fn new() -> Self {
        SetOffset { raw: [0; 17] }
    }

    pub fn set_channel(&mut self, channel: usize, offset: u16) {
        self.raw[channel * 2..channel * 2 + 2].copy_from_slice(&offset.to_be_bytes());
    }

    pub fn channel(&self, channel: usize) -> u16 {
        u16::from_be_bytes([self.raw[channel * 2], self.raw[channel * 2 + 1]])
    }

    pub fn set_trigger(&mut self, level: u16) {
        self.raw[4..6].copy_from_slice(&level.to_be_bytes());
    }

    pub fn trigger(&self) -> u16 {
        u16::from_be_bytes([self.raw[4], self.raw[5]])
    }
}
frame_impl!(SetOffset, 17);

/// Relay states. One byte per relay; the relay id is written as-is when
/// the relay is engaged and bit-inverted when released.
#[derive(Debug, Clone)]
pub struct SetRelays {
    raw: [u8; 17],
}

const RELAY_COUPLING_DC: [u8; 2] = [0x02, 0x10];
const RELAY_BELOW_1V: [u8; 2] = [0x04, 0x20];
const RELAY_BELOW_100MV: [u8; 2] = [0x08, 0x40];
const RELAY_EXT_TRIGGER: u8 = 0x01;

impl SetRelays {
    pub fn new() -> Self {
        let mut relays = SetRelays { raw: [0; 17] };
        for channel in 0..2 {
            relays.set_coupling(channel, true);
            relays.set_below_1v(channel, false);
            relays.set_below_100mv(channel, false);
        }
        relays.set_trigger(false);
        relays
    }

    fn set_relay(&mut self, index: usize, id: u8, engaged: bool) {
        self.raw[index] = if engaged { id } else { !id };
    }

    pub fn set_coupling(&mut self, channel: usize, dc: bool) {
        self.set_relay(3 + channel * 3, RELAY_COUPLING_DC[channel], dc);
    }

    pub fn coupling(&self, channel: usize) -> bool {
        self.raw[3 + channel * 3] == RELAY_COUPLING_DC[channel]
    }

    pub fn set_below_1v(&mut self, channel: usize, below: bool) {
        self.set_relay(1 + channel * 3, RELAY_BELOW_1V[channel], below);
    }

    pub fn below_1v(&self, channel: usize) -> bool {
        self.raw[1 + channel * 3] == RELAY_BELOW_1V[channel]
    }

    pub fn set_below_100mv(&mut self, channel: usize, below: bool) {
        self.set_relay(2 + channel * 3, RELAY_BELOW_100MV[channel], below);
    }

    pub fn below_100mv(&self, channel: usize) -> bool {
        self.raw[2 + channel * 3] == RELAY_BELOW_100MV[channel]
    }

    pub fn set_trigger(&mut self, external: bool) {
        self.set_relay(7, RELAY_EXT_TRIGGER, external);
    }

    pub fn trigger(&self) -> bool {
        self.raw[7] == RELAY_EXT_TRIGGER
    }
}
frame_impl!(SetRelays, 17);

// ── Queue storage ──

/// A bulk command slot. One variant per concrete message; the queue
/// stores at most one instance per opcode.
#[derive(Debug, Clone)]
pub enum BulkCommand {
    SetFilter(SetFilter),
    SetTriggerAndSamplerate(SetTriggerAndSamplerate),
    ForceTrigger(ForceTrigger),
    CaptureStart(CaptureStart),
    TriggerEnabled(TriggerEnabled),
    GetData(GetData),
    GetCaptureState(GetCaptureState),
    SetGain(SetGain),
    SetChannels2250(SetChannels2250),
    SetTrigger2250(SetTrigger2250),
    SetSamplerate5200(SetSamplerate5200),
    SetRecordLength2250(SetRecordLength2250),
    SetBuffer5200(SetBuffer5200),
    SetSamplerate2250(SetSamplerate2250),
    SetTrigger5200(SetTrigger5200),
    SetBuffer2250(SetBuffer2250),
}

macro_rules! bulk_accessor {
    ($fn_name:ident, $variant:ident, $ty:ty) => {
        pub fn $fn_name(&mut self) -> Option<&mut $ty> {
            match self {
                BulkCommand::$variant(cmd) => Some(cmd),
                _ => None,
            }
        }
    };
}

impl BulkCommand {
    pub fn bytes(&self) -> &[u8] {
        match self {
            BulkCommand::SetFilter(c) => c.bytes(),
            BulkCommand::SetTriggerAndSamplerate(c) => c.bytes(),
            BulkCommand::ForceTrigger(c) => c.bytes(),
            BulkCommand::CaptureStart(c) => c.bytes(),
            BulkCommand::TriggerEnabled(c) => c.bytes(),
            BulkCommand::GetData(c) => c.bytes(),
            BulkCommand::GetCaptureState(c) => c.bytes(),
            BulkCommand::SetGain(c) => c.bytes(),
            BulkCommand::SetChannels2250(c) => c.bytes(),
            BulkCommand::SetTrigger2250(c) => c.bytes(),
            BulkCommand::SetSamplerate5200(c) => c.bytes(),
            BulkCommand::SetRecordLength2250(c) => c.bytes(),
            BulkCommand::SetBuffer5200(c) => c.bytes(),
            BulkCommand::SetSamplerate2250(c) => c.bytes(),
            BulkCommand::SetTrigger5200(c) => c.bytes(),
            BulkCommand::SetBuffer2250(c) => c.bytes(),
        }
    }

    bulk_accessor!(as_set_filter, SetFilter, SetFilter);
    bulk_accessor!(
        as_set_trigger_and_samplerate,
        SetTriggerAndSamplerate,
        SetTriggerAndSamplerate
    );
    bulk_accessor!(as_set_gain, SetGain, SetGain);
    bulk_accessor!(as_set_channels_2250, SetChannels2250, SetChannels2250);
    bulk_accessor!(as_set_trigger_2250, SetTrigger2250, SetTrigger2250);
    bulk_accessor!(as_set_samplerate_5200, SetSamplerate5200, SetSamplerate5200);
    bulk_accessor!(
        as_set_record_length_2250,
        SetRecordLength2250,
        SetRecordLength2250
    );
    bulk_accessor!(as_set_buffer_5200, SetBuffer5200, SetBuffer5200);
    bulk_accessor!(as_set_samplerate_2250, SetSamplerate2250, SetSamplerate2250);
    bulk_accessor!(as_set_trigger_5200, SetTrigger5200, SetTrigger5200);
    bulk_accessor!(as_set_buffer_2250, SetBuffer2250, SetBuffer2250);
}

/// A control command slot.
#[derive(Debug, Clone)]
pub enum ControlCommand {
    SetOffset(SetOffset),
    SetRelays(SetRelays),
}

impl ControlCommand {
    pub fn bytes(&self) -> &[u8] {
        match self {
            ControlCommand::SetOffset(c) => c.bytes(),
            ControlCommand::SetRelays(c) => c.bytes(),
        }
    }

    pub fn as_set_offset(&mut self) -> Option<&mut SetOffset> {
        match self {
            ControlCommand::SetOffset(c) => Some(c),
            _ => None,
        }
    }

    pub fn as_set_relays(&mut self) -> Option<&mut SetRelays> {
        match self {
            ControlCommand::SetRelays(c) => Some(c),
            _ => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn simple_frames_are_opcode_plus_padding() {
        assert_eq!(ForceTrigger::new().bytes(), &[0x02, 0x00]);
        assert_eq!(CaptureStart::new().bytes(), &[0x03, 0x00]);
        assert_eq!(TriggerEnabled::new().bytes(), &[0x04, 0x00]);
        assert_eq!(GetData::new().bytes(), &[0x05, 0x00]);
        assert_eq!(GetCaptureState::new().bytes(), &[0x06, 0x00]);
    }

    #[test]
    fn trigger_and_samplerate_layout() {
        let mut cmd = SetTriggerAndSamplerate::new();
        cmd.set_trigger_source(1);
        cmd.set_record_length(2);
        cmd.set_samplerate_id(3);
        cmd.set_downsampling_mode(true);
        cmd.set_used_channels(2);
        cmd.set_fast_rate(true);
        cmd.set_trigger_slope(1);
        cmd.set_downsampler(0xFFE8);
        cmd.set_trigger_position(0x7_FFFF);

        let bytes = cmd.bytes();
        assert_eq!(bytes.len(), 12);
        assert_eq!(bytes[0], 0x01);
        // Tsr1: source=1, recordLength=2 (<<2), samplerateId=3 (<<5), mode (<<7)
        assert_eq!(bytes[2], 0x01 | 0x02 << 2 | 0x03 << 5 | 0x80);
        // Tsr2: usedChannels=2, fastRate (<<2), slope (<<3)
        assert_eq!(bytes[3], 0x02 | 0x04 | 0x08);
        // Downsampler, little-endian
        assert_eq!(&bytes[4..6], &[0xE8, 0xFF]);
        // 19-bit trigger position split over bytes 6, 7 and 10
        assert_eq!(bytes[6], 0xFF);
        assert_eq!(bytes[7], 0xFF);
        assert_eq!(bytes[8], 0x00);
        assert_eq!(bytes[9], 0x00);
        assert_eq!(bytes[10], 0x07);
        assert_eq!(bytes[11], 0x00);

        assert_eq!(cmd.downsampler(), 0xFFE8);
        assert_eq!(cmd.trigger_position(), 0x7_FFFF);
    }

    #[test]
    fn trigger_and_samplerate_fields_do_not_clobber() {
        let mut cmd = SetTriggerAndSamplerate::new();
        cmd.set_samplerate_id(3);
        cmd.set_trigger_source(2);
        cmd.set_record_length(1);
        assert_eq!(cmd.samplerate_id(), 3);
        assert_eq!(cmd.trigger_source(), 2);
        assert_eq!(cmd.record_length(), 1);
        cmd.set_record_length(0);
        assert_eq!(cmd.samplerate_id(), 3);
        assert_eq!(cmd.trigger_source(), 2);
    }

    #[test]
    fn gain_packs_two_bits_per_channel() {
        let mut cmd = SetGain::new();
        cmd.set_gain(0, 1);
        cmd.set_gain(1, 3);
        assert_eq!(cmd.bytes()[0], 0x07);
        assert_eq!(cmd.bytes()[2], 0x01 | 0x03 << 2);
        assert_eq!(cmd.gain(0), 1);
        assert_eq!(cmd.gain(1), 3);
    }

    #[test]
    fn samplerate_5200_layout() {
        let mut cmd = SetSamplerate5200::new();
        cmd.set_samplerate_slow(0xFFFE);
        cmd.set_samplerate_fast(1);
        assert_eq!(cmd.bytes(), &[0x0C, 0x00, 0xFE, 0xFF, 0x01, 0x00]);
    }

    #[test]
    fn samplerate_2250_layout() {
        let mut cmd = SetSamplerate2250::new();
        cmd.set_downsampling(true);
        cmd.set_fast_rate(true);
        cmd.set_samplerate(0xFFCF);
        assert_eq!(cmd.bytes(), &[0x0E, 0x00, 0x03, 0x00, 0xCF, 0xFF, 0x00, 0x00]);
    }

    #[test]
    fn buffer_5200_keeps_fixed_markers() {
        let mut cmd = SetBuffer5200::new();
        cmd.set_trigger_position_pre(0xD7FF);
        cmd.set_trigger_position_post(0xFFFE);
        cmd.set_used_pre(DTRIGGERPOSITION_ON);
        cmd.set_used_post(DTRIGGERPOSITION_ON);
        cmd.set_record_length(1);
        let bytes = cmd.bytes();
        assert_eq!(bytes[0], 0x0D);
        assert_eq!(&bytes[2..4], &[0xFF, 0xD7]);
        assert_eq!(bytes[4], DTRIGGERPOSITION_ON);
        assert_eq!(bytes[5], 0xFF);
        assert_eq!(&bytes[6..8], &[0xFE, 0xFF]);
        assert_eq!(bytes[8], 0x01 | DTRIGGERPOSITION_ON << 3);
        assert_eq!(bytes[9], 0xFF);
    }

    #[test]
    fn buffer_2250_19_bit_positions() {
        let mut cmd = SetBuffer2250::new();
        cmd.set_trigger_position_pre(0x7_D800);
        cmd.set_trigger_position_post(0x7_FFFF);
        assert_eq!(cmd.trigger_position_pre(), 0x7_D800);
        assert_eq!(cmd.trigger_position_post(), 0x7_FFFF);
        let bytes = cmd.bytes();
        assert_eq!(bytes[0], 0x0F);
        assert_eq!(&bytes[2..5], &[0xFF, 0xFF, 0x07]);
        assert_eq!(&bytes[6..9], &[0x00, 0xD8, 0x07]);
    }

    #[test]
    fn offset_words_are_big_endian() {
        let mut cmd = SetOffset::new();
        cmd.set_channel(0, 0x8000);
        cmd.set_channel(1, 0x1234);
        cmd.set_trigger(0x00FD);
        let bytes = cmd.bytes();
        assert_eq!(&bytes[0..2], &[0x80, 0x00]);
        assert_eq!(&bytes[2..4], &[0x12, 0x34]);
        assert_eq!(&bytes[4..6], &[0x00, 0xFD]);
        assert_eq!(cmd.channel(0), 0x8000);
        assert_eq!(cmd.channel(1), 0x1234);
        assert_eq!(cmd.trigger(), 0x00FD);
    }

    #[test]
    fn relays_invert_when_released() {
        let mut cmd = SetRelays::new();
        // Defaults: DC coupling engaged, attenuation relays released.
        assert!(cmd.coupling(0));
        assert!(cmd.coupling(1));
        assert!(!cmd.below_1v(0));
        assert!(!cmd.below_100mv(1));
        assert!(!cmd.trigger());

        cmd.set_below_1v(0, true);
        assert_eq!(cmd.bytes()[1], 0x04);
        cmd.set_below_1v(0, false);
        assert_eq!(cmd.bytes()[1], !0x04);

        cmd.set_coupling(1, false);
        assert_eq!(cmd.bytes()[6], !0x10);
        cmd.set_trigger(true);
        assert_eq!(cmd.bytes()[7], 0x01);
    }

    #[test]
    fn begin_command_prefix() {
        let cmd = BeginCommand::new();
        assert_eq!(cmd.bytes().len(), 10);
        assert_eq!(cmd.bytes()[0], 0x0F);
        assert_eq!(cmd.bytes()[1], 0x03);
        assert!(cmd.bytes()[2..].iter().all(|&b| b == 0));
    }

    #[test]
    fn capture_state_response_parses() {
        let mut data = vec![0u8; CAPTURE_STATE_RESPONSE_LEN];
        data[0] = 2;
        data[2] = 0x34;
        data[3] = 0x12;
        let response = CaptureStateResponse::parse(&data).unwrap();
        assert_eq!(response.state_code, 2);
        assert_eq!(response.raw_trigger_point, 0x1234);
        assert!(CaptureStateResponse::parse(&[0, 0]).is_none());
    }

    #[test]
    fn bulk_command_accessors() {
        let mut cmd = BulkCommand::SetGain(SetGain::new());
        assert!(cmd.as_set_gain().is_some());
        assert!(cmd.as_set_filter().is_none());
        cmd.as_set_gain().unwrap().set_gain(0, 2);
        assert_eq!(cmd.bytes()[2], 0x02);
    }
}
