//! Protocol constants shared by the DSO-2xxx/5xxx command set.
//!
//! Bulk opcodes double as indices into the bulk command queue. Several
//! opcodes are overloaded per model family (0x0C..0x0E carry different
//! messages on the DSO-2250 and DSO-5200); [`crate::catalog`] resolves
//! which concrete message a model uses for each abstract operation.

/// Bulk message opcodes. The value is both the first payload byte and the
/// command's slot in the bulk queue.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum BulkCode {
    /// Channel/trigger filter bits (DSO-2090/2150/5200).
    SetFilter = 0x00,
    /// Combined trigger and timebase setup (DSO-2090/2150).
    SetTriggerAndSamplerate = 0x01,
    /// Force a trigger event.
    ForceTrigger = 0x02,
    /// Start capturing.
    CaptureStart = 0x03,
    /// Arm the trigger.
    TriggerEnabled = 0x04,
    /// Request sample data.
    GetData = 0x05,
    /// Request the capture state and trigger point.
    GetCaptureState = 0x06,
    /// Per-channel gain code.
    SetGain = 0x07,
    /// Logical data out (unused by the official software).
    SetLogicalData = 0x08,
    /// Logical data in (unused by the official software).
    GetLogicalData = 0x09,
    /// Active channel selection (DSO-2250).
    BSetChannels = 0x0B,
    /// SetTrigger on the DSO-2250, SetSamplerate on the DSO-5200.
    CSetTriggerOrSamplerate = 0x0C,
    /// SetRecordLength on the DSO-2250, SetBuffer on the DSO-5200.
    DSetBuffer = 0x0D,
    /// SetSamplerate on the DSO-2250, SetTrigger on the DSO-5200.
    ESetTriggerOrSamplerate = 0x0E,
    /// SetBuffer on the DSO-2250.
    FSetBuffer = 0x0F,
}

/// Number of bulk queue slots (opcodes 0x00..=0x0F).
pub const BULK_COUNT: usize = 16;

impl BulkCode {
    /// The queue slot index for this opcode.
    pub fn index(self) -> usize {
        self as usize
    }
}

// ── Control request codes ──

/// Calibration and other value reads; sub-selector in `wValue`.
pub const CONTROL_VALUE: u8 = 0xA2;
/// Transaction prefix written before every bulk command.
pub const CONTROL_BEGINCOMMAND: u8 = 0xB3;
/// Channel offset and trigger level DACs.
pub const CONTROL_SETOFFSET: u8 = 0xB4;
/// Coupling, attenuation and external-trigger relays.
pub const CONTROL_SETRELAYS: u8 = 0xB5;

/// `CONTROL_VALUE` sub-selector for the offset calibration block.
pub const VALUE_OFFSETLIMITS: u8 = 0x08;

// ── Firmware upload (DSO-6022 family) ──

/// Vendor request carrying one firmware record.
pub const FIRMWARE_REQUEST: u8 = 0xA0;
/// `wIndex` for firmware record writes.
pub const FIRMWARE_INDEX: u16 = 0x00;

// ── Channel enable field values ──

/// Only channel 1 sampled.
pub const USED_CH1: u8 = 0x00;
/// Only channel 2 sampled.
pub const USED_CH2: u8 = 0x01;
/// Both channels sampled.
pub const USED_CH1CH2: u8 = 0x02;
/// Only channel 2 sampled, DSO-2250 encoding.
pub const BUSED_CH2: u8 = 0x03;

/// Status message code emitted when the product id is not recognized.
pub const STATUS_UNKNOWN_MODEL: i32 = 10000;

/// Capture states returned in the first byte of the GetCaptureState
/// response. The ready code differs per model family.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CaptureState {
    /// Waiting for a trigger event.
    Waiting,
    /// Sampling data after triggering.
    Sampling,
    /// Sample data available (DSO-2090/2150).
    Ready,
    /// Sample data available (DSO-2250).
    Ready2250,
    /// Sample data available (DSO-5200/5200A).
    Ready5200,
}

impl CaptureState {
    /// Decode the state byte. Unknown codes yield `None` and are ignored
    /// by the acquisition loop.
    pub fn from_code(code: u8) -> Option<CaptureState> {
        match code {
            0 => Some(CaptureState::Waiting),
            1 => Some(CaptureState::Sampling),
            2 => Some(CaptureState::Ready),
            3 => Some(CaptureState::Ready2250),
            7 => Some(CaptureState::Ready5200),
            _ => None,
        }
    }

    /// Whether sample data can be read in this state.
    pub fn is_ready(self) -> bool {
        matches!(
            self,
            CaptureState::Ready | CaptureState::Ready2250 | CaptureState::Ready5200
        )
    }
}

/// Decode the trigger point from the GetCaptureState response.
///
/// Each set bit inverts all bits of lower value; folding from the lowest
/// bit up reverses the device's encoding and yields the sample offset of
/// the trigger inside the returned buffer.
pub fn decode_trigger_point(value: u32) -> u32 {
    let mut result = value;
    let mut bit: u32 = 1;
    while bit != 0 {
        if result & bit != 0 {
            result ^= bit - 1;
        }
        bit <<= 1;
    }
    result
}

/// Inverse of [`decode_trigger_point`], used to build device-side test
/// fixtures.
pub fn encode_trigger_point(value: u32) -> u32 {
    value ^ (value >> 1)
}
