//! Transport contract between the acquisition engine and the USB layer.
//!
//! The engine only needs blocking bulk/control transfers and a packet
//! size; everything else (enumeration, claiming, endpoint bookkeeping)
//! stays in the concrete implementation. [`mock::MockTransport`] is a
//! scriptable in-memory implementation used by the tests.

use std::fmt;
use std::time::Duration;

/// Timeout for a single USB transfer.
pub const TRANSFER_TIMEOUT: Duration = Duration::from_millis(500);

/// Timeout per packet during multi-packet sample reads.
pub const MULTI_PACKET_TIMEOUT: Duration = Duration::from_millis(10);

/// Transport failure classes.
///
/// Only [`TransportError::NoDevice`] is terminal; everything else is
/// logged and the triggering command retried on the next loop pass.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TransportError {
    /// The device is gone. Callers must abort and disconnect.
    NoDevice,
    Timeout,
    /// Endpoint stalled.
    Pipe,
    Overflow,
    Interrupted,
    Busy,
    /// Operating-system permission denied.
    Access,
    Other(String),
}

impl TransportError {
    /// Terminal errors end the acquisition loop.
    pub fn is_fatal(&self) -> bool {
        matches!(self, TransportError::NoDevice)
    }

    /// Short name for log messages.
    pub fn name(&self) -> &'static str {
        match self {
            TransportError::NoDevice => "NO_DEVICE",
            TransportError::Timeout => "TIMEOUT",
            TransportError::Pipe => "PIPE",
            TransportError::Overflow => "OVERFLOW",
            TransportError::Interrupted => "INTERRUPTED",
            TransportError::Busy => "BUSY",
            TransportError::Access => "ACCESS",
            TransportError::Other(_) => "OTHER",
        }
    }

    /// Numeric code for status-message callbacks, following the usual
    /// libusb numbering.
    pub fn code(&self) -> i32 {
        match self {
            TransportError::Access => -3,
            TransportError::NoDevice => -4,
            TransportError::Busy => -6,
            TransportError::Timeout => -7,
            TransportError::Overflow => -8,
            TransportError::Pipe => -9,
            TransportError::Interrupted => -10,
            TransportError::Other(_) => -99,
        }
    }
}

impl fmt::Display for TransportError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TransportError::Other(e) => write!(f, "transport error: {e}"),
            other => write!(f, "transport error: {}", other.name()),
        }
    }
}

impl std::error::Error for TransportError {}

pub type Result<T> = std::result::Result<T, TransportError>;

/// Blocking byte transport to the oscilloscope.
///
/// All methods take `&self`; implementations serialize endpoint access
/// internally. The acquisition thread is the only caller of the bulk
/// methods; `control_read` is additionally used once at connect time for
/// the calibration block.
pub trait DsoTransport: Send + Sync {
    /// Write one bulk command frame to the OUT endpoint.
    fn bulk_write(&self, data: &[u8]) -> Result<usize>;

    /// Read a single response from the IN endpoint.
    fn bulk_read(&self, buf: &mut [u8]) -> Result<usize>;

    /// Read sample data split over multiple packets. Returns the bytes
    /// actually read, which may be fewer than requested (the device
    /// returns as much as it has in roll mode).
    fn bulk_read_multi(&self, buf: &mut [u8]) -> Result<usize>;

    /// Vendor control write.
    fn control_write(&self, request: u8, data: &[u8], value: u16, index: u16) -> Result<()>;

    /// Vendor control read.
    fn control_read(&self, request: u8, buf: &mut [u8], value: u16, index: u16) -> Result<usize>;

    /// Communication packet size in bytes, 64 on full-speed USB and 512
    /// on high-speed. Determines roll-mode chunking.
    fn packet_size(&self) -> usize;

    fn is_connected(&self) -> bool;

    /// Fail ongoing and future transfers. Idempotent.
    fn shutdown(&self);

    /// Stable identifier (bus/address) used to recognize an already
    /// connected device across hotplug events.
    fn unique_id(&self) -> u32;
}

impl<T: DsoTransport + ?Sized> DsoTransport for std::sync::Arc<T> {
    fn bulk_write(&self, data: &[u8]) -> Result<usize> {
        (**self).bulk_write(data)
    }

    fn bulk_read(&self, buf: &mut [u8]) -> Result<usize> {
        (**self).bulk_read(buf)
    }

    fn bulk_read_multi(&self, buf: &mut [u8]) -> Result<usize> {
        (**self).bulk_read_multi(buf)
    }

    fn control_write(&self, request: u8, data: &[u8], value: u16, index: u16) -> Result<()> {
        (**self).control_write(request, data, value, index)
    }

    fn control_read(&self, request: u8, buf: &mut [u8], value: u16, index: u16) -> Result<usize> {
        (**self).control_read(request, buf, value, index)
    }

    fn packet_size(&self) -> usize {
        (**self).packet_size()
    }

    fn is_connected(&self) -> bool {
        (**self).is_connected()
    }

    fn shutdown(&self) {
        (**self).shutdown()
    }

    fn unique_id(&self) -> u32 {
        (**self).unique_id()
    }
}

pub mod mock {
    //! In-memory transport for unit and integration tests.

    use super::{DsoTransport, Result, TransportError};
    use std::collections::VecDeque;
    use std::sync::Mutex;
    use std::sync::atomic::{AtomicBool, Ordering};

    /// Scriptable mock transport. Writes are recorded; reads pop
    /// pre-queued responses. When the read script runs dry the
    /// configured exhaustion error is returned, which tests set to
    /// `NoDevice` to wind down the acquisition loop deterministically.
    pub struct MockTransport {
        pub bulk_writes: Mutex<Vec<Vec<u8>>>,
        pub control_writes: Mutex<Vec<(u8, u16, u16, Vec<u8>)>>,
        bulk_responses: Mutex<VecDeque<Vec<u8>>>,
        control_responses: Mutex<VecDeque<Vec<u8>>>,
        exhausted_error: Mutex<TransportError>,
        packet_size: usize,
        connected: AtomicBool,
    }

    impl MockTransport {
        pub fn new(packet_size: usize) -> Self {
            MockTransport {
                bulk_writes: Mutex::new(Vec::new()),
                control_writes: Mutex::new(Vec::new()),
                bulk_responses: Mutex::new(VecDeque::new()),
                control_responses: Mutex::new(VecDeque::new()),
                exhausted_error: Mutex::new(TransportError::Timeout),
                packet_size,
                connected: AtomicBool::new(true),
            }
        }

        /// Queue a response for the next bulk read (single or multi).
        pub fn push_bulk_response(&self, data: Vec<u8>) {
            self.bulk_responses.lock().unwrap().push_back(data);
        }

        /// Queue a response for the next control read.
        pub fn push_control_response(&self, data: Vec<u8>) {
            self.control_responses.lock().unwrap().push_back(data);
        }

        /// Error returned once the read scripts are exhausted.
        pub fn set_exhausted_error(&self, error: TransportError) {
            *self.exhausted_error.lock().unwrap() = error;
        }

        /// Opcodes of all recorded bulk writes, in order.
        pub fn bulk_opcodes(&self) -> Vec<u8> {
            self.bulk_writes
                .lock()
                .unwrap()
                .iter()
                .map(|w| w[0])
                .collect()
        }

        fn check_connected(&self) -> Result<()> {
            if self.connected.load(Ordering::SeqCst) {
                Ok(())
            } else {
                Err(TransportError::NoDevice)
            }
        }

        fn pop_bulk(&self, buf: &mut [u8]) -> Result<usize> {
            match self.bulk_responses.lock().unwrap().pop_front() {
                Some(data) => {
                    let len = data.len().min(buf.len());
                    buf[..len].copy_from_slice(&data[..len]);
                    Ok(len)
                }
                None => Err(self.exhausted_error.lock().unwrap().clone()),
            }
        }
    }

    impl DsoTransport for MockTransport {
        fn bulk_write(&self, data: &[u8]) -> Result<usize> {
            self.check_connected()?;
            self.bulk_writes.lock().unwrap().push(data.to_vec());
            Ok(data.len())
        }

        fn bulk_read(&self, buf: &mut [u8]) -> Result<usize> {
            self.check_connected()?;
            self.pop_bulk(buf)
        }

        fn bulk_read_multi(&self, buf: &mut [u8]) -> Result<usize> {
            self.check_connected()?;
            self.pop_bulk(buf)
        }

        fn control_write(&self, request: u8, data: &[u8], value: u16, index: u16) -> Result<()> {
            self.check_connected()?;
            self.control_writes
                .lock()
                .unwrap()
                .push((request, value, index, data.to_vec()));
            Ok(())
        }

        fn control_read(&self, _request: u8, buf: &mut [u8], _value: u16, _index: u16) -> Result<usize> {
            self.check_connected()?;
            match self.control_responses.lock().unwrap().pop_front() {
                Some(data) => {
                    let len = data.len().min(buf.len());
                    buf[..len].copy_from_slice(&data[..len]);
                    Ok(len)
                }
                None => Err(self.exhausted_error.lock().unwrap().clone()),
            }
        }

        fn packet_size(&self) -> usize {
            self.packet_size
        }

        fn is_connected(&self) -> bool {
            self.connected.load(Ordering::SeqCst)
        }

        fn shutdown(&self) {
            self.connected.store(false, Ordering::SeqCst);
        }

        fn unique_id(&self) -> u32 {
            0
        }
    }
}
