//! nusb-backed transport implementation and device discovery.
//!
//! One claimed interface, two bulk endpoints, vendor control requests
//! on the device handle. Sample reads are split into packet-sized
//! chunks with a short per-packet timeout; a short packet ends the
//! transfer early, which is normal in roll mode.

use std::sync::Mutex;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use nusb::MaybeFuture;
use nusb::transfer::{Bulk, ControlIn, ControlOut, ControlType, In, Out, Recipient};
use serde::Serialize;

use crate::models::{self, DeviceModel};
use crate::transport::{
    DsoTransport, MULTI_PACKET_TIMEOUT, Result, TRANSFER_TIMEOUT, TransportError,
};

/// A discovered, not yet opened oscilloscope.
#[derive(Debug, Clone, Serialize)]
pub struct DiscoveredDevice {
    pub model: &'static str,
    pub vendor_id: u16,
    pub product_id: u16,
    pub serial: Option<String>,
    /// The device needs a firmware upload and renumeration before it
    /// speaks the scope protocol.
    pub needs_firmware: bool,
}

/// List all attached devices matching the model table.
pub fn enumerate_devices() -> Vec<DiscoveredDevice> {
    let Ok(devices) = nusb::list_devices().wait() else {
        return Vec::new();
    };
    devices
        .filter_map(|info| {
            let model = models::model_for(info.vendor_id(), info.product_id())?;
            Some(DiscoveredDevice {
                model: model.name,
                vendor_id: model.vendor_id,
                product_id: model.product_id,
                serial: info.serial_number().map(str::to_string),
                needs_firmware: model.needs_firmware,
            })
        })
        .collect()
}

/// Open the first attached device from the model table.
pub fn open_first() -> Result<(UsbTransport, &'static DeviceModel)> {
    let devices = nusb::list_devices()
        .wait()
        .map_err(|err| TransportError::Other(err.to_string()))?;
    for info in devices {
        if let Some(model) = models::model_for(info.vendor_id(), info.product_id()) {
            let transport = UsbTransport::open(&info, model)?;
            return Ok((transport, model));
        }
    }
    Err(TransportError::NoDevice)
}

/// Blocking transport over a claimed nusb interface.
pub struct UsbTransport {
    device: nusb::Device,
    _interface: nusb::Interface,
    ep_out: Mutex<nusb::Endpoint<Bulk, Out>>,
    ep_in: Mutex<nusb::Endpoint<Bulk, In>>,
    packet_size: usize,
    unique_id: u32,
    connected: AtomicBool,
}

fn map_open_error(err: impl std::fmt::Display) -> TransportError {
    let message = err.to_string();
    let lowered = message.to_lowercase();
    if lowered.contains("permission") || lowered.contains("access") {
        TransportError::Access
    } else {
        TransportError::Other(message)
    }
}

fn map_transfer_error(err: nusb::transfer::TransferError) -> TransportError {
    use nusb::transfer::TransferError;
    match err {
        TransferError::Disconnected => TransportError::NoDevice,
        TransferError::Stall => TransportError::Pipe,
        TransferError::Cancelled => TransportError::Interrupted,
        other => TransportError::Other(other.to_string()),
    }
}

impl UsbTransport {
    /// Open the device and claim the scope interface with the model's
    /// bulk endpoints.
    pub fn open(info: &nusb::DeviceInfo, model: &'static DeviceModel) -> Result<UsbTransport> {
        let device = info.open().wait().map_err(map_open_error)?;
        let interface = device.claim_interface(0).wait().map_err(map_open_error)?;
        let ep_out = interface
            .endpoint::<Bulk, Out>(model.bulk_endpoint_out)
            .map_err(map_open_error)?;
        let ep_in = interface
            .endpoint::<Bulk, In>(model.bulk_endpoint_in)
            .map_err(map_open_error)?;

        let packet_size = match info.speed() {
            Some(nusb::Speed::Low) | Some(nusb::Speed::Full) => 64,
            _ => 512,
        };
        let unique_id = (model.product_id as u32) << 8 | info.device_address() as u32;

        log::debug!(
            "opened {} at address {} (packet size {packet_size})",
            model.name,
            info.device_address()
        );

        Ok(UsbTransport {
            device,
            _interface: interface,
            ep_out: Mutex::new(ep_out),
            ep_in: Mutex::new(ep_in),
            packet_size,
            unique_id,
            connected: AtomicBool::new(true),
        })
    }

    fn check_connected(&self) -> Result<()> {
        if self.connected.load(Ordering::SeqCst) {
            Ok(())
        } else {
            Err(TransportError::NoDevice)
        }
    }

    fn fail(&self, err: TransportError) -> TransportError {
        if err.is_fatal() {
            self.connected.store(false, Ordering::SeqCst);
        }
        err
    }
}

macro_rules! drain {
    ($endpoint:expr) => {{
        $endpoint.cancel_all();
        while $endpoint
            .wait_next_complete(Duration::from_millis(10))
            .is_some()
        {}
    }};
}

impl DsoTransport for UsbTransport {
    fn bulk_write(&self, data: &[u8]) -> Result<usize> {
        self.check_connected()?;
        let mut endpoint = self.ep_out.lock().unwrap();
        let mut buffer = endpoint.allocate(data.len());
        buffer.extend_from_slice(data);
        endpoint.submit(buffer);
        match endpoint.wait_next_complete(TRANSFER_TIMEOUT) {
            Some(completion) => {
                completion
                    .status
                    .map_err(|err| self.fail(map_transfer_error(err)))?;
                Ok(data.len())
            }
            None => {
                drain!(endpoint);
                Err(TransportError::Timeout)
            }
        }
    }

    fn bulk_read(&self, buf: &mut [u8]) -> Result<usize> {
        self.check_connected()?;
        let mut endpoint = self.ep_in.lock().unwrap();
        let mut buffer = endpoint.allocate(buf.len());
        buffer.set_requested_len(buf.len());
        endpoint.submit(buffer);
        match endpoint.wait_next_complete(TRANSFER_TIMEOUT) {
            Some(completion) => {
                completion
                    .status
                    .map_err(|err| self.fail(map_transfer_error(err)))?;
                let read = completion.buffer.len().min(buf.len());
                buf[..read].copy_from_slice(&completion.buffer[..read]);
                Ok(read)
            }
            None => {
                drain!(endpoint);
                Err(TransportError::Timeout)
            }
        }
    }

    fn bulk_read_multi(&self, buf: &mut [u8]) -> Result<usize> {
        self.check_connected()?;
        let mut endpoint = self.ep_in.lock().unwrap();
        let mut total = 0;
        while total < buf.len() {
            let chunk = (buf.len() - total).min(self.packet_size);
            let mut buffer = endpoint.allocate(chunk);
            buffer.set_requested_len(chunk);
            endpoint.submit(buffer);
            match endpoint.wait_next_complete(MULTI_PACKET_TIMEOUT) {
                Some(completion) => {
                    if let Err(err) = completion.status {
                        let mapped = self.fail(map_transfer_error(err));
                        if mapped.is_fatal() {
                            return Err(mapped);
                        }
                        break;
                    }
                    let read = completion.buffer.len().min(buf.len() - total);
                    buf[total..total + read].copy_from_slice(&completion.buffer[..read]);
                    total += read;
                    // A short packet ends the transfer.
                    if read < chunk {
                        break;
                    }
                }
                None => {
                    drain!(endpoint);
                    break;
                }
            }
        }
        Ok(total)
    }

    fn control_write(&self, request: u8, data: &[u8], value: u16, index: u16) -> Result<()> {
        self.check_connected()?;
        self.device
            .control_out(
                ControlOut {
                    control_type: ControlType::Vendor,
                    recipient: Recipient::Device,
                    request,
                    value,
                    index,
                    data,
                },
                TRANSFER_TIMEOUT,
            )
            .wait()
            .map_err(|err| self.fail(map_transfer_error(err)))
    }

    fn control_read(&self, request: u8, buf: &mut [u8], value: u16, index: u16) -> Result<usize> {
        self.check_connected()?;
        let data = self
            .device
            .control_in(
                ControlIn {
                    control_type: ControlType::Vendor,
                    recipient: Recipient::Device,
                    request,
                    value,
                    index,
                    length: buf.len() as u16,
                },
                TRANSFER_TIMEOUT,
            )
            .wait()
            .map_err(|err| self.fail(map_transfer_error(err)))?;
        let read = data.len().min(buf.len());
        buf[..read].copy_from_slice(&data[..read]);
        Ok(read)
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
        self.unique_id
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn enumeration_survives_missing_usb_stack() {
        // On hosts without USB access this must come back empty rather
        // than fail.
        let _ = enumerate_devices();
    }

    #[test]
    fn discovered_device_serializes() {
        let device = DiscoveredDevice {
            model: "DSO-2090",
            vendor_id: 0x04B5,
            product_id: 0x2090,
            serial: Some("0001".into()),
            needs_firmware: false,
        };
        let json = serde_json::to_string(&device).expect("serialize DiscoveredDevice");
        assert!(json.contains("\"model\":\"DSO-2090\""));
        assert!(json.contains("\"product_id\":8336"));
        assert!(json.contains("\"needs_firmware\":false"));
    }

    #[test]
    fn open_error_classification() {
        assert_eq!(
            map_open_error("Permission denied (insufficient permissions)"),
            TransportError::Access
        );
        assert!(matches!(
            map_open_error("no such device"),
            TransportError::Other(_)
        ));
    }
}
