//! Integration tests: full capture cycles against the mock transport.
//!
//! These drive a connected device through the public API, letting the
//! real acquisition thread issue commands, and assert on the recorded
//! wire traffic plus the emitted sample data.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, mpsc};
use std::thread::sleep;
use std::time::{Duration, Instant};

use hantekdso::device::Device;
use hantekdso::models::{self, DeviceModel};
use hantekdso::settings::TriggerMode;
use hantekdso::transport::{DsoTransport, TransportError};
use hantekdso::transport::mock::MockTransport;

const BULK_FORCE_TRIGGER: u8 = 0x02;
const BULK_CAPTURE_START: u8 = 0x03;
const BULK_ENABLE_TRIGGER: u8 = 0x04;
const BULK_GET_DATA: u8 = 0x05;

/// Calibration block: 0x2000..0xE000 for every channel and gain step.
fn calibration_block() -> Vec<u8> {
    let mut block = Vec::with_capacity(72);
    for _ in 0..18 {
        block.extend_from_slice(&[0x20, 0x00, 0xE0, 0x00]);
    }
    block
}

fn connected_2090(packet_size: usize) -> (Arc<MockTransport>, Device<Arc<MockTransport>>) {
    let transport = Arc::new(MockTransport::new(packet_size));
    transport.push_control_response(calibration_block());
    let device = Device::new(Arc::clone(&transport), models::model_for_product(0x2090).unwrap());
    device.connect().expect("connect");
    (transport, device)
}

/// The state-machine commands among the recorded bulk writes, dropping
/// configuration messages and capture-state polls.
fn cycle_opcodes(transport: &MockTransport) -> Vec<u8> {
    transport
        .bulk_opcodes()
        .into_iter()
        .filter(|op| {
            [
                BULK_FORCE_TRIGGER,
                BULK_CAPTURE_START,
                BULK_ENABLE_TRIGGER,
                BULK_GET_DATA,
            ]
            .contains(op)
        })
        .collect()
}

#[test]
fn connect_reports_initial_configuration() {
    let transport = Arc::new(MockTransport::new(512));
    transport.push_control_response(calibration_block());
    let device = Device::new(Arc::clone(&transport), models::model_for_product(0x2090).unwrap());

    let samplerate = Arc::new(Mutex::new(0.0f64));
    let samplerate_sink = Arc::clone(&samplerate);
    device.events().on_samplerate_changed(move |rate| {
        *samplerate_sink.lock().unwrap() = rate;
    });
    let lengths = Arc::new(Mutex::new((Vec::new(), 0usize)));
    let lengths_sink = Arc::clone(&lengths);
    device.events().on_record_length_changed(move |all, id| {
        *lengths_sink.lock().unwrap() = (all.to_vec(), id);
    });
    let connected = Arc::new(AtomicBool::new(false));
    let connected_sink = Arc::clone(&connected);
    device.events().on_connected(move || {
        connected_sink.store(true, Ordering::SeqCst);
    });

    device.connect().expect("connect");
    assert!(device.is_connected());
    assert!(connected.load(Ordering::SeqCst));
    assert_eq!(*samplerate.lock().unwrap(), 50e6);
    assert_eq!(device.current_samplerate(), 50e6);
    let (all, id) = lengths.lock().unwrap().clone();
    assert_eq!(id, 1);
    assert_eq!(all, vec![u32::MAX, 10240, 32768]);
    assert_eq!(device.min_samplerate(), 50e6 / 131072.0);

    device.disconnect();
    assert!(!device.is_connected());
}

#[test]
fn roll_mode_cycles_through_the_command_sequence() {
    let (transport, device) = connected_2090(64);
    device.set_channel_used(0, true).unwrap();
    device.set_channel_used(1, true).unwrap();
    // Tier 0 is the roll sentinel; the ladder is divided by 1000.
    device.set_record_length(0).unwrap();
    assert_eq!(device.current_samplerate(), 50e3);

    let (sample_sender, sample_receiver) = mpsc::channel();
    device.events().on_samples_available(move |samples, rate, append| {
        let data = samples.lock().unwrap().clone();
        let _ = sample_sender.send((data, rate, append));
    });

    device.start_sampling();
    // Script the sample data only once the roll cycle has demonstrably
    // begun, so no earlier poll can swallow it.
    let deadline = Instant::now() + Duration::from_secs(10);
    while !transport.bulk_opcodes().contains(&BULK_CAPTURE_START) {
        assert!(Instant::now() < deadline, "roll cycle never started");
        sleep(Duration::from_millis(5));
    }
    transport.push_bulk_response(vec![0x80; 64]);

    let (data, rate, append) = sample_receiver
        .recv_timeout(Duration::from_secs(10))
        .expect("roll packet");
    assert!(append, "roll mode data is appended");
    assert_eq!(rate, 50e3);
    // 64 interleaved bytes, 32 per channel.
    assert_eq!(data[0].len(), 32);
    assert_eq!(data[1].len(), 32);

    device.disconnect();

    let cycle = cycle_opcodes(&transport);
    assert!(
        cycle.windows(4).any(|window| {
            window
                == [
                    BULK_CAPTURE_START,
                    BULK_ENABLE_TRIGGER,
                    BULK_FORCE_TRIGGER,
                    BULK_GET_DATA,
                ]
        }),
        "roll cycle not found in {cycle:02x?}"
    );
}

#[test]
fn standard_mode_reads_on_ready() {
    let (transport, device) = connected_2090(512);
    device.set_channel_used(0, true).unwrap();
    device.set_channel_used(1, true).unwrap();
    device.set_samplerate(50e6).unwrap();

    let (sample_sender, sample_receiver) = mpsc::channel();
    device.events().on_samples_available(move |samples, rate, append| {
        let data = samples.lock().unwrap().clone();
        let _ = sample_sender.send((data, rate, append));
    });

    // While the read script is empty the poll times out harmlessly, so
    // the states queued after sampling starts are consumed in order:
    // two WAITING polls (capture start, trigger arm), then READY.
    device.start_sampling();
    let waiting = vec![0u8; 512];
    transport.push_bulk_response(waiting.clone());
    transport.push_bulk_response(waiting);
    let mut ready = vec![0u8; 512];
    ready[0] = 2;
    transport.push_bulk_response(ready);
    transport.push_bulk_response(vec![0x40; 20480]);

    let (data, rate, append) = sample_receiver
        .recv_timeout(Duration::from_secs(10))
        .expect("triggered capture");
    assert!(!append);
    assert_eq!(rate, 50e6);
    assert_eq!(data[0].len(), 10240);
    assert_eq!(data[1].len(), 10240);

    device.disconnect();

    // Capture start precedes the trigger arm, which precedes the read;
    // a re-arm may follow since sampling is still running.
    let cycle = cycle_opcodes(&transport);
    assert!(
        cycle.starts_with(&[BULK_CAPTURE_START, BULK_ENABLE_TRIGGER, BULK_GET_DATA]),
        "unexpected command order {cycle:02x?}"
    );
}

#[test]
fn single_trigger_stops_after_one_capture() {
    let (transport, device) = connected_2090(512);
    device.set_channel_used(0, true).unwrap();
    device.set_channel_used(1, true).unwrap();
    device.set_samplerate(50e6).unwrap();
    device.set_trigger_mode(TriggerMode::Single).unwrap();

    let (stop_sender, stop_receiver) = mpsc::channel();
    device.events().on_sampling_stopped(move || {
        let _ = stop_sender.send(());
    });

    device.start_sampling();
    let waiting = vec![0u8; 512];
    transport.push_bulk_response(waiting);
    let mut ready = vec![0u8; 512];
    ready[0] = 2;
    transport.push_bulk_response(ready);
    transport.push_bulk_response(vec![0x40; 20480]);

    stop_receiver
        .recv_timeout(Duration::from_secs(10))
        .expect("single capture should stop sampling");
    assert!(!device.is_sampling());

    // Let the loop run on; it must not re-arm.
    sleep(Duration::from_millis(300));
    let starts = cycle_opcodes(&transport)
        .iter()
        .filter(|&&op| op == BULK_CAPTURE_START)
        .count();
    assert_eq!(starts, 1, "capture restarted despite single-trigger mode");

    device.disconnect();
}

#[test]
fn lost_device_ends_the_loop_and_disconnects() {
    let (transport, device) = connected_2090(512);

    let (status_sender, status_receiver) = mpsc::channel();
    device.events().on_status_message(move |code, _timeout| {
        let _ = status_sender.send(code);
    });
    let (gone_sender, gone_receiver) = mpsc::channel();
    device.events().on_disconnected(move || {
        let _ = gone_sender.send(());
    });

    transport.set_exhausted_error(TransportError::NoDevice);

    let code = status_receiver
        .recv_timeout(Duration::from_secs(10))
        .expect("status message on device loss");
    assert_eq!(code, -4);
    gone_receiver
        .recv_timeout(Duration::from_secs(10))
        .expect("disconnected event");
    assert!(!device.is_connected());

    // Idempotent user-side disconnect afterwards.
    device.disconnect();
}

#[test]
fn setters_resolve_against_calibration() {
    let (_transport, device) = connected_2090(512);

    // The 8-bit ladder: 1.6 V/screenheight is the fifth step.
    assert_eq!(device.set_gain(0, 1.6).unwrap(), 1.6);
    // Calibration 0x2000..0xE000 quantizes mid-scale exactly.
    let applied = device.set_offset(0, 0.5).unwrap();
    assert_eq!(applied, 0.5);
    // Quantization is a fixpoint.
    assert_eq!(device.set_offset(0, applied).unwrap(), applied);

    let position = device.set_pretrigger_position(1e-4).unwrap();
    assert_eq!(position, 1e-4);

    device.set_trigger_source(false, 0).unwrap();
    let level = device.set_trigger_level(0, 0.1).unwrap();
    assert!((level - 0.1).abs() < 0.02);

    device.disconnect();
}

#[test]
fn parameter_errors_reject_without_mutation() {
    let (_transport, device) = connected_2090(512);

    assert_eq!(device.set_samplerate(0.0), Err(hantekdso::ErrorCode::Parameter));
    assert_eq!(device.set_record_length(7), Err(hantekdso::ErrorCode::Parameter));
    assert_eq!(device.set_gain(5, 1.0), Err(hantekdso::ErrorCode::Parameter));
    assert_eq!(device.set_offset(0, 1.5), Err(hantekdso::ErrorCode::Parameter));
    assert_eq!(
        device.set_trigger_source(true, 5),
        Err(hantekdso::ErrorCode::Parameter)
    );
    // The samplerate never exceeds the model limit.
    assert_eq!(device.set_samplerate(1e9).unwrap(), 100e6);

    device.disconnect();
}

#[test]
fn setters_fail_when_disconnected() {
    let transport = Arc::new(MockTransport::new(512));
    let device = Device::new(Arc::clone(&transport), models::model_for_product(0x2090).unwrap());
    assert_eq!(device.set_samplerate(1e6), Err(hantekdso::ErrorCode::Connection));
    assert_eq!(
        device.set_channel_used(0, true),
        Err(hantekdso::ErrorCode::Connection)
    );
}

#[test]
fn unknown_product_is_rejected_with_status() {
    static BOGUS: DeviceModel = DeviceModel {
        vendor_id: 0x04B5,
        product_id: 0x9999,
        name: "DSO-9999",
        unofficial: false,
        needs_firmware: false,
        bulk_endpoint_out: 0x02,
        bulk_endpoint_in: 0x86,
    };
    let transport = Arc::new(MockTransport::new(512));
    let device = Device::new(Arc::clone(&transport), &BOGUS);

    let (status_sender, status_receiver) = mpsc::channel();
    device.events().on_status_message(move |code, _| {
        let _ = status_sender.send(code);
    });

    assert_eq!(device.connect(), Err(hantekdso::ErrorCode::Unsupported));
    assert_eq!(
        status_receiver.recv_timeout(Duration::from_secs(1)).unwrap(),
        10000
    );
    assert!(!transport.is_connected(), "transport must be released");
}

#[test]
fn firmware_model_rejects_connect_but_uploads() {
    let transport = Arc::new(MockTransport::new(64));
    let device = Device::new(Arc::clone(&transport), models::model_for_product(0x6022).unwrap());
    assert_eq!(device.connect(), Err(hantekdso::ErrorCode::Unsupported));

    let mut blob_bytes = Vec::new();
    blob_bytes.extend_from_slice(&1u16.to_le_bytes());
    blob_bytes.extend_from_slice(&0xE600u16.to_le_bytes());
    blob_bytes.push(0x01);
    let blob = hantekdso::firmware::FirmwareBlob::parse(&blob_bytes, 1).unwrap();
    device.upload_firmware(&blob).unwrap();

    let writes = transport.control_writes.lock().unwrap();
    assert_eq!(writes.len(), 1);
    assert_eq!(writes[0].0, 0xA0);
    assert_eq!(writes[0].1, 0xE600);
}
