//! Integration test: acquisition feeding the analysis stage end to end.

use std::sync::{Arc, mpsc};
use std::time::Duration;

use hantekdso::analyzer::{AnalyzerSettings, DataAnalyzer};
use hantekdso::device::Device;
use hantekdso::models;
use hantekdso::transport::mock::MockTransport;

fn calibration_block() -> Vec<u8> {
    let mut block = Vec::with_capacity(72);
    for _ in 0..18 {
        block.extend_from_slice(&[0x20, 0x00, 0xE0, 0x00]);
    }
    block
}

#[test]
fn capture_flows_into_analysis() {
    let transport = Arc::new(MockTransport::new(512));
    transport.push_control_response(calibration_block());
    let device = Device::new(Arc::clone(&transport), models::model_for_product(0x2090).unwrap());
    device.connect().expect("connect");
    device.set_channel_used(0, true).unwrap();
    device.set_channel_used(1, true).unwrap();
    device.set_samplerate(50e6).unwrap();

    let analyzer = DataAnalyzer::new(AnalyzerSettings::default());
    let (analyzed_sender, analyzed_receiver) = mpsc::channel();
    analyzer.on_analyzed(move |max_samples| {
        let _ = analyzed_sender.send(max_samples);
    });
    let input = analyzer.input();
    device.events().on_samples_available(move |samples, samplerate, append| {
        input.feed(samples, samplerate, append);
    });

    // One triggered capture: WAITING (start), READY, then sample data
    // alternating between two raw levels per channel pair. The script
    // only goes in after sampling starts so the idle poll cannot
    // consume it.
    device.start_sampling();
    transport.push_bulk_response(vec![0u8; 512]);
    let mut ready = vec![0u8; 512];
    ready[0] = 2;
    transport.push_bulk_response(ready);
    let mut data = Vec::with_capacity(20480);
    for pair in 0..10240u32 {
        let value = if pair % 2 == 0 { 64u8 } else { 192u8 };
        data.push(value);
        data.push(value);
    }
    transport.push_bulk_response(data);

    let max_samples = analyzed_receiver
        .recv_timeout(Duration::from_secs(10))
        .expect("analyzed pass");
    assert_eq!(max_samples, 10240);

    device.disconnect();

    let output = analyzer.output();
    let ch1 = &output.data[0];
    assert_eq!(ch1.voltage.samples.len(), 10240);
    // Square wave between 64 and 192 raw at the default 0.08 step:
    // peak-to-peak is 128/255 of a screenheight.
    let expected = 128.0 / 255.0 * 0.08;
    assert!(
        (ch1.amplitude - expected).abs() < 1e-9,
        "amplitude {} vs {expected}",
        ch1.amplitude
    );
    // Alternation at half the samplerate.
    assert!(ch1.frequency > 0.0);
    assert_eq!(ch1.spectrum.samples.len(), 5120);
    assert_eq!(analyzer.overload_count(), 0);
}
