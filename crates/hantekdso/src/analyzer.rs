//! Post-processing worker.
//!
//! A consumer thread fed by the acquisition engine: it copies each
//! incoming sample packet under the producer's mutex, then computes the
//! voltage series (replacing or, in roll mode, appending), the math
//! channel, the windowed spectrum, the peak-to-peak amplitude and an
//! autocorrelation-based estimate of the fundamental frequency.
//!
//! Backpressure is one-deep: a packet arriving while the previous one is
//! still being analyzed is dropped and counted as an overload.

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Condvar, Mutex, MutexGuard};
use std::thread;

use num_complex::Complex64;
use rustfft::{Fft, FftPlanner};

use crate::window::{self, WindowFunction};

/// Math channel derivation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MathMode {
    /// CH1 + CH2
    Ch1AddCh2,
    /// CH1 - CH2
    Ch1SubCh2,
    /// CH2 - CH1
    Ch2SubCh1,
}

/// Settings of the analysis stage.
#[derive(Debug, Clone)]
pub struct AnalyzerSettings {
    /// Number of real channels; the math channel is appended after them.
    pub physical_channels: usize,
    pub window: WindowFunction,
    pub math_mode: MathMode,
    /// Whether the math channel is computed at all.
    pub math_used: bool,
    /// Per channel (math channel included): convert the spectrum to dB.
    pub spectrum_used: Vec<bool>,
    /// Reference level for the dB conversion.
    pub spectrum_reference: f64,
    /// Lower bound of the dB spectrum, relative floor against noise
    /// peaks.
    pub spectrum_limit: f64,
}

impl Default for AnalyzerSettings {
    fn default() -> Self {
        AnalyzerSettings {
            physical_channels: 2,
            window: WindowFunction::Hamming,
            math_mode: MathMode::Ch1AddCh2,
            math_used: false,
            spectrum_used: vec![false; 3],
            spectrum_reference: 0.0,
            spectrum_limit: -60.0,
        }
    }
}

/// One value array with its sampling interval.
#[derive(Debug, Clone, Default)]
pub struct SampleValues {
    pub samples: Vec<f64>,
    /// Seconds between samples for the voltage series, Hertz between
    /// bins for the spectrum.
    pub interval: f64,
}

/// Analysis results of one channel.
#[derive(Debug, Clone, Default)]
pub struct AnalyzedData {
    pub voltage: SampleValues,
    pub spectrum: SampleValues,
    /// Peak-to-peak amplitude in Volts.
    pub amplitude: f64,
    /// Estimated fundamental frequency in Hertz, 0 when undetected.
    pub frequency: f64,
}

/// The published output: one entry per channel, math channel last.
#[derive(Debug, Default)]
pub struct AnalyzedOutput {
    pub data: Vec<AnalyzedData>,
    /// The largest voltage sample count of the last pass.
    pub max_samples: usize,
}

struct IncomingData {
    data: Vec<Vec<f64>>,
    samplerate: f64,
    append: bool,
}

struct Shared {
    settings: Mutex<AnalyzerSettings>,
    input: Mutex<Option<IncomingData>>,
    input_ready: Condvar,
    busy: AtomicBool,
    running: AtomicBool,
    overloads: AtomicU64,
    output: Mutex<AnalyzedOutput>,
    analyzed: Mutex<Option<Box<dyn Fn(usize) + Send + Sync>>>,
}

/// Producer-side handle for delivering sample packets to the analyzer.
/// Cheap to clone; the device's samples-available callback owns one.
#[derive(Clone)]
pub struct AnalyzerInput {
    shared: Arc<Shared>,
}

impl AnalyzerInput {
    /// Snapshot the sample vectors under the producer's mutex and wake
    /// the analysis thread. Dropped with an overload count when the
    /// previous packet is still in flight.
    pub fn feed(&self, samples: &Mutex<Vec<Vec<f64>>>, samplerate: f64, append: bool) {
        if self.shared.busy.load(Ordering::Acquire) {
            self.shared.overloads.fetch_add(1, Ordering::Relaxed);
            log::warn!("analyzer overload, dropping packet");
            return;
        }
        let data = samples.lock().unwrap().clone();
        *self.shared.input.lock().unwrap() = Some(IncomingData {
            data,
            samplerate,
            append,
        });
        self.shared.input_ready.notify_one();
    }
}

/// The analysis worker.
pub struct DataAnalyzer {
    shared: Arc<Shared>,
    thread: Option<thread::JoinHandle<()>>,
}

impl DataAnalyzer {
    pub fn new(settings: AnalyzerSettings) -> DataAnalyzer {
        let shared = Arc::new(Shared {
            settings: Mutex::new(settings),
            input: Mutex::new(None),
            input_ready: Condvar::new(),
            busy: AtomicBool::new(false),
            running: AtomicBool::new(true),
            overloads: AtomicU64::new(0),
            output: Mutex::new(AnalyzedOutput::default()),
            analyzed: Mutex::new(None),
        });
        let worker_shared = Arc::clone(&shared);
        let thread = thread::Builder::new()
            .name("dso-analyzer".into())
            .spawn(move || worker(worker_shared))
            .expect("spawning the analyzer thread");
        DataAnalyzer {
            shared,
            thread: Some(thread),
        }
    }

    /// Handle for the producer side.
    pub fn input(&self) -> AnalyzerInput {
        AnalyzerInput {
            shared: Arc::clone(&self.shared),
        }
    }

    /// Register the callback fired after each pass with the maximum
    /// sample count of the pass.
    pub fn on_analyzed(&self, callback: impl Fn(usize) + Send + Sync + 'static) {
        *self.shared.analyzed.lock().unwrap() = Some(Box::new(callback));
    }

    /// Lock and read the published output. The analyzer cannot start the
    /// next pass while the guard is held.
    pub fn output(&self) -> MutexGuard<'_, AnalyzedOutput> {
        self.shared.output.lock().unwrap()
    }

    /// Update the analysis settings; applied from the next packet on.
    pub fn set_settings(&self, settings: AnalyzerSettings) {
        *self.shared.settings.lock().unwrap() = settings;
    }

    /// Number of packets dropped because the analyzer was busy.
    pub fn overload_count(&self) -> u64 {
        self.shared.overloads.load(Ordering::Relaxed)
    }
}

impl Drop for DataAnalyzer {
    fn drop(&mut self) {
        self.shared.running.store(false, Ordering::SeqCst);
        // Take the input lock so the store cannot slip between the
        // worker's running check and its wait.
        {
            let _input = self.shared.input.lock().unwrap();
            self.shared.input_ready.notify_all();
        }
        if let Some(thread) = self.thread.take() {
            let _ = thread.join();
        }
    }
}

struct Scratch {
    window_key: Option<(WindowFunction, usize)>,
    window: Vec<f64>,
    dft: Option<(usize, Arc<dyn Fft<f64>>, Arc<dyn Fft<f64>>)>,
    planner: FftPlanner<f64>,
}

impl Scratch {
    fn new() -> Scratch {
        Scratch {
            window_key: None,
            window: Vec::new(),
            dft: None,
            planner: FftPlanner::new(),
        }
    }

    fn window_for(&mut self, function: WindowFunction, len: usize) -> &[f64] {
        if self.window_key != Some((function, len)) {
            self.window = window::coefficients(function, len);
            self.window_key = Some((function, len));
        }
        &self.window
    }

    /// Forward and inverse transforms for `len`, re-planned only when
    /// the record length changes.
    fn plan(&mut self, len: usize) -> (Arc<dyn Fft<f64>>, Arc<dyn Fft<f64>>) {
        match &self.dft {
            Some((cached, forward, inverse)) if *cached == len => {
                (Arc::clone(forward), Arc::clone(inverse))
            }
            _ => {
                let forward = self.planner.plan_fft_forward(len);
                let inverse = self.planner.plan_fft_inverse(len);
                self.dft = Some((len, Arc::clone(&forward), Arc::clone(&inverse)));
                (forward, inverse)
            }
        }
    }
}

fn worker(shared: Arc<Shared>) {
    let mut scratch = Scratch::new();
    loop {
        let incoming = {
            let mut input = shared.input.lock().unwrap();
            loop {
                if !shared.running.load(Ordering::SeqCst) {
                    return;
                }
                if let Some(data) = input.take() {
                    break data;
                }
                input = shared.input_ready.wait(input).unwrap();
            }
        };

        shared.busy.store(true, Ordering::Release);
        let settings = shared.settings.lock().unwrap().clone();
        let max_samples;
        {
            let mut output = shared.output.lock().unwrap();
            analyse_samples(&mut output, &incoming, &settings);
            compute_spectrum(&mut output, &settings, &mut scratch);
            max_samples = output.max_samples;
        }
        shared.busy.store(false, Ordering::Release);

        if let Some(callback) = shared.analyzed.lock().unwrap().as_ref() {
            callback(max_samples);
        }
    }
}

/// Voltage pass: copy or append the incoming data, derive the math
/// channel, track the maximum sample count.
fn analyse_samples(output: &mut AnalyzedOutput, incoming: &IncomingData, settings: &AnalyzerSettings) {
    let channel_count = settings.physical_channels + 1;
    output.data.resize_with(channel_count, AnalyzedData::default);

    let mut max_samples = 0usize;
    for channel in 0..channel_count {
        let physical = channel < settings.physical_channels;
        let valid = if physical {
            incoming.data.get(channel).is_some_and(|data| !data.is_empty())
        } else {
            // The math channel needs both physical channels filled in
            // this pass.
            (settings.math_used || settings.spectrum_used.get(channel).copied().unwrap_or(false))
                && settings.physical_channels >= 2
                && !output.data[0].voltage.samples.is_empty()
                && !output.data[1].voltage.samples.is_empty()
        };

        if !valid {
            let channel_data = &mut output.data[channel];
            channel_data.voltage.samples.clear();
            channel_data.voltage.interval = 0.0;
            continue;
        }

        // A samplerate change invalidates an accumulated roll buffer.
        let interval = 1.0 / incoming.samplerate;
        if interval != output.data[channel].voltage.interval {
            output.data[channel].voltage.interval = interval;
            if incoming.append {
                output.data[channel].voltage.samples.clear();
            }
        }

        if physical {
            let source = &incoming.data[channel];
            let channel_data = &mut output.data[channel];
            if incoming.append {
                channel_data.voltage.samples.extend_from_slice(source);
            } else {
                channel_data.voltage.samples.clear();
                channel_data.voltage.samples.extend_from_slice(source);
            }
            max_samples = max_samples.max(channel_data.voltage.samples.len());
        } else {
            let len = output.data[0]
                .voltage
                .samples
                .len()
                .min(output.data[1].voltage.samples.len());
            let (physical_data, math_data) = output.data.split_at_mut(settings.physical_channels);
            let ch1 = &physical_data[0].voltage.samples;
            let ch2 = &physical_data[1].voltage.samples;
            let math = &mut math_data[0].voltage;
            math.interval = physical_data[0].voltage.interval;
            math.samples.resize(len, 0.0);
            for position in 0..len {
                math.samples[position] = match settings.math_mode {
                    MathMode::Ch1AddCh2 => ch1[position] + ch2[position],
                    MathMode::Ch1SubCh2 => ch1[position] - ch2[position],
                    MathMode::Ch2SubCh1 => ch2[position] - ch1[position],
                };
            }
        }
    }
    output.max_samples = max_samples;
}

/// Spectrum pass: window, DFT, autocorrelation frequency estimate,
/// peak-to-peak amplitude and optional dB conversion.
fn compute_spectrum(output: &mut AnalyzedOutput, settings: &AnalyzerSettings, scratch: &mut Scratch) {
    for (channel, channel_data) in output.data.iter_mut().enumerate() {
        let voltage = &channel_data.voltage;
        if voltage.samples.is_empty() {
            if !channel_data.spectrum.samples.is_empty() {
                channel_data.spectrum.samples.clear();
                channel_data.spectrum.interval = 0.0;
            }
            continue;
        }

        let sample_count = voltage.samples.len();
        let dft_length = sample_count / 2;
        if dft_length == 0 {
            continue;
        }

        channel_data.spectrum.interval = 1.0 / voltage.interval / sample_count as f64;

        let window = scratch.window_for(settings.window, sample_count);
        let mut buffer: Vec<Complex64> = voltage
            .samples
            .iter()
            .zip(window)
            .map(|(&value, &weight)| Complex64::new(value * weight, 0.0))
            .collect();

        let (forward, inverse) = scratch.plan(sample_count);
        forward.process(&mut buffer);

        // Magnitudes of the positive-frequency half.
        let magnitudes: Vec<f64> = buffer[..dft_length].iter().map(|c| c.norm()).collect();

        // Autocorrelation through the power spectrum.
        let correction = 1.0 / dft_length as f64 / dft_length as f64;
        let mut power: Vec<Complex64> = buffer
            .iter()
            .map(|c| Complex64::new(c.norm_sqr() * correction, 0.0))
            .collect();
        inverse.process(&mut power);

        // Peak-to-peak amplitude.
        let mut minimal_voltage = voltage.samples[0];
        let mut maximal_voltage = voltage.samples[0];
        for &value in &voltage.samples[1..] {
            if value < minimal_voltage {
                minimal_voltage = value;
            } else if value > maximal_voltage {
                maximal_voltage = value;
            }
        }
        channel_data.amplitude = maximal_voltage - minimal_voltage;

        // The fundamental shows as the first correlation peak clearly
        // above the minimum seen so far; tracking the minimum on the way
        // rejects the slowly decaying head of the correlation.
        let mut minimum_correlation = power[0].re;
        let mut peak_correlation = 0.0;
        let mut peak_position = 0usize;
        for position in 1..sample_count / 2 {
            let value = power[position].re;
            if value > peak_correlation && value > minimum_correlation * 2.0 {
                peak_correlation = value;
                peak_position = position;
            } else if value < minimum_correlation {
                minimum_correlation = value;
            }
        }
        channel_data.frequency = if peak_position > 0 {
            1.0 / (voltage.interval * peak_position as f64)
        } else {
            0.0
        };

        // The spectrum itself, converted to dB when requested.
        if settings.spectrum_used.get(channel).copied().unwrap_or(false) {
            let offset = 60.0 - settings.spectrum_reference - 20.0 * (dft_length as f64).log10();
            let offset_limit = settings.spectrum_limit - settings.spectrum_reference;
            channel_data.spectrum.samples.clear();
            channel_data
                .spectrum
                .samples
                .extend(magnitudes.iter().map(|&magnitude| {
                    let value = 20.0 * magnitude.abs().log10() + offset;
                    value.max(offset_limit)
                }));
        } else {
            channel_data.spectrum.samples = magnitudes;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::f64::consts::PI;
    use std::sync::mpsc;
    use std::time::Duration;

    fn feed_and_wait(analyzer: &DataAnalyzer, data: Vec<Vec<f64>>, samplerate: f64, append: bool) {
        let (tx, rx) = mpsc::channel();
        analyzer.on_analyzed(move |max| {
            let _ = tx.send(max);
        });
        let samples = Mutex::new(data);
        analyzer.input().feed(&samples, samplerate, append);
        rx.recv_timeout(Duration::from_secs(5))
            .expect("analyzer pass did not finish");
    }

    fn sine(n: usize, cycles: f64, amplitude: f64) -> Vec<f64> {
        (0..n)
            .map(|i| amplitude * (2.0 * PI * cycles * i as f64 / n as f64).sin())
            .collect()
    }

    #[test]
    fn sine_frequency_and_amplitude() {
        let analyzer = DataAnalyzer::new(AnalyzerSettings {
            window: WindowFunction::Hamming,
            ..AnalyzerSettings::default()
        });
        // A sine on bin 8 of 1024 samples at 1 MS/s sits at 7812.5 Hz.
        let signal = sine(1024, 8.0, 1.0);
        feed_and_wait(&analyzer, vec![signal.clone(), vec![]], 1e6, false);

        let output = analyzer.output();
        let ch = &output.data[0];
        assert_eq!(ch.voltage.samples.len(), 1024);
        assert!((ch.voltage.interval - 1e-6).abs() < 1e-18);
        assert!(
            (ch.frequency - 7812.5).abs() / 7812.5 < 0.01,
            "frequency {} not within 1% of 7812.5",
            ch.frequency
        );
        assert!(
            (ch.amplitude - 2.0).abs() / 2.0 < 0.01,
            "amplitude {} not within 1% of 2.0",
            ch.amplitude
        );
        // Channel 2 had no data.
        assert!(output.data[1].voltage.samples.is_empty());
    }

    #[test]
    fn spectrum_peak_bin_and_interval() {
        let analyzer = DataAnalyzer::new(AnalyzerSettings::default());
        let signal = sine(1024, 8.0, 1.0);
        feed_and_wait(&analyzer, vec![signal, vec![]], 1e6, false);

        let output = analyzer.output();
        let spectrum = &output.data[0].spectrum;
        assert_eq!(spectrum.samples.len(), 512);
        // Bin spacing: samplerate / N.
        assert!((spectrum.interval - 1e6 / 1024.0).abs() < 1e-9);
        let peak_bin = spectrum
            .samples
            .iter()
            .enumerate()
            .max_by(|a, b| a.1.total_cmp(b.1))
            .unwrap()
            .0;
        assert_eq!(peak_bin, 8);
    }

    #[test]
    fn spectrum_in_db_is_floored() {
        let mut settings = AnalyzerSettings::default();
        settings.spectrum_used = vec![true, false, false];
        settings.spectrum_reference = 0.0;
        settings.spectrum_limit = -60.0;
        let analyzer = DataAnalyzer::new(settings);
        let signal = sine(256, 4.0, 1.0);
        feed_and_wait(&analyzer, vec![signal, vec![]], 1e6, false);

        let output = analyzer.output();
        let spectrum = &output.data[0].spectrum;
        assert!(spectrum.samples.iter().all(|&v| v >= -60.0));
        // The carrier bin stands above the floor.
        assert!(spectrum.samples[4] > -60.0 + 20.0);
    }

    #[test]
    fn math_channel_subtracts() {
        let mut settings = AnalyzerSettings::default();
        settings.math_used = true;
        settings.math_mode = MathMode::Ch1SubCh2;
        let analyzer = DataAnalyzer::new(settings);
        feed_and_wait(
            &analyzer,
            vec![vec![3.0, 4.0, 5.0], vec![1.0, 1.0, 2.0]],
            1e6,
            false,
        );

        let output = analyzer.output();
        assert_eq!(output.data[2].voltage.samples, vec![2.0, 3.0, 3.0]);
        assert_eq!(output.max_samples, 3);
    }

    #[test]
    fn math_channel_handles_unequal_lengths() {
        let mut settings = AnalyzerSettings::default();
        settings.math_used = true;
        settings.math_mode = MathMode::Ch2SubCh1;
        let analyzer = DataAnalyzer::new(settings);
        feed_and_wait(&analyzer, vec![vec![1.0, 2.0], vec![5.0, 5.0, 5.0]], 1e6, false);

        let output = analyzer.output();
        assert_eq!(output.data[2].voltage.samples, vec![4.0, 3.0]);
    }

    #[test]
    fn append_mode_concatenates() {
        let analyzer = DataAnalyzer::new(AnalyzerSettings::default());
        feed_and_wait(&analyzer, vec![vec![1.0, 2.0], vec![]], 1e6, true);
        feed_and_wait(&analyzer, vec![vec![3.0], vec![]], 1e6, true);

        let output = analyzer.output();
        assert_eq!(output.data[0].voltage.samples, vec![1.0, 2.0, 3.0]);
    }

    #[test]
    fn append_mode_resets_on_samplerate_change() {
        let analyzer = DataAnalyzer::new(AnalyzerSettings::default());
        feed_and_wait(&analyzer, vec![vec![1.0, 2.0], vec![]], 1e6, true);
        feed_and_wait(&analyzer, vec![vec![3.0, 4.0], vec![]], 2e6, true);

        let output = analyzer.output();
        assert_eq!(output.data[0].voltage.samples, vec![3.0, 4.0]);
        assert!((output.data[0].voltage.interval - 0.5e-6).abs() < 1e-18);
    }

    #[test]
    fn replace_mode_overwrites() {
        let analyzer = DataAnalyzer::new(AnalyzerSettings::default());
        feed_and_wait(&analyzer, vec![vec![1.0, 2.0, 3.0], vec![]], 1e6, false);
        feed_and_wait(&analyzer, vec![vec![9.0], vec![]], 1e6, false);

        let output = analyzer.output();
        assert_eq!(output.data[0].voltage.samples, vec![9.0]);
        assert_eq!(output.max_samples, 1);
    }

    #[test]
    fn no_overloads_in_sequential_feeding() {
        let analyzer = DataAnalyzer::new(AnalyzerSettings::default());
        feed_and_wait(&analyzer, vec![vec![1.0, 2.0], vec![]], 1e6, false);
        assert_eq!(analyzer.overload_count(), 0);
    }

    #[test]
    fn dc_signal_has_no_fundamental() {
        let analyzer = DataAnalyzer::new(AnalyzerSettings::default());
        feed_and_wait(&analyzer, vec![vec![1.0; 256], vec![]], 1e6, false);

        let output = analyzer.output();
        assert_eq!(output.data[0].frequency, 0.0);
        assert_eq!(output.data[0].amplitude, 0.0);
    }
}
