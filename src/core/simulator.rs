//! Virtual Geiger counter
//!
//! An in-process detector answering both model protocols, for the CLI's
//! `simulate` command and for driver tests. Pulses are drawn from a Poisson
//! process around a configured mean rate. Responses can be dropped,
//! corrupted or prefixed with line noise to exercise the error paths.

use super::calibration::TubeType;
use super::decoder::{encode_grgc2_sample, DeviceSettings};
use super::model::{DeviceModel, GRGC2_CMD_READ};
use super::protocol::{checksum, GeigerCodec, BINARY_SYNC};
use bytes::BytesMut;
use chrono::NaiveDateTime;
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use serde::{Deserialize, Serialize};
use std::time::Duration;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt, DuplexStream};
use tokio::task::JoinHandle;
use tokio_util::codec::Decoder;
use tokio_util::sync::CancellationToken;

/// Error injection configuration
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct ErrorInjectionConfig {
    /// Probability of answering nothing (0.0 - 1.0)
    pub drop_probability: f64,
    /// Probability of flipping one byte of the response (0.0 - 1.0)
    pub corruption_probability: f64,
    /// Probability of prefixing the response with noise (0.0 - 1.0)
    pub noise_probability: f64,
}

impl ErrorInjectionConfig {
    /// Whether any injection is configured
    pub fn is_enabled(&self) -> bool {
        self.drop_probability > 0.0 || self.corruption_probability > 0.0 || self.noise_probability > 0.0
    }
}

/// Virtual device configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SimulatorConfig {
    /// Protocol spoken
    pub model: DeviceModel,
    /// Tube reported in settings and used for the reported dose
    pub tube: TubeType,
    /// Mean count rate
    pub mean_cpm: f64,
    /// Tube supply voltage
    pub supply_voltage: f64,
    /// Time between two data requests, used to size the pulse window
    #[serde(with = "humantime_serde")]
    pub window: Duration,
    /// Seed for reproducible runs
    pub seed: Option<u64>,
    /// Fault injection
    pub errors: ErrorInjectionConfig,
}

impl Default for SimulatorConfig {
    fn default() -> Self {
        Self {
            model: DeviceModel::Grgc1,
            tube: TubeType::Sbm20,
            mean_cpm: 20.0,
            supply_voltage: 400.0,
            window: Duration::from_secs(10),
            seed: None,
            errors: ErrorInjectionConfig::default(),
        }
    }
}

/// Counters kept by the virtual device
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SimulatorStats {
    /// Requests understood
    pub requests: u64,
    /// Samples sent
    pub samples_sent: u64,
    /// Responses dropped by injection
    pub dropped: u64,
    /// Responses corrupted by injection
    pub corrupted: u64,
    /// Responses prefixed with noise
    pub noisy: u64,
    /// Frames that could not be understood
    pub unknown_requests: u64,
}

#[derive(Debug, Deserialize)]
#[serde(untagged)]
enum Grgc1Command {
    Get {
        get: String,
    },
    Clock {
        date: String,
        time: String,
    },
    Settings {
        sound: Option<u8>,
        tube: Option<u8>,
        #[serde(default)]
        ip: Option<String>,
    },
}

/// Simulated detector
pub struct VirtualGeiger {
    config: SimulatorConfig,
    rng: StdRng,
    settings: DeviceSettings,
    clock: Option<NaiveDateTime>,
    stats: SimulatorStats,
}

impl VirtualGeiger {
    /// Create a device
    pub fn new(config: SimulatorConfig) -> Self {
        let rng = match config.seed {
            Some(seed) => StdRng::seed_from_u64(seed),
            None => StdRng::from_entropy(),
        };
        let settings = DeviceSettings {
            sound: Some(0),
            tube: Some(config.tube.device_code()),
            unit_id: Some(1),
            ..DeviceSettings::default()
        };
        Self {
            config,
            rng,
            settings,
            clock: None,
            stats: SimulatorStats::default(),
        }
    }

    /// Settings currently stored on the device
    pub fn settings(&self) -> &DeviceSettings {
        &self.settings
    }

    /// Last time the host set on the device
    pub fn clock(&self) -> Option<NaiveDateTime> {
        self.clock
    }

    /// Get statistics
    pub fn stats(&self) -> SimulatorStats {
        self.stats
    }

    /// Answer one request frame, as cut by the model's framing
    ///
    /// Returns the bytes to write back, empty when nothing is sent.
    pub fn respond(&mut self, request: &[u8]) -> Vec<u8> {
        let response = match self.config.model {
            DeviceModel::Grgc1 => self.respond_grgc1(request),
            DeviceModel::Grgc2 => self.respond_grgc2(request),
        };
        match response {
            Some(bytes) => self.inject(bytes),
            None => Vec::new(),
        }
    }

    fn respond_grgc1(&mut self, request: &[u8]) -> Option<Vec<u8>> {
        let command = match serde_json::from_slice::<Grgc1Command>(request) {
            Ok(command) => command,
            Err(e) => {
                tracing::debug!(error = %e, "virtual device ignored request");
                self.stats.unknown_requests += 1;
                return None;
            }
        };
        self.stats.requests += 1;

        match command {
            Grgc1Command::Get { get } if get == "data" => {
                let pulses = self.draw_pulses();
                let minutes = self.config.window.as_secs_f64() / 60.0;
                let cpm = if minutes > 0.0 { f64::from(pulses) / minutes } else { 0.0 };
                let sample = serde_json::json!({
                    "cpm": cpm.round(),
                    "cps": (cpm / 60.0 * 100.0).round() / 100.0,
                    "dose": (cpm * self.config.tube.cpm_factor() * 1e6).round() / 1e6,
                    "voltage": self.config.supply_voltage,
                });
                self.stats.samples_sent += 1;
                Some(json_line(&sample))
            }
            Grgc1Command::Get { get } if get == "config" => Some(json_line(&self.settings)),
            Grgc1Command::Get { get } => {
                tracing::debug!(get = %get, "virtual device ignored unknown get");
                self.stats.unknown_requests += 1;
                None
            }
            Grgc1Command::Clock { date, time } => {
                let stamp = format!("{date} {time}");
                match NaiveDateTime::parse_from_str(&stamp, "%m/%d/%Y %H:%M:%S") {
                    Ok(parsed) => self.clock = Some(parsed),
                    Err(e) => tracing::debug!(error = %e, "virtual device rejected clock"),
                }
                None
            }
            Grgc1Command::Settings { sound, tube, ip } => {
                if sound.is_some() {
                    self.settings.sound = sound;
                }
                if tube.is_some() {
                    self.settings.tube = tube;
                }
                if ip.is_some() {
                    self.settings.ip = ip;
                }
                None
            }
        }
    }

    fn respond_grgc2(&mut self, request: &[u8]) -> Option<Vec<u8>> {
        let valid = request.len() == 5
            && request[0] == BINARY_SYNC
            && request[1] == 1
            && request[2] == GRGC2_CMD_READ
            && checksum::crc16_modbus(&request[1..3])
                == checksum::stored_crc16([request[3], request[4]]);
        if !valid {
            self.stats.unknown_requests += 1;
            return None;
        }
        self.stats.requests += 1;
        self.stats.samples_sent += 1;

        let pulses = self.draw_pulses();
        Some(encode_grgc2_sample(pulses, self.config.supply_voltage))
    }

    fn draw_pulses(&mut self) -> u32 {
        let lambda = self.config.mean_cpm.max(0.0) / 60.0 * self.config.window.as_secs_f64();
        poisson(&mut self.rng, lambda)
    }

    fn inject(&mut self, mut response: Vec<u8>) -> Vec<u8> {
        let errors = &self.config.errors;
        if !errors.is_enabled() || response.is_empty() {
            return response;
        }

        if self.rng.gen::<f64>() < errors.drop_probability {
            self.stats.dropped += 1;
            return Vec::new();
        }

        if self.rng.gen::<f64>() < errors.corruption_probability {
            // Keep the frame markers so the corruption reaches the decoder
            let body = match self.config.model {
                DeviceModel::Grgc1 => 1..response.len().saturating_sub(1),
                DeviceModel::Grgc2 => 2..response.len(),
            };
            if !body.is_empty() {
                let idx = self.rng.gen_range(body);
                response[idx] ^= self.rng.gen_range(1..=u8::MAX);
                self.stats.corrupted += 1;
            }
        }

        if self.rng.gen::<f64>() < errors.noise_probability {
            let noise: Vec<u8> = (0..self.rng.gen_range(1..4))
                .map(|_| self.rng.gen_range(0x20..0x7B))
                .collect();
            self.stats.noisy += 1;
            return [noise, response].concat();
        }

        response
    }

    /// Serve requests from `io` until it closes or `shutdown` fires
    pub async fn serve<S>(
        mut self,
        mut io: S,
        shutdown: CancellationToken,
    ) -> std::io::Result<SimulatorStats>
    where
        S: AsyncRead + AsyncWrite + Unpin,
    {
        let mut codec = GeigerCodec::new(self.config.model.framing());
        let mut buffer = BytesMut::with_capacity(256);

        loop {
            let read = tokio::select! {
                _ = shutdown.cancelled() => break,
                read = io.read_buf(&mut buffer) => read?,
            };
            if read == 0 {
                break;
            }

            loop {
                match codec.decode(&mut buffer) {
                    Ok(Some(request)) => {
                        let response = self.respond(&request);
                        if !response.is_empty() {
                            io.write_all(&response).await?;
                            io.flush().await?;
                        }
                    }
                    Ok(None) => break,
                    Err(e) => {
                        tracing::debug!(error = %e, "virtual device framing error");
                        self.stats.unknown_requests += 1;
                    }
                }
            }
        }

        tracing::debug!(stats = ?self.stats, "virtual device stopped");
        Ok(self.stats)
    }

    /// Run the device on a background task behind an in-memory pipe
    ///
    /// Returns the host end of the pipe.
    pub fn spawn(self, shutdown: CancellationToken) -> (DuplexStream, JoinHandle<std::io::Result<SimulatorStats>>) {
        let (host, device) = tokio::io::duplex(1024);
        let handle = tokio::spawn(self.serve(device, shutdown));
        (host, handle)
    }
}

fn json_line<T: Serialize>(value: &T) -> Vec<u8> {
    let mut line = serde_json::to_vec(value).unwrap_or_default();
    line.push(b'\n');
    line
}

/// Poisson sample: Knuth for small means, normal approximation above
fn poisson(rng: &mut StdRng, lambda: f64) -> u32 {
    if lambda <= 0.0 {
        return 0;
    }
    if lambda < 30.0 {
        let limit = (-lambda).exp();
        let mut k = 0u32;
        let mut p = 1.0;
        loop {
            p *= rng.gen::<f64>();
            if p <= limit {
                return k;
            }
            k += 1;
        }
    }

    // Box-Muller
    let u1: f64 = rng.gen::<f64>().max(f64::MIN_POSITIVE);
    let u2: f64 = rng.gen();
    let z = (-2.0 * u1.ln()).sqrt() * (2.0 * std::f64::consts::PI * u2).cos();
    (lambda + z * lambda.sqrt()).round().max(0.0) as u32
}
