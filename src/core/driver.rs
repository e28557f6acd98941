//! Polling driver
//!
//! Owns the transport, the sinks and the poll state machine of one detector.
//! Each tick runs one cycle: send the model's data request, read frames until
//! a sample arrives or the response timeout expires, calibrate, publish. A
//! failed cycle is skipped and the next tick starts afresh.

use super::calibration::TubeType;
use super::clock::Clock;
use super::decoder::{decode_message, DecodeError, DeviceMessage, DeviceSettings};
use super::model::{grgc1_clock_command, grgc1_settings_command, DeviceModel, GRGC1_GET_CONFIG};
use super::reading::Reading;
use super::sink::{PublishReport, SinkSet};
use super::state_machine::{PollState, PollStateMachine, TransitionError};
use super::transport::{TransportError, TransportStats, TransportTrait};
use chrono::{DateTime, Local};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::sync::{broadcast, watch};
use tokio::time::{Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

/// Resolved driver configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DriverConfig {
    /// Device model
    pub model: DeviceModel,
    /// Installed tube
    pub tube: TubeType,
    /// Time between poll cycles
    #[serde(with = "humantime_serde")]
    pub update_interval: Duration,
    /// Longest wait for the answer to a data request
    #[serde(with = "humantime_serde")]
    pub response_timeout: Duration,
    /// Click sound setting pushed to the device, off when unset
    pub sound: Option<bool>,
    /// Reporting address pushed to the device
    pub host_address: Option<String>,
    /// Set the device clock at setup, after the first sample and whenever
    /// the bound clock is set
    pub time_sync: bool,
}

impl Default for DriverConfig {
    fn default() -> Self {
        Self {
            model: DeviceModel::Grgc1,
            tube: TubeType::Sbm20,
            update_interval: Duration::from_secs(10),
            response_timeout: Duration::from_secs(2),
            sound: None,
            host_address: None,
            time_sync: true,
        }
    }
}

impl DriverConfig {
    /// Check the timing constraints
    pub fn validate(&self) -> Result<(), DriverError> {
        if self.update_interval.is_zero() {
            return Err(DriverError::InvalidConfig("update interval must be positive".into()));
        }
        if self.response_timeout.is_zero() {
            return Err(DriverError::InvalidConfig("response timeout must be positive".into()));
        }
        if self.response_timeout >= self.update_interval {
            return Err(DriverError::InvalidConfig(format!(
                "response timeout {:?} must be shorter than the update interval {:?}",
                self.response_timeout, self.update_interval
            )));
        }
        Ok(())
    }
}

/// Driver error types, outside of a poll cycle
#[derive(Error, Debug)]
pub enum DriverError {
    /// Configuration rejected
    #[error("Invalid driver configuration: {0}")]
    InvalidConfig(String),

    /// Transport failure
    #[error(transparent)]
    Transport(#[from] TransportError),

    /// Command not available on this model
    #[error("{model} does not support {command}")]
    Unsupported {
        /// Device model
        model: DeviceModel,
        /// Command name
        command: &'static str,
    },

    /// No valid time to send
    #[error("Clock unavailable: {0}")]
    Clock(&'static str),

    /// Command could not be encoded
    #[error("Command encoding failed: {0}")]
    Encoding(#[from] serde_json::Error),
}

/// Reason a poll cycle produced no reading
#[derive(Error, Debug)]
pub enum CycleError {
    /// Another cycle is still in flight
    #[error("Poll cycle already in flight: {0}")]
    Busy(#[from] TransitionError),

    /// Transport failure
    #[error(transparent)]
    Transport(#[from] TransportError),

    /// Frame rejected
    #[error(transparent)]
    Decode(#[from] DecodeError),
}

impl CycleError {
    /// Whether the next tick is expected to succeed again
    pub fn is_transient(&self) -> bool {
        match self {
            Self::Busy(_) | Self::Decode(_) => true,
            Self::Transport(e) => e.is_transient(),
        }
    }

    /// Short class name used for statistics and logs
    pub fn class(&self) -> &'static str {
        match self {
            Self::Busy(_) => "busy",
            Self::Transport(TransportError::Timeout(_)) => "timeout",
            Self::Transport(TransportError::Framing(_)) => "framing",
            Self::Transport(TransportError::Disconnected) => "disconnected",
            Self::Transport(_) => "transport",
            Self::Decode(DecodeError::Checksum { .. }) => "checksum",
            Self::Decode(DecodeError::TruncatedFrame { .. }) => "truncated",
            Self::Decode(_) => "malformed",
        }
    }
}

/// Result of a successful cycle
#[derive(Debug)]
pub struct CycleOutcome {
    /// Published reading
    pub reading: Reading,
    /// Per-sink delivery
    pub report: PublishReport,
}

/// Driver events
#[derive(Debug, Clone)]
pub enum DriverEvent {
    /// Poll state changed
    StateChanged(PollState),
    /// Reading published
    Published {
        /// The reading
        reading: Reading,
        /// Sinks that received their value
        delivered: usize,
        /// Sinks that rejected their value
        failed: usize,
    },
    /// Cycle skipped
    Skipped {
        /// Error class
        class: &'static str,
        /// Error message
        error: String,
    },
    /// Settings report received from the device
    Settings(DeviceSettings),
}

/// Driver statistics
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct DriverStats {
    /// Cycles begun
    pub cycles: u64,
    /// Cycles that published a reading
    pub published: u64,
    /// Cycles ended by a response timeout
    pub timeouts: u64,
    /// Cycles ended by a framing error
    pub framing_errors: u64,
    /// Cycles ended by a bad checksum
    pub checksum_errors: u64,
    /// Cycles ended by a truncated frame
    pub truncated_frames: u64,
    /// Cycles ended by an unparsable frame
    pub malformed_frames: u64,
    /// Cycles ended by a closed or failing link
    pub link_errors: u64,
    /// Cycles abandoned by cancellation
    pub abandoned: u64,
    /// Values rejected by sinks
    pub sink_failures: u64,
    /// Settings reports received
    pub settings_reports: u64,
    /// Samples left over from earlier requests and dropped
    pub stale_samples: u64,
    /// Clock commands sent to the device
    pub clock_syncs: u64,
    /// Capture time of the last published reading
    pub last_success: Option<DateTime<Local>>,
}

impl DriverStats {
    /// Cycles that ended without a reading
    pub fn skipped(&self) -> u64 {
        self.timeouts
            + self.framing_errors
            + self.checksum_errors
            + self.truncated_frames
            + self.malformed_frames
            + self.link_errors
            + self.abandoned
    }

    fn record_skip(&mut self, error: &CycleError) {
        match error.class() {
            "timeout" => self.timeouts += 1,
            "framing" => self.framing_errors += 1,
            "checksum" => self.checksum_errors += 1,
            "truncated" => self.truncated_frames += 1,
            "malformed" => self.malformed_frames += 1,
            "busy" => {}
            _ => self.link_errors += 1,
        }
    }
}

/// Polling driver for one detector
pub struct GeigerDriver {
    id: Uuid,
    config: DriverConfig,
    transport: Box<dyn TransportTrait>,
    sinks: SinkSet,
    clock: Option<Arc<dyn Clock>>,
    clock_rx: Option<watch::Receiver<Option<DateTime<Local>>>>,
    machine: PollStateMachine,
    stats: DriverStats,
    device_settings: Option<DeviceSettings>,
    device_configured: bool,
    event_tx: broadcast::Sender<DriverEvent>,
}

impl GeigerDriver {
    /// Create a driver; the configuration is validated here
    pub fn new(
        config: DriverConfig,
        transport: Box<dyn TransportTrait>,
        sinks: SinkSet,
    ) -> Result<Self, DriverError> {
        config.validate()?;
        let (event_tx, _) = broadcast::channel(256);

        Ok(Self {
            id: Uuid::new_v4(),
            config,
            transport,
            sinks,
            clock: None,
            clock_rx: None,
            machine: PollStateMachine::new(),
            stats: DriverStats::default(),
            device_settings: None,
            device_configured: false,
            event_tx,
        })
    }

    /// Bind a clock for time sync and reading timestamps
    #[must_use]
    pub fn with_clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock_rx = clock.subscribe();
        self.clock = Some(clock);
        self
    }

    /// Driver ID
    pub fn id(&self) -> Uuid {
        self.id
    }

    /// Resolved configuration
    pub fn config(&self) -> &DriverConfig {
        &self.config
    }

    /// Current poll state
    pub fn state(&self) -> PollState {
        self.machine.state()
    }

    /// State machine, for its history
    pub fn state_machine(&self) -> &PollStateMachine {
        &self.machine
    }

    /// Get statistics
    pub fn stats(&self) -> DriverStats {
        self.stats.clone()
    }

    /// Get transport statistics
    pub fn transport_stats(&self) -> TransportStats {
        self.transport.stats()
    }

    /// Last settings report received from the device
    pub fn device_settings(&self) -> Option<&DeviceSettings> {
        self.device_settings.as_ref()
    }

    /// Subscribe to driver events
    pub fn subscribe(&self) -> broadcast::Receiver<DriverEvent> {
        self.event_tx.subscribe()
    }

    /// Prepare the device before the first poll
    pub async fn setup(&mut self) -> Result<(), DriverError> {
        tracing::info!(
            driver = %self.id,
            model = %self.config.model,
            tube = %self.config.tube,
            interval = ?self.config.update_interval,
            link = %self.transport.connection_info(),
            "setting up Geiger counter"
        );

        if self.config.model.accepts_settings() {
            // Flush whatever the device has half-received, then ask for its settings
            self.transport.send(b"\n").await?;
            self.transport.send(GRGC1_GET_CONFIG).await?;
            if self.config.time_sync && self.clock_valid() {
                if let Err(e) = self.sync_clock().await {
                    tracing::warn!(driver = %self.id, error = %e, "clock sync failed");
                }
            }
        }
        Ok(())
    }

    /// Run one poll cycle
    ///
    /// A failed cycle is logged, counted and returned as the error; the driver
    /// is back in `Idle` either way. Dropping the future mid-cycle leaves it in
    /// `Polling` until [`abandon_cycle`](Self::abandon_cycle) is called.
    pub async fn poll_once(&mut self) -> Result<CycleOutcome, CycleError> {
        self.machine.begin_cycle()?;
        self.stats.cycles += 1;
        self.emit(DriverEvent::StateChanged(PollState::Polling));

        let reading = match self.read_sample().await {
            Ok(reading) => reading,
            Err(e) => {
                self.skip_cycle(&e);
                return Err(e);
            }
        };

        let captured_at = self.now();
        let reading = reading
            .calibrated(self.config.model, self.config.tube, self.config.update_interval)
            .captured(captured_at);
        tracing::debug!(driver = %self.id, %reading, "sample decoded");

        self.machine.begin_publish()?;
        self.emit(DriverEvent::StateChanged(PollState::Publishing));

        let report = self.sinks.publish(&reading);
        self.stats.published += 1;
        self.stats.sink_failures += report.failed.len() as u64;
        self.stats.last_success = Some(captured_at);
        self.emit(DriverEvent::Published {
            reading: reading.clone(),
            delivered: report.delivered.len(),
            failed: report.failed.len(),
        });

        self.machine.finish(Some("published"));
        self.emit(DriverEvent::StateChanged(PollState::Idle));

        if self.config.model.accepts_settings() && !self.device_configured {
            self.device_configured = true;
            self.configure_device().await;
        }

        Ok(CycleOutcome { reading, report })
    }

    /// End a cycle whose future was dropped
    ///
    /// Discards the partial frame so the next read starts on a frame boundary.
    pub fn abandon_cycle(&mut self) {
        if !self.machine.state().is_busy() {
            return;
        }
        self.transport.reset_framing();
        self.machine.finish(Some("cancelled"));
        self.stats.abandoned += 1;
        tracing::debug!(driver = %self.id, "poll cycle abandoned");
        self.emit(DriverEvent::StateChanged(PollState::Idle));
    }

    /// Poll on the configured interval until `shutdown` fires
    ///
    /// Setting the bound clock resends the time to the device between cycles.
    pub async fn run(&mut self, shutdown: CancellationToken) -> DriverStats {
        let mut ticker = tokio::time::interval(self.config.update_interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
        let mut clock_rx = self.clock_rx.take();

        loop {
            let wake = tokio::select! {
                _ = shutdown.cancelled() => break,
                _ = ticker.tick() => Wake::Tick,
                () = clock_set(&mut clock_rx) => Wake::ClockSet,
            };
            if wake == Wake::ClockSet {
                self.resync_clock().await;
                continue;
            }

            let finished = tokio::select! {
                _ = shutdown.cancelled() => None,
                result = self.poll_once() => Some(result),
            };
            if finished.is_none() {
                self.abandon_cycle();
                break;
            }
        }
        self.clock_rx = clock_rx;

        tracing::info!(
            driver = %self.id,
            cycles = self.stats.cycles,
            published = self.stats.published,
            skipped = self.stats.skipped(),
            "polling stopped"
        );
        self.stats.clone()
    }

    /// Store sound, tube and reporting address on the device
    pub async fn push_settings(&mut self) -> Result<(), DriverError> {
        if !self.config.model.accepts_settings() {
            return Err(DriverError::Unsupported {
                model: self.config.model,
                command: "settings push",
            });
        }

        let command = grgc1_settings_command(
            self.config.sound.unwrap_or(false),
            self.config.tube,
            self.config.host_address.as_deref(),
        )?;
        self.transport.send(&command).await?;
        self.transport.send(GRGC1_GET_CONFIG).await?;
        tracing::info!(driver = %self.id, tube = %self.config.tube, "settings pushed to device");
        Ok(())
    }

    /// Set the device clock from the bound clock
    pub async fn sync_clock(&mut self) -> Result<(), DriverError> {
        if !self.config.model.accepts_settings() {
            return Err(DriverError::Unsupported {
                model: self.config.model,
                command: "clock sync",
            });
        }
        let clock = self.clock.as_ref().ok_or(DriverError::Clock("no clock bound"))?;
        let now = clock.now().ok_or(DriverError::Clock("clock not synchronised"))?;

        self.transport.send(&grgc1_clock_command(&now)?).await?;
        self.stats.clock_syncs += 1;
        tracing::info!(driver = %self.id, time = %now.format("%Y-%m-%d %H:%M:%S"), "device clock set");
        Ok(())
    }

    async fn configure_device(&mut self) {
        if let Err(e) = self.push_settings().await {
            tracing::warn!(driver = %self.id, error = %e, "settings push failed");
        }
        if self.config.time_sync {
            if let Err(e) = self.sync_clock().await {
                tracing::warn!(driver = %self.id, error = %e, "clock sync failed");
            }
        }
    }

    async fn resync_clock(&mut self) {
        if !self.config.model.accepts_settings() || !self.config.time_sync || !self.clock_valid() {
            return;
        }
        if let Err(e) = self.sync_clock().await {
            tracing::warn!(driver = %self.id, error = %e, "clock resync failed");
        }
    }

    fn clock_valid(&self) -> bool {
        self.clock.as_ref().is_some_and(|c| c.now().is_some())
    }

    async fn read_sample(&mut self) -> Result<Reading, CycleError> {
        let timeout = self.config.response_timeout;

        // Answers to earlier requests must not be taken for this one
        for frame in self.transport.discard_input().await? {
            match decode_message(&frame, self.config.model) {
                Ok(DeviceMessage::Settings(settings)) => self.record_settings(settings),
                Ok(DeviceMessage::Sample(_)) => {
                    self.stats.stale_samples += 1;
                    tracing::debug!(driver = %self.id, "dropping stale sample");
                }
                Err(e) => tracing::debug!(driver = %self.id, error = %e, "dropping stale frame"),
            }
        }

        self.transport.send(&self.config.model.data_request()).await?;
        let deadline = Instant::now() + timeout;

        loop {
            let remaining = deadline.saturating_duration_since(Instant::now());
            if remaining.is_zero() {
                return Err(TransportError::Timeout(timeout).into());
            }

            let frame = self.transport.read_frame(remaining).await.map_err(|e| match e {
                TransportError::Timeout(_) => TransportError::Timeout(timeout),
                other => other,
            })?;

            match decode_message(&frame, self.config.model)? {
                DeviceMessage::Sample(reading) => return Ok(reading),
                DeviceMessage::Settings(settings) => self.record_settings(settings),
            }
        }
    }

    fn record_settings(&mut self, settings: DeviceSettings) {
        tracing::info!(driver = %self.id, ?settings, "device settings");
        self.stats.settings_reports += 1;
        self.emit(DriverEvent::Settings(settings.clone()));
        self.device_settings = Some(settings);
    }

    fn skip_cycle(&mut self, error: &CycleError) {
        self.transport.reset_framing();
        self.stats.record_skip(error);

        match error {
            CycleError::Transport(TransportError::Disconnected) => {
                tracing::error!(driver = %self.id, "device link closed, skipping cycle");
            }
            e if e.is_transient() => {
                tracing::warn!(driver = %self.id, class = e.class(), error = %e, "poll cycle skipped");
            }
            e => {
                tracing::error!(driver = %self.id, class = e.class(), error = %e, "poll cycle failed");
            }
        }

        self.emit(DriverEvent::Skipped {
            class: error.class(),
            error: error.to_string(),
        });
        self.machine.finish(Some(error.class()));
        self.emit(DriverEvent::StateChanged(PollState::Idle));
    }

    fn now(&self) -> DateTime<Local> {
        self.clock
            .as_ref()
            .and_then(|c| c.now())
            .unwrap_or_else(Local::now)
    }

    fn emit(&self, event: DriverEvent) {
        // No subscribers is fine
        let _ = self.event_tx.send(event);
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Wake {
    Tick,
    ClockSet,
}

/// Resolves when the clock is set; never when there is nothing to watch
async fn clock_set(rx: &mut Option<watch::Receiver<Option<DateTime<Local>>>>) {
    if let Some(receiver) = rx {
        if receiver.changed().await.is_ok() {
            return;
        }
        // Clock dropped
        *rx = None;
    }
    std::future::pending::<()>().await;
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::calibration::DEFAULT_CPM_FACTOR;
    use crate::core::clock::ManualClock;
    use crate::core::decoder::encode_grgc2_sample;
    use crate::core::model::GRGC1_GET_DATA;
    use crate::core::protocol::FramingType;
    use crate::core::reading::{DoseSource, SensorKind};
    use crate::core::sink::{ChannelSink, PublishedValue, SinkBinding};
    use crate::core::transport::StreamTransport;
    use chrono::TimeZone;
    use tokio::io::{AsyncReadExt, AsyncWriteExt, DuplexStream};
    use tokio::sync::mpsc;
    use tokio::task::JoinHandle;

    fn config(model: DeviceModel) -> DriverConfig {
        DriverConfig {
            model,
            response_timeout: Duration::from_millis(100),
            ..DriverConfig::default()
        }
    }

    fn all_sinks() -> (SinkSet, mpsc::Receiver<PublishedValue>) {
        let (sink, rx) = ChannelSink::new(16);
        let sink = Arc::new(sink);
        let mut set = SinkSet::new();
        for &kind in SensorKind::all() {
            set = set.with(SinkBinding::new(kind, sink.clone()));
        }
        (set, rx)
    }

    fn driver(model: DeviceModel) -> (GeigerDriver, DuplexStream, mpsc::Receiver<PublishedValue>) {
        let (host, device) = tokio::io::duplex(1024);
        let transport = StreamTransport::new(host, model.framing());
        let (sinks, rx) = all_sinks();
        let driver = GeigerDriver::new(config(model), Box::new(transport), sinks).unwrap();
        (driver, device, rx)
    }

    /// Answers each data request with the next reply (an empty reply stays
    /// silent) and returns every byte the driver wrote once it hangs up
    fn scripted_device(
        mut device: DuplexStream,
        model: DeviceModel,
        replies: Vec<Vec<u8>>,
    ) -> JoinHandle<Vec<u8>> {
        tokio::spawn(async move {
            let request = model.data_request();
            let mut replies = replies.into_iter();
            let mut written = Vec::new();
            let mut answered = 0;
            let mut buf = [0u8; 256];

            loop {
                let n = match device.read(&mut buf).await {
                    Ok(0) | Err(_) => break,
                    Ok(n) => n,
                };
                written.extend_from_slice(&buf[..n]);

                let requests = written
                    .windows(request.len())
                    .filter(|w| *w == request.as_slice())
                    .count();
                while answered < requests {
                    answered += 1;
                    if let Some(reply) = replies.next() {
                        device.write_all(&reply).await.unwrap();
                    }
                }
            }
            written
        })
    }

    async fn read_until(device: &mut DuplexStream, written: &mut Vec<u8>, needle: &[u8]) {
        let search = async {
            let mut buf = [0u8; 256];
            while !written.windows(needle.len()).any(|w| w == needle) {
                let n = device.read(&mut buf).await.unwrap();
                assert!(n > 0, "driver closed the link");
                written.extend_from_slice(&buf[..n]);
            }
        };
        tokio::time::timeout(Duration::from_secs(2), search)
            .await
            .expect("command never reached the device");
    }

    fn drain(rx: &mut mpsc::Receiver<PublishedValue>) -> Vec<(SensorKind, f64)> {
        let mut values = Vec::new();
        while let Ok(v) = rx.try_recv() {
            values.push((v.kind, v.value));
        }
        values
    }

    #[test]
    fn test_config_validation() {
        assert!(DriverConfig::default().validate().is_ok());

        let mut cfg = DriverConfig::default();
        cfg.response_timeout = cfg.update_interval;
        assert!(matches!(cfg.validate(), Err(DriverError::InvalidConfig(_))));

        cfg.update_interval = Duration::ZERO;
        assert!(cfg.validate().is_err());
    }

    #[tokio::test]
    async fn test_raw_counts_calibrated_over_interval() {
        let (mut driver, device, mut rx) = driver(DeviceModel::Grgc2);
        let device = scripted_device(device, DeviceModel::Grgc2, vec![encode_grgc2_sample(60, 400.0)]);

        let outcome = driver.poll_once().await.unwrap();
        let reading = outcome.reading;
        assert_eq!(reading.counts_per_minute, Some(360.0));
        assert_eq!(reading.counts_per_second, Some(6.0));
        assert_eq!(reading.dose_rate, Some(60.0 / 10.0 * TubeType::Sbm20.calibration_factor()));
        assert_eq!(reading.dose_source, DoseSource::Calibrated);
        assert!(reading.captured_at.is_some());

        assert_eq!(drain(&mut rx).len(), 4);
        assert_eq!(driver.state(), PollState::Idle);
        assert_eq!(driver.stats().published, 1);

        // Only the data request went out
        drop(driver);
        assert_eq!(device.await.unwrap(), DeviceModel::Grgc2.data_request());
    }

    #[tokio::test]
    async fn test_unknown_tube_uses_default_factor() {
        let (host, device) = tokio::io::duplex(1024);
        let transport = StreamTransport::new(host, FramingType::Binary);
        let cfg = DriverConfig {
            tube: TubeType::Unknown,
            ..config(DeviceModel::Grgc2)
        };
        let mut driver = GeigerDriver::new(cfg, Box::new(transport), SinkSet::new()).unwrap();
        let _device = scripted_device(device, DeviceModel::Grgc2, vec![encode_grgc2_sample(10, 400.0)]);

        let reading = driver.poll_once().await.unwrap().reading;
        assert_eq!(reading.dose_rate, Some(10.0 / 10.0 * DEFAULT_CPM_FACTOR * 60.0));
    }

    #[tokio::test]
    async fn test_timeout_skips_publish() {
        let (mut driver, _device, mut rx) = driver(DeviceModel::Grgc2);
        let mut events = driver.subscribe();

        let result = driver.poll_once().await;
        assert!(matches!(result, Err(CycleError::Transport(TransportError::Timeout(_)))));
        assert!(drain(&mut rx).is_empty());
        assert_eq!(driver.state(), PollState::Idle);
        assert_eq!(driver.stats().timeouts, 1);

        let mut skipped = false;
        while let Ok(event) = events.try_recv() {
            if let DriverEvent::Skipped { class, .. } = event {
                assert_eq!(class, "timeout");
                skipped = true;
            }
        }
        assert!(skipped);
    }

    #[tokio::test]
    async fn test_bad_checksum_then_recovery() {
        let (mut driver, device, mut rx) = driver(DeviceModel::Grgc2);
        let mut corrupt = encode_grgc2_sample(5, 400.0);
        corrupt[3] ^= 0xFF;
        let _device = scripted_device(
            device,
            DeviceModel::Grgc2,
            vec![corrupt, encode_grgc2_sample(5, 400.0)],
        );

        let result = driver.poll_once().await;
        assert!(matches!(result, Err(CycleError::Decode(DecodeError::Checksum { .. }))));
        assert!(drain(&mut rx).is_empty());

        let reading = driver.poll_once().await.unwrap().reading;
        assert_eq!(reading.raw_counts, Some(5));
        assert_eq!(driver.stats().checksum_errors, 1);
        assert_eq!(driver.stats().published, 1);
    }

    #[tokio::test]
    async fn test_late_reply_is_not_taken_for_the_next_request() {
        let (mut driver, mut device, mut rx) = driver(DeviceModel::Grgc2);

        let first = driver.poll_once().await;
        assert!(matches!(first, Err(CycleError::Transport(TransportError::Timeout(_)))));

        // The answer to the timed out request shows up before the next poll
        device.write_all(&encode_grgc2_sample(100, 400.0)).await.unwrap();

        let request = DeviceModel::Grgc2.data_request();
        let answer = async {
            let mut requests = vec![0u8; request.len() * 2];
            device.read_exact(&mut requests).await.unwrap();
            device.write_all(&encode_grgc2_sample(5, 400.0)).await.unwrap();
        };
        let (second, ()) = tokio::join!(driver.poll_once(), answer);
        assert_eq!(second.unwrap().reading.raw_counts, Some(5));
        assert_eq!(driver.stats().stale_samples, 1);

        // Nothing is left over to satisfy a request the device never answered
        let third = driver.poll_once().await;
        assert!(matches!(third, Err(CycleError::Transport(TransportError::Timeout(_)))));
        assert_eq!(driver.stats().published, 1);
        assert_eq!(drain(&mut rx).len(), 4);
    }

    #[tokio::test]
    async fn test_reported_dose_bypasses_calibration() {
        let (mut driver, device, mut rx) = driver(DeviceModel::Grgc1);
        let _device = scripted_device(
            device,
            DeviceModel::Grgc1,
            vec![b"{\"cpm\":360,\"cps\":6,\"dose\":0.5,\"voltage\":400}\n".to_vec()],
        );

        let reading = driver.poll_once().await.unwrap().reading;
        assert_eq!(reading.dose_rate, Some(0.5));
        assert_eq!(reading.dose_source, DoseSource::Reported);
        assert!(drain(&mut rx).contains(&(SensorKind::Dose, 0.5)));
    }

    #[tokio::test]
    async fn test_dose_reporting_model_never_calibrates_dose() {
        let (mut driver, device, mut rx) = driver(DeviceModel::Grgc1);
        let _device = scripted_device(device, DeviceModel::Grgc1, vec![b"{\"cpm\":100}\n".to_vec()]);

        let outcome = driver.poll_once().await.unwrap();
        assert_eq!(outcome.reading.dose_rate, None);
        assert_eq!(outcome.reading.dose_source, DoseSource::None);
        assert_eq!(outcome.report.missing, vec![SensorKind::Cps, SensorKind::Dose, SensorKind::Voltage]);
        assert_eq!(drain(&mut rx), vec![(SensorKind::Cpm, 100.0)]);
    }

    #[tokio::test]
    async fn test_settings_report_does_not_end_cycle() {
        let (mut driver, device, _rx) = driver(DeviceModel::Grgc1);
        let _device = scripted_device(
            device,
            DeviceModel::Grgc1,
            vec![b"{\"sound\":0,\"tube\":1}\n{\"cpm\":12}\n".to_vec()],
        );

        let reading = driver.poll_once().await.unwrap().reading;
        assert_eq!(reading.counts_per_minute, Some(12.0));
        assert_eq!(driver.device_settings().and_then(|s| s.tube), Some(1));
        assert_eq!(driver.stats().settings_reports, 1);
    }

    #[tokio::test]
    async fn test_unsolicited_settings_kept_while_draining() {
        let (mut driver, mut device, _rx) = driver(DeviceModel::Grgc1);
        device.write_all(b"{\"sound\":1,\"tube\":3}\n{\"cpm\":99}\n").await.unwrap();
        let _device = scripted_device(device, DeviceModel::Grgc1, vec![b"{\"cpm\":12}\n".to_vec()]);

        let reading = driver.poll_once().await.unwrap().reading;
        assert_eq!(reading.counts_per_minute, Some(12.0));
        assert_eq!(driver.device_settings().and_then(|s| s.tube), Some(3));
        assert_eq!(driver.stats().stale_samples, 1);
    }

    #[tokio::test]
    async fn test_first_sample_configures_device() {
        let (host, device) = tokio::io::duplex(1024);
        let transport = StreamTransport::new(host, FramingType::JsonLine);
        let clock = ManualClock::new();
        let time = Local.with_ymd_and_hms(2024, 12, 31, 23, 59, 58).earliest().unwrap();
        clock.set(time);
        let cfg = DriverConfig {
            sound: Some(true),
            host_address: Some("192.168.1.10".into()),
            ..config(DeviceModel::Grgc1)
        };
        let mut driver = GeigerDriver::new(cfg, Box::new(transport), SinkSet::new())
            .unwrap()
            .with_clock(Arc::new(clock));
        let device = scripted_device(
            device,
            DeviceModel::Grgc1,
            vec![b"{\"cpm\":20}\n".to_vec(), b"{\"cpm\":21}\n".to_vec()],
        );

        driver.poll_once().await.unwrap();
        driver.poll_once().await.unwrap();
        drop(driver);

        let mut expected = GRGC1_GET_DATA.to_vec();
        expected.extend(grgc1_settings_command(true, TubeType::Sbm20, Some("192.168.1.10")).unwrap());
        expected.extend_from_slice(GRGC1_GET_CONFIG);
        expected.extend(grgc1_clock_command(&time).unwrap());
        expected.extend_from_slice(GRGC1_GET_DATA);

        let written = device.await.unwrap();
        assert_eq!(String::from_utf8_lossy(&written), String::from_utf8_lossy(&expected));
    }

    #[tokio::test]
    async fn test_grgc2_rejects_settings_commands() {
        let (mut driver, _device, _rx) = driver(DeviceModel::Grgc2);
        assert!(matches!(
            driver.push_settings().await,
            Err(DriverError::Unsupported { .. })
        ));
        assert!(matches!(driver.sync_clock().await, Err(DriverError::Unsupported { .. })));
    }

    #[tokio::test]
    async fn test_sync_clock_needs_valid_clock() {
        let (driver, _device, _rx) = driver(DeviceModel::Grgc1);
        let mut driver = driver.with_clock(Arc::new(ManualClock::new()));
        assert!(matches!(driver.sync_clock().await, Err(DriverError::Clock(_))));
    }

    #[tokio::test]
    async fn test_setup_flushes_and_requests_settings() {
        let mock = tokio_test::io::Builder::new()
            .write(b"\n")
            .write(GRGC1_GET_CONFIG)
            .build();
        let transport = StreamTransport::new(mock, FramingType::JsonLine);
        let mut driver =
            GeigerDriver::new(config(DeviceModel::Grgc1), Box::new(transport), SinkSet::new())
                .unwrap();
        driver.setup().await.unwrap();
        assert_eq!(driver.stats().clock_syncs, 0);
    }

    #[tokio::test]
    async fn test_setup_sets_device_clock() {
        let time = Local.with_ymd_and_hms(2025, 2, 14, 7, 30, 0).earliest().unwrap();
        let clock = ManualClock::new();
        clock.set(time);

        let mock = tokio_test::io::Builder::new()
            .write(b"\n")
            .write(GRGC1_GET_CONFIG)
            .write(&grgc1_clock_command(&time).unwrap())
            .build();
        let transport = StreamTransport::new(mock, FramingType::JsonLine);
        let mut driver =
            GeigerDriver::new(config(DeviceModel::Grgc1), Box::new(transport), SinkSet::new())
                .unwrap()
                .with_clock(Arc::new(clock));
        driver.setup().await.unwrap();
        assert_eq!(driver.stats().clock_syncs, 1);
    }

    #[tokio::test]
    async fn test_setting_the_clock_resyncs_device() {
        let (host, mut device) = tokio::io::duplex(1024);
        let transport = StreamTransport::new(host, FramingType::JsonLine);
        let clock = ManualClock::new();
        let first = Local.with_ymd_and_hms(2025, 3, 1, 8, 0, 0).earliest().unwrap();
        let second = Local.with_ymd_and_hms(2025, 3, 1, 9, 30, 0).earliest().unwrap();
        clock.set(first);
        let mut driver =
            GeigerDriver::new(config(DeviceModel::Grgc1), Box::new(transport), SinkSet::new())
                .unwrap()
                .with_clock(Arc::new(clock.clone()));

        driver.setup().await.unwrap();

        let shutdown = CancellationToken::new();
        let first_command = grgc1_clock_command(&first).unwrap();
        let second_command = grgc1_clock_command(&second).unwrap();
        let device_side = async {
            let mut written = Vec::new();
            read_until(&mut device, &mut written, &first_command).await;
            clock.set(second);
            read_until(&mut device, &mut written, &second_command).await;
            shutdown.cancel();
        };
        let (stats, ()) = tokio::join!(driver.run(shutdown.clone()), device_side);

        assert_eq!(stats.clock_syncs, 2);
        assert_eq!(driver.state(), PollState::Idle);
    }

    #[tokio::test]
    async fn test_one_cycle_in_flight() {
        let (mut driver, mut device, mut rx) = driver(DeviceModel::Grgc2);

        // Drop the cycle while it waits for a response
        let pending = tokio::time::timeout(Duration::from_millis(10), driver.poll_once()).await;
        assert!(pending.is_err());
        assert_eq!(driver.state(), PollState::Polling);
        assert!(matches!(driver.poll_once().await, Err(CycleError::Busy(_))));

        driver.abandon_cycle();
        assert_eq!(driver.state(), PollState::Idle);
        assert_eq!(driver.stats().abandoned, 1);

        let mut abandoned_request = vec![0u8; DeviceModel::Grgc2.data_request().len()];
        device.read_exact(&mut abandoned_request).await.unwrap();
        let _device = scripted_device(device, DeviceModel::Grgc2, vec![encode_grgc2_sample(3, 400.0)]);

        assert!(driver.poll_once().await.is_ok());
        assert_eq!(drain(&mut rx).len(), 4);
    }

    #[tokio::test]
    async fn test_disconnect_is_skipped() {
        let (mut driver, device, _rx) = driver(DeviceModel::Grgc1);
        drop(device);

        let result = driver.poll_once().await;
        assert!(matches!(result, Err(CycleError::Transport(_))));
        assert_eq!(driver.state(), PollState::Idle);
        assert_eq!(driver.stats().link_errors, 1);
    }
}
