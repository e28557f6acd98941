//! Output sinks
//!
//! Each field of a reading may be bound to one sink. Bindings are
//! independent: a sink that fails does not keep the others from receiving
//! their value, and nothing carries over to the next cycle.

use super::reading::{Reading, SensorKind};
use chrono::{DateTime, Local};
use serde::Serialize;
use std::fmt;
use std::sync::Arc;
use thiserror::Error;
use tokio::sync::mpsc;

/// Sink error types
#[derive(Error, Debug)]
pub enum SinkError {
    /// Downstream consumer cannot take the value
    #[error("Sink unavailable: {0}")]
    Unavailable(String),

    /// I/O error
    #[error("Sink I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Value could not be encoded
    #[error("Sink encoding error: {0}")]
    Encoding(String),
}

/// A value handed to a sink, tagged with its sensor metadata
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct PublishedValue {
    /// Sensor name
    pub name: String,
    /// Quantity
    pub kind: SensorKind,
    /// Unit of measurement
    pub unit: &'static str,
    /// Value
    pub value: f64,
    /// Display precision
    pub accuracy_decimals: u8,
    /// Capture time of the reading
    pub timestamp: Option<DateTime<Local>>,
}

impl PublishedValue {
    /// Value rounded to the display precision
    pub fn formatted(&self) -> String {
        format!("{:.*}", usize::from(self.accuracy_decimals), self.value)
    }
}

impl fmt::Display for PublishedValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}: {} {}", self.name, self.formatted(), self.unit)
    }
}

/// Consumer of published sensor values
pub trait SensorSink: Send + Sync {
    /// Publish one value
    fn publish(&self, value: &PublishedValue) -> Result<(), SinkError>;
}

/// Binding of one reading field to a sink
#[derive(Clone)]
pub struct SinkBinding {
    name: String,
    kind: SensorKind,
    accuracy_decimals: u8,
    sink: Arc<dyn SensorSink>,
}

impl SinkBinding {
    /// Bind `kind` to `sink` with the kind's default name and precision
    pub fn new(kind: SensorKind, sink: Arc<dyn SensorSink>) -> Self {
        Self {
            name: kind.default_name().to_string(),
            kind,
            accuracy_decimals: kind.default_accuracy_decimals(),
            sink,
        }
    }

    /// Set the sensor name
    #[must_use]
    pub fn name(mut self, name: impl Into<String>) -> Self {
        self.name = name.into();
        self
    }

    /// Set the display precision
    #[must_use]
    pub fn accuracy_decimals(mut self, decimals: u8) -> Self {
        self.accuracy_decimals = decimals;
        self
    }

    /// Bound quantity
    pub fn kind(&self) -> SensorKind {
        self.kind
    }

    /// Sensor name
    pub fn sensor_name(&self) -> &str {
        &self.name
    }

    fn publish(&self, value: f64, timestamp: Option<DateTime<Local>>) -> Result<(), SinkError> {
        self.sink.publish(&PublishedValue {
            name: self.name.clone(),
            kind: self.kind,
            unit: self.kind.unit(),
            value,
            accuracy_decimals: self.accuracy_decimals,
            timestamp,
        })
    }
}

impl fmt::Debug for SinkBinding {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SinkBinding")
            .field("name", &self.name)
            .field("kind", &self.kind)
            .field("accuracy_decimals", &self.accuracy_decimals)
            .finish_non_exhaustive()
    }
}

/// Outcome of publishing one reading
#[derive(Debug, Default)]
pub struct PublishReport {
    /// Sinks that received their value
    pub delivered: Vec<SensorKind>,
    /// Bound sinks whose field the reading did not carry
    pub missing: Vec<SensorKind>,
    /// Sinks that rejected their value
    pub failed: Vec<(SensorKind, SinkError)>,
}

impl PublishReport {
    /// Whether every bound sink with a value received it
    pub fn is_complete(&self) -> bool {
        self.failed.is_empty()
    }
}

/// Optional sink per reading field
#[derive(Debug, Clone, Default)]
pub struct SinkSet {
    /// Counts per minute
    pub cpm: Option<SinkBinding>,
    /// Counts per second
    pub cps: Option<SinkBinding>,
    /// Dose rate
    pub dose: Option<SinkBinding>,
    /// Supply voltage
    pub voltage: Option<SinkBinding>,
}

impl SinkSet {
    /// Create an empty set
    pub fn new() -> Self {
        Self::default()
    }

    /// Bind a sink to the field its kind names, replacing any previous one
    #[must_use]
    pub fn with(mut self, binding: SinkBinding) -> Self {
        let kind = binding.kind;
        *self.slot_mut(kind) = Some(binding);
        self
    }

    /// Binding for a field
    pub fn get(&self, kind: SensorKind) -> Option<&SinkBinding> {
        match kind {
            SensorKind::Cpm => self.cpm.as_ref(),
            SensorKind::Cps => self.cps.as_ref(),
            SensorKind::Dose => self.dose.as_ref(),
            SensorKind::Voltage => self.voltage.as_ref(),
        }
    }

    fn slot_mut(&mut self, kind: SensorKind) -> &mut Option<SinkBinding> {
        match kind {
            SensorKind::Cpm => &mut self.cpm,
            SensorKind::Cps => &mut self.cps,
            SensorKind::Dose => &mut self.dose,
            SensorKind::Voltage => &mut self.voltage,
        }
    }

    /// Number of bound fields
    pub fn len(&self) -> usize {
        SensorKind::all().iter().filter(|k| self.get(**k).is_some()).count()
    }

    /// Whether no field is bound
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Push every bound field of `reading` to its sink
    pub fn publish(&self, reading: &Reading) -> PublishReport {
        let mut report = PublishReport::default();

        for &kind in SensorKind::all() {
            let Some(binding) = self.get(kind) else {
                continue;
            };
            let Some(value) = reading.value(kind) else {
                report.missing.push(kind);
                continue;
            };
            match binding.publish(value, reading.captured_at) {
                Ok(()) => report.delivered.push(kind),
                Err(e) => {
                    tracing::warn!(sensor = %binding.name, error = %e, "sink rejected value");
                    report.failed.push((kind, e));
                }
            }
        }

        report
    }
}

/// Sink writing each value as a structured log event
#[derive(Debug, Clone, Copy, Default)]
pub struct LogSink;

impl SensorSink for LogSink {
    fn publish(&self, value: &PublishedValue) -> Result<(), SinkError> {
        tracing::info!(
            target: "geiger::reading",
            sensor = %value.name,
            kind = %value.kind,
            value = %value.formatted(),
            unit = value.unit,
            "reading"
        );
        Ok(())
    }
}

/// Sink forwarding values into a bounded channel
///
/// A full or closed channel rejects the value.
#[derive(Debug, Clone)]
pub struct ChannelSink {
    tx: mpsc::Sender<PublishedValue>,
}

impl ChannelSink {
    /// Create a sink and the receiving end of its channel
    pub fn new(capacity: usize) -> (Self, mpsc::Receiver<PublishedValue>) {
        let (tx, rx) = mpsc::channel(capacity.max(1));
        (Self { tx }, rx)
    }
}

impl SensorSink for ChannelSink {
    fn publish(&self, value: &PublishedValue) -> Result<(), SinkError> {
        self.tx.try_send(value.clone()).map_err(|e| match e {
            mpsc::error::TrySendError::Full(_) => SinkError::Unavailable("channel full".into()),
            mpsc::error::TrySendError::Closed(_) => {
                SinkError::Unavailable("channel closed".into())
            }
        })
    }
}

/// Sink forwarding each value to several sinks
///
/// Every inner sink is tried; the first failure is returned.
#[derive(Clone, Default)]
pub struct FanoutSink {
    sinks: Vec<Arc<dyn SensorSink>>,
}

impl FanoutSink {
    /// Create an empty fan-out
    pub fn new() -> Self {
        Self::default()
    }

    /// Add a sink
    #[must_use]
    pub fn with(mut self, sink: Arc<dyn SensorSink>) -> Self {
        self.sinks.push(sink);
        self
    }

    /// Number of inner sinks
    pub fn len(&self) -> usize {
        self.sinks.len()
    }

    /// Whether there are no inner sinks
    pub fn is_empty(&self) -> bool {
        self.sinks.is_empty()
    }
}

impl SensorSink for FanoutSink {
    fn publish(&self, value: &PublishedValue) -> Result<(), SinkError> {
        let mut first_error = None;
        for sink in &self.sinks {
            if let Err(e) = sink.publish(value) {
                first_error.get_or_insert(e);
            }
        }
        first_error.map_or(Ok(()), Err)
    }
}
