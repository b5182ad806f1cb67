//! Per-epoch training metrics and the sinks that record them

use crate::error::Result;
use serde::Serialize;
use std::fs::File;
use std::io::Write;
use std::path::Path;

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct EpochMetrics {
    pub epoch: usize,
    pub loss: f64,
    pub accuracy: f64,
    pub val_loss: Option<f64>,
    pub val_accuracy: Option<f64>,
}

/// Destination for training metrics, handed to `Model::fit`
pub trait MetricsSink {
    fn record(&mut self, metrics: &EpochMetrics) -> Result<()>;
}

/// Emits one structured log event per epoch
pub struct TracingSink;

impl MetricsSink for TracingSink {
    fn record(&mut self, metrics: &EpochMetrics) -> Result<()> {
        tracing::info!(
            epoch = metrics.epoch,
            loss = metrics.loss,
            accuracy = metrics.accuracy,
            val_loss = ?metrics.val_loss,
            val_accuracy = ?metrics.val_accuracy,
            "epoch finished"
        );

        Ok(())
    }
}

/// Writes a CSV row per epoch, flushing after each one so a crashed run keeps its history
pub struct CsvSink<W: Write> {
    writer: csv::Writer<W>,
}

impl CsvSink<File> {
    pub fn create(path: &Path) -> Result<Self> {
        Ok(CsvSink::from_writer(File::create(path)?))
    }
}

impl<W: Write> CsvSink<W> {
    pub fn from_writer(writer: W) -> Self {
        CsvSink {
            writer: csv::Writer::from_writer(writer),
        }
    }
}

impl<W: Write> MetricsSink for CsvSink<W> {
    fn record(&mut self, metrics: &EpochMetrics) -> Result<()> {
        self.writer.serialize(metrics)?;
        self.writer.flush()?;

        Ok(())
    }
}

/// Forwards every record to each of its sinks
#[derive(Default)]
pub struct MultiSink {
    sinks: Vec<Box<dyn MetricsSink>>,
}

impl MultiSink {
    pub fn push(&mut self, sink: Box<dyn MetricsSink>) {
        self.sinks.push(sink);
    }
}

impl MetricsSink for MultiSink {
    fn record(&mut self, metrics: &EpochMetrics) -> Result<()> {
        for sink in self.sinks.iter_mut() {
            sink.record(metrics)?;
        }

        Ok(())
    }
}

/// Keeps the history in memory
impl MetricsSink for Vec<EpochMetrics> {
    fn record(&mut self, metrics: &EpochMetrics) -> Result<()> {
        self.push(metrics.clone());

        Ok(())
    }
}
