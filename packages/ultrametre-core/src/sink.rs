//! Destination for decoded telemetry outside the live event stream.

use crate::serial::TelemetryRecord;

/// Receives every telemetry record the bridge decodes.
///
/// Called inline from the inbound pipeline, so implementations must not block.
/// Anything slow (a warehouse insert, say) belongs behind a channel.
pub trait TelemetrySink: Send + Sync {
    fn record(&self, record: &TelemetryRecord);
}

/// Writes each record to the log at debug level.
#[derive(Debug, Default, Clone, Copy)]
pub struct LogSink;

impl TelemetrySink for LogSink {
    fn record(&self, record: &TelemetryRecord) {
        log::debug!(
            "[sink] distance={} angle={} x={:.3} y={:.3}",
            record.distance,
            record.angle_degrees,
            record.x_coord,
            record.y_coord
        );
    }
}
