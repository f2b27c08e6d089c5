pub mod normalize;

use crate::pipeline::{Envelope, PipelineError, PointBatch, Transform};
use ledger_client::domain::TelemetryPoint;
use time::macros::date;

pub use normalize::{DecodeFailure, Normalizer};

/// Pure validation of a single `TelemetryPoint`.
///
/// Rules:
/// - the counter must be non-negative.
/// - the captured day must be within [2000-01-01, 2100-01-01).
pub fn validate_point(point: &TelemetryPoint) -> Result<(), PipelineError> {
    if point.raw_counter_value < 0 {
        return Err(PipelineError::Transform("counter must be non-negative".to_string()));
    }

    let min_day = date!(2000 - 01 - 01);
    let max_day = date!(2100 - 01 - 01);

    if point.captured_day < min_day || point.captured_day >= max_day {
        return Err(PipelineError::Transform("captured day out of allowed range".to_string()));
    }

    Ok(())
}

/// Drops invalid points from a batch; the rest of the batch goes on.
#[derive(Clone, Default)]
pub struct PointValidation;

#[async_trait::async_trait]
impl Transform<PointBatch, PointBatch> for PointValidation {
    async fn apply(&self, mut input: Envelope<PointBatch>) -> Result<Envelope<PointBatch>, PipelineError> {
        let message_id = input.payload.message_id.clone();
        input.payload.points.retain(|point| match validate_point(point) {
            Ok(()) => true,
            Err(e) => {
                metrics::counter!("validation_points_rejected_total").increment(1);
                tracing::warn!(
                    %message_id,
                    unit = %point.unit.key,
                    mode = %point.energy_mode,
                    value = point.raw_counter_value,
                    day = %point.captured_day,
                    error = %e,
                    "skipping invalid point"
                );
                false
            }
        });
        Ok(input)
    }
}

#[cfg(test)]
mod tests {
    use ledger_client::domain::{EnergyMode, Unit};
    use time::Date;

    use super::*;
    use crate::pipeline::DecodeTier;

    fn point(value: i64, day: Date) -> TelemetryPoint {
        TelemetryPoint {
            unit: Unit::parse("9-1-3104"),
            energy_mode: EnergyMode::Heating,
            raw_counter_value: value,
            source_address: None,
            captured_day: day,
            success: true,
            message: String::new(),
        }
    }

    #[test]
    fn accepts_valid_point() {
        assert!(validate_point(&point(1, date!(2024 - 01 - 01))).is_ok());
    }

    #[test]
    fn rejects_negative_counter() {
        let res = validate_point(&point(-1, date!(2024 - 01 - 01)));
        assert!(matches!(res, Err(PipelineError::Transform(_))));
    }

    #[test]
    fn rejects_out_of_range_day() {
        assert!(validate_point(&point(1, date!(1999 - 12 - 31))).is_err());
        assert!(validate_point(&point(1, date!(2100 - 01 - 01))).is_err());
    }

    #[tokio::test]
    async fn validation_keeps_the_rest_of_the_batch() {
        let env = Envelope::now(PointBatch {
            message_id: "m".to_string(),
            topic: "/gw/1".to_string(),
            tier: DecodeTier::Strict,
            points: vec![point(5, date!(2024 - 01 - 01)), point(-5, date!(2024 - 01 - 01))],
        });

        let out = PointValidation.apply(env).await.unwrap();
        assert_eq!(out.payload.points.len(), 1);
        assert_eq!(out.payload.points[0].raw_counter_value, 5);
    }
}
