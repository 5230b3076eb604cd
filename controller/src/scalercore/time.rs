use anyhow::Result;
use chrono::{DateTime, Local};
use resources::objects::gpa::{GeneralPodAutoscaler, TimeRange};

use super::cron::{final_match_and_mismatch, parse_standard_with_year};

/// Proposes a fixed replica count while one of its time ranges is active.
pub struct TimeScaler {
    ranges: Vec<TimeRange>,
    now: DateTime<Local>,
}

impl TimeScaler {
    pub fn new(ranges: Vec<TimeRange>) -> Self {
        Self {
            ranges,
            now: Local::now(),
        }
    }

    #[cfg(test)]
    fn at(ranges: Vec<TimeRange>, now: DateTime<Local>) -> Self {
        Self {
            ranges,
            now,
        }
    }

    /// The largest desired count among active ranges,
    /// or the current count when none is active.
    pub fn get_replicas(
        &self,
        _gpa: &GeneralPodAutoscaler,
        current_replicas: u32,
    ) -> Result<u32> {
        let mut desired = 0;
        for range in &self.ranges {
            let (year, schedule) = parse_standard_with_year(&range.schedule)?;
            if final_match_and_mismatch(&schedule, year, self.now).is_none() {
                continue;
            }
            if range.desired_replicas > desired {
                desired = range.desired_replicas;
            }
            tracing::debug!(
                "Time range {} proposes {} replicas",
                range.schedule,
                range.desired_replicas
            );
        }
        if desired == 0 {
            return Ok(current_replicas);
        }
        Ok(desired)
    }
}

#[cfg(test)]
mod tests {
    use chrono::TimeZone;
    use resources::objects::{
        gpa::{GpaSpec, GpaStatus},
        object_reference::ObjectReference,
        Metadata,
    };

    use super::*;

    fn gpa() -> GeneralPodAutoscaler {
        GeneralPodAutoscaler {
            metadata: Metadata {
                name: "squad".to_string(),
                namespace: "default".to_string(),
                uid: None,
                labels: Default::default(),
                annotations: Default::default(),
                owner_references: Vec::new(),
            },
            spec: GpaSpec {
                scale_target_ref: ObjectReference {
                    api_version: None,
                    kind: "ReplicaSet".to_string(),
                    name: "squad".to_string(),
                },
                min_replicas: Some(1),
                max_replicas: 10,
                metric: None,
                cron_metric: None,
                time: None,
                webhook: None,
                event: None,
                behavior: None,
            },
            status: GpaStatus::default(),
        }
    }

    fn range(schedule: &str, desired_replicas: u32) -> TimeRange {
        TimeRange {
            schedule: schedule.to_string(),
            desired_replicas,
        }
    }

    #[test]
    fn active_range_wins_over_current() -> Result<()> {
        let now = Local.with_ymd_and_hms(2023, 5, 2, 9, 0, 30).unwrap();
        let scaler = TimeScaler::at(
            vec![range("0-59 9-10 * * *", 6), range("0-4 20 * * *", 8)],
            now,
        );
        assert_eq!(scaler.get_replicas(&gpa(), 3)?, 6);
        Ok(())
    }

    #[test]
    fn overlapping_ranges_take_the_max() -> Result<()> {
        let now = Local.with_ymd_and_hms(2023, 5, 2, 9, 0, 30).unwrap();
        let scaler = TimeScaler::at(
            vec![range("0-59 9 * * *", 6), range("0-30 9 * * *", 9)],
            now,
        );
        assert_eq!(scaler.get_replicas(&gpa(), 3)?, 9);
        Ok(())
    }

    #[test]
    fn no_active_range_keeps_current() -> Result<()> {
        let now = Local.with_ymd_and_hms(2023, 5, 2, 15, 30, 0).unwrap();
        let scaler = TimeScaler::at(vec![range("0-4 20 * * *", 8)], now);
        assert_eq!(scaler.get_replicas(&gpa(), 3)?, 3);
        Ok(())
    }
}
