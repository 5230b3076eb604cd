use chrono::{DateTime, Local};
use resources::objects::gpa::{CronMetricSpec, GeneralPodAutoscaler};

use super::cron::{final_match_and_mismatch, parse_standard_with_year};

/// Resolves which cron window is active at the current instant and
/// which replica bounds apply while it lasts.
pub struct CronMetricsScaler {
    ranges: Vec<CronMetricSpec>,
    default_set: Option<CronMetricSpec>,
    now: DateTime<Local>,
}

impl CronMetricsScaler {
    pub fn new(specs: &[CronMetricSpec]) -> Self {
        Self::at(specs, Local::now())
    }

    fn at(specs: &[CronMetricSpec], now: DateTime<Local>) -> Self {
        let mut default_set = None;
        let mut ranges = Vec::new();
        for spec in specs {
            if spec.schedule == "default" {
                default_set.get_or_insert_with(|| spec.clone());
            } else {
                ranges.push(spec.clone());
            }
        }
        Self {
            ranges,
            default_set,
            now,
        }
    }

    /// The replica bounds and schedule name applying at `now`,
    /// as `(max, min, schedule)`. Falls back to the `default` entry
    /// when no schedule is active, and to the autoscaler's own bounds
    /// when the default entry is missing altogether.
    pub fn get_current_max_and_min_replicas(
        &self,
        gpa: &GeneralPodAutoscaler,
    ) -> (u32, u32, String) {
        let Some(default_set) = &self.default_set else {
            tracing::warn!(
                "Gpa {} has no default cron schedule set",
                gpa.metadata.name
            );
            return (
                gpa.spec.max_replicas,
                gpa.spec.min_replicas.unwrap_or(1),
                "default".to_string(),
            );
        };
        let default_bounds = (
            default_set.max_replicas,
            default_set.min_replicas.unwrap_or(1),
            default_set.schedule.clone(),
        );

        let mut active = Vec::new();
        for spec in &self.ranges {
            match self.is_active(&spec.schedule) {
                Ok(true) => active.push(spec),
                Ok(false) => {},
                Err(e) => {
                    // a schedule that cannot be evaluated must not
                    // shrink the target to zero, keep the default bounds
                    tracing::error!(
                        "Failed to evaluate schedule {}: {:#}",
                        spec.schedule,
                        e
                    );
                    return default_bounds;
                },
            }
        }
        if active.is_empty() {
            return default_bounds;
        }

        let mut best: Option<&CronMetricSpec> = None;
        for spec in active {
            // later entries win priority ties
            if best.map_or(true, |b| spec.priority >= b.priority) {
                best = Some(spec);
            }
        }
        match best {
            Some(best) => {
                tracing::info!(
                    "Schedule {} recommends max: {}, min: {:?}, priority: {}",
                    best.schedule,
                    best.max_replicas,
                    best.min_replicas,
                    best.priority
                );
                (
                    best.max_replicas,
                    best.min_replicas.unwrap_or(1),
                    best.schedule.clone(),
                )
            },
            None => default_bounds,
        }
    }

    /// The cron metric specs tagged with the given schedule.
    pub fn get_current_cron_metric_specs(
        &self,
        gpa: &GeneralPodAutoscaler,
        schedule: &str,
    ) -> Vec<CronMetricSpec> {
        gpa.spec
            .cron_metric
            .as_ref()
            .map(|mode| {
                mode.cron_metrics
                    .iter()
                    .filter(|spec| spec.schedule == schedule)
                    .cloned()
                    .collect()
            })
            .unwrap_or_default()
    }

    fn is_active(&self, schedule: &str) -> anyhow::Result<bool> {
        let (year, sched) = parse_standard_with_year(schedule)?;
        Ok(final_match_and_mismatch(&sched, year, self.now).is_some())
    }
}

#[cfg(test)]
mod tests {
    use chrono::{Datelike, TimeZone};
    use resources::objects::{
        gpa::{CronMetricMode, GpaSpec, GpaStatus},
        object_reference::ObjectReference,
        Metadata,
    };

    use super::*;

    fn spec(schedule: &str, min: u32, max: u32) -> CronMetricSpec {
        spec_with_priority(schedule, min, max, 0)
    }

    fn spec_with_priority(schedule: &str, min: u32, max: u32, priority: i32) -> CronMetricSpec {
        CronMetricSpec {
            schedule: schedule.to_string(),
            min_replicas: Some(min),
            max_replicas: max,
            priority,
            metric: None,
        }
    }

    fn gpa_with(specs: Vec<CronMetricSpec>) -> GeneralPodAutoscaler {
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
                cron_metric: Some(CronMetricMode {
                    cron_metrics: specs,
                }),
                time: None,
                webhook: None,
                event: None,
                behavior: None,
            },
            status: GpaStatus::default(),
        }
    }

    fn today_at(h: u32, mi: u32, s: u32) -> DateTime<Local> {
        let today = Local::now();
        Local
            .with_ymd_and_hms(today.year(), today.month(), today.day(), h, mi, s)
            .unwrap()
    }

    fn resolve_at(
        specs: Vec<CronMetricSpec>,
        now: DateTime<Local>,
    ) -> (u32, u32, String) {
        let gpa = gpa_with(specs.clone());
        let scaler = CronMetricsScaler::at(&specs, now);
        scaler.get_current_max_and_min_replicas(&gpa)
    }

    #[test]
    fn selects_window_just_after_entry() {
        let (max, min, schedule) = resolve_at(
            vec![
                spec("5-59 10-12 * * *", 5, 7),
                spec("0-4 9-10 * * *", 6, 8),
                spec("default", 9, 10),
            ],
            today_at(9, 0, 1),
        );
        assert_eq!((min, max), (6, 8));
        assert_eq!(schedule, "0-4 9-10 * * *");
    }

    #[test]
    fn selects_window_near_its_end() {
        let (max, min, schedule) = resolve_at(
            vec![
                spec("5-59 10-12 * * *", 5, 7),
                spec("0-4 9-10 * * *", 6, 8),
                spec("default", 9, 10),
            ],
            today_at(9, 4, 41),
        );
        assert_eq!((min, max), (6, 8));
        assert_eq!(schedule, "0-4 9-10 * * *");
    }

    #[test]
    fn selects_window_across_hours() {
        let (max, min, schedule) = resolve_at(
            vec![
                spec("0-4 10-12 * * *", 5, 7),
                spec("0-59 9-10 * * *", 6, 8),
                spec("0-4 13-14 * * *", 11, 12),
                spec("default", 9, 10),
            ],
            today_at(13, 4, 41),
        );
        assert_eq!(schedule, "0-4 13-14 * * *");
        assert_eq!((min, max), (11, 12));
    }

    #[test]
    fn keeps_closing_window_on_its_final_minute() {
        let (max, min, schedule) = resolve_at(
            vec![
                spec("15-59 19 * * *", 5, 7),
                spec("0-59 20-21 * * *", 6, 8),
                spec("0-4 22 * * *", 11, 12),
                spec("default", 9, 10),
            ],
            today_at(19, 59, 2),
        );
        assert_eq!(schedule, "15-59 19 * * *");
        assert_eq!((min, max), (5, 7));
    }

    #[test]
    fn keeps_window_until_the_last_second() {
        let (max, min, schedule) = resolve_at(
            vec![
                spec("15-59 19 * * *", 5, 7),
                spec("0-59 20-21 * * *", 6, 8),
                spec("0-4 22 * * *", 11, 12),
                spec("default", 9, 10),
            ],
            today_at(22, 4, 59),
        );
        assert_eq!(schedule, "0-4 22 * * *");
        assert_eq!((min, max), (11, 12));
    }

    #[test]
    fn falls_back_to_default_right_after_the_window() {
        let (max, min, schedule) = resolve_at(
            vec![
                spec("15-59 19 * * *", 5, 7),
                spec("0-59 20-21 * * *", 6, 8),
                spec("0-4 22 * * *", 11, 12),
                spec("default", 9, 10),
            ],
            today_at(22, 5, 0),
        );
        assert_eq!(schedule, "default");
        assert_eq!((min, max), (9, 10));
    }

    #[test]
    fn last_minute_of_the_day_stays_active() {
        let (max, min, schedule) = resolve_at(
            vec![
                spec("55-59 23 * * *", 5, 7),
                spec("0-9 0 * * *", 6, 8),
                spec("0-4 22 * * *", 11, 12),
                spec("default", 9, 10),
            ],
            today_at(23, 59, 2),
        );
        assert_eq!(schedule, "55-59 23 * * *");
        assert_eq!((min, max), (5, 7));
    }

    #[test]
    fn falls_back_to_default_between_windows() {
        let (max, min, schedule) = resolve_at(
            vec![
                spec("0-4 10-12 * * *", 5, 7),
                spec("0-59 9-10 * * *", 6, 8),
                spec("0-4 13-14 * * *", 11, 12),
                spec("default", 9, 10),
            ],
            today_at(14, 5, 41),
        );
        assert_eq!(schedule, "default");
        assert_eq!((min, max), (9, 10));
    }

    #[test]
    fn hour_long_window_is_active_throughout() {
        let specs = vec![
            spec("0-59 12 * * *", 5, 7),
            spec("30-59 13-16 * * *", 6, 8),
            spec("default", 9, 10),
        ];
        for now in [today_at(12, 58, 59), today_at(12, 59, 41)] {
            let (max, min, schedule) = resolve_at(specs.clone(), now);
            assert_eq!(schedule, "0-59 12 * * *");
            assert_eq!((min, max), (5, 7));
        }
    }

    #[test]
    fn year_bound_schedule_is_skipped_in_other_years() {
        let (max, min, schedule) = resolve_at(
            vec![
                spec_with_priority("* 20-22 1 10 * 2023", 5, 7, 100),
                spec("default", 9, 10),
            ],
            Local.with_ymd_and_hms(2024, 10, 1, 20, 0, 1).unwrap(),
        );
        assert_eq!(schedule, "default");
        assert_eq!((min, max), (9, 10));
    }

    #[test]
    fn higher_priority_wins_among_active_schedules() {
        let (max, min, schedule) = resolve_at(
            vec![
                spec_with_priority("* 20-22 1 10 * 2023", 5, 7, 100),
                spec_with_priority("* 20-22 1 10 *", 6, 8, 200),
                spec("default", 9, 10),
            ],
            Local.with_ymd_and_hms(2023, 10, 1, 20, 0, 1).unwrap(),
        );
        assert_eq!(schedule, "* 20-22 1 10 *");
        assert_eq!((min, max), (6, 8));
    }

    #[test]
    fn current_specs_are_filtered_by_schedule() {
        let specs = vec![
            spec("0-4 9-10 * * *", 6, 8),
            spec("5-59 10-12 * * *", 5, 7),
            spec("default", 9, 10),
        ];
        let gpa = gpa_with(specs.clone());
        let scaler = CronMetricsScaler::at(&specs, today_at(9, 0, 1));
        let current = scaler.get_current_cron_metric_specs(&gpa, "0-4 9-10 * * *");
        assert_eq!(current.len(), 1);
        assert_eq!(current[0].schedule, "0-4 9-10 * * *");
    }

    #[test]
    fn missing_default_falls_back_to_spec_bounds() {
        let specs = vec![spec("0-4 9-10 * * *", 6, 8)];
        let gpa = gpa_with(specs.clone());
        let scaler = CronMetricsScaler::at(&specs, today_at(15, 30, 0));
        let (max, min, schedule) = scaler.get_current_max_and_min_replicas(&gpa);
        assert_eq!(schedule, "default");
        assert_eq!((min, max), (1, 10));
    }
}
