use anyhow::Result;
use resources::objects::gpa::GeneralPodAutoscaler;

mod cron;
mod cron_metrics;
mod time;
mod webhook;

pub use cron::parse_standard_with_year;
pub use cron_metrics::CronMetricsScaler;
pub use time::TimeScaler;
pub use webhook::WebhookScaler;

pub const WEBHOOK: &str = "webhook";
pub const TIME: &str = "time";

/// One link of the scaler chain. The set of driving modes is closed,
/// so the chain is a list of variants rather than trait objects.
pub enum Scaler {
    Webhook(WebhookScaler),
    Time(TimeScaler),
}

impl Scaler {
    pub fn name(&self) -> &'static str {
        match self {
            Scaler::Webhook(_) => WEBHOOK,
            Scaler::Time(_) => TIME,
        }
    }

    pub async fn get_replicas(
        &self,
        gpa: &GeneralPodAutoscaler,
        current_replicas: u32,
    ) -> Result<u32> {
        match self {
            Scaler::Webhook(scaler) => scaler.get_replicas(gpa, current_replicas).await,
            Scaler::Time(scaler) => scaler.get_replicas(gpa, current_replicas),
        }
    }
}
