use std::{
    cmp::{max, min, Ordering},
    collections::{HashMap, HashSet},
    panic::AssertUnwindSafe,
    sync::Arc,
};

use anyhow::{anyhow, Error, Result};
use chrono::{Duration, Local, NaiveDateTime};
use futures_delay_queue::{delay_queue, DelayQueue};
use futures_intrusive::{buffer::GrowingHeapBuf, channel::shared::GenericReceiver};
use futures_util::FutureExt;
use parking_lot::{Mutex, RawMutex};
use resources::{
    informer::{EventHandler, Informer, ResyncHandler, Store},
    objects::{
        gpa::{
            ContainerResourceMetricStatus, CronMetricSpec, ExternalMetricStatus,
            GeneralPodAutoscaler, GpaBehavior,
            GpaConditionType::{AbleToScale, ScalingActive, ScalingLimited},
            GpaScalingRules, GpaStatus, MetricSpec, MetricStatus, MetricTarget, MetricValueStatus,
            ObjectMetricStatus, PodsMetricStatus, PolicySelection, ResourceMetricStatus,
            ScalingPolicyType,
        },
        metrics::Resource,
        pod::Pod,
        scale::Scale,
        Labels, Object,
    },
};
use serde::Serialize;
use tokio::{
    select,
    sync::{
        mpsc::{self, Receiver, Sender},
        watch,
    },
    task::JoinHandle,
};

use crate::{
    replica_calculator::ReplicaCalculator,
    scalercore::{CronMetricsScaler, Scaler, TimeScaler, WebhookScaler},
    utils::{self, EventRecorder, EventType, RestMapper},
    validation, CONFIG,
};

/// A single reconcile may at most double the target, and may always
/// add up to this many pods, when no explicit behavior is set.
const SCALE_UP_LIMIT_FACTOR: f64 = 2.0;
const SCALE_UP_LIMIT_MINIMUM: f64 = 4.0;

#[derive(Debug, Clone)]
struct TimestampedRecommendation {
    recommendation: u32,
    timestamp: NaiveDateTime,
}

#[derive(Debug, Clone)]
struct TimestampedScaleEvent {
    replica_change: u32,
    timestamp: NaiveDateTime,
    outdated: bool,
}

/// Structured payload attached to SuccessfulRescale events.
#[derive(Debug, Serialize)]
struct RescalePayload {
    old_replicas: u32,
    new_replicas: u32,
    min_replicas: u32,
    max_replicas: u32,
    cpu_request_of_changes: f32,
    cpu_limits_of_changes: f32,
    mem_request_of_changes: f32,
    mem_limits_of_changes: f32,
    reason: String,
}

#[derive(Debug)]
struct ResyncNotification;

/// A metric that could not produce a proposal, carrying the condition
/// the caller should surface when no metric succeeds.
struct MetricFailure {
    reason: String,
    message: String,
    error: Error,
}

/// Everything between functions of the behavior normalizer
/// as one structure.
struct NormalizationArg {
    key: String,
    scale_up: GpaScalingRules,
    scale_down: GpaScalingRules,
    min_replicas: u32,
    max_replicas: u32,
    current_replicas: u32,
    desired_replicas: u32,
}

/// Synchronizes GPA objects with the workloads they target:
/// watches them, recomputes the desired replica count on a fixed
/// cadence and commits both the scale and the status.
pub struct GeneralController {
    rx: Receiver<String>,
    resync_rx: Receiver<ResyncNotification>,
    gpa_informer: Option<JoinHandle<Result<(), Error>>>,
    pod_informer: Option<JoinHandle<Result<(), Error>>>,
    inner: Arc<ControllerInner>,
}

/// The state shared by the reconcile workers.
struct ControllerInner {
    gpa_store: Store<GeneralPodAutoscaler>,
    pod_store: Store<Pod>,
    replica_calc: ReplicaCalculator,
    recorder: EventRecorder,
    mapper: RestMapper,
    downscale_stabilisation_window: Duration,

    /// Latest unstabilized recommendations for each autoscaler.
    recommendations: Mutex<HashMap<String, Vec<TimestampedRecommendation>>>,
    /// Latest scale events for each autoscaler, per direction.
    scale_up_events: Mutex<HashMap<String, Vec<TimestampedScaleEvent>>>,
    scale_down_events: Mutex<HashMap<String, Vec<TimestampedScaleEvent>>>,

    work_queue: DelayQueue<String, GrowingHeapBuf<String>>,
    work_queue_rx: GenericReceiver<RawMutex, String, GrowingHeapBuf<String>>,
    in_queue: Mutex<HashSet<String>>,
    shutdown: watch::Sender<bool>,
}

impl GeneralController {
    pub fn new() -> Self {
        let (tx, rx) = mpsc::channel::<String>(16);
        let (resync_tx, resync_rx) = mpsc::channel::<ResyncNotification>(16);
        let gpa_informer = GeneralController::create_gpa_informer(tx, resync_tx);
        let gpa_store = gpa_informer.get_store();
        let pod_informer = GeneralController::create_pod_informer();
        let pod_store = pod_informer.get_store();

        let gpa_informer = tokio::spawn(async move { gpa_informer.run().await });
        let pod_informer = tokio::spawn(async move { pod_informer.run().await });

        let (work_queue, work_queue_rx) = delay_queue::<String>();
        let (shutdown, _) = watch::channel(false);

        Self {
            rx,
            resync_rx,
            gpa_informer: Some(gpa_informer),
            pod_informer: Some(pod_informer),
            inner: Arc::new(ControllerInner {
                gpa_store,
                pod_store: pod_store.clone(),
                replica_calc: ReplicaCalculator::new(pod_store, CONFIG.tolerance),
                recorder: EventRecorder,
                mapper: RestMapper::new(),
                downscale_stabilisation_window: Duration::seconds(
                    CONFIG.downscale_stabilisation_seconds as i64,
                ),
                recommendations: Mutex::new(HashMap::new()),
                scale_up_events: Mutex::new(HashMap::new()),
                scale_down_events: Mutex::new(HashMap::new()),
                work_queue,
                work_queue_rx,
                in_queue: Mutex::new(HashSet::new()),
                shutdown,
            }),
        }
    }

    pub async fn run(&mut self) -> Result<()> {
        tracing::info!(
            "General Pod Autoscaler controller started, workers: {}",
            CONFIG.workers
        );

        let mut workers = Vec::with_capacity(CONFIG.workers);
        for _ in 0..CONFIG.workers {
            let inner = self.inner.clone();
            workers.push(tokio::spawn(inner.worker()));
        }

        loop {
            select! {
                Some(key) = self.rx.recv() => {
                    // enqueue immediately when a GPA changes,
                    // the dedupe set absorbs bursts
                    self.inner.enqueue_gpa(&key, std::time::Duration::ZERO);
                },
                Some(_) = self.resync_rx.recv() => {
                    self.inner.handle_resync().await;
                },
                _ = tokio::signal::ctrl_c() => {
                    tracing::info!("Stop signal received, draining workers");
                    break;
                },
                else => break,
            }
        }

        self.inner.shutdown.send(true).ok();
        for worker in workers {
            worker.await?;
        }
        if let Some(informer) = self.gpa_informer.take() {
            informer.abort();
        }
        if let Some(informer) = self.pod_informer.take() {
            informer.abort();
        }
        tracing::info!("General Pod Autoscaler controller exited");
        Ok(())
    }

    fn create_gpa_informer(
        tx: Sender<String>,
        resync_tx: Sender<ResyncNotification>,
    ) -> Informer<GeneralPodAutoscaler> {
        let lw = utils::create_lister_watcher("generalpodautoscalers".to_string());

        let tx_add = tx;
        let tx_update = tx_add.clone();
        let tx_delete = tx_add.clone();
        let eh = EventHandler::<GeneralPodAutoscaler> {
            add_cls: Box::new(move |new| {
                let tx_add = tx_add.clone();
                Box::pin(async move {
                    tx_add.send(new.store_key()).await?;
                    Ok(())
                })
            }),
            update_cls: Box::new(move |(_, new)| {
                let tx_update = tx_update.clone();
                Box::pin(async move {
                    tx_update.send(new.store_key()).await?;
                    Ok(())
                })
            }),
            // a reconcile of the vanished key purges its windows
            delete_cls: Box::new(move |old| {
                let tx_delete = tx_delete.clone();
                Box::pin(async move {
                    tx_delete.send(old.store_key()).await?;
                    Ok(())
                })
            }),
        };
        let rh = ResyncHandler(Box::new(move |()| {
            let resync_tx = resync_tx.clone();
            Box::pin(async move {
                resync_tx.send(ResyncNotification).await?;
                Ok(())
            })
        }));

        Informer::new(lw, eh, rh)
    }

    fn create_pod_informer() -> Informer<Pod> {
        let lw = utils::create_lister_watcher("pods".to_string());
        let eh = EventHandler::<Pod> {
            add_cls: Box::new(move |_| Box::pin(async move { Ok(()) })),
            update_cls: Box::new(move |(_, __)| Box::pin(async move { Ok(()) })),
            delete_cls: Box::new(move |_| Box::pin(async move { Ok(()) })),
        };
        let rh = ResyncHandler(Box::new(move |()| Box::pin(async move { Ok(()) })));
        Informer::new(lw, eh, rh)
    }
}

impl ControllerInner {
    async fn worker(self: Arc<Self>) {
        let mut shutdown = self.shutdown.subscribe();
        loop {
            select! {
                _ = shutdown.changed() => break,
                key = self.work_queue_rx.receive() => {
                    let Some(key) = key else { break };
                    self.in_queue.lock().remove(&key);
                    let deleted = match AssertUnwindSafe(self.reconcile_key(&key))
                        .catch_unwind()
                        .await
                    {
                        Ok(Ok(deleted)) => deleted,
                        Ok(Err(e)) => {
                            tracing::error!("Error reconciling {}: {:#}", key, e);
                            false
                        },
                        Err(_) => {
                            tracing::error!("Reconcile of {} panicked", key);
                            false
                        },
                    };
                    if !deleted {
                        self.enqueue_gpa(
                            &key,
                            std::time::Duration::from_secs(CONFIG.resync_period_seconds),
                        );
                    }
                },
            }
        }
        tracing::info!("general pod autoscaler worker shutting down");
    }

    /// Enqueues unless the key is already waiting, so that a GPA is
    /// reconciled at most once per resync interval at steady state.
    fn enqueue_gpa(&self, key: &str, delay: std::time::Duration) {
        let mut in_queue = self.in_queue.lock();
        if !in_queue.contains(key) {
            in_queue.insert(key.to_string());
            self.work_queue.insert(key.to_string(), delay);
        }
    }

    async fn handle_resync(&self) {
        let store = self.gpa_store.read().await;
        for key in store.keys() {
            self.enqueue_gpa(key, std::time::Duration::ZERO);
        }
    }

    /// Reconciles the GPA behind the key. Returns `true` when the GPA
    /// no longer exists and its windows were purged.
    async fn reconcile_key(&self, key: &str) -> Result<bool> {
        let (namespace, name) = utils::split_meta_namespace_key(key)?;
        let gpa = { self.gpa_store.read().await.get(key).cloned() };
        match gpa {
            Some(gpa) => {
                self.reconcile_autoscaler(gpa, key).await?;
                tracing::info!("Reconciled General Pod Autoscaler {}", key);
                Ok(false)
            },
            None => {
                tracing::info!(
                    "General Pod Autoscaler {} has been deleted in {}",
                    name,
                    namespace
                );
                self.recommendations.lock().remove(key);
                self.scale_up_events.lock().remove(key);
                self.scale_down_events.lock().remove(key);
                Ok(true)
            },
        }
    }

    async fn reconcile_autoscaler(&self, mut gpa: GeneralPodAutoscaler, key: &str) -> Result<()> {
        // objects normally pass admission, but flag the ones that
        // predate the validating webhook
        for violation in validation::validate_gpa(&gpa, 0) {
            tracing::warn!("GPA {} failed validation: {}", key, violation);
        }

        let status_original = gpa.status.clone();
        let reference = format!(
            "{}/{}/{}",
            gpa.spec.scale_target_ref.kind, gpa.metadata.namespace, gpa.spec.scale_target_ref.name
        );

        let mappings = match self.mapper.rest_mappings(&gpa.spec.scale_target_ref.kind) {
            Ok(mappings) => mappings,
            Err(e) => {
                self.fail_get_scale(&mut gpa, &status_original, &e).await;
                return Err(anyhow!(
                    "unable to determine resource for scale target reference: {}",
                    e
                ));
            },
        };
        let (mut scale, target_resource) = match self
            .scale_for_resource_mappings(&gpa.metadata.namespace, &gpa.spec.scale_target_ref.name, &mappings)
            .await
        {
            Ok(found) => found,
            Err(e) => {
                self.fail_get_scale(&mut gpa, &status_original, &e).await;
                return Err(anyhow!(
                    "failed to query scale subresource for {}: {}",
                    reference,
                    e
                ));
            },
        };

        if !scale.status.selector.is_empty() {
            // record the selector as labels to accelerate lookups, best effort
            match scale.status.selector.parse::<Labels>() {
                Ok(label_map) => {
                    if let Err(e) = utils::patch_gpa_labels(&gpa, &label_map).await {
                        tracing::warn!(
                            "Add labels {} to gpa {} failed: {:#}",
                            label_map,
                            gpa.metadata.name,
                            e
                        );
                    }
                },
                Err(e) => {
                    tracing::error!(
                        "Converting selector {} to labels failed: {:#}",
                        scale.status.selector,
                        e
                    );
                },
            }
        }

        gpa.status.set_condition(
            AbleToScale,
            true,
            "SucceededGetScale",
            "the GPA controller was able to get the target's current scale".to_string(),
        );
        let current_replicas = scale.spec.replicas;
        self.record_initial_recommendation(current_replicas, key);

        let mut metric_statuses = Vec::new();
        let mut metric_desired_replicas = 0;
        let mut metric_name = String::new();

        let mut desired_replicas = 0;
        let mut rescale_reason = String::new();

        let mut schedule_name = String::new();
        let mut cron_scaler = None;
        if let Some(cron_mode) = &gpa.spec.cron_metric {
            let scaler = CronMetricsScaler::new(&cron_mode.cron_metrics);
            let (cron_max, cron_min, name) = scaler.get_current_max_and_min_replicas(&gpa);
            tracing::info!(
                "current cron schedule: {}, max: {}, min: {}",
                name,
                cron_max,
                cron_min
            );
            gpa.spec.min_replicas = Some(cron_min);
            gpa.spec.max_replicas = cron_max;
            schedule_name = name;
            cron_scaler = Some(scaler);
        }
        let min_replicas = gpa.spec.min_replicas.unwrap_or(1);

        let mut rescale = true;
        if scale.spec.replicas == 0 && min_replicas != 0 {
            // autoscaling is disabled for this resource
            desired_replicas = 0;
            rescale = false;
            gpa.status.set_condition(
                ScalingActive,
                false,
                "ScalingDisabled",
                "scaling is disabled since the replica count of the target is zero".to_string(),
            );
        } else if current_replicas > gpa.spec.max_replicas {
            rescale_reason = "Current number of replicas above Spec.MaxReplicas".to_string();
            desired_replicas = gpa.spec.max_replicas;
        } else if current_replicas < min_replicas {
            rescale_reason = "Current number of replicas below Spec.MinReplicas".to_string();
            desired_replicas = min_replicas;
        } else {
            if gpa.spec.modes_empty() {
                return Ok(());
            }
            let computed = if let Some(metric_mode) = gpa.spec.metric.clone() {
                self.compute_replicas_for_metrics(&mut gpa, &scale, &metric_mode.metrics)
                    .await
            } else if let Some(scaler) = &cron_scaler {
                let cron_metrics = scaler.get_current_cron_metric_specs(&gpa, &schedule_name);
                self.compute_replicas_for_cron_metrics(&mut gpa, &scale, &cron_metrics, &schedule_name)
                    .await
            } else {
                self.compute_replicas_for_simple(&mut gpa, &scale).await
            };
            match computed {
                Ok((replicas, name, statuses)) => {
                    metric_desired_replicas = replicas;
                    metric_name = name;
                    metric_statuses = statuses;
                },
                Err(e) => {
                    self.set_current_replicas_in_status(&mut gpa, current_replicas);
                    if let Err(update_err) =
                        self.update_status_if_needed(&status_original, &gpa).await
                    {
                        tracing::error!("{:#}", update_err);
                    }
                    self.recorder.event(
                        &gpa,
                        EventType::Warning,
                        "FailedComputeMetricsReplicas",
                        &e.to_string(),
                    );
                    return Err(anyhow!(
                        "failed to compute desired number of replicas based on listed metrics for {}: {}",
                        reference,
                        e
                    ));
                },
            }
            if metric_desired_replicas > gpa.spec.max_replicas {
                self.recorder.event(
                    &gpa,
                    EventType::Warning,
                    "FailedRescale",
                    &format!(
                        "DesiredReplicas: {} cannot exceed the MaxReplicas: {}",
                        metric_desired_replicas, gpa.spec.max_replicas
                    ),
                );
            }
            tracing::debug!(
                "proposing {} desired replicas (based on {}) for {}",
                metric_desired_replicas,
                metric_name,
                reference
            );

            let mut rescale_metric = String::new();
            if metric_desired_replicas > desired_replicas {
                desired_replicas = metric_desired_replicas;
                rescale_metric = metric_name.clone();
            }
            if desired_replicas > current_replicas {
                rescale_reason = format!("{} above target", rescale_metric);
            }
            if desired_replicas < current_replicas {
                rescale_reason = "All metrics below target".to_string();
            }
            desired_replicas = if gpa.spec.behavior.is_none() {
                self.normalize_desired_replicas(
                    &mut gpa,
                    key,
                    current_replicas,
                    desired_replicas,
                    min_replicas,
                )
            } else {
                self.normalize_desired_replicas_with_behaviors(
                    &mut gpa,
                    key,
                    current_replicas,
                    desired_replicas,
                    min_replicas,
                )
            };
            rescale = desired_replicas != current_replicas;
        }

        if rescale {
            if desired_replicas == 0 {
                // never write a zero through the scale subresource
                self.recorder.event(
                    &gpa,
                    EventType::Warning,
                    "FailedRescale",
                    &format!(
                        "desiredReplicas: {}; reason: {}; skip modify replicas",
                        desired_replicas, rescale_reason
                    ),
                );
                return Err(anyhow!(
                    "failed to rescale {}: desiredReplicas=0, refusing to modify replicas",
                    reference
                ));
            }
            scale.spec.replicas = desired_replicas;
            if let Err(e) = utils::update_scale(
                &gpa.metadata.namespace,
                &target_resource,
                &gpa.spec.scale_target_ref.name,
                &scale,
            )
            .await
            {
                self.recorder.event(
                    &gpa,
                    EventType::Warning,
                    "FailedRescale",
                    &format!(
                        "New size: {}; reason: {}; error: {}",
                        desired_replicas, rescale_reason, e
                    ),
                );
                gpa.status.set_condition(
                    AbleToScale,
                    false,
                    "FailedUpdateScale",
                    format!("the GPA controller was unable to update the target scale: {}", e),
                );
                self.set_current_replicas_in_status(&mut gpa, current_replicas);
                if let Err(update_err) = self.update_status_if_needed(&status_original, &gpa).await
                {
                    tracing::error!("{:#}", update_err);
                }
                return Err(anyhow!("failed to rescale {}: {}", reference, e));
            }
            gpa.status.set_condition(
                AbleToScale,
                true,
                "SucceededRescale",
                format!(
                    "the GPA controller was able to update the target scale to {}",
                    desired_replicas
                ),
            );
            self.store_scale_event(gpa.spec.behavior.as_ref(), key, current_replicas, desired_replicas);

            let (cpu_requests, cpu_limits, mem_requests, mem_limits) = self
                .calculate_one_pod_resources(&gpa.metadata.namespace, &scale.status.selector)
                .await
                .unwrap_or_else(|e| {
                    tracing::error!("Calculating pod resources failed: {:#}", e);
                    (0.0, 0.0, 0.0, 0.0)
                });
            let replica_change = desired_replicas as f32 - current_replicas as f32;
            let payload = RescalePayload {
                old_replicas: current_replicas,
                new_replicas: desired_replicas,
                min_replicas,
                max_replicas: gpa.spec.max_replicas,
                cpu_request_of_changes: replica_change * cpu_requests,
                cpu_limits_of_changes: replica_change * cpu_limits,
                mem_request_of_changes: replica_change * mem_requests,
                mem_limits_of_changes: replica_change * mem_limits,
                reason: rescale_reason.clone(),
            };
            match serde_json::to_string(&payload) {
                Ok(body) => {
                    self.recorder
                        .event(&gpa, EventType::Normal, "SuccessfulRescale", &body)
                },
                Err(_) => self.recorder.event(
                    &gpa,
                    EventType::Normal,
                    "SuccessfulRescale",
                    &format!(
                        "old size: {}; new size: {}; min size: {}; max size: {}; reason: {}",
                        current_replicas,
                        desired_replicas,
                        min_replicas,
                        gpa.spec.max_replicas,
                        rescale_reason
                    ),
                ),
            }
            tracing::info!(
                "Successful rescale of {}, old size: {}, new size: {}, reason: {}",
                gpa.metadata.name,
                current_replicas,
                desired_replicas,
                rescale_reason
            );
        } else {
            tracing::debug!(
                "decided not to scale {} to {} (last scale time was {:?})",
                reference,
                desired_replicas,
                gpa.status.last_scale_time
            );
            desired_replicas = current_replicas;
        }
        self.set_status(&mut gpa, current_replicas, desired_replicas, metric_statuses, rescale);
        self.update_status_if_needed(&status_original, &gpa).await
    }

    async fn fail_get_scale(
        &self,
        gpa: &mut GeneralPodAutoscaler,
        status_original: &GpaStatus,
        error: &Error,
    ) {
        self.recorder
            .event(gpa, EventType::Warning, "FailedGetScale", &error.to_string());
        gpa.status.set_condition(
            AbleToScale,
            false,
            "FailedGetScale",
            format!(
                "the GPA controller was unable to get the target's current scale: {}",
                error
            ),
        );
        if let Err(e) = self.update_status_if_needed(status_original, gpa).await {
            tracing::error!("{:#}", e);
        }
    }

    /// Fetches the scale subresource, trying each resource mapping in
    /// turn until one works. The first error is kept.
    async fn scale_for_resource_mappings(
        &self,
        namespace: &str,
        name: &str,
        mappings: &[String],
    ) -> Result<(Scale, String)> {
        let mut first_err = None;
        for resource in mappings {
            match utils::get_scale(namespace, resource, name).await {
                Ok(scale) => return Ok((scale, resource.clone())),
                Err(e) => {
                    if first_err.is_none() {
                        first_err = Some(e);
                    }
                },
            }
        }
        Err(first_err.unwrap_or_else(|| anyhow!("unrecognized resource")))
    }

    /// Per-replica cpu/mem requests and limits sampled from the first
    /// pod matching the selector.
    async fn calculate_one_pod_resources(
        &self,
        namespace: &str,
        selector: &str,
    ) -> Result<(f32, f32, f32, f32)> {
        let selector: Labels = selector.parse()?;
        let store = self.pod_store.read().await;
        let pod = store.values().find(|pod| {
            pod.metadata.namespace == namespace && pod.metadata.labels.matches(&selector)
        });
        match pod {
            Some(pod) => Ok((
                pod.requests(&Resource::CPU) as f32,
                pod.limits(&Resource::CPU) as f32,
                pod.requests(&Resource::Memory) as f32,
                pod.limits(&Resource::Memory) as f32,
            )),
            None => Ok((0.0, 0.0, 0.0, 0.0)),
        }
    }

    fn record_initial_recommendation(&self, current_replicas: u32, key: &str) {
        let mut recommendations = self.recommendations.lock();
        recommendations.entry(key.to_string()).or_insert_with(|| {
            vec![TimestampedRecommendation {
                recommendation: current_replicas,
                timestamp: Local::now().naive_utc(),
            }]
        });
    }

    /// Requires and parses the selector of the target scale,
    /// surfacing `ScalingActive=False` when it is unusable.
    fn parse_scale_selector(
        &self,
        gpa: &mut GeneralPodAutoscaler,
        scale: &Scale,
    ) -> Result<Labels> {
        if scale.status.selector.is_empty() {
            let msg = "selector is required";
            self.recorder
                .event(gpa, EventType::Warning, "SelectorRequired", msg);
            gpa.status.set_condition(
                ScalingActive,
                false,
                "InvalidSelector",
                "the GPA target's scale is missing a selector".to_string(),
            );
            return Err(anyhow!(msg));
        }
        match scale.status.selector.parse::<Labels>() {
            Ok(selector) => Ok(selector),
            Err(e) => {
                let msg = format!(
                    "couldn't convert selector into a corresponding internal selector object: {}",
                    e
                );
                self.recorder
                    .event(gpa, EventType::Warning, "InvalidSelector", &msg);
                gpa.status
                    .set_condition(ScalingActive, false, "InvalidSelector", msg.clone());
                Err(anyhow!(msg))
            },
        }
    }

    /// Computes the desired replicas for all metric specifications,
    /// returning the maximum of the proposals together with a
    /// description of the winning metric.
    async fn compute_replicas_for_metrics(
        &self,
        gpa: &mut GeneralPodAutoscaler,
        scale: &Scale,
        metric_specs: &[MetricSpec],
    ) -> Result<(u32, String, Vec<MetricStatus>)> {
        let selector = self.parse_scale_selector(gpa, scale)?;
        let spec_replicas = scale.spec.replicas;
        let status_replicas = scale.status.replicas;

        let mut statuses = Vec::with_capacity(metric_specs.len());
        let mut invalid_count = 0;
        let mut first_failure: Option<MetricFailure> = None;
        let mut replicas = 0;
        let mut metric = String::new();

        for spec in metric_specs {
            match self
                .compute_replicas_for_metric(gpa, spec, spec_replicas, status_replicas, &selector, &mut statuses)
                .await
            {
                Ok((proposal, name, _timestamp)) => {
                    if replicas == 0 || proposal > replicas {
                        replicas = proposal;
                        metric = name;
                    }
                },
                Err(failure) => {
                    if invalid_count == 0 {
                        first_failure = Some(failure);
                    }
                    invalid_count += 1;
                },
            }
        }

        // when no metric works, surface the first failure
        if invalid_count >= metric_specs.len() {
            if let Some(failure) = first_failure {
                gpa.status
                    .set_condition(ScalingActive, false, &failure.reason, failure.message);
                return Err(anyhow!(
                    "invalid metrics ({} invalid out of {}), first error is: {}",
                    invalid_count,
                    metric_specs.len(),
                    failure.error
                ));
            }
            return Err(anyhow!("no metrics specified"));
        }
        gpa.status.set_condition(
            ScalingActive,
            true,
            "ValidMetricFound",
            format!(
                "the GPA was able to successfully calculate a replica count from {}",
                metric
            ),
        );
        Ok((replicas, metric, statuses))
    }

    /// Like [`Self::compute_replicas_for_metrics`] for the specs of the
    /// active cron schedule. Every proposal is clamped to the window's
    /// replica bounds before the normalizer runs.
    async fn compute_replicas_for_cron_metrics(
        &self,
        gpa: &mut GeneralPodAutoscaler,
        scale: &Scale,
        cron_metrics: &[CronMetricSpec],
        schedule_name: &str,
    ) -> Result<(u32, String, Vec<MetricStatus>)> {
        let selector = self.parse_scale_selector(gpa, scale)?;
        let spec_replicas = scale.spec.replicas;
        let status_replicas = scale.status.replicas;
        let window_min = gpa.spec.min_replicas.unwrap_or(1);
        let window_max = gpa.spec.max_replicas;

        let mut statuses = Vec::with_capacity(cron_metrics.len());
        let mut invalid_count = 0;
        let mut first_failure: Option<MetricFailure> = None;
        let mut replicas = 0;
        let mut metric = String::new();

        for cron_spec in cron_metrics {
            let computed = match &cron_spec.metric {
                Some(spec) => {
                    self.compute_replicas_for_metric(gpa, spec, spec_replicas, status_replicas, &selector, &mut statuses)
                        .await
                },
                None => Err(self.unable_compute_replica_count_failure(
                    gpa,
                    "InvalidMetricSourceType",
                    anyhow!(
                        "cron metric {} does not populate a metric source",
                        cron_spec.schedule
                    ),
                )),
            };
            match computed {
                Ok((proposal, name, _timestamp)) => {
                    let proposal = proposal.max(window_min).min(window_max);
                    if replicas == 0 || proposal > replicas {
                        replicas = proposal;
                        metric = format!("cron {} {}", schedule_name, name);
                    }
                },
                Err(failure) => {
                    if invalid_count == 0 {
                        first_failure = Some(failure);
                    }
                    invalid_count += 1;
                },
            }
        }

        if invalid_count >= cron_metrics.len() {
            if let Some(failure) = first_failure {
                gpa.status
                    .set_condition(ScalingActive, false, &failure.reason, failure.message);
                return Err(anyhow!(
                    "invalid metrics ({} invalid out of {}), first error is: {}",
                    invalid_count,
                    cron_metrics.len(),
                    failure.error
                ));
            }
            return Err(anyhow!("no metrics specified for schedule {}", schedule_name));
        }
        gpa.status.set_condition(
            ScalingActive,
            true,
            "ValidMetricFound",
            format!(
                "the GPA was able to successfully calculate a replica count from {}",
                metric
            ),
        );
        Ok((replicas, metric, statuses))
    }

    /// Evaluates the webhook/time scaler chain and takes the largest
    /// proposal.
    async fn compute_replicas_for_simple(
        &self,
        gpa: &mut GeneralPodAutoscaler,
        scale: &Scale,
    ) -> Result<(u32, String, Vec<MetricStatus>)> {
        self.parse_scale_selector(gpa, scale)?;
        let status_replicas = scale.status.replicas;

        let scalers = build_scaler_chain(gpa);
        match compute_desired_size(gpa, &scalers, status_replicas).await {
            Ok((replicas, mode_name)) => {
                gpa.status.set_condition(
                    ScalingActive,
                    true,
                    "ValidMetricFound",
                    format!(
                        "the GPA was able to successfully calculate a replica count from {}",
                        mode_name
                    ),
                );
                Ok((replicas, mode_name, Vec::new()))
            },
            Err((mode_name, e)) => {
                gpa.status.set_condition(
                    ScalingActive,
                    false,
                    &format!("{} failed", mode_name),
                    format!("{} failed: {}", mode_name, e),
                );
                Err(anyhow!("invalid mode {}, first error is: {}", mode_name, e))
            },
        }
    }

    fn unable_compute_replica_count_failure(
        &self,
        gpa: &GeneralPodAutoscaler,
        reason: &str,
        error: Error,
    ) -> MetricFailure {
        self.recorder
            .event(gpa, EventType::Warning, reason, &error.to_string());
        MetricFailure {
            reason: reason.to_string(),
            message: format!("the GPA was unable to compute the replica count: {}", error),
            error,
        }
    }

    /// Computes the proposal for one metric specification, recording
    /// the read value in `statuses` on success.
    async fn compute_replicas_for_metric(
        &self,
        gpa: &GeneralPodAutoscaler,
        spec: &MetricSpec,
        spec_replicas: u32,
        status_replicas: u32,
        selector: &Labels,
        statuses: &mut Vec<MetricStatus>,
    ) -> Result<(u32, String, NaiveDateTime), MetricFailure> {
        let namespace = &gpa.metadata.namespace;
        match spec {
            MetricSpec::Object(object) => match object.target {
                MetricTarget::Value(target) => {
                    let (replicas, usage, timestamp) = self
                        .replica_calc
                        .get_object_metric_replicas(
                            spec_replicas,
                            target as i64,
                            &object.metric.name,
                            namespace,
                            &object.described_object,
                        )
                        .await
                        .map_err(|e| {
                            self.unable_compute_replica_count_failure(
                                gpa,
                                "FailedGetObjectMetric",
                                anyhow!("failed to get object metric value: {}", e),
                            )
                        })?;
                    statuses.push(MetricStatus::Object(ObjectMetricStatus {
                        described_object: Some(object.described_object.clone()),
                        metric: object.metric.clone(),
                        current: MetricValueStatus {
                            value: Some(usage),
                            ..Default::default()
                        },
                    }));
                    Ok((
                        replicas,
                        format!("{} metric {}", object.described_object.kind, object.metric.name),
                        timestamp,
                    ))
                },
                MetricTarget::AverageValue(target) => {
                    let (replicas, average, timestamp) = self
                        .replica_calc
                        .get_object_per_pod_metric_replicas(
                            status_replicas,
                            target as i64,
                            &object.metric.name,
                            namespace,
                            &object.described_object,
                        )
                        .await
                        .map_err(|e| {
                            self.unable_compute_replica_count_failure(
                                gpa,
                                "FailedGetObjectMetric",
                                anyhow!(
                                    "failed to get {} object metric: {}",
                                    object.metric.name,
                                    e
                                ),
                            )
                        })?;
                    statuses.push(MetricStatus::Object(ObjectMetricStatus {
                        described_object: Some(object.described_object.clone()),
                        metric: object.metric.clone(),
                        current: MetricValueStatus {
                            average_value: Some(average),
                            ..Default::default()
                        },
                    }));
                    Ok((
                        replicas,
                        format!("object metric {}", object.metric.name),
                        timestamp,
                    ))
                },
                MetricTarget::Utilization(_) => Err(self.unable_compute_replica_count_failure(
                    gpa,
                    "FailedGetObjectMetric",
                    anyhow!("invalid object metric source: neither a value target nor an average value target was set"),
                )),
            },
            MetricSpec::Pods(pods) => match pods.target {
                MetricTarget::AverageValue(target) => {
                    let (replicas, average, timestamp) = self
                        .replica_calc
                        .get_metric_replicas(
                            spec_replicas,
                            target as i64,
                            &pods.metric.name,
                            namespace,
                            selector,
                        )
                        .await
                        .map_err(|e| {
                            self.unable_compute_replica_count_failure(
                                gpa,
                                "FailedGetPodsMetric",
                                anyhow!("failed to get pods metric value: {}", e),
                            )
                        })?;
                    statuses.push(MetricStatus::Pods(PodsMetricStatus {
                        metric: pods.metric.clone(),
                        current: MetricValueStatus {
                            average_value: Some(average),
                            ..Default::default()
                        },
                    }));
                    Ok((replicas, format!("pods metric {}", pods.metric.name), timestamp))
                },
                _ => Err(self.unable_compute_replica_count_failure(
                    gpa,
                    "FailedGetPodsMetric",
                    anyhow!("invalid pods metric source: a per-pod average value target is required"),
                )),
            },
            MetricSpec::Resource(resource) => {
                self.compute_status_for_resource_metric_generic(
                    gpa,
                    &resource.target,
                    &resource.name,
                    None,
                    selector,
                    spec_replicas,
                    statuses,
                    "FailedGetResourceMetric",
                )
                .await
            },
            MetricSpec::ContainerResource(resource) => {
                self.compute_status_for_resource_metric_generic(
                    gpa,
                    &resource.target,
                    &resource.name,
                    Some(&resource.container),
                    selector,
                    spec_replicas,
                    statuses,
                    "FailedGetContainerResourceMetric",
                )
                .await
            },
            MetricSpec::External(external) => match external.target {
                MetricTarget::Value(target) => {
                    let (replicas, usage, timestamp) = self
                        .replica_calc
                        .get_external_metric_replicas(
                            spec_replicas,
                            target as i64,
                            &external.metric.name,
                            external.metric.selector.as_ref(),
                        )
                        .await
                        .map_err(|e| {
                            self.unable_compute_replica_count_failure(
                                gpa,
                                "FailedGetExternalMetric",
                                anyhow!(
                                    "failed to get external metric {}: {}",
                                    external.metric.name,
                                    e
                                ),
                            )
                        })?;
                    statuses.push(MetricStatus::External(ExternalMetricStatus {
                        metric: external.metric.clone(),
                        current: MetricValueStatus {
                            value: Some(usage),
                            ..Default::default()
                        },
                    }));
                    Ok((
                        replicas,
                        format!("external metric {}", external.metric.name),
                        timestamp,
                    ))
                },
                MetricTarget::AverageValue(target) => {
                    let (replicas, average, timestamp) = self
                        .replica_calc
                        .get_external_per_pod_metric_replicas(
                            status_replicas,
                            target as i64,
                            &external.metric.name,
                            external.metric.selector.as_ref(),
                        )
                        .await
                        .map_err(|e| {
                            self.unable_compute_replica_count_failure(
                                gpa,
                                "FailedGetExternalMetric",
                                anyhow!(
                                    "failed to get {} external metric: {}",
                                    external.metric.name,
                                    e
                                ),
                            )
                        })?;
                    statuses.push(MetricStatus::External(ExternalMetricStatus {
                        metric: external.metric.clone(),
                        current: MetricValueStatus {
                            average_value: Some(average),
                            ..Default::default()
                        },
                    }));
                    Ok((
                        replicas,
                        format!("external metric {}", external.metric.name),
                        timestamp,
                    ))
                },
                MetricTarget::Utilization(_) => Err(self.unable_compute_replica_count_failure(
                    gpa,
                    "FailedGetExternalMetric",
                    anyhow!("invalid external metric source: neither a value target nor an average value target was set"),
                )),
            },
        }
    }

    #[allow(clippy::too_many_arguments)]
    async fn compute_status_for_resource_metric_generic(
        &self,
        gpa: &GeneralPodAutoscaler,
        target: &MetricTarget,
        resource_name: &Resource,
        container: Option<&str>,
        selector: &Labels,
        current_replicas: u32,
        statuses: &mut Vec<MetricStatus>,
        failure_reason: &str,
    ) -> Result<(u32, String, NaiveDateTime), MetricFailure> {
        match target {
            MetricTarget::AverageValue(target) => {
                let (replicas, raw, timestamp) = self
                    .replica_calc
                    .get_raw_resource_replicas(
                        current_replicas,
                        *target as i64,
                        resource_name,
                        &gpa.metadata.namespace,
                        selector,
                        container,
                    )
                    .await
                    .map_err(|e| {
                        self.unable_compute_replica_count_failure(
                            gpa,
                            failure_reason,
                            anyhow!("failed to get {} utilization: {}", resource_name, e),
                        )
                    })?;
                let current = MetricValueStatus {
                    average_value: Some(raw),
                    ..Default::default()
                };
                statuses.push(resource_metric_status(resource_name, container, current));
                Ok((replicas, format!("{} resource", resource_name), timestamp))
            },
            MetricTarget::Utilization(target) => {
                let compute_by_limits = gpa.compute_by_limits();
                let (replicas, percentage, raw, timestamp) = self
                    .replica_calc
                    .get_resource_replicas(
                        current_replicas,
                        *target,
                        resource_name,
                        &gpa.metadata.namespace,
                        selector,
                        container,
                        compute_by_limits,
                    )
                    .await
                    .map_err(|e| {
                        self.unable_compute_replica_count_failure(
                            gpa,
                            failure_reason,
                            anyhow!("failed to get {} utilization: {}", resource_name, e),
                        )
                    })?;
                let denominator = if compute_by_limits { "limit" } else { "request" };
                let current = MetricValueStatus {
                    average_value: Some(raw),
                    average_utilization: Some(percentage),
                    ..Default::default()
                };
                statuses.push(resource_metric_status(resource_name, container, current));
                Ok((
                    replicas,
                    format!(
                        "{} resource utilization (percentage of {})",
                        resource_name, denominator
                    ),
                    timestamp,
                ))
            },
            MetricTarget::Value(_) => Err(self.unable_compute_replica_count_failure(
                gpa,
                failure_reason,
                anyhow!("invalid resource metric source: neither a utilization target nor a value target was set"),
            )),
        }
    }

    /// Takes the metrics desired replicas and normalizes it:
    /// stabilize against the trailing window, then apply the
    /// min/max bounds and the one-shot scale up cap.
    fn normalize_desired_replicas(
        &self,
        gpa: &mut GeneralPodAutoscaler,
        key: &str,
        current_replicas: u32,
        desired_replicas: u32,
        min_replicas: u32,
    ) -> u32 {
        let stabilized = self.stabilize_recommendation(key, desired_replicas);
        if stabilized != desired_replicas {
            gpa.status.set_condition(
                AbleToScale,
                true,
                "ScaleDownStabilized",
                "recent recommendations were higher than current one, applying the highest recent recommendation".to_string(),
            );
        } else {
            gpa.status.set_condition(
                AbleToScale,
                true,
                "ReadyForNewScale",
                "recommended size matches current size".to_string(),
            );
        }
        let (converted, reason, message) = convert_desired_replicas_with_rules(
            current_replicas,
            stabilized,
            min_replicas,
            gpa.spec.max_replicas,
        );
        gpa.status
            .set_condition(ScalingLimited, converted != stabilized, reason, message.to_string());
        converted
    }

    /// Replaces the oldest out-of-window recommendation with the
    /// newest one, and returns the max of the recommendations not
    /// older than the downscale stabilisation window.
    fn stabilize_recommendation(&self, key: &str, desired_replicas: u32) -> u32 {
        let mut recommendations = self.recommendations.lock();
        let entries = recommendations.entry(key.to_string()).or_default();
        let now = Local::now().naive_utc();
        let cutoff = now - self.downscale_stabilisation_window;

        let mut max_recommendation = desired_replicas;
        let mut old_sample_index = None;
        for (i, rec) in entries.iter().enumerate() {
            if rec.timestamp < cutoff {
                old_sample_index = Some(i);
            } else if rec.recommendation > max_recommendation {
                max_recommendation = rec.recommendation;
            }
        }
        let sample = TimestampedRecommendation {
            recommendation: desired_replicas,
            timestamp: now,
        };
        match old_sample_index {
            Some(i) => entries[i] = sample,
            None => entries.push(sample),
        }
        max_recommendation
    }

    /// The scaling rules actually in force: user-set rules with the
    /// defaults filled in, the scale down window falling back to the
    /// controller-wide one.
    fn effective_behavior(&self, behavior: &GpaBehavior) -> (GpaScalingRules, GpaScalingRules) {
        let mut scale_up = behavior
            .scale_up
            .clone()
            .unwrap_or_else(GpaScalingRules::default_scale_up);
        if scale_up.stabilization_window_seconds.is_none() {
            scale_up.stabilization_window_seconds = Some(0);
        }
        let mut scale_down = behavior
            .scale_down
            .clone()
            .unwrap_or_else(GpaScalingRules::default_scale_down);
        if scale_down.stabilization_window_seconds.is_none() {
            scale_down.stabilization_window_seconds =
                Some(self.downscale_stabilisation_window.num_seconds() as u32);
        }
        (scale_up, scale_down)
    }

    /// Takes the metrics desired replicas and normalizes it through
    /// the configured behavior: stabilization per direction, then the
    /// per-direction rate limits, then the absolute bounds.
    fn normalize_desired_replicas_with_behaviors(
        &self,
        gpa: &mut GeneralPodAutoscaler,
        key: &str,
        current_replicas: u32,
        desired_replicas: u32,
        min_replicas: u32,
    ) -> u32 {
        let behavior = gpa.spec.behavior.clone().unwrap_or_default();
        let (scale_up, scale_down) = self.effective_behavior(&behavior);
        let mut args = NormalizationArg {
            key: key.to_string(),
            scale_up,
            scale_down,
            min_replicas,
            max_replicas: gpa.spec.max_replicas,
            current_replicas,
            desired_replicas,
        };
        let (stabilized, reason, message) = self.stabilize_recommendation_with_behaviors(&args);
        args.desired_replicas = stabilized;
        if stabilized != desired_replicas {
            gpa.status
                .set_condition(AbleToScale, true, reason, message.to_string());
        } else {
            gpa.status.set_condition(
                AbleToScale,
                true,
                "ReadyForNewScale",
                "recommended size matches current size".to_string(),
            );
        }
        let (converted, reason, message) = self.convert_desired_replicas_with_behavior_rate(&args);
        gpa.status
            .set_condition(ScalingLimited, converted != stabilized, reason, message.to_string());
        converted
    }

    /// Replaces obsolete recommendations with the newest one, and
    /// combines the in-window ones with min when scaling up and max
    /// when scaling down.
    fn stabilize_recommendation_with_behaviors(
        &self,
        args: &NormalizationArg,
    ) -> (u32, &'static str, &'static str) {
        let now = Local::now().naive_utc();
        let up_window = args.scale_up.stabilization_window_seconds.unwrap_or(0);
        let down_window = args.scale_down.stabilization_window_seconds.unwrap_or(0);

        let (delay_seconds, better, reason, message): (u32, fn(u32, u32) -> u32, _, _) =
            if args.desired_replicas >= args.current_replicas {
                (
                    up_window,
                    min,
                    "ScaleUpStabilized",
                    "recent recommendations were lower than current one, applying the lowest recent recommendation",
                )
            } else {
                (
                    down_window,
                    max,
                    "ScaleDownStabilized",
                    "recent recommendations were higher than current one, applying the highest recent recommendation",
                )
            };
        let obsolete_cutoff = now - Duration::seconds(max(up_window, down_window) as i64);
        let cutoff = now - Duration::seconds(delay_seconds as i64);

        let mut recommendation = args.desired_replicas;
        let mut recommendations = self.recommendations.lock();
        let entries = recommendations.entry(args.key.clone()).or_default();
        let mut old_sample_index = None;
        for (i, rec) in entries.iter().enumerate() {
            if rec.timestamp > cutoff {
                recommendation = better(rec.recommendation, recommendation);
            }
            if rec.timestamp < obsolete_cutoff {
                old_sample_index = Some(i);
            }
        }
        let sample = TimestampedRecommendation {
            recommendation: args.desired_replicas,
            timestamp: now,
        };
        match old_sample_index {
            Some(i) => entries[i] = sample,
            None => entries.push(sample),
        }
        (recommendation, reason, message)
    }

    /// Applies the per-direction rate limits from the rolling event
    /// log, then the absolute bounds. Does not consider the
    /// stabilization window, that is done separately.
    fn convert_desired_replicas_with_behavior_rate(
        &self,
        args: &NormalizationArg,
    ) -> (u32, &'static str, &'static str) {
        let now = Local::now().naive_utc();
        if args.desired_replicas > args.current_replicas {
            let events = self.scale_up_events.lock();
            let empty = Vec::new();
            let events = events.get(&args.key).unwrap_or(&empty);
            let mut scale_up_limit =
                calculate_scale_up_limit_with_policies(args.current_replicas, events, &args.scale_up, now);
            if scale_up_limit < args.current_replicas {
                // no further scale up until the events drain
                scale_up_limit = args.current_replicas;
            }
            let (maximum_allowed, reason, message) = if args.max_replicas > scale_up_limit {
                (
                    scale_up_limit,
                    "ScaleUpLimit",
                    "the desired replica count is increasing faster than the maximum scale rate",
                )
            } else {
                (
                    args.max_replicas,
                    "TooManyReplicas",
                    "the desired replica count is more than the maximum replica count",
                )
            };
            if args.desired_replicas > maximum_allowed {
                return (maximum_allowed, reason, message);
            }
        } else if args.desired_replicas < args.current_replicas {
            let events = self.scale_down_events.lock();
            let empty = Vec::new();
            let events = events.get(&args.key).unwrap_or(&empty);
            let mut scale_down_limit =
                calculate_scale_down_limit_with_policies(args.current_replicas, events, &args.scale_down, now);
            if scale_down_limit > args.current_replicas {
                scale_down_limit = args.current_replicas;
            }
            let (minimum_allowed, reason, message) = if args.min_replicas < scale_down_limit {
                (
                    scale_down_limit,
                    "ScaleDownLimit",
                    "the desired replica count is decreasing faster than the maximum scale rate",
                )
            } else {
                (
                    args.min_replicas,
                    "TooFewReplicas",
                    "the desired replica count is less than the minimum replica count",
                )
            };
            if args.desired_replicas < minimum_allowed {
                return (minimum_allowed, reason, message);
            }
        }
        (
            args.desired_replicas,
            "DesiredWithinRange",
            "the desired count is within the acceptable range",
        )
    }

    /// Stores (adds or replaces outdated) a scale event after a
    /// successful scale write. Events older than the direction's
    /// longest policy period are reused in place, keeping the window
    /// bounded at steady state.
    fn store_scale_event(
        &self,
        behavior: Option<&GpaBehavior>,
        key: &str,
        prev_replicas: u32,
        new_replicas: u32,
    ) {
        let Some(behavior) = behavior else { return };
        let now = Local::now().naive_utc();
        let (scale_up, scale_down) = self.effective_behavior(behavior);
        match new_replicas.cmp(&prev_replicas) {
            Ordering::Greater => {
                let mut events = self.scale_up_events.lock();
                let entries = events.entry(key.to_string()).or_default();
                mark_scale_events_outdated(entries, scale_up.longest_period(), now);
                let event = TimestampedScaleEvent {
                    replica_change: new_replicas - prev_replicas,
                    timestamp: now,
                    outdated: false,
                };
                match entries.iter().position(|e| e.outdated) {
                    Some(i) => entries[i] = event,
                    None => entries.push(event),
                }
            },
            Ordering::Less => {
                let mut events = self.scale_down_events.lock();
                let entries = events.entry(key.to_string()).or_default();
                mark_scale_events_outdated(entries, scale_down.longest_period(), now);
                let event = TimestampedScaleEvent {
                    replica_change: prev_replicas - new_replicas,
                    timestamp: now,
                    outdated: false,
                };
                match entries.iter().position(|e| e.outdated) {
                    Some(i) => entries[i] = event,
                    None => entries.push(event),
                }
            },
            Ordering::Equal => {},
        }
    }

    fn set_current_replicas_in_status(&self, gpa: &mut GeneralPodAutoscaler, current_replicas: u32) {
        gpa.status.current_replicas = current_replicas;
    }

    /// Rewrites the replica counts and metric readings on the status.
    /// The scale timestamps only move on an actual rescale.
    fn set_status(
        &self,
        gpa: &mut GeneralPodAutoscaler,
        current_replicas: u32,
        desired_replicas: u32,
        metric_statuses: Vec<MetricStatus>,
        rescale: bool,
    ) {
        gpa.status.current_replicas = current_replicas;
        gpa.status.desired_replicas = desired_replicas;
        gpa.status.current_metrics = metric_statuses;
        if rescale {
            let now = Local::now().naive_utc();
            if gpa.spec.time.is_some() || gpa.spec.cron_metric.is_some() {
                gpa.status.last_cron_schedule_time = Some(now);
            }
            gpa.status.last_scale_time = Some(now);
        }
    }

    /// Writes the status back only when it actually changed.
    async fn update_status_if_needed(
        &self,
        old_status: &GpaStatus,
        gpa: &GeneralPodAutoscaler,
    ) -> Result<()> {
        if old_status == &gpa.status {
            return Ok(());
        }
        if let Err(e) = utils::update_gpa_status(gpa).await {
            self.recorder
                .event(gpa, EventType::Warning, "FailedUpdateStatus", &e.to_string());
            return Err(anyhow!(
                "failed to update status for {}: {}",
                gpa.metadata.name,
                e
            ));
        }
        tracing::debug!("Successfully updated status for {}", gpa.metadata.name);
        Ok(())
    }
}

fn build_scaler_chain(gpa: &GeneralPodAutoscaler) -> Vec<Scaler> {
    let mut chain = Vec::new();
    if let Some(webhook) = &gpa.spec.webhook {
        chain.push(Scaler::Webhook(WebhookScaler::new(webhook.clone())));
    }
    if let Some(time) = &gpa.spec.time {
        chain.push(Scaler::Time(TimeScaler::new(time.time_ranges.clone())));
    }
    chain
}

/// Runs every scaler of the chain and keeps the largest proposal
/// together with the proposing scaler's name.
async fn compute_desired_size(
    gpa: &GeneralPodAutoscaler,
    scalers: &[Scaler],
    current_replicas: u32,
) -> Result<(u32, String), (String, Error)> {
    let mut replicas = 0;
    let mut name = String::new();
    let mut failure: Option<(String, Error)> = None;
    for scaler in scalers {
        match scaler.get_replicas(gpa, current_replicas).await {
            Ok(chain_replicas) => {
                tracing::debug!(
                    "GPA: {} scaler: {}, suggested replicas: {}",
                    gpa.metadata.name,
                    scaler.name(),
                    chain_replicas
                );
                if chain_replicas > replicas {
                    replicas = chain_replicas;
                    name = scaler.name().to_string();
                }
            },
            Err(e) => {
                tracing::error!(
                    "GPA: {} get replicas error when calling {}: {:#}",
                    gpa.metadata.name,
                    scaler.name(),
                    e
                );
                failure = Some((scaler.name().to_string(), e));
            },
        }
    }
    match failure {
        Some(failure) => Err(failure),
        None => Ok((replicas, name)),
    }
}

fn resource_metric_status(
    resource_name: &Resource,
    container: Option<&str>,
    current: MetricValueStatus,
) -> MetricStatus {
    match container {
        Some(container) => MetricStatus::ContainerResource(ContainerResourceMetricStatus {
            name: resource_name.clone(),
            container: container.to_string(),
            current,
        }),
        None => MetricStatus::Resource(ResourceMetricStatus {
            name: resource_name.clone(),
            current,
        }),
    }
}

fn calculate_scale_up_limit(current_replicas: u32) -> u32 {
    (SCALE_UP_LIMIT_FACTOR * current_replicas as f64).max(SCALE_UP_LIMIT_MINIMUM) as u32
}

/// Applies the min/max bounds and the one-shot scale up cap, without
/// depending on the controller state.
fn convert_desired_replicas_with_rules(
    current_replicas: u32,
    desired_replicas: u32,
    min_replicas: u32,
    max_replicas: u32,
) -> (u32, &'static str, &'static str) {
    // never more than double (plus a small floor) in one reconcile,
    // a bogus usage report must not blow the target up
    let scale_up_limit = calculate_scale_up_limit(current_replicas);
    let (maximum_allowed, condition, reason) = if max_replicas > scale_up_limit {
        (
            scale_up_limit,
            "ScaleUpLimit",
            "the desired replica count is increasing faster than the maximum scale rate",
        )
    } else {
        (
            max_replicas,
            "TooManyReplicas",
            "the desired replica count is more than the maximum replica count",
        )
    };

    if desired_replicas < min_replicas {
        return (
            min_replicas,
            "TooFewReplicas",
            "the desired replica count is less than the minimum replica count",
        );
    } else if desired_replicas > maximum_allowed {
        return (maximum_allowed, condition, reason);
    }
    (
        desired_replicas,
        "DesiredWithinRange",
        "the desired count is within the acceptable range",
    )
}

/// Sum of the replica changes of the events within the period.
fn replicas_change_per_period(
    period_seconds: u32,
    scale_events: &[TimestampedScaleEvent],
    now: NaiveDateTime,
) -> u32 {
    let cutoff = now - Duration::seconds(period_seconds as i64);
    scale_events
        .iter()
        .filter(|event| event.timestamp > cutoff)
        .map(|event| event.replica_change)
        .sum()
}

/// The maximum number of pods that may exist under the scale up
/// policies, given the events of the current periods.
fn calculate_scale_up_limit_with_policies(
    current_replicas: u32,
    scale_events: &[TimestampedScaleEvent],
    scaling_rules: &GpaScalingRules,
    now: NaiveDateTime,
) -> u32 {
    let (mut result, select): (u32, fn(u32, u32) -> u32) = match scaling_rules.select_policy {
        PolicySelection::Disabled => return current_replicas,
        // the lowest change produces the minimum value
        PolicySelection::Min => (u32::MAX, min),
        PolicySelection::Max => (u32::MIN, max),
    };
    for policy in &scaling_rules.policies {
        let added = replicas_change_per_period(policy.period_seconds, scale_events, now);
        let period_start = current_replicas.saturating_sub(added);
        let proposed = match policy.type_ {
            ScalingPolicyType::Pods => period_start + policy.value,
            // round up, a proposal that does not increase the count
            // would keep the target from ever scaling up
            ScalingPolicyType::Percent => {
                (period_start as f64 * (1.0 + policy.value as f64 / 100.0)).ceil() as u32
            },
        };
        result = select(result, proposed);
    }
    result
}

/// The minimum number of pods that may exist under the scale down
/// policies, given the events of the current periods.
fn calculate_scale_down_limit_with_policies(
    current_replicas: u32,
    scale_events: &[TimestampedScaleEvent],
    scaling_rules: &GpaScalingRules,
    now: NaiveDateTime,
) -> u32 {
    let (mut result, select): (u32, fn(u32, u32) -> u32) = match scaling_rules.select_policy {
        PolicySelection::Disabled => return current_replicas,
        // the lowest change produces the maximum value
        PolicySelection::Min => (u32::MIN, max),
        PolicySelection::Max => (u32::MAX, min),
    };
    for policy in &scaling_rules.policies {
        let deleted = replicas_change_per_period(policy.period_seconds, scale_events, now);
        let period_start = current_replicas + deleted;
        let proposed = match policy.type_ {
            ScalingPolicyType::Pods => period_start.saturating_sub(policy.value),
            ScalingPolicyType::Percent => {
                ((period_start as f64 * (1.0 - policy.value as f64 / 100.0)).max(0.0)) as u32
            },
        };
        result = select(result, proposed);
    }
    result
}

/// Flags events older than the longest policy period for reuse.
fn mark_scale_events_outdated(
    scale_events: &mut [TimestampedScaleEvent],
    longest_policy_period: u32,
    now: NaiveDateTime,
) {
    let cutoff = now - Duration::seconds(longest_policy_period as i64);
    for event in scale_events.iter_mut() {
        if event.timestamp < cutoff {
            event.outdated = true;
        }
    }
}

#[cfg(test)]
mod tests {
    use resources::objects::{
        gpa::{GpaScalingPolicy, GpaSpec},
        object_reference::ObjectReference,
        Metadata,
    };
    use tokio::sync::RwLock;

    use super::*;

    fn test_inner() -> ControllerInner {
        let (work_queue, work_queue_rx) = delay_queue::<String>();
        let (shutdown, _) = watch::channel(false);
        let pod_store: Store<Pod> = Arc::new(RwLock::new(HashMap::new()));
        ControllerInner {
            gpa_store: Arc::new(RwLock::new(HashMap::new())),
            pod_store: pod_store.clone(),
            replica_calc: ReplicaCalculator::new(pod_store, 0.1),
            recorder: EventRecorder,
            mapper: RestMapper::new(),
            downscale_stabilisation_window: Duration::seconds(300),
            recommendations: Mutex::new(HashMap::new()),
            scale_up_events: Mutex::new(HashMap::new()),
            scale_down_events: Mutex::new(HashMap::new()),
            work_queue,
            work_queue_rx,
            in_queue: Mutex::new(HashSet::new()),
            shutdown,
        }
    }

    fn test_gpa(min_replicas: u32, max_replicas: u32) -> GeneralPodAutoscaler {
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
                min_replicas: Some(min_replicas),
                max_replicas,
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

    fn rules(
        select_policy: PolicySelection,
        window: Option<u32>,
        policies: Vec<GpaScalingPolicy>,
    ) -> GpaScalingRules {
        GpaScalingRules {
            stabilization_window_seconds: window,
            select_policy,
            policies,
        }
    }

    fn pods_policy(value: u32, period_seconds: u32) -> GpaScalingPolicy {
        GpaScalingPolicy {
            type_: ScalingPolicyType::Pods,
            value,
            period_seconds,
        }
    }

    fn percent_policy(value: u32, period_seconds: u32) -> GpaScalingPolicy {
        GpaScalingPolicy {
            type_: ScalingPolicyType::Percent,
            value,
            period_seconds,
        }
    }

    fn args(
        current_replicas: u32,
        desired_replicas: u32,
        min_replicas: u32,
        max_replicas: u32,
        scale_up: GpaScalingRules,
        scale_down: GpaScalingRules,
    ) -> NormalizationArg {
        NormalizationArg {
            key: "default/squad".to_string(),
            scale_up,
            scale_down,
            min_replicas,
            max_replicas,
            current_replicas,
            desired_replicas,
        }
    }

    fn seed_recommendations(inner: &ControllerInner, key: &str, samples: &[(u32, i64)]) {
        let now = Local::now().naive_utc();
        let entries = samples
            .iter()
            .map(|(replicas, age_seconds)| TimestampedRecommendation {
                recommendation: *replicas,
                timestamp: now - Duration::seconds(*age_seconds),
            })
            .collect();
        inner.recommendations.lock().insert(key.to_string(), entries);
    }

    fn seed_scale_up_events(inner: &ControllerInner, key: &str, events: &[(u32, i64)]) {
        let now = Local::now().naive_utc();
        let entries = events
            .iter()
            .map(|(change, age_seconds)| TimestampedScaleEvent {
                replica_change: *change,
                timestamp: now - Duration::seconds(*age_seconds),
                outdated: false,
            })
            .collect();
        inner.scale_up_events.lock().insert(key.to_string(), entries);
    }

    #[test]
    fn scale_up_is_rate_limited_by_pods_policy() {
        let inner = test_inner();
        let args = args(
            10,
            30,
            1,
            100,
            rules(PolicySelection::Max, Some(0), vec![pods_policy(4, 60)]),
            GpaScalingRules::default_scale_down(),
        );
        let (desired, reason, _) = inner.convert_desired_replicas_with_behavior_rate(&args);
        assert_eq!(desired, 14);
        assert_eq!(reason, "ScaleUpLimit");
    }

    #[test]
    fn saturated_window_pins_scale_up_at_current() {
        let inner = test_inner();
        seed_scale_up_events(&inner, "default/squad", &[(5, 10)]);
        let args = args(
            10,
            15,
            1,
            100,
            rules(PolicySelection::Max, Some(0), vec![pods_policy(2, 60)]),
            GpaScalingRules::default_scale_down(),
        );
        let (desired, reason, _) = inner.convert_desired_replicas_with_behavior_rate(&args);
        assert_eq!(desired, 10);
        assert_eq!(reason, "ScaleUpLimit");
    }

    #[test]
    fn scale_down_percent_truncates() {
        let inner = test_inner();
        let args = args(
            10,
            1,
            1,
            100,
            GpaScalingRules::default_scale_up(),
            rules(PolicySelection::Max, Some(300), vec![percent_policy(50, 60)]),
        );
        let (desired, reason, _) = inner.convert_desired_replicas_with_behavior_rate(&args);
        assert_eq!(desired, 5);
        assert_eq!(reason, "ScaleDownLimit");
    }

    #[test]
    fn disabled_select_policy_freezes_the_direction() {
        let inner = test_inner();
        let args = args(
            10,
            30,
            1,
            100,
            rules(PolicySelection::Disabled, Some(0), vec![pods_policy(4, 60)]),
            GpaScalingRules::default_scale_down(),
        );
        let (desired, _, _) = inner.convert_desired_replicas_with_behavior_rate(&args);
        assert_eq!(desired, 10);
    }

    #[test]
    fn min_select_policy_is_least_permissive() {
        let inner = test_inner();
        let args = args(
            10,
            30,
            1,
            100,
            rules(
                PolicySelection::Min,
                Some(0),
                vec![pods_policy(4, 60), percent_policy(100, 60)],
            ),
            GpaScalingRules::default_scale_down(),
        );
        let (desired, _, _) = inner.convert_desired_replicas_with_behavior_rate(&args);
        assert_eq!(desired, 14);
    }

    #[test]
    fn rate_limited_desired_stays_within_bounds() {
        let inner = test_inner();
        let args = args(
            10,
            30,
            1,
            12,
            rules(PolicySelection::Max, Some(0), vec![pods_policy(40, 60)]),
            GpaScalingRules::default_scale_down(),
        );
        let (desired, reason, _) = inner.convert_desired_replicas_with_behavior_rate(&args);
        assert_eq!(desired, 12);
        assert_eq!(reason, "TooManyReplicas");
    }

    #[test]
    fn legacy_stabilization_applies_highest_recent_recommendation() {
        let inner = test_inner();
        let key = "default/squad";
        let window = Duration::seconds(60);
        let inner = ControllerInner {
            downscale_stabilisation_window: window,
            ..inner
        };
        seed_recommendations(&inner, key, &[(18, 30), (12, 10)]);
        let stabilized = inner.stabilize_recommendation(key, 10);
        assert_eq!(stabilized, 18);
        // the new sample is appended when nothing is out of window
        assert_eq!(inner.recommendations.lock()[key].len(), 3);

        let (desired, reason, _) = convert_desired_replicas_with_rules(15, stabilized, 5, 20);
        assert_eq!(desired, 18);
        assert_eq!(reason, "DesiredWithinRange");
    }

    #[test]
    fn legacy_stabilization_replaces_stale_samples_in_place() {
        let inner = test_inner();
        let key = "default/squad";
        seed_recommendations(&inner, key, &[(18, 400)]);
        let stabilized = inner.stabilize_recommendation(key, 10);
        assert_eq!(stabilized, 10);
        let entries = inner.recommendations.lock();
        assert_eq!(entries[key].len(), 1);
        assert_eq!(entries[key][0].recommendation, 10);
    }

    #[test]
    fn legacy_conversion_caps_to_double_or_four() {
        let (desired, reason, _) = convert_desired_replicas_with_rules(3, 10, 1, 20);
        assert_eq!(desired, 6);
        assert_eq!(reason, "ScaleUpLimit");

        let (desired, reason, _) = convert_desired_replicas_with_rules(1, 4, 1, 20);
        assert_eq!(desired, 4);
        assert_eq!(reason, "DesiredWithinRange");

        let (desired, reason, _) = convert_desired_replicas_with_rules(10, 30, 1, 12);
        assert_eq!(desired, 12);
        assert_eq!(reason, "TooManyReplicas");

        let (desired, reason, _) = convert_desired_replicas_with_rules(10, 1, 5, 12);
        assert_eq!(desired, 5);
        assert_eq!(reason, "TooFewReplicas");
    }

    #[test]
    fn behavior_stabilization_picks_min_on_the_way_up() {
        let inner = test_inner();
        let key = "default/squad";
        seed_recommendations(&inner, key, &[(4, 30)]);
        let args = args(
            5,
            10,
            1,
            100,
            rules(PolicySelection::Max, Some(60), vec![pods_policy(4, 60)]),
            rules(PolicySelection::Max, Some(60), vec![percent_policy(100, 60)]),
        );
        let (stabilized, reason, _) = inner.stabilize_recommendation_with_behaviors(&args);
        assert_eq!(stabilized, 4);
        assert_eq!(reason, "ScaleUpStabilized");
    }

    #[test]
    fn behavior_stabilization_picks_max_on_the_way_down() {
        let inner = test_inner();
        let key = "default/squad";
        seed_recommendations(&inner, key, &[(18, 30), (12, 10)]);
        let args = args(
            20,
            10,
            1,
            100,
            rules(PolicySelection::Max, Some(60), vec![pods_policy(4, 60)]),
            rules(PolicySelection::Max, Some(60), vec![percent_policy(100, 60)]),
        );
        let (stabilized, reason, _) = inner.stabilize_recommendation_with_behaviors(&args);
        assert_eq!(stabilized, 18);
        assert_eq!(reason, "ScaleDownStabilized");
    }

    #[test]
    fn normalize_keeps_desired_within_bounds() {
        let inner = test_inner();
        let mut gpa = test_gpa(2, 8);
        let desired = inner.normalize_desired_replicas(&mut gpa, "default/squad", 5, 100, 2);
        assert!(desired <= 8);
        let desired = inner.normalize_desired_replicas(&mut gpa, "default/squad", 5, 1, 2);
        assert!(desired >= 2);
        assert!(gpa
            .status
            .conditions
            .iter()
            .any(|c| c.type_ == ScalingLimited));
    }

    #[test]
    fn store_scale_event_reuses_outdated_slots() {
        let inner = test_inner();
        let key = "default/squad";
        let behavior = GpaBehavior {
            scale_up: Some(rules(PolicySelection::Max, Some(0), vec![pods_policy(4, 60)])),
            scale_down: None,
        };
        seed_scale_up_events(&inner, key, &[(3, 120)]);
        inner.store_scale_event(Some(&behavior), key, 5, 8);
        {
            let events = inner.scale_up_events.lock();
            assert_eq!(events[key].len(), 1);
            assert_eq!(events[key][0].replica_change, 3);
            assert!(!events[key][0].outdated);
        }

        // a fresh event appends instead
        inner.store_scale_event(Some(&behavior), key, 8, 10);
        let events = inner.scale_up_events.lock();
        assert_eq!(events[key].len(), 2);
        assert_eq!(events[key][1].replica_change, 2);
    }

    #[test]
    fn scale_events_are_not_stored_without_behavior() {
        let inner = test_inner();
        inner.store_scale_event(None, "default/squad", 5, 8);
        assert!(inner.scale_up_events.lock().is_empty());
    }

    #[test]
    fn replicas_change_sums_only_the_period() {
        let now = Local::now().naive_utc();
        let events = vec![
            TimestampedScaleEvent {
                replica_change: 2,
                timestamp: now - Duration::seconds(10),
                outdated: false,
            },
            TimestampedScaleEvent {
                replica_change: 3,
                timestamp: now - Duration::seconds(50),
                outdated: false,
            },
            TimestampedScaleEvent {
                replica_change: 7,
                timestamp: now - Duration::seconds(120),
                outdated: false,
            },
        ];
        assert_eq!(replicas_change_per_period(60, &events, now), 5);
        assert_eq!(replicas_change_per_period(30, &events, now), 2);
        assert_eq!(replicas_change_per_period(300, &events, now), 12);
    }

    #[test]
    fn scale_up_limit_accounts_for_recent_events() {
        let now = Local::now().naive_utc();
        let events = vec![TimestampedScaleEvent {
            replica_change: 4,
            timestamp: now - Duration::seconds(10),
            outdated: false,
        }];
        let rules = rules(PolicySelection::Max, Some(0), vec![pods_policy(4, 60)]);
        // the period started at 6 replicas, so only 10 are allowed
        assert_eq!(
            calculate_scale_up_limit_with_policies(10, &events, &rules, now),
            10
        );
    }

    #[test]
    fn scale_down_pods_policy_saturates_at_zero() {
        let now = Local::now().naive_utc();
        let rules = rules(PolicySelection::Max, Some(300), vec![pods_policy(10, 60)]);
        assert_eq!(
            calculate_scale_down_limit_with_policies(4, &[], &rules, now),
            0
        );
    }
}
