//! Scheduler facade
//!
//! Drives one request from the routing decision through streaming to
//! completion: profile choice, SLO tracking, forecast fan-out, scoring or
//! baseline fallback, then TTFT/TPOT sample collection until the request
//! completes or aborts. Every exit path untracks the request.

use crate::metrics::SchedulerMetrics;
use crate::profile::ProfileRouter;
use crate::scorer::{ScoreOutcome, SelectionMode, SloScorer};
use crate::headroom::{Headroom, HeadroomEvaluator};
use crate::tracker::RequestSloTracker;
use crate::{Result, SchedulerError};
use mesh_core::{
    Candidate, CandidateId, Error, Forecast, Forecaster, LatencyReport, ProfileName,
    RequestContext, RequestId, SchedulerConfig,
};
use mesh_predict::{ForecastFanout, SampleCollector, UploadBuffer};
use rand::rngs::SmallRng;
use rand::SeedableRng;
use serde::Serialize;
use std::sync::Arc;
use std::time::Instant;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::interval;
use tracing::{debug, info, warn};

/// How the routed candidate was chosen
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum DecisionMode {
    Positive,
    Negative,
    BestEffort,
    Baseline,
}

impl DecisionMode {
    pub fn as_str(&self) -> &'static str {
        match self {
            DecisionMode::Positive => "positive",
            DecisionMode::Negative => "negative",
            DecisionMode::BestEffort => "best_effort",
            DecisionMode::Baseline => "baseline",
        }
    }
}

impl From<SelectionMode> for DecisionMode {
    fn from(mode: SelectionMode) -> Self {
        match mode {
            SelectionMode::Positive => DecisionMode::Positive,
            SelectionMode::Negative => DecisionMode::Negative,
            SelectionMode::BestEffort => DecisionMode::BestEffort,
        }
    }
}

/// A routing decision
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Decision {
    pub request_id: RequestId,
    pub candidate: CandidateId,
    pub profile: ProfileName,
    pub mode: DecisionMode,

    /// The predictive profile ran but no forecast arrived
    pub fallback: bool,

    pub score: f64,
    pub forecast: Option<Forecast>,
    pub headroom: Option<Headroom>,
}

/// Outcome of `schedule`
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "outcome", rename_all = "snake_case")]
pub enum SchedulingOutcome {
    Routed(Decision),
    /// Rejected: no replica can meet the SLO and the request is sheddable
    Shed { request_id: RequestId, priority: i32 },
}

/// Scheduling core facade
pub struct Scheduler {
    config: SchedulerConfig,
    router: ProfileRouter,
    scorer: SloScorer,
    fanout: ForecastFanout,
    tracker: Arc<RequestSloTracker>,
    collector: Arc<SampleCollector>,
    metrics: SchedulerMetrics,
}

impl Scheduler {
    pub fn new(
        config: SchedulerConfig,
        forecaster: Arc<dyn Forecaster>,
        buffer: Arc<UploadBuffer>,
    ) -> Result<Self> {
        config.validate()?;
        let router = ProfileRouter::new(config.profiles.clone())?;
        let scorer = SloScorer::new(HeadroomEvaluator::new(config.headroom.clone()));
        let fanout = ForecastFanout::new(forecaster, config.forecast.fanout_timeout());
        let collector = Arc::new(SampleCollector::new(config.samples.tpot_stride, buffer));

        Ok(Self {
            config,
            router,
            scorer,
            fanout,
            tracker: Arc::new(RequestSloTracker::new()),
            collector,
            metrics: SchedulerMetrics::new()?,
        })
    }

    pub fn config(&self) -> &SchedulerConfig {
        &self.config
    }

    pub fn tracker(&self) -> &Arc<RequestSloTracker> {
        &self.tracker
    }

    pub fn collector(&self) -> &Arc<SampleCollector> {
        &self.collector
    }

    pub fn metrics(&self) -> &SchedulerMetrics {
        &self.metrics
    }

    /// Whether any forecaster endpoint is ready
    pub async fn forecaster_ready(&self) -> bool {
        self.fanout.forecaster().ready().await
    }

    /// Route a request, drawing a fresh seed for the weighted pick
    pub async fn schedule(
        &self,
        context: RequestContext,
        candidates: Vec<Candidate>,
    ) -> Result<SchedulingOutcome> {
        self.schedule_inner(context, candidates, None).await
    }

    /// Route a request with a fixed seed for the weighted pick
    pub async fn schedule_with_seed(
        &self,
        context: RequestContext,
        candidates: Vec<Candidate>,
        seed: u64,
    ) -> Result<SchedulingOutcome> {
        self.schedule_inner(context, candidates, Some(seed)).await
    }

    async fn schedule_inner(
        &self,
        context: RequestContext,
        mut candidates: Vec<Candidate>,
        seed: Option<u64>,
    ) -> Result<SchedulingOutcome> {
        let started = Instant::now();
        if candidates.is_empty() {
            return Err(SchedulerError::NoCandidates);
        }

        let request_id = context.request_id.clone();
        let profile = self.router.route(&context);
        let slo = context.slo()?;

        self.tracker.track(&request_id, slo)?;
        self.tracker.annotate(&mut candidates);

        let decision = match profile {
            ProfileName::Slo => {
                let fanout = self
                    .fanout
                    .forecast_all(&request_id, &context.features, &candidates)
                    .await;
                self.metrics.record_forecast_failures(fanout.unavailable());

                let scored = fanout.require_any().and_then(|forecasts| {
                    let mut rng = match seed {
                        Some(seed) => SmallRng::seed_from_u64(seed),
                        None => SmallRng::from_entropy(),
                    };
                    self.scorer.select(&slo, &candidates, &forecasts, &mut rng)
                });

                match scored {
                    Ok(ScoreOutcome::Selected(selection)) => Decision {
                        request_id: request_id.clone(),
                        candidate: selection.candidate,
                        profile,
                        mode: selection.mode.into(),
                        fallback: false,
                        score: selection.score,
                        forecast: Some(selection.forecast),
                        headroom: selection.headroom,
                    },
                    Ok(ScoreOutcome::Shed) => {
                        self.tracker.untrack(&request_id);
                        self.metrics.sheds.inc();
                        self.metrics
                            .record_decision(profile.as_str(), "shed", started.elapsed());
                        info!(
                            request_id = %request_id,
                            priority = slo.priority,
                            "Request shed, no replica meets its SLO"
                        );
                        return Ok(SchedulingOutcome::Shed {
                            request_id,
                            priority: slo.priority,
                        });
                    }
                    Err(Error::AllForecastsUnavailable(n)) => {
                        warn!(
                            request_id = %request_id,
                            candidates = n,
                            "No forecasts available, falling back to baseline"
                        );
                        self.metrics.baseline_fallbacks.inc();
                        let mut decision = self.baseline_decision(&request_id, &candidates, profile)?;
                        decision.fallback = true;
                        decision
                    }
                    Err(e) => {
                        self.tracker.untrack(&request_id);
                        return Err(e.into());
                    }
                }
            }
            ProfileName::Default => self.baseline_decision(&request_id, &candidates, profile)?,
        };

        if let Err(e) = self.tracker.assign(&request_id, &decision.candidate) {
            warn!(request_id = %request_id, error = %e, "Routed request no longer tracked");
        }
        let features = candidates
            .iter()
            .find(|c| c.id == decision.candidate)
            .map(|c| c.features.clone())
            .unwrap_or_default();
        self.collector
            .begin(&request_id, &decision.candidate, features, decision.forecast);

        self.metrics
            .record_decision(profile.as_str(), decision.mode.as_str(), started.elapsed());
        debug!(
            request_id = %request_id,
            candidate = %decision.candidate,
            profile = %profile,
            mode = decision.mode.as_str(),
            fallback = decision.fallback,
            "Request routed"
        );

        Ok(SchedulingOutcome::Routed(decision))
    }

    fn baseline_decision(
        &self,
        request_id: &RequestId,
        candidates: &[Candidate],
        profile: ProfileName,
    ) -> Result<Decision> {
        let pick = self.router.baseline().pick(candidates).ok_or_else(|| {
            self.tracker.untrack(request_id);
            SchedulerError::NoCandidates
        })?;
        Ok(Decision {
            request_id: request_id.clone(),
            candidate: pick.candidate,
            profile,
            mode: DecisionMode::Baseline,
            fallback: false,
            score: pick.score,
            forecast: None,
            headroom: None,
        })
    }

    /// Record the first token of a routed request
    pub fn on_first_token(&self, request_id: &RequestId, ttft_ms: f64) -> Result<()> {
        let candidate = self
            .tracker
            .candidate_of(request_id)
            .ok_or_else(|| Error::not_found(format!("request {} is not in flight", request_id)))?;
        self.collector.record(request_id, &candidate, ttft_ms);
        Ok(())
    }

    /// Record a decode token; returns whether it was kept as a TPOT sample
    pub fn on_token(&self, request_id: &RequestId, token_index: u32, tpot_ms: f64) -> bool {
        self.collector.record_tpot_tick(request_id, token_index, tpot_ms)
    }

    /// Finish a request, returning its predicted vs observed latencies
    pub fn complete(&self, request_id: &RequestId) -> Option<LatencyReport> {
        let tracked = self.tracker.untrack(request_id).is_some();
        let report = self.collector.finalize(request_id);
        if let Some(report) = &report {
            self.metrics.observe_report(report);
        }
        if !tracked && report.is_none() {
            debug!(request_id = %request_id, "Completion for unknown request");
        }
        report
    }

    /// Drop a request without producing a sample
    pub fn abort(&self, request_id: &RequestId) -> bool {
        let tracked = self.tracker.untrack(request_id).is_some();
        let discarded = self.collector.discard(request_id);
        tracked || discarded
    }

    /// Remove tracker entries and open samples older than the expiry window
    pub fn expire_stale(&self) -> usize {
        let expiry = self.config.tracker.expiry();
        let expired = self.tracker.expire_stale(expiry);
        for request_id in &expired {
            self.collector.discard(request_id);
        }
        let orphaned = self.collector.expire_stale(expiry);
        expired.len() + orphaned
    }

    /// Run `expire_stale` on the cleanup interval until shutdown
    pub fn spawn_cleanup(self: Arc<Self>, mut shutdown: watch::Receiver<bool>) -> JoinHandle<()> {
        tokio::spawn(async move {
            let mut ticker = interval(self.config.tracker.cleanup_interval());
            loop {
                tokio::select! {
                    _ = ticker.tick() => {
                        let removed = self.expire_stale();
                        if removed > 0 {
                            debug!(removed, "Stale request cleanup");
                        }
                    }
                    changed = shutdown.changed() => {
                        if changed.is_err() || *shutdown.borrow() {
                            break;
                        }
                    }
                }
            }
        })
    }
}
