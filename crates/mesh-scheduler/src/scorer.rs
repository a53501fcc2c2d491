//! SLO scorer: turns forecasts and SLOs into a routing decision
//!
//! Each candidate is evaluated against the request SLO tightened by the
//! strictest target already running on that candidate. Positive candidates
//! win over negative ones; inside the winning bucket the pick is weighted
//! random with weight `1 + 99 * score`, drawn by cumulative-weight sampling
//! over the candidates in id order. With no positive candidate a sheddable
//! request is shed. A request without targets skips bucketing and goes to the
//! lowest forecast latency.

use crate::headroom::{Bucket, Headroom, HeadroomEvaluator};
use mesh_core::{Candidate, CandidateId, Error, Forecast, Metric, RequestSlo, Result};
use rand::Rng;
use serde::Serialize;
use std::collections::BTreeMap;
use tracing::debug;

/// How the winning candidate was chosen
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum SelectionMode {
    /// Weighted pick among candidates meeting both targets
    Positive,
    /// Weighted pick among violating candidates by smallest deficit
    Negative,
    /// Lowest absolute forecast, no targets supplied
    BestEffort,
}

impl SelectionMode {
    pub fn as_str(&self) -> &'static str {
        match self {
            SelectionMode::Positive => "positive",
            SelectionMode::Negative => "negative",
            SelectionMode::BestEffort => "best_effort",
        }
    }
}

/// The chosen candidate and why
#[derive(Debug, Clone, PartialEq)]
pub struct Selection {
    pub candidate: CandidateId,
    pub mode: SelectionMode,

    /// In-bucket score of the winner, 1 for best-effort picks
    pub score: f64,

    pub forecast: Forecast,

    /// Absent for best-effort picks
    pub headroom: Option<Headroom>,
}

/// Result of scoring one decision
#[derive(Debug, Clone, PartialEq)]
pub enum ScoreOutcome {
    Selected(Selection),
    /// Every candidate violates the SLO and the request is sheddable
    Shed,
}

/// SLO-headroom scorer
#[derive(Debug, Clone)]
pub struct SloScorer {
    evaluator: HeadroomEvaluator,
}

impl SloScorer {
    pub fn new(evaluator: HeadroomEvaluator) -> Self {
        Self { evaluator }
    }

    pub fn evaluator(&self) -> &HeadroomEvaluator {
        &self.evaluator
    }

    /// Tighten the request SLO with the candidate's strictest running targets
    pub fn combine(slo: &RequestSlo, candidate: &Candidate) -> RequestSlo {
        let tighten = |metric: Metric| {
            let own = slo.target(metric);
            match candidate.strictest_running(metric) {
                Some(running) if running < own => running,
                _ => own,
            }
        };
        RequestSlo {
            ttft_target_ms: tighten(Metric::Ttft),
            tpot_target_ms: tighten(Metric::Tpot),
            ..*slo
        }
    }

    /// Pick a candidate for the request
    ///
    /// Candidates without a forecast are skipped. Fails with
    /// `AllForecastsUnavailable` when none of them has one.
    pub fn select<R: Rng>(
        &self,
        slo: &RequestSlo,
        candidates: &[Candidate],
        forecasts: &BTreeMap<CandidateId, Forecast>,
        rng: &mut R,
    ) -> Result<ScoreOutcome> {
        let mut scored: Vec<(&Candidate, Forecast)> = candidates
            .iter()
            .filter_map(|c| forecasts.get(&c.id).map(|f| (c, *f)))
            .collect();
        if scored.is_empty() {
            return Err(Error::AllForecastsUnavailable(candidates.len()));
        }
        scored.sort_by(|a, b| a.0.id.cmp(&b.0.id));
        scored.dedup_by(|a, b| a.0.id == b.0.id);

        if slo.is_best_effort() {
            return Ok(ScoreOutcome::Selected(Self::best_effort(&scored)));
        }

        let mut positive = Vec::new();
        let mut negative = Vec::new();
        for (candidate, forecast) in &scored {
            let combined = Self::combine(slo, candidate);
            let headroom = self.evaluator.evaluate(forecast, &combined);
            debug!(
                candidate = %candidate.id,
                ttft_headroom_ms = headroom.ttft_ms,
                tpot_headroom_ms = headroom.tpot_ms,
                bucket = %headroom.bucket,
                "Evaluated candidate headroom"
            );
            let entry = (candidate.id.clone(), headroom, *forecast);
            match headroom.bucket {
                Bucket::Positive => positive.push(entry),
                Bucket::Negative => negative.push(entry),
            }
        }

        let (bucket, entries, mode) = if !positive.is_empty() {
            (Bucket::Positive, positive, SelectionMode::Positive)
        } else if slo.is_sheddable() {
            debug!(
                priority = slo.priority,
                negatives = negative.len(),
                "No candidate meets the SLO, shedding"
            );
            return Ok(ScoreOutcome::Shed);
        } else {
            (Bucket::Negative, negative, SelectionMode::Negative)
        };

        let headrooms: Vec<(CandidateId, Headroom)> =
            entries.iter().map(|(id, h, _)| (id.clone(), *h)).collect();
        let scores = self.evaluator.score_bucket(bucket, &headrooms);
        let weights: Vec<f64> = scores.iter().map(|(_, s)| score_to_weight(*s)).collect();
        let index = weighted_index(&weights, rng);

        let (candidate, headroom, forecast) = entries[index].clone();
        Ok(ScoreOutcome::Selected(Selection {
            candidate,
            mode,
            score: scores[index].1,
            forecast,
            headroom: Some(headroom),
        }))
    }

    fn best_effort(scored: &[(&Candidate, Forecast)]) -> Selection {
        // scored is sorted by id, so strict comparison keeps the lowest id on ties
        let mut best = &scored[0];
        for entry in &scored[1..] {
            if entry.1.combined_ms() < best.1.combined_ms() {
                best = entry;
            }
        }
        Selection {
            candidate: best.0.id.clone(),
            mode: SelectionMode::BestEffort,
            score: 1.0,
            forecast: best.1,
            headroom: None,
        }
    }
}

/// Sampling weight of an in-bucket score in [0, 1]
pub fn score_to_weight(score: f64) -> f64 {
    if score.is_nan() {
        return 1.0;
    }
    1.0 + 99.0 * score.clamp(0.0, 1.0)
}

/// Cumulative-weight sampling over the finite positive weights
///
/// Falls back to the first index when no weight is usable or their sum
/// overflows.
pub fn weighted_index<R: Rng>(weights: &[f64], rng: &mut R) -> usize {
    if weights.len() <= 1 {
        return 0;
    }
    let usable = |w: f64| if w.is_finite() && w > 0.0 { w } else { 0.0 };
    let total: f64 = weights.iter().map(|w| usable(*w)).sum();
    if !(total > 0.0 && total.is_finite()) {
        return 0;
    }
    let draw = rng.gen_range(0.0..total);
    let mut cumulative = 0.0;
    for (i, weight) in weights.iter().enumerate() {
        cumulative += usable(*weight);
        if draw < cumulative {
            return i;
        }
    }
    weights.len() - 1
}

#[cfg(test)]
mod tests {
    use super::*;
    use mesh_core::{HeadroomConfig, LiveFeatures};
    use rand::rngs::SmallRng;
    use rand::SeedableRng;

    fn scorer() -> SloScorer {
        SloScorer::new(HeadroomEvaluator::new(HeadroomConfig::default()))
    }

    fn candidate(id: &str) -> Candidate {
        Candidate::new(id, LiveFeatures::default())
    }

    fn forecasts(entries: &[(&str, f64, f64)]) -> BTreeMap<CandidateId, Forecast> {
        entries
            .iter()
            .map(|(id, ttft, tpot)| (CandidateId::new(*id), Forecast::new(*ttft, *tpot)))
            .collect()
    }

    fn selected(outcome: ScoreOutcome) -> Selection {
        match outcome {
            ScoreOutcome::Selected(selection) => selection,
            ScoreOutcome::Shed => panic!("unexpected shed"),
        }
    }

    #[test]
    fn test_positive_beats_negative() {
        let slo = RequestSlo::new(250.0, 50.0, 0, true).unwrap();
        let candidates = vec![candidate("a"), candidate("b")];
        let forecasts = forecasts(&[("a", 180.0, 40.0), ("b", 300.0, 60.0)]);

        for seed in 0..50 {
            let mut rng = SmallRng::seed_from_u64(seed);
            let selection = selected(scorer().select(&slo, &candidates, &forecasts, &mut rng).unwrap());
            assert_eq!(selection.candidate.as_str(), "a");
            assert_eq!(selection.mode, SelectionMode::Positive);
        }
    }

    #[test]
    fn test_single_candidate_bucket() {
        let slo = RequestSlo::new(100.0, 10.0, 0, true).unwrap();
        let candidates = vec![candidate("only")];
        let forecasts = forecasts(&[("only", 500.0, 50.0)]);

        let mut rng = SmallRng::seed_from_u64(7);
        let selection = selected(scorer().select(&slo, &candidates, &forecasts, &mut rng).unwrap());
        assert_eq!(selection.candidate.as_str(), "only");
        assert_eq!(selection.mode, SelectionMode::Negative);
    }

    #[test]
    fn test_sheddable_all_negative_is_shed() {
        let slo = RequestSlo::new(100.0, 10.0, -1, true).unwrap();
        let candidates = vec![candidate("a"), candidate("b")];
        let forecasts = forecasts(&[("a", 150.0, 5.0), ("b", 90.0, 20.0)]);

        let mut rng = SmallRng::seed_from_u64(1);
        let outcome = scorer().select(&slo, &candidates, &forecasts, &mut rng).unwrap();
        assert_eq!(outcome, ScoreOutcome::Shed);
    }

    #[test]
    fn test_sheddable_with_positive_is_routed() {
        let slo = RequestSlo::new(100.0, 10.0, -1, true).unwrap();
        let candidates = vec![candidate("a"), candidate("b")];
        let forecasts = forecasts(&[("a", 150.0, 5.0), ("b", 90.0, 8.0)]);

        let mut rng = SmallRng::seed_from_u64(1);
        let selection = selected(scorer().select(&slo, &candidates, &forecasts, &mut rng).unwrap());
        assert_eq!(selection.candidate.as_str(), "b");
    }

    #[test]
    fn test_best_effort_lowest_combined_ties_by_id() {
        let slo = RequestSlo::best_effort(0);
        let candidates = vec![candidate("c"), candidate("b"), candidate("a")];
        let forecasts = forecasts(&[("a", 100.0, 20.0), ("b", 90.0, 30.0), ("c", 200.0, 1.0)]);

        let mut rng = SmallRng::seed_from_u64(3);
        let selection = selected(scorer().select(&slo, &candidates, &forecasts, &mut rng).unwrap());
        // a and b both forecast 120ms combined
        assert_eq!(selection.candidate.as_str(), "a");
        assert_eq!(selection.mode, SelectionMode::BestEffort);
        assert!(selection.headroom.is_none());
    }

    #[test]
    fn test_best_effort_never_sheds() {
        let slo = RequestSlo::best_effort(-5);
        let candidates = vec![candidate("a")];
        let forecasts = forecasts(&[("a", 1_000.0, 100.0)]);

        let mut rng = SmallRng::seed_from_u64(3);
        let selection = selected(scorer().select(&slo, &candidates, &forecasts, &mut rng).unwrap());
        assert_eq!(selection.candidate.as_str(), "a");
    }

    #[test]
    fn test_running_targets_tighten_slo() {
        let slo = RequestSlo::new(250.0, 50.0, 0, true).unwrap();
        let mut busy = candidate("a");
        busy.strictest_running_ttft_ms = Some(150.0);
        let idle = candidate("b");

        let combined = SloScorer::combine(&slo, &busy);
        assert_eq!(combined.ttft_target_ms, 150.0);
        assert_eq!(combined.tpot_target_ms, 50.0);

        // a would fit 250ms but not the 150ms already running there
        let forecasts = forecasts(&[("a", 180.0, 40.0), ("b", 200.0, 45.0)]);
        let mut rng = SmallRng::seed_from_u64(11);
        let selection = selected(scorer().select(&slo, &[busy, idle], &forecasts, &mut rng).unwrap());
        assert_eq!(selection.candidate.as_str(), "b");
    }

    #[test]
    fn test_zero_own_target_not_loosened() {
        let slo = RequestSlo::new(0.0, 50.0, 0, true).unwrap();
        let mut c = candidate("a");
        c.strictest_running_ttft_ms = Some(300.0);
        c.strictest_running_tpot_ms = Some(80.0);

        let combined = SloScorer::combine(&slo, &c);
        assert_eq!(combined.ttft_target_ms, 0.0);
        assert_eq!(combined.tpot_target_ms, 50.0);
    }

    #[test]
    fn test_missing_forecasts_are_skipped() {
        let slo = RequestSlo::new(250.0, 50.0, 0, true).unwrap();
        let candidates = vec![candidate("a"), candidate("b")];
        let forecasts = forecasts(&[("b", 100.0, 10.0)]);

        let mut rng = SmallRng::seed_from_u64(5);
        let selection = selected(scorer().select(&slo, &candidates, &forecasts, &mut rng).unwrap());
        assert_eq!(selection.candidate.as_str(), "b");

        let err = scorer()
            .select(&slo, &candidates, &BTreeMap::new(), &mut rng)
            .unwrap_err();
        assert!(matches!(err, Error::AllForecastsUnavailable(2)));
    }

    #[test]
    fn test_fixed_seed_is_reproducible() {
        let slo = RequestSlo::new(500.0, 100.0, 0, true).unwrap();
        let candidates: Vec<Candidate> = ["a", "b", "c", "d"].iter().map(|id| candidate(id)).collect();
        let forecasts = forecasts(&[
            ("a", 100.0, 10.0),
            ("b", 200.0, 20.0),
            ("c", 300.0, 30.0),
            ("d", 400.0, 40.0),
        ]);

        let picks = |seed| {
            let mut rng = SmallRng::seed_from_u64(seed);
            (0..20)
                .map(|_| selected(scorer().select(&slo, &candidates, &forecasts, &mut rng).unwrap()).candidate)
                .collect::<Vec<_>>()
        };
        assert_eq!(picks(42), picks(42));
    }

    #[test]
    fn test_weighted_pick_follows_weights() {
        // least strategy: d has the smallest headroom and the highest weight
        let slo = RequestSlo::new(500.0, 100.0, 0, true).unwrap();
        let candidates: Vec<Candidate> = ["a", "d"].iter().map(|id| candidate(id)).collect();
        let forecasts = forecasts(&[("a", 100.0, 10.0), ("d", 400.0, 40.0)]);

        let mut rng = SmallRng::seed_from_u64(99);
        let mut d_wins = 0;
        for _ in 0..1_000 {
            let selection = selected(scorer().select(&slo, &candidates, &forecasts, &mut rng).unwrap());
            if selection.candidate.as_str() == "d" {
                d_wins += 1;
            }
        }
        // weights 100 vs 1
        assert!(d_wins > 950, "d won {d_wins} times");
    }

    #[test]
    fn test_weighted_index_edges() {
        let mut rng = SmallRng::seed_from_u64(0);
        assert_eq!(weighted_index(&[5.0], &mut rng), 0);
        assert_eq!(score_to_weight(0.0), 1.0);
        assert_eq!(score_to_weight(1.0), 100.0);
        for _ in 0..100 {
            assert!(weighted_index(&[1.0, 1.0, 1.0], &mut rng) < 3);
        }
    }

    #[test]
    fn test_unscreened_infinite_forecast_does_not_panic() {
        let slo = RequestSlo::new(250.0, 50.0, 0, true).unwrap();
        let candidates = vec![candidate("a"), candidate("b"), candidate("c")];
        let forecasts = forecasts(&[
            ("a", f64::INFINITY, 60.0),
            ("b", 300.0, f64::MAX),
            ("c", 400.0, 70.0),
        ]);

        for seed in 0..50 {
            let mut rng = SmallRng::seed_from_u64(seed);
            let selection = selected(scorer().select(&slo, &candidates, &forecasts, &mut rng).unwrap());
            assert_eq!(selection.mode, SelectionMode::Negative);
            assert!(selection.score.is_finite());
        }
    }

    #[test]
    fn test_weighted_index_tolerates_non_finite_weights() {
        let mut rng = SmallRng::seed_from_u64(7);
        for _ in 0..100 {
            // sum overflows to infinity
            assert_eq!(weighted_index(&[f64::MAX, f64::MAX], &mut rng), 0);
            assert_eq!(weighted_index(&[f64::NAN, f64::NAN], &mut rng), 0);
            assert_eq!(weighted_index(&[0.0, 0.0, 0.0], &mut rng), 0);
            // unusable weights are never drawn
            assert_eq!(weighted_index(&[f64::NAN, 3.0, f64::INFINITY], &mut rng), 1);
            assert_eq!(weighted_index(&[-5.0, 0.0, 2.0], &mut rng), 2);
        }
        assert_eq!(score_to_weight(f64::NAN), 1.0);
    }
}
