//! Baseline scorers of the `default` profile
//!
//! Queue depth, KV-cache occupancy and prefix overlap, each producing a factor
//! in [0, 1] where higher is better. Factors are combined with per-plugin
//! weights and the highest aggregate wins, ties going to the lowest candidate
//! id.

use mesh_core::config::{KV_CACHE_PLUGIN, PREFIX_PLUGIN, QUEUE_PLUGIN};
use mesh_core::{Candidate, CandidateId, Error, LiveFeatures, PluginConfig, Result};
use serde::Serialize;
use tracing::debug;

/// A single load signal scorer
pub trait BaselineScorer: Send + Sync {
    /// Plugin name as used in profile configuration
    fn name(&self) -> &'static str;

    /// Factor for every candidate, in input order
    fn score(&self, candidates: &[Candidate]) -> Vec<f64>;
}

/// Prefers replicas with fewer waiting and running requests
#[derive(Debug, Default)]
pub struct QueueScorer;

impl BaselineScorer for QueueScorer {
    fn name(&self) -> &'static str {
        QUEUE_PLUGIN
    }

    fn score(&self, candidates: &[Candidate]) -> Vec<f64> {
        let depth = |f: &LiveFeatures| f.waiting_requests as f64 + f.running_requests as f64;
        let max = candidates
            .iter()
            .map(|c| depth(&c.features))
            .fold(0.0, f64::max);
        candidates
            .iter()
            .map(|c| if max > 0.0 { 1.0 - depth(&c.features) / max } else { 1.0 })
            .collect()
    }
}

/// Prefers replicas with free KV-cache
#[derive(Debug, Default)]
pub struct KvCacheScorer;

impl BaselineScorer for KvCacheScorer {
    fn name(&self) -> &'static str {
        KV_CACHE_PLUGIN
    }

    fn score(&self, candidates: &[Candidate]) -> Vec<f64> {
        candidates
            .iter()
            .map(|c| 1.0 - c.features.kv_cache_usage.clamp(0.0, 1.0))
            .collect()
    }
}

/// Prefers replicas already holding the request's prefix
#[derive(Debug, Default)]
pub struct PrefixScorer;

impl BaselineScorer for PrefixScorer {
    fn name(&self) -> &'static str {
        PREFIX_PLUGIN
    }

    fn score(&self, candidates: &[Candidate]) -> Vec<f64> {
        candidates
            .iter()
            .map(|c| c.features.prefix_cache_score.clamp(0.0, 1.0))
            .collect()
    }
}

/// Scorer factory
pub struct BaselineScorerFactory;

impl BaselineScorerFactory {
    pub fn create(name: &str) -> Result<Box<dyn BaselineScorer>> {
        match name {
            QUEUE_PLUGIN => Ok(Box::new(QueueScorer)),
            KV_CACHE_PLUGIN => Ok(Box::new(KvCacheScorer)),
            PREFIX_PLUGIN => Ok(Box::new(PrefixScorer)),
            other => Err(Error::config(format!("Unknown baseline scorer '{}'", other))),
        }
    }
}

/// Weighted aggregate of one candidate
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct BaselinePick {
    pub candidate: CandidateId,
    pub score: f64,
}

/// The `default` profile: weighted baseline scorers and a max-score pick
pub struct BaselineProfile {
    scorers: Vec<(Box<dyn BaselineScorer>, f64)>,
}

impl BaselineProfile {
    /// Build from the profile's plugin list
    pub fn from_plugins(plugins: &[PluginConfig]) -> Result<Self> {
        let scorers = plugins
            .iter()
            .map(|p| BaselineScorerFactory::create(&p.name).map(|s| (s, p.weight)))
            .collect::<Result<Vec<_>>>()?;
        if scorers.is_empty() {
            return Err(Error::config("Baseline profile has no scorers"));
        }
        Ok(Self { scorers })
    }

    /// Scorer names in evaluation order
    pub fn scorer_names(&self) -> Vec<&'static str> {
        self.scorers.iter().map(|(s, _)| s.name()).collect()
    }

    /// Aggregate scores of every candidate, in input order
    pub fn score(&self, candidates: &[Candidate]) -> Vec<f64> {
        let mut totals = vec![0.0; candidates.len()];
        for (scorer, weight) in &self.scorers {
            for (total, factor) in totals.iter_mut().zip(scorer.score(candidates)) {
                *total += weight * factor;
            }
        }
        totals
    }

    /// Highest aggregate score, ties to the lowest candidate id
    pub fn pick(&self, candidates: &[Candidate]) -> Option<BaselinePick> {
        let scores = self.score(candidates);
        let best = candidates
            .iter()
            .zip(scores)
            .fold(None::<(&Candidate, f64)>, |best, (candidate, score)| match best {
                Some((b, s)) if s > score || (s == score && b.id <= candidate.id) => Some((b, s)),
                _ => Some((candidate, score)),
            })?;

        debug!(candidate = %best.0.id, score = best.1, "Baseline pick");
        Some(BaselinePick {
            candidate: best.0.id.clone(),
            score: best.1,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use mesh_core::ProfilesConfig;

    fn candidate(id: &str, waiting: u32, kv: f64, prefix: f64) -> Candidate {
        Candidate::new(
            id,
            LiveFeatures {
                kv_cache_usage: kv,
                input_tokens: 0,
                waiting_requests: waiting,
                running_requests: 0,
                prefix_cache_score: prefix,
            },
        )
    }

    fn default_profile() -> BaselineProfile {
        BaselineProfile::from_plugins(&ProfilesConfig::default().default).unwrap()
    }

    #[test]
    fn test_queue_scorer() {
        let scores = QueueScorer.score(&[candidate("a", 0, 0.0, 0.0), candidate("b", 10, 0.0, 0.0)]);
        assert_eq!(scores, vec![1.0, 0.0]);

        let idle = QueueScorer.score(&[candidate("a", 0, 0.0, 0.0)]);
        assert_eq!(idle, vec![1.0]);
    }

    #[test]
    fn test_queue_scorer_counts_running_requests() {
        let mut busy = candidate("busy", 2, 0.0, 0.0);
        busy.features.running_requests = 6;
        let mut light = candidate("light", 2, 0.0, 0.0);
        light.features.running_requests = 0;

        let scores = QueueScorer.score(&[busy, light]);
        assert_eq!(scores, vec![0.0, 0.75]);

        // running work alone still counts as depth
        let mut running_only = candidate("r", 0, 0.0, 0.0);
        running_only.features.running_requests = 4;
        let scores = QueueScorer.score(&[running_only, candidate("idle", 0, 0.0, 0.0)]);
        assert_eq!(scores, vec![0.0, 1.0]);
    }

    #[test]
    fn test_kv_and_prefix_scorers() {
        let candidates = [candidate("a", 0, 0.25, 0.9)];
        assert_eq!(KvCacheScorer.score(&candidates), vec![0.75]);
        assert_eq!(PrefixScorer.score(&candidates), vec![0.9]);
    }

    #[test]
    fn test_pick_highest_aggregate() {
        let profile = default_profile();
        assert_eq!(profile.scorer_names(), vec!["queue", "kv-cache", "prefix"]);

        let candidates = vec![
            candidate("a", 8, 0.9, 0.0),
            candidate("b", 1, 0.2, 0.5),
            candidate("c", 4, 0.5, 0.1),
        ];
        assert_eq!(profile.pick(&candidates).unwrap().candidate.as_str(), "b");
    }

    #[test]
    fn test_ties_go_to_lowest_id() {
        let profile = default_profile();
        let candidates = vec![
            candidate("z", 2, 0.5, 0.5),
            candidate("m", 2, 0.5, 0.5),
            candidate("q", 2, 0.5, 0.5),
        ];
        assert_eq!(profile.pick(&candidates).unwrap().candidate.as_str(), "m");
    }

    #[test]
    fn test_weights_apply() {
        let plugins = vec![
            PluginConfig::new(PREFIX_PLUGIN, 10.0),
            PluginConfig::new(KV_CACHE_PLUGIN, 1.0),
        ];
        let profile = BaselineProfile::from_plugins(&plugins).unwrap();
        let candidates = vec![candidate("a", 0, 0.0, 0.0), candidate("b", 0, 0.9, 0.5)];
        assert_eq!(profile.pick(&candidates).unwrap().candidate.as_str(), "b");
    }

    #[test]
    fn test_unknown_plugin_rejected() {
        assert!(BaselineProfile::from_plugins(&[PluginConfig::new("slo-headroom", 1.0)]).is_err());
        assert!(BaselineProfile::from_plugins(&[]).is_err());
        assert!(default_profile().pick(&[]).is_none());
    }
}
