//! Per-request profile selection

use crate::baseline::BaselineProfile;
use mesh_core::{ProfileName, ProfilesConfig, RequestContext, Result};
use tracing::debug;

/// Chooses the `slo` or `default` profile for each request
pub struct ProfileRouter {
    profiles: ProfilesConfig,
    baseline: BaselineProfile,
}

impl ProfileRouter {
    pub fn new(profiles: ProfilesConfig) -> Result<Self> {
        profiles.validate()?;
        let baseline = BaselineProfile::from_plugins(&profiles.default)?;
        Ok(Self { profiles, baseline })
    }

    /// `slo` when the request asks for prediction-based scheduling, else `default`
    pub fn route(&self, context: &RequestContext) -> ProfileName {
        let profile = if context.prediction_requested() {
            ProfileName::Slo
        } else {
            ProfileName::Default
        };
        debug!(
            request_id = %context.request_id,
            profile = %profile,
            plugins = ?self.plugin_names(profile),
            "Routed request to profile"
        );
        profile
    }

    /// Plugin names of a profile, in order
    pub fn plugin_names(&self, profile: ProfileName) -> Vec<&str> {
        self.profiles
            .plugins(profile)
            .iter()
            .map(|p| p.name.as_str())
            .collect()
    }

    /// The baseline profile, also the fallback when no forecast arrives
    pub fn baseline(&self) -> &BaselineProfile {
        &self.baseline
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use mesh_core::slo::PREDICTION_HEADER;
    use mesh_core::{PluginConfig, SloFields};

    fn router() -> ProfileRouter {
        ProfileRouter::new(ProfilesConfig::default()).unwrap()
    }

    #[test]
    fn test_prediction_header_selects_slo() {
        let ctx = RequestContext::new("r1").with_header(PREDICTION_HEADER, "true");
        assert_eq!(router().route(&ctx), ProfileName::Slo);
    }

    #[test]
    fn test_absent_signal_selects_default() {
        let ctx = RequestContext::new("r1");
        assert_eq!(router().route(&ctx), ProfileName::Default);

        let ctx = RequestContext::new("r2").with_header(PREDICTION_HEADER, "false");
        assert_eq!(router().route(&ctx), ProfileName::Default);
    }

    #[test]
    fn test_structured_field_overrides_header() {
        let ctx = RequestContext::new("r1")
            .with_header(PREDICTION_HEADER, "true")
            .with_slo_fields(SloFields {
                prediction_enabled: Some(false),
                ..SloFields::default()
            });
        assert_eq!(router().route(&ctx), ProfileName::Default);
    }

    #[test]
    fn test_plugin_names() {
        let router = router();
        assert_eq!(router.plugin_names(ProfileName::Default), vec!["queue", "kv-cache", "prefix"]);
        assert_eq!(router.plugin_names(ProfileName::Slo), vec!["slo-headroom"]);
        assert_eq!(router.baseline().scorer_names().len(), 3);
    }

    #[test]
    fn test_invalid_profiles_rejected() {
        let mut profiles = ProfilesConfig::default();
        profiles.slo.push(PluginConfig::new("queue", 1.0));
        assert!(ProfileRouter::new(profiles).is_err());
    }
}
