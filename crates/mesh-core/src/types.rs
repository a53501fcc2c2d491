//! Core type definitions for the scheduling core

use serde::{Deserialize, Serialize};
use std::fmt;
use uuid::Uuid;

/// Identifier of a serving replica (a scheduling candidate)
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct CandidateId(String);

impl CandidateId {
    /// Create a new CandidateId from a string
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    /// Get the string representation of the CandidateId
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for CandidateId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<String> for CandidateId {
    fn from(id: String) -> Self {
        Self(id)
    }
}

impl From<&str> for CandidateId {
    fn from(id: &str) -> Self {
        Self(id.to_string())
    }
}

/// Identifier of an inference request flowing through the scheduler
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct RequestId(String);

impl RequestId {
    /// Create a new RequestId from a string
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    /// Generate a random RequestId
    pub fn generate() -> Self {
        Self(Uuid::new_v4().to_string())
    }

    /// Get the string representation of the RequestId
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for RequestId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<String> for RequestId {
    fn from(id: String) -> Self {
        Self(id)
    }
}

impl From<&str> for RequestId {
    fn from(id: &str) -> Self {
        Self(id.to_string())
    }
}

/// Latency metric an SLO target applies to
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Metric {
    /// Time to first token
    Ttft,
    /// Time per output token
    Tpot,
}

impl fmt::Display for Metric {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Metric::Ttft => write!(f, "ttft"),
            Metric::Tpot => write!(f, "tpot"),
        }
    }
}

/// Named scheduling profiles
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ProfileName {
    /// Baseline queue/cache/prefix scoring
    Default,
    /// Predictive SLO-aware scoring
    Slo,
}

impl ProfileName {
    pub fn as_str(&self) -> &'static str {
        match self {
            ProfileName::Default => "default",
            ProfileName::Slo => "slo",
        }
    }
}

impl std::str::FromStr for ProfileName {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "default" => Ok(ProfileName::Default),
            "slo" => Ok(ProfileName::Slo),
            _ => Err(format!("Unknown profile: {}", s)),
        }
    }
}

impl fmt::Display for ProfileName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// How candidates inside the positive-headroom bucket are ranked
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum HeadroomStrategy {
    /// Prefer the smallest non-negative headroom (pack replicas near their limit)
    Least,
    /// Prefer the largest headroom (spread load)
    Most,
}

impl std::str::FromStr for HeadroomStrategy {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "least" => Ok(HeadroomStrategy::Least),
            "most" => Ok(HeadroomStrategy::Most),
            _ => Err(format!("Unknown headroom strategy: {}", s)),
        }
    }
}

impl fmt::Display for HeadroomStrategy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            HeadroomStrategy::Least => write!(f, "least"),
            HeadroomStrategy::Most => write!(f, "most"),
        }
    }
}

/// Forecaster endpoint selection strategy
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum EndpointSelection {
    /// Rotate through endpoints with a shared counter
    RoundRobin,
    /// Hash the request id onto an endpoint
    HashedByRequest,
}

impl std::str::FromStr for EndpointSelection {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "round-robin" => Ok(EndpointSelection::RoundRobin),
            "hashed-by-request" | "hashed" => Ok(EndpointSelection::HashedByRequest),
            _ => Err(format!("Unknown endpoint selection: {}", s)),
        }
    }
}
