//! Capability tags
//!
//! A capability names a kind of work that one or more agents can perform.
//! The set is closed: dispatch goes through an explicit tag plus a lookup
//! table, never through reflection.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

/// Kind of work an agent can serve
///
/// Variants are declared in pipeline order, which is also their `Ord` order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum Capability {
    /// Market data and news ingestion
    Ingest,
    /// Technical analysis (trend, indicators, volatility)
    TechnicalAnalysis,
    /// Fundamental analysis (filings, valuation)
    FundamentalAnalysis,
    /// Risk assessment over both analyses
    RiskAssessment,
    /// Final recommendation
    Decision,
    /// Post-decision monitoring
    Monitor,
}

impl Capability {
    /// All capabilities in pipeline order
    pub const ALL: [Capability; 6] = [
        Self::Ingest,
        Self::TechnicalAnalysis,
        Self::FundamentalAnalysis,
        Self::RiskAssessment,
        Self::Decision,
        Self::Monitor,
    ];

    /// Stable string form, also used as the default task id
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Ingest => "ingest",
            Self::TechnicalAnalysis => "technical-analysis",
            Self::FundamentalAnalysis => "fundamental-analysis",
            Self::RiskAssessment => "risk-assessment",
            Self::Decision => "decision",
            Self::Monitor => "monitor",
        }
    }

    /// Whether this capability produces analysis consumed by risk assessment
    pub fn is_analysis(&self) -> bool {
        matches!(self, Self::TechnicalAnalysis | Self::FundamentalAnalysis)
    }
}

impl fmt::Display for Capability {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Error returned when parsing an unknown capability name
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("Unknown capability: {0}")]
pub struct UnknownCapability(pub String);

impl FromStr for Capability {
    type Err = UnknownCapability;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let normalized = s.trim().to_ascii_lowercase().replace('_', "-");
        match normalized.as_str() {
            "ingest" | "ingestion" => Ok(Self::Ingest),
            "technical-analysis" | "technical" => Ok(Self::TechnicalAnalysis),
            "fundamental-analysis" | "fundamental" => Ok(Self::FundamentalAnalysis),
            "risk-assessment" | "risk" => Ok(Self::RiskAssessment),
            "decision" => Ok(Self::Decision),
            "monitor" | "monitoring" => Ok(Self::Monitor),
            _ => Err(UnknownCapability(s.to_string())),
        }
    }
}
