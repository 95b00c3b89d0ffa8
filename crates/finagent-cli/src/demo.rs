//! Deterministic demo agents
//!
//! Offline stand-ins for the market-data and analysis agents. Every value
//! is derived from the ticker symbol, so repeated runs produce the same
//! report.

use async_trait::async_trait;
use finagent_core::{Agent, Capability, Context, Critique, Error, Result};
use finagent_orchestrator::{AgentDescriptor, CapabilityRegistry, OrchestratorConfig};
use serde_json::{Value, json};
use std::sync::Arc;
use tracing::debug;

const PRICE_HISTORY_DAYS: usize = 30;

/// Register one demo agent per capability
///
/// Fan-out flags come from `config`; when ingestion allows fan-out a mirror
/// feed is registered as its alternate.
pub fn registry(config: &OrchestratorConfig) -> anyhow::Result<CapabilityRegistry> {
    let registry = CapabilityRegistry::from_config(config);
    let agents: [(Capability, Arc<dyn Agent>, bool); 6] = [
        (Capability::Ingest, Arc::new(DataIngestAgent::primary()), true),
        (Capability::TechnicalAnalysis, Arc::new(TechnicalAgent), true),
        (Capability::FundamentalAnalysis, Arc::new(FundamentalAgent), true),
        (Capability::RiskAssessment, Arc::new(RiskAgent), true),
        (Capability::Decision, Arc::new(DecisionAgent), true),
        // Alert registration has side effects
        (Capability::Monitor, Arc::new(MonitorAgent), false),
    ];

    for (capability, agent, idempotent) in agents {
        registry.register(AgentDescriptor::new(capability, agent).idempotent(idempotent))?;
    }

    if config.allows_fan_out(Capability::Ingest) {
        let mirror: Arc<dyn Agent> = Arc::new(DataIngestAgent::mirror());
        registry.register(AgentDescriptor::new(Capability::Ingest, mirror).idempotent(true))?;
    }
    Ok(registry)
}

/// Request tickers from the context, falling back to the input payload
fn tickers(input: &Value, context: &Context) -> Vec<String> {
    if !context.tickers().is_empty() {
        return context.tickers().to_vec();
    }

    input["tickers"]
        .as_array()
        .map(|list| {
            list.iter()
                .filter_map(Value::as_str)
                .map(str::to_string)
                .collect()
        })
        .unwrap_or_default()
}

fn upstream<'a>(input: &'a Value, capability: Capability) -> &'a Value {
    &input["upstream"][capability.as_str()]
}

/// Stable pseudo-random seed for a symbol
fn seed(symbol: &str) -> u64 {
    symbol.bytes().fold(0xcbf2_9ce4_8422_2325, |hash, byte| {
        (hash ^ u64::from(byte)).wrapping_mul(0x0100_0000_01b3)
    })
}

fn unit(seed: u64, salt: u64) -> f64 {
    let mixed = seed.rotate_left((salt % 63) as u32) ^ salt.wrapping_mul(0x9e37_79b9_7f4a_7c15);
    (mixed % 10_000) as f64 / 10_000.0
}

fn round2(value: f64) -> f64 {
    (value * 100.0).round() / 100.0
}

fn closes(snapshot: &Value) -> Vec<f64> {
    snapshot["prices"]
        .as_array()
        .map(|prices| prices.iter().filter_map(Value::as_f64).collect())
        .unwrap_or_default()
}

fn mean(values: &[f64]) -> f64 {
    if values.is_empty() {
        0.0
    } else {
        values.iter().sum::<f64>() / values.len() as f64
    }
}

/// Market snapshot: metadata, filings, price history and headlines
pub struct DataIngestAgent {
    feed: &'static str,
}

impl DataIngestAgent {
    pub fn primary() -> Self {
        Self { feed: "demo-ingest" }
    }

    /// Alternate feed registered when ingestion fans out
    pub fn mirror() -> Self {
        Self {
            feed: "demo-ingest-mirror",
        }
    }
}

#[async_trait]
impl Agent for DataIngestAgent {
    async fn execute(&self, input: Value, context: &Context) -> Result<Value> {
        let symbols = tickers(&input, context);
        if symbols.is_empty() {
            return Err(Error::ProcessingFailed("no tickers to ingest".into()));
        }
        debug!(feed = self.feed, attempt = ?context.attempt(), ?symbols, "Ingesting market snapshot");

        let snapshots: serde_json::Map<String, Value> = symbols
            .iter()
            .map(|symbol| {
                let s = seed(symbol);
                let base = 20.0 + unit(s, 1) * 380.0;
                let drift = (unit(s, 2) - 0.5) * 0.02;
                let prices: Vec<f64> = (0..PRICE_HISTORY_DAYS)
                    .map(|day| {
                        let wave = (day as f64 * 0.7 + unit(s, 3) * 6.0).sin() * 0.015;
                        round2(base * (1.0 + drift * day as f64 + wave))
                    })
                    .collect();

                let snapshot = json!({
                    "meta": {
                        "symbol": symbol,
                        "exchange": if s % 2 == 0 { "NASDAQ" } else { "NYSE" },
                        "feed": self.feed,
                    },
                    "sec": { "latestFiling": if s % 3 == 0 { "10-Q" } else { "10-K" } },
                    "prices": prices,
                    "news": [format!("{symbol} shares active ahead of earnings")],
                });
                (symbol.clone(), snapshot)
            })
            .collect();

        Ok(Value::Object(snapshots))
    }

    fn name(&self) -> &str {
        self.feed
    }
}

/// Trend and momentum from the ingested price history
///
/// Supports self-critique: a first pass without a volatility estimate is
/// sent back for revision.
pub struct TechnicalAgent;

#[async_trait]
impl Agent for TechnicalAgent {
    async fn execute(&self, input: Value, context: &Context) -> Result<Value> {
        let ingest = upstream(&input, Capability::Ingest);
        let revising = input.get("critique").is_some();
        let mut report = serde_json::Map::new();

        for symbol in tickers(&input, context) {
            let prices = closes(&ingest[&symbol]);
            if prices.len() < 2 {
                return Err(Error::ProcessingFailed(format!("no price history for {symbol}")));
            }

            let short = mean(&prices[prices.len().saturating_sub(5)..]);
            let long = mean(&prices);
            let first = prices[0];
            let last = prices[prices.len() - 1];
            let trend = if short > long { "up" } else { "down" };

            let mut entry = json!({
                "sma5": round2(short),
                "sma30": round2(long),
                "momentum": round2((last - first) / first * 100.0),
                "trend": trend,
            });

            if revising {
                let returns: Vec<f64> = prices.windows(2).map(|w| (w[1] - w[0]) / w[0]).collect();
                let avg = mean(&returns);
                let variance = mean(&returns.iter().map(|r| (r - avg).powi(2)).collect::<Vec<_>>());
                entry["volatility"] = json!(round2(variance.sqrt() * 100.0));
            }

            report.insert(symbol, entry);
        }

        Ok(Value::Object(report))
    }

    fn name(&self) -> &str {
        "demo-technical"
    }

    fn supports_critique(&self) -> bool {
        true
    }

    async fn critique(&self, _input: &Value, output: &Value, _context: &Context) -> Result<Critique> {
        let complete = output
            .as_object()
            .is_some_and(|report| report.values().all(|entry| entry.get("volatility").is_some()));

        Ok(if complete {
            Critique::accept(0.9)
        } else {
            Critique::revise(0.5, "add a volatility estimate for risk assessment")
        })
    }
}

/// Valuation metrics
pub struct FundamentalAgent;

#[async_trait]
impl Agent for FundamentalAgent {
    async fn execute(&self, input: Value, context: &Context) -> Result<Value> {
        let report: serde_json::Map<String, Value> = tickers(&input, context)
            .into_iter()
            .map(|symbol| {
                let s = seed(&symbol);
                let pe = round2(8.0 + unit(s, 11) * 40.0);
                let valuation = match pe {
                    pe if pe < 15.0 => "undervalued",
                    pe if pe > 35.0 => "overvalued",
                    _ => "fair",
                };
                let entry = json!({
                    "pe": pe,
                    "epsGrowth": round2((unit(s, 12) - 0.3) * 30.0),
                    "valuation": valuation,
                });
                (symbol, entry)
            })
            .collect();

        Ok(Value::Object(report))
    }

    fn name(&self) -> &str {
        "demo-fundamental"
    }
}

/// Risk level from volatility and valuation
pub struct RiskAgent;

#[async_trait]
impl Agent for RiskAgent {
    async fn execute(&self, input: Value, context: &Context) -> Result<Value> {
        let technical = upstream(&input, Capability::TechnicalAnalysis);
        let fundamental = upstream(&input, Capability::FundamentalAnalysis);

        let report: serde_json::Map<String, Value> = tickers(&input, context)
            .into_iter()
            .map(|symbol| {
                let volatility = technical[&symbol]["volatility"].as_f64().unwrap_or(2.0);
                let overvalued = fundamental[&symbol]["valuation"] == "overvalued";
                let score = volatility + if overvalued { 1.5 } else { 0.0 };
                let level = match score {
                    s if s < 1.5 => "low",
                    s if s < 3.0 => "medium",
                    _ => "high",
                };
                let entry = json!({ "score": round2(score), "level": level });
                (symbol, entry)
            })
            .collect();

        Ok(Value::Object(report))
    }

    fn name(&self) -> &str {
        "demo-risk"
    }
}

/// Buy, hold or sell from the analyses and risk level
pub struct DecisionAgent;

#[async_trait]
impl Agent for DecisionAgent {
    async fn execute(&self, input: Value, context: &Context) -> Result<Value> {
        let risk = upstream(&input, Capability::RiskAssessment);
        let technical = upstream(&input, Capability::TechnicalAnalysis);
        let fundamental = upstream(&input, Capability::FundamentalAnalysis);

        let report: serde_json::Map<String, Value> = tickers(&input, context)
            .into_iter()
            .map(|symbol| {
                let up = technical[&symbol]["trend"] == "up";
                let valuation = fundamental[&symbol]["valuation"].as_str().unwrap_or("fair");
                let high_risk = risk[&symbol]["level"] == "high";

                let action = match (up, valuation, high_risk) {
                    (_, _, true) => "hold",
                    (true, "undervalued" | "fair", false) => "buy",
                    (false, "overvalued", false) => "sell",
                    _ => "hold",
                };
                let entry = json!({ "action": action, "confidence": if high_risk { 0.4 } else { 0.7 } });
                (symbol, entry)
            })
            .collect();

        Ok(Value::Object(report))
    }

    fn name(&self) -> &str {
        "demo-decision"
    }
}

/// Price alerts around the latest close
pub struct MonitorAgent;

#[async_trait]
impl Agent for MonitorAgent {
    async fn execute(&self, input: Value, context: &Context) -> Result<Value> {
        let decision = upstream(&input, Capability::Decision);

        let alerts: Vec<Value> = tickers(&input, context)
            .into_iter()
            .map(|symbol| {
                let action = decision[&symbol]["action"].as_str().unwrap_or("hold");
                let band = if action == "hold" { 5.0 } else { 3.0 };
                json!({ "symbol": symbol, "action": action, "bandPct": band })
            })
            .collect();

        Ok(json!({ "alerts": alerts }))
    }

    fn name(&self) -> &str {
        "demo-monitor"
    }
}
