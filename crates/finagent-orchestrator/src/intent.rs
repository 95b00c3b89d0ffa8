//! Free-text query classification
//!
//! Keyword-based mapping from an English or Chinese query to the
//! capabilities it asks for, plus ticker extraction.

use crate::request::TaskSelection;
use finagent_core::Capability;
use std::collections::BTreeSet;

/// Keywords for intent classification (English)
mod keywords_en {
    pub const INGEST: &[&str] = &[
        "price",
        "quote",
        "latest",
        "news",
        "headline",
        "filing",
        "how much",
    ];

    pub const TECHNICAL: &[&str] = &[
        "technical",
        "rsi",
        "macd",
        "moving average",
        "bollinger",
        "indicator",
        "chart",
        "trend",
        "support",
        "resistance",
        "momentum",
        "stochastic",
    ];

    pub const FUNDAMENTAL: &[&str] = &[
        "fundamental",
        "p/e",
        "pe ratio",
        "valuation",
        "market cap",
        "dividend",
        "eps",
        "earnings",
        "revenue",
        "margin",
        "balance sheet",
        "10-k",
        "10-q",
    ];

    pub const RISK: &[&str] = &[
        "risk",
        "volatility",
        "drawdown",
        "value at risk",
        "exposure",
        "beta",
    ];

    pub const DECISION: &[&str] = &[
        "buy",
        "sell",
        "hold",
        "recommend",
        "should i",
        "decision",
        "invest",
    ];

    pub const MONITOR: &[&str] = &["monitor", "watch", "alert", "track", "notify"];

    pub const COMPREHENSIVE: &[&str] = &[
        "comprehensive",
        "full analysis",
        "complete analysis",
        "in-depth",
        "thorough",
    ];
}

/// Keywords for intent classification (Chinese)
mod keywords_zh {
    pub const INGEST: &[&str] = &["价格", "股价", "报价", "现价", "新闻", "公告"];

    pub const TECHNICAL: &[&str] = &[
        "技术分析",
        "技术指标",
        "均线",
        "移动平均",
        "布林带",
        "趋势",
        "支撑",
        "阻力",
        "动量",
    ];

    pub const FUNDAMENTAL: &[&str] = &[
        "基本面", "市盈率", "估值", "市值", "股息", "每股收益", "营收", "财报",
    ];

    pub const RISK: &[&str] = &["风险", "波动", "回撤"];

    pub const DECISION: &[&str] = &["买入", "卖出", "持有", "建议", "投资"];

    pub const MONITOR: &[&str] = &["监控", "盯盘", "提醒", "跟踪"];

    pub const COMPREHENSIVE: &[&str] = &["综合分析", "全面分析", "深入分析", "全方位"];
}

/// Words that look like tickers but are not
const TICKER_STOPWORDS: &[&str] = &[
    "A", "I", "AND", "OR", "THE", "FOR", "VS", "IS", "IT", "OF", "ON", "TO", "RSI", "MACD",
    "EPS", "PE", "SMA", "EMA", "ATR", "CPI", "GDP", "SEC", "ETF", "USD", "VAR",
];

/// Keyword-based query classifier
#[derive(Debug, Clone, Default)]
pub struct IntentClassifier;

impl IntentClassifier {
    pub fn new() -> Self {
        Self
    }

    /// Map a query to a task selection
    ///
    /// Comprehensive phrasing, or no recognizable keyword at all, selects
    /// the full pipeline.
    pub fn classify(&self, query: &str) -> TaskSelection {
        let query_lower = query.to_lowercase();

        if matches_any(&query_lower, keywords_en::COMPREHENSIVE)
            || matches_any(&query_lower, keywords_zh::COMPREHENSIVE)
        {
            return TaskSelection::FullPipeline;
        }

        let kinds = detect_capabilities(&query_lower);
        tracing::debug!(query, ?kinds, "Classified query");

        if kinds.is_empty() {
            TaskSelection::FullPipeline
        } else {
            TaskSelection::Kinds(kinds.into_iter().collect())
        }
    }

    /// Extract stock symbols (1-5 upper-case letters) in order of appearance
    pub fn extract_tickers(&self, query: &str) -> Vec<String> {
        let mut tickers: Vec<String> = Vec::new();

        for word in query.split(|c: char| !c.is_ascii_alphanumeric()) {
            let looks_like_ticker = (1..=5).contains(&word.len())
                && word.chars().all(|c| c.is_ascii_uppercase());
            if looks_like_ticker
                && !TICKER_STOPWORDS.contains(&word)
                && !tickers.iter().any(|t| t == word)
            {
                tickers.push(word.to_string());
            }
        }

        tickers
    }
}

fn detect_capabilities(query: &str) -> BTreeSet<Capability> {
    let tables: [(Capability, &[&str], &[&str]); 6] = [
        (Capability::Ingest, keywords_en::INGEST, keywords_zh::INGEST),
        (
            Capability::TechnicalAnalysis,
            keywords_en::TECHNICAL,
            keywords_zh::TECHNICAL,
        ),
        (
            Capability::FundamentalAnalysis,
            keywords_en::FUNDAMENTAL,
            keywords_zh::FUNDAMENTAL,
        ),
        (Capability::RiskAssessment, keywords_en::RISK, keywords_zh::RISK),
        (Capability::Decision, keywords_en::DECISION, keywords_zh::DECISION),
        (Capability::Monitor, keywords_en::MONITOR, keywords_zh::MONITOR),
    ];

    tables
        .into_iter()
        .filter(|(_, en, zh)| matches_any(query, en) || matches_any(query, zh))
        .map(|(capability, _, _)| capability)
        .collect()
}

/// Check if query contains any of the keywords
fn matches_any(query: &str, keywords: &[&str]) -> bool {
    keywords.iter().any(|kw| query.contains(kw))
}
