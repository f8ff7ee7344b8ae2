// =============================================================================
// Sector Benchmark Analyzer — relative strength vs. the sector index
// =============================================================================
//
// The only analyzer with its own data dependency: it fetches the benchmark
// series through the CandleSource seam, so it observes cancellation at that
// I/O boundary and tests drive it with fixtures.
// =============================================================================

use std::sync::Arc;

use async_trait::async_trait;
use serde_json::json;
use tokio_util::sync::CancellationToken;

use crate::analysis::agent::{
    AgentOutcome, AnalysisInputs, Analyzer, AnalyzerSpec, CostClass, RequiredInputs,
};
use crate::llm::ModelTier;
use crate::market_data::aggregator::Candle;
use crate::provider::CandleSource;
use crate::types::Bias;

pub const SECTOR_ID: &str = "sector_benchmark";

static SECTOR_SPEC: AnalyzerSpec = AnalyzerSpec {
    id: SECTOR_ID,
    required_inputs: RequiredInputs {
        candles: true,
        indicators: false,
        patterns: false,
        chart_image: false,
        prior_results: &[],
    },
    timeout_ms: 15_000,
    cost_class: CostClass::Standard,
    model_preference: ModelTier::Auto,
};

pub struct SectorBenchmarkAnalyzer {
    source: Arc<dyn CandleSource>,
    benchmark_symbol: String,
}

impl SectorBenchmarkAnalyzer {
    pub fn new(source: Arc<dyn CandleSource>, benchmark_symbol: String) -> Self {
        Self {
            source,
            benchmark_symbol,
        }
    }
}

#[async_trait]
impl Analyzer for SectorBenchmarkAnalyzer {
    fn spec(&self) -> &AnalyzerSpec {
        &SECTOR_SPEC
    }

    async fn run(
        &self,
        cancel: &CancellationToken,
        inputs: &AnalysisInputs,
    ) -> anyhow::Result<AgentOutcome> {
        let stock = inputs.candles.as_slice();
        if stock.len() < 25 {
            anyhow::bail!("insufficient candles for sector comparison");
        }

        let benchmark = self
            .source
            .candles(
                &self.benchmark_symbol,
                &inputs.exchange,
                inputs.timeframe,
                30,
                cancel,
            )
            .await?;
        if benchmark.len() < 25 {
            anyhow::bail!("insufficient benchmark candles");
        }

        let stock_returns = returns(stock);
        let bench_returns = returns(&benchmark);
        let n = stock_returns.len().min(bench_returns.len()).min(60);
        let stock_tail = &stock_returns[stock_returns.len() - n..];
        let bench_tail = &bench_returns[bench_returns.len() - n..];

        let relative_strength =
            stock_tail.iter().sum::<f64>() - bench_tail.iter().sum::<f64>();
        let correlation = pearson(stock_tail, bench_tail).unwrap_or(0.0);

        // Correlations over shrinking windows: the droppable matrix the
        // context builder discards last-resort.
        let correlation_matrix: Vec<serde_json::Value> = [10, 20, n]
            .iter()
            .filter(|&&w| w >= 5 && w <= n)
            .map(|&w| {
                let c = pearson(
                    &stock_tail[stock_tail.len() - w..],
                    &bench_tail[bench_tail.len() - w..],
                )
                .unwrap_or(0.0);
                json!({ "window": w, "correlation": c })
            })
            .collect();

        let outperforming = relative_strength > 0.0;
        let bias = if relative_strength > 0.5 {
            Bias::Bullish
        } else if relative_strength < -0.5 {
            Bias::Bearish
        } else {
            Bias::Neutral
        };

        Ok(AgentOutcome {
            confidence: (45.0 + relative_strength.abs() * 8.0).min(85.0),
            payload: json!({
                "bias": bias.to_string(),
                "benchmark_symbol": self.benchmark_symbol,
                "relative_strength_pct": relative_strength,
                "correlation": correlation,
                "correlation_matrix": correlation_matrix,
                "outperforming": outperforming,
            }),
            model: None,
        })
    }
}

/// Close-to-close percentage returns.
fn returns(candles: &[Candle]) -> Vec<f64> {
    candles
        .windows(2)
        .filter(|w| w[0].close != 0.0)
        .map(|w| (w[1].close - w[0].close) / w[0].close * 100.0)
        .collect()
}

/// Pearson correlation; `None` for degenerate inputs.
fn pearson(a: &[f64], b: &[f64]) -> Option<f64> {
    let n = a.len().min(b.len());
    if n < 3 {
        return None;
    }
    let a = &a[..n];
    let b = &b[..n];

    let mean_a = a.iter().sum::<f64>() / n as f64;
    let mean_b = b.iter().sum::<f64>() / n as f64;

    let mut cov = 0.0;
    let mut var_a = 0.0;
    let mut var_b = 0.0;
    for i in 0..n {
        let da = a[i] - mean_a;
        let db = b[i] - mean_b;
        cov += da * db;
        var_a += da * da;
        var_b += db * db;
    }
    if var_a == 0.0 || var_b == 0.0 {
        return None;
    }
    let r = cov / (var_a.sqrt() * var_b.sqrt());
    r.is_finite().then_some(r)
}
