// =============================================================================
// Analyzer Executor — concurrent waves with isolation and timeouts
// =============================================================================
//
// Analyzers whose dependencies are satisfied run concurrently in a JoinSet,
// each under its own hard timeout. One analyzer's failure never cancels
// another; a failed dependency marks its dependents `skipped` without
// running them. Request cancellation is cooperative: in-flight analyzers
// observe the token at their next I/O boundary and come back as `timeout`.
// =============================================================================

use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};

use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::analysis::agent::{AgentResult, AnalysisInputs, Analyzer};
use crate::analysis::registry::AnalyzerRegistry;

/// Run the given analyzer ids to completion and return `id -> AgentResult`.
///
/// `default_timeout_ms` caps any analyzer whose spec declares a longer
/// timeout than the orchestrator allows.
pub async fn run_analyzers(
    registry: &AnalyzerRegistry,
    ids: &[&str],
    inputs: &AnalysisInputs,
    cancel: &CancellationToken,
    default_timeout_ms: u64,
) -> HashMap<String, AgentResult> {
    let mut done: HashMap<String, AgentResult> = HashMap::new();

    // Unknown ids resolve to failed results rather than silently vanishing.
    let mut pending: Vec<Arc<dyn Analyzer>> = Vec::new();
    for &id in ids {
        match registry.get(id) {
            Some(analyzer) => pending.push(analyzer),
            None => {
                warn!(id, "unknown analyzer id requested");
                done.insert(
                    id.to_string(),
                    AgentResult::failed(id, "unknown analyzer id", 0),
                );
            }
        }
    }

    while !pending.is_empty() {
        // Partition into this wave (deps satisfied) and the remainder.
        let mut wave: Vec<Arc<dyn Analyzer>> = Vec::new();
        let mut rest: Vec<Arc<dyn Analyzer>> = Vec::new();

        for analyzer in pending {
            let deps = analyzer.spec().required_inputs.prior_results;
            let unresolved = deps.iter().any(|d| !done.contains_key(*d));
            if unresolved {
                rest.push(analyzer);
                continue;
            }
            let failed_dep = deps
                .iter()
                .find(|d| done.get(**d).map(|r| !r.is_ok()).unwrap_or(true));
            if let Some(dep) = failed_dep {
                let id = analyzer.spec().id;
                debug!(id, dep, "dependency not ok — skipping analyzer");
                done.insert(
                    id.to_string(),
                    AgentResult::skipped(id, format!("dependency '{dep}' not ok")),
                );
            } else {
                wave.push(analyzer);
            }
        }

        if wave.is_empty() {
            // No progress possible: the remainder has unsatisfiable
            // dependencies (cycle or missing id).
            for analyzer in rest {
                let id = analyzer.spec().id;
                done.insert(
                    id.to_string(),
                    AgentResult::skipped(id, "unsatisfiable dependency"),
                );
            }
            break;
        }

        let wave_inputs = inputs.with_prior(done.clone());
        let mut join_set: JoinSet<AgentResult> = JoinSet::new();

        for analyzer in wave {
            let inputs = wave_inputs.clone();
            let cancel = cancel.clone();
            let timeout_ms = analyzer.spec().timeout_ms.min(default_timeout_ms);
            join_set.spawn(async move {
                run_one(analyzer, &inputs, &cancel, timeout_ms).await
            });
        }

        while let Some(joined) = join_set.join_next().await {
            match joined {
                Ok(result) => {
                    debug!(
                        agent = %result.agent_id,
                        status = ?result.status,
                        duration_ms = result.duration_ms,
                        "analyzer finished"
                    );
                    done.insert(result.agent_id.clone(), result);
                }
                Err(join_err) => {
                    // A panicked analyzer is isolated to a failed result.
                    warn!(error = %join_err, "analyzer task panicked");
                    done.insert(
                        format!("panicked-{}", done.len()),
                        AgentResult::failed("unknown", format!("task panicked: {join_err}"), 0),
                    );
                }
            }
        }

        pending = rest;
    }

    done
}

/// Execute one analyzer under its timeout and the request cancel token.
async fn run_one(
    analyzer: Arc<dyn Analyzer>,
    inputs: &AnalysisInputs,
    cancel: &CancellationToken,
    timeout_ms: u64,
) -> AgentResult {
    let id = analyzer.spec().id;
    let started = Instant::now();

    let outcome = tokio::select! {
        _ = cancel.cancelled() => {
            return AgentResult::timed_out(id, started.elapsed().as_millis() as u64);
        }
        result = tokio::time::timeout(
            Duration::from_millis(timeout_ms),
            analyzer.run(cancel, inputs),
        ) => result,
    };

    let duration_ms = started.elapsed().as_millis() as u64;
    match outcome {
        Ok(Ok(out)) => {
            AgentResult::ok(id, out.confidence, out.payload, duration_ms).with_model(out.model)
        }
        Ok(Err(e)) => AgentResult::failed(id, e.to_string(), duration_ms),
        Err(_elapsed) => AgentResult::timed_out(id, duration_ms),
    }
}

// =============================================================================
// Tests
// =============================================================================
#[cfg(test)]
mod tests {
    use super::*;
    use crate::analysis::agent::{
        AgentOutcome, AgentStatus, AnalyzerSpec, CostClass, RequiredInputs,
    };
    use crate::indicators::IndicatorSnapshot;
    use crate::llm::ModelTier;
    use crate::types::Timeframe;
    use async_trait::async_trait;

    const fn spec(id: &'static str, deps: &'static [&'static str], timeout_ms: u64) -> AnalyzerSpec {
        AnalyzerSpec {
            id,
            required_inputs: RequiredInputs {
                candles: true,
                indicators: true,
                patterns: false,
                chart_image: false,
                prior_results: deps,
            },
            timeout_ms,
            cost_class: CostClass::Cheap,
            model_preference: ModelTier::Auto,
        }
    }

    enum Behaviour {
        Succeed,
        Fail,
        Hang,
    }

    struct TestAnalyzer {
        spec: AnalyzerSpec,
        behaviour: Behaviour,
    }

    #[async_trait]
    impl Analyzer for TestAnalyzer {
        fn spec(&self) -> &AnalyzerSpec {
            &self.spec
        }

        async fn run(
            &self,
            cancel: &CancellationToken,
            _inputs: &AnalysisInputs,
        ) -> anyhow::Result<AgentOutcome> {
            match self.behaviour {
                Behaviour::Succeed => Ok(AgentOutcome {
                    confidence: 70.0,
                    payload: serde_json::json!({"bias": "Bullish"}),
                    model: None,
                }),
                Behaviour::Fail => anyhow::bail!("deterministic failure"),
                Behaviour::Hang => {
                    cancel.cancelled().await;
                    anyhow::bail!("cancelled")
                }
            }
        }
    }

    fn inputs() -> AnalysisInputs {
        AnalysisInputs {
            symbol: "ACME".into(),
            exchange: "NSE".into(),
            timeframe: Timeframe::M5,
            current_price: 100.0,
            candles: Arc::new(Vec::new()),
            indicators: Arc::new(IndicatorSnapshot::default()),
            tick_size: None,
            prior: Arc::new(HashMap::new()),
        }
    }

    fn registry(analyzers: Vec<TestAnalyzer>) -> AnalyzerRegistry {
        let mut reg = AnalyzerRegistry::empty();
        for a in analyzers {
            reg.register(Arc::new(a));
        }
        reg
    }

    #[tokio::test]
    async fn one_failure_never_cancels_others() {
        let reg = registry(vec![
            TestAnalyzer {
                spec: spec("good_a", &[], 5_000),
                behaviour: Behaviour::Succeed,
            },
            TestAnalyzer {
                spec: spec("bad", &[], 5_000),
                behaviour: Behaviour::Fail,
            },
            TestAnalyzer {
                spec: spec("good_b", &[], 5_000),
                behaviour: Behaviour::Succeed,
            },
        ]);

        let results = run_analyzers(
            &reg,
            &["good_a", "bad", "good_b"],
            &inputs(),
            &CancellationToken::new(),
            20_000,
        )
        .await;

        assert_eq!(results["good_a"].status, AgentStatus::Ok);
        assert_eq!(results["good_b"].status, AgentStatus::Ok);
        assert_eq!(results["bad"].status, AgentStatus::Failed);
    }

    #[tokio::test]
    async fn dependent_runs_after_dependency() {
        let reg = registry(vec![
            TestAnalyzer {
                spec: spec("base", &[], 5_000),
                behaviour: Behaviour::Succeed,
            },
            TestAnalyzer {
                spec: spec("dependent", &["base"], 5_000),
                behaviour: Behaviour::Succeed,
            },
        ]);

        let results = run_analyzers(
            &reg,
            &["dependent", "base"],
            &inputs(),
            &CancellationToken::new(),
            20_000,
        )
        .await;

        assert_eq!(results["base"].status, AgentStatus::Ok);
        assert_eq!(results["dependent"].status, AgentStatus::Ok);
    }

    #[tokio::test]
    async fn failed_dependency_skips_dependent() {
        let reg = registry(vec![
            TestAnalyzer {
                spec: spec("base", &[], 5_000),
                behaviour: Behaviour::Fail,
            },
            TestAnalyzer {
                spec: spec("dependent", &["base"], 5_000),
                behaviour: Behaviour::Succeed,
            },
        ]);

        let results = run_analyzers(
            &reg,
            &["base", "dependent"],
            &inputs(),
            &CancellationToken::new(),
            20_000,
        )
        .await;

        assert_eq!(results["base"].status, AgentStatus::Failed);
        assert_eq!(results["dependent"].status, AgentStatus::Skipped);
    }

    #[tokio::test]
    async fn hung_analyzer_times_out() {
        let reg = registry(vec![TestAnalyzer {
            spec: spec("slow", &[], 50),
            behaviour: Behaviour::Hang,
        }]);

        let started = Instant::now();
        let results = run_analyzers(&reg, &["slow"], &inputs(), &CancellationToken::new(), 20_000)
            .await;

        assert_eq!(results["slow"].status, AgentStatus::Timeout);
        assert!(started.elapsed() < Duration::from_secs(2));
    }

    #[tokio::test]
    async fn cancellation_terminates_within_grace() {
        let reg = registry(vec![
            TestAnalyzer {
                spec: spec("hang_a", &[], 60_000),
                behaviour: Behaviour::Hang,
            },
            TestAnalyzer {
                spec: spec("hang_b", &[], 60_000),
                behaviour: Behaviour::Hang,
            },
        ]);

        let cancel = CancellationToken::new();
        let cancel2 = cancel.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(50)).await;
            cancel2.cancel();
        });

        let started = Instant::now();
        let results =
            run_analyzers(&reg, &["hang_a", "hang_b"], &inputs(), &cancel, 60_000).await;

        // All tasks terminated well within the 2s grace.
        assert!(started.elapsed() < Duration::from_secs(2));
        assert_eq!(results["hang_a"].status, AgentStatus::Timeout);
        assert_eq!(results["hang_b"].status, AgentStatus::Timeout);
    }

    #[tokio::test]
    async fn unknown_id_is_failed_result() {
        let reg = registry(vec![]);
        let results =
            run_analyzers(&reg, &["ghost"], &inputs(), &CancellationToken::new(), 1_000).await;
        assert_eq!(results["ghost"].status, AgentStatus::Failed);
    }

    #[tokio::test]
    async fn unsatisfiable_dependency_is_skipped() {
        let reg = registry(vec![TestAnalyzer {
            spec: spec("orphan", &["never_registered"], 5_000),
            behaviour: Behaviour::Succeed,
        }]);
        let results =
            run_analyzers(&reg, &["orphan"], &inputs(), &CancellationToken::new(), 1_000).await;
        assert_eq!(results["orphan"].status, AgentStatus::Skipped);
    }
}
