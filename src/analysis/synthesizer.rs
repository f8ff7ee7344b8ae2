// =============================================================================
// Synthesizer — Context in, validated Decision out
// =============================================================================
//
// One synthesize call walks: built -> sent -> received -> validated ->
// {emit | repair -> sent}. At most one repair loop. The hard rules are
// post-conditions on the output, not requests to the model:
//
//   - Levels consistency: each horizon either uses the prior levels
//     unchanged, or moves at most ONE endpoint by <=2% AND carries a
//     rationale. A second violation forces the prior levels back in and
//     sets meta.adjustment = "levels_forced".
//   - Ordering: the bullish/bearish inequality chain must hold.
//   - Confidences clamp to [0, 100]; the decision-level confidence is
//     recomputed as round(0.5*short + 0.3*medium + 0.2*long).
//   - Trend consistency: Bullish/Bearish requires two agreeing horizons.
//   - Risks: at least one non-empty string, deduplicated.
//
// LLM exhaustion never fails the request: the deterministic fallback
// decision is built from the prior levels with the trend taken from the
// MTF alignment sign and meta.llm_fallback = true.
// =============================================================================

use std::sync::Arc;

use chrono::Utc;
use serde::Deserialize;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use crate::analysis::context::ContextDocument;
use crate::analysis::decision::{
    trend_from_horizons, weighted_confidence, Decision, DecisionMeta, HorizonPlan,
};
use crate::analysis::levels::{validate_chain, HorizonLevels, LevelSet, PriorTradingLevels};
use crate::analysis::mtf::MtfSummary;
use crate::llm::client::LlmRequest;
use crate::llm::{JsonKind, LlmClient, ModelTier, PromptParts, PromptSection, SchemaSpec};
use crate::types::{Bias, Horizon};

// =============================================================================
// Arguments
// =============================================================================

pub struct SynthesisArgs<'a> {
    pub symbol: &'a str,
    pub current_price: f64,
    pub context: &'a ContextDocument,
    pub prior: &'a PriorTradingLevels,
    pub mtf: &'a MtfSummary,
    pub tier: ModelTier,
    pub partial: bool,
    pub request_id: &'a str,
}

static DECISION_SCHEMA: SchemaSpec = SchemaSpec {
    required: &[
        ("trend", JsonKind::String),
        ("short_term", JsonKind::Object),
        ("medium_term", JsonKind::Object),
        ("long_term", JsonKind::Object),
        ("risks", JsonKind::Array),
        ("must_watch_levels", JsonKind::Array),
    ],
};

/// Alignment magnitude below which the fallback trend is Neutral.
const FALLBACK_ALIGNMENT_DEADBAND: f64 = 0.05;

/// Maximum relative move of the single adjustable endpoint.
const MAX_ENDPOINT_DRIFT: f64 = 0.02;

// =============================================================================
// Synthesizer
// =============================================================================

pub struct Synthesizer {
    llm: Arc<LlmClient>,
}

impl Synthesizer {
    pub fn new(llm: Arc<LlmClient>) -> Self {
        Self { llm }
    }

    /// Produce the final decision. Never errors: every LLM failure mode
    /// degrades to the deterministic fallback.
    pub async fn synthesize(
        &self,
        args: &SynthesisArgs<'_>,
        cancel: &CancellationToken,
    ) -> Decision {
        let started = std::time::Instant::now();

        // built -> sent
        let request = self.build_request(args, None);
        let first = match self.llm.generate(&request, cancel).await {
            Ok(resp) => resp,
            Err(e) => {
                warn!(symbol = %args.symbol, error = %e, "synthesis LLM unavailable — deterministic fallback");
                return fallback_decision(args, started.elapsed().as_millis() as u64);
            }
        };

        // received -> validated
        match self.accept(args, &first.value, Some(first.model.clone()), started) {
            Ok(decision) => decision,
            Err(violations) => {
                info!(
                    symbol = %args.symbol,
                    violations = violations.len(),
                    "decision rejected — one repair attempt"
                );
                // repair -> sent (exactly once)
                let repair = self.build_request(args, Some(&violations));
                let second = match self.llm.generate(&repair, cancel).await {
                    Ok(resp) => resp,
                    Err(e) => {
                        warn!(symbol = %args.symbol, error = %e, "repair attempt failed — deterministic fallback");
                        return fallback_decision(args, started.elapsed().as_millis() as u64);
                    }
                };

                match self.accept(args, &second.value, Some(second.model.clone()), started) {
                    Ok(decision) => decision,
                    Err(second_violations) => {
                        warn!(
                            symbol = %args.symbol,
                            violations = ?second_violations,
                            "second validation failure — forcing prior levels"
                        );
                        forced_decision(
                            args,
                            &second.value,
                            Some(second.model),
                            started.elapsed().as_millis() as u64,
                        )
                    }
                }
            }
        }
    }

    fn build_request(&self, args: &SynthesisArgs<'_>, violations: Option<&[String]>) -> LlmRequest {
        let mut preamble = String::from(
            "You are the final synthesis step of a market-analysis engine. Reconcile the\n\
             analyzer outputs below into one trading decision.\n\
             Respond with ONLY a JSON object with fields: trend\n\
             (\"Bullish\"|\"Bearish\"|\"Neutral\"), confidence_pct, short_term, medium_term,\n\
             long_term, risks (array of strings), must_watch_levels (array of numbers),\n\
             trading_strategy (string). Each horizon object needs: bias, confidence_pct,\n\
             entry_range ([low, high]), stop_loss, targets (array, nearest first),\n\
             rationale.\n\
             The prior_trading_levels block is authoritative: reuse its levels for each\n\
             horizon. If you adjust, change at most one endpoint per horizon, by at most\n\
             2 percent, and explain the change in that horizon's rationale.",
        );

        if let Some(violations) = violations {
            preamble.push_str(
                "\n\nYour previous response violated these rules and was rejected:\n",
            );
            for v in violations {
                preamble.push_str("- ");
                preamble.push_str(v);
                preamble.push('\n');
            }
            preamble.push_str("Re-emit the decision using the prior levels exactly as given.");
        }

        let anchor = format!(
            "symbol: {}\ncurrent_price: {:.4}\nprior_trading_levels: {}",
            args.symbol,
            args.current_price,
            serde_json::to_value(args.prior)
                .map(|v| v.to_string())
                .unwrap_or_default(),
        );

        LlmRequest {
            parts: PromptParts {
                preamble,
                anchor,
                sections: vec![PromptSection {
                    name: "context",
                    body: args.context.serialized.clone(),
                    priority: 5,
                }],
            },
            system: "You are a disciplined market analyst. Output JSON only.".to_string(),
            schema: DECISION_SCHEMA,
            tier: args.tier,
        }
    }

    /// Parse + validate a model response into a decision.
    fn accept(
        &self,
        args: &SynthesisArgs<'_>,
        value: &serde_json::Value,
        model: Option<String>,
        started: std::time::Instant,
    ) -> Result<Decision, Vec<String>> {
        let draft: DraftDecision = serde_json::from_value(value.clone())
            .map_err(|e| vec![format!("response shape invalid: {e}")])?;

        let mut violations: Vec<String> = Vec::new();
        let mut horizons: Vec<HorizonPlan> = Vec::new();

        for horizon in Horizon::ALL {
            let draft_h = draft.horizon(horizon);
            let prior_h = args.prior.horizon(horizon);
            match accept_horizon(horizon, draft_h, prior_h) {
                Ok(plan) => horizons.push(plan),
                Err(mut v) => violations.append(&mut v),
            }
        }

        let risks = clean_risks(&draft.risks);
        if risks.is_empty() {
            violations.push("risks must contain at least one non-empty string".to_string());
        }

        if !violations.is_empty() {
            return Err(violations);
        }

        let [short, medium, long]: [HorizonPlan; 3] =
            horizons.try_into().expect("three horizons");

        let trend = trend_from_horizons([short.bias, medium.bias, long.bias]);
        let confidence_pct = weighted_confidence(
            short.confidence_pct,
            medium.confidence_pct,
            long.confidence_pct,
        );

        Ok(Decision {
            symbol: args.symbol.to_string(),
            timestamp: Utc::now().timestamp_millis(),
            trend,
            confidence_pct,
            short_term: short,
            medium_term: medium,
            long_term: long,
            risks,
            must_watch_levels: clean_levels(&draft.must_watch_levels),
            mtf_context: serde_json::to_value(args.mtf).unwrap_or_default(),
            sector_context: args.context.value["sector_signals"].clone(),
            meta: DecisionMeta {
                partial: args.partial,
                llm_fallback: false,
                adjustment: None,
                model,
                request_id: args.request_id.to_string(),
                duration_ms: started.elapsed().as_millis() as u64,
            },
        })
    }
}

// =============================================================================
// Horizon validation
// =============================================================================

/// Validate one horizon draft against its prior levels and the ordering
/// chain. Returns the accepted plan or the rule violations.
fn accept_horizon(
    horizon: Horizon,
    draft: &DraftHorizon,
    prior: &HorizonLevels,
) -> Result<HorizonPlan, Vec<String>> {
    let mut violations = Vec::new();

    let bias = Bias::parse_lenient(&draft.bias).unwrap_or(prior.bias);

    if draft.entry_range.len() != 2 {
        violations.push(format!("{horizon}: entry_range must be [low, high]"));
        return Err(violations);
    }
    let levels = LevelSet {
        entry_range: [draft.entry_range[0], draft.entry_range[1]],
        stop_loss: draft.stop_loss,
        targets: draft.targets.clone(),
    };

    // Levels consistency against the anchor.
    let drift = endpoint_drifts(&levels, &prior.levels);
    match drift {
        EndpointDrift::Unchanged => {}
        EndpointDrift::OneEndpoint { name, rel } => {
            if rel > MAX_ENDPOINT_DRIFT {
                violations.push(format!(
                    "{horizon}: endpoint {name} moved {:.2}%, beyond the 2% allowance",
                    rel * 100.0
                ));
            } else if draft.rationale.as_deref().map(str::trim).unwrap_or("").is_empty() {
                violations.push(format!(
                    "{horizon}: endpoint {name} was adjusted without a rationale"
                ));
            }
        }
        EndpointDrift::Multiple(count) => {
            violations.push(format!(
                "{horizon}: {count} endpoints differ from prior levels (max one)"
            ));
        }
        EndpointDrift::ShapeMismatch => {
            violations.push(format!(
                "{horizon}: target count differs from prior levels"
            ));
        }
    }

    // Ordering chain.
    if let Err(e) = validate_chain(bias, &levels) {
        violations.push(format!("{horizon}: ordering violated: {e}"));
    }

    if !violations.is_empty() {
        return Err(violations);
    }

    Ok(HorizonPlan {
        bias,
        confidence_pct: draft.confidence_pct.unwrap_or(50.0).clamp(0.0, 100.0),
        entry_range: levels.entry_range,
        stop_loss: levels.stop_loss,
        targets: levels.targets,
        rationale: draft
            .rationale
            .clone()
            .unwrap_or_else(|| "aligned with prior levels".to_string()),
    })
}

enum EndpointDrift {
    Unchanged,
    OneEndpoint { name: &'static str, rel: f64 },
    Multiple(usize),
    ShapeMismatch,
}

/// Compare every endpoint of a horizon's levels against the prior.
fn endpoint_drifts(candidate: &LevelSet, prior: &LevelSet) -> EndpointDrift {
    if candidate.targets.len() != prior.targets.len() {
        return EndpointDrift::ShapeMismatch;
    }

    let rel = |a: f64, b: f64| {
        if b == 0.0 {
            if a == 0.0 {
                0.0
            } else {
                f64::INFINITY
            }
        } else {
            (a - b).abs() / b.abs()
        }
    };

    let mut moved: Vec<(&'static str, f64)> = Vec::new();
    let mut check = |name: &'static str, a: f64, b: f64| {
        let r = rel(a, b);
        if r > 1e-9 {
            moved.push((name, r));
        }
    };

    check("entry_low", candidate.entry_range[0], prior.entry_range[0]);
    check("entry_high", candidate.entry_range[1], prior.entry_range[1]);
    check("stop_loss", candidate.stop_loss, prior.stop_loss);
    for (i, (&a, &b)) in candidate.targets.iter().zip(prior.targets.iter()).enumerate() {
        let r = rel(a, b);
        if r > 1e-9 {
            moved.push((if i == 0 { "target_1" } else { "target_n" }, r));
        }
    }

    match moved.len() {
        0 => EndpointDrift::Unchanged,
        1 => EndpointDrift::OneEndpoint {
            name: moved[0].0,
            rel: moved[0].1,
        },
        n => EndpointDrift::Multiple(n),
    }
}

// =============================================================================
// Fallback & forced decisions
// =============================================================================

/// Plan a horizon directly from its prior levels.
fn plan_from_prior(prior: &HorizonLevels, confidence: f64, rationale: String) -> HorizonPlan {
    HorizonPlan {
        bias: prior.bias,
        confidence_pct: confidence.clamp(0.0, 100.0),
        entry_range: prior.levels.entry_range,
        stop_loss: prior.levels.stop_loss,
        targets: prior.levels.targets.clone(),
        rationale,
    }
}

/// Deterministic decision when the LLM is unreachable: horizons verbatim
/// from the prior levels, trend from the MTF alignment sign.
fn fallback_decision(args: &SynthesisArgs<'_>, duration_ms: u64) -> Decision {
    let alignment = args.mtf.alignment;
    let trend = if alignment > FALLBACK_ALIGNMENT_DEADBAND {
        Bias::Bullish
    } else if alignment < -FALLBACK_ALIGNMENT_DEADBAND {
        Bias::Bearish
    } else {
        Bias::Neutral
    };

    let confidence = (40.0 + alignment.abs() * 40.0).round();
    let rationale = format!(
        "deterministic levels from indicator stage (mtf alignment {alignment:.2})"
    );

    let short = plan_from_prior(&args.prior.short_term, confidence, rationale.clone());
    let medium = plan_from_prior(&args.prior.medium_term, confidence, rationale.clone());
    let long = plan_from_prior(&args.prior.long_term, confidence, rationale);

    let confidence_pct = weighted_confidence(
        short.confidence_pct,
        medium.confidence_pct,
        long.confidence_pct,
    );

    Decision {
        symbol: args.symbol.to_string(),
        timestamp: Utc::now().timestamp_millis(),
        trend,
        confidence_pct,
        short_term: short,
        medium_term: medium,
        long_term: long,
        risks: vec![
            "language model unavailable; decision derived from deterministic levels".to_string(),
        ],
        must_watch_levels: vec![
            args.prior.short_term.levels.stop_loss,
            args.prior.short_term.levels.targets[0],
        ],
        mtf_context: serde_json::to_value(args.mtf).unwrap_or_default(),
        sector_context: args.context.value["sector_signals"].clone(),
        meta: DecisionMeta {
            partial: args.partial,
            llm_fallback: true,
            adjustment: None,
            model: None,
            request_id: args.request_id.to_string(),
            duration_ms,
        },
    }
}

/// Decision after a second validation failure: prior levels forced in,
/// narrative fields salvaged from the (invalid) response where harmless.
fn forced_decision(
    args: &SynthesisArgs<'_>,
    value: &serde_json::Value,
    model: Option<String>,
    duration_ms: u64,
) -> Decision {
    let draft: Option<DraftDecision> = serde_json::from_value(value.clone()).ok();

    let horizon_conf = |h: Horizon| -> f64 {
        draft
            .as_ref()
            .and_then(|d| d.horizon(h).confidence_pct)
            .unwrap_or(50.0)
            .clamp(0.0, 100.0)
    };
    let horizon_rationale = |h: Horizon| -> String {
        draft
            .as_ref()
            .and_then(|d| d.horizon(h).rationale.clone())
            .filter(|r| !r.trim().is_empty())
            .unwrap_or_else(|| "prior levels enforced".to_string())
    };

    let short = plan_from_prior(
        &args.prior.short_term,
        horizon_conf(Horizon::ShortTerm),
        horizon_rationale(Horizon::ShortTerm),
    );
    let medium = plan_from_prior(
        &args.prior.medium_term,
        horizon_conf(Horizon::MediumTerm),
        horizon_rationale(Horizon::MediumTerm),
    );
    let long = plan_from_prior(
        &args.prior.long_term,
        horizon_conf(Horizon::LongTerm),
        horizon_rationale(Horizon::LongTerm),
    );

    let mut risks = draft
        .as_ref()
        .map(|d| clean_risks(&d.risks))
        .unwrap_or_default();
    if risks.is_empty() {
        risks.push("synthesis output failed validation; levels were enforced".to_string());
    }

    let trend = trend_from_horizons([short.bias, medium.bias, long.bias]);
    let confidence_pct = weighted_confidence(
        short.confidence_pct,
        medium.confidence_pct,
        long.confidence_pct,
    );

    Decision {
        symbol: args.symbol.to_string(),
        timestamp: Utc::now().timestamp_millis(),
        trend,
        confidence_pct,
        short_term: short,
        medium_term: medium,
        long_term: long,
        risks,
        must_watch_levels: draft
            .as_ref()
            .map(|d| clean_levels(&d.must_watch_levels))
            .unwrap_or_default(),
        mtf_context: serde_json::to_value(args.mtf).unwrap_or_default(),
        sector_context: args.context.value["sector_signals"].clone(),
        meta: DecisionMeta {
            partial: args.partial,
            llm_fallback: false,
            adjustment: Some("levels_forced".to_string()),
            model,
            request_id: args.request_id.to_string(),
            duration_ms,
        },
    }
}

// =============================================================================
// Draft shapes & cleaning
// =============================================================================

#[derive(Debug, Deserialize)]
struct DraftDecision {
    #[serde(default)]
    #[allow(dead_code)]
    trend: Option<String>,
    short_term: DraftHorizon,
    medium_term: DraftHorizon,
    long_term: DraftHorizon,
    #[serde(default)]
    risks: Vec<String>,
    #[serde(default)]
    must_watch_levels: Vec<f64>,
}

impl DraftDecision {
    fn horizon(&self, horizon: Horizon) -> &DraftHorizon {
        match horizon {
            Horizon::ShortTerm => &self.short_term,
            Horizon::MediumTerm => &self.medium_term,
            Horizon::LongTerm => &self.long_term,
        }
    }
}

#[derive(Debug, Deserialize)]
struct DraftHorizon {
    #[serde(default)]
    bias: String,
    #[serde(default)]
    confidence_pct: Option<f64>,
    #[serde(default)]
    entry_range: Vec<f64>,
    #[serde(default)]
    stop_loss: f64,
    #[serde(default)]
    targets: Vec<f64>,
    #[serde(default)]
    rationale: Option<String>,
}

/// Deduplicate, trim, and drop empty risk strings, preserving order.
fn clean_risks(risks: &[String]) -> Vec<String> {
    let mut seen = std::collections::HashSet::new();
    risks
        .iter()
        .map(|r| r.trim().to_string())
        .filter(|r| !r.is_empty())
        .filter(|r| seen.insert(r.to_lowercase()))
        .collect()
}

fn clean_levels(levels: &[f64]) -> Vec<f64> {
    let mut out: Vec<f64> = levels.iter().copied().filter(|l| l.is_finite()).collect();
    out.dedup();
    out
}
