// =============================================================================
// Prompt composition, token budgeting, and structured-output schemas
// =============================================================================
//
// A prompt is an instruction preamble, an anchor block (the prior-levels
// data that must never be truncated), and a list of droppable sections with
// priorities. Budget enforcement removes whole sections lowest-priority
// first; the preamble and the anchor are untouchable — if they alone exceed
// the budget the request is rejected rather than silently mangled.
// =============================================================================

use serde_json::Value;

/// Rough token estimate: four characters per token. Close enough for budget
/// enforcement; the provider does the exact accounting.
pub fn approx_tokens(text: &str) -> usize {
    text.len() / 4
}

// =============================================================================
// Prompt parts
// =============================================================================

/// A droppable prompt section. Lower `priority` is dropped first.
#[derive(Debug, Clone)]
pub struct PromptSection {
    pub name: &'static str,
    pub body: String,
    pub priority: u8,
}

/// The composable prompt.
#[derive(Debug, Clone)]
pub struct PromptParts {
    /// Instruction preamble. Never truncated.
    pub preamble: String,
    /// Anchor data block (prior trading levels, current price). Never
    /// truncated.
    pub anchor: String,
    /// Droppable sections, any order.
    pub sections: Vec<PromptSection>,
}

impl PromptParts {
    /// Render within `budget_tokens`, dropping whole sections
    /// lowest-priority-first. Returns the rendered prompt and the names of
    /// dropped sections, or `Err` with the irreducible size when preamble +
    /// anchor alone do not fit.
    pub fn render_within(&self, budget_tokens: usize) -> Result<(String, Vec<&'static str>), usize> {
        let fixed = approx_tokens(&self.preamble) + approx_tokens(&self.anchor);
        if fixed > budget_tokens {
            return Err(fixed);
        }

        let mut kept: Vec<&PromptSection> = self.sections.iter().collect();
        kept.sort_by_key(|s| std::cmp::Reverse(s.priority));

        let mut dropped: Vec<&'static str> = Vec::new();
        loop {
            let total: usize =
                fixed + kept.iter().map(|s| approx_tokens(&s.body)).sum::<usize>();
            if total <= budget_tokens {
                break;
            }
            // Lowest priority sits at the tail after the reverse sort.
            match kept.pop() {
                Some(section) => dropped.push(section.name),
                None => break,
            }
        }

        let mut out = String::with_capacity(self.preamble.len() + self.anchor.len() + 256);
        out.push_str(&self.preamble);
        out.push_str("\n\n");
        out.push_str(&self.anchor);
        for section in &kept {
            out.push_str("\n\n");
            out.push_str(&section.body);
        }

        Ok((out, dropped))
    }
}

// =============================================================================
// Structured-output schema
// =============================================================================

/// Expected JSON kind of a required top-level field.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum JsonKind {
    String,
    Number,
    Array,
    Object,
}

impl JsonKind {
    fn matches(self, value: &Value) -> bool {
        match self {
            JsonKind::String => value.is_string(),
            JsonKind::Number => value.is_number(),
            JsonKind::Array => value.is_array(),
            JsonKind::Object => value.is_object(),
        }
    }
}

/// Required top-level fields of a structured response.
#[derive(Debug, Clone, Copy)]
pub struct SchemaSpec {
    pub required: &'static [(&'static str, JsonKind)],
}

impl SchemaSpec {
    /// Validate a parsed response. Returns the first mismatch as a parser
    /// error message usable in a repair prompt.
    pub fn validate(&self, value: &Value) -> Result<(), String> {
        let obj = value
            .as_object()
            .ok_or_else(|| "response is not a JSON object".to_string())?;

        for (name, kind) in self.required {
            match obj.get(*name) {
                None => return Err(format!("missing required field '{name}'")),
                Some(v) if !kind.matches(v) => {
                    return Err(format!("field '{name}' has wrong type, expected {kind:?}"))
                }
                Some(_) => {}
            }
        }
        Ok(())
    }
}

/// Extract the first JSON object from raw model output, tolerating code
/// fences and surrounding prose.
pub fn extract_json(raw: &str) -> Result<Value, String> {
    let trimmed = raw.trim();

    // Direct parse first.
    if let Ok(v) = serde_json::from_str::<Value>(trimmed) {
        return Ok(v);
    }

    // Strip a ```json fence if present.
    if let Some(inner) = trimmed
        .strip_prefix("```json")
        .or_else(|| trimmed.strip_prefix("```"))
    {
        if let Some(inner) = inner.rsplit_once("```").map(|(a, _)| a) {
            if let Ok(v) = serde_json::from_str::<Value>(inner.trim()) {
                return Ok(v);
            }
        }
    }

    // Last resort: first '{' to last '}'.
    if let (Some(start), Some(end)) = (trimmed.find('{'), trimmed.rfind('}')) {
        if end > start {
            if let Ok(v) = serde_json::from_str::<Value>(&trimmed[start..=end]) {
                return Ok(v);
            }
        }
    }

    Err("no parseable JSON object in response".to_string())
}

// =============================================================================
// Tests
// =============================================================================
#[cfg(test)]
mod tests {
    use super::*;

    fn parts(section_sizes: &[(&'static str, usize, u8)]) -> PromptParts {
        PromptParts {
            preamble: "x".repeat(400), // ~100 tokens
            anchor: "y".repeat(400),   // ~100 tokens
            sections: section_sizes
                .iter()
                .map(|&(name, chars, priority)| PromptSection {
                    name,
                    body: "z".repeat(chars),
                    priority,
                })
                .collect(),
        }
    }

    #[test]
    fn everything_fits_nothing_dropped() {
        let p = parts(&[("a", 400, 1), ("b", 400, 2)]);
        let (rendered, dropped) = p.render_within(1_000).unwrap();
        assert!(dropped.is_empty());
        assert!(rendered.len() > 1_200);
    }

    #[test]
    fn lowest_priority_dropped_first() {
        // fixed = 200 tokens; sections are 100 tokens each; budget 350
        // forces one drop: the priority-1 section goes, priority-9 stays.
        let p = parts(&[("geometry", 400, 1), ("mtf_detail", 400, 9)]);
        let (rendered, dropped) = p.render_within(350).unwrap();
        assert_eq!(dropped, vec!["geometry"]);
        assert!(rendered.contains(&"z".repeat(400)));
    }

    #[test]
    fn preamble_and_anchor_never_dropped() {
        let p = parts(&[("a", 4_000, 1)]);
        let (rendered, dropped) = p.render_within(250).unwrap();
        assert_eq!(dropped, vec!["a"]);
        assert!(rendered.contains(&"x".repeat(400)));
        assert!(rendered.contains(&"y".repeat(400)));
    }

    #[test]
    fn irreducible_overflow_rejected() {
        let p = parts(&[]);
        // fixed is ~200 tokens; a 100-token budget cannot hold it.
        let err = p.render_within(100).unwrap_err();
        assert!(err >= 200);
    }

    #[test]
    fn schema_validation() {
        const SCHEMA: SchemaSpec = SchemaSpec {
            required: &[("trend", JsonKind::String), ("confidence_pct", JsonKind::Number)],
        };

        let good = serde_json::json!({"trend": "Bullish", "confidence_pct": 78});
        assert!(SCHEMA.validate(&good).is_ok());

        let missing = serde_json::json!({"trend": "Bullish"});
        let err = SCHEMA.validate(&missing).unwrap_err();
        assert!(err.contains("confidence_pct"));

        let wrong = serde_json::json!({"trend": 5, "confidence_pct": 78});
        assert!(SCHEMA.validate(&wrong).unwrap_err().contains("trend"));

        assert!(SCHEMA.validate(&serde_json::json!([1, 2])).is_err());
    }

    #[test]
    fn extract_json_variants() {
        assert!(extract_json(r#"{"a": 1}"#).is_ok());
        assert!(extract_json("```json\n{\"a\": 1}\n```").is_ok());
        assert!(extract_json("Here you go:\n{\"a\": 1}\nHope that helps!").is_ok());
        assert!(extract_json("no json here").is_err());
    }
}
