//! Extract, heal and validate the JSON idea payload from a raw model response.

use std::collections::BTreeMap;

use serde_json::{Map, Value};

use crate::idea::{ConcreteExample, CriterionEvaluation, IdeaDraft, QuestionAnswer};
use crate::prompt::DOMAIN_SEPARATOR;
use crate::scoring::{criterion_key, MAX_SCORE, MIN_SCORE};

/// Characters of the raw response kept in a parse failure.
pub const PREVIEW_CHARS: usize = 1000;

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ParseError {
    #[error("response is not valid JSON: {message}")]
    Parse { message: String, preview: String },
    #[error("missing required fields: {}", .0.join(", "))]
    MissingFields(Vec<&'static str>),
    #[error("concreteExample is malformed, missing: {}", .0.join(", "))]
    MalformedExample(Vec<&'static str>),
    #[error("criteria without questions: {}", .0.join(", "))]
    IncompleteCriteria(Vec<String>),
    #[error("expected {expected} criteria, got {actual}")]
    CriteriaCountMismatch { expected: usize, actual: usize },
}

impl ParseError {
    pub fn code(&self) -> &'static str {
        match self {
            Self::Parse { .. } => "parse_failed",
            Self::MissingFields(_) => "missing_fields",
            Self::MalformedExample(_) => "malformed_example",
            Self::IncompleteCriteria(_) => "incomplete_criteria",
            Self::CriteriaCountMismatch { .. } => "criteria_count_mismatch",
        }
    }
}

// =============================================================================
// JSON repair
// =============================================================================

/// Remove a leading ```` ``` ```` / ```` ```json ```` fence and a trailing fence.
pub fn strip_code_fences(raw: &str) -> &str {
    let mut s = raw.trim();
    if let Some(rest) = s.strip_prefix("```") {
        // Drop the info string ("json", "JSON", ...) up to the first newline.
        s = match rest.find('\n') {
            Some(nl) if rest[..nl].chars().all(|c| c.is_ascii_alphanumeric()) => &rest[nl + 1..],
            _ => rest.trim_start_matches(|c: char| c.is_ascii_alphabetic()),
        };
    }
    s = s.trim_end();
    if let Some(rest) = s.strip_suffix("```") {
        s = rest;
    }
    s.trim()
}

/// Parse a model response as JSON, healing truncation once.
///
/// Strict parse first. On failure, anything before the first `{` is dropped, an open
/// string is closed, and the missing `]` then `}` are appended before a single retry.
pub fn repair_json(raw: &str) -> Result<Value, ParseError> {
    let stripped = strip_code_fences(raw);

    let first_err = match serde_json::from_str::<Value>(stripped) {
        Ok(v) => return Ok(v),
        Err(e) => e,
    };

    let body = stripped.find('{').map(|i| &stripped[i..]).unwrap_or(stripped);
    let healed = balance(body);

    serde_json::from_str::<Value>(&healed).map_err(|_| ParseError::Parse {
        message: first_err.to_string(),
        preview: raw.chars().take(PREVIEW_CHARS).collect(),
    })
}

/// Count unmatched openers outside strings and append their closers.
fn balance(s: &str) -> String {
    let mut braces = 0i64;
    let mut brackets = 0i64;
    let mut in_string = false;
    let mut escape = false;

    for c in s.chars() {
        if escape {
            escape = false;
            continue;
        }
        if c == '\\' && in_string {
            escape = true;
            continue;
        }
        if c == '"' {
            in_string = !in_string;
            continue;
        }
        if in_string {
            continue;
        }
        match c {
            '{' => braces += 1,
            '}' => braces -= 1,
            '[' => brackets += 1,
            ']' => brackets -= 1,
            _ => {}
        }
    }

    let mut out = s.trim_end().to_string();
    if in_string {
        // A dangling escape would swallow the closing quote.
        if escape {
            out.pop();
        }
        out.push('"');
    }
    for _ in 0..brackets.max(0) {
        out.push(']');
    }
    for _ in 0..braces.max(0) {
        out.push('}');
    }
    out
}

// =============================================================================
// Validation
// =============================================================================

/// Repair and validate a raw response into an [`IdeaDraft`].
///
/// `expected_criteria` enforces the evaluation size when given.
pub fn parse_idea(raw: &str, expected_criteria: Option<usize>) -> Result<IdeaDraft, ParseError> {
    let value = repair_json(raw)?;
    validate_idea(&value, expected_criteria)
}

pub fn validate_idea(value: &Value, expected_criteria: Option<usize>) -> Result<IdeaDraft, ParseError> {
    let empty = Map::new();
    let obj = value.as_object().unwrap_or(&empty);

    let name = text(obj, "name");
    let quick_summary = text(obj, "quickSummary");
    let example = obj.get("concreteExample");
    let evaluation = obj.get("evaluation").and_then(Value::as_object);

    let mut missing = Vec::new();
    if name.is_empty() {
        missing.push("name");
    }
    if quick_summary.is_empty() {
        missing.push("quickSummary");
    }
    if example.is_none() {
        missing.push("concreteExample");
    }
    if evaluation.is_none() {
        missing.push("evaluation");
    }
    let (Some(example), Some(evaluation)) = (example, evaluation) else {
        return Err(ParseError::MissingFields(missing));
    };
    if !missing.is_empty() {
        return Err(ParseError::MissingFields(missing));
    }

    let concrete_example = concrete_example(example)?;
    let evaluation = criteria(evaluation)?;

    if let Some(expected) = expected_criteria {
        if evaluation.len() != expected {
            return Err(ParseError::CriteriaCountMismatch {
                expected,
                actual: evaluation.len(),
            });
        }
    }

    let (domain, subdomain) = split_domain(&text(obj, "domain"));
    let explicit_sub = text(obj, "subdomain");
    let subdomain = if explicit_sub.is_empty() {
        subdomain
    } else {
        Some(explicit_sub)
    };

    let tags = obj
        .get("tags")
        .and_then(Value::as_array)
        .map(|tags| {
            tags.iter()
                .filter_map(Value::as_str)
                .map(str::trim)
                .filter(|t| !t.is_empty())
                .map(str::to_string)
                .collect()
        })
        .unwrap_or_default();

    Ok(IdeaDraft {
        name,
        domain,
        subdomain,
        problem: text(obj, "problem"),
        solution: text(obj, "solution"),
        quick_summary,
        concrete_example,
        evaluation,
        tags,
    })
}

/// Split "Domain | Subdomain" into trimmed parts.
pub fn split_domain(raw: &str) -> (String, Option<String>) {
    match raw.split_once(DOMAIN_SEPARATOR) {
        Some((domain, sub)) => {
            let sub = sub.trim();
            (
                domain.trim().to_string(),
                (!sub.is_empty()).then(|| sub.to_string()),
            )
        }
        None => (raw.trim().to_string(), None),
    }
}

fn text(obj: &Map<String, Value>, key: &str) -> String {
    obj.get(key)
        .and_then(Value::as_str)
        .map(str::trim)
        .unwrap_or_default()
        .to_string()
}

fn concrete_example(value: &Value) -> Result<ConcreteExample, ParseError> {
    let empty = Map::new();
    let obj = value.as_object().unwrap_or(&empty);
    let fields = ["currentState", "yourSolution", "keyImprovement"];
    let missing: Vec<&'static str> = fields
        .into_iter()
        .filter(|f| text(obj, f).is_empty())
        .collect();
    if !missing.is_empty() {
        return Err(ParseError::MalformedExample(missing));
    }
    Ok(ConcreteExample {
        current_state: text(obj, "currentState"),
        your_solution: text(obj, "yourSolution"),
        key_improvement: text(obj, "keyImprovement"),
    })
}

fn criteria(
    evaluation: &Map<String, Value>,
) -> Result<BTreeMap<String, CriterionEvaluation>, ParseError> {
    let mut out = BTreeMap::new();
    let mut incomplete = Vec::new();

    for (raw_key, entry) in evaluation {
        let questions: Vec<QuestionAnswer> = entry
            .get("questions")
            .and_then(Value::as_array)
            .map(|qs| qs.iter().filter_map(question).collect())
            .unwrap_or_default();
        if questions.is_empty() {
            incomplete.push(raw_key.clone());
            continue;
        }
        out.insert(
            criterion_key(raw_key),
            CriterionEvaluation {
                score: entry.get("score").and_then(score),
                reasoning: entry
                    .get("reasoning")
                    .and_then(Value::as_str)
                    .unwrap_or_default()
                    .trim()
                    .to_string(),
                questions,
            },
        );
    }

    if !incomplete.is_empty() {
        return Err(ParseError::IncompleteCriteria(incomplete));
    }
    Ok(out)
}

/// `"question"` strings or `{"question", "answer"}` objects.
fn question(value: &Value) -> Option<QuestionAnswer> {
    match value {
        Value::String(q) if !q.trim().is_empty() => Some(QuestionAnswer {
            question: q.trim().to_string(),
            answer: String::new(),
        }),
        Value::Object(obj) => {
            let q = text(obj, "question");
            (!q.is_empty()).then(|| QuestionAnswer {
                question: q,
                answer: text(obj, "answer"),
            })
        }
        _ => None,
    }
}

/// Numeric or numeric-string score, rounded and clamped to 1..=10.
fn score(value: &Value) -> Option<u8> {
    let n = match value {
        Value::Number(n) => n.as_f64()?,
        Value::String(s) => s.trim().parse::<f64>().ok()?,
        _ => return None,
    };
    if !n.is_finite() {
        return None;
    }
    Some(n.round().clamp(f64::from(MIN_SCORE), f64::from(MAX_SCORE)) as u8)
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn sample_idea() -> Value {
        json!({
            "name": "ShelfSense",
            "domain": "Retail | Grocery",
            "problem": "Stockouts",
            "solution": "Cameras",
            "quickSummary": "Shelf gap alerts",
            "concreteExample": {
                "currentState": "Manual walks",
                "yourSolution": "Alerts",
                "keyImprovement": "Faster restock"
            },
            "evaluation": {
                "Market Size": {"score": 8, "reasoning": "big", "questions": [{"question": "How big?", "answer": "Large"}]},
                "timeToMarket": {"score": "6", "reasoning": "needs permits", "questions": ["Launch date?"]}
            },
            "tags": ["retail", " ", "vision"]
        })
    }

    #[test]
    fn fenced_truncated_object_is_repaired() {
        let v = repair_json("```json\n{\"a\":1\n").unwrap();
        assert_eq!(v, json!({"a": 1}));
    }

    #[test]
    fn valid_json_is_untouched() {
        let raw = r#"{"a": [1, 2, {"b": "c}"}]}"#;
        assert_eq!(repair_json(raw).unwrap(), serde_json::from_str::<Value>(raw).unwrap());
    }

    #[test]
    fn truncation_after_backslash_drops_the_dangling_escape() {
        let v = repair_json("{\"name\": \"abc\\").unwrap();
        assert_eq!(v["name"], "abc");
    }

    #[test]
    fn brackets_close_before_braces() {
        let v = repair_json(r#"{"tags": ["a", "b""#).unwrap();
        assert_eq!(v, json!({"tags": ["a", "b"]}));
    }

    #[test]
    fn open_string_is_closed() {
        let v = repair_json(r#"{"name": "Shelf"#).unwrap();
        assert_eq!(v, json!({"name": "Shelf"}));
    }

    #[test]
    fn prose_before_json_is_dropped() {
        let v = repair_json("Here you go:\n{\"a\": {\"b\": 2}").unwrap();
        assert_eq!(v, json!({"a": {"b": 2}}));
    }

    #[test]
    fn irreparable_text_reports_bounded_preview() {
        let raw = format!("not json at all {}", "x".repeat(5000));
        match repair_json(&raw) {
            Err(ParseError::Parse { preview, .. }) => {
                assert_eq!(preview.chars().count(), PREVIEW_CHARS);
                assert!(preview.starts_with("not json"));
            }
            other => panic!("expected parse error, got {other:?}"),
        }
    }

    #[test]
    fn strip_fences_variants() {
        assert_eq!(strip_code_fences("```json\n{}\n```"), "{}");
        assert_eq!(strip_code_fences("```\n{}\n```"), "{}");
        assert_eq!(strip_code_fences("```json{}```"), "{}");
        assert_eq!(strip_code_fences("  {}  "), "{}");
    }

    #[test]
    fn validates_and_normalizes() {
        let draft = validate_idea(&sample_idea(), Some(2)).unwrap();
        assert_eq!(draft.domain, "Retail");
        assert_eq!(draft.subdomain.as_deref(), Some("Grocery"));
        assert_eq!(draft.tags, vec!["retail", "vision"]);
        let ms = &draft.evaluation["marketSize"];
        assert_eq!(ms.score, Some(8));
        assert_eq!(ms.questions[0].answer, "Large");
        assert_eq!(draft.evaluation["timeToMarket"].score, Some(6));
    }

    #[test]
    fn explicit_subdomain_wins() {
        let mut v = sample_idea();
        v["subdomain"] = json!("Convenience");
        let draft = validate_idea(&v, None).unwrap();
        assert_eq!(draft.subdomain.as_deref(), Some("Convenience"));
    }

    #[test]
    fn scores_are_clamped() {
        let mut v = sample_idea();
        v["evaluation"]["Market Size"]["score"] = json!(14);
        v["evaluation"]["timeToMarket"]["score"] = json!(0.2);
        let draft = validate_idea(&v, None).unwrap();
        assert_eq!(draft.evaluation["marketSize"].score, Some(10));
        assert_eq!(draft.evaluation["timeToMarket"].score, Some(1));
    }

    #[test]
    fn non_numeric_score_is_dropped() {
        let mut v = sample_idea();
        v["evaluation"]["Market Size"]["score"] = json!("high");
        let draft = validate_idea(&v, None).unwrap();
        assert_eq!(draft.evaluation["marketSize"].score, None);
        assert_eq!(draft.scores().len(), 1);
    }

    #[test]
    fn missing_fields_are_listed() {
        let err = validate_idea(&json!({"name": "x"}), None).unwrap_err();
        assert_eq!(
            err,
            ParseError::MissingFields(vec!["quickSummary", "concreteExample", "evaluation"])
        );
    }

    #[test]
    fn malformed_example_is_rejected() {
        let mut v = sample_idea();
        v["concreteExample"] = json!({"currentState": "x"});
        let err = validate_idea(&v, None).unwrap_err();
        assert_eq!(err, ParseError::MalformedExample(vec!["yourSolution", "keyImprovement"]));
    }

    #[test]
    fn criterion_without_questions_is_rejected() {
        let mut v = sample_idea();
        v["evaluation"]["Market Size"]["questions"] = json!([]);
        let err = validate_idea(&v, None).unwrap_err();
        assert_eq!(err, ParseError::IncompleteCriteria(vec!["Market Size".into()]));
    }

    #[test]
    fn criteria_count_must_match() {
        let err = validate_idea(&sample_idea(), Some(10)).unwrap_err();
        assert_eq!(err, ParseError::CriteriaCountMismatch { expected: 10, actual: 2 });
    }

    #[test]
    fn split_domain_trims_parts() {
        assert_eq!(split_domain(" Health |  Tele "), ("Health".into(), Some("Tele".into())));
        assert_eq!(split_domain("Health"), ("Health".into(), None));
        assert_eq!(split_domain("Health |"), ("Health".into(), None));
    }
}
