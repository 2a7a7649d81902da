//! Deterministic offline collaborators.
//!
//! These back the default install and the test suite: a keyword planner, a
//! static keyword-scored retriever, a template "model" that drafts from the
//! prompt structure, a regex guardrail, and an environment-map permission
//! gate. They exercise every engine path without touching the network.

use std::collections::HashMap;

use regex::Regex;
use serde_json::Value;

use rl_domain::error::{ErrorKind, RunError};
use rl_domain::run::{Identity, RetrievedChunk, RunState};

use crate::traits::{
    BoxStream, Guardrail, GuardrailLayer, GuardrailOutcome, ModelChunk, ModelStreamer,
    PermissionGate, PermissionOutcome, PlanDecision, Planner, Retriever, SanitizedChunk,
};

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Planner
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

/// Keyword planner: arithmetic goes to the calculator, github-ish requests
/// to the github tool, destructive verbs require human approval, everything
/// else is answered directly.
pub struct HeuristicPlanner {
    arithmetic: Regex,
}

impl Default for HeuristicPlanner {
    fn default() -> Self {
        Self::new()
    }
}

impl HeuristicPlanner {
    pub fn new() -> Self {
        Self {
            arithmetic: Regex::new(r"(-?\d+)\s*([+\-*/])\s*(-?\d+)").unwrap(),
        }
    }
}

const HIGH_RISK_VERBS: [&str; 4] = ["deploy", "delete", "drop", "shutdown"];

#[async_trait::async_trait]
impl Planner for HeuristicPlanner {
    async fn plan(&self, state: &RunState) -> Result<PlanDecision, RunError> {
        let message = state.message.trim();
        if message.is_empty() {
            return Err(RunError::new(ErrorKind::BadPlan, "empty message"));
        }

        let lower = message.to_lowercase();
        let needs_approval = HIGH_RISK_VERBS.iter().any(|v| lower.contains(v));

        if self.arithmetic.is_match(message) {
            return Ok(PlanDecision {
                plan_type: "tool_call".into(),
                response_strategy: "tool_then_answer".into(),
                selected_tool: Some("calculator".into()),
                needs_approval,
            });
        }
        if lower.contains("github") {
            return Ok(PlanDecision {
                plan_type: "tool_call".into(),
                response_strategy: "tool_then_answer".into(),
                selected_tool: Some("github.list_issues".into()),
                needs_approval,
            });
        }
        Ok(PlanDecision {
            plan_type: "direct_answer".into(),
            response_strategy: "grounded_answer".into(),
            selected_tool: None,
            needs_approval,
        })
    }
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Retriever
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

/// Keyword-overlap scoring over a fixed in-memory corpus.
pub struct StaticRetriever {
    corpus: Vec<RetrievedChunk>,
    top_k: usize,
}

impl StaticRetriever {
    pub fn new(corpus: Vec<RetrievedChunk>) -> Self {
        Self { corpus, top_k: 4 }
    }

    /// A small strategy/product corpus so direct-answer runs have evidence.
    pub fn with_default_corpus() -> Self {
        let mk = |chunk_id: &str, doc_id: &str, text: &str| RetrievedChunk {
            chunk_id: chunk_id.into(),
            doc_id: doc_id.into(),
            score: 0.0,
            metadata: Value::Null,
            text: text.into(),
        };
        Self::new(vec![
            mk(
                "strategy-001",
                "strategy.md",
                "Strategy is the set of choices that position an organization \
                 to win: where to play and how to win.",
            ),
            mk(
                "strategy-002",
                "strategy.md",
                "A good strategy pairs a diagnosis of the situation with a \
                 guiding policy and coherent actions.",
            ),
            mk(
                "planning-001",
                "planning.md",
                "Planning allocates resources against the strategy; it is the \
                 schedule, not the choice.",
            ),
            mk(
                "retrieval-001",
                "rag.md",
                "Grounded answers cite the evidence chunks they draw on so \
                 claims stay verifiable.",
            ),
        ])
    }

    fn score(query: &str, text: &str) -> f64 {
        let text_lower = text.to_lowercase();
        let mut hits = 0usize;
        let mut terms = 0usize;
        for term in query.to_lowercase().split_whitespace() {
            let term = term.trim_matches(|c: char| !c.is_alphanumeric());
            if term.len() < 3 {
                continue;
            }
            terms += 1;
            if text_lower.contains(term) {
                hits += 1;
            }
        }
        if terms == 0 {
            0.0
        } else {
            hits as f64 / terms as f64
        }
    }
}

#[async_trait::async_trait]
impl Retriever for StaticRetriever {
    async fn retrieve(&self, query: &str) -> Result<Vec<RetrievedChunk>, RunError> {
        let mut scored: Vec<RetrievedChunk> = self
            .corpus
            .iter()
            .filter_map(|chunk| {
                let score = Self::score(query, &chunk.text);
                (score > 0.0).then(|| RetrievedChunk {
                    score,
                    ..chunk.clone()
                })
            })
            .collect();
        scored.sort_by(|a, b| b.score.total_cmp(&a.score));
        scored.truncate(self.top_k);
        Ok(scored)
    }
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Model streamer
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

/// Deterministic "model": drafts an answer from the structured prompt the
/// respond step assembles (QUESTION / EVIDENCE / TOOL RESULT sections) and
/// streams it in word-group chunks with a fixed per-call cost.
pub struct TemplateStreamer {
    pub cost_per_call: f64,
}

impl Default for TemplateStreamer {
    fn default() -> Self {
        Self { cost_per_call: 0.01 }
    }
}

impl TemplateStreamer {
    fn draft(prompt: &str) -> String {
        if let Some(tool_section) = section(prompt, "TOOL RESULT:") {
            let mention = serde_json::from_str::<Value>(tool_section.trim())
                .ok()
                .and_then(|v| v.get("result").cloned())
                .map(|r| r.to_string())
                .unwrap_or_else(|| tool_section.trim().to_string());
            return format!("The result is {mention}.");
        }

        if let Some(evidence) = section(prompt, "EVIDENCE:") {
            let mut answer = String::new();
            for line in evidence.lines() {
                let line = line.trim();
                // Evidence lines look like `[chunk-id] text`.
                if let Some(rest) = line.strip_prefix('[') {
                    if let Some((id, text)) = rest.split_once(']') {
                        if !answer.is_empty() {
                            answer.push(' ');
                        }
                        answer.push_str(text.trim());
                        answer.push_str(&format!(" [{id}]"));
                    }
                }
            }
            if !answer.is_empty() {
                return answer;
            }
        }

        "I don't have grounded evidence for this, so here is my best \
         general answer, offered with low confidence."
            .to_string()
    }

    fn chunked(text: &str) -> Vec<String> {
        let words: Vec<&str> = text.split_whitespace().collect();
        words
            .chunks(6)
            .map(|group| {
                let mut s = group.join(" ");
                s.push(' ');
                s
            })
            .collect()
    }
}

#[async_trait::async_trait]
impl ModelStreamer for TemplateStreamer {
    async fn stream(
        &self,
        prompt: &str,
    ) -> Result<BoxStream<'static, Result<ModelChunk, RunError>>, RunError> {
        let chunks = Self::chunked(&Self::draft(prompt));
        let cost = self.cost_per_call;
        let stream = futures_util::stream::iter(
            chunks
                .into_iter()
                .map(|text| Ok(ModelChunk::Text(text)))
                .chain(std::iter::once(Ok(ModelChunk::Done { cost }))),
        );
        Ok(Box::pin(stream))
    }
}

/// Extract the body of a `HEADER:` section, up to the next all-caps header.
fn section<'a>(prompt: &'a str, header: &str) -> Option<&'a str> {
    let start = prompt.find(header)? + header.len();
    let rest = &prompt[start..];
    let end = rest
        .find("\nQUESTION:")
        .or_else(|| rest.find("\nEVIDENCE:"))
        .or_else(|| rest.find("\nTOOL RESULT:"))
        .unwrap_or(rest.len());
    Some(&rest[..end])
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Guardrail
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

/// Regex-based guardrail for prompt-injection patterns, used both on user
/// input and on retrieved context.
pub struct PatternGuardrail {
    patterns: Vec<Regex>,
}

impl Default for PatternGuardrail {
    fn default() -> Self {
        Self::new()
    }
}

impl PatternGuardrail {
    pub fn new() -> Self {
        let patterns = [
            r"(?i)ignore\s+(all\s+|previous\s+|prior\s+)?instructions",
            r"(?i)reveal\b.*\b(system\s+prompt|hidden)",
            r"(?i)disregard\s+(the\s+)?(rules|guardrails)",
            r"(?i)you\s+are\s+now\s+in\s+developer\s+mode",
        ]
        .iter()
        .map(|p| Regex::new(p).unwrap())
        .collect();
        Self { patterns }
    }

    fn matches(&self, text: &str) -> bool {
        self.patterns.iter().any(|p| p.is_match(text))
    }
}

#[async_trait::async_trait]
impl Guardrail for PatternGuardrail {
    async fn screen(&self, layer: GuardrailLayer, text: &str) -> GuardrailOutcome {
        if self.matches(text) {
            GuardrailOutcome::Refuse {
                reason: "prompt injection pattern detected".into(),
                layer: layer.as_str().into(),
                threat_type: "prompt_injection".into(),
            }
        } else {
            GuardrailOutcome::Pass
        }
    }

    fn sanitize(&self, chunk_text: &str) -> SanitizedChunk {
        let mut injection_detected = false;
        let kept: Vec<&str> = chunk_text
            .lines()
            .filter(|line| {
                if self.matches(line) {
                    injection_detected = true;
                    false
                } else {
                    true
                }
            })
            .collect();
        SanitizedChunk {
            text: kept.join("\n"),
            injection_detected,
        }
    }
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Permission gate
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

/// Scope policy backed by an environment map captured at startup.
///
/// Scopes either carry no requirement (always allowed) or name an
/// environment variable that must be present. Unknown scopes are denied.
pub struct EnvPermissionGate {
    environment: HashMap<String, String>,
    /// scope → required environment variable (`None` = no requirement).
    policy: HashMap<String, Option<String>>,
}

impl EnvPermissionGate {
    pub fn new(environment: HashMap<String, String>) -> Self {
        let policy = HashMap::from([
            ("calc.execute".to_string(), None),
            ("retrieval.read".to_string(), None),
            ("github.read".to_string(), Some("GITHUB_TOKEN".to_string())),
        ]);
        Self { environment, policy }
    }

    pub fn from_process_env() -> Self {
        Self::new(std::env::vars().collect())
    }
}

impl PermissionGate for EnvPermissionGate {
    fn check(&self, scope: &str, _identity: &Identity) -> PermissionOutcome {
        match self.policy.get(scope) {
            Some(None) => PermissionOutcome::Allow,
            Some(Some(required)) => {
                if self.environment.contains_key(required) {
                    PermissionOutcome::Allow
                } else {
                    PermissionOutcome::Deny {
                        reason: "scope_not_allowed_environment".into(),
                    }
                }
            }
            None => PermissionOutcome::Deny {
                reason: "scope_not_allowed_policy".into(),
            },
        }
    }
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Tests
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
