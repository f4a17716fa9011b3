//! The constrained-decoding facade over an external inference engine.
//!
//! spec.md §4.4: the core only consumes a `Generator` interface - append
//! text under a chat role, run a grammar-constrained generation, estimate
//! token counts, and reset. The real engine (token sampling, KV cache) is
//! explicitly out of scope; this module defines the trait boundary plus a
//! test/reference implementation ([`MockGenerator`], grounded on
//! `original_source/src/gary/llm/randy.py`'s "Randy" mock engine) that is
//! good enough to exercise the partial-trim algorithm end to end.

use std::collections::{BTreeSet, HashMap};

use async_trait::async_trait;
use serde_json::Value;

use crate::error::{GatewayError, Result};

/// The three chat roles a context message can carry.
///
/// System messages (and messages explicitly marked `persistent`, see
/// [`crate::context::ContextLog`]) are never discarded by partial trim.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Role {
    System,
    User,
    Assistant,
}

/// A grammar a constrained generation must conform to.
///
/// Mirrors `original_source/src/gary/llm/llm.py`'s three generation shapes:
/// `select(...)` for the action name / try-action decision, `json(schema=...)`
/// for action data, and `gen(stop=...)` for free-form `say` text.
#[derive(Debug, Clone)]
pub enum Grammar {
    /// Select exactly one of these literal strings.
    Select(Vec<String>),
    /// Generate JSON matching this (already-filtered) schema.
    Json(serde_json::Value),
    /// Generate free text until `stop` is produced.
    FreeText { stop: String },
}

/// Sampling parameters for a single constrained generation.
#[derive(Debug, Clone, Copy)]
pub struct GenParams {
    pub temperature: f32,
    pub max_tokens: usize,
}

/// A lightweight restore point for ephemeral context (spec.md §4.5: a
/// `try_action`/`force_action` prompt that must not survive into the
/// permanent log). Captures how many tokens and messages existed at the
/// time it was taken; [`Generator::restore`] truncates back to it.
#[derive(Debug, Clone, Copy)]
pub struct Checkpoint {
    pub(crate) tokens: usize,
    pub(crate) messages: usize,
}

/// Outcome of attempting a partial trim (spec.md §4.3 step 2-4).
pub enum TrimOutcome {
    /// Messages in `[discard_start, discard_end)` were evicted, freeing
    /// `discarded_tokens` tokens. The caller (the [`crate::context::ContextLog`])
    /// must drop the same message range from its own bookkeeping.
    Trimmed {
        discard_start: usize,
        discard_end: usize,
        discarded_tokens: usize,
    },
    /// No discardable message exists (every message is system or persistent);
    /// the caller should fall back to a full reset.
    NothingDiscardable,
    /// This generator doesn't support partial trim at all (an opaque/hosted
    /// backend); the caller should fall back to a full reset.
    Unsupported,
}

/// The engine-facing contract. Implementations own the actual model call;
/// the gateway core only ever talks through this trait.
///
/// `generate_constrained` is the one suspension point: a real backend (local
/// inference, a hosted API) can take tens of seconds (spec.md §5), so it's
/// `async` and yields the worker task's thread back to the runtime for the
/// duration rather than blocking it.
#[async_trait]
pub trait Generator: Send {
    /// Appends `text` under `role`, returns the number of tokens it cost.
    fn append_role(&mut self, role: Role, text: &str) -> usize;

    /// Runs a constrained generation and returns the produced string plus
    /// its token count.
    async fn generate_constrained(&mut self, grammar: &Grammar, params: GenParams) -> Result<(String, usize)>;

    /// Estimates the token cost of `text` without appending it.
    fn estimate_tokens(&self, text: &str) -> usize;

    /// Clears all state and reinitializes (system prompt re-append is the
    /// caller's responsibility - this only clears the engine's own state).
    fn reset(&mut self);

    /// Total tokens currently held.
    fn token_count(&self) -> usize;

    /// Number of messages currently held.
    fn message_count(&self) -> usize;

    /// Attempts the partial-trim algorithm (spec.md §4.3). `persistent` is
    /// the full set of message indices that must survive - including every
    /// system-role message, computed by the caller.
    fn partial_trim(&mut self, n_ctx: usize, persistent: &BTreeSet<usize>) -> TrimOutcome;

    /// Captures a restore point for ephemeral rollback.
    fn checkpoint(&self) -> Checkpoint;

    /// Truncates back to a previously captured checkpoint.
    fn restore(&mut self, checkpoint: Checkpoint);

    /// Whether this generator can partially trim (a "transparent KV"
    /// generator with an addressable cache) or only fully reset (opaque,
    /// hosted-API generators per spec.md §4.3).
    fn supports_partial_trim(&self) -> bool;
}

/// An opaque-state generator (e.g. a hosted inference API): the log is kept
/// as plain text, truncation is always a full reset. Useful as the minimal
/// implementation when the engine has no addressable KV cache.
pub struct OpaqueGenerator {
    text: String,
    token_count: usize,
    message_count: usize,
    tokens_per_char: f64,
}

impl OpaqueGenerator {
    pub fn new(tokens_per_char: f64) -> Self {
        Self {
            text: String::new(),
            token_count: 0,
            message_count: 0,
            tokens_per_char,
        }
    }
}

#[async_trait]
impl Generator for OpaqueGenerator {
    fn append_role(&mut self, _role: Role, text: &str) -> usize {
        let n = self.estimate_tokens(text);
        self.text.push_str(text);
        self.token_count += n;
        self.message_count += 1;
        n
    }

    async fn generate_constrained(&mut self, grammar: &Grammar, params: GenParams) -> Result<(String, usize)> {
        let out = match grammar {
            Grammar::Select(options) => options
                .first()
                .cloned()
                .ok_or_else(|| GatewayError::Generator("empty select grammar".into()))?,
            Grammar::Json(_) => "{}".to_string(),
            Grammar::FreeText { .. } => String::new(),
        };
        let n = self.estimate_tokens(&out).min(params.max_tokens.max(1));
        self.token_count += n;
        Ok((out, n))
    }

    fn estimate_tokens(&self, text: &str) -> usize {
        ((text.chars().count() as f64) * self.tokens_per_char).ceil() as usize
    }

    fn reset(&mut self) {
        self.text.clear();
        self.token_count = 0;
        self.message_count = 0;
    }

    fn token_count(&self) -> usize {
        self.token_count
    }

    fn message_count(&self) -> usize {
        self.message_count
    }

    fn partial_trim(&mut self, _n_ctx: usize, _persistent: &BTreeSet<usize>) -> TrimOutcome {
        TrimOutcome::Unsupported
    }

    fn checkpoint(&self) -> Checkpoint {
        Checkpoint {
            tokens: self.token_count,
            messages: self.message_count,
        }
    }

    fn restore(&mut self, checkpoint: Checkpoint) {
        self.token_count = checkpoint.tokens;
        self.message_count = checkpoint.messages;
    }

    fn supports_partial_trim(&self) -> bool {
        false
    }
}

/// A transparent-KV reference generator: whitespace-delimited "tokens" with
/// an addressable, trimmable buffer. Stands in for a local llama.cpp-style
/// engine (`original_source/src/gary/llm/llarry.py::StreamingLlamaCppEngine`)
/// well enough to exercise the full partial-trim algorithm in tests.
///
/// Not a real tokenizer - words are joined back with single spaces on
/// decode, so it is only byte-exact for single-space-separated input.
pub struct MockGenerator {
    vocab: HashMap<String, u32>,
    rev_vocab: Vec<String>,
    token_ids: Vec<u32>,
    roles: Vec<Role>,
    // (start offset into token_ids, length) per message, in append order.
    spans: Vec<(usize, usize)>,
}

impl MockGenerator {
    pub fn new() -> Self {
        Self {
            vocab: HashMap::new(),
            rev_vocab: Vec::new(),
            token_ids: Vec::new(),
            roles: Vec::new(),
            spans: Vec::new(),
        }
    }

    fn intern(&mut self, word: &str) -> u32 {
        if let Some(&id) = self.vocab.get(word) {
            return id;
        }
        let id = self.rev_vocab.len() as u32;
        self.rev_vocab.push(word.to_string());
        self.vocab.insert(word.to_string(), id);
        id
    }

    fn tokenize(&mut self, text: &str) -> Vec<u32> {
        text.split_whitespace().map(|w| self.intern(w)).collect()
    }

    /// Decodes a token-id slice back to whitespace-joined text. Exposed for
    /// the byte-exactness test in spec.md §4.3.
    pub fn decode(&self, ids: &[u32]) -> String {
        ids.iter()
            .map(|id| self.rev_vocab[*id as usize].as_str())
            .collect::<Vec<_>>()
            .join(" ")
    }
}

impl Default for MockGenerator {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl Generator for MockGenerator {
    fn append_role(&mut self, role: Role, text: &str) -> usize {
        let start = self.token_ids.len();
        let ids = self.tokenize(text);
        let len = ids.len();
        self.token_ids.extend(ids);
        self.spans.push((start, len));
        self.roles.push(role);
        len
    }

    async fn generate_constrained(&mut self, grammar: &Grammar, params: GenParams) -> Result<(String, usize)> {
        let out = match grammar {
            Grammar::Select(options) => options
                .first()
                .cloned()
                .ok_or_else(|| GatewayError::Generator("empty select grammar".into()))?,
            Grammar::Json(schema) => mock_json_for_schema(schema),
            Grammar::FreeText { .. } => "...".to_string(),
        };
        let n = self.estimate_tokens(&out).min(params.max_tokens.max(1));
        Ok((out, n))
    }

    fn estimate_tokens(&self, text: &str) -> usize {
        text.split_whitespace().count()
    }

    fn reset(&mut self) {
        self.token_ids.clear();
        self.roles.clear();
        self.spans.clear();
    }

    fn token_count(&self) -> usize {
        self.token_ids.len()
    }

    fn message_count(&self) -> usize {
        self.spans.len()
    }

    fn partial_trim(&mut self, n_ctx: usize, persistent: &BTreeSet<usize>) -> TrimOutcome {
        let max_discard = n_ctx / 2;
        let discardable = |i: usize, roles: &[Role]| -> bool {
            roles[i] != Role::System && !persistent.contains(&i)
        };

        let mut n_keep: Option<usize> = None;
        let mut n_discard_tokens = 0usize;
        let mut discard_start = 0usize;
        let mut discard_end = self.spans.len();
        let mut found_end = false;

        for i in 0..self.spans.len() {
            let (start, len) = self.spans[i];
            if discardable(i, &self.roles) {
                match n_keep {
                    None => {
                        n_keep = Some(start);
                        discard_start = i;
                    }
                    Some(keep) => {
                        let would_discard = (start + len) - keep;
                        if would_discard > max_discard {
                            discard_end = i;
                            found_end = true;
                            break;
                        }
                        n_discard_tokens = would_discard;
                    }
                }
                if n_keep == Some(start) {
                    n_discard_tokens = len;
                }
            } else if n_keep.is_some() {
                discard_end = i;
                found_end = true;
                break;
            }
        }

        let Some(n_keep) = n_keep else {
            return TrimOutcome::NothingDiscardable;
        };
        if !found_end {
            discard_end = self.spans.len();
        }

        // Shift: drop [n_keep, n_keep+n_discard_tokens) from the token buffer.
        self.token_ids
            .drain(n_keep..n_keep + n_discard_tokens)
            .for_each(drop);

        // Drop the discarded messages and slide later spans left.
        self.roles.drain(discard_start..discard_end);
        self.spans.drain(discard_start..discard_end);
        for (start, _) in self.spans.iter_mut().skip(discard_start) {
            *start -= n_discard_tokens;
        }

        TrimOutcome::Trimmed {
            discard_start,
            discard_end,
            discarded_tokens: n_discard_tokens,
        }
    }

    fn checkpoint(&self) -> Checkpoint {
        Checkpoint {
            tokens: self.token_ids.len(),
            messages: self.spans.len(),
        }
    }

    fn restore(&mut self, checkpoint: Checkpoint) {
        self.token_ids.truncate(checkpoint.tokens);
        self.roles.truncate(checkpoint.messages);
        self.spans.truncate(checkpoint.messages);
    }

    fn supports_partial_trim(&self) -> bool {
        true
    }
}

/// Schema keywords a constrained JSON generation can actually honor,
/// grounded verbatim on `original_source/src/gary/util/utils.py`'s
/// `_GUIDANCE_SCHEMA_SUPPORTED_KEYWORDS` (spec.md §4.4).
const SUPPORTED_SCHEMA_KEYWORDS: &[&str] = &[
    "anyOf",
    "oneOf",
    "allOf",
    "$ref",
    "const",
    "enum",
    "type",
    "items",
    "additionalItems",
    "prefixItems",
    "minItems",
    "maxItems",
    "properties",
    "additionalProperties",
    "required",
    "minLength",
    "maxLength",
    "pattern",
    "format",
    "minimum",
    "maximum",
    "exclusiveMinimum",
    "exclusiveMaximum",
    "multipleOf",
];

/// Drops keywords outside [`SUPPORTED_SCHEMA_KEYWORDS`] from `schema`,
/// recursing into `properties` member schemas and any other object-valued
/// keyword (except `enum`, whose members are data, not sub-schemas) -
/// the same recursion shape as `json_schema_filter` in
/// `original_source/src/gary/util/utils.py`. Returns the filtered schema
/// plus the distinct unsupported keyword names encountered, for the
/// caller to warn on once per action name (spec.md §7).
pub fn filter_schema(schema: &Value) -> (Value, Vec<String>) {
    let mut unsupported = Vec::new();
    let filtered = filter_value(schema, &mut unsupported);
    (filtered, unsupported)
}

fn filter_value(value: &Value, unsupported: &mut Vec<String>) -> Value {
    let Some(map) = value.as_object() else {
        return value.clone();
    };
    let mut out = serde_json::Map::new();
    for (key, v) in map {
        if !SUPPORTED_SCHEMA_KEYWORDS.contains(&key.as_str()) {
            if !unsupported.contains(key) {
                unsupported.push(key.clone());
            }
            continue;
        }
        if key == "properties" {
            if let Some(props) = v.as_object() {
                let mut filtered_props = serde_json::Map::new();
                for (prop_name, prop_schema) in props {
                    filtered_props.insert(prop_name.clone(), filter_value(prop_schema, unsupported));
                }
                out.insert(key.clone(), Value::Object(filtered_props));
                continue;
            }
        } else if key != "enum" && v.is_object() {
            out.insert(key.clone(), filter_value(v, unsupported));
            continue;
        }
        out.insert(key.clone(), v.clone());
    }
    Value::Object(out)
}

/// Sanity-checks a filtered schema against the JSON Schema meta-schema,
/// warning once if filtering produced something structurally invalid (a
/// sign the keyword table above is missing a required companion keyword).
pub fn validate_filtered_schema(action_name: &str, schema: &Value) {
    if let Err(err) = jsonschema::meta::validate(schema) {
        tracing::warn!(action = %action_name, %err, "filtered schema is not a valid JSON Schema document");
    }
}

/// Produces a minimal JSON value satisfying the coarse shape of `schema`,
/// for the mock generator only - a real engine would constrain sampling
/// directly against the schema.
fn mock_json_for_schema(schema: &serde_json::Value) -> String {
    match schema.get("type").and_then(|t| t.as_str()) {
        Some("object") => "{}".to_string(),
        Some("array") => "[]".to_string(),
        Some("string") => "\"\"".to_string(),
        Some("integer") | Some("number") => "0".to_string(),
        Some("boolean") => "false".to_string(),
        _ => "null".to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn append(gen: &mut MockGenerator, role: Role, text: &str) {
        gen.append_role(role, text);
    }

    #[test]
    fn partial_trim_preserves_system_and_persistent() {
        let mut gen = MockGenerator::new();
        append(&mut gen, Role::System, "sys prompt here");
        append(&mut gen, Role::User, "msg one two three");
        append(&mut gen, Role::User, "msg four five six");
        append(&mut gen, Role::Assistant, "msg seven eight nine");
        append(&mut gen, Role::User, "tail recent message");

        let before = gen.token_count();
        let persistent = BTreeSet::new();
        match gen.partial_trim(6, &persistent) {
            TrimOutcome::Trimmed { discarded_tokens, .. } => {
                assert!(discarded_tokens > 0);
                assert!(gen.token_count() < before);
            }
            _ => panic!("expected a trim"),
        }
        // System message (index 0 pre-trim) must still be present as the
        // first message.
        assert_eq!(gen.roles[0], Role::System);
        let decoded = gen.decode(&gen.token_ids[gen.spans[0].0..gen.spans[0].0 + gen.spans[0].1]);
        assert_eq!(decoded, "sys prompt here");
    }

    #[test]
    fn nothing_discardable_when_all_persistent() {
        let mut gen = MockGenerator::new();
        append(&mut gen, Role::System, "sys");
        append(&mut gen, Role::User, "only message here");
        let mut persistent = BTreeSet::new();
        persistent.insert(1);
        match gen.partial_trim(2, &persistent) {
            TrimOutcome::NothingDiscardable => {}
            _ => panic!("expected nothing discardable"),
        }
    }

    #[test]
    fn decode_round_trips_whitespace_text() {
        let mut gen = MockGenerator::new();
        let text = "alpha beta gamma delta";
        append(&mut gen, Role::User, text);
        let (start, len) = gen.spans[0];
        assert_eq!(gen.decode(&gen.token_ids[start..start + len]), text);
    }

    #[test]
    fn checkpoint_restore_rolls_back_ephemeral_append() {
        let mut gen = MockGenerator::new();
        append(&mut gen, Role::System, "sys prompt");
        let cp = gen.checkpoint();
        append(&mut gen, Role::User, "ephemeral scratch text");
        assert!(gen.token_count() > cp.tokens);
        gen.restore(cp);
        assert_eq!(gen.token_count(), cp.tokens);
        assert_eq!(gen.message_count(), cp.messages);
    }

    #[test]
    fn filter_schema_keeps_supported_keywords() {
        let schema = serde_json::json!({
            "type": "object",
            "properties": {"count": {"type": "integer", "minimum": 0}},
            "required": ["count"],
        });
        let (filtered, unsupported) = filter_schema(&schema);
        assert!(unsupported.is_empty());
        assert_eq!(filtered, schema);
    }

    #[test]
    fn filter_schema_drops_unsupported_keywords_and_reports_them() {
        let schema = serde_json::json!({
            "type": "string",
            "description": "a greeting",
            "default": "hi",
        });
        let (filtered, unsupported) = filter_schema(&schema);
        assert_eq!(filtered, serde_json::json!({"type": "string"}));
        assert_eq!(unsupported.len(), 2);
        assert!(unsupported.contains(&"description".to_string()));
        assert!(unsupported.contains(&"default".to_string()));
    }

    #[test]
    fn filter_schema_recurses_into_properties() {
        let schema = serde_json::json!({
            "type": "object",
            "properties": {
                "name": {"type": "string", "example": "Gary"},
            },
        });
        let (filtered, unsupported) = filter_schema(&schema);
        assert_eq!(unsupported, vec!["example".to_string()]);
        assert_eq!(
            filtered["properties"]["name"],
            serde_json::json!({"type": "string"})
        );
    }

    #[test]
    fn filter_schema_leaves_non_object_input_untouched() {
        let schema = serde_json::Value::Null;
        let (filtered, unsupported) = filter_schema(&schema);
        assert!(unsupported.is_empty());
        assert_eq!(filtered, serde_json::Value::Null);
    }
}
