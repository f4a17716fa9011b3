//! The action decider (spec.md §4.5).
//!
//! Grounded on `original_source/src/gary/llm/llm.py`'s `LLM.force_action` /
//! `LLM.action` / `LLM.try_action` / `LLM.say`. All four entry points only
//! ever run from inside the scheduler's single worker for a game, so none
//! of this needs its own locking - the single-flight invariant is the
//! scheduler's job (§4.6), not this module's.

use std::collections::HashMap;

use protocol::Action;
use tracing::warn;

use crate::context::ContextLog;
use crate::generator::{GenParams, Grammar, Role};

/// A sentinel the free-text `say` grammar stops at. Stands in for whatever
/// end-of-turn token the chat template defines.
const SAY_STOP: &str = "<|end|>";

/// The three options `try_action` can choose among, before dispatch.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum TryOption {
    Action,
    Say,
    Wait,
}

impl TryOption {
    fn as_str(&self) -> &'static str {
        match self {
            TryOption::Action => "action",
            TryOption::Say => "say",
            TryOption::Wait => "wait",
        }
    }
}

/// The outcome of `force_action`/`action`/`try_action`: which action was
/// chosen and its generated (or omitted) data payload.
#[derive(Debug, Clone, PartialEq)]
pub struct ActionChoice {
    pub name: String,
    pub data: Option<String>,
}

/// Per-game decision policy, mirroring the config knobs spec.md §6 lists
/// (`allow_yapping`, `enforce_schema`, `temperature`, token budget per call).
pub struct Decider {
    pub allow_yapping: bool,
    pub enforce_schema: bool,
    pub temperature: f32,
    pub max_tokens: usize,
}

impl Decider {
    pub fn new(allow_yapping: bool, enforce_schema: bool, temperature: f32, max_tokens: usize) -> Self {
        Self {
            allow_yapping,
            enforce_schema,
            temperature,
            max_tokens,
        }
    }

    fn params(&self) -> GenParams {
        GenParams {
            temperature: self.temperature,
            max_tokens: self.max_tokens,
        }
    }

    /// `force_action(msg, actions)`: filters `action_names` against the
    /// registered set (warning on misses), appends the force prompt, and
    /// delegates to [`Decider::action`]. The prompt is appended ephemerally
    /// when `ephemeral_context` is set, otherwise it stays in the log like
    /// any other message (it is not marked trim-persistent).
    pub async fn force_action(
        &mut self,
        context: &mut ContextLog,
        state: Option<&str>,
        query: &str,
        ephemeral: bool,
        requested: &[String],
        actions: &HashMap<String, Action>,
    ) -> Option<ActionChoice> {
        let filtered: Vec<&Action> = requested
            .iter()
            .filter_map(|name| match actions.get(name) {
                Some(a) => Some(a),
                None => {
                    warn!(action = %name, "force_action requested unknown action");
                    None
                }
            })
            .collect();
        if filtered.is_empty() {
            warn!("force_action had no valid actions after filtering");
            return None;
        }

        let names: String = filtered
            .iter()
            .map(|a| a.name.as_str())
            .collect::<Vec<_>>()
            .join(", ");
        let mut prompt = format!("Forced action requested. Query: {query}\n");
        if let Some(state) = state {
            prompt.push_str(&format!("State: {state}\n"));
        }
        prompt.push_str(&format!("Available actions: {names}"));

        let checkpoint = ephemeral.then(|| context.checkpoint());
        context.append(Role::User, &prompt, false);

        let result = self.action(context, &filtered).await;

        if let Some(cp) = checkpoint {
            context.restore(cp);
        }
        result
    }

    /// `action(actions)`: select one of `actions` by name via constrained
    /// decoding, then generate its `data` payload matching the chosen
    /// action's schema (or unconstrained JSON if `enforce_schema` is off).
    pub async fn action(&mut self, context: &mut ContextLog, actions: &[&Action]) -> Option<ActionChoice> {
        if actions.is_empty() {
            return None;
        }
        let names: Vec<String> = actions.iter().map(|a| a.name.clone()).collect();

        context.append(
            Role::Assistant,
            "\"command\": \"action\", \"action_name\": \"",
            false,
        );
        context.ensure_room(self.max_tokens);
        let (chosen, _) = context
            .generator_mut()
            .generate_constrained(&Grammar::Select(names), self.params())
            .await
            .ok()?;
        context.append(Role::Assistant, &chosen, false);

        let action = actions.iter().find(|a| a.name == chosen)?;
        context.append(Role::Assistant, "\", \"data\": ", false);
        context.ensure_room(self.max_tokens);

        let schema = if self.enforce_schema {
            action.schema.clone().unwrap_or_else(|| serde_json::json!({}))
        } else {
            serde_json::json!({})
        };
        let (data, _) = context
            .generator_mut()
            .generate_constrained(&Grammar::Json(schema), self.params())
            .await
            .ok()?;
        context.append(Role::Assistant, &data, false);

        Some(ActionChoice {
            name: chosen,
            data: Some(data),
        })
    }

    /// `try_action(actions, allow_say)`: an ephemeral prompt offering
    /// `{action, say, wait}` (say gated on both the caller's `allow_say`
    /// and this decider's `allow_yapping`), dispatching on the choice.
    pub async fn try_action(
        &mut self,
        context: &mut ContextLog,
        actions: &[&Action],
        allow_say: bool,
    ) -> Option<ActionChoice> {
        let mut options = Vec::new();
        if !actions.is_empty() {
            options.push(TryOption::Action);
        }
        if allow_say && self.allow_yapping {
            options.push(TryOption::Say);
        }
        options.push(TryOption::Wait);

        let names: String = actions
            .iter()
            .map(|a| a.name.as_str())
            .collect::<Vec<_>>()
            .join(", ");
        let option_strs: Vec<String> = options.iter().map(|o| o.as_str().to_string()).collect();
        let prompt = format!(
            "Decide what to do next. Available actions: {names}. Choose one of: {}",
            option_strs.join(", ")
        );

        let checkpoint = context.checkpoint();
        context.append(Role::User, &prompt, false);
        context.ensure_room(self.max_tokens);
        let (chosen, _) = context
            .generator_mut()
            .generate_constrained(&Grammar::Select(option_strs), self.params())
            .await
            .ok()?;
        context.restore(checkpoint);

        match chosen.as_str() {
            "action" => self.action(context, actions).await,
            "say" => {
                self.say(context, None).await;
                None
            }
            _ => None,
        }
    }

    /// `say(message?)`: appends `message` verbatim if given, else
    /// generates free text bounded by [`SAY_STOP`]. Returns the text said.
    pub async fn say(&mut self, context: &mut ContextLog, message: Option<String>) -> String {
        match message {
            Some(text) => {
                context.append(Role::Assistant, &text, false);
                text
            }
            None => {
                context.ensure_room(self.max_tokens);
                let grammar = Grammar::FreeText {
                    stop: SAY_STOP.to_string(),
                };
                match context.generator_mut().generate_constrained(&grammar, self.params()).await {
                    Ok((text, _)) => {
                        context.append(Role::Assistant, &text, false);
                        text
                    }
                    Err(err) => {
                        warn!(?err, "say generation failed");
                        String::new()
                    }
                }
            }
        }
    }
}
