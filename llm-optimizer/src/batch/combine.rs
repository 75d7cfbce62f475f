//! Batch keys, request grouping, and combined prompt construction.
//!
//! A combined prompt labels every member with an index marker,
//! `[[REQUEST n:<id>]]`, and asks the model to repeat the marker before each
//! answer so the single upstream response can be split back out.

use regex::Regex;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::OnceLock;

use crate::config::CostSplit;
use crate::llm::{ChatMessage, CompletionRequest, TokenUsage};

const SINGLE_GROUP_INSTRUCTIONS: &str = "You will receive several independent requests. \
Answer each one separately. Begin each answer with its marker exactly as shown, \
for example [[REQUEST 1:<id>]].";

const MULTI_GROUP_INSTRUCTIONS: &str = "The requests below are organized in groups, each \
with its own instructions. Answer each request separately, following its group's \
instructions. Begin each answer with the request's marker exactly as shown, \
for example [[REQUEST 1:<id>]].";

/// Derive the batch key: provider, model and coarse-grained parameters.
pub fn batch_key(request: &CompletionRequest, provider: &str) -> String {
    let temperature = request
        .temperature
        .map_or_else(|| "none".to_string(), |t| (t.round() as i64).to_string());
    format!(
        "{}|{}|t={}|sys={}",
        provider,
        request.model,
        temperature,
        u8::from(request.system.is_some())
    )
}

/// Exact-parameter similarity key used for smart grouping.
pub fn group_key(request: &CompletionRequest) -> String {
    format!(
        "t={}|max={}|sys={}",
        request
            .temperature
            .map_or_else(|| "none".to_string(), |t| format!("{:.4}", t)),
        request
            .max_tokens
            .map_or_else(|| "none".to_string(), |m| m.to_string()),
        request.system.as_deref().unwrap_or("")
    )
}

/// Marker placed before a member's content and expected before its answer.
pub fn request_marker(index: usize, id: &str) -> String {
    format!("[[REQUEST {}:{}]]", index, id)
}

fn render_member(request: &CompletionRequest) -> String {
    match request.messages.as_slice() {
        [only] => only.content.clone(),
        messages => messages
            .iter()
            .map(|m| format!("{}: {}", m.role, m.content))
            .collect::<Vec<_>>()
            .join("\n"),
    }
}

/// Partition members (by index) into groups of identical parameters,
/// keeping enqueue order within and across groups.
///
/// Without smart grouping members are still split by system prompt, since
/// one combined prompt cannot carry two sets of instructions.
pub fn group_members(requests: &[&CompletionRequest], smart_grouping: bool) -> Vec<Vec<usize>> {
    let mut order: Vec<String> = Vec::new();
    let mut groups: HashMap<String, Vec<usize>> = HashMap::new();
    for (i, request) in requests.iter().enumerate() {
        let key = if smart_grouping {
            group_key(request)
        } else {
            request.system.clone().unwrap_or_default()
        };
        if !groups.contains_key(&key) {
            order.push(key.clone());
        }
        groups.entry(key).or_default().push(i);
    }
    order
        .into_iter()
        .filter_map(|key| groups.remove(&key))
        .collect()
}

/// Build the single upstream request for a batch.
///
/// `batch_id` becomes the combined request's id. Members must share a batch
/// key; the first member supplies model, provider and temperature.
pub fn combine(
    batch_id: &str,
    requests: &[&CompletionRequest],
    smart_grouping: bool,
) -> CompletionRequest {
    let groups = group_members(requests, smart_grouping);
    let first = requests[0];

    let mut combined = CompletionRequest::new(first.model.clone()).with_id(batch_id);
    combined.provider = first.provider.clone();
    combined.temperature = first.temperature;
    combined.priority = requests.iter().map(|r| r.priority).max().unwrap_or(first.priority);
    combined.max_tokens = requests
        .iter()
        .map(|r| r.max_tokens)
        .sum::<Option<u32>>();
    combined
        .metadata
        .insert("batch_size".to_string(), requests.len().to_string());

    let mut body = String::new();
    if groups.len() == 1 {
        let instructions = match &first.system {
            Some(system) => format!("{}\n\n{}", SINGLE_GROUP_INSTRUCTIONS, system),
            None => SINGLE_GROUP_INSTRUCTIONS.to_string(),
        };
        combined.system = Some(instructions);

        for (i, request) in requests.iter().enumerate() {
            if i > 0 {
                body.push_str("\n\n");
            }
            body.push_str(&request_marker(i + 1, &request.id));
            body.push('\n');
            body.push_str(&render_member(request));
        }
    } else {
        combined.system = Some(MULTI_GROUP_INSTRUCTIONS.to_string());

        for (g, members) in groups.iter().enumerate() {
            let lead = requests[members[0]];
            if g > 0 {
                body.push_str("\n\n");
            }
            if smart_grouping {
                body.push_str(&format!(
                    "[[GROUP {} temperature={} max_tokens={}]]",
                    g + 1,
                    lead.temperature
                        .map_or_else(|| "default".to_string(), |t| t.to_string()),
                    lead.max_tokens
                        .map_or_else(|| "default".to_string(), |m| m.to_string())
                ));
            } else {
                body.push_str(&format!("[[GROUP {}]]", g + 1));
            }
            if let Some(system) = &lead.system {
                body.push_str("\nInstructions: ");
                body.push_str(system);
            }
            for &i in members {
                body.push_str("\n\n");
                body.push_str(&request_marker(i + 1, &requests[i].id));
                body.push('\n');
                body.push_str(&render_member(requests[i]));
            }
        }
    }

    combined.with_message(ChatMessage::user(body))
}

/// Split a combined response back into per-member content, keyed by id.
///
/// Members whose marker is absent are missing from the map; callers fall
/// back to the full response for them.
pub fn split_response(content: &str) -> HashMap<String, String> {
    static MARKERS: OnceLock<Regex> = OnceLock::new();
    let markers = MARKERS.get_or_init(|| {
        Regex::new(r"\[\[(?:REQUEST \d+:([^\]]+)|GROUP[^\]]*)\]\]").expect("static regex")
    });

    let found: Vec<(Option<String>, usize, usize)> = markers
        .captures_iter(content)
        .filter_map(|c| {
            let whole = c.get(0)?;
            Some((c.get(1).map(|id| id.as_str().to_string()), whole.start(), whole.end()))
        })
        .collect();

    let mut sections = HashMap::new();
    for (i, (id, _, end)) in found.iter().enumerate() {
        let Some(id) = id else { continue };
        let stop = found.get(i + 1).map_or(content.len(), |next| next.1);
        sections.insert(id.clone(), content[*end..stop].trim().to_string());
    }
    sections
}

/// Per-member share of a combined batch's usage and cost.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CostShare {
    pub usage: TokenUsage,
    pub cost: f64,
}

/// Attribute a batch's usage and cost to its members.
///
/// `Even` divides equally regardless of member size; `Proportional` uses
/// each member's estimated tokens.
pub fn split_cost(
    usage: &TokenUsage,
    cost: f64,
    member_tokens: &[u64],
    split: CostSplit,
) -> Vec<CostShare> {
    let n = member_tokens.len();
    if n == 0 {
        return Vec::new();
    }
    let total: u64 = member_tokens.iter().sum();

    member_tokens
        .iter()
        .map(|&tokens| {
            let fraction = match split {
                CostSplit::Proportional if total > 0 => tokens as f64 / total as f64,
                _ => 1.0 / n as f64,
            };
            CostShare {
                usage: usage.scaled(fraction),
                cost: cost * fraction,
            }
        })
        .collect()
}
