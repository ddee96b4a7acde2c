//! Response rendering: the kernel hands off a response key plus variables,
//! a renderer returns user-visible text.
//!
//! Rich template storage is an external collaborator. The built-in renderer
//! carries only the deterministic safe-fallback table, so user-visible
//! failures never leak internal details.

use std::collections::HashMap;

/// Safe-fallback response keys the kernel may emit at any time.
pub mod keys {
    pub const SYSTEM_UNAVAILABLE_CATALOG: &str = "system.unavailable.catalog";
    pub const SYSTEM_UNAVAILABLE_STORAGE: &str = "system.unavailable.storage";
    pub const CLARIFY_INTENT: &str = "clarify.intent";
    pub const GENERIC_UNKNOWN: &str = "generic.unknown";
    pub const INTERNAL_PAUSE: &str = "internal.pause";
    pub const REMINDER_ACK: &str = "reminder.ack";
    pub const REMINDER_FIRE: &str = "reminder.fire";
    pub const STATUS_REPORT: &str = "status.report";
    pub const TIMED_LIST: &str = "timed.list";
    pub const SLICE_DONE: &str = "slice.done";
    pub const SLICE_WAITING: &str = "slice.waiting";
}

/// Resolves a response key and variables to text.
pub trait Renderer: Send + Sync {
    fn render(&self, key: &str, vars: &HashMap<String, String>) -> String;
}

/// Deterministic template table with `{var}` interpolation. Unknown keys
/// fall back to the generic text.
pub struct FallbackRenderer;

const TEMPLATES: &[(&str, &str)] = &[
    (keys::SYSTEM_UNAVAILABLE_CATALOG, "I'm not fully awake yet. Please try again in a moment."),
    (keys::SYSTEM_UNAVAILABLE_STORAGE, "I can't reach my memory right now. Please try again shortly."),
    (keys::CLARIFY_INTENT, "I didn't quite catch that. Could you rephrase what you need?"),
    (keys::GENERIC_UNKNOWN, "Something went sideways on my end. I'll be back shortly."),
    (keys::INTERNAL_PAUSE, "I need a short pause to sort something out. I'll pick this up again soon."),
    (keys::REMINDER_ACK, "Got it. I'll remind you to {task} at {when}."),
    (keys::REMINDER_FIRE, "Reminder: {task}"),
    (keys::STATUS_REPORT, "State: {state}. Queued signals: {queued}. Pending timers: {timers}. Active tasks: {tasks}."),
    (keys::TIMED_LIST, "Upcoming: {items}"),
    (keys::SLICE_DONE, "Finished: {summary}"),
    (keys::SLICE_WAITING, "I need your input to continue: {question}"),
];

/// Interpolate `{name}` placeholders from the variables map. Unknown
/// placeholders are left in place.
fn interpolate(template: &str, vars: &HashMap<String, String>) -> String {
    let mut out = String::with_capacity(template.len());
    let mut rest = template;
    while let Some(start) = rest.find('{') {
        out.push_str(&rest[..start]);
        match rest[start..].find('}') {
            Some(end_rel) => {
                let name = &rest[start + 1..start + end_rel];
                match vars.get(name) {
                    Some(value) => out.push_str(value),
                    None => {
                        out.push('{');
                        out.push_str(name);
                        out.push('}');
                    }
                }
                rest = &rest[start + end_rel + 1..];
            }
            None => {
                out.push_str(&rest[start..]);
                rest = "";
            }
        }
    }
    out.push_str(rest);
    out
}

impl Renderer for FallbackRenderer {
    fn render(&self, key: &str, vars: &HashMap<String, String>) -> String {
        let template = TEMPLATES
            .iter()
            .find(|(k, _)| *k == key)
            .map(|(_, t)| *t)
            .unwrap_or_else(|| {
                TEMPLATES
                    .iter()
                    .find(|(k, _)| *k == keys::GENERIC_UNKNOWN)
                    .map(|(_, t)| *t)
                    .unwrap_or("")
            });
        interpolate(template, vars)
    }
}

/// Convenience for single-variable renders.
pub fn vars(pairs: &[(&str, &str)]) -> HashMap<String, String> {
    pairs.iter().map(|(k, v)| (k.to_string(), v.to_string())).collect()
}
