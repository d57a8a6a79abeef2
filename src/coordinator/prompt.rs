//! System prompt assembly.

use crate::provider::CapabilitySnapshot;

/// Opening line of the system prompt when `bridge.yaml` sets none.
pub const DEFAULT_PROMPT_INTRO: &str =
    "You are a helpful assistant with access to various tools and services.";

/// Build the system prompt for one request.
///
/// Each tool is listed fully qualified as `provider.tool`, in snapshot order.
/// An empty snapshot yields the intro alone.
pub fn build_system_prompt(intro: &str, snapshot: &CapabilitySnapshot) -> String {
    let mut prompt = intro.trim_end().to_string();
    if snapshot.is_empty() {
        return prompt;
    }

    prompt.push_str("\n\nAvailable tools:\n");
    for entry in &snapshot.tools {
        prompt.push_str("- ");
        prompt.push_str(&entry.provider_name);
        prompt.push('.');
        prompt.push_str(&entry.tool_name);
        let description = entry.description.trim();
        if !description.is_empty() {
            prompt.push_str(": ");
            prompt.push_str(description);
        }
        prompt.push('\n');
    }
    prompt
}
