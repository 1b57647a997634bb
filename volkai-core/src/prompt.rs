//! Conversation → prompt text.

use crate::model::{Message, Role};

pub const DEFAULT_PREAMBLE: &str = "You're VolkAI, Created by Kairosoft AI Solutions Limited.";

/// Render a conversation into the single prompt string the backend expects.
///
/// Each message becomes one role-prefixed line, in order, and the prompt ends
/// with an open assistant turn. An empty `preamble` drops the header block.
pub fn format_prompt(preamble: &str, messages: &[Message]) -> String {
    let mut prompt = String::new();
    if !preamble.is_empty() {
        prompt.push_str("### Context: ");
        prompt.push_str(preamble);
        prompt.push_str("\n\n");
    }
    for msg in messages {
        let prefix = match msg.role {
            Role::User => "### Human: ",
            Role::Assistant => "### Assistant: ",
            Role::System => "### Context: ",
        };
        prompt.push_str(prefix);
        prompt.push_str(&msg.content);
        prompt.push('\n');
    }
    prompt.push_str("### Assistant:");
    prompt
}
