use crate::model::{ChatMessage, Role};

/// Drops non-conversational turns and a leading "initialize the model"
/// placeholder, then appends the next user message.
pub fn build_chat_messages(history: &[ChatMessage], next_user_text: &str) -> Vec<ChatMessage> {
    let mut messages: Vec<ChatMessage> = history
        .iter()
        .filter(|m| matches!(m.role, Role::User | Role::Assistant))
        .cloned()
        .collect();
    if messages.first().is_some_and(is_placeholder) {
        messages.remove(0);
    }

    let text = next_user_text.trim();
    if !text.is_empty() {
        messages.push(ChatMessage::user(text));
    }
    messages
}

fn is_placeholder(message: &ChatMessage) -> bool {
    message.role == Role::Assistant
        && message
            .content
            .to_lowercase()
            .contains("initialize the model")
}

/// Renders a transcript as `User:`/`Assistant:` lines, ending with an open
/// assistant turn.
pub fn render_prompt(messages: &[ChatMessage]) -> String {
    let mut prompt = String::new();
    for message in messages {
        let label = match message.role {
            Role::User => "User",
            Role::Assistant => "Assistant",
            Role::System => continue,
        };
        prompt.push_str(label);
        prompt.push_str(": ");
        prompt.push_str(message.content.trim());
        prompt.push('\n');
    }
    prompt.push_str("Assistant:");
    prompt
}
