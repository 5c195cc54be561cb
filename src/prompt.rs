//! Prompt assembly: one system policy message, the replayed history window
//! and a single final user turn, grounded in retrieved context when any
//! survived the similarity threshold.

use crate::history::StoredMessage;
use crate::llm::ChatMessage;

const SYSTEM_PROMPT: &str = "\
You are PharmaAI, a professional and caring AI assistant for medicine, \
pharmaceuticals and dermatological health.

Your tasks:
- Answer questions about health, medicines, conditions and skin care \
accurately, clearly and based on scientific evidence.
- When information from the database is provided, use it to answer \
precisely and mention product names, brands and prices.
- When NO specific information from the database is available (greetings, \
general questions), reply naturally and helpfully.
- Keep answers short, clear and friendly.

Important:
- NEVER invent facts about specific medicines or products.
- Always advise seeing a doctor or pharmacist when symptoms are serious or \
persistent.
- For general questions about medical definitions you may explain from \
common medical knowledge.";

/// Builds the message list for one generation call. History entries keep
/// their original roles; stored system rows are policy, not conversation,
/// and are not replayed.
pub fn build(user_message: &str, context: &str, history: &[StoredMessage]) -> Vec<ChatMessage> {
    let mut messages = Vec::with_capacity(history.len() + 2);
    messages.push(ChatMessage::system(SYSTEM_PROMPT));

    for entry in history {
        match entry.role.as_str() {
            "user" => messages.push(ChatMessage::user(entry.content.clone())),
            "assistant" => messages.push(ChatMessage::assistant(entry.content.clone())),
            _ => {}
        }
    }

    let turn = if context.is_empty() {
        format!(
            "User's question: {user_message}\n\n\
             Note: no specific product in the database matches this \
             question. Answer naturally and helpfully."
        )
    } else {
        format!(
            "Context from the database:\n{context}\n\n\
             User's question: {user_message}\n\n\
             Answer based on the context above."
        )
    };
    messages.push(ChatMessage::user(turn));

    messages
}
