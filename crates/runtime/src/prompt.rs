//! Turns sent to the master model for one event.

use conductor_llm::ConversationTurn;

use crate::Event;

/// Summary of the event: type, id, timestamp and payload.
pub fn event_context_turn(event: &Event) -> ConversationTurn {
    let payload = serde_json::to_string_pretty(&event.payload).unwrap_or_else(|_| "null".into());
    let mut text = format!(
        "Event received.\ntype: {}\nid: {}\ntimestamp: {}\npayload:\n{}",
        event.event_type,
        event.id,
        event.timestamp.to_rfc3339(),
        payload
    );
    if let Some(metadata) = &event.metadata {
        text.push_str(&format!("\nmetadata: {metadata}"));
    }
    ConversationTurn::user(text)
}

/// The four directive shapes plus the capabilities currently available.
pub fn instruction_turn(capabilities: &[String]) -> ConversationTurn {
    let listed = if capabilities.is_empty() {
        "none".to_string()
    } else {
        capabilities.join(", ")
    };
    ConversationTurn::user(format!(
        "Decide how to handle this event. Either call one capability through a \
         tool call, or reply with exactly one JSON object of one of these shapes:\n\
         {{\"action\": \"call_capability\", \"name\": \"<capability>\", \"params\": {{}}}}\n\
         {{\"action\": \"schedule_work\", \"name\": \"<job>\", \"data\": {{}}, \"options\": {{\"priority\": 0, \"delay\": 0}}}}\n\
         {{\"action\": \"send_response\", \"content\": \"<reply>\", \"responseType\": \"text\"}}\n\
         {{\"action\": \"no_op\", \"reason\": \"<why>\"}}\n\
         Available capabilities: {listed}."
    ))
}
