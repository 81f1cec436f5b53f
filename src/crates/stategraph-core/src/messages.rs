//! Message history reducer
//!
//! [`add_messages`] merges writes into a conversation history held as a JSON
//! array of message objects. Writes are applied one after the other in task
//! order:
//!
//! ```text
//! Before:  [{id: 1, text: "hi"}, {id: 2, text: "draft"}]
//! Writes:  [{id: 2, text: "final"}, {id: 3, text: "bye"}]
//! After:   [{id: 1, text: "hi"}, {id: 2, text: "final"}, {id: 3, text: "bye"}]
//! ```
//!
//! - A message whose `"id"` is already present replaces it in place
//! - Any other message, including one without an id, is appended
//! - `{"type": "remove", "id": X}` deletes message `X`
//! - `{"type": "remove", "id": "__remove_all__"}` clears the history
//!
//! A write is either one message object or an array of them. Because every
//! write is folded individually the result does not depend on how the writes
//! of a thread are split across supersteps, so the channel accepts concurrent
//! writers.
//!
//! ```rust
//! use stategraph_core::messages::add_messages;
//! use serde_json::json;
//!
//! let history = add_messages(
//!     Some(json!([{"id": "1", "content": "Hello"}])),
//!     vec![json!({"id": "1", "content": "Hello again"})],
//! )
//! .unwrap();
//! assert_eq!(history, json!([{"id": "1", "content": "Hello again"}]));
//! ```

use serde_json::Value;

/// Id of the removal marker that clears the whole history
pub const REMOVE_ALL: &str = "__remove_all__";

/// Fold `writes` into the history `existing`
pub fn add_messages(existing: Option<Value>, writes: Vec<Value>) -> Result<Value, String> {
    let mut history = match existing {
        None | Some(Value::Null) => Vec::new(),
        Some(Value::Array(items)) => items,
        Some(other) => return Err(format!("message history must be an array, found {}", other)),
    };

    for write in writes {
        let messages = match write {
            Value::Array(items) => items,
            Value::Object(_) => vec![write],
            other => return Err(format!("expected a message or a list of messages, found {}", other)),
        };
        for message in messages {
            apply(&mut history, message)?;
        }
    }
    Ok(Value::Array(history))
}

fn apply(history: &mut Vec<Value>, message: Value) -> Result<(), String> {
    if !message.is_object() {
        return Err(format!("message must be an object, found {}", message));
    }
    let id = message.get("id").and_then(Value::as_str).map(str::to_owned);

    if message.get("type").and_then(Value::as_str) == Some("remove") {
        let id = id.ok_or_else(|| "remove marker needs an \"id\"".to_string())?;
        if id == REMOVE_ALL {
            history.clear();
            return Ok(());
        }
        let index = position(history, &id)
            .ok_or_else(|| format!("cannot remove message '{}': no such id", id))?;
        history.remove(index);
        return Ok(());
    }

    match id.as_deref().and_then(|id| position(history, id)) {
        Some(index) => history[index] = message,
        None => history.push(message),
    }
    Ok(())
}

fn position(history: &[Value], id: &str) -> Option<usize> {
    history
        .iter()
        .position(|m| m.get("id").and_then(Value::as_str) == Some(id))
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_replace_by_id_keeps_position() {
        let history = add_messages(
            Some(json!([{"id": "1", "text": "hi"}, {"id": "2", "text": "draft"}])),
            vec![json!([{"id": "2", "text": "final"}, {"id": "3", "text": "bye"}])],
        )
        .unwrap();
        assert_eq!(
            history,
            json!([
                {"id": "1", "text": "hi"},
                {"id": "2", "text": "final"},
                {"id": "3", "text": "bye"}
            ])
        );
    }

    #[test]
    fn test_later_write_wins_within_batch() {
        let history = add_messages(
            None,
            vec![json!({"id": "a", "v": 1}), json!({"id": "a", "v": 2}), json!({"v": 3})],
        )
        .unwrap();
        assert_eq!(history, json!([{"id": "a", "v": 2}, {"v": 3}]));
    }

    #[test]
    fn test_remove_markers() {
        let start = Some(json!([{"id": "1"}, {"id": "2"}]));
        let history = add_messages(start.clone(), vec![json!({"type": "remove", "id": "1"})]).unwrap();
        assert_eq!(history, json!([{"id": "2"}]));

        let history = add_messages(
            start.clone(),
            vec![json!([{"type": "remove", "id": REMOVE_ALL}, {"id": "9"}])],
        )
        .unwrap();
        assert_eq!(history, json!([{"id": "9"}]));

        assert!(add_messages(start, vec![json!({"type": "remove", "id": "7"})]).is_err());
    }

    #[test]
    fn test_grouping_does_not_change_history() {
        let writes = vec![
            json!({"id": "1", "v": 1}),
            json!([{"id": "2", "v": 2}, {"id": "1", "v": 3}]),
            json!({"type": "remove", "id": "2"}),
        ];
        let once = add_messages(None, writes.clone()).unwrap();
        let mut stepwise = None;
        for write in writes {
            stepwise = Some(add_messages(stepwise, vec![write]).unwrap());
        }
        assert_eq!(Some(once), stepwise);
    }

    #[test]
    fn test_rejects_bad_shapes() {
        assert!(add_messages(None, vec![json!("hello")]).is_err());
        assert!(add_messages(None, vec![json!([1])]).is_err());
        assert!(add_messages(Some(json!({"id": "1"})), vec![]).is_err());
    }
}
