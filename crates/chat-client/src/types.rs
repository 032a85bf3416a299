use serde::{Deserialize, Serialize};

/// One row of inline-keyboard buttons.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct InlineButton {
    pub text: String,
    pub callback_data: String,
}

/// Inline keyboard attached to a message. Serialized to the wire shape
/// `{"inline_keyboard": [[...]]}` expected by the bot API.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct InlineKeyboard {
    pub inline_keyboard: Vec<Vec<InlineButton>>,
}

impl InlineKeyboard {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn row(mut self, buttons: Vec<InlineButton>) -> Self {
        self.inline_keyboard.push(buttons);
        self
    }

    pub fn button(text: impl Into<String>, callback_data: impl Into<String>) -> InlineButton {
        InlineButton {
            text: text.into(),
            callback_data: callback_data.into(),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct User {
    pub id: i64,
    #[serde(default)]
    pub username: Option<String>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct Chat {
    pub id: i64,
}

/// An incoming chat message (top-level or inside a thread).
#[derive(Debug, Clone, Deserialize)]
pub struct IncomingMessage {
    pub message_id: i64,
    pub chat: Chat,
    #[serde(default)]
    pub message_thread_id: Option<i64>,
    #[serde(default)]
    pub from: Option<User>,
    #[serde(default)]
    pub text: Option<String>,
}

/// A pressed inline-keyboard button.
#[derive(Debug, Clone, Deserialize)]
pub struct CallbackQuery {
    pub id: String,
    pub from: User,
    #[serde(default)]
    pub message: Option<IncomingMessage>,
    #[serde(default)]
    pub data: Option<String>,
}

/// One long-poll update: either a message or a callback, never both.
#[derive(Debug, Clone, Deserialize)]
pub struct Update {
    pub update_id: i64,
    #[serde(default)]
    pub message: Option<IncomingMessage>,
    #[serde(default)]
    pub callback_query: Option<CallbackQuery>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn keyboard_serializes_to_wire_shape() {
        let kb = InlineKeyboard::new().row(vec![
            InlineKeyboard::button("Yes", "answer:7:0"),
            InlineKeyboard::button("No", "answer:7:1"),
        ]);
        let json = serde_json::to_value(&kb).unwrap();
        assert_eq!(json["inline_keyboard"][0][1]["callback_data"], "answer:7:1");
    }

    #[test]
    fn update_with_message_deserializes() {
        let raw = serde_json::json!({
            "update_id": 100,
            "message": {
                "message_id": 5,
                "chat": {"id": -100123},
                "message_thread_id": 77,
                "from": {"id": 42, "username": "dev"},
                "text": "edit src/a.rs"
            }
        });
        let u: Update = serde_json::from_value(raw).unwrap();
        let m = u.message.unwrap();
        assert_eq!(m.chat.id, -100123);
        assert_eq!(m.message_thread_id, Some(77));
        assert_eq!(m.text.as_deref(), Some("edit src/a.rs"));
    }

    #[test]
    fn update_with_callback_deserializes() {
        let raw = serde_json::json!({
            "update_id": 101,
            "callback_query": {
                "id": "cbq1",
                "from": {"id": 42},
                "data": "answer:77:1",
                "message": {
                    "message_id": 9,
                    "chat": {"id": -100123}
                }
            }
        });
        let u: Update = serde_json::from_value(raw).unwrap();
        let cb = u.callback_query.unwrap();
        assert_eq!(cb.data.as_deref(), Some("answer:77:1"));
        assert_eq!(cb.message.unwrap().message_id, 9);
    }
}
