/// Inline-keyboard callback payloads. The transport caps callback data at
/// 64 bytes, so the wire form is a compact `<prefix>:<key>:<value>` with
/// 7-bit ASCII only: `tf` (task flow), `sf` (session flow), `browse`,
/// `answer`, `delete`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CallbackData {
    /// Task-creation wizard step. `key` names the step, `value` is a small
    /// index or a literal (`here`, `new`, `existing`, `back`).
    TaskFlow { key: String, value: String },
    /// Interactive-session wizard step. Same shape as `TaskFlow`; the final
    /// step carries `<engine-short>.<mode>` (engine-short `i`|`c`|`g`).
    SessionFlow { key: String, value: String },
    /// Directory-browser action: `start`, `back`, or a subdirectory index.
    Browse { value: String },
    /// Answer to an in-session question: which option of the pending
    /// question in `thread_id` was pressed.
    Answer { thread_id: i64, option_index: usize },
    /// Request to delete a finished topic.
    DeleteTopic { thread_id: i64 },
}

pub const MAX_CALLBACK_BYTES: usize = 64;

impl CallbackData {
    /// Encode to the wire form. Returns `None` when the payload would not
    /// fit the 64-byte limit or contains non-ASCII.
    pub fn encode(&self) -> Option<String> {
        let s = match self {
            CallbackData::TaskFlow { key, value } => format!("tf:{key}:{value}"),
            CallbackData::SessionFlow { key, value } => format!("sf:{key}:{value}"),
            CallbackData::Browse { value } => format!("browse:{value}"),
            CallbackData::Answer {
                thread_id,
                option_index,
            } => format!("answer:{thread_id}:{option_index}"),
            CallbackData::DeleteTopic { thread_id } => format!("delete:{thread_id}"),
        };
        if s.len() > MAX_CALLBACK_BYTES || !s.is_ascii() {
            return None;
        }
        Some(s)
    }

    /// Parse the wire form. Total: unknown prefixes and malformed payloads
    /// yield `None`, never an error.
    pub fn parse(data: &str) -> Option<Self> {
        if data.len() > MAX_CALLBACK_BYTES || !data.is_ascii() {
            return None;
        }
        let mut parts = data.splitn(3, ':');
        let prefix = parts.next()?;
        match prefix {
            "tf" | "sf" => {
                let key = parts.next()?.to_string();
                let value = parts.next()?.to_string();
                if key.is_empty() || value.is_empty() {
                    return None;
                }
                if prefix == "tf" {
                    Some(CallbackData::TaskFlow { key, value })
                } else {
                    Some(CallbackData::SessionFlow { key, value })
                }
            }
            "browse" => {
                let value = parts.next()?.to_string();
                if value.is_empty() || parts.next().is_some() {
                    return None;
                }
                Some(CallbackData::Browse { value })
            }
            "answer" => {
                let thread_id = parts.next()?.parse().ok()?;
                let option_index = parts.next()?.parse().ok()?;
                Some(CallbackData::Answer {
                    thread_id,
                    option_index,
                })
            }
            "delete" => {
                let thread_id = parts.next()?.parse().ok()?;
                if parts.next().is_some() {
                    return None;
                }
                Some(CallbackData::DeleteTopic { thread_id })
            }
            _ => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn round_trip_all_variants() {
        let cases = vec![
            CallbackData::TaskFlow {
                key: "machine".into(),
                value: "2".into(),
            },
            CallbackData::SessionFlow {
                key: "start".into(),
                value: "i.stream".into(),
            },
            CallbackData::Browse {
                value: "back".into(),
            },
            CallbackData::Answer {
                thread_id: 9134,
                option_index: 1,
            },
            CallbackData::DeleteTopic { thread_id: 42 },
        ];
        for case in cases {
            let wire = case.encode().expect("should encode");
            assert!(wire.len() <= MAX_CALLBACK_BYTES);
            assert_eq!(CallbackData::parse(&wire), Some(case));
        }
    }

    #[test]
    fn parse_rejects_unknown_prefix() {
        assert_eq!(CallbackData::parse("xx:1:2"), None);
        assert_eq!(CallbackData::parse(""), None);
    }

    #[test]
    fn parse_rejects_malformed_answer() {
        assert_eq!(CallbackData::parse("answer:abc:0"), None);
        assert_eq!(CallbackData::parse("answer:12"), None);
    }

    #[test]
    fn encode_rejects_oversize() {
        let data = CallbackData::TaskFlow {
            key: "k".into(),
            value: "v".repeat(70),
        };
        assert_eq!(data.encode(), None);
    }

    #[test]
    fn encode_rejects_non_ascii() {
        let data = CallbackData::Browse {
            value: "ディレクトリ".into(),
        };
        assert_eq!(data.encode(), None);
    }

    #[test]
    fn parse_rejects_oversize_input() {
        let long = format!("browse:{}", "a".repeat(100));
        assert_eq!(CallbackData::parse(&long), None);
    }

    #[test]
    fn browse_value_is_opaque() {
        assert_eq!(
            CallbackData::parse("browse:7"),
            Some(CallbackData::Browse { value: "7".into() })
        );
        assert_eq!(
            CallbackData::parse("browse:start"),
            Some(CallbackData::Browse {
                value: "start".into()
            })
        );
    }
}
