//! Integration tests for the orchestrator core.
//!
//! With the lib+binary crate structure, tests import library modules
//! directly. Everything here runs without a database or network; the
//! store-backed paths live in `database_tests.rs`.

use orchestrator::scrub::{scrub, scrub_str};
use orchestrator::stream::{parse_line, wrap_user_input, Chunk, StreamParser};

mod scrub_properties {
    use super::*;

    #[test]
    fn idempotent_on_pty_noise() {
        let samples: Vec<Vec<u8>> = vec![
            b"\x1b[2J\x1b[H\x1b[31mbuild failed\x1b[0m\n".to_vec(),
            "╭───╮\n│ ok │\n╰───╯\n✻ Thinking…\nreal line\n".as_bytes().to_vec(),
            b"10%\r40%\r90%\r100%\ndone\n".to_vec(),
            b"\x1b]0;window title".to_vec(),
            (0u8..=255).collect(),
        ];
        for raw in samples {
            let once = scrub(&raw);
            assert_eq!(scrub_str(&once), once);
        }
    }

    #[test]
    fn forbidden_bytes_never_survive() {
        let mut raw: Vec<u8> = (0u8..=255).cycle().take(2048).collect();
        raw.extend_from_slice(b"\x1b[31m tail \x1b]0;t\x07");
        let clean = scrub(&raw);
        for b in clean.bytes() {
            let forbidden = b == 0x1b
                || b <= 0x08
                || b == 0x0b
                || b == 0x0c
                || (0x0e..=0x1f).contains(&b);
            assert!(!forbidden, "byte {:#04x} survived scrubbing", b);
        }
        assert!(!clean.contains('\u{FFFD}'));
    }
}

mod parser_properties {
    use super::*;

    fn happy_task_stream() -> Vec<u8> {
        concat!(
            r#"{"type":"system","subtype":"init","session_id":"s-1"}"#,
            "\n",
            r#"{"type":"assistant","message":{"content":[{"type":"text","text":"done"}]}}"#,
            "\n",
            r#"{"type":"result","subtype":"success","total_cost_usd":0.01,"duration_ms":1234}"#,
            "\n",
        )
        .as_bytes()
        .to_vec()
    }

    #[test]
    fn happy_task_stream_decodes() {
        let mut parser = StreamParser::new();
        let mut chunks = parser.feed(&happy_task_stream());
        chunks.extend(parser.finish());

        assert_eq!(chunks.len(), 2);
        assert_eq!(
            chunks[0],
            Chunk::Text {
                text: "done".into()
            }
        );
        assert_eq!(
            chunks[1],
            Chunk::Result {
                subtype: "success".into(),
                cost_usd: Some(0.01),
                duration_ms: Some(1234),
            }
        );
    }

    #[test]
    fn deterministic_across_every_split() {
        let stream = happy_task_stream();
        let mut reference = StreamParser::new();
        let mut expected = reference.feed(&stream);
        expected.extend(reference.finish());

        for split in 0..stream.len() {
            let mut parser = StreamParser::new();
            let mut got = parser.feed(&stream[..split]);
            got.extend(parser.feed(&stream[split..]));
            got.extend(parser.finish());
            assert_eq!(got, expected, "split at byte {}", split);
        }
    }

    #[test]
    fn deterministic_across_three_way_splits() {
        let stream = happy_task_stream();
        let mut reference = StreamParser::new();
        let mut expected = reference.feed(&stream);
        expected.extend(reference.finish());

        let n = stream.len();
        for a in (0..n).step_by(7) {
            for b in (a..n).step_by(11) {
                let mut parser = StreamParser::new();
                let mut got = parser.feed(&stream[..a]);
                got.extend(parser.feed(&stream[a..b]));
                got.extend(parser.feed(&stream[b..]));
                got.extend(parser.finish());
                assert_eq!(got, expected, "splits at {} and {}", a, b);
            }
        }
    }

    #[test]
    fn framing_round_trip() {
        for text in ["edit src/a.rs", "multi\nline\nreply", "ünïcodé ✓", "No"] {
            let wrapped = wrap_user_input(text);
            assert!(wrapped.ends_with('\n'));
            let value: serde_json::Value = serde_json::from_str(wrapped.trim()).unwrap();
            assert_eq!(value["type"], "user");
            assert_eq!(value["message"]["role"], "user");
            assert_eq!(value["message"]["content"][0]["type"], "text");
            assert_eq!(value["message"]["content"][0]["text"], text);
        }
    }

    #[test]
    fn ask_user_s4_shape() {
        let line = r#"{"type":"assistant","message":{"content":[{"type":"tool_use","id":"toolu_01","name":"AskUserQuestion","input":{"questions":[{"question":"Proceed?","options":[{"label":"Yes"},{"label":"No"}]}]}}]}}"#;
        let chunks = parse_line(line);
        assert_eq!(chunks.len(), 1);
        match &chunks[0] {
            Chunk::AskUser {
                tool_id,
                question,
                options,
            } => {
                assert_eq!(tool_id, "toolu_01");
                assert_eq!(question, "Proceed?");
                assert_eq!(options, &vec!["Yes".to_string(), "No".to_string()]);
            }
            other => panic!("expected AskUser, got {:?}", other),
        }
    }
}

mod chatter_suppression {
    use anyhow::Result;
    use async_trait::async_trait;
    use chat_client::InlineKeyboard;
    use orchestrator::state::SuppressionGuard;
    use orchestrator::transport::{ChatTransport, SuppressedTransport, SUPPRESSED_MESSAGE_ID};
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;

    /// Counts how often the wire was actually touched.
    #[derive(Default)]
    struct CountingTransport {
        sends: AtomicUsize,
    }

    #[async_trait]
    impl ChatTransport for CountingTransport {
        async fn send(
            &self,
            _chat_id: i64,
            _thread_id: Option<i64>,
            _text: &str,
            _keyboard: Option<&InlineKeyboard>,
        ) -> Result<i64> {
            self.sends.fetch_add(1, Ordering::SeqCst);
            Ok(1234)
        }
        async fn edit(&self, _: i64, _: i64, _: &str, _: Option<&InlineKeyboard>) -> Result<()> {
            Ok(())
        }
        async fn delete_message(&self, _: i64, _: i64) -> Result<()> {
            Ok(())
        }
        async fn create_thread(&self, _: i64, _: &str) -> Result<i64> {
            Ok(1)
        }
        async fn rename_thread(&self, _: i64, _: i64, _: &str) -> Result<()> {
            Ok(())
        }
        async fn close_thread(&self, _: i64, _: i64) -> Result<()> {
            Ok(())
        }
        async fn reopen_thread(&self, _: i64, _: i64) -> Result<()> {
            Ok(())
        }
        async fn delete_thread(&self, _: i64, _: i64) -> Result<()> {
            Ok(())
        }
        async fn answer_callback(&self, _: &str) -> Result<()> {
            Ok(())
        }
    }

    #[tokio::test]
    async fn active_browsing_and_recently_closed_are_suppressed() {
        let inner = Arc::new(CountingTransport::default());
        let guard = Arc::new(SuppressionGuard::new());
        let transport = SuppressedTransport::new(Arc::clone(&inner), Arc::clone(&guard));

        guard.mark_active(10);
        guard.mark_browsing(20);
        guard.mark_active(30);
        guard.clear_active(30); // now recently-closed

        for thread in [10, 20, 30] {
            let id = transport.send(-1, Some(thread), "chatter", None).await.unwrap();
            assert_eq!(id, SUPPRESSED_MESSAGE_ID, "thread {} not suppressed", thread);
        }
        assert_eq!(inner.sends.load(Ordering::SeqCst), 0, "wire was contacted");

        // An unrelated thread passes through
        let id = transport.send(-1, Some(99), "hello", None).await.unwrap();
        assert_eq!(id, 1234);
        assert_eq!(inner.sends.load(Ordering::SeqCst), 1);

        // Top-level sends are never suppressed
        let id = transport.send(-1, None, "hello", None).await.unwrap();
        assert_eq!(id, 1234);
        assert_eq!(inner.sends.load(Ordering::SeqCst), 2);
    }
}

mod engine_fallback_classification {
    use orchestrator::engine::{classify_failure, Engine};

    #[test]
    fn s2_rate_limited_claude_is_retriable() {
        let stderr = "Error: rate_limit reached for requests";
        let err = classify_failure(stderr, 1).expect("should classify");
        assert!(err.retriable());
    }

    #[test]
    fn auth_markers_are_retriable() {
        for marker in [
            "oauth token has expired",
            "authentication_error: invalid bearer",
            "HTTP 429",
            "billing hard limit reached",
            "insufficient_quota",
            "quota exceeded for model",
            "Invalid API key provided",
            "401 Unauthorized",
            "overloaded_error",
        ] {
            assert!(
                classify_failure(marker, 1).is_some(),
                "marker not classified: {}",
                marker
            );
        }
    }

    #[test]
    fn compile_errors_are_not_retriable() {
        assert!(classify_failure("error[E0308]: mismatched types", 101).is_none());
    }

    #[test]
    fn engine_catalogue_is_stable() {
        assert_eq!(Engine::Claude.command(), "itachi");
        assert_eq!(Engine::Codex.command(), "itachic");
        assert_eq!(Engine::Gemini.command(), "itachig");
    }
}

mod needs_input_heuristic {
    use orchestrator::session::needs_input;

    #[test]
    fn s3_question_tail() {
        assert!(needs_input("I scaffolded the module.\nWhich file should I edit?"));
    }

    #[test]
    fn completion_tails_do_not_wait() {
        assert!(!needs_input("Pushed branch task/a1b2c3d4 and opened the PR."));
    }
}

mod callback_wire_format {
    use common::callback::{CallbackData, MAX_CALLBACK_BYTES};

    #[test]
    fn all_prefixes_fit_the_budget() {
        let samples = [
            "tf:machine:3",
            "sf:start:i.stream",
            "browse:here",
            "answer:9134:1",
            "delete:9134",
        ];
        for wire in samples {
            assert!(wire.len() <= MAX_CALLBACK_BYTES);
            assert!(CallbackData::parse(wire).is_some(), "failed: {}", wire);
        }
    }

    #[test]
    fn ascii_only() {
        assert!(CallbackData::parse("browse:départ").is_none());
    }
}

mod shell_adaptation {
    use orchestrator::shell::adapt_command;

    #[test]
    fn posix_gets_path_export() {
        let cmd = adapt_command("git fetch --all --prune", false);
        assert!(cmd.starts_with("export PATH="));
    }

    #[test]
    fn windows_never_sees_double_ampersand() {
        let cmd = adapt_command("cd ws && cat p.txt && itachi --ds --dp", true);
        assert!(!cmd.contains("&&"));
        assert!(cmd.contains("powershell"));
    }
}

mod workspace_helpers {
    use orchestrator::workspace::{branch_name, commit_message, parse_pr_url};

    #[test]
    fn s1_pr_url_extraction() {
        let stdout = "https://github.com/x/foo/pull/7\n";
        assert_eq!(parse_pr_url(stdout).as_deref(), Some("https://github.com/x/foo/pull/7"));
    }

    #[test]
    fn s1_commit_message() {
        assert_eq!(commit_message("add readme"), "feat: add readme");
    }

    #[test]
    fn task_branch_shape() {
        assert_eq!(branch_name("a1b2c3d4"), "task/a1b2c3d4");
    }
}
