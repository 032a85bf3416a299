use regex::Regex;
use std::sync::OnceLock;

// Terminal output arrives as raw PTY bytes: escape sequences may be split
// across chunks, carriage returns overwrite lines, and TUI engines draw
// frames and spinners. `scrub` turns all of that into displayable text.
// It is total and idempotent: scrub(scrub(x)) == scrub(x).

static CSI_RE: OnceLock<Regex> = OnceLock::new();
static OSC_RE: OnceLock<Regex> = OnceLock::new();
static ESC2_RE: OnceLock<Regex> = OnceLock::new();
static SPINNER_LINE_RE: OnceLock<Regex> = OnceLock::new();
static SPINNER_TAIL_RE: OnceLock<Regex> = OnceLock::new();
static TIMING_LINE_RE: OnceLock<Regex> = OnceLock::new();
static TOKEN_LINE_RE: OnceLock<Regex> = OnceLock::new();
static BANNER_RE: OnceLock<Regex> = OnceLock::new();

fn csi_re() -> &'static Regex {
    CSI_RE.get_or_init(|| Regex::new(r"\x1b\[[0-?]*[ -/]*[@-~]").expect("invalid CSI regex"))
}

fn osc_re() -> &'static Regex {
    // OSC with BEL or ST terminator, or unterminated (PTY chunks may split
    // the sequence; the tail before the next ESC/newline is still chrome).
    OSC_RE.get_or_init(|| {
        Regex::new(r"\x1b\][^\x07\x1b\n]*(?:\x07|\x1b\\)?").expect("invalid OSC regex")
    })
}

fn esc2_re() -> &'static Regex {
    ESC2_RE.get_or_init(|| Regex::new(r"\x1b[@-Z\\-_=>]?").expect("invalid ESC regex"))
}

fn spinner_line_re() -> &'static Regex {
    // "✻ Churning… (3s · 1.2k tokens)" and friends: optional icon chars,
    // a capitalized word, U+2026.
    SPINNER_LINE_RE.get_or_init(|| {
        Regex::new(r"^\s*(?:[✻✽✢✳·⏺◐◑◒◓○●*+~]\s*)*[A-Z][a-z]+…").expect("invalid spinner regex")
    })
}

fn spinner_tail_re() -> &'static Regex {
    SPINNER_TAIL_RE.get_or_init(|| {
        Regex::new(r"\s*[✻✽✢✳·◐◑◒◓*+~]\s*[A-Z][a-z]+…(?:\s*\([^)]*\))?\s*$")
            .expect("invalid spinner tail regex")
    })
}

fn timing_line_re() -> &'static Regex {
    TIMING_LINE_RE.get_or_init(|| {
        Regex::new(r"^\s*\(?\d+(?:\.\d+)?\s*(?:ms|s|m|h)\)?(?:\s*[·•]\s*\S.*)?\s*$")
            .expect("invalid timing regex")
    })
}

fn token_line_re() -> &'static Regex {
    TOKEN_LINE_RE.get_or_init(|| {
        Regex::new(r"(?i)^\s*[\d.,]+k?\s*tokens?\b.*$").expect("invalid token regex")
    })
}

fn banner_re() -> &'static Regex {
    BANNER_RE.get_or_init(|| {
        Regex::new(
            r"(?i)^\s*(?:welcome to\b.*|\?\s*for shortcuts.*|press (?:ctrl|esc)\b.*|esc to interrupt.*|bypassing permissions.*|--dangerously-skip-permissions.*|auto-accept edits\b.*)$",
        )
        .expect("invalid banner regex")
    })
}

/// Scrub raw terminal bytes into displayable text. Invalid UTF-8 is
/// dropped, never surfaced.
pub fn scrub(raw: &[u8]) -> String {
    scrub_str(&String::from_utf8_lossy(raw))
}

pub fn scrub_str(text: &str) -> String {
    let text = resolve_carriage_returns(text);
    let text = strip_escapes(&text);
    let text = filter_chrome(&text);
    collapse_blank_lines(&text)
}

/// `\r` overwrites the current line: keep only the final segment per line.
fn resolve_carriage_returns(text: &str) -> String {
    let normalized = text.replace("\r\n", "\n");
    normalized
        .split('\n')
        .map(|line| line.rsplit('\r').next().unwrap_or(line))
        .collect::<Vec<_>>()
        .join("\n")
}

fn strip_escapes(text: &str) -> String {
    let text = csi_re().replace_all(text, "");
    let text = osc_re().replace_all(&text, "");
    let text = esc2_re().replace_all(&text, "");
    text.chars()
        .filter(|&c| {
            let code = c as u32;
            // C0 controls other than newline/tab, DEL, and the replacement
            // character are never displayable.
            !(code < 0x20 && c != '\n' && c != '\t') && code != 0x7f && c != '\u{FFFD}'
        })
        .collect()
}

fn is_box_drawing(c: char) -> bool {
    matches!(c, '\u{2500}'..='\u{257F}' | '\u{2580}'..='\u{259F}')
}

fn filter_chrome(text: &str) -> String {
    let mut out: Vec<String> = Vec::new();
    for line in text.split('\n') {
        let had_frame = line.chars().any(is_box_drawing);
        let line: String = line.chars().filter(|c| !is_box_drawing(*c)).collect();

        let trimmed = line.trim();
        if had_frame && trimmed.is_empty() {
            continue;
        }
        if spinner_line_re().is_match(&line) {
            continue;
        }
        // Tool indicator and collapsed-result gutter lines
        if trimmed.starts_with('⏺') || trimmed.starts_with('⎿') {
            continue;
        }
        // Status bar fragments: "~/project ❯ main ❯ …"
        if trimmed.contains(" ❯ ") || trimmed.starts_with('❯') {
            continue;
        }
        if !trimmed.is_empty()
            && (timing_line_re().is_match(trimmed)
                || token_line_re().is_match(trimmed)
                || banner_re().is_match(trimmed))
        {
            continue;
        }

        // Spinner tails glued to real content; repeat because one strip can
        // expose another tail.
        let mut line = line;
        loop {
            let stripped = spinner_tail_re().replace(&line, "").into_owned();
            if stripped == line {
                break;
            }
            line = stripped;
        }
        out.push(line);
    }
    out.join("\n")
}

fn collapse_blank_lines(text: &str) -> String {
    let mut out: Vec<&str> = Vec::new();
    let mut blanks = 0;
    for line in text.split('\n') {
        if line.trim().is_empty() {
            blanks += 1;
            if blanks > 2 {
                continue;
            }
            out.push("");
        } else {
            blanks = 0;
            out.push(line);
        }
    }
    out.join("\n")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn strips_csi_sequences() {
        let raw = b"\x1b[31mred\x1b[0m plain \x1b[2K\x1b[1;1H";
        assert_eq!(scrub(raw), "red plain ");
    }

    #[test]
    fn strips_osc_with_and_without_terminator() {
        assert_eq!(scrub(b"\x1b]0;title\x07text"), "text");
        assert_eq!(scrub(b"\x1b]0;title\x1b\\text"), "text");
        // Split mid-sequence: the tail before the newline is chrome
        assert_eq!(scrub(b"\x1b]0;half-title\nnext"), "\nnext");
    }

    #[test]
    fn carriage_return_keeps_last_segment() {
        assert_eq!(scrub(b"10%\r50%\r100% done\n"), "100% done\n");
        assert_eq!(scrub(b"line one\r\nline two\r\n"), "line one\nline two\n");
    }

    #[test]
    fn drops_c0_controls_and_replacement_char() {
        let raw = b"a\x00b\x08c\x0bd\tkeep\ne\xff";
        let clean = scrub(raw);
        assert_eq!(clean, "abcd\tkeep\ne");
    }

    #[test]
    fn idempotent() {
        let samples: Vec<&[u8]> = vec![
            b"\x1b[31mred\x1b[0m\n\n\n\n\nfoo \xe2\x9c\xbb Churning\xe2\x80\xa6 (3s)",
            b"plain text\nwith lines\n",
            b"10%\r50%\rdone \xe2\x9c\xbb One\xe2\x80\xa6 \xe2\x9c\xbb Two\xe2\x80\xa6",
            b"\x1b]0;t\x07\x1b[2Jbody",
        ];
        for raw in samples {
            let once = scrub(raw);
            assert_eq!(scrub_str(&once), once, "not idempotent for {:?}", raw);
        }
    }

    #[test]
    fn never_emits_forbidden_bytes() {
        let mut raw = Vec::new();
        for b in 0u8..=255 {
            raw.push(b);
        }
        raw.extend_from_slice("normal text ✻ Spin… ok".as_bytes());
        let clean = scrub(&raw);
        for b in clean.bytes() {
            assert!(
                !(b == 0x1b || b <= 0x08 || b == 0x0b || b == 0x0c || (0x0e..=0x1f).contains(&b)),
                "forbidden byte {:#x} in output",
                b
            );
        }
        assert!(!clean.contains('\u{FFFD}'));
    }

    #[test]
    fn drops_box_drawing_frames() {
        let raw = "╭──────────╮\n│  hello   │\n╰──────────╯\n".as_bytes();
        let clean = scrub(raw);
        assert!(!clean.contains('╭'));
        assert!(clean.contains("hello"));
    }

    #[test]
    fn drops_spinner_lines() {
        assert_eq!(scrub("✻ Thinking…\nreal output\n".as_bytes()), "real output\n");
        assert_eq!(scrub("Churning… (2s · 3.1k tokens)\nok".as_bytes()), "ok");
    }

    #[test]
    fn drops_status_bar_and_tool_lines() {
        let raw = "~/proj ❯ main ❯ idle\n⏺ Bash(cargo test)\n⎿ 42 passed\nkept\n".as_bytes();
        assert_eq!(scrub(raw), "kept\n");
    }

    #[test]
    fn drops_timing_and_banner_lines() {
        let raw = "(3s)\n12.4k tokens\nWelcome to the CLI v2.0\n? for shortcuts\nbody\n";
        assert_eq!(scrub(raw.as_bytes()), "body\n");
    }

    #[test]
    fn strips_trailing_spinner_tail() {
        assert_eq!(scrub("done editing ✻ Finishing… (1s)".as_bytes()), "done editing");
    }

    #[test]
    fn collapses_blank_runs() {
        assert_eq!(scrub(b"a\n\n\n\n\nb"), "a\n\nb");
    }
}
