// Text Processing Service
// Normalization, sentence splitting and fragment comparison helpers

use regex::Regex;
use std::sync::OnceLock;

fn nbsp_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"[\u{3000}\u{00A0}]").expect("nbsp regex"))
}

fn horizontal_ws_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    // Form feed is kept: it separates pages in extracted PDF text.
    RE.get_or_init(|| Regex::new(r"[ \t\x0B]+").expect("whitespace regex"))
}

fn token_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"[A-Za-z0-9_]+|[\u{4e00}-\u{9fff}]").expect("token regex"))
}

fn bullet_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"^\s*(?:[-*•]|\d{1,3}[.)])\s+").expect("bullet regex"))
}

/// Normalize extracted text before segmentation
pub fn normalize_text(text: &str) -> String {
    if text.is_empty() {
        return String::new();
    }

    let mut s = nbsp_re().replace_all(text, " ").to_string();

    // Normalize line endings
    s = s.replace("\r\n", "\n").replace('\r', "\n");

    s = horizontal_ws_re().replace_all(&s, " ").to_string();

    // Strip each line (spaces only, so leading form feeds survive)
    s = s
        .lines()
        .map(|ln| ln.trim_matches(' '))
        .collect::<Vec<_>>()
        .join("\n");

    s.trim().to_string()
}

/// Estimate token count (Chinese chars + English words)
pub fn estimate_tokens(text: &str) -> usize {
    if text.is_empty() {
        return 1;
    }
    token_re().find_iter(text).count().max(1)
}

pub fn count_words(text: &str) -> usize {
    text.split_whitespace().count()
}

/// Sentence splitting that respects quotes and decimal numbers
pub fn split_sentences(text: &str) -> Vec<String> {
    let mut sentences = Vec::new();
    let chars: Vec<char> = text.chars().collect();
    let mut buffer = String::new();
    let mut in_quote = false;

    for (i, &ch) in chars.iter().enumerate() {
        buffer.push(ch);

        if matches!(ch, '"' | '\u{201c}' | '\u{201d}') {
            in_quote = !in_quote;
        }

        if !matches!(ch, '。' | '！' | '？' | '.' | '!' | '?') || in_quote {
            continue;
        }

        // Decimal numbers and abbreviations glued to the next word.
        if ch == '.' {
            let prev_digit = i > 0 && chars[i - 1].is_ascii_digit();
            let next = chars.get(i + 1);
            if prev_digit && next.is_some_and(|c| c.is_ascii_digit()) {
                continue;
            }
            if next.is_some_and(|c| c.is_alphanumeric()) {
                continue;
            }
        }

        let sentence = buffer.trim();
        if !sentence.is_empty() {
            sentences.push(sentence.to_string());
        }
        buffer.clear();
    }

    let remaining = buffer.trim();
    if !remaining.is_empty() {
        sentences.push(remaining.to_string());
    }

    sentences
}

/// Split a leading list marker ("- ", "* ", "1. ", "2) ") off a line.
/// Returns whether one was present and the remaining text.
pub fn strip_bullet(line: &str) -> (bool, &str) {
    match bullet_re().find(line) {
        Some(m) => (true, line[m.end()..].trim()),
        None => (false, line.trim()),
    }
}

/// Lowercase, keep alphanumerics, collapse everything else to single spaces.
pub fn normalize_fragment(fragment: &str) -> String {
    let mut out = String::with_capacity(fragment.len());
    let mut pending_space = false;
    for ch in fragment.chars() {
        if ch.is_alphanumeric() {
            if pending_space && !out.is_empty() {
                out.push(' ');
            }
            pending_space = false;
            out.extend(ch.to_lowercase());
        } else {
            pending_space = true;
        }
    }
    out
}

/// Length (in chars) of the longest common contiguous run of `a` and `b`.
pub fn longest_common_substring_len(a: &str, b: &str) -> usize {
    let a: Vec<char> = a.chars().collect();
    let b: Vec<char> = b.chars().collect();
    if a.is_empty() || b.is_empty() {
        return 0;
    }

    let mut prev = vec![0usize; b.len() + 1];
    let mut curr = vec![0usize; b.len() + 1];
    let mut best = 0;
    for &ca in &a {
        for (j, &cb) in b.iter().enumerate() {
            curr[j + 1] = if ca == cb { prev[j] + 1 } else { 0 };
            best = best.max(curr[j + 1]);
        }
        std::mem::swap(&mut prev, &mut curr);
    }
    best
}

/// Truncate to at most `max_chars` characters, appending "..." when cut.
pub fn preview(s: &str, max_chars: usize) -> String {
    let mut out: String = s.chars().take(max_chars).collect();
    if s.chars().count() > max_chars {
        out.push_str("...");
    }
    out.replace('\n', " ")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_normalize_text() {
        let input = "  Title\u{00A0}here  \r\n\tbody\t\ttext \r\n\x0Cnext page ";
        assert_eq!(normalize_text(input), "Title here\nbody text\n\x0Cnext page");
        assert_eq!(normalize_text(""), "");
    }

    #[test]
    fn test_estimate_tokens() {
        assert_eq!(estimate_tokens("Hello World"), 2);
        assert_eq!(estimate_tokens("你好世界"), 4);
        assert_eq!(estimate_tokens(""), 1);
    }

    #[test]
    fn test_split_sentences_keeps_decimals_and_quotes() {
        let sentences = split_sentences("Revenue grew 3.5 percent. He said \"stop. now\" and left! Done");
        assert_eq!(
            sentences,
            vec![
                "Revenue grew 3.5 percent.",
                "He said \"stop. now\" and left!",
                "Done",
            ]
        );
    }

    #[test]
    fn test_strip_bullet() {
        assert_eq!(strip_bullet("- first point"), (true, "first point"));
        assert_eq!(strip_bullet("  2) second point "), (true, "second point"));
        assert_eq!(strip_bullet("Summary line."), (false, "Summary line."));
        assert_eq!(strip_bullet("3.5 percent growth"), (false, "3.5 percent growth"));
    }

    #[test]
    fn test_normalize_fragment() {
        assert_eq!(normalize_fragment("  The Q3 Revenue -- rose, sharply!"), "the q3 revenue rose sharply");
        assert_eq!(normalize_fragment("***"), "");
    }

    #[test]
    fn test_longest_common_substring_len() {
        assert_eq!(longest_common_substring_len("abcdef", "zcdez"), 3);
        assert_eq!(longest_common_substring_len("", "abc"), 0);
        assert_eq!(longest_common_substring_len("same text", "same text"), 9);
    }

    #[test]
    fn test_preview() {
        assert_eq!(preview("abc\ndef", 10), "abc def");
        assert_eq!(preview("abcdef", 3), "abc...");
    }
}
