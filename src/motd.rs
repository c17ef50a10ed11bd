//! Text helpers for server descriptions and version strings.

use serde_json::Value;

/// Section sign that introduces a legacy formatting code (`§a`, `§l`, ...).
const FORMAT_MARKER: char = '\u{00a7}';

/// Flatten a description into plain text.
///
/// Descriptions come either as a bare string or as a chat component tree
/// (`{"text": .., "extra": [..]}` or an array of components). Formatting codes
/// are stripped from the result.
pub fn plain_text(description: &Value) -> String {
    let mut out = String::new();
    collect_text(description, &mut out);
    strip_formatting(&out).trim().to_string()
}

fn collect_text(node: &Value, out: &mut String) {
    match node {
        Value::Null => {}
        Value::String(s) => out.push_str(s),
        Value::Bool(b) => out.push_str(if *b { "true" } else { "false" }),
        Value::Number(n) => out.push_str(&n.to_string()),
        Value::Array(items) => items.iter().for_each(|item| collect_text(item, out)),
        Value::Object(map) => {
            match (map.get("text"), map.get("translate")) {
                (Some(text), _) => collect_text(text, out),
                (None, Some(Value::String(key))) => out.push_str(key),
                _ => {}
            }
            if let Some(extra) = map.get("extra") {
                collect_text(extra, out);
            }
        }
    }
}

/// Remove `§x` formatting codes.
pub fn strip_formatting(s: &str) -> String {
    let mut out = String::with_capacity(s.len());
    let mut chars = s.chars();
    while let Some(c) = chars.next() {
        if c == FORMAT_MARKER {
            chars.next();
        } else {
            out.push(c);
        }
    }
    out
}

/// Extract a `major.minor[.patch]` version that starts a word in `name`.
pub fn base_version(name: &str) -> Option<&str> {
    let bytes = name.as_bytes();
    (0..bytes.len())
        .filter(|&i| i == 0 || bytes[i - 1].is_ascii_whitespace())
        .find_map(|start| version_at(name, start))
}

fn version_at(name: &str, start: usize) -> Option<&str> {
    let bytes = name.as_bytes();
    let digits = |from: usize| {
        bytes[from..]
            .iter()
            .take_while(|b| b.is_ascii_digit())
            .count()
    };

    let mut end = start + digits(start);
    if end == start {
        return None;
    }
    let mut groups = 1;
    while groups < 3 && end < bytes.len() && bytes[end] == b'.' {
        let n = digits(end + 1);
        if n == 0 {
            break;
        }
        end += 1 + n;
        groups += 1;
    }
    (groups >= 2).then(|| &name[start..end])
}
