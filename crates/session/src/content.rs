//! Splitting inline `<think>` reasoning out of model output.

const THINK_OPEN: &str = "<think>";
const THINK_CLOSE: &str = "</think>";

/// Split content into (normal text, inline reasoning).
///
/// An unterminated `<think>` block runs to the end of the content.
fn split(content: &str) -> (String, String) {
    let mut normal = String::new();
    let mut reasoning = String::new();
    let mut rest = content;

    while let Some(start) = rest.find(THINK_OPEN) {
        normal.push_str(&rest[..start]);
        let after = &rest[start + THINK_OPEN.len()..];
        match after.find(THINK_CLOSE) {
            Some(end) => {
                reasoning.push_str(&after[..end]);
                rest = &after[end + THINK_CLOSE.len()..];
            }
            None => {
                reasoning.push_str(after);
                rest = "";
            }
        }
    }
    normal.push_str(rest);
    (normal, reasoning)
}

/// The reply as shown to the user, with reasoning blocks removed.
pub fn normal_content(content: &str) -> String {
    if !content.contains(THINK_OPEN) {
        return content.to_string();
    }
    split(content).0.trim_start().to_string()
}

/// Reasoning to persist: the separate channel when it has text, else any
/// inline `<think>` blocks.
pub fn reasoning_content(content: &str, reasoning: Option<&str>) -> Option<String> {
    if let Some(r) = reasoning.filter(|r| !r.trim().is_empty()) {
        return Some(r.to_string());
    }
    let (_, inline) = split(content);
    let inline = inline.trim();
    (!inline.is_empty()).then(|| inline.to_string())
}
