use regex::Regex;
use std::sync::OnceLock;

/// Mask secrets in output strings before they are logged or persisted.
pub fn mask_secrets(text: &str) -> String {
    static PATTERNS: OnceLock<Vec<(Regex, &'static str)>> = OnceLock::new();
    let patterns = PATTERNS.get_or_init(|| {
        [
            // API keys
            (r"sk-[a-zA-Z0-9\-_]{20,}", "[MASKED]"),
            (r"lin_api_[a-zA-Z0-9]{20,}", "[MASKED]"),
            (r"gh[pousr]_[a-zA-Z0-9]{20,}", "[MASKED]"),
            // Bearer tokens
            (r"Bearer\s+[a-zA-Z0-9._\-/]+", "Bearer [MASKED]"),
            // key=value patterns
            (
                r"(?i)(password|secret|token|key|api_key|apikey|pat)=[^\s&]+",
                "$1=[MASKED]",
            ),
        ]
        .into_iter()
        .filter_map(|(p, r)| Regex::new(p).ok().map(|re| (re, r)))
        .collect()
    });

    let mut result = text.to_string();
    for (re, replacement) in patterns {
        result = re.replace_all(&result, *replacement).into_owned();
    }
    result
}

/// Truncate captured process output to `max` bytes on a char boundary,
/// appending `...` when anything was cut.
pub fn truncate_output(text: &str, max: usize) -> String {
    if text.len() <= max {
        return text.to_string();
    }
    let mut end = max;
    while !text.is_char_boundary(end) {
        end -= 1;
    }
    format!("{}...", &text[..end])
}
