use regex::Regex;
use std::sync::OnceLock;

/// Longest slug kept in a generated branch name.
pub const MAX_SLUG_LEN: usize = 40;

/// Lowercase `text`, collapse every non-alphanumeric run into one `-`, trim
/// separators from both ends and cap the result at `max` bytes. The result
/// never starts or ends with `-` and may be empty.
pub fn slugify(text: &str, max: usize) -> String {
    static NON_ALNUM: OnceLock<Option<Regex>> = OnceLock::new();
    let lower = text.to_lowercase();
    let replaced = match NON_ALNUM.get_or_init(|| Regex::new("[^a-z0-9]+").ok()) {
        Some(re) => re.replace_all(&lower, "-").into_owned(),
        None => lower
            .chars()
            .map(|c| if c.is_ascii_alphanumeric() { c } else { '-' })
            .collect(),
    };
    let slug = replaced.trim_matches('-');
    // Only ASCII remains, so any byte index is a char boundary.
    let capped = if slug.len() > max { &slug[..max] } else { slug };
    capped.trim_end_matches('-').to_string()
}

/// `{prefix}-{slug(title)}`, falling back to `{prefix}-{id}` when the title
/// has nothing sluggable.
pub fn slug_branch(prefix: &str, title: &str, id: &str) -> String {
    let slug = slugify(title, MAX_SLUG_LEN);
    if slug.is_empty() {
        format!("{prefix}-{id}")
    } else {
        format!("{prefix}-{slug}")
    }
}
