/// Current UTC time as an RFC 3339 string. Empty on formatting failure.
pub fn now_rfc3339() -> String {
    ::time::OffsetDateTime::now_utc()
        .format(&::time::format_description::well_known::Rfc3339)
        .unwrap_or_default()
}

/// Parse an RFC 3339 timestamp produced by [`now_rfc3339`].
pub fn parse_rfc3339(s: &str) -> Option<::time::OffsetDateTime> {
    ::time::OffsetDateTime::parse(s, &::time::format_description::well_known::Rfc3339).ok()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn now_roundtrips_through_parse() {
        let now = now_rfc3339();
        assert!(!now.is_empty());
        assert!(parse_rfc3339(&now).is_some());
    }

    #[test]
    fn garbage_does_not_parse() {
        assert!(parse_rfc3339("yesterday").is_none());
    }
}
