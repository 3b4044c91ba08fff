//! `Accept` header negotiation against a rule's content type.

/// Strips parameters (`; charset=...`) and surrounding whitespace.
fn essence(media_type: &str) -> &str {
    media_type.split(';').next().unwrap_or("").trim()
}

/// Whether a single accept candidate matches a concrete media type.
/// Either half of the candidate may be `*`, so `*/*`, `text/*` and `*/html`
/// are all valid patterns.
pub fn matches(candidate: &str, media_type: &str) -> bool {
    let candidate = essence(candidate);
    let media_type = essence(media_type);
    if candidate == "*" || candidate == "*/*" {
        return true;
    }

    let (want_type, want_sub) = candidate.split_once('/').unwrap_or((candidate, ""));
    let (have_type, have_sub) = media_type.split_once('/').unwrap_or((media_type, ""));

    let part = |want: &str, have: &str| want == "*" || want.eq_ignore_ascii_case(have);
    part(want_type, have_type) && part(want_sub, have_sub)
}

/// Whether any entry of a comma-separated `Accept` list matches `media_type`.
pub fn accepts(accept: &str, media_type: &str) -> bool {
    accept
        .split(',')
        .filter(|candidate| !essence(candidate).is_empty())
        .any(|candidate| matches(candidate, media_type))
}
