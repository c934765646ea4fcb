/// Header names whose values carry credentials and must never be
/// written verbatim into the attempt log.
const AUTH_LIKE_HEADERS: &[&str] = &[
    "authorization",
    "proxy-authorization",
    "x-api-key",
    "x-goog-api-key",
    "api-key",
];

/// Headers masked in cURL replay output. `authorization` is deliberately
/// absent so operators can replay captured requests.
const CURL_MASKED_HEADERS: &[&str] = &["cookie", "x-management-key"];

/// Masks an API key for display, keeping the first 4 and last 4 characters.
pub fn hide_api_key(key: &str) -> String {
    let chars = key.chars().count();
    if chars <= 8 {
        return "*".repeat(chars);
    }
    format!(
        "{}...{}",
        crate::str_utils::prefix_chars(key, 4),
        crate::str_utils::suffix_chars(key, 4)
    )
}

/// Returns the value to log for a header: credential-bearing headers get a
/// partially-visible fingerprint, everything else passes through.
pub fn mask_sensitive_header_value(name: &str, value: &str) -> String {
    let lower = name.to_ascii_lowercase();
    if !AUTH_LIKE_HEADERS.contains(&lower.as_str()) && !lower.contains("token") {
        return value.to_string();
    }

    // Keep the scheme visible ("Bearer sk-1...abcd") so log readers can
    // still tell which kind of credential was sent.
    match value.split_once(' ') {
        Some((scheme, rest)) => format!("{} {}", scheme, hide_api_key(rest)),
        None => hide_api_key(value),
    }
}

/// True if the header must be masked even in cURL replay output.
pub fn is_curl_masked_header(name: &str) -> bool {
    let lower = name.to_ascii_lowercase();
    CURL_MASKED_HEADERS.contains(&lower.as_str())
}
