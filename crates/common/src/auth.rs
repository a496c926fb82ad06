/// Check an `Authorization` header value against the shared secret.
///
/// Only `Bearer <token>` is accepted. The comparison does not stop at the
/// first differing byte.
pub fn bearer_matches(header: Option<&str>, expected: &str) -> bool {
    let Some(token) = header.and_then(|v| v.strip_prefix("Bearer ")) else {
        return false;
    };
    if expected.is_empty() || token.len() != expected.len() {
        return false;
    }
    token
        .bytes()
        .zip(expected.bytes())
        .fold(0u8, |acc, (a, b)| acc | (a ^ b))
        == 0
}
