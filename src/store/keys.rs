/// Canonical backend spelling of `key`
///
/// Leading separators are dropped, internal ones are kept as-is:
/// `"/a/b"`, `"//a/b"` and `"a/b"` all map to `"a/b"`. Idempotent.
pub fn normalize(key: &str) -> &str {
    key.trim_start_matches('/')
}
