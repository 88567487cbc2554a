//! Encoding of constituent indices into merged field aliases.
//!
//! When several requests are merged into one document, every top-level field
//! of constituent `i` is aliased as `_{i}_{name}` so that the keys of the
//! combined response can be parsed back to `(index, original name)` without
//! any side table. The same convention namespaces variable and fragment names
//! so constituents cannot collide.
//!
//! The convention is versioned: [`decode`] only accepts what [`encode`]
//! produces for the current [`VERSION`], and rejects everything else. The
//! leading underscore keeps the alias a valid GraphQL name even though the
//! index follows it.

/// Version of the alias encoding convention.
///
/// Bump this when the wire shape of [`encode`] changes so that mixed
/// deployments fail loudly instead of misattributing response keys.
pub const VERSION: u32 = 1;

/// Encode a constituent index and an original name into a merged alias.
pub fn encode(index: usize, name: &str) -> String {
    format!("_{index}_{name}")
}

/// Decode a merged alias back into `(index, original name)`.
///
/// Returns `None` for keys that were not produced by [`encode`].
pub fn decode(alias: &str) -> Option<(usize, &str)> {
    let rest = alias.strip_prefix('_')?;
    let digits_end = rest.find(|c: char| !c.is_ascii_digit())?;
    if digits_end == 0 || !rest[digits_end..].starts_with('_') {
        return None;
    }
    let index = rest[..digits_end].parse().ok()?;
    let name = &rest[digits_end + 1..];
    if name.is_empty() {
        return None;
    }
    Some((index, name))
}
