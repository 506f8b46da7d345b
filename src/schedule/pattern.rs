//! Parameter-name patterns: either an exact name, or a prefix followed by a
//! trailing `*` that matches any non-empty suffix (`layer.0.*`).

/// Returns whether `pattern` matches the parameter `name`.
pub fn matches(pattern: &str, name: &str) -> bool {
    match pattern.strip_suffix('*') {
        Some(prefix) => name.len() > prefix.len() && name.starts_with(prefix),
        None => pattern == name,
    }
}

/// Resolves `pattern` against `names`, keeping their discovery order.
pub fn resolve<'n>(pattern: &str, names: &'n [String]) -> Vec<&'n str> {
    names
        .iter()
        .map(String::as_str)
        .filter(|name| matches(pattern, name))
        .collect()
}
