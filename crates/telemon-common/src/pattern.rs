/// Matches `value` against a glob `pattern`; `"*"` matches anything.
///
/// # Examples
///
/// ```
/// use telemon_common::pattern::glob_matches;
///
/// assert!(glob_matches("*", "anything"));
/// assert!(glob_matches("redis*", "redis:7.2"));
/// assert!(!glob_matches("redis*", "nginx:1.25"));
/// ```
pub fn glob_matches(pattern: &str, value: &str) -> bool {
    if pattern == "*" {
        return true;
    }
    glob_match::glob_match(pattern, value)
}
