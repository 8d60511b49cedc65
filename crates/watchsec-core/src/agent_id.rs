/// Longest agent identifier accepted for storage paths.
pub const MAX_AGENT_ID_LEN: usize = 128;

/// Validate that an agent identifier is safe to use as a directory name.
///
/// Accepts 1..=128 chars of `[A-Za-z0-9._-]`, excluding `.` and `..`.
pub fn validate_agent_id(agent_id: &str) -> bool {
    !agent_id.is_empty()
        && agent_id.len() <= MAX_AGENT_ID_LEN
        && agent_id != "."
        && agent_id != ".."
        && agent_id
            .bytes()
            .all(|b| b.is_ascii_alphanumeric() || matches!(b, b'.' | b'_' | b'-'))
}
