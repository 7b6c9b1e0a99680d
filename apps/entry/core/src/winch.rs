/// Terminal dimensions carried by a WINCH request.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct WindowSize {
    pub width: u16,
    pub height: u16,
}

/// Parses a `"<width> <height>"` payload. Anything other than exactly two
/// non-negative integers yields `None`, and the resize is skipped.
///
/// Both values must fit in a `u16`, the width of the runtime's tty resize
/// call; larger dimensions are treated as malformed rather than clamped.
pub fn window_size(payload: &[u8]) -> Option<WindowSize> {
    let text = std::str::from_utf8(payload).ok()?;
    let mut parts = text.split_whitespace();
    let width = parts.next()?.parse().ok()?;
    let height = parts.next()?.parse().ok()?;
    if parts.next().is_some() {
        return None;
    }
    Some(WindowSize { width, height })
}
