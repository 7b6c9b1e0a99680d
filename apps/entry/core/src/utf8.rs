/// Length of the longest prefix of `data` that does not end inside a
/// multi-byte UTF-8 sequence.
///
/// The last byte able to start a sequence is located by scanning backwards. If
/// everything from it to the end is valid UTF-8 the whole buffer is safe,
/// otherwise the prefix stops right before it so the partial character can be
/// completed by a later read. Returns `None` when no start byte exists at all,
/// which callers treat as undecodable input.
pub fn safe_prefix_len(data: &[u8]) -> Option<usize> {
    let start = data.iter().rposition(|&byte| is_sequence_start(byte))?;
    if std::str::from_utf8(&data[start..]).is_ok() {
        Some(data.len())
    } else {
        Some(start)
    }
}

fn is_sequence_start(byte: u8) -> bool {
    byte & 0xC0 != 0x80
}
