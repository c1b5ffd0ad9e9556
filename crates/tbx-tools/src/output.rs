// SPDX-License-Identifier: MIT OR Apache-2.0
//! Output capping for captured command streams.

/// Cap `bytes` to at most `max` content bytes plus a truncation marker.
///
/// When over the cap, keeps 60% from the head and 30% from the tail with a
/// marker naming the omitted byte count in between. Returns the rendered
/// string and whether truncation happened.
#[must_use]
pub fn cap_output(bytes: &[u8], max: usize) -> (String, bool) {
    if bytes.len() <= max {
        return (String::from_utf8_lossy(bytes).into_owned(), false);
    }

    let head_len = max * 6 / 10;
    let tail_len = max * 3 / 10;
    let omitted = bytes.len() - head_len - tail_len;

    let head = String::from_utf8_lossy(&bytes[..head_len]);
    let tail = String::from_utf8_lossy(&bytes[bytes.len() - tail_len..]);
    (
        format!("{head}\n[... {omitted} bytes truncated ...]\n{tail}"),
        true,
    )
}
