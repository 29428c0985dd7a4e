//! Stream message reassembly for line-framed JSON-RPC over stdio.
//!
//! A subprocess's stdout arrives as an unstructured byte stream; raw reads may
//! split one message across chunks or deliver several messages at once. This
//! module keeps the splitting logic free of I/O so it can be tested against
//! crafted byte sequences directly.

/// Drain every complete newline-terminated message from `buf`, leaving any
/// partial trailing message in place for the next read to extend.
///
/// Carriage returns are stripped and empty lines skipped.
pub fn drain_messages(buf: &mut Vec<u8>) -> Vec<String> {
    let mut messages = Vec::new();
    let mut start = 0;
    while let Some(pos) = buf[start..].iter().position(|&b| b == b'\n') {
        let end = start + pos;
        let line = &buf[start..end];
        let line = match line.last() {
            Some(b'\r') => &line[..line.len() - 1],
            _ => line,
        };
        if !line.is_empty() {
            messages.push(String::from_utf8_lossy(line).into_owned());
        }
        start = end + 1;
    }
    buf.drain(..start);
    messages
}
