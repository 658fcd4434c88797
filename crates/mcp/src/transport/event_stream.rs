//! Server-Sent Events framing.
//!
//! Bytes are accumulated as they arrive and split into frames on blank lines (`\n\n` or
//! `\r\n\r\n`).

/// A single parsed SSE frame.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub(crate) struct SseFrame {
    pub event: Option<String>,
    pub data: Option<String>,
    pub id: Option<String>,
    pub retry: Option<u64>,
}

impl SseFrame {
    /// Event type, defaulting to `message` as browsers do.
    pub(crate) fn event_type(&self) -> &str {
        self.event.as_deref().unwrap_or("message")
    }
}

/// Incremental frame splitter.
#[derive(Debug, Default)]
pub(crate) struct EventStreamBuffer {
    buf: Vec<u8>,
}

impl EventStreamBuffer {
    pub(crate) fn new() -> Self {
        Self::default()
    }

    pub(crate) fn push(&mut self, bytes: &[u8]) {
        self.buf.extend_from_slice(bytes);
    }

    /// Pop the next complete frame, skipping comment-only and empty frames.
    pub(crate) fn next_frame(&mut self) -> Option<SseFrame> {
        while let Some(end) = find_frame_end(&self.buf) {
            let separator = find_separator_len(&self.buf[end..]);
            let frame = std::str::from_utf8(&self.buf[..end]).ok().and_then(parse_sse_frame);
            self.buf.drain(..end + separator);
            if frame.is_some() {
                return frame;
            }
        }
        None
    }
}

/// Finds the end of the first SSE frame in the buffer.
fn find_frame_end(buf: &[u8]) -> Option<usize> {
    for i in 0..buf.len() {
        if buf[i..].starts_with(b"\n\n") || buf[i..].starts_with(b"\r\n\r\n") {
            return Some(i);
        }
    }
    None
}

/// Finds the length of the SSE frame separator.
fn find_separator_len(slice: &[u8]) -> usize {
    if slice.starts_with(b"\n\n") {
        2
    } else if slice.starts_with(b"\r\n\r\n") {
        4
    } else {
        0
    }
}

/// Parses a string slice into an `SseFrame`.
fn parse_sse_frame(frame_text: &str) -> Option<SseFrame> {
    let mut data_lines = Vec::new();
    let mut frame = SseFrame::default();

    for line in frame_text.lines() {
        if line.starts_with(':') {
            continue; // comment
        }
        if let Some(rest) = line.strip_prefix("data:") {
            data_lines.push(rest.strip_prefix(' ').unwrap_or(rest));
        } else if line == "data" {
            data_lines.push("");
        } else if let Some(rest) = line.strip_prefix("id:") {
            frame.id = Some(rest.trim().to_string());
        } else if let Some(rest) = line.strip_prefix("event:") {
            frame.event = Some(rest.trim().to_string());
        } else if let Some(rest) = line.strip_prefix("retry:") {
            frame.retry = rest.trim().parse().ok();
        }
    }

    if !data_lines.is_empty() {
        frame.data = Some(data_lines.join("\n"));
    }

    if frame == SseFrame::default() { None } else { Some(frame) }
}
