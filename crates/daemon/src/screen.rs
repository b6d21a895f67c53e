// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! Output grooming for the polling coordinator: raw terminal bytes are
//! fed through an avt virtual terminal at the configured width so that
//! control sequences collapse into plain renderable lines, from which a
//! short summary is extracted.

/// Groomer backed by an avt virtual terminal.
pub struct OutputScreen {
    vt: avt::Vt,
    /// Buffer for incomplete UTF-8 trailing bytes between `feed()` calls.
    utf8_buf: [u8; 3],
    utf8_buf_len: u8,
}

impl std::fmt::Debug for OutputScreen {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("OutputScreen").finish()
    }
}

/// Returns the number of trailing bytes that form an incomplete UTF-8 sequence.
///
/// Scans backwards from the end of `data` for a leading byte whose expected
/// sequence length exceeds the bytes available. Returns 0 when the tail is
/// complete (or pure ASCII).
fn incomplete_utf8_tail_len(data: &[u8]) -> usize {
    let len = data.len();
    for i in 1..=len.min(3) {
        let byte = data[len - i];
        if byte < 0x80 {
            return 0;
        }
        if byte >= 0xC0 {
            let expected = if byte < 0xE0 {
                2
            } else if byte < 0xF0 {
                3
            } else {
                4
            };
            return if i < expected { i } else { 0 };
        }
        // Continuation byte — keep scanning backwards.
    }
    0
}

impl OutputScreen {
    pub fn new(cols: u16, rows: u16) -> Self {
        Self {
            vt: avt::Vt::new(cols as usize, rows as usize),
            utf8_buf: [0; 3],
            utf8_buf_len: 0,
        }
    }

    /// Feed raw bytes from the terminal bridge into the virtual terminal.
    pub fn feed(&mut self, data: &[u8]) {
        if data.is_empty() {
            return;
        }

        // Prepend any buffered incomplete UTF-8 bytes from the previous call.
        let buf_len = self.utf8_buf_len as usize;
        let owned: Vec<u8>;
        let input = if buf_len == 0 {
            data
        } else {
            owned = [&self.utf8_buf[..buf_len], data].concat();
            self.utf8_buf_len = 0;
            &owned
        };

        let tail = incomplete_utf8_tail_len(input);
        let (to_feed, to_buffer) = input.split_at(input.len() - tail);

        if !to_buffer.is_empty() {
            self.utf8_buf[..to_buffer.len()].copy_from_slice(to_buffer);
            self.utf8_buf_len = to_buffer.len() as u8;
        }

        if !to_feed.is_empty() {
            let s = String::from_utf8_lossy(to_feed);
            let _ = self.vt.feed_str(&s);
        }
    }

    /// Current view as trimmed plain-text lines.
    pub fn lines(&self) -> Vec<String> {
        self.vt.view().map(|line| line.text().trim_end().to_owned()).collect()
    }

    /// Last non-empty rendered line, or an empty string for a blank screen.
    pub fn last_line(&self) -> String {
        self.lines().into_iter().rev().find(|l| !l.trim().is_empty()).unwrap_or_default()
    }

    /// The trailing `tail` non-empty lines joined by newlines.
    pub fn summary(&self, tail: usize) -> String {
        if tail == 0 {
            return String::new();
        }
        let lines = self.lines();
        let mut picked: Vec<&str> =
            lines.iter().rev().filter(|l| !l.trim().is_empty()).take(tail).map(|s| s.as_str()).collect();
        picked.reverse();
        picked.join("\n")
    }

    pub fn resize(&mut self, cols: u16, rows: u16) {
        let _ = self.vt.resize(cols as usize, rows as usize);
    }
}

#[cfg(test)]
#[path = "screen_tests.rs"]
mod tests;
