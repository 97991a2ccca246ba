// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Per-execution log capture.
//!
//! A [`LogCapture`] collects the stdout/stderr lines of one execution in
//! arrival order. The buffer never grows past its byte cap: when a write does
//! not fit, the content is cut at a UTF-8 character boundary so that
//! [`TRUNCATION_MARKER`] still fits, the marker is appended and every later
//! write is dropped.

use std::sync::Mutex;

/// Appended once when the cap is hit.
pub const TRUNCATION_MARKER: &str = "\n[voltrun: log output truncated]";

/// Smallest cap that still has room for the full marker.
pub const MIN_LOG_CAP_BYTES: usize = TRUNCATION_MARKER.len();

#[derive(Debug, Default)]
struct CaptureState {
    buf: String,
    truncated: bool,
    dropped_bytes: u64,
}

/// Bounded, append-only log buffer for a single execution.
#[derive(Debug)]
pub struct LogCapture {
    cap_bytes: usize,
    state: Mutex<CaptureState>,
}

impl LogCapture {
    pub fn new(cap_bytes: usize) -> Self {
        Self {
            cap_bytes,
            state: Mutex::new(CaptureState::default()),
        }
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, CaptureState> {
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Append one line (a trailing newline is added).
    pub fn push_line(&self, line: &str) -> bool {
        let mut state = self.lock();
        if !append(&mut state, self.cap_bytes, line) {
            return false;
        }
        append(&mut state, self.cap_bytes, "\n")
    }

    /// Append raw text. Returns `false` if any of it was dropped.
    pub fn push_str(&self, text: &str) -> bool {
        let mut state = self.lock();
        append(&mut state, self.cap_bytes, text)
    }

    pub fn is_truncated(&self) -> bool {
        self.lock().truncated
    }

    /// Bytes discarded after truncation.
    pub fn dropped_bytes(&self) -> u64 {
        self.lock().dropped_bytes
    }

    /// Current contents, including the marker if truncated.
    pub fn snapshot(&self) -> String {
        self.lock().buf.clone()
    }

    pub fn len(&self) -> usize {
        self.lock().buf.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

fn append(state: &mut CaptureState, cap: usize, text: &str) -> bool {
    if state.truncated {
        state.dropped_bytes += text.len() as u64;
        return false;
    }

    if state.buf.len() + text.len() <= cap {
        state.buf.push_str(text);
        return true;
    }

    let keep = cap.saturating_sub(TRUNCATION_MARKER.len());
    if state.buf.len() > keep {
        let cut = floor_char_boundary(&state.buf, keep);
        state.dropped_bytes += (state.buf.len() - cut + text.len()) as u64;
        state.buf.truncate(cut);
    } else {
        let cut = floor_char_boundary(text, keep - state.buf.len());
        state.buf.push_str(&text[..cut]);
        state.dropped_bytes += (text.len() - cut) as u64;
    }
    // Below MIN_LOG_CAP_BYTES only a prefix of the marker fits.
    state.buf.push_str(&TRUNCATION_MARKER[..cap.min(TRUNCATION_MARKER.len())]);
    state.truncated = true;
    false
}

fn floor_char_boundary(s: &str, index: usize) -> usize {
    if index >= s.len() {
        return s.len();
    }
    let mut i = index;
    while !s.is_char_boundary(i) {
        i -= 1;
    }
    i
}
