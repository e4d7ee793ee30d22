//! Call stack capture for attributing checks to their call site.
//!
//! The capturer is an injected capability: a host runtime that can walk its
//! own managed stack implements [`StackCapturer`] directly, while
//! [`NativeStackCapturer`] covers native callers through `std::backtrace`.

use std::backtrace::{Backtrace, BacktraceStatus};

/// Produces caller-location strings, innermost frame first.
pub trait StackCapturer: Send + Sync {
    /// Returns at most `max_depth` frames, skipping the `start_offset`
    /// innermost ones. Never fails; returns an empty list when the stack
    /// cannot be inspected or holds fewer than `start_offset` frames.
    fn capture(&self, start_offset: usize, max_depth: usize) -> Vec<String>;
}

/// Capturer for environments without stack introspection.
#[derive(Debug, Clone, Copy, Default)]
pub struct NoStackCapturer;

impl StackCapturer for NoStackCapturer {
    fn capture(&self, _start_offset: usize, _max_depth: usize) -> Vec<String> {
        Vec::new()
    }
}

/// Frames supplied up front by the host, e.g. alongside a recorded call.
#[derive(Debug, Clone, Default)]
pub struct FrameListCapturer {
    frames: Vec<String>,
}

impl FrameListCapturer {
    pub fn new(frames: Vec<String>) -> Self {
        Self { frames }
    }
}

impl StackCapturer for FrameListCapturer {
    fn capture(&self, start_offset: usize, max_depth: usize) -> Vec<String> {
        self.frames
            .iter()
            .skip(start_offset)
            .take(max_depth)
            .cloned()
            .collect()
    }
}

/// Captures the native stack of the calling thread.
#[derive(Debug, Clone, Copy, Default)]
pub struct NativeStackCapturer;

impl StackCapturer for NativeStackCapturer {
    fn capture(&self, start_offset: usize, max_depth: usize) -> Vec<String> {
        if max_depth == 0 {
            return Vec::new();
        }
        let backtrace = Backtrace::force_capture();
        if backtrace.status() != BacktraceStatus::Captured {
            return Vec::new();
        }
        parse_backtrace(&backtrace.to_string())
            .into_iter()
            .skip_while(|frame| is_capture_frame(frame))
            .skip(start_offset)
            .take(max_depth)
            .collect()
    }
}

/// Frames belonging to the capture machinery itself.
fn is_capture_frame(frame: &str) -> bool {
    frame.starts_with("std::backtrace")
        || frame.starts_with("<std::backtrace")
        || frame.contains("NativeStackCapturer")
}

/// Turns the `Display` form of a backtrace into `symbol (file:line:col)` lines.
fn parse_backtrace(rendered: &str) -> Vec<String> {
    let mut frames: Vec<String> = Vec::new();
    for line in rendered.lines() {
        let trimmed = line.trim();
        if let Some(location) = trimmed.strip_prefix("at ") {
            if let Some(last) = frames.last_mut() {
                if !last.ends_with(')') {
                    last.push_str(&format!(" ({location})"));
                }
            }
            continue;
        }
        if let Some((index, symbol)) = trimmed.split_once(": ") {
            if !index.is_empty() && index.chars().all(|c| c.is_ascii_digit()) {
                frames.push(symbol.trim().to_string());
            }
        }
    }
    frames
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_native_capture_respects_max_depth() {
        let frames = NativeStackCapturer.capture(0, 5);
        assert!(frames.len() <= 5);
    }

    #[test]
    fn test_native_capture_zero_depth_is_empty() {
        assert!(NativeStackCapturer.capture(0, 0).is_empty());
    }

    #[test]
    fn test_native_capture_past_top_of_stack_is_empty() {
        assert!(NativeStackCapturer.capture(100_000, 5).is_empty());
    }

    #[test]
    fn test_frame_list_offset_and_depth() {
        let capturer = FrameListCapturer::new(
            (0..10).map(|i| format!("frame_{i}")).collect(),
        );
        let frames = capturer.capture(2, 3);
        assert_eq!(frames, vec!["frame_2", "frame_3", "frame_4"]);
        assert!(capturer.capture(10, 3).is_empty());
        assert!(FrameListCapturer::default().capture(0, 5).is_empty());
    }

    #[test]
    fn test_parse_backtrace_joins_locations() {
        let rendered = "   0: app::handler::run\n             at ./src/handler.rs:10:5\n   1: app::main\n   2: std::rt::lang_start\n             at /rustc/library/std/src/rt.rs:1:1\n";
        let frames = parse_backtrace(rendered);
        assert_eq!(
            frames,
            vec![
                "app::handler::run (./src/handler.rs:10:5)",
                "app::main",
                "std::rt::lang_start (/rustc/library/std/src/rt.rs:1:1)",
            ]
        );
    }

    #[test]
    fn test_no_stack_capturer_is_empty() {
        assert!(NoStackCapturer.capture(0, 10).is_empty());
    }
}
