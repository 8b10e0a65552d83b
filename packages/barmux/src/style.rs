use std::fmt::Write as _;
use std::sync::{Mutex, PoisonError};
use std::time::Instant;

use crate::ansi;
use crate::config::Tick;
use crate::eta::Estimater;

/// Everything a renderer may draw from for one frame.
pub struct Frame<'a> {
    pub message: &'a str,
    pub done: u64,
    /// Zero when the bar is unbounded.
    pub total: u64,
    /// Redraw cycle index, for animation.
    pub tick: Tick,
    /// When the current run started.
    pub started: Instant,
    /// Column budget for the whole line.
    pub width: usize,
}

/// Builds the text of one indicator line per redraw cycle.
///
/// Implementations must be pure and non-blocking: the render worker calls
/// them between sleeps, and anything slow here delays every bar sharing
/// that worker.
pub trait FrameRender: Send + Sync {
    /// Append one in-progress frame, no trailing newline, at most
    /// `frame.width` visible columns.
    fn render_frame(&self, out: &mut String, frame: &Frame<'_>);

    /// Append the final frame, written once after completion or reset.
    /// `frame.message` is the completion message. Defaults to writing the
    /// message truncated to the budget.
    fn render_done(&self, out: &mut String, frame: &Frame<'_>) {
        push_truncated(out, frame.message, frame.width);
    }
}

fn push_truncated(out: &mut String, text: &str, mut width: usize) {
    for (c, w) in ansi::with_width(text.chars()) {
        if w > width {
            break;
        }
        width -= w;
        out.push(c);
    }
}

const SPINNER: [char; 6] = [
    '\u{280b}', '\u{2819}', '\u{2838}', '\u{2834}', '\u{2826}', '\u{2807}',
];

/// The built-in renderer: spinner glyph, `[done/total]` prefix, message,
/// percentage and ETA, truncated right-to-left as the column budget runs
/// out. The exact layout is not part of the crate's contract.
pub struct TextBar {
    show_percentage: bool,
    show_eta: bool,
    eta: Mutex<Option<Estimater>>,
}

impl TextBar {
    pub fn new() -> Self {
        Self {
            show_percentage: true,
            show_eta: true,
            eta: Mutex::new(None),
        }
    }

    /// Show the percentage field. Only effective for bounded bars.
    /// Default is `true`.
    pub fn percentage(mut self, show: bool) -> Self {
        self.show_percentage = show;
        self
    }

    /// Show the ETA field. Only effective for bounded bars.
    /// Default is `true`.
    pub fn eta(mut self, show: bool) -> Self {
        self.show_eta = show;
        self
    }

    fn remaining_secs(&self, frame: &Frame<'_>) -> Option<f32> {
        let mut guard = self.eta.lock().unwrap_or_else(PoisonError::into_inner);
        // a new run gets a new estimator
        let stale = guard.as_ref().is_none_or(|e| e.start() != frame.started);
        if stale {
            *guard = Some(Estimater::new(frame.started));
        }
        let est = guard.as_mut()?;
        est.update(
            Instant::now(),
            frame.done.min(frame.total),
            frame.total,
            frame.tick,
        )
    }
}

impl Default for TextBar {
    fn default() -> Self {
        Self::new()
    }
}

impl FrameRender for TextBar {
    fn render_frame(&self, out: &mut String, frame: &Frame<'_>) {
        let mut width = frame.width;
        // not enough width
        if width == 0 {
            return;
        }
        if width <= 3 {
            for _ in 0..width {
                out.push('.');
            }
            return;
        }
        let bounded = frame.total > 0;
        let done = if bounded {
            frame.done.min(frame.total)
        } else {
            frame.done
        };

        out.push(SPINNER[frame.tick as usize % SPINNER.len()]);
        out.push(' ');
        width -= 2;

        let mut temp = String::new();
        if bounded {
            // .len() is fine: digits, '/' and brackets are one column each
            let _ = write!(temp, "[{done}/{}] ", frame.total);
            if temp.len() <= width {
                width -= temp.len();
                out.push_str(&temp);
            }
        }

        push_truncated(out, frame.message, width);
        let mut width = width.saturating_sub(ansi::visible_width(frame.message));

        if bounded && self.show_percentage {
            temp.clear();
            if done == frame.total {
                temp.push_str(" 100%");
            } else {
                let percentage = done as f32 * 100f32 / frame.total as f32;
                let _ = write!(temp, " {percentage:.2}%");
            }
            if temp.len() <= width {
                width -= temp.len();
                out.push_str(&temp);
            }
        }

        if bounded
            && self.show_eta
            && let Some(remaining) = self.remaining_secs(frame)
        {
            temp.clear();
            let _ = write!(temp, " ETA {remaining:.2}s");
            if temp.len() <= width {
                out.push_str(&temp);
            }
        }
    }

    fn render_done(&self, out: &mut String, frame: &Frame<'_>) {
        push_truncated(out, frame.message, frame.width);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    fn frame<'a>(message: &'a str, done: u64, total: u64, width: usize) -> Frame<'a> {
        Frame {
            message,
            done,
            total,
            tick: 0,
            started: Instant::now(),
            width,
        }
    }

    #[test]
    fn bounded_frame_shows_counts_and_percentage() {
        let style = TextBar::new().eta(false);
        let mut out = String::new();
        style.render_frame(&mut out, &frame("building", 3, 10, 80));
        assert!(out.contains("[3/10]"), "{out:?}");
        assert!(out.contains("building"), "{out:?}");
        assert!(out.contains("30.00%"), "{out:?}");
    }

    #[test]
    fn unbounded_frame_is_spinner_and_message_only() {
        let style = TextBar::new();
        let mut out = String::new();
        style.render_frame(&mut out, &frame("scanning", 42, 0, 80));
        assert!(out.contains("scanning"), "{out:?}");
        assert!(!out.contains('['), "{out:?}");
        assert!(!out.contains('%'), "{out:?}");
    }

    #[test]
    fn narrow_widths_degrade_to_dots() {
        let style = TextBar::new();
        for width in 0..=3 {
            let mut out = String::new();
            style.render_frame(&mut out, &frame("anything", 1, 2, width));
            assert_eq!(out.len(), width, "width {width}");
            assert!(out.chars().all(|c| c == '.'));
        }
    }

    #[test]
    fn frame_never_exceeds_the_column_budget() {
        let style = TextBar::new();
        let wide = "一二三四五六七八九十".repeat(4);
        for width in [5, 12, 30, 80] {
            let mut out = String::new();
            style.render_frame(&mut out, &frame(&wide, 7, 9, width));
            assert!(
                ansi::visible_width(&out) <= width,
                "width {width}: {out:?}"
            );
        }
    }

    #[test]
    fn spinner_advances_with_the_tick() {
        let style = TextBar::new();
        let mut a = String::new();
        let mut b = String::new();
        let started = Instant::now() - Duration::from_secs(1);
        let mut f = frame("work", 1, 0, 80);
        f.started = started;
        style.render_frame(&mut a, &f);
        f.tick = 1;
        style.render_frame(&mut b, &f);
        assert_ne!(a.chars().next(), b.chars().next());
    }
}
