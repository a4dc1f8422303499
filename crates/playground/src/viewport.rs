use chatline_core::{Message, ScrollBehavior, SizeSnapshot, Viewport, ViewportMetrics};

const LINE_HEIGHT: f64 = 20.0;
const COLUMNS: usize = 48;

/// Terminal stand-in for a scrollable bubble list: every wrapped line is
/// `LINE_HEIGHT` tall and every message carries a one-line header.
#[derive(Debug, Clone)]
pub struct LineViewport {
    visible_lines: usize,
    content_lines: usize,
    scroll_top: f64,
}

impl LineViewport {
    pub fn new(visible_lines: usize) -> Self {
        Self {
            visible_lines,
            content_lines: 0,
            scroll_top: 0.0,
        }
    }

    /// Re-lays out the transcript and returns the new content size.
    pub fn layout(&mut self, transcript: &[Message]) -> SizeSnapshot {
        self.content_lines = transcript
            .iter()
            .map(|message| 1 + wrapped_lines(&message.content))
            .sum();
        self.clamp();
        SizeSnapshot::new(self.content_height(), COLUMNS as f64)
    }

    /// User-driven scroll, e.g. a wheel notch.
    pub fn scroll_by(&mut self, delta: f64) {
        self.scroll_top += delta;
        self.clamp();
    }

    fn content_height(&self) -> f64 {
        self.content_lines as f64 * LINE_HEIGHT
    }

    fn client_height(&self) -> f64 {
        self.visible_lines as f64 * LINE_HEIGHT
    }

    fn clamp(&mut self) {
        let max_top = (self.content_height() - self.client_height()).max(0.0);
        self.scroll_top = self.scroll_top.clamp(0.0, max_top);
    }
}

impl Viewport for LineViewport {
    fn metrics(&self) -> ViewportMetrics {
        ViewportMetrics {
            scroll_top: self.scroll_top,
            client_height: self.client_height(),
            scroll_height: self.content_height().max(self.client_height()),
        }
    }

    fn scroll_to(&mut self, top: f64, behavior: ScrollBehavior) {
        tracing::trace!(top, ?behavior, "viewport scroll");
        self.scroll_top = top;
        self.clamp();
    }
}

fn wrapped_lines(content: &str) -> usize {
    content
        .split('\n')
        .map(|line| line.chars().count().div_ceil(COLUMNS).max(1))
        .sum()
}
