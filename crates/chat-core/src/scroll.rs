use serde::{Deserialize, Serialize};

use crate::settings::ScrollSettings;

/// How a programmatic scroll should move the viewport.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ScrollBehavior {
    #[default]
    Instant,
    Smooth,
}

/// Observed content size, compared across resize notifications.
#[derive(Debug, Clone, Copy, PartialEq, Default)]
pub struct SizeSnapshot {
    pub height: f64,
    pub width: f64,
}

impl SizeSnapshot {
    pub const fn new(height: f64, width: f64) -> Self {
        Self { height, width }
    }

    fn differs_from(&self, other: &SizeSnapshot, threshold: f64) -> bool {
        (self.height - other.height).abs() > threshold
            || (self.width - other.width).abs() > threshold
    }
}

/// Scroll position as reported by the host viewport.
#[derive(Debug, Clone, Copy, PartialEq, Default)]
pub struct ViewportMetrics {
    pub scroll_top: f64,
    pub client_height: f64,
    pub scroll_height: f64,
}

/// Host-side scrollable region the controller drives.
pub trait Viewport {
    fn metrics(&self) -> ViewportMetrics;
    fn scroll_to(&mut self, top: f64, behavior: ScrollBehavior);
}

/// Geometry and gesture notifications delivered by the host.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum ViewportSignal {
    Resized(SizeSnapshot),
    Wheel,
    TouchStart,
    TouchMove,
    TouchEnd,
    /// One rendering frame elapsed; pending follow scrolls run here.
    Frame,
}

/// Keeps a viewport pinned to its bottom edge while content streams in,
/// unless the user has scrolled away.
///
/// Gesture intent wins over geometry: once paused, growth never scrolls until
/// the user returns to the bottom by wheel or lifts a finger there.
pub struct FollowScroll<V> {
    viewport: V,
    settings: ScrollSettings,
    paused: bool,
    last_size: SizeSnapshot,
    pending_scroll_to_bottom: bool,
}

impl<V: Viewport> FollowScroll<V> {
    pub fn new(viewport: V, settings: ScrollSettings) -> Self {
        Self {
            viewport,
            settings,
            paused: false,
            last_size: SizeSnapshot::default(),
            pending_scroll_to_bottom: false,
        }
    }

    pub fn viewport(&self) -> &V {
        &self.viewport
    }

    pub fn viewport_mut(&mut self) -> &mut V {
        &mut self.viewport
    }

    pub fn is_paused(&self) -> bool {
        self.paused
    }

    pub fn has_pending_scroll(&self) -> bool {
        self.pending_scroll_to_bottom
    }

    pub fn last_size(&self) -> SizeSnapshot {
        self.last_size
    }

    /// Routes one host notification. Returns true when the viewport was scrolled.
    pub fn handle(&mut self, signal: ViewportSignal) -> bool {
        match signal {
            ViewportSignal::Resized(size) => {
                self.on_resize(size);
                false
            }
            ViewportSignal::Wheel => {
                self.on_wheel();
                false
            }
            ViewportSignal::TouchStart => {
                self.on_touch_start();
                false
            }
            ViewportSignal::TouchMove => {
                self.on_touch_move();
                false
            }
            ViewportSignal::TouchEnd => self.on_touch_end(),
            ViewportSignal::Frame => self.on_frame(),
        }
    }

    /// Records a content-size change and requests a follow scroll when it is
    /// larger than the noise threshold.
    pub fn on_resize(&mut self, size: SizeSnapshot) {
        if !size.differs_from(&self.last_size, self.settings.threshold) {
            return;
        }

        self.last_size = size;
        if self.paused {
            tracing::trace!(height = size.height, "content grew while paused; not following");
            return;
        }
        self.pending_scroll_to_bottom = true;
    }

    /// Runs the coalesced follow scroll, if any, for this frame.
    pub fn on_frame(&mut self) -> bool {
        if !std::mem::take(&mut self.pending_scroll_to_bottom) || self.paused {
            return false;
        }

        self.scroll_to_bottom(self.settings.follow_behavior);
        true
    }

    pub fn on_wheel(&mut self) {
        self.paused = !self.at_bottom();
    }

    pub fn on_touch_start(&mut self) {
        self.paused = true;
    }

    pub fn on_touch_move(&mut self) {
        self.paused = true;
    }

    /// Resumes following when the finger is lifted at the bottom edge.
    pub fn on_touch_end(&mut self) -> bool {
        if !self.at_bottom() {
            self.paused = true;
            return false;
        }

        self.paused = false;
        self.pending_scroll_to_bottom = false;
        self.scroll_to_bottom(ScrollBehavior::Instant);
        true
    }

    /// Forgets recorded geometry and resumes following from a fresh transcript.
    pub fn reset(&mut self) {
        self.last_size = SizeSnapshot::default();
        self.paused = false;
        self.pending_scroll_to_bottom = true;
    }

    pub fn at_bottom(&self) -> bool {
        let metrics = self.viewport.metrics();
        (metrics.scroll_top + metrics.client_height - metrics.scroll_height).abs()
            < self.settings.threshold
    }

    fn scroll_to_bottom(&mut self, behavior: ScrollBehavior) {
        let top = self.viewport.metrics().scroll_height;
        self.viewport.scroll_to(top, behavior);
    }
}
