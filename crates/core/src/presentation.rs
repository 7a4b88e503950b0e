//! Presentation-side capabilities the controller drives.
//!
//! The controller never renders anything. It asks the presentation layer to
//! show an error or move the message viewport through these traits.

/// User-visible notifications (toasts, banners, stderr lines).
pub trait Notifier: Send + Sync {
    fn notify_error(&self, message: &str);
}

/// Scroll geometry of the message list at one instant.
#[derive(Debug, Clone, Copy, PartialEq, Default)]
pub struct ScrollMetrics {
    /// Distance scrolled from the top
    pub offset: f64,
    /// Height of the visible area
    pub viewport_height: f64,
    /// Height of all rendered content
    pub content_height: f64,
}

impl ScrollMetrics {
    pub fn new(offset: f64, viewport_height: f64, content_height: f64) -> Self {
        Self {
            offset,
            viewport_height,
            content_height,
        }
    }

    /// Whether the bottom edge is within `threshold` of the end of content.
    pub fn at_bottom(&self, threshold: f64) -> bool {
        self.offset + self.viewport_height >= self.content_height - threshold
    }
}

/// The scrollable message list.
pub trait Viewport: Send + Sync {
    fn scroll_to_bottom(&self);

    /// Bring the message with the given anchor id into view.
    fn scroll_to_anchor(&self, anchor: &str);
}
