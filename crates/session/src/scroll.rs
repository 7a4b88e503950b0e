//! Scroll-follow: keep the view pinned to the newest content while it
//! streams in, unless the user has scrolled away from the bottom.
//!
//! `ScrollFollow` is the pure state machine. `ScrollController` wires it to a
//! `Viewport` through two coalescers, one for raw scroll events and one for
//! the auto-scroll-to-bottom action.

use std::sync::{Arc, Mutex};

use colloquy_config::ScrollConfig;
use colloquy_core::presentation::{ScrollMetrics, Viewport};
use tracing::trace;

use crate::coalesce::{Action, CoalescePolicy, Coalescer};
use futures::future::BoxFuture;

/// Effect of one observed scroll position.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ScrollChange {
    /// Scrolled down and reached the bottom: follow mode resumes
    Resumed,
    /// Scrolled up: follow mode is suspended
    Suspended,
    Unchanged,
}

#[derive(Debug, Clone)]
pub struct ScrollFollow {
    bottom_threshold: f64,
    last_offset: f64,
    scrolling_away: bool,
}

impl ScrollFollow {
    pub fn new(bottom_threshold: f64) -> Self {
        Self {
            bottom_threshold,
            last_offset: 0.0,
            scrolling_away: false,
        }
    }

    /// Apply a scroll position. The last offset is always updated.
    pub fn observe(&mut self, metrics: ScrollMetrics) -> ScrollChange {
        let change = if metrics.offset > self.last_offset {
            if metrics.at_bottom(self.bottom_threshold) && self.scrolling_away {
                self.scrolling_away = false;
                ScrollChange::Resumed
            } else {
                ScrollChange::Unchanged
            }
        } else if metrics.offset < self.last_offset {
            self.scrolling_away = true;
            ScrollChange::Suspended
        } else {
            ScrollChange::Unchanged
        };
        self.last_offset = metrics.offset;
        change
    }

    /// Whether new content should pull the view to the bottom.
    pub fn should_follow(&self) -> bool {
        !self.scrolling_away
    }

    pub fn is_scrolling_away(&self) -> bool {
        self.scrolling_away
    }

    pub fn last_offset(&self) -> f64 {
        self.last_offset
    }

    /// View teardown: the next view starts in follow mode.
    pub fn reset(&mut self) {
        self.scrolling_away = false;
    }
}

struct Shared {
    follow: Mutex<ScrollFollow>,
    latest: Mutex<Option<ScrollMetrics>>,
}

impl Shared {
    fn follow(&self) -> std::sync::MutexGuard<'_, ScrollFollow> {
        self.follow.lock().unwrap_or_else(|e| e.into_inner())
    }
}

pub struct ScrollController {
    shared: Arc<Shared>,
    scroll_events: Coalescer,
    auto_scroll: Arc<Coalescer>,
}

impl ScrollController {
    pub fn new(config: &ScrollConfig, viewport: Arc<dyn Viewport>) -> Self {
        let shared = Arc::new(Shared {
            follow: Mutex::new(ScrollFollow::new(config.bottom_threshold)),
            latest: Mutex::new(None),
        });

        let auto_scroll = {
            let shared = Arc::clone(&shared);
            let action: Action = Arc::new(move || -> BoxFuture<'static, ()> {
                let shared = Arc::clone(&shared);
                let viewport = Arc::clone(&viewport);
                Box::pin(async move {
                    if shared.follow().should_follow() {
                        viewport.scroll_to_bottom();
                    }
                })
            });
            Arc::new(Coalescer::new(
                "auto_scroll",
                CoalescePolicy::new(config.follow_wait()).with_max_wait(config.follow_max_wait()),
                action,
            ))
        };

        let scroll_events = {
            let shared = Arc::clone(&shared);
            let auto_scroll = Arc::clone(&auto_scroll);
            let action: Action = Arc::new(move || -> BoxFuture<'static, ()> {
                let shared = Arc::clone(&shared);
                let auto_scroll = Arc::clone(&auto_scroll);
                Box::pin(async move {
                    let Some(metrics) = *shared.latest.lock().unwrap_or_else(|e| e.into_inner())
                    else {
                        return;
                    };
                    let change = shared.follow().observe(metrics);
                    trace!(offset = metrics.offset, ?change, "Scroll observed");
                    if change == ScrollChange::Suspended {
                        auto_scroll.cancel();
                    }
                })
            });
            Coalescer::new(
                "scroll_events",
                CoalescePolicy::new(config.scroll_wait()).with_max_wait(config.scroll_max_wait()),
                action,
            )
        };

        Self {
            shared,
            scroll_events,
            auto_scroll,
        }
    }

    /// A raw scroll event from the message viewport.
    pub fn on_scroll(&self, metrics: ScrollMetrics) {
        *self.shared.latest.lock().unwrap_or_else(|e| e.into_inner()) = Some(metrics);
        self.scroll_events.trigger();
    }

    /// New content arrived or the message list loaded. Returns whether an
    /// auto-scroll was requested.
    pub fn content_arrived(&self) -> bool {
        if !self.shared.follow().should_follow() {
            return false;
        }
        self.auto_scroll.trigger();
        true
    }

    /// Tear down the current view.
    pub fn reset(&self) {
        self.shared.follow().reset();
        self.auto_scroll.cancel();
    }

    pub fn is_scrolling_away(&self) -> bool {
        self.shared.follow().is_scrolling_away()
    }
}
