//! Terminal presentation: notifications, viewport and the streaming renderer.

use std::io::Write;

use colloquy_core::event::DomainEvent;
use colloquy_core::presentation::{Notifier, Viewport};
use colloquy_session::ChatSession;
use tokio::task::JoinHandle;
use tokio_stream::StreamExt;
use tokio_stream::wrappers::BroadcastStream;

/// Prints errors to stderr.
pub struct TerminalNotifier;

impl Notifier for TerminalNotifier {
    fn notify_error(&self, message: &str) {
        eprintln!("\n  [Error] {message}");
    }
}

/// A terminal is always at its bottom; following means flushing output.
pub struct TerminalViewport;

impl Viewport for TerminalViewport {
    fn scroll_to_bottom(&self) {
        let _ = std::io::stdout().flush();
    }

    fn scroll_to_anchor(&self, anchor: &str) {
        println!("  ── message {anchor} ──");
    }
}

/// Print streamed deltas of the session as they arrive.
pub fn spawn_renderer(session: &ChatSession) -> JoinHandle<()> {
    let mut events = BroadcastStream::new(session.subscribe());
    tokio::spawn(async move {
        let mut in_reasoning = false;
        while let Some(event) = events.next().await {
            // A lagged receiver skips ahead
            let Ok(event) = event else { continue };
            match event.as_ref() {
                DomainEvent::TurnStarted { .. } => {
                    in_reasoning = false;
                    print!("\n  Assistant > ");
                }
                DomainEvent::ReplyAppended {
                    content, reasoning, ..
                } => {
                    if !reasoning.is_empty() {
                        if !in_reasoning {
                            print!("(thinking) ");
                            in_reasoning = true;
                        }
                        print!("{reasoning}");
                    }
                    if !content.is_empty() {
                        if in_reasoning {
                            print!("\n  Assistant > ");
                            in_reasoning = false;
                        }
                        print!("{content}");
                    }
                    let _ = std::io::stdout().flush();
                }
                DomainEvent::ToolRunning { tool_name, .. } => {
                    eprintln!("\n  [tool] {tool_name}");
                }
                DomainEvent::TurnFinalized { .. } => println!(),
                _ => {}
            }
        }
    })
}
