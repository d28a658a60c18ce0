//! User interrupt sources
//!
//! Interrupts only matter while a long-running activity is in progress
//! (foreground tunnel, log streaming). Menus are left through their own
//! "Back"/"Exit" entries.

use std::sync::Arc;

use async_trait::async_trait;
use tokio::sync::{watch, Notify};
use tracing::{debug, warn};

#[async_trait]
pub trait Interrupt: Send + Sync {
    /// Resolve on the next interrupt
    async fn wait(&self);
}

/// Ctrl+C from the terminal
///
/// The signal handler is installed once by [`CtrlC::install`] and stays in
/// place for the whole session, so SIGINT never terminates the process while
/// tunnel processes are alive. Only presses that arrive while someone is
/// waiting count; a Ctrl+C typed at a menu is not replayed into the next
/// activity.
#[derive(Debug, Clone)]
pub struct CtrlC {
    presses: Arc<watch::Sender<u64>>,
}

impl CtrlC {
    /// Install the SIGINT listener; must be called inside the runtime
    pub fn install() -> Self {
        let ctrl_c = Self::detached();
        let listener = ctrl_c.clone();
        tokio::spawn(async move {
            loop {
                if let Err(e) = tokio::signal::ctrl_c().await {
                    warn!("Failed to listen for Ctrl+C: {}", e);
                    break;
                }
                debug!("Ctrl+C received");
                listener.press();
            }
        });
        ctrl_c
    }

    /// A source not connected to any signal
    fn detached() -> Self {
        let (presses, _) = watch::channel(0);
        Self {
            presses: Arc::new(presses),
        }
    }

    fn press(&self) {
        self.presses.send_modify(|count| *count += 1);
    }
}

#[async_trait]
impl Interrupt for CtrlC {
    async fn wait(&self) {
        let mut presses = self.presses.subscribe();
        if presses.changed().await.is_err() {
            std::future::pending::<()>().await;
        }
    }
}

/// Interrupt triggered programmatically
///
/// A trigger with nobody waiting is remembered and consumed by the next
/// `wait`.
#[derive(Debug, Clone, Default)]
pub struct NotifyInterrupt {
    notify: Arc<Notify>,
}

impl NotifyInterrupt {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn trigger(&self) {
        self.notify.notify_one();
    }
}

#[async_trait]
impl Interrupt for NotifyInterrupt {
    async fn wait(&self) {
        self.notify.notified().await;
    }
}
