//! # Progress Notifications
//!
//! Human-readable status lines emitted while a run proceeds ("Connecting to
//! database", "Executed migration create-table up", ...).
//!
//! A [`ProgressNotifier`] fans each line out to every subscriber over a
//! broadcast channel. Sending never blocks and never fails the run: with no
//! subscribers the line is only traced, and a lagging subscriber loses the
//! oldest lines.

use once_cell::sync::Lazy;
use tokio::sync::broadcast;

/// Lines buffered per subscriber before the oldest are dropped
const CHANNEL_CAPACITY: usize = 256;

static GLOBAL: Lazy<ProgressNotifier> = Lazy::new(ProgressNotifier::new);

/// One progress line
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Progress {
    pub message: String,
}

/// Broadcast sink for progress lines
#[derive(Debug, Clone)]
pub struct ProgressNotifier {
    sender: broadcast::Sender<Progress>,
    silent: bool,
}

impl ProgressNotifier {
    pub fn new() -> Self {
        let (sender, _) = broadcast::channel(CHANNEL_CAPACITY);
        Self {
            sender,
            silent: false,
        }
    }

    /// Process-wide notifier shared by every caller that does not inject its own
    pub fn global() -> Self {
        GLOBAL.clone()
    }

    /// Same channel, but lines are only traced, never delivered
    pub fn silenced(&self) -> Self {
        Self {
            sender: self.sender.clone(),
            silent: true,
        }
    }

    pub fn is_silent(&self) -> bool {
        self.silent
    }

    pub fn subscribe(&self) -> broadcast::Receiver<Progress> {
        self.sender.subscribe()
    }

    pub fn info(&self, message: impl Into<String>) {
        let message = message.into();
        if self.silent {
            tracing::debug!(progress = %message, "progress (silent)");
            return;
        }

        tracing::info!("{}", message);
        // No receivers is not an error for us
        let _ = self.sender.send(Progress { message });
    }
}

impl Default for ProgressNotifier {
    fn default() -> Self {
        Self::new()
    }
}

/// `"1 migration"`, `"3 migrations"`
pub(crate) fn migrations_count(count: usize) -> String {
    if count == 1 {
        "1 migration".to_string()
    } else {
        format!("{} migrations", count)
    }
}
