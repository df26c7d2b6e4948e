use async_trait::async_trait;
use tracing::info;

// -------------------- Notification Sink --------------------
// Fire-and-forget. The real transport (Telegram webhook) lives outside the
// engine; strategies only ever see this interface and never wait on or react
// to delivery failures.

#[async_trait]
pub trait Notifier: Send + Sync {
    async fn notify(&self, html: &str);
}

/// Default sink: mirrors notifications into the process log.
#[derive(Debug, Default)]
pub struct LogNotifier;

#[async_trait]
impl Notifier for LogNotifier {
    async fn notify(&self, html: &str) {
        info!(target: "notify", "{html}");
    }
}

/// Sink that drops everything; used when notifications are disabled.
#[derive(Debug, Default)]
pub struct NullNotifier;

#[async_trait]
impl Notifier for NullNotifier {
    async fn notify(&self, _html: &str) {}
}

#[cfg(test)]
pub mod test_support {
    use super::*;
    use parking_lot::Mutex;

    /// Captures messages for assertions.
    #[derive(Debug, Default)]
    pub struct RecordingNotifier {
        pub messages: Mutex<Vec<String>>,
    }

    #[async_trait]
    impl Notifier for RecordingNotifier {
        async fn notify(&self, html: &str) {
            self.messages.lock().push(html.to_string());
        }
    }
}
