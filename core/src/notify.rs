//! Notification dispatcher collaborator.
//!
//! Dispatch is fire-and-forget: the engine logs and drops any error a
//! notifier returns.

use crate::event::MatchEvent;
use std::sync::Mutex;

pub trait Notifier: Send + Sync {
    fn emit(&self, event: &MatchEvent, recipients: &[String]) -> anyhow::Result<()>;
}

/// Writes every event to the log. Default when no dispatcher is wired.
pub struct LogNotifier;

impl Notifier for LogNotifier {
    fn emit(&self, event: &MatchEvent, recipients: &[String]) -> anyhow::Result<()> {
        log::info!(
            "notify: {} for job {} -> {}",
            event.type_name(),
            event.job_id(),
            recipients.join(",")
        );
        Ok(())
    }
}

/// Keeps emitted events in memory for inspection.
#[derive(Default)]
pub struct RecordingNotifier {
    sent: Mutex<Vec<(MatchEvent, Vec<String>)>>,
}

impl RecordingNotifier {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn sent(&self) -> Vec<(MatchEvent, Vec<String>)> {
        self.sent.lock().unwrap_or_else(|e| e.into_inner()).clone()
    }

    pub fn count(&self, type_name: &str) -> usize {
        self.sent
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .iter()
            .filter(|(e, _)| e.type_name() == type_name)
            .count()
    }
}

impl Notifier for RecordingNotifier {
    fn emit(&self, event: &MatchEvent, recipients: &[String]) -> anyhow::Result<()> {
        self.sent
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .push((event.clone(), recipients.to_vec()));
        Ok(())
    }
}

impl<T: Notifier + ?Sized> Notifier for std::sync::Arc<T> {
    fn emit(&self, event: &MatchEvent, recipients: &[String]) -> anyhow::Result<()> {
        (**self).emit(event, recipients)
    }
}
