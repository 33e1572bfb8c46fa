use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio::sync::broadcast;

use crate::model::{BookingId, DepartmentId};

const CHANNEL_CAPACITY: usize = 256;

/// Audience of a notice.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum NoticeScope {
    Global,
    Department(DepartmentId),
}

/// An announcement produced by a timetable change.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Notice {
    pub title: String,
    pub body: String,
    pub scope: NoticeScope,
    pub booking_id: Option<BookingId>,
}

#[derive(Debug, Error)]
#[error("notice delivery failed: {0}")]
pub struct NoticeError(pub String);

/// Receives notices. Delivery is best-effort: callers log failures and move on.
pub trait NoticeSink: Send + Sync {
    fn emit(&self, notice: Notice) -> Result<(), NoticeError>;
}

/// Broadcast hub with one channel per audience.
pub struct NoticeHub {
    channels: DashMap<NoticeScope, broadcast::Sender<Notice>>,
}

impl Default for NoticeHub {
    fn default() -> Self {
        Self::new()
    }
}

impl NoticeHub {
    pub fn new() -> Self {
        Self {
            channels: DashMap::new(),
        }
    }

    /// Subscribe to notices for an audience. Creates the channel if needed.
    pub fn subscribe(&self, scope: NoticeScope) -> broadcast::Receiver<Notice> {
        let sender = self
            .channels
            .entry(scope)
            .or_insert_with(|| broadcast::channel(CHANNEL_CAPACITY).0);
        sender.subscribe()
    }

    /// Drop an audience's channel, e.g. when a department is removed.
    pub fn remove(&self, scope: &NoticeScope) {
        self.channels.remove(scope);
    }
}

impl NoticeSink for NoticeHub {
    /// No-op if nobody is listening.
    fn emit(&self, notice: Notice) -> Result<(), NoticeError> {
        if let Some(sender) = self.channels.get(&notice.scope) {
            let _ = sender.send(notice);
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use ulid::Ulid;

    fn notice(scope: NoticeScope) -> Notice {
        Notice {
            title: "Lecture moved".into(),
            body: "Calculus moves to R102".into(),
            scope,
            booking_id: None,
        }
    }

    #[tokio::test]
    async fn subscribe_and_receive() {
        let hub = NoticeHub::new();
        let dept = NoticeScope::Department(Ulid::new());
        let mut rx = hub.subscribe(dept);

        hub.emit(notice(dept)).unwrap();

        assert_eq!(rx.recv().await.unwrap(), notice(dept));
    }

    #[tokio::test]
    async fn audiences_are_isolated() {
        let hub = NoticeHub::new();
        let dept = NoticeScope::Department(Ulid::new());
        let mut global = hub.subscribe(NoticeScope::Global);
        let _dept_rx = hub.subscribe(dept);

        hub.emit(notice(dept)).unwrap();

        assert!(matches!(
            global.try_recv(),
            Err(broadcast::error::TryRecvError::Empty)
        ));
    }

    #[test]
    fn emit_without_subscribers_is_noop() {
        let hub = NoticeHub::new();
        assert!(hub.emit(notice(NoticeScope::Global)).is_ok());
        hub.remove(&NoticeScope::Global);
    }
}
