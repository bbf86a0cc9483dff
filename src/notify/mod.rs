// Outbound notifications: per-user messages and admin alerts
use chrono::{DateTime, Utc};
use std::collections::VecDeque;
use std::sync::{Arc, Mutex};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;

use crate::models::UserId;

const HISTORY_LIMIT: usize = 200;

/// Fire-and-forget delivery; enqueueing never blocks or fails the caller
pub trait Notifier: Send + Sync {
    fn send_notification(&self, user_id: UserId, message: &str, kind: &str);

    fn send_admin_alert(&self, subject: &str, message: &str);
}

#[derive(Debug, Clone, PartialEq)]
pub enum Notification {
    User {
        user_id: UserId,
        kind: String,
        message: String,
        at: DateTime<Utc>,
    },
    Admin {
        subject: String,
        message: String,
        at: DateTime<Utc>,
    },
}

/// Queues notifications onto a channel drained by a background dispatcher
///
/// Delivery is logging only; the recent history is kept for diagnostics.
#[derive(Clone)]
pub struct QueuedNotifier {
    tx: mpsc::UnboundedSender<Notification>,
    history: Arc<Mutex<VecDeque<Notification>>>,
}

impl QueuedNotifier {
    /// Create the notifier and spawn its dispatcher on the current runtime
    pub fn spawn() -> (Self, JoinHandle<()>) {
        let (tx, mut rx) = mpsc::unbounded_channel::<Notification>();
        let handle = tokio::spawn(async move {
            while let Some(notification) = rx.recv().await {
                dispatch(&notification);
            }
            tracing::debug!("Notification dispatcher stopped");
        });

        (
            Self {
                tx,
                history: Arc::new(Mutex::new(VecDeque::new())),
            },
            handle,
        )
    }

    fn enqueue(&self, notification: Notification) {
        {
            let mut history = self.history.lock().unwrap_or_else(|p| p.into_inner());
            if history.len() == HISTORY_LIMIT {
                history.pop_front();
            }
            history.push_back(notification.clone());
        }
        if self.tx.send(notification).is_err() {
            tracing::warn!("Notification dispatcher is gone, message dropped");
        }
    }

    /// Most recent notifications, oldest first
    pub fn recent(&self) -> Vec<Notification> {
        self.history
            .lock()
            .unwrap_or_else(|p| p.into_inner())
            .iter()
            .cloned()
            .collect()
    }

    pub fn admin_alerts(&self) -> Vec<(String, String)> {
        self.recent()
            .into_iter()
            .filter_map(|n| match n {
                Notification::Admin { subject, message, .. } => Some((subject, message)),
                _ => None,
            })
            .collect()
    }

    pub fn user_messages(&self, user: UserId) -> Vec<(String, String)> {
        self.recent()
            .into_iter()
            .filter_map(|n| match n {
                Notification::User {
                    user_id,
                    kind,
                    message,
                    ..
                } if user_id == user => Some((kind, message)),
                _ => None,
            })
            .collect()
    }
}

impl Notifier for QueuedNotifier {
    fn send_notification(&self, user_id: UserId, message: &str, kind: &str) {
        self.enqueue(Notification::User {
            user_id,
            kind: kind.to_string(),
            message: message.to_string(),
            at: Utc::now(),
        });
    }

    fn send_admin_alert(&self, subject: &str, message: &str) {
        self.enqueue(Notification::Admin {
            subject: subject.to_string(),
            message: message.to_string(),
            at: Utc::now(),
        });
    }
}

fn dispatch(notification: &Notification) {
    match notification {
        Notification::User {
            user_id,
            kind,
            message,
            ..
        } => tracing::info!(user_id = *user_id, kind = %kind, "📨 {}", message),
        Notification::Admin { subject, message, .. } => {
            tracing::warn!(subject = %subject, "🚨 {}", message)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_history_records_both_kinds() {
        let (notifier, _handle) = QueuedNotifier::spawn();
        notifier.send_notification(3, "Trade executed", "trade");
        notifier.send_admin_alert("Database down", "retrying");

        assert_eq!(notifier.user_messages(3), vec![("trade".into(), "Trade executed".into())]);
        assert_eq!(notifier.admin_alerts().len(), 1);
        assert!(notifier.user_messages(4).is_empty());
    }

    #[tokio::test]
    async fn test_history_is_bounded() {
        let (notifier, _handle) = QueuedNotifier::spawn();
        for i in 0..(HISTORY_LIMIT + 10) {
            notifier.send_admin_alert("n", &i.to_string());
        }
        let recent = notifier.recent();
        assert_eq!(recent.len(), HISTORY_LIMIT);
        assert!(matches!(&recent[0], Notification::Admin { message, .. } if message == "10"));
    }
}
