//! Status Callback: a single registered observer fired at phase, step, and
//! marker start/end boundaries.

use async_trait::async_trait;

/// The kind of unit a [`StatusEvent`] reports on.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UnitKind {
    Phase,
    Step,
    Marker,
}

/// Whether a unit is beginning or has ended, and — on end — whether it
/// succeeded.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum UnitStatus {
    Start,
    End { ok: bool },
}

#[derive(Debug, Clone)]
pub struct StatusEvent {
    pub kind: UnitKind,
    pub name: String,
    pub status: UnitStatus,
    pub messages: Vec<String>,
}

/// The observer contract. Implementations are called synchronously with
/// respect to the phase/step/marker boundary they report, matching the
/// original project's single `register_status_callback` slot.
#[async_trait]
pub trait StatusCallback: Send + Sync {
    async fn on_event(&self, event: StatusEvent);
}

/// A [`StatusCallback`] that does nothing, used when the caller has not
/// registered an observer.
pub struct NullCallback;

#[async_trait]
impl StatusCallback for NullCallback {
    async fn on_event(&self, _event: StatusEvent) {}
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex;

    struct RecordingCallback(Mutex<Vec<StatusEvent>>);

    #[async_trait]
    impl StatusCallback for RecordingCallback {
        async fn on_event(&self, event: StatusEvent) {
            self.0.lock().unwrap().push(event);
        }
    }

    #[tokio::test]
    async fn records_events_in_order() {
        let cb = RecordingCallback(Mutex::new(Vec::new()));
        cb.on_event(StatusEvent {
            kind: UnitKind::Phase,
            name: "init".to_string(),
            status: UnitStatus::Start,
            messages: vec![],
        })
        .await;
        cb.on_event(StatusEvent {
            kind: UnitKind::Phase,
            name: "init".to_string(),
            status: UnitStatus::End { ok: true },
            messages: vec![],
        })
        .await;

        let events = cb.0.lock().unwrap();
        assert_eq!(events.len(), 2);
        assert_eq!(events[0].status, UnitStatus::Start);
        assert_eq!(events[1].status, UnitStatus::End { ok: true });
    }
}
