use serde::Serialize;

pub use tokio_util::sync::CancellationToken;

/// Staged progress notification, forwarded by the caller over whatever
/// pub/sub channel it owns. Ephemeral; never stored.
#[derive(Debug, Clone, Serialize)]
pub struct ProgressEvent {
    pub stage: String,
    pub percent: u8,
    pub message: String,
}

/// Sink for staged progress notifications. Passed explicitly through every
/// pipeline stage instead of being captured ambiently in closures.
pub trait ProgressSink: Send + Sync {
    fn report(&self, event: ProgressEvent);
}

impl<F> ProgressSink for F
where
    F: Fn(ProgressEvent) + Send + Sync,
{
    fn report(&self, event: ProgressEvent) {
        self(event)
    }
}

/// Sink that drops every event. Useful for callers that poll state instead.
pub struct NullProgress;

impl ProgressSink for NullProgress {
    fn report(&self, _event: ProgressEvent) {}
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::{Arc, Mutex};

    #[test]
    fn closures_are_progress_sinks() {
        let seen: Arc<Mutex<Vec<ProgressEvent>>> = Arc::new(Mutex::new(Vec::new()));
        let sink_events = seen.clone();
        let sink = move |event: ProgressEvent| {
            sink_events.lock().unwrap().push(event);
        };

        sink.report(ProgressEvent {
            stage: "Archive volumes".to_string(),
            percent: 30,
            message: "archiving 2 volumes".to_string(),
        });

        let events = seen.lock().unwrap();
        assert_eq!(events.len(), 1);
        assert_eq!(events[0].percent, 30);
    }
}
