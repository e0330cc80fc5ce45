//! Event helpers for integration tests

use conversion_tracker::Event;
use tokio::sync::broadcast;

/// Drain every event already sent to `events`
pub fn drain_events(events: &mut broadcast::Receiver<Event>) -> Vec<Event> {
    let mut collected = Vec::new();
    while let Ok(event) = events.try_recv() {
        collected.push(event);
    }
    collected
}

/// Number of status checks reported in `events`
pub fn poll_attempts(events: &[Event]) -> usize {
    events
        .iter()
        .filter(|e| matches!(e, Event::PollAttempt { .. }))
        .count()
}

/// Artifacts whose deliverable was classified, with the verdict
pub fn verified(events: &[Event]) -> Vec<(String, bool)> {
    events
        .iter()
        .filter_map(|e| match e {
            Event::ArtifactVerified {
                artifact, valid, ..
            } => Some((artifact.clone(), *valid)),
            _ => None,
        })
        .collect()
}
