//! Browse Coalescing
//!
//! Turns a backend's stream of individual find/remove notifications into
//! complete [`ServiceSet`] snapshots. Events arriving within `window` of each
//! other form one burst, and each burst produces at most one snapshot.

use std::time::Duration;

use tokio::sync::mpsc;
use tokio::time::Instant;

use super::{DiscoveredService, ServiceSet};

/// Default quiet period that ends a burst
pub const DEFAULT_COALESCE_WINDOW: Duration = Duration::from_millis(150);

/// Upper bound on how long a continuous burst can delay a snapshot
const MAX_BURST_WINDOWS: u32 = 8;

/// A single notification from a discovery backend
#[derive(Clone, Debug, PartialEq)]
pub enum BrowseEvent {
    /// A service was found or its details changed
    Resolved(DiscoveredService),
    /// A service went away
    Removed {
        /// Fully qualified instance name
        fullname: String,
    },
    /// The backend reported an error; known services are discarded
    Failed(String),
}

/// Spawn the coalescing task
///
/// The returned receiver closes once `events` closes and the last snapshot
/// has been delivered.
pub fn spawn_coalescer(
    mut events: mpsc::Receiver<BrowseEvent>,
    window: Duration,
) -> mpsc::Receiver<ServiceSet> {
    let (tx, rx) = mpsc::channel(16);

    tokio::spawn(async move {
        let mut known = ServiceSet::new();

        while let Some(first) = events.recv().await {
            let mut changed = apply(&mut known, first);
            let mut closed = false;
            let deadline = Instant::now() + window * MAX_BURST_WINDOWS;

            loop {
                let wait = window.min(deadline.saturating_duration_since(Instant::now()));
                if wait.is_zero() {
                    break;
                }
                match tokio::time::timeout(wait, events.recv()).await {
                    Ok(Some(event)) => changed |= apply(&mut known, event),
                    Ok(None) => {
                        closed = true;
                        break;
                    }
                    // Quiet period elapsed: burst is over
                    Err(_) => break,
                }
            }

            if changed && tx.send(known.clone()).await.is_err() {
                tracing::debug!("Browse consumer dropped");
                return;
            }
            if closed {
                break;
            }
        }

        tracing::debug!("Browse event stream ended");
    });

    rx
}

fn apply(known: &mut ServiceSet, event: BrowseEvent) -> bool {
    match event {
        BrowseEvent::Resolved(service) => {
            tracing::debug!(service = %service.fullname, port = service.port, "Service resolved");
            known.upsert(service)
        }
        BrowseEvent::Removed { fullname } => {
            tracing::debug!(service = %fullname, "Service removed");
            known.remove(&fullname)
        }
        BrowseEvent::Failed(reason) => {
            tracing::warn!(error = %reason, "Discovery backend error, discarding known services");
            // Always publish, so consumers see the empty view
            known.clear();
            true
        }
    }
}
