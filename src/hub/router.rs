// Letter routing between registered sessions

use crate::hub::bag::{MailMan, Resolution};
use crate::hub::clock::{now_secs, ClockState};
use crate::hub::error::{HubError, ProtocolError};
use crate::hub::handshake::ClientIdentity;
use crate::hub::letter::Letter;
use crate::hub::registry::Registry;
use crate::hub::session::Session;
use futures::future::join_all;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

/// Result of routing one letter
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct RouteOutcome {
    /// Destinations the letter was written to
    pub delivered: usize,
    /// Destinations whose write failed; those sessions were torn down
    pub failed: usize,
    /// The letter was addressed to the hub itself
    pub consumed: bool,
}

impl RouteOutcome {
    /// Nothing matched the destination
    pub fn is_miss(&self) -> bool {
        !self.consumed && self.delivered == 0 && self.failed == 0
    }
}

/// Counters kept across all routed letters
#[derive(Debug, Default)]
pub struct RouterStats {
    pub routed: AtomicU64,
    pub delivered: AtomicU64,
    pub misses: AtomicU64,
    pub write_failures: AtomicU64,
}

/// Matches letters to sessions and forwards them with translated timestamps
pub struct Router {
    station: String,
    hub: ClientIdentity,
    registry: Arc<Registry>,
    mail: Arc<MailMan>,
    stats: RouterStats,
}

impl Router {
    pub fn new(
        station: impl Into<String>,
        hub: ClientIdentity,
        registry: Arc<Registry>,
        mail: Arc<MailMan>,
    ) -> Self {
        Self {
            station: station.into(),
            hub,
            registry,
            mail,
            stats: RouterStats::default(),
        }
    }

    pub fn stats(&self) -> &RouterStats {
        &self.stats
    }

    pub fn station(&self) -> &str {
        &self.station
    }

    pub fn misses(&self) -> u64 {
        self.stats.misses.load(Ordering::Relaxed)
    }

    /// Route a letter received from `sender`
    pub async fn route(&self, raw: &Letter, sender: &Session) -> RouteOutcome {
        self.route_from(raw, &sender.clock).await
    }

    /// Route a letter whose timestamp is expressed in `sender_clock`
    pub async fn route_from(&self, raw: &Letter, sender_clock: &ClockState) -> RouteOutcome {
        self.stats.routed.fetch_add(1, Ordering::Relaxed);
        let destination = raw.destination();

        // The received letter stays untouched; every hop works on a copy.
        let mut letter = raw.clone();
        letter.push_station(self.station.as_str(), now_secs());
        let local_time = sender_clock.to_local(letter.timestamp);

        if destination.matches(&self.hub.path, &self.hub.uid) {
            letter.timestamp = local_time;
            self.consume(&letter).await;
            return RouteOutcome {
                consumed: true,
                ..RouteOutcome::default()
            };
        }

        let targets = self.registry.find(&destination.path, &destination.uid).await;
        if targets.is_empty() {
            self.stats.misses.fetch_add(1, Ordering::Relaxed);
            tracing::warn!(
                "Letter {} from {} to {} matched no client, dropped",
                letter.uid,
                letter.src,
                letter.dst
            );
            return RouteOutcome::default();
        }

        let sends = targets.iter().map(|target| {
            let mut copy = letter.clone();
            copy.timestamp = target.clock.to_remote(local_time);
            async move {
                let result = match copy.to_json() {
                    Ok(json) => target.send(&json).await,
                    Err(e) => Err(HubError::from(ProtocolError::from(e))),
                };
                (target, result)
            }
        });

        let mut outcome = RouteOutcome::default();
        for (target, result) in join_all(sends).await {
            match result {
                Ok(()) => {
                    outcome.delivered += 1;
                    tracing::debug!("Letter {} delivered to {}", letter.uid, target.identity);
                }
                Err(e) => {
                    outcome.failed += 1;
                    tracing::warn!(
                        "Failed to deliver letter {} to {}: {}",
                        letter.uid,
                        target.identity,
                        e
                    );
                    self.registry.unregister(&target.addr).await;
                    target.abort();
                }
            }
        }

        self.stats
            .delivered
            .fetch_add(outcome.delivered as u64, Ordering::Relaxed);
        self.stats
            .write_failures
            .fetch_add(outcome.failed as u64, Ordering::Relaxed);
        tracing::info!(
            "Letter {} routed to {} ({} delivered, {} failed)",
            letter.uid,
            destination,
            outcome.delivered,
            outcome.failed
        );
        outcome
    }

    /// Correlate a response addressed to the hub with its pending letter
    async fn consume(&self, letter: &Letter) {
        self.mail.bags().history.insert_letter(letter).await;
        match self.mail.resolve(letter).await {
            Resolution::Finished => tracing::info!("Letter {} finished", letter.uid),
            Resolution::Failed => tracing::info!(
                "Letter {} failed: {}",
                letter.uid,
                letter.fail_reason.as_deref().unwrap_or_default()
            ),
            Resolution::Absent => tracing::debug!(
                "Letter {} for the hub is not pending (late or unsolicited)",
                letter.uid
            ),
        }
    }
}
