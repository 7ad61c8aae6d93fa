//! Best-effort outbound notifications to the non-acting party.
//!
//! Delivery is out-of-band (email or similar) behind the
//! [`NotificationTransport`] trait; this core only decides who to tell and
//! when. Plain-message notices are debounced through a stored watermark on
//! the conversation, not a timer. Delivery failures are logged and
//! swallowed; they never roll back the state transition that caused them.

use super::conversation::Conversation;
use super::store::ConversationStore;
use super::timestamp::TimeStamp;
use chrono::Duration;
use tracing::{debug, warn};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NoticeKind {
    /// Someone opened a conversation on a listing.
    Interest,
    /// A plain message arrived.
    MessageReceived,
    ProposalReceived,
    ProposalAccepted,
    ProposalDeclined,
    ProposalCancelled,
    Completed,
    ListingWithdrawn,
}

impl NoticeKind {
    /// Only plain-message traffic is throttled; lifecycle notices always
    /// go out.
    pub fn debounced(&self) -> bool {
        matches!(self, Self::Interest | Self::MessageReceived)
    }
}

/// Collaborator boundary: accepts `(recipient, kind, payload)` and delivers
/// out-of-band.
pub trait NotificationTransport: Send + Sync {
    fn deliver(&self, recipient: &str, kind: NoticeKind, payload: &str) -> anyhow::Result<()>;
}

/// Transport that drops everything. Useful for callers that want the
/// engine without outbound delivery wired up.
pub struct NullTransport;

impl NotificationTransport for NullTransport {
    fn deliver(&self, _recipient: &str, _kind: NoticeKind, _payload: &str) -> anyhow::Result<()> {
        Ok(())
    }
}

pub struct NotificationDispatcher {
    transport: Box<dyn NotificationTransport>,
    debounce: Duration,
}

impl NotificationDispatcher {
    pub fn new(transport: Box<dyn NotificationTransport>, debounce: Duration) -> Self {
        Self {
            transport,
            debounce,
        }
    }

    /// Fire a notice for a committed transition. Never fails and never
    /// blocks the transition itself; the watermark only advances on
    /// successful debounced delivery.
    pub fn dispatch(
        &self,
        store: &ConversationStore,
        conversation: &Conversation,
        recipient: &str,
        kind: NoticeKind,
        payload: &str,
    ) {
        let now = TimeStamp::now();

        if kind.debounced() {
            if let Some(last) = &conversation.last_notified_at {
                let elapsed = now.to_datetime_utc() - last.to_datetime_utc();
                if elapsed < self.debounce {
                    debug!(
                        conversation = %conversation.id,
                        ?kind,
                        "notification suppressed by debounce"
                    );
                    return;
                }
            }
        }

        match self.transport.deliver(recipient, kind, payload) {
            Ok(()) => {
                // only the watermark moves; the row is re-fetched so a
                // transition committed after our snapshot stays intact
                if kind.debounced() {
                    if let Err(e) = store.touch_notified(&conversation.id, &now) {
                        warn!(
                            conversation = %conversation.id,
                            error = %e,
                            "failed to persist notification watermark"
                        );
                    }
                }
            }
            Err(e) => {
                warn!(
                    conversation = %conversation.id,
                    recipient,
                    ?kind,
                    error = %e,
                    "notification delivery failed"
                );
            }
        }
    }
}
