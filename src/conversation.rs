//! Conversation entity: the negotiation thread between a listing owner and
//! one interested counterpart, plus its append-only message log.

use super::timestamp::TimeStamp;
use super::utils;
use chrono::Utc;

/// Sender recorded on machine-generated messages.
pub const SYSTEM_SENDER: &str = "system";

/// Negotiation lifecycle of a single conversation.
///
/// `Declined` and `Cancelled` are resting states: a fresh proposal is
/// allowed from either, same as `Idle`. `Settled` and `Voided` are terminal.
#[derive(minicbor::Encode, minicbor::Decode, Debug, Clone, Copy, PartialEq, Eq)]
pub enum NegotiationState {
    #[n(0)]
    Idle,
    #[n(1)]
    ProposalPending,
    #[n(2)]
    Accepted,
    #[n(3)]
    Declined,
    #[n(4)]
    Cancelled,
    /// Settlement committed. Terminal.
    #[n(5)]
    Settled,
    /// Listing disappeared mid-conversation, or it went to someone else.
    /// Terminal.
    #[n(6)]
    Voided,
}

impl NegotiationState {
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Settled | Self::Voided)
    }

    /// States from which a new proposal may be created.
    pub fn can_propose(&self) -> bool {
        matches!(self, Self::Idle | Self::Declined | Self::Cancelled)
    }
}

#[derive(minicbor::Encode, minicbor::Decode, Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProposalOutcome {
    #[n(0)]
    Pending,
    #[n(1)]
    Accepted,
    #[n(2)]
    Declined,
}

/// An offer to transfer a listing, optionally in exchange for another.
/// Always embedded in the message log, never stored separately.
#[derive(minicbor::Encode, minicbor::Decode, Debug, Clone, PartialEq, Eq)]
pub struct Proposal {
    #[n(0)]
    pub proposer: String,
    /// The proposer's own listing being given up.
    #[n(1)]
    pub offered_listing_id: String,
    /// The counterpart's listing requested in return. None for pure gifts
    /// and for exchange proposals falling back to a plain gift.
    #[n(2)]
    pub requested_listing_id: Option<String>,
    #[n(3)]
    pub outcome: ProposalOutcome,
}

#[derive(minicbor::Encode, minicbor::Decode, Debug, Clone, PartialEq, Eq)]
pub enum MessageKind {
    #[n(0)]
    Text,
    #[n(1)]
    System,
    #[n(2)]
    Proposal(#[n(0)] Proposal),
}

#[derive(minicbor::Encode, minicbor::Decode, Debug, Clone, PartialEq, Eq)]
pub struct Message {
    #[n(0)]
    pub sender: String,
    #[n(1)]
    pub sent_at: TimeStamp<Utc>,
    #[n(2)]
    pub body: String,
    #[n(3)]
    pub kind: MessageKind,
}

#[derive(minicbor::Encode, minicbor::Decode, Debug, Clone, PartialEq, Eq)]
pub struct Conversation {
    #[n(0)]
    pub id: String, // uuid7, bech32 with "conv_" prefix
    #[n(1)]
    pub listing_id: String,
    #[n(2)]
    pub owner: String,
    #[n(3)]
    pub counterpart: String,
    #[n(4)]
    pub state: NegotiationState,
    /// One-way marker set by the counterpart after a decline.
    #[n(5)]
    pub dismissed: bool,
    /// Append-only; proposals live here as specialised messages.
    #[n(6)]
    pub messages: Vec<Message>,
    #[n(7)]
    pub owner_unread: u64,
    #[n(8)]
    pub counterpart_unread: u64,
    /// Debounce watermark for the notification dispatcher.
    #[n(9)]
    pub last_notified_at: Option<TimeStamp<Utc>>,
}

impl Conversation {
    pub fn new(listing_id: String, owner: String, counterpart: String) -> anyhow::Result<Self> {
        Ok(Self {
            id: utils::new_uuid_to_bech32("conv_")?,
            listing_id,
            owner,
            counterpart,
            state: NegotiationState::Idle,
            dismissed: false,
            messages: vec![],
            owner_unread: 0,
            counterpart_unread: 0,
            last_notified_at: None,
        })
    }

    pub fn is_participant(&self, user: &str) -> bool {
        self.owner == user || self.counterpart == user
    }

    /// The participant on the other side of `user`.
    pub fn other_party(&self, user: &str) -> &str {
        if self.owner == user {
            &self.counterpart
        } else {
            &self.owner
        }
    }

    pub fn unread_for(&self, user: &str) -> u64 {
        if self.owner == user {
            self.owner_unread
        } else {
            self.counterpart_unread
        }
    }

    pub fn mark_read(&mut self, user: &str) {
        if self.owner == user {
            self.owner_unread = 0;
        } else {
            self.counterpart_unread = 0;
        }
    }

    fn bump_unread_for(&mut self, user: &str) {
        if self.owner == user {
            self.owner_unread += 1;
        } else {
            self.counterpart_unread += 1;
        }
    }

    pub fn push_text(&mut self, sender: &str, body: &str) {
        let recipient = self.other_party(sender).to_owned();
        self.messages.push(Message {
            sender: sender.to_owned(),
            sent_at: TimeStamp::now(),
            body: body.to_owned(),
            kind: MessageKind::Text,
        });
        self.bump_unread_for(&recipient);
    }

    /// System notes count as unread for both sides.
    pub fn push_system(&mut self, body: &str) {
        self.messages.push(Message {
            sender: SYSTEM_SENDER.to_owned(),
            sent_at: TimeStamp::now(),
            body: body.to_owned(),
            kind: MessageKind::System,
        });
        self.owner_unread += 1;
        self.counterpart_unread += 1;
    }

    pub fn push_proposal(
        &mut self,
        proposer: &str,
        offered_listing_id: &str,
        requested_listing_id: Option<String>,
        body: &str,
    ) {
        let recipient = self.other_party(proposer).to_owned();
        self.messages.push(Message {
            sender: proposer.to_owned(),
            sent_at: TimeStamp::now(),
            body: body.to_owned(),
            kind: MessageKind::Proposal(Proposal {
                proposer: proposer.to_owned(),
                offered_listing_id: offered_listing_id.to_owned(),
                requested_listing_id,
                outcome: ProposalOutcome::Pending,
            }),
        });
        self.bump_unread_for(&recipient);
    }

    /// The single pending proposal, if any. The state machine guarantees at
    /// most one exists, so scanning from the tail finds it first.
    pub fn pending_proposal(&self) -> Option<&Proposal> {
        self.messages.iter().rev().find_map(|m| match &m.kind {
            MessageKind::Proposal(p) if p.outcome == ProposalOutcome::Pending => Some(p),
            _ => None,
        })
    }

    /// Resolve the pending proposal. Returns the resolved proposal, or None
    /// if nothing was pending. History stays in the log untouched otherwise.
    pub fn resolve_pending(&mut self, outcome: ProposalOutcome) -> Option<Proposal> {
        for message in self.messages.iter_mut().rev() {
            if let MessageKind::Proposal(p) = &mut message.kind {
                if p.outcome == ProposalOutcome::Pending {
                    p.outcome = outcome;
                    return Some(p.clone());
                }
            }
        }
        None
    }

    /// All proposals ever made on this conversation, oldest first.
    pub fn proposals(&self) -> Vec<&Proposal> {
        self.messages
            .iter()
            .filter_map(|m| match &m.kind {
                MessageKind::Proposal(p) => Some(p),
                _ => None,
            })
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn conv() -> Conversation {
        Conversation::new("listing_x".into(), "user_owner".into(), "user_guest".into()).unwrap()
    }

    #[test]
    fn text_messages_bump_the_other_side() {
        let mut c = conv();
        c.push_text("user_guest", "is this still around?");

        assert_eq!(c.owner_unread, 1);
        assert_eq!(c.counterpart_unread, 0);
        assert_eq!(c.unread_for("user_owner"), 1);

        c.mark_read("user_owner");
        assert_eq!(c.unread_for("user_owner"), 0);
    }

    #[test]
    fn pending_proposal_resolution_keeps_history() {
        let mut c = conv();
        c.push_proposal("user_owner", "listing_x", None, "want it?");
        assert!(c.pending_proposal().is_some());

        let resolved = c.resolve_pending(ProposalOutcome::Declined).unwrap();
        assert_eq!(resolved.outcome, ProposalOutcome::Declined);
        assert!(c.pending_proposal().is_none());

        // a second proposal coexists with the first in the log
        c.push_proposal("user_owner", "listing_x", None, "sure now?");
        let all = c.proposals();
        assert_eq!(all.len(), 2);
        assert_eq!(all[0].outcome, ProposalOutcome::Declined);
        assert_eq!(all[1].outcome, ProposalOutcome::Pending);
    }

    #[test]
    fn resolve_without_pending_is_none() {
        let mut c = conv();
        assert!(c.resolve_pending(ProposalOutcome::Declined).is_none());
    }

    #[test]
    fn state_predicates() {
        assert!(NegotiationState::Idle.can_propose());
        assert!(NegotiationState::Declined.can_propose());
        assert!(NegotiationState::Cancelled.can_propose());
        assert!(!NegotiationState::ProposalPending.can_propose());
        assert!(!NegotiationState::Accepted.can_propose());
        assert!(NegotiationState::Settled.is_terminal());
        assert!(NegotiationState::Voided.is_terminal());
        assert!(!NegotiationState::Accepted.is_terminal());
    }

    #[test]
    fn conversation_cbor_roundtrip() {
        let mut c = conv();
        c.push_text("user_guest", "hello");
        c.push_proposal("user_owner", "listing_x", Some("listing_y".into()), "swap?");

        let encoded = minicbor::to_vec(&c).unwrap();
        let decoded: Conversation = minicbor::decode(&encoded).unwrap();
        assert_eq!(c, decoded);
    }
}
