//! Service layer API driving the negotiation state machine.
//!
//! One conversation moves `Idle → ProposalPending → {Accepted, Declined,
//! Cancelled}` and onward to `Settled` or `Voided`; competing accepts
//! across conversations for the same listing are resolved by the claim
//! arbiter. Every mutating operation runs as a single sled transaction
//! over the rows it touches, and notifications fire only after the
//! transaction commits.

use super::arbiter::ClaimArbiter;
use super::book::BookDetails;
use super::conversation::{Conversation, Message, NegotiationState, ProposalOutcome};
use super::error::SwapError;
use super::listing::{Lifecycle, Listing, ListingFilter, ListingKind};
use super::notify::{NotificationDispatcher, NotificationTransport, NoticeKind};
use super::settlement::{SettlementLedger, UserCounters};
use super::store::{
    ConversationStore, ListingStore, fetch_conversation_tx, fetch_listing_tx, run_tx,
    store_conversation_tx, store_listing_tx,
};
use chrono::Duration;
use sled::transaction::{ConflictableTransactionError, TransactionalTree, abort};
use std::sync::Arc;
use tracing::{debug, info};

/// Engine configuration, injected at construction.
pub struct SwapConfig {
    /// Minimum gap between plain-message notifications per conversation.
    pub notify_debounce: Duration,
}

impl Default for SwapConfig {
    fn default() -> Self {
        Self {
            notify_debounce: Duration::minutes(5),
        }
    }
}

/// Result of an accept: the winner gets a reservation, losers get one of
/// the two recovery outcomes instead of a raw conflict error.
#[derive(Debug)]
pub enum AcceptOutcome {
    /// Claim succeeded; listing(s) reserved for this conversation.
    Reserved {
        conversation: Conversation,
        listing: Listing,
    },
    /// The owner's listing itself went to someone else or vanished.
    /// The conversation is void, terminally.
    ListingGone { conversation: Conversation },
    /// Only the requested counter-listing is gone. The proposal was
    /// force-declined and the conversation reopened for a gift fallback or
    /// an alternative re-proposal.
    CounterListingGone { conversation: Conversation },
}

pub struct NegotiationService {
    db: Arc<sled::Db>,
    listings: ListingStore,
    conversations: ConversationStore,
    arbiter: ClaimArbiter,
    ledger: SettlementLedger,
    dispatcher: NotificationDispatcher,
}

impl NegotiationService {
    pub fn new(
        db: Arc<sled::Db>,
        transport: Box<dyn NotificationTransport>,
        config: SwapConfig,
    ) -> Self {
        Self {
            listings: ListingStore::new(db.clone()),
            conversations: ConversationStore::new(db.clone()),
            arbiter: ClaimArbiter::new(db.clone()),
            ledger: SettlementLedger::new(db.clone()),
            dispatcher: NotificationDispatcher::new(transport, config.notify_debounce),
            db,
        }
    }

    // LISTING SURFACE

    pub fn create_listing(
        &self,
        owner: &str,
        book: &BookDetails,
        kind: ListingKind,
    ) -> anyhow::Result<Listing> {
        let listing = self.listings.create(owner.to_owned(), book, kind)?;
        info!(listing = %listing.id, owner, ?kind, "listing created");
        Ok(listing)
    }

    pub fn get_listing(&self, id: &str) -> anyhow::Result<Listing> {
        self.listings.get(id)
    }

    pub fn book(&self, hash: &str) -> anyhow::Result<BookDetails> {
        self.listings.book(hash)
    }

    pub fn list_available(&self, filter: &ListingFilter) -> anyhow::Result<Vec<Listing>> {
        debug!(?filter, "listing query");
        self.listings.list_available(filter)
    }

    pub fn counters(&self, user: &str) -> anyhow::Result<UserCounters> {
        self.ledger.counters_for(user)
    }

    /// Remove a not-yet-archived listing and void every conversation open
    /// against it; no settlement occurs. Deleting a reserved listing also
    /// releases the paired listing of an exchange reservation, so no row is
    /// left reserved by a voided conversation.
    pub fn delete_listing(&self, listing_id: &str, actor: &str) -> anyhow::Result<()> {
        let listing = self.listings.get(listing_id)?;
        if listing.owner != actor {
            return Err(
                SwapError::Forbidden(format!("{actor} does not own listing {listing_id}")).into(),
            );
        }
        if matches!(listing.lifecycle, Lifecycle::Archived(_)) {
            return Err(SwapError::InvalidState(format!(
                "listing {listing_id} is archived and immutable"
            ))
            .into());
        }

        // index read happens outside the transaction; a conversation opened
        // concurrently will hit the listing-gone path on its next transition
        let conversation_ids = self.conversations.ids_for_listing(listing_id)?;

        let voided = run_tx(&self.db, |tx| {
            let listing = match fetch_listing_tx(tx, listing_id)? {
                Some(listing) => listing,
                None => return abort(SwapError::NotFound(format!("listing {listing_id}"))),
            };

            let mut to_void = conversation_ids.clone();
            if let Lifecycle::Reserved(reservation) = &listing.lifecycle {
                // the reserving conversation lives against the paired listing
                // when this row is the counter side, so the index scan above
                // does not know it
                if !to_void.contains(&reservation.conversation_id) {
                    to_void.push(reservation.conversation_id.clone());
                }
                if let Some(counter_id) = &reservation.counter_listing_id {
                    if let Some(mut counter) = fetch_listing_tx(tx, counter_id)? {
                        if counter.reservation().is_some() {
                            counter.lifecycle = Lifecycle::Available;
                            store_listing_tx(tx, &counter)?;
                        }
                    }
                }
            }
            tx.remove(listing_id.as_bytes())?;

            let mut voided = Vec::new();
            for id in &to_void {
                if let Some(mut conversation) = fetch_conversation_tx(tx, id)? {
                    if conversation.state.is_terminal() {
                        continue;
                    }
                    conversation.resolve_pending(ProposalOutcome::Declined);
                    conversation.push_system("listing withdrawn by the owner");
                    conversation.state = NegotiationState::Voided;
                    store_conversation_tx(tx, &conversation)?;
                    voided.push(conversation);
                }
            }
            Ok(voided)
        })?;

        info!(listing = %listing_id, voided = voided.len(), "listing deleted");
        for conversation in &voided {
            self.dispatcher.dispatch(
                &self.conversations,
                conversation,
                &conversation.counterpart,
                NoticeKind::ListingWithdrawn,
                &conversation.listing_id,
            );
        }
        Ok(())
    }

    // CONVERSATION SURFACE

    /// Express interest: open a conversation against an available listing,
    /// or reuse the existing one for this counterpart.
    pub fn open_conversation(&self, listing_id: &str, actor: &str) -> anyhow::Result<Conversation> {
        let listing = self.listings.get(listing_id)?;
        if listing.owner == actor {
            return Err(SwapError::Forbidden(
                "owners cannot open a conversation on their own listing".into(),
            )
            .into());
        }
        if !listing.is_available() {
            return Err(SwapError::InvalidState(format!(
                "listing {listing_id} is no longer available"
            ))
            .into());
        }

        let (conversation, created) = self.conversations.open_or_reuse(&listing, actor)?;
        if created {
            info!(conversation = %conversation.id, listing = %listing_id, "conversation opened");
            self.dispatcher.dispatch(
                &self.conversations,
                &conversation,
                &conversation.owner,
                NoticeKind::Interest,
                &conversation.id,
            );
        }
        Ok(conversation)
    }

    pub fn conversations_for(&self, user: &str) -> anyhow::Result<Vec<Conversation>> {
        self.conversations.for_user(user)
    }

    /// Message log for a participant; reading resets their unread count.
    pub fn messages(&self, conversation_id: &str, reader: &str) -> anyhow::Result<Vec<Message>> {
        run_tx(&self.db, |tx| {
            let mut conversation = require_conversation_tx(tx, conversation_id)?;
            require_participant(&conversation, reader)?;
            conversation.mark_read(reader);
            store_conversation_tx(tx, &conversation)?;
            Ok(conversation.messages)
        })
    }

    pub fn send_message(
        &self,
        conversation_id: &str,
        actor: &str,
        body: &str,
    ) -> anyhow::Result<Conversation> {
        let conversation = run_tx(&self.db, |tx| {
            let mut conversation = require_conversation_tx(tx, conversation_id)?;
            require_participant(&conversation, actor)?;
            if conversation.state == NegotiationState::Voided {
                return abort(SwapError::InvalidState(format!(
                    "conversation {conversation_id} is void"
                )));
            }
            conversation.push_text(actor, body);
            store_conversation_tx(tx, &conversation)?;
            Ok(conversation)
        })?;

        self.dispatcher.dispatch(
            &self.conversations,
            &conversation,
            conversation.other_party(actor),
            NoticeKind::MessageReceived,
            &conversation.id,
        );
        Ok(conversation)
    }

    // NEGOTIATION TRANSITIONS

    /// Owner action: offer the conversation's listing, optionally asking
    /// for one of the counterpart's own available listings in return.
    pub fn propose(
        &self,
        conversation_id: &str,
        actor: &str,
        requested_listing_id: Option<&str>,
    ) -> anyhow::Result<Conversation> {
        let conversation = run_tx(&self.db, |tx| {
            let mut conversation = require_conversation_tx(tx, conversation_id)?;
            if conversation.owner != actor {
                return abort(SwapError::Forbidden(
                    "only the listing owner can propose".into(),
                ));
            }
            if conversation.state == NegotiationState::ProposalPending {
                return abort(SwapError::InvalidState(
                    "a proposal is already pending".into(),
                ));
            }
            if !conversation.state.can_propose() {
                return abort(SwapError::InvalidState(format!(
                    "conversation {conversation_id} is {:?}",
                    conversation.state
                )));
            }

            let listing = match fetch_listing_tx(tx, &conversation.listing_id)? {
                Some(listing) => listing,
                None => {
                    return abort(SwapError::NotFound(format!(
                        "listing {}",
                        conversation.listing_id
                    )));
                }
            };
            if !listing.is_available() {
                return abort(SwapError::InvalidState(format!(
                    "listing {} is {:?}",
                    listing.id,
                    listing.lifecycle.stage()
                )));
            }

            let body = match (listing.kind, requested_listing_id) {
                (ListingKind::Gift, Some(_)) => {
                    return abort(SwapError::Validation(
                        "gift listings cannot request a listing in return".into(),
                    ));
                }
                (ListingKind::Gift, None) => format!("offering {} as a gift", listing.id),
                (ListingKind::Exchange, Some(requested)) => {
                    let counter = match fetch_listing_tx(tx, requested)? {
                        Some(counter) => counter,
                        None => {
                            return abort(SwapError::Validation(format!(
                                "requested listing {requested} does not exist"
                            )));
                        }
                    };
                    if counter.owner != conversation.counterpart {
                        return abort(SwapError::Validation(format!(
                            "requested listing {requested} is not owned by the counterpart"
                        )));
                    }
                    if !counter.is_available() {
                        return abort(SwapError::Validation(format!(
                            "requested listing {requested} is not available"
                        )));
                    }
                    format!("offering {} in exchange for {requested}", listing.id)
                }
                // counterpart has nothing to offer back: gift fallback
                (ListingKind::Exchange, None) => {
                    format!("offering {} as a gift, no exchange requested", listing.id)
                }
            };

            let listing_id = conversation.listing_id.clone();
            conversation.push_proposal(
                actor,
                &listing_id,
                requested_listing_id.map(str::to_owned),
                &body,
            );
            conversation.state = NegotiationState::ProposalPending;
            store_conversation_tx(tx, &conversation)?;
            Ok(conversation)
        })?;

        info!(conversation = %conversation.id, "proposal created");
        self.dispatcher.dispatch(
            &self.conversations,
            &conversation,
            &conversation.counterpart,
            NoticeKind::ProposalReceived,
            &conversation.id,
        );
        Ok(conversation)
    }

    /// Counterpart action: accept the pending proposal. The claim and the
    /// conversation update commit as one transaction; a lost claim is
    /// translated into a recovery outcome, never surfaced raw.
    pub fn accept(&self, conversation_id: &str, actor: &str) -> anyhow::Result<AcceptOutcome> {
        let outcome = run_tx(&self.db, |tx| {
            let mut conversation = require_conversation_tx(tx, conversation_id)?;
            require_participant(&conversation, actor)?;
            if conversation.counterpart != actor {
                return abort(SwapError::Forbidden(
                    "only the counterpart can accept a proposal".into(),
                ));
            }
            if conversation.state != NegotiationState::ProposalPending {
                return abort(SwapError::InvalidState(
                    "no pending proposal to accept".into(),
                ));
            }
            let proposal = match conversation.pending_proposal() {
                Some(p) => p.clone(),
                None => {
                    return abort(SwapError::InvalidState(
                        "pending conversation carries no pending proposal".into(),
                    ));
                }
            };

            let claim = self.arbiter.claim_in_tx(
                tx,
                &conversation.listing_id,
                &conversation.id,
                proposal.requested_listing_id.as_deref(),
            );
            match claim {
                Ok(listing) => {
                    conversation.resolve_pending(ProposalOutcome::Accepted);
                    conversation.state = NegotiationState::Accepted;
                    conversation
                        .push_system(&format!("proposal accepted, {} reserved", listing.id));
                    store_conversation_tx(tx, &conversation)?;
                    Ok(AcceptOutcome::Reserved {
                        conversation,
                        listing,
                    })
                }
                Err(ConflictableTransactionError::Abort(SwapError::AlreadyClaimed(id)))
                | Err(ConflictableTransactionError::Abort(SwapError::NotFound(id))) => {
                    conversation.resolve_pending(ProposalOutcome::Declined);
                    if id == conversation.listing_id {
                        conversation.push_system(
                            "this book is no longer available, given to someone else",
                        );
                        conversation.state = NegotiationState::Voided;
                        store_conversation_tx(tx, &conversation)?;
                        Ok(AcceptOutcome::ListingGone { conversation })
                    } else {
                        conversation.push_system(&format!(
                            "offered listing {id} is no longer available, accept as a gift or pick another book"
                        ));
                        conversation.state = NegotiationState::Idle;
                        store_conversation_tx(tx, &conversation)?;
                        Ok(AcceptOutcome::CounterListingGone { conversation })
                    }
                }
                Err(other) => Err(other),
            }
        })?;

        match &outcome {
            AcceptOutcome::Reserved {
                conversation,
                listing,
            } => {
                info!(conversation = %conversation.id, listing = %listing.id, "proposal accepted");
                self.dispatcher.dispatch(
                    &self.conversations,
                    conversation,
                    &conversation.owner,
                    NoticeKind::ProposalAccepted,
                    &conversation.id,
                );
            }
            AcceptOutcome::CounterListingGone { conversation } => {
                self.dispatcher.dispatch(
                    &self.conversations,
                    conversation,
                    &conversation.owner,
                    NoticeKind::ProposalDeclined,
                    &conversation.id,
                );
            }
            AcceptOutcome::ListingGone { conversation } => {
                debug!(conversation = %conversation.id, "accept lost the race");
            }
        }
        Ok(outcome)
    }

    /// Counterpart action: decline the pending proposal with a reason.
    pub fn decline(
        &self,
        conversation_id: &str,
        actor: &str,
        reason: &str,
    ) -> anyhow::Result<Conversation> {
        let conversation = run_tx(&self.db, |tx| {
            let mut conversation = require_conversation_tx(tx, conversation_id)?;
            if conversation.counterpart != actor {
                return abort(SwapError::Forbidden(
                    "only the counterpart can decline a proposal".into(),
                ));
            }
            if conversation.state != NegotiationState::ProposalPending {
                return abort(SwapError::InvalidState(
                    "no pending proposal to decline".into(),
                ));
            }
            conversation.resolve_pending(ProposalOutcome::Declined);
            conversation.push_system(&format!("proposal declined: {reason}"));
            conversation.state = NegotiationState::Declined;
            store_conversation_tx(tx, &conversation)?;
            Ok(conversation)
        })?;

        self.dispatcher.dispatch(
            &self.conversations,
            &conversation,
            &conversation.owner,
            NoticeKind::ProposalDeclined,
            &conversation.id,
        );
        Ok(conversation)
    }

    /// Proposer action: withdraw the pending proposal before acceptance.
    pub fn cancel(
        &self,
        conversation_id: &str,
        actor: &str,
        reason: &str,
    ) -> anyhow::Result<Conversation> {
        let conversation = run_tx(&self.db, |tx| {
            let mut conversation = require_conversation_tx(tx, conversation_id)?;
            if conversation.state != NegotiationState::ProposalPending {
                return abort(SwapError::InvalidState(
                    "no pending proposal to cancel".into(),
                ));
            }
            match conversation.pending_proposal() {
                Some(p) if p.proposer == actor => {}
                _ => {
                    return abort(SwapError::Forbidden(
                        "only the proposer can cancel a proposal".into(),
                    ));
                }
            }
            conversation.resolve_pending(ProposalOutcome::Declined);
            conversation.push_system(&format!("proposal cancelled: {reason}"));
            conversation.state = NegotiationState::Cancelled;
            store_conversation_tx(tx, &conversation)?;
            Ok(conversation)
        })?;

        self.dispatcher.dispatch(
            &self.conversations,
            &conversation,
            &conversation.counterpart,
            NoticeKind::ProposalCancelled,
            &conversation.id,
        );
        Ok(conversation)
    }

    /// Counterpart action: mark a declined conversation dismissed. One-way;
    /// plain messages never reopen it, only a fresh explicit proposal does.
    pub fn dismiss(&self, conversation_id: &str, actor: &str) -> anyhow::Result<Conversation> {
        run_tx(&self.db, |tx| {
            let mut conversation = require_conversation_tx(tx, conversation_id)?;
            if conversation.counterpart != actor {
                return abort(SwapError::Forbidden(
                    "only the counterpart can dismiss a conversation".into(),
                ));
            }
            if conversation.state != NegotiationState::Declined {
                return abort(SwapError::InvalidState(
                    "dismiss requires a declined conversation".into(),
                ));
            }
            if !conversation.dismissed {
                conversation.dismissed = true;
                store_conversation_tx(tx, &conversation)?;
            }
            Ok(conversation)
        })
    }

    /// Either party: commit the accepted outcome through the settlement
    /// ledger. Idempotent once settled.
    pub fn complete(
        &self,
        conversation_id: &str,
        actor: &str,
    ) -> anyhow::Result<(Conversation, Listing)> {
        let current = self.conversations.get(conversation_id)?;
        if !current.is_participant(actor) {
            return Err(SwapError::Forbidden(format!(
                "{actor} is not a participant of conversation {conversation_id}"
            ))
            .into());
        }
        let was_settled = current.state == NegotiationState::Settled;

        let (conversation, listing) = self.ledger.settle(conversation_id)?;

        if !was_settled {
            self.dispatcher.dispatch(
                &self.conversations,
                &conversation,
                conversation.other_party(actor),
                NoticeKind::Completed,
                &conversation.id,
            );
        }
        Ok((conversation, listing))
    }
}

fn require_conversation_tx(
    tx: &TransactionalTree,
    id: &str,
) -> Result<Conversation, ConflictableTransactionError<SwapError>> {
    fetch_conversation_tx(tx, id)?.ok_or_else(|| {
        ConflictableTransactionError::Abort(SwapError::NotFound(format!("conversation {id}")))
    })
}

fn require_participant(
    conversation: &Conversation,
    user: &str,
) -> Result<(), ConflictableTransactionError<SwapError>> {
    if conversation.is_participant(user) {
        Ok(())
    } else {
        Err(ConflictableTransactionError::Abort(SwapError::Forbidden(
            format!(
                "{user} is not a participant of conversation {}",
                conversation.id
            ),
        )))
    }
}
