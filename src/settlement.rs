//! Settlement ledger: the irreversible commit of a negotiation's outcome.
//!
//! One transaction archives the listing(s), updates per-user counters and
//! appends the summary system message, so a listing is never archived
//! without its counters moving and vice versa. Settling an already-settled
//! conversation is a no-op, not an error.

use super::conversation::{Conversation, NegotiationState};
use super::error::SwapError;
use super::listing::{Disposition, Lifecycle, Listing, ListingKind};
use super::store::{
    decode_tx, encode_tx, fetch_conversation_tx, fetch_listing_tx, run_tx, store_conversation_tx,
    store_listing_tx,
};
use super::timestamp::TimeStamp;
use sled::transaction::{ConflictableTransactionResult, TransactionalTree, abort};
use std::sync::Arc;
use tracing::info;

pub(crate) fn counter_key(user: &str) -> String {
    format!("count_{user}")
}

/// Aggregate give/receive/trade tallies per user. Eventually consistent
/// from a reader's point of view; strictly consistent with archival inside
/// the settlement transaction.
#[derive(minicbor::Encode, minicbor::Decode, Debug, Default, Clone, PartialEq, Eq)]
pub struct UserCounters {
    #[n(0)]
    pub given: u64,
    #[n(1)]
    pub received: u64,
    #[n(2)]
    pub traded: u64,
}

fn bump_counters_tx(
    tx: &TransactionalTree,
    user: &str,
    apply: impl FnOnce(&mut UserCounters),
) -> ConflictableTransactionResult<(), SwapError> {
    let key = counter_key(user);
    let mut counters: UserCounters = match tx.get(key.as_bytes())? {
        Some(bytes) => decode_tx(bytes.as_ref())?,
        None => UserCounters::default(),
    };
    apply(&mut counters);
    tx.insert(key.as_bytes(), encode_tx(&counters)?)?;
    Ok(())
}

pub struct SettlementLedger {
    db: Arc<sled::Db>,
}

impl SettlementLedger {
    pub fn new(db: Arc<sled::Db>) -> Self {
        Self { db }
    }

    pub fn counters_for(&self, user: &str) -> anyhow::Result<UserCounters> {
        match self.db.get(counter_key(user).as_bytes())? {
            Some(bytes) => Ok(minicbor::decode(bytes.as_ref())?),
            None => Ok(UserCounters::default()),
        }
    }

    /// Commit the outcome of an `Accepted` conversation. Idempotent:
    /// calling it again once `Settled` returns the committed state
    /// unchanged.
    pub fn settle(&self, conversation_id: &str) -> anyhow::Result<(Conversation, Listing)> {
        let (conversation, listing, already_settled) = run_tx(&self.db, |tx| {
            let conversation = fetch_conversation_tx(tx, conversation_id)?.ok_or_else(|| {
                sled::transaction::ConflictableTransactionError::Abort(SwapError::NotFound(
                    format!("conversation {conversation_id}"),
                ))
            })?;

            if conversation.state == NegotiationState::Settled {
                let listing = match fetch_listing_tx(tx, &conversation.listing_id)? {
                    Some(listing) => listing,
                    None => {
                        return abort(SwapError::NotFound(format!(
                            "listing {}",
                            conversation.listing_id
                        )));
                    }
                };
                return Ok((conversation, listing, true));
            }
            if conversation.state != NegotiationState::Accepted {
                return abort(SwapError::InvalidState(format!(
                    "conversation {conversation_id} is {:?}, settlement requires Accepted",
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
            let reservation = match listing.reservation() {
                Some(r) if r.conversation_id == conversation.id => r.clone(),
                _ => {
                    return abort(SwapError::Conflict(format!(
                        "listing {} is not reserved by conversation {conversation_id}",
                        listing.id
                    )));
                }
            };

            let archived_at = TimeStamp::now();
            let mut conversation = conversation;
            let mut listing = listing;

            match reservation.counter_listing_id {
                Some(counter_id) => {
                    // exchange: both rows archive with reciprocal dispositions
                    let mut counter = match fetch_listing_tx(tx, &counter_id)? {
                        Some(counter) => counter,
                        None => return abort(SwapError::NotFound(format!("listing {counter_id}"))),
                    };
                    match counter.reservation() {
                        Some(r) if r.conversation_id == conversation.id => {}
                        _ => {
                            return abort(SwapError::Conflict(format!(
                                "listing {counter_id} is not reserved by conversation {conversation_id}",
                            )));
                        }
                    }

                    listing.lifecycle = Lifecycle::Archived(Disposition {
                        recipient: conversation.counterpart.clone(),
                        received_listing_id: Some(counter.id.clone()),
                        archived_at: archived_at.clone(),
                    });
                    counter.lifecycle = Lifecycle::Archived(Disposition {
                        recipient: conversation.owner.clone(),
                        received_listing_id: Some(listing.id.clone()),
                        archived_at,
                    });

                    // fixed write order by id, matching the claim path
                    if listing.id <= counter.id {
                        store_listing_tx(tx, &listing)?;
                        store_listing_tx(tx, &counter)?;
                    } else {
                        store_listing_tx(tx, &counter)?;
                        store_listing_tx(tx, &listing)?;
                    }

                    bump_counters_tx(tx, &conversation.owner, |c| c.traded += 1)?;
                    bump_counters_tx(tx, &conversation.counterpart, |c| c.traded += 1)?;

                    conversation.push_system(&format!(
                        "exchange completed: {} traded for {}",
                        listing.id, counter.id
                    ));
                }
                None => {
                    listing.lifecycle = Lifecycle::Archived(Disposition {
                        recipient: conversation.counterpart.clone(),
                        received_listing_id: None,
                        archived_at,
                    });
                    store_listing_tx(tx, &listing)?;

                    if listing.kind == ListingKind::Gift {
                        bump_counters_tx(tx, &conversation.owner, |c| c.given += 1)?;
                        bump_counters_tx(tx, &conversation.counterpart, |c| c.received += 1)?;
                        conversation.push_system(&format!(
                            "gift completed: {} given to {}",
                            listing.id, conversation.counterpart
                        ));
                    } else {
                        // gift fallback of an exchange listing: only the
                        // giver's tally moves
                        bump_counters_tx(tx, &conversation.owner, |c| c.given += 1)?;
                        conversation.push_system(&format!(
                            "exchange resolved as gift: {} given to {}",
                            listing.id, conversation.counterpart
                        ));
                    }
                }
            }

            conversation.state = NegotiationState::Settled;
            store_conversation_tx(tx, &conversation)?;

            Ok((conversation, listing, false))
        })?;

        if !already_settled {
            info!(
                conversation = %conversation.id,
                listing = %listing.id,
                "settlement committed"
            );
        }

        Ok((conversation, listing))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::arbiter::ClaimArbiter;
    use crate::book::BookDetails;
    use crate::store::{ConversationStore, ListingStore};
    use crate::utils::new_uuid_to_bech32;
    use tempfile::tempdir;

    struct Fixture {
        _dir: tempfile::TempDir,
        listings: ListingStore,
        conversations: ConversationStore,
        arbiter: ClaimArbiter,
        ledger: SettlementLedger,
    }

    fn fixture(name: &str) -> Fixture {
        let dir = tempdir().unwrap();
        let db = Arc::new(sled::open(dir.path().join(name)).unwrap());
        Fixture {
            _dir: dir,
            listings: ListingStore::new(db.clone()),
            conversations: ConversationStore::new(db.clone()),
            arbiter: ClaimArbiter::new(db.clone()),
            ledger: SettlementLedger::new(db),
        }
    }

    fn book(title: &str) -> BookDetails {
        BookDetails::new().set_title(title).set_author("anon")
    }

    /// Drive a conversation to Accepted with a live reservation.
    fn accepted_gift(f: &Fixture) -> (String, String, String) {
        let owner = new_uuid_to_bech32("user_").unwrap();
        let guest = new_uuid_to_bech32("user_").unwrap();
        let listing = f
            .listings
            .create(owner.clone(), &book("Solaris"), ListingKind::Gift)
            .unwrap();
        let (mut conv, _) = f.conversations.open_or_reuse(&listing, &guest).unwrap();
        conv.push_proposal(&owner, &listing.id, None, "yours if you want it");
        conv.resolve_pending(crate::conversation::ProposalOutcome::Accepted);
        conv.state = NegotiationState::Accepted;
        f.conversations.save(&conv).unwrap();
        f.arbiter.reserve(&listing.id, &conv.id, None).unwrap();
        (conv.id, owner, guest)
    }

    #[test]
    fn gift_settlement_archives_and_counts() {
        let f = fixture("settle_gift.db");
        let (conv_id, owner, guest) = accepted_gift(&f);

        let (conv, listing) = f.ledger.settle(&conv_id).unwrap();
        assert_eq!(conv.state, NegotiationState::Settled);
        let disposition = listing.disposition().unwrap();
        assert_eq!(disposition.recipient, guest);
        assert_eq!(disposition.received_listing_id, None);

        assert_eq!(f.ledger.counters_for(&owner).unwrap().given, 1);
        assert_eq!(f.ledger.counters_for(&guest).unwrap().received, 1);
        assert_eq!(f.ledger.counters_for(&guest).unwrap().traded, 0);
    }

    #[test]
    fn settle_twice_is_a_noop() {
        let f = fixture("settle_twice.db");
        let (conv_id, owner, guest) = accepted_gift(&f);

        let (first_conv, first_listing) = f.ledger.settle(&conv_id).unwrap();
        let (second_conv, second_listing) = f.ledger.settle(&conv_id).unwrap();

        assert_eq!(first_conv, second_conv);
        assert_eq!(first_listing, second_listing);
        assert_eq!(f.ledger.counters_for(&owner).unwrap().given, 1);
        assert_eq!(f.ledger.counters_for(&guest).unwrap().received, 1);
    }

    #[test]
    fn settle_requires_accepted() {
        let f = fixture("settle_idle.db");
        let owner = new_uuid_to_bech32("user_").unwrap();
        let guest = new_uuid_to_bech32("user_").unwrap();
        let listing = f
            .listings
            .create(owner, &book("Solaris"), ListingKind::Gift)
            .unwrap();
        let (conv, _) = f.conversations.open_or_reuse(&listing, &guest).unwrap();

        let err = f.ledger.settle(&conv.id).unwrap_err();
        assert!(matches!(
            err.downcast_ref::<SwapError>(),
            Some(SwapError::InvalidState(_))
        ));
    }
}
