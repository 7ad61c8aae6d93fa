//! Claim arbiter: at most one conversation wins a listing.
//!
//! Competing accepts race on the listing row's lifecycle. The first claim
//! to commit moves it `Available → Reserved`; every later claim observes a
//! non-available lifecycle and fails deterministically. The negotiation
//! state machine converts that failure into the "no longer available"
//! outcome for the loser rather than surfacing it raw.

use super::error::SwapError;
use super::listing::{Lifecycle, Listing, Reservation};
use super::store::{fetch_listing_tx, run_tx, store_listing_tx};
use super::timestamp::TimeStamp;
use sled::transaction::{ConflictableTransactionResult, TransactionalTree, abort};
use std::sync::Arc;

pub struct ClaimArbiter {
    db: Arc<sled::Db>,
}

impl ClaimArbiter {
    pub fn new(db: Arc<sled::Db>) -> Self {
        Self { db }
    }

    /// Atomically reserve `listing_id` for the winning conversation, and
    /// with it the counterpart's offered listing in the exchange case.
    /// Both succeed or both fail. Fails with `AlreadyClaimed` when a
    /// listing is reserved/archived, `NotFound` when it was deleted; the
    /// error payload is the bare id of the listing that failed.
    pub fn reserve(
        &self,
        listing_id: &str,
        winning_conversation_id: &str,
        counter_listing_id: Option<&str>,
    ) -> anyhow::Result<Listing> {
        run_tx(&self.db, |tx| {
            self.claim_in_tx(tx, listing_id, winning_conversation_id, counter_listing_id)
        })
    }

    /// The claim itself, usable inside a larger transaction so the accept
    /// path commits the reservation and the conversation update as one
    /// unit. Reads everything before writing anything, so a caller that
    /// catches the abort leaves no partial claim behind. Returns the
    /// reserved primary listing.
    pub(crate) fn claim_in_tx(
        &self,
        tx: &TransactionalTree,
        listing_id: &str,
        winning_conversation_id: &str,
        counter_listing_id: Option<&str>,
    ) -> ConflictableTransactionResult<Listing, SwapError> {
        let reserved_at = TimeStamp::now();

        // primary listing reserves against the counter listing and vice
        // versa; ids are visited in ascending order so two exchange accepts
        // referencing each other's listings cannot deadlock
        let mut claims: Vec<(&str, Option<String>)> = vec![(
            listing_id,
            counter_listing_id.map(|counter| counter.to_owned()),
        )];
        if let Some(counter) = counter_listing_id {
            claims.push((counter, Some(listing_id.to_owned())));
        }
        claims.sort_by(|a, b| a.0.cmp(b.0));

        let mut loaded = Vec::with_capacity(claims.len());
        for (id, counter) in &claims {
            let listing = match fetch_listing_tx(tx, id)? {
                Some(listing) => listing,
                None => return abort(SwapError::NotFound((*id).to_owned())),
            };
            if !listing.is_available() {
                return abort(SwapError::AlreadyClaimed((*id).to_owned()));
            }
            loaded.push((listing, counter.clone()));
        }

        let mut primary = None;
        for (mut listing, counter) in loaded {
            listing.lifecycle = Lifecycle::Reserved(Reservation {
                conversation_id: winning_conversation_id.to_owned(),
                counter_listing_id: counter,
                reserved_at: reserved_at.clone(),
            });
            store_listing_tx(tx, &listing)?;
            if listing.id == listing_id {
                primary = Some(listing);
            }
        }

        // the primary id is always in `claims`, so this cannot be None
        primary.ok_or_else(|| {
            sled::transaction::ConflictableTransactionError::Abort(SwapError::Conflict(format!(
                "listing {listing_id} missing from its own claim"
            )))
        })
    }
}
