//! Persistent stores over a shared sled keyspace.
//!
//! Everything lives in the default tree under structural key prefixes:
//! listing rows under their bech32 id ("listing_…"), conversations under
//! theirs ("conv_…"), book metadata under "book_" + content hash, the
//! listing/counterpart uniqueness index under "thread_…", and per-user
//! counters under "count_…". Multi-entity atomic units run as sled
//! transactions on that one tree; `transition` is the bare
//! compare-and-swap the claim arbiter builds on.

use super::book::BookDetails;
use super::conversation::Conversation;
use super::error::SwapError;
use super::listing::{Lifecycle, LifecycleStage, Listing, ListingFilter, ListingKind};
use super::timestamp::TimeStamp;
use chrono::Utc;
use sled::transaction::{
    ConflictableTransactionError, ConflictableTransactionResult, TransactionError,
    TransactionalTree,
};
use sled::Batch;
use std::sync::Arc;

pub(crate) fn book_key(hash: &str) -> String {
    format!("book_{hash}")
}

pub(crate) fn thread_key(listing_id: &str, counterpart: &str) -> String {
    // bech32 ids never contain '/', so the separator is unambiguous
    format!("thread_{listing_id}/{counterpart}")
}

/// Run `f` as a sled transaction, translating aborts back into the crate's
/// error taxonomy. The closure may be retried on conflict, so it must not
/// mutate captured state.
pub(crate) fn run_tx<T>(
    db: &sled::Db,
    f: impl Fn(&TransactionalTree) -> ConflictableTransactionResult<T, SwapError>,
) -> anyhow::Result<T> {
    match db.transaction(f) {
        Ok(value) => Ok(value),
        Err(TransactionError::Abort(e)) => Err(e.into()),
        Err(TransactionError::Storage(e)) => Err(e.into()),
    }
}

pub(crate) fn encode_tx<T: minicbor::Encode<()>>(
    value: &T,
) -> Result<Vec<u8>, ConflictableTransactionError<SwapError>> {
    minicbor::to_vec(value)
        .map_err(|e| ConflictableTransactionError::Abort(SwapError::Codec(e.to_string())))
}

pub(crate) fn decode_tx<T: for<'b> minicbor::Decode<'b, ()>>(
    bytes: &[u8],
) -> Result<T, ConflictableTransactionError<SwapError>> {
    minicbor::decode(bytes)
        .map_err(|e| ConflictableTransactionError::Abort(SwapError::Codec(e.to_string())))
}

pub(crate) fn fetch_listing_tx(
    tx: &TransactionalTree,
    id: &str,
) -> ConflictableTransactionResult<Option<Listing>, SwapError> {
    match tx.get(id.as_bytes())? {
        Some(bytes) => Ok(Some(decode_tx(bytes.as_ref())?)),
        None => Ok(None),
    }
}

pub(crate) fn store_listing_tx(
    tx: &TransactionalTree,
    listing: &Listing,
) -> ConflictableTransactionResult<(), SwapError> {
    let bytes = encode_tx(listing)?;
    tx.insert(listing.id.as_bytes(), bytes)?;
    Ok(())
}

pub(crate) fn fetch_conversation_tx(
    tx: &TransactionalTree,
    id: &str,
) -> ConflictableTransactionResult<Option<Conversation>, SwapError> {
    match tx.get(id.as_bytes())? {
        Some(bytes) => Ok(Some(decode_tx(bytes.as_ref())?)),
        None => Ok(None),
    }
}

pub(crate) fn store_conversation_tx(
    tx: &TransactionalTree,
    conversation: &Conversation,
) -> ConflictableTransactionResult<(), SwapError> {
    let bytes = encode_tx(conversation)?;
    tx.insert(conversation.id.as_bytes(), bytes)?;
    Ok(())
}

/// Persistent record of listings and their book metadata.
pub struct ListingStore {
    db: Arc<sled::Db>,
}

impl ListingStore {
    pub fn new(db: Arc<sled::Db>) -> Self {
        Self { db }
    }

    /// Validate the book, then batch-insert metadata row and listing row.
    pub fn create(
        &self,
        owner: String,
        book: &BookDetails,
        kind: ListingKind,
    ) -> anyhow::Result<Listing> {
        let (book_hash, book_cbor) = book.validate_and_finalise()?;
        let listing = Listing::new(owner, book_hash.clone(), kind)?;

        let mut batch = Batch::default();
        batch.insert(book_key(&book_hash).as_bytes(), book_cbor);
        batch.insert(listing.id.as_bytes(), minicbor::to_vec(&listing)?);
        self.db.apply_batch(batch)?;

        Ok(listing)
    }

    pub fn get(&self, id: &str) -> anyhow::Result<Listing> {
        let bytes = self
            .db
            .get(id.as_bytes())?
            .ok_or_else(|| SwapError::NotFound(format!("listing {id}")))?;
        Ok(minicbor::decode(bytes.as_ref())?)
    }

    pub fn book(&self, hash: &str) -> anyhow::Result<BookDetails> {
        let bytes = self
            .db
            .get(book_key(hash).as_bytes())?
            .ok_or_else(|| SwapError::NotFound(format!("book {hash}")))?;
        Ok(minicbor::decode(bytes.as_ref())?)
    }

    /// Available listings matching the filter. A plain scan; readers never
    /// block writers and may trail in-flight reservations by a moment.
    pub fn list_available(&self, filter: &ListingFilter) -> anyhow::Result<Vec<Listing>> {
        let mut out = Vec::new();
        for row in self.db.scan_prefix("listing_") {
            let (_, bytes) = row?;
            let listing: Listing = minicbor::decode(bytes.as_ref())?;
            if listing.is_available() && filter.matches(&listing) {
                out.push(listing);
            }
        }
        Ok(out)
    }

    /// Single-shot compare-and-swap on the listing row: fails with
    /// `Conflict` when the stored lifecycle no longer matches `expected`.
    /// Never retried here; re-validating state is the caller's job.
    pub fn transition(
        &self,
        id: &str,
        expected: LifecycleStage,
        next: Lifecycle,
    ) -> anyhow::Result<Listing> {
        let current = self
            .db
            .get(id.as_bytes())?
            .ok_or_else(|| SwapError::NotFound(format!("listing {id}")))?;
        let mut listing: Listing = minicbor::decode(current.as_ref())?;

        if listing.lifecycle.stage() != expected {
            return Err(SwapError::Conflict(format!(
                "listing {id} is {:?}, expected {expected:?}",
                listing.lifecycle.stage()
            ))
            .into());
        }

        listing.lifecycle = next;
        let swapped = self.db.compare_and_swap(
            id.as_bytes(),
            Some(&current),
            Some(minicbor::to_vec(&listing)?),
        )?;
        match swapped {
            Ok(()) => Ok(listing),
            Err(_) => Err(SwapError::Conflict(format!("listing {id} changed concurrently")).into()),
        }
    }
}

/// Persistent record of conversations plus the {listing, counterpart}
/// uniqueness index.
pub struct ConversationStore {
    db: Arc<sled::Db>,
}

impl ConversationStore {
    pub fn new(db: Arc<sled::Db>) -> Self {
        Self { db }
    }

    /// Open a conversation against a listing, or hand back the existing one
    /// for this {listing, counterpart} pair. The boolean is true when the
    /// conversation was freshly created.
    pub fn open_or_reuse(
        &self,
        listing: &Listing,
        counterpart: &str,
    ) -> anyhow::Result<(Conversation, bool)> {
        let key = thread_key(&listing.id, counterpart);
        // minted up front so transaction retries reuse the same id
        let fresh = Conversation::new(
            listing.id.clone(),
            listing.owner.clone(),
            counterpart.to_owned(),
        )?;

        run_tx(&self.db, |tx| {
            if let Some(id_bytes) = tx.get(key.as_bytes())? {
                let id = String::from_utf8_lossy(id_bytes.as_ref()).into_owned();
                let existing = fetch_conversation_tx(tx, &id)?.ok_or_else(|| {
                    ConflictableTransactionError::Abort(SwapError::NotFound(format!(
                        "conversation {id}"
                    )))
                })?;
                return Ok((existing, false));
            }

            store_conversation_tx(tx, &fresh)?;
            tx.insert(key.as_bytes(), fresh.id.as_bytes())?;
            Ok((fresh.clone(), true))
        })
    }

    pub fn get(&self, id: &str) -> anyhow::Result<Conversation> {
        let bytes = self
            .db
            .get(id.as_bytes())?
            .ok_or_else(|| SwapError::NotFound(format!("conversation {id}")))?;
        Ok(minicbor::decode(bytes.as_ref())?)
    }

    /// Plain last-write-wins overwrite. Callers racing against negotiation
    /// transitions must go through the transaction helpers instead.
    pub fn save(&self, conversation: &Conversation) -> anyhow::Result<()> {
        self.db
            .insert(conversation.id.as_bytes(), minicbor::to_vec(conversation)?)?;
        Ok(())
    }

    /// Advance the notification debounce watermark on the current row.
    /// Re-fetches inside the transaction, so a transition committed between
    /// the caller's snapshot and this call is never overwritten.
    pub fn touch_notified(&self, id: &str, at: &TimeStamp<Utc>) -> anyhow::Result<()> {
        run_tx(&self.db, |tx| {
            if let Some(mut conversation) = fetch_conversation_tx(tx, id)? {
                conversation.last_notified_at = Some(at.clone());
                store_conversation_tx(tx, &conversation)?;
            }
            Ok(())
        })
    }

    /// Every conversation the user participates in.
    pub fn for_user(&self, user: &str) -> anyhow::Result<Vec<Conversation>> {
        let mut out = Vec::new();
        for row in self.db.scan_prefix("conv_") {
            let (_, bytes) = row?;
            let conversation: Conversation = minicbor::decode(bytes.as_ref())?;
            if conversation.is_participant(user) {
                out.push(conversation);
            }
        }
        Ok(out)
    }

    /// Conversation ids opened against a listing, via the thread index.
    pub fn ids_for_listing(&self, listing_id: &str) -> anyhow::Result<Vec<String>> {
        let mut out = Vec::new();
        for row in self.db.scan_prefix(format!("thread_{listing_id}/")) {
            let (_, id_bytes) = row?;
            out.push(String::from_utf8_lossy(id_bytes.as_ref()).into_owned());
        }
        Ok(out)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::book::BookDetails;
    use crate::listing::Reservation;
    use crate::timestamp::TimeStamp;
    use crate::utils::new_uuid_to_bech32;
    use tempfile::tempdir;

    fn open_db(name: &str) -> (tempfile::TempDir, Arc<sled::Db>) {
        let dir = tempdir().unwrap();
        let db = sled::open(dir.path().join(name)).unwrap();
        (dir, Arc::new(db))
    }

    fn sample_book() -> BookDetails {
        BookDetails::new()
            .set_title("A Wizard of Earthsea")
            .set_author("Ursula K. Le Guin")
    }

    #[test]
    fn create_stores_book_and_listing() {
        let (_dir, db) = open_db("create.db");
        let store = ListingStore::new(db);
        let owner = new_uuid_to_bech32("user_").unwrap();

        let listing = store
            .create(owner.clone(), &sample_book(), ListingKind::Gift)
            .unwrap();

        let loaded = store.get(&listing.id).unwrap();
        assert_eq!(loaded, listing);

        let book = store.book(&listing.book_hash).unwrap();
        assert_eq!(book.title(), Some("A Wizard of Earthsea"));
    }

    #[test]
    fn transition_rejects_wrong_expectation() {
        let (_dir, db) = open_db("transition.db");
        let store = ListingStore::new(db);
        let owner = new_uuid_to_bech32("user_").unwrap();
        let listing = store
            .create(owner, &sample_book(), ListingKind::Gift)
            .unwrap();

        let reserved = store
            .transition(
                &listing.id,
                LifecycleStage::Available,
                Lifecycle::Reserved(Reservation {
                    conversation_id: "conv_w".into(),
                    counter_listing_id: None,
                    reserved_at: TimeStamp::now(),
                }),
            )
            .unwrap();
        assert!(reserved.reservation().is_some());

        // second reservation attempt must observe the conflict
        let err = store
            .transition(
                &listing.id,
                LifecycleStage::Available,
                Lifecycle::Reserved(Reservation {
                    conversation_id: "conv_l".into(),
                    counter_listing_id: None,
                    reserved_at: TimeStamp::now(),
                }),
            )
            .unwrap_err();
        assert!(matches!(
            err.downcast_ref::<SwapError>(),
            Some(SwapError::Conflict(_))
        ));
    }

    #[test]
    fn list_available_skips_reserved_rows() {
        let (_dir, db) = open_db("list.db");
        let store = ListingStore::new(db);
        let owner = new_uuid_to_bech32("user_").unwrap();

        let keep = store
            .create(owner.clone(), &sample_book(), ListingKind::Gift)
            .unwrap();
        let hide = store
            .create(
                owner,
                &BookDetails::new().set_title("Dune").set_author("Frank Herbert"),
                ListingKind::Exchange,
            )
            .unwrap();
        store
            .transition(
                &hide.id,
                LifecycleStage::Available,
                Lifecycle::Reserved(Reservation {
                    conversation_id: "conv_w".into(),
                    counter_listing_id: None,
                    reserved_at: TimeStamp::now(),
                }),
            )
            .unwrap();

        let available = store.list_available(&ListingFilter::default()).unwrap();
        assert_eq!(available.len(), 1);
        assert_eq!(available[0].id, keep.id);
    }

    #[test]
    fn open_or_reuse_is_unique_per_pair() {
        let (_dir, db) = open_db("reuse.db");
        let listings = ListingStore::new(db.clone());
        let conversations = ConversationStore::new(db);
        let owner = new_uuid_to_bech32("user_").unwrap();
        let guest = new_uuid_to_bech32("user_").unwrap();
        let other = new_uuid_to_bech32("user_").unwrap();

        let listing = listings
            .create(owner, &sample_book(), ListingKind::Gift)
            .unwrap();

        let (first, created) = conversations.open_or_reuse(&listing, &guest).unwrap();
        assert!(created);
        let (second, created) = conversations.open_or_reuse(&listing, &guest).unwrap();
        assert!(!created);
        assert_eq!(first.id, second.id);

        let (third, created) = conversations.open_or_reuse(&listing, &other).unwrap();
        assert!(created);
        assert_ne!(first.id, third.id);

        let ids = conversations.ids_for_listing(&listing.id).unwrap();
        assert_eq!(ids.len(), 2);
    }
}
