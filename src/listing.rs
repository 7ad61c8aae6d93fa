//! Listing entity and its lifecycle.
//!
//! The lifecycle is a payload-carrying enum, so "at most one active
//! reservation" and "reserved, archived and available are mutually
//! exclusive" hold structurally rather than by runtime checks.

use super::timestamp::TimeStamp;
use super::utils;
use chrono::Utc;

#[derive(minicbor::Encode, minicbor::Decode, Debug, Clone, Copy, PartialEq, Eq)]
pub enum ListingKind {
    #[n(0)]
    Gift,
    #[n(1)]
    Exchange,
}

/// Temporary claim a listing enters once a proposal is accepted.
#[derive(minicbor::Encode, minicbor::Decode, Debug, Clone, PartialEq, Eq)]
pub struct Reservation {
    /// The conversation that won the claim.
    #[n(0)]
    pub conversation_id: String,
    /// The listing offered in return (exchange only).
    #[n(1)]
    pub counter_listing_id: Option<String>,
    #[n(2)]
    pub reserved_at: TimeStamp<Utc>,
}

/// Permanent record of where an archived listing went.
#[derive(minicbor::Encode, minicbor::Decode, Debug, Clone, PartialEq, Eq)]
pub struct Disposition {
    #[n(0)]
    pub recipient: String,
    /// Listing received in return. None for gifts and for reserved
    /// exchanges that resolved as a plain gift.
    #[n(1)]
    pub received_listing_id: Option<String>,
    #[n(2)]
    pub archived_at: TimeStamp<Utc>,
}

#[derive(minicbor::Encode, minicbor::Decode, Debug, Clone, PartialEq, Eq)]
pub enum Lifecycle {
    #[n(0)]
    Available,
    #[n(1)]
    Reserved(#[n(0)] Reservation),
    #[n(2)]
    Archived(#[n(0)] Disposition),
}

/// Lifecycle discriminant, used as the `expected` side of the store's
/// compare-and-swap `transition`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LifecycleStage {
    Available,
    Reserved,
    Archived,
}

impl Lifecycle {
    pub fn stage(&self) -> LifecycleStage {
        match self {
            Lifecycle::Available => LifecycleStage::Available,
            Lifecycle::Reserved(_) => LifecycleStage::Reserved,
            Lifecycle::Archived(_) => LifecycleStage::Archived,
        }
    }
}

#[derive(minicbor::Encode, minicbor::Decode, Debug, Clone, PartialEq, Eq)]
pub struct Listing {
    #[n(0)]
    pub id: String, // uuid7, bech32 with "listing_" prefix
    #[n(1)]
    pub owner: String,
    /// Content hash of the stored [`BookDetails`](crate::book::BookDetails).
    #[n(2)]
    pub book_hash: String,
    #[n(3)]
    pub kind: ListingKind,
    #[n(4)]
    pub lifecycle: Lifecycle,
    #[n(5)]
    pub created_at: TimeStamp<Utc>,
}

impl Listing {
    pub fn new(owner: String, book_hash: String, kind: ListingKind) -> anyhow::Result<Self> {
        Ok(Self {
            id: utils::new_uuid_to_bech32("listing_")?,
            owner,
            book_hash,
            kind,
            lifecycle: Lifecycle::Available,
            created_at: TimeStamp::now(),
        })
    }

    pub fn is_available(&self) -> bool {
        matches!(self.lifecycle, Lifecycle::Available)
    }

    pub fn reservation(&self) -> Option<&Reservation> {
        match &self.lifecycle {
            Lifecycle::Reserved(r) => Some(r),
            _ => None,
        }
    }

    pub fn disposition(&self) -> Option<&Disposition> {
        match &self.lifecycle {
            Lifecycle::Archived(d) => Some(d),
            _ => None,
        }
    }
}

/// Filter for `list_available`. Fields are conjunctive; `None` matches all.
#[derive(Debug, Default, Clone)]
pub struct ListingFilter {
    pub kind: Option<ListingKind>,
    /// Hide a user's own listings, e.g. when browsing for something to claim.
    pub exclude_owner: Option<String>,
}

impl ListingFilter {
    pub fn matches(&self, listing: &Listing) -> bool {
        if let Some(kind) = self.kind {
            if listing.kind != kind {
                return false;
            }
        }
        if let Some(owner) = &self.exclude_owner {
            if listing.owner == *owner {
                return false;
            }
        }
        true
    }
}
