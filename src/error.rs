//! Error taxonomy for the negotiation engine.
//!
//! Service operations return `anyhow::Result` with one of these variants
//! injected via `.into()`; callers recover the code with
//! `downcast_ref::<SwapError>()`.

#[derive(thiserror::Error, Debug)]
pub enum SwapError {
    /// Listing, book or conversation absent from the store.
    #[error("not found: {0}")]
    NotFound(String),
    /// A compare-and-swap lost a race. Internal; the accept path translates
    /// it into a user-facing outcome rather than surfacing it raw.
    #[error("lifecycle conflict: {0}")]
    Conflict(String),
    /// Listing already reserved or archived through another conversation.
    #[error("listing already claimed: {0}")]
    AlreadyClaimed(String),
    /// Operation not legal in the current negotiation state.
    #[error("invalid state: {0}")]
    InvalidState(String),
    /// Actor is not the owner/participant the operation requires.
    #[error("forbidden: {0}")]
    Forbidden(String),
    /// Malformed input, e.g. proposing a listing the actor does not own.
    #[error("validation failed: {0}")]
    Validation(String),
    /// CBOR encode/decode failure surfaced from inside a transaction.
    #[error("codec failure: {0}")]
    Codec(String),
}
