//! Immutable book metadata attached to a listing at creation time.
//!
//! The catalog collaborator hands this core an opaque value object; we keep
//! it content-addressed: the sha256 hex digest of the CBOR encoding is the
//! key under which the metadata is stored, and the reference a listing
//! carries. Two listings of the same edition share one stored row.

use super::error::SwapError;

// Also used for constructing drafts.
// Key is the hash of this struct encoded into CBOR.
#[derive(minicbor::Encode, minicbor::Decode, Debug, Default, Clone, Eq, PartialEq)]
pub struct BookDetails {
    // No ID field, as the ID *is* the hash of this struct
    #[n(0)]
    title: Option<String>,
    #[n(1)]
    author: Option<String>,
    #[n(2)]
    cover_url: Option<String>,
    #[n(3)]
    genre: Option<String>,
    #[n(4)]
    catalog_id: Option<String>, // external catalog reference, opaque here
}

impl BookDetails {
    /// Construct a new builder object, this becomes the basis for a draft
    pub fn new() -> Self {
        Self::default()
    }
    pub fn set_title(mut self, title: &str) -> Self {
        self.title = Some(title.to_owned());
        self
    }
    pub fn set_author(mut self, author: &str) -> Self {
        self.author = Some(author.to_owned());
        self
    }
    pub fn set_cover_url(mut self, url: &str) -> Self {
        self.cover_url = Some(url.to_owned());
        self
    }
    pub fn set_genre(mut self, genre: &str) -> Self {
        self.genre = Some(genre.to_owned());
        self
    }
    pub fn set_catalog_id(mut self, id: &str) -> Self {
        self.catalog_id = Some(id.to_owned());
        self
    }

    pub fn title(&self) -> Option<&str> {
        self.title.as_deref()
    }
    pub fn author(&self) -> Option<&str> {
        self.author.as_deref()
    }

    /// Check required fields, then return the hash of the book and its
    /// contents serialised into CBOR. The hash becomes the storage key.
    pub fn validate_and_finalise(&self) -> anyhow::Result<(String, Vec<u8>)> {
        match &self.title {
            Some(title) if !title.trim().is_empty() => {}
            _ => return Err(SwapError::Validation("book title is required".into()).into()),
        }
        match &self.author {
            Some(author) if !author.trim().is_empty() => {}
            _ => return Err(SwapError::Validation("book author is required".into()).into()),
        }

        let contents = minicbor::to_vec(self)?;
        let hash = sha256::digest(&contents);

        Ok((hash, contents))
    }
}
