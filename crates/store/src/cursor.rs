// Copyright The Phoenix Authors
// SPDX-License-Identifier: Apache-2.0

//! Opaque cursor pagination.
//!
//! A cursor encodes the sort-key tail of the previous page: the creation
//! timestamp and id of its last item, base64url without padding. Listing is
//! ordered by `(created_at, id)` ascending.

use crate::error::Error;
use chrono::{DateTime, Utc};
use data_encoding::BASE64URL_NOPAD;

/// One page of a listing.
#[derive(Debug, Clone)]
pub struct Page<T> {
    /// The items of this page.
    pub items: Vec<T>,
    /// Cursor for the next page; absent on the last page.
    pub next_cursor: Option<String>,
}

/// Encodes the sort-key tail `(created_at, id)` as an opaque cursor.
#[must_use]
pub fn encode(created_at: DateTime<Utc>, id: &str) -> String {
    let raw = format!("{}|{id}", created_at.to_rfc3339());
    BASE64URL_NOPAD.encode(raw.as_bytes())
}

/// Decodes a cursor back into its sort-key tail.
///
/// # Errors
///
/// Returns [`Error::InvalidCursor`] when the cursor is not a cursor this
/// store produced.
pub fn decode(cursor: &str) -> Result<(DateTime<Utc>, String), Error> {
    let raw = BASE64URL_NOPAD
        .decode(cursor.as_bytes())
        .map_err(|e| Error::InvalidCursor {
            details: e.to_string(),
        })?;
    let raw = String::from_utf8(raw).map_err(|e| Error::InvalidCursor {
        details: e.to_string(),
    })?;
    let (ts, id) = raw.split_once('|').ok_or_else(|| Error::InvalidCursor {
        details: "missing separator".to_owned(),
    })?;
    let created_at = DateTime::parse_from_rfc3339(ts)
        .map_err(|e| Error::InvalidCursor {
            details: e.to_string(),
        })?
        .with_timezone(&Utc);
    Ok((created_at, id.to_owned()))
}
