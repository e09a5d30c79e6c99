//! Represents a logical bucket — a top-level container for objects.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sqlx::FromRow;

/// A storage bucket whose contents may be replicated to backup targets.
///
/// The engine only reads buckets; creation and deletion belong to the
/// external configuration API.
#[derive(Serialize, Deserialize, Clone, FromRow, Debug)]
pub struct Bucket {
    /// Immutable integer identifier assigned by the storage engine.
    pub id: i64,

    /// Globally unique bucket name.
    pub name: String,

    /// When this bucket was created.
    pub created_at: DateTime<Utc>,
}
