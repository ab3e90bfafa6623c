//! Raw platform activity -> canonical events.
//!
//! Feed events go through a dispatch table keyed by the raw type tag, one
//! [`ShapeNormalizer`] per payload shape. Reaction listings, discussions and
//! batch listings have their own entry points so every producer shares the
//! same mapping rules.

mod listings;
mod shapes;

use std::collections::HashMap;

use chaosfeed_core::NewEvent;
use chaosfeed_github::RawFeedEvent;
use chrono::{DateTime, Utc};
use serde::de::DeserializeOwned;
use thiserror::Error;
use tracing::debug;

pub use listings::{
    normalize_discussion, normalize_fork, normalize_listed_comment, normalize_listed_issue,
    normalize_listed_pull_request, normalize_reaction, normalize_stargazer, rest_reaction_content,
    ReactionParent,
};

pub const CRATE_NAME: &str = "chaosfeed-normalize";

#[derive(Debug, Error)]
pub enum NormalizeError {
    #[error("malformed {raw_type} payload: {source}")]
    Payload {
        raw_type: &'static str,
        #[source]
        source: serde_json::Error,
    },
}

/// A store-side instruction produced instead of a new event.
#[derive(Debug, Clone, PartialEq)]
pub enum Mutation {
    /// Replace the stored payload and push `previous_body` onto edit history.
    EditComment {
        comment_id: i64,
        payload: serde_json::Value,
        previous_body: String,
        edited_at: DateTime<Utc>,
    },
    DeleteComment {
        comment_id: i64,
    },
}

/// Lifecycle transition of a tracked pull request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum OpenItemChange {
    Opened { number: i32, title: Option<String> },
    Closed { number: i32 },
}

/// Everything one raw event turns into. Events are ordered parent first.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct Normalized {
    pub events: Vec<NewEvent>,
    pub mutation: Option<Mutation>,
    pub open_item: Option<OpenItemChange>,
}

impl Normalized {
    pub fn empty() -> Self {
        Self::default()
    }

    pub fn event(event: NewEvent) -> Self {
        Self {
            events: vec![event],
            ..Self::default()
        }
    }

    pub fn mutation(mutation: Mutation) -> Self {
        Self {
            mutation: Some(mutation),
            ..Self::default()
        }
    }

    pub fn with_open_item(mut self, change: OpenItemChange) -> Self {
        self.open_item = Some(change);
        self
    }

    pub fn is_empty(&self) -> bool {
        self.events.is_empty() && self.mutation.is_none() && self.open_item.is_none()
    }
}

/// Strategy for one raw feed payload shape.
pub trait ShapeNormalizer: Send + Sync {
    fn raw_type(&self) -> &'static str;

    fn normalize(&self, raw: &RawFeedEvent) -> Result<Normalized, NormalizeError>;
}

pub(crate) fn decode_payload<T: DeserializeOwned>(
    raw_type: &'static str,
    raw: &RawFeedEvent,
) -> Result<T, NormalizeError> {
    T::deserialize(&raw.payload).map_err(|source| NormalizeError::Payload { raw_type, source })
}

/// Dispatch table over raw type tags.
pub struct Normalizer {
    table: HashMap<&'static str, Box<dyn ShapeNormalizer>>,
}

impl std::fmt::Debug for Normalizer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Normalizer")
            .field("raw_types", &self.supported_types())
            .finish()
    }
}

impl Default for Normalizer {
    fn default() -> Self {
        Self::standard()
    }
}

impl Normalizer {
    pub fn empty() -> Self {
        Self {
            table: HashMap::new(),
        }
    }

    /// Table covering every feed type the canonical vocabulary tracks.
    pub fn standard() -> Self {
        let mut normalizer = Self::empty();
        for shape in shapes::all() {
            normalizer.register(shape);
        }
        normalizer
    }

    /// Adds or replaces the strategy for `shape.raw_type()`.
    pub fn register(&mut self, shape: Box<dyn ShapeNormalizer>) {
        self.table.insert(shape.raw_type(), shape);
    }

    pub fn shape_for(&self, raw_type: &str) -> Option<&dyn ShapeNormalizer> {
        self.table.get(raw_type).map(|shape| shape.as_ref())
    }

    pub fn supported_types(&self) -> Vec<&'static str> {
        let mut types: Vec<_> = self.table.keys().copied().collect();
        types.sort_unstable();
        types
    }

    /// Unknown type tags yield an empty outcome, never an error.
    pub fn normalize(&self, raw: &RawFeedEvent) -> Result<Normalized, NormalizeError> {
        match self.shape_for(&raw.event_type) {
            Some(shape) => shape.normalize(raw),
            None => {
                debug!(raw_type = %raw.event_type, event_id = %raw.id, "unknown feed event type, skipping");
                Ok(Normalized::empty())
            }
        }
    }
}
