//! Process-wide card registry.
//!
//! The shell layer assigns each attached card a small integer id; every
//! later lookup goes through here. The registry is an explicit object
//! created at program start and torn down at exit, so lookups are always
//! fallible rather than returning dangling sentinels.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, PoisonError};

use crate::error::{MrfError, Result};
use crate::evg::Evg;
use crate::evr::Evr;

/// A registered card of either type.
#[derive(Debug, Clone)]
pub enum Card {
    /// An event receiver.
    Evr(Arc<Evr>),
    /// An event generator.
    Evg(Arc<Evg>),
}

impl Card {
    /// The receiver behind this entry, if it is one.
    #[must_use]
    pub fn as_evr(&self) -> Option<&Arc<Evr>> {
        match self {
            Self::Evr(evr) => Some(evr),
            Self::Evg(_) => None,
        }
    }

    /// The generator behind this entry, if it is one.
    #[must_use]
    pub fn as_evg(&self) -> Option<&Arc<Evg>> {
        match self {
            Self::Evg(evg) => Some(evg),
            Self::Evr(_) => None,
        }
    }
}

/// Integer-id card map. One per process.
#[derive(Debug, Default)]
pub struct CardRegistry {
    cards: Mutex<HashMap<u32, Card>>,
}

impl CardRegistry {
    /// Create an empty registry.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Register `card` under `id`.
    ///
    /// # Errors
    ///
    /// Returns [`MrfError::DuplicateId`] if the id is already taken; the
    /// existing entry is untouched.
    pub fn register(&self, id: u32, card: Card) -> Result<()> {
        let mut cards = self.cards.lock().unwrap_or_else(PoisonError::into_inner);
        if cards.contains_key(&id) {
            return Err(MrfError::DuplicateId { id });
        }
        tracing::info!(id, "registered timing card");
        cards.insert(id, card);
        Ok(())
    }

    /// Look up the card under `id`.
    ///
    /// # Errors
    ///
    /// Returns [`MrfError::NotFound`] when nothing is registered there.
    pub fn get(&self, id: u32) -> Result<Card> {
        self.cards
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .get(&id)
            .cloned()
            .ok_or(MrfError::NotFound { id })
    }

    /// Number of registered cards.
    #[must_use]
    pub fn len(&self) -> usize {
        self.cards
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .len()
    }

    /// Whether the registry is empty.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Drop every registered card (process teardown). Card destructors
    /// stop their worker threads before sub-units are released.
    pub fn clear(&self) {
        self.cards
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clear();
    }
}
