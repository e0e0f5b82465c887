//! Sparse feature indexing.
//!
//! A weight is attached to every `(label, feature)` pair seen in training.
//! Pairs are packed into a [`FeatureKey`] and mapped to dense, stable ids by a
//! [`FeatureBag`]; label and feature *names* live in [`StringBag`]s so that
//! persisted models stay human-readable.

use std::collections::HashMap;

use crate::maxent::MaxentError;

/// Number of distinct labels a key can address (low 8 bits).
pub const MAX_LABELS: usize = 1 << 8;

/// Largest feature index a key can address (upper 24 bits).
pub const MAX_FEATURE_INDEX: usize = 0x00ff_ffff;

/// A `(label, feature)` pair packed as `feature << 8 | label`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct FeatureKey(u32);

impl FeatureKey {
    pub fn new(label: usize, feature: usize) -> Result<Self, MaxentError> {
        if label >= MAX_LABELS {
            return Err(MaxentError::TooManyLabels { limit: MAX_LABELS });
        }
        if feature > MAX_FEATURE_INDEX {
            return Err(MaxentError::FeatureIndexOverflow { index: feature });
        }
        Ok(Self(((feature as u32) << 8) | label as u32))
    }

    pub fn label(self) -> usize {
        (self.0 & 0xff) as usize
    }

    pub fn feature(self) -> usize {
        (self.0 >> 8) as usize
    }

    /// The packed representation.
    pub fn body(self) -> u32 {
        self.0
    }
}

/// Dense id assignment for feature keys. Ids are issued sequentially on first
/// insertion and never reassigned until [`clear`](FeatureBag::clear).
#[derive(Debug, Clone, Default)]
pub struct FeatureBag {
    key2id: HashMap<FeatureKey, usize>,
    id2key: Vec<FeatureKey>,
}

impl FeatureBag {
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns the id of `key`, issuing the next one if it is new.
    pub fn put(&mut self, key: FeatureKey) -> usize {
        if let Some(&id) = self.key2id.get(&key) {
            return id;
        }
        let id = self.id2key.len();
        self.id2key.push(key);
        self.key2id.insert(key, id);
        id
    }

    pub fn id(&self, key: FeatureKey) -> Option<usize> {
        self.key2id.get(&key).copied()
    }

    pub fn key(&self, id: usize) -> Option<FeatureKey> {
        self.id2key.get(id).copied()
    }

    /// Keys in id order.
    pub fn keys(&self) -> &[FeatureKey] {
        &self.id2key
    }

    pub fn len(&self) -> usize {
        self.id2key.len()
    }

    pub fn is_empty(&self) -> bool {
        self.id2key.is_empty()
    }

    pub fn clear(&mut self) {
        self.key2id.clear();
        self.id2key.clear();
    }
}

/// Bidirectional string table with sequential ids.
#[derive(Debug, Clone, Default)]
pub struct StringBag {
    str2id: HashMap<String, usize>,
    id2str: Vec<String>,
}

impl StringBag {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn put(&mut self, s: &str) -> usize {
        if let Some(&id) = self.str2id.get(s) {
            return id;
        }
        let id = self.id2str.len();
        self.id2str.push(s.to_owned());
        self.str2id.insert(s.to_owned(), id);
        id
    }

    pub fn id(&self, s: &str) -> Option<usize> {
        self.str2id.get(s).copied()
    }

    pub fn str(&self, id: usize) -> Option<&str> {
        self.id2str.get(id).map(String::as_str)
    }

    pub fn len(&self) -> usize {
        self.id2str.len()
    }

    pub fn is_empty(&self) -> bool {
        self.id2str.is_empty()
    }

    pub fn clear(&mut self) {
        self.str2id.clear();
        self.id2str.clear();
    }
}
