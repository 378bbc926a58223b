// Copyright The NRDOT Authors
// SPDX-License-Identifier: Apache-2.0

//! Key-set fingerprinting.
//!
//! A fingerprint is a 64-bit xxh3 hash over the sorted (key, value) pairs
//! of an item's identifying attributes. High-entropy keys (trace ids, pod
//! UIDs, ...) are excluded by configurable substring patterns so that one
//! logical series maps to one fingerprint regardless of per-request noise.

use crate::item::{SignalKind, TelemetryItem};
use std::collections::BTreeMap;
use xxhash_rust::xxh3::Xxh3;

/// Separator between key/value tokens in the hashed byte stream. A
/// non-printable byte so `("ab","c")` and `("a","bc")` cannot collide.
const FIELD_SEP: u8 = 0x1f;

/// Computes stable key-set fingerprints for telemetry items.
#[derive(Debug, Clone)]
pub struct Fingerprinter {
    exclude_patterns: Vec<String>,
}

impl Fingerprinter {
    /// Creates a fingerprinter with the given exclude patterns
    /// (case-sensitive substring match on the attribute key).
    #[must_use]
    pub fn new(exclude_patterns: Vec<String>) -> Self {
        Self { exclude_patterns }
    }

    /// True when the key is excluded from fingerprinting.
    fn is_excluded(&self, key: &str) -> bool {
        self.exclude_patterns.iter().any(|p| key.contains(p.as_str()))
    }

    /// Fingerprint of an item's identifying attribute subset.
    ///
    /// Items with no identifying attributes hash to a per-signal-kind
    /// constant; the limiter always passes those.
    #[must_use]
    pub fn fingerprint(&self, item: &TelemetryItem) -> u64 {
        self.fingerprint_attrs(item.kind, &item.attributes)
    }

    /// Fingerprint of an attribute map for the given signal kind.
    ///
    /// `BTreeMap` iteration is already sorted by key, which makes the hash
    /// invariant under producer-side attribute order permutations.
    #[must_use]
    pub fn fingerprint_attrs(
        &self,
        kind: SignalKind,
        attributes: &BTreeMap<String, String>,
    ) -> u64 {
        let mut hasher = Xxh3::new();
        let mut hashed_any = false;
        for (key, value) in attributes {
            if self.is_excluded(key) {
                continue;
            }
            hashed_any = true;
            hasher.update(key.as_bytes());
            hasher.update(&[FIELD_SEP]);
            hasher.update(value.as_bytes());
            hasher.update(&[FIELD_SEP]);
        }
        if !hashed_any {
            return kind_constant(kind);
        }
        hasher.update(&[kind.wire_tag()]);
        hasher.digest()
    }
}

/// The fingerprint assigned to items with zero identifying attributes.
#[must_use]
pub fn kind_constant(kind: SignalKind) -> u64 {
    // Arbitrary fixed values, distinct per kind, outside the normal hash
    // range only in the sense of being reserved by convention.
    match kind {
        SignalKind::Metric => 0x6e72_646f_745f_6d01,
        SignalKind::Span => 0x6e72_646f_745f_7302,
        SignalKind::Log => 0x6e72_646f_745f_6c03,
    }
}
