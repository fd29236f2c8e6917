// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! Token generation and key hashing.

use fnv::FnvHasher;
use std::collections::HashSet;
use std::hash::Hasher;

/// Ring position of `key` within `tenant`.
///
/// FNV-1a over the tenant, a separator and the key, folded to 32 bits. Both
/// halves of a call share a trace id, so they always hash to the same
/// position.
#[must_use]
pub fn token_for(tenant: &str, key: &[u8]) -> u32 {
    let mut hasher = FnvHasher::default();
    hasher.write(tenant.as_bytes());
    hasher.write_u8(0);
    hasher.write(key);
    let hash = hasher.finish();
    ((hash >> 32) ^ hash) as u32
}

/// Draws `count` distinct tokens from `rng` that are not in `taken`. The
/// result is sorted.
pub fn generate_tokens(rng: &mut fastrand::Rng, count: usize, taken: &HashSet<u32>) -> Vec<u32> {
    let mut fresh = HashSet::with_capacity(count);
    while fresh.len() < count {
        let candidate = rng.u32(..);
        if !taken.contains(&candidate) {
            fresh.insert(candidate);
        }
    }
    let mut tokens: Vec<u32> = fresh.into_iter().collect();
    tokens.sort_unstable();
    tokens
}
