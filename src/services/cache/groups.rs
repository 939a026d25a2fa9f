use std::collections::{HashMap, HashSet};
use std::sync::Mutex;

use crate::services::cache::keys::KeyScheme;
use crate::services::lock::mutex_lock;

const SOURCE: &str = "cache::groups";

pub const DEFAULT_MAX_INDEXED_KEYS: usize = 100_000;

/// In-process index of keys per group (namespace).
///
/// Entries that expire inside the backend stay here until `retain_live` runs;
/// members may be stale and every consumer must tolerate deleting a key that no
/// longer exists. The index holds at most `max_keys` members.
/// All mutations happen under one lock, so add/remove/take never interleave.
#[derive(Debug)]
pub struct KeyGroupIndex {
    groups: Mutex<HashMap<String, HashSet<String>>>,
    max_keys: usize,
}

impl Default for KeyGroupIndex {
    fn default() -> Self {
        Self::with_limit(DEFAULT_MAX_INDEXED_KEYS)
    }
}

impl KeyGroupIndex {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_limit(max_keys: usize) -> Self {
        Self {
            groups: Mutex::new(HashMap::new()),
            max_keys,
        }
    }

    /// Index `key` under its group. Returns `false` when the index is full and
    /// `key` is not already a member.
    pub fn add(&self, key: &str) -> bool {
        let scheme = KeyScheme::parse(key);
        let mut groups = mutex_lock(&self.groups, SOURCE, "add");

        if groups
            .get(scheme.group())
            .is_some_and(|members| members.contains(key))
        {
            return true;
        }
        if groups.values().map(HashSet::len).sum::<usize>() >= self.max_keys {
            return false;
        }

        groups
            .entry(scheme.group().to_string())
            .or_default()
            .insert(key.to_string());
        true
    }

    /// Drop members missing from `live`. Returns how many were dropped.
    pub fn retain_live(&self, live: &HashSet<String>) -> usize {
        let mut groups = mutex_lock(&self.groups, SOURCE, "retain_live");
        let mut dropped = 0;
        groups.retain(|_, members| {
            let before = members.len();
            members.retain(|key| live.contains(key));
            dropped += before - members.len();
            !members.is_empty()
        });
        dropped
    }

    pub fn remove(&self, key: &str) {
        let scheme = KeyScheme::parse(key);
        let mut groups = mutex_lock(&self.groups, SOURCE, "remove");
        if let Some(members) = groups.get_mut(scheme.group()) {
            members.remove(key);
            if members.is_empty() {
                groups.remove(scheme.group());
            }
        }
    }

    /// Detach and return every member of `group`.
    pub fn take_group(&self, group: &str) -> Vec<String> {
        mutex_lock(&self.groups, SOURCE, "take_group")
            .remove(group)
            .map(|members| members.into_iter().collect())
            .unwrap_or_default()
    }

    pub fn clear(&self) {
        mutex_lock(&self.groups, SOURCE, "clear").clear();
    }

    pub fn group_count(&self) -> usize {
        mutex_lock(&self.groups, SOURCE, "group_count").len()
    }

    pub fn key_count(&self) -> usize {
        mutex_lock(&self.groups, SOURCE, "key_count")
            .values()
            .map(HashSet::len)
            .sum()
    }
}
