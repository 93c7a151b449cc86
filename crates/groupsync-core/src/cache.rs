//! Run-scoped memoization of cross-system identifier lookups.
//!
//! Entries are never invalidated; a cache lives exactly as long as the
//! [`crate::Reconciler`] that owns it, so a fresh run always starts cold.

use std::collections::HashMap;
use std::hash::Hash;

use crate::model::{
    CommunityGroupId, CommunityMemberId, ContactId, DirectoryGroupId, GroupPair, MirrorKind,
};

/// Result of consulting the cache.
#[derive(Debug, Clone, Copy, Eq, PartialEq)]
pub enum Lookup<T> {
    Hit(T),
    /// An earlier lookup in this run found nothing; do not ask again.
    KnownAbsent,
    Miss,
}

#[derive(Debug, Clone, Copy, Default, Eq, PartialEq)]
pub struct CacheStats {
    pub hits: u64,
    pub misses: u64,
}

#[derive(Debug)]
struct Memo<K, V> {
    entries: HashMap<K, Option<V>>,
}

impl<K: Eq + Hash, V: Copy> Memo<K, V> {
    fn new() -> Self {
        Self { entries: HashMap::new() }
    }

    fn lookup(&self, key: &K, stats: &mut CacheStats) -> Lookup<V> {
        match self.entries.get(key) {
            Some(Some(value)) => {
                stats.hits += 1;
                Lookup::Hit(*value)
            }
            Some(None) => {
                stats.hits += 1;
                Lookup::KnownAbsent
            }
            None => {
                stats.misses += 1;
                Lookup::Miss
            }
        }
    }

    fn store(&mut self, key: K, value: Option<V>) {
        self.entries.insert(key, value);
    }

    fn forget(&mut self, key: &K) {
        self.entries.remove(key);
    }
}

#[derive(Debug)]
pub struct CorrespondenceCache {
    pairs: Memo<CommunityGroupId, GroupPair>,
    contacts: Memo<CommunityMemberId, ContactId>,
    members: Memo<ContactId, CommunityMemberId>,
    mirrors: Memo<DirectoryGroupId, (CommunityGroupId, MirrorKind)>,
    container: Option<DirectoryGroupId>,
    stats: CacheStats,
}

impl Default for CorrespondenceCache {
    fn default() -> Self {
        Self::new()
    }
}

impl CorrespondenceCache {
    #[must_use]
    pub fn new() -> Self {
        Self {
            pairs: Memo::new(),
            contacts: Memo::new(),
            members: Memo::new(),
            mirrors: Memo::new(),
            container: None,
            stats: CacheStats::default(),
        }
    }

    pub fn lookup_pair(&mut self, group: CommunityGroupId) -> Lookup<GroupPair> {
        self.pairs.lookup(&group, &mut self.stats)
    }

    /// Record a resolved pair (or its absence). A found pair also primes the
    /// reverse mirror-to-group entries.
    pub fn store_pair(&mut self, group: CommunityGroupId, pair: Option<GroupPair>) {
        if let Some(pair) = pair {
            self.mirrors.store(pair.membership, Some((group, MirrorKind::Membership)));
            self.mirrors.store(pair.access, Some((group, MirrorKind::AccessControl)));
        }
        self.pairs.store(group, pair);
    }

    /// Drop a pair after its mirrors were deleted in this run.
    pub fn forget_pair(&mut self, group: CommunityGroupId) {
        if let Some(Some(pair)) = self.pairs.entries.get(&group).copied() {
            self.mirrors.forget(&pair.membership);
            self.mirrors.forget(&pair.access);
        }
        self.pairs.forget(&group);
    }

    pub fn lookup_contact(&mut self, member: CommunityMemberId) -> Lookup<ContactId> {
        self.contacts.lookup(&member, &mut self.stats)
    }

    pub fn store_contact(&mut self, member: CommunityMemberId, contact: Option<ContactId>) {
        if let Some(contact) = contact {
            self.members.store(contact, Some(member));
        }
        self.contacts.store(member, contact);
    }

    pub fn lookup_member(&mut self, contact: ContactId) -> Lookup<CommunityMemberId> {
        self.members.lookup(&contact, &mut self.stats)
    }

    pub fn store_member(&mut self, contact: ContactId, member: Option<CommunityMemberId>) {
        if let Some(member) = member {
            self.contacts.store(member, Some(contact));
        }
        self.members.store(contact, member);
    }

    pub fn lookup_mirror(
        &mut self,
        group: DirectoryGroupId,
    ) -> Lookup<(CommunityGroupId, MirrorKind)> {
        self.mirrors.lookup(&group, &mut self.stats)
    }

    pub fn store_mirror(
        &mut self,
        group: DirectoryGroupId,
        source: Option<(CommunityGroupId, MirrorKind)>,
    ) {
        self.mirrors.store(group, source);
    }

    #[must_use]
    pub fn container(&self) -> Option<DirectoryGroupId> {
        self.container
    }

    pub fn store_container(&mut self, group: DirectoryGroupId) {
        self.container = Some(group);
    }

    #[must_use]
    pub fn stats(&self) -> CacheStats {
        self.stats
    }
}
