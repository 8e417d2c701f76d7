//! Collects earlier versions of one object requested with `e:key.v`

use std::collections::BTreeMap;
use std::ops::Range;
use std::sync::Arc;

use simperium_api::ObjectVersionData;

use crate::bucket::{BucketObject, RevisionsCallbacks};

pub(crate) struct RevisionsCollector {
    key: String,
    min_version: u64,
    since_version: u64,
    expected: u64,
    callbacks: Arc<dyn RevisionsCallbacks>,
    revisions: BTreeMap<u64, BucketObject>,
}

impl RevisionsCollector {
    /// `max_count` of 0 collects every version before `since_version`
    pub fn new(key: &str, since_version: u64, max_count: u64, callbacks: Arc<dyn RevisionsCallbacks>) -> Self {
        let min_version = first_version(since_version, max_count);
        Self {
            key: key.to_string(),
            min_version,
            since_version,
            expected: since_version.saturating_sub(min_version),
            callbacks,
            revisions: BTreeMap::new(),
        }
    }

    pub fn requested_versions(&self) -> Range<u64> {
        self.min_version..self.since_version
    }

    pub fn callbacks(&self) -> &Arc<dyn RevisionsCallbacks> {
        &self.callbacks
    }

    /// Whether `data` is one of the versions this collector waits for
    pub fn wants(&self, data: &ObjectVersionData) -> bool {
        data.key() == self.key
            && data.version.version < self.since_version
            && !self.revisions.contains_key(&data.version.version)
    }

    pub fn add(&mut self, version: u64, object: BucketObject) {
        self.revisions.insert(version, object);
    }

    /// A requested version will not arrive
    pub fn decrease_expected(&mut self) {
        self.expected = self.expected.saturating_sub(1);
    }

    pub fn is_complete(&self) -> bool {
        self.revisions.len() as u64 >= self.expected
    }

    pub fn take_revisions(&mut self) -> BTreeMap<u64, BucketObject> {
        std::mem::take(&mut self.revisions)
    }
}

fn first_version(since_version: u64, max_count: u64) -> u64 {
    if max_count > 0 && since_version > max_count {
        (since_version - max_count).max(1)
    } else {
        1
    }
}
