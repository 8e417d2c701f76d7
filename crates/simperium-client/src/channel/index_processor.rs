//! Downloads the bucket index page by page
//!
//! Each page lists `{id, v}` entries. Versions the bucket does not have are
//! requested one at a time with `e:key.v`; once the queue drains the next
//! page is requested with the page's mark. The index is complete when the
//! last page is drained and every listed object was stored.

use std::collections::VecDeque;
use std::sync::Arc;

use simperium_api::protocol::{COMMAND_ENTITY, IndexQuery, command};
use simperium_api::{IndexPage, ObjectVersion, ObjectVersionData};
use tracing::{debug, warn};

use super::ChannelContext;
use crate::bucket::ChangeType;

/// Objects stored between two `Index` progress notifications
const PROGRESS_INTERVAL: usize = 10;

pub(crate) struct IndexProcessor {
    ctx: Arc<ChannelContext>,
    change_version: String,
    queue: VecDeque<ObjectVersion>,
    next_query: Option<IndexQuery>,
    received: usize,
    indexed: usize,
    complete: bool,
    notified: bool,
}

impl IndexProcessor {
    pub fn new(ctx: Arc<ChannelContext>, change_version: &str) -> Self {
        Self {
            ctx,
            change_version: change_version.to_string(),
            queue: VecDeque::new(),
            next_query: None,
            received: 0,
            indexed: 0,
            complete: false,
            notified: false,
        }
    }

    pub fn change_version(&self) -> &str {
        &self.change_version
    }

    /// Queues the entries of `page`; false when the page belongs to another
    /// change version.
    pub fn add_index_page(&mut self, page: &IndexPage) -> bool {
        if page.current_version() != self.change_version {
            return false;
        }

        for entry in &page.index {
            self.queue.push_back(ObjectVersion::new(entry.id.clone(), entry.v));
            self.received += 1;
        }
        self.next_query = page.next_mark().map(IndexQuery::from_mark);

        debug!(
            "Index page for {} with {} entries, more pages: {}",
            self.ctx.bucket.name(),
            page.index.len(),
            self.next_query.is_some()
        );
        self.next();
        true
    }

    /// Stores object data requested by this processor; false when the
    /// version was not requested here.
    pub fn add_object_data(&mut self, data: &ObjectVersionData) -> bool {
        let Some(position) = self.queue.iter().position(|version| *version == data.version) else {
            return false;
        };
        self.queue.remove(position);

        if let Err(e) = self.ctx.bucket.add_object_with_ghost(data.to_ghost()) {
            warn!("Unable to store indexed object {}: {}", data.version, e);
        }
        self.object_indexed();
        self.next();
        true
    }

    /// The server does not know a queued version; skips it.
    pub fn skip_version(&mut self, version: &ObjectVersion) -> bool {
        let Some(position) = self.queue.iter().position(|queued| queued == version) else {
            return false;
        };
        self.queue.remove(position);
        self.object_indexed();
        self.next();
        true
    }

    /// Change version to record once every object is stored; yields it once.
    pub fn take_completion(&mut self) -> Option<String> {
        if self.complete && !self.notified && self.received == self.indexed {
            self.notified = true;
            return Some(self.change_version.clone());
        }
        None
    }

    fn object_indexed(&mut self) {
        self.indexed += 1;
        if self.indexed % PROGRESS_INTERVAL == 0 {
            self.ctx.bucket.notify_network_change(ChangeType::Index, None);
        }
    }

    fn next(&mut self) {
        while let Some(version) = self.queue.front() {
            if !self.ctx.bucket.has_key_version(&version.key, version.version) {
                self.ctx.send(command(COMMAND_ENTITY, version));
                return;
            }
            debug!("Already have {}, requesting next object", version);
            self.queue.pop_front();
            self.object_indexed();
        }

        if let Some(query) = self.next_query.take() {
            self.ctx.send(query.to_string());
            return;
        }

        if !self.complete {
            debug!("Done receiving index data for {}", self.ctx.bucket.name());
        }
        self.complete = true;
    }
}
