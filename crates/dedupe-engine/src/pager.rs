use dedupe_api::{ApiError, CatalogApi, Group};
use dedupe_core::Record;
use tracing::{debug, warn};

/// Offset pagination over one identifier group, bounded by the group count.
///
/// Removing a record shifts every later search hit down by one, so callers
/// report removals through [`GroupPager::record_removed`] and the next page
/// starts at the first record not yet handed out.
pub struct GroupPager<'a> {
    group: &'a Group,
    total: u64,
    batch_size: u64,
    offset: u64,
    seen: u64,
    exhausted: bool,
}

impl<'a> GroupPager<'a> {
    pub fn new(group: &'a Group, total: u64, batch_size: u64) -> Self {
        Self {
            group,
            total,
            batch_size: batch_size.max(1),
            offset: 0,
            seen: 0,
            exhausted: false,
        }
    }

    /// Next page, or `None` once `total` records were handed out or the API
    /// returned a short or empty page.
    pub async fn next_page(&mut self, api: &dyn CatalogApi) -> Result<Option<Vec<Record>>, ApiError> {
        if self.exhausted || self.seen >= self.total {
            return Ok(None);
        }

        debug!(
            offset = self.offset,
            rows = self.batch_size,
            seen = self.seen,
            total = self.total,
            "batch fetching records"
        );
        let page = api
            .page_records(self.group, self.offset, self.batch_size)
            .await?;
        if page.is_empty() {
            warn!(
                identifier = %self.group.identifier,
                offset = self.offset,
                seen = self.seen,
                total = self.total,
                "page came back empty before the expected count, treating group as exhausted"
            );
            self.exhausted = true;
            return Ok(None);
        }

        let len = page.len() as u64;
        self.seen += len;
        self.offset += len;
        if len < self.batch_size {
            self.exhausted = true;
        }
        Ok(Some(page))
    }

    /// A record from a page already handed out is gone from the index.
    pub fn record_removed(&mut self) {
        self.offset = self.offset.saturating_sub(1);
    }
}
