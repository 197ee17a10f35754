//! Page planning: how many pages remain after the seed and how to split them
//! into batches.

use super::request::{FetchBatch, ScopeFilter};

/// What the seed page told us.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SeedPage {
    /// Items on page 1
    pub items: usize,
    /// `rel="next"` page, if any
    pub next_page: Option<u32>,
    /// `rel="last"` page, if any
    pub last_page: Option<u32>,
}

/// Remaining pages after the seed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PagePlan {
    /// Page 1 was the only page
    Done,
    /// The server stated the last page
    Exact {
        /// Last page to fetch (capped by `max_pages`)
        last: u32,
    },
    /// No stated last page: `2..=estimated_last` is fetched in fixed
    /// batches and the final batch keeps going until the data runs out
    Estimated {
        /// Last page covered by fixed batches
        estimated_last: u32,
        /// Hard upper bound
        max_pages: u32,
    },
}

/// Whether a page may be followed by another one.
///
/// Link headers are authoritative: a page carrying pagination links is
/// followed by another exactly when it has a `next` link, even if the server
/// returned fewer items than requested. Without any link information a full
/// page means "maybe" and a short one ends the listing. An empty page always
/// ends it.
pub fn has_more(items: usize, page_size: u32, next_page: Option<u32>, last_page: Option<u32>) -> bool {
    if items == 0 {
        return false;
    }
    if next_page.is_some() || last_page.is_some() {
        return next_page.is_some();
    }
    items >= page_size as usize
}

/// Plan the pages remaining after the seed.
///
/// # Arguments
/// * `seed` - What page 1 returned
/// * `page_size` - Requested items per page
/// * `concurrency` - Worker count, used as the estimate when no last page is stated
/// * `max_pages` - Upper bound on pages per synchronize call
pub fn estimate_total_pages(seed: SeedPage, page_size: u32, concurrency: usize, max_pages: u32) -> PagePlan {
    if max_pages < 2 {
        return PagePlan::Done;
    }

    if let Some(last) = seed.last_page {
        if last < 2 {
            return PagePlan::Done;
        }
        return PagePlan::Exact {
            last: last.min(max_pages),
        };
    }

    if !has_more(seed.items, page_size, seed.next_page, seed.last_page) {
        return PagePlan::Done;
    }

    let estimate = u32::try_from(concurrency.max(1)).unwrap_or(u32::MAX);
    PagePlan::Estimated {
        estimated_last: estimate.saturating_add(1).min(max_pages),
        max_pages,
    }
}

/// Pages per batch: 1 up to 10 remaining pages, 5 up to 50, 10 above, then
/// raised so there are never more than `4 * concurrency` batches.
pub fn choose_batch_size(remaining_pages: u32, concurrency: usize) -> u32 {
    let base = match remaining_pages {
        0..=10 => 1,
        11..=50 => 5,
        _ => 10,
    };
    let max_batches = u32::try_from(concurrency.max(1).saturating_mul(4)).unwrap_or(u32::MAX);
    base.max(remaining_pages.div_ceil(max_batches))
}

/// Split the plan into batches covering every remaining page exactly once.
pub fn partition_batches(plan: PagePlan, concurrency: usize, scope: &ScopeFilter) -> Vec<FetchBatch> {
    let (last, open_until) = match plan {
        PagePlan::Done => return Vec::new(),
        PagePlan::Exact { last } => (last, None),
        PagePlan::Estimated {
            estimated_last,
            max_pages,
        } => (estimated_last, Some(max_pages)),
    };

    let remaining = last.saturating_sub(1);
    if remaining == 0 {
        return Vec::new();
    }
    let size = choose_batch_size(remaining, concurrency);

    let mut batches = Vec::new();
    let mut start = 2u32;
    while start <= last {
        let end = start.saturating_add(size - 1).min(last);
        batches.push(FetchBatch {
            start_page: start,
            end_page: end,
            open_ended: false,
            scope: scope.clone(),
        });
        start = end + 1;
    }

    if let (Some(max_pages), Some(final_batch)) = (open_until, batches.last_mut()) {
        final_batch.open_ended = true;
        final_batch.end_page = max_pages;
    }

    batches
}
