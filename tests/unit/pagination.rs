//! Unit tests for page planning and batch partitioning

use ghnotify::sync::pagination::has_more;
use ghnotify::sync::{
    choose_batch_size, estimate_total_pages, partition_batches, FetchBatch, PagePlan, ScopeFilter,
    SeedPage,
};

fn covered_pages(batches: &[FetchBatch]) -> Vec<u32> {
    batches.iter().flat_map(|b| b.start_page..=b.end_page).collect()
}

#[test]
fn test_single_page_needs_no_batches() {
    let seed = SeedPage {
        items: 12,
        next_page: None,
        last_page: None,
    };
    let plan = estimate_total_pages(seed, 50, 4, 100);
    assert_eq!(plan, PagePlan::Done);
    assert!(partition_batches(plan, 4, &ScopeFilter::all()).is_empty());
}

#[test]
fn test_exact_plan_from_last_link() {
    let seed = SeedPage {
        items: 50,
        next_page: Some(2),
        last_page: Some(40),
    };
    let plan = estimate_total_pages(seed, 50, 4, 100);
    assert_eq!(plan, PagePlan::Exact { last: 40 });

    let batches = partition_batches(plan, 4, &ScopeFilter::all());
    assert_eq!(covered_pages(&batches), (2..=40).collect::<Vec<_>>());
    // 39 pages: batches of 5
    assert_eq!(batches.len(), 8);
    assert!(batches.iter().all(|b| b.end_page - b.start_page < 5));
}

#[test]
fn test_last_link_is_capped_by_max_pages() {
    let seed = SeedPage {
        items: 50,
        next_page: Some(2),
        last_page: Some(1000),
    };
    let plan = estimate_total_pages(seed, 50, 8, 100);
    let batches = partition_batches(plan, 8, &ScopeFilter::all());
    assert_eq!(batches.last().map(|b| b.end_page), Some(100));
    assert!(batches.len() <= 32);
}

#[test]
fn test_estimated_plan_ends_with_open_batch() {
    let seed = SeedPage {
        items: 50,
        next_page: Some(2),
        last_page: None,
    };
    let plan = estimate_total_pages(seed, 50, 3, 100);
    assert_eq!(
        plan,
        PagePlan::Estimated {
            estimated_last: 4,
            max_pages: 100
        }
    );

    let scope = ScopeFilter::organization("octo");
    let batches = partition_batches(plan, 3, &scope);
    assert_eq!(batches.len(), 3);
    assert!(batches[..2].iter().all(|b| !b.open_ended));
    let last = batches.last().unwrap();
    assert!(last.open_ended);
    assert_eq!((last.start_page, last.end_page), (4, 100));
    assert!(batches.iter().all(|b| b.scope == scope));
    assert_eq!(last.to_string(), "pages 4.. (max 100)");
}

#[test]
fn test_batch_size_grows_with_remaining_pages() {
    let mut previous = 0;
    for remaining in 1..=500 {
        let size = choose_batch_size(remaining, 4);
        assert!(size >= previous, "size shrank at {remaining}");
        assert!(remaining.div_ceil(size) <= 16, "too many batches at {remaining}");
        previous = size;
    }
}

#[test]
fn test_has_more_rules() {
    // Empty page always ends the listing
    assert!(!has_more(0, 50, Some(2), Some(3)));
    // Short page with a next link: the server capped the page size
    assert!(has_more(2, 50, Some(2), Some(3)));
    // Short page without link information ends the listing
    assert!(!has_more(2, 50, None, None));
    // Next link is authoritative
    assert!(has_more(50, 50, Some(2), Some(3)));
    // Full page, last link, no next: this was the last page
    assert!(!has_more(50, 50, None, Some(3)));
    // Full page, no link information: maybe
    assert!(has_more(50, 50, None, None));
}
