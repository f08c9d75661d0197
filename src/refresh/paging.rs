//! Fetching multi-page listings.

use color_eyre::Result;
use futures::future::try_join_all;
use std::future::Future;
use tracing::debug;

/// One page of a listing, plus the total number of pages.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Page<T> {
  pub items: Vec<T>,
  pub pages: u32,
}

/// Fetch every page of a listing.
///
/// Page 1 reveals the page count; the remaining pages are fetched
/// concurrently. Items are returned in page order.
pub async fn fetch_all_pages<T, F, Fut>(fetch_page: F) -> Result<Vec<T>>
where
  F: Fn(u32) -> Fut,
  Fut: Future<Output = Result<Page<T>>>,
{
  let first = fetch_page(1).await?;
  let mut items = first.items;
  if first.pages <= 1 {
    return Ok(items);
  }

  debug!(pages = first.pages, "Fetching remaining pages");
  let rest = try_join_all((2..=first.pages).map(&fetch_page)).await?;
  for page in rest {
    items.extend(page.items);
  }
  Ok(items)
}
