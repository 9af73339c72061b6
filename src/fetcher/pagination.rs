//! Offset/size pagination over a [`PageSource`]
//!
//! Pages are requested lazily: the next request is only issued when the
//! consumer polls for it. The stream ends after a short page, after an error
//! (yielded once), or when the iteration guard trips.

use crate::fetcher::{FetcherError, FetcherResult, PageSource, PageStream};
use crate::PageResult;
use futures_util::stream;
use std::sync::Arc;
use tracing::debug;

/// Maximum number of pages per stream to prevent runaway pagination
pub const MAX_PAGES: u64 = 1_000_000;

struct Cursor {
    offset: u64,
    pages: u64,
    done: bool,
}

/// Build a lazy page stream for `identifier` starting at `start_offset`
///
/// Restarting after a failure is done by building a new stream at the offset
/// following the last completed page.
pub fn page_stream(
    source: Arc<dyn PageSource>,
    identifier: impl Into<String>,
    page_size: u64,
    start_offset: u64,
) -> PageStream {
    let identifier = identifier.into();
    let page_size = page_size.max(1);

    let cursor = Cursor {
        offset: start_offset,
        pages: 0,
        done: false,
    };

    let stream = stream::unfold(cursor, move |cursor| {
        let source = source.clone();
        let identifier = identifier.clone();

        async move {
            if cursor.done {
                return None;
            }

            if cursor.pages >= MAX_PAGES {
                let err = FetcherError::Parse(format!(
                    "Max pages ({MAX_PAGES}) exceeded for {identifier} - possible infinite loop. Last offset: {}",
                    cursor.offset
                ));
                return Some((Err(err), Cursor { done: true, ..cursor }));
            }

            debug!(
                identifier = %identifier,
                offset = cursor.offset,
                page = cursor.pages + 1,
                "Fetching page"
            );

            match source.fetch_page(&identifier, cursor.offset, page_size).await {
                Ok(page) => {
                    let next = next_cursor(&cursor, &page, page_size);
                    Some((Ok(page), next))
                }
                Err(e) => Some((Err(e), Cursor { done: true, ..cursor })),
            }
        }
    });

    Box::pin(stream)
}

fn next_cursor(cursor: &Cursor, page: &PageResult, page_size: u64) -> Cursor {
    let done = page.is_final || (page.records.len() as u64) < page_size;
    Cursor {
        offset: cursor.offset + page_size,
        pages: cursor.pages + 1,
        done,
    }
}

/// Drain a whole stream into memory. Only meant for small datasets and tests.
pub async fn collect_pages(mut pages: PageStream) -> FetcherResult<Vec<PageResult>> {
    use futures_util::StreamExt;

    let mut all = Vec::new();
    while let Some(page) = pages.next().await {
        all.push(page?);
    }
    Ok(all)
}
