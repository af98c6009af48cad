//! Request descriptions and explicit pagination.

use crate::envelope::PageSlice;
use crate::Provider;

/// One outbound call, described without transport concerns.
///
/// The caller appends the service key, composes the provider base URL with
/// [`ProviderRequest::endpoint`], and executes the GET. Parameter order is
/// preserved so archived requests replay byte-identically.
#[derive(Debug, Clone)]
pub struct ProviderRequest {
    pub provider: Provider,
    /// Path segment below the provider base URL, e.g. `areaBasedList2`.
    pub endpoint: String,
    /// Query parameters, excluding `serviceKey`.
    pub params: Vec<(String, String)>,
}

impl ProviderRequest {
    pub fn new(provider: Provider, endpoint: impl Into<String>) -> Self {
        Self {
            provider,
            endpoint: endpoint.into(),
            params: Vec::new(),
        }
    }

    pub fn param(mut self, key: &str, value: impl Into<String>) -> Self {
        self.params.push((key.to_string(), value.into()));
        self
    }

    /// Set `pageNo`/`numOfRows`, replacing any previous paging params.
    pub fn paged(mut self, page_no: i64, num_of_rows: i64) -> Self {
        self.params
            .retain(|(k, _)| k != "pageNo" && k != "numOfRows");
        self.params.push(("pageNo".into(), page_no.to_string()));
        self.params
            .push(("numOfRows".into(), num_of_rows.to_string()));
        self
    }

    /// Look up a parameter value (used by archival metadata).
    pub fn get_param(&self, key: &str) -> Option<&str> {
        self.params
            .iter()
            .find(|(k, _)| k == key)
            .map(|(_, v)| v.as_str())
    }
}

/// Explicit page cursor for item-listing endpoints.
///
/// End of stream is a value, not an error: [`PageCursor::next_page`] returns
/// `None` once every record reported by `totalCount` has been observed, or
/// once a page comes back empty.
#[derive(Debug, Clone)]
pub struct PageCursor {
    num_of_rows: i64,
    next_page: i64,
    fetched: i64,
    total: Option<i64>,
    finished: bool,
}

impl PageCursor {
    pub fn new(num_of_rows: i64) -> Self {
        Self {
            num_of_rows,
            next_page: 1,
            fetched: 0,
            total: None,
            finished: false,
        }
    }

    /// Page number to request next, or `None` when the stream is exhausted.
    pub fn next_page(&self) -> Option<i64> {
        if self.finished {
            None
        } else {
            Some(self.next_page)
        }
    }

    pub fn num_of_rows(&self) -> i64 {
        self.num_of_rows
    }

    /// Records fetched so far.
    pub fn fetched(&self) -> i64 {
        self.fetched
    }

    /// Feed back one decoded page and advance the cursor.
    pub fn observe<T>(&mut self, page: &PageSlice<T>) {
        self.fetched += page.items.len() as i64;
        self.total = Some(page.total_count);
        self.next_page += 1;

        if page.items.is_empty() || self.fetched >= page.total_count {
            self.finished = true;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn slice(n: usize, total: i64) -> PageSlice<u32> {
        PageSlice {
            items: vec![0; n],
            page_no: 0,
            num_of_rows: 100,
            total_count: total,
        }
    }

    #[test]
    fn cursor_walks_until_total_count() {
        let mut cursor = PageCursor::new(100);
        assert_eq!(cursor.next_page(), Some(1));

        cursor.observe(&slice(100, 250));
        assert_eq!(cursor.next_page(), Some(2));

        cursor.observe(&slice(100, 250));
        assert_eq!(cursor.next_page(), Some(3));

        cursor.observe(&slice(50, 250));
        assert_eq!(cursor.next_page(), None);
        assert_eq!(cursor.fetched(), 250);
    }

    #[test]
    fn empty_page_terminates_the_stream() {
        let mut cursor = PageCursor::new(100);
        cursor.observe(&slice(0, 9999));
        assert_eq!(cursor.next_page(), None);
    }

    #[test]
    fn paged_replaces_previous_paging_params() {
        let req = ProviderRequest::new(Provider::Kto, "areaBasedList2")
            .paged(1, 100)
            .paged(2, 100);
        assert_eq!(req.get_param("pageNo"), Some("2"));
        assert_eq!(
            req.params.iter().filter(|(k, _)| k == "pageNo").count(),
            1
        );
    }
}
