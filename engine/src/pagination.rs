//! Pagination state recorded from paginated find responses.

use crate::{Fields, Id, Timestamp};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// Query id used when a find does not name one.
pub const DEFAULT_QID: &str = "default";

/// The last page fetched under one query id.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PageInfo {
    /// The query that produced the page, pagination keys included.
    pub query: Fields,
    /// Ids of the page in response order.
    pub ids: Vec<Id>,
    pub total: usize,
    pub limit: Option<usize>,
    pub skip: usize,
    pub queried_at: Timestamp,
}

/// Pagination state of a namespace, keyed by query id.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Pagination {
    pages: BTreeMap<String, PageInfo>,
}

impl Pagination {
    pub fn new() -> Self {
        Self::default()
    }

    /// Record a page, replacing the previous one under the same qid.
    pub fn record(&mut self, qid: Option<&str>, page: PageInfo) {
        self.pages
            .insert(qid.unwrap_or(DEFAULT_QID).to_string(), page);
    }

    pub fn get(&self, qid: &str) -> Option<&PageInfo> {
        self.pages.get(qid)
    }

    /// Drop a removed id from every recorded page.
    pub fn forget(&mut self, id: &Id) {
        for page in self.pages.values_mut() {
            page.ids.retain(|existing| existing != id);
        }
    }

    pub fn iter(&self) -> impl Iterator<Item = (&String, &PageInfo)> {
        self.pages.iter()
    }

    pub fn len(&self) -> usize {
        self.pages.len()
    }

    pub fn is_empty(&self) -> bool {
        self.pages.is_empty()
    }

    pub fn clear(&mut self) {
        self.pages.clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn page(ids: &[i64], total: usize) -> PageInfo {
        PageInfo {
            query: Fields::new(),
            ids: ids.iter().map(|id| Id::from(*id)).collect(),
            total,
            limit: Some(ids.len()),
            skip: 0,
            queried_at: 1_000,
        }
    }

    #[test]
    fn records_under_default_qid() {
        let mut pagination = Pagination::new();
        pagination.record(None, page(&[1, 2], 10));
        pagination.record(Some("sidebar"), page(&[3], 1));

        assert_eq!(pagination.get(DEFAULT_QID).unwrap().total, 10);
        assert_eq!(pagination.get("sidebar").unwrap().ids, vec![Id::from(3)]);

        pagination.record(None, page(&[4], 11));
        assert_eq!(pagination.len(), 2);
        assert_eq!(pagination.get(DEFAULT_QID).unwrap().ids, vec![Id::from(4)]);
    }

    #[test]
    fn forget_removes_id_from_pages() {
        let mut pagination = Pagination::new();
        pagination.record(None, page(&[1, 2], 2));
        pagination.forget(&Id::from(1));
        assert_eq!(pagination.get(DEFAULT_QID).unwrap().ids, vec![Id::from(2)]);
    }
}
