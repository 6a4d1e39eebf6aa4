//! Paging and free-text search for list operations.

use crate::config::CoreConfig;
use crate::{KiaError, KiaResult};
use serde::Serialize;

/// One page of a list result together with the size of the full result.
#[derive(Clone, Debug, PartialEq, Serialize)]
pub struct Page<T> {
    pub items: Vec<T>,
    pub total: usize,
    pub page: u32,
    pub per_page: u32,
}

impl<T> Page<T> {
    pub fn map<U>(self, f: impl FnMut(T) -> U) -> Page<U> {
        Page {
            items: self.items.into_iter().map(f).collect(),
            total: self.total,
            page: self.page,
            per_page: self.per_page,
        }
    }
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct PageRequest {
    page: u32,
    per_page: u32,
    search: Option<String>,
}

impl PageRequest {
    /// Builds a request from optional caller input.
    ///
    /// `page` is 1-based and defaults to 1. `per_page` defaults to the configured default and is
    /// capped at the configured maximum.
    ///
    /// # Errors
    ///
    /// Returns `KiaError::Validation` for `page = 0` or `per_page = 0`.
    pub fn new(
        cfg: &CoreConfig,
        page: Option<u32>,
        per_page: Option<u32>,
        search: Option<String>,
    ) -> KiaResult<Self> {
        let page = page.unwrap_or(1);
        if page == 0 {
            return Err(KiaError::validation("page must be 1 or greater"));
        }

        let per_page = per_page.unwrap_or(cfg.default_per_page());
        if per_page == 0 {
            return Err(KiaError::validation("per_page must be 1 or greater"));
        }

        Ok(Self {
            page,
            per_page: per_page.min(cfg.max_per_page()),
            search: search
                .map(|s| s.trim().to_string())
                .filter(|s| !s.is_empty()),
        })
    }

    /// Everything on one page, no search.
    pub fn all() -> Self {
        Self {
            page: 1,
            per_page: u32::MAX,
            search: None,
        }
    }

    pub fn with_search(mut self, search: impl Into<String>) -> Self {
        let search = search.into();
        self.search = Some(search.trim().to_string()).filter(|s| !s.is_empty());
        self
    }

    pub fn page(&self) -> u32 {
        self.page
    }

    pub fn per_page(&self) -> u32 {
        self.per_page
    }

    pub fn search(&self) -> Option<&str> {
        self.search.as_deref()
    }

    /// Slices `items` (already filtered and ordered) into the requested page.
    pub fn paginate<T>(&self, items: Vec<T>) -> Page<T> {
        let total = items.len();
        let skip = (self.page as usize - 1).saturating_mul(self.per_page as usize);
        let items = items
            .into_iter()
            .skip(skip)
            .take(self.per_page as usize)
            .collect();

        Page {
            items,
            total,
            page: self.page,
            per_page: self.per_page,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_new_applies_defaults_and_caps() {
        let cfg = CoreConfig::default();
        let req = PageRequest::new(&cfg, None, None, Some("  ".into())).expect("defaults");
        assert_eq!(req.page(), 1);
        assert_eq!(req.per_page(), cfg.default_per_page());
        assert_eq!(req.search(), None);

        let capped = PageRequest::new(&cfg, Some(2), Some(10_000), None).expect("capped");
        assert_eq!(capped.per_page(), cfg.max_per_page());
    }

    #[test]
    fn test_new_rejects_zero() {
        let cfg = CoreConfig::default();
        assert!(PageRequest::new(&cfg, Some(0), None, None).is_err());
        assert!(PageRequest::new(&cfg, None, Some(0), None).is_err());
    }

    #[test]
    fn test_paginate_slices_and_reports_total() {
        let cfg = CoreConfig::default();
        let req = PageRequest::new(&cfg, Some(2), Some(3), None).expect("request");
        let page = req.paginate((1..=8).collect::<Vec<_>>());

        assert_eq!(page.items, vec![4, 5, 6]);
        assert_eq!(page.total, 8);

        let last = PageRequest::new(&cfg, Some(3), Some(3), None)
            .expect("request")
            .paginate((1..=8).collect::<Vec<_>>());
        assert_eq!(last.items, vec![7, 8]);

        let beyond = PageRequest::new(&cfg, Some(9), Some(3), None)
            .expect("request")
            .paginate((1..=8).collect::<Vec<_>>());
        assert!(beyond.items.is_empty());
        assert_eq!(beyond.total, 8);
    }
}
