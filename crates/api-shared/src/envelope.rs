//! The response envelope shared by every endpoint.

use kia_core::Page;
use serde::{Deserialize, Serialize};
use utoipa::{IntoParams, ToSchema};

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize, ToSchema)]
pub struct PageMeta {
    pub total: usize,
    pub page: u32,
    pub per_page: u32,
}

/// `{success, data, meta?, error?}`.
///
/// `data` is present on success, `error` on failure, `meta` only on list responses.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct ApiResponse<T> {
    pub success: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub data: Option<T>,
    #[serde(skip_serializing_if = "Option::is_none", default)]
    pub meta: Option<PageMeta>,
    #[serde(skip_serializing_if = "Option::is_none", default)]
    pub error: Option<String>,
}

impl<T> ApiResponse<T> {
    pub fn ok(data: T) -> Self {
        Self {
            success: true,
            data: Some(data),
            meta: None,
            error: None,
        }
    }

    pub fn failure(error: impl Into<String>) -> Self {
        Self {
            success: false,
            data: None,
            meta: None,
            error: Some(error.into()),
        }
    }
}

impl<T> ApiResponse<Vec<T>> {
    /// Wraps one page of results, converting each item.
    pub fn page<U>(page: Page<U>, convert: impl FnMut(U) -> T) -> Self {
        let meta = PageMeta {
            total: page.total,
            page: page.page,
            per_page: page.per_page,
        };
        Self {
            success: true,
            data: Some(page.items.into_iter().map(convert).collect()),
            meta: Some(meta),
            error: None,
        }
    }
}

/// `page`, `per_page` and `search`, accepted by every list endpoint.
#[derive(Clone, Debug, Default, Deserialize, IntoParams)]
#[into_params(parameter_in = Query)]
pub struct PageQuery {
    /// 1-based page number.
    pub page: Option<u32>,
    pub per_page: Option<u32>,
    /// Free-text filter; each list documents the fields it matches.
    pub search: Option<String>,
}
