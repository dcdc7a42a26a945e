//! Page math, including the "unlimited" (`-1`) page size.

use serde::{Deserialize, Serialize};

/// Requested page size.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum PageSize {
    /// `-1`: no offset or limit, page forced to 1.
    Unlimited,
    Limited(usize),
}

impl PageSize {
    /// Interpret a caller-supplied limit. Any negative value is unlimited;
    /// zero is not a valid page size.
    pub fn from_limit(limit: i64) -> Option<PageSize> {
        match limit {
            n if n < 0 => Some(PageSize::Unlimited),
            0 => None,
            n => Some(PageSize::Limited(usize::try_from(n).unwrap_or(usize::MAX))),
        }
    }

    /// Wire value: `-1` for unlimited.
    pub fn as_i64(&self) -> i64 {
        match self {
            PageSize::Unlimited => -1,
            PageSize::Limited(n) => i64::try_from(*n).unwrap_or(i64::MAX),
        }
    }

    /// Offset/limit window for a (normalized) page.
    pub fn window(&self, page: u64) -> Window {
        match self {
            PageSize::Unlimited => Window::ALL,
            PageSize::Limited(n) => {
                let page = usize::try_from(page.max(1)).unwrap_or(usize::MAX);
                Window {
                    limit: Some(*n),
                    offset: (page - 1).saturating_mul(*n),
                }
            }
        }
    }
}

/// Offset and optional limit applied to a result list.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Window {
    pub limit: Option<usize>,
    pub offset: usize,
}

impl Window {
    pub const ALL: Window = Window {
        limit: None,
        offset: 0,
    };

    /// First `n` items.
    pub fn first(n: usize) -> Window {
        Window {
            limit: Some(n),
            offset: 0,
        }
    }

    /// SQLite `LIMIT` value; `-1` means no limit.
    pub fn sql_limit(&self) -> i64 {
        self.limit
            .map_or(-1, |n| i64::try_from(n).unwrap_or(i64::MAX))
    }

    /// Number of items needed from the start to fill this window.
    pub fn end(&self) -> Option<usize> {
        self.limit.map(|n| self.offset.saturating_add(n))
    }

    pub fn slice<T>(&self, items: Vec<T>) -> Vec<T> {
        let iter = items.into_iter().skip(self.offset);
        match self.limit {
            Some(n) => iter.take(n).collect(),
            None => iter.collect(),
        }
    }
}

/// Pagination block returned with every search response.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PageInfo {
    pub page: u64,
    pub page_size: i64,
    pub total: Option<u64>,
    pub total_pages: Option<u64>,
    pub has_prev: bool,
    pub has_next: bool,
}

/// Compute page metadata.
///
/// When `total` is unknown (semantic or phrase searches), `has_next` is the
/// heuristic "this page came back full".
pub fn compute(page: u64, page_size: PageSize, total: Option<usize>, returned: usize) -> PageInfo {
    let total = total.map(|t| t as u64);
    match page_size {
        PageSize::Unlimited => PageInfo {
            page: 1,
            page_size: -1,
            total: Some(total.unwrap_or(returned as u64)),
            total_pages: total.map(|_| 1),
            has_prev: false,
            has_next: false,
        },
        PageSize::Limited(size) => {
            let page = page.max(1);
            let size = size.max(1) as u64;
            let total_pages = total.map(|t| t.div_ceil(size));
            PageInfo {
                page,
                page_size: size as i64,
                total,
                total_pages,
                has_prev: page > 1,
                has_next: match total_pages {
                    Some(pages) => page < pages,
                    None => returned as u64 == size,
                },
            }
        }
    }
}

/// Normalize a numeric page input; anything non-finite or below 1 is 1.
pub fn normalize_page(raw: f64) -> u64 {
    if !raw.is_finite() || raw < 1.0 {
        return 1;
    }
    if raw >= u64::MAX as f64 {
        return u64::MAX;
    }
    raw.floor() as u64
}

/// Parse a page from untrusted text.
pub fn parse_page(raw: &str) -> u64 {
    raw.trim().parse::<f64>().map_or(1, normalize_page)
}
