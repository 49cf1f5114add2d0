//! Discovery query composition.
//!
//! Translates a listing request's filter/sort/pagination/search parameters
//! into a deterministic SQL predicate, ordering and window. The same
//! composed query drives both the page query and the total-count query.

use crate::db::{BookFormat, BookStatus};
use crate::error::{AppError, Result};
use rusqlite::types::Value;
use serde::Deserialize;

/// Default page size when the request does not specify one.
pub const DEFAULT_PAGE_SIZE: i64 = 20;

/// Hard cap on the page size, regardless of what was requested.
pub const MAX_PAGE_SIZE: i64 = 50;

/// Raw listing parameters as they arrive on the query string.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct ListParams {
    /// 1-based page number. Non-positive values are normalized to 1.
    pub page: Option<i64>,
    /// Requested page size, capped at [`MAX_PAGE_SIZE`].
    pub limit: Option<i64>,
    /// Format filter (exact wire name).
    pub format: Option<String>,
    /// Status filter (exact wire name).
    pub status: Option<String>,
    /// Single category-id filter.
    pub category: Option<String>,
    /// Single tag filter (matched lowercase).
    pub tag: Option<String>,
    /// Free-text search term, minimum 2 characters after trimming.
    pub search: Option<String>,
    /// Sort key; unrecognized values fall back to `newest`.
    pub sort: Option<String>,
}

/// Resolved sort key.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SortKey {
    /// `createdAt` descending. Default and fallback.
    Newest,
    /// `createdAt` ascending.
    Oldest,
    /// Trending flag first, then total views.
    Trending,
    /// Rating count first; rating sum breaks ties on plain listings.
    TopRated,
    /// Normalized title ascending.
    TitleAz,
}

impl SortKey {
    /// Resolve the wire value; anything unrecognized means `newest`.
    pub fn parse(raw: Option<&str>) -> Self {
        match raw {
            Some("oldest") => SortKey::Oldest,
            Some("trending") => SortKey::Trending,
            Some("top-rated") => SortKey::TopRated,
            Some("a-z") => SortKey::TitleAz,
            _ => SortKey::Newest,
        }
    }

    fn order_sql(self, scope: SortScope) -> &'static str {
        match (self, scope) {
            (SortKey::Trending, _) => "b.is_trending DESC, b.total_views DESC",
            (SortKey::TopRated, SortScope::Listing) => "b.rating_count DESC, b.rating_sum DESC",
            (SortKey::TopRated, SortScope::CategoryView) => "b.rating_count DESC",
            (SortKey::TitleAz, _) => "b.title_lower ASC",
            (SortKey::Oldest, _) => "b.created_at ASC",
            (SortKey::Newest, _) => "b.created_at DESC",
        }
    }
}

/// Where a composed query will be used. The category browse view uses a
/// reduced top-rated ordering.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SortScope {
    /// Plain listing or search.
    Listing,
    /// Category-scoped browse.
    CategoryView,
}

/// A fully composed discovery query: filter predicate with bound
/// parameters, ordering, and pagination window. Cloned for the
/// concurrently-running count query so both see the same filter.
#[derive(Debug, Clone)]
pub struct ComposedQuery {
    /// SQL predicate over `books b` (and `books_fts f` when searching).
    pub where_sql: String,
    /// Bind parameters for the predicate, in placeholder order.
    pub params: Vec<Value>,
    /// SQL ordering clause.
    pub order_sql: String,
    /// Effective page size.
    pub limit: i64,
    /// Row offset: `(page - 1) * limit`.
    pub offset: i64,
    /// Normalized 1-based page number.
    pub page: i64,
    /// Whether the query joins the relevance index.
    pub text_search: bool,
}

/// Compose the listing and count queries for a discovery request.
///
/// A present search term switches the ordering to relevance regardless of
/// the requested sort key, and is rejected before any storage access when
/// shorter than 2 trimmed characters.
pub fn compose(params: &ListParams, scope: SortScope) -> Result<ComposedQuery> {
    let page = params.page.unwrap_or(1).max(1);
    let limit = params
        .limit
        .unwrap_or(DEFAULT_PAGE_SIZE)
        .clamp(1, MAX_PAGE_SIZE);
    let offset = (page - 1) * limit;

    let mut clauses = vec!["b.is_published = 1".to_string()];
    let mut bind: Vec<Value> = Vec::new();

    if let Some(raw) = params.format.as_deref() {
        let format = BookFormat::parse(raw)
            .ok_or_else(|| AppError::InvalidInput(format!("Unknown format: {}", raw)))?;
        clauses.push("b.format = ?".to_string());
        bind.push(Value::Text(format.as_str().to_string()));
    }

    if let Some(raw) = params.status.as_deref() {
        let status = BookStatus::parse(raw)
            .ok_or_else(|| AppError::InvalidInput(format!("Unknown status: {}", raw)))?;
        clauses.push("b.status = ?".to_string());
        bind.push(Value::Text(status.as_str().to_string()));
    }

    if let Some(category_id) = params.category.as_deref() {
        clauses.push(
            "EXISTS (SELECT 1 FROM book_categories bc \
             WHERE bc.book_id = b.id AND bc.category_id = ?)"
                .to_string(),
        );
        bind.push(Value::Text(category_id.to_string()));
    }

    if let Some(tag) = params.tag.as_deref() {
        clauses.push(
            "EXISTS (SELECT 1 FROM json_each(b.tags_json) WHERE json_each.value = ?)".to_string(),
        );
        bind.push(Value::Text(tag.trim().to_lowercase()));
    }

    let mut text_search = false;
    if let Some(raw) = params.search.as_deref() {
        let term = raw.trim();
        if term.chars().count() < 2 {
            return Err(AppError::InvalidInput(
                "Search term must be at least 2 characters".to_string(),
            ));
        }

        let match_expr = fts_match_expr(term).ok_or_else(|| {
            AppError::InvalidInput("Search term contains no searchable characters".to_string())
        })?;

        clauses.push("f.books_fts MATCH ?".to_string());
        bind.push(Value::Text(match_expr));
        text_search = true;
    }

    let order_sql = if text_search {
        // Relevance wins over any requested sort key.
        "f.rank".to_string()
    } else {
        SortKey::parse(params.sort.as_deref())
            .order_sql(scope)
            .to_string()
    };

    Ok(ComposedQuery {
        where_sql: clauses.join(" AND "),
        params: bind,
        order_sql,
        limit,
        offset,
        page,
        text_search,
    })
}

/// Build an FTS5 match expression from a raw user term: each whitespace
/// token is stripped to alphanumerics and quoted as a prefix match, so
/// user input can never inject match syntax.
fn fts_match_expr(term: &str) -> Option<String> {
    let tokens: Vec<String> = term
        .split_whitespace()
        .map(|t| t.chars().filter(|c| c.is_alphanumeric()).collect::<String>())
        .filter(|t| !t.is_empty())
        .map(|t| format!("\"{}\"*", t))
        .collect();

    if tokens.is_empty() {
        None
    } else {
        Some(tokens.join(" "))
    }
}
