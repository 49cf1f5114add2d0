//! HTTP request handlers.

use crate::catalog::{
    BookDetail, BookPage, BookUpdate, CategoryNode, NewBook, NewCategory, NewChapter,
    ReadingStatusUpdate, query::ListParams,
};
use crate::db::{
    Book, BookFormat, BookStatus, Bookmark, Category, Chapter, ChapterContent, ChapterSummary,
    ReadingPosition, ReadingStatus, Role, User, UserStats,
};
use crate::error::{AppError, Result};
use crate::server::AppState;
use axum::{
    Json,
    extract::{Path, Query, State},
    http::{HeaderMap, StatusCode, header},
};
use serde::{Deserialize, Serialize};
use serde_json::json;
use std::collections::HashMap;

// ============================================================================
// RESPONSE SHAPES
// ============================================================================

/// User profile, never including the password hash.
#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct UserResponse {
    id: String,
    username: String,
    email: String,
    role: Role,
    avatar: String,
    bio: String,
    stats: UserStats,
    credits: i64,
    is_verified: bool,
    created_at: i64,
}

impl From<&User> for UserResponse {
    fn from(user: &User) -> Self {
        Self {
            id: user.id.clone(),
            username: user.username.clone(),
            email: user.email.clone(),
            role: user.role,
            avatar: user.avatar.clone(),
            bio: user.bio.clone(),
            stats: user.stats,
            credits: user.credits,
            is_verified: user.is_verified,
            created_at: user.created_at,
        }
    }
}

/// Profile plus bearer token, returned by register and login.
#[derive(Debug, Serialize)]
pub struct AuthResponse {
    token: String,
    user: UserResponse,
}

/// Book as it appears in listings and detail payloads.
#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct BookResponse {
    id: String,
    title: String,
    author: String,
    description: String,
    cover_image: String,
    format: BookFormat,
    status: BookStatus,
    average_rating: f64,
    rating_count: i64,
    chapter_count: i64,
    total_views: i64,
    metadata: HashMap<String, String>,
    tags: Vec<String>,
    uploaded_by: Option<String>,
    is_trending: bool,
    is_featured: bool,
    is_published: bool,
    published_at: i64,
    created_at: i64,
    updated_at: i64,
}

impl From<&Book> for BookResponse {
    fn from(book: &Book) -> Self {
        Self {
            id: book.id.clone(),
            title: book.title.clone(),
            author: book.author.clone(),
            description: book.description.clone(),
            cover_image: book.cover_image.clone(),
            format: book.format,
            status: book.status,
            average_rating: book.average_rating(),
            rating_count: book.rating_count,
            chapter_count: book.chapter_count,
            total_views: book.total_views,
            metadata: book.metadata.clone(),
            tags: book.tags.clone(),
            uploaded_by: book.uploaded_by.clone(),
            is_trending: book.is_trending,
            is_featured: book.is_featured,
            is_published: book.is_published,
            published_at: book.published_at,
            created_at: book.created_at,
            updated_at: book.updated_at,
        }
    }
}

/// Category display fields.
#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct CategoryResponse {
    id: String,
    name: String,
    slug: String,
    description: String,
    icon: String,
    parent: Option<String>,
    is_featured: bool,
    book_count: i64,
}

impl From<&Category> for CategoryResponse {
    fn from(category: &Category) -> Self {
        Self {
            id: category.id.clone(),
            name: category.name.clone(),
            slug: category.slug.clone(),
            description: category.description.clone(),
            icon: category.icon.clone(),
            parent: category.parent_id.clone(),
            is_featured: category.is_featured,
            book_count: category.book_count,
        }
    }
}

/// A top-level category with its nested sub-genres.
#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct CategoryNodeResponse {
    #[serde(flatten)]
    category: CategoryResponse,
    children: Vec<CategoryResponse>,
}

/// Uploader summary on book detail.
#[derive(Debug, Serialize)]
pub struct UploaderResponse {
    id: String,
    username: String,
    avatar: String,
}

/// Chapter listing entry: no content, no pages.
#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ChapterSummaryResponse {
    id: String,
    chapter_number: i64,
    title: String,
    word_count: i64,
    page_count: i64,
    views: i64,
    is_premium: bool,
    published_at: i64,
}

impl From<&ChapterSummary> for ChapterSummaryResponse {
    fn from(chapter: &ChapterSummary) -> Self {
        Self {
            id: chapter.id.clone(),
            chapter_number: chapter.chapter_number,
            title: chapter.title.clone(),
            word_count: chapter.word_count,
            page_count: chapter.page_count,
            views: chapter.views,
            is_premium: chapter.is_premium,
            published_at: chapter.published_at,
        }
    }
}

/// Full chapter with its content payload. Exactly one of `content` and
/// `pages` is set, depending on the book's format.
#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ChapterResponse {
    id: String,
    book_id: String,
    chapter_number: i64,
    title: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    content: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pages: Option<Vec<String>>,
    word_count: i64,
    page_count: i64,
    views: i64,
    is_premium: bool,
    unlock_cost: i64,
    published_at: i64,
}

impl From<Chapter> for ChapterResponse {
    fn from(chapter: Chapter) -> Self {
        let (content, pages) = match chapter.content {
            ChapterContent::Text(body) => (Some(body), None),
            ChapterContent::Pages(images) => (None, Some(images)),
        };

        Self {
            id: chapter.id,
            book_id: chapter.book_id,
            chapter_number: chapter.chapter_number,
            title: chapter.title,
            content,
            pages,
            word_count: chapter.word_count,
            page_count: chapter.page_count,
            views: chapter.views,
            is_premium: chapter.is_premium,
            unlock_cost: chapter.unlock_cost,
            published_at: chapter.published_at,
        }
    }
}

/// Book detail: the book, expanded relations, chapter list.
#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct BookDetailResponse {
    #[serde(flatten)]
    book: BookResponse,
    categories: Vec<CategoryResponse>,
    uploader: Option<UploaderResponse>,
    chapters: Vec<ChapterSummaryResponse>,
}

impl From<&BookDetail> for BookDetailResponse {
    fn from(detail: &BookDetail) -> Self {
        Self {
            book: BookResponse::from(&detail.book),
            categories: detail.categories.iter().map(CategoryResponse::from).collect(),
            uploader: detail.uploader.as_ref().map(|user| UploaderResponse {
                id: user.id.clone(),
                username: user.username.clone(),
                avatar: user.avatar.clone(),
            }),
            chapters: detail
                .chapters
                .iter()
                .map(ChapterSummaryResponse::from)
                .collect(),
        }
    }
}

/// Envelope for every paginated listing.
#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct BookPageResponse {
    total: i64,
    page: i64,
    total_pages: i64,
    limit: i64,
    books: Vec<BookResponse>,
    #[serde(skip_serializing_if = "Option::is_none")]
    category: Option<CategoryResponse>,
}

impl BookPageResponse {
    fn new(page: BookPage, category: Option<&Category>) -> Self {
        Self {
            total: page.total,
            page: page.page,
            total_pages: page.total_pages(),
            limit: page.limit,
            books: page.books.iter().map(BookResponse::from).collect(),
            category: category.map(CategoryResponse::from),
        }
    }
}

/// Bookmark with its book, for the continue-reading list.
#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct BookmarkResponse {
    id: String,
    book_id: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    book: Option<BookResponse>,
    chapter_id: Option<String>,
    last_chapter_number: i64,
    position: ReadingPosition,
    reading_status: ReadingStatus,
    user_rating: Option<i64>,
    note: String,
    last_read_at: i64,
}

impl BookmarkResponse {
    fn new(bookmark: &Bookmark, book: Option<&Book>) -> Self {
        Self {
            id: bookmark.id.clone(),
            book_id: bookmark.book_id.clone(),
            book: book.map(BookResponse::from),
            chapter_id: bookmark.chapter_id.clone(),
            last_chapter_number: bookmark.last_chapter_number,
            position: bookmark.position,
            reading_status: bookmark.reading_status,
            user_rating: bookmark.user_rating,
            note: bookmark.note.clone(),
            last_read_at: bookmark.last_read_at,
        }
    }
}

// ============================================================================
// ROOT
// ============================================================================

/// Health check.
pub async fn index() -> Json<serde_json::Value> {
    Json(json!({ "message": "BookVill API is running" }))
}

// ============================================================================
// AUTH API
// ============================================================================

/// Register request.
#[derive(Debug, Deserialize)]
pub struct RegisterRequest {
    username: String,
    email: String,
    password: String,
}

/// Login request.
#[derive(Debug, Deserialize)]
pub struct LoginRequest {
    email: String,
    password: String,
}

/// Create an account and return the profile with a fresh token.
pub async fn auth_register(
    State(state): State<AppState>,
    Json(req): Json<RegisterRequest>,
) -> Result<(StatusCode, Json<AuthResponse>)> {
    let (user, token) = state.auth.register(&req.username, &req.email, &req.password)?;

    Ok((
        StatusCode::CREATED,
        Json(AuthResponse {
            token,
            user: UserResponse::from(&user),
        }),
    ))
}

/// Verify credentials and return the profile with a fresh token.
pub async fn auth_login(
    State(state): State<AppState>,
    Json(req): Json<LoginRequest>,
) -> Result<Json<AuthResponse>> {
    let (user, token) = state.auth.login(&req.email, &req.password)?;

    Ok(Json(AuthResponse {
        token,
        user: UserResponse::from(&user),
    }))
}

/// Current user's profile and stats.
pub async fn auth_me(
    State(state): State<AppState>,
    headers: HeaderMap,
) -> Result<Json<UserResponse>> {
    let user = get_authenticated_user(&state, &headers)?;
    Ok(Json(UserResponse::from(&user)))
}

// ============================================================================
// BOOK API
// ============================================================================

/// Paginated, filtered, sorted listing.
pub async fn books_list(
    State(state): State<AppState>,
    Query(params): Query<ListParams>,
) -> Result<Json<BookPageResponse>> {
    let page = state.catalog.list_books(&params).await?;
    Ok(Json(BookPageResponse::new(page, None)))
}

/// Search query parameters.
#[derive(Debug, Deserialize)]
pub struct SearchParams {
    q: Option<String>,
}

/// Relevance search over title, author and tags.
pub async fn books_search(
    State(state): State<AppState>,
    Query(search): Query<SearchParams>,
    Query(params): Query<ListParams>,
) -> Result<Json<BookPageResponse>> {
    let term = search
        .q
        .ok_or_else(|| AppError::InvalidInput("Query parameter q is required".to_string()))?;

    let page = state.catalog.search_books(&term, &params).await?;
    Ok(Json(BookPageResponse::new(page, None)))
}

/// Category-scoped listing, with the resolved category alongside.
pub async fn books_by_category(
    State(state): State<AppState>,
    Path(slug): Path<String>,
    Query(params): Query<ListParams>,
) -> Result<Json<BookPageResponse>> {
    let (category, page) = state.catalog.browse_category(&slug, &params).await?;
    Ok(Json(BookPageResponse::new(page, Some(&category))))
}

/// Book detail with chapter list. Fires the view-count increment.
pub async fn book_detail(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> Result<Json<BookDetailResponse>> {
    let detail = state.catalog.get_book_detail(&id).await?;
    Ok(Json(BookDetailResponse::from(&detail)))
}

/// Create a book.
pub async fn book_create(
    State(state): State<AppState>,
    headers: HeaderMap,
    Json(payload): Json<NewBook>,
) -> Result<(StatusCode, Json<BookResponse>)> {
    let user = get_authenticated_user(&state, &headers)?;
    let book = state.catalog.add_book(payload, &user).await?;
    Ok((StatusCode::CREATED, Json(BookResponse::from(&book))))
}

/// Update a book (uploader or admin).
pub async fn book_update(
    State(state): State<AppState>,
    Path(id): Path<String>,
    headers: HeaderMap,
    Json(payload): Json<BookUpdate>,
) -> Result<Json<BookResponse>> {
    let user = get_authenticated_user(&state, &headers)?;
    let book = state.catalog.update_book(&id, payload, &user).await?;
    Ok(Json(BookResponse::from(&book)))
}

/// Delete a book with its chapters and bookmarks (admin only).
pub async fn book_delete(
    State(state): State<AppState>,
    Path(id): Path<String>,
    headers: HeaderMap,
) -> Result<Json<serde_json::Value>> {
    let user = get_authenticated_user(&state, &headers)?;
    state.catalog.delete_book(&id, &user).await?;
    Ok(Json(json!({ "message": "Book deleted" })))
}

// ============================================================================
// CHAPTER API
// ============================================================================

/// Add a chapter to a book (uploader or admin).
pub async fn chapter_create(
    State(state): State<AppState>,
    Path(id): Path<String>,
    headers: HeaderMap,
    Json(payload): Json<NewChapter>,
) -> Result<(StatusCode, Json<ChapterResponse>)> {
    let user = get_authenticated_user(&state, &headers)?;
    let chapter = state.catalog.add_chapter(&id, payload, &user).await?;
    Ok((StatusCode::CREATED, Json(ChapterResponse::from(chapter))))
}

/// Read a chapter with its content. Fires the view-count increments.
pub async fn chapter_read(
    State(state): State<AppState>,
    Path((id, number)): Path<(String, i64)>,
) -> Result<Json<ChapterResponse>> {
    let chapter = state.catalog.read_chapter(&id, number).await?;
    Ok(Json(ChapterResponse::from(chapter)))
}

/// Remove a chapter (uploader or admin).
pub async fn chapter_delete(
    State(state): State<AppState>,
    Path((id, number)): Path<(String, i64)>,
    headers: HeaderMap,
) -> Result<Json<serde_json::Value>> {
    let user = get_authenticated_user(&state, &headers)?;
    state.catalog.remove_chapter(&id, number, &user).await?;
    Ok(Json(json!({ "message": "Chapter deleted" })))
}

// ============================================================================
// CATEGORY API
// ============================================================================

/// Category listing parameters.
#[derive(Debug, Deserialize)]
pub struct CategoryListParams {
    featured: Option<String>,
}

/// Category tree response.
#[derive(Debug, Serialize)]
pub struct CategoryTreeResponse {
    total: i64,
    categories: Vec<CategoryNodeResponse>,
}

/// All categories as a two-level tree. `?featured=true` narrows to
/// featured categories.
pub async fn categories_list(
    State(state): State<AppState>,
    Query(params): Query<CategoryListParams>,
) -> Result<Json<CategoryTreeResponse>> {
    let featured_only = params.featured.as_deref() == Some("true");
    let (total, tree) = state.catalog.category_tree(featured_only).await?;

    let categories = tree
        .into_iter()
        .map(|CategoryNode { category, children }| CategoryNodeResponse {
            category: CategoryResponse::from(&category),
            children: children.iter().map(CategoryResponse::from).collect(),
        })
        .collect();

    Ok(Json(CategoryTreeResponse { total, categories }))
}

/// Create a category (admin only).
pub async fn category_create(
    State(state): State<AppState>,
    headers: HeaderMap,
    Json(payload): Json<NewCategory>,
) -> Result<(StatusCode, Json<CategoryResponse>)> {
    let user = get_authenticated_user(&state, &headers)?;
    let category = state.catalog.create_category(payload, &user).await?;
    Ok((StatusCode::CREATED, Json(CategoryResponse::from(&category))))
}

/// Single category by slug.
pub async fn category_get(
    State(state): State<AppState>,
    Path(slug): Path<String>,
) -> Result<Json<CategoryResponse>> {
    let category = state.catalog.category_by_slug(&slug).await?;
    Ok(Json(CategoryResponse::from(&category)))
}

// ============================================================================
// USER API
// ============================================================================

/// Profile update request.
#[derive(Debug, Default, Deserialize)]
#[serde(default)]
pub struct ProfileUpdateRequest {
    avatar: Option<String>,
    bio: Option<String>,
}

/// Caller's profile.
pub async fn users_profile_get(
    State(state): State<AppState>,
    headers: HeaderMap,
) -> Result<Json<UserResponse>> {
    let user = get_authenticated_user(&state, &headers)?;
    Ok(Json(UserResponse::from(&user)))
}

/// Update the caller's avatar and bio.
pub async fn users_profile_update(
    State(state): State<AppState>,
    headers: HeaderMap,
    Json(req): Json<ProfileUpdateRequest>,
) -> Result<Json<UserResponse>> {
    let user = get_authenticated_user(&state, &headers)?;
    let updated = state.auth.update_profile(&user, req.avatar, req.bio)?;
    Ok(Json(UserResponse::from(&updated)))
}

/// Bookmark listing parameters.
#[derive(Debug, Deserialize)]
pub struct BookmarkParams {
    status: Option<String>,
}

/// Bookmark list response.
#[derive(Debug, Serialize)]
pub struct BookmarkListResponse {
    total: usize,
    bookmarks: Vec<BookmarkResponse>,
}

/// Caller's bookmarks, most recently read first.
pub async fn users_bookmarks(
    State(state): State<AppState>,
    headers: HeaderMap,
    Query(params): Query<BookmarkParams>,
) -> Result<Json<BookmarkListResponse>> {
    let user = get_authenticated_user(&state, &headers)?;
    let entries = state
        .catalog
        .bookmarks_for_user(&user, params.status.as_deref())
        .await?;

    let bookmarks: Vec<BookmarkResponse> = entries
        .iter()
        .map(|entry| BookmarkResponse::new(&entry.bookmark, entry.book.as_ref()))
        .collect();

    Ok(Json(BookmarkListResponse {
        total: bookmarks.len(),
        bookmarks,
    }))
}

/// Upsert the caller's reading state for a book.
pub async fn users_reading_status(
    State(state): State<AppState>,
    headers: HeaderMap,
    Json(payload): Json<ReadingStatusUpdate>,
) -> Result<Json<BookmarkResponse>> {
    let user = get_authenticated_user(&state, &headers)?;
    let bookmark = state.catalog.save_reading_status(&user, payload).await?;
    Ok(Json(BookmarkResponse::new(&bookmark, None)))
}

// ============================================================================
// HELPERS
// ============================================================================

/// Extract token from Authorization header.
fn extract_token(headers: &HeaderMap) -> Option<String> {
    headers
        .get(header::AUTHORIZATION)
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.strip_prefix("Bearer "))
        .map(|s| s.to_string())
}

/// Get authenticated user from the bearer token.
fn get_authenticated_user(state: &AppState, headers: &HeaderMap) -> Result<User> {
    let token = extract_token(headers).ok_or_else(|| {
        AppError::Unauthenticated("Not authorized, no token provided".to_string())
    })?;

    state.auth.authenticate(&token)
}
