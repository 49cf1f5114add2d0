//! Catalog service.
//!
//! Orchestrates the query composer and the entity store to serve the
//! list/detail/search/category-browse operations, and owns the
//! cross-entity side effects: category book-count maintenance, view-count
//! increments, cascading deletes and incremental rating/stat updates.

/// Discovery query composition.
pub mod query;

use crate::db::{
    Book, BookFormat, BookStatus, Bookmark, Category, Chapter, ChapterContent, ChapterSummary,
    Database, ReadingPosition, ReadingStatus, User, now_timestamp, parse_id,
};
use crate::error::{AppError, Result};
use query::{ListParams, SortScope};
use serde::Deserialize;
use std::collections::HashMap;

/// One page of a paginated listing.
#[derive(Debug)]
pub struct BookPage {
    /// Books on this page.
    pub books: Vec<Book>,
    /// Total matching books across all pages.
    pub total: i64,
    /// Normalized 1-based page number.
    pub page: i64,
    /// Effective page size.
    pub limit: i64,
}

impl BookPage {
    /// Number of pages the listing spans.
    pub fn total_pages(&self) -> i64 {
        if self.total == 0 {
            0
        } else {
            (self.total + self.limit - 1) / self.limit
        }
    }
}

/// Book detail: the book with its relations expanded and its chapter
/// listing, never including chapter content.
#[derive(Debug)]
pub struct BookDetail {
    /// The book itself.
    pub book: Book,
    /// Referenced categories, expanded.
    pub categories: Vec<Category>,
    /// Uploading user, expanded when present.
    pub uploader: Option<User>,
    /// Chapter summaries ordered by chapter number.
    pub chapters: Vec<ChapterSummary>,
}

/// A top-level category with its nested sub-genres.
#[derive(Debug)]
pub struct CategoryNode {
    /// The root category.
    pub category: Category,
    /// Its direct children.
    pub children: Vec<Category>,
}

/// A bookmark paired with the book it points at, for the
/// continue-reading list.
#[derive(Debug)]
pub struct BookmarkEntry {
    /// The bookmark.
    pub bookmark: Bookmark,
    /// The bookmarked book, if it still exists.
    pub book: Option<Book>,
}

/// Payload for creating a book.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct NewBook {
    /// Display title. Required.
    pub title: String,
    /// Primary author. Required.
    pub author: String,
    /// Synopsis.
    pub description: String,
    /// Cover image reference.
    pub cover_image: String,
    /// Format wire name. Required, validated against the fixed set.
    pub format: String,
    /// Referenced category ids. Every id must exist.
    pub categories: Vec<String>,
    /// Status wire name. Defaults to `ongoing`.
    pub status: Option<String>,
    /// Discovery tags, lowercased at write time.
    pub tags: Vec<String>,
    /// Format-specific metadata.
    pub metadata: HashMap<String, String>,
}

/// Allow-listed book update. Absent fields are left untouched; anything
/// outside this set is immutable through the update path.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct BookUpdate {
    /// New title.
    pub title: Option<String>,
    /// New author.
    pub author: Option<String>,
    /// New synopsis.
    pub description: Option<String>,
    /// New cover reference.
    pub cover_image: Option<String>,
    /// New format wire name.
    pub format: Option<String>,
    /// Replacement category id set.
    pub categories: Option<Vec<String>>,
    /// New status wire name.
    pub status: Option<String>,
    /// Replacement tag set.
    pub tags: Option<Vec<String>>,
    /// Replacement metadata map.
    pub metadata: Option<HashMap<String, String>>,
    /// Trending flag.
    pub is_trending: Option<bool>,
    /// Featured flag.
    pub is_featured: Option<bool>,
    /// Published flag.
    pub is_published: Option<bool>,
}

/// Payload for adding a chapter to a book.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct NewChapter {
    /// Chapter number, unique per book. Required.
    pub chapter_number: Option<i64>,
    /// Chapter title.
    pub title: String,
    /// Prose body, for text formats only.
    pub content: Option<String>,
    /// Ordered page-image references, for visual formats only.
    pub pages: Option<Vec<String>>,
    /// Paywall flag.
    pub is_premium: bool,
    /// Unlock price in credits.
    pub unlock_cost: i64,
}

/// Payload for creating a category.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct NewCategory {
    /// Display name. Required, unique.
    pub name: String,
    /// URL-safe slug. Required, unique, lowercased.
    pub slug: String,
    /// Short description.
    pub description: String,
    /// Emoji or icon class.
    pub icon: String,
    /// Parent category id for sub-genres. Must exist when given.
    pub parent: Option<String>,
    /// Navigation flag.
    pub is_featured: bool,
}

/// Payload for upserting the caller's reading state on a book.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct ReadingStatusUpdate {
    /// Target book id. Required.
    pub book_id: String,
    /// Last chapter the caller was reading.
    pub chapter_id: Option<String>,
    /// Denormalized last chapter number.
    pub last_chapter_number: Option<i64>,
    /// Reading-list status wire name.
    pub status: Option<String>,
    /// Format-specific position within the chapter.
    pub position: Option<ReadingPosition>,
    /// Personal 1-5 rating.
    pub user_rating: Option<i64>,
    /// Personal note.
    pub note: Option<String>,
}

/// Catalog service over the entity store.
pub struct CatalogService {
    db: Database,
}

impl CatalogService {
    /// Create a new catalog service.
    pub fn new(db: Database) -> Self {
        Self { db }
    }

    /// Run a store operation on the blocking pool.
    async fn run_db<T, F>(&self, f: F) -> Result<T>
    where
        T: Send + 'static,
        F: FnOnce(Database) -> Result<T> + Send + 'static,
    {
        let db = self.db.clone();
        tokio::task::spawn_blocking(move || f(db))
            .await
            .map_err(|e| AppError::Internal(format!("Task join error: {}", e)))?
    }

    /// Run a store operation detached from the request. The request never
    /// waits for it and its failure is logged, not surfaced.
    fn spawn_detached<F>(&self, label: &'static str, f: F)
    where
        F: FnOnce(Database) -> Result<()> + Send + 'static,
    {
        let db = self.db.clone();
        tokio::spawn(async move {
            match tokio::task::spawn_blocking(move || f(db)).await {
                Ok(Ok(())) => {}
                Ok(Err(e)) => tracing::warn!(error = %e, "{} failed", label),
                Err(e) => tracing::warn!(error = %e, "{} task failed", label),
            }
        });
    }

    // ========== DISCOVERY ==========

    /// Paginated, filtered, sorted listing. The page query and the count
    /// query run concurrently against the same composed filter.
    pub async fn list_books(&self, params: &ListParams) -> Result<BookPage> {
        self.run_listing(params, SortScope::Listing).await
    }

    /// Relevance search. Same machinery as the listing; the composer
    /// rejects short terms and switches the ordering to relevance.
    pub async fn search_books(&self, term: &str, params: &ListParams) -> Result<BookPage> {
        let mut scoped = params.clone();
        scoped.search = Some(term.to_string());
        self.run_listing(&scoped, SortScope::Listing).await
    }

    /// Category-scoped listing: resolve the slug first, then apply the
    /// same filter/sort machinery scoped to the category id.
    pub async fn browse_category(
        &self,
        slug: &str,
        params: &ListParams,
    ) -> Result<(Category, BookPage)> {
        let slug_owned = slug.to_string();
        let category = self
            .run_db(move |db| db.get_category_by_slug(&slug_owned))
            .await?
            .ok_or_else(|| AppError::NotFound(format!("Category not found: {}", slug)))?;

        let mut scoped = params.clone();
        scoped.category = Some(category.id.clone());
        let page = self.run_listing(&scoped, SortScope::CategoryView).await?;

        Ok((category, page))
    }

    async fn run_listing(&self, params: &ListParams, scope: SortScope) -> Result<BookPage> {
        let composed = query::compose(params, scope)?;
        let (page, limit) = (composed.page, composed.limit);

        let list_query = composed.clone();
        let count_query = composed;
        let (books, total) = tokio::join!(
            self.run_db(move |db| db.list_books(&list_query)),
            self.run_db(move |db| db.count_books(&count_query)),
        );

        Ok(BookPage {
            books: books?,
            total: total?,
            page,
            limit,
        })
    }

    // ========== BOOKS ==========

    /// Create a book. The format must belong to the fixed set and every
    /// supplied category id must exist.
    pub async fn add_book(&self, payload: NewBook, uploader: &User) -> Result<Book> {
        let title = payload.title.trim().to_string();
        if title.is_empty() {
            return Err(AppError::InvalidInput("Title is required".to_string()));
        }

        let author = payload.author.trim().to_string();
        if author.is_empty() {
            return Err(AppError::InvalidInput("Author is required".to_string()));
        }

        if payload.format.is_empty() {
            return Err(AppError::InvalidInput("Format is required".to_string()));
        }
        let format = BookFormat::parse(&payload.format)
            .ok_or_else(|| AppError::InvalidInput(format!("Unknown format: {}", payload.format)))?;

        let status = match payload.status.as_deref() {
            Some(raw) => BookStatus::parse(raw)
                .ok_or_else(|| AppError::InvalidInput(format!("Unknown status: {}", raw)))?,
            None => BookStatus::Ongoing,
        };

        let categories = self.validate_categories(payload.categories).await?;

        let now = now_timestamp();
        let book = Book {
            id: uuid::Uuid::new_v4().to_string(),
            title_lower: title.to_lowercase(),
            title,
            author,
            description: payload.description,
            cover_image: payload.cover_image,
            format,
            categories: categories.clone(),
            status,
            rating_sum: 0,
            rating_count: 0,
            chapter_count: 0,
            total_views: 0,
            metadata: payload.metadata,
            tags: normalize_tags(payload.tags),
            uploaded_by: Some(uploader.id.clone()),
            is_trending: false,
            is_featured: false,
            is_published: true,
            published_at: now,
            created_at: now,
            updated_at: now,
        };

        if !categories.is_empty() {
            self.run_db(move |db| {
                for id in &categories {
                    db.adjust_category_book_count(id, 1)?;
                }
                Ok(())
            })
            .await?;
        }

        let created = book.clone();
        self.run_db(move |db| db.create_book(&created)).await?;

        Ok(book)
    }

    /// Fetch a book with categories, uploader and chapter list expanded.
    /// The view-count increment is detached: it must never delay or fail
    /// the read.
    pub async fn get_book_detail(&self, id: &str) -> Result<BookDetail> {
        parse_id(id)?;

        let lookup_id = id.to_string();
        let book = self
            .run_db(move |db| db.get_book(&lookup_id))
            .await?
            .ok_or_else(|| AppError::NotFound(format!("Book not found: {}", id)))?;

        let view_id = book.id.clone();
        self.spawn_detached("View count increment", move |db| {
            db.increment_book_views(&view_id)
        });

        let cat_book_id = book.id.clone();
        let categories = self
            .run_db(move |db| db.categories_for_book(&cat_book_id))
            .await?;

        let uploader = match book.uploaded_by.clone() {
            Some(user_id) => self.run_db(move |db| db.get_user_by_id(&user_id)).await?,
            None => None,
        };

        let chapters_book_id = book.id.clone();
        let chapters = self
            .run_db(move |db| db.list_chapters(&chapters_book_id))
            .await?;

        Ok(BookDetail {
            book,
            categories,
            uploader,
            chapters,
        })
    }

    /// Update a book through the allow-list. Only the original uploader
    /// or an admin may do this.
    pub async fn update_book(&self, id: &str, payload: BookUpdate, user: &User) -> Result<Book> {
        parse_id(id)?;

        let lookup_id = id.to_string();
        let mut book = self
            .run_db(move |db| db.get_book(&lookup_id))
            .await?
            .ok_or_else(|| AppError::NotFound(format!("Book not found: {}", id)))?;

        if !user.is_admin() && book.uploaded_by.as_deref() != Some(user.id.as_str()) {
            return Err(AppError::Forbidden(
                "Only the uploader or an admin can modify this book".to_string(),
            ));
        }

        let old_categories = book.categories.clone();

        if let Some(title) = payload.title {
            let title = title.trim().to_string();
            if title.is_empty() {
                return Err(AppError::InvalidInput("Title cannot be empty".to_string()));
            }
            book.title_lower = title.to_lowercase();
            book.title = title;
        }

        if let Some(author) = payload.author {
            let author = author.trim().to_string();
            if author.is_empty() {
                return Err(AppError::InvalidInput("Author cannot be empty".to_string()));
            }
            book.author = author;
        }

        if let Some(description) = payload.description {
            book.description = description;
        }

        if let Some(cover_image) = payload.cover_image {
            book.cover_image = cover_image;
        }

        if let Some(raw) = payload.format {
            book.format = BookFormat::parse(&raw)
                .ok_or_else(|| AppError::InvalidInput(format!("Unknown format: {}", raw)))?;
        }

        if let Some(raw) = payload.status {
            book.status = BookStatus::parse(&raw)
                .ok_or_else(|| AppError::InvalidInput(format!("Unknown status: {}", raw)))?;
        }

        if let Some(tags) = payload.tags {
            book.tags = normalize_tags(tags);
        }

        if let Some(metadata) = payload.metadata {
            book.metadata = metadata;
        }

        if let Some(is_trending) = payload.is_trending {
            book.is_trending = is_trending;
        }

        if let Some(is_featured) = payload.is_featured {
            book.is_featured = is_featured;
        }

        if let Some(is_published) = payload.is_published {
            book.is_published = is_published;
        }

        if let Some(categories) = payload.categories {
            book.categories = self.validate_categories(categories).await?;
        }

        book.updated_at = now_timestamp();

        let updated = book.clone();
        self.run_db(move |db| db.update_book(&updated)).await?;

        // Membership diffs adjust the denormalized counts; a failed
        // adjustment is logged, not rolled back.
        let added: Vec<String> = book
            .categories
            .iter()
            .filter(|id| !old_categories.contains(id))
            .cloned()
            .collect();
        let removed: Vec<String> = old_categories
            .iter()
            .filter(|id| !book.categories.contains(id))
            .cloned()
            .collect();

        if !added.is_empty() || !removed.is_empty() {
            let result = self
                .run_db(move |db| {
                    for id in &added {
                        db.adjust_category_book_count(id, 1)?;
                    }
                    for id in &removed {
                        db.adjust_category_book_count(id, -1)?;
                    }
                    Ok(())
                })
                .await;
            if let Err(e) = result {
                tracing::warn!(error = %e, book = %book.id, "Category count adjustment failed");
            }
        }

        Ok(book)
    }

    /// Delete a book. Admin only. Chapters, bookmarks and category counts
    /// are handled concurrently, and all three are attempted before the
    /// book row is removed; failures are logged, never rolled back.
    pub async fn delete_book(&self, id: &str, user: &User) -> Result<()> {
        if !user.is_admin() {
            return Err(AppError::Forbidden("Admin access required".to_string()));
        }

        parse_id(id)?;

        let lookup_id = id.to_string();
        let book = self
            .run_db(move |db| db.get_book(&lookup_id))
            .await?
            .ok_or_else(|| AppError::NotFound(format!("Book not found: {}", id)))?;

        let chapters_id = book.id.clone();
        let bookmarks_id = book.id.clone();
        let category_ids = book.categories.clone();

        let (chapters, bookmarks, counts) = tokio::join!(
            self.run_db(move |db| db.delete_chapters_for_book(&chapters_id)),
            self.run_db(move |db| db.delete_bookmarks_for_book(&bookmarks_id)),
            self.run_db(move |db| {
                for category_id in &category_ids {
                    db.adjust_category_book_count(category_id, -1)?;
                }
                Ok(())
            }),
        );

        match chapters {
            Ok(n) => tracing::debug!(book = %book.id, chapters = n, "Cascaded chapter delete"),
            Err(e) => tracing::warn!(error = %e, book = %book.id, "Chapter cascade failed"),
        }
        match bookmarks {
            Ok(n) => tracing::debug!(book = %book.id, bookmarks = n, "Cascaded bookmark delete"),
            Err(e) => tracing::warn!(error = %e, book = %book.id, "Bookmark cascade failed"),
        }
        if let Err(e) = counts {
            tracing::warn!(error = %e, book = %book.id, "Category count decrement failed");
        }

        let delete_id = book.id.clone();
        self.run_db(move |db| db.delete_book(&delete_id)).await?;

        tracing::info!(book = %book.id, title = %book.title, "Book deleted");
        Ok(())
    }

    /// Validate a category id set: shape-check each id, drop duplicates,
    /// and require every id to exist (count-matches-length).
    async fn validate_categories(&self, ids: Vec<String>) -> Result<Vec<String>> {
        let mut unique: Vec<String> = Vec::with_capacity(ids.len());
        for id in ids {
            parse_id(&id)?;
            if !unique.contains(&id) {
                unique.push(id);
            }
        }

        if unique.is_empty() {
            return Ok(unique);
        }

        let check = unique.clone();
        let found = self.run_db(move |db| db.count_categories(&check)).await?;
        if found != unique.len() as i64 {
            return Err(AppError::InvalidInput(
                "One or more categories do not exist".to_string(),
            ));
        }

        Ok(unique)
    }

    // ========== CHAPTERS ==========

    /// Add a chapter to a book. The content variant is keyed by the
    /// book's format and word/page counts are derived at write time.
    pub async fn add_chapter(
        &self,
        book_id: &str,
        payload: NewChapter,
        user: &User,
    ) -> Result<Chapter> {
        parse_id(book_id)?;

        let lookup_id = book_id.to_string();
        let book = self
            .run_db(move |db| db.get_book(&lookup_id))
            .await?
            .ok_or_else(|| AppError::NotFound(format!("Book not found: {}", book_id)))?;

        if !user.is_admin() && book.uploaded_by.as_deref() != Some(user.id.as_str()) {
            return Err(AppError::Forbidden(
                "Only the uploader or an admin can add chapters".to_string(),
            ));
        }

        let chapter_number = payload
            .chapter_number
            .ok_or_else(|| AppError::InvalidInput("chapterNumber is required".to_string()))?;

        let content = if book.format.is_visual() {
            if payload.content.is_some() {
                return Err(AppError::InvalidInput(format!(
                    "{} chapters carry page images, not text content",
                    book.format.as_str()
                )));
            }
            let pages = payload.pages.unwrap_or_default();
            if pages.is_empty() {
                return Err(AppError::InvalidInput(
                    "pages are required for visual formats".to_string(),
                ));
            }
            ChapterContent::Pages(pages)
        } else {
            if payload.pages.is_some() {
                return Err(AppError::InvalidInput(format!(
                    "{} chapters carry text content, not pages",
                    book.format.as_str()
                )));
            }
            let body = payload.content.unwrap_or_default();
            if body.trim().is_empty() {
                return Err(AppError::InvalidInput(
                    "content is required for text formats".to_string(),
                ));
            }
            ChapterContent::Text(body)
        };

        let now = now_timestamp();
        let chapter = Chapter {
            id: uuid::Uuid::new_v4().to_string(),
            book_id: book.id.clone(),
            chapter_number,
            title: payload.title,
            word_count: content.word_count(),
            page_count: content.page_count(),
            content,
            views: 0,
            is_premium: payload.is_premium,
            unlock_cost: payload.unlock_cost,
            published_at: now,
            created_at: now,
            updated_at: now,
        };

        let created = chapter.clone();
        self.run_db(move |db| db.create_chapter(&created)).await?;

        let count_book_id = book.id.clone();
        if let Err(e) = self
            .run_db(move |db| db.adjust_chapter_count(&count_book_id, 1))
            .await
        {
            tracing::warn!(error = %e, book = %book.id, "Chapter count increment failed");
        }

        Ok(chapter)
    }

    /// Read a chapter with its content. The chapter and book view bumps
    /// are detached from the request.
    pub async fn read_chapter(&self, book_id: &str, number: i64) -> Result<Chapter> {
        parse_id(book_id)?;

        let lookup_id = book_id.to_string();
        let chapter = self
            .run_db(move |db| db.get_chapter(&lookup_id, number))
            .await?
            .ok_or_else(|| AppError::NotFound(format!("Chapter {} not found", number)))?;

        let chapter_id = chapter.id.clone();
        let owner_id = chapter.book_id.clone();
        self.spawn_detached("Chapter view increment", move |db| {
            db.increment_chapter_views(&chapter_id, &owner_id)
        });

        Ok(chapter)
    }

    /// Remove a chapter. Uploader or admin only.
    pub async fn remove_chapter(&self, book_id: &str, number: i64, user: &User) -> Result<()> {
        parse_id(book_id)?;

        let lookup_id = book_id.to_string();
        let book = self
            .run_db(move |db| db.get_book(&lookup_id))
            .await?
            .ok_or_else(|| AppError::NotFound(format!("Book not found: {}", book_id)))?;

        if !user.is_admin() && book.uploaded_by.as_deref() != Some(user.id.as_str()) {
            return Err(AppError::Forbidden(
                "Only the uploader or an admin can remove chapters".to_string(),
            ));
        }

        let delete_book_id = book.id.clone();
        let deleted = self
            .run_db(move |db| db.delete_chapter(&delete_book_id, number))
            .await?;
        if !deleted {
            return Err(AppError::NotFound(format!("Chapter {} not found", number)));
        }

        let count_book_id = book.id.clone();
        if let Err(e) = self
            .run_db(move |db| db.adjust_chapter_count(&count_book_id, -1))
            .await
        {
            tracing::warn!(error = %e, book = %book.id, "Chapter count decrement failed");
        }

        Ok(())
    }

    // ========== CATEGORIES ==========

    /// Create a category. Admin only; the parent must exist when given.
    pub async fn create_category(&self, payload: NewCategory, user: &User) -> Result<Category> {
        if !user.is_admin() {
            return Err(AppError::Forbidden("Admin access required".to_string()));
        }

        let name = payload.name.trim().to_string();
        if name.is_empty() {
            return Err(AppError::InvalidInput("name is required".to_string()));
        }

        let slug = payload.slug.trim().to_lowercase();
        if slug.is_empty() {
            return Err(AppError::InvalidInput("slug is required".to_string()));
        }
        if !slug
            .chars()
            .all(|c| c.is_ascii_lowercase() || c.is_ascii_digit() || c == '-')
        {
            return Err(AppError::InvalidInput(
                "slug may only contain lowercase letters, digits and dashes".to_string(),
            ));
        }

        if let Some(parent_id) = payload.parent.as_deref() {
            parse_id(parent_id)?;
            let check_id = parent_id.to_string();
            let parent = self.run_db(move |db| db.get_category(&check_id)).await?;
            if parent.is_none() {
                return Err(AppError::InvalidInput(
                    "Parent category not found".to_string(),
                ));
            }
        }

        let now = now_timestamp();
        let category = Category {
            id: uuid::Uuid::new_v4().to_string(),
            name,
            slug,
            description: payload.description,
            icon: payload.icon,
            parent_id: payload.parent,
            is_featured: payload.is_featured,
            book_count: 0,
            created_at: now,
            updated_at: now,
        };

        let created = category.clone();
        self.run_db(move |db| db.create_category(&created)).await?;

        Ok(category)
    }

    /// The two-level category tree, optionally featured roots only.
    /// Returns the total category count alongside the tree.
    pub async fn category_tree(&self, featured_only: bool) -> Result<(i64, Vec<CategoryNode>)> {
        let categories = self
            .run_db(move |db| db.list_categories(featured_only))
            .await?;
        let total = categories.len() as i64;
        Ok((total, build_category_tree(categories)))
    }

    /// Resolve a single category by slug.
    pub async fn category_by_slug(&self, slug: &str) -> Result<Category> {
        let lookup = slug.to_string();
        self.run_db(move |db| db.get_category_by_slug(&lookup))
            .await?
            .ok_or_else(|| AppError::NotFound(format!("Category not found: {}", slug)))
    }

    // ========== BOOKMARKS ==========

    /// Upsert the caller's bookmark for a book. A rating change feeds the
    /// book's aggregate incrementally; a transition into `completed`
    /// bumps the caller's books-completed stat.
    pub async fn save_reading_status(
        &self,
        user: &User,
        payload: ReadingStatusUpdate,
    ) -> Result<Bookmark> {
        if payload.book_id.is_empty() {
            return Err(AppError::InvalidInput("bookId is required".to_string()));
        }
        parse_id(&payload.book_id)?;

        if let Some(rating) = payload.user_rating {
            if !(1..=5).contains(&rating) {
                return Err(AppError::InvalidInput(
                    "userRating must be between 1 and 5".to_string(),
                ));
            }
        }

        let lookup_id = payload.book_id.clone();
        let book = self
            .run_db(move |db| db.get_book(&lookup_id))
            .await?
            .ok_or_else(|| AppError::NotFound(format!("Book not found: {}", payload.book_id)))?;

        let user_id = user.id.clone();
        let book_id = book.id.clone();
        let existing = self
            .run_db(move |db| db.get_bookmark(&user_id, &book_id))
            .await?;

        let status = match payload.status.as_deref() {
            Some(raw) => Some(ReadingStatus::parse(raw).ok_or_else(|| {
                AppError::InvalidInput(format!("Unknown reading status: {}", raw))
            })?),
            None => None,
        };

        let now = now_timestamp();
        let old_status = existing.as_ref().map(|b| b.reading_status);
        let old_rating = existing.as_ref().and_then(|b| b.user_rating);

        let bookmark = match existing {
            Some(mut bookmark) => {
                if let Some(chapter_id) = payload.chapter_id {
                    bookmark.chapter_id = Some(chapter_id);
                }
                if let Some(number) = payload.last_chapter_number {
                    bookmark.last_chapter_number = number;
                }
                if let Some(position) = payload.position {
                    bookmark.position = position;
                }
                if let Some(status) = status {
                    bookmark.reading_status = status;
                }
                if let Some(rating) = payload.user_rating {
                    bookmark.user_rating = Some(rating);
                }
                if let Some(note) = payload.note {
                    bookmark.note = note;
                }
                bookmark.last_read_at = now;
                bookmark.updated_at = now;
                bookmark
            }
            None => Bookmark {
                id: uuid::Uuid::new_v4().to_string(),
                user_id: user.id.clone(),
                book_id: book.id.clone(),
                chapter_id: payload.chapter_id,
                last_chapter_number: payload.last_chapter_number.unwrap_or(0),
                position: payload.position.unwrap_or_default(),
                reading_status: status.unwrap_or(ReadingStatus::PlanToRead),
                user_rating: payload.user_rating,
                note: payload.note.unwrap_or_default(),
                last_read_at: now,
                created_at: now,
                updated_at: now,
            },
        };

        let saved = bookmark.clone();
        self.run_db(move |db| db.upsert_bookmark(&saved)).await?;

        // Incremental aggregate maintenance, co-located with the write.
        if let Some(new_rating) = payload.user_rating {
            let (sum_delta, count_delta) = match old_rating {
                Some(old) => (new_rating - old, 0),
                None => (new_rating, 1),
            };
            if sum_delta != 0 || count_delta != 0 {
                let rated_book_id = book.id.clone();
                if let Err(e) = self
                    .run_db(move |db| db.apply_rating_delta(&rated_book_id, sum_delta, count_delta))
                    .await
                {
                    tracing::warn!(error = %e, book = %book.id, "Rating aggregate update failed");
                }
            }
        }

        if bookmark.reading_status == ReadingStatus::Completed
            && old_status != Some(ReadingStatus::Completed)
        {
            let stats_user_id = user.id.clone();
            if let Err(e) = self
                .run_db(move |db| db.bump_books_completed(&stats_user_id))
                .await
            {
                tracing::warn!(error = %e, user = %user.id, "Stats update failed");
            }
        }

        Ok(bookmark)
    }

    /// The caller's bookmarks, most recently read first, optionally
    /// filtered by reading status, each paired with its book.
    pub async fn bookmarks_for_user(
        &self,
        user: &User,
        status: Option<&str>,
    ) -> Result<Vec<BookmarkEntry>> {
        let status = match status {
            Some(raw) => Some(ReadingStatus::parse(raw).ok_or_else(|| {
                AppError::InvalidInput(format!("Unknown reading status: {}", raw))
            })?),
            None => None,
        };

        let user_id = user.id.clone();
        let bookmarks = self
            .run_db(move |db| db.list_bookmarks_for_user(&user_id, status))
            .await?;

        let mut entries = Vec::with_capacity(bookmarks.len());
        for bookmark in bookmarks {
            let book_id = bookmark.book_id.clone();
            let book = self.run_db(move |db| db.get_book(&book_id)).await?;
            entries.push(BookmarkEntry { bookmark, book });
        }

        Ok(entries)
    }
}

/// Build the two-level category tree: partition into roots and children,
/// then attach each child under its parent by id.
pub fn build_category_tree(categories: Vec<Category>) -> Vec<CategoryNode> {
    let (roots, children): (Vec<Category>, Vec<Category>) = categories
        .into_iter()
        .partition(|category| category.parent_id.is_none());

    roots
        .into_iter()
        .map(|root| {
            let nested: Vec<Category> = children
                .iter()
                .filter(|child| child.parent_id.as_deref() == Some(root.id.as_str()))
                .cloned()
                .collect();
            CategoryNode {
                category: root,
                children: nested,
            }
        })
        .collect()
}

/// Trim, lowercase and dedupe a tag set.
fn normalize_tags(tags: Vec<String>) -> Vec<String> {
    let mut normalized: Vec<String> = Vec::with_capacity(tags.len());
    for tag in tags {
        let tag = tag.trim().to_lowercase();
        if !tag.is_empty() && !normalized.contains(&tag) {
            normalized.push(tag);
        }
    }
    normalized
}
