mod schema;

pub use schema::Database;

use crate::error::{AppError, Result};
use chrono::Utc;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;

/// Serialized-fiction medium of a book.
///
/// Determines which chapter content variant applies and how a reader
/// renders it (text scroll vs panel pages vs vertical scroll).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum BookFormat {
    /// Prose novel (text chapters).
    Novel,
    /// Japanese comic (right-to-left pages).
    Manga,
    /// Korean comic (vertical scroll).
    Manhwa,
    /// Chinese comic.
    Manhua,
    /// Western comic.
    Comic,
    /// Illustrated light novel (text chapters).
    LightNovel,
    /// Vertical-scroll webtoon.
    Webtoon,
}

impl BookFormat {
    /// Wire name of the format.
    pub fn as_str(&self) -> &'static str {
        match self {
            BookFormat::Novel => "novel",
            BookFormat::Manga => "manga",
            BookFormat::Manhwa => "manhwa",
            BookFormat::Manhua => "manhua",
            BookFormat::Comic => "comic",
            BookFormat::LightNovel => "lightNovel",
            BookFormat::Webtoon => "webtoon",
        }
    }

    /// Parse a wire name. The set is fixed; anything else is rejected
    /// at the call site with `InvalidInput`.
    pub fn parse(raw: &str) -> Option<Self> {
        match raw {
            "novel" => Some(BookFormat::Novel),
            "manga" => Some(BookFormat::Manga),
            "manhwa" => Some(BookFormat::Manhwa),
            "manhua" => Some(BookFormat::Manhua),
            "comic" => Some(BookFormat::Comic),
            "lightNovel" => Some(BookFormat::LightNovel),
            "webtoon" => Some(BookFormat::Webtoon),
            _ => None,
        }
    }

    /// Whether chapters of this format carry page images rather than text.
    pub fn is_visual(&self) -> bool {
        !matches!(self, BookFormat::Novel | BookFormat::LightNovel)
    }
}

/// Publication status of a book.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum BookStatus {
    /// Still releasing chapters.
    Ongoing,
    /// Fully released.
    Completed,
    /// On hiatus.
    Hiatus,
    /// Abandoned by the author.
    Dropped,
}

impl BookStatus {
    /// Wire name of the status.
    pub fn as_str(&self) -> &'static str {
        match self {
            BookStatus::Ongoing => "ongoing",
            BookStatus::Completed => "completed",
            BookStatus::Hiatus => "hiatus",
            BookStatus::Dropped => "dropped",
        }
    }

    /// Parse a wire name.
    pub fn parse(raw: &str) -> Option<Self> {
        match raw {
            "ongoing" => Some(BookStatus::Ongoing),
            "completed" => Some(BookStatus::Completed),
            "hiatus" => Some(BookStatus::Hiatus),
            "dropped" => Some(BookStatus::Dropped),
            _ => None,
        }
    }
}

/// User role.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum Role {
    /// Regular reader account.
    Reader,
    /// Can upload and manage own books.
    Author,
    /// Full access.
    Admin,
}

impl Role {
    /// Wire name of the role.
    pub fn as_str(&self) -> &'static str {
        match self {
            Role::Reader => "reader",
            Role::Author => "author",
            Role::Admin => "admin",
        }
    }

    /// Parse a wire name.
    pub fn parse(raw: &str) -> Option<Self> {
        match raw {
            "reader" => Some(Role::Reader),
            "author" => Some(Role::Author),
            "admin" => Some(Role::Admin),
            _ => None,
        }
    }
}

/// Reading-list status of a bookmark.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum ReadingStatus {
    /// Currently reading.
    Reading,
    /// Finished.
    Completed,
    /// On the to-read list.
    PlanToRead,
    /// Gave up.
    Dropped,
    /// Paused.
    OnHold,
}

impl ReadingStatus {
    /// Wire name of the status.
    pub fn as_str(&self) -> &'static str {
        match self {
            ReadingStatus::Reading => "reading",
            ReadingStatus::Completed => "completed",
            ReadingStatus::PlanToRead => "planToRead",
            ReadingStatus::Dropped => "dropped",
            ReadingStatus::OnHold => "onHold",
        }
    }

    /// Parse a wire name.
    pub fn parse(raw: &str) -> Option<Self> {
        match raw {
            "reading" => Some(ReadingStatus::Reading),
            "completed" => Some(ReadingStatus::Completed),
            "planToRead" => Some(ReadingStatus::PlanToRead),
            "dropped" => Some(ReadingStatus::Dropped),
            "onHold" => Some(ReadingStatus::OnHold),
            _ => None,
        }
    }
}

/// Catalog book.
#[derive(Debug, Clone)]
pub struct Book {
    /// Unique book ID.
    pub id: String,
    /// Display title.
    pub title: String,
    /// Lowercase title, re-derived on every write.
    pub title_lower: String,
    /// Primary author.
    pub author: String,
    /// Synopsis.
    pub description: String,
    /// Cover image reference (URL).
    pub cover_image: String,
    /// Serialized-fiction medium.
    pub format: BookFormat,
    /// Referenced category IDs.
    pub categories: Vec<String>,
    /// Publication status.
    pub status: BookStatus,
    /// Sum of all user ratings. Average is sum/count, never a scan.
    pub rating_sum: i64,
    /// Number of user ratings.
    pub rating_count: i64,
    /// Denormalized chapter count, maintained on chapter add/remove.
    pub chapter_count: i64,
    /// Total views across all chapters.
    pub total_views: i64,
    /// Format-specific metadata (reading direction, language, ...).
    pub metadata: HashMap<String, String>,
    /// Lowercase discovery tags.
    pub tags: Vec<String>,
    /// Uploading user ID, if community content.
    pub uploaded_by: Option<String>,
    /// Shown in the trending rail.
    pub is_trending: bool,
    /// Shown in the featured rail.
    pub is_featured: bool,
    /// Visible in public listings.
    pub is_published: bool,
    /// Publish timestamp.
    pub published_at: i64,
    /// Creation timestamp.
    pub created_at: i64,
    /// Last update timestamp.
    pub updated_at: i64,
}

impl Book {
    /// Average rating, 0 when nobody has rated yet.
    pub fn average_rating(&self) -> f64 {
        if self.rating_count == 0 {
            0.0
        } else {
            self.rating_sum as f64 / self.rating_count as f64
        }
    }
}

/// Chapter payload, keyed by the owning book's format.
///
/// Exactly one variant is populated per chapter: text for novels and
/// light novels, an ordered page-image sequence for visual formats.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum ChapterContent {
    /// Prose body for text formats.
    Text(String),
    /// Ordered page-image references for visual formats.
    Pages(Vec<String>),
}

impl ChapterContent {
    /// Word count, derived from the text body at write time.
    pub fn word_count(&self) -> i64 {
        match self {
            ChapterContent::Text(body) => body.split_whitespace().count() as i64,
            ChapterContent::Pages(_) => 0,
        }
    }

    /// Page count, derived from the page sequence at write time.
    pub fn page_count(&self) -> i64 {
        match self {
            ChapterContent::Text(_) => 0,
            ChapterContent::Pages(images) => images.len() as i64,
        }
    }
}

/// Book chapter. Owned exclusively by its book.
#[derive(Debug, Clone)]
pub struct Chapter {
    /// Unique chapter ID.
    pub id: String,
    /// Owning book ID.
    pub book_id: String,
    /// Chapter number, unique per book.
    pub chapter_number: i64,
    /// Chapter title.
    pub title: String,
    /// Content payload.
    pub content: ChapterContent,
    /// Derived word count.
    pub word_count: i64,
    /// Derived page count.
    pub page_count: i64,
    /// View count.
    pub views: i64,
    /// Behind a paywall.
    pub is_premium: bool,
    /// Unlock price in credits (0 = free).
    pub unlock_cost: i64,
    /// Publish timestamp.
    pub published_at: i64,
    /// Creation timestamp.
    pub created_at: i64,
    /// Last update timestamp.
    pub updated_at: i64,
}

/// Chapter listing entry for book detail views. Never carries content
/// or page references, to keep detail payloads small.
#[derive(Debug, Clone)]
pub struct ChapterSummary {
    /// Chapter ID.
    pub id: String,
    /// Chapter number.
    pub chapter_number: i64,
    /// Chapter title.
    pub title: String,
    /// Derived word count.
    pub word_count: i64,
    /// Derived page count.
    pub page_count: i64,
    /// View count.
    pub views: i64,
    /// Behind a paywall.
    pub is_premium: bool,
    /// Publish timestamp.
    pub published_at: i64,
}

/// Genre category, optionally nested one level under a parent.
#[derive(Debug, Clone)]
pub struct Category {
    /// Unique category ID.
    pub id: String,
    /// Display name, unique.
    pub name: String,
    /// URL-safe lowercase identifier, unique.
    pub slug: String,
    /// Short description.
    pub description: String,
    /// Emoji or icon class for UI display.
    pub icon: String,
    /// Parent category ID for sub-genres.
    pub parent_id: Option<String>,
    /// Shown in navigation.
    pub is_featured: bool,
    /// Denormalized count of books referencing this category.
    pub book_count: i64,
    /// Creation timestamp.
    pub created_at: i64,
    /// Last update timestamp.
    pub updated_at: i64,
}

/// Incrementally maintained per-user reading statistics. Never derived
/// by aggregation.
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct UserStats {
    /// Total pages read.
    pub pages_read: i64,
    /// Total chapters read.
    pub chapters_read: i64,
    /// Total minutes read.
    pub minutes_read: i64,
    /// Books marked completed.
    pub books_completed: i64,
    /// Current daily reading streak.
    pub current_streak: i64,
    /// Longest daily reading streak.
    pub longest_streak: i64,
}

/// User account.
#[derive(Debug, Clone)]
pub struct User {
    /// Unique user ID.
    pub id: String,
    /// Username for login, unique, 3-30 chars.
    pub username: String,
    /// Email, unique, stored lowercase.
    pub email: String,
    /// Argon2 password hash. Never serialized.
    pub password_hash: String,
    /// Account role.
    pub role: Role,
    /// Avatar image reference.
    pub avatar: String,
    /// Profile bio.
    pub bio: String,
    /// Reading statistics.
    pub stats: UserStats,
    /// Credits balance for premium unlocks.
    pub credits: i64,
    /// Email verified.
    pub is_verified: bool,
    /// Account active.
    pub is_active: bool,
    /// Creation timestamp.
    pub created_at: i64,
    /// Last update timestamp.
    pub updated_at: i64,
}

impl User {
    /// Whether this user holds the admin role.
    pub fn is_admin(&self) -> bool {
        self.role == Role::Admin
    }
}

/// Format-specific position within a chapter. All three fields are
/// always present; only the one matching the book's format is meaningful.
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ReadingPosition {
    /// Scroll percentage for novels.
    pub scroll_percent: f64,
    /// Page index for manga.
    pub page: i64,
    /// Scroll offset for continuous-scroll formats.
    pub scroll_y: i64,
}

/// Per-user reading state for a book. One bookmark per (user, book).
#[derive(Debug, Clone)]
pub struct Bookmark {
    /// Unique bookmark ID.
    pub id: String,
    /// Owning user ID.
    pub user_id: String,
    /// Bookmarked book ID.
    pub book_id: String,
    /// Last chapter the user was reading.
    pub chapter_id: Option<String>,
    /// Denormalized last chapter number for quick display.
    pub last_chapter_number: i64,
    /// Format-specific position within the chapter.
    pub position: ReadingPosition,
    /// Reading-list status.
    pub reading_status: ReadingStatus,
    /// Personal 1-5 rating, if given.
    pub user_rating: Option<i64>,
    /// Personal note.
    pub note: String,
    /// When the user last opened this book; drives "continue reading".
    pub last_read_at: i64,
    /// Creation timestamp.
    pub created_at: i64,
    /// Last update timestamp.
    pub updated_at: i64,
}

/// Timestamp helper.
pub fn now_timestamp() -> i64 {
    Utc::now().timestamp()
}

/// Validate an entity id's shape. A malformed id is an input error,
/// not a missing entity.
pub fn parse_id(id: &str) -> Result<()> {
    uuid::Uuid::parse_str(id)
        .map(|_| ())
        .map_err(|_| AppError::InvalidInput(format!("Invalid id: {}", id)))
}
