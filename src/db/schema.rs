use crate::catalog::query::ComposedQuery;
use crate::db::*;
use crate::error::{AppError, Result};
use parking_lot::Mutex;
use rusqlite::types::Value;
use rusqlite::{Connection, OptionalExtension, params, params_from_iter};
use std::path::Path;
use std::sync::Arc;

/// Book column list shared by every book-returning query.
const BOOK_COLUMNS: &str = "b.id, b.title, b.title_lower, b.author, b.description, b.cover_image, \
     b.format, b.status, b.rating_sum, b.rating_count, b.chapter_count, b.total_views, \
     b.metadata_json, b.tags_json, b.uploaded_by, b.is_trending, b.is_featured, b.is_published, \
     b.published_at, b.created_at, b.updated_at";

/// Database wrapper for thread-safe access.
#[derive(Clone)]
pub struct Database {
    conn: Arc<Mutex<Connection>>,
}

impl Database {
    /// Open or create database at the given path.
    pub fn open(path: &Path) -> Result<Self> {
        // Create parent directories if needed
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)
                .map_err(|e| AppError::Internal(format!("Failed to create data dir: {}", e)))?;
        }

        let conn = Connection::open(path)
            .map_err(|e| AppError::Internal(format!("Failed to open database: {}", e)))?;

        let db = Self {
            conn: Arc::new(Mutex::new(conn)),
        };

        db.initialize_schema()?;
        Ok(db)
    }

    /// Open in-memory database (for testing).
    pub fn open_memory() -> Result<Self> {
        let conn = Connection::open_in_memory()
            .map_err(|e| AppError::Internal(format!("Failed to open database: {}", e)))?;

        let db = Self {
            conn: Arc::new(Mutex::new(conn)),
        };

        db.initialize_schema()?;
        Ok(db)
    }

    /// Initialize database schema.
    fn initialize_schema(&self) -> Result<()> {
        let conn = self.conn.lock();

        conn.execute_batch(
            r#"
            -- Users table
            CREATE TABLE IF NOT EXISTS users (
                id TEXT PRIMARY KEY,
                username TEXT UNIQUE NOT NULL,
                email TEXT UNIQUE NOT NULL,
                password_hash TEXT NOT NULL,
                role TEXT NOT NULL DEFAULT 'reader',
                avatar TEXT NOT NULL DEFAULT '',
                bio TEXT NOT NULL DEFAULT '',
                pages_read INTEGER NOT NULL DEFAULT 0,
                chapters_read INTEGER NOT NULL DEFAULT 0,
                minutes_read INTEGER NOT NULL DEFAULT 0,
                books_completed INTEGER NOT NULL DEFAULT 0,
                current_streak INTEGER NOT NULL DEFAULT 0,
                longest_streak INTEGER NOT NULL DEFAULT 0,
                credits INTEGER NOT NULL DEFAULT 0,
                is_verified INTEGER NOT NULL DEFAULT 0,
                is_active INTEGER NOT NULL DEFAULT 1,
                created_at INTEGER NOT NULL,
                updated_at INTEGER NOT NULL
            );

            -- Categories table (two-level genre tree)
            CREATE TABLE IF NOT EXISTS categories (
                id TEXT PRIMARY KEY,
                name TEXT UNIQUE NOT NULL,
                slug TEXT UNIQUE NOT NULL,
                description TEXT NOT NULL DEFAULT '',
                icon TEXT NOT NULL DEFAULT '',
                parent_id TEXT,
                is_featured INTEGER NOT NULL DEFAULT 0,
                book_count INTEGER NOT NULL DEFAULT 0,
                created_at INTEGER NOT NULL,
                updated_at INTEGER NOT NULL,
                FOREIGN KEY (parent_id) REFERENCES categories(id) ON DELETE SET NULL
            );

            -- Books table
            CREATE TABLE IF NOT EXISTS books (
                id TEXT PRIMARY KEY,
                title TEXT NOT NULL,
                title_lower TEXT NOT NULL,
                author TEXT NOT NULL,
                description TEXT NOT NULL DEFAULT '',
                cover_image TEXT NOT NULL DEFAULT '',
                format TEXT NOT NULL,
                status TEXT NOT NULL DEFAULT 'ongoing',
                rating_sum INTEGER NOT NULL DEFAULT 0,
                rating_count INTEGER NOT NULL DEFAULT 0,
                chapter_count INTEGER NOT NULL DEFAULT 0,
                total_views INTEGER NOT NULL DEFAULT 0,
                metadata_json TEXT NOT NULL DEFAULT '{}',
                tags_json TEXT NOT NULL DEFAULT '[]',
                uploaded_by TEXT,
                is_trending INTEGER NOT NULL DEFAULT 0,
                is_featured INTEGER NOT NULL DEFAULT 0,
                is_published INTEGER NOT NULL DEFAULT 1,
                published_at INTEGER NOT NULL,
                created_at INTEGER NOT NULL,
                updated_at INTEGER NOT NULL,
                UNIQUE (title, format),
                FOREIGN KEY (uploaded_by) REFERENCES users(id) ON DELETE SET NULL
            );

            -- Book/category membership
            CREATE TABLE IF NOT EXISTS book_categories (
                book_id TEXT NOT NULL,
                category_id TEXT NOT NULL,
                PRIMARY KEY (book_id, category_id),
                FOREIGN KEY (book_id) REFERENCES books(id) ON DELETE CASCADE,
                FOREIGN KEY (category_id) REFERENCES categories(id) ON DELETE CASCADE
            );

            -- Chapters table
            CREATE TABLE IF NOT EXISTS chapters (
                id TEXT PRIMARY KEY,
                book_id TEXT NOT NULL,
                chapter_number INTEGER NOT NULL,
                title TEXT NOT NULL DEFAULT '',
                content TEXT,
                pages_json TEXT,
                word_count INTEGER NOT NULL DEFAULT 0,
                page_count INTEGER NOT NULL DEFAULT 0,
                views INTEGER NOT NULL DEFAULT 0,
                is_premium INTEGER NOT NULL DEFAULT 0,
                unlock_cost INTEGER NOT NULL DEFAULT 0,
                published_at INTEGER NOT NULL,
                created_at INTEGER NOT NULL,
                updated_at INTEGER NOT NULL,
                UNIQUE (book_id, chapter_number),
                FOREIGN KEY (book_id) REFERENCES books(id) ON DELETE CASCADE
            );

            -- Bookmarks table (one per user/book pair)
            CREATE TABLE IF NOT EXISTS bookmarks (
                id TEXT PRIMARY KEY,
                user_id TEXT NOT NULL,
                book_id TEXT NOT NULL,
                chapter_id TEXT,
                last_chapter_number INTEGER NOT NULL DEFAULT 0,
                scroll_percent REAL NOT NULL DEFAULT 0,
                page INTEGER NOT NULL DEFAULT 0,
                scroll_y INTEGER NOT NULL DEFAULT 0,
                reading_status TEXT NOT NULL DEFAULT 'planToRead',
                user_rating INTEGER,
                note TEXT NOT NULL DEFAULT '',
                last_read_at INTEGER NOT NULL,
                created_at INTEGER NOT NULL,
                updated_at INTEGER NOT NULL,
                UNIQUE (user_id, book_id),
                FOREIGN KEY (user_id) REFERENCES users(id) ON DELETE CASCADE,
                FOREIGN KEY (book_id) REFERENCES books(id) ON DELETE CASCADE,
                FOREIGN KEY (chapter_id) REFERENCES chapters(id) ON DELETE SET NULL
            );

            -- Indexes covering the common discovery patterns
            CREATE INDEX IF NOT EXISTS idx_books_title_lower ON books(title_lower);
            CREATE INDEX IF NOT EXISTS idx_books_format ON books(format);
            CREATE INDEX IF NOT EXISTS idx_books_status ON books(status);
            CREATE INDEX IF NOT EXISTS idx_books_trending ON books(is_trending, total_views DESC);
            CREATE INDEX IF NOT EXISTS idx_books_created ON books(created_at DESC);
            CREATE INDEX IF NOT EXISTS idx_books_rating_count ON books(rating_count DESC);
            CREATE INDEX IF NOT EXISTS idx_book_categories_category ON book_categories(category_id);
            CREATE INDEX IF NOT EXISTS idx_chapters_book ON chapters(book_id, chapter_number);
            CREATE INDEX IF NOT EXISTS idx_categories_parent ON categories(parent_id);
            CREATE INDEX IF NOT EXISTS idx_bookmarks_user_read ON bookmarks(user_id, last_read_at DESC);
            CREATE INDEX IF NOT EXISTS idx_bookmarks_user_status ON bookmarks(user_id, reading_status);
            CREATE INDEX IF NOT EXISTS idx_bookmarks_book ON bookmarks(book_id);

            -- Relevance index over title/author/tags
            CREATE VIRTUAL TABLE IF NOT EXISTS books_fts
                USING fts5(title, author, tags, book_id UNINDEXED);
            "#,
        )
        .map_err(|e| AppError::Internal(format!("Failed to initialize schema: {}", e)))?;

        Ok(())
    }

    // ========== USER OPERATIONS ==========

    /// Create a new user.
    pub fn create_user(&self, user: &User) -> Result<()> {
        let conn = self.conn.lock();
        conn.execute(
            "INSERT INTO users (id, username, email, password_hash, role, avatar, bio,
                pages_read, chapters_read, minutes_read, books_completed, current_streak,
                longest_streak, credits, is_verified, is_active, created_at, updated_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13, ?14, ?15, ?16, ?17, ?18)",
            params![
                user.id,
                user.username,
                user.email,
                user.password_hash,
                user.role.as_str(),
                user.avatar,
                user.bio,
                user.stats.pages_read,
                user.stats.chapters_read,
                user.stats.minutes_read,
                user.stats.books_completed,
                user.stats.current_streak,
                user.stats.longest_streak,
                user.credits,
                user.is_verified,
                user.is_active,
                user.created_at,
                user.updated_at,
            ],
        )
        .map_err(|e| {
            if e.to_string().contains("UNIQUE constraint") {
                AppError::Conflict("Username or email already taken".to_string())
            } else {
                AppError::Internal(format!("Failed to create user: {}", e))
            }
        })?;
        Ok(())
    }

    /// Get user by ID.
    pub fn get_user_by_id(&self, id: &str) -> Result<Option<User>> {
        let conn = self.conn.lock();
        conn.query_row(
            &format!("SELECT {} FROM users WHERE id = ?1", Self::USER_COLUMNS),
            params![id],
            Self::row_to_user,
        )
        .optional()
        .map_err(|e| AppError::Internal(format!("Failed to get user: {}", e)))
    }

    /// Get user by username.
    pub fn get_user_by_username(&self, username: &str) -> Result<Option<User>> {
        let conn = self.conn.lock();
        conn.query_row(
            &format!("SELECT {} FROM users WHERE username = ?1", Self::USER_COLUMNS),
            params![username],
            Self::row_to_user,
        )
        .optional()
        .map_err(|e| AppError::Internal(format!("Failed to get user: {}", e)))
    }

    /// Get user by email (stored lowercase).
    pub fn get_user_by_email(&self, email: &str) -> Result<Option<User>> {
        let conn = self.conn.lock();
        conn.query_row(
            &format!("SELECT {} FROM users WHERE email = ?1", Self::USER_COLUMNS),
            params![email],
            Self::row_to_user,
        )
        .optional()
        .map_err(|e| AppError::Internal(format!("Failed to get user: {}", e)))
    }

    /// List all users.
    pub fn list_users(&self) -> Result<Vec<User>> {
        let conn = self.conn.lock();
        let mut stmt = conn
            .prepare(&format!(
                "SELECT {} FROM users ORDER BY username",
                Self::USER_COLUMNS
            ))
            .map_err(|e| AppError::Internal(format!("Failed to prepare query: {}", e)))?;

        let users = stmt
            .query_map([], Self::row_to_user)
            .map_err(|e| AppError::Internal(format!("Failed to list users: {}", e)))?
            .collect::<std::result::Result<Vec<_>, _>>()
            .map_err(|e| AppError::Internal(format!("Failed to collect users: {}", e)))?;

        Ok(users)
    }

    /// Update user avatar and bio.
    pub fn update_user_profile(&self, id: &str, avatar: &str, bio: &str) -> Result<bool> {
        let conn = self.conn.lock();
        let rows = conn
            .execute(
                "UPDATE users SET avatar = ?1, bio = ?2, updated_at = ?3 WHERE id = ?4",
                params![avatar, bio, now_timestamp(), id],
            )
            .map_err(|e| AppError::Internal(format!("Failed to update profile: {}", e)))?;
        Ok(rows > 0)
    }

    /// Update user password hash.
    pub fn update_user_password(&self, username: &str, password_hash: &str) -> Result<bool> {
        let conn = self.conn.lock();
        let rows = conn
            .execute(
                "UPDATE users SET password_hash = ?1, updated_at = ?2 WHERE username = ?3",
                params![password_hash, now_timestamp(), username],
            )
            .map_err(|e| AppError::Internal(format!("Failed to update password: {}", e)))?;
        Ok(rows > 0)
    }

    /// Delete user.
    pub fn delete_user(&self, username: &str) -> Result<bool> {
        let conn = self.conn.lock();
        let rows = conn
            .execute("DELETE FROM users WHERE username = ?1", params![username])
            .map_err(|e| AppError::Internal(format!("Failed to delete user: {}", e)))?;
        Ok(rows > 0)
    }

    /// Bump the books-completed counter for a user.
    pub fn bump_books_completed(&self, user_id: &str) -> Result<()> {
        let conn = self.conn.lock();
        conn.execute(
            "UPDATE users SET books_completed = books_completed + 1, updated_at = ?1 WHERE id = ?2",
            params![now_timestamp(), user_id],
        )
        .map_err(|e| AppError::Internal(format!("Failed to update stats: {}", e)))?;
        Ok(())
    }

    const USER_COLUMNS: &'static str = "id, username, email, password_hash, role, avatar, bio, \
         pages_read, chapters_read, minutes_read, books_completed, current_streak, \
         longest_streak, credits, is_verified, is_active, created_at, updated_at";

    fn row_to_user(row: &rusqlite::Row<'_>) -> rusqlite::Result<User> {
        let role_raw: String = row.get(4)?;
        let role = Role::parse(&role_raw).ok_or_else(|| {
            rusqlite::Error::FromSqlConversionFailure(
                4,
                rusqlite::types::Type::Text,
                format!("unknown role: {}", role_raw).into(),
            )
        })?;

        Ok(User {
            id: row.get(0)?,
            username: row.get(1)?,
            email: row.get(2)?,
            password_hash: row.get(3)?,
            role,
            avatar: row.get(5)?,
            bio: row.get(6)?,
            stats: UserStats {
                pages_read: row.get(7)?,
                chapters_read: row.get(8)?,
                minutes_read: row.get(9)?,
                books_completed: row.get(10)?,
                current_streak: row.get(11)?,
                longest_streak: row.get(12)?,
            },
            credits: row.get(13)?,
            is_verified: row.get(14)?,
            is_active: row.get(15)?,
            created_at: row.get(16)?,
            updated_at: row.get(17)?,
        })
    }

    // ========== CATEGORY OPERATIONS ==========

    /// Create a category.
    pub fn create_category(&self, category: &Category) -> Result<()> {
        let conn = self.conn.lock();
        conn.execute(
            "INSERT INTO categories (id, name, slug, description, icon, parent_id,
                is_featured, book_count, created_at, updated_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10)",
            params![
                category.id,
                category.name,
                category.slug,
                category.description,
                category.icon,
                category.parent_id,
                category.is_featured,
                category.book_count,
                category.created_at,
                category.updated_at,
            ],
        )
        .map_err(|e| {
            if e.to_string().contains("UNIQUE constraint") {
                AppError::Conflict("Category name or slug already exists".to_string())
            } else {
                AppError::Internal(format!("Failed to create category: {}", e))
            }
        })?;
        Ok(())
    }

    /// Get category by ID.
    pub fn get_category(&self, id: &str) -> Result<Option<Category>> {
        let conn = self.conn.lock();
        conn.query_row(
            &format!(
                "SELECT {} FROM categories WHERE id = ?1",
                Self::CATEGORY_COLUMNS
            ),
            params![id],
            Self::row_to_category,
        )
        .optional()
        .map_err(|e| AppError::Internal(format!("Failed to get category: {}", e)))
    }

    /// Get category by slug.
    pub fn get_category_by_slug(&self, slug: &str) -> Result<Option<Category>> {
        let conn = self.conn.lock();
        conn.query_row(
            &format!(
                "SELECT {} FROM categories WHERE slug = ?1",
                Self::CATEGORY_COLUMNS
            ),
            params![slug],
            Self::row_to_category,
        )
        .optional()
        .map_err(|e| AppError::Internal(format!("Failed to get category: {}", e)))
    }

    /// List all categories ordered by name, optionally featured only.
    pub fn list_categories(&self, featured_only: bool) -> Result<Vec<Category>> {
        let conn = self.conn.lock();
        let sql = if featured_only {
            format!(
                "SELECT {} FROM categories WHERE is_featured = 1 ORDER BY name",
                Self::CATEGORY_COLUMNS
            )
        } else {
            format!(
                "SELECT {} FROM categories ORDER BY name",
                Self::CATEGORY_COLUMNS
            )
        };

        let mut stmt = conn
            .prepare(&sql)
            .map_err(|e| AppError::Internal(format!("Failed to prepare query: {}", e)))?;

        let categories = stmt
            .query_map([], Self::row_to_category)
            .map_err(|e| AppError::Internal(format!("Failed to list categories: {}", e)))?
            .collect::<std::result::Result<Vec<_>, _>>()
            .map_err(|e| AppError::Internal(format!("Failed to collect categories: {}", e)))?;

        Ok(categories)
    }

    /// Count how many of the given category ids exist.
    pub fn count_categories(&self, ids: &[String]) -> Result<i64> {
        if ids.is_empty() {
            return Ok(0);
        }

        let conn = self.conn.lock();
        let placeholders: Vec<&str> = ids.iter().map(|_| "?").collect();
        let sql = format!(
            "SELECT COUNT(*) FROM categories WHERE id IN ({})",
            placeholders.join(",")
        );

        conn.query_row(&sql, params_from_iter(ids.iter()), |row| row.get(0))
            .map_err(|e| AppError::Internal(format!("Failed to count categories: {}", e)))
    }

    /// Adjust a category's denormalized book count.
    pub fn adjust_category_book_count(&self, id: &str, delta: i64) -> Result<()> {
        let conn = self.conn.lock();
        conn.execute(
            "UPDATE categories SET book_count = MAX(0, book_count + ?1), updated_at = ?2
             WHERE id = ?3",
            params![delta, now_timestamp(), id],
        )
        .map_err(|e| AppError::Internal(format!("Failed to adjust book count: {}", e)))?;
        Ok(())
    }

    /// Categories referenced by a book.
    pub fn categories_for_book(&self, book_id: &str) -> Result<Vec<Category>> {
        let conn = self.conn.lock();
        let mut stmt = conn
            .prepare(&format!(
                "SELECT {} FROM categories c
                 JOIN book_categories bc ON bc.category_id = c.id
                 WHERE bc.book_id = ?1 ORDER BY c.name",
                Self::CATEGORY_COLUMNS_QUALIFIED
            ))
            .map_err(|e| AppError::Internal(format!("Failed to prepare query: {}", e)))?;

        let categories = stmt
            .query_map(params![book_id], Self::row_to_category)
            .map_err(|e| AppError::Internal(format!("Failed to get categories: {}", e)))?
            .collect::<std::result::Result<Vec<_>, _>>()
            .map_err(|e| AppError::Internal(format!("Failed to collect categories: {}", e)))?;

        Ok(categories)
    }

    const CATEGORY_COLUMNS: &'static str =
        "id, name, slug, description, icon, parent_id, is_featured, book_count, created_at, updated_at";

    const CATEGORY_COLUMNS_QUALIFIED: &'static str = "c.id, c.name, c.slug, c.description, c.icon, \
         c.parent_id, c.is_featured, c.book_count, c.created_at, c.updated_at";

    fn row_to_category(row: &rusqlite::Row<'_>) -> rusqlite::Result<Category> {
        Ok(Category {
            id: row.get(0)?,
            name: row.get(1)?,
            slug: row.get(2)?,
            description: row.get(3)?,
            icon: row.get(4)?,
            parent_id: row.get(5)?,
            is_featured: row.get(6)?,
            book_count: row.get(7)?,
            created_at: row.get(8)?,
            updated_at: row.get(9)?,
        })
    }

    // ========== BOOK OPERATIONS ==========

    /// Create a book, its category memberships and its search-index row.
    pub fn create_book(&self, book: &Book) -> Result<()> {
        let conn = self.conn.lock();
        conn.execute(
            "INSERT INTO books (id, title, title_lower, author, description, cover_image,
                format, status, rating_sum, rating_count, chapter_count, total_views,
                metadata_json, tags_json, uploaded_by, is_trending, is_featured, is_published,
                published_at, created_at, updated_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13, ?14, ?15, ?16,
                ?17, ?18, ?19, ?20, ?21)",
            params![
                book.id,
                book.title,
                book.title_lower,
                book.author,
                book.description,
                book.cover_image,
                book.format.as_str(),
                book.status.as_str(),
                book.rating_sum,
                book.rating_count,
                book.chapter_count,
                book.total_views,
                serde_json::to_string(&book.metadata).unwrap_or_default(),
                serde_json::to_string(&book.tags).unwrap_or_default(),
                book.uploaded_by,
                book.is_trending,
                book.is_featured,
                book.is_published,
                book.published_at,
                book.created_at,
                book.updated_at,
            ],
        )
        .map_err(|e| {
            if e.to_string().contains("UNIQUE constraint") {
                AppError::Conflict(format!(
                    "A {} titled '{}' already exists",
                    book.format.as_str(),
                    book.title
                ))
            } else {
                AppError::Internal(format!("Failed to create book: {}", e))
            }
        })?;

        Self::replace_book_categories(&conn, &book.id, &book.categories)?;
        Self::sync_fts(&conn, book)?;
        Ok(())
    }

    /// Get book by ID, with category memberships populated.
    pub fn get_book(&self, id: &str) -> Result<Option<Book>> {
        let conn = self.conn.lock();
        let book = conn
            .query_row(
                &format!("SELECT {} FROM books b WHERE b.id = ?1", BOOK_COLUMNS),
                params![id],
                Self::row_to_book,
            )
            .optional()
            .map_err(|e| AppError::Internal(format!("Failed to get book: {}", e)))?;

        let Some(mut book) = book else {
            return Ok(None);
        };

        book.categories = Self::load_category_ids(&conn, id)?;
        Ok(Some(book))
    }

    /// Overwrite a book's row, category memberships and search-index row.
    pub fn update_book(&self, book: &Book) -> Result<()> {
        let conn = self.conn.lock();
        let rows = conn
            .execute(
                "UPDATE books SET title = ?1, title_lower = ?2, author = ?3, description = ?4,
                    cover_image = ?5, format = ?6, status = ?7, metadata_json = ?8,
                    tags_json = ?9, is_trending = ?10, is_featured = ?11, is_published = ?12,
                    updated_at = ?13
                 WHERE id = ?14",
                params![
                    book.title,
                    book.title_lower,
                    book.author,
                    book.description,
                    book.cover_image,
                    book.format.as_str(),
                    book.status.as_str(),
                    serde_json::to_string(&book.metadata).unwrap_or_default(),
                    serde_json::to_string(&book.tags).unwrap_or_default(),
                    book.is_trending,
                    book.is_featured,
                    book.is_published,
                    book.updated_at,
                    book.id,
                ],
            )
            .map_err(|e| {
                if e.to_string().contains("UNIQUE constraint") {
                    AppError::Conflict(format!(
                        "A {} titled '{}' already exists",
                        book.format.as_str(),
                        book.title
                    ))
                } else {
                    AppError::Internal(format!("Failed to update book: {}", e))
                }
            })?;

        if rows == 0 {
            return Err(AppError::NotFound(format!("Book not found: {}", book.id)));
        }

        Self::replace_book_categories(&conn, &book.id, &book.categories)?;
        Self::sync_fts(&conn, book)?;
        Ok(())
    }

    /// Delete a book row and its search-index row.
    pub fn delete_book(&self, id: &str) -> Result<bool> {
        let conn = self.conn.lock();
        let rows = conn
            .execute("DELETE FROM books WHERE id = ?1", params![id])
            .map_err(|e| AppError::Internal(format!("Failed to delete book: {}", e)))?;

        conn.execute(
            "DELETE FROM book_categories WHERE book_id = ?1",
            params![id],
        )
        .map_err(|e| AppError::Internal(format!("Failed to delete book categories: {}", e)))?;

        conn.execute("DELETE FROM books_fts WHERE book_id = ?1", params![id])
            .map_err(|e| AppError::Internal(format!("Failed to delete search row: {}", e)))?;

        Ok(rows > 0)
    }

    /// Run a composed discovery query and return the matching page of books.
    pub fn list_books(&self, query: &ComposedQuery) -> Result<Vec<Book>> {
        let conn = self.conn.lock();
        let mut sql = format!("SELECT {} FROM books b", BOOK_COLUMNS);
        if query.text_search {
            sql.push_str(" JOIN books_fts f ON f.book_id = b.id");
        }
        sql.push_str(" WHERE ");
        sql.push_str(&query.where_sql);
        sql.push_str(" ORDER BY ");
        sql.push_str(&query.order_sql);
        sql.push_str(" LIMIT ? OFFSET ?");

        let mut bind: Vec<Value> = query.params.clone();
        bind.push(Value::Integer(query.limit));
        bind.push(Value::Integer(query.offset));

        let mut stmt = conn
            .prepare(&sql)
            .map_err(|e| AppError::Internal(format!("Failed to prepare query: {}", e)))?;

        let books = stmt
            .query_map(params_from_iter(bind), Self::row_to_book)
            .map_err(|e| AppError::Internal(format!("Failed to list books: {}", e)))?
            .collect::<std::result::Result<Vec<_>, _>>()
            .map_err(|e| AppError::Internal(format!("Failed to collect books: {}", e)))?;

        Ok(books)
    }

    /// Total number of books matched by a composed query.
    pub fn count_books(&self, query: &ComposedQuery) -> Result<i64> {
        let conn = self.conn.lock();
        let mut sql = String::from("SELECT COUNT(*) FROM books b");
        if query.text_search {
            sql.push_str(" JOIN books_fts f ON f.book_id = b.id");
        }
        sql.push_str(" WHERE ");
        sql.push_str(&query.where_sql);

        conn.query_row(&sql, params_from_iter(query.params.clone()), |row| {
            row.get(0)
        })
        .map_err(|e| AppError::Internal(format!("Failed to count books: {}", e)))
    }

    /// Increment a book's total view counter.
    pub fn increment_book_views(&self, id: &str) -> Result<()> {
        let conn = self.conn.lock();
        conn.execute(
            "UPDATE books SET total_views = total_views + 1 WHERE id = ?1",
            params![id],
        )
        .map_err(|e| AppError::Internal(format!("Failed to increment views: {}", e)))?;
        Ok(())
    }

    /// Category ids referenced by a book.
    pub fn category_ids_for_book(&self, book_id: &str) -> Result<Vec<String>> {
        let conn = self.conn.lock();
        Self::load_category_ids(&conn, book_id)
    }

    /// Apply an incremental rating delta to a book's aggregate.
    pub fn apply_rating_delta(&self, book_id: &str, sum_delta: i64, count_delta: i64) -> Result<()> {
        let conn = self.conn.lock();
        conn.execute(
            "UPDATE books SET rating_sum = rating_sum + ?1, rating_count = rating_count + ?2
             WHERE id = ?3",
            params![sum_delta, count_delta, book_id],
        )
        .map_err(|e| AppError::Internal(format!("Failed to update rating: {}", e)))?;
        Ok(())
    }

    /// Adjust a book's denormalized chapter count.
    pub fn adjust_chapter_count(&self, book_id: &str, delta: i64) -> Result<()> {
        let conn = self.conn.lock();
        conn.execute(
            "UPDATE books SET chapter_count = MAX(0, chapter_count + ?1), updated_at = ?2
             WHERE id = ?3",
            params![delta, now_timestamp(), book_id],
        )
        .map_err(|e| AppError::Internal(format!("Failed to adjust chapter count: {}", e)))?;
        Ok(())
    }

    fn load_category_ids(conn: &Connection, book_id: &str) -> Result<Vec<String>> {
        let mut stmt = conn
            .prepare("SELECT category_id FROM book_categories WHERE book_id = ?1")
            .map_err(|e| AppError::Internal(format!("Failed to prepare query: {}", e)))?;

        let ids = stmt
            .query_map(params![book_id], |row| row.get(0))
            .map_err(|e| AppError::Internal(format!("Failed to get category ids: {}", e)))?
            .collect::<std::result::Result<Vec<_>, _>>()
            .map_err(|e| AppError::Internal(format!("Failed to collect category ids: {}", e)))?;

        Ok(ids)
    }

    fn replace_book_categories(
        conn: &Connection,
        book_id: &str,
        category_ids: &[String],
    ) -> Result<()> {
        conn.execute(
            "DELETE FROM book_categories WHERE book_id = ?1",
            params![book_id],
        )
        .map_err(|e| AppError::Internal(format!("Failed to clear book categories: {}", e)))?;

        for category_id in category_ids {
            conn.execute(
                "INSERT OR IGNORE INTO book_categories (book_id, category_id) VALUES (?1, ?2)",
                params![book_id, category_id],
            )
            .map_err(|e| AppError::Internal(format!("Failed to link category: {}", e)))?;
        }
        Ok(())
    }

    fn sync_fts(conn: &Connection, book: &Book) -> Result<()> {
        conn.execute("DELETE FROM books_fts WHERE book_id = ?1", params![book.id])
            .map_err(|e| AppError::Internal(format!("Failed to clear search row: {}", e)))?;

        conn.execute(
            "INSERT INTO books_fts (title, author, tags, book_id) VALUES (?1, ?2, ?3, ?4)",
            params![book.title, book.author, book.tags.join(" "), book.id],
        )
        .map_err(|e| AppError::Internal(format!("Failed to index book: {}", e)))?;
        Ok(())
    }

    fn row_to_book(row: &rusqlite::Row<'_>) -> rusqlite::Result<Book> {
        let format_raw: String = row.get(6)?;
        let format = BookFormat::parse(&format_raw).ok_or_else(|| {
            rusqlite::Error::FromSqlConversionFailure(
                6,
                rusqlite::types::Type::Text,
                format!("unknown format: {}", format_raw).into(),
            )
        })?;

        let status_raw: String = row.get(7)?;
        let status = BookStatus::parse(&status_raw).ok_or_else(|| {
            rusqlite::Error::FromSqlConversionFailure(
                7,
                rusqlite::types::Type::Text,
                format!("unknown status: {}", status_raw).into(),
            )
        })?;

        let metadata_json: String = row.get(12)?;
        let tags_json: String = row.get(13)?;

        Ok(Book {
            id: row.get(0)?,
            title: row.get(1)?,
            title_lower: row.get(2)?,
            author: row.get(3)?,
            description: row.get(4)?,
            cover_image: row.get(5)?,
            format,
            categories: Vec::new(),
            status,
            rating_sum: row.get(8)?,
            rating_count: row.get(9)?,
            chapter_count: row.get(10)?,
            total_views: row.get(11)?,
            metadata: serde_json::from_str(&metadata_json).unwrap_or_default(),
            tags: serde_json::from_str(&tags_json).unwrap_or_default(),
            uploaded_by: row.get(14)?,
            is_trending: row.get(15)?,
            is_featured: row.get(16)?,
            is_published: row.get(17)?,
            published_at: row.get(18)?,
            created_at: row.get(19)?,
            updated_at: row.get(20)?,
        })
    }

    // ========== CHAPTER OPERATIONS ==========

    /// Create a chapter.
    pub fn create_chapter(&self, chapter: &Chapter) -> Result<()> {
        let (content, pages_json) = match &chapter.content {
            ChapterContent::Text(body) => (Some(body.clone()), None),
            ChapterContent::Pages(images) => {
                (None, Some(serde_json::to_string(images).unwrap_or_default()))
            }
        };

        let conn = self.conn.lock();
        conn.execute(
            "INSERT INTO chapters (id, book_id, chapter_number, title, content, pages_json,
                word_count, page_count, views, is_premium, unlock_cost, published_at,
                created_at, updated_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13, ?14)",
            params![
                chapter.id,
                chapter.book_id,
                chapter.chapter_number,
                chapter.title,
                content,
                pages_json,
                chapter.word_count,
                chapter.page_count,
                chapter.views,
                chapter.is_premium,
                chapter.unlock_cost,
                chapter.published_at,
                chapter.created_at,
                chapter.updated_at,
            ],
        )
        .map_err(|e| {
            if e.to_string().contains("UNIQUE constraint") {
                AppError::Conflict(format!(
                    "Chapter {} already exists for this book",
                    chapter.chapter_number
                ))
            } else {
                AppError::Internal(format!("Failed to create chapter: {}", e))
            }
        })?;
        Ok(())
    }

    /// Get a chapter by book and number, with its content payload.
    pub fn get_chapter(&self, book_id: &str, number: i64) -> Result<Option<Chapter>> {
        let conn = self.conn.lock();
        conn.query_row(
            "SELECT id, book_id, chapter_number, title, content, pages_json, word_count,
                    page_count, views, is_premium, unlock_cost, published_at, created_at, updated_at
             FROM chapters WHERE book_id = ?1 AND chapter_number = ?2",
            params![book_id, number],
            Self::row_to_chapter,
        )
        .optional()
        .map_err(|e| AppError::Internal(format!("Failed to get chapter: {}", e)))
    }

    /// List chapter summaries for a book, ordered by chapter number.
    /// Content and pages are never selected here.
    pub fn list_chapters(&self, book_id: &str) -> Result<Vec<ChapterSummary>> {
        let conn = self.conn.lock();
        let mut stmt = conn
            .prepare(
                "SELECT id, chapter_number, title, word_count, page_count, views, is_premium,
                        published_at
                 FROM chapters WHERE book_id = ?1 ORDER BY chapter_number ASC",
            )
            .map_err(|e| AppError::Internal(format!("Failed to prepare query: {}", e)))?;

        let chapters = stmt
            .query_map(params![book_id], |row| {
                Ok(ChapterSummary {
                    id: row.get(0)?,
                    chapter_number: row.get(1)?,
                    title: row.get(2)?,
                    word_count: row.get(3)?,
                    page_count: row.get(4)?,
                    views: row.get(5)?,
                    is_premium: row.get(6)?,
                    published_at: row.get(7)?,
                })
            })
            .map_err(|e| AppError::Internal(format!("Failed to list chapters: {}", e)))?
            .collect::<std::result::Result<Vec<_>, _>>()
            .map_err(|e| AppError::Internal(format!("Failed to collect chapters: {}", e)))?;

        Ok(chapters)
    }

    /// Delete one chapter.
    pub fn delete_chapter(&self, book_id: &str, number: i64) -> Result<bool> {
        let conn = self.conn.lock();
        let rows = conn
            .execute(
                "DELETE FROM chapters WHERE book_id = ?1 AND chapter_number = ?2",
                params![book_id, number],
            )
            .map_err(|e| AppError::Internal(format!("Failed to delete chapter: {}", e)))?;
        Ok(rows > 0)
    }

    /// Delete every chapter of a book. Returns how many were removed.
    pub fn delete_chapters_for_book(&self, book_id: &str) -> Result<usize> {
        let conn = self.conn.lock();
        conn.execute("DELETE FROM chapters WHERE book_id = ?1", params![book_id])
            .map_err(|e| AppError::Internal(format!("Failed to delete chapters: {}", e)))
    }

    /// Increment a chapter's view counter and the owning book's total.
    pub fn increment_chapter_views(&self, chapter_id: &str, book_id: &str) -> Result<()> {
        let conn = self.conn.lock();
        conn.execute(
            "UPDATE chapters SET views = views + 1 WHERE id = ?1",
            params![chapter_id],
        )
        .map_err(|e| AppError::Internal(format!("Failed to increment chapter views: {}", e)))?;

        conn.execute(
            "UPDATE books SET total_views = total_views + 1 WHERE id = ?1",
            params![book_id],
        )
        .map_err(|e| AppError::Internal(format!("Failed to increment book views: {}", e)))?;
        Ok(())
    }

    fn row_to_chapter(row: &rusqlite::Row<'_>) -> rusqlite::Result<Chapter> {
        let text: Option<String> = row.get(4)?;
        let pages_json: Option<String> = row.get(5)?;

        let content = if let Some(body) = text {
            ChapterContent::Text(body)
        } else {
            let images = pages_json
                .as_deref()
                .map(|j| serde_json::from_str(j).unwrap_or_default())
                .unwrap_or_default();
            ChapterContent::Pages(images)
        };

        Ok(Chapter {
            id: row.get(0)?,
            book_id: row.get(1)?,
            chapter_number: row.get(2)?,
            title: row.get(3)?,
            content,
            word_count: row.get(6)?,
            page_count: row.get(7)?,
            views: row.get(8)?,
            is_premium: row.get(9)?,
            unlock_cost: row.get(10)?,
            published_at: row.get(11)?,
            created_at: row.get(12)?,
            updated_at: row.get(13)?,
        })
    }

    // ========== BOOKMARK OPERATIONS ==========

    /// Insert or update the caller's bookmark for a book. The (user, book)
    /// pair is unique; repeated saves update the existing row in place.
    pub fn upsert_bookmark(&self, bookmark: &Bookmark) -> Result<()> {
        let conn = self.conn.lock();
        conn.execute(
            "INSERT INTO bookmarks (id, user_id, book_id, chapter_id, last_chapter_number,
                scroll_percent, page, scroll_y, reading_status, user_rating, note,
                last_read_at, created_at, updated_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13, ?14)
             ON CONFLICT (user_id, book_id) DO UPDATE SET
                chapter_id = excluded.chapter_id,
                last_chapter_number = excluded.last_chapter_number,
                scroll_percent = excluded.scroll_percent,
                page = excluded.page,
                scroll_y = excluded.scroll_y,
                reading_status = excluded.reading_status,
                user_rating = excluded.user_rating,
                note = excluded.note,
                last_read_at = excluded.last_read_at,
                updated_at = excluded.updated_at",
            params![
                bookmark.id,
                bookmark.user_id,
                bookmark.book_id,
                bookmark.chapter_id,
                bookmark.last_chapter_number,
                bookmark.position.scroll_percent,
                bookmark.position.page,
                bookmark.position.scroll_y,
                bookmark.reading_status.as_str(),
                bookmark.user_rating,
                bookmark.note,
                bookmark.last_read_at,
                bookmark.created_at,
                bookmark.updated_at,
            ],
        )
        .map_err(|e| AppError::Internal(format!("Failed to save bookmark: {}", e)))?;
        Ok(())
    }

    /// Get a user's bookmark for a book.
    pub fn get_bookmark(&self, user_id: &str, book_id: &str) -> Result<Option<Bookmark>> {
        let conn = self.conn.lock();
        conn.query_row(
            &format!(
                "SELECT {} FROM bookmarks WHERE user_id = ?1 AND book_id = ?2",
                Self::BOOKMARK_COLUMNS
            ),
            params![user_id, book_id],
            Self::row_to_bookmark,
        )
        .optional()
        .map_err(|e| AppError::Internal(format!("Failed to get bookmark: {}", e)))
    }

    /// List a user's bookmarks, most recently read first, optionally
    /// filtered by reading status.
    pub fn list_bookmarks_for_user(
        &self,
        user_id: &str,
        status: Option<ReadingStatus>,
    ) -> Result<Vec<Bookmark>> {
        let conn = self.conn.lock();
        let (sql, bind): (String, Vec<Value>) = match status {
            Some(status) => (
                format!(
                    "SELECT {} FROM bookmarks WHERE user_id = ? AND reading_status = ?
                     ORDER BY last_read_at DESC",
                    Self::BOOKMARK_COLUMNS
                ),
                vec![
                    Value::Text(user_id.to_string()),
                    Value::Text(status.as_str().to_string()),
                ],
            ),
            None => (
                format!(
                    "SELECT {} FROM bookmarks WHERE user_id = ? ORDER BY last_read_at DESC",
                    Self::BOOKMARK_COLUMNS
                ),
                vec![Value::Text(user_id.to_string())],
            ),
        };

        let mut stmt = conn
            .prepare(&sql)
            .map_err(|e| AppError::Internal(format!("Failed to prepare query: {}", e)))?;

        let bookmarks = stmt
            .query_map(params_from_iter(bind), Self::row_to_bookmark)
            .map_err(|e| AppError::Internal(format!("Failed to list bookmarks: {}", e)))?
            .collect::<std::result::Result<Vec<_>, _>>()
            .map_err(|e| AppError::Internal(format!("Failed to collect bookmarks: {}", e)))?;

        Ok(bookmarks)
    }

    /// Delete every bookmark referencing a book. Returns how many.
    pub fn delete_bookmarks_for_book(&self, book_id: &str) -> Result<usize> {
        let conn = self.conn.lock();
        conn.execute("DELETE FROM bookmarks WHERE book_id = ?1", params![book_id])
            .map_err(|e| AppError::Internal(format!("Failed to delete bookmarks: {}", e)))
    }

    /// Delete every bookmark owned by a user. Returns how many.
    pub fn delete_bookmarks_for_user(&self, user_id: &str) -> Result<usize> {
        let conn = self.conn.lock();
        conn.execute("DELETE FROM bookmarks WHERE user_id = ?1", params![user_id])
            .map_err(|e| AppError::Internal(format!("Failed to delete bookmarks: {}", e)))
    }

    const BOOKMARK_COLUMNS: &'static str = "id, user_id, book_id, chapter_id, last_chapter_number, \
         scroll_percent, page, scroll_y, reading_status, user_rating, note, last_read_at, \
         created_at, updated_at";

    fn row_to_bookmark(row: &rusqlite::Row<'_>) -> rusqlite::Result<Bookmark> {
        let status_raw: String = row.get(8)?;
        let reading_status = ReadingStatus::parse(&status_raw).ok_or_else(|| {
            rusqlite::Error::FromSqlConversionFailure(
                8,
                rusqlite::types::Type::Text,
                format!("unknown reading status: {}", status_raw).into(),
            )
        })?;

        Ok(Bookmark {
            id: row.get(0)?,
            user_id: row.get(1)?,
            book_id: row.get(2)?,
            chapter_id: row.get(3)?,
            last_chapter_number: row.get(4)?,
            position: ReadingPosition {
                scroll_percent: row.get(5)?,
                page: row.get(6)?,
                scroll_y: row.get(7)?,
            },
            reading_status,
            user_rating: row.get(9)?,
            note: row.get(10)?,
            last_read_at: row.get(11)?,
            created_at: row.get(12)?,
            updated_at: row.get(13)?,
        })
    }
}
