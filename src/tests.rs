use crate::auth::AuthService;
use crate::catalog::query::{self, ListParams, SortScope};
use crate::catalog::{
    BookUpdate, CatalogService, NewBook, NewCategory, NewChapter, ReadingStatusUpdate,
    build_category_tree,
};
use crate::db::{
    Book, BookFormat, BookStatus, Bookmark, Category, Chapter, ChapterContent, Database,
    ReadingPosition, ReadingStatus, Role, User, now_timestamp,
};
use crate::error::AppError;
use std::collections::HashMap;

fn test_db() -> Database {
    Database::open_memory().unwrap()
}

fn test_auth(db: &Database) -> AuthService {
    AuthService::new(db.clone(), "test-secret".to_string(), 7)
}

fn test_catalog(db: &Database) -> CatalogService {
    CatalogService::new(db.clone())
}

fn make_admin(auth: &AuthService) -> User {
    auth.create_user("admin", "admin@example.com", "password1", Role::Admin)
        .unwrap()
}

fn make_reader(auth: &AuthService, username: &str) -> User {
    auth.create_user(
        username,
        &format!("{}@example.com", username),
        "password1",
        Role::Reader,
    )
    .unwrap()
}

fn sample_book(id: &str, title: &str, format: BookFormat) -> Book {
    let now = now_timestamp();
    Book {
        id: id.to_string(),
        title: title.to_string(),
        title_lower: title.to_lowercase(),
        author: "Author".to_string(),
        description: String::new(),
        cover_image: String::new(),
        format,
        categories: Vec::new(),
        status: BookStatus::Ongoing,
        rating_sum: 0,
        rating_count: 0,
        chapter_count: 0,
        total_views: 0,
        metadata: HashMap::new(),
        tags: Vec::new(),
        uploaded_by: None,
        is_trending: false,
        is_featured: false,
        is_published: true,
        published_at: now,
        created_at: now,
        updated_at: now,
    }
}

fn sample_chapter(id: &str, book_id: &str, number: i64, content: ChapterContent) -> Chapter {
    let now = now_timestamp();
    Chapter {
        id: id.to_string(),
        book_id: book_id.to_string(),
        chapter_number: number,
        title: format!("Chapter {}", number),
        word_count: content.word_count(),
        page_count: content.page_count(),
        content,
        views: 0,
        is_premium: false,
        unlock_cost: 0,
        published_at: now,
        created_at: now,
        updated_at: now,
    }
}

fn sample_bookmark(id: &str, user_id: &str, book_id: &str) -> Bookmark {
    let now = now_timestamp();
    Bookmark {
        id: id.to_string(),
        user_id: user_id.to_string(),
        book_id: book_id.to_string(),
        chapter_id: None,
        last_chapter_number: 0,
        position: ReadingPosition::default(),
        reading_status: ReadingStatus::PlanToRead,
        user_rating: None,
        note: String::new(),
        last_read_at: now,
        created_at: now,
        updated_at: now,
    }
}

fn sample_user(id: &str) -> User {
    let now = now_timestamp();
    User {
        id: id.to_string(),
        username: id.to_string(),
        email: format!("{}@example.com", id),
        password_hash: String::new(),
        role: Role::Reader,
        avatar: String::new(),
        bio: String::new(),
        stats: Default::default(),
        credits: 0,
        is_verified: false,
        is_active: true,
        created_at: now,
        updated_at: now,
    }
}

fn sample_category(id: &str, name: &str, slug: &str, parent_id: Option<&str>) -> Category {
    let now = now_timestamp();
    Category {
        id: id.to_string(),
        name: name.to_string(),
        slug: slug.to_string(),
        description: String::new(),
        icon: String::new(),
        parent_id: parent_id.map(|p| p.to_string()),
        is_featured: false,
        book_count: 0,
        created_at: now,
        updated_at: now,
    }
}

fn listing(params: &ListParams) -> query::ComposedQuery {
    query::compose(params, SortScope::Listing).unwrap()
}

// ============================================================================
// ENTITY STORE
// ============================================================================

#[test]
fn db_create_and_get_user() {
    let db = test_db();
    let auth = test_auth(&db);

    let user = auth
        .create_user("alice", "Alice@Example.com", "password1", Role::Reader)
        .unwrap();

    let found = db.get_user_by_username("alice").unwrap().unwrap();
    assert_eq!(found.id, user.id);
    assert_eq!(found.email, "alice@example.com");

    let by_email = db.get_user_by_email("alice@example.com").unwrap().unwrap();
    assert_eq!(by_email.username, "alice");
}

#[test]
fn db_duplicate_username_is_conflict() {
    let db = test_db();
    let auth = test_auth(&db);

    auth.create_user("alice", "alice@example.com", "password1", Role::Reader)
        .unwrap();
    let err = auth
        .create_user("alice", "other@example.com", "password1", Role::Reader)
        .unwrap_err();
    assert!(matches!(err, AppError::Conflict(_)));
}

#[test]
fn db_duplicate_email_is_conflict() {
    let db = test_db();
    let auth = test_auth(&db);

    auth.create_user("alice", "alice@example.com", "password1", Role::Reader)
        .unwrap();
    let err = auth
        .create_user("bob", "alice@example.com", "password1", Role::Reader)
        .unwrap_err();
    assert!(matches!(err, AppError::Conflict(_)));
}

#[test]
fn db_duplicate_title_format_is_conflict() {
    let db = test_db();

    db.create_book(&sample_book("book-1", "Solo Leveling", BookFormat::Manhwa))
        .unwrap();

    // Same title and format: rejected
    let err = db
        .create_book(&sample_book("book-2", "Solo Leveling", BookFormat::Manhwa))
        .unwrap_err();
    assert!(matches!(err, AppError::Conflict(_)));

    // Same title, different format: fine
    db.create_book(&sample_book("book-3", "Solo Leveling", BookFormat::Novel))
        .unwrap();
}

#[test]
fn db_book_round_trip_preserves_metadata_and_tags() {
    let db = test_db();
    db.create_category(&sample_category("cat-1", "Action", "action", None))
        .unwrap();

    let mut book = sample_book("book-1", "Berserk", BookFormat::Manga);
    book.metadata
        .insert("readingDirection".to_string(), "rtl".to_string());
    book.tags = vec!["dark-fantasy".to_string(), "seinen".to_string()];
    book.categories = vec!["cat-1".to_string()];
    db.create_book(&book).unwrap();

    let found = db.get_book("book-1").unwrap().unwrap();
    assert_eq!(
        found.metadata.get("readingDirection").map(String::as_str),
        Some("rtl")
    );
    assert_eq!(found.tags, vec!["dark-fantasy", "seinen"]);
    assert_eq!(found.categories, vec!["cat-1"]);
    assert_eq!(found.title_lower, "berserk");
}

#[test]
fn db_chapter_number_unique_per_book() {
    let db = test_db();
    db.create_book(&sample_book("book-1", "Omniscient Reader", BookFormat::Novel))
        .unwrap();

    db.create_chapter(&sample_chapter(
        "ch-1",
        "book-1",
        1,
        ChapterContent::Text("first".to_string()),
    ))
    .unwrap();

    let err = db
        .create_chapter(&sample_chapter(
            "ch-2",
            "book-1",
            1,
            ChapterContent::Text("dup".to_string()),
        ))
        .unwrap_err();
    assert!(matches!(err, AppError::Conflict(_)));
}

#[test]
fn db_chapter_content_variants_round_trip() {
    let db = test_db();
    db.create_book(&sample_book("book-1", "Mixed", BookFormat::Novel))
        .unwrap();

    let text = sample_chapter(
        "ch-1",
        "book-1",
        1,
        ChapterContent::Text("one two three four".to_string()),
    );
    db.create_chapter(&text).unwrap();

    let pages = sample_chapter(
        "ch-2",
        "book-1",
        2,
        ChapterContent::Pages(vec!["p1.jpg".to_string(), "p2.jpg".to_string()]),
    );
    db.create_chapter(&pages).unwrap();

    let found_text = db.get_chapter("book-1", 1).unwrap().unwrap();
    assert_eq!(
        found_text.content,
        ChapterContent::Text("one two three four".to_string())
    );
    assert_eq!(found_text.word_count, 4);
    assert_eq!(found_text.page_count, 0);

    let found_pages = db.get_chapter("book-1", 2).unwrap().unwrap();
    assert_eq!(
        found_pages.content,
        ChapterContent::Pages(vec!["p1.jpg".to_string(), "p2.jpg".to_string()])
    );
    assert_eq!(found_pages.word_count, 0);
    assert_eq!(found_pages.page_count, 2);
}

#[test]
fn db_chapter_list_is_ordered_by_number() {
    let db = test_db();
    db.create_book(&sample_book("book-1", "Ordered", BookFormat::Novel))
        .unwrap();

    for number in [3, 1, 2] {
        db.create_chapter(&sample_chapter(
            &format!("ch-{}", number),
            "book-1",
            number,
            ChapterContent::Text("body".to_string()),
        ))
        .unwrap();
    }

    let chapters = db.list_chapters("book-1").unwrap();
    let numbers: Vec<i64> = chapters.iter().map(|c| c.chapter_number).collect();
    assert_eq!(numbers, vec![1, 2, 3]);
}

#[test]
fn db_bookmark_pair_is_unique() {
    let db = test_db();
    db.create_user(&sample_user("user-1")).unwrap();
    db.create_book(&sample_book("book-1", "Bookmarked", BookFormat::Novel))
        .unwrap();

    let first = sample_bookmark("bm-1", "user-1", "book-1");
    db.upsert_bookmark(&first).unwrap();

    let mut second = sample_bookmark("bm-2", "user-1", "book-1");
    second.reading_status = ReadingStatus::Reading;
    second.last_chapter_number = 12;
    db.upsert_bookmark(&second).unwrap();

    let bookmarks = db.list_bookmarks_for_user("user-1", None).unwrap();
    assert_eq!(bookmarks.len(), 1);
    assert_eq!(bookmarks[0].id, "bm-1");
    assert_eq!(bookmarks[0].reading_status, ReadingStatus::Reading);
    assert_eq!(bookmarks[0].last_chapter_number, 12);
}

#[test]
fn db_bookmarks_order_by_last_read() {
    let db = test_db();
    db.create_user(&sample_user("user-1")).unwrap();
    for i in 1..=3 {
        db.create_book(&sample_book(
            &format!("book-{}", i),
            &format!("Book {}", i),
            BookFormat::Novel,
        ))
        .unwrap();
    }

    let now = now_timestamp();
    for (i, offset) in [(1, -300), (2, -100), (3, -200)] {
        let mut bookmark = sample_bookmark(
            &format!("bm-{}", i),
            "user-1",
            &format!("book-{}", i),
        );
        bookmark.last_read_at = now + offset;
        db.upsert_bookmark(&bookmark).unwrap();
    }

    let bookmarks = db.list_bookmarks_for_user("user-1", None).unwrap();
    let order: Vec<&str> = bookmarks.iter().map(|b| b.book_id.as_str()).collect();
    assert_eq!(order, vec!["book-2", "book-3", "book-1"]);
}

#[test]
fn db_category_book_count_never_negative() {
    let db = test_db();
    db.create_category(&sample_category("cat-1", "Action", "action", None))
        .unwrap();

    db.adjust_category_book_count("cat-1", -5).unwrap();
    let found = db.get_category("cat-1").unwrap().unwrap();
    assert_eq!(found.book_count, 0);
}

#[test]
fn average_rating_from_aggregate() {
    let mut book = sample_book("book-1", "Rated", BookFormat::Novel);
    assert_eq!(book.average_rating(), 0.0);

    book.rating_sum = 9;
    book.rating_count = 2;
    assert_eq!(book.average_rating(), 4.5);
}

// ============================================================================
// DISCOVERY QUERIES AGAINST THE STORE
// ============================================================================

#[test]
fn db_listing_filters_by_format_and_status() {
    let db = test_db();

    let mut a = sample_book("book-a", "Alpha", BookFormat::Manhwa);
    a.status = BookStatus::Completed;
    db.create_book(&a).unwrap();

    db.create_book(&sample_book("book-b", "Beta", BookFormat::Novel))
        .unwrap();

    let q = listing(&ListParams {
        format: Some("manhwa".to_string()),
        status: Some("completed".to_string()),
        ..Default::default()
    });
    let books = db.list_books(&q).unwrap();
    assert_eq!(books.len(), 1);
    assert_eq!(books[0].id, "book-a");
    assert_eq!(db.count_books(&q).unwrap(), 1);
}

#[test]
fn db_listing_excludes_unpublished() {
    let db = test_db();

    let mut hidden = sample_book("book-h", "Hidden", BookFormat::Novel);
    hidden.is_published = false;
    db.create_book(&hidden).unwrap();
    db.create_book(&sample_book("book-v", "Visible", BookFormat::Novel))
        .unwrap();

    let q = listing(&ListParams::default());
    let books = db.list_books(&q).unwrap();
    assert_eq!(books.len(), 1);
    assert_eq!(books[0].id, "book-v");
}

#[test]
fn db_listing_trending_order_is_non_increasing() {
    let db = test_db();

    let specs = [
        ("book-a", false, 500),
        ("book-b", true, 100),
        ("book-c", true, 900),
        ("book-d", false, 50),
    ];
    for (id, trending, views) in specs {
        let mut book = sample_book(id, id, BookFormat::Manhwa);
        book.is_trending = trending;
        book.total_views = views;
        db.create_book(&book).unwrap();
    }

    let q = listing(&ListParams {
        sort: Some("trending".to_string()),
        ..Default::default()
    });
    let books = db.list_books(&q).unwrap();

    let keys: Vec<(bool, i64)> = books.iter().map(|b| (b.is_trending, b.total_views)).collect();
    assert_eq!(keys, vec![(true, 900), (true, 100), (false, 500), (false, 50)]);
}

#[test]
fn db_listing_tag_filter_matches_lowercase() {
    let db = test_db();

    let mut tagged = sample_book("book-t", "Tagged", BookFormat::Novel);
    tagged.tags = vec!["time-travel".to_string()];
    db.create_book(&tagged).unwrap();
    db.create_book(&sample_book("book-u", "Untagged", BookFormat::Novel))
        .unwrap();

    let q = listing(&ListParams {
        tag: Some("Time-Travel".to_string()),
        ..Default::default()
    });
    let books = db.list_books(&q).unwrap();
    assert_eq!(books.len(), 1);
    assert_eq!(books[0].id, "book-t");
}

#[test]
fn db_listing_category_filter_scopes_results() {
    let db = test_db();
    db.create_category(&sample_category("cat-1", "Action", "action", None))
        .unwrap();

    let mut inside = sample_book("book-in", "Inside", BookFormat::Manga);
    inside.categories = vec!["cat-1".to_string()];
    db.create_book(&inside).unwrap();
    db.create_book(&sample_book("book-out", "Outside", BookFormat::Manga))
        .unwrap();

    let q = listing(&ListParams {
        category: Some("cat-1".to_string()),
        ..Default::default()
    });
    let books = db.list_books(&q).unwrap();
    assert_eq!(books.len(), 1);
    assert_eq!(books[0].id, "book-in");
    assert_eq!(db.count_books(&q).unwrap(), 1);
}

#[test]
fn db_search_matches_title_author_and_tags() {
    let db = test_db();

    let mut a = sample_book("book-a", "Solo Leveling", BookFormat::Manhwa);
    a.author = "Chugong".to_string();
    db.create_book(&a).unwrap();

    let mut b = sample_book("book-b", "Tower of God", BookFormat::Webtoon);
    b.tags = vec!["regression".to_string()];
    db.create_book(&b).unwrap();

    let by_title = listing(&ListParams {
        search: Some("solo".to_string()),
        ..Default::default()
    });
    let books = db.list_books(&by_title).unwrap();
    assert_eq!(books.len(), 1);
    assert_eq!(books[0].id, "book-a");

    let by_author = listing(&ListParams {
        search: Some("chugong".to_string()),
        ..Default::default()
    });
    assert_eq!(db.count_books(&by_author).unwrap(), 1);

    let by_tag = listing(&ListParams {
        search: Some("regression".to_string()),
        ..Default::default()
    });
    let books = db.list_books(&by_tag).unwrap();
    assert_eq!(books.len(), 1);
    assert_eq!(books[0].id, "book-b");
}

#[test]
fn db_search_index_follows_updates_and_deletes() {
    let db = test_db();

    let mut book = sample_book("book-1", "Old Title", BookFormat::Novel);
    db.create_book(&book).unwrap();

    book.title = "New Title".to_string();
    book.title_lower = "new title".to_string();
    db.update_book(&book).unwrap();

    let old_q = listing(&ListParams {
        search: Some("old".to_string()),
        ..Default::default()
    });
    assert_eq!(db.count_books(&old_q).unwrap(), 0);

    let new_q = listing(&ListParams {
        search: Some("new".to_string()),
        ..Default::default()
    });
    assert_eq!(db.count_books(&new_q).unwrap(), 1);

    db.delete_book("book-1").unwrap();
    assert_eq!(db.count_books(&new_q).unwrap(), 0);
}

#[test]
fn db_listing_pagination_window() {
    let db = test_db();
    let now = now_timestamp();

    for i in 0..5 {
        let mut book = sample_book(&format!("book-{}", i), &format!("Book {}", i), BookFormat::Novel);
        // Distinct creation times so `newest` is a total order
        book.created_at = now - i;
        db.create_book(&book).unwrap();
    }

    let q = listing(&ListParams {
        page: Some(2),
        limit: Some(2),
        ..Default::default()
    });
    let books = db.list_books(&q).unwrap();
    assert_eq!(books.len(), 2);
    assert_eq!(books[0].id, "book-2");
    assert_eq!(books[1].id, "book-3");
    assert_eq!(db.count_books(&q).unwrap(), 5);
}

// ============================================================================
// CATALOG SERVICE
// ============================================================================

#[tokio::test]
async fn service_add_book_then_newest_first() {
    let db = test_db();
    let auth = test_auth(&db);
    let catalog = test_catalog(&db);
    let user = make_reader(&auth, "uploader");

    let mut earlier = sample_book("book-old", "Earlier Manhwa", BookFormat::Manhwa);
    earlier.created_at = now_timestamp() - 1000;
    db.create_book(&earlier).unwrap();

    let created = catalog
        .add_book(
            NewBook {
                title: "Solo Leveling".to_string(),
                author: "Chugong".to_string(),
                format: "manhwa".to_string(),
                ..Default::default()
            },
            &user,
        )
        .await
        .unwrap();
    assert!(!created.id.is_empty());
    assert_eq!(created.uploaded_by.as_deref(), Some(user.id.as_str()));

    let page = catalog
        .list_books(&ListParams {
            format: Some("manhwa".to_string()),
            sort: Some("newest".to_string()),
            ..Default::default()
        })
        .await
        .unwrap();

    assert_eq!(page.total, 2);
    assert_eq!(page.books[0].id, created.id);
}

#[tokio::test]
async fn service_add_book_rejects_unknown_format() {
    let db = test_db();
    let auth = test_auth(&db);
    let catalog = test_catalog(&db);
    let user = make_reader(&auth, "uploader");

    let err = catalog
        .add_book(
            NewBook {
                title: "Bad".to_string(),
                author: "Author".to_string(),
                format: "vhs".to_string(),
                ..Default::default()
            },
            &user,
        )
        .await
        .unwrap_err();
    assert!(matches!(err, AppError::InvalidInput(_)));
}

#[tokio::test]
async fn service_add_book_rejects_missing_category() {
    let db = test_db();
    let auth = test_auth(&db);
    let catalog = test_catalog(&db);
    let user = make_reader(&auth, "uploader");

    let err = catalog
        .add_book(
            NewBook {
                title: "Orphan".to_string(),
                author: "Author".to_string(),
                format: "novel".to_string(),
                categories: vec![uuid::Uuid::new_v4().to_string()],
                ..Default::default()
            },
            &user,
        )
        .await
        .unwrap_err();
    assert!(matches!(err, AppError::InvalidInput(_)));
}

#[tokio::test]
async fn service_add_book_increments_category_counts() {
    let db = test_db();
    let auth = test_auth(&db);
    let catalog = test_catalog(&db);
    let admin = make_admin(&auth);

    let action = catalog
        .create_category(
            NewCategory {
                name: "Action".to_string(),
                slug: "action".to_string(),
                ..Default::default()
            },
            &admin,
        )
        .await
        .unwrap();

    catalog
        .add_book(
            NewBook {
                title: "Fighter".to_string(),
                author: "Author".to_string(),
                format: "manga".to_string(),
                categories: vec![action.id.clone()],
                ..Default::default()
            },
            &admin,
        )
        .await
        .unwrap();

    let found = db.get_category(&action.id).unwrap().unwrap();
    assert_eq!(found.book_count, 1);
}

#[tokio::test]
async fn service_update_book_requires_owner_or_admin() {
    let db = test_db();
    let auth = test_auth(&db);
    let catalog = test_catalog(&db);
    let owner = make_reader(&auth, "owner");
    let stranger = make_reader(&auth, "stranger");
    let admin = make_admin(&auth);

    let book = catalog
        .add_book(
            NewBook {
                title: "Owned".to_string(),
                author: "Author".to_string(),
                format: "novel".to_string(),
                ..Default::default()
            },
            &owner,
        )
        .await
        .unwrap();

    let err = catalog
        .update_book(
            &book.id,
            BookUpdate {
                title: Some("Stolen".to_string()),
                ..Default::default()
            },
            &stranger,
        )
        .await
        .unwrap_err();
    assert!(matches!(err, AppError::Forbidden(_)));

    let renamed = catalog
        .update_book(
            &book.id,
            BookUpdate {
                title: Some("Renamed".to_string()),
                ..Default::default()
            },
            &admin,
        )
        .await
        .unwrap();
    assert_eq!(renamed.title, "Renamed");
    assert_eq!(renamed.title_lower, "renamed");
}

#[tokio::test]
async fn service_update_book_adjusts_category_counts() {
    let db = test_db();
    let auth = test_auth(&db);
    let catalog = test_catalog(&db);
    let admin = make_admin(&auth);

    let action = catalog
        .create_category(
            NewCategory {
                name: "Action".to_string(),
                slug: "action".to_string(),
                ..Default::default()
            },
            &admin,
        )
        .await
        .unwrap();
    let romance = catalog
        .create_category(
            NewCategory {
                name: "Romance".to_string(),
                slug: "romance".to_string(),
                ..Default::default()
            },
            &admin,
        )
        .await
        .unwrap();

    let book = catalog
        .add_book(
            NewBook {
                title: "Shifting".to_string(),
                author: "Author".to_string(),
                format: "manhwa".to_string(),
                categories: vec![action.id.clone()],
                ..Default::default()
            },
            &admin,
        )
        .await
        .unwrap();

    catalog
        .update_book(
            &book.id,
            BookUpdate {
                categories: Some(vec![romance.id.clone()]),
                ..Default::default()
            },
            &admin,
        )
        .await
        .unwrap();

    assert_eq!(db.get_category(&action.id).unwrap().unwrap().book_count, 0);
    assert_eq!(db.get_category(&romance.id).unwrap().unwrap().book_count, 1);
}

#[tokio::test]
async fn service_delete_book_cascades() {
    let db = test_db();
    let auth = test_auth(&db);
    let catalog = test_catalog(&db);
    let admin = make_admin(&auth);
    let reader = make_reader(&auth, "reader");

    let action = catalog
        .create_category(
            NewCategory {
                name: "Action".to_string(),
                slug: "action".to_string(),
                ..Default::default()
            },
            &admin,
        )
        .await
        .unwrap();

    let book = catalog
        .add_book(
            NewBook {
                title: "Doomed".to_string(),
                author: "Author".to_string(),
                format: "novel".to_string(),
                categories: vec![action.id.clone()],
                ..Default::default()
            },
            &admin,
        )
        .await
        .unwrap();

    for number in 1..=3 {
        catalog
            .add_chapter(
                &book.id,
                NewChapter {
                    chapter_number: Some(number),
                    content: Some("chapter body text".to_string()),
                    ..Default::default()
                },
                &admin,
            )
            .await
            .unwrap();
    }

    catalog
        .save_reading_status(
            &reader,
            ReadingStatusUpdate {
                book_id: book.id.clone(),
                status: Some("reading".to_string()),
                ..Default::default()
            },
        )
        .await
        .unwrap();

    assert_eq!(db.get_category(&action.id).unwrap().unwrap().book_count, 1);

    // Non-admin cannot delete
    let err = catalog.delete_book(&book.id, &reader).await.unwrap_err();
    assert!(matches!(err, AppError::Forbidden(_)));

    catalog.delete_book(&book.id, &admin).await.unwrap();

    assert!(db.get_book(&book.id).unwrap().is_none());
    assert!(db.list_chapters(&book.id).unwrap().is_empty());
    assert!(db.get_bookmark(&reader.id, &book.id).unwrap().is_none());
    assert_eq!(db.get_category(&action.id).unwrap().unwrap().book_count, 0);
}

#[tokio::test]
async fn service_detail_expands_relations_and_orders_chapters() {
    let db = test_db();
    let auth = test_auth(&db);
    let catalog = test_catalog(&db);
    let admin = make_admin(&auth);

    let cat = catalog
        .create_category(
            NewCategory {
                name: "Fantasy".to_string(),
                slug: "fantasy".to_string(),
                ..Default::default()
            },
            &admin,
        )
        .await
        .unwrap();

    let book = catalog
        .add_book(
            NewBook {
                title: "Detailed".to_string(),
                author: "Author".to_string(),
                format: "novel".to_string(),
                categories: vec![cat.id.clone()],
                ..Default::default()
            },
            &admin,
        )
        .await
        .unwrap();

    for number in [2, 1] {
        catalog
            .add_chapter(
                &book.id,
                NewChapter {
                    chapter_number: Some(number),
                    content: Some("words in the chapter".to_string()),
                    ..Default::default()
                },
                &admin,
            )
            .await
            .unwrap();
    }

    let detail = catalog.get_book_detail(&book.id).await.unwrap();
    assert_eq!(detail.categories.len(), 1);
    assert_eq!(detail.categories[0].id, cat.id);
    assert_eq!(
        detail.uploader.as_ref().map(|u| u.id.as_str()),
        Some(admin.id.as_str())
    );
    let numbers: Vec<i64> = detail.chapters.iter().map(|c| c.chapter_number).collect();
    assert_eq!(numbers, vec![1, 2]);
    assert_eq!(detail.book.chapter_count, 2);
}

#[tokio::test]
async fn service_malformed_id_is_invalid_input() {
    let db = test_db();
    let catalog = test_catalog(&db);

    let err = catalog.get_book_detail("not-a-uuid").await.unwrap_err();
    assert!(matches!(err, AppError::InvalidInput(_)));
}

#[tokio::test]
async fn service_short_search_rejected_before_storage() {
    let db = test_db();
    let catalog = test_catalog(&db);

    let err = catalog
        .search_books("a", &ListParams::default())
        .await
        .unwrap_err();
    assert!(matches!(err, AppError::InvalidInput(_)));
}

#[tokio::test]
async fn service_limit_is_capped() {
    let db = test_db();
    let catalog = test_catalog(&db);

    let page = catalog
        .list_books(&ListParams {
            limit: Some(5000),
            ..Default::default()
        })
        .await
        .unwrap();
    assert_eq!(page.limit, 50);
}

#[tokio::test]
async fn service_browse_category_by_slug() {
    let db = test_db();
    let auth = test_auth(&db);
    let catalog = test_catalog(&db);
    let admin = make_admin(&auth);

    let err = catalog
        .browse_category("missing", &ListParams::default())
        .await
        .unwrap_err();
    assert!(matches!(err, AppError::NotFound(_)));

    let cat = catalog
        .create_category(
            NewCategory {
                name: "Isekai".to_string(),
                slug: "isekai".to_string(),
                ..Default::default()
            },
            &admin,
        )
        .await
        .unwrap();

    catalog
        .add_book(
            NewBook {
                title: "In Another World".to_string(),
                author: "Author".to_string(),
                format: "lightNovel".to_string(),
                categories: vec![cat.id.clone()],
                ..Default::default()
            },
            &admin,
        )
        .await
        .unwrap();
    catalog
        .add_book(
            NewBook {
                title: "This World".to_string(),
                author: "Author".to_string(),
                format: "lightNovel".to_string(),
                ..Default::default()
            },
            &admin,
        )
        .await
        .unwrap();

    let (category, page) = catalog
        .browse_category("isekai", &ListParams::default())
        .await
        .unwrap();
    assert_eq!(category.slug, "isekai");
    assert_eq!(page.total, 1);
    assert_eq!(page.books[0].title, "In Another World");
}

#[tokio::test]
async fn service_chapter_content_keyed_by_format() {
    let db = test_db();
    let auth = test_auth(&db);
    let catalog = test_catalog(&db);
    let admin = make_admin(&auth);

    let manhwa = catalog
        .add_book(
            NewBook {
                title: "Visual".to_string(),
                author: "Author".to_string(),
                format: "manhwa".to_string(),
                ..Default::default()
            },
            &admin,
        )
        .await
        .unwrap();

    // Text content on a visual format is rejected
    let err = catalog
        .add_chapter(
            &manhwa.id,
            NewChapter {
                chapter_number: Some(1),
                content: Some("prose".to_string()),
                ..Default::default()
            },
            &admin,
        )
        .await
        .unwrap_err();
    assert!(matches!(err, AppError::InvalidInput(_)));

    let chapter = catalog
        .add_chapter(
            &manhwa.id,
            NewChapter {
                chapter_number: Some(1),
                pages: Some(vec!["p1.jpg".to_string(), "p2.jpg".to_string()]),
                ..Default::default()
            },
            &admin,
        )
        .await
        .unwrap();
    assert_eq!(chapter.page_count, 2);
    assert_eq!(chapter.word_count, 0);

    let novel = catalog
        .add_book(
            NewBook {
                title: "Textual".to_string(),
                author: "Author".to_string(),
                format: "novel".to_string(),
                ..Default::default()
            },
            &admin,
        )
        .await
        .unwrap();

    // Pages on a text format are rejected
    let err = catalog
        .add_chapter(
            &novel.id,
            NewChapter {
                chapter_number: Some(1),
                pages: Some(vec!["p1.jpg".to_string()]),
                ..Default::default()
            },
            &admin,
        )
        .await
        .unwrap_err();
    assert!(matches!(err, AppError::InvalidInput(_)));

    let chapter = catalog
        .add_chapter(
            &novel.id,
            NewChapter {
                chapter_number: Some(1),
                content: Some("five words of chapter text".to_string()),
                ..Default::default()
            },
            &admin,
        )
        .await
        .unwrap();
    assert_eq!(chapter.word_count, 5);
    assert_eq!(chapter.page_count, 0);
}

#[tokio::test]
async fn service_chapter_count_follows_add_and_remove() {
    let db = test_db();
    let auth = test_auth(&db);
    let catalog = test_catalog(&db);
    let admin = make_admin(&auth);

    let book = catalog
        .add_book(
            NewBook {
                title: "Counted".to_string(),
                author: "Author".to_string(),
                format: "novel".to_string(),
                ..Default::default()
            },
            &admin,
        )
        .await
        .unwrap();

    for number in 1..=2 {
        catalog
            .add_chapter(
                &book.id,
                NewChapter {
                    chapter_number: Some(number),
                    content: Some("body".to_string()),
                    ..Default::default()
                },
                &admin,
            )
            .await
            .unwrap();
    }
    assert_eq!(db.get_book(&book.id).unwrap().unwrap().chapter_count, 2);

    catalog.remove_chapter(&book.id, 1, &admin).await.unwrap();
    assert_eq!(db.get_book(&book.id).unwrap().unwrap().chapter_count, 1);

    let err = catalog
        .remove_chapter(&book.id, 99, &admin)
        .await
        .unwrap_err();
    assert!(matches!(err, AppError::NotFound(_)));
}

#[tokio::test]
async fn service_rating_feeds_aggregate_incrementally() {
    let db = test_db();
    let auth = test_auth(&db);
    let catalog = test_catalog(&db);
    let admin = make_admin(&auth);
    let alice = make_reader(&auth, "alice");
    let bob = make_reader(&auth, "bob");

    let book = catalog
        .add_book(
            NewBook {
                title: "Rated".to_string(),
                author: "Author".to_string(),
                format: "novel".to_string(),
                ..Default::default()
            },
            &admin,
        )
        .await
        .unwrap();

    // Out-of-range ratings are rejected
    let err = catalog
        .save_reading_status(
            &alice,
            ReadingStatusUpdate {
                book_id: book.id.clone(),
                user_rating: Some(6),
                ..Default::default()
            },
        )
        .await
        .unwrap_err();
    assert!(matches!(err, AppError::InvalidInput(_)));

    catalog
        .save_reading_status(
            &alice,
            ReadingStatusUpdate {
                book_id: book.id.clone(),
                user_rating: Some(4),
                ..Default::default()
            },
        )
        .await
        .unwrap();

    let found = db.get_book(&book.id).unwrap().unwrap();
    assert_eq!((found.rating_sum, found.rating_count), (4, 1));

    // Re-rating replaces, not stacks
    catalog
        .save_reading_status(
            &alice,
            ReadingStatusUpdate {
                book_id: book.id.clone(),
                user_rating: Some(5),
                ..Default::default()
            },
        )
        .await
        .unwrap();

    let found = db.get_book(&book.id).unwrap().unwrap();
    assert_eq!((found.rating_sum, found.rating_count), (5, 1));

    catalog
        .save_reading_status(
            &bob,
            ReadingStatusUpdate {
                book_id: book.id.clone(),
                user_rating: Some(4),
                ..Default::default()
            },
        )
        .await
        .unwrap();

    let found = db.get_book(&book.id).unwrap().unwrap();
    assert_eq!((found.rating_sum, found.rating_count), (9, 2));
    assert_eq!(found.average_rating(), 4.5);
}

#[tokio::test]
async fn service_completion_bumps_user_stat_once() {
    let db = test_db();
    let auth = test_auth(&db);
    let catalog = test_catalog(&db);
    let admin = make_admin(&auth);
    let reader = make_reader(&auth, "reader");

    let book = catalog
        .add_book(
            NewBook {
                title: "Finished".to_string(),
                author: "Author".to_string(),
                format: "novel".to_string(),
                ..Default::default()
            },
            &admin,
        )
        .await
        .unwrap();

    for _ in 0..2 {
        catalog
            .save_reading_status(
                &reader,
                ReadingStatusUpdate {
                    book_id: book.id.clone(),
                    status: Some("completed".to_string()),
                    ..Default::default()
                },
            )
            .await
            .unwrap();
    }

    let found = db.get_user_by_id(&reader.id).unwrap().unwrap();
    assert_eq!(found.stats.books_completed, 1);
}

#[tokio::test]
async fn service_bookmarks_filter_by_status() {
    let db = test_db();
    let auth = test_auth(&db);
    let catalog = test_catalog(&db);
    let admin = make_admin(&auth);
    let reader = make_reader(&auth, "reader");

    for (title, status) in [("One", "reading"), ("Two", "completed")] {
        let book = catalog
            .add_book(
                NewBook {
                    title: title.to_string(),
                    author: "Author".to_string(),
                    format: "novel".to_string(),
                    ..Default::default()
                },
                &admin,
            )
            .await
            .unwrap();

        catalog
            .save_reading_status(
                &reader,
                ReadingStatusUpdate {
                    book_id: book.id.clone(),
                    status: Some(status.to_string()),
                    ..Default::default()
                },
            )
            .await
            .unwrap();
    }

    let all = catalog.bookmarks_for_user(&reader, None).await.unwrap();
    assert_eq!(all.len(), 2);

    let reading = catalog
        .bookmarks_for_user(&reader, Some("reading"))
        .await
        .unwrap();
    assert_eq!(reading.len(), 1);
    assert_eq!(
        reading[0].book.as_ref().map(|b| b.title.as_str()),
        Some("One")
    );

    let err = catalog
        .bookmarks_for_user(&reader, Some("binging"))
        .await
        .unwrap_err();
    assert!(matches!(err, AppError::InvalidInput(_)));
}

// ============================================================================
// CATEGORIES
// ============================================================================

#[test]
fn category_tree_partitions_roots_and_children() {
    let root_a = sample_category("cat-a", "Action", "action", None);
    let root_b = sample_category("cat-b", "Romance", "romance", None);
    let child_a1 = sample_category("cat-a1", "Martial Arts", "martial-arts", Some("cat-a"));
    let child_a2 = sample_category("cat-a2", "Military", "military", Some("cat-a"));

    let tree = build_category_tree(vec![root_a, child_a1, root_b, child_a2]);

    assert_eq!(tree.len(), 2);
    let action = tree.iter().find(|n| n.category.id == "cat-a").unwrap();
    assert_eq!(action.children.len(), 2);
    let romance = tree.iter().find(|n| n.category.id == "cat-b").unwrap();
    assert!(romance.children.is_empty());
}

#[tokio::test]
async fn service_category_create_rules() {
    let db = test_db();
    let auth = test_auth(&db);
    let catalog = test_catalog(&db);
    let admin = make_admin(&auth);
    let reader = make_reader(&auth, "reader");

    // Admin only
    let err = catalog
        .create_category(
            NewCategory {
                name: "Nope".to_string(),
                slug: "nope".to_string(),
                ..Default::default()
            },
            &reader,
        )
        .await
        .unwrap_err();
    assert!(matches!(err, AppError::Forbidden(_)));

    // Parent must exist
    let err = catalog
        .create_category(
            NewCategory {
                name: "Orphan".to_string(),
                slug: "orphan".to_string(),
                parent: Some(uuid::Uuid::new_v4().to_string()),
                ..Default::default()
            },
            &admin,
        )
        .await
        .unwrap_err();
    assert!(matches!(err, AppError::InvalidInput(_)));

    // Slug charset is enforced
    let err = catalog
        .create_category(
            NewCategory {
                name: "Bad Slug".to_string(),
                slug: "bad slug!".to_string(),
                ..Default::default()
            },
            &admin,
        )
        .await
        .unwrap_err();
    assert!(matches!(err, AppError::InvalidInput(_)));

    let action = catalog
        .create_category(
            NewCategory {
                name: "Action".to_string(),
                slug: "Action".to_string(),
                ..Default::default()
            },
            &admin,
        )
        .await
        .unwrap();
    assert_eq!(action.slug, "action");

    // Duplicate slug conflicts
    let err = catalog
        .create_category(
            NewCategory {
                name: "Action 2".to_string(),
                slug: "action".to_string(),
                ..Default::default()
            },
            &admin,
        )
        .await
        .unwrap_err();
    assert!(matches!(err, AppError::Conflict(_)));

    let found = catalog.category_by_slug("action").await.unwrap();
    assert_eq!(found.id, action.id);
}

// ============================================================================
// AUTH
// ============================================================================

#[test]
fn auth_short_password_rejected() {
    let db = test_db();
    let auth = test_auth(&db);

    let err = auth.register("alice", "alice@example.com", "12345").unwrap_err();
    assert!(matches!(err, AppError::InvalidInput(_)));
}

#[test]
fn auth_register_login_token_round_trip() {
    let db = test_db();
    let auth = test_auth(&db);

    let (user, _token) = auth
        .register("alice", "Alice@Example.com", "password1")
        .unwrap();
    assert_eq!(user.role, Role::Reader);
    assert_eq!(user.email, "alice@example.com");

    let (logged_in, token) = auth.login("alice@example.com", "password1").unwrap();
    assert_eq!(logged_in.id, user.id);

    // The login token is accepted by the /me path
    let me = auth.authenticate(&token).unwrap();
    assert_eq!(me.id, user.id);
}

#[test]
fn auth_wrong_password_rejected() {
    let db = test_db();
    let auth = test_auth(&db);

    auth.register("alice", "alice@example.com", "password1")
        .unwrap();
    let err = auth.login("alice@example.com", "wrong").unwrap_err();
    assert!(matches!(err, AppError::Unauthenticated(_)));
}

#[test]
fn auth_invalid_username_rejected() {
    let db = test_db();
    let auth = test_auth(&db);

    assert!(auth.register("ab", "a@example.com", "password1").is_err());
    assert!(auth.register("user name", "a@example.com", "password1").is_err());
    assert!(
        auth.register(
            "a-username-way-over-the-thirty-char-limit",
            "a@example.com",
            "password1"
        )
        .is_err()
    );
}

#[test]
fn auth_change_password() {
    let db = test_db();
    let auth = test_auth(&db);

    auth.register("alice", "alice@example.com", "oldpassword")
        .unwrap();
    auth.change_password("alice", "newpassword").unwrap();

    assert!(auth.login("alice@example.com", "oldpassword").is_err());
    assert!(auth.login("alice@example.com", "newpassword").is_ok());
}

#[test]
fn auth_delete_user_cascades_bookmarks() {
    let db = test_db();
    let auth = test_auth(&db);

    let (user, _) = auth
        .register("alice", "alice@example.com", "password1")
        .unwrap();

    db.create_book(&sample_book("book-1", "Kept", BookFormat::Novel))
        .unwrap();
    db.upsert_bookmark(&sample_bookmark("bm-1", &user.id, "book-1"))
        .unwrap();

    assert!(auth.delete_user("alice").unwrap());
    assert!(db.get_user_by_username("alice").unwrap().is_none());
    assert!(db.list_bookmarks_for_user(&user.id, None).unwrap().is_empty());
}

#[test]
fn auth_update_profile() {
    let db = test_db();
    let auth = test_auth(&db);

    let (user, _) = auth
        .register("alice", "alice@example.com", "password1")
        .unwrap();

    let updated = auth
        .update_profile(&user, Some("avatar.png".to_string()), None)
        .unwrap();
    assert_eq!(updated.avatar, "avatar.png");
    assert_eq!(updated.bio, "");
}

// ============================================================================
// CONFIG
// ============================================================================

#[test]
fn config_parse_toml() {
    let toml = r#"
[server]
bind = "127.0.0.1:9090"

[database]
path = "/tmp/test.db"

[auth]
jwt_secret = "s3cret"
token_days = 14
"#;
    let config: crate::config::Config = toml::from_str(toml).unwrap();
    assert_eq!(config.server.bind.port(), 9090);
    assert_eq!(config.auth.jwt_secret, "s3cret");
    assert_eq!(config.auth.token_days, 14);
}

#[test]
fn config_default_values() {
    let config = crate::config::Config::default();
    assert_eq!(config.server.bind.port(), 5000);
    assert!(config.auth.jwt_secret.is_empty());
    assert_eq!(config.auth.token_days, 7);
}

#[test]
fn book_format_parse_and_classify() {
    assert_eq!(BookFormat::parse("manhwa"), Some(BookFormat::Manhwa));
    assert_eq!(BookFormat::parse("lightNovel"), Some(BookFormat::LightNovel));
    assert_eq!(BookFormat::parse("Manhwa"), None);
    assert_eq!(BookFormat::parse("epub"), None);

    assert!(BookFormat::Manhwa.is_visual());
    assert!(BookFormat::Webtoon.is_visual());
    assert!(!BookFormat::Novel.is_visual());
    assert!(!BookFormat::LightNovel.is_visual());
}
