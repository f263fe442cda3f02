//! Integration tests for the synchronous DAO facade.
//!
//! These run on plain test threads: every call is handed to the background
//! runtime and the test thread blocks until it completes.

use pooled_dao::config::DaoConfig;
use pooled_dao::dao::BlockingDao;
use pooled_dao::{DbError, Entity, Filters, OrderBy, Page};
use serde::{Deserialize, Serialize};
use tempfile::{NamedTempFile, TempPath};
use tokio_test::{assert_err, assert_ok};

#[derive(Debug, Clone, PartialEq, Deserialize)]
struct Note {
    id: i64,
    title: String,
    pinned: i64,
}

#[derive(Debug, Clone, Default, Serialize)]
struct NoteFields {
    #[serde(skip_serializing_if = "Option::is_none")]
    title: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pinned: Option<i64>,
}

impl Entity for Note {
    const TABLE: &'static str = "notes";
    type Id = i64;
    type Fields = NoteFields;
}

fn titled(title: &str) -> NoteFields {
    NoteFields {
        title: Some(title.to_string()),
        ..NoteFields::default()
    }
}

fn setup() -> (TempPath, BlockingDao<Note>) {
    let path = NamedTempFile::new().unwrap().into_temp_path();
    let config = DaoConfig::parse(&format!("sqlite:{}", path.display())).unwrap();
    let dao = assert_ok!(BlockingDao::<Note>::connect(&config));
    assert_ok!(dao.run_custom(|scope| {
        Box::pin(async move {
            scope
                .execute(
                    "CREATE TABLE notes (
                        id INTEGER PRIMARY KEY,
                        title TEXT NOT NULL,
                        pinned INTEGER NOT NULL DEFAULT 0
                    )",
                    vec![],
                )
                .await?;
            Ok(())
        })
    }));
    (path, dao)
}

#[test]
fn test_blocking_crud_round_trip() {
    let (_path, dao) = setup();

    let note = assert_ok!(dao.create(titled("groceries")));
    assert_eq!(note.pinned, 0);
    assert_eq!(assert_ok!(dao.get(note.id)), Some(note.clone()));
    assert!(assert_ok!(dao.exists(note.id)));

    let pinned = assert_ok!(dao.update(
        note.id,
        NoteFields {
            pinned: Some(1),
            ..NoteFields::default()
        }
    ));
    assert_eq!(pinned.map(|n| n.pinned), Some(1));
    assert_eq!(assert_ok!(dao.update(12345, titled("nope"))), None);

    let upserted = assert_ok!(dao.upsert(500, titled("chores")));
    assert_eq!(upserted.id, 500);

    assert!(assert_ok!(dao.delete(note.id)));
    assert!(!assert_ok!(dao.delete(note.id)));
    assert_eq!(assert_ok!(dao.get(note.id)), None);
}

#[test]
fn test_blocking_listing() {
    let (_path, dao) = setup();
    for title in ["b", "a", "c"] {
        assert_ok!(dao.create(titled(title)));
    }
    assert_ok!(dao.update(
        2,
        NoteFields {
            pinned: Some(1),
            ..NoteFields::default()
        }
    ));

    assert_eq!(assert_ok!(dao.list(Page::default())).len(), 3);

    let pinned = assert_ok!(dao.list_by(Filters::new().eq("pinned", 1), Page::default()));
    assert_eq!(pinned.len(), 1);
    assert_eq!(pinned[0].title, "a");

    let by_title = assert_ok!(dao.list_by_ordered(
        OrderBy::asc("title"),
        Filters::new(),
        Page::new(2, 0)
    ));
    let titles: Vec<_> = by_title.iter().map(|n| n.title.as_str()).collect();
    assert_eq!(titles, ["a", "b"]);
}

#[test]
fn test_blocking_close() {
    let (_path, dao) = setup();
    assert_ok!(dao.close());
    assert!(dao.as_async().is_closed());
    assert_ok!(dao.close());
    assert!(matches!(assert_err!(dao.get(1)), DbError::PoolClosed));
}
