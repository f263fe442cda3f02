//! Shutting the background runtime down must not strand later callers.
//!
//! Kept in its own test binary: shutdown affects every task in the process.

use pooled_dao::config::DaoConfig;
use pooled_dao::dao::{BlockingDao, runtime_starts, shutdown_background, submit};
use pooled_dao::{DbError, Entity, Page};
use serde::{Deserialize, Serialize};
use std::time::Duration;
use tempfile::NamedTempFile;

#[derive(Debug, Clone, PartialEq, Deserialize)]
struct Event {
    id: i64,
    kind: String,
}

#[derive(Debug, Clone, Serialize)]
struct EventFields {
    kind: String,
}

impl Entity for Event {
    const TABLE: &'static str = "events";
    type Id = i64;
    type Fields = EventFields;
}

#[test]
fn test_runtime_restarts_after_shutdown() {
    let path = NamedTempFile::new().unwrap().into_temp_path();
    let config = DaoConfig::parse(&format!("sqlite:{}", path.display())).unwrap();

    let dao = BlockingDao::<Event>::connect(&config).unwrap();
    dao.run_custom(|scope| {
        Box::pin(async move {
            scope
                .execute(
                    "CREATE TABLE events (id INTEGER PRIMARY KEY, kind TEXT NOT NULL)",
                    vec![],
                )
                .await?;
            Ok(())
        })
    })
    .unwrap();
    dao.create(EventFields {
        kind: "before".to_string(),
    })
    .unwrap();

    // Work still queued when the runtime stops resolves to an error
    let stuck = submit("events", "sleep", async {
        tokio::time::sleep(Duration::from_secs(30)).await;
        Ok(())
    });
    let starts = runtime_starts();
    assert!(shutdown_background());
    assert!(matches!(stuck.wait(), Err(DbError::Internal { .. })));
    assert!(!shutdown_background());

    // A fresh runtime and pool pick up where the old ones left off
    let dao = BlockingDao::<Event>::connect(&config).unwrap();
    let events = dao.list(Page::default()).unwrap();
    assert_eq!(events.len(), 1);
    assert_eq!(events[0].kind, "before");
    assert_eq!(runtime_starts(), starts + 1);
}
