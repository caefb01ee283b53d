use std::fs::OpenOptions;
use std::io::Write;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use tidemq::brokers::queue::persistence::{Database, DatabaseOptions, ErrorHint, RedeliveryTracker};
use tidemq::error::StoreError;

mod helpers;
use helpers::{msg, open_database, quiet_db_options};

fn ids(db_list: &[tidemq::brokers::queue::Message]) -> Vec<String> {
    db_list.iter().map(|m| m.id.clone()).collect()
}

#[cfg(test)]
mod database_tests {
    use super::*;

    // =========================================================================================
    // 1. RECOVERY
    // =========================================================================================

    mod recovery {
        use super::*;

        #[tokio::test]
        async fn test_insert_survives_reopen() {
            let tmp = tempfile::tempdir().unwrap();
            let db = open_database(tmp.path(), "orders", quiet_db_options()).await;

            db.insert(&msg("m1", "payload-x")).await.unwrap();
            db.close().await.unwrap();
            assert!(!db.is_open().await);

            db.open().await.unwrap();
            let listed = db.list().await;
            assert_eq!(ids(&listed), vec!["m1"]);
            assert_eq!(&listed[0].payload[..], b"payload-x");
        }

        #[tokio::test]
        async fn test_replay_matches_live_set() {
            let tmp = tempfile::tempdir().unwrap();
            let db = open_database(tmp.path(), "replay", quiet_db_options()).await;

            for i in 0..20 {
                db.insert(&msg(&format!("m{}", i), "x")).await.unwrap();
            }
            for i in (0..20).filter(|i| i % 3 == 0) {
                assert!(db.delete(&format!("m{}", i)).await.unwrap());
            }
            db.insert(&msg("m0", "again")).await.unwrap();
            let before = ids(&db.list().await);

            db.close().await.unwrap();
            db.open().await.unwrap();
            assert_eq!(ids(&db.list().await), before);
        }

        #[tokio::test]
        async fn test_torn_tail_is_truncated() {
            let tmp = tempfile::tempdir().unwrap();
            let db = open_database(tmp.path(), "torn", quiet_db_options()).await;
            db.insert(&msg("m1", "x")).await.unwrap();
            db.insert(&msg("m2", "y")).await.unwrap();
            db.close().await.unwrap();
            let intact = db.file_size();

            {
                let mut file = OpenOptions::new().append(true).open(db.path()).unwrap();
                file.write_all(&[0, 0, 0, 40, 1, 2, 3]).unwrap();
            }

            db.open().await.unwrap();
            assert_eq!(ids(&db.list().await), vec!["m1", "m2"]);
            assert_eq!(db.file_size(), intact);

            db.insert(&msg("m3", "z")).await.unwrap();
            db.close().await.unwrap();
            db.open().await.unwrap();
            assert_eq!(ids(&db.list().await), vec!["m1", "m2", "m3"]);
        }

        #[tokio::test]
        async fn test_open_shrinks_stale_tombstones() {
            let tmp = tempfile::tempdir().unwrap();
            let db = open_database(tmp.path(), "tombstones", quiet_db_options()).await;
            db.insert(&msg("m1", "x")).await.unwrap();
            db.insert(&msg("m2", "y")).await.unwrap();
            db.delete("m1").await.unwrap();
            db.flush().await.unwrap();
            let dirty = db.file_size();
            // Dropped without close, so no final shrink ran.
            drop(db);

            let reopened = open_database(tmp.path(), "tombstones", quiet_db_options()).await;
            assert_eq!(reopened.pending_deletes().await, 0);
            assert!(reopened.file_size() < dirty);
            assert_eq!(ids(&reopened.list().await), vec!["m2"]);
        }
    }

    // =========================================================================================
    // 2. MUTATIONS
    // =========================================================================================

    mod mutations {
        use super::*;

        #[tokio::test]
        async fn test_duplicate_rejected_without_writing() {
            let tmp = tempfile::tempdir().unwrap();
            let db = open_database(tmp.path(), "dupes", quiet_db_options()).await;

            db.insert(&msg("m1", "first")).await.unwrap();
            db.flush().await.unwrap();
            let size = db.file_size();

            let err = db.insert(&msg("m1", "second")).await.unwrap_err();
            assert!(err.is_duplicate());
            db.flush().await.unwrap();

            assert_eq!(db.file_size(), size);
            assert_eq!(&db.get("m1").await.unwrap().payload[..], b"first");
            assert_eq!(db.message_count().await, 1);
        }

        #[tokio::test]
        async fn test_reinsert_after_delete_is_allowed() {
            let tmp = tempfile::tempdir().unwrap();
            let db = open_database(tmp.path(), "reuse", quiet_db_options()).await;

            db.insert(&msg("m1", "a")).await.unwrap();
            assert!(db.delete("m1").await.unwrap());
            assert!(!db.delete("m1").await.unwrap());
            db.insert(&msg("m1", "b")).await.unwrap();
            assert_eq!(&db.get("m1").await.unwrap().payload[..], b"b");
        }

        #[tokio::test]
        async fn test_closed_store_refuses_writes() {
            let tmp = tempfile::tempdir().unwrap();
            let db = Arc::new(Database::new("closed", tmp.path().join("closed.tdb"), quiet_db_options()));

            assert!(matches!(db.insert(&msg("m1", "x")).await, Err(StoreError::Closed)));
            assert!(matches!(db.delete("m1").await, Err(StoreError::Closed)));
            assert!(!db.shrink().await.successful);
        }

        #[tokio::test]
        async fn test_clear_truncates_log() {
            let tmp = tempfile::tempdir().unwrap();
            let db = open_database(tmp.path(), "cleared", quiet_db_options()).await;
            for i in 0..5 {
                db.insert(&msg(&format!("m{}", i), "x")).await.unwrap();
            }
            db.clear().await.unwrap();

            assert_eq!(db.message_count().await, 0);
            assert_eq!(db.file_size(), 0);

            db.insert(&msg("fresh", "x")).await.unwrap();
            db.close().await.unwrap();
            db.open().await.unwrap();
            assert_eq!(ids(&db.list().await), vec!["fresh"]);
        }

        #[tokio::test]
        async fn test_instant_flush_writes_through() {
            let tmp = tempfile::tempdir().unwrap();
            let options = DatabaseOptions {
                instant_flush: true,
                ..quiet_db_options()
            };
            let db = open_database(tmp.path(), "instant", options).await;

            assert_eq!(db.file_size(), 0);
            db.insert(&msg("m1", "x")).await.unwrap();
            assert!(db.file_size() > 0);
        }

        #[tokio::test]
        async fn test_remove_database_deletes_file() {
            let tmp = tempfile::tempdir().unwrap();
            let db = open_database(tmp.path(), "doomed", quiet_db_options()).await;
            db.insert(&msg("m1", "x")).await.unwrap();

            db.remove_database().await.unwrap();
            assert!(!db.path().exists());
            db.remove_database().await.unwrap();
        }

        #[tokio::test]
        async fn test_remove_database_keeps_backups_and_drops_leftovers() {
            let tmp = tempfile::tempdir().unwrap();
            let options = DatabaseOptions {
                create_backup_on_shrink: true,
                ..quiet_db_options()
            };
            let db = open_database(tmp.path(), "retired", options).await;
            db.insert(&msg("m1", "x")).await.unwrap();
            db.delete("m1").await.unwrap();
            assert!(db.shrink().await.successful);
            db.insert(&msg("m2", "x")).await.unwrap();

            let mut leftover = db.path().as_os_str().to_owned();
            leftover.push(".shrink");
            std::fs::write(&leftover, b"stale").unwrap();

            db.remove_database().await.unwrap();
            assert!(!db.path().exists());
            assert!(!std::path::Path::new(&leftover).exists());

            let backups = std::fs::read_dir(tmp.path())
                .unwrap()
                .filter_map(|e| e.ok())
                .filter(|e| e.file_name().to_string_lossy().ends_with(".bak"))
                .count();
            assert_eq!(backups, 1);
        }
    }

    // =========================================================================================
    // 3. SHRINK
    // =========================================================================================

    mod shrink {
        use super::*;

        #[tokio::test]
        async fn test_shrink_drops_deleted_records() {
            let tmp = tempfile::tempdir().unwrap();
            let db = open_database(tmp.path(), "shrinking", quiet_db_options()).await;

            db.insert(&msg("m1", "some payload")).await.unwrap();
            db.delete("m1").await.unwrap();
            db.flush().await.unwrap();
            let before = db.file_size();

            let info = db.shrink().await;
            assert!(info.successful, "{:?}", info.error);
            assert_eq!(info.old_size, before);
            assert!(info.new_size < before);
            assert!(db.list().await.is_empty());
            assert!(db.file_size() < before);
        }

        #[tokio::test]
        async fn test_shrink_preserves_live_messages() {
            let tmp = tempfile::tempdir().unwrap();
            let db = open_database(tmp.path(), "liveness", quiet_db_options()).await;

            for i in 0..50 {
                db.insert(&msg(&format!("m{}", i), "payload")).await.unwrap();
            }
            for i in (0..50).filter(|i| i % 2 == 1) {
                db.delete(&format!("m{}", i)).await.unwrap();
            }
            let before = ids(&db.list().await);

            let info = db.shrink().await;
            assert!(info.successful);
            assert!(info.new_size < info.old_size);
            assert_eq!(ids(&db.list().await), before);
            assert_eq!(db.pending_deletes().await, 0);

            db.close().await.unwrap();
            db.open().await.unwrap();
            assert_eq!(ids(&db.list().await), before);
        }

        #[tokio::test]
        async fn test_shrink_without_deletes_is_noop() {
            let tmp = tempfile::tempdir().unwrap();
            let db = open_database(tmp.path(), "clean", quiet_db_options()).await;
            db.insert(&msg("m1", "x")).await.unwrap();

            let info = db.shrink().await;
            assert!(info.successful);
            assert_eq!(info.old_size, info.new_size);
        }

        #[tokio::test]
        async fn test_writes_during_shrink_are_kept() {
            let tmp = tempfile::tempdir().unwrap();
            let db = open_database(tmp.path(), "concurrent", quiet_db_options()).await;
            for i in 0..200 {
                db.insert(&msg(&format!("old{}", i), "payload")).await.unwrap();
            }
            for i in 0..100 {
                db.delete(&format!("old{}", i)).await.unwrap();
            }

            let writer = {
                let db = db.clone();
                tokio::spawn(async move {
                    for i in 0..50 {
                        db.insert(&msg(&format!("new{}", i), "payload")).await.unwrap();
                        db.delete(&format!("old{}", 100 + i)).await.unwrap();
                    }
                })
            };
            let info = db.shrink().await;
            writer.await.unwrap();
            assert!(info.successful);

            let live = ids(&db.list().await);
            db.close().await.unwrap();
            db.open().await.unwrap();
            assert_eq!(ids(&db.list().await), live);
            assert_eq!(live.len(), 100);
        }

        #[tokio::test]
        async fn test_backup_on_shrink() {
            let tmp = tempfile::tempdir().unwrap();
            let options = DatabaseOptions {
                create_backup_on_shrink: true,
                ..quiet_db_options()
            };
            let db = open_database(tmp.path(), "backed", options).await;
            db.insert(&msg("m1", "x")).await.unwrap();
            db.delete("m1").await.unwrap();

            assert!(db.shrink().await.successful);

            let backups: Vec<_> = std::fs::read_dir(tmp.path())
                .unwrap()
                .filter_map(|e| e.ok())
                .filter(|e| e.file_name().to_string_lossy().ends_with(".bak"))
                .collect();
            assert_eq!(backups.len(), 1);
        }

        #[tokio::test]
        async fn test_error_hint_reports_failed_shrink() {
            let tmp = tempfile::tempdir().unwrap();
            let hits = Arc::new(AtomicUsize::new(0));
            let counter = hits.clone();
            let hint: ErrorHint = Arc::new(move |_kind, _err| {
                counter.fetch_add(1, Ordering::SeqCst);
            });

            let db = Arc::new(
                Database::new("hinted", tmp.path().join("hinted.tdb"), quiet_db_options()).with_error_hint(hint),
            );
            db.open().await.unwrap();
            db.insert(&msg("m1", "x")).await.unwrap();
            db.delete("m1").await.unwrap();

            // A directory where the temp file should go makes the rewrite fail.
            let mut blocker = db.path().as_os_str().to_owned();
            blocker.push(".shrink");
            std::fs::create_dir(&blocker).unwrap();

            let info = db.shrink().await;
            assert!(!info.successful);
            assert!(info.error.is_some());
            assert_eq!(hits.load(Ordering::SeqCst), 1);
            assert_eq!(db.pending_deletes().await, 1, "tombstones are kept for the next attempt");

            std::fs::remove_dir(&blocker).unwrap();
            assert!(db.shrink().await.successful);
        }

        #[tokio::test]
        async fn test_background_shrink() {
            let tmp = tempfile::tempdir().unwrap();
            let options = DatabaseOptions {
                auto_flush: true,
                flush_interval_ms: 5,
                auto_shrink: true,
                shrink_interval_ms: 10,
                ..DatabaseOptions::default()
            };
            let db = open_database(tmp.path(), "auto", options).await;
            db.insert(&msg("m1", "x")).await.unwrap();
            db.delete("m1").await.unwrap();

            let mut compacted = false;
            for _ in 0..100 {
                if db.pending_deletes().await == 0 && db.file_size() == 0 {
                    compacted = true;
                    break;
                }
                tokio::time::sleep(std::time::Duration::from_millis(10)).await;
            }
            assert!(compacted);
            assert_eq!(db.file_size(), 0);
        }
    }

    // =========================================================================================
    // 4. REDELIVERY TRACKER
    // =========================================================================================

    mod redelivery {
        use super::*;

        #[tokio::test]
        async fn test_counts_survive_reload_and_remove() {
            let tmp = tempfile::tempdir().unwrap();
            let path = tmp.path().join("orders.delivery");

            let tracker = RedeliveryTracker::new("orders", &path);
            tracker.load().await.unwrap();
            assert_eq!(tracker.increment("m1").await.unwrap(), 1);
            assert_eq!(tracker.increment("m1").await.unwrap(), 2);
            tracker.set("m2", 7).await.unwrap();
            tracker.increment("m3").await.unwrap();
            tracker.remove("m3").await.unwrap();
            tracker.close().await.unwrap();

            let reloaded = RedeliveryTracker::new("orders", &path);
            reloaded.load().await.unwrap();
            assert_eq!(reloaded.get("m1").await, 2);
            assert_eq!(reloaded.get("m2").await, 7);
            assert_eq!(reloaded.get("m3").await, 0);
            assert_eq!(reloaded.all().await.len(), 2);
        }
    }
}
