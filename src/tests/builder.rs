use std::path::Path;
use std::sync::atomic::AtomicBool;
use std::sync::Arc;

use super::support::*;
use crate::embedding::{BuildError, EmbeddingStore, IndexBuilder};
use crate::model::Embedder;

fn store_for(dir: &Path, embedder: &dyn Embedder) -> EmbeddingStore {
    EmbeddingStore::open(dir.to_path_buf(), embedder.model_id())
}

#[test]
fn test_build_persists_every_category() {
    let dataset = tempfile::tempdir().unwrap();
    let db = tempfile::tempdir().unwrap();
    pets_dataset(dataset.path());

    let embedder = Arc::new(MockEmbedder::rgb());
    let store = store_for(db.path(), embedder.as_ref());

    let report = IndexBuilder::new(preprocessor(), embedder.clone(), &store)
        .build(dataset.path())
        .unwrap();

    assert!(!report.cancelled);
    assert_eq!(report.categories.len(), 2);
    assert_eq!(report.categories["cat"].succeeded, 2);
    assert_eq!(report.categories["dog"].succeeded, 1);
    assert_eq!(report.total_skipped(), 0);
    assert_eq!(embedder.calls(), 3);

    assert_eq!(store.categories().unwrap(), vec!["cat", "dog"]);

    let cat = store.load("cat").unwrap();
    assert_eq!(cat.items().collect::<Vec<_>>(), vec!["a.jpg", "b.jpg"]);
    assert_eq!(cat.get("a.jpg").unwrap(), &[1.0, 0.0, 0.0]);

    let dog = store.load("dog").unwrap();
    assert_eq!(dog.get("c.jpg").unwrap(), &[0.0, 1.0, 0.0]);
}

#[test]
fn test_root_level_files_are_not_categories() {
    let dataset = tempfile::tempdir().unwrap();
    let db = tempfile::tempdir().unwrap();
    pets_dataset(dataset.path());

    let embedder = Arc::new(MockEmbedder::rgb());
    let store = store_for(db.path(), embedder.as_ref());
    IndexBuilder::new(preprocessor(), embedder, &store)
        .build(dataset.path())
        .unwrap();

    assert!(!store.exists("README.txt"));
    assert!(!store.exists("README"));
}

#[test]
fn test_empty_category_is_persisted() {
    let dataset = tempfile::tempdir().unwrap();
    let db = tempfile::tempdir().unwrap();
    pets_dataset(dataset.path());
    std::fs::create_dir(dataset.path().join("fish")).unwrap();

    let embedder = Arc::new(MockEmbedder::rgb());
    let store = store_for(db.path(), embedder.as_ref());
    let report = IndexBuilder::new(preprocessor(), embedder, &store)
        .build(dataset.path())
        .unwrap();

    assert_eq!(report.categories["fish"].succeeded, 0);
    let fish = store.load("fish").unwrap();
    assert!(fish.is_empty());
    assert_eq!(fish.dimensions(), 3);
}

#[test]
fn test_undecodable_item_is_skipped() {
    let dataset = tempfile::tempdir().unwrap();
    let db = tempfile::tempdir().unwrap();
    pets_dataset(dataset.path());
    std::fs::write(dataset.path().join("cat").join("broken.jpg"), b"not an image").unwrap();

    let embedder = Arc::new(MockEmbedder::rgb());
    let store = store_for(db.path(), embedder.as_ref());
    let report = IndexBuilder::new(preprocessor(), embedder, &store)
        .build(dataset.path())
        .unwrap();

    let cat = &report.categories["cat"];
    assert_eq!(cat.succeeded, 2);
    assert_eq!(cat.skipped, 1);
    assert_eq!(cat.failures[0].item, "broken.jpg");

    let stored = store.load("cat").unwrap();
    assert_eq!(stored.len(), 2);
    assert!(!stored.contains("broken.jpg"));
}

#[test]
fn test_nested_directories_are_ignored() {
    let dataset = tempfile::tempdir().unwrap();
    let db = tempfile::tempdir().unwrap();
    pets_dataset(dataset.path());
    write_image(&dataset.path().join("cat").join("kittens").join("k.jpg"), BLUE);

    let embedder = Arc::new(MockEmbedder::rgb());
    let store = store_for(db.path(), embedder.as_ref());
    let report = IndexBuilder::new(preprocessor(), embedder, &store)
        .build(dataset.path())
        .unwrap();

    assert_eq!(report.categories["cat"].succeeded, 2);
    assert!(!store.exists("kittens"));
    assert!(!store.load("cat").unwrap().contains("k.jpg"));
}

#[test]
fn test_missing_dataset() {
    let db = tempfile::tempdir().unwrap();
    let embedder = Arc::new(MockEmbedder::rgb());
    let store = store_for(db.path(), embedder.as_ref());

    let result = IndexBuilder::new(preprocessor(), embedder, &store)
        .build(&db.path().join("nope"));

    assert!(matches!(result, Err(BuildError::DatasetNotFound(_))));
}

#[test]
fn test_rebuild_is_byte_identical() {
    let dataset = tempfile::tempdir().unwrap();
    let db = tempfile::tempdir().unwrap();
    pets_dataset(dataset.path());

    let embedder = Arc::new(MockEmbedder::rgb());
    let store = store_for(db.path(), embedder.as_ref());
    let builder = IndexBuilder::new(preprocessor(), embedder, &store);

    builder.build(dataset.path()).unwrap();
    let first = snapshot(db.path());
    builder.build(dataset.path()).unwrap();
    let second = snapshot(db.path());

    assert_eq!(first.len(), 2);
    assert_eq!(first, second);
}

#[test]
fn test_rebuild_replaces_category_snapshot() {
    let dataset = tempfile::tempdir().unwrap();
    let db = tempfile::tempdir().unwrap();
    pets_dataset(dataset.path());

    let embedder = Arc::new(MockEmbedder::rgb());
    let store = store_for(db.path(), embedder.as_ref());
    let builder = IndexBuilder::new(preprocessor(), embedder, &store);

    builder.build(dataset.path()).unwrap();
    std::fs::remove_file(dataset.path().join("cat").join("b.jpg")).unwrap();
    builder.build(dataset.path()).unwrap();

    let cat = store.load("cat").unwrap();
    assert_eq!(cat.items().collect::<Vec<_>>(), vec!["a.jpg"]);
}

#[test]
fn test_parallel_build_matches_sequential() {
    let dataset = tempfile::tempdir().unwrap();
    pets_dataset(dataset.path());
    for i in 0..12 {
        let color = [i as u8 * 20, 255 - i as u8 * 20, 7];
        write_image(&dataset.path().join("cat").join(format!("extra-{:02}.png", i)), color);
    }

    let sequential = tempfile::tempdir().unwrap();
    let parallel = tempfile::tempdir().unwrap();
    let embedder = Arc::new(MockEmbedder::rgb());

    let store = store_for(sequential.path(), embedder.as_ref());
    IndexBuilder::new(preprocessor(), embedder.clone(), &store)
        .with_parallelism(1)
        .build(dataset.path())
        .unwrap();

    let store = store_for(parallel.path(), embedder.as_ref());
    let report = IndexBuilder::new(preprocessor(), embedder, &store)
        .with_parallelism(4)
        .build(dataset.path())
        .unwrap();

    assert_eq!(report.categories["cat"].succeeded, 14);
    assert_eq!(snapshot(sequential.path()), snapshot(parallel.path()));
}

#[test]
fn test_unavailable_embedder_aborts_build() {
    let dataset = tempfile::tempdir().unwrap();
    let db = tempfile::tempdir().unwrap();
    pets_dataset(dataset.path());

    let embedder = Arc::new(MockEmbedder::unavailable());
    let store = store_for(db.path(), embedder.as_ref());
    let result = IndexBuilder::new(preprocessor(), embedder, &store).build(dataset.path());

    assert!(matches!(result, Err(BuildError::EmbedderUnavailable(_))));
    assert!(snapshot(db.path()).is_empty());
}

#[test]
fn test_cancelled_before_first_category() {
    let dataset = tempfile::tempdir().unwrap();
    let db = tempfile::tempdir().unwrap();
    pets_dataset(dataset.path());

    let embedder = Arc::new(MockEmbedder::rgb());
    let store = store_for(db.path(), embedder.as_ref());
    let report = IndexBuilder::new(preprocessor(), embedder.clone(), &store)
        .with_cancel_flag(Arc::new(AtomicBool::new(true)))
        .build(dataset.path())
        .unwrap();

    assert!(report.cancelled);
    assert!(report.categories.is_empty());
    assert_eq!(embedder.calls(), 0);
    assert!(snapshot(db.path()).is_empty());
}

#[test]
fn test_cancel_keeps_finished_categories() {
    let dataset = tempfile::tempdir().unwrap();
    let db = tempfile::tempdir().unwrap();
    pets_dataset(dataset.path());

    let cancel = Arc::new(AtomicBool::new(false));
    let embedder = Arc::new(MockEmbedder::rgb().interrupting(cancel.clone()));
    let store = store_for(db.path(), embedder.as_ref());
    let report = IndexBuilder::new(preprocessor(), embedder.clone(), &store)
        .with_parallelism(1)
        .with_cancel_flag(cancel)
        .build(dataset.path())
        .unwrap();

    assert!(report.cancelled);
    assert_eq!(report.categories.len(), 1);
    assert_eq!(report.categories["cat"].succeeded, 2);
    assert_eq!(embedder.calls(), 2);

    assert!(db.path().join("cat.emb").is_file());
    assert!(!db.path().join("dog.emb").exists());
    assert_eq!(store.load("cat").unwrap().len(), 2);
}

#[cfg(unix)]
#[test]
fn test_concurrent_build_is_rejected() {
    let dataset = tempfile::tempdir().unwrap();
    let db = tempfile::tempdir().unwrap();
    pets_dataset(dataset.path());

    let _held = crate::lock::FileLock::try_acquire(db.path()).unwrap();

    let embedder = Arc::new(MockEmbedder::rgb());
    let store = store_for(db.path(), embedder.as_ref());
    let result = IndexBuilder::new(preprocessor(), embedder, &store).build(dataset.path());

    assert!(matches!(result, Err(BuildError::Locked(_))));
}

#[test]
fn test_wrong_length_embeddings_are_skipped() {
    let dataset = tempfile::tempdir().unwrap();
    let db = tempfile::tempdir().unwrap();
    pets_dataset(dataset.path());

    let embedder = Arc::new(MockEmbedder::rgb().with_output_len(4));
    let store = store_for(db.path(), embedder.as_ref());
    let report = IndexBuilder::new(preprocessor(), embedder, &store)
        .build(dataset.path())
        .unwrap();

    assert_eq!(report.total_succeeded(), 0);
    assert_eq!(report.total_skipped(), 3);
    assert!(report.categories["cat"].failures[0].reason.contains("expected 3"));
    assert!(store.load("cat").unwrap().is_empty());
}

#[test]
fn test_black_image_is_stored() {
    let dataset = tempfile::tempdir().unwrap();
    let db = tempfile::tempdir().unwrap();
    write_image(&dataset.path().join("night").join("sky.png"), BLACK);

    let embedder = Arc::new(MockEmbedder::rgb());
    let store = store_for(db.path(), embedder.as_ref());
    IndexBuilder::new(preprocessor(), embedder, &store)
        .build(dataset.path())
        .unwrap();

    let night = store.load("night").unwrap();
    assert_eq!(night.get("sky.png").unwrap(), &[0.0, 0.0, 0.0]);
}
