use std::sync::Arc;
use std::thread;

use geotile_rs::persistence::PersistentStore;
use geotile_rs::{ManualClock, MapStore, MemoryStore, TileStore};
use tempfile::tempdir;

mod support;

use support::{allied_territory, reconciler_over, SAN_FRANCISCO, START_MILLIS};

const OAKLAND: (f64, f64) = (37.8044, -122.2712);

const WRITERS: usize = 8;
const PER_WRITER: usize = 25;

/// Every writer targets the same tile; no upsert may be lost.
fn hammer_single_tile<S: MapStore + 'static>(store: Arc<S>) {
    let clock = Arc::new(ManualClock::new(START_MILLIS));
    let reconciler = Arc::new(reconciler_over(store.clone(), clock));
    let (lat, lon) = SAN_FRANCISCO;

    let handles: Vec<_> = (0..WRITERS)
        .map(|writer| {
            let reconciler = reconciler.clone();
            thread::spawn(move || {
                for i in 0..PER_WRITER {
                    let id = format!("w{writer}-t{i}");
                    let alliance = if writer % 2 == 0 { "A" } else { "B" };
                    let mut attempts = 0;
                    loop {
                        match reconciler.apply(&id, allied_territory(&id, lat, lon, alliance)) {
                            Ok(_) => break,
                            Err(err) if err.is_retryable() && attempts < 50 => attempts += 1,
                            Err(err) => panic!("writer {writer} failed: {err}"),
                        }
                    }
                }
            })
        })
        .collect();
    for handle in handles {
        handle.join().expect("writer thread");
    }

    let tile = store.get_tile("9q8yy").unwrap().unwrap();
    assert_eq!(tile.tile.total_territories, WRITERS * PER_WRITER);
    assert_eq!(tile.tile.territories.len(), WRITERS * PER_WRITER);
    assert_eq!(tile.version as usize, WRITERS * PER_WRITER);
    let dominant = tile.tile.dominant_alliance.unwrap();
    assert_eq!(dominant.territory_count, WRITERS * PER_WRITER / 2);
}

#[test]
fn memory_store_loses_no_concurrent_upserts() {
    hammer_single_tile(Arc::new(MemoryStore::new()));
}

#[test]
fn persistent_store_loses_no_concurrent_upserts() {
    let dir = tempdir().unwrap();
    let store = Arc::new(PersistentStore::open(dir.path()).unwrap());
    hammer_single_tile(store);
}

#[test]
fn writes_to_different_tiles_are_independent() {
    let store = Arc::new(MemoryStore::new());
    let reconciler = Arc::new(reconciler_over(
        store.clone(),
        Arc::new(ManualClock::new(START_MILLIS)),
    ));
    let handles: Vec<_> = (0..4)
        .map(|writer| {
            let reconciler = reconciler.clone();
            thread::spawn(move || {
                let lat = 10.0 + writer as f64;
                for i in 0..20 {
                    let id = format!("w{writer}-{i}");
                    reconciler
                        .apply(&id, allied_territory(&id, lat, 20.0, "A"))
                        .unwrap();
                }
            })
        })
        .collect();
    for handle in handles {
        handle.join().expect("writer thread");
    }
    assert_eq!(store.tile_count(), 4);
    for tile in store.scan_tiles("").unwrap() {
        assert_eq!(tile.total_territories, 20);
    }
}

/// Writers move one territory back and forth between two tiles; it must end
/// up in exactly the tile the locator names.
fn shuffle_one_territory<S: MapStore + 'static>(store: Arc<S>) {
    let clock = Arc::new(ManualClock::new(START_MILLIS));
    let reconciler = Arc::new(reconciler_over(store.clone(), clock));

    let handles: Vec<_> = (0..WRITERS)
        .map(|writer| {
            let reconciler = reconciler.clone();
            thread::spawn(move || {
                for i in 0..PER_WRITER {
                    let (lat, lon) = if (writer + i) % 2 == 0 {
                        SAN_FRANCISCO
                    } else {
                        OAKLAND
                    };
                    let mut attempts = 0;
                    loop {
                        match reconciler.apply("t1", allied_territory("t1", lat, lon, "A")) {
                            Ok(_) => break,
                            Err(err) if err.is_retryable() && attempts < 50 => attempts += 1,
                            Err(err) => panic!("writer {writer} failed: {err}"),
                        }
                    }
                }
            })
        })
        .collect();
    for handle in handles {
        handle.join().expect("writer thread");
    }

    let located = store.territory_tile("t1").unwrap().unwrap();
    let holders: Vec<String> = store
        .scan_tiles("9q")
        .unwrap()
        .into_iter()
        .filter(|tile| tile.territory("t1").is_some())
        .map(|tile| tile.key)
        .collect();
    assert_eq!(holders, vec![located]);
    let total: usize = store
        .scan_tiles("9q")
        .unwrap()
        .iter()
        .map(|tile| tile.total_territories)
        .sum();
    assert_eq!(total, 1);
}

#[test]
fn memory_store_keeps_moving_territory_in_one_tile() {
    shuffle_one_territory(Arc::new(MemoryStore::new()));
}

#[test]
fn persistent_store_keeps_moving_territory_in_one_tile() {
    let dir = tempdir().unwrap();
    let store = Arc::new(PersistentStore::open(dir.path()).unwrap());
    shuffle_one_territory(store);
}
