use kernel_sync::SyncOnceCell;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Barrier};
use std::thread;

#[test]
fn empty_until_set() {
    let cell = SyncOnceCell::<u32>::new();
    assert!(cell.get().is_none());
    assert_eq!(cell.set(7), Ok(&7));
    assert_eq!(cell.get(), Some(&7));
}

#[test]
fn second_set_is_rejected() {
    let cell = SyncOnceCell::new();
    assert!(cell.set(1).is_ok());
    assert_eq!(cell.set(2), Err(2));
    assert_eq!(cell.get(), Some(&1));
}

#[test]
fn get_or_init_runs_once_under_contention() {
    let threads = 8;
    let cell = Arc::new(SyncOnceCell::new());
    let calls = Arc::new(AtomicUsize::new(0));
    let start = Arc::new(Barrier::new(threads));

    let handles: Vec<_> = (0..threads)
        .map(|i| {
            let cell = Arc::clone(&cell);
            let calls = Arc::clone(&calls);
            let start = Arc::clone(&start);
            thread::spawn(move || {
                start.wait();
                *cell.get_or_init(|| {
                    calls.fetch_add(1, Ordering::SeqCst);
                    i
                })
            })
        })
        .collect();

    let seen: Vec<usize> = handles.into_iter().map(|h| h.join().unwrap()).collect();
    assert_eq!(calls.load(Ordering::SeqCst), 1);
    assert!(seen.windows(2).all(|w| w[0] == w[1]));
}

#[test]
fn drops_stored_value() {
    let marker = Arc::new(());
    {
        let cell = SyncOnceCell::new();
        assert!(cell.set(Arc::clone(&marker)).is_ok());
        assert_eq!(Arc::strong_count(&marker), 2);
    }
    assert_eq!(Arc::strong_count(&marker), 1);
}
