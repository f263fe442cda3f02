//! Concurrent first submissions must share one background runtime.
//!
//! Kept in its own test binary so no other test starts the runtime first.

use pooled_dao::dao::{runtime_starts, submit, worker_count};
use std::sync::{Arc, Barrier};
use std::thread;

const CALLERS: usize = 16;

#[test]
fn test_concurrent_first_submits_build_one_runtime() {
    assert_eq!(runtime_starts(), 0);

    let barrier = Arc::new(Barrier::new(CALLERS));
    let callers: Vec<_> = (0..CALLERS)
        .map(|i| {
            let barrier = Arc::clone(&barrier);
            thread::spawn(move || {
                barrier.wait();
                submit("startup", "race", async move {
                    let worker = thread::current().name().map(str::to_string);
                    Ok((i, worker))
                })
                .wait()
            })
        })
        .collect();

    let mut seen: Vec<usize> = Vec::new();
    for caller in callers {
        let (i, worker) = caller.join().unwrap().unwrap();
        assert_eq!(worker.as_deref(), Some("dao-bg"));
        seen.push(i);
    }
    seen.sort_unstable();
    assert_eq!(seen, (0..CALLERS).collect::<Vec<_>>());

    assert_eq!(runtime_starts(), 1);
    assert!(worker_count() >= 4);
}
