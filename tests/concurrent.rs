use skip_tree::SkipTreeMap;

#[test]
fn concurrent_tree() {
    let n: u16 = 1024;
    // capped so that the shifted keys stay inside u16
    let concurrency = (std::thread::available_parallelism()
        .map(std::num::NonZeroUsize::get)
        .unwrap_or(8)
        * 2)
        .min(16);

    let run = |tree: SkipTreeMap<u16, u16>, barrier: &std::sync::Barrier, low_bits| {
        let shift = concurrency.next_power_of_two().trailing_zeros();
        let unique_key = |key| (key << shift) | low_bits;

        barrier.wait();
        for key in 0..n {
            let i = unique_key(key);
            assert_eq!(tree.get(&i), None);
            tree.insert(i, i);
            assert_eq!(tree.get(&i), Some(i), "failed to get key {i}");
        }
        for key in 0_u16..n {
            let i = unique_key(key);
            assert_eq!(tree.get(&i), Some(i), "failed to get key {i}");
        }
        for key in 0_u16..n {
            let i = unique_key(key);
            assert!(
                tree.replace_if(&i, &i, unique_key(key.wrapping_mul(2))),
                "failed to replace key {i}"
            );
        }
        let visible: std::collections::HashMap<u16, u16> = tree.iter().collect();

        for key in 0_u16..n {
            let i = unique_key(key);
            let v = unique_key(key.wrapping_mul(2));
            assert_eq!(visible.get(&i).copied(), Some(v), "failed to get key {i}");
        }

        for key in 0..n {
            let i = unique_key(key);
            let v = unique_key(key.wrapping_mul(2));
            assert_eq!(tree.remove(&i), Some(v));
        }
        for key in 0..n {
            let i = unique_key(key);
            assert_eq!(tree.get(&i), None, "failed to get key {i}");
        }
    };

    let tree = SkipTreeMap::default();

    std::thread::scope(|s| {
        for _ in 0..16 {
            let barrier = std::sync::Arc::new(std::sync::Barrier::new(concurrency));
            let mut threads = vec![];
            for i in 0..concurrency {
                let tree_2 = tree.clone();
                let barrier_2 = barrier.clone();

                let thread = s.spawn(move || run(tree_2, &barrier_2, u16::try_from(i).unwrap()));
                threads.push(thread);
            }
            for thread in threads {
                thread.join().unwrap();
            }
        }
    });

    tree.check_invariants();
    assert!(tree.is_empty());
}

#[test]
fn disjoint_inserts_union() {
    let concurrency = 4.max(
        std::thread::available_parallelism()
            .map(std::num::NonZeroUsize::get)
            .unwrap_or(4),
    ) as u32;
    let per_thread: u32 = 10_000;

    let tree = SkipTreeMap::<u32, u32>::default();
    let barrier = std::sync::Barrier::new(concurrency as usize);

    std::thread::scope(|s| {
        for t in 0..concurrency {
            let tree_2 = tree.clone();
            let barrier_2 = &barrier;
            s.spawn(move || {
                barrier_2.wait();
                let start = t * per_thread;
                for key in start..start + per_thread {
                    assert_eq!(tree_2.insert(key, key), None);
                }
            });
        }
    });

    tree.check_invariants();
    assert_eq!(tree.len() as u32, concurrency * per_thread);

    let keys: Vec<u32> = tree.keys().collect();
    let expected: Vec<u32> = (0..concurrency * per_thread).collect();
    assert_eq!(keys, expected);
}

#[test]
fn racing_inserts_and_removes() {
    let pairs = 4.max(
        std::thread::available_parallelism()
            .map(std::num::NonZeroUsize::get)
            .unwrap_or(4),
    ) / 2;
    let keyspace: u32 = 1024;
    let rounds = 32;

    let tree = SkipTreeMap::<u32, u32>::default();

    std::thread::scope(|s| {
        for _ in 0..pairs {
            let inserter = tree.clone();
            s.spawn(move || {
                for _ in 0..rounds {
                    for key in 0..keyspace {
                        inserter.insert(key, key);
                        // a reader racing with the removers must never see a
                        // value that was not written for this key
                        if let Some(v) = inserter.get(&key) {
                            assert_eq!(v, key);
                        }
                    }
                }
            });
            let remover = tree.clone();
            s.spawn(move || {
                for _ in 0..rounds {
                    for key in 0..keyspace {
                        if let Some(v) = remover.remove(&key) {
                            assert_eq!(v, key);
                        }
                    }
                }
            });
        }
    });

    tree.check_invariants();
    for key in 0..keyspace {
        if let Some(v) = tree.get(&key) {
            assert_eq!(v, key);
        }
    }
}

#[test]
fn replace_serializes_counters() {
    let concurrency = 4.max(
        std::thread::available_parallelism()
            .map(std::num::NonZeroUsize::get)
            .unwrap_or(4),
    ) as u64;
    let keys: u64 = 8;
    let increments: u64 = 500;

    let tree = SkipTreeMap::<u64, u64>::default();
    for key in 0..keys {
        tree.insert(key, 0);
    }

    std::thread::scope(|s| {
        for _ in 0..concurrency {
            let tree_2 = tree.clone();
            s.spawn(move || {
                for key in 0..keys {
                    for _ in 0..increments {
                        loop {
                            let current = tree_2.get(&key).unwrap();
                            if tree_2.replace_if(&key, &current, current + 1) {
                                break;
                            }
                        }
                    }
                }
            });
        }
    });

    // every successful conditional replace is one lost-update-free
    // increment, so the counters add up exactly
    for key in 0..keys {
        assert_eq!(tree.get(&key), Some(concurrency * increments));
    }
}

#[test]
fn iteration_during_churn() {
    let stable: Vec<u32> = (0..2048).map(|k| k * 2).collect();
    let tree = SkipTreeMap::<u32, u32>::default();
    for &key in &stable {
        tree.insert(key, key);
    }

    let done = std::sync::Arc::new(std::sync::atomic::AtomicBool::new(false));

    std::thread::scope(|s| {
        for _ in 0..3 {
            let churn = tree.clone();
            let done_2 = done.clone();
            s.spawn(move || {
                let mut round = 0_u32;
                while !done_2.load(std::sync::atomic::Ordering::Acquire) {
                    for key in (1..4096).step_by(2) {
                        if round % 2 == 0 {
                            churn.insert(key, key);
                        } else {
                            churn.remove(&key);
                        }
                    }
                    round = round.wrapping_add(1);
                }
            });
        }

        let reader = tree.clone();
        for _ in 0..8 {
            let observed: Vec<u32> = reader.keys().collect();
            // never a duplicate, never out of order
            for window in observed.windows(2) {
                assert!(window[0] < window[1]);
            }
            // every key that lived through the whole iteration is observed
            let observed_stable: Vec<u32> =
                observed.iter().copied().filter(|k| k % 2 == 0).collect();
            assert_eq!(observed_stable, stable);
        }
        done.store(true, std::sync::atomic::Ordering::Release);
    });

    tree.check_invariants();
}

#[test]
fn concurrent_pop_first_drains_everything() {
    let n: u64 = 100_000;
    let concurrency = 4;

    let tree = SkipTreeMap::<u64, u64>::default();
    for key in 0..n {
        tree.insert(key, key);
    }

    let mut per_thread: Vec<Vec<(u64, u64)>> = Vec::new();

    std::thread::scope(|s| {
        let mut handles = vec![];
        for _ in 0..concurrency {
            let tree_2 = tree.clone();
            handles.push(s.spawn(move || {
                let mut popped = vec![];
                while let Some(entry) = tree_2.pop_first() {
                    popped.push(entry);
                }
                popped
            }));
        }
        for handle in handles {
            per_thread.push(handle.join().unwrap());
        }
    });

    assert!(tree.is_empty());

    // each thread observes an ascending subsequence, and the union is
    // exactly the original contents with no entry popped twice
    let mut all = vec![];
    for popped in per_thread {
        for window in popped.windows(2) {
            assert!(window[0].0 < window[1].0);
        }
        all.extend(popped);
    }
    all.sort_unstable();
    let expected: Vec<(u64, u64)> = (0..n).map(|k| (k, k)).collect();
    assert_eq!(all, expected);
}
