mod hash_map {
    use std::hash::{BuildHasherDefault, Hasher};
    use std::sync::atomic::AtomicBool;
    use std::sync::atomic::Ordering::{Acquire, Release};
    use std::sync::{Arc, Barrier};
    use std::thread;

    use rand::seq::SliceRandom;

    use crate::ebr::{Domain, Guard, Participant};
    use crate::hash_table::cell::Snapshot;
    use crate::{Config, HashMap, LockedEntry};

    static_assertions::assert_impl_all!(HashMap<u64, u64>: Send, Sync);
    static_assertions::assert_not_impl_any!(HashMap<*const u8, u64>: Send, Sync);
    static_assertions::assert_impl_all!(Domain: Send, Sync);
    static_assertions::assert_not_impl_any!(Participant: Send, Sync);
    static_assertions::assert_not_impl_any!(Guard<'static>: Send, Sync);
    static_assertions::assert_not_impl_any!(LockedEntry<'static, u64, u64>: Send, Sync);

    #[derive(Default)]
    struct IdentityHasher(u64);

    impl Hasher for IdentityHasher {
        fn finish(&self) -> u64 {
            self.0
        }
        fn write(&mut self, bytes: &[u8]) {
            for byte in bytes {
                self.0 = (self.0 << 8) | u64::from(*byte);
            }
        }
        fn write_u64(&mut self, i: u64) {
            self.0 = i;
        }
    }

    type Identity = BuildHasherDefault<IdentityHasher>;

    fn checksum(key: u64, round: u64) -> u64 {
        round.wrapping_mul(0x9E37_79B9_7F4A_7C15) ^ key
    }

    #[cfg_attr(miri, ignore)]
    #[test]
    fn torn_reads() {
        let num_readers = 4;
        let num_keys = 64;
        let hashmap: HashMap<u64, (u64, u64), Identity> = HashMap::with_config_and_hasher(
            Config::default().initial_cells(1).overflow_ratio(1),
            Identity::default(),
        );
        let barrier = Barrier::new(num_readers + 1);
        let done = AtomicBool::new(false);

        thread::scope(|s| {
            s.spawn(|| {
                let participant = hashmap.register();
                let mut guard = participant.acquire();
                barrier.wait();
                for round in 0..256 {
                    for key in 0..num_keys {
                        let value = (round, checksum(key, round));
                        assert!(hashmap.insert_or_update(key, value, &guard).is_ok());
                        guard.quiescent();
                    }
                    if round % 8 == 7 {
                        for key in (0..num_keys).step_by(3) {
                            assert!(hashmap.remove(&key, &guard));
                        }
                    }
                }
                done.store(true, Release);
            });
            for _ in 0..num_readers {
                s.spawn(|| {
                    let participant = hashmap.register();
                    let mut guard = participant.acquire();
                    barrier.wait();
                    let mut last_round = vec![0; num_keys as usize];
                    while !done.load(Acquire) {
                        for key in 0..num_keys {
                            if let Some((round, sum)) = hashmap.find(&key, &guard) {
                                assert_eq!(sum, checksum(key, round));
                                assert!(round >= last_round[key as usize]);
                                last_round[key as usize] = round;
                            }
                            guard.quiescent();
                        }
                    }
                });
            }
        });

        let participant = hashmap.register();
        let guard = participant.acquire();
        // The last round ends with a removal pass.
        for key in 0..num_keys {
            let expected = (key % 3 != 0).then(|| (255, checksum(key, 255)));
            assert_eq!(hashmap.find(&key, &guard), expected);
        }
    }

    #[cfg_attr(miri, ignore)]
    #[test]
    fn insert_remove_grow() {
        let num_threads = 8;
        let workload_size = 1024;
        let hashmap: HashMap<u64, u64, Identity> =
            HashMap::with_config_and_hasher(Config::default().initial_cells(1), Identity::default());
        let barrier = Barrier::new(num_threads);

        thread::scope(|s| {
            for thread_id in 0..num_threads {
                let hashmap = &hashmap;
                let barrier = &barrier;
                s.spawn(move || {
                    let participant = hashmap.register();
                    barrier.wait();
                    let mut keys: Vec<u64> = (0..workload_size)
                        .map(|i| i * num_threads as u64 + thread_id as u64)
                        .collect();
                    keys.shuffle(&mut rand::thread_rng());
                    for &key in &keys {
                        let guard = participant.acquire();
                        assert_eq!(hashmap.insert(key, key, &guard), Ok(true));
                    }
                    let mut guard = participant.acquire();
                    for key in &keys {
                        assert_eq!(hashmap.find(key, &guard), Some(*key));
                        guard.quiescent();
                    }
                    for key in keys.iter().filter(|k| *k % 2 == 0) {
                        assert!(hashmap.remove(key, &guard));
                        guard.quiescent();
                    }
                    for key in &keys {
                        assert_eq!(hashmap.find(key, &guard).is_some(), key % 2 == 1);
                    }
                });
            }
        });

        let participant = hashmap.register();
        let guard = participant.acquire();
        let total = workload_size as usize * num_threads;
        assert_eq!(hashmap.len(&guard), total / 2);
        assert!(hashmap.capacity(&guard) >= total);
        assert!(hashmap.cell_count(&guard) >= 256);
    }

    #[cfg_attr(miri, ignore)]
    #[test]
    fn locked_entries() {
        let num_threads = 4;
        let num_keys = 16;
        let hashmap: HashMap<u64, u64> = HashMap::default();
        {
            let participant = hashmap.register();
            let guard = participant.acquire();
            for key in 0..num_keys {
                assert_eq!(hashmap.insert(key, 0, &guard), Ok(true));
            }
        }
        let barrier = Barrier::new(num_threads);

        thread::scope(|s| {
            for _ in 0..num_threads {
                s.spawn(|| {
                    let participant = hashmap.register();
                    barrier.wait();
                    for _ in 0..256 {
                        let guard = participant.acquire();
                        for key in 0..num_keys {
                            let entry = hashmap.find_and_lock(&key, &guard).unwrap();
                            let value = *entry.value();
                            entry.update_and_unlock(value + 1);
                        }
                    }
                });
            }
        });

        let participant = hashmap.register();
        let guard = participant.acquire();
        for key in 0..num_keys {
            assert_eq!(hashmap.find(&key, &guard), Some(num_threads as u64 * 256));
        }
    }

    #[cfg_attr(miri, ignore)]
    #[test]
    fn len_waits_for_locked_entry() {
        let hashmap: HashMap<u64, u64> = HashMap::default();
        let locked = Barrier::new(2);
        let counting = AtomicBool::new(false);
        let counted = AtomicBool::new(false);

        thread::scope(|s| {
            s.spawn(|| {
                let participant = hashmap.register();
                let guard = participant.acquire();
                assert_eq!(hashmap.insert(1, 1, &guard), Ok(true));
                assert_eq!(hashmap.insert(2, 2, &guard), Ok(true));
                let entry = hashmap.find_and_lock(&1, &guard).unwrap();
                locked.wait();
                while !counting.load(Acquire) {
                    thread::yield_now();
                }
                thread::sleep(std::time::Duration::from_millis(20));
                assert!(!counted.load(Acquire));
                entry.update_and_unlock(10);
            });
            s.spawn(|| {
                let participant = hashmap.register();
                locked.wait();
                let guard = participant.acquire();
                counting.store(true, Release);
                assert_eq!(hashmap.len(&guard), 2);
                counted.store(true, Release);
                assert_eq!(hashmap.find(&1, &guard), Some(10));
            });
        });
    }

    #[cfg_attr(miri, ignore)]
    #[test]
    fn pinned_reader_keeps_blocks() {
        let num_writers = 4;
        let workload_size = 512;
        let hashmap: HashMap<u64, u64, Identity> =
            HashMap::with_config_and_hasher(Config::default().initial_cells(4), Identity::default());
        {
            let participant = hashmap.register();
            let guard = participant.acquire();
            for key in 0..12 {
                assert_eq!(hashmap.insert(key, key + 1, &guard), Ok(true));
            }
        }
        let pinned = Barrier::new(num_writers + 1);
        let grown = Barrier::new(num_writers + 1);

        thread::scope(|s| {
            s.spawn(|| {
                let participant = hashmap.register();
                let guard = participant.acquire();
                let block = hashmap.block(&guard);
                assert_eq!(block.cell_count(), 4);
                pinned.wait();
                grown.wait();

                // Every cell of a retired block stays locked, and readable.
                for key in 0..12 {
                    assert_eq!(
                        block.cell(key).read(&key, block.item_count()),
                        Snapshot::Consistent {
                            value: Some(key + 1),
                            frozen: true
                        }
                    );
                }
                assert_eq!(hashmap.domain().reclaimed(), 0);
                assert!(hashmap.domain().pending() > 0);
                drop(guard);
                assert!(hashmap.domain().reclaimed() > 0);
            });
            for writer in 0..num_writers as u64 {
                let hashmap = &hashmap;
                let pinned = &pinned;
                let grown = &grown;
                s.spawn(move || {
                    let participant = hashmap.register();
                    pinned.wait();
                    let mut guard = participant.acquire();
                    for i in 0..workload_size {
                        let key = 12 + i * num_writers as u64 + writer;
                        assert_eq!(hashmap.insert(key, key + 1, &guard), Ok(true));
                        guard.quiescent();
                    }
                    drop(guard);
                    assert_eq!(hashmap.domain().reclaimed(), 0);
                    grown.wait();
                });
            }
        });

        let participant = hashmap.register();
        let guard = participant.acquire();
        assert!(hashmap.cell_count(&guard) >= 1024);
        let total = 12 + workload_size * num_writers as u64;
        for key in 0..total {
            assert_eq!(hashmap.find(&key, &guard), Some(key + 1));
        }
        assert_eq!(hashmap.len(&guard), total as usize);
    }

    #[cfg_attr(miri, ignore)]
    #[test]
    fn shared_domain_across_threads() {
        let num_threads = 4;
        let domain = Domain::new();
        let config = Config::default().initial_cells(1);
        let maps: Vec<HashMap<u64, u64>> = (0..2)
            .map(|_| {
                HashMap::with_domain(config.clone(), Default::default(), domain.clone()).unwrap()
            })
            .collect();
        let barrier = Barrier::new(num_threads);

        thread::scope(|s| {
            for thread_id in 0..num_threads as u64 {
                let maps = &maps;
                let domain = &domain;
                let barrier = &barrier;
                s.spawn(move || {
                    let participant = domain.register();
                    barrier.wait();
                    let mut guard = participant.acquire();
                    for i in 0..512 {
                        let key = i * num_threads as u64 + thread_id;
                        assert_eq!(maps[0].insert(key, i, &guard), Ok(true));
                        assert!(maps[1].insert(i, key, &guard).is_ok());
                        guard.quiescent();
                    }
                });
            }
        });

        let participant = domain.register();
        let guard = participant.acquire();
        assert_eq!(maps[0].len(&guard), 512 * num_threads);
        assert_eq!(maps[1].len(&guard), 512);
    }

    #[cfg_attr(miri, ignore)]
    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn async_tasks() {
        let num_tasks = 16;
        let workload_size = 256;
        let hashmap: Arc<HashMap<u64, u64>> =
            Arc::new(HashMap::with_config(Config::default().initial_cells(2)));

        let mut tasks = Vec::with_capacity(num_tasks);
        for task_id in 0..num_tasks as u64 {
            let hashmap = hashmap.clone();
            tasks.push(tokio::task::spawn(async move {
                for i in 0..workload_size {
                    let key = i * num_tasks as u64 + task_id;
                    {
                        let participant = hashmap.register();
                        let guard = participant.acquire();
                        assert_eq!(hashmap.insert(key, i, &guard), Ok(true));
                        assert_eq!(hashmap.find(&key, &guard), Some(i));
                    }
                    tokio::task::yield_now().await;
                }
                for i in (0..workload_size).filter(|i| i % 4 == 0) {
                    let key = i * num_tasks as u64 + task_id;
                    {
                        let participant = hashmap.register();
                        let guard = participant.acquire();
                        assert!(hashmap.remove(&key, &guard));
                    }
                    tokio::task::yield_now().await;
                }
            }));
        }
        for result in futures::future::join_all(tasks).await {
            assert!(result.is_ok());
        }

        let participant = hashmap.register();
        let guard = participant.acquire();
        assert_eq!(
            hashmap.len(&guard),
            num_tasks * workload_size as usize * 3 / 4
        );
    }
}
