#[cfg(test)]
mod benchmark {
    use crate::GenericBPlusTree;
    use std::collections::BTreeMap;
    use std::sync::{Arc, Barrier, Mutex};
    use std::thread;
    use std::time::{Duration, Instant};

    use serial_test::serial;

    #[derive(Clone, Copy)]
    struct Workload {
        threads: usize,
        inserts: usize,
        reads: usize,
        removes: usize,
    }

    trait BenchmarkOperation: Send + Sync {
        fn insert_test(&self, k: usize, v: u64) -> bool;
        fn read_test(&self, k: &usize) -> bool;
        fn scan_test(&self) -> usize;
        fn remove_test(&self, k: &usize) -> bool;
    }

    impl<const ORDER: usize> BenchmarkOperation for GenericBPlusTree<usize, u64, ORDER> {
        #[inline(always)]
        fn insert_test(&self, k: usize, v: u64) -> bool {
            self.insert(k, v).is_ok()
        }
        #[inline(always)]
        fn read_test(&self, k: &usize) -> bool {
            self.lookup(k, |_| ()).is_some()
        }
        #[inline(always)]
        fn scan_test(&self) -> usize {
            self.iter().count()
        }
        #[inline(always)]
        fn remove_test(&self, k: &usize) -> bool {
            self.remove(k).is_some()
        }
    }

    impl BenchmarkOperation for Mutex<BTreeMap<usize, u64>> {
        #[inline(always)]
        fn insert_test(&self, k: usize, v: u64) -> bool {
            self.lock().unwrap().insert(k, v).is_none()
        }
        #[inline(always)]
        fn read_test(&self, k: &usize) -> bool {
            self.lock().unwrap().get(k).is_some()
        }
        #[inline(always)]
        fn scan_test(&self) -> usize {
            self.lock().unwrap().iter().count()
        }
        #[inline(always)]
        fn remove_test(&self, k: &usize) -> bool {
            self.lock().unwrap().remove(k).is_some()
        }
    }

    fn perform<C: BenchmarkOperation + 'static>(
        container: Arc<C>,
        workload: Workload,
    ) -> (Duration, usize) {
        use rand::seq::SliceRandom;
        use rand::thread_rng;

        let per_thread = workload.inserts + workload.reads + workload.removes;
        let barrier = Arc::new(Barrier::new(workload.threads + 1));

        let mut handles = Vec::new();
        for t in 0..workload.threads {
            let container = Arc::clone(&container);
            let barrier = Arc::clone(&barrier);
            handles.push(thread::spawn(move || {
                let base = t * per_thread;
                let mut keys: Vec<usize> = (base..base + workload.inserts).collect();
                keys.shuffle(&mut thread_rng());

                barrier.wait();
                let mut performed = 0usize;
                for &k in &keys {
                    container.insert_test(k, k as u64);
                    performed += 1;
                }
                for &k in keys.iter().cycle().take(workload.reads) {
                    container.read_test(&k);
                    performed += 1;
                }
                for &k in keys.iter().take(workload.removes) {
                    container.remove_test(&k);
                    performed += 1;
                }
                performed
            }));
        }

        barrier.wait();
        let start = Instant::now();
        let total = handles.into_iter().map(|h| h.join().unwrap()).sum();
        (start.elapsed(), total)
    }

    const SMOKE: Workload = Workload {
        threads: 4,
        inserts: 2000,
        reads: 4000,
        removes: 1000,
    };

    #[test]
    #[serial]
    fn tree_workload_smoke() {
        let tree: Arc<GenericBPlusTree<usize, u64, 64>> = Arc::new(GenericBPlusTree::new());
        let (elapsed, total) = perform(Arc::clone(&tree), SMOKE);
        println!(
            "tree: {} ops in {:?} ({:.0} ops/s)",
            total,
            elapsed,
            total as f64 / elapsed.as_secs_f64()
        );

        assert_eq!(total, SMOKE.threads * (SMOKE.inserts + SMOKE.reads + SMOKE.removes));
        assert_eq!(tree.len(), SMOKE.threads * (SMOKE.inserts - SMOKE.removes));
        assert!(tree.scan_test() == tree.len());
        tree.check_invariants();
    }

    #[test]
    #[serial]
    fn btreemap_workload_baseline() {
        let map: Arc<Mutex<BTreeMap<usize, u64>>> = Arc::new(Mutex::new(BTreeMap::new()));
        let (elapsed, total) = perform(Arc::clone(&map), SMOKE);
        println!(
            "mutexed btreemap: {} ops in {:?} ({:.0} ops/s)",
            total,
            elapsed,
            total as f64 / elapsed.as_secs_f64()
        );

        assert_eq!(
            map.lock().unwrap().len(),
            SMOKE.threads * (SMOKE.inserts - SMOKE.removes)
        );
    }
}
