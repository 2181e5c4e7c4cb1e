use std::sync::atomic::{AtomicI64, Ordering};

/// Process-local connection id generator.
///
/// Ids start at 1 and increase strictly for the lifetime of the generator.
/// Nothing is persisted, so a restarted process begins again at 1. Each
/// gateway owns one instance; tests create their own.
#[derive(Debug)]
pub struct SequenceGenerator {
    last: AtomicI64,
}

impl SequenceGenerator {
    pub fn new() -> Self {
        Self {
            last: AtomicI64::new(0),
        }
    }

    pub fn next_id(&self) -> i64 {
        self.last.fetch_add(1, Ordering::Relaxed) + 1
    }
}

impl Default for SequenceGenerator {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashSet;
    use std::sync::Arc;
    use std::thread;

    #[test]
    fn first_id_is_one() {
        let gen = SequenceGenerator::new();
        assert_eq!(gen.next_id(), 1);
        assert_eq!(gen.next_id(), 2);
    }

    #[test]
    fn ids_are_monotonically_increasing() {
        let gen = SequenceGenerator::new();
        let mut prev = 0i64;
        for _ in 0..1_000 {
            let id = gen.next_id();
            assert!(id > prev, "not monotonic: {prev} >= {id}");
            prev = id;
        }
    }

    #[test]
    fn generates_unique_ids_across_threads() {
        let gen = Arc::new(SequenceGenerator::new());
        let handles: Vec<_> = (0..8)
            .map(|_| {
                let gen = gen.clone();
                thread::spawn(move || (0..1_000).map(|_| gen.next_id()).collect::<Vec<_>>())
            })
            .collect();

        let mut ids = HashSet::new();
        for handle in handles {
            for id in handle.join().unwrap() {
                assert!(ids.insert(id), "duplicate id: {id}");
            }
        }
        assert_eq!(ids.len(), 8_000);
        assert_eq!(gen.next_id(), 8_001);
    }

    #[test]
    fn independent_generators_do_not_share_state() {
        let a = SequenceGenerator::new();
        let b = SequenceGenerator::new();
        assert_eq!(a.next_id(), 1);
        assert_eq!(a.next_id(), 2);
        assert_eq!(b.next_id(), 1);
    }
}
