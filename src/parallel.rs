//! Shared compute pool and parallel-for helpers
//!
//! One rayon pool sized to the physical core count serves every layer;
//! hyperthread siblings contend for the same vector units, so logical-core
//! oversubscription only adds scheduling noise to these kernels.

use std::sync::OnceLock;

use rayon::prelude::*;

static POOL: OnceLock<rayon::ThreadPool> = OnceLock::new();

/// The process-wide compute pool, built on first use
pub fn pool() -> &'static rayon::ThreadPool {
    POOL.get_or_init(|| {
        let threads = num_cpus::get_physical().max(1);
        rayon::ThreadPoolBuilder::new()
            .num_threads(threads)
            .thread_name(|i| format!("inferir-compute-{i}"))
            .build()
            .unwrap_or_else(|e| panic!("failed to build compute pool: {e}"))
    })
}

/// Number of workers in the compute pool
#[must_use]
pub fn split_size() -> usize {
    pool().current_num_threads()
}

/// Runs `action(i)` for every `i` in `[start, end)` on the compute pool
pub fn pfor<F>(start: usize, end: usize, action: F)
where
    F: Fn(usize) + Send + Sync,
{
    pool().install(|| {
        (start..end).into_par_iter().for_each(|i| action(i));
    });
}

/// Splits `[offset, offset + length)` into roughly pool-sized chunks and
/// runs `action(chunk_offset, chunk_length)` for each in parallel.
///
/// The remainder folds into the final chunk.
pub fn pchunk<F>(offset: usize, length: usize, action: F)
where
    F: Fn(usize, usize) + Send + Sync,
{
    if length == 0 {
        return;
    }
    let splits = split_size().min(length);
    let chunk = length / splits;
    let remainder = length - splits * chunk;
    pool().install(|| {
        (0..splits).into_par_iter().for_each(|i| {
            let len = if i == splits - 1 { chunk + remainder } else { chunk };
            action(offset + i * chunk, len);
        });
    });
}

/// Maps `f` over `[0, n)` in parallel, collecting results in index order
pub fn pmap<T, F>(n: usize, f: F) -> Vec<T>
where
    T: Send,
    F: Fn(usize) -> T + Send + Sync,
{
    pool().install(|| (0..n).into_par_iter().map(f).collect())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[test]
    fn pfor_covers_range() {
        let hits = AtomicUsize::new(0);
        pfor(3, 17, |_| {
            hits.fetch_add(1, Ordering::Relaxed);
        });
        assert_eq!(hits.load(Ordering::Relaxed), 14);
    }

    #[test]
    fn pchunk_covers_range_exactly_once() {
        let total = AtomicUsize::new(0);
        pchunk(10, 1003, |off, len| {
            assert!(off >= 10 && off + len <= 1013);
            total.fetch_add(len, Ordering::Relaxed);
        });
        assert_eq!(total.load(Ordering::Relaxed), 1003);

        for length in [2usize, 7, 10, 63, 100] {
            let total = AtomicUsize::new(0);
            pchunk(0, length, |_, len| {
                total.fetch_add(len, Ordering::Relaxed);
            });
            assert_eq!(total.load(Ordering::Relaxed), length, "length {length}");
        }
    }

    #[test]
    fn pchunk_handles_tiny_ranges() {
        let total = AtomicUsize::new(0);
        pchunk(0, 1, |off, len| {
            assert_eq!(off, 0);
            total.fetch_add(len, Ordering::Relaxed);
        });
        assert_eq!(total.load(Ordering::Relaxed), 1);
        pchunk(0, 0, |_, _| panic!("empty range must not run"));
    }

    #[test]
    fn pmap_preserves_order() {
        let out = pmap(64, |i| i * i);
        for (i, v) in out.iter().enumerate() {
            assert_eq!(*v, i * i);
        }
    }
}
