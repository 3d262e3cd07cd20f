//! A small worker pool abstraction wrapping `rayon::ThreadPool`, so the
//! VArray engine's tile fan-out (§4.8, §9) can be swapped onto a different
//! executor without touching its algorithm.

use rayon::iter::{IndexedParallelIterator, IntoParallelIterator, ParallelIterator};
use rayon::{ThreadPool, ThreadPoolBuilder};

use crate::error::{Error, Result};

/// A bounded pool of worker threads used for VArray tile fan-out.
pub struct Pool {
    inner: ThreadPool,
    size: usize,
}

impl std::fmt::Debug for Pool {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Pool").field("size", &self.size).finish()
    }
}

impl Pool {
    /// Build a pool with `size` worker threads.
    ///
    /// # Errors
    /// Returns [`Error::Client`] if the underlying thread pool could not be built.
    pub fn new(size: usize) -> Result<Self> {
        let inner = ThreadPoolBuilder::new()
            .num_threads(size)
            .build()
            .map_err(|e| Error::Client(format!("could not start worker pool: {e}")))?;
        Ok(Self { inner, size })
    }

    /// The number of worker threads in the pool.
    #[must_use]
    pub fn size(&self) -> usize {
        self.size
    }

    /// Run `job` on the pool and block the caller until it completes.
    pub fn submit<T: Send>(&self, job: impl FnOnce() -> T + Send) -> T {
        self.inner.install(job)
    }

    /// Run `jobs` across the pool, concurrency-limited to [`Pool::size`]
    /// (the pool's own thread count bounds how many run at once -- no
    /// separate limiter is needed), collecting results in input order.
    pub fn map<I, T, F>(&self, items: I, f: F) -> Vec<T>
    where
        I: IntoParallelIterator,
        I::Iter: IndexedParallelIterator,
        T: Send,
        F: Fn(I::Item) -> T + Send + Sync,
    {
        self.inner.install(|| items.into_par_iter().map(f).collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn submit_runs_on_the_pool() {
        let pool = Pool::new(2).unwrap();
        let result = pool.submit(|| 1 + 1);
        assert_eq!(result, 2);
    }
}
