use crate::error::{RasterError, RasterResult};

/// Explicit handle to the data-parallel execution backend.
///
/// All stage parallelism runs inside the pool owned by this context, so two
/// pipelines with separate contexts never contend on a hidden global. The
/// pool is torn down when the context is dropped.
pub struct AcceleratorContext {
    pool: rayon::ThreadPool,
}

impl AcceleratorContext {
    /// Create a context using one worker per available CPU.
    pub fn new() -> RasterResult<Self> {
        Self::with_threads(0)
    }

    /// Create a context with an explicit worker count (0 = one per CPU).
    pub fn with_threads(num_threads: usize) -> RasterResult<Self> {
        let pool = rayon::ThreadPoolBuilder::new()
            .num_threads(num_threads)
            .thread_name(|i| format!("tilerast-{}", i))
            .build()
            .map_err(|e| RasterError::Backend(e.to_string()))?;
        log::debug!("AcceleratorContext: {} workers", pool.current_num_threads());
        Ok(Self { pool })
    }

    pub fn num_threads(&self) -> usize {
        self.pool.current_num_threads()
    }

    /// Run a closure inside the worker pool. Returns only once all parallel
    /// work spawned by the closure has completed, which is what makes each
    /// stage boundary a full barrier.
    pub(crate) fn install<R: Send>(&self, f: impl FnOnce() -> R + Send) -> R {
        self.pool.install(f)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn explicit_thread_count() {
        let ctx = AcceleratorContext::with_threads(2).unwrap();
        assert_eq!(ctx.num_threads(), 2);
    }

    #[test]
    fn install_runs_in_pool() {
        let ctx = AcceleratorContext::with_threads(3).unwrap();
        let n = ctx.install(rayon::current_num_threads);
        assert_eq!(n, 3);
    }
}
