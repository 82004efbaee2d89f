//! Parallel dispatch service used by the pipeline.
//!
//! A dispatch runs one kernel invocation per worker index, grouped into
//! batches of `batch_size` workers, and returns once every invocation has
//! finished. `barrier` is issued between passes and publishes all writes of
//! the finished pass to the next one.

use std::sync::atomic::{Ordering, fence};

use rayon::prelude::*;
use rayon::{ThreadPool, ThreadPoolBuilder};

use crate::error::Result;
use crate::pipeline::Stage;

pub trait Dispatch: Send + Sync {
    fn batch_size(&self) -> usize;

    /// Most batches a single dispatch may be split into.
    fn max_batches(&self) -> usize {
        usize::MAX
    }

    fn batches(&self, workers: usize) -> usize {
        workers.div_ceil(self.batch_size().max(1))
    }

    /// Runs `kernel(worker)` for every worker in `0..workers`. Kernels of this
    /// form only touch shared state through atomics.
    fn dispatch<F>(&self, stage: Stage, workers: usize, kernel: F) -> Result<()>
    where
        F: Fn(usize) + Send + Sync;

    /// Runs `kernel(slot, &mut slots[slot])` for every slot; each worker owns
    /// exactly one output slot.
    fn dispatch_slots<T, F>(&self, stage: Stage, slots: &mut [T], kernel: F) -> Result<()>
    where
        T: Send,
        F: Fn(usize, &mut T) + Send + Sync;

    fn barrier(&self);
}

/// Dispatches onto a dedicated rayon pool.
pub struct RayonDispatch {
    pool: ThreadPool,
    batch_size: usize,
}

impl RayonDispatch {
    /// `threads = None` sizes the pool to the machine.
    pub fn new(threads: Option<usize>, batch_size: usize) -> Result<Self> {
        let mut builder = ThreadPoolBuilder::new().thread_name(|i| format!("sph-worker-{i}"));
        if let Some(n) = threads {
            builder = builder.num_threads(n);
        }
        Ok(Self {
            pool: builder.build()?,
            batch_size: batch_size.max(1),
        })
    }

    pub fn threads(&self) -> usize {
        self.pool.current_num_threads()
    }
}

impl Dispatch for RayonDispatch {
    fn batch_size(&self) -> usize {
        self.batch_size
    }

    fn dispatch<F>(&self, _stage: Stage, workers: usize, kernel: F) -> Result<()>
    where
        F: Fn(usize) + Send + Sync,
    {
        let batch = self.batch_size;
        self.pool.install(|| {
            (0..self.batches(workers)).into_par_iter().for_each(|b| {
                let end = ((b + 1) * batch).min(workers);
                for worker in b * batch..end {
                    kernel(worker);
                }
            })
        });
        Ok(())
    }

    fn dispatch_slots<T, F>(&self, _stage: Stage, slots: &mut [T], kernel: F) -> Result<()>
    where
        T: Send,
        F: Fn(usize, &mut T) + Send + Sync,
    {
        let batch = self.batch_size;
        self.pool.install(|| {
            slots
                .par_chunks_mut(batch)
                .enumerate()
                .for_each(|(b, chunk)| {
                    for (k, slot) in chunk.iter_mut().enumerate() {
                        kernel(b * batch + k, slot);
                    }
                })
        });
        Ok(())
    }

    fn barrier(&self) {
        // install() already joined every worker; the fence makes the ordering explicit
        fence(Ordering::SeqCst);
    }
}

/// Runs every worker in order on the calling thread. Deterministic, handy for
/// small pools and for debugging.
#[derive(Clone, Copy, Debug)]
pub struct SerialDispatch {
    pub batch_size: usize,
}

impl Default for SerialDispatch {
    fn default() -> Self {
        Self { batch_size: 256 }
    }
}

impl Dispatch for SerialDispatch {
    fn batch_size(&self) -> usize {
        self.batch_size.max(1)
    }

    fn dispatch<F>(&self, _stage: Stage, workers: usize, kernel: F) -> Result<()>
    where
        F: Fn(usize) + Send + Sync,
    {
        (0..workers).for_each(kernel);
        Ok(())
    }

    fn dispatch_slots<T, F>(&self, _stage: Stage, slots: &mut [T], kernel: F) -> Result<()>
    where
        T: Send,
        F: Fn(usize, &mut T) + Send + Sync,
    {
        for (slot, value) in slots.iter_mut().enumerate() {
            kernel(slot, value);
        }
        Ok(())
    }

    fn barrier(&self) {
        fence(Ordering::SeqCst);
    }
}
