//! Bounded worker pool for independent per-file jobs.

use crate::error::{Error, Result};
use crossbeam::channel;
use parking_lot::Mutex;
use std::thread;

/// Runs `job(0..jobs)` on at most `concurrency` threads and blocks until
/// every job has finished.
///
/// A failing job does not stop the others. The first error observed is
/// returned once all jobs are done.
pub fn for_each_job<F>(jobs: usize, concurrency: usize, job: F) -> Result<()>
where
    F: Fn(usize) -> Result<()> + Sync,
{
    if jobs == 0 {
        return Ok(());
    }

    let (tx, rx) = channel::bounded(jobs);
    for idx in 0..jobs {
        tx.send(idx).map_err(|_| Error::internal("job queue closed while filling"))?;
    }
    drop(tx);

    let first_error: Mutex<Option<Error>> = Mutex::new(None);
    let workers = concurrency.clamp(1, jobs);

    thread::scope(|scope| {
        for _ in 0..workers {
            let rx = rx.clone();
            let job = &job;
            let first_error = &first_error;
            scope.spawn(move || {
                for idx in rx.iter() {
                    if let Err(e) = job(idx) {
                        let mut slot = first_error.lock();
                        if slot.is_none() {
                            *slot = Some(e);
                        }
                    }
                }
            });
        }
    });

    match first_error.into_inner() {
        Some(e) => Err(e),
        None => Ok(()),
    }
}
