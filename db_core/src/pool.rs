//! Worker pool for the embarrassingly parallel stages (contigs, windows, clusters)
//!
//! Jobs are queued on a bounded channel shared by the worker threads.  Each worker
//! takes the next job, processes it and sends back (job index, result); the caller
//! reassembles the results in job order.  Workers exit when the job channel is
//! closed and drained.

use std::thread;

use crossbeam_channel::{bounded, unbounded};

use crate::{CoreError, Result};

pub fn parallel_map<T, R, F>(jobs: Vec<T>, n_threads: usize, f: F) -> Result<Vec<R>>
where
    T: Send,
    R: Send,
    F: Fn(T) -> Result<R> + Sync,
{
    let n_jobs = jobs.len();
    let nt = n_threads.max(1).min(n_jobs);
    if nt <= 1 {
        return jobs.into_iter().map(f).collect();
    }
    trace!("Distributing {} jobs over {} threads", n_jobs, nt);

    let f = &f;
    let mut res: Vec<Option<R>> = (0..n_jobs).map(|_| None).collect();

    thread::scope(|sc| {
        let (send_job, recv_job) = bounded::<(usize, T)>(nt * 4);
        let (send_res, recv_res) = unbounded::<(usize, Result<R>)>();

        let handles: Vec<_> = (0..nt)
            .map(|ix| {
                let r = recv_job.clone();
                let s = send_res.clone();
                sc.spawn(move || {
                    trace!("Worker {} starting up", ix);
                    while let Ok((i, job)) = r.recv() {
                        if s.send((i, f(job))).is_err() {
                            break;
                        }
                    }
                    trace!("Worker {} closing down", ix);
                })
            })
            .collect();

        // Only the workers should hold these now
        drop(recv_job);
        drop(send_res);

        for (i, job) in jobs.into_iter().enumerate() {
            if send_job.send((i, job)).is_err() {
                break;
            }
        }
        drop(send_job);

        let mut err = None;
        for (i, r) in recv_res.iter() {
            match r {
                Ok(x) => res[i] = Some(x),
                Err(e) => {
                    err.get_or_insert(e);
                }
            }
        }
        for h in handles {
            if h.join().is_err() {
                err.get_or_insert(CoreError::Worker("Worker thread panicked".to_string()));
            }
        }
        err.map_or(Ok(()), Err)
    })?;

    res.into_iter()
        .enumerate()
        .map(|(i, r)| {
            r.ok_or_else(|| CoreError::Worker(format!("No result returned for job {}", i)))
        })
        .collect()
}
