//! Concurrent lowering of independent basic blocks.
//!
//! Workers share nothing mutable: each owns its `Lowerer` clone, and every
//! block gets a fresh flag tracker inside `lower_block`. The opcode tables
//! are `'static` and read-only.

use crossbeam::channel;
use tracing::{debug, error};

use crate::config::TargetDescriptor;
use crate::error::{LowerError, Result};
use crate::ir::{Instruction, LoweredBlock};
use crate::lower::Lowerer;

/// Lowers `blocks` on up to `workers` threads. Results keep input order.
pub fn lower_blocks(
    target: &TargetDescriptor,
    blocks: &[Vec<Instruction>],
    workers: usize,
) -> Result<Vec<Result<LoweredBlock>>> {
    let lowerer = Lowerer::new(target.clone())?;
    let workers = workers.clamp(1, blocks.len().max(1));
    debug!("lowering {} blocks on {} workers", blocks.len(), workers);

    let (job_tx, job_rx) = channel::unbounded::<usize>();
    let (done_tx, done_rx) = channel::unbounded::<(usize, Result<LoweredBlock>)>();
    for i in 0..blocks.len() {
        // receiver is alive until the scope below ends
        let _ = job_tx.send(i);
    }
    drop(job_tx);

    let scope = crossbeam::thread::scope(|s| {
        for worker in 0..workers {
            let jobs = job_rx.clone();
            let done = done_tx.clone();
            let lowerer = lowerer.clone();
            s.spawn(move |_| {
                for i in jobs.iter() {
                    let result = lowerer.lower_block(&blocks[i]);
                    if let Err(e) = &result {
                        debug!("worker {}: block {} failed: {}", worker, i, e);
                    }
                    if done.send((i, result)).is_err() {
                        break;
                    }
                }
            });
        }
    });
    drop(done_tx);

    if let Err(panic) = scope {
        let msg = panic
            .downcast_ref::<&str>()
            .map(|s| s.to_string())
            .or_else(|| panic.downcast_ref::<String>().cloned())
            .unwrap_or_else(|| "unknown panic".to_string());
        error!("lowering worker panicked: {}", msg);
        return Err(LowerError::WorkerPanicked(msg));
    }

    let mut results: Vec<Option<Result<LoweredBlock>>> = (0..blocks.len()).map(|_| None).collect();
    for (i, result) in done_rx.iter() {
        results[i] = Some(result);
    }
    results
        .into_iter()
        .enumerate()
        .map(|(i, r)| {
            r.ok_or_else(|| LowerError::WorkerPanicked(format!("block {} was never lowered", i)))
        })
        .collect()
}
