//! Load-balancing batch scheduler.
//!
//! The instance range is split into one contiguous share per backend, in
//! proportion to the backend weights, and each share into batches of at most
//! `single_batch_length` instances. Backends run concurrently; the batches of
//! one backend run in order on that backend's worker thread.

use anyhow::{anyhow, Result};
use parafit_ir::{EngineError, Program};
use parafit_kernels::{BatchOutput, BoundCall, DynBackend};
use std::ops::Range;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread;
use tracing::{debug, info};

/// Coarse cancellation flag, checked between batches.
#[derive(Debug, Clone, Default)]
pub struct CancellationToken(Arc<AtomicBool>);

impl CancellationToken {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cancel(&self) {
        self.0.store(true, Ordering::SeqCst);
    }

    pub fn is_cancelled(&self) -> bool {
        self.0.load(Ordering::SeqCst)
    }
}

/// Splits `[0, instances)` into per-backend batch lists.
///
/// Share boundaries are the rounded cumulative weight fractions, so the shares
/// partition the range without gaps or overlap. A zero-length share gets no
/// batches.
pub fn partition(
    instances: usize,
    weights: &[f64],
    single_batch_length: Option<usize>,
) -> Vec<Vec<Range<usize>>> {
    let total: f64 = weights.iter().sum();
    let mut shares = Vec::with_capacity(weights.len());
    let mut start = 0;
    let mut cumulative = 0.0;
    for (index, weight) in weights.iter().enumerate() {
        cumulative += weight;
        let end = if index + 1 == weights.len() || total <= 0.0 {
            instances
        } else {
            ((instances as f64 * cumulative / total).round() as usize).clamp(start, instances)
        };
        shares.push(start..end);
        start = end;
    }

    shares
        .into_iter()
        .map(|share| split_batches(share, single_batch_length))
        .collect()
}

fn split_batches(share: Range<usize>, single_batch_length: Option<usize>) -> Vec<Range<usize>> {
    if share.is_empty() {
        return Vec::new();
    }
    let step = single_batch_length.unwrap_or(share.len()).max(1);
    (share.start..share.end)
        .step_by(step)
        .map(|start| start..(start + step).min(share.end))
        .collect()
}

pub struct LoadBalancer {
    weights: Vec<f64>,
    single_batch_length: Option<usize>,
}

impl LoadBalancer {
    pub fn new(weights: Vec<f64>, single_batch_length: Option<usize>) -> Self {
        Self {
            weights,
            single_batch_length,
        }
    }

    /// Runs every batch of `call` and returns the outputs of all of them.
    ///
    /// The first failing batch aborts the call: remaining batches are not
    /// started and the failure is returned as `EngineError::Dispatch`.
    pub fn run(
        &self,
        backends: &[DynBackend],
        program: &Program,
        call: &BoundCall,
        cancel: &CancellationToken,
    ) -> Result<Vec<BatchOutput>> {
        let plan = partition(call.instances(), &self.weights, self.single_batch_length);
        info!(
            routine = program.name(),
            instances = call.instances(),
            backends = backends.len(),
            batches = plan.iter().map(Vec::len).sum::<usize>(),
            "dispatching routine"
        );

        let abort = AtomicBool::new(false);
        let abort = &abort;
        let outcomes: Vec<Result<Vec<BatchOutput>>> = thread::scope(|scope| {
            let workers: Vec<_> = backends
                .iter()
                .zip(plan)
                .filter(|(_, batches)| !batches.is_empty())
                .map(|(backend, batches)| {
                    let name = backend.name().to_string();
                    let span = batches
                        .first()
                        .zip(batches.last())
                        .map(|(first, last)| first.start..last.end)
                        .unwrap_or_default();
                    let handle = scope.spawn(move || {
                        run_backend(backend, program, call, batches, abort, cancel)
                    });
                    (name, span, handle)
                })
                .collect();

            workers
                .into_iter()
                .map(|(name, span, handle)| {
                    handle.join().unwrap_or_else(|_| {
                        abort.store(true, Ordering::SeqCst);
                        Err(EngineError::Dispatch {
                            backend: name,
                            start: span.start,
                            end: span.end,
                            source: anyhow!("backend worker panicked"),
                        }
                        .into())
                    })
                })
                .collect()
        });

        let mut outputs = Vec::new();
        let mut failure = None;
        for outcome in outcomes {
            match outcome {
                Ok(batches) => outputs.extend(batches),
                Err(err) => {
                    // A dispatch failure outranks the cancellations it caused.
                    let replaces = match (&failure, parafit_ir::engine_error(&err)) {
                        (None, _) => true,
                        (Some(existing), Some(EngineError::Dispatch { .. })) => matches!(
                            parafit_ir::engine_error(existing),
                            Some(EngineError::Cancelled)
                        ),
                        _ => false,
                    };
                    if replaces {
                        failure = Some(err);
                    }
                }
            }
        }
        match failure {
            Some(err) => Err(err),
            None => Ok(outputs),
        }
    }
}

fn run_backend(
    backend: &DynBackend,
    program: &Program,
    call: &BoundCall,
    batches: Vec<Range<usize>>,
    abort: &AtomicBool,
    cancel: &CancellationToken,
) -> Result<Vec<BatchOutput>> {
    let mut outputs = Vec::with_capacity(batches.len());
    for range in batches {
        if abort.load(Ordering::SeqCst) {
            break;
        }
        if cancel.is_cancelled() {
            abort.store(true, Ordering::SeqCst);
            return Err(EngineError::Cancelled.into());
        }

        debug!(
            backend = backend.name(),
            start = range.start,
            end = range.end,
            "running batch"
        );
        match backend.run_batch(program, call, range.clone()) {
            Ok(output) => outputs.push(output),
            Err(source) => {
                abort.store(true, Ordering::SeqCst);
                return Err(EngineError::Dispatch {
                    backend: backend.name().to_string(),
                    start: range.start,
                    end: range.end,
                    source,
                }
                .into());
            }
        }
    }
    Ok(outputs)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn flatten(plan: &[Vec<Range<usize>>]) -> Vec<Range<usize>> {
        plan.iter().flatten().cloned().collect()
    }

    #[test]
    fn equal_weights_split_evenly() {
        let plan = partition(10, &[1.0, 1.0], None);
        assert_eq!(plan, vec![vec![0..5], vec![5..10]]);
    }

    #[test]
    fn batch_cap_splits_each_share() {
        let plan = partition(10, &[1.0], Some(4));
        assert_eq!(plan, vec![vec![0..4, 4..8, 8..10]]);
        let plan = partition(5, &[1.0], Some(1));
        assert_eq!(flatten(&plan), vec![0..1, 1..2, 2..3, 3..4, 4..5]);
    }

    #[test]
    fn weighted_shares_cover_range_without_gaps() {
        let plan = partition(1000, &[3.0, 1.0, 0.5], Some(100));
        let batches = flatten(&plan);
        let mut next = 0;
        for batch in &batches {
            assert_eq!(batch.start, next);
            assert!(batch.len() <= 100);
            next = batch.end;
        }
        assert_eq!(next, 1000);
        assert_eq!(plan[0].first().map(|b| b.start), Some(0));
        assert_eq!(plan[1].first().map(|b| b.start), Some(667));
    }

    #[test]
    fn tiny_ranges_leave_some_backends_idle() {
        let plan = partition(1, &[1.0, 1.0, 1.0], None);
        assert_eq!(flatten(&plan), vec![0..1]);
        assert!(partition(0, &[1.0, 2.0], Some(3)).iter().all(Vec::is_empty));
    }

    #[test]
    fn cancellation_is_shared_between_clones() {
        let token = CancellationToken::new();
        let clone = token.clone();
        assert!(!token.is_cancelled());
        clone.cancel();
        assert!(token.is_cancelled());
    }
}
