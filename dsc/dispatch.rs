// ========================================================================================
//
//                           THE PARALLEL JOB DISPATCHER
//
// ========================================================================================
//
// A fixed pool of scoped OS threads drains a shared job counter. Each claimed job
// runs one permutation trial and writes its results straight into the slice of the
// output buffers that belongs to its index. The counter is the only shared mutable
// state; the output regions are disjoint by construction, so writes take no lock.

use crate::decompose::{DecomposeError, GeneSlotOrder, GeneSlots, check_layout};
use crate::matrix::ExpressionMatrix;
use crate::permute::PermutationWorker;
use crate::progress::PermutationProgress;
use crate::types::{BatchLayout, GlobalStatistic, PermutationJob};
use log::{debug, info};
use std::marker::PhantomData;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::thread;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum DispatchError {
    #[error("At least one worker thread is required.")]
    NoWorkers,

    #[error("Invalid batch assignment for this matrix: {0}")]
    Layout(#[from] DecomposeError),

    #[error("{permutations} permutations × {genes} genes do not fit in memory.")]
    OutputTooLarge { permutations: usize, genes: usize },

    #[error(
        "Output buffers are shaped for {} permutations × {} genes, but the run needs {} × {}.",
        .found_permutations,
        .found_genes,
        .expected_permutations,
        .expected_genes
    )]
    OutputShape {
        expected_permutations: usize,
        expected_genes: usize,
        found_permutations: usize,
        found_genes: usize,
    },

    #[error("Failed to spawn a permutation worker thread: {0}")]
    Spawn(#[from] std::io::Error),

    #[error("Permutation worker '{0}' panicked.")]
    WorkerPanicked(String),
}

/// How a permutation run is executed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DispatchPlan {
    pub permutations: usize,
    pub threads: usize,
    pub gene_slot_order: GeneSlotOrder,
}

/// Hands out every index in `[0, total)` exactly once across all workers.
#[derive(Debug)]
pub struct JobCounter {
    next: AtomicUsize,
    total: usize,
}

impl JobCounter {
    pub fn new(total: usize) -> Self {
        Self {
            next: AtomicUsize::new(0),
            total,
        }
    }

    /// Claims the next job, or `None` once the counter is exhausted. Claims past
    /// the end only overshoot the counter and are never turned into jobs.
    #[inline]
    pub fn claim(&self) -> Option<PermutationJob> {
        let index = self.next.fetch_add(1, Ordering::Relaxed);
        (index < self.total).then(|| PermutationJob::new(index))
    }

    #[inline]
    pub fn total(&self) -> usize {
        self.total
    }
}

/// Null-distribution buffers for a permutation run. Global arrays hold one entry
/// per permutation; per-gene arrays hold `gene_count` entries per permutation,
/// permutation `j` owning `[j * gene_count, (j + 1) * gene_count)`. Every slot
/// starts as NaN.
#[derive(Debug, Clone, PartialEq)]
pub struct PermutationOutputs {
    pub(crate) permutations: usize,
    pub(crate) genes: usize,
    pub(crate) gene_dsc: Vec<f64>,
    pub(crate) gene_db: Vec<f64>,
    pub(crate) gene_dw: Vec<f64>,
    pub(crate) dsc: Vec<f64>,
    pub(crate) db: Vec<f64>,
    pub(crate) dw: Vec<f64>,
}

impl PermutationOutputs {
    pub fn new(permutations: usize, genes: usize) -> Result<Self, DispatchError> {
        let per_gene = permutations
            .checked_mul(genes)
            .ok_or(DispatchError::OutputTooLarge {
                permutations,
                genes,
            })?;
        Ok(Self {
            permutations,
            genes,
            gene_dsc: vec![f64::NAN; per_gene],
            gene_db: vec![f64::NAN; per_gene],
            gene_dw: vec![f64::NAN; per_gene],
            dsc: vec![f64::NAN; permutations],
            db: vec![f64::NAN; permutations],
            dw: vec![f64::NAN; permutations],
        })
    }

    #[inline]
    pub fn permutations(&self) -> usize {
        self.permutations
    }

    #[inline]
    pub fn gene_count(&self) -> usize {
        self.genes
    }

    pub fn global(&self, permutation: usize) -> GlobalStatistic {
        GlobalStatistic {
            dsc: self.dsc[permutation],
            db: self.db[permutation],
            dw: self.dw[permutation],
        }
    }

    pub fn global_dsc(&self) -> &[f64] {
        &self.dsc
    }

    pub fn global_db(&self) -> &[f64] {
        &self.db
    }

    pub fn global_dw(&self) -> &[f64] {
        &self.dw
    }

    /// Per-gene DSC for every permutation, flat.
    pub fn gene_dsc(&self) -> &[f64] {
        &self.gene_dsc
    }

    pub fn gene_db(&self) -> &[f64] {
        &self.gene_db
    }

    pub fn gene_dw(&self) -> &[f64] {
        &self.gene_dw
    }

    /// Per-gene `(dsc, db, dw)` slices written by one permutation.
    pub fn gene_block(&self, permutation: usize) -> (&[f64], &[f64], &[f64]) {
        let range = permutation * self.genes..(permutation + 1) * self.genes;
        (
            &self.gene_dsc[range.clone()],
            &self.gene_db[range.clone()],
            &self.gene_dw[range],
        )
    }
}

/// Destination for one job's global triple.
pub struct GlobalSlot<'a> {
    dsc: &'a mut f64,
    db: &'a mut f64,
    dw: &'a mut f64,
}

impl GlobalSlot<'_> {
    #[inline]
    pub fn write(self, statistic: GlobalStatistic) {
        *self.dsc = statistic.dsc;
        *self.db = statistic.db;
        *self.dw = statistic.dw;
    }
}

/// Every output region owned by one job.
pub struct JobSlots<'a> {
    pub genes: GeneSlots<'a>,
    pub global: GlobalSlot<'a>,
}

/// Shared writer over `PermutationOutputs` that hands each job its own region.
///
/// Soundness rests on `PermutationJob`: jobs are minted only by `JobCounter`, each
/// index at most once, and a job is consumed when its slots are claimed. Two
/// live `JobSlots` therefore never cover the same index, and the regions of
/// distinct indices do not overlap.
struct DisjointOutputs<'a> {
    permutations: usize,
    genes: usize,
    gene_dsc: *mut f64,
    gene_db: *mut f64,
    gene_dw: *mut f64,
    dsc: *mut f64,
    db: *mut f64,
    dw: *mut f64,
    _marker: PhantomData<&'a mut PermutationOutputs>,
}

unsafe impl Send for DisjointOutputs<'_> {}
unsafe impl Sync for DisjointOutputs<'_> {}

impl<'a> DisjointOutputs<'a> {
    fn new(outputs: &'a mut PermutationOutputs) -> Self {
        Self {
            permutations: outputs.permutations,
            genes: outputs.genes,
            gene_dsc: outputs.gene_dsc.as_mut_ptr(),
            gene_db: outputs.gene_db.as_mut_ptr(),
            gene_dw: outputs.gene_dw.as_mut_ptr(),
            dsc: outputs.dsc.as_mut_ptr(),
            db: outputs.db.as_mut_ptr(),
            dw: outputs.dw.as_mut_ptr(),
            _marker: PhantomData,
        }
    }

    fn claim_slots(&self, job: PermutationJob) -> JobSlots<'_> {
        let index = job.index();
        assert!(index < self.permutations, "job {index} is outside the output buffers");
        let base = index * self.genes;

        // The buffers outlive `self` through the `'a` borrow, and the job token
        // guarantees no other live slice covers this index.
        unsafe {
            JobSlots {
                genes: GeneSlots {
                    dsc: std::slice::from_raw_parts_mut(self.gene_dsc.add(base), self.genes),
                    db: std::slice::from_raw_parts_mut(self.gene_db.add(base), self.genes),
                    dw: std::slice::from_raw_parts_mut(self.gene_dw.add(base), self.genes),
                },
                global: GlobalSlot {
                    dsc: &mut *self.dsc.add(index),
                    db: &mut *self.db.add(index),
                    dw: &mut *self.dw.add(index),
                },
            }
        }
    }
}

/// Shared, read-only context handed to every worker thread.
struct WorkerContext<'a> {
    source: &'a ExpressionMatrix,
    layout: &'a BatchLayout,
    order: GeneSlotOrder,
    counter: &'a JobCounter,
    writer: &'a DisjointOutputs<'a>,
    completed: &'a AtomicUsize,
    progress: &'a dyn PermutationProgress,
}

fn run_worker(name: &str, context: &WorkerContext<'_>) -> Result<(), DecomposeError> {
    let mut worker = PermutationWorker::new(context.source, context.layout, context.order)?;

    while let Some(job) = context.counter.claim() {
        if job.index() % 100 == 0 {
            debug!("{name}: starting permutation {}", job.index());
        }
        let seed = job.seed();
        let slots = context.writer.claim_slots(job);
        let global = worker.run(seed, slots.genes);
        slots.global.write(global);

        let done = context.completed.fetch_add(1, Ordering::Relaxed) + 1;
        context.progress.on_advance(done);
    }
    Ok(())
}

fn check_preconditions(
    source: &ExpressionMatrix,
    layout: &BatchLayout,
    plan: &DispatchPlan,
    outputs: &PermutationOutputs,
) -> Result<(), DispatchError> {
    if plan.threads == 0 {
        return Err(DispatchError::NoWorkers);
    }
    check_layout(source.view(), layout)?;
    if outputs.permutations() != plan.permutations || outputs.gene_count() != source.gene_count()
    {
        return Err(DispatchError::OutputShape {
            expected_permutations: plan.permutations,
            expected_genes: source.gene_count(),
            found_permutations: outputs.permutations(),
            found_genes: outputs.gene_count(),
        });
    }
    Ok(())
}

/// Runs `plan.permutations` trials on `plan.threads` workers, filling `outputs`
/// in place. Returns once every worker has been joined.
pub fn dispatch(
    source: &ExpressionMatrix,
    layout: &BatchLayout,
    plan: &DispatchPlan,
    outputs: &mut PermutationOutputs,
    progress: &dyn PermutationProgress,
) -> Result<(), DispatchError> {
    check_preconditions(source, layout, plan, outputs)?;
    if plan.permutations == 0 {
        return Ok(());
    }

    info!(
        "Dispatching {} permutations of a {} × {} matrix across {} worker threads.",
        plan.permutations,
        source.gene_count(),
        source.sample_count(),
        plan.threads
    );

    let counter = JobCounter::new(plan.permutations);
    let completed = AtomicUsize::new(0);
    let writer = DisjointOutputs::new(outputs);
    let context = WorkerContext {
        source,
        layout,
        order: plan.gene_slot_order,
        counter: &counter,
        writer: &writer,
        completed: &completed,
        progress,
    };

    progress.on_start(counter.total());
    let outcome = thread::scope(|scope| {
        let mut handles = Vec::with_capacity(plan.threads);
        let mut spawn_error = None;

        for n in 0..plan.threads {
            let name = format!("dsc-perm-{n}");
            let context = &context;
            let spawned = thread::Builder::new()
                .name(name.clone())
                .spawn_scoped(scope, move || run_worker(&name, context));
            match spawned {
                Ok(handle) => handles.push(handle),
                Err(e) => {
                    spawn_error = Some(e);
                    break;
                }
            }
        }

        // Join everything before reporting, so no worker outlives the call.
        let mut failure = None;
        for handle in handles {
            let name = handle.thread().name().unwrap_or("dsc-perm").to_owned();
            let joined = match handle.join() {
                Ok(result) => result.map_err(DispatchError::from),
                Err(_) => Err(DispatchError::WorkerPanicked(name)),
            };
            if let Err(e) = joined {
                failure.get_or_insert(e);
            }
        }

        match (spawn_error, failure) {
            (Some(e), _) => Err(DispatchError::Spawn(e)),
            (None, Some(e)) => Err(e),
            (None, None) => Ok(()),
        }
    });
    progress.on_finish();
    outcome?;

    info!(
        "Completed {} permutations.",
        completed.load(Ordering::Relaxed)
    );
    Ok(())
}

/// Allocates NaN-filled outputs and dispatches into them.
pub fn run_permutations(
    source: &ExpressionMatrix,
    layout: &BatchLayout,
    plan: &DispatchPlan,
    progress: &dyn PermutationProgress,
) -> Result<PermutationOutputs, DispatchError> {
    let mut outputs = PermutationOutputs::new(plan.permutations, source.gene_count())?;
    dispatch(source, layout, plan, &mut outputs, progress)?;
    Ok(outputs)
}
