/// Observer for reporting incremental progress while permutation jobs run.
///
/// Workers call `on_advance` concurrently, so implementations take `&self` and
/// must be `Sync`. `completed` is monotonic but calls may arrive out of order.
pub trait PermutationProgress: Sync {
    fn on_start(&self, total_jobs: usize) {
        let _ = total_jobs;
    }
    fn on_advance(&self, completed: usize) {
        let _ = completed;
    }
    fn on_finish(&self) {}
}

#[derive(Default)]
pub struct NoopPermutationProgress;

impl PermutationProgress for NoopPermutationProgress {}
