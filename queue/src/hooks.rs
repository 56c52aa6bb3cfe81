/// Handed to lifecycle hooks. Commands added to the pipeline are committed in the
/// same MULTI/EXEC as the job's own state change, and only if the job still holds its lease.
pub struct TransactionContext<'a> {
    pipeline: &'a mut redis::Pipeline,
    queue_name: String,
}

impl<'a> TransactionContext<'a> {
    pub fn new(pipeline: &'a mut redis::Pipeline, queue_name: String) -> Self {
        Self {
            pipeline,
            queue_name,
        }
    }

    pub fn pipeline(&mut self) -> &mut redis::Pipeline {
        self.pipeline
    }

    pub fn queue_name(&self) -> &str {
        &self.queue_name
    }
}
