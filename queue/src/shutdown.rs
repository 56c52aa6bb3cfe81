use std::sync::Arc;

use crate::{DurableExecution, Queue, error::QueueError};

type WorkerJoin = tokio::task::JoinHandle<Result<(), QueueError>>;

/// A running worker loop for one queue.
pub struct WorkerHandle<H: DurableExecution> {
    pub join_handle: WorkerJoin,
    pub shutdown_tx: tokio::sync::oneshot::Sender<()>,
    pub queue: Arc<Queue<H>>,
}

impl<H: DurableExecution> WorkerHandle<H> {
    /// Stops polling and waits for in-flight jobs to finish.
    pub async fn shutdown(self) -> Result<(), QueueError> {
        let queue = self.queue.name().to_string();
        tracing::info!(queue, "Shutting down worker");

        if self.shutdown_tx.send(()).is_err() {
            tracing::warn!(queue, "Worker was already shutting down");
        }

        match self.join_handle.await {
            Ok(Ok(())) => {
                tracing::info!(queue, "Worker shut down gracefully");
                Ok(())
            }
            Ok(Err(e)) => {
                tracing::error!(queue, error = ?e, "Worker shut down with error");
                Err(e)
            }
            Err(e) => {
                tracing::error!(queue, error = ?e, "Worker task panicked during shutdown");
                Err(QueueError::WorkerPanic {
                    message: e.to_string(),
                })
            }
        }
    }
}

/// Coordinates shutdown of every worker the process started.
#[derive(Default)]
pub struct ShutdownHandle {
    join_handles: Vec<(String, WorkerJoin)>,
    shutdown_txs: Vec<tokio::sync::oneshot::Sender<()>>,
}

impl ShutdownHandle {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add_worker<H: DurableExecution>(&mut self, worker: WorkerHandle<H>) {
        self.join_handles
            .push((worker.queue.name().to_string(), worker.join_handle));
        self.shutdown_txs.push(worker.shutdown_tx);
    }

    pub fn and_worker<H: DurableExecution>(mut self, worker: WorkerHandle<H>) -> Self {
        self.add_worker(worker);
        self
    }

    pub fn worker_count(&self) -> usize {
        self.join_handles.len()
    }

    /// Signals every worker first, then waits for all of them. Returns the first error seen.
    pub async fn shutdown(self) -> Result<(), QueueError> {
        let worker_count = self.join_handles.len();
        tracing::info!(worker_count, "Shutting down workers");

        for shutdown_tx in self.shutdown_txs {
            if shutdown_tx.send(()).is_err() {
                tracing::warn!("A worker was already shutting down");
            }
        }

        let (names, handles): (Vec<_>, Vec<_>) = self.join_handles.into_iter().unzip();
        let results = futures::future::join_all(handles).await;

        let mut first_error = None;
        let mut error_count = 0usize;
        for (queue, result) in names.iter().zip(results) {
            let error = match result {
                Ok(Ok(())) => {
                    tracing::debug!(queue, "Worker shut down gracefully");
                    continue;
                }
                Ok(Err(e)) => e,
                Err(e) => QueueError::WorkerPanic {
                    message: e.to_string(),
                },
            };
            tracing::error!(queue, error = ?error, "Worker shut down with error");
            error_count += 1;
            first_error.get_or_insert(error);
        }

        match first_error {
            None => {
                tracing::info!(worker_count, "All workers shut down gracefully");
                Ok(())
            }
            Some(error) => {
                tracing::error!(error_count, "Some workers failed to shut down cleanly");
                Err(error)
            }
        }
    }
}
