#[derive(thiserror::Error, Debug)]
pub enum QueueError {
    #[error("Redis error: {0}")]
    RedisError(#[from] redis::RedisError),

    #[error("JSON serialization error: {0}")]
    JsonError(#[from] serde_json::Error),

    #[error("Runtime error: {message}")]
    Runtime { message: String },

    #[error("Worker panic: {message}")]
    WorkerPanic { message: String },
}
