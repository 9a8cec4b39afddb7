use thiserror::Error;

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),

    #[error("migration error: {0}")]
    Migrate(#[from] sqlx::migrate::MigrateError),

    #[error("row decode error: {message}")]
    Decode { message: String },

    /// A write that must always succeed affected zero rows. The database
    /// has been mutated by something other than this engine; an operator
    /// must investigate before the affected key can make progress.
    #[error("invariant violation: {message}")]
    InvariantViolation { message: String },

    #[error("validation error: {message}")]
    Validation { message: String },
}
