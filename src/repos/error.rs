/**
 * Responsibility
 * - meaning the repos hand to the layers above (conflict vs. db failure)
 * - retryable / non-retryable split for sqlx errors
 */
use thiserror::Error;

use crate::services::connection::ConnectionError;

#[derive(Debug, Error)]
pub enum RepoError {
    #[error("db error: {0}")]
    Db(#[from] sqlx::Error),
    #[error("conflict")]
    Conflict,
}

pub type RepoResult<T> = Result<T, RepoError>;

impl RepoError {
    pub fn from_sqlx(e: sqlx::Error) -> Self {
        // 23505: postgres unique_violation, 2067/1555: sqlite UNIQUE/PRIMARY KEY constraint
        if let sqlx::Error::Database(dbe) = &e
            && matches!(dbe.code().as_deref(), Some("23505" | "2067" | "1555"))
        {
            return RepoError::Conflict;
        }
        RepoError::Db(e)
    }

    /// Connectivity problems are worth retrying; schema, constraint and decode errors are not.
    pub fn is_retryable(&self) -> bool {
        match self {
            RepoError::Db(sqlx::Error::Database(dbe)) => {
                dbe.code().as_deref().is_some_and(is_transient_sqlstate)
            }
            RepoError::Db(e) => matches!(
                e,
                sqlx::Error::Io(_)
                    | sqlx::Error::Tls(_)
                    | sqlx::Error::Protocol(_)
                    | sqlx::Error::PoolTimedOut
                    | sqlx::Error::PoolClosed
                    | sqlx::Error::WorkerCrashed
            ),
            RepoError::Conflict => false,
        }
    }
}

// SQLSTATE classes 08 (connection exception), 53 (insufficient resources) and
// 57P (admin shutdown, crash shutdown, cannot connect now).
fn is_transient_sqlstate(code: &str) -> bool {
    code.starts_with("08") || code.starts_with("53") || code.starts_with("57P")
}

impl From<RepoError> for ConnectionError {
    fn from(e: RepoError) -> Self {
        ConnectionError::Backend {
            retryable: e.is_retryable(),
            message: e.to_string(),
        }
    }
}
