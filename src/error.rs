use tracing::error;

#[derive(Debug)]
pub struct AppError(pub &'static str);

impl std::fmt::Display for AppError {
    fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl std::error::Error for AppError {}

/// Failures of the call-session store, distinguished because webhook handlers
/// react differently to each: a missing session ends the call with a spoken
/// apology, while an unavailable store answers with a safe re-gather fallback.
#[derive(Debug)]
pub enum StoreError {
    NotFound,
    Unavailable(sqlx::Error),
}

impl StoreError {
    pub fn unavailable(e: sqlx::Error) -> Self {
        error!(error=%e, "session store unavailable");
        StoreError::Unavailable(e)
    }
}

impl std::fmt::Display for StoreError {
    fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
        match self {
            StoreError::NotFound => write!(f, "call session not found"),
            StoreError::Unavailable(e) => write!(f, "session store unavailable: {e}"),
        }
    }
}

impl std::error::Error for StoreError {}
