use diesel::result::{DatabaseErrorKind, Error as DieselError};

/// The only error kinds a storage authority operation surfaces. Raw store
/// errors never escape; they are logged and folded into one of these.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("not found: {0}")]
    NotFound(String),
    #[error("conflict: {0}")]
    Conflict(String),
    #[error("invalid request: {0}")]
    InvalidRequest(String),
    #[error("storage failure: {0}")]
    Storage(String),
}

pub type Result<T> = std::result::Result<T, Error>;

impl Error {
    pub fn not_found(what: impl Into<String>) -> Self {
        Error::NotFound(what.into())
    }

    pub fn conflict(what: impl Into<String>) -> Self {
        Error::Conflict(what.into())
    }

    pub fn invalid(what: impl Into<String>) -> Self {
        Error::InvalidRequest(what.into())
    }

    pub fn is_not_found(&self) -> bool {
        matches!(self, Error::NotFound(_))
    }

    pub fn is_conflict(&self) -> bool {
        matches!(self, Error::Conflict(_))
    }

    pub fn is_invalid_request(&self) -> bool {
        matches!(self, Error::InvalidRequest(_))
    }
}

impl From<DieselError> for Error {
    fn from(e: DieselError) -> Self {
        match e {
            DieselError::NotFound => Error::NotFound("no matching row".to_string()),
            DieselError::DatabaseError(DatabaseErrorKind::UniqueViolation, info) => {
                Error::Conflict(info.message().to_string())
            }
            e => {
                warn!("Failed to execute DB query: {}", e);
                Error::Storage(e.to_string())
            }
        }
    }
}

impl From<openssl::error::ErrorStack> for Error {
    fn from(e: openssl::error::ErrorStack) -> Self {
        Error::InvalidRequest(format!("unable to process certificate: {}", e))
    }
}

/// Maps a query result onto the error taxonomy, turning diesel's "no rows"
/// into a `NotFound` naming what was looked up.
pub(crate) fn handle_db_result<O>(res: diesel::QueryResult<O>, what: &str) -> Result<O> {
    match res {
        Ok(res) => Ok(res),
        Err(DieselError::NotFound) => Err(Error::not_found(what)),
        Err(e) => Err(e.into()),
    }
}
