use axum::extract::rejection::{JsonRejection, PathRejection, QueryRejection};
use gemlog_api::Error as ApiError;

#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error(transparent)]
    Anyhow(#[from] anyhow::Error),

    #[error(transparent)]
    Api(#[from] ApiError),
}

impl Error {
    pub fn validation(msg: &str) -> Error {
        Error::Api(ApiError::validation(msg))
    }

    pub fn conflict(msg: &str) -> Error {
        Error::Api(ApiError::conflict(msg))
    }

    pub fn forbidden(msg: &str) -> Error {
        Error::Api(ApiError::forbidden(msg))
    }

    pub fn unauthenticated(msg: &str) -> Error {
        Error::Api(ApiError::unauthenticated(msg))
    }

    pub fn not_found(msg: &str) -> Error {
        Error::Api(ApiError::not_found(msg))
    }

    pub fn invalid_credentials() -> Error {
        Error::Api(ApiError::InvalidCredentials)
    }

    pub fn user_not_found() -> Error {
        Error::Api(ApiError::user_not_found())
    }

    pub fn post_not_found() -> Error {
        Error::Api(ApiError::post_not_found())
    }

    pub fn comment_not_found() -> Error {
        Error::Api(ApiError::comment_not_found())
    }

    /// Names the failed operation, for internal failures only
    pub fn describe(self, operation: &'static str) -> Error {
        match self {
            Error::Anyhow(err) => Error::Anyhow(err.context(operation)),
            Error::Api(err) => Error::Api(err),
        }
    }
}

pub trait Describe<T> {
    fn describe(self, operation: &'static str) -> Result<T, Error>;
}

impl<T, E: Into<Error>> Describe<T> for Result<T, E> {
    fn describe(self, operation: &'static str) -> Result<T, Error> {
        self.map_err(|e| e.into().describe(operation))
    }
}

impl From<sqlx::Error> for Error {
    fn from(err: sqlx::Error) -> Error {
        Error::Anyhow(err.into())
    }
}

impl From<JsonRejection> for Error {
    fn from(err: JsonRejection) -> Error {
        Error::Api(ApiError::Validation(err.body_text()))
    }
}

impl From<PathRejection> for Error {
    fn from(err: PathRejection) -> Error {
        Error::Api(ApiError::Validation(err.body_text()))
    }
}

impl From<QueryRejection> for Error {
    fn from(err: QueryRejection) -> Error {
        Error::Api(ApiError::Validation(err.body_text()))
    }
}

impl axum::response::IntoResponse for Error {
    fn into_response(self) -> axum::response::Response {
        let err = match self {
            Error::Anyhow(err) => {
                tracing::error!(?err, "internal server error");
                ApiError::Unknown {
                    message: err.to_string(),
                    error: err.root_cause().to_string(),
                }
            }
            Error::Api(err) => {
                tracing::info!("returning error to client: {err}");
                err
            }
        };
        (
            err.status_code(),
            [(axum::http::header::CONTENT_TYPE, "application/json")],
            err.contents(),
        )
            .into_response()
    }
}
