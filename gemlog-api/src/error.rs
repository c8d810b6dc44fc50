use anyhow::{anyhow, Context};
use serde_json::json;

#[derive(Debug, Eq, PartialEq, thiserror::Error)]
pub enum Error {
    #[error("{message}: {error}")]
    Unknown { message: String, error: String },

    #[error("{0}")]
    Validation(String),

    #[error("{0}")]
    Conflict(String),

    #[error("Invalid email or password")]
    InvalidCredentials,

    #[error("{0}")]
    Unauthenticated(String),

    #[error("{0}")]
    Forbidden(String),

    #[error("{0}")]
    NotFound(String),
}

impl Error {
    pub fn validation(msg: &str) -> Error {
        Error::Validation(String::from(msg))
    }

    pub fn conflict(msg: &str) -> Error {
        Error::Conflict(String::from(msg))
    }

    pub fn unauthenticated(msg: &str) -> Error {
        Error::Unauthenticated(String::from(msg))
    }

    pub fn forbidden(msg: &str) -> Error {
        Error::Forbidden(String::from(msg))
    }

    pub fn not_found(msg: &str) -> Error {
        Error::NotFound(String::from(msg))
    }

    pub fn user_not_found() -> Error {
        Error::not_found("User not found")
    }

    pub fn post_not_found() -> Error {
        Error::not_found("Post not found")
    }

    pub fn comment_not_found() -> Error {
        Error::not_found("Comment not found")
    }

    pub fn status_code(&self) -> http::StatusCode {
        use http::StatusCode;
        match self {
            Error::Unknown { .. } => StatusCode::INTERNAL_SERVER_ERROR,
            Error::Validation(_) => StatusCode::BAD_REQUEST,
            Error::Conflict(_) => StatusCode::BAD_REQUEST,
            Error::InvalidCredentials => StatusCode::UNAUTHORIZED,
            Error::Unauthenticated(_) => StatusCode::UNAUTHORIZED,
            Error::Forbidden(_) => StatusCode::FORBIDDEN,
            Error::NotFound(_) => StatusCode::NOT_FOUND,
        }
    }

    pub fn contents(&self) -> Vec<u8> {
        serde_json::to_vec(&match self {
            Error::Unknown { message, error } => json!({
                "message": message,
                "type": "unknown",
                "error": error,
            }),
            Error::Validation(msg) => json!({
                "message": msg,
                "type": "validation",
            }),
            Error::Conflict(msg) => json!({
                "message": msg,
                "type": "conflict",
            }),
            Error::InvalidCredentials => json!({
                "message": "Invalid email or password",
                "type": "invalid-credentials",
            }),
            Error::Unauthenticated(msg) => json!({
                "message": msg,
                "type": "unauthenticated",
            }),
            Error::Forbidden(msg) => json!({
                "message": msg,
                "type": "forbidden",
            }),
            Error::NotFound(msg) => json!({
                "message": msg,
                "type": "not-found",
            }),
        })
        .expect("serializing error")
    }

    pub fn parse(body: &[u8]) -> anyhow::Result<Error> {
        let data: serde_json::Value =
            serde_json::from_slice(body).context("parsing error contents")?;
        let message = || -> anyhow::Result<String> {
            Ok(String::from(
                data.get("message")
                    .and_then(|msg| msg.as_str())
                    .ok_or_else(|| anyhow!("error message is not a string"))?,
            ))
        };
        Ok(
            match data
                .get("type")
                .and_then(|t| t.as_str())
                .ok_or_else(|| anyhow!("error type is not a string"))?
            {
                "unknown" => Error::Unknown {
                    message: message().unwrap_or_default(),
                    error: String::from(
                        data.get("error").and_then(|e| e.as_str()).unwrap_or(""),
                    ),
                },
                "validation" => Error::Validation(message()?),
                "conflict" => Error::Conflict(message()?),
                "invalid-credentials" => Error::InvalidCredentials,
                "unauthenticated" => Error::Unauthenticated(message()?),
                "forbidden" => Error::Forbidden(message()?),
                "not-found" => Error::NotFound(message()?),
                _ => return Err(anyhow!("error contents has unknown type")),
            },
        )
    }
}
