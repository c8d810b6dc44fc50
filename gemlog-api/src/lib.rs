use chrono::Utc;

mod auth;
mod comment;
mod error;
mod post;
mod user;

pub use auth::*;
pub use comment::*;
pub use error::*;
pub use post::*;
pub use user::*;

pub use uuid::{uuid, Uuid};
pub type Time = chrono::DateTime<Utc>;

pub const STUB_UUID: Uuid = uuid!("ffffffff-ffff-ffff-ffff-ffffffffffff");

/// Path prefix under which uploaded files are served
pub const UPLOADS_PREFIX: &str = "/uploads";

/// Body of every response that carries no entity
#[derive(Clone, Debug, Eq, PartialEq, serde::Deserialize, serde::Serialize)]
pub struct Message {
    pub message: String,
}

impl Message {
    pub fn new(message: impl Into<String>) -> Message {
        Message {
            message: message.into(),
        }
    }
}

/// Postgres refuses null bytes in text columns, so reject them before they reach the db
pub fn validate_string(s: &str) -> Result<(), Error> {
    match s.contains('\0') {
        true => Err(Error::Validation(String::from(
            "Null bytes are not allowed in strings",
        ))),
        false => Ok(()),
    }
}

pub(crate) fn validate_opt_string(s: &Option<String>) -> Result<(), Error> {
    s.as_deref().map(validate_string).transpose().map(|_| ())
}
