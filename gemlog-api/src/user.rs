use crate::{validate_opt_string, validate_string, Error, Time, STUB_UUID};

use uuid::Uuid;

pub const USERNAME_MIN_LEN: usize = 3;
pub const USERNAME_MAX_LEN: usize = 30;
pub const PASSWORD_MIN_LEN: usize = 6;

/// Maximum number of hits returned by a username search
pub const SEARCH_RESULTS_LIMIT: i64 = 10;

#[derive(
    Clone, Copy, Debug, Eq, Hash, Ord, PartialEq, PartialOrd, serde::Deserialize, serde::Serialize,
)]
pub struct UserId(pub Uuid);

impl UserId {
    pub fn stub() -> UserId {
        UserId(STUB_UUID)
    }
}

/// Registration form
#[derive(Clone, Debug, Default, serde::Deserialize, serde::Serialize)]
pub struct NewUser {
    #[serde(default)]
    pub email: String,
    #[serde(default)]
    pub username: String,
    #[serde(default)]
    pub password: String,
}

impl NewUser {
    pub fn validate(&self) -> Result<(), Error> {
        if self.email.is_empty() || self.username.is_empty() || self.password.is_empty() {
            return Err(Error::validation(
                "Email, username and password are required",
            ));
        }
        validate_string(&self.email)?;
        validate_string(&self.username)?;
        validate_string(&self.password)?;
        if self.password.chars().count() < PASSWORD_MIN_LEN {
            return Err(Error::validation(
                "Password must be at least 6 characters",
            ));
        }
        let len = self.username.chars().count();
        if len < USERNAME_MIN_LEN || len > USERNAME_MAX_LEN {
            return Err(Error::validation(
                "Username must be between 3 and 30 characters",
            ));
        }
        Ok(())
    }
}

/// Login form
#[derive(Clone, Debug, Default, serde::Deserialize, serde::Serialize)]
pub struct Credentials {
    #[serde(default)]
    pub email: String,
    #[serde(default)]
    pub password: String,
}

impl Credentials {
    pub fn validate(&self) -> Result<(), Error> {
        if self.email.is_empty() || self.password.is_empty() {
            return Err(Error::validation("Email and password are required"));
        }
        validate_string(&self.email)?;
        validate_string(&self.password)?;
        Ok(())
    }
}

/// The public projection of a user, as embedded in posts, comments and follow lists
#[derive(Clone, Debug, Eq, PartialEq, serde::Deserialize, serde::Serialize)]
#[serde(rename_all = "camelCase")]
pub struct UserSummary {
    #[serde(rename = "_id")]
    pub id: UserId,
    pub email: String,
    pub username: String,
    pub profile_picture: Option<String>,
}

#[derive(Clone, Debug, Eq, PartialEq, serde::Deserialize, serde::Serialize)]
pub struct RegisteredUser {
    #[serde(rename = "_id")]
    pub id: UserId,
    pub email: String,
    pub username: String,
}

#[derive(Clone, Debug, Eq, PartialEq, serde::Deserialize, serde::Serialize)]
pub struct Registered {
    pub message: String,
    pub user: RegisteredUser,
}

#[derive(Clone, Debug, Eq, PartialEq, serde::Deserialize, serde::Serialize)]
pub struct Session {
    pub token: crate::AuthToken,
    pub user: UserSummary,
}

/// A user with its follow edges expanded; never carries the password hash
#[derive(Clone, Debug, Eq, PartialEq, serde::Deserialize, serde::Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Profile {
    #[serde(flatten)]
    pub user: UserSummary,
    pub followers: Vec<UserSummary>,
    pub following: Vec<UserSummary>,
    pub created_at: Time,
    pub updated_at: Time,
}

#[derive(Clone, Debug, Default, serde::Deserialize, serde::Serialize)]
pub struct ProfileUpdate {
    pub username: Option<String>,
    pub email: Option<String>,
}

impl ProfileUpdate {
    pub fn validate(&self) -> Result<(), Error> {
        validate_opt_string(&self.username)?;
        validate_opt_string(&self.email)?;
        Ok(())
    }

    /// Empty strings leave the field untouched
    pub fn username(&self) -> Option<&str> {
        self.username.as_deref().filter(|u| !u.is_empty())
    }

    pub fn email(&self) -> Option<&str> {
        self.email.as_deref().filter(|e| !e.is_empty())
    }
}

#[derive(Clone, Debug, Eq, PartialEq, serde::Deserialize, serde::Serialize)]
pub struct ProfileUpdated {
    pub message: String,
    pub user: UserSummary,
}

#[derive(Clone, Debug, Eq, PartialEq, serde::Deserialize, serde::Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ProfilePicture {
    pub message: String,
    pub profile_picture: String,
}

#[derive(Clone, Debug, Default, serde::Deserialize, serde::Serialize)]
pub struct UserSearch {
    pub q: Option<String>,
}

impl UserSearch {
    /// The trimmed needle, or the validation error to return
    pub fn needle(&self) -> Result<&str, Error> {
        let q = self.q.as_deref().map(str::trim).unwrap_or("");
        if q.is_empty() {
            return Err(Error::validation("Search query is required"));
        }
        validate_string(q)?;
        Ok(q)
    }
}

#[derive(Clone, Debug, Eq, PartialEq, serde::Deserialize, serde::Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SearchHit {
    #[serde(flatten)]
    pub user: UserSummary,
    pub is_following: bool,
}

#[derive(Clone, Debug, Eq, PartialEq, serde::Deserialize, serde::Serialize)]
pub struct Followers {
    pub followers: Vec<UserSummary>,
}

#[derive(Clone, Debug, Eq, PartialEq, serde::Deserialize, serde::Serialize)]
pub struct Following {
    pub following: Vec<UserSummary>,
}
