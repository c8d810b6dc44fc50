use std::str::FromStr;

use crate::{validate_opt_string, validate_string, Error, Time, UserId, UserSummary, STUB_UUID};

use bolero::generator::TypeGenerator;
use uuid::Uuid;

/// Maximum number of images attached in a single create or update
pub const MAX_POST_IMAGES: usize = 5;

pub const DEFAULT_PAGE_LIMIT: i64 = 6;

#[derive(
    Clone, Copy, Debug, Eq, Hash, Ord, PartialEq, PartialOrd, serde::Deserialize, serde::Serialize,
)]
pub struct PostId(pub Uuid);

impl PostId {
    pub fn stub() -> PostId {
        PostId(STUB_UUID)
    }
}

/// A post with its owner populated and its top-level comment count
#[derive(Clone, Debug, Eq, PartialEq, serde::Deserialize, serde::Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Post {
    #[serde(rename = "_id")]
    pub id: PostId,
    pub title: String,
    pub content: String,
    #[serde(rename = "userId")]
    pub owner: UserSummary,
    pub images: Vec<String>,
    pub likes: Vec<UserId>,
    pub dislikes: Vec<UserId>,
    pub created_at: Time,
    pub updated_at: Time,
    pub comment_count: i64,
}

#[derive(Clone, Debug, Default, serde::Deserialize, serde::Serialize)]
pub struct NewPost {
    pub title: Option<String>,
    pub content: Option<String>,
}

impl NewPost {
    /// Returns the (title, content) pair once both are present
    pub fn validate(&self) -> Result<(&str, &str), Error> {
        match (self.title.as_deref(), self.content.as_deref()) {
            (Some(title), Some(content)) if !title.is_empty() && !content.is_empty() => {
                validate_string(title)?;
                validate_string(content)?;
                Ok((title, content))
            }
            _ => Err(Error::validation("Title and content are required")),
        }
    }
}

/// Partial update; absent fields are kept
#[derive(Clone, Debug, Default, serde::Deserialize, serde::Serialize)]
pub struct PostPatch {
    pub title: Option<String>,
    pub content: Option<String>,
}

impl PostPatch {
    pub fn validate(&self) -> Result<(), Error> {
        validate_opt_string(&self.title)?;
        validate_opt_string(&self.content)?;
        Ok(())
    }
}

#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum SortKey {
    CreatedAt,
    UpdatedAt,
    Title,
}

#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub struct Sort {
    pub key: SortKey,
    pub descending: bool,
}

impl Default for Sort {
    fn default() -> Sort {
        Sort {
            key: SortKey::CreatedAt,
            descending: true,
        }
    }
}

impl FromStr for Sort {
    type Err = Error;

    /// Accepts `field` or `-field`, the latter sorting in descending order
    fn from_str(s: &str) -> Result<Sort, Error> {
        let (descending, field) = match s.strip_prefix('-') {
            Some(field) => (true, field),
            None => (false, s),
        };
        let key = match field {
            "createdAt" => SortKey::CreatedAt,
            "updatedAt" => SortKey::UpdatedAt,
            "title" => SortKey::Title,
            _ => return Err(Error::validation("Invalid sort field")),
        };
        Ok(Sort { key, descending })
    }
}

/// Query string of the post listing
#[derive(Clone, Debug, Default, serde::Deserialize, serde::Serialize)]
pub struct PostQuery {
    pub search: Option<String>,
    pub sort: Option<String>,
    pub page: Option<i64>,
    pub limit: Option<i64>,
}

/// A validated `PostQuery`
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct Listing {
    pub search: Option<String>,
    pub sort: Sort,
    pub page: i64,
    pub limit: i64,
}

impl Listing {
    pub fn offset(&self) -> i64 {
        (self.page - 1).saturating_mul(self.limit)
    }

    pub fn total_pages(&self, total: i64) -> i64 {
        match total {
            0 => 0,
            total => (total - 1) / self.limit + 1,
        }
    }
}

impl PostQuery {
    pub fn resolve(&self) -> Result<Listing, Error> {
        let search = self.search.clone().filter(|s| !s.is_empty());
        validate_opt_string(&search)?;
        let sort = match self.sort.as_deref() {
            None | Some("") => Sort::default(),
            Some(s) => s.parse()?,
        };
        let page = self.page.unwrap_or(1);
        let limit = self.limit.unwrap_or(DEFAULT_PAGE_LIMIT);
        if page < 1 || limit < 1 {
            return Err(Error::validation("Invalid pagination parameters"));
        }
        Ok(Listing {
            search,
            sort,
            page,
            limit,
        })
    }
}

#[derive(Clone, Debug, Eq, PartialEq, serde::Deserialize, serde::Serialize)]
#[serde(rename_all = "camelCase")]
pub struct PostPage {
    pub posts: Vec<Post>,
    pub total_posts: i64,
    pub total_pages: i64,
    pub current_page: i64,
}

#[derive(Clone, Debug, Eq, PartialEq, serde::Deserialize, serde::Serialize)]
pub struct PostList {
    pub posts: Vec<Post>,
}

/// Index into a post's image list, as given in the url
pub fn parse_image_index(raw: &str, len: usize) -> Result<usize, Error> {
    match raw.parse::<usize>() {
        Ok(i) if i < len => Ok(i),
        _ => Err(Error::validation("Invalid image index")),
    }
}

#[derive(Clone, Copy, Debug, Eq, PartialEq, bolero::generator::TypeGenerator)]
pub enum Reaction {
    Like,
    Unlike,
    Dislike,
    Undislike,
}

impl Reaction {
    /// The reaction this change adds or removes: true for a like, false for a dislike
    pub fn liked(self) -> bool {
        matches!(self, Reaction::Like | Reaction::Unlike)
    }

    pub fn is_removal(self) -> bool {
        matches!(self, Reaction::Unlike | Reaction::Undislike)
    }

    pub fn success_message(self) -> &'static str {
        match self {
            Reaction::Like => "Post liked successfully",
            Reaction::Unlike => "Post unliked successfully",
            Reaction::Dislike => "Post disliked successfully",
            Reaction::Undislike => "Post undisliked successfully",
        }
    }

    /// Error for a change that would not alter the reaction sets
    pub fn redundant(self) -> Error {
        Error::conflict(match self {
            Reaction::Like => "Post already liked",
            Reaction::Unlike => "Post not liked",
            Reaction::Dislike => "Post already disliked",
            Reaction::Undislike => "Post not disliked",
        })
    }

    pub fn failure_message(self) -> &'static str {
        match self {
            Reaction::Like => "Failed to like post",
            Reaction::Unlike => "Failed to unlike post",
            Reaction::Dislike => "Failed to dislike post",
            Reaction::Undislike => "Failed to undislike post",
        }
    }

    /// Applies this change to the reaction currently stored for a user
    ///
    /// `current` is `Some(true)` for a like, `Some(false)` for a dislike.
    /// Returns the reaction to store afterwards.
    pub fn apply(self, current: Option<bool>) -> Result<Option<bool>, Error> {
        let target = self.liked();
        match (self.is_removal(), current) {
            (false, Some(c)) if c == target => Err(self.redundant()),
            (false, _) => Ok(Some(target)),
            (true, Some(c)) if c == target => Ok(None),
            (true, _) => Err(self.redundant()),
        }
    }
}
