use std::collections::HashMap;

use crate::{validate_string, Error, PostId, Time, UserSummary};

use uuid::Uuid;

/// Content written over a comment deleted by its author
pub const DELETED_COMMENT: &str = "[This comment has been deleted]";

/// Content written over the direct replies of a deleted comment
pub const DELETED_REPLY: &str = "[This reply has been deleted]";

/// Levels returned by a thread read, counting the top level
pub const DEFAULT_THREAD_DEPTH: usize = 4;

#[derive(
    Clone, Copy, Debug, Eq, Hash, Ord, PartialEq, PartialOrd, serde::Deserialize, serde::Serialize,
)]
pub struct CommentId(pub Uuid);

#[derive(Clone, Debug, Eq, PartialEq, serde::Deserialize, serde::Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Comment {
    #[serde(rename = "_id")]
    pub id: CommentId,
    pub post_id: PostId,
    #[serde(rename = "userId")]
    pub author: UserSummary,
    pub content: String,
    pub parent_comment_id: Option<CommentId>,
    pub is_deleted: bool,
    pub deleted_at: Option<Time>,
    pub created_at: Time,
    pub updated_at: Time,
}

/// A comment with its visible replies expanded
#[derive(Clone, Debug, Eq, PartialEq, serde::Deserialize, serde::Serialize)]
pub struct CommentThread {
    #[serde(flatten)]
    pub comment: Comment,
    pub replies: Vec<CommentThread>,
}

/// Body of `POST /comments`
#[derive(Clone, Debug, Default, serde::Deserialize, serde::Serialize)]
#[serde(rename_all = "camelCase")]
pub struct NewComment {
    pub post_id: Option<PostId>,
    #[serde(default)]
    pub content: String,
    pub parent_comment_id: Option<CommentId>,
}

impl NewComment {
    /// Returns the post id and trimmed content
    pub fn validate(&self) -> Result<(PostId, &str), Error> {
        let post = match self.post_id {
            Some(post) if !self.content.is_empty() => post,
            _ => return Err(Error::validation("Content and postId are required")),
        };
        let content = trimmed_content(&self.content, "Comment content cannot be empty")?;
        Ok((post, content))
    }
}

/// Body of `POST /comments/:id/reply`
#[derive(Clone, Debug, Default, serde::Deserialize, serde::Serialize)]
pub struct NewReply {
    #[serde(default)]
    pub content: String,
}

impl NewReply {
    pub fn validate(&self) -> Result<&str, Error> {
        trimmed_content(&self.content, "Reply content cannot be empty")
    }
}

/// Body of `PUT /comments/:id`
#[derive(Clone, Debug, Default, serde::Deserialize, serde::Serialize)]
pub struct CommentEdit {
    #[serde(default)]
    pub content: String,
}

impl CommentEdit {
    pub fn validate(&self) -> Result<&str, Error> {
        trimmed_content(&self.content, "Comment content cannot be empty")
    }
}

fn trimmed_content<'a>(content: &'a str, empty_msg: &str) -> Result<&'a str, Error> {
    let content = content.trim();
    if content.is_empty() {
        return Err(Error::validation(empty_msg));
    }
    validate_string(content)?;
    Ok(content)
}

/// Builds comment threads out of a fetched forest
///
/// `roots` are returned in the given order. `descendants` holds every
/// comment reachable from the roots within `depth` levels; children are
/// attached under their parent in the order they appear in `descendants`.
/// Anything deeper than `depth` levels (roots being level 1) is dropped.
pub fn assemble_threads(
    roots: Vec<Comment>,
    descendants: Vec<Comment>,
    depth: usize,
) -> Vec<CommentThread> {
    let mut children: HashMap<CommentId, Vec<Comment>> = HashMap::new();
    for c in descendants {
        if let Some(parent) = c.parent_comment_id {
            children.entry(parent).or_default().push(c);
        }
    }
    roots
        .into_iter()
        .map(|c| build_thread(c, &mut children, depth.saturating_sub(1)))
        .collect()
}

fn build_thread(
    comment: Comment,
    children: &mut HashMap<CommentId, Vec<Comment>>,
    levels_left: usize,
) -> CommentThread {
    let replies = match levels_left {
        0 => Vec::new(),
        _ => children
            .remove(&comment.id)
            .unwrap_or_default()
            .into_iter()
            .map(|c| build_thread(c, children, levels_left - 1))
            .collect(),
    };
    CommentThread { comment, replies }
}
