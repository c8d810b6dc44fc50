use gemlog_api::{
    Comment, CommentId, Post, PostId, Time, UserId, UserSummary, Uuid,
};

mod comments;
mod posts;
mod users;

pub use comments::*;
pub use posts::*;
pub use users::*;

/// Whether a query failed on a unique constraint, ie. lost a race against a concurrent insert
fn is_unique_violation(err: &sqlx::Error) -> bool {
    match err {
        sqlx::Error::Database(e) => e.code().as_deref() == Some("23505"),
        _ => false,
    }
}

const USER_COLUMNS: &str = "u.id, u.email, u.username, u.profile_picture";

#[derive(sqlx::FromRow)]
struct UserRow {
    id: Uuid,
    email: String,
    username: String,
    profile_picture: Option<String>,
}

impl From<UserRow> for UserSummary {
    fn from(u: UserRow) -> UserSummary {
        UserSummary {
            id: UserId(u.id),
            email: u.email,
            username: u.username,
            profile_picture: u.profile_picture,
        }
    }
}

/// Assumes table p (posts) is available
const POST_SELECT: &str = "
    SELECT
        p.id, p.title, p.content, p.images, p.created_at, p.updated_at,
        u.id AS owner_id,
        u.email AS owner_email,
        u.username AS owner_username,
        u.profile_picture AS owner_profile_picture,
        ARRAY(
            SELECT r.user_id FROM post_reactions r
            WHERE r.post_id = p.id AND r.liked
            ORDER BY r.seq
        ) AS likes,
        ARRAY(
            SELECT r.user_id FROM post_reactions r
            WHERE r.post_id = p.id AND NOT r.liked
            ORDER BY r.seq
        ) AS dislikes,
        (
            SELECT COUNT(*) FROM comments c
            WHERE c.post_id = p.id AND c.parent_id IS NULL AND NOT c.is_deleted
        ) AS comment_count
    FROM posts p
    INNER JOIN users u
        ON u.id = p.owner_id
";

#[derive(sqlx::FromRow)]
struct PostRow {
    id: Uuid,
    title: String,
    content: String,
    images: Vec<String>,
    created_at: Time,
    updated_at: Time,
    owner_id: Uuid,
    owner_email: String,
    owner_username: String,
    owner_profile_picture: Option<String>,
    likes: Vec<Uuid>,
    dislikes: Vec<Uuid>,
    comment_count: i64,
}

impl From<PostRow> for Post {
    fn from(p: PostRow) -> Post {
        Post {
            id: PostId(p.id),
            title: p.title,
            content: p.content,
            owner: UserSummary {
                id: UserId(p.owner_id),
                email: p.owner_email,
                username: p.owner_username,
                profile_picture: p.owner_profile_picture,
            },
            images: p.images,
            likes: p.likes.into_iter().map(UserId).collect(),
            dislikes: p.dislikes.into_iter().map(UserId).collect(),
            created_at: p.created_at,
            updated_at: p.updated_at,
            comment_count: p.comment_count,
        }
    }
}

/// Assumes table c (comments) is available
const COMMENT_SELECT: &str = "
    SELECT
        c.id, c.post_id, c.parent_id, c.content, c.is_deleted, c.deleted_at,
        c.created_at, c.updated_at,
        u.id AS author_id,
        u.email AS author_email,
        u.username AS author_username,
        u.profile_picture AS author_profile_picture
    FROM comments c
    INNER JOIN users u
        ON u.id = c.owner_id
";

#[derive(sqlx::FromRow)]
struct CommentRow {
    id: Uuid,
    post_id: Uuid,
    parent_id: Option<Uuid>,
    content: String,
    is_deleted: bool,
    deleted_at: Option<Time>,
    created_at: Time,
    updated_at: Time,
    author_id: Uuid,
    author_email: String,
    author_username: String,
    author_profile_picture: Option<String>,
}

impl From<CommentRow> for Comment {
    fn from(c: CommentRow) -> Comment {
        Comment {
            id: CommentId(c.id),
            post_id: PostId(c.post_id),
            author: UserSummary {
                id: UserId(c.author_id),
                email: c.author_email,
                username: c.author_username,
                profile_picture: c.author_profile_picture,
            },
            content: c.content,
            parent_comment_id: c.parent_id.map(CommentId),
            is_deleted: c.is_deleted,
            deleted_at: c.deleted_at,
            created_at: c.created_at,
            updated_at: c.updated_at,
        }
    }
}
