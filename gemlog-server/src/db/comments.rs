use anyhow::Context;
use gemlog_api::{
    assemble_threads, Comment, CommentId, CommentThread, PostId, UserId, Uuid, DELETED_COMMENT,
    DELETED_REPLY,
};
use sqlx::{Connection, Row};

use super::{CommentRow, COMMENT_SELECT};
use crate::Error;

/// Visible top-level comments of a post, newest first, with replies expanded
/// down to `depth` levels
pub async fn fetch_threads(
    conn: &mut sqlx::PgConnection,
    post: PostId,
    depth: usize,
) -> anyhow::Result<Vec<CommentThread>> {
    let roots: Vec<Comment> = sqlx::query_as::<_, CommentRow>(&format!(
        "
            {COMMENT_SELECT}
            WHERE c.post_id = $1 AND c.parent_id IS NULL AND NOT c.is_deleted
            ORDER BY c.created_at DESC, c.seq DESC
        "
    ))
    .bind(post.0)
    .fetch_all(&mut *conn)
    .await
    .with_context(|| format!("fetching top-level comments of {:?}", post))?
    .into_iter()
    .map(Comment::from)
    .collect();

    let mut descendants = Vec::new();
    let mut frontier: Vec<Uuid> = roots.iter().map(|c| c.id.0).collect();
    for _ in 1..depth {
        if frontier.is_empty() {
            break;
        }
        let level: Vec<Comment> = sqlx::query_as::<_, CommentRow>(&format!(
            "
                {COMMENT_SELECT}
                WHERE c.parent_id = ANY($1) AND NOT c.is_deleted
                ORDER BY c.created_at, c.seq
            "
        ))
        .bind(&frontier)
        .fetch_all(&mut *conn)
        .await
        .with_context(|| format!("fetching a level of replies on {:?}", post))?
        .into_iter()
        .map(Comment::from)
        .collect();
        frontier = level.iter().map(|c| c.id.0).collect();
        descendants.extend(level);
    }

    Ok(assemble_threads(roots, descendants, depth))
}

/// Looks up a comment that has not been deleted
pub async fn fetch_comment(
    conn: &mut sqlx::PgConnection,
    comment: CommentId,
) -> anyhow::Result<Option<Comment>> {
    Ok(
        sqlx::query_as::<_, CommentRow>(&format!("{COMMENT_SELECT} WHERE c.id = $1"))
            .bind(comment.0)
            .fetch_optional(&mut *conn)
            .await
            .with_context(|| format!("fetching comment {:?}", comment))?
            .map(Comment::from)
            .filter(|c| !c.is_deleted),
    )
}

/// Visible direct replies of a comment, oldest first
pub async fn fetch_replies(
    conn: &mut sqlx::PgConnection,
    comment: CommentId,
) -> Result<Vec<Comment>, Error> {
    if fetch_comment(&mut *conn, comment).await?.is_none() {
        return Err(Error::comment_not_found());
    }
    Ok(sqlx::query_as::<_, CommentRow>(&format!(
        "
            {COMMENT_SELECT}
            WHERE c.parent_id = $1 AND NOT c.is_deleted
            ORDER BY c.created_at, c.seq
        "
    ))
    .bind(comment.0)
    .fetch_all(&mut *conn)
    .await
    .with_context(|| format!("fetching replies of {:?}", comment))?
    .into_iter()
    .map(Comment::from)
    .collect())
}

/// Creates a top-level comment, or a reply when `parent` is set
///
/// Replies always land on the post of their parent, whatever `post` says.
pub async fn create_comment(
    conn: &mut sqlx::PgConnection,
    author: UserId,
    post: Option<PostId>,
    parent: Option<CommentId>,
    content: &str,
) -> Result<Comment, Error> {
    let mut tx = conn.begin().await.context("starting transaction")?;
    let post = match parent {
        Some(parent) => {
            let row = sqlx::query(
                "SELECT post_id FROM comments WHERE id = $1 AND NOT is_deleted FOR SHARE",
            )
            .bind(parent.0)
            .fetch_optional(&mut *tx)
            .await
            .with_context(|| format!("locking parent comment {:?}", parent))?
            .ok_or_else(|| Error::not_found("Parent comment not found"))?;
            PostId(row.try_get("post_id").context("retrieving post_id field")?)
        }
        None => {
            let post = post.ok_or_else(|| Error::validation("Content and postId are required"))?;
            let exists = sqlx::query("SELECT 1 FROM posts WHERE id = $1 FOR SHARE")
                .bind(post.0)
                .fetch_optional(&mut *tx)
                .await
                .with_context(|| format!("locking post {:?}", post))?
                .is_some();
            if !exists {
                return Err(Error::post_not_found());
            }
            post
        }
    };

    let id = CommentId(Uuid::new_v4());
    sqlx::query(
        "INSERT INTO comments (id, post_id, owner_id, parent_id, content) VALUES ($1, $2, $3, $4, $5)",
    )
    .bind(id.0)
    .bind(post.0)
    .bind(author.0)
    .bind(parent.map(|p| p.0))
    .bind(content)
    .execute(&mut *tx)
    .await
    .with_context(|| format!("inserting comment {:?}", id))?;
    tx.commit().await.context("committing comment creation")?;

    fetch_comment(&mut *conn, id)
        .await?
        .ok_or_else(|| Error::Anyhow(anyhow::anyhow!("comment {:?} vanished after creation", id)))
}

/// Locks a visible comment and checks `user` wrote it
async fn lock_own_comment(
    conn: &mut sqlx::PgConnection,
    user: UserId,
    comment: CommentId,
    action: &str,
) -> Result<(), Error> {
    let row = sqlx::query("SELECT owner_id FROM comments WHERE id = $1 AND NOT is_deleted FOR UPDATE")
        .bind(comment.0)
        .fetch_optional(&mut *conn)
        .await
        .with_context(|| format!("locking comment {:?}", comment))?
        .ok_or_else(Error::comment_not_found)?;
    let owner = UserId(row.try_get("owner_id").context("retrieving owner_id field")?);
    if owner != user {
        tracing::info!(?user, ?comment, "refusing to {action} a comment of someone else");
        return Err(Error::forbidden(&format!(
            "Not authorized to {action} this comment"
        )));
    }
    Ok(())
}

pub async fn update_comment(
    conn: &mut sqlx::PgConnection,
    user: UserId,
    comment: CommentId,
    content: &str,
) -> Result<Comment, Error> {
    let mut tx = conn.begin().await.context("starting transaction")?;
    lock_own_comment(&mut *tx, user, comment, "update").await?;
    sqlx::query("UPDATE comments SET content = $2, updated_at = now() WHERE id = $1")
        .bind(comment.0)
        .bind(content)
        .execute(&mut *tx)
        .await
        .with_context(|| format!("updating comment {:?}", comment))?;
    tx.commit().await.context("committing comment update")?;
    tracing::debug!(?user, ?comment, "comment updated");

    fetch_comment(&mut *conn, comment)
        .await?
        .ok_or_else(|| {
            Error::Anyhow(anyhow::anyhow!("comment {:?} vanished after update", comment))
        })
}

/// Tombstones a comment along with its direct replies
///
/// Replies of replies are left untouched.
pub async fn delete_comment(
    conn: &mut sqlx::PgConnection,
    user: UserId,
    comment: CommentId,
) -> Result<(), Error> {
    let mut tx = conn.begin().await.context("starting transaction")?;
    lock_own_comment(&mut *tx, user, comment, "delete").await?;
    sqlx::query(
        "
            UPDATE comments SET
                is_deleted = true,
                deleted_at = now(),
                content = $2,
                updated_at = now()
            WHERE id = $1
        ",
    )
    .bind(comment.0)
    .bind(DELETED_COMMENT)
    .execute(&mut *tx)
    .await
    .with_context(|| format!("tombstoning comment {:?}", comment))?;
    let replies = sqlx::query(
        "
            UPDATE comments SET
                is_deleted = true,
                deleted_at = now(),
                content = $2,
                updated_at = now()
            WHERE parent_id = $1
        ",
    )
    .bind(comment.0)
    .bind(DELETED_REPLY)
    .execute(&mut *tx)
    .await
    .with_context(|| format!("tombstoning replies of comment {:?}", comment))?;
    tx.commit().await.context("committing comment deletion")?;
    tracing::debug!(
        ?user,
        ?comment,
        replies = replies.rows_affected(),
        "comment and direct replies deleted"
    );
    Ok(())
}
