use anyhow::Context;
use gemlog_api::{
    parse_image_index, Listing, Post, PostId, PostPage, PostPatch, Reaction, UserId, Uuid,
};
use sqlx::{Connection, Row};

use super::{PostRow, POST_SELECT};
use crate::{
    query::{self, Bind},
    Error,
};

pub async fn list_posts(conn: &mut sqlx::PgConnection, l: &Listing) -> anyhow::Result<PostPage> {
    let sql = query::to_postgres(l, 3);

    let posts_sql = format!(
        "{POST_SELECT} WHERE {} ORDER BY {} LIMIT $1 OFFSET $2",
        sql.where_clause, sql.order_clause
    );
    let mut posts_query = sqlx::query_as::<_, PostRow>(&posts_sql)
        .bind(l.limit)
        .bind(l.offset());
    for b in &sql.binds {
        posts_query = match b {
            Bind::String(s) => posts_query.bind(s.clone()),
        };
    }
    let posts = posts_query
        .fetch_all(&mut *conn)
        .await
        .context("querying posts page")?
        .into_iter()
        .map(Post::from)
        .collect();

    let sql = query::to_postgres(l, 1);
    let count_sql = format!(
        "SELECT COUNT(*) AS total FROM posts p WHERE {}",
        sql.where_clause
    );
    let mut count_query = sqlx::query(&count_sql);
    for b in &sql.binds {
        count_query = match b {
            Bind::String(s) => count_query.bind(s.clone()),
        };
    }
    let total_posts: i64 = count_query
        .fetch_one(&mut *conn)
        .await
        .context("counting posts")?
        .try_get("total")
        .context("retrieving total field")?;

    Ok(PostPage {
        posts,
        total_posts,
        total_pages: l.total_pages(total_posts),
        current_page: l.page,
    })
}

pub async fn posts_by_owner(
    conn: &mut sqlx::PgConnection,
    owner: UserId,
) -> anyhow::Result<Vec<Post>> {
    Ok(sqlx::query_as::<_, PostRow>(&format!(
        "{POST_SELECT} WHERE p.owner_id = $1 ORDER BY p.created_at DESC, p.seq DESC"
    ))
    .bind(owner.0)
    .fetch_all(&mut *conn)
    .await
    .with_context(|| format!("fetching posts of {:?}", owner))?
    .into_iter()
    .map(Post::from)
    .collect())
}

pub async fn fetch_post(conn: &mut sqlx::PgConnection, post: PostId) -> Result<Post, Error> {
    Ok(
        sqlx::query_as::<_, PostRow>(&format!("{POST_SELECT} WHERE p.id = $1"))
            .bind(post.0)
            .fetch_optional(&mut *conn)
            .await
            .with_context(|| format!("fetching post {:?}", post))?
            .ok_or_else(Error::post_not_found)?
            .into(),
    )
}

pub async fn create_post(
    conn: &mut sqlx::PgConnection,
    owner: UserId,
    title: &str,
    content: &str,
    images: &[String],
) -> Result<Post, Error> {
    let id = PostId(Uuid::new_v4());
    sqlx::query(
        "INSERT INTO posts (id, owner_id, title, content, images) VALUES ($1, $2, $3, $4, $5)",
    )
    .bind(id.0)
    .bind(owner.0)
    .bind(title)
    .bind(content)
    .bind(images)
    .execute(&mut *conn)
    .await
    .with_context(|| format!("inserting post {:?}", id))?;
    fetch_post(&mut *conn, id).await
}

struct LockedPost {
    owner: UserId,
    images: Vec<String>,
}

/// Locks a post for the rest of the transaction, checking it exists
async fn lock_post(conn: &mut sqlx::PgConnection, post: PostId) -> Result<LockedPost, Error> {
    let row = sqlx::query("SELECT owner_id, images FROM posts WHERE id = $1 FOR UPDATE")
        .bind(post.0)
        .fetch_optional(&mut *conn)
        .await
        .with_context(|| format!("locking post {:?}", post))?
        .ok_or_else(Error::post_not_found)?;
    Ok(LockedPost {
        owner: UserId(row.try_get("owner_id").context("retrieving owner_id field")?),
        images: row.try_get("images").context("retrieving images field")?,
    })
}

pub async fn update_post(
    conn: &mut sqlx::PgConnection,
    user: UserId,
    post: PostId,
    patch: &PostPatch,
    new_images: &[String],
) -> Result<Post, Error> {
    let mut tx = conn.begin().await.context("starting transaction")?;
    if lock_post(&mut *tx, post).await?.owner != user {
        return Err(Error::forbidden(
            "You don't have permission to update this post",
        ));
    }
    sqlx::query(
        "
            UPDATE posts SET
                title = COALESCE($2, title),
                content = COALESCE($3, content),
                images = images || $4,
                updated_at = now()
            WHERE id = $1
        ",
    )
    .bind(post.0)
    .bind(&patch.title)
    .bind(&patch.content)
    .bind(new_images)
    .execute(&mut *tx)
    .await
    .with_context(|| format!("updating post {:?}", post))?;
    tx.commit().await.context("committing post update")?;
    fetch_post(&mut *conn, post).await
}

/// Deletes a post with all its comments and reactions, returning its images
pub async fn delete_post(
    conn: &mut sqlx::PgConnection,
    user: UserId,
    post: PostId,
) -> Result<Vec<String>, Error> {
    let mut tx = conn.begin().await.context("starting transaction")?;
    let locked = lock_post(&mut *tx, post).await?;
    if locked.owner != user {
        return Err(Error::forbidden(
            "You don't have permission to delete this post",
        ));
    }
    sqlx::query("DELETE FROM comments WHERE post_id = $1")
        .bind(post.0)
        .execute(&mut *tx)
        .await
        .with_context(|| format!("deleting comments of post {:?}", post))?;
    sqlx::query("DELETE FROM posts WHERE id = $1")
        .bind(post.0)
        .execute(&mut *tx)
        .await
        .with_context(|| format!("deleting post {:?}", post))?;
    tx.commit().await.context("committing post deletion")?;
    Ok(locked.images)
}

/// Removes one image from a post, returning its reference
pub async fn delete_post_image(
    conn: &mut sqlx::PgConnection,
    user: UserId,
    post: PostId,
    index: &str,
) -> Result<String, Error> {
    let mut tx = conn.begin().await.context("starting transaction")?;
    let mut locked = lock_post(&mut *tx, post).await?;
    if locked.owner != user {
        return Err(Error::forbidden(
            "You don't have permission to delete this image",
        ));
    }
    let index = parse_image_index(index, locked.images.len())?;
    let removed = locked.images.remove(index);
    sqlx::query("UPDATE posts SET images = $2, updated_at = now() WHERE id = $1")
        .bind(post.0)
        .bind(&locked.images)
        .execute(&mut *tx)
        .await
        .with_context(|| format!("removing image {index} of post {:?}", post))?;
    tx.commit().await.context("committing image removal")?;
    Ok(removed)
}

pub async fn react(
    conn: &mut sqlx::PgConnection,
    user: UserId,
    post: PostId,
    reaction: Reaction,
) -> Result<(), Error> {
    let mut tx = conn.begin().await.context("starting transaction")?;
    let exists = sqlx::query("SELECT 1 FROM posts WHERE id = $1 FOR SHARE")
        .bind(post.0)
        .fetch_optional(&mut *tx)
        .await
        .with_context(|| format!("locking post {:?}", post))?
        .is_some();
    if !exists {
        return Err(Error::post_not_found());
    }
    let current: Option<bool> = sqlx::query(
        "SELECT liked FROM post_reactions WHERE post_id = $1 AND user_id = $2 FOR UPDATE",
    )
    .bind(post.0)
    .bind(user.0)
    .fetch_optional(&mut *tx)
    .await
    .context("fetching current reaction")?
    .map(|row| row.try_get("liked"))
    .transpose()
    .context("retrieving liked field")?;

    let target = reaction.apply(current)?;

    // removing then inserting moves the user to the end of the target list
    sqlx::query("DELETE FROM post_reactions WHERE post_id = $1 AND user_id = $2")
        .bind(post.0)
        .bind(user.0)
        .execute(&mut *tx)
        .await
        .context("removing previous reaction")?;
    if let Some(liked) = target {
        sqlx::query("INSERT INTO post_reactions (post_id, user_id, liked) VALUES ($1, $2, $3)")
            .bind(post.0)
            .bind(user.0)
            .bind(liked)
            .execute(&mut *tx)
            .await
            .context("recording reaction")?;
    }
    tx.commit().await.context("committing reaction")?;
    tracing::debug!(?user, ?post, ?reaction, "reaction recorded");
    Ok(())
}
