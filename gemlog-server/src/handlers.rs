use anyhow::Context;
use axum::{extract::State, http::StatusCode, Json};
use chrono::Utc;
use gemlog_api::{
    hash_password, verify_password, Comment, CommentEdit, CommentId, CommentThread, Credentials,
    Followers, Following, Message, NewComment, NewPost, NewReply, NewUser, Post, PostId, PostList,
    PostPage, PostPatch, PostQuery, Profile, ProfilePicture, ProfileUpdate, ProfileUpdated,
    Reaction, Registered, SearchHit, Session, UserId, UserSearch,
};

use crate::{
    config::Config,
    db,
    error::Describe,
    extractors::*,
    mailer::Mailer,
    uploads::Uploads,
    Error,
};

pub async fn banner() -> &'static str {
    "GemLog API is running"
}

async fn hash_blocking(password: String, cost: u32) -> Result<String, Error> {
    Ok(
        tokio::task::spawn_blocking(move || hash_password(&password, cost))
            .await
            .context("joining password hashing task")??,
    )
}

async fn verify_blocking(password: String, hash: String) -> Result<bool, Error> {
    Ok(
        tokio::task::spawn_blocking(move || verify_password(&password, &hash))
            .await
            .context("joining password verification task")?,
    )
}

/// Best-effort removal of files no row refers to anymore
async fn discard_uploads(uploads: &Uploads, references: &[String]) {
    if let Err(err) = uploads.remove_all(references).await {
        tracing::warn!(?err, ?references, "failed removing unused uploads");
    }
}

pub async fn register(
    State(config): State<Config>,
    State(mailer): State<Mailer>,
    mut conn: PgConn,
    ApiJson(data): ApiJson<NewUser>,
) -> Result<(StatusCode, Json<Registered>), Error> {
    data.validate()?;
    let hash = hash_blocking(data.password, config.bcrypt_cost)
        .await
        .describe("Failed to register user")?;
    let user = db::create_user(&mut *conn, &data.email, &data.username, &hash)
        .await
        .describe("Failed to register user")?;
    tracing::info!(user = ?user.id, "registered new user");
    mailer.send_welcome(user.email.clone(), user.username.clone());
    Ok((
        StatusCode::CREATED,
        Json(Registered {
            message: String::from("User registered successfully"),
            user,
        }),
    ))
}

pub async fn login(
    State(config): State<Config>,
    mut conn: PgConn,
    ApiJson(data): ApiJson<Credentials>,
) -> Result<Json<Session>, Error> {
    data.validate()?;
    let (user, hash) = db::fetch_credentials(&mut *conn, &data.email)
        .await
        .describe("Failed to login")?
        .ok_or_else(Error::invalid_credentials)?;
    if !verify_blocking(data.password, hash)
        .await
        .describe("Failed to login")?
    {
        tracing::info!(user = ?user.id, "refusing login with a wrong password");
        return Err(Error::invalid_credentials());
    }
    let token = config
        .session_key
        .issue(user.id, Utc::now())
        .describe("Failed to login")?;
    Ok(Json(Session { token, user }))
}

pub async fn own_profile(Auth(user): Auth, mut conn: PgConn) -> Result<Json<Profile>, Error> {
    Ok(Json(
        db::fetch_profile(&mut *conn, user)
            .await
            .describe("Failed to get profile")?,
    ))
}

pub async fn update_profile(
    Auth(user): Auth,
    mut conn: PgConn,
    ApiJson(data): ApiJson<ProfileUpdate>,
) -> Result<Json<ProfileUpdated>, Error> {
    data.validate()?;
    let user = db::update_profile(&mut *conn, user, &data)
        .await
        .describe("Failed to update profile")?;
    Ok(Json(ProfileUpdated {
        message: String::from("Profile updated successfully"),
        user,
    }))
}

pub async fn upload_profile_picture(
    Auth(user): Auth,
    State(uploads): State<Uploads>,
    mut conn: PgConn,
    PictureUpload(picture): PictureUpload,
) -> Result<Json<ProfilePicture>, Error> {
    let picture = picture.ok_or_else(|| Error::validation("No file uploaded"))?;
    match db::set_profile_picture(&mut *conn, user, &picture).await {
        Ok(previous) => {
            if let Some(previous) = previous {
                discard_uploads(&uploads, &[previous]).await;
            }
            Ok(Json(ProfilePicture {
                message: String::from("Profile picture uploaded successfully"),
                profile_picture: picture,
            }))
        }
        Err(e) => {
            discard_uploads(&uploads, &[picture]).await;
            Err(e.describe("Failed to upload profile picture"))
        }
    }
}

pub async fn delete_profile_picture(
    Auth(user): Auth,
    State(uploads): State<Uploads>,
    mut conn: PgConn,
) -> Result<Json<Message>, Error> {
    let previous = db::take_profile_picture(&mut *conn, user)
        .await
        .describe("Failed to delete profile picture")?;
    discard_uploads(&uploads, &[previous]).await;
    Ok(Json(Message::new("Profile picture deleted successfully")))
}

pub async fn follow(
    Auth(user): Auth,
    mut conn: PgConn,
    ApiPath(target): ApiPath<UserId>,
) -> Result<Json<Message>, Error> {
    db::follow(&mut *conn, user, target)
        .await
        .describe("Failed to follow user")?;
    Ok(Json(Message::new("User followed successfully")))
}

pub async fn unfollow(
    Auth(user): Auth,
    mut conn: PgConn,
    ApiPath(target): ApiPath<UserId>,
) -> Result<Json<Message>, Error> {
    db::unfollow(&mut *conn, user, target)
        .await
        .describe("Failed to unfollow user")?;
    Ok(Json(Message::new("User unfollowed successfully")))
}

pub async fn user_profile(
    mut conn: PgConn,
    ApiPath(user): ApiPath<UserId>,
) -> Result<Json<Profile>, Error> {
    Ok(Json(
        db::fetch_profile(&mut *conn, user)
            .await
            .describe("Failed to get user")?,
    ))
}

pub async fn followers(
    mut conn: PgConn,
    ApiPath(user): ApiPath<UserId>,
) -> Result<Json<Followers>, Error> {
    if !db::user_exists(&mut *conn, user)
        .await
        .describe("Failed to get followers")?
    {
        return Err(Error::user_not_found());
    }
    Ok(Json(Followers {
        followers: db::followers_of(&mut *conn, user)
            .await
            .describe("Failed to get followers")?,
    }))
}

pub async fn following(
    mut conn: PgConn,
    ApiPath(user): ApiPath<UserId>,
) -> Result<Json<Following>, Error> {
    if !db::user_exists(&mut *conn, user)
        .await
        .describe("Failed to get following")?
    {
        return Err(Error::user_not_found());
    }
    Ok(Json(Following {
        following: db::following_of(&mut *conn, user)
            .await
            .describe("Failed to get following")?,
    }))
}

pub async fn search_users(
    Auth(user): Auth,
    mut conn: PgConn,
    ApiQuery(q): ApiQuery<UserSearch>,
) -> Result<Json<Vec<SearchHit>>, Error> {
    let needle = q.needle()?;
    Ok(Json(
        db::search_users(&mut *conn, user, needle)
            .await
            .describe("Failed to search users")?,
    ))
}

pub async fn list_posts(
    mut conn: PgConn,
    ApiQuery(q): ApiQuery<PostQuery>,
) -> Result<Json<PostPage>, Error> {
    let listing = q.resolve()?;
    tracing::debug!(?listing, "listing posts");
    Ok(Json(
        db::list_posts(&mut *conn, &listing)
            .await
            .describe("Failed to get posts")?,
    ))
}

pub async fn own_posts(Auth(user): Auth, mut conn: PgConn) -> Result<Json<PostList>, Error> {
    Ok(Json(PostList {
        posts: db::posts_by_owner(&mut *conn, user)
            .await
            .describe("Failed to get user posts")?,
    }))
}

pub async fn user_posts(
    mut conn: PgConn,
    ApiPath(user): ApiPath<UserId>,
) -> Result<Json<PostList>, Error> {
    Ok(Json(PostList {
        posts: db::posts_by_owner(&mut *conn, user)
            .await
            .describe("Failed to get user posts")?,
    }))
}

pub async fn get_post(
    mut conn: PgConn,
    ApiPath(post): ApiPath<PostId>,
) -> Result<Json<Post>, Error> {
    Ok(Json(
        db::fetch_post(&mut *conn, post)
            .await
            .describe("Failed to get post")?,
    ))
}

pub async fn create_post(
    Auth(user): Auth,
    State(uploads): State<Uploads>,
    mut conn: PgConn,
    form: PostForm,
) -> Result<(StatusCode, Json<Post>), Error> {
    let data = NewPost {
        title: form.title,
        content: form.content,
    };
    let res = match data.validate() {
        Err(e) => Err(Error::Api(e)),
        Ok((title, content)) => db::create_post(&mut *conn, user, title, content, &form.images)
            .await
            .describe("Failed to create post"),
    };
    match res {
        Ok(post) => {
            tracing::debug!(post = ?post.id, ?user, "created post");
            Ok((StatusCode::CREATED, Json(post)))
        }
        Err(e) => {
            discard_uploads(&uploads, &form.images).await;
            Err(e)
        }
    }
}

pub async fn update_post(
    Auth(user): Auth,
    State(uploads): State<Uploads>,
    mut conn: PgConn,
    ApiPath(post): ApiPath<PostId>,
    form: PostForm,
) -> Result<Json<Post>, Error> {
    let patch = PostPatch {
        title: form.title,
        content: form.content,
    };
    let res = match patch.validate() {
        Err(e) => Err(Error::Api(e)),
        Ok(()) => db::update_post(&mut *conn, user, post, &patch, &form.images)
            .await
            .describe("Failed to update post"),
    };
    if res.is_err() {
        discard_uploads(&uploads, &form.images).await;
    }
    Ok(Json(res?))
}

pub async fn delete_post(
    Auth(user): Auth,
    State(uploads): State<Uploads>,
    mut conn: PgConn,
    ApiPath(post): ApiPath<PostId>,
) -> Result<Json<Message>, Error> {
    let images = db::delete_post(&mut *conn, user, post)
        .await
        .describe("Failed to delete post")?;
    discard_uploads(&uploads, &images).await;
    tracing::debug!(?post, ?user, "deleted post");
    Ok(Json(Message::new("Post deleted successfully")))
}

pub async fn delete_post_image(
    Auth(user): Auth,
    State(uploads): State<Uploads>,
    mut conn: PgConn,
    ApiPath((post, index)): ApiPath<(PostId, String)>,
) -> Result<Json<Message>, Error> {
    let removed = db::delete_post_image(&mut *conn, user, post, &index)
        .await
        .describe("Failed to delete image")?;
    discard_uploads(&uploads, &[removed]).await;
    Ok(Json(Message::new("Image deleted successfully")))
}

async fn react(
    user: UserId,
    conn: &mut sqlx::PgConnection,
    post: PostId,
    reaction: Reaction,
) -> Result<Json<Message>, Error> {
    db::react(conn, user, post, reaction)
        .await
        .describe(reaction.failure_message())?;
    Ok(Json(Message::new(reaction.success_message())))
}

pub async fn like_post(
    Auth(user): Auth,
    mut conn: PgConn,
    ApiPath(post): ApiPath<PostId>,
) -> Result<Json<Message>, Error> {
    react(user, &mut *conn, post, Reaction::Like).await
}

pub async fn unlike_post(
    Auth(user): Auth,
    mut conn: PgConn,
    ApiPath(post): ApiPath<PostId>,
) -> Result<Json<Message>, Error> {
    react(user, &mut *conn, post, Reaction::Unlike).await
}

pub async fn dislike_post(
    Auth(user): Auth,
    mut conn: PgConn,
    ApiPath(post): ApiPath<PostId>,
) -> Result<Json<Message>, Error> {
    react(user, &mut *conn, post, Reaction::Dislike).await
}

pub async fn undislike_post(
    Auth(user): Auth,
    mut conn: PgConn,
    ApiPath(post): ApiPath<PostId>,
) -> Result<Json<Message>, Error> {
    react(user, &mut *conn, post, Reaction::Undislike).await
}

pub async fn post_comments(
    State(config): State<Config>,
    mut conn: PgConn,
    ApiPath(post): ApiPath<PostId>,
) -> Result<Json<Vec<CommentThread>>, Error> {
    Ok(Json(
        db::fetch_threads(&mut *conn, post, config.thread_depth)
            .await
            .describe("Failed to get comments")?,
    ))
}

pub async fn comment_replies(
    mut conn: PgConn,
    ApiPath(comment): ApiPath<CommentId>,
) -> Result<Json<Vec<Comment>>, Error> {
    Ok(Json(
        db::fetch_replies(&mut *conn, comment)
            .await
            .describe("Failed to get replies")?,
    ))
}

pub async fn create_comment(
    Auth(user): Auth,
    mut conn: PgConn,
    ApiJson(data): ApiJson<NewComment>,
) -> Result<(StatusCode, Json<Comment>), Error> {
    let (post, content) = data.validate()?;
    let comment = db::create_comment(
        &mut *conn,
        user,
        Some(post),
        data.parent_comment_id,
        content,
    )
    .await
    .describe("Failed to create comment")?;
    Ok((StatusCode::CREATED, Json(comment)))
}

pub async fn create_reply(
    Auth(user): Auth,
    mut conn: PgConn,
    ApiPath(parent): ApiPath<CommentId>,
    ApiJson(data): ApiJson<NewReply>,
) -> Result<(StatusCode, Json<Comment>), Error> {
    let content = data.validate()?;
    let reply = db::create_comment(&mut *conn, user, None, Some(parent), content)
        .await
        .describe("Failed to create reply")?;
    Ok((StatusCode::CREATED, Json(reply)))
}

pub async fn update_comment(
    Auth(user): Auth,
    mut conn: PgConn,
    ApiPath(comment): ApiPath<CommentId>,
    ApiJson(data): ApiJson<CommentEdit>,
) -> Result<Json<Comment>, Error> {
    tracing::debug!(?comment, ?user, "updating comment");
    let content = data.validate()?;
    Ok(Json(
        db::update_comment(&mut *conn, user, comment, content)
            .await
            .describe("Failed to update comment")?,
    ))
}

pub async fn delete_comment(
    Auth(user): Auth,
    mut conn: PgConn,
    ApiPath(comment): ApiPath<CommentId>,
) -> Result<Json<Message>, Error> {
    tracing::debug!(?comment, ?user, "deleting comment");
    db::delete_comment(&mut *conn, user, comment)
        .await
        .describe("Failed to delete comment")?;
    Ok(Json(Message::new(
        "Comment and all replies deleted successfully",
    )))
}
