use std::ops::{Deref, DerefMut};

use anyhow::Context;
use axum::{
    async_trait,
    body::Body,
    extract::{FromRequest, FromRequestParts, Multipart},
    http::{self, request, Request},
};
use gemlog_api::{PostPatch, UserId, MAX_POST_IMAGES};

use crate::{
    config::Config,
    mailer::Mailer,
    uploads::{malformed_upload, Uploads},
    Error,
};

#[derive(Clone, axum::extract::FromRef)]
pub struct AppState {
    pub db: PgPool,
    pub config: Config,
    pub uploads: Uploads,
    pub mailer: Mailer,
}

#[derive(Clone)]
pub struct PgPool(sqlx::PgPool);

impl PgPool {
    pub fn new(pool: sqlx::PgPool) -> PgPool {
        PgPool(pool)
    }

    pub async fn acquire(&self) -> Result<PgConn, Error> {
        Ok(PgConn(
            self.0.acquire().await.context("acquiring db connection")?,
        ))
    }

    pub fn num_idle(&self) -> usize {
        self.0.num_idle()
    }
}

pub struct PgConn(sqlx::pool::PoolConnection<sqlx::Postgres>);

#[async_trait]
impl FromRequestParts<AppState> for PgConn {
    type Rejection = Error;

    async fn from_request_parts(
        _req: &mut request::Parts,
        state: &AppState,
    ) -> Result<PgConn, Error> {
        state.db.acquire().await
    }
}

impl Deref for PgConn {
    type Target = sqlx::PgConnection;

    fn deref(&self) -> &Self::Target {
        &self.0
    }
}

impl DerefMut for PgConn {
    fn deref_mut(&mut self) -> &mut Self::Target {
        &mut self.0
    }
}

/// Bearer token, not yet checked
pub struct PreAuth(pub String);

#[async_trait]
impl<S: Sync> FromRequestParts<S> for PreAuth {
    type Rejection = Error;

    async fn from_request_parts(req: &mut request::Parts, _state: &S) -> Result<PreAuth, Error> {
        let denied = || Error::unauthenticated("No token, authorization denied");
        match req.headers.get(http::header::AUTHORIZATION) {
            None => Err(denied()),
            Some(auth) => {
                let auth = auth.to_str().map_err(|_| denied())?;
                let mut auth = auth.split(' ');
                if !auth
                    .next()
                    .ok_or_else(denied)?
                    .eq_ignore_ascii_case("bearer")
                {
                    return Err(denied());
                }
                let token = auth.next().ok_or_else(denied)?;
                if !auth.next().is_none() || token.is_empty() {
                    return Err(denied());
                }
                Ok(PreAuth(String::from(token)))
            }
        }
    }
}

/// The user a valid session token was issued to
pub struct Auth(pub UserId);

#[async_trait]
impl FromRequestParts<AppState> for Auth {
    type Rejection = Error;

    async fn from_request_parts(req: &mut request::Parts, state: &AppState) -> Result<Auth, Error> {
        let token = PreAuth::from_request_parts(req, state).await?.0;
        let user = state.config.session_key.verify(&token)?;
        tracing::debug!(?user, "user authenticated");
        Ok(Auth(user))
    }
}

/// `axum::Json` answering malformed bodies with our error format
#[derive(axum::extract::FromRequest)]
#[from_request(via(axum::Json), rejection(Error))]
pub struct ApiJson<T>(pub T);

#[derive(axum::extract::FromRequestParts)]
#[from_request(via(axum::extract::Path), rejection(Error))]
pub struct ApiPath<T>(pub T);

#[derive(axum::extract::FromRequestParts)]
#[from_request(via(axum::extract::Query), rejection(Error))]
pub struct ApiQuery<T>(pub T);

fn is_multipart(req: &Request<Body>) -> bool {
    req.headers()
        .get(http::header::CONTENT_TYPE)
        .and_then(|v| v.to_str().ok())
        .map(|v| v.starts_with("multipart/form-data"))
        .unwrap_or(false)
}

/// Title, content and newly uploaded images of a post
///
/// Accepts either a json body (no images) or a multipart form with `title`,
/// `content` and up to five `images` file fields. Images are written to disk
/// while the form is read, and removed again if the form turns out invalid.
#[derive(Debug, Default)]
pub struct PostForm {
    pub title: Option<String>,
    pub content: Option<String>,
    pub images: Vec<String>,
}

#[async_trait]
impl FromRequest<AppState, Body> for PostForm {
    type Rejection = Error;

    async fn from_request(req: Request<Body>, state: &AppState) -> Result<PostForm, Error> {
        if !is_multipart(&req) {
            let ApiJson(patch) = ApiJson::<PostPatch>::from_request(req, state).await?;
            return Ok(PostForm {
                title: patch.title,
                content: patch.content,
                images: Vec::new(),
            });
        }
        let mut multipart = Multipart::from_request(req, state)
            .await
            .map_err(|e| Error::validation(&e.body_text()))?;
        let mut form = PostForm::default();
        if let Err(e) = read_post_form(&mut multipart, &state.uploads, &mut form).await {
            state
                .uploads
                .remove_all(&form.images)
                .await
                .context("cleaning up images of a rejected post form")?;
            return Err(e);
        }
        Ok(form)
    }
}

async fn read_post_form(
    multipart: &mut Multipart,
    uploads: &Uploads,
    form: &mut PostForm,
) -> Result<(), Error> {
    while let Some(mut field) = multipart.next_field().await.map_err(malformed_upload)? {
        let name = field.name().map(String::from);
        match name.as_deref() {
            Some("title") => form.title = Some(field.text().await.map_err(malformed_upload)?),
            Some("content") => form.content = Some(field.text().await.map_err(malformed_upload)?),
            Some("images") => {
                if form.images.len() >= MAX_POST_IMAGES {
                    return Err(Error::validation("Too many images, at most 5 are allowed"));
                }
                form.images.push(uploads.store(&mut field).await?);
            }
            name => tracing::debug!(?name, "ignoring unexpected post form field"),
        }
    }
    Ok(())
}

/// The `profilePicture` file of a multipart form, once stored
pub struct PictureUpload(pub Option<String>);

#[async_trait]
impl FromRequest<AppState, Body> for PictureUpload {
    type Rejection = Error;

    async fn from_request(req: Request<Body>, state: &AppState) -> Result<PictureUpload, Error> {
        if !is_multipart(&req) {
            return Ok(PictureUpload(None));
        }
        let mut multipart = Multipart::from_request(req, state)
            .await
            .map_err(|e| Error::validation(&e.body_text()))?;
        let mut stored = None;
        if let Err(e) = read_picture_form(&mut multipart, &state.uploads, &mut stored).await {
            if let Some(picture) = &stored {
                state
                    .uploads
                    .remove(picture)
                    .await
                    .context("cleaning up picture of a rejected upload")?;
            }
            return Err(e);
        }
        Ok(PictureUpload(stored))
    }
}

async fn read_picture_form(
    multipart: &mut Multipart,
    uploads: &Uploads,
    stored: &mut Option<String>,
) -> Result<(), Error> {
    while let Some(mut field) = multipart.next_field().await.map_err(malformed_upload)? {
        if field.name() == Some("profilePicture") && stored.is_none() {
            *stored = Some(uploads.store(&mut field).await?);
        }
    }
    Ok(())
}
