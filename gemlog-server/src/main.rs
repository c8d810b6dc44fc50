use anyhow::Context;
use axum::{
    extract::DefaultBodyLimit,
    http::{header, Method, StatusCode},
    routing::{delete, get, get_service, post},
    Router,
};
use structopt::StructOpt;
use tower_http::{cors::CorsLayer, services::ServeDir, trace::TraceLayer};

mod config;
mod db;
mod error;
mod extractors;
mod handlers;
mod mailer;
mod query;
mod uploads;

#[cfg(test)]
mod fuzz;

use config::{Config, Opt};
use error::Error;
use extractors::{AppState, PgPool};
use mailer::Mailer;
use uploads::Uploads;

pub static MIGRATOR: sqlx::migrate::Migrator = sqlx::migrate!();

/// Five images of a few megabytes each, plus the text fields
const BODY_LIMIT: usize = 32 * 1024 * 1024;

pub async fn create_sqlx_pool(db_url: &str) -> anyhow::Result<sqlx::PgPool> {
    sqlx::postgres::PgPoolOptions::new()
        .max_connections(8)
        .connect(db_url)
        .await
        .with_context(|| format!("Error opening database {:?}", db_url))
}

pub fn app(state: AppState) -> Router {
    let uploads = get_service(ServeDir::new(state.uploads.dir())).handle_error(
        |err: std::io::Error| async move {
            tracing::error!(?err, "failed serving uploaded file");
            (StatusCode::INTERNAL_SERVER_ERROR, "Failed to read uploaded file")
        },
    );
    let cors = CorsLayer::new()
        .allow_origin(tower_http::cors::Any)
        .allow_methods([Method::GET, Method::POST, Method::PUT, Method::DELETE])
        .allow_headers([header::AUTHORIZATION, header::CONTENT_TYPE]);

    let user = Router::new()
        .route("/register", post(handlers::register))
        .route("/login", post(handlers::login))
        .route(
            "/profile",
            get(handlers::own_profile).put(handlers::update_profile),
        )
        .route(
            "/profile-picture",
            post(handlers::upload_profile_picture).delete(handlers::delete_profile_picture),
        )
        .route("/search", get(handlers::search_users))
        .route("/follow/:id", post(handlers::follow))
        .route("/unfollow/:id", post(handlers::unfollow))
        .route("/:id", get(handlers::user_profile))
        .route("/:id/followers", get(handlers::followers))
        .route("/:id/following", get(handlers::following));

    let posts = Router::new()
        .route("/", get(handlers::list_posts).post(handlers::create_post))
        .route("/user/posts", get(handlers::own_posts))
        .route("/user/:id", get(handlers::user_posts))
        .route(
            "/:id",
            get(handlers::get_post)
                .put(handlers::update_post)
                .delete(handlers::delete_post),
        )
        .route("/:id/images/:index", delete(handlers::delete_post_image))
        .route("/:id/like", post(handlers::like_post))
        .route("/:id/unlike", post(handlers::unlike_post))
        .route("/:id/dislike", post(handlers::dislike_post))
        .route("/:id/undislike", post(handlers::undislike_post));

    let comments = Router::new()
        .route("/", post(handlers::create_comment))
        .route("/post/:id", get(handlers::post_comments))
        .route("/:id/reply", post(handlers::create_reply))
        .route("/:id/replies", get(handlers::comment_replies))
        .route(
            "/:id",
            axum::routing::put(handlers::update_comment).delete(handlers::delete_comment),
        );

    Router::new()
        .route("/", get(handlers::banner))
        .nest("/user", user)
        .nest("/posts", posts)
        .nest("/comments", comments)
        .nest_service(gemlog_api::UPLOADS_PREFIX, uploads)
        .layer(DefaultBodyLimit::max(BODY_LIMIT))
        .layer(cors)
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt::init();

    let opt = Opt::from_args();
    let config = Config::from_opt(&opt)?;

    let db = create_sqlx_pool(&opt.database_url).await?;
    MIGRATOR
        .run(&db)
        .await
        .context("running pending migrations")?;

    let uploads = Uploads::open(opt.upload_dir.clone()).await?;
    let state = AppState {
        db: PgPool::new(db),
        config,
        uploads,
        mailer: Mailer::new(opt.welcome_webhook.clone()),
    };

    tracing::info!("listening on {}", opt.listen);
    axum::Server::bind(&opt.listen)
        .serve(app(state).into_make_service())
        .await
        .context("serving axum webserver")
}
