use std::{net::SocketAddr, path::PathBuf};

use gemlog_api::{SessionKey, BCRYPT_COST};

#[derive(structopt::StructOpt)]
pub struct Opt {
    /// Address to listen on
    #[structopt(long, env = "LISTEN_ADDR", default_value = "127.0.0.1:3002")]
    pub listen: SocketAddr,

    /// PostgreSQL connection url
    #[structopt(long, env = "DATABASE_URL")]
    pub database_url: String,

    /// Secret used to sign session tokens
    #[structopt(long, env = "JWT_SECRET", hide_env_values = true)]
    pub jwt_secret: String,

    /// Directory where uploaded files are stored
    #[structopt(long, env = "UPLOAD_DIR", default_value = "uploads")]
    pub upload_dir: PathBuf,

    /// Number of comment levels returned by a thread read, top level included
    #[structopt(long, env = "COMMENT_DEPTH", default_value = "4")]
    pub comment_depth: usize,

    /// Url the welcome notification of new users is posted to
    #[structopt(long, env = "WELCOME_WEBHOOK_URL")]
    pub welcome_webhook: Option<String>,
}

/// Settings shared by all handlers, resolved once at startup
#[derive(Clone)]
pub struct Config {
    pub session_key: SessionKey,
    pub bcrypt_cost: u32,
    pub thread_depth: usize,
}

impl Config {
    pub fn new(jwt_secret: &str, thread_depth: usize) -> anyhow::Result<Config> {
        anyhow::ensure!(!jwt_secret.is_empty(), "JWT_SECRET must not be empty");
        anyhow::ensure!(thread_depth >= 1, "COMMENT_DEPTH must be at least 1");
        Ok(Config {
            session_key: SessionKey::new(jwt_secret.as_bytes()),
            bcrypt_cost: BCRYPT_COST,
            thread_depth,
        })
    }

    pub fn from_opt(opt: &Opt) -> anyhow::Result<Config> {
        Config::new(&opt.jwt_secret, opt.comment_depth)
    }

    #[cfg(test)]
    pub fn for_tests() -> Config {
        Config {
            session_key: SessionKey::new(b"test secret"),
            bcrypt_cost: 4,
            thread_depth: gemlog_api::DEFAULT_THREAD_DEPTH,
        }
    }
}
