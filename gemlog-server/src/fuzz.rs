#![cfg(test)]

use async_recursion::async_recursion;
use bolero::generator::TypeGenerator;
use axum::{
    body::{Body, Bytes},
    extract::FromRequestParts,
    http::{self, request, StatusCode},
    Router,
};
use gemlog_api::{
    AuthToken, CommentEdit, CommentId, Credentials, Error as ApiError, NewComment, NewPost,
    NewReply, NewUser, PostId, PostPatch, PostQuery, ProfileUpdate, Reaction, UserId, UserSearch,
    Uuid, DELETED_COMMENT, DELETED_REPLY, STUB_UUID,
};
use gemlog_mock_server::MockServer;
use serde_json::{json, Value};
use sqlx::Row;
use std::{cmp, collections::HashMap, ops::RangeTo, panic::AssertUnwindSafe, path::Path};
use tower::{Service, ServiceExt};

use crate::{
    app, config::Config, create_sqlx_pool, extractors::*, mailer::Mailer, uploads::Uploads, Error,
    MIGRATOR,
};

macro_rules! do_tokio_test {
    ( $name:ident, $typ:ty, $fn:expr ) => {
        #[test]
        fn $name() {
            let runtime = AssertUnwindSafe(
                tokio::runtime::Builder::new_current_thread()
                    .enable_all()
                    .build()
                    .expect("failed initializing tokio runtime"),
            );
            bolero::check!()
                .with_type::<$typ>()
                .cloned()
                .for_each(move |v| {
                    let () = runtime.block_on($fn(v));
                })
        }
    };
}

fn build_pg_cluster(data: &Path) -> Option<postgresfixture::cluster::Cluster> {
    let mut best: Option<(postgresfixture::runtime::Runtime, _)> = None;
    for r in postgresfixture::runtime::Runtime::find_on_path() {
        if let Ok(v) = r.version() {
            let better = match &best {
                Some((_, best_version)) => *best_version < v,
                None => true,
            };
            if better {
                best = Some((r, v));
            }
        }
    }
    let (runtime, _) = best?;
    Some(postgresfixture::cluster::Cluster::new(data, runtime))
}

/// Runs `body` against a throwaway cluster, passing it the url of an empty database
///
/// Machines without postgres skip the test instead of failing it.
fn with_test_db(test: &str, body: impl FnOnce(String) + std::panic::UnwindSafe) {
    if std::env::var("RUST_LOG").is_ok() {
        let _ = tracing_subscriber::fmt::try_init();
    }
    let lockfile = tempfile::tempfile().expect("creating tempfile");
    let datadir = tempfile::tempdir().expect("creating tempdir");
    let datadir_path: &Path = datadir.as_ref();
    let Some(cluster) = build_pg_cluster(datadir_path) else {
        eprintln!("skipping {test}: postgresql seems to not be installed in path");
        return;
    };
    let datadir_path: &str = datadir_path.to_str().expect("tempdir is not valid utf8");
    let db_url = format!("postgresql://?host={}&dbname=test_db", datadir_path);
    postgresfixture::coordinate::run_and_destroy(&cluster, lockfile.into(), || {
        cluster.createdb("test_db").expect("creating test_db database");
        body(db_url)
    })
    .expect("coordinating spinup and shutdown of the pg cluster");
}

async fn migrated_pool(db_url: &str) -> PgPool {
    let pool = create_sqlx_pool(db_url)
        .await
        .expect("creating sqlx pool");
    MIGRATOR
        .run(&mut *pool.acquire().await.expect("getting migrator connection"))
        .await
        .expect("failed applying migrations");
    PgPool::new(pool)
}

macro_rules! do_sqlx_test {
    ( $name:ident, $gen:expr, $fn:expr ) => {
        #[test]
        fn $name() {
            with_test_db(stringify!($name), |db_url| {
                let runtime = AssertUnwindSafe(
                    tokio::runtime::Builder::new_current_thread()
                        .enable_all()
                        .build()
                        .expect("failed initializing tokio runtime"),
                );
                let pool = AssertUnwindSafe(runtime.block_on(migrated_pool(&db_url)));
                bolero::check!()
                    .with_generator($gen)
                    .cloned()
                    .for_each(move |v| {
                        let pool = pool.clone();
                        // run the test
                        let idle_before = pool.num_idle();
                        let v_str = format!("{v:?}");
                        let idle_after_res: Result<usize, _> = {
                            let pool = pool.clone();
                            std::panic::catch_unwind(AssertUnwindSafe(|| {
                                runtime.block_on(async move {
                                    let () = $fn(pool.clone(), v).await;
                                    let mut idle_after = pool.num_idle();
                                    let wait_release_since = std::time::Instant::now();
                                    while idle_after < idle_before
                                        && wait_release_since.elapsed()
                                            <= std::time::Duration::from_secs(1)
                                    {
                                        tokio::task::yield_now().await;
                                        idle_after = pool.num_idle();
                                    }
                                    idle_after
                                })
                            }))
                        };
                        runtime.block_on(async move {
                            // cleanup
                            let mut conn =
                                pool.acquire().await.expect("getting db cleanup connection");
                            sqlx::query(include_str!("../reset-test-db.sql"))
                                .execute(&mut *conn)
                                .await
                                .expect("failed cleaning up database");
                        });
                        // resume the panics
                        match idle_after_res {
                            Err(e) => std::panic::resume_unwind(e),
                            Ok(idle_after) => assert!(
                                idle_after >= idle_before,
                                "test {} held onto pool after exiting test: before there were {idle_before} connections, and after there were {idle_after} with value {v_str}",
                                stringify!($name)
                            ),
                        }
                    });
            })
        }
    };
}

/// A single scripted run against a fresh database
macro_rules! do_pg_test {
    ( $name:ident, $fn:expr ) => {
        #[test]
        fn $name() {
            with_test_db(stringify!($name), |db_url| {
                let runtime = tokio::runtime::Builder::new_current_thread()
                    .enable_all()
                    .build()
                    .expect("failed initializing tokio runtime");
                runtime.block_on(async move {
                    let pool = migrated_pool(&db_url).await;
                    let () = $fn(pool).await;
                })
            })
        }
    };
}

do_tokio_test!(fuzz_preauth_extractor, String, |token| async move {
    if let Ok(req) = http::Request::builder()
        .method(http::Method::GET)
        .uri("/")
        .header(http::header::AUTHORIZATION, token)
        .body(())
    {
        let mut req = req.into_parts().0;
        let res = PreAuth::from_request_parts(&mut req, &()).await;
        match res {
            Ok(PreAuth(token)) => assert!(!token.is_empty() && !token.contains(' ')),
            Err(Error::Api(ApiError::Unauthenticated(_))) => (),
            Err(e) => panic!("got unexpected error: {e}"),
        }
    }
});

struct TestApp {
    router: Router,
    uploads: tempfile::TempDir,
}

async fn test_app(db: PgPool) -> TestApp {
    let uploads = tempfile::tempdir().expect("creating upload tempdir");
    let state = AppState {
        db,
        config: Config::for_tests(),
        uploads: Uploads::open(uploads.path().to_path_buf())
            .await
            .expect("opening upload dir"),
        mailer: Mailer::new(None),
    };
    TestApp {
        router: app(state),
        uploads,
    }
}

fn request(method: &str, uri: &str, token: Option<&AuthToken>) -> request::Builder {
    let req = request::Builder::new().method(method).uri(uri);
    match token {
        Some(AuthToken(token)) => {
            req.header(http::header::AUTHORIZATION, format!("Bearer {token}"))
        }
        None => req,
    }
}

fn json_request(
    method: &str,
    uri: &str,
    token: Option<&AuthToken>,
    body: Option<Value>,
) -> http::Request<Body> {
    let req = request(method, uri, token);
    match body {
        Some(body) => req
            .header(http::header::CONTENT_TYPE, "application/json")
            .body(Body::from(
                serde_json::to_vec(&body).expect("serializing request body to json"),
            )),
        None => req.body(Body::empty()),
    }
    .expect("building request")
}

const BOUNDARY: &str = "gemlog-test-boundary";

/// Form parts out of (field name, file name, contents) triples, without the closing boundary
fn multipart_parts(fields: &[(&str, Option<&str>, &[u8])]) -> Vec<u8> {
    let mut body = Vec::new();
    for (name, file, data) in fields {
        body.extend_from_slice(format!("--{BOUNDARY}\r\n").as_bytes());
        let disposition = match file {
            Some(file) => format!(
                "Content-Disposition: form-data; name=\"{name}\"; filename=\"{file}\"\r\nContent-Type: application/octet-stream\r\n\r\n"
            ),
            None => format!("Content-Disposition: form-data; name=\"{name}\"\r\n\r\n"),
        };
        body.extend_from_slice(disposition.as_bytes());
        body.extend_from_slice(data);
        body.extend_from_slice(b"\r\n");
    }
    body
}

fn multipart_with_body(
    method: &str,
    uri: &str,
    token: &AuthToken,
    body: Vec<u8>,
) -> http::Request<Body> {
    request(method, uri, Some(token))
        .header(
            http::header::CONTENT_TYPE,
            format!("multipart/form-data; boundary={BOUNDARY}"),
        )
        .body(Body::from(body))
        .expect("building multipart request")
}

/// A multipart form out of (field name, file name, contents) triples
fn multipart_request(
    method: &str,
    uri: &str,
    token: &AuthToken,
    fields: &[(&str, Option<&str>, &[u8])],
) -> http::Request<Body> {
    let mut body = multipart_parts(fields);
    body.extend_from_slice(format!("--{BOUNDARY}--\r\n").as_bytes());
    multipart_with_body(method, uri, token, body)
}

/// Like `multipart_request`, but the body stops in the middle of a last file field
fn truncated_multipart_request(
    uri: &str,
    token: &AuthToken,
    fields: &[(&str, Option<&str>, &[u8])],
    cut_field: &str,
) -> http::Request<Body> {
    let mut body = multipart_parts(fields);
    let cut = multipart_parts(&[(cut_field, Some("cut.png"), b"".as_slice())]);
    // Headers of the last field, without the CRLF that would end its data
    body.extend_from_slice(&cut[..cut.len() - 2]);
    body.extend_from_slice(b"only the first half of an ima");
    multipart_with_body("POST", uri, token, body)
}

fn stored_uploads(t: &TestApp) -> Vec<String> {
    std::fs::read_dir(t.uploads.path())
        .expect("listing upload dir")
        .map(|e| {
            e.expect("reading upload dir entry")
                .file_name()
                .to_string_lossy()
                .into_owned()
        })
        .collect()
}

async fn send(app: &mut Router, req: http::Request<Body>) -> (StatusCode, Bytes) {
    app.ready().await.expect("waiting for app to be ready");
    let resp = app.call(req).await.expect("running request");
    let status = resp.status();
    let body = hyper::body::to_bytes(resp.into_body())
        .await
        .expect("recovering resp bytes");
    (status, body)
}

fn parse_response((status, body): (StatusCode, Bytes)) -> Result<Value, ApiError> {
    if status.is_success() {
        return Ok(serde_json::from_slice(&body).unwrap_or_else(|err| {
            panic!(
                r#"
                    Failed parsing resp body!

                    The error is the following:
                    ---
                    {err}
                    ---

                    Response body is:
                    ---
                    {body:?}
                    ---
                "#
            )
        }));
    }
    Err(ApiError::parse(&body)
        .unwrap_or_else(|err| panic!("parsing error response body {err}, body is {body:?}")))
}

async fn run_on_app(
    app: &mut Router,
    method: &str,
    uri: &str,
    token: Option<&AuthToken>,
    body: Option<Value>,
) -> Result<Value, ApiError> {
    parse_response(send(app, json_request(method, uri, token, body)).await)
}

/// Percent-encodes a query string value
fn encode(value: &str) -> String {
    value
        .bytes()
        .map(|b| match b {
            b'A'..=b'Z' | b'a'..=b'z' | b'0'..=b'9' | b'-' | b'_' | b'.' | b'~' => {
                String::from(b as char)
            }
            b => format!("%{b:02X}"),
        })
        .collect()
}

fn query_uri(path: &str, params: &[(&str, Option<String>)]) -> String {
    let params = params
        .iter()
        .filter_map(|(k, v)| v.as_ref().map(|v| format!("{k}={}", encode(v))))
        .collect::<Vec<_>>();
    match params.is_empty() {
        true => String::from(path),
        false => format!("{path}?{}", params.join("&")),
    }
}

/// Rewrites app ids into the matching mock ids, and drops what cannot match between the two
fn normalize(v: Value, ids: &HashMap<String, String>) -> Value {
    match v {
        Value::String(s) => Value::String(ids.get(&s).cloned().unwrap_or(s)),
        Value::Array(a) => Value::Array(a.into_iter().map(|v| normalize(v, ids)).collect()),
        Value::Object(o) => Value::Object(
            o.into_iter()
                .filter_map(|(k, v)| match k.as_str() {
                    "createdAt" | "updatedAt" | "token" => None,
                    "deletedAt" => Some((k, Value::Bool(!v.is_null()))),
                    _ => Some((k, normalize(v, ids))),
                })
                .collect(),
        ),
        v => v,
    }
}

fn resize_int(fuzz_id: usize, RangeTo { end }: RangeTo<usize>) -> Option<usize> {
    if end == 0 {
        return None;
    }
    let bucket_size = cmp::max(1, usize::MAX / end); // in case we rounded to 0
    let id = fuzz_id / bucket_size;
    Some(cmp::min(id, end - 1)) // in case id was actually over end - 1 due to rounding
}

fn pick<T: Clone>(items: &[T], idx: usize, fallback: T) -> T {
    resize_int(idx, ..items.len())
        .map(|i| items[i].clone())
        .unwrap_or(fallback)
}

const TEXTS: &[&str] = &[
    "",
    "Rust tips",
    "rust",
    "Cooking at home",
    "50% off",
    "snake_case",
    "GARDEN",
    "  ",
];
const USER_NEEDLES: &[&str] = &["user", "USER1", "r2", "%", "_", " ", "ser"];
const SORTS: &[&str] = &[
    "createdAt",
    "-createdAt",
    "updatedAt",
    "-updatedAt",
    "title",
    "-title",
    "bogus",
];

fn text(n: u8) -> String {
    String::from(TEXTS[n as usize % TEXTS.len()])
}

fn reaction_path(r: Reaction) -> &'static str {
    match r {
        Reaction::Like => "like",
        Reaction::Unlike => "unlike",
        Reaction::Dislike => "dislike",
        Reaction::Undislike => "undislike",
    }
}

// Usernames, titles and search needles come from small ascii sets, so that
// case-insensitive matching agrees between postgres and the mock whatever
// the cluster locale.
#[derive(Clone, Debug, bolero::generator::TypeGenerator)]
enum FuzzOp {
    Register {
        name: u8,
        password: String,
    },
    Login {
        uid: usize,
        wrong_password: bool,
    },
    OwnProfile {
        sid: usize,
    },
    UserProfile {
        uid: usize,
    },
    UpdateProfile {
        sid: usize,
        name: Option<u8>,
        email: Option<u8>,
    },
    Follow {
        sid: usize,
        uid: usize,
    },
    Unfollow {
        sid: usize,
        uid: usize,
    },
    Followers {
        uid: usize,
    },
    Following {
        uid: usize,
    },
    SearchUsers {
        sid: usize,
        q: Option<u8>,
    },
    ListPosts {
        search: Option<u8>,
        sort: Option<u8>,
        page: Option<i8>,
        limit: Option<i8>,
    },
    OwnPosts {
        sid: usize,
    },
    UserPosts {
        uid: usize,
    },
    GetPost {
        pid: usize,
    },
    CreatePost {
        sid: usize,
        title: Option<u8>,
        content: Option<u8>,
    },
    UpdatePost {
        sid: usize,
        pid: usize,
        title: Option<u8>,
        content: Option<u8>,
    },
    DeletePost {
        sid: usize,
        pid: usize,
    },
    DeletePostImage {
        sid: usize,
        pid: usize,
        index: u8,
    },
    React {
        sid: usize,
        pid: usize,
        reaction: Reaction,
    },
    PostComments {
        pid: usize,
    },
    Replies {
        cid: usize,
    },
    CreateComment {
        sid: usize,
        pid: usize,
        parent: Option<usize>,
        content: String,
    },
    CreateReply {
        sid: usize,
        cid: usize,
        content: String,
    },
    UpdateComment {
        sid: usize,
        cid: usize,
        content: String,
    },
    DeleteComment {
        sid: usize,
        cid: usize,
    },
}

/// The same entity, as known by the app and by the mock
#[derive(Clone, Copy, Debug)]
struct Ids {
    app: Uuid,
    mock: Uuid,
}

const STUB_IDS: Ids = Ids {
    app: STUB_UUID,
    mock: STUB_UUID,
};

struct FuzzUser {
    ids: Ids,
    email: String,
    password: String,
}

#[derive(Clone)]
struct Session {
    app: AuthToken,
    mock: AuthToken,
}

struct ComparativeFuzzer {
    app: Router,
    mock: MockServer,
    ids: HashMap<String, String>,
    users: Vec<FuzzUser>,
    sessions: Vec<Session>,
    posts: Vec<Ids>,
    comments: Vec<Ids>,
    _uploads: tempfile::TempDir,
}

impl ComparativeFuzzer {
    async fn new(pool: PgPool) -> ComparativeFuzzer {
        let TestApp { router, uploads } = test_app(pool).await;
        let config = Config::for_tests();
        ComparativeFuzzer {
            app: router,
            mock: MockServer::new(config.session_key.clone(), config.thread_depth),
            ids: HashMap::new(),
            users: Vec::new(),
            sessions: Vec::new(),
            posts: Vec::new(),
            comments: Vec::new(),
            _uploads: uploads,
        }
    }

    /// Records that the entity the app just returned is the one the mock just created
    fn pair(&mut self, app_id: &Value, mock: Uuid) -> Ids {
        let app = app_id
            .as_str()
            .and_then(|id| Uuid::parse_str(id).ok())
            .unwrap_or_else(|| panic!("app returned a malformed id {app_id:?}"));
        self.ids.insert(app.to_string(), mock.to_string());
        Ids { app, mock }
    }

    fn session(&self, sid: usize) -> Session {
        let invalid = AuthToken(String::from("not-a-token"));
        pick(
            &self.sessions,
            sid,
            Session {
                app: invalid.clone(),
                mock: invalid,
            },
        )
    }

    fn user(&self, uid: usize) -> Ids {
        resize_int(uid, ..self.users.len())
            .map(|i| self.users[i].ids)
            .unwrap_or(STUB_IDS)
    }

    fn compare<T: serde::Serialize>(
        &self,
        name: &str,
        app_res: Result<Value, ApiError>,
        mock_res: Result<T, ApiError>,
    ) {
        let app_res = app_res.map(|v| normalize(v, &self.ids));
        let mock_res = mock_res.map(|v| {
            normalize(
                serde_json::to_value(v).expect("serializing mock result"),
                &HashMap::new(),
            )
        });
        assert_eq!(
            app_res, mock_res,
            "app and mock did not return the same result for {name}"
        );
    }

    #[async_recursion]
    async fn execute_fuzz_op(&mut self, op: FuzzOp) {
        match op {
            FuzzOp::Register { name, password } => {
                let new_user = NewUser {
                    email: format!("user{name}@example.org"),
                    username: format!("user{name}"),
                    password,
                };
                let app_res = run_on_app(
                    &mut self.app,
                    "POST",
                    "/user/register",
                    None,
                    Some(json!(new_user)),
                )
                .await;
                let mock_res = self.mock.register(new_user.clone());
                if let (Ok(app), Ok(mock)) = (&app_res, &mock_res) {
                    let ids = self.pair(&app["user"]["_id"], mock.user.id.0);
                    self.users.push(FuzzUser {
                        ids,
                        email: new_user.email,
                        password: new_user.password,
                    });
                }
                self.compare("Register", app_res, mock_res);
            }
            FuzzOp::Login {
                uid,
                wrong_password,
            } => {
                if let Some(idx) = resize_int(uid, ..self.users.len()) {
                    let user = &self.users[idx];
                    let creds = Credentials {
                        email: user.email.clone(),
                        password: match wrong_password {
                            true => format!("{}!", user.password),
                            false => user.password.clone(),
                        },
                    };
                    let app_res = run_on_app(
                        &mut self.app,
                        "POST",
                        "/user/login",
                        None,
                        Some(json!(creds)),
                    )
                    .await;
                    let mock_res = self.mock.login(creds);
                    if let (Ok(app), Ok(mock)) = (&app_res, &mock_res) {
                        let token = app["token"].as_str().expect("app session has no token");
                        self.sessions.push(Session {
                            app: AuthToken(String::from(token)),
                            mock: mock.token.clone(),
                        });
                    }
                    self.compare("Login", app_res, mock_res);
                } else {
                    self.execute_fuzz_op(FuzzOp::Register {
                        name: 0,
                        password: String::from("password"),
                    })
                    .await;
                    self.execute_fuzz_op(FuzzOp::Login {
                        uid,
                        wrong_password,
                    })
                    .await;
                }
            }
            FuzzOp::OwnProfile { sid } => {
                let s = self.session(sid);
                let app_res =
                    run_on_app(&mut self.app, "GET", "/user/profile", Some(&s.app), None).await;
                self.compare("OwnProfile", app_res, self.mock.profile(&s.mock));
            }
            FuzzOp::UserProfile { uid } => {
                let u = self.user(uid);
                let uri = format!("/user/{}", u.app);
                let app_res = run_on_app(&mut self.app, "GET", &uri, None, None).await;
                self.compare(
                    "UserProfile",
                    app_res,
                    self.mock.user_profile(UserId(u.mock)),
                );
            }
            FuzzOp::UpdateProfile { sid, name, email } => {
                let s = self.session(sid);
                let update = ProfileUpdate {
                    username: name.map(|n| format!("user{n}")),
                    email: email.map(|n| format!("user{n}@example.org")),
                };
                let app_res = run_on_app(
                    &mut self.app,
                    "PUT",
                    "/user/profile",
                    Some(&s.app),
                    Some(json!(update)),
                )
                .await;
                let mock_res = self.mock.update_profile(&s.mock, update);
                self.compare("UpdateProfile", app_res, mock_res);
            }
            FuzzOp::Follow { sid, uid } => {
                let (s, u) = (self.session(sid), self.user(uid));
                let uri = format!("/user/follow/{}", u.app);
                let app_res = run_on_app(&mut self.app, "POST", &uri, Some(&s.app), None).await;
                let mock_res = self.mock.follow(&s.mock, UserId(u.mock));
                self.compare("Follow", app_res, mock_res);
            }
            FuzzOp::Unfollow { sid, uid } => {
                let (s, u) = (self.session(sid), self.user(uid));
                let uri = format!("/user/unfollow/{}", u.app);
                let app_res = run_on_app(&mut self.app, "POST", &uri, Some(&s.app), None).await;
                let mock_res = self.mock.unfollow(&s.mock, UserId(u.mock));
                self.compare("Unfollow", app_res, mock_res);
            }
            FuzzOp::Followers { uid } => {
                let u = self.user(uid);
                let uri = format!("/user/{}/followers", u.app);
                let app_res = run_on_app(&mut self.app, "GET", &uri, None, None).await;
                self.compare("Followers", app_res, self.mock.followers(UserId(u.mock)));
            }
            FuzzOp::Following { uid } => {
                let u = self.user(uid);
                let uri = format!("/user/{}/following", u.app);
                let app_res = run_on_app(&mut self.app, "GET", &uri, None, None).await;
                self.compare("Following", app_res, self.mock.following(UserId(u.mock)));
            }
            FuzzOp::SearchUsers { sid, q } => {
                let s = self.session(sid);
                let q = q.map(|n| String::from(USER_NEEDLES[n as usize % USER_NEEDLES.len()]));
                let uri = query_uri("/user/search", &[("q", q.clone())]);
                let app_res = run_on_app(&mut self.app, "GET", &uri, Some(&s.app), None).await;
                let mock_res = self.mock.search_users(&s.mock, UserSearch { q });
                self.compare("SearchUsers", app_res, mock_res);
            }
            FuzzOp::ListPosts {
                search,
                sort,
                page,
                limit,
            } => {
                let q = PostQuery {
                    search: search.map(text),
                    sort: sort.map(|n| String::from(SORTS[n as usize % SORTS.len()])),
                    page: page.map(i64::from),
                    limit: limit.map(i64::from),
                };
                let uri = query_uri(
                    "/posts",
                    &[
                        ("search", q.search.clone()),
                        ("sort", q.sort.clone()),
                        ("page", q.page.map(|p| p.to_string())),
                        ("limit", q.limit.map(|l| l.to_string())),
                    ],
                );
                let app_res = run_on_app(&mut self.app, "GET", &uri, None, None).await;
                self.compare("ListPosts", app_res, self.mock.list_posts(q));
            }
            FuzzOp::OwnPosts { sid } => {
                let s = self.session(sid);
                let app_res =
                    run_on_app(&mut self.app, "GET", "/posts/user/posts", Some(&s.app), None)
                        .await;
                self.compare("OwnPosts", app_res, self.mock.own_posts(&s.mock));
            }
            FuzzOp::UserPosts { uid } => {
                let u = self.user(uid);
                let uri = format!("/posts/user/{}", u.app);
                let app_res = run_on_app(&mut self.app, "GET", &uri, None, None).await;
                self.compare("UserPosts", app_res, self.mock.user_posts(UserId(u.mock)));
            }
            FuzzOp::GetPost { pid } => {
                let p = pick(&self.posts, pid, STUB_IDS);
                let uri = format!("/posts/{}", p.app);
                let app_res = run_on_app(&mut self.app, "GET", &uri, None, None).await;
                self.compare("GetPost", app_res, self.mock.post(PostId(p.mock)));
            }
            FuzzOp::CreatePost {
                sid,
                title,
                content,
            } => {
                let s = self.session(sid);
                let data = NewPost {
                    title: title.map(text),
                    content: content.map(text),
                };
                let app_res =
                    run_on_app(&mut self.app, "POST", "/posts", Some(&s.app), Some(json!(data)))
                        .await;
                let mock_res = self.mock.create_post(&s.mock, data, Vec::new());
                if let (Ok(app), Ok(mock)) = (&app_res, &mock_res) {
                    let ids = self.pair(&app["_id"], mock.id.0);
                    self.posts.push(ids);
                }
                self.compare("CreatePost", app_res, mock_res);
            }
            FuzzOp::UpdatePost {
                sid,
                pid,
                title,
                content,
            } => {
                let (s, p) = (self.session(sid), pick(&self.posts, pid, STUB_IDS));
                let patch = PostPatch {
                    title: title.map(text),
                    content: content.map(text),
                };
                let uri = format!("/posts/{}", p.app);
                let app_res =
                    run_on_app(&mut self.app, "PUT", &uri, Some(&s.app), Some(json!(patch))).await;
                let mock_res = self
                    .mock
                    .update_post(&s.mock, PostId(p.mock), patch, Vec::new());
                self.compare("UpdatePost", app_res, mock_res);
            }
            FuzzOp::DeletePost { sid, pid } => {
                let (s, p) = (self.session(sid), pick(&self.posts, pid, STUB_IDS));
                let uri = format!("/posts/{}", p.app);
                let app_res = run_on_app(&mut self.app, "DELETE", &uri, Some(&s.app), None).await;
                let mock_res = self.mock.delete_post(&s.mock, PostId(p.mock));
                self.compare("DeletePost", app_res, mock_res);
            }
            FuzzOp::DeletePostImage { sid, pid, index } => {
                let (s, p) = (self.session(sid), pick(&self.posts, pid, STUB_IDS));
                let uri = format!("/posts/{}/images/{index}", p.app);
                let app_res = run_on_app(&mut self.app, "DELETE", &uri, Some(&s.app), None).await;
                let mock_res =
                    self.mock
                        .delete_post_image(&s.mock, PostId(p.mock), &index.to_string());
                self.compare("DeletePostImage", app_res, mock_res);
            }
            FuzzOp::React { sid, pid, reaction } => {
                let (s, p) = (self.session(sid), pick(&self.posts, pid, STUB_IDS));
                let uri = format!("/posts/{}/{}", p.app, reaction_path(reaction));
                let app_res = run_on_app(&mut self.app, "POST", &uri, Some(&s.app), None).await;
                let mock_res = self.mock.react(&s.mock, PostId(p.mock), reaction);
                self.compare("React", app_res, mock_res);
            }
            FuzzOp::PostComments { pid } => {
                let p = pick(&self.posts, pid, STUB_IDS);
                let uri = format!("/comments/post/{}", p.app);
                let app_res = run_on_app(&mut self.app, "GET", &uri, None, None).await;
                self.compare(
                    "PostComments",
                    app_res,
                    self.mock.comments_for_post(PostId(p.mock)),
                );
            }
            FuzzOp::Replies { cid } => {
                let c = pick(&self.comments, cid, STUB_IDS);
                let uri = format!("/comments/{}/replies", c.app);
                let app_res = run_on_app(&mut self.app, "GET", &uri, None, None).await;
                self.compare("Replies", app_res, self.mock.replies(CommentId(c.mock)));
            }
            FuzzOp::CreateComment {
                sid,
                pid,
                parent,
                content,
            } => {
                let (s, p) = (self.session(sid), pick(&self.posts, pid, STUB_IDS));
                let parent = parent.map(|cid| pick(&self.comments, cid, STUB_IDS));
                let body = json!({
                    "postId": p.app,
                    "content": content,
                    "parentCommentId": parent.map(|c| c.app),
                });
                let app_res =
                    run_on_app(&mut self.app, "POST", "/comments", Some(&s.app), Some(body)).await;
                let mock_res = self.mock.create_comment(
                    &s.mock,
                    NewComment {
                        post_id: Some(PostId(p.mock)),
                        content,
                        parent_comment_id: parent.map(|c| CommentId(c.mock)),
                    },
                );
                if let (Ok(app), Ok(mock)) = (&app_res, &mock_res) {
                    let ids = self.pair(&app["_id"], mock.id.0);
                    self.comments.push(ids);
                }
                self.compare("CreateComment", app_res, mock_res);
            }
            FuzzOp::CreateReply { sid, cid, content } => {
                let (s, c) = (self.session(sid), pick(&self.comments, cid, STUB_IDS));
                let uri = format!("/comments/{}/reply", c.app);
                let data = NewReply { content };
                let app_res =
                    run_on_app(&mut self.app, "POST", &uri, Some(&s.app), Some(json!(data)))
                        .await;
                let mock_res = self.mock.create_reply(&s.mock, CommentId(c.mock), data);
                if let (Ok(app), Ok(mock)) = (&app_res, &mock_res) {
                    let ids = self.pair(&app["_id"], mock.id.0);
                    self.comments.push(ids);
                }
                self.compare("CreateReply", app_res, mock_res);
            }
            FuzzOp::UpdateComment { sid, cid, content } => {
                let (s, c) = (self.session(sid), pick(&self.comments, cid, STUB_IDS));
                let uri = format!("/comments/{}", c.app);
                let data = CommentEdit { content };
                let app_res =
                    run_on_app(&mut self.app, "PUT", &uri, Some(&s.app), Some(json!(data))).await;
                let mock_res = self.mock.update_comment(&s.mock, CommentId(c.mock), data);
                self.compare("UpdateComment", app_res, mock_res);
            }
            FuzzOp::DeleteComment { sid, cid } => {
                let (s, c) = (self.session(sid), pick(&self.comments, cid, STUB_IDS));
                let uri = format!("/comments/{}", c.app);
                let app_res = run_on_app(&mut self.app, "DELETE", &uri, Some(&s.app), None).await;
                let mock_res = self.mock.delete_comment(&s.mock, CommentId(c.mock));
                self.compare("DeleteComment", app_res, mock_res);
            }
        }
    }
}

do_sqlx_test!(
    compare_with_mock,
    bolero::generator::gen_with::<Vec<FuzzOp>>().len(1..100usize),
    |pool, test: Vec<FuzzOp>| async move {
        let mut fuzzer = ComparativeFuzzer::new(pool).await;
        for op in test {
            fuzzer.execute_fuzz_op(op).await;
        }
    }
);

const PASSWORD: &str = "hunter22";

fn id_of(entity: &Value) -> String {
    String::from(entity["_id"].as_str().expect("entity has no _id"))
}

/// Registers `name` and logs it in, returning its id and session token
async fn signup(app: &mut Router, name: &str) -> (String, AuthToken) {
    let email = format!("{name}@example.org");
    let (status, body) = send(
        app,
        json_request(
            "POST",
            "/user/register",
            None,
            Some(json!({ "email": email, "username": name, "password": PASSWORD })),
        ),
    )
    .await;
    assert_eq!(status, StatusCode::CREATED);
    let registered = parse_response((status, body)).expect("registering");
    let session = run_on_app(
        app,
        "POST",
        "/user/login",
        None,
        Some(json!({ "email": email, "password": PASSWORD })),
    )
    .await
    .expect("logging in");
    assert_eq!(session["user"]["username"], name);
    let token = session["token"].as_str().expect("session has no token");
    (id_of(&registered["user"]), AuthToken(String::from(token)))
}

async fn stored_comment(pool: &PgPool, id: &str) -> (String, bool) {
    let mut conn = pool.acquire().await.expect("acquiring connection");
    let row = sqlx::query("SELECT content, is_deleted FROM comments WHERE id = $1")
        .bind(Uuid::parse_str(id).expect("parsing comment id"))
        .fetch_one(&mut *conn)
        .await
        .expect("fetching stored comment");
    (row.get("content"), row.get("is_deleted"))
}

fn upload_path(t: &TestApp, reference: &Value) -> std::path::PathBuf {
    let reference = reference.as_str().expect("upload reference is not a string");
    let name = reference
        .strip_prefix("/uploads/")
        .expect("upload reference outside of /uploads");
    t.uploads.path().join(name)
}

do_pg_test!(banner_answers_on_root, |pool: PgPool| async move {
    let mut t = test_app(pool).await;
    let (status, body) = send(&mut t.router, json_request("GET", "/", None, None)).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(&body[..], b"GemLog API is running");
});

do_pg_test!(comment_deletion_tombstones_thread, |pool: PgPool| async move {
    let mut t = test_app(pool.clone()).await;
    let (_, tok) = signup(&mut t.router, "alice").await;
    let post = run_on_app(
        &mut t.router,
        "POST",
        "/posts",
        Some(&tok),
        Some(json!({ "title": "Greetings", "content": "Say hi below" })),
    )
    .await
    .expect("creating post");
    let post_id = id_of(&post);

    let hello = run_on_app(
        &mut t.router,
        "POST",
        "/comments",
        Some(&tok),
        Some(json!({ "postId": post_id, "content": "  Hello  " })),
    )
    .await
    .expect("commenting");
    assert_eq!(hello["content"], "Hello");
    let hello_id = id_of(&hello);
    let world = run_on_app(
        &mut t.router,
        "POST",
        &format!("/comments/{hello_id}/reply"),
        Some(&tok),
        Some(json!({ "content": "World" })),
    )
    .await
    .expect("replying");
    assert_eq!(world["postId"], post_id.as_str());
    assert_eq!(world["parentCommentId"], hello_id.as_str());
    let world_id = id_of(&world);

    let threads_uri = format!("/comments/post/{post_id}");
    let threads = run_on_app(&mut t.router, "GET", &threads_uri, None, None)
        .await
        .expect("reading threads");
    assert_eq!(threads.as_array().map(Vec::len), Some(1));
    assert_eq!(threads[0]["content"], "Hello");
    assert_eq!(threads[0]["replies"][0]["content"], "World");
    let post_uri = format!("/posts/{post_id}");
    let post = run_on_app(&mut t.router, "GET", &post_uri, None, None)
        .await
        .expect("reading post");
    assert_eq!(post["commentCount"], 1);

    let deleted = run_on_app(
        &mut t.router,
        "DELETE",
        &format!("/comments/{hello_id}"),
        Some(&tok),
        None,
    )
    .await
    .expect("deleting comment");
    assert_eq!(
        deleted["message"],
        "Comment and all replies deleted successfully"
    );
    assert_eq!(
        stored_comment(&pool, &hello_id).await,
        (String::from(DELETED_COMMENT), true)
    );
    assert_eq!(
        stored_comment(&pool, &world_id).await,
        (String::from(DELETED_REPLY), true)
    );

    let threads = run_on_app(&mut t.router, "GET", &threads_uri, None, None)
        .await
        .expect("reading threads");
    assert_eq!(threads, json!([]));
    let post = run_on_app(&mut t.router, "GET", &post_uri, None, None)
        .await
        .expect("reading post");
    assert_eq!(post["commentCount"], 0);
    assert_eq!(
        run_on_app(
            &mut t.router,
            "GET",
            &format!("/comments/{hello_id}/replies"),
            None,
            None
        )
        .await,
        Err(ApiError::comment_not_found())
    );
    assert_eq!(
        run_on_app(
            &mut t.router,
            "POST",
            &format!("/comments/{hello_id}/reply"),
            Some(&tok),
            Some(json!({ "content": "too late" })),
        )
        .await,
        Err(ApiError::not_found("Parent comment not found"))
    );
});

do_pg_test!(only_authors_touch_their_comments, |pool: PgPool| async move {
    let mut t = test_app(pool).await;
    let (_, alice) = signup(&mut t.router, "alice").await;
    let (_, bob) = signup(&mut t.router, "bob").await;
    let post = run_on_app(
        &mut t.router,
        "POST",
        "/posts",
        Some(&alice),
        Some(json!({ "title": "Mine", "content": "All mine" })),
    )
    .await
    .expect("creating post");
    let comment = run_on_app(
        &mut t.router,
        "POST",
        "/comments",
        Some(&alice),
        Some(json!({ "postId": id_of(&post), "content": "first" })),
    )
    .await
    .expect("commenting");
    let uri = format!("/comments/{}", id_of(&comment));
    assert_eq!(
        run_on_app(
            &mut t.router,
            "PUT",
            &uri,
            Some(&bob),
            Some(json!({ "content": "hijacked" }))
        )
        .await,
        Err(ApiError::forbidden("Not authorized to update this comment"))
    );
    assert_eq!(
        run_on_app(&mut t.router, "DELETE", &uri, Some(&bob), None).await,
        Err(ApiError::forbidden("Not authorized to delete this comment"))
    );
    assert_eq!(
        run_on_app(
            &mut t.router,
            "PUT",
            &uri,
            Some(&alice),
            Some(json!({ "content": "   " }))
        )
        .await,
        Err(ApiError::validation("Comment content cannot be empty"))
    );
    let edited = run_on_app(
        &mut t.router,
        "PUT",
        &uri,
        Some(&alice),
        Some(json!({ "content": "first, edited" })),
    )
    .await
    .expect("editing comment");
    assert_eq!(edited["content"], "first, edited");
    assert_eq!(
        run_on_app(
            &mut t.router,
            "POST",
            "/comments",
            Some(&bob),
            Some(json!({ "postId": STUB_UUID, "content": "into the void" })),
        )
        .await,
        Err(ApiError::post_not_found())
    );
});

do_pg_test!(follow_edges_show_on_both_sides, |pool: PgPool| async move {
    let mut t = test_app(pool).await;
    let (alice_id, alice) = signup(&mut t.router, "alice").await;
    let (bob_id, bob) = signup(&mut t.router, "bob").await;

    let follow_bob = format!("/user/follow/{bob_id}");
    let followed = run_on_app(&mut t.router, "POST", &follow_bob, Some(&alice), None)
        .await
        .expect("following");
    assert_eq!(followed["message"], "User followed successfully");
    assert_eq!(
        run_on_app(&mut t.router, "POST", &follow_bob, Some(&alice), None).await,
        Err(ApiError::conflict("Already following this user"))
    );

    let followers = run_on_app(
        &mut t.router,
        "GET",
        &format!("/user/{bob_id}/followers"),
        None,
        None,
    )
    .await
    .expect("listing followers");
    assert_eq!(followers["followers"][0]["_id"], alice_id.as_str());
    let following = run_on_app(
        &mut t.router,
        "GET",
        &format!("/user/{alice_id}/following"),
        None,
        None,
    )
    .await
    .expect("listing following");
    assert_eq!(following["following"][0]["username"], "bob");
    let profile = run_on_app(&mut t.router, "GET", "/user/profile", Some(&bob), None)
        .await
        .expect("reading profile");
    assert_eq!(profile["followers"][0]["username"], "alice");
    assert!(profile.get("password").is_none());

    let hits = run_on_app(&mut t.router, "GET", "/user/search?q=BO", Some(&alice), None)
        .await
        .expect("searching");
    assert_eq!(hits[0]["username"], "bob");
    assert_eq!(hits[0]["isFollowing"], true);
    let hits = run_on_app(&mut t.router, "GET", "/user/search?q=o", Some(&bob), None)
        .await
        .expect("searching");
    assert_eq!(hits.as_array().map(Vec::len), Some(0));

    let unfollowed = run_on_app(
        &mut t.router,
        "POST",
        &format!("/user/unfollow/{bob_id}"),
        Some(&alice),
        None,
    )
    .await
    .expect("unfollowing");
    assert_eq!(unfollowed["message"], "User unfollowed successfully");
    let followers = run_on_app(
        &mut t.router,
        "GET",
        &format!("/user/{bob_id}/followers"),
        None,
        None,
    )
    .await
    .expect("listing followers");
    assert_eq!(followers, json!({ "followers": [] }));

    assert_eq!(
        run_on_app(
            &mut t.router,
            "POST",
            &format!("/user/follow/{alice_id}"),
            Some(&alice),
            None
        )
        .await,
        Err(ApiError::validation("You cannot follow yourself"))
    );
    assert_eq!(
        run_on_app(
            &mut t.router,
            "POST",
            &format!("/user/follow/{STUB_UUID}"),
            Some(&alice),
            None
        )
        .await,
        Err(ApiError::user_not_found())
    );
    assert!(matches!(
        run_on_app(&mut t.router, "GET", "/user/not-a-uuid", None, None).await,
        Err(ApiError::Validation(_))
    ));
});

do_pg_test!(listing_pages_sorts_and_searches, |pool: PgPool| async move {
    let mut t = test_app(pool).await;
    let (_, tok) = signup(&mut t.router, "writer").await;
    for i in 0..10 {
        let (status, _) = send(
            &mut t.router,
            json_request(
                "POST",
                "/posts",
                Some(&tok),
                Some(json!({ "title": format!("post {i}"), "content": format!("body {i}") })),
            ),
        )
        .await;
        assert_eq!(status, StatusCode::CREATED);
    }

    let page = run_on_app(&mut t.router, "GET", "/posts?page=2&limit=6", None, None)
        .await
        .expect("listing page 2");
    assert_eq!(page["posts"].as_array().map(Vec::len), Some(4));
    assert_eq!(page["totalPosts"], 10);
    assert_eq!(page["totalPages"], 2);
    assert_eq!(page["currentPage"], 2);

    let first = run_on_app(&mut t.router, "GET", "/posts", None, None)
        .await
        .expect("listing first page");
    assert_eq!(first["posts"].as_array().map(Vec::len), Some(6));
    assert_eq!(first["posts"][0]["title"], "post 9");
    assert_eq!(first["posts"][0]["userId"]["username"], "writer");

    let found = run_on_app(&mut t.router, "GET", "/posts?search=ST%203", None, None)
        .await
        .expect("searching posts");
    assert_eq!(found["totalPosts"], 1);
    assert_eq!(found["posts"][0]["title"], "post 3");

    let by_title = run_on_app(&mut t.router, "GET", "/posts?search=BODY&sort=title", None, None)
        .await
        .expect("sorting by title");
    assert_eq!(by_title["posts"][0]["title"], "post 0");
    let by_title = run_on_app(&mut t.router, "GET", "/posts?sort=-title", None, None)
        .await
        .expect("sorting by title");
    assert_eq!(by_title["posts"][0]["title"], "post 9");

    assert_eq!(
        run_on_app(&mut t.router, "GET", "/posts?sort=bogus", None, None).await,
        Err(ApiError::validation("Invalid sort field"))
    );
    assert!(matches!(
        run_on_app(&mut t.router, "GET", "/posts?page=0", None, None).await,
        Err(ApiError::Validation(_))
    ));
    let mine = run_on_app(&mut t.router, "GET", "/posts/user/posts", Some(&tok), None)
        .await
        .expect("listing own posts");
    assert_eq!(mine["posts"].as_array().map(Vec::len), Some(10));
});

do_pg_test!(reactions_are_exclusive, |pool: PgPool| async move {
    let mut t = test_app(pool).await;
    let (_, owner) = signup(&mut t.router, "owner").await;
    let (fan_id, fan) = signup(&mut t.router, "fan").await;
    let post = run_on_app(
        &mut t.router,
        "POST",
        "/posts",
        Some(&owner),
        Some(json!({ "title": "Opinions", "content": "Have some" })),
    )
    .await
    .expect("creating post");
    let post_uri = format!("/posts/{}", id_of(&post));
    let react = |r: Reaction| format!("{post_uri}/{}", reaction_path(r));

    let liked = run_on_app(&mut t.router, "POST", &react(Reaction::Like), Some(&fan), None)
        .await
        .expect("liking");
    assert_eq!(liked["message"], "Post liked successfully");
    assert_eq!(
        run_on_app(&mut t.router, "POST", &react(Reaction::Like), Some(&fan), None).await,
        Err(ApiError::conflict("Post already liked"))
    );
    let post = run_on_app(&mut t.router, "GET", &post_uri, None, None)
        .await
        .expect("reading post");
    assert_eq!(post["likes"], json!([fan_id]));

    run_on_app(&mut t.router, "POST", &react(Reaction::Dislike), Some(&fan), None)
        .await
        .expect("disliking");
    let post = run_on_app(&mut t.router, "GET", &post_uri, None, None)
        .await
        .expect("reading post");
    assert_eq!(post["likes"], json!([]));
    assert_eq!(post["dislikes"], json!([fan_id]));
    assert_eq!(
        run_on_app(&mut t.router, "POST", &react(Reaction::Unlike), Some(&fan), None).await,
        Err(ApiError::conflict("Post not liked"))
    );

    run_on_app(&mut t.router, "POST", &react(Reaction::Undislike), Some(&fan), None)
        .await
        .expect("undisliking");
    let post = run_on_app(&mut t.router, "GET", &post_uri, None, None)
        .await
        .expect("reading post");
    assert_eq!(post["dislikes"], json!([]));
    assert_eq!(
        run_on_app(
            &mut t.router,
            "POST",
            &format!("/posts/{STUB_UUID}/like"),
            Some(&fan),
            None
        )
        .await,
        Err(ApiError::post_not_found())
    );
});

do_pg_test!(credentials_and_tokens_are_checked, |pool: PgPool| async move {
    let mut t = test_app(pool).await;
    signup(&mut t.router, "alice").await;
    assert_eq!(
        run_on_app(
            &mut t.router,
            "POST",
            "/user/register",
            None,
            Some(json!({ "email": "alice@example.org", "username": "alice2", "password": PASSWORD })),
        )
        .await,
        Err(ApiError::conflict("Email already exists"))
    );
    assert_eq!(
        run_on_app(
            &mut t.router,
            "POST",
            "/user/login",
            None,
            Some(json!({ "email": "nobody@example.org", "password": PASSWORD })),
        )
        .await,
        Err(ApiError::InvalidCredentials)
    );
    assert_eq!(
        run_on_app(
            &mut t.router,
            "POST",
            "/user/login",
            None,
            Some(json!({ "email": "alice@example.org", "password": "hunter23" })),
        )
        .await,
        Err(ApiError::InvalidCredentials)
    );
    assert_eq!(
        run_on_app(
            &mut t.router,
            "POST",
            "/user/login",
            None,
            Some(json!({ "email": "alice@example.org" })),
        )
        .await,
        Err(ApiError::validation("Email and password are required"))
    );
    assert_eq!(
        run_on_app(&mut t.router, "GET", "/user/profile", None, None).await,
        Err(ApiError::unauthenticated("No token, authorization denied"))
    );
    assert_eq!(
        run_on_app(
            &mut t.router,
            "GET",
            "/user/profile",
            Some(&AuthToken(String::from("garbage"))),
            None
        )
        .await,
        Err(ApiError::unauthenticated("Invalid token"))
    );
});

do_pg_test!(post_images_follow_their_post, |pool: PgPool| async move {
    let mut t = test_app(pool).await;
    let (_, owner) = signup(&mut t.router, "owner").await;
    let (_, other) = signup(&mut t.router, "other").await;

    let (status, body) = send(
        &mut t.router,
        multipart_request(
            "POST",
            "/posts",
            &owner,
            &[
                ("title", None, b"Holiday".as_slice()),
                ("content", None, b"Pictures inside".as_slice()),
                ("images", Some("beach.PNG"), b"beach bytes".as_slice()),
                ("images", Some("hill.jpg"), b"hill bytes".as_slice()),
            ],
        ),
    )
    .await;
    assert_eq!(status, StatusCode::CREATED);
    let post = parse_response((status, body)).expect("creating post with images");
    let images = post["images"].as_array().expect("images is not an array").clone();
    assert_eq!(images.len(), 2);
    assert!(images[0].as_str().map_or(false, |i| i.ends_with(".png")));
    let (beach, hill) = (upload_path(&t, &images[0]), upload_path(&t, &images[1]));
    assert_eq!(std::fs::read(&beach).expect("reading stored image"), b"beach bytes");

    let (status, served) = send(
        &mut t.router,
        json_request("GET", images[1].as_str().unwrap_or_default(), None, None),
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(&served[..], b"hill bytes");

    let post_uri = format!("/posts/{}", id_of(&post));
    assert_eq!(
        run_on_app(
            &mut t.router,
            "DELETE",
            &format!("{post_uri}/images/0"),
            Some(&other),
            None
        )
        .await,
        Err(ApiError::forbidden(
            "You don't have permission to delete this image"
        ))
    );
    let removed = run_on_app(
        &mut t.router,
        "DELETE",
        &format!("{post_uri}/images/0"),
        Some(&owner),
        None,
    )
    .await
    .expect("removing image");
    assert_eq!(removed["message"], "Image deleted successfully");
    assert!(!beach.exists());
    let post = run_on_app(&mut t.router, "GET", &post_uri, None, None)
        .await
        .expect("reading post");
    assert_eq!(post["images"], json!([images[1]]));
    assert_eq!(
        run_on_app(
            &mut t.router,
            "DELETE",
            &format!("{post_uri}/images/3"),
            Some(&owner),
            None
        )
        .await,
        Err(ApiError::validation("Invalid image index"))
    );

    run_on_app(&mut t.router, "DELETE", &post_uri, Some(&owner), None)
        .await
        .expect("deleting post");
    assert!(!hill.exists());

    let six: Vec<(&str, Option<&str>, &[u8])> = std::iter::once(("title", None, &b"Too"[..]))
        .chain(std::iter::once(("content", None, &b"many"[..])))
        .chain((0..6).map(|_| ("images", Some("x.png"), &b"x"[..])))
        .collect();
    assert!(matches!(
        parse_response(send(&mut t.router, multipart_request("POST", "/posts", &owner, &six)).await),
        Err(ApiError::Validation(_))
    ));
    assert_eq!(
        std::fs::read_dir(t.uploads.path())
            .expect("listing upload dir")
            .count(),
        0
    );
});

do_pg_test!(profile_picture_replacement_drops_old_file, |pool: PgPool| async move {
    let mut t = test_app(pool).await;
    let (_, tok) = signup(&mut t.router, "alice").await;
    let upload = |file: &'static [u8]| {
        multipart_request(
            "POST",
            "/user/profile-picture",
            &tok,
            &[("profilePicture", Some("me.png"), file)],
        )
    };

    let first = parse_response(send(&mut t.router, upload(b"first".as_slice())).await)
        .expect("uploading first picture");
    assert_eq!(first["message"], "Profile picture uploaded successfully");
    let first_path = upload_path(&t, &first["profilePicture"]);
    assert!(first_path.exists());

    let second = parse_response(send(&mut t.router, upload(b"second".as_slice())).await)
        .expect("uploading second picture");
    let second_path = upload_path(&t, &second["profilePicture"]);
    assert!(!first_path.exists());
    assert!(second_path.exists());
    let profile = run_on_app(&mut t.router, "GET", "/user/profile", Some(&tok), None)
        .await
        .expect("reading profile");
    assert_eq!(profile["profilePicture"], second["profilePicture"]);

    let deleted = run_on_app(&mut t.router, "DELETE", "/user/profile-picture", Some(&tok), None)
        .await
        .expect("deleting picture");
    assert_eq!(deleted["message"], "Profile picture deleted successfully");
    assert!(!second_path.exists());
    assert_eq!(
        run_on_app(&mut t.router, "DELETE", "/user/profile-picture", Some(&tok), None).await,
        Err(ApiError::validation("No profile picture to delete"))
    );
    assert_eq!(
        parse_response(
            send(
                &mut t.router,
                multipart_request(
                    "POST",
                    "/user/profile-picture",
                    &tok,
                    &[("caption", None, b"no file here".as_slice())],
                ),
            )
            .await
        ),
        Err(ApiError::validation("No file uploaded"))
    );
});

do_pg_test!(truncated_uploads_leave_no_files, |pool: PgPool| async move {
    let mut t = test_app(pool).await;
    let (_, tok) = signup(&mut t.router, "alice").await;

    let res = parse_response(
        send(
            &mut t.router,
            truncated_multipart_request(
                "/user/profile-picture",
                &tok,
                &[("profilePicture", Some("me.png"), b"complete".as_slice())],
                "caption",
            ),
        )
        .await,
    );
    match res {
        Err(ApiError::Validation(msg)) => assert!(msg.starts_with("Malformed upload"), "{msg}"),
        res => panic!("truncated picture upload was not rejected: {res:?}"),
    }
    assert_eq!(stored_uploads(&t), Vec::<String>::new());
    let profile = run_on_app(&mut t.router, "GET", "/user/profile", Some(&tok), None)
        .await
        .expect("reading profile");
    assert_eq!(profile["profilePicture"], Value::Null);

    let res = parse_response(
        send(
            &mut t.router,
            truncated_multipart_request(
                "/posts",
                &tok,
                &[
                    ("title", None, b"Hello".as_slice()),
                    ("content", None, b"World".as_slice()),
                    ("images", Some("a.png"), b"complete".as_slice()),
                ],
                "images",
            ),
        )
        .await,
    );
    match res {
        Err(ApiError::Validation(msg)) => assert!(msg.starts_with("Malformed upload"), "{msg}"),
        res => panic!("truncated post upload was not rejected: {res:?}"),
    }
    assert_eq!(stored_uploads(&t), Vec::<String>::new());
    let listing = run_on_app(&mut t.router, "GET", "/posts", None, None)
        .await
        .expect("listing posts");
    assert_eq!(listing["totalPosts"], 0);
});
