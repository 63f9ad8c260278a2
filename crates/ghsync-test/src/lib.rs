//! Helpers for testing the web server and service.
//!
//! When writing tests, keep the following points in mind:
//!
//!  - In every test, call [`setup`]. This will set up the logger so that all console output
//!    is captured by the test runner.
//!
//!  - When using [`tempdir`], make sure that the handle to the temp directory is held for the
//!    entire lifetime of the test. Assign it to a variable in the test function
//!    (e.g. `let cache_dir = test::tempdir()`).
//!
//!  - When using [`GitHubMock`] or [`Server`], hold on to them until all requests have been
//!    made. The server stops serving when dropped.

use std::collections::{BTreeMap, HashMap};
use std::net::SocketAddr;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use axum::extract::{OriginalUri, Path, Query, Request};
use axum::http::header::AUTHORIZATION;
use axum::http::{HeaderMap, StatusCode};
use axum::middleware::{self, Next};
use axum::response::{IntoResponse, Response};
use axum::routing::get;
use axum::{Json, Router};
use reqwest::Url;
use serde_json::{Value, json};
use tracing_subscriber::filter::EnvFilter;
use tracing_subscriber::fmt::fmt;

pub use tempfile::TempDir;

/// The epoch seconds reported in `x-ratelimit-reset` by [`GitHubMock`].
pub const RATELIMIT_RESET: i64 = 1_700_000_000;

/// How long [`GitHubMock`] delays responses for the `slow` user.
pub const SLOW_RESPONSE: Duration = Duration::from_secs(2);

/// Setup the test environment.
///
///  - Initializes logs: The logger only captures logs from the `ghsync` crates and mutes all
///    other logs.
pub fn setup() {
    fmt()
        .with_env_filter(EnvFilter::new("ghsync=trace,ghsync_service=trace"))
        .with_target(false)
        .pretty()
        .with_test_writer()
        .try_init()
        .ok();
}

/// Creates a temporary directory.
///
/// The directory is deleted when the [`TempDir`] instance is dropped. Use it as a guard to
/// automatically clean up after tests.
pub fn tempdir() -> TempDir {
    TempDir::new().unwrap()
}

/// A test server that binds to a random port and serves a web app.
///
/// This server requires a `tokio` runtime and is supposed to be run in a `tokio::test`. It
/// automatically stops serving when dropped.
#[derive(Debug)]
pub struct Server {
    pub handle: tokio::task::JoinHandle<()>,
    pub socket: SocketAddr,
}

impl Server {
    /// Creates a new test server serving the given router.
    pub fn with_router(router: Router) -> Self {
        let listener = std::net::TcpListener::bind(SocketAddr::from(([127, 0, 0, 1], 0))).unwrap();
        listener.set_nonblocking(true).unwrap();
        let socket = listener.local_addr().unwrap();
        let listener = tokio::net::TcpListener::from_std(listener).unwrap();

        let handle = tokio::spawn(async move {
            axum::serve(listener, router).await.unwrap();
        });

        Self { handle, socket }
    }

    /// Returns the socket address that this server listens on.
    pub fn addr(&self) -> SocketAddr {
        self.socket
    }

    /// Returns the port that this server listens on.
    pub fn port(&self) -> u16 {
        self.addr().port()
    }

    /// Returns a full URL pointing to the given path.
    pub fn url(&self, path: &str) -> Url {
        let path = path.trim_start_matches('/');
        format!("http://127.0.0.1:{}/{}", self.port(), path)
            .parse()
            .unwrap()
    }
}

impl Drop for Server {
    fn drop(&mut self) {
        self.handle.abort();
    }
}

/// A fake GitHub REST API that counts the requests it receives.
///
/// The behavior is controlled by the login and token used in a request:
///
/// | input               | response                                                  |
/// |---------------------|-----------------------------------------------------------|
/// | no token, `bad`     | `401 Unauthorized`                                        |
/// | token `exhausted`   | `403` with `x-ratelimit-remaining: 0`                     |
/// | token `throttled`   | `429 Too Many Requests`                                   |
/// | login `ghost`       | `404 Not Found`                                           |
/// | login `private`     | `403` without rate limit headers                          |
/// | login `broken`      | `200` with a body that is not JSON                        |
/// | login `teapot`      | `500 Internal Server Error`                               |
/// | login `slow`        | a regular response after [`SLOW_RESPONSE`]               |
/// | login `prolific`    | 150 repositories                                          |
/// | any other login     | a user with 3 repositories, the last one is a fork        |
pub struct GitHubMock {
    server: Server,
    hits: Arc<Mutex<BTreeMap<String, usize>>>,
}

impl GitHubMock {
    pub fn new() -> Self {
        let hits = Arc::new(Mutex::new(BTreeMap::new()));

        let hitcounter = {
            let hits = hits.clone();
            move |OriginalUri(uri), req: Request, next: Next| {
                let hits = hits.clone();
                async move {
                    {
                        let mut hits = hits.lock().unwrap();
                        *hits.entry(uri.path().to_owned()).or_default() += 1;
                    }

                    next.run(req).await
                }
            }
        };

        let router = Router::new()
            .route("/users/:login", get(user))
            .route("/users/:login/repos", get(repos))
            .layer(middleware::from_fn(hitcounter));

        let server = Server::with_router(router);

        Self { server, hits }
    }

    /// The base URL of the API, to be used as `github.api_url`.
    pub fn api_url(&self) -> Url {
        self.server.url("/")
    }

    /// Number of requests received for the given path, e.g. `/users/alice`.
    pub fn hits(&self, path: &str) -> usize {
        self.hits.lock().unwrap().get(path).copied().unwrap_or(0)
    }

    /// Total number of requests received.
    pub fn accesses(&self) -> usize {
        self.hits.lock().unwrap().values().sum()
    }
}

impl Default for GitHubMock {
    fn default() -> Self {
        Self::new()
    }
}

fn error(status: StatusCode, message: &str) -> Response {
    (status, Json(json!({ "message": message }))).into_response()
}

fn check_token(headers: &HeaderMap) -> Result<(), Response> {
    let token = headers
        .get(AUTHORIZATION)
        .and_then(|value| value.to_str().ok())
        .and_then(|value| value.strip_prefix("Bearer "));

    match token {
        None | Some("bad") => Err(error(StatusCode::UNAUTHORIZED, "Bad credentials")),
        Some("exhausted") => Err((
            StatusCode::FORBIDDEN,
            [
                ("x-ratelimit-remaining", "0".to_owned()),
                ("x-ratelimit-reset", RATELIMIT_RESET.to_string()),
            ],
            Json(json!({ "message": "API rate limit exceeded" })),
        )
            .into_response()),
        Some("throttled") => Err(error(
            StatusCode::TOO_MANY_REQUESTS,
            "You have exceeded a secondary rate limit",
        )),
        Some(_) => Ok(()),
    }
}

fn user_json(login: &str) -> Value {
    json!({
        "login": login,
        "id": 42,
        "type": "User",
        "name": "Test User",
        "bio": "Writes tests",
        "public_repos": 3,
        "followers": 7,
        "following": 1,
        "created_at": "2015-01-01T00:00:00Z",
    })
}

fn repo_json(login: &str, index: usize) -> Value {
    const LANGUAGES: [&str; 3] = ["Rust", "Go", "Python"];
    json!({
        "id": 1000 + index,
        "name": format!("repo-{index}"),
        "full_name": format!("{login}/repo-{index}"),
        "language": LANGUAGES[index % LANGUAGES.len()],
        "topics": ["cli"],
        "stargazers_count": 10 * (index + 1),
        "forks_count": 1,
        "fork": index == 2,
        "private": false,
    })
}

async fn user(Path(login): Path<String>, headers: HeaderMap) -> Response {
    if let Err(response) = check_token(&headers) {
        return response;
    }

    match login.as_str() {
        "ghost" => error(StatusCode::NOT_FOUND, "Not Found"),
        "private" => error(StatusCode::FORBIDDEN, "Resource not accessible by integration"),
        "broken" => "this is not json".into_response(),
        "teapot" => error(StatusCode::INTERNAL_SERVER_ERROR, "Server Error"),
        "slow" => {
            tokio::time::sleep(SLOW_RESPONSE).await;
            Json(user_json(&login)).into_response()
        }
        _ => Json(user_json(&login)).into_response(),
    }
}

async fn repos(
    Path(login): Path<String>,
    Query(params): Query<HashMap<String, String>>,
    headers: HeaderMap,
) -> Response {
    if let Err(response) = check_token(&headers) {
        return response;
    }
    if login == "ghost" {
        return error(StatusCode::NOT_FOUND, "Not Found");
    }

    let param = |name: &str, default: usize| {
        params
            .get(name)
            .and_then(|value| value.parse().ok())
            .unwrap_or(default)
    };
    let page = param("page", 1).max(1);
    let per_page = param("per_page", 30);
    let total = if login == "prolific" { 150 } else { 3 };

    let repos: Vec<_> = (0..total)
        .skip((page - 1) * per_page)
        .take(per_page)
        .map(|index| repo_json(&login, index))
        .collect();
    Json(repos).into_response()
}
