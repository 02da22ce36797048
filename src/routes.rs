use std::collections::HashMap;
use std::sync::Arc;

use askama::Template;
use axum::{
    extract::{Query, State},
    http::StatusCode,
    response::{Html, IntoResponse, Redirect, Response},
    routing::{get, post},
    Form, Router,
};
use serde::Deserialize;
use tower_http::{services::ServeDir, trace::TraceLayer};
use tracing::{debug, warn};

use crate::feed::{is_valid_url, FeedSource, NewsEntry};
use crate::fetcher::Fetcher;
use crate::store::{FeedEdit, Settings, Store};

pub struct AppState {
    pub store: Arc<Store>,
    pub fetcher: Arc<Fetcher>,
    pub max_feeds: usize,
}

pub fn router(state: Arc<AppState>) -> Router {
    Router::new()
        .route("/", get(root))
        .route("/news", get(news))
        .route("/news/reload", get(news_reload))
        .route("/news/settings", get(settings_page).post(settings_form))
        .route("/news/refresh", post(refresh))
        .route("/news/refresh/status", get(refresh_status))
        .route("/health", get(health))
        .nest_service("/news/static", ServeDir::new("static"))
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

// Template structs
#[derive(Template)]
#[template(path = "news.html")]
pub struct NewsTemplate {
    pub feeds: Vec<FeedSource>,
    pub feed_idx: usize,
    pub feed: FeedSource,
    pub entries: Vec<NewsEntry>,
}

#[derive(Template)]
#[template(path = "settings.html")]
pub struct SettingsTemplate {
    pub feeds: Vec<FeedSource>,
    pub remote_access: bool,
    pub auto_update: bool,
    pub can_add: bool,
    pub max_feeds: usize,
    pub refreshing: bool,
    pub version: &'static str,
}

#[derive(Template)]
#[template(path = "refresh_status.html")]
pub struct RefreshStatusTemplate {
    pub refreshing: bool,
}

// Wrapper for HTML responses
struct HtmlTemplate<T>(T);

impl<T: Template> IntoResponse for HtmlTemplate<T> {
    fn into_response(self) -> Response {
        match self.0.render() {
            Ok(html) => Html(html).into_response(),
            Err(err) => (
                StatusCode::INTERNAL_SERVER_ERROR,
                format!("Failed to render template: {}", err),
            )
                .into_response(),
        }
    }
}

// Custom error type
pub struct AppError(anyhow::Error);

impl IntoResponse for AppError {
    fn into_response(self) -> Response {
        (
            StatusCode::INTERNAL_SERVER_ERROR,
            format!("Error: {}", self.0),
        )
            .into_response()
    }
}

impl<E: Into<anyhow::Error>> From<E> for AppError {
    fn from(err: E) -> Self {
        AppError(err.into())
    }
}

#[derive(Deserialize)]
pub struct FeedQuery {
    pub feed: Option<String>,
}

/// Turns a user-supplied index into a position in a list of `len` feeds.
pub fn sanitize_feed_idx(len: usize, idx: Option<&str>) -> Option<usize> {
    let idx: usize = idx?.trim().parse().ok()?;
    (idx < len).then_some(idx)
}

/// Index of `idx` if it names an active feed.
fn active_feed_idx(feeds: &[FeedSource], idx: Option<&str>) -> Option<usize> {
    sanitize_feed_idx(feeds.len(), idx).filter(|&i| feeds[i].active)
}

/// Target for a missing, invalid or inactive feed index: the first active
/// feed, or the settings page when there is none.
fn fallback_redirect(feeds: &[FeedSource]) -> Redirect {
    match feeds.iter().position(|f| f.active) {
        Some(idx) => Redirect::to(&format!("/news?feed={}", idx)),
        None => Redirect::to("/news/settings"),
    }
}

// Route handlers
pub async fn root() -> Redirect {
    Redirect::to("/news")
}

pub async fn news(
    State(state): State<Arc<AppState>>,
    Query(query): Query<FeedQuery>,
) -> Result<Response, AppError> {
    let feeds = state.store.feeds().await;
    let Some(feed_idx) = active_feed_idx(&feeds, query.feed.as_deref()) else {
        return Ok(fallback_redirect(&feeds).into_response());
    };

    if state.store.settings().await.auto_update {
        // A failure is stored on the feed and shown on the page
        if let Err(e) = state.fetcher.refresh_feed(&feeds[feed_idx]).await {
            debug!("Auto update of '{}' failed: {}", feeds[feed_idx].name, e);
        }
    }

    let feeds = state.store.feeds().await;
    let Some(feed) = feeds.get(feed_idx).filter(|f| f.active).cloned() else {
        return Ok(fallback_redirect(&feeds).into_response());
    };
    let entries = state.store.entries(&feed.id).await;

    Ok(HtmlTemplate(NewsTemplate {
        feeds,
        feed_idx,
        feed,
        entries,
    })
    .into_response())
}

pub async fn news_reload(
    State(state): State<Arc<AppState>>,
    Query(query): Query<FeedQuery>,
) -> Redirect {
    let feeds = state.store.feeds().await;
    let Some(feed_idx) = active_feed_idx(&feeds, query.feed.as_deref()) else {
        return fallback_redirect(&feeds);
    };

    if let Err(e) = state.fetcher.refresh_feed(&feeds[feed_idx]).await {
        debug!("Reload of '{}' failed: {}", feeds[feed_idx].name, e);
    }

    Redirect::to(&format!("/news?feed={}", feed_idx))
}

pub async fn settings_page(
    State(state): State<Arc<AppState>>,
) -> Result<impl IntoResponse, AppError> {
    let settings = state.store.settings().await;
    let feeds = state.store.feeds().await;

    Ok(HtmlTemplate(SettingsTemplate {
        can_add: feeds.len() < state.max_feeds,
        feeds,
        remote_access: settings.remote_access,
        auto_update: settings.auto_update,
        max_feeds: state.max_feeds,
        refreshing: state.fetcher.is_refreshing().await,
        version: env!("CARGO_PKG_VERSION"),
    }))
}

fn form_edits(form: &HashMap<String, String>, count: usize) -> Vec<FeedEdit> {
    (0..count)
        .map(|i| FeedEdit {
            position: form
                .get(&format!("position_{}", i))
                .and_then(|p| p.trim().parse().ok())
                .unwrap_or(i as i64),
            url: form
                .get(&format!("url_{}", i))
                .map(|u| u.trim().to_string())
                .unwrap_or_default(),
            active: form.contains_key(&format!("active_{}", i)),
        })
        .collect()
}

pub async fn settings_form(
    State(state): State<Arc<AppState>>,
    Form(form): Form<HashMap<String, String>>,
) -> Result<Redirect, AppError> {
    match form.get("action").map(String::as_str) {
        Some("save_settings") => {
            let settings = Settings {
                remote_access: form.contains_key("remote_access"),
                auto_update: form.contains_key("auto_update"),
            };
            state.store.update_settings(settings).await?;
            Ok(Redirect::to("/news/settings"))
        }
        Some("clear_all_news") => {
            state.store.clear_news().await?;
            Ok(Redirect::to("/news/settings"))
        }
        Some("save_feedlist") => {
            let count = state.store.feeds().await.len();
            state
                .store
                .update_feed_list(&form_edits(&form, count))
                .await?;
            Ok(Redirect::to("/news/settings#newsfeeds"))
        }
        Some("add_feed") => {
            let url = form.get("new_url").map(|u| u.trim()).unwrap_or_default();
            let name = form
                .get("new_name")
                .map(|n| n.trim())
                .filter(|n| !n.is_empty())
                .unwrap_or(url);
            let active = form.contains_key("new_feed_active");

            if is_valid_url(url) {
                state
                    .store
                    .add_feed(name, url, active, state.max_feeds)
                    .await?;
            } else {
                warn!("Invalid feed URL '{}', submit of new feed was ignored", url);
            }
            Ok(Redirect::to("/news/settings#add_feed"))
        }
        _ => {
            if let Some(idx) = form.get("remove_feed") {
                let count = state.store.feeds().await.len();
                if let Some(idx) = sanitize_feed_idx(count, Some(idx)) {
                    state.store.remove_feed(idx).await?;
                }
                return Ok(Redirect::to("/news/settings#newsfeeds"));
            }
            Ok(Redirect::to("/news/settings"))
        }
    }
}

/// Starts a refresh of all active feeds in the background.
pub async fn refresh(State(state): State<Arc<AppState>>) -> Redirect {
    let fetcher = state.fetcher.clone();
    tokio::spawn(async move {
        if let Err(e) = fetcher.refresh_all_feeds().await {
            warn!("Refresh of all feeds failed: {}", e);
        }
    });

    Redirect::to("/news/settings#refresh")
}

pub async fn refresh_status(
    State(state): State<Arc<AppState>>,
) -> Result<impl IntoResponse, AppError> {
    let refreshing = state.fetcher.is_refreshing().await;
    Ok(HtmlTemplate(RefreshStatusTemplate { refreshing }))
}

pub async fn health() -> impl IntoResponse {
    Html("OK")
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::feed::ParseOptions;
    use axum::{
        body::Body,
        http::{header, Request, StatusCode},
    };
    use http_body_util::BodyExt;
    use tempfile::TempDir;
    use tower::ServiceExt;
    use wiremock::matchers::{method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    async fn create_test_app() -> (Router, Arc<Store>, TempDir) {
        let dir = tempfile::tempdir().unwrap();
        let store = Arc::new(Store::open(dir.path()).await.unwrap());
        let fetcher = Arc::new(Fetcher::new(store.clone(), ParseOptions::default()).unwrap());
        let state = Arc::new(AppState {
            store: store.clone(),
            fetcher,
            max_feeds: 3,
        });

        (router(state), store, dir)
    }

    async fn setup_test_data(store: &Store) {
        store
            .add_feed("Test Feed 1", "https://feed1.com/rss", true, 50)
            .await
            .unwrap();
        store
            .add_feed("Test Feed 2", "https://feed2.com/rss", false, 50)
            .await
            .unwrap();

        let feeds = store.feeds().await;
        let entries = (1..=20)
            .map(|i| NewsEntry {
                title: format!("Article {}", i),
                summary: format!("Summary {}", i),
                link: format!("https://article{}.com", i),
                published: "2024-12-09T10:00:00Z".to_string(),
                updated: "2024-12-09T10:00:00Z".to_string(),
            })
            .collect();
        store.record_success(&feeds[0].id, entries).await.unwrap();
    }

    async fn send_get(app: Router, uri: &str) -> Response {
        app.oneshot(Request::builder().uri(uri).body(Body::empty()).unwrap())
            .await
            .unwrap()
    }

    async fn post_form(app: Router, body: &str) -> Response {
        app.oneshot(
            Request::builder()
                .method("POST")
                .uri("/news/settings")
                .header(header::CONTENT_TYPE, "application/x-www-form-urlencoded")
                .body(Body::from(body.to_string()))
                .unwrap(),
        )
        .await
        .unwrap()
    }

    fn location(response: &Response) -> &str {
        response
            .headers()
            .get(header::LOCATION)
            .unwrap()
            .to_str()
            .unwrap()
    }

    async fn body_string(response: Response) -> String {
        let body = response.into_body().collect().await.unwrap().to_bytes();
        String::from_utf8(body.to_vec()).unwrap()
    }

    mod health_tests {
        use super::*;

        #[tokio::test]
        async fn test_health_endpoint() {
            let (app, _store, _dir) = create_test_app().await;

            let response = send_get(app, "/health").await;
            assert_eq!(response.status(), StatusCode::OK);
            assert_eq!(body_string(response).await, "OK");
        }

        #[tokio::test]
        async fn test_root_redirects_to_news() {
            let (app, _store, _dir) = create_test_app().await;

            let response = send_get(app, "/").await;
            assert_eq!(response.status(), StatusCode::SEE_OTHER);
            assert_eq!(location(&response), "/news");
        }
    }

    mod news_tests {
        use super::*;

        #[tokio::test]
        async fn test_no_feeds_redirects_to_settings() {
            let (app, _store, _dir) = create_test_app().await;

            let response = send_get(app, "/news").await;
            assert_eq!(response.status(), StatusCode::SEE_OTHER);
            assert_eq!(location(&response), "/news/settings");
        }

        #[tokio::test]
        async fn test_invalid_index_redirects() {
            let (app, store, _dir) = create_test_app().await;
            setup_test_data(&store).await;

            for uri in ["/news", "/news?feed=7", "/news?feed=-1", "/news?feed=abc"] {
                let response = send_get(app.clone(), uri).await;
                assert_eq!(response.status(), StatusCode::SEE_OTHER, "{}", uri);
                assert_eq!(location(&response), "/news?feed=0");
            }
        }

        #[tokio::test]
        async fn test_shows_feed_entries() {
            let (app, store, _dir) = create_test_app().await;
            setup_test_data(&store).await;

            let response = send_get(app, "/news?feed=0").await;
            assert_eq!(response.status(), StatusCode::OK);

            let body = body_string(response).await;
            assert!(body.contains("Test Feed 1"));
            // inactive feeds get no tab
            assert!(!body.contains("Test Feed 2"));
            assert!(body.contains("Article 20"));
            assert!(body.contains("article1.com"));
        }

        #[tokio::test]
        async fn test_inactive_feed_redirects_to_active_one() {
            let (app, store, _dir) = create_test_app().await;
            setup_test_data(&store).await;

            let response = send_get(app, "/news?feed=1").await;
            assert_eq!(response.status(), StatusCode::SEE_OTHER);
            assert_eq!(location(&response), "/news?feed=0");
        }

        #[tokio::test]
        async fn test_inactive_first_feed_is_neither_shown_nor_fetched() {
            let server = MockServer::start().await;
            Mock::given(method("GET"))
                .respond_with(ResponseTemplate::new(200).set_body_string(
                    r#"<rss version="2.0"><channel>
                        <item><title>Should stay unseen</title></item>
                    </channel></rss>"#,
                ))
                .expect(0)
                .mount(&server)
                .await;

            let (app, store, _dir) = create_test_app().await;
            store
                .add_feed("Off", &format!("{}/rss.xml", server.uri()), false, 50)
                .await
                .unwrap();
            store
                .add_feed("On", "https://on.example.com/rss", true, 50)
                .await
                .unwrap();
            store
                .update_settings(Settings {
                    remote_access: false,
                    auto_update: true,
                })
                .await
                .unwrap();

            for uri in ["/news", "/news?feed=0", "/news?feed=9", "/news/reload?feed=0"] {
                let response = send_get(app.clone(), uri).await;
                assert_eq!(response.status(), StatusCode::SEE_OTHER, "{}", uri);
                assert_eq!(location(&response), "/news?feed=1", "{}", uri);
            }
        }

        #[tokio::test]
        async fn test_no_active_feeds_redirects_to_settings() {
            let (app, store, _dir) = create_test_app().await;
            store
                .add_feed("Off", "https://off.example.com/rss", false, 50)
                .await
                .unwrap();

            for uri in ["/news", "/news?feed=0", "/news/reload?feed=0"] {
                let response = send_get(app.clone(), uri).await;
                assert_eq!(location(&response), "/news/settings", "{}", uri);
            }
        }

        #[tokio::test]
        async fn test_entries_are_escaped() {
            let (app, store, _dir) = create_test_app().await;
            let feed = store
                .add_feed("Feed", "https://feed.example.com/rss", true, 50)
                .await
                .unwrap()
                .unwrap();
            let entry = NewsEntry {
                title: "Tom &amp; <script>".to_string(),
                ..Default::default()
            };
            store.record_success(&feed.id, vec![entry]).await.unwrap();

            let body = body_string(send_get(app, "/news?feed=0").await).await;
            assert!(!body.contains("<script>"));
        }

        #[tokio::test]
        async fn test_auto_update_fetches_feed() {
            let server = MockServer::start().await;
            Mock::given(method("GET"))
                .and(path("/rss.xml"))
                .respond_with(ResponseTemplate::new(200).set_body_string(
                    r#"<rss version="2.0"><channel>
                        <item><title>Fresh from the wire</title></item>
                    </channel></rss>"#,
                ))
                .expect(1)
                .mount(&server)
                .await;

            let (app, store, _dir) = create_test_app().await;
            store
                .add_feed("Mock", &format!("{}/rss.xml", server.uri()), true, 50)
                .await
                .unwrap();
            store
                .update_settings(Settings {
                    remote_access: false,
                    auto_update: true,
                })
                .await
                .unwrap();

            let body = body_string(send_get(app, "/news?feed=0").await).await;
            assert!(body.contains("Fresh from the wire"));
        }

        #[tokio::test]
        async fn test_failed_update_is_shown() {
            let server = MockServer::start().await;
            Mock::given(method("GET"))
                .respond_with(ResponseTemplate::new(500))
                .mount(&server)
                .await;

            let (app, store, _dir) = create_test_app().await;
            store
                .add_feed("Mock", &format!("{}/rss.xml", server.uri()), true, 50)
                .await
                .unwrap();

            let response = send_get(app.clone(), "/news/reload?feed=0").await;
            assert_eq!(response.status(), StatusCode::SEE_OTHER);
            assert_eq!(location(&response), "/news?feed=0");

            let body = body_string(send_get(app, "/news?feed=0").await).await;
            assert!(body.contains("Update failed"));
        }
    }

    mod settings_tests {
        use super::*;

        #[tokio::test]
        async fn test_settings_page() {
            let (app, store, _dir) = create_test_app().await;
            setup_test_data(&store).await;

            let response = send_get(app, "/news/settings").await;
            assert_eq!(response.status(), StatusCode::OK);

            let body = body_string(response).await;
            assert!(body.contains("feed1.com"));
            assert!(body.contains(env!("CARGO_PKG_VERSION")));
        }

        #[tokio::test]
        async fn test_save_settings() {
            let (app, store, _dir) = create_test_app().await;

            let response = post_form(app, "action=save_settings&auto_update=on").await;
            assert_eq!(response.status(), StatusCode::SEE_OTHER);
            assert_eq!(location(&response), "/news/settings");

            let settings = store.settings().await;
            assert!(settings.auto_update);
            assert!(!settings.remote_access);
        }

        #[tokio::test]
        async fn test_add_feed() {
            let (app, store, _dir) = create_test_app().await;

            let response = post_form(
                app,
                "action=add_feed&new_name=Blog&new_url=https%3A%2F%2Fblog.example.com%2Ffeed&new_feed_active=on",
            )
            .await;
            assert_eq!(location(&response), "/news/settings#add_feed");

            let feeds = store.feeds().await;
            assert_eq!(feeds.len(), 1);
            assert_eq!(feeds[0].name, "Blog");
            assert!(feeds[0].active);
        }

        #[tokio::test]
        async fn test_add_feed_invalid_url_ignored() {
            let (app, store, _dir) = create_test_app().await;

            post_form(app, "action=add_feed&new_name=Bad&new_url=not+a+url").await;
            assert!(store.feeds().await.is_empty());
        }

        #[tokio::test]
        async fn test_add_feed_limit() {
            let (app, store, _dir) = create_test_app().await;
            for i in 0..4 {
                let body = format!(
                    "action=add_feed&new_name=F{}&new_url=https%3A%2F%2Ff{}.example.com%2Frss",
                    i, i
                );
                post_form(app.clone(), &body).await;
            }

            assert_eq!(store.feeds().await.len(), 3);
        }

        #[tokio::test]
        async fn test_save_feedlist() {
            let (app, store, _dir) = create_test_app().await;
            setup_test_data(&store).await;
            let old_id = store.feed(0).await.unwrap().id;

            let response = post_form(
                app,
                "action=save_feedlist\
                 &position_0=2&url_0=https%3A%2F%2Ffeed1.com%2Fatom&active_0=on\
                 &position_1=1&url_1=https%3A%2F%2Ffeed2.com%2Frss",
            )
            .await;
            assert_eq!(location(&response), "/news/settings#newsfeeds");

            let feeds = store.feeds().await;
            assert_eq!(feeds[0].name, "Test Feed 2");
            assert!(!feeds[0].active);
            assert_eq!(feeds[1].url, "https://feed1.com/atom");
            assert_ne!(feeds[1].id, old_id);
            assert_eq!(store.entries(&feeds[1].id).await.len(), 20);
            assert!(store.entries(&old_id).await.is_empty());
        }

        #[tokio::test]
        async fn test_remove_feed() {
            let (app, store, _dir) = create_test_app().await;
            setup_test_data(&store).await;
            let removed_id = store.feed(0).await.unwrap().id;

            let response = post_form(app, "remove_feed=0").await;
            assert_eq!(location(&response), "/news/settings#newsfeeds");

            let feeds = store.feeds().await;
            assert_eq!(feeds.len(), 1);
            assert_eq!(feeds[0].name, "Test Feed 2");
            assert!(store.entries(&removed_id).await.is_empty());
        }

        #[tokio::test]
        async fn test_remove_invalid_index() {
            let (app, store, _dir) = create_test_app().await;
            setup_test_data(&store).await;

            post_form(app, "remove_feed=9").await;
            assert_eq!(store.feeds().await.len(), 2);
        }

        #[tokio::test]
        async fn test_clear_all_news() {
            let (app, store, _dir) = create_test_app().await;
            setup_test_data(&store).await;

            post_form(app, "action=clear_all_news").await;

            let feeds = store.feeds().await;
            assert!(store.entries(&feeds[0].id).await.is_empty());
            assert!(feeds[0].last_updated.is_none());
        }

        #[tokio::test]
        async fn test_unknown_action() {
            let (app, _store, _dir) = create_test_app().await;

            let response = post_form(app, "action=explode").await;
            assert_eq!(location(&response), "/news/settings");
        }
    }

    mod refresh_tests {
        use super::*;

        #[tokio::test]
        async fn test_refresh_status_when_idle() {
            let (app, _store, _dir) = create_test_app().await;

            let response = send_get(app, "/news/refresh/status").await;
            assert_eq!(response.status(), StatusCode::OK);
            assert!(body_string(response).await.contains("Refresh all feeds"));
        }

        #[tokio::test]
        async fn test_refresh_fetches_active_feeds() {
            let server = MockServer::start().await;
            Mock::given(method("GET"))
                .and(path("/rss.xml"))
                .respond_with(ResponseTemplate::new(200).set_body_string(
                    r#"<rss version="2.0"><channel>
                        <item><title>Refreshed</title></item>
                    </channel></rss>"#,
                ))
                .mount(&server)
                .await;

            let (app, store, _dir) = create_test_app().await;
            let feed = store
                .add_feed("Mock", &format!("{}/rss.xml", server.uri()), true, 50)
                .await
                .unwrap()
                .unwrap();

            let response = app
                .oneshot(
                    Request::builder()
                        .method("POST")
                        .uri("/news/refresh")
                        .body(Body::empty())
                        .unwrap(),
                )
                .await
                .unwrap();
            assert_eq!(response.status(), StatusCode::SEE_OTHER);
            assert_eq!(location(&response), "/news/settings#refresh");

            for _ in 0..50 {
                if !store.entries(&feed.id).await.is_empty() {
                    break;
                }
                tokio::time::sleep(std::time::Duration::from_millis(50)).await;
            }
            assert_eq!(store.entries(&feed.id).await[0].title, "Refreshed");
        }
    }

    mod helper_tests {
        use super::*;

        #[test]
        fn test_sanitize_feed_idx() {
            assert_eq!(sanitize_feed_idx(3, Some("0")), Some(0));
            assert_eq!(sanitize_feed_idx(3, Some(" 2 ")), Some(2));
            assert_eq!(sanitize_feed_idx(3, Some("3")), None);
            assert_eq!(sanitize_feed_idx(3, Some("-1")), None);
            assert_eq!(sanitize_feed_idx(3, Some("x")), None);
            assert_eq!(sanitize_feed_idx(3, None), None);
            assert_eq!(sanitize_feed_idx(0, Some("0")), None);
        }

        #[test]
        fn test_feed_query() {
            let query: FeedQuery = serde_urlencoded::from_str("feed=4").unwrap();
            assert_eq!(query.feed.as_deref(), Some("4"));

            let query: FeedQuery = serde_urlencoded::from_str("").unwrap();
            assert!(query.feed.is_none());
        }

        #[test]
        fn test_form_edits_defaults() {
            let form: HashMap<String, String> =
                serde_urlencoded::from_str("position_0=x&url_1=%20https%3A%2F%2Fa.com%20&active_1=on")
                    .unwrap();

            let edits = form_edits(&form, 2);
            assert_eq!(edits[0].position, 0);
            assert_eq!(edits[0].url, "");
            assert!(!edits[0].active);
            assert_eq!(edits[1].position, 1);
            assert_eq!(edits[1].url, "https://a.com");
            assert!(edits[1].active);
        }
    }
}
