//! Axum + Askama dashboard over the post store.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::Context;
use aqx_core::{StoredPost, Tag};
use aqx_storage::{DailyKpi, KeywordTagCount, PostQuery, PostStore};
use askama::Template;
use axum::{
    extract::{Path as AxumPath, Query, State},
    http::{header, StatusCode},
    response::{Html, IntoResponse, Response},
    routing::get,
    Json, Router,
};
use chrono::{Duration, NaiveDate, Utc};
use serde::{Deserialize, Serialize};
use tokio::net::TcpListener;
use tracing::{error, info};

pub const CRATE_NAME: &str = "aqx-web";

const CHART_DAYS: i64 = 14;

#[derive(Debug, Clone)]
pub struct WebConfig {
    pub database_url: String,
    pub bind: String,
    pub port: u16,
    pub workspace_root: PathBuf,
    pub reports_dir: PathBuf,
}

impl WebConfig {
    pub fn from_env() -> Self {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Self {
        let workspace_root = lookup("AQX_WORKSPACE_ROOT")
            .map(PathBuf::from)
            .unwrap_or_else(|| PathBuf::from("."));
        Self {
            database_url: lookup("DATABASE_URL")
                .unwrap_or_else(|| "sqlite://scraping.db".to_string()),
            bind: lookup("AQX_WEB_BIND").unwrap_or_else(|| "0.0.0.0".to_string()),
            port: lookup("AQX_WEB_PORT")
                .and_then(|v| v.trim().parse().ok())
                .unwrap_or(8000),
            reports_dir: lookup("AQX_REPORTS_DIR")
                .map(PathBuf::from)
                .unwrap_or_else(|| workspace_root.join("reports")),
            workspace_root,
        }
    }
}

#[derive(Clone)]
pub struct AppState {
    pub store: PostStore,
    pub workspace_root: PathBuf,
    pub reports_dir: PathBuf,
}

impl AppState {
    pub fn new(store: PostStore, workspace_root: impl Into<PathBuf>) -> Self {
        let workspace_root = workspace_root.into();
        Self {
            store,
            reports_dir: workspace_root.join("reports"),
            workspace_root,
        }
    }

    pub fn with_reports_dir(mut self, reports_dir: impl Into<PathBuf>) -> Self {
        self.reports_dir = reports_dir.into();
        self
    }
}

#[derive(Debug, Deserialize, Default)]
struct PostsQuery {
    tag: Option<String>,
    keyword: Option<String>,
    page: Option<usize>,
    per_page: Option<usize>,
}

#[derive(Debug, Deserialize, Default)]
struct KpiQuery {
    day: Option<String>,
    top: Option<i64>,
}

#[derive(Debug, Serialize)]
struct KpiResponse {
    #[serde(flatten)]
    kpi: DailyKpi,
    intent_pct: f64,
    top_keywords: Vec<KeywordTagCount>,
}

#[derive(Template)]
#[template(path = "index.html")]
struct IndexTemplate {
    day: String,
    kpi: DailyKpi,
    intent_pct: String,
    top_keywords: Vec<KeywordTagCount>,
    latest_posts: Vec<StoredPost>,
    latest_run_id: String,
}

#[derive(Template)]
#[template(path = "posts.html")]
struct PostsPageTemplate {
    selected_tag: String,
    keyword: String,
    keywords: Vec<SelectOption>,
    tags: Vec<SelectOption>,
}

#[derive(Debug, Clone)]
struct SelectOption {
    value: String,
    selected: bool,
}

impl SelectOption {
    fn list(values: impl IntoIterator<Item = String>, current: &str) -> Vec<Self> {
        values
            .into_iter()
            .map(|value| Self {
                selected: value == current,
                value,
            })
            .collect()
    }
}

#[derive(Template)]
#[template(path = "posts_table_partial.html")]
struct PostsTablePartialTemplate {
    posts: Vec<StoredPost>,
    total: i64,
    page: usize,
    total_pages: usize,
}

#[derive(Template)]
#[template(path = "posts_facets_partial.html")]
struct PostsFacetsPartialTemplate {
    tag_counts: Vec<FacetCountRow>,
    all_selected: bool,
}

#[derive(Debug, Clone)]
struct FacetCountRow {
    tag: String,
    count: i64,
    selected: bool,
}

#[derive(Template)]
#[template(path = "post_detail.html")]
struct PostDetailTemplate {
    post: StoredPost,
    body_text: String,
    published_text: String,
}

pub fn app(state: AppState) -> Router {
    Router::new()
        .route("/", get(index_handler))
        .route("/posts", get(posts_page_handler))
        .route("/posts/table", get(posts_table_handler))
        .route("/posts/facets", get(posts_facets_handler))
        .route("/posts/{id}", get(post_detail_handler))
        .route("/kpi/chart", get(kpi_chart_handler))
        .route("/api/kpi", get(api_kpi_handler))
        .route("/assets/static/app.css", get(app_css_handler))
        .with_state(Arc::new(state))
}

pub async fn serve(config: WebConfig) -> anyhow::Result<()> {
    let store = PostStore::connect(&config.database_url)
        .await
        .with_context(|| format!("opening database {}", config.database_url))?;
    let state = AppState::new(store, &config.workspace_root).with_reports_dir(&config.reports_dir);
    let listener = TcpListener::bind((config.bind.as_str(), config.port))
        .await
        .with_context(|| format!("binding {}:{}", config.bind, config.port))?;
    info!(bind = %config.bind, port = config.port, "dashboard listening");
    axum::serve(listener, app(state)).await?;
    Ok(())
}

pub async fn serve_from_env() -> anyhow::Result<()> {
    serve(WebConfig::from_env()).await
}

async fn index_handler(State(state): State<Arc<AppState>>) -> Response {
    match load_index(&state).await {
        Ok(tpl) => render_html(tpl),
        Err(err) => server_error(err),
    }
}

async fn load_index(state: &AppState) -> anyhow::Result<IndexTemplate> {
    let day = Utc::now().date_naive();
    let kpi = state.store.daily_kpi(day).await?;
    let top_keywords = state.store.top_keywords(day, 10).await?;
    let latest_posts = state
        .store
        .list(&PostQuery {
            limit: Some(10),
            ..Default::default()
        })
        .await?;
    let latest_run_id = latest_run_id(&state.reports_dir)
        .await?
        .unwrap_or_else(|| "n/a".into());
    Ok(IndexTemplate {
        day: day.to_string(),
        intent_pct: format!("{:.1}", kpi.intent_pct()),
        kpi,
        top_keywords,
        latest_posts,
        latest_run_id,
    })
}

async fn posts_page_handler(
    State(state): State<Arc<AppState>>,
    Query(query): Query<PostsQuery>,
) -> Response {
    match state.store.keywords().await {
        Ok(keywords) => {
            let selected_tag = query.tag.unwrap_or_default();
            let keyword = query.keyword.unwrap_or_default();
            render_html(PostsPageTemplate {
                keywords: SelectOption::list(keywords, &keyword),
                tags: SelectOption::list(Tag::ALL.iter().map(|t| t.to_string()), &selected_tag),
                selected_tag,
                keyword,
            })
        }
        Err(err) => server_error(err.into()),
    }
}

async fn posts_table_handler(
    State(state): State<Arc<AppState>>,
    Query(query): Query<PostsQuery>,
) -> Response {
    let tag = match parse_tag_filter(query.tag.as_deref()) {
        Ok(tag) => tag,
        Err(resp) => return resp,
    };
    let keyword = query
        .keyword
        .as_deref()
        .map(str::trim)
        .filter(|k| !k.is_empty())
        .map(str::to_string);
    let filter = PostQuery {
        tag,
        keyword,
        ..Default::default()
    };

    let total = match state.store.count(&filter).await {
        Ok(total) => total,
        Err(err) => return server_error(err.into()),
    };
    let per_page = query.per_page.unwrap_or(20).clamp(1, 200);
    let total_pages = (total.max(1) as usize).div_ceil(per_page);
    let page = query.page.unwrap_or(1).clamp(1, total_pages);

    let rows = state
        .store
        .list(&PostQuery {
            limit: Some(per_page as i64),
            offset: Some(((page - 1) * per_page) as i64),
            ..filter
        })
        .await;
    match rows {
        Ok(posts) => {
            let mut resp = render_html(PostsTablePartialTemplate {
                posts,
                total,
                page,
                total_pages,
            });
            resp.headers_mut().insert(
                header::HeaderName::from_static("hx-trigger"),
                header::HeaderValue::from_static("postsTableLoaded"),
            );
            resp
        }
        Err(err) => server_error(err.into()),
    }
}

async fn posts_facets_handler(
    State(state): State<Arc<AppState>>,
    Query(query): Query<PostsQuery>,
) -> Response {
    let selected = match parse_tag_filter(query.tag.as_deref()) {
        Ok(tag) => tag,
        Err(resp) => return resp,
    };
    match state.store.tag_counts().await {
        Ok(counts) => render_html(PostsFacetsPartialTemplate {
            tag_counts: facet_rows(&counts, selected),
            all_selected: selected.is_none(),
        }),
        Err(err) => server_error(err.into()),
    }
}

async fn post_detail_handler(
    State(state): State<Arc<AppState>>,
    AxumPath(id): AxumPath<String>,
) -> Response {
    match state.store.get(&id).await {
        Ok(Some(post)) => {
            let body_text = post.post.body.clone().unwrap_or_else(|| "none".to_string());
            let published_text = post
                .post
                .published_at
                .map(|ts| ts.to_rfc3339())
                .unwrap_or_else(|| "unknown".to_string());
            render_html(PostDetailTemplate {
                post,
                body_text,
                published_text,
            })
        }
        Ok(None) => (StatusCode::NOT_FOUND, Html("Post not found".to_string())).into_response(),
        Err(err) => server_error(err.into()),
    }
}

async fn kpi_chart_handler(State(state): State<Arc<AppState>>) -> Response {
    let to = Utc::now().date_naive();
    let from = to - Duration::days(CHART_DAYS - 1);
    match state.store.kpi_series(from, to).await {
        Ok(series) => Json(kpi_chart(from, to, series)).into_response(),
        Err(err) => server_error(err.into()),
    }
}

async fn api_kpi_handler(
    State(state): State<Arc<AppState>>,
    Query(query): Query<KpiQuery>,
) -> Response {
    let day = match query.day.as_deref().map(str::trim).filter(|d| !d.is_empty()) {
        None => Utc::now().date_naive(),
        Some(raw) => match NaiveDate::parse_from_str(raw, "%Y-%m-%d") {
            Ok(day) => day,
            Err(_) => {
                return (
                    StatusCode::BAD_REQUEST,
                    Json(serde_json::json!({
                        "error": format!("invalid day {raw:?}, expected YYYY-MM-DD")
                    })),
                )
                    .into_response()
            }
        },
    };
    let top = query.top.unwrap_or(10).clamp(1, 100);

    let kpi = match state.store.daily_kpi(day).await {
        Ok(kpi) => kpi,
        Err(err) => return server_error(err.into()),
    };
    match state.store.top_keywords(day, top).await {
        Ok(top_keywords) => Json(KpiResponse {
            intent_pct: kpi.intent_pct(),
            kpi,
            top_keywords,
        })
        .into_response(),
        Err(err) => server_error(err.into()),
    }
}

async fn app_css_handler(State(state): State<Arc<AppState>>) -> Response {
    let css_path = state.workspace_root.join("assets/static/app.css");
    match tokio::fs::read_to_string(&css_path).await {
        Ok(css) => ([(header::CONTENT_TYPE, "text/css; charset=utf-8")], css).into_response(),
        Err(_) => {
            (StatusCode::NOT_FOUND, Html("/* missing app.css */".to_string())).into_response()
        }
    }
}

fn parse_tag_filter(raw: Option<&str>) -> Result<Option<Tag>, Response> {
    match raw.map(str::trim).filter(|t| !t.is_empty()) {
        None => Ok(None),
        Some(raw) => raw.parse::<Tag>().map(Some).map_err(|err| {
            (StatusCode::BAD_REQUEST, Html(format!("Bad request: {err}"))).into_response()
        }),
    }
}

fn facet_rows(counts: &BTreeMap<Tag, i64>, selected: Option<Tag>) -> Vec<FacetCountRow> {
    Tag::ALL
        .iter()
        .map(|tag| FacetCountRow {
            tag: tag.to_string(),
            count: counts.get(tag).copied().unwrap_or(0),
            selected: selected == Some(*tag),
        })
        .collect()
}

/// Plotly stacked bars, one trace per tag, zero-filled for days without posts.
fn kpi_chart(from: NaiveDate, to: NaiveDate, series: Vec<DailyKpi>) -> serde_json::Value {
    let by_day = series
        .into_iter()
        .map(|kpi| (kpi.day, kpi))
        .collect::<BTreeMap<_, _>>();
    let days = from
        .iter_days()
        .take_while(|d| *d <= to)
        .map(|d| by_day.get(&d).cloned().unwrap_or_else(|| DailyKpi::empty(d)))
        .collect::<Vec<_>>();
    let x = days.iter().map(|k| k.day.to_string()).collect::<Vec<_>>();

    let trace = |name: &str, color: &str, pick: fn(&DailyKpi) -> i64| {
        serde_json::json!({
            "type": "bar",
            "name": name,
            "x": x,
            "y": days.iter().map(pick).collect::<Vec<_>>(),
            "marker": {"color": color}
        })
    };
    serde_json::json!({
        "data": [
            trace("pain", "#ef4444", |k| k.pain),
            trace("active_search", "#0ea5e9", |k| k.active_search),
            trace("objection", "#f59e0b", |k| k.objection),
            trace("noise", "#94a3b8", |k| k.noise),
        ],
        "layout": {
            "title": "Posts per day by intent",
            "barmode": "stack",
            "paper_bgcolor": "#ffffff",
            "plot_bgcolor": "#f8fafc"
        }
    })
}

/// Newest run directory under `reports_dir` that holds a `run_summary.json`.
/// Most recently modified `<reports_dir>/<run_id>/` that holds a `run_summary.json`.
async fn latest_run_id(reports_dir: &Path) -> anyhow::Result<Option<String>> {
    let mut dir = match tokio::fs::read_dir(reports_dir).await {
        Ok(dir) => dir,
        Err(err) if err.kind() == std::io::ErrorKind::NotFound => return Ok(None),
        Err(err) => {
            return Err(err).with_context(|| format!("listing {}", reports_dir.display()))
        }
    };

    let mut latest = None;
    while let Some(entry) = dir
        .next_entry()
        .await
        .with_context(|| format!("listing {}", reports_dir.display()))?
    {
        let summary = tokio::fs::metadata(entry.path().join("run_summary.json")).await;
        if !summary.map(|m| m.is_file()).unwrap_or(false) {
            continue;
        }
        let modified = entry.metadata().await.and_then(|m| m.modified()).ok();
        let name = entry.file_name().to_string_lossy().to_string();
        let candidate = (modified, name);
        if latest.as_ref().map_or(true, |current| &candidate > current) {
            latest = Some(candidate);
        }
    }
    Ok(latest.map(|(_, name)| name))
}

fn render_html<T: Template>(tpl: T) -> Response {
    match tpl.render() {
        Ok(html) => Html(html).into_response(),
        Err(err) => server_error(anyhow::anyhow!(err.to_string())),
    }
}

fn server_error(err: anyhow::Error) -> Response {
    error!(error = %err, "dashboard request failed");
    (
        StatusCode::INTERNAL_SERVER_ERROR,
        Html(format!("Server error: {}", err)),
    )
        .into_response()
}
