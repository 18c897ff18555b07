//! Intent tagging plus the discover -> tag -> store run pipeline, reports, and exports.

pub mod alerts;

use std::collections::BTreeMap;
use std::fs::File;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use aqx_adapters::{AdapterContext, DuckDuckGoSource, FixtureSource, SearchSource};
use aqx_core::{
    canonicalize, fold_accents, fold_for_matching, tagging_text, ScrapedItem, StoredPost, Tag,
    TaggedPost,
};
use aqx_storage::{
    HttpClientConfig, HttpFetcher, InsertOutcome, PostSink, PostStore, TokenBucketConfig,
};
use arrow_array::{RecordBatch, StringArray};
use arrow_schema::{DataType, Field as ArrowField, Schema};
use chrono::{DateTime, NaiveDate, Utc};
use parquet::arrow::ArrowWriter;
use regex::{RegexBuilder, RegexSet, RegexSetBuilder};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use thiserror::Error;
use tokio::fs;
use tokio_cron_scheduler::{Job, JobScheduler};
use tracing::{error, info, info_span, warn, Instrument};
use uuid::Uuid;

use crate::alerts::{daily_summary_message, lead_message, TelegramConfig, TelegramNotifier};

pub const CRATE_NAME: &str = "aqx-sync";

/// Built-in rule set; the same file operators edit under `rules/`.
pub const DEFAULT_RULES_YAML: &str = include_str!("../../../rules/intent.yaml");

/// Category precedence when several rule sets match. Noise is the fallback, never matched.
pub const TAG_PRIORITY: [Tag; 3] = [Tag::Pain, Tag::ActiveSearch, Tag::Objection];

pub const DEFAULT_KEYWORDS: [&str; 3] = [
    "limpieza de piscina lima",
    "agencia marketing lima",
    "dashboard pymes peru",
];

#[derive(Debug, Clone, Deserialize)]
pub struct IntentRulesFile {
    pub version: u32,
    #[serde(default)]
    pub rules: Vec<IntentRule>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct IntentRule {
    pub tag: Tag,
    pub patterns: Vec<String>,
}

#[derive(Debug, Error)]
pub enum RulesError {
    #[error("reading rules file {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("parsing rules yaml: {0}")]
    Yaml(#[from] serde_yaml::Error),
    #[error("`noise` is the fallback tag and cannot carry rules")]
    NoiseRule,
    #[error("invalid pattern {pattern:?} for tag {tag}: {source}")]
    Pattern {
        tag: Tag,
        pattern: String,
        #[source]
        source: regex::Error,
    },
}

/// Seam between the pipeline and whatever assigns intent tags.
pub trait IntentClassifier: Send + Sync {
    fn classify(&self, title: &str, body: Option<&str>) -> Tag;
}

/// Ordered regex rule sets; the first category in [`TAG_PRIORITY`] with a match wins.
#[derive(Debug, Clone)]
pub struct IntentTagger {
    categories: Vec<(Tag, RegexSet)>,
}

impl IntentTagger {
    pub fn builtin() -> Result<Self, RulesError> {
        Self::from_yaml_str(DEFAULT_RULES_YAML)
    }

    pub fn from_path(path: impl AsRef<Path>) -> Result<Self, RulesError> {
        let path = path.as_ref();
        let yaml = std::fs::read_to_string(path).map_err(|source| RulesError::Io {
            path: path.to_path_buf(),
            source,
        })?;
        Self::from_yaml_str(&yaml)
    }

    pub fn from_yaml_str(yaml: &str) -> Result<Self, RulesError> {
        let file: IntentRulesFile = serde_yaml::from_str(yaml)?;
        Self::from_rules(file)
    }

    pub fn from_rules(file: IntentRulesFile) -> Result<Self, RulesError> {
        let mut by_tag: BTreeMap<Tag, Vec<String>> = BTreeMap::new();
        for rule in file.rules {
            if rule.tag == Tag::Noise {
                return Err(RulesError::NoiseRule);
            }
            by_tag.entry(rule.tag).or_default().extend(rule.patterns);
        }

        let mut categories = Vec::new();
        for tag in TAG_PRIORITY {
            let Some(patterns) = by_tag.remove(&tag) else {
                continue;
            };
            let folded = patterns.iter().map(|p| fold_accents(p)).collect::<Vec<_>>();
            // Compile one by one first so a bad pattern is reported by name.
            for (original, pattern) in patterns.iter().zip(&folded) {
                RegexBuilder::new(pattern)
                    .case_insensitive(true)
                    .build()
                    .map_err(|source| RulesError::Pattern {
                        tag,
                        pattern: original.clone(),
                        source,
                    })?;
            }
            let set = RegexSetBuilder::new(&folded)
                .case_insensitive(true)
                .build()
                .map_err(|source| RulesError::Pattern {
                    tag,
                    pattern: folded.join(" | "),
                    source,
                })?;
            categories.push((tag, set));
        }
        Ok(Self { categories })
    }

    pub fn tag_text(&self, text: &str) -> Tag {
        let folded = fold_for_matching(text);
        self.categories
            .iter()
            .find(|(_, set)| set.is_match(&folded))
            .map(|(tag, _)| *tag)
            .unwrap_or(Tag::Noise)
    }

    pub fn tag(&self, title: &str, body: Option<&str>) -> Tag {
        self.tag_text(&tagging_text(title, body))
    }

    /// (tag, pattern count) in evaluation order.
    pub fn rule_counts(&self) -> Vec<(Tag, usize)> {
        self.categories
            .iter()
            .map(|(tag, set)| (*tag, set.len()))
            .collect()
    }
}

impl IntentClassifier for IntentTagger {
    fn classify(&self, title: &str, body: Option<&str>) -> Tag {
        self.tag(title, body)
    }
}

#[derive(Debug, Clone)]
pub struct RunConfig {
    pub database_url: String,
    pub keywords: Vec<String>,
    pub max_per_keyword: usize,
    pub user_agent: String,
    pub http_timeout_secs: u64,
    pub rules_path: Option<PathBuf>,
    pub fixtures_path: Option<PathBuf>,
    pub reports_dir: PathBuf,
    pub scheduler_enabled: bool,
    pub sync_cron: String,
    pub telegram: Option<TelegramConfig>,
}

impl RunConfig {
    pub fn from_env() -> Self {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Self {
        let keywords = lookup("KEYWORDS")
            .map(|raw| parse_keywords(&raw))
            .filter(|k| !k.is_empty())
            .unwrap_or_else(|| DEFAULT_KEYWORDS.iter().map(|k| k.to_string()).collect());
        Self {
            database_url: lookup("DATABASE_URL")
                .unwrap_or_else(|| "sqlite://scraping.db".to_string()),
            keywords,
            max_per_keyword: lookup("MAX_PER_KW")
                .and_then(|v| v.trim().parse().ok())
                .unwrap_or(30),
            user_agent: lookup("AQX_USER_AGENT").unwrap_or_else(|| "aqx-radar/0.1".to_string()),
            http_timeout_secs: lookup("AQX_HTTP_TIMEOUT_SECS")
                .and_then(|v| v.trim().parse().ok())
                .unwrap_or(20),
            rules_path: lookup("AQX_RULES_PATH").map(PathBuf::from),
            fixtures_path: lookup("AQX_FIXTURES_PATH").map(PathBuf::from),
            reports_dir: lookup("AQX_REPORTS_DIR")
                .map(PathBuf::from)
                .unwrap_or_else(|| PathBuf::from("./reports")),
            scheduler_enabled: lookup("AQX_SCHEDULER_ENABLED")
                .map(|v| matches!(v.as_str(), "1" | "true" | "TRUE" | "True"))
                .unwrap_or(false),
            sync_cron: lookup("AQX_SYNC_CRON").unwrap_or_else(|| "0 0 7 * * *".to_string()),
            telegram: TelegramConfig::from_lookup(&lookup),
        }
    }
}

/// `|`-separated keyword list; blanks and canonical duplicates dropped, order kept.
pub fn parse_keywords(raw: &str) -> Vec<String> {
    let mut seen = std::collections::HashSet::new();
    raw.split('|')
        .map(str::trim)
        .filter(|k| !k.is_empty())
        .filter(|k| seen.insert(canonicalize(k)))
        .map(str::to_string)
        .collect()
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct KeywordSummary {
    pub keyword: String,
    pub discovered: usize,
    pub inserted: usize,
    pub duplicates: usize,
    pub failed: usize,
    pub rejected: usize,
    #[serde(default)]
    pub new_by_tag: BTreeMap<Tag, usize>,
    #[serde(default)]
    pub discovery_error: Option<String>,
    #[serde(default)]
    pub alerts_sent: usize,
    /// Newly stored pain and active-search posts, kept for alerting.
    #[serde(skip)]
    pub new_leads: Vec<TaggedPost>,
}

/// Validate, classify, and store items one at a time in handoff order.
/// Per-item failures are logged and counted; they never stop the batch.
pub async fn process_batch(
    keyword: &str,
    items: Vec<ScrapedItem>,
    classifier: &dyn IntentClassifier,
    sink: &dyn PostSink,
) -> KeywordSummary {
    let mut summary = KeywordSummary {
        keyword: keyword.to_string(),
        discovered: items.len(),
        ..Default::default()
    };

    for item in items {
        if let Err(err) = item.validate() {
            warn!(keyword, error = %err, "rejecting malformed item");
            summary.rejected += 1;
            continue;
        }

        let tag = classifier.classify(&item.title, item.body.as_deref());
        let post = TaggedPost::from_item(item, tag);
        let outcome = sink.insert_if_absent(&post).await;
        match outcome {
            Ok(InsertOutcome::Inserted) => {
                summary.inserted += 1;
                *summary.new_by_tag.entry(tag).or_default() += 1;
                if tag.is_lead() {
                    summary.new_leads.push(post);
                }
            }
            Ok(InsertOutcome::Duplicate) => summary.duplicates += 1,
            Err(err) => {
                warn!(keyword, post_id = %post.id, error = %err, "storing post failed");
                summary.failed += 1;
            }
        }
    }

    summary
}

#[derive(Debug, Clone, Serialize)]
pub struct RunSummary {
    pub run_id: Uuid,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
    pub source_id: String,
    pub keywords: Vec<KeywordSummary>,
    pub reports_dir: Option<String>,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct RunTotals {
    pub discovered: usize,
    pub inserted: usize,
    pub duplicates: usize,
    pub failed: usize,
    pub rejected: usize,
}

impl RunSummary {
    pub fn totals(&self) -> RunTotals {
        self.keywords.iter().fold(RunTotals::default(), |mut acc, k| {
            acc.discovered += k.discovered;
            acc.inserted += k.inserted;
            acc.duplicates += k.duplicates;
            acc.failed += k.failed;
            acc.rejected += k.rejected;
            acc
        })
    }
}

pub struct IntentPipeline {
    config: RunConfig,
    store: PostStore,
    http: HttpFetcher,
    source: Box<dyn SearchSource>,
    classifier: Box<dyn IntentClassifier>,
    notifier: Option<TelegramNotifier>,
}

impl IntentPipeline {
    /// Opens the store (the one fatal failure), loads rules, and picks the search source.
    pub async fn from_config(config: RunConfig) -> Result<Self> {
        let store = PostStore::connect(&config.database_url)
            .await
            .with_context(|| format!("opening database {}", config.database_url))?;
        let tagger = match &config.rules_path {
            Some(path) => IntentTagger::from_path(path)?,
            None => IntentTagger::builtin()?,
        };
        let source: Box<dyn SearchSource> = match &config.fixtures_path {
            Some(path) => Box::new(FixtureSource::from_path(path)?),
            None => Box::<DuckDuckGoSource>::default(),
        };
        Self::new(config, store, source, Box::new(tagger))
    }

    pub fn new(
        config: RunConfig,
        store: PostStore,
        source: Box<dyn SearchSource>,
        classifier: Box<dyn IntentClassifier>,
    ) -> Result<Self> {
        let http = HttpFetcher::new(HttpClientConfig {
            timeout: Duration::from_secs(config.http_timeout_secs),
            user_agent: Some(config.user_agent.clone()),
            token_bucket: Some(TokenBucketConfig {
                capacity: 5,
                refill_every: Duration::from_millis(500),
            }),
            ..Default::default()
        })?;
        let notifier = config
            .telegram
            .as_ref()
            .map(TelegramNotifier::new)
            .transpose()
            .context("building telegram client")?;
        Ok(Self {
            config,
            store,
            http,
            source,
            classifier,
            notifier,
        })
    }

    pub fn config(&self) -> &RunConfig {
        &self.config
    }

    pub fn store(&self) -> &PostStore {
        &self.store
    }

    pub fn notifier(&self) -> Option<&TelegramNotifier> {
        self.notifier.as_ref()
    }

    pub async fn run_once(&self) -> Result<RunSummary> {
        let run_id = Uuid::new_v4();
        let span = info_span!("intent_run", %run_id, source = self.source.source_id());
        self.run_keywords(run_id).instrument(span).await
    }

    async fn run_keywords(&self, run_id: Uuid) -> Result<RunSummary> {
        let started_at = Utc::now();
        let ctx = AdapterContext {
            run_id,
            fetched_at: started_at,
        };
        info!(keywords = self.config.keywords.len(), "starting run");

        let mut keywords = Vec::with_capacity(self.config.keywords.len());
        for keyword in &self.config.keywords {
            let items = match self
                .source
                .discover(&self.http, &ctx, keyword, self.config.max_per_keyword)
                .await
            {
                Ok(items) => items,
                Err(err) => {
                    warn!(keyword = %keyword, error = %err, "discovery failed");
                    keywords.push(KeywordSummary {
                        keyword: keyword.clone(),
                        discovery_error: Some(err.to_string()),
                        ..Default::default()
                    });
                    continue;
                }
            };

            let mut summary =
                process_batch(keyword, items, self.classifier.as_ref(), &self.store).await;
            summary.alerts_sent = self.alert_new_leads(&summary.new_leads).await;
            info!(
                keyword = %keyword,
                inserted = summary.inserted,
                duplicates = summary.duplicates,
                failed = summary.failed,
                rejected = summary.rejected,
                alerts_sent = summary.alerts_sent,
                "keyword processed"
            );
            keywords.push(summary);
        }

        let mut summary = RunSummary {
            run_id,
            started_at,
            finished_at: Utc::now(),
            source_id: self.source.source_id().to_string(),
            keywords,
            reports_dir: None,
        };
        // Posts are already committed; report failures only warn.
        match self.write_reports(&summary).await {
            Ok(reports_dir) => summary.reports_dir = Some(reports_dir.display().to_string()),
            Err(err) => warn!(error = %format!("{err:#}"), "writing run reports failed"),
        }
        Ok(summary)
    }

    /// Sends one message per new lead; failures are logged and skipped.
    async fn alert_new_leads(&self, leads: &[TaggedPost]) -> usize {
        let Some(notifier) = &self.notifier else {
            return 0;
        };
        let mut sent = 0;
        for post in leads {
            let Some(text) = lead_message(post) else {
                continue;
            };
            match notifier.send(&text).await {
                Ok(()) => sent += 1,
                Err(err) => warn!(post_id = %post.id, error = %err, "lead alert failed"),
            }
        }
        sent
    }

    async fn write_reports(&self, summary: &RunSummary) -> Result<PathBuf> {
        let reports_dir = self.config.reports_dir.join(summary.run_id.to_string());
        fs::create_dir_all(&reports_dir)
            .await
            .with_context(|| format!("creating {}", reports_dir.display()))?;

        let json = serde_json::to_vec_pretty(summary).context("serializing run summary")?;
        fs::write(reports_dir.join("run_summary.json"), json)
            .await
            .context("writing run_summary.json")?;

        let kpi_markdown =
            report_daily_markdown(&self.store, summary.finished_at.date_naive(), 10).await?;
        fs::write(
            reports_dir.join("daily_brief.md"),
            render_run_brief(summary, &kpi_markdown),
        )
        .await
        .context("writing daily_brief.md")?;

        Ok(reports_dir)
    }
}

fn render_run_brief(summary: &RunSummary, kpi_markdown: &str) -> String {
    let totals = summary.totals();
    let rows = summary
        .keywords
        .iter()
        .map(|k| {
            format!(
                "| {} | {} | {} | {} | {} | {} |",
                k.keyword,
                k.discovered,
                k.inserted,
                k.duplicates,
                k.failed,
                k.rejected
            )
        })
        .collect::<Vec<_>>()
        .join("\n");
    format!(
        concat!(
            "# Run `{}`\n\n- Source: {}\n- Started: {}\n- Finished: {}\n",
            "- New: {} / duplicates: {} / failed: {} / rejected: {}\n\n",
            "| keyword | discovered | new | duplicates | failed | rejected |\n",
            "|---|---|---|---|---|---|\n{}\n\n{}"
        ),
        summary.run_id,
        summary.source_id,
        summary.started_at,
        summary.finished_at,
        totals.inserted,
        totals.duplicates,
        totals.failed,
        totals.rejected,
        rows,
        kpi_markdown
    )
}

pub async fn report_daily_markdown(
    store: &PostStore,
    day: NaiveDate,
    top_n: i64,
) -> Result<String> {
    let kpi = store
        .daily_kpi(day)
        .await
        .with_context(|| format!("computing KPI for {day}"))?;
    let top = store
        .top_keywords(day, top_n)
        .await
        .with_context(|| format!("loading top keywords for {day}"))?;

    let mut lines = vec![
        format!("## Intent KPI for {day}"),
        String::new(),
        "| tag | unique posts |".to_string(),
        "|---|---|".to_string(),
        format!("| pain | {} |", kpi.pain),
        format!("| active_search | {} |", kpi.active_search),
        format!("| objection | {} |", kpi.objection),
        format!("| noise | {} |", kpi.noise),
        String::new(),
        format!("- Total unique posts: {}", kpi.total),
        format!(
            "- Intent share (pain + active_search + objection): {:.1}%",
            kpi.intent_pct()
        ),
        String::new(),
        "### Top keywords by intent".to_string(),
    ];
    if top.is_empty() {
        lines.push("- none".to_string());
    }
    for row in top {
        lines.push(format!("- {} ({}): {}", row.keyword, row.tag, row.count));
    }
    lines.push(String::new());
    Ok(lines.join("\n"))
}

#[derive(Debug, Clone, Serialize)]
pub struct ParquetManifest {
    pub schema_version: u32,
    pub day: NaiveDate,
    pub rows: usize,
    pub files: Vec<ParquetManifestFile>,
}

#[derive(Debug, Clone, Serialize)]
pub struct ParquetManifestFile {
    pub name: String,
    pub path: String,
    pub sha256: String,
    pub bytes: u64,
}

/// Snapshot the day's intent posts to `<out_dir>/intent_<day>.parquet` plus `manifest.json`.
pub async fn export_intent_parquet(
    store: &PostStore,
    day: NaiveDate,
    out_dir: &Path,
) -> Result<ParquetManifest> {
    let posts = store
        .intent_posts_for_day(day)
        .await
        .with_context(|| format!("loading intent posts for {day}"))?;

    fs::create_dir_all(out_dir)
        .await
        .with_context(|| format!("creating {}", out_dir.display()))?;

    let name = format!("intent_{}", day.format("%Y-%m-%d"));
    let parquet_path = out_dir.join(format!("{name}.parquet"));
    write_posts_parquet(&parquet_path, &posts)?;

    let manifest = ParquetManifest {
        schema_version: 1,
        day,
        rows: posts.len(),
        files: vec![manifest_entry(&name, out_dir, &parquet_path)?],
    };
    let manifest_path = out_dir.join("manifest.json");
    let bytes = serde_json::to_vec_pretty(&manifest).context("serializing parquet manifest")?;
    fs::write(&manifest_path, bytes)
        .await
        .with_context(|| format!("writing {}", manifest_path.display()))?;
    Ok(manifest)
}

fn write_posts_parquet(path: &Path, posts: &[StoredPost]) -> Result<()> {
    let schema = Arc::new(Schema::new(vec![
        ArrowField::new("id", DataType::Utf8, false),
        ArrowField::new("keyword", DataType::Utf8, false),
        ArrowField::new("tag", DataType::Utf8, false),
        ArrowField::new("title", DataType::Utf8, false),
        ArrowField::new("url", DataType::Utf8, false),
        ArrowField::new("body", DataType::Utf8, true),
        ArrowField::new("published_at", DataType::Utf8, true),
        ArrowField::new("created_at", DataType::Utf8, false),
    ]));

    let ids = StringArray::from(
        posts
            .iter()
            .map(|p| Some(p.post.id.as_str()))
            .collect::<Vec<_>>(),
    );
    let keywords = StringArray::from(
        posts
            .iter()
            .map(|p| Some(p.post.keyword.as_str()))
            .collect::<Vec<_>>(),
    );
    let tags = StringArray::from(
        posts
            .iter()
            .map(|p| Some(p.post.tag.as_str()))
            .collect::<Vec<_>>(),
    );
    let titles = StringArray::from(
        posts
            .iter()
            .map(|p| Some(p.post.title.as_str()))
            .collect::<Vec<_>>(),
    );
    let urls = StringArray::from(
        posts
            .iter()
            .map(|p| Some(p.post.url.as_str()))
            .collect::<Vec<_>>(),
    );
    let bodies = StringArray::from(
        posts
            .iter()
            .map(|p| p.post.body.as_deref())
            .collect::<Vec<_>>(),
    );
    let published = StringArray::from(
        posts
            .iter()
            .map(|p| p.post.published_at.map(|ts| ts.to_rfc3339()))
            .collect::<Vec<_>>(),
    );
    let created = StringArray::from(
        posts
            .iter()
            .map(|p| Some(p.created_at.to_rfc3339()))
            .collect::<Vec<_>>(),
    );

    let batch = RecordBatch::try_new(
        schema,
        vec![
            Arc::new(ids),
            Arc::new(keywords),
            Arc::new(tags),
            Arc::new(titles),
            Arc::new(urls),
            Arc::new(bodies),
            Arc::new(published),
            Arc::new(created),
        ],
    )
    .context("building intent posts record batch")?;

    let file = File::create(path).with_context(|| format!("creating {}", path.display()))?;
    let mut writer = ArrowWriter::try_new(file, batch.schema(), None)
        .with_context(|| format!("opening parquet writer {}", path.display()))?;
    writer
        .write(&batch)
        .with_context(|| format!("writing record batch {}", path.display()))?;
    writer
        .close()
        .with_context(|| format!("closing parquet writer {}", path.display()))?;
    Ok(())
}

fn manifest_entry(name: &str, base_dir: &Path, path: &Path) -> Result<ParquetManifestFile> {
    let bytes = std::fs::read(path).with_context(|| format!("reading {}", path.display()))?;
    let mut hasher = Sha256::new();
    hasher.update(&bytes);
    let sha256 = hex::encode(hasher.finalize());
    let rel = path
        .strip_prefix(base_dir)
        .unwrap_or(path)
        .display()
        .to_string();
    Ok(ParquetManifestFile {
        name: name.to_string(),
        path: rel,
        sha256,
        bytes: bytes.len() as u64,
    })
}

/// Cron-driven `run_once`, only when the config enables it.
pub async fn maybe_build_scheduler(pipeline: Arc<IntentPipeline>) -> Result<Option<JobScheduler>> {
    if !pipeline.config().scheduler_enabled {
        return Ok(None);
    }

    let cron = pipeline.config().sync_cron.clone();
    let sched = JobScheduler::new().await.context("creating scheduler")?;
    let job = Job::new_async(&cron, move |_uuid, _l| {
        let pipeline = Arc::clone(&pipeline);
        Box::pin(async move {
            match pipeline.run_once().await {
                Ok(summary) => {
                    let totals = summary.totals();
                    info!(
                        run_id = %summary.run_id,
                        inserted = totals.inserted,
                        duplicates = totals.duplicates,
                        failed = totals.failed,
                        "scheduled run finished"
                    );
                }
                Err(err) => error!(error = %err, "scheduled run failed"),
            }
        })
    })
    .with_context(|| format!("creating scheduler job for cron {cron}"))?;
    sched.add(job).await.context("adding scheduler job")?;
    Ok(Some(sched))
}

#[derive(Debug, Clone, Serialize)]
pub struct DailyClose {
    pub day: NaiveDate,
    pub manifest: ParquetManifest,
    pub brief_path: String,
    pub alert_sent: bool,
}

/// End-of-day close: parquet export, `daily_<day>.md` brief, and the summary alert when configured.
pub async fn daily_close(
    store: &PostStore,
    notifier: Option<&TelegramNotifier>,
    day: NaiveDate,
    out_dir: &Path,
) -> Result<DailyClose> {
    let manifest = export_intent_parquet(store, day, out_dir).await?;
    let markdown = report_daily_markdown(store, day, 10).await?;
    let brief_path = out_dir.join(format!("daily_{}.md", day.format("%Y-%m-%d")));
    fs::write(&brief_path, markdown)
        .await
        .with_context(|| format!("writing {}", brief_path.display()))?;

    let mut alert_sent = false;
    if let Some(notifier) = notifier {
        let kpi = store
            .daily_kpi(day)
            .await
            .with_context(|| format!("computing KPI for {day}"))?;
        match notifier.send(&daily_summary_message(&kpi)).await {
            Ok(()) => alert_sent = true,
            Err(err) => warn!(%day, error = %err, "daily summary alert failed"),
        }
    }

    Ok(DailyClose {
        day,
        manifest,
        brief_path: brief_path.display().to_string(),
        alert_sent,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use aqx_storage::{PostQuery, StorageError};
    use async_trait::async_trait;
    use std::sync::Mutex;
    use tempfile::tempdir;

    fn tagger() -> IntentTagger {
        IntentTagger::builtin().expect("built-in rules compile")
    }

    fn workspace_root() -> PathBuf {
        Path::new(env!("CARGO_MANIFEST_DIR"))
            .join("../..")
            .canonicalize()
            .expect("workspace root")
    }

    fn item(keyword: &str, title: &str, url: &str, body: Option<&str>) -> ScrapedItem {
        ScrapedItem {
            keyword: keyword.into(),
            title: title.into(),
            url: url.into(),
            body: body.map(str::to_string),
            published_at: None,
        }
    }

    fn test_config(reports_dir: &Path) -> RunConfig {
        let mut config = RunConfig::from_lookup(|_| None);
        config.reports_dir = reports_dir.to_path_buf();
        config.fixtures_path =
            Some(workspace_root().join("fixtures/duckduckgo/sample/bundle.json"));
        config
    }

    async fn fixture_pipeline(reports_dir: &Path) -> IntentPipeline {
        let config = test_config(reports_dir);
        let store = PostStore::in_memory().await.expect("store");
        let source = FixtureSource::from_path(config.fixtures_path.as_ref().unwrap())
            .expect("fixtures");
        IntentPipeline::new(config, store, Box::new(source), Box::new(tagger()))
            .expect("pipeline")
    }

    #[test]
    fn pain_phrase_wins_over_search_phrase() {
        let tag = tagger().tag(
            "Necesito ayuda con limpieza de piscina",
            Some("busco proveedor urgente"),
        );
        assert_eq!(tag, Tag::Pain);
    }

    #[test]
    fn missing_body_without_phrases_is_noise() {
        assert_eq!(tagger().tag("piscina", None), Tag::Noise);
        assert_eq!(tagger().tag("piscina", Some("")), Tag::Noise);
        assert_eq!(tagger().tag("", None), Tag::Noise);
    }

    #[test]
    fn each_category_is_reachable() {
        let t = tagger();
        assert_eq!(t.tag("La bomba no funciona desde ayer", None), Tag::Pain);
        assert_eq!(t.tag("Recomiendan empresa de mantenimiento", None), Tag::ActiveSearch);
        assert_eq!(t.tag("La agencia no responde los correos", None), Tag::Objection);
        assert_eq!(t.tag("Fotos de piscinas en Asia", Some("galería")), Tag::Noise);
    }

    #[test]
    fn priority_order_is_pain_then_search_then_objection() {
        assert_eq!(TAG_PRIORITY, [Tag::Pain, Tag::ActiveSearch, Tag::Objection]);
        let t = tagger();
        assert_eq!(
            t.tag("Busco proveedor", Some("el anterior no responde y tengo un problema")),
            Tag::Pain
        );
        assert_eq!(t.tag("Busco proveedor", Some("el anterior no responde")), Tag::ActiveSearch);
        let order = t.rule_counts().into_iter().map(|(tag, _)| tag).collect::<Vec<_>>();
        assert_eq!(order, TAG_PRIORITY.to_vec());
    }

    #[test]
    fn accents_and_case_do_not_change_the_tag() {
        let t = tagger();
        assert_eq!(t.tag("¿CUÁNTO CUESTA una piscina?", None), Tag::ActiveSearch);
        assert_eq!(t.tag("cuanto cuesta una piscina", None), Tag::ActiveSearch);
        assert_eq!(t.tag("Pedí COTIZACION ayer", None), Tag::ActiveSearch);
        assert_eq!(t.tag("El filtro llegó DAÑADO", None), Tag::Pain);
        assert_eq!(t.tag("el filtro llego danado", None), Tag::Pain);
        assert_eq!(t.tag("Atención   PÉSIMA", None), Tag::Objection);
    }

    #[test]
    fn decomposed_accents_tag_like_precomposed_ones() {
        let t = tagger();
        assert_eq!(t.tag("Pedi\u{301} una cotizacio\u{301}n", None), Tag::ActiveSearch);
        assert_eq!(t.tag("El filtro llego\u{301} dan\u{303}ado", None), Tag::Pain);
        assert_eq!(t.tag("Atencio\u{301}n pe\u{301}sima", None), Tag::Objection);
    }

    #[test]
    fn tagging_is_pure() {
        let t = tagger();
        let title = "Alguien sabe de una empresa seria?";
        let first = t.tag(title, Some("cobran mucho"));
        for _ in 0..3 {
            assert_eq!(t.tag(title, Some("cobran mucho")), first);
        }
        assert_eq!(tagger().tag(title, Some("cobran mucho")), first);
    }

    #[test]
    fn rules_file_order_does_not_change_priority() {
        let yaml = r#"
version: 1
rules:
  - tag: objection
    patterns: ['caro']
  - tag: active_search
    patterns: ['busco']
  - tag: pain
    patterns: ['roto']
"#;
        let t = IntentTagger::from_yaml_str(yaml).expect("rules");
        assert_eq!(t.tag("busco algo caro porque está roto", None), Tag::Pain);
        assert_eq!(t.tag("busco algo caro", None), Tag::ActiveSearch);
        assert_eq!(t.tag("caro", None), Tag::Objection);
    }

    #[test]
    fn accented_patterns_are_folded_when_compiled() {
        let yaml = "version: 1\nrules:\n  - tag: active_search\n    patterns: ['cotización']\n";
        let t = IntentTagger::from_yaml_str(yaml).expect("rules");
        assert_eq!(t.tag("cotizacion", None), Tag::ActiveSearch);
        assert_eq!(t.tag("COTIZACIÓN", None), Tag::ActiveSearch);
    }

    #[test]
    fn invalid_rule_files_are_rejected_at_load() {
        let noise = "version: 1\nrules:\n  - tag: noise\n    patterns: ['x']\n";
        assert!(matches!(IntentTagger::from_yaml_str(noise), Err(RulesError::NoiseRule)));

        let bad_regex = "version: 1\nrules:\n  - tag: pain\n    patterns: ['(unclosed']\n";
        assert!(matches!(
            IntentTagger::from_yaml_str(bad_regex),
            Err(RulesError::Pattern { tag: Tag::Pain, .. })
        ));

        let unknown = "version: 1\nrules:\n  - tag: dolor\n    patterns: ['x']\n";
        assert!(matches!(IntentTagger::from_yaml_str(unknown), Err(RulesError::Yaml(_))));

        assert!(matches!(
            IntentTagger::from_path("/definitely/missing/intent.yaml"),
            Err(RulesError::Io { .. })
        ));
    }

    #[test]
    fn rules_file_on_disk_matches_builtin() {
        let from_disk =
            IntentTagger::from_path(workspace_root().join("rules/intent.yaml")).expect("rules");
        assert_eq!(from_disk.rule_counts(), tagger().rule_counts());
    }

    #[test]
    fn keywords_parse_from_pipe_list() {
        assert_eq!(
            parse_keywords(
                " limpieza de piscina lima | |Agencia Marketing Lima|agencia  marketing lima "
            ),
            vec![
                "limpieza de piscina lima".to_string(),
                "Agencia Marketing Lima".to_string()
            ]
        );
    }

    #[test]
    fn run_config_defaults_and_overrides() {
        let defaults = RunConfig::from_lookup(|_| None);
        assert_eq!(defaults.keywords.len(), 3);
        assert_eq!(defaults.max_per_keyword, 30);
        assert_eq!(defaults.database_url, "sqlite://scraping.db");
        assert!(!defaults.scheduler_enabled);

        let config = RunConfig::from_lookup(|key| match key {
            "KEYWORDS" => Some("a|b".into()),
            "MAX_PER_KW" => Some("5".into()),
            "AQX_SCHEDULER_ENABLED" => Some("true".into()),
            _ => None,
        });
        assert_eq!(config.keywords, vec!["a".to_string(), "b".to_string()]);
        assert_eq!(config.max_per_keyword, 5);
        assert!(config.scheduler_enabled);

        let empty = RunConfig::from_lookup(|key| (key == "KEYWORDS").then(|| " | ".to_string()));
        assert_eq!(empty.keywords.len(), 3);
    }

    /// Sink that fails for chosen ids and records every id it sees.
    struct FlakySink {
        fail_ids: Vec<String>,
        seen: Mutex<Vec<String>>,
    }

    #[async_trait]
    impl PostSink for FlakySink {
        async fn insert_if_absent(&self, post: &TaggedPost) -> Result<InsertOutcome, StorageError> {
            self.seen.lock().unwrap().push(post.id.clone());
            if self.fail_ids.contains(&post.id) {
                return Err(StorageError::CorruptRow {
                    id: post.id.clone(),
                    reason: "disk full".into(),
                });
            }
            Ok(InsertOutcome::Inserted)
        }
    }

    #[tokio::test]
    async fn failed_insert_does_not_abort_batch() {
        let items = vec![
            item("kw", "Necesito ayuda urgente", "https://x.pe/1", None),
            item("kw", "Busco proveedor serio", "https://x.pe/2", None),
            item("kw", "", "https://x.pe/3", None),
            item("kw", "Fotos de piscinas", "https://x.pe/4", None),
        ];
        let failing = aqx_core::post_id("Busco proveedor serio", "https://x.pe/2");
        let sink = FlakySink {
            fail_ids: vec![failing.clone()],
            seen: Mutex::new(Vec::new()),
        };

        let summary = process_batch("kw", items, &tagger(), &sink).await;
        assert_eq!(summary.discovered, 4);
        assert_eq!(summary.inserted, 2);
        assert_eq!(summary.failed, 1);
        assert_eq!(summary.rejected, 1);
        assert_eq!(summary.new_by_tag.get(&Tag::Pain), Some(&1));
        assert_eq!(summary.new_by_tag.get(&Tag::Noise), Some(&1));

        let seen = sink.seen.lock().unwrap().clone();
        assert_eq!(
            seen,
            vec![
                aqx_core::post_id("Necesito ayuda urgente", "https://x.pe/1"),
                failing,
                aqx_core::post_id("Fotos de piscinas", "https://x.pe/4"),
            ]
        );
    }

    #[tokio::test]
    async fn batch_reports_duplicates_against_store() {
        let store = PostStore::in_memory().await.expect("store");
        let items = vec![
            item(
                "kw",
                "Necesito ayuda con limpieza de piscina",
                "https://x.pe/a",
                Some("busco proveedor urgente"),
            ),
            item(
                "kw",
                "necesito ayuda con  limpieza de piscina",
                "https://x.pe/a",
                Some("otra vez"),
            ),
        ];
        let summary = process_batch("kw", items, &tagger(), &store).await;
        assert_eq!((summary.inserted, summary.duplicates), (1, 1));

        let rows = store.list(&PostQuery::default()).await.unwrap();
        assert_eq!(rows.len(), 1);
        assert_eq!(rows[0].post.tag, Tag::Pain);
        assert_eq!(rows[0].post.body.as_deref(), Some("busco proveedor urgente"));
    }

    #[tokio::test]
    async fn fixture_run_is_idempotent_and_writes_reports() {
        let dir = tempdir().expect("tempdir");
        let pipeline = fixture_pipeline(dir.path()).await;

        let first = pipeline.run_once().await.expect("first run");
        let totals = first.totals();
        assert_eq!(totals.discovered, 7);
        assert_eq!(totals.inserted, 5);
        assert_eq!(totals.duplicates, 1);
        assert_eq!(totals.rejected, 1);
        assert_eq!(totals.failed, 0);
        assert_eq!(
            first.keywords.iter().map(|k| k.keyword.as_str()).collect::<Vec<_>>(),
            DEFAULT_KEYWORDS.to_vec()
        );

        let counts = pipeline.store().tag_counts().await.unwrap();
        assert_eq!(counts.get(&Tag::Pain), Some(&1));
        assert_eq!(counts.get(&Tag::ActiveSearch), Some(&2));
        assert_eq!(counts.get(&Tag::Objection), Some(&1));
        assert_eq!(counts.get(&Tag::Noise), Some(&1));

        let reports_dir = PathBuf::from(first.reports_dir.clone().expect("reports dir"));
        assert!(reports_dir.join("run_summary.json").exists());
        let brief = std::fs::read_to_string(reports_dir.join("daily_brief.md")).unwrap();
        assert!(brief.contains("| limpieza de piscina lima | 4 | 3 | 1 | 0 | 0 |"));
        assert!(brief.contains("Total unique posts: 5"));

        let second = pipeline.run_once().await.expect("second run");
        let totals = second.totals();
        assert_eq!(totals.inserted, 0);
        assert_eq!(totals.duplicates, 6);
        assert_eq!(pipeline.store().count(&PostQuery::default()).await.unwrap(), 5);
    }

    #[tokio::test]
    async fn report_write_failure_keeps_the_run_successful() {
        let dir = tempdir().expect("tempdir");
        let not_a_dir = dir.path().join("reports");
        std::fs::write(&not_a_dir, "occupied").unwrap();
        let pipeline = fixture_pipeline(&not_a_dir).await;

        let summary = pipeline.run_once().await.expect("run succeeds");
        assert_eq!(summary.reports_dir, None);
        assert_eq!(summary.totals().inserted, 5);
        assert_eq!(pipeline.store().count(&PostQuery::default()).await.unwrap(), 5);

        let rerun = pipeline.run_once().await.expect("rerun succeeds");
        assert_eq!(rerun.totals().duplicates, 6);
    }

    #[tokio::test]
    async fn batch_keeps_new_leads_only() {
        let store = PostStore::in_memory().await.expect("store");
        let items = vec![
            item("kw", "Necesito ayuda urgente", "https://x.pe/1", None),
            item("kw", "Busco proveedor serio", "https://x.pe/2", None),
            item("kw", "La agencia no responde", "https://x.pe/3", None),
            item("kw", "Fotos de piscinas", "https://x.pe/4", None),
        ];
        let summary = process_batch("kw", items.clone(), &tagger(), &store).await;
        let tags = summary.new_leads.iter().map(|p| p.tag).collect::<Vec<_>>();
        assert_eq!(tags, vec![Tag::Pain, Tag::ActiveSearch]);

        let again = process_batch("kw", items, &tagger(), &store).await;
        assert!(again.new_leads.is_empty());
        assert_eq!(again.duplicates, 4);
    }

    fn unreachable_telegram() -> TelegramConfig {
        let listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
        let addr = listener.local_addr().unwrap();
        drop(listener);
        TelegramConfig {
            token: "123:abc".into(),
            chat_id: "-100".into(),
            api_base: format!("http://{addr}"),
        }
    }

    #[tokio::test]
    async fn failing_alerts_do_not_fail_the_run() {
        let dir = tempdir().expect("tempdir");
        let mut config = test_config(dir.path());
        config.telegram = Some(unreachable_telegram());
        let store = PostStore::in_memory().await.expect("store");
        let source = FixtureSource::from_path(config.fixtures_path.as_ref().unwrap())
            .expect("fixtures");
        let pipeline = IntentPipeline::new(config, store, Box::new(source), Box::new(tagger()))
            .expect("pipeline");
        assert!(pipeline.notifier().is_some());

        let summary = pipeline.run_once().await.expect("run succeeds");
        assert_eq!(summary.totals().inserted, 5);
        let leads = summary.keywords.iter().map(|k| k.new_leads.len()).sum::<usize>();
        assert_eq!(leads, 3);
        assert!(summary.keywords.iter().all(|k| k.alerts_sent == 0));
    }

    #[tokio::test]
    async fn daily_close_exports_and_skips_alert_without_notifier() {
        let dir = tempdir().expect("tempdir");
        let pipeline = fixture_pipeline(dir.path()).await;
        pipeline.run_once().await.expect("run");

        let out = dir.path().join("close");
        let day = Utc::now().date_naive();
        let close = daily_close(pipeline.store(), None, day, &out).await.expect("close");
        assert_eq!(close.manifest.rows, 4);
        assert!(!close.alert_sent);
        let brief = std::fs::read_to_string(&close.brief_path).unwrap();
        assert!(brief.contains(&format!("## Intent KPI for {day}")));

        let notifier = TelegramNotifier::new(&unreachable_telegram()).unwrap();
        let close = daily_close(pipeline.store(), Some(&notifier), day, &out)
            .await
            .expect("close with failing alert");
        assert!(!close.alert_sent);
    }

    #[tokio::test]
    async fn daily_markdown_lists_counts_and_top_keywords() {
        let dir = tempdir().expect("tempdir");
        let pipeline = fixture_pipeline(dir.path()).await;
        pipeline.run_once().await.expect("run");

        let md = report_daily_markdown(pipeline.store(), Utc::now().date_naive(), 10)
            .await
            .unwrap();
        assert!(md.contains("| active_search | 2 |"));
        assert!(md.contains("- Intent share (pain + active_search + objection): 80.0%"));
        assert!(md.contains("- agencia marketing lima (objection): 1"));

        let long_ago = NaiveDate::from_ymd_opt(2020, 1, 1).unwrap();
        let empty = report_daily_markdown(pipeline.store(), long_ago, 10)
            .await
            .unwrap();
        assert!(empty.contains("- none"));
    }

    #[tokio::test]
    async fn parquet_export_writes_intent_rows_and_manifest() {
        let dir = tempdir().expect("tempdir");
        let pipeline = fixture_pipeline(dir.path()).await;
        pipeline.run_once().await.expect("run");

        let out = dir.path().join("exports");
        let day = Utc::now().date_naive();
        let manifest = export_intent_parquet(pipeline.store(), day, &out).await.expect("export");
        assert_eq!(manifest.rows, 4);
        assert_eq!(manifest.files.len(), 1);
        let file = &manifest.files[0];
        assert_eq!(file.path, format!("intent_{}.parquet", day.format("%Y-%m-%d")));
        assert_eq!(std::fs::metadata(out.join(&file.path)).unwrap().len(), file.bytes);
        assert!(out.join("manifest.json").exists());
    }

    #[tokio::test]
    async fn scheduler_is_skipped_when_disabled() {
        let dir = tempdir().expect("tempdir");
        let pipeline = Arc::new(fixture_pipeline(dir.path()).await);
        assert!(maybe_build_scheduler(pipeline).await.unwrap().is_none());
    }
}
