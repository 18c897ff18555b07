//! Optional Telegram notifications: one message per new lead, one summary per daily close.

use std::time::Duration;

use aqx_core::{Tag, TaggedPost};
use aqx_storage::DailyKpi;
use serde::Serialize;
use thiserror::Error;

pub const DEFAULT_TELEGRAM_API: &str = "https://api.telegram.org";

const TITLE_PREVIEW_CHARS: usize = 100;
const BODY_PREVIEW_CHARS: usize = 150;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TelegramConfig {
    pub token: String,
    pub chat_id: String,
    pub api_base: String,
}

impl TelegramConfig {
    /// `None` unless both `TELEGRAM_TOKEN` and `TELEGRAM_CHAT_ID` are set and non-blank.
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Option<Self> {
        let non_blank = |key: &str| lookup(key).filter(|v| !v.trim().is_empty());
        Some(Self {
            token: non_blank("TELEGRAM_TOKEN")?,
            chat_id: non_blank("TELEGRAM_CHAT_ID")?,
            api_base: non_blank("AQX_TELEGRAM_API")
                .unwrap_or_else(|| DEFAULT_TELEGRAM_API.to_string()),
        })
    }
}

#[derive(Debug, Error)]
pub enum AlertError {
    #[error("telegram request failed: {0}")]
    Request(#[from] reqwest::Error),
    #[error("telegram rejected the message with status {status}: {body}")]
    Rejected { status: u16, body: String },
}

#[derive(Debug, Serialize)]
struct SendMessage<'a> {
    chat_id: &'a str,
    text: &'a str,
    parse_mode: &'static str,
    disable_web_page_preview: bool,
}

#[derive(Debug, Clone)]
pub struct TelegramNotifier {
    client: reqwest::Client,
    endpoint: String,
    chat_id: String,
}

impl TelegramNotifier {
    pub fn new(config: &TelegramConfig) -> Result<Self, AlertError> {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(10))
            .build()?;
        Ok(Self {
            client,
            endpoint: format!(
                "{}/bot{}/sendMessage",
                config.api_base.trim_end_matches('/'),
                config.token
            ),
            chat_id: config.chat_id.clone(),
        })
    }

    pub async fn send(&self, text: &str) -> Result<(), AlertError> {
        let response = self
            .client
            .post(&self.endpoint)
            .json(&SendMessage {
                chat_id: &self.chat_id,
                text,
                parse_mode: "HTML",
                disable_web_page_preview: true,
            })
            .send()
            .await?;
        let status = response.status();
        if status.is_success() {
            return Ok(());
        }
        let body = response.text().await.unwrap_or_default();
        Err(AlertError::Rejected {
            status: status.as_u16(),
            body,
        })
    }
}

/// Message for a newly stored lead; `None` for tags that never alert.
pub fn lead_message(post: &TaggedPost) -> Option<String> {
    let label = match post.tag {
        Tag::Pain => "PAIN",
        Tag::ActiveSearch => "ACTIVE SEARCH",
        Tag::Objection | Tag::Noise => return None,
    };
    let body = post
        .body
        .as_deref()
        .map(str::trim)
        .filter(|b| !b.is_empty())
        .map(|b| preview(b, BODY_PREVIEW_CHARS))
        .unwrap_or_else(|| "No extra content".to_string());
    Some(format!(
        concat!(
            "<b>New lead: {label}</b>\n\n",
            "<b>Keyword:</b> {}\n<b>Title:</b> {}\n<b>Snippet:</b> {}\n\n{}"
        ),
        escape_html(&post.keyword.to_uppercase()),
        escape_html(&preview(&post.title, TITLE_PREVIEW_CHARS)),
        escape_html(&body),
        escape_html(&post.url),
        label = label,
    ))
}

pub fn daily_summary_message(kpi: &DailyKpi) -> String {
    format!(
        concat!(
            "<b>Daily close {}</b>\n\n",
            "Pain: {}\nActive search: {}\nLeads: {}\nObjections: {}\n",
            "Total unique posts: {}\nIntent share: {:.1}%"
        ),
        kpi.day,
        kpi.pain,
        kpi.active_search,
        kpi.pain + kpi.active_search,
        kpi.objection,
        kpi.total,
        kpi.intent_pct()
    )
}

fn preview(text: &str, max_chars: usize) -> String {
    match text.char_indices().nth(max_chars) {
        Some((cut, _)) => format!("{}...", &text[..cut]),
        None => text.to_string(),
    }
}

fn escape_html(text: &str) -> String {
    text.replace('&', "&amp;")
        .replace('<', "&lt;")
        .replace('>', "&gt;")
}
