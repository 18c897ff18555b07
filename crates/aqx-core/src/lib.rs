//! Core domain model for the intent radar: scraped items, tags, and post identity.

use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use thiserror::Error;

pub const CRATE_NAME: &str = "aqx-core";

/// Length of the hex post id (64 bits of the SHA-256 digest).
pub const POST_ID_HEX_LEN: usize = 16;

/// Single business-intent classification attached to every stored post.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Tag {
    Pain,
    ActiveSearch,
    Objection,
    Noise,
}

impl Tag {
    pub const ALL: [Tag; 4] = [Tag::Pain, Tag::ActiveSearch, Tag::Objection, Tag::Noise];

    pub fn as_str(self) -> &'static str {
        match self {
            Tag::Pain => "pain",
            Tag::ActiveSearch => "active_search",
            Tag::Objection => "objection",
            Tag::Noise => "noise",
        }
    }

    /// Pain and active search are the leads worth an immediate alert.
    pub fn is_lead(self) -> bool {
        matches!(self, Tag::Pain | Tag::ActiveSearch)
    }
}

impl fmt::Display for Tag {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("unknown tag `{0}`")]
pub struct UnknownTag(pub String);

impl FromStr for Tag {
    type Err = UnknownTag;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim() {
            "pain" => Ok(Tag::Pain),
            "active_search" => Ok(Tag::ActiveSearch),
            "objection" => Ok(Tag::Objection),
            "noise" => Ok(Tag::Noise),
            other => Err(UnknownTag(other.to_string())),
        }
    }
}

/// Raw handoff from a search source into the tagging pipeline.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ScrapedItem {
    pub keyword: String,
    pub title: String,
    pub url: String,
    #[serde(default)]
    pub body: Option<String>,
    #[serde(default)]
    pub published_at: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum MalformedInput {
    #[error("scraped item has an empty title (url: {url:?})")]
    MissingTitle { url: String },
    #[error("scraped item has an empty url (title: {title:?})")]
    MissingUrl { title: String },
}

impl ScrapedItem {
    pub fn validate(&self) -> Result<(), MalformedInput> {
        if self.url.trim().is_empty() {
            return Err(MalformedInput::MissingUrl {
                title: self.title.clone(),
            });
        }
        if self.title.trim().is_empty() {
            return Err(MalformedInput::MissingTitle {
                url: self.url.clone(),
            });
        }
        Ok(())
    }
}

/// Text the tagger sees: title followed by the body when present.
pub fn tagging_text(title: &str, body: Option<&str>) -> String {
    match body {
        Some(body) if !body.trim().is_empty() => format!("{title} {body}"),
        _ => title.to_string(),
    }
}

/// Candidate record handed to the store. `created_at` is assigned on first insert.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TaggedPost {
    pub id: String,
    pub keyword: String,
    pub title: String,
    pub url: String,
    pub body: Option<String>,
    pub tag: Tag,
    pub published_at: Option<DateTime<Utc>>,
}

impl TaggedPost {
    pub fn from_item(item: ScrapedItem, tag: Tag) -> Self {
        Self {
            id: post_id(&item.title, &item.url),
            keyword: item.keyword,
            title: item.title,
            url: item.url,
            body: item.body,
            tag,
            published_at: item.published_at,
        }
    }
}

/// Persisted post as read back from the store.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StoredPost {
    #[serde(flatten)]
    pub post: TaggedPost,
    pub created_at: DateTime<Utc>,
}

/// Canonical form used for identity: trimmed, lowercased, whitespace runs collapsed.
pub fn canonicalize(input: &str) -> String {
    input
        .split_whitespace()
        .map(str::to_lowercase)
        .collect::<Vec<_>>()
        .join(" ")
}

/// Stable post identity over canonical (title, url).
pub fn post_id(title: &str, url: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(canonicalize(title).as_bytes());
    hasher.update(b"\n");
    hasher.update(canonicalize(url).as_bytes());
    let mut id = hex::encode(hasher.finalize());
    id.truncate(POST_ID_HEX_LEN);
    id
}

/// Lowercased, accent-folded, whitespace-collapsed text for rule matching.
pub fn fold_for_matching(input: &str) -> String {
    fold_accents(&canonicalize(input))
}

/// Maps Latin accented letters to their ASCII base letter; everything else passes through.
/// Decomposed input (base letter plus a combining mark) folds the same way.
pub fn fold_accents(input: &str) -> String {
    input
        .chars()
        .filter(|c| !is_combining_mark(*c))
        .map(fold_char)
        .collect()
}

fn is_combining_mark(c: char) -> bool {
    ('\u{0300}'..='\u{036f}').contains(&c)
}

fn fold_char(c: char) -> char {
    match c {
        'á' | 'à' | 'ä' | 'â' | 'ã' | 'å' => 'a',
        'Á' | 'À' | 'Ä' | 'Â' | 'Ã' | 'Å' => 'A',
        'é' | 'è' | 'ë' | 'ê' => 'e',
        'É' | 'È' | 'Ë' | 'Ê' => 'E',
        'í' | 'ì' | 'ï' | 'î' => 'i',
        'Í' | 'Ì' | 'Ï' | 'Î' => 'I',
        'ó' | 'ò' | 'ö' | 'ô' | 'õ' => 'o',
        'Ó' | 'Ò' | 'Ö' | 'Ô' | 'Õ' => 'O',
        'ú' | 'ù' | 'ü' | 'û' => 'u',
        'Ú' | 'Ù' | 'Ü' | 'Û' => 'U',
        'ñ' => 'n',
        'Ñ' => 'N',
        'ç' => 'c',
        'Ç' => 'C',
        other => other,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn item(title: &str, url: &str) -> ScrapedItem {
        ScrapedItem {
            keyword: "limpieza de piscina lima".into(),
            title: title.into(),
            url: url.into(),
            body: None,
            published_at: None,
        }
    }

    #[test]
    fn canonicalize_trims_lowercases_and_collapses_whitespace() {
        assert_eq!(
            canonicalize("  Necesito   AYUDA\tcon\n piscina "),
            "necesito ayuda con piscina"
        );
        assert_eq!(canonicalize(""), "");
        assert_eq!(canonicalize("   "), "");
        assert_eq!(canonicalize("Ñandú"), "ñandú");
    }

    #[test]
    fn post_id_is_stable_across_whitespace_and_case() {
        let a = post_id("Limpieza de Piscina  Lima", "https://x.pe/a");
        let b = post_id("  limpieza de piscina lima", "HTTPS://X.PE/A ");
        assert_eq!(a, b);
        assert_eq!(a.len(), POST_ID_HEX_LEN);
        assert!(a.chars().all(|c| c.is_ascii_hexdigit()));
    }

    #[test]
    fn post_id_separates_title_and_url() {
        assert_ne!(post_id("ab", "c"), post_id("a", "bc"));
        assert_ne!(
            post_id("same title", "https://x.pe/a"),
            post_id("same title", "https://x.pe/b")
        );
    }

    #[test]
    fn fold_for_matching_strips_accents_and_case() {
        assert_eq!(fold_for_matching("COTIZACIÓN  Dañado"), "cotizacion danado");
        assert_eq!(fold_accents("pingüino"), "pinguino");
    }

    #[test]
    fn fold_accents_drops_combining_marks_from_decomposed_text() {
        assert_eq!(fold_for_matching("COTIZACIO\u{301}N"), "cotizacion");
        assert_eq!(fold_accents("dan\u{303}ado"), "danado");
        assert_eq!(fold_accents("pingu\u{308}ino"), "pinguino");
        assert_eq!(
            fold_accents("cotizacio\u{301}n"),
            fold_accents("cotización")
        );
    }

    #[test]
    fn validate_rejects_missing_title_or_url() {
        assert!(item("Busco proveedor", "https://x.pe/a").validate().is_ok());
        assert_eq!(
            item("  ", "https://x.pe/a").validate(),
            Err(MalformedInput::MissingTitle {
                url: "https://x.pe/a".into()
            })
        );
        assert!(matches!(
            item("Busco proveedor", "").validate(),
            Err(MalformedInput::MissingUrl { .. })
        ));
    }

    #[test]
    fn tagging_text_degrades_to_title_only() {
        assert_eq!(tagging_text("piscina", None), "piscina");
        assert_eq!(tagging_text("piscina", Some("   ")), "piscina");
        assert_eq!(
            tagging_text("piscina", Some("busco proveedor")),
            "piscina busco proveedor"
        );
    }

    #[test]
    fn tag_round_trips_through_str_and_serde() {
        for tag in Tag::ALL {
            assert_eq!(tag.as_str().parse::<Tag>().unwrap(), tag);
            let json = serde_json::to_string(&tag).unwrap();
            assert_eq!(json, format!("\"{}\"", tag.as_str()));
        }
        assert!("dolor".parse::<Tag>().is_err());
        assert!(Tag::Pain.is_lead());
        assert!(Tag::ActiveSearch.is_lead());
        assert!(!Tag::Objection.is_lead());
        assert!(!Tag::Noise.is_lead());
    }

    #[test]
    fn tagged_post_derives_id_from_item() {
        let it = item("Busco proveedor", "https://x.pe/a");
        let post = TaggedPost::from_item(it, Tag::ActiveSearch);
        assert_eq!(post.id, post_id("Busco proveedor", "https://x.pe/a"));
        assert_eq!(post.tag, Tag::ActiveSearch);
    }
}
