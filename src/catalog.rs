//! Article audio catalog
//!
//! The content layer hands the audio subsystem opaque
//! `(article_id, audio_url, article_number?)` tuples. The catalog keeps them in
//! reading order so proximity preload can look ahead.

use std::path::Path;

use indexmap::IndexMap;
use serde::{Deserialize, Serialize};

/// One article's audio commentary
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ArticleAudio {
    pub article_id: String,
    pub audio_url: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub article_number: Option<String>,
}

impl ArticleAudio {
    pub fn new(article_id: impl Into<String>, audio_url: impl Into<String>) -> Self {
        Self {
            article_id: article_id.into(),
            audio_url: audio_url.into(),
            article_number: None,
        }
    }

    pub fn with_number(mut self, number: impl Into<String>) -> Self {
        self.article_number = Some(number.into());
        self
    }
}

/// Articles in reading order
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Catalog {
    articles: Vec<ArticleAudio>,
}

impl Catalog {
    pub fn new(articles: Vec<ArticleAudio>) -> Self {
        Self { articles }
    }

    /// Load a catalog from a JSON array of articles
    pub fn load_from_file(path: &Path) -> anyhow::Result<Self> {
        let content = std::fs::read_to_string(path)?;
        Ok(serde_json::from_str(&content)?)
    }

    pub fn get(&self, article_id: &str) -> Option<&ArticleAudio> {
        self.articles.iter().find(|a| a.article_id == article_id)
    }

    pub fn len(&self) -> usize {
        self.articles.len()
    }

    pub fn is_empty(&self) -> bool {
        self.articles.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = &ArticleAudio> {
        self.articles.iter()
    }

    /// Ordered `article_id -> audio_url` map, skipping articles without audio
    pub fn url_map(&self) -> IndexMap<String, String> {
        self.articles
            .iter()
            .filter(|a| !a.audio_url.trim().is_empty())
            .map(|a| (a.article_id.clone(), a.audio_url.clone()))
            .collect()
    }
}
