//! The article and book data model produced by the orchestrator.
//!
//! Types here derive `Serialize`/`Deserialize` so a collaborator can render
//! them directly to Markdown, JSON, or a document format; this crate does
//! not implement a renderer.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Placeholder body text substituted for a subtopic/topic that failed to
/// generate after all retries, so the artifact stays structurally complete.
pub const DEGRADED_PLACEHOLDER: &str = "[content unavailable]";

/// A generated long-form article.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Article {
    pub id: uuid::Uuid,
    pub title: String,
    pub description: String,
    pub published_at: DateTime<Utc>,
    pub image_uri: Option<String>,
    pub tags: Vec<String>,
    pub sections: Vec<Section>,
}

/// One section of an article; invariant: has at least one subtopic once populated.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Section {
    pub title: String,
    pub subtopics: Vec<SubTopic>,
}

/// A single unit of generated prose within a section.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SubTopic {
    pub title: String,
    pub body: String,
}

/// A generated multi-chapter book.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Book {
    pub id: uuid::Uuid,
    pub title: String,
    pub chapters: Vec<Chapter>,
    pub output_file: Option<String>,
    pub tags: Vec<String>,
    pub published_at: DateTime<Utc>,
}

/// One chapter; `number` is 1-indexed and contiguous across a book.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Chapter {
    pub number: u32,
    pub title: String,
    pub topics: Vec<Topic>,
}

/// A single unit of generated prose within a chapter.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Topic {
    pub title: String,
    pub body: String,
}

/// Typed response from the `outline` stage, before subtopic bodies exist.
#[derive(Debug, Clone, Deserialize)]
pub struct OutlineResponse {
    pub title: String,
    pub description: String,
    #[serde(default)]
    pub tags: Vec<String>,
    pub sections: Vec<OutlineSection>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct OutlineSection {
    pub title: String,
    pub subtopics: Vec<String>,
}

/// Typed response from the `book-outline` stage.
#[derive(Debug, Clone, Deserialize)]
pub struct BookOutlineResponse {
    pub title: String,
    pub chapters: Vec<BookOutlineChapter>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct BookOutlineChapter {
    pub title: String,
}

/// Typed response from the `chapter-topics` stage.
#[derive(Debug, Clone, Deserialize)]
pub struct ChapterTopicsResponse {
    pub topics: Vec<String>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_article_round_trips_through_json() {
        let article = Article {
            id: uuid::Uuid::new_v4(),
            title: "Batch Processing".into(),
            description: "An overview".into(),
            published_at: Utc::now(),
            image_uri: None,
            tags: vec!["systems".into()],
            sections: vec![Section {
                title: "Intro".into(),
                subtopics: vec![SubTopic {
                    title: "Why batch".into(),
                    body: "Because...".into(),
                }],
            }],
        };
        let json = serde_json::to_string(&article).unwrap();
        let back: Article = serde_json::from_str(&json).unwrap();
        assert_eq!(back.title, article.title);
        assert_eq!(back.sections.len(), 1);
    }

    #[test]
    fn test_outline_response_parses_minimal_json() {
        let raw = r#"{"title":"t","description":"d","sections":[{"title":"s","subtopics":["a","b"]}]}"#;
        let outline: OutlineResponse = serde_json::from_str(raw).unwrap();
        assert_eq!(outline.sections[0].subtopics.len(), 2);
        assert!(outline.tags.is_empty());
    }
}
