use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;

// ============================================================================
// Error Types
// ============================================================================

/// Local persistence errors.
///
/// None of these are fatal: readers substitute an empty collection and
/// writers log and carry on, since the remote source stays authoritative.
#[derive(Debug, Error)]
pub enum StorageError {
    /// Another process holds the cache database lock
    #[error("Another instance of storyshelf appears to be using the cache. Please close it and try again.")]
    InstanceLocked,

    /// Migration failed
    #[error("Cache migration failed: {0}")]
    Migration(String),

    /// Generic database error
    #[error("Cache database error: {0}")]
    Database(#[from] sqlx::Error),

    /// A collection could not be encoded for storage
    #[error("Failed to encode cache value: {0}")]
    Serialize(#[from] serde_json::Error),

    /// Backend refused the operation (disk full, store closed, ...)
    #[error("Cache store unavailable: {0}")]
    Unavailable(String),
}

impl StorageError {
    /// Check if a sqlx error indicates database locking
    pub(crate) fn from_sqlx(err: sqlx::Error) -> Self {
        let error_string = err.to_string().to_lowercase();

        // SQLITE_BUSY (5): database is locked
        // SQLITE_LOCKED (6): database table is locked
        // SQLITE_CANTOPEN (14): unable to open database file
        if error_string.contains("database is locked")
            || error_string.contains("database table is locked")
            || error_string.contains("sqlite_busy")
            || error_string.contains("sqlite_locked")
            || error_string.contains("unable to open database file")
        {
            return StorageError::InstanceLocked;
        }

        StorageError::Database(err)
    }
}

// ============================================================================
// Records
// ============================================================================

/// A story category, replicated read-only from the remote source.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Category {
    pub id: String,
    pub name: String,
    #[serde(default)]
    pub poster_url: Option<String>,
    #[serde(default, with = "timestamp")]
    pub updated_at: Option<DateTime<Utc>>,
}

/// A story record.
///
/// `idx` orders stories and drives featured selection. A `category_id`
/// that is null, or that names no known category, means "uncategorized".
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Story {
    pub id: String,
    pub idx: i64,
    #[serde(default)]
    pub category_id: Option<String>,
    #[serde(default)]
    pub title: String,
    #[serde(default)]
    pub author: Option<String>,
    /// Markdown body
    #[serde(default)]
    pub content: String,
    #[serde(default)]
    pub poster_url: Option<String>,
    #[serde(default, with = "timestamp")]
    pub created_at: Option<DateTime<Utc>>,
    #[serde(default, with = "timestamp")]
    pub updated_at: Option<DateTime<Utc>>,
}

/// Snapshot of both cached collections.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct CachedData {
    pub categories: Vec<Category>,
    pub stories: Vec<Story>,
}

/// Cache statistics shown on the settings screen.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct DatabaseStats {
    pub categories_count: usize,
    pub stories_count: usize,
    pub last_sync: Option<DateTime<Utc>>,
}

// ============================================================================
// Lenient timestamps
// ============================================================================

/// Timestamp (de)serialization that never fails.
///
/// Accepts RFC 3339, Postgres-style `YYYY-MM-DD HH:MM:SS[.f][+tz]` and bare
/// dates. Anything else, including non-string values, decodes to `None`,
/// which the merge treats as the Unix epoch.
pub mod timestamp {
    use chrono::{DateTime, NaiveDate, NaiveDateTime, Utc};
    use serde::{de::IgnoredAny, Deserialize, Deserializer, Serializer};

    const ZONED_FORMATS: &[&str] = &["%Y-%m-%d %H:%M:%S%.f%#z", "%Y-%m-%dT%H:%M:%S%.f%#z"];
    const NAIVE_FORMATS: &[&str] = &["%Y-%m-%d %H:%M:%S%.f", "%Y-%m-%dT%H:%M:%S%.f"];

    /// Parse a timestamp string, returning `None` for anything unrecognised.
    pub fn parse(raw: &str) -> Option<DateTime<Utc>> {
        let raw = raw.trim();
        if raw.is_empty() {
            return None;
        }

        if let Ok(dt) = DateTime::parse_from_rfc3339(raw) {
            return Some(dt.with_timezone(&Utc));
        }
        for format in ZONED_FORMATS {
            if let Ok(dt) = DateTime::parse_from_str(raw, format) {
                return Some(dt.with_timezone(&Utc));
            }
        }
        for format in NAIVE_FORMATS {
            if let Ok(naive) = NaiveDateTime::parse_from_str(raw, format) {
                return Some(naive.and_utc());
            }
        }
        NaiveDate::parse_from_str(raw, "%Y-%m-%d")
            .ok()
            .and_then(|date| date.and_hms_opt(0, 0, 0))
            .map(|naive| naive.and_utc())
    }

    #[derive(Deserialize)]
    #[serde(untagged)]
    enum Raw {
        Text(String),
        Other(IgnoredAny),
    }

    pub fn serialize<S>(value: &Option<DateTime<Utc>>, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        match value {
            Some(dt) => serializer.serialize_str(&dt.to_rfc3339()),
            None => serializer.serialize_none(),
        }
    }

    pub fn deserialize<'de, D>(deserializer: D) -> Result<Option<DateTime<Utc>>, D::Error>
    where
        D: Deserializer<'de>,
    {
        Ok(match Option::<Raw>::deserialize(deserializer)? {
            Some(Raw::Text(text)) => parse(&text),
            Some(Raw::Other(_)) | None => None,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    #[test]
    fn test_parse_rfc3339() {
        let parsed = timestamp::parse("2024-02-01T10:30:00Z").unwrap();
        assert_eq!(parsed, Utc.with_ymd_and_hms(2024, 2, 1, 10, 30, 0).unwrap());
    }

    #[test]
    fn test_parse_postgres_style() {
        let parsed = timestamp::parse("2024-02-01 10:30:00.123456+00").unwrap();
        assert_eq!(parsed.date_naive().to_string(), "2024-02-01");

        let offset = timestamp::parse("2024-02-01T12:30:00+02:00").unwrap();
        assert_eq!(offset, Utc.with_ymd_and_hms(2024, 2, 1, 10, 30, 0).unwrap());
    }

    #[test]
    fn test_parse_bare_date() {
        let parsed = timestamp::parse("2024-01-15").unwrap();
        assert_eq!(parsed, Utc.with_ymd_and_hms(2024, 1, 15, 0, 0, 0).unwrap());
    }

    #[test]
    fn test_parse_garbage_is_none() {
        assert!(timestamp::parse("").is_none());
        assert!(timestamp::parse("   ").is_none());
        assert!(timestamp::parse("yesterday").is_none());
        assert!(timestamp::parse("2024-13-45").is_none());
    }

    #[test]
    fn test_category_decodes_malformed_timestamp_as_none() {
        let json = r#"{"id":"a","name":"Fables","poster_url":null,"updated_at":"not a date"}"#;
        let category: Category = serde_json::from_str(json).unwrap();
        assert_eq!(category.id, "a");
        assert!(category.updated_at.is_none());

        let json = r#"{"id":"b","name":"Myths","updated_at":12345}"#;
        let category: Category = serde_json::from_str(json).unwrap();
        assert!(category.updated_at.is_none());
        assert!(category.poster_url.is_none());
    }

    #[test]
    fn test_story_decodes_remote_row() {
        let json = r##"{
            "id": "s1",
            "idx": 10,
            "category_id": null,
            "title": "The Fox",
            "author": "Anon",
            "content": "# Once upon a time",
            "poster_url": "https://cdn.example.com/fox.png",
            "created_at": "2024-01-01 08:00:00+00",
            "updated_at": "2024-01-02T08:00:00Z",
            "extra_column": true
        }"##;
        let story: Story = serde_json::from_str(json).unwrap();
        assert_eq!(story.idx, 10);
        assert!(story.category_id.is_none());
        assert_eq!(story.author.as_deref(), Some("Anon"));
        assert!(story.created_at.is_some());
        assert!(story.updated_at.is_some());
    }

    #[test]
    fn test_story_survives_cache_round_trip() {
        let story = Story {
            id: "s1".to_string(),
            idx: 3,
            category_id: Some("c1".to_string()),
            title: "Title".to_string(),
            author: None,
            content: "Body".to_string(),
            poster_url: None,
            created_at: None,
            updated_at: Some(Utc.with_ymd_and_hms(2024, 3, 1, 0, 0, 0).unwrap()),
        };
        let encoded = serde_json::to_string(&story).unwrap();
        let decoded: Story = serde_json::from_str(&encoded).unwrap();
        assert_eq!(decoded, story);
    }
}
