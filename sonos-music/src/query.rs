//! Structured search query grammar.
//!
//! Search terms may combine `artist:`, `album:` and `track:` prefixes; any
//! remaining bare text binds to the title. A prefix captures everything up
//! to the next prefix. All comparisons downstream are case-insensitive, so
//! fields are stored lowercased.

use serde::Serialize;

/// What a music search is asking for.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum SearchKind {
    Album,
    Song,
    Station,
    Artist,
}

impl SearchKind {
    pub fn parse(value: &str) -> Option<Self> {
        match value.to_lowercase().as_str() {
            "album" => Some(SearchKind::Album),
            "song" | "track" => Some(SearchKind::Song),
            "station" => Some(SearchKind::Station),
            "artist" => Some(SearchKind::Artist),
            _ => None,
        }
    }
}

/// A parsed search term. Empty fields are `None`; values are lowercased
/// and trimmed.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct StructuredQuery {
    pub artist: Option<String>,
    pub album: Option<String>,
    pub track: Option<String>,
    /// Bare text with no prefix
    pub title: Option<String>,
}

impl StructuredQuery {
    pub fn parse(term: &str) -> Self {
        #[derive(Clone, Copy, PartialEq)]
        enum Field {
            Artist,
            Album,
            Track,
            Title,
        }

        let mut fields: [(Field, String); 4] = [
            (Field::Artist, String::new()),
            (Field::Album, String::new()),
            (Field::Track, String::new()),
            (Field::Title, String::new()),
        ];
        let mut current = Field::Title;

        for word in term.split_whitespace() {
            let lower = word.to_lowercase();
            let (field, remainder) = if let Some(rest) = lower.strip_prefix("artist:") {
                (Field::Artist, rest.to_string())
            } else if let Some(rest) = lower.strip_prefix("album:") {
                (Field::Album, rest.to_string())
            } else if let Some(rest) = lower.strip_prefix("track:") {
                (Field::Track, rest.to_string())
            } else {
                (current, lower)
            };
            current = field;
            let slot = &mut fields
                .iter_mut()
                .find(|(f, _)| *f == field)
                .expect("field slot exists")
                .1;
            if !remainder.is_empty() {
                if !slot.is_empty() {
                    slot.push(' ');
                }
                slot.push_str(&remainder);
            }
        }

        let take = |target: Field, fields: &[(Field, String); 4]| {
            fields
                .iter()
                .find(|(f, _)| *f == target)
                .map(|(_, s)| s.clone())
                .filter(|s| !s.is_empty())
        };

        Self {
            artist: take(Field::Artist, &fields),
            album: take(Field::Album, &fields),
            track: take(Field::Track, &fields),
            title: take(Field::Title, &fields),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.artist.is_none()
            && self.album.is_none()
            && self.track.is_none()
            && self.title.is_none()
    }

    /// Number of structured fields present (title counts as `track`).
    pub fn field_count(&self) -> usize {
        [
            self.artist.is_some(),
            self.album.is_some(),
            self.track.is_some() || self.title.is_some(),
        ]
        .iter()
        .filter(|present| **present)
        .count()
    }

    /// The track/title text, whichever was given.
    pub fn track_text(&self) -> Option<&str> {
        self.track.as_deref().or(self.title.as_deref())
    }

    /// Everything concatenated, for single-string fallbacks.
    pub fn flat_text(&self) -> String {
        let mut parts = Vec::new();
        if let Some(artist) = &self.artist {
            parts.push(artist.as_str());
        }
        if let Some(album) = &self.album {
            parts.push(album.as_str());
        }
        if let Some(track) = self.track_text() {
            parts.push(track);
        }
        parts.join(" ")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_bare_text_binds_to_title() {
        let q = StructuredQuery::parse("Harvest Moon");
        assert_eq!(q.title.as_deref(), Some("harvest moon"));
        assert!(q.artist.is_none());
        assert_eq!(q.field_count(), 1);
    }

    #[test]
    fn test_prefix_captures_following_words() {
        let q = StructuredQuery::parse("artist:neil young album:harvest moon");
        assert_eq!(q.artist.as_deref(), Some("neil young"));
        assert_eq!(q.album.as_deref(), Some("harvest moon"));
        assert!(q.title.is_none());
        assert_eq!(q.field_count(), 2);
    }

    #[test]
    fn test_all_three_fields() {
        let q = StructuredQuery::parse("track:old man artist:neil album:harvest");
        assert_eq!(q.track.as_deref(), Some("old man"));
        assert_eq!(q.artist.as_deref(), Some("neil"));
        assert_eq!(q.album.as_deref(), Some("harvest"));
        assert_eq!(q.field_count(), 3);
    }

    #[test]
    fn test_case_insensitive_prefixes() {
        let q = StructuredQuery::parse("ARTIST:Beatles");
        assert_eq!(q.artist.as_deref(), Some("beatles"));
    }

    #[test]
    fn test_empty_query() {
        assert!(StructuredQuery::parse("").is_empty());
        assert!(StructuredQuery::parse("   ").is_empty());
    }

    #[test]
    fn test_search_kind_aliases() {
        assert_eq!(SearchKind::parse("song"), Some(SearchKind::Song));
        assert_eq!(SearchKind::parse("track"), Some(SearchKind::Song));
        assert_eq!(SearchKind::parse("ALBUM"), Some(SearchKind::Album));
        assert_eq!(SearchKind::parse("podcast"), None);
    }
}
