//! Text-to-speech contract.
//!
//! Synthesis and file serving are external collaborators; the router only
//! needs a URL a player can fetch. Implementations must return an
//! `http://<ip>:<port>/...` URL reachable from the players' network (by IP,
//! not hostname).

use crate::error::Result;

/// A synthesized announcement clip ready for playback.
#[derive(Debug, Clone)]
pub struct TtsClip {
    /// URL the player streams the clip from
    pub url: String,
    /// Clip length, used to bound the wait before restoring playback
    pub duration_ms: Option<u64>,
}

pub trait TtsProvider: Send + Sync {
    /// Synthesize `text` (or return a cached clip) and serve it.
    fn synthesize(&self, text: &str, language: Option<&str>) -> Result<TtsClip>;
}
