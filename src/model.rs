use std::collections::BTreeSet;

use chrono::{DateTime, Utc};
use rkyv::{Archive, Deserialize as RkyvDeserialize, Serialize as RkyvSerialize};
use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};

/// Key prefix for stored video records.
pub const VIDEO_KEY_PREFIX: &str = "video:";
/// Key prefix for the hash -> url alias written next to every record.
pub const HASH_KEY_PREFIX: &str = "hash:";

pub fn video_key(url: &str) -> String {
    format!("{}{}", VIDEO_KEY_PREFIX, url)
}

pub fn hash_key(hash: &str) -> String {
    format!("{}{}", HASH_KEY_PREFIX, hash)
}

/// A key/value pair as it sits in the record store's segment file.
#[derive(Archive, RkyvDeserialize, RkyvSerialize, Debug, Clone, PartialEq)]
#[archive(check_bytes)]
pub struct Entry {
    pub key: String,
    pub value: Vec<u8>,
}

/// The unit of durability: every entry of a batch is written in one append.
#[derive(Archive, RkyvDeserialize, RkyvSerialize, Debug, Clone, PartialEq)]
#[archive(check_bytes)]
pub struct Batch {
    pub entries: Vec<Entry>,

    /// When the batch was recorded (unix seconds)
    pub tx_time: u64,
}

impl Batch {
    pub fn new(entries: Vec<Entry>, tx_time: u64) -> Self {
        Self { entries, tx_time }
    }
}

/// One recognised word of a speech transcript.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
pub struct Word {
    pub token: String,
    /// Seconds from the start of the video
    pub begin: f64,
    pub end: f64,
    /// Recogniser confidence in [0, 1]
    pub confidence: f64,
}

impl Word {
    pub fn new(token: impl Into<String>, begin: f64, end: f64, confidence: f64) -> Self {
        Self { token: token.into(), begin, end, confidence }
    }
}

/// Words in temporal order. Empty until the video has been transcribed.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Default)]
pub struct Transcript {
    pub words: Vec<Word>,
}

impl Transcript {
    pub fn new(words: Vec<Word>) -> Self {
        Self { words }
    }

    pub fn is_empty(&self) -> bool {
        self.words.is_empty()
    }

    pub fn tokens(&self) -> impl Iterator<Item = &str> {
        self.words.iter().map(|w| w.token.as_str())
    }

    pub fn text(&self) -> String {
        self.tokens().collect::<Vec<_>>().join(" ")
    }

    fn validate(&self) -> Result<()> {
        let mut last_begin = f64::NEG_INFINITY;
        for (i, word) in self.words.iter().enumerate() {
            if !word.confidence.is_finite() || !(0.0..=1.0).contains(&word.confidence) {
                return Err(Error::Validation(format!(
                    "word {} ({:?}) has confidence {} outside [0, 1]",
                    i, word.token, word.confidence
                )));
            }
            if !word.begin.is_finite() || !word.end.is_finite() || word.end < word.begin {
                return Err(Error::Validation(format!(
                    "word {} ({:?}) has invalid span {}..{}",
                    i, word.token, word.begin, word.end
                )));
            }
            if word.begin < last_begin {
                return Err(Error::Validation(format!(
                    "word {} ({:?}) begins before the previous word",
                    i, word.token
                )));
            }
            last_begin = word.begin;
        }
        Ok(())
    }
}

/// The primary entity. `url` is the store key, `hash` the index document id
/// (empty until the video has one).
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Default)]
pub struct Video {
    pub title: String,
    pub url: String,
    pub hash: String,
    pub creator: String,
    /// Stamped by the record store on every write
    #[serde(default)]
    pub timestamp: DateTime<Utc>,
    #[serde(default)]
    pub private: bool,
    #[serde(default)]
    pub views: u64,
    #[serde(default)]
    pub likes: BTreeSet<String>,
    #[serde(default)]
    pub dislikes: BTreeSet<String>,
    #[serde(default)]
    pub comments: Vec<i64>,
    #[serde(default)]
    pub transcript: Transcript,
}

impl Video {
    pub fn new(url: impl Into<String>, hash: impl Into<String>, title: impl Into<String>) -> Self {
        Self {
            url: url.into(),
            hash: hash.into(),
            title: title.into(),
            ..Default::default()
        }
    }

    pub fn with_transcript(mut self, transcript: Transcript) -> Self {
        self.transcript = transcript;
        self
    }

    /// Records a like. A voter holds at most one vote, so any dislike is withdrawn.
    pub fn like(&mut self, voter: impl Into<String>) {
        let voter = voter.into();
        self.dislikes.remove(&voter);
        self.likes.insert(voter);
    }

    pub fn dislike(&mut self, voter: impl Into<String>) {
        let voter = voter.into();
        self.likes.remove(&voter);
        self.dislikes.insert(voter);
    }

    /// Checks everything a write must satisfy before it reaches the store.
    pub fn validate(&self) -> Result<()> {
        if self.url.trim().is_empty() {
            return Err(Error::Validation("url must not be empty".into()));
        }
        if self.hash.chars().any(char::is_whitespace) {
            return Err(Error::Validation(format!("hash {:?} must not contain whitespace", self.hash)));
        }
        if let Some(voter) = self.likes.intersection(&self.dislikes).next() {
            return Err(Error::Validation(format!(
                "voter {:?} both likes and dislikes the video",
                voter
            )));
        }
        self.transcript.validate()
    }
}
