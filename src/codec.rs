//! Record codec: `Video` <-> stored bytes.
//!
//! Records are JSON with field-name tags and the transcript nested as a
//! structured value. Older writers stored the transcript as a JSON *string*
//! holding a second, independently encoded document, used Go-style
//! capitalised word fields and wrote absent lists as `null`. `decode` accepts
//! all of that; nothing outside this module ever sees the legacy shape.

use std::collections::BTreeSet;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};
use crate::model::{Transcript, Video, Word};

pub fn encode(video: &Video) -> Result<Vec<u8>> {
    serde_json::to_vec(video).map_err(|e| Error::Validation(format!("unencodable record: {}", e)))
}

pub fn decode(bytes: &[u8]) -> Result<Video> {
    let stored: StoredVideo =
        serde_json::from_slice(bytes).map_err(|e| Error::Decode(e.to_string()))?;
    stored.into_video()
}

/// Encodes with the transcript double-encoded as a nested JSON string, for
/// consumers that still expect the legacy wire shape byte for byte.
pub fn encode_legacy(video: &Video) -> Result<Vec<u8>> {
    let transcript = LegacyTranscript {
        words: video
            .transcript
            .words
            .iter()
            .map(|w| LegacyWord {
                token: &w.token,
                begin: w.begin,
                end: w.end,
                confidence: w.confidence,
            })
            .collect(),
    };
    let inner = serde_json::to_string(&transcript)
        .map_err(|e| Error::Validation(format!("unencodable transcript: {}", e)))?;

    let outer = LegacyVideo {
        title: &video.title,
        url: &video.url,
        hash: &video.hash,
        creator: &video.creator,
        timestamp: video.timestamp,
        private: video.private,
        views: video.views,
        likes: &video.likes,
        dislikes: &video.dislikes,
        comments: &video.comments,
        transcript: inner,
    };
    serde_json::to_vec(&outer).map_err(|e| Error::Validation(format!("unencodable record: {}", e)))
}

// --- Wire shapes ---

#[derive(Deserialize)]
struct StoredVideo {
    #[serde(default)]
    title: String,
    url: String,
    #[serde(default)]
    hash: String,
    #[serde(default)]
    creator: String,
    #[serde(default)]
    timestamp: DateTime<Utc>,
    #[serde(default)]
    private: bool,
    #[serde(default)]
    views: u64,
    #[serde(default)]
    likes: Option<BTreeSet<String>>,
    #[serde(default)]
    dislikes: Option<BTreeSet<String>>,
    #[serde(default)]
    comments: Option<Vec<i64>>,
    #[serde(default)]
    transcript: Option<StoredTranscript>,
}

#[derive(Deserialize)]
#[serde(untagged)]
enum StoredTranscript {
    Structured(TranscriptBody),
    /// Legacy: the transcript document encoded a second time into a string
    Encoded(String),
}

#[derive(Deserialize)]
struct TranscriptBody {
    #[serde(alias = "Words", default)]
    words: Option<Vec<StoredWord>>,
}

#[derive(Deserialize)]
struct StoredWord {
    #[serde(alias = "Token")]
    token: String,
    #[serde(alias = "Begin")]
    begin: f64,
    #[serde(alias = "End")]
    end: f64,
    #[serde(alias = "Confidence")]
    confidence: f64,
}

impl StoredVideo {
    fn into_video(self) -> Result<Video> {
        let transcript = match self.transcript {
            None => Transcript::default(),
            Some(StoredTranscript::Structured(body)) => body.into_transcript(),
            Some(StoredTranscript::Encoded(raw)) if raw.trim().is_empty() => Transcript::default(),
            Some(StoredTranscript::Encoded(raw)) => {
                let body: TranscriptBody = serde_json::from_str(&raw)
                    .map_err(|e| Error::Decode(format!("nested transcript: {}", e)))?;
                body.into_transcript()
            }
        };

        Ok(Video {
            title: self.title,
            url: self.url,
            hash: self.hash,
            creator: self.creator,
            timestamp: self.timestamp,
            private: self.private,
            views: self.views,
            likes: self.likes.unwrap_or_default(),
            dislikes: self.dislikes.unwrap_or_default(),
            comments: self.comments.unwrap_or_default(),
            transcript,
        })
    }
}

impl TranscriptBody {
    fn into_transcript(self) -> Transcript {
        let words = self
            .words
            .unwrap_or_default()
            .into_iter()
            .map(|w| Word::new(w.token, w.begin, w.end, w.confidence))
            .collect();
        Transcript::new(words)
    }
}

#[derive(Serialize)]
struct LegacyVideo<'a> {
    title: &'a str,
    url: &'a str,
    hash: &'a str,
    creator: &'a str,
    timestamp: DateTime<Utc>,
    private: bool,
    views: u64,
    likes: &'a BTreeSet<String>,
    dislikes: &'a BTreeSet<String>,
    comments: &'a [i64],
    transcript: String,
}

#[derive(Serialize)]
#[serde(rename_all = "PascalCase")]
struct LegacyTranscript<'a> {
    words: Vec<LegacyWord<'a>>,
}

#[derive(Serialize)]
#[serde(rename_all = "PascalCase")]
struct LegacyWord<'a> {
    token: &'a str,
    begin: f64,
    end: f64,
    confidence: f64,
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn sample() -> Video {
        let mut v = Video::new("abc", "h1", "Test").with_transcript(Transcript::new(vec![
            Word::new("hello", 0.0, 0.4, 0.97),
            Word::new("world", 0.5, 0.9, 0.88),
        ]));
        v.creator = "carol".into();
        v.timestamp = Utc.with_ymd_and_hms(2016, 11, 12, 17, 17, 19).unwrap();
        v.private = true;
        v.views = 42;
        v.like("alice");
        v.dislike("bob");
        v.comments = vec![3, 1, 2];
        v
    }

    #[test]
    fn decode_inverts_encode() {
        let v = sample();
        let back = decode(&encode(&v).unwrap()).unwrap();
        assert_eq!(back, v);
    }

    #[test]
    fn transcript_is_nested_structurally() {
        let bytes = encode(&sample()).unwrap();
        let json: serde_json::Value = serde_json::from_slice(&bytes).unwrap();
        assert!(json["transcript"]["words"].is_array());
        assert_eq!(json["transcript"]["words"][0]["token"], "hello");
    }

    #[test]
    fn encoding_is_deterministic() {
        let mut a = sample();
        let mut b = sample();
        a.like("zed");
        a.like("amy");
        b.like("amy");
        b.like("zed");
        assert_eq!(encode(&a).unwrap(), encode(&b).unwrap());
    }

    #[test]
    fn legacy_double_encoded_record_decodes() {
        let v = sample();
        let legacy = encode_legacy(&v).unwrap();

        let json: serde_json::Value = serde_json::from_slice(&legacy).unwrap();
        assert!(json["transcript"].is_string());

        assert_eq!(decode(&legacy).unwrap(), v);
    }

    #[test]
    fn go_style_record_with_nulls_decodes() {
        let raw = br#"{
            "title": "Sample Title",
            "url": "videotitle.webm",
            "hash": "a1b2c3d4-e5f6g7h8",
            "creator": "",
            "timestamp": "2016-11-12T17:17:19.308362547-08:00",
            "private": true,
            "views": 0,
            "likes": null,
            "dislikes": null,
            "comments": null,
            "transcript": {"Words": [{"Token": "hi", "Begin": 0.1, "End": 0.3, "Confidence": 0.5}]}
        }"#;
        let v = decode(raw).unwrap();
        assert_eq!(v.hash, "a1b2c3d4-e5f6g7h8");
        assert!(v.likes.is_empty());
        assert!(v.comments.is_empty());
        assert_eq!(v.transcript.words[0].token, "hi");
        assert_eq!(v.timestamp, Utc.with_ymd_and_hms(2016, 11, 13, 1, 17, 19).unwrap() + chrono::Duration::nanoseconds(308_362_547));
    }

    #[test]
    fn empty_legacy_transcript_string_is_empty() {
        let raw = br#"{"url": "abc", "hash": "h1", "transcript": ""}"#;
        assert!(decode(raw).unwrap().transcript.is_empty());
    }

    #[test]
    fn malformed_bytes_are_decode_errors() {
        for raw in [&b"not json"[..], b"{\"url\": 5}", b"", b"{\"url\":\"a\",\"transcript\":\"{oops\"}"] {
            assert!(matches!(decode(raw), Err(Error::Decode(_))), "{:?}", raw);
        }
    }
}
