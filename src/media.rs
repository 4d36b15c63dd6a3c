use chrono::{DateTime, Utc};
use rand::RngCore;
use serde::{Deserialize, Serialize};

use crate::fetch::{ContentRef, Resolution};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MediaKind {
    Photo,
    Audio,
    Voice,
    Document,
    Sticker,
    Video,
    Animation,
    VideoNote,
    Poll,
    Contact,
}

impl MediaKind {
    pub const ALL: [MediaKind; 10] = [
        MediaKind::Photo,
        MediaKind::Audio,
        MediaKind::Voice,
        MediaKind::Document,
        MediaKind::Sticker,
        MediaKind::Video,
        MediaKind::Animation,
        MediaKind::VideoNote,
        MediaKind::Poll,
        MediaKind::Contact,
    ];

    pub fn as_str(self) -> &'static str {
        match self {
            MediaKind::Photo => "photo",
            MediaKind::Audio => "audio",
            MediaKind::Voice => "voice",
            MediaKind::Document => "document",
            MediaKind::Sticker => "sticker",
            MediaKind::Video => "video",
            MediaKind::Animation => "animation",
            MediaKind::VideoNote => "video_note",
            MediaKind::Poll => "poll",
            MediaKind::Contact => "contact",
        }
    }

    /// Directory under the chat's export folder. `None` for kinds that are
    /// rendered inline and never stored as files.
    pub fn dir_name(self) -> Option<&'static str> {
        match self {
            MediaKind::Photo => Some("photos"),
            MediaKind::Audio => Some("audios"),
            MediaKind::Voice => Some("voices"),
            MediaKind::Document => Some("documents"),
            MediaKind::Sticker => Some("stickers"),
            MediaKind::Video => Some("videos"),
            MediaKind::Animation => Some("animations"),
            MediaKind::VideoNote => Some("video_notes"),
            MediaKind::Poll | MediaKind::Contact => None,
        }
    }

    pub fn downloadable(self) -> bool {
        self.dir_name().is_some()
    }

    pub fn has_size_limit(self) -> bool {
        self.downloadable()
    }

    pub fn default_extension(self) -> &'static str {
        match self {
            MediaKind::Photo => ".jpg",
            MediaKind::Voice => ".ogg",
            MediaKind::Video | MediaKind::Animation | MediaKind::VideoNote => ".mp4",
            MediaKind::Document => ".zip",
            MediaKind::Sticker => ".webp",
            MediaKind::Audio => ".mp3",
            MediaKind::Poll | MediaKind::Contact => ".unknown",
        }
    }
}

impl std::fmt::Display for MediaKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Thumbnail {
    pub content_ref: ContentRef,
    pub size: Option<u64>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MediaFile {
    pub content_ref: ContentRef,
    pub size: Option<u64>,
    pub mime_type: Option<String>,
    pub thumbnail: Option<Thumbnail>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MessageMedia {
    pub kind: MediaKind,
    pub file: Option<MediaFile>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ExportMessage {
    pub id: i64,
    pub chat_id: i64,
    pub date: DateTime<Utc>,
    pub media: Option<MessageMedia>,
}

impl ExportMessage {
    /// Current references for this message's file and thumbnail.
    pub fn resolution(&self) -> Resolution {
        match self.media.as_ref().and_then(|media| media.file.as_ref()) {
            Some(file) => Resolution::Available {
                content: file.content_ref.clone(),
                thumbnail: file
                    .thumbnail
                    .as_ref()
                    .map(|thumb| thumb.content_ref.clone()),
            },
            None => Resolution::Unavailable,
        }
    }
}

/// `{kind}_{YYYY-MM-DD_HH-MM-SS}_{random}{ext}`.
pub fn media_file_name<R: RngCore + ?Sized>(
    kind: MediaKind,
    mime_type: Option<&str>,
    date: DateTime<Utc>,
    rng: &mut R,
) -> String {
    format!(
        "{}_{}_{}{}",
        kind.as_str(),
        date.format("%Y-%m-%d_%H-%M-%S"),
        rng.next_u32(),
        extension_for(kind, mime_type),
    )
}

fn extension_for(kind: MediaKind, mime_type: Option<&str>) -> String {
    if kind == MediaKind::Photo || !kind.downloadable() {
        return kind.default_extension().to_string();
    }
    mime_type
        .and_then(mime_guess::get_mime_extensions_str)
        .and_then(|extensions| extensions.first())
        .map(|ext| format!(".{ext}"))
        .unwrap_or_else(|| kind.default_extension().to_string())
}
