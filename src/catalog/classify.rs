//! Per-item validation, content classification and catalog ingestion.

use tracing::debug;

use super::{AudioRecord, Catalog, Upserted};
use crate::error::Result;
use crate::source::{AudioContent, Content, Message};

/// What a message carries, as far as the mirror cares.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ContentKind {
    /// The message lacks an id, feed id, date or content.
    None,
    Audio,
    Text,
    Photo,
    Video,
    Document,
    VoiceNote,
    Other,
}

/// Classify `message` without touching the catalog.
pub fn classify(message: &Message) -> ContentKind {
    let (Some(_), Some(_), Some(_), Some(content)) =
        (message.id, message.feed_id, message.date, &message.content)
    else {
        return ContentKind::None;
    };
    match content {
        Content::Audio(_) => ContentKind::Audio,
        Content::Text { .. } => ContentKind::Text,
        Content::Photo => ContentKind::Photo,
        Content::Video => ContentKind::Video,
        Content::Document => ContentKind::Document,
        Content::VoiceNote => ContentKind::VoiceNote,
        Content::Unsupported => ContentKind::Other,
    }
}

/// Classify `message` and, if it is a complete audio item, upsert it.
///
/// Malformed and non-audio items come back with no upsert result; so do audio
/// items whose upload is still in progress. Only storage failures are errors.
pub async fn classify_and_ingest<C>(
    catalog: &C,
    message: &Message,
) -> Result<(ContentKind, Option<Upserted>)>
where
    C: Catalog + ?Sized,
{
    let kind = classify(message);
    if kind != ContentKind::Audio {
        return Ok((kind, None));
    }

    let Some(record) = audio_record(message) else {
        debug!(
            feed_id = message.feed_id,
            message_id = message.id,
            "Skipping incomplete audio item"
        );
        return Ok((kind, None));
    };

    let upserted = catalog.upsert(&record).await?;
    Ok((kind, Some(upserted)))
}

/// Build a record from a validated audio message.
///
/// `None` when a required audio field is missing or the upload has not
/// finished.
fn audio_record(message: &Message) -> Option<AudioRecord> {
    let Some(Content::Audio(audio)) = &message.content else {
        return None;
    };
    let AudioContent {
        title,
        performer,
        file_name,
        duration,
        mime_type,
        file,
    } = audio;
    let file = file.as_ref()?;
    if !file.is_uploading_completed {
        return None;
    }

    Some(AudioRecord {
        feed_id: message.feed_id?,
        message_id: message.id?,
        date: message.date?,
        file_id: file.id?,
        title: title.clone(),
        performer: performer.clone(),
        file_name: file_name.clone(),
        duration: (*duration)?,
        mime_type: mime_type.clone(),
        size: file.size.unwrap_or(0),
        local_path: file.local_path.clone().filter(|p| !p.is_empty()),
        downloaded: file.is_downloading_completed,
    })
}
