//! Offload attachments on append, expand them on read.
//!
//! Offload decision for one attachment value:
//!
//! 1. URLs and existing `@blob:` references are left alone.
//! 2. `image/*`, `audio/*`, `video/*` and `application/pdf` are
//!    binary-likely and always offloaded.
//! 3. Anything else is offloaded when its estimated decoded size exceeds the
//!    threshold (5 KiB by default).
//!
//! Store failures are logged and the value stays inline. Expansion turns
//! references back into base64 data URIs, drops attachments the active model
//! does not accept, and replaces unresolvable references with a short text
//! notice.

use crate::blob::{BlobMetadata, BlobSource, BlobStore};
use crate::manager::events::{ContextEvent, EventHandler, NoopHandler};
use crate::{BLOB_REF_PREFIX, ContentPart, MediaData};
use base64::Engine;
use base64::engine::general_purpose::{STANDARD, STANDARD_NO_PAD, URL_SAFE, URL_SAFE_NO_PAD};
use futures::future::join_all;
use std::sync::Arc;
use tracing::{debug, warn};

/// Default offload threshold (5 KiB of decoded payload).
pub const DEFAULT_OFFLOAD_THRESHOLD_BYTES: usize = 5 * 1024;

/// Strings shorter than this are never treated as bare base64.
const BASE64_MIN_LEN: usize = 100;

const FALLBACK_MIME: &str = "application/octet-stream";

/// Whether a media type is offloaded regardless of size.
pub fn is_binary_likely(mime_type: &str) -> bool {
    let mime = essence(mime_type);
    mime.starts_with("image/")
        || mime.starts_with("audio/")
        || mime.starts_with("video/")
        || mime == "application/pdf"
}

/// Media type without parameters, lowercased.
fn essence(mime_type: &str) -> String {
    mime_type
        .split(';')
        .next()
        .unwrap_or("")
        .trim()
        .to_ascii_lowercase()
}

/// Whether `mime_type` matches an allowed pattern such as `image/*`.
pub fn mime_matches(pattern: &str, mime_type: &str) -> bool {
    let pattern = essence(pattern);
    let mime = essence(mime_type);
    if pattern == "*" || pattern == "*/*" {
        return true;
    }
    match pattern.strip_suffix('*') {
        Some(prefix) if prefix.ends_with('/') => mime.starts_with(prefix),
        _ => pattern == mime,
    }
}

fn is_allowed(allowed: Option<&[String]>, mime_type: &str) -> bool {
    allowed.is_none_or(|patterns| patterns.iter().any(|p| mime_matches(p, mime_type)))
}

/// Split a data URI into `(media type, is_base64, payload)`.
fn parse_data_uri(value: &str) -> Option<(&str, bool, &str)> {
    let rest = value.strip_prefix("data:")?;
    let (header, payload) = rest.split_once(',')?;
    match header.strip_suffix(";base64") {
        Some(mime) => Some((mime, true, payload)),
        None => Some((header, false, payload)),
    }
}

fn looks_like_base64(value: &str) -> bool {
    value.len() > BASE64_MIN_LEN
        && value
            .bytes()
            .all(|b| b.is_ascii_alphanumeric() || matches!(b, b'+' | b'/' | b'=' | b'\n' | b'\r'))
}

/// Decode standard or url-safe base64, padded or not. Line breaks are
/// ignored.
fn decode_base64(value: &str) -> Option<Vec<u8>> {
    let compact: String = value.chars().filter(|c| !c.is_ascii_whitespace()).collect();
    [&STANDARD, &STANDARD_NO_PAD, &URL_SAFE, &URL_SAFE_NO_PAD]
        .into_iter()
        .find_map(|engine| engine.decode(&compact).ok())
}

/// Decoded bytes of an inline value that is neither a URI nor a reference,
/// when it carries base64. Binary-likely types are always read as base64;
/// other types only when the value looks like it.
pub fn decode_bare_base64(value: &str, mime_type: &str) -> Option<Vec<u8>> {
    if is_binary_likely(mime_type) || looks_like_base64(value) {
        decode_base64(value)
    } else {
        None
    }
}

/// Estimated decoded size in bytes. `None` for URLs and blob references,
/// which are never offloaded.
pub fn estimate_size(data: &MediaData) -> Option<usize> {
    if data.is_url() || data.blob_uri().is_some() {
        return None;
    }
    match data {
        MediaData::Bytes(bytes) => Some(bytes.len()),
        MediaData::Text(s) => Some(match parse_data_uri(s) {
            Some((_, true, payload)) => payload.len() * 3 / 4,
            Some((_, false, payload)) => payload.len(),
            None if looks_like_base64(s) => s.len() * 3 / 4,
            None => s.len(),
        }),
    }
}

/// Raw bytes to store for an attachment value. `None` when a payload that
/// must be base64 does not decode; such values stay inline.
fn payload_bytes(data: &MediaData, mime_type: &str) -> Option<Vec<u8>> {
    match data {
        MediaData::Bytes(bytes) => Some(bytes.clone()),
        MediaData::Text(s) => match parse_data_uri(s) {
            Some((_, true, payload)) => decode_base64(payload),
            Some((_, false, payload)) => Some(payload.as_bytes().to_vec()),
            None => match decode_bare_base64(s, mime_type) {
                Some(bytes) => Some(bytes),
                None if is_binary_likely(mime_type) => None,
                None => Some(s.as_bytes().to_vec()),
            },
        },
    }
}

/// Media type embedded in a data URI, if any.
fn data_uri_mime(data: &MediaData) -> Option<&str> {
    match data {
        MediaData::Text(s) => parse_data_uri(s)
            .map(|(mime, _, _)| mime)
            .filter(|m| !m.is_empty()),
        MediaData::Bytes(_) => None,
    }
}

/// Moves large attachments into a [`BlobStore`] and back.
pub struct BlobResolver {
    store: Arc<dyn BlobStore>,
    events: Arc<dyn EventHandler>,
    threshold_bytes: usize,
}

impl BlobResolver {
    pub fn new(store: Arc<dyn BlobStore>) -> Self {
        Self {
            store,
            events: Arc::new(NoopHandler),
            threshold_bytes: DEFAULT_OFFLOAD_THRESHOLD_BYTES,
        }
    }

    /// Observer notified with [`ContextEvent::BlobStored`] after each offload.
    pub fn with_events(mut self, events: Arc<dyn EventHandler>) -> Self {
        self.events = events;
        self
    }

    pub fn with_threshold(mut self, threshold_bytes: usize) -> Self {
        self.threshold_bytes = threshold_bytes;
        self
    }

    pub fn threshold_bytes(&self) -> usize {
        self.threshold_bytes
    }

    /// Whether `data` of type `mime_type` would be offloaded.
    pub fn should_offload(&self, data: &MediaData, mime_type: &str) -> bool {
        match estimate_size(data) {
            None => false,
            Some(size) => is_binary_likely(mime_type) || size > self.threshold_bytes,
        }
    }

    /// Offload one value, returning either the original value or a
    /// `@blob:<uri>` reference.
    pub async fn offload(&self, data: MediaData, metadata: BlobMetadata) -> MediaData {
        if !self.should_offload(&data, &metadata.mime_type) {
            return data;
        }
        let Some(bytes) = payload_bytes(&data, &metadata.mime_type) else {
            warn!(mime_type = %metadata.mime_type, "Attachment payload is not valid base64; keeping it inline");
            return data;
        };
        let size = bytes.len();
        let mime_type = metadata.mime_type.clone();
        match self.store.store(bytes, metadata).await {
            Ok(uri) => {
                self.events.on_event(&ContextEvent::BlobStored {
                    uri: &uri,
                    mime_type: &mime_type,
                    bytes: size,
                });
                MediaData::Text(format!("{BLOB_REF_PREFIX}{uri}"))
            }
            Err(e) => {
                warn!(error = %e, mime_type = %mime_type, "Blob store failed; keeping attachment inline");
                data
            }
        }
    }

    /// Offload every image and file part in `parts`.
    pub async fn offload_parts(&self, parts: Vec<ContentPart>, source: BlobSource) -> Vec<ContentPart> {
        let mut out = Vec::with_capacity(parts.len());
        for part in parts {
            out.push(match part {
                ContentPart::Image { data, mime_type } => {
                    let meta_mime = mime_type
                        .clone()
                        .or_else(|| data_uri_mime(&data).map(str::to_string))
                        .unwrap_or_else(|| "image/*".to_string());
                    let data = self.offload(data, BlobMetadata::new(meta_mime, source)).await;
                    ContentPart::Image { data, mime_type }
                }
                ContentPart::File {
                    data,
                    mime_type,
                    filename,
                } => {
                    let mut meta = BlobMetadata::new(mime_type.clone(), source);
                    meta.original_name = filename.clone();
                    let data = self.offload(data, meta).await;
                    ContentPart::File {
                        data,
                        mime_type,
                        filename,
                    }
                }
                other => other,
            });
        }
        out
    }

    /// Resolve blob references and filter attachments by `allowed` media
    /// types (`None` allows everything). Order is preserved.
    pub async fn expand(&self, parts: Vec<ContentPart>, allowed: Option<&[String]>) -> Vec<ContentPart> {
        let expanded = join_all(parts.into_iter().map(|part| self.expand_part(part, allowed))).await;
        expanded.into_iter().flatten().collect()
    }

    async fn expand_part(&self, part: ContentPart, allowed: Option<&[String]>) -> Option<ContentPart> {
        let declared = match &part {
            ContentPart::Image { mime_type, data } => mime_type
                .clone()
                .or_else(|| data_uri_mime(data).map(str::to_string)),
            ContentPart::File { mime_type, .. } => Some(mime_type.clone()),
            _ => return Some(part),
        };

        if let Some(mime) = &declared
            && !is_allowed(allowed, mime)
        {
            debug!(mime_type = %mime, "Dropping attachment the model does not accept");
            return None;
        }

        let Some(uri) = part.media_data().and_then(MediaData::blob_uri).map(str::to_string) else {
            // Inline image with no declared type: judge it as a generic image.
            if declared.is_none() && !is_allowed(allowed, "image/*") {
                return None;
            }
            return Some(part);
        };

        let blob = match self.store.retrieve(&uri).await {
            Ok(blob) => blob,
            Err(e) => {
                let error = e.to_string();
                warn!(uri = %uri, error = %error, "Failed to expand blob reference");
                self.events
                    .on_event(&ContextEvent::BlobExpansionFailed { uri: &uri, error: &error });
                return Some(ContentPart::text(format!("[Attachment unavailable: {uri}]")));
            }
        };

        let mime = declared.unwrap_or_else(|| blob.metadata.mime_type.clone());
        if !is_allowed(allowed, &mime) {
            return None;
        }
        let wire_mime = if mime.contains('*') {
            FALLBACK_MIME.to_string()
        } else {
            mime
        };
        let data = MediaData::Text(format!("data:{wire_mime};base64,{}", STANDARD.encode(&blob.data)));

        Some(match part {
            ContentPart::Image { mime_type, .. } => ContentPart::Image {
                data,
                mime_type: mime_type.or(Some(wire_mime)),
            },
            ContentPart::File {
                mime_type,
                filename,
                ..
            } => ContentPart::File {
                data,
                mime_type,
                filename: filename.or(blob.metadata.original_name),
            },
            other => other,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::blob::{BlobFuture, MemoryBlobStore, StoredBlob};
    use crate::manager::events::FnEventHandler;
    use crate::ContextError;
    use std::sync::atomic::{AtomicUsize, Ordering};

    struct BrokenStore;

    impl BlobStore for BrokenStore {
        fn store(&self, _data: Vec<u8>, _metadata: BlobMetadata) -> BlobFuture<'_, String> {
            Box::pin(async { Err(ContextError::Blob("disk full".into())) })
        }

        fn retrieve<'a>(&'a self, uri: &'a str) -> BlobFuture<'a, StoredBlob> {
            Box::pin(async move { Err(ContextError::Blob(format!("missing {uri}"))) })
        }
    }

    fn png_data_uri(len: usize) -> String {
        let bytes: Vec<u8> = (0..len).map(|i| (i % 251) as u8).collect();
        format!("data:image/png;base64,{}", STANDARD.encode(bytes))
    }

    fn allowed(patterns: &[&str]) -> Vec<String> {
        patterns.iter().map(|p| p.to_string()).collect()
    }

    #[test]
    fn mime_patterns() {
        assert!(mime_matches("image/*", "image/png"));
        assert!(mime_matches("*/*", "application/pdf"));
        assert!(mime_matches("application/pdf", "Application/PDF; q=1"));
        assert!(!mime_matches("image/*", "application/pdf"));
        assert!(!mime_matches("image/png", "image/jpeg"));
    }

    #[test]
    fn size_estimates() {
        assert_eq!(estimate_size(&MediaData::from("https://x.test/a.png")), None);
        assert_eq!(estimate_size(&MediaData::from("@blob:abc")), None);
        assert_eq!(estimate_size(&MediaData::Bytes(vec![0; 10])), Some(10));
        assert_eq!(estimate_size(&MediaData::from("data:text/plain;base64,AAAA")), Some(3));
        assert_eq!(estimate_size(&MediaData::from("short text")), Some(10));
        assert_eq!(estimate_size(&MediaData::from("QUJD".repeat(50))), Some(150));
    }

    #[tokio::test]
    async fn image_round_trips_through_store() {
        let store = Arc::new(MemoryBlobStore::new());
        let stored = Arc::new(AtomicUsize::new(0));
        let counter = stored.clone();
        let resolver = BlobResolver::new(store.clone()).with_events(Arc::new(FnEventHandler::new(
            move |event| {
                if let ContextEvent::BlobStored { .. } = event {
                    counter.fetch_add(1, Ordering::SeqCst);
                }
            },
        )));

        let original = png_data_uri(10 * 1024);
        let parts = resolver
            .offload_parts(vec![ContentPart::image(original.clone(), "image/png")], BlobSource::User)
            .await;
        let reference = parts[0].media_data().unwrap().blob_uri().unwrap().to_string();
        assert_eq!(reference.len(), 64);
        assert_eq!(stored.load(Ordering::SeqCst), 1);
        assert_eq!(store.len(), 1);

        let expanded = resolver.expand(parts.clone(), Some(&allowed(&["image/*"]))).await;
        assert_eq!(expanded, vec![ContentPart::image(original, "image/png")]);

        let dropped = resolver.expand(parts, Some(&allowed(&["application/pdf"]))).await;
        assert!(dropped.is_empty());
    }

    #[tokio::test]
    async fn short_bare_base64_image_keeps_its_bytes() {
        let store = Arc::new(MemoryBlobStore::new());
        let resolver = BlobResolver::new(store.clone());
        let bytes: Vec<u8> = (0..70u8).collect();
        let encoded = STANDARD.encode(&bytes);
        assert!(encoded.len() <= BASE64_MIN_LEN);

        let parts = resolver
            .offload_parts(vec![ContentPart::image(encoded.clone(), "image/png")], BlobSource::User)
            .await;
        let uri = parts[0].media_data().unwrap().blob_uri().unwrap().to_string();
        assert_eq!(store.retrieve(&uri).await.unwrap().data, bytes);

        let expanded = resolver.expand(parts, Some(&allowed(&["image/*"]))).await;
        assert_eq!(
            expanded,
            vec![ContentPart::image(format!("data:image/png;base64,{encoded}"), "image/png")]
        );
    }

    #[tokio::test]
    async fn url_safe_base64_is_decoded() {
        let store = Arc::new(MemoryBlobStore::new());
        let resolver = BlobResolver::new(store.clone());
        let bytes = vec![0xfbu8, 0xff, 0xfe, 0x3e];
        let parts = resolver
            .offload_parts(
                vec![ContentPart::image(URL_SAFE_NO_PAD.encode(&bytes), "image/jpeg")],
                BlobSource::User,
            )
            .await;
        let uri = parts[0].media_data().unwrap().blob_uri().unwrap().to_string();
        assert_eq!(store.retrieve(&uri).await.unwrap().data, bytes);
    }

    #[tokio::test]
    async fn undecodable_binary_payload_stays_inline() {
        let store = Arc::new(MemoryBlobStore::new());
        let resolver = BlobResolver::new(store.clone());
        let parts = vec![
            ContentPart::image("not base64!", "image/png"),
            ContentPart::image("data:image/png;base64,%%%%", "image/png"),
        ];
        let out = resolver.offload_parts(parts.clone(), BlobSource::User).await;
        assert_eq!(out, parts);
        assert!(store.is_empty());
    }

    #[tokio::test]
    async fn small_text_files_stay_inline() {
        let resolver = BlobResolver::new(Arc::new(MemoryBlobStore::new()));
        let part = ContentPart::file("hello", "text/plain", Some("a.txt".into()));
        let out = resolver.offload_parts(vec![part.clone()], BlobSource::Tool).await;
        assert_eq!(out, vec![part]);

        let big = ContentPart::file("hello world ".repeat(600), "text/plain", None);
        let out = resolver.offload_parts(vec![big], BlobSource::Tool).await;
        assert!(out[0].media_data().unwrap().blob_uri().is_some());
    }

    #[tokio::test]
    async fn urls_are_never_offloaded() {
        let resolver = BlobResolver::new(Arc::new(MemoryBlobStore::new()));
        let data = MediaData::from("https://example.com/cat.png");
        let out = resolver
            .offload(data.clone(), BlobMetadata::new("image/png", BlobSource::User))
            .await;
        assert_eq!(out, data);
    }

    #[tokio::test]
    async fn store_failure_keeps_value_inline() {
        let resolver = BlobResolver::new(Arc::new(BrokenStore));
        let data = MediaData::from(png_data_uri(64));
        let out = resolver
            .offload(data.clone(), BlobMetadata::new("image/png", BlobSource::User))
            .await;
        assert_eq!(out, data);
    }

    #[tokio::test]
    async fn unresolvable_reference_becomes_notice() {
        let resolver = BlobResolver::new(Arc::new(BrokenStore));
        let parts = vec![
            ContentPart::text("see attached"),
            ContentPart::image("@blob:deadbeef", "image/png"),
        ];
        let out = resolver.expand(parts, None).await;
        assert_eq!(out.len(), 2);
        assert_eq!(out[1].as_text(), Some("[Attachment unavailable: deadbeef]"));
    }

    #[tokio::test]
    async fn inline_attachments_are_filtered_too() {
        let resolver = BlobResolver::new(Arc::new(MemoryBlobStore::new()));
        let parts = vec![
            ContentPart::text("q"),
            ContentPart::file("%PDF", "application/pdf", None),
        ];
        let out = resolver.expand(parts, Some(&allowed(&["image/*"]))).await;
        assert_eq!(out, vec![ContentPart::text("q")]);
    }
}
