//! Normalized document shapes shared by every collector.
//!
//! Collectors produce a [`CollectorDocument`]; the enrichment capability turns
//! it into an [`EnrichedDocument`]. Both are immutable once built.

use std::path::PathBuf;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

/// Where a document came from
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SourceType {
  /// Remote mailbox reached over the mail protocol client
  RemoteMail,
  /// Local mail store read through the message index
  LocalMail,
  /// File picked up by a directory watch
  File,
}

impl SourceType {
  pub fn as_str(&self) -> &'static str {
    match self {
      SourceType::RemoteMail => "remote_mail",
      SourceType::LocalMail => "local_mail",
      SourceType::File => "file",
    }
  }
}

impl std::fmt::Display for SourceType {
  fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
    f.write_str(self.as_str())
  }
}

/// Document-level metadata attached by the collector
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DocumentMetadata {
  /// SHA-256 hex digest of the raw content
  pub content_hash: String,
  pub mime_type: String,
  #[serde(skip_serializing_if = "Option::is_none")]
  pub created_at: Option<DateTime<Utc>>,
  #[serde(skip_serializing_if = "Option::is_none")]
  pub modified_at: Option<DateTime<Utc>>,
}

/// Descriptor for an image attachment. Only metadata is kept; the bytes stay on disk.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ImageAttachment {
  pub filename: String,
  pub mime_type: String,
  pub size: u64,
  #[serde(skip_serializing_if = "Option::is_none")]
  pub content_id: Option<String>,
  #[serde(skip_serializing_if = "Option::is_none")]
  pub path: Option<PathBuf>,
}

/// Immutable normalized unit of ingested content
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CollectorDocument {
  pub content: String,
  pub source_type: SourceType,
  /// Source-stable identity used for idempotent resubmission downstream
  pub external_id: String,
  pub metadata: DocumentMetadata,
  pub images: Vec<ImageAttachment>,
  pub content_type: String,
  #[serde(skip_serializing_if = "Option::is_none")]
  pub title: Option<String>,
  #[serde(skip_serializing_if = "Option::is_none")]
  pub canonical_uri: Option<String>,
}

impl CollectorDocument {
  /// Build a text document, hashing `raw` for the content hash.
  pub fn new(source_type: SourceType, external_id: impl Into<String>, content: String, raw: &[u8]) -> Self {
    Self {
      content,
      source_type,
      external_id: external_id.into(),
      metadata: DocumentMetadata {
        content_hash: content_hash(raw),
        mime_type: "text/plain".to_string(),
        created_at: None,
        modified_at: None,
      },
      images: Vec::new(),
      content_type: "text".to_string(),
      title: None,
      canonical_uri: None,
    }
  }

  pub fn with_title(mut self, title: Option<String>) -> Self {
    self.title = title;
    self
  }

  pub fn with_canonical_uri(mut self, uri: impl Into<String>) -> Self {
    self.canonical_uri = Some(uri.into());
    self
  }

  pub fn with_mime_type(mut self, mime_type: impl Into<String>, content_type: impl Into<String>) -> Self {
    self.metadata.mime_type = mime_type.into();
    self.content_type = content_type.into();
    self
  }

  pub fn with_timestamps(mut self, created_at: Option<DateTime<Utc>>, modified_at: Option<DateTime<Utc>>) -> Self {
    self.metadata.created_at = created_at;
    self.metadata.modified_at = modified_at;
    self
  }

  pub fn with_images(mut self, images: Vec<ImageAttachment>) -> Self {
    self.images = images;
    self
  }

  pub fn has_attachments(&self) -> bool {
    !self.images.is_empty()
  }
}

/// SHA-256 hex digest used as the document content hash
pub fn content_hash(bytes: &[u8]) -> String {
  hex::encode(Sha256::digest(bytes))
}

/// An entity extracted from document text
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Entity {
  pub kind: String,
  pub text: String,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct DocumentEnrichment {
  pub entities: Vec<Entity>,
}

/// Axis-aligned box in normalized [0, 1] image coordinates
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct BoundingBox {
  pub x: f32,
  pub y: f32,
  pub width: f32,
  pub height: f32,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OcrRegion {
  pub text: String,
  pub bounds: BoundingBox,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct OcrResult {
  pub text: String,
  pub regions: Vec<OcrRegion>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FaceDetection {
  pub bounds: BoundingBox,
  pub confidence: f32,
}

/// Enrichment output for one image attachment
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ImageEnrichment {
  #[serde(skip_serializing_if = "Option::is_none")]
  pub ocr: Option<OcrResult>,
  pub faces: Vec<FaceDetection>,
  #[serde(skip_serializing_if = "Option::is_none")]
  pub caption: Option<String>,
}

/// A collector document plus its enrichment results.
///
/// `images[i]` describes `document.images[i]`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EnrichedDocument {
  pub document: CollectorDocument,
  #[serde(skip_serializing_if = "Option::is_none")]
  pub enrichment: Option<DocumentEnrichment>,
  pub images: Vec<ImageEnrichment>,
}

impl EnrichedDocument {
  /// Wrap a document without any enrichment, keeping one empty result per image.
  pub fn unenriched(document: CollectorDocument) -> Self {
    let images = vec![ImageEnrichment::default(); document.images.len()];
    Self {
      document,
      enrichment: None,
      images,
    }
  }
}
