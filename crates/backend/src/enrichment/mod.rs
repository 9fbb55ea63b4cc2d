//! Enrichment capability consumed by the scheduler.
//!
//! What enrichment runs (OCR, faces, captions, entities) is decided by the
//! implementation behind [`Enricher`]; the scheduler only bounds how many
//! calls are in flight.

use async_trait::async_trait;

use crate::domain::document::{CollectorDocument, EnrichedDocument};

#[derive(Debug, thiserror::Error)]
pub enum EnrichmentError {
  #[error("Enrichment backend unavailable: {0}")]
  Unavailable(String),
  #[error("Enrichment failed: {0}")]
  Failed(String),
}

#[async_trait]
pub trait Enricher: Send + Sync {
  fn name(&self) -> &str;

  /// Enrich one document. May be slow and CPU or GPU bound.
  async fn enrich(&self, document: CollectorDocument) -> Result<EnrichedDocument, EnrichmentError>;
}

/// Enricher that attaches no results, one empty entry per image.
#[derive(Debug, Default, Clone, Copy)]
pub struct PassthroughEnricher;

#[async_trait]
impl Enricher for PassthroughEnricher {
  fn name(&self) -> &str {
    "passthrough"
  }

  async fn enrich(&self, document: CollectorDocument) -> Result<EnrichedDocument, EnrichmentError> {
    Ok(EnrichedDocument::unenriched(document))
  }
}
