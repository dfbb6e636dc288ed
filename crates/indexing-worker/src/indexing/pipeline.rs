use std::collections::{BTreeSet, HashMap};
use std::sync::Arc;

use anyhow::Result;
use search_shared::index::{DocumentIndex, IndexBatchParams};
use search_shared::models::{
    DocMetadataAwareIndexChunk, Document, DocumentAccess, IndexChunk, DEFAULT_BOOST,
};
use tracing::{debug, info};

use super::chunker::Chunker;
use super::embedder::EmbeddingProvider;

/// Document batch → chunks → embeddings → index write.
pub struct IndexingPipeline {
    chunker: Chunker,
    embedder: Arc<dyn EmbeddingProvider>,
    index: Arc<dyn DocumentIndex>,
    large_chunks_enabled: bool,
}

impl IndexingPipeline {
    pub fn new(
        chunker: Chunker,
        embedder: Arc<dyn EmbeddingProvider>,
        index: Arc<dyn DocumentIndex>,
        large_chunks_enabled: bool,
    ) -> Self {
        Self {
            chunker,
            embedder,
            index,
            large_chunks_enabled,
        }
    }

    /// Index one batch of documents. Returns (docs indexed, chunks written).
    pub async fn index_batch(
        &self,
        documents: &[Document],
        document_sets: &BTreeSet<String>,
    ) -> Result<(usize, usize)> {
        if documents.is_empty() {
            return Ok((0, 0));
        }

        let mut all_chunks = Vec::new();
        let mut chunk_counts: HashMap<String, i32> = HashMap::new();
        for document in documents {
            let chunks = self.chunker.chunk(document);
            chunk_counts.insert(document.id.clone(), chunks.len() as i32);
            all_chunks.extend(chunks);
        }

        if all_chunks.is_empty() {
            debug!("Batch of {} documents produced no chunks", documents.len());
            return Ok((documents.len(), 0));
        }

        let texts: Vec<String> = all_chunks.iter().map(|c| c.content.clone()).collect();
        let embeddings = self.embedder.embed(&texts).await?;

        let access_by_doc: HashMap<&str, DocumentAccess> = documents
            .iter()
            .map(|doc| {
                let access = match &doc.external_access {
                    Some(external) => DocumentAccess::from_external(external),
                    // Without an upstream ACL the document is visible
                    // platform-wide
                    None => DocumentAccess {
                        is_public: true,
                        ..Default::default()
                    },
                };
                (doc.id.as_str(), access)
            })
            .collect();

        let indexable: Vec<DocMetadataAwareIndexChunk> = all_chunks
            .into_iter()
            .zip(embeddings.into_iter())
            .map(|(chunk, embedding)| {
                let access = access_by_doc
                    .get(chunk.document_id.as_str())
                    .cloned()
                    .unwrap_or_default();
                DocMetadataAwareIndexChunk::from_index_chunk(
                    IndexChunk { chunk, embedding },
                    access,
                    document_sets.clone(),
                    DEFAULT_BOOST,
                )
            })
            .collect();

        let chunk_total = indexable.len();
        let params = IndexBatchParams {
            doc_id_to_previous_chunk_cnt: chunk_counts.keys().map(|id| (id.clone(), None)).collect(),
            doc_id_to_new_chunk_cnt: chunk_counts,
            large_chunks_enabled: self.large_chunks_enabled,
        };

        self.index.index(indexable, params).await?;

        info!(
            "Indexed batch: {} documents, {} chunks",
            documents.len(),
            chunk_total
        );
        Ok((documents.len(), chunk_total))
    }
}
