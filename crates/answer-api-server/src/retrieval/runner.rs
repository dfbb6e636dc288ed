use std::collections::{HashMap, HashSet};

use search_shared::index::{ChunkRequest, DocumentIndex, IndexFilters};
use search_shared::models::InferenceChunk;
use tracing::{debug, info, warn};

/// Score boost for a source page pulled in because one of its images
/// matched.
const SOURCE_PAGE_BOOST: f32 = 1.8;
/// Score boost keeping matched image chunks above ordinary results.
const IMAGE_CHUNK_BOOST: f32 = 1.3;
/// Chunks fetched per source-page follow-up query.
const SOURCE_PAGE_CHUNKS: usize = 5;

fn sort_by_score(chunks: &mut [InferenceChunk]) {
    chunks.sort_by(|a, b| {
        b.score_or_zero()
            .partial_cmp(&a.score_or_zero())
            .unwrap_or(std::cmp::Ordering::Equal)
    });
}

/// Merge result sets from parallel queries: dedupe on (doc, chunk) keeping
/// the max score, sort descending.
pub fn combine_retrieval_results(chunk_sets: Vec<Vec<InferenceChunk>>) -> Vec<InferenceChunk> {
    let mut unique: HashMap<(String, i32), InferenceChunk> = HashMap::new();
    for chunk in chunk_sets.into_iter().flatten() {
        let key = (chunk.document_id.clone(), chunk.chunk_id);
        match unique.get(&key) {
            Some(existing) if existing.score_or_zero() >= chunk.score_or_zero() => {}
            _ => {
                unique.insert(key, chunk);
            }
        }
    }
    let mut merged: Vec<InferenceChunk> = unique.into_values().collect();
    sort_by_score(&mut merged);
    merged
}

/// Expand large-chunk hits into their constituent normal chunks, propagate
/// the parent's score to each child, dedupe on (doc, ordinal) keeping the
/// max score.
pub async fn resolve_large_chunks(
    index: &dyn DocumentIndex,
    top_chunks: Vec<InferenceChunk>,
    filters: &IndexFilters,
) -> anyhow::Result<Vec<InferenceChunk>> {
    let mut retrieval_requests: Vec<ChunkRequest> = Vec::new();
    let mut normal_chunks: Vec<InferenceChunk> = Vec::new();
    let mut referenced_scores: HashMap<(String, i32), f32> = HashMap::new();

    for chunk in top_chunks {
        if chunk.large_chunk_reference_ids.is_empty() {
            normal_chunks.push(chunk);
            continue;
        }
        retrieval_requests.push(ChunkRequest {
            document_id: chunk.document_id.clone(),
            min_chunk_ind: chunk.large_chunk_reference_ids.first().copied(),
            max_chunk_ind: chunk.large_chunk_reference_ids.last().copied(),
        });
        // Each referenced chunk inherits the best large-chunk score seen
        for chunk_id in &chunk.large_chunk_reference_ids {
            let key = (chunk.document_id.clone(), *chunk_id);
            let entry = referenced_scores.entry(key).or_insert(0.0);
            *entry = entry.max(chunk.score_or_zero());
        }
    }

    if retrieval_requests.is_empty() {
        return Ok(normal_chunks);
    }

    let mut retrieved = index
        .id_based_retrieval(retrieval_requests, filters.clone(), true)
        .await?;

    for chunk in &mut retrieved {
        let key = (chunk.document_id.clone(), chunk.chunk_id);
        match referenced_scores.remove(&key) {
            Some(score) => chunk.score = Some(score),
            None => warn!(
                "Chunk {} {} not found in referenced chunk scores",
                chunk.document_id, chunk.chunk_id
            ),
        }
    }
    for (doc_id, chunk_id) in referenced_scores.keys() {
        warn!("Referenced chunk ({}, {}) was not retrieved", doc_id, chunk_id);
    }

    let mut unique: HashMap<(String, i32), InferenceChunk> = normal_chunks
        .into_iter()
        .map(|c| ((c.document_id.clone(), c.chunk_id), c))
        .collect();
    for chunk in retrieved {
        let key = (chunk.document_id.clone(), chunk.chunk_id);
        match unique.get(&key) {
            Some(existing) if existing.score_or_zero() >= chunk.score_or_zero() => {}
            _ => {
                unique.insert(key, chunk);
            }
        }
    }

    let mut deduped: Vec<InferenceChunk> = unique.into_values().collect();
    sort_by_score(&mut deduped);
    Ok(deduped)
}

/// When image documents appear in the results, fetch their source pages so
/// text and image content surface together: source pages boosted 1.8x,
/// image chunks 1.3x, everything re-sorted.
pub async fn enhance_with_source_pages(
    index: &dyn DocumentIndex,
    chunks: Vec<InferenceChunk>,
    filters: &IndexFilters,
    num_hits: usize,
) -> Vec<InferenceChunk> {
    let mut source_document_ids: Vec<String> = Vec::new();
    let mut seen_sources: HashSet<String> = HashSet::new();
    let image_doc_ids: HashSet<String> = chunks
        .iter()
        .filter_map(|chunk| {
            let source_id = chunk.source_document_id()?;
            if seen_sources.insert(source_id.to_string()) {
                source_document_ids.push(source_id.to_string());
            }
            Some(chunk.document_id.clone())
        })
        .collect();

    if source_document_ids.is_empty() {
        return chunks;
    }
    info!(
        "Found {} image documents referencing {} source pages",
        image_doc_ids.len(),
        source_document_ids.len()
    );

    let mut source_chunks: Vec<InferenceChunk> = Vec::new();
    for source_doc_id in &source_document_ids {
        // Targeted follow-up by document id
        let request = ChunkRequest {
            document_id: source_doc_id.clone(),
            min_chunk_ind: None,
            max_chunk_ind: Some(SOURCE_PAGE_CHUNKS as i32 - 1),
        };
        match index
            .id_based_retrieval(vec![request], filters.clone(), false)
            .await
        {
            Ok(retrieved) => {
                for mut chunk in retrieved {
                    if chunk.document_id != *source_doc_id {
                        continue;
                    }
                    chunk.score = Some(match chunk.score {
                        Some(score) => score * SOURCE_PAGE_BOOST,
                        // Un-scored id-retrieval hits still deserve a spot
                        None => 0.9,
                    });
                    debug!(
                        "Added source page chunk {} with boosted score {:?}",
                        chunk.document_id, chunk.score
                    );
                    source_chunks.push(chunk);
                }
            }
            Err(e) => {
                warn!("Failed to retrieve source page {}: {}", source_doc_id, e);
            }
        }
    }

    if source_chunks.is_empty() {
        debug!("No source page chunks found, keeping original results");
        return chunks;
    }

    let mut enhanced: Vec<InferenceChunk> = Vec::new();
    let source_ids: HashSet<String> =
        source_chunks.iter().map(|c| c.document_id.clone()).collect();
    enhanced.extend(source_chunks);

    for mut chunk in chunks {
        if image_doc_ids.contains(&chunk.document_id) {
            chunk.score = chunk.score.map(|s| s * IMAGE_CHUNK_BOOST);
            enhanced.push(chunk);
        } else if !source_ids.contains(&chunk.document_id) {
            enhanced.push(chunk);
        }
    }

    sort_by_score(&mut enhanced);

    // Source pages and images always make the cut, even over num_hits
    let min_results = enhanced
        .iter()
        .filter(|c| source_ids.contains(&c.document_id) || image_doc_ids.contains(&c.document_id))
        .count();
    enhanced.truncate(num_hits.max(min_results));
    enhanced
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use search_shared::index::{HybridSearchRequest, IndexBatchParams};
    use search_shared::models::{DocMetadataAwareIndexChunk, DocumentSource, MetadataValue};
    use std::collections::HashMap as StdHashMap;

    fn chunk(doc_id: &str, chunk_id: i32, score: Option<f32>) -> InferenceChunk {
        InferenceChunk {
            document_id: doc_id.to_string(),
            chunk_id,
            content: format!("content of {doc_id}/{chunk_id}"),
            source: DocumentSource::Web,
            semantic_identifier: doc_id.to_string(),
            link: None,
            metadata: StdHashMap::new(),
            doc_updated_at: None,
            large_chunk_reference_ids: Vec::new(),
            score,
        }
    }

    fn image_chunk(doc_id: &str, source_doc: &str, score: f32) -> InferenceChunk {
        let mut c = chunk(doc_id, 0, Some(score));
        c.metadata.insert(
            "source_document_id".to_string(),
            MetadataValue::One(source_doc.to_string()),
        );
        c
    }

    /// Index stub serving canned chunks for id-based retrieval.
    struct StubIndex {
        by_doc: StdHashMap<String, Vec<InferenceChunk>>,
    }

    #[async_trait]
    impl DocumentIndex for StubIndex {
        async fn hybrid_retrieval(
            &self,
            _request: HybridSearchRequest,
        ) -> anyhow::Result<Vec<InferenceChunk>> {
            Ok(Vec::new())
        }

        async fn id_based_retrieval(
            &self,
            chunk_requests: Vec<ChunkRequest>,
            _filters: IndexFilters,
            _batch_retrieval: bool,
        ) -> anyhow::Result<Vec<InferenceChunk>> {
            let mut out = Vec::new();
            for request in chunk_requests {
                if let Some(chunks) = self.by_doc.get(&request.document_id) {
                    for c in chunks {
                        let in_range = request.min_chunk_ind.map(|m| c.chunk_id >= m).unwrap_or(true)
                            && request.max_chunk_ind.map(|m| c.chunk_id <= m).unwrap_or(true);
                        if in_range {
                            out.push(c.clone());
                        }
                    }
                }
            }
            Ok(out)
        }

        async fn index(
            &self,
            _chunks: Vec<DocMetadataAwareIndexChunk>,
            _params: IndexBatchParams,
        ) -> anyhow::Result<()> {
            Ok(())
        }
    }

    #[test]
    fn test_combine_keeps_max_score_per_chunk() {
        let merged = combine_retrieval_results(vec![
            vec![chunk("A", 0, Some(0.5)), chunk("B", 0, Some(0.9))],
            vec![chunk("A", 0, Some(0.7))],
        ]);
        assert_eq!(merged.len(), 2);
        assert_eq!(merged[0].document_id, "B");
        assert_eq!(merged[1].document_id, "A");
        assert_eq!(merged[1].score, Some(0.7));
    }

    #[tokio::test]
    async fn test_large_chunk_resolution_propagates_parent_score() {
        let index = StubIndex {
            by_doc: StdHashMap::from([(
                "D".to_string(),
                vec![
                    chunk("D", 0, None),
                    chunk("D", 1, None),
                    chunk("D", 2, None),
                ],
            )]),
        };

        let mut large = chunk("D", 1_000_000, Some(0.8));
        large.large_chunk_reference_ids = vec![0, 1, 2];

        let resolved = resolve_large_chunks(
            &index,
            vec![large, chunk("E", 0, Some(0.4))],
            &IndexFilters::default(),
        )
        .await
        .unwrap();

        // The large chunk is replaced by its three members, all carrying the
        // parent's score
        assert_eq!(resolved.len(), 4);
        let d_chunks: Vec<_> = resolved.iter().filter(|c| c.document_id == "D").collect();
        assert_eq!(d_chunks.len(), 3);
        for c in &d_chunks {
            assert_eq!(c.score, Some(0.8));
            assert!(c.score_or_zero() >= 0.8);
        }
    }

    #[tokio::test]
    async fn test_overlapping_large_and_normal_chunk_keeps_max_score() {
        let index = StubIndex {
            by_doc: StdHashMap::from([(
                "D".to_string(),
                vec![chunk("D", 0, None), chunk("D", 1, None)],
            )]),
        };

        let mut large = chunk("D", 1_000_000, Some(0.5));
        large.large_chunk_reference_ids = vec![0, 1];
        // Chunk 0 also matched directly with a higher score
        let direct = chunk("D", 0, Some(0.9));

        let resolved =
            resolve_large_chunks(&index, vec![large, direct], &IndexFilters::default())
                .await
                .unwrap();

        let chunk0 = resolved
            .iter()
            .find(|c| c.document_id == "D" && c.chunk_id == 0)
            .unwrap();
        assert_eq!(chunk0.score, Some(0.9));
    }

    #[tokio::test]
    async fn test_image_co_retrieval_boosts_and_orders() {
        // Corpus: page P and image I pointing back at it
        let index = StubIndex {
            by_doc: StdHashMap::from([(
                "https://ex/p".to_string(),
                vec![chunk("https://ex/p", 0, Some(0.6))],
            )]),
        };

        let results = vec![image_chunk("https://ex/p#img1", "https://ex/p", 0.9)];
        let enhanced =
            enhance_with_source_pages(&index, results, &IndexFilters::default(), 10).await;

        assert_eq!(enhanced.len(), 2);

        let image = enhanced
            .iter()
            .find(|c| c.document_id == "https://ex/p#img1")
            .unwrap();
        assert!((image.score_or_zero() - 0.9 * 1.3).abs() < 1e-6);

        let page = enhanced
            .iter()
            .find(|c| c.document_id == "https://ex/p")
            .unwrap();
        assert!((page.score_or_zero() - 0.6 * 1.8).abs() < 1e-6);
        assert!(page.score_or_zero() >= 1.08 - 1e-6);

        // Ordered by final score: image (1.17) ahead of page (1.08)
        assert_eq!(enhanced[0].document_id, "https://ex/p#img1");
    }

    #[tokio::test]
    async fn test_no_image_results_leaves_chunks_untouched() {
        let index = StubIndex {
            by_doc: StdHashMap::new(),
        };
        let original = vec![chunk("A", 0, Some(0.5))];
        let enhanced =
            enhance_with_source_pages(&index, original.clone(), &IndexFilters::default(), 10).await;
        assert_eq!(enhanced.len(), 1);
        assert_eq!(enhanced[0].score, Some(0.5));
    }
}
