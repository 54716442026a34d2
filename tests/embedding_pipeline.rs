//! Embedding phase + vector blocking, end to end

mod common;

use async_trait::async_trait;
use coalesce::{Encoder, EncoderError, EntityStore, Pipeline, PipelineConfig};
use common::{insert, memory_store};
use serde_json::json;
use std::collections::HashMap;
use std::sync::Arc;

/// Deterministic encoder mapping known texts to fixed vectors.
struct TableEncoder {
    vectors: HashMap<String, Vec<f32>>,
}

impl TableEncoder {
    fn new(entries: &[(&str, [f32; 3])]) -> Self {
        Self {
            vectors: entries
                .iter()
                .map(|(text, v)| (text.to_string(), v.to_vec()))
                .collect(),
        }
    }
}

#[async_trait]
impl Encoder for TableEncoder {
    fn model_id(&self) -> &str {
        "table-encoder"
    }

    fn dim(&self) -> usize {
        3
    }

    async fn encode(&self, texts: &[String]) -> Result<Vec<Vec<f32>>, EncoderError> {
        Ok(texts
            .iter()
            .map(|t| self.vectors.get(t).cloned().unwrap_or_else(|| vec![0.0; 3]))
            .collect())
    }
}

// === Scenario: vectors drive blocking when no shared keys exist ===

#[tokio::test]
async fn embedding_then_vector_blocking_clusters_duplicates() {
    let store = memory_store();
    insert(
        &store,
        "people",
        &[
            ("n1", json!({"name": "John Smith"})),
            ("n2", json!({"name": "Jon Smith"})),
            ("n3", json!({"name": "Alice Brown"})),
        ],
    );
    let encoder = Arc::new(TableEncoder::new(&[
        ("John Smith", [1.0, 0.0, 0.0]),
        ("Jon Smith", [0.98, 0.02, 0.0]),
        ("Alice Brown", [0.0, 1.0, 0.0]),
    ]));

    let config = PipelineConfig::from_yaml(
        r#"
collection_name: people
blocking:
  - name: vector
    min_similarity: 0.9
    top_k: 5
similarity:
  field_weights: { name: 1.0 }
  threshold: 0.75
"#,
    )
    .unwrap();

    let pipeline = Pipeline::new(store.clone(), config)
        .unwrap()
        .with_encoder(encoder);
    let report = pipeline.run().await.unwrap();

    assert!(report.succeeded(), "{:?}", report.errors);
    let embedding = report
        .phases
        .iter()
        .find(|p| p.phase == "embedding")
        .unwrap();
    assert_eq!(embedding.statistics["embedded"].as_u64(), Some(3));

    assert_eq!(report.candidates, 1);
    assert_eq!(report.matches, 1);
    assert_eq!(report.clusters, 1);

    // Vectors and metadata persisted onto the documents
    let n1 = store.get("people", "n1").unwrap().unwrap();
    assert_eq!(n1.get("embedding").unwrap().as_array().unwrap().len(), 3);
    let meta = n1.get("embedding_meta").unwrap();
    assert_eq!(meta["model_id"], "table-encoder");
    assert_eq!(meta["dim"], 3);
}
