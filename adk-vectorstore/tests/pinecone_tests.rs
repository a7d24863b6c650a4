//! Pinecone adapter against a mocked control and data plane.
//!
//! One mock server plays both roles: index descriptions report the mock's
//! own URI as the data-plane host.
#![cfg(feature = "pinecone")]

use std::sync::Arc;

use adk_vectorstore::pinecone::{PineconeBackend, PineconeConfig};
use adk_vectorstore::{
    CollectionConfig, CollectionStatus, DocumentMetadataFilter, EmbeddedChunk, MetricType,
    SearchRequest, StoreSettings, VectorStore,
};
use serde_json::{Value, json};
use wiremock::matchers::{body_partial_json, header, method, path, query_param};
use wiremock::{Mock, MockServer, ResponseTemplate};

fn store_for(server: &MockServer) -> VectorStore {
    let config = PineconeConfig::new("pc-key").with_controller_url(server.uri());
    VectorStore::new(
        Arc::new(PineconeBackend::new(config).unwrap()),
        StoreSettings::builder().embedding_dim(3).build().unwrap(),
    )
}

fn index_description(server: &MockServer, name: &str, metric: &str) -> Value {
    json!({
        "name": name,
        "dimension": 3,
        "metric": metric,
        "host": server.uri(),
        "status": { "ready": true, "state": "Ready" }
    })
}

async fn mount_index(server: &MockServer, metric: &str) {
    Mock::given(method("GET"))
        .and(path("/indexes/docs"))
        .respond_with(
            ResponseTemplate::new(200).set_body_json(index_description(server, "docs", metric)),
        )
        .mount(server)
        .await;
}

#[test]
fn empty_api_key_is_a_config_error() {
    let err = PineconeBackend::new(PineconeConfig::new("  ")).err().unwrap();
    assert_eq!(err.error_type(), "ConfigError");
}

#[tokio::test]
async fn create_normalizes_name_and_waits_for_ready() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/indexes/my-docs"))
        .respond_with(ResponseTemplate::new(404).set_body_json(json!({ "error": "not found" })))
        .up_to_n_times(1)
        .mount(&server)
        .await;
    Mock::given(method("POST"))
        .and(path("/indexes"))
        .and(header("api-key", "pc-key"))
        .and(header("x-pinecone-api-version", "2024-10"))
        .and(body_partial_json(json!({
            "name": "my-docs",
            "dimension": 3,
            "metric": "dotproduct",
            "spec": { "serverless": { "cloud": "aws", "region": "us-east-1" } }
        })))
        .respond_with(ResponseTemplate::new(201).set_body_json(json!({
            "name": "my-docs",
            "dimension": 3,
            "metric": "dotproduct",
            "host": "",
            "status": { "ready": false, "state": "Initializing" }
        })))
        .expect(1)
        .mount(&server)
        .await;
    Mock::given(method("GET"))
        .and(path("/indexes/my-docs"))
        .respond_with(
            ResponseTemplate::new(200)
                .set_body_json(index_description(&server, "my-docs", "dotproduct")),
        )
        .mount(&server)
        .await;

    let store = store_for(&server);
    let config = CollectionConfig::builder("My_Docs")
        .dimension(3)
        .metric_type(MetricType::IP)
        .build()
        .unwrap();
    assert_eq!(store.create_collection(&config).await.unwrap().status, CollectionStatus::Created);
    assert_eq!(store.create_collection(&config).await.unwrap().status, CollectionStatus::Exists);
}

#[tokio::test]
async fn upsert_carries_text_and_ids_in_metadata() {
    let server = MockServer::start().await;
    mount_index(&server, "cosine").await;
    Mock::given(method("POST"))
        .and(path("/vectors/upsert"))
        .and(body_partial_json(json!({
            "vectors": [{
                "id": "c1",
                "values": [1.0, 0.0, 0.0],
                "metadata": { "chunk_id": "c1", "document_id": "d1", "text": "hello" }
            }]
        })))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({ "upsertedCount": 1 })))
        .expect(1)
        .mount(&server)
        .await;

    let store = store_for(&server);
    let chunk = EmbeddedChunk::new("c1", "hello", vec![1.0, 0.0, 0.0], "d1").unwrap();
    assert_eq!(store.add_documents("docs", &[chunk]).await.unwrap(), vec!["c1"]);
}

#[tokio::test]
async fn euclidean_query_scores_become_similarities() {
    let server = MockServer::start().await;
    mount_index(&server, "euclidean").await;
    Mock::given(method("POST"))
        .and(path("/query"))
        .and(body_partial_json(json!({
            "topK": 2,
            "includeMetadata": true,
            "filter": { "author": { "$eq": "ann" } }
        })))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({
            "matches": [
                {
                    "id": "c1",
                    "score": 1.0,
                    "metadata": {
                        "chunk_id": "c1",
                        "document_id": "d1",
                        "text": "hello",
                        "source": "pdf",
                        "author": "ann"
                    }
                },
                {
                    "id": "c2",
                    "score": 3.0,
                    "metadata": { "document_id": "d1", "text": "bye", "author": "ann" }
                }
            ]
        })))
        .mount(&server)
        .await;

    let store = store_for(&server);
    let request = SearchRequest::vector("docs", vec![0.0, 1.0, 0.0], 2)
        .unwrap()
        .with_filter(DocumentMetadataFilter::eq("author", "ann"))
        .unwrap();
    let result = &store.search(request).await.unwrap()[0];
    assert_eq!(result.ids, vec!["c1", "c2"]);
    assert!((result.similarities[0] - 0.5).abs() < 1e-6);
    assert!((result.similarities[1] - 0.25).abs() < 1e-6);
    assert_eq!(result.chunks[0].chunk.text, "hello");
    assert_eq!(result.chunks[1].chunk.chunk_id, "c2");
}

#[tokio::test]
async fn delete_merges_chunk_and_document_matches() {
    let server = MockServer::start().await;
    mount_index(&server, "cosine").await;
    Mock::given(method("GET"))
        .and(path("/vectors/fetch"))
        .and(query_param("ids", "c1"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({
            "vectors": { "c1": { "id": "c1" } }
        })))
        .mount(&server)
        .await;
    Mock::given(method("POST"))
        .and(path("/query"))
        .and(body_partial_json(json!({ "filter": { "document_id": { "$in": ["c1"] } } })))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({
            "matches": [{ "id": "c1", "score": 0.5 }]
        })))
        .mount(&server)
        .await;
    Mock::given(method("POST"))
        .and(path("/vectors/delete"))
        .and(body_partial_json(json!({ "ids": ["c1"] })))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({})))
        .expect(1)
        .mount(&server)
        .await;

    let response = store_for(&server).delete_documents("docs", &["c1".to_string()]).await;
    assert!(response.success, "{response:?}");
    assert_eq!(response.deleted_count(), Some(1));
}

#[tokio::test]
async fn failed_delete_batch_reports_partial_progress() {
    let server = MockServer::start().await;
    mount_index(&server, "cosine").await;
    Mock::given(method("GET"))
        .and(path("/vectors/fetch"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({ "vectors": {} })))
        .mount(&server)
        .await;
    let matches: Vec<Value> =
        (0..1001).map(|i| json!({ "id": format!("c{i}"), "score": 0.5 })).collect();
    Mock::given(method("POST"))
        .and(path("/query"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({ "matches": matches })))
        .mount(&server)
        .await;
    Mock::given(method("POST"))
        .and(path("/vectors/delete"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({})))
        .up_to_n_times(1)
        .mount(&server)
        .await;
    Mock::given(method("POST"))
        .and(path("/vectors/delete"))
        .respond_with(ResponseTemplate::new(500).set_body_json(json!({ "message": "boom" })))
        .mount(&server)
        .await;

    let response = store_for(&server).delete_documents("docs", &["d1".to_string()]).await;
    assert!(!response.success);
    assert_eq!(response.error_type(), Some("DocumentError"));
    assert_eq!(response.deleted_count(), Some(1000));
}

#[tokio::test]
async fn missing_index_is_not_found() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/indexes/ghost"))
        .respond_with(ResponseTemplate::new(404).set_body_json(json!({ "error": "not found" })))
        .mount(&server)
        .await;

    let store = store_for(&server);
    assert!(store.get_collection_stats("ghost").await.is_not_found());
    assert!(!store.collection_exists("ghost").await.unwrap());
}

#[tokio::test]
async fn stats_read_namespace_counts() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/indexes/docs"))
        .respond_with(
            ResponseTemplate::new(200).set_body_json(index_description(&server, "docs", "cosine")),
        )
        .mount(&server)
        .await;
    Mock::given(method("POST"))
        .and(path("/describe_index_stats"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({
            "totalVectorCount": 10,
            "namespaces": { "tenant-a": { "vectorCount": 4 } },
            "indexFullness": 0.0
        })))
        .mount(&server)
        .await;

    let config = PineconeConfig::new("pc-key")
        .with_controller_url(server.uri())
        .with_namespace("tenant-a");
    let store = VectorStore::new(
        Arc::new(PineconeBackend::new(config).unwrap()),
        StoreSettings::builder().embedding_dim(3).build().unwrap(),
    );
    let response = store.get_collection_stats("docs").await;
    assert!(response.success, "{response:?}");
    let data = response.data.unwrap();
    assert_eq!(data["document_count"], json!(4));
    assert_eq!(data["metric_type"], json!("COSINE"));
}

#[test]
fn zero_sizes_are_config_errors() {
    let err = PineconeBackend::new(PineconeConfig::new("pc-key").with_batch_size(0)).err().unwrap();
    assert_eq!(err.error_type(), "ConfigError");
    let err = PineconeBackend::new(PineconeConfig::new("pc-key").with_page_size(0)).err().unwrap();
    assert_eq!(err.error_type(), "ConfigError");
}

#[tokio::test]
async fn delete_queries_again_after_a_full_page() {
    let server = MockServer::start().await;
    mount_index(&server, "cosine").await;
    Mock::given(method("GET"))
        .and(path("/vectors/fetch"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({ "vectors": {} })))
        .mount(&server)
        .await;
    Mock::given(method("POST"))
        .and(path("/query"))
        .and(body_partial_json(json!({ "topK": 2 })))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({
            "matches": [{ "id": "c1", "score": 0.5 }, { "id": "c2", "score": 0.5 }]
        })))
        .up_to_n_times(1)
        .mount(&server)
        .await;
    Mock::given(method("POST"))
        .and(path("/query"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({
            "matches": [{ "id": "c3", "score": 0.5 }]
        })))
        .mount(&server)
        .await;
    Mock::given(method("POST"))
        .and(path("/vectors/delete"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({})))
        .expect(2)
        .mount(&server)
        .await;

    let config =
        PineconeConfig::new("pc-key").with_controller_url(server.uri()).with_page_size(2);
    let store = VectorStore::new(
        Arc::new(PineconeBackend::new(config).unwrap()),
        StoreSettings::builder().embedding_dim(3).build().unwrap(),
    );
    let response = store.delete_documents("docs", &["d1".to_string()]).await;
    assert!(response.success, "{response:?}");
    assert_eq!(response.deleted_count(), Some(3));
}

#[tokio::test]
async fn stale_full_page_is_reported_as_incomplete() {
    let server = MockServer::start().await;
    mount_index(&server, "cosine").await;
    Mock::given(method("GET"))
        .and(path("/vectors/fetch"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({ "vectors": {} })))
        .mount(&server)
        .await;
    Mock::given(method("POST"))
        .and(path("/query"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({
            "matches": [{ "id": "c1", "score": 0.5 }, { "id": "c2", "score": 0.5 }]
        })))
        .mount(&server)
        .await;
    Mock::given(method("POST"))
        .and(path("/vectors/delete"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({})))
        .expect(1)
        .mount(&server)
        .await;

    let config =
        PineconeConfig::new("pc-key").with_controller_url(server.uri()).with_page_size(2);
    let store = VectorStore::new(
        Arc::new(PineconeBackend::new(config).unwrap()),
        StoreSettings::builder().embedding_dim(3).build().unwrap(),
    );
    let response = store.delete_documents("docs", &["d1".to_string()]).await;
    assert!(!response.success);
    assert_eq!(response.deleted_count(), Some(2));
}
