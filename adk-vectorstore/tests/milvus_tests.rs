//! Milvus adapter against a mocked RESTful v2 API.
#![cfg(feature = "milvus")]

use std::sync::Arc;

use adk_vectorstore::milvus::{MilvusBackend, MilvusConfig};
use adk_vectorstore::{
    CollectionConfig, CollectionStatus, DocumentMetadataFilter, EmbeddedChunk, IndexType,
    MetricType, SearchRequest, StoreSettings, VectorStore,
};
use serde_json::json;
use wiremock::matchers::{body_partial_json, header, method, path};
use wiremock::{Mock, MockServer, ResponseTemplate};

fn store_for(server: &MockServer) -> VectorStore {
    let config = MilvusConfig::new(server.uri()).with_token("root:Milvus").with_database("rag");
    VectorStore::new(
        Arc::new(MilvusBackend::new(config).unwrap()),
        StoreSettings::builder().embedding_dim(3).build().unwrap(),
    )
}

fn ok(data: serde_json::Value) -> ResponseTemplate {
    ResponseTemplate::new(200).set_body_json(json!({ "code": 0, "data": data }))
}

async fn mount_describe(server: &MockServer, metric: &str) {
    Mock::given(method("POST"))
        .and(path("/v2/vectordb/collections/describe"))
        .respond_with(ok(json!({
            "collectionName": "docs",
            "fields": [
                { "name": "chunk_id", "type": "VarChar", "primaryKey": true },
                {
                    "name": "embedding",
                    "type": "FloatVector",
                    "params": [{ "key": "dim", "value": "3" }]
                }
            ],
            "indexes": [{
                "fieldName": "embedding",
                "indexName": "embedding_index",
                "metricType": metric
            }]
        })))
        .mount(server)
        .await;
}

#[tokio::test]
async fn create_collection_sends_schema_and_index() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/v2/vectordb/collections/has"))
        .and(header("authorization", "Bearer root:Milvus"))
        .and(body_partial_json(json!({ "collectionName": "docs", "dbName": "rag" })))
        .respond_with(ok(json!({ "has": false })))
        .up_to_n_times(1)
        .mount(&server)
        .await;
    Mock::given(method("POST"))
        .and(path("/v2/vectordb/collections/create"))
        .and(body_partial_json(json!({
            "collectionName": "docs",
            "schema": { "autoId": false },
            "indexParams": [{
                "fieldName": "embedding",
                "metricType": "L2",
                "indexType": "HNSW",
                "params": { "M": 16, "efConstruction": 200 }
            }]
        })))
        .respond_with(ok(json!({})))
        .expect(1)
        .mount(&server)
        .await;
    Mock::given(method("POST"))
        .and(path("/v2/vectordb/collections/has"))
        .respond_with(ok(json!({ "has": true })))
        .mount(&server)
        .await;

    let store = store_for(&server);
    let config = CollectionConfig::builder("docs")
        .dimension(3)
        .metric_type(MetricType::L2)
        .index_type(IndexType::Hnsw)
        .build()
        .unwrap();
    assert_eq!(store.create_collection(&config).await.unwrap().status, CollectionStatus::Created);
    assert_eq!(store.create_collection(&config).await.unwrap().status, CollectionStatus::Exists);
}

#[tokio::test]
async fn upsert_failure_code_is_a_document_error() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/v2/vectordb/entities/upsert"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({
            "code": 1100,
            "message": "the dim (2) of field data(embedding) is not equal to schema dim (3)"
        })))
        .mount(&server)
        .await;

    let store = store_for(&server);
    let chunk = EmbeddedChunk::new("c1", "hello", vec![1.0, 0.0, 0.0], "d1").unwrap();
    let err = store.add_documents("docs", &[chunk]).await.unwrap_err();
    assert_eq!(err.error_type(), "DocumentError");
    assert!(err.to_string().contains("1100"));
}

#[tokio::test]
async fn upsert_returns_ids_in_input_order() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/v2/vectordb/entities/upsert"))
        .and(body_partial_json(json!({
            "collectionName": "docs",
            "data": [
                { "chunk_id": "z", "document_id": "d1", "text": "zed" },
                { "chunk_id": "a", "document_id": "d1", "text": "ay" }
            ]
        })))
        .respond_with(ok(json!({ "upsertCount": 2, "upsertIds": ["z", "a"] })))
        .expect(1)
        .mount(&server)
        .await;

    let store = store_for(&server);
    let chunks = vec![
        EmbeddedChunk::new("z", "zed", vec![0.0, 0.0, 1.0], "d1").unwrap(),
        EmbeddedChunk::new("a", "ay", vec![1.0, 0.0, 0.0], "d1").unwrap(),
    ];
    assert_eq!(store.add_documents("docs", &chunks).await.unwrap(), vec!["z", "a"]);
}

#[tokio::test]
async fn l2_search_converts_distances_and_applies_filter() {
    let server = MockServer::start().await;
    mount_describe(&server, "L2").await;
    Mock::given(method("POST"))
        .and(path("/v2/vectordb/entities/search"))
        .and(body_partial_json(json!({
            "collectionName": "docs",
            "annsField": "embedding",
            "limit": 2,
            "filter": r#"metadata["author"] == "ann""#,
            "searchParams": { "metricType": "L2" }
        })))
        .respond_with(ok(json!([
            {
                "chunk_id": "near",
                "text": "close by",
                "document_id": "d1",
                "metadata": { "source": "pdf", "author": "ann" },
                "distance": 0.25
            },
            {
                "chunk_id": "far",
                "text": "far away",
                "document_id": "d2",
                "metadata": "{\"source\": \"website\", \"author\": \"ann\"}",
                "distance": 3.0
            }
        ])))
        .mount(&server)
        .await;

    let store = store_for(&server);
    let request = SearchRequest::vector("docs", vec![1.0, 0.0, 0.0], 2)
        .unwrap()
        .with_filter(DocumentMetadataFilter::eq("author", "ann"))
        .unwrap();
    let result = &store.search(request).await.unwrap()[0];
    assert_eq!(result.ids, vec!["near", "far"]);
    assert!((result.similarities[0] - 0.8).abs() < 1e-6);
    assert!((result.similarities[1] - 0.25).abs() < 1e-6);
    let far = result.chunks[1].chunk.metadata.as_ref().unwrap();
    assert_eq!(far.source.as_str(), "website");
}

#[tokio::test]
async fn text_query_without_embedder_is_rejected_before_any_call() {
    let server = MockServer::start().await;
    let store = store_for(&server);
    let err = store.search(SearchRequest::text("docs", "hello", 3).unwrap()).await.unwrap_err();
    assert!(err.is_precondition());
    assert!(server.received_requests().await.unwrap_or_default().is_empty());
}

#[tokio::test]
async fn delete_queries_matches_then_deletes_by_key() {
    let server = MockServer::start().await;
    let expr = r#"chunk_id in ["d1"] or document_id in ["d1"]"#;
    Mock::given(method("POST"))
        .and(path("/v2/vectordb/entities/query"))
        .and(body_partial_json(json!({ "filter": expr, "consistencyLevel": "Strong" })))
        .respond_with(ok(json!([{ "chunk_id": "c1" }, { "chunk_id": "c2" }])))
        .mount(&server)
        .await;
    Mock::given(method("POST"))
        .and(path("/v2/vectordb/entities/delete"))
        .and(body_partial_json(json!({
            "collectionName": "docs",
            "filter": r#"chunk_id in ["c1","c2"]"#
        })))
        .respond_with(ok(json!({})))
        .expect(1)
        .mount(&server)
        .await;

    let response = store_for(&server).delete_documents("docs", &["d1".to_string()]).await;
    assert!(response.success, "{response:?}");
    assert_eq!(response.deleted_count(), Some(2));
}

#[tokio::test]
async fn delete_of_unknown_ids_skips_the_delete_call() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/v2/vectordb/entities/query"))
        .respond_with(ok(json!([])))
        .mount(&server)
        .await;
    Mock::given(method("POST"))
        .and(path("/v2/vectordb/entities/delete"))
        .respond_with(ok(json!({})))
        .expect(0)
        .mount(&server)
        .await;

    let response = store_for(&server).delete_documents("docs", &["nope".to_string()]).await;
    assert!(response.success);
    assert_eq!(response.deleted_count(), Some(0));
}

#[tokio::test]
async fn missing_collection_code_maps_to_not_found() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/v2/vectordb/collections/get_stats"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({
            "code": 100,
            "message": "collection not found[collection=ghost]"
        })))
        .mount(&server)
        .await;

    let store = store_for(&server);
    assert!(store.get_collection_stats("ghost").await.is_not_found());
    assert!(!store.collection_exists("ghost").await.unwrap());
}

#[tokio::test]
async fn stats_combine_row_count_and_schema() {
    let server = MockServer::start().await;
    mount_describe(&server, "COSINE").await;
    Mock::given(method("POST"))
        .and(path("/v2/vectordb/collections/get_stats"))
        .respond_with(ok(json!({ "rowCount": 42 })))
        .mount(&server)
        .await;

    let response = store_for(&server).get_collection_stats("docs").await;
    assert!(response.success, "{response:?}");
    let data = response.data.unwrap();
    assert_eq!(data["document_count"], json!(42));
    assert_eq!(data["dimension"], json!(3));
}

#[test]
fn zero_sizes_are_config_errors() {
    let err = MilvusBackend::new(MilvusConfig::default().with_batch_size(0)).err().unwrap();
    assert_eq!(err.error_type(), "ConfigError");
    let err = MilvusBackend::new(MilvusConfig::default().with_page_size(0)).err().unwrap();
    assert_eq!(err.error_type(), "ConfigError");
}

#[tokio::test]
async fn delete_keeps_paging_until_a_short_page() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/v2/vectordb/entities/query"))
        .and(body_partial_json(json!({ "limit": 2 })))
        .respond_with(ok(json!([{ "chunk_id": "c1" }, { "chunk_id": "c2" }])))
        .up_to_n_times(1)
        .mount(&server)
        .await;
    Mock::given(method("POST"))
        .and(path("/v2/vectordb/entities/query"))
        .respond_with(ok(json!([{ "chunk_id": "c3" }])))
        .mount(&server)
        .await;
    Mock::given(method("POST"))
        .and(path("/v2/vectordb/entities/delete"))
        .respond_with(ok(json!({})))
        .expect(2)
        .mount(&server)
        .await;

    let config = MilvusConfig::new(server.uri()).with_page_size(2);
    let store = VectorStore::new(
        Arc::new(MilvusBackend::new(config).unwrap()),
        StoreSettings::builder().embedding_dim(3).build().unwrap(),
    );
    let response = store.delete_documents("docs", &["d1".to_string()]).await;
    assert!(response.success, "{response:?}");
    assert_eq!(response.deleted_count(), Some(3));
}

#[tokio::test]
async fn failed_delete_after_a_full_page_reports_progress() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/v2/vectordb/entities/query"))
        .respond_with(ok(json!([{ "chunk_id": "c1" }, { "chunk_id": "c2" }])))
        .up_to_n_times(1)
        .mount(&server)
        .await;
    Mock::given(method("POST"))
        .and(path("/v2/vectordb/entities/query"))
        .respond_with(ok(json!([{ "chunk_id": "c3" }])))
        .mount(&server)
        .await;
    Mock::given(method("POST"))
        .and(path("/v2/vectordb/entities/delete"))
        .respond_with(ok(json!({})))
        .up_to_n_times(1)
        .mount(&server)
        .await;
    Mock::given(method("POST"))
        .and(path("/v2/vectordb/entities/delete"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({
            "code": 1100,
            "message": "delete rejected"
        })))
        .mount(&server)
        .await;

    let config = MilvusConfig::new(server.uri()).with_page_size(2);
    let store = VectorStore::new(
        Arc::new(MilvusBackend::new(config).unwrap()),
        StoreSettings::builder().embedding_dim(3).build().unwrap(),
    );
    let response = store.delete_documents("docs", &["d1".to_string()]).await;
    assert!(!response.success);
    assert_eq!(response.deleted_count(), Some(2));
}

#[tokio::test]
async fn collection_dropped_elsewhere_is_described_again() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/v2/vectordb/collections/describe"))
        .respond_with(ok(json!({
            "collectionName": "docs",
            "indexes": [{ "fieldName": "embedding", "metricType": "COSINE" }]
        })))
        .up_to_n_times(1)
        .mount(&server)
        .await;
    mount_describe(&server, "L2").await;
    Mock::given(method("POST"))
        .and(path("/v2/vectordb/collections/has"))
        .respond_with(ok(json!({ "has": false })))
        .mount(&server)
        .await;
    Mock::given(method("POST"))
        .and(path("/v2/vectordb/entities/search"))
        .respond_with(ok(json!([
            { "chunk_id": "c1", "text": "hi", "document_id": "d1", "distance": 0.25 }
        ])))
        .mount(&server)
        .await;

    let store = store_for(&server);
    let search = || SearchRequest::vector("docs", vec![1.0, 0.0, 0.0], 1).unwrap();
    assert_eq!(store.search(search()).await.unwrap()[0].similarities, vec![0.25]);

    let err = store.delete_collection("docs").await.unwrap_err();
    assert_eq!(err.error_type(), "CollectionError");

    let result = &store.search(search()).await.unwrap()[0];
    assert!((result.similarities[0] - 0.8).abs() < 1e-6);
}
