//! End-to-end coverage against a live, filesystem-backed instance: small
//! proxy uploads, the presigned and multipart routes, dedup, and the
//! memory and name-collision rejection paths.

mod common;

use common::TestServer;
use sha2::{Digest, Sha256};

fn hash_of(bytes: &[u8]) -> String {
    hex::encode(Sha256::digest(bytes))
}

#[tokio::test]
async fn small_upload_goes_through_proxy_route() {
    let server = TestServer::start().await;
    let client = reqwest::Client::new();
    let body = b"a small wav-shaped payload".to_vec();

    let resp = client
        .post(format!("{}/upload/proxy?filename=small.wav", server.base_url()))
        .body(body.clone())
        .send()
        .await
        .unwrap();
    assert_eq!(resp.status(), 200);

    let json: serde_json::Value = resp.json().await.unwrap();
    assert_eq!(json["key"], "small.wav");
    assert_eq!(json["isDuplicate"], false);
    assert_eq!(json["fileHash"], hash_of(&body));
    assert_eq!(json["size"], body.len());
}

#[tokio::test]
async fn duplicate_content_under_a_new_name_resolves_to_the_original_key() {
    let server = TestServer::start().await;
    let client = reqwest::Client::new();
    let body = b"identical bytes uploaded twice".to_vec();

    client
        .post(format!("{}/upload/proxy?filename=first.wav", server.base_url()))
        .body(body.clone())
        .send()
        .await
        .unwrap();

    let resp = client
        .post(format!("{}/upload/proxy?filename=second.wav", server.base_url()))
        .body(body)
        .send()
        .await
        .unwrap();
    assert_eq!(resp.status(), 200);
    let json: serde_json::Value = resp.json().await.unwrap();
    assert_eq!(json["isDuplicate"], true);
    assert_eq!(json["key"], "first.wav");
}

#[tokio::test]
async fn oversized_declared_size_is_rejected_before_any_bytes_move() {
    let server = TestServer::start().await;
    let client = reqwest::Client::new();

    let resp = client
        .post(format!("{}/upload/presigned", server.base_url()))
        .json(&serde_json::json!({
            "filename": "huge.wav",
            "fileSize": 999_999_999_999u64,
        }))
        .send()
        .await
        .unwrap();
    assert_eq!(resp.status(), 400);
    let json: serde_json::Value = resp.json().await.unwrap();
    assert_eq!(json["error"], "invalid_input");
}

#[tokio::test]
async fn large_file_above_the_threshold_is_routed_direct() {
    let server = TestServer::start_with_env(&[
        ("LARGE_FILE_THRESHOLD_MB", "1"),
        ("DIRECT_THRESHOLD_MB", "200"),
    ])
    .await;
    let client = reqwest::Client::new();
    let declared_hash = "a".repeat(64);

    let resp = client
        .post(format!("{}/upload/presigned", server.base_url()))
        .json(&serde_json::json!({
            "filename": "album.wav",
            "fileSize": 50_000_000u64,
            "fileHash": declared_hash,
        }))
        .send()
        .await
        .unwrap();
    assert_eq!(resp.status(), 200);
    let json: serde_json::Value = resp.json().await.unwrap();
    assert_eq!(json["uploadMethod"], "direct_minio");
    assert!(json["uploadUrl"].as_str().unwrap().starts_with("file://"));

    // A presigned admission only reserves a route; the index has no
    // record of this hash until bytes actually land in the store, so a
    // second request for the same hash under a new name is not yet a
    // duplicate.
    let resp2 = client
        .post(format!("{}/upload/presigned", server.base_url()))
        .json(&serde_json::json!({
            "filename": "album-copy.wav",
            "fileSize": 50_000_000u64,
            "fileHash": declared_hash,
        }))
        .send()
        .await
        .unwrap();
    assert_eq!(resp2.status(), 200);
}

#[tokio::test]
async fn multipart_session_completes_and_composes_parts_in_order() {
    let server = TestServer::start_with_env(&[("MULTIPART_CHUNK_MB", "1")]).await;
    let client = reqwest::Client::new();

    let part_a = vec![b'A'; 200_000];
    let part_b = vec![b'B'; 150_000];
    let mut whole = part_a.clone();
    whole.extend_from_slice(&part_b);
    let expected_hash = hash_of(&whole);

    let init: serde_json::Value = client
        .post(format!("{}/multipart/init", server.base_url()))
        .json(&serde_json::json!({
            "filename": "sermon.wav",
            "fileSize": whole.len(),
            "fileHash": expected_hash,
        }))
        .send()
        .await
        .unwrap()
        .json()
        .await
        .unwrap();
    let upload_id = init["uploadId"].as_str().unwrap().to_string();

    for (part_number, bytes) in [(1u32, &part_a), (2u32, &part_b)] {
        let part_url: serde_json::Value = client
            .get(format!(
                "{}/multipart/part-url?uploadId={upload_id}&partNumber={part_number}",
                server.base_url()
            ))
            .send()
            .await
            .unwrap()
            .json()
            .await
            .unwrap();
        let path = part_url["uploadUrl"].as_str().unwrap().trim_start_matches("file://");
        tokio::fs::write(path, bytes).await.unwrap();
    }

    let status: serde_json::Value = client
        .get(format!("{}/multipart/status/{upload_id}", server.base_url()))
        .send()
        .await
        .unwrap()
        .json()
        .await
        .unwrap();
    assert_eq!(status["partsReceived"], 2);

    let complete: serde_json::Value = client
        .post(format!("{}/multipart/complete", server.base_url()))
        .json(&serde_json::json!({
            "uploadId": upload_id,
            "parts": [
                { "partNumber": 1, "etag": "etag-part-1" },
                { "partNumber": 2, "etag": "etag-part-2" },
            ],
        }))
        .send()
        .await
        .unwrap()
        .json()
        .await
        .unwrap();
    assert_eq!(complete["success"], true);
    assert_eq!(complete["key"], "sermon.wav");
    assert_eq!(complete["size"], whole.len());
    assert_eq!(complete["isDuplicate"], false);

    let verify: serde_json::Value = client
        .post(format!("{}/files/sermon.wav/verify", server.base_url()))
        .json(&serde_json::json!({ "expectedHash": expected_hash }))
        .send()
        .await
        .unwrap()
        .json()
        .await
        .unwrap();
    assert_eq!(verify["verified"], true);
}

#[tokio::test]
async fn multipart_complete_rejects_a_truncated_part_set() {
    let server = TestServer::start_with_env(&[("MULTIPART_CHUNK_MB", "1")]).await;
    let client = reqwest::Client::new();

    let part_a = vec![b'A'; 200_000];
    let part_b = vec![b'B'; 150_000];

    let init: serde_json::Value = client
        .post(format!("{}/multipart/init", server.base_url()))
        .json(&serde_json::json!({
            "filename": "talk.wav",
            "fileSize": part_a.len() + part_b.len(),
        }))
        .send()
        .await
        .unwrap()
        .json()
        .await
        .unwrap();
    let upload_id = init["uploadId"].as_str().unwrap().to_string();

    for (part_number, bytes) in [(1u32, &part_a), (2u32, &part_b)] {
        let part_url: serde_json::Value = client
            .get(format!(
                "{}/multipart/part-url?uploadId={upload_id}&partNumber={part_number}",
                server.base_url()
            ))
            .send()
            .await
            .unwrap()
            .json()
            .await
            .unwrap();
        let path = part_url["uploadUrl"].as_str().unwrap().trim_start_matches("file://");
        tokio::fs::write(path, bytes).await.unwrap();
    }

    // Only part 1 of 2 is submitted; completion must reject rather than
    // silently compose a truncated object.
    let resp = client
        .post(format!("{}/multipart/complete", server.base_url()))
        .json(&serde_json::json!({
            "uploadId": upload_id,
            "parts": [ { "partNumber": 1, "etag": "etag-part-1" } ],
        }))
        .send()
        .await
        .unwrap();
    assert_eq!(resp.status(), 412);

    let status: serde_json::Value = client
        .get(format!("{}/multipart/status/{upload_id}", server.base_url()))
        .send()
        .await
        .unwrap()
        .json()
        .await
        .unwrap();
    assert_eq!(status["state"], "active");
}

#[tokio::test]
async fn aborted_session_frees_its_slot_and_a_fresh_session_can_be_opened() {
    let server = TestServer::start_with_env(&[("MULTIPART_CHUNK_MB", "1")]).await;
    let client = reqwest::Client::new();

    let init: serde_json::Value = client
        .post(format!("{}/multipart/init", server.base_url()))
        .json(&serde_json::json!({ "filename": "retry.wav", "fileSize": 5_000_000u64 }))
        .send()
        .await
        .unwrap()
        .json()
        .await
        .unwrap();
    let upload_id = init["uploadId"].as_str().unwrap().to_string();

    let resp = client
        .delete(format!("{}/multipart/abort/{upload_id}", server.base_url()))
        .send()
        .await
        .unwrap();
    assert_eq!(resp.status(), 200);

    let resp = client
        .get(format!("{}/multipart/status/{upload_id}", server.base_url()))
        .send()
        .await
        .unwrap();
    assert_eq!(resp.status(), 404);

    let reinit = client
        .post(format!("{}/multipart/init", server.base_url()))
        .json(&serde_json::json!({ "filename": "retry.wav", "fileSize": 5_000_000u64 }))
        .send()
        .await
        .unwrap();
    assert_eq!(reinit.status(), 200);
}

#[tokio::test]
async fn proxy_upload_is_rejected_when_memory_budget_is_effectively_zero() {
    let server = TestServer::start_with_env(&[("MAX_MEMORY_MB", "1")]).await;
    let client = reqwest::Client::new();

    let resp = client
        .post(format!("{}/upload/proxy?filename=tight.wav", server.base_url()))
        .body(vec![0u8; 1024])
        .send()
        .await
        .unwrap();
    assert_eq!(resp.status(), 507);
    let json: serde_json::Value = resp.json().await.unwrap();
    assert_eq!(json["error"], "insufficient_memory");
}

#[tokio::test]
async fn name_collision_with_a_different_hash_is_rejected_by_default() {
    let server = TestServer::start().await;
    let client = reqwest::Client::new();
    let body = b"original bytes under this name".to_vec();

    client
        .post(format!("{}/upload/proxy?filename=claimed.wav", server.base_url()))
        .body(body)
        .send()
        .await
        .unwrap();

    let resp = client
        .post(format!("{}/upload/presigned", server.base_url()))
        .json(&serde_json::json!({
            "filename": "claimed.wav",
            "fileSize": 4096u64,
            "fileHash": "b".repeat(64),
        }))
        .send()
        .await
        .unwrap();
    assert_eq!(resp.status(), 409);
    let json: serde_json::Value = resp.json().await.unwrap();
    assert_eq!(json["error"], "name_collision");
}

#[tokio::test]
async fn name_collision_is_permitted_when_overwrite_is_allowed() {
    let server = TestServer::start_with_env(&[("ALLOW_FILENAME_OVERWRITE", "true")]).await;
    let client = reqwest::Client::new();
    let body = b"original bytes under this name".to_vec();

    client
        .post(format!("{}/upload/proxy?filename=claimed.wav", server.base_url()))
        .body(body)
        .send()
        .await
        .unwrap();

    let resp = client
        .post(format!("{}/upload/presigned", server.base_url()))
        .json(&serde_json::json!({
            "filename": "claimed.wav",
            "fileSize": 4096u64,
            "fileHash": "b".repeat(64),
        }))
        .send()
        .await
        .unwrap();
    assert_eq!(resp.status(), 200);
}

#[tokio::test]
async fn health_and_stats_reflect_a_fresh_filesystem_backed_instance() {
    let server = TestServer::start().await;
    let client = reqwest::Client::new();

    let health: serde_json::Value = client
        .get(format!("{}/health", server.base_url()))
        .send()
        .await
        .unwrap()
        .json()
        .await
        .unwrap();
    assert_eq!(health["status"], "ok");

    let stats: serde_json::Value = client
        .get(format!("{}/stats", server.base_url()))
        .send()
        .await
        .unwrap()
        .json()
        .await
        .unwrap();
    assert_eq!(stats["indexedObjects"], 0);
    assert_eq!(stats["activeUploadSessions"], 0);
}
