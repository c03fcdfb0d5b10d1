//! HTTP collaborators against mocked services

use futures::StreamExt;
use serde_json::json;
use wiremock::matchers::{body_json, body_partial_json, method, path};
use wiremock::{Mock, MockServer, ResponseTemplate};

use chatrelay::config::{GenerationConfig, VectorSearchConfig};
use chatrelay::providers::{Generator, OllamaGenerator};
use chatrelay::services::{HttpVectorSearch, VectorSearch};
use chatrelay::store::{FileRecord, PDF_CONTENT_TYPE};

fn generator(server: &MockServer) -> OllamaGenerator {
    OllamaGenerator::new(GenerationConfig {
        host: server.uri(),
        model: "test-model".to_string(),
        timeout_secs: 5,
    })
    .unwrap()
}

fn file(id: &str) -> FileRecord {
    FileRecord {
        file_id: id.to_string(),
        user_id: "u1".to_string(),
        chat_id: "c1".to_string(),
        file_name: format!("{}.pdf", id),
        file_path: format!("/data/{}.pdf", id),
        content_type: PDF_CONTENT_TYPE.to_string(),
        vectorized: true,
        error: None,
    }
}

#[tokio::test]
async fn test_ollama_stream_yields_fragments() {
    let server = MockServer::start().await;
    let body = concat!(
        "{\"response\":\"Hel\",\"done\":false}\n",
        "{\"response\":\"\",\"done\":false}\n",
        "{\"response\":\"lo\",\"done\":false}\n",
        "{\"response\":\"\",\"done\":true}\n",
    );
    Mock::given(method("POST"))
        .and(path("/api/generate"))
        .and(body_partial_json(json!({"model": "test-model", "stream": true})))
        .respond_with(ResponseTemplate::new(200).set_body_string(body))
        .expect(1)
        .mount(&server)
        .await;

    let stream = generator(&server).generate_stream("hi").await.unwrap();
    let fragments: Vec<String> = stream.map(|f| f.unwrap()).collect().await;
    assert_eq!(fragments, vec!["Hel", "lo"]);
}

#[tokio::test]
async fn test_ollama_stream_error_line() {
    let server = MockServer::start().await;
    let body = concat!(
        "{\"response\":\"partial\",\"done\":false}\n",
        "{\"error\":\"model unloaded\"}\n",
    );
    Mock::given(method("POST"))
        .and(path("/api/generate"))
        .respond_with(ResponseTemplate::new(200).set_body_string(body))
        .mount(&server)
        .await;

    let stream = generator(&server).generate_stream("hi").await.unwrap();
    let items: Vec<_> = stream.collect().await;
    assert_eq!(items.len(), 2);
    assert_eq!(items[0].as_ref().unwrap(), "partial");
    assert!(items[1].as_ref().unwrap_err().to_string().contains("model unloaded"));
}

#[tokio::test]
async fn test_ollama_generate_one_shot() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/api/generate"))
        .and(body_json(json!({"model": "test-model", "prompt": "summarize", "stream": false})))
        .respond_with(
            ResponseTemplate::new(200).set_body_json(json!({"response": "a summary", "done": true})),
        )
        .expect(1)
        .mount(&server)
        .await;

    let reply = generator(&server).generate("summarize").await.unwrap();
    assert_eq!(reply, "a summary");
}

#[tokio::test]
async fn test_ollama_http_error() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/api/generate"))
        .respond_with(ResponseTemplate::new(404).set_body_string("model not found"))
        .mount(&server)
        .await;

    let result = generator(&server).generate_stream("hi").await;
    let error = result.err().unwrap().to_string();
    assert!(error.contains("404"));
    assert!(error.contains("model not found"));
}

#[tokio::test]
async fn test_vector_search_request_shape() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/query"))
        .and(body_json(json!({
            "userId": "u1",
            "chatId": "c1",
            "fileIds": ["f1", "f2"],
            "topK": 3,
            "queryTexts": ["alpha", "beta"]
        })))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({
            "success": true,
            "results": [
                {"id": "d1", "source": "f1.pdf", "page": 2, "document": "text", "distance": 0.25}
            ]
        })))
        .expect(1)
        .mount(&server)
        .await;

    let search = HttpVectorSearch::new(&VectorSearchConfig {
        base_url: server.uri(),
        ..Default::default()
    })
    .unwrap();
    let hits = search
        .query(
            &[file("f1"), file("f2")],
            3,
            &["alpha".to_string(), "beta".to_string()],
        )
        .await
        .unwrap();

    assert_eq!(hits.len(), 1);
    assert_eq!(hits[0].source, "f1.pdf");
    assert_eq!(hits[0].page, 2);
}

#[tokio::test]
async fn test_vector_search_failure_flag() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/query"))
        .respond_with(
            ResponseTemplate::new(200).set_body_json(json!({"success": false, "message": "index offline"})),
        )
        .mount(&server)
        .await;

    let search = HttpVectorSearch::new(&VectorSearchConfig {
        base_url: server.uri(),
        ..Default::default()
    })
    .unwrap();
    let error = search
        .query(&[file("f1")], 3, &["alpha".to_string()])
        .await
        .unwrap_err();
    assert!(error.to_string().contains("index offline"));
}
