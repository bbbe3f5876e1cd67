//! HTTP API tests against a live server on a random local port.

use std::fs;
use std::path::Path;
use std::sync::Arc;
use tempfile::TempDir;
use tokio::net::TcpListener;
use tokio_util::sync::CancellationToken;

use pmo_index::config::Config;
use pmo_index::index::Index;
use pmo_index::server;

const RISK: &str = "---
id: vendor-delay
title: Vendor delay
severity: high
status: open
project: project:apollo
---
The vendor may slip the antenna delivery.
";

const PROJECT: &str = "---
id: apollo
title: Apollo Launch
owner: dana
status: active
---
Ship the lander.
";

fn write(root: &Path, rel: &str, content: &str) {
    let path = root.join(rel);
    fs::create_dir_all(path.parent().unwrap()).unwrap();
    fs::write(path, content).unwrap();
}

struct TestServer {
    base: String,
    root: std::path::PathBuf,
    cancel: CancellationToken,
    handle: tokio::task::JoinHandle<anyhow::Result<()>>,
    _tmp: TempDir,
}

impl TestServer {
    async fn start() -> Self {
        let tmp = TempDir::new().unwrap();
        let root = tmp.path().join("ws");
        write(&root, "projects/apollo.md", PROJECT);
        write(&root, "risks/vendor-delay.md", RISK);

        let index = Index::open(Config::for_root(&root)).await.unwrap();
        index.reconcile(&CancellationToken::new()).await.unwrap();

        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let base = format!("http://{}", listener.local_addr().unwrap());
        let cancel = CancellationToken::new();
        let handle = tokio::spawn(server::serve(listener, Arc::new(index), cancel.clone()));
        Self {
            base,
            root,
            cancel,
            handle,
            _tmp: tmp,
        }
    }

    fn url(&self, path: &str) -> String {
        format!("{}{}", self.base, path)
    }

    async fn stop(self) {
        self.cancel.cancel();
        self.handle.await.unwrap().unwrap();
    }
}

async fn get_json(url: &str) -> (u16, serde_json::Value) {
    let resp = reqwest::get(url).await.unwrap();
    let status = resp.status().as_u16();
    (status, resp.json().await.unwrap())
}

#[tokio::test]
async fn test_health_and_listings() {
    let srv = TestServer::start().await;

    let (status, body) = get_json(&srv.url("/health")).await;
    assert_eq!(status, 200);
    assert_eq!(body["status"], "ok");

    let (_, body) = get_json(&srv.url("/api/files")).await;
    assert_eq!(body["documents"].as_array().unwrap().len(), 2);

    let (_, body) = get_json(&srv.url("/api/risks?status=open")).await;
    let docs = body["documents"].as_array().unwrap();
    assert_eq!(docs.len(), 1);
    assert_eq!(docs[0]["identifier"], "vendor-delay");
    assert_eq!(docs[0]["doc_type"], "risk");

    let (_, body) = get_json(&srv.url("/api/projects?owner=nobody")).await;
    assert!(body["documents"].as_array().unwrap().is_empty());

    let (status, body) = get_json(&srv.url("/api/files?type=widget")).await;
    assert_eq!(status, 400);
    assert_eq!(body["error"]["code"], "bad_request");

    srv.stop().await;
}

#[tokio::test]
async fn test_document_lookup_with_backlinks() {
    let srv = TestServer::start().await;

    let (status, body) = get_json(&srv.url("/api/files/by-id/project/apollo")).await;
    assert_eq!(status, 200);
    assert_eq!(body["document"]["path"], "projects/apollo.md");
    let backlinks = body["backlinks"].as_array().unwrap();
    assert_eq!(backlinks.len(), 1);
    assert_eq!(backlinks[0]["source_path"], "risks/vendor-delay.md");

    let (status, body) = get_json(&srv.url("/api/files/by-path/risks/vendor-delay.md")).await;
    assert_eq!(status, 200);
    assert_eq!(body["references"][0]["target"], "project:apollo");
    assert_eq!(body["references"][0]["resolved_path"], "projects/apollo.md");

    let (status, body) = get_json(&srv.url("/api/files/by-path/risks/missing.md")).await;
    assert_eq!(status, 404);
    assert_eq!(body["error"]["code"], "not_found");

    srv.stop().await;
}

#[tokio::test]
async fn test_search_endpoint() {
    let srv = TestServer::start().await;

    let (status, body) = get_json(&srv.url("/api/search?q=antenna")).await;
    assert_eq!(status, 200);
    let results = body["results"].as_array().unwrap();
    assert_eq!(results.len(), 1);
    assert_eq!(results[0]["path"], "risks/vendor-delay.md");

    let (status, body) = get_json(&srv.url("/api/search?q=antenna&mode=semantic")).await;
    assert_eq!(status, 400);
    assert_eq!(body["error"]["code"], "embeddings_disabled");

    let (status, _) = get_json(&srv.url("/api/search?q=%20")).await;
    assert_eq!(status, 400);

    srv.stop().await;
}

#[tokio::test]
async fn test_apply_rewrites_and_reindexes() {
    let srv = TestServer::start().await;
    let client = reqwest::Client::new();

    let content = RISK.replace("severity: high", "severity: critical");
    let resp = client
        .post(srv.url("/api/apply"))
        .json(&serde_json::json!({
            "path": "risks/vendor-delay.md",
            "content": content,
            "backup": true,
        }))
        .send()
        .await
        .unwrap();
    assert_eq!(resp.status().as_u16(), 200);
    let body: serde_json::Value = resp.json().await.unwrap();
    assert_eq!(body["outcome"], "indexed");

    assert_eq!(fs::read_to_string(srv.root.join("risks/vendor-delay.md")).unwrap(), content);
    assert_eq!(fs::read_to_string(srv.root.join("risks/vendor-delay.md.bak")).unwrap(), RISK);

    let (_, body) = get_json(&srv.url("/api/files/by-id/risk/vendor-delay")).await;
    assert_eq!(body["document"]["metadata"]["severity"], "critical");

    let resp = client
        .post(srv.url("/api/apply"))
        .json(&serde_json::json!({"path": "../outside.md", "content": "x"}))
        .send()
        .await
        .unwrap();
    assert_eq!(resp.status().as_u16(), 400);

    srv.stop().await;
}

#[tokio::test]
async fn test_reconcile_and_diagnostics_endpoints() {
    let srv = TestServer::start().await;
    fs::remove_file(srv.root.join("projects/apollo.md")).unwrap();

    let resp = reqwest::Client::new()
        .post(srv.url("/api/reconcile"))
        .send()
        .await
        .unwrap();
    assert_eq!(resp.status().as_u16(), 200);
    let report: serde_json::Value = resp.json().await.unwrap();
    assert_eq!(report["removed"], 1);
    assert_eq!(report["unchanged"], 1);

    let (_, body) = get_json(&srv.url("/api/diagnostics")).await;
    let dangling = body["dangling_references"].as_array().unwrap();
    assert_eq!(dangling.len(), 1);
    assert_eq!(dangling[0]["target"], "project:apollo");

    let (_, stats) = get_json(&srv.url("/api/stats")).await;
    assert_eq!(stats["documents"], 1);
    assert_eq!(stats["dangling_references"], 1);

    srv.stop().await;
}
