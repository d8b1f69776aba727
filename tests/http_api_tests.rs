//! End-to-end tests for the HTTP surface, driven through the router.

use axum::body::Body;
use axum::http::{header, Method, Request, StatusCode};
use axum::Router;
use meridian::api::build_router;
use meridian::config::Config;
use meridian::server::Server;
use serde_json::{json, Value};
use std::sync::Arc;
use tower::ServiceExt;

struct TestServer {
    _dir: tempfile::TempDir,
    server: Arc<Server>,
    router: Router,
}

async fn open_server(auth_enabled: bool) -> TestServer {
    let dir = tempfile::tempdir().unwrap();
    let mut config = Config::default();
    config.broker.dir = dir.path().join("broker").display().to_string();
    config.data.dir = dir.path().join("data").display().to_string();
    config.cluster.dir = dir.path().join("cluster").display().to_string();
    config.authentication.enabled = auth_enabled;
    let server = Server::open(config).await.unwrap();
    let router = build_router(server.clone());
    TestServer {
        _dir: dir,
        server,
        router,
    }
}

async fn send(router: &Router, request: Request<Body>) -> (StatusCode, Vec<(String, String)>, Value) {
    let response = router.clone().oneshot(request).await.unwrap();
    let status = response.status();
    let headers: Vec<(String, String)> = response
        .headers()
        .iter()
        .map(|(k, v)| (k.to_string(), v.to_str().unwrap_or("").to_string()))
        .collect();
    let body = axum::body::to_bytes(response.into_body(), usize::MAX)
        .await
        .unwrap();
    let value = if body.is_empty() {
        Value::Null
    } else {
        serde_json::from_slice(&body).unwrap_or(Value::String(
            String::from_utf8_lossy(&body).into_owned(),
        ))
    };
    (status, headers, value)
}

async fn get(router: &Router, uri: &str) -> (StatusCode, Value) {
    let (status, _, body) = send(
        router,
        Request::builder().uri(uri).body(Body::empty()).unwrap(),
    )
    .await;
    (status, body)
}

async fn post_json(router: &Router, uri: &str, body: Value) -> (StatusCode, Value) {
    let (status, _, value) = send(
        router,
        Request::builder()
            .method(Method::POST)
            .uri(uri)
            .header(header::CONTENT_TYPE, "application/json")
            .body(Body::from(body.to_string()))
            .unwrap(),
    )
    .await;
    (status, value)
}

async fn query(router: &Router, db: &str, q: &str) -> (StatusCode, Value) {
    let encoded: String = url::form_urlencoded::Serializer::new(String::new())
        .append_pair("db", db)
        .append_pair("q", q)
        .finish();
    get(router, &format!("/query?{encoded}")).await
}

fn header_value<'a>(headers: &'a [(String, String)], name: &str) -> Option<&'a str> {
    headers
        .iter()
        .find(|(k, _)| k.eq_ignore_ascii_case(name))
        .map(|(_, v)| v.as_str())
}

#[tokio::test]
async fn ping_and_status() {
    let ts = open_server(false).await;
    let (status, _) = get(&ts.router, "/ping").await;
    assert_eq!(status, StatusCode::NO_CONTENT);

    let (status, body) = get(&ts.router, "/status").await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["id"], 0);
    assert_eq!(body["index"], ts.server.index());
}

#[tokio::test]
async fn responses_carry_version_and_request_id() {
    let ts = open_server(false).await;
    let (_, headers, _) = send(
        &ts.router,
        Request::builder().uri("/ping").body(Body::empty()).unwrap(),
    )
    .await;
    assert!(header_value(&headers, "x-influxdb-version").is_some());
    let request_id = header_value(&headers, "request-id").unwrap();
    assert_eq!(request_id.len(), 36, "request id must be a UUID");
}

#[tokio::test]
async fn cors_echoes_origin_and_short_circuits_preflight() {
    let ts = open_server(false).await;
    let (_, headers, _) = send(
        &ts.router,
        Request::builder()
            .uri("/ping")
            .header(header::ORIGIN, "http://grafana.local")
            .body(Body::empty())
            .unwrap(),
    )
    .await;
    assert_eq!(
        header_value(&headers, "access-control-allow-origin"),
        Some("http://grafana.local")
    );

    let (status, headers, body) = send(
        &ts.router,
        Request::builder()
            .method(Method::OPTIONS)
            .uri("/query")
            .header(header::ORIGIN, "http://grafana.local")
            .header("Access-Control-Request-Method", "GET")
            .body(Body::empty())
            .unwrap(),
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body, Value::Null, "preflight body must be empty");
    assert_eq!(
        header_value(&headers, "access-control-allow-origin"),
        Some("http://grafana.local")
    );
}

#[tokio::test]
async fn data_node_lifecycle() {
    let ts = open_server(false).await;

    let (status, body) = post_json(&ts.router, "/data_nodes", json!({"url": "http://a:8086"})).await;
    assert_eq!(status, StatusCode::CREATED);
    assert_eq!(body["id"], 1);
    assert_eq!(body["url"], "http://a:8086");

    let (status, body) = post_json(&ts.router, "/data_nodes", json!({"url": "http://a:8086"})).await;
    assert_eq!(status, StatusCode::CONFLICT);
    assert_eq!(body["error"], "data node exists");

    let (status, body) = post_json(&ts.router, "/data_nodes", json!({"url": "not a url"})).await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert_eq!(body["error"], "invalid data node url");

    let (status, body) = get(&ts.router, "/data_nodes").await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body, json!([{"id": 1, "url": "http://a:8086"}]));

    let (status, _) = delete(&ts.router, "/data_nodes/1").await;
    assert_eq!(status, StatusCode::NO_CONTENT);

    let (status, body) = delete(&ts.router, "/data_nodes/1").await;
    assert_eq!(status, StatusCode::NOT_FOUND);
    assert_eq!(body["error"], "data node not found");
}

async fn delete(router: &Router, uri: &str) -> (StatusCode, Value) {
    let (status, _, body) = send(
        router,
        Request::builder()
            .method(Method::DELETE)
            .uri(uri)
            .body(Body::empty())
            .unwrap(),
    )
    .await;
    (status, body)
}

#[tokio::test]
async fn write_validation_statuses() {
    let ts = open_server(false).await;

    let (status, body) = post_json(
        &ts.router,
        "/write",
        json!({"points": [{"name": "cpu", "values": {"v": 1}}]}),
    )
    .await;
    assert_eq!(status, StatusCode::INTERNAL_SERVER_ERROR);
    assert_eq!(body["error"], "database is required");

    let (status, body) = post_json(
        &ts.router,
        "/write",
        json!({"database": "nope", "points": []}),
    )
    .await;
    assert_eq!(status, StatusCode::NOT_FOUND);
    assert_eq!(body["error"], "database not found: \"nope\"");

    // An empty body acknowledges without writing.
    let (status, _, _) = send(
        &ts.router,
        Request::builder()
            .method(Method::POST)
            .uri("/write")
            .body(Body::empty())
            .unwrap(),
    )
    .await;
    assert_eq!(status, StatusCode::OK);
}

#[tokio::test]
async fn write_then_query_round_trip() {
    let ts = open_server(false).await;
    let (status, _) = query(&ts.router, "", "CREATE DATABASE metrics").await;
    assert_eq!(status, StatusCode::OK);
    let (status, _) = query(
        &ts.router,
        "",
        "CREATE RETENTION POLICY default ON metrics DURATION INF REPLICATION 1 DEFAULT",
    )
    .await;
    assert_eq!(status, StatusCode::OK);

    // Batch-level tags and second-precision timestamps fold into points.
    let (status, _) = post_json(
        &ts.router,
        "/write",
        json!({
            "database": "metrics",
            "tags": {"host": "a"},
            "timestamp": 1_700_000_000i64,
            "precision": "s",
            "points": [{"name": "cpu", "values": {"v": 1.5}}]
        }),
    )
    .await;
    assert_eq!(status, StatusCode::OK);

    let (status, body) = query(&ts.router, "metrics", "SELECT * FROM cpu").await;
    assert_eq!(status, StatusCode::OK);
    let series = &body["results"][0]["series"][0];
    assert_eq!(series["name"], "cpu");
    assert_eq!(series["tags"]["host"], "a");
    assert_eq!(series["columns"], json!(["time", "v"]));
    assert_eq!(
        series["values"][0],
        json!([1_700_000_000_000_000_000i64, 1.5])
    );
}

#[tokio::test]
async fn duplicate_timestamp_is_last_write_wins() {
    let ts = open_server(false).await;
    query(&ts.router, "", "CREATE DATABASE metrics").await;
    query(
        &ts.router,
        "",
        "CREATE RETENTION POLICY default ON metrics DURATION INF REPLICATION 1 DEFAULT",
    )
    .await;

    for value in [1, 2] {
        let (status, _) = post_json(
            &ts.router,
            "/write",
            json!({
                "database": "metrics",
                "points": [{"name": "cpu", "tags": {"host": "a"},
                            "timestamp": 1_700_000_000i64, "precision": "s",
                            "values": {"v": value}}]
            }),
        )
        .await;
        assert_eq!(status, StatusCode::OK);
    }

    let (_, body) = query(&ts.router, "metrics", "SELECT v FROM cpu").await;
    let values = &body["results"][0]["series"][0]["values"];
    assert_eq!(values.as_array().unwrap().len(), 1);
    assert_eq!(values[0][1], 2);
}

#[tokio::test]
async fn query_errors_and_not_executed_cascade() {
    let ts = open_server(false).await;
    query(&ts.router, "", "CREATE DATABASE metrics").await;
    query(
        &ts.router,
        "",
        "CREATE RETENTION POLICY default ON metrics DURATION INF REPLICATION 1 DEFAULT",
    )
    .await;

    let (status, body) = query(&ts.router, "metrics", "SELECT * FROM nope").await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["results"][0]["error"], "measurement not found");

    let (status, body) = query(
        &ts.router,
        "metrics",
        "SELECT * FROM nope; SHOW MEASUREMENTS",
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["results"][0]["error"], "measurement not found");
    assert_eq!(body["results"][1]["error"], "not executed");

    let (status, body) = query(&ts.router, "metrics", "FROB the database").await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert!(body["error"]
        .as_str()
        .unwrap()
        .starts_with("error parsing query:"));
}

#[tokio::test]
async fn pretty_printing_is_opt_in() {
    let ts = open_server(false).await;
    let (_, _, compact) = send(
        &ts.router,
        Request::builder()
            .uri("/status")
            .body(Body::empty())
            .unwrap(),
    )
    .await;
    assert!(compact.is_object());

    let response = ts
        .router
        .clone()
        .oneshot(
            Request::builder()
                .uri("/status?pretty=true")
                .body(Body::empty())
                .unwrap(),
        )
        .await
        .unwrap();
    let body = axum::body::to_bytes(response.into_body(), usize::MAX)
        .await
        .unwrap();
    let text = String::from_utf8(body.to_vec()).unwrap();
    assert!(text.contains('\n'), "pretty output must be indented");
}

#[tokio::test]
async fn gzip_is_negotiated() {
    let ts = open_server(false).await;
    for i in 0..8 {
        query(&ts.router, "", &format!("CREATE DATABASE padding_{i}")).await;
    }
    let (_, headers, _) = send(
        &ts.router,
        Request::builder()
            .uri("/query?q=SHOW%20DATABASES")
            .header(header::ACCEPT_ENCODING, "gzip")
            .body(Body::empty())
            .unwrap(),
    )
    .await;
    assert_eq!(header_value(&headers, "content-encoding"), Some("gzip"));
}

#[tokio::test]
async fn metastore_snapshot_is_peer_loadable() {
    let ts = open_server(false).await;
    query(&ts.router, "", "CREATE DATABASE metrics").await;

    let response = ts
        .router
        .clone()
        .oneshot(
            Request::builder()
                .uri("/metastore")
                .body(Body::empty())
                .unwrap(),
        )
        .await
        .unwrap();
    assert_eq!(
        response
            .headers()
            .get(header::CONTENT_DISPOSITION)
            .unwrap()
            .to_str()
            .unwrap(),
        r#"attachment; filename="meta""#
    );
    let blob = axum::body::to_bytes(response.into_body(), usize::MAX)
        .await
        .unwrap();

    let peer = open_server(false).await;
    peer.server.meta.restore(&blob).unwrap();
    assert!(peer.server.meta.database_exists("metrics"));
    assert_eq!(peer.server.index(), ts.server.index());
}

#[tokio::test]
async fn auth_bootstrap_then_enforcement() {
    let ts = open_server(true).await;

    // Zero users: anonymous requests are admitted so the first admin can
    // be created.
    let (status, _) = query(&ts.router, "", "CREATE DATABASE metrics").await;
    assert_eq!(status, StatusCode::OK);
    let (status, _) = query(
        &ts.router,
        "",
        "CREATE RETENTION POLICY default ON metrics DURATION INF REPLICATION 1 DEFAULT",
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    let (status, _) = post_json(
        &ts.router,
        "/write",
        json!({"database": "metrics",
               "points": [{"name": "cpu", "timestamp": 1_700_000_000i64, "precision": "s",
                           "values": {"v": 1}}]}),
    )
    .await;
    assert_eq!(status, StatusCode::OK, "bootstrap write must be admitted");

    let (status, _) = query(&ts.router, "", "CREATE USER root WITH PASSWORD 'secret'").await;
    assert_eq!(status, StatusCode::OK);

    // Same unauthenticated request now fails.
    let (status, body) = post_json(
        &ts.router,
        "/write",
        json!({"database": "metrics",
               "points": [{"name": "cpu", "timestamp": 1_700_000_001i64, "precision": "s",
                           "values": {"v": 1}}]}),
    )
    .await;
    assert_eq!(status, StatusCode::UNAUTHORIZED);
    assert!(body["error"].as_str().is_some());

    // URL credentials work.
    let (status, _) = post_json(
        &ts.router,
        "/write?u=root&p=secret",
        json!({"database": "metrics",
               "points": [{"name": "cpu", "timestamp": 1_700_000_002i64, "precision": "s",
                           "values": {"v": 1}}]}),
    )
    .await;
    assert_eq!(status, StatusCode::OK);

    // Basic auth works too.
    use base64::{prelude::BASE64_STANDARD, Engine};
    let creds = BASE64_STANDARD.encode("root:secret");
    let (status, _, _) = send(
        &ts.router,
        Request::builder()
            .uri("/query?q=SHOW%20DATABASES")
            .header(header::AUTHORIZATION, format!("Basic {creds}"))
            .body(Body::empty())
            .unwrap(),
    )
    .await;
    assert_eq!(status, StatusCode::OK);

    // Wrong password is rejected.
    let (status, _) = get(&ts.router, "/query?q=SHOW%20DATABASES&u=root&p=wrong").await;
    assert_eq!(status, StatusCode::UNAUTHORIZED);
}

#[tokio::test]
async fn non_admin_privileges_are_enforced() {
    let ts = open_server(true).await;
    query(&ts.router, "", "CREATE DATABASE metrics").await;
    query(
        &ts.router,
        "",
        "CREATE RETENTION POLICY default ON metrics DURATION INF REPLICATION 1 DEFAULT",
    )
    .await;
    query(&ts.router, "", "CREATE USER root WITH PASSWORD 'secret'").await;
    let (status, _) = get(
        &ts.router,
        "/query?u=root&p=secret&q=CREATE%20USER%20reader%20WITH%20PASSWORD%20%27pw%27",
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    let (status, _) = get(
        &ts.router,
        "/query?u=root&p=secret&q=GRANT%20READ%20ON%20metrics%20TO%20reader",
    )
    .await;
    assert_eq!(status, StatusCode::OK);

    // The reader cannot write.
    let (status, _) = post_json(
        &ts.router,
        "/write?u=reader&p=pw",
        json!({"database": "metrics",
               "points": [{"name": "cpu", "timestamp": 1_700_000_000i64, "precision": "s",
                           "values": {"v": 1}}]}),
    )
    .await;
    assert_eq!(status, StatusCode::UNAUTHORIZED);

    // But can read.
    let (status, _) = get(&ts.router, "/query?u=reader&p=pw&db=metrics&q=SHOW%20MEASUREMENTS").await;
    assert_eq!(status, StatusCode::OK);

    // And cannot administer.
    let (status, _) = get(&ts.router, "/query?u=reader&p=pw&q=CREATE%20DATABASE%20other").await;
    assert_eq!(status, StatusCode::UNAUTHORIZED);
}

#[tokio::test]
async fn continuous_query_trigger_endpoint() {
    let ts = open_server(false).await;
    query(&ts.router, "", "CREATE DATABASE metrics").await;
    query(
        &ts.router,
        "",
        "CREATE RETENTION POLICY default ON metrics DURATION INF REPLICATION 1 DEFAULT",
    )
    .await;
    let (status, _) = query(
        &ts.router,
        "",
        "CREATE CONTINUOUS QUERY rollup ON metrics BEGIN \
         SELECT v INTO cpu_rollup FROM cpu GROUP BY time(1h) END",
    )
    .await;
    assert_eq!(status, StatusCode::OK);

    // A point in the previous hour window so the runner has a completed
    // interval to materialize.
    let now = chrono::Utc::now().timestamp_nanos_opt().unwrap();
    let hour = 3_600_000_000_000i64;
    let prev_window_ts = (now.div_euclid(hour) * hour) - hour / 2;
    let (status, _) = post_json(
        &ts.router,
        "/write",
        json!({"database": "metrics",
               "points": [{"name": "cpu", "tags": {"host": "a"},
                           "timestamp": prev_window_ts, "values": {"v": 0.5}}]}),
    )
    .await;
    assert_eq!(status, StatusCode::OK);

    let (status, _, _) = send(
        &ts.router,
        Request::builder()
            .method(Method::POST)
            .uri("/process_continuous_queries")
            .body(Body::empty())
            .unwrap(),
    )
    .await;
    assert_eq!(status, StatusCode::ACCEPTED);

    let (_, body) = query(&ts.router, "metrics", "SELECT v FROM cpu_rollup").await;
    let series = &body["results"][0]["series"][0];
    assert_eq!(series["name"], "cpu_rollup");
    assert_eq!(series["values"][0][1], 0.5);
    assert_eq!(series["tags"]["host"], "a");
}
