//! Twinzo client against an in-process HTTP server

use std::sync::{Arc, Mutex};
use std::time::Duration;

use amrlink_core::{
    AffineCoefficients, AuthError, CacheConfig, Clock, CredentialCache, DeviceCredential,
    DispatchError, Forwarder, ForwarderConfig, IdentityProvider, LocalizationRecord,
    LocalizationSink, MotionConfig, Outcome, SourceAdapter, SystemClock,
};
use amrlink_twinzo::{TwinzoClient, TwinzoConfig};
use axum::extract::State;
use axum::http::{HeaderMap, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::routing::post;
use axum::{Json, Router};
use serde_json::{json, Value};

#[derive(Default)]
struct FakeTwinzo {
    auth_status: Mutex<Option<u16>>,
    auth_malformed: Mutex<bool>,
    /// Answer auth with this status but a well-formed token body
    auth_success_status: Mutex<Option<u16>>,
    localization_status: Mutex<Option<u16>>,
    auth_bodies: Mutex<Vec<Value>>,
    posts: Mutex<Vec<(HeaderMap, Value)>>,
}

impl FakeTwinzo {
    fn auth_calls(&self) -> usize {
        self.auth_bodies.lock().unwrap().len()
    }

    fn posts(&self) -> Vec<(HeaderMap, Value)> {
        self.posts.lock().unwrap().clone()
    }
}

async fn authenticate(State(fake): State<Arc<FakeTwinzo>>, Json(body): Json<Value>) -> Response {
    let login = body["login"].as_str().unwrap_or_default().to_string();
    fake.auth_bodies.lock().unwrap().push(body);

    if let Some(status) = *fake.auth_status.lock().unwrap() {
        return (StatusCode::from_u16(status).unwrap(), "denied").into_response();
    }
    if *fake.auth_malformed.lock().unwrap() {
        return (StatusCode::OK, "<html>maintenance</html>").into_response();
    }
    let status = fake.auth_success_status.lock().unwrap().unwrap_or(200);
    let body = Json(json!({
        "Token": format!("tok-{}", login),
        "Client": "client-guid",
        "Branch": "branch-guid",
        "Expiration": SystemClock.now_millis() + 3_600_000,
    }));
    (StatusCode::from_u16(status).unwrap(), body).into_response()
}

async fn localization(
    State(fake): State<Arc<FakeTwinzo>>,
    headers: HeaderMap,
    Json(body): Json<Value>,
) -> Response {
    fake.posts.lock().unwrap().push((headers, body));
    let status = fake.localization_status.lock().unwrap().unwrap_or(200);
    (StatusCode::from_u16(status).unwrap(), "server says no").into_response()
}

async fn spawn_server() -> (Arc<FakeTwinzo>, String) {
    let fake = Arc::new(FakeTwinzo::default());
    let app = Router::new()
        .route("/v3/authorization/authenticate", post(authenticate))
        .route("/v3/localization", post(localization))
        .with_state(fake.clone());

    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        axum::serve(listener, app).await.unwrap();
    });

    (fake, format!("http://{}", addr))
}

fn client(base_url: &str) -> TwinzoClient {
    TwinzoClient::new(TwinzoConfig {
        tenant: "plant-4".to_string(),
        password: "shared-secret".to_string(),
        api_key: "api-key-1".to_string(),
        timeout: Duration::from_secs(5),
        ..TwinzoConfig::with_base_url(base_url)
    })
    .unwrap()
}

fn record(sector_id: i64) -> LocalizationRecord {
    LocalizationRecord {
        timestamp: 1_700_000_000_000,
        sector_id,
        x: 120.0,
        y: 140.0,
        z: 0.0,
        interval: 100,
        battery: 80,
        is_moving: true,
        localization_areas: Vec::new(),
        no_go_areas: Vec::new(),
    }
}

fn credential() -> DeviceCredential {
    DeviceCredential {
        device_login: "tugger-01".to_string(),
        access_token: "tok-tugger-01".to_string(),
        tenant_id: "client-guid".to_string(),
        partition_id: "branch-guid".to_string(),
        expires_at: i64::MAX,
    }
}

#[tokio::test]
async fn test_authenticate_success() {
    let (fake, url) = spawn_server().await;

    let cred = client(&url).authenticate("tugger-01").await.unwrap();

    assert_eq!(cred.device_login, "tugger-01");
    assert_eq!(cred.access_token, "tok-tugger-01");
    assert_eq!(cred.tenant_id, "client-guid");
    assert_eq!(cred.partition_id, "branch-guid");
    assert!(cred.expires_at > SystemClock.now_millis());

    let bodies = fake.auth_bodies.lock().unwrap().clone();
    assert_eq!(
        bodies,
        vec![json!({"client": "plant-4", "login": "tugger-01", "password": "shared-secret"})]
    );
}

#[tokio::test]
async fn test_authenticate_rejected() {
    let (fake, url) = spawn_server().await;
    *fake.auth_status.lock().unwrap() = Some(401);

    let err = client(&url).authenticate("tugger-01").await.unwrap_err();
    assert_eq!(
        err,
        AuthError::Rejected {
            login: "tugger-01".to_string(),
            status: 401
        }
    );
}

#[tokio::test]
async fn test_authenticate_requires_exactly_200() {
    let (fake, url) = spawn_server().await;
    *fake.auth_success_status.lock().unwrap() = Some(201);

    let twinzo = Arc::new(client(&url));
    let err = twinzo.authenticate("tugger-01").await.unwrap_err();
    assert_eq!(
        err,
        AuthError::Rejected {
            login: "tugger-01".to_string(),
            status: 201
        }
    );

    let cache = CredentialCache::new(twinzo, Arc::new(SystemClock), CacheConfig::default());
    assert!(cache.get_credential("tugger-01").await.is_err());
    assert!(!cache.contains("tugger-01").await);
    assert_eq!(fake.auth_calls(), 2);
}

#[tokio::test]
async fn test_authenticate_malformed_body() {
    let (fake, url) = spawn_server().await;
    *fake.auth_malformed.lock().unwrap() = true;

    let err = client(&url).authenticate("tugger-01").await.unwrap_err();
    assert!(matches!(err, AuthError::Malformed(_)));
}

#[tokio::test]
async fn test_post_localization_headers_and_body() {
    let (fake, url) = spawn_server().await;

    let status = client(&url)
        .post_localization(&credential(), &[record(3)])
        .await
        .unwrap();
    assert_eq!(status, 200);

    let posts = fake.posts();
    assert_eq!(posts.len(), 1);
    let (headers, body) = &posts[0];
    assert_eq!(headers["client"], "client-guid");
    assert_eq!(headers["branch"], "branch-guid");
    assert_eq!(headers["token"], "tok-tugger-01");
    assert_eq!(headers["api-key"], "api-key-1");
    assert_eq!(headers["accept"], "application/json");
    assert_eq!(headers["content-type"], "application/json");

    assert_eq!(
        body,
        &json!([{
            "Timestamp": 1_700_000_000_000i64,
            "SectorId": 3,
            "X": 120.0,
            "Y": 140.0,
            "Z": 0.0,
            "Interval": 100,
            "Battery": 80,
            "IsMoving": true,
            "LocalizationAreas": [],
            "NoGoAreas": []
        }])
    );
}

#[tokio::test]
async fn test_post_localization_server_error() {
    let (fake, url) = spawn_server().await;
    *fake.localization_status.lock().unwrap() = Some(500);

    let err = client(&url)
        .post_localization(&credential(), &[record(1)])
        .await
        .unwrap_err();
    assert_eq!(
        err,
        DispatchError::Rejected {
            status: 500,
            body: "server says no".to_string()
        }
    );
}

#[tokio::test]
async fn test_connection_refused_is_transport_error() {
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let url = format!("http://{}", listener.local_addr().unwrap());
    drop(listener);

    let client = client(&url);
    assert!(matches!(
        client.authenticate("tugger-01").await,
        Err(AuthError::Transport(_))
    ));
    assert!(matches!(
        client.post_localization(&credential(), &[record(1)]).await,
        Err(DispatchError::Transport(_))
    ));
}

#[tokio::test]
async fn test_forwarder_end_to_end_over_http() {
    let (fake, url) = spawn_server().await;
    let twinzo = Arc::new(client(&url));
    let clock: Arc<dyn Clock> = Arc::new(SystemClock);
    let cache = Arc::new(CredentialCache::new(
        twinzo.clone(),
        clock.clone(),
        CacheConfig::default(),
    ));
    let forwarder = Forwarder::new(
        SourceAdapter::object_pose(),
        AffineCoefficients::new(2.0, 0.0, 0.0, 2.0, 100.0, 100.0),
        cache,
        twinzo,
        MotionConfig::default(),
        clock,
        ForwarderConfig::default(),
    );

    let payload =
        br#"{"device_id":"tugger-01","pose":{"x":10,"y":20,"z":0,"theta":0},"battery":80}"#;
    assert!(forwarder.handle_message(payload, "amr/tugger-01").await.is_dispatched());
    assert!(forwarder.handle_message(payload, "amr/tugger-01").await.is_dispatched());

    assert_eq!(fake.auth_calls(), 1);
    let posts = fake.posts();
    assert_eq!(posts.len(), 2);
    assert_eq!(posts[0].1[0]["X"], 120.0);
    assert_eq!(posts[0].1[0]["Y"], 140.0);
    assert_eq!(posts[0].1[0]["Battery"], 80);
    assert_eq!(posts[0].0["token"], "tok-tugger-01");

    // A failing endpoint drops the message without stopping the pipeline
    *fake.localization_status.lock().unwrap() = Some(500);
    let outcome = forwarder.handle_message(payload, "amr/tugger-01").await;
    assert!(matches!(outcome, Outcome::Dropped(_)));

    *fake.localization_status.lock().unwrap() = None;
    assert!(forwarder.handle_message(payload, "amr/tugger-01").await.is_dispatched());
}
