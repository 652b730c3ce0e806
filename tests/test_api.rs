//! Integration tests for the admin API

use assetgate::{ApiResponse, AssetServer, GateConfig};
use bytes::Bytes;
use http::{Request, Response, StatusCode};
use http_body_util::{BodyExt, Full};
use image::{DynamicImage, GenericImageView, ImageFormat, RgbImage};
use std::io::Cursor;
use tempfile::TempDir;

struct Fixture {
    server: AssetServer,
    dirs: TempDir,
}

async fn fixture_with(configure: impl FnOnce(&mut GateConfig)) -> Fixture {
    let dirs = TempDir::new().unwrap();
    let root = dirs.path();
    std::fs::create_dir_all(root.join("images/photos")).unwrap();

    let img = RgbImage::from_pixel(300, 200, image::Rgb([20, 120, 220]));
    let mut buf = Cursor::new(Vec::new());
    DynamicImage::ImageRgb8(img)
        .write_to(&mut buf, ImageFormat::Jpeg)
        .unwrap();
    std::fs::write(root.join("images/photos/lake.jpg"), buf.into_inner()).unwrap();

    let mut config = GateConfig::default();
    config.images.directory.enabled = true;
    config.images.directory.path = root.join("images").to_string_lossy().into_owned();
    config.caching.memory.enabled = true;
    config.paths.recipes = root.join("recipes").to_string_lossy().into_owned();
    config.paths.routes = root.join("routes").to_string_lossy().into_owned();
    config.transform.workers = 1;
    configure(&mut config);

    Fixture {
        server: AssetServer::from_config(config).await.unwrap(),
        dirs,
    }
}

fn get(uri: &str) -> Request<Bytes> {
    Request::builder()
        .uri(uri)
        .header("host", "localhost")
        .body(Bytes::new())
        .unwrap()
}

fn api(method: &str, uri: &str, body: serde_json::Value) -> Request<Bytes> {
    Request::builder()
        .method(method)
        .uri(uri)
        .header("host", "localhost")
        .header("content-type", "application/json")
        .body(Bytes::from(body.to_string()))
        .unwrap()
}

async fn body_of(response: Response<Full<Bytes>>) -> Bytes {
    response.into_body().collect().await.unwrap().to_bytes()
}

async fn envelope(response: Response<Full<Bytes>>) -> ApiResponse {
    serde_json::from_slice(&body_of(response).await).unwrap()
}

fn x_cache(response: &Response<Full<Bytes>>) -> &str {
    response.headers()["x-cache"].to_str().unwrap()
}

#[tokio::test]
async fn test_invalidate_all_forces_miss() {
    let fx = fixture_with(|_| {}).await;
    let uri = "/photos/lake.jpg?width=150";

    let first = fx.server.handle(get(uri), None).await;
    assert_eq!(x_cache(&first), "MISS");
    let second = fx.server.handle(get(uri), None).await;
    assert_eq!(x_cache(&second), "HIT");

    let response = fx
        .server
        .handle(api("POST", "/api", serde_json::json!({ "invalidate": "*" })), None)
        .await;
    assert_eq!(response.status(), StatusCode::OK);
    assert!(envelope(response).await.success);

    let third = fx.server.handle(get(uri), None).await;
    assert_eq!(x_cache(&third), "MISS");
}

fn on_host(mut req: Request<Bytes>, host: &'static str) -> Request<Bytes> {
    req.headers_mut()
        .insert("host", http::HeaderValue::from_static(host));
    req
}

#[tokio::test]
async fn test_invalidate_all_only_flushes_calling_domain() {
    let fx = fixture_with(|config| {
        config.multi_domain.enabled = true;
        for domain in ["one.example", "two.example"] {
            config
                .multi_domain
                .domains
                .insert(domain.to_string(), Default::default());
        }
    })
    .await;
    let uri = "/photos/lake.jpg?width=120";

    for host in ["one.example", "two.example"] {
        let first = fx.server.handle(on_host(get(uri), host), None).await;
        assert_eq!(first.status(), StatusCode::OK);
        assert_eq!(x_cache(&first), "MISS");
    }

    let flush = on_host(api("POST", "/api", serde_json::json!({ "invalidate": "*" })), "one.example");
    let response = fx.server.handle(flush, None).await;
    assert_eq!(response.status(), StatusCode::OK);
    assert!(envelope(response).await.success);

    let one = fx.server.handle(on_host(get(uri), "one.example"), None).await;
    assert_eq!(x_cache(&one), "MISS");
    let two = fx.server.handle(on_host(get(uri), "two.example"), None).await;
    assert_eq!(x_cache(&two), "HIT");
}

#[tokio::test]
async fn test_invalidate_pattern_only_drops_matches() {
    let fx = fixture_with(|_| {}).await;
    std::fs::copy(
        fx.dirs.path().join("images/photos/lake.jpg"),
        fx.dirs.path().join("images/river.jpg"),
    )
    .unwrap();

    fx.server.handle(get("/photos/lake.jpg?width=100"), None).await;
    fx.server.handle(get("/river.jpg?width=100"), None).await;

    let response = fx
        .server
        .handle(
            api("POST", "/api", serde_json::json!({ "invalidate": "photos/*" })),
            None,
        )
        .await;
    assert_eq!(response.status(), StatusCode::OK);

    let lake = fx.server.handle(get("/photos/lake.jpg?width=100"), None).await;
    assert_eq!(x_cache(&lake), "MISS");
    let river = fx.server.handle(get("/river.jpg?width=100"), None).await;
    assert_eq!(x_cache(&river), "HIT");
}

#[tokio::test]
async fn test_invalidate_requires_pattern() {
    let fx = fixture_with(|_| {}).await;

    let response = fx
        .server
        .handle(api("POST", "/api", serde_json::json!({ "other": 1 })), None)
        .await;
    assert_eq!(response.status(), StatusCode::BAD_REQUEST);
    let body = envelope(response).await;
    assert!(!body.success);
    assert!(body.errors.is_some());
}

#[tokio::test]
async fn test_created_recipe_is_used() {
    let fx = fixture_with(|_| {}).await;

    let response = fx
        .server
        .handle(
            api(
                "POST",
                "/api/recipes",
                serde_json::json!({
                    "recipe": "small-thumb",
                    "settings": { "format": "png", "width": 60, "height": 60, "resizeStyle": "aspectfill" }
                }),
            ),
            None,
        )
        .await;
    assert_eq!(response.status(), StatusCode::CREATED);
    assert!(envelope(response).await.success);

    let response = fx
        .server
        .handle(get("/small-thumb/photos/lake.jpg"), None)
        .await;
    assert_eq!(response.status(), StatusCode::OK);
    assert_eq!(response.headers()["content-type"], "image/png");
    let decoded = image::load_from_memory(&body_of(response).await).unwrap();
    assert_eq!(decoded.dimensions(), (60, 60));

    // Creating it twice is rejected
    let response = fx
        .server
        .handle(
            api(
                "POST",
                "/api/recipes",
                serde_json::json!({ "recipe": "small-thumb", "settings": { "width": 10 } }),
            ),
            None,
        )
        .await;
    assert_eq!(response.status(), StatusCode::BAD_REQUEST);

    let response = fx
        .server
        .handle(api("DELETE", "/api/recipes/small-thumb", serde_json::json!({})), None)
        .await;
    assert_eq!(response.status(), StatusCode::OK);

    let response = fx
        .server
        .handle(api("DELETE", "/api/recipes/small-thumb", serde_json::json!({})), None)
        .await;
    assert_eq!(response.status(), StatusCode::NOT_FOUND);
}

#[tokio::test]
async fn test_invalid_recipe_reports_errors() {
    let fx = fixture_with(|_| {}).await;

    let response = fx
        .server
        .handle(
            api("POST", "/api/recipes", serde_json::json!({ "recipe": "abc" })),
            None,
        )
        .await;
    assert_eq!(response.status(), StatusCode::BAD_REQUEST);
    let errors = envelope(response).await.errors.unwrap();
    assert_eq!(errors.len(), 2);
}

#[tokio::test]
async fn test_route_created_through_api() {
    let fx = fixture_with(|_| {}).await;

    for (name, width) in [("wide-image", 200), ("narrow-image", 50)] {
        let response = fx
            .server
            .handle(
                api(
                    "POST",
                    "/api/recipes",
                    serde_json::json!({ "recipe": name, "settings": { "width": width } }),
                ),
                None,
            )
            .await;
        assert_eq!(response.status(), StatusCode::CREATED);
    }

    let response = fx
        .server
        .handle(
            api(
                "POST",
                "/api/routes",
                serde_json::json!({
                    "route": "by-device",
                    "branches": [
                        { "condition": { "device": "mobile" }, "recipe": "narrow-image" },
                        { "recipe": "wide-image" }
                    ]
                }),
            ),
            None,
        )
        .await;
    assert_eq!(response.status(), StatusCode::CREATED);

    let mobile = Request::builder()
        .uri("/by-device/photos/lake.jpg")
        .header("host", "localhost")
        .header(
            "user-agent",
            "Mozilla/5.0 (iPhone; CPU iPhone OS 17_0 like Mac OS X) Mobile/15E148",
        )
        .body(Bytes::new())
        .unwrap();
    let response = fx.server.handle(mobile, None).await;
    let decoded = image::load_from_memory(&body_of(response).await).unwrap();
    assert_eq!(decoded.width(), 50);

    let desktop = fx.server.handle(get("/by-device/photos/lake.jpg"), None).await;
    let decoded = image::load_from_memory(&body_of(desktop).await).unwrap();
    assert_eq!(decoded.width(), 200);
}

#[tokio::test]
async fn test_bearer_token_required() {
    let fx = fixture_with(|config| config.api.auth_token = Some("s3cret".to_string())).await;

    let response = fx
        .server
        .handle(api("POST", "/api", serde_json::json!({ "invalidate": "*" })), None)
        .await;
    assert_eq!(response.status(), StatusCode::UNAUTHORIZED);
    let value: serde_json::Value = serde_json::from_slice(&body_of(response).await).unwrap();
    assert_eq!(value["statusCode"], 401);

    let mut req = api("POST", "/api", serde_json::json!({ "invalidate": "*" }));
    req.headers_mut()
        .insert("authorization", "Bearer s3cret".parse().unwrap());
    let response = fx.server.handle(req, None).await;
    assert_eq!(response.status(), StatusCode::OK);
}

#[tokio::test]
async fn test_disabled_api_and_unknown_method() {
    let fx = fixture_with(|_| {}).await;
    let response = fx
        .server
        .handle(api("PUT", "/api/recipes", serde_json::json!({})), None)
        .await;
    assert_eq!(response.status(), StatusCode::METHOD_NOT_ALLOWED);

    let fx = fixture_with(|config| config.api.enabled = false).await;
    let response = fx
        .server
        .handle(api("POST", "/api", serde_json::json!({ "invalidate": "*" })), None)
        .await;
    assert_eq!(response.status(), StatusCode::NOT_FOUND);
}
