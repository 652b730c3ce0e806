//! End-to-end tests for image requests against a directory origin

use assetgate::{AssetServer, GateConfig};
use bytes::Bytes;
use http::{Request, Response, StatusCode};
use http_body_util::{BodyExt, Full};
use image::{DynamicImage, GenericImageView, ImageFormat, RgbImage};
use std::io::Cursor;
use std::path::Path;
use tempfile::TempDir;

struct Fixture {
    server: AssetServer,
    _dirs: TempDir,
}

fn write_jpeg(path: &Path, width: u32, height: u32) {
    let img = RgbImage::from_fn(width, height, |x, y| {
        image::Rgb([(x % 256) as u8, (y % 256) as u8, 128])
    });
    let mut buf = Cursor::new(Vec::new());
    DynamicImage::ImageRgb8(img)
        .write_to(&mut buf, ImageFormat::Jpeg)
        .unwrap();
    std::fs::write(path, buf.into_inner()).unwrap();
}

fn write_png(path: &Path, width: u32, height: u32) {
    let img = RgbImage::from_pixel(width, height, image::Rgb([200, 10, 10]));
    let mut buf = Cursor::new(Vec::new());
    DynamicImage::ImageRgb8(img)
        .write_to(&mut buf, ImageFormat::Png)
        .unwrap();
    std::fs::write(path, buf.into_inner()).unwrap();
}

async fn fixture_with(configure: impl FnOnce(&mut GateConfig, &Path)) -> Fixture {
    let dirs = TempDir::new().unwrap();
    let root = dirs.path();
    std::fs::create_dir_all(root.join("images")).unwrap();
    write_jpeg(&root.join("images/test.jpg"), 1024, 768);

    let mut config = GateConfig::default();
    config.images.directory.enabled = true;
    config.images.directory.path = root.join("images").to_string_lossy().into_owned();
    config.caching.directory.enabled = true;
    config.caching.directory.path = root.join("cache").to_string_lossy().into_owned();
    config.paths.recipes = root.join("recipes").to_string_lossy().into_owned();
    config.paths.routes = root.join("routes").to_string_lossy().into_owned();
    config.transform.workers = 2;
    configure(&mut config, root);

    let server = AssetServer::from_config(config).await.unwrap();
    Fixture {
        server,
        _dirs: dirs,
    }
}

async fn fixture() -> Fixture {
    fixture_with(|_, _| {}).await
}

fn request(method: &str, uri: &str) -> Request<Bytes> {
    Request::builder()
        .method(method)
        .uri(uri)
        .header("host", "localhost")
        .body(Bytes::new())
        .unwrap()
}

async fn body_of(response: Response<Full<Bytes>>) -> Bytes {
    response.into_body().collect().await.unwrap().to_bytes()
}

fn header<'a>(response: &'a Response<Full<Bytes>>, name: &str) -> &'a str {
    response
        .headers()
        .get(name)
        .and_then(|v| v.to_str().ok())
        .unwrap_or_default()
}

const LEGACY_PATH: &str = "/jpg/50/0/0/801/478/0/0/0/2/aspectfit/North/0/0/0/0/0/test.jpg";

#[tokio::test]
async fn test_legacy_request_miss_then_hit() {
    let fx = fixture().await;

    let first = fx.server.handle(request("GET", LEGACY_PATH), None).await;
    assert_eq!(first.status(), StatusCode::OK);
    assert_eq!(header(&first, "content-type"), "image/jpeg");
    assert_eq!(header(&first, "x-cache"), "MISS");
    assert!(!header(&first, "last-modified").is_empty());
    let first_body = body_of(first).await;

    let decoded = image::load_from_memory(&first_body).unwrap();
    // 801x478 at device pixel ratio 2, aspect fit of a 4:3 origin
    assert_eq!(decoded.height(), 956);
    assert!(decoded.width() <= 1602);

    let second = fx.server.handle(request("GET", LEGACY_PATH), None).await;
    assert_eq!(second.status(), StatusCode::OK);
    assert_eq!(header(&second, "x-cache"), "HIT");
    assert_eq!(header(&second, "content-type"), "image/jpeg");
    assert_eq!(body_of(second).await, first_body);
}

#[tokio::test]
async fn test_query_request_converts_format() {
    let fx = fixture().await;

    let response = fx
        .server
        .handle(request("GET", "/test.jpg?width=200&format=png"), None)
        .await;
    assert_eq!(response.status(), StatusCode::OK);
    assert_eq!(header(&response, "content-type"), "image/png");

    let decoded = image::load_from_memory(&body_of(response).await).unwrap();
    assert_eq!(decoded.dimensions(), (200, 150));
}

#[tokio::test]
async fn test_head_has_headers_without_body() {
    let fx = fixture().await;

    let response = fx
        .server
        .handle(request("HEAD", "/test.jpg?width=100"), None)
        .await;
    assert_eq!(response.status(), StatusCode::OK);
    assert_eq!(header(&response, "content-type"), "image/jpeg");
    assert_ne!(header(&response, "content-length"), "0");
    assert!(body_of(response).await.is_empty());
}

#[tokio::test]
async fn test_json_metadata() {
    let fx = fixture().await;

    let response = fx
        .server
        .handle(request("GET", "/test.jpg?width=512&format=json"), None)
        .await;
    assert_eq!(response.status(), StatusCode::OK);
    assert_eq!(header(&response, "content-type"), "application/json");

    let value: serde_json::Value = serde_json::from_slice(&body_of(response).await).unwrap();
    assert_eq!(value["originalWidth"], 1024);
    assert_eq!(value["originalHeight"], 768);
    assert_eq!(value["width"], 512);
    assert_eq!(value["height"], 384);
    assert!(value["primaryColor"].is_string());
}

#[tokio::test]
async fn test_missing_asset_is_json_404() {
    let fx = fixture().await;

    let response = fx.server.handle(request("GET", "/nothere.jpg"), None).await;
    assert_eq!(response.status(), StatusCode::NOT_FOUND);
    assert_eq!(header(&response, "content-type"), "application/json");

    let value: serde_json::Value = serde_json::from_slice(&body_of(response).await).unwrap();
    assert_eq!(value["statusCode"], 404);
    assert!(value["message"].is_string());
}

#[tokio::test]
async fn test_fallback_image_served_with_not_found_status() {
    let fx = fixture_with(|config, root| {
        let fallback = root.join("missing.png");
        write_png(&fallback, 40, 40);
        config.not_found.images.path = Some(fallback.to_string_lossy().into_owned());
        config.not_found.status_code = 410;
    })
    .await;

    let response = fx
        .server
        .handle(request("GET", "/nothere.png?width=20"), None)
        .await;
    assert_eq!(response.status(), StatusCode::GONE);
    assert_eq!(header(&response, "content-type"), "image/png");

    let decoded = image::load_from_memory(&body_of(response).await).unwrap();
    assert_eq!(decoded.dimensions(), (20, 20));

    // Not-found results are not cached unless cache_404 is set
    let again = fx
        .server
        .handle(request("GET", "/nothere.png?width=20"), None)
        .await;
    assert_eq!(header(&again, "x-cache"), "MISS");
}

#[tokio::test]
async fn test_cache_404_keeps_missing_asset_without_fallback() {
    let fx = fixture_with(|config, _| config.caching.cache_404 = true).await;

    let first = fx.server.handle(request("GET", "/later.jpg?width=32"), None).await;
    assert_eq!(first.status(), StatusCode::NOT_FOUND);
    assert_eq!(header(&first, "x-cache"), "MISS");
    assert_eq!(header(&first, "content-type"), "application/json");
    let value: serde_json::Value = serde_json::from_slice(&body_of(first).await).unwrap();
    assert_eq!(value["statusCode"], 404);

    // The cached miss is served even after the asset appears at the origin
    let images = fx._dirs.path().join("images");
    write_jpeg(&images.join("later.jpg"), 64, 64);

    let second = fx.server.handle(request("GET", "/later.jpg?width=32"), None).await;
    assert_eq!(second.status(), StatusCode::NOT_FOUND);
    assert_eq!(header(&second, "x-cache"), "HIT");
    assert_eq!(header(&second, "content-type"), "application/json");
    let value: serde_json::Value = serde_json::from_slice(&body_of(second).await).unwrap();
    assert_eq!(value["statusCode"], 404);
}

#[tokio::test]
async fn test_crop_outside_image_is_bad_request() {
    let fx = fixture().await;

    let response = fx
        .server
        .handle(request("GET", "/test.jpg?cropX=600&cropY=10&width=600&height=100"), None)
        .await;
    assert_eq!(response.status(), StatusCode::BAD_REQUEST);

    let value: serde_json::Value = serde_json::from_slice(&body_of(response).await).unwrap();
    assert_eq!(value["statusCode"], 400);
}

#[tokio::test]
async fn test_unsupported_method() {
    let fx = fixture().await;

    let response = fx.server.handle(request("PUT", "/test.jpg"), None).await;
    assert_eq!(response.status(), StatusCode::BAD_REQUEST);
}

#[tokio::test]
async fn test_metrics_endpoint_reports_requests() {
    let fx = fixture().await;
    fx.server.handle(request("GET", "/test.jpg?width=64"), None).await;
    fx.server.handle(request("GET", "/nothere.jpg"), None).await;

    let response = fx.server.handle(request("GET", "/metrics"), None).await;
    assert_eq!(response.status(), StatusCode::OK);

    let text = String::from_utf8(body_of(response).await.to_vec()).unwrap();
    assert!(text.contains("assetgate_requests_total{kind=\"image\"} 2"));
    assert!(text.contains("assetgate_errors_total{status=\"404\"} 1"));
}

#[tokio::test]
async fn test_multi_domain_rejects_unknown_host() {
    let fx = fixture_with(|config, _| {
        config.multi_domain.enabled = true;
        config
            .multi_domain
            .domains
            .insert("cdn.example.com".to_string(), Default::default());
    })
    .await;

    let response = fx.server.handle(request("GET", "/test.jpg"), None).await;
    assert_eq!(response.status(), StatusCode::NOT_FOUND);

    let req = Request::builder()
        .uri("/test.jpg?width=32")
        .header("host", "cdn.example.com:8001")
        .body(Bytes::new())
        .unwrap();
    let response = fx.server.handle(req, None).await;
    assert_eq!(response.status(), StatusCode::OK);
}
