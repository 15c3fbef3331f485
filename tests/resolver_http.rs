use std::io::Cursor;

use image::{ImageFormat, Rgb, RgbImage};
use style_profile::{HttpImageResolver, ImageResolver, ResolveError};
use wiremock::matchers::{method, path};
use wiremock::{Mock, MockServer, ResponseTemplate};

fn png_bytes(color: [u8; 3]) -> Vec<u8> {
    let img = RgbImage::from_pixel(8, 6, Rgb(color));
    let mut buf = Cursor::new(Vec::new());
    img.write_to(&mut buf, ImageFormat::Png).unwrap();
    buf.into_inner()
}

fn html(body: String) -> ResponseTemplate {
    ResponseTemplate::new(200).set_body_raw(body.into_bytes(), "text/html; charset=utf-8")
}

#[tokio::test]
async fn resolves_direct_image_url() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/look.png"))
        .respond_with(ResponseTemplate::new(200).set_body_raw(png_bytes([1, 2, 3]), "image/png"))
        .mount(&server)
        .await;

    let resolver = HttpImageResolver::new().unwrap();
    let source = format!("{}/look.png", server.uri());
    let image = resolver.resolve(&source).await.unwrap();

    assert_eq!(image.source, source);
    assert_eq!(image.mime, "image/png");
    assert_eq!(image.pixels.dimensions(), (8, 6));
    assert_eq!(image.pixels.get_pixel(0, 0), &Rgb([1, 2, 3]));
}

#[tokio::test]
async fn follows_og_image_on_pin_pages() {
    let server = MockServer::start().await;
    let page = format!(
        r#"<!doctype html><html><head>
        <meta property="og:image" content="{}/originals/pin.png">
        </head><body>pin</body></html>"#,
        server.uri()
    );
    Mock::given(method("GET"))
        .and(path("/pin/42/"))
        .respond_with(html(page))
        .mount(&server)
        .await;
    Mock::given(method("GET"))
        .and(path("/originals/pin.png"))
        .respond_with(ResponseTemplate::new(200).set_body_raw(png_bytes([9, 9, 9]), "image/png"))
        .mount(&server)
        .await;

    let resolver = HttpImageResolver::new().unwrap();
    let source = format!("{}/pin/42/", server.uri());
    let image = resolver.resolve(&source).await.unwrap();

    // The source stays the page the caller asked for.
    assert_eq!(image.source, source);
    assert_eq!(image.pixels.get_pixel(3, 3), &Rgb([9, 9, 9]));
    assert_eq!(server.received_requests().await.unwrap().len(), 2);
}

#[tokio::test]
async fn page_without_image_is_no_image() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/pin/empty/"))
        .respond_with(html("<html><body>gone</body></html>".to_string()))
        .mount(&server)
        .await;

    let resolver = HttpImageResolver::new().unwrap();
    let err = resolver
        .resolve(&format!("{}/pin/empty/", server.uri()))
        .await
        .unwrap_err();
    assert!(matches!(err, ResolveError::NoImage(_)));
    assert_eq!(err.code(), "no_image");
}

#[tokio::test]
async fn http_errors_and_bad_payloads_are_item_failures() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/missing.jpg"))
        .respond_with(ResponseTemplate::new(404))
        .mount(&server)
        .await;
    Mock::given(method("GET"))
        .and(path("/broken.png"))
        .respond_with(
            ResponseTemplate::new(200).set_body_raw(b"not an image".to_vec(), "image/png"),
        )
        .mount(&server)
        .await;

    let resolver = HttpImageResolver::new().unwrap();

    let err = resolver
        .resolve(&format!("{}/missing.jpg", server.uri()))
        .await
        .unwrap_err();
    assert!(matches!(err, ResolveError::Status { status: 404, .. }));
    assert!(!err.is_fatal());

    let err = resolver
        .resolve(&format!("{}/broken.png", server.uri()))
        .await
        .unwrap_err();
    assert!(matches!(err, ResolveError::Decode(_)));
    assert!(!err.is_fatal());

    let err = resolver.resolve("ftp://example.com/a.png").await.unwrap_err();
    assert!(matches!(err, ResolveError::InvalidSource(_)));
    let err = resolver.resolve("not a url").await.unwrap_err();
    assert_eq!(err.code(), "invalid_source");
}

#[tokio::test]
async fn board_sources_lists_pin_images_once_each() {
    let server = MockServer::start().await;
    let page = r#"<html><body>
        <img src="https://i.pinimg.com/236x/aa/one.jpg" srcset="x 1x">
        <img src="https://i.pinimg.com/236x/bb/two.jpg">
        <img src="https://i.pinimg.com/236x/aa/one.jpg">
        <img src="https://cdn.example.com/logo.png">
        </body></html>"#;
    Mock::given(method("GET"))
        .and(path("/someone/board/"))
        .respond_with(html(page.to_string()))
        .mount(&server)
        .await;
    Mock::given(method("GET"))
        .and(path("/someone/empty/"))
        .respond_with(html("<html></html>".to_string()))
        .mount(&server)
        .await;

    let resolver = HttpImageResolver::new().unwrap();
    let urls = resolver
        .board_sources(&format!("{}/someone/board/", server.uri()))
        .await
        .unwrap();
    assert_eq!(
        urls,
        [
            "https://i.pinimg.com/236x/aa/one.jpg",
            "https://i.pinimg.com/236x/bb/two.jpg",
        ]
    );

    let err = resolver
        .board_sources(&format!("{}/someone/empty/", server.uri()))
        .await
        .unwrap_err();
    assert!(matches!(err, ResolveError::NoImage(_)));
}
