use std::io::Cursor;
use std::process::Command;

use image::{ImageFormat, Rgb, RgbImage};
use style_profile::{ColorObservation, ProfileReport};
use tempfile::tempdir;
use wiremock::matchers::{method, path};
use wiremock::{Mock, MockServer, ResponseTemplate};

fn two_tone() -> RgbImage {
    RgbImage::from_fn(40, 20, |x, _| {
        if x < 30 {
            Rgb([250, 250, 245])
        } else {
            Rgb([20, 30, 120])
        }
    })
}

fn png(img: &RgbImage) -> Vec<u8> {
    let mut buf = Cursor::new(Vec::new());
    img.write_to(&mut buf, ImageFormat::Png).unwrap();
    buf.into_inner()
}

fn cli() -> Command {
    let mut cmd = Command::new(env!("CARGO_BIN_EXE_style-profile"));
    cmd.env_remove("OPENROUTER_API_KEY")
        .env_remove("STYLE_PROFILE_MODEL")
        .env("RUST_LOG", "warn");
    cmd
}

#[test]
fn cli_palette_smoke_and_determinism() {
    let dir = tempdir().unwrap();
    let image_path = dir.path().join("look.png");
    two_tone().save(&image_path).unwrap();

    let run = || {
        let output = cli()
            .args(["palette", "--n-colors", "4", "--image"])
            .arg(&image_path)
            .output()
            .unwrap();
        assert!(
            output.status.success(),
            "{}",
            String::from_utf8_lossy(&output.stderr)
        );
        serde_json::from_slice::<Vec<ColorObservation>>(&output.stdout).unwrap()
    };

    let colors = run();
    assert_eq!(colors.len(), 2);
    assert_eq!(colors[0].hex, "#fafaf5");
    assert!(colors[0].weight > 70.0 && colors[0].weight < 80.0);
    assert_eq!(colors[1].hex, "#141e78");
    assert_eq!(colors, run());
}

#[test]
fn cli_analyze_without_sources_fails() {
    let output = cli().args(["analyze", "--no-annotate"]).output().unwrap();
    assert!(!output.status.success());
    let stderr = String::from_utf8_lossy(&output.stderr);
    assert!(stderr.contains("--source"), "stderr: {stderr}");
}

#[test]
fn cli_analyze_without_api_key_suggests_colors_only() {
    let output = cli()
        .args(["analyze", "--source", "https://img.test/a.png"])
        .output()
        .unwrap();
    assert!(!output.status.success());
    let stderr = String::from_utf8_lossy(&output.stderr);
    assert!(stderr.contains("--no-annotate"), "stderr: {stderr}");
}

#[tokio::test]
async fn cli_analyze_colors_only_writes_report_and_trace() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/look.png"))
        .respond_with(ResponseTemplate::new(200).set_body_raw(png(&two_tone()), "image/png"))
        .mount(&server)
        .await;
    Mock::given(method("GET"))
        .and(path("/gone.png"))
        .respond_with(ResponseTemplate::new(404))
        .mount(&server)
        .await;

    let dir = tempdir().unwrap();
    let sources_path = dir.path().join("sources.txt");
    std::fs::write(
        &sources_path,
        format!(
            "# weekend looks\n{0}/look.png\n\n{0}/gone.png\n",
            server.uri()
        ),
    )
    .unwrap();
    let out_path = dir.path().join("report.json");
    let trace_path = dir.path().join("trace.jsonl");
    let md_path = dir.path().join("report.md");

    let (json_status, md_status) = {
        let (sources, out, trace, md) = (
            sources_path.clone(),
            out_path.clone(),
            trace_path.clone(),
            md_path.clone(),
        );
        tokio::task::spawn_blocking(move || {
            let json = cli()
                .args(["analyze", "--no-annotate", "--sources-file"])
                .arg(&sources)
                .arg("--out")
                .arg(&out)
                .arg("--trace")
                .arg(&trace)
                .status()
                .unwrap();
            let md = cli()
                .args(["analyze", "--no-annotate", "--format", "md", "--sources-file"])
                .arg(&sources)
                .arg("--out")
                .arg(&md)
                .status()
                .unwrap();
            (json, md)
        })
        .await
        .unwrap()
    };
    assert!(json_status.success());
    assert!(md_status.success());

    let report: ProfileReport =
        serde_json::from_str(&std::fs::read_to_string(&out_path).unwrap()).unwrap();
    assert_eq!(report.summary.items_attempted, 2);
    assert_eq!(report.summary.items_succeeded, 1);
    assert_eq!(report.summary.colors.values().next(), Some("#fafaf5"));
    assert!(report.summary.fields.iter().all(|v| v.is_empty()));
    assert_eq!(report.failures.len(), 1);
    assert_eq!(report.failures[0].code, "http_status");

    let trace = std::fs::read_to_string(&trace_path).unwrap();
    assert_eq!(trace.lines().count(), 2);

    let md = std::fs::read_to_string(&md_path).unwrap();
    assert!(md.starts_with("# Style Profile"));
    assert!(md.contains("## Failures"));
}
