mod support;

use anyhow::Result;
use base64::Engine;
use base64::engine::general_purpose::STANDARD;

use support::*;
use webshare::settings::Mode;

fn hundred_bytes() -> Vec<u8> {
    (0u8..100).collect()
}

async fn share_with(files: Vec<(&str, Vec<u8>)>) -> Result<ServerHarness> {
    let mut builder = ServerHarnessBuilder::new()?
        .with_settings(|settings| settings.mode = Mode::Share);
    for (path, contents) in files {
        builder = builder.with_file(path, contents);
    }
    builder.spawn().await
}

fn with_range(target: &str, range: &str) -> String {
    format!("GET {target} HTTP/1.1\r\nHost: localhost\r\nRange: {range}\r\n\r\n")
}

#[tokio::test]
async fn closed_range_returns_exact_window() -> Result<()> {
    let data = hundred_bytes();
    let harness = share_with(vec![("blob.bin", data.clone())]).await?;

    let response = harness.request(&with_range("/blob.bin", "bytes=10-19")).await?;
    assert_eq!(response.status, 206);
    assert_eq!(response.header("content-range"), Some("bytes 10-19/100"));
    assert_eq!(response.header("content-length"), Some("10"));
    assert_eq!(response.body, &data[10..20]);

    harness.shutdown().await;
    Ok(())
}

#[tokio::test]
async fn open_range_runs_to_end_of_file() -> Result<()> {
    let data = hundred_bytes();
    let harness = share_with(vec![("blob.bin", data.clone())]).await?;

    let response = harness.request(&with_range("/blob.bin", "bytes=95-")).await?;
    assert_eq!(response.status, 206);
    assert_eq!(response.header("content-range"), Some("bytes 95-99/100"));
    assert_eq!(response.body, &data[95..]);

    harness.shutdown().await;
    Ok(())
}

#[tokio::test]
async fn range_past_end_is_unsatisfiable() -> Result<()> {
    let harness = share_with(vec![("blob.bin", hundred_bytes())]).await?;

    let response = harness.request(&with_range("/blob.bin", "bytes=100-")).await?;
    assert_eq!(response.status, 416);
    assert_eq!(response.header("content-range"), Some("bytes */100"));
    assert!(response.body.is_empty());

    harness.shutdown().await;
    Ok(())
}

#[tokio::test]
async fn unsupported_range_forms_serve_whole_file() -> Result<()> {
    let data = hundred_bytes();
    let harness = share_with(vec![("blob.bin", data.clone())]).await?;

    for range in ["bytes=-10", "bytes=0-1,5-6", "items=0-5"] {
        let response = harness.request(&with_range("/blob.bin", range)).await?;
        assert_eq!(response.status, 200, "range {range}");
        assert_eq!(response.body, data, "range {range}");
    }

    harness.shutdown().await;
    Ok(())
}

#[tokio::test]
async fn head_sends_headers_only() -> Result<()> {
    let harness = share_with(vec![("notes.txt", b"some notes".to_vec())]).await?;

    let response = harness
        .request("HEAD /notes.txt HTTP/1.1\r\nHost: localhost\r\n\r\n")
        .await?;
    assert_eq!(response.status, 200);
    assert_eq!(response.header("content-length"), Some("10"));
    assert_eq!(
        response.header("content-type"),
        Some("text/plain; charset=UTF-8")
    );
    assert!(response.header("last-modified").is_some());
    assert!(response.body.is_empty());

    harness.shutdown().await;
    Ok(())
}

#[tokio::test]
async fn share_mode_rejects_writes_and_serves_downloads() -> Result<()> {
    let harness = share_with(vec![("photos/cat.jpg", b"\xff\xd8jpeg".to_vec())]).await?;

    let post = harness
        .request("POST /photos/cat.jpg HTTP/1.1\r\nHost: localhost\r\nContent-Length: 0\r\n\r\n")
        .await?;
    assert_eq!(post.status, 405);
    assert_eq!(post.header("allow"), Some("GET, HEAD"));

    let download = harness.get("/photos/cat.jpg?download").await?;
    assert_eq!(download.status, 200);
    assert_eq!(download.header("content-type"), Some("image/jpeg"));
    assert_eq!(
        download.header("content-disposition"),
        Some("attachment; filename=\"cat.jpg\"")
    );

    let encoded = harness.get("/photos/c%61t.jpg").await?;
    assert_eq!(encoded.status, 200);
    assert_eq!(encoded.body, b"\xff\xd8jpeg");

    harness.shutdown().await;
    Ok(())
}

#[tokio::test]
async fn traversal_is_rejected() -> Result<()> {
    let harness = share_with(vec![("public.txt", b"ok".to_vec())]).await?;
    for target in ["/../secret", "/a/%2e%2e/%2e%2e/secret"] {
        let response = harness.get(target).await?;
        assert_eq!(response.status, 400, "target {target}");
    }
    harness.shutdown().await;
    Ok(())
}

#[tokio::test]
async fn basic_auth_gates_every_request() -> Result<()> {
    let harness = ServerHarnessBuilder::new()?
        .with_file("private.txt", "for owner only")
        .with_settings(|settings| {
            settings.mode = Mode::Share;
            settings.auth = Some("owner:s3cret".to_string());
        })
        .spawn()
        .await?;

    let anonymous = harness.get("/private.txt").await?;
    assert_eq!(anonymous.status, 401);
    assert_eq!(
        anonymous.header("www-authenticate"),
        Some("Basic realm=\"Home Server\"")
    );
    assert_eq!(anonymous.text(), "401 Access denied");

    let wrong = STANDARD.encode("owner:guess");
    let rejected = harness
        .request(&format!(
            "GET /private.txt HTTP/1.1\r\nHost: localhost\r\nAuthorization: Basic {wrong}\r\n\r\n"
        ))
        .await?;
    assert_eq!(rejected.status, 401);

    let good = STANDARD.encode("owner:s3cret");
    let accepted = harness
        .request(&format!(
            "GET /private.txt HTTP/1.1\r\nHost: localhost\r\nAuthorization: Basic {good}\r\n\r\n"
        ))
        .await?;
    assert_eq!(accepted.status, 200);
    assert_eq!(accepted.text(), "for owner only");

    harness.shutdown().await;
    Ok(())
}
