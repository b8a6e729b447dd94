//! Integration tests for the crawler
//!
//! These tests use wiremock to create mock storefronts and test the full
//! listing → item → image cycle end-to-end, including resumption from the
//! ledger and post-processing of the saved pages.

use std::path::Path;
use std::sync::Arc;
use storefront_crawler::config::{
    AppendFailurePolicy, Config, EngineConfig, LedgerConfig, OutputConfig, PageRange,
    TargetConfig, UserAgentConfig,
};
use storefront_crawler::crawler::FetchEngine;
use storefront_crawler::ledger::Ledger;
use storefront_crawler::sites::{crawl_targets, OutputLayout};
use storefront_crawler::storage::{post_process, ItemStore, SqliteStorage};
use url::Url;
use wiremock::matchers::{method, path, query_param};
use wiremock::{Mock, MockServer, ResponseTemplate};

/// Creates a test configuration rooted in a temporary directory
fn create_test_config(root: &Path, target: TargetConfig) -> Config {
    Config {
        engine: EngineConfig {
            max_concurrent_fetches: 3,
            minimum_wait_ms: 10, // Very short for testing
            request_timeout_ms: 5_000,
            max_retries: 1,
            ..EngineConfig::default()
        },
        user_agent: UserAgentConfig {
            crawler_name: "TestBot".to_string(),
            crawler_version: "1.0.0".to_string(),
            contact_url: Some("https://example.com/contact".to_string()),
        },
        ledger: LedgerConfig {
            path: root.join("downloaded.txt").display().to_string(),
            append_failure: AppendFailurePolicy::Log,
            denylist: vec!["*.blocked.test".to_string()],
        },
        output: OutputConfig {
            root: root.join("out").display().to_string(),
            database_path: root.join("items.db").display().to_string(),
        },
        targets: vec![target],
    }
}

fn create_target(seed: String) -> TargetConfig {
    TargetConfig {
        name: "shop".to_string(),
        seeds: vec![seed],
        pages: None,
        page_param: "page".to_string(),
        next_marker: Some("rel=\"next\"".to_string()),
        item_selector: Some("a.item".to_string()),
        image_selector: Some("img.main".to_string()),
        image_attr: "src".to_string(),
    }
}

async fn run_crawl(config: &Config, ledger: Arc<Ledger>) -> storefront_crawler::crawler::DrainReport {
    let engine = FetchEngine::new(&config.engine, &config.user_agent).unwrap();
    let targets: Vec<&TargetConfig> = config.targets.iter().collect();
    let report = crawl_targets(&engine, config, &targets, Arc::clone(&ledger))
        .await
        .unwrap();
    ledger.flush().unwrap();
    report
}

fn open_ledger(config: &Config) -> Arc<Ledger> {
    Arc::new(Ledger::from_config(&config.ledger).unwrap())
}

async fn mount_listing(server: &MockServer, page: &str, body: String) {
    Mock::given(method("GET"))
        .and(path("/list"))
        .and(query_param("page", page))
        .respond_with(
            ResponseTemplate::new(200)
                .set_body_string(body)
                .insert_header("content-type", "text/html"),
        )
        .expect(1)
        .mount(server)
        .await;
}

#[tokio::test]
async fn test_paginated_listing_chain() {
    let server = MockServer::start().await;
    let next = r#"<a rel="next" href="?page=x">Next</a>"#;
    mount_listing(&server, "0", format!("<html><body>page 0 {}</body></html>", next)).await;
    mount_listing(&server, "1", format!("<html><body>page 1 {}</body></html>", next)).await;
    mount_listing(&server, "2", "<html><body>page 2, the end</body></html>".to_string()).await;

    let dir = tempfile::tempdir().unwrap();
    let mut target = create_target(format!("{}/list?page=0", server.uri()));
    target.item_selector = None;
    let config = create_test_config(dir.path(), target);
    let ledger = open_ledger(&config);

    let report = run_crawl(&config, Arc::clone(&ledger)).await;

    assert_eq!(report.statistics.enqueued, 3);
    assert_eq!(report.statistics.succeeded, 3);
    assert_eq!(ledger.len(), 3);

    let contents = std::fs::read_to_string(&config.ledger.path).unwrap();
    let lines: Vec<&str> = contents.lines().collect();
    assert_eq!(
        lines,
        vec![
            format!("{}/list?page=0", server.uri()),
            format!("{}/list?page=1", server.uri()),
            format!("{}/list?page=2", server.uri()),
        ]
    );

    let layout = OutputLayout::new(&config.output.root, "shop");
    let saved = std::fs::read_dir(layout.listings_dir()).unwrap().count();
    assert_eq!(saved, 3);
}

/// Mounts one listing page with two items, one image each
async fn mount_storefront(server: &MockServer) {
    mount_listing(
        server,
        "0",
        r#"<html><body>
            <a class="item" href="/items/101.html">First</a>
            <a class="item" href="/items/102.html">Second</a>
            <a class="item" href="https://cdn.blocked.test/items/103.html">Dead host</a>
            <a class="nav" href="/about">About</a>
        </body></html>"#
            .to_string(),
    )
    .await;

    for id in ["101", "102"] {
        Mock::given(method("GET"))
            .and(path(format!("/items/{}.html", id)))
            .respond_with(ResponseTemplate::new(200).set_body_string(format!(
                r#"<html><head><title>Item {id}</title>
                <link rel="canonical" href="{uri}/items/{id}.html"></head>
                <body><img class="main" src="/img/{id}.jpg"><img class="thumb" src="/img/t.jpg"></body>
                </html>"#,
                id = id,
                uri = server.uri()
            )))
            .expect(1)
            .mount(server)
            .await;

        Mock::given(method("GET"))
            .and(path(format!("/img/{}.jpg", id)))
            .respond_with(
                ResponseTemplate::new(200)
                    .set_body_bytes(format!("jpeg-{}", id).into_bytes())
                    .insert_header("content-type", "image/jpeg"),
            )
            .expect(1)
            .mount(server)
            .await;
    }
}

#[tokio::test]
async fn test_listing_item_image_flow() {
    let server = MockServer::start().await;
    mount_storefront(&server).await;

    let dir = tempfile::tempdir().unwrap();
    let config = create_test_config(dir.path(), create_target(format!("{}/list?page=0", server.uri())));
    let ledger = open_ledger(&config);

    let report = run_crawl(&config, Arc::clone(&ledger)).await;

    // listing + 2 items + 2 images; the denylisted item is skipped
    assert_eq!(report.statistics.enqueued, 5);
    assert_eq!(report.statistics.succeeded, 5);
    assert_eq!(report.statistics.skipped, 1);
    assert_eq!(report.statistics.callback_faults, 0);
    assert_eq!(ledger.len(), 5);

    let layout = OutputLayout::new(&config.output.root, "shop");
    assert!(layout.item_path("101").exists());
    assert!(layout.item_path("102").exists());
    let image_url = Url::parse(&format!("{}/img/101.jpg", server.uri())).unwrap();
    assert_eq!(std::fs::read(layout.image_path(&image_url)).unwrap(), b"jpeg-101");
    // Thumbnails are not matched by the image selector
    assert_eq!(std::fs::read_dir(layout.images_dir()).unwrap().count(), 2);
    assert!(ledger.contains(&format!("{}/img/102.jpg", server.uri())));
}

#[tokio::test]
async fn test_second_run_skips_downloaded_urls() {
    let server = MockServer::start().await;
    mount_storefront(&server).await;

    let dir = tempfile::tempdir().unwrap();
    let config = create_test_config(dir.path(), create_target(format!("{}/list?page=0", server.uri())));

    let first = run_crawl(&config, open_ledger(&config)).await;
    assert_eq!(first.statistics.enqueued, 5);

    // Fresh ledger instance reads what the first run persisted
    let second = run_crawl(&config, open_ledger(&config)).await;
    assert_eq!(second.statistics.enqueued, 0);
    assert_eq!(second.statistics.skipped, 1);

    // Every mock still saw exactly one request
    server.verify().await;
}

#[tokio::test]
async fn test_post_process_after_crawl() {
    let server = MockServer::start().await;
    mount_storefront(&server).await;

    let dir = tempfile::tempdir().unwrap();
    let config = create_test_config(dir.path(), create_target(format!("{}/list?page=0", server.uri())));
    run_crawl(&config, open_ledger(&config)).await;

    let mut storage = SqliteStorage::new(Path::new(&config.output.database_path)).unwrap();
    let report = post_process(&config, &config.targets[0], &mut storage).unwrap();
    assert_eq!(report.processed, 2);
    assert_eq!(report.new_items, 2);
    assert_eq!(report.missing_images, 0);

    let items = storage.list_items("shop").unwrap();
    assert_eq!(items.len(), 2);
    assert_eq!(items[0].item_id, "101");
    assert_eq!(items[0].name.as_deref(), Some("Item 101"));
    assert_eq!(
        items[0].url.as_deref(),
        Some(format!("{}/items/101.html", server.uri()).as_str())
    );
    assert_eq!(
        items[0].image_urls,
        vec![format!("{}/img/101.jpg", server.uri())]
    );

    let layout = OutputLayout::new(&config.output.root, "shop");
    let image_url = Url::parse(&format!("{}/img/101.jpg", server.uri())).unwrap();
    assert_eq!(
        items[0].image_file_paths,
        layout.image_path(&image_url).display().to_string()
    );
}

async fn mount_item(server: &MockServer, route: &str, body: &str) {
    Mock::given(method("GET"))
        .and(path(route))
        .respond_with(ResponseTemplate::new(200).set_body_string(body.to_string()))
        .expect(1)
        .mount(server)
        .await;
}

#[tokio::test]
async fn test_item_linked_from_many_listings_is_fetched_once() {
    let server = MockServer::start().await;
    for page in 0..4 {
        mount_listing(
            &server,
            &page.to_string(),
            r#"<html><body><a class="item" href="/items/1.html">Popular</a></body></html>"#
                .to_string(),
        )
        .await;
    }
    mount_item(&server, "/items/1.html", "<html><title>Popular</title></html>").await;

    let dir = tempfile::tempdir().unwrap();
    let mut target = create_target(format!("{}/list?page={{page}}", server.uri()));
    target.pages = Some(PageRange { start: 0, end: 3 });
    target.next_marker = None;
    let mut config = create_test_config(dir.path(), target);
    config.engine.max_concurrent_fetches = 4;
    config.engine.minimum_wait_ms = 0;
    let ledger = open_ledger(&config);

    let report = run_crawl(&config, Arc::clone(&ledger)).await;

    // 4 listings + 1 item; the other three links to the item are skipped
    assert_eq!(report.statistics.enqueued, 5);
    assert_eq!(report.statistics.succeeded, 5);
    assert_eq!(report.statistics.skipped, 3);
    assert_eq!(ledger.len(), 5);

    let layout = OutputLayout::new(&config.output.root, "shop");
    assert_eq!(std::fs::read_dir(layout.pages_dir()).unwrap().count(), 1);
    server.verify().await;
}

#[tokio::test]
async fn test_items_with_the_same_file_name_keep_separate_files() {
    let server = MockServer::start().await;
    mount_listing(
        &server,
        "0",
        r#"<html><body>
            <a class="item" href="/a/index.html">A</a>
            <a class="item" href="/b/index.html">B</a>
        </body></html>"#
            .to_string(),
    )
    .await;
    mount_item(&server, "/a/index.html", "<html><title>A</title></html>").await;
    mount_item(&server, "/b/index.html", "<html><title>B</title></html>").await;

    let dir = tempfile::tempdir().unwrap();
    let config = create_test_config(dir.path(), create_target(format!("{}/list?page=0", server.uri())));
    let ledger = open_ledger(&config);

    run_crawl(&config, Arc::clone(&ledger)).await;

    assert!(ledger.contains(&format!("{}/a/index.html", server.uri())));
    assert!(ledger.contains(&format!("{}/b/index.html", server.uri())));

    let layout = OutputLayout::new(&config.output.root, "shop");
    let mut bodies: Vec<String> = std::fs::read_dir(layout.pages_dir())
        .unwrap()
        .map(|entry| std::fs::read_to_string(entry.unwrap().path()).unwrap())
        .collect();
    bodies.sort();
    assert_eq!(
        bodies,
        vec!["<html><title>A</title></html>", "<html><title>B</title></html>"]
    );
}
