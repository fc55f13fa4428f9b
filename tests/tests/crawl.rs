use semcrawl_crawler::host_crawler::STATS_GROUP;
use semcrawl_crawler::{
    CrawlerParams, DocumentWriter, EntityDocument, HtmlCrawler, WriterParams,
};
use semcrawl_pipe::{Flow, Interrupt, ItemType, Pipe, ProcessingContext, Processor, Stage, Stats};
use semcrawl_tests::site::TestSite;
use semcrawl_tests::workspace::{scratch_dir, CrawlSetup, CONF_FILE};
use std::path::Path;
use std::sync::{Arc, Mutex};
use std::time::Duration;

fn init_logs() {
    let _ = env_logger::builder().is_test(true).try_init();
}

struct Collect(Arc<Mutex<Vec<EntityDocument>>>);

impl Processor for Collect {
    fn name(&self) -> &str {
        "collect"
    }

    fn input(&self) -> ItemType {
        ItemType::of::<EntityDocument>()
    }

    fn process(&mut self, stage: &Stage) -> Result<Flow, Interrupt> {
        let doc = stage.read_as::<EntityDocument>()?;
        self.0.lock().unwrap().push(doc);
        Ok(Flow::Continue)
    }
}

/// Runs crawler → collector in `dir` until the crawl ends
fn crawl(dir: &Path) -> anyhow::Result<(ProcessingContext, Vec<EntityDocument>)> {
    let ctx = ProcessingContext::new();
    ctx.set_working_dir(dir);
    let docs = Arc::new(Mutex::new(Vec::new()));
    let mut pipe = Pipe::with_context(
        vec![
            Box::new(HtmlCrawler::new(CrawlerParams::new(CONF_FILE))),
            Box::new(Collect(docs.clone())),
        ],
        ctx.clone(),
    );
    pipe.start(true)?;
    let mut docs = docs.lock().unwrap().clone();
    docs.sort_by(|a, b| a.url.cmp(&b.url));
    Ok((ctx, docs))
}

#[test]
fn crawls_entities_of_local_site() -> anyhow::Result<()> {
    init_logs();
    let site = TestSite::start()?;
    let dir = scratch_dir()?;
    CrawlSetup::new(site.base_url()).write(dir.path(), &[site.base_url()])?;

    let (ctx, docs) = crawl(dir.path())?;

    let urls: Vec<&str> = docs.iter().map(|d| d.url.as_str()).collect();
    assert_eq!(
        urls,
        vec![site.url("/item/1"), site.url("/item/2"), site.url("/item/3")]
    );
    assert_eq!(docs[1].title.as_deref(), Some("Item 2"));
    assert_eq!(docs[1].base_url, site.url("/item/2"));
    assert_eq!(docs[1].pattern, "/item/\\d+");
    assert_eq!(docs[1].scrapers[0]["name"], "title");
    assert!(docs[1].html.contains("<title>Item 2</title>"));

    // disallowed by robots.txt, fetched once per link, tracking params dropped
    assert_eq!(site.hits_for("/item/99"), 0);
    assert_eq!(site.hits_for("/item/1"), 1);
    assert_eq!(site.hits_for("/item/3"), 1);
    assert_eq!(site.hits_for("/item/3?utm_source=list"), 0);

    let stats = Stats::reader(&ctx);
    assert_eq!(stats.get_in(STATS_GROUP, "stat.crawled"), Some(5.0));
    assert_eq!(stats.get_in(STATS_GROUP, "stat.newLinks"), Some(5.0));
    assert_eq!(stats.get_in(STATS_GROUP, "err.connError"), Some(0.0));

    assert!(!dir.path().join("bootstrap.list").exists());
    assert!(dir.path().join("bootstrap.list.old").exists());
    Ok(())
}

#[test]
fn visited_urls_are_not_due_again() -> anyhow::Result<()> {
    init_logs();
    let site = TestSite::start()?;
    let dir = scratch_dir()?;
    CrawlSetup::new(site.base_url()).write(dir.path(), &[site.base_url()])?;

    let (_, first) = crawl(dir.path())?;
    assert_eq!(first.len(), 3);
    let fetched = site.page_hits().len();

    let (_, second) = crawl(dir.path())?;
    assert!(second.is_empty());
    assert_eq!(site.page_hits().len(), fetched);
    Ok(())
}

#[test]
fn ignored_policy_fetches_disallowed_pages() -> anyhow::Result<()> {
    init_logs();
    let site = TestSite::start()?;
    let dir = scratch_dir()?;
    let mut setup = CrawlSetup::new(site.base_url());
    setup.policy_ignored = true;
    setup.write(dir.path(), &[site.base_url()])?;

    let (_, docs) = crawl(dir.path())?;
    assert_eq!(docs.len(), 4);
    assert_eq!(site.hits_for("/item/99"), 1);
    assert_eq!(site.hits_for("/robots.txt"), 0);
    Ok(())
}

#[test]
fn requests_respect_delay_floor() -> anyhow::Result<()> {
    init_logs();
    let site = TestSite::start()?;
    let dir = scratch_dir()?;
    let mut setup = CrawlSetup::new(site.base_url());
    setup.delay_floor_ms = 150;
    setup.threads = 3;
    setup.write(dir.path(), &[site.base_url()])?;

    crawl(dir.path())?;

    let hits = site.page_hits();
    assert_eq!(hits.len(), 5);
    for pair in hits.windows(2) {
        let gap = pair[1].at.duration_since(pair[0].at);
        // request slots are 150ms apart, arrival times jitter a little
        assert!(gap >= Duration::from_millis(100), "gap of {:?}", gap);
    }
    let span = hits[4].at.duration_since(hits[0].at);
    assert!(span >= Duration::from_millis(550), "span of {:?}", span);
    Ok(())
}

#[test]
fn failed_pages_and_connectivity_checks_keep_the_delay() -> anyhow::Result<()> {
    init_logs();
    let site = TestSite::start()?;
    let dir = scratch_dir()?;
    let mut setup = CrawlSetup::new(site.base_url());
    setup.delay_floor_ms = 300;
    setup.write(dir.path(), &[site.base_url(), site.url("/list/2")])?;

    crawl(dir.path())?;

    // /list/2 answers 404, after which the base URL is requested again
    assert_eq!(site.hits_for("/list/2"), 1);
    assert_eq!(site.hits_for("/"), 2);
    let hits = site.hits();
    assert_eq!(hits.len(), 8);
    for pair in hits.windows(2) {
        let gap = pair[1].at.duration_since(pair[0].at);
        assert!(
            gap >= Duration::from_millis(280),
            "{} -> {} after {:?}",
            pair[0].path,
            pair[1].path,
            gap
        );
    }
    Ok(())
}

#[test]
fn documents_are_written_as_json_lines() -> anyhow::Result<()> {
    init_logs();
    let site = TestSite::start()?;
    let dir = scratch_dir()?;
    CrawlSetup::new(site.base_url()).write(dir.path(), &[site.base_url()])?;

    let ctx = ProcessingContext::new();
    ctx.set_working_dir(dir.path());
    let mut pipe = Pipe::with_context(
        vec![
            Box::new(HtmlCrawler::new(CrawlerParams::new(CONF_FILE))),
            Box::new(DocumentWriter::new(WriterParams {
                out: "docs.jsonl".into(),
            })),
        ],
        ctx,
    );
    pipe.start(true)?;

    let text = std::fs::read_to_string(dir.path().join("docs.jsonl"))?;
    let mut urls = Vec::new();
    for line in text.lines() {
        let doc: serde_json::Value = serde_json::from_str(line)?;
        assert!(doc.get("html").is_none());
        urls.push(doc["url"].as_str().unwrap_or_default().to_string());
    }
    urls.sort();
    assert_eq!(urls, vec![site.url("/item/1"), site.url("/item/2"), site.url("/item/3")]);
    Ok(())
}

#[test]
fn unknown_configuration_refuses_to_start() {
    init_logs();
    let dir = tempfile::tempdir().unwrap();
    let ctx = ProcessingContext::new();
    ctx.set_working_dir(dir.path());
    let mut pipe = Pipe::with_context(
        vec![
            Box::new(HtmlCrawler::new(CrawlerParams::new("missing.json"))),
            Box::new(Collect(Arc::new(Mutex::new(Vec::new())))),
        ],
        ctx,
    );
    assert!(pipe.start(true).is_err());
}
