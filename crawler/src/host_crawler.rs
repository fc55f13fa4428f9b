//! Worker threads crawling one host.
//!
//! A host gets one parent worker and `threads - 1` children. All of them
//! share the host's prefetch buffer, robots policy and request slot, so the
//! crawl delay holds for the host as a whole.

use crate::config::CrawlerConfig;
use crate::db::Database;
use crate::error::{CrawlError, Result};
use crate::fetch::{FetchedPage, Fetcher, PageRequest};
use crate::hosts::RegisteredHost;
use crate::html::{self, ParsedPage};
use crate::models::{EntityDocument, UrlEntry};
use crate::prefetch::{RefillPlan, UrlBuffer};
use crate::robots::{self, RobotsPolicy};
use crate::url_store::UrlStore;
use crate::urls;
use chrono::Utc;
use log::{debug, error, info, trace, warn};
use rand::Rng;
use semcrawl_pipe::{Average, Outlet, ProcessingContext, Stat, Stats, Status, StatusCell, Sum};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Condvar, Mutex, MutexGuard};
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};
use url::Url;

/// Stats group of the crawler
pub const STATS_GROUP: &str = "HtmlCrawler";

/// Idle workers re-check for work at least this often
const WORK_WAIT: Duration = Duration::from_millis(500);

/// Default pause between two connectivity checks
pub const CONN_TEST_WAIT: Duration = Duration::from_secs(5);

/// Base pause between two attempts of the same request
const RETRY_BACKOFF: Duration = Duration::from_millis(500);

/// Sleeps are cut into steps of this length so stop requests are noticed
const SLEEP_STEP: Duration = Duration::from_millis(100);

/// Counters and timings published by the crawler
pub struct CrawlStats {
    pub conn_error: Arc<Stat>,
    pub valid_links: Arc<Stat>,
    pub new_links: Arc<Stat>,
    pub crawled: Arc<Stat>,
    pub avg_fetch: Arc<Stat>,
    pub avg_html_parse: Arc<Stat>,
    pub avg_scrape: Arc<Stat>,
}

impl CrawlStats {
    pub fn new(ctx: &ProcessingContext) -> Self {
        let stats = Stats::new(STATS_GROUP, ctx);
        Self {
            conn_error: Arc::new(stats.function::<Sum>("err.connError")),
            valid_links: Arc::new(stats.function::<Sum>("stat.validLinks")),
            new_links: Arc::new(stats.function::<Sum>("stat.newLinks")),
            crawled: Arc::new(stats.function::<Sum>("stat.crawled")),
            avg_fetch: Arc::new(stats.function::<Average>("perf.avgFetch")),
            avg_html_parse: Arc::new(stats.function::<Average>("perf.avgHTMLParse")),
            avg_scrape: Arc::new(stats.function::<Average>("perf.avgScrape")),
        }
    }
}

/// Crawler-wide options applied to every host
#[derive(Debug, Clone)]
pub struct CrawlSettings {
    pub threads: usize,
    pub delay_floor: Duration,
    pub policy_ignored: bool,
    pub fake_referrer: bool,
    pub user_agent: String,
    /// Extra attempts after a transport error
    pub retries: u32,
    pub check_interval: Duration,
}

impl CrawlSettings {
    pub fn from_config(conf: &CrawlerConfig) -> Self {
        Self {
            threads: conf.threads(),
            delay_floor: conf.crawl_delay_floor(),
            policy_ignored: conf.policy_ignored,
            fake_referrer: conf.fake_referrer,
            user_agent: conf.connection.user_agent.clone(),
            retries: conf.connection.retries,
            check_interval: CONN_TEST_WAIT,
        }
    }
}

/// Next permitted request time of a host
pub struct DelaySlot {
    next: Mutex<Instant>,
    delay: Duration,
}

impl DelaySlot {
    pub fn new(delay: Duration) -> Self {
        Self {
            next: Mutex::new(Instant::now()),
            delay,
        }
    }

    /// Slot of a host whose last request went out at `last`
    pub fn after(last: Instant, delay: Duration) -> Self {
        Self {
            next: Mutex::new(last + delay),
            delay,
        }
    }

    pub fn delay(&self) -> Duration {
        self.delay
    }

    /// Reserves the next free slot; consecutive reservations are at least
    /// `delay` apart
    pub fn reserve(&self) -> Instant {
        let mut next = self.next.lock().unwrap_or_else(|e| e.into_inner());
        let at = (*next).max(Instant::now());
        *next = at + self.delay;
        at
    }

    /// Blocks until a reserved slot is reached
    pub fn wait(&self) {
        sleep_until(self.reserve());
    }
}

fn sleep_until(at: Instant) {
    let now = Instant::now();
    if at > now {
        thread::sleep(at - now);
    }
}

/// How the pipeline drives a host crawler
#[derive(Clone)]
pub struct CrawlRuntime {
    /// Status of the crawler stage; workers run while it is `Running`
    pub status: StatusCell,
    /// Entity documents go here; `None` drops them
    pub outlet: Option<Outlet>,
}

/// Crawler of one configured host, ready to be started
pub struct HostCrawler {
    host: Arc<RegisteredHost>,
    db: Database,
    fetcher: Arc<dyn Fetcher>,
    settings: CrawlSettings,
    stats: Arc<CrawlStats>,
    policy: RobotsPolicy,
    buffer: Arc<UrlBuffer>,
    /// When robots.txt was read
    last_request: Option<Instant>,
}

impl HostCrawler {
    /// Reads the host's robots policy and prepares its URL buffer
    pub fn new(
        host: Arc<RegisteredHost>,
        db: &Database,
        fetcher: Arc<dyn Fetcher>,
        settings: CrawlSettings,
        stats: Arc<CrawlStats>,
    ) -> Result<Self> {
        let (policy, last_request) = if settings.policy_ignored {
            (RobotsPolicy::allow_all(), None)
        } else {
            let policy = load_policy(fetcher.as_ref(), &host.base, &settings.user_agent);
            (policy, Some(Instant::now()))
        };
        let buffer = UrlBuffer::new(UrlStore::open(db)?, RefillPlan::for_host(&host), host.id)
            .with_fetch_stat(stats.avg_fetch.clone());
        Ok(Self {
            host,
            db: db.clone(),
            fetcher,
            settings,
            stats,
            policy,
            buffer: Arc::new(buffer),
            last_request,
        })
    }

    pub fn host(&self) -> &RegisteredHost {
        &self.host
    }

    pub fn policy(&self) -> &RobotsPolicy {
        &self.policy
    }

    /// Delay between two requests to this host
    pub fn crawl_delay(&self) -> Duration {
        robots::effective_delay(
            self.settings.delay_floor,
            self.host.descriptor.crawl_delay,
            &self.policy,
        )
    }

    /// Starts the parent worker, which starts the children and returns once
    /// all of them are done
    pub fn spawn(self, runtime: CrawlRuntime) -> Result<JoinHandle<()>> {
        let threads = self.settings.threads.max(1);
        let name = self.host.descriptor.name.clone();
        let delay = self.crawl_delay();
        info!(
            "Crawling {} with {} thread(s), delay {:?}",
            self.host.address, threads, delay
        );

        let shared = Arc::new(Shared {
            slot: match self.last_request {
                Some(last) => DelaySlot::after(last, delay),
                None => DelaySlot::new(delay),
            },
            working: Mutex::new(vec![false; threads]),
            work_signal: Condvar::new(),
            done: AtomicBool::new(false),
            outage: Mutex::new(()),
            host: self.host,
            db: self.db,
            fetcher: self.fetcher,
            settings: self.settings,
            stats: self.stats,
            policy: self.policy,
            buffer: self.buffer,
            runtime,
        });

        let handle = thread::Builder::new()
            .name(format!("crawler_{}:0", name))
            .spawn(move || {
                let mut children = Vec::new();
                for i in 1..threads {
                    let child = shared.clone();
                    match thread::Builder::new()
                        .name(format!("crawler_{}:{}", name, i))
                        .spawn(move || child.work(i))
                    {
                        Ok(handle) => children.push(handle),
                        Err(e) => error!("Can't start crawler thread {} of {}: {}", i, name, e),
                    }
                }
                shared.work(0);
                for child in children {
                    if child.join().is_err() {
                        error!("A crawler thread of {} panicked", name);
                    }
                }
                shared.buffer.stop();
                info!("Finished crawling {}", shared.host.address);
            })?;
        Ok(handle)
    }
}

/// Reads the robots policy of a host; anything unreadable permits all
fn load_policy(fetcher: &dyn Fetcher, base: &Url, user_agent: &str) -> RobotsPolicy {
    let url = match robots::robots_url(base) {
        Some(url) => url,
        None => return RobotsPolicy::allow_all(),
    };
    match fetcher.fetch(&PageRequest::new(url.as_str())) {
        Ok(page) => {
            let policy = RobotsPolicy::parse(&page.body, user_agent);
            debug!(
                "Robots policy of {}: allows all = {}, delay = {:?}",
                base,
                policy.allows_all(),
                policy.crawl_delay_millis()
            );
            policy
        }
        Err(e) => {
            info!("No robots policy for {}: {}", base, e);
            RobotsPolicy::allow_all()
        }
    }
}

/// Why visiting an entry did not succeed
enum VisitError {
    /// Downstream stopped; the entry is not at fault
    Interrupted,
    Failed(CrawlError),
}

impl From<CrawlError> for VisitError {
    fn from(e: CrawlError) -> Self {
        VisitError::Failed(e)
    }
}

/// State shared by the workers of a host
struct Shared {
    host: Arc<RegisteredHost>,
    db: Database,
    fetcher: Arc<dyn Fetcher>,
    settings: CrawlSettings,
    stats: Arc<CrawlStats>,
    policy: RobotsPolicy,
    buffer: Arc<UrlBuffer>,
    runtime: CrawlRuntime,
    slot: DelaySlot,
    /// Busy flag per worker
    working: Mutex<Vec<bool>>,
    work_signal: Condvar,
    /// Every worker ran out of work
    done: AtomicBool,
    /// Held while connectivity is being checked
    outage: Mutex<()>,
}

impl Shared {
    fn running(&self) -> bool {
        self.runtime.status.get() == Status::Running && !self.done.load(Ordering::SeqCst)
    }

    fn lock_working(&self) -> MutexGuard<'_, Vec<bool>> {
        self.working.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn set_working(&self, index: usize, working: bool) {
        self.lock_working()[index] = working;
    }

    fn work(&self, index: usize) {
        let store = match UrlStore::open(&self.db) {
            Ok(store) => store,
            Err(e) => {
                error!("Crawler thread {} of {} can't open the store: {}", index, self.host.address, e);
                self.set_working(index, false);
                return;
            }
        };
        while self.running() {
            self.set_working(index, true);
            match self.buffer.get_entry() {
                Some(entry) => self.crawl(entry, &store),
                None => self.wait_for_work(index),
            }
        }
        self.set_working(index, false);
        self.work_signal.notify_all();
    }

    /// Idles until new links may have arrived; the last worker going idle
    /// ends the crawl of this host
    fn wait_for_work(&self, index: usize) {
        let mut working = self.lock_working();
        working[index] = false;
        if working.iter().any(|w| *w) {
            let _ = self
                .work_signal
                .wait_timeout(working, WORK_WAIT)
                .unwrap_or_else(|e| e.into_inner());
        } else {
            debug!("No more work for {}", self.host.address);
            self.done.store(true, Ordering::SeqCst);
            self.work_signal.notify_all();
        }
    }

    fn crawl(&self, mut entry: UrlEntry, store: &UrlStore) {
        let mut ok = true;
        if self.settings.policy_ignored || self.policy.allows(&entry.path) {
            match self.visit(&entry, store) {
                Ok(()) => {
                    entry.visit_count += 1;
                    self.stats.crawled.add_one();
                }
                Err(VisitError::Interrupted) => {
                    debug!("Downstream stopped while emitting {}", entry.url());
                    self.runtime.status.request_stop();
                    // not visited as far as the store is concerned
                    if let Err(e) = store.unlock_urls(std::slice::from_ref(&entry)) {
                        error!("Can't unlock {}: {}", entry.url(), e);
                    }
                    return;
                }
                Err(VisitError::Failed(e @ (CrawlError::Fetch { .. } | CrawlError::Status { .. }))) => {
                    error!("{}", e);
                    self.stats.conn_error.add_one();
                    // an outage is not the URL's fault
                    ok = self.detect_outage();
                }
                Err(VisitError::Failed(e)) => {
                    warn!("Can't process {}: {}", entry.url(), e);
                    ok = false;
                }
            }
        } else {
            debug!("Robots policy disallows {}", entry.url());
        }

        entry.last_visited = Utc::now();
        entry.apply_outcome(ok);
        if let Err(e) = store.return_entry(&entry) {
            error!("Can't return {}: {}", entry.url(), e);
        }
    }

    fn visit(&self, entry: &UrlEntry, store: &UrlStore) -> std::result::Result<(), VisitError> {
        let url = Url::parse(&entry.url()).map_err(|_| CrawlError::Url(entry.url()))?;

        let request = PageRequest {
            url: url.to_string(),
            charset: self.host.descriptor.charset.clone(),
            referer: self
                .settings
                .fake_referrer
                .then(|| self.host.address.clone()),
        };
        let page = self.fetch_page(&request)?;

        let started = Instant::now();
        let parsed = html::parse_page(&page.body)?;
        self.stats.avg_html_parse.add_duration(started.elapsed());

        let base = parsed
            .base_href
            .as_deref()
            .and_then(|href| urls::resolve(&url, href).ok())
            .unwrap_or_else(|| url.clone());

        if entry.entity {
            let scrapers = self
                .host
                .entity_descriptor(&entry.pattern)
                .map(|e| e.scrapers.clone())
                .unwrap_or_default();
            let document = EntityDocument {
                url: entry.url(),
                base_url: base.to_string(),
                pattern: entry.pattern.clone(),
                scrapers,
                title: parsed.title.clone(),
                html: page.body,
            };
            if let Some(outlet) = &self.runtime.outlet {
                if outlet.send(document).is_err() {
                    return Err(VisitError::Interrupted);
                }
            }
        }

        self.scrape_links(&parsed, &base, store);
        Ok(())
    }

    /// Fetches a page, retrying transport errors. Every attempt takes its
    /// own request slot.
    fn fetch_page(&self, request: &PageRequest) -> Result<FetchedPage> {
        let mut attempt = 0;
        loop {
            self.await_slot();
            match self.fetcher.fetch(request) {
                Err(e) if e.is_transport() && attempt < self.settings.retries => {
                    attempt += 1;
                    let jitter = Duration::from_millis(rand::thread_rng().gen_range(0..250));
                    let backoff = RETRY_BACKOFF * attempt + jitter;
                    warn!(
                        "{}; retry {}/{} in {:?}",
                        e, attempt, self.settings.retries, backoff
                    );
                    if !self.pause(backoff) {
                        return Err(e);
                    }
                }
                result => return result,
            }
        }
    }

    /// Waits for the next request slot, and for a connectivity check of a
    /// sibling to finish
    fn await_slot(&self) {
        let at = {
            let _outage = self.outage.lock().unwrap_or_else(|e| e.into_inner());
            self.slot.reserve()
        };
        sleep_until(at);
    }

    /// Stores the links of a page that belong to this host and match one of
    /// its patterns
    fn scrape_links(&self, page: &ParsedPage, base: &Url, store: &UrlStore) {
        let started = Instant::now();
        let mut found = Vec::new();
        for link in &page.links {
            let url = match urls::resolve(base, link) {
                Ok(url) => url,
                Err(_) => {
                    trace!("Skipping malformed link {}", link);
                    continue;
                }
            };
            if !self.host.is_same_host(&url) {
                continue;
            }
            if let Some(entry) = self.host.classify(urls::path_and_query(&url)) {
                found.push(entry);
            }
        }
        self.stats.avg_scrape.add_duration(started.elapsed());
        self.stats.valid_links.add(found.len() as f64);

        match store.add_entries(&found) {
            Ok(added) => self.stats.new_links.add(added as f64),
            Err(e) => error!("Can't store links of {}: {}", base, e),
        }
        self.work_signal.notify_all();
    }

    /// Requests the host's base URL until it answers, holding back the
    /// siblings meanwhile. Returns whether an outage was observed.
    fn detect_outage(&self) -> bool {
        let _outage = self.outage.lock().unwrap_or_else(|e| e.into_inner());
        let check = PageRequest::new(self.host.base.as_str());
        let mut outage = false;
        loop {
            self.slot.wait();
            match self.fetcher.fetch(&check) {
                Ok(_) | Err(CrawlError::Status { .. }) => {
                    if outage {
                        info!("Connection to {} restored", self.host.address);
                    }
                    return outage;
                }
                Err(e) => {
                    if !outage {
                        warn!("Connection error, {} unreachable: {}", self.host.address, e);
                        outage = true;
                    }
                    if !self.pause(self.settings.check_interval) {
                        return outage;
                    }
                }
            }
        }
    }

    /// Sleeps while the crawl runs; false when it was stopped meanwhile
    fn pause(&self, duration: Duration) -> bool {
        let until = Instant::now() + duration;
        while self.runtime.status.get() == Status::Running {
            let now = Instant::now();
            if now >= until {
                return true;
            }
            thread::sleep(SLEEP_STEP.min(until - now));
        }
        false
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::fetch::{FetchedPage, MockFetcher};
    use crate::hosts::HostRegistry;
    use crate::models::{EntityDescriptor, HostDescriptor, SourcePattern, SCORE_MIN};
    use crate::url_store::UrlQuery;
    use std::sync::atomic::AtomicUsize;

    fn refused(url: &str) -> Result<FetchedPage> {
        Err(CrawlError::Fetch {
            url: url.to_string(),
            reason: "connection refused".to_string(),
        })
    }

    /// Every gap between consecutive request times
    fn gaps(times: &[Instant]) -> Vec<Duration> {
        times.windows(2).map(|w| w[1].duration_since(w[0])).collect()
    }

    const BASE: &str = "http://example.com/";

    fn descriptor() -> HostDescriptor {
        HostDescriptor {
            base_url: BASE.to_string(),
            name: "example".to_string(),
            charset: None,
            crawl_delay: None,
            source_first: false,
            sources: vec![SourcePattern {
                pattern: "/(index\\.html)?".to_string(),
                update_freq: 3600,
            }],
            entities: vec![EntityDescriptor {
                pattern: "/item/\\d+".to_string(),
                update_freq: 3600,
                weight: 1,
                scrapers: Vec::new(),
            }],
        }
    }

    fn settings(threads: usize) -> CrawlSettings {
        CrawlSettings {
            threads,
            delay_floor: Duration::from_millis(1),
            policy_ignored: false,
            fake_referrer: false,
            user_agent: "semcrawl/test".to_string(),
            retries: 0,
            check_interval: Duration::from_millis(10),
        }
    }

    fn page(url: &str, body: &str) -> Result<FetchedPage> {
        Ok(FetchedPage {
            url: url.to_string(),
            status: 200,
            content_type: Some("text/html".to_string()),
            body: body.to_string(),
        })
    }

    fn not_found(url: &str) -> Result<FetchedPage> {
        Err(CrawlError::Status {
            url: url.to_string(),
            status: 404,
        })
    }

    /// A small site: an index linking two items and a foreign page
    fn site(robots: &'static str) -> MockFetcher {
        let mut fetcher = MockFetcher::new();
        fetcher.expect_fetch().returning(move |req| site_page(robots, req));
        fetcher
    }

    fn site_page(robots: &str, req: &PageRequest) -> Result<FetchedPage> {
        match req.url.as_str() {
            "http://example.com/robots.txt" if robots.is_empty() => not_found(&req.url),
            "http://example.com/robots.txt" => page(&req.url, robots),
            "http://example.com/" => page(
                &req.url,
                r#"<a href="/item/1">1</a><a href="item/2#x">2</a>
                   <a href="http://other.example/item/3">3</a><a href="/about">about</a>"#,
            ),
            "http://example.com/item/1" | "http://example.com/item/2" => {
                page(&req.url, r#"<title>item</title><a href="/">home</a>"#)
            }
            _ => not_found(&req.url),
        }
    }

    struct Harness {
        _dir: tempfile::TempDir,
        db: Database,
        host: Arc<RegisteredHost>,
        ctx: ProcessingContext,
        stats: Arc<CrawlStats>,
    }

    fn harness() -> Harness {
        let dir = tempfile::tempdir().unwrap();
        let db = Database::new(dir.path().join("crawl.db")).unwrap();
        let registry = HostRegistry::load(db.clone(), &[descriptor()]).unwrap();
        let id = registry.host_ids()[0];
        let host = registry.shared_host(id).unwrap();
        UrlStore::open(&db)
            .unwrap()
            .add_entry(&host.classify("/").unwrap())
            .unwrap();
        let ctx = ProcessingContext::new();
        let stats = Arc::new(CrawlStats::new(&ctx));
        Harness {
            _dir: dir,
            db,
            host,
            ctx,
            stats,
        }
    }

    fn run(h: &Harness, fetcher: MockFetcher, settings: CrawlSettings) {
        let crawler = HostCrawler::new(
            h.host.clone(),
            &h.db,
            Arc::new(fetcher),
            settings,
            h.stats.clone(),
        )
        .unwrap();
        let status = StatusCell::new();
        status.mark_running();
        let handle = crawler
            .spawn(CrawlRuntime {
                status,
                outlet: None,
            })
            .unwrap();
        handle.join().unwrap();
    }

    fn entries(h: &Harness) -> Vec<UrlEntry> {
        UrlStore::open(&h.db)
            .unwrap()
            .list(&UrlQuery::for_host(h.host.id))
            .unwrap()
    }

    #[test]
    fn crawls_site_and_discovers_links() {
        let h = harness();
        run(&h, site(""), settings(2));

        let stored = entries(&h);
        let paths: Vec<&str> = stored.iter().map(|e| e.path.as_str()).collect();
        assert_eq!(stored.len(), 3, "{:?}", paths);
        assert!(stored.iter().all(|e| e.visit_count == 1 && e.score == 0));
        assert!(!paths.contains(&"/about"));

        let reader = Stats::reader(&h.ctx);
        assert_eq!(reader.get_in(STATS_GROUP, "stat.crawled"), Some(3.0));
        assert_eq!(reader.get_in(STATS_GROUP, "stat.newLinks"), Some(2.0));
        assert!(UrlStore::open(&h.db).unwrap().list_locked().unwrap().is_empty());
    }

    #[test]
    fn disallowed_entries_are_not_fetched() {
        let h = harness();
        let fetched = Arc::new(AtomicUsize::new(0));
        let counter = fetched.clone();
        let mut fetcher = MockFetcher::new();
        fetcher.expect_fetch().returning(move |req| {
            if req.url.ends_with("/robots.txt") {
                return page(&req.url, "User-agent: *\nDisallow: /\n");
            }
            counter.fetch_add(1, Ordering::SeqCst);
            page(&req.url, "")
        });
        run(&h, fetcher, settings(1));

        assert_eq!(fetched.load(Ordering::SeqCst), 0);
        let stored = entries(&h);
        assert_eq!(stored[0].visit_count, 0);
        assert!(stored[0].last_visited > crate::models::epoch());
    }

    #[test]
    fn failures_lower_the_score() {
        let h = harness();
        let mut store_entry = entries(&h).remove(0);
        store_entry.score = SCORE_MIN + 1;
        UrlStore::open(&h.db).unwrap().update_entry(&store_entry).unwrap();

        let mut fetcher = MockFetcher::new();
        fetcher.expect_fetch().returning(|req| match req.url.as_str() {
            // the base answers, so the host is reachable
            "http://example.com/" => Err(CrawlError::Status {
                url: req.url.clone(),
                status: 500,
            }),
            _ => not_found(&req.url),
        });
        run(&h, fetcher, settings(1));

        let stored = entries(&h).remove(0);
        assert_eq!(stored.score, SCORE_MIN);
        assert!(!stored.working);
        let reader = Stats::reader(&h.ctx);
        assert_eq!(reader.get_in(STATS_GROUP, "err.connError"), Some(1.0));
    }

    #[test]
    fn outage_does_not_penalize() {
        let h = harness();
        let calls = Arc::new(AtomicUsize::new(0));
        let counter = calls.clone();
        let mut fetcher = MockFetcher::new();
        fetcher.expect_fetch().returning(move |req| {
            if req.url.ends_with("/robots.txt") {
                return not_found(&req.url);
            }
            // the page request and the first check fail, the second check passes
            match counter.fetch_add(1, Ordering::SeqCst) {
                0 | 1 => Err(CrawlError::Fetch {
                    url: req.url.clone(),
                    reason: "connection refused".to_string(),
                }),
                _ => page(&req.url, ""),
            }
        });
        run(&h, fetcher, settings(1));

        let stored = entries(&h).remove(0);
        assert_eq!(stored.score, 0);
        assert!(stored.working);
        assert_eq!(stored.visit_count, 0);
    }

    #[test]
    fn delay_slots_are_spaced() {
        let slot = DelaySlot::new(Duration::from_millis(200));
        let first = slot.reserve();
        let second = slot.reserve();
        let third = slot.reserve();
        assert!(second.duration_since(first) >= Duration::from_millis(200));
        assert!(third.duration_since(second) >= Duration::from_millis(200));
    }

    #[test]
    fn delay_floor_beats_robots_delay() {
        let h = harness();
        let mut fetcher = MockFetcher::new();
        fetcher
            .expect_fetch()
            .returning(|req| page(&req.url, "User-agent: *\nCrawl-delay: 0.05\n"));
        let settings = CrawlSettings {
            delay_floor: Duration::from_millis(200),
            ..settings(1)
        };
        let crawler =
            HostCrawler::new(h.host.clone(), &h.db, Arc::new(fetcher), settings, h.stats.clone()).unwrap();
        assert_eq!(crawler.policy().crawl_delay_millis(), Some(50));
        assert_eq!(crawler.crawl_delay(), Duration::from_millis(200));
    }

    #[test]
    fn stopped_crawl_releases_leases() {
        let h = harness();
        let crawler = HostCrawler::new(
            h.host.clone(),
            &h.db,
            Arc::new(site("")),
            settings(1),
            h.stats.clone(),
        )
        .unwrap();
        // never marked running
        let handle = crawler
            .spawn(CrawlRuntime {
                status: StatusCell::new(),
                outlet: None,
            })
            .unwrap();
        handle.join().unwrap();
        assert!(UrlStore::open(&h.db).unwrap().list_locked().unwrap().is_empty());
        assert_eq!(entries(&h)[0].visit_count, 0);
    }

    #[test]
    fn connectivity_checks_keep_the_delay() {
        let h = harness();
        let times = Arc::new(Mutex::new(Vec::new()));
        let log = times.clone();
        let mut fetcher = MockFetcher::new();
        fetcher.expect_fetch().returning(move |req| {
            log.lock().unwrap().push(Instant::now());
            match req.url.as_str() {
                "http://example.com/robots.txt" => not_found(&req.url),
                "http://example.com/" => page(&req.url, r#"<a href="/item/1">1</a>"#),
                _ => not_found(&req.url),
            }
        });
        let settings = CrawlSettings {
            delay_floor: Duration::from_millis(100),
            ..settings(2)
        };
        run(&h, fetcher, settings);

        // robots, index, item, base check
        let times = times.lock().unwrap();
        assert_eq!(times.len(), 4);
        for gap in gaps(&times) {
            assert!(gap >= Duration::from_millis(100), "{:?}", gap);
        }
    }

    #[test]
    fn retries_take_their_own_slots() {
        let h = harness();
        let times = Arc::new(Mutex::new(Vec::new()));
        let log = times.clone();
        let mut fetcher = MockFetcher::new();
        fetcher.expect_fetch().returning(move |req| {
            if req.url.ends_with("/robots.txt") {
                return not_found(&req.url);
            }
            let mut times = log.lock().unwrap();
            times.push(Instant::now());
            if times.len() == 1 {
                refused(&req.url)
            } else {
                page(&req.url, "")
            }
        });
        let settings = CrawlSettings {
            retries: 1,
            ..settings(1)
        };
        run(&h, fetcher, settings);

        let times = times.lock().unwrap();
        assert_eq!(times.len(), 2);
        assert!(gaps(&times)[0] >= RETRY_BACKOFF);
        let stored = entries(&h).remove(0);
        assert_eq!(stored.visit_count, 1);
        let reader = Stats::reader(&h.ctx);
        assert_eq!(reader.get_in(STATS_GROUP, "err.connError"), Some(0.0));
    }

    #[test]
    fn outage_holds_back_sibling_workers() {
        let h = harness();
        let items: String = (1..=6)
            .map(|i| format!(r#"<a href="/item/{0}">{0}</a>"#, i))
            .collect();
        let item_failed = Arc::new(AtomicBool::new(false));
        let base_failures = Arc::new(AtomicUsize::new(0));
        let checking = Arc::new(AtomicBool::new(false));
        let base_hits = Arc::new(AtomicUsize::new(0));
        let overlapping = Arc::new(AtomicUsize::new(0));
        let (failed, failures, busy, hits, overlap) = (
            item_failed.clone(),
            base_failures.clone(),
            checking.clone(),
            base_hits.clone(),
            overlapping.clone(),
        );
        let mut fetcher = MockFetcher::new();
        fetcher.expect_fetch().returning(move |req| match req.url.as_str() {
            "http://example.com/robots.txt" => not_found(&req.url),
            "http://example.com/" => {
                hits.fetch_add(1, Ordering::SeqCst);
                let pending = failures.load(Ordering::SeqCst);
                if pending > 0 {
                    failures.store(pending - 1, Ordering::SeqCst);
                    busy.store(true, Ordering::SeqCst);
                    return refused(&req.url);
                }
                busy.store(false, Ordering::SeqCst);
                page(&req.url, &items)
            }
            "http://example.com/item/1" if !failed.swap(true, Ordering::SeqCst) => {
                // the host goes down for the next two base requests
                failures.store(2, Ordering::SeqCst);
                refused(&req.url)
            }
            _ => {
                if busy.load(Ordering::SeqCst) {
                    overlap.fetch_add(1, Ordering::SeqCst);
                }
                page(&req.url, "<title>item</title>")
            }
        });
        let settings = CrawlSettings {
            delay_floor: Duration::from_millis(30),
            ..settings(3)
        };
        run(&h, fetcher, settings);

        assert_eq!(overlapping.load(Ordering::SeqCst), 0);
        // index, two failed checks, one passing check
        assert_eq!(base_hits.load(Ordering::SeqCst), 4);
        let stored = entries(&h);
        assert_eq!(stored.len(), 7);
        let item = stored.iter().find(|e| e.path == "/item/1").unwrap();
        assert_eq!(item.score, 0);
        assert_eq!(item.visit_count, 0);
        assert!(stored
            .iter()
            .filter(|e| e.path != "/item/1")
            .all(|e| e.visit_count == 1));
    }

    #[test]
    fn fake_referrer_names_the_host() {
        let h = harness();
        let referers = Arc::new(Mutex::new(Vec::new()));
        let log = referers.clone();
        let mut fetcher = MockFetcher::new();
        fetcher.expect_fetch().returning(move |req| {
            if !req.url.ends_with("/robots.txt") {
                log.lock().unwrap().push(req.referer.clone());
            }
            site_page("", req)
        });
        let settings = CrawlSettings {
            fake_referrer: true,
            ..settings(1)
        };
        run(&h, fetcher, settings);

        let referers = referers.lock().unwrap();
        assert_eq!(referers.len(), 3);
        assert!(referers
            .iter()
            .all(|r| r.as_deref() == Some(h.host.address.as_str())));
    }
}
