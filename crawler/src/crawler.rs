//! The crawler as a pipeline source.

use crate::config::CrawlerConfig;
use crate::db::Database;
use crate::error::Result;
use crate::fetch::{Fetcher, HttpFetcher};
use crate::host_crawler::{CrawlRuntime, CrawlSettings, CrawlStats, HostCrawler};
use crate::hosts::HostRegistry;
use crate::models::EntityDocument;
use crate::url_store::UrlStore;
use crate::urls;
use log::{error, info, warn};
use semcrawl_pipe::{Flow, Interrupt, ItemType, Params, ProcessingContext, PipeError, Processor, Stage};
use std::ffi::OsString;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Arc;

/// Context key under which the host registry is published
pub const HOST_MANAGER_KEY: &str = "hostManager";

pub const DEF_BOOTSTRAP_FILE: &str = "bootstrap.list";

/// Appended to a bootstrap file once it was read
pub const BOOTSTRAP_OLD_SUFFIX: &str = ".old";

const NAME: &str = "HtmlCrawler";

/// Parameters of [`HtmlCrawler`]
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CrawlerParams {
    /// Configuration file
    pub conf: PathBuf,
    /// Seed URL list, read once if it exists
    pub bootstrap: PathBuf,
}

impl CrawlerParams {
    pub fn new(conf: impl Into<PathBuf>) -> Self {
        Self {
            conf: conf.into(),
            bootstrap: PathBuf::from(DEF_BOOTSTRAP_FILE),
        }
    }

    /// `conf` (required) and `bootstrap`
    pub fn from_params(params: &Params) -> semcrawl_pipe::Result<Self> {
        Ok(Self {
            conf: params.required("conf")?,
            bootstrap: params.optional("bootstrap", PathBuf::from(DEF_BOOTSTRAP_FILE))?,
        })
    }
}

/// What the crawler builds from its configuration
struct CrawlState {
    registry: Arc<HostRegistry>,
    store: UrlStore,
    crawlers: Vec<HostCrawler>,
    bootstrap: PathBuf,
}

/// Pipeline source crawling every configured host and emitting an
/// [`EntityDocument`] for each visited entity page
pub struct HtmlCrawler {
    params: CrawlerParams,
    fetcher: Option<Arc<dyn Fetcher>>,
    state: Option<CrawlState>,
}

impl HtmlCrawler {
    pub fn new(params: CrawlerParams) -> Self {
        Self {
            params,
            fetcher: None,
            state: None,
        }
    }

    pub fn from_params(params: &Params) -> semcrawl_pipe::Result<Self> {
        Ok(Self::new(CrawlerParams::from_params(params)?))
    }

    /// Uses `fetcher` instead of an HTTP client built from the configuration
    pub fn with_fetcher(mut self, fetcher: Arc<dyn Fetcher>) -> Self {
        self.fetcher = Some(fetcher);
        self
    }

    /// Registry of the configured hosts, once the context is set
    pub fn registry(&self) -> Option<Arc<HostRegistry>> {
        self.state.as_ref().map(|s| s.registry.clone())
    }

    fn build(&self, ctx: &ProcessingContext) -> Result<CrawlState> {
        let conf_path = ctx.resolve(&self.params.conf);
        let conf = CrawlerConfig::load(&conf_path)?;
        let db = Database::new(ctx.resolve(&conf.database))?;
        let registry = Arc::new(HostRegistry::load(db.clone(), &conf.hosts)?);

        let fetcher: Arc<dyn Fetcher> = match &self.fetcher {
            Some(fetcher) => fetcher.clone(),
            None => Arc::new(HttpFetcher::new(&conf.connection)?),
        };
        let settings = CrawlSettings::from_config(&conf);
        let stats = Arc::new(CrawlStats::new(ctx));

        let mut crawlers = Vec::with_capacity(registry.len());
        for id in registry.host_ids() {
            if let Some(host) = registry.shared_host(id) {
                crawlers.push(HostCrawler::new(
                    host,
                    &db,
                    fetcher.clone(),
                    settings.clone(),
                    stats.clone(),
                )?);
            }
        }

        Ok(CrawlState {
            registry,
            store: UrlStore::open(&db)?,
            crawlers,
            bootstrap: ctx.resolve(&self.params.bootstrap),
        })
    }

    /// Adds seed URLs; returns how many were new and matched a configured
    /// host and pattern
    pub fn bootstrap_urls<'a, I>(&self, seeds: I) -> usize
    where
        I: IntoIterator<Item = &'a str>,
    {
        match &self.state {
            Some(state) => add_seeds(&state.registry, &state.store, seeds),
            None => 0,
        }
    }
}

fn add_seeds<'a, I>(registry: &HostRegistry, store: &UrlStore, seeds: I) -> usize
where
    I: IntoIterator<Item = &'a str>,
{
    let mut added = 0;
    for seed in seeds {
        let url = match urls::normalize(seed) {
            Ok(url) => url,
            Err(e) => {
                warn!("Invalid seed URL: {}", e);
                continue;
            }
        };
        let host = match registry.host_for(&url) {
            Some(host) => host,
            None => {
                warn!("Host {} is not configured", urls::full_host(&url));
                continue;
            }
        };
        if let Some(entry) = host.classify(urls::path_and_query(&url)) {
            match store.add_entry(&entry) {
                Ok(true) => added += 1,
                Ok(false) => {}
                Err(e) => error!("Can't store seed {}: {}", url, e),
            }
        }
    }
    added
}

/// Reads a seed list and renames it so it is not read again
fn consume_bootstrap(path: &Path) -> Result<Option<Vec<String>>> {
    if !path.exists() {
        return Ok(None);
    }
    let text = fs::read_to_string(path)?;
    let seeds = text
        .lines()
        .map(str::trim)
        .filter(|l| !l.is_empty() && !l.starts_with('#'))
        .map(str::to_string)
        .collect();

    let mut old = OsString::from(path.as_os_str());
    old.push(BOOTSTRAP_OLD_SUFFIX);
    fs::rename(path, &old)?;
    Ok(Some(seeds))
}

impl Processor for HtmlCrawler {
    fn name(&self) -> &str {
        NAME
    }

    fn output(&self) -> ItemType {
        ItemType::of::<EntityDocument>()
    }

    fn set_context(&mut self, ctx: &ProcessingContext) -> semcrawl_pipe::Result<()> {
        let state = self.build(ctx).map_err(|e| PipeError::init(NAME, e))?;
        ctx.publish(HOST_MANAGER_KEY, state.registry.clone())?;
        self.state = Some(state);
        Ok(())
    }

    fn can_start(&self) -> std::result::Result<(), String> {
        match &self.state {
            None => Err("crawler is not configured".to_string()),
            Some(state) if state.crawlers.is_empty() => Err("no valid hosts configured".to_string()),
            Some(_) => Ok(()),
        }
    }

    fn process(&mut self, _stage: &Stage) -> std::result::Result<Flow, Interrupt> {
        // host threads do the work, see `run`
        Ok(Flow::Finished)
    }

    fn run(&mut self, stage: &Stage) {
        if !stage.enter_running() {
            return;
        }
        let state = match self.state.take() {
            Some(state) => state,
            None => {
                error!("{}: started without configuration", NAME);
                return;
            }
        };

        match consume_bootstrap(&state.bootstrap) {
            Ok(Some(seeds)) => {
                let added = add_seeds(&state.registry, &state.store, seeds.iter().map(String::as_str));
                info!("Bootstrapped {} of {} seed URLs", added, seeds.len());
            }
            Ok(None) => {}
            Err(e) => error!("Can't read bootstrap file {}: {}", state.bootstrap.display(), e),
        }
        if let Err(e) = state.store.unlock_all() {
            error!("Can't release stale URL locks: {}", e);
        }

        let runtime = CrawlRuntime {
            status: stage.status_cell(),
            outlet: stage.outlet(),
        };
        let mut handles = Vec::new();
        for crawler in state.crawlers {
            let address = crawler.host().address.clone();
            match crawler.spawn(runtime.clone()) {
                Ok(handle) => handles.push((address, handle)),
                Err(e) => error!("Can't start crawler for {}: {}", address, e),
            }
        }
        for (address, handle) in handles {
            if handle.join().is_err() {
                error!("Crawler of {} panicked", address);
            }
        }
        info!("All hosts crawled");
    }
}
