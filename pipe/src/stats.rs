//! Named statistics kept in the processing context, and an attached process
//! that dumps them.

use crate::context::ProcessingContext;
use crate::error::Result;
use crate::params::Params;
use crate::processor::AttachedProcess;
use chrono::Local;
use log::{debug, warn};
use std::fs::File;
use std::io::{self, Write};
use std::path::PathBuf;
use std::sync::{Condvar, Mutex};
use std::time::{Duration, Instant};

const STATS_PREFIX: &str = "stats";
const DEF_GROUP: &str = "default";

/// An accumulating function over observed values
pub trait StatFunction: Send {
    /// Records one occurrence
    fn add_one(&mut self);
    fn add(&mut self, value: f64);
    fn value(&self) -> f64;
    fn reset(&mut self);
}

#[derive(Debug, Default)]
pub struct Sum {
    value: f64,
}

impl StatFunction for Sum {
    fn add_one(&mut self) {
        self.value += 1.0;
    }

    fn add(&mut self, value: f64) {
        self.value += value;
    }

    fn value(&self) -> f64 {
        self.value
    }

    fn reset(&mut self) {
        self.value = 0.0;
    }
}

/// Running mean
#[derive(Debug, Default)]
pub struct Average {
    count: u64,
    avg: f64,
}

impl StatFunction for Average {
    fn add_one(&mut self) {
        self.add(1.0);
    }

    fn add(&mut self, value: f64) {
        let old = self.count as f64;
        self.count += 1;
        self.avg = (self.avg * old + value) / self.count as f64;
    }

    fn value(&self) -> f64 {
        self.avg
    }

    fn reset(&mut self) {
        self.count = 0;
        self.avg = 0.0;
    }
}

/// Mean time between consecutive occurrences, in milliseconds
#[derive(Debug, Default)]
pub struct TimeInterval {
    avg: Average,
    last: Option<Instant>,
}

impl StatFunction for TimeInterval {
    fn add_one(&mut self) {
        let now = Instant::now();
        if let Some(last) = self.last {
            self.avg.add(now.duration_since(last).as_secs_f64() * 1000.0);
        }
        self.last = Some(now);
    }

    fn add(&mut self, value: f64) {
        self.avg.add(value);
    }

    fn value(&self) -> f64 {
        self.avg.value()
    }

    fn reset(&mut self) {
        self.avg.reset();
        self.last = None;
    }
}

/// A group of statistics published as `stats.<group>.<name>`
#[derive(Clone)]
pub struct Stats {
    group: String,
    ctx: ProcessingContext,
}

impl Stats {
    pub fn new(group: &str, ctx: &ProcessingContext) -> Self {
        let group = if group.is_empty() {
            warn!("Invalid stats group name supplied, using default");
            DEF_GROUP.to_string()
        } else {
            group.to_string()
        };
        Self {
            group,
            ctx: ctx.clone(),
        }
    }

    pub fn group(&self) -> &str {
        &self.group
    }

    pub fn key(group: &str, name: &str) -> String {
        format!("{}.{}.{}", STATS_PREFIX, group, name)
    }

    /// A new statistic in this group; its initial value is published
    /// right away
    pub fn function<F: StatFunction + Default + 'static>(&self, name: &str) -> Stat {
        let stat = Stat {
            key: Self::key(&self.group, name),
            func: Mutex::new(Box::new(F::default())),
            ctx: self.ctx.clone(),
        };
        stat.publish(0.0);
        stat
    }

    pub fn reader(ctx: &ProcessingContext) -> StatsReader {
        StatsReader { ctx: ctx.clone() }
    }
}

/// One statistic; every update is mirrored into the context
pub struct Stat {
    key: String,
    func: Mutex<Box<dyn StatFunction>>,
    ctx: ProcessingContext,
}

impl Stat {
    pub fn key(&self) -> &str {
        &self.key
    }

    fn update(&self, f: impl FnOnce(&mut dyn StatFunction)) {
        let mut func = self.func.lock().unwrap_or_else(|e| e.into_inner());
        f(func.as_mut());
        self.publish(func.value());
    }

    fn publish(&self, value: f64) {
        self.ctx.set_silently(self.key.clone(), value);
    }

    pub fn add_one(&self) {
        self.update(|f| f.add_one());
    }

    pub fn add(&self, value: f64) {
        self.update(|f| f.add(value));
    }

    /// Records an elapsed time in milliseconds
    pub fn add_duration(&self, elapsed: Duration) {
        self.add(elapsed.as_secs_f64() * 1000.0);
    }

    pub fn reset(&self) {
        self.update(|f| f.reset());
    }

    pub fn value(&self) -> f64 {
        self.func.lock().unwrap_or_else(|e| e.into_inner()).value()
    }
}

/// Read access to published statistics
pub struct StatsReader {
    ctx: ProcessingContext,
}

impl StatsReader {
    /// By full key, e.g. `stats.HtmlCrawler.stat.crawled`
    pub fn get(&self, key: &str) -> Option<f64> {
        self.ctx.get::<f64>(key).map(|v| *v)
    }

    pub fn get_in(&self, group: &str, name: &str) -> Option<f64> {
        self.get(&Stats::key(group, name))
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
enum Target {
    Stdout,
    Stderr,
    File(PathBuf),
}

/// Settings of a [`StatsWriter`]
#[derive(Debug, Clone)]
pub struct StatsWriterConfig {
    /// Path, `stdout` or `stderr`
    pub file: String,
    /// Seconds between snapshots; 0 writes only when the chain stops
    pub interval: u64,
    /// Comma-separated key prefixes; empty keeps every key
    pub filter: String,
}

impl StatsWriterConfig {
    pub fn from_params(params: &Params) -> Result<Self> {
        Ok(Self {
            file: params.required("file")?,
            interval: params.optional("interval", 0)?,
            filter: params.optional("filter", String::new())?,
        })
    }
}

/// Attached process writing context values as `key=value` blocks
pub struct StatsWriter {
    config: StatsWriterConfig,
    patterns: Vec<String>,
    target: Mutex<Option<Target>>,
    stop: Mutex<bool>,
    wakeup: Condvar,
}

impl StatsWriter {
    pub fn new(config: StatsWriterConfig) -> Self {
        let patterns = config
            .filter
            .split(',')
            .map(str::trim)
            .filter(|p| !p.is_empty())
            .map(String::from)
            .collect();
        Self {
            config,
            patterns,
            target: Mutex::new(None),
            stop: Mutex::new(false),
            wakeup: Condvar::new(),
        }
    }

    fn selected(&self, key: &str) -> bool {
        self.patterns.is_empty() || self.patterns.iter().any(|p| key.starts_with(p.as_str()))
    }

    /// Renders one snapshot of the selected keys
    pub fn snapshot(&self, ctx: &ProcessingContext) -> String {
        let mut out = String::new();
        out.push_str("=======================================\n");
        out.push_str(&format!(" Stats {}\n", Local::now().format("%Y-%m-%d %H:%M:%S")));
        out.push_str("=======================================\n");
        for key in ctx.keys().into_iter().filter(|k| self.selected(k)) {
            if let Some(value) = ctx.display_value(&key) {
                out.push_str(&format!("{}={}\n", key, value));
            }
        }
        out.push_str("---------------------------------------\n\n");
        out
    }

    fn write_stats(&self, ctx: &ProcessingContext) {
        let target = self.target.lock().unwrap_or_else(|e| e.into_inner()).clone();
        let text = self.snapshot(ctx);
        let result = match target {
            Some(Target::Stdout) => io::stdout().write_all(text.as_bytes()),
            Some(Target::Stderr) => io::stderr().write_all(text.as_bytes()),
            Some(Target::File(path)) => File::create(&path).and_then(|mut f| f.write_all(text.as_bytes())),
            None => return,
        };
        if let Err(e) = result {
            warn!("Failed to write stats: {}", e);
        }
    }
}

impl AttachedProcess for StatsWriter {
    fn name(&self) -> &str {
        "StatsWriter"
    }

    fn post_context(&self, ctx: &ProcessingContext) {
        let target = match self.config.file.as_str() {
            "stdout" => Target::Stdout,
            "stderr" => Target::Stderr,
            file => Target::File(ctx.resolve(file)),
        };
        *self.target.lock().unwrap_or_else(|e| e.into_inner()) = Some(target);
    }

    fn can_start(&self) -> std::result::Result<(), String> {
        if self.config.file.trim().is_empty() {
            Err("no stats file given".to_string())
        } else {
            Ok(())
        }
    }

    fn run(&self, ctx: &ProcessingContext) {
        if self.config.interval == 0 {
            return;
        }
        let interval = Duration::from_secs(self.config.interval);
        let mut stopped = self.stop.lock().unwrap_or_else(|e| e.into_inner());
        loop {
            let (guard, timeout) = self
                .wakeup
                .wait_timeout(stopped, interval)
                .unwrap_or_else(|e| e.into_inner());
            stopped = guard;
            if *stopped {
                break;
            }
            if timeout.timed_out() {
                self.write_stats(ctx);
            }
        }
        debug!("Stats writer finished");
    }

    fn chain_stopped(&self, ctx: &ProcessingContext) {
        self.stop();
        self.write_stats(ctx);
    }

    fn stop(&self) {
        *self.stop.lock().unwrap_or_else(|e| e.into_inner()) = true;
        self.wakeup.notify_all();
    }
}
