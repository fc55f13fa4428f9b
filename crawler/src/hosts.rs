//! Registry of configured hosts and their URL patterns.

use crate::db::Database;
use crate::error::{CrawlError, Result};
use crate::models::{EntityDescriptor, HostDescriptor, UrlEntry};
use crate::urls;
use log::{error, info};
use regex::Regex;
use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;
use url::Url;

/// Result of classifying a relative URL against a host's patterns
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct PatternMatch<'a> {
    /// The pattern as configured
    pub pattern: &'a str,
    /// Set when the pattern belongs to an entity
    pub entity: Option<&'a EntityDescriptor>,
    pub update_freq: u32,
}

impl PatternMatch<'_> {
    pub fn is_entity(&self) -> bool {
        self.entity.is_some()
    }
}

/// A configured host with its id and compiled patterns
#[derive(Debug)]
pub struct RegisteredHost {
    pub id: i64,
    /// Normalized scheme and authority, e.g. `http://example.com/`
    pub address: String,
    pub base: Url,
    pub descriptor: HostDescriptor,
    /// Compiled entity patterns, as indices into `descriptor.entities`
    entities: Vec<(Regex, usize)>,
    /// Compiled source patterns, as indices into `descriptor.sources`
    sources: Vec<(Regex, usize)>,
}

fn compile(pattern: &str) -> std::result::Result<Regex, regex::Error> {
    Regex::new(&format!("^(?:{})$", pattern))
}

impl RegisteredHost {
    fn new(id: i64, address: String, base: Url, descriptor: HostDescriptor) -> Result<Self> {
        let invalid = |pattern: &str, e: regex::Error| {
            CrawlError::Config(format!("invalid pattern '{}' for {}: {}", pattern, address, e))
        };
        let mut entities = Vec::with_capacity(descriptor.entities.len());
        for (i, entity) in descriptor.entities.iter().enumerate() {
            entities.push((compile(&entity.pattern).map_err(|e| invalid(&entity.pattern, e))?, i));
        }
        let mut sources = Vec::with_capacity(descriptor.sources.len());
        for (i, source) in descriptor.sources.iter().enumerate() {
            sources.push((compile(&source.pattern).map_err(|e| invalid(&source.pattern, e))?, i));
        }
        Ok(Self {
            id,
            address,
            base,
            descriptor,
            entities,
            sources,
        })
    }

    /// First matching pattern for a path and query. Entity patterns are
    /// tried before source patterns, each in declaration order.
    pub fn get_pattern(&self, relative: &str) -> Option<PatternMatch<'_>> {
        let entity = self
            .entities
            .iter()
            .find(|(re, _)| re.is_match(relative))
            .map(|(_, i)| {
                let entity = &self.descriptor.entities[*i];
                PatternMatch {
                    pattern: &entity.pattern,
                    entity: Some(entity),
                    update_freq: entity.update_freq,
                }
            });
        entity.or_else(|| {
            self.sources
                .iter()
                .find(|(re, _)| re.is_match(relative))
                .map(|(_, i)| {
                    let source = &self.descriptor.sources[*i];
                    PatternMatch {
                        pattern: &source.pattern,
                        entity: None,
                        update_freq: source.update_freq,
                    }
                })
        })
    }

    pub fn entity_descriptor(&self, pattern: &str) -> Option<&EntityDescriptor> {
        self.descriptor.entities.iter().find(|e| e.pattern == pattern)
    }

    /// New URL entry for a path and query, if any pattern matches it
    pub fn classify(&self, relative: &str) -> Option<UrlEntry> {
        self.get_pattern(relative).map(|m| {
            let mut entry = UrlEntry::new(self.id, relative, m.update_freq, m.is_entity(), m.pattern);
            entry.host = self.address.clone();
            entry
        })
    }

    /// True when `url` has this host's scheme, host and port
    pub fn is_same_host(&self, url: &Url) -> bool {
        urls::full_host(url) == self.address
    }

    /// Sum of the entity weights
    pub fn total_weight(&self) -> u32 {
        self.descriptor.entities.iter().map(|e| e.weight).sum()
    }
}

/// Hosts by id and address
pub struct HostRegistry {
    db: Database,
    hosts: BTreeMap<i64, Arc<RegisteredHost>>,
    ids: HashMap<String, i64>,
}

impl HostRegistry {
    /// Registers the descriptors, creating store rows for unseen hosts.
    /// Descriptors with an invalid base URL or pattern are skipped.
    pub fn load(db: Database, descriptors: &[HostDescriptor]) -> Result<Self> {
        let mut registry = Self {
            db,
            hosts: BTreeMap::new(),
            ids: HashMap::new(),
        };
        for descriptor in descriptors {
            let base = match urls::normalize(&descriptor.base_url) {
                Ok(base) => base,
                Err(e) => {
                    error!("Skipping host '{}': {}", descriptor.name, e);
                    continue;
                }
            };
            let address = urls::full_host(&base);
            let id = registry.db.add_host(&address)?;
            match RegisteredHost::new(id, address.clone(), base, descriptor.clone()) {
                Ok(host) => {
                    registry.ids.insert(address, id);
                    registry.hosts.insert(id, Arc::new(host));
                }
                Err(e) => error!("Skipping host '{}': {}", descriptor.name, e),
            }
        }
        info!("Loaded {} hosts", registry.hosts.len());
        Ok(registry)
    }

    pub fn database(&self) -> &Database {
        &self.db
    }

    pub fn host_ids(&self) -> Vec<i64> {
        self.hosts.keys().copied().collect()
    }

    pub fn host(&self, id: i64) -> Option<&RegisteredHost> {
        self.hosts.get(&id).map(|h| h.as_ref())
    }

    /// Shared handle to a host, for its crawler threads
    pub fn shared_host(&self, id: i64) -> Option<Arc<RegisteredHost>> {
        self.hosts.get(&id).cloned()
    }

    pub fn hosts(&self) -> impl Iterator<Item = &RegisteredHost> {
        self.hosts.values().map(|h| h.as_ref())
    }

    pub fn len(&self) -> usize {
        self.hosts.len()
    }

    pub fn is_empty(&self) -> bool {
        self.hosts.is_empty()
    }

    /// Id of a normalized host address
    pub fn host_id(&self, address: &str) -> Option<i64> {
        self.ids.get(address).copied()
    }

    /// Configured host serving `url`
    pub fn host_for(&self, url: &Url) -> Option<&RegisteredHost> {
        self.host_id(&urls::full_host(url)).and_then(|id| self.host(id))
    }

    pub fn get_pattern(&self, host_id: i64, relative: &str) -> Option<PatternMatch<'_>> {
        self.host(host_id)?.get_pattern(relative)
    }

    pub fn entity_descriptor(&self, host_id: i64, pattern: &str) -> Option<&EntityDescriptor> {
        self.host(host_id)?.entity_descriptor(pattern)
    }

    /// Every host known to the store as `(id, address)`, configured or not
    pub fn list_hosts(&self) -> Result<Vec<(i64, String)>> {
        self.db.list_hosts()
    }

    /// Drops a host with its URLs from the store and the registry
    pub fn remove_host(&mut self, host_id: i64) -> Result<usize> {
        if let Some(host) = self.hosts.remove(&host_id) {
            self.ids.remove(&host.address);
        }
        self.db.remove_host(host_id)
    }

    /// Drops every host and URL
    pub fn reset(&mut self) -> Result<usize> {
        self.hosts.clear();
        self.ids.clear();
        self.db.reset()
    }
}
