use log::debug;
use regex::Regex;
use std::time::Duration;
use url::Url;

const WILDCARD: &str = "*";

/// One allow or disallow path rule
#[derive(Debug, Clone)]
struct Rule {
    path: String,
    /// Compiled form for rules containing `*`, where `*` stands for a run of
    /// non-`/` characters
    wildcard: Option<Regex>,
}

impl Rule {
    fn new(path: &str) -> Self {
        let wildcard = if path.contains('*') {
            let pattern = path
                .split('*')
                .map(regex::escape)
                .collect::<Vec<_>>()
                .join("[^/]+");
            Regex::new(&format!("^{}", pattern)).ok()
        } else {
            None
        };
        Self {
            path: path.to_string(),
            wildcard,
        }
    }

    fn matches(&self, path: &str) -> bool {
        path.starts_with(&self.path) || self.wildcard.as_ref().map_or(false, |re| re.is_match(path))
    }
}

/// Robots exclusion policy of one host, as seen by one user agent
#[derive(Debug, Clone, Default)]
pub struct RobotsPolicy {
    allows: Vec<Rule>,
    disallows: Vec<Rule>,
    /// Seconds
    crawl_delay: Option<f64>,
}

impl RobotsPolicy {
    /// Policy permitting everything, used when a host has no readable policy
    pub fn allow_all() -> Self {
        Self::default()
    }

    /// Parses a robots file for `user_agent`.
    ///
    /// Wildcard-agent rules apply until a block naming this agent is found;
    /// after that only wildcard allows are merged in. Unknown fields and
    /// malformed lines are skipped.
    pub fn parse(content: &str, user_agent: &str) -> Self {
        let mut policy = Self::default();
        let agent = user_agent.to_lowercase();
        let token = agent.split('/').next().unwrap_or("").trim().to_string();

        // agents of the group being read, and whether its rules started
        let mut group: Vec<String> = Vec::new();
        let mut in_rules = false;
        let mut found_specific = false;

        for line in content.lines() {
            let line = match line.find('#') {
                Some(i) => &line[..i],
                None => line,
            };
            let (field, value) = match line.split_once(':') {
                Some((f, v)) => (f.trim().to_lowercase(), v.trim()),
                None => continue,
            };

            if field == "user-agent" {
                if in_rules {
                    group.clear();
                    in_rules = false;
                }
                group.push(value.to_lowercase());
                continue;
            }
            in_rules = true;

            let specific = group
                .iter()
                .any(|a| a != WILDCARD && (*a == agent || *a == token));
            let general = group.iter().any(|a| a == WILDCARD);
            if specific {
                found_specific = true;
            } else if !general {
                continue;
            }
            let wildcard_only = !specific;

            match field.as_str() {
                "disallow" if !value.is_empty() => {
                    if !(wildcard_only && found_specific) {
                        policy.disallows.push(Rule::new(value));
                    }
                }
                "allow" if !value.is_empty() => policy.allows.push(Rule::new(value)),
                "crawl-delay" => {
                    if !(wildcard_only && found_specific) {
                        match value.parse::<f64>() {
                            Ok(delay) if delay >= 0.0 => policy.crawl_delay = Some(delay),
                            _ => debug!("Ignoring invalid crawl delay '{}'", value),
                        }
                    }
                }
                _ => {}
            }
        }
        policy
    }

    pub fn allows(&self, path: &str) -> bool {
        !self.disallows(path)
    }

    /// True when a disallow rule matches and no allow rule does
    pub fn disallows(&self, path: &str) -> bool {
        if self.allows_all() {
            return false;
        }
        let path = if path.starts_with('/') {
            path.to_string()
        } else {
            format!("/{}", path)
        };
        self.disallows.iter().any(|r| r.matches(&path)) && !self.allows.iter().any(|r| r.matches(&path))
    }

    pub fn allows_all(&self) -> bool {
        self.disallows.is_empty()
    }

    /// Delay advertised by the policy, if any
    pub fn crawl_delay_millis(&self) -> Option<u64> {
        self.crawl_delay.map(|secs| (secs * 1000.0) as u64)
    }
}

/// Location of a host's policy file
pub fn robots_url(base: &Url) -> Option<Url> {
    base.join("/robots.txt").ok()
}

/// Spacing between two requests to a host: the host's configured delay, or
/// else the advertised one, but never less than the global floor
pub fn effective_delay(floor: Duration, host_delay_ms: Option<u64>, policy: &RobotsPolicy) -> Duration {
    let delay = host_delay_ms.or_else(|| policy.crawl_delay_millis()).unwrap_or(0);
    floor.max(Duration::from_millis(delay))
}
