//! Filter chain rules for one collectd-backed monitor instance.
//!
//! Every instance owns one dispatch rule in the shared post-cache chain and
//! one `MetricFilters_<id>` chain. The dispatch rule matches the instance's
//! plugin and plugin instance, tags the value list with the monitor ID and
//! jumps into the instance chain. The instance chain returns on the first
//! allow-list match and otherwise stops, dropping the value list.

use crate::error::{CollectdError, Result};
use std::fmt::Write;
use telemon_common::types::MonitorId;

/// Metadata key carrying the owning monitor's ID on every value list.
pub const MONITOR_ID_META: &str = "monitorID";

/// Name of the shared post-cache dispatch chain.
pub const DISPATCH_CHAIN: &str = "PostCache";

/// One allow-list entry: a collectd type plus an optional type instance.
///
/// Written as `type` or `type.type_instance` in monitor configs, matching
/// the metric names produced for collectd data (`gauge.used_memory`).
/// A type instance of `*` is the same as leaving it out.
///
/// # Examples
///
/// ```
/// use telemon_collectd::rules::MetricMatcher;
///
/// let m: MetricMatcher = "gauge.used_memory".parse().unwrap();
/// assert_eq!(m.type_name, "gauge");
/// assert_eq!(m.type_instance.as_deref(), Some("used_memory"));
///
/// let any: MetricMatcher = "counter.*".parse().unwrap();
/// assert_eq!(any.type_instance, None);
/// ```
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord)]
pub struct MetricMatcher {
    pub type_name: String,
    pub type_instance: Option<String>,
}

impl std::str::FromStr for MetricMatcher {
    type Err = CollectdError;

    fn from_str(s: &str) -> Result<Self> {
        let s = s.trim();
        let (type_name, type_instance) = match s.split_once('.') {
            Some((t, ti)) => (t, Some(ti)),
            None => (s, None),
        };
        if type_name.is_empty() {
            return Err(CollectdError::InvalidRule(format!(
                "empty collectd type in '{s}'"
            )));
        }
        let type_instance = match type_instance {
            None | Some("*") => None,
            Some("") => {
                return Err(CollectdError::InvalidRule(format!(
                    "empty type instance in '{s}'"
                )))
            }
            Some(ti) => Some(ti.to_string()),
        };
        Ok(Self {
            type_name: type_name.to_string(),
            type_instance,
        })
    }
}

/// Parses a monitor's `metrics_to_include` list into matchers, sorted and
/// deduplicated so the rendered chain does not depend on config order.
pub fn parse_allow_list(entries: &[String]) -> Result<Vec<MetricMatcher>> {
    let mut matchers = entries
        .iter()
        .map(|e| e.parse::<MetricMatcher>())
        .collect::<Result<Vec<_>>>()?;
    matchers.sort();
    matchers.dedup();
    Ok(matchers)
}

/// The rules owned by one monitor instance.
#[derive(Debug, Clone, PartialEq)]
pub struct FilterChain {
    pub monitor_id: MonitorId,
    /// collectd plugin emitting this instance's values (e.g. `"redis"`).
    pub plugin: String,
    /// `None` lets every metric through; `Some` drops anything not listed.
    pub allow: Option<Vec<MetricMatcher>>,
}

impl FilterChain {
    pub fn chain_name(&self) -> String {
        format!("MetricFilters_{}", self.monitor_id)
    }

    /// The jump rule placed in the shared dispatch chain.
    pub fn render_dispatch_rule(&self) -> String {
        let id = self.monitor_id.as_str();
        let mut out = String::new();
        let _ = writeln!(out, "  <Rule {}>", quote(&format!("dispatch_{id}")));
        out.push_str("    <Match \"regex\">\n");
        let _ = writeln!(out, "      Plugin {}", quote(&anchored(&self.plugin)));
        let _ = writeln!(out, "      PluginInstance {}", quote(&anchored(id)));
        out.push_str("    </Match>\n");
        out.push_str("    <Target \"set\">\n");
        let _ = writeln!(out, "      MetaData {} {}", quote(MONITOR_ID_META), quote(id));
        out.push_str("    </Target>\n");
        out.push_str("    <Target \"jump\">\n");
        let _ = writeln!(out, "      Chain {}", quote(&self.chain_name()));
        out.push_str("    </Target>\n");
        out.push_str("  </Rule>\n");
        out
    }

    /// The instance's own chain block.
    pub fn render_chain(&self) -> String {
        let mut out = String::new();
        let _ = writeln!(out, "<Chain {}>", quote(&self.chain_name()));
        match &self.allow {
            None => out.push_str("  Target \"return\"\n"),
            Some(matchers) => {
                for (i, m) in matchers.iter().enumerate() {
                    let _ = writeln!(out, "  <Rule {}>", quote(&format!("include_{i}")));
                    out.push_str("    <Match \"regex\">\n");
                    let _ = writeln!(out, "      Type {}", quote(&anchored(&m.type_name)));
                    if let Some(ti) = &m.type_instance {
                        let _ = writeln!(out, "      TypeInstance {}", quote(&anchored(ti)));
                    }
                    out.push_str("    </Match>\n");
                    out.push_str("    Target \"return\"\n");
                    out.push_str("  </Rule>\n");
                }
                out.push_str("  Target \"stop\"\n");
            }
        }
        out.push_str("</Chain>\n");
        out
    }
}

/// Quotes a string for the collectd config grammar.
pub fn quote(s: &str) -> String {
    let escaped = s.replace('\\', "\\\\").replace('"', "\\\"");
    format!("\"{escaped}\"")
}

fn anchored(literal: &str) -> String {
    format!("^{}$", regex::escape(literal))
}
