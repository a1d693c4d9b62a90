//! Market-group discovery via the Gamma events catalog.
//!
//! Periodically fetches candidate events and distils each into at most
//! one [`MarketGroup`]: negative-risk multi-outcome events contribute the
//! "yes" token of every sub-market, plain binary events contribute both
//! tokens of their single sub-market. A canonical serialization of the
//! group list gates emission, so subscribers only hear about actual
//! changes.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, RwLock};
use std::time::Duration;

use anyhow::{Context, Result};
use serde::Deserialize;
use tokio::sync::Notify;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::events::{EventBus, EventData, EventType};
use crate::types::MarketGroup;

/// Gamma API base URL (Polymarket market catalog).
pub const GAMMA_API_BASE: &str = "https://gamma-api.polymarket.com";

/// Default refresh cadence.
pub const DEFAULT_REFRESH_INTERVAL: Duration = Duration::from_secs(30);

/// Default page size requested from the catalog.
pub const DEFAULT_EVENT_LIMIT: usize = 100;

#[derive(Debug, Clone)]
pub struct DiscoveryConfig {
    pub base_url: String,
    pub tags: Vec<String>,
    pub refresh_interval: Duration,
    pub limit: usize,
}

impl Default for DiscoveryConfig {
    fn default() -> Self {
        Self {
            base_url: GAMMA_API_BASE.to_string(),
            tags: Vec::new(),
            refresh_interval: DEFAULT_REFRESH_INTERVAL,
            limit: DEFAULT_EVENT_LIMIT,
        }
    }
}

// === Gamma API payloads ===

/// Market object nested within an event.
#[derive(Debug, Clone, Deserialize)]
pub struct GammaMarket {
    #[serde(rename = "conditionId")]
    pub condition_id: Option<String>,
    pub question: Option<String>,
    /// JSON-encoded array of two token-id strings.
    #[serde(rename = "clobTokenIds")]
    pub clob_token_ids: Option<String>,
    pub active: Option<bool>,
    pub closed: Option<bool>,
}

/// Top-level event from the `/events` endpoint.
#[derive(Debug, Clone, Deserialize)]
pub struct GammaEvent {
    pub id: Option<String>,
    pub title: Option<String>,
    pub slug: Option<String>,
    #[serde(rename = "negRisk", default)]
    pub neg_risk: Option<bool>,
    pub markets: Option<Vec<GammaMarket>>,
}

pub struct DiscoveryService {
    http: reqwest::Client,
    config: DiscoveryConfig,
    bus: Arc<EventBus>,
    groups: RwLock<Vec<MarketGroup>>,
    last_serialized: Mutex<Option<String>>,
    running: AtomicBool,
    shutdown: Arc<Notify>,
    task: Mutex<Option<JoinHandle<()>>>,
}

impl DiscoveryService {
    pub fn new(config: DiscoveryConfig, bus: Arc<EventBus>) -> Self {
        Self {
            http: reqwest::Client::builder()
                .timeout(Duration::from_secs(10))
                .build()
                .expect("failed to build HTTP client"),
            config,
            bus,
            groups: RwLock::new(Vec::new()),
            last_serialized: Mutex::new(None),
            running: AtomicBool::new(false),
            shutdown: Arc::new(Notify::new()),
            task: Mutex::new(None),
        }
    }

    /// Current group list (full copy).
    pub fn get_market_groups(&self) -> Vec<MarketGroup> {
        self.groups.read().expect("group lock poisoned").clone()
    }

    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::SeqCst)
    }

    /// Fetch immediately, then at the configured interval until `stop`.
    pub fn start(self: &Arc<Self>) {
        if self.running.swap(true, Ordering::SeqCst) {
            return;
        }

        info!(
            "[DISCOVERY] Started (every {} s, tags {:?})",
            self.config.refresh_interval.as_secs(),
            self.config.tags
        );

        let service = Arc::clone(self);
        let handle = tokio::spawn(async move {
            loop {
                service.fetch_and_update().await;
                tokio::select! {
                    _ = tokio::time::sleep(service.config.refresh_interval) => {}
                    _ = service.shutdown.notified() => break,
                }
                if !service.running.load(Ordering::SeqCst) {
                    break;
                }
            }
            debug!("[DISCOVERY] Refresh loop exited");
        });

        *self.task.lock().expect("task lock poisoned") = Some(handle);
    }

    pub async fn stop(&self) {
        if !self.running.swap(false, Ordering::SeqCst) {
            return;
        }
        // notify_one stores a permit, so a stop issued mid-fetch still
        // lands once the loop reaches its select
        self.shutdown.notify_one();
        let handle = self.task.lock().expect("task lock poisoned").take();
        if let Some(handle) = handle {
            let _ = handle.await;
        }
        info!("[DISCOVERY] Stopped");
    }

    /// One refresh pass: fetch the catalog and apply it. Network failures
    /// are logged and leave the previous state untouched.
    pub async fn fetch_and_update(&self) {
        match self.fetch_events().await {
            Ok(events) => self.apply_events(events).await,
            Err(e) => warn!("[DISCOVERY] Catalog fetch failed: {:#}", e),
        }
    }

    /// Distil an event list into groups and emit `market_groups_updated`
    /// if the canonical serialization changed. Exposed so tests can drive
    /// the pipeline without a live catalog.
    pub async fn apply_events(&self, events: Vec<GammaEvent>) {
        let groups: Vec<MarketGroup> = events.iter().filter_map(extract_group).collect();
        let serialized = canonical_serialization(&groups);

        let changed = {
            let mut last = self.last_serialized.lock().expect("serialization lock poisoned");
            if last.as_deref() == Some(serialized.as_str()) {
                false
            } else {
                *last = Some(serialized);
                true
            }
        };

        if !changed {
            debug!("[DISCOVERY] No change in {} group(s)", groups.len());
            return;
        }

        info!("[DISCOVERY] Market groups updated: {} group(s)", groups.len());
        *self.groups.write().expect("group lock poisoned") = groups.clone();
        self.bus
            .emit(EventType::MarketGroupsUpdated, EventData::MarketGroups(groups))
            .await;
    }

    async fn fetch_events(&self) -> Result<Vec<GammaEvent>> {
        let mut url = format!(
            "{}/events?closed=false&active=true&limit={}",
            self.config.base_url, self.config.limit
        );
        for tag in &self.config.tags {
            url.push_str("&tag=");
            url.push_str(tag);
        }

        let response = self
            .http
            .get(&url)
            .send()
            .await
            .context("gamma request failed")?;

        if !response.status().is_success() {
            anyhow::bail!("gamma API returned status {}", response.status());
        }

        let events: Vec<GammaEvent> = response.json().await.context("gamma response decode")?;
        debug!("[DISCOVERY] Fetched {} event(s)", events.len());
        Ok(events)
    }
}

/// Extract zero or one market group from a catalog event.
///
/// Negative-risk events with at least two sub-markets contribute the
/// first ("yes") token of each sub-market; otherwise a single binary
/// sub-market with exactly two tokens contributes both. Anything else is
/// skipped, as are sub-markets with unparseable token payloads.
fn extract_group(event: &GammaEvent) -> Option<MarketGroup> {
    let markets = event.markets.as_deref().unwrap_or(&[]);

    if event.neg_risk == Some(true) && markets.len() >= 2 {
        let token_ids: Vec<String> = markets
            .iter()
            .filter_map(|m| parse_token_ids(m.clob_token_ids.as_deref()).into_iter().next())
            .collect();
        if token_ids.len() < 2 {
            return None;
        }
        let condition_id = event.id.clone().or_else(|| event.slug.clone())?;
        return Some(MarketGroup::new(condition_id, token_ids));
    }

    if markets.len() == 1 {
        let tokens = parse_token_ids(markets[0].clob_token_ids.as_deref());
        if tokens.len() == 2 {
            let condition_id = markets[0].condition_id.clone()?;
            return Some(MarketGroup::new(condition_id, tokens));
        }
    }

    None
}

/// Decode the JSON-string-encoded token-id array. Malformed payloads
/// decode as empty.
fn parse_token_ids(raw: Option<&str>) -> Vec<String> {
    raw.and_then(|s| serde_json::from_str(s).ok()).unwrap_or_default()
}

/// Lexicographically sorted `condition_id:joined_token_ids` entries.
fn canonical_serialization(groups: &[MarketGroup]) -> String {
    let mut entries: Vec<String> = groups
        .iter()
        .map(|g| format!("{}:{}", g.condition_id, g.token_ids.join(",")))
        .collect();
    entries.sort();
    entries.join(";")
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;

    fn market(condition_id: &str, tokens: &str) -> GammaMarket {
        GammaMarket {
            condition_id: Some(condition_id.to_string()),
            question: Some("Test?".to_string()),
            clob_token_ids: Some(tokens.to_string()),
            active: Some(true),
            closed: Some(false),
        }
    }

    fn event(id: &str, neg_risk: bool, markets: Vec<GammaMarket>) -> GammaEvent {
        GammaEvent {
            id: Some(id.to_string()),
            title: Some("Event".to_string()),
            slug: Some(format!("slug-{}", id)),
            neg_risk: Some(neg_risk),
            markets: Some(markets),
        }
    }

    fn service() -> (Arc<DiscoveryService>, Arc<EventBus>, Arc<AtomicUsize>) {
        let bus = Arc::new(EventBus::new());
        let emissions = Arc::new(AtomicUsize::new(0));
        let counter = emissions.clone();
        bus.on(EventType::MarketGroupsUpdated, move |_event| {
            let counter = counter.clone();
            async move {
                counter.fetch_add(1, Ordering::SeqCst);
                Ok(())
            }
        });
        let service = Arc::new(DiscoveryService::new(DiscoveryConfig::default(), bus.clone()));
        (service, bus, emissions)
    }

    #[test]
    fn test_neg_risk_event_uses_first_token_per_market() {
        let ev = event(
            "ev1",
            true,
            vec![
                market("c1", r#"["a_yes","a_no"]"#),
                market("c2", r#"["b_yes","b_no"]"#),
                market("c3", r#"["c_yes","c_no"]"#),
            ],
        );

        let group = extract_group(&ev).expect("group extracted");
        assert_eq!(group.condition_id, "ev1");
        assert_eq!(group.token_ids, vec!["a_yes", "b_yes", "c_yes"]);
    }

    #[test]
    fn test_binary_event_uses_both_tokens() {
        let ev = event("ev1", false, vec![market("c1", r#"["yes","no"]"#)]);

        let group = extract_group(&ev).expect("group extracted");
        assert_eq!(group.condition_id, "c1");
        assert_eq!(group.token_ids, vec!["yes", "no"]);
    }

    #[test]
    fn test_neg_risk_single_market_falls_through_to_binary() {
        let ev = event("ev1", true, vec![market("c1", r#"["yes","no"]"#)]);

        let group = extract_group(&ev).expect("binary path should apply");
        assert_eq!(group.condition_id, "c1");
        assert_eq!(group.token_ids.len(), 2);
    }

    #[test]
    fn test_malformed_token_payload_contributes_nothing() {
        let ev = event(
            "ev1",
            true,
            vec![
                market("c1", "not-json"),
                market("c2", r#"["b_yes","b_no"]"#),
                market("c3", r#"["c_yes","c_no"]"#),
            ],
        );

        let group = extract_group(&ev).expect("remaining markets still form a group");
        assert_eq!(group.token_ids, vec!["b_yes", "c_yes"]);
    }

    #[test]
    fn test_all_malformed_yields_no_group() {
        let ev = event(
            "ev1",
            true,
            vec![market("c1", "oops"), market("c2", "{broken")],
        );
        assert!(extract_group(&ev).is_none());
    }

    #[test]
    fn test_multi_market_without_neg_risk_is_skipped() {
        let ev = event(
            "ev1",
            false,
            vec![
                market("c1", r#"["a_yes","a_no"]"#),
                market("c2", r#"["b_yes","b_no"]"#),
            ],
        );
        assert!(extract_group(&ev).is_none());
    }

    #[test]
    fn test_canonical_serialization_is_order_independent() {
        let g1 = MarketGroup::new("c1", vec!["a".into(), "b".into()]);
        let g2 = MarketGroup::new("c2", vec!["x".into(), "y".into()]);

        let fwd = canonical_serialization(&[g1.clone(), g2.clone()]);
        let rev = canonical_serialization(&[g2, g1]);
        assert_eq!(fwd, rev);
    }

    #[tokio::test]
    async fn test_same_catalog_emits_once() {
        let (service, _bus, emissions) = service();

        let events = vec![event("ev1", false, vec![market("c1", r#"["yes","no"]"#)])];
        service.apply_events(events.clone()).await;
        service.apply_events(events).await;

        assert_eq!(emissions.load(Ordering::SeqCst), 1);
        assert_eq!(service.get_market_groups().len(), 1);
    }

    #[tokio::test]
    async fn test_changed_catalog_emits_again() {
        let (service, _bus, emissions) = service();

        service
            .apply_events(vec![event("ev1", false, vec![market("c1", r#"["yes","no"]"#)])])
            .await;
        service
            .apply_events(vec![event("ev2", false, vec![market("c2", r#"["y2","n2"]"#)])])
            .await;

        assert_eq!(emissions.load(Ordering::SeqCst), 2);
        assert_eq!(service.get_market_groups()[0].condition_id, "c2");
    }

    #[test]
    fn test_groups_always_have_two_or_more_tokens() {
        let events = vec![
            event("ev1", true, vec![market("c1", r#"["a"]"#), market("c2", "bad")]),
            event("ev2", false, vec![market("c3", r#"["only_one"]"#)]),
            event("ev3", false, vec![market("c4", r#"["yes","no"]"#)]),
        ];

        let groups: Vec<MarketGroup> = events.iter().filter_map(extract_group).collect();
        assert!(groups.iter().all(|g| g.token_ids.len() >= 2));
        assert_eq!(groups.len(), 1);
    }
}
