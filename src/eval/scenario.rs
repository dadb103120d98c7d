use std::{
    collections::{BTreeMap, HashSet},
    fmt, fs,
    path::Path,
    str::FromStr,
};

use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use crate::{error::EvalError, eval::phase::Phase};

/// Closed set of scripted customer issues.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum ScenarioId {
    Late,
    Miss,
    Quality,
    Wrong,
    Payment,
    Address,
    Cold,
    Track,
}

// Checked in order; the first scenario with a matching keyword wins.
const INFERENCE_KEYWORDS: [(ScenarioId, &[&str]); 8] = [
    (ScenarioId::Track, &["track", "where", "status"]),
    (ScenarioId::Late, &["late", "delayed"]),
    (ScenarioId::Miss, &["missing", "didn't get", "did not get"]),
    (ScenarioId::Wrong, &["wrong", "not what i ordered"]),
    (ScenarioId::Payment, &["payment", "charge", "billing"]),
    (ScenarioId::Address, &["address"]),
    (ScenarioId::Cold, &["cold", "not hot"]),
    (ScenarioId::Quality, &["bad", "stale", "quality"]),
];

impl ScenarioId {
    pub const ALL: [ScenarioId; 8] = [
        ScenarioId::Late,
        ScenarioId::Miss,
        ScenarioId::Quality,
        ScenarioId::Wrong,
        ScenarioId::Payment,
        ScenarioId::Address,
        ScenarioId::Cold,
        ScenarioId::Track,
    ];

    pub fn as_str(self) -> &'static str {
        match self {
            ScenarioId::Late => "LATE",
            ScenarioId::Miss => "MISS",
            ScenarioId::Quality => "QUALITY",
            ScenarioId::Wrong => "WRONG",
            ScenarioId::Payment => "PAYMENT",
            ScenarioId::Address => "ADDRESS",
            ScenarioId::Cold => "COLD",
            ScenarioId::Track => "TRACK",
        }
    }

    pub fn default_resolution(self) -> ResolutionType {
        match self {
            ScenarioId::Late => ResolutionType::Credit,
            ScenarioId::Miss | ScenarioId::Quality => ResolutionType::Refund,
            ScenarioId::Wrong => ResolutionType::Replacement,
            ScenarioId::Payment => ResolutionType::Escalation,
            ScenarioId::Address => ResolutionType::AddressUpdate,
            ScenarioId::Cold => ResolutionType::Complaint,
            ScenarioId::Track => ResolutionType::StatusUpdate,
        }
    }

    /// Guess the scenario from free customer text.
    pub fn infer(text: &str) -> Option<ScenarioId> {
        let lowered = text.to_lowercase().replace('\u{2019}', "'");
        INFERENCE_KEYWORDS
            .iter()
            .find(|(_, keywords)| keywords.iter().any(|kw| lowered.contains(kw)))
            .map(|(id, _)| *id)
    }

    fn closest(given: &str) -> Option<ScenarioId> {
        ScenarioId::ALL
            .iter()
            .map(|id| (*id, strsim::levenshtein(given, id.as_str())))
            .min_by_key(|(_, distance)| *distance)
            .filter(|(_, distance)| *distance <= 2)
            .map(|(id, _)| id)
    }
}

impl fmt::Display for ScenarioId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UnknownScenarioId {
    pub given: String,
    pub suggestion: Option<ScenarioId>,
}

impl fmt::Display for UnknownScenarioId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "unknown scenario id `{}`", self.given)?;
        if let Some(suggestion) = self.suggestion {
            write!(f, " (did you mean `{suggestion}`?)")?;
        }
        Ok(())
    }
}

impl std::error::Error for UnknownScenarioId {}

impl FromStr for ScenarioId {
    type Err = UnknownScenarioId;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let wanted = s.trim().to_uppercase();
        ScenarioId::ALL
            .iter()
            .copied()
            .find(|id| id.as_str() == wanted)
            .ok_or_else(|| UnknownScenarioId {
                given: s.to_string(),
                suggestion: ScenarioId::closest(&wanted),
            })
    }
}

/// The kind of remedy a scenario is expected to end with.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ResolutionType {
    Credit,
    Refund,
    Replacement,
    Escalation,
    AddressUpdate,
    Complaint,
    StatusUpdate,
}

impl ResolutionType {
    pub const ALL: [ResolutionType; 7] = [
        ResolutionType::Credit,
        ResolutionType::Refund,
        ResolutionType::Replacement,
        ResolutionType::Escalation,
        ResolutionType::AddressUpdate,
        ResolutionType::Complaint,
        ResolutionType::StatusUpdate,
    ];

    pub fn as_str(self) -> &'static str {
        match self {
            ResolutionType::Credit => "credit",
            ResolutionType::Refund => "refund",
            ResolutionType::Replacement => "replacement",
            ResolutionType::Escalation => "escalation",
            ResolutionType::AddressUpdate => "address_update",
            ResolutionType::Complaint => "complaint",
            ResolutionType::StatusUpdate => "status_update",
        }
    }

    /// Word-start stems that count as delivering this remedy.
    pub fn keywords(self) -> &'static [&'static str] {
        match self {
            ResolutionType::Credit => &["credit", "voucher", "compensat"],
            ResolutionType::Refund => &["refund", "money back", "reimburs"],
            ResolutionType::Replacement => &["replacement", "replace", "reship", "resend", "new order"],
            ResolutionType::Escalation => &["escalat", "billing team", "specialist"],
            ResolutionType::AddressUpdate => &["address", "reroute", "redirect"],
            ResolutionType::Complaint => &["complaint", "report", "flagged", "feedback"],
            ResolutionType::StatusUpdate => &["out for delivery", "on its way", "arriv", "eta", "track"],
        }
    }
}

/// Synthetic order data a scenario is grounded on.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct OrderRecord {
    pub order_id: String,
    pub status: String,
    #[serde(default)]
    pub items: Vec<String>,
    pub eta: String,
}

/// Read-only source of order records.
pub trait OrderStore: Send + Sync {
    fn order(&self, order_id: &str) -> Option<OrderRecord>;
}

#[derive(Debug, Clone, Default)]
pub struct InMemoryOrderStore {
    orders: BTreeMap<String, OrderRecord>,
}

impl InMemoryOrderStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Fails with the duplicated id when an order is listed twice.
    pub fn from_orders(orders: Vec<OrderRecord>) -> Result<Self, String> {
        let mut store = Self::new();
        for order in orders {
            if store.orders.contains_key(&order.order_id) {
                return Err(order.order_id);
            }
            store.orders.insert(order.order_id.clone(), order);
        }
        Ok(store)
    }

    pub fn len(&self) -> usize {
        self.orders.len()
    }

    pub fn is_empty(&self) -> bool {
        self.orders.is_empty()
    }
}

impl OrderStore for InMemoryOrderStore {
    fn order(&self, order_id: &str) -> Option<OrderRecord> {
        self.orders.get(order_id).cloned()
    }
}

/// Canned agent replies for offline runs.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReplayScript {
    #[serde(default)]
    pub gathering: Option<String>,
    #[serde(default)]
    pub resolution: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Scenario {
    pub id: ScenarioId,
    pub order: OrderRecord,
    pub trigger: String,
    pub policy: String,
    pub resolution: ResolutionType,
    pub gathering_references: Vec<String>,
    pub resolution_user_message: String,
    pub resolution_references: Vec<String>,
    pub replay: Option<ReplayScript>,
}

impl Scenario {
    /// Opening customer message of the GATHERING turn.
    pub fn gathering_prompt(&self) -> String {
        format!("{} (My order ID is {}).", self.trigger, self.order.order_id)
    }

    pub fn user_message(&self, phase: Phase) -> String {
        match phase {
            Phase::Gathering => self.gathering_prompt(),
            Phase::Resolution => self.resolution_user_message.clone(),
        }
    }

    pub fn references(&self, phase: Phase) -> &[String] {
        match phase {
            Phase::Gathering => &self.gathering_references,
            Phase::Resolution => &self.resolution_references,
        }
    }
}

/// One user/agent exchange, labelled with the phase it was scripted for.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConversationTurn {
    pub index: usize,
    pub user_message: String,
    pub agent_response: String,
    pub phase: Phase,
}

#[derive(Debug, Deserialize)]
struct CatalogFile {
    #[serde(default)]
    orders: Vec<OrderRecord>,
    scenarios: Vec<ScenarioEntry>,
}

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
struct ScenarioEntry {
    id: String,
    trigger: String,
    order_id: String,
    policy: String,
    #[serde(default)]
    resolution: Option<ResolutionType>,
    gathering: GatheringEntry,
    resolution_turn: ResolutionEntry,
    #[serde(default)]
    replay: Option<ReplayScript>,
}

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
struct GatheringEntry {
    references: Vec<String>,
}

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
struct ResolutionEntry {
    user: String,
    references: Vec<String>,
}

/// Validated, immutable set of scenarios loaded once per run.
#[derive(Debug, Clone)]
pub struct ScenarioCatalog {
    scenarios: Vec<Scenario>,
}

impl ScenarioCatalog {
    pub fn load(path: impl AsRef<Path>) -> Result<Self, EvalError> {
        let path = path.as_ref();
        let raw = fs::read_to_string(path).map_err(|err| {
            EvalError::MalformedScenarioConfig(format!("{}: {err}", path.display()))
        })?;
        Self::from_yaml_str(&raw)
    }

    /// Parse a catalog whose orders are listed inline under `orders:`.
    pub fn from_yaml_str(yaml: &str) -> Result<Self, EvalError> {
        let file = parse_catalog(yaml)?;
        let store = InMemoryOrderStore::from_orders(file.orders).map_err(|id| {
            EvalError::MalformedScenarioConfig(format!("duplicate order id `{id}`"))
        })?;
        Self::resolve(file.scenarios, &store)
    }

    /// Parse a catalog whose orders come from an external store. Inline
    /// orders, if any, are ignored.
    pub fn from_yaml_str_with_store(yaml: &str, store: &dyn OrderStore) -> Result<Self, EvalError> {
        let file = parse_catalog(yaml)?;
        if !file.orders.is_empty() {
            warn!(count = file.orders.len(), "ignoring inline orders, using external order store");
        }
        Self::resolve(file.scenarios, store)
    }

    fn resolve(entries: Vec<ScenarioEntry>, store: &dyn OrderStore) -> Result<Self, EvalError> {
        let malformed = |message: String| EvalError::MalformedScenarioConfig(message);
        let mut seen = HashSet::new();
        let mut scenarios = Vec::with_capacity(entries.len());

        for entry in entries {
            let id = ScenarioId::from_str(&entry.id).map_err(|err| malformed(err.to_string()))?;
            if !seen.insert(id) {
                return Err(malformed(format!("duplicate scenario id `{id}`")));
            }
            if entry.trigger.trim().is_empty() {
                return Err(malformed(format!("{id}: trigger must not be empty")));
            }
            if entry.policy.trim().is_empty() {
                return Err(malformed(format!("{id}: policy must not be empty")));
            }
            if entry.resolution_turn.user.trim().is_empty() {
                return Err(malformed(format!("{id}: resolution_turn.user must not be empty")));
            }
            check_references(id, "gathering", &entry.gathering.references)?;
            check_references(id, "resolution_turn", &entry.resolution_turn.references)?;

            let order = store.order(&entry.order_id).ok_or_else(|| {
                malformed(format!("{id}: unknown order id `{}`", entry.order_id))
            })?;

            debug!(scenario = %id, order_id = %order.order_id, "loaded scenario");
            scenarios.push(Scenario {
                id,
                order,
                trigger: entry.trigger.trim().to_string(),
                policy: entry.policy.trim().to_string(),
                resolution: entry.resolution.unwrap_or_else(|| id.default_resolution()),
                gathering_references: entry.gathering.references,
                resolution_user_message: entry.resolution_turn.user,
                resolution_references: entry.resolution_turn.references,
                replay: entry.replay,
            });
        }

        Ok(Self { scenarios })
    }

    pub fn scenarios(&self) -> &[Scenario] {
        &self.scenarios
    }

    pub fn get(&self, id: ScenarioId) -> Option<&Scenario> {
        self.scenarios.iter().find(|scenario| scenario.id == id)
    }

    /// Scenarios whose id is in `ids`, in catalog order. An empty filter
    /// selects everything.
    pub fn select(&self, ids: &[ScenarioId]) -> Vec<Scenario> {
        self.scenarios
            .iter()
            .filter(|scenario| ids.is_empty() || ids.contains(&scenario.id))
            .cloned()
            .collect()
    }

    pub fn len(&self) -> usize {
        self.scenarios.len()
    }

    pub fn is_empty(&self) -> bool {
        self.scenarios.is_empty()
    }
}

fn parse_catalog(yaml: &str) -> Result<CatalogFile, EvalError> {
    serde_yaml::from_str(yaml).map_err(|err| EvalError::MalformedScenarioConfig(err.to_string()))
}

fn check_references(id: ScenarioId, section: &str, references: &[String]) -> Result<(), EvalError> {
    if references.is_empty() {
        return Err(EvalError::MalformedScenarioConfig(format!(
            "{id}: {section}.references must not be empty"
        )));
    }
    if references.iter().any(|reference| reference.trim().is_empty()) {
        return Err(EvalError::MalformedScenarioConfig(format!(
            "{id}: {section}.references contains a blank entry"
        )));
    }
    Ok(())
}
