use indexmap::IndexMap;
use serde::{Deserialize, Serialize};

/// Default model for the main script-generation call.
pub const DEFAULT_SCRIPT_MODEL: &str = "deepseek-reasoner";
/// Fixed fast model used for both extraction calls.
pub const EXTRACTION_MODEL: &str = "deepseek-chat";
/// Fixed model for sketch description.
pub const VISION_MODEL: &str = "qwen-vl-max";
pub const DRYRUN_SCRIPT_MODEL: &str = "dryrun-script-1";
pub const DRYRUN_VISION_MODEL: &str = "dryrun-vision-1";

/// Provider family a model belongs to, resolved once from the registry at
/// run setup instead of re-parsed from the model name on every call.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ProviderKind {
    /// DeepSeek: higher-latency reasoning models, longer timeouts.
    Primary,
    /// DashScope OpenAI-compatible text models.
    SecondaryText,
    /// DashScope vision model.
    SecondaryVision,
    /// Offline deterministic provider for demos and tests.
    Dryrun,
}

impl ProviderKind {
    pub fn family_label(&self) -> &'static str {
        match self {
            Self::Primary => "DeepSeek",
            Self::SecondaryText | Self::SecondaryVision => "DashScope",
            Self::Dryrun => "dryrun",
        }
    }

    pub fn is_dryrun(&self) -> bool {
        matches!(self, Self::Dryrun)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ModelSpec {
    pub name: String,
    pub provider: ProviderKind,
    pub capabilities: Vec<String>,
    pub timeout_secs: u64,
}

impl ModelSpec {
    pub fn supports(&self, capability: &str) -> bool {
        self.capabilities.iter().any(|item| item == capability)
    }
}

#[derive(Debug, Clone)]
pub struct ModelRegistry {
    models: IndexMap<String, ModelSpec>,
}

impl ModelRegistry {
    pub fn new(models: Option<IndexMap<String, ModelSpec>>) -> Self {
        Self {
            models: models.unwrap_or_else(default_models),
        }
    }

    pub fn get(&self, name: &str) -> Option<&ModelSpec> {
        self.models.get(name)
    }

    pub fn list(&self) -> impl Iterator<Item = &ModelSpec> {
        self.models.values()
    }

    pub fn by_capability(&self, capability: &str) -> Vec<ModelSpec> {
        self.models
            .values()
            .filter(|model| model.supports(capability))
            .cloned()
            .collect()
    }

    pub fn ensure(&self, name: &str, capability: &str) -> Option<ModelSpec> {
        let model = self.get(name)?;
        if model.supports(capability) {
            return Some(model.clone());
        }
        None
    }
}

fn default_models() -> IndexMap<String, ModelSpec> {
    let mut map = IndexMap::new();

    let mut insert =
        |name: &str, provider: ProviderKind, capabilities: &[&str], timeout_secs: u64| {
            map.insert(
                name.to_string(),
                ModelSpec {
                    name: name.to_string(),
                    provider,
                    capabilities: capabilities
                        .iter()
                        .map(|item| (*item).to_string())
                        .collect(),
                    timeout_secs,
                },
            );
        };

    insert(
        DEFAULT_SCRIPT_MODEL,
        ProviderKind::Primary,
        &["script"],
        120,
    );
    insert(
        EXTRACTION_MODEL,
        ProviderKind::Primary,
        &["script", "extract"],
        120,
    );
    insert(
        "qwen-plus",
        ProviderKind::SecondaryText,
        &["script", "extract"],
        120,
    );
    insert(VISION_MODEL, ProviderKind::SecondaryVision, &["vision"], 280);
    insert(
        DRYRUN_SCRIPT_MODEL,
        ProviderKind::Dryrun,
        &["script", "extract"],
        5,
    );
    insert(DRYRUN_VISION_MODEL, ProviderKind::Dryrun, &["vision"], 5);

    map
}
