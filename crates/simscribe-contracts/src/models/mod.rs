mod registry;
mod selectors;

pub use registry::{
    ModelRegistry, ModelSpec, ProviderKind, DEFAULT_SCRIPT_MODEL, DRYRUN_SCRIPT_MODEL,
    DRYRUN_VISION_MODEL, EXTRACTION_MODEL, VISION_MODEL,
};
pub use selectors::{ModelSelection, ModelSelector};
