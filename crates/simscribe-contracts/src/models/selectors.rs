use crate::error::PipelineError;

use super::registry::{ModelRegistry, ModelSpec};

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ModelSelection {
    pub model: ModelSpec,
    /// True when no explicit model was requested and the registry default
    /// was used; surfaced in status text so the user sees which model ran.
    pub defaulted: bool,
}

/// Resolves a requested model name to a registry entry for one capability.
///
/// Unlike a fallback selector, an explicit request that the registry cannot
/// honor is an `UnknownModel` error: silently substituting a different model
/// for the one the user chose is worse than failing before the network call.
#[derive(Debug, Clone)]
pub struct ModelSelector {
    pub registry: ModelRegistry,
}

impl ModelSelector {
    pub fn new(registry: Option<ModelRegistry>) -> Self {
        Self {
            registry: registry.unwrap_or_else(|| ModelRegistry::new(None)),
        }
    }

    pub fn select(
        &self,
        requested: Option<&str>,
        capability: &str,
    ) -> Result<ModelSelection, PipelineError> {
        let requested = requested.map(str::trim).filter(|name| !name.is_empty());

        if let Some(name) = requested {
            return match self.registry.get(name) {
                Some(model) if model.supports(capability) => Ok(ModelSelection {
                    model: model.clone(),
                    defaulted: false,
                }),
                Some(_) => Err(PipelineError::UnknownModel(format!(
                    "'{name}' cannot be used for {capability}"
                ))),
                None => Err(PipelineError::UnknownModel(name.to_string())),
            };
        }

        let candidates = self.registry.by_capability(capability);
        let model = candidates
            .iter()
            .find(|model| !model.provider.is_dryrun())
            .or_else(|| candidates.first())
            .cloned()
            .ok_or_else(|| {
                PipelineError::ConfigurationError(format!(
                    "no models available for capability '{capability}'"
                ))
            })?;
        Ok(ModelSelection { model, defaulted: true })
    }
}
