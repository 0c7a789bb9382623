//! Override collection and resolution.

use pf_types::{Algo, AlgoParameters, OverlayError, OverrideScope};
use serde_json::Value;
use std::collections::BTreeMap;
use tracing::debug;

use crate::config::OverlayConfig;

/// A single requested override, not yet applied.
#[derive(Debug, Clone)]
struct CustomParameter {
    algo: Option<Algo>,
    name: String,
    value: Value,
}

/// Collects overrides in any order; [`OverlayBuilder::build`] applies them in
/// the required order.
#[derive(Debug, Clone, Default)]
pub struct OverlayBuilder {
    config: OverlayConfig,
    any_algo: Vec<CustomParameter>,
    specific_algo: Vec<CustomParameter>,
}

impl OverlayBuilder {
    pub fn new(config: OverlayConfig) -> Self {
        Self {
            config,
            any_algo: Vec::new(),
            specific_algo: Vec::new(),
        }
    }

    /// Override `param` for every algorithm that has it.
    pub fn add(
        &mut self,
        param: impl Into<String>,
        value: impl Into<Value>,
    ) -> Result<&mut Self, OverlayError> {
        let name = self.assert_allowed(param.into())?;
        self.any_algo.push(CustomParameter {
            algo: None,
            name,
            value: value.into(),
        });
        Ok(self)
    }

    /// Override `param` for `algo` only.
    pub fn add_for(
        &mut self,
        algo: Algo,
        param: impl Into<String>,
        value: impl Into<Value>,
    ) -> Result<&mut Self, OverlayError> {
        let name = self.assert_allowed(param.into())?;
        self.specific_algo.push(CustomParameter {
            algo: Some(algo),
            name,
            value: value.into(),
        });
        Ok(self)
    }

    fn assert_allowed(&self, param: String) -> Result<String, OverlayError> {
        if self.config.is_allowed(&param) {
            Ok(param)
        } else {
            Err(OverlayError::ParameterNotAllowed { param })
        }
    }

    /// Resolve every override onto fresh defaults.
    ///
    /// "All" overrides go first, algorithm-specific ones second. An "all"
    /// override skips algorithms without the field but must reach at least
    /// one; a specific override must name a field its algorithm has. A
    /// value that does not fit an existing field fails the whole build.
    pub fn build(&self) -> Result<ParameterOverlay, OverlayError> {
        let mut overlay = ParameterOverlay::defaults();

        for param in &self.any_algo {
            let mut applied = 0usize;
            for algo in Algo::ALL {
                if overlay.apply(algo, OverrideScope::All, &param.name, &param.value)? {
                    applied += 1;
                }
            }
            if applied == 0 {
                return Err(OverlayError::UnknownParameter {
                    param: param.name.clone(),
                    scope: OverrideScope::All,
                });
            }
        }

        for param in &self.specific_algo {
            if let Some(algo) = param.algo {
                let scope = OverrideScope::Algo(algo);
                if !overlay.apply(algo, scope, &param.name, &param.value)? {
                    return Err(OverlayError::UnknownParameter {
                        param: param.name.clone(),
                        scope,
                    });
                }
            }
        }

        Ok(overlay)
    }
}

#[derive(Debug, Clone, PartialEq)]
struct OverlayEntry {
    defaults: AlgoParameters,
    /// Overridden field names, in first-override order.
    overridden: Vec<String>,
}

/// Per-algorithm defaults with overrides resolved. Read-only once built.
#[derive(Debug, Clone, PartialEq)]
pub struct ParameterOverlay {
    entries: BTreeMap<Algo, OverlayEntry>,
}

impl ParameterOverlay {
    pub fn builder(config: OverlayConfig) -> OverlayBuilder {
        OverlayBuilder::new(config)
    }

    /// An overlay with no overrides at all.
    pub fn defaults() -> Self {
        let entries = Algo::ALL
            .iter()
            .map(|&algo| {
                (
                    algo,
                    OverlayEntry {
                        defaults: AlgoParameters::defaults(algo),
                        overridden: Vec::new(),
                    },
                )
            })
            .collect();
        Self { entries }
    }

    fn apply(
        &mut self,
        algo: Algo,
        scope: OverrideScope,
        name: &str,
        value: &Value,
    ) -> Result<bool, OverlayError> {
        let entry = self
            .entries
            .entry(algo)
            .or_insert_with(|| OverlayEntry {
                defaults: AlgoParameters::defaults(algo),
                overridden: Vec::new(),
            });

        match entry.defaults.set_field(name, value) {
            Ok(true) => {
                if !entry.overridden.iter().any(|n| n == name) {
                    entry.overridden.push(name.to_string());
                }
                debug!(%algo, %scope, param = %name, %value, "custom param applied");
                Ok(true)
            }
            Ok(false) => {
                debug!(%algo, param = %name, "could not set custom param");
                Ok(false)
            }
            Err(err) => {
                debug!(%algo, %scope, param = %name, error = %err, "custom param rejected");
                Err(OverlayError::InvalidValue {
                    param: name.to_string(),
                    scope,
                    value: value.clone(),
                })
            }
        }
    }

    /// Fully overlaid parameters for `algo`, ready to attach to a new job.
    pub fn resolve(&self, algo: Algo) -> AlgoParameters {
        self.entries
            .get(&algo)
            .map(|entry| entry.defaults.clone())
            .unwrap_or_else(|| AlgoParameters::defaults(algo))
    }

    pub fn has_custom_params(&self, algo: Algo) -> bool {
        self.entries
            .get(&algo)
            .is_some_and(|entry| !entry.overridden.is_empty())
    }

    pub fn has_custom_param(&self, algo: Algo, param: &str) -> bool {
        self.custom_parameter_names(algo).contains(&param)
    }

    pub fn custom_parameter_names(&self, algo: Algo) -> Vec<&str> {
        self.entries
            .get(&algo)
            .map(|entry| entry.overridden.iter().map(String::as_str).collect())
            .unwrap_or_default()
    }

    /// Copy only the overridden fields onto `dest`, leaving its other fields
    /// as they are.
    pub fn apply_custom_parameters(&self, dest: &mut AlgoParameters) -> Result<(), OverlayError> {
        let algo = dest.algo();
        let Some(entry) = self.entries.get(&algo) else {
            return Ok(());
        };

        for name in &entry.overridden {
            if let Some(value) = entry.defaults.get_field(name) {
                dest.set_field(name, &value)
                    .map_err(|_| OverlayError::InvalidValue {
                        param: name.clone(),
                        scope: OverrideScope::Algo(algo),
                        value,
                    })?;
            }
        }
        Ok(())
    }
}

impl Default for ParameterOverlay {
    fn default() -> Self {
        Self::defaults()
    }
}
