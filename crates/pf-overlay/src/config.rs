use serde::{Deserialize, Serialize};

/// Which parameter names may be overridden at all.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OverlayConfig {
    /// Lift the allow-list entirely (development builds).
    pub allow_all: bool,
    pub allowed_parameters: Vec<String>,
}

impl OverlayConfig {
    /// Set to `"true"` to accept every parameter name.
    pub const ALL_ENABLED_ENV: &'static str = "PARAFORGE_ALGO_PARAMETERS_ALL_ENABLED";

    /// Parameters accepted when the allow-list is in force.
    pub const DEFAULT_ALLOWED: &'static [&'static str] = &["monotone_constraints"];

    /// Default allow-list, lifted if [`Self::ALL_ENABLED_ENV`] is `"true"`.
    pub fn from_env() -> Self {
        let flag = std::env::var(Self::ALL_ENABLED_ENV).ok();
        Self::default().with_all_enabled_flag(flag.as_deref())
    }

    pub fn allow_all() -> Self {
        Self {
            allow_all: true,
            ..Self::default()
        }
    }

    pub fn with_allowed(mut self, param: impl Into<String>) -> Self {
        self.allowed_parameters.push(param.into());
        self
    }

    fn with_all_enabled_flag(mut self, flag: Option<&str>) -> Self {
        self.allow_all = flag
            .map(|v| v.trim().eq_ignore_ascii_case("true"))
            .unwrap_or(false);
        self
    }

    pub fn is_allowed(&self, param: &str) -> bool {
        self.allow_all || self.allowed_parameters.iter().any(|p| p == param)
    }
}

impl Default for OverlayConfig {
    fn default() -> Self {
        Self {
            allow_all: false,
            allowed_parameters: Self::DEFAULT_ALLOWED.iter().map(|p| p.to_string()).collect(),
        }
    }
}
