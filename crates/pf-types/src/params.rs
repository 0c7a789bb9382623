//! Typed default parameters for every training algorithm.
//!
//! Each parameter struct exposes its fields by name through `set_field` /
//! `get_field`, so overrides can be validated without reflection: a field
//! that does not exist yields `Ok(false)`, a value that does not deserialize
//! into the field's type yields a [`FieldTypeError`].

use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::BTreeMap;

use crate::algo::{Algo, StoppingMetric};
use crate::errors::FieldTypeError;

/// Column name to monotonicity direction (`1` increasing, `-1` decreasing).
pub type MonotoneConstraints = BTreeMap<String, i32>;

/// Generates name-based field access for a parameter struct.
///
/// `@common` delegates unknown names to the nested [`CommonParameters`].
macro_rules! parameter_fields {
    (@fallback_set $self:ident, $name:ident, $value:ident) => { Ok(false) };
    (@fallback_set $self:ident, $name:ident, $value:ident, $common:ident) => {
        $self.$common.set_field($name, $value)
    };
    (@fallback_get $self:ident, $name:ident) => { None };
    (@fallback_get $self:ident, $name:ident, $common:ident) => { $self.$common.get_field($name) };

    ($ty:ident $(@$common:ident)? { $($field:ident : $fty:ty),* $(,)? }) => {
        impl $ty {
            const OWN_FIELDS: &'static [&'static str] = &[$(stringify!($field)),*];

            pub fn field_names(&self) -> Vec<&'static str> {
                #[allow(unused_mut)]
                let mut names = Self::OWN_FIELDS.to_vec();
                $( names.extend(self.$common.field_names()); )?
                names
            }

            /// Assign `value` to the field called `name`.
            ///
            /// Returns `Ok(false)` when the struct has no such field.
            pub fn set_field(&mut self, name: &str, value: &Value) -> Result<bool, FieldTypeError> {
                match name {
                    $(stringify!($field) => {
                        self.$field = serde_json::from_value::<$fty>(value.clone()).map_err(|e| {
                            FieldTypeError {
                                field: name.to_string(),
                                expected: stringify!($fty),
                                message: e.to_string(),
                            }
                        })?;
                        Ok(true)
                    })*
                    _ => parameter_fields!(@fallback_set self, name, value $(, $common)?),
                }
            }

            pub fn get_field(&self, name: &str) -> Option<Value> {
                match name {
                    $(stringify!($field) => serde_json::to_value(&self.$field).ok(),)*
                    _ => parameter_fields!(@fallback_get self, name $(, $common)?),
                }
            }
        }
    };
}

/// Fields shared by every algorithm.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CommonParameters {
    pub seed: i64,
    pub nfolds: u32,
    pub max_runtime_secs: f64,
    pub stopping_rounds: u32,
    pub stopping_metric: StoppingMetric,
    pub stopping_tolerance: f64,
    pub keep_cross_validation_predictions: bool,
    pub keep_cross_validation_models: bool,
    pub balance_classes: bool,
    pub max_after_balance_size: f64,
}

impl Default for CommonParameters {
    fn default() -> Self {
        Self {
            seed: -1,
            nfolds: 0,
            max_runtime_secs: 0.0,
            stopping_rounds: 0,
            stopping_metric: StoppingMetric::Auto,
            stopping_tolerance: 0.001,
            keep_cross_validation_predictions: false,
            keep_cross_validation_models: true,
            balance_classes: false,
            max_after_balance_size: 5.0,
        }
    }
}

parameter_fields!(CommonParameters {
    seed: i64,
    nfolds: u32,
    max_runtime_secs: f64,
    stopping_rounds: u32,
    stopping_metric: StoppingMetric,
    stopping_tolerance: f64,
    keep_cross_validation_predictions: bool,
    keep_cross_validation_models: bool,
    balance_classes: bool,
    max_after_balance_size: f64,
});

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GbmParameters {
    pub common: CommonParameters,
    pub ntrees: u32,
    pub max_depth: u32,
    pub min_rows: f64,
    pub learn_rate: f64,
    pub sample_rate: f64,
    pub col_sample_rate: f64,
    pub monotone_constraints: Option<MonotoneConstraints>,
}

impl Default for GbmParameters {
    fn default() -> Self {
        Self {
            common: CommonParameters::default(),
            ntrees: 50,
            max_depth: 5,
            min_rows: 10.0,
            learn_rate: 0.1,
            sample_rate: 1.0,
            col_sample_rate: 1.0,
            monotone_constraints: None,
        }
    }
}

parameter_fields!(GbmParameters @common {
    ntrees: u32,
    max_depth: u32,
    min_rows: f64,
    learn_rate: f64,
    sample_rate: f64,
    col_sample_rate: f64,
    monotone_constraints: Option<MonotoneConstraints>,
});

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DrfParameters {
    pub common: CommonParameters,
    pub ntrees: u32,
    pub max_depth: u32,
    pub min_rows: f64,
    /// Columns sampled per split; `-1` picks sqrt(p) or p/3.
    pub mtries: i32,
    pub sample_rate: f64,
}

impl Default for DrfParameters {
    fn default() -> Self {
        Self {
            common: CommonParameters::default(),
            ntrees: 50,
            max_depth: 20,
            min_rows: 1.0,
            mtries: -1,
            sample_rate: 0.632,
        }
    }
}

parameter_fields!(DrfParameters @common {
    ntrees: u32,
    max_depth: u32,
    min_rows: f64,
    mtries: i32,
    sample_rate: f64,
});

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum GlmFamily {
    #[default]
    #[serde(rename = "AUTO")]
    Auto,
    Gaussian,
    Binomial,
    Multinomial,
    Poisson,
    Gamma,
    Tweedie,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GlmParameters {
    pub common: CommonParameters,
    pub family: GlmFamily,
    pub alpha: Option<Vec<f64>>,
    pub lambda: Option<Vec<f64>>,
    pub lambda_search: bool,
    pub standardize: bool,
}

impl Default for GlmParameters {
    fn default() -> Self {
        Self {
            common: CommonParameters::default(),
            family: GlmFamily::Auto,
            alpha: None,
            lambda: None,
            lambda_search: false,
            standardize: true,
        }
    }
}

parameter_fields!(GlmParameters @common {
    family: GlmFamily,
    alpha: Option<Vec<f64>>,
    lambda: Option<Vec<f64>>,
    lambda_search: bool,
    standardize: bool,
});

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
pub enum Activation {
    Tanh,
    TanhWithDropout,
    #[default]
    Rectifier,
    RectifierWithDropout,
    Maxout,
    MaxoutWithDropout,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DeepLearningParameters {
    pub common: CommonParameters,
    pub hidden: Vec<u32>,
    pub epochs: f64,
    pub activation: Activation,
    pub l1: f64,
    pub l2: f64,
    pub input_dropout_ratio: f64,
}

impl Default for DeepLearningParameters {
    fn default() -> Self {
        Self {
            common: CommonParameters::default(),
            hidden: vec![200, 200],
            epochs: 10.0,
            activation: Activation::Rectifier,
            l1: 0.0,
            l2: 0.0,
            input_dropout_ratio: 0.0,
        }
    }
}

parameter_fields!(DeepLearningParameters @common {
    hidden: Vec<u32>,
    epochs: f64,
    activation: Activation,
    l1: f64,
    l2: f64,
    input_dropout_ratio: f64,
});

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum Booster {
    #[default]
    Gbtree,
    Gblinear,
    Dart,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct XGBoostParameters {
    pub common: CommonParameters,
    pub ntrees: u32,
    pub max_depth: u32,
    pub min_rows: f64,
    pub learn_rate: f64,
    pub sample_rate: f64,
    pub col_sample_rate: f64,
    pub booster: Booster,
    pub monotone_constraints: Option<MonotoneConstraints>,
}

impl Default for XGBoostParameters {
    fn default() -> Self {
        Self {
            common: CommonParameters::default(),
            ntrees: 50,
            max_depth: 6,
            min_rows: 1.0,
            learn_rate: 0.3,
            sample_rate: 1.0,
            col_sample_rate: 1.0,
            booster: Booster::Gbtree,
            monotone_constraints: None,
        }
    }
}

parameter_fields!(XGBoostParameters @common {
    ntrees: u32,
    max_depth: u32,
    min_rows: f64,
    learn_rate: f64,
    sample_rate: f64,
    col_sample_rate: f64,
    booster: Booster,
    monotone_constraints: Option<MonotoneConstraints>,
});

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
pub enum MetalearnerAlgorithm {
    #[default]
    #[serde(rename = "AUTO")]
    Auto,
    #[serde(rename = "GLM")]
    Glm,
    #[serde(rename = "GBM")]
    Gbm,
    #[serde(rename = "DRF")]
    Drf,
    DeepLearning,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StackedEnsembleParameters {
    pub common: CommonParameters,
    pub metalearner_algorithm: MetalearnerAlgorithm,
    pub metalearner_nfolds: u32,
    pub base_models: Vec<String>,
}

impl Default for StackedEnsembleParameters {
    fn default() -> Self {
        Self {
            common: CommonParameters::default(),
            metalearner_algorithm: MetalearnerAlgorithm::Auto,
            metalearner_nfolds: 0,
            base_models: Vec::new(),
        }
    }
}

parameter_fields!(StackedEnsembleParameters @common {
    metalearner_algorithm: MetalearnerAlgorithm,
    metalearner_nfolds: u32,
    base_models: Vec<String>,
});

/// Parameters for one algorithm, dispatched by variant.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "algo", content = "parameters")]
pub enum AlgoParameters {
    DeepLearning(DeepLearningParameters),
    #[serde(rename = "DRF")]
    Drf(DrfParameters),
    #[serde(rename = "GBM")]
    Gbm(GbmParameters),
    #[serde(rename = "GLM")]
    Glm(GlmParameters),
    StackedEnsemble(StackedEnsembleParameters),
    XGBoost(XGBoostParameters),
}

macro_rules! each_variant {
    ($value:expr, $inner:ident => $body:expr) => {
        match $value {
            AlgoParameters::DeepLearning($inner) => $body,
            AlgoParameters::Drf($inner) => $body,
            AlgoParameters::Gbm($inner) => $body,
            AlgoParameters::Glm($inner) => $body,
            AlgoParameters::StackedEnsemble($inner) => $body,
            AlgoParameters::XGBoost($inner) => $body,
        }
    };
}

impl AlgoParameters {
    /// Fresh default parameters for `algo`.
    pub fn defaults(algo: Algo) -> Self {
        match algo {
            Algo::DeepLearning => Self::DeepLearning(DeepLearningParameters::default()),
            Algo::Drf => Self::Drf(DrfParameters::default()),
            Algo::Gbm => Self::Gbm(GbmParameters::default()),
            Algo::Glm => Self::Glm(GlmParameters::default()),
            Algo::StackedEnsemble => Self::StackedEnsemble(StackedEnsembleParameters::default()),
            Algo::XGBoost => Self::XGBoost(XGBoostParameters::default()),
        }
    }

    pub fn algo(&self) -> Algo {
        match self {
            Self::DeepLearning(_) => Algo::DeepLearning,
            Self::Drf(_) => Algo::Drf,
            Self::Gbm(_) => Algo::Gbm,
            Self::Glm(_) => Algo::Glm,
            Self::StackedEnsemble(_) => Algo::StackedEnsemble,
            Self::XGBoost(_) => Algo::XGBoost,
        }
    }

    pub fn common(&self) -> &CommonParameters {
        each_variant!(self, p => &p.common)
    }

    pub fn common_mut(&mut self) -> &mut CommonParameters {
        each_variant!(self, p => &mut p.common)
    }

    pub fn has_field(&self, name: &str) -> bool {
        self.get_field(name).is_some()
    }

    pub fn field_names(&self) -> Vec<&'static str> {
        each_variant!(self, p => p.field_names())
    }

    /// See [`GbmParameters::set_field`]: `Ok(false)` means "no such field".
    pub fn set_field(&mut self, name: &str, value: &Value) -> Result<bool, FieldTypeError> {
        each_variant!(self, p => p.set_field(name, value))
    }

    pub fn get_field(&self, name: &str) -> Option<Value> {
        each_variant!(self, p => p.get_field(name))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn defaults_match_algorithm() {
        for algo in Algo::ALL {
            assert_eq!(AlgoParameters::defaults(algo).algo(), algo);
        }
    }

    #[test]
    fn set_existing_field_with_compatible_value() {
        let mut params = AlgoParameters::defaults(Algo::Gbm);
        assert_eq!(params.set_field("ntrees", &json!(120)), Ok(true));
        assert_eq!(params.get_field("ntrees"), Some(json!(120)));

        assert_eq!(
            params.set_field("monotone_constraints", &json!({"AGE": 1, "DEBT": -1})),
            Ok(true)
        );
        match &params {
            AlgoParameters::Gbm(gbm) => {
                let constraints = gbm.monotone_constraints.as_ref().unwrap();
                assert_eq!(constraints.get("AGE"), Some(&1));
                assert_eq!(constraints.get("DEBT"), Some(&-1));
            }
            other => panic!("unexpected variant: {other:?}"),
        }
    }

    #[test]
    fn set_common_field_through_variant() {
        let mut params = AlgoParameters::defaults(Algo::Glm);
        assert_eq!(params.set_field("seed", &json!(42)), Ok(true));
        assert_eq!(params.common().seed, 42);
        // Integers are accepted where a float is expected.
        assert_eq!(params.set_field("max_runtime_secs", &json!(30)), Ok(true));
        assert_eq!(params.common().max_runtime_secs, 30.0);
    }

    #[test]
    fn missing_field_is_reported_without_error() {
        let mut params = AlgoParameters::defaults(Algo::Glm);
        assert_eq!(params.set_field("monotone_constraints", &json!({"AGE": 1})), Ok(false));
        assert!(!params.has_field("monotone_constraints"));
        assert_eq!(params, AlgoParameters::defaults(Algo::Glm));
    }

    #[test]
    fn wrong_type_is_rejected_and_field_untouched() {
        let mut params = AlgoParameters::defaults(Algo::XGBoost);
        let err = params.set_field("max_depth", &json!("deep")).unwrap_err();
        assert_eq!(err.field, "max_depth");
        assert_eq!(err.expected, "u32");
        assert_eq!(params.get_field("max_depth"), Some(json!(6)));

        assert!(params.set_field("booster", &json!("forest")).is_err());
        assert_eq!(params.set_field("booster", &json!("dart")), Ok(true));
    }

    #[test]
    fn field_names_include_common_fields() {
        let params = AlgoParameters::defaults(Algo::DeepLearning);
        let names = params.field_names();
        assert!(names.contains(&"hidden"));
        assert!(names.contains(&"seed"));
        assert!(names.contains(&"stopping_metric"));
        assert!(!names.contains(&"ntrees"));
    }

    #[test]
    fn tagged_serialization() {
        let params = AlgoParameters::defaults(Algo::Drf);
        let json = serde_json::to_value(&params).unwrap();
        assert_eq!(json["algo"], json!("DRF"));
        assert_eq!(json["parameters"]["mtries"], json!(-1));
        let back: AlgoParameters = serde_json::from_value(json).unwrap();
        assert_eq!(back, params);
    }
}
