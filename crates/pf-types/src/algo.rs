use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

/// Training algorithms a job can target.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub enum Algo {
    DeepLearning,
    #[serde(rename = "DRF")]
    Drf,
    #[serde(rename = "GBM")]
    Gbm,
    #[serde(rename = "GLM")]
    Glm,
    StackedEnsemble,
    XGBoost,
}

impl Algo {
    pub const ALL: [Algo; 6] = [
        Algo::DeepLearning,
        Algo::Drf,
        Algo::Gbm,
        Algo::Glm,
        Algo::StackedEnsemble,
        Algo::XGBoost,
    ];

    /// Canonical name, as used in logs and configuration files.
    pub fn name(&self) -> &'static str {
        match self {
            Algo::DeepLearning => "DeepLearning",
            Algo::Drf => "DRF",
            Algo::Gbm => "GBM",
            Algo::Glm => "GLM",
            Algo::StackedEnsemble => "StackedEnsemble",
            Algo::XGBoost => "XGBoost",
        }
    }
}

impl fmt::Display for Algo {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

impl FromStr for Algo {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Algo::ALL
            .iter()
            .copied()
            .find(|algo| algo.name().eq_ignore_ascii_case(s))
            .ok_or_else(|| format!("unknown algorithm: {s}"))
    }
}

/// Kind of supervised problem, used to resolve `StoppingMetric::Auto`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ProblemType {
    Classification,
    Regression,
}

/// Metric used for early stopping comparisons.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
pub enum StoppingMetric {
    #[default]
    #[serde(rename = "AUTO")]
    Auto,
    #[serde(rename = "deviance")]
    Deviance,
    #[serde(rename = "logloss")]
    Logloss,
    #[serde(rename = "MSE")]
    Mse,
    #[serde(rename = "RMSE")]
    Rmse,
    #[serde(rename = "MAE")]
    Mae,
    #[serde(rename = "RMSLE")]
    Rmsle,
    #[serde(rename = "AUC")]
    Auc,
    #[serde(rename = "AUCPR")]
    Aucpr,
    #[serde(rename = "lift_top_group")]
    Lift,
    #[serde(rename = "misclassification")]
    MisclassificationRate,
    #[serde(rename = "mean_per_class_error")]
    MeanPerClassError,
}

impl StoppingMetric {
    /// Whether larger scores are improvements.
    pub fn is_higher_better(&self) -> bool {
        matches!(
            self,
            StoppingMetric::Auc | StoppingMetric::Aucpr | StoppingMetric::Lift
        )
    }

    /// Replace `Auto` with the concrete metric for the problem type.
    pub fn resolve(self, problem: ProblemType) -> StoppingMetric {
        match (self, problem) {
            (StoppingMetric::Auto, ProblemType::Classification) => StoppingMetric::Logloss,
            (StoppingMetric::Auto, ProblemType::Regression) => StoppingMetric::Deviance,
            (metric, _) => metric,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn algo_names_round_trip_through_from_str() {
        for algo in Algo::ALL {
            assert_eq!(algo.name().parse::<Algo>().unwrap(), algo);
        }
        assert_eq!("gbm".parse::<Algo>().unwrap(), Algo::Gbm);
        assert!("kmeans".parse::<Algo>().is_err());
    }

    #[test]
    fn algo_serializes_to_canonical_name() {
        assert_eq!(serde_json::to_string(&Algo::Drf).unwrap(), "\"DRF\"");
        let back: Algo = serde_json::from_str("\"XGBoost\"").unwrap();
        assert_eq!(back, Algo::XGBoost);
    }

    #[test]
    fn auto_metric_resolves_by_problem_type() {
        assert_eq!(
            StoppingMetric::Auto.resolve(ProblemType::Classification),
            StoppingMetric::Logloss
        );
        assert_eq!(
            StoppingMetric::Auto.resolve(ProblemType::Regression),
            StoppingMetric::Deviance
        );
        assert_eq!(
            StoppingMetric::Auc.resolve(ProblemType::Regression),
            StoppingMetric::Auc
        );
    }

    #[test]
    fn metric_direction() {
        assert!(StoppingMetric::Auc.is_higher_better());
        assert!(!StoppingMetric::Rmse.is_higher_better());
        assert!(!StoppingMetric::Logloss.is_higher_better());
    }
}
