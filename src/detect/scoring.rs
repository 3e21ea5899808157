//! Risk aggregation and alert gating.

use crate::detect::Anomaly;

/// Mean of `severity weight × confidence` over all anomalies, clipped to
/// [0, 1]. An empty set scores 0.
pub fn risk_score(anomalies: &[Anomaly]) -> f64 {
    if anomalies.is_empty() {
        return 0.0;
    }
    let total: f64 = anomalies
        .iter()
        .map(|a| a.severity.weight() * a.confidence)
        .sum();
    let score = total / anomalies.len() as f64;
    if score.is_finite() {
        score.clamp(0.0, 1.0)
    } else {
        0.0
    }
}

/// Anomalies whose own confidence reaches `threshold`. Gating is per
/// anomaly so one strong finding is not diluted by weaker ones.
pub fn select_alerts(anomalies: &[Anomaly], threshold: f64) -> Vec<Anomaly> {
    anomalies
        .iter()
        .filter(|a| a.confidence >= threshold)
        .cloned()
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::detect::{Finding, Severity};
    use chrono::Utc;

    fn anomaly(severity: Severity, confidence: f64) -> Anomaly {
        Anomaly::from_finding(
            "test",
            "e1",
            Finding::new("t", severity, confidence, "m"),
            Utc::now(),
        )
    }

    #[test]
    fn test_empty_set_scores_zero() {
        assert_eq!(risk_score(&[]), 0.0);
        assert!(select_alerts(&[], 0.8).is_empty());
    }

    #[test]
    fn test_weighted_mean() {
        let set = [anomaly(Severity::High, 0.6), anomaly(Severity::Low, 0.5)];
        // (1.0 * 0.6 + 0.2 * 0.5) / 2 = 0.35
        assert!((risk_score(&set) - 0.35).abs() < 1e-9);
    }

    #[test]
    fn test_score_bounded_for_any_input() {
        let set = [
            anomaly(Severity::High, 1.0),
            anomaly(Severity::High, 7.0),
            anomaly(Severity::Medium, f64::NAN),
        ];
        let score = risk_score(&set);
        assert!((0.0..=1.0).contains(&score));
    }

    #[test]
    fn test_alerts_use_individual_confidence() {
        let set = [
            anomaly(Severity::High, 0.95),
            anomaly(Severity::Low, 0.6),
            anomaly(Severity::Low, 0.6),
            anomaly(Severity::Low, 0.6),
        ];
        let alerts = select_alerts(&set, 0.8);
        assert_eq!(alerts.len(), 1);
        assert_eq!(alerts[0].confidence, 0.95);
        // The aggregate is well below the threshold.
        assert!(risk_score(&set) < 0.8);
    }
}
