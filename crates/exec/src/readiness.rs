//! Kind-specific readiness checks over live objects. Kinds without
//! readiness semantics count as ready once the apply is acknowledged.

use serde_json::Value;

/// Outcome of one readiness probe.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Readiness {
    Ready,
    /// Not there yet; keep polling. Carries a human-readable hint.
    Pending(String),
    /// The workload will never become ready; terminal.
    Failed(String),
}

/// Kinds the executor actively polls; everything else is ready once
/// the apply is acknowledged.
pub fn has_semantics(kind: &str) -> bool {
    matches!(kind, "Deployment" | "StatefulSet" | "Job" | "Namespace")
}

pub fn check(kind: &str, live: &Value) -> Readiness {
    match kind {
        "Deployment" | "StatefulSet" => replicas_ready(live),
        "Job" => job_ready(live),
        "Namespace" => namespace_ready(live),
        _ => Readiness::Ready,
    }
}

fn i64_at<'a>(v: &'a Value, keys: &[&str]) -> Option<i64> {
    let mut current = v;
    for key in keys {
        current = current.get(key)?;
    }
    current.as_i64()
}

fn replicas_ready(live: &Value) -> Readiness {
    let want = i64_at(live, &["spec", "replicas"]).unwrap_or(1);
    let ready = i64_at(live, &["status", "readyReplicas"]).unwrap_or(0);
    let generation = i64_at(live, &["metadata", "generation"]).unwrap_or(0);
    let observed = i64_at(live, &["status", "observedGeneration"]).unwrap_or(0);
    if observed < generation {
        return Readiness::Pending(format!(
            "observedGeneration {} behind generation {}",
            observed, generation
        ));
    }
    if ready >= want {
        Readiness::Ready
    } else {
        Readiness::Pending(format!("{}/{} replicas ready", ready, want))
    }
}

fn job_ready(live: &Value) -> Readiness {
    if i64_at(live, &["status", "succeeded"]).unwrap_or(0) >= 1 {
        return Readiness::Ready;
    }
    let failed = i64_at(live, &["status", "failed"]).unwrap_or(0);
    if failed > 0 {
        return Readiness::Failed(format!("job failed ({} pod failures)", failed));
    }
    Readiness::Pending("no completions yet".to_string())
}

fn namespace_ready(live: &Value) -> Readiness {
    match live.get("status").and_then(|s| s.get("phase")).and_then(Value::as_str) {
        Some("Active") => Readiness::Ready,
        Some(phase) => Readiness::Pending(format!("phase {}", phase)),
        None => Readiness::Pending("no phase reported".to_string()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn deployment_waits_for_replicas_and_generation() {
        let pending = json!({
            "metadata": {"generation": 2},
            "spec": {"replicas": 2},
            "status": {"readyReplicas": 2, "observedGeneration": 1}
        });
        assert!(matches!(check("Deployment", &pending), Readiness::Pending(_)));

        let scaling = json!({
            "metadata": {"generation": 2},
            "spec": {"replicas": 2},
            "status": {"readyReplicas": 1, "observedGeneration": 2}
        });
        assert!(matches!(check("Deployment", &scaling), Readiness::Pending(_)));

        let ready = json!({
            "metadata": {"generation": 2},
            "spec": {"replicas": 2},
            "status": {"readyReplicas": 2, "observedGeneration": 2}
        });
        assert_eq!(check("Deployment", &ready), Readiness::Ready);
    }

    #[test]
    fn job_success_and_failure_are_terminal() {
        let done = json!({"status": {"succeeded": 1}});
        assert_eq!(check("Job", &done), Readiness::Ready);

        let failed = json!({"status": {"failed": 3}});
        assert!(matches!(check("Job", &failed), Readiness::Failed(_)));

        let running = json!({"status": {"active": 1}});
        assert!(matches!(check("Job", &running), Readiness::Pending(_)));
    }

    #[test]
    fn namespace_needs_active_phase() {
        assert_eq!(
            check("Namespace", &json!({"status": {"phase": "Active"}})),
            Readiness::Ready
        );
        assert!(matches!(
            check("Namespace", &json!({"status": {"phase": "Terminating"}})),
            Readiness::Pending(_)
        ));
    }

    #[test]
    fn kinds_without_semantics_are_ready_on_ack() {
        assert_eq!(check("ConfigMap", &json!({})), Readiness::Ready);
        assert_eq!(check("Service", &json!({})), Readiness::Ready);
    }
}
