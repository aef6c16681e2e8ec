//! Prometheus text exposition format.

use crate::registry::MetricsSnapshot;

/// Render a metrics snapshot into Prometheus text format.
pub fn render_prometheus(snapshot: &MetricsSnapshot) -> String {
    let mut out = String::new();

    out.push_str("# HELP quartermaster_sandbox_count Live sandbox namespaces.\n");
    out.push_str("# TYPE quartermaster_sandbox_count gauge\n");
    out.push_str(&format!(
        "quartermaster_sandbox_count {}\n",
        snapshot.sandboxes
    ));

    out.push_str("# HELP quartermaster_specs_loaded Specs loaded per registry.\n");
    out.push_str("# TYPE quartermaster_specs_loaded gauge\n");
    let mut registries: Vec<_> = snapshot.specs_loaded.iter().collect();
    registries.sort();
    for (registry, count) in registries {
        out.push_str(&format!(
            "quartermaster_specs_loaded{{registry=\"{registry}\"}} {count}\n"
        ));
    }

    out.push_str("# HELP quartermaster_specs_reset_total Catalog reload count.\n");
    out.push_str("# TYPE quartermaster_specs_reset_total counter\n");
    out.push_str(&format!(
        "quartermaster_specs_reset_total {}\n",
        snapshot.specs_reset
    ));

    out.push_str("# HELP quartermaster_actions_requested_total Accepted action requests.\n");
    out.push_str("# TYPE quartermaster_actions_requested_total counter\n");
    let mut actions: Vec<_> = snapshot.actions_requested.iter().collect();
    actions.sort();
    for (action, count) in actions {
        out.push_str(&format!(
            "quartermaster_actions_requested_total{{action=\"{action}\"}} {count}\n"
        ));
    }

    out.push_str("# HELP quartermaster_jobs_in_flight Jobs currently running.\n");
    out.push_str("# TYPE quartermaster_jobs_in_flight gauge\n");
    let mut jobs: Vec<_> = snapshot.jobs_in_flight.iter().collect();
    jobs.sort();
    for (method, count) in jobs {
        out.push_str(&format!(
            "quartermaster_jobs_in_flight{{method=\"{method}\"}} {count}\n"
        ));
    }

    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    #[test]
    fn render_empty_keeps_declarations() {
        let output = render_prometheus(&MetricsSnapshot::default());
        assert!(output.contains("# TYPE quartermaster_sandbox_count gauge"));
        assert!(output.contains("quartermaster_sandbox_count 0"));
    }

    #[test]
    fn render_labelled_series() {
        let snapshot = MetricsSnapshot {
            sandboxes: 2,
            specs_loaded: HashMap::from([("dh".to_string(), 12)]),
            actions_requested: HashMap::from([("provision".to_string(), 4)]),
            jobs_in_flight: HashMap::from([("provision".to_string(), 1)]),
            specs_reset: 1,
        };
        let output = render_prometheus(&snapshot);

        assert!(output.contains("quartermaster_sandbox_count 2"));
        assert!(output.contains("quartermaster_specs_loaded{registry=\"dh\"} 12"));
        assert!(output.contains("quartermaster_actions_requested_total{action=\"provision\"} 4"));
        assert!(output.contains("quartermaster_jobs_in_flight{method=\"provision\"} 1"));
        assert!(output.contains("quartermaster_specs_reset_total 1"));
    }

    #[test]
    fn series_lines_are_sorted_and_well_formed() {
        let snapshot = MetricsSnapshot {
            specs_loaded: HashMap::from([
                ("zeta".to_string(), 1),
                ("alpha".to_string(), 2),
            ]),
            ..Default::default()
        };
        let output = render_prometheus(&snapshot);
        let alpha = output.find("registry=\"alpha\"").unwrap();
        let zeta = output.find("registry=\"zeta\"").unwrap();
        assert!(alpha < zeta);
    }
}
