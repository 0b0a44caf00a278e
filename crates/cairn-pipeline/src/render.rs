//! Read-only text rendering of the stage graph.

use crate::detect::{Plan, StageState, StaleReason};
use crate::graph::StageGraph;

/// Render the graph in topological order, one stage per block, with each
/// stage's producers and declared outputs. Never mutates any state.
pub fn render_dag(graph: &StageGraph) -> String {
    let mut out = String::new();
    for name in graph.topo_names() {
        out.push_str(name);
        out.push('\n');
        let preds = graph.predecessors(name);
        if !preds.is_empty() {
            out.push_str(&format!("  after: {}\n", preds.join(", ")));
        }
        if let Some(stage) = graph.stage(name) {
            if !stage.outs.is_empty() {
                out.push_str(&format!("  outs:  {}\n", stage.outs.join(", ")));
            }
        }
    }
    out
}

/// Render a status table: one line per stage with its freshness verdict.
pub fn render_status(plan: &Plan) -> String {
    let mut out = String::new();
    for row in &plan.rows {
        let verdict = match &row.state {
            StageState::Fresh => "fresh".to_string(),
            StageState::Stale(reason) => format!("stale ({})", describe(reason)),
            StageState::Blocked(msg) => format!("blocked ({msg})"),
        };
        out.push_str(&format!("{:<24} {verdict}\n", row.name));
    }
    out
}

fn describe(reason: &StaleReason) -> String {
    match reason {
        StaleReason::NoLockEntry => "never run".to_string(),
        StaleReason::FingerprintChanged => "inputs changed".to_string(),
        StaleReason::MissingOutput(path) => format!("missing output '{path}'"),
        StaleReason::UpstreamStale(stage) => format!("upstream '{stage}' stale"),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::definition::PipelineDef;
    use crate::detect::PlanRow;

    #[test]
    fn dag_lists_stages_in_topological_order() {
        let def = PipelineDef::parse(
            r#"
stages:
  train:
    cmd: t
    deps: [features]
    outs: [model]
  ingest:
    cmd: i
    outs: [features]
"#,
        )
        .unwrap();
        let graph = StageGraph::build(&def).unwrap();
        let text = render_dag(&graph);

        let ingest_at = text.find("ingest").unwrap();
        let train_at = text.find("train").unwrap();
        assert!(ingest_at < train_at);
        assert!(text.contains("after: ingest"));
        assert!(text.contains("outs:  model"));
    }

    #[test]
    fn status_names_the_reason() {
        let plan = Plan {
            rows: vec![
                PlanRow {
                    name: "ingest".into(),
                    state: StageState::Fresh,
                },
                PlanRow {
                    name: "train".into(),
                    state: StageState::Stale(StaleReason::MissingOutput("model".into())),
                },
            ],
        };
        let text = render_status(&plan);
        assert!(text.contains("fresh"));
        assert!(text.contains("missing output 'model'"));
    }
}
