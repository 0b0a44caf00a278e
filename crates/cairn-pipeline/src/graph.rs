//! Stage DAG construction and validation.
//!
//! Stages are connected by producer/consumer file relationships: stage A's
//! output appearing among stage B's dependencies makes A a predecessor of B.
//! Dependencies produced by no stage are external inputs. Two stages may not
//! claim the same output; cycles are rejected with the offending stage
//! sequence before anything executes.

use std::collections::{BTreeMap, HashMap, HashSet};

use cairn_types::{CairnError, Result};

use crate::definition::{PipelineDef, StageDef};

/// Validated stage graph with a deterministic topological order.
#[derive(Debug, Clone)]
pub struct StageGraph {
    /// Stages in declaration order.
    stages: Vec<(String, StageDef)>,
    /// Stage name -> declaration index.
    index: HashMap<String, usize>,
    /// Producer map: output path -> producing stage index.
    producers: BTreeMap<String, usize>,
    /// Direct predecessors (producers of this stage's deps), by index.
    preds: Vec<Vec<usize>>,
    /// Direct successors, by index.
    succs: Vec<Vec<usize>>,
    /// Topological order (declaration order breaks ties), by index.
    topo: Vec<usize>,
}

impl StageGraph {
    /// Build and validate the graph. Fails with a definition error on
    /// duplicate stage names, conflicting outputs, empty commands, or cycles.
    pub fn build(def: &PipelineDef) -> Result<Self> {
        let stages = def.stages.clone();

        let mut index = HashMap::new();
        for (i, (name, stage)) in stages.iter().enumerate() {
            if index.insert(name.clone(), i).is_some() {
                return Err(CairnError::DuplicateStage {
                    stage: name.clone(),
                });
            }
            if stage.cmd.trim().is_empty() {
                return Err(CairnError::EmptyCommand {
                    stage: name.clone(),
                });
            }
        }

        // Producer map; fan-out-to-same-path is forbidden.
        let mut producers: BTreeMap<String, usize> = BTreeMap::new();
        for (i, (name, stage)) in stages.iter().enumerate() {
            for out in &stage.outs {
                if let Some(&prev) = producers.get(out) {
                    return Err(CairnError::OutputConflict {
                        path: out.clone(),
                        first: stages[prev].0.clone(),
                        second: name.clone(),
                    });
                }
                producers.insert(out.clone(), i);
            }
        }

        // Edges: dep produced by another stage => producer -> consumer.
        let mut preds: Vec<Vec<usize>> = vec![Vec::new(); stages.len()];
        let mut succs: Vec<Vec<usize>> = vec![Vec::new(); stages.len()];
        for (i, (_, stage)) in stages.iter().enumerate() {
            for dep in &stage.deps {
                if let Some(&producer) = producers.get(dep) {
                    if !preds[i].contains(&producer) {
                        preds[i].push(producer);
                        succs[producer].push(i);
                    }
                }
            }
        }

        let topo = topo_order(&stages, &preds, &succs)?;

        Ok(Self {
            stages,
            index,
            producers,
            preds,
            succs,
            topo,
        })
    }

    /// Stage names in topological order (ties broken by declaration order).
    pub fn topo_names(&self) -> Vec<&str> {
        self.topo
            .iter()
            .map(|&i| self.stages[i].0.as_str())
            .collect()
    }

    pub fn stage(&self, name: &str) -> Option<&StageDef> {
        self.index.get(name).map(|&i| &self.stages[i].1)
    }

    pub fn len(&self) -> usize {
        self.stages.len()
    }

    pub fn is_empty(&self) -> bool {
        self.stages.is_empty()
    }

    /// Direct predecessors: stages producing one of `name`'s dependencies.
    pub fn predecessors(&self, name: &str) -> Vec<&str> {
        match self.index.get(name) {
            Some(&i) => self.preds[i]
                .iter()
                .map(|&p| self.stages[p].0.as_str())
                .collect(),
            None => Vec::new(),
        }
    }

    pub fn successors(&self, name: &str) -> Vec<&str> {
        match self.index.get(name) {
            Some(&i) => self.succs[i]
                .iter()
                .map(|&s| self.stages[s].0.as_str())
                .collect(),
            None => Vec::new(),
        }
    }

    /// The stage producing `path`, if any (otherwise `path` is an external
    /// input).
    pub fn producer_of(&self, path: &str) -> Option<&str> {
        self.producers
            .get(path)
            .map(|&i| self.stages[i].0.as_str())
    }

    /// All stages in declaration order.
    pub fn stages(&self) -> impl Iterator<Item = (&str, &StageDef)> {
        self.stages.iter().map(|(n, s)| (n.as_str(), s))
    }
}

/// Kahn's algorithm with a declaration-order ready list, so the ordering is
/// deterministic whenever multiple orders are valid. A leftover stage means a
/// cycle; the cycle's stage sequence is recovered by walking predecessors.
fn topo_order(
    stages: &[(String, StageDef)],
    preds: &[Vec<usize>],
    succs: &[Vec<usize>],
) -> Result<Vec<usize>> {
    let mut in_degree: Vec<usize> = preds.iter().map(|p| p.len()).collect();
    let mut order = Vec::with_capacity(stages.len());
    let mut placed = vec![false; stages.len()];

    while order.len() < stages.len() {
        // Lowest declaration index among ready stages.
        let next = (0..stages.len()).find(|&i| !placed[i] && in_degree[i] == 0);
        match next {
            Some(i) => {
                placed[i] = true;
                order.push(i);
                for &s in &succs[i] {
                    in_degree[s] -= 1;
                }
            }
            None => {
                let cycle = find_cycle(stages, preds, &placed);
                return Err(CairnError::CycleDetected { cycle });
            }
        }
    }
    Ok(order)
}

/// Walk predecessor links among unplaced stages until a repeat appears,
/// then cut the walk down to the repeated segment.
fn find_cycle(
    stages: &[(String, StageDef)],
    preds: &[Vec<usize>],
    placed: &[bool],
) -> Vec<String> {
    let start = match (0..stages.len()).find(|&i| !placed[i]) {
        Some(i) => i,
        None => return Vec::new(),
    };

    let mut seen: HashSet<usize> = HashSet::new();
    let mut path: Vec<usize> = Vec::new();
    let mut current = start;
    loop {
        if !seen.insert(current) {
            // Trim to the cycle proper and orient it along dependency edges
            // (the walk followed predecessor links, i.e. edges backwards).
            let pos = path.iter().position(|&i| i == current).unwrap_or(0);
            let mut cycle: Vec<String> = path[pos..]
                .iter()
                .rev()
                .map(|&i| stages[i].0.clone())
                .collect();
            if let Some(first) = cycle.first().cloned() {
                cycle.push(first);
            }
            return cycle;
        }
        path.push(current);
        current = match preds[current].iter().find(|&&p| !placed[p]) {
            Some(&p) => p,
            None => return vec![stages[current].0.clone()],
        };
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;

    fn stage(cmd: &str, deps: &[&str], outs: &[&str]) -> StageDef {
        StageDef {
            cmd: cmd.to_string(),
            deps: deps.iter().map(|s| s.to_string()).collect(),
            outs: outs.iter().map(|s| s.to_string()).collect(),
            params: Vec::new(),
            metrics: Vec::new(),
        }
    }

    fn def(stages: Vec<(&str, StageDef)>) -> PipelineDef {
        PipelineDef {
            stages: stages
                .into_iter()
                .map(|(n, s)| (n.to_string(), s))
                .collect(),
        }
    }

    #[test]
    fn linear_chain_topo_order() {
        let graph = StageGraph::build(&def(vec![
            ("train", stage("t", &["data/features"], &["model.pkl"])),
            ("ingest", stage("i", &["source.csv"], &["data/raw"])),
            ("preprocess", stage("p", &["data/raw"], &["data/features"])),
        ]))
        .unwrap();

        assert_eq!(graph.topo_names(), vec!["ingest", "preprocess", "train"]);
        assert_eq!(graph.predecessors("train"), vec!["preprocess"]);
        assert_eq!(graph.successors("ingest"), vec!["preprocess"]);
        assert_eq!(graph.producer_of("data/raw"), Some("ingest"));
        assert_eq!(graph.producer_of("source.csv"), None);
    }

    #[test]
    fn declaration_order_breaks_ties() {
        // Two independent chains; topological order must interleave by
        // declaration, not by name or hash order.
        let graph = StageGraph::build(&def(vec![
            ("zeta", stage("z", &[], &["z.out"])),
            ("alpha", stage("a", &[], &["a.out"])),
        ]))
        .unwrap();
        assert_eq!(graph.topo_names(), vec!["zeta", "alpha"]);
    }

    #[test]
    fn fan_in_is_allowed() {
        let graph = StageGraph::build(&def(vec![
            ("ingest", stage("i", &[], &["data/raw"])),
            ("stats", stage("s", &["data/raw"], &["stats.json"])),
            ("plot", stage("p", &["data/raw"], &["plot.png"])),
        ]))
        .unwrap();
        assert_eq!(graph.successors("ingest"), vec!["stats", "plot"]);
    }

    #[test]
    fn duplicate_output_rejected() {
        let err = StageGraph::build(&def(vec![
            ("a", stage("a", &[], &["shared.out"])),
            ("b", stage("b", &[], &["shared.out"])),
        ]))
        .unwrap_err();
        match err {
            CairnError::OutputConflict { path, first, second } => {
                assert_eq!(path, "shared.out");
                assert_eq!(first, "a");
                assert_eq!(second, "b");
            }
            other => panic!("expected OutputConflict, got: {other:?}"),
        }
    }

    #[test]
    fn duplicate_stage_rejected() {
        let err = StageGraph::build(&def(vec![
            ("a", stage("one", &[], &[])),
            ("a", stage("two", &[], &[])),
        ]))
        .unwrap_err();
        assert!(matches!(err, CairnError::DuplicateStage { stage } if stage == "a"));
    }

    #[test]
    fn two_stage_cycle_rejected_with_sequence() {
        let err = StageGraph::build(&def(vec![
            ("a", stage("a", &["b.out"], &["a.out"])),
            ("b", stage("b", &["a.out"], &["b.out"])),
        ]))
        .unwrap_err();
        match err {
            CairnError::CycleDetected { cycle } => {
                assert_eq!(cycle.len(), 3);
                assert_eq!(cycle.first(), cycle.last());
                assert!(cycle.contains(&"a".to_string()));
                assert!(cycle.contains(&"b".to_string()));
            }
            other => panic!("expected CycleDetected, got: {other:?}"),
        }
    }

    #[test]
    fn self_cycle_rejected() {
        let err = StageGraph::build(&def(vec![(
            "loop",
            stage("l", &["loop.out"], &["loop.out"]),
        )]))
        .unwrap_err();
        assert!(matches!(err, CairnError::CycleDetected { .. }));
    }

    #[test]
    fn empty_command_rejected_at_build() {
        let err = StageGraph::build(&def(vec![("a", stage("", &[], &[]))])).unwrap_err();
        assert!(matches!(err, CairnError::EmptyCommand { .. }));
    }

    #[test]
    fn external_inputs_need_no_producer() {
        let graph =
            StageGraph::build(&def(vec![("a", stage("a", &["external.csv"], &["out"]))]))
                .unwrap();
        assert!(graph.predecessors("a").is_empty());
    }
}
