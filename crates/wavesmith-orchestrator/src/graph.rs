use serde::{Deserialize, Serialize};
use std::collections::{HashMap, HashSet, VecDeque};
use std::time::Duration;
use uuid::Uuid;
use wavesmith_core::{WavesmithError, WavesmithResult};
use wavesmith_store::Task;

/// Dependency graph over a workflow's tasks.
///
/// Keeps insertion order so that every derived schedule is deterministic for
/// a fixed input.
#[derive(Debug, Clone, Default)]
pub struct DependencyGraph {
    order: Vec<Uuid>,
    dependencies: HashMap<Uuid, Vec<Uuid>>,
    dependents: HashMap<Uuid, Vec<Uuid>>,
}

/// Waves plus the figures derived from them.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Schedule {
    /// Each wave holds tasks whose dependencies all sit in earlier waves.
    pub waves: Vec<Vec<Uuid>>,
    /// Deepest dependency chain, root first.
    pub critical_path: Vec<Uuid>,
    /// Size of the largest wave.
    pub parallelism_score: usize,
}

impl Schedule {
    /// Number of waves.
    pub fn depth(&self) -> usize {
        self.waves.len()
    }

    /// Index of the wave holding `id`.
    pub fn wave_of(&self, id: Uuid) -> Option<usize> {
        self.waves.iter().position(|wave| wave.contains(&id))
    }
}

impl DependencyGraph {
    pub fn new() -> Self {
        Self::default()
    }

    /// Build the graph from stored tasks, in the order given.
    pub fn from_tasks(tasks: &[Task]) -> Self {
        let mut graph = Self::new();
        for task in tasks {
            graph.add(task.id, task.dependencies.clone());
        }
        graph
    }

    /// Add a node. Re-adding an id replaces its dependency list.
    pub fn add(&mut self, id: Uuid, dependencies: Vec<Uuid>) {
        let mut deps = Vec::with_capacity(dependencies.len());
        for dep in dependencies {
            if !deps.contains(&dep) {
                deps.push(dep);
            }
        }
        if let Some(old) = self.dependencies.insert(id, deps.clone()) {
            for dep in old {
                if let Some(list) = self.dependents.get_mut(&dep) {
                    list.retain(|d| *d != id);
                }
            }
        } else {
            self.order.push(id);
        }
        for dep in deps {
            self.dependents.entry(dep).or_default().push(id);
        }
    }

    /// Number of nodes.
    pub fn len(&self) -> usize {
        self.order.len()
    }

    pub fn is_empty(&self) -> bool {
        self.order.is_empty()
    }

    pub fn contains(&self, id: Uuid) -> bool {
        self.dependencies.contains_key(&id)
    }

    /// Node ids in insertion order.
    pub fn ids(&self) -> &[Uuid] {
        &self.order
    }

    /// Direct dependencies of `id`.
    pub fn dependencies_of(&self, id: Uuid) -> &[Uuid] {
        self.dependencies.get(&id).map(Vec::as_slice).unwrap_or(&[])
    }

    /// Direct dependents of `id`.
    pub fn dependents_of(&self, id: Uuid) -> &[Uuid] {
        self.dependents.get(&id).map(Vec::as_slice).unwrap_or(&[])
    }

    /// Fail with `NotFound` if any edge points outside the graph.
    pub fn validate(&self) -> WavesmithResult<()> {
        for id in &self.order {
            for dep in self.dependencies_of(*id) {
                if !self.contains(*dep) {
                    return Err(WavesmithError::NotFound(format!(
                        "dependency {dep} of task {id} is not part of the graph"
                    )));
                }
            }
        }
        Ok(())
    }

    /// Partition the graph into execution waves by topological peeling.
    ///
    /// Each round takes every remaining node whose dependencies were all
    /// emitted in earlier rounds. A round that makes no progress means the
    /// leftovers sit on (or behind) a cycle.
    pub fn waves(&self) -> WavesmithResult<Vec<Vec<Uuid>>> {
        self.validate()?;

        let mut done: HashSet<Uuid> = HashSet::with_capacity(self.order.len());
        let mut remaining: Vec<Uuid> = self.order.clone();
        let mut waves = Vec::new();

        while !remaining.is_empty() {
            let (wave, rest): (Vec<Uuid>, Vec<Uuid>) = remaining.iter().partition(|id| {
                self.dependencies_of(**id)
                    .iter()
                    .all(|dep| done.contains(dep))
            });
            if wave.is_empty() {
                return Err(WavesmithError::CycleDetected(rest));
            }
            done.extend(wave.iter().copied());
            waves.push(wave);
            remaining = rest;
        }
        Ok(waves)
    }

    /// Waves, critical path and parallelism score in one pass.
    pub fn schedule(&self) -> WavesmithResult<Schedule> {
        let waves = self.waves()?;
        let parallelism_score = waves.iter().map(Vec::len).max().unwrap_or(0);

        // Longest chain ending at each node, with the predecessor that got it there.
        let mut depth: HashMap<Uuid, usize> = HashMap::with_capacity(self.order.len());
        let mut via: HashMap<Uuid, Uuid> = HashMap::new();
        for wave in &waves {
            for id in wave {
                let mut best = 0;
                for dep in self.dependencies_of(*id) {
                    let d = depth.get(dep).copied().unwrap_or(0);
                    if d > best {
                        best = d;
                        via.insert(*id, *dep);
                    }
                }
                depth.insert(*id, best + 1);
            }
        }

        let mut critical_path = Vec::new();
        // Ties go to the node inserted first.
        let mut cursor = waves
            .last()
            .and_then(|last| {
                last.iter().max_by_key(|id| {
                    (
                        depth.get(*id).copied().unwrap_or(0),
                        std::cmp::Reverse(self.position(**id)),
                    )
                })
            })
            .copied();
        while let Some(id) = cursor {
            critical_path.push(id);
            cursor = via.get(&id).copied();
        }
        critical_path.reverse();

        Ok(Schedule {
            waves,
            critical_path,
            parallelism_score,
        })
    }

    fn position(&self, id: Uuid) -> usize {
        self.order
            .iter()
            .position(|o| *o == id)
            .unwrap_or(usize::MAX)
    }

    /// Every node that depends on `id`, directly or not, in insertion order.
    pub fn transitive_dependents(&self, id: Uuid) -> Vec<Uuid> {
        let mut seen = HashSet::new();
        let mut queue: VecDeque<Uuid> = self.dependents_of(id).iter().copied().collect();
        while let Some(next) = queue.pop_front() {
            if next != id && seen.insert(next) {
                queue.extend(self.dependents_of(next).iter().copied());
            }
        }
        self.order
            .iter()
            .filter(|o| seen.contains(o))
            .copied()
            .collect()
    }

    /// Time to run the whole graph under the wave barrier: each wave lasts
    /// as long as its slowest task.
    pub fn estimated_makespan<F>(&self, cost: F) -> WavesmithResult<Duration>
    where
        F: Fn(Uuid) -> Duration,
    {
        Ok(self
            .waves()?
            .iter()
            .map(|wave| wave.iter().map(|id| cost(*id)).max().unwrap_or_default())
            .sum())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ids(n: usize) -> Vec<Uuid> {
        (0..n).map(|_| Uuid::new_v4()).collect()
    }

    #[test]
    fn test_empty_graph() {
        let graph = DependencyGraph::new();
        assert!(graph.is_empty());
        assert!(graph.waves().unwrap().is_empty());
        let schedule = graph.schedule().unwrap();
        assert!(schedule.critical_path.is_empty());
        assert_eq!(schedule.parallelism_score, 0);
    }

    #[test]
    fn test_fan_out_waves() {
        let v = ids(3);
        let (a, b, c) = (v[0], v[1], v[2]);
        let mut graph = DependencyGraph::new();
        graph.add(a, vec![]);
        graph.add(b, vec![a]);
        graph.add(c, vec![a]);

        let schedule = graph.schedule().unwrap();
        assert_eq!(schedule.waves, vec![vec![a], vec![b, c]]);
        assert_eq!(schedule.parallelism_score, 2);
        assert_eq!(schedule.critical_path, vec![a, b]);
        assert_eq!(schedule.wave_of(c), Some(1));
    }

    #[test]
    fn test_diamond_critical_path() {
        let v = ids(5);
        let mut graph = DependencyGraph::new();
        graph.add(v[0], vec![]);
        graph.add(v[1], vec![v[0]]);
        graph.add(v[2], vec![]);
        graph.add(v[3], vec![v[1], v[2]]);
        graph.add(v[4], vec![v[3]]);

        let schedule = graph.schedule().unwrap();
        assert_eq!(schedule.waves, vec![vec![v[0], v[2]], vec![v[1]], vec![v[3]], vec![v[4]]]);
        assert_eq!(schedule.critical_path, vec![v[0], v[1], v[3], v[4]]);
        assert_eq!(schedule.critical_path.len(), schedule.depth());
    }

    #[test]
    fn test_cycle_is_detected() {
        let v = ids(3);
        let mut graph = DependencyGraph::new();
        graph.add(v[0], vec![v[1]]);
        graph.add(v[1], vec![v[0]]);
        graph.add(v[2], vec![]);

        match graph.waves() {
            Err(WavesmithError::CycleDetected(stuck)) => assert_eq!(stuck, vec![v[0], v[1]]),
            other => panic!("expected cycle, got {other:?}"),
        }
    }

    #[test]
    fn test_self_dependency_is_a_cycle() {
        let a = Uuid::new_v4();
        let mut graph = DependencyGraph::new();
        graph.add(a, vec![a]);
        assert!(matches!(graph.waves(), Err(WavesmithError::CycleDetected(_))));
        assert!(graph.schedule().is_err());
    }

    #[test]
    fn test_long_closed_chain_is_a_cycle() {
        let v = ids(500);
        let mut graph = DependencyGraph::new();
        graph.add(v[0], vec![v[499]]);
        for i in 1..500 {
            graph.add(v[i], vec![v[i - 1]]);
        }
        match graph.waves() {
            Err(WavesmithError::CycleDetected(stuck)) => assert_eq!(stuck.len(), 500),
            other => panic!("expected cycle, got {other:?}"),
        }
    }

    #[test]
    fn test_unknown_dependency_is_not_found() {
        let mut graph = DependencyGraph::new();
        graph.add(Uuid::new_v4(), vec![Uuid::new_v4()]);
        assert!(matches!(graph.waves(), Err(WavesmithError::NotFound(_))));
    }

    #[test]
    fn test_waves_are_deterministic() {
        let v = ids(6);
        let build = || {
            let mut graph = DependencyGraph::new();
            graph.add(v[0], vec![]);
            graph.add(v[1], vec![]);
            graph.add(v[2], vec![v[0], v[1]]);
            graph.add(v[3], vec![v[0]]);
            graph.add(v[4], vec![v[2], v[3]]);
            graph.add(v[5], vec![]);
            graph
        };
        let first = build().waves().unwrap();
        for _ in 0..10 {
            assert_eq!(build().waves().unwrap(), first);
        }
        assert_eq!(first[0], vec![v[0], v[1], v[5]]);
    }

    #[test]
    fn test_every_dependency_lands_in_an_earlier_wave() {
        let v = ids(8);
        let mut graph = DependencyGraph::new();
        for (i, id) in v.iter().enumerate() {
            let deps: Vec<Uuid> = v[..i].iter().copied().filter(|_| i % 3 != 0).take(2).collect();
            graph.add(*id, deps);
        }
        let schedule = graph.schedule().unwrap();
        for id in graph.ids() {
            let wave = schedule.wave_of(*id).unwrap();
            for dep in graph.dependencies_of(*id) {
                assert!(schedule.wave_of(*dep).unwrap() < wave);
            }
        }
    }

    #[test]
    fn test_transitive_dependents() {
        let v = ids(5);
        let mut graph = DependencyGraph::new();
        graph.add(v[0], vec![]);
        graph.add(v[1], vec![v[0]]);
        graph.add(v[2], vec![v[1]]);
        graph.add(v[3], vec![]);
        graph.add(v[4], vec![v[2], v[3]]);

        assert_eq!(graph.transitive_dependents(v[0]), vec![v[1], v[2], v[4]]);
        assert_eq!(graph.transitive_dependents(v[3]), vec![v[4]]);
        assert!(graph.transitive_dependents(v[4]).is_empty());
    }

    #[test]
    fn test_estimated_makespan() {
        let v = ids(3);
        let mut graph = DependencyGraph::new();
        graph.add(v[0], vec![]);
        graph.add(v[1], vec![v[0]]);
        graph.add(v[2], vec![v[0]]);
        let costs: HashMap<Uuid, u64> = [(v[0], 2), (v[1], 5), (v[2], 3)].into_iter().collect();
        let makespan = graph
            .estimated_makespan(|id| Duration::from_secs(costs[&id]))
            .unwrap();
        assert_eq!(makespan, Duration::from_secs(7));
    }

    #[test]
    fn test_readding_replaces_edges() {
        let v = ids(2);
        let mut graph = DependencyGraph::new();
        graph.add(v[0], vec![]);
        graph.add(v[1], vec![v[0], v[0]]);
        assert_eq!(graph.dependencies_of(v[1]), &[v[0]]);
        graph.add(v[1], vec![]);
        assert!(graph.dependents_of(v[0]).is_empty());
        assert_eq!(graph.len(), 2);
    }
}
