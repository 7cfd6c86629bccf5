//! The routing table derived from a user-supplied edge map (§4.1).
//!
//! `Graph` answers a single question: from state `A`, to eventually reach
//! `C`, what is the next single-hop state? It is built once, at bus
//! construction, by a Floyd-Warshall-style all-pairs shortest path
//! computation over edges of unit weight, and is immutable afterwards.

use std::collections::{HashMap, HashSet};

use crate::channel::ChannelId;

/// An edge map: `from -> [to, ...]`, the input to [`Graph::from_edges`].
pub type EdgeMap = HashMap<ChannelId, Vec<ChannelId>>;

/// Build an [`EdgeMap`] from `(from, [to, ...])` pairs of string slices.
/// Convenience for the common case of declaring a fixed state graph as a
/// literal table (see [`crate::process::ProcessBus`]).
pub fn edge_map(pairs: &[(&str, &[&str])]) -> EdgeMap {
    pairs
        .iter()
        .map(|(from, tos)| {
            (
                ChannelId::new(*from),
                tos.iter().map(|t| ChannelId::new(*t)).collect(),
            )
        })
        .collect()
}

/// A map of `(A, C) -> B` where `B` is the next hop on the shortest path
/// from `A` to `C`. Any pair `(A, C)` absent from the map has no path.
#[derive(Debug, Clone, Default)]
pub struct Graph {
    next: HashMap<(ChannelId, ChannelId), ChannelId>,
    states: HashSet<ChannelId>,
}

impl Graph {
    /// Form a `Graph` from the given `{from: [to, ...]}` edge map (§4.1).
    ///
    /// Modified Floyd-Warshall, where all edge weights are 1. Rather than a
    /// dense distance matrix we only ever keep the `next`-hop map, since
    /// that's all callers need: the shortest path `[P0, P1, ...]` can be
    /// recovered by iteratively looking up `next.get((Pn, target))`.
    pub fn from_edges(edges: &EdgeMap) -> Self {
        let mut states: HashSet<ChannelId> = HashSet::new();
        let mut dist: HashMap<(ChannelId, ChannelId), u32> = HashMap::new();
        let mut next: HashMap<(ChannelId, ChannelId), ChannelId> = HashMap::new();

        for (from, tos) in edges {
            states.insert(from.clone());
            dist.insert((from.clone(), from.clone()), 0);
            for to in tos {
                states.insert(to.clone());
                dist.insert((from.clone(), to.clone()), 1);
                next.insert((from.clone(), to.clone()), to.clone());
            }
        }

        let states_vec: Vec<ChannelId> = states.iter().cloned().collect();
        for k in &states_vec {
            for i in &states_vec {
                let Some(&d_ik) = dist.get(&(i.clone(), k.clone())) else {
                    continue;
                };
                for j in &states_vec {
                    let Some(&d_kj) = dist.get(&(k.clone(), j.clone())) else {
                        continue;
                    };
                    let candidate = d_ik + d_kj;
                    let pair = (i.clone(), j.clone());
                    let improves = match dist.get(&pair) {
                        Some(&current) => candidate < current,
                        None => true,
                    };
                    if improves {
                        dist.insert(pair.clone(), candidate);
                        let hop = next
                            .get(&(i.clone(), k.clone()))
                            .cloned()
                            .unwrap_or_else(|| k.clone());
                        next.insert(pair, hop);
                    }
                }
            }
        }

        Graph {
            next,
            states,
        }
    }

    /// The next single-hop state on a shortest path from `from` to `to`, or
    /// `None` if `to` is unreachable from `from`.
    pub fn next_hop(&self, from: &ChannelId, to: &ChannelId) -> Option<&ChannelId> {
        self.next.get(&(from.clone(), to.clone()))
    }

    /// Every state mentioned anywhere in the originating edge map.
    pub fn states(&self) -> &HashSet<ChannelId> {
        &self.states
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn process_bus_edges() -> EdgeMap {
        edge_map(&[
            ("INITIAL", &["ENTER"]),
            ("ENTER", &["IDLE"]),
            ("IDLE", &["START", "EXIT"]),
            ("START", &["RUN", "STOP"]),
            ("RUN", &["STOP"]),
            ("STOP", &["IDLE"]),
            ("EXIT", &["EXITED"]),
            ("START_ERROR", &["STOP"]),
            ("STOP_ERROR", &["EXIT"]),
            ("EXIT_ERROR", &["EXITED"]),
        ])
    }

    #[test]
    fn reference_next_hop_table() {
        let g = Graph::from_edges(&process_bus_edges());
        let hop = |from: &str, to: &str| g.next_hop(&ChannelId::new(from), &ChannelId::new(to)).cloned();

        assert_eq!(hop("IDLE", "RUN"), Some(ChannelId::new("START")));
        assert_eq!(hop("RUN", "IDLE"), Some(ChannelId::new("STOP")));
        assert_eq!(hop("STOP", "EXITED"), Some(ChannelId::new("IDLE")));
        assert_eq!(hop("IDLE", "EXITED"), Some(ChannelId::new("EXIT")));
        assert_eq!(hop("EXIT", "EXITED"), Some(ChannelId::new("EXITED")));
    }

    #[test]
    fn zero_length_path_is_not_stored() {
        let g = Graph::from_edges(&process_bus_edges());
        assert_eq!(g.next_hop(&ChannelId::new("IDLE"), &ChannelId::new("IDLE")), None);
    }

    #[test]
    fn unreachable_pair_is_absent() {
        let g = Graph::from_edges(&process_bus_edges());
        // EXITED is a sink; nothing leads out of it.
        assert_eq!(g.next_hop(&ChannelId::new("EXITED"), &ChannelId::new("RUN")), None);
    }

    #[test]
    fn state_closure_covers_every_mentioned_token() {
        let g = Graph::from_edges(&process_bus_edges());
        for name in [
            "INITIAL", "ENTER", "IDLE", "START", "EXIT", "RUN", "STOP", "EXITED",
            "START_ERROR", "STOP_ERROR", "EXIT_ERROR",
        ] {
            assert!(g.states().contains(&ChannelId::new(name)), "missing {name}");
        }
    }

    #[test]
    fn empty_edge_map_has_no_states() {
        let g = Graph::from_edges(&EdgeMap::new());
        assert!(g.states().is_empty());
    }
}
