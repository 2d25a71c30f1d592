// Copyright (c) 2025 Jonathan Fontanez
// SPDX-License-Identifier: BUSL-1.1

//! Pure cycle search over a snapshot of the wait-for graph.
//!
//! The graph is derived, never stored: devices are nodes and every parked
//! *move* contributes an edge from its source device to its destination
//! device. A parked add has no source and can never close a ring. The
//! search runs on an immutable snapshot taken under the scheduler lock,
//! so it is free of concurrent-mutation hazards and cannot itself fail —
//! it either finds a closed ring or it does not.

use petgraph::algo::astar;
use petgraph::graphmap::DiGraphMap;

use crate::types::{ComponentId, DeviceId};

/// Descriptor of a move currently parked on its destination's wait list.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) struct ParkedMove {
    pub(crate) component: ComponentId,
    pub(crate) source: DeviceId,
    pub(crate) destination: DeviceId,
}

/// Find a wait-for ring through `origin`.
///
/// A ring exists when a chain of parked moves leads from the origin's
/// destination device back to its source device: each link is a parked
/// move whose source is the previous link's destination. When several
/// parked moves share the same device pair the oldest one is used (the
/// snapshot is expected in arrival order).
///
/// Returns the components of the ring members *after* the origin, in ring
/// order: the first entry's source is the origin's destination, and the
/// last entry's destination is the origin's source.
pub(crate) fn find_cycle(parked: &[ParkedMove], origin: &ParkedMove) -> Option<Vec<ComponentId>> {
    let mut graph: DiGraphMap<DeviceId, ComponentId> = DiGraphMap::new();
    graph.add_node(origin.destination);
    graph.add_node(origin.source);
    for m in parked {
        // Keep the oldest edge per device pair; a newer parallel move
        // stays parked and keeps its FIFO position.
        if !graph.contains_edge(m.source, m.destination) {
            graph.add_edge(m.source, m.destination, m.component);
        }
    }

    let goal = origin.source;
    let (_, path) = astar(
        &graph,
        origin.destination,
        |node| node == goal,
        |_| 1u32,
        |_| 0u32,
    )?;

    let members = path
        .windows(2)
        .map(|hop| graph.edge_weight(hop[0], hop[1]).copied())
        .collect::<Option<Vec<ComponentId>>>()?;

    // A ring must pass through at least one other parked move.
    if members.is_empty() {
        return None;
    }
    Some(members)
}
