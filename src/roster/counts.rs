/// Cascading total/current/online counters for Group and MetaContact nodes.
///
/// - `total` propagates the raw delta to the parent counting node.
/// - `current` and `online` propagate only on a 0 ↔ non-zero transition of
///   the child's own counter, so a group counts "contacts with any connected
///   (online) buddy", not buddies.
///
/// A delta that would drive a counter negative is an invariant violation:
/// it asserts in debug builds and clamps to zero (with an error log) in
/// release builds.

use crate::roster::ids::NodeId;
use crate::roster::node::{Counters, NodeKind};
use crate::roster::tree::NodeArena;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
enum Counter {
    Total,
    Current,
    Online,
}

/// Apply `delta` to one counter of `node`. Returns `(old, new)`, or `None`
/// when the node is missing or not a counting node.
fn apply(arena: &mut NodeArena, node: NodeId, counter: Counter, delta: i32) -> Option<(u32, u32)> {
    let counters = arena.get_mut(node)?.counters_mut()?;
    let slot = match counter {
        Counter::Total => &mut counters.total,
        Counter::Current => &mut counters.current,
        Counter::Online => &mut counters.online,
    };
    let old = *slot;
    debug_assert!(
        i64::from(old) + i64::from(delta) >= 0,
        "{:?} counter of {} would go negative ({} + {})",
        counter,
        node,
        old,
        delta
    );
    let new = match old.checked_add_signed(delta) {
        Some(v) => v,
        None => {
            log::error!(
                "{:?} counter of {} underflow ({} + {}); clamping to 0",
                counter,
                node,
                old,
                delta
            );
            0
        }
    };
    *slot = new;
    Some((old, new))
}

/// Parent of `node` if that parent is itself a counting node.
fn counting_parent(arena: &NodeArena, node: NodeId) -> Option<NodeId> {
    let parent = arena.get(node)?.parent()?;
    arena.get(parent)?.counters().map(|_| parent)
}

pub(crate) fn change_total(arena: &mut NodeArena, node: NodeId, delta: i32) {
    if delta == 0 || apply(arena, node, Counter::Total, delta).is_none() {
        return;
    }
    if let Some(parent) = counting_parent(arena, node) {
        change_total(arena, parent, delta);
    }
}

pub(crate) fn change_current(arena: &mut NodeArena, node: NodeId, delta: i32) {
    change_flagged(arena, node, Counter::Current, delta);
}

pub(crate) fn change_online(arena: &mut NodeArena, node: NodeId, delta: i32) {
    change_flagged(arena, node, Counter::Online, delta);
}

fn change_flagged(arena: &mut NodeArena, node: NodeId, counter: Counter, delta: i32) {
    if delta == 0 {
        return;
    }
    let Some((old, new)) = apply(arena, node, counter, delta) else {
        return;
    };
    let step = match (old == 0, new == 0) {
        (true, false) => 1,
        (false, true) => -1,
        _ => return,
    };
    if let Some(parent) = counting_parent(arena, node) {
        change_flagged(arena, parent, counter, step);
    }
}

// ---------------------------------------------------------------------------
// Contributions
// ---------------------------------------------------------------------------

/// What a node adds to its parent's counters while attached.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub(crate) struct Contribution {
    pub total: i32,
    pub current: i32,
    pub online: i32,
}

pub(crate) fn contribution(arena: &NodeArena, node: NodeId) -> Contribution {
    let Some(n) = arena.get(node) else {
        return Contribution::default();
    };
    match n.kind() {
        NodeKind::Contact(c) => Contribution {
            total: c.counters.total as i32,
            current: i32::from(c.counters.current > 0),
            online: i32::from(c.counters.online > 0),
        },
        NodeKind::Buddy(b) => Contribution {
            total: 1,
            current: i32::from(b.connected),
            online: i32::from(b.online),
        },
        // A chat is "online" exactly when its account is connected.
        NodeKind::Chat(c) => Contribution {
            total: 1,
            current: i32::from(c.connected),
            online: i32::from(c.connected),
        },
        NodeKind::Group(_) => Contribution::default(),
    }
}

/// Add (`sign = 1`) or withdraw (`sign = -1`) `c` on `parent`, cascading.
pub(crate) fn apply_contribution(arena: &mut NodeArena, parent: NodeId, c: Contribution, sign: i32) {
    change_total(arena, parent, sign * c.total);
    change_current(arena, parent, sign * c.current);
    change_online(arena, parent, sign * c.online);
}

/// Recount a node's counters from its children, ignoring the stored values
/// of the node itself.
pub(crate) fn recount(arena: &NodeArena, node: NodeId) -> Counters {
    let mut counters = Counters::default();
    for child in arena.children(Some(node)) {
        let c = contribution(arena, child);
        counters.total += c.total as u32;
        counters.current += c.current as u32;
        counters.online += c.online as u32;
    }
    counters
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use crate::roster::ids::AccountId;
    use crate::roster::node::{Buddy, Contact, Group};

    fn setup() -> (NodeArena, NodeId, NodeId, NodeId) {
        let mut arena = NodeArena::new();
        let g = arena.alloc(NodeKind::Group(Group {
            name: "Work".into(),
            counters: Counters::default(),
        }));
        arena.insert_after(g, None, None);
        let c1 = arena.alloc(NodeKind::Contact(Contact::default()));
        let c2 = arena.alloc(NodeKind::Contact(Contact::default()));
        arena.insert_after(c1, None, Some(g));
        arena.insert_after(c2, Some(c1), Some(g));
        (arena, g, c1, c2)
    }

    fn counters(arena: &NodeArena, id: NodeId) -> Counters {
        *arena.get(id).unwrap().counters().unwrap()
    }

    #[test]
    fn test_total_propagates_raw_delta() {
        let (mut arena, g, c1, c2) = setup();
        change_total(&mut arena, c1, 1);
        change_total(&mut arena, c1, 1);
        change_total(&mut arena, c2, 1);

        assert_eq!(counters(&arena, c1).total, 2);
        assert_eq!(counters(&arena, g).total, 3);

        change_total(&mut arena, c1, -2);
        assert_eq!(counters(&arena, g).total, 1);
    }

    #[test]
    fn test_current_propagates_on_transition_only() {
        let (mut arena, g, c1, c2) = setup();
        change_current(&mut arena, c1, 1);
        change_current(&mut arena, c1, 1);
        assert_eq!(counters(&arena, c1).current, 2);
        assert_eq!(counters(&arena, g).current, 1);

        change_current(&mut arena, c2, 1);
        assert_eq!(counters(&arena, g).current, 2);

        change_current(&mut arena, c1, -1);
        assert_eq!(counters(&arena, g).current, 2);
        change_current(&mut arena, c1, -1);
        assert_eq!(counters(&arena, g).current, 1);
    }

    #[test]
    fn test_online_independent_of_current() {
        let (mut arena, g, c1, _) = setup();
        change_online(&mut arena, c1, 1);
        assert_eq!(counters(&arena, g).online, 1);
        assert_eq!(counters(&arena, g).current, 0);
    }

    #[test]
    fn test_non_counting_node_ignored() {
        let (mut arena, _, c1, _) = setup();
        let b = arena.alloc(NodeKind::Buddy(Buddy {
            account: AccountId::new("xmpp", "me"),
            name: "bob".into(),
            normalized: "bob".into(),
            alias: None,
            server_alias: None,
            connected: true,
            online: true,
        }));
        arena.insert_after(b, None, Some(c1));
        change_total(&mut arena, b, 1);
        assert_eq!(counters(&arena, c1).total, 0);
    }

    #[test]
    fn test_contribution_round_trip() {
        let (mut arena, g, c1, _) = setup();
        change_total(&mut arena, c1, 3);
        change_current(&mut arena, c1, 2);
        change_online(&mut arena, c1, 1);

        let c = contribution(&arena, c1);
        assert_eq!(c, Contribution { total: 3, current: 1, online: 1 });

        apply_contribution(&mut arena, g, c, -1);
        assert_eq!(counters(&arena, g), Counters::default());
        apply_contribution(&mut arena, g, c, 1);
        assert_eq!(counters(&arena, g), Counters { total: 3, current: 1, online: 1 });
    }

    #[test]
    #[cfg_attr(debug_assertions, should_panic(expected = "would go negative"))]
    fn test_underflow_asserts_in_debug() {
        let (mut arena, _, c1, _) = setup();
        change_total(&mut arena, c1, -1);
        assert_eq!(counters(&arena, c1).total, 0);
    }
}
