//! Join fan-out detection.
//!
//! An alias is at grain when none of its rows can be repeated by the joins
//! around it: every edge, read away from the alias, must be to-one.

use crate::plan::JoinRelationship;

#[derive(Debug, Clone)]
struct Edge {
    parent: String,
    child: String,
    parent_to_child_one: bool,
    child_to_parent_one: bool,
}

#[derive(Debug, Clone, Default)]
pub(crate) struct FanoutGraph {
    edges: Vec<Edge>,
}

impl FanoutGraph {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add_join(&mut self, parent: &str, child: &str, relationship: JoinRelationship) {
        let (down, up) = match relationship {
            JoinRelationship::ManyToOne => (true, false),
            JoinRelationship::OneToMany => (false, true),
            JoinRelationship::OneToOne => (true, true),
            JoinRelationship::ManyToMany => (false, false),
        };
        self.push(parent, child, down, up);
    }

    /// Each array element belongs to one parent row; each parent has many.
    pub fn add_unnest(&mut self, parent: &str, element: &str) {
        self.push(parent, element, false, true);
    }

    fn push(&mut self, parent: &str, child: &str, down: bool, up: bool) {
        self.edges.push(Edge {
            parent: parent.to_string(),
            child: child.to_string(),
            parent_to_child_one: down,
            child_to_parent_one: up,
        });
    }

    pub fn is_at_grain(&self, alias: &str) -> bool {
        let mut visited = vec![alias.to_string()];
        let mut frontier = vec![alias.to_string()];
        while let Some(current) = frontier.pop() {
            for edge in &self.edges {
                let (next, to_one) = if edge.parent == current {
                    (&edge.child, edge.parent_to_child_one)
                } else if edge.child == current {
                    (&edge.parent, edge.child_to_parent_one)
                } else {
                    continue;
                };
                if visited.contains(next) {
                    continue;
                }
                if !to_one {
                    return false;
                }
                visited.push(next.clone());
                frontier.push(next.clone());
            }
        }
        true
    }
}
