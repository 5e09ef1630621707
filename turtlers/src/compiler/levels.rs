//! Nesting levels of a segment, numbered in pre-order.

use crate::model::GroupSet;
use crate::plan::Segment;

#[derive(Debug)]
pub(crate) struct Level<'s> {
    pub id: u32,
    pub parent: Option<u32>,
    pub depth: u32,
    /// Nest name; empty for the root.
    pub name: String,
    pub segment: &'s Segment,
    /// Child levels in declaration order.
    pub children: Vec<u32>,
}

impl Level<'_> {
    pub fn group_set(&self) -> GroupSet {
        GroupSet(self.id)
    }
}

#[derive(Debug)]
pub(crate) struct LevelTree<'s> {
    levels: Vec<Level<'s>>,
}

impl<'s> LevelTree<'s> {
    pub fn build(root: &'s Segment) -> Self {
        let mut tree = Self { levels: Vec::new() };
        tree.visit(root, None, 0, String::new());
        tree
    }

    fn visit(&mut self, segment: &'s Segment, parent: Option<u32>, depth: u32, name: String) -> u32 {
        let id = self.levels.len() as u32;
        self.levels.push(Level {
            id,
            parent,
            depth,
            name,
            segment,
            children: Vec::new(),
        });
        for (child_name, child) in segment.nests() {
            let child_id = self.visit(child, Some(id), depth + 1, child_name.to_string());
            self.levels[id as usize].children.push(child_id);
        }
        id
    }

    pub fn get(&self, id: u32) -> &Level<'s> {
        &self.levels[id as usize]
    }

    pub fn root(&self) -> &Level<'s> {
        &self.levels[0]
    }

    pub fn iter(&self) -> impl Iterator<Item = &Level<'s>> {
        self.levels.iter()
    }

    /// Number of nested levels, excluding the root.
    pub fn nest_count(&self) -> u32 {
        self.levels.len() as u32 - 1
    }

    pub fn max_depth(&self) -> u32 {
        self.levels.iter().map(|l| l.depth).max().unwrap_or(0)
    }

    pub fn at_depth(&self, depth: u32) -> impl Iterator<Item = &Level<'s>> {
        self.levels.iter().filter(move |l| l.depth == depth)
    }

    /// `id` and all of its descendants.
    pub fn subtree(&self, id: u32) -> Vec<u32> {
        let mut out = vec![id];
        for child in &self.get(id).children {
            out.extend(self.subtree(*child));
        }
        out
    }

    /// Level of the nest `name` declared directly in `parent`.
    pub fn child_named(&self, parent: u32, name: &str) -> Option<&Level<'s>> {
        self.get(parent)
            .children
            .iter()
            .map(|c| self.get(*c))
            .find(|c| c.name == name)
    }
}

/// Column holding field `name` of `level` in the intermediate stages.
pub(crate) fn level_column(name: &str, level: u32) -> String {
    format!("{name}__{level}")
}
