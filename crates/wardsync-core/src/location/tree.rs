//! Immutable location hierarchy with per-subtree patient counts.

use std::collections::HashMap;

use tracing::debug;

use crate::error::{DataError, Result};
use crate::models::{LocalizedString, Location};

const DEFAULT_LOCALE: &str = "en";

#[derive(Debug, Clone)]
pub struct LocationNode {
    location: Location,
    parent: Option<usize>,
    children: Vec<usize>,
    direct_count: u64,
    patient_count: u64,
}

impl LocationNode {
    pub fn uuid(&self) -> &str {
        &self.location.uuid
    }

    /// Parent uuid as stored, even when the parent is not in the tree.
    pub fn parent_uuid(&self) -> Option<&str> {
        self.location.parent_uuid.as_deref()
    }

    pub fn names(&self) -> &LocalizedString {
        &self.location.names
    }

    pub fn location(&self) -> &Location {
        &self.location
    }

    /// Patients assigned to this location itself.
    pub fn direct_patient_count(&self) -> u64 {
        self.direct_count
    }

    /// Patients assigned to this location or anywhere below it.
    pub fn patient_count(&self) -> u64 {
        self.patient_count
    }

    pub fn is_root(&self) -> bool {
        self.parent.is_none()
    }
}

/// All locations of one build.
///
/// Subtree counts are computed once in `build`; a tree never changes after
/// that, so a changed store means building a new tree.
#[derive(Debug, Clone)]
pub struct LocationTree {
    nodes: Vec<LocationNode>,
    index: HashMap<String, usize>,
    roots: Vec<usize>,
    locale: String,
}

impl LocationTree {
    /// Build a tree from flat location rows and direct patient counts.
    ///
    /// The first row for a uuid wins. A location whose parent is not among
    /// the rows becomes a root. Fails with `TreeCycle` when an ancestor chain
    /// does not reach a root within as many steps as there are locations.
    pub fn build(locations: Vec<Location>, counts: &HashMap<String, u64>) -> Result<Self> {
        let mut nodes: Vec<LocationNode> = Vec::with_capacity(locations.len());
        let mut index: HashMap<String, usize> = HashMap::with_capacity(locations.len());
        for location in locations {
            if index.contains_key(&location.uuid) {
                debug!(uuid = %location.uuid, "Ignoring duplicate location row");
                continue;
            }
            index.insert(location.uuid.clone(), nodes.len());
            nodes.push(LocationNode {
                direct_count: counts.get(&location.uuid).copied().unwrap_or(0),
                patient_count: 0,
                location,
                parent: None,
                children: Vec::new(),
            });
        }

        let mut roots = Vec::new();
        for i in 0..nodes.len() {
            let parent = nodes[i]
                .location
                .parent_uuid
                .as_ref()
                .and_then(|p| index.get(p))
                .copied();
            nodes[i].parent = parent;
            match parent {
                Some(p) => nodes[p].children.push(i),
                None => roots.push(i),
            }
        }

        check_acyclic(&nodes)?;

        let mut tree = Self {
            nodes,
            index,
            roots,
            locale: DEFAULT_LOCALE.to_string(),
        };
        tree.compute_counts();
        debug!(
            locations = tree.nodes.len(),
            roots = tree.roots.len(),
            "Built location tree"
        );
        Ok(tree)
    }

    /// Use `locale` for `display_name`.
    pub fn with_locale(mut self, locale: &str) -> Self {
        self.locale = locale.to_string();
        self
    }

    pub fn locale(&self) -> &str {
        &self.locale
    }

    /// Post-order accumulation of subtree counts from every root.
    fn compute_counts(&mut self) {
        let mut order = Vec::with_capacity(self.nodes.len());
        let mut stack: Vec<(usize, bool)> = self.roots.iter().rev().map(|&r| (r, false)).collect();
        while let Some((i, expanded)) = stack.pop() {
            if expanded {
                order.push(i);
                continue;
            }
            stack.push((i, true));
            for &child in self.nodes[i].children.iter().rev() {
                stack.push((child, false));
            }
        }
        for i in order {
            let below: u64 = self.nodes[i]
                .children
                .iter()
                .map(|&c| self.nodes[c].patient_count)
                .sum();
            self.nodes[i].patient_count = self.nodes[i].direct_count + below;
        }
    }

    pub fn get(&self, uuid: &str) -> Option<&LocationNode> {
        self.index.get(uuid).map(|&i| &self.nodes[i])
    }

    pub fn patient_count(&self, uuid: &str) -> Option<u64> {
        self.get(uuid).map(LocationNode::patient_count)
    }

    pub fn roots(&self) -> impl Iterator<Item = &LocationNode> {
        self.roots.iter().map(move |&i| &self.nodes[i])
    }

    /// Direct children in input order.
    pub fn children(&self, uuid: &str) -> impl Iterator<Item = &LocationNode> {
        self.index
            .get(uuid)
            .map(|&i| self.nodes[i].children.as_slice())
            .unwrap_or(&[])
            .iter()
            .map(move |&c| &self.nodes[c])
    }

    pub fn parent(&self, uuid: &str) -> Option<&LocationNode> {
        let i = *self.index.get(uuid)?;
        self.nodes[i].parent.map(|p| &self.nodes[p])
    }

    /// Parent, grandparent and so on up to the root.
    pub fn ancestors(&self, uuid: &str) -> Ancestors<'_> {
        Ancestors {
            tree: self,
            next: self.index.get(uuid).and_then(|&i| self.nodes[i].parent),
        }
    }

    /// Every location below `uuid`, depth first.
    pub fn descendants(&self, uuid: &str) -> Descendants<'_> {
        let stack = self
            .index
            .get(uuid)
            .map(|&i| self.nodes[i].children.iter().rev().copied().collect())
            .unwrap_or_default();
        Descendants { tree: self, stack }
    }

    /// Name of `uuid` in `locale`, with language fallback.
    pub fn name(&self, uuid: &str, locale: &str) -> Option<&str> {
        self.get(uuid).and_then(|node| node.names().get(locale))
    }

    /// Name in the tree's locale, or the uuid when the location is unnamed.
    pub fn display_name<'a>(&'a self, uuid: &'a str) -> &'a str {
        self.name(uuid, &self.locale).unwrap_or(uuid)
    }

    pub fn len(&self) -> usize {
        self.nodes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }

    /// Nodes in build order.
    pub fn iter(&self) -> impl Iterator<Item = &LocationNode> {
        self.nodes.iter()
    }

    /// Flat rows and direct counts this tree was built from.
    pub fn to_parts(&self) -> (Vec<Location>, HashMap<String, u64>) {
        let locations = self.nodes.iter().map(|n| n.location.clone()).collect();
        let counts = self
            .nodes
            .iter()
            .filter(|n| n.direct_count > 0)
            .map(|n| (n.location.uuid.clone(), n.direct_count))
            .collect();
        (locations, counts)
    }
}

fn check_acyclic(nodes: &[LocationNode]) -> Result<()> {
    let bound = nodes.len();
    let mut terminates = vec![false; nodes.len()];
    for start in 0..nodes.len() {
        let mut path = Vec::new();
        let mut current = start;
        loop {
            if terminates[current] {
                break;
            }
            path.push(current);
            match nodes[current].parent {
                None => break,
                Some(parent) => {
                    if path.len() > bound {
                        return Err(DataError::TreeCycle(nodes[start].location.uuid.clone()));
                    }
                    current = parent;
                }
            }
        }
        for i in path {
            terminates[i] = true;
        }
    }
    Ok(())
}

pub struct Ancestors<'a> {
    tree: &'a LocationTree,
    next: Option<usize>,
}

impl<'a> Iterator for Ancestors<'a> {
    type Item = &'a LocationNode;

    fn next(&mut self) -> Option<Self::Item> {
        let i = self.next?;
        let node = &self.tree.nodes[i];
        self.next = node.parent;
        Some(node)
    }
}

pub struct Descendants<'a> {
    tree: &'a LocationTree,
    stack: Vec<usize>,
}

impl<'a> Iterator for Descendants<'a> {
    type Item = &'a LocationNode;

    fn next(&mut self) -> Option<Self::Item> {
        let i = self.stack.pop()?;
        let node = &self.tree.nodes[i];
        self.stack.extend(node.children.iter().rev().copied());
        Some(node)
    }
}
