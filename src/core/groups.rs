//! Business-group hierarchy as an arena of nodes indexed by name, each
//! holding a parent index and a cached materialized path. Paths are
//! recomputed on re-parenting rather than derived at query time.

use std::collections::BTreeMap;

use anyhow::{anyhow, Result};

#[derive(Debug, Clone)]
pub struct GroupNode {
    pub name: String,
    pub parent: Option<usize>,
    pub path: String,
    pub depth: u32,
}

#[derive(Debug, Clone, Default)]
pub struct GroupArena {
    nodes: Vec<GroupNode>,
    index: BTreeMap<String, usize>,
}

impl GroupArena {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&mut self, name: &str, parent: Option<&str>) -> Result<usize> {
        if self.index.contains_key(name) {
            // Idempotent: re-declaring a group is a no-op.
            return Ok(self.index[name]);
        }
        let (parent_idx, parent_path, depth) = match parent {
            Some(parent_name) => {
                let idx = self
                    .index
                    .get(parent_name)
                    .copied()
                    .ok_or_else(|| anyhow!("parent group not found: {}", parent_name))?;
                let node = &self.nodes[idx];
                (Some(idx), node.path.clone(), node.depth + 1)
            }
            None => (None, "/".to_string(), 0),
        };
        let node = GroupNode {
            name: name.to_string(),
            parent: parent_idx,
            path: format!("{}{}/", parent_path, name),
            depth,
        };
        self.nodes.push(node);
        let idx = self.nodes.len() - 1;
        self.index.insert(name.to_string(), idx);
        Ok(idx)
    }

    pub fn reparent(&mut self, name: &str, new_parent: Option<&str>) -> Result<()> {
        let idx = self
            .index
            .get(name)
            .copied()
            .ok_or_else(|| anyhow!("group not found: {}", name))?;
        let parent_idx = match new_parent {
            Some(parent_name) => {
                let pidx = self
                    .index
                    .get(parent_name)
                    .copied()
                    .ok_or_else(|| anyhow!("parent group not found: {}", parent_name))?;
                if pidx == idx || self.is_descendant(pidx, idx) {
                    return Err(anyhow!("re-parenting {} would create a cycle", name));
                }
                Some(pidx)
            }
            None => None,
        };
        self.nodes[idx].parent = parent_idx;
        self.recompute_paths();
        Ok(())
    }

    fn is_descendant(&self, candidate: usize, ancestor: usize) -> bool {
        let mut cursor = self.nodes[candidate].parent;
        while let Some(idx) = cursor {
            if idx == ancestor {
                return true;
            }
            cursor = self.nodes[idx].parent;
        }
        false
    }

    fn recompute_paths(&mut self) {
        for idx in 0..self.nodes.len() {
            let (path, depth) = self.compute_path(idx);
            self.nodes[idx].path = path;
            self.nodes[idx].depth = depth;
        }
    }

    fn compute_path(&self, idx: usize) -> (String, u32) {
        let mut segments = vec![self.nodes[idx].name.clone()];
        let mut depth = 0u32;
        let mut cursor = self.nodes[idx].parent;
        while let Some(pidx) = cursor {
            segments.push(self.nodes[pidx].name.clone());
            depth += 1;
            cursor = self.nodes[pidx].parent;
        }
        segments.reverse();
        (format!("/{}/", segments.join("/")), depth)
    }

    pub fn get(&self, name: &str) -> Option<&GroupNode> {
        self.index.get(name).map(|idx| &self.nodes[*idx])
    }

    pub fn iter(&self) -> impl Iterator<Item = &GroupNode> {
        self.nodes.iter()
    }

    pub fn len(&self) -> usize {
        self.nodes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }
}
