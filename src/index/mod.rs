//! Point-keyed quadtree index
//!
//! General-purpose spatial index over point-positioned keys, independent of
//! the render tile tree. The node tree is built eagerly to a fixed depth so
//! inserts and queries are allocation-free descents.

use glam::DVec2;

use crate::error::{EngineError, EngineResult};
use crate::geo::Extents;

struct Node<K> {
    extents: Extents,
    children: Option<Box<[Node<K>; 4]>>,
    entries: Vec<(K, DVec2)>,
}

impl<K> Node<K> {
    fn new(extents: Extents, depth: usize) -> Self {
        let children = if depth > 0 {
            let [ll, lr, ul, ur] = extents.split();
            Some(Box::new([
                Node::new(ll, depth - 1),
                Node::new(lr, depth - 1),
                Node::new(ul, depth - 1),
                Node::new(ur, depth - 1),
            ]))
        } else {
            None
        };
        Self {
            extents,
            children,
            entries: Vec::new(),
        }
    }

    fn insert(&mut self, key: K, position: DVec2) {
        if let Some(children) = self.children.as_mut() {
            // First covering quadrant wins; split-line points go lower/left.
            for child in children.iter_mut() {
                if child.extents.contains(position) {
                    child.insert(key, position);
                    return;
                }
            }
        }
        self.entries.push((key, position));
    }

    fn clear(&mut self) {
        self.entries.clear();
        if let Some(children) = self.children.as_mut() {
            for child in children.iter_mut() {
                child.clear();
            }
        }
    }
}

impl<K: Clone> Node<K> {
    fn query(&self, region: &Extents, out: &mut Vec<K>) {
        if !self.extents.intersects(region) {
            return;
        }
        for (key, position) in &self.entries {
            if region.contains(*position) {
                out.push(key.clone());
            }
        }
        if let Some(children) = self.children.as_ref() {
            for child in children.iter() {
                child.query(region, out);
            }
        }
    }
}

/// Fixed-depth quadtree over point-keyed entries
pub struct QuadTreeIndex<K> {
    root: Node<K>,
    len: usize,
}

impl<K> QuadTreeIndex<K> {
    /// Build an index covering `extents`, subdivided `depth` levels deep.
    pub fn new(extents: Extents, depth: usize) -> EngineResult<Self> {
        if extents.is_empty() || extents.size().min_element() <= 0.0 {
            return Err(EngineError::invalid_extents(
                "quadtree index requires non-degenerate extents",
            ));
        }
        Ok(Self {
            root: Node::new(extents, depth),
            len: 0,
        })
    }

    /// Insert a key at `position`. Returns false (and drops the entry) when
    /// the position lies outside the root extents.
    pub fn insert(&mut self, key: K, position: DVec2) -> bool {
        if !self.root.extents.contains(position) {
            return false;
        }
        self.root.insert(key, position);
        self.len += 1;
        true
    }

    pub fn len(&self) -> usize {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    pub fn clear(&mut self) {
        self.root.clear();
        self.len = 0;
    }
}

impl<K: Clone> QuadTreeIndex<K> {
    /// Append every key whose position lies inside `region` to `out`,
    /// visiting only subtrees whose extents intersect the region.
    pub fn query(&self, region: &Extents, out: &mut Vec<K>) {
        self.root.query(region, out);
    }
}
