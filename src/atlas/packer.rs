//! Guillotine packer for atlas pages.
//!
//! A page is a binary tree of rectangles over a square region. Allocation
//! walks the tree and splits leaves; the split orientation picks whichever
//! leftover rectangle is closer to a square. Pages are cheap to clone, which
//! lets callers simulate an extension before committing to it.

use crate::foundation::geom::Region;

const MIN_ALLOC: i32 = 1;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct NodeId(u32);

#[derive(Clone)]
struct Node {
    x: i32,
    y: i32,
    width: i32,
    height: i32,
    used: bool,
    parent: Option<NodeId>,
    children: Option<(NodeId, NodeId)>,
}

#[derive(Clone)]
pub struct Page {
    nodes: Vec<Node>,
    /// Slots released by merged subtrees, reused before growing `nodes`.
    free_slots: Vec<NodeId>,
    root: Option<NodeId>,
    size: u32,
    max_size: u32,
}

/// How close a rectangle is to a square, in [0, 1]. 1 is a square.
fn squareness(width: i32, height: i32) -> f64 {
    if width == 0 && height == 0 {
        return 0.0;
    }
    if width <= height {
        width as f64 / height as f64
    } else {
        height as f64 / width as f64
    }
}

impl Page {
    pub fn new(size: u32, max_size: u32) -> Self {
        Self {
            nodes: Vec::new(),
            free_slots: Vec::new(),
            root: None,
            size,
            max_size,
        }
    }

    pub fn size(&self) -> u32 {
        self.size
    }

    pub fn is_empty(&self) -> bool {
        match self.root {
            None => true,
            Some(id) => {
                let root = self.node(id);
                !root.used && root.children.is_none()
            }
        }
    }

    fn node(&self, id: NodeId) -> &Node {
        &self.nodes[id.0 as usize]
    }

    fn node_mut(&mut self, id: NodeId) -> &mut Node {
        &mut self.nodes[id.0 as usize]
    }

    fn push(&mut self, node: Node) -> NodeId {
        match self.free_slots.pop() {
            Some(id) => {
                self.nodes[id.0 as usize] = node;
                id
            }
            None => {
                let id = NodeId(self.nodes.len() as u32);
                self.nodes.push(node);
                id
            }
        }
    }

    /// Returns a merged subtree's slots to the free list.
    fn release(&mut self, id: NodeId) {
        if let Some((a, b)) = self.node(id).children {
            self.release(a);
            self.release(b);
        }
        self.free_slots.push(id);
    }

    pub fn region(&self, id: NodeId) -> Region {
        let n = self.node(id);
        Region::new(n.x, n.y, n.width, n.height)
    }

    pub fn alloc(&mut self, width: i32, height: i32) -> Option<NodeId> {
        if width <= 0 || height <= 0 {
            return None;
        }
        let width = width.max(MIN_ALLOC);
        let height = height.max(MIN_ALLOC);
        let root = match self.root {
            Some(id) => id,
            None => {
                let side = self.size as i32;
                let id = self.push(Node {
                    x: 0,
                    y: 0,
                    width: side,
                    height: side,
                    used: false,
                    parent: None,
                    children: None,
                });
                self.root = Some(id);
                id
            }
        };
        self.alloc_at(root, width, height)
    }

    fn alloc_at(&mut self, id: NodeId, width: i32, height: i32) -> Option<NodeId> {
        let (nw, nh, used, children) = {
            let n = self.node(id);
            (n.width, n.height, n.used, n.children)
        };
        if nw < width || nh < height || used {
            return None;
        }
        if let Some((first, second)) = children {
            return self
                .alloc_at(first, width, height)
                .or_else(|| self.alloc_at(second, width, height));
        }
        if nw == width && nh == height {
            self.node_mut(id).used = true;
            return Some(id);
        }
        let (nx, ny) = {
            let n = self.node(id);
            (n.x, n.y)
        };
        let (first, second) = if squareness(nw - width, nh) >= squareness(nw, nh - height) {
            // Split vertically.
            (
                self.push(Node {
                    x: nx,
                    y: ny,
                    width,
                    height: nh,
                    used: false,
                    parent: Some(id),
                    children: None,
                }),
                self.push(Node {
                    x: nx + width,
                    y: ny,
                    width: nw - width,
                    height: nh,
                    used: false,
                    parent: Some(id),
                    children: None,
                }),
            )
        } else {
            // Split horizontally.
            (
                self.push(Node {
                    x: nx,
                    y: ny,
                    width: nw,
                    height,
                    used: false,
                    parent: Some(id),
                    children: None,
                }),
                self.push(Node {
                    x: nx,
                    y: ny + height,
                    width: nw,
                    height: nh - height,
                    used: false,
                    parent: Some(id),
                    children: None,
                }),
            )
        };
        self.node_mut(id).children = Some((first, second));
        self.alloc_at(first, width, height)
    }

    fn can_free(&self, id: NodeId) -> bool {
        let n = self.node(id);
        if n.used {
            return false;
        }
        match n.children {
            None => true,
            Some((a, b)) => self.can_free(a) && self.can_free(b),
        }
    }

    /// Releases an allocation and merges free sibling pairs back into their
    /// parent.
    pub fn free(&mut self, id: NodeId) {
        debug_assert!(self.node(id).children.is_none());
        self.node_mut(id).used = false;
        let mut current = id;
        while let Some(parent) = self.node(current).parent {
            let Some((a, b)) = self.node(parent).children else {
                break;
            };
            if !(self.can_free(a) && self.can_free(b)) {
                break;
            }
            self.node_mut(parent).children = None;
            self.release(a);
            self.release(b);
            current = parent;
        }
    }

    /// Total area of rectangles currently marked used.
    pub fn used_area(&self) -> u64 {
        let mut total = 0u64;
        let mut stack: Vec<NodeId> = self.root.into_iter().collect();
        while let Some(id) = stack.pop() {
            let n = self.node(id);
            if n.used {
                total += n.width as u64 * n.height as u64;
            }
            if let Some((a, b)) = n.children {
                stack.push(a);
                stack.push(b);
            }
        }
        total
    }

    /// Grows the page to `new_size` in one structural step: existing
    /// allocations keep their upper-left square, a bottom strip extends the
    /// old column downward and a full-height right strip takes the rest. A
    /// wide rectangle can then land in the right strip even when it spans
    /// more than the old side. Returns false past the maximum size.
    pub fn extend_to(&mut self, new_size: u32) -> bool {
        if new_size > self.max_size || new_size <= self.size {
            return false;
        }
        let old = self.size as i32;
        let new = new_size as i32;
        let old_root = self.root;
        self.size = new_size;
        let Some(old_root) = old_root else {
            // No tree yet: the next alloc builds the root at the new size.
            return true;
        };

        let lower = self.push(Node {
            x: 0,
            y: old,
            width: old,
            height: new - old,
            used: false,
            parent: None,
            children: None,
        });
        let left = self.push(Node {
            x: 0,
            y: 0,
            width: old,
            height: new,
            used: false,
            parent: None,
            children: Some((old_root, lower)),
        });
        let right = self.push(Node {
            x: old,
            y: 0,
            width: new - old,
            height: new,
            used: false,
            parent: None,
            children: None,
        });
        let root = self.push(Node {
            x: 0,
            y: 0,
            width: new,
            height: new,
            used: false,
            parent: None,
            children: Some((left, right)),
        });
        self.node_mut(old_root).parent = Some(left);
        self.node_mut(lower).parent = Some(left);
        self.node_mut(left).parent = Some(root);
        self.node_mut(right).parent = Some(root);
        self.root = Some(root);
        true
    }

    pub fn max_size(&self) -> u32 {
        self.max_size
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn allocations_are_disjoint() {
        let mut page = Page::new(128, 128);
        let mut regions = Vec::new();
        for _ in 0..16 {
            let id = page.alloc(32, 16).unwrap();
            regions.push(page.region(id));
        }
        for (i, a) in regions.iter().enumerate() {
            for b in &regions[i + 1..] {
                assert!(!a.intersects(*b), "{a:?} overlaps {b:?}");
            }
        }
    }

    #[test]
    fn full_size_alloc_needs_an_empty_page() {
        let mut page = Page::new(64, 64);
        assert!(page.alloc(64, 64).is_some());
        assert!(page.alloc(1, 1).is_none());
    }

    #[test]
    fn free_merges_back_to_empty() {
        let mut page = Page::new(64, 64);
        let a = page.alloc(10, 10).unwrap();
        let b = page.alloc(20, 5).unwrap();
        assert!(!page.is_empty());
        page.free(a);
        page.free(b);
        assert!(page.is_empty());
        assert!(page.alloc(64, 64).is_some());
    }

    #[test]
    fn zero_sized_alloc_is_rejected() {
        let mut page = Page::new(64, 64);
        assert!(page.alloc(0, 10).is_none());
        assert!(page.alloc(10, -1).is_none());
    }

    #[test]
    fn extend_grows_until_the_cap() {
        let mut page = Page::new(64, 256);
        assert!(page.alloc(64, 64).is_some());
        assert!(page.alloc(1, 1).is_none());
        assert!(page.extend_to(128));
        assert_eq!(page.size(), 128);
        assert!(page.alloc(64, 64).is_some());
        assert!(page.extend_to(256));
        assert!(!page.extend_to(512));
    }

    #[test]
    fn extend_keeps_existing_regions() {
        let mut page = Page::new(32, 64);
        let a = page.alloc(32, 32).unwrap();
        let before = page.region(a);
        assert!(page.extend_to(64));
        assert_eq!(page.region(a), before);
    }

    #[test]
    fn extension_fits_rectangles_wider_than_the_old_side() {
        let mut page = Page::new(1024, 4096);
        page.alloc(100, 100).unwrap();
        assert!(page.extend_to(4096));
        let wide = page.alloc(2049, 100).unwrap();
        let region = page.region(wide);
        assert_eq!(region.width, 2049);
        assert!(region.x >= 1024 || region.y >= 1024);
    }

    #[test]
    fn used_area_tracks_live_allocations() {
        let mut page = Page::new(256, 256);
        let mut live: Vec<(NodeId, u64)> = Vec::new();
        for &(w, h) in &[(32, 16), (64, 64), (8, 24), (100, 30), (16, 16)] {
            let id = page.alloc(w, h).unwrap();
            live.push((id, (w * h) as u64));
        }
        for (id, _) in [live.remove(3), live.remove(1)] {
            page.free(id);
        }
        let expected: u64 = live.iter().map(|&(_, area)| area).sum();
        assert_eq!(page.used_area(), expected);

        let id = page.alloc(40, 40).unwrap();
        assert_eq!(page.used_area(), expected + 1600);
        page.free(id);
        assert_eq!(page.used_area(), expected);
    }

    #[test]
    fn freed_nodes_are_reused() {
        let mut page = Page::new(64, 64);
        let a = page.alloc(16, 16).unwrap();
        page.free(a);
        let slots = page.nodes.len();
        for _ in 0..100 {
            let id = page.alloc(16, 16).unwrap();
            page.free(id);
        }
        assert_eq!(page.nodes.len(), slots);
        assert!(page.is_empty());
    }

    #[test]
    fn clone_simulates_without_committing() {
        let mut page = Page::new(32, 128);
        page.alloc(32, 32).unwrap();
        let mut sim = page.clone();
        assert!(sim.extend_to(64));
        assert!(sim.alloc(32, 32).is_some());
        assert_eq!(page.size(), 32);
        assert!(page.alloc(1, 1).is_none());
    }
}
