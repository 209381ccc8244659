//! Red-black balancing for the per-storage sibling trees.
//!
//! Nodes are directory entries addressed by [`DirId`]; the only persistent
//! edges are `left`/`right` (plus the parent storage's `child` pointing at
//! the subtree root). Parents are an ephemeral map rebuilt per operation,
//! so nothing here introduces owning references or cycles.
//!
//! `NOSTREAM` plays the role of the black nil leaf throughout.

use crate::dir::entry::{cmp_names, Color, DirEntry};
use crate::error::{CompoundError, Result};
use crate::types::DirId;
use std::cmp::Ordering;
use std::collections::{HashMap, HashSet};

/// Outcome of checking a storage subtree against the red-black rules.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum TreeHealth {
    Healthy,
    /// Valid BST, but the coloring breaks a red-black property.
    Miscolored,
    /// Sibling order violates the storage ordering (or contains ties).
    Disordered,
}

struct View<'a> {
    entries: &'a mut [DirEntry],
    parent: HashMap<u32, u32>,
    root: DirId,
}

impl<'a> View<'a> {
    fn new(entries: &'a mut [DirEntry], root: DirId) -> Self {
        let mut parent = HashMap::new();
        let mut stack = vec![root];
        while let Some(id) = stack.pop() {
            if id.is_none() {
                continue;
            }
            for side in [entries[id.index()].left, entries[id.index()].right] {
                if side.is_some() {
                    parent.insert(side.0, id.0);
                    stack.push(side);
                }
            }
        }
        View {
            entries,
            parent,
            root,
        }
    }

    fn left(&self, id: DirId) -> DirId {
        if id.is_none() {
            DirId::NONE
        } else {
            self.entries[id.index()].left
        }
    }

    fn right(&self, id: DirId) -> DirId {
        if id.is_none() {
            DirId::NONE
        } else {
            self.entries[id.index()].right
        }
    }

    fn color(&self, id: DirId) -> Color {
        if id.is_none() {
            Color::Black
        } else {
            self.entries[id.index()].color
        }
    }

    fn set_left(&mut self, id: DirId, child: DirId) {
        self.entries[id.index()].left = child;
        if child.is_some() {
            self.parent.insert(child.0, id.0);
        }
    }

    fn set_right(&mut self, id: DirId, child: DirId) {
        self.entries[id.index()].right = child;
        if child.is_some() {
            self.parent.insert(child.0, id.0);
        }
    }

    fn set_color(&mut self, id: DirId, color: Color) {
        if id.is_some() {
            self.entries[id.index()].color = color;
        }
    }

    fn parent(&self, id: DirId) -> DirId {
        if id.is_none() {
            return DirId::NONE;
        }
        self.parent.get(&id.0).map_or(DirId::NONE, |p| DirId(*p))
    }

    /// Replace the subtree rooted at `u` by the one rooted at `v`.
    fn transplant(&mut self, u: DirId, v: DirId) {
        let p = self.parent(u);
        if p.is_none() {
            self.root = v;
            if v.is_some() {
                self.parent.remove(&v.0);
            }
        } else if self.left(p) == u {
            self.set_left(p, v);
        } else {
            self.set_right(p, v);
        }
        if v.is_some() && p.is_some() {
            self.parent.insert(v.0, p.0);
        }
    }

    fn rotate_left(&mut self, x: DirId) {
        let y = self.right(x);
        debug_assert!(y.is_some());
        let y_left = self.left(y);
        self.entries[x.index()].right = y_left;
        if y_left.is_some() {
            self.parent.insert(y_left.0, x.0);
        }
        let p = self.parent(x);
        if p.is_none() {
            self.root = y;
            self.parent.remove(&y.0);
        } else if self.left(p) == x {
            self.set_left(p, y);
        } else {
            self.set_right(p, y);
        }
        self.entries[y.index()].left = x;
        self.parent.insert(x.0, y.0);
    }

    fn rotate_right(&mut self, x: DirId) {
        let y = self.left(x);
        debug_assert!(y.is_some());
        let y_right = self.right(y);
        self.entries[x.index()].left = y_right;
        if y_right.is_some() {
            self.parent.insert(y_right.0, x.0);
        }
        let p = self.parent(x);
        if p.is_none() {
            self.root = y;
            self.parent.remove(&y.0);
        } else if self.left(p) == x {
            self.set_left(p, y);
        } else {
            self.set_right(p, y);
        }
        self.entries[y.index()].right = x;
        self.parent.insert(x.0, y.0);
    }

    fn minimum(&self, mut id: DirId) -> DirId {
        while self.left(id).is_some() {
            id = self.left(id);
        }
        id
    }

    fn insert_fixup(&mut self, mut z: DirId) {
        while self.color(self.parent(z)) == Color::Red {
            let p = self.parent(z);
            let g = self.parent(p);
            if g.is_none() {
                break;
            }
            if p == self.left(g) {
                let uncle = self.right(g);
                if self.color(uncle) == Color::Red {
                    self.set_color(p, Color::Black);
                    self.set_color(uncle, Color::Black);
                    self.set_color(g, Color::Red);
                    z = g;
                } else {
                    if z == self.right(p) {
                        z = p;
                        self.rotate_left(z);
                    }
                    let p = self.parent(z);
                    let g = self.parent(p);
                    self.set_color(p, Color::Black);
                    self.set_color(g, Color::Red);
                    self.rotate_right(g);
                }
            } else {
                let uncle = self.left(g);
                if self.color(uncle) == Color::Red {
                    self.set_color(p, Color::Black);
                    self.set_color(uncle, Color::Black);
                    self.set_color(g, Color::Red);
                    z = g;
                } else {
                    if z == self.left(p) {
                        z = p;
                        self.rotate_right(z);
                    }
                    let p = self.parent(z);
                    let g = self.parent(p);
                    self.set_color(p, Color::Black);
                    self.set_color(g, Color::Red);
                    self.rotate_left(g);
                }
            }
        }
        let root = self.root;
        self.set_color(root, Color::Black);
    }

    fn delete_fixup(&mut self, mut x: DirId, mut x_parent: DirId) {
        while x != self.root && self.color(x) == Color::Black {
            if x_parent.is_none() {
                break;
            }
            if x == self.left(x_parent) {
                let mut w = self.right(x_parent);
                if self.color(w) == Color::Red {
                    self.set_color(w, Color::Black);
                    self.set_color(x_parent, Color::Red);
                    self.rotate_left(x_parent);
                    w = self.right(x_parent);
                }
                if self.color(self.left(w)) == Color::Black
                    && self.color(self.right(w)) == Color::Black
                {
                    self.set_color(w, Color::Red);
                    x = x_parent;
                    x_parent = self.parent(x);
                } else {
                    if self.color(self.right(w)) == Color::Black {
                        self.set_color(self.left(w), Color::Black);
                        self.set_color(w, Color::Red);
                        self.rotate_right(w);
                        w = self.right(x_parent);
                    }
                    self.set_color(w, self.color(x_parent));
                    self.set_color(x_parent, Color::Black);
                    let wr = self.right(w);
                    self.set_color(wr, Color::Black);
                    self.rotate_left(x_parent);
                    x = self.root;
                }
            } else {
                let mut w = self.left(x_parent);
                if self.color(w) == Color::Red {
                    self.set_color(w, Color::Black);
                    self.set_color(x_parent, Color::Red);
                    self.rotate_right(x_parent);
                    w = self.left(x_parent);
                }
                if self.color(self.left(w)) == Color::Black
                    && self.color(self.right(w)) == Color::Black
                {
                    self.set_color(w, Color::Red);
                    x = x_parent;
                    x_parent = self.parent(x);
                } else {
                    if self.color(self.left(w)) == Color::Black {
                        self.set_color(self.right(w), Color::Black);
                        self.set_color(w, Color::Red);
                        self.rotate_left(w);
                        w = self.left(x_parent);
                    }
                    self.set_color(w, self.color(x_parent));
                    self.set_color(x_parent, Color::Black);
                    let wl = self.left(w);
                    self.set_color(wl, Color::Black);
                    self.rotate_right(x_parent);
                    x = self.root;
                }
            }
        }
        self.set_color(x, Color::Black);
    }
}

/// Insert `node` (already present in `entries`, not yet linked) into the
/// tree rooted at `root`. Returns the new root. The caller has rejected
/// name ties beforehand.
pub(crate) fn insert(entries: &mut [DirEntry], root: DirId, node: DirId) -> DirId {
    let mut view = View::new(entries, root);
    let mut y = DirId::NONE;
    let mut x = view.root;
    let mut went_left = false;
    while x.is_some() {
        y = x;
        went_left = cmp_names(
            &view.entries[node.index()].name,
            &view.entries[x.index()].name,
        ) == Ordering::Less;
        x = if went_left { view.left(x) } else { view.right(x) };
    }
    view.entries[node.index()].left = DirId::NONE;
    view.entries[node.index()].right = DirId::NONE;
    view.entries[node.index()].color = Color::Red;
    if y.is_none() {
        view.root = node;
    } else if went_left {
        view.set_left(y, node);
    } else {
        view.set_right(y, node);
    }
    view.insert_fixup(node);
    view.root
}

/// Unlink `node` from the tree rooted at `root`, rebalancing. Returns the
/// new root. The node's own edges are cleared.
pub(crate) fn remove(entries: &mut [DirEntry], root: DirId, node: DirId) -> DirId {
    let mut view = View::new(entries, root);
    let z = node;
    let mut y_color = view.color(z);
    let x;
    let x_parent;
    if view.left(z).is_none() {
        x = view.right(z);
        x_parent = view.parent(z);
        view.transplant(z, x);
    } else if view.right(z).is_none() {
        x = view.left(z);
        x_parent = view.parent(z);
        view.transplant(z, x);
    } else {
        // Successor replacement
        let y = view.minimum(view.right(z));
        y_color = view.color(y);
        x = view.right(y);
        if view.parent(y) == z {
            x_parent = y;
            if x.is_some() {
                view.parent.insert(x.0, y.0);
            }
        } else {
            x_parent = view.parent(y);
            view.transplant(y, x);
            let zr = view.right(z);
            view.set_right(y, zr);
        }
        view.transplant(z, y);
        let zl = view.left(z);
        view.set_left(y, zl);
        view.set_color(y, view.color(z));
    }
    if y_color == Color::Black {
        view.delete_fixup(x, x_parent);
    }
    let new_root = view.root;
    entries[node.index()].left = DirId::NONE;
    entries[node.index()].right = DirId::NONE;
    entries[node.index()].color = Color::Black;
    new_root
}

/// In-order walk of a sibling tree, with loop and range detection.
pub(crate) fn in_order(entries: &[DirEntry], root: DirId) -> Result<Vec<DirId>> {
    let mut out = Vec::new();
    let mut stack = Vec::new();
    let mut visited = HashSet::new();
    let mut cur = root;
    loop {
        while cur.is_some() {
            if cur.index() >= entries.len() {
                return Err(CompoundError::DirEntry(format!(
                    "sibling index {cur} out of range"
                )));
            }
            if !visited.insert(cur) {
                return Err(CompoundError::DirLoop(cur));
            }
            stack.push(cur);
            cur = entries[cur.index()].left;
        }
        let Some(id) = stack.pop() else {
            return Ok(out);
        };
        out.push(id);
        cur = entries[id.index()].right;
    }
}

/// Check a sibling tree against the storage order and red-black rules.
/// The tree must already be structurally sound (in range, acyclic).
pub(crate) fn validate(entries: &[DirEntry], root: DirId) -> Result<TreeHealth> {
    let ids = in_order(entries, root)?;
    for pair in ids.windows(2) {
        let a = &entries[pair[0].index()];
        let b = &entries[pair[1].index()];
        if cmp_names(&a.name, &b.name) != Ordering::Less {
            return Ok(TreeHealth::Disordered);
        }
    }

    if root.is_some() && entries[root.index()].color != Color::Black {
        return Ok(TreeHealth::Miscolored);
    }
    // Post-order black-height computation, iterative to survive degenerate
    // shapes.
    let mut heights: HashMap<u32, u32> = HashMap::new();
    let mut stack = vec![(root, false)];
    while let Some((id, processed)) = stack.pop() {
        if id.is_none() {
            continue;
        }
        let entry = &entries[id.index()];
        if !processed {
            stack.push((id, true));
            stack.push((entry.left, false));
            stack.push((entry.right, false));
            continue;
        }
        let child_height = |cid: DirId| -> u32 {
            if cid.is_none() {
                1
            } else {
                heights[&cid.0]
            }
        };
        if child_height(entry.left) != child_height(entry.right) {
            return Ok(TreeHealth::Miscolored);
        }
        if entry.color == Color::Red {
            let red_child = |cid: DirId| {
                cid.is_some() && entries[cid.index()].color == Color::Red
            };
            if red_child(entry.left) || red_child(entry.right) {
                return Ok(TreeHealth::Miscolored);
            }
        }
        let own = u32::from(entry.color == Color::Black);
        heights.insert(id.0, child_height(entry.left) + own);
    }
    Ok(TreeHealth::Healthy)
}

/// Link an ordered id list into a balanced red-black tree and return its
/// root. Used to repair loaded trees whose links or colors are unusable.
pub(crate) fn build_balanced(entries: &mut [DirEntry], ids: &[DirId]) -> DirId {
    let max_depth = if ids.len() <= 1 {
        0
    } else {
        usize::BITS - 1 - ids.len().leading_zeros()
    };
    build_span(entries, ids, 0, max_depth)
}

fn build_span(entries: &mut [DirEntry], ids: &[DirId], depth: u32, max_depth: u32) -> DirId {
    if ids.is_empty() {
        return DirId::NONE;
    }
    let mid = ids.len() / 2;
    let id = ids[mid];
    let left = build_span(entries, &ids[..mid], depth + 1, max_depth);
    let right = build_span(entries, &ids[mid + 1..], depth + 1, max_depth);
    let entry = &mut entries[id.index()];
    entry.left = left;
    entry.right = right;
    // The partially-filled deepest level is red, everything above black;
    // that satisfies the black-height rule for any list length.
    entry.color = if depth == max_depth && depth > 0 {
        Color::Red
    } else {
        Color::Black
    };
    id
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::dir::entry::EntryType;

    fn stream_entry(name: &str) -> DirEntry {
        DirEntry {
            name: name.into(),
            entry_type: EntryType::Stream,
            ..DirEntry::empty()
        }
    }

    fn build(names: &[&str]) -> (Vec<DirEntry>, DirId) {
        let mut entries: Vec<DirEntry> = names.iter().map(|n| stream_entry(n)).collect();
        let mut root = DirId::NONE;
        for i in 0..entries.len() {
            root = insert(&mut entries, root, DirId(i as u32));
        }
        (entries, root)
    }

    fn names_in_order(entries: &[DirEntry], root: DirId) -> Vec<String> {
        in_order(entries, root)
            .unwrap()
            .into_iter()
            .map(|id| entries[id.index()].name.clone())
            .collect()
    }

    #[test]
    fn test_insert_keeps_order_and_balance() {
        let (entries, root) = build(&["m", "c", "x", "a", "e", "t", "z", "b", "d"]);
        assert_eq!(
            names_in_order(&entries, root),
            vec!["a", "b", "c", "d", "e", "m", "t", "x", "z"]
        );
        assert_eq!(validate(&entries, root).unwrap(), TreeHealth::Healthy);
    }

    #[test]
    fn test_sequential_insert_stays_balanced() {
        let names: Vec<String> = (0..64).map(|i| format!("n{i:02}")).collect();
        let refs: Vec<&str> = names.iter().map(String::as_str).collect();
        let (entries, root) = build(&refs);
        assert_eq!(validate(&entries, root).unwrap(), TreeHealth::Healthy);

        // A red-black tree of 64 nodes is at most 2*log2(65) deep.
        fn depth(entries: &[DirEntry], id: DirId) -> usize {
            if id.is_none() {
                0
            } else {
                1 + depth(entries, entries[id.index()].left)
                    .max(depth(entries, entries[id.index()].right))
            }
        }
        assert!(depth(&entries, root) <= 12);
    }

    #[test]
    fn test_remove_leaf_and_internal() {
        let (mut entries, mut root) = build(&["d", "b", "f", "a", "c", "e", "g"]);
        // Leaf
        let id_a = (0..entries.len())
            .map(|i| DirId(i as u32))
            .find(|id| entries[id.index()].name == "a")
            .unwrap();
        root = remove(&mut entries, root, id_a);
        assert_eq!(names_in_order(&entries, root), vec!["b", "c", "d", "e", "f", "g"]);
        assert_eq!(validate(&entries, root).unwrap(), TreeHealth::Healthy);

        // Internal node with two children
        let id_d = (0..entries.len())
            .map(|i| DirId(i as u32))
            .find(|id| entries[id.index()].name == "d")
            .unwrap();
        root = remove(&mut entries, root, id_d);
        assert_eq!(names_in_order(&entries, root), vec!["b", "c", "e", "f", "g"]);
        assert_eq!(validate(&entries, root).unwrap(), TreeHealth::Healthy);
    }

    #[test]
    fn test_remove_all() {
        let (mut entries, mut root) = build(&["e", "c", "g", "a", "d", "f", "h", "b"]);
        let mut remaining = 8;
        // Remove in a mixed order, validating after every step.
        for name in ["e", "a", "h", "c", "b", "g", "f", "d"] {
            let id = (0..entries.len())
                .map(|i| DirId(i as u32))
                .find(|id| entries[id.index()].name == name)
                .unwrap();
            root = remove(&mut entries, root, id);
            remaining -= 1;
            assert_eq!(in_order(&entries, root).unwrap().len(), remaining);
            assert_eq!(validate(&entries, root).unwrap(), TreeHealth::Healthy);
        }
        assert!(root.is_none());
    }

    #[test]
    fn test_loop_detection() {
        let (mut entries, root) = build(&["b", "a", "c"]);
        // Point a leaf back at the root
        let id_c = (0..entries.len())
            .map(|i| DirId(i as u32))
            .find(|id| entries[id.index()].name == "c")
            .unwrap();
        entries[id_c.index()].right = root;
        assert!(matches!(
            in_order(&entries, root),
            Err(CompoundError::DirLoop(_))
        ));
    }

    #[test]
    fn test_validate_detects_miscoloring() {
        let (mut entries, root) = build(&["b", "a", "c"]);
        entries[root.index()].color = Color::Red;
        assert_eq!(validate(&entries, root).unwrap(), TreeHealth::Miscolored);
    }

    #[test]
    fn test_validate_detects_disorder() {
        let (mut entries, root) = build(&["b", "a", "c"]);
        entries[root.index()].name = "zzzz".into();
        assert_eq!(validate(&entries, root).unwrap(), TreeHealth::Disordered);
    }

    #[test]
    fn test_build_balanced_is_healthy() {
        for n in 0..40 {
            let names: Vec<String> = (0..n).map(|i| format!("n{i:02}")).collect();
            let mut entries: Vec<DirEntry> =
                names.iter().map(|s| stream_entry(s)).collect();
            let ids: Vec<DirId> = (0..n).map(|i| DirId(i as u32)).collect();
            let root = build_balanced(&mut entries, &ids);
            assert_eq!(
                validate(&entries, root).unwrap(),
                TreeHealth::Healthy,
                "n = {n}"
            );
            assert_eq!(in_order(&entries, root).unwrap().len(), n);
        }
    }

    mod properties {
        use super::*;
        use proptest::prelude::*;

        proptest! {
            #[test]
            fn random_insert_remove_preserves_invariants(
                names in proptest::collection::vec("[a-p]{1,4}", 1..40),
                removals in proptest::collection::vec(any::<prop::sample::Index>(), 0..20),
            ) {
                let mut entries: Vec<DirEntry> = Vec::new();
                let mut root = DirId::NONE;
                let mut live: Vec<DirId> = Vec::new();
                for name in &names {
                    // Skip duplicates; storage ties are forbidden upstream.
                    if live.iter().any(|id| {
                        cmp_names(&entries[id.index()].name, name) == Ordering::Equal
                    }) {
                        continue;
                    }
                    entries.push(stream_entry(name));
                    let id = DirId((entries.len() - 1) as u32);
                    root = insert(&mut entries, root, id);
                    live.push(id);
                    prop_assert_eq!(validate(&entries, root).unwrap(), TreeHealth::Healthy);
                }
                for pick in removals {
                    if live.is_empty() {
                        break;
                    }
                    let id = live.remove(pick.index(live.len()));
                    root = remove(&mut entries, root, id);
                    prop_assert_eq!(validate(&entries, root).unwrap(), TreeHealth::Healthy);
                    prop_assert_eq!(in_order(&entries, root).unwrap().len(), live.len());
                }
            }
        }
    }
}
