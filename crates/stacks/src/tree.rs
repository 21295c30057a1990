//! Arena splay tree ordered by logical time.
//!
//! Nodes live in a `Vec` and link to each other by index; freed slots are recycled through a
//! free list. Every node carries a `size` (1 per access for the exact stack, the number of merged
//! accesses for the approximate stack) and a subtree `weight`, the sum of sizes below it. The
//! reuse distance of a node is the weight of everything newer than it, which after splaying the
//! node to the root is simply the weight of its right subtree.
//!
//! Splaying is top-down with weight repair along the left and right assembly chains, so every
//! lookup is amortized O(log n).

use crate::common::{RdaError, Result};

const NIL: usize = usize::MAX;

/// One node as seen from outside the tree.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct Entry<V> {
    /// Logical time of the node; unique within the tree.
    pub time: u64,
    /// Number of accesses the node stands for.
    pub size: u64,
    /// Caller payload.
    pub value: V,
}

#[derive(Clone, Copy, Debug)]
struct Node<V> {
    time: u64,
    size: u64,
    weight: u64,
    left: usize,
    right: usize,
    value: V,
}

/// Weighted splay tree keyed by logical time.
#[derive(Clone, Debug)]
pub struct SplayTree<V> {
    nodes: Vec<Node<V>>,
    free: Vec<usize>,
    root: usize,
    len: usize,
}

impl<V: Copy> Default for SplayTree<V> {
    fn default() -> Self {
        Self::new()
    }
}

impl<V: Copy> SplayTree<V> {
    /// Creates an empty tree.
    pub const fn new() -> Self {
        Self {
            nodes: Vec::new(),
            free: Vec::new(),
            root: NIL,
            len: 0,
        }
    }

    /// Number of live nodes.
    pub const fn len(&self) -> usize {
        self.len
    }

    /// Returns `true` if the tree holds no nodes.
    pub const fn is_empty(&self) -> bool {
        self.len == 0
    }

    /// Sum of all node sizes.
    pub fn total_weight(&self) -> u64 {
        self.weight(self.root)
    }

    /// Removes every node and releases the free list.
    pub fn clear(&mut self) {
        self.nodes.clear();
        self.free.clear();
        self.root = NIL;
        self.len = 0;
    }

    #[inline]
    fn weight(&self, idx: usize) -> u64 {
        if idx == NIL { 0 } else { self.nodes[idx].weight }
    }

    #[inline]
    fn refresh(&mut self, idx: usize) {
        let n = self.nodes[idx];
        self.nodes[idx].weight = n.size + self.weight(n.left) + self.weight(n.right);
    }

    fn alloc(&mut self, time: u64, size: u64, value: V) -> Result<usize> {
        let node = Node {
            time,
            size,
            weight: size,
            left: NIL,
            right: NIL,
            value,
        };
        if let Some(idx) = self.free.pop() {
            self.nodes[idx] = node;
            return Ok(idx);
        }
        self.nodes
            .try_reserve(1)
            .map_err(|e| RdaError::allocation("stack tree", e))?;
        self.nodes.push(node);
        Ok(self.nodes.len() - 1)
    }

    fn release(&mut self, idx: usize) {
        self.free.push(idx);
        self.len -= 1;
    }

    /// Top-down splay: brings the node with `key`, or the last node on its search path, to the
    /// root.
    fn splay(&mut self, key: u64) {
        let mut t = self.root;
        if t == NIL {
            return;
        }
        // Tails of the left and right assembly trees, NIL while still at the header.
        let mut l = NIL;
        let mut r = NIL;
        // Roots of the left and right assembly trees.
        let mut left_root = NIL;
        let mut right_root = NIL;
        let mut l_weight = 0;
        let mut r_weight = 0;

        loop {
            let time = self.nodes[t].time;
            if key < time {
                let mut child = self.nodes[t].left;
                if child == NIL {
                    break;
                }
                if key < self.nodes[child].time {
                    // Rotate right.
                    self.nodes[t].left = self.nodes[child].right;
                    self.nodes[child].right = t;
                    self.refresh(t);
                    t = child;
                    child = self.nodes[t].left;
                    if child == NIL {
                        break;
                    }
                }
                // Link right.
                if r == NIL {
                    right_root = t;
                } else {
                    self.nodes[r].left = t;
                }
                r = t;
                t = child;
                r_weight += self.weight(self.nodes[r].right) + self.nodes[r].size;
            } else if key > time {
                let mut child = self.nodes[t].right;
                if child == NIL {
                    break;
                }
                if key > self.nodes[child].time {
                    // Rotate left.
                    self.nodes[t].right = self.nodes[child].left;
                    self.nodes[child].left = t;
                    self.refresh(t);
                    t = child;
                    child = self.nodes[t].right;
                    if child == NIL {
                        break;
                    }
                }
                // Link left.
                if l == NIL {
                    left_root = t;
                } else {
                    self.nodes[l].right = t;
                }
                l = t;
                t = child;
                l_weight += self.weight(self.nodes[l].left) + self.nodes[l].size;
            } else {
                break;
            }
        }

        let (t_left, t_right) = (self.nodes[t].left, self.nodes[t].right);
        l_weight += self.weight(t_left);
        r_weight += self.weight(t_right);
        self.nodes[t].weight = l_weight + r_weight + self.nodes[t].size;

        if l != NIL {
            self.nodes[l].right = NIL;
        }
        if r != NIL {
            self.nodes[r].left = NIL;
        }

        // Each chain node's final subtree is everything from it down the chain plus the subtree
        // of `t` that will hang off the tail.
        let mut y = left_root;
        while y != NIL {
            self.nodes[y].weight = l_weight;
            l_weight -= self.nodes[y].size + self.weight(self.nodes[y].left);
            y = self.nodes[y].right;
        }
        let mut y = right_root;
        while y != NIL {
            self.nodes[y].weight = r_weight;
            r_weight -= self.nodes[y].size + self.weight(self.nodes[y].right);
            y = self.nodes[y].left;
        }

        if l == NIL {
            left_root = t_left;
        } else {
            self.nodes[l].right = t_left;
        }
        if r == NIL {
            right_root = t_right;
        } else {
            self.nodes[r].left = t_right;
        }
        self.nodes[t].left = left_root;
        self.nodes[t].right = right_root;
        self.root = t;
    }

    /// Inserts a node at `time`.
    ///
    /// # Errors
    ///
    /// Returns [`RdaError::Allocation`] if the arena cannot grow.
    ///
    /// # Panics
    ///
    /// Panics if a node with the same time already exists.
    pub fn insert(&mut self, time: u64, size: u64, value: V) -> Result<()> {
        let idx = self.alloc(time, size, value)?;
        self.len += 1;
        if self.root == NIL {
            self.root = idx;
            return Ok(());
        }
        self.splay(time);
        let root = self.root;
        let root_time = self.nodes[root].time;
        assert_ne!(root_time, time, "duplicate stack time {time}");
        if root_time < time {
            let right = self.nodes[root].right;
            self.nodes[idx].left = root;
            self.nodes[idx].right = right;
            self.nodes[root].right = NIL;
        } else {
            let left = self.nodes[root].left;
            self.nodes[idx].right = root;
            self.nodes[idx].left = left;
            self.nodes[root].left = NIL;
        }
        self.refresh(root);
        self.refresh(idx);
        self.root = idx;
        Ok(())
    }

    /// Removes the node at `time`, returning its entry.
    pub fn remove(&mut self, time: u64) -> Option<Entry<V>> {
        if self.root == NIL {
            return None;
        }
        self.splay(time);
        let root = self.root;
        let node = self.nodes[root];
        if node.time != time {
            return None;
        }
        if node.left == NIL {
            self.root = node.right;
        } else {
            // Every key on the left is smaller, so splaying `time` brings the maximum up and
            // leaves its right link empty.
            self.root = node.left;
            self.splay(time);
            let new_root = self.root;
            self.nodes[new_root].right = node.right;
            self.refresh(new_root);
        }
        self.release(root);
        Some(Entry {
            time: node.time,
            size: node.size,
            value: node.value,
        })
    }

    /// Splays the node at `time` to the root and returns the weight of all newer nodes.
    ///
    /// Returns `None` if no node has exactly this time.
    pub fn rank(&mut self, time: u64) -> Option<u64> {
        if self.root == NIL {
            return None;
        }
        self.splay(time);
        let root = &self.nodes[self.root];
        (root.time == time).then(|| self.weight(root.right))
    }

    /// Splays the oldest node with time `>= time` to the root.
    ///
    /// Returns that node's time and the weight of all newer nodes, or `None` if every node is
    /// older than `time`.
    pub fn ceiling(&mut self, time: u64) -> Option<(u64, u64)> {
        if self.root == NIL {
            return None;
        }
        self.splay(time);
        let root = self.root;
        if self.nodes[root].time < time {
            let mut succ = self.nodes[root].right;
            if succ == NIL {
                return None;
            }
            while self.nodes[succ].left != NIL {
                succ = self.nodes[succ].left;
            }
            let succ_time = self.nodes[succ].time;
            self.splay(succ_time);
        }
        let root = &self.nodes[self.root];
        Some((root.time, self.weight(root.right)))
    }

    /// Entry at the root, typically the node located by the last lookup.
    pub fn root(&self) -> Option<Entry<V>> {
        (self.root != NIL).then(|| {
            let n = &self.nodes[self.root];
            Entry {
                time: n.time,
                size: n.size,
                value: n.value,
            }
        })
    }

    /// Replaces the payload of the root node.
    ///
    /// # Panics
    ///
    /// Panics on an empty tree.
    pub fn set_root_value(&mut self, value: V) {
        assert!(self.root != NIL, "payload update on an empty tree");
        self.nodes[self.root].value = value;
    }

    /// Decrements the size of the root node and returns the remaining size.
    ///
    /// # Panics
    ///
    /// Panics on an empty tree or a root of size zero.
    pub fn shrink_root(&mut self) -> u64 {
        assert!(self.root != NIL, "shrink on an empty tree");
        let root = &mut self.nodes[self.root];
        assert!(root.size > 0, "shrink of an empty node at time {}", root.time);
        root.size -= 1;
        root.weight -= 1;
        root.size
    }

    /// Node holding position `depth`, counting sizes from the newest node (depth 0).
    ///
    /// Does not splay.
    pub fn nth_newest(&self, depth: u64) -> Option<Entry<V>> {
        let mut remaining = depth;
        let mut idx = self.root;
        while idx != NIL {
            let n = &self.nodes[idx];
            let newer = self.weight(n.right);
            if remaining < newer {
                idx = n.right;
            } else if remaining - newer < n.size {
                return Some(Entry {
                    time: n.time,
                    size: n.size,
                    value: n.value,
                });
            } else {
                remaining -= newer + n.size;
                idx = n.left;
            }
        }
        None
    }

    /// All nodes from oldest to newest.
    pub fn entries(&self) -> Vec<Entry<V>> {
        let mut out = Vec::with_capacity(self.len);
        let mut stack = Vec::new();
        let mut idx = self.root;
        while idx != NIL || !stack.is_empty() {
            while idx != NIL {
                stack.push(idx);
                idx = self.nodes[idx].left;
            }
            if let Some(top) = stack.pop() {
                let n = &self.nodes[top];
                out.push(Entry {
                    time: n.time,
                    size: n.size,
                    value: n.value,
                });
                idx = n.right;
            }
        }
        out
    }

    /// Replaces the tree with `entries` by plain binary-search-tree insertion in the given order.
    ///
    /// Callers shuffle the entries first so the result has logarithmic expected depth.
    ///
    /// # Errors
    ///
    /// Returns [`RdaError::Allocation`] if the arena cannot grow.
    ///
    /// # Panics
    ///
    /// Panics on duplicate times.
    pub fn rebuild(&mut self, entries: &[Entry<V>]) -> Result<()> {
        self.clear();
        self.nodes
            .try_reserve(entries.len())
            .map_err(|e| RdaError::allocation("stack tree", e))?;
        for e in entries {
            let idx = self.alloc(e.time, e.size, e.value)?;
            self.len += 1;
            if self.root == NIL {
                self.root = idx;
                continue;
            }
            let mut cur = self.root;
            loop {
                self.nodes[cur].weight += e.size;
                let cur_time = self.nodes[cur].time;
                assert_ne!(cur_time, e.time, "duplicate stack time {cur_time}");
                let next = if e.time < cur_time {
                    &mut self.nodes[cur].left
                } else {
                    &mut self.nodes[cur].right
                };
                if *next == NIL {
                    *next = idx;
                    break;
                }
                cur = *next;
            }
        }
        Ok(())
    }

    /// Validates ordering, weights, and the node count.
    ///
    /// # Panics
    ///
    /// Panics on any structural violation.
    pub fn check(&self) {
        let mut count = 0usize;
        let mut prev: Option<u64> = None;
        let mut stack = Vec::new();
        let mut idx = self.root;
        while idx != NIL || !stack.is_empty() {
            while idx != NIL {
                stack.push(idx);
                idx = self.nodes[idx].left;
            }
            if let Some(top) = stack.pop() {
                let n = &self.nodes[top];
                if let Some(p) = prev {
                    assert!(p < n.time, "stack times out of order: {p} before {}", n.time);
                }
                let expected = n.size + self.weight(n.left) + self.weight(n.right);
                assert_eq!(n.weight, expected, "bad subtree weight at time {}", n.time);
                prev = Some(n.time);
                count += 1;
                idx = n.right;
            }
        }
        assert_eq!(count, self.len, "stack node count mismatch");
    }
}
