//! Arena-backed Fibonacci heap.
//!
//! Nodes live in a flat `Vec` and refer to each other (parent, first child,
//! left/right siblings) by index, so the circular sibling lists need no
//! shared ownership. Callers hold a [`Handle`] (index + generation); a handle
//! whose node has been removed is detected as stale rather than aliasing
//! whatever node reused the slot.
//!
//! Amortized costs: `insert`, `decrease_key` and `absorb` (root splice) O(1),
//! `extract_min` and `delete` O(log n). Equal keys pop in insertion order.

use std::cmp::Ordering;

use crate::error::HeapError;

#[cfg(test)]
mod tests;

/// Stable reference to an entry in a [`FibonacciHeap`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct Handle {
    index: u32,
    generation: u32,
}

/// Translates handles issued by an absorbed heap into the absorbing heap.
#[derive(Debug, Clone, Copy)]
pub struct Rebase {
    offset: u32,
}

impl Rebase {
    pub fn translate(&self, handle: Handle) -> Handle {
        Handle {
            index: handle.index + self.offset,
            generation: handle.generation,
        }
    }
}

struct Node<T> {
    key: f64,
    /// Insertion sequence, breaks ties between equal keys.
    seq: u64,
    item: T,
    degree: usize,
    mark: bool,
    parent: Option<usize>,
    child: Option<usize>,
    left: usize,
    right: usize,
}

struct Slot<T> {
    generation: u32,
    node: Option<Node<T>>,
}

/// Min-ordered Fibonacci heap over `f64` keys carrying an opaque item.
pub struct FibonacciHeap<T> {
    slots: Vec<Slot<T>>,
    free: Vec<usize>,
    min: Option<usize>,
    len: usize,
    next_seq: u64,
}

impl<T> Default for FibonacciHeap<T> {
    fn default() -> Self {
        Self::new()
    }
}

fn invariant_violated(what: &str) -> ! {
    panic!("scheduler invariant violated: {what}")
}

impl<T> FibonacciHeap<T> {
    pub fn new() -> Self {
        Self {
            slots: Vec::new(),
            free: Vec::new(),
            min: None,
            len: 0,
            next_seq: 0,
        }
    }

    pub fn len(&self) -> usize {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    /// Add a singleton tree to the root list.
    pub fn insert(&mut self, key: f64, item: T) -> Handle {
        let seq = self.next_seq;
        self.next_seq += 1;
        let i = self.alloc(Node {
            key,
            seq,
            item,
            degree: 0,
            mark: false,
            parent: None,
            child: None,
            left: 0,
            right: 0,
        });
        self.add_root(i);
        match self.min {
            Some(m) if !self.precedes(i, m) => {}
            _ => self.min = Some(i),
        }
        self.len += 1;
        self.handle_of(i)
    }

    pub fn peek_min(&self) -> Option<f64> {
        self.min.map(|m| self.node(m).key)
    }

    pub fn peek_min_entry(&self) -> Option<(f64, &T)> {
        self.min.map(|m| {
            let n = self.node(m);
            (n.key, &n.item)
        })
    }

    /// Remove and return the minimum entry.
    pub fn extract_min(&mut self) -> Result<(f64, T), HeapError> {
        if self.min.is_none() {
            return Err(HeapError::Empty);
        }
        let node = self.take_min();
        if let Some(m) = self.min {
            if self.node(m).key.total_cmp(&node.key) == Ordering::Less {
                invariant_violated("extracted key is larger than the remaining minimum");
            }
        }
        Ok((node.key, node.item))
    }

    /// Lower the key of an entry. `new_key` must be strictly smaller.
    pub fn decrease_key(&mut self, handle: Handle, new_key: f64) -> Result<(), HeapError> {
        let i = self.resolve(handle)?;
        let current = self.node(i).key;
        if !(new_key < current) {
            return Err(HeapError::InvalidKey {
                current,
                requested: new_key,
            });
        }
        self.node_mut(i).key = new_key;
        if let Some(p) = self.node(i).parent {
            if self.precedes(i, p) {
                self.cut(i, p);
                self.cascading_cut(p);
            }
        }
        if let Some(m) = self.min {
            if self.precedes(i, m) {
                self.min = Some(i);
            }
        }
        Ok(())
    }

    /// Remove an arbitrary entry, returning its key and item.
    pub fn delete(&mut self, handle: Handle) -> Result<(f64, T), HeapError> {
        let i = self.resolve(handle)?;
        if let Some(p) = self.node(i).parent {
            self.cut(i, p);
            self.cascading_cut(p);
        }
        // Forcing the node to be the minimum is the "decrease to -inf" step.
        self.min = Some(i);
        let node = self.take_min();
        Ok((node.key, node.item))
    }

    pub fn key(&self, handle: Handle) -> Result<f64, HeapError> {
        let i = self.resolve(handle)?;
        Ok(self.node(i).key)
    }

    pub fn get(&self, handle: Handle) -> Option<&T> {
        self.resolve(handle).ok().map(|i| &self.node(i).item)
    }

    pub fn contains(&self, handle: Handle) -> bool {
        self.resolve(handle).is_ok()
    }

    /// Meld two heaps. Handles from `other` must be translated; use
    /// [`FibonacciHeap::absorb`] when they are still needed.
    pub fn merge(mut self, other: Self) -> Self {
        self.absorb(other);
        self
    }

    /// Move every entry of `other` into `self`.
    ///
    /// The root lists are spliced in O(1); `other`'s arena is appended, which
    /// is a bulk move proportional to its slot count. Entries of `other` tie
    /// after existing entries with equal keys.
    pub fn absorb(&mut self, other: Self) -> Rebase {
        let offset = self.slots.len();
        let seq_offset = self.next_seq;
        for slot in other.slots {
            let node = slot.node.map(|mut n| {
                n.seq += seq_offset;
                n.parent = n.parent.map(|p| p + offset);
                n.child = n.child.map(|c| c + offset);
                n.left += offset;
                n.right += offset;
                n
            });
            self.slots.push(Slot {
                generation: slot.generation,
                node,
            });
        }
        self.free.extend(other.free.into_iter().map(|f| f + offset));
        self.next_seq += other.next_seq;
        self.len += other.len;

        if let Some(om) = other.min.map(|m| m + offset) {
            match self.min {
                None => self.min = Some(om),
                Some(m) => {
                    let m_right = self.node(m).right;
                    let om_left = self.node(om).left;
                    self.node_mut(m).right = om;
                    self.node_mut(om).left = m;
                    self.node_mut(om_left).right = m_right;
                    self.node_mut(m_right).left = om_left;
                    if self.precedes(om, m) {
                        self.min = Some(om);
                    }
                }
            }
        }
        Rebase {
            offset: offset as u32,
        }
    }

    // ── Internals ─────────────────────────────────────────────

    fn node(&self, i: usize) -> &Node<T> {
        match self.slots.get(i).and_then(|s| s.node.as_ref()) {
            Some(n) => n,
            None => invariant_violated("dangling arena index"),
        }
    }

    fn node_mut(&mut self, i: usize) -> &mut Node<T> {
        match self.slots.get_mut(i).and_then(|s| s.node.as_mut()) {
            Some(n) => n,
            None => invariant_violated("dangling arena index"),
        }
    }

    fn handle_of(&self, i: usize) -> Handle {
        Handle {
            index: i as u32,
            generation: self.slots[i].generation,
        }
    }

    fn resolve(&self, handle: Handle) -> Result<usize, HeapError> {
        let i = handle.index as usize;
        match self.slots.get(i) {
            Some(slot) if slot.generation == handle.generation && slot.node.is_some() => Ok(i),
            _ => Err(HeapError::StaleHandle(handle)),
        }
    }

    fn alloc(&mut self, node: Node<T>) -> usize {
        match self.free.pop() {
            Some(i) => {
                self.slots[i].node = Some(node);
                i
            }
            None => {
                self.slots.push(Slot {
                    generation: 0,
                    node: Some(node),
                });
                self.slots.len() - 1
            }
        }
    }

    fn release(&mut self, i: usize) -> Node<T> {
        let slot = &mut self.slots[i];
        let node = match slot.node.take() {
            Some(n) => n,
            None => invariant_violated("double free of arena slot"),
        };
        slot.generation = slot.generation.wrapping_add(1);
        self.free.push(i);
        node
    }

    /// Strict ordering by (key, insertion sequence).
    fn precedes(&self, a: usize, b: usize) -> bool {
        let (x, y) = (self.node(a), self.node(b));
        match x.key.total_cmp(&y.key) {
            Ordering::Less => true,
            Ordering::Greater => false,
            Ordering::Equal => x.seq < y.seq,
        }
    }

    /// Insert `i` into the root list next to the current minimum.
    fn add_root(&mut self, i: usize) {
        self.node_mut(i).parent = None;
        match self.min {
            None => {
                let n = self.node_mut(i);
                n.left = i;
                n.right = i;
            }
            Some(m) => self.insert_after(m, i),
        }
    }

    fn insert_after(&mut self, anchor: usize, i: usize) {
        let r = self.node(anchor).right;
        {
            let n = self.node_mut(i);
            n.left = anchor;
            n.right = r;
        }
        self.node_mut(anchor).right = i;
        self.node_mut(r).left = i;
    }

    fn unlink(&mut self, i: usize) {
        let (l, r) = {
            let n = self.node(i);
            (n.left, n.right)
        };
        self.node_mut(l).right = r;
        self.node_mut(r).left = l;
        let n = self.node_mut(i);
        n.left = i;
        n.right = i;
    }

    fn siblings(&self, start: usize) -> Vec<usize> {
        let mut out = vec![start];
        let mut cur = self.node(start).right;
        while cur != start {
            out.push(cur);
            cur = self.node(cur).right;
        }
        out
    }

    /// Remove the node at `self.min`, promote its children and consolidate.
    fn take_min(&mut self) -> Node<T> {
        let z = match self.min {
            Some(z) => z,
            None => invariant_violated("take_min on empty heap"),
        };

        if let Some(c) = self.node(z).child {
            for child in self.siblings(c) {
                {
                    let n = self.node_mut(child);
                    n.parent = None;
                    n.mark = false;
                }
                self.insert_after(z, child);
            }
            let n = self.node_mut(z);
            n.child = None;
            n.degree = 0;
        }

        let right = self.node(z).right;
        if right == z {
            self.min = None;
        } else {
            self.unlink(z);
            self.min = Some(right);
            self.consolidate();
        }
        self.len -= 1;
        self.release(z)
    }

    /// Link roots of equal degree until all root degrees are distinct.
    fn consolidate(&mut self) {
        let start = match self.min {
            Some(m) => m,
            None => return,
        };
        let roots = self.siblings(start);
        let mut by_degree: Vec<Option<usize>> = Vec::new();

        for w in roots {
            let mut x = w;
            let mut d = self.node(x).degree;
            loop {
                if d >= by_degree.len() {
                    by_degree.resize(d + 1, None);
                }
                match by_degree[d].take() {
                    None => break,
                    Some(y) => {
                        let (parent, child) = if self.precedes(y, x) { (y, x) } else { (x, y) };
                        self.link(child, parent);
                        x = parent;
                        d += 1;
                    }
                }
            }
            by_degree[d] = Some(x);
        }

        self.min = None;
        for root in by_degree.into_iter().flatten() {
            match self.min {
                Some(m) if !self.precedes(root, m) => {}
                _ => self.min = Some(root),
            }
        }
    }

    /// Make root `y` a child of root `x`.
    fn link(&mut self, y: usize, x: usize) {
        self.unlink(y);
        {
            let n = self.node_mut(y);
            n.parent = Some(x);
            n.mark = false;
        }
        match self.node(x).child {
            None => self.node_mut(x).child = Some(y),
            Some(c) => self.insert_after(c, y),
        }
        self.node_mut(x).degree += 1;
    }

    /// Move `x` from `y`'s child list to the root list.
    fn cut(&mut self, x: usize, y: usize) {
        if self.node(x).right == x {
            self.node_mut(y).child = None;
        } else {
            if self.node(y).child == Some(x) {
                let next = self.node(x).right;
                self.node_mut(y).child = Some(next);
            }
            self.unlink(x);
        }
        self.node_mut(y).degree -= 1;
        self.add_root(x);
        self.node_mut(x).mark = false;
    }

    fn cascading_cut(&mut self, mut y: usize) {
        while let Some(z) = self.node(y).parent {
            if !self.node(y).mark {
                self.node_mut(y).mark = true;
                return;
            }
            self.cut(y, z);
            y = z;
        }
    }
}
