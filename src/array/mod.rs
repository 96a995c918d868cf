//! # Packed Array Nodes
//!
//! Every persistent structure in the database is built out of one on-disk
//! primitive: a bit-packed vector of integers with a self-describing
//! 8-byte header. Elements start at width 0 (every value is implicitly
//! zero, no payload at all) and widen on demand to 1, 2, 4, 8, 16, 32 or
//! 64 bits as values arrive; a node never narrows.
//!
//! Nodes reference each other by ref, forming trees: a node flagged
//! `has_refs` holds child refs in its elements, except that a value with
//! the low bit set is an inline tagged integer, not a ref (refs are
//! 8-byte aligned, so their low bits are always clear).
//!
//! ## The pool
//!
//! Live nodes are held in a [`NodePool`]: an arena of node state with
//! stable [`NodeId`]s, holding an exclusive borrow of the allocator for
//! its whole lifetime. The pool is what makes the parent back-edge
//! workable in Rust: a child records `(parent id, slot)` instead of a raw
//! pointer, and when a mutation reallocates the child, the pool walks
//! upward writing the new ref into the parent, which may itself
//! copy-on-write and reallocate, continuing the walk. The root's new ref
//! is simply observable on its handle afterwards.
//!
//! ## Copy-on-write
//!
//! Before mutating, a node asks the allocator whether its ref points into
//! committed (read-only) memory. If so it clones itself into a fresh slab
//! block with a little headroom and patches its parent slot; the
//! original bytes are never touched. Nodes already in slab memory
//! mutate in place.
//!
//! ## Lifecycle
//!
//! ```text
//! bind/create ──▶ bound ──mutation──▶ bound (new ref) ──destroy──▶ dead
//! ```
//!
//! Destroy recursively frees children (skipping tagged inline values and
//! null refs) and returns every block to the allocator's free pool. Using
//! a dead `NodeId` is a contract violation and asserts.

pub(crate) mod header;
mod scan;
mod width;

use eyre::{ensure, Result};
use smallvec::SmallVec;

use crate::alloc::{Ref, SlabAlloc};
use crate::error::StorageError;
use self::header::{WidthType, NODE_HEADER_SIZE};
pub use self::width::{bit_width, Width};

/// Stable handle to a live node in a [`NodePool`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct NodeId(u32);

/// What a fresh node is for.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NodeKind {
    /// Plain integers.
    Normal,
    /// Elements are refs to children (or low-bit-tagged inline values).
    HasRefs,
    /// Inner B+-tree node; implies `HasRefs`.
    InnerNode,
}

/// Decoded element of a `has_refs` node: the hand-rolled sum type behind
/// the low-bit tag.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Slot {
    /// A child ref; 0 is the null ref (empty subtree).
    Ref(Ref),
    /// An inline integer carried directly in the slot.
    Int(i64),
}

impl Slot {
    pub fn from_raw(raw: i64) -> Slot {
        if raw & 1 == 1 {
            Slot::Int(raw >> 1)
        } else {
            Slot::Ref(raw as Ref)
        }
    }

    pub fn to_raw(self) -> i64 {
        match self {
            Slot::Ref(r) => r as i64,
            Slot::Int(v) => (v << 1) | 1,
        }
    }
}

#[derive(Debug)]
struct Node {
    ref_: Ref,
    len: usize,
    width: Width,
    /// Byte capacity of the block, header included.
    cap_bytes: usize,
    wtype: WidthType,
    is_inner: bool,
    has_refs: bool,
    parent: Option<(NodeId, usize)>,
    alive: bool,
}

/// Arena of live nodes over an exclusively borrowed allocator.
#[derive(Debug)]
pub struct NodePool<'a> {
    alloc: &'a mut SlabAlloc,
    nodes: Vec<Node>,
}

impl<'a> NodePool<'a> {
    pub fn new(alloc: &'a mut SlabAlloc) -> Self {
        assert!(alloc.is_attached(), "allocator must be attached");
        Self {
            alloc,
            nodes: Vec::new(),
        }
    }

    pub fn allocator(&self) -> &SlabAlloc {
        self.alloc
    }

    /// Bind a handle to the existing node at `r`. Asserts on a malformed
    /// header.
    pub fn bind(&mut self, r: Ref) -> NodeId {
        assert!(r != 0, "cannot bind the null ref");
        let mut hdr = [0u8; NODE_HEADER_SIZE];
        hdr.copy_from_slice(self.alloc.bytes(r, NODE_HEADER_SIZE));

        let node = Node {
            ref_: r,
            len: header::len(&hdr),
            width: Width::from_bits(header::width(&hdr)),
            // On-disk blocks may carry a capacity equal to their byte
            // size; never trust it below the occupied size.
            cap_bytes: header::capacity(&hdr).max(header::byte_size(&hdr)),
            wtype: header::width_type(&hdr),
            is_inner: header::is_inner(&hdr),
            has_refs: header::has_refs(&hdr),
            parent: None,
            alive: true,
        };
        self.push(node)
    }

    /// Allocate a fresh, empty node of the given kind (width 0).
    pub fn create_empty(&mut self, kind: NodeKind) -> Result<NodeId> {
        let (is_inner, has_refs) = match kind {
            NodeKind::Normal => (false, false),
            NodeKind::HasRefs => (false, true),
            NodeKind::InnerNode => (true, true),
        };

        let cap = 128;
        let r = self.alloc.alloc(cap)?;
        header::init(
            self.alloc.bytes_mut(r, NODE_HEADER_SIZE),
            is_inner,
            has_refs,
            WidthType::Bits,
            0,
            0,
            cap,
        );

        Ok(self.push(Node {
            ref_: r,
            len: 0,
            width: Width::W0,
            cap_bytes: cap,
            wtype: WidthType::Bits,
            is_inner,
            has_refs,
            parent: None,
            alive: true,
        }))
    }

    /// Record that `parent[slot]` owns `child`, so reallocations of the
    /// child propagate a fresh ref upward.
    pub fn set_parent(&mut self, child: NodeId, parent: NodeId, slot: usize) {
        self.node_mut(child).parent = Some((parent, slot));
    }

    /// Detach a node from the tree relation (its memory is untouched).
    pub fn clear_parent(&mut self, id: NodeId) {
        self.node_mut(id).parent = None;
    }

    /// Bind the child node referenced from `slot` of a `has_refs` node
    /// and register the parent back-edge.
    pub fn get_sub_array(&mut self, id: NodeId, slot: usize) -> Result<NodeId> {
        let node = self.node(id);
        assert!(node.has_refs, "node has no child refs");
        assert!(slot < node.len);

        let raw = self.get(id, slot);
        ensure!(
            raw != 0 && raw & 1 == 0,
            "slot {} holds {:#x}, not a child ref",
            slot,
            raw
        );

        let child = self.bind(raw as Ref);
        self.node_mut(child).parent = Some((id, slot));
        Ok(child)
    }

    pub fn node_ref(&self, id: NodeId) -> Ref {
        self.node(id).ref_
    }

    pub fn len(&self, id: NodeId) -> usize {
        self.node(id).len
    }

    pub fn is_empty(&self, id: NodeId) -> bool {
        self.node(id).len == 0
    }

    pub fn width_bits(&self, id: NodeId) -> usize {
        self.node(id).width.bits()
    }

    pub fn has_refs(&self, id: NodeId) -> bool {
        self.node(id).has_refs
    }

    pub fn is_inner(&self, id: NodeId) -> bool {
        self.node(id).is_inner
    }

    /// Read element `i`. No side effects.
    pub fn get(&self, id: NodeId, i: usize) -> i64 {
        let node = self.node(id);
        assert!(i < node.len, "index {} out of bounds (len {})", i, node.len);
        width::get(self.payload(id), node.width, i)
    }

    /// Read element `i`, surfacing out-of-range as an error instead of a
    /// contract violation.
    pub fn try_get(&self, id: NodeId, i: usize) -> Result<i64> {
        let node = self.node(id);
        if i >= node.len {
            return Err(StorageError::OutOfRange {
                index: i,
                len: node.len,
            }
            .into());
        }
        Ok(width::get(self.payload(id), node.width, i))
    }

    pub fn back(&self, id: NodeId) -> i64 {
        let node = self.node(id);
        assert!(node.len > 0, "back() on an empty node");
        self.get(id, node.len - 1)
    }

    /// Decode element `i` of a `has_refs` node.
    pub fn slot(&self, id: NodeId, i: usize) -> Slot {
        debug_assert!(self.node(id).has_refs);
        Slot::from_raw(self.get(id, i))
    }

    /// Replace element `i`, widening the node if the value does not fit
    /// the current width.
    pub fn set(&mut self, id: NodeId, i: usize, value: i64) -> Result<()> {
        assert!(
            i < self.node(id).len,
            "index {} out of bounds (len {})",
            i,
            self.node(id).len
        );
        self.copy_on_write(id)?;

        if !self.node(id).width.contains(value) {
            let wide = Width::from_bits(bit_width(value));
            self.expand_width(id, wide)?;
        }

        let w = self.node(id).width;
        width::set(self.payload_mut(id), w, i, value);
        Ok(())
    }

    /// Insert `value` at position `i` (`i <= len`), shifting the tail.
    pub fn insert(&mut self, id: NodeId, i: usize, value: i64) -> Result<()> {
        assert!(
            i <= self.node(id).len,
            "insert position {} out of bounds (len {})",
            i,
            self.node(id).len
        );
        self.copy_on_write(id)?;

        let old_width = self.node(id).width;
        let old_len = self.node(id).len;
        let expand = !old_width.contains(value);
        let new_width = if expand {
            Width::from_bits(bit_width(value))
        } else {
            old_width
        };

        self.ensure_alloc(id, old_len + 1, new_width)?;
        let data = self.payload_mut(id);

        if expand || old_width.bits() < 8 {
            // Bit-packed widths cannot be memmoved; a widening rewrite
            // doubles as the shift. Top-down keeps unread old elements
            // ahead of the write front.
            for k in (i..old_len).rev() {
                let v = width::get(data, old_width, k);
                width::set(data, new_width, k + 1, v);
            }
        } else if i != old_len {
            let bytes = old_width.bits() / 8;
            data.copy_within(i * bytes..old_len * bytes, (i + 1) * bytes);
        }

        width::set(data, new_width, i, value);

        if expand {
            for k in (0..i).rev() {
                let v = width::get(data, old_width, k);
                width::set(data, new_width, k, v);
            }
        }
        Ok(())
    }

    /// Append `value`.
    pub fn add(&mut self, id: NodeId, value: i64) -> Result<()> {
        let len = self.node(id).len;
        self.insert(id, len, value)
    }

    /// Remove element `i`, shifting the tail left. The width is never
    /// narrowed.
    pub fn delete(&mut self, id: NodeId, i: usize) -> Result<()> {
        let len = self.node(id).len;
        assert!(i < len, "index {} out of bounds (len {})", i, len);
        self.copy_on_write(id)?;

        let w = self.node(id).width;
        let data = self.payload_mut(id);
        if w.bits() < 8 {
            for k in i + 1..len {
                let v = width::get(data, w, k);
                width::set(data, w, k - 1, v);
            }
        } else if i + 1 < len {
            let bytes = w.bits() / 8;
            data.copy_within((i + 1) * bytes..len * bytes, i * bytes);
        }

        self.store_len(id, len - 1);
        Ok(())
    }

    /// Truncate to `count` elements (`count <= len`); capacity and width
    /// unchanged.
    pub fn resize(&mut self, id: NodeId, count: usize) -> Result<()> {
        let len = self.node(id).len;
        assert!(count <= len, "resize {} beyond length {}", count, len);
        self.copy_on_write(id)?;
        self.store_len(id, count);
        Ok(())
    }

    /// Destroy children (if any), truncate to zero and reset the width;
    /// capacity is kept.
    pub fn clear(&mut self, id: NodeId) -> Result<()> {
        self.copy_on_write(id)?;

        if self.node(id).has_refs {
            for child in self.child_refs(id) {
                self.destroy_ref(child);
            }
        }

        let r = self.node(id).ref_;
        let hdr = self.alloc.bytes_mut(r, NODE_HEADER_SIZE);
        header::set_len(hdr, 0);
        header::set_width(hdr, 0);

        let node = self.node_mut(id);
        node.len = 0;
        node.width = Width::W0;
        Ok(())
    }

    /// Add `diff` to every element at `start..len` (ref fix-up helper).
    pub fn adjust(&mut self, id: NodeId, start: usize, diff: i64) -> Result<()> {
        let len = self.node(id).len;
        assert!(start <= len);
        for i in start..len {
            let v = self.get(id, i);
            self.set(id, i, v + diff)?;
        }
        Ok(())
    }

    /// Add `diff` to every element `>= limit`.
    pub fn increment_if(&mut self, id: NodeId, limit: i64, diff: i64) -> Result<()> {
        for i in 0..self.node(id).len {
            let v = self.get(id, i);
            if v >= limit {
                self.set(id, i, v + diff)?;
            }
        }
        Ok(())
    }

    /// First index in `start..end` equal to `value`. A value wider than
    /// the elements cannot be present and is answered without scanning.
    pub fn find(&self, id: NodeId, value: i64, start: usize, end: usize) -> Option<usize> {
        let node = self.node(id);
        let end = end.min(node.len);
        if start >= end || bit_width(value) > node.width.bits() {
            return None;
        }
        scan::find(self.payload(id), node.width, value, start, end)
    }

    /// Append `index + offset` to `out` for every match in `start..end`.
    pub fn find_all(
        &mut self,
        out: NodeId,
        id: NodeId,
        value: i64,
        offset: i64,
        start: usize,
        end: usize,
    ) -> Result<()> {
        let matches: SmallVec<[usize; 32]> = {
            let node = self.node(id);
            let end = end.min(node.len);
            let mut hits = SmallVec::new();
            if start < end && bit_width(value) <= node.width.bits() {
                scan::find_all(self.payload(id), node.width, value, start, end, &mut hits);
            }
            hits
        };

        for i in matches {
            self.add(out, i as i64 + offset)?;
        }
        Ok(())
    }

    /// Sum of elements in `start..end`.
    pub fn sum(&self, id: NodeId, start: usize, end: usize) -> i64 {
        let node = self.node(id);
        let end = end.min(node.len);
        if start >= end {
            return 0;
        }
        scan::sum(self.payload(id), node.width, start, end)
    }

    pub fn min(&self, id: NodeId, start: usize, end: usize) -> Option<i64> {
        let node = self.node(id);
        let end = end.min(node.len);
        if start >= end {
            return None;
        }
        let data = self.payload(id);
        let mut best = width::get(data, node.width, start);
        for i in start + 1..end {
            best = best.min(width::get(data, node.width, i));
        }
        Some(best)
    }

    pub fn max(&self, id: NodeId, start: usize, end: usize) -> Option<i64> {
        let node = self.node(id);
        let end = end.min(node.len);
        if start >= end {
            return None;
        }
        let data = self.payload(id);
        let mut best = width::get(data, node.width, start);
        for i in start + 1..end {
            best = best.max(width::get(data, node.width, i));
        }
        Some(best)
    }

    /// Position of the first element greater than `target` (inner-node
    /// child lookup: everything before it is `<= target`). `None` when no
    /// element is greater.
    pub fn find_pos(&self, id: NodeId, target: i64) -> Option<usize> {
        let len = self.node(id).len;
        let mut low: isize = -1;
        let mut high = len as isize;
        while high - low > 1 {
            let probe = ((low + high) / 2) as usize;
            if self.get(id, probe) > target {
                high = probe as isize;
            } else {
                low = probe as isize;
            }
        }
        if high == len as isize {
            None
        } else {
            Some(high as usize)
        }
    }

    /// Position of the first element `>= target` (sorted-index lower
    /// bound). Ties resolve to the lowest index. `None` when every
    /// element is smaller.
    pub fn find_pos_upper(&self, id: NodeId, target: i64) -> Option<usize> {
        let len = self.node(id).len;
        let mut low: isize = -1;
        let mut high = len as isize;
        while high - low > 1 {
            let probe = ((low + high) / 2) as usize;
            if self.get(id, probe) < target {
                low = probe as isize;
            } else {
                high = probe as isize;
            }
        }
        if high == len as isize {
            None
        } else {
            Some(high as usize)
        }
    }

    /// In-place quicksort.
    pub fn sort(&mut self, id: NodeId) -> Result<()> {
        self.copy_on_write(id)?;
        let (len, w) = {
            let node = self.node(id);
            (node.len, node.width)
        };
        if len > 1 {
            quicksort(self.payload_mut(id), w, 0, len - 1);
        }
        Ok(())
    }

    /// Recursively free this node and every child reachable through
    /// non-tagged, non-null refs. The handle is dead afterwards.
    pub fn destroy(&mut self, id: NodeId) {
        let r = self.node(id).ref_;
        self.destroy_ref(r);
        let node = self.node_mut(id);
        node.alive = false;
        node.parent = None;
    }

    fn destroy_ref(&mut self, r: Ref) {
        let mut hdr = [0u8; NODE_HEADER_SIZE];
        hdr.copy_from_slice(self.alloc.bytes(r, NODE_HEADER_SIZE));

        if header::has_refs(&hdr) {
            let len = header::len(&hdr);
            let w = Width::from_bits(header::width(&hdr));
            let children: SmallVec<[Ref; 16]> = {
                let data = &self.alloc.bytes(r, header::byte_size(&hdr))[NODE_HEADER_SIZE..];
                (0..len)
                    .filter_map(|i| {
                        let v = width::get(data, w, i);
                        // tagged inline values and null refs are not
                        // subtrees
                        (v != 0 && v & 1 == 0).then_some(v as Ref)
                    })
                    .collect()
            };
            for child in children {
                self.destroy_ref(child);
            }
        }

        self.alloc.free(r);
    }

    fn node(&self, id: NodeId) -> &Node {
        let node = &self.nodes[id.0 as usize];
        assert!(node.alive, "use of a destroyed node");
        node
    }

    fn node_mut(&mut self, id: NodeId) -> &mut Node {
        let node = &mut self.nodes[id.0 as usize];
        assert!(node.alive, "use of a destroyed node");
        node
    }

    fn push(&mut self, node: Node) -> NodeId {
        let id = NodeId(u32::try_from(self.nodes.len()).expect("node pool overflow"));
        self.nodes.push(node);
        id
    }

    fn payload(&self, id: NodeId) -> &[u8] {
        let node = self.node(id);
        &self.alloc.bytes(node.ref_, node.cap_bytes)[NODE_HEADER_SIZE..]
    }

    fn payload_mut(&mut self, id: NodeId) -> &mut [u8] {
        let (r, cap) = {
            let node = self.node(id);
            (node.ref_, node.cap_bytes)
        };
        &mut self.alloc.bytes_mut(r, cap)[NODE_HEADER_SIZE..]
    }

    fn store_len(&mut self, id: NodeId, len: usize) {
        let r = self.node(id).ref_;
        header::set_len(self.alloc.bytes_mut(r, NODE_HEADER_SIZE), len);
        self.node_mut(id).len = len;
    }

    /// Take exclusive ownership of this node's bytes before a mutation:
    /// committed memory is cloned into a slab block with headroom, and
    /// the new ref is propagated to the parent.
    fn copy_on_write(&mut self, id: NodeId) -> Result<()> {
        let (r, len, w, wtype) = {
            let node = self.node(id);
            (node.ref_, node.len, node.width, node.wtype)
        };
        if !self.alloc.is_read_only(r) {
            return Ok(());
        }

        let used = header::byte_len(len, w.bits(), wtype);
        let new_cap = round_up_8(used) + 64;
        let new_ref = self.alloc.alloc(new_cap)?;
        self.alloc.copy_block(r, new_ref, used);
        header::set_capacity(self.alloc.bytes_mut(new_ref, NODE_HEADER_SIZE), new_cap);

        {
            let node = self.node_mut(id);
            node.ref_ = new_ref;
            node.cap_bytes = new_cap;
        }
        self.update_parent_slot(id)
    }

    /// Make room for `count` elements at `width`, reallocating with
    /// capacity doubling when needed, and store the new width and length.
    /// Callers have already copy-on-written.
    fn ensure_alloc(&mut self, id: NodeId, count: usize, width: Width) -> Result<()> {
        let (r, cap_bytes, wtype) = {
            let node = self.node(id);
            (node.ref_, node.cap_bytes, node.wtype)
        };

        let needed = header::byte_len(count, width.bits(), wtype);
        if needed > cap_bytes {
            let mut new_cap = (cap_bytes * 2).max(128);
            if new_cap < needed {
                new_cap = round_up_8(needed);
            }

            let new_ref = self.alloc.realloc(r, cap_bytes, new_cap)?;
            header::set_capacity(self.alloc.bytes_mut(new_ref, NODE_HEADER_SIZE), new_cap);
            {
                let node = self.node_mut(id);
                node.ref_ = new_ref;
                node.cap_bytes = new_cap;
            }
            self.update_parent_slot(id)?;
        }

        let r = self.node(id).ref_;
        let hdr = self.alloc.bytes_mut(r, NODE_HEADER_SIZE);
        header::set_width(hdr, width.bits());
        header::set_len(hdr, count);

        let node = self.node_mut(id);
        node.width = width;
        node.len = count;
        Ok(())
    }

    /// Rewrite every element at a wider width, in place, from the top
    /// down so unread old elements stay ahead of the write front.
    fn expand_width(&mut self, id: NodeId, new_width: Width) -> Result<()> {
        let (old_width, len) = {
            let node = self.node(id);
            (node.width, node.len)
        };
        debug_assert!(new_width.bits() > old_width.bits());

        self.ensure_alloc(id, len, new_width)?;

        let data = self.payload_mut(id);
        for k in (0..len).rev() {
            let v = width::get(data, old_width, k);
            width::set(data, new_width, k, v);
        }
        Ok(())
    }

    fn update_parent_slot(&mut self, id: NodeId) -> Result<()> {
        if let Some((parent, slot)) = self.node(id).parent {
            let new_ref = self.node(id).ref_;
            self.set(parent, slot, new_ref as i64)?;
        }
        Ok(())
    }

    fn child_refs(&self, id: NodeId) -> SmallVec<[Ref; 16]> {
        let node = self.node(id);
        let data = self.payload(id);
        (0..node.len)
            .filter_map(|i| {
                let v = width::get(data, node.width, i);
                (v != 0 && v & 1 == 0).then_some(v as Ref)
            })
            .collect()
    }
}

fn round_up_8(n: usize) -> usize {
    (n + 7) & !7
}

fn quicksort(data: &mut [u8], w: Width, lo: usize, hi: usize) {
    let mut i = lo as isize;
    let mut j = hi as isize;
    let pivot = width::get(data, w, (lo + hi) / 2);

    while i <= j {
        while width::get(data, w, i as usize) < pivot {
            i += 1;
        }
        while width::get(data, w, j as usize) > pivot {
            j -= 1;
        }
        if i <= j {
            let a = width::get(data, w, i as usize);
            let b = width::get(data, w, j as usize);
            width::set(data, w, i as usize, b);
            width::set(data, w, j as usize, a);
            i += 1;
            j -= 1;
        }
    }

    if (lo as isize) < j {
        quicksort(data, w, lo, j as usize);
    }
    if i < hi as isize {
        quicksort(data, w, i as usize, hi);
    }
}
