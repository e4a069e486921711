//! Progressive tag-tree decoding for packet headers.
//!
//! A tag tree is a quad tree over a codeblock grid; packet headers use
//! it for inclusion signaling (threshold queries at increasing layers)
//! and for zero-bit-plane counts (exact-value queries). Node state
//! persists across calls, so bits already resolved in a committed parse
//! are never read again.

use crate::quality::bits::BitReader;

#[derive(Debug, Clone, Default)]
struct Node {
    low: u32,
    known: bool,
    parent: Option<usize>,
}

#[derive(Debug, Clone)]
pub struct TagTree {
    nodes: Vec<Node>,
    leaf_width: u32,
    leaf_height: u32,
}

impl TagTree {
    /// A tree over a `width` x `height` leaf grid. Degenerate grids get
    /// a single root so decoding stays well defined.
    pub fn new(width: u32, height: u32) -> Self {
        let width = width.max(1);
        let height = height.max(1);
        let mut nodes: Vec<Node> = Vec::new();
        let mut level_start = 0usize;
        let mut w = width as usize;
        let mut h = height as usize;
        nodes.resize_with(w * h, Node::default);
        while w > 1 || h > 1 {
            let next_w = w.div_ceil(2);
            let next_h = h.div_ceil(2);
            let next_start = nodes.len();
            nodes.resize_with(next_start + next_w * next_h, Node::default);
            for y in 0..h {
                for x in 0..w {
                    let child = level_start + y * w + x;
                    let parent = next_start + (y / 2) * next_w + x / 2;
                    nodes[child].parent = Some(parent);
                }
            }
            w = next_w;
            h = next_h;
            level_start = next_start;
        }
        Self {
            nodes,
            leaf_width: width,
            leaf_height: height,
        }
    }

    /// Decodes toward the leaf at `(x, y)` until its value is known to
    /// be `>= threshold` (returns `Some(true)`) or its exact value below
    /// the threshold is resolved (`Some(false)`). `None` until enough
    /// bits are loaded.
    pub fn try_decode(
        &mut self,
        reader: &mut BitReader<'_>,
        x: u32,
        y: u32,
        threshold: u32,
    ) -> Option<bool> {
        let leaf = (y * self.leaf_width + x) as usize;

        // Walk up to the first node whose state already answers the
        // query, then decode back down.
        let mut stack = Vec::new();
        let mut idx = leaf;
        loop {
            stack.push(idx);
            let node = &self.nodes[idx];
            if node.low >= threshold || node.known {
                break;
            }
            match node.parent {
                Some(parent) => idx = parent,
                None => break,
            }
        }

        while let Some(current) = stack.pop() {
            let parent_low = self.nodes[current]
                .parent
                .map(|p| self.nodes[p].low)
                .unwrap_or(0);
            let node = &mut self.nodes[current];
            if node.low < parent_low {
                node.low = parent_low;
            }
            while node.low < threshold && !node.known {
                if reader.try_read_bit()? == 0 {
                    node.low += 1;
                } else {
                    node.known = true;
                }
            }
        }

        Some(self.nodes[leaf].low >= threshold)
    }

    /// Decodes the exact value of the leaf at `(x, y)` by raising the
    /// threshold until the value resolves.
    pub fn try_decode_value(&mut self, reader: &mut BitReader<'_>, x: u32, y: u32) -> Option<u32> {
        let leaf = (y * self.leaf_width + x) as usize;
        let mut threshold = self.nodes[leaf].low + 1;
        loop {
            if !self.try_decode(reader, x, y, threshold)? {
                return Some(self.nodes[leaf].low);
            }
            threshold += 1;
        }
    }
}
