//! Basic blocks and the block graph.
//!
//! Blocks own their ops (by sequence number) after splitting; edges
//! are directed block-index pairs. The graph is built once, after op
//! generation has completely finished.

use hashbrown::HashMap;

use skald_pcode::SeqNum;

use crate::error::FlowError;
use crate::opbank::OpBank;

/// One basic block.
#[derive(Debug, Clone, Default)]
pub struct BasicBlock {
    /// Position in the graph's block list.
    pub index: usize,
    /// Ops of the block in program order; empty only for the
    /// synthesized entry block.
    pub ops: Vec<SeqNum>,
    /// Indices of predecessor blocks.
    pub in_edges: Vec<usize>,
    /// Indices of successor blocks.
    pub out_edges: Vec<usize>,
}

/// The function's control-flow graph over basic blocks.
#[derive(Debug, Default)]
pub struct BlockGraph {
    blocks: Vec<BasicBlock>,
    entry: Option<usize>,
}

impl BlockGraph {
    /// Number of blocks.
    pub fn len(&self) -> usize {
        self.blocks.len()
    }

    /// Whether the graph has been built.
    pub fn is_empty(&self) -> bool {
        self.blocks.is_empty()
    }

    /// Index of the entry block.
    pub fn entry(&self) -> Option<usize> {
        self.entry
    }

    /// Block by index.
    pub fn block(&self, index: usize) -> Option<&BasicBlock> {
        self.blocks.get(index)
    }

    /// Iterate blocks in index order.
    pub fn iter(&self) -> impl Iterator<Item = &BasicBlock> {
        self.blocks.iter()
    }

    /// The block an op belongs to.
    pub fn block_of(&self, seq: &SeqNum) -> Option<usize> {
        self.blocks
            .iter()
            .position(|block| block.ops.binary_search(seq).is_ok())
    }

    /// Split ops into blocks on their block-start marks, translate
    /// op-to-op edges into block edges, and pick the entry block.
    pub(crate) fn build(
        bank: &OpBank,
        edges: &[(SeqNum, SeqNum)],
        entry_op: Option<&SeqNum>,
    ) -> Result<Self, FlowError> {
        let mut graph = Self::default();
        let mut block_of: HashMap<SeqNum, usize> = HashMap::new();

        for op in bank.iter() {
            let start_new = graph.blocks.is_empty() || op.starts_block();
            if start_new {
                let index = graph.blocks.len();
                graph.blocks.push(BasicBlock {
                    index,
                    ..BasicBlock::default()
                });
            }
            let index = graph.blocks.len() - 1;
            graph.blocks[index].ops.push(op.seq.clone());
            block_of.insert(op.seq.clone(), index);
        }

        for (from, to) in edges {
            let (Some(&a), Some(&b)) = (block_of.get(from), block_of.get(to)) else {
                return Err(FlowError::BlockGraph(format!(
                    "edge {from} -> {to} references an op outside every block"
                )));
            };
            graph.add_edge(a, b);
        }

        let entry_block = entry_op.and_then(|seq| block_of.get(seq).copied());
        match entry_block {
            Some(index) => {
                if graph.blocks[index].in_edges.is_empty() {
                    graph.entry = Some(index);
                } else {
                    // The entry has predecessors; give the graph a
                    // fresh edgeless entry block instead.
                    let synthetic = graph.blocks.len();
                    graph.blocks.push(BasicBlock {
                        index: synthetic,
                        ..BasicBlock::default()
                    });
                    graph.add_edge(synthetic, index);
                    graph.entry = Some(synthetic);
                }
            }
            None => graph.entry = None,
        }
        Ok(graph)
    }

    fn add_edge(&mut self, from: usize, to: usize) {
        if !self.blocks[from].out_edges.contains(&to) {
            self.blocks[from].out_edges.push(to);
            self.blocks[to].in_edges.push(from);
        }
    }
}
