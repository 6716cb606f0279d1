use std::collections::HashMap;

use bitnode_chainstate::{BlockIndex, ChainContainer, ChainError, SegmentId};
use bitnode_consensus::{consensus_params, Hash256, Network};
use bitnode_primitives::block::BlockHeader;

fn genesis() -> BlockIndex {
    BlockIndex::genesis(&consensus_params(Network::Regtest)).expect("genesis")
}

fn child(prev: &BlockIndex, tag: u32) -> BlockIndex {
    let header = BlockHeader {
        version: 1,
        prev_block: prev.hash,
        merkle_root: [0u8; 32],
        time: prev.header.time + 1,
        bits: prev.header.bits,
        nonce: tag,
    };
    prev.child(header.hash(), header).expect("child")
}

/// Container plus every index it was fed, so tests can fork at any height.
struct Tree {
    container: ChainContainer,
    known: HashMap<Hash256, BlockIndex>,
}

impl Tree {
    fn new() -> Self {
        let genesis = genesis();
        Self {
            container: ChainContainer::new(genesis),
            known: HashMap::from([(genesis.hash, genesis)]),
        }
    }

    /// Extend `segment` from its tip until it reaches `height`.
    fn grow(&mut self, segment: SegmentId, height: u32, tag: u32) -> BlockIndex {
        let mut tip = *self.container.segment(segment).expect("segment").tip();
        while tip.height < height {
            tip = child(&tip, tag);
            self.container.update_segment(segment, tip).expect("extend");
            self.known.insert(tip.hash, tip);
        }
        tip
    }

    fn fork(&mut self, parent: SegmentId, height: u32, tag: u32) -> SegmentId {
        let view = self.container.view(parent).expect("view");
        let point = self.known[&view.hash_at(height).expect("fork point")];
        let first = child(&point, tag);
        self.known.insert(first.hash, first);
        let block_tip = *self.container.block_tip(parent).expect("block tip");
        self.container
            .add_segment(parent, first, block_tip)
            .expect("fork")
    }
}

#[test]
fn best_follows_most_work() {
    let mut tree = Tree::new();
    let a = SegmentId(0);
    tree.grow(a, 15, 0);
    let b = tree.fork(a, 5, 1);
    assert_eq!(b, SegmentId(1));
    tree.grow(b, 18, 1);
    let container = &tree.container;

    assert_eq!(container.best(), Some(b));
    let best = container.best_view().expect("view");
    assert_eq!(best.tip().height, 18);
    assert_eq!(best.history(), &[a, b]);

    tree.grow(a, 20, 0);
    assert_eq!(tree.container.best(), Some(a));
    assert_eq!(tree.container.best_view().expect("view").tip().height, 20);
}

#[test]
fn equal_work_keeps_first_tracked_segment() {
    let mut tree = Tree::new();
    let a = SegmentId(0);
    tree.grow(a, 8, 0);
    let b = tree.fork(a, 3, 2);
    tree.grow(b, 8, 2);
    let container = &tree.container;
    assert_eq!(
        container.segment(a).expect("a").tip().work,
        container.segment(b).expect("b").tip().work
    );
    assert_eq!(container.best(), Some(a));
}

#[test]
fn work_increases_along_a_segment() {
    let mut container = ChainContainer::new(genesis());
    let root = SegmentId(0);
    let mut prev = *container.segment(root).expect("root").tip();
    for tag in 0..12 {
        let next = child(&prev, tag);
        container.update_segment(root, next).expect("extend");
        assert_eq!(next.height, prev.height + 1);
        assert!(next.work > prev.work);
        prev = next;
    }
}

#[test]
fn fork_view_shares_parent_prefix() {
    let mut tree = Tree::new();
    let a = SegmentId(0);
    tree.grow(a, 10, 0);
    let b = tree.fork(a, 4, 3);
    tree.grow(b, 7, 3);
    let container = &tree.container;

    let parent = container.view(a).expect("a");
    let fork = container.view(b).expect("b");
    assert_eq!(fork.count(), 8);
    for height in 0..=4 {
        assert_eq!(fork.hash_at(height), parent.hash_at(height));
    }
    assert_ne!(fork.hash_at(5), parent.hash_at(5));
    let parent_tip: Hash256 = parent.tip().hash;
    assert!(!fork.contains_hash(&parent_tip));
    assert_eq!(container.locate(&parent_tip), Some((a, 10)));
}

#[test]
fn root_has_no_previous_segment() {
    let container = ChainContainer::new(genesis());
    assert!(matches!(
        container.parent(SegmentId(0)),
        Err(ChainError::NoPreviousSegment(SegmentId(0)))
    ));
    assert!(matches!(
        container.parent(SegmentId(9)),
        Err(ChainError::UnknownSegment(SegmentId(9)))
    ));
}

#[test]
fn extension_must_be_contiguous() {
    let mut tree = Tree::new();
    let root = SegmentId(0);
    let tip = tree.grow(root, 3, 0);
    let container = &mut tree.container;
    let skipped = child(&child(&tip, 1), 1);
    assert!(matches!(
        container.update_segment(root, skipped),
        Err(ChainError::NonContiguous { .. })
    ));

    let validated = child(&genesis(), 0);
    container
        .update_segment_block(root, validated)
        .expect("validated extension");
    assert!(matches!(
        container.update_segment_block(root, tip),
        Err(ChainError::NonContiguous { .. })
    ));
}

#[test]
fn locator_over_linear_chain() {
    let mut tree = Tree::new();
    tree.grow(SegmentId(0), 20, 0);
    let view = tree.container.best_view().expect("view");
    let locator = view.locator(20, [0u8; 32]).expect("locator");
    let heights: Vec<u32> = locator
        .hashes
        .iter()
        .map(|hash| view.height_of(hash).expect("height"))
        .collect();
    assert_eq!(
        heights,
        vec![20, 19, 18, 17, 16, 15, 14, 13, 12, 11, 10, 8, 6, 4, 2, 0]
    );
    assert_eq!(locator.stop, [0u8; 32]);
}

#[test]
fn guided_view_tracks_validated_blocks() {
    let mut tree = Tree::new();
    let root = SegmentId(0);
    tree.grow(root, 5, 0);
    let container = &tree.container;
    let mut guided = container.guided_view(root).expect("guided");
    assert_eq!(guided.block_tip().height, 0);
    assert_eq!(guided.blocks_to_fetch(3).len(), 3);
    assert_eq!(guided.blocks_to_fetch(10).len(), 5);

    let view = container.view(root).expect("view");
    let first = view.hash_at(1).expect("height 1");
    assert_eq!(guided.blocks_to_fetch(1), vec![first]);

    let off_chain = child(&genesis(), 99);
    assert!(guided.update_tip(off_chain).is_err());
    assert_eq!(guided.block_tip().height, 0);

    let next = tree.known[&first];
    guided.update_tip(next).expect("advance");
    assert_eq!(guided.block_tip().height, 1);
    assert_eq!(guided.blocks_to_fetch(10).len(), 4);
}
