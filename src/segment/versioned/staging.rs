//! Redirects allocation-node writes to copies held in a scratch segment.
//!
//! Lock order: node map, then scratch pages, then permanent pages. Nothing
//! that holds an allocation node page ever waits for the node map.

use std::collections::HashMap;
use std::sync::Arc;

use parking_lot::RwLock;
use tracing::debug;

use crate::primitives::pager::Pager;
use crate::segment::alloc::{NodeRouter, NodeSite};
use crate::segment::metrics::SegmentMetrics;
use crate::segment::random::RandomAllocationSegment;
use crate::types::{PageId, PageOwnerId, Result, StrataError};

/// Scratch copy of a permanent allocation node.
#[derive(Clone, Copy, Debug)]
pub(crate) struct ModifiedAllocationNode {
    pub temp: PageId,
    pub update_count: u64,
}

pub(crate) type NodeMap = HashMap<PageId, ModifiedAllocationNode>;

pub(crate) struct StagingRouter {
    home: Arc<Pager>,
    scratch: RandomAllocationSegment,
    nodes: RwLock<NodeMap>,
    metrics: Arc<dyn SegmentMetrics>,
}

impl StagingRouter {
    pub fn new(
        home: Arc<Pager>,
        scratch: RandomAllocationSegment,
        metrics: Arc<dyn SegmentMetrics>,
    ) -> Self {
        Self {
            home,
            scratch,
            nodes: RwLock::new(HashMap::new()),
            metrics,
        }
    }

    pub fn scratch(&self) -> &RandomAllocationSegment {
        &self.scratch
    }

    pub fn scratch_store(&self) -> &Pager {
        self.scratch.pager()
    }

    pub fn nodes(&self) -> &RwLock<NodeMap> {
        &self.nodes
    }

    fn stage(&self, node: PageId) -> Result<PageId> {
        let mut nodes = self.nodes.write();
        if let Some(staged) = nodes.get_mut(&node) {
            staged.update_count += 1;
            return Ok(staged.temp);
        }
        let temp = self
            .scratch
            .allocate_page_id(PageOwnerId::ANONYMOUS)?
            .ok_or(StrataError::ScratchExhausted)?;
        {
            let mut copy = self.scratch_store().pin_exclusive(temp)?;
            let original = self.home.pin_shared(node)?;
            copy.data_mut().copy_from_slice(original.data());
        }
        nodes.insert(
            node,
            ModifiedAllocationNode {
                temp,
                update_count: 1,
            },
        );
        self.metrics.node_staged();
        debug!(node = node.0, temp = temp.0, "versioned.stage.node");
        Ok(temp)
    }

    /// Drops `count` outstanding updates of `node`, freeing its scratch copy
    /// when none remain.
    pub fn release_locked(&self, nodes: &mut NodeMap, node: PageId, count: u64) -> Result<()> {
        if count == 0 {
            return Ok(());
        }
        let staged = nodes
            .get_mut(&node)
            .unwrap_or_else(|| panic!("allocation node {node} released but never staged"));
        assert!(
            staged.update_count >= count,
            "allocation node {node} released {count} updates but only {} are outstanding",
            staged.update_count
        );
        staged.update_count -= count;
        if staged.update_count == 0 {
            let temp = staged.temp;
            nodes.remove(&node);
            self.scratch.deallocate_page(temp)?;
            self.metrics.node_released();
            debug!(node = node.0, temp = temp.0, "versioned.stage.release");
        }
        Ok(())
    }
}

impl NodeRouter for StagingRouter {
    fn home(&self) -> &Pager {
        &self.home
    }

    fn node_for_write(&self, node: PageId) -> Result<NodeSite<'_>> {
        let temp = self.stage(node)?;
        Ok(NodeSite {
            store: self.scratch_store(),
            page: temp,
            staged: true,
        })
    }

    fn undo_node_write(&self, node: PageId) -> Result<()> {
        let mut nodes = self.nodes.write();
        self.release_locked(&mut nodes, node, 1)
    }

    fn read_node<T, F>(&self, node: PageId, read: F) -> Result<T>
    where
        F: Fn(&[u8]) -> T,
    {
        let nodes = self.nodes.read();
        match nodes.get(&node) {
            Some(staged) => {
                let page = self.scratch_store().pin_shared(staged.temp)?;
                Ok(read(page.data()))
            }
            None => {
                let page = self.home.pin_shared(node)?;
                Ok(read(page.data()))
            }
        }
    }
}
