//! Centralized dynamic node-id allocation server.
//!
//! Followers publish anonymous Allocation messages carrying their 16-byte
//! unique id in up to three stages; the server echoes the accumulated
//! bytes after each stage and answers the final stage with an allocated
//! node id. Allocations are sticky per unique id for the process
//! lifetime.

use std::collections::{HashMap, HashSet};
use std::time::{Duration, Instant};

use crate::cubepilot::batchupdater::dronecan::messages::Allocation;

/// A follower must deliver the next stage within this window
const STAGE_TIMEOUT: Duration = Duration::from_millis(500);

/// Allocation starts at the top of the id space and works downwards
const HIGHEST_ALLOCATABLE_ID: u8 = 125;

pub struct AllocationServer {
    local_node_id: u8,
    /// unique id -> allocated node id
    table: HashMap<[u8; 16], u8>,
    /// every id known to be in use on the bus
    in_use: HashSet<u8>,
    pending: Option<PendingRequest>,
}

struct PendingRequest {
    unique_id: Vec<u8>,
    updated: Instant,
}

impl AllocationServer {
    pub fn new(local_node_id: u8) -> Self {
        let mut in_use = HashSet::new();
        in_use.insert(local_node_id);
        AllocationServer {
            local_node_id,
            table: HashMap::new(),
            in_use,
            pending: None,
        }
    }

    /// Records a node id observed on the bus so it is never handed out.
    pub fn observe_node_id(&mut self, node_id: u8) {
        if node_id != 0 {
            self.in_use.insert(node_id);
        }
    }

    /// Handles one anonymous Allocation message. The returned Allocation,
    /// if any, must be broadcast from the server's node id.
    pub fn handle_anonymous(&mut self, msg: &Allocation) -> Option<Allocation> {
        let now = Instant::now();

        // a stale accumulation is abandoned
        if let Some(pending) = &self.pending {
            if now.duration_since(pending.updated) > STAGE_TIMEOUT {
                self.pending = None;
            }
        }

        if msg.first_part_of_unique_id {
            self.pending = Some(PendingRequest {
                unique_id: msg.unique_id.clone(),
                updated: now,
            });
        } else {
            let pending = self.pending.as_mut()?;
            pending.unique_id.extend_from_slice(&msg.unique_id);
            pending.updated = now;
        }

        let accumulated = self.pending.as_ref()?.unique_id.clone();
        if accumulated.len() < 16 {
            // echo what we have so the follower sends the next stage
            return Some(Allocation {
                node_id: 0,
                first_part_of_unique_id: false,
                unique_id: accumulated,
            });
        }

        self.pending = None;
        let mut unique_id = [0u8; 16];
        unique_id.copy_from_slice(&accumulated[..16]);

        let node_id = self.allocate(unique_id, msg.node_id)?;
        Some(Allocation {
            node_id,
            first_part_of_unique_id: false,
            unique_id: unique_id.to_vec(),
        })
    }

    fn allocate(&mut self, unique_id: [u8; 16], preferred: u8) -> Option<u8> {
        if let Some(&existing) = self.table.get(&unique_id) {
            return Some(existing);
        }

        let chosen = if preferred != 0 && !self.in_use.contains(&preferred) {
            Some(preferred)
        } else {
            (1..=HIGHEST_ALLOCATABLE_ID)
                .rev()
                .find(|id| !self.in_use.contains(id))
        }?;

        self.in_use.insert(chosen);
        self.table.insert(unique_id, chosen);
        log::info!("allocated node id {} to {:02x?}", chosen, &unique_id[..6]);
        Some(chosen)
    }

    pub fn local_node_id(&self) -> u8 {
        self.local_node_id
    }
}

// Tests ------------------------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;

    fn stage(first: bool, bytes: &[u8]) -> Allocation {
        Allocation {
            node_id: 0,
            first_part_of_unique_id: first,
            unique_id: bytes.to_vec(),
        }
    }

    fn run_three_stages(server: &mut AllocationServer, uid: &[u8; 16]) -> Allocation {
        let echo1 = server.handle_anonymous(&stage(true, &uid[..6])).unwrap();
        assert_eq!(echo1.unique_id, &uid[..6]);
        let echo2 = server.handle_anonymous(&stage(false, &uid[6..12])).unwrap();
        assert_eq!(echo2.unique_id, &uid[..12]);
        server.handle_anonymous(&stage(false, &uid[12..])).unwrap()
    }

    #[test]
    fn allocates_descending_from_125() {
        let mut server = AllocationServer::new(100);
        let final1 = run_three_stages(&mut server, &[0x11; 16]);
        assert_eq!(final1.node_id, 125);
        let final2 = run_three_stages(&mut server, &[0x22; 16]);
        assert_eq!(final2.node_id, 124);
    }

    #[test]
    fn same_unique_id_gets_same_node_id() {
        let mut server = AllocationServer::new(100);
        let first = run_three_stages(&mut server, &[0x33; 16]);
        let second = run_three_stages(&mut server, &[0x33; 16]);
        assert_eq!(first.node_id, second.node_id);
    }

    #[test]
    fn observed_ids_are_skipped() {
        let mut server = AllocationServer::new(100);
        server.observe_node_id(125);
        let allocated = run_three_stages(&mut server, &[0x44; 16]);
        assert_eq!(allocated.node_id, 124);
    }

    #[test]
    fn second_stage_without_first_is_ignored() {
        let mut server = AllocationServer::new(100);
        assert!(server.handle_anonymous(&stage(false, &[1, 2, 3, 4, 5, 6])).is_none());
    }

    #[test]
    fn preferred_id_honored_when_free() {
        let mut server = AllocationServer::new(100);
        let uid = [0x55u8; 16];
        server.handle_anonymous(&stage(true, &uid[..6]));
        server.handle_anonymous(&stage(false, &uid[6..12]));
        let mut last = stage(false, &uid[12..]);
        last.node_id = 42;
        let final_alloc = server.handle_anonymous(&last).unwrap();
        assert_eq!(final_alloc.node_id, 42);
    }
}
