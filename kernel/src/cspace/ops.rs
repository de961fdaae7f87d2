//! Capability operations: populate, copy, move, delete, revoke
//!
//! None of these allocate, so heap addresses found during an operation stay
//! valid until it returns. Every failure check happens before the first
//! write; a returned error leaves the capability space unchanged unless it
//! is `Corrupted`.

use kaal_heap::HeapAddr;
use log::{debug, error, trace};

use crate::config::MAX_DERIVATION_LEVEL;
use crate::context::{Core, CoreEvent};
use crate::error::{KernelError, Result};
use crate::objects::{
    CapAddress, CapFlags, CapRights, Capability, EndpointObject, NodeHeader, ObjectKind, Tcb,
};

/// A capability collected for a subtree move
struct Member {
    slot: HeapAddr,
    address: CapAddress,
    cap: Capability,
}

impl Core {
    /// Install a fresh original capability for `resource` in an empty slot
    ///
    /// A node's nesting depth is written into its header here: one more
    /// than the containing node, 0 in a thread's root slot.
    pub fn populate(
        &mut self,
        addr: &CapAddress,
        resource: HeapAddr,
        kind: ObjectKind,
        flags: CapFlags,
    ) -> Result<CapAddress> {
        let located = self.locate(addr)?;
        if !self.read_cap(located.slot)?.is_empty() {
            return Err(KernelError::CapabilityExists);
        }

        let mut flags = flags;
        flags.set(CapFlags::ROOT, located.address.depth == 0);

        if kind == ObjectKind::Node {
            let nesting = located.nesting.map_or(0, |n| n + 1);
            if nesting > self.config.max_nesting {
                return Err(KernelError::TooMuchNesting);
            }
            let mut header = NodeHeader::read(&self.heap, resource)?;
            header.nesting = nesting;
            header.write(&mut self.heap, resource)?;
        }

        let cap = Capability::original(kind, resource, flags, located.address);
        self.write_cap(located.slot, &cap)?;
        if flags.contains(CapFlags::HEAP_MANAGED) {
            self.heap.set_relocation_capability(resource, located.address)?;
        }
        debug!("cspace: populate {} {:?} at {}", located.address, kind, resource);
        Ok(located.address)
    }

    /// Derive a capability from `src` into the empty slot `dest`
    ///
    /// The copy gets `rights ∩ source rights`. With a badge, the source must
    /// be original and the copy becomes a badged derivation head; without
    /// one the copy inherits the source's badge value.
    pub fn copy(
        &mut self,
        src: &CapAddress,
        dest: &CapAddress,
        rights: CapRights,
        badge: Option<u64>,
    ) -> Result<CapAddress> {
        let src_loc = self.locate(src)?;
        let source = self.read_cap(src_loc.slot)?;
        let kind = source.kind().ok_or(KernelError::NoCapability)?;
        if kind == ObjectKind::Node {
            return Err(KernelError::InvalidCapability);
        }
        debug_assert_eq!(source.address, src_loc.address);

        let dest_loc = self.locate(dest)?;
        if !self.read_cap(dest_loc.slot)?.is_empty() {
            return Err(KernelError::CapabilityExists);
        }
        if badge.is_some() && !source.is_original() {
            return Err(KernelError::InvalidCapability);
        }
        let level = self.derivation_level(&source)? + u8::from(source.heads_derivation());
        if level > MAX_DERIVATION_LEVEL {
            return Err(KernelError::InvalidCapability);
        }

        let mut flags = source.flags - (CapFlags::ORIGINAL | CapFlags::BADGED | CapFlags::ROOT);
        flags.set(CapFlags::BADGED, badge.is_some());
        let address = dest_loc.address;
        let cap = Capability {
            object: Some(kind),
            resource: source.resource,
            flags,
            rights: rights & source.rights,
            badge: badge.unwrap_or(source.badge),
            address,
            ..Capability::default()
        };
        self.write_cap(dest_loc.slot, &cap)?;

        self.link_resource_after(&source, address)?;
        let source = self.read_cap(src_loc.slot)?;
        if source.heads_derivation() {
            self.link_first_child(&source, address)?;
        } else {
            self.link_sibling_after(&source, address)?;
        }
        debug!(
            "cspace: copy {} -> {} rights={:?} badge={:?} level={}",
            source.address, address, cap.rights, badge, level
        );
        Ok(address)
    }

    /// Copy a capability between arbitrary threads (the IPC transfer hook)
    pub fn deliver(
        &mut self,
        src: &CapAddress,
        dest: &CapAddress,
        rights: CapRights,
    ) -> Result<CapAddress> {
        self.copy(src, dest, rights, None)
    }

    /// Move the capability at `src` into the empty slot `dest`
    ///
    /// List positions are kept; every link naming a moved capability is
    /// rewritten. Moving a node renames its whole subtree.
    pub fn move_cap(&mut self, src: &CapAddress, dest: &CapAddress) -> Result<CapAddress> {
        let from_loc = self.locate(src)?;
        let top = self.read_cap(from_loc.slot)?;
        if top.is_empty() {
            return Err(KernelError::NoCapability);
        }
        let to_loc = self.locate(dest)?;
        if !self.read_cap(to_loc.slot)?.is_empty() {
            return Err(KernelError::CapabilityExists);
        }
        let (from, to) = (from_loc.address, to_loc.address);

        let mut members =
            vec![Member { slot: from_loc.slot, address: from, cap: top.clone() }];
        let mut shift = None;
        if top.kind() == Some(ObjectKind::Node) {
            if to.is_within(&from) {
                return Err(KernelError::InvalidArgument);
            }
            self.collect_subtree(&top, from, &mut members)?;

            let old_top = i16::from(NodeHeader::read(&self.heap, top.resource)?.nesting);
            let new_top = i16::from(to_loc.nesting.map_or(0, |n| n + 1));
            for member in members.iter().filter(|m| m.cap.kind() == Some(ObjectKind::Node)) {
                let nesting = i16::from(NodeHeader::read(&self.heap, member.cap.resource)?.nesting);
                if nesting - old_top + new_top > i16::from(self.config.max_nesting) {
                    return Err(KernelError::TooMuchNesting);
                }
            }
            shift = Some(new_top - old_top);
        }

        let rename = |addr: CapAddress| -> Result<CapAddress> {
            if addr.is_within(&from) {
                addr.rebase(&from, &to)
            } else {
                Ok(addr)
            }
        };
        let rewrite = |cap: &Capability| -> Result<Capability> {
            let mut cap = cap.clone();
            cap.address = rename(cap.address)?;
            for link in cap.links_mut() {
                if let Some(addr) = link {
                    *addr = rename(*addr)?;
                }
            }
            Ok(cap)
        };

        // Everything outside the subtree that names a member.
        let mut outside: Vec<CapAddress> = Vec::new();
        for member in &members {
            let children = self.derived_children(&member.cap)?;
            for addr in member.cap.links().into_iter().flatten().chain(children) {
                if !addr.is_within(&from) && !outside.contains(&addr) {
                    outside.push(addr);
                }
            }
        }

        let mut outside_records = Vec::with_capacity(outside.len());
        for addr in &outside {
            let located = self.locate(addr)?;
            outside_records.push((located.slot, rewrite(&self.read_cap(located.slot)?)?));
        }
        let mut member_records = Vec::with_capacity(members.len());
        for member in &members {
            member_records.push((member.slot, rewrite(&member.cap)?));
        }

        // No failure past this point short of corruption.
        for (slot, cap) in &outside_records {
            self.write_cap(*slot, cap)?;
        }
        for (index, (_, cap)) in member_records.iter_mut().enumerate() {
            if cap.owns_resource() && cap.flags.contains(CapFlags::HEAP_MANAGED) {
                self.heap.set_relocation_capability(cap.resource, cap.address)?;
            }
            if let (Some(shift), Some(ObjectKind::Node)) = (shift, cap.kind()) {
                let mut header = NodeHeader::read(&self.heap, cap.resource)?;
                header.nesting = (i16::from(header.nesting) + shift) as u8;
                header.write(&mut self.heap, cap.resource)?;
            }
            if index == 0 {
                cap.flags.set(CapFlags::ROOT, to.depth == 0);
            }
        }
        for (slot, cap) in member_records.iter().skip(1) {
            self.write_cap(*slot, cap)?;
        }
        self.write_cap(to_loc.slot, &member_records[0].1)?;
        self.clear_slot(&from)?;

        debug!("cspace: move {} -> {} ({} capabilities)", from, to, members.len());
        Ok(to)
    }

    fn collect_subtree(
        &self,
        node: &Capability,
        at: CapAddress,
        out: &mut Vec<Member>,
    ) -> Result<()> {
        let header = NodeHeader::read(&self.heap, node.resource)?;
        for index in 0..header.slots() {
            let slot = header.slot(node.resource, index);
            let cap = self.read_cap(slot)?;
            if cap.is_empty() {
                continue;
            }
            let address = at.child(index, header.slot_bits)?;
            if cap.address != address {
                error!("cspace: capability at {} records address {}", address, cap.address);
                return Err(KernelError::Corrupted);
            }
            if cap.kind() == Some(ObjectKind::Node) {
                self.collect_subtree(&cap, address, out)?;
            }
            out.push(Member { slot, address, cap });
        }
        Ok(())
    }

    /// Delete the capability at `addr`
    ///
    /// The capability leaves both lists; its derivation children take its
    /// place under its parent. If it was the last capability for its
    /// resource, the object is destroyed and, if heap-managed, freed.
    ///
    /// Threads whose last capability goes away are torn down once the
    /// capability space walk is over, since a thread's root node may be the
    /// one being deleted.
    pub fn delete(&mut self, addr: &CapAddress) -> Result<()> {
        let mut result = self.delete_slot(addr);
        while result.is_ok() {
            let Some(cap) = self.dying_threads.pop() else {
                break;
            };
            result = self.destroy_thread(&cap);
        }
        if let Err(err) = &result {
            error!("cspace: delete {} failed: {:?}", addr, err);
            self.dying_threads.clear();
        }
        result
    }

    fn delete_slot(&mut self, addr: &CapAddress) -> Result<()> {
        let located = self.locate(addr)?;
        let cap = self.read_cap(located.slot)?;
        let kind = cap.kind().ok_or(KernelError::NoCapability)?;
        debug_assert_eq!(cap.address, located.address);

        self.unlink_derivation(&cap)?;
        let last = self.unlink_resource(&cap)?;
        debug!("cspace: delete {} {:?} last={}", located.address, kind, last);

        // A node's children are named through its slot, so it is cleared
        // after they are gone.
        if kind == ObjectKind::Node {
            if last {
                self.destroy(&cap)?;
            }
            self.clear_slot(&located.address)
        } else {
            self.clear_slot(&located.address)?;
            if last {
                self.destroy(&cap)?;
            }
            Ok(())
        }
    }

    /// Delete every capability derived from the head at `addr`
    ///
    /// Revoking a capability with no derivations is a no-op.
    pub fn revoke(&mut self, addr: &CapAddress) -> Result<()> {
        let located = self.locate(addr)?;
        let cap = self.read_cap(located.slot)?;
        if cap.is_empty() {
            return Err(KernelError::NoCapability);
        }
        if !cap.heads_derivation() {
            return Err(KernelError::InvalidCapability);
        }

        // Deleting a child splices its own children up to this head, so the
        // loop also takes the second level.
        let mut deleted = 0usize;
        while let Some(child) = self.read_cap(located.slot)?.first_derived {
            self.delete(&child)?;
            deleted += 1;
        }
        debug!("cspace: revoke {} deleted {}", located.address, deleted);
        Ok(())
    }

    /// Tear down the object of the last capability naming it
    ///
    /// Threads are only queued here; see [`Core::delete`].
    fn destroy(&mut self, cap: &Capability) -> Result<()> {
        match cap.kind() {
            Some(ObjectKind::Node) => {
                let header = NodeHeader::read(&self.heap, cap.resource)?;
                for index in 0..header.slots() {
                    if self.read_cap(header.slot(cap.resource, index))?.is_empty() {
                        continue;
                    }
                    self.delete_slot(&cap.address.child(index, header.slot_bits)?)?;
                }
            }
            Some(ObjectKind::Thread) => {
                trace!("cspace: thread object {} queued for teardown", cap.resource);
                self.dying_threads.push(cap.clone());
                return Ok(());
            }
            Some(ObjectKind::Endpoint) => {
                let endpoint = EndpointObject::read(&self.heap, cap.resource)?;
                self.events.push(CoreEvent::EndpointDestroyed {
                    endpoint: cap.resource,
                    waiters: endpoint.waiters(),
                });
            }
            Some(ObjectKind::Untyped | ObjectKind::AddressSpace | ObjectKind::Debug) | None => {}
        }
        self.release(cap)
    }

    /// Delete a dead thread's capability space, then the thread itself
    fn destroy_thread(&mut self, cap: &Capability) -> Result<()> {
        let tcb = Tcb::read(&self.heap, cap.resource)?;
        let root = CapAddress::root(tcb.tid);
        if !self.capability(&root)?.is_empty() {
            self.delete_slot(&root)?;
        }
        self.threads.remove(tcb.tid);
        self.events.push(CoreEvent::ThreadDestroyed(tcb.tid));
        self.release(cap)
    }

    fn release(&mut self, cap: &Capability) -> Result<()> {
        if cap.flags.contains(CapFlags::HEAP_MANAGED) {
            trace!("cspace: freeing {:?} object {}", cap.kind(), cap.resource);
            self.heap.free(cap.resource)?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::KernelConfig;
    use crate::objects::ThreadId;

    struct Fixture {
        core: Core,
        tid: ThreadId,
    }

    impl Fixture {
        /// One thread with a 16-slot root node
        fn new() -> Self {
            let mut core = Core::new(KernelConfig::default()).unwrap();
            let (tid, object) = core.create_thread(1).unwrap();
            core.heap.unpin(object).unwrap();
            let root = core.alloc_node(4).unwrap();
            core.populate(&CapAddress::root(tid), root, ObjectKind::Node, CapFlags::HEAP_MANAGED)
                .unwrap();
            core.heap.unpin(root).unwrap();
            Self { core, tid }
        }

        fn at(&self, slot: u64) -> CapAddress {
            CapAddress::new(self.tid, slot, 4)
        }

        fn untyped(&mut self, slot: u64, size: usize) -> HeapAddr {
            let block = self.core.heap_alloc(size).unwrap();
            let at = self.at(slot);
            self.core.populate(&at, block, ObjectKind::Untyped, CapFlags::HEAP_MANAGED).unwrap();
            self.core.heap.unpin(block).unwrap();
            block
        }

        fn cap(&self, slot: u64) -> Capability {
            self.core.capability(&self.at(slot)).unwrap()
        }
    }

    #[test]
    fn test_populate_rejects_occupied_slot() {
        let mut fx = Fixture::new();
        let block = fx.untyped(5, 64);
        let at = fx.at(5);
        assert_eq!(
            fx.core.populate(&at, block, ObjectKind::Untyped, CapFlags::empty()),
            Err(KernelError::CapabilityExists)
        );
        let cap = fx.cap(5);
        assert!(cap.is_original());
        assert_eq!(cap.rights, CapRights::ALL);
        assert!(!cap.flags.contains(CapFlags::ROOT));
        assert!(fx.core.capability(&CapAddress::root(fx.tid)).unwrap().flags.contains(CapFlags::ROOT));
    }

    #[test]
    fn test_copy_then_delete_restores_source() {
        let mut fx = Fixture::new();
        fx.untyped(5, 64);
        let before = fx.cap(5);

        fx.core.copy(&fx.at(5), &fx.at(6), CapRights::READ, None).unwrap();
        let copy = fx.cap(6);
        assert_eq!(copy.rights, CapRights::READ);
        assert!(!copy.is_original());
        assert_eq!(copy.derived_from, Some(fx.at(5)));
        assert_eq!(copy.res_prev, Some(fx.at(5)));

        fx.core.delete(&fx.at(6)).unwrap();
        assert_eq!(fx.cap(5), before);
        assert!(fx.cap(6).is_empty());
        assert!(fx.core.heap.validate().is_ok());
    }

    #[test]
    fn test_copy_of_copy_joins_same_list() {
        let mut fx = Fixture::new();
        fx.untyped(5, 64);
        fx.core.copy(&fx.at(5), &fx.at(6), CapRights::ALL, None).unwrap();
        fx.core.copy(&fx.at(6), &fx.at(7), CapRights::ALL, None).unwrap();

        assert_eq!(fx.cap(7).derived_from, Some(fx.at(5)));
        assert_eq!(fx.cap(6).deriv_next, Some(fx.at(7)));
        assert_eq!(fx.cap(7).deriv_prev, Some(fx.at(6)));
        assert_eq!(fx.cap(5).first_derived, Some(fx.at(6)));
    }

    #[test]
    fn test_badge_rules() {
        let mut fx = Fixture::new();
        fx.untyped(5, 64);
        fx.core.copy(&fx.at(5), &fx.at(6), CapRights::ALL, Some(42)).unwrap();
        assert!(fx.cap(6).is_badged());
        assert_eq!(fx.cap(6).badge, 42);

        // Only originals can be badged.
        assert_eq!(
            fx.core.copy(&fx.at(6), &fx.at(7), CapRights::ALL, Some(7)),
            Err(KernelError::InvalidCapability)
        );
        assert!(fx.cap(7).is_empty());

        // An unbadged copy of a badged capability keeps the badge.
        fx.core.copy(&fx.at(6), &fx.at(7), CapRights::ALL, None).unwrap();
        let inherited = fx.cap(7);
        assert_eq!(inherited.badge, 42);
        assert!(!inherited.is_badged());
        assert_eq!(inherited.derived_from, Some(fx.at(6)));
        assert_eq!(fx.core.derivation_level(&inherited), Ok(2));
    }

    #[test]
    fn test_copy_errors_leave_destination_alone() {
        let mut fx = Fixture::new();
        fx.untyped(5, 64);
        fx.untyped(6, 64);
        let occupied = fx.cap(6);
        assert_eq!(
            fx.core.copy(&fx.at(5), &fx.at(6), CapRights::ALL, None),
            Err(KernelError::CapabilityExists)
        );
        assert_eq!(fx.cap(6), occupied);
        assert_eq!(
            fx.core.copy(&fx.at(9), &fx.at(10), CapRights::ALL, None),
            Err(KernelError::NoCapability)
        );
    }

    #[test]
    fn test_delete_splices_children_into_parent() {
        let mut fx = Fixture::new();
        fx.untyped(5, 64);
        fx.core.copy(&fx.at(5), &fx.at(6), CapRights::ALL, Some(1)).unwrap();
        fx.core.copy(&fx.at(6), &fx.at(7), CapRights::ALL, None).unwrap();
        fx.core.copy(&fx.at(6), &fx.at(8), CapRights::ALL, None).unwrap();

        fx.core.delete(&fx.at(6)).unwrap();
        let children = fx.core.derived_children(&fx.cap(5)).unwrap();
        assert_eq!(children, vec![fx.at(8), fx.at(7)]);
        assert_eq!(fx.cap(7).derived_from, Some(fx.at(5)));
        assert_eq!(fx.cap(8).derived_from, Some(fx.at(5)));
    }

    #[test]
    fn test_delete_of_head_orphans_children() {
        let mut fx = Fixture::new();
        let block = fx.untyped(5, 64);
        fx.core.copy(&fx.at(5), &fx.at(6), CapRights::ALL, None).unwrap();
        fx.core.copy(&fx.at(5), &fx.at(7), CapRights::ALL, None).unwrap();

        fx.core.delete(&fx.at(5)).unwrap();
        assert_eq!(fx.cap(7).derived_from, None);
        assert_eq!(fx.cap(6).derived_from, None);
        assert_eq!(fx.cap(7).deriv_next, Some(fx.at(6)));

        // Ownership moved to the next resource-list member.
        assert!(fx.cap(7).owns_resource());
        assert_eq!(
            fx.core.heap.relocation_target(block).unwrap(),
            &kaal_heap::RelocationTarget::Capability(fx.at(7))
        );
        assert_eq!(fx.core.revoke(&fx.at(7)), Err(KernelError::InvalidCapability));
    }

    #[test]
    fn test_last_delete_frees_object() {
        let mut fx = Fixture::new();
        let block = fx.untyped(5, 64);
        fx.core.copy(&fx.at(5), &fx.at(6), CapRights::ALL, None).unwrap();
        fx.core.delete(&fx.at(5)).unwrap();
        assert!(fx.core.heap.size_of(block).is_ok());
        fx.core.delete(&fx.at(6)).unwrap();
        assert!(fx.core.heap.size_of(block).is_err());
        assert_eq!(fx.core.delete(&fx.at(6)), Err(KernelError::NoCapability));
    }

    #[test]
    fn test_revoke_two_levels_and_idempotence() {
        let mut fx = Fixture::new();
        fx.untyped(5, 64);
        fx.core.copy(&fx.at(5), &fx.at(6), CapRights::ALL, Some(9)).unwrap();
        fx.core.copy(&fx.at(6), &fx.at(7), CapRights::ALL, None).unwrap();
        fx.core.copy(&fx.at(5), &fx.at(8), CapRights::ALL, None).unwrap();

        fx.core.revoke(&fx.at(5)).unwrap();
        for slot in 6..=8 {
            assert!(fx.cap(slot).is_empty(), "slot {} survived revoke", slot);
        }
        let after = fx.cap(5);
        assert_eq!(after.first_derived, None);
        assert_eq!(after.res_next, None);

        fx.core.revoke(&fx.at(5)).unwrap();
        assert_eq!(fx.cap(5), after);
    }

    #[test]
    fn test_move_keeps_list_positions() {
        let mut fx = Fixture::new();
        let block = fx.untyped(5, 64);
        fx.core.copy(&fx.at(5), &fx.at(6), CapRights::ALL, None).unwrap();

        fx.core.move_cap(&fx.at(5), &fx.at(9)).unwrap();
        assert!(fx.cap(5).is_empty());
        let moved = fx.cap(9);
        assert_eq!(moved.address, fx.at(9));
        assert_eq!(moved.first_derived, Some(fx.at(6)));
        assert_eq!(fx.cap(6).derived_from, Some(fx.at(9)));
        assert_eq!(fx.cap(6).res_prev, Some(fx.at(9)));
        assert_eq!(
            fx.core.heap.relocation_target(block).unwrap(),
            &kaal_heap::RelocationTarget::Capability(fx.at(9))
        );
    }

    #[test]
    fn test_move_node_renames_subtree() {
        let mut fx = Fixture::new();
        let node = fx.core.alloc_node(2).unwrap();
        fx.core.populate(&fx.at(3), node, ObjectKind::Node, CapFlags::HEAP_MANAGED).unwrap();
        fx.core.heap.unpin(node).unwrap();

        // Untyped inside the inner node, with a copy outside it.
        let inner_slot = CapAddress::new(fx.tid, 3 | (1 << 4), 6);
        let block = fx.core.heap_alloc(32).unwrap();
        fx.core.populate(&inner_slot, block, ObjectKind::Untyped, CapFlags::HEAP_MANAGED).unwrap();
        fx.core.copy(&inner_slot, &fx.at(8), CapRights::ALL, None).unwrap();

        fx.core.move_cap(&fx.at(3), &fx.at(12)).unwrap();
        let renamed = CapAddress::new(fx.tid, 12 | (1 << 4), 6);
        let inner = fx.core.capability(&renamed).unwrap();
        assert_eq!(inner.address, renamed);
        assert_eq!(inner.first_derived, Some(fx.at(8)));
        assert_eq!(fx.cap(8).derived_from, Some(renamed));
        assert_eq!(
            fx.core.heap.relocation_target(block).unwrap(),
            &kaal_heap::RelocationTarget::Capability(renamed)
        );
        assert_eq!(fx.core.capability(&inner_slot), Err(KernelError::NoCapability));
    }

    #[test]
    fn test_move_node_into_itself_is_rejected() {
        let mut fx = Fixture::new();
        let node = fx.core.alloc_node(2).unwrap();
        fx.core.populate(&fx.at(3), node, ObjectKind::Node, CapFlags::HEAP_MANAGED).unwrap();
        let inside = CapAddress::new(fx.tid, 3 | (2 << 4), 6);
        assert_eq!(fx.core.move_cap(&fx.at(3), &inside), Err(KernelError::InvalidArgument));
        assert_eq!(fx.cap(3).resource, node);
    }

    #[test]
    fn test_node_nesting_limit() {
        let config = KernelConfig { max_nesting: 1, ..KernelConfig::default() };
        let mut core = Core::new(config).unwrap();
        let (tid, _) = core.create_thread(1).unwrap();
        let root = core.alloc_node(2).unwrap();
        core.populate(&CapAddress::root(tid), root, ObjectKind::Node, CapFlags::HEAP_MANAGED)
            .unwrap();
        let level1 = core.alloc_node(2).unwrap();
        core.populate(&CapAddress::new(tid, 0, 2), level1, ObjectKind::Node, CapFlags::HEAP_MANAGED)
            .unwrap();
        let level2 = core.alloc_node(2).unwrap();
        assert_eq!(
            core.populate(&CapAddress::new(tid, 0, 4), level2, ObjectKind::Node, CapFlags::empty()),
            Err(KernelError::TooMuchNesting)
        );
        assert_eq!(NodeHeader::read(&core.heap, level1).unwrap().nesting, 1);
    }

    #[test]
    fn test_deleting_node_deletes_contents() {
        let mut fx = Fixture::new();
        let node = fx.core.alloc_node(2).unwrap();
        fx.core.populate(&fx.at(3), node, ObjectKind::Node, CapFlags::HEAP_MANAGED).unwrap();
        let inner_slot = CapAddress::new(fx.tid, 3, 6);
        let block = fx.core.heap_alloc(32).unwrap();
        fx.core.populate(&inner_slot, block, ObjectKind::Untyped, CapFlags::HEAP_MANAGED).unwrap();

        fx.core.delete(&fx.at(3)).unwrap();
        assert!(fx.core.heap.size_of(node).is_err());
        assert!(fx.core.heap.size_of(block).is_err());
        assert!(fx.cap(3).is_empty());
    }

    #[test]
    fn test_deleting_node_holding_its_owner_thread() {
        let mut fx = Fixture::new();
        let object = fx.core.threads.get(fx.tid).unwrap();
        let root = fx.core.capability(&CapAddress::root(fx.tid)).unwrap().resource;
        let node = fx.core.alloc_node(2).unwrap();
        fx.core.populate(&fx.at(3), node, ObjectKind::Node, CapFlags::HEAP_MANAGED).unwrap();
        let inner_slot = CapAddress::new(fx.tid, 3, 6);
        fx.core.populate(&inner_slot, object, ObjectKind::Thread, CapFlags::HEAP_MANAGED).unwrap();
        let block = fx.untyped(5, 32);
        fx.core.take_events();

        // The thread's only capability lives inside the node, and the
        // node lives inside the thread's own root.
        assert_eq!(fx.core.delete(&fx.at(3)), Ok(()));
        for freed in [node, object, root, block] {
            assert!(fx.core.heap.size_of(freed).is_err());
        }
        assert_eq!(fx.core.heap.stats().used, 0);
        assert!(fx.core.threads.is_empty());
        assert!(fx.core.dying_threads.is_empty());
        assert_eq!(fx.core.take_events(), vec![CoreEvent::ThreadDestroyed(fx.tid)]);
        fx.core.heap.validate().unwrap();
    }

    #[test]
    fn test_thread_deleting_its_own_capability() {
        let mut fx = Fixture::new();
        let object = fx.core.threads.get(fx.tid).unwrap();
        fx.core.populate(&fx.at(5), object, ObjectKind::Thread, CapFlags::HEAP_MANAGED).unwrap();
        let block = fx.untyped(6, 32);

        fx.core.delete(&fx.at(5)).unwrap();
        assert!(fx.core.heap.size_of(object).is_err());
        assert!(fx.core.heap.size_of(block).is_err());
        assert_eq!(fx.core.threads.get(fx.tid), None);
        assert_eq!(fx.core.heap.stats().used, 0);
    }
}
