//! Resource and derivation list maintenance
//!
//! Links are capability addresses, so every splice is a handful of
//! read-modify-write cycles on the neighbouring slots.

use log::error;

use crate::config::MAX_DERIVATION_LEVEL;
use crate::context::Core;
use crate::error::{KernelError, Result};
use crate::objects::{CapAddress, CapFlags, Capability};

/// Longest derivation chain walked before declaring a cycle
const CHAIN_LIMIT: u8 = MAX_DERIVATION_LEVEL + 1;

impl Core {
    /// Distance from `cap` to the top of its derivation tree
    pub(crate) fn derivation_level(&self, cap: &Capability) -> Result<u8> {
        let mut level = 0;
        let mut cursor = cap.derived_from;
        while let Some(parent) = cursor {
            if parent == cap.address || level >= CHAIN_LIMIT {
                error!("cspace: derivation chain of {} does not terminate", cap.address);
                debug_assert!(false, "derivation cycle through {}", cap.address);
                return Err(KernelError::Corrupted);
            }
            level += 1;
            cursor = self.capability(&parent)?.derived_from;
        }
        Ok(level)
    }

    /// Addresses of the direct derivation children of `cap`
    pub(crate) fn derived_children(&self, cap: &Capability) -> Result<Vec<CapAddress>> {
        let mut children = Vec::new();
        let mut cursor = cap.first_derived;
        while let Some(child) = cursor {
            if children.contains(&child) {
                error!("cspace: derivation list of {} loops at {}", cap.address, child);
                return Err(KernelError::Corrupted);
            }
            children.push(child);
            cursor = self.capability(&child)?.deriv_next;
        }
        Ok(children)
    }

    /// Link a fresh capability at `new` into the resource list after `source`
    pub(crate) fn link_resource_after(&mut self, source: &Capability, new: CapAddress) -> Result<()> {
        let next = source.res_next;
        self.update_cap(&new, |cap| {
            cap.res_prev = Some(source.address);
            cap.res_next = next;
        })?;
        if let Some(next) = next {
            self.update_cap(&next, |cap| cap.res_prev = Some(new))?;
        }
        self.update_cap(&source.address, |cap| cap.res_next = Some(new))
    }

    /// Make `new` the first derivation child of `parent`
    pub(crate) fn link_first_child(&mut self, parent: &Capability, new: CapAddress) -> Result<()> {
        let first = parent.first_derived;
        self.update_cap(&new, |cap| {
            cap.derived_from = Some(parent.address);
            cap.deriv_prev = None;
            cap.deriv_next = first;
        })?;
        if let Some(first) = first {
            self.update_cap(&first, |cap| cap.deriv_prev = Some(new))?;
        }
        self.update_cap(&parent.address, |cap| cap.first_derived = Some(new))
    }

    /// Insert `new` after `sibling` in the sibling's derivation list
    pub(crate) fn link_sibling_after(&mut self, sibling: &Capability, new: CapAddress) -> Result<()> {
        let next = sibling.deriv_next;
        self.update_cap(&new, |cap| {
            cap.derived_from = sibling.derived_from;
            cap.deriv_prev = Some(sibling.address);
            cap.deriv_next = next;
        })?;
        if let Some(next) = next {
            self.update_cap(&next, |cap| cap.deriv_prev = Some(new))?;
        }
        self.update_cap(&sibling.address, |cap| cap.deriv_next = Some(new))
    }

    /// Take `cap` out of its derivation list, splicing its children into
    /// its place (they become children of its parent, or orphans)
    pub(crate) fn unlink_derivation(&mut self, cap: &Capability) -> Result<()> {
        let parent = cap.derived_from;
        let children = self.derived_children(cap)?;
        for child in &children {
            self.update_cap(child, |c| c.derived_from = parent)?;
        }

        match (children.first(), children.last()) {
            (Some(&first), Some(&last)) => {
                self.link_siblings(parent, cap.deriv_prev, Some(first))?;
                self.link_siblings(parent, Some(last), cap.deriv_next)
            }
            _ => self.link_siblings(parent, cap.deriv_prev, cap.deriv_next),
        }
    }

    /// Make `next` follow `prev`; a missing `prev` means `next` heads the list
    fn link_siblings(
        &mut self,
        parent: Option<CapAddress>,
        prev: Option<CapAddress>,
        next: Option<CapAddress>,
    ) -> Result<()> {
        match (prev, parent) {
            (Some(prev), _) => self.update_cap(&prev, |c| c.deriv_next = next)?,
            (None, Some(parent)) => self.update_cap(&parent, |c| c.first_derived = next)?,
            (None, None) => {}
        }
        if let Some(next) = next {
            self.update_cap(&next, |c| c.deriv_prev = prev)?;
        }
        Ok(())
    }

    /// Take `cap` out of its resource list, returning whether it was the
    /// last member
    ///
    /// When the owner leaves, ownership (and the heap relocation target of a
    /// heap-managed resource) passes to the next member.
    pub(crate) fn unlink_resource(&mut self, cap: &Capability) -> Result<bool> {
        let (prev, next) = (cap.res_prev, cap.res_next);
        if let Some(prev) = prev {
            self.update_cap(&prev, |c| c.res_next = next)?;
        }
        if let Some(next) = next {
            self.update_cap(&next, |c| c.res_prev = prev)?;
            if prev.is_none() && cap.flags.contains(CapFlags::HEAP_MANAGED) {
                self.heap.set_relocation_capability(cap.resource, next)?;
            }
        }
        Ok(prev.is_none() && next.is_none())
    }
}
