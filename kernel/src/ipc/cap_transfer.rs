//! Capability transfer during IPC
//!
//! A transfer copies the sender's capability into the receiver's receive
//! slot with the sender's rights. The sender keeps its capability and the
//! badge value travels with the copy. Failure
//! never blocks the message itself; it only shows up as `r4 = 0` and a
//! `BadMessage` result for the receiver.

use log::{debug, warn};

use crate::context::Core;
use crate::objects::{CapAddress, CapRights};

/// Copy `from` into `to`
///
/// `None` when nothing was sent, otherwise whether the capability arrived.
pub fn transfer_capability(
    core: &mut Core,
    from: Option<CapAddress>,
    to: Option<CapAddress>,
) -> Option<bool> {
    let from = from?;
    let Some(to) = to else {
        debug!("ipc: receiver has no slot for {}", from);
        return Some(false);
    };
    match core.deliver(&from, &to, CapRights::ALL) {
        Ok(address) => {
            debug!("ipc: transferred {} -> {}", from, address);
            Some(true)
        }
        Err(err) => {
            warn!("ipc: transfer {} -> {} failed: {}", from, to, err);
            Some(false)
        }
    }
}
