//! Ring compaction: removing a departed resource's completions, and
//! carrying pending completions over to a resized ring.

use std::ptr;

use super::cqe::{is_responder, opcode, Cqe64, CQE64_SIZE, CQE_OWNER_MASK};
use super::CqRing;
use crate::rdma::buf::Buf;
use crate::rdma::srq::SrqInner;
use crate::utils::wmb;

impl CqRing {
    /// Whether `cqe` belongs to resource `rsn`.
    fn owned_by(cqe: &Cqe64, rsn: u32, use_uidx: bool) -> bool {
        if use_uidx {
            cqe.srqn_uidx() == rsn
        } else {
            cqe.qpn() == rsn
        }
    }

    /// Remove every pending completion of resource `rsn`.
    ///
    /// `rsn` is a user index when `use_uidx` is set and a QP number
    /// otherwise. Receive completions that consumed a slot of `srq` give
    /// that slot back to the SRQ. Surviving entries keep their relative
    /// order and the consumer index advances past the freed slots, so a
    /// consumer reading from the unchanged oldest position sees only them.
    ///
    /// Returns the number of completions removed.
    pub(crate) fn clean(&mut self, rsn: u32, srq: Option<&SrqInner>, use_uidx: bool) -> u32 {
        if self.buf.is_none() {
            return 0;
        }
        let mask = self.ncqe - 1;

        // Find the producer index: one past the newest software-owned entry.
        let mut prod_index = self.cons_index;
        while self.sw_cqe(prod_index).is_some() {
            if prod_index == self.cons_index.wrapping_add(mask) {
                break;
            }
            prod_index = prod_index.wrapping_add(1);
        }

        // Sweep from newest to oldest, sliding survivors over freed slots.
        let mut nfreed = 0u32;
        while prod_index != self.cons_index {
            prod_index = prod_index.wrapping_sub(1);
            let Some(cqe) = self.cqe64(prod_index) else {
                break;
            };
            if Self::owned_by(&cqe, rsn, use_uidx) {
                if let Some(srq) = srq {
                    if is_responder(cqe.opcode()) {
                        srq.free_wqe(cqe.wqe_counter());
                    }
                }
                nfreed += 1;
            } else if nfreed > 0 {
                let dest_index = prod_index.wrapping_add(nfreed);
                let (Some(src), Some(dest), Some(dest64)) = (
                    self.cqe_ptr(prod_index),
                    self.cqe_ptr(dest_index),
                    self.cqe64(dest_index),
                ) else {
                    break;
                };
                let owner = dest64.owner();
                // SAFETY: distinct entries of the same ring.
                unsafe { ptr::copy_nonoverlapping(src, dest, self.cqe_size) };
                dest64.set_op_own((dest64.op_own() & !CQE_OWNER_MASK) | owner);
            }
        }

        if nfreed > 0 {
            self.cons_index = self.cons_index.wrapping_add(nfreed);
            wmb();
            self.update_cons_index();
        }
        nfreed
    }

    /// Copy pending completions into `new_buf`, stopping at the resize
    /// marker the adapter wrote into the old ring, then step over the
    /// marker.
    ///
    /// The caller swaps the buffers after this returns.
    pub(crate) fn copy_to_resized(&mut self, new_buf: &Buf, new_ncqe: u32) {
        let Some(old) = self.buf.as_ref() else {
            return;
        };
        let part = if self.cqe_size == 128 { CQE64_SIZE } else { 0 };
        let old_mask = self.ncqe - 1;
        let new_mask = new_ncqe - 1;
        let entry = |buf: &Buf, n: u32, mask: u32| {
            // SAFETY: masked index within the ring.
            unsafe { buf.at((n & mask) as usize * self.cqe_size) }
        };

        let start = self.cons_index & old_mask;
        let mut i = self.cons_index;
        loop {
            let src = entry(old, i, old_mask);
            // SAFETY: an entry of the old ring.
            let src64 = unsafe { Cqe64::new(src.add(part)) };
            if src64.opcode() == opcode::RESIZE_CQ {
                break;
            }

            let next = i.wrapping_add(1);
            let dest = entry(new_buf, next, new_mask);
            // SAFETY: an entry of the new ring.
            let dest64 = unsafe { Cqe64::new(dest.add(part)) };
            let sw_own = (next & new_ncqe != 0) as u8;
            // SAFETY: entries of distinct buffers.
            unsafe { ptr::copy_nonoverlapping(src, dest, self.cqe_size) };
            dest64.set_op_own((dest64.op_own() & !CQE_OWNER_MASK) | sw_own);

            i = next;
            if i & old_mask == start {
                log::warn!("rmlx5: resize CQ failed to find the resize CQE");
                return;
            }
        }
        self.cons_index = self.cons_index.wrapping_add(1);
    }
}
