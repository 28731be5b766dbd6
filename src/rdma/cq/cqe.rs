//! Completion entry fields used by bookkeeping.
//!
//! Only the fields needed to find the owner of an entry and to hand ring
//! slots over between software and hardware are decoded here.

/// Owner bit within `op_own`.
pub const CQE_OWNER_MASK: u8 = 1;

/// Completion opcodes, the high nibble of `op_own`.
pub mod opcode {
    pub const REQ: u8 = 0;
    pub const RESP_RDMA_WRITE_IMM: u8 = 1;
    pub const RESP_SEND: u8 = 2;
    pub const RESP_SEND_IMM: u8 = 3;
    pub const RESP_SEND_INV: u8 = 4;
    pub const RESIZE_CQ: u8 = 5;
    pub const REQ_ERR: u8 = 13;
    pub const RESP_ERR: u8 = 14;
    pub const INVALID: u8 = 15;
}

/// Whether an opcode reports a receive-side completion.
#[inline]
pub const fn is_responder(op: u8) -> bool {
    matches!(
        op,
        opcode::RESP_RDMA_WRITE_IMM
            | opcode::RESP_SEND
            | opcode::RESP_SEND_IMM
            | opcode::RESP_SEND_INV
            | opcode::RESP_ERR
    )
}

const SRQN_UIDX: usize = 32;
const SOP_DROP_QPN: usize = 56;
const WQE_COUNTER: usize = 60;
const OP_OWN: usize = 63;

/// Size of the part of an entry hardware fills in. 128-byte entries carry
/// it in their second half.
pub const CQE64_SIZE: usize = 64;

/// View of the 64-byte completion part at a raw address.
#[derive(Debug, Clone, Copy)]
pub(crate) struct Cqe64(*mut u8);

impl Cqe64 {
    /// # Safety
    ///
    /// `ptr` must point to [`CQE64_SIZE`] bytes valid for reads and writes
    /// for as long as the view is used.
    #[inline]
    pub unsafe fn new(ptr: *mut u8) -> Self {
        Self(ptr)
    }

    #[inline]
    fn be32(&self, off: usize) -> u32 {
        let mut b = [0u8; 4];
        // SAFETY: within the 64-byte entry.
        unsafe { std::ptr::copy_nonoverlapping(self.0.add(off), b.as_mut_ptr(), 4) };
        u32::from_be_bytes(b)
    }

    #[inline]
    fn set_be32(&self, off: usize, v: u32) {
        let b = v.to_be_bytes();
        // SAFETY: within the 64-byte entry.
        unsafe { std::ptr::copy_nonoverlapping(b.as_ptr(), self.0.add(off), 4) };
    }

    #[inline]
    pub fn op_own(&self) -> u8 {
        // SAFETY: within the 64-byte entry.
        unsafe { self.0.add(OP_OWN).read_volatile() }
    }

    #[inline]
    pub fn set_op_own(&self, v: u8) {
        // SAFETY: within the 64-byte entry.
        unsafe { self.0.add(OP_OWN).write_volatile(v) }
    }

    #[inline]
    pub fn opcode(&self) -> u8 {
        self.op_own() >> 4
    }

    #[inline]
    pub fn owner(&self) -> u8 {
        self.op_own() & CQE_OWNER_MASK
    }

    /// User index, or SRQ number in legacy mode.
    #[inline]
    pub fn srqn_uidx(&self) -> u32 {
        self.be32(SRQN_UIDX) & 0xff_ffff
    }

    #[inline]
    pub fn qpn(&self) -> u32 {
        self.be32(SOP_DROP_QPN) & 0xff_ffff
    }

    #[inline]
    pub fn wqe_counter(&self) -> u16 {
        let mut b = [0u8; 2];
        // SAFETY: within the 64-byte entry.
        unsafe { std::ptr::copy_nonoverlapping(self.0.add(WQE_COUNTER), b.as_mut_ptr(), 2) };
        u16::from_be_bytes(b)
    }

    /// Fill the routing fields, as the adapter would.
    pub fn fill(&self, op: u8, owner: bool, qpn: u32, srqn_uidx: u32, wqe_counter: u16) {
        self.set_be32(SRQN_UIDX, srqn_uidx & 0xff_ffff);
        self.set_be32(SOP_DROP_QPN, qpn & 0xff_ffff);
        let b = wqe_counter.to_be_bytes();
        // SAFETY: within the 64-byte entry.
        unsafe { std::ptr::copy_nonoverlapping(b.as_ptr(), self.0.add(WQE_COUNTER), 2) };
        self.set_op_own((op << 4) | owner as u8);
    }
}

/// A decoded completion entry.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CqeInfo {
    pub opcode: u8,
    pub qpn: u32,
    pub srqn_uidx: u32,
    pub wqe_counter: u16,
}

impl From<Cqe64> for CqeInfo {
    fn from(cqe: Cqe64) -> Self {
        Self {
            opcode: cqe.opcode(),
            qpn: cqe.qpn(),
            srqn_uidx: cqe.srqn_uidx(),
            wqe_counter: cqe.wqe_counter(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_field_offsets() {
        let mut raw = [0u8; 64];
        // SAFETY: 64 bytes on the stack.
        let cqe = unsafe { Cqe64::new(raw.as_mut_ptr()) };
        cqe.fill(opcode::RESP_SEND, true, 0x12_3456, 0xab_cdef, 0x0102);
        assert_eq!(raw[63], 0x21);
        assert_eq!(&raw[56..60], &[0, 0x12, 0x34, 0x56]);
        assert_eq!(&raw[32..36], &[0, 0xab, 0xcd, 0xef]);
        assert_eq!(&raw[60..62], &[1, 2]);

        let cqe = unsafe { Cqe64::new(raw.as_mut_ptr()) };
        let info = CqeInfo::from(cqe);
        assert_eq!(info.opcode, opcode::RESP_SEND);
        assert_eq!(info.qpn, 0x12_3456);
        assert_eq!(info.srqn_uidx, 0xab_cdef);
        assert_eq!(cqe.owner(), 1);
        assert!(is_responder(info.opcode));
        assert!(!is_responder(opcode::REQ));
    }
}
