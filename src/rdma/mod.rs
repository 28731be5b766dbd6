//! Verbs objects.

pub mod ah;
pub mod bf;
pub mod buf;
pub mod caps;
pub mod context;
pub mod cq;
pub mod dbrec;
pub mod device;
pub mod flow;
pub mod gid;
pub mod mr;
pub mod pd;
pub mod qp;
pub mod sizing;
pub mod srq;
pub mod table;
pub mod td;
pub mod wq;
pub mod xrcd;
