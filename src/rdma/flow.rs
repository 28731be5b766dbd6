//! Steering rules directing matching packets to a QP.

use std::fmt;

use super::qp::Qp;
use crate::abi::{CreateFlow, Handle};
use crate::error::{DestroyError, Error, Result};
use crate::rdma::context::Context;

/// Size of the `{type, size, reserved}` header preceding each spec.
const SPEC_HEADER_LEN: usize = 8;

/// One match specification, already in its kernel layout after the header.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FlowSpec {
    pub spec_type: u32,
    pub payload: Vec<u8>,
}

/// Steering rule attributes.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct FlowAttr {
    pub flow_type: u32,
    pub priority: u16,
    pub port: u8,
    pub flags: u32,
    pub specs: Vec<FlowSpec>,
}

impl FlowAttr {
    fn encode_specs(&self) -> Result<Vec<u8>> {
        let mut out = Vec::new();
        for spec in &self.specs {
            let size = u16::try_from(SPEC_HEADER_LEN + spec.payload.len())
                .map_err(|_| Error::InvalidArgument("flow spec too large"))?;
            out.extend_from_slice(&spec.spec_type.to_ne_bytes());
            out.extend_from_slice(&size.to_ne_bytes());
            out.extend_from_slice(&[0; 2]);
            out.extend_from_slice(&spec.payload);
        }
        Ok(out)
    }
}

/// A steering rule attached to a QP.
pub struct Flow {
    ctx: Context,
    handle: Handle,
    live: bool,
}

impl fmt::Debug for Flow {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_fmt(format_args!("Flow<{}>", self.handle))
    }
}

impl Flow {
    /// Attach a steering rule to `qp`.
    pub fn create(qp: &Qp, attr: &FlowAttr) -> Result<Flow> {
        let num_of_specs = u8::try_from(attr.specs.len())
            .map_err(|_| Error::InvalidArgument("too many flow specs"))?;
        let cmd = CreateFlow {
            qp_handle: qp.handle(),
            flow_type: attr.flow_type,
            priority: attr.priority,
            port: attr.port,
            flags: attr.flags,
            num_of_specs,
            specs: attr.encode_specs()?,
        };
        let ctx = qp.context();
        let handle = ctx.kernel().create_flow(&cmd).map_err(|e| {
            log::debug!("rmlx5: create_flow failed: {}", e);
            e
        })?;
        Ok(Flow {
            ctx: ctx.clone(),
            handle,
            live: true,
        })
    }

    /// Kernel handle.
    #[inline]
    pub fn handle(&self) -> Handle {
        self.handle
    }

    fn destroy_impl(&mut self) -> Result<()> {
        self.ctx.kernel().destroy_flow(self.handle)?;
        self.live = false;
        Ok(())
    }

    /// Detach the rule.
    pub fn destroy(mut self) -> Result<(), DestroyError<Flow>> {
        match self.destroy_impl() {
            Ok(()) => Ok(()),
            Err(e) => Err(DestroyError::new(self, e)),
        }
    }
}

impl Drop for Flow {
    fn drop(&mut self) {
        if self.live {
            if let Err(e) = self.destroy_impl() {
                log::error!("rmlx5: cannot destroy flow {} on drop: {}", self.handle, e);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::rdma::context::tests::test_context;
    use crate::rdma::cq::Cq;
    use crate::rdma::pd::Pd;
    use crate::rdma::qp::{QpBuilder, QpCaps, QpType};

    #[test]
    fn test_flow_pins_qp() -> anyhow::Result<()> {
        let (ctx, kernel) = test_context();
        let pd = Pd::new(&ctx)?;
        let cq = Cq::new(&ctx, 16)?;
        let qp = QpBuilder::new()
            .qp_type(QpType::RawPacket)
            .send_cq(&cq)
            .recv_cq(&cq)
            .caps(QpCaps::new(8, 8, 1, 1, 0))
            .build(&pd)?;
        let attr = FlowAttr {
            port: 1,
            specs: vec![FlowSpec {
                spec_type: 0x20,
                payload: vec![0xab; 32],
            }],
            ..Default::default()
        };
        let flow = Flow::create(&qp, &attr)?;
        let cmd = kernel.last_create_flow().unwrap();
        assert_eq!(cmd.num_of_specs, 1);
        assert_eq!(cmd.specs.len(), SPEC_HEADER_LEN + 32);
        assert_eq!(&cmd.specs[4..6], &40u16.to_ne_bytes());

        let qp = qp.destroy().unwrap_err().into_inner();
        flow.destroy().unwrap();
        qp.destroy().unwrap();
        Ok(())
    }
}
