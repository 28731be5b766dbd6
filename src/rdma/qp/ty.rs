/// Queue pair type.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u32)]
pub enum QpType {
    /// Reliable connection.
    Rc = 2,

    /// Unreliable connection.
    Uc = 3,

    /// Unreliable datagram.
    Ud = 4,

    /// Raw packet (or Raw Ethernet).
    RawPacket = 8,

    /// Extended reliable connection initiator.
    XrcIni = 9,

    /// Extended reliable connection target.
    XrcTgt = 10,

    /// Driver-specific QP type. The vendor attributes select the transport.
    Driver = 0xff,
}

impl QpType {
    /// Determine whether the QP type is reliable.
    pub const fn is_reliable(self) -> bool {
        matches!(self, Self::Rc | Self::XrcIni | Self::XrcTgt)
    }

    /// Determine whether the QP type is datagram.
    pub const fn is_connected(self) -> bool {
        !matches!(self, Self::Ud | Self::RawPacket)
    }

    /// Determine whether the QP type can be a transmission initiator.
    pub const fn is_initiator(self) -> bool {
        !matches!(self, Self::XrcTgt)
    }

    /// Determine whether the QP type can be a transmission target.
    pub const fn is_target(self) -> bool {
        !matches!(self, Self::XrcIni)
    }
}

impl From<QpType> for u32 {
    fn from(qp_type: QpType) -> Self {
        qp_type as _
    }
}

impl TryFrom<u32> for QpType {
    type Error = u32;

    fn try_from(qp_type: u32) -> Result<Self, u32> {
        Ok(match qp_type {
            2 => QpType::Rc,
            3 => QpType::Uc,
            4 => QpType::Ud,
            8 => QpType::RawPacket,
            9 => QpType::XrcIni,
            10 => QpType::XrcTgt,
            0xff => QpType::Driver,
            _ => return Err(qp_type),
        })
    }
}

/// Dynamically-connected sub-type of a driver QP.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum DcType {
    /// Initiator.
    Dci,
    /// Target.
    Dct,
}

/// The transport a QP was created as, resolved once at creation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum QpFlavor {
    Rc,
    Uc,
    /// `underlay` is set for UD QPs created with a fixed source QPN.
    Ud { underlay: bool },
    RawPacket,
    XrcIni,
    XrcTgt,
    Dci,
    Dct,
    /// Receive-side scaling over an indirection table.
    Rss,
}

impl QpFlavor {
    /// Resolve the flavor from the creation parameters.
    pub(crate) fn resolve(qp_type: QpType, underlay: bool, dc: Option<DcType>, rss: bool) -> Option<Self> {
        if rss {
            return matches!(qp_type, QpType::RawPacket).then_some(QpFlavor::Rss);
        }
        Some(match qp_type {
            QpType::Rc => QpFlavor::Rc,
            QpType::Uc => QpFlavor::Uc,
            QpType::Ud => QpFlavor::Ud { underlay },
            QpType::RawPacket => QpFlavor::RawPacket,
            QpType::XrcIni => QpFlavor::XrcIni,
            QpType::XrcTgt => QpFlavor::XrcTgt,
            QpType::Driver => match dc? {
                DcType::Dci => QpFlavor::Dci,
                DcType::Dct => QpFlavor::Dct,
            },
        })
    }

    /// Whether the send queue lives in a buffer of its own.
    #[inline]
    pub const fn has_split_buffers(self) -> bool {
        matches!(self, QpFlavor::RawPacket | QpFlavor::Ud { underlay: true })
    }

    /// Whether the QP carries work queue buffers at all.
    #[inline]
    pub const fn has_buffers(self) -> bool {
        !matches!(self, QpFlavor::Dct | QpFlavor::Rss)
    }

    #[inline]
    pub const fn is_underlay(self) -> bool {
        matches!(self, QpFlavor::Ud { underlay: true })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_resolve() {
        assert_eq!(QpFlavor::resolve(QpType::Rc, false, None, false), Some(QpFlavor::Rc));
        assert_eq!(
            QpFlavor::resolve(QpType::Ud, true, None, false),
            Some(QpFlavor::Ud { underlay: true })
        );
        assert_eq!(QpFlavor::resolve(QpType::Driver, false, None, false), None);
        assert_eq!(
            QpFlavor::resolve(QpType::Driver, false, Some(DcType::Dct), false),
            Some(QpFlavor::Dct)
        );
        assert_eq!(QpFlavor::resolve(QpType::RawPacket, false, None, true), Some(QpFlavor::Rss));
        assert!(QpFlavor::RawPacket.has_split_buffers());
        assert!(!QpFlavor::Ud { underlay: false }.has_split_buffers());
        assert_eq!(QpType::try_from(9u32), Ok(QpType::XrcIni));
        assert_eq!(QpType::try_from(1u32), Err(1));
    }
}
