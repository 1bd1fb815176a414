use core::fmt;

/// The commands this crate can build packets for
///
/// The command channel itself is opcode agnostic, this enum only covers the
/// commands defined in the per group modules (`cb`, `link_control`,
/// `info_params`, `le`).
#[derive(Debug,Clone,Copy,PartialEq,Eq)]
pub enum HCICommand {
    LinkControl(LinkControl),
    ControllerAndBaseband(ControllerAndBaseband),
    InformationParameters(InformationParameters),
    LEController(LEController),
}

impl HCICommand {
    pub fn as_opcode_pair(&self) -> OpCodePair {
        match *self {
            HCICommand::LinkControl(ref ocf) => ocf.as_opcode_pair(),
            HCICommand::ControllerAndBaseband(ref ocf) => ocf.as_opcode_pair(),
            HCICommand::InformationParameters(ref ocf) => ocf.as_opcode_pair(),
            HCICommand::LEController(ref ocf) => ocf.as_opcode_pair(),
        }
    }

    pub fn try_from(oc_pair: OpCodePair) -> Result<Self, &'static str> {
        match oc_pair.ogf {
            LinkControl::OGF =>
                LinkControl::try_from_ocf(oc_pair.ocf).map(HCICommand::LinkControl),
            ControllerAndBaseband::OGF =>
                ControllerAndBaseband::try_from_ocf(oc_pair.ocf).map(HCICommand::ControllerAndBaseband),
            InformationParameters::OGF =>
                InformationParameters::try_from_ocf(oc_pair.ocf).map(HCICommand::InformationParameters),
            LEController::OGF =>
                LEController::try_from_ocf(oc_pair.ocf).map(HCICommand::LEController),
            _ => Err("Unknown OpCode Group Field"),
        }
    }
}

impl fmt::Display for HCICommand {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "{:?}", self)
    }
}

/// An type for the pair of OGF (OpCode Group Field) and OCF (OpCode Command Field)
#[derive(Debug,Clone,Copy,PartialEq,Eq)]
pub struct OpCodePair {
    pub ogf: u16,
    pub ocf: u16,
}

impl OpCodePair {
    /// Combine the pair into the opcode field of a command packet
    pub fn as_opcode(&self) -> u16 {
        (self.ogf << 10) | (self.ocf & 0x3FF)
    }

    /// Split a raw opcode into the OGF and OCF
    pub fn from_opcode(opcode: u16) -> Self {
        OpCodePair {
            ogf: opcode >> 10,
            ocf: opcode & 0x3FF,
        }
    }
}

#[derive(Debug,Clone,Copy,PartialEq,Eq)]
pub enum LinkControl {
    Inquiry,
    Disconnect,
}

impl LinkControl {
    const OGF: u16 = 0x1;

    #[inline]
    fn as_opcode_pair(&self) -> OpCodePair {
        use self::LinkControl::*;

        OpCodePair {
            ogf: LinkControl::OGF,
            ocf: match *self {
                Inquiry => 0x1,
                Disconnect => 0x6,
            }
        }
    }

    fn try_from_ocf(ocf: u16) -> Result<Self, &'static str> {
        match ocf {
            0x1 => Ok(LinkControl::Inquiry),
            0x6 => Ok(LinkControl::Disconnect),
            _ => Err("Unknown Link Control command"),
        }
    }
}

#[derive(Debug,Clone,Copy,PartialEq,Eq)]
pub enum ControllerAndBaseband {
    SetEventMask,
    Reset,
}

impl ControllerAndBaseband {
    const OGF: u16 = 0x3;

    #[inline]
    fn as_opcode_pair(&self) -> OpCodePair {
        use self::ControllerAndBaseband::*;

        OpCodePair {
            ogf: ControllerAndBaseband::OGF,
            ocf: match *self {
                SetEventMask => 0x1,
                Reset => 0x3,
            }
        }
    }

    fn try_from_ocf(ocf: u16) -> Result<Self, &'static str> {
        match ocf {
            0x1 => Ok(ControllerAndBaseband::SetEventMask),
            0x3 => Ok(ControllerAndBaseband::Reset),
            _ => Err("Unknown Controller and Baseband command"),
        }
    }
}

#[derive(Debug,Clone,Copy,PartialEq,Eq)]
pub enum InformationParameters {
    ReadBufferSize,
}

impl InformationParameters {
    const OGF: u16 = 0x4;

    #[inline]
    fn as_opcode_pair(&self) -> OpCodePair {
        use self::InformationParameters::*;

        OpCodePair {
            ogf: InformationParameters::OGF,
            ocf: match *self {
                ReadBufferSize => 0x5,
            }
        }
    }

    fn try_from_ocf(ocf: u16) -> Result<Self, &'static str> {
        match ocf {
            0x5 => Ok(InformationParameters::ReadBufferSize),
            _ => Err("Unknown Information Parameters command"),
        }
    }
}

#[derive(Debug,Clone,Copy,PartialEq,Eq)]
pub enum LEController {
    ReadBufferSize,
}

impl LEController {
    const OGF: u16 = 0x8;

    #[inline]
    fn as_opcode_pair( &self ) -> OpCodePair {
        use self::LEController::*;

        OpCodePair {
            ogf: LEController::OGF,
            ocf: match *self {
                ReadBufferSize => 0x2,
            }
        }
    }

    fn try_from_ocf(ocf: u16) -> Result<Self, &'static str> {
        match ocf {
            0x2 => Ok(LEController::ReadBufferSize),
            _ => Err("Unknown LE Controller command"),
        }
    }
}
