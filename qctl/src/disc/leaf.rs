//! Disciplines without classes: RED, RIO, BLUE, WFQ and plain FIFO.
//!
//! They only hand a parameter block to the device. Filters and classes are not supported, so
//! [`LeafDiscipline::as_classful`](Discipline::as_classful) returns `None`.

use bitflags::bitflags;

use super::{Discipline, DisciplineKind};
use crate::{
    device::{Link, QdiscParams, SchedulerDevice},
    error::{Error, Result},
};

bitflags! {
    /// Options of the RED family.
    #[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash)]
    pub struct RedFlags: u32 {
        /// Mark instead of dropping, for IPv4.
        const ECN4 = 0x01;
        /// Mark instead of dropping, for IPv6.
        const ECN6 = 0x02;
        const ECN = Self::ECN4.bits() | Self::ECN6.bits();
        /// Penalize flows that do not respond to drops.
        const FLOWVALVE = 0x04;
    }
}

/// Drop thresholds of one RED precedence.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct RedThresholds {
    /// Inverse of the maximum drop probability.
    pub inv_pmax: u32,
    /// Average queue length where dropping starts.
    pub th_min: u32,
    /// Average queue length where everything is dropped.
    pub th_max: u32,
}

impl RedThresholds {
    pub const fn new(inv_pmax: u32, th_min: u32, th_max: u32) -> Self {
        Self { inv_pmax, th_min, th_max }
    }

    fn validate(&self, qlimit: u32) -> Result<()> {
        if self.inv_pmax == 0 {
            return Err(Error::InvalidParameter("red: inv_pmax must be nonzero".into()));
        }
        if self.th_min >= self.th_max || self.th_max > qlimit {
            return Err(Error::InvalidParameter(format!(
                "red: thresholds {}..{} do not fit a queue of {qlimit}",
                self.th_min, self.th_max
            )));
        }
        Ok(())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct RedParams {
    /// Inverse of the averaging weight. A power of two.
    pub weight: u32,
    pub qlimit: u32,
    pub thresholds: RedThresholds,
    pub flags: RedFlags,
}

impl Default for RedParams {
    fn default() -> Self {
        Self {
            weight: 512,
            qlimit: 60,
            thresholds: RedThresholds::new(10, 5, 15),
            flags: RedFlags::empty(),
        }
    }
}

/// RED with in/out profile precedences, lowest drop precedence first.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct RioParams {
    pub weight: u32,
    pub qlimit: u32,
    pub precedences: [RedThresholds; 3],
    pub flags: RedFlags,
}

impl Default for RioParams {
    fn default() -> Self {
        Self {
            weight: 512,
            qlimit: 60,
            precedences: [
                RedThresholds::new(10, 40, 50),
                RedThresholds::new(10, 20, 30),
                RedThresholds::new(10, 5, 15),
            ],
            flags: RedFlags::empty(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct BlueParams {
    pub qlimit: u32,
    /// Marking probability resolution.
    pub max_pmark: u32,
    /// Minimum time between probability updates, in milliseconds.
    pub hold_time_ms: u32,
    pub flags: RedFlags,
}

impl Default for BlueParams {
    fn default() -> Self {
        Self { qlimit: 50, max_pmark: 1_000, hold_time_ms: 50, flags: RedFlags::empty() }
    }
}

/// What WFQ hashes packets on to pick a queue.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash)]
pub enum WfqHash {
    #[default]
    DstAddr,
    /// Addresses, ports and protocol.
    Full,
    SrcPort,
    SrcAddr,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct WfqParams {
    pub hash: WfqHash,
    pub nqueues: u32,
    /// Per-queue limit in packets.
    pub qsize: u32,
}

impl Default for WfqParams {
    fn default() -> Self {
        Self { hash: WfqHash::DstAddr, nqueues: 256, qsize: 64 }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct FifoParams {
    pub qlimit: u32,
}

impl Default for FifoParams {
    fn default() -> Self {
        Self { qlimit: 50 }
    }
}

/// The parameter block of a leaf discipline.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum LeafParams {
    Red(RedParams),
    Rio(RioParams),
    Blue(BlueParams),
    Wfq(WfqParams),
    Fifo(FifoParams),
}

impl LeafParams {
    pub const fn kind(&self) -> DisciplineKind {
        match self {
            Self::Red(_) => DisciplineKind::Red,
            Self::Rio(_) => DisciplineKind::Rio,
            Self::Blue(_) => DisciplineKind::Blue,
            Self::Wfq(_) => DisciplineKind::Wfq,
            Self::Fifo(_) => DisciplineKind::Fifo,
        }
    }

    pub fn validate(&self) -> Result<()> {
        match self {
            Self::Red(red) => {
                check_weight(red.weight)?;
                red.thresholds.validate(red.qlimit)
            }
            Self::Rio(rio) => {
                check_weight(rio.weight)?;
                rio.precedences.iter().try_for_each(|t| t.validate(rio.qlimit))
            }
            Self::Blue(blue) if blue.max_pmark == 0 || blue.qlimit == 0 => {
                Err(Error::InvalidParameter("blue: max_pmark and qlimit must be nonzero".into()))
            }
            Self::Wfq(wfq) if wfq.nqueues == 0 || wfq.qsize == 0 => {
                Err(Error::InvalidParameter("wfq: nqueues and qsize must be nonzero".into()))
            }
            Self::Fifo(fifo) if fifo.qlimit == 0 => {
                Err(Error::InvalidParameter("fifo: qlimit must be nonzero".into()))
            }
            _ => Ok(()),
        }
    }
}

fn check_weight(weight: u32) -> Result<()> {
    if !weight.is_power_of_two() {
        return Err(Error::InvalidParameter(format!("red: weight {weight} is not a power of two")));
    }
    Ok(())
}

/// A discipline that schedules the whole interface as one queue.
#[derive(Debug)]
pub struct LeafDiscipline {
    params: LeafParams,
}

impl LeafDiscipline {
    pub const fn new(params: LeafParams) -> Self {
        Self { params }
    }

    pub const fn params(&self) -> &LeafParams {
        &self.params
    }
}

impl Discipline for LeafDiscipline {
    fn kind(&self) -> DisciplineKind {
        self.params.kind()
    }

    fn qdisc_params(&self) -> QdiscParams {
        QdiscParams::Leaf(self.params)
    }

    fn attach(&mut self, link: &Link<'_>, device: &mut dyn SchedulerDevice) -> Result<()> {
        self.params.validate()?;
        Ok(device.attach(link, &self.qdisc_params())?)
    }
}
