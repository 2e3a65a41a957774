use crate::device::TbProfile;

/// The default MTU of an ethernet link.
pub const MTU_ETHERNET: u32 = 1_500;

/// Which traffic an interface schedules.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash)]
pub enum Direction {
    /// Outgoing packets: the scheduling disciplines.
    #[default]
    Output,
    /// Incoming packets, handled by traffic conditioners.
    Input,
}

/// Options of a managed interface.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct InterfaceConfig {
    /// Nominal bandwidth in bits per second.
    pub bandwidth: u64,
    /// Largest packet size in bytes.
    pub mtu: u32,
    pub direction: Direction,
    /// The token-bucket profile to install on enable. `None` leaves the regulator alone.
    pub token_bucket: Option<TbProfile>,
}

impl Default for InterfaceConfig {
    fn default() -> Self {
        Self { bandwidth: 0, mtu: MTU_ETHERNET, direction: Direction::Output, token_bucket: None }
    }
}

impl InterfaceConfig {
    /// An output interface of `bandwidth` bits per second with an ethernet MTU.
    pub fn new(bandwidth: u64) -> Self {
        Self { bandwidth, ..Default::default() }
    }

    pub const fn with_mtu(mut self, mtu: u32) -> Self {
        self.mtu = mtu;
        self
    }

    /// Marks the interface as an input interface for traffic conditioners.
    pub const fn input(mut self) -> Self {
        self.direction = Direction::Input;
        self
    }

    /// Shapes the interface with `profile`. A zero rate means the interface bandwidth, a zero
    /// depth an automatic depth.
    pub const fn with_token_bucket(mut self, profile: TbProfile) -> Self {
        self.token_bucket = Some(profile);
        self
    }

    /// The token-bucket profile to install, with defaults filled in.
    pub fn effective_token_bucket(&self) -> Option<TbProfile> {
        let requested = self.token_bucket?;
        let rate = if requested.rate == 0 { self.bandwidth } else { requested.rate };
        let depth = if requested.depth == 0 { auto_depth(rate, self.mtu) } else { requested.depth };
        Some(TbProfile::new(rate, depth))
    }
}

/// A bucket deep enough for a few packets at `rate`, so that a busy link is not starved by timer
/// granularity.
pub fn auto_depth(rate: u64, mtu: u32) -> u32 {
    let packets: u32 = match rate {
        0..=1_000_000 => 1,
        1_000_001..=10_000_000 => 4,
        10_000_001..=200_000_000 => 8,
        _ => 24,
    };
    packets.saturating_mul(mtu)
}
