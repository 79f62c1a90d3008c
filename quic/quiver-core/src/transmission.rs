// Copyright the quiver authors. All Rights Reserved.
// SPDX-License-Identifier: Apache-2.0

//! Send-blocked bookkeeping
//!
//! When the scheduler or builder cannot make progress it records why; the
//! bits drive the pacing timer and show up in diagnostics. A bit is set
//! when the blocker is observed and cleared when the condition resolves.

use core::fmt;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum BlockedReason {
    Scheduling,
    Pacing,
    AmplificationProtection,
    CongestionControl,
    ConnFlowControl,
    StreamIdFlowControl,
    StreamFlowControl,
    App,
}

impl BlockedReason {
    const ALL: [Self; 8] = [
        Self::Scheduling,
        Self::Pacing,
        Self::AmplificationProtection,
        Self::CongestionControl,
        Self::ConnFlowControl,
        Self::StreamIdFlowControl,
        Self::StreamFlowControl,
        Self::App,
    ];

    #[inline]
    fn mask(self) -> u8 {
        1 << (self as u8)
    }
}

/// The set of reasons sending is currently blocked
#[derive(Clone, Copy, Default, PartialEq, Eq)]
pub struct BlockedReasons(u8);

impl BlockedReasons {
    pub const NONE: Self = Self(0);

    /// Records a blocker; returns `true` if it was newly set
    #[inline]
    pub fn set(&mut self, reason: BlockedReason) -> bool {
        let previously_set = self.contains(reason);
        self.0 |= reason.mask();
        !previously_set
    }

    /// Clears a resolved blocker; returns `true` if it had been set
    #[inline]
    pub fn clear(&mut self, reason: BlockedReason) -> bool {
        let previously_set = self.contains(reason);
        self.0 &= !reason.mask();
        previously_set
    }

    #[inline]
    pub fn contains(&self, reason: BlockedReason) -> bool {
        self.0 & reason.mask() != 0
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.0 == 0
    }
}

impl fmt::Debug for BlockedReasons {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.debug_set()
            .entries(
                BlockedReason::ALL
                    .iter()
                    .filter(|reason| self.contains(**reason)),
            )
            .finish()
    }
}

impl fmt::Display for BlockedReasons {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        if self.is_empty() {
            return write!(f, "none");
        }
        let mut first = true;
        for reason in BlockedReason::ALL {
            if self.contains(reason) {
                if !first {
                    write!(f, "|")?;
                }
                write!(f, "{reason:?}")?;
                first = false;
            }
        }
        Ok(())
    }
}
