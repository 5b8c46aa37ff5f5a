// Copyright 2025-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! Frame identities recorded into the frame buffer and used as CCT keys.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::num::NonZeroU64;

/// Identifies a loaded code module within one recipe-database snapshot.
#[derive(Copy, Clone, Debug, Default, Eq, PartialEq, Hash, Ord, PartialOrd, Serialize, Deserialize)]
#[repr(transparent)]
pub struct ModuleId(pub u32);

impl ModuleId {
    /// Addresses that fall outside every known module.
    pub const UNKNOWN: ModuleId = ModuleId(0);
}

/// An instruction pointer made position-independent: the module it belongs
/// to, and the offset from that module's load base. Two processes (or two
/// runs with different address-space layouts) agree on normalized ips.
#[derive(Copy, Clone, Default, Eq, PartialEq, Hash, Ord, PartialOrd, Serialize, Deserialize)]
pub struct NormalizedIp {
    pub module: ModuleId,
    pub offset: usize,
}

impl NormalizedIp {
    pub const fn new(module: ModuleId, offset: usize) -> Self {
        Self { module, offset }
    }

    /// An address that could not be attributed to a module.
    pub const fn unknown(pc: usize) -> Self {
        Self::new(ModuleId::UNKNOWN, pc)
    }

    pub fn is_unknown(&self) -> bool {
        self.module == ModuleId::UNKNOWN
    }
}

impl fmt::Debug for NormalizedIp {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}+{:#x}", self.module.0, self.offset)
    }
}

/// Whether a frame was found by walking machine state or contributed by a
/// logical-unwind provider.
#[derive(Copy, Clone, Debug, Default, Eq, PartialEq, Hash, Ord, PartialOrd, Serialize, Deserialize)]
pub enum FrameKind {
    #[default]
    Physical,
    Logical,
}

/// Opaque identity a logical-unwind provider attaches to a frame, such as an
/// interpreter's function handle.
#[derive(Copy, Clone, Debug, Eq, PartialEq, Hash, Ord, PartialOrd, Serialize, Deserialize)]
#[repr(transparent)]
pub struct LogicalId(pub NonZeroU64);

/// How physical frames relate to logical frames at one CCT position. Stored
/// as bits so that a node which has been reached with different associations
/// keeps every one of them.
#[derive(Copy, Clone, Default, Eq, PartialEq, Hash, Serialize, Deserialize)]
#[repr(transparent)]
pub struct Association(u8);

impl Association {
    /// Plain physical frame, no logical agent involved.
    pub const NONE: Association = Association(0);
    pub const ONE_TO_ONE: Association = Association(1 << 0);
    pub const MANY_TO_ONE: Association = Association(1 << 1);
    pub const ONE_TO_MANY: Association = Association(1 << 2);

    pub const fn bits(self) -> u8 {
        self.0
    }

    pub const fn from_bits(bits: u8) -> Self {
        Self(bits & 0b111)
    }

    pub const fn contains(self, other: Association) -> bool {
        self.0 & other.0 == other.0
    }

    /// The association a node should carry after a frame tagged `incoming`
    /// is inserted at it. A 1-to-1 frame landing on a node created with a
    /// different association makes the node a proxy for both: the 1-to-1 bit
    /// is added and nothing already recorded is cleared.
    pub const fn merged_with(self, incoming: Association) -> Association {
        if incoming.0 == Self::ONE_TO_ONE.0 && self.0 != incoming.0 {
            Association(self.0 | Self::ONE_TO_ONE.0)
        } else {
            self
        }
    }

    /// True when the node stands for a 1-to-1 path and some other
    /// association at the same time.
    pub const fn is_proxy(self) -> bool {
        self.contains(Self::ONE_TO_ONE) && self.0 != Self::ONE_TO_ONE.0
    }
}

impl fmt::Debug for Association {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.0 == 0 {
            return f.write_str("NONE");
        }
        let names = [
            (Self::ONE_TO_ONE, "1:1"),
            (Self::MANY_TO_ONE, "M:1"),
            (Self::ONE_TO_MANY, "1:M"),
        ];
        let mut first = true;
        for (flag, name) in names {
            if self.contains(flag) {
                if !first {
                    f.write_str("|")?;
                }
                f.write_str(name)?;
                first = false;
            }
        }
        Ok(())
    }
}

/// One entry of a backtrace.
#[derive(Copy, Clone, Debug, Default, Eq, PartialEq, Hash)]
pub struct Frame {
    pub ip: NormalizedIp,
    pub kind: FrameKind,
    pub assoc: Association,
    pub logical: Option<LogicalId>,
}

impl Frame {
    pub const fn physical(ip: NormalizedIp) -> Self {
        Self {
            ip,
            kind: FrameKind::Physical,
            assoc: Association::NONE,
            logical: None,
        }
    }

    pub const fn key(&self) -> FrameKey {
        FrameKey {
            ip: self.ip,
            kind: self.kind,
            logical: self.logical,
        }
    }
}

/// What distinguishes siblings in the CCT. The association is deliberately
/// not part of the key; it is corrected on the node after lookup.
#[derive(Copy, Clone, Debug, Default, Eq, PartialEq, Hash, Ord, PartialOrd, Serialize, Deserialize)]
pub struct FrameKey {
    pub ip: NormalizedIp,
    pub kind: FrameKind,
    pub logical: Option<LogicalId>,
}
