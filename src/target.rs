use serde::{Deserialize, Serialize};
use std::fmt;

/// Where a target sits in the instruction stream
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
pub enum Location {
    /// program counter value
    Absolute(u64),
    /// offset from the last fired location (the anchor)
    Relative(i64),
}

impl Location {
    /// Resolve against the anchor, `None` if a relative location has nothing to
    /// be relative to or the offset leaves the address space
    pub fn resolve(&self, anchor: Option<u64>) -> Option<u64> {
        match *self {
            Location::Absolute(pc) => Some(pc),
            Location::Relative(offset) => anchor?.checked_add_signed(offset),
        }
    }

    pub fn is_relative(&self) -> bool {
        matches!(self, Location::Relative(_))
    }
}

impl fmt::Display for Location {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Location::Absolute(pc) => write!(f, "0x{:x}", pc),
            Location::Relative(offset) if *offset < 0 => write!(f, "-0x{:x}", offset.unsigned_abs()),
            Location::Relative(offset) => write!(f, "+0x{:x}", offset),
        }
    }
}

/// A (location, repeat count) pair: the target fires on the `count`-th time
/// its location is reached while it is the active target
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
pub struct Target {
    pub location: Location,
    pub count: u64,
}

impl Target {
    pub fn absolute(pc: u64, count: u64) -> Self {
        Self {
            location: Location::Absolute(pc),
            count,
        }
    }

    pub fn relative(offset: i64, count: u64) -> Self {
        Self {
            location: Location::Relative(offset),
            count,
        }
    }
}

impl fmt::Display for Target {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}x{}", self.location, self.count)
    }
}

#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "lowercase")]
pub enum RegionKind {
    /// primes caches and predictors, not counted
    Warmup,
    /// the counted interval
    #[default]
    Detail,
}

impl fmt::Display for RegionKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RegionKind::Warmup => write!(f, "warmup"),
            RegionKind::Detail => write!(f, "detail"),
        }
    }
}

/// One simulation interval: targets are consumed in order, the region is
/// complete once the last one fires
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Region {
    pub id: String,
    pub kind: RegionKind,
    pub targets: Vec<Target>,
    /// statistical importance for later extrapolation, carried only
    pub weight: Option<f64>,
}

impl Region {
    pub fn describe(&self, target_index: usize) -> String {
        match self.targets.get(target_index) {
            Some(target) => format!(
                "{} region {} target {} ({})",
                self.kind, self.id, target_index, target
            ),
            None => format!("{} region {}", self.kind, self.id),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_resolve() {
        assert_eq!(Location::Absolute(0x1000).resolve(None), Some(0x1000));
        assert_eq!(Location::Relative(0x10).resolve(None), None);
        assert_eq!(Location::Relative(0x10).resolve(Some(0x1000)), Some(0x1010));
        assert_eq!(Location::Relative(-0x10).resolve(Some(0x1000)), Some(0xff0));
        assert_eq!(Location::Relative(-1).resolve(Some(0)), None);
    }

    #[test]
    fn test_display() {
        assert_eq!(Target::absolute(0x6ffed1, 1).to_string(), "0x6ffed1x1");
        assert_eq!(Location::Relative(-32).to_string(), "-0x20");
        assert_eq!(Location::Relative(32).to_string(), "+0x20");
    }
}
