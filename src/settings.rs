//! Output settings.
//!
//! Settings are configured with a [`Builder`] and then frozen into [`Flags`]:
//!
//! ```
//! use cranelift_output::settings::{self, Configurable};
//!
//! let mut b = settings::builder();
//! b.set("loop_alignment", "32")?;
//! b.enable("opt_scheduling")?;
//! let flags = settings::Flags::new(b);
//! assert_eq!(flags.loop_alignment(), 32);
//! # Ok::<(), settings::SetError>(())
//! ```

use core::fmt;
use core::str::FromStr;
use thiserror::Error;

/// A string-based configurator for settings groups.
///
/// The `Configurable` protocol allows settings to be modified by name before a finished
/// [`Flags`] value is created.
pub trait Configurable {
    /// Set the string value of any setting by name.
    ///
    /// This can set any type of setting whether it is numeric, boolean, or enumerated.
    fn set(&mut self, name: &str, value: &str) -> SetResult<()>;

    /// Enable a boolean setting.
    fn enable(&mut self, name: &str) -> SetResult<()>;
}

/// An error produced when changing a setting.
#[derive(Error, Debug, PartialEq, Eq)]
pub enum SetError {
    /// No setting by this name exists.
    #[error("No existing setting named '{0}'")]
    BadName(String),

    /// Type mismatch for setting (e.g., setting enum to integer).
    #[error("Trying to set a setting with the wrong type")]
    BadType,

    /// This is not a valid value for this setting.
    #[error("Unexpected value for a setting, expected {0}")]
    BadValue(String),
}

/// A result returned when changing a setting.
pub type SetResult<T> = Result<T, SetError>;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
enum Kind {
    Bool,
    Num { min: u32, pow2: bool },
}

struct Descriptor {
    name: &'static str,
    kind: Kind,
    default: u32,
}

const DESCRIPTORS: [Descriptor; 8] = [
    Descriptor {
        name: "opt_scheduling",
        kind: Kind::Bool,
        default: 1,
    },
    Descriptor {
        name: "enable_verifier",
        kind: Kind::Bool,
        default: 1,
    },
    Descriptor {
        name: "loop_alignment",
        kind: Kind::Num {
            min: 1,
            pow2: true,
        },
        default: 16,
    },
    Descriptor {
        name: "max_loop_pad",
        kind: Kind::Num {
            min: 0,
            pow2: false,
        },
        default: 11,
    },
    Descriptor {
        name: "loop_instrs_to_align",
        kind: Kind::Num {
            min: 0,
            pow2: false,
        },
        default: 4,
    },
    Descriptor {
        name: "max_pinch_points",
        kind: Kind::Num {
            min: 1,
            pow2: false,
        },
        default: 10_000,
    },
    Descriptor {
        name: "max_inst_size",
        kind: Kind::Num {
            min: 1,
            pow2: false,
        },
        default: 256,
    },
    Descriptor {
        name: "max_stub_size",
        kind: Kind::Num {
            min: 0,
            pow2: false,
        },
        default: 128,
    },
];

/// Collect settings values before freezing them into [`Flags`].
#[derive(Clone)]
pub struct Builder {
    values: [u32; DESCRIPTORS.len()],
}

/// Create a new builder with all settings at their defaults.
pub fn builder() -> Builder {
    Builder {
        values: DESCRIPTORS.map(|d| d.default),
    }
}

impl Builder {
    fn lookup(&self, name: &str) -> SetResult<usize> {
        DESCRIPTORS
            .iter()
            .position(|d| d.name == name)
            .ok_or_else(|| SetError::BadName(name.to_string()))
    }
}

fn parse_bool(value: &str) -> SetResult<u32> {
    match value {
        "true" | "on" | "yes" | "1" => Ok(1),
        "false" | "off" | "no" | "0" => Ok(0),
        _ => Err(SetError::BadValue("bool".to_string())),
    }
}

impl Configurable for Builder {
    fn set(&mut self, name: &str, value: &str) -> SetResult<()> {
        let idx = self.lookup(name)?;
        let parsed = match DESCRIPTORS[idx].kind {
            Kind::Bool => parse_bool(value)?,
            Kind::Num { min, pow2 } => {
                let n = u32::from_str(value)
                    .map_err(|_| SetError::BadValue("number".to_string()))?;
                if n < min {
                    return Err(SetError::BadValue(format!("a number >= {min}")));
                }
                if pow2 && !n.is_power_of_two() {
                    return Err(SetError::BadValue("a power of two".to_string()));
                }
                n
            }
        };
        self.values[idx] = parsed;
        Ok(())
    }

    fn enable(&mut self, name: &str) -> SetResult<()> {
        let idx = self.lookup(name)?;
        match DESCRIPTORS[idx].kind {
            Kind::Bool => {
                self.values[idx] = 1;
                Ok(())
            }
            Kind::Num { .. } => Err(SetError::BadType),
        }
    }
}

/// Frozen settings for the output pipeline.
#[derive(Clone, PartialEq, Eq, Hash)]
pub struct Flags {
    values: [u32; DESCRIPTORS.len()],
}

impl Flags {
    /// Create flags from a configured builder.
    pub fn new(builder: Builder) -> Self {
        Self {
            values: builder.values,
        }
    }

    /// Run the list scheduler over every block.
    pub fn opt_scheduling(&self) -> bool {
        self.values[0] != 0
    }

    /// Check every block's schedule against its register accesses.
    pub fn enable_verifier(&self) -> bool {
        self.values[1] != 0
    }

    /// Alignment in bytes of loop headers.
    pub fn loop_alignment(&self) -> u32 {
        self.values[2]
    }

    /// Loop padding up to this many bytes is always emitted.
    ///
    /// Larger pads are skipped when the first instructions of the loop already fit in one
    /// fetch window.
    pub fn max_loop_pad(&self) -> u32 {
        self.values[3]
    }

    /// Number of leading loop instructions that should fit in one fetch window.
    pub fn loop_instrs_to_align(&self) -> u32 {
        self.values[4]
    }

    /// Upper bound on live pinch points in one compile.
    pub fn max_pinch_points(&self) -> u32 {
        self.values[5]
    }

    /// Room that must be left in the code buffer before emitting any instruction.
    pub fn max_inst_size(&self) -> u32 {
        self.values[6]
    }

    /// Extra room reserved for every stub.
    pub fn max_stub_size(&self) -> u32 {
        self.values[7]
    }
}

impl Default for Flags {
    fn default() -> Self {
        Self::new(builder())
    }
}

impl fmt::Display for Flags {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        writeln!(f, "[output]")?;
        for (d, v) in DESCRIPTORS.iter().zip(self.values) {
            match d.kind {
                Kind::Bool => writeln!(f, "{} = {}", d.name, v != 0)?,
                Kind::Num { .. } => writeln!(f, "{} = {v}", d.name)?,
            }
        }
        Ok(())
    }
}

impl fmt::Debug for Flags {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        fmt::Display::fmt(self, f)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn display_default() {
        let f = Flags::default();
        assert_eq!(
            f.to_string(),
            "[output]\n\
             opt_scheduling = true\n\
             enable_verifier = true\n\
             loop_alignment = 16\n\
             max_loop_pad = 11\n\
             loop_instrs_to_align = 4\n\
             max_pinch_points = 10000\n\
             max_inst_size = 256\n\
             max_stub_size = 128\n"
        );
    }

    #[test]
    fn modify_bool() {
        let mut b = builder();
        assert_eq!(b.set("opt_scheduling", "false"), Ok(()));
        assert_eq!(b.set("enable_verifier", "off"), Ok(()));
        let f = Flags::new(b);
        assert!(!f.opt_scheduling());
        assert!(!f.enable_verifier());
    }

    #[test]
    fn modify_num() {
        let mut b = builder();
        assert_eq!(b.set("max_pinch_points", "5"), Ok(()));
        assert_eq!(
            b.set("loop_alignment", "12"),
            Err(SetError::BadValue("a power of two".to_string()))
        );
        assert_eq!(
            b.set("max_pinch_points", "0"),
            Err(SetError::BadValue("a number >= 1".to_string()))
        );
        assert_eq!(
            b.set("max_inst_size", "big"),
            Err(SetError::BadValue("number".to_string()))
        );
        assert_eq!(Flags::new(b).max_pinch_points(), 5);
    }

    #[test]
    fn bad_names_and_types() {
        let mut b = builder();
        assert_eq!(
            b.set("not_there", "true"),
            Err(SetError::BadName("not_there".to_string()))
        );
        assert_eq!(b.enable("loop_alignment"), Err(SetError::BadType));
        assert_eq!(b.enable("opt_scheduling"), Ok(()));
    }
}
