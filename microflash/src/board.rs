//! micro:bit board identity.
//!
//! The DAPLink USB serial number starts with the board ID. V1 boards report
//! 0x9900 or 0x9901, V2 boards 0x9903 or 0x9904.

use {
    crate::error::{Error, Result},
    std::{fmt, str::FromStr},
};

/// Board IDs reported by V1 boards. The first entry is canonical.
const V1_IDS: [u16; 2] = [0x9900, 0x9901];

/// Board IDs reported by V2 boards. The first entry is canonical.
const V2_IDS: [u16; 2] = [0x9903, 0x9904];

/// Hardware generation of a micro:bit.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub enum BoardVersion {
    /// nRF51-based boards.
    V1,
    /// nRF52833-based boards.
    V2,
}

impl fmt::Display for BoardVersion {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::V1 => f.write_str("V1"),
            Self::V2 => f.write_str("V2"),
        }
    }
}

/// A recognised micro:bit board ID.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct BoardId(u16);

impl BoardId {
    /// Canonical V1 board ID.
    pub const V1: Self = Self(V1_IDS[0]);
    /// Canonical V2 board ID.
    pub const V2: Self = Self(V2_IDS[0]);

    /// Wrap a raw ID, rejecting anything outside the known families.
    pub fn new(id: u16) -> Result<Self> {
        if V1_IDS.contains(&id) || V2_IDS.contains(&id) {
            Ok(Self(id))
        } else {
            Err(Error::UnrecognizedBoard(id))
        }
    }

    /// Parse a hex string such as `9904`.
    pub fn parse(value: &str) -> Result<Self> {
        let digits = value
            .strip_prefix("0x")
            .unwrap_or(value);
        let id = u16::from_str_radix(digits, 16)
            .map_err(|_| Error::InvalidSerialNumber(format!("bad board ID {value:?}")))?;
        Self::new(id)
    }

    /// Raw 16-bit ID.
    pub fn id(self) -> u16 {
        self.0
    }

    /// Returns true for V1 boards.
    pub fn is_v1(self) -> bool {
        V1_IDS.contains(&self.0)
    }

    /// Returns true for V2 boards.
    pub fn is_v2(self) -> bool {
        V2_IDS.contains(&self.0)
    }

    /// Hardware generation.
    pub fn version(self) -> BoardVersion {
        if self.is_v1() {
            BoardVersion::V1
        } else {
            BoardVersion::V2
        }
    }

    /// Map to the canonical ID of the same family.
    #[must_use]
    pub fn normalize(self) -> Self {
        match self.version() {
            BoardVersion::V1 => Self::V1,
            BoardVersion::V2 => Self::V2,
        }
    }
}

impl FromStr for BoardId {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        Self::parse(s)
    }
}

impl fmt::Display for BoardId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:04x}", self.0)
    }
}

/// Fields decoded from a DAPLink USB serial number.
#[derive(Debug, Clone, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct BoardSerialInfo {
    /// Board ID from the first four characters.
    pub id: BoardId,
    /// Family ID from characters four to eight.
    pub family_id: String,
    /// Interface chip ID from the last eight characters.
    pub hic: String,
}

impl BoardSerialInfo {
    /// Length of a well-formed serial number.
    pub const EXPECTED_LENGTH: usize = 48;

    /// Decode a serial number.
    ///
    /// Lengths other than [`Self::EXPECTED_LENGTH`] are tolerated but reported
    /// through `warn`.
    pub fn parse(serial: &str, mut warn: impl FnMut(&str)) -> Result<Self> {
        if serial.is_empty() {
            return Err(Error::InvalidSerialNumber(
                "could not detect ID from connected board".to_string(),
            ));
        }
        if !serial.is_ascii() || serial.len() < 8 {
            return Err(Error::InvalidSerialNumber(serial.to_string()));
        }
        if serial.len() != Self::EXPECTED_LENGTH {
            warn(&format!("USB serial number unexpected length: {}", serial.len()));
        }

        Ok(Self {
            id: BoardId::parse(&serial[..4])?,
            family_id: serial[4..8].to_string(),
            hic: serial[serial.len() - 8..].to_string(),
        })
    }
}

impl fmt::Display for BoardSerialInfo {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "board {} ({}), family {}, hic {}",
            self.id,
            self.id.version(),
            self.family_id,
            self.hic
        )
    }
}
