use crate::exception::ExceptionCode;

use scursor::ReadCursor;

/// Modbus unit identifier, just a type-safe wrapper around `u8`
#[derive(Clone, Copy, Debug, PartialEq, PartialOrd, Ord, Eq, Hash)]
#[cfg_attr(feature = "serialization", derive(serde::Serialize, serde::Deserialize))]
pub struct UnitId {
    /// underlying raw value
    pub value: u8,
}

/// Start and count tuple carried by read and write-multiple requests
///
/// Can only be obtained in a validated form, see [`AddressRange::try_from`]
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct AddressRange {
    /// Starting address of the range
    pub start: u16,
    /// Count of elements in the range
    pub count: u16,
}

/// Value and its address
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct Indexed<T> {
    /// Address of the value
    pub index: u16,
    /// Associated value
    pub value: T,
}

impl UnitId {
    /// Create a new UnitId
    pub const fn new(value: u8) -> Self {
        Self { value }
    }

    /// The broadcast unit id, which only has meaning on serial lines
    pub const fn broadcast() -> Self {
        Self { value: 0x00 }
    }

    /// Returns true if the address is reserved in RTU mode
    ///
    /// Users should *not* use reserved addresses in RTU mode.
    pub fn is_rtu_reserved(&self) -> bool {
        self.value >= 248
    }
}

/// Create the default UnitId of `1`, a valid address in both TCP and RTU mode
impl Default for UnitId {
    fn default() -> Self {
        Self { value: 0x01 }
    }
}

impl std::fmt::Display for UnitId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{:#04X}", self.value)
    }
}

impl AddressRange {
    /// Create a new address range, validating that the count is non-zero and that the
    /// last address does not overflow a u16
    pub fn try_from(start: u16, count: u16) -> Result<Self, ExceptionCode> {
        if count == 0 {
            return Err(ExceptionCode::IllegalDataValue);
        }

        let max_start = u16::MAX - (count - 1);

        if start > max_start {
            return Err(ExceptionCode::IllegalDataAddress);
        }

        Ok(Self { start, count })
    }

    /// Converts to std::ops::Range
    pub fn to_std_range(self) -> std::ops::Range<usize> {
        let start = self.start as usize;
        let end = start + (self.count as usize);
        start..end
    }

    /// Read a start/count pair, checking the count against `max_count` before the address
    pub(crate) fn parse(cursor: &mut ReadCursor, max_count: u16) -> Result<Self, ExceptionCode> {
        let start = cursor.read_u16_be()?;
        let count = cursor.read_u16_be()?;
        if count > max_count {
            return Err(ExceptionCode::IllegalDataValue);
        }
        Self::try_from(start, count)
    }
}

impl std::fmt::Display for AddressRange {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "start: {:#06X} qty: {}", self.start, self.count)
    }
}

impl<T> Indexed<T> {
    /// Create a new indexed value
    pub fn new(index: u16, value: T) -> Self {
        Indexed { index, value }
    }
}

impl<T> std::fmt::Display for Indexed<T>
where
    T: std::fmt::Display,
{
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "idx: {:#06X} value: {}", self.index, self.value)
    }
}

impl<T> From<(u16, T)> for Indexed<T>
where
    T: Copy,
{
    fn from(tuple: (u16, T)) -> Self {
        let (index, value) = tuple;
        Self::new(index, value)
    }
}

// truncated or malformed request bodies are reported to the client as bad values
impl From<scursor::ReadError> for ExceptionCode {
    fn from(_: scursor::ReadError) -> Self {
        ExceptionCode::IllegalDataValue
    }
}

impl From<scursor::TrailingBytes> for ExceptionCode {
    fn from(_: scursor::TrailingBytes) -> Self {
        ExceptionCode::IllegalDataValue
    }
}

pub(crate) fn coil_from_u16(value: u16) -> Result<bool, ExceptionCode> {
    match value {
        crate::constants::coil::ON => Ok(true),
        crate::constants::coil::OFF => Ok(false),
        _ => Err(ExceptionCode::IllegalDataValue),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_unit_id_is_valid_in_rtu_mode() {
        assert_eq!(UnitId::default(), UnitId::new(1));
        assert!(!UnitId::default().is_rtu_reserved());
    }

    #[test]
    fn address_range_validates_count_of_zero() {
        assert_eq!(
            AddressRange::try_from(1, 0),
            Err(ExceptionCode::IllegalDataValue)
        );
    }

    #[test]
    fn address_range_validates_overflow() {
        assert_eq!(
            AddressRange::try_from(0xFFFF, 2),
            Err(ExceptionCode::IllegalDataAddress)
        );
    }

    #[test]
    fn address_range_allows_last_address() {
        let range = AddressRange::try_from(0xFFFF, 1).unwrap();
        assert_eq!(range.to_std_range(), 0xFFFF..0x10000);
    }

    #[test]
    fn coil_values_must_be_on_or_off() {
        assert_eq!(coil_from_u16(0xFF00), Ok(true));
        assert_eq!(coil_from_u16(0x0000), Ok(false));
        assert_eq!(coil_from_u16(0x0001), Err(ExceptionCode::IllegalDataValue));
    }

    #[test]
    fn parses_range_from_cursor() {
        let mut cursor = ReadCursor::new(&[0x00, 0x05, 0x00, 0x02]);
        assert_eq!(
            AddressRange::parse(&mut cursor, 2),
            Ok(AddressRange { start: 5, count: 2 })
        );
        assert!(cursor.is_empty());
    }

    #[test]
    fn parse_checks_count_before_address() {
        let mut cursor = ReadCursor::new(&[0xFF, 0xFF, 0x00, 0x03]);
        assert_eq!(
            AddressRange::parse(&mut cursor, 2),
            Err(ExceptionCode::IllegalDataValue)
        );
    }
}
