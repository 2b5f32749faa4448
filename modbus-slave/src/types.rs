use crate::exception::ExceptionCode;

/// Start and count tuple carried by the read and write-multiple requests
///
/// Cannot be constructed with a range that runs past the end of the address space
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct AddressRange {
    /// Starting address of the range
    pub start: u16,
    /// Count of elements in the range
    pub count: u16,
}

impl AddressRange {
    /// Validate a range requested by a master against a per-function quantity limit
    ///
    /// A range extending past address 65535 is `IllegalDataAddress`. A count of zero or one
    /// above `max_count` is `IllegalDataValue`.
    pub fn try_from(start: u16, count: u16, max_count: u16) -> Result<Self, ExceptionCode> {
        if start as usize + count as usize > u16::MAX as usize + 1 {
            return Err(ExceptionCode::IllegalDataAddress);
        }

        if count == 0 || count > max_count {
            return Err(ExceptionCode::IllegalDataValue);
        }

        Ok(Self { start, count })
    }

    /// Converts to std::ops::Range
    pub fn to_std_range(self) -> std::ops::Range<usize> {
        let start = self.start as usize;
        let end = start + (self.count as usize);
        start..end
    }
}

impl std::fmt::Display for AddressRange {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "start: {:#06X} qty: {}", self.start, self.count)
    }
}
