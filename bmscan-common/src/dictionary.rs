//! The BMS object-dictionary catalog
//!
//! A static table describing every object the engine reads or writes: its wire type, the
//! fixed-point divisor converting the raw value to physical units, and its access mode. The
//! telemetry entries and divisors were verified against hardware; the identity object values for
//! this device family are vendor 0x0000037C, product code 0x0000000A.

/// The wire encoding of an object dictionary entry
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WireType {
    /// Unsigned 8-bit
    U8,
    /// Unsigned 16-bit
    U16,
    /// Unsigned 32-bit
    U32,
    /// Signed 16-bit (two's complement)
    I16,
    /// Signed 32-bit (two's complement)
    I32,
    /// A visible (ASCII) string, transferred segmented
    VisibleString,
}

impl WireType {
    /// The number of bytes this type occupies on the wire
    ///
    /// Strings have no fixed width and report 0.
    pub fn byte_width(&self) -> usize {
        match self {
            WireType::U8 => 1,
            WireType::U16 => 2,
            WireType::U32 => 4,
            WireType::I16 => 2,
            WireType::I32 => 4,
            WireType::VisibleString => 0,
        }
    }

    /// Whether the type is a two's-complement signed integer
    pub fn is_signed(&self) -> bool {
        matches!(self, WireType::I16 | WireType::I32)
    }
}

/// Access mode of an object dictionary entry
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Access {
    /// Read-only
    Ro,
    /// Write-only
    Wo,
    /// Read-write
    Rw,
}

impl Access {
    /// Whether the entry can be read
    pub fn is_readable(&self) -> bool {
        matches!(self, Access::Ro | Access::Rw)
    }

    /// Whether the entry can be written
    pub fn is_writable(&self) -> bool {
        matches!(self, Access::Wo | Access::Rw)
    }
}

/// One entry of the object dictionary catalog
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct DictEntry {
    /// Object index
    pub index: u16,
    /// Object sub-index
    pub sub: u8,
    /// Short machine-readable metric name
    pub name: &'static str,
    /// Wire encoding
    pub wire_type: WireType,
    /// Divisor converting the raw integer to physical units
    pub divisor: f64,
    /// Physical unit of the converted value
    pub unit: &'static str,
    /// Access mode
    pub access: Access,
}

impl DictEntry {
    const fn new(
        index: u16,
        sub: u8,
        name: &'static str,
        wire_type: WireType,
        divisor: f64,
        unit: &'static str,
        access: Access,
    ) -> Self {
        Self {
            index,
            sub,
            name,
            wire_type,
            divisor,
            unit,
            access,
        }
    }
}

/// The full catalog of objects consumed by the engine
///
/// Invariant: (index, sub) is unique across the table.
pub static DICTIONARY: &[DictEntry] = &[
    // Standard device objects
    DictEntry::new(0x1000, 0, "device_type", WireType::U32, 1.0, "", Access::Ro),
    DictEntry::new(
        0x1008,
        0,
        "device_name",
        WireType::VisibleString,
        1.0,
        "",
        Access::Ro,
    ),
    DictEntry::new(
        0x1017,
        0,
        "heartbeat_time",
        WireType::U16,
        1.0,
        "ms",
        Access::Rw,
    ),
    DictEntry::new(0x1018, 1, "vendor_id", WireType::U32, 1.0, "", Access::Ro),
    DictEntry::new(
        0x1018,
        2,
        "product_code",
        WireType::U32,
        1.0,
        "",
        Access::Ro,
    ),
    DictEntry::new(0x1018, 3, "revision", WireType::U32, 1.0, "", Access::Ro),
    DictEntry::new(0x1018, 4, "serial", WireType::U32, 1.0, "", Access::Ro),
    // Battery telemetry
    DictEntry::new(0x6060, 0, "voltage", WireType::I32, 1024.0, "V", Access::Ro),
    DictEntry::new(0x6081, 0, "soc", WireType::U8, 1.0, "%", Access::Ro),
    DictEntry::new(
        0x6010,
        0,
        "temperature",
        WireType::I16,
        8.0,
        "degC",
        Access::Ro,
    ),
    DictEntry::new(
        0x6020,
        0,
        "highest_temp",
        WireType::I16,
        8.0,
        "degC",
        Access::Ro,
    ),
    DictEntry::new(0x6050, 0, "cycles", WireType::U16, 1.0, "", Access::Ro),
    DictEntry::new(
        0x6051,
        0,
        "ah_expended",
        WireType::I16,
        8.0,
        "Ah",
        Access::Ro,
    ),
    DictEntry::new(
        0x6052,
        0,
        "ah_returned",
        WireType::I16,
        8.0,
        "Ah",
        Access::Ro,
    ),
    DictEntry::new(
        0x6053,
        0,
        "ah_since_eq",
        WireType::I32,
        8.0,
        "Ah",
        Access::Ro,
    ),
    DictEntry::new(
        0x2010,
        0,
        "current",
        WireType::I32,
        1000.0,
        "A",
        Access::Ro,
    ),
    // Bootloader program object
    DictEntry::new(
        0x1F50,
        1,
        "program_data",
        WireType::VisibleString,
        1.0,
        "",
        Access::Wo,
    ),
    DictEntry::new(
        0x1F50,
        2,
        "program_control",
        WireType::U8,
        1.0,
        "",
        Access::Wo,
    ),
];

/// The subset of catalog entries polled as telemetry each cycle
pub static TELEMETRY_ENTRIES: &[(u16, u8)] = &[
    (0x6060, 0),
    (0x6081, 0),
    (0x6010, 0),
    (0x6020, 0),
    (0x6050, 0),
    (0x6051, 0),
    (0x6052, 0),
    (0x6053, 0),
    (0x2010, 0),
];

/// Look up a catalog entry by index and sub-index
pub fn find_entry(index: u16, sub: u8) -> Option<&'static DictEntry> {
    DICTIONARY
        .iter()
        .find(|e| e.index == index && e.sub == sub)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_entries_unique() {
        for (i, a) in DICTIONARY.iter().enumerate() {
            for b in &DICTIONARY[i + 1..] {
                assert!(
                    a.index != b.index || a.sub != b.sub,
                    "Duplicate entry {:04X}:{:02X}",
                    a.index,
                    a.sub
                );
            }
        }
    }

    #[test]
    fn test_find_entry() {
        let entry = find_entry(0x6060, 0).unwrap();
        assert_eq!("voltage", entry.name);
        assert_eq!(WireType::I32, entry.wire_type);
        assert_eq!(1024.0, entry.divisor);
        assert!(find_entry(0x6060, 1).is_none());
        assert!(find_entry(0x7000, 0).is_none());
    }

    #[test]
    fn test_telemetry_entries_resolve() {
        for (index, sub) in TELEMETRY_ENTRIES {
            let entry = find_entry(*index, *sub).expect("telemetry entry missing from catalog");
            assert!(entry.access.is_readable());
        }
    }
}
