//! Constants defining standard object indices and special values
//!
//!

/// Object indices for standard objects
pub mod object_ids {
    /// The device type object index
    pub const DEVICE_TYPE: u16 = 0x1000;
    /// The device name object index
    pub const DEVICE_NAME: u16 = 0x1008;
    /// The heartbeat producer time object index
    pub const HEARTBEAT_PRODUCER_TIME: u16 = 0x1017;
    /// The identity object index
    pub const IDENTITY: u16 = 0x1018;
    /// The bootloader program object index. Sub 1 is the program data sink for block download,
    /// sub 2 is the program control command register.
    pub const PROGRAM: u16 = 0x1F50;
}

/// Sub indices of the program object (0x1F50)
pub mod program_subs {
    /// Program data (firmware image, written via block download)
    pub const DATA: u8 = 1;
    /// Program control command register
    pub const CONTROL: u8 = 2;
}

/// Special values used to access standard objects
pub mod values {
    /// Program control command to stop the running application
    pub const PROGRAM_CTRL_STOP: u8 = 0;
    /// Program control command to start the downloaded application
    pub const PROGRAM_CTRL_START: u8 = 1;
    /// Program control command to clear (erase) the program flash area
    pub const PROGRAM_CTRL_CLEAR: u8 = 3;
}
