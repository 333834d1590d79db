pub mod bus;
pub mod console;
pub mod cpu;
pub mod decoder;
pub mod devices;
pub mod emulator;

/// Synchronous trap causes (written to `mcause` with bit 31 clear).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TrapCause {
    InstructionAddressMisaligned = 0,
    IllegalInstruction = 2,
    Breakpoint = 3,
    LoadAddressMisaligned = 4,
    StoreAddressMisaligned = 6,
    ECallFromMMode = 11,
}

/// Interrupt causes (written to `mcause` with bit 31 set).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IntCause {
    MSoftware = 3,
    MTimer = 7,
    MExternal = 11,
}
