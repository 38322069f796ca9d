//! Terminal failure handling.
//!
//! A kernel panic halts every CPU and displays the code; it is reserved for
//! invariants that must be unreachable. Recoverable failures travel through
//! [`crate::status::Status`] instead.

/// Panic codes displayed on the emergency shutdown path.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u32)]
pub enum PanicCode {
    KernelModeFault = 0x1,
    BootFailure = 0x2,
    /// No task available to run; the idle tasks make this unreachable.
    NoExecutableTask = 0x3,
    UnacquiredMutexReleased = 0x4,
    BusyMutexAcquired = 0x5,
    UnexpectedFault = 0x6,
    DriverFatalError = 0x7,
    PriorityLevelTooLow = 0x8,
    PriorityLevelTooHigh = 0x9,
    RpFinalizedOutOfLine = 0xA,
    IllegalPriorityLevelChange = 0xB,
    IllegalPriorityLevel = 0xC,
    ObjectLockUnavailable = 0xD,
    MemoryAccessViolation = 0xE,
    IpiDeliveryTimeout = 0xF,
    IpiUnknownType = 0x10,
}

pub fn panic(code: PanicCode) -> ! {
    panic_ex(code, [0; 4])
}

pub fn panic_ex(code: PanicCode, args: [usize; 4]) -> ! {
    log::error!(
        "KERNEL PANIC: {:?} ({:#x}) [{:#x}, {:#x}, {:#x}, {:#x}]",
        code,
        code as u32,
        args[0],
        args[1],
        args[2],
        args[3]
    );

    #[cfg(target_arch = "x86")]
    {
        crate::hal::halt_all_cpus();
    }

    #[cfg(not(target_arch = "x86"))]
    {
        panic!("kernel panic: {code:?} {args:x?}");
    }
}
