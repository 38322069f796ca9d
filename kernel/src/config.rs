//! Compile-time kernel configuration.

/// Upper bound on the number of CPUs the kernel will manage.
pub const MAX_CPU_COUNT: usize = 64;

pub const PAGE_SIZE: usize = 4096;

/// Base of the shared kernel half of every address space.
pub const KERNEL_SPACE_BASE: usize = 0xD000_0000;

/// Kernel heap region, claimed by the global allocator on demand.
pub const HEAP_BASE: usize = 0xD800_0000;
pub const HEAP_SIZE: usize = 0x1000_0000;

/// Region holding relocated driver images.
pub const DRIVER_SPACE_BASE: usize = 0xE800_0000;
pub const DRIVER_SPACE_SIZE: usize = 0x1000_0000;

/// Region for transient kernel mappings of arbitrary physical memory.
pub const DYNAMIC_SPACE_BASE: usize = 0xF800_0000;
pub const DYNAMIC_SPACE_SIZE: usize = 0x780_0000;

/// Scheduler time slice.
pub const TIME_SLICE_NS: u64 = 10_000_000;

/// Kernel stack given to every task.
pub const KERNEL_STACK_SIZE: usize = 0x2000;

/// Maximum size of the randomized initial user stack window.
pub const USER_STACK_MAX_SIZE: usize = 0x100_0000;
/// Initially committed part of the user stack.
pub const USER_STACK_DEFAULT_SIZE: usize = 0x8000;

pub const INITRD_MOUNT_POINT: &str = "/initrd";
pub const MAIN_MOUNT_POINT: &str = "/main";
pub const CONFIG_DATABASE_NAME: &str = "config.ndb";

/// Pre-disk configuration database, unpacked from the initial ramdisk.
pub const INITIAL_CONFIG_DATABASE: &str = "/initrd/config.ndb";
/// Main configuration database, available once the system volume is mounted.
pub const MAIN_CONFIG_DATABASE: &str = "/main/system/config.ndb";

pub const KERNEL_NAME: &str = "Nabla";
pub const KERNEL_VERSION: &str = "0.1";
