//! Device resource descriptors.

use alloc::boxed::Box;
use alloc::vec::Vec;

use crate::it::InterruptParams;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum BusType {
    #[default]
    Unknown,
    Root,
    Acpi,
    Pci,
    Isa,
}

/// Location of a device on its bus.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum BusId {
    #[default]
    None,
    Pci {
        bus: u8,
        device: u8,
        function: u8,
    },
}

/// One interrupt line of a device.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct IrqEntry {
    /// Location of the device this IRQ belongs to.
    pub id: BusId,
    /// Global system interrupt number.
    pub gsi: u32,
    /// Bus-specific interrupt pin.
    pub pin: u32,
    pub params: InterruptParams,
}

/// Interrupt routing tree for bus controllers.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct IrqMap {
    pub bus_type: BusType,
    pub id: BusId,
    pub irqs: Vec<IrqEntry>,
    pub siblings: Vec<IrqMap>,
    pub child: Option<Box<IrqMap>>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DeviceResource {
    Irq(IrqEntry),
    IrqMap(IrqMap),
}
