//! Device objects, device nodes and device stacks.
//!
//! A device node represents one piece of hardware in the tree. Its
//! bottom-most device object (BDO) is created by the enumerating bus
//! driver; further drivers attach their objects on top, and the stack top
//! after construction is the node's main device object (MDO), the primary
//! dispatch target. The node owns its BDO, which in turn keeps the stack
//! alive through the upward attachment links; everything else navigates
//! through weak references.

use alloc::string::String;
use alloc::sync::{Arc, Weak};
use alloc::vec::Vec;

use atomic_enum::atomic_enum;

use crate::ex::driver::{self, DriverObject};
use crate::io::enumeration;
use crate::io::res::{BusId, BusType, DeviceResource};
use crate::io::rp::{self, Rp, RpCode, RpPayload};
use crate::ke::{sched, SpinLock};
use crate::ob::{KernelObject, Lockable, ObjectHeader, ObjectType};
use crate::status::{Result, Status};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum DeviceType {
    #[default]
    None,
    Other,
    /// System root hardware (ACPI, MP).
    Root,
    Bus,
    Storage,
    Disk,
    Filesystem,
}

bitflags::bitflags! {
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
    pub struct DeviceFlags: u32 {
        /// The device forms a stack of its own, with no parent node.
        const STANDALONE = 1 << 0;
        /// Never destroyed.
        const PERSISTENT = 1 << 1;
        /// Issues `Enumerate` requests even when it is not a bus.
        const ENUMERATION_CAPABLE = 1 << 2;
    }
}

pub struct DeviceObjectState {
    pub flags: DeviceFlags,
    /// Device below this one in the stack.
    pub attached_to: Option<Weak<DeviceObject>>,
    /// Device on top of this one; owning link that keeps the stack alive.
    pub attached_device: Option<Arc<DeviceObject>>,
    pub node: Option<Weak<DeviceNode>>,
    /// Required buffer alignment for I/O.
    pub alignment: usize,
    pub block_size: usize,
}

pub struct DeviceObject {
    header: ObjectHeader,
    pub device_type: DeviceType,
    pub driver: Arc<DriverObject>,
    pub state: SpinLock<DeviceObjectState>,
}

impl KernelObject for DeviceObject {
    fn header(&self) -> &ObjectHeader {
        &self.header
    }
}

impl Lockable for DeviceObject {
    type Guarded = DeviceObjectState;

    fn object_lock(&self) -> &SpinLock<DeviceObjectState> {
        &self.state
    }
}

impl DeviceObject {
    pub fn flags(&self) -> DeviceFlags {
        self.state.lock().flags
    }

    pub fn node(&self) -> Option<Arc<DeviceNode>> {
        self.state.lock().node.clone()?.upgrade()
    }
}

#[atomic_enum]
#[derive(PartialEq, Eq)]
pub enum DeviceNodeStatus {
    Initializing = 0,
    Ready = 1,
    InitFailed = 2,
}

bitflags::bitflags! {
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
    pub struct NodeStatusFlags: u32 {
        const ENUMERATION_FAILED = 1 << 0;
    }
}

pub struct DeviceNodeState {
    pub bdo: Option<Arc<DeviceObject>>,
    pub mdo: Option<Weak<DeviceObject>>,
    pub parent: Option<Weak<DeviceNode>>,
    pub children: Vec<Arc<DeviceNode>>,
    pub standalone: bool,
    pub status_flags: NodeStatusFlags,
}

pub struct DeviceNode {
    header: ObjectHeader,
    pub status: AtomicDeviceNodeStatus,
    pub state: SpinLock<DeviceNodeState>,
}

impl KernelObject for DeviceNode {
    fn header(&self) -> &ObjectHeader {
        &self.header
    }
}

impl Lockable for DeviceNode {
    type Guarded = DeviceNodeState;

    fn object_lock(&self) -> &SpinLock<DeviceNodeState> {
        &self.state
    }
}

impl DeviceNode {
    fn new(standalone: bool) -> Arc<DeviceNode> {
        Arc::new(DeviceNode {
            header: ObjectHeader::new(ObjectType::DeviceNode),
            status: AtomicDeviceNodeStatus::new(DeviceNodeStatus::Initializing),
            state: SpinLock::new(DeviceNodeState {
                bdo: None,
                mdo: None,
                parent: None,
                children: Vec::new(),
                standalone,
                status_flags: NodeStatusFlags::empty(),
            }),
        })
    }

    pub fn bdo(&self) -> Option<Arc<DeviceObject>> {
        self.state.lock().bdo.clone()
    }

    pub fn mdo(&self) -> Option<Arc<DeviceObject>> {
        self.state.lock().mdo.clone()?.upgrade()
    }
}

/// The persistent root of the device tree, set by [`init_device_manager`].
static ROOT_NODE: SpinLock<Option<Arc<DeviceNode>>> = SpinLock::new(None);
/// Standalone nodes have no parent; the registry keeps them alive.
static STANDALONE_NODES: SpinLock<Vec<Arc<DeviceNode>>> = SpinLock::new(Vec::new());

pub fn root_node() -> Option<Arc<DeviceNode>> {
    ROOT_NODE.lock().clone()
}

/// Create a device object owned by `driver`.
pub fn create_device(
    driver: &Arc<DriverObject>,
    device_type: DeviceType,
    flags: DeviceFlags,
) -> Result<Arc<DeviceObject>> {
    let device = Arc::new(DeviceObject {
        header: ObjectHeader::new(ObjectType::Device),
        device_type,
        driver: Arc::clone(driver),
        state: SpinLock::new(DeviceObjectState {
            flags,
            attached_to: None,
            attached_device: None,
            node: None,
            alignment: 1,
            block_size: 1,
        }),
    });
    driver.track_device(&device);
    Ok(device)
}

pub fn destroy_device(device: &Arc<DeviceObject>) -> Result {
    let state = device.state.lock();
    if state.attached_to.is_some()
        || state.attached_device.is_some()
        || state.node.is_some()
        || state.flags.contains(DeviceFlags::PERSISTENT)
    {
        return Err(Status::OperationNotAllowed);
    }
    Ok(())
}

/// Top of the stack containing `device`.
pub fn get_stack_top(device: &Arc<DeviceObject>) -> Arc<DeviceObject> {
    let mut top = Arc::clone(device);
    loop {
        let next = top.state.lock().attached_device.clone();
        match next {
            Some(next) => top = next,
            None => return top,
        }
    }
}

/// Attach `attachee` on top of the stack containing `target`. Returns the
/// previous stack top.
pub fn attach_device(
    attachee: &Arc<DeviceObject>,
    target: &Arc<DeviceObject>,
) -> Arc<DeviceObject> {
    let top = get_stack_top(target);
    let node = top.state.lock().node.clone();
    {
        let mut state = top.state.lock();
        state.attached_device = Some(Arc::clone(attachee));
    }
    {
        let mut state = attachee.state.lock();
        state.attached_to = Some(Arc::downgrade(&top));
        state.node = node;
    }
    top
}

/// Register a bus-driver-created device: give it a node under the
/// enumerator's node and queue it for stack construction.
pub fn register_device(bdo: &Arc<DeviceObject>, enumerator: &Arc<DeviceObject>) -> Result {
    let parent = enumerator
        .node()
        .ok_or(Status::DeviceNotAvailable)?;

    let node = DeviceNode::new(false);
    bdo.state.lock().node = Some(Arc::downgrade(&node));
    {
        let mut state = node.state.lock();
        state.bdo = Some(Arc::clone(bdo));
        state.parent = Some(Arc::downgrade(&parent));
    }
    parent.state.lock().children.push(Arc::clone(&node));

    enumeration::notify_enumerator(node)
}

/// Register a device that forms a one-object stack with no parent.
pub fn register_standalone_device(device: &Arc<DeviceObject>) -> Result {
    if !device.flags().contains(DeviceFlags::STANDALONE) {
        return Err(Status::BadParameter);
    }

    let node = DeviceNode::new(true);
    device.state.lock().node = Some(Arc::downgrade(&node));
    {
        let mut state = node.state.lock();
        state.bdo = Some(Arc::clone(device));
        state.mdo = Some(Arc::downgrade(device));
    }
    STANDALONE_NODES.lock().push(Arc::clone(&node));

    enumeration::notify_enumerator(node)
}

/// Send an RP to a device's driver.
pub fn send_rp(device: &Arc<DeviceObject>, rp: &Arc<Rp>) -> Result {
    {
        let mut state = rp.state.lock();
        state.task = sched::current_task();
        state.device = Some(Arc::clone(device));
    }
    device.driver.dispatch(rp)
}

/// Pass an RP one level down its device stack.
pub fn send_rp_down(rp: &Arc<Rp>) -> Result {
    let device = rp
        .device()
        .ok_or(Status::DeviceNotAvailable)?;
    let below = device
        .state
        .lock()
        .attached_to
        .clone()
        .and_then(|w| w.upgrade())
        .ok_or(Status::DeviceNotAvailable)?;
    send_rp(&below, rp)
}

/// Build the device stack for a registered node: find drivers by the
/// device IDs and let each add its device object.
pub fn build_device_stack(node: &Arc<DeviceNode>) -> Result {
    let bdo = node.bdo().ok_or(Status::DeviceNotAvailable)?;

    let (main_id, compatible) = match get_device_id(&bdo) {
        Ok(ids) => ids,
        Err(e) => {
            node.status
                .store(DeviceNodeStatus::InitFailed, core::sync::atomic::Ordering::SeqCst);
            return Err(e);
        }
    };

    let drivers = match driver::load_drivers_for_device(&main_id, &compatible) {
        Ok(drivers) => drivers,
        Err(e) => {
            node.status
                .store(DeviceNodeStatus::InitFailed, core::sync::atomic::Ordering::SeqCst);
            return Err(e);
        }
    };

    for entry in &drivers {
        let added = entry
            .driver
            .ops()
            .and_then(|ops| ops.add_device(&entry.driver, &bdo));
        if let Err(e) = added {
            node.status
                .store(DeviceNodeStatus::InitFailed, core::sync::atomic::Ordering::SeqCst);
            return Err(e);
        }
        if entry.is_main {
            let top = get_stack_top(&bdo);
            node.state.lock().mdo = Some(Arc::downgrade(&top));
        }
    }

    node.status
        .store(DeviceNodeStatus::Ready, core::sync::atomic::Ordering::SeqCst);
    Ok(())
}

/// Create the device manager: the enumeration worker, the root node and its
/// driver, found by the architecture-reported root device ID.
pub fn init_device_manager(root_device_id: &str) -> Result {
    enumeration::init()?;

    let drivers = driver::load_drivers_for_device(root_device_id, &[])?;
    if drivers.len() != 1 {
        return Err(Status::RootDeviceInitFailure);
    }

    let root_device = create_device(&drivers[0].driver, DeviceType::Root, DeviceFlags::empty())?;
    {
        let mut state = root_device.state.lock();
        state.flags |= DeviceFlags::ENUMERATION_CAPABLE
            | DeviceFlags::PERSISTENT
            | DeviceFlags::STANDALONE;
    }

    let node = DeviceNode::new(true);
    {
        let mut state = node.state.lock();
        state.bdo = Some(Arc::clone(&root_device));
        state.mdo = Some(Arc::downgrade(&root_device));
    }
    root_device.state.lock().node = Some(Arc::downgrade(&node));
    node.status
        .store(DeviceNodeStatus::Ready, core::sync::atomic::Ordering::SeqCst);
    *ROOT_NODE.lock() = Some(Arc::clone(&node));

    enumeration::notify_enumerator(node)
}

// ----------------------------------------------------------- query services

fn send_and_wait(device: &Arc<DeviceObject>, rp: &Arc<Rp>) -> Result {
    send_rp(device, rp)?;
    rp::wait_for_completion(rp);
    rp.state.lock().status
}

/// Ask a device for its main and compatible IDs.
pub fn get_device_id(device: &Arc<DeviceObject>) -> Result<(String, Vec<String>)> {
    let rp = rp::create_rp();
    rp.state.lock().code = RpCode::GetDeviceId;
    let status = send_and_wait(device, &rp);

    let result = match status {
        Ok(()) => {
            let mut state = rp.state.lock();
            match core::mem::take(&mut state.payload) {
                RpPayload::DeviceId {
                    main: Some(main),
                    compatible,
                } => Ok((main, compatible)),
                _ => Err(Status::RpProcessingFailed),
            }
        }
        Err(e) => Err(e),
    };
    rp::free_rp(rp);
    result
}

/// Ask a device for its user-friendly description.
pub fn get_device_text(device: &Arc<DeviceObject>) -> Result<String> {
    let rp = rp::create_rp();
    rp.state.lock().code = RpCode::GetDeviceText;
    let status = send_and_wait(device, &rp);

    let result = match status {
        Ok(()) => {
            let mut state = rp.state.lock();
            match core::mem::take(&mut state.payload) {
                RpPayload::DeviceText(Some(text)) => Ok(text),
                _ => Err(Status::RpProcessingFailed),
            }
        }
        Err(e) => Err(e),
    };
    rp::free_rp(rp);
    result
}

pub fn read_config_space(device: &Arc<DeviceObject>, offset: u64, size: u64) -> Result<Vec<u8>> {
    let rp = rp::create_rp();
    {
        let mut state = rp.state.lock();
        state.code = RpCode::GetConfigSpace;
        state.size = size;
        state.payload = RpPayload::ConfigSpace {
            offset,
            buffer: Vec::new(),
        };
    }
    let status = send_and_wait(device, &rp);

    let result = match status {
        Ok(()) => {
            let mut state = rp.state.lock();
            match core::mem::take(&mut state.payload) {
                RpPayload::ConfigSpace { buffer, .. } => Ok(buffer),
                _ => Err(Status::RpProcessingFailed),
            }
        }
        Err(e) => Err(e),
    };
    rp::free_rp(rp);
    result
}

pub fn write_config_space(device: &Arc<DeviceObject>, offset: u64, data: Vec<u8>) -> Result {
    let rp = rp::create_rp();
    {
        let mut state = rp.state.lock();
        state.code = RpCode::SetConfigSpace;
        state.size = data.len() as u64;
        state.payload = RpPayload::ConfigSpace {
            offset,
            buffer: data,
        };
    }
    let result = send_and_wait(device, &rp);
    rp::free_rp(rp);
    result
}

pub fn get_device_resources(device: &Arc<DeviceObject>) -> Result<Vec<DeviceResource>> {
    let rp = rp::create_rp();
    rp.state.lock().code = RpCode::GetDeviceResources;
    let status = send_and_wait(device, &rp);

    let result = match status {
        Ok(()) => {
            let mut state = rp.state.lock();
            match core::mem::take(&mut state.payload) {
                RpPayload::Resources(resources) => Ok(resources),
                _ => Err(Status::RpProcessingFailed),
            }
        }
        Err(e) => Err(e),
    };
    rp::free_rp(rp);
    result
}

pub fn get_device_location(device: &Arc<DeviceObject>) -> Result<(BusType, BusId)> {
    let rp = rp::create_rp();
    rp.state.lock().code = RpCode::GetDeviceLocation;
    let status = send_and_wait(device, &rp);

    let result = match status {
        Ok(()) => {
            let state = rp.state.lock();
            match &state.payload {
                RpPayload::Location(Some(location)) => Ok(*location),
                _ => Err(Status::RpProcessingFailed),
            }
        }
        Err(e) => Err(e),
    };
    rp::free_rp(rp);
    result
}

pub fn perform_ioctl(device: &Arc<DeviceObject>, code: u32, data: Vec<u8>) -> Result<Vec<u8>> {
    let rp = rp::create_rp();
    {
        let mut state = rp.state.lock();
        state.code = RpCode::Ioctl;
        state.payload = RpPayload::Ioctl { code, data };
    }
    let status = send_and_wait(device, &rp);

    let result = match status {
        Ok(()) => {
            let mut state = rp.state.lock();
            match core::mem::take(&mut state.payload) {
                RpPayload::Ioctl { data, .. } => Ok(data),
                _ => Err(Status::RpProcessingFailed),
            }
        }
        Err(e) => Err(e),
    };
    rp::free_rp(rp);
    result
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ex::driver::{Driver, DriverObject};
    use crate::io::rp::RpCode;
    use alloc::boxed::Box;
    use alloc::string::ToString;

    /// Test bus driver: answers ID queries inline.
    struct EchoBus;

    impl Driver for EchoBus {
        fn dispatch(&self, rp: &Arc<Rp>) -> Result {
            {
                let mut state = rp.state.lock();
                match state.code {
                    RpCode::GetDeviceId => {
                        state.payload = RpPayload::DeviceId {
                            main: Some("PCI/8086/100E".to_string()),
                            compatible: alloc::vec!["PCI/STORAGE/AHCI".to_string()],
                        };
                        state.status = Ok(());
                    }
                    RpCode::GetDeviceText => {
                        state.payload =
                            RpPayload::DeviceText(Some("test ethernet controller".to_string()));
                        state.status = Ok(());
                    }
                    _ => state.status = Err(Status::RpCodeUnknown),
                }
            }
            rp::finalize_rp(rp)
        }
    }

    fn test_driver() -> Arc<DriverObject> {
        driver::register_builtin_image("echo-bus.drv", || Box::new(EchoBus));
        driver::testing::load_builtin("echo-bus.drv")
    }

    #[test]
    fn stacks_attach_upward_and_report_their_top() {
        let driver = test_driver();
        let bottom = create_device(&driver, DeviceType::Bus, DeviceFlags::empty()).unwrap();
        let filter = create_device(&driver, DeviceType::Other, DeviceFlags::empty()).unwrap();
        let top = create_device(&driver, DeviceType::Other, DeviceFlags::empty()).unwrap();

        let previous = attach_device(&filter, &bottom);
        assert!(Arc::ptr_eq(&previous, &bottom));
        // Attaching via any member lands on the current top.
        let previous = attach_device(&top, &bottom);
        assert!(Arc::ptr_eq(&previous, &filter));

        assert!(Arc::ptr_eq(&get_stack_top(&bottom), &top));
        assert!(Arc::ptr_eq(&get_stack_top(&filter), &top));

        // Downward links navigate weakly.
        let below = top.state.lock().attached_to.clone().unwrap();
        assert!(Arc::ptr_eq(&below.upgrade().unwrap(), &filter));
    }

    #[test]
    fn device_queries_surface_driver_payloads() {
        let driver = test_driver();
        let device = create_device(&driver, DeviceType::Bus, DeviceFlags::empty()).unwrap();

        let (main, compatible) = get_device_id(&device).unwrap();
        assert_eq!(main, "PCI/8086/100E");
        assert_eq!(compatible, ["PCI/STORAGE/AHCI"]);

        assert_eq!(
            get_device_text(&device).unwrap(),
            "test ethernet controller"
        );

        // Codes the driver does not handle surface their status.
        assert_eq!(
            get_device_location(&device),
            Err(Status::RpCodeUnknown)
        );
    }

    #[test]
    fn standalone_registration_requires_the_flag() {
        let driver = test_driver();
        let device = create_device(&driver, DeviceType::Other, DeviceFlags::empty()).unwrap();
        assert_eq!(
            register_standalone_device(&device),
            Err(Status::BadParameter)
        );

        let standalone =
            create_device(&driver, DeviceType::Other, DeviceFlags::STANDALONE).unwrap();
        register_standalone_device(&standalone).unwrap();

        let node = standalone.node().expect("node created");
        assert!(node.state.lock().standalone);
        assert!(Arc::ptr_eq(&node.bdo().unwrap(), &standalone));
        assert!(Arc::ptr_eq(&node.mdo().unwrap(), &standalone));
    }

    #[test]
    fn destroy_refuses_attached_devices() {
        let driver = test_driver();
        let a = create_device(&driver, DeviceType::Other, DeviceFlags::empty()).unwrap();
        let b = create_device(&driver, DeviceType::Other, DeviceFlags::empty()).unwrap();
        attach_device(&b, &a);
        assert_eq!(destroy_device(&a), Err(Status::OperationNotAllowed));
        assert_eq!(destroy_device(&b), Err(Status::OperationNotAllowed));

        let lone = create_device(&driver, DeviceType::Other, DeviceFlags::empty()).unwrap();
        assert_eq!(destroy_device(&lone), Ok(()));
    }
}
