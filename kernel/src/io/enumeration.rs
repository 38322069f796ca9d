//! Device enumeration worker.
//!
//! Newly registered device nodes queue up here; a dedicated kernel thread
//! builds their stacks and asks enumeration-capable devices for their
//! children. A failed stack build parks the node on a retry queue without
//! blocking the rest of the queue.

use alloc::collections::VecDeque;
use alloc::sync::Arc;

use crate::io::dev::{self, DeviceFlags, DeviceNode, DeviceType, NodeStatusFlags};
use crate::io::rp::{self, RpCode};
use crate::ke::task::Task;
use crate::ke::{sched, worker, SpinLock};
use crate::status::Result;

static PENDING: SpinLock<VecDeque<Arc<DeviceNode>>> = SpinLock::new(VecDeque::new());
static RETRY: SpinLock<VecDeque<Arc<DeviceNode>>> = SpinLock::new(VecDeque::new());
static ENUMERATOR: spin::Once<Arc<Task>> = spin::Once::new();

/// Build a node's stack and, for buses and enumeration-capable devices,
/// request its children. Returns whether the stack build succeeded; an
/// enumeration failure only flags the node.
fn build_stack_and_enumerate(node: &Arc<DeviceNode>) -> bool {
    let standalone = node.state.lock().standalone;
    if !standalone && dev::build_device_stack(node).is_err() {
        return false;
    }

    let mdo = match node.mdo() {
        Some(mdo) => mdo,
        None => return true,
    };
    let enumerable = mdo.device_type == DeviceType::Bus
        || mdo.flags().contains(DeviceFlags::ENUMERATION_CAPABLE);
    if enumerable {
        let rp = rp::create_rp();
        rp.state.lock().code = RpCode::Enumerate;
        let status = match dev::send_rp(&mdo, &rp) {
            Ok(()) => {
                rp::wait_for_completion(&rp);
                rp.state.lock().status
            }
            Err(e) => Err(e),
        };
        if status.is_err() {
            node.state.lock().status_flags |= NodeStatusFlags::ENUMERATION_FAILED;
        }
        rp::free_rp(rp);
    }
    true
}

fn enumeration_worker(_context: usize) {
    loop {
        loop {
            let node = PENDING.lock().pop_front();
            match node {
                Some(node) => {
                    if !build_stack_and_enumerate(&node) {
                        RETRY.lock().push_back(node);
                    }
                }
                None => break,
            }
        }
        sched::event_sleep();
    }
}

/// Start the enumeration thread.
pub fn init() -> Result {
    let task = worker::create("Device enumerator", enumeration_worker, 0)?;
    ENUMERATOR.call_once(|| task);
    Ok(())
}

/// Queue a node for stack construction and wake the worker.
pub fn notify_enumerator(node: Arc<DeviceNode>) -> Result {
    PENDING.lock().push_back(node);
    if let Some(task) = ENUMERATOR.get() {
        sched::wake(task);
    }
    Ok(())
}

/// Give previously failed nodes another chance, typically after a new
/// driver database became reachable.
pub fn retry_failed_nodes() {
    loop {
        let node = RETRY.lock().pop_front();
        match node {
            Some(node) => {
                if !build_stack_and_enumerate(&node) {
                    RETRY.lock().push_back(node);
                    break;
                }
            }
            None => break,
        }
    }
}

#[cfg(test)]
pub mod testing {
    use super::*;

    pub fn pending_count() -> usize {
        PENDING.lock().len()
    }

    pub fn retry_count() -> usize {
        RETRY.lock().len()
    }

    pub fn drain_pending_once() {
        loop {
            let node = PENDING.lock().pop_front();
            match node {
                Some(node) => {
                    if !build_stack_and_enumerate(&node) {
                        RETRY.lock().push_back(node);
                    }
                }
                None => break,
            }
        }
    }

    pub fn drain_retry_once() {
        retry_failed_nodes();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ex::driver::{self, Driver, DriverObject};
    use crate::hal;
    use crate::io::dev::{DeviceNodeStatus, DeviceObject};
    use crate::io::fs;
    use crate::io::rp::{Rp, RpPayload};
    use crate::ke::sched::testing as sched_testing;
    use crate::ke::task::{self, PrivilegeLevel};
    use crate::ke::test_support;
    use crate::status::Status;
    use alloc::boxed::Box;
    use alloc::string::ToString;
    use core::sync::atomic::Ordering;
    use nabladb::Writer;

    /// Enumerator-side driver: hands out IDs for child devices.
    struct EnumBus;

    impl Driver for EnumBus {
        fn dispatch(&self, rp: &Arc<Rp>) -> crate::status::Result {
            {
                let mut state = rp.state.lock();
                match state.code {
                    RpCode::GetDeviceId => {
                        state.payload = RpPayload::DeviceId {
                            main: Some("TEST/CHILD".to_string()),
                            compatible: alloc::vec!["TEST/COMPAT".to_string()],
                        };
                        state.status = Ok(());
                    }
                    RpCode::Enumerate => state.status = Ok(()),
                    _ => state.status = Err(Status::RpCodeUnknown),
                }
            }
            rp::finalize_rp(rp)
        }
    }

    /// Function driver matched from the registry; builds the MDO.
    struct ChildFunction;

    impl Driver for ChildFunction {
        fn dispatch(&self, rp: &Arc<Rp>) -> crate::status::Result {
            rp.state.lock().status = Ok(());
            rp::finalize_rp(rp)
        }

        fn add_device(
            &self,
            driver: &Arc<DriverObject>,
            bdo: &Arc<DeviceObject>,
        ) -> crate::status::Result {
            let mdo = dev::create_device(driver, DeviceType::Other, DeviceFlags::empty())?;
            dev::attach_device(&mdo, bdo);
            Ok(())
        }
    }

    fn install_registry_fixture() {
        let fs = fs::install_memory_filesystem();

        let mut catalog = Writer::new();
        catalog
            .push_str("DatabasePath", "/initrd/drivers")
            .push_str("ImagePath", "/initrd/drivers")
            .push_str_array("DriverDatabaseName", ["child.ndb"]);
        fs.insert("/initrd/drivers/catalog.ndb", catalog.finish());

        let mut child = Writer::new();
        child
            .push_str("ImageName", "childfn.drv")
            .push_bool("DeviceDriver", true)
            .push_str_array("DeviceId", ["TEST/OTHER", "TEST/COMPAT"]);
        fs.insert("/initrd/drivers/child.ndb", child.finish());

        driver::register_builtin_image("childfn.drv", || Box::new(ChildFunction));
        driver::register_builtin_image("enum-bus.drv", || Box::new(EnumBus));
        driver::testing::set_database_path("/initrd/drivers/catalog.ndb");
    }

    #[test]
    fn registered_device_gets_a_stack_from_the_registry() {
        let _serial = test_support::lock();
        let cpu = hal::current_cpu();
        sched_testing::clear_cpu(cpu);
        let boot_task =
            task::create_process_raw("enum test", None, PrivilegeLevel::Kernel, |_| {}, 0).unwrap();
        sched_testing::install_current(cpu, &boot_task);

        install_registry_fixture();
        let bus_driver = driver::testing::load_builtin("enum-bus.drv");

        // The enumerator device forms its own standalone node.
        let enumerator =
            dev::create_device(&bus_driver, DeviceType::Other, DeviceFlags::STANDALONE).unwrap();
        dev::register_standalone_device(&enumerator).unwrap();
        testing::drain_pending_once();

        // A child the bus found: registering queues it, draining builds it.
        let bdo = dev::create_device(&bus_driver, DeviceType::Other, DeviceFlags::empty()).unwrap();
        dev::register_device(&bdo, &enumerator).unwrap();
        assert!(testing::pending_count() >= 1);
        testing::drain_pending_once();

        let node = bdo.node().expect("node assigned");
        assert_eq!(node.status.load(Ordering::SeqCst), DeviceNodeStatus::Ready);
        let mdo = node.mdo().expect("stack built");
        assert!(!Arc::ptr_eq(&mdo, &bdo));
        assert!(Arc::ptr_eq(&dev::get_stack_top(&bdo), &mdo));
        // The matched function driver owns the MDO.
        assert_eq!(mdo.driver.image_name, "childfn.drv");

        // The child node hangs off the enumerator's node.
        let parent = node.state.lock().parent.clone().unwrap().upgrade().unwrap();
        assert!(Arc::ptr_eq(&parent, &enumerator.node().unwrap()));

        sched_testing::clear_cpu(cpu);
        task::destroy_tcb(&boot_task);
    }

    #[test]
    fn unmatched_device_lands_on_the_retry_queue() {
        let _serial = test_support::lock();
        let cpu = hal::current_cpu();
        sched_testing::clear_cpu(cpu);
        let boot_task =
            task::create_process_raw("retry test", None, PrivilegeLevel::Kernel, |_| {}, 0)
                .unwrap();
        sched_testing::install_current(cpu, &boot_task);

        install_registry_fixture();
        let bus_driver = driver::testing::load_builtin("enum-bus.drv");

        // A driver database that matches nothing this device reports.
        let fs = fs::install_memory_filesystem();
        let mut catalog = Writer::new();
        catalog
            .push_str("DatabasePath", "/initrd/drivers")
            .push_str("ImagePath", "/initrd/drivers")
            .push_str_array("DriverDatabaseName", ["other.ndb"]);
        fs.insert("/initrd/drivers/catalog.ndb", catalog.finish());
        let mut other = Writer::new();
        other
            .push_str("ImageName", "childfn.drv")
            .push_bool("DeviceDriver", true)
            .push_str_array("DeviceId", ["TEST/UNRELATED"]);
        fs.insert("/initrd/drivers/other.ndb", other.finish());

        let enumerator =
            dev::create_device(&bus_driver, DeviceType::Other, DeviceFlags::STANDALONE).unwrap();
        dev::register_standalone_device(&enumerator).unwrap();
        testing::drain_pending_once();

        let before_retry = testing::retry_count();
        let bdo = dev::create_device(&bus_driver, DeviceType::Other, DeviceFlags::empty()).unwrap();
        dev::register_device(&bdo, &enumerator).unwrap();
        testing::drain_pending_once();

        let node = bdo.node().unwrap();
        assert_eq!(
            node.status.load(Ordering::SeqCst),
            DeviceNodeStatus::InitFailed
        );
        assert_eq!(testing::retry_count(), before_retry + 1);

        sched_testing::clear_cpu(cpu);
        task::destroy_tcb(&boot_task);
    }
}
