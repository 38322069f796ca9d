//! Driver objects, the image loader and the driver registry.
//!
//! Driver images are 32-bit relocatable ELF objects living in a dedicated
//! kernel virtual region managed as a best-fit block list. An image is
//! loaded once; subsequent requests for the same image name get the same
//! driver object. Which image serves a device is decided by the NablaDB
//! driver registry: a catalog of per-driver databases matched against the
//! device's main and compatible IDs.
//!
//! Boot-critical drivers can also be compiled in and registered as builtin
//! images; they take the same lookup path without touching the filesystem.

use alloc::boxed::Box;
use alloc::collections::BTreeMap;
use alloc::format;
use alloc::string::String;
use alloc::sync::{Arc, Weak};
use alloc::vec::Vec;

use elf::abi::{EM_386, ET_REL, SHN_ABS, SHN_UNDEF, SHT_NOBITS, SHT_REL};
use elf::endian::LittleEndian;
use elf::file::Class;
use elf::ElfBytes;

use crate::config::{DRIVER_SPACE_BASE, DRIVER_SPACE_SIZE, INITIAL_CONFIG_DATABASE, MAIN_CONFIG_DATABASE};
use crate::ex::{db, ksym};
use crate::hal;
use crate::io::dev::DeviceObject;
use crate::io::fs;
use crate::io::rp::Rp;
use crate::ke::{Mutex, SpinLock};
use crate::mm::physical::{self, PhysPool};
use crate::mm::{PageFlags, VirtAddr, PAGE_SIZE};
use crate::ob::{KernelObject, Lockable, ObjectHeader, ObjectType};
use crate::rtl::{align_up, file_name};
use crate::status::{Result, Status};

const R_386_32: u32 = 1;
const R_386_PC32: u32 = 2;

/// Behavior of a loaded driver. Optional hooks default to "not supported".
pub trait Driver: Send + Sync {
    fn dispatch(&self, rp: &Arc<Rp>) -> Result;

    fn init(&self, driver: &Arc<DriverObject>) -> Result {
        let _ = driver;
        Ok(())
    }

    fn unload(&self, driver: &Arc<DriverObject>) -> Result {
        let _ = driver;
        Ok(())
    }

    fn add_device(&self, driver: &Arc<DriverObject>, bdo: &Arc<DeviceObject>) -> Result {
        let _ = (driver, bdo);
        Err(Status::NotImplemented)
    }

    fn verify_fs(&self, driver: &Arc<DriverObject>, disk: &Arc<DeviceObject>) -> Result {
        let _ = (driver, disk);
        Err(Status::NotImplemented)
    }

    fn mount(&self, driver: &Arc<DriverObject>, disk: &Arc<DeviceObject>) -> Result {
        let _ = (driver, disk);
        Err(Status::NotImplemented)
    }
}

/// `DriverEntry` of a loaded image: installs the driver's behavior on the
/// object and returns the load verdict.
pub type DriverEntryFn = fn(&Arc<DriverObject>) -> Result;

pub struct DriverObjectState {
    pub devices: Vec<Weak<DeviceObject>>,
    pub initialized: bool,
}

pub struct DriverObject {
    header: ObjectHeader,
    pub id: u32,
    pub image_name: String,
    /// Zero for builtin drivers.
    pub image_base: VirtAddr,
    pub image_size: usize,
    ops: spin::Once<Box<dyn Driver>>,
    pub state: SpinLock<DriverObjectState>,
}

impl KernelObject for DriverObject {
    fn header(&self) -> &ObjectHeader {
        &self.header
    }
}

impl Lockable for DriverObject {
    type Guarded = DriverObjectState;

    fn object_lock(&self) -> &SpinLock<DriverObjectState> {
        &self.state
    }
}

impl DriverObject {
    fn new(id: u32, image_name: &str, image_base: VirtAddr, image_size: usize) -> Arc<DriverObject> {
        Arc::new(DriverObject {
            header: ObjectHeader::new(ObjectType::Driver),
            id,
            image_name: String::from(image_name),
            image_base,
            image_size,
            ops: spin::Once::new(),
            state: SpinLock::new(DriverObjectState {
                devices: Vec::new(),
                initialized: false,
            }),
        })
    }

    /// Called by `DriverEntry` to install the driver's behavior.
    pub fn install(&self, ops: Box<dyn Driver>) {
        self.ops.call_once(|| ops);
    }

    pub fn ops(&self) -> Result<&dyn Driver> {
        self.ops
            .get()
            .map(|ops| ops.as_ref())
            .ok_or(Status::DeviceNotAvailable)
    }

    pub fn dispatch(&self, rp: &Arc<Rp>) -> Result {
        self.ops()?.dispatch(rp)
    }

    pub fn track_device(&self, device: &Arc<DeviceObject>) {
        self.state.lock().devices.push(Arc::downgrade(device));
    }
}

/// One driver found for a device; the first entry of a stack is the main
/// driver whose `add_device` creates the MDO.
pub struct DriverListEntry {
    pub driver: Arc<DriverObject>,
    pub is_main: bool,
}

// -------------------------------------------------------- image region blocks

struct DriverBlock {
    address: VirtAddr,
    size: usize,
    free: bool,
}

/// Best-fit block list over the driver image region. Blocks are contiguous
/// from the region base; a free block larger than needed is split when the
/// remainder still holds a page.
pub struct DriverBlocks {
    base: VirtAddr,
    region_size: usize,
    blocks: Vec<DriverBlock>,
}

impl DriverBlocks {
    pub fn new(base: VirtAddr, region_size: usize) -> DriverBlocks {
        DriverBlocks {
            base,
            region_size,
            blocks: Vec::new(),
        }
    }

    pub fn reserve(&mut self, size: usize) -> Option<VirtAddr> {
        let size = align_up(size, PAGE_SIZE);

        let mut best: Option<usize> = None;
        for (index, block) in self.blocks.iter().enumerate() {
            if block.free && block.size >= size {
                let better = match best {
                    Some(current) => block.size < self.blocks[current].size,
                    None => true,
                };
                if better {
                    best = Some(index);
                }
            }
        }

        if let Some(index) = best {
            let (address, remainder) = {
                let block = &mut self.blocks[index];
                block.free = false;
                let remainder = block.size - size;
                if remainder >= PAGE_SIZE {
                    block.size = size;
                }
                (block.address, remainder)
            };
            if remainder >= PAGE_SIZE {
                self.blocks.insert(
                    index + 1,
                    DriverBlock {
                        address: address + size,
                        size: remainder,
                        free: true,
                    },
                );
            }
            return Some(address);
        }

        // Append after the last block.
        let address = self
            .blocks
            .last()
            .map(|b| b.address + b.size)
            .unwrap_or(self.base);
        if address + size > self.base + self.region_size {
            return None;
        }
        self.blocks.push(DriverBlock {
            address,
            size,
            free: false,
        });
        Some(address)
    }

    pub fn release(&mut self, address: VirtAddr) {
        let Some(index) = self.blocks.iter().position(|b| b.address == address) else {
            return;
        };
        self.blocks[index].free = true;

        // Coalesce with free neighbors.
        if index + 1 < self.blocks.len() && self.blocks[index + 1].free {
            let next = self.blocks.remove(index + 1);
            self.blocks[index].size += next.size;
        }
        if index > 0 && self.blocks[index - 1].free {
            let current = self.blocks.remove(index);
            self.blocks[index - 1].size += current.size;
        }
    }

    pub fn block_count(&self) -> usize {
        self.blocks.len()
    }

    pub fn find_containing(&self, address: VirtAddr) -> Option<(VirtAddr, usize)> {
        self.blocks
            .iter()
            .find(|b| !b.free && address >= b.address && address < b.address + b.size)
            .map(|b| (b.address, b.size))
    }
}

// -------------------------------------------------------------- ELF handling

fn verify_elf_header(file: &ElfBytes<'_, LittleEndian>) -> Result {
    if file.ehdr.class != Class::ELF32 {
        return Err(Status::ElfBadFormat);
    }
    if file.ehdr.e_machine != EM_386 {
        return Err(Status::NotCompatible);
    }
    if file.ehdr.e_type != ET_REL {
        return Err(Status::ElfBadFormat);
    }
    Ok(())
}

/// Total zero-initialized memory the image needs past its file bytes.
pub fn required_bss_size(image: &[u8]) -> Result<usize> {
    let file = ElfBytes::<LittleEndian>::minimal_parse(image).map_err(|_| Status::ElfBadFormat)?;
    verify_elf_header(&file)?;
    let sections = file.section_headers().ok_or(Status::ElfBadFormat)?;
    let mut size = 0usize;
    for shdr in sections.iter() {
        if shdr.sh_type == SHT_NOBITS {
            let align = (shdr.sh_addralign.max(1)) as usize;
            size = align_up(size, align) + shdr.sh_size as usize;
        }
    }
    Ok(size)
}

/// Relocation arithmetic for the two x86 relocation kinds driver images
/// use. `s` is the symbol value, `a` the implicit addend, `p` the place.
pub fn apply_relocation(kind: u32, s: u32, a: u32, p: u32) -> Result<u32> {
    match kind {
        R_386_32 => Ok(s.wrapping_add(a)),
        R_386_PC32 => Ok(s.wrapping_add(a).wrapping_sub(p)),
        _ => Err(Status::ElfBadFormat),
    }
}

struct LinkedImage {
    entry: VirtAddr,
    bss_size: usize,
}

/// Relocate an image in its staging buffer against the final base address.
/// Section addresses follow the file layout; NOBITS sections land after the
/// file bytes.
fn link_driver_image(image: &mut [u8], base: VirtAddr) -> Result<LinkedImage> {
    struct Fixup {
        image_offset: usize,
        place: u32,
        kind: u32,
        symbol: usize,
    }

    let (symbol_values, fixups, entry, bss_size) = {
        let file =
            ElfBytes::<LittleEndian>::minimal_parse(image).map_err(|_| Status::ElfBadFormat)?;
        verify_elf_header(&file)?;
        let sections = file.section_headers().ok_or(Status::ElfBadFormat)?;

        // Assign a load address to every section.
        let bss_base = base + align_up(image.len(), 16);
        let mut bss_cursor = bss_base;
        let mut addresses = Vec::new();
        for shdr in sections.iter() {
            let address = if shdr.sh_type == SHT_NOBITS {
                let align = (shdr.sh_addralign.max(1)) as usize;
                bss_cursor = align_up(bss_cursor, align);
                let address = bss_cursor;
                bss_cursor += shdr.sh_size as usize;
                address
            } else {
                base + shdr.sh_offset as usize
            };
            addresses.push(address);
        }

        let (symbols, strings) = file
            .symbol_table()
            .map_err(|_| Status::ElfBadFormat)?
            .ok_or(Status::ElfBadFormat)?;

        let mut values = Vec::new();
        let mut entry = None;
        for sym in symbols.iter() {
            let value = if sym.st_shndx == SHN_UNDEF {
                if sym.st_name == 0 {
                    0
                } else {
                    let name = strings
                        .get(sym.st_name as usize)
                        .map_err(|_| Status::ElfBadFormat)?;
                    ksym::resolve(name)?
                }
            } else if sym.st_shndx == SHN_ABS {
                sym.st_value as usize
            } else {
                *addresses
                    .get(sym.st_shndx as usize)
                    .ok_or(Status::ElfBadFormat)?
                    + sym.st_value as usize
            };
            if sym.st_name != 0 {
                if let Ok(name) = strings.get(sym.st_name as usize) {
                    if name == "DriverEntry" {
                        entry = Some(value);
                    }
                }
            }
            values.push(value);
        }

        let mut fixups = Vec::new();
        for shdr in sections.iter() {
            if shdr.sh_type != SHT_REL {
                continue;
            }
            let target = sections
                .get(shdr.sh_info as usize)
                .map_err(|_| Status::ElfBadFormat)?;
            if target.sh_type == SHT_NOBITS {
                return Err(Status::ElfBadFormat);
            }
            let rels = file
                .section_data_as_rels(&shdr)
                .map_err(|_| Status::ElfBadFormat)?;
            for rel in rels {
                fixups.push(Fixup {
                    image_offset: target.sh_offset as usize + rel.r_offset as usize,
                    place: (addresses[shdr.sh_info as usize] + rel.r_offset as usize) as u32,
                    kind: rel.r_type,
                    symbol: rel.r_sym as usize,
                });
            }
        }

        (values, fixups, entry, bss_cursor - bss_base)
    };

    for fixup in fixups {
        let s = *symbol_values
            .get(fixup.symbol)
            .ok_or(Status::ElfBadFormat)? as u32;
        let slot = image
            .get_mut(fixup.image_offset..fixup.image_offset + 4)
            .ok_or(Status::ElfBadFormat)?;
        let addend = u32::from_le_bytes([slot[0], slot[1], slot[2], slot[3]]);
        let value = apply_relocation(fixup.kind, s, addend, fixup.place)?;
        slot.copy_from_slice(&value.to_le_bytes());
    }

    Ok(LinkedImage {
        entry: entry.ok_or(Status::UnresolvedSymbol)?,
        bss_size,
    })
}

// ------------------------------------------------------------------- registry

struct RegistryState {
    blocks: DriverBlocks,
    drivers: Vec<Arc<DriverObject>>,
    builtin: BTreeMap<String, fn() -> Box<dyn Driver>>,
    database_path: Option<String>,
    next_id: u32,
}

static REGISTRY: SpinLock<Option<RegistryState>> = SpinLock::new(None);
static REGISTRY_MUTEX: spin::Lazy<Mutex> = spin::Lazy::new(Mutex::new);

fn with_registry<R>(f: impl FnOnce(&mut RegistryState) -> R) -> R {
    let mut registry = REGISTRY.lock();
    let state = registry.get_or_insert_with(|| RegistryState {
        blocks: DriverBlocks::new(DRIVER_SPACE_BASE, DRIVER_SPACE_SIZE),
        drivers: Vec::new(),
        builtin: BTreeMap::new(),
        database_path: None,
        next_id: 1,
    });
    f(state)
}

/// Register a compiled-in driver image. Lookups treat it exactly like a
/// loadable image of the same name.
pub fn register_builtin_image(image_name: &str, factory: fn() -> Box<dyn Driver>) {
    with_registry(|registry| {
        registry.builtin.insert(String::from(image_name), factory);
    });
}

fn find_loaded(name: &str) -> Option<Arc<DriverObject>> {
    with_registry(|registry| {
        registry
            .drivers
            .iter()
            .find(|d| d.image_name == name)
            .cloned()
    })
}

/// Driver whose image covers the given address, for fault attribution.
pub fn find_driver_by_address(address: VirtAddr) -> Option<Arc<DriverObject>> {
    with_registry(|registry| {
        registry
            .drivers
            .iter()
            .find(|d| {
                d.image_size != 0
                    && address >= d.image_base
                    && address < d.image_base + d.image_size
            })
            .cloned()
    })
}

/// Load a driver image, or return the already-loaded object for its name.
/// The caller holds the registry mutex.
fn load_driver_image_locked(path: &str) -> Result<Arc<DriverObject>> {
    let name = file_name(path);

    if let Some(existing) = find_loaded(name) {
        return Ok(existing);
    }

    // Builtin images bypass the filesystem and the image region.
    let builtin = with_registry(|registry| registry.builtin.get(name).copied());
    if let Some(factory) = builtin {
        let id = with_registry(|registry| {
            let id = registry.next_id;
            registry.next_id += 1;
            id
        });
        let driver = DriverObject::new(id, name, 0, 0);
        driver.install(factory());
        with_registry(|registry| registry.drivers.push(Arc::clone(&driver)));
        log::info!("Driver {name} (builtin) registered with ID {id}");
        return Ok(driver);
    }

    if !fs::exists(path) {
        return Err(Status::FileNotFound);
    }
    let mut image = fs::read_file(path)?;
    let bss_size = required_bss_size(&image)?;
    let required = align_up(image.len() + bss_size, PAGE_SIZE);

    let base = with_registry(|registry| registry.blocks.reserve(required))
        .ok_or(Status::OutOfResources)?;

    let mapped = (|| -> Result {
        let (pa, _) = physical::allocate(required, PAGE_SIZE, PhysPool::Standard)?;
        hal::map_range(base, pa, required, PageFlags::WRITABLE)?;
        Ok(())
    })();
    if let Err(e) = mapped {
        with_registry(|registry| registry.blocks.release(base));
        return Err(e);
    }

    let load = (|| -> Result<Arc<DriverObject>> {
        let linked = link_driver_image(&mut image, base)?;
        unsafe {
            hal::write_bytes_at(base, &image);
            hal::fill_zero_at(base + image.len(), required - image.len());
        }

        let id = with_registry(|registry| {
            let id = registry.next_id;
            registry.next_id += 1;
            id
        });
        let driver = DriverObject::new(id, name, base, required);

        let entry: DriverEntryFn = unsafe { core::mem::transmute(linked.entry) };
        entry(&driver)?;

        with_registry(|registry| registry.drivers.push(Arc::clone(&driver)));
        log::info!("Driver {path} loaded at {base:#x} with ID {id}");
        Ok(driver)
    })();

    match load {
        Ok(driver) => Ok(driver),
        Err(e) => {
            log::warn!("Driver {path} loading failed: {e}");
            with_registry(|registry| registry.blocks.release(base));
            let _ = hal::unmap_range(base, required);
            Err(e)
        }
    }
}

/// Exact compare against the main ID first, then the compatible IDs in
/// order.
pub fn device_id_matches(candidate: &str, main_id: &str, compatible: &[String]) -> bool {
    if candidate == main_id {
        return true;
    }
    compatible.iter().any(|id| id == candidate)
}

enum LookupKind<'a> {
    Device {
        main_id: &'a str,
        compatible: &'a [String],
    },
    Filesystem {
        disk: &'a Arc<DeviceObject>,
    },
    ByName {
        name: &'a str,
    },
}

fn join_path(directory: &str, name: &str) -> String {
    if directory.ends_with('/') {
        format!("{directory}{name}")
    } else {
        format!("{directory}/{name}")
    }
}

fn ensure_initialized(driver: &Arc<DriverObject>) -> Result {
    let pending = {
        let mut state = driver.state.lock();
        if state.initialized {
            false
        } else {
            state.initialized = true;
            true
        }
    };
    if pending {
        if let Err(e) = driver.ops()?.init(driver) {
            driver.state.lock().initialized = false;
            return Err(e);
        }
    }
    Ok(())
}

/// Walk the driver registry databases for a match.
fn load_drivers(kind: LookupKind<'_>) -> Result<Vec<DriverListEntry>> {
    if !REGISTRY_MUTEX.acquire(crate::ke::mutex::NO_TIMEOUT) {
        return Err(Status::OperationNotAllowed);
    }
    let result = load_drivers_locked(kind);
    REGISTRY_MUTEX.release();
    result
}

fn load_drivers_locked(kind: LookupKind<'_>) -> Result<Vec<DriverListEntry>> {
    let database_path =
        with_registry(|registry| registry.database_path.clone()).ok_or(Status::FileNotFound)?;

    let mut catalog = db::open(&database_path)?;
    let database_dir = catalog.get_next_string("DatabasePath")?;
    let image_dir = catalog.get_next_string("ImagePath")?;

    'catalog: loop {
        let entry_name = catalog
            .get_next_string("DriverDatabaseName")
            .map_err(|_| Status::DatabaseEntryNotFound)?;

        let mut config = match db::open(&join_path(&database_dir, &entry_name)) {
            Ok(config) => config,
            Err(_) => continue,
        };
        let image_name = match config.get_next_string("ImageName") {
            Ok(name) => name,
            Err(_) => continue,
        };

        match &kind {
            LookupKind::Device {
                main_id,
                compatible,
            } => {
                if config.get_next_bool("DeviceDriver") != Ok(true) {
                    continue;
                }
                config.rewind();
                loop {
                    match config.get_next_string("DeviceId") {
                        Err(_) => continue 'catalog,
                        Ok(id) => {
                            if device_id_matches(&id, main_id, compatible) {
                                break;
                            }
                        }
                    }
                }
            }
            LookupKind::Filesystem { .. } => {
                if config.get_next_bool("FsDriver") != Ok(true) {
                    continue;
                }
            }
            LookupKind::ByName { name } => {
                if entry_name != *name {
                    continue;
                }
            }
        }

        let driver = match load_driver_image_locked(&join_path(&image_dir, &image_name)) {
            Ok(driver) => driver,
            Err(_) => continue,
        };
        if ensure_initialized(&driver).is_err() {
            continue;
        }

        if let LookupKind::Filesystem { disk } = &kind {
            let verified = driver
                .ops()
                .and_then(|ops| ops.verify_fs(&driver, disk))
                .is_ok();
            if !verified {
                continue;
            }
        }

        return Ok(alloc::vec![DriverListEntry {
            driver,
            is_main: true,
        }]);
    }
}

pub fn load_drivers_for_device(
    main_id: &str,
    compatible: &[String],
) -> Result<Vec<DriverListEntry>> {
    load_drivers(LookupKind::Device {
        main_id,
        compatible,
    })
}

pub fn load_drivers_for_filesystem(disk: &Arc<DeviceObject>) -> Result<Vec<DriverListEntry>> {
    load_drivers(LookupKind::Filesystem { disk })
}

pub fn load_drivers_by_name(name: &str) -> Result<Vec<DriverListEntry>> {
    load_drivers(LookupKind::ByName { name })
}

/// Bootstrap the registry path from the initial (ramdisk) configuration
/// database.
pub fn init_driver_manager() -> Result {
    let mut config = db::open(INITIAL_CONFIG_DATABASE)?;
    let path = config.get_next_string("DriverDatabasePath")?;
    if !fs::exists(&path) {
        return Err(Status::FileNotFound);
    }
    with_registry(|registry| registry.database_path = Some(path));
    Ok(())
}

/// Switch to the main-disk configuration database once the system volume is
/// up.
pub fn update_database_path() -> Result {
    let mut config = db::open(MAIN_CONFIG_DATABASE)?;
    let path = config.get_next_string("DriverDatabasePath")?;
    with_registry(|registry| registry.database_path = Some(path));
    Ok(())
}

#[cfg(test)]
pub mod testing {
    use super::*;

    pub fn set_database_path(path: &str) {
        with_registry(|registry| registry.database_path = Some(String::from(path)));
    }

    pub fn loaded_driver_count() -> usize {
        with_registry(|registry| registry.drivers.len())
    }

    /// Load a previously registered builtin image directly, bypassing the
    /// registry databases.
    pub fn load_builtin(image_name: &str) -> Arc<DriverObject> {
        load_driver_image_locked(image_name).expect("builtin image registered")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn device_id_matching_prefers_exact_then_compatible() {
        let compatible = alloc::vec![String::from("PCI/STORAGE/AHCI")];
        assert!(device_id_matches(
            "PCI/8086/100E",
            "PCI/8086/100E",
            &compatible
        ));
        assert!(device_id_matches(
            "PCI/STORAGE/AHCI",
            "PCI/8086/100E",
            &compatible
        ));
        assert!(!device_id_matches(
            "PCI/STORAGE/IDE",
            "PCI/8086/100E",
            &compatible
        ));
    }

    #[test]
    fn best_fit_blocks_split_and_coalesce() {
        let mut blocks = DriverBlocks::new(0xE800_0000, 0x10_0000);
        let a = blocks.reserve(0x3000).unwrap();
        let b = blocks.reserve(0x8000).unwrap();
        let c = blocks.reserve(0x1000).unwrap();
        assert_eq!(a, 0xE800_0000);
        assert_eq!(b, 0xE800_3000);
        assert_eq!(c, 0xE800_B000);

        // Free the middle; a smaller request best-fits into the hole and
        // splits it.
        blocks.release(b);
        let d = blocks.reserve(0x2000).unwrap();
        assert_eq!(d, b);
        // The remainder of the hole serves the next small request.
        let e = blocks.reserve(0x6000).unwrap();
        assert_eq!(e, b + 0x2000);

        // Releasing everything coalesces back to one block per region rule.
        blocks.release(a);
        blocks.release(d);
        blocks.release(e);
        blocks.release(c);
        assert_eq!(blocks.block_count(), 1);
    }

    #[test]
    fn append_fails_beyond_the_region() {
        let mut blocks = DriverBlocks::new(0xE800_0000, 0x4000);
        assert!(blocks.reserve(0x3000).is_some());
        assert!(blocks.reserve(0x2000).is_none());
        assert!(blocks.reserve(0x1000).is_some());
    }

    #[test]
    fn relocation_arithmetic() {
        // Absolute: S + A.
        assert_eq!(apply_relocation(R_386_32, 0x1000, 0x10, 0x2000), Ok(0x1010));
        // PC-relative: S + A - P.
        assert_eq!(
            apply_relocation(R_386_PC32, 0x3000, 0xFFFF_FFFC, 0x2000),
            Ok(0xFFC)
        );
        assert_eq!(
            apply_relocation(99, 0, 0, 0),
            Err(Status::ElfBadFormat)
        );
    }

    #[test]
    fn malformed_elf_images_are_rejected() {
        assert_eq!(required_bss_size(b"not an elf"), Err(Status::ElfBadFormat));

        // A valid 64-bit header must be refused: wrong class for i686.
        let mut image = alloc::vec![0u8; 64];
        image[0..4].copy_from_slice(&[0x7F, b'E', b'L', b'F']);
        image[4] = 2; // ELFCLASS64
        image[5] = 1; // little endian
        image[6] = 1; // EV_CURRENT
        assert!(required_bss_size(&image).is_err());
    }
}
