//! Task context: kernel stacks, the context switch and the bootstrap path
//! every task starts in.

use core::alloc::Layout;
use core::arch::{global_asm, naked_asm};
use core::ptr::NonNull;
use core::sync::atomic::{AtomicUsize, Ordering};

use crate::config::{KERNEL_SPACE_BASE, KERNEL_STACK_SIZE, PAGE_SIZE, USER_STACK_DEFAULT_SIZE};
use crate::ex;
use crate::hal::i686::{cpu, gdt, memory};
use crate::ke::sched;
use crate::ke::task::{PrivilegeLevel, Task, TaskEntry, TaskFlags};
use crate::mm::physical::{self, PhysPool};
use crate::mm::{PageFlags, PhysAddr};
use crate::rtl::{self, align_down};
use crate::status::{Result, Status};

const EFLAGS_IF: u32 = 1 << 9;
const EFLAGS_RESERVED: u32 = 1 << 1;

const USER_SPACE_TOP: usize = KERNEL_SPACE_BASE - PAGE_SIZE;

pub struct KernelStack {
    base: NonNull<u8>,
    layout: Layout,
}

unsafe impl Send for KernelStack {}
unsafe impl Sync for KernelStack {}

impl KernelStack {
    fn allocate() -> Result<KernelStack> {
        let layout = Layout::from_size_align(KERNEL_STACK_SIZE, 16).unwrap();
        let base = NonNull::new(unsafe { alloc::alloc::alloc_zeroed(layout) })
            .ok_or(Status::OutOfResources)?;
        Ok(KernelStack { base, layout })
    }

    fn top(&self) -> usize {
        self.base.as_ptr() as usize + self.layout.size()
    }
}

impl Drop for KernelStack {
    fn drop(&mut self) {
        unsafe { alloc::alloc::dealloc(self.base.as_ptr(), self.layout) };
    }
}

/// Per-task architecture state.
pub struct TaskData {
    /// Saved stack pointer while the task is off-CPU.
    esp: AtomicUsize,
    /// Kernel stack top, loaded into the TSS on ring transitions.
    esp0: usize,
    pub address_space: PhysAddr,
    kernel_stack: KernelStack,
}

impl TaskData {
    /// Build the task's kernel stack with a seeded frame: the context
    /// switch epilogue pops it and "returns" into the bootstrap routine
    /// with the entry point and its context as arguments.
    pub fn new(address_space: PhysAddr, entry: TaskEntry, entry_context: usize) -> Result<TaskData> {
        let kernel_stack = KernelStack::allocate()?;
        let top = kernel_stack.top();

        unsafe {
            let slot = |offset: usize| (top - offset) as *mut u32;
            slot(4).write(0); // user stack, filled in by thread spawns
            slot(8).write(entry_context as u32);
            slot(12).write(entry as usize as u32);
            slot(16).write(0); // bootstrap never returns
            slot(20).write(task_bootstrap as usize as u32);
            slot(24).write(0); // ebp
            slot(28).write(0); // ebx
            slot(32).write(0); // esi
            slot(36).write(0); // edi
            slot(40).write(EFLAGS_IF | EFLAGS_RESERVED);
        }

        Ok(TaskData {
            esp: AtomicUsize::new(top - 40),
            esp0: top,
            address_space,
            kernel_stack,
        })
    }

    fn esp_cell(&self) -> *mut usize {
        self.esp.as_ptr()
    }
}

// context_switch(old_esp_cell, new_esp, new_cr3): saves the callee-saved
// file and flags, parks the stack pointer in the old task, switches address
// space and stack, runs the inbound bookkeeping, restores and returns into
// the new task.
global_asm!(
    r#"
.section .text
.global context_switch
context_switch:
    push ebp
    push ebx
    push esi
    push edi
    pushfd
    mov eax, [esp + 24]
    mov ecx, [esp + 28]
    mov edx, [esp + 32]
    test eax, eax
    jz 2f
    mov [eax], esp
2:
    mov ebx, cr3
    cmp ebx, edx
    je 3f
    mov cr3, edx
3:
    mov esp, ecx
    call {finish}
    popfd
    pop edi
    pop esi
    pop ebx
    pop ebp
    ret
"#,
    finish = sym switch_finish
);

unsafe extern "C" {
    fn context_switch(old_esp_cell: *mut usize, new_esp: usize, new_cr3: u32);
}

/// Inbound half of every switch: re-file the task this CPU left behind.
extern "C" fn switch_finish() {
    sched::attach_last_task(cpu::current_cpu());
}

/// Switch this CPU to `new`. Returns when the outgoing task is scheduled
/// again; never returns for the discarded boot context.
pub fn switch_tasks(old: Option<&Task>, new: &Task) {
    gdt::set_kernel_stack(cpu::current_cpu(), new.arch.esp0);
    let old_cell = old
        .map(|task| task.arch.esp_cell())
        .unwrap_or(core::ptr::null_mut());
    unsafe {
        context_switch(
            old_cell,
            new.arch.esp.load(Ordering::SeqCst),
            new.arch.address_space as u32,
        );
    }
}

/// First instruction of every task. Kernel tasks call straight into their
/// entry; user main threads build their user stack, load the image and drop
/// to ring 3, which is a one-way trip.
extern "C" fn task_bootstrap(entry: usize, context: usize, user_stack: usize) -> ! {
    let entry: TaskEntry = unsafe { core::mem::transmute(entry) };

    let task = match sched::current_task() {
        Some(task) => task,
        None => {
            entry(context);
            loop {
                cpu::idle_wait();
            }
        }
    };

    if task.process.privilege == PrivilegeLevel::User {
        match user_bootstrap(&task, entry, context, user_stack) {
            Ok(()) => unreachable!(),
            Err(e) => {
                log::error!("task {} user bootstrap failed: {e}", task.name);
                sched::finish_current();
                loop {
                    cpu::idle_wait();
                }
            }
        }
    }

    entry(context);
    sched::finish_current();
    loop {
        cpu::idle_wait();
    }
}

fn map_user_pages(base: usize, size: usize) -> Result {
    let mut offset = 0;
    while offset < size {
        let (pa, _) = physical::allocate(PAGE_SIZE, PAGE_SIZE, PhysPool::Standard)?;
        memory::map_page(
            base + offset,
            pa,
            PageFlags::WRITABLE | PageFlags::USER,
        )?;
        offset += PAGE_SIZE;
    }
    Ok(())
}

/// Main user threads: reserve a randomized initial stack inside a 16 MiB
/// window under the kernel base, load the program image, lay out
/// argc/argv/envp and enter ring 3.
fn user_bootstrap(task: &Task, _entry: TaskEntry, context: usize, user_stack: usize) -> Result<()> {
    let is_main = task.sched.lock().flags.contains(TaskFlags::MAIN);

    let stack_top;
    let program_entry;
    if is_main {
        // 20 random bits of 16-byte granularity span the 16 MiB window.
        let slide = rtl::RANDOM.next_range(0, 1 << 20) as usize * 16;
        let top = USER_SPACE_TOP - slide;
        let aligned_top = align_down(top, PAGE_SIZE);
        let base = align_down(top - USER_STACK_DEFAULT_SIZE, PAGE_SIZE);
        map_user_pages(base, aligned_top - base)?;

        let path = task.process.path.as_deref().ok_or(Status::BadParameter)?;
        program_entry = ex::load::load_exec_image(path)?;

        // The context of a user main thread is its packed argument block.
        stack_top = build_argument_stack(top, context)?;
    } else {
        // Child threads get their stack and entry from the spawner; both
        // must lie in user space.
        let entry_page = align_down(_entry as usize, PAGE_SIZE);
        if !memory::validate_user_buffer(entry_page, PAGE_SIZE)
            || !memory::validate_user_buffer(align_down(user_stack, 16).saturating_sub(16), 16)
        {
            return Err(Status::BadParameter);
        }
        program_entry = _entry as usize;
        unsafe {
            let slot = (user_stack - 4) as *mut u32;
            slot.write(context as u32);
            stack_top = user_stack - 4;
        }
    }

    unsafe {
        enter_user_mode(stack_top, program_entry);
    }
}

/// Copy the argument block onto the user stack and push argc/argv/envp the
/// way the process entry expects them.
fn build_argument_stack(stack_top: usize, context: usize) -> Result<usize> {
    use crate::ke::task::TaskArguments;

    let mut cursor = align_down(stack_top, 16);
    if context == 0 {
        // No arguments: an empty argv/envp pair.
        unsafe {
            cursor -= 12;
            let slots = cursor as *mut u32;
            slots.write(0); // argc
            slots.add(1).write(0); // argv = NULL
            slots.add(2).write(0); // envp = NULL
        }
        return Ok(cursor);
    }

    let arguments = unsafe { &*(context as *const TaskArguments) };
    let data = &arguments.data;

    // Strings first, then the pointer arrays above them.
    cursor -= data.len();
    let strings_base = cursor;
    unsafe {
        core::ptr::copy_nonoverlapping(data.as_ptr(), strings_base as *mut u8, data.len());
    }

    let vector_count = arguments.argc + arguments.envc + 2;
    cursor = align_down(cursor - vector_count * 4, 4);
    let vectors = cursor as *mut u32;

    let mut offset = 0usize;
    let mut index = 0usize;
    for slot in 0..arguments.argc + arguments.envc {
        // argv entries, NULL, then envp entries, NULL.
        let target = if slot < arguments.argc { slot } else { slot + 1 };
        unsafe { vectors.add(target).write((strings_base + offset) as u32) };
        while index < data.len() && data[index] != 0 {
            index += 1;
            offset += 1;
        }
        index += 1;
        offset += 1;
    }
    unsafe {
        vectors.add(arguments.argc).write(0);
        vectors.add(arguments.argc + 1 + arguments.envc).write(0);
    }

    let envp = cursor + (arguments.argc + 1) * 4;
    unsafe {
        cursor -= 12;
        let slots = cursor as *mut u32;
        slots.write(arguments.argc as u32);
        slots.add(1).write(vectors as u32);
        slots.add(2).write(envp as u32);
    }
    Ok(cursor)
}

/// `iret` into ring 3. The only way back into the kernel is an interrupt.
#[unsafe(naked)]
unsafe extern "C" fn enter_user_mode(stack: usize, entry: usize) -> ! {
    naked_asm!(
        "mov ecx, [esp + 4]",
        "mov edx, [esp + 8]",
        "mov ax, {user_data}",
        "mov ds, ax",
        "mov es, ax",
        "mov fs, ax",
        "mov gs, ax",
        "push {user_data}",
        "push ecx",
        "push {eflags}",
        "push {user_code}",
        "push edx",
        "iretd",
        user_data = const gdt::USER_DATA_SELECTOR as i32,
        user_code = const gdt::USER_CODE_SELECTOR as i32,
        eflags = const (EFLAGS_IF | EFLAGS_RESERVED) as i32,
    )
}
