//! Windows process launching, debugging and remote-memory access.
//!
//! Everything Win32 lives here. [`RemoteProcess`] implements
//! [`VirtualMemory`] over a debugged process, and [`DebugSession`] drives the
//! whole pipeline: launch the target with `DEBUG_ONLY_THIS_PROCESS`, rewrite
//! its import directory at the process-creation event (the loader has not
//! read it yet), resolve forwardings at the loader's initial breakpoint, then
//! detach and let the target run free.

use std::{
    ffi::{OsStr, c_void},
    fs::File,
    io::Read,
    os::windows::{ffi::OsStrExt, io::FromRawHandle},
    ptr::null,
    sync::atomic::{AtomicBool, Ordering},
};

use windows_sys::Win32::{
    Foundation::{
        CloseHandle, DBG_EXCEPTION_NOT_HANDLED, ERROR_SEM_TIMEOUT, FALSE, GetLastError, HANDLE,
        INVALID_HANDLE_VALUE, TRUE,
    },
    System::{
        Console::{CTRL_C_EVENT, SetConsoleCtrlHandler},
        Diagnostics::Debug::{
            CREATE_PROCESS_DEBUG_EVENT, ContinueDebugEvent, DEBUG_EVENT, DebugActiveProcessStop,
            DebugSetProcessKillOnExit, EXCEPTION_DEBUG_EVENT, EXIT_PROCESS_DEBUG_EVENT,
            ReadProcessMemory, WaitForDebugEventEx, WriteProcessMemory,
        },
        Memory::{
            MEM_COMMIT, MEM_FREE, MEM_RESERVE, MEMORY_BASIC_INFORMATION, PAGE_READWRITE,
            VirtualAllocEx, VirtualProtectEx, VirtualQueryEx,
        },
        Threading::{CreateProcessW, DEBUG_ONLY_THIS_PROCESS, PROCESS_INFORMATION, STARTUPINFOW},
    },
};

use crate::{
    Result, debug,
    error::Error,
    forwards::resolve_forwarded_imports,
    image::{PeImage, read_module_imports},
    imports::{Forwarding, ImportUpdate, ModuleImport},
    info,
    layout::calculate_import_directory_size,
    memory::{MemoryRegion, RegionState, VirtualMemory, find_and_allocate_near_base},
    merge::prepare_new_module_imports,
    session::{SessionAction, SessionEvent, SessionState, advance},
    warn,
    writer::{patch_data_directories, write_import_directory},
};

/// RAII wrapper for a Windows handle; closes it when the scope ends.
struct HandleGuard(HANDLE);

impl HandleGuard {
    fn new(handle: HANDLE) -> Self {
        Self(handle)
    }
}

impl Drop for HandleGuard {
    fn drop(&mut self) {
        if !self.0.is_null() && self.0 != INVALID_HANDLE_VALUE {
            unsafe { CloseHandle(self.0) };
        }
    }
}

/// [`VirtualMemory`] over a live process.
///
/// The handle is the one carried by the debug events; the debugging session
/// owns it, so this type never closes it.
pub struct RemoteProcess {
    handle: HANDLE,
}

impl RemoteProcess {
    pub fn new(handle: HANDLE) -> Self {
        Self { handle }
    }
}

impl VirtualMemory for RemoteProcess {
    fn query_region(&self, address: u64) -> Result<MemoryRegion> {
        let mut info = MEMORY_BASIC_INFORMATION::default();
        let len = unsafe {
            VirtualQueryEx(
                self.handle,
                address as *const c_void,
                &mut info,
                size_of::<MEMORY_BASIC_INFORMATION>(),
            )
        };
        if len == 0 {
            return Err(Error::Win32("VirtualQueryEx", unsafe { GetLastError() }));
        }

        let state = match info.State {
            MEM_FREE => RegionState::Free,
            MEM_RESERVE => RegionState::Reserved,
            _ => RegionState::Committed,
        };
        Ok(MemoryRegion {
            base: info.BaseAddress as u64,
            size: info.RegionSize as u64,
            state,
        })
    }

    fn allocate(&mut self, address: u64, size: u64) -> Result<u64> {
        let address = unsafe {
            VirtualAllocEx(
                self.handle,
                address as *const c_void,
                size as usize,
                MEM_RESERVE | MEM_COMMIT,
                PAGE_READWRITE,
            )
        };
        if address.is_null() {
            return Err(Error::Win32("VirtualAllocEx", unsafe { GetLastError() }));
        }
        Ok(address as u64)
    }

    fn read(&self, address: u64, buf: &mut [u8]) -> Result<()> {
        let mut read_len = 0usize;
        let success = unsafe {
            ReadProcessMemory(
                self.handle,
                address as *const c_void,
                buf.as_mut_ptr().cast(),
                buf.len(),
                &mut read_len,
            )
        };
        if success == 0 || read_len != buf.len() {
            return Err(Error::Win32("ReadProcessMemory", unsafe { GetLastError() }));
        }
        Ok(())
    }

    fn write(&mut self, address: u64, data: &[u8]) -> Result<()> {
        let mut write_len = 0usize;
        let success = unsafe {
            WriteProcessMemory(
                self.handle,
                address as *const c_void,
                data.as_ptr().cast(),
                data.len(),
                &mut write_len,
            )
        };
        if success == 0 || write_len != data.len() {
            return Err(Error::Win32("WriteProcessMemory", unsafe {
                GetLastError()
            }));
        }
        Ok(())
    }

    fn protect(&mut self, address: u64, size: u64, protection: u32) -> Result<u32> {
        let mut previous = 0u32;
        let success = unsafe {
            VirtualProtectEx(
                self.handle,
                address as *const c_void,
                size as usize,
                protection,
                &mut previous,
            )
        };
        if success == 0 {
            return Err(Error::Win32("VirtualProtectEx", unsafe { GetLastError() }));
        }
        Ok(previous)
    }
}

static CANCEL_REQUESTED: AtomicBool = AtomicBool::new(false);

unsafe extern "system" fn ctrl_handler(ctrl_type: u32) -> i32 {
    if ctrl_type == CTRL_C_EVENT {
        CANCEL_REQUESTED.store(true, Ordering::SeqCst);
        TRUE
    } else {
        FALSE
    }
}

/// Everything remembered about the target between the process-creation event
/// and the initial breakpoint.
struct TargetImage {
    process: RemoteProcess,
    image_base: u64,
    is_64bit: bool,
    original_imports: Vec<ModuleImport>,
    new_imports: Vec<ModuleImport>,
}

/// Launches the target under a debugger and applies the requested import
/// updates and forwardings during its startup.
pub struct DebugSession {
    updates: Vec<ImportUpdate>,
    forwardings: Vec<Forwarding>,
}

impl DebugSession {
    pub fn new(updates: Vec<ImportUpdate>, forwardings: Vec<Forwarding>) -> Self {
        Self {
            updates,
            forwardings,
        }
    }

    /// Runs `command` to completion of the instrumentation: the target is
    /// started, its imports rewritten, forwardings resolved, and the debugger
    /// detached. The target keeps running after this returns.
    ///
    /// Ctrl+C cancels the instrumentation (the debugger detaches) without
    /// killing the target.
    pub fn run(&self, command: &[String]) -> Result<()> {
        let process_id = launch_debugged(command)?;
        info!("process {} started, waiting for debug events", process_id);

        if unsafe { DebugSetProcessKillOnExit(FALSE) } == 0 {
            warn!("DebugSetProcessKillOnExit failed with error code: {}", unsafe {
                GetLastError()
            });
        }
        unsafe { SetConsoleCtrlHandler(Some(ctrl_handler), TRUE) };

        let mut state = SessionState::WaitingForCreate;
        let mut target: Option<TargetImage> = None;

        loop {
            if CANCEL_REQUESTED.load(Ordering::SeqCst) {
                info!("cancellation requested, detaching");
                detach(process_id)?;
                return Ok(());
            }

            let Some(event) = wait_for_debug_event(1000)? else {
                continue;
            };

            let session_event = classify(&event);
            let (next_state, actions) = advance(state, &session_event);
            state = next_state;

            let mut failure: Option<Error> = None;
            let mut detach_requested = false;
            for action in actions {
                if failure.is_some() {
                    break;
                }
                match action {
                    SessionAction::RewriteImports => match self.rewrite_imports(&event) {
                        Ok(rewritten) => target = Some(rewritten),
                        Err(err) => failure = Some(err),
                    },
                    SessionAction::ResolveForwards => {
                        if let Some(target) = &mut target {
                            if let Err(err) = self.resolve_forwards(target) {
                                failure = Some(err);
                            }
                        }
                    }
                    SessionAction::Detach => detach_requested = true,
                }
            }

            // The target stays frozen until its event is continued, even on
            // our failures.
            unsafe {
                ContinueDebugEvent(
                    event.dwProcessId,
                    event.dwThreadId,
                    DBG_EXCEPTION_NOT_HANDLED,
                )
            };

            if let Some(err) = failure {
                let _ = detach(process_id);
                return Err(err);
            }
            if detach_requested {
                if session_event == SessionEvent::ProcessExited {
                    info!("process {} exited before the instrumentation finished", process_id);
                } else {
                    detach(process_id)?;
                    info!("detached, process {} continues on its own", process_id);
                }
                return Ok(());
            }
        }
    }

    /// Reads the target's image, merges the import updates in and writes the
    /// new directory into the suspended process.
    fn rewrite_imports(&self, event: &DEBUG_EVENT) -> Result<TargetImage> {
        let create_info = unsafe { event.u.CreateProcessInfo };
        if create_info.hFile.is_null() || create_info.hFile == INVALID_HANDLE_VALUE {
            return Err(Error::Protocol(
                "process-creation event carried no image file handle".into(),
            ));
        }

        let mut image_bytes = Vec::new();
        {
            // Takes ownership of hFile, which has to be closed here anyway.
            let mut file = unsafe { File::from_raw_handle(create_info.hFile) };
            file.read_to_end(&mut image_bytes)?;
        }

        let image = PeImage::parse(image_bytes)?;
        let image_base = create_info.lpBaseOfImage as u64;
        let is_64bit = image.is_64bit();
        info!(
            "target image loaded at {:#x} ({})",
            image_base,
            if is_64bit { "PE32+" } else { "PE32" }
        );

        let original_imports = read_module_imports(&image)?;
        let mut new_imports =
            prepare_new_module_imports(&original_imports, &self.updates, &self.forwardings)?;

        let mut process = RemoteProcess::new(create_info.hProcess);
        let size = calculate_import_directory_size(&new_imports, is_64bit);
        let block = find_and_allocate_near_base(&mut process, image_base, size.total_size(), is_64bit)?
            .ok_or_else(|| {
                Error::Allocation(
                    "no free region near the image base is large enough for the new import directory"
                        .into(),
                )
            })?;

        let directory = write_import_directory(&mut process, block, image_base, is_64bit, &mut new_imports)?;
        patch_data_directories(&mut process, image_base, &directory)?;
        info!(
            "import directory rewritten at RVA {:#x} ({} modules)",
            directory.rva,
            new_imports.len()
        );

        Ok(TargetImage {
            process,
            image_base,
            is_64bit,
            original_imports,
            new_imports,
        })
    }

    fn resolve_forwards(&self, target: &mut TargetImage) -> Result<()> {
        if self.forwardings.is_empty() {
            return Ok(());
        }
        resolve_forwarded_imports(
            &mut target.process,
            target.image_base,
            target.is_64bit,
            &target.original_imports,
            &target.new_imports,
            &self.forwardings,
        )?;
        info!("{} forwarding(s) resolved", self.forwardings.len());
        Ok(())
    }
}

/// Starts `command` with this process attached as its debugger.
fn launch_debugged(command: &[String]) -> Result<u32> {
    let mut command_line = build_command_line(command);

    let startup_info = STARTUPINFOW {
        cb: size_of::<STARTUPINFOW>() as u32,
        ..Default::default()
    };
    let mut process_info = PROCESS_INFORMATION::default();

    let success = unsafe {
        CreateProcessW(
            null(),
            command_line.as_mut_ptr(),
            null(),
            null(),
            FALSE,
            DEBUG_ONLY_THIS_PROCESS,
            null(),
            null(),
            &startup_info,
            &mut process_info,
        )
    };
    if success == 0 {
        return Err(Error::Win32("CreateProcessW", unsafe { GetLastError() }));
    }

    // The debug events carry their own handles; these copies are not needed.
    let _process_guard = HandleGuard::new(process_info.hProcess);
    let _thread_guard = HandleGuard::new(process_info.hThread);

    Ok(process_info.dwProcessId)
}

/// Joins `command` into a Windows command line, quoting arguments with
/// spaces, and appends the UTF-16 terminator.
fn build_command_line(command: &[String]) -> Vec<u16> {
    let mut line = String::new();
    for (index, argument) in command.iter().enumerate() {
        if index > 0 {
            line.push(' ');
        }
        if argument.is_empty() || argument.contains(' ') {
            line.push('"');
            line.push_str(argument);
            line.push('"');
        } else {
            line.push_str(argument);
        }
    }
    OsStr::new(&line).encode_wide().chain([0]).collect()
}

/// Waits up to `timeout_ms` for the next debug event; `Ok(None)` on timeout.
fn wait_for_debug_event(timeout_ms: u32) -> Result<Option<DEBUG_EVENT>> {
    let mut event = DEBUG_EVENT::default();
    if unsafe { WaitForDebugEventEx(&mut event, timeout_ms) } == 0 {
        let code = unsafe { GetLastError() };
        if code == ERROR_SEM_TIMEOUT {
            return Ok(None);
        }
        return Err(Error::Win32("WaitForDebugEventEx", code));
    }
    Ok(Some(event))
}

fn classify(event: &DEBUG_EVENT) -> SessionEvent {
    match event.dwDebugEventCode {
        CREATE_PROCESS_DEBUG_EVENT => SessionEvent::ProcessCreated,
        EXIT_PROCESS_DEBUG_EVENT => SessionEvent::ProcessExited,
        EXCEPTION_DEBUG_EVENT => SessionEvent::Exception {
            code: unsafe { event.u.Exception }.ExceptionRecord.ExceptionCode as u32,
        },
        other => {
            debug!("debug event {} passed through", other);
            SessionEvent::Other { code: other }
        }
    }
}

fn detach(process_id: u32) -> Result<()> {
    if unsafe { DebugActiveProcessStop(process_id) } == 0 {
        return Err(Error::Win32("DebugActiveProcessStop", unsafe {
            GetLastError()
        }));
    }
    Ok(())
}
