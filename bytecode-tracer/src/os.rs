//! Guest thread and address-space tracking
//!
//! The guest kernel announces threads and memory areas through
//! pseudo-syscalls. Combined with the host's privilege-level and
//! page-directory notifications this gives the one predicate every other
//! analysis depends on: is the tracked thread running, in user mode?

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

use crate::error::TracerError;
use crate::syscall::{
    read_u32, read_u64, GuestSyscall, SYSCALL_THREAD_EXIT, SYSCALL_THREAD_START,
    SYSCALL_VM_ALLOC,
};
use crate::Result;

/// Guest thread announcement
///
/// Guest layout (little-endian): `tid: u32`, `stack_top: u64`,
/// `address_space: u64`, followed by the NUL-terminated thread name.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ThreadDescriptor {
    pub tid: u32,
    pub name: String,
    pub stack_top: u64,
    pub address_space: u64,
}

impl ThreadDescriptor {
    const FIXED_SIZE: usize = 20;

    /// Decode a descriptor from the guest payload
    pub fn parse(payload: &[u8]) -> Result<Self> {
        let truncated = || TracerError::truncated("thread descriptor", Self::FIXED_SIZE, payload);
        let tid = read_u32(payload, 0).ok_or_else(truncated)?;
        let stack_top = read_u64(payload, 4).ok_or_else(truncated)?;
        let address_space = read_u64(payload, 12).ok_or_else(truncated)?;
        let name = parse_name(&payload[Self::FIXED_SIZE..])?;
        Ok(Self {
            tid,
            name,
            stack_top,
            address_space,
        })
    }
}

/// Memory area mapped into a guest address space
///
/// Guest layout (little-endian): `tid: u32`, `start: u64`, `end: u64`,
/// `flags: u32` (bit 0 readable, bit 1 writable, bit 2 executable), followed
/// by the NUL-terminated area name.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct VmArea {
    pub tid: u32,
    pub name: String,
    pub start: u64,
    pub end: u64,
    pub readable: bool,
    pub writable: bool,
    pub executable: bool,
}

impl VmArea {
    const FIXED_SIZE: usize = 24;

    /// Decode an area descriptor from the guest payload
    pub fn parse(payload: &[u8]) -> Result<Self> {
        let truncated = || TracerError::truncated("memory area", Self::FIXED_SIZE, payload);
        let tid = read_u32(payload, 0).ok_or_else(truncated)?;
        let start = read_u64(payload, 4).ok_or_else(truncated)?;
        let end = read_u64(payload, 12).ok_or_else(truncated)?;
        let flags = read_u32(payload, 20).ok_or_else(truncated)?;
        let name = parse_name(&payload[Self::FIXED_SIZE..])?;
        Ok(Self {
            tid,
            name,
            start,
            end,
            readable: flags & 0b001 != 0,
            writable: flags & 0b010 != 0,
            executable: flags & 0b100 != 0,
        })
    }

    /// Whether `address` lies inside the area
    pub fn contains(&self, address: u64) -> bool {
        address >= self.start && address < self.end
    }
}

fn parse_name(bytes: &[u8]) -> Result<String> {
    let end = bytes.iter().position(|&b| b == 0).unwrap_or(bytes.len());
    let name = std::str::from_utf8(&bytes[..end]).map_err(|_| TracerError::InvalidThreadName)?;
    Ok(name.to_string())
}

/// OS-level guest commands
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum OsCommand {
    ThreadStart(ThreadDescriptor),
    ThreadExit(u32),
    VmAlloc(VmArea),
}

impl OsCommand {
    /// Decode an OS command, `Ok(None)` when the syscall is not one
    pub fn decode(syscall: &GuestSyscall) -> Result<Option<Self>> {
        let command = match syscall.id {
            SYSCALL_THREAD_START => Self::ThreadStart(ThreadDescriptor::parse(&syscall.payload)?),
            SYSCALL_THREAD_EXIT => Self::ThreadExit(syscall.data as u32),
            SYSCALL_VM_ALLOC => Self::VmAlloc(VmArea::parse(&syscall.payload)?),
            _ => return Ok(None),
        };
        Ok(Some(command))
    }
}

/// A guest thread
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OsThread {
    pub tid: u32,
    pub name: String,
    pub address_space: u64,
    pub stack_top: u64,
    pub kernel_mode: bool,
    pub running: bool,
    pub terminated: bool,
}

impl std::fmt::Display for OsThread {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}[{}]", self.name, self.tid)
    }
}

/// A guest address space, identified by its page-table root
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct AddressSpace {
    pub page_table: u64,
    pub tid: u32,
    pub areas: BTreeMap<u64, VmArea>,
}

impl AddressSpace {
    /// The memory area containing `address`
    pub fn area_at(&self, address: u64) -> Option<&VmArea> {
        self.areas
            .range(..=address)
            .next_back()
            .map(|(_, area)| area)
            .filter(|area| area.contains(address))
    }
}

/// Notifications produced by the OS tracer
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum OsEvent {
    ThreadCreated { tid: u32 },
    ThreadExited { tid: u32 },
    ThreadSwitched { previous: Option<u32>, next: u32 },
    PrivilegeChanged { tid: u32, kernel_mode: bool },
}

/// Tracks guest threads, address spaces and the active thread
#[derive(Debug, Default)]
pub struct OsTracer {
    threads: BTreeMap<u32, OsThread>,
    address_spaces: BTreeMap<u64, AddressSpace>,
    active: Option<u32>,
}

impl OsTracer {
    /// Create a tracer that knows no threads
    pub fn new() -> Self {
        Self::default()
    }

    /// Look up a thread by tid
    pub fn thread(&self, tid: u32) -> Option<&OsThread> {
        self.threads.get(&tid)
    }

    /// The thread currently scheduled by the guest kernel
    pub fn active_thread(&self) -> Option<&OsThread> {
        self.active.and_then(|tid| self.threads.get(&tid))
    }

    /// The address space of a thread
    pub fn address_space(&self, tid: u32) -> Option<&AddressSpace> {
        let thread = self.threads.get(&tid)?;
        self.address_spaces.get(&thread.address_space)
    }

    /// Whether `tid` is running and executing in user mode
    pub fn is_running_in_user_mode(&self, tid: u32) -> bool {
        self.threads
            .get(&tid)
            .map_or(false, |thread| thread.running && !thread.kernel_mode)
    }

    /// Apply a decoded OS command
    pub fn handle_command(&mut self, command: OsCommand) -> Vec<OsEvent> {
        let mut events = Vec::new();
        match command {
            OsCommand::ThreadStart(descriptor) => {
                if let Some(old) = self.remove_thread(descriptor.tid) {
                    tracing::warn!("Existing thread {}. Cleaning old one first.", old);
                    events.push(OsEvent::ThreadExited { tid: old.tid });
                }
                let thread = OsThread {
                    tid: descriptor.tid,
                    name: descriptor.name,
                    address_space: descriptor.address_space,
                    stack_top: descriptor.stack_top,
                    kernel_mode: true,
                    running: false,
                    terminated: false,
                };
                tracing::info!(
                    "Thread start: {} Address space: {:#x}",
                    thread,
                    thread.address_space
                );
                self.address_spaces.insert(
                    thread.address_space,
                    AddressSpace {
                        page_table: thread.address_space,
                        tid: thread.tid,
                        areas: BTreeMap::new(),
                    },
                );
                events.push(OsEvent::ThreadCreated { tid: thread.tid });
                self.threads.insert(thread.tid, thread);
            }
            OsCommand::ThreadExit(tid) => match self.remove_thread(tid) {
                Some(thread) => {
                    tracing::info!("Thread exit: {}", thread);
                    events.push(OsEvent::ThreadExited { tid });
                }
                None => tracing::warn!("Unknown thread exiting ({}). Ignoring.", tid),
            },
            OsCommand::VmAlloc(area) => {
                let Some(space) = self
                    .threads
                    .get(&area.tid)
                    .and_then(|thread| self.address_spaces.get_mut(&thread.address_space))
                else {
                    tracing::warn!("Memory area for unknown thread {}. Ignoring.", area.tid);
                    return events;
                };
                tracing::debug!(
                    "Memory area {} [{:#x}, {:#x}) mapped for thread {}",
                    area.name,
                    area.start,
                    area.end,
                    area.tid
                );
                space.areas.insert(area.start, area);
            }
        }
        events
    }

    /// Decode and apply an OS syscall
    pub fn handle_syscall(&mut self, syscall: &GuestSyscall) -> Result<Vec<OsEvent>> {
        match OsCommand::decode(syscall)? {
            Some(command) => Ok(self.handle_command(command)),
            None => {
                tracing::warn!("Unknown OS syscall {:#x}", syscall.id);
                Ok(Vec::new())
            }
        }
    }

    /// The CPU privilege level changed; level 0 is kernel mode
    pub fn on_privilege_change(&mut self, _previous: u32, current: u32) -> Vec<OsEvent> {
        let Some(thread) = self.active.and_then(|tid| self.threads.get_mut(&tid)) else {
            return Vec::new();
        };
        let kernel_mode = current == 0;
        if thread.kernel_mode == kernel_mode {
            return Vec::new();
        }
        thread.kernel_mode = kernel_mode;
        vec![OsEvent::PrivilegeChanged {
            tid: thread.tid,
            kernel_mode,
        }]
    }

    /// The page-directory root changed, meaning another process was scheduled
    pub fn on_page_directory_change(&mut self, _previous: u64, current: u64) -> Vec<OsEvent> {
        let Some(next) = self.address_spaces.get(&current).map(|space| space.tid) else {
            tracing::warn!("Unknown process scheduled: Address space {:#x}", current);
            return Vec::new();
        };
        if self.active == Some(next) {
            return Vec::new();
        }
        let previous = self.active.take();
        if let Some(thread) = previous.and_then(|tid| self.threads.get_mut(&tid)) {
            thread.running = false;
        }
        if let Some(thread) = self.threads.get_mut(&next) {
            thread.running = true;
            tracing::debug!("Process scheduled: {}", thread);
        }
        self.active = Some(next);
        vec![OsEvent::ThreadSwitched { previous, next }]
    }

    fn remove_thread(&mut self, tid: u32) -> Option<OsThread> {
        let mut thread = self.threads.remove(&tid)?;
        thread.terminated = true;
        thread.running = false;
        self.address_spaces.remove(&thread.address_space);
        if self.active == Some(tid) {
            self.active = None;
        }
        Some(thread)
    }
}

#[cfg(test)]
pub(crate) fn thread_payload(tid: u32, stack_top: u64, address_space: u64, name: &str) -> Vec<u8> {
    let mut payload = Vec::new();
    payload.extend_from_slice(&tid.to_le_bytes());
    payload.extend_from_slice(&stack_top.to_le_bytes());
    payload.extend_from_slice(&address_space.to_le_bytes());
    payload.extend_from_slice(name.as_bytes());
    payload.push(0);
    payload
}
