//! POSIX backend: `mq_*` queues, `shm_open` + `mmap` regions and named
//! semaphores.
//!
//! Handles close their descriptor on drop; names persist until destroyed.
//! Every blocking call takes an absolute `CLOCK_REALTIME` deadline, and an
//! `EINTR` is reported as an expired slice so the caller's wait loop can
//! check for cancellation.

#![allow(unsafe_code)]

use super::{
    validate_name, MessageQueue, NamedMutex, NamedResourceRegistry, QueueCapacity, QueueMessage,
    ResourceKind, SharedRegion,
};
use crate::error::{CaesarError, Result};
use crate::payload::RawPayload;
use std::ffi::CString;
use std::fs::File;
use std::os::fd::{AsRawFd, FromRawFd};
use std::ptr::NonNull;
use std::time::{Duration, SystemTime, UNIX_EPOCH};
use tracing::debug;

const QUEUE_MODE: libc::mode_t = 0o600;
const OBJECT_MODE: libc::mode_t = 0o660;

/// Registry backed by the kernel's POSIX IPC namespace.
#[derive(Debug, Clone, Copy, Default)]
pub struct PosixRegistry;

impl PosixRegistry {
    pub fn new() -> Self {
        Self
    }
}

fn c_name(operation: &'static str, kind: ResourceKind, name: &str) -> Result<CString> {
    validate_name(operation, kind, name)?;
    CString::new(name).map_err(|e| {
        CaesarError::resource(
            operation,
            kind,
            name,
            std::io::Error::new(std::io::ErrorKind::InvalidInput, e),
        )
    })
}

/// Absolute `CLOCK_REALTIME` deadline `wait` from now.
fn deadline_after(wait: Duration) -> libc::timespec {
    let now = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default();
    let at = now + wait;
    libc::timespec {
        tv_sec: at.as_secs() as libc::time_t,
        tv_nsec: at.subsec_nanos() as libc::c_long,
    }
}

/// Whether the last OS error means "the slice ran out".
fn slice_expired() -> bool {
    matches!(
        std::io::Error::last_os_error().raw_os_error(),
        Some(libc::ETIMEDOUT) | Some(libc::EINTR)
    )
}

impl NamedResourceRegistry for PosixRegistry {
    type Queue = PosixQueue;
    type Region = PosixRegion;
    type Mutex = PosixMutex;

    fn create_queue(&self, name: &str, capacity: QueueCapacity) -> Result<PosixQueue> {
        let cname = c_name("mq_open", ResourceKind::Queue, name)?;
        // SAFETY: mq_attr is plain old data; all-zero is a valid value.
        let mut attr: libc::mq_attr = unsafe { std::mem::zeroed() };
        attr.mq_maxmsg = capacity.max_messages as libc::c_long;
        attr.mq_msgsize = capacity.message_size as libc::c_long;

        // SAFETY: cname is a valid NUL-terminated string and attr outlives the
        // call. The variadic arguments are the mode and attribute pointer that
        // mq_open expects with O_CREAT.
        let mqd = unsafe {
            libc::mq_open(
                cname.as_ptr(),
                libc::O_CREAT | libc::O_EXCL | libc::O_RDWR,
                QUEUE_MODE,
                &mut attr as *mut libc::mq_attr,
            )
        };
        if mqd == -1 {
            return Err(CaesarError::last_os("mq_open", ResourceKind::Queue, name));
        }
        debug!("Created message queue {}", name);
        Ok(PosixQueue {
            name: name.to_string(),
            mqd,
            message_size: capacity.message_size,
        })
    }

    fn open_queue(&self, name: &str) -> Result<PosixQueue> {
        let cname = c_name("mq_open", ResourceKind::Queue, name)?;
        // SAFETY: cname is a valid NUL-terminated string; no O_CREAT, so no
        // variadic arguments are read.
        let mqd = unsafe { libc::mq_open(cname.as_ptr(), libc::O_RDWR) };
        if mqd == -1 {
            return Err(CaesarError::last_os("mq_open", ResourceKind::Queue, name));
        }
        let mut queue = PosixQueue {
            name: name.to_string(),
            mqd,
            message_size: 0,
        };

        // SAFETY: zeroed mq_attr is valid; mqd was just opened.
        let mut attr: libc::mq_attr = unsafe { std::mem::zeroed() };
        // SAFETY: mqd is open and attr is a valid out pointer.
        if unsafe { libc::mq_getattr(mqd, &mut attr) } == -1 {
            return Err(CaesarError::last_os("mq_getattr", ResourceKind::Queue, name));
        }
        queue.message_size = attr.mq_msgsize.max(0) as usize;
        Ok(queue)
    }

    fn create_region(&self, name: &str) -> Result<PosixRegion> {
        let cname = c_name("shm_open", ResourceKind::SharedRegion, name)?;
        // SAFETY: cname is a valid NUL-terminated string.
        let fd = unsafe {
            libc::shm_open(
                cname.as_ptr(),
                libc::O_CREAT | libc::O_EXCL | libc::O_RDWR,
                OBJECT_MODE,
            )
        };
        if fd == -1 {
            return Err(CaesarError::last_os("shm_open", ResourceKind::SharedRegion, name));
        }
        // SAFETY: fd was just returned by shm_open and is owned by nobody else.
        let file = unsafe { File::from_raw_fd(fd) };

        let sized = file
            .set_len(RawPayload::SIZE as u64)
            .map_err(|e| CaesarError::resource("ftruncate", ResourceKind::SharedRegion, name, e))
            .and_then(|()| PosixRegion::map(name, &file));
        match sized {
            Ok(region) => {
                debug!("Created shared region {} ({} bytes)", name, RawPayload::SIZE);
                Ok(region)
            }
            Err(e) => {
                // SAFETY: cname is a valid NUL-terminated string.
                unsafe { libc::shm_unlink(cname.as_ptr()) };
                Err(e)
            }
        }
    }

    fn open_region(&self, name: &str) -> Result<PosixRegion> {
        let cname = c_name("shm_open", ResourceKind::SharedRegion, name)?;
        // SAFETY: cname is a valid NUL-terminated string.
        let fd = unsafe { libc::shm_open(cname.as_ptr(), libc::O_RDWR, 0) };
        if fd == -1 {
            return Err(CaesarError::last_os("shm_open", ResourceKind::SharedRegion, name));
        }
        // SAFETY: fd was just returned by shm_open and is owned by nobody else.
        let file = unsafe { File::from_raw_fd(fd) };

        let actual = file
            .metadata()
            .map_err(|e| CaesarError::resource("fstat", ResourceKind::SharedRegion, name, e))?
            .len() as usize;
        if actual < RawPayload::SIZE {
            return Err(CaesarError::RegionTooSmall {
                name: name.to_string(),
                actual,
                expected: RawPayload::SIZE,
            });
        }
        PosixRegion::map(name, &file)
    }

    fn create_mutex(&self, name: &str) -> Result<PosixMutex> {
        let cname = c_name("sem_open", ResourceKind::Mutex, name)?;
        // SAFETY: cname is a valid NUL-terminated string. With O_CREAT,
        // sem_open reads a mode and an unsigned initial value.
        let sem = unsafe {
            libc::sem_open(
                cname.as_ptr(),
                libc::O_CREAT | libc::O_EXCL,
                OBJECT_MODE as libc::c_uint,
                1 as libc::c_uint,
            )
        };
        PosixMutex::from_raw(name, sem)
    }

    fn open_mutex(&self, name: &str) -> Result<PosixMutex> {
        let cname = c_name("sem_open", ResourceKind::Mutex, name)?;
        // SAFETY: cname is a valid NUL-terminated string; no O_CREAT.
        let sem = unsafe { libc::sem_open(cname.as_ptr(), 0) };
        PosixMutex::from_raw(name, sem)
    }

    fn destroy(&self, name: &str, kind: ResourceKind) -> Result<()> {
        let operation = match kind {
            ResourceKind::Queue => "mq_unlink",
            ResourceKind::SharedRegion => "shm_unlink",
            ResourceKind::Mutex => "sem_unlink",
        };
        let cname = c_name(operation, kind, name)?;
        // SAFETY: cname is a valid NUL-terminated string.
        let rc = unsafe {
            match kind {
                ResourceKind::Queue => libc::mq_unlink(cname.as_ptr()),
                ResourceKind::SharedRegion => libc::shm_unlink(cname.as_ptr()),
                ResourceKind::Mutex => libc::sem_unlink(cname.as_ptr()),
            }
        };
        if rc == -1 {
            return Err(CaesarError::last_os(operation, kind, name));
        }
        debug!("Destroyed {} {}", kind, name);
        Ok(())
    }
}

/// An open POSIX message queue descriptor.
#[derive(Debug)]
pub struct PosixQueue {
    name: String,
    mqd: libc::mqd_t,
    message_size: usize,
}

impl MessageQueue for PosixQueue {
    fn send(&self, bytes: &[u8], priority: u32, wait: Duration) -> Result<bool> {
        let deadline = deadline_after(wait);
        // SAFETY: bytes is valid for bytes.len() reads and deadline outlives
        // the call.
        let rc = unsafe {
            libc::mq_timedsend(
                self.mqd,
                bytes.as_ptr() as *const libc::c_char,
                bytes.len(),
                priority as libc::c_uint,
                &deadline,
            )
        };
        if rc == -1 {
            if slice_expired() {
                return Ok(false);
            }
            return Err(CaesarError::last_os("mq_timedsend", ResourceKind::Queue, &self.name));
        }
        Ok(true)
    }

    fn receive(&self, wait: Duration) -> Result<Option<QueueMessage>> {
        // The buffer must be at least mq_msgsize long.
        let mut buf = vec![0u8; self.message_size.max(1)];
        let mut priority: libc::c_uint = 0;
        let deadline = deadline_after(wait);
        // SAFETY: buf is valid for buf.len() writes, priority is a valid out
        // pointer and deadline outlives the call.
        let received = unsafe {
            libc::mq_timedreceive(
                self.mqd,
                buf.as_mut_ptr() as *mut libc::c_char,
                buf.len(),
                &mut priority,
                &deadline,
            )
        };
        if received < 0 {
            if slice_expired() {
                return Ok(None);
            }
            return Err(CaesarError::last_os(
                "mq_timedreceive",
                ResourceKind::Queue,
                &self.name,
            ));
        }
        buf.truncate(received as usize);
        Ok(Some(QueueMessage {
            bytes: buf,
            priority: priority as u32,
        }))
    }
}

impl Drop for PosixQueue {
    fn drop(&mut self) {
        // SAFETY: mqd is open and owned by this handle.
        unsafe { libc::mq_close(self.mqd) };
    }
}

/// A mapping of one [`RawPayload`].
#[derive(Debug)]
pub struct PosixRegion {
    name: String,
    ptr: NonNull<RawPayload>,
}

// SAFETY: the mapping is process-wide and stays valid until munmap in Drop.
// Concurrent access is serialized by the payload mutex.
unsafe impl Send for PosixRegion {}

impl PosixRegion {
    fn map(name: &str, file: &File) -> Result<Self> {
        // SAFETY: fd is open and at least RawPayload::SIZE bytes long; the
        // kernel picks the address.
        let addr = unsafe {
            libc::mmap(
                std::ptr::null_mut(),
                RawPayload::SIZE,
                libc::PROT_READ | libc::PROT_WRITE,
                libc::MAP_SHARED,
                file.as_raw_fd(),
                0,
            )
        };
        if addr == libc::MAP_FAILED {
            return Err(CaesarError::last_os("mmap", ResourceKind::SharedRegion, name));
        }
        let ptr = NonNull::new(addr as *mut RawPayload).ok_or_else(|| {
            CaesarError::resource(
                "mmap",
                ResourceKind::SharedRegion,
                name,
                std::io::Error::other("mmap returned a null mapping"),
            )
        })?;
        Ok(Self {
            name: name.to_string(),
            ptr,
        })
    }

    pub fn name(&self) -> &str {
        &self.name
    }
}

impl SharedRegion for PosixRegion {
    fn load(&self) -> RawPayload {
        // SAFETY: ptr points at a live, page-aligned mapping of at least
        // RawPayload::SIZE bytes; every bit pattern is a valid RawPayload.
        unsafe { std::ptr::read_volatile(self.ptr.as_ptr()) }
    }

    fn store(&self, payload: &RawPayload) {
        // SAFETY: as in load; the mapping is writable.
        unsafe { std::ptr::write_volatile(self.ptr.as_ptr(), *payload) }
    }
}

impl Drop for PosixRegion {
    fn drop(&mut self) {
        // SAFETY: ptr/SIZE describe exactly the mapping made in `map`.
        unsafe { libc::munmap(self.ptr.as_ptr() as *mut libc::c_void, RawPayload::SIZE) };
    }
}

/// An open named semaphore used as a binary mutex.
#[derive(Debug)]
pub struct PosixMutex {
    name: String,
    sem: NonNull<libc::sem_t>,
}

// SAFETY: named semaphores are designed for use across processes and threads.
unsafe impl Send for PosixMutex {}

impl PosixMutex {
    fn from_raw(name: &str, sem: *mut libc::sem_t) -> Result<Self> {
        if sem == libc::SEM_FAILED {
            return Err(CaesarError::last_os("sem_open", ResourceKind::Mutex, name));
        }
        let sem = NonNull::new(sem).ok_or_else(|| {
            CaesarError::resource(
                "sem_open",
                ResourceKind::Mutex,
                name,
                std::io::Error::other("sem_open returned null"),
            )
        })?;
        Ok(Self {
            name: name.to_string(),
            sem,
        })
    }
}

impl NamedMutex for PosixMutex {
    fn acquire(&self, wait: Duration) -> Result<bool> {
        let deadline = deadline_after(wait);
        // SAFETY: sem is open until Drop; deadline outlives the call.
        if unsafe { libc::sem_timedwait(self.sem.as_ptr(), &deadline) } == -1 {
            if slice_expired() {
                return Ok(false);
            }
            return Err(CaesarError::last_os("sem_timedwait", ResourceKind::Mutex, &self.name));
        }
        Ok(true)
    }

    fn release(&self) -> Result<()> {
        // SAFETY: sem is open until Drop.
        if unsafe { libc::sem_post(self.sem.as_ptr()) } == -1 {
            return Err(CaesarError::last_os("sem_post", ResourceKind::Mutex, &self.name));
        }
        Ok(())
    }
}

impl Drop for PosixMutex {
    fn drop(&mut self) {
        // SAFETY: sem is open and owned by this handle.
        unsafe { libc::sem_close(self.sem.as_ptr()) };
    }
}
