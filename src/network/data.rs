//! Bulk binary transfers
//!
//! Image data travels either through SysV shared memory segments, handed
//! over with a `SHARED`/`SHARED_RELEASE` ownership handshake, or in-band
//! as `DATA` followed by raw `CHUNK` blocks.

use std::io;
use std::ptr;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use bytes::{Bytes, BytesMut};

use crate::core::{Error, Result, MAX_DATA_SIZE};
use crate::protocol::ImageHeader;

/// Largest raw block sent in one `CHUNK`
pub const CHUNK_SIZE: usize = 32 * 1024;

/// Completed transfer delivered to the host
#[derive(Debug, Clone, PartialEq)]
pub struct BinaryData {
    pub id: u32,
    pub data_type: i16,
    /// One payload per channel, each starting with an `ImageHeader`
    pub channels: Vec<Bytes>,
}

impl BinaryData {
    pub fn header(&self, channel: usize) -> Result<ImageHeader> {
        let payload = self
            .channels
            .get(channel)
            .ok_or_else(|| Error::protocol(format!("No channel {}", channel)))?;
        ImageHeader::decode(&mut payload.as_ref())
    }

    /// Pixel bytes of a channel, after the header
    pub fn pixels(&self, channel: usize) -> Option<&[u8]> {
        self.channels
            .get(channel)
            .and_then(|payload| payload.get(ImageHeader::LEN..))
    }
}

/// Builds a channel payload from its header and pixels
pub fn channel_payload(header: &ImageHeader, pixels: &[u8]) -> Bytes {
    let mut buf = BytesMut::with_capacity(ImageHeader::LEN + pixels.len());
    header.encode(&mut buf);
    buf.extend_from_slice(pixels);
    buf.freeze()
}

/// In-band transfer being received
#[derive(Debug)]
pub(crate) struct IncomingData {
    data_type: i16,
    expected: Vec<usize>,
    received: Vec<BytesMut>,
}

impl IncomingData {
    /// Starts a transfer; the announced total may not exceed `MAX_DATA_SIZE`
    pub(crate) fn new(data_type: i16, sizes: Vec<usize>) -> Result<Self> {
        let total = sizes
            .iter()
            .try_fold(0usize, |acc, &size| acc.checked_add(size))
            .filter(|&total| total <= MAX_DATA_SIZE);
        if total.is_none() {
            return Err(Error::protocol(format!(
                "Transfer of {:?} bytes exceeds {} bytes",
                sizes, MAX_DATA_SIZE
            )));
        }
        let received = sizes
            .iter()
            .map(|&size| BytesMut::with_capacity(size.min(CHUNK_SIZE)))
            .collect();
        Ok(IncomingData {
            data_type,
            expected: sizes,
            received,
        })
    }

    pub(crate) fn append(&mut self, channel: usize, data: &[u8]) -> Result<()> {
        let expected = *self
            .expected
            .get(channel)
            .ok_or_else(|| Error::protocol(format!("Chunk for unknown channel {}", channel)))?;
        let buffer = &mut self.received[channel];
        if buffer.len() + data.len() > expected {
            return Err(Error::protocol(format!(
                "Channel {} overflows its announced {} bytes",
                channel, expected
            )));
        }
        buffer.extend_from_slice(data);
        Ok(())
    }

    pub(crate) fn is_complete(&self) -> bool {
        self.received
            .iter()
            .zip(&self.expected)
            .all(|(buffer, &expected)| buffer.len() == expected)
    }

    pub(crate) fn finish(self, id: u32) -> BinaryData {
        BinaryData {
            id,
            data_type: self.data_type,
            channels: self.received.into_iter().map(BytesMut::freeze).collect(),
        }
    }
}

/// Counts segments allocated through a pool
#[derive(Debug)]
struct SegmentLease(Arc<AtomicUsize>);

impl Drop for SegmentLease {
    fn drop(&mut self) {
        self.0.fetch_sub(1, Ordering::SeqCst);
    }
}

/// Attached SysV shared memory segment
///
/// A segment created by this process is removed when dropped; an attached
/// foreign segment is only detached.
#[derive(Debug)]
pub struct SharedSegment {
    id: i32,
    addr: *mut u8,
    len: usize,
    owner: bool,
    _lease: Option<SegmentLease>,
}

// The mapping is exclusively owned by this value.
unsafe impl Send for SharedSegment {}

impl SharedSegment {
    fn create(len: usize, lease: Option<SegmentLease>) -> Result<Self> {
        if len == 0 {
            return Err(Error::invalid_state("Cannot share an empty segment"));
        }
        let id = unsafe { libc::shmget(libc::IPC_PRIVATE, len, libc::IPC_CREAT | 0o600) };
        if id < 0 {
            return Err(Error::Io(io::Error::last_os_error()));
        }
        let addr = unsafe { libc::shmat(id, ptr::null(), 0) };
        if addr as isize == -1 {
            let err = io::Error::last_os_error();
            unsafe {
                libc::shmctl(id, libc::IPC_RMID, ptr::null_mut());
            }
            return Err(Error::Io(err));
        }
        Ok(SharedSegment {
            id,
            addr: addr as *mut u8,
            len,
            owner: true,
            _lease: lease,
        })
    }

    /// Attaches read-only to a segment announced by a peer
    pub fn attach(id: i32, len: usize) -> Result<Self> {
        let mut info: libc::shmid_ds = unsafe { std::mem::zeroed() };
        if unsafe { libc::shmctl(id, libc::IPC_STAT, &mut info) } < 0 {
            return Err(Error::Io(io::Error::last_os_error()));
        }
        if (info.shm_segsz as usize) < len {
            return Err(Error::protocol(format!(
                "Segment {} holds {} bytes, {} announced",
                id, info.shm_segsz, len
            )));
        }
        let addr = unsafe { libc::shmat(id, ptr::null(), libc::SHM_RDONLY) };
        if addr as isize == -1 {
            return Err(Error::Io(io::Error::last_os_error()));
        }
        Ok(SharedSegment {
            id,
            addr: addr as *mut u8,
            len,
            owner: false,
            _lease: None,
        })
    }

    pub fn id(&self) -> i32 {
        self.id
    }

    pub fn len(&self) -> usize {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    pub fn as_slice(&self) -> &[u8] {
        unsafe { std::slice::from_raw_parts(self.addr, self.len) }
    }

    /// Copies `data` to the start of a segment owned by this process
    pub fn write(&mut self, data: &[u8]) -> Result<()> {
        if !self.owner {
            return Err(Error::invalid_state("Segment is attached read-only"));
        }
        if data.len() > self.len {
            return Err(Error::invalid_state("Data larger than segment"));
        }
        unsafe {
            ptr::copy_nonoverlapping(data.as_ptr(), self.addr, data.len());
        }
        Ok(())
    }
}

impl Drop for SharedSegment {
    fn drop(&mut self) {
        unsafe {
            libc::shmdt(self.addr as *const libc::c_void);
            if self.owner {
                libc::shmctl(self.id, libc::IPC_RMID, ptr::null_mut());
            }
        }
    }
}

/// Bounded allocator of shared segments
#[derive(Debug, Clone)]
pub struct SegmentPool {
    max: usize,
    in_use: Arc<AtomicUsize>,
}

impl SegmentPool {
    pub fn new(max: usize) -> Self {
        SegmentPool {
            max,
            in_use: Arc::new(AtomicUsize::new(0)),
        }
    }

    /// Segments currently allocated and not yet released
    pub fn in_use(&self) -> usize {
        self.in_use.load(Ordering::SeqCst)
    }

    pub fn allocate(&self, len: usize) -> Result<SharedSegment> {
        let reserved = self
            .in_use
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| {
                (n < self.max).then_some(n + 1)
            });
        if reserved.is_err() {
            return Err(Error::invalid_state(format!(
                "All {} shared segments in use",
                self.max
            )));
        }
        SharedSegment::create(len, Some(SegmentLease(Arc::clone(&self.in_use))))
    }

    /// Allocates one segment per payload and fills it
    pub fn share(&self, payloads: &[Bytes]) -> Result<Vec<SharedSegment>> {
        payloads
            .iter()
            .map(|payload| {
                let mut segment = self.allocate(payload.len())?;
                segment.write(payload)?;
                Ok(segment)
            })
            .collect()
    }
}
