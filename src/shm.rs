//! Shared-memory region manager
//!
//! Owns the broker's named segments. Each segment is an anonymous `memfd`
//! mapped read/write with `memmap2`; clients map the same file after receiving
//! its descriptor. Layout and flag handling live in `glaze_proto::segment`.
//!
//! Segments are sealed against shrinking, so a client holding the descriptor
//! cannot truncate the file under the broker's mapping.

use crate::error::{BrokerError, BrokerResult};
use glaze_proto::segment::{self, SegmentFlag};
use glaze_proto::{ProtocolError, Serial};
use memmap2::{MmapMut, MmapOptions};
use nix::fcntl::{fcntl, FcntlArg, SealFlag};
use nix::sys::memfd::{memfd_create, MFdFlags};
use std::collections::HashMap;
use std::ffi::CString;
use std::fs::File;
use std::io;
use std::os::fd::{AsFd, BorrowedFd};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use thiserror::Error;
use tracing::{debug, info};

/// Texture data segment, sized for a full-surface RGBA image
pub const TEXTURE_SEGMENT: &str = "texture";

/// Request/reply parameters segment
pub const PARAMS_SEGMENT: &str = "params";

#[derive(Debug, Error)]
pub enum SegmentError {
    #[error("no segment named {0}")]
    Unknown(&'static str),

    #[error("failed to create segment {name}: {source}")]
    Create {
        name: &'static str,
        #[source]
        source: io::Error,
    },

    #[error("segment {name} is no longer valid: {reason}")]
    Invalid { name: &'static str, reason: String },
}

// ============================================================================
// Segments
// ============================================================================

struct Segment {
    file: File,
    map: MmapMut,
    capacity: usize,
    references: Arc<AtomicUsize>,
}

impl Segment {
    fn create(name: &'static str, capacity: usize) -> Result<Self, SegmentError> {
        let create_err = |source| SegmentError::Create { name, source };

        let label = CString::new(format!("glaze-{name}"))
            .map_err(|e| create_err(io::Error::new(io::ErrorKind::InvalidInput, e)))?;
        let fd = memfd_create(
            label.as_c_str(),
            MFdFlags::MFD_CLOEXEC | MFdFlags::MFD_ALLOW_SEALING,
        )
        .map_err(|errno| create_err(errno.into()))?;
        let file = File::from(fd);

        let map = Self::map(&file, capacity).map_err(create_err)?;
        fcntl(file.as_fd(), FcntlArg::F_ADD_SEALS(SealFlag::F_SEAL_SHRINK))
            .map_err(|errno| create_err(errno.into()))?;
        Ok(Self {
            file,
            map,
            capacity,
            references: Arc::new(AtomicUsize::new(0)),
        })
    }

    fn map(file: &File, capacity: usize) -> io::Result<MmapMut> {
        let len = segment::mapping_len(capacity);
        file.set_len(len as u64)?;
        // SAFETY: the memfd is sealed against shrinking once created, so the
        // mapped range stays backed.
        unsafe { MmapOptions::new().len(len).map_mut(file) }
    }

    fn grow(&mut self, name: &'static str, capacity: usize) -> Result<(), SegmentError> {
        self.map = Self::map(&self.file, capacity)
            .map_err(|source| SegmentError::Create { name, source })?;
        self.capacity = capacity;
        Ok(())
    }
}

/// A reference on a segment that is given back when dropped
#[derive(Debug)]
pub struct SegmentLease {
    references: Arc<AtomicUsize>,
}

impl SegmentLease {
    /// Reference count including this lease
    pub fn references(&self) -> usize {
        self.references.load(Ordering::Acquire)
    }
}

impl Drop for SegmentLease {
    fn drop(&mut self) {
        self.references.fetch_sub(1, Ordering::AcqRel);
    }
}

// ============================================================================
// Region manager
// ============================================================================

#[derive(Default)]
pub struct RegionManager {
    segments: HashMap<&'static str, Segment>,
}

impl RegionManager {
    pub fn new() -> Self {
        Self::default()
    }

    fn segment(&self, name: &'static str) -> Result<&Segment, SegmentError> {
        self.segments.get(name).ok_or(SegmentError::Unknown(name))
    }

    fn segment_mut(&mut self, name: &'static str) -> Result<&mut Segment, SegmentError> {
        self.segments.get_mut(name).ok_or(SegmentError::Unknown(name))
    }

    /// Create `name` with room for `capacity` payload bytes, or grow it
    pub fn allocate(&mut self, name: &'static str, capacity: usize) -> Result<(), SegmentError> {
        match self.segments.get_mut(name) {
            Some(existing) if existing.capacity >= capacity => Ok(()),
            Some(existing) => {
                info!(
                    "Growing segment {} from {} to {} bytes",
                    name, existing.capacity, capacity
                );
                existing.grow(name, capacity)
            }
            None => {
                let created = Segment::create(name, capacity)?;
                debug!("Allocated segment {} ({} bytes)", name, capacity);
                self.segments.insert(name, created);
                Ok(())
            }
        }
    }

    pub fn capacity(&self, name: &'static str) -> Result<usize, SegmentError> {
        Ok(self.segment(name)?.capacity)
    }

    pub fn flag(&self, name: &'static str) -> Result<SegmentFlag, SegmentError> {
        Ok(segment::flag(&self.segment(name)?.map))
    }

    pub fn set_flag(&mut self, name: &'static str, flag: SegmentFlag) -> Result<(), SegmentError> {
        segment::set_flag(&mut self.segment_mut(name)?.map, flag);
        Ok(())
    }

    /// Copy an encoded message into the segment and publish `flag`
    pub fn write(&mut self, name: &'static str, message: &Serial, flag: SegmentFlag) -> BrokerResult<()> {
        let segment = self.segment_mut(name)?;
        segment::write(&mut segment.map, message.as_bytes(), flag)?;
        Ok(())
    }

    /// Decode the message currently stored in the segment
    pub fn read(&self, name: &'static str) -> BrokerResult<Serial> {
        Ok(segment::read_message(&self.segment(name)?.map)?)
    }

    /// Take the raw payload of a pending request and mark the segment empty
    pub fn read_payload(&mut self, name: &'static str) -> BrokerResult<Vec<u8>> {
        let segment = self.segment_mut(name)?;
        if segment::flag(&segment.map) != SegmentFlag::Request {
            return Err(BrokerError::Protocol(ProtocolError::NoPendingMessage));
        }
        let payload = segment::payload(&segment.map)?.to_vec();
        segment::set_flag(&mut segment.map, SegmentFlag::Empty);
        Ok(payload)
    }

    /// Count one more holder of the segment. Returns the new count.
    pub fn increase_reference(&self, name: &'static str) -> Result<usize, SegmentError> {
        Ok(self.segment(name)?.references.fetch_add(1, Ordering::AcqRel) + 1)
    }

    pub fn reference_count(&self, name: &'static str) -> Result<usize, SegmentError> {
        Ok(self.segment(name)?.references.load(Ordering::Acquire))
    }

    /// Take a reference that is released when the lease drops
    pub fn lease(&self, name: &'static str) -> Result<SegmentLease, SegmentError> {
        let references = self.segment(name)?.references.clone();
        references.fetch_add(1, Ordering::AcqRel);
        Ok(SegmentLease { references })
    }

    /// Descriptor to hand off to a client
    pub fn descriptor_for(&self, name: &'static str) -> Result<BorrowedFd<'_>, SegmentError> {
        Ok(self.segment(name)?.file.as_fd())
    }

    /// Check that the segment's file is still live and large enough
    pub fn validate(&self, name: &'static str) -> Result<(), SegmentError> {
        let segment = self.segment(name)?;
        let expected = segment::mapping_len(segment.capacity) as u64;
        let metadata = segment.file.metadata().map_err(|e| SegmentError::Invalid {
            name,
            reason: format!("fstat failed: {e}"),
        })?;
        if metadata.len() < expected {
            return Err(SegmentError::Invalid {
                name,
                reason: format!("file is {} bytes, expected {}", metadata.len(), expected),
            });
        }
        if segment.map.len() < segment::HEADER_LEN {
            return Err(SegmentError::Invalid {
                name,
                reason: "mapping shorter than the segment header".into(),
            });
        }
        Ok(())
    }

    /// Unmap and close every segment
    pub fn release_all(&mut self) {
        for (name, segment) in self.segments.drain() {
            debug!(
                "Releasing segment {} ({} references outstanding)",
                name,
                segment.references.load(Ordering::Acquire)
            );
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn map_descriptor(fd: BorrowedFd<'_>) -> MmapMut {
        let file = File::from(fd.try_clone_to_owned().unwrap());
        let len = file.metadata().unwrap().len() as usize;
        unsafe { MmapOptions::new().len(len).map_mut(&file).unwrap() }
    }

    #[test]
    fn test_write_read_roundtrip() {
        let mut regions = RegionManager::new();
        regions.allocate(PARAMS_SEGMENT, 64).unwrap();

        let mut message = Serial::new();
        message.append(1i32).append(42u64);
        regions.write(PARAMS_SEGMENT, &message, SegmentFlag::Request).unwrap();

        assert_eq!(regions.flag(PARAMS_SEGMENT).unwrap(), SegmentFlag::Request);
        let mut read = regions.read(PARAMS_SEGMENT).unwrap();
        assert_eq!(read.read::<i32>(), Ok(1));
        assert_eq!(read.read::<u64>(), Ok(42));
    }

    #[test]
    fn test_oversized_write_is_protocol_error() {
        let mut regions = RegionManager::new();
        regions.allocate(PARAMS_SEGMENT, 4).unwrap();
        let mut message = Serial::new();
        message.append(1u64);
        let err = regions
            .write(PARAMS_SEGMENT, &message, SegmentFlag::Reply)
            .unwrap_err();
        assert!(matches!(
            err,
            BrokerError::Protocol(ProtocolError::SegmentOverflow { len: 8, capacity: 4 })
        ));
        assert!(!err.is_fatal());
    }

    #[test]
    fn test_client_mapping_sees_broker_writes() {
        let mut regions = RegionManager::new();
        regions.allocate(TEXTURE_SEGMENT, 16).unwrap();
        let mut client = map_descriptor(regions.descriptor_for(TEXTURE_SEGMENT).unwrap());

        segment::write(&mut client, &[9u8; 16], SegmentFlag::Request).unwrap();
        assert_eq!(regions.read_payload(TEXTURE_SEGMENT).unwrap(), vec![9u8; 16]);
        assert_eq!(segment::flag(&client), SegmentFlag::Empty);
    }

    #[test]
    fn test_read_payload_requires_pending_request() {
        let mut regions = RegionManager::new();
        regions.allocate(TEXTURE_SEGMENT, 16).unwrap();
        assert!(matches!(
            regions.read_payload(TEXTURE_SEGMENT),
            Err(BrokerError::Protocol(ProtocolError::NoPendingMessage))
        ));
    }

    #[test]
    fn test_grow_keeps_references() {
        let mut regions = RegionManager::new();
        regions.allocate(PARAMS_SEGMENT, 16).unwrap();
        assert_eq!(regions.increase_reference(PARAMS_SEGMENT).unwrap(), 1);

        regions.allocate(PARAMS_SEGMENT, 8).unwrap();
        assert_eq!(regions.capacity(PARAMS_SEGMENT).unwrap(), 16);

        regions.allocate(PARAMS_SEGMENT, 1024).unwrap();
        assert_eq!(regions.capacity(PARAMS_SEGMENT).unwrap(), 1024);
        assert_eq!(regions.reference_count(PARAMS_SEGMENT).unwrap(), 1);
        regions.validate(PARAMS_SEGMENT).unwrap();
    }

    #[test]
    fn test_references_only_grow_without_leases() {
        let mut regions = RegionManager::new();
        regions.allocate(TEXTURE_SEGMENT, 4).unwrap();
        let mut last = 0;
        for _ in 0..5 {
            let count = regions.increase_reference(TEXTURE_SEGMENT).unwrap();
            assert!(count > last);
            last = count;
        }
    }

    #[test]
    fn test_lease_releases_on_drop() {
        let mut regions = RegionManager::new();
        regions.allocate(PARAMS_SEGMENT, 16).unwrap();
        regions.increase_reference(PARAMS_SEGMENT).unwrap();

        let lease = regions.lease(PARAMS_SEGMENT).unwrap();
        assert_eq!(lease.references(), 2);
        drop(lease);
        assert_eq!(regions.reference_count(PARAMS_SEGMENT).unwrap(), 1);
    }

    #[test]
    fn test_unknown_segment() {
        let regions = RegionManager::new();
        assert!(matches!(
            regions.validate(PARAMS_SEGMENT),
            Err(SegmentError::Unknown(PARAMS_SEGMENT))
        ));
    }

    #[test]
    fn test_client_cannot_shrink_segment() {
        let mut regions = RegionManager::new();
        regions.allocate(PARAMS_SEGMENT, 64).unwrap();
        let file = File::from(regions.descriptor_for(PARAMS_SEGMENT).unwrap().try_clone_to_owned().unwrap());

        let err = file.set_len(0).unwrap_err();
        assert_eq!(err.raw_os_error(), Some(nix::libc::EPERM));
        assert_eq!(regions.flag(PARAMS_SEGMENT).unwrap(), SegmentFlag::Empty);
        regions.validate(PARAMS_SEGMENT).unwrap();
    }

    #[test]
    fn test_sealed_segment_still_grows() {
        let mut regions = RegionManager::new();
        regions.allocate(TEXTURE_SEGMENT, 16).unwrap();
        let client = map_descriptor(regions.descriptor_for(TEXTURE_SEGMENT).unwrap());

        regions.allocate(TEXTURE_SEGMENT, 4096).unwrap();
        regions.validate(TEXTURE_SEGMENT).unwrap();
        assert_eq!(segment::flag(&client), SegmentFlag::Empty);
    }
}
