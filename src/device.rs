// SPDX-License-Identifier: MIT OR Apache-2.0

use std::collections::BTreeMap;
use std::fs::{File, OpenOptions};
use std::io::{self, Read, Seek, SeekFrom, Write};
use std::path::Path;
use std::sync::Mutex;

use log::{debug, error};
use zip::ZipArchive;

use crate::consts::{
    block_size_for_prep_factor, is_valid_prep_factor, MIN_PREPPED_TRACK_COUNT, WORDS_PER_SECTOR,
    WORDS_PER_TRACK,
};
use crate::pack::PackLabel;
use crate::types::{BlockId, NodeId, PrepFactor, TrackCount};
use crate::word::{pack_words, unpack_words, Word36};

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum IoStatus {
    NotStarted,
    InProgress,
    Complete,
    DeviceIsNotReady,
    DeviceIsNotAttached,
    InvalidBlockId,
    InvalidBufferSize,
    InvalidPackName,
    InvalidPrepFactor,
    InvalidTrackCount,
    PackIsNotPrepped,
    WriteProtected,
    SystemError,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum IoFunction {
    Read,
    Write,
}

/// One channel program: a single-block transfer against one device.
pub struct IoPacket<'a> {
    pub function: IoFunction,
    pub block_id: BlockId,
    pub buffer: &'a mut [Word36],
    pub status: IoStatus,
}

impl<'a> IoPacket<'a> {
    pub fn read(block_id: BlockId, buffer: &'a mut [Word36]) -> Self {
        IoPacket {
            function: IoFunction::Read,
            block_id,
            buffer,
            status: IoStatus::NotStarted,
        }
    }

    pub fn write(block_id: BlockId, buffer: &'a mut [Word36]) -> Self {
        IoPacket {
            function: IoFunction::Write,
            block_id,
            buffer,
            status: IoStatus::NotStarted,
        }
    }
}

#[derive(Clone, Copy, Debug)]
pub struct BlockGeometry {
    pub bytes_per_block: usize,
    pub words_per_block: PrepFactor,
    pub blocks_per_track: u64,
    pub block_count: u64,
    pub track_count: TrackCount,
}

impl BlockGeometry {
    fn from_prep(prep_factor: PrepFactor, track_count: TrackCount) -> Option<Self> {
        let bytes_per_block = block_size_for_prep_factor(prep_factor)?;
        let blocks_per_track = WORDS_PER_TRACK as u64 / u64::from(prep_factor);
        Some(BlockGeometry {
            bytes_per_block,
            words_per_block: prep_factor,
            blocks_per_track,
            block_count: track_count * blocks_per_track,
            track_count,
        })
    }
}

/// A disk unit emulated over a flat file: block n lives at byte offset
/// n * bytes_per_block, and block 0 is the VOL1 label.
pub struct FileSystemDiskDevice {
    file: File,
    geometry: Option<BlockGeometry>,
    is_ready: bool,
    write_protected: bool,
}

impl FileSystemDiskDevice {
    /// Opens an image file and probes its label. An image without a VOL1
    /// label is usable only for prep.
    pub fn open(path: &Path) -> io::Result<Self> {
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .open(path)?;
        let mut device = FileSystemDiskDevice {
            file,
            geometry: None,
            is_ready: true,
            write_protected: false,
        };
        device.probe_label()?;
        Ok(device)
    }

    /// Extracts a pack image from a ZIP archive into `scratch` and opens it.
    pub fn from_zip(zip_data: &[u8], image_name: &str, scratch: &Path) -> io::Result<Self> {
        let reader = io::Cursor::new(zip_data);
        let mut archive =
            ZipArchive::new(reader).map_err(|e| io::Error::new(io::ErrorKind::Other, e))?;

        for index in 0..archive.len() {
            let mut entry = archive
                .by_index(index)
                .map_err(|e| io::Error::new(io::ErrorKind::Other, e))?;
            if entry.name() == image_name {
                let mut out = File::create(scratch)?;
                io::copy(&mut entry, &mut out)?;
                return Self::open(scratch);
            }
        }

        Err(io::Error::new(
            io::ErrorKind::NotFound,
            "pack image not found in ZIP archive",
        ))
    }

    pub fn geometry(&self) -> Option<BlockGeometry> {
        self.geometry
    }

    pub fn is_prepped(&self) -> bool {
        self.geometry.is_some()
    }

    pub fn is_ready(&self) -> bool {
        self.is_ready
    }

    pub fn set_is_ready(&mut self, flag: bool) {
        self.is_ready = flag;
    }

    pub fn set_write_protected(&mut self, flag: bool) {
        self.write_protected = flag;
    }

    fn probe_label(&mut self) -> io::Result<()> {
        let end = self.file.seek(SeekFrom::End(0))?;
        if end < WORDS_PER_SECTOR as u64 * 9 / 2 {
            return Ok(());
        }

        self.file.seek(SeekFrom::Start(0))?;
        let mut bytes = [0u8; WORDS_PER_SECTOR * 9 / 2];
        self.file.read_exact(&mut bytes)?;
        let mut words = [Word36::default(); WORDS_PER_SECTOR];
        unpack_words(&bytes, &mut words)?;

        if let Some(label) = PackLabel::decode(&words) {
            self.geometry =
                BlockGeometry::from_prep(label.words_per_block, label.track_count);
        }
        Ok(())
    }

    /// Writes a fresh VOL1 label and establishes the device geometry.
    pub fn prep(
        &mut self,
        pack_name: &str,
        prep_factor: PrepFactor,
        track_count: TrackCount,
    ) -> IoStatus {
        if !self.is_ready {
            return IoStatus::DeviceIsNotReady;
        }
        if !is_valid_prep_factor(prep_factor) {
            return IoStatus::InvalidPrepFactor;
        }
        if track_count < MIN_PREPPED_TRACK_COUNT {
            return IoStatus::InvalidTrackCount;
        }
        if !crate::fspec::is_valid_pack_name(pack_name) {
            return IoStatus::InvalidPackName;
        }

        let geometry = match BlockGeometry::from_prep(prep_factor, track_count) {
            Some(g) => g,
            None => return IoStatus::InvalidPrepFactor,
        };

        let label = PackLabel::new(pack_name, prep_factor, track_count);
        let mut words = vec![Word36::default(); prep_factor as usize];
        label.encode(&mut words);

        self.geometry = Some(geometry);
        match self.write_block_words(0, &words) {
            Ok(()) => IoStatus::Complete,
            Err(e) => {
                error!("prep: cannot write label: {}", e);
                self.geometry = None;
                IoStatus::SystemError
            }
        }
    }

    pub fn read_block(&mut self, block_id: BlockId, buffer: &mut [Word36]) -> IoStatus {
        if !self.is_ready {
            return IoStatus::DeviceIsNotReady;
        }
        let geometry = match self.geometry {
            Some(g) => g,
            None => return IoStatus::PackIsNotPrepped,
        };
        if block_id >= geometry.block_count {
            return IoStatus::InvalidBlockId;
        }
        if buffer.len() != geometry.words_per_block as usize {
            return IoStatus::InvalidBufferSize;
        }

        let packed_len = buffer.len() * 9 / 2;
        let mut bytes = vec![0u8; packed_len];
        let offset = block_id * geometry.bytes_per_block as u64;
        if let Err(e) = self.read_at(offset, &mut bytes) {
            error!("read block {}: {}", block_id, e);
            return IoStatus::SystemError;
        }
        if unpack_words(&bytes, buffer).is_err() {
            return IoStatus::SystemError;
        }
        IoStatus::Complete
    }

    pub fn write_block(&mut self, block_id: BlockId, buffer: &[Word36]) -> IoStatus {
        if !self.is_ready {
            return IoStatus::DeviceIsNotReady;
        }
        if self.write_protected {
            return IoStatus::WriteProtected;
        }
        let geometry = match self.geometry {
            Some(g) => g,
            None => return IoStatus::PackIsNotPrepped,
        };
        if block_id >= geometry.block_count {
            return IoStatus::InvalidBlockId;
        }
        if buffer.len() != geometry.words_per_block as usize {
            return IoStatus::InvalidBufferSize;
        }

        match self.write_block_words(block_id, buffer) {
            Ok(()) => IoStatus::Complete,
            Err(e) => {
                error!("write block {}: {}", block_id, e);
                IoStatus::SystemError
            }
        }
    }

    fn write_block_words(&mut self, block_id: BlockId, buffer: &[Word36]) -> io::Result<()> {
        let geometry = self
            .geometry
            .ok_or_else(|| io::Error::new(io::ErrorKind::Other, "no geometry"))?;
        // trailing zero padding up to the power-of-two block length
        let mut bytes = vec![0u8; geometry.bytes_per_block];
        let packed_len = buffer.len() * 9 / 2;
        pack_words(buffer, &mut bytes[..packed_len])?;

        let offset = block_id * geometry.bytes_per_block as u64;
        self.file.seek(SeekFrom::Start(offset))?;
        self.file.write_all(&bytes)
    }

    // Reads are satisfied with zeros past the current end of the image so a
    // freshly-prepped pack behaves like zero-filled media.
    fn read_at(&mut self, offset: u64, bytes: &mut [u8]) -> io::Result<()> {
        let end = self.file.seek(SeekFrom::End(0))?;
        if offset >= end {
            bytes.fill(0);
            return Ok(());
        }

        self.file.seek(SeekFrom::Start(offset))?;
        let available = ((end - offset) as usize).min(bytes.len());
        self.file.read_exact(&mut bytes[..available])?;
        bytes[available..].fill(0);
        Ok(())
    }
}

/// The channel fronting all attached disk units. `route_io` is the one
/// entry point and is internally thread-safe.
pub struct DiskChannel {
    devices: Mutex<BTreeMap<NodeId, FileSystemDiskDevice>>,
    next_node_id: Mutex<NodeId>,
}

impl DiskChannel {
    pub fn new() -> Self {
        DiskChannel {
            devices: Mutex::new(BTreeMap::new()),
            next_node_id: Mutex::new(1),
        }
    }

    pub fn attach(&self, device: FileSystemDiskDevice) -> NodeId {
        let mut next = self.next_node_id.lock().unwrap();
        let node_id = *next;
        *next += 1;
        self.devices.lock().unwrap().insert(node_id, device);
        debug!("attached disk device as node {}", node_id);
        node_id
    }

    pub fn node_ids(&self) -> Vec<NodeId> {
        self.devices.lock().unwrap().keys().copied().collect()
    }

    pub fn geometry(&self, node_id: NodeId) -> Option<BlockGeometry> {
        self.devices
            .lock()
            .unwrap()
            .get(&node_id)
            .and_then(|d| d.geometry())
    }

    pub fn route_io(&self, node_id: NodeId, packet: &mut IoPacket) {
        packet.status = IoStatus::InProgress;
        let mut devices = self.devices.lock().unwrap();
        let device = match devices.get_mut(&node_id) {
            Some(d) => d,
            None => {
                packet.status = IoStatus::DeviceIsNotAttached;
                return;
            }
        };
        packet.status = match packet.function {
            IoFunction::Read => device.read_block(packet.block_id, packet.buffer),
            IoFunction::Write => device.write_block(packet.block_id, packet.buffer),
        };
    }
}

impl Default for DiskChannel {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testutil::scratch_path;

    #[test]
    fn unprepped_image_has_no_geometry() {
        let path = scratch_path("raw-image");
        let device = FileSystemDiskDevice::open(&path).unwrap();
        assert!(!device.is_prepped());
    }

    #[test]
    fn prep_establishes_label_and_geometry() {
        let path = scratch_path("prep-image");
        let mut device = FileSystemDiskDevice::open(&path).unwrap();
        assert_eq!(device.prep("TEST01", 448, 10000), IoStatus::Complete);
        let geometry = device.geometry().unwrap();
        assert_eq!(geometry.bytes_per_block, 2048);
        assert_eq!(geometry.blocks_per_track, 4);
        assert_eq!(geometry.block_count, 40000);

        // reopen and re-probe
        drop(device);
        let device = FileSystemDiskDevice::open(&path).unwrap();
        assert!(device.is_prepped());
        assert_eq!(device.geometry().unwrap().track_count, 10000);
    }

    #[test]
    fn prep_validates_its_arguments() {
        let path = scratch_path("prep-bad");
        let mut device = FileSystemDiskDevice::open(&path).unwrap();
        assert_eq!(device.prep("TEST01", 100, 10000), IoStatus::InvalidPrepFactor);
        assert_eq!(device.prep("TEST01", 448, 100), IoStatus::InvalidTrackCount);
        assert_eq!(device.prep("0BAD", 448, 10000), IoStatus::InvalidPackName);
    }

    #[test]
    fn blocks_round_trip_through_the_channel() {
        let path = scratch_path("channel-image");
        let mut device = FileSystemDiskDevice::open(&path).unwrap();
        assert_eq!(device.prep("TEST01", 56, 10000), IoStatus::Complete);

        let channel = DiskChannel::new();
        let node = channel.attach(device);

        let mut buffer: Vec<Word36> = (0..56u64).map(Word36::new).collect();
        let mut pkt = IoPacket::write(77, &mut buffer);
        channel.route_io(node, &mut pkt);
        assert_eq!(pkt.status, IoStatus::Complete);

        let mut readback = vec![Word36::default(); 56];
        let mut pkt = IoPacket::read(77, &mut readback);
        channel.route_io(node, &mut pkt);
        assert_eq!(pkt.status, IoStatus::Complete);
        assert_eq!(readback, (0..56u64).map(Word36::new).collect::<Vec<_>>());
    }

    #[test]
    fn ready_and_write_protect_states_gate_transfers() {
        let path = scratch_path("gate-image");
        let mut device = FileSystemDiskDevice::open(&path).unwrap();
        assert_eq!(device.prep("TEST01", 28, 10000), IoStatus::Complete);

        let mut buffer = vec![Word36::default(); 28];
        device.set_write_protected(true);
        assert_eq!(device.write_block(5, &buffer), IoStatus::WriteProtected);
        assert_eq!(device.read_block(5, &mut buffer), IoStatus::Complete);

        device.set_write_protected(false);
        device.set_is_ready(false);
        assert!(!device.is_ready());
        assert_eq!(device.read_block(5, &mut buffer), IoStatus::DeviceIsNotReady);
        device.set_is_ready(true);
        assert_eq!(device.write_block(5, &buffer), IoStatus::Complete);
    }

    #[test]
    fn unwritten_blocks_read_as_zero() {
        let path = scratch_path("zero-image");
        let mut device = FileSystemDiskDevice::open(&path).unwrap();
        assert_eq!(device.prep("TEST01", 28, 10000), IoStatus::Complete);
        let mut buffer = vec![Word36::new(0o777); 28];
        assert_eq!(device.read_block(9999, &mut buffer), IoStatus::Complete);
        assert!(buffer.iter().all(|w| w.is_zero()));
        assert_eq!(
            device.read_block(10000 * 64, &mut buffer),
            IoStatus::InvalidBlockId
        );
    }

    #[test]
    fn zip_image_extraction() {
        use std::io::Write as _;
        use zip::write::SimpleFileOptions;

        let path = scratch_path("zip-source");
        let mut device = FileSystemDiskDevice::open(&path).unwrap();
        assert_eq!(device.prep("ZIP001", 28, 10000), IoStatus::Complete);
        drop(device);
        let image = std::fs::read(&path).unwrap();

        let mut archive_bytes = Vec::new();
        {
            let mut writer = zip::ZipWriter::new(io::Cursor::new(&mut archive_bytes));
            let options =
                SimpleFileOptions::default().compression_method(zip::CompressionMethod::Stored);
            writer.start_file("pack.img", options).unwrap();
            writer.write_all(&image).unwrap();
            writer.finish().unwrap();
        }

        let scratch = scratch_path("zip-extracted");
        let device =
            FileSystemDiskDevice::from_zip(&archive_bytes, "pack.img", &scratch).unwrap();
        assert!(device.is_prepped());
        assert!(
            FileSystemDiskDevice::from_zip(&archive_bytes, "missing.img", &scratch).is_err()
        );
    }
}
