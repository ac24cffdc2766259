//! In-memory backends for exercising the whole stack without hardware: a
//! RAM block device, a minimal FAT32 formatter and a scripted Bulk-Only
//! Transport target.

use std::cell::RefCell;
use std::collections::VecDeque;
use std::rc::Rc;

use crate::boot_sector::build_test_boot_sector;
use crate::entry::FatDirectoryEntry;
use crate::partition::write_test_mbr;
use crate::utils::unsigned_rounded_up_div;
use crate::{BlockDevice, Result, TransportError, UsbCommunication};

/// Block device over shared memory. Clones see the same bytes, which makes
/// remount tests possible after `FileSystem::mount` takes ownership.
#[derive(Clone)]
pub(crate) struct RamDevice {
    data: Rc<RefCell<Vec<u8>>>,
    block_size: u32,
}

impl RamDevice {
    pub(crate) fn new(len: usize) -> Self {
        Self::from_bytes(vec![0u8; len])
    }

    pub(crate) fn from_bytes(data: Vec<u8>) -> Self {
        Self {
            data: Rc::new(RefCell::new(data)),
            block_size: 512,
        }
    }
}

impl BlockDevice for RamDevice {
    fn read(&mut self, device_offset: u64, dest: &mut [u8]) -> Result<()> {
        assert_eq!(device_offset % u64::from(self.block_size), 0);
        assert_eq!(dest.len() % self.block_size as usize, 0);

        let offset = device_offset as usize;
        dest.copy_from_slice(&self.data.borrow()[offset..offset + dest.len()]);
        Ok(())
    }

    fn write(&mut self, device_offset: u64, src: &[u8]) -> Result<()> {
        assert_eq!(device_offset % u64::from(self.block_size), 0);
        assert_eq!(src.len() % self.block_size as usize, 0);

        let offset = device_offset as usize;
        self.data.borrow_mut()[offset..offset + src.len()].copy_from_slice(src);
        Ok(())
    }

    fn block_size(&self) -> u32 {
        self.block_size
    }
}

pub(crate) const TEST_VOLUME_LABEL: &str = "TESTVOL";

/// Formats a partition-level FAT32 image: 512-byte sectors, 4 KiB
/// clusters, two FAT copies, a labelled root directory.
pub(crate) fn format_volume(bytes: usize) -> RamDevice {
    let device = RamDevice::new(bytes);
    let mut data = device.data.borrow_mut();

    let total_sectors = (bytes / 512) as u32;
    let sectors_per_cluster = 8u32;
    let reserved_sectors = 32u32;

    // A slightly oversized FAT is harmless; size it for every data sector
    // being available, then refine once.
    let mut fat_size = unsigned_rounded_up_div(
        (total_sectors / sectors_per_cluster + 2) * 4,
        512,
    );
    let mut clusters = (total_sectors - reserved_sectors - 2 * fat_size) / sectors_per_cluster;
    fat_size = unsigned_rounded_up_div((clusters + 2) * 4, 512);
    clusters = (total_sectors - reserved_sectors - 2 * fat_size) / sectors_per_cluster;

    let boot = build_test_boot_sector(total_sectors, sectors_per_cluster as u8, fat_size);
    data[..512].copy_from_slice(bytemuck::bytes_of(&boot));

    // FSInfo: the root directory occupies the one allocated cluster.
    let fs_info = &mut data[512..1024];
    fs_info[0..4].copy_from_slice(&0x4161_5252u32.to_le_bytes());
    fs_info[484..488].copy_from_slice(&0x6141_7272u32.to_le_bytes());
    fs_info[488..492].copy_from_slice(&(clusters - 1).to_le_bytes());
    fs_info[492..496].copy_from_slice(&3u32.to_le_bytes());
    fs_info[508..512].copy_from_slice(&0xAA55_0000u32.to_le_bytes());

    // Both FAT copies: media entry, reserved entry, root chain terminator.
    for copy in 0..2u32 {
        let offset = ((reserved_sectors + copy * fat_size) * 512) as usize;
        data[offset..offset + 4].copy_from_slice(&0x0FFF_FFF8u32.to_le_bytes());
        data[offset + 4..offset + 8].copy_from_slice(&0x0FFF_FFFFu32.to_le_bytes());
        data[offset + 8..offset + 12].copy_from_slice(&0x0FFF_FFFFu32.to_le_bytes());
    }

    // Root directory (cluster 2): volume label entry, then the zero
    // sentinel the fresh image already provides.
    let data_area = ((reserved_sectors + 2 * fat_size) * 512) as usize;
    let mut label = Vec::new();
    FatDirectoryEntry::create_volume_label(TEST_VOLUME_LABEL).serialize(&mut label);
    data[data_area..data_area + label.len()].copy_from_slice(&label);

    drop(data);
    device
}

/// A whole-device image: MBR with one FAT32 partition at LBA 2048 followed
/// by a freshly formatted volume.
pub(crate) fn format_device_image(partition_bytes: usize) -> Vec<u8> {
    const PARTITION_LBA: u32 = 2048;

    let mut image = vec![0u8; PARTITION_LBA as usize * 512 + partition_bytes];
    write_test_mbr(
        &mut image[..512],
        0x0C,
        PARTITION_LBA,
        (partition_bytes / 512) as u32,
    );

    let volume = format_volume(partition_bytes);
    let volume = volume.data.borrow();
    image[PARTITION_LBA as usize * 512..].copy_from_slice(&volume);
    image
}

/// Scripted USB mass storage target: decodes CBWs, serves a handful of
/// SCSI commands against an in-memory disk and answers with CSWs. Enough
/// of a device to exercise the wire framing end to end.
pub(crate) struct MockUsbDevice {
    storage: Vec<u8>,
    block_size: u32,
    in_queue: VecDeque<Vec<u8>>,
    pending_write: Option<PendingWrite>,
    fail_next: Option<(u8, u8, u8)>,
    sense: (u8, u8, u8),
    phase_error: bool,
    reset_recoveries: u32,
}

struct PendingWrite {
    offset: usize,
    remaining: usize,
    tag: u32,
}

impl MockUsbDevice {
    pub(crate) fn new(storage: Vec<u8>, block_size: u32) -> Self {
        Self {
            storage,
            block_size,
            in_queue: VecDeque::new(),
            pending_write: None,
            fail_next: None,
            sense: (0, 0, 0),
            phase_error: false,
            reset_recoveries: 0,
        }
    }

    /// The next data-in command fails with CHECK CONDITION and the given
    /// sense triple.
    pub(crate) fn fail_next_with_sense(&mut self, key: u8, asc: u8, ascq: u8) {
        self.fail_next = Some((key, asc, ascq));
    }

    /// The next command is answered with a phase-error CSW.
    pub(crate) fn phase_error_next(&mut self) {
        self.phase_error = true;
    }

    pub(crate) fn reset_recoveries(&self) -> u32 {
        self.reset_recoveries
    }

    fn queue_csw(&mut self, tag: u32, status: u8) {
        let mut csw = Vec::with_capacity(13);
        csw.extend_from_slice(b"USBS");
        csw.extend_from_slice(&tag.to_le_bytes());
        csw.extend_from_slice(&0u32.to_le_bytes());
        csw.push(status);
        self.in_queue.push_back(csw);
    }

    fn handle_cbw(&mut self, cbw: &[u8]) {
        assert_eq!(&cbw[0..4], b"USBC", "malformed CBW");
        let tag = u32::from_le_bytes(cbw[4..8].try_into().unwrap());
        let data_transfer_length =
            u32::from_le_bytes(cbw[8..12].try_into().unwrap()) as usize;
        let cb = &cbw[15..31];
        let opcode = cb[0];

        if self.phase_error {
            self.phase_error = false;
            self.in_queue.push_back(vec![0u8; data_transfer_length]);
            self.queue_csw(tag, 2);
            return;
        }

        if opcode != 0x03 {
            if let Some(sense) = self.fail_next.take() {
                self.sense = sense;
                self.in_queue.push_back(vec![0u8; data_transfer_length]);
                self.queue_csw(tag, 1);
                return;
            }
        }

        match opcode {
            // TEST UNIT READY
            0x00 => {}
            // REQUEST SENSE
            0x03 => {
                let mut data = vec![0u8; data_transfer_length];
                data[0] = 0x70;
                data[2] = self.sense.0;
                data[12] = self.sense.1;
                data[13] = self.sense.2;
                self.in_queue.push_back(data);
            }
            // INQUIRY
            0x12 => {
                let mut data = vec![0u8; data_transfer_length];
                data[1] = 0x80; // removable
                data[8..14].copy_from_slice(b"umsfat");
                self.in_queue.push_back(data);
            }
            // MODE SENSE(6)
            0x1A => {
                self.in_queue.push_back(vec![0u8; data_transfer_length]);
            }
            // READ CAPACITY(10)
            0x25 => {
                let last_lba = (self.storage.len() as u32 / self.block_size) - 1;
                let mut data = Vec::with_capacity(8);
                data.extend_from_slice(&last_lba.to_be_bytes());
                data.extend_from_slice(&self.block_size.to_be_bytes());
                self.in_queue.push_back(data);
            }
            // READ(10)
            0x28 => {
                let lba = u32::from_be_bytes(cb[2..6].try_into().unwrap());
                let offset = lba as usize * self.block_size as usize;
                self.in_queue
                    .push_back(self.storage[offset..offset + data_transfer_length].to_vec());
            }
            // WRITE(10)
            0x2A => {
                let lba = u32::from_be_bytes(cb[2..6].try_into().unwrap());
                self.pending_write = Some(PendingWrite {
                    offset: lba as usize * self.block_size as usize,
                    remaining: data_transfer_length,
                    tag,
                });
                return; // CSW follows once the data phase completes
            }
            other => panic!("unsupported SCSI opcode 0x{other:02X}"),
        }

        self.queue_csw(tag, 0);
    }
}

impl UsbCommunication for MockUsbDevice {
    fn bulk_out(&mut self, data: &[u8]) -> std::result::Result<usize, TransportError> {
        if let Some(mut write) = self.pending_write.take() {
            self.storage[write.offset..write.offset + data.len()].copy_from_slice(data);
            write.offset += data.len();
            write.remaining -= data.len();
            if write.remaining == 0 {
                self.queue_csw(write.tag, 0);
            } else {
                self.pending_write = Some(write);
            }
            return Ok(data.len());
        }

        self.handle_cbw(data);
        Ok(data.len())
    }

    fn bulk_in(&mut self, buffer: &mut [u8]) -> std::result::Result<usize, TransportError> {
        let data = self.in_queue.pop_front().ok_or(TransportError::Protocol)?;
        let take = data.len().min(buffer.len());
        buffer[..take].copy_from_slice(&data[..take]);
        Ok(take)
    }

    fn control_transfer(
        &mut self,
        _request_type: u8,
        request: u8,
        _value: u16,
        _index: u16,
        _data: &mut [u8],
    ) -> std::result::Result<usize, TransportError> {
        if request == 0xFF {
            // Bulk-Only Mass Storage Reset
            self.reset_recoveries += 1;
            self.in_queue.clear();
            self.pending_write = None;
        }
        Ok(0)
    }

    fn clear_feature_halt(&mut self, _endpoint: u8) -> std::result::Result<(), TransportError> {
        Ok(())
    }
}
