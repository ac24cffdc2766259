use bytemuck::{Pod, Zeroable};
use static_assertions::const_assert;

use crate::{BlockDevice, Error, Result};

/// Partition types under which FAT32 volumes are published in an MBR.
const FAT32_TYPES: [u8; 4] = [0x0B, 0x0C, 0x1B, 0x1C];

const MBR_TABLE_OFFSET: usize = 0x1BE;

#[derive(Copy, Clone, Zeroable, Pod)]
#[repr(C)]
struct RawPartitionEntry {
    status: u8,
    chs_first: [u8; 3],
    partition_type: u8,
    chs_last: [u8; 3],
    first_lba: u32,
    sector_count: u32,
}

const_assert!(core::mem::size_of::<RawPartitionEntry>() == 16);

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct PartitionTableEntry {
    pub partition_type: u8,
    pub first_lba: u32,
    pub sector_count: u32,
}

impl PartitionTableEntry {
    pub fn is_fat32(&self) -> bool {
        FAT32_TYPES.contains(&self.partition_type)
    }
}

/// The four-entry partition table parsed from the MBR at device byte 0.
pub struct PartitionTable {
    entries: Vec<PartitionTableEntry>,
}

impl PartitionTable {
    pub fn read(device: &mut dyn BlockDevice) -> Result<Self> {
        let mut buffer = vec![0u8; device.block_size() as usize];
        device.read(0, &mut buffer)?;

        if buffer[510..512] != [0x55, 0xAA] {
            return Err(Error::InvalidFormat("MBR signature"));
        }

        let table = &buffer[MBR_TABLE_OFFSET..MBR_TABLE_OFFSET + 4 * 16];
        let entries = table
            .chunks_exact(16)
            .map(bytemuck::pod_read_unaligned::<RawPartitionEntry>)
            .filter(|raw| raw.partition_type != 0 && raw.sector_count != 0)
            .map(|raw| PartitionTableEntry {
                partition_type: raw.partition_type,
                first_lba: raw.first_lba,
                sector_count: raw.sector_count,
            })
            .collect();

        Ok(Self { entries })
    }

    pub fn entries(&self) -> &[PartitionTableEntry] {
        &self.entries
    }

    /// First entry published as FAT32.
    pub fn find_fat32(&self) -> Result<PartitionTableEntry> {
        self.entries
            .iter()
            .copied()
            .find(PartitionTableEntry::is_fat32)
            .ok_or(Error::Unsupported("no FAT32 partition"))
    }
}

/// Byte-offset view into the underlying block device, so that partition
/// byte 0 is the partition's first sector.
pub struct Partition<D> {
    device: D,
    byte_offset: u64,
}

impl<D: BlockDevice> Partition<D> {
    pub fn new(device: D, entry: PartitionTableEntry) -> Self {
        let byte_offset = u64::from(entry.first_lba) * u64::from(device.block_size());
        Self {
            device,
            byte_offset,
        }
    }
}

impl<D: BlockDevice> BlockDevice for Partition<D> {
    fn read(&mut self, device_offset: u64, dest: &mut [u8]) -> Result<()> {
        self.device.read(self.byte_offset + device_offset, dest)
    }

    fn write(&mut self, device_offset: u64, src: &[u8]) -> Result<()> {
        self.device.write(self.byte_offset + device_offset, src)
    }

    fn block_size(&self) -> u32 {
        self.device.block_size()
    }
}

#[cfg(test)]
pub(crate) fn write_test_mbr(sector: &mut [u8], partition_type: u8, first_lba: u32, count: u32) {
    let entry = &mut sector[MBR_TABLE_OFFSET..MBR_TABLE_OFFSET + 16];
    entry[0] = 0x80;
    entry[4] = partition_type;
    entry[8..12].copy_from_slice(&first_lba.to_le_bytes());
    entry[12..16].copy_from_slice(&count.to_le_bytes());
    sector[510] = 0x55;
    sector[511] = 0xAA;
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testutil::RamDevice;

    #[test]
    fn parses_fat32_entry() {
        let mut device = RamDevice::new(64 * 512);
        let mut mbr = vec![0u8; 512];
        write_test_mbr(&mut mbr, 0x0C, 2048, 40960);
        device.write(0, &mbr).unwrap();

        let table = PartitionTable::read(&mut device).unwrap();
        assert_eq!(table.entries().len(), 1);

        let entry = table.find_fat32().unwrap();
        assert_eq!(entry.first_lba, 2048);
        assert_eq!(entry.sector_count, 40960);
    }

    #[test]
    fn missing_signature() {
        let mut device = RamDevice::new(64 * 512);
        assert!(matches!(
            PartitionTable::read(&mut device),
            Err(Error::InvalidFormat(_))
        ));
    }

    #[test]
    fn no_fat32_partition() {
        let mut device = RamDevice::new(64 * 512);
        let mut mbr = vec![0u8; 512];
        write_test_mbr(&mut mbr, 0x83, 2048, 40960);
        device.write(0, &mbr).unwrap();

        let table = PartitionTable::read(&mut device).unwrap();
        assert!(matches!(table.find_fat32(), Err(Error::Unsupported(_))));
    }

    #[test]
    fn partition_offsets_requests() {
        let mut device = RamDevice::new(64 * 512);
        let payload = vec![0xA5u8; 512];
        device.write(2048, &payload).unwrap();

        let entry = PartitionTableEntry {
            partition_type: 0x0B,
            first_lba: 4,
            sector_count: 16,
        };
        let mut partition = Partition::new(device, entry);

        let mut read_back = vec![0u8; 512];
        partition.read(0, &mut read_back).unwrap();
        assert_eq!(read_back, payload);
    }
}
