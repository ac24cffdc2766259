use itertools::Itertools;

use crate::boot_sector::Fat32BootSector;
use crate::{BlockDevice, Error, Result};

/// FAT32 entries are 28-bit; the high nibble is reserved and must survive
/// rewrites untouched.
const ENTRY_MASK: u32 = 0x0FFF_FFFF;

pub const FREE: u32 = 0;
pub const BAD_CLUSTER: u32 = 0x0FFF_FFF7;
/// Everything from here up marks the end of a chain.
pub const END_OF_CHAIN_MIN: u32 = 0x0FFF_FFF8;
/// The value written when terminating a chain.
pub const END_OF_CHAIN: u32 = 0x0FFF_FFFF;

const FIRST_DATA_CLUSTER: u32 = 2;

const FS_INFO_LEAD_SIGNATURE: u32 = 0x4161_5252;
const FS_INFO_STRUCT_SIGNATURE: u32 = 0x6141_7272;
const FS_INFO_TRAIL_SIGNATURE: u32 = 0xAA55_0000;
const FS_INFO_UNKNOWN: u32 = 0xFFFF_FFFF;

/// Cluster-to-successor lookup and allocation over every FAT copy of the
/// volume, plus the FSInfo hints that speed up free-cluster scans.
pub struct Fat {
    fat_offsets: Vec<u64>,
    total_data_clusters: u32,
    fs_info_offset: u64,
    free_count: u32,
    next_free: u32,
}

impl Fat {
    pub fn open(device: &mut dyn BlockDevice, boot: &Fat32BootSector) -> Result<Self> {
        let fat_offsets = (0..boot.number_of_fats())
            .map(|index| boot.fat_offset(index))
            .collect();

        let mut fat = Self {
            fat_offsets,
            total_data_clusters: boot.total_data_clusters(),
            fs_info_offset: boot.fs_info_offset(),
            free_count: FS_INFO_UNKNOWN,
            next_free: FS_INFO_UNKNOWN,
        };
        fat.load_fs_info(device)?;
        Ok(fat)
    }

    pub fn free_clusters(&self) -> u32 {
        self.free_count
    }

    /// Follows successor links from `start` until end-of-chain.
    pub fn chain(&self, device: &mut dyn BlockDevice, start: u32) -> Result<Vec<u32>> {
        let mut chain = Vec::new();
        let mut current = start;

        loop {
            if current < FIRST_DATA_CLUSTER
                || current >= FIRST_DATA_CLUSTER + self.total_data_clusters
            {
                return Err(Error::InvalidFormat("cluster out of range"));
            }
            chain.push(current);
            if chain.len() as u32 > self.total_data_clusters {
                return Err(Error::InvalidFormat("cycle in cluster chain"));
            }

            let entry = self.entry(device, current)?;
            match entry {
                END_OF_CHAIN_MIN..=ENTRY_MASK => break,
                BAD_CLUSTER => return Err(Error::InvalidFormat("bad cluster in chain")),
                FREE => return Err(Error::InvalidFormat("free cluster in chain")),
                next => current = next,
            }
        }

        Ok(chain)
    }

    /// Extends `existing` by `count` fresh clusters and returns the full new
    /// chain. The scan starts at the FSInfo hint and wraps around the data
    /// area once.
    pub fn alloc(
        &mut self,
        device: &mut dyn BlockDevice,
        existing: &[u32],
        count: u32,
    ) -> Result<Vec<u32>> {
        if count == 0 {
            return Ok(existing.to_vec());
        }
        let fresh = self.find_free(device, count)?;

        let links = existing
            .last()
            .copied()
            .into_iter()
            .chain(fresh.iter().copied());
        for (cluster, successor) in links.tuple_windows() {
            self.set_entry(device, cluster, successor)?;
        }
        self.set_entry(device, *fresh.last().unwrap(), END_OF_CHAIN)?;

        self.free_count = self.free_count.saturating_sub(count);
        self.next_free = fresh.last().unwrap() + 1;
        self.store_fs_info(device)?;

        let mut chain = existing.to_vec();
        chain.extend_from_slice(&fresh);
        Ok(chain)
    }

    /// Truncates `count` clusters from the end of `chain`, returning them to
    /// the free pool.
    pub fn free(&mut self, device: &mut dyn BlockDevice, chain: &[u32], count: u32) -> Result<()> {
        let count = count as usize;
        assert!(count <= chain.len());

        let (kept, freed) = chain.split_at(chain.len() - count);
        for &cluster in freed {
            self.set_entry(device, cluster, FREE)?;
        }
        if let Some(&last) = kept.last() {
            self.set_entry(device, last, END_OF_CHAIN)?;
        }

        self.free_count = self.free_count.saturating_add(count as u32);
        if let Some(&first_freed) = freed.first() {
            self.next_free = self.next_free.min(first_freed);
        }
        self.store_fs_info(device)
    }

    fn find_free(&self, device: &mut dyn BlockDevice, count: u32) -> Result<Vec<u32>> {
        let total = self.total_data_clusters;
        let start = self
            .next_free
            .clamp(FIRST_DATA_CLUSTER, FIRST_DATA_CLUSTER + total - 1);

        let block_size = device.block_size() as u64;
        let mut buffer = vec![0u8; block_size as usize];
        let mut cached_offset = u64::MAX;
        let mut fresh = Vec::with_capacity(count as usize);

        for step in 0..total {
            if fresh.len() as u32 == count {
                break;
            }
            let cluster = FIRST_DATA_CLUSTER + (start - FIRST_DATA_CLUSTER + step) % total;

            let offset = self.fat_offsets[0] + u64::from(cluster) * 4;
            let block_offset = offset / block_size * block_size;
            if block_offset != cached_offset {
                device.read(block_offset, &mut buffer)?;
                cached_offset = block_offset;
            }

            let index = (offset - block_offset) as usize;
            let entry =
                u32::from_le_bytes(buffer[index..index + 4].try_into().unwrap()) & ENTRY_MASK;
            if entry == FREE {
                fresh.push(cluster);
            }
        }

        if fresh.len() as u32 != count {
            return Err(Error::OutOfSpace);
        }
        Ok(fresh)
    }

    fn entry(&self, device: &mut dyn BlockDevice, cluster: u32) -> Result<u32> {
        let block_size = device.block_size() as u64;
        let offset = self.fat_offsets[0] + u64::from(cluster) * 4;
        let block_offset = offset / block_size * block_size;

        let mut buffer = vec![0u8; block_size as usize];
        device.read(block_offset, &mut buffer)?;

        let index = (offset - block_offset) as usize;
        Ok(u32::from_le_bytes(buffer[index..index + 4].try_into().unwrap()) & ENTRY_MASK)
    }

    /// Writes one entry to every FAT copy, preserving the reserved high
    /// nibble already on disk.
    fn set_entry(&self, device: &mut dyn BlockDevice, cluster: u32, value: u32) -> Result<()> {
        let block_size = device.block_size() as u64;

        for &fat_offset in &self.fat_offsets {
            let offset = fat_offset + u64::from(cluster) * 4;
            let block_offset = offset / block_size * block_size;

            let mut buffer = vec![0u8; block_size as usize];
            device.read(block_offset, &mut buffer)?;

            let index = (offset - block_offset) as usize;
            let old = u32::from_le_bytes(buffer[index..index + 4].try_into().unwrap());
            let new = (old & !ENTRY_MASK) | (value & ENTRY_MASK);
            buffer[index..index + 4].copy_from_slice(&new.to_le_bytes());

            device.write(block_offset, &buffer)?;
        }

        Ok(())
    }

    fn load_fs_info(&mut self, device: &mut dyn BlockDevice) -> Result<()> {
        let block_size = device.block_size() as u64;
        let block_offset = self.fs_info_offset / block_size * block_size;
        let base = (self.fs_info_offset - block_offset) as usize;

        let mut buffer = vec![0u8; block_size as usize];
        device.read(block_offset, &mut buffer)?;

        let word =
            |at: usize| u32::from_le_bytes(buffer[base + at..base + at + 4].try_into().unwrap());

        let signatures_valid = word(0) == FS_INFO_LEAD_SIGNATURE
            && word(484) == FS_INFO_STRUCT_SIGNATURE
            && word(508) == FS_INFO_TRAIL_SIGNATURE;
        if !signatures_valid {
            log::warn!("FSInfo signatures invalid, recomputing free cluster count");
        }

        self.free_count = word(488);
        self.next_free = word(492);

        if !signatures_valid || self.free_count > self.total_data_clusters {
            self.free_count = self.scan_free_count(device)?;
            log::debug!("free cluster count recomputed: {}", self.free_count);
        }
        if self.next_free < FIRST_DATA_CLUSTER
            || self.next_free >= FIRST_DATA_CLUSTER + self.total_data_clusters
        {
            self.next_free = FIRST_DATA_CLUSTER;
        }

        Ok(())
    }

    fn store_fs_info(&self, device: &mut dyn BlockDevice) -> Result<()> {
        let block_size = device.block_size() as u64;
        let block_offset = self.fs_info_offset / block_size * block_size;
        let base = (self.fs_info_offset - block_offset) as usize;

        let mut buffer = vec![0u8; block_size as usize];
        device.read(block_offset, &mut buffer)?;

        let mut word = |at: usize, value: u32| {
            buffer[base + at..base + at + 4].copy_from_slice(&value.to_le_bytes())
        };
        word(0, FS_INFO_LEAD_SIGNATURE);
        word(484, FS_INFO_STRUCT_SIGNATURE);
        word(488, self.free_count);
        word(492, self.next_free);
        word(508, FS_INFO_TRAIL_SIGNATURE);

        device.write(block_offset, &buffer)
    }

    /// Authoritative free count, derived by scanning the first FAT copy.
    fn scan_free_count(&self, device: &mut dyn BlockDevice) -> Result<u32> {
        let block_size = device.block_size() as usize;
        let mut buffer = vec![0u8; block_size];

        let mut free = 0;
        let mut block_offset = u64::MAX;
        for cluster in FIRST_DATA_CLUSTER..FIRST_DATA_CLUSTER + self.total_data_clusters {
            let offset = self.fat_offsets[0] + u64::from(cluster) * 4;
            let needed = offset / block_size as u64 * block_size as u64;
            if needed != block_offset {
                device.read(needed, &mut buffer)?;
                block_offset = needed;
            }
            let index = (offset - block_offset) as usize;
            let entry =
                u32::from_le_bytes(buffer[index..index + 4].try_into().unwrap()) & ENTRY_MASK;
            if entry == FREE {
                free += 1;
            }
        }

        Ok(free)
    }
}
