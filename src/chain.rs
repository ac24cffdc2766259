use crate::boot_sector::Fat32BootSector;
use crate::fat::Fat;
use crate::utils::unsigned_rounded_up_div;
use crate::{BlockDevice, Result};

/// A contiguous logical byte stream laid over a (generally non-contiguous)
/// cluster chain. The device below only accepts block-aligned requests, so
/// partial blocks at either end of a span are staged through a scratch
/// block.
pub struct ClusterChain {
    clusters: Vec<u32>,
    bytes_per_cluster: u32,
    data_area_offset: u64,
}

impl ClusterChain {
    /// Follows the chain starting at `start`. A start cluster below 2 means
    /// no allocation yet and yields an empty chain.
    pub fn open(
        device: &mut dyn BlockDevice,
        fat: &Fat,
        boot: &Fat32BootSector,
        start: u32,
    ) -> Result<Self> {
        let clusters = if start < 2 {
            Vec::new()
        } else {
            fat.chain(device, start)?
        };

        Ok(Self {
            clusters,
            bytes_per_cluster: boot.bytes_per_cluster(),
            data_area_offset: boot.data_area_offset(),
        })
    }

    pub fn first_cluster(&self) -> u32 {
        self.clusters.first().copied().unwrap_or(0)
    }

    pub fn cluster_count(&self) -> u32 {
        self.clusters.len() as u32
    }

    /// Capacity of the chain in bytes.
    pub fn length(&self) -> u64 {
        self.clusters.len() as u64 * u64::from(self.bytes_per_cluster)
    }

    /// Grows or shrinks the chain so it can hold `bytes`.
    pub fn set_length(
        &mut self,
        device: &mut dyn BlockDevice,
        fat: &mut Fat,
        bytes: u64,
    ) -> Result<()> {
        let needed = if bytes == 0 {
            0usize
        } else {
            unsigned_rounded_up_div(bytes, u64::from(self.bytes_per_cluster)) as usize
        };
        let current = self.clusters.len();

        if needed > current {
            self.clusters = fat.alloc(device, &self.clusters, (needed - current) as u32)?;
        } else if needed < current {
            fat.free(device, &self.clusters, (current - needed) as u32)?;
            self.clusters.truncate(needed);
        }

        Ok(())
    }

    pub fn read(&self, device: &mut dyn BlockDevice, offset: u64, dest: &mut [u8]) -> Result<()> {
        assert!(offset + dest.len() as u64 <= self.length());

        let bytes_per_cluster = u64::from(self.bytes_per_cluster);
        let mut offset = offset;
        let mut position = 0usize;

        while position < dest.len() {
            let cluster = self.clusters[(offset / bytes_per_cluster) as usize];
            let within = offset % bytes_per_cluster;
            let span = ((bytes_per_cluster - within) as usize).min(dest.len() - position);

            let absolute =
                self.data_area_offset + u64::from(cluster - 2) * bytes_per_cluster + within;
            read_span(device, absolute, &mut dest[position..position + span])?;

            offset += span as u64;
            position += span;
        }

        Ok(())
    }

    pub fn write(&self, device: &mut dyn BlockDevice, offset: u64, src: &[u8]) -> Result<()> {
        assert!(offset + src.len() as u64 <= self.length());

        let bytes_per_cluster = u64::from(self.bytes_per_cluster);
        let mut offset = offset;
        let mut position = 0usize;

        while position < src.len() {
            let cluster = self.clusters[(offset / bytes_per_cluster) as usize];
            let within = offset % bytes_per_cluster;
            let span = ((bytes_per_cluster - within) as usize).min(src.len() - position);

            let absolute =
                self.data_area_offset + u64::from(cluster - 2) * bytes_per_cluster + within;
            write_span(device, absolute, &src[position..position + span])?;

            offset += span as u64;
            position += span;
        }

        Ok(())
    }
}

fn read_span(device: &mut dyn BlockDevice, mut offset: u64, dest: &mut [u8]) -> Result<()> {
    let block_size = u64::from(device.block_size());
    let mut position = 0usize;

    let misalignment = (offset % block_size) as usize;
    if misalignment != 0 {
        let mut scratch = vec![0u8; block_size as usize];
        device.read(offset - misalignment as u64, &mut scratch)?;

        let take = (block_size as usize - misalignment).min(dest.len());
        dest[..take].copy_from_slice(&scratch[misalignment..misalignment + take]);
        position += take;
        offset += take as u64;
    }

    let aligned = (dest.len() - position) / block_size as usize * block_size as usize;
    if aligned > 0 {
        device.read(offset, &mut dest[position..position + aligned])?;
        position += aligned;
        offset += aligned as u64;
    }

    let tail = dest.len() - position;
    if tail > 0 {
        let mut scratch = vec![0u8; block_size as usize];
        device.read(offset, &mut scratch)?;
        dest[position..].copy_from_slice(&scratch[..tail]);
    }

    Ok(())
}

fn write_span(device: &mut dyn BlockDevice, mut offset: u64, src: &[u8]) -> Result<()> {
    let block_size = u64::from(device.block_size());
    let mut position = 0usize;

    let misalignment = (offset % block_size) as usize;
    if misalignment != 0 {
        let block_start = offset - misalignment as u64;
        let mut scratch = vec![0u8; block_size as usize];
        device.read(block_start, &mut scratch)?;

        let take = (block_size as usize - misalignment).min(src.len());
        scratch[misalignment..misalignment + take].copy_from_slice(&src[..take]);
        device.write(block_start, &scratch)?;
        position += take;
        offset += take as u64;
    }

    let aligned = (src.len() - position) / block_size as usize * block_size as usize;
    if aligned > 0 {
        device.write(offset, &src[position..position + aligned])?;
        position += aligned;
        offset += aligned as u64;
    }

    let tail = src.len() - position;
    if tail > 0 {
        let mut scratch = vec![0u8; block_size as usize];
        device.read(offset, &mut scratch)?;
        scratch[..tail].copy_from_slice(&src[position..]);
        device.write(offset, &scratch)?;
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testutil::{format_volume, RamDevice};

    fn open_volume(device: &mut RamDevice) -> (Fat32BootSector, Fat) {
        let boot = Fat32BootSector::read(device).unwrap();
        let fat = Fat::open(device, &boot).unwrap();
        (boot, fat)
    }

    #[test]
    fn grows_and_shrinks() {
        let mut device = format_volume(16 * 1024 * 1024);
        let (boot, mut fat) = open_volume(&mut device);

        let mut chain = ClusterChain::open(&mut device, &fat, &boot, 0).unwrap();
        assert_eq!(chain.length(), 0);
        assert_eq!(chain.first_cluster(), 0);

        chain.set_length(&mut device, &mut fat, 10_000).unwrap();
        assert_eq!(chain.cluster_count(), 3); // 4 KiB clusters
        assert!(chain.first_cluster() >= 2);

        chain.set_length(&mut device, &mut fat, 4096).unwrap();
        assert_eq!(chain.cluster_count(), 1);

        chain.set_length(&mut device, &mut fat, 0).unwrap();
        assert_eq!(chain.cluster_count(), 0);
        assert_eq!(chain.first_cluster(), 0);
    }

    #[test]
    fn round_trip_across_boundaries() {
        let mut device = format_volume(16 * 1024 * 1024);
        let (boot, mut fat) = open_volume(&mut device);

        let mut chain = ClusterChain::open(&mut device, &fat, &boot, 0).unwrap();
        chain.set_length(&mut device, &mut fat, 3 * 4096).unwrap();

        // offsets and lengths chosen to cross block and cluster boundaries
        for (offset, length) in [
            (0u64, 512usize),
            (100, 700),
            (511, 2),
            (4000, 200),   // crosses the first cluster boundary
            (4096, 4096),  // exactly the second cluster
            (1000, 10000), // spans all three clusters
        ] {
            let payload: Vec<u8> = (0..length).map(|i| (i * 7 % 251) as u8).collect();
            chain.write(&mut device, offset, &payload).unwrap();

            let mut read_back = vec![0u8; length];
            chain.read(&mut device, offset, &mut read_back).unwrap();
            assert_eq!(read_back, payload, "offset {offset} length {length}");
        }
    }

    #[test]
    fn partial_write_preserves_neighbors() {
        let mut device = format_volume(16 * 1024 * 1024);
        let (boot, mut fat) = open_volume(&mut device);

        let mut chain = ClusterChain::open(&mut device, &fat, &boot, 0).unwrap();
        chain.set_length(&mut device, &mut fat, 4096).unwrap();

        chain.write(&mut device, 0, &[0xAA; 4096]).unwrap();
        chain.write(&mut device, 100, &[0xBB; 8]).unwrap();

        let mut read_back = vec![0u8; 4096];
        chain.read(&mut device, 0, &mut read_back).unwrap();
        assert_eq!(&read_back[..100], &[0xAA; 100][..]);
        assert_eq!(&read_back[100..108], &[0xBB; 8][..]);
        assert_eq!(&read_back[108..], &[0xAA; 3988][..]);
    }

    #[test]
    fn reopen_follows_fat() {
        let mut device = format_volume(16 * 1024 * 1024);
        let (boot, mut fat) = open_volume(&mut device);

        let mut chain = ClusterChain::open(&mut device, &fat, &boot, 0).unwrap();
        chain.set_length(&mut device, &mut fat, 2 * 4096).unwrap();
        chain.write(&mut device, 8000, &[0x42; 96]).unwrap();
        let start = chain.first_cluster();

        let reopened = ClusterChain::open(&mut device, &fat, &boot, start).unwrap();
        assert_eq!(reopened.cluster_count(), 2);

        let mut read_back = vec![0u8; 96];
        reopened.read(&mut device, 8000, &mut read_back).unwrap();
        assert_eq!(read_back, [0x42; 96]);
    }
}
