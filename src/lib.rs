//! FAT32 file system access for USB mass storage devices speaking SCSI
//! over the Bulk-Only Transport.
//!
//! The transport itself is injected: implement [`UsbCommunication`] on top
//! of whatever USB stack opens the device and claims the interface, then
//! hand it to [`open_device`] together with the endpoint configuration.
//! Everything above that — SCSI framing, MBR, FAT, directories, files —
//! lives here. The block layer is also usable standalone through
//! [`BlockDevice`], which is how the tests run against memory instead of
//! hardware.

use std::fmt;

mod boot_sector;
mod chain;
mod entry;
mod fat;
mod fs;
mod partition;
mod scsi;
#[cfg(test)]
pub(crate) mod testutil;
mod utils;

pub use boot_sector::Fat32BootSector;
pub use fs::{FatDirectory, FatFile, FileSystem, UsbFile, PATH_SEPARATOR};
pub use partition::{Partition, PartitionTable, PartitionTableEntry};
pub use scsi::ScsiBlockDevice;

#[cfg(target_endian = "big")]
compile_error!("Big-endian not supported");

/// Bulk transfer timeout implementers of [`UsbCommunication`] are expected
/// to apply when the host stack wants one, in milliseconds.
pub const DEFAULT_TRANSFER_TIMEOUT_MS: u32 = 21_000;

pub type Result<T> = std::result::Result<T, Error>;

#[derive(Debug)]
pub enum Error {
    /// Bulk or control transfer failure, including timeouts.
    Transport(TransportError),
    /// The device reported a command failure in the status wrapper.
    Scsi(ScsiError),
    /// Bad signatures, impossible geometry, broken chains.
    InvalidFormat(&'static str),
    /// No free clusters left.
    OutOfSpace,
    /// Name collision on create, move or rename.
    AlreadyExists,
    /// Path resolution miss for an operation that requires the target.
    NotFound,
    IsDirectory,
    NotDirectory,
    /// The operation is not applicable to the root directory.
    ReadOnly,
    /// Move between two different file system instances.
    CrossFileSystem,
    Unsupported(&'static str),
}

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Transport(err) => write!(f, "transport error: {err}"),
            Self::Scsi(err) => write!(f, "{err}"),
            Self::InvalidFormat(what) => write!(f, "invalid format: {what}"),
            Self::OutOfSpace => write!(f, "no free clusters left"),
            Self::AlreadyExists => write!(f, "item already exists"),
            Self::NotFound => write!(f, "no such file or directory"),
            Self::IsDirectory => write!(f, "is a directory"),
            Self::NotDirectory => write!(f, "not a directory"),
            Self::ReadOnly => write!(f, "operation not permitted on the root directory"),
            Self::CrossFileSystem => write!(f, "cannot move between file systems"),
            Self::Unsupported(what) => write!(f, "unsupported: {what}"),
        }
    }
}

impl std::error::Error for Error {}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransportError {
    Timeout,
    /// The endpoint stalled.
    Stall,
    Io,
    /// Fewer bytes moved than the protocol requires.
    ShortTransfer,
    /// Malformed wrapper: bad signature or tag mismatch.
    Protocol,
}

impl fmt::Display for TransportError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Timeout => write!(f, "transfer timed out"),
            Self::Stall => write!(f, "endpoint stalled"),
            Self::Io => write!(f, "bulk transfer failed"),
            Self::ShortTransfer => write!(f, "short transfer"),
            Self::Protocol => write!(f, "protocol violation"),
        }
    }
}

/// A failed SCSI command: the CSW status plus, when REQUEST SENSE worked,
/// the sense triple describing why.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ScsiError {
    /// 1 = command failed, 2 = phase error.
    pub status: u8,
    pub sense: Option<SenseData>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SenseData {
    pub key: u8,
    pub asc: u8,
    pub ascq: u8,
}

impl fmt::Display for ScsiError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "SCSI command failed with status {}", self.status)?;
        if let Some(sense) = &self.sense {
            write!(
                f,
                " (sense key 0x{:02X}, asc 0x{:02X}, ascq 0x{:02X})",
                sense.key, sense.asc, sense.ascq
            )?;
        }
        Ok(())
    }
}

/// The injected USB transport: a claimed mass-storage interface with one
/// bulk endpoint pair. Implementers own device opening, endpoint selection
/// and timeouts ([`DEFAULT_TRANSFER_TIMEOUT_MS`] is the conventional
/// choice).
pub trait UsbCommunication {
    fn bulk_out(&mut self, data: &[u8]) -> std::result::Result<usize, TransportError>;

    fn bulk_in(&mut self, buffer: &mut [u8]) -> std::result::Result<usize, TransportError>;

    fn control_transfer(
        &mut self,
        request_type: u8,
        request: u8,
        value: u16,
        index: u16,
        data: &mut [u8],
    ) -> std::result::Result<usize, TransportError>;

    fn clear_feature_halt(&mut self, endpoint: u8) -> std::result::Result<(), TransportError>;
}

/// Block-aligned byte access: offsets and lengths must be multiples of
/// [`block_size`](Self::block_size).
pub trait BlockDevice {
    fn read(&mut self, device_offset: u64, dest: &mut [u8]) -> Result<()>;

    fn write(&mut self, device_offset: u64, src: &[u8]) -> Result<()>;

    fn block_size(&self) -> u32;
}

/// Addressing of one mass storage function on the bus.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct UsbMassStorageDeviceConfig {
    pub vendor_id: u16,
    pub product_id: u16,
    pub interface_number: u8,
    pub in_endpoint_address: u8,
    pub out_endpoint_address: u8,
    pub lun: u8,
}

impl UsbMassStorageDeviceConfig {
    /// LUN defaults to 0, which is what single-LUN sticks expose.
    pub fn new(
        vendor_id: u16,
        product_id: u16,
        interface_number: u8,
        in_endpoint_address: u8,
        out_endpoint_address: u8,
    ) -> Self {
        Self {
            vendor_id,
            product_id,
            interface_number,
            in_endpoint_address,
            out_endpoint_address,
            lun: 0,
        }
    }
}

/// Full bring-up of a mass storage device: SCSI initialization, partition
/// table parse, FAT32 detection, mount. Returns the mounted file system
/// with its root directory ready.
pub fn open_device<C: UsbCommunication + 'static>(
    comm: C,
    config: UsbMassStorageDeviceConfig,
) -> Result<FileSystem> {
    let mut device = ScsiBlockDevice::new(comm, config);
    device.init()?;

    let table = PartitionTable::read(&mut device)?;
    let entry = table.find_fat32()?;
    log::debug!(
        "FAT32 partition (type 0x{:02X}) at LBA {}, {} sectors",
        entry.partition_type,
        entry.first_lba,
        entry.sector_count
    );

    FileSystem::mount(Partition::new(device, entry))
}

#[cfg(test)]
fn test_volume() -> (testutil::RamDevice, FileSystem) {
    let device = testutil::format_volume(64 * 1024 * 1024);
    let fs = FileSystem::mount(device.clone()).unwrap();
    (device, fs)
}

#[test]
fn list_empty_root() {
    let (_, fs) = test_volume();
    assert_eq!(fs.volume_label(), testutil::TEST_VOLUME_LABEL);
    assert_eq!(fs.root_directory().list().unwrap(), Vec::<String>::new());
}

#[test]
fn create_write_remount_read() {
    let device = testutil::format_volume(64 * 1024 * 1024);

    {
        let fs = FileSystem::mount(device.clone()).unwrap();
        let mut file = fs.root_directory().create_file("hello.txt").unwrap();
        file.write(0, b"Hello").unwrap();
        file.flush().unwrap();
    }

    let fs = FileSystem::mount(device.clone()).unwrap();
    assert_eq!(fs.root_directory().list().unwrap(), vec!["hello.txt"]);

    let mut file = fs.open("hello.txt").unwrap().into_file().unwrap();
    assert_eq!(file.length(), 5);
    let mut contents = [0u8; 5];
    assert_eq!(file.read(0, &mut contents).unwrap(), 5);
    assert_eq!(&contents, b"Hello");

    // the short entry on disk carries the generated 8.3 name
    let mut raw = device.clone();
    let boot = Fat32BootSector::read(&mut raw).unwrap();
    let mut root_cluster = vec![0u8; boot.bytes_per_cluster() as usize];
    raw.read(boot.data_area_offset(), &mut root_cluster).unwrap();
    assert!(root_cluster
        .chunks(32)
        .any(|record| &record[0..11] == b"HELLO   TXT"));
}

#[test]
fn hundred_files_grow_the_root() {
    let device = testutil::format_volume(64 * 1024 * 1024);

    {
        let fs = FileSystem::mount(device.clone()).unwrap();
        let root = fs.root_directory();
        for index in 0..100 {
            root.create_file(&format!("f{index:03}.txt")).unwrap();
        }
        assert_eq!(root.list().unwrap().len(), 100);
    }

    // 100 records spill past one 4 KiB cluster; the table must persist
    let fs = FileSystem::mount(device.clone()).unwrap();
    let names = fs.root_directory().list().unwrap();
    assert_eq!(names.len(), 100);
    assert!(names.contains(&"f042.txt".to_string()));

    let mut raw = device.clone();
    let boot = Fat32BootSector::read(&mut raw).unwrap();
    let fat = crate::fat::Fat::open(&mut raw, &boot).unwrap();
    let root_chain = fat.chain(&mut raw, boot.root_dir_cluster()).unwrap();
    assert_eq!(root_chain.len(), 2);
}

#[test]
fn colliding_names_get_numeric_tails() {
    let (device, fs) = test_volume();
    let root = fs.root_directory();
    for index in 0..4 {
        root.create_file(&format!("collision test {index}.txt"))
            .unwrap();
    }

    let mut raw = device.clone();
    let boot = Fat32BootSector::read(&mut raw).unwrap();
    let mut root_cluster = vec![0u8; boot.bytes_per_cluster() as usize];
    raw.read(boot.data_area_offset(), &mut root_cluster).unwrap();

    for short in [b"COLLISIOTXT", b"COLLIS~1TXT", b"COLLIS~2TXT", b"COLLIS~3TXT"] {
        assert!(
            root_cluster.chunks(32).any(|record| &record[0..11] == short),
            "missing short name {:?}",
            String::from_utf8_lossy(short)
        );
    }
}

#[test]
fn move_file_into_directory() {
    let (device, fs) = test_volume();
    let root = fs.root_directory();
    root.create_file("hello.txt").unwrap();
    let directory = root.create_directory("d").unwrap();

    let mut file = fs.open("hello.txt").unwrap().into_file().unwrap();
    file.move_to(&directory).unwrap();

    assert_eq!(root.list().unwrap(), vec!["d"]);
    assert!(fs.open("/d/hello.txt").is_ok());
    assert!(matches!(fs.open("hello.txt"), Err(Error::NotFound)));

    // the dotdot entry of a directory under the root points at cluster 0
    let mut raw = device.clone();
    let boot = Fat32BootSector::read(&mut raw).unwrap();
    let offset = boot.data_area_offset()
        + u64::from(directory.first_cluster() - 2) * u64::from(boot.bytes_per_cluster());
    let mut cluster = vec![0u8; boot.bytes_per_cluster() as usize];
    raw.read(offset, &mut cluster).unwrap();

    let dotdot = &cluster[32..64];
    assert_eq!(&dotdot[0..11], b"..         ");
    assert_eq!(&dotdot[20..22], &[0, 0]); // start cluster high
    assert_eq!(&dotdot[26..28], &[0, 0]); // start cluster low
}

#[test]
fn shrink_frees_clusters_for_reuse() {
    let (_, fs) = test_volume();
    let root = fs.root_directory();

    let pattern: Vec<u8> = (0..10 * 1024 * 1024).map(|i| (i % 251) as u8).collect();
    let mut big = root.create_file("big.bin").unwrap();
    big.write(0, &pattern).unwrap();
    big.flush().unwrap();

    let free_before_shrink = fs.free_space();
    big.set_length(2 * 1024 * 1024).unwrap();
    big.flush().unwrap();
    assert_eq!(big.length(), 2 * 1024 * 1024);
    assert_eq!(fs.free_space(), free_before_shrink + 8 * 1024 * 1024);

    // a subsequent allocation picks the freed clusters back up
    let free_before_extra = fs.free_space();
    let mut extra = root.create_file("extra.bin").unwrap();
    extra.write(0, &vec![0x5A; 1024 * 1024]).unwrap();
    extra.flush().unwrap();
    assert_eq!(fs.free_space(), free_before_extra - 1024 * 1024);

    // and the survivor's data is untouched
    let mut contents = vec![0u8; 2 * 1024 * 1024];
    assert_eq!(big.read(0, &mut contents).unwrap(), 2 * 1024 * 1024);
    assert_eq!(contents, pattern[..2 * 1024 * 1024]);
}

#[test]
fn rename_to_long_unicode_name() {
    let device = testutil::format_volume(64 * 1024 * 1024);

    // exactly 200 UTF-16 code units, starting with U+4E2D U+6587
    let mut long_name = String::from("\u{4e2d}\u{6587}");
    long_name.extend(std::iter::repeat('x').take(194));
    long_name.push_str(".txt");
    assert_eq!(long_name.encode_utf16().count(), 200);

    {
        let fs = FileSystem::mount(device.clone()).unwrap();
        let root = fs.root_directory();
        root.create_file("a.txt").unwrap();

        let mut file = fs.open("a.txt").unwrap().into_file().unwrap();
        file.set_name(&long_name).unwrap();
        assert_eq!(root.list().unwrap(), vec![long_name.clone()]);
    }

    // survives a remount, so the checksum bound the LFN run to its entry
    let fs = FileSystem::mount(device.clone()).unwrap();
    assert_eq!(fs.root_directory().list().unwrap(), vec![long_name]);

    // ceil(200 / 13) = 16 LFN entries ahead of the short entry
    let mut raw = device.clone();
    let boot = Fat32BootSector::read(&mut raw).unwrap();
    let mut root_cluster = vec![0u8; boot.bytes_per_cluster() as usize];
    raw.read(boot.data_area_offset(), &mut root_cluster).unwrap();
    let lfn_entries = root_cluster
        .chunks(32)
        .filter(|record| record[0] != 0 && record[0] != 0xE5 && record[11] == 0x0F)
        .count();
    assert_eq!(lfn_entries, 16);
}

#[test]
fn case_insensitive_lookup() {
    let (_, fs) = test_volume();
    let root = fs.root_directory();
    let sub = root.create_directory("Photos").unwrap();
    sub.create_file("Vacation.JPG").unwrap();

    assert!(fs.open("photos/vacation.jpg").is_ok());
    assert!(fs.open("PHOTOS/VACATION.jpg").is_ok());
    assert_eq!(
        fs.open("Photos").unwrap().into_directory().unwrap().list().unwrap(),
        vec!["Vacation.JPG"]
    );
}

#[test]
fn recursive_delete_restores_free_space() {
    let (_, fs) = test_volume();
    let root = fs.root_directory();
    let free_at_start = fs.free_space();

    let outer = root.create_directory("outer").unwrap();
    let inner = outer.create_directory("inner").unwrap();
    let mut file = inner.create_file("leaf.bin").unwrap();
    file.write(0, &[7u8; 10_000]).unwrap();
    file.flush().unwrap();
    assert!(fs.free_space() < free_at_start);

    outer.delete().unwrap();
    assert_eq!(root.list().unwrap(), Vec::<String>::new());
    assert!(fs.open("outer/inner/leaf.bin").is_err());
    assert_eq!(fs.free_space(), free_at_start);
}

#[test]
fn repeated_init_and_flush_are_stable() {
    let (_, fs) = test_volume();
    let root = fs.root_directory();
    let mut file = root.create_file("steady.txt").unwrap();
    file.write(0, b"state").unwrap();

    file.flush().unwrap();
    file.flush().unwrap();

    assert_eq!(root.list().unwrap(), vec!["steady.txt"]);
    assert_eq!(root.list().unwrap(), vec!["steady.txt"]);

    let mut contents = [0u8; 5];
    file.read(0, &mut contents).unwrap();
    assert_eq!(&contents, b"state");
}

#[test]
fn create_collision_rejected() {
    let (_, fs) = test_volume();
    let root = fs.root_directory();
    root.create_file("Unique.txt").unwrap();

    assert!(matches!(
        root.create_file("unique.TXT"),
        Err(Error::AlreadyExists)
    ));
    assert!(matches!(
        root.create_directory("UNIQUE.txt"),
        Err(Error::AlreadyExists)
    ));
}

#[test]
fn full_stack_over_mock_usb() {
    let image = testutil::format_device_image(16 * 1024 * 1024);
    let comm = testutil::MockUsbDevice::new(image, 512);
    let config = UsbMassStorageDeviceConfig::new(0x1234, 0x5678, 0, 0x81, 0x02);

    let fs = open_device(comm, config).unwrap();
    assert_eq!(fs.volume_label(), testutil::TEST_VOLUME_LABEL);

    let root = fs.root_directory();
    let payload: Vec<u8> = (0..20_000).map(|i| (i % 253) as u8).collect();
    let mut file = root.create_file("over-usb.bin").unwrap();
    file.write(0, &payload).unwrap();
    file.flush().unwrap();

    let mut file = fs.open("over-usb.bin").unwrap().into_file().unwrap();
    let mut contents = vec![0u8; payload.len()];
    assert_eq!(file.read(0, &mut contents).unwrap(), payload.len());
    assert_eq!(contents, payload);
}
