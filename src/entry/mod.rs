use arbitrary_int::{u2, u4, u5, u6, u7};
use bitbybit::bitfield;
use bytemuck::{Pod, Zeroable};
use static_assertions::const_assert;
use time::macros::{date, time};
use time::{Date, Month, PrimitiveDateTime, Time};

pub mod lfn;
pub mod short_name;

use short_name::ShortName;

/// First name byte of an entry that has been deleted.
pub const DELETED_MARKER: u8 = 0xE5;
/// Stored in the first name byte when the real value would be 0xE5 (Kanji).
pub const KANJI_MARKER: u8 = 0x05;

#[bitfield(u8)]
#[derive(Zeroable, Pod, PartialEq)]
pub struct Attributes {
    #[bit(0, rw)]
    read_only: bool,

    #[bit(1, rw)]
    hidden: bool,

    #[bit(2, rw)]
    system: bool,

    #[bit(3, rw)]
    volume_label: bool,

    #[bit(4, rw)]
    directory: bool,

    #[bit(5, rw)]
    archive: bool,

    #[bits(6..=7, rw)]
    reserved: u2,
}

/// The `day` field counts from 1; a value of 0 is produced by some
/// implementations for "no date" and is mapped to the epoch on decode.
#[bitfield(u16)]
struct DosDate {
    #[bits(0..=4, rw)]
    day: u5,

    #[bits(5..=8, rw)]
    month: u4,

    /// Years since 1980; 0 represents 1980 and 127 represents 2107.
    #[bits(9..=15, rw)]
    year: u7,
}

#[bitfield(u16)]
struct DosTime {
    /// Two-second multiples, 0..=29.
    #[bits(0..=4, rw)]
    double_seconds: u5,

    #[bits(5..=10, rw)]
    minute: u6,

    #[bits(11..=15, rw)]
    hour: u5,
}

/// A regular 8.3 directory entry, 32 bytes on disk.
#[derive(Clone, Copy, Zeroable, Pod, PartialEq)]
#[repr(C)]
pub struct FatDirectoryEntry {
    name: [u8; 11],
    attributes: Attributes,
    nt_reserved: u8,
    creation_time_tenths: u8,
    creation_time: u16,
    creation_date: u16,
    last_access_date: u16,
    first_cluster_high: u16,
    last_write_time: u16,
    last_write_date: u16,
    first_cluster_low: u16,
    file_size: u32,
}

const_assert!(core::mem::size_of::<FatDirectoryEntry>() == FatDirectoryEntry::SIZE);

impl FatDirectoryEntry {
    pub const SIZE: usize = 32;

    pub fn new(short_name: ShortName, attributes: Attributes) -> Self {
        let mut entry = Self::zeroed();
        entry.name = short_name.bytes();
        entry.attributes = attributes;
        entry.set_created_at(now());
        entry.set_last_modified(now());
        entry.set_last_accessed(now());
        entry
    }

    pub fn create_volume_label(label: &str) -> Self {
        let mut entry = Self::zeroed();
        entry.name = [b' '; 11];
        for (out, byte) in entry.name.iter_mut().zip(label.bytes()) {
            *out = byte;
        }
        entry.attributes = Attributes::new_with_raw_value(0).with_volume_label(true);
        entry
    }

    pub fn parse(bytes: &[u8]) -> Self {
        bytemuck::pod_read_unaligned(&bytes[..Self::SIZE])
    }

    pub fn serialize(&self, out: &mut Vec<u8>) {
        out.extend_from_slice(bytemuck::bytes_of(self));
    }

    pub fn attributes(&self) -> Attributes {
        self.attributes
    }

    pub fn is_lfn_entry(&self) -> bool {
        self.attributes.raw_value() & 0x3F == 0x0F
    }

    pub fn is_directory(&self) -> bool {
        self.attributes.directory()
    }

    pub fn is_volume_label(&self) -> bool {
        !self.is_lfn_entry() && self.attributes.volume_label()
    }

    pub fn is_hidden(&self) -> bool {
        self.attributes.hidden()
    }

    pub fn is_deleted(&self) -> bool {
        self.name[0] == DELETED_MARKER
    }

    /// A zeroed first name byte marks the end of the entry table.
    pub fn is_end(&self) -> bool {
        self.name[0] == 0
    }

    pub fn set_directory(&mut self) {
        self.attributes = self.attributes.with_directory(true);
    }

    pub fn short_name(&self) -> ShortName {
        ShortName::from_bytes(self.name)
    }

    pub fn set_short_name(&mut self, short_name: ShortName) {
        self.name = short_name.bytes();
    }

    pub fn volume_label(&self) -> String {
        let end = self.name.iter().rposition(|&b| b != b' ').map_or(0, |i| i + 1);
        self.name[..end].iter().map(|&b| b as char).collect()
    }

    pub fn start_cluster(&self) -> u32 {
        u32::from(self.first_cluster_high) << 16 | u32::from(self.first_cluster_low)
    }

    pub fn set_start_cluster(&mut self, cluster: u32) {
        self.first_cluster_high = (cluster >> 16) as u16;
        self.first_cluster_low = cluster as u16;
    }

    pub fn file_size(&self) -> u32 {
        self.file_size
    }

    pub fn set_file_size(&mut self, size: u32) {
        self.file_size = size;
    }

    pub fn created_at(&self) -> PrimitiveDateTime {
        decode_timestamp(
            self.creation_date,
            self.creation_time,
            self.creation_time_tenths,
        )
    }

    pub fn set_created_at(&mut self, timestamp: PrimitiveDateTime) {
        let (date, time, tenths) = encode_timestamp(timestamp);
        self.creation_date = date;
        self.creation_time = time;
        self.creation_time_tenths = tenths;
    }

    pub fn last_modified(&self) -> PrimitiveDateTime {
        decode_timestamp(self.last_write_date, self.last_write_time, 0)
    }

    pub fn set_last_modified(&mut self, timestamp: PrimitiveDateTime) {
        let (date, time, _) = encode_timestamp(timestamp);
        self.last_write_date = date;
        self.last_write_time = time;
    }

    pub fn last_accessed(&self) -> PrimitiveDateTime {
        decode_timestamp(self.last_access_date, 0, 0)
    }

    pub fn set_last_accessed(&mut self, timestamp: PrimitiveDateTime) {
        let (date, _, _) = encode_timestamp(timestamp);
        self.last_access_date = date;
    }
}

impl core::fmt::Debug for FatDirectoryEntry {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("FatDirectoryEntry")
            .field("short_name", &self.short_name().to_string())
            .field("attributes", &self.attributes.raw_value())
            .field("start_cluster", &self.start_cluster())
            .field("file_size", &self.file_size())
            .finish()
    }
}

pub(crate) fn now() -> PrimitiveDateTime {
    let now = time::OffsetDateTime::now_utc();
    PrimitiveDateTime::new(now.date(), now.time())
}

fn encode_timestamp(timestamp: PrimitiveDateTime) -> (u16, u16, u8) {
    let year = timestamp.year().clamp(1980, 2107) - 1980;
    let date = DosDate::new_with_raw_value(0)
        .with_year(u7::new(year as u8))
        .with_month(u4::new(timestamp.month() as u8))
        .with_day(u5::new(timestamp.day()));

    let time = DosTime::new_with_raw_value(0)
        .with_hour(u5::new(timestamp.hour()))
        .with_minute(u6::new(timestamp.minute()))
        .with_double_seconds(u5::new(timestamp.second() / 2));

    let tenths =
        (timestamp.second() % 2) * 100 + (timestamp.millisecond() / 10).min(99) as u8;

    (date.raw_value(), time.raw_value(), tenths)
}

fn decode_timestamp(raw_date: u16, raw_time: u16, tenths: u8) -> PrimitiveDateTime {
    let raw_date = DosDate::new_with_raw_value(raw_date);
    let raw_time = DosTime::new_with_raw_value(raw_time);

    let year = 1980 + i32::from(raw_date.year().value());
    let month = Month::try_from(raw_date.month().value()).unwrap_or(Month::January);
    let date =
        Date::from_calendar_date(year, month, raw_date.day().value().max(1)).unwrap_or(date!(1980 - 01 - 01));

    let tenths = tenths.min(199);
    let second = (raw_time.double_seconds().value() * 2 + tenths / 100).min(59);
    let millisecond = u16::from(tenths % 100) * 10;
    let time = Time::from_hms_milli(
        raw_time.hour().value().min(23),
        raw_time.minute().value().min(59),
        second,
        millisecond,
    )
    .unwrap_or(time!(0:00));

    PrimitiveDateTime::new(date, time)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn on_disk_layout() {
        let mut entry = FatDirectoryEntry::new(
            ShortName::from_name_and_extension("HELLO", "TXT"),
            Attributes::new_with_raw_value(0).with_archive(true),
        );
        entry.set_start_cluster(0x0004_0003);
        entry.set_file_size(1234);

        let mut bytes = Vec::new();
        entry.serialize(&mut bytes);
        assert_eq!(bytes.len(), 32);
        assert_eq!(&bytes[0..11], b"HELLO   TXT");
        assert_eq!(bytes[11], 0x20);
        assert_eq!(&bytes[20..22], &0x0004u16.to_le_bytes()); // cluster high
        assert_eq!(&bytes[26..28], &0x0003u16.to_le_bytes()); // cluster low
        assert_eq!(&bytes[28..32], &1234u32.to_le_bytes());
    }

    #[test]
    fn parse_round_trip() {
        let mut entry = FatDirectoryEntry::new(
            ShortName::from_name_and_extension("ROUND", "BIN"),
            Attributes::new_with_raw_value(0).with_archive(true),
        );
        entry.set_start_cluster(77);
        entry.set_file_size(99);

        let mut bytes = Vec::new();
        entry.serialize(&mut bytes);
        assert_eq!(FatDirectoryEntry::parse(&bytes), entry);
    }

    #[test]
    fn timestamp_round_trip() {
        let timestamp = PrimitiveDateTime::new(date!(2024 - 06 - 15), time!(13:37:42.130));
        let mut entry = FatDirectoryEntry::new(
            ShortName::from_name_and_extension("TS", ""),
            Attributes::new_with_raw_value(0),
        );
        entry.set_created_at(timestamp);
        assert_eq!(entry.created_at(), timestamp);

        // last-write has two-second resolution
        entry.set_last_modified(timestamp);
        assert_eq!(
            entry.last_modified(),
            PrimitiveDateTime::new(date!(2024 - 06 - 15), time!(13:37:42))
        );
    }

    #[test]
    fn years_clamp_to_dos_range() {
        let ancient = PrimitiveDateTime::new(date!(1970 - 01 - 01), time!(0:00));
        let (raw_date, _, _) = encode_timestamp(ancient);
        assert_eq!(decode_timestamp(raw_date, 0, 0).year(), 1980);
    }

    #[test]
    fn volume_label_entry() {
        let entry = FatDirectoryEntry::create_volume_label("TESTVOL");
        assert!(entry.is_volume_label());
        assert!(!entry.is_lfn_entry());
        assert_eq!(entry.volume_label(), "TESTVOL");
    }

    #[test]
    fn deleted_and_end_markers() {
        let mut entry = FatDirectoryEntry::new(
            ShortName::from_name_and_extension("GONE", ""),
            Attributes::new_with_raw_value(0),
        );
        entry.name[0] = DELETED_MARKER;
        assert!(entry.is_deleted());

        assert!(FatDirectoryEntry::zeroed().is_end());
    }
}
