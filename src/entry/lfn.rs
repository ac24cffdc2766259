use bytemuck::{Pod, Zeroable};
use itertools::Itertools;
use static_assertions::const_assert;

use super::short_name::ShortName;
use super::FatDirectoryEntry;

/// OR-ed into the sequence number of the physically-first (logically last)
/// entry of a long name.
const LAST_ENTRY_FLAG: u8 = 0x40;
const SEQUENCE_MASK: u8 = 0x3F;

const CHARS_PER_ENTRY: usize = 13;
pub const MAX_NAME_LENGTH: usize = 255;

const LFN_ATTRIBUTES: u8 = 0x0F;

/// One 32-byte long-file-name pseudo-entry carrying 13 UCS-2 code units.
#[derive(Clone, Copy, Zeroable, Pod)]
#[repr(C, packed)]
pub(crate) struct RawLfnEntry {
    sequence: u8,
    name1: [u16; 5],
    attributes: u8,
    entry_type: u8,
    checksum: u8,
    name2: [u16; 6],
    first_cluster: u16,
    name3: [u16; 2],
}

const_assert!(core::mem::size_of::<RawLfnEntry>() == FatDirectoryEntry::SIZE);

impl RawLfnEntry {
    pub(crate) fn parse(bytes: &[u8]) -> Self {
        bytemuck::pod_read_unaligned(&bytes[..FatDirectoryEntry::SIZE])
    }

    fn new(sequence: u8, units: &[u16], checksum: u8) -> Self {
        let mut entry = Self::zeroed();
        entry.sequence = sequence;
        entry.attributes = LFN_ATTRIBUTES;
        entry.checksum = checksum;

        let mut padded = [0xFFFFu16; CHARS_PER_ENTRY];
        padded[..units.len()].copy_from_slice(units);
        if units.len() < CHARS_PER_ENTRY {
            padded[units.len()] = 0;
        }

        entry.name1 = padded[0..5].try_into().unwrap();
        entry.name2 = padded[5..11].try_into().unwrap();
        entry.name3 = padded[11..13].try_into().unwrap();
        entry
    }

    fn units(&self) -> [u16; CHARS_PER_ENTRY] {
        let mut units = [0u16; CHARS_PER_ENTRY];
        let (name1, name2, name3) = (self.name1, self.name2, self.name3);
        units[0..5].copy_from_slice(&name1);
        units[5..11].copy_from_slice(&name2);
        units[11..13].copy_from_slice(&name3);
        units
    }
}

/// A logical directory record: the Unicode name spread over a run of LFN
/// entries, bound by checksum to the trailing short entry that carries the
/// actual metadata.
#[derive(Clone, Debug)]
pub struct FatLfnDirectoryEntry {
    /// Absent for pure 8.3 records and for dot entries; the name then comes
    /// from the short entry.
    name: Option<String>,
    entry: FatDirectoryEntry,
}

impl FatLfnDirectoryEntry {
    pub fn new(name: Option<&str>, short_name: ShortName) -> Self {
        Self {
            name: name.map(str::to_owned),
            entry: FatDirectoryEntry::new(short_name, super::Attributes::new_with_raw_value(0)),
        }
    }

    /// Builds the logical record from a short entry and the LFN entries that
    /// preceded it in the stream (physical order, highest sequence first).
    /// A checksum mismatch discards the long name and falls back to 8.3.
    pub(crate) fn from_parts(entry: FatDirectoryEntry, lfn_entries: &[RawLfnEntry]) -> Self {
        if lfn_entries.is_empty() {
            return Self { name: None, entry };
        }

        let expected = entry.short_name().checksum();
        if lfn_entries.iter().any(|lfn| lfn.checksum != expected) {
            log::warn!(
                "long name checksum mismatch for {}, falling back to the short name",
                entry.short_name()
            );
            return Self { name: None, entry };
        }

        let mut units = Vec::with_capacity(lfn_entries.len() * CHARS_PER_ENTRY);
        for lfn in lfn_entries
            .iter()
            .sorted_by_key(|lfn| lfn.sequence & SEQUENCE_MASK)
        {
            units.extend(lfn.units());
        }
        if let Some(terminator) = units.iter().position(|&unit| unit == 0) {
            units.truncate(terminator);
        }

        Self {
            name: Some(String::from_utf16_lossy(&units)),
            entry,
        }
    }

    /// Number of 32-byte entries this record occupies on disk.
    pub fn entry_count(&self) -> usize {
        match &self.name {
            Some(name) => {
                let units = name.encode_utf16().count();
                crate::utils::unsigned_rounded_up_div(units, CHARS_PER_ENTRY) + 1
            }
            None => 1,
        }
    }

    pub fn serialize(&self, out: &mut Vec<u8>) {
        if let Some(name) = &self.name {
            let units: Vec<u16> = name.encode_utf16().collect();
            let checksum = self.entry.short_name().checksum();

            let chunks: Vec<&[u16]> = units.chunks(CHARS_PER_ENTRY).collect();
            for (index, chunk) in chunks.iter().enumerate().rev() {
                let mut sequence = (index + 1) as u8;
                if index == chunks.len() - 1 {
                    sequence |= LAST_ENTRY_FLAG;
                }
                out.extend_from_slice(bytemuck::bytes_of(&RawLfnEntry::new(
                    sequence, chunk, checksum,
                )));
            }
        }

        self.entry.serialize(out);
    }

    pub fn name(&self) -> String {
        match &self.name {
            Some(name) => name.clone(),
            None => self.entry.short_name().to_string(),
        }
    }

    pub fn set_name(&mut self, name: &str, short_name: ShortName) {
        self.name = Some(name.to_owned());
        self.entry.set_short_name(short_name);
    }

    pub fn entry(&self) -> &FatDirectoryEntry {
        &self.entry
    }

    pub fn entry_mut(&mut self) -> &mut FatDirectoryEntry {
        &mut self.entry
    }

    pub fn is_directory(&self) -> bool {
        self.entry.is_directory()
    }

    pub fn start_cluster(&self) -> u32 {
        self.entry.start_cluster()
    }

    pub fn set_start_cluster(&mut self, cluster: u32) {
        self.entry.set_start_cluster(cluster);
    }

    pub fn file_size(&self) -> u32 {
        self.entry.file_size()
    }

    pub fn copy_date_time_from(&mut self, other: &FatLfnDirectoryEntry) {
        self.entry.set_created_at(other.entry.created_at());
        self.entry.set_last_modified(other.entry.last_modified());
        self.entry.set_last_accessed(other.entry.last_accessed());
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::entry::short_name::generate_short_name;
    use std::collections::HashSet;

    fn parse_back(serialized: &[u8]) -> FatLfnDirectoryEntry {
        let mut pending = Vec::new();
        for chunk in serialized.chunks(FatDirectoryEntry::SIZE) {
            let entry = FatDirectoryEntry::parse(chunk);
            if entry.is_lfn_entry() {
                pending.push(RawLfnEntry::parse(chunk));
            } else {
                return FatLfnDirectoryEntry::from_parts(entry, &pending);
            }
        }
        panic!("no short entry in stream");
    }

    #[test]
    fn serialize_layout() {
        let short_name = generate_short_name("hello world document.txt", &HashSet::new());
        let record = FatLfnDirectoryEntry::new(Some("hello world document.txt"), short_name);

        // 24 UTF-16 units -> 2 LFN entries + the short entry
        assert_eq!(record.entry_count(), 3);

        let mut bytes = Vec::new();
        record.serialize(&mut bytes);
        assert_eq!(bytes.len(), 3 * 32);

        // physically first entry carries the highest sequence plus the flag
        assert_eq!(bytes[0], 2 | LAST_ENTRY_FLAG);
        assert_eq!(bytes[11], LFN_ATTRIBUTES);
        assert_eq!(bytes[32], 1);
        assert_eq!(bytes[32 + 13], short_name.checksum());
        // start cluster field of an LFN entry is zero
        assert_eq!(&bytes[26..28], &[0, 0]);
    }

    #[test]
    fn round_trip() {
        let name = "Mixed Case Name With Spaces.tar.gz";
        let short_name = generate_short_name(name, &HashSet::new());
        let record = FatLfnDirectoryEntry::new(Some(name), short_name);

        let mut bytes = Vec::new();
        record.serialize(&mut bytes);

        let parsed = parse_back(&bytes);
        assert_eq!(parsed.name(), name);
        assert_eq!(parsed.entry().short_name(), short_name);
    }

    #[test]
    fn round_trip_exact_multiple() {
        // exactly 13 units: no terminator, no padding
        let name = "thirteen.unit";
        assert_eq!(name.encode_utf16().count(), 13);

        let short_name = generate_short_name(name, &HashSet::new());
        let record = FatLfnDirectoryEntry::new(Some(name), short_name);
        assert_eq!(record.entry_count(), 2);

        let mut bytes = Vec::new();
        record.serialize(&mut bytes);
        assert_eq!(parse_back(&bytes).name(), name);
    }

    #[test]
    fn round_trip_unicode() {
        let name = "\u{4e2d}\u{6587} documents \u{e9}t\u{e9}.txt";
        let short_name = generate_short_name(name, &HashSet::new());
        let record = FatLfnDirectoryEntry::new(Some(name), short_name);

        let mut bytes = Vec::new();
        record.serialize(&mut bytes);
        assert_eq!(parse_back(&bytes).name(), name);
    }

    #[test]
    fn checksum_mismatch_falls_back_to_short_name() {
        let name = "corrupted long name.txt";
        let short_name = generate_short_name(name, &HashSet::new());
        let record = FatLfnDirectoryEntry::new(Some(name), short_name);

        let mut bytes = Vec::new();
        record.serialize(&mut bytes);
        bytes[13] ^= 0xFF; // first LFN entry's checksum byte

        let parsed = parse_back(&bytes);
        assert_eq!(parsed.name(), short_name.to_string());
    }

    #[test]
    fn short_only_record() {
        let short_name = generate_short_name("plain.txt", &HashSet::new());
        let record = FatLfnDirectoryEntry::new(None, short_name);
        assert_eq!(record.entry_count(), 1);

        let mut bytes = Vec::new();
        record.serialize(&mut bytes);
        assert_eq!(bytes.len(), 32);
        assert_eq!(parse_back(&bytes).name(), "PLAIN.TXT");
    }
}
