use std::cell::RefCell;
use std::collections::{HashMap, HashSet};
use std::rc::Rc;

use time::PrimitiveDateTime;

use crate::boot_sector::Fat32BootSector;
use crate::chain::ClusterChain;
use crate::entry::lfn::{FatLfnDirectoryEntry, RawLfnEntry, MAX_NAME_LENGTH};
use crate::entry::short_name::{generate_short_name, ShortName};
use crate::entry::{self, FatDirectoryEntry};
use crate::fat::Fat;
use crate::{BlockDevice, Error, Result};

pub const PATH_SEPARATOR: char = '/';

/// Everything an operation needs to touch the volume: the partition-level
/// device, the parsed boot sector and the FAT. Shared by every handle of
/// one mounted file system; the host serializes operations (one in flight).
pub(crate) struct FsCore {
    pub(crate) device: Box<dyn BlockDevice>,
    pub(crate) boot: Fat32BootSector,
    pub(crate) fat: Fat,
}

type SharedCore = Rc<RefCell<FsCore>>;
type SharedEntry = Rc<RefCell<FatLfnDirectoryEntry>>;
type SharedDir = Rc<RefCell<DirInner>>;

/// FAT32 is case-preserving but case-insensitive; lookups go through this
/// locale-independent ASCII fold.
fn fold_name(name: &str) -> String {
    name.to_ascii_lowercase()
}

/// The cached, mutable state of one directory: its entry list in on-disk
/// order plus the two lookup indexes derived from it. The entry objects are
/// shared with the child handles created from them, so metadata updates by
/// a child are visible when this table is rewritten.
struct DirInner {
    /// None for the root directory.
    entry: Option<SharedEntry>,
    /// None for the root directory.
    parent: Option<SharedDir>,
    chain: Option<ClusterChain>,
    entries: Option<Vec<SharedEntry>>,
    lfn_map: HashMap<String, SharedEntry>,
    short_names: HashSet<ShortName>,
    volume_label: Option<String>,
}

impl DirInner {
    fn new(entry: Option<SharedEntry>, parent: Option<SharedDir>) -> Self {
        Self {
            entry,
            parent,
            chain: None,
            entries: None,
            lfn_map: HashMap::new(),
            short_names: HashSet::new(),
            volume_label: None,
        }
    }

    fn is_root(&self) -> bool {
        self.entry.is_none()
    }

    /// Idempotent: opens the cluster chain and reads the entry table exactly
    /// once. Freshly created directories arrive with both already in place.
    fn init(&mut self, core: &mut FsCore) -> Result<()> {
        if self.chain.is_none() {
            let start = match &self.entry {
                Some(entry) => entry.borrow().start_cluster(),
                None => core.boot.root_dir_cluster(),
            };
            self.chain = Some(ClusterChain::open(
                &mut *core.device,
                &core.fat,
                &core.boot,
                start,
            )?);
        }

        if self.entries.is_none() {
            self.entries = Some(Vec::new());
            self.read_entries(core)?;
        }

        Ok(())
    }

    fn read_entries(&mut self, core: &mut FsCore) -> Result<()> {
        let chain = self.chain.as_ref().unwrap();
        let mut buffer = vec![0u8; chain.length() as usize];
        chain.read(&mut *core.device, 0, &mut buffer)?;

        let mut pending: Vec<RawLfnEntry> = Vec::new();
        for record in buffer.chunks_exact(FatDirectoryEntry::SIZE) {
            let parsed = FatDirectoryEntry::parse(record);
            if parsed.is_end() {
                break;
            }
            if parsed.is_deleted() {
                pending.clear();
                continue;
            }
            if parsed.is_lfn_entry() {
                pending.push(RawLfnEntry::parse(record));
                continue;
            }
            if parsed.is_volume_label() {
                if !self.is_root() {
                    log::warn!("volume label entry outside the root directory");
                }
                self.volume_label = Some(parsed.volume_label());
                log::debug!("volume label: {:?}", self.volume_label);
                continue;
            }
            if parsed.is_hidden() {
                log::debug!("skipping hidden entry {}", parsed.short_name());
                continue;
            }

            let logical = FatLfnDirectoryEntry::from_parts(parsed, &pending);
            pending.clear();
            self.add_entry(Rc::new(RefCell::new(logical)));
        }

        Ok(())
    }

    fn add_entry(&mut self, entry: SharedEntry) {
        let (name, short_name) = {
            let entry = entry.borrow();
            (entry.name(), entry.entry().short_name())
        };
        self.entries.as_mut().unwrap().push(entry.clone());
        self.lfn_map.insert(fold_name(&name), entry);
        self.short_names.insert(short_name);
    }

    fn remove_entry(&mut self, entry: &SharedEntry) {
        let (name, short_name) = {
            let entry = entry.borrow();
            (entry.name(), entry.entry().short_name())
        };
        self.entries
            .as_mut()
            .unwrap()
            .retain(|candidate| !Rc::ptr_eq(candidate, entry));
        self.lfn_map.remove(&fold_name(&name));
        self.short_names.remove(&short_name);
    }

    fn find(&self, name: &str) -> Option<SharedEntry> {
        self.lfn_map.get(&fold_name(name)).cloned()
    }

    fn contains(&self, name: &str) -> bool {
        self.lfn_map.contains_key(&fold_name(name))
    }

    /// Serializes the whole table and writes it through the cluster chain:
    /// volume label first (root only), then every record's LFN run and
    /// short entry, then the zero sentinel when the table does not fill the
    /// chain. The chain is resized first and never drops below one cluster,
    /// so the sentinel stays addressable and the start cluster is stable.
    fn write(&mut self, core: &mut FsCore) -> Result<()> {
        let entries = self.entries.as_ref().unwrap();
        let write_volume_label = self.is_root() && self.volume_label.is_some();

        let mut total_entries: usize = entries
            .iter()
            .map(|entry| entry.borrow().entry_count())
            .sum();
        if write_volume_label {
            total_entries += 1;
        }
        let total_bytes = (total_entries * FatDirectoryEntry::SIZE) as u64;

        let chain = self.chain.as_mut().unwrap();
        chain.set_length(
            &mut *core.device,
            &mut core.fat,
            total_bytes.max(FatDirectoryEntry::SIZE as u64),
        )?;

        let mut buffer = Vec::with_capacity(chain.length() as usize);
        if write_volume_label {
            let label = self.volume_label.as_deref().unwrap();
            FatDirectoryEntry::create_volume_label(label).serialize(&mut buffer);
        }
        for entry in entries {
            entry.borrow().serialize(&mut buffer);
        }
        buffer.resize(chain.length() as usize, 0);

        chain.write(&mut *core.device, 0, &buffer)
    }

    fn rename_entry(&mut self, core: &mut FsCore, entry: &SharedEntry, new_name: &str) -> Result<()> {
        if entry.borrow().name() == new_name {
            return Ok(());
        }
        validate_name(new_name)?;
        if let Some(existing) = self.lfn_map.get(&fold_name(new_name)) {
            if !Rc::ptr_eq(existing, entry) {
                return Err(Error::AlreadyExists);
            }
        }

        self.remove_entry(entry);
        let short_name = generate_short_name(new_name, &self.short_names);
        entry.borrow_mut().set_name(new_name, short_name);
        self.add_entry(entry.clone());
        self.write(core)
    }
}

fn validate_name(name: &str) -> Result<()> {
    if name.is_empty() || name.encode_utf16().count() > MAX_NAME_LENGTH {
        return Err(Error::Unsupported("name length"));
    }
    Ok(())
}

/// A directory of the mounted file system. Handles are cheap to clone; all
/// of them talk to the same volume state.
#[derive(Clone)]
pub struct FatDirectory {
    core: SharedCore,
    inner: SharedDir,
}

impl FatDirectory {
    fn read_root(core: SharedCore) -> Result<Self> {
        let directory = Self {
            core,
            inner: Rc::new(RefCell::new(DirInner::new(None, None))),
        };
        directory.init()?;
        Ok(directory)
    }

    fn from_entry(core: SharedCore, entry: SharedEntry, parent: SharedDir) -> Self {
        Self {
            core,
            inner: Rc::new(RefCell::new(DirInner::new(Some(entry), Some(parent)))),
        }
    }

    fn init(&self) -> Result<()> {
        let mut inner = self.inner.borrow_mut();
        let mut core = self.core.borrow_mut();
        inner.init(&mut core)
    }

    pub fn is_root(&self) -> bool {
        self.inner.borrow().is_root()
    }

    #[cfg(test)]
    pub(crate) fn first_cluster(&self) -> u32 {
        let inner = self.inner.borrow();
        inner
            .entry
            .as_ref()
            .map(|entry| entry.borrow().start_cluster())
            .unwrap_or(0)
    }

    /// The empty string for the root directory.
    pub fn name(&self) -> String {
        match &self.inner.borrow().entry {
            Some(entry) => entry.borrow().name(),
            None => String::new(),
        }
    }

    pub(crate) fn volume_label(&self) -> Option<String> {
        self.inner.borrow().volume_label.clone()
    }

    pub fn parent(&self) -> Option<FatDirectory> {
        self.inner.borrow().parent.clone().map(|parent| FatDirectory {
            core: self.core.clone(),
            inner: parent,
        })
    }

    /// Names of the directory's children, excluding the dot entries.
    pub fn list(&self) -> Result<Vec<String>> {
        self.init()?;
        let inner = self.inner.borrow();
        Ok(inner
            .entries
            .as_ref()
            .unwrap()
            .iter()
            .map(|entry| entry.borrow().name())
            .filter(|name| name != "." && name != "..")
            .collect())
    }

    pub fn list_files(&self) -> Result<Vec<UsbFile>> {
        self.init()?;
        let inner = self.inner.borrow();
        let mut files = Vec::new();
        for entry in inner.entries.as_ref().unwrap() {
            let name = entry.borrow().name();
            if name == "." || name == ".." {
                continue;
            }
            files.push(self.wrap_entry(entry.clone()));
        }
        Ok(files)
    }

    fn wrap_entry(&self, entry: SharedEntry) -> UsbFile {
        if entry.borrow().is_directory() {
            UsbFile::Directory(FatDirectory::from_entry(
                self.core.clone(),
                entry,
                self.inner.clone(),
            ))
        } else {
            UsbFile::File(FatFile {
                core: self.core.clone(),
                entry,
                parent: self.inner.clone(),
                chain: None,
            })
        }
    }

    pub fn create_file(&self, name: &str) -> Result<FatFile> {
        let entry = self.create_entry(name, false)?;
        Ok(FatFile {
            core: self.core.clone(),
            entry,
            parent: self.inner.clone(),
            chain: None,
        })
    }

    pub fn create_directory(&self, name: &str) -> Result<FatDirectory> {
        let entry = self.create_entry(name, true)?;
        let start_cluster = entry.borrow().start_cluster();
        let parent_start = match &self.inner.borrow().entry {
            Some(own) => own.borrow().start_cluster(),
            None => 0, // dotdot points at cluster 0 when the parent is root
        };

        let mut child = DirInner::new(Some(entry.clone()), Some(self.inner.clone()));
        child.entries = Some(Vec::new());

        let mut dot = FatLfnDirectoryEntry::new(None, ShortName::dot());
        dot.entry_mut().set_directory();
        dot.set_start_cluster(start_cluster);
        dot.copy_date_time_from(&entry.borrow());
        child.add_entry(Rc::new(RefCell::new(dot)));

        let mut dotdot = FatLfnDirectoryEntry::new(None, ShortName::dotdot());
        dotdot.entry_mut().set_directory();
        dotdot.set_start_cluster(parent_start);
        dotdot.copy_date_time_from(&entry.borrow());
        child.add_entry(Rc::new(RefCell::new(dotdot)));

        {
            let mut core = self.core.borrow_mut();
            let core = &mut *core;
            child.chain = Some(ClusterChain::open(
                &mut *core.device,
                &core.fat,
                &core.boot,
                start_cluster,
            )?);
            child.write(core)?;
        }

        Ok(FatDirectory {
            core: self.core.clone(),
            inner: Rc::new(RefCell::new(child)),
        })
    }

    /// Appends a new entry with one freshly allocated cluster and rewrites
    /// the table.
    fn create_entry(&self, name: &str, directory: bool) -> Result<SharedEntry> {
        validate_name(name)?;
        self.init()?;

        let mut inner = self.inner.borrow_mut();
        if inner.contains(name) {
            return Err(Error::AlreadyExists);
        }

        let mut core = self.core.borrow_mut();
        let core = &mut *core;

        let short_name = generate_short_name(name, &inner.short_names);
        let mut record = FatLfnDirectoryEntry::new(Some(name), short_name);
        if directory {
            record.entry_mut().set_directory();
        }

        let chain = core.fat.alloc(&mut *core.device, &[], 1)?;
        record.set_start_cluster(chain[0]);
        log::debug!("adding entry {name:?} with short name {short_name}");

        let entry = Rc::new(RefCell::new(record));
        inner.add_entry(entry.clone());
        inner.write(core)?;
        Ok(entry)
    }

    /// Resolves a '/'-separated path relative to this directory. Lookups
    /// fold ASCII case; a miss anywhere yields `Ok(None)`.
    pub fn search(&self, path: &str) -> Result<Option<UsbFile>> {
        log::debug!("search {path:?}");
        self.init()?;

        let path = path.trim_matches(PATH_SEPARATOR);
        if path.is_empty() {
            return Ok(Some(UsbFile::Directory(self.clone())));
        }

        let (segment, rest) = match path.split_once(PATH_SEPARATOR) {
            Some((segment, rest)) => (segment, rest),
            None => (path, ""),
        };

        let Some(entry) = self.inner.borrow().find(segment) else {
            return Ok(None);
        };

        let file = self.wrap_entry(entry);
        if rest.is_empty() {
            return Ok(Some(file));
        }
        match file {
            UsbFile::Directory(directory) => directory.search(rest),
            UsbFile::File(_) => Ok(None),
        }
    }

    /// Renames this directory. The parent's table carries the entry, so the
    /// parent is rewritten.
    pub fn set_name(&self, new_name: &str) -> Result<()> {
        let (entry, parent) = {
            let inner = self.inner.borrow();
            match (&inner.entry, &inner.parent) {
                (Some(entry), Some(parent)) => (entry.clone(), parent.clone()),
                _ => return Err(Error::ReadOnly),
            }
        };
        let mut core = self.core.borrow_mut();
        let result = parent.borrow_mut().rename_entry(&mut core, &entry, new_name);
        result
    }

    pub fn created_at(&self) -> Option<PrimitiveDateTime> {
        let inner = self.inner.borrow();
        inner.entry.as_ref().map(|entry| entry.borrow().entry().created_at())
    }

    pub fn last_modified(&self) -> Option<PrimitiveDateTime> {
        let inner = self.inner.borrow();
        inner
            .entry
            .as_ref()
            .map(|entry| entry.borrow().entry().last_modified())
    }

    pub fn last_accessed(&self) -> Option<PrimitiveDateTime> {
        let inner = self.inner.borrow();
        inner
            .entry
            .as_ref()
            .map(|entry| entry.borrow().entry().last_accessed())
    }

    /// Moves this directory into `destination`, rewriting both tables.
    pub fn move_to(&self, destination: &FatDirectory) -> Result<()> {
        if !Rc::ptr_eq(&self.core, &destination.core) {
            return Err(Error::CrossFileSystem);
        }

        let (entry, parent) = {
            let inner = self.inner.borrow();
            match (&inner.entry, &inner.parent) {
                (Some(entry), Some(parent)) => (entry.clone(), parent.clone()),
                _ => return Err(Error::ReadOnly),
            }
        };

        self.init()?;
        destination.init()?;
        move_entry(&self.core, &entry, &parent, destination)?;
        self.inner.borrow_mut().parent = Some(destination.inner.clone());
        Ok(())
    }

    /// Recursively deletes the directory's contents, then removes it from
    /// its parent and releases its clusters.
    pub fn delete(&self) -> Result<()> {
        let (entry, parent) = {
            let inner = self.inner.borrow();
            match (&inner.entry, &inner.parent) {
                (Some(entry), Some(parent)) => (entry.clone(), parent.clone()),
                _ => return Err(Error::ReadOnly),
            }
        };

        for child in self.list_files()? {
            match child {
                UsbFile::Directory(directory) => directory.delete()?,
                UsbFile::File(mut file) => file.delete()?,
            }
        }

        let mut core = self.core.borrow_mut();
        let core = &mut *core;
        {
            let mut parent = parent.borrow_mut();
            parent.remove_entry(&entry);
            parent.write(core)?;
        }

        let mut inner = self.inner.borrow_mut();
        inner
            .chain
            .as_mut()
            .unwrap()
            .set_length(&mut *core.device, &mut core.fat, 0)
    }
}

/// Removes `entry` from `source` and appends it to `destination`, writing
/// both tables.
fn move_entry(
    core: &SharedCore,
    entry: &SharedEntry,
    source: &SharedDir,
    destination: &FatDirectory,
) -> Result<()> {
    if destination.inner.borrow().contains(&entry.borrow().name()) {
        return Err(Error::AlreadyExists);
    }

    let mut core = core.borrow_mut();
    let core = &mut *core;
    {
        let mut source = source.borrow_mut();
        source.remove_entry(entry);
        source.write(core)?;
    }
    let mut destination = destination.inner.borrow_mut();
    destination.add_entry(entry.clone());
    destination.write(core)
}

/// A regular file: length-backed random access bytes.
pub struct FatFile {
    core: SharedCore,
    entry: SharedEntry,
    parent: SharedDir,
    chain: Option<ClusterChain>,
}

impl FatFile {
    fn init_chain(&mut self) -> Result<()> {
        if self.chain.is_none() {
            let mut core = self.core.borrow_mut();
            let core = &mut *core;
            self.chain = Some(ClusterChain::open(
                &mut *core.device,
                &core.fat,
                &core.boot,
                self.entry.borrow().start_cluster(),
            )?);
        }
        Ok(())
    }

    pub fn name(&self) -> String {
        self.entry.borrow().name()
    }

    pub fn length(&self) -> u64 {
        u64::from(self.entry.borrow().file_size())
    }

    pub fn created_at(&self) -> PrimitiveDateTime {
        self.entry.borrow().entry().created_at()
    }

    pub fn last_modified(&self) -> PrimitiveDateTime {
        self.entry.borrow().entry().last_modified()
    }

    pub fn last_accessed(&self) -> PrimitiveDateTime {
        self.entry.borrow().entry().last_accessed()
    }

    pub fn parent(&self) -> FatDirectory {
        FatDirectory {
            core: self.core.clone(),
            inner: self.parent.clone(),
        }
    }

    /// Reads up to `dest.len()` bytes at `offset`, bounded by the file
    /// size. Returns the number of bytes read.
    pub fn read(&mut self, offset: u64, dest: &mut [u8]) -> Result<usize> {
        self.init_chain()?;

        let length = self.length();
        if offset >= length {
            return Ok(0);
        }
        let take = ((length - offset) as usize).min(dest.len());

        {
            let mut core = self.core.borrow_mut();
            self.chain
                .as_ref()
                .unwrap()
                .read(&mut *core.device, offset, &mut dest[..take])?;
        }

        self.entry
            .borrow_mut()
            .entry_mut()
            .set_last_accessed(entry::now());
        Ok(take)
    }

    /// Writes `src` at `offset`, growing the file as needed. The new length
    /// and timestamp become durable on `flush()` or on the parent's next
    /// table rewrite.
    pub fn write(&mut self, offset: u64, src: &[u8]) -> Result<()> {
        self.init_chain()?;

        let end = offset + src.len() as u64;
        {
            let mut core = self.core.borrow_mut();
            let core = &mut *core;
            let chain = self.chain.as_mut().unwrap();
            if end > chain.length() {
                chain.set_length(&mut *core.device, &mut core.fat, end)?;
            }
            chain.write(&mut *core.device, offset, src)?;

            let mut entry = self.entry.borrow_mut();
            entry.set_start_cluster(chain.first_cluster());
            if end > u64::from(entry.file_size()) {
                entry.entry_mut().set_file_size(end as u32);
            }
            entry.entry_mut().set_last_modified(entry::now());
        }

        Ok(())
    }

    /// Truncates or extends the allocation; the logical size follows.
    pub fn set_length(&mut self, length: u64) -> Result<()> {
        self.init_chain()?;

        let mut core = self.core.borrow_mut();
        let core = &mut *core;
        let chain = self.chain.as_mut().unwrap();
        chain.set_length(&mut *core.device, &mut core.fat, length)?;

        let mut entry = self.entry.borrow_mut();
        entry.set_start_cluster(chain.first_cluster());
        entry.entry_mut().set_file_size(length as u32);
        entry.entry_mut().set_last_modified(entry::now());
        Ok(())
    }

    /// Makes size and timestamp changes durable by rewriting the parent's
    /// entry table.
    pub fn flush(&mut self) -> Result<()> {
        let mut core = self.core.borrow_mut();
        self.parent.borrow_mut().write(&mut core)
    }

    pub fn close(&mut self) -> Result<()> {
        self.flush()
    }

    pub fn set_name(&mut self, new_name: &str) -> Result<()> {
        let mut core = self.core.borrow_mut();
        self.parent
            .borrow_mut()
            .rename_entry(&mut core, &self.entry, new_name)
    }

    pub fn move_to(&mut self, destination: &FatDirectory) -> Result<()> {
        if !Rc::ptr_eq(&self.core, &destination.core) {
            return Err(Error::CrossFileSystem);
        }
        destination.init()?;
        move_entry(&self.core, &self.entry, &self.parent, destination)?;
        self.parent = destination.inner.clone();
        Ok(())
    }

    /// Removes the file from its parent and releases its clusters.
    pub fn delete(&mut self) -> Result<()> {
        self.init_chain()?;

        let mut core = self.core.borrow_mut();
        let core = &mut *core;
        {
            let mut parent = self.parent.borrow_mut();
            parent.remove_entry(&self.entry);
            parent.write(core)?;
        }
        self.chain
            .as_mut()
            .unwrap()
            .set_length(&mut *core.device, &mut core.fat, 0)
    }
}

/// A node of the file tree: either a file or a directory.
pub enum UsbFile {
    File(FatFile),
    Directory(FatDirectory),
}

impl UsbFile {
    pub fn is_directory(&self) -> bool {
        matches!(self, UsbFile::Directory(_))
    }

    pub fn name(&self) -> String {
        match self {
            UsbFile::File(file) => file.name(),
            UsbFile::Directory(directory) => directory.name(),
        }
    }

    /// File length; directories have none.
    pub fn length(&self) -> Result<u64> {
        match self {
            UsbFile::File(file) => Ok(file.length()),
            UsbFile::Directory(_) => Err(Error::IsDirectory),
        }
    }

    pub fn into_file(self) -> Result<FatFile> {
        match self {
            UsbFile::File(file) => Ok(file),
            UsbFile::Directory(_) => Err(Error::IsDirectory),
        }
    }

    pub fn into_directory(self) -> Result<FatDirectory> {
        match self {
            UsbFile::Directory(directory) => Ok(directory),
            UsbFile::File(_) => Err(Error::NotDirectory),
        }
    }

    pub fn created_at(&self) -> Option<PrimitiveDateTime> {
        match self {
            UsbFile::File(file) => Some(file.created_at()),
            UsbFile::Directory(directory) => directory.created_at(),
        }
    }

    pub fn last_modified(&self) -> Option<PrimitiveDateTime> {
        match self {
            UsbFile::File(file) => Some(file.last_modified()),
            UsbFile::Directory(directory) => directory.last_modified(),
        }
    }

    pub fn last_accessed(&self) -> Option<PrimitiveDateTime> {
        match self {
            UsbFile::File(file) => Some(file.last_accessed()),
            UsbFile::Directory(directory) => directory.last_accessed(),
        }
    }

    /// None only for the root directory.
    pub fn parent(&self) -> Option<FatDirectory> {
        match self {
            UsbFile::File(file) => Some(file.parent()),
            UsbFile::Directory(directory) => directory.parent(),
        }
    }

    pub fn set_name(&mut self, new_name: &str) -> Result<()> {
        match self {
            UsbFile::File(file) => file.set_name(new_name),
            UsbFile::Directory(directory) => directory.set_name(new_name),
        }
    }

    pub fn move_to(&mut self, destination: &FatDirectory) -> Result<()> {
        match self {
            UsbFile::File(file) => file.move_to(destination),
            UsbFile::Directory(directory) => directory.move_to(destination),
        }
    }

    pub fn delete(self) -> Result<()> {
        match self {
            UsbFile::File(mut file) => file.delete(),
            UsbFile::Directory(directory) => directory.delete(),
        }
    }
}

/// A mounted FAT32 volume: detects the format, loads the allocation state
/// and exposes the root directory.
pub struct FileSystem {
    core: SharedCore,
    root: FatDirectory,
    boot_label: String,
}

impl FileSystem {
    pub fn mount(mut device: impl BlockDevice + 'static) -> Result<Self> {
        let boot = Fat32BootSector::read(&mut device)?;
        let fat = Fat::open(&mut device, &boot)?;
        let boot_label = boot.volume_label();
        log::debug!(
            "mounted FAT32 volume, {} data clusters of {} bytes",
            boot.total_data_clusters(),
            boot.bytes_per_cluster()
        );

        let core = Rc::new(RefCell::new(FsCore {
            device: Box::new(device),
            boot,
            fat,
        }));
        let root = FatDirectory::read_root(core.clone())?;

        Ok(Self {
            core,
            root,
            boot_label,
        })
    }

    pub fn root_directory(&self) -> FatDirectory {
        self.root.clone()
    }

    /// The label from the root directory's label entry, falling back to the
    /// one recorded in the boot sector.
    pub fn volume_label(&self) -> String {
        self.root.volume_label().unwrap_or_else(|| self.boot_label.clone())
    }

    /// Resolves an absolute path; `Err(NotFound)` on a miss.
    pub fn open(&self, path: &str) -> Result<UsbFile> {
        self.root.search(path)?.ok_or(Error::NotFound)
    }

    pub fn capacity(&self) -> u64 {
        let core = self.core.borrow();
        u64::from(core.boot.total_data_clusters()) * u64::from(core.boot.bytes_per_cluster())
    }

    pub fn free_space(&self) -> u64 {
        let core = self.core.borrow();
        u64::from(core.fat.free_clusters()) * u64::from(core.boot.bytes_per_cluster())
    }
}
