//! Key tables: long-term service keys used by the acceptor.
//!
//! [`FileKeytab`] reads the MIT keytab format:
//!
//! ```not_rust
//! keytab      ::= 0x05 0x02 entry*
//! entry       ::= i32 size (negative: hole of -size bytes), then
//!                 u16 num_components, counted realm, counted component*,
//!                 u32 name_type, u32 timestamp, u8 vno8,
//!                 u16 enctype, u16 key length, key,
//!                 [u32 vno]
//! ```
//!
//! Every integer is big-endian. Counted strings are a `u16` length and bytes.

use std::collections::HashMap;
use std::fmt::Debug;
use std::io::Read;
use std::path::{Path, PathBuf};
use std::sync::{Arc, RwLock};

use byteorder::{BigEndian, ReadBytesExt, WriteBytesExt};

use crate::principal::Principal;
use crate::{Error, ErrorKind, Result, Secret};

const KEYTAB_FORMAT_VERSION_1: u16 = 0x0501;
const KEYTAB_FORMAT_VERSION_2: u16 = 0x0502;
const FILE_PREFIX: &str = "FILE:";

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct KeytabEntry {
    pub principal: Principal,
    pub kvno: u32,
    /// Kerberos encryption type number.
    pub etype: i32,
    pub key: Secret<Vec<u8>>,
    pub timestamp: u32,
}

pub trait KeyTable: Send + Sync + Debug {
    fn name(&self) -> String;

    fn entries(&self) -> Result<Vec<KeytabEntry>>;

    /// Finds the key for `principal`. `None` in `kvno` or `etype` matches any value; the highest
    /// kvno wins.
    fn lookup(&self, principal: &Principal, kvno: Option<u32>, etype: Option<i32>) -> Result<Option<KeytabEntry>> {
        Ok(self
            .entries()?
            .into_iter()
            .filter(|entry| entry.principal.same_name(principal))
            .filter(|entry| kvno.map(|kvno| entry.kvno == kvno).unwrap_or(true))
            .filter(|entry| etype.map(|etype| entry.etype == etype).unwrap_or(true))
            .max_by_key(|entry| entry.kvno))
    }

    /// Checks that the table can serve at least one key.
    fn has_usable_entry(&self) -> Result<bool> {
        Ok(!self.entries()?.is_empty())
    }
}

#[derive(Debug, Default)]
pub struct MemoryKeytab {
    name: String,
    entries: RwLock<Vec<KeytabEntry>>,
}

impl MemoryKeytab {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            entries: RwLock::new(Vec::new()),
        }
    }

    pub fn with_entries(name: impl Into<String>, entries: Vec<KeytabEntry>) -> Self {
        Self {
            name: name.into(),
            entries: RwLock::new(entries),
        }
    }

    pub fn add_entry(&self, entry: KeytabEntry) -> Result<()> {
        self.entries
            .write()
            .map_err(|_| Error::new(ErrorKind::Failure, "keytab lock is poisoned"))?
            .push(entry);

        Ok(())
    }
}

impl KeyTable for MemoryKeytab {
    fn name(&self) -> String {
        format!("MEMORY:{}", self.name)
    }

    fn entries(&self) -> Result<Vec<KeytabEntry>> {
        Ok(self
            .entries
            .read()
            .map_err(|_| Error::new(ErrorKind::Failure, "keytab lock is poisoned"))?
            .clone())
    }
}

/// Keytab file. The file is read on every lookup so rotated keys are picked up.
#[derive(Debug, Clone)]
pub struct FileKeytab {
    path: PathBuf,
}

impl FileKeytab {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl KeyTable for FileKeytab {
    fn name(&self) -> String {
        format!("{}{}", FILE_PREFIX, self.path.display())
    }

    fn entries(&self) -> Result<Vec<KeytabEntry>> {
        let data = std::fs::read(&self.path).map_err(|err| {
            Error::new(
                ErrorKind::NoCredentials,
                format!("cannot read keytab {}: {}", self.path.display(), err),
            )
        })?;

        parse_keytab(&data)
    }
}

pub fn parse_keytab(data: &[u8]) -> Result<Vec<KeytabEntry>> {
    let mut reader = data;

    let version = reader.read_u16::<BigEndian>()?;
    if version != KEYTAB_FORMAT_VERSION_2 {
        let reason = if version == KEYTAB_FORMAT_VERSION_1 {
            "native byte order keytabs (version 0x0501) are not supported".to_owned()
        } else {
            format!("unknown keytab version: {:#06x}", version)
        };

        return Err(Error::new(ErrorKind::NoCredentials, reason));
    }

    let mut entries = Vec::new();

    while !reader.is_empty() {
        let size = reader.read_i32::<BigEndian>()?;
        let len = size.unsigned_abs() as usize;

        if len > reader.len() {
            return Err(Error::new(ErrorKind::TruncatedData, "keytab entry is truncated"));
        }

        let (record, rest) = reader.split_at(len);
        reader = rest;

        if size < 0 {
            // hole left by a deleted entry
            continue;
        }

        entries.push(parse_entry(record)?);
    }

    Ok(entries)
}

fn read_counted_string(reader: &mut &[u8]) -> Result<String> {
    let len = usize::from(reader.read_u16::<BigEndian>()?);
    let mut buf = vec![0; len];
    reader.read_exact(&mut buf)?;

    Ok(String::from_utf8(buf)?)
}

fn parse_entry(mut record: &[u8]) -> Result<KeytabEntry> {
    let components_count = record.read_u16::<BigEndian>()?;
    let realm = read_counted_string(&mut record)?;

    let mut components = Vec::with_capacity(usize::from(components_count));
    for _ in 0..components_count {
        components.push(read_counted_string(&mut record)?);
    }

    let name_type = record.read_u32::<BigEndian>()?;
    let timestamp = record.read_u32::<BigEndian>()?;
    let vno8 = record.read_u8()?;
    let etype = record.read_u16::<BigEndian>()?;

    let key_len = usize::from(record.read_u16::<BigEndian>()?);
    let mut key = vec![0; key_len];
    record.read_exact(&mut key)?;

    // the 32-bit kvno supersedes the 8-bit one when present and non-zero
    let kvno = match record.read_u32::<BigEndian>() {
        Ok(vno) if vno != 0 => vno,
        _ => u32::from(vno8),
    };

    Ok(KeytabEntry {
        principal: Principal::new(name_type as u8, components, realm),
        kvno,
        etype: i32::from(etype),
        key: Secret::new(key),
        timestamp,
    })
}

/// Encodes entries in the MIT keytab format.
pub fn keytab_to_bytes(entries: &[KeytabEntry]) -> Result<Vec<u8>> {
    let mut data = Vec::new();
    data.write_u16::<BigEndian>(KEYTAB_FORMAT_VERSION_2)?;

    for entry in entries {
        let mut record = Vec::new();

        record.write_u16::<BigEndian>(entry.principal.components.len() as u16)?;
        write_counted_string(&mut record, &entry.principal.realm)?;
        for component in &entry.principal.components {
            write_counted_string(&mut record, component)?;
        }

        record.write_u32::<BigEndian>(u32::from(entry.principal.name_type))?;
        record.write_u32::<BigEndian>(entry.timestamp)?;
        record.write_u8(entry.kvno.min(255) as u8)?;
        record.write_u16::<BigEndian>(entry.etype as u16)?;
        record.write_u16::<BigEndian>(entry.key.len() as u16)?;
        record.extend_from_slice(entry.key.as_ref());
        record.write_u32::<BigEndian>(entry.kvno)?;

        data.write_i32::<BigEndian>(record.len() as i32)?;
        data.extend_from_slice(&record);
    }

    Ok(data)
}

fn write_counted_string(out: &mut Vec<u8>, value: &str) -> Result<()> {
    out.write_u16::<BigEndian>(value.len() as u16)?;
    out.extend_from_slice(value.as_bytes());

    Ok(())
}

/// Named key tables known to the process.
#[derive(Debug, Default)]
pub struct KeytabRegistry {
    keytabs: RwLock<HashMap<String, Arc<dyn KeyTable>>>,
}

impl KeytabRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&self, name: impl Into<String>, keytab: Arc<dyn KeyTable>) -> Result<()> {
        self.keytabs
            .write()
            .map_err(|_| Error::new(ErrorKind::Failure, "keytab registry lock is poisoned"))?
            .insert(name.into(), keytab);

        Ok(())
    }

    /// Resolves a keytab name: a registered name first, then the same name with the `FILE:` prefix,
    /// then a keytab file at that path.
    pub fn resolve(&self, name: &str) -> Result<Arc<dyn KeyTable>> {
        {
            let keytabs = self
                .keytabs
                .read()
                .map_err(|_| Error::new(ErrorKind::Failure, "keytab registry lock is poisoned"))?;

            if let Some(keytab) = keytabs.get(name) {
                return Ok(Arc::clone(keytab));
            }

            if !name.starts_with(FILE_PREFIX) {
                if let Some(keytab) = keytabs.get(&format!("{}{}", FILE_PREFIX, name)) {
                    return Ok(Arc::clone(keytab));
                }
            }
        }

        let path = Path::new(name.strip_prefix(FILE_PREFIX).unwrap_or(name));
        if path.is_file() {
            debug!(path = %path.display(), "loading keytab file");

            return Ok(Arc::new(FileKeytab::new(path)));
        }

        Err(Error::new(ErrorKind::Failure, format!("no keytab named {}", name)))
    }
}
