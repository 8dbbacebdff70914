use std::fs::File;
use std::io::{self, BufReader, ErrorKind, Read, Write};
use std::path::{Path, PathBuf};

use anyhow::{anyhow, Context, Result};
use byteorder::{BigEndian, ReadBytesExt, WriteBytesExt};
use bytes::Bytes;

use crate::cachekey::CacheKey;
use crate::storage::{write_atomic, CacheRecord, Freshness, PutOutcome, RecordMeta, Store};

const MAGIC: &[u8; 4] = b"IMGC";
const VERSION: u8 = 1;
/// Largest body a record may carry; `origin.max_size` may not exceed it.
pub const MAX_BODY_LEN: u64 = 1 << 26;

pub struct BlobStore {
    root: PathBuf,
}

impl BlobStore {
    pub fn new(root: &Path) -> Self {
        Self {
            root: root.to_path_buf(),
        }
    }

    fn open(&self, key: &CacheKey) -> Result<Option<(BufReader<File>, PathBuf)>> {
        let path = key.path(&self.root);
        match File::open(&path) {
            Ok(file) => Ok(Some((BufReader::new(file), path))),
            Err(err) if err.kind() == ErrorKind::NotFound => Ok(None),
            Err(err) => Err(err).with_context(|| format!("open {}", path.display())),
        }
    }
}

impl Store for BlobStore {
    fn kind(&self) -> &'static str {
        "blob"
    }

    fn head(&self, key: &CacheKey) -> Result<Option<(RecordMeta, Freshness)>> {
        let Some((mut reader, path)) = self.open(key)? else {
            return Ok(None);
        };
        match decode_header(&mut reader) {
            Ok(meta) => Ok(Some((meta, Freshness::Untracked))),
            Err(err) => {
                log::warn!("error while decoding {}: {err}", path.display());
                Ok(None)
            }
        }
    }

    fn get(&self, key: &CacheKey) -> Result<Option<CacheRecord>> {
        let Some((mut reader, path)) = self.open(key)? else {
            return Ok(None);
        };
        match decode(&mut reader) {
            Ok(record) => Ok(Some(record)),
            Err(err) => {
                log::warn!("error while decoding {}: {err}", path.display());
                Ok(None)
            }
        }
    }

    fn put(&self, key: &CacheKey, record: &CacheRecord) -> Result<PutOutcome> {
        if record.body.len() as u64 > MAX_BODY_LEN {
            return Err(anyhow!(
                "body of {} bytes exceeds the {MAX_BODY_LEN} byte record limit",
                record.body.len()
            ));
        }
        let path = key.path(&self.root);
        write_atomic(&path, |w| encode(w, record))?;
        Ok(PutOutcome::Written)
    }
}

pub fn encode(w: &mut dyn Write, record: &CacheRecord) -> io::Result<()> {
    let checksum = record.checksum.as_bytes();
    let content_type = record.content_type.as_bytes();
    if checksum.len() > u8::MAX as usize || content_type.len() > u16::MAX as usize {
        return Err(io::Error::new(ErrorKind::InvalidInput, "header field too long"));
    }
    w.write_all(MAGIC)?;
    w.write_u8(VERSION)?;
    w.write_i64::<BigEndian>(record.last_modified)?;
    w.write_u8(checksum.len() as u8)?;
    w.write_all(checksum)?;
    w.write_u16::<BigEndian>(content_type.len() as u16)?;
    w.write_all(content_type)?;
    w.write_u64::<BigEndian>(record.body.len() as u64)?;
    w.write_all(&record.body)
}

pub fn decode_header(r: &mut dyn Read) -> io::Result<RecordMeta> {
    let mut magic = [0u8; 4];
    r.read_exact(&mut magic)?;
    if &magic != MAGIC {
        return Err(io::Error::new(ErrorKind::InvalidData, "bad magic"));
    }
    let version = r.read_u8()?;
    if version != VERSION {
        return Err(io::Error::new(
            ErrorKind::InvalidData,
            format!("unsupported version {version}"),
        ));
    }
    let last_modified = r.read_i64::<BigEndian>()?;
    let checksum_len = r.read_u8()? as usize;
    let checksum = read_string(r, checksum_len)?;
    let content_type_len = r.read_u16::<BigEndian>()? as usize;
    let content_type = read_string(r, content_type_len)?;
    Ok(RecordMeta {
        content_type,
        checksum,
        last_modified,
    })
}

pub fn decode(r: &mut dyn Read) -> io::Result<CacheRecord> {
    let meta = decode_header(r)?;
    let body_len = r.read_u64::<BigEndian>()?;
    if body_len > MAX_BODY_LEN {
        return Err(io::Error::new(ErrorKind::InvalidData, "body length out of range"));
    }
    let mut body = vec![0u8; body_len as usize];
    r.read_exact(&mut body)?;
    Ok(CacheRecord {
        content_type: meta.content_type,
        body: Bytes::from(body),
        checksum: meta.checksum,
        last_modified: meta.last_modified,
    })
}

fn read_string(r: &mut dyn Read, len: usize) -> io::Result<String> {
    let mut buf = vec![0u8; len];
    r.read_exact(&mut buf)?;
    String::from_utf8(buf).map_err(|err| io::Error::new(ErrorKind::InvalidData, err))
}
