//! The persistent build database: encoded BuildKey mapped to the last
//! computed BuildValue plus the dependency keys recorded for it.
//!
//! The format is an append-only record stream.  Key byte strings are
//! interned by dedicated records and referenced by dense integer ids, so a
//! result record names its dependencies compactly.  Later result records for
//! the same key win, which is what makes append-only updates sound.

use std::collections::HashMap;
use std::fs::File;
use std::io::{BufReader, BufWriter, Read, Write};

const MAGIC: &[u8; 6] = b"llbdb\x01";
const TAG_KEY: u8 = 0x01;
const TAG_RESULT: u8 = 0x02;

/// A result as loaded for one key: the value and the recorded dep keys.
#[derive(Debug, Clone, PartialEq)]
pub struct DbResult {
    pub value: Vec<u8>,
    pub deps: Vec<Vec<u8>>,
}

#[derive(Debug)]
pub struct BuildDb {
    /// Interned key strings; a key's id is its position.
    keys: Vec<Vec<u8>>,
    ids: HashMap<Vec<u8>, u32>,
    results: HashMap<u32, DbResult>,
    w: BufWriter<File>,
}

fn read_u32(r: &mut impl Read) -> std::io::Result<u32> {
    let mut buf = [0u8; 4];
    r.read_exact(&mut buf)?;
    Ok(u32::from_le_bytes(buf))
}

fn read_bytes(r: &mut impl Read) -> std::io::Result<Vec<u8>> {
    let len = read_u32(r)? as usize;
    let mut buf = vec![0; len];
    r.read_exact(&mut buf)?;
    Ok(buf)
}

fn write_bytes(w: &mut impl Write, bytes: &[u8]) -> std::io::Result<()> {
    w.write_all(&(bytes.len() as u32).to_le_bytes())?;
    w.write_all(bytes)
}

impl BuildDb {
    /// Open or create the database.  The stored schema version must match
    /// `version` exactly; on mismatch the caller decides whether to rebuild
    /// cold (by not attaching) or abort.
    pub fn open(path: &str, version: u32) -> Result<BuildDb, String> {
        match std::fs::OpenOptions::new().read(true).append(true).open(path) {
            Ok(f) => Self::read(f, version).map_err(|err| format!("{}: {}", path, err)),
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => {
                let f = File::create(path).map_err(|err| format!("create {}: {}", path, err))?;
                let mut w = BufWriter::new(f);
                w.write_all(MAGIC)
                    .and_then(|_| w.write_all(&version.to_le_bytes()))
                    .and_then(|_| w.flush())
                    .map_err(|err| format!("write {}: {}", path, err))?;
                Ok(BuildDb {
                    keys: Vec::new(),
                    ids: HashMap::new(),
                    results: HashMap::new(),
                    w,
                })
            }
            Err(err) => Err(format!("open {}: {}", path, err)),
        }
    }

    fn read(mut f: File, version: u32) -> Result<BuildDb, String> {
        let mut r = BufReader::new(&mut f);

        let mut magic = [0u8; 6];
        r.read_exact(&mut magic).map_err(|e| e.to_string())?;
        if &magic != MAGIC {
            return Err("not a build database".to_string());
        }
        let stored = read_u32(&mut r).map_err(|e| e.to_string())?;
        if stored != version {
            return Err(format!(
                "schema version {} does not match expected {}",
                stored, version
            ));
        }

        let mut keys: Vec<Vec<u8>> = Vec::new();
        let mut ids = HashMap::new();
        let mut results = HashMap::new();
        loop {
            let mut tag = [0u8; 1];
            match r.read_exact(&mut tag) {
                Ok(()) => {}
                Err(err) if err.kind() == std::io::ErrorKind::UnexpectedEof => break,
                Err(err) => return Err(err.to_string()),
            }
            // A record truncated by a crashed writer is dropped; everything
            // before it is intact.
            let record = (|| -> std::io::Result<()> {
                match tag[0] {
                    TAG_KEY => {
                        let key = read_bytes(&mut r)?;
                        ids.insert(key.clone(), keys.len() as u32);
                        keys.push(key);
                    }
                    TAG_RESULT => {
                        let id = read_u32(&mut r)?;
                        let value = read_bytes(&mut r)?;
                        let ndeps = read_u32(&mut r)? as usize;
                        let mut deps = Vec::with_capacity(ndeps);
                        for _ in 0..ndeps {
                            deps.push(read_u32(&mut r)?);
                        }
                        let deps = deps
                            .into_iter()
                            .filter_map(|d| keys.get(d as usize).cloned())
                            .collect();
                        results.insert(id, DbResult { value, deps });
                    }
                    _ => {
                        return Err(std::io::Error::new(
                            std::io::ErrorKind::InvalidData,
                            "unknown record",
                        ))
                    }
                }
                Ok(())
            })();
            match record {
                Ok(()) => {}
                Err(err) if err.kind() == std::io::ErrorKind::UnexpectedEof => break,
                Err(err) => return Err(err.to_string()),
            }
        }

        drop(r);
        Ok(BuildDb {
            keys,
            ids,
            results,
            w: BufWriter::new(f),
        })
    }

    pub fn lookup(&self, key: &[u8]) -> Option<&DbResult> {
        self.results.get(self.ids.get(key)?)
    }

    fn ensure_id(&mut self, key: &[u8]) -> std::io::Result<u32> {
        if let Some(&id) = self.ids.get(key) {
            return Ok(id);
        }
        let id = self.keys.len() as u32;
        self.ids.insert(key.to_vec(), id);
        self.keys.push(key.to_vec());
        self.w.write_all(&[TAG_KEY])?;
        write_bytes(&mut self.w, key)?;
        Ok(id)
    }

    pub fn write_result(
        &mut self,
        key: &[u8],
        value: &[u8],
        deps: &[Vec<u8>],
    ) -> std::io::Result<()> {
        let id = self.ensure_id(key)?;
        let mut dep_ids = Vec::with_capacity(deps.len());
        for dep in deps {
            dep_ids.push(self.ensure_id(dep)?);
        }
        self.w.write_all(&[TAG_RESULT])?;
        self.w.write_all(&id.to_le_bytes())?;
        write_bytes(&mut self.w, value)?;
        self.w.write_all(&(dep_ids.len() as u32).to_le_bytes())?;
        for dep in dep_ids {
            self.w.write_all(&dep.to_le_bytes())?;
        }
        self.results.insert(
            id,
            DbResult {
                value: value.to_vec(),
                deps: deps.to_vec(),
            },
        );
        self.w.flush()
    }
}
