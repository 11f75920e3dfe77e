//! Program cache keyed by shader source.
//!
//! A program is identified by the SHA-256 of the cache version and its
//! vertex and fragment source. Lookups go memory, then disk (a linked
//! program binary), then a full compile whose binary is stored for next
//! time. Bumping [`SHADER_CACHE_VERSION`] throws the on-disk cache away.
//!
//! On disk the cache is two files per backend flavor: `<flavor>_programs.idx`
//! (JSON index) and `<flavor>_programs.bin` (concatenated binaries).

use std::collections::HashMap;
use std::fs::{self, File, OpenOptions};
use std::io::Write;
use std::path::PathBuf;

use emu_core::logging::{log, LogCategory, LogLevel};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

use crate::GpuError;

/// Bump whenever generated shaders change meaning
pub const SHADER_CACHE_VERSION: u32 = 5;

/// Driver-specific linked program
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProgramBinary {
    pub format: u32,
    pub data: Vec<u8>,
}

/// Shader compilation for one backend
pub trait ProgramCompiler {
    type Program: Clone;

    /// Compile and link. `pre_link` runs after the shaders are attached and
    /// before linking, for binding attribute and output locations.
    fn compile_program(
        &mut self,
        vertex: &str,
        fragment: &str,
        pre_link: &dyn Fn(&mut Self, &Self::Program),
    ) -> Result<Self::Program, String>;

    /// Whether programs can round-trip through [`ProgramBinary`]. Without
    /// it the cache still dedupes in memory but never touches the disk.
    fn supports_binaries(&self) -> bool {
        true
    }

    /// `None` when the driver can't export binaries
    fn get_program_binary(&mut self, program: &Self::Program) -> Option<ProgramBinary>;

    /// `None` when the binary was rejected (e.g. after a driver update)
    fn create_program_from_binary(&mut self, binary: &ProgramBinary) -> Option<Self::Program>;

    fn destroy_program(&mut self, program: Self::Program);
}

pub type CacheKey = [u8; 32];

pub fn cache_key(vertex: &str, fragment: &str) -> CacheKey {
    let mut hasher = Sha256::new();
    hasher.update(SHADER_CACHE_VERSION.to_le_bytes());
    hasher.update((vertex.len() as u64).to_le_bytes());
    hasher.update(vertex.as_bytes());
    hasher.update((fragment.len() as u64).to_le_bytes());
    hasher.update(fragment.as_bytes());
    hasher.finalize().into()
}

fn key_hex(key: &CacheKey) -> String {
    key.iter().map(|b| format!("{:02x}", b)).collect()
}

#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct CacheStats {
    pub memory_hits: u64,
    pub disk_loads: u64,
    pub compiles: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
struct IndexEntry {
    key: String,
    format: u32,
    offset: u64,
    size: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
struct CacheIndex {
    version: u32,
    flavor: String,
    entries: Vec<IndexEntry>,
}

struct DiskCache {
    index_path: PathBuf,
    blob_path: PathBuf,
    flavor: String,
    entries: HashMap<String, IndexEntry>,
    blob: Vec<u8>,
    dirty: bool,
}

impl DiskCache {
    fn open(dir: PathBuf, flavor: &str) -> Result<Self, GpuError> {
        fs::create_dir_all(&dir)?;
        let index_path = dir.join(format!("{}_programs.idx", flavor));
        let blob_path = dir.join(format!("{}_programs.bin", flavor));

        let mut cache = Self {
            index_path,
            blob_path,
            flavor: flavor.to_string(),
            entries: HashMap::new(),
            blob: Vec::new(),
            dirty: false,
        };

        let index = fs::read_to_string(&cache.index_path)
            .ok()
            .and_then(|s| serde_json::from_str::<CacheIndex>(&s).ok());
        match index {
            Some(index) if index.version == SHADER_CACHE_VERSION && index.flavor == flavor => {
                cache.blob = fs::read(&cache.blob_path).unwrap_or_default();
                let blob_len = cache.blob.len() as u64;
                cache.entries = index
                    .entries
                    .into_iter()
                    .filter(|e| e.offset + e.size <= blob_len)
                    .map(|e| (e.key.clone(), e))
                    .collect();
                log(LogCategory::Shaders, LogLevel::Info, || {
                    format!("loaded {} cached program(s) from {}", cache.entries.len(), cache.index_path.display())
                });
            }
            Some(index) => {
                log(LogCategory::Shaders, LogLevel::Info, || {
                    format!(
                        "discarding program cache (version {}, expected {})",
                        index.version, SHADER_CACHE_VERSION
                    )
                });
                cache.discard()?;
            }
            None => {
                if cache.blob_path.exists() {
                    cache.discard()?;
                }
            }
        }
        Ok(cache)
    }

    fn discard(&mut self) -> Result<(), GpuError> {
        self.entries.clear();
        self.blob.clear();
        for path in [&self.index_path, &self.blob_path] {
            if path.exists() {
                fs::remove_file(path)?;
            }
        }
        self.dirty = true;
        Ok(())
    }

    fn lookup(&self, key: &CacheKey) -> Option<ProgramBinary> {
        let entry = self.entries.get(&key_hex(key))?;
        let start = entry.offset as usize;
        let end = start + entry.size as usize;
        Some(ProgramBinary {
            format: entry.format,
            data: self.blob.get(start..end)?.to_vec(),
        })
    }

    fn insert(&mut self, key: &CacheKey, binary: &ProgramBinary) -> Result<(), GpuError> {
        let mut file = OpenOptions::new().create(true).append(true).open(&self.blob_path)?;
        file.write_all(&binary.data)?;
        let entry = IndexEntry {
            key: key_hex(key),
            format: binary.format,
            offset: self.blob.len() as u64,
            size: binary.data.len() as u64,
        };
        self.blob.extend_from_slice(&binary.data);
        self.entries.insert(entry.key.clone(), entry);
        self.dirty = true;
        Ok(())
    }

    fn remove(&mut self, key: &CacheKey) {
        if self.entries.remove(&key_hex(key)).is_some() {
            self.dirty = true;
        }
    }

    fn flush(&mut self) -> Result<(), GpuError> {
        if !self.dirty {
            return Ok(());
        }
        let mut entries: Vec<IndexEntry> = self.entries.values().cloned().collect();
        entries.sort_by_key(|e| e.offset);
        let index = CacheIndex {
            version: SHADER_CACHE_VERSION,
            flavor: self.flavor.clone(),
            entries,
        };
        let mut file = File::create(&self.index_path)?;
        file.write_all(serde_json::to_string_pretty(&index)?.as_bytes())?;
        self.dirty = false;
        Ok(())
    }
}

pub struct ShaderCache<P> {
    programs: HashMap<CacheKey, P>,
    disk: Option<DiskCache>,
    stats: CacheStats,
}

impl<P: Clone> ShaderCache<P> {
    /// Memory-only cache
    pub fn in_memory() -> Self {
        Self {
            programs: HashMap::new(),
            disk: None,
            stats: CacheStats::default(),
        }
    }

    /// Cache backed by `dir`. An unusable directory degrades to memory only.
    pub fn open(dir: Option<PathBuf>, flavor: &str) -> Self {
        let disk = dir.and_then(|dir| match DiskCache::open(dir, flavor) {
            Ok(disk) => Some(disk),
            Err(e) => {
                log(LogCategory::Shaders, LogLevel::Warn, || {
                    format!("program cache unavailable, compiling everything: {}", e)
                });
                None
            }
        });
        Self {
            programs: HashMap::new(),
            disk,
            stats: CacheStats::default(),
        }
    }

    pub fn stats(&self) -> CacheStats {
        self.stats
    }

    pub fn len(&self) -> usize {
        self.programs.len()
    }

    pub fn is_empty(&self) -> bool {
        self.programs.is_empty()
    }

    pub fn get_program<C>(
        &mut self,
        compiler: &mut C,
        vertex: &str,
        fragment: &str,
        pre_link: &dyn Fn(&mut C, &P),
    ) -> Result<P, String>
    where
        C: ProgramCompiler<Program = P>,
    {
        let key = cache_key(vertex, fragment);
        if let Some(program) = self.programs.get(&key) {
            self.stats.memory_hits += 1;
            return Ok(program.clone());
        }

        let binaries = compiler.supports_binaries();
        if let Some(binary) = self.disk.as_ref().filter(|_| binaries).and_then(|d| d.lookup(&key)) {
            match compiler.create_program_from_binary(&binary) {
                Some(program) => {
                    self.stats.disk_loads += 1;
                    self.programs.insert(key, program.clone());
                    return Ok(program);
                }
                None => {
                    log(LogCategory::Shaders, LogLevel::Debug, || {
                        format!("cached binary {} rejected, recompiling", key_hex(&key))
                    });
                    if let Some(disk) = self.disk.as_mut() {
                        disk.remove(&key);
                    }
                }
            }
        }

        let program = compiler.compile_program(vertex, fragment, pre_link)?;
        self.stats.compiles += 1;

        if let Some(disk) = self.disk.as_mut().filter(|_| binaries) {
            if let Some(binary) = compiler.get_program_binary(&program) {
                if let Err(e) = disk.insert(&key, &binary) {
                    log(LogCategory::Shaders, LogLevel::Warn, || {
                        format!("failed to store program binary: {}", e)
                    });
                }
            }
        }
        self.programs.insert(key, program.clone());
        Ok(program)
    }

    /// Write the index to disk
    pub fn flush(&mut self) -> Result<(), GpuError> {
        match self.disk.as_mut() {
            Some(disk) => disk.flush(),
            None => Ok(()),
        }
    }

    /// Destroy every program and forget them. The disk cache is kept.
    pub fn clear<C>(&mut self, compiler: &mut C)
    where
        C: ProgramCompiler<Program = P>,
    {
        for (_, program) in self.programs.drain() {
            compiler.destroy_program(program);
        }
    }

    /// Destroy the programs `keep` rejects. Returns how many went.
    pub fn retain<C>(&mut self, compiler: &mut C, keep: impl Fn(&P) -> bool) -> usize
    where
        C: ProgramCompiler<Program = P>,
    {
        let stale: Vec<CacheKey> = self
            .programs
            .iter()
            .filter(|(_, program)| !keep(program))
            .map(|(key, _)| *key)
            .collect();
        for key in &stale {
            if let Some(program) = self.programs.remove(key) {
                compiler.destroy_program(program);
            }
        }
        stale.len()
    }
}

impl<P> Drop for ShaderCache<P> {
    fn drop(&mut self) {
        if let Some(disk) = self.disk.as_mut() {
            if let Err(e) = disk.flush() {
                log(LogCategory::Shaders, LogLevel::Warn, || {
                    format!("failed to write program cache index: {}", e)
                });
            }
        }
    }
}
