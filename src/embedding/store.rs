//! Binary storage for per-category embeddings.
//!
//! Each category lives in its own file, `<category>.emb`, inside the
//! database directory.
//!
//! Header (57 bytes):
//! - magic: [u8; 4] ("ORVE")
//! - version: u8 (1)
//! - model_id: [u8; 32] (SHA256 hash of model name)
//! - dimensions: u32 (little-endian)
//! - entry_count: u64 (little-endian)
//! - payload_checksum: u32 (CRC32 of every entry byte)
//! - header_checksum: u32 (CRC32 of header fields before it)
//!
//! Entries (repeated, ordered by item id):
//! - id_len: u16 (little-endian)
//! - id: [u8; id_len] (UTF-8)
//! - embedding: [f32; dimensions] (little-endian)

use std::collections::BTreeMap;
use std::fmt;
use std::fs::File;
use std::io::{BufReader, BufWriter, ErrorKind, Read, Write};
use std::path::{Path, PathBuf};
use std::sync::OnceLock;

use serde::Serialize;

use super::category::CategoryStore;

/// Extension of every category file
pub const CATEGORY_FILE_EXTENSION: &str = "emb";

const MAGIC: [u8; 4] = *b"ORVE";

/// Current file format version
const FORMAT_VERSION: u8 = 1;

/// Header size in bytes: magic(4) + version(1) + model_id(32) + dimensions(4)
/// + entry_count(8) + payload_checksum(4) + header_checksum(4)
const HEADER_SIZE: usize = 57;

/// Bytes covered by the header checksum
const CHECKSUMMED_HEADER: usize = HEADER_SIZE - 4;

/// Errors that can occur during storage operations.
#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Database directory not found: {}", .0.display())]
    MissingDatabase(PathBuf),

    #[error("Invalid category name: {0:?}")]
    InvalidCategory(String),

    #[error("Invalid item in category '{category}': {reason}")]
    InvalidItem { category: String, reason: String },

    #[error("Category not found: {0}")]
    NotFound(String),

    #[error("Category '{category}' is corrupt: {reason}")]
    Corrupt { category: String, reason: String },

    #[error("Category '{category}': file version {found}, supported version {supported}")]
    VersionMismatch {
        category: String,
        found: u8,
        supported: u8,
    },

    #[error("Category '{0}' was written by a different model")]
    ModelMismatch(String),

    #[error("Category '{category}': dimension mismatch: expected {expected}, file has {got}")]
    DimensionMismatch {
        category: String,
        expected: usize,
        got: usize,
    },
}

fn corrupt(category: &str, reason: impl Into<String>) -> StoreError {
    StoreError::Corrupt {
        category: category.to_string(),
        reason: reason.into(),
    }
}

/// A category skipped while loading the database.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct StoreWarning {
    pub category: String,
    pub reason: String,
}

impl fmt::Display for StoreWarning {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "skipped category '{}': {}", self.category, self.reason)
    }
}

/// Every category that could be read, plus the ones that could not.
#[derive(Debug, Default)]
pub struct LoadedDatabase {
    pub categories: BTreeMap<String, CategoryStore>,
    pub warnings: Vec<StoreWarning>,
}

/// Header-only view of a persisted category.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct CategorySummary {
    pub category: String,
    pub items: u64,
    pub dimensions: usize,
}

/// Storage manager for the embedding database directory.
pub struct EmbeddingStore {
    root: PathBuf,
    model_id: [u8; 32],
    /// Database-wide dimension, fixed by the first category saved or loaded
    dimensions: OnceLock<usize>,
}

impl EmbeddingStore {
    /// Create a storage manager for `root`, tagging files with `model_id`.
    ///
    /// The directory is created lazily on first save.
    pub fn open(root: PathBuf, model_id: [u8; 32]) -> Self {
        Self {
            root,
            model_id,
            dimensions: OnceLock::new(),
        }
    }

    /// Pin the database-wide dimension up front.
    pub fn with_dimensions(self, dimensions: usize) -> Self {
        let _ = self.dimensions.set(dimensions);
        self
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn model_id(&self) -> &[u8; 32] {
        &self.model_id
    }

    /// Database-wide dimension, once established.
    pub fn dimensions(&self) -> Option<usize> {
        self.dimensions.get().copied()
    }

    /// Create the database directory if it does not exist.
    pub fn ensure_root(&self) -> Result<(), StoreError> {
        std::fs::create_dir_all(&self.root)?;
        Ok(())
    }

    pub fn exists(&self, category: &str) -> bool {
        validate_category(category).is_ok() && self.category_path(category).is_file()
    }

    /// Names of all persisted categories, sorted.
    pub fn categories(&self) -> Result<Vec<String>, StoreError> {
        let entries = match std::fs::read_dir(&self.root) {
            Ok(entries) => entries,
            Err(e) if e.kind() == ErrorKind::NotFound => {
                return Err(StoreError::MissingDatabase(self.root.clone()))
            }
            Err(e) => return Err(e.into()),
        };

        let mut names = Vec::new();
        for entry in entries {
            let entry = entry?;
            if !entry.file_type().map(|t| t.is_file()).unwrap_or(false) {
                continue;
            }

            let file_name = entry.file_name();
            let Some(name) = file_name
                .to_str()
                .and_then(|n| n.strip_suffix(CATEGORY_FILE_EXTENSION))
                .and_then(|n| n.strip_suffix('.'))
            else {
                log::debug!("ignoring {:?} in database directory", file_name);
                continue;
            };

            if validate_category(name).is_ok() {
                names.push(name.to_string());
            }
        }

        names.sort();
        Ok(names)
    }

    /// Persist `store` as the full snapshot of `category`.
    ///
    /// Uses atomic write: temp file -> fsync -> rename
    pub fn save(&self, category: &str, store: &CategoryStore) -> Result<(), StoreError> {
        validate_category(category)?;
        if let Some(expected) = self.dimensions() {
            if expected != store.dimensions() {
                return Err(StoreError::DimensionMismatch {
                    category: category.to_string(),
                    expected,
                    got: store.dimensions(),
                });
            }
        }
        self.ensure_root()?;

        let path = self.category_path(category);
        let temp_path = self
            .root
            .join(format!(".{}.{}.tmp", category, CATEGORY_FILE_EXTENSION));

        let result = self.write_to_file(&temp_path, category, store);

        if result.is_err() {
            // Clean up temp file on error
            let _ = std::fs::remove_file(&temp_path);
            return result;
        }

        // Atomic rename
        std::fs::rename(&temp_path, &path)?;

        // only a persisted category fixes the database dimension
        let _ = self.dimensions.set(store.dimensions());

        log::debug!("saved {} vectors for category '{}'", store.len(), category);

        Ok(())
    }

    /// Load a single category.
    pub fn load(&self, category: &str) -> Result<CategoryStore, StoreError> {
        validate_category(category)?;

        let mut reader = self.open_reader(category)?;

        let header = self.read_header(category, &mut reader)?;
        self.validate_header(category, &header)?;

        let mut payload = Vec::new();
        reader.read_to_end(&mut payload)?;

        if crc32fast::hash(&payload) != header.payload_checksum {
            return Err(corrupt(category, "payload checksum mismatch"));
        }

        let store = decode_entries(category, &payload, &header)?;

        self.check_dimensions(category, store.dimensions())?;

        Ok(store)
    }

    /// Read only the header of a category.
    pub fn summary(&self, category: &str) -> Result<CategorySummary, StoreError> {
        validate_category(category)?;

        let mut reader = self.open_reader(category)?;
        let header = self.read_header(category, &mut reader)?;
        self.validate_header(category, &header)?;

        Ok(CategorySummary {
            category: category.to_string(),
            items: header.entry_count,
            dimensions: header.dimensions as usize,
        })
    }

    /// Header summaries of every persisted category, in name order.
    ///
    /// Unreadable categories are logged and left out.
    pub fn stats(&self) -> Result<Vec<CategorySummary>, StoreError> {
        let mut summaries = Vec::new();
        for category in self.categories()? {
            match self.summary(&category) {
                Ok(summary) => summaries.push(summary),
                Err(e) => log::warn!("Skipping category '{}': {}", category, e),
            }
        }
        Ok(summaries)
    }

    /// Load every persisted category.
    ///
    /// Categories that fail to load are skipped and reported as warnings.
    /// Only a missing or unreadable database directory is an error.
    pub fn load_all(&self) -> Result<LoadedDatabase, StoreError> {
        let mut database = LoadedDatabase::default();

        for category in self.categories()? {
            match self.load(&category) {
                Ok(store) => {
                    database.categories.insert(category, store);
                }
                Err(e) => {
                    log::warn!("Skipping category '{}': {}", category, e);
                    database.warnings.push(StoreWarning {
                        category,
                        reason: e.to_string(),
                    });
                }
            }
        }

        log::info!(
            "Loaded {} categories from {} ({} skipped)",
            database.categories.len(),
            self.root.display(),
            database.warnings.len()
        );

        Ok(database)
    }

    fn category_path(&self, category: &str) -> PathBuf {
        self.root
            .join(format!("{}.{}", category, CATEGORY_FILE_EXTENSION))
    }

    fn open_reader(&self, category: &str) -> Result<BufReader<File>, StoreError> {
        match File::open(self.category_path(category)) {
            Ok(file) => Ok(BufReader::new(file)),
            Err(e) if e.kind() == ErrorKind::NotFound => {
                Err(StoreError::NotFound(category.to_string()))
            }
            Err(e) => Err(e.into()),
        }
    }

    /// Fix the database-wide dimension on first use and reject any other.
    fn check_dimensions(&self, category: &str, got: usize) -> Result<(), StoreError> {
        let expected = *self.dimensions.get_or_init(|| got);
        if expected != got {
            return Err(StoreError::DimensionMismatch {
                category: category.to_string(),
                expected,
                got,
            });
        }
        Ok(())
    }

    /// Write a category to a file.
    fn write_to_file(
        &self,
        path: &Path,
        category: &str,
        store: &CategoryStore,
    ) -> Result<(), StoreError> {
        let payload = encode_entries(category, store)?;

        let dimensions = u32::try_from(store.dimensions()).map_err(|_| StoreError::InvalidItem {
            category: category.to_string(),
            reason: format!("dimension {} does not fit the container", store.dimensions()),
        })?;

        let header = Header {
            version: FORMAT_VERSION,
            model_id: self.model_id,
            dimensions,
            entry_count: store.len() as u64,
            payload_checksum: crc32fast::hash(&payload),
        };

        let file = File::create(path)?;
        let mut writer = BufWriter::new(file);

        writer.write_all(&header.to_bytes())?;
        writer.write_all(&payload)?;

        // Flush and sync
        writer.flush()?;
        let file = writer.into_inner().map_err(|e| e.into_error())?;
        file.sync_all()?;

        Ok(())
    }

    /// Read header from file.
    fn read_header(
        &self,
        category: &str,
        reader: &mut BufReader<File>,
    ) -> Result<Header, StoreError> {
        let mut header_bytes = [0u8; HEADER_SIZE];
        if let Err(e) = reader.read_exact(&mut header_bytes) {
            return match e.kind() {
                ErrorKind::UnexpectedEof => Err(corrupt(category, "truncated header")),
                _ => Err(e.into()),
            };
        }

        if header_bytes[0..4] != MAGIC {
            return Err(corrupt(category, "not an embedding container"));
        }

        // Version check before the checksum: other versions may lay out the
        // header differently
        let version = header_bytes[4];
        if version != FORMAT_VERSION {
            return Err(StoreError::VersionMismatch {
                category: category.to_string(),
                found: version,
                supported: FORMAT_VERSION,
            });
        }

        let stored_checksum = u32::from_le_bytes(le_array(&header_bytes[53..57]));
        if stored_checksum != crc32fast::hash(&header_bytes[..CHECKSUMMED_HEADER]) {
            return Err(corrupt(category, "header checksum mismatch"));
        }

        let mut model_id = [0u8; 32];
        model_id.copy_from_slice(&header_bytes[5..37]);

        Ok(Header {
            version,
            model_id,
            dimensions: u32::from_le_bytes(le_array(&header_bytes[37..41])),
            entry_count: u64::from_le_bytes(le_array(&header_bytes[41..49])),
            payload_checksum: u32::from_le_bytes(le_array(&header_bytes[49..53])),
        })
    }

    /// Validate header against expected values.
    fn validate_header(&self, category: &str, header: &Header) -> Result<(), StoreError> {
        if header.model_id != self.model_id {
            return Err(StoreError::ModelMismatch(category.to_string()));
        }

        if let Some(expected) = self.dimensions() {
            if header.dimensions as usize != expected {
                return Err(StoreError::DimensionMismatch {
                    category: category.to_string(),
                    expected,
                    got: header.dimensions as usize,
                });
            }
        }

        Ok(())
    }
}

/// Reject names that cannot safely become a single file name.
pub fn validate_category(category: &str) -> Result<(), StoreError> {
    let invalid = category.is_empty()
        || category.starts_with('.')
        || category.len() > 200
        || category.contains(['/', '\\', '\0']);

    if invalid {
        return Err(StoreError::InvalidCategory(category.to_string()));
    }
    Ok(())
}

fn le_array<const N: usize>(bytes: &[u8]) -> [u8; N] {
    let mut out = [0u8; N];
    out.copy_from_slice(bytes);
    out
}

fn encode_entries(category: &str, store: &CategoryStore) -> Result<Vec<u8>, StoreError> {
    let mut payload = Vec::with_capacity(store.len() * (2 + 16 + store.dimensions() * 4));

    for (item, embedding) in store.iter() {
        let id_len = u16::try_from(item.len()).map_err(|_| StoreError::InvalidItem {
            category: category.to_string(),
            reason: format!("item id of {} bytes is too long", item.len()),
        })?;

        payload.extend_from_slice(&id_len.to_le_bytes());
        payload.extend_from_slice(item.as_bytes());
        for &value in embedding {
            payload.extend_from_slice(&value.to_le_bytes());
        }
    }

    Ok(payload)
}

fn decode_entries(
    category: &str,
    payload: &[u8],
    header: &Header,
) -> Result<CategoryStore, StoreError> {
    let dimensions = header.dimensions as usize;
    let mut store = CategoryStore::new(dimensions);
    let mut cursor = payload;

    let truncated = |_| corrupt(category, "truncated entry");

    for _ in 0..header.entry_count {
        let mut len_bytes = [0u8; 2];
        cursor.read_exact(&mut len_bytes).map_err(truncated)?;

        let mut id_bytes = vec![0u8; u16::from_le_bytes(len_bytes) as usize];
        cursor.read_exact(&mut id_bytes).map_err(truncated)?;
        let item = String::from_utf8(id_bytes)
            .map_err(|_| corrupt(category, "item id is not valid UTF-8"))?;

        let mut embedding = Vec::with_capacity(dimensions);
        for _ in 0..dimensions {
            let mut float_bytes = [0u8; 4];
            cursor.read_exact(&mut float_bytes).map_err(truncated)?;
            embedding.push(f32::from_le_bytes(float_bytes));
        }

        if store.contains(&item) {
            return Err(corrupt(category, format!("duplicate item '{}'", item)));
        }
        store
            .insert(item, embedding)
            .map_err(|e| corrupt(category, e.to_string()))?;
    }

    if !cursor.is_empty() {
        return Err(corrupt(
            category,
            format!("{} trailing bytes after last entry", cursor.len()),
        ));
    }

    Ok(store)
}

/// File header structure.
#[derive(Debug)]
struct Header {
    version: u8,
    model_id: [u8; 32],
    dimensions: u32,
    entry_count: u64,
    payload_checksum: u32,
}

impl Header {
    fn to_bytes(&self) -> [u8; HEADER_SIZE] {
        let mut header_bytes = [0u8; HEADER_SIZE];

        header_bytes[0..4].copy_from_slice(&MAGIC);
        header_bytes[4] = self.version;
        header_bytes[5..37].copy_from_slice(&self.model_id);
        header_bytes[37..41].copy_from_slice(&self.dimensions.to_le_bytes());
        header_bytes[41..49].copy_from_slice(&self.entry_count.to_le_bytes());
        header_bytes[49..53].copy_from_slice(&self.payload_checksum.to_le_bytes());

        // Compute and store checksum
        let checksum = crc32fast::hash(&header_bytes[..CHECKSUMMED_HEADER]);
        header_bytes[53..57].copy_from_slice(&checksum.to_le_bytes());

        header_bytes
    }
}
