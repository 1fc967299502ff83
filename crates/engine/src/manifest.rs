/// # Manifest - committed table set
///
/// Lists every fully-written table with its level and key range, plus the
/// highest log index whose effects are durable in those tables. Only tables
/// named here are part of the store; anything else found in the table
/// directory is a leftover of an interrupted flush or compaction and is
/// deleted on recovery.
///
/// ## File Format
///
/// Text, one record per line:
///
/// ```text
/// # RiptideKV manifest
/// flushed_index:1042
/// last_sequence:1042
/// next_file_id:17
/// L0:0000000016.sst 6b6579303030 6b6579393939
/// L1:0000000009.sst 61 6d
/// ```
///
/// Keys are hex encoded (`-` for the empty key). Lines starting with `#` are
/// comments; empty lines are ignored.
///
/// ## Crash Safety
///
/// The manifest is rewritten atomically: write `MANIFEST.tmp`, fsync, rename
/// over `MANIFEST`, fsync the directory. A crash leaves either the old or the
/// new table set, never a mix.
use anyhow::{bail, Context, Result};
use std::fs::{self, File, OpenOptions};
use std::io::{BufRead, BufReader, Write};
use std::path::{Path, PathBuf};

/// Name of the manifest file within the table directory.
pub const MANIFEST_FILENAME: &str = "MANIFEST";

const MANIFEST_TMP_FILENAME: &str = "MANIFEST.tmp";

/// One committed table.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TableMeta {
    /// Basename inside the table directory.
    pub file_name: String,
    pub level: usize,
    pub min_key: Vec<u8>,
    pub max_key: Vec<u8>,
}

/// In-memory copy of the manifest.
#[derive(Debug, Clone)]
pub struct Manifest {
    path: PathBuf,
    /// Tables in file order: L0 newest first, then deeper levels.
    pub tables: Vec<TableMeta>,
    /// Every log entry up to this index is reflected in `tables`.
    pub flushed_index: u64,
    /// Highest write sequence contained in `tables`.
    pub last_sequence: u64,
    pub next_file_id: u64,
}

impl Manifest {
    /// Loads `dir/MANIFEST`, or returns an empty manifest if none exists.
    ///
    /// # Errors
    ///
    /// Returns an error if the file exists but cannot be parsed.
    pub fn load_or_create(dir: &Path) -> Result<Self> {
        let path = dir.join(MANIFEST_FILENAME);
        let mut manifest = Self {
            path,
            tables: Vec::new(),
            flushed_index: 0,
            last_sequence: 0,
            next_file_id: 1,
        };
        if !manifest.path.exists() {
            return Ok(manifest);
        }

        let file = File::open(&manifest.path)
            .with_context(|| format!("failed to open manifest at {}", manifest.path.display()))?;
        for (line_num, line) in BufReader::new(file).lines().enumerate() {
            let line =
                line.with_context(|| format!("failed to read manifest line {}", line_num + 1))?;
            let trimmed = line.trim();
            if trimmed.is_empty() || trimmed.starts_with('#') {
                continue;
            }

            let (tag, rest) = trimmed.split_once(':').ok_or_else(|| {
                anyhow::anyhow!(
                    "manifest line {}: invalid format (expected '<tag>:<value>'): {}",
                    line_num + 1,
                    trimmed
                )
            })?;
            match tag {
                "flushed_index" => manifest.flushed_index = parse_u64(rest, line_num)?,
                "last_sequence" => manifest.last_sequence = parse_u64(rest, line_num)?,
                "next_file_id" => manifest.next_file_id = parse_u64(rest, line_num)?,
                level if level.starts_with('L') => {
                    let level: usize = level[1..].parse().with_context(|| {
                        format!("manifest line {}: bad level '{}'", line_num + 1, level)
                    })?;
                    let mut parts = rest.split_whitespace();
                    let (Some(file_name), Some(min), Some(max), None) =
                        (parts.next(), parts.next(), parts.next(), parts.next())
                    else {
                        bail!(
                            "manifest line {}: expected '<file> <min_key> <max_key>': {}",
                            line_num + 1,
                            rest
                        );
                    };
                    manifest.tables.push(TableMeta {
                        file_name: file_name.to_string(),
                        level,
                        min_key: from_hex(min).with_context(|| {
                            format!("manifest line {}: bad min key", line_num + 1)
                        })?,
                        max_key: from_hex(max).with_context(|| {
                            format!("manifest line {}: bad max key", line_num + 1)
                        })?,
                    });
                }
                other => bail!("manifest line {}: unknown tag '{}'", line_num + 1, other),
            }
        }
        Ok(manifest)
    }

    /// Persists the manifest atomically.
    ///
    /// On Windows `rename` over an existing file can fail while the target
    /// is still cached; in that case the file is rewritten in place, which is
    /// still safe because it is small and fsynced.
    pub fn save(&self) -> Result<()> {
        let tmp_path = self.path.with_file_name(MANIFEST_TMP_FILENAME);
        {
            let mut f = OpenOptions::new()
                .create(true)
                .write(true)
                .truncate(true)
                .open(&tmp_path)
                .with_context(|| {
                    format!("failed to create manifest tmp at {}", tmp_path.display())
                })?;
            self.write_contents(&mut f)?;
            f.flush()?;
            f.sync_all()?;
        }

        if fs::rename(&tmp_path, &self.path).is_err() {
            let mut f = OpenOptions::new()
                .create(true)
                .write(true)
                .truncate(true)
                .open(&self.path)
                .with_context(|| format!("failed to open manifest at {}", self.path.display()))?;
            self.write_contents(&mut f)?;
            f.flush()?;
            f.sync_all()?;
            let _ = fs::remove_file(&tmp_path);
        }
        sstable::sync_parent(&self.path);
        Ok(())
    }

    fn write_contents(&self, f: &mut File) -> Result<()> {
        writeln!(f, "# RiptideKV manifest")?;
        writeln!(f, "# Format: L<level>:<file> <min_key hex> <max_key hex>")?;
        writeln!(f, "flushed_index:{}", self.flushed_index)?;
        writeln!(f, "last_sequence:{}", self.last_sequence)?;
        writeln!(f, "next_file_id:{}", self.next_file_id)?;
        for t in &self.tables {
            writeln!(
                f,
                "L{}:{} {} {}",
                t.level,
                t.file_name,
                to_hex(&t.min_key),
                to_hex(&t.max_key)
            )?;
        }
        Ok(())
    }

    /// Tables of `level`, in manifest order.
    pub fn tables_at(&self, level: usize) -> impl Iterator<Item = &TableMeta> {
        self.tables.iter().filter(move |t| t.level == level)
    }

    /// Adds a table (does **not** save). L0 tables go in front so the level
    /// stays newest first.
    pub fn add(&mut self, meta: TableMeta) {
        let insert_pos = self
            .tables
            .iter()
            .position(|t| t.level >= meta.level)
            .unwrap_or(self.tables.len());
        self.tables.insert(insert_pos, meta);
    }

    /// Removes every table whose name is in `file_names`.
    pub fn remove_files(&mut self, file_names: &[String]) {
        self.tables.retain(|t| !file_names.contains(&t.file_name));
    }

    /// Replaces the whole table set (snapshot install).
    pub fn replace_all(&mut self, tables: Vec<TableMeta>) {
        self.tables = tables;
    }

    pub fn contains(&self, file_name: &str) -> bool {
        self.tables.iter().any(|t| t.file_name == file_name)
    }
}

fn parse_u64(s: &str, line_num: usize) -> Result<u64> {
    s.trim()
        .parse()
        .with_context(|| format!("manifest line {}: expected a number, got '{}'", line_num + 1, s))
}

fn to_hex(bytes: &[u8]) -> String {
    if bytes.is_empty() {
        return "-".to_string();
    }
    bytes.iter().map(|b| format!("{:02x}", b)).collect()
}

fn from_hex(s: &str) -> Result<Vec<u8>> {
    if s == "-" {
        return Ok(Vec::new());
    }
    if s.len() % 2 != 0 || !s.is_ascii() {
        bail!("malformed hex string");
    }
    (0..s.len())
        .step_by(2)
        .map(|i| u8::from_str_radix(&s[i..i + 2], 16).context("invalid hex digit"))
        .collect()
}

/// File name of table `id`.
pub fn table_file_name(id: u64) -> String {
    format!("{:010}.sst", id)
}

/// Parses a name produced by [`table_file_name`].
pub fn parse_table_file_name(name: &str) -> Option<u64> {
    name.strip_suffix(".sst")?.parse().ok()
}
