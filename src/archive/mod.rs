//! Self-contained, integrity-checked bundles of world state: a tar.gz
//! whose last entry is a manifest with a SHA-256 digest for every file.
//! Creation streams staged files through a digest tee; restore
//! re-computes every digest and refuses entries that escape the
//! extraction root.

use flate2::read::GzDecoder;
use flate2::write::GzEncoder;
use flate2::Compression;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::collections::BTreeMap;
use std::io::{BufRead, Read, Write};
use std::path::{Component, Path, PathBuf};
use tar::Builder;
use tracing::{info, warn};

use crate::prelude::*;

pub const MANIFEST_NAME: &str = "manifest.json";
pub const MANIFEST_VERSION: u32 = 1;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum FileKind {
    /// The primary store snapshot (the flag name survives from the
    /// original implementation).
    Bolt,
    Sql,
    Dict,
    Text,
    Conf,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ManifestEntry {
    pub sha256: String,
    pub size: u64,
    #[serde(rename = "type")]
    pub kind: FileKind,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Manifest {
    pub version: u32,
    pub server: String,
    /// RFC3339, UTC.
    pub timestamp: String,
    pub mud_name: String,
    pub objects: u64,
    pub files: BTreeMap<String, ManifestEntry>,
}

/// Everything an archive run needs to know. The store snapshot itself
/// comes in as a closure so the store can take its own read
/// transaction.
#[derive(Debug, Clone)]
pub struct ArchiveJob {
    pub archive_dir: PathBuf,
    pub server: String,
    pub mud_name: String,
    pub objects: u64,
    /// File name the store snapshot gets inside `data/`.
    pub store_name: String,
    pub sql_path: Option<PathBuf>,
    pub dict_dir: Option<PathBuf>,
    pub text_dir: Option<PathBuf>,
    pub conf_files: Vec<PathBuf>,
    /// Archives to keep; older ones are pruned after a successful
    /// create. Zero disables pruning.
    pub retain: usize,
}

type SnapshotFn<'a> = &'a dyn Fn(&Path) -> Result<(), ArchiveError>;
type CheckpointFn<'a> = &'a dyn Fn() -> Result<(), ArchiveError>;

/// Creates one archive and returns its path.
pub fn create(
    job: &ArchiveJob,
    snapshot: SnapshotFn<'_>,
    sql_checkpoint: Option<CheckpointFn<'_>>,
) -> Result<PathBuf, ArchiveError> {
    std::fs::create_dir_all(&job.archive_dir)?;

    let staging = tempfile::tempdir_in(&job.archive_dir)?;

    let store_staged = staging.path().join(&job.store_name);
    snapshot(&store_staged)?;

    let timestamp = chrono::Utc::now();
    let stem = format!(
        "{}-{}",
        sanitize_name(&job.mud_name),
        timestamp.format("%Y%m%d-%H%M%S"),
    );

    // concurrent archive runs may land in the same second; never
    // clobber an archive that is still being written
    let mut out_path = job.archive_dir.join(format!("{stem}.tar.gz"));
    let mut n = 1;
    while out_path.exists() {
        out_path = job.archive_dir.join(format!("{stem}-{n}.tar.gz"));
        n += 1;
    }

    let file = std::fs::File::create(&out_path)?;
    let encoder = GzEncoder::new(file, Compression::default());
    let mut tar = Builder::new(encoder);

    let mut manifest = Manifest {
        version: MANIFEST_VERSION,
        server: job.server.clone(),
        timestamp: timestamp.to_rfc3339_opts(chrono::SecondsFormat::Secs, true),
        mud_name: job.mud_name.clone(),
        objects: job.objects,
        files: BTreeMap::new(),
    };

    append_file(
        &mut tar,
        &mut manifest,
        &store_staged,
        &format!("data/{}", job.store_name),
        FileKind::Bolt,
    )?;

    if let Some(sql_path) = &job.sql_path {
        if let Some(checkpoint) = sql_checkpoint {
            checkpoint()?;
        }
        if sql_path.exists() {
            append_file(&mut tar, &mut manifest, sql_path, "data/game.sqldb", FileKind::Sql)?;
        }
    }

    if let Some(dict_dir) = &job.dict_dir {
        append_dir(&mut tar, &mut manifest, dict_dir, "data/dict", FileKind::Dict)?;
    }

    if let Some(text_dir) = &job.text_dir {
        append_dir(&mut tar, &mut manifest, text_dir, "text", FileKind::Text)?;
    }

    for conf in &job.conf_files {
        if !conf.exists() {
            continue;
        }
        let name = conf
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_default();
        append_file(&mut tar, &mut manifest, conf, &format!("conf/{name}"), FileKind::Conf)?;
    }

    // the manifest goes in last so a streaming reader can stop there
    let manifest_bytes = serde_json::to_vec_pretty(&manifest)?;
    let mut header = tar::Header::new_gnu();
    header.set_size(manifest_bytes.len() as u64);
    header.set_mode(0o644);
    header.set_cksum();
    tar.append_data(&mut header, MANIFEST_NAME, manifest_bytes.as_slice())?;

    tar.finish()?;

    info!(
        path = %out_path.display(),
        objects = job.objects,
        files = manifest.files.len(),
        "archive created"
    );

    if job.retain > 0 {
        prune(&job.archive_dir, job.retain)?;
    }

    Ok(out_path)
}

fn append_file(
    tar: &mut Builder<GzEncoder<std::fs::File>>,
    manifest: &mut Manifest,
    source: &Path,
    arch_name: &str,
    kind: FileKind,
) -> Result<(), ArchiveError> {
    let size = std::fs::metadata(source)?.len();
    let file = std::fs::File::open(source)?;

    let mut reader = DigestReader::new(file);

    let mut header = tar::Header::new_gnu();
    header.set_size(size);
    header.set_mode(0o644);
    header.set_cksum();
    tar.append_data(&mut header, arch_name, &mut reader)?;

    manifest.files.insert(
        arch_name.to_owned(),
        ManifestEntry {
            sha256: reader.finish(),
            size,
            kind,
        },
    );

    Ok(())
}

fn append_dir(
    tar: &mut Builder<GzEncoder<std::fs::File>>,
    manifest: &mut Manifest,
    source: &Path,
    arch_prefix: &str,
    kind: FileKind,
) -> Result<(), ArchiveError> {
    if !source.is_dir() {
        return Ok(());
    }

    let mut entries: Vec<PathBuf> = std::fs::read_dir(source)?
        .filter_map(|e| e.ok().map(|e| e.path()))
        .collect();
    entries.sort();

    for path in entries {
        let name = path
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_default();
        let arch_name = format!("{arch_prefix}/{name}");

        if path.is_dir() {
            append_dir(tar, manifest, &path, &arch_name, kind)?;
        } else {
            append_file(tar, manifest, &path, &arch_name, kind)?;
        }
    }

    Ok(())
}

/// Read tee that feeds a SHA-256 digest as bytes stream by.
struct DigestReader<R> {
    inner: R,
    hasher: Sha256,
}

impl<R: Read> DigestReader<R> {
    fn new(inner: R) -> Self {
        Self {
            inner,
            hasher: Sha256::new(),
        }
    }

    fn finish(self) -> String {
        hex::encode(self.hasher.finalize())
    }
}

impl<R: Read> Read for DigestReader<R> {
    fn read(&mut self, buf: &mut [u8]) -> std::io::Result<usize> {
        let n = self.inner.read(buf)?;
        self.hasher.update(&buf[..n]);
        Ok(n)
    }
}

fn sanitize_name(name: &str) -> String {
    let cleaned: String = name
        .chars()
        .map(|c| if c.is_alphanumeric() || c == '-' { c } else { '_' })
        .collect();
    if cleaned.is_empty() {
        "mush".to_owned()
    } else {
        cleaned
    }
}

/// Destinations for restored artifacts.
pub struct RestoreOptions {
    pub data_dir: PathBuf,
    pub conf_dir: PathBuf,
    pub dict_dir: Option<PathBuf>,
    pub text_dir: Option<PathBuf>,
}

#[derive(Debug, Default)]
pub struct RestoreSummary {
    pub restored: Vec<String>,
    pub skipped: Vec<String>,
}

/// Restores an archive: extract under a traversal guard, verify every
/// manifest digest, place binary artifacts, and walk config conflicts
/// through the caller-supplied prompt streams.
pub fn restore(
    archive_path: &Path,
    opts: &RestoreOptions,
    mut input: impl BufRead,
    mut output: impl Write,
) -> Result<RestoreSummary, ArchiveError> {
    let extract_root = tempfile::tempdir()?;
    extract_guarded(archive_path, extract_root.path())?;

    let manifest_path = extract_root.path().join(MANIFEST_NAME);
    if !manifest_path.exists() {
        return Err(ArchiveError::MissingManifest);
    }
    let manifest: Manifest = serde_json::from_reader(std::fs::File::open(&manifest_path)?)?;

    // every entry must hash to what the manifest recorded
    for (name, entry) in &manifest.files {
        let path = extract_root.path().join(name);
        let actual = sha256_file(&path)?;
        if actual != entry.sha256 {
            return Err(ArchiveError::Corrupt(name.clone()));
        }
    }

    let mut summary = RestoreSummary::default();

    for (name, entry) in &manifest.files {
        let source = extract_root.path().join(name);

        let dest = match entry.kind {
            FileKind::Bolt | FileKind::Sql => Some(opts.data_dir.join(file_name(name))),
            FileKind::Dict => opts
                .dict_dir
                .as_ref()
                .map(|d| d.join(strip_prefix(name, "data/dict/"))),
            FileKind::Text => opts
                .text_dir
                .as_ref()
                .map(|d| d.join(strip_prefix(name, "text/"))),
            FileKind::Conf => {
                let dest = opts.conf_dir.join(file_name(name));
                if restore_conf(&source, &dest, name, &mut input, &mut output)? {
                    summary.restored.push(name.clone());
                } else {
                    summary.skipped.push(name.clone());
                }
                continue;
            }
        };

        match dest {
            Some(dest) => {
                if let Some(parent) = dest.parent() {
                    std::fs::create_dir_all(parent)?;
                }
                std::fs::copy(&source, &dest)?;
                summary.restored.push(name.clone());
            }
            None => summary.skipped.push(name.clone()),
        }
    }

    info!(
        archive = %archive_path.display(),
        restored = summary.restored.len(),
        skipped = summary.skipped.len(),
        "restore complete"
    );

    Ok(summary)
}

/// Extracts the tar.gz, rejecting any entry whose cleaned path would
/// land outside `root`.
fn extract_guarded(archive_path: &Path, root: &Path) -> Result<(), ArchiveError> {
    let file = std::fs::File::open(archive_path)?;
    let mut tar = tar::Archive::new(GzDecoder::new(file));

    for entry in tar.entries()? {
        let mut entry = entry?;
        let raw = entry.path()?.into_owned();

        if !path_is_contained(&raw) {
            return Err(ArchiveError::Path(raw.display().to_string()));
        }

        let dest = root.join(&raw);
        if let Some(parent) = dest.parent() {
            std::fs::create_dir_all(parent)?;
        }
        entry.unpack(&dest)?;
    }

    Ok(())
}

/// True when the relative path stays inside its root once cleaned.
fn path_is_contained(path: &Path) -> bool {
    let mut depth: i32 = 0;
    for component in path.components() {
        match component {
            Component::Prefix(_) | Component::RootDir => return false,
            Component::ParentDir => {
                depth -= 1;
                if depth < 0 {
                    return false;
                }
            }
            Component::Normal(_) => depth += 1,
            Component::CurDir => {}
        }
    }
    true
}

/// Places one config file, prompting Keep/Use/Diff/Skip when the
/// destination exists with different content. Returns true when the
/// archive copy ended up at the destination.
fn restore_conf(
    source: &Path,
    dest: &Path,
    name: &str,
    input: &mut impl BufRead,
    output: &mut impl Write,
) -> Result<bool, ArchiveError> {
    if !dest.exists() {
        if let Some(parent) = dest.parent() {
            std::fs::create_dir_all(parent)?;
        }
        std::fs::copy(source, dest)?;
        return Ok(true);
    }

    let current = std::fs::read_to_string(dest).unwrap_or_default();
    let incoming = std::fs::read_to_string(source).unwrap_or_default();

    if current == incoming {
        return Ok(false);
    }

    loop {
        write!(
            output,
            "{name} differs from the existing file. [K]eep existing, [U]se archive, [D]iff, [S]kip? "
        )?;
        output.flush()?;

        let mut answer = String::new();
        if input.read_line(&mut answer)? == 0 {
            // no interactive input: keep the existing file
            return Ok(false);
        }

        match answer.trim().to_lowercase().as_str() {
            "u" | "use" => {
                std::fs::copy(source, dest)?;
                return Ok(true);
            }
            "k" | "keep" | "s" | "skip" => return Ok(false),
            "d" | "diff" => {
                write_diff(output, &current, &incoming)?;
            }
            _ => {
                writeln!(output, "please answer k, u, d or s")?;
            }
        }
    }
}

/// Line-oriented diff, old lines prefixed `-`, new lines `+`.
fn write_diff(output: &mut impl Write, current: &str, incoming: &str) -> std::io::Result<()> {
    let old: Vec<&str> = current.lines().collect();
    let new: Vec<&str> = incoming.lines().collect();

    for i in 0..old.len().max(new.len()) {
        match (old.get(i), new.get(i)) {
            (Some(a), Some(b)) if a == b => {}
            (a, b) => {
                if let Some(a) = a {
                    writeln!(output, "-{a}")?;
                }
                if let Some(b) = b {
                    writeln!(output, "+{b}")?;
                }
            }
        }
    }

    Ok(())
}

fn file_name(arch_name: &str) -> String {
    Path::new(arch_name)
        .file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_else(|| arch_name.to_owned())
}

fn strip_prefix<'a>(name: &'a str, prefix: &str) -> &'a str {
    name.strip_prefix(prefix).unwrap_or(name)
}

fn sha256_file(path: &Path) -> Result<String, ArchiveError> {
    let mut file = std::fs::File::open(path)?;
    let mut hasher = Sha256::new();
    std::io::copy(&mut file, &mut hasher)?;
    Ok(hex::encode(hasher.finalize()))
}

/// Summary line for one archive on disk.
#[derive(Debug, Clone)]
pub struct ArchiveInfo {
    pub path: PathBuf,
    pub size: u64,
    pub timestamp: String,
    pub mud_name: String,
    pub objects: u64,
}

/// Scans a directory for archives, reading each manifest through a
/// streaming tar reader (stopping at the first manifest entry).
/// Newest first.
pub fn list(dir: &Path) -> Result<Vec<ArchiveInfo>, ArchiveError> {
    let mut out = Vec::new();

    if !dir.is_dir() {
        return Ok(out);
    }

    for entry in std::fs::read_dir(dir)? {
        let entry = entry?;
        let path = entry.path();
        let name = path.file_name().map(|n| n.to_string_lossy().into_owned());

        if !name.map(|n| n.ends_with(".tar.gz")).unwrap_or(false) {
            continue;
        }

        match read_manifest(&path) {
            Ok(manifest) => out.push(ArchiveInfo {
                size: entry.metadata()?.len(),
                timestamp: manifest.timestamp,
                mud_name: manifest.mud_name,
                objects: manifest.objects,
                path,
            }),
            Err(e) => warn!(path = %path.display(), error = %e, "skipping unreadable archive"),
        }
    }

    out.sort_by(|a, b| b.timestamp.cmp(&a.timestamp));
    Ok(out)
}

fn read_manifest(path: &Path) -> Result<Manifest, ArchiveError> {
    let file = std::fs::File::open(path)?;
    let mut tar = tar::Archive::new(GzDecoder::new(file));

    for entry in tar.entries()? {
        let mut entry = entry?;
        if entry.path()?.as_os_str() == MANIFEST_NAME {
            let mut bytes = Vec::new();
            entry.read_to_end(&mut bytes)?;
            return Ok(serde_json::from_slice(&bytes)?);
        }
    }

    Err(ArchiveError::MissingManifest)
}

/// Deletes the oldest archives past `retain`.
pub fn prune(dir: &Path, retain: usize) -> Result<usize, ArchiveError> {
    let archives = list(dir)?;
    let mut removed = 0;

    for info in archives.iter().skip(retain) {
        std::fs::remove_file(&info.path)?;
        info!(path = %info.path.display(), "pruned old archive");
        removed += 1;
    }

    Ok(removed)
}
