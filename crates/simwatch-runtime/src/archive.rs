use std::collections::BTreeSet;
use std::io::{Cursor, Read};
use std::path::{Component, Path, PathBuf};

use anyhow::{Context, Result};
use flate2::read::GzDecoder;
use flate2::write::GzEncoder;
use flate2::Compression;

/// Suffix of every per-container upload.
pub const CONTAINER_SUFFIX: &str = ".bp.tgz";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MemberKind {
    Dir,
    File,
}

/// One entry of a timestep archive, held in memory.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ArchiveMember {
    /// Relative path with any leading `./` removed.
    pub path: String,
    pub kind: MemberKind,
    pub mode: u32,
    pub data: Vec<u8>,
}

/// A decoded `images.tar.gz`.
#[derive(Debug, Clone, Default)]
pub struct TimestepArchive {
    members: Vec<ArchiveMember>,
}

/// The members of one container re-packed for upload.
#[derive(Debug, Clone)]
pub struct ContainerArchive {
    /// Manifest `file_name` this container was selected by.
    pub file_name: String,
    /// `<stem>.bp.tgz`
    pub upload_name: String,
    /// Path of the container directory relative to the archive root.
    pub root: String,
    pub members: Vec<ArchiveMember>,
    pub packed: Vec<u8>,
}

fn normalize(path: &str) -> String {
    let mut p = path;
    while let Some(rest) = p.strip_prefix("./") {
        p = rest;
    }
    p.trim_end_matches('/').to_string()
}

impl TimestepArchive {
    pub fn from_tar_gz(bytes: &[u8]) -> Result<Self> {
        let mut archive = tar::Archive::new(GzDecoder::new(Cursor::new(bytes)));
        let mut members = Vec::new();
        for entry in archive.entries().context("reading tar entries")? {
            let mut entry = entry.context("reading tar entry")?;
            let path = normalize(&entry.path()?.to_string_lossy());
            if path.is_empty() {
                continue;
            }
            let mode = entry.header().mode().unwrap_or(0o644);
            let kind = match entry.header().entry_type() {
                tar::EntryType::Directory => MemberKind::Dir,
                tar::EntryType::Regular | tar::EntryType::Continuous => MemberKind::File,
                other => {
                    tracing::debug!(path = %path, kind = ?other, "skipping archive member");
                    continue;
                }
            };
            let mut data = Vec::new();
            if kind == MemberKind::File {
                entry
                    .read_to_end(&mut data)
                    .with_context(|| format!("reading archive member {path}"))?;
            }
            members.push(ArchiveMember {
                path,
                kind,
                mode,
                data,
            });
        }
        Ok(Self { members })
    }

    pub fn members(&self) -> &[ArchiveMember] {
        &self.members
    }

    /// Members whose path starts with `prefix`.
    pub fn select(&self, prefix: &str) -> Vec<&ArchiveMember> {
        let prefix = normalize(prefix);
        self.members
            .iter()
            .filter(|m| m.path.starts_with(&prefix))
            .collect()
    }

    /// Splits the archive into one upload per distinct `file_name`, in name order.
    pub fn decompose<'a, I>(&self, file_names: I) -> Result<Vec<ContainerArchive>>
    where
        I: IntoIterator<Item = &'a str>,
    {
        let names: BTreeSet<&str> = file_names.into_iter().collect();
        let mut out = Vec::with_capacity(names.len());
        for file_name in names {
            let prefix = strip_upload_prefix(file_name);
            let members: Vec<ArchiveMember> =
                self.select(&prefix).into_iter().cloned().collect();
            if members.is_empty() {
                tracing::warn!(
                    file_name = file_name,
                    prefix = %prefix,
                    "no archive members match container"
                );
            }
            let root = container_root(&members, &prefix);
            let packed = pack(&members)?;
            out.push(ContainerArchive {
                file_name: file_name.to_string(),
                upload_name: container_upload_name(file_name),
                root,
                members,
                packed,
            });
        }
        Ok(out)
    }
}

/// `a/b/c/fields.bp` -> `c/fields.bp`. Names with two or fewer components are
/// already relative to the archive root.
pub fn strip_upload_prefix(file_name: &str) -> String {
    let normalized = normalize(file_name);
    let parts: Vec<&str> = normalized.split('/').collect();
    if parts.len() > 2 {
        parts[2..].join("/")
    } else {
        normalized
    }
}

/// `x/y/fields.bp` -> `fields.bp.tgz`; everything after the first `.` of the
/// base name is dropped.
pub fn container_upload_name(file_name: &str) -> String {
    let base = normalize(file_name);
    let base = base.rsplit('/').next().unwrap_or_default();
    let stem = base.split('.').next().unwrap_or_default();
    format!("{stem}{CONTAINER_SUFFIX}")
}

/// The `.bp` directory among `members`, else the selection prefix itself.
pub fn container_root(members: &[ArchiveMember], prefix: &str) -> String {
    members
        .iter()
        .find(|m| Path::new(&m.path).extension().is_some_and(|e| e == "bp"))
        .map(|m| m.path.clone())
        .unwrap_or_else(|| normalize(prefix))
}

/// Writes `members` as a fresh gzip-compressed tar.
pub fn pack(members: &[ArchiveMember]) -> Result<Vec<u8>> {
    let mut builder = tar::Builder::new(GzEncoder::new(Vec::new(), Compression::default()));
    for m in members {
        let mut header = tar::Header::new_gnu();
        header.set_mode(m.mode);
        match m.kind {
            MemberKind::Dir => {
                header.set_entry_type(tar::EntryType::Directory);
                header.set_size(0);
                builder
                    .append_data(&mut header, &m.path, std::io::empty())
                    .with_context(|| format!("packing {}", m.path))?;
            }
            MemberKind::File => {
                header.set_entry_type(tar::EntryType::Regular);
                header.set_size(m.data.len() as u64);
                builder
                    .append_data(&mut header, &m.path, m.data.as_slice())
                    .with_context(|| format!("packing {}", m.path))?;
            }
        }
    }
    let encoder = builder.into_inner().context("finishing tar stream")?;
    encoder.finish().context("finishing gzip stream")
}

fn safe_relative(path: &str) -> Option<PathBuf> {
    let p = Path::new(path);
    let mut out = PathBuf::new();
    for c in p.components() {
        match c {
            Component::Normal(part) => out.push(part),
            Component::CurDir => {}
            _ => return None,
        }
    }
    if out.as_os_str().is_empty() {
        None
    } else {
        Some(out)
    }
}

/// Materializes `members` below `dir`. Absolute paths and `..` are refused.
pub fn unpack_into(members: &[ArchiveMember], dir: &Path) -> Result<()> {
    for m in members {
        let rel = safe_relative(&m.path)
            .ok_or_else(|| anyhow::anyhow!("refusing unsafe archive path {:?}", m.path))?;
        let dest = dir.join(rel);
        match m.kind {
            MemberKind::Dir => std::fs::create_dir_all(&dest)
                .with_context(|| format!("creating {}", dest.display()))?,
            MemberKind::File => {
                if let Some(parent) = dest.parent() {
                    std::fs::create_dir_all(parent)
                        .with_context(|| format!("creating {}", parent.display()))?;
                }
                std::fs::write(&dest, &m.data)
                    .with_context(|| format!("writing {}", dest.display()))?;
            }
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn member(path: &str, data: &[u8]) -> ArchiveMember {
        ArchiveMember {
            path: path.to_string(),
            kind: MemberKind::File,
            mode: 0o644,
            data: data.to_vec(),
        }
    }

    fn dir(path: &str) -> ArchiveMember {
        ArchiveMember {
            path: path.to_string(),
            kind: MemberKind::Dir,
            mode: 0o755,
            data: Vec::new(),
        }
    }

    #[test]
    fn prefix_strip_and_upload_name() {
        assert_eq!(strip_upload_prefix("home/sim/run0/fields.bp"), "run0/fields.bp");
        assert_eq!(strip_upload_prefix("./a/b/c.bp"), "c.bp");
        assert_eq!(strip_upload_prefix("fields.bp"), "fields.bp");
        assert_eq!(container_upload_name("home/sim/fields.bp"), "fields.bp.tgz");
        assert_eq!(container_upload_name("diag.v2.bp"), "diag.bp.tgz");
    }

    #[test]
    fn decompose_selects_members_by_prefix() -> Result<()> {
        let members = vec![
            dir("./fields.bp"),
            member("./fields.bp/data.0", b"field-bytes"),
            member("./fields.bp/md.idx", b"idx"),
            dir("./diag.bp"),
            member("./diag.bp/data.0", b"diag-bytes"),
        ];
        let tgz = pack(&members)?;
        let archive = TimestepArchive::from_tar_gz(&tgz)?;
        assert_eq!(archive.members().len(), 5);
        assert_eq!(archive.members()[1].path, "fields.bp/data.0");

        let containers = archive.decompose(["x/y/fields.bp", "x/y/diag.bp", "x/y/fields.bp"])?;
        assert_eq!(containers.len(), 2);
        let fields = containers
            .iter()
            .find(|c| c.upload_name == "fields.bp.tgz")
            .ok_or_else(|| anyhow::anyhow!("fields container missing"))?;
        assert_eq!(fields.members.len(), 3);
        assert_eq!(fields.root, "fields.bp");

        let repacked = TimestepArchive::from_tar_gz(&fields.packed)?;
        let paths: Vec<_> = repacked.members().iter().map(|m| m.path.as_str()).collect();
        assert_eq!(paths, vec!["fields.bp", "fields.bp/data.0", "fields.bp/md.idx"]);
        Ok(())
    }

    #[test]
    fn unpack_refuses_escaping_paths() -> Result<()> {
        let dir = tempfile::tempdir()?;
        unpack_into(&[member("fields.bp/data.0", b"x")], dir.path())?;
        assert!(dir.path().join("fields.bp/data.0").is_file());
        assert!(unpack_into(&[member("../evil", b"x")], dir.path()).is_err());
        assert!(unpack_into(&[member("/etc/evil", b"x")], dir.path()).is_err());
        Ok(())
    }

    #[test]
    fn corrupt_archive_is_an_error() {
        assert!(TimestepArchive::from_tar_gz(b"not gzip").is_err());
    }
}
