use std::collections::HashMap;
use std::io::{Read, Write};
use std::path::Path;

use flate2::read::ZlibDecoder;
use flate2::write::ZlibEncoder;
use flate2::Compression;
use git2::{ObjectType, Odb, Oid};

use crate::error::{Error, Result};

/// A well-formed packfile containing zero objects: header plus its SHA-1
/// trailer. Sent by git clients for pushes that only move references.
pub const EMPTY_PACKFILE: [u8; 32] = [
    0x50, 0x41, 0x43, 0x4b, 0x00, 0x00, 0x00, 0x02, 0x00, 0x00, 0x00, 0x00, 0x02, 0x9d, 0x08,
    0x82, 0x3b, 0xd8, 0xa8, 0xea, 0xb5, 0x10, 0xad, 0x6a, 0xc7, 0x5c, 0x82, 0x3c, 0xfd, 0x3e,
    0xd3, 0x1e,
];

const PACK_HEADER_LENGTH: usize = 12;
const PACK_TRAILER_LENGTH: usize = 20;

/// Number of objects the packfile declares in its header.
pub fn pack_object_count(pack: &[u8]) -> Result<u32> {
    if pack.len() < PACK_HEADER_LENGTH + PACK_TRAILER_LENGTH {
        return Err(Error::Unpack("packfile too short".to_string()));
    }
    if &pack[0..4] != b"PACK" {
        return Err(Error::Unpack("bad packfile signature".to_string()));
    }
    let version = u32::from_be_bytes([pack[4], pack[5], pack[6], pack[7]]);
    if version != 2 && version != 3 {
        return Err(Error::Unpack(format!("unsupported packfile version {version}")));
    }
    Ok(u32::from_be_bytes([pack[8], pack[9], pack[10], pack[11]]))
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum PackEntryKind {
    Commit,
    Tree,
    Blob,
    Tag,
    OfsDelta,
    RefDelta,
}

impl PackEntryKind {
    fn from_raw(raw: u8) -> Result<Self> {
        match raw {
            1 => Ok(Self::Commit),
            2 => Ok(Self::Tree),
            3 => Ok(Self::Blob),
            4 => Ok(Self::Tag),
            6 => Ok(Self::OfsDelta),
            7 => Ok(Self::RefDelta),
            _ => Err(Error::Unpack(format!("invalid packfile object type {raw}"))),
        }
    }

    fn object_type(self) -> Option<ObjectType> {
        match self {
            Self::Commit => Some(ObjectType::Commit),
            Self::Tree => Some(ObjectType::Tree),
            Self::Blob => Some(ObjectType::Blob),
            Self::Tag => Some(ObjectType::Tag),
            _ => None,
        }
    }
}

struct ResolvedObject {
    kind: ObjectType,
    data: Vec<u8>,
}

/// Streams a packfile into a staging directory laid out like a git objects
/// directory (loose objects only). Deltas are resolved against earlier pack
/// entries or, for thin packs, against the repository's object database.
/// Returns the oids the pack introduced.
pub fn unpack_packfile(odb: &Odb<'_>, pack: &[u8], staging: &Path) -> Result<Vec<Oid>> {
    let declared = pack_object_count(pack)?;
    let mut offset = PACK_HEADER_LENGTH;

    let mut by_offset: HashMap<usize, Oid> = HashMap::new();
    let mut resolved: HashMap<Oid, ResolvedObject> = HashMap::new();
    let mut oids = Vec::with_capacity(declared as usize);

    for _ in 0..declared {
        if offset >= pack.len().saturating_sub(PACK_TRAILER_LENGTH) {
            return Err(Error::Unpack("truncated packfile".to_string()));
        }
        let entry_offset = offset;
        let (kind, size, header_length) = parse_entry_header(&pack[offset..])?;
        offset += header_length;

        let base = match kind {
            PackEntryKind::OfsDelta => {
                let (distance, length) = parse_offset_delta_distance(&pack[offset..])?;
                offset += length;
                let base_offset = entry_offset.checked_sub(distance).ok_or_else(|| {
                    Error::Unpack("delta base offset out of range".to_string())
                })?;
                let base_oid = by_offset.get(&base_offset).copied().ok_or_else(|| {
                    Error::Unpack("delta base not found in packfile".to_string())
                })?;
                Some(base_oid)
            }
            PackEntryKind::RefDelta => {
                if pack.len() < offset + 20 {
                    return Err(Error::Unpack("truncated packfile".to_string()));
                }
                let base_oid = Oid::from_bytes(&pack[offset..offset + 20])
                    .map_err(|err| Error::Unpack(err.message().to_string()))?;
                offset += 20;
                Some(base_oid)
            }
            _ => None,
        };

        let (data, consumed) = inflate_entry(&pack[offset..], size)?;
        offset += consumed;

        let object = match base {
            None => ResolvedObject {
                // Non-delta kinds always map to a real object type.
                kind: kind.object_type().unwrap(),
                data,
            },
            Some(base_oid) => {
                let (base_kind, base_data) = lookup_base(odb, &resolved, base_oid)?;
                let result = apply_delta(&base_data, &data)?;
                ResolvedObject {
                    kind: base_kind,
                    data: result,
                }
            }
        };

        let oid = write_loose_object(staging, object.kind, &object.data)?;
        by_offset.insert(entry_offset, oid);
        resolved.insert(oid, object);
        oids.push(oid);
    }

    if offset + PACK_TRAILER_LENGTH != pack.len() {
        return Err(Error::Unpack("trailing garbage in packfile".to_string()));
    }

    Ok(oids)
}

fn parse_entry_header(data: &[u8]) -> Result<(PackEntryKind, usize, usize)> {
    let mut index = 0;
    let first = *data
        .first()
        .ok_or_else(|| Error::Unpack("truncated packfile".to_string()))?;
    index += 1;
    let kind = PackEntryKind::from_raw((first >> 4) & 0x7)?;
    let mut size = (first & 0xf) as usize;
    let mut shift = 4;
    let mut byte = first;
    while byte & 0x80 != 0 {
        byte = *data
            .get(index)
            .ok_or_else(|| Error::Unpack("truncated packfile".to_string()))?;
        index += 1;
        size |= ((byte & 0x7f) as usize) << shift;
        shift += 7;
    }
    Ok((kind, size, index))
}

fn parse_offset_delta_distance(data: &[u8]) -> Result<(usize, usize)> {
    let mut index = 0;
    let mut byte = *data
        .first()
        .ok_or_else(|| Error::Unpack("truncated packfile".to_string()))?;
    index += 1;
    let mut distance = (byte & 0x7f) as usize;
    while byte & 0x80 != 0 {
        byte = *data
            .get(index)
            .ok_or_else(|| Error::Unpack("truncated packfile".to_string()))?;
        index += 1;
        distance = ((distance + 1) << 7) | (byte & 0x7f) as usize;
    }
    Ok((distance, index))
}

fn inflate_entry(data: &[u8], expected_size: usize) -> Result<(Vec<u8>, usize)> {
    let mut decoder = ZlibDecoder::new(data);
    let mut inflated = Vec::with_capacity(expected_size);
    decoder
        .read_to_end(&mut inflated)
        .map_err(|err| Error::Unpack(format!("corrupt packfile entry: {err}")))?;
    if inflated.len() != expected_size {
        return Err(Error::Unpack(format!(
            "packfile entry size mismatch: expected {expected_size}, got {}",
            inflated.len()
        )));
    }
    Ok((inflated, decoder.total_in() as usize))
}

fn lookup_base(
    odb: &Odb<'_>,
    resolved: &HashMap<Oid, ResolvedObject>,
    base_oid: Oid,
) -> Result<(ObjectType, Vec<u8>)> {
    if let Some(object) = resolved.get(&base_oid) {
        return Ok((object.kind, object.data.clone()));
    }
    // Thin pack: the base lives in the repository already.
    let object = odb
        .read(base_oid)
        .map_err(|_| Error::Unpack(format!("delta base {base_oid} not found")))?;
    let kind = object.kind();
    Ok((kind, object.data().to_vec()))
}

fn read_delta_size(delta: &[u8], index: &mut usize) -> Result<usize> {
    let mut size = 0usize;
    let mut shift = 0;
    loop {
        let byte = *delta
            .get(*index)
            .ok_or_else(|| Error::Unpack("truncated delta".to_string()))?;
        *index += 1;
        size |= ((byte & 0x7f) as usize) << shift;
        shift += 7;
        if byte & 0x80 == 0 {
            return Ok(size);
        }
    }
}

fn apply_delta(base: &[u8], delta: &[u8]) -> Result<Vec<u8>> {
    let mut index = 0;
    let base_size = read_delta_size(delta, &mut index)?;
    if base_size != base.len() {
        return Err(Error::Unpack("delta base size mismatch".to_string()));
    }
    let result_size = read_delta_size(delta, &mut index)?;
    let mut result = Vec::with_capacity(result_size);

    while index < delta.len() {
        let instruction = delta[index];
        index += 1;
        if instruction & 0x80 != 0 {
            // Copy from base.
            let mut copy_offset = 0usize;
            let mut copy_size = 0usize;
            for bit in 0..4 {
                if instruction & (1 << bit) != 0 {
                    let byte = *delta
                        .get(index)
                        .ok_or_else(|| Error::Unpack("truncated delta".to_string()))?;
                    index += 1;
                    copy_offset |= (byte as usize) << (8 * bit);
                }
            }
            for bit in 0..3 {
                if instruction & (1 << (4 + bit)) != 0 {
                    let byte = *delta
                        .get(index)
                        .ok_or_else(|| Error::Unpack("truncated delta".to_string()))?;
                    index += 1;
                    copy_size |= (byte as usize) << (8 * bit);
                }
            }
            if copy_size == 0 {
                copy_size = 0x10000;
            }
            let end = copy_offset
                .checked_add(copy_size)
                .filter(|end| *end <= base.len())
                .ok_or_else(|| Error::Unpack("delta copy out of range".to_string()))?;
            result.extend_from_slice(&base[copy_offset..end]);
        } else if instruction != 0 {
            // Insert literal bytes.
            let length = instruction as usize;
            let end = index
                .checked_add(length)
                .filter(|end| *end <= delta.len())
                .ok_or_else(|| Error::Unpack("truncated delta".to_string()))?;
            result.extend_from_slice(&delta[index..end]);
            index = end;
        } else {
            return Err(Error::Unpack("invalid delta instruction".to_string()));
        }
    }

    if result.len() != result_size {
        return Err(Error::Unpack("delta result size mismatch".to_string()));
    }
    Ok(result)
}

fn object_type_name(kind: ObjectType) -> &'static str {
    match kind {
        ObjectType::Commit => "commit",
        ObjectType::Tree => "tree",
        ObjectType::Blob => "blob",
        ObjectType::Tag => "tag",
        _ => "unknown",
    }
}

fn write_loose_object(staging: &Path, kind: ObjectType, data: &[u8]) -> Result<Oid> {
    let oid = Oid::hash_object(kind, data)?;
    let hex = oid.to_string();
    let directory = staging.join(&hex[..2]);
    std::fs::create_dir_all(&directory)?;
    let path = directory.join(&hex[2..]);
    if path.exists() {
        return Ok(oid);
    }

    let file = std::fs::File::create(&path)?;
    let mut encoder = ZlibEncoder::new(file, Compression::default());
    encoder.write_all(format!("{} {}\0", object_type_name(kind), data.len()).as_bytes())?;
    encoder.write_all(data)?;
    encoder.finish()?;
    Ok(oid)
}

/// Writes a packfile into the repository's permanent object storage.
pub fn persist_pack(odb: &Odb<'_>, pack: &[u8]) -> Result<()> {
    if pack_object_count(pack)? == 0 {
        return Ok(());
    }
    let mut writer = odb.packwriter()?;
    writer.write_all(pack)?;
    writer.commit()?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use git2::Repository;

    #[test]
    fn test_empty_packfile_header() {
        assert_eq!(pack_object_count(&EMPTY_PACKFILE).unwrap(), 0);
    }

    #[test]
    fn test_rejects_bad_signature() {
        let mut pack = EMPTY_PACKFILE;
        pack[0] = b'J';
        assert!(pack_object_count(&pack).is_err());
    }

    #[test]
    fn test_unpack_mempack_dump() {
        // Round-trip: objects dumped from one repository's mempack unpack
        // into a staging directory readable as an alternate by another.
        let source_dir = tempfile::tempdir().unwrap();
        let source = Repository::init_bare(source_dir.path()).unwrap();
        let odb = source.odb().unwrap();
        let mempack = odb.add_new_mempack_backend(999).unwrap();

        let blob = source.blob(b"1 2").unwrap();
        let mut builder = source.treebuilder(None).unwrap();
        builder.insert("0.in", blob, 0o100644).unwrap();
        let tree = builder.write().unwrap();

        let mut buf = git2::Buf::new();
        mempack.dump(&source, &mut buf).unwrap();
        let pack: &[u8] = &buf;
        assert_eq!(pack_object_count(pack).unwrap(), 2);

        let target_dir = tempfile::tempdir().unwrap();
        let target = Repository::init_bare(target_dir.path()).unwrap();
        let target_odb = target.odb().unwrap();
        let staging = tempfile::tempdir().unwrap();
        let oids = unpack_packfile(&target_odb, pack, staging.path()).unwrap();
        assert_eq!(oids.len(), 2);
        assert!(oids.contains(&blob));
        assert!(oids.contains(&tree));

        target_odb
            .add_disk_alternate(staging.path().to_str().unwrap())
            .unwrap();
        assert!(target_odb.read(tree).is_ok());
    }

    #[test]
    fn test_apply_delta_copy_and_insert() {
        let base = b"hello world";
        // base size 11, result size 9: copy "hello" from base, insert " git"
        let mut delta = vec![11u8, 9];
        delta.push(0x80 | 0x10 | 0x01);
        delta.push(0); // copy offset 0
        delta.push(5); // copy size 5
        delta.extend_from_slice(&[4, b' ', b'g', b'i', b't']);
        let result = apply_delta(base, &delta).unwrap();
        assert_eq!(result, b"hello git");
    }
}
