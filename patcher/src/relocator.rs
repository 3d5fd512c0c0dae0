// Licensed under the Apache License, Version 2.0 or the MIT License.
// SPDX-License-Identifier: Apache-2.0 OR MIT

//! Relocation engine
//!
//! Rewrites a flat Thumb image compiled at one base address so that it
//! executes at another. Four passes run in a fixed order: the vector
//! table, direct branches plus in-image literal pool words, literals that
//! point into data, and contiguous jump tables emitted for switch
//! statements. A ledger of already-rewritten original values is threaded
//! through the passes so no word is patched twice.

use std::collections::HashSet;
use std::fs;
use std::path::{Path, PathBuf};

use log::{debug, info, warn};

use crate::disasm::{self, BranchKind, DecodedInsn};
use crate::error::PatchError;
use crate::map_file::{self, AddressRange, MapFile};

/// Cortex-M vector table size this bootloader reserves: initial stack
/// pointer plus 47 exception and interrupt vectors.
pub const DEFAULT_VECTOR_TABLE_SIZE: usize = 192;

/// Jump-table sweep window: up to 10 words examined per starting offset.
const TABLE_WINDOW: usize = 10;
/// Minimum run of code pointers accepted as a jump table.
const TABLE_MIN_ENTRIES: usize = 4;

/// Original values already rewritten, tracked per pass. Later passes check
/// earlier sets before touching a word, so a pool entry the branch pass
/// adjusted is never adjusted again by the literal or jump-table pass.
#[derive(Debug, Default)]
struct PatchLedger {
    vector_entries: HashSet<u32>,
    branches: HashSet<u32>,
    consts: HashSet<u32>,
    jump_targets: HashSet<u32>,
}

/// How many words each pass rewrote. Vector entries are counted once per
/// distinct handler address even when several slots share one handler.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct PatchStats {
    pub vector_entries: usize,
    pub branch_targets: usize,
    pub code_literals: usize,
    pub data_literals: usize,
    pub jump_table_entries: usize,
}

#[derive(Debug)]
pub struct Relocation {
    pub image: Vec<u8>,
    pub stats: PatchStats,
}

/// Relocate `bin` from `original_base` to `new_base` using the section
/// classification in `map`. The input must at least hold the vector table.
pub fn relocate(
    bin: &[u8],
    map: &MapFile,
    original_base: u32,
    new_base: u32,
    vector_table_size: usize,
) -> Result<Relocation, PatchError> {
    if bin.len() < vector_table_size {
        return Err(PatchError::ImageTooSmall {
            len: bin.len(),
            table_size: vector_table_size,
        });
    }

    let delta = new_base.wrapping_sub(original_base);
    info!("relocating 0x{original_base:08x} -> 0x{new_base:08x} (offset 0x{delta:08x})");

    let mut image = bin.to_vec();
    let mut ledger = PatchLedger::default();
    let mut stats = PatchStats::default();

    patch_vector_table(&mut image, vector_table_size, delta, &mut ledger, &mut stats);

    // Decode after the vector pass, over the already-patched bytes.
    let insns = disasm::decode_thumb(&image, original_base)?;
    if insns.is_empty() {
        warn!("decoder produced no instructions; branch and literal passes are no-ops");
    }

    note_branches(
        &mut image,
        &insns,
        original_base,
        delta,
        &mut ledger,
        &mut stats,
    );

    let exec_ranges = map.executable_ranges();
    let data_ranges = map.data_ranges();
    if exec_ranges.is_empty() {
        warn!("map yielded no executable ranges; jump tables cannot be recognized");
    }
    if data_ranges.is_empty() {
        warn!("map yielded no data ranges; data literals cannot be recognized");
    }

    patch_absolute_loads(
        &mut image,
        &insns,
        original_base,
        delta,
        &data_ranges,
        &mut ledger,
        &mut stats,
    );
    patch_jump_tables(&mut image, delta, &exec_ranges, &mut ledger, &mut stats);

    info!(
        "patched {} vectors, {} code literals, {} data literals, {} jump-table entries \
         ({} branch targets noted)",
        stats.vector_entries,
        stats.code_literals,
        stats.data_literals,
        stats.jump_table_entries,
        stats.branch_targets,
    );
    Ok(Relocation { image, stats })
}

/// Read the binary and map from disk and relocate. Returns the suggested
/// output path alongside the result; nothing is written.
pub fn relocate_file(
    bin_path: &Path,
    map_path: &Path,
    original_base: u32,
    new_base: u32,
    vector_table_size: usize,
) -> Result<(PathBuf, Relocation), PatchError> {
    let bin = fs::read(bin_path).map_err(|source| PatchError::BinUnreadable {
        path: bin_path.to_path_buf(),
        source,
    })?;
    let map = MapFile::parse(map_path)?;
    let relocation = relocate(&bin, &map, original_base, new_base, vector_table_size)?;
    Ok((suggested_output_path(bin_path, new_base), relocation))
}

/// `firmware.bin` relocated to 0x10000 becomes `firmware_at_0x10000.bin`,
/// next to the input.
pub fn suggested_output_path(bin_path: &Path, new_base: u32) -> PathBuf {
    let stem = bin_path
        .file_stem()
        .and_then(|s| s.to_str())
        .unwrap_or("firmware");
    bin_path.with_file_name(format!("{stem}_at_{new_base:#x}.bin"))
}

pub fn write_image(path: &Path, image: &[u8]) -> Result<(), PatchError> {
    fs::write(path, image).map_err(|source| PatchError::OutputUnwritable {
        path: path.to_path_buf(),
        source,
    })
}

/// Erased or empty words carry no address and are never touched.
fn is_sentinel(word: u32) -> bool {
    word == 0 || word == 0xFFFF_FFFF
}

fn read_word(image: &[u8], offset: usize) -> u32 {
    u32::from_le_bytes(image[offset..offset + 4].try_into().unwrap())
}

fn write_word(image: &mut [u8], offset: usize, value: u32) {
    image[offset..offset + 4].copy_from_slice(&value.to_le_bytes());
}

/// Is `addr` inside the loaded image `[base, base + len)`?
fn in_image(base: u32, len: usize, addr: u32) -> bool {
    (addr.wrapping_sub(base) as usize) < len
}

/// Offset of a literal pool word inside the image, if the whole word fits.
fn literal_offset(base: u32, len: usize, literal_addr: u32) -> Option<usize> {
    let offset = literal_addr.wrapping_sub(base) as usize;
    (offset < len.saturating_sub(4)).then_some(offset)
}

/// Pass 1: every non-sentinel vector entry moves with the image. Slot 0 is
/// the initial stack pointer and stays untouched. The ledger keys on the
/// handler address, so a handler shared by several slots is rewritten in
/// each slot but counted once.
fn patch_vector_table(
    image: &mut [u8],
    table_size: usize,
    delta: u32,
    ledger: &mut PatchLedger,
    stats: &mut PatchStats,
) {
    for i in 1..table_size / 4 {
        let pos = i * 4;
        let entry = read_word(image, pos);
        if is_sentinel(entry) {
            continue;
        }
        let new_entry = entry.wrapping_add(delta);
        write_word(image, pos, new_entry);
        if ledger.vector_entries.insert(entry) {
            stats.vector_entries += 1;
        }
        debug!("vector @ 0x{pos:03x}: 0x{entry:08x} -> 0x{new_entry:08x}");
    }
}

/// Pass 2: direct branches stay encoded PC-relative and survive the move
/// as-is, but their targets are recorded so later passes leave matching
/// words alone. Literal pool words that point back into the image move
/// with it; the pool address is recorded.
fn note_branches(
    image: &mut [u8],
    insns: &[DecodedInsn],
    base: u32,
    delta: u32,
    ledger: &mut PatchLedger,
    stats: &mut PatchStats,
) {
    let len = image.len();
    for insn in insns {
        match *insn {
            DecodedInsn::Branch {
                address,
                kind,
                target,
            } => {
                if in_image(base, len, target) && ledger.branches.insert(target) {
                    stats.branch_targets += 1;
                    let mnemonic = match kind {
                        BranchKind::B => "b",
                        BranchKind::Bl => "bl",
                    };
                    debug!("{mnemonic} @ 0x{address:08x} targets 0x{target:08x}");
                }
            }
            DecodedInsn::PcRelLoad {
                address: _,
                literal_addr,
            } => {
                let Some(offset) = literal_offset(base, len, literal_addr) else {
                    continue;
                };
                if ledger.branches.contains(&literal_addr) {
                    continue;
                }
                let value = read_word(image, offset);
                if in_image(base, len, value) {
                    let new_value = value.wrapping_add(delta);
                    write_word(image, offset, new_value);
                    ledger.branches.insert(literal_addr);
                    stats.code_literals += 1;
                    debug!("literal @ 0x{literal_addr:08x}: 0x{value:08x} -> 0x{new_value:08x}");
                }
            }
            DecodedInsn::Other { .. } => {}
        }
    }
}

/// Pass 3: literals whose value points into a data section move with the
/// image. Pool words the branch pass already rewrote are skipped, as are
/// values rewritten once before (the compiler shares pool entries).
fn patch_absolute_loads(
    image: &mut [u8],
    insns: &[DecodedInsn],
    base: u32,
    delta: u32,
    data_ranges: &[AddressRange],
    ledger: &mut PatchLedger,
    stats: &mut PatchStats,
) {
    let len = image.len();
    for insn in insns {
        let DecodedInsn::PcRelLoad { literal_addr, .. } = *insn else {
            continue;
        };
        let Some(offset) = literal_offset(base, len, literal_addr) else {
            continue;
        };
        if ledger.branches.contains(&literal_addr) {
            continue;
        }
        let value = read_word(image, offset);
        if !map_file::contains(data_ranges, value) || ledger.consts.contains(&value) {
            continue;
        }
        let new_value = value.wrapping_add(delta);
        write_word(image, offset, new_value);
        ledger.consts.insert(value);
        stats.data_literals += 1;
        debug!("data literal @ 0x{literal_addr:08x}: 0x{value:08x} -> 0x{new_value:08x}");
    }
}

/// Pass 4: switch statements compile to contiguous tables of absolute code
/// pointers. Sweep the image at word granularity; a run of at least four
/// non-sentinel words that all point into executable ranges is a table.
/// Entries whose original value an earlier pass already handled are
/// skipped. The sweep never advances past a match: a rewritten word no
/// longer looks like a code pointer, so it cannot re-match.
fn patch_jump_tables(
    image: &mut [u8],
    delta: u32,
    exec_ranges: &[AddressRange],
    ledger: &mut PatchLedger,
    stats: &mut PatchStats,
) {
    let len = image.len();
    for start in (0..len.saturating_sub(TABLE_WINDOW * 4)).step_by(4) {
        let mut entries: Vec<(usize, u32)> = Vec::new();
        for slot in 0..TABLE_WINDOW {
            let offset = start + slot * 4;
            if offset + 4 > len {
                break;
            }
            let word = read_word(image, offset);
            if is_sentinel(word) || !map_file::contains(exec_ranges, word) {
                break;
            }
            entries.push((offset, word));
        }
        if entries.len() < TABLE_MIN_ENTRIES {
            continue;
        }
        for (offset, word) in entries {
            if ledger.jump_targets.contains(&word)
                || ledger.vector_entries.contains(&word)
                || ledger.branches.contains(&word)
            {
                continue;
            }
            let new_word = word.wrapping_add(delta);
            write_word(image, offset, new_word);
            ledger.jump_targets.insert(word);
            stats.jump_table_entries += 1;
            debug!("jump entry @ 0x{offset:08x}: 0x{word:08x} -> 0x{new_word:08x}");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::map_file::{Section, SectionKind};

    const NOP: [u8; 2] = [0x00, 0xBF];

    fn map_of(sections: &[(&str, u32, u32, SectionKind)]) -> MapFile {
        let mut map = MapFile::default();
        for &(name, start, size, kind) in sections {
            map.sections
                .insert(name.to_string(), Section { start, size, kind });
        }
        map
    }

    fn code_map(start: u32, size: u32) -> MapFile {
        map_of(&[(".text", start, size, SectionKind::Code)])
    }

    /// Image of `len` bytes: the first word is a stack pointer, the rest of
    /// the vector region is zero, and everything after it is NOPs.
    fn blank_image(len: usize) -> Vec<u8> {
        let mut image = vec![0u8; len];
        write_word(&mut image, 0, 0x2000_1000);
        for offset in (DEFAULT_VECTOR_TABLE_SIZE..len).step_by(2) {
            image[offset..offset + 2].copy_from_slice(&NOP);
        }
        image
    }

    #[test]
    fn zero_delta_is_identity() {
        let mut image = blank_image(0x100);
        write_word(&mut image, 4, 0x0000_0101);
        write_word(&mut image, 8, 0x0000_0105);
        let map = code_map(0, 0x1000);
        let out = relocate(&image, &map, 0, 0, DEFAULT_VECTOR_TABLE_SIZE).unwrap();
        assert_eq!(out.image, image);
    }

    #[test]
    fn short_image_is_rejected() {
        let err = relocate(
            &[0u8; 64],
            &MapFile::default(),
            0,
            0x10000,
            DEFAULT_VECTOR_TABLE_SIZE,
        )
        .unwrap_err();
        assert!(matches!(
            err,
            PatchError::ImageTooSmall {
                len: 64,
                table_size: DEFAULT_VECTOR_TABLE_SIZE
            }
        ));
    }

    #[test]
    fn vector_entries_move_and_stack_pointer_stays() {
        let mut image = blank_image(DEFAULT_VECTOR_TABLE_SIZE);
        write_word(&mut image, 4, 0x0000_0101);
        write_word(&mut image, 8, 0x0000_0105);
        write_word(&mut image, 12, 0x0000_0109);
        write_word(&mut image, 16, 0xFFFF_FFFF);
        let map = code_map(0, 0x1000);

        let out = relocate(&image, &map, 0, 0x10000, DEFAULT_VECTOR_TABLE_SIZE).unwrap();
        assert_eq!(read_word(&out.image, 0), 0x2000_1000);
        assert_eq!(read_word(&out.image, 4), 0x0001_0101);
        assert_eq!(read_word(&out.image, 8), 0x0001_0105);
        assert_eq!(read_word(&out.image, 12), 0x0001_0109);
        assert_eq!(read_word(&out.image, 16), 0xFFFF_FFFF);
        assert_eq!(read_word(&out.image, 20), 0);
        assert_eq!(out.stats.vector_entries, 3);
    }

    #[test]
    fn duplicate_handlers_are_rewritten_in_every_slot() {
        let mut image = blank_image(DEFAULT_VECTOR_TABLE_SIZE);
        write_word(&mut image, 4, 0x0000_0101);
        write_word(&mut image, 8, 0x0000_0101);
        let map = code_map(0, 0x1000);

        let out = relocate(&image, &map, 0, 0x10000, DEFAULT_VECTOR_TABLE_SIZE).unwrap();
        assert_eq!(read_word(&out.image, 4), 0x0001_0101);
        assert_eq!(read_word(&out.image, 8), 0x0001_0101);
        // Dedup affects reporting only.
        assert_eq!(out.stats.vector_entries, 1);
    }

    #[test]
    fn data_literal_moves_with_the_image() {
        let mut image = blank_image(0x210);
        // ldr r0, [pc, #4] at 0x200 reads the literal at 0x208.
        image[0x200..0x202].copy_from_slice(&[0x01, 0x48]);
        write_word(&mut image, 0x208, 0x2000_0400);
        let map = map_of(&[(".data", 0x2000_0000, 0x1000, SectionKind::Data)]);

        let out = relocate(&image, &map, 0, 0x10000, DEFAULT_VECTOR_TABLE_SIZE).unwrap();
        assert_eq!(read_word(&out.image, 0x208), 0x2001_0400);
        assert_eq!(out.stats.data_literals, 1);
        assert_eq!(out.stats.code_literals, 0);
    }

    #[test]
    fn code_literal_is_patched_once() {
        let mut image = blank_image(0x400);
        image[0x200..0x202].copy_from_slice(&[0x01, 0x48]);
        write_word(&mut image, 0x208, 0x0000_0301);
        // The moved literal 0x10301 lands inside a declared data range, so
        // only the pool-address ledger keeps pass 3 away from it.
        let map = map_of(&[
            (".text", 0, 0x1000, SectionKind::Code),
            (".data", 0x10000, 0x1000, SectionKind::Data),
        ]);

        let out = relocate(&image, &map, 0, 0x10000, DEFAULT_VECTOR_TABLE_SIZE).unwrap();
        assert_eq!(read_word(&out.image, 0x208), 0x0001_0301);
        assert_eq!(out.stats.code_literals, 1);
        assert_eq!(out.stats.data_literals, 0);
    }

    #[test]
    fn branch_targets_are_noted_without_rewriting() {
        let mut image = blank_image(0x100);
        // b <self> at 0xC0: PC-relative, nothing to rewrite.
        image[0xC0..0xC2].copy_from_slice(&[0xFE, 0xE7]);
        let before = image.clone();
        let map = code_map(0, 0x1000);

        let out = relocate(&image, &map, 0, 0x10000, DEFAULT_VECTOR_TABLE_SIZE).unwrap();
        assert_eq!(out.image, before);
        assert_eq!(out.stats.branch_targets, 1);
    }

    #[test]
    fn jump_table_of_four_or_more_is_patched() {
        let mut image = blank_image(0x440);
        let targets = [
            0x101u32, 0x121, 0x145, 0x167, 0x189, 0x1AB, 0x1CD, 0x1EF,
        ];
        for (i, &t) in targets.iter().enumerate() {
            write_word(&mut image, 0x400 + i * 4, t);
        }
        write_word(&mut image, 0x420, 0xFFFF_FFFF);
        let map = code_map(0, 0x1000);

        let out = relocate(&image, &map, 0, 0x10000, DEFAULT_VECTOR_TABLE_SIZE).unwrap();
        for (i, &t) in targets.iter().enumerate() {
            assert_eq!(read_word(&out.image, 0x400 + i * 4), t + 0x10000);
        }
        assert_eq!(read_word(&out.image, 0x420), 0xFFFF_FFFF);
        assert_eq!(out.stats.jump_table_entries, targets.len());
    }

    #[test]
    fn three_code_pointers_are_not_a_table() {
        let mut image = blank_image(0x440);
        for (i, t) in [0x101u32, 0x121, 0x145].into_iter().enumerate() {
            write_word(&mut image, 0x400 + i * 4, t);
        }
        let map = code_map(0, 0x1000);

        let out = relocate(&image, &map, 0, 0x10000, DEFAULT_VECTOR_TABLE_SIZE).unwrap();
        assert_eq!(read_word(&out.image, 0x400), 0x101);
        assert_eq!(read_word(&out.image, 0x404), 0x121);
        assert_eq!(read_word(&out.image, 0x408), 0x145);
        assert_eq!(out.stats.jump_table_entries, 0);
    }

    #[test]
    fn empty_map_still_relocates_vectors() {
        let mut image = blank_image(DEFAULT_VECTOR_TABLE_SIZE);
        write_word(&mut image, 4, 0x0000_0101);
        let out = relocate(&image, &MapFile::default(), 0, 0x10000, DEFAULT_VECTOR_TABLE_SIZE)
            .unwrap();
        assert_eq!(read_word(&out.image, 4), 0x0001_0101);
        assert_eq!(out.stats.data_literals, 0);
        assert_eq!(out.stats.jump_table_entries, 0);
    }

    #[test]
    fn relocation_is_invertible() {
        let mut image = blank_image(0x440);
        write_word(&mut image, 4, 0x0000_0101);
        write_word(&mut image, 8, 0x0000_0145);
        for (i, t) in [0x201u32, 0x211, 0x221, 0x231, 0x241].into_iter().enumerate() {
            write_word(&mut image, 0x400 + i * 4, t);
        }
        let map = code_map(0, 0x1000);
        let shifted_map = code_map(0x10000, 0x1000);

        let there = relocate(&image, &map, 0, 0x10000, DEFAULT_VECTOR_TABLE_SIZE).unwrap();
        let back = relocate(
            &there.image,
            &shifted_map,
            0x10000,
            0,
            DEFAULT_VECTOR_TABLE_SIZE,
        )
        .unwrap();
        assert_eq!(back.image, image);
    }

    #[test]
    fn output_path_carries_the_new_base() {
        assert_eq!(
            suggested_output_path(Path::new("/tmp/fw_ota.bin"), 0x10000),
            PathBuf::from("/tmp/fw_ota_at_0x10000.bin")
        );
    }

    #[test]
    fn relocate_file_round_trips_through_disk() {
        let dir = tempfile::tempdir().unwrap();
        let bin_path = dir.path().join("fw.bin");
        let map_path = dir.path().join("fw.map");
        let mut image = blank_image(DEFAULT_VECTOR_TABLE_SIZE);
        write_word(&mut image, 4, 0x0000_0101);
        fs::write(&bin_path, &image).unwrap();
        fs::write(
            &map_path,
            "    0x00000000   0x00000000   0x00001000   Code   RO   3   a.o   .text\n",
        )
        .unwrap();

        let (hint, relocation) =
            relocate_file(&bin_path, &map_path, 0, 0x10000, DEFAULT_VECTOR_TABLE_SIZE).unwrap();
        assert_eq!(hint, dir.path().join("fw_at_0x10000.bin"));
        assert_eq!(read_word(&relocation.image, 4), 0x0001_0101);

        let err =
            relocate_file(&dir.path().join("missing.bin"), &map_path, 0, 0, 192).unwrap_err();
        assert!(matches!(err, PatchError::BinUnreadable { .. }));
    }
}
