//! Serialisation of an [`Assembly`] to bytecode.
//!
//! Tag pushes are sized per push from the position of their target, and references to
//! sub-assemblies, data and the program size share one width derived from the total size.
//! Since larger pushes move everything after them, the widths are grown until the layout is
//! stable.
//!
//! The bytecode is laid out as the code, a `STOP` if anything follows, the referenced
//! sub-assemblies, the referenced data blobs and finally the auxiliary data.

use super::Assembly;
use crate::{AssemblyError, AssemblyItem, Instruction, ItemKind, item::bytes_required};
use alloy_primitives::U256;
use itertools::Itertools;
use rustc_hash::FxHashMap;
use std::collections::BTreeMap;
use tracing::{debug, instrument};

type Result<T, E = AssemblyError> = std::result::Result<T, E>;

/// Assembled bytecode together with the placeholders that are filled in at deployment.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct LinkerObject {
    pub bytecode: Vec<u8>,
    /// Offsets of the 32-byte placeholders of every immutable, by id.
    pub immutable_references: BTreeMap<U256, Vec<usize>>,
}

/// An assembled sub-assembly and where its tags ended up.
struct Assembled {
    object: LinkerObject,
    tag_positions: FxHashMap<usize, usize>,
}

/// Result of laying out the items with fixed push widths.
struct Layout {
    tag_positions: FxHashMap<usize, usize>,
    code_size: usize,
    total_size: usize,
}

impl Assembly {
    /// Assembles this assembly and its sub-assemblies into bytecode.
    #[instrument(level = "debug", skip_all)]
    pub fn assemble(&self) -> Result<LinkerObject> {
        let assembled = self.assemble_internal()?;
        debug!(size = assembled.object.bytecode.len(), "assembled bytecode");
        Ok(assembled.object)
    }

    fn assemble_internal(&self) -> Result<Assembled> {
        let subs = self.subs.iter().map(Self::assemble_internal).collect::<Result<Vec<_>>>()?;
        let immutables = sub_immutable_references(&subs);

        let mut tag_widths: Vec<u8> = vec![1; self.items.len()];
        let mut data_width = 1;
        let layout = loop {
            let layout = self.layout(&subs, &immutables, &tag_widths, data_width)?;
            let mut changed = false;
            for (index, item) in self.items.iter().enumerate() {
                if !item.is_push_tag() {
                    continue;
                }
                let width = width_of(resolve_tag(item, &layout.tag_positions, &subs)?)?;
                if width > tag_widths[index] {
                    tag_widths[index] = width;
                    changed = true;
                }
            }
            let width = width_of(layout.total_size)?;
            if width > data_width {
                data_width = width;
                changed = true;
            }
            if !changed {
                break layout;
            }
        };

        let mut code = Vec::with_capacity(layout.total_size);
        let mut immutable_references = BTreeMap::<U256, Vec<usize>>::new();
        let mut tag_refs = Vec::new();
        let mut sub_refs = Vec::new();
        let mut data_refs = Vec::new();
        let mut size_refs = Vec::new();
        for (index, item) in self.items.iter().enumerate() {
            match item.kind() {
                ItemKind::Operation(instruction) => code.push(instruction.get()),
                ItemKind::Push => push_value(&mut code, item.data(), push_width(item.data())),
                ItemKind::PushTag => {
                    tag_refs.push((code.len() + 1, tag_widths[index], item));
                    push_placeholder(&mut code, tag_widths[index]);
                }
                ItemKind::PushSub => {
                    sub_refs.push((code.len() + 1, item.data()));
                    push_placeholder(&mut code, data_width);
                }
                ItemKind::PushData => {
                    data_refs.push((code.len() + 1, item.data()));
                    push_placeholder(&mut code, data_width);
                }
                ItemKind::PushProgramSize => {
                    size_refs.push(code.len() + 1);
                    push_placeholder(&mut code, data_width);
                }
                ItemKind::PushSubSize => {
                    let size = U256::from(sub_of(&subs, item.data())?.object.bytecode.len());
                    push_value(&mut code, size, push_width(size));
                }
                ItemKind::PushImmutable => {
                    immutable_references.entry(item.data()).or_default().push(code.len() + 1);
                    push_placeholder(&mut code, 32);
                }
                ItemKind::AssignImmutable => {
                    let offsets = immutables.get(&item.data()).map(Vec::as_slice).unwrap_or_default();
                    assign_immutable(&mut code, offsets);
                }
                ItemKind::Tag => code.push(Instruction::JUMPDEST.get()),
                ItemKind::VerbatimBytecode(verbatim) => code.extend_from_slice(&verbatim.code),
                ItemKind::Undefined => {
                    return Err(AssemblyError::InvalidItem {
                        item: item.to_string(),
                        location: item.location(),
                    });
                }
            }
        }
        debug_assert_eq!(code.len(), layout.code_size);

        if self.has_trailing_data() {
            code.push(Instruction::STOP.get());
        }
        for (sub_id, sub) in subs.iter().enumerate() {
            let refs = sub_refs
                .iter()
                .filter(|(_, id)| *id == U256::from(sub_id))
                .map(|(pos, _)| *pos)
                .collect_vec();
            if refs.is_empty() {
                continue;
            }
            let offset = code.len();
            for pos in refs {
                write_at(&mut code, pos, data_width, offset);
            }
            code.extend_from_slice(&sub.object.bytecode);
        }
        for (hash, data) in &self.data {
            let refs =
                data_refs.iter().filter(|(_, h)| h == hash).map(|(pos, _)| *pos).collect_vec();
            if refs.is_empty() {
                continue;
            }
            let offset = code.len();
            for pos in refs {
                write_at(&mut code, pos, data_width, offset);
            }
            code.extend_from_slice(data);
        }
        code.extend_from_slice(&self.auxiliary_data);
        debug_assert_eq!(code.len(), layout.total_size);

        let program_size = code.len();
        for pos in size_refs {
            write_at(&mut code, pos, data_width, program_size);
        }
        for (pos, width, item) in tag_refs {
            let target = resolve_tag(item, &layout.tag_positions, &subs)?;
            write_at(&mut code, pos, width, target);
        }

        Ok(Assembled {
            object: LinkerObject { bytecode: code, immutable_references },
            tag_positions: layout.tag_positions,
        })
    }

    /// Computes the tag positions and sizes for the given push widths.
    fn layout(
        &self,
        subs: &[Assembled],
        immutables: &BTreeMap<U256, Vec<usize>>,
        tag_widths: &[u8],
        data_width: u8,
    ) -> Result<Layout> {
        let mut tag_positions = FxHashMap::default();
        let mut offset = 0;
        let mut referenced_subs = vec![false; subs.len()];
        let mut referenced_data = BTreeMap::new();
        for (index, item) in self.items.iter().enumerate() {
            let size = match item.kind() {
                ItemKind::Operation(_) => 1,
                ItemKind::Push => 1 + push_width(item.data()) as usize,
                ItemKind::PushTag => 1 + tag_widths[index] as usize,
                ItemKind::PushSub => {
                    let sub = usize::try_from(item.data())
                        .ok()
                        .filter(|&sub| sub < subs.len())
                        .ok_or(AssemblyError::UnknownSubAssembly(item.data().saturating_to()))?;
                    referenced_subs[sub] = true;
                    1 + data_width as usize
                }
                ItemKind::PushData => {
                    let data = self
                        .data
                        .get(&item.data())
                        .ok_or(AssemblyError::UnknownData(item.data()))?;
                    referenced_data.insert(item.data(), data.len());
                    1 + data_width as usize
                }
                ItemKind::PushProgramSize => 1 + data_width as usize,
                ItemKind::PushSubSize => {
                    let size = sub_of(subs, item.data())?.object.bytecode.len();
                    1 + push_width(U256::from(size)) as usize
                }
                ItemKind::PushImmutable => 1 + 32,
                ItemKind::AssignImmutable => {
                    let offsets =
                        immutables.get(&item.data()).map(Vec::as_slice).unwrap_or_default();
                    assign_immutable_size(offsets)
                }
                ItemKind::Tag => {
                    if let (Some(sub), tag) = item.to_push_tag().split_foreign_push_tag() {
                        return Err(AssemblyError::ForeignTag { sub, tag });
                    }
                    tag_positions.insert(item.tag_number(), offset);
                    1
                }
                ItemKind::VerbatimBytecode(verbatim) => verbatim.code.len(),
                ItemKind::Undefined => 0,
            };
            offset += size;
        }

        let code_size = offset;
        let mut total_size = code_size;
        if self.has_trailing_data() {
            total_size += 1;
        }
        total_size += subs
            .iter()
            .zip(&referenced_subs)
            .filter(|(_, referenced)| **referenced)
            .map(|(sub, _)| sub.object.bytecode.len())
            .sum::<usize>();
        total_size += referenced_data.values().sum::<usize>();
        total_size += self.auxiliary_data.len();
        Ok(Layout { tag_positions, code_size, total_size })
    }

    fn has_trailing_data(&self) -> bool {
        !self.subs.is_empty() || !self.data.is_empty() || !self.auxiliary_data.is_empty()
    }
}

/// Collects the immutable references of the sub-assemblies. The first sub-assembly that
/// refers to an immutable determines its offsets.
fn sub_immutable_references(subs: &[Assembled]) -> BTreeMap<U256, Vec<usize>> {
    let mut references = BTreeMap::new();
    for sub in subs {
        for (id, offsets) in &sub.object.immutable_references {
            references.entry(*id).or_insert_with(|| offsets.clone());
        }
    }
    references
}

fn sub_of(subs: &[Assembled], id: U256) -> Result<&Assembled> {
    usize::try_from(id)
        .ok()
        .and_then(|id| subs.get(id))
        .ok_or(AssemblyError::UnknownSubAssembly(id.saturating_to()))
}

/// Returns the position of the tag pushed by `item`.
fn resolve_tag(
    item: &AssemblyItem,
    tag_positions: &FxHashMap<usize, usize>,
    subs: &[Assembled],
) -> Result<usize> {
    match item.split_foreign_push_tag() {
        (None, tag) => tag_positions.get(&tag).copied().ok_or(AssemblyError::UnknownTag(tag)),
        (Some(sub), tag) => subs
            .get(sub)
            .ok_or(AssemblyError::UnknownSubAssembly(sub))?
            .tag_positions
            .get(&tag)
            .copied()
            .ok_or(AssemblyError::UnknownTag(tag)),
    }
}

/// Number of bytes for a push of a code offset.
fn width_of(offset: usize) -> Result<u8> {
    if offset > u32::MAX as usize {
        return Err(AssemblyError::CodeTooLarge);
    }
    Ok(push_width(U256::from(offset)))
}

fn push_width(value: U256) -> u8 {
    bytes_required(value).max(1) as u8
}

fn push_value(code: &mut Vec<u8>, value: U256, width: u8) {
    code.push(Instruction::push(width).get());
    let bytes = value.to_be_bytes::<32>();
    code.extend_from_slice(&bytes[32 - width as usize..]);
}

fn push_placeholder(code: &mut Vec<u8>, width: u8) {
    code.push(Instruction::push(width).get());
    code.resize(code.len() + width as usize, 0);
}

/// Writes `value` big-endian into the `width` bytes at `pos`.
fn write_at(code: &mut [u8], pos: usize, width: u8, value: usize) {
    let bytes = U256::from(value).to_be_bytes::<32>();
    code[pos..pos + width as usize].copy_from_slice(&bytes[32 - width as usize..]);
}

/// Stores the value below the memory offset of the runtime code at every reference:
/// `DUP2 DUP2 PUSH offset ADD MSTORE` for all but the last reference, which consumes both.
fn assign_immutable(code: &mut Vec<u8>, offsets: &[usize]) {
    if offsets.is_empty() {
        code.extend_from_slice(&[Instruction::POP.get(), Instruction::POP.get()]);
        return;
    }
    for (i, &offset) in offsets.iter().enumerate() {
        if i + 1 != offsets.len() {
            code.extend_from_slice(&[Instruction::dup(2).get(), Instruction::dup(2).get()]);
        }
        let offset = U256::from(offset);
        push_value(code, offset, push_width(offset));
        code.extend_from_slice(&[Instruction::ADD.get(), Instruction::MSTORE.get()]);
    }
}

fn assign_immutable_size(offsets: &[usize]) -> usize {
    if offsets.is_empty() {
        return 2;
    }
    let dups = 2 * (offsets.len() - 1);
    let pushes: usize =
        offsets.iter().map(|&offset| 1 + push_width(U256::from(offset)) as usize).sum();
    dups + pushes + 2 * offsets.len()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::JumpType;

    #[test]
    fn test_push_width() {
        assert_eq!(push_width(U256::ZERO), 1);
        assert_eq!(push_width(U256::from(255)), 1);
        assert_eq!(push_width(U256::from(256)), 2);
        assert_eq!(push_width(U256::from(0x10000)), 3);
    }

    #[test]
    fn test_simple_assembly() {
        let mut assembly = Assembly::new();
        assembly.append(AssemblyItem::push(42u64));
        assembly.append(AssemblyItem::push(10u64));
        assembly.append(Instruction::ADD);
        assembly.append(Instruction::STOP);
        let object = assembly.assemble().unwrap();
        assert_eq!(object.bytecode, vec![0x60, 42, 0x60, 10, 0x01, 0x00]);
    }

    #[test]
    fn test_tag_resolution() {
        let mut assembly = Assembly::new();
        let loop_tag = assembly.new_tag();
        let end_tag = assembly.new_tag();
        assembly.append(loop_tag.clone());
        assembly.append(AssemblyItem::push(1u64));
        assembly.append_jumpi(&end_tag);
        assembly.append_jump(&loop_tag, JumpType::Ordinary);
        assembly.append(end_tag);
        assembly.append(Instruction::STOP);
        let object = assembly.assemble().unwrap();
        assert_eq!(
            object.bytecode,
            vec![0x5b, 0x60, 0x01, 0x60, 0x09, 0x57, 0x60, 0x00, 0x56, 0x5b, 0x00]
        );
    }

    #[test]
    fn test_wide_tag_pushes() {
        let mut assembly = Assembly::new();
        let tag = assembly.new_tag();
        assembly.append_jump(&tag, JumpType::Ordinary);
        for _ in 0..300 {
            assembly.append(Instruction::CALLVALUE);
        }
        assembly.append(tag);
        let object = assembly.assemble().unwrap();
        assert_eq!(&object.bytecode[..3], &[0x61, 0x01, 0x30]);
        assert_eq!(object.bytecode[0x130], 0x5b);
    }

    #[test]
    fn test_sub_and_data_references() {
        let mut runtime = Assembly::new();
        runtime.append(Instruction::CALLER);
        runtime.append(Instruction::STOP);

        let mut assembly = Assembly::new();
        let sub = assembly.new_sub(runtime);
        assembly.append(AssemblyItem::push_sub_size(0));
        assembly.append(sub);
        assembly.append_data(vec![0xaa, 0xbb]);
        assembly.append(AssemblyItem::new(ItemKind::PushProgramSize, U256::ZERO));
        assembly.append_auxiliary_data(&[0xcc]);
        let object = assembly.assemble().unwrap();
        assert_eq!(
            object.bytecode,
            vec![
                0x60, 0x02, // sub size
                0x60, 0x09, // sub offset
                0x60, 0x0b, // data offset
                0x60, 0x0e, // program size
                0x00, // stop
                0x33, 0x00, // sub
                0xaa, 0xbb, // data
                0xcc,
            ]
        );
    }

    #[test]
    fn test_immutables() {
        let mut runtime = Assembly::new();
        runtime.push_immutable("x");
        runtime.append(Instruction::POP);
        runtime.push_immutable("x");
        let runtime_object = runtime.assemble().unwrap();
        let id = super::super::immutable_id("x");
        assert_eq!(runtime_object.immutable_references[&id], vec![1, 35]);

        let mut creation = Assembly::new();
        creation.new_sub(runtime);
        creation.append(AssemblyItem::push(7u64));
        creation.append(AssemblyItem::push(0x80u64));
        creation.assign_immutable("x");
        let object = creation.assemble().unwrap();
        assert_eq!(
            &object.bytecode[..15],
            &[
                0x60, 0x07, 0x60, 0x80, // value, offset
                0x81, 0x81, 0x60, 0x01, 0x01, 0x52, // first reference
                0x60, 0x23, 0x01, 0x52, // last reference
                0x00,
            ]
        );
        assert!(object.immutable_references.is_empty());
    }

    #[test]
    fn test_errors() {
        let mut assembly = Assembly::new();
        assembly.append(AssemblyItem::push_tag(5));
        assert_eq!(assembly.assemble(), Err(AssemblyError::UnknownTag(5)));

        let mut assembly = Assembly::new();
        assembly.append(AssemblyItem::push_sub(1));
        assert_eq!(assembly.assemble(), Err(AssemblyError::UnknownSubAssembly(1)));

        let mut assembly = Assembly::new();
        assembly.append(AssemblyItem::new(ItemKind::Undefined, U256::ZERO));
        assert!(matches!(assembly.assemble(), Err(AssemblyError::InvalidItem { .. })));
    }
}
