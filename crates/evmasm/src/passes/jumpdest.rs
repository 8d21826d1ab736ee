//! Removal of tags that are never jumped to.

use crate::AssemblyItem;
use std::collections::BTreeSet;
use tracing::debug;

/// Removes `Tag` items that no `PUSHTAG` refers to.
#[derive(Debug)]
pub struct JumpdestRemover<'a> {
    items: &'a mut Vec<AssemblyItem>,
}

impl<'a> JumpdestRemover<'a> {
    pub fn new(items: &'a mut Vec<AssemblyItem>) -> Self {
        Self { items }
    }

    /// Removes unreferenced tags, keeping the ones in `tags_referenced_from_outside`.
    ///
    /// Returns `true` if any tag was removed.
    pub fn optimise(&mut self, tags_referenced_from_outside: &BTreeSet<usize>) -> bool {
        let mut references = referenced_tags(self.items.as_slice(), None);
        references.extend(tags_referenced_from_outside);
        let before = self.items.len();
        self.items.retain(|item| !item.is_tag() || references.contains(&item.tag_number()));
        let removed = before - self.items.len();
        if removed > 0 {
            debug!(removed, "removed unreferenced tags");
        }
        removed > 0
    }
}

/// Returns the tags of `sub_id` that are pushed in `items`, or the local tags for `None`.
pub fn referenced_tags(items: &[AssemblyItem], sub_id: Option<usize>) -> BTreeSet<usize> {
    items
        .iter()
        .filter(|item| item.is_push_tag())
        .filter_map(|item| match item.split_foreign_push_tag() {
            (sub, tag) if sub == sub_id => Some(tag),
            _ => None,
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::Instruction;

    #[test]
    fn test_unreferenced_tags_removed() {
        let mut items = vec![
            AssemblyItem::push_tag(2),
            AssemblyItem::operation(Instruction::JUMP),
            AssemblyItem::tag(1),
            AssemblyItem::operation(Instruction::STOP),
            AssemblyItem::tag(2),
            AssemblyItem::operation(Instruction::STOP),
            AssemblyItem::tag(3),
        ];
        assert!(JumpdestRemover::new(&mut items).optimise(&BTreeSet::from([3])));
        assert_eq!(
            items,
            vec![
                AssemblyItem::push_tag(2),
                AssemblyItem::operation(Instruction::JUMP),
                AssemblyItem::operation(Instruction::STOP),
                AssemblyItem::tag(2),
                AssemblyItem::operation(Instruction::STOP),
                AssemblyItem::tag(3),
            ]
        );
        assert!(!JumpdestRemover::new(&mut items).optimise(&BTreeSet::from([3])));
    }

    #[test]
    fn test_foreign_pushes_do_not_count() {
        let mut foreign = AssemblyItem::push_tag(0);
        foreign.set_push_tag_sub_id_and_tag(Some(0), 1);
        let mut items = vec![foreign.clone(), AssemblyItem::tag(1)];
        assert!(JumpdestRemover::new(&mut items).optimise(&BTreeSet::new()));
        assert_eq!(items, vec![foreign.clone()]);
        assert_eq!(referenced_tags(&[foreign], Some(0)), BTreeSet::from([1]));
    }
}
