//! `SymbolTable`: the global name -> atom map and the resolution-ordering
//! rules that decide what wins when two files define the same name
//!.

use std::collections::HashMap;

use bstr::BString;
use tracing::trace;

use crate::{
    atom::{Atom, AtomId, Binding, Visibility},
    error::{LinkError, ParseError},
};

/// What kind of definition currently occupies a name, used only to drive
/// the ordering table below; the atom itself (with its own `Binding`/
/// TLS-ness) is the source of truth once a name resolves.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
enum SlotRank {
    Undefined = 0,
    Lazy = 1,
    SharedLibrary = 2,
    Weak = 3,
    Common = 4,
    Strong = 5,
}

#[derive(Debug, Clone)]
pub struct Slot {
    pub atom: AtomId,
    rank: SlotRank,
    pub visibility: Visibility,
    is_tls: bool,
}

/// Maps every externally-visible name in the link to the one atom that
/// won resolution, applying a precedence table (Strong > Weak > Tentative
/// > Undefined) as each new definition is offered. Lookup is by name only;
/// the physical identity
/// of *which* atom currently holds a name can change over the life of
/// the Resolver as stronger definitions arrive.
#[derive(Debug, Default)]
pub struct SymbolTable {
    slots: HashMap<BString, Slot>,
}

/// The action the Resolver should take in response to a new candidate
/// being offered for a name already occupying a slot.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Disposition {
    /// The new atom replaces the slot's current occupant.
    Replace,
    /// The new atom is discarded; the existing occupant is kept.
    Discard,
    /// If the occupant is a `Lazy` atom, pulling in its archive member
    /// is requested by the caller (the Resolver drives extraction; this
    /// enum only reports that a pull should happen).
    PullArchiveMember,
}

impl SymbolTable {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get(&self, name: &[u8]) -> Option<&Slot> {
        self.slots.get(name)
    }

    /// Whether `name` already resolves to a non-weak `Defined`/`Absolute`
    /// atom — the only case where offering a fresh `LazyAtom` for the same
    /// name would be pointless (a `Strong` definition can never be
    /// displaced by anything weaker). Used by `Resolver::register_archive`
    /// to decide whether a symbol-index entry still needs a `Lazy` atom.
    pub fn is_strong_defined(&self, name: &[u8]) -> bool {
        matches!(self.slots.get(name), Some(slot) if slot.rank == SlotRank::Strong)
    }

    pub fn iter(&self) -> impl Iterator<Item = (&BString, &Slot)> {
        self.slots.iter()
    }

    /// Offers `atom` (named `name`) for resolution. Returns the
    /// disposition the Resolver should act on. Errors on genuine
    /// conflicts (duplicate strong definitions, TLS/non-TLS mismatch).
    pub fn offer(
        &mut self,
        name: &BString,
        atom: AtomId,
        atoms_of: &dyn Fn(AtomId) -> Option<&Atom>,
        file_path_of: &dyn Fn(AtomId) -> std::path::PathBuf,
    ) -> Result<Disposition, LinkError> {
        let Some(new_atom) = atoms_of(atom) else {
            return Ok(Disposition::Discard);
        };
        let (new_rank, new_tls, new_vis) = classify(new_atom);

        let Some(existing) = self.slots.get(name).cloned() else {
            self.slots.insert(
                name.clone(),
                Slot {
                    atom,
                    rank: new_rank,
                    visibility: new_vis,
                    is_tls: new_tls,
                },
            );
            return Ok(Disposition::Replace);
        };

        if existing.is_tls != new_tls && new_rank >= SlotRank::Weak {
            return Err(LinkError::TlsTypeMismatch {
                name: name.clone(),
                first: file_path_of(existing.atom),
                second: file_path_of(atom),
            });
        }

        let disposition = match (existing.rank, new_rank) {
            // A stronger definition always wins and a weaker one is
            // always discarded.
            (a, b) if a < b => Disposition::Replace,
            (a, b) if a > b => Disposition::Discard,
            // Same rank: two strong definitions is a hard conflict; two
            // weak/common/shared-library definitions of the same rank
            // are resolved by keeping the first one seen (ties broken by
            // file arrival order: "first wins" for same-rank candidates
            // other than `Strong`).
            (SlotRank::Strong, SlotRank::Strong) => {
                return Err(LinkError::DuplicateSymbol {
                    name: name.clone(),
                    first: file_path_of(existing.atom),
                    second: file_path_of(atom),
                });
            }
            (SlotRank::Common, SlotRank::Common) => {
                // Commons merge by keeping the larger size/alignment;
                // `DeadStrip`/`LayoutEngine` read `MergePolicy::Largest`
                // off the atom itself, so the table just keeps whichever
                // the caller marks larger by offering it second.
                Disposition::Replace
            }
            (SlotRank::Lazy, SlotRank::Lazy) => Disposition::Discard,
            _ => Disposition::Discard,
        };

        if existing.rank == SlotRank::Lazy && new_rank == SlotRank::Undefined {
            trace!(?name, "undefined reference pulls lazy archive member");
            return Ok(Disposition::PullArchiveMember);
        }

        // The symmetric coincidence: a name already left `Undefined` by an
        // earlier object gets a `Lazy` archive-member proxy offered for it.
        // `disposition` is already `Replace` (rank `Undefined` < `Lazy`),
        // so the slot below ends up holding the `Lazy` atom; what's still
        // missing is telling the caller to actually pull the member.
        if existing.rank == SlotRank::Undefined && new_rank == SlotRank::Lazy {
            trace!(?name, "undefined-then-lazy coincidence pulls archive member");
            self.slots.insert(
                name.clone(),
                Slot {
                    atom,
                    rank: new_rank,
                    visibility: existing.visibility.merge(new_vis),
                    is_tls: new_tls,
                },
            );
            return Ok(Disposition::PullArchiveMember);
        }

        if disposition == Disposition::Replace {
            self.slots.insert(
                name.clone(),
                Slot {
                    atom,
                    rank: new_rank,
                    visibility: existing.visibility.merge(new_vis),
                    is_tls: new_tls,
                },
            );
        } else if let Some(slot) = self.slots.get_mut(name) {
            slot.visibility = slot.visibility.merge(new_vis);
        }

        Ok(disposition)
    }

    /// Every name still resolved to an `Undefined` or `Lazy` atom once
    /// the fixed point is reached.
    pub fn unresolved(&self) -> impl Iterator<Item = &BString> {
        self.slots.iter().filter_map(|(name, slot)| {
            (slot.rank == SlotRank::Undefined || slot.rank == SlotRank::Lazy).then_some(name)
        })
    }

    /// Rebinds `name` to whatever `target` currently resolves to, used by
    /// the COFF name-mangling fallback chain (§4.3): `name` stays
    /// undefined on its own, but every reference to it is satisfied by
    /// `target`'s definition once one exists. No-op (returns `false`) if
    /// `target` itself hasn't resolved to anything yet.
    pub fn alias(&mut self, name: &BString, target: &BString) -> bool {
        let Some(slot) = self.slots.get(target).cloned() else {
            return false;
        };
        if slot.rank == SlotRank::Undefined || slot.rank == SlotRank::Lazy {
            return false;
        }
        self.slots.insert(name.clone(), slot);
        true
    }
}

fn classify(atom: &Atom) -> (SlotRank, bool, Visibility) {
    match atom {
        Atom::Undefined(u) if u.weak => (SlotRank::Weak, false, Visibility::Default),
        Atom::Undefined(_) => (SlotRank::Undefined, false, Visibility::Default),
        Atom::Lazy(_) => (SlotRank::Lazy, false, Visibility::Default),
        Atom::SharedLibrary(_) => (SlotRank::SharedLibrary, false, Visibility::Default),
        Atom::Absolute(_) => (SlotRank::Strong, false, Visibility::Default),
        Atom::Defined(d) if d.content_type.is_tls() => match d.binding {
            Binding::Weak => (SlotRank::Weak, true, d.visibility),
            _ if d.merge == crate::atom::MergePolicy::Largest => {
                (SlotRank::Common, true, d.visibility)
            }
            _ => (SlotRank::Strong, true, d.visibility),
        },
        Atom::Defined(d) => match d.binding {
            Binding::Weak => (SlotRank::Weak, false, d.visibility),
            _ if d.merge == crate::atom::MergePolicy::Largest => {
                (SlotRank::Common, false, d.visibility)
            }
            _ => (SlotRank::Strong, false, d.visibility),
        },
    }
}

/// MSVC-style fallback chain for an unresolved COFF name: `?Name@@Y...`
/// C++ decorated names have no fallback, but plain C names get the
/// `__imp_`-prefixed import thunk and `/alternatename`-style redirects
/// tried in order before giving up.
pub fn coff_fallback_names(name: &[u8]) -> Vec<BString> {
    let mut out = Vec::new();
    if !name.starts_with(b"__imp_") {
        let mut imp = BString::from(b"__imp_".to_vec());
        imp.extend_from_slice(name);
        out.push(imp);
    }
    out
}

pub fn check_no_cycle(
    start: BString,
    mut next: impl FnMut(&BString) -> Option<BString>,
) -> Result<(), ParseError> {
    let mut seen = std::collections::HashSet::new();
    let mut cur = start.clone();
    seen.insert(cur.clone());
    while let Some(n) = next(&cur) {
        if !seen.insert(n.clone()) {
            return Err(ParseError::WeakExternalCycle(start));
        }
        cur = n;
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::atom::{
        AtomIdx, Binding, ContentType, DeadStripPolicy, DefinedAtom, FileId, MergePolicy, Permissions, SectionChoice,
    };

    fn id(idx: u32) -> AtomId {
        AtomId { file: FileId(0), idx: AtomIdx(idx) }
    }

    fn strong_defined(binding: Binding) -> Atom {
        Atom::Defined(DefinedAtom {
            content_type: ContentType::Code,
            permissions: Permissions::RX,
            align_pow2: 0,
            align_modulus: 1,
            binding,
            visibility: Visibility::Default,
            merge: MergePolicy::NoMerge,
            section_choice: SectionChoice::ContentDerived,
            section_name: BString::from(".text"),
            dead_strip: DeadStripPolicy::Normal,
            ordinal: 0,
            content: Vec::new(),
            size: 0,
            references: Vec::new(),
            name: None,
        })
    }

    fn offer_atom(table: &mut SymbolTable, name: &str, slot: u32, atom: &Atom) -> Result<Disposition, LinkError> {
        table.offer(&BString::from(name), id(slot), &|_| Some(atom), &|_| Default::default())
    }

    #[test]
    fn two_strong_definitions_conflict() {
        let mut table = SymbolTable::new();
        let a = strong_defined(Binding::Global);
        let b = strong_defined(Binding::Global);
        offer_atom(&mut table, "foo", 0, &a).unwrap();
        assert!(matches!(offer_atom(&mut table, "foo", 1, &b), Err(LinkError::DuplicateSymbol { .. })));
    }

    #[test]
    fn weak_does_not_replace_strong_regardless_of_order() {
        let mut table = SymbolTable::new();
        let strong = strong_defined(Binding::Global);
        let weak = strong_defined(Binding::Weak);
        offer_atom(&mut table, "foo", 0, &strong).unwrap();
        offer_atom(&mut table, "foo", 1, &weak).unwrap();
        assert_eq!(table.get(b"foo").unwrap().atom, id(0));

        let mut table = SymbolTable::new();
        offer_atom(&mut table, "foo", 1, &weak).unwrap();
        offer_atom(&mut table, "foo", 0, &strong).unwrap();
        assert_eq!(table.get(b"foo").unwrap().atom, id(0));
    }

    #[test]
    fn alias_rebinds_to_an_already_resolved_target() {
        let mut table = SymbolTable::new();
        let strong = strong_defined(Binding::Global);
        offer_atom(&mut table, "__imp_foo", 0, &strong).unwrap();
        assert!(table.alias(&BString::from("foo"), &BString::from("__imp_foo")));
        assert_eq!(table.get(b"foo").unwrap().atom, id(0));
    }

    #[test]
    fn alias_fails_when_target_is_still_undefined() {
        let mut table = SymbolTable::new();
        assert!(!table.alias(&BString::from("foo"), &BString::from("__imp_foo")));
    }
}
