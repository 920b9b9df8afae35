//! Value assignments: the records that own a value's registers and stack
//! slot for the duration of its lifetime.
//!
//! An assignment is a small header plus `part_count` packed 16-bit part
//! descriptors. Part descriptors live in a shared pool; slices are handed
//! out in power-of-two capacity classes with per-class free lists, so the
//! common case (one or two parts) recycles without touching the allocator
//! and odd sizes at worst waste the rounding. The pool is bump-only; it is
//! reclaimed wholesale when the store is reset between functions.
//!
//! Part descriptor layout:
//!
//! ```text
//! |15|14 13 12|11|10| 9| 8| 7  6  5| 4  3  2  1  0|
//! |  |   PS   |RV|  |IM|FA|  bank  |    reg idx   |
//! ```
//!
//! `PS` is `log2(part size)`, `RV` register-valid, `IM` "modified": the
//! register holds data the stack slot does not. `RV`/`IM` together form the
//! part's state lattice: uninitialized (`!RV+IM`), stack-only (`!RV+!IM`),
//! register clean (`RV+!IM`), register dirty (`RV+IM`).

use crate::regfile::{Reg, RegBank};
use crate::{BlockIdx, ValLocalIdx};
use cranelift_entity::packed_option::PackedOption;
use cranelift_entity::{entity_impl, PrimaryMap, SecondaryMap};
use smallvec::SmallVec;

/// Reference to a pooled [`ValueAssignment`].
#[derive(Clone, Copy, PartialEq, Eq, Hash)]
pub struct AssignRef(u32);
entity_impl!(AssignRef, "asg");

/// Packed 16-bit descriptor of one value part.
#[derive(Clone, Copy, PartialEq, Eq, Default)]
pub struct PartDesc(u16);

impl PartDesc {
    /// A reset part: no register, marked modified so the empty stack slot is
    /// not mistaken for valid data.
    pub fn reset() -> Self {
        PartDesc(0).with_modified(true)
    }

    pub fn bits(self) -> u16 {
        self.0
    }

    pub fn reg(self) -> Reg {
        Reg::new((self.0 & 0xff) as u8)
    }

    pub fn with_reg(self, reg: Reg) -> Self {
        debug_assert_eq!(reg.bank(), self.bank());
        PartDesc((self.0 & 0xff00) | reg.id() as u16)
    }

    pub fn bank(self) -> RegBank {
        RegBank(((self.0 >> 5) & 0b111) as u8)
    }

    pub fn with_bank(self, bank: RegBank) -> Self {
        debug_assert!(bank.id() <= 0b111);
        PartDesc((self.0 & !0b1110_0000) | ((bank.id() as u16) << 5))
    }

    pub fn fixed_assignment(self) -> bool {
        self.0 & (1 << 8) != 0
    }

    pub fn with_fixed_assignment(self, val: bool) -> Self {
        PartDesc(if val { self.0 | (1 << 8) } else { self.0 & !(1 << 8) })
    }

    pub fn modified(self) -> bool {
        self.0 & (1 << 9) != 0
    }

    pub fn with_modified(self, val: bool) -> Self {
        PartDesc(if val { self.0 | (1 << 9) } else { self.0 & !(1 << 9) })
    }

    pub fn register_valid(self) -> bool {
        self.0 & (1 << 11) != 0
    }

    pub fn with_register_valid(self, val: bool) -> Self {
        PartDesc(if val { self.0 | (1 << 11) } else { self.0 & !(1 << 11) })
    }

    pub fn stack_valid(self) -> bool {
        !self.modified()
    }

    pub fn part_size(self) -> u32 {
        1 << ((self.0 >> 12) & 0b111)
    }

    pub fn with_part_size(self, size: u32) -> Self {
        debug_assert!(size.is_power_of_two());
        let shift = size.trailing_zeros() as u16;
        debug_assert!(shift <= 0b111);
        PartDesc((self.0 & !(0b111 << 12)) | (shift << 12))
    }
}

/// Header of a live value assignment.
#[derive(Clone)]
pub struct ValueAssignment {
    /// Signed offset of the slot base from the frame pointer; negative for
    /// frame-owned slots. For stack-variable references (byval args) this is
    /// the positive offset into the caller's frame; for other variable
    /// references it carries custom lowering data instead.
    pub frame_off: i32,
    pub part_count: u32,
    /// Outstanding uses. The value dies when this reaches zero.
    pub references_left: u32,
    /// Link in the delayed-free list of the value's last block.
    pub next_delayed_free: PackedOption<ValLocalIdx>,
    /// Largest part size in bytes; parts are laid out at stride
    /// `max_part_size` within the slot.
    pub max_part_size: u8,
    /// The assignment names the *address* of a fixed location (alloca,
    /// global, byval arg) rather than an SSA value; it owns no stack slot.
    pub variable_ref: bool,
    /// Variable reference that lives in a frame (alloca/byval) as opposed to
    /// a custom lowering-defined location.
    pub stack_variable: bool,
    /// Copy of `liveness.last_full`: defer the free to the end of the last
    /// live block instead of freeing at the final reference drop.
    pub delay_free: bool,
    /// Set while the assignment sits on a delayed-free list (debug aid).
    pub pending_free: bool,
    parts_off: u32,
    parts_cap: u32,
}

impl ValueAssignment {
    /// Byte size of the owned stack slot.
    pub fn size(&self) -> u32 {
        debug_assert!(!self.variable_ref);
        self.part_count * self.max_part_size as u32
    }

    /// Custom lowering data of a non-stack variable reference.
    pub fn var_ref_data(&self) -> u32 {
        debug_assert!(self.variable_ref && !self.stack_variable);
        self.frame_off as u32
    }

    /// Frame-pointer offset of part `idx`.
    pub fn part_off(&self, idx: u32) -> i32 {
        debug_assert!(idx < self.part_count);
        self.frame_off + (idx * self.max_part_size as u32) as i32
    }
}

/// Smallest part-slice capacity class.
const BASE_PARTS: u32 = 2;
/// Number of recycled capacity classes (2, 4, 8, 16, 32). Larger slices are
/// bump-allocated and only reclaimed at reset.
const NUM_PART_CLASSES: usize = 5;

/// Pooled storage for value assignments, plus the per-function maps that
/// hang off them.
pub struct AssignmentStore {
    recs: PrimaryMap<AssignRef, ValueAssignment>,
    /// `ValLocalIdx` -> live assignment.
    slots: SecondaryMap<ValLocalIdx, PackedOption<AssignRef>>,
    /// Shared pool of part descriptors.
    parts: Vec<u16>,
    /// Free record indices per part-capacity class.
    rec_free: [SmallVec<[AssignRef; 8]>; NUM_PART_CLASSES],
    /// Heads of the per-block delayed-free lists.
    pub delayed_free: SecondaryMap<BlockIdx, PackedOption<ValLocalIdx>>,
    /// Live fixed assignments per bank.
    pub cur_fixed: [u32; 2],
}

impl AssignmentStore {
    pub fn new() -> Self {
        AssignmentStore {
            recs: PrimaryMap::new(),
            slots: SecondaryMap::new(),
            parts: Vec::new(),
            rec_free: Default::default(),
            delayed_free: SecondaryMap::new(),
            cur_fixed: [0; 2],
        }
    }

    pub fn reset(&mut self) {
        self.recs.clear();
        self.slots.clear();
        self.parts.clear();
        for list in &mut self.rec_free {
            list.clear();
        }
        self.delayed_free.clear();
        self.cur_fixed = [0; 2];
    }

    fn class_of(part_count: u32) -> Option<usize> {
        let cap = part_count.max(BASE_PARTS).next_power_of_two();
        let class = cap.trailing_zeros() as usize - BASE_PARTS.trailing_zeros() as usize;
        (class < NUM_PART_CLASSES).then_some(class)
    }

    /// Allocate a record with room for `part_count` parts. All parts start
    /// in the reset state.
    pub fn alloc(&mut self, part_count: u32) -> AssignRef {
        debug_assert!(part_count > 0);
        let class = Self::class_of(part_count);
        let aref = match class.and_then(|c| self.rec_free[c].pop()) {
            Some(aref) => aref,
            None => {
                let cap = part_count.max(BASE_PARTS).next_power_of_two();
                let off = self.parts.len() as u32;
                self.parts.resize(self.parts.len() + cap as usize, 0);
                self.recs.push(ValueAssignment {
                    frame_off: 0,
                    part_count: 0,
                    references_left: 0,
                    next_delayed_free: None.into(),
                    max_part_size: 0,
                    variable_ref: false,
                    stack_variable: false,
                    delay_free: false,
                    pending_free: false,
                    parts_off: off,
                    parts_cap: cap,
                })
            }
        };

        let rec = &mut self.recs[aref];
        debug_assert!(rec.parts_cap >= part_count);
        rec.frame_off = 0;
        rec.part_count = part_count;
        rec.references_left = 0;
        rec.next_delayed_free = None.into();
        rec.max_part_size = 0;
        rec.variable_ref = false;
        rec.stack_variable = false;
        rec.delay_free = false;
        rec.pending_free = false;
        let off = rec.parts_off as usize;
        for p in &mut self.parts[off..off + part_count as usize] {
            *p = PartDesc::reset().bits();
        }
        aref
    }

    /// Return a record to its capacity class.
    pub fn dealloc(&mut self, aref: AssignRef) {
        let cap = self.recs[aref].parts_cap;
        if let Some(class) = Self::class_of(cap) {
            self.rec_free[class].push(aref);
        }
        // Oversized slices are abandoned until reset.
    }

    pub fn get(&self, aref: AssignRef) -> &ValueAssignment {
        &self.recs[aref]
    }

    pub fn get_mut(&mut self, aref: AssignRef) -> &mut ValueAssignment {
        &mut self.recs[aref]
    }

    /// The live assignment of `local_idx`, if initialized.
    pub fn of(&self, local_idx: ValLocalIdx) -> Option<AssignRef> {
        self.slots[local_idx].expand()
    }

    pub fn bind(&mut self, local_idx: ValLocalIdx, aref: AssignRef) {
        debug_assert!(self.slots[local_idx].is_none());
        self.slots[local_idx] = aref.into();
    }

    pub fn unbind(&mut self, local_idx: ValLocalIdx) {
        debug_assert!(self.slots[local_idx].is_some());
        self.slots[local_idx] = None.into();
    }

    pub fn part(&self, aref: AssignRef, idx: u32) -> PartDesc {
        let rec = &self.recs[aref];
        debug_assert!(idx < rec.part_count);
        PartDesc(self.parts[rec.parts_off as usize + idx as usize])
    }

    pub fn set_part(&mut self, aref: AssignRef, idx: u32, desc: PartDesc) {
        let rec = &self.recs[aref];
        debug_assert!(idx < rec.part_count);
        self.parts[rec.parts_off as usize + idx as usize] = desc.bits();
    }

    /// All currently-bound `(value, assignment)` pairs.
    pub fn live_assignments(&self) -> impl Iterator<Item = (ValLocalIdx, AssignRef)> + '_ {
        self.slots
            .iter()
            .filter_map(|(local, aref)| aref.expand().map(|a| (local, a)))
    }

    /// Sum of `references_left` over all live assignments; zero at the end
    /// of a correctly compiled function.
    pub fn outstanding_references(&self) -> u64 {
        self.slots
            .values()
            .filter_map(|s| s.expand())
            .map(|aref| self.recs[aref].references_left as u64)
            .sum()
    }
}

impl Default for AssignmentStore {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use cranelift_entity::EntityRef;

    #[test]
    fn part_desc_roundtrip() {
        let d = PartDesc::reset()
            .with_bank(RegBank(1))
            .with_part_size(8)
            .with_reg(Reg::from_bank(RegBank(1), 3))
            .with_register_valid(true);
        assert_eq!(d.bank(), RegBank(1));
        assert_eq!(d.part_size(), 8);
        assert_eq!(d.reg(), Reg::from_bank(RegBank(1), 3));
        assert!(d.register_valid());
        assert!(d.modified());
        assert!(!d.stack_valid());
        assert!(!d.fixed_assignment());

        let d = d.with_modified(false);
        assert!(d.stack_valid());
        let d = d.with_register_valid(false);
        assert!(!d.register_valid());
    }

    #[test]
    fn reset_state_is_uninitialized() {
        let d = PartDesc::reset();
        assert!(!d.register_valid());
        assert!(d.modified());
    }

    #[test]
    fn records_recycle_within_class() {
        let mut store = AssignmentStore::new();
        let a = store.alloc(1);
        let before = store.parts.len();
        store.dealloc(a);
        let b = store.alloc(2);
        assert_eq!(a, b);
        assert_eq!(store.parts.len(), before);

        // A three-part request needs the next class up.
        let c = store.alloc(3);
        assert_ne!(b, c);
        store.dealloc(c);
        assert_eq!(store.alloc(4), c);
    }

    #[test]
    fn oversized_records_are_bump_allocated() {
        let mut store = AssignmentStore::new();
        let a = store.alloc(40);
        store.dealloc(a);
        let b = store.alloc(40);
        assert_ne!(a, b);
    }

    #[test]
    fn parts_reset_on_alloc() {
        let mut store = AssignmentStore::new();
        let a = store.alloc(2);
        store.set_part(a, 1, PartDesc::reset().with_register_valid(true));
        store.dealloc(a);
        let b = store.alloc(2);
        assert_eq!(a, b);
        assert!(!store.part(b, 1).register_valid());
    }

    #[test]
    fn binding_tracks_locals() {
        let mut store = AssignmentStore::new();
        let v = ValLocalIdx::new(3);
        assert!(store.of(v).is_none());
        let a = store.alloc(1);
        store.bind(v, a);
        assert_eq!(store.of(v), Some(a));
        store.unbind(v);
        assert!(store.of(v).is_none());
    }
}
