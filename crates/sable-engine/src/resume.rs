//! Resume data: rebuilding guest frames at guard failures
//!
//! Each guard captures a `ResumeSnapshot`: a list of frame layers,
//! parent-first, each holding the jitcode, the pc to resume at, and the
//! live registers ordered ints, refs, floats. A box live in several
//! frames is encoded once: the first occurrence assigns it a slot in the
//! guard's failargs vector, later occurrences reference the slot, and
//! rebuilding restores the sharing. Constants are encoded inline.
//!
//! On failure the back-end hands over the concrete failargs values; the
//! rebuild walks the layers parent-first, allocating one `MIFrame` per
//! layer from the pool.

use std::cell::{Cell, RefCell};
use std::rc::Rc;

use rustc_hash::FxHashMap;

use crate::heap::{GcRef, RawValue};
use crate::ir::boxes::{ConstVal, Operand, TraceBox};
use crate::ir::descr::FieldDescr;
use crate::ir::ops::OpNum;
use crate::jitcode::JitCode;
use crate::meta::frame::{FramePool, MIFrame};

/// One encoded live value: a failargs slot or an inline constant.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ResumeEntry {
    Slot(u32),
    Const(ConstVal),
}

/// One guest frame at the guard point.
#[derive(Debug)]
pub struct FrameLayer {
    pub jitcode: Rc<JitCode>,
    pub pc: usize,
    pub entries_i: Vec<ResumeEntry>,
    pub entries_r: Vec<ResumeEntry>,
    pub entries_f: Vec<ResumeEntry>,
}

impl PartialEq for FrameLayer {
    fn eq(&self, other: &Self) -> bool {
        Rc::ptr_eq(&self.jitcode, &other.jitcode)
            && self.pc == other.pc
            && self.entries_i == other.entries_i
            && self.entries_r == other.entries_r
            && self.entries_f == other.entries_f
    }
}

/// Full snapshot at one guard: frames parent-first plus the virtualizable
/// shadows and virtual-ref handles live at that point.
#[derive(Debug, PartialEq)]
pub struct ResumeSnapshot {
    pub frames: Vec<FrameLayer>,
    pub virtualizable: Vec<ResumeEntry>,
    pub virtualrefs: Vec<ResumeEntry>,
}

/// A virtualizable field whose current heap value supersedes the captured
/// one when the guard was forced from outside.
#[derive(Debug)]
pub struct ForcedField {
    pub slot: u32,
    pub obj: GcRef,
    pub field: Rc<FieldDescr>,
}

/// Per-guard resume information: the snapshot, the failargs ordering, and
/// the failure counter driving bridge compilation.
#[derive(Debug)]
pub struct ResumeGuardDescr {
    pub guard_opnum: OpNum,
    snapshot: RefCell<Option<ResumeSnapshot>>,
    failargs: RefCell<Vec<Operand>>,
    counter: Cell<u32>,
}

impl ResumeGuardDescr {
    pub fn new(guard_opnum: OpNum) -> ResumeGuardDescr {
        ResumeGuardDescr {
            guard_opnum,
            snapshot: RefCell::new(None),
            failargs: RefCell::new(vec![]),
            counter: Cell::new(0),
        }
    }

    /// The values the back-end must supply at failure, one per slot.
    /// Starts as all boxes; the optimizer may substitute constants in.
    pub fn failargs(&self) -> Vec<Operand> {
        self.failargs.borrow().clone()
    }

    /// Rewrite failargs entries whose box appears in the substitution map
    pub fn substitute_failargs(&self, map: &FxHashMap<TraceBox, Operand>) {
        for slot in self.failargs.borrow_mut().iter_mut() {
            if let Operand::Box(b) = slot {
                if let Some(replacement) = map.get(b) {
                    *slot = replacement.clone();
                }
            }
        }
    }

    /// Rewrite one failargs box (comparison-guard fusion)
    pub fn replace_failarg(&self, old: &TraceBox, new: Operand) {
        for slot in self.failargs.borrow_mut().iter_mut() {
            if matches!(slot, Operand::Box(b) if b == old) {
                *slot = new.clone();
            }
        }
    }

    pub fn snapshot_taken(&self) -> bool {
        self.snapshot.borrow().is_some()
    }

    /// Record one more failure; returns the new count.
    pub fn count_failure(&self) -> u32 {
        let n = self.counter.get() + 1;
        self.counter.set(n);
        n
    }

    pub fn reset_counter(&self) {
        self.counter.set(0);
    }

    pub fn with_snapshot<T>(&self, f: impl FnOnce(&ResumeSnapshot) -> T) -> T {
        f(self
            .snapshot
            .borrow()
            .as_ref()
            .expect("guard used before resume data was captured"))
    }
}

/// Variant for guards that may be forced from outside the trace (the
/// `guard_not_forced` after a may-force call): rebuilding consults the
/// current heap state of the registered virtualizable fields instead of
/// the values captured when the trace was recorded.
#[derive(Debug)]
pub struct ResumeGuardForcedDescr {
    pub base: ResumeGuardDescr,
    refresh: RefCell<Vec<ForcedField>>,
}

impl ResumeGuardForcedDescr {
    pub fn new() -> ResumeGuardForcedDescr {
        ResumeGuardForcedDescr {
            base: ResumeGuardDescr::new(OpNum::GuardNotForced),
            refresh: RefCell::new(vec![]),
        }
    }

    /// Register the virtualizable shadows so the force path can supply
    /// their externally-updated values. Must run after capture, when the
    /// failargs slots are known.
    pub fn register_refresh(&self, obj: GcRef, shadows: &[(TraceBox, Rc<FieldDescr>)]) {
        let failargs = self.base.failargs.borrow();
        let mut refresh = self.refresh.borrow_mut();
        for (shadow, field) in shadows {
            let position = failargs
                .iter()
                .position(|slot| matches!(slot, Operand::Box(b) if b == shadow));
            if let Some(slot) = position {
                refresh.push(ForcedField {
                    slot: slot as u32,
                    obj: obj.clone(),
                    field: field.clone(),
                });
            }
        }
    }

    /// Externally-computed replacement values, re-read from the heap.
    pub fn force_overrides(&self) -> Vec<(u32, RawValue)> {
        self.refresh
            .borrow()
            .iter()
            .map(|f| (f.slot, f.obj.get_field(f.field.offset)))
            .collect()
    }
}

impl Default for ResumeGuardForcedDescr {
    fn default() -> Self {
        Self::new()
    }
}

// ===== Capture =====

struct Numbering {
    slots: FxHashMap<TraceBox, u32>,
    failargs: Vec<TraceBox>,
}

impl Numbering {
    fn new() -> Numbering {
        Numbering {
            slots: FxHashMap::default(),
            failargs: vec![],
        }
    }

    fn entry(&mut self, operand: &Operand) -> ResumeEntry {
        match operand {
            Operand::Const(c) => ResumeEntry::Const(c.clone()),
            Operand::Box(b) => {
                if let Some(&slot) = self.slots.get(b) {
                    return ResumeEntry::Slot(slot);
                }
                let slot = self.failargs.len() as u32;
                self.slots.insert(b.clone(), slot);
                self.failargs.push(b.clone());
                ResumeEntry::Slot(slot)
            }
        }
    }

    fn entries(&mut self, operands: &[Operand]) -> Vec<ResumeEntry> {
        operands.iter().map(|op| self.entry(op)).collect()
    }
}

/// Snapshot the live frame list into the guard's descr. Frames are
/// walked parent-first so shared boxes get their slot at the outermost
/// occurrence.
pub fn capture_resumedata(
    framestack: &[MIFrame],
    virtualizable_boxes: Option<&[Operand]>,
    virtualref_boxes: &[Operand],
    descr: &ResumeGuardDescr,
) {
    let mut numbering = Numbering::new();
    let frames = framestack
        .iter()
        .map(|frame| FrameLayer {
            jitcode: frame.jitcode.clone(),
            pc: frame.pc,
            entries_i: numbering.entries(&frame.registers_i),
            entries_r: numbering.entries(&frame.registers_r),
            entries_f: numbering.entries(&frame.registers_f),
        })
        .collect();

    let snapshot = ResumeSnapshot {
        frames,
        virtualizable: virtualizable_boxes
            .map(|boxes| numbering.entries(boxes))
            .unwrap_or_default(),
        virtualrefs: numbering.entries(virtualref_boxes),
    };
    *descr.snapshot.borrow_mut() = Some(snapshot);
    *descr.failargs.borrow_mut() = numbering.failargs.into_iter().map(Operand::Box).collect();
}

// ===== Rebuild =====

/// Everything `rebuild_from_resumedata` restores. `slot_boxes` maps each
/// failargs slot that the snapshot references to the fresh box created
/// for it; a bridge traced from this guard uses them as its input
/// arguments.
pub struct RebuiltState {
    pub frames: Vec<MIFrame>,
    pub virtualizable_boxes: Vec<Operand>,
    pub virtualref_boxes: Vec<Operand>,
    pub slot_boxes: Vec<(u32, TraceBox)>,
}

struct Rebuilder<'a> {
    values: &'a [RawValue],
    boxes: FxHashMap<u32, TraceBox>,
}

impl<'a> Rebuilder<'a> {
    fn operand(&mut self, entry: &ResumeEntry) -> Operand {
        match entry {
            ResumeEntry::Const(c) => Operand::Const(c.clone()),
            ResumeEntry::Slot(slot) => {
                let values = self.values;
                let b = self
                    .boxes
                    .entry(*slot)
                    .or_insert_with(|| TraceBox::new(values[*slot as usize].clone()));
                Operand::Box(b.clone())
            }
        }
    }

    fn operands(&mut self, entries: &[ResumeEntry]) -> Vec<Operand> {
        entries.iter().map(|e| self.operand(e)).collect()
    }
}

/// Reconstruct the guest frame stack from a guard's snapshot and the
/// concrete failargs values at the failure. `overrides` carries the
/// force path's replacement values (empty for ordinary guards).
pub fn rebuild_from_resumedata(
    descr: &ResumeGuardDescr,
    values_at_failure: &[RawValue],
    overrides: &[(u32, RawValue)],
    pool: &mut FramePool,
) -> RebuiltState {
    let mut values: Vec<RawValue> = values_at_failure.to_vec();
    for (slot, value) in overrides {
        values[*slot as usize] = value.clone();
    }

    descr.with_snapshot(|snapshot| {
        let mut rebuilder = Rebuilder {
            values: &values,
            boxes: FxHashMap::default(),
        };
        let frames = snapshot
            .frames
            .iter()
            .map(|layer| {
                let mut frame = pool.alloc(layer.jitcode.clone(), layer.pc);
                frame.registers_i = rebuilder.operands(&layer.entries_i);
                frame.registers_r = rebuilder.operands(&layer.entries_r);
                frame.registers_f = rebuilder.operands(&layer.entries_f);
                frame
            })
            .collect();
        let virtualizable_boxes = rebuilder.operands(&snapshot.virtualizable);
        let virtualref_boxes = rebuilder.operands(&snapshot.virtualrefs);
        let mut slot_boxes: Vec<(u32, TraceBox)> = rebuilder.boxes.into_iter().collect();
        slot_boxes.sort_by_key(|&(slot, _)| slot);
        RebuiltState {
            frames,
            virtualizable_boxes,
            virtualref_boxes,
            slot_boxes,
        }
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::heap::Kind;
    use crate::jitcode::JitCodeBuilder;

    fn jitcode(regs_i: usize, regs_r: usize) -> Rc<JitCode> {
        let mut b = JitCodeBuilder::new("t", None);
        for _ in 0..regs_i {
            b.new_reg_i();
        }
        for _ in 0..regs_r {
            b.new_reg_r();
        }
        b.void_return();
        Rc::new(b.finish())
    }

    fn frame_with(
        pool: &mut FramePool,
        code: Rc<JitCode>,
        pc: usize,
        ints: Vec<Operand>,
    ) -> MIFrame {
        let mut frame = pool.alloc(code, pc);
        for (i, op) in ints.into_iter().enumerate() {
            frame.set_reg(Kind::Int, i as u8, op);
        }
        frame
    }

    #[test]
    fn test_shared_box_encoded_once() {
        let code = jitcode(2, 0);
        let mut pool = FramePool::new();
        let shared = TraceBox::new_int(5);

        let parent = frame_with(
            &mut pool,
            code.clone(),
            3,
            vec![shared.clone().into(), Operand::Const(ConstVal::Int(1))],
        );
        let child = frame_with(
            &mut pool,
            code.clone(),
            7,
            vec![shared.clone().into(), TraceBox::new_int(9).into()],
        );

        let descr = ResumeGuardDescr::new(OpNum::GuardTrue);
        capture_resumedata(&[parent, child], None, &[], &descr);

        // shared appears once in failargs, plus the distinct box
        assert_eq!(descr.failargs().len(), 2);
        descr.with_snapshot(|snap| {
            assert_eq!(snap.frames[0].entries_i[0], ResumeEntry::Slot(0));
            assert_eq!(snap.frames[1].entries_i[0], ResumeEntry::Slot(0));
            assert_eq!(snap.frames[1].entries_i[1], ResumeEntry::Slot(1));
            assert_eq!(
                snap.frames[0].entries_i[1],
                ResumeEntry::Const(ConstVal::Int(1))
            );
        });
    }

    #[test]
    fn test_rebuild_restores_sharing_and_values() {
        let code = jitcode(2, 0);
        let mut pool = FramePool::new();
        let shared = TraceBox::new_int(5);

        let parent = frame_with(
            &mut pool,
            code.clone(),
            3,
            vec![shared.clone().into(), Operand::Const(ConstVal::Int(1))],
        );
        let child = frame_with(
            &mut pool,
            code.clone(),
            7,
            vec![shared.clone().into(), TraceBox::new_int(9).into()],
        );

        let descr = ResumeGuardDescr::new(OpNum::GuardTrue);
        capture_resumedata(&[parent, child], None, &[], &descr);

        let rebuilt = rebuild_from_resumedata(
            &descr,
            &[RawValue::Int(50), RawValue::Int(90)],
            &[],
            &mut pool,
        );
        assert_eq!(rebuilt.frames.len(), 2);
        assert_eq!(rebuilt.frames[0].pc, 3);
        assert_eq!(rebuilt.frames[1].pc, 7);

        let a = rebuilt.frames[0].get_reg(Kind::Int, 0);
        let b = rebuilt.frames[1].get_reg(Kind::Int, 0);
        // sharing restored: same box identity in both frames
        assert_eq!(a, b);
        assert_eq!(a.int_value(), 50);
        assert_eq!(rebuilt.frames[1].get_reg(Kind::Int, 1).int_value(), 90);
        assert_eq!(
            rebuilt.frames[0].get_reg(Kind::Int, 1),
            Operand::Const(ConstVal::Int(1))
        );
    }

    #[test]
    fn test_resume_round_trip() {
        let code = jitcode(2, 1);
        let mut pool = FramePool::new();
        let b0 = TraceBox::new_int(5);

        let mut parent = pool.alloc(code.clone(), 2);
        parent.set_reg(Kind::Int, 0, b0.clone().into());
        parent.set_reg(Kind::Int, 1, Operand::Const(ConstVal::Int(7)));
        let child = frame_with(&mut pool, code.clone(), 9, vec![b0.into(), TraceBox::new_int(1).into()]);

        let descr = ResumeGuardDescr::new(OpNum::GuardFalse);
        capture_resumedata(&[parent, child], None, &[], &descr);

        let values: Vec<RawValue> = descr.failargs().iter().map(|b| b.value()).collect();
        let rebuilt = rebuild_from_resumedata(&descr, &values, &[], &mut pool);

        let descr2 = ResumeGuardDescr::new(OpNum::GuardFalse);
        capture_resumedata(&rebuilt.frames, None, &[], &descr2);

        descr.with_snapshot(|first| descr2.with_snapshot(|second| assert_eq!(first, second)));
    }

    #[test]
    fn test_failure_counter() {
        let descr = ResumeGuardDescr::new(OpNum::GuardTrue);
        assert_eq!(descr.count_failure(), 1);
        assert_eq!(descr.count_failure(), 2);
        descr.reset_counter();
        assert_eq!(descr.count_failure(), 1);
    }

    #[test]
    fn test_forced_descr_refreshes_from_heap() {
        let code = jitcode(1, 0);
        let mut pool = FramePool::new();

        // a virtualizable object with one int field, shadowed by a box
        let obj = GcRef::alloc_struct(1, &[Kind::Int], None);
        obj.set_field(0, RawValue::Int(10));
        let shadow = TraceBox::new_int(10);

        let frame = frame_with(&mut pool, code, 0, vec![shadow.clone().into()]);
        let forced = ResumeGuardForcedDescr::new();
        capture_resumedata(&[frame], Some(&[shadow.clone().into()]), &[], &forced.base);

        let field = Rc::new(FieldDescr {
            class: crate::heap::ClassId(0),
            offset: 0,
            kind: Kind::Int,
            name: "Vable.f0".to_string(),
        });
        forced.register_refresh(obj.clone(), &[(shadow, field)]);

        // the callee stores a new value while the trace thought it owned
        // the field
        obj.set_field(0, RawValue::Int(99));

        let overrides = forced.force_overrides();
        let values: Vec<RawValue> = forced.base.failargs().iter().map(|b| b.value()).collect();
        let rebuilt = rebuild_from_resumedata(&forced.base, &values, &overrides, &mut pool);
        assert_eq!(rebuilt.frames[0].get_reg(Kind::Int, 0).int_value(), 99);
        assert_eq!(rebuilt.virtualizable_boxes[0].int_value(), 99);
    }
}
