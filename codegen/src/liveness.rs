//! Live-register analysis.
//!
//! A single backwards sweep computes, for every instruction, the set of
//! registers that must be preserved at that point (live-in). Back-edges
//! are detected on the way: since the sweep runs backwards, a jump to a
//! label that has not yet been visited is a forward edge and needs no
//! work, while jumps to already-visited labels are queued and re-traversed
//! until the sets stop changing. One shared work list keeps this linear in
//! the number of back-edges that actually change.

use crate::cond::CondFlag;
use crate::inst::Inst;
use crate::listing::Listing;
use crate::op::Op;
use crate::operand::{Operand, OperandKind};
use crate::reg::RegSet;
use log::trace;
use std::collections::VecDeque;

/// The result of the analysis.
pub struct Liveness {
    /// Live registers at the point of each instruction.
    pub at: Vec<RegSet>,
    /// All registers written anywhere in the listing.
    pub all: RegSet,
}

fn put_op(set: &mut RegSet, op: &Operand) {
    if let OperandKind::Reg(r) = *op.kind() {
        set.put(r);
    }
}

fn remove_op(set: &mut RegSet, op: &Operand) {
    if let OperandKind::Reg(r) = *op.kind() {
        set.remove(r);
    }
}

/// Base registers of memory operands are read by the instruction.
fn put_indirect(set: &mut RegSet, op: &Operand) {
    if let OperandKind::Rel(r, _) = *op.kind() {
        set.put(r);
    }
}

fn process(inst: &Inst, dirty: Option<&RegSet>, used: &mut RegSet) {
    match inst.op() {
        // These do not preserve registers through; 'used' should be empty
        // here for well-formed programs.
        Op::EndBlock | Op::JmpBlock | Op::Prolog => used.clear(),

        // Non-label jumps only occur for tail-calls and other low-level
        // things; assume no dependencies.
        Op::Jmp => used.clear(),

        Op::BeginBlock | Op::Swap => {}

        // Only registers preserved through calls survive.
        Op::FnCall | Op::FnCallRef | Op::Call => match dirty {
            Some(dirty) => {
                for r in dirty.iter() {
                    used.remove(r);
                }
            }
            None => used.clear(),
        },

        // xor r, r is the idiomatic zeroing form: it kills r.
        Op::Xor if inst.src() == inst.dest() => {
            remove_op(used, inst.src());
        }

        _ => {
            put_indirect(used, inst.src());
            put_indirect(used, inst.dest());
            put_op(used, inst.src());
            if inst.mode().writes() {
                remove_op(used, inst.dest());
            }
            if inst.mode().reads() {
                put_op(used, inst.dest());
            }
        }
    }
}

fn is_label_jump(inst: &Inst) -> bool {
    inst.op() == Op::Jmp && matches!(inst.dest().kind(), OperandKind::Label(_))
}

struct State<'a> {
    src: &'a Listing,
    dirty: Option<&'a RegSet>,
    used: Vec<RegSet>,
    /// Line each label resolves to, discovered during the first sweep.
    label_line: Vec<u32>,
    /// Lines that jump to each label.
    label_deps: Vec<Vec<usize>>,
    work: VecDeque<usize>,
    in_work: Vec<bool>,
}

impl<'a> State<'a> {
    fn new(src: &'a Listing, dirty: Option<&'a RegSet>) -> State<'a> {
        State {
            src,
            dirty,
            used: vec![RegSet::new(); src.count()],
            label_line: vec![0; src.label_count()],
            label_deps: vec![Vec::new(); src.label_count()],
            work: VecDeque::new(),
            in_work: vec![false; src.count()],
        }
    }

    /// Merge the target's live set into `now`. Returns whether the jump
    /// depends on the target at all.
    fn process_jump(&self, inst: &Inst, target: u32, now: &mut RegSet) -> bool {
        let target_line = self.label_line[target as usize] as usize;
        match inst.src().cond() {
            CondFlag::Always => {
                *now = self.used[target_line].clone();
                true
            }
            CondFlag::Never => false,
            _ => {
                now.put_all(&self.used[target_line]);
                true
            }
        }
    }

    fn queue_deps(&mut self, label: u32) {
        // Swap the list out to appease the borrow checker; it is put back
        // untouched, the queue only records line numbers.
        let deps = std::mem::take(&mut self.label_deps[label as usize]);
        for &line in &deps {
            if !self.in_work[line] {
                self.in_work[line] = true;
                self.work.push_back(line);
            }
        }
        self.label_deps[label as usize] = deps;
    }

    /// The initial sweep over every instruction.
    fn traverse_first(&mut self, all: &mut RegSet) {
        let mut now = RegSet::new();

        for line in (0..self.src.count()).rev() {
            let inst = self.src.at(line);

            if is_label_jump(inst) {
                let target = inst.dest().label().key();
                if self.process_jump(inst, target, &mut now) {
                    self.label_deps[target as usize].push(line);
                }
            } else {
                process(inst, self.dirty, &mut now);
            }

            self.used[line] = now.clone();

            if inst.mode().writes() {
                put_op(all, inst.dest());
            }

            // Working backwards means that any dependency recorded for a
            // label by now is a back-edge: exactly the ones to revisit.
            let labels: Vec<u32> = self.src.labels_at(line).iter().map(|l| l.key()).collect();
            for l in labels {
                self.label_line[l as usize] = line as u32;
                self.queue_deps(l);
            }
        }
    }

    /// Re-traversal from a back-edge. Stops as soon as the computed set
    /// stops differing from the stored one.
    fn traverse_next(&mut self, start: usize) {
        let mut now = if start + 1 < self.src.count() {
            self.used[start + 1].clone()
        } else {
            RegSet::new()
        };

        for line in (0..=start).rev() {
            let inst = self.src.at(line);

            if is_label_jump(inst) {
                let target = inst.dest().label().key();
                self.process_jump(inst, target, &mut now);
            } else {
                process(inst, self.dirty, &mut now);
            }

            if now == self.used[line] {
                return;
            }
            self.used[line] = now.clone();

            let labels: Vec<u32> = self.src.labels_at(line).iter().map(|l| l.key()).collect();
            for l in labels {
                self.queue_deps(l);
            }
        }
    }
}

/// Compute the live registers at each instruction of `src`.
///
/// `dirty` is the target's set of caller-saved registers; they are removed
/// from the live set at call instructions. Passing `None` clears the set
/// at calls instead, which is a conservative over-approximation.
pub fn used_regs(dirty: Option<&RegSet>, src: &Listing) -> Liveness {
    let mut state = State::new(src, dirty);
    let mut all = RegSet::new();

    state.traverse_first(&mut all);

    let mut revisits = 0usize;
    while let Some(line) = state.work.pop_front() {
        state.in_work[line] = false;
        state.traverse_next(line);
        revisits += 1;
    }
    if revisits > 0 {
        trace!("liveness converged after {revisits} re-traversals");
    }

    Liveness {
        at: state.used,
        all,
    }
}

/// The union of registers written anywhere in `src`.
pub fn all_used_regs(src: &Listing) -> RegSet {
    let mut all = RegSet::new();
    for inst in src.insts() {
        if inst.mode().writes() {
            put_op(&mut all, inst.dest());
        }
    }
    all
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cond::CondFlag;
    use crate::inst::*;
    use crate::operand::int_const;
    use crate::reg::{EAX, EBX, ECX};

    #[test]
    fn straight_line() {
        let mut l = Listing::new();
        l.push(mov(EAX, int_const(1)));
        l.push(add(EAX, EBX));
        l.push(mov(ECX, EAX));

        let live = used_regs(None, &l);

        // Before the first mov: ebx is read later, eax is overwritten.
        assert!(live.at[0].has(EBX));
        assert!(!live.at[0].has(EAX));
        // Before the add: both inputs live.
        assert!(live.at[1].has(EAX));
        assert!(live.at[1].has(EBX));
        // Before the final mov: only eax.
        assert!(live.at[2].has(EAX));
        assert!(!live.at[2].has(EBX));

        assert!(live.all.has(EAX));
        assert!(live.all.has(ECX));
        assert!(!live.all.has(EBX));
    }

    #[test]
    fn xor_zeroing_kills() {
        let mut l = Listing::new();
        l.push(bxor(EAX, EAX));
        l.push(mov(EBX, EAX));

        let live = used_regs(None, &l);
        assert!(!live.at[0].has(EAX));
    }

    #[test]
    fn back_edge_fixpoint() {
        // loop: ebx is read inside the loop body after the jump back, so
        // it must be live throughout the loop.
        let mut l = Listing::new();
        let top = l.label();
        l.push(mov(EAX, int_const(0)));
        l.mark(top);
        l.push(add(EAX, EBX));
        l.push(cmp(EAX, int_const(100)));
        l.push(jmp(top, CondFlag::Less));
        l.push(mov(ECX, EAX));

        let live = used_regs(None, &l);

        // ebx is live at the conditional jump (the back-edge target reads
        // it), and already at the loop head.
        assert!(live.at[3].has(EBX));
        assert!(live.at[1].has(EBX));
        assert!(live.at[0].has(EBX));
        assert!(live.at[4].has(EAX));
    }

    #[test]
    fn conservative_rule_holds() {
        // Written-before-read along every path => not live.
        let mut l = Listing::new();
        l.push(mov(EAX, int_const(1)));
        l.push(mov(EBX, EAX));

        let live = used_regs(None, &l);
        assert!(!live.at[0].has(EAX));
        assert!(!live.at[0].has(EBX));
    }
}
