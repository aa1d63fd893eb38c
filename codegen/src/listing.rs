//! The listing: a linear IR for a single function.
//!
//! A listing owns an ordered sequence of instructions, the labels attached
//! between them, a tree of lexically scoped blocks, and the table of local
//! variables. Variables belong to exactly one block and carry a *free
//! policy* describing when and how they are released; blocks are begun and
//! ended by `begin_block`/`end_block` instructions, with the prolog and
//! epilog implicitly bracketing the root block.

use crate::inst::Inst;
use crate::label::Label;
use crate::operand::Operand;
use crate::size::Size;
use crate::ty::TypeDesc;
use smallvec::SmallVec;
use std::fmt;
use std::ops::{BitAnd, BitOr, BitOrAssign, Not};
use std::rc::Rc;

/// A lexical scope owning variables. Blocks form a tree rooted at the
/// listing's synthetic root block.
#[derive(Clone, Copy, PartialEq, Eq, Hash, Debug)]
pub struct Block(pub(crate) u32);

impl Block {
    pub fn key(self) -> u32 {
        self.0
    }
}

/// A local variable or parameter.
#[derive(Clone, Copy, PartialEq, Eq, Hash, Debug)]
pub struct Var {
    pub(crate) id: u32,
    pub(crate) size: Size,
}

impl Var {
    pub fn key(self) -> u32 {
        self.id
    }

    pub fn size(self) -> Size {
        self.size
    }
}

/// When and how a variable is released.
#[derive(Clone, Copy, PartialEq, Eq, Default)]
pub struct FreeOpt(u8);

impl FreeOpt {
    pub const NONE: FreeOpt = FreeOpt(0);
    /// Run the free function when the owning block exits normally.
    pub const ON_BLOCK_EXIT: FreeOpt = FreeOpt(0x1);
    /// Run the free function when an exception unwinds past the block.
    pub const ON_EXCEPTION: FreeOpt = FreeOpt(0x2);
    /// Both of the above.
    pub const BOTH: FreeOpt = FreeOpt(0x3);
    /// Pass the variable's address to the free function rather than its
    /// value.
    pub const PTR: FreeOpt = FreeOpt(0x4);
    /// The variable only becomes live after an explicit `activate`;
    /// destruction is skipped if the block exits before activation.
    pub const INACTIVE: FreeOpt = FreeOpt(0x8);
    /// The variable stores a pointer to the value rather than the value
    /// itself. Set by the lowering passes for parameters the ABI passes in
    /// memory.
    pub const INDIRECTION: FreeOpt = FreeOpt(0x10);
    /// Suppress the zero-initialization on block entry.
    pub const NO_INIT: FreeOpt = FreeOpt(0x20);

    pub fn contains(self, other: FreeOpt) -> bool {
        self.0 & other.0 == other.0
    }

    pub fn intersects(self, other: FreeOpt) -> bool {
        self.0 & other.0 != 0
    }
}

impl BitOr for FreeOpt {
    type Output = FreeOpt;
    fn bitor(self, o: FreeOpt) -> FreeOpt {
        FreeOpt(self.0 | o.0)
    }
}

impl BitOrAssign for FreeOpt {
    fn bitor_assign(&mut self, o: FreeOpt) {
        self.0 |= o.0;
    }
}

impl BitAnd for FreeOpt {
    type Output = FreeOpt;
    fn bitand(self, o: FreeOpt) -> FreeOpt {
        FreeOpt(self.0 & o.0)
    }
}

impl Not for FreeOpt {
    type Output = FreeOpt;
    fn not(self) -> FreeOpt {
        FreeOpt(!self.0)
    }
}

impl fmt::Debug for FreeOpt {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "FreeOpt({:#x})", self.0)
    }
}

#[derive(Clone)]
struct VarInfo {
    size: Size,
    block: Block,
    param: Option<Rc<TypeDesc>>,
    free_fn: Operand,
    free_opt: FreeOpt,
}

#[derive(Clone)]
struct BlockInfo {
    parent: Option<Block>,
    /// Variables in declaration order.
    vars: Vec<u32>,
}

/// The linear IR for a single function, including its scope tree.
#[derive(Clone)]
pub struct Listing {
    insts: Vec<Inst>,
    /// `labels[i]` holds the labels attached before instruction `i`; the
    /// final slot is the virtual label position at the end of the code.
    labels: Vec<SmallVec<[Label; 2]>>,
    /// Line each label is marked at, indexed by label key.
    label_pos: Vec<Option<u32>>,
    blocks: Vec<BlockInfo>,
    vars: Vec<VarInfo>,
    /// Root-block parameters in declaration order.
    params: Vec<u32>,
    result: Rc<TypeDesc>,
    member: bool,
    exception_aware: bool,
}

impl Listing {
    pub fn new() -> Listing {
        Listing::with_result(crate::ty::void_desc(), false)
    }

    pub fn with_result(result: Rc<TypeDesc>, member: bool) -> Listing {
        Listing {
            insts: Vec::new(),
            labels: vec![SmallVec::new()],
            label_pos: Vec::new(),
            blocks: vec![BlockInfo {
                parent: None,
                vars: Vec::new(),
            }],
            vars: Vec::new(),
            params: Vec::new(),
            result,
            member,
            exception_aware: false,
        }
    }

    /// A copy of the non-code tables (blocks, variables, labels, result)
    /// with an empty instruction stream. Used by the transform driver.
    pub(crate) fn clone_shell(&self) -> Listing {
        Listing {
            insts: Vec::new(),
            labels: vec![SmallVec::new()],
            label_pos: vec![None; self.label_pos.len()],
            blocks: self.blocks.clone(),
            vars: self.vars.clone(),
            params: self.params.clone(),
            result: self.result.clone(),
            member: self.member,
            exception_aware: self.exception_aware,
        }
    }

    pub fn result(&self) -> &Rc<TypeDesc> {
        &self.result
    }

    pub fn member(&self) -> bool {
        self.member
    }

    /// Is this listing exception-aware? Marking enables emission of the
    /// active-block table.
    pub fn exception_aware(&self) -> bool {
        self.exception_aware
    }

    pub fn set_exception_aware(&mut self) {
        self.exception_aware = true;
    }

    /*
     * Instructions.
     */

    pub fn count(&self) -> usize {
        self.insts.len()
    }

    pub fn at(&self, line: usize) -> &Inst {
        &self.insts[line]
    }

    pub fn insts(&self) -> &[Inst] {
        &self.insts
    }

    pub fn push(&mut self, i: Inst) -> &mut Listing {
        self.insts.push(i);
        self.labels.push(SmallVec::new());
        self
    }

    /*
     * Labels.
     */

    /// Allocate a fresh label. It names no position until marked.
    pub fn label(&mut self) -> Label {
        let l = Label(self.label_pos.len() as u32);
        self.label_pos.push(None);
        l
    }

    /// Attach `l` before the next instruction pushed.
    pub fn mark(&mut self, l: Label) {
        let line = self.insts.len();
        debug_assert!(
            self.label_pos[l.key() as usize].is_none(),
            "label {l} marked twice"
        );
        self.label_pos[l.key() as usize] = Some(line as u32);
        self.labels[line].push(l);
    }

    /// Labels attached before instruction `line`. `line == count()` names
    /// the virtual position at the end.
    pub fn labels_at(&self, line: usize) -> &[Label] {
        &self.labels[line]
    }

    /// The line a label is marked at, if it has been marked.
    pub fn label_line(&self, l: Label) -> Option<u32> {
        self.label_pos[l.key() as usize]
    }

    pub fn label_count(&self) -> usize {
        self.label_pos.len()
    }

    /*
     * Blocks.
     */

    pub fn root(&self) -> Block {
        Block(0)
    }

    pub fn create_block(&mut self, parent: Block) -> Block {
        let b = Block(self.blocks.len() as u32);
        self.blocks.push(BlockInfo {
            parent: Some(parent),
            vars: Vec::new(),
        });
        b
    }

    pub fn parent(&self, b: Block) -> Option<Block> {
        self.blocks[b.0 as usize].parent
    }

    pub fn block_count(&self) -> usize {
        self.blocks.len()
    }

    /// Is `b` equal to, or an ancestor of, `of`?
    pub fn is_ancestor(&self, b: Block, of: Block) -> bool {
        let mut current = Some(of);
        while let Some(c) = current {
            if c == b {
                return true;
            }
            current = self.parent(c);
        }
        false
    }

    /*
     * Variables.
     */

    pub fn create_var(&mut self, block: Block, size: Size) -> Var {
        self.create_var_free(block, size, Operand::none(), FreeOpt::NONE)
    }

    pub fn create_var_free(
        &mut self,
        block: Block,
        size: Size,
        free_fn: Operand,
        free_opt: FreeOpt,
    ) -> Var {
        let id = self.vars.len() as u32;
        self.vars.push(VarInfo {
            size,
            block,
            param: None,
            free_fn,
            free_opt,
        });
        self.blocks[block.0 as usize].vars.push(id);
        if free_opt.intersects(FreeOpt::ON_EXCEPTION) {
            self.exception_aware = true;
        }
        Var { id, size }
    }

    /// A variable of a described type. Complex types get their destructor
    /// as the free function, released by pointer.
    pub fn create_typed_var(&mut self, block: Block, ty: &Rc<TypeDesc>, opt: FreeOpt) -> Var {
        match &**ty {
            TypeDesc::Complex { dtor, .. } => {
                self.create_var_free(block, ty.size(), dtor.clone().into(), opt | FreeOpt::PTR)
            }
            _ => self.create_var_free(block, ty.size(), Operand::none(), opt),
        }
    }

    /// Declare the next parameter of the function.
    pub fn create_param(&mut self, ty: &Rc<TypeDesc>) -> Var {
        let v = self.create_typed_var(self.root(), ty, FreeOpt::NONE);
        self.vars[v.id as usize].param = Some(ty.clone());
        self.params.push(v.id);
        v
    }

    pub fn var_count(&self) -> usize {
        self.vars.len()
    }

    /// All variables, in creation order.
    pub fn all_vars(&self) -> Vec<Var> {
        self.vars
            .iter()
            .enumerate()
            .map(|(id, info)| Var {
                id: id as u32,
                size: info.size,
            })
            .collect()
    }

    /// The variables declared directly in `block`, in declaration order.
    pub fn vars_in(&self, block: Block) -> Vec<Var> {
        self.blocks[block.0 as usize]
            .vars
            .iter()
            .map(|&id| Var {
                id,
                size: self.vars[id as usize].size,
            })
            .collect()
    }

    /// The function's parameters, in declaration order.
    pub fn all_params(&self) -> Vec<Var> {
        self.params
            .iter()
            .map(|&id| Var {
                id,
                size: self.vars[id as usize].size,
            })
            .collect()
    }

    pub fn is_param(&self, v: Var) -> bool {
        self.vars[v.id as usize].param.is_some()
    }

    pub fn param_desc(&self, v: Var) -> Option<&Rc<TypeDesc>> {
        self.vars[v.id as usize].param.as_ref()
    }

    pub fn declared_in(&self, v: Var) -> Block {
        self.vars[v.id as usize].block
    }

    pub fn free_fn(&self, v: Var) -> &Operand {
        &self.vars[v.id as usize].free_fn
    }

    pub fn free_opt(&self, v: Var) -> FreeOpt {
        self.vars[v.id as usize].free_opt
    }

    pub fn set_free_opt(&mut self, v: Var, opt: FreeOpt) {
        self.vars[v.id as usize].free_opt = opt;
        if opt.intersects(FreeOpt::ON_EXCEPTION) {
            self.exception_aware = true;
        }
    }

    /// Is `v` visible from `block`, i.e. is its declaring block an
    /// ancestor of (or equal to) `block`?
    pub fn accessible(&self, v: Var, block: Block) -> bool {
        self.is_ancestor(self.declared_in(v), block)
    }
}

impl Default for Listing {
    fn default() -> Listing {
        Listing::new()
    }
}

impl fmt::Debug for Listing {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(f, "listing ({} instructions):", self.insts.len())?;
        for (i, inst) in self.insts.iter().enumerate() {
            for l in self.labels_at(i) {
                writeln!(f, "{l}:")?;
            }
            writeln!(f, "  {inst:?}")?;
        }
        for l in self.labels_at(self.insts.len()) {
            writeln!(f, "{l}:")?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::inst::*;
    use crate::ty::int_desc;

    #[test]
    fn block_tree() {
        let mut l = Listing::new();
        let root = l.root();
        let b1 = l.create_block(root);
        let b2 = l.create_block(b1);
        let b3 = l.create_block(root);

        assert_eq!(l.parent(b1), Some(root));
        assert_eq!(l.parent(b2), Some(b1));
        assert!(l.is_ancestor(root, b2));
        assert!(l.is_ancestor(b1, b2));
        assert!(!l.is_ancestor(b2, b1));
        assert!(!l.is_ancestor(b3, b2));
    }

    #[test]
    fn variable_visibility() {
        let mut l = Listing::new();
        let b1 = l.create_block(l.root());
        let b2 = l.create_block(b1);

        let root_var = l.create_var(l.root(), Size::INT);
        let inner = l.create_var(b1, Size::PTR);

        assert!(l.accessible(root_var, b2));
        assert!(l.accessible(inner, b2));
        assert!(l.accessible(inner, b1));
        assert!(!l.accessible(inner, l.root()));
    }

    #[test]
    fn params_are_root_vars() {
        let mut l = Listing::new();
        let p0 = l.create_param(&int_desc());
        let p1 = l.create_param(&int_desc());

        assert!(l.is_param(p0));
        assert_eq!(l.all_params(), vec![p0, p1]);
        assert_eq!(l.declared_in(p0), l.root());
    }

    #[test]
    fn labels_attach_before_next_instruction() {
        let mut l = Listing::new();
        let a = l.label();
        let b = l.label();

        l.push(nop());
        l.mark(a);
        l.push(nop());
        l.mark(b); // Virtual label at the end.

        assert_eq!(l.labels_at(0), &[]);
        assert_eq!(l.labels_at(1), &[a]);
        assert_eq!(l.labels_at(2), &[b]);
        assert_eq!(l.label_line(a), Some(1));
        assert_eq!(l.label_line(b), Some(2));
    }

    #[test]
    fn exception_awareness_follows_free_policy() {
        let mut l = Listing::new();
        assert!(!l.exception_aware());
        l.create_var_free(
            l.root(),
            Size::PTR,
            Operand::none(),
            FreeOpt::ON_EXCEPTION | FreeOpt::PTR,
        );
        assert!(l.exception_aware());
    }
}
