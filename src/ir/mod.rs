//! The mutable loop-nest tree that scheduling primitives rewrite.
//!
//! A [LoopNest] holds one or more sub-expressions, each a sequence of [Stmt]s. Blocks are
//! computation statements. Their iteration variables are bound to expressions over the loop
//! variables enclosing them, so loop transformations only rewrite those bindings and never the
//! block's accesses.
//!
//! Handles ([BlockRef], [LoopRef]) are stamped with the nest's generation. Any primitive that
//! changes the set of blocks or loops bumps the generation, after which older handles are
//! rejected with [ScheduleError::StaleHandle].

pub mod builder;
mod interp;

pub use builder::{BlockBuilder, NestBuilder};
pub use interp::Instance;

use crate::common::{Dtype, Shape};
use crate::expr::{Atom, Bounds, NonAffineExpr};
use crate::scheduling::ScheduleError;
use crate::utils::indent;

use serde::{Deserialize, Serialize};
use std::fmt;

pub type Expr = NonAffineExpr<Var>;

/// A loop or block iteration variable. Its extent is fixed at creation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct Var {
    id: u32,
    extent: u32,
}

impl Var {
    pub fn id(&self) -> u32 {
        self.id
    }

    pub fn extent(&self) -> u32 {
        self.extent
    }
}

impl Bounds for Var {
    fn bounds(&self) -> Option<(i32, i32)> {
        Some((0, self.extent as i32 - 1))
    }
}

impl Atom for Var {}

#[derive(
    Debug,
    Clone,
    Copy,
    PartialEq,
    Eq,
    Hash,
    strum::Display,
    strum::EnumString,
    strum::EnumIter,
    Serialize,
    Deserialize,
)]
pub enum DeviceAxis {
    #[strum(serialize = "blockIdx.x")]
    BlockX,
    #[strum(serialize = "blockIdx.y")]
    BlockY,
    #[strum(serialize = "blockIdx.z")]
    BlockZ,
    #[strum(serialize = "threadIdx.x")]
    ThreadX,
    #[strum(serialize = "threadIdx.y")]
    ThreadY,
    #[strum(serialize = "threadIdx.z")]
    ThreadZ,
}

impl DeviceAxis {
    pub fn is_block(&self) -> bool {
        matches!(
            self,
            DeviceAxis::BlockX | DeviceAxis::BlockY | DeviceAxis::BlockZ
        )
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Annotation {
    Serial,
    Parallel,
    Vectorized(u32),
    Unrolled,
    Bound(DeviceAxis),
}

impl fmt::Display for Annotation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Annotation::Serial => write!(f, "serial"),
            Annotation::Parallel => write!(f, "parallel"),
            Annotation::Vectorized(width) => write!(f, "vectorize({width})"),
            Annotation::Unrolled => write!(f, "unroll"),
            Annotation::Bound(axis) => write!(f, "{axis}"),
        }
    }
}

#[derive(
    Debug,
    Clone,
    Copy,
    PartialEq,
    Eq,
    Hash,
    strum::Display,
    strum::EnumString,
    Serialize,
    Deserialize,
)]
#[strum(serialize_all = "lowercase")]
pub enum MemScope {
    Global,
    Shared,
    Local,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct BufferId(u32);

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Buffer {
    pub name: String,
    pub shape: Shape,
    pub dtype: Dtype,
    pub scope: MemScope,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum IterKind {
    Spatial,
    Reduce,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct IterVar {
    pub var: Var,
    pub kind: IterKind,
}

/// A buffer access. Indices are expressions over the accessing block's iteration variables.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Access {
    pub buffer: BufferId,
    pub indices: Vec<Expr>,
}

/// Holds when `expr < bound`. `expr` ranges over loop variables.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Predicate {
    pub expr: Expr,
    pub bound: i32,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, strum::Display, clap::ValueEnum)]
#[strum(serialize_all = "lowercase")]
pub enum ReduceKind {
    Sum,
    Max,
    Min,
}

/// What a block computes from its reads.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Op {
    Copy,
    /// Copies the read when it lies in bounds and writes the pad value otherwise.
    Pad,
    Map(String),
    Reduce(ReduceKind),
}

/// One argument of a block's [Op].
///
/// A freshly built block applies its op to each of its reads in order. Inlining a producer
/// replaces the argument that read the producer's output with the producer's own op applied
/// to its arguments, so the whole computation stays visible in the consumer. A [Op::Pad]
/// argument keeps its bounds check against the shape of the buffer it reads.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Operand {
    /// The access at this position of the block's reads.
    Read(usize),
    Inlined {
        block: String,
        op: Op,
        args: Vec<Operand>,
    },
}

impl Operand {
    pub(crate) fn reads(count: usize) -> Vec<Operand> {
        (0..count).map(Operand::Read).collect()
    }

    /// Replaces `Read(at)` with `replacement` and shifts later read positions by `shift`.
    pub(crate) fn splice(&mut self, at: usize, replacement: &Operand, shift: usize) {
        match self {
            Operand::Read(i) if *i == at => *self = replacement.clone(),
            Operand::Read(i) if *i > at => *i = *i + shift - 1,
            Operand::Read(_) => {}
            Operand::Inlined { args, .. } => {
                for arg in args {
                    arg.splice(at, replacement, shift);
                }
            }
        }
    }

    /// Offsets every read position by `by`.
    pub(crate) fn offset(&self, by: usize) -> Operand {
        match self {
            Operand::Read(i) => Operand::Read(i + by),
            Operand::Inlined { block, op, args } => Operand::Inlined {
                block: block.clone(),
                op: op.clone(),
                args: args.iter().map(|a| a.offset(by)).collect(),
            },
        }
    }

    fn collect_inlined<'a>(&'a self, out: &mut Vec<&'a str>) {
        if let Operand::Inlined { block, args, .. } = self {
            out.push(block);
            for arg in args {
                arg.collect_inlined(out);
            }
        }
    }
}

impl fmt::Display for Op {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Op::Copy => write!(f, "copy"),
            Op::Pad => write!(f, "pad"),
            Op::Map(name) => write!(f, "{name}"),
            Op::Reduce(kind) => write!(f, "reduce_{kind}"),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Block {
    pub(crate) name: String,
    pub(crate) iters: Vec<IterVar>,
    /// One binding per entry of `iters`, over enclosing loop variables.
    pub(crate) values: Vec<Expr>,
    pub(crate) write: Access,
    pub(crate) reads: Vec<Access>,
    pub(crate) predicates: Vec<Predicate>,
    pub(crate) op: Op,
    pub(crate) operands: Vec<Operand>,
}

impl Block {
    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn iters(&self) -> &[IterVar] {
        &self.iters
    }

    pub fn values(&self) -> &[Expr] {
        &self.values
    }

    pub fn write(&self) -> &Access {
        &self.write
    }

    pub fn reads(&self) -> &[Access] {
        &self.reads
    }

    pub fn predicates(&self) -> &[Predicate] {
        &self.predicates
    }

    pub fn op(&self) -> &Op {
        &self.op
    }

    pub fn operands(&self) -> &[Operand] {
        &self.operands
    }

    /// Names of producers that were inlined into this block, outermost first.
    pub fn inlined(&self) -> Vec<&str> {
        let mut names = vec![];
        for operand in &self.operands {
            operand.collect_inlined(&mut names);
        }
        names
    }

    pub fn has_reduction(&self) -> bool {
        self.iters.iter().any(|iv| iv.kind == IterKind::Reduce)
    }

    pub fn reads_buffer(&self, buffer: BufferId) -> bool {
        self.reads.iter().any(|r| r.buffer == buffer)
    }

    /// Rewrites every binding and predicate in terms of `replacement` for `var`.
    pub(crate) fn substitute_loop_var(&mut self, var: &Var, replacement: &Expr) {
        for value in &mut self.values {
            if value.contains_var(var) {
                *value = value.subs(var, replacement);
            }
        }
        for predicate in &mut self.predicates {
            if predicate.expr.contains_var(var) {
                predicate.expr = predicate.expr.subs(var, replacement);
            }
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Loop {
    pub(crate) var: Var,
    pub(crate) annotation: Annotation,
    pub(crate) body: Vec<Stmt>,
}

impl Loop {
    pub fn var(&self) -> Var {
        self.var
    }

    pub fn extent(&self) -> u32 {
        self.var.extent
    }

    pub fn annotation(&self) -> Annotation {
        self.annotation
    }

    pub fn body(&self) -> &[Stmt] {
        &self.body
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Stmt {
    Loop(Loop),
    Block(Block),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct BlockRef {
    generation: u64,
    index: usize,
}

impl BlockRef {
    /// Position of the block in nest order.
    pub fn index(&self) -> usize {
        self.index
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct LoopRef {
    generation: u64,
    var: Var,
}

impl LoopRef {
    pub fn var(&self) -> Var {
        self.var
    }

    pub fn extent(&self) -> u32 {
        self.var.extent
    }
}

/// Location of a statement: a sub-expression and child indices from its root sequence.
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) struct StmtPath {
    pub expr: usize,
    pub steps: Vec<usize>,
}

impl StmtPath {
    pub fn parent_steps(&self) -> &[usize] {
        &self.steps[..self.steps.len() - 1]
    }

    pub fn last(&self) -> usize {
        self.steps[self.steps.len() - 1]
    }

    pub fn is_within(&self, ancestor: &StmtPath) -> bool {
        self.expr == ancestor.expr
            && self.steps.len() > ancestor.steps.len()
            && self.steps.starts_with(&ancestor.steps)
    }
}

/// A block together with where it sits.
#[derive(Debug, Clone)]
pub(crate) struct BlockSite {
    pub path: StmtPath,
    /// Enclosing loop variables, outermost first.
    pub loops: Vec<Var>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LoopNest {
    pub(crate) exprs: Vec<Vec<Stmt>>,
    pub(crate) buffers: Vec<Buffer>,
    pub(crate) var_names: Vec<String>,
    pub(crate) generation: u64,
}

impl LoopNest {
    pub(crate) fn empty() -> Self {
        LoopNest {
            exprs: vec![],
            buffers: vec![],
            var_names: vec![],
            generation: 0,
        }
    }

    /// All blocks in nest order.
    pub fn get_all_blocks(&self) -> Vec<BlockRef> {
        (0..self.block_sites().len())
            .map(|index| BlockRef {
                generation: self.generation,
                index,
            })
            .collect()
    }

    /// The loops enclosing `block`, outermost first.
    pub fn get_loops(&self, block: &BlockRef) -> Result<Vec<LoopRef>, ScheduleError> {
        let site = self.block_site(block)?;
        Ok(site
            .loops
            .into_iter()
            .map(|var| LoopRef {
                generation: self.generation,
                var,
            })
            .collect())
    }

    /// Splices every sub-expression into one, preserving block order.
    ///
    /// Block positions and loops are unchanged, so existing handles stay valid.
    pub fn merge_exprs(&mut self) {
        if self.exprs.len() <= 1 {
            return;
        }
        let merged = std::mem::take(&mut self.exprs).into_iter().flatten().collect();
        self.exprs = vec![merged];
        log::trace!("merged sub-expressions");
    }

    pub fn get_block(&self, name: &str) -> Result<BlockRef, ScheduleError> {
        let sites = self.block_sites();
        sites
            .iter()
            .position(|site| self.block_at(&site.path).name == name)
            .map(|index| BlockRef {
                generation: self.generation,
                index,
            })
            .ok_or_else(|| ScheduleError::UnknownBlock(name.to_owned()))
    }

    pub fn block(&self, block: &BlockRef) -> Result<&Block, ScheduleError> {
        let site = self.block_site(block)?;
        Ok(self.block_at(&site.path))
    }

    pub fn loop_info(&self, lp: &LoopRef) -> Result<&Loop, ScheduleError> {
        let path = self.loop_path(lp)?;
        Ok(self.loop_at(&path))
    }

    pub fn buffer(&self, id: BufferId) -> &Buffer {
        &self.buffers[id.0 as usize]
    }

    pub fn buffers(&self) -> impl Iterator<Item = (BufferId, &Buffer)> + '_ {
        self.buffers
            .iter()
            .enumerate()
            .map(|(i, b)| (BufferId(i as u32), b))
    }

    pub fn block_count(&self) -> usize {
        self.block_sites().len()
    }

    pub fn expr_count(&self) -> usize {
        self.exprs.len()
    }

    pub fn exprs(&self) -> &[Vec<Stmt>] {
        &self.exprs
    }

    pub fn generation(&self) -> u64 {
        self.generation
    }

    pub fn var_name(&self, var: Var) -> &str {
        &self.var_names[var.id as usize]
    }

    /// The buffer that `block` writes.
    pub fn output_buffer(&self, block: &BlockRef) -> Result<&Buffer, ScheduleError> {
        let b = self.block(block)?;
        Ok(self.buffer(b.write.buffer))
    }

    /// The buffer behind `block`'s read at `read_index`.
    pub fn read_buffer(&self, block: &BlockRef, read_index: usize) -> Result<&Buffer, ScheduleError> {
        let b = self.block(block)?;
        let access = b
            .reads
            .get(read_index)
            .ok_or_else(|| ScheduleError::InvalidReadIndex {
                block: b.name.clone(),
                index: read_index,
            })?;
        Ok(self.buffer(access.buffer))
    }

    pub(crate) fn new_var(&mut self, name: impl Into<String>, extent: u32) -> Var {
        debug_assert!(extent > 0 && extent <= i32::MAX as u32);
        let id = u32::try_from(self.var_names.len()).unwrap();
        self.var_names.push(name.into());
        Var { id, extent }
    }

    pub(crate) fn add_buffer(&mut self, buffer: Buffer) -> BufferId {
        self.buffers.push(buffer);
        BufferId(u32::try_from(self.buffers.len() - 1).unwrap())
    }

    pub(crate) fn buffer_mut(&mut self, id: BufferId) -> &mut Buffer {
        &mut self.buffers[id.0 as usize]
    }

    /// Picks `base`, or `base` with a numeric suffix, so that no buffer carries the name.
    pub(crate) fn fresh_buffer_name(&self, base: &str) -> String {
        let taken = |n: &str| self.buffers.iter().any(|b| b.name == n);
        if !taken(base) {
            return base.to_owned();
        }
        (1..)
            .map(|i| format!("{base}_{i}"))
            .find(|n| !taken(n))
            .unwrap()
    }

    pub(crate) fn invalidate_handles(&mut self) {
        self.generation += 1;
    }

    fn check_generation(&self, generation: u64) -> Result<(), ScheduleError> {
        if generation != self.generation {
            return Err(ScheduleError::StaleHandle {
                handle: generation,
                current: self.generation,
            });
        }
        Ok(())
    }

    pub(crate) fn block_sites(&self) -> Vec<BlockSite> {
        let mut out = vec![];
        for (expr, stmts) in self.exprs.iter().enumerate() {
            collect_sites(stmts, expr, &mut vec![], &mut vec![], &mut out);
        }
        out
    }

    pub(crate) fn block_site(&self, block: &BlockRef) -> Result<BlockSite, ScheduleError> {
        self.check_generation(block.generation)?;
        self.block_sites()
            .into_iter()
            .nth(block.index)
            .ok_or(ScheduleError::InvalidBlock(block.index))
    }

    pub(crate) fn loop_path(&self, lp: &LoopRef) -> Result<StmtPath, ScheduleError> {
        self.check_generation(lp.generation)?;
        self.find_loop(lp.var)
            .ok_or_else(|| ScheduleError::UnknownLoop(self.var_name(lp.var).to_owned()))
    }

    pub(crate) fn find_loop(&self, var: Var) -> Option<StmtPath> {
        fn search(stmts: &[Stmt], var: Var, steps: &mut Vec<usize>) -> bool {
            for (i, stmt) in stmts.iter().enumerate() {
                if let Stmt::Loop(l) = stmt {
                    steps.push(i);
                    if l.var == var || search(&l.body, var, steps) {
                        return true;
                    }
                    steps.pop();
                }
            }
            false
        }

        for (expr, stmts) in self.exprs.iter().enumerate() {
            let mut steps = vec![];
            if search(stmts, var, &mut steps) {
                return Some(StmtPath { expr, steps });
            }
        }
        None
    }

    pub(crate) fn loop_ref(&self, var: Var) -> LoopRef {
        LoopRef {
            generation: self.generation,
            var,
        }
    }

    /// Loops strictly enclosing the statement at `path`, outermost first.
    pub(crate) fn enclosing_loops(&self, path: &StmtPath) -> Vec<&Loop> {
        let mut result = vec![];
        let mut body = &self.exprs[path.expr];
        for &step in path.parent_steps() {
            match &body[step] {
                Stmt::Loop(l) => {
                    result.push(l);
                    body = &l.body;
                }
                Stmt::Block(_) => unreachable!("path descends through a block"),
            }
        }
        result
    }

    pub(crate) fn body(&self, expr: usize, steps: &[usize]) -> &Vec<Stmt> {
        let mut body = &self.exprs[expr];
        for &step in steps {
            body = match &body[step] {
                Stmt::Loop(l) => &l.body,
                Stmt::Block(_) => unreachable!("path descends through a block"),
            };
        }
        body
    }

    pub(crate) fn body_mut(&mut self, expr: usize, steps: &[usize]) -> &mut Vec<Stmt> {
        let mut body = &mut self.exprs[expr];
        for &step in steps {
            body = match &mut body[step] {
                Stmt::Loop(l) => &mut l.body,
                Stmt::Block(_) => unreachable!("path descends through a block"),
            };
        }
        body
    }

    pub(crate) fn stmt(&self, path: &StmtPath) -> &Stmt {
        &self.body(path.expr, path.parent_steps())[path.last()]
    }

    pub(crate) fn stmt_mut(&mut self, path: &StmtPath) -> &mut Stmt {
        let last = path.last();
        &mut self.body_mut(path.expr, path.parent_steps())[last]
    }

    pub(crate) fn block_at(&self, path: &StmtPath) -> &Block {
        match self.stmt(path) {
            Stmt::Block(b) => b,
            Stmt::Loop(_) => unreachable!("expected a block"),
        }
    }

    pub(crate) fn block_at_mut(&mut self, path: &StmtPath) -> &mut Block {
        match self.stmt_mut(path) {
            Stmt::Block(b) => b,
            Stmt::Loop(_) => unreachable!("expected a block"),
        }
    }

    pub(crate) fn loop_at(&self, path: &StmtPath) -> &Loop {
        match self.stmt(path) {
            Stmt::Loop(l) => l,
            Stmt::Block(_) => unreachable!("expected a loop"),
        }
    }

    pub(crate) fn loop_at_mut(&mut self, path: &StmtPath) -> &mut Loop {
        match self.stmt_mut(path) {
            Stmt::Loop(l) => l,
            Stmt::Block(_) => unreachable!("expected a loop"),
        }
    }

    pub(crate) fn remove_stmt(&mut self, path: &StmtPath) -> Stmt {
        let last = path.last();
        self.body_mut(path.expr, path.parent_steps()).remove(last)
    }

    /// Removes loops left without a body and sub-expressions left empty.
    pub(crate) fn prune_empty(&mut self) {
        fn prune(stmts: &mut Vec<Stmt>) {
            for stmt in stmts.iter_mut() {
                if let Stmt::Loop(l) = stmt {
                    prune(&mut l.body);
                }
            }
            stmts.retain(|s| !matches!(s, Stmt::Loop(l) if l.body.is_empty()));
        }
        for stmts in &mut self.exprs {
            prune(stmts);
        }
        self.exprs.retain(|stmts| !stmts.is_empty());
    }

    /// Applies `f` to every block, in nest order.
    pub(crate) fn for_each_block_mut(&mut self, mut f: impl FnMut(&mut Block)) {
        for stmts in &mut self.exprs {
            visit_blocks_mut(stmts, &mut f);
        }
    }

    /// Every block with its path and enclosing loops, restricted to the subtree at `root`.
    pub(crate) fn block_sites_within(&self, root: &StmtPath) -> Vec<BlockSite> {
        self.block_sites()
            .into_iter()
            .filter(|site| site.path.is_within(root))
            .collect()
    }

    /// Path of the top-level statement containing the statement at `path`.
    pub(crate) fn root_of(path: &StmtPath) -> StmtPath {
        StmtPath {
            expr: path.expr,
            steps: vec![path.steps[0]],
        }
    }

    /// Whether the statement at `path` is a chain of loops, each holding exactly one statement,
    /// that ends in a single block.
    pub(crate) fn is_exclusive_chain(&self, path: &StmtPath) -> bool {
        let mut stmt = self.stmt(path);
        loop {
            match stmt {
                Stmt::Block(_) => return true,
                Stmt::Loop(l) => match l.body.as_slice() {
                    [only] => stmt = only,
                    _ => return false,
                },
            }
        }
    }

    /// Builds a block that copies `src` into `dst` elementwise, in its own loop nest.
    pub(crate) fn copy_stmt(&mut self, name: &str, src: BufferId, dst: BufferId) -> Stmt {
        let shape = self.buffer(dst).shape.clone();
        let iters = shape
            .iter()
            .enumerate()
            .map(|(d, extent)| IterVar {
                var: self.new_var(format!("v_ax{d}"), extent.get()),
                kind: IterKind::Spatial,
            })
            .collect::<Vec<_>>();
        let loops = shape
            .iter()
            .enumerate()
            .map(|(d, extent)| self.new_var(format!("ax{d}"), extent.get()))
            .collect::<Vec<_>>();
        let indices = iters.iter().map(|iv| Expr::var(iv.var)).collect::<Vec<_>>();
        let block = Block {
            name: name.to_owned(),
            iters,
            values: loops.iter().map(|v| Expr::var(*v)).collect(),
            write: Access {
                buffer: dst,
                indices: indices.clone(),
            },
            reads: vec![Access {
                buffer: src,
                indices,
            }],
            predicates: vec![],
            op: Op::Copy,
            operands: Operand::reads(1),
        };
        nest_block(block, &loops)
    }

    pub(crate) fn display_expr<'a>(&'a self, expr: &'a Expr) -> impl fmt::Display + 'a {
        ExprDisplay { expr, nest: self }
    }

    /// A block's header and body on one line.
    pub fn display_block<'a>(&'a self, block: &'a Block) -> impl fmt::Display + 'a {
        BlockDisplay { block, nest: self }
    }
}

/// Wraps `block` in fresh serial loops over `loops`, outermost first.
pub(crate) fn nest_block(block: Block, loops: &[Var]) -> Stmt {
    loops.iter().rev().fold(Stmt::Block(block), |body, var| {
        Stmt::Loop(Loop {
            var: *var,
            annotation: Annotation::Serial,
            body: vec![body],
        })
    })
}

pub(crate) fn visit_blocks_mut(stmts: &mut [Stmt], f: &mut impl FnMut(&mut Block)) {
    for stmt in stmts {
        match stmt {
            Stmt::Loop(l) => visit_blocks_mut(&mut l.body, f),
            Stmt::Block(b) => f(b),
        }
    }
}

fn collect_sites(
    stmts: &[Stmt],
    expr: usize,
    steps: &mut Vec<usize>,
    loops: &mut Vec<Var>,
    out: &mut Vec<BlockSite>,
) {
    for (i, stmt) in stmts.iter().enumerate() {
        steps.push(i);
        match stmt {
            Stmt::Block(_) => out.push(BlockSite {
                path: StmtPath {
                    expr,
                    steps: steps.clone(),
                },
                loops: loops.clone(),
            }),
            Stmt::Loop(l) => {
                loops.push(l.var);
                collect_sites(&l.body, expr, steps, loops, out);
                loops.pop();
            }
        }
        steps.pop();
    }
}

struct ExprDisplay<'a> {
    expr: &'a Expr,
    nest: &'a LoopNest,
}

impl fmt::Display for ExprDisplay<'_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.expr
            .fmt_with(f, &|v, f| write!(f, "{}", self.nest.var_name(*v)))
    }
}

struct BlockDisplay<'a> {
    block: &'a Block,
    nest: &'a LoopNest,
}

impl fmt::Display for BlockDisplay<'_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.nest.fmt_block_header(f, self.block)?;
        write!(f, ": ")?;
        self.nest.fmt_block_body(f, self.block)
    }
}

impl LoopNest {
    fn fmt_access(&self, f: &mut fmt::Formatter<'_>, access: &Access) -> fmt::Result {
        write!(f, "{}[", self.buffer(access.buffer).name)?;
        for (i, index) in access.indices.iter().enumerate() {
            if i > 0 {
                write!(f, ", ")?;
            }
            write!(f, "{}", self.display_expr(index))?;
        }
        write!(f, "]")
    }

    fn fmt_block_header(&self, f: &mut fmt::Formatter<'_>, block: &Block) -> fmt::Result {
        write!(f, "block {}(", block.name)?;
        for (i, (iv, value)) in block.iters.iter().zip(&block.values).enumerate() {
            if i > 0 {
                write!(f, ", ")?;
            }
            if iv.kind == IterKind::Reduce {
                write!(f, "reduce ")?;
            }
            write!(f, "{}={}", self.var_name(iv.var), self.display_expr(value))?;
        }
        write!(f, ")")?;
        for (i, predicate) in block.predicates.iter().enumerate() {
            write!(f, "{}", if i == 0 { " if " } else { " && " })?;
            write!(f, "{} < {}", self.display_expr(&predicate.expr), predicate.bound)?;
        }
        Ok(())
    }

    fn fmt_block_body(&self, f: &mut fmt::Formatter<'_>, block: &Block) -> fmt::Result {
        self.fmt_access(f, &block.write)?;
        write!(f, " = ")?;
        self.fmt_application(f, block, &block.op, &block.operands)
    }

    fn fmt_application(
        &self,
        f: &mut fmt::Formatter<'_>,
        block: &Block,
        op: &Op,
        args: &[Operand],
    ) -> fmt::Result {
        write!(f, "{op}(")?;
        for (i, arg) in args.iter().enumerate() {
            if i > 0 {
                write!(f, ", ")?;
            }
            match arg {
                Operand::Read(r) => self.fmt_access(f, &block.reads[*r])?,
                Operand::Inlined { op, args, .. } => self.fmt_application(f, block, op, args)?,
            }
        }
        write!(f, ")")
    }

    fn fmt_stmts(&self, f: &mut fmt::Formatter<'_>, stmts: &[Stmt], depth: usize) -> fmt::Result {
        for stmt in stmts {
            match stmt {
                Stmt::Loop(l) => {
                    write!(f, "{}for {} in 0..{}", indent(depth), self.var_name(l.var), l.extent())?;
                    if l.annotation != Annotation::Serial {
                        write!(f, " [{}]", l.annotation)?;
                    }
                    writeln!(f)?;
                    self.fmt_stmts(f, &l.body, depth + 1)?;
                }
                Stmt::Block(b) => {
                    write!(f, "{}", indent(depth))?;
                    self.fmt_block_header(f, b)?;
                    writeln!(f)?;
                    write!(f, "{}", indent(depth + 1))?;
                    self.fmt_block_body(f, b)?;
                    writeln!(f)?;
                }
            }
        }
        Ok(())
    }
}

impl fmt::Display for LoopNest {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for (i, stmts) in self.exprs.iter().enumerate() {
            if self.exprs.len() > 1 {
                writeln!(f, "// expr {i}")?;
            }
            self.fmt_stmts(f, stmts, 0)?;
        }
        Ok(())
    }
}
