use crate::common::{Dtype, Shape};
use crate::ir::{
    nest_block, Access, Block, Buffer, BufferId, Expr, IterKind, IterVar, LoopNest, MemScope, Op,
    Operand, Predicate, Var,
};
use crate::scheduling::ScheduleError;

/// Constructs naive loop nests: every block gets its own perfect nest of serial loops, one per
/// iteration variable in declaration order.
pub struct NestBuilder {
    nest: LoopNest,
    open_expr: bool,
}

pub struct BlockBuilder<'a> {
    owner: &'a mut NestBuilder,
    name: String,
    iters: Vec<IterVar>,
    write: Option<Access>,
    reads: Vec<Access>,
    predicates: Vec<Predicate>,
    op: Op,
    bad_extent: Option<(String, u32)>,
}

impl NestBuilder {
    pub fn new() -> Self {
        NestBuilder {
            nest: LoopNest::empty(),
            open_expr: false,
        }
    }

    pub fn buffer(&mut self, name: &str, shape: Shape, dtype: Dtype) -> BufferId {
        self.nest.add_buffer(Buffer {
            name: name.to_owned(),
            shape,
            dtype,
            scope: MemScope::Global,
        })
    }

    /// Starts a new sub-expression; subsequent blocks go into it.
    pub fn begin_expr(&mut self) {
        self.nest.exprs.push(vec![]);
        self.open_expr = true;
    }

    pub fn block(&mut self, name: &str) -> BlockBuilder<'_> {
        BlockBuilder {
            owner: self,
            name: name.to_owned(),
            iters: vec![],
            write: None,
            reads: vec![],
            predicates: vec![],
            op: Op::Copy,
            bad_extent: None,
        }
    }

    pub fn finish(mut self) -> LoopNest {
        self.nest.exprs.retain(|stmts| !stmts.is_empty());
        self.nest
    }
}

impl Default for NestBuilder {
    fn default() -> Self {
        Self::new()
    }
}

impl<'a> BlockBuilder<'a> {
    pub fn spatial(&mut self, name: &str, extent: u32) -> Expr {
        self.iter_var(name, extent, IterKind::Spatial)
    }

    pub fn reduce(&mut self, name: &str, extent: u32) -> Expr {
        self.iter_var(name, extent, IterKind::Reduce)
    }

    fn iter_var(&mut self, name: &str, extent: u32, kind: IterKind) -> Expr {
        if extent == 0 || extent > i32::MAX as u32 {
            self.bad_extent.get_or_insert((name.to_owned(), extent));
        }
        let var = self.owner.nest.new_var(format!("v{name}"), extent.max(1));
        self.iters.push(IterVar { var, kind });
        Expr::var(var)
    }

    pub fn write(&mut self, buffer: BufferId, indices: Vec<Expr>) -> &mut Self {
        self.write = Some(Access { buffer, indices });
        self
    }

    pub fn read(&mut self, buffer: BufferId, indices: Vec<Expr>) -> &mut Self {
        self.reads.push(Access { buffer, indices });
        self
    }

    /// Guards the block so that it only executes where `expr < bound`. `expr` is over this
    /// block's iteration variables.
    pub fn predicate(&mut self, expr: Expr, bound: i32) -> &mut Self {
        self.predicates.push(Predicate { expr, bound });
        self
    }

    pub fn op(&mut self, op: Op) -> &mut Self {
        self.op = op;
        self
    }

    /// Wraps the block in fresh loops and appends it to the current sub-expression.
    pub fn build(self) -> Result<(), ScheduleError> {
        let BlockBuilder {
            owner,
            name,
            iters,
            write,
            reads,
            predicates,
            op,
            bad_extent,
        } = self;

        if let Some((var, extent)) = bad_extent {
            return Err(ScheduleError::InvalidShape(format!(
                "iteration variable {var} of block {name} has extent {extent}"
            )));
        }
        let write = write.ok_or_else(|| {
            ScheduleError::InvalidShape(format!("block {name} does not write a buffer"))
        })?;
        for access in std::iter::once(&write).chain(&reads) {
            let buffer = owner.nest.buffer(access.buffer);
            if buffer.shape.len() != access.indices.len() {
                return Err(ScheduleError::InvalidShape(format!(
                    "block {name} indexes {} (rank {}) with {} indices",
                    buffer.name,
                    buffer.shape.len(),
                    access.indices.len()
                )));
            }
        }

        let loop_vars = iters
            .iter()
            .map(|iv| {
                let loop_name = owner.nest.var_name(iv.var)[1..].to_owned();
                owner.nest.new_var(loop_name, iv.var.extent())
            })
            .collect::<Vec<Var>>();
        let to_loop_vars = |e: &Expr| {
            e.map_vars(&mut |v| match iters.iter().position(|iv| iv.var == *v) {
                Some(pos) => Expr::var(loop_vars[pos]),
                None => Expr::var(*v),
            })
        };
        let predicates = predicates
            .iter()
            .map(|p| Predicate {
                expr: to_loop_vars(&p.expr),
                bound: p.bound,
            })
            .collect();

        let block = Block {
            name,
            values: loop_vars.iter().map(|v| Expr::var(*v)).collect(),
            iters,
            write,
            operands: Operand::reads(reads.len()),
            reads,
            predicates,
            op,
        };
        let stmt = nest_block(block, &loop_vars);

        if !owner.open_expr {
            owner.begin_expr();
        }
        owner
            .nest
            .exprs
            .last_mut()
            .expect("an expression was just opened")
            .push(stmt);
        Ok(())
    }
}
