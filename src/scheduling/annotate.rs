use crate::ir::{
    Annotation, Block, BlockRef, DeviceAxis, IterKind, LoopNest, LoopRef, MemScope, Stmt, Var,
};
use crate::scheduling::{ScheduleError, MAX_UNROLL_EXTENT};

impl LoopNest {
    /// Binds a serial loop to a device execution axis.
    ///
    /// No loop enclosing `lp` or nested inside it may already be bound to `axis`.
    pub fn bind(&mut self, lp: &LoopRef, axis: DeviceAxis) -> Result<(), ScheduleError> {
        let path = self.loop_path(lp)?;
        let target = self.loop_at(&path);
        self.check_serial(target)?;
        let conflict = self
            .enclosing_loops(&path)
            .into_iter()
            .find(|l| l.annotation == Annotation::Bound(axis))
            .map(|l| l.var)
            .or_else(|| find_bound(&target.body, axis));
        if let Some(other) = conflict {
            return Err(ScheduleError::BindingConflict {
                var: self.var_name(lp.var()).to_owned(),
                axis,
                other: self.var_name(other).to_owned(),
            });
        }
        self.loop_at_mut(&path).annotation = Annotation::Bound(axis);
        log::trace!("bound {} to {axis}", self.var_name(lp.var()));
        Ok(())
    }

    /// Marks a serial loop for multi-core execution.
    ///
    /// No block beneath `lp` may bind a reduction variable to it; those iterations accumulate
    /// into the same output element.
    pub fn parallel(&mut self, lp: &LoopRef) -> Result<(), ScheduleError> {
        let path = self.loop_path(lp)?;
        if let Some(block) = find_reduction_over(&self.loop_at(&path).body, lp.var()) {
            return Err(ScheduleError::LoopCarriesReduction {
                var: self.var_name(lp.var()).to_owned(),
                block: block.name.clone(),
            });
        }
        self.annotate(lp, Annotation::Parallel)
    }

    /// Marks a serial loop for SIMD execution of `width` lanes.
    pub fn vectorize(&mut self, lp: &LoopRef, width: u32) -> Result<(), ScheduleError> {
        if width == 0 || lp.extent() % width != 0 {
            return Err(ScheduleError::NotDivisible {
                var: self.var_name(lp.var()).to_owned(),
                extent: lp.extent(),
                width,
            });
        }
        self.annotate(lp, Annotation::Vectorized(width))
    }

    /// Marks a serial loop to be fully unrolled by code generation.
    pub fn unroll(&mut self, lp: &LoopRef) -> Result<(), ScheduleError> {
        if lp.extent() > MAX_UNROLL_EXTENT {
            return Err(ScheduleError::UnrollTooLarge {
                var: self.var_name(lp.var()).to_owned(),
                extent: lp.extent(),
            });
        }
        self.annotate(lp, Annotation::Unrolled)
    }

    /// Moves the buffer `block` writes to another memory scope.
    pub fn set_buffer(&mut self, block: &BlockRef, scope: MemScope) -> Result<(), ScheduleError> {
        let buffer = self.block(block)?.write.buffer;
        self.buffer_mut(buffer).scope = scope;
        log::trace!("moved {} to {scope}", self.buffer(buffer).name);
        Ok(())
    }

    fn annotate(&mut self, lp: &LoopRef, annotation: Annotation) -> Result<(), ScheduleError> {
        let path = self.loop_path(lp)?;
        self.check_serial(self.loop_at(&path))?;
        self.loop_at_mut(&path).annotation = annotation;
        log::trace!("marked {} {annotation}", self.var_name(lp.var()));
        Ok(())
    }
}

fn find_reduction_over(stmts: &[Stmt], var: Var) -> Option<&Block> {
    stmts.iter().find_map(|stmt| match stmt {
        Stmt::Loop(l) => find_reduction_over(&l.body, var),
        Stmt::Block(b) => b
            .iters
            .iter()
            .zip(&b.values)
            .any(|(iv, value)| iv.kind == IterKind::Reduce && value.contains_var(&var))
            .then_some(b),
    })
}

fn find_bound(stmts: &[Stmt], axis: DeviceAxis) -> Option<Var> {
    stmts.iter().find_map(|stmt| match stmt {
        Stmt::Loop(l) if l.annotation == Annotation::Bound(axis) => Some(l.var),
        Stmt::Loop(l) => find_bound(&l.body, axis),
        Stmt::Block(_) => None,
    })
}
