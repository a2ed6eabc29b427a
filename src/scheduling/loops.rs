use crate::ir::{
    visit_blocks_mut, Annotation, BlockRef, Expr, Loop, LoopNest, LoopRef, Predicate, Stmt, Var,
};
use crate::scheduling::ScheduleError;

use itertools::Itertools;

impl LoopNest {
    /// Collapses a chain of perfectly nested serial loops into one loop.
    ///
    /// Blocks recover each original variable from the fused one by floor-division and
    /// remainder. Invalidates all handles.
    pub fn fuse(&mut self, loops: &[LoopRef]) -> Result<LoopRef, ScheduleError> {
        let Some((first, rest)) = loops.split_first() else {
            return Err(ScheduleError::NotAChain("no loops to fuse".to_owned()));
        };
        let path = self.loop_path(first)?;
        for lp in rest {
            self.loop_path(lp)?;
        }
        if rest.is_empty() {
            return Ok(*first);
        }

        let mut current = self.loop_at(&path);
        self.check_serial(current)?;
        for lp in rest {
            match current.body.as_slice() {
                [Stmt::Loop(inner)] if inner.var == lp.var() => {
                    self.check_serial(inner)?;
                    current = inner;
                }
                _ => {
                    return Err(ScheduleError::NotAChain(format!(
                        "{} is not the only statement in {}",
                        self.var_name(lp.var()),
                        self.var_name(current.var)
                    )))
                }
            }
        }

        let vars = loops.iter().map(|lp| lp.var()).collect::<Vec<_>>();
        let total = vars.iter().map(|v| u64::from(v.extent())).product::<u64>();
        if total > i32::MAX as u64 {
            return Err(ScheduleError::InvalidShape(format!(
                "fused extent {total} overflows"
            )));
        }
        let name = format!(
            "{}_fused",
            vars.iter().map(|v| self.var_name(*v)).join("_")
        );
        let fused = self.new_var(name, total as u32);

        let mut body = take_chain_body(self.remove_stmt(&path), vars.len());
        let mut inner_product = 1i32;
        let mut replacements = Vec::with_capacity(vars.len());
        for v in vars.iter().rev() {
            let replacement = Expr::var(fused)
                .floor_div(inner_product)
                .modulo(v.extent() as i32);
            replacements.push((*v, replacement));
            inner_product *= v.extent() as i32;
        }
        visit_blocks_mut(&mut body, &mut |b| {
            for (v, replacement) in &replacements {
                b.substitute_loop_var(v, replacement);
            }
        });

        self.body_mut(path.expr, path.parent_steps()).insert(
            path.last(),
            Stmt::Loop(Loop {
                var: fused,
                annotation: Annotation::Serial,
                body,
            }),
        );
        self.invalidate_handles();
        log::trace!("fused {} loops into extent {}", vars.len(), total);
        Ok(self.loop_ref(fused))
    }

    /// Fuses the loops of `block` at the given positions.
    pub fn fuse_block(
        &mut self,
        block: &BlockRef,
        loop_indices: &[usize],
    ) -> Result<LoopRef, ScheduleError> {
        let loops = self.select_loops(block, loop_indices)?;
        self.fuse(&loops)
    }

    /// Replaces a serial loop with nested loops of the given extents, outermost first.
    ///
    /// At most one factor may be `-1`; it is inferred as the ceiling of the remaining extent.
    /// Without a `-1`, the factors must multiply to the loop's extent. When the resulting
    /// extents overshoot, every block inside is guarded by a predicate. Invalidates all handles.
    pub fn split(&mut self, lp: &LoopRef, factors: &[i32]) -> Result<Vec<LoopRef>, ScheduleError> {
        let path = self.loop_path(lp)?;
        let extent = lp.extent();
        let invalid = || ScheduleError::InvalidSplitFactors {
            factors: factors.to_vec(),
            extent,
        };
        if factors.is_empty()
            || factors.iter().any(|&f| f == 0 || f < -1)
            || factors.iter().filter(|&&f| f == -1).count() > 1
        {
            return Err(invalid());
        }
        let known = factors
            .iter()
            .filter(|&&f| f > 0)
            .map(|&f| u64::from(f as u32))
            .product::<u64>();
        let resolved = if factors.contains(&-1) {
            let inferred = divrem::DivCeil::div_ceil(u64::from(extent), known).max(1);
            factors
                .iter()
                .map(|&f| if f == -1 { inferred } else { u64::from(f as u32) })
                .collect::<Vec<_>>()
        } else {
            if known != u64::from(extent) {
                return Err(invalid());
            }
            factors.iter().map(|&f| u64::from(f as u32)).collect()
        };
        let product = resolved.iter().product::<u64>();
        if product > i32::MAX as u64 {
            return Err(invalid());
        }
        self.check_serial(self.loop_at(&path))?;

        let base_name = self.var_name(lp.var()).to_owned();
        let new_vars = resolved
            .iter()
            .enumerate()
            .map(|(i, &e)| self.new_var(format!("{base_name}_{i}"), e as u32))
            .collect::<Vec<Var>>();
        let mut replacement = Expr::zero();
        let mut stride = 1i32;
        for v in new_vars.iter().rev() {
            replacement += Expr::var(*v) * stride;
            stride *= v.extent() as i32;
        }

        let mut body = take_chain_body(self.remove_stmt(&path), 1);
        let guard = product > u64::from(extent);
        visit_blocks_mut(&mut body, &mut |b| {
            b.substitute_loop_var(&lp.var(), &replacement);
            if guard {
                b.predicates.push(Predicate {
                    expr: replacement.clone(),
                    bound: extent as i32,
                });
            }
        });
        let stmt = new_vars.iter().rev().fold(body, |body, var| {
            vec![Stmt::Loop(Loop {
                var: *var,
                annotation: Annotation::Serial,
                body,
            })]
        });
        let stmt = stmt.into_iter().next().expect("split produces at least one loop");
        self.body_mut(path.expr, path.parent_steps())
            .insert(path.last(), stmt);
        self.invalidate_handles();
        log::trace!("split {base_name} ({extent}) by {resolved:?}");
        Ok(new_vars.into_iter().map(|v| self.loop_ref(v)).collect())
    }

    /// Permutes the listed loops among the positions they occupy on one perfectly nested chain.
    ///
    /// Loops on the chain that are not listed keep their positions. The loop set is unchanged,
    /// so handles remain valid.
    pub fn reorder(&mut self, loops: &[LoopRef]) -> Result<(), ScheduleError> {
        if loops.len() < 2 {
            for lp in loops {
                self.loop_path(lp)?;
            }
            return Ok(());
        }
        if !loops.iter().map(|lp| lp.var()).all_unique() {
            return Err(ScheduleError::NotAChain("a loop is listed twice".to_owned()));
        }
        let mut located = loops
            .iter()
            .map(|lp| Ok((self.loop_path(lp)?, lp.var())))
            .collect::<Result<Vec<_>, ScheduleError>>()?;
        located.sort_by_key(|(path, _)| path.steps.len());
        for pair in located.windows(2) {
            if !pair[1].0.is_within(&pair[0].0) {
                return Err(ScheduleError::NotAChain(format!(
                    "{} is not nested inside {}",
                    self.var_name(pair[1].1),
                    self.var_name(pair[0].1)
                )));
            }
        }
        let top = located[0].0.clone();
        let bottom = located[located.len() - 1].1;

        let mut chain = vec![];
        let mut current = self.loop_at(&top);
        loop {
            chain.push(current.var);
            if current.var == bottom {
                break;
            }
            match current.body.as_slice() {
                [Stmt::Loop(inner)] => current = inner,
                _ => {
                    return Err(ScheduleError::NotAChain(format!(
                        "{} is not perfectly nested",
                        self.var_name(current.var)
                    )))
                }
            }
        }

        let headers = loops
            .iter()
            .map(|lp| {
                let path = self.find_loop(lp.var()).expect("loop was just located");
                (lp.var(), self.loop_at(&path).annotation)
            })
            .collect::<Vec<_>>();
        let listed = loops.iter().map(|lp| lp.var()).collect::<Vec<_>>();
        let mut next_header = headers.into_iter();
        let mut current = self.loop_at_mut(&top);
        for (depth, var) in chain.iter().enumerate() {
            if listed.contains(var) {
                let (new_var, annotation) = next_header.next().expect("one header per listed loop");
                current.var = new_var;
                current.annotation = annotation;
            }
            if depth + 1 == chain.len() {
                break;
            }
            current = match current.body.first_mut() {
                Some(Stmt::Loop(inner)) => inner,
                _ => unreachable!("chain was checked to be perfectly nested"),
            };
        }
        log::trace!("reordered {} loops", loops.len());
        Ok(())
    }

    /// Reorders the loops of `block` at the given positions.
    pub fn reorder_block(
        &mut self,
        block: &BlockRef,
        loop_indices: &[usize],
    ) -> Result<(), ScheduleError> {
        let loops = self.select_loops(block, loop_indices)?;
        self.reorder(&loops)
    }

    fn select_loops(
        &self,
        block: &BlockRef,
        loop_indices: &[usize],
    ) -> Result<Vec<LoopRef>, ScheduleError> {
        let all = self.get_loops(block)?;
        loop_indices
            .iter()
            .map(|&index| {
                all.get(index)
                    .copied()
                    .ok_or(ScheduleError::LoopIndexOutOfRange {
                        index,
                        count: all.len(),
                    })
            })
            .collect()
    }

    pub(crate) fn check_serial(&self, lp: &Loop) -> Result<(), ScheduleError> {
        if lp.annotation != Annotation::Serial {
            return Err(ScheduleError::AnnotationConflict {
                var: self.var_name(lp.var).to_owned(),
                existing: lp.annotation,
            });
        }
        Ok(())
    }
}

/// Strips `depth` perfectly nested loop headers from `stmt` and returns the innermost body.
pub(crate) fn take_chain_body(stmt: Stmt, depth: usize) -> Vec<Stmt> {
    let mut body = vec![stmt];
    for _ in 0..depth {
        body = match body.pop() {
            Some(Stmt::Loop(l)) => l.body,
            _ => unreachable!("chain was checked to be perfectly nested"),
        };
    }
    body
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::common::Dtype;
    use crate::ir::{NestBuilder, Op};
    use proptest::prelude::*;

    fn copy_nest(extents: &[u32]) -> LoopNest {
        let mut b = NestBuilder::new();
        let shape = extents.iter().map(|&e| e.try_into().unwrap()).collect::<Vec<_>>();
        let src = b.buffer("A", shape.clone(), Dtype::Float32);
        let dst = b.buffer("B", shape, Dtype::Float32);
        let mut blk = b.block("B");
        let idx = extents
            .iter()
            .enumerate()
            .map(|(i, &e)| blk.spatial(&format!("i{i}"), e))
            .collect::<Vec<_>>();
        blk.write(dst, idx.clone()).read(src, idx).op(Op::Copy);
        blk.build().unwrap();
        b.finish()
    }

    fn extents(nest: &LoopNest) -> Vec<u32> {
        let blocks = nest.get_all_blocks();
        nest.get_loops(&blocks[0])
            .unwrap()
            .iter()
            .map(|l| l.extent())
            .collect()
    }

    #[test]
    fn test_fuse_then_split_restores_extents() {
        let mut nest = copy_nest(&[3, 4, 5]);
        let before = nest.instance_set("B");
        let blocks = nest.get_all_blocks();
        let fused = nest.fuse_block(&blocks[0], &[0, 1]).unwrap();
        assert_eq!(fused.extent(), 12);
        assert_eq!(extents(&nest), vec![12, 5]);
        nest.split(&fused, &[3, 4]).unwrap();
        assert_eq!(extents(&nest), vec![3, 4, 5]);
        assert_eq!(nest.instance_set("B"), before);
    }

    #[test]
    fn test_fuse_invalidates_handles() {
        let mut nest = copy_nest(&[2, 2]);
        let blocks = nest.get_all_blocks();
        let loops = nest.get_loops(&blocks[0]).unwrap();
        nest.fuse(&loops).unwrap();
        assert!(matches!(
            nest.get_loops(&blocks[0]),
            Err(ScheduleError::StaleHandle { .. })
        ));
    }

    #[test]
    fn test_fuse_rejects_non_chain() {
        let mut nest = copy_nest(&[2, 3, 4]);
        let blocks = nest.get_all_blocks();
        let loops = nest.get_loops(&blocks[0]).unwrap();
        assert!(matches!(
            nest.fuse(&[loops[0], loops[2]]),
            Err(ScheduleError::NotAChain(_))
        ));
    }

    #[test]
    fn test_split_infers_ceiling_and_guards() {
        let mut nest = copy_nest(&[10]);
        let blocks = nest.get_all_blocks();
        let loops = nest.get_loops(&blocks[0]).unwrap();
        let parts = nest.split(&loops[0], &[-1, 4]).unwrap();
        assert_eq!(parts.iter().map(|l| l.extent()).collect::<Vec<_>>(), vec![3, 4]);
        assert!(matches!(
            nest.get_loops(&blocks[0]),
            Err(ScheduleError::StaleHandle { .. })
        ));
        assert!(matches!(
            nest.loop_info(&loops[0]),
            Err(ScheduleError::StaleHandle { .. })
        ));
        let blocks = nest.get_all_blocks();
        assert_eq!(nest.block(&blocks[0]).unwrap().predicates().len(), 1);
        assert_eq!(nest.instance_set("B").len(), 10);
    }

    #[test]
    fn test_split_rejects_malformed_factors() {
        for factors in [&[][..], &[0, 4], &[-1, -1], &[-2, 5], &[3, 3]] {
            let mut nest = copy_nest(&[10]);
            let blocks = nest.get_all_blocks();
            let loops = nest.get_loops(&blocks[0]).unwrap();
            assert!(
                matches!(
                    nest.split(&loops[0], factors),
                    Err(ScheduleError::InvalidSplitFactors { .. })
                ),
                "factors {factors:?} should be rejected"
            );
        }
    }

    #[test]
    fn test_reorder_keeps_handles_and_instances() {
        let mut nest = copy_nest(&[2, 3, 4]);
        let before = nest.instance_set("B");
        let blocks = nest.get_all_blocks();
        let loops = nest.get_loops(&blocks[0]).unwrap();
        nest.reorder(&[loops[2], loops[0]]).unwrap();
        assert_eq!(extents(&nest), vec![4, 3, 2]);
        assert!(nest.loop_info(&loops[1]).is_ok());
        assert_eq!(nest.instance_set("B"), before);
    }

    #[test]
    fn test_reorder_block_moves_axis_innermost() {
        let mut nest = copy_nest(&[2, 3, 4]);
        let blocks = nest.get_all_blocks();
        nest.reorder_block(&blocks[0], &[0, 2, 1]).unwrap();
        assert_eq!(extents(&nest), vec![2, 4, 3]);
        assert!(matches!(
            nest.reorder_block(&blocks[0], &[0, 7]),
            Err(ScheduleError::LoopIndexOutOfRange { index: 7, count: 3 })
        ));
    }

    #[test]
    fn test_split_of_parallel_loop_is_rejected() {
        let mut nest = copy_nest(&[8]);
        let blocks = nest.get_all_blocks();
        let loops = nest.get_loops(&blocks[0]).unwrap();
        nest.parallel(&loops[0]).unwrap();
        assert!(matches!(
            nest.split(&loops[0], &[2, 4]),
            Err(ScheduleError::AnnotationConflict { .. })
        ));
    }

    #[test]
    fn test_fused_index_simplifies_back() {
        let mut nest = copy_nest(&[3, 4]);
        let blocks = nest.get_all_blocks();
        let fused = nest.fuse_block(&blocks[0], &[0, 1]).unwrap();
        let parts = nest.split(&fused, &[3, 4]).unwrap();
        let blocks = nest.get_all_blocks();
        let block = nest.block(&blocks[0]).unwrap();
        assert_eq!(block.values()[0], Expr::var(parts[0].var()));
        assert_eq!(block.values()[1], Expr::var(parts[1].var()));
    }

    proptest! {
        #[test]
        fn test_fuse_split_preserves_instances(
            dims in prop::collection::vec(1u32..5, 2..4),
            inner in 1i32..6,
        ) {
            let mut nest = copy_nest(&dims);
            let before = nest.instance_set("B");
            let blocks = nest.get_all_blocks();
            let all = (0..dims.len()).collect::<Vec<_>>();
            let fused = nest.fuse_block(&blocks[0], &all).unwrap();
            nest.split(&fused, &[-1, inner]).unwrap();
            prop_assert_eq!(nest.instance_set("B"), before);
        }
    }
}
